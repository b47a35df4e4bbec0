//! Lexical scanner
//!
//! Hand-written lexer producing one token per call. Identifiers and keywords
//! are lower-cased (keywords are case-insensitive); string literal bodies keep
//! their case. Three comment forms are skipped: `{ ... }`, `(* ... *)` and
//! `// ...`. Lexical errors are fatal and carry the 1-based line/column of the
//! offending character (for unterminated strings and comments, of the opening
//! delimiter).

use crate::error::{CompileError, Result};
use crate::token::{Token, TokenKind, keyword_kind};

pub struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    current: Token,
}

impl Scanner {
    pub fn new(source: &str) -> Self {
        Scanner {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            // Placeholder until the first next(); the parser primes the
            // scanner before looking at it.
            current: Token::new(TokenKind::Eof, "", 0, 0),
        }
    }

    /// The most recently scanned token.
    pub fn current(&self) -> &Token {
        &self.current
    }

    pub fn kind(&self) -> TokenKind {
        self.current.kind
    }

    pub fn at(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Check that the current token is `kind`, then advance past it.
    pub fn require(&mut self, kind: TokenKind, text: &str) -> Result<()> {
        if self.current.kind != kind {
            return Err(CompileError::expected(
                &Token::expected(kind, text),
                &self.current,
            ));
        }
        self.next()?;
        Ok(())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    /// Skip whitespace and all three comment forms. Unterminated block
    /// comments are fatal.
    fn skip_trivia(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('{') => {
                    let (line, col) = (self.line, self.col);
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('}') => break,
                            Some(_) => {}
                            None => {
                                return Err(CompileError::lexical(
                                    line,
                                    col,
                                    "found unclosed comment",
                                    "{",
                                ));
                            }
                        }
                    }
                }
                Some('(') if self.peek_at(1) == Some('*') => {
                    let (line, col) = (self.line, self.col);
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some(')') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(CompileError::lexical(
                                    line,
                                    col,
                                    "found unclosed comment",
                                    "(*",
                                ));
                            }
                        }
                    }
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Scan the next token and make it current.
    pub fn next(&mut self) -> Result<&Token> {
        self.skip_trivia()?;
        let (line, col) = (self.line, self.col);

        let Some(c) = self.peek() else {
            self.current = Token::new(TokenKind::Eof, "", line, col);
            return Ok(&self.current);
        };

        let token = if c.is_ascii_alphabetic() {
            self.scan_word(line, col)
        } else if c.is_ascii_digit() {
            self.scan_number(line, col)?
        } else if c == '\'' || c == '"' {
            self.scan_string(line, col)?
        } else {
            self.scan_operator(line, col)?
        };
        self.current = token;
        Ok(&self.current)
    }

    fn scan_word(&mut self, line: usize, col: usize) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                text.push(c.to_ascii_lowercase());
                self.bump();
            } else {
                break;
            }
        }
        let kind = keyword_kind(&text).unwrap_or(TokenKind::Ident);
        Token::new(kind, text, line, col)
    }

    fn scan_number(&mut self, line: usize, col: usize) -> Result<Token> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.peek() != Some('.') {
            return Ok(Token::new(TokenKind::IntNum, text, line, col));
        }
        // `1..5` is integer, dot, dot, integer; `1.x` is a lexical error.
        match self.peek_at(1) {
            Some('.') => return Ok(Token::new(TokenKind::IntNum, text, line, col)),
            Some(c) if c.is_ascii_digit() => {}
            _ => {
                return Err(CompileError::lexical(
                    line,
                    col,
                    "Dot after int number",
                    &text,
                ));
            }
        }
        text.push('.');
        self.bump();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        // The exponent marker only belongs to the number when a digit
        // (after an optional sign) follows it.
        if matches!(self.peek(), Some('e') | Some('E')) {
            let signed = matches!(self.peek_at(1), Some('+') | Some('-'));
            let digit_at = if signed { 2 } else { 1 };
            if self
                .peek_at(digit_at)
                .is_some_and(|c| c.is_ascii_digit())
            {
                let marker_len = if signed { 2 } else { 1 };
                for _ in 0..marker_len {
                    if let Some(c) = self.bump() {
                        text.push(c);
                    }
                }
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        Ok(Token::new(TokenKind::DoubleNum, text, line, col))
    }

    fn scan_string(&mut self, line: usize, col: usize) -> Result<Token> {
        let quote = self.bump().expect("caller saw the opening quote");
        let mut text = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => break,
                Some(c) => text.push(c),
                None => {
                    return Err(CompileError::lexical(
                        line,
                        col,
                        "Found unclosed quotation",
                        &quote.to_string(),
                    ));
                }
            }
        }
        Ok(Token::new(TokenKind::StringLit, text, line, col))
    }

    fn scan_operator(&mut self, line: usize, col: usize) -> Result<Token> {
        use TokenKind::*;
        let c = self.bump().expect("caller saw a character");
        let (kind, text): (TokenKind, String) = match c {
            '<' => match self.peek() {
                Some('=') => {
                    self.bump();
                    (LessEqual, "<=".into())
                }
                Some('>') => {
                    self.bump();
                    (NotEqual, "<>".into())
                }
                _ => (Less, "<".into()),
            },
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    (GreaterEqual, ">=".into())
                } else {
                    (Greater, ">".into())
                }
            }
            ':' => {
                if self.peek() == Some('=') {
                    self.bump();
                    (Assign, ":=".into())
                } else {
                    (Colon, ":".into())
                }
            }
            '=' => (Equal, "=".into()),
            '+' => (Plus, "+".into()),
            '-' => (Minus, "-".into()),
            '*' => (Star, "*".into()),
            '/' => (Slash, "/".into()),
            '[' => (LeftSquare, "[".into()),
            ']' => (RightSquare, "]".into()),
            '(' => (LeftRound, "(".into()),
            ')' => (RightRound, ")".into()),
            ';' => (Semicolon, ";".into()),
            '.' => (Dot, ".".into()),
            ',' => (Comma, ",".into()),
            other => {
                return Err(CompileError::lexical(
                    line,
                    col,
                    "Undefined symbol",
                    &other.to_string(),
                ));
            }
        };
        Ok(Token::new(kind, text, line, col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tokens(source: &str) -> Vec<Token> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let tok = scanner.next().unwrap().clone();
            if tok.kind == TokenKind::Eof {
                break;
            }
            out.push(tok);
        }
        out
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        all_tokens(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let toks = all_tokens("BEGIN End wHiLe");
        assert_eq!(
            toks.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![TokenKind::Begin, TokenKind::End, TokenKind::While]
        );
        assert_eq!(toks[0].text, "begin");
    }

    #[test]
    fn test_positions_are_one_based() {
        let toks = all_tokens("a := 1;\n  b := 2");
        assert_eq!((toks[0].line, toks[0].col), (1, 1));
        assert_eq!((toks[1].line, toks[1].col), (1, 3));
        assert_eq!((toks[4].line, toks[4].col), (2, 3));
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("< <= <> > >= = := : ; . ,"),
            vec![
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::NotEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Equal,
                TokenKind::Assign,
                TokenKind::Colon,
                TokenKind::Semicolon,
                TokenKind::Dot,
                TokenKind::Comma,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let toks = all_tokens("12 3.5 1.25e3 2.5e-2 7.0E+1");
        assert_eq!(toks[0].kind, TokenKind::IntNum);
        for tok in &toks[1..] {
            assert_eq!(tok.kind, TokenKind::DoubleNum);
        }
        assert_eq!(toks[2].text, "1.25e3");
        assert_eq!(toks[3].text, "2.5e-2");
    }

    #[test]
    fn test_range_lexes_as_int_dot_dot_int() {
        assert_eq!(
            kinds("1..5"),
            vec![
                TokenKind::IntNum,
                TokenKind::Dot,
                TokenKind::Dot,
                TokenKind::IntNum
            ]
        );
    }

    #[test]
    fn test_exponent_needs_digit() {
        // `1.5e` is the double 1.5 followed by the identifier `e`.
        assert_eq!(kinds("1.5e"), vec![TokenKind::DoubleNum, TokenKind::Ident]);
    }

    #[test]
    fn test_dot_after_int_is_fatal() {
        let mut scanner = Scanner::new("1.x");
        let err = scanner.next().unwrap_err();
        assert!(err.message.contains("Dot after int number"));
    }

    #[test]
    fn test_strings_keep_case_and_quotes_must_match() {
        let toks = all_tokens("'Hello, World!' \"other\"");
        assert_eq!(toks[0].kind, TokenKind::StringLit);
        assert_eq!(toks[0].text, "Hello, World!");
        assert_eq!(toks[1].text, "other");
    }

    #[test]
    fn test_unterminated_string_is_fatal() {
        let mut scanner = Scanner::new("  'abc");
        let err = scanner.next().unwrap_err();
        assert_eq!((err.line, err.col), (1, Some(3)));
        assert!(err.message.contains("unclosed quotation"));
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            kinds("a { comment } b (* another\n one *) c // line\nd"),
            vec![
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Ident
            ]
        );
    }

    #[test]
    fn test_unclosed_comment_is_fatal() {
        let mut scanner = Scanner::new("a (* never closed");
        scanner.next().unwrap();
        let err = scanner.next().unwrap_err();
        assert!(err.message.contains("unclosed comment"));
        assert_eq!((err.line, err.col), (1, Some(3)));
    }

    #[test]
    fn test_comment_newlines_advance_lines() {
        let toks = all_tokens("{ one\n two }\nx");
        assert_eq!(toks[0].line, 3);
    }

    #[test]
    fn test_undefined_symbol() {
        let mut scanner = Scanner::new("@");
        let err = scanner.next().unwrap_err();
        assert!(err.message.contains("Undefined symbol"));
    }

    #[test]
    fn test_paren_is_not_a_comment() {
        assert_eq!(
            kinds("(a)"),
            vec![TokenKind::LeftRound, TokenKind::Ident, TokenKind::RightRound]
        );
    }
}
