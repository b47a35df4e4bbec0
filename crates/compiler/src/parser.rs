//! Recursive-descent parser and type checker
//!
//! Single pass with one-token lookahead: declarations, statements and
//! expressions are parsed, type-checked and constant-folded in one traversal,
//! building the AST and the symbol-table hierarchy as it goes.
//!
//! Scoping is deliberately flat: inside a procedure body names resolve
//! against the local table first and the global table second; tables carry no
//! parent pointer.
//!
//! Constant folding is eager. `make_node` folds two constant operands on the
//! spot (unless a parenthesized subexpression pins the shape), and folds a
//! constant right operand into the constant right child of the node built so
//! far, which keeps left-to-right chains of literals collapsing as they are
//! parsed. Double literals live in the global table as `dc_N` constants, so
//! folding that consumes one retracts it again.

use crate::ast::{Expr, Stmt};
use crate::error::{CompileError, Result};
use crate::scanner::Scanner;
use crate::symbol::{SymTable, Symbol, SymbolId, SymbolKind, Symbols, Ty, TypeId};
use crate::token::{Token, TokenKind};

/// Output of a successful parse: the main statement plus the symbol world it
/// references.
#[derive(Debug)]
pub struct Program {
    pub arena: Symbols,
    pub global: SymTable,
    pub main: Stmt,
}

impl Program {
    /// The `-p` dump: parse tree first, then the symbol tables.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        crate::ast::dump_stmt(&self.main, &mut out, 0);
        out.push('\n');
        crate::symbol::dump_table(&self.arena, &self.global, &mut out, 0);
        out
    }
}

pub struct Parser {
    scanner: Scanner,
    arena: Symbols,
    global: SymTable,
    double_count: usize,
    string_count: usize,
}

impl Parser {
    pub fn new(source: &str) -> Self {
        let mut arena = Symbols::new();
        let mut global = SymTable::new();
        let int = arena.int_type;
        let dbl = arena.double_type;
        let int_sym = arena.add_symbol(Symbol {
            name: "integer".into(),
            used: false,
            kind: SymbolKind::TypeAlias { ty: int },
        });
        let dbl_sym = arena.add_symbol(Symbol {
            name: "double".into(),
            used: false,
            kind: SymbolKind::TypeAlias { ty: dbl },
        });
        global.insert("integer", int_sym);
        global.insert("double", dbl_sym);
        Parser {
            scanner: Scanner::new(source),
            arena,
            global,
            double_count: 0,
            string_count: 0,
        }
    }

    pub fn parse(mut self) -> Result<Program> {
        self.scanner.next()?;
        self.parse_declarations()?;
        let main = self.parse_block(None)?;
        self.scanner.require(TokenKind::Dot, ".")?;
        Ok(Program {
            arena: self.arena,
            global: self.global,
            main,
        })
    }

    // ------------------------------------------------------------------
    // Lookup helpers
    // ------------------------------------------------------------------

    fn lookup(&self, local: Option<&SymTable>, name: &str) -> Option<SymbolId> {
        local
            .and_then(|t| t.lookup(name))
            .or_else(|| self.global.lookup(name))
    }

    fn expect_ident(&mut self) -> Result<Token> {
        let tok = self.scanner.current().clone();
        if tok.kind != TokenKind::Ident || tok.is_keyword() {
            return Err(CompileError::expected(
                &Token::expected(TokenKind::Ident, "identifier"),
                &tok,
            ));
        }
        self.scanner.next()?;
        Ok(tok)
    }

    // ------------------------------------------------------------------
    // Types and compatibility
    // ------------------------------------------------------------------

    fn type_name_or_void(&self, ty: Option<TypeId>) -> String {
        match ty {
            Some(t) => self.arena.type_name(t),
            None => "void".to_string(),
        }
    }

    /// Check that a value of `t2` may appear where `t1` is expected.
    /// `arithmetic` additionally allows an integer on the `t1` side of a
    /// double (the integer operand is widened during generation).
    fn check_types(
        &self,
        t1: Option<TypeId>,
        t2: Option<TypeId>,
        line: usize,
        arithmetic: bool,
    ) -> Result<()> {
        let compatible = match (t1, t2) {
            (Some(t1), Some(t2)) => {
                let a = &self.arena;
                (a.is_int(t1) && a.is_int(t2))
                    || (a.is_double(t1) && a.is_double(t2))
                    || (a.is_double(t1) && a.is_int(t2))
                    || (arithmetic && a.is_int(t1) && a.is_double(t2))
                    || match (a.ty(t1), a.ty(t2)) {
                        (Ty::Array { .. }, Ty::Array { .. })
                        | (Ty::Record { .. }, Ty::Record { .. }) => t1 == t2,
                        _ => false,
                    }
            }
            _ => false,
        };
        if compatible {
            Ok(())
        } else {
            Err(CompileError::type_conversion(
                line,
                &self.type_name_or_void(t1),
                &self.type_name_or_void(t2),
            ))
        }
    }

    fn check_exprs(&self, e1: &Expr, e2: &Expr, line: usize, arithmetic: bool) -> Result<()> {
        self.check_types(e1.ty(&self.arena), e2.ty(&self.arena), line, arithmetic)
    }

    /// Result type of a binary node: the right operand's type if it is
    /// double, else the left's.
    fn choose_type(&self, right: &Expr, left: &Expr) -> Option<TypeId> {
        match right.ty(&self.arena) {
            Some(t) if self.arena.is_double(t) => Some(t),
            _ => left.ty(&self.arena),
        }
    }

    fn int_only_error(&self, op: &Token) -> CompileError {
        CompileError::new(
            op.line,
            format!("{} operation can be used with int type only", op.text),
        )
    }

    // ------------------------------------------------------------------
    // Declarations
    // ------------------------------------------------------------------

    fn parse_declarations(&mut self) -> Result<()> {
        loop {
            match self.scanner.kind() {
                TokenKind::Begin => return Ok(()),
                TokenKind::Type => {
                    self.scanner.next()?;
                    self.parse_type_declaration()?;
                }
                TokenKind::Var => {
                    self.scanner.next()?;
                    self.parse_global_vars()?;
                }
                TokenKind::Procedure => {
                    self.scanner.next()?;
                    self.parse_proc_decl(false)?;
                }
                TokenKind::Function => {
                    self.scanner.next()?;
                    self.parse_proc_decl(true)?;
                }
                _ => {
                    return Err(CompileError::expected(
                        &Token::expected(TokenKind::Begin, "begin"),
                        self.scanner.current(),
                    ));
                }
            }
        }
    }

    fn parse_type_declaration(&mut self) -> Result<()> {
        while self.scanner.at(TokenKind::Ident) && !self.scanner.current().is_keyword() {
            let name = self.scanner.current().clone();
            if self.global.contains(&name.text) {
                return Err(CompileError::semantic(&name, "Duplicate identifier:"));
            }
            self.scanner.next()?;
            self.scanner.require(TokenKind::Equal, "=")?;
            let ty = self.parse_type()?;
            let id = self.arena.add_symbol(Symbol {
                name: name.text.clone(),
                used: false,
                kind: SymbolKind::TypeAlias { ty },
            });
            self.global.insert(&name.text, id);
            self.scanner.require(TokenKind::Semicolon, ";")?;
        }
        Ok(())
    }

    /// One `names : type ;` group of a var section or record body.
    fn parse_var_group(&mut self) -> Result<(Vec<Token>, TypeId)> {
        let mut names = vec![self.expect_ident()?];
        while self.scanner.at(TokenKind::Comma) {
            self.scanner.next()?;
            names.push(self.expect_ident()?);
        }
        self.scanner.require(TokenKind::Colon, ":")?;
        let ty = self.parse_type()?;
        Ok((names, ty))
    }

    fn parse_global_vars(&mut self) -> Result<()> {
        while self.scanner.at(TokenKind::Ident) && !self.scanner.current().is_keyword() {
            let (names, ty) = self.parse_var_group()?;
            for tok in names {
                if self.global.contains(&tok.text) {
                    return Err(CompileError::semantic(&tok, "Duplicate identifier:"));
                }
                let id = self.arena.add_symbol(Symbol {
                    name: tok.text.clone(),
                    used: false,
                    kind: SymbolKind::Var {
                        ty,
                        offset: 0,
                        global: true,
                        by_ref: false,
                    },
                });
                self.global.insert(&tok.text, id);
            }
            self.scanner.require(TokenKind::Semicolon, ";")?;
        }
        Ok(())
    }

    /// Local variables of a procedure body. Offsets grow downward from the
    /// frame base; the returned size feeds the prologue's `sub esp, n`.
    fn parse_local_vars(&mut self, table: &mut SymTable) -> Result<usize> {
        let mut size = 0usize;
        while self.scanner.at(TokenKind::Ident) && !self.scanner.current().is_keyword() {
            let (names, ty) = self.parse_var_group()?;
            for tok in names {
                if table.contains(&tok.text) {
                    return Err(CompileError::semantic(&tok, "Duplicate identifier:"));
                }
                size += self.arena.size_of(ty);
                let id = self.arena.add_symbol(Symbol {
                    name: tok.text.clone(),
                    used: false,
                    kind: SymbolKind::Var {
                        ty,
                        offset: -(size as i32),
                        global: false,
                        by_ref: false,
                    },
                });
                table.insert(&tok.text, id);
            }
            self.scanner.require(TokenKind::Semicolon, ";")?;
        }
        Ok(size)
    }

    fn parse_type(&mut self) -> Result<TypeId> {
        match self.scanner.kind() {
            TokenKind::Integer => {
                self.scanner.next()?;
                Ok(self.arena.int_type)
            }
            TokenKind::Double => {
                self.scanner.next()?;
                Ok(self.arena.double_type)
            }
            TokenKind::IntNum => {
                let lo = self.scanner.current().int_value();
                self.scanner.next()?;
                self.scanner.require(TokenKind::Dot, ".")?;
                self.scanner.require(TokenKind::Dot, ".")?;
                let hi = self.expect_int_literal()?;
                Ok(self.arena.add_type(Ty::IntRange { lo, hi }))
            }
            TokenKind::Array => {
                self.scanner.next()?;
                self.scanner.require(TokenKind::LeftSquare, "[")?;
                let first = self.expect_int_literal()?;
                let len = if self.scanner.at(TokenKind::Dot) {
                    self.scanner.next()?;
                    self.scanner.require(TokenKind::Dot, ".")?;
                    let hi = self.expect_int_literal()?;
                    (hi as i64 - first as i64 + 1).max(0) as usize
                } else {
                    first.max(0) as usize
                };
                self.scanner.require(TokenKind::RightSquare, "]")?;
                self.scanner.require(TokenKind::Of, "of")?;
                let elem = self.parse_type()?;
                Ok(self.arena.add_type(Ty::Array { elem, len }))
            }
            TokenKind::Record => {
                self.scanner.next()?;
                let mut fields = SymTable::new();
                let mut offset = 0i32;
                while self.scanner.at(TokenKind::Ident) && !self.scanner.current().is_keyword() {
                    let (names, ty) = self.parse_var_group()?;
                    for tok in names {
                        if fields.contains(&tok.text) {
                            return Err(CompileError::semantic(&tok, "Duplicate identifier:"));
                        }
                        let id = self.arena.add_symbol(Symbol {
                            name: tok.text.clone(),
                            used: false,
                            kind: SymbolKind::Var {
                                ty,
                                offset,
                                global: false,
                                by_ref: false,
                            },
                        });
                        fields.insert(&tok.text, id);
                        offset += self.arena.size_of(ty) as i32;
                    }
                    if self.scanner.at(TokenKind::Semicolon) {
                        self.scanner.next()?;
                    } else {
                        break;
                    }
                }
                self.scanner.require(TokenKind::End, "end")?;
                Ok(self.arena.add_type(Ty::Record { fields }))
            }
            TokenKind::Ident if !self.scanner.current().is_keyword() => {
                let tok = self.scanner.current().clone();
                let Some(id) = self.global.lookup(&tok.text) else {
                    return Err(CompileError::semantic(&tok, "Undefined type:"));
                };
                let SymbolKind::TypeAlias { ty } = self.arena.sym(id).kind else {
                    return Err(CompileError::semantic(&tok, "Undefined type:"));
                };
                self.scanner.next()?;
                Ok(ty)
            }
            _ => Err(CompileError::semantic(
                self.scanner.current(),
                "Undefined type:",
            )),
        }
    }

    fn expect_int_literal(&mut self) -> Result<i32> {
        if !self.scanner.at(TokenKind::IntNum) {
            return Err(CompileError::expected(
                &Token::expected(TokenKind::IntNum, "integer"),
                self.scanner.current(),
            ));
        }
        let value = self.scanner.current().int_value();
        self.scanner.next()?;
        Ok(value)
    }

    /// Parameter groups of a procedure heading. Offsets are assigned to the
    /// declared parameters from the last one backwards, starting at +8: the
    /// caller pushes arguments in source order, so the last parameter sits
    /// nearest the saved frame base. Returns past-the-end offset (the
    /// function return slot goes there).
    fn parse_params(
        &mut self,
        locals: &mut SymTable,
        params: &mut Vec<SymbolId>,
        end_offset: &mut usize,
    ) -> Result<()> {
        loop {
            let by_ref = if self.scanner.at(TokenKind::Var) {
                self.scanner.next()?;
                true
            } else {
                false
            };
            let mut names = vec![self.expect_ident()?];
            while self.scanner.at(TokenKind::Comma) {
                self.scanner.next()?;
                names.push(self.expect_ident()?);
            }
            self.scanner.require(TokenKind::Colon, ":")?;
            let ty = self.parse_type()?;
            for tok in names {
                if locals.contains(&tok.text) {
                    return Err(CompileError::semantic(&tok, "Duplicate identifier:"));
                }
                let id = self.arena.add_symbol(Symbol {
                    name: tok.text.clone(),
                    used: false,
                    kind: SymbolKind::Var {
                        ty,
                        offset: 0,
                        global: false,
                        by_ref,
                    },
                });
                locals.insert(&tok.text, id);
                params.push(id);
            }
            if self.scanner.at(TokenKind::Semicolon) {
                self.scanner.next()?;
            } else {
                break;
            }
        }
        let mut offset = 8i32;
        for &p in params.iter().rev() {
            let slot = match self.arena.sym(p).kind {
                SymbolKind::Var { ty, by_ref, .. } => {
                    if by_ref {
                        4
                    } else {
                        self.arena.size_of(ty)
                    }
                }
                _ => 0,
            };
            if let SymbolKind::Var { offset: o, .. } = &mut self.arena.sym_mut(p).kind {
                *o = offset;
            }
            offset += slot as i32;
        }
        *end_offset = offset as usize;
        Ok(())
    }

    fn parse_proc_decl(&mut self, is_function: bool) -> Result<()> {
        let name = self.expect_ident()?;
        if self.global.contains(&name.text) {
            return Err(CompileError::semantic(&name, "Duplicate identifier:"));
        }

        let mut locals = SymTable::new();
        let mut params = Vec::new();
        let mut end_offset = 0usize;
        if self.scanner.at(TokenKind::LeftRound) {
            self.scanner.next()?;
            if self.scanner.at(TokenKind::RightRound) {
                end_offset = 8;
            } else {
                self.parse_params(&mut locals, &mut params, &mut end_offset)?;
            }
            self.scanner.require(TokenKind::RightRound, ")")?;
        }

        let ret = if is_function {
            self.scanner.require(TokenKind::Colon, ":")?;
            let ty = self.parse_type()?;
            if matches!(self.arena.ty(ty), Ty::Array { .. }) {
                return Err(CompileError::semantic(&name, "Wrong declaration function type"));
            }
            if end_offset == 0 {
                end_offset = 8;
            }
            // `result` and a shadow variable named after the function itself
            // alias the return slot, so assigning to either writes it.
            for alias in ["result", name.text.as_str()] {
                let id = self.arena.add_symbol(Symbol {
                    name: alias.to_string(),
                    used: false,
                    kind: SymbolKind::Var {
                        ty,
                        offset: end_offset as i32,
                        global: false,
                        by_ref: false,
                    },
                });
                locals.insert(alias, id);
            }
            Some(ty)
        } else {
            None
        };
        self.scanner.require(TokenKind::Semicolon, ";")?;

        let local_size = if self.scanner.at(TokenKind::Var) {
            self.scanner.next()?;
            self.parse_local_vars(&mut locals)?
        } else {
            0
        };

        // Insert the symbol before the body parses so recursion resolves.
        let proc_id = self.arena.add_symbol(Symbol {
            name: name.text.clone(),
            used: false,
            kind: SymbolKind::Proc {
                params,
                locals: locals.clone(),
                local_size,
                ret,
                body: None,
            },
        });
        self.global.insert(&name.text, proc_id);

        let body = self.parse_block(Some(&locals))?;
        self.scanner.require(TokenKind::Semicolon, ";")?;
        if let SymbolKind::Proc { body: slot, .. } = &mut self.arena.sym_mut(proc_id).kind {
            *slot = Some(body);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_stmt(&mut self, local: Option<&SymTable>) -> Result<Stmt> {
        match self.scanner.kind() {
            TokenKind::Begin => self.parse_block(local),
            TokenKind::While => self.parse_while(local),
            TokenKind::Repeat => self.parse_repeat(local),
            TokenKind::If => self.parse_if(local),
            TokenKind::For => self.parse_for(local),
            TokenKind::Break => {
                self.scanner.next()?;
                Ok(Stmt::Break)
            }
            TokenKind::Continue => {
                self.scanner.next()?;
                Ok(Stmt::Continue)
            }
            TokenKind::IntNum | TokenKind::DoubleNum => {
                Ok(Stmt::Expr(self.parse_expr(local)?))
            }
            TokenKind::Ident if !self.scanner.current().is_keyword() => {
                let ident = self.scanner.current().clone();
                self.scanner.next()?;
                if self.scanner.at(TokenKind::Assign)
                    || self.scanner.at(TokenKind::LeftSquare)
                    || self.scanner.at(TokenKind::Dot)
                {
                    Ok(Stmt::Expr(self.parse_assignment(ident, local)?))
                } else {
                    Ok(Stmt::Expr(self.parse_call(ident, local)?))
                }
            }
            TokenKind::Read | TokenKind::Readln | TokenKind::Write | TokenKind::Writeln => {
                let tok = self.scanner.current().clone();
                self.scanner.next()?;
                self.parse_write_read(tok, local)
            }
            _ => Err(CompileError::semantic(
                self.scanner.current(),
                "Not expected token",
            )),
        }
    }

    fn parse_block(&mut self, local: Option<&SymTable>) -> Result<Stmt> {
        self.scanner.require(TokenKind::Begin, "begin")?;
        let body = self.parse_stmt_sequence(local, TokenKind::End)?;
        self.scanner.require(TokenKind::End, "end")?;
        Ok(Stmt::Block(body))
    }

    /// Statements up to `terminator`, separated by semicolons (a trailing
    /// semicolon before the terminator is allowed). Statements following a
    /// `break`/`continue` still parse but are dropped as unreachable.
    fn parse_stmt_sequence(
        &mut self,
        local: Option<&SymTable>,
        terminator: TokenKind,
    ) -> Result<Vec<Stmt>> {
        let mut body = Vec::new();
        let mut dead = false;
        loop {
            if self.scanner.at(terminator) {
                break;
            }
            let stmt = self.parse_stmt(local)?;
            let ends_flow = stmt.is_break_or_continue();
            if !dead {
                body.push(stmt);
            }
            if ends_flow {
                dead = true;
            }
            if self.scanner.at(TokenKind::Semicolon) {
                self.scanner.next()?;
            } else {
                break;
            }
        }
        Ok(body)
    }

    fn parse_while(&mut self, local: Option<&SymTable>) -> Result<Stmt> {
        self.scanner.require(TokenKind::While, "while")?;
        let cond = self.parse_rel(local)?;
        self.scanner.require(TokenKind::Do, "do")?;
        if cond.const_text().as_deref() == Some("0") {
            self.parse_stmt(local)?;
            return Ok(Stmt::Empty);
        }
        let body = self.parse_stmt(local)?;
        Ok(Stmt::While {
            cond,
            body: Box::new(body),
        })
    }

    fn parse_repeat(&mut self, local: Option<&SymTable>) -> Result<Stmt> {
        self.scanner.require(TokenKind::Repeat, "repeat")?;
        let body = self.parse_stmt_sequence(local, TokenKind::Until)?;
        self.scanner.require(TokenKind::Until, "until")?;
        let cond = self.parse_rel(local)?;
        Ok(Stmt::Repeat {
            cond,
            body: Box::new(Stmt::Block(body)),
        })
    }

    fn parse_if(&mut self, local: Option<&SymTable>) -> Result<Stmt> {
        self.scanner.require(TokenKind::If, "if")?;
        let cond = self.parse_rel(local)?;
        self.scanner.require(TokenKind::Then, "then")?;
        let then_branch = self.parse_stmt(local)?;
        let statically_false = cond.const_text().as_deref() == Some("0");
        if self.scanner.at(TokenKind::Else) {
            self.scanner.next()?;
            let else_branch = self.parse_stmt(local)?;
            if statically_false {
                return Ok(else_branch);
            }
            return Ok(Stmt::If {
                cond,
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            });
        }
        if statically_false {
            return Ok(Stmt::Empty);
        }
        Ok(Stmt::If {
            cond,
            then_branch: Box::new(then_branch),
            else_branch: Box::new(Stmt::Empty),
        })
    }

    fn parse_for(&mut self, local: Option<&SymTable>) -> Result<Stmt> {
        self.scanner.require(TokenKind::For, "for")?;
        let loop_var = self.expect_ident()?;
        let control = self.parse_assignment(loop_var, local)?;

        let clue = self.scanner.current().clone();
        let down = match clue.kind {
            TokenKind::To => false,
            TokenKind::Downto => true,
            _ => {
                return Err(CompileError::new(
                    clue.line,
                    format!("There is must be \"to\" or \"downto\" but was \"{}\"", clue.text),
                ));
            }
        };
        self.scanner.next()?;
        let limit = self.parse_rel(local)?;
        self.scanner.require(TokenKind::Do, "do")?;
        let body = self.parse_stmt(local)?;

        // Both bounds constant and the range empty on entry: the whole loop
        // reduces to nothing.
        let initial = match &control {
            Expr::Binary { right, .. } => right.const_int(),
            _ => None,
        };
        if let (Some(iv), Some(fv)) = (initial, limit.const_int()) {
            if (!down && iv > fv) || (down && iv < fv) {
                return Ok(Stmt::Empty);
            }
        }

        Ok(Stmt::For {
            control,
            limit,
            down,
            body: Box::new(body),
        })
    }

    fn parse_write_read(&mut self, tok: Token, local: Option<&SymTable>) -> Result<Stmt> {
        let mut args = Vec::new();
        if self.scanner.at(TokenKind::LeftRound) {
            self.scanner.next()?;
            loop {
                let arg = self.parse_rel(local)?;
                let ty = arg.ty(&self.arena);
                let scalar = ty.is_some_and(|t| self.arena.is_scalar(t));
                if !scalar {
                    return Err(CompileError::type_conversion(
                        tok.line,
                        "double or integer",
                        &self.type_name_or_void(ty),
                    ));
                }
                args.push(arg);
                if self.scanner.at(TokenKind::Comma) {
                    self.scanner.next()?;
                } else {
                    break;
                }
            }
            self.scanner.require(TokenKind::RightRound, ")")?;
        }
        let newline = matches!(tok.kind, TokenKind::Writeln | TokenKind::Readln);
        match tok.kind {
            TokenKind::Write | TokenKind::Writeln => Ok(Stmt::Write { args, newline }),
            _ => Ok(Stmt::Read { args, newline }),
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_assignment(&mut self, ident: Token, local: Option<&SymTable>) -> Result<Expr> {
        let Some(sym) = self.lookup(local, &ident.text) else {
            return Err(CompileError::semantic(&ident, "Undeclared identifier:"));
        };
        let left = self.parse_ident_ref(ident.clone(), sym, local)?;
        self.scanner.require(TokenKind::Assign, ":=")?;
        let right = self.parse_expr(local)?;
        self.check_exprs(&left, &right, ident.line, false)?;
        let ty = self
            .choose_type(&right, &left)
            .expect("checked operands have types");
        Ok(Expr::Binary {
            op: Token::new(TokenKind::Assign, ":=", ident.line, ident.col),
            ty,
            left: Box::new(left),
            right: Box::new(right),
            parenthesized: false,
        })
    }

    /// Postfix walk of an identifier reference: any run of `[indexes]` and
    /// `.field` accesses, in any order.
    fn parse_ident_ref(
        &mut self,
        ident: Token,
        sym: SymbolId,
        local: Option<&SymTable>,
    ) -> Result<Expr> {
        self.arena.mark_used(sym);
        let SymbolKind::Var { ty, .. } = self.arena.sym(sym).kind else {
            return Err(CompileError::semantic(&ident, "Not expected token"));
        };
        let mut expr = Expr::Var {
            name: ident.text.clone(),
            sym,
            ty,
        };
        let mut cur_ty = ty;
        loop {
            if self.scanner.at(TokenKind::LeftSquare) {
                let array_ty = cur_ty;
                let mut indexes = Vec::new();
                while self.scanner.at(TokenKind::LeftSquare) {
                    self.scanner.next()?;
                    loop {
                        let line = self.scanner.current().line;
                        let index = self.parse_rel(local)?;
                        let ity = index.ty(&self.arena);
                        if !ity.is_some_and(|t| self.arena.is_int(t)) {
                            return Err(CompileError::type_conversion(
                                line,
                                "integer",
                                &self.type_name_or_void(ity),
                            ));
                        }
                        indexes.push(index);
                        if self.scanner.at(TokenKind::Comma) {
                            self.scanner.next()?;
                        } else {
                            break;
                        }
                    }
                    self.scanner.require(TokenKind::RightSquare, "]")?;
                }
                // Every index level must peel an actual array dimension.
                let mut t = array_ty;
                for _ in 0..indexes.len() {
                    let Ty::Array { elem, .. } = self.arena.ty(t) else {
                        return Err(CompileError::type_conversion(
                            ident.line,
                            "array",
                            &self.arena.type_name(t),
                        ));
                    };
                    t = *elem;
                }
                cur_ty = t;
                expr = Expr::ArrayAccess {
                    base: Box::new(expr),
                    indexes,
                    array_ty,
                    elem_ty: cur_ty,
                };
            } else if self.scanner.at(TokenKind::Dot) {
                self.scanner.next()?;
                let field_tok = self.expect_ident()?;
                let Ty::Record { fields } = self.arena.ty(cur_ty) else {
                    return Err(CompileError::semantic(
                        &field_tok,
                        "From the left should be record to access a field",
                    ));
                };
                let Some(field) = fields.lookup(&field_tok.text) else {
                    return Err(CompileError::semantic(&field_tok, "Undeclared identifier:"));
                };
                self.arena.mark_used(field);
                let SymbolKind::Var { ty: fty, .. } = self.arena.sym(field).kind else {
                    return Err(CompileError::semantic(&field_tok, "Undeclared identifier:"));
                };
                cur_ty = fty;
                expr = Expr::RecordField {
                    base: Box::new(expr),
                    field,
                    name: field_tok.text,
                    ty: fty,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_call(&mut self, ident: Token, local: Option<&SymTable>) -> Result<Expr> {
        // A function's own name shadows the procedure symbol inside its body
        // (it aliases the return slot), so a call looks for a procedure
        // symbol specifically.
        let proc = match self.lookup(local, &ident.text) {
            Some(s) if self.arena.sym(s).is_proc() => Some(s),
            _ => self
                .global
                .lookup(&ident.text)
                .filter(|&s| self.arena.sym(s).is_proc()),
        };
        let Some(proc) = proc else {
            return Err(CompileError::semantic(&ident, "Undeclared identifier:"));
        };
        self.arena.mark_used(proc);

        let params: Vec<SymbolId> = match &self.arena.sym(proc).kind {
            SymbolKind::Proc { params, .. } => params.clone(),
            _ => Vec::new(),
        };

        let mut args = Vec::new();
        if self.scanner.at(TokenKind::LeftRound) {
            self.scanner.next()?;
            let first = self.parse_rel(local)?;
            if matches!(first, Expr::Empty) {
                if !params.is_empty() {
                    return Err(CompileError::semantic(&ident, "Missed arguments"));
                }
            } else {
                if params.is_empty() {
                    return Err(CompileError::semantic(&ident, "Too much arguments"));
                }
                self.check_arg(&ident, params[0], &first)?;
                args.push(first);
                while self.scanner.at(TokenKind::Comma) {
                    self.scanner.next()?;
                    let arg = self.parse_rel(local)?;
                    if args.len() >= params.len() {
                        return Err(CompileError::semantic(&ident, "Too much arguments"));
                    }
                    self.check_arg(&ident, params[args.len()], &arg)?;
                    args.push(arg);
                }
            }
            self.scanner.require(TokenKind::RightRound, ")")?;
        }
        if args.len() < params.len() {
            return Err(CompileError::semantic(&ident, "Missed arguments"));
        }
        Ok(Expr::Call {
            name: ident.text,
            proc,
            args,
        })
    }

    fn check_arg(&self, ident: &Token, param: SymbolId, arg: &Expr) -> Result<()> {
        let SymbolKind::Var { ty, by_ref, .. } = self.arena.sym(param).kind else {
            return Ok(());
        };
        if by_ref {
            if !arg.is_lvalue() {
                return Err(CompileError::new(
                    ident.line,
                    "var argument must be a variable, array element or record field",
                ));
            }
            // The callee aliases the caller's storage, so the types must
            // agree exactly; no widening through a reference.
            let aty = arg.ty(&self.arena);
            if aty != Some(ty)
                && !(aty.is_some_and(|t| self.arena.is_int(t)) && self.arena.is_int(ty))
            {
                return Err(CompileError::type_conversion(
                    ident.line,
                    &self.arena.type_name(ty),
                    &self.type_name_or_void(aty),
                ));
            }
            return Ok(());
        }
        self.check_types(Some(ty), arg.ty(&self.arena), ident.line, false)
    }

    fn parse_rel(&mut self, local: Option<&SymTable>) -> Result<Expr> {
        let mut left = self.parse_expr(local)?;
        while matches!(
            self.scanner.kind(),
            TokenKind::LessEqual
                | TokenKind::GreaterEqual
                | TokenKind::Equal
                | TokenKind::NotEqual
                | TokenKind::Greater
                | TokenKind::Less
        ) {
            let op = self.scanner.current().clone();
            self.scanner.next()?;
            let right = self.parse_expr(local)?;
            if left.is_const() && right.is_const() {
                left = self.fold_binary(&left, &right, &op)?;
            } else {
                self.check_exprs(&left, &right, op.line, true)?;
                let ty = self
                    .choose_type(&right, &left)
                    .expect("checked operands have types");
                left = Expr::Binary {
                    op,
                    ty,
                    left: Box::new(left),
                    right: Box::new(right),
                    parenthesized: false,
                };
            }
        }
        Ok(left)
    }

    fn parse_expr(&mut self, local: Option<&SymTable>) -> Result<Expr> {
        let mut left = self.parse_term(local)?;
        while matches!(
            self.scanner.kind(),
            TokenKind::Plus | TokenKind::Minus | TokenKind::Or | TokenKind::Xor
        ) {
            let op = self.scanner.current().clone();
            self.scanner.next()?;
            let right = self.parse_term(local)?;
            self.make_node(&mut left, right, op)?;
        }
        Ok(left)
    }

    fn parse_term(&mut self, local: Option<&SymTable>) -> Result<Expr> {
        let mut left = self.parse_factor(local)?;
        while matches!(
            self.scanner.kind(),
            TokenKind::Star | TokenKind::Slash | TokenKind::Div | TokenKind::And | TokenKind::Mod
        ) {
            let op = self.scanner.current().clone();
            self.scanner.next()?;
            let right = self.parse_factor(local)?;
            self.make_node(&mut left, right, op)?;
        }
        Ok(left)
    }

    fn parse_factor(&mut self, local: Option<&SymTable>) -> Result<Expr> {
        match self.scanner.kind() {
            TokenKind::Ident if !self.scanner.current().is_keyword() => {
                let ident = self.scanner.current().clone();
                let Some(sym) = self.lookup(local, &ident.text) else {
                    return Err(CompileError::semantic(&ident, "Undeclared identifier:"));
                };
                self.scanner.next()?;
                if self.scanner.at(TokenKind::LeftRound) || self.arena.sym(sym).is_proc() {
                    self.parse_call(ident, local)
                } else {
                    self.parse_ident_ref(ident, sym, local)
                }
            }
            TokenKind::IntNum => {
                let value = self.scanner.current().int_value();
                self.scanner.next()?;
                Ok(Expr::IntLit { value })
            }
            TokenKind::DoubleNum => {
                let text = self.scanner.current().text.clone();
                self.scanner.next()?;
                let num = self.insert_double_const(&text);
                Ok(Expr::DoubleLit { text, num })
            }
            TokenKind::StringLit => {
                let text = self.scanner.current().text.clone();
                self.scanner.next()?;
                self.string_count += 1;
                let num = self.string_count;
                let ty = self.arena.int_type;
                let id = self.arena.add_symbol(Symbol {
                    name: format!("s_{}", num),
                    used: true,
                    kind: SymbolKind::Const {
                        num,
                        value: text.clone(),
                        ty,
                    },
                });
                self.global.insert(&format!("s_{}", num), id);
                Ok(Expr::StringLit { text, num })
            }
            TokenKind::LeftRound => {
                self.scanner.next()?;
                let mut rel = self.parse_rel(local)?;
                rel.set_parenthesized();
                self.scanner.require(TokenKind::RightRound, ")")?;
                Ok(rel)
            }
            TokenKind::Minus | TokenKind::Plus | TokenKind::Not => self.parse_unary(local),
            _ => Ok(Expr::Empty),
        }
    }

    fn parse_unary(&mut self, local: Option<&SymTable>) -> Result<Expr> {
        let sign = self.scanner.current().clone();
        self.scanner.next()?;
        let operand = self.parse_factor(local)?;
        let ty = operand.ty(&self.arena);
        if matches!(operand, Expr::Empty) {
            return Err(CompileError::semantic(
                self.scanner.current(),
                "Not expected token",
            ));
        }
        if sign.kind == TokenKind::Not && !ty.is_some_and(|t| self.arena.is_int(t)) {
            return Err(self.int_only_error(&sign));
        }
        if operand.is_const() && sign.kind != TokenKind::Plus {
            return self.fold_unary(&operand, &sign);
        }
        let ty = ty.expect("non-empty operand has a type");
        Ok(Expr::Unary {
            op: sign,
            ty,
            operand: Box::new(operand),
        })
    }

    // ------------------------------------------------------------------
    // Node construction and constant folding
    // ------------------------------------------------------------------

    /// Combine `left op right`, folding constants where possible.
    fn make_node(&mut self, left: &mut Expr, right: Expr, op: Token) -> Result<()> {
        let logical = matches!(op.kind, TokenKind::And | TokenKind::Or | TokenKind::Xor);
        let result_ty = self.choose_type(&right, left);
        if logical {
            let both_int = left.ty(&self.arena).is_some_and(|t| self.arena.is_int(t))
                && right.ty(&self.arena).is_some_and(|t| self.arena.is_int(t));
            if !both_int {
                return Err(self.int_only_error(&op));
            }
        }
        // `mod` only exists on integers; the FPU path has no remainder form.
        if op.kind == TokenKind::Mod
            && result_ty.is_some_and(|t| self.arena.is_double(t))
        {
            return Err(self.int_only_error(&op));
        }

        let pinned = left.is_parenthesized() || right.is_parenthesized();
        if !pinned && left.is_const() && right.is_const() {
            *left = self.fold_binary(left, &right, &op)?;
            return Ok(());
        }
        if !pinned && right.is_const() {
            if let Expr::Binary {
                left: inner_left,
                right: inner_right,
                ty,
                ..
            } = left
            {
                if inner_right.is_const() {
                    let folded = {
                        let current: &Expr = inner_right;
                        self.fold_binary(current, &right, &op)?
                    };
                    *inner_right = Box::new(folded);
                    // The right child may have changed scalar kind.
                    *ty = match inner_left.ty(&self.arena) {
                        Some(t) if self.arena.is_double(t) => t,
                        _ => inner_right
                            .ty(&self.arena)
                            .expect("folded constant has a type"),
                    };
                    return Ok(());
                }
            }
        }
        // Arithmetic identities on scalar operands; the useful direction for
        // code quality since the generator only strength-reduces constant
        // right operands.
        let left_scalar = left.ty(&self.arena).is_some_and(|t| self.arena.is_scalar(t));
        let right_scalar = right
            .ty(&self.arena)
            .is_some_and(|t| self.arena.is_scalar(t));
        if op.kind == TokenKind::Star && left_scalar && right_scalar {
            if right.const_int() == Some(1) {
                return Ok(());
            }
            if left.const_int() == Some(1) {
                *left = right;
                return Ok(());
            }
        }
        if op.kind == TokenKind::Plus && left_scalar && right_scalar {
            if right.const_int() == Some(0) {
                return Ok(());
            }
            if left.const_int() == Some(0) {
                *left = right;
                return Ok(());
            }
        }

        self.check_exprs(left, &right, op.line, true)?;
        let ty = self
            .choose_type(&right, left)
            .expect("checked operands have types");
        let lhs = std::mem::replace(left, Expr::Empty);
        *left = Expr::Binary {
            op,
            ty,
            left: Box::new(lhs),
            right: Box::new(right),
            parenthesized: false,
        };
        Ok(())
    }

    fn insert_double_const(&mut self, text: &str) -> usize {
        self.double_count += 1;
        let num = self.double_count;
        let ty = self.arena.double_type;
        let id = self.arena.add_symbol(Symbol {
            name: format!("dc_{}", num),
            used: true,
            kind: SymbolKind::Const {
                num,
                value: text.to_string(),
                ty,
            },
        });
        self.global.insert(&format!("dc_{}", num), id);
        num
    }

    /// Drop the most recent `dc_N` table entry; folding consumed it.
    fn retract_double(&mut self) {
        self.global.erase(&format!("dc_{}", self.double_count));
        self.double_count -= 1;
    }

    /// Overwrite the current `dc_N` slot with a folded value.
    fn overwrite_double(&mut self, text: &str) -> usize {
        let num = self.double_count;
        let ty = self.arena.double_type;
        let id = self.arena.add_symbol(Symbol {
            name: format!("dc_{}", num),
            used: true,
            kind: SymbolKind::Const {
                num,
                value: text.to_string(),
                ty,
            },
        });
        self.global.insert(&format!("dc_{}", num), id);
        num
    }

    fn is_double_const(&self, e: &Expr) -> bool {
        e.ty(&self.arena)
            .is_some_and(|t| self.arena.is_double(t))
    }

    fn format_double(value: f64) -> String {
        let mut s = format!("{}", value);
        if !s.contains('.') && !s.contains('e') && !s.contains("inf") && !s.contains("NaN") {
            s.push_str(".0");
        }
        s
    }

    fn fold_binary(&mut self, e1: &Expr, e2: &Expr, op: &Token) -> Result<Expr> {
        use TokenKind::*;
        let d1 = self.is_double_const(e1);
        let d2 = self.is_double_const(e2);
        if d1 || d2 {
            let a: f64 = e1.const_text().unwrap_or_default().parse().unwrap_or(0.0);
            let b: f64 = e2.const_text().unwrap_or_default().parse().unwrap_or(0.0);
            let doubles = d1 as usize + d2 as usize;
            match op.kind {
                LessEqual | GreaterEqual | Equal | NotEqual | Greater | Less => {
                    for _ in 0..doubles {
                        self.retract_double();
                    }
                    let v = match op.kind {
                        LessEqual => a <= b,
                        GreaterEqual => a >= b,
                        Equal => a == b,
                        NotEqual => a != b,
                        Greater => a > b,
                        _ => a < b,
                    };
                    Ok(Expr::IntLit { value: v as i32 })
                }
                _ => {
                    let v = match op.kind {
                        Plus => a + b,
                        Minus => a - b,
                        Star => a * b,
                        Slash | Div => a / b,
                        _ => {
                            return Err(self.int_only_error(op));
                        }
                    };
                    // Two literals collapse into one table slot.
                    if doubles == 2 {
                        self.retract_double();
                    }
                    let text = Self::format_double(v);
                    let num = self.overwrite_double(&text);
                    Ok(Expr::DoubleLit { text, num })
                }
            }
        } else {
            let a = e1.const_int().unwrap_or(0);
            let b = e2.const_int().unwrap_or(0);
            let value = match op.kind {
                Plus => a.wrapping_add(b),
                Minus => a.wrapping_sub(b),
                Star => a.wrapping_mul(b),
                Slash | Div => {
                    if b == 0 {
                        return Err(CompileError::new(op.line, "Division by zero"));
                    }
                    a.wrapping_div(b)
                }
                Mod => {
                    if b == 0 {
                        return Err(CompileError::new(op.line, "Division by zero"));
                    }
                    a.wrapping_rem(b)
                }
                LessEqual => (a <= b) as i32,
                GreaterEqual => (a >= b) as i32,
                Equal => (a == b) as i32,
                NotEqual => (a != b) as i32,
                Greater => (a > b) as i32,
                Less => (a < b) as i32,
                // Bitwise, exactly like the generated and/or/xor.
                And => a & b,
                Or => a | b,
                Xor => a ^ b,
                _ => a,
            };
            Ok(Expr::IntLit { value })
        }
    }

    fn fold_unary(&mut self, operand: &Expr, sign: &Token) -> Result<Expr> {
        if self.is_double_const(operand) {
            // Only minus reaches here for doubles; `not` was rejected above.
            let v: f64 = operand
                .const_text()
                .unwrap_or_default()
                .parse()
                .unwrap_or(0.0);
            let text = Self::format_double(-v);
            let num = self.overwrite_double(&text);
            Ok(Expr::DoubleLit { text, num })
        } else {
            let v = operand.const_int().unwrap_or(0);
            let value = match sign.kind {
                TokenKind::Minus => v.wrapping_neg(),
                TokenKind::Not => (v == 0) as i32,
                _ => v,
            };
            Ok(Expr::IntLit { value })
        }
    }
}
