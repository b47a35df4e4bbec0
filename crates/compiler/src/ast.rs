//! Abstract syntax tree
//!
//! Expressions and statements are tagged sums; code generation and the `-p`
//! pretty printer dispatch on the variant. Nodes refer to symbols and types
//! by arena id ([`SymbolId`], [`TypeId`]), so the tree is plain data that can
//! be cloned or compared freely.
//!
//! All nodes are built during parsing and are read-only afterwards.

use crate::symbol::{SymbolId, Symbols, TypeId};
use crate::token::{Token, TokenKind};
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Binary {
        op: Token,
        ty: TypeId,
        left: Box<Expr>,
        right: Box<Expr>,
        /// Set when the node was explicitly parenthesized; blocks the
        /// constant-into-right-child fold.
        parenthesized: bool,
    },
    Unary {
        op: Token,
        ty: TypeId,
        operand: Box<Expr>,
    },
    Var {
        name: String,
        sym: SymbolId,
        ty: TypeId,
    },
    ArrayAccess {
        base: Box<Expr>,
        indexes: Vec<Expr>,
        /// Type of the array being indexed; strides derive from it.
        array_ty: TypeId,
        /// Type after peeling `indexes.len()` levels.
        elem_ty: TypeId,
    },
    RecordField {
        base: Box<Expr>,
        field: SymbolId,
        name: String,
        ty: TypeId,
    },
    IntLit {
        value: i32,
    },
    DoubleLit {
        /// Literal text exactly as emitted into the `dc_N dq <text>` constant.
        text: String,
        num: usize,
    },
    StringLit {
        text: String,
        num: usize,
    },
    Call {
        name: String,
        proc: SymbolId,
        args: Vec<Expr>,
    },
    Empty,
}

impl Expr {
    /// Constant literals, and `+` applied to one, fold at parse time.
    pub fn is_const(&self) -> bool {
        match self {
            Expr::IntLit { .. } | Expr::DoubleLit { .. } => true,
            Expr::Unary { operand, .. } => operand.is_const(),
            _ => false,
        }
    }

    /// The literal text of a constant expression, if it is one.
    pub fn const_text(&self) -> Option<String> {
        match self {
            Expr::IntLit { value } => Some(value.to_string()),
            Expr::DoubleLit { text, .. } => Some(text.clone()),
            Expr::Unary { operand, .. } => operand.const_text(),
            _ => None,
        }
    }

    pub fn const_int(&self) -> Option<i32> {
        match self {
            Expr::IntLit { value } => Some(*value),
            Expr::Unary { operand, .. } => operand.const_int(),
            _ => None,
        }
    }

    pub fn is_parenthesized(&self) -> bool {
        matches!(
            self,
            Expr::Binary {
                parenthesized: true,
                ..
            }
        )
    }

    /// Mark a parenthesized subexpression. Only binary nodes record the flag;
    /// for every other variant parenthesization changes nothing.
    pub fn set_parenthesized(&mut self) {
        if let Expr::Binary { parenthesized, .. } = self {
            *parenthesized = true;
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Expr::StringLit { .. })
    }

    pub fn is_lvalue(&self) -> bool {
        matches!(
            self,
            Expr::Var { .. } | Expr::ArrayAccess { .. } | Expr::RecordField { .. }
        )
    }

    /// Static type of the expression; `None` for the empty expression and
    /// calls of proper procedures. String literals are typed integer (they
    /// evaluate to a pointer in `esi`).
    pub fn ty(&self, arena: &Symbols) -> Option<TypeId> {
        match self {
            Expr::IntLit { .. } | Expr::StringLit { .. } => Some(arena.int_type),
            Expr::DoubleLit { .. } => Some(arena.double_type),
            Expr::Binary { ty, .. } | Expr::Unary { ty, .. } | Expr::Var { ty, .. } => Some(*ty),
            Expr::ArrayAccess { elem_ty, .. } => Some(*elem_ty),
            Expr::RecordField { ty, .. } => Some(*ty),
            Expr::Call { proc, .. } => match &arena.sym(*proc).kind {
                crate::symbol::SymbolKind::Proc { ret, .. } => *ret,
                _ => None,
            },
            Expr::Empty => None,
        }
    }

    /// Bytes the evaluated expression leaves on the machine stack. An
    /// assignment stores through its target and leaves nothing; a string
    /// literal only loads `esi`.
    pub fn result_size(&self, arena: &Symbols) -> usize {
        match self {
            Expr::Empty | Expr::StringLit { .. } => 0,
            Expr::Binary { op, .. } if op.kind == TokenKind::Assign => 0,
            Expr::Call { proc, .. } => arena.ret_size(*proc),
            _ => self.ty(arena).map_or(0, |t| arena.size_of(t)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Block(Vec<Stmt>),
    Expr(Expr),
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    Repeat {
        cond: Expr,
        body: Box<Stmt>,
    },
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Box<Stmt>,
    },
    For {
        /// The initial assignment `i := e1`; its target doubles as the loop
        /// counter.
        control: Expr,
        limit: Expr,
        down: bool,
        body: Box<Stmt>,
    },
    Break,
    Continue,
    Write {
        args: Vec<Expr>,
        newline: bool,
    },
    Read {
        args: Vec<Expr>,
        newline: bool,
    },
    Empty,
}

impl Stmt {
    /// Statements after a break/continue in the same sequence are dead and
    /// dropped by the parser.
    pub fn is_break_or_continue(&self) -> bool {
        matches!(self, Stmt::Break | Stmt::Continue)
    }
}

fn pad(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push(' ');
    }
}

fn line(out: &mut String, depth: usize, text: &str) {
    pad(out, depth);
    let _ = writeln!(out, "{}", text);
}

/// Render an expression subtree for the `-p` dump: operands indent five
/// spaces under their operator.
pub fn dump_expr(expr: &Expr, out: &mut String, depth: usize) {
    match expr {
        Expr::Binary {
            op, left, right, ..
        } => {
            dump_expr(left, out, depth + 5);
            line(out, depth, &op.text);
            dump_expr(right, out, depth + 5);
        }
        Expr::Unary { op, operand, .. } => {
            line(out, depth, &op.text);
            dump_expr(operand, out, depth + 5);
        }
        Expr::Var { name, .. } => line(out, depth, name),
        Expr::ArrayAccess { base, indexes, .. } => {
            dump_expr(base, out, depth);
            for index in indexes {
                line(out, depth, "[");
                dump_expr(index, out, depth + 5);
                line(out, depth, "]");
            }
        }
        Expr::RecordField { base, name, .. } => {
            dump_expr(base, out, depth + 5);
            line(out, depth, ".");
            line(out, depth + 5, name);
        }
        Expr::IntLit { value } => line(out, depth, &value.to_string()),
        Expr::DoubleLit { text, .. } => line(out, depth, text),
        Expr::StringLit { text, .. } => line(out, depth, &format!("'{}'", text)),
        Expr::Call { name, args, .. } => {
            line(out, depth, name);
            for arg in args {
                dump_expr(arg, out, depth + 5);
            }
        }
        Expr::Empty => {}
    }
}

/// Render a statement subtree for the `-p` dump.
pub fn dump_stmt(stmt: &Stmt, out: &mut String, depth: usize) {
    match stmt {
        Stmt::Block(body) => {
            line(out, depth, "begin");
            for s in body {
                dump_stmt(s, out, depth + 5);
            }
            line(out, depth, "end");
        }
        Stmt::Expr(e) => dump_expr(e, out, depth),
        Stmt::While { cond, body } => {
            line(out, depth, "while");
            dump_expr(cond, out, depth);
            line(out, depth, "do");
            dump_stmt(body, out, depth + 5);
        }
        Stmt::Repeat { cond, body } => {
            line(out, depth, "repeat");
            dump_stmt(body, out, depth + 5);
            line(out, depth, "until");
            dump_expr(cond, out, depth);
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            line(out, depth, "if");
            dump_expr(cond, out, depth);
            line(out, depth, "then");
            dump_stmt(then_branch, out, depth + 5);
            if **else_branch != Stmt::Empty {
                line(out, depth, "else");
                dump_stmt(else_branch, out, depth + 5);
            }
        }
        Stmt::For {
            control,
            limit,
            down,
            body,
        } => {
            line(out, depth, "for");
            dump_expr(control, out, depth);
            line(out, depth, if *down { "downto" } else { "to" });
            dump_expr(limit, out, depth);
            line(out, depth, "do");
            dump_stmt(body, out, depth + 5);
        }
        Stmt::Break => line(out, depth, "break"),
        Stmt::Continue => line(out, depth, "continue"),
        Stmt::Write { args, newline } => {
            line(out, depth, if *newline { "writeln" } else { "write" });
            for arg in args {
                dump_expr(arg, out, depth + 5);
            }
        }
        Stmt::Read { args, newline } => {
            line(out, depth, if *newline { "readln" } else { "read" });
            for arg in args {
                dump_expr(arg, out, depth + 5);
            }
        }
        Stmt::Empty => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(kind: TokenKind, text: &str) -> Token {
        Token::new(kind, text, 1, 1)
    }

    #[test]
    fn test_const_detection() {
        let arena = Symbols::new();
        let five = Expr::IntLit { value: 5 };
        assert!(five.is_const());
        assert_eq!(five.const_int(), Some(5));

        let plus_five = Expr::Unary {
            op: tok(TokenKind::Plus, "+"),
            ty: arena.int_type,
            operand: Box::new(Expr::IntLit { value: 5 }),
        };
        assert!(plus_five.is_const());
        assert_eq!(plus_five.const_text().as_deref(), Some("5"));
    }

    #[test]
    fn test_parenthesized_only_sticks_to_binary() {
        let arena = Symbols::new();
        let mut lit = Expr::IntLit { value: 1 };
        lit.set_parenthesized();
        assert!(!lit.is_parenthesized());

        let mut bin = Expr::Binary {
            op: tok(TokenKind::Plus, "+"),
            ty: arena.int_type,
            left: Box::new(Expr::IntLit { value: 1 }),
            right: Box::new(Expr::IntLit { value: 2 }),
            parenthesized: false,
        };
        bin.set_parenthesized();
        assert!(bin.is_parenthesized());
    }

    #[test]
    fn test_result_sizes() {
        let arena = Symbols::new();
        assert_eq!(Expr::IntLit { value: 1 }.result_size(&arena), 4);
        assert_eq!(
            Expr::DoubleLit {
                text: "1.5".into(),
                num: 1
            }
            .result_size(&arena),
            8
        );
        assert_eq!(
            Expr::StringLit {
                text: "hi".into(),
                num: 1
            }
            .result_size(&arena),
            0
        );
        assert_eq!(Expr::Empty.result_size(&arena), 0);
    }

    #[test]
    fn test_dump_binary_tree() {
        let arena = Symbols::new();
        let expr = Expr::Binary {
            op: tok(TokenKind::Plus, "+"),
            ty: arena.int_type,
            left: Box::new(Expr::IntLit { value: 2 }),
            right: Box::new(Expr::IntLit { value: 3 }),
            parenthesized: false,
        };
        let mut out = String::new();
        dump_expr(&expr, &mut out, 0);
        assert_eq!(out, "     2\n+\n     3\n");
    }

    #[test]
    fn test_dump_if_without_else_omits_else() {
        let stmt = Stmt::If {
            cond: Expr::IntLit { value: 1 },
            then_branch: Box::new(Stmt::Break),
            else_branch: Box::new(Stmt::Empty),
        };
        let mut out = String::new();
        dump_stmt(&stmt, &mut out, 0);
        assert!(out.contains("if"));
        assert!(!out.contains("else"));
    }
}
