//! x86 code generation
//!
//! Walks the AST once and lowers it to a linear instruction list using an
//! evaluation-stack discipline: every expression leaves exactly one value on
//! the machine stack (4 bytes for integer, 8 for double, its full size for an
//! aggregate; string literals instead leave a pointer in `esi`).
//!
//! Addresses are produced by a single helper per l-value variant
//! ([`Generator::gen_addr`]): globals by `offset v_name`, locals by
//! `lea esi, [off + ebp]` (through the stored address for by-reference
//! parameters), array elements by collapsing 1-based indexes into a byte
//! displacement, record fields by adding the field offset.
//!
//! Calling convention (internal): the caller allocates the return slot, pushes
//! arguments in source order, and removes them after `call`; the callee runs
//! the standard `push ebp; mov ebp, esp; sub esp, locals` prologue. `printf`
//! is reached through the `call printf, ...` macro form and the caller adds
//! the argument bytes back afterwards.

use crate::asm::{Instr, Op, Operand};
use crate::ast::{Expr, Stmt};
use crate::parser::Program;
use crate::symbol::{SymbolKind, Symbols, TypeId};
use crate::token::TokenKind;
use tracing::debug;

/// Fixed data prelude: printf format strings and the spill buffer for
/// computed double arguments.
const PRELUDE: &str = "\tint_frmt db '%d', 0\n\tdouble_frmt db '%f', 0\n\tnew_line db '', 0Dh, 0Ah, 0\n\tdouble_buff dq 0.0\n";

pub struct Generator<'a> {
    program: &'a Program,
    instrs: Vec<Instr>,
    label_counter: usize,
    /// Innermost loop's (continue, break) targets.
    loop_ctx: Option<(String, String)>,
    include_dir: String,
}

/// Lower a parsed program to its instruction list.
pub fn generate(program: &Program, include_dir: &str) -> Vec<Instr> {
    let mut generator = Generator {
        program,
        instrs: Vec::new(),
        label_counter: 0,
        loop_ctx: None,
        include_dir: include_dir.to_string(),
    };
    generator.emit_program();
    debug!(
        instructions = generator.instrs.len(),
        "generated instruction list"
    );
    generator.instrs
}

impl<'a> Generator<'a> {
    fn arena(&self) -> &'a Symbols {
        &self.program.arena
    }

    fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    fn op0(&mut self, op: Op) {
        self.push(Instr::op0(op));
    }

    fn op1(&mut self, op: Op, a: Operand) {
        self.push(Instr::op1(op, a));
    }

    fn op2(&mut self, op: Op, a: Operand, b: Operand) {
        self.push(Instr::op2(op, a, b));
    }

    fn raw(&mut self, text: impl Into<String>) {
        self.push(Instr::Raw(text.into()));
    }

    fn new_label(&mut self) -> String {
        let label = format!("l_{}", self.label_counter);
        self.label_counter += 1;
        label
    }

    fn is_int(&self, ty: TypeId) -> bool {
        self.arena().is_int(ty)
    }

    fn is_double(&self, ty: TypeId) -> bool {
        self.arena().is_double(ty)
    }

    fn expr_is_int(&self, e: &Expr) -> bool {
        e.ty(self.arena()).is_some_and(|t| self.is_int(t))
    }

    // ------------------------------------------------------------------
    // Program frame
    // ------------------------------------------------------------------

    fn emit_program(&mut self) {
        let program = self.program;
        self.raw(format!("include {}\\start.inc\n", self.include_dir));
        self.gen_stmt(&program.main);
        self.raw(format!("\ninclude {}\\end.inc\n", self.include_dir));
        self.raw(PRELUDE);
        for (name, id) in program.global.iter() {
            if program.arena.sym(id).used {
                self.emit_symbol(name, id);
            }
        }
        self.raw("end start");
    }

    /// Data definition or procedure body for one used global symbol.
    fn emit_symbol(&mut self, name: &str, id: crate::symbol::SymbolId) {
        let arena = self.arena();
        match &arena.sym(id).kind {
            SymbolKind::Var { ty, .. } => {
                let directive = if self.is_int(*ty) {
                    "dd ?".to_string()
                } else if self.is_double(*ty) {
                    "dq ?".to_string()
                } else {
                    format!("db {} dup(?)", arena.size_of(*ty))
                };
                self.raw(format!("\tv_{} {}\n", name, directive));
            }
            SymbolKind::Const { num, value, ty } => {
                let (label, directive) = if self.is_int(*ty) {
                    (format!("s_{}", num), format!("db '{}', 0", value))
                } else {
                    (format!("dc_{}", num), format!("dq {}", value))
                };
                self.push(Instr::ConstDecl {
                    name: label,
                    directive,
                });
            }
            SymbolKind::Proc {
                local_size, body, ..
            } => {
                let local_size = *local_size;
                let body = body.as_ref().expect("procedure body attached after parse");
                self.raw(format!("\npr_{} proc near\n", name));
                self.op1(Op::Push, Operand::reg("ebp"));
                self.op2(Op::Mov, Operand::reg("ebp"), Operand::reg("esp"));
                self.op2(Op::Sub, Operand::reg("esp"), Operand::imm(local_size));
                self.gen_stmt(body);
                self.op2(Op::Mov, Operand::reg("esp"), Operand::reg("ebp"));
                self.op1(Op::Pop, Operand::reg("ebp"));
                self.op0(Op::Ret);
                self.raw(format!("pr_{} endp\n", name));
            }
            SymbolKind::TypeAlias { .. } => {}
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn gen_stmt(&mut self, stmt: &'a Stmt) {
        match stmt {
            Stmt::Block(body) => {
                for s in body {
                    self.gen_stmt(s);
                }
            }
            Stmt::Expr(e) => {
                self.gen_expr(e);
                // A statement discards whatever its expression left behind.
                let leftover = e.result_size(self.arena());
                if leftover > 0 {
                    self.op2(Op::Add, Operand::reg("esp"), Operand::imm(leftover));
                }
            }
            Stmt::While { cond, body } => self.gen_while(cond, body),
            Stmt::Repeat { cond, body } => self.gen_repeat(cond, body),
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            } => self.gen_if(cond, then_branch, else_branch),
            Stmt::For {
                control,
                limit,
                down,
                body,
            } => self.gen_for(control, limit, *down, body),
            Stmt::Break => {
                if let Some((_, end)) = &self.loop_ctx {
                    let end = end.clone();
                    self.op1(Op::Jmp, Operand::label(end));
                }
            }
            Stmt::Continue => {
                if let Some((begin, _)) = &self.loop_ctx {
                    let begin = begin.clone();
                    self.op1(Op::Jmp, Operand::label(begin));
                }
            }
            Stmt::Write { args, newline } => self.gen_write(args, *newline),
            // read/readln parse and type-check only; no runtime support.
            Stmt::Read { .. } | Stmt::Empty => {}
        }
    }

    /// `pop eax; test al, al`, the conditional-jump preamble.
    fn pop_test(&mut self) {
        self.op1(Op::Pop, Operand::reg("eax"));
        self.op2(Op::Test, Operand::reg("al"), Operand::reg("al"));
    }

    fn gen_while(&mut self, cond: &'a Expr, body: &'a Stmt) {
        let begin = self.new_label();
        let end = self.new_label();
        self.push(Instr::Label(begin.clone()));
        let saved = self.loop_ctx.replace((begin.clone(), end.clone()));

        self.gen_expr(cond);
        self.pop_test();
        self.op1(Op::Jz, Operand::label(end.clone()));
        self.gen_stmt(body);
        self.op1(Op::Jmp, Operand::label(begin));
        self.push(Instr::Label(end));

        self.loop_ctx = saved;
    }

    fn gen_repeat(&mut self, cond: &'a Expr, body: &'a Stmt) {
        let begin = self.new_label();
        let condition = self.new_label();
        let end = self.new_label();
        self.push(Instr::Label(begin.clone()));
        let saved = self.loop_ctx.replace((begin.clone(), end.clone()));

        self.gen_stmt(body);
        self.push(Instr::Label(condition));
        self.gen_expr(cond);
        self.pop_test();
        // Loop back while the exit condition is still false.
        self.op1(Op::Jz, Operand::label(begin));
        self.push(Instr::Label(end));

        self.loop_ctx = saved;
    }

    fn gen_if(&mut self, cond: &'a Expr, then_branch: &'a Stmt, else_branch: &'a Stmt) {
        self.gen_expr(cond);
        let label_else = self.new_label();
        let label_exit = self.new_label();
        self.pop_test();
        self.op1(Op::Jz, Operand::label(label_else.clone()));
        self.gen_stmt(then_branch);
        self.op1(Op::Jmp, Operand::label(label_exit.clone()));
        self.push(Instr::Label(label_else));
        self.gen_stmt(else_branch);
        self.push(Instr::Label(label_exit));
    }

    /// `for` keeps two hidden slots on the stack: the final value and the
    /// loop variable's address. The counter is re-read through the saved
    /// address each iteration and incremented or decremented in place.
    fn gen_for(&mut self, control: &'a Expr, limit: &'a Expr, down: bool, body: &'a Stmt) {
        let begin = self.new_label();
        let end = self.new_label();
        let condition = self.new_label();
        let iter = self.new_label();

        self.gen_expr(limit);
        // The initial assignment leaves the target address in esi.
        self.gen_expr(control);
        self.op1(Op::Push, Operand::reg("esi"));
        self.op1(Op::Jmp, Operand::label(condition.clone()));

        let saved = self.loop_ctx.replace((iter.clone(), end.clone()));
        self.push(Instr::Label(begin.clone()));
        self.gen_stmt(body);

        self.push(Instr::Label(iter));
        self.op2(Op::Mov, Operand::reg("esi"), Operand::mem("[esp]"));
        let step = if down { Op::Dec } else { Op::Inc };
        self.op1(step, Operand::mem("dword ptr [esi]"));

        self.push(Instr::Label(condition));
        self.op2(
            Op::Mov,
            Operand::reg("eax"),
            Operand::mem("dword ptr [esi]"),
        );
        self.op2(
            Op::Cmp,
            Operand::reg("eax"),
            Operand::mem("dword ptr [esp + 4]"),
        );
        let back = if down { Op::Jge } else { Op::Jle };
        self.op1(back, Operand::label(begin));

        self.push(Instr::Label(end));
        self.op2(Op::Add, Operand::reg("esp"), Operand::imm(8));

        self.loop_ctx = saved;
    }

    fn gen_write(&mut self, args: &'a [Expr], newline: bool) {
        for arg in args {
            let ty = arg.ty(self.arena()).expect("write arguments are scalar");
            if self.is_int(ty) {
                if let Some(name) = self.global_scalar_name(arg) {
                    self.op1(
                        Op::Call,
                        Operand::mem(format!("printf, offset int_frmt, v_{}", name)),
                    );
                    self.op2(Op::Add, Operand::reg("esp"), Operand::imm(8));
                } else {
                    self.gen_expr(arg);
                    if arg.is_string() {
                        self.op1(Op::Call, Operand::mem("printf, esi"));
                        self.op2(Op::Add, Operand::reg("esp"), Operand::imm(4));
                    } else {
                        self.op1(Op::Pop, Operand::reg("eax"));
                        self.op1(
                            Op::Call,
                            Operand::mem("printf, offset int_frmt, eax"),
                        );
                        self.op2(Op::Add, Operand::reg("esp"), Operand::imm(8));
                    }
                }
            } else {
                if let Some(name) = self.global_scalar_name(arg) {
                    self.op1(
                        Op::Call,
                        Operand::mem(format!("printf, offset double_frmt, v_{}", name)),
                    );
                } else {
                    // Spill the computed value through the shared buffer.
                    self.gen_expr(arg);
                    self.op2(
                        Op::Mov,
                        Operand::reg("eax"),
                        Operand::imm("offset double_buff"),
                    );
                    self.op1(Op::Pop, Operand::mem("dword ptr [eax]"));
                    self.op1(Op::Pop, Operand::mem("dword ptr [eax + 4]"));
                    self.op1(
                        Op::Call,
                        Operand::mem("printf, offset double_frmt, double_buff"),
                    );
                }
                self.op2(Op::Add, Operand::reg("esp"), Operand::imm(12));
            }
        }
        if newline {
            self.op1(Op::Call, Operand::mem("printf, offset new_line"));
            self.op2(Op::Add, Operand::reg("esp"), Operand::imm(4));
        }
    }

    /// Name of a plain global scalar variable reference; those print straight
    /// from their data label without evaluation.
    fn global_scalar_name(&self, arg: &Expr) -> Option<String> {
        if let Expr::Var { name, sym, .. } = arg {
            if let SymbolKind::Var { global: true, .. } = self.arena().sym(*sym).kind {
                return Some(name.clone());
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Expressions: values
    // ------------------------------------------------------------------

    fn gen_expr(&mut self, expr: &'a Expr) {
        match expr {
            Expr::IntLit { value } => self.op1(Op::Push, Operand::imm(value)),
            Expr::DoubleLit { num, .. } => {
                self.op1(Op::Push, Operand::mem(format!("qword ptr dc_{}", num)));
            }
            Expr::StringLit { num, .. } => {
                self.op2(
                    Op::Mov,
                    Operand::reg("esi"),
                    Operand::mem(format!("offset s_{}", num)),
                );
            }
            Expr::Var { ty, .. } => {
                self.gen_addr(expr);
                self.load_value(*ty);
            }
            Expr::ArrayAccess { elem_ty, .. } => {
                self.gen_addr(expr);
                self.load_value(*elem_ty);
            }
            Expr::RecordField { ty, .. } => {
                self.gen_addr(expr);
                self.load_value(*ty);
            }
            Expr::Unary { op, ty, operand } => self.gen_unary(op.kind, *ty, operand),
            Expr::Binary {
                op,
                ty,
                left,
                right,
                ..
            } => self.gen_binary(op.kind, *ty, left, right),
            Expr::Call { name, proc, args } => self.gen_call(name, *proc, args),
            Expr::Empty => {}
        }
    }

    /// Pop an address into esi and push the value found there: a scalar load,
    /// or fresh stack space block-copied for an aggregate.
    fn load_value(&mut self, ty: TypeId) {
        self.op1(Op::Pop, Operand::reg("esi"));
        if self.is_int(ty) {
            self.op1(Op::Push, Operand::mem("dword ptr [esi]"));
        } else if self.is_double(ty) {
            self.op1(Op::Push, Operand::mem("qword ptr [esi]"));
        } else {
            let size = self.arena().size_of(ty);
            let count = self.arena().flat_count(ty);
            self.op2(Op::Sub, Operand::reg("esp"), Operand::imm(size));
            self.op2(Op::Mov, Operand::reg("edi"), Operand::reg("esp"));
            self.op2(Op::Mov, Operand::reg("ecx"), Operand::imm(count));
            self.op0(Op::RepMovsd);
        }
    }

    fn gen_unary(&mut self, op: TokenKind, ty: TypeId, operand: &'a Expr) {
        self.gen_expr(operand);
        if self.is_int(ty) {
            match op {
                TokenKind::Plus => {}
                TokenKind::Minus => {
                    self.op1(Op::Pop, Operand::reg("eax"));
                    self.op1(Op::Neg, Operand::reg("eax"));
                    self.op1(Op::Push, Operand::reg("eax"));
                }
                _ => {
                    self.op1(Op::Pop, Operand::reg("eax"));
                    self.op2(Op::Test, Operand::reg("al"), Operand::reg("al"));
                    self.op1(Op::Setz, Operand::reg("al"));
                    self.op2(Op::And, Operand::reg("eax"), Operand::imm(1));
                    self.op1(Op::Push, Operand::reg("eax"));
                }
            }
        } else {
            self.op1(Op::Fld, Operand::mem("qword ptr [esp]"));
            match op {
                TokenKind::Plus => self.op0(Op::Fabs),
                _ => self.op0(Op::Fchs),
            }
            self.op1(Op::Fstp, Operand::mem("qword ptr [esp]"));
        }
    }

    fn gen_binary(&mut self, op: TokenKind, ty: TypeId, left: &'a Expr, right: &'a Expr) {
        use TokenKind::*;
        match op {
            Assign => self.gen_assign(ty, left, right),
            LessEqual | GreaterEqual | Equal | NotEqual | Greater | Less => {
                self.gen_comparison(op, ty, left, right);
            }
            _ => {
                if self.is_int(ty) {
                    self.gen_int_arith(op, left, right);
                } else {
                    self.gen_double_arith(op, left, right);
                }
            }
        }
    }

    fn gen_assign(&mut self, ty: TypeId, left: &'a Expr, right: &'a Expr) {
        self.gen_expr(right);
        self.gen_addr(left);
        if self.is_int(ty) {
            self.op1(Op::Pop, Operand::reg("esi"));
            self.op1(Op::Pop, Operand::mem("dword ptr [esi]"));
        } else if self.is_double(ty) {
            self.op1(Op::Pop, Operand::reg("esi"));
            if self.expr_is_int(right) {
                self.op1(Op::Fild, Operand::mem("dword ptr [esp]"));
                self.op2(Op::Add, Operand::reg("esp"), Operand::imm(4));
            } else {
                self.op1(Op::Fld, Operand::mem("qword ptr [esp]"));
                self.op2(Op::Add, Operand::reg("esp"), Operand::imm(8));
            }
            self.op1(Op::Fstp, Operand::mem("qword ptr [esi]"));
        } else {
            // Aggregate: the value sits on the stack, the target address on
            // top of it.
            let size = self.arena().size_of(ty);
            let count = self.arena().flat_count(ty);
            self.op1(Op::Pop, Operand::reg("edi"));
            self.op2(Op::Mov, Operand::reg("esi"), Operand::reg("esp"));
            self.op2(Op::Mov, Operand::reg("ecx"), Operand::imm(count));
            self.op0(Op::RepMovsd);
            self.op2(Op::Add, Operand::reg("esp"), Operand::imm(size));
        }
    }

    fn gen_comparison(&mut self, op: TokenKind, ty: TypeId, left: &'a Expr, right: &'a Expr) {
        self.gen_expr(left);
        self.gen_expr(right);
        if self.is_int(ty) {
            self.op1(Op::Pop, Operand::reg("eax"));
            self.op1(Op::Pop, Operand::reg("ecx"));
            self.op2(Op::Cmp, Operand::reg("ecx"), Operand::reg("eax"));
            self.op1(self.setcc(op, false), Operand::reg("al"));
        } else {
            // x87 pops both operands; integer operands widen through fild.
            // The right operand is on top.
            self.fpu_load_top(right);
            self.fpu_load_top(left);
            self.op0(Op::Fcompp);
            self.op1(Op::Fstsw, Operand::reg("ax"));
            self.op0(Op::Sahf);
            self.op1(self.setcc(op, true), Operand::reg("al"));
        }
        self.op2(Op::And, Operand::reg("eax"), Operand::imm(1));
        self.op1(Op::Push, Operand::reg("eax"));
    }

    /// Load the stack-top operand onto the FPU stack and release its slot.
    fn fpu_load_top(&mut self, operand: &Expr) {
        if self.expr_is_int(operand) {
            self.op1(Op::Fild, Operand::mem("dword ptr [esp]"));
            self.op2(Op::Add, Operand::reg("esp"), Operand::imm(4));
        } else {
            self.op1(Op::Fld, Operand::mem("qword ptr [esp]"));
            self.op2(Op::Add, Operand::reg("esp"), Operand::imm(8));
        }
    }

    /// setcc for the comparison: signed forms after integer `cmp`, unsigned
    /// forms after `fcompp`/`sahf` (the x87 flags land in CF/ZF).
    fn setcc(&self, op: TokenKind, unsigned: bool) -> Op {
        match op {
            TokenKind::LessEqual => {
                if unsigned {
                    Op::Setbe
                } else {
                    Op::Setle
                }
            }
            TokenKind::GreaterEqual => {
                if unsigned {
                    Op::Setae
                } else {
                    Op::Setge
                }
            }
            TokenKind::Equal => Op::Sete,
            TokenKind::NotEqual => Op::Setne,
            TokenKind::Greater => {
                if unsigned {
                    Op::Seta
                } else {
                    Op::Setg
                }
            }
            _ => {
                if unsigned {
                    Op::Setb
                } else {
                    Op::Setl
                }
            }
        }
    }

    fn gen_int_arith(&mut self, op: TokenKind, left: &'a Expr, right: &'a Expr) {
        use TokenKind::*;
        // Multiplication and division by a constant power of two reduce to
        // shifts; the right operand is then never materialized.
        let mut shift = None;
        if matches!(op, Star | Slash | Div) {
            if let Some(v) = right.const_int() {
                if v > 0 && (v & (v - 1)) == 0 {
                    shift = Some(v.trailing_zeros());
                }
            }
        }
        if shift.is_none() {
            self.gen_expr(right);
        }
        self.gen_expr(left);
        self.op1(Op::Pop, Operand::reg("eax"));
        if shift.is_none() {
            self.op1(Op::Pop, Operand::reg("ecx"));
        }
        let mut result = Operand::reg("eax");
        match op {
            Plus => self.op2(Op::Add, Operand::reg("eax"), Operand::reg("ecx")),
            Minus => self.op2(Op::Sub, Operand::reg("eax"), Operand::reg("ecx")),
            Star => match shift {
                Some(k) => self.op2(Op::Sal, Operand::reg("eax"), Operand::imm(k)),
                None => self.op1(Op::Mul, Operand::reg("ecx")),
            },
            Slash | Div => match shift {
                Some(k) => self.op2(Op::Sar, Operand::reg("eax"), Operand::imm(k)),
                None => {
                    self.op0(Op::Cdq);
                    self.op1(Op::Idiv, Operand::reg("ecx"));
                }
            },
            Mod => {
                self.op0(Op::Cdq);
                self.op1(Op::Idiv, Operand::reg("ecx"));
                result = Operand::reg("edx");
            }
            Or => self.op2(Op::Or, Operand::reg("eax"), Operand::reg("ecx")),
            Xor => self.op2(Op::Xor, Operand::reg("eax"), Operand::reg("ecx")),
            _ => self.op2(Op::And, Operand::reg("eax"), Operand::reg("ecx")),
        }
        self.op1(Op::Push, result);
    }

    fn gen_double_arith(&mut self, op: TokenKind, left: &'a Expr, right: &'a Expr) {
        let fpu_op = match op {
            TokenKind::Plus => Op::Faddp,
            TokenKind::Minus => Op::Fsubp,
            TokenKind::Star => Op::Fmulp,
            _ => Op::Fdivp,
        };
        self.gen_expr(right);
        self.gen_expr(left);
        if !self.expr_is_int(left) && !self.expr_is_int(right) {
            // Both operands are doubles: compute into the right operand's
            // stack slot.
            self.op1(Op::Fld, Operand::mem("qword ptr [esp]"));
            self.op2(Op::Add, Operand::reg("esp"), Operand::imm(8));
            self.op1(Op::Fld, Operand::mem("qword ptr [esp]"));
            self.op0(fpu_op);
            self.op1(Op::Fstp, Operand::mem("qword ptr [esp]"));
        } else {
            // Mixed operands: widen the integer side, then allocate a fresh
            // result slot.
            self.fpu_load_top(left);
            self.fpu_load_top(right);
            self.op0(fpu_op);
            self.op2(Op::Sub, Operand::reg("esp"), Operand::imm(8));
            self.op1(Op::Fstp, Operand::mem("qword ptr [esp]"));
        }
    }

    fn gen_call(&mut self, name: &str, proc: crate::symbol::SymbolId, args: &'a [Expr]) {
        let arena = self.arena();
        let params = match &arena.sym(proc).kind {
            SymbolKind::Proc { params, .. } => params.clone(),
            _ => Vec::new(),
        };
        let ret_size = arena.ret_size(proc);
        let args_size = arena.args_size(proc);

        // Return slot first, then arguments in source order.
        self.op2(Op::Sub, Operand::reg("esp"), Operand::imm(ret_size));
        for (param, arg) in params.iter().zip(args) {
            let (pty, by_ref) = match self.arena().sym(*param).kind {
                SymbolKind::Var { ty, by_ref, .. } => (ty, by_ref),
                _ => continue,
            };
            if by_ref {
                self.gen_addr(arg);
            } else {
                self.gen_expr(arg);
                if self.is_double(pty) && self.expr_is_int(arg) {
                    // Widen an integer argument into the double-sized slot.
                    self.op1(Op::Fild, Operand::mem("dword ptr [esp]"));
                    self.op2(Op::Add, Operand::reg("esp"), Operand::imm(4));
                    self.op2(Op::Sub, Operand::reg("esp"), Operand::imm(8));
                    self.op1(Op::Fstp, Operand::mem("qword ptr [esp]"));
                }
            }
        }
        self.op1(Op::Call, Operand::mem(format!("pr_{}", name)));
        self.op2(Op::Add, Operand::reg("esp"), Operand::imm(args_size));
    }

    // ------------------------------------------------------------------
    // Expressions: addresses
    // ------------------------------------------------------------------

    /// Push the address of an l-value expression.
    fn gen_addr(&mut self, expr: &'a Expr) {
        match expr {
            Expr::Var { name, sym, .. } => {
                let (global, by_ref, offset) = match self.arena().sym(*sym).kind {
                    SymbolKind::Var {
                        global,
                        by_ref,
                        offset,
                        ..
                    } => (global, by_ref, offset),
                    _ => return,
                };
                if global {
                    self.op1(Op::Push, Operand::mem(format!("offset v_{}", name)));
                } else {
                    let slot = format!("[{} + ebp]", offset);
                    if by_ref {
                        // The parameter slot holds the address itself.
                        self.op2(Op::Mov, Operand::reg("esi"), Operand::mem(slot));
                    } else {
                        self.op2(Op::Lea, Operand::reg("esi"), Operand::mem(slot));
                    }
                    self.op1(Op::Push, Operand::reg("esi"));
                }
            }
            Expr::ArrayAccess {
                base,
                indexes,
                array_ty,
                ..
            } => {
                self.gen_addr(base);
                for index in indexes {
                    self.gen_expr(index);
                }
                // Collapse the 1-based indexes into a byte displacement:
                // sum of (index_k - 1) * stride_k, innermost popped first.
                self.op2(Op::Xor, Operand::reg("esi"), Operand::reg("esi"));
                for k in (1..=indexes.len()).rev() {
                    let stride = self.arena().element_size(*array_ty, k);
                    self.op1(Op::Pop, Operand::reg("eax"));
                    self.op2(Op::Sub, Operand::reg("eax"), Operand::imm(1));
                    self.op2(Op::Imul, Operand::reg("eax"), Operand::imm(stride));
                    self.op2(Op::Add, Operand::reg("esi"), Operand::reg("eax"));
                }
                self.op1(Op::Pop, Operand::reg("edi"));
                self.op2(Op::Add, Operand::reg("esi"), Operand::reg("edi"));
                self.op1(Op::Push, Operand::reg("esi"));
            }
            Expr::RecordField { base, field, .. } => {
                let offset = match self.arena().sym(*field).kind {
                    SymbolKind::Var { offset, .. } => offset,
                    _ => 0,
                };
                self.gen_addr(base);
                self.op1(Op::Pop, Operand::reg("esi"));
                self.op2(Op::Add, Operand::reg("esi"), Operand::imm(offset));
                self.op1(Op::Push, Operand::reg("esi"));
            }
            // The parser only hands l-values to address generation.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::render_all;
    use crate::parser::Parser;

    fn asm(source: &str) -> String {
        let program = Parser::new(source).parse().unwrap();
        render_all(&generate(&program, "source"))
    }

    #[test]
    fn test_folded_arithmetic_emits_single_immediate() {
        let out = asm("var a : integer;\nbegin a := 2 + 3 * 4 end.");
        assert!(out.contains("\tpush\t14\n"));
        assert!(!out.contains("mul"));
    }

    #[test]
    fn test_power_of_two_multiply_becomes_shift() {
        let out = asm("var a, b : integer; begin b := 5; a := b * 8 end.");
        assert!(out.contains("\tsal\teax, 3\n"));
        assert!(!out.contains("mul"));
    }

    #[test]
    fn test_power_of_two_divide_becomes_shift() {
        let out = asm("var a, b : integer; begin b := 40; a := b div 4 end.");
        assert!(out.contains("\tsar\teax, 2\n"));
        assert!(!out.contains("idiv"));
    }

    #[test]
    fn test_multiply_by_zero_is_not_strength_reduced() {
        let out = asm("var a, b : integer; begin b := 5; a := b * 0 end.");
        assert!(out.contains("\tmul\tecx\n"));
        assert!(!out.contains("sal"));
    }

    #[test]
    fn test_mixed_constant_fold_avoids_fpu() {
        let out = asm("var x : double; begin x := 1 + 2.5 end.");
        assert!(out.contains("\tdc_1 dq 3.5\n"));
        assert!(!out.contains("faddp"));
    }

    #[test]
    fn test_program_frame() {
        let out = asm("begin end.");
        assert!(out.starts_with("include source\\start.inc\n"));
        assert!(out.contains("include source\\end.inc\n"));
        assert!(out.contains("\tint_frmt db '%d', 0\n"));
        assert!(out.contains("\tdouble_buff dq 0.0\n"));
        assert!(out.ends_with("end start"));
    }

    #[test]
    fn test_unused_global_is_elided() {
        let out = asm("var a, b : integer; begin a := 1 end.");
        assert!(out.contains("\tv_a dd ?\n"));
        assert!(!out.contains("v_b"));
    }

    #[test]
    fn test_unused_procedure_is_elided() {
        let out = asm("procedure unused; begin end;\nvar a : integer;\nbegin a := 1 end.");
        assert!(!out.contains("pr_unused"));
    }

    #[test]
    fn test_procedure_frame() {
        let out = asm(
            "procedure p;\nvar x : double;\nbegin x := 1.5 end;\nbegin p end.",
        );
        assert!(out.contains("\npr_p proc near\n"));
        assert!(out.contains("\tpush\tebp\n\tmov\tebp, esp\n\tsub\tesp, 8\n"));
        assert!(out.contains("\tmov\tesp, ebp\n\tpop\tebp\n\tret\n"));
        assert!(out.contains("pr_p endp\n"));
        assert!(out.contains("\tcall\tpr_p\n"));
    }

    #[test]
    fn test_by_ref_parameter_loads_stored_address() {
        let out = asm(
            "procedure p(var x : integer);\nbegin x := 1 end;\nvar a : integer;\nbegin p(a) end.",
        );
        assert!(out.contains("\tmov\tesi, [8 + ebp]\n"));
        // The caller passes the address of the global.
        assert!(out.contains("\tpush\toffset v_a\n"));
    }

    #[test]
    fn test_local_variable_address() {
        let out = asm("procedure p;\nvar x : integer;\nbegin x := 1 end;\nbegin p end.");
        assert!(out.contains("\tlea\tesi, [-4 + ebp]\n"));
    }

    #[test]
    fn test_while_shape() {
        let out = asm("var a : integer; begin while a < 3 do a := a + 1 end.");
        assert!(out.contains("l_0:\n"));
        assert!(out.contains("\tjz\tl_1\n"));
        assert!(out.contains("\tjmp\tl_0\n"));
        assert!(out.contains("l_1:\n"));
    }

    #[test]
    fn test_repeat_loops_back_while_condition_false() {
        let out = asm("var a : integer; begin repeat a := a + 1 until a > 3 end.");
        // begin, condition, end labels in allocation order.
        assert!(out.contains("l_0:\n"));
        assert!(out.contains("l_1:\n"));
        assert!(out.contains("\tjz\tl_0\n"));
    }

    #[test]
    fn test_break_targets_innermost_loop() {
        let out = asm(
            "var i, j : integer;\nbegin\n  for i := 1 to 3 do\n    for j := 1 to 3 do\n      if j = 2 then break;\nend.",
        );
        // Outer for takes l_0..l_3, inner for l_4..l_7; its end label is l_5.
        assert!(out.contains("\tjmp\tl_5\n"));
        assert!(!out.contains("\tjmp\tl_1\n"));
    }

    #[test]
    fn test_continue_targets_iteration_label() {
        let out = asm(
            "var i : integer;\nbegin for i := 1 to 3 do begin continue end end.",
        );
        // for allocates begin l_0, end l_1, condition l_2, iteration l_3.
        assert!(out.contains("\tjmp\tl_3\n"));
    }

    #[test]
    fn test_break_outside_loop_emits_nothing() {
        let out = asm("begin break end.");
        assert!(!out.contains("jmp"));
    }

    #[test]
    fn test_for_keeps_limit_and_address_slots() {
        let out = asm("var i : integer; begin for i := 1 to 3 do i := i end.");
        assert!(out.contains("\tcmp\teax, dword ptr [esp + 4]\n"));
        assert!(out.contains("\tinc\tdword ptr [esi]\n"));
        assert!(out.contains("\tadd\tesp, 8\n"));
    }

    #[test]
    fn test_downto_decrements_and_jge() {
        let out = asm("var i : integer; begin for i := 3 downto 1 do i := i end.");
        assert!(out.contains("\tdec\tdword ptr [esi]\n"));
        assert!(out.contains("\tjge\tl_0\n"));
    }

    #[test]
    fn test_statically_empty_for_emits_no_loop() {
        let out = asm("var i : integer; begin for i := 3 to 1 do i := 9 end.");
        assert!(!out.contains("jle"));
        assert!(!out.contains("push\t9"));
    }

    #[test]
    fn test_write_global_int_prints_directly() {
        let out = asm("var a : integer; begin a := 1; write(a) end.");
        assert!(out.contains("\tcall\tprintf, offset int_frmt, v_a\n"));
    }

    #[test]
    fn test_write_expression_pops_into_eax() {
        let out = asm("var a : integer; begin a := 1; write(a + 1) end.");
        assert!(out.contains("\tcall\tprintf, offset int_frmt, eax\n"));
    }

    #[test]
    fn test_write_string_goes_through_esi() {
        let out = asm("begin writeln('hi') end.");
        assert!(out.contains("\tmov\tesi, offset s_1\n"));
        assert!(out.contains("\tcall\tprintf, esi\n"));
        assert!(out.contains("\ts_1 db 'hi', 0\n"));
        assert!(out.contains("\tcall\tprintf, offset new_line\n"));
    }

    #[test]
    fn test_write_computed_double_spills_through_buffer() {
        let out = asm("var x : double; begin x := 1.5; write(x + x) end.");
        assert!(out.contains("\tmov\teax, offset double_buff\n"));
        assert!(out.contains("\tcall\tprintf, offset double_frmt, double_buff\n"));
    }

    #[test]
    fn test_array_indexing_collapses_displacement() {
        let out = asm(
            "var a : array[2] of array[3] of integer;\nbegin a[1, 2] := 7 end.",
        );
        // Inner index scaled by 4, outer by the 12-byte row stride.
        assert!(out.contains("\timul\teax, 4\n"));
        assert!(out.contains("\timul\teax, 12\n"));
        assert!(out.contains("\tv_a db 24 dup(?)\n"));
    }

    #[test]
    fn test_record_field_adds_offset() {
        let out = asm(
            "type point = record x : integer; y : double end;\nvar p : point;\nbegin p.y := 1.5 end.",
        );
        assert!(out.contains("\tadd\tesi, 4\n"));
        assert!(out.contains("\tv_p db 12 dup(?)\n"));
    }

    #[test]
    fn test_aggregate_assignment_block_copies() {
        let out = asm(
            "var a, b : array[3] of integer;\nbegin a := b end.",
        );
        assert!(out.contains("\trep movsd\n"));
        assert!(out.contains("\tmov\tecx, 3\n"));
    }

    #[test]
    fn test_double_array_copy_counts_two_slots_each() {
        let out = asm("var a, b : array[3] of double;\nbegin a := b end.");
        assert!(out.contains("\tmov\tecx, 6\n"));
    }

    #[test]
    fn test_function_call_allocates_return_slot() {
        let out = asm(
            "function f(n : integer) : integer;\nbegin f := n end;\nvar a : integer;\nbegin a := f(3) end.",
        );
        assert!(out.contains("\tsub\tesp, 4\n"));
        assert!(out.contains("\tcall\tpr_f\n"));
        assert!(out.contains("\tadd\tesp, 4\n"));
    }

    #[test]
    fn test_statement_call_discards_return_slot() {
        let out = asm(
            "function f : integer;\nbegin f := 1 end;\nbegin f end.",
        );
        // Return slot allocated, arguments cleaned, then the abandoned
        // 4-byte result released.
        let calls = out.matches("\tcall\tpr_f\n").count();
        assert_eq!(calls, 1);
        assert!(out.contains("\tadd\tesp, 4\n"));
    }

    #[test]
    fn test_int_argument_widens_into_double_parameter() {
        let out = asm(
            "procedure p(x : double);\nbegin end;\nbegin p(3) end.",
        );
        assert!(out.contains("\tfild\tdword ptr [esp]\n"));
        assert!(out.contains("\tfstp\tqword ptr [esp]\n"));
    }

    #[test]
    fn test_double_comparison_uses_unsigned_setcc() {
        let out = asm(
            "var x, y : double; var a : integer;\nbegin x := 1.5; y := 2.5; a := (x < y) end.",
        );
        assert!(out.contains("\tfcompp\n"));
        assert!(out.contains("\tfstsw\tax\n"));
        assert!(out.contains("\tsahf\n"));
        assert!(out.contains("\tsetb\tal\n"));
        assert!(!out.contains("\tsetl\tal\n"));
    }

    #[test]
    fn test_int_comparison_uses_signed_setcc() {
        let out = asm("var a, b : integer; begin a := 1; b := (a < 2) end.");
        assert!(out.contains("\tcmp\tecx, eax\n"));
        assert!(out.contains("\tsetl\tal\n"));
    }

    #[test]
    fn test_integer_mod_keeps_edx() {
        let out = asm("var a : integer; begin a := a mod 3 end.");
        assert!(out.contains("\tcdq\n"));
        assert!(out.contains("\tidiv\tecx\n"));
        assert!(out.contains("\tpush\tedx\n"));
    }

    #[test]
    fn test_double_arithmetic_uses_paired_pop_forms() {
        let out = asm("var x, y : double; begin x := 1.5; y := x / x end.");
        assert!(out.contains("\tfdivp\n"));
    }

    #[test]
    fn test_mixed_double_arithmetic_widens_integer_operand() {
        let out = asm("var x : double; var n : integer;\nbegin n := 2; x := x + n end.");
        assert!(out.contains("\tfild\tdword ptr [esp]\n"));
        assert!(out.contains("\tfaddp\n"));
    }

    #[test]
    fn test_read_emits_nothing() {
        let out = asm("var a : integer; begin a := 1; readln(a) end.");
        assert!(!out.contains("scanf"));
        // Only the assignment's value handling appears; readln is silent.
        assert!(!out.contains("read"));
    }
}
