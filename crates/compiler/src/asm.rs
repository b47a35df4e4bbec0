//! x86 instruction and operand model
//!
//! The generator produces a linear list of [`Instr`] values; the peephole
//! optimizer rewrites that list and the writer serializes it to Intel/MASM
//! text, one instruction per line with a leading tab.
//!
//! Besides real instructions the list carries three meta-entries: label
//! definitions, verbatim text (include directives, procedure frames, the data
//! prelude) and constant declarations (`dc_N dq ...` / `s_N db ...`), which
//! the optimizer deduplicates.

use std::fmt::Write as _;

/// Opcodes the generator emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Push,
    Pop,
    Add,
    Sub,
    Mul,
    Mov,
    Idiv,
    Ret,
    Faddp,
    Fsubp,
    Fdivp,
    Fmulp,
    Fabs,
    Fchs,
    Fstp,
    Fld,
    Fild,
    Jz,
    Jnz,
    Jne,
    Jg,
    Jge,
    Jl,
    Jle,
    Je,
    Jmp,
    Test,
    Fstsw,
    Lea,
    Call,
    Cmp,
    RepMovsd,
    Or,
    Xor,
    And,
    Imul,
    Neg,
    Inc,
    Dec,
    Fcompp,
    Sahf,
    Setg,
    Setl,
    Sete,
    Setne,
    Setle,
    Setge,
    Seta,
    Setb,
    Setae,
    Setbe,
    Setz,
    Cdq,
    Sal,
    Sar,
}

impl Op {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Push => "push",
            Op::Pop => "pop",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Mov => "mov",
            Op::Idiv => "idiv",
            Op::Ret => "ret",
            Op::Faddp => "faddp",
            Op::Fsubp => "fsubp",
            Op::Fdivp => "fdivp",
            Op::Fmulp => "fmulp",
            Op::Fabs => "fabs",
            Op::Fchs => "fchs",
            Op::Fstp => "fstp",
            Op::Fld => "fld",
            Op::Fild => "fild",
            Op::Jz => "jz",
            Op::Jnz => "jnz",
            Op::Jne => "jne",
            Op::Jg => "jg",
            Op::Jge => "jge",
            Op::Jl => "jl",
            Op::Jle => "jle",
            Op::Je => "je",
            Op::Jmp => "jmp",
            Op::Test => "test",
            Op::Fstsw => "fstsw",
            Op::Lea => "lea",
            Op::Call => "call",
            Op::Cmp => "cmp",
            Op::RepMovsd => "rep movsd",
            Op::Or => "or",
            Op::Xor => "xor",
            Op::And => "and",
            Op::Imul => "imul",
            Op::Neg => "neg",
            Op::Inc => "inc",
            Op::Dec => "dec",
            Op::Fcompp => "fcompp",
            Op::Sahf => "sahf",
            Op::Setg => "setg",
            Op::Setl => "setl",
            Op::Sete => "sete",
            Op::Setne => "setne",
            Op::Setle => "setle",
            Op::Setge => "setge",
            Op::Seta => "seta",
            Op::Setb => "setb",
            Op::Setae => "setae",
            Op::Setbe => "setbe",
            Op::Setz => "setz",
            Op::Cdq => "cdq",
            Op::Sal => "sal",
            Op::Sar => "sar",
        }
    }

    /// Instructions whose first operand is a jump target; label renames apply
    /// to these.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Op::Jz | Op::Jnz | Op::Jne | Op::Jg | Op::Jge | Op::Jl | Op::Jle | Op::Je | Op::Jmp
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Register,
    Memory,
    Immediate,
    Label,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub text: String,
}

impl Operand {
    pub fn none() -> Self {
        Operand {
            kind: OperandKind::None,
            text: String::new(),
        }
    }

    pub fn reg(name: impl Into<String>) -> Self {
        Operand {
            kind: OperandKind::Register,
            text: name.into(),
        }
    }

    pub fn mem(text: impl Into<String>) -> Self {
        Operand {
            kind: OperandKind::Memory,
            text: text.into(),
        }
    }

    pub fn imm(value: impl std::fmt::Display) -> Self {
        Operand {
            kind: OperandKind::Immediate,
            text: value.to_string(),
        }
    }

    pub fn label(name: impl Into<String>) -> Self {
        Operand {
            kind: OperandKind::Label,
            text: name.into(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == OperandKind::None
    }

    pub fn is_reg(&self) -> bool {
        self.kind == OperandKind::Register
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Op { op: Op, a: Operand, b: Operand },
    /// Label definition: renders as `name:`.
    Label(String),
    /// Verbatim output text.
    Raw(String),
    /// Data constant: renders as `\tname directive`.
    ConstDecl { name: String, directive: String },
}

impl Instr {
    pub fn op0(op: Op) -> Self {
        Instr::Op {
            op,
            a: Operand::none(),
            b: Operand::none(),
        }
    }

    pub fn op1(op: Op, a: Operand) -> Self {
        Instr::Op {
            op,
            a,
            b: Operand::none(),
        }
    }

    pub fn op2(op: Op, a: Operand, b: Operand) -> Self {
        Instr::Op { op, a, b }
    }

    pub fn render(&self, out: &mut String) {
        match self {
            Instr::Op { op, a, b } => {
                if a.is_none() {
                    let _ = writeln!(out, "\t{}", op.mnemonic());
                } else if b.is_none() {
                    let _ = writeln!(out, "\t{}\t{}", op.mnemonic(), a.text);
                } else {
                    let _ = writeln!(out, "\t{}\t{}, {}", op.mnemonic(), a.text, b.text);
                }
            }
            Instr::Label(name) => {
                let _ = writeln!(out, "{}:", name);
            }
            Instr::Raw(text) => out.push_str(text),
            Instr::ConstDecl { name, directive } => {
                let _ = writeln!(out, "\t{} {}", name, directive);
            }
        }
    }
}

/// Serialize a whole instruction list.
pub fn render_all(instrs: &[Instr]) -> String {
    let mut out = String::new();
    for instr in instrs {
        instr.render(&mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_two_operands() {
        let mut out = String::new();
        Instr::op2(Op::Mov, Operand::reg("eax"), Operand::reg("ecx")).render(&mut out);
        assert_eq!(out, "\tmov\teax, ecx\n");
    }

    #[test]
    fn test_render_one_and_zero_operands() {
        let mut out = String::new();
        Instr::op1(Op::Push, Operand::imm(14)).render(&mut out);
        Instr::op0(Op::Cdq).render(&mut out);
        assert_eq!(out, "\tpush\t14\n\tcdq\n");
    }

    #[test]
    fn test_render_label_and_const() {
        let mut out = String::new();
        Instr::Label("l_3".into()).render(&mut out);
        Instr::ConstDecl {
            name: "dc_1".into(),
            directive: "dq 3.5".into(),
        }
        .render(&mut out);
        assert_eq!(out, "l_3:\n\tdc_1 dq 3.5\n");
    }

    #[test]
    fn test_jump_classification() {
        assert!(Op::Jmp.is_jump());
        assert!(Op::Jz.is_jump());
        assert!(Op::Jle.is_jump());
        assert!(!Op::Call.is_jump());
        assert!(!Op::Setz.is_jump());
    }

    #[test]
    fn test_rep_movsd_renders_on_one_line() {
        let mut out = String::new();
        Instr::op0(Op::RepMovsd).render(&mut out);
        assert_eq!(out, "\trep movsd\n");
    }
}
