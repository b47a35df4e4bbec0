//! Peephole optimizer
//!
//! Slides a two-instruction window over the list and rewrites local patterns,
//! repeating whole passes until one finds nothing to do. A pure function of
//! the instruction list: all bookkeeping (label merges, constant
//! deduplication) lives in per-call state.
//!
//! Termination: every structural rewrite removes an instruction, a label or a
//! duplicate constant, and every rename moves a reference one step along a
//! merge chain that only ever shrinks, so a fixpoint is always reached.
//! Rules fire only on literally adjacent instructions; nothing is reordered
//! across unknown instructions.

use crate::asm::{Instr, Op, OperandKind};
use tracing::debug;

pub fn optimize(instrs: &mut Vec<Instr>) {
    let before = instrs.len();
    // Merged labels (removed -> kept) and deduplicated constants
    // (removed -> kept); both persist across passes so references written
    // before a merge still catch up with it.
    let mut label_renames: Vec<(String, String)> = Vec::new();
    let mut const_renames: Vec<(String, String)> = Vec::new();
    let mut passes = 0usize;

    loop {
        passes += 1;
        let mut changed = false;
        let mut i = 0;
        while i < instrs.len() {
            if apply_at(instrs, i, &mut label_renames, &mut const_renames) {
                changed = true;
                // Re-examine the same position: the rewrite may expose
                // another adjacent pattern.
                continue;
            }
            i += 1;
        }
        if !changed {
            break;
        }
    }
    debug!(
        passes,
        removed = before - instrs.len(),
        "peephole optimization reached fixpoint"
    );
}

/// Try every rule whose window starts at `i`; true if something changed.
fn apply_at(
    instrs: &mut Vec<Instr>,
    i: usize,
    label_renames: &mut Vec<(String, String)>,
    const_renames: &mut Vec<(String, String)>,
) -> bool {
    // --- two-instruction patterns ---------------------------------------
    if i + 1 < instrs.len() {
        if let (Instr::Op { op: op1, a: a1, .. }, Instr::Op { op: op2, a: a2, .. }) =
            (&instrs[i], &instrs[i + 1])
        {
            // push X / pop X -> nothing
            if *op1 == Op::Push && *op2 == Op::Pop && a1 == a2 {
                instrs.drain(i..=i + 1);
                return true;
            }
            // push X / pop Y -> mov Y, X
            if *op1 == Op::Push && *op2 == Op::Pop && a2.is_reg() && a1 != a2 {
                let replacement = Instr::op2(Op::Mov, a2.clone(), a1.clone());
                instrs[i] = replacement;
                instrs.remove(i + 1);
                return true;
            }
            // pop R / push R -> nothing
            if *op1 == Op::Pop && *op2 == Op::Push && a1 == a2 {
                instrs.drain(i..=i + 1);
                return true;
            }
            // jmp / jmp -> the second is unreachable
            if *op1 == Op::Jmp && *op2 == Op::Jmp {
                instrs.remove(i + 1);
                return true;
            }
        }

        // L1: / L2: -> keep L2, remember the merge
        if let (Instr::Label(first), Instr::Label(second)) = (&instrs[i], &instrs[i + 1]) {
            label_renames.push((first.clone(), second.clone()));
            instrs.remove(i);
            return true;
        }

        // jmp L / L: -> drop the jump
        if let (Instr::Op { op, a, .. }, Instr::Label(name)) = (&instrs[i], &instrs[i + 1]) {
            if *op == Op::Jmp && a.text == *name {
                instrs.remove(i);
                return true;
            }
        }

        // mov R, 1 / dec R -> xor R, R
        if let (
            Instr::Op {
                op: Op::Mov,
                a: a1,
                b: b1,
            },
            Instr::Op {
                op: Op::Dec,
                a: a2,
                ..
            },
        ) = (&instrs[i], &instrs[i + 1])
        {
            if a1 == a2 && b1.text == "1" {
                let replacement = Instr::op2(Op::Xor, a1.clone(), a1.clone());
                instrs[i] = replacement;
                instrs.remove(i + 1);
                return true;
            }
        }

        // xor R, R zeroes R: a following imul R, _ / idiv R keeps it zero,
        // and add _, R / sub _, R does nothing.
        if let (
            Instr::Op {
                op: Op::Xor,
                a: a1,
                b: b1,
            },
            Instr::Op {
                op: op2,
                a: a2,
                b: b2,
            },
        ) = (&instrs[i], &instrs[i + 1])
        {
            let zeroed = a1 == b1;
            let redundant = match op2 {
                Op::Imul | Op::Idiv => a2 == a1,
                Op::Add | Op::Sub => b2 == a1,
                _ => false,
            };
            if zeroed && redundant {
                instrs.remove(i + 1);
                return true;
            }
        }
    }

    // --- single-instruction patterns ------------------------------------
    if let Instr::Op { op, a, b } = &instrs[i] {
        // Rewrite jump targets of merged labels.
        if op.is_jump() {
            if let Some((_, to)) = label_renames.iter().find(|(from, _)| *from == a.text) {
                let to = to.clone();
                if let Instr::Op { a, .. } = &mut instrs[i] {
                    a.text = to;
                }
                return true;
            }
        }
        // mov R, 0 -> xor R, R
        if *op == Op::Mov && a.is_reg() && b.text == "0" {
            let replacement = Instr::op2(Op::Xor, a.clone(), a.clone());
            instrs[i] = replacement;
            return true;
        }
        // mov X, X -> nothing
        if *op == Op::Mov && a == b {
            instrs.remove(i);
            return true;
        }
        // add/sub with 0 does nothing
        if matches!(op, Op::Add | Op::Sub) && !b.is_none() && b.text == "0" {
            instrs.remove(i);
            return true;
        }
        // add R, 1 -> inc R; sub R, 1 -> dec R
        if matches!(op, Op::Add | Op::Sub) && b.text == "1" {
            let step = if *op == Op::Add { Op::Inc } else { Op::Dec };
            let replacement = Instr::op1(step, a.clone());
            instrs[i] = replacement;
            return true;
        }
        // Point references of deduplicated constants at the survivor.
        if *op == Op::Push && a.kind == OperandKind::Memory {
            if let Some(to) = const_rename_target(const_renames, &a.text, "qword ptr ") {
                if let Instr::Op { a, .. } = &mut instrs[i] {
                    a.text = to;
                }
                return true;
            }
        }
        if *op == Op::Mov && a.is_reg() && b.kind == OperandKind::Memory {
            if let Some(to) = const_rename_target(const_renames, &b.text, "offset ") {
                if let Instr::Op { b, .. } = &mut instrs[i] {
                    b.text = to;
                }
                return true;
            }
        }
    }

    // Identical constant declarations collapse onto the first one.
    if let Instr::ConstDecl { name, directive } = &instrs[i] {
        let name = name.clone();
        let directive = directive.clone();
        for j in i + 1..instrs.len() {
            if let Instr::ConstDecl {
                name: other,
                directive: other_directive,
            } = &instrs[j]
            {
                if *other != name && *other_directive == directive {
                    const_renames.push((other.clone(), name.clone()));
                    instrs.remove(j);
                    return true;
                }
            }
        }
    }

    false
}

/// Rewritten operand text when `text` is `prefix` + a renamed constant.
fn const_rename_target(
    renames: &[(String, String)],
    text: &str,
    prefix: &str,
) -> Option<String> {
    for (from, to) in renames {
        if text == format!("{}{}", prefix, from) {
            return Some(format!("{}{}", prefix, to));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{Operand, render_all};

    fn push_imm(value: i32) -> Instr {
        Instr::op1(Op::Push, Operand::imm(value))
    }

    fn pop_reg(name: &str) -> Instr {
        Instr::op1(Op::Pop, Operand::reg(name))
    }

    #[test]
    fn test_push_pop_becomes_mov() {
        let mut instrs = vec![push_imm(5), pop_reg("eax")];
        optimize(&mut instrs);
        assert_eq!(
            instrs,
            vec![Instr::op2(Op::Mov, Operand::reg("eax"), Operand::imm(5))]
        );
    }

    #[test]
    fn test_push_pop_same_operand_deleted() {
        let mut instrs = vec![
            Instr::op1(Op::Push, Operand::reg("eax")),
            pop_reg("eax"),
            Instr::op0(Op::Ret),
        ];
        optimize(&mut instrs);
        assert_eq!(instrs, vec![Instr::op0(Op::Ret)]);
    }

    #[test]
    fn test_pop_push_same_register_deleted() {
        let mut instrs = vec![
            pop_reg("ecx"),
            Instr::op1(Op::Push, Operand::reg("ecx")),
            Instr::op0(Op::Ret),
        ];
        optimize(&mut instrs);
        assert_eq!(instrs, vec![Instr::op0(Op::Ret)]);
    }

    #[test]
    fn test_adjacent_labels_merge_and_jumps_follow() {
        let mut instrs = vec![
            Instr::op1(Op::Jz, Operand::label("l_0")),
            Instr::op0(Op::Ret),
            Instr::Label("l_0".into()),
            Instr::Label("l_1".into()),
            Instr::op0(Op::Cdq),
        ];
        optimize(&mut instrs);
        let text = render_all(&instrs);
        assert!(!text.contains("l_0:"));
        assert!(text.contains("\tjz\tl_1\n"));
        assert!(text.contains("l_1:\n"));
    }

    #[test]
    fn test_jump_to_next_line_deleted() {
        let mut instrs = vec![
            Instr::op1(Op::Jmp, Operand::label("l_2")),
            Instr::Label("l_2".into()),
        ];
        optimize(&mut instrs);
        assert_eq!(instrs, vec![Instr::Label("l_2".into())]);
    }

    #[test]
    fn test_second_of_two_jumps_deleted() {
        let mut instrs = vec![
            Instr::op1(Op::Jmp, Operand::label("l_0")),
            Instr::op1(Op::Jmp, Operand::label("l_1")),
            Instr::Label("l_0".into()),
        ];
        optimize(&mut instrs);
        let text = render_all(&instrs);
        assert!(!text.contains("l_1"));
    }

    #[test]
    fn test_mov_zero_becomes_xor() {
        let mut instrs = vec![Instr::op2(Op::Mov, Operand::reg("eax"), Operand::imm(0))];
        optimize(&mut instrs);
        assert_eq!(
            instrs,
            vec![Instr::op2(Op::Xor, Operand::reg("eax"), Operand::reg("eax"))]
        );
    }

    #[test]
    fn test_mov_self_deleted() {
        let mut instrs = vec![
            Instr::op2(Op::Mov, Operand::reg("esi"), Operand::reg("esi")),
            Instr::op0(Op::Ret),
        ];
        optimize(&mut instrs);
        assert_eq!(instrs, vec![Instr::op0(Op::Ret)]);
    }

    #[test]
    fn test_add_sub_zero_deleted() {
        let mut instrs = vec![
            Instr::op2(Op::Add, Operand::reg("esp"), Operand::imm(0)),
            Instr::op2(Op::Sub, Operand::reg("esp"), Operand::imm(0)),
            Instr::op0(Op::Ret),
        ];
        optimize(&mut instrs);
        assert_eq!(instrs, vec![Instr::op0(Op::Ret)]);
    }

    #[test]
    fn test_add_one_becomes_inc() {
        let mut instrs = vec![
            Instr::op2(Op::Add, Operand::reg("eax"), Operand::imm(1)),
            Instr::op2(Op::Sub, Operand::reg("ecx"), Operand::imm(1)),
        ];
        optimize(&mut instrs);
        assert_eq!(
            instrs,
            vec![
                Instr::op1(Op::Inc, Operand::reg("eax")),
                Instr::op1(Op::Dec, Operand::reg("ecx")),
            ]
        );
    }

    #[test]
    fn test_mov_one_dec_becomes_xor() {
        let mut instrs = vec![
            Instr::op2(Op::Mov, Operand::reg("eax"), Operand::imm(1)),
            Instr::op1(Op::Dec, Operand::reg("eax")),
        ];
        optimize(&mut instrs);
        assert_eq!(
            instrs,
            vec![Instr::op2(Op::Xor, Operand::reg("eax"), Operand::reg("eax"))]
        );
    }

    #[test]
    fn test_zeroed_register_drops_multiplies_and_adds() {
        let mut instrs = vec![
            Instr::op2(Op::Xor, Operand::reg("eax"), Operand::reg("eax")),
            Instr::op2(Op::Imul, Operand::reg("eax"), Operand::imm(12)),
        ];
        optimize(&mut instrs);
        assert_eq!(
            instrs,
            vec![Instr::op2(Op::Xor, Operand::reg("eax"), Operand::reg("eax"))]
        );

        let mut instrs = vec![
            Instr::op2(Op::Xor, Operand::reg("esi"), Operand::reg("esi")),
            Instr::op2(Op::Add, Operand::reg("edi"), Operand::reg("esi")),
        ];
        optimize(&mut instrs);
        assert_eq!(instrs.len(), 1);
    }

    #[test]
    fn test_constant_deduplication_rewrites_references() {
        let mut instrs = vec![
            Instr::op1(Op::Push, Operand::mem("qword ptr dc_2")),
            Instr::op2(Op::Mov, Operand::reg("esi"), Operand::mem("offset dc_2")),
            Instr::ConstDecl {
                name: "dc_1".into(),
                directive: "dq 3.14".into(),
            },
            Instr::ConstDecl {
                name: "dc_2".into(),
                directive: "dq 3.14".into(),
            },
        ];
        optimize(&mut instrs);
        let text = render_all(&instrs);
        assert_eq!(text.matches("dq 3.14").count(), 1);
        assert!(text.contains("\tpush\tqword ptr dc_1\n"));
        assert!(text.contains("\tmov\tesi, offset dc_1\n"));
        assert!(!text.contains("dc_2"));
    }

    #[test]
    fn test_different_constants_kept() {
        let mut instrs = vec![
            Instr::ConstDecl {
                name: "dc_1".into(),
                directive: "dq 1.5".into(),
            },
            Instr::ConstDecl {
                name: "dc_2".into(),
                directive: "dq 2.5".into(),
            },
        ];
        optimize(&mut instrs);
        assert_eq!(instrs.len(), 2);
    }

    #[test]
    fn test_rules_do_not_fire_across_interleaved_instructions() {
        let mut instrs = vec![
            push_imm(5),
            Instr::op0(Op::Cdq),
            pop_reg("eax"),
        ];
        optimize(&mut instrs);
        assert_eq!(instrs.len(), 3);
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let mut instrs = vec![
            push_imm(5),
            pop_reg("eax"),
            Instr::op2(Op::Mov, Operand::reg("ecx"), Operand::imm(0)),
            Instr::op1(Op::Jmp, Operand::label("l_0")),
            Instr::Label("l_0".into()),
            Instr::Label("l_1".into()),
            Instr::ConstDecl {
                name: "dc_1".into(),
                directive: "dq 3.14".into(),
            },
            Instr::ConstDecl {
                name: "dc_2".into(),
                directive: "dq 3.14".into(),
            },
        ];
        optimize(&mut instrs);
        let once = instrs.clone();
        optimize(&mut instrs);
        assert_eq!(instrs, once);
    }

    #[test]
    fn test_empty_list() {
        let mut instrs = Vec::new();
        optimize(&mut instrs);
        assert!(instrs.is_empty());
    }
}
