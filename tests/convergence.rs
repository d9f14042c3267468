//! Jump distance binding tests: shrink-to-short conversion, iterative
//! passes, backward branches, and funclet boundary validation.

use igemit::emit::testing::{TestEncoder, ops};
use igemit::emit::{BranchKind, Emitter, InsFlags, InsFormat, InstrDesc, LabelId, OpSize};
use igemit::{EmitConfig, EmitError, GcKind};

fn emitter() -> Emitter<TestEncoder> {
    Emitter::new(EmitConfig::default(), TestEncoder::new()).unwrap()
}

fn nop() -> InstrDesc {
    InstrDesc::new(ops::NOP, InsFormat::None, OpSize::Byte)
}

/// A 5-byte filler instruction.
fn filler() -> InstrDesc {
    InstrDesc::new(ops::PUSH, InsFormat::Imm, OpSize::Quad).with_small_cns(0)
}

fn pad(em: &mut Emitter<TestEncoder>, n: usize) {
    for _ in 0..n {
        em.emit_instr(filler());
    }
}

/// Collect (est_size, short) for every jump in the method.
fn jump_sizes(em: &Emitter<TestEncoder>) -> Vec<(u8, bool)> {
    em.groups()
        .iter()
        .flat_map(|g| g.instrs.iter())
        .filter(|id| id.is_jump())
        .map(|id| (id.est_size, id.flags.contains(InsFlags::SHORT)))
        .collect()
}

#[test]
fn test_forward_jump_shrinks_to_short() {
    let mut em = emitter();
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(0));
    pad(&mut em, 20); // 100 bytes between the jump and its target
    em.define_label(LabelId(0));
    em.emit_instr(nop());
    em.resolve().unwrap();

    assert_eq!(jump_sizes(&em), vec![(2, true)]);

    // The 4 recovered bytes moved every following group up
    let target = em
        .groups()
        .iter()
        .find(|g| g.instrs.first().is_some_and(|id| !id.is_jump() && id.format == InsFormat::None))
        .unwrap();
    assert_eq!(target.offs, 102);
    em.groups().check_offsets().unwrap();
}

#[test]
fn test_second_pass_converts_after_recovery() {
    // Jump A misses the short range by 4 bytes on the first pass; jumps B
    // and C convert and recover 8, which brings A into range on pass two.
    let mut em = emitter();
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(9)); // A
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(9)); // B
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(9)); // C
    pad(&mut em, 23); // 115 bytes
    em.define_label(LabelId(9));
    em.emit_instr(nop());
    em.resolve().unwrap();

    // All three end up short; sizes only ever moved downward
    assert_eq!(jump_sizes(&em), vec![(2, true); 3]);
    em.groups().check_offsets().unwrap();
}

#[test]
fn test_backward_jump_within_range() {
    let mut em = emitter();
    em.define_label(LabelId(3));
    em.emit_instr(nop());
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(3));
    em.resolve().unwrap();
    assert_eq!(jump_sizes(&em), vec![(2, true)]);
}

#[test]
fn test_out_of_range_jump_stays_long() {
    let mut em = emitter();
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(0));
    pad(&mut em, 50); // 250 bytes, beyond any short reach
    em.define_label(LabelId(0));
    em.emit_instr(nop());
    em.resolve().unwrap();
    assert_eq!(jump_sizes(&em), vec![(6, false)]);

    // Long encodings are always legal; issuance succeeds
    let out = em.issue().unwrap();
    assert_eq!(out.hot_code_size, 6 + 250 + 1);
}

#[test]
fn test_conditional_jump_shrinks() {
    let mut em = emitter();
    em.emit_jump(ops::JCC, BranchKind::Cond, LabelId(1));
    pad(&mut em, 4);
    em.define_label(LabelId(1));
    em.emit_instr(nop());
    em.resolve().unwrap();
    assert_eq!(jump_sizes(&em), vec![(2, true)]);
}

#[test]
fn test_branch_across_funclet_is_fatal() {
    let mut em = emitter();
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(0));
    em.emit_instr(nop());
    em.set_current_func(1);
    em.define_label(LabelId(0));
    em.emit_instr(nop());
    let err = em.resolve().unwrap_err();
    assert!(matches!(err, EmitError::Internal(_)));
}

#[test]
fn test_finally_call_may_enter_funclet() {
    let mut em = emitter();
    em.emit_jump(ops::JMP, BranchKind::FinallyCall, LabelId(0));
    em.emit_instr(nop());
    em.set_current_func(1);
    em.define_label(LabelId(0));
    em.emit_instr(nop());
    em.resolve().unwrap();
}

#[test]
fn test_catch_return_may_leave_funclet() {
    let mut em = emitter();
    em.define_label(LabelId(0));
    em.emit_instr(nop());
    em.set_current_func(2);
    em.emit_jump(ops::JMP, BranchKind::CatchRet, LabelId(0));
    em.resolve().unwrap();
}

#[test]
fn test_jump_to_undefined_label_is_fatal() {
    let mut em = emitter();
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(42));
    let err = em.resolve().unwrap_err();
    assert!(matches!(err, EmitError::Internal(_)));
}

#[test]
fn test_offsets_continuous_after_issue() {
    let mut em = emitter();
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(0));
    pad(&mut em, 10);
    em.define_label(LabelId(0));
    em.emit_instr(nop());
    em.emit_instr(
        InstrDesc::new(ops::MOV_RR, InsFormat::RegReg, OpSize::Quad)
            .with_gc_def(1, GcKind::None),
    );
    em.issue().unwrap();

    let groups: Vec<_> = em.groups().iter().collect();
    for pair in groups.windows(2) {
        assert_eq!(pair[1].offs, pair[0].offs + pair[0].size);
    }
}
