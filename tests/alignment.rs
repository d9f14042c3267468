//! Loop alignment driven through the emitter: padding is reserved in front
//! of a detected loop head and trimmed to the exact requirement once final
//! sizes are known.

use igemit::emit::testing::{TestEncoder, ops};
use igemit::emit::{BranchKind, Emitter, IgFlags, InsFormat, InstrDesc, LabelId, OpSize};
use igemit::EmitConfig;

fn aligning_emitter() -> Emitter<TestEncoder> {
    Emitter::new(
        EmitConfig {
            align_loops: true,
            loop_align_boundary: 8,
            max_align_padding: 7,
            max_loop_size: 200,
            ..EmitConfig::default()
        },
        TestEncoder::new(),
    )
    .unwrap()
}

fn nop() -> InstrDesc {
    InstrDesc::new(ops::NOP, InsFormat::None, OpSize::Byte)
}

/// A 5-byte filler instruction.
fn filler() -> InstrDesc {
    InstrDesc::new(ops::PUSH, InsFormat::Imm, OpSize::Quad)
}

#[test]
fn test_loop_head_lands_on_boundary() {
    let mut em = aligning_emitter();
    for _ in 0..3 {
        em.emit_instr(nop());
    }
    em.align_loop();
    em.define_label(LabelId(0));
    em.emit_instr(filler());
    em.emit_instr(filler());
    em.emit_jump(ops::JMP, BranchKind::Uncond, LabelId(0));
    em.record_loop_back_edge(LabelId(0));
    em.resolve().unwrap();

    // The group after the one carrying the padding is the loop head
    let align_ig = em
        .groups()
        .ids()
        .find(|&id| em.groups().get(id).flags.contains(IgFlags::LOOP_ALIGN))
        .unwrap();
    let head = em.groups().next_of(align_ig).unwrap();
    let head_offs = em.groups().get(head).offs;
    assert_eq!(head_offs % 8, 0);
    assert!(head_offs > 0);

    let out = em.issue().unwrap();
    // 3 nops, then exactly 5 of the 7 reserved bytes as padding to reach 8
    assert_eq!(out.hot_code_size, 3 + 5 + 5 + 5 + 2);
    assert!(out.hot[3..8].iter().all(|&b| b == 0x90));
    // The back edge is a short branch from 18 back to the head at 8
    assert_eq!(out.hot[19] as i8, -12);
    em.groups().check_offsets().unwrap();
}

#[test]
fn test_align_without_back_edge_reclaims_padding() {
    // An alignment request whose loop never closes is abandoned and its
    // reserved bytes come back
    let mut em = aligning_emitter();
    em.emit_instr(nop());
    em.align_loop();
    em.define_label(LabelId(0));
    em.emit_instr(nop());
    em.resolve().unwrap();
    let out = em.issue().unwrap();
    assert_eq!(out.hot_code_size, 2);
}

#[test]
fn test_alignment_disabled_by_config() {
    let mut em = Emitter::new(EmitConfig::default(), TestEncoder::new()).unwrap();
    em.emit_instr(nop());
    em.align_loop(); // no-op: align_loops is off
    em.emit_instr(nop());
    let out = em.issue().unwrap();
    assert_eq!(out.hot_code_size, 2);
}
