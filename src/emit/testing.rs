//! A minimal reference target for exercising the pipeline.
//!
//! Fixed-width byte encodings, little-endian immediates, one escape byte
//! for long branches. Not a real ISA; it exists so the emitter can be
//! driven end to end without a backend.

use super::emitter::{EncodeCtx, Encoded, InstrEncoder};
use super::instr::{InsFlags, InsFormat, InsPayload, InstrDesc, Opcode};
use super::jumps::JumpForms;
use super::output::{CodeSink, RelocKind};

/// Opcodes of the reference target.
pub mod ops {
    use super::Opcode;

    pub const NOP: Opcode = Opcode(0x00);
    pub const MOV_RR: Opcode = Opcode(0x01);
    pub const MOV_RI: Opcode = Opcode(0x02);
    pub const LOAD: Opcode = Opcode(0x03);
    pub const STORE: Opcode = Opcode(0x04);
    pub const ADD: Opcode = Opcode(0x05);
    pub const PUSH: Opcode = Opcode(0x06);
    pub const RET: Opcode = Opcode(0x07);
    pub const CALL: Opcode = Opcode(0x10);
    pub const JMP: Opcode = Opcode(0x20);
    pub const JCC: Opcode = Opcode(0x21);
}

/// Escape byte prefixing the long branch encodings.
const LONG_BRANCH_ESCAPE: u8 = 0x0F;
/// Padding byte for alignment runs.
const PAD_BYTE: u8 = 0x90;

/// Size of the long branch encoding: escape, opcode, rel32.
const BRANCH_LARGE: u8 = 6;
/// Size of the short branch encoding: opcode, rel8.
const BRANCH_SMALL: u8 = 2;

/// The reference encoder.
#[derive(Debug, Default)]
pub struct TestEncoder {
    /// Deliberately under-estimate `Imm`-format instructions, to exercise
    /// the emitter's no-silent-growth check.
    pub misestimate_imm: bool,
}

impl TestEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_big_cns(id: &InstrDesc) -> bool {
        matches!(
            id.payload,
            InsPayload::Cns { .. } | InsPayload::CnsDsp { .. }
        )
    }
}

impl InstrEncoder for TestEncoder {
    fn estimate(&self, id: &InstrDesc) -> u8 {
        match id.format {
            InsFormat::None => 1,
            InsFormat::Reg => 2,
            InsFormat::RegReg => 3,
            // opcode, reg, then imm64 for wide constants, imm32 otherwise
            InsFormat::RegImm => {
                if Self::has_big_cns(id) {
                    10
                } else {
                    6
                }
            }
            InsFormat::Imm => {
                if self.misestimate_imm {
                    1
                } else {
                    5
                }
            }
            InsFormat::RegMem | InsFormat::MemReg => 7,
            InsFormat::Call => 5,
            InsFormat::Label => BRANCH_LARGE,
            InsFormat::Align => id.est_size,
        }
    }

    fn jump_forms(&self, _id: &InstrDesc) -> JumpForms {
        JumpForms {
            large: BRANCH_LARGE,
            small: BRANCH_SMALL,
            small_max_fwd: 127,
            small_max_bwd: 128,
            medium: None,
        }
    }

    fn encode(&mut self, id: &InstrDesc, ctx: &EncodeCtx, sink: &mut CodeSink) -> Encoded {
        let op = id.opcode.0 as u8;
        match id.format {
            InsFormat::None => {
                sink.emit_u8(op);
                Encoded {
                    size: 1,
                    branch_imm: None,
                }
            }
            InsFormat::Reg => {
                sink.emit_u8(op);
                sink.emit_u8(id.dst_reg.unwrap_or(id.small_cns as u8));
                Encoded {
                    size: 2,
                    branch_imm: None,
                }
            }
            InsFormat::RegReg => {
                sink.emit_u8(op);
                sink.emit_u8(id.dst_reg.unwrap_or(0));
                sink.emit_u8(id.small_cns as u8);
                Encoded {
                    size: 3,
                    branch_imm: None,
                }
            }
            InsFormat::RegImm => {
                sink.emit_u8(op);
                sink.emit_u8(id.dst_reg.unwrap_or(0));
                if Self::has_big_cns(id) {
                    let cns = match id.payload {
                        InsPayload::Cns { cns } | InsPayload::CnsDsp { cns, .. } => cns,
                        _ => unreachable!(),
                    };
                    if id.flags.contains(InsFlags::CNS_RELOC) && ctx.relocatable {
                        sink.emit_reloc(RelocKind::Abs64, cns as u64);
                    } else {
                        sink.emit_u64(cns as u64);
                    }
                    Encoded {
                        size: 10,
                        branch_imm: None,
                    }
                } else {
                    sink.emit_u32(id.small_cns as u32);
                    Encoded {
                        size: 6,
                        branch_imm: None,
                    }
                }
            }
            InsFormat::Imm => {
                sink.emit_u8(op);
                sink.emit_u32(id.small_cns as u32);
                Encoded {
                    size: 5,
                    branch_imm: None,
                }
            }
            InsFormat::RegMem | InsFormat::MemReg => {
                sink.emit_u8(op);
                sink.emit_u8(id.dst_reg.unwrap_or(0));
                sink.emit_u8(id.small_cns as u8);
                let dsp = match id.payload {
                    InsPayload::Dsp { dsp } | InsPayload::CnsDsp { dsp, .. } => dsp,
                    _ => 0,
                };
                if id.flags.contains(InsFlags::DSP_RELOC) && ctx.relocatable {
                    sink.emit_reloc(RelocKind::Abs32, dsp as u64);
                } else {
                    sink.emit_u32(dsp as u32);
                }
                Encoded {
                    size: 7,
                    branch_imm: None,
                }
            }
            InsFormat::Call => {
                sink.emit_u8(op);
                sink.emit_u32(id.small_cns as u32);
                Encoded {
                    size: 5,
                    branch_imm: None,
                }
            }
            InsFormat::Label => {
                let target = ctx.target_offs.expect("branch without a resolved target");
                if id.flags.contains(InsFlags::SHORT) {
                    let rel = target as i64 - (ctx.offs as i64 + BRANCH_SMALL as i64);
                    debug_assert!((-128..=127).contains(&rel));
                    sink.emit_u8(op);
                    sink.emit_u8(rel as i8 as u8);
                    Encoded {
                        size: BRANCH_SMALL,
                        branch_imm: Some((1, 1)),
                    }
                } else {
                    let rel = target as i64 - (ctx.offs as i64 + BRANCH_LARGE as i64);
                    sink.emit_u8(LONG_BRANCH_ESCAPE);
                    sink.emit_u8(op);
                    sink.emit_u32(rel as i32 as u32);
                    Encoded {
                        size: BRANCH_LARGE,
                        branch_imm: Some((2, 4)),
                    }
                }
            }
            InsFormat::Align => {
                for _ in 0..id.est_size {
                    sink.emit_u8(PAD_BYTE);
                }
                Encoded {
                    size: id.est_size,
                    branch_imm: None,
                }
            }
        }
    }
}
