//! igemit - an instruction-group machine code emitter
//!
//! This library turns the linear instruction stream produced by a code
//! generator into a compact in-memory representation (a list of instruction
//! groups), iteratively shrinks jump and alignment sizes until they converge,
//! and renders the final machine code bytes together with GC liveness
//! metadata. Target-specific byte encoding is supplied by the caller through
//! the [`emit::InstrEncoder`] trait.

pub mod config;
pub mod emit;
pub mod error;

// Re-export commonly used types
pub use config::EmitConfig;
pub use emit::{
    BlockId, BranchKind, EmitLocation, EmitOutput, Emitter, GcEvent, GcKind, InsFormat, InstrDesc,
    InstrEncoder, LabelId, OpSize, Opcode, PlaceholderKind, RegMask, VarSet,
};
pub use error::EmitError;
