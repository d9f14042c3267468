//! Instruction-group emission pipeline.
//!
//! The pipeline runs in three stages per method:
//! - append: the code generator streams instructions into the current group's
//!   scratch buffer; groups are sealed at boundaries (labels, GC state
//!   changes, buffer overflow) into an ordered group list.
//! - resolve: jump and alignment sizes are iteratively shrunk until they
//!   converge; every group ends up with an exact offset.
//! - issue: groups are rendered to bytes through the target encoder while GC
//!   liveness transitions are recorded at final code offsets.

pub mod emitter;
pub mod gcinfo;
pub mod group;
pub mod instr;
pub mod jumps;
pub mod memory;
pub mod output;
pub mod testing;

pub use emitter::{
    CallInfo, EmitLocation, EmitOutput, Emitter, EncodeCtx, Encoded, InstrEncoder, LoadedCode,
    PlaceholderHandle,
};
pub use gcinfo::{CallSite, GcEvent, GcTracker};
pub use group::{BlockId, GroupList, IgFlags, InsGroup, PlaceholderKind};
pub use instr::{
    BranchKind, GcKind, InsFlags, InsFormat, InsPayload, InstrDesc, LabelId, OpSize, Opcode,
    RegMask, VarSet,
};
pub use jumps::JumpForms;
pub use memory::ExecutableMemory;
pub use output::{CodeSink, Reloc, RelocKind};
