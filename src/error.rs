//! Error types for the emitter.
//!
//! Two failure classes matter to callers: internal consistency violations,
//! which indicate a defect in the code generator or target encoder and fail
//! the whole method compilation, and implementation limits, which abort the
//! current method gracefully so the surrounding compiler can fall back.

use crate::emit::memory::MemoryError;
use thiserror::Error;

/// Error type for emitter operations.
#[derive(Debug, Error)]
pub enum EmitError {
    /// Internal consistency violation. These are defects in the emitting
    /// code generator or the target encoder, never user-facing conditions:
    /// an encoder producing more bytes than it estimated, a branch crossing
    /// a funclet boundary, offset bookkeeping mismatch after convergence,
    /// overlapping GC register kinds, an unbalanced no-GC region.
    #[error("internal error: {0}")]
    Internal(String),

    /// A representational limit was exceeded (frame offset wider than the
    /// encoding field, too many tracked slots, operand stack too deep for
    /// the chosen model). Compilation of the current method is abandoned;
    /// the process is fine.
    #[error("implementation limit: {0}")]
    Limit(String),

    /// Executable memory allocation or protection change failed.
    #[error("executable memory: {0}")]
    Memory(#[from] MemoryError),

    /// Invalid or unparsable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EmitError {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        EmitError::Internal(msg.into())
    }

    pub(crate) fn limit(msg: impl Into<String>) -> Self {
        EmitError::Limit(msg.into())
    }

    /// True for conditions that abort only the current method, not the host.
    pub fn is_limit(&self) -> bool {
        matches!(self, EmitError::Limit(_))
    }
}
