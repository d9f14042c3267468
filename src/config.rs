//! Emitter configuration.
//!
//! The emitter has no CLI or environment surface of its own; the surrounding
//! driver resolves its policy knobs and hands them in here, either built
//! directly or parsed from a TOML fragment.

use crate::error::EmitError;
use serde::{Deserialize, Serialize};

/// Resolved policy values for one method compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmitConfig {
    /// Emit a full per-register GC event trail instead of summary masks
    /// plus per-call-site records.
    pub full_gc_info: bool,
    /// Legacy-encoding size optimization: skip call-site records for calls
    /// that provably cannot trigger a collection. Correctness never depends
    /// on this.
    pub skip_boring_call_sites: bool,
    /// Insert alignment padding in front of detected loop heads.
    pub align_loops: bool,
    /// Power-of-two boundary loop heads are padded to.
    pub loop_align_boundary: u32,
    /// Padding reserved per alignment site; the adjustment pass only ever
    /// shrinks it.
    pub max_align_padding: u32,
    /// Loops larger than this (head to back-edge) are not worth aligning.
    pub max_loop_size: u32,
    /// Alignment requested for the hot code buffer.
    pub hot_code_align: u32,
    /// Emit position-independent code; absolute operands become relocation
    /// requests.
    pub relocatable: bool,
    /// Stress mode: force a group boundary after every instruction.
    pub stress_split_groups: bool,
    /// Descriptor capacity of the per-group scratch buffer.
    pub group_capacity: usize,
    /// Declared maximum operand-stack depth, when the code generator knows
    /// it. `None` means unknown, which forces the general stack model.
    pub max_stack_depth: Option<u32>,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            full_gc_info: false,
            skip_boring_call_sites: false,
            align_loops: false,
            loop_align_boundary: 32,
            max_align_padding: 15,
            max_loop_size: 96,
            hot_code_align: 16,
            relocatable: false,
            stress_split_groups: false,
            group_capacity: 64,
            max_stack_depth: None,
        }
    }
}

impl EmitConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, EmitError> {
        let cfg: EmitConfig = toml::from_str(s).map_err(|e| EmitError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a config from a TOML file.
    pub fn from_path(path: &std::path::Path) -> Result<Self, EmitError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EmitError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Check internal consistency of the knob values.
    pub fn validate(&self) -> Result<(), EmitError> {
        if !self.loop_align_boundary.is_power_of_two() {
            return Err(EmitError::Config(format!(
                "loop_align_boundary must be a power of two, got {}",
                self.loop_align_boundary
            )));
        }
        if !self.hot_code_align.is_power_of_two() {
            return Err(EmitError::Config(format!(
                "hot_code_align must be a power of two, got {}",
                self.hot_code_align
            )));
        }
        if self.max_align_padding >= self.loop_align_boundary {
            return Err(EmitError::Config(format!(
                "max_align_padding {} must be below the {}-byte boundary",
                self.max_align_padding, self.loop_align_boundary
            )));
        }
        if self.group_capacity == 0 {
            return Err(EmitError::Config("group_capacity must be nonzero".into()));
        }
        Ok(())
    }
}
