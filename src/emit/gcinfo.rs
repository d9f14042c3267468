//! Incremental GC liveness tracking.
//!
//! The tracker models which registers and tracked stack slots hold GC
//! references or interior pointers while code is being issued, and records a
//! transition event whenever that model changes. Between two instructions in
//! the same group liveness is implicit; explicit records exist only at group
//! boundaries, at individual definition events, and at call sites.
//!
//! In full-GC-info mode every register birth and death is recorded so the
//! method is interruptible anywhere. Otherwise only summary masks plus
//! per-call-site snapshots are kept, which is why partial tracking must
//! record every call.

use super::instr::{GcKind, RegMask, VarSet};
use crate::config::EmitConfig;
use crate::error::EmitError;

/// Upper bound on the operand-stack depth the shift-register model encodes.
pub const SIMPLE_STACK_LIMIT: u32 = 64;

/// Widest frame offset the standard slot encoding can hold.
const MAX_SLOT_OFFS: u32 = u16::MAX as u32;

/// A liveness transition, tagged with the final code offset at which it
/// takes effect.
#[derive(Debug, Clone, PartialEq)]
pub enum GcEvent {
    /// A register now holds a tracked value of `kind`
    RegBorn { offs: u32, reg: u8, kind: GcKind },
    /// A register no longer holds a tracked value
    RegDead { offs: u32, reg: u8 },
    /// A tracked stack slot became live
    VarBorn { offs: u32, slot: u32 },
    /// A tracked stack slot became dead
    VarDead { offs: u32, slot: u32 },
    /// Liveness snapshot at a call site
    Call(CallSite),
}

/// Per-call-site liveness snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    /// Code offset just past the call instruction
    pub offs: u32,
    /// Size of the call instruction itself
    pub instr_size: u8,
    /// Object-reference registers live across the call
    pub gc_refs: RegMask,
    /// Interior-pointer registers live across the call
    pub byrefs: RegMask,
    /// Pending argument slots on the operand stack
    pub arg_cnt: u32,
    /// Pending argument slots (from the stack bottom) holding references
    pub arg_refs: Vec<u32>,
    /// Pending argument slots holding interior pointers
    pub arg_byrefs: Vec<u32>,
}

/// A stack slot registered for liveness tracking.
#[derive(Debug, Clone, Copy)]
pub struct TrackedSlot {
    pub frame_offs: i32,
    pub kind: GcKind,
}

/// Pending call-argument model. The simple form packs the stack into two
/// shift registers; the general form keeps a growable table. The form is
/// fixed before any tracking call and never upgraded mid-method.
#[derive(Debug)]
pub(crate) enum ArgStack {
    Simple { refs: u64, byrefs: u64, depth: u32 },
    General { kinds: Vec<GcKind> },
}

impl ArgStack {
    /// Pick the model once per method: the simple form requires a declared
    /// depth bound within the encoding width, and full-GC-info mode always
    /// uses the general table.
    pub(crate) fn select(full_info: bool, max_depth: Option<u32>) -> ArgStack {
        match (full_info, max_depth) {
            (false, Some(d)) if d <= SIMPLE_STACK_LIMIT => ArgStack::Simple {
                refs: 0,
                byrefs: 0,
                depth: 0,
            },
            _ => ArgStack::General { kinds: Vec::new() },
        }
    }

    pub(crate) fn push(&mut self, kind: GcKind) -> Result<(), EmitError> {
        match self {
            ArgStack::Simple { refs, byrefs, depth } => {
                if *depth >= SIMPLE_STACK_LIMIT {
                    return Err(EmitError::limit(format!(
                        "operand stack deeper than {} slots",
                        SIMPLE_STACK_LIMIT
                    )));
                }
                *refs = (*refs << 1) | u64::from(kind == GcKind::Ref);
                *byrefs = (*byrefs << 1) | u64::from(kind == GcKind::Byref);
                *depth += 1;
            }
            ArgStack::General { kinds } => kinds.push(kind),
        }
        Ok(())
    }

    pub(crate) fn pop(&mut self, n: u32) {
        match self {
            ArgStack::Simple { refs, byrefs, depth } => {
                debug_assert!(n <= *depth);
                *refs >>= n;
                *byrefs >>= n;
                *depth = depth.saturating_sub(n);
            }
            ArgStack::General { kinds } => {
                let keep = kinds.len().saturating_sub(n as usize);
                kinds.truncate(keep);
            }
        }
    }

    pub(crate) fn depth(&self) -> u32 {
        match self {
            ArgStack::Simple { depth, .. } => *depth,
            ArgStack::General { kinds } => kinds.len() as u32,
        }
    }

    /// Slots holding tracked values, indexed from the stack bottom.
    pub(crate) fn pending(&self) -> (Vec<u32>, Vec<u32>) {
        let mut ref_slots = Vec::new();
        let mut byref_slots = Vec::new();
        match self {
            ArgStack::Simple { refs, byrefs, depth } => {
                // Bit 0 is the top of the stack
                for i in 0..*depth {
                    let slot = depth - 1 - i;
                    if refs & (1 << i) != 0 {
                        ref_slots.push(slot);
                    }
                    if byrefs & (1 << i) != 0 {
                        byref_slots.push(slot);
                    }
                }
                ref_slots.sort_unstable();
                byref_slots.sort_unstable();
            }
            ArgStack::General { kinds } => {
                for (slot, kind) in kinds.iter().enumerate() {
                    match kind {
                        GcKind::Ref => ref_slots.push(slot as u32),
                        GcKind::Byref => byref_slots.push(slot as u32),
                        GcKind::None => {}
                    }
                }
            }
        }
        (ref_slots, byref_slots)
    }
}

/// The liveness model threaded through issuance.
#[derive(Debug)]
pub struct GcTracker {
    full_info: bool,
    skip_boring: bool,
    slots: Vec<Option<TrackedSlot>>,
    live_vars: VarSet,
    /// Whether `live_vars` reflects a recorded set yet
    vars_valid: bool,
    gc_refs: RegMask,
    byrefs: RegMask,
    /// Set while issuing an epilog; liveness updates are ignored there
    suppress: bool,
    events: Vec<GcEvent>,
    arg_stack: ArgStack,
}

impl GcTracker {
    pub fn new(cfg: &EmitConfig) -> Self {
        Self {
            full_info: cfg.full_gc_info,
            skip_boring: cfg.skip_boring_call_sites,
            slots: Vec::new(),
            live_vars: VarSet::new(),
            vars_valid: false,
            gc_refs: RegMask::NONE,
            byrefs: RegMask::NONE,
            suppress: false,
            events: Vec::new(),
            arg_stack: ArgStack::select(cfg.full_gc_info, cfg.max_stack_depth),
        }
    }

    /// Register a stack slot for tracking. Fails with an implementation
    /// limit if the slot index or frame offset exceeds the encoding fields.
    pub fn track_slot(
        &mut self,
        index: usize,
        frame_offs: i32,
        kind: GcKind,
    ) -> Result<(), EmitError> {
        if index > u16::MAX as usize {
            return Err(EmitError::limit(format!(
                "tracked slot index {} exceeds the 16-bit field",
                index
            )));
        }
        if frame_offs.unsigned_abs() > MAX_SLOT_OFFS {
            return Err(EmitError::limit(format!(
                "frame offset {} exceeds the {}-byte encoding range",
                frame_offs, MAX_SLOT_OFFS
            )));
        }
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(TrackedSlot { frame_offs, kind });
        Ok(())
    }

    pub fn tracked_slot(&self, index: usize) -> Option<&TrackedSlot> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub(crate) fn set_suppress(&mut self, suppress: bool) {
        self.suppress = suppress;
    }

    pub fn live_gc_refs(&self) -> RegMask {
        self.gc_refs
    }

    pub fn live_byrefs(&self) -> RegMask {
        self.byrefs
    }

    pub fn live_vars(&self) -> &VarSet {
        &self.live_vars
    }

    /// Update the live tracked-variable set at `offs`, emitting born/dead
    /// events for registered slots whose membership changed. A no-op when
    /// the set is unchanged or while updates are suppressed.
    pub fn update_live_vars(&mut self, new: &VarSet, offs: u32) {
        if self.suppress {
            return;
        }
        if self.vars_valid && self.live_vars == *new {
            return;
        }
        log::trace!("live vars change at {:#x}", offs);
        for (slot, now_live) in self.live_vars.changes_to(new) {
            if self.tracked_slot(slot).is_none() {
                continue;
            }
            let slot = slot as u32;
            self.events.push(if now_live {
                GcEvent::VarBorn { offs, slot }
            } else {
                GcEvent::VarDead { offs, slot }
            });
        }
        self.live_vars = new.clone();
        self.vars_valid = true;
    }

    /// Update one kind's live register mask at `offs`. Registers entering
    /// the mask are first removed from the other kind's mask; the two kinds
    /// stay disjoint by construction.
    pub fn update_live_regs(
        &mut self,
        kind: GcKind,
        new: RegMask,
        offs: u32,
    ) -> Result<(), EmitError> {
        if self.suppress {
            return Ok(());
        }
        let cur = match kind {
            GcKind::Ref => self.gc_refs,
            GcKind::Byref => self.byrefs,
            GcKind::None => {
                return Err(EmitError::internal("live-register update with kind None"));
            }
        };
        let born = new - cur;
        let dead = cur - new;
        for reg in born.iter() {
            match kind.other() {
                GcKind::Byref => self.byrefs.remove(reg),
                GcKind::Ref => self.gc_refs.remove(reg),
                GcKind::None => unreachable!(),
            }
            if self.full_info {
                self.events.push(GcEvent::RegBorn { offs, reg, kind });
            }
        }
        if self.full_info {
            for reg in dead.iter() {
                self.events.push(GcEvent::RegDead { offs, reg });
            }
        }
        match kind {
            GcKind::Ref => self.gc_refs = new,
            GcKind::Byref => self.byrefs = new,
            GcKind::None => unreachable!(),
        }
        self.assert_disjoint()
    }

    /// Apply a single-register definition at `offs`: the destination now
    /// holds `kind` (or nothing, killing any tracked value there).
    pub fn def_reg(&mut self, reg: u8, kind: GcKind, offs: u32) {
        if self.suppress {
            return;
        }
        let was_live = self.gc_refs.contains(reg) || self.byrefs.contains(reg);
        self.gc_refs.remove(reg);
        self.byrefs.remove(reg);
        match kind {
            GcKind::None => {
                if was_live && self.full_info {
                    self.events.push(GcEvent::RegDead { offs, reg });
                }
            }
            GcKind::Ref => {
                self.gc_refs.insert(reg);
                if self.full_info {
                    self.events.push(GcEvent::RegBorn { offs, reg, kind });
                }
            }
            GcKind::Byref => {
                self.byrefs.insert(reg);
                if self.full_info {
                    self.events.push(GcEvent::RegBorn { offs, reg, kind });
                }
            }
        }
    }

    /// Record a call site ending at `offs`, with the register masks and
    /// pending-argument snapshot captured when the call was emitted. In
    /// full-GC-info mode the event trail already covers every point, so call
    /// records are skipped; in partial mode every call gets one, except
    /// helpers on the no-collection allow-list when the legacy size
    /// optimization is on.
    #[allow(clippy::too_many_arguments)]
    pub fn record_call(
        &mut self,
        offs: u32,
        instr_size: u8,
        gc_refs: RegMask,
        byrefs: RegMask,
        arg_cnt: u32,
        arg_refs: Vec<u32>,
        arg_byrefs: Vec<u32>,
        no_gc: bool,
    ) {
        if self.full_info {
            return;
        }
        if self.skip_boring && no_gc {
            log::trace!("eliding call record at {:#x} (no-collection helper)", offs);
            return;
        }
        self.events.push(GcEvent::Call(CallSite {
            offs,
            instr_size,
            gc_refs,
            byrefs,
            arg_cnt,
            arg_refs,
            arg_byrefs,
        }));
    }

    /// Snapshot of the pending argument slots holding tracked values.
    pub fn pending_args(&self) -> (Vec<u32>, Vec<u32>) {
        self.arg_stack.pending()
    }

    /// Push a pending call argument.
    pub fn push_arg(&mut self, kind: GcKind) -> Result<(), EmitError> {
        self.arg_stack.push(kind)
    }

    /// Pop `n` pending call arguments (a call consuming them, or a kill).
    pub fn pop_args(&mut self, n: u32) {
        self.arg_stack.pop(n);
    }

    pub fn arg_depth(&self) -> u32 {
        self.arg_stack.depth()
    }

    /// Verify the two register kinds are disjoint. Overlap means the
    /// bookkeeping above has a defect.
    pub fn assert_disjoint(&self) -> Result<(), EmitError> {
        if self.gc_refs.overlaps(self.byrefs) {
            return Err(EmitError::internal(format!(
                "registers {} are live as both ref and byref",
                self.gc_refs & self.byrefs
            )));
        }
        Ok(())
    }

    pub fn events(&self) -> &[GcEvent] {
        &self.events
    }

    pub(crate) fn take_events(&mut self) -> Vec<GcEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> GcTracker {
        GcTracker::new(&EmitConfig::default())
    }

    fn full_tracker() -> GcTracker {
        GcTracker::new(&EmitConfig {
            full_gc_info: true,
            ..EmitConfig::default()
        })
    }

    #[test]
    fn test_kinds_stay_disjoint() {
        let mut gc = full_tracker();
        gc.update_live_regs(GcKind::Ref, RegMask::from_reg(3), 0).unwrap();
        // The same register turning live as byref must leave the ref mask
        gc.update_live_regs(GcKind::Byref, RegMask::from_reg(3), 4).unwrap();
        assert!(!gc.live_gc_refs().contains(3));
        assert!(gc.live_byrefs().contains(3));
        gc.assert_disjoint().unwrap();
    }

    #[test]
    fn test_reg_events_only_in_full_mode() {
        let mut gc = tracker();
        gc.update_live_regs(GcKind::Ref, RegMask::from_reg(1), 0).unwrap();
        assert!(gc.events().is_empty());

        let mut gc = full_tracker();
        gc.update_live_regs(GcKind::Ref, RegMask::from_reg(1), 0).unwrap();
        gc.update_live_regs(GcKind::Ref, RegMask::NONE, 8).unwrap();
        assert_eq!(
            gc.events(),
            &[
                GcEvent::RegBorn {
                    offs: 0,
                    reg: 1,
                    kind: GcKind::Ref
                },
                GcEvent::RegDead { offs: 8, reg: 1 },
            ]
        );
    }

    #[test]
    fn test_var_update_elides_unchanged() {
        let mut gc = tracker();
        gc.track_slot(3, -8, GcKind::Ref).unwrap();
        let set: VarSet = [3].into_iter().collect();
        gc.update_live_vars(&set, 0);
        assert_eq!(gc.events().len(), 1);
        // Same set again: no new events
        gc.update_live_vars(&set.clone(), 10);
        assert_eq!(gc.events().len(), 1);
    }

    #[test]
    fn test_untracked_slots_produce_no_events() {
        let mut gc = tracker();
        gc.track_slot(1, -16, GcKind::Ref).unwrap();
        let set: VarSet = [1, 7].into_iter().collect(); // slot 7 never registered
        gc.update_live_vars(&set, 0);
        assert_eq!(gc.events(), &[GcEvent::VarBorn { offs: 0, slot: 1 }]);
    }

    #[test]
    fn test_suppressed_in_epilog() {
        let mut gc = full_tracker();
        gc.set_suppress(true);
        gc.update_live_regs(GcKind::Ref, RegMask::from_reg(2), 0).unwrap();
        assert!(gc.events().is_empty());
        assert!(gc.live_gc_refs().is_empty());
    }

    #[test]
    fn test_frame_offset_limit() {
        let mut gc = tracker();
        // 70000 does not fit the 16-bit offset field
        let err = gc.track_slot(0, 70_000, GcKind::Ref).unwrap_err();
        assert!(err.is_limit());
        // 65535 just fits
        gc.track_slot(0, 65_535, GcKind::Ref).unwrap();
    }

    #[test]
    fn test_call_sites_recorded_in_partial_mode() {
        let mut gc = tracker();
        gc.update_live_regs(GcKind::Ref, RegMask::from_reg(5), 0).unwrap();
        gc.push_arg(GcKind::Ref).unwrap();
        gc.push_arg(GcKind::None).unwrap();
        let (arg_refs, arg_byrefs) = gc.pending_args();
        gc.record_call(
            20,
            5,
            gc.live_gc_refs(),
            gc.live_byrefs(),
            2,
            arg_refs,
            arg_byrefs,
            false,
        );
        match &gc.events()[0] {
            GcEvent::Call(site) => {
                assert_eq!(site.offs, 20);
                assert!(site.gc_refs.contains(5));
                assert_eq!(site.arg_refs, vec![0]);
                assert!(site.arg_byrefs.is_empty());
            }
            other => panic!("expected call site, got {:?}", other),
        }
    }

    #[test]
    fn test_boring_call_elision_is_opt_in() {
        let none = RegMask::NONE;
        let mut gc = tracker();
        gc.record_call(10, 5, none, none, 0, vec![], vec![], true);
        assert_eq!(gc.events().len(), 1); // recorded: elision off by default

        let mut gc = GcTracker::new(&EmitConfig {
            skip_boring_call_sites: true,
            ..EmitConfig::default()
        });
        gc.record_call(10, 5, none, none, 0, vec![], vec![], true);
        assert!(gc.events().is_empty());
        gc.record_call(16, 5, none, none, 0, vec![], vec![], false);
        assert_eq!(gc.events().len(), 1); // non-helper calls always recorded
    }

    #[test]
    fn test_simple_stack_depth_limit() {
        let mut stack = ArgStack::select(false, Some(4));
        for _ in 0..SIMPLE_STACK_LIMIT {
            stack.push(GcKind::None).unwrap();
        }
        assert!(stack.push(GcKind::Ref).is_err());
    }

    #[test]
    fn test_general_stack_selected_for_full_info() {
        let stack = ArgStack::select(true, Some(2));
        assert!(matches!(stack, ArgStack::General { .. }));
        let stack = ArgStack::select(false, None);
        assert!(matches!(stack, ArgStack::General { .. }));
        let stack = ArgStack::select(false, Some(8));
        assert!(matches!(stack, ArgStack::Simple { .. }));
    }

    #[test]
    fn test_simple_stack_pending_order() {
        let mut stack = ArgStack::select(false, Some(8));
        stack.push(GcKind::Ref).unwrap(); // bottom, slot 0
        stack.push(GcKind::None).unwrap();
        stack.push(GcKind::Byref).unwrap(); // top, slot 2
        let (refs, byrefs) = stack.pending();
        assert_eq!(refs, vec![0]);
        assert_eq!(byrefs, vec![2]);
        stack.pop(2);
        let (refs, byrefs) = stack.pending();
        assert_eq!(refs, vec![0]);
        assert!(byrefs.is_empty());
    }
}
