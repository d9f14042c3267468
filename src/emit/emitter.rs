//! The emitter driver.
//!
//! Owns all per-method emission state: the group list, the scratch buffer
//! for the group currently being filled, the GC tracker, the jump and
//! alignment side lists, and the placeholder list. One `Emitter` instance
//! serves exactly one method compilation on one thread; concurrent
//! compilations use independent instances.

use std::collections::HashMap;

use super::gcinfo::{GcEvent, GcTracker};
use super::group::{BlockId, GroupList, IgFlags, PlaceholderData, PlaceholderKind};
use super::instr::{
    BranchKind, GcKind, InsFormat, InsPayload, InstrDesc, LabelId, OpSize, Opcode, RegMask, VarSet,
};
use super::jumps::{self, AlignSite, JumpForms, JumpSite};
use super::memory::ExecutableMemory;
use super::output::{CodeSink, Reloc, RelocKind};
use crate::config::EmitConfig;
use crate::error::EmitError;

/// Filler for the over-provisioned tail of a code buffer.
const CODE_FILL_BYTE: u8 = 0xCC;

/// Conservative size charged for a placeholder region until it is generated.
const MAX_PLACEHOLDER_SIZE: u32 = 256;

/// Hard cap on instructions per group; the count field is one byte wide.
const MAX_GROUP_INSTRS: usize = 255;

/// Context handed to the target encoder for one instruction.
#[derive(Debug, Clone, Copy)]
pub struct EncodeCtx {
    /// Final code offset of the instruction being encoded
    pub offs: u32,
    /// Resolved target offset, for branches
    pub target_offs: Option<u32>,
    /// Position-independent output was requested
    pub relocatable: bool,
}

/// What the encoder produced for one instruction.
#[derive(Debug, Clone, Copy)]
pub struct Encoded {
    /// Actual encoded size in bytes
    pub size: u8,
    /// Where a branch immediate landed, as (offset within the encoding,
    /// width in bytes). Immediates are little-endian relative offsets; the
    /// emitter may adjust them in place after all groups are rendered.
    pub branch_imm: Option<(u8, u8)>,
}

/// The target-specific instruction encoder. The emitter treats it as a
/// black box that sizes and renders one instruction at a time.
pub trait InstrEncoder {
    /// Worst-case size estimate, assigned when the instruction is appended.
    /// The final encoding must never exceed it.
    fn estimate(&self, id: &InstrDesc) -> u8;

    /// Encoding forms available for a jump instruction.
    fn jump_forms(&self, id: &InstrDesc) -> JumpForms;

    /// Render `id` into `sink`. Alignment pseudo-ops must encode exactly
    /// `id.est_size` bytes of padding.
    fn encode(&mut self, id: &InstrDesc, ctx: &EncodeCtx, sink: &mut CodeSink) -> Encoded;
}

/// Call-site information supplied by the code generator.
#[derive(Debug, Clone, Default)]
pub struct CallInfo {
    /// Object-reference registers live across the call
    pub gc_refs: RegMask,
    /// Interior-pointer registers live across the call
    pub byrefs: RegMask,
    /// Argument slots this call consumes
    pub arg_cnt: u32,
    /// GC kind of the second return register
    pub ret2_kind: GcKind,
    /// Helper that provably cannot trigger a collection
    pub no_gc: bool,
}

/// An opaque, comparable position in the instruction stream. Stays valid
/// across further emission; once offsets are final it can be turned into a
/// byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitLocation {
    ig_num: u32,
    ins_cnt: u32,
}

/// Identity of a placeholder handed back to the code generator during
/// materialization.
#[derive(Debug, Clone, Copy)]
pub struct PlaceholderHandle {
    pub kind: PlaceholderKind,
    pub block: BlockId,
}

/// Scratch state for the group currently being filled.
struct Scratch {
    ig: usize,
    instrs: Vec<InstrDesc>,
    size: u32,
    /// Jump instructions in this group, as (index, offset) pairs
    pending_jumps: Vec<(usize, u32)>,
    /// Alignment instructions in this group, as (index, boundary) pairs
    pending_aligns: Vec<(usize, u32)>,
}

/// A branch immediate that may need correction after all groups render.
struct BranchFixup {
    cold: bool,
    pos: usize,
    width: u8,
    target: usize,
    assumed: u32,
}

/// Finished output of one method compilation.
#[derive(Debug)]
pub struct EmitOutput {
    pub hot: Vec<u8>,
    /// Bytes of `hot` that are code (the rest is filler)
    pub hot_code_size: u32,
    pub cold: Option<Vec<u8>>,
    pub cold_code_size: u32,
    /// Read-only constant data referenced by the code
    pub rodata: Option<Vec<u8>>,
    /// GC liveness transitions, tagged with final code offsets
    pub gc_events: Vec<GcEvent>,
    pub prolog_size: u32,
    /// Common size of every epilog in the method
    pub epilog_size: u32,
    /// Relocation requests for the external recorder
    pub relocs: Vec<Reloc>,
    /// Alignment to request for the hot buffer
    pub hot_align: u32,
}

/// Code buffers copied into executable memory.
pub struct LoadedCode {
    pub hot: ExecutableMemory,
    pub cold: Option<ExecutableMemory>,
}

impl EmitOutput {
    /// Copy the finished buffers into executable memory and flip them to
    /// read+execute. This is the only call in the pipeline that can fail
    /// for resource reasons.
    pub fn load(&self) -> Result<LoadedCode, EmitError> {
        let mut hot = ExecutableMemory::new(self.hot.len(), self.hot_align as usize)?;
        hot.write(0, &self.hot)?;
        hot.make_executable()?;
        let cold = match &self.cold {
            Some(bytes) => {
                let mut mem = ExecutableMemory::new(bytes.len(), self.hot_align as usize)?;
                mem.write(0, bytes)?;
                mem.make_executable()?;
                Some(mem)
            }
            None => None,
        };
        Ok(LoadedCode { hot, cold })
    }
}

/// The emitter driver; see the module docs for the pipeline.
pub struct Emitter<E: InstrEncoder> {
    cfg: EmitConfig,
    enc: E,
    groups: GroupList,
    scratch: Option<Scratch>,
    gc: GcTracker,
    jumps: Vec<JumpSite>,
    aligns: Vec<AlignSite>,
    labels: HashMap<LabelId, usize>,
    data: Vec<u8>,
    /// Label-valued data entries, as (section offset, label) pairs
    data_labels: Vec<(u32, LabelId)>,

    // Emission-time GC state: the current live sets, and the sets as of the
    // previously sealed non-extension group (for snapshot elision and for
    // placeholder capture).
    cur_gc_vars: VarSet,
    cur_gc_refs: RegMask,
    cur_byrefs: RegMask,
    prev_gc_vars: VarSet,
    prev_gc_refs: RegMask,
    prev_byrefs: RegMask,
    /// The next sealed group must store a full GC snapshot
    force_store: bool,

    nogc_depth: u32,
    cur_func: u16,
    in_cold: bool,
    /// When generating a placeholder, new groups splice after this one
    insert_cursor: Option<usize>,

    ph_head: Option<usize>,
    ph_tail: Option<usize>,

    prolog_size: u32,
    epilog_size: Option<u32>,
    epilog_cnt: u32,
    resolved: bool,
}

impl<E: InstrEncoder> Emitter<E> {
    pub fn new(cfg: EmitConfig, enc: E) -> Result<Self, EmitError> {
        cfg.validate()?;
        let gc = GcTracker::new(&cfg);
        let mut em = Self {
            cfg,
            enc,
            groups: GroupList::new(),
            scratch: None,
            gc,
            jumps: Vec::new(),
            aligns: Vec::new(),
            labels: HashMap::new(),
            data: Vec::new(),
            data_labels: Vec::new(),
            cur_gc_vars: VarSet::new(),
            cur_gc_refs: RegMask::NONE,
            cur_byrefs: RegMask::NONE,
            prev_gc_vars: VarSet::new(),
            prev_gc_refs: RegMask::NONE,
            prev_byrefs: RegMask::NONE,
            force_store: false,
            nogc_depth: 0,
            cur_func: 0,
            in_cold: false,
            insert_cursor: None,
            ph_head: None,
            ph_tail: None,
            prolog_size: 0,
            epilog_size: None,
            epilog_cnt: 0,
            resolved: false,
        };
        em.begin_group(IgFlags::empty());
        Ok(em)
    }

    pub fn config(&self) -> &EmitConfig {
        &self.cfg
    }

    pub fn groups(&self) -> &GroupList {
        &self.groups
    }

    pub fn gc(&self) -> &GcTracker {
        &self.gc
    }

    /// Tracked-slot registration, delegated to the GC tracker.
    pub fn track_slot(
        &mut self,
        index: usize,
        frame_offs: i32,
        kind: GcKind,
    ) -> Result<(), EmitError> {
        self.gc.track_slot(index, frame_offs, kind)
    }

    // ==================== group lifecycle ====================

    fn begin_group(&mut self, mut flags: IgFlags) -> usize {
        if self.nogc_depth > 0 {
            flags |= IgFlags::NOGC;
        }
        if self.in_cold {
            flags |= IgFlags::COLD;
        }
        let ig = match self.insert_cursor {
            Some(after) => {
                let idx = self.groups.insert_after(after, self.cur_func, flags);
                self.insert_cursor = Some(idx);
                idx
            }
            None => self.groups.push_group(self.cur_func, flags),
        };
        let g = self.groups.get_mut(ig);
        g.gc_refs = self.cur_gc_refs;
        g.byrefs = self.cur_byrefs;
        self.scratch = Some(Scratch {
            ig,
            instrs: Vec::with_capacity(self.cfg.group_capacity.min(MAX_GROUP_INSTRS)),
            size: 0,
            pending_jumps: Vec::new(),
            pending_aligns: Vec::new(),
        });
        ig
    }

    /// Seal the current group: decide its GC snapshot, move the scratch
    /// content into permanent storage, and migrate this group's jump and
    /// alignment entries onto the global side lists in order. Sealing an
    /// empty group is legal and cheap.
    fn seal_group(&mut self) -> usize {
        let scratch = self.scratch.take().expect("no open group to seal");
        let ig_idx = scratch.ig;
        let is_extend = self.groups.get(ig_idx).flags.contains(IgFlags::EXTEND);

        if !is_extend {
            let store_vars = self.force_store || self.cur_gc_vars != self.prev_gc_vars;
            let g = self.groups.get_mut(ig_idx);
            if store_vars {
                g.flags |= IgFlags::GC_VARS;
                g.gc_vars = Some(self.cur_gc_vars.clone());
                self.force_store = false;
            }
            if self.cur_byrefs != self.prev_byrefs {
                g.flags |= IgFlags::BYREF_REGS;
            }
            self.prev_gc_vars = self.cur_gc_vars.clone();
            self.prev_gc_refs = self.cur_gc_refs;
            self.prev_byrefs = self.cur_byrefs;
        }

        let g = self.groups.get_mut(ig_idx);
        g.size = scratch.size;
        g.instrs = scratch.instrs;
        for (ins, offs) in scratch.pending_jumps {
            self.jumps.push(JumpSite {
                ig: ig_idx,
                ins,
                offs,
            });
        }
        for (ins, boundary) in scratch.pending_aligns {
            self.aligns.push(AlignSite {
                ig: ig_idx,
                ins,
                boundary,
                head: usize::MAX,
                end: None,
                enabled: true,
            });
        }
        ig_idx
    }

    fn cur_nonempty(&self) -> bool {
        self.scratch.as_ref().is_some_and(|s| !s.instrs.is_empty())
    }

    fn ensure_group(&mut self) {
        if self.scratch.is_none() {
            self.begin_group(IgFlags::empty());
        }
    }

    /// Seal the current group and open a continuation that inherits its GC
    /// state and region flags. Used when the scratch buffer runs out; the
    /// caller of `emit_instr` never notices.
    fn extend_group(&mut self) {
        let prev_flags = self.groups.get(self.scratch.as_ref().unwrap().ig).flags;
        self.seal_group();
        self.begin_group((prev_flags & IgFlags::propagate()) | IgFlags::EXTEND);
    }

    /// Unconditionally start a new (non-extension) group.
    pub fn new_group(&mut self) {
        self.ensure_group();
        self.seal_group();
        self.begin_group(IgFlags::empty());
    }

    /// Start a new group only if the current one has content.
    pub fn new_group_if_nonempty(&mut self) {
        if self.cur_nonempty() {
            self.new_group();
        }
    }

    /// Bind `label` to the start of the next instruction emitted. Labels
    /// always start a fresh group so they can be jump targets.
    pub fn define_label(&mut self, label: LabelId) {
        self.new_group_if_nonempty();
        self.ensure_group();
        let ig = self.scratch.as_ref().unwrap().ig;
        self.labels.insert(label, ig);
    }

    /// Switch emission to the given function/funclet index; new groups are
    /// tagged with it.
    pub fn set_current_func(&mut self, func_idx: u16) {
        if self.cur_func != func_idx {
            self.new_group_if_nonempty();
            self.cur_func = func_idx;
            if let Some(s) = &self.scratch {
                self.groups.get_mut(s.ig).func_idx = func_idx;
            }
        }
    }

    /// Everything emitted from here on is cold code.
    pub fn mark_cold_start(&mut self) {
        self.in_cold = true;
        if self.cur_nonempty() {
            self.seal_group();
            self.begin_group(IgFlags::empty());
        } else {
            self.ensure_group();
            let ig = self.scratch.as_ref().unwrap().ig;
            self.groups.get_mut(ig).flags |= IgFlags::COLD;
        }
    }

    // ==================== instruction append ====================

    /// Append one instruction. Never fails: if the scratch buffer or the
    /// per-group instruction cap is exhausted, the group is sealed and an
    /// extension group opened transparently.
    pub fn emit_instr(&mut self, mut id: InstrDesc) {
        id.est_size = self.enc.estimate(&id);
        self.push_instr(id);
    }

    fn push_instr(&mut self, id: InstrDesc) {
        self.ensure_group();
        let cap = self.cfg.group_capacity.min(MAX_GROUP_INSTRS);
        let full = {
            let s = self.scratch.as_ref().unwrap();
            s.instrs.len() >= cap
        };
        if full || (self.cfg.stress_split_groups && self.cur_nonempty()) {
            self.extend_group();
        }
        let s = self.scratch.as_mut().unwrap();
        let offs = s.size;
        if id.is_jump() {
            s.pending_jumps.push((s.instrs.len(), offs));
        }
        if let InsPayload::Align { boundary } = id.payload {
            s.pending_aligns.push((s.instrs.len(), boundary));
        }
        s.size += id.est_size as u32;
        s.instrs.push(id);
    }

    /// Append a branch to a symbolic label. Emitted at the largest form;
    /// convergence shrinks it later.
    pub fn emit_jump(&mut self, opcode: Opcode, kind: BranchKind, target: LabelId) {
        let mut id = InstrDesc::new(opcode, InsFormat::Label, OpSize::Quad);
        id.payload = InsPayload::Jump {
            kind,
            target,
            bound: None,
        };
        self.emit_instr(id);
    }

    /// Append a call carrying its GC snapshot; the pending-argument state
    /// is captured here and the arguments popped.
    pub fn emit_call(&mut self, opcode: Opcode, info: CallInfo) {
        let (arg_refs, arg_byrefs) = self.gc.pending_args();
        self.gc.pop_args(info.arg_cnt);
        let mut id = InstrDesc::new(opcode, InsFormat::Call, OpSize::Quad);
        id.payload = InsPayload::Call {
            gc_refs: info.gc_refs,
            byrefs: info.byrefs,
            arg_cnt: info.arg_cnt,
            arg_refs,
            arg_byrefs,
            ret2_kind: info.ret2_kind,
            no_gc: info.no_gc,
        };
        self.emit_instr(id);
    }

    /// Reserve alignment padding so the next group starts on the configured
    /// loop boundary, and force that group boundary. No-op unless loop
    /// alignment is enabled.
    pub fn align_loop(&mut self) {
        if !self.cfg.align_loops {
            return;
        }
        self.ensure_group();
        let mut id = InstrDesc::new(Opcode(0), InsFormat::Align, OpSize::Byte);
        id.payload = InsPayload::Align {
            boundary: self.cfg.loop_align_boundary,
        };
        id.est_size = self.cfg.max_align_padding as u8;
        self.push_instr(id);
        let align_ig = self.scratch.as_ref().unwrap().ig;
        self.groups.get_mut(align_ig).flags |= IgFlags::LOOP_ALIGN;
        self.seal_group();
        let head = self.begin_group(IgFlags::empty());
        // The seal above flushed the pending align entry; aim it at the
        // group that now starts the loop
        let site = self.aligns.last_mut().expect("align entry just flushed");
        site.head = head;
    }

    /// Note that the jump just emitted (or about to be emitted) closes the
    /// loop starting at `head_label`. Ends the extent of the matching
    /// alignment site.
    pub fn record_loop_back_edge(&mut self, head_label: LabelId) {
        let Some(&head_ig) = self.labels.get(&head_label) else {
            return;
        };
        let cur_ig = match &self.scratch {
            Some(s) => s.ig,
            None => match self.groups.tail() {
                Some(t) => t,
                None => return,
            },
        };
        for site in self.aligns.iter_mut().rev() {
            if site.head == head_ig && site.end.is_none() {
                site.end = Some(cur_ig);
                break;
            }
        }
    }

    // ==================== GC state ====================

    /// Replace the current live tracked-variable set.
    pub fn set_live_vars(&mut self, vars: VarSet) {
        self.cur_gc_vars = vars;
    }

    /// Replace one kind's current live register mask. A register entering
    /// one kind leaves the other; the two stay disjoint.
    pub fn set_live_regs(&mut self, kind: GcKind, mask: RegMask) {
        match kind {
            GcKind::Ref => {
                self.cur_gc_refs = mask;
                self.cur_byrefs = self.cur_byrefs - mask;
            }
            GcKind::Byref => {
                self.cur_byrefs = mask;
                self.cur_gc_refs = self.cur_gc_refs - mask;
            }
            GcKind::None => {}
        }
    }

    pub fn live_gc_refs(&self) -> RegMask {
        self.cur_gc_refs
    }

    pub fn live_byrefs(&self) -> RegMask {
        self.cur_byrefs
    }

    /// Push a pending call argument.
    pub fn push_arg(&mut self, kind: GcKind) -> Result<(), EmitError> {
        self.gc.push_arg(kind)
    }

    /// Pop pending call arguments without a call (a kill).
    pub fn pop_args(&mut self, n: u32) {
        self.gc.pop_args(n);
    }

    /// Enter a region where GC interrupts are not allowed. Nested calls
    /// must balance.
    pub fn disable_gc(&mut self) {
        self.nogc_depth += 1;
        if self.nogc_depth == 1 {
            self.new_group_if_nonempty();
            self.ensure_group();
            let ig = self.scratch.as_ref().unwrap().ig;
            self.groups.get_mut(ig).flags |= IgFlags::NOGC;
        }
    }

    /// Leave a no-GC region.
    pub fn enable_gc(&mut self) -> Result<(), EmitError> {
        if self.nogc_depth == 0 {
            return Err(EmitError::internal("unbalanced no-GC region end"));
        }
        self.nogc_depth -= 1;
        if self.nogc_depth == 0 {
            self.new_group_if_nonempty();
        }
        Ok(())
    }

    // ==================== placeholders ====================

    /// Reserve a region for a prolog/epilog generated out of order. The
    /// current group is sealed if non-empty, the fresh group is converted
    /// in place, and a conservative maximum size is charged until the
    /// region is materialized.
    pub fn create_placeholder(
        &mut self,
        kind: PlaceholderKind,
        block: BlockId,
        gc_vars: VarSet,
        gc_refs: RegMask,
        byrefs: RegMask,
        last: bool,
    ) {
        let extend = kind.is_epilog();
        if extend {
            // An epilog ends any open no-GC region; code after it must ask
            // again explicitly
            self.nogc_depth = 0;
        }

        if self.cur_nonempty() {
            let prev_flags = self.groups.get(self.scratch.as_ref().unwrap().ig).flags;
            self.seal_group();
            let flags = if extend {
                (prev_flags & IgFlags::propagate()) | IgFlags::EXTEND
            } else {
                IgFlags::empty()
            };
            self.begin_group(flags);
        } else {
            self.ensure_group();
        }

        // Capture "previous region" state before overwriting anything
        let prev_vars = self.prev_gc_vars.clone();
        let prev_refs = self.prev_gc_refs;
        let prev_byrefs = self.prev_byrefs;

        if !extend {
            self.cur_gc_vars = gc_vars.clone();
            self.cur_gc_refs = gc_refs;
            self.cur_byrefs = byrefs;
        }

        let ig = self.scratch.take().expect("placeholder group open").ig;
        let g = self.groups.get_mut(ig);
        g.func_idx = self.cur_func;
        g.flags |= IgFlags::PLACEHOLDER;
        g.flags |= match kind {
            PlaceholderKind::Prolog => IgFlags::PROLOG,
            PlaceholderKind::Epilog => IgFlags::EPILOG,
            PlaceholderKind::FuncletProlog => IgFlags::FUNCLET_PROLOG,
            PlaceholderKind::FuncletEpilog => IgFlags::FUNCLET_EPILOG,
        };
        if extend {
            g.flags |= IgFlags::EXTEND;
        }
        g.size = MAX_PLACEHOLDER_SIZE;
        g.gc_refs = self.cur_gc_refs;
        g.byrefs = self.cur_byrefs;
        g.ph = Some(Box::new(PlaceholderData {
            kind,
            block,
            init_gc_vars: if extend {
                self.cur_gc_vars.clone()
            } else {
                gc_vars
            },
            init_gc_refs: self.cur_gc_refs,
            init_byrefs: self.cur_byrefs,
            prev_gc_vars: prev_vars,
            prev_gc_refs: prev_refs,
            prev_byrefs,
            next: None,
        }));

        match self.ph_tail {
            Some(tail) => {
                self.groups
                    .get_mut(tail)
                    .ph
                    .as_mut()
                    .expect("placeholder list tail")
                    .next = Some(ig)
            }
            None => self.ph_head = Some(ig),
        }
        self.ph_tail = Some(ig);

        if !last {
            self.begin_group(IgFlags::empty());
            // The true GC state leaving the reserved region is unknown, so
            // the next snapshot may not be elided
            self.force_store = true;
        }
    }

    /// Materialize every placeholder in creation order: restore the GC
    /// state captured at creation, hand the now-active group to `gen` to
    /// fill, then seal it. Epilog regions are checked for size uniformity.
    pub fn materialize_placeholders<F>(&mut self, mut generate: F) -> Result<(), EmitError>
    where
        F: FnMut(&mut Self, &PlaceholderHandle) -> Result<(), EmitError>,
    {
        if self.scratch.is_some() {
            self.seal_group();
        }
        let mut cur_ph = self.ph_head;
        while let Some(ig) = cur_ph {
            let ph = self
                .groups
                .get_mut(ig)
                .ph
                .take()
                .ok_or_else(|| EmitError::internal("placeholder list node lost its data"))?;
            cur_ph = ph.next;

            // Resume exactly where creation left off
            self.cur_gc_vars = ph.init_gc_vars.clone();
            self.cur_gc_refs = ph.init_gc_refs;
            self.cur_byrefs = ph.init_byrefs;
            self.prev_gc_vars = ph.prev_gc_vars.clone();
            self.prev_gc_refs = ph.prev_gc_refs;
            self.prev_byrefs = ph.prev_byrefs;

            let g = self.groups.get_mut(ig);
            g.flags.remove(IgFlags::PLACEHOLDER);
            g.size = 0;
            self.cur_func = g.func_idx;
            self.scratch = Some(Scratch {
                ig,
                instrs: Vec::new(),
                size: 0,
                pending_jumps: Vec::new(),
                pending_aligns: Vec::new(),
            });
            self.insert_cursor = Some(ig);

            let handle = PlaceholderHandle {
                kind: ph.kind,
                block: ph.block,
            };
            generate(self, &handle)?;
            self.seal_group();

            // Overflow extensions spliced after the region belong to it
            let chain_end = self.insert_cursor.take().unwrap_or(ig);
            let mut region_size = 0u32;
            let mut cur = ig;
            loop {
                region_size += self.groups.get(cur).size;
                if cur == chain_end {
                    break;
                }
                cur = self
                    .groups
                    .next_of(cur)
                    .ok_or_else(|| EmitError::internal("placeholder chain broken"))?;
            }

            match ph.kind {
                PlaceholderKind::Prolog => self.prolog_size = region_size,
                PlaceholderKind::Epilog => {
                    self.epilog_cnt += 1;
                    match self.epilog_size {
                        None => self.epilog_size = Some(region_size),
                        Some(expected) if expected == region_size => {}
                        Some(expected) => {
                            return Err(EmitError::internal(format!(
                                "epilog size {} differs from earlier epilog size {}",
                                region_size, expected
                            )));
                        }
                    }
                }
                PlaceholderKind::FuncletProlog | PlaceholderKind::FuncletEpilog => {}
            }

            // Whatever comes after resumed out-of-order code must store a
            // full snapshot
            self.force_store = true;
        }
        self.ph_head = None;
        self.ph_tail = None;
        self.groups.recompute_offsets();
        Ok(())
    }

    // ==================== locations ====================

    /// Capture the current position as an opaque, comparable token.
    pub fn location(&self) -> EmitLocation {
        match &self.scratch {
            Some(s) => EmitLocation {
                ig_num: self.groups.get(s.ig).num,
                ins_cnt: s.instrs.len() as u32,
            },
            None => {
                let tail = self.groups.tail().expect("emitter has no groups");
                let g = self.groups.get(tail);
                EmitLocation {
                    ig_num: g.num,
                    ins_cnt: g.ins_count() as u32,
                }
            }
        }
    }

    /// Is `loc` still the most recent position?
    pub fn is_current_location(&self, loc: EmitLocation) -> bool {
        loc == self.location()
    }

    /// Number of instructions emitted since `loc`, or `None` if the
    /// location's group no longer exists.
    pub fn instrs_since(&self, loc: EmitLocation) -> Option<u32> {
        let start = self.groups.by_num(loc.ig_num)?;
        let mut count = 0u32;
        let mut cur = Some(start);
        while let Some(idx) = cur {
            let in_group = match &self.scratch {
                Some(s) if s.ig == idx => s.instrs.len() as u32,
                _ => self.groups.get(idx).ins_count() as u32,
            };
            count += in_group;
            if idx == start {
                count -= loc.ins_cnt;
            }
            cur = self.groups.next_of(idx);
        }
        Some(count)
    }

    /// Final byte offset of `loc`. Meaningful once sizes have converged.
    pub fn location_offset(&self, loc: EmitLocation) -> Result<u32, EmitError> {
        let ig = self
            .groups
            .by_num(loc.ig_num)
            .ok_or_else(|| EmitError::internal("location names a missing group"))?;
        let g = self.groups.get(ig);
        let within: u32 = g
            .instrs
            .iter()
            .take(loc.ins_cnt as usize)
            .map(|id| id.est_size as u32)
            .sum();
        Ok(g.offs + within)
    }

    // ==================== read-only data ====================

    /// Intern constant data into the read-only section, returning its
    /// section offset.
    pub fn data_const(&mut self, bytes: &[u8], align: usize) -> u32 {
        debug_assert!(align.is_power_of_two());
        while self.data.len() % align != 0 {
            self.data.push(0);
        }
        let offs = self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        offs
    }

    /// Reserve a pointer-size read-only data entry holding the final code
    /// offset of `label` (a jump-table slot). Filled in at issue time and
    /// also recorded as a relocation whose `at` is the data-section offset,
    /// so the loader can rebase the entry to an absolute code address.
    pub fn data_label(&mut self, label: LabelId) -> u32 {
        while self.data.len() % 8 != 0 {
            self.data.push(0);
        }
        let offs = self.data.len() as u32;
        self.data.extend_from_slice(&[0u8; 8]);
        self.data_labels.push((offs, label));
        offs
    }

    // ==================== final generation ====================

    /// Converge jump and alignment sizes. After this, every group offset is
    /// exact and `issue` may run.
    pub fn resolve(&mut self) -> Result<(), EmitError> {
        if self.ph_head.is_some() {
            return Err(EmitError::internal(
                "unmaterialized placeholders at resolve time",
            ));
        }
        if self.nogc_depth != 0 {
            return Err(EmitError::internal("no-GC region still open at resolve"));
        }
        if self.scratch.is_some() {
            self.seal_group();
        }
        self.groups.recompute_offsets();

        if self.cfg.align_loops {
            jumps::plan_alignment(&mut self.groups, &mut self.aligns, &self.cfg)?;
        }
        {
            let enc = &self.enc;
            jumps::bind_jump_distances(&mut self.groups, &mut self.jumps, &self.labels, |id| {
                enc.jump_forms(id)
            })?;
        }
        if self.cfg.align_loops {
            jumps::adjust_alignment(&mut self.groups, &self.aligns);
        }
        self.groups.check_offsets()?;
        self.resolved = true;
        Ok(())
    }

    /// Render every group to bytes and collect the GC metadata. Phases:
    /// compute hot/cold sizes, allocate exact-size buffers, issue every
    /// instruction through the encoder, then patch forward branch
    /// immediates whose targets moved.
    pub fn issue(&mut self) -> Result<EmitOutput, EmitError> {
        if !self.resolved {
            self.resolve()?;
        }

        // Phase A: sizes, and the hot/cold partition
        let mut total = 0u32;
        let mut cold_start: Option<u32> = None;
        for ig in self.groups.iter() {
            if ig.is_cold() {
                cold_start.get_or_insert(ig.offs);
            } else if cold_start.is_some() {
                return Err(EmitError::internal(
                    "hot group found after the cold section start",
                ));
            }
            total += ig.size;
        }
        let hot_size = cold_start.unwrap_or(total);
        let cold_size = total - hot_size;

        // Phase B: exact-size output buffers
        let mut hot = CodeSink::new(0, hot_size as usize);
        let mut cold = if cold_size > 0 {
            Some(CodeSink::new(hot_size, cold_size as usize))
        } else {
            None
        };

        // Phase C: issue each group
        let mut adj = 0u32; // issuance-time shrinkage within the section
        let mut fixups: Vec<BranchFixup> = Vec::new();
        let ids: Vec<usize> = self.groups.ids().collect();
        for ig_idx in ids {
            let (rec_offs, is_cold, is_extend, in_epilog, flags) = {
                let g = self.groups.get(ig_idx);
                (g.offs, g.is_cold(), g.is_extension(), g.in_epilog(), g.flags)
            };
            if is_cold && adj > 0 && self.groups.prev_of(ig_idx).is_some_and(|p| !self.groups.get(p).is_cold()) {
                // Hot shrinkage pads the hot tail; it does not move cold code
                adj = 0;
            }
            let sink = match (is_cold, cold.as_mut()) {
                (true, Some(c)) => c,
                _ => &mut hot,
            };
            if rec_offs as i64 - adj as i64 != sink.offset() as i64 {
                return Err(EmitError::internal(format!(
                    "group IG{:02} offset {:#x} does not match output cursor {:#x}",
                    self.groups.get(ig_idx).num,
                    rec_offs,
                    sink.offset()
                )));
            }
            self.groups.get_mut(ig_idx).offs = sink.offset();

            self.gc.set_suppress(in_epilog);
            if !is_extend {
                let at = sink.offset();
                let (gc_refs, byrefs, gc_vars) = {
                    let g = self.groups.get(ig_idx);
                    (g.gc_refs, g.byrefs, g.gc_vars.clone())
                };
                if flags.contains(IgFlags::GC_VARS) {
                    if let Some(vars) = &gc_vars {
                        self.gc.update_live_vars(vars, at);
                    }
                }
                self.gc.update_live_regs(GcKind::Ref, gc_refs, at)?;
                self.gc.update_live_regs(GcKind::Byref, byrefs, at)?;
            }

            let n = self.groups.get(ig_idx).instrs.len();
            let mut group_size = 0u32;
            for i in 0..n {
                let id = self.groups.get(ig_idx).instrs[i].clone();
                let target = match id.payload {
                    InsPayload::Jump { bound, .. } => {
                        let t = bound
                            .ok_or_else(|| EmitError::internal("unbound jump at issue time"))?;
                        Some(t)
                    }
                    _ => None,
                };
                let target_offs = target.map(|t| self.groups.get(t).offs);
                let ctx = EncodeCtx {
                    offs: sink.offset(),
                    target_offs,
                    relocatable: self.cfg.relocatable,
                };
                let pos_before = sink.pos();
                let enc_res = self.enc.encode(&id, &ctx, sink);
                let actual = enc_res.size;
                if sink.pos() - pos_before != actual as usize {
                    return Err(EmitError::internal(format!(
                        "encoder reported {} bytes for {} but wrote {}",
                        actual,
                        id.opcode,
                        sink.pos() - pos_before
                    )));
                }
                if actual > id.est_size && !id.is_align() {
                    return Err(EmitError::internal(format!(
                        "{} encoded to {} bytes, over its {}-byte estimate",
                        id.opcode, actual, id.est_size
                    )));
                }
                if actual < id.est_size {
                    adj += (id.est_size - actual) as u32;
                    self.groups.get_mut(ig_idx).flags |= IgFlags::UPD_SIZE;
                }
                group_size += actual as u32;

                if let (Some(t), Some((rel, width))) = (target, enc_res.branch_imm) {
                    fixups.push(BranchFixup {
                        cold: is_cold,
                        pos: pos_before + rel as usize,
                        width,
                        target: t,
                        assumed: target_offs.unwrap(),
                    });
                }

                // Per-instruction GC effects, at the instruction's end
                let end_offs = sink.offset();
                if let Some(reg) = id.dst_reg {
                    self.gc.def_reg(reg, id.gc_kind, end_offs);
                }
                if let InsPayload::Call {
                    gc_refs,
                    byrefs,
                    arg_cnt,
                    arg_refs,
                    arg_byrefs,
                    no_gc,
                    ..
                } = id.payload
                {
                    self.gc.record_call(
                        end_offs, actual, gc_refs, byrefs, arg_cnt, arg_refs, arg_byrefs, no_gc,
                    );
                }
            }
            self.groups.get_mut(ig_idx).size = group_size;
        }
        self.gc.set_suppress(false);
        self.gc.assert_disjoint()?;

        // The allocation is the Phase A size; cover any shrinkage with
        // filler that is not counted as code
        let hot_code_size = hot.pos() as u32;
        hot.pad_to(hot_size as usize, CODE_FILL_BYTE);
        let cold_code_size = cold.as_ref().map_or(0, |c| c.pos() as u32);
        if let Some(c) = cold.as_mut() {
            c.pad_to(cold_size as usize, CODE_FILL_BYTE);
        }

        // Phase D: correct branch immediates whose targets moved during
        // issuance
        for f in fixups {
            let true_offs = self.groups.get(f.target).offs;
            if true_offs != f.assumed {
                let delta = true_offs as i64 - f.assumed as i64;
                let sink = if f.cold {
                    cold.as_mut().expect("cold fixup without cold sink")
                } else {
                    &mut hot
                };
                sink.patch_add(f.pos, f.width, delta as i32);
            }
        }

        let (hot_bytes, mut relocs) = hot.into_parts();
        let cold_parts = cold.map(|c| c.into_parts());
        let cold_bytes = match cold_parts {
            Some((bytes, mut cold_relocs)) => {
                relocs.append(&mut cold_relocs);
                Some(bytes)
            }
            None => None,
        };

        // Label-valued data entries hold final code offsets now that the
        // layout is fixed; the loader rebases them via the relocation
        for &(at, label) in &self.data_labels {
            let ig = *self.labels.get(&label).ok_or_else(|| {
                EmitError::internal(format!("data entry refers to undefined label L{}", label.0))
            })?;
            let code_offs = self.groups.get(ig).offs;
            let at_us = at as usize;
            self.data[at_us..at_us + 8].copy_from_slice(&u64::from(code_offs).to_le_bytes());
            relocs.push(Reloc {
                at,
                kind: RelocKind::Abs64,
                target: u64::from(code_offs),
            });
        }

        log::debug!(
            "issued {} bytes hot, {} bytes cold, {} GC events",
            hot_code_size,
            cold_code_size,
            self.gc.events().len()
        );

        Ok(EmitOutput {
            hot: hot_bytes,
            hot_code_size,
            cold: cold_bytes,
            cold_code_size,
            rodata: if self.data.is_empty() {
                None
            } else {
                Some(std::mem::take(&mut self.data))
            },
            gc_events: self.gc.take_events(),
            prolog_size: self.prolog_size,
            epilog_size: self.epilog_size.unwrap_or(0),
            relocs,
            hot_align: self.cfg.hot_code_align,
        })
    }
}
