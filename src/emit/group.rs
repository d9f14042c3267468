//! Instruction groups and the per-method group list.
//!
//! A group is a contiguous run of instructions emitted as a unit; it owns its
//! byte offset and size and a snapshot of the GC register state on entry.
//! Groups live in an index-based arena with explicit next/prev links, so
//! placeholder materialization can splice continuation groups into the middle
//! of the list without shifting storage.

use super::instr::{InstrDesc, RegMask, VarSet};
use crate::error::EmitError;

/// Opaque token identifying the code generator's basic block that a
/// placeholder group stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

/// Region kinds that can be reserved for out-of-order generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    Prolog,
    Epilog,
    FuncletProlog,
    FuncletEpilog,
}

impl PlaceholderKind {
    pub fn is_epilog(self) -> bool {
        matches!(self, PlaceholderKind::Epilog | PlaceholderKind::FuncletEpilog)
    }

    pub fn is_prolog(self) -> bool {
        matches!(self, PlaceholderKind::Prolog | PlaceholderKind::FuncletProlog)
    }
}

bitflags::bitflags! {
    /// Group flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IgFlags: u16 {
        /// Method prolog
        const PROLOG = 1 << 0;
        /// Method epilog
        const EPILOG = 1 << 1;
        /// Funclet prolog
        const FUNCLET_PROLOG = 1 << 2;
        /// Funclet epilog
        const FUNCLET_EPILOG = 1 << 3;
        /// Reserved region awaiting out-of-order generation
        const PLACEHOLDER = 1 << 4;
        /// Continues the previous group's GC state (buffer overflow split)
        const EXTEND = 1 << 5;
        /// Carries a stored live-variable snapshot
        const GC_VARS = 1 << 6;
        /// Carries a live-byref-register word
        const BYREF_REGS = 1 << 7;
        /// GC interrupts are not allowed in this group
        const NOGC = 1 << 8;
        /// Ends with alignment padding for a following loop head
        const LOOP_ALIGN = 1 << 9;
        /// First group of the cold section, and all groups after it
        const COLD = 1 << 10;
        /// An instruction size estimate in this group was corrected
        const UPD_SIZE = 1 << 11;
    }
}

impl IgFlags {
    /// Flags an extension group inherits from the group it continues.
    pub fn propagate() -> IgFlags {
        IgFlags::PROLOG
            | IgFlags::EPILOG
            | IgFlags::FUNCLET_PROLOG
            | IgFlags::FUNCLET_EPILOG
            | IgFlags::NOGC
            | IgFlags::COLD
    }
}

/// Side data for a placeholder group: which region it reserves, which block
/// it corresponds to, and the GC state needed to resume generation there.
#[derive(Debug, Clone)]
pub struct PlaceholderData {
    pub kind: PlaceholderKind,
    pub block: BlockId,
    /// Live state as of entry to the region
    pub init_gc_vars: VarSet,
    pub init_gc_refs: RegMask,
    pub init_byrefs: RegMask,
    /// Live state as of the previous region, restored so materialization
    /// behaves exactly like in-line emission would have
    pub prev_gc_vars: VarSet,
    pub prev_gc_refs: RegMask,
    pub prev_byrefs: RegMask,
    /// Next placeholder in creation order
    pub next: Option<usize>,
}

/// One instruction group.
#[derive(Debug)]
pub struct InsGroup {
    /// Monotonic sequence number; stable identity before offsets are known
    pub num: u32,
    /// Byte offset from method start; provisional until convergence
    pub offs: u32,
    /// Byte size of the group's code
    pub size: u32,
    /// Function/funclet this group belongs to (0 = root)
    pub func_idx: u16,
    pub flags: IgFlags,
    /// Object-reference registers live on entry
    pub gc_refs: RegMask,
    /// Interior-pointer registers live on entry
    pub byrefs: RegMask,
    /// Stored live-variable snapshot; present only when `GC_VARS` is set
    pub gc_vars: Option<VarSet>,
    /// Sealed instruction storage
    pub instrs: Vec<InstrDesc>,
    /// Placeholder side data while the group is a placeholder
    pub ph: Option<Box<PlaceholderData>>,
    pub(crate) next: Option<usize>,
    pub(crate) prev: Option<usize>,
}

impl InsGroup {
    pub fn ins_count(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_placeholder(&self) -> bool {
        self.flags.contains(IgFlags::PLACEHOLDER)
    }

    pub fn is_extension(&self) -> bool {
        self.flags.contains(IgFlags::EXTEND)
    }

    pub fn in_epilog(&self) -> bool {
        self.flags
            .intersects(IgFlags::EPILOG | IgFlags::FUNCLET_EPILOG)
    }

    pub fn is_cold(&self) -> bool {
        self.flags.contains(IgFlags::COLD)
    }

    /// End offset of the group (offset plus size).
    pub fn end_offs(&self) -> u32 {
        self.offs + self.size
    }
}

/// The ordered list of groups for one method.
#[derive(Debug, Default)]
pub struct GroupList {
    arena: Vec<InsGroup>,
    head: Option<usize>,
    tail: Option<usize>,
    next_num: u32,
}

impl GroupList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn get(&self, idx: usize) -> &InsGroup {
        &self.arena[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut InsGroup {
        &mut self.arena[idx]
    }

    pub fn next_of(&self, idx: usize) -> Option<usize> {
        self.arena[idx].next
    }

    pub fn prev_of(&self, idx: usize) -> Option<usize> {
        self.arena[idx].prev
    }

    /// Append a fresh empty group at the end of the list.
    pub fn push_group(&mut self, func_idx: u16, flags: IgFlags) -> usize {
        let idx = self.arena.len();
        let num = self.next_num;
        self.next_num += 1;
        self.arena.push(InsGroup {
            num,
            offs: 0,
            size: 0,
            func_idx,
            flags,
            gc_refs: RegMask::NONE,
            byrefs: RegMask::NONE,
            gc_vars: None,
            instrs: Vec::new(),
            ph: None,
            next: None,
            prev: self.tail,
        });
        if let Some(tail) = self.tail {
            self.arena[tail].next = Some(idx);
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        idx
    }

    /// Splice a fresh empty group right after `after`, renumbering nothing:
    /// sequence numbers stay creation-ordered, list order is what counts.
    pub fn insert_after(&mut self, after: usize, func_idx: u16, flags: IgFlags) -> usize {
        let idx = self.arena.len();
        let num = self.next_num;
        self.next_num += 1;
        let next = self.arena[after].next;
        self.arena.push(InsGroup {
            num,
            offs: 0,
            size: 0,
            func_idx,
            flags,
            gc_refs: RegMask::NONE,
            byrefs: RegMask::NONE,
            gc_vars: None,
            instrs: Vec::new(),
            ph: None,
            next,
            prev: Some(after),
        });
        self.arena[after].next = Some(idx);
        match next {
            Some(n) => self.arena[n].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        idx
    }

    /// Iterate arena indices in list order.
    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let idx = cur?;
            cur = self.arena[idx].next;
            Some(idx)
        })
    }

    /// Iterate groups in list order.
    pub fn iter(&self) -> impl Iterator<Item = &InsGroup> + '_ {
        self.ids().map(|idx| &self.arena[idx])
    }

    /// Walk the list and reassign every group's offset from the cumulative
    /// sizes. Returns the total code size.
    pub fn recompute_offsets(&mut self) -> u32 {
        let mut offs = 0u32;
        let mut cur = self.head;
        while let Some(idx) = cur {
            self.arena[idx].offs = offs;
            offs += self.arena[idx].size;
            cur = self.arena[idx].next;
        }
        offs
    }

    /// Verify offset continuity: each group starts exactly where the
    /// previous one ends. A mismatch is a fatal bookkeeping defect.
    pub fn check_offsets(&self) -> Result<(), EmitError> {
        let mut expected = 0u32;
        for ig in self.iter() {
            if ig.offs != expected {
                return Err(EmitError::internal(format!(
                    "group IG{:02} offset {:#x} does not match running total {:#x}",
                    ig.num, ig.offs, expected
                )));
            }
            expected += ig.size;
        }
        Ok(())
    }

    /// Find a group by its sequence number.
    pub fn by_num(&self, num: u32) -> Option<usize> {
        self.arena.iter().position(|ig| ig.num == num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_links() {
        let mut list = GroupList::new();
        let a = list.push_group(0, IgFlags::empty());
        let b = list.push_group(0, IgFlags::empty());
        let c = list.push_group(0, IgFlags::empty());
        assert_eq!(list.ids().collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(list.prev_of(b), Some(a));
        assert_eq!(list.next_of(b), Some(c));
        assert_eq!(list.head(), Some(a));
        assert_eq!(list.tail(), Some(c));
    }

    #[test]
    fn test_insert_after_splices() {
        let mut list = GroupList::new();
        let a = list.push_group(0, IgFlags::empty());
        let b = list.push_group(0, IgFlags::empty());
        let mid = list.insert_after(a, 0, IgFlags::EXTEND);
        assert_eq!(list.ids().collect::<Vec<_>>(), vec![a, mid, b]);
        assert_eq!(list.prev_of(b), Some(mid));
        // Sequence numbers stay creation-ordered
        assert!(list.get(mid).num > list.get(b).num);
    }

    #[test]
    fn test_insert_after_tail() {
        let mut list = GroupList::new();
        let a = list.push_group(0, IgFlags::empty());
        let b = list.insert_after(a, 0, IgFlags::empty());
        assert_eq!(list.tail(), Some(b));
    }

    #[test]
    fn test_offsets() {
        let mut list = GroupList::new();
        let a = list.push_group(0, IgFlags::empty());
        let b = list.push_group(0, IgFlags::empty());
        list.get_mut(a).size = 10;
        list.get_mut(b).size = 7;
        assert_eq!(list.recompute_offsets(), 17);
        assert_eq!(list.get(b).offs, 10);
        list.check_offsets().unwrap();

        list.get_mut(b).offs = 12;
        assert!(list.check_offsets().is_err());
    }
}
