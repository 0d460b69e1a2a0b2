//! The value-cell store: owns every SSA value cell of a function.
//!
//! A cell is identified by a [`VarnodeId`] into the store's arena and indexed two ways: by
//! storage location ("loc": space, offset, size, then definition state) and by definition state
//! ("def": inputs, then written, then free). Cells move between states as the editing API links
//! and unlinks them; they are destroyed only in batch sweeps driven by the function container.

use crate::address::{Address, SpaceId, CONST_SPACE};
use crate::error::LowLevelError;
use crate::op::OpId;
use bitflags::bitflags;
use std::collections::BTreeSet;

bitflags! {
    /// Properties of a value cell.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct VarFlags: u32 {
        /// An SSA input: no defining op, value flows in from the caller
        const INPUT = 1 << 0;
        /// A constant-pool cell; the offset is the value
        const CONSTANT = 1 << 1;
        /// Carries an address/op reference rather than a runtime value
        const ANNOTATION = 1 << 2;
        /// Shares its storage address with every cell that aliases it across the function
        const ADDRTIED = 1 << 3;
        /// Must be kept at its storage address in the output
        const ADDRFORCE = 1 << 4;
        /// Has a defining operation
        const WRITTEN = 1 << 5;
        /// Storage persists beyond the lifetime of the function
        const PERSIST = 1 << 6;
        /// Created by an indirect-effect op rather than a direct write
        const INDIRECT_CREATION = 1 << 7;
        /// The base register of an address space (e.g. the stack pointer)
        const SPACEBASE = 1 << 8;
        /// Reads and writes may not be reordered or folded
        const VOLATILE = 1 << 9;
        /// Data-type fixed by the user; propagation may not overwrite it
        const TYPELOCK = 1 << 10;
        /// Name fixed by the user
        const NAMELOCK = 1 << 11;
        /// Backed by read-only memory; reads may fold to constants
        const READONLY = 1 << 12;
        /// Scratch traversal mark; only set inside a scoped mark guard
        const MARK = 1 << 13;
        /// Printed as part of its consumer expression, not as a named variable
        const IMPLIED = 1 << 14;
        /// Printed as an explicit named variable
        const EXPLICIT = 1 << 15;
    }
}

/// Handle to a cell in the [`VarnodeStore`] arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarnodeId(pub(crate) usize);

impl std::fmt::Debug for VarnodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "vn{}", self.0)
    }
}

/// An SSA value cell.
#[derive(Clone, Debug)]
pub struct Varnode {
    /// Storage location.
    pub addr: Address,
    /// Storage size in bytes.
    pub size: u32,
    pub(crate) def: Option<OpId>,
    pub(crate) uses: Vec<OpId>,
    pub flags: VarFlags,
    /// Bits of the value that may possibly be set.
    pub nzmask: u64,
    /// Bits observed by downstream consumers.
    pub consume: u64,
    /// Data-type handle, once propagation has run.
    pub datatype: Option<crate::typeprop::TypeId>,
    /// High-variable handle, once the high-level index is captured.
    pub high: Option<crate::highvar::HighId>,
    /// Symbol entry backing this cell, if any.
    pub symbol: Option<crate::symbols::SymbolId>,
    /// Creation index; cells created after the high-level capture point get fresh
    /// high-variables.
    pub create_index: usize,
    /// Ordering key within the loc index for written cells (the defining op's uniq).
    defkey: u64,
}

impl Varnode {
    /// The defining operation, if the cell is written.
    pub fn def(&self) -> Option<OpId> {
        self.def
    }

    /// The operations reading this cell. An op appears once per input slot referencing the cell.
    pub fn uses(&self) -> &[OpId] {
        &self.uses
    }

    /// The sole reader, if exactly one op reads the cell.
    pub fn lone_use(&self) -> Option<OpId> {
        match self.uses.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.flags.contains(VarFlags::CONSTANT)
    }

    pub fn is_input(&self) -> bool {
        self.flags.contains(VarFlags::INPUT)
    }

    pub fn is_written(&self) -> bool {
        self.flags.contains(VarFlags::WRITTEN)
    }

    /// A free cell: no definition, not an input, not a constant.
    pub fn is_free(&self) -> bool {
        !self
            .flags
            .intersects(VarFlags::WRITTEN | VarFlags::INPUT | VarFlags::CONSTANT)
    }

    /// The constant value carried, for constant cells.
    pub fn constant_value(&self) -> Option<u64> {
        self.is_constant().then_some(self.addr.offset)
    }

    fn def_class(&self) -> u8 {
        if self.is_input() {
            0
        } else if self.is_written() {
            1
        } else {
            2
        }
    }
}

type LocKey = (Address, u32, u8, u64, VarnodeId);
type DefKey = (u8, Address, u32, VarnodeId);

/// Arena plus ordered indexes over all cells of one function.
#[derive(Clone)]
pub struct VarnodeStore {
    arena: Vec<Option<Varnode>>,
    loc_index: BTreeSet<LocKey>,
    def_index: BTreeSet<DefKey>,
    create_count: usize,
    /// Largest cell size ever created; bounds backward overlap scans.
    max_size: u32,
}

impl Default for VarnodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VarnodeStore {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            loc_index: BTreeSet::new(),
            def_index: BTreeSet::new(),
            create_count: 0,
            max_size: 1,
        }
    }

    fn loc_key(&self, id: VarnodeId) -> LocKey {
        let vn = self.get(id);
        (vn.addr, vn.size, vn.def_class(), vn.defkey, id)
    }

    fn def_key(&self, id: VarnodeId) -> DefKey {
        let vn = self.get(id);
        (vn.def_class(), vn.addr, vn.size, id)
    }

    fn index_insert(&mut self, id: VarnodeId) {
        let (lk, dk) = (self.loc_key(id), self.def_key(id));
        self.loc_index.insert(lk);
        self.def_index.insert(dk);
    }

    fn index_remove(&mut self, id: VarnodeId) {
        let (lk, dk) = (self.loc_key(id), self.def_key(id));
        self.loc_index.remove(&lk);
        self.def_index.remove(&dk);
    }

    /// Create a free cell at the given storage. Constant-space cells get the constant flag and
    /// their non-zero mask seeded from the value.
    pub fn create(&mut self, addr: Address, size: u32) -> VarnodeId {
        let id = VarnodeId(self.arena.len());
        let mut flags = VarFlags::empty();
        let mut nzmask = crate::opcode::OpCode::calc_mask(size);
        if addr.space == CONST_SPACE {
            flags |= VarFlags::CONSTANT;
            nzmask = addr.offset & nzmask;
        }
        self.arena.push(Some(Varnode {
            addr,
            size,
            def: None,
            uses: Vec::new(),
            flags,
            nzmask,
            consume: crate::opcode::OpCode::calc_mask(size),
            datatype: None,
            high: None,
            symbol: None,
            create_index: self.create_count,
            defkey: 0,
        }));
        self.create_count += 1;
        self.max_size = self.max_size.max(size);
        self.index_insert(id);
        id
    }

    /// Destroy a cell. The caller must have unlinked it from any def or uses first.
    pub fn destroy(&mut self, id: VarnodeId) {
        assert!(
            self.get(id).def.is_none() && self.get(id).uses.is_empty(),
            "destroying {:?} while still linked",
            id
        );
        self.index_remove(id);
        self.arena[id.0] = None;
    }

    pub fn get(&self, id: VarnodeId) -> &Varnode {
        self.arena[id.0].as_ref().expect("stale VarnodeId")
    }

    pub fn get_mut(&mut self, id: VarnodeId) -> &mut Varnode {
        self.arena[id.0].as_mut().expect("stale VarnodeId")
    }

    /// Whether the id still points at a live cell.
    pub fn is_live(&self, id: VarnodeId) -> bool {
        self.arena.get(id.0).map_or(false, |v| v.is_some())
    }

    /// The creation counter; the high-level capture point is expressed in these units.
    pub fn create_count(&self) -> usize {
        self.create_count
    }

    /// Attach a defining op. The cell must not already be defined or be a constant.
    pub(crate) fn set_def(&mut self, id: VarnodeId, op: OpId, op_uniq: u64) {
        assert!(
            !self.get(id).is_constant(),
            "constants cannot be written: {:?}",
            id
        );
        self.index_remove(id);
        let vn = self.get_mut(id);
        assert!(vn.def.is_none(), "{:?} already has a definition", id);
        vn.def = Some(op);
        vn.flags.remove(VarFlags::INPUT);
        vn.flags.insert(VarFlags::WRITTEN);
        vn.defkey = op_uniq;
        self.index_insert(id);
    }

    /// Detach the defining op, returning the cell to the free state.
    pub(crate) fn clear_def(&mut self, id: VarnodeId) {
        self.index_remove(id);
        let vn = self.get_mut(id);
        vn.def = None;
        vn.flags.remove(VarFlags::WRITTEN);
        vn.defkey = 0;
        self.index_insert(id);
    }

    /// Mark a free cell as an SSA input.
    ///
    /// The cell is preserved as-is only when no existing input overlaps it, or an existing input
    /// coincides with it exactly (in which case the existing input is returned). Overlap with an
    /// input of different geometry is an error; the caller must split via SUBPIECE first.
    pub fn set_input(&mut self, id: VarnodeId) -> Result<VarnodeId, LowLevelError> {
        let (addr, size) = {
            let vn = self.get(id);
            (vn.addr, vn.size)
        };
        if let Some(existing) = self.find_input_overlap(addr, size) {
            let e = self.get(existing);
            if e.addr == addr && e.size == size {
                return Ok(existing);
            }
            return Err(LowLevelError::OverlappingInputs {
                addr,
                a: e.size,
                b: size,
            });
        }
        self.index_remove(id);
        self.get_mut(id).flags.insert(VarFlags::INPUT);
        self.index_insert(id);
        Ok(id)
    }

    /// An existing input cell whose storage overlaps `[addr, addr+size)`, if any.
    pub fn find_input_overlap(&self, addr: Address, size: u32) -> Option<VarnodeId> {
        self.overlapping(addr, size)
            .find(|&id| self.get(id).is_input())
    }

    pub(crate) fn add_use(&mut self, id: VarnodeId, op: OpId) {
        self.get_mut(id).uses.push(op);
    }

    pub(crate) fn remove_use(&mut self, id: VarnodeId, op: OpId) {
        let uses = &mut self.get_mut(id).uses;
        let pos = uses
            .iter()
            .position(|&u| u == op)
            .expect("use back-reference missing");
        uses.swap_remove(pos);
    }

    fn loc_bounds(lo: Address, hi: Address) -> (LocKey, LocKey) {
        (
            (lo, 0, 0, 0, VarnodeId(0)),
            (hi, u32::MAX, u8::MAX, u64::MAX, VarnodeId(usize::MAX)),
        )
    }

    /// All cells whose storage begins within `[lo, hi]` (inclusive), in loc order.
    pub fn loc_range(&self, lo: Address, hi: Address) -> impl Iterator<Item = VarnodeId> + '_ {
        let (a, b) = Self::loc_bounds(lo, hi);
        self.loc_index.range(a..=b).map(|k| k.4)
    }

    /// All cells in a space, in loc order.
    pub fn space_range(&self, space: SpaceId) -> impl Iterator<Item = VarnodeId> + '_ {
        self.loc_range(
            Address::new(space, 0),
            Address::new(space, u64::MAX),
        )
    }

    /// All cells starting exactly at `addr`, any size.
    pub fn addr_range(&self, addr: Address) -> impl Iterator<Item = VarnodeId> + '_ {
        self.loc_range(addr, addr)
    }

    /// All cells with exactly the given storage.
    pub fn exact_range(
        &self,
        addr: Address,
        size: u32,
    ) -> impl Iterator<Item = VarnodeId> + '_ {
        self.loc_index
            .range((addr, size, 0, 0, VarnodeId(0))..=(addr, size, u8::MAX, u64::MAX, VarnodeId(usize::MAX)))
            .map(|k| k.4)
    }

    /// All live cells, in loc order.
    pub fn all(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.loc_index.iter().map(|k| k.4)
    }

    /// Cells whose storage shares at least one byte with `[addr, addr+size)`. Scans backward by
    /// the largest cell size ever created, so cells beginning before `addr` are found too.
    pub fn overlapping(&self, addr: Address, size: u32) -> impl Iterator<Item = VarnodeId> + '_ {
        let back = (self.max_size as u64).saturating_sub(1);
        let lo = Address::new(addr.space, addr.offset.saturating_sub(back));
        let hi = Address::new(
            addr.space,
            addr.offset.saturating_add(size.saturating_sub(1) as u64),
        );
        let (a, b) = Self::loc_bounds(lo, hi);
        self.loc_index
            .range(a..=b)
            .map(|k| k.4)
            .filter(move |&id| {
                let vn = self.get(id);
                vn.addr.overlaps(vn.size, &addr, size)
            })
    }

    /// All input cells, in def order.
    pub fn inputs(&self) -> impl Iterator<Item = VarnodeId> + '_ {
        self.def_index
            .range(
                (0u8, Address::new(SpaceId(0), 0), 0, VarnodeId(0))
                    ..(1u8, Address::new(SpaceId(0), 0), 0, VarnodeId(0)),
            )
            .map(|k| k.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{SpaceKind, SpaceManager};

    fn ram() -> (SpaceManager, SpaceId) {
        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0);
        (mgr, ram)
    }

    #[test]
    fn exact_input_is_reused_mismatch_is_error() {
        let (_mgr, ram) = ram();
        let mut store = VarnodeStore::new();
        let a = store.create(Address::new(ram, 0x10), 4);
        let first = store.set_input(a).unwrap();
        assert_eq!(first, a);

        let same = store.create(Address::new(ram, 0x10), 4);
        assert_eq!(store.set_input(same).unwrap(), a);

        let bad = store.create(Address::new(ram, 0x12), 4);
        assert!(store.set_input(bad).is_err());
    }

    #[test]
    fn overlap_scan_sees_earlier_starts() {
        let (_mgr, ram) = ram();
        let mut store = VarnodeStore::new();
        let wide = store.create(Address::new(ram, 0x100), 8);
        let ids: Vec<_> = store.overlapping(Address::new(ram, 0x104), 2).collect();
        assert_eq!(ids, vec![wide]);
        assert_eq!(store.overlapping(Address::new(ram, 0x108), 2).count(), 0);
    }

    #[test]
    fn constants_carry_their_value() {
        let mut store = VarnodeStore::new();
        let c = store.create(Address::constant(0x2a), 4);
        assert!(store.get(c).is_constant());
        assert_eq!(store.get(c).constant_value(), Some(0x2a));
        assert_eq!(store.get(c).nzmask, 0x2a);
    }
}
