//! The operation store: owns every p-code operation of a function.
//!
//! An op is identified by an [`OpId`] into the arena and lives on exactly one of two lists:
//! *alive* (linked into a basic block) or *dead* (exists but is disconnected from control flow).
//! Creation always yields a dead op; the editing API moves ops between the lists without freeing
//! them, so entities survive long enough to be relinked. Destruction of an alive op is a broken
//! invariant and panics.

use crate::address::{Address, SeqNum};
use crate::blockgraph::BlockId;
use crate::containers::unordered::UnorderedMap;
use crate::opcode::OpCode;
use crate::varnode::VarnodeId;
use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    /// Properties of an operation.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct OpFlags: u32 {
        /// First op of a basic block (as emitted by the disassembler)
        const STARTBASIC = 1 << 0;
        /// First op of the whole instruction at its address
        const STARTMARK = 1 << 1;
        /// Must not be collapsed away even if its output looks dead
        const NOCOLLAPSE = 1 << 2;
        /// Not rendered by the pretty-printer
        const NONPRINTING = 1 << 3;
        /// This indirect-effect op creates its output out of nothing visible
        const INDIRECT_CREATION = 1 << 4;
        /// The output carries a call's return value
        const CALL_OUTPUT = 1 << 5;
        /// A warning is attached at this op's address
        const WARNING = 1 << 6;
        /// The printed boolean sense of this op is flipped
        const BOOLEAN_FLIP = 1 << 7;
        /// Input 0 is a spacebase pointer
        const SPACEBASE_PTR = 1 << 8;
        /// Requires special-case printing
        const SPECIAL_PRINT = 1 << 9;
        /// Requires special-case type propagation
        const SPECIAL_PROP = 1 << 10;
        /// On the dead list
        const DEAD = 1 << 11;
        /// Scratch traversal mark; only set inside a scoped mark guard
        const MARK = 1 << 12;
    }
}

/// Handle to an op in the [`OpStore`] arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub(crate) usize);

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// A single p-code operation.
#[derive(Clone, Debug)]
pub struct PcodeOp {
    pub opcode: OpCode,
    /// Input slots. `None` marks a slot that has been unset and not yet refilled; analysis
    /// requires all slots filled.
    pub(crate) inputs: Vec<Option<VarnodeId>>,
    pub(crate) output: Option<VarnodeId>,
    pub seq: SeqNum,
    pub(crate) parent: Option<BlockId>,
    pub flags: OpFlags,
    /// Position within the parent block's op list; refreshed by the block graph on every edit.
    pub(crate) order: usize,
}

impl PcodeOp {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// The cell in input slot `slot`, if set.
    pub fn input(&self, slot: usize) -> Option<VarnodeId> {
        self.inputs.get(slot).copied().flatten()
    }

    pub fn output(&self) -> Option<VarnodeId> {
        self.output
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    /// Position of this op within its block.
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn is_dead(&self) -> bool {
        self.flags.contains(OpFlags::DEAD)
    }

    /// The slot a given cell occupies, if any.
    pub fn slot_of(&self, vn: VarnodeId) -> Option<usize> {
        self.inputs.iter().position(|&i| i == Some(vn))
    }
}

/// Arena plus alive/dead/opcode indexes over all ops of one function.
#[derive(Clone)]
pub struct OpStore {
    arena: Vec<Option<PcodeOp>>,
    alive: BTreeMap<SeqNum, OpId>,
    dead: BTreeMap<SeqNum, OpId>,
    buckets: UnorderedMap<OpCode, std::collections::BTreeSet<OpId>>,
    uniq_counter: u32,
}

impl Default for OpStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OpStore {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            alive: BTreeMap::new(),
            dead: BTreeMap::new(),
            buckets: Default::default(),
            uniq_counter: 0,
        }
    }

    /// Create a dead op with `nslots` empty input slots at the given address. The sequence number
    /// is made unique by a monotone counter.
    pub fn create(&mut self, opcode: OpCode, addr: Address, nslots: usize) -> OpId {
        let seq = SeqNum::new(addr, self.uniq_counter);
        self.uniq_counter += 1;
        self.create_with_seq(opcode, seq, nslots)
    }

    /// Create a dead op with an explicit sequence number (used by the partial-clone machinery,
    /// which preserves the parent function's numbering).
    pub fn create_with_seq(&mut self, opcode: OpCode, seq: SeqNum, nslots: usize) -> OpId {
        self.uniq_counter = self.uniq_counter.max(seq.uniq.saturating_add(1));
        let id = OpId(self.arena.len());
        self.arena.push(Some(PcodeOp {
            opcode,
            inputs: vec![None; nslots],
            output: None,
            seq,
            parent: None,
            flags: OpFlags::DEAD,
            order: 0,
        }));
        let prev = self.dead.insert(seq, id);
        assert!(prev.is_none(), "duplicate sequence number {:?}", seq);
        self.buckets.entry(opcode).or_default().insert(id);
        id
    }

    pub fn get(&self, id: OpId) -> &PcodeOp {
        self.arena[id.0].as_ref().expect("stale OpId")
    }

    pub fn get_mut(&mut self, id: OpId) -> &mut PcodeOp {
        self.arena[id.0].as_mut().expect("stale OpId")
    }

    pub fn is_live(&self, id: OpId) -> bool {
        self.arena.get(id.0).map_or(false, |v| v.is_some())
    }

    /// Move an op from the dead list to the alive list.
    pub fn mark_alive(&mut self, id: OpId) {
        let seq = self.get(id).seq;
        assert!(self.dead.remove(&seq).is_some(), "{:?} was not dead", id);
        self.get_mut(id).flags.remove(OpFlags::DEAD);
        self.alive.insert(seq, id);
    }

    /// Move an op from the alive list to the dead list.
    pub fn mark_dead(&mut self, id: OpId) {
        let seq = self.get(id).seq;
        assert!(self.alive.remove(&seq).is_some(), "{:?} was not alive", id);
        self.get_mut(id).flags.insert(OpFlags::DEAD);
        self.dead.insert(seq, id);
    }

    /// Free a dead op. Freeing an alive op is forbidden; callers must unlink first.
    pub fn destroy(&mut self, id: OpId) {
        let op = self.get(id);
        assert!(
            op.is_dead(),
            "destroying alive op {:?} at {:?}",
            id,
            op.seq
        );
        let (seq, opcode) = (op.seq, op.opcode);
        self.dead.remove(&seq);
        self.buckets.get_mut(&opcode).unwrap().remove(&id);
        self.arena[id.0] = None;
    }

    /// Swap an op's opcode, keeping the bucket index coherent.
    pub(crate) fn set_opcode(&mut self, id: OpId, opcode: OpCode) {
        let old = self.get(id).opcode;
        if old == opcode {
            return;
        }
        self.buckets.get_mut(&old).unwrap().remove(&id);
        self.buckets.entry(opcode).or_default().insert(id);
        self.get_mut(id).opcode = opcode;
    }

    /// Alive ops in sequence order.
    pub fn alive_iter(&self) -> impl Iterator<Item = OpId> + '_ {
        self.alive.values().copied()
    }

    /// Dead ops in sequence order.
    pub fn dead_iter(&self) -> impl Iterator<Item = OpId> + '_ {
        self.dead.values().copied()
    }

    pub fn num_alive(&self) -> usize {
        self.alive.len()
    }

    /// Total arena slots, counting holes left by destroyed ops. The stream codec aligns ids
    /// against this.
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    /// Alive ops whose address lies in `[lo, hi]`, in sequence order.
    pub fn addr_range_iter(&self, lo: Address, hi: Address) -> impl Iterator<Item = OpId> + '_ {
        self.alive
            .range(SeqNum::new(lo, 0)..=SeqNum::new(hi, u32::MAX))
            .map(|(_, &id)| id)
    }

    /// Every op (alive or dead) with the given opcode, in id order.
    pub fn opcode_iter(&self, opcode: OpCode) -> impl Iterator<Item = OpId> + '_ {
        self.buckets
            .get(&opcode)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// The next fresh uniq value; exposed so the varnode store can key written cells.
    pub fn uniq_of(&self, id: OpId) -> u64 {
        self.get(id).seq.uniq as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{SpaceKind, SpaceManager};

    #[test]
    fn creation_is_dead_and_lists_move() {
        let mut mgr = SpaceManager::new();
        let code = mgr.add_space("code", SpaceKind::Code, 8, 0);
        let mut store = OpStore::new();
        let op = store.create(OpCode::IntAdd, Address::new(code, 0x1000), 2);
        assert!(store.get(op).is_dead());
        assert_eq!(store.alive_iter().count(), 0);
        store.mark_alive(op);
        assert_eq!(store.alive_iter().count(), 1);
        store.mark_dead(op);
        store.destroy(op);
        assert!(!store.is_live(op));
    }

    #[test]
    #[should_panic(expected = "destroying alive op")]
    fn destroying_alive_op_panics() {
        let mut mgr = SpaceManager::new();
        let code = mgr.add_space("code", SpaceKind::Code, 8, 0);
        let mut store = OpStore::new();
        let op = store.create(OpCode::Copy, Address::new(code, 0), 1);
        store.mark_alive(op);
        store.destroy(op);
    }

    #[test]
    fn opcode_buckets_track_changes() {
        let mut mgr = SpaceManager::new();
        let code = mgr.add_space("code", SpaceKind::Code, 8, 0);
        let mut store = OpStore::new();
        let op = store.create(OpCode::IntAdd, Address::new(code, 0), 2);
        assert_eq!(store.opcode_iter(OpCode::IntAdd).count(), 1);
        store.set_opcode(op, OpCode::IntSub);
        assert_eq!(store.opcode_iter(OpCode::IntAdd).count(), 0);
        assert_eq!(store.opcode_iter(OpCode::IntSub).count(), 1);
    }
}
