//! The function container: owner of all IR entities of one function, the canonical editing API,
//! and the driver for the analysis pipeline.
//!
//! Every mutation of cells, ops, and blocks goes through this API, which maintains the engine
//! invariants: unique definition, phi ops at block heads, branch ops at block tails,
//! indirect-effect ops immediately before the op they annotate, and constant cells cloned rather
//! than shared once they acquire a second reader.

use crate::address::{Address, Endian, SeqNum, SpaceKind, UNIQUE_SPACE};
use crate::blockgraph::{BlockFlags, BlockGraph, BlockId};
use crate::callspec::{FuncCallSpecs, Prototype};
use crate::config::CONFIG;
use crate::containers::unordered::UnorderedMap;
use crate::contracts::{Architecture, PcodeEmit, VarnodeData};
use crate::error::{LowLevelError, Warning};
use crate::heritage::Heritage;
use crate::highvar::HighStore;
use crate::jumptable::{JumpTable, JumpTableError};
use crate::log::*;
use crate::op::{OpFlags, OpId, OpStore};
use crate::opcode::OpCode;
use crate::rewrite::ActionDatabase;
use crate::symbols::SymbolTable;
use crate::typeprop::{ResolveEdge, ResolvedUnion};
use crate::varnode::{VarFlags, VarnodeId, VarnodeStore};
use std::rc::Rc;

/// The function-level IR container.
pub struct Funcdata {
    pub name: String,
    pub entry_addr: Address,
    /// The function's own signature as currently recovered (or user-supplied).
    pub prototype: Prototype,
    arch: Rc<Architecture>,
    vars: VarnodeStore,
    ops: OpStore,
    blocks: BlockGraph,
    heritage: Heritage,
    highs: HighStore,
    symtab: SymbolTable,
    jumptables: Vec<JumpTable>,
    callspecs: Vec<FuncCallSpecs>,
    resolved_unions: UnorderedMap<ResolveEdge, ResolvedUnion>,
    warnings: Vec<Warning>,
    /// Next free offset in the unique scratch space.
    uniq_base: u64,
    /// Address of the most recently ingested op; detects machine-instruction starts.
    last_ingest_addr: Option<Address>,
    /// Set on partial clones built for jump-table recovery.
    pub recovery_mode: bool,
    fatal: Option<LowLevelError>,
}

impl Funcdata {
    pub fn new(name: impl Into<String>, entry_addr: Address, arch: Rc<Architecture>) -> Self {
        Self {
            name: name.into(),
            entry_addr,
            prototype: Prototype::unknown(),
            arch,
            vars: VarnodeStore::new(),
            ops: OpStore::new(),
            blocks: BlockGraph::new(),
            heritage: Heritage::new(),
            highs: HighStore::new(),
            symtab: SymbolTable::new(),
            jumptables: Vec::new(),
            callspecs: Vec::new(),
            resolved_unions: Default::default(),
            warnings: Vec::new(),
            uniq_base: 0,
            last_ingest_addr: None,
            recovery_mode: false,
            fatal: None,
        }
    }

    // -- accessors ---------------------------------------------------------

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    pub fn arch_handle(&self) -> Rc<Architecture> {
        Rc::clone(&self.arch)
    }

    pub fn ops(&self) -> &OpStore {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut OpStore {
        &mut self.ops
    }

    pub fn vars(&self) -> &VarnodeStore {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VarnodeStore {
        &mut self.vars
    }

    pub fn blocks(&self) -> &BlockGraph {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockGraph {
        &mut self.blocks
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symtab
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symtab
    }

    pub fn jump_tables(&self) -> &[JumpTable] {
        &self.jumptables
    }

    pub fn add_jump_table(&mut self, table: JumpTable) {
        self.jumptables.push(table);
    }

    pub fn jump_table_for(&self, op: OpId) -> Option<&JumpTable> {
        self.jumptables.iter().find(|t| t.op == op)
    }

    pub fn call_specs(&self) -> &[FuncCallSpecs] {
        &self.callspecs
    }

    pub fn add_call_spec(&mut self, spec: FuncCallSpecs) {
        self.callspecs.push(spec);
    }

    pub fn resolved_union(&self, key: &ResolveEdge) -> Option<ResolvedUnion> {
        self.resolved_unions.get(key).copied()
    }

    pub fn set_resolved_union(&mut self, key: ResolveEdge, entry: ResolvedUnion) {
        if self.resolved_unions.get(&key).map_or(false, |e| e.lock) {
            return; // locked entries are never overwritten
        }
        self.resolved_unions.insert(key, entry);
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// Attach a warning near an address (or to the function header with `None`).
    pub fn warning(&mut self, text: String, addr: Option<Address>) {
        warn!("Function warning"; "func" => &self.name, "text" => &text, "addr" => ?addr);
        self.warnings.push(Warning { text, addr });
    }

    pub fn warning_header(&mut self, text: String) {
        self.warning(text, None);
    }

    pub fn set_fatal(&mut self, err: LowLevelError) {
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    /// Run a closure against the high-variable store with the container still editable.
    pub fn with_highs<R>(&mut self, f: impl FnOnce(&mut HighStore, &mut Funcdata) -> R) -> R {
        let mut highs = std::mem::take(&mut self.highs);
        let r = f(&mut highs, self);
        self.highs = highs;
        r
    }

    pub fn highs(&self) -> &HighStore {
        &self.highs
    }

    /// Whether the rewrite loop may replace reads of this storage with constants.
    pub fn heritage_allows_fold(&self, addr: Address, size: u32) -> bool {
        self.heritage.is_heritaged(addr, size)
    }

    pub fn heritage_state(&self) -> &Heritage {
        &self.heritage
    }

    // -- cell creation -----------------------------------------------------

    /// A free cell at explicit storage. Cells in RAM or stack space are address-tied: their
    /// storage is shared with everything that aliases it.
    pub fn new_varnode(&mut self, addr: Address, size: u32) -> VarnodeId {
        let vn = self.vars.create(addr, size);
        let kind = self.arch.spaces.get(addr.space).kind;
        if matches!(kind, SpaceKind::Ram | SpaceKind::Stack) {
            self.vars.get_mut(vn).flags |= VarFlags::ADDRTIED;
        }
        vn
    }

    /// A constant cell.
    pub fn new_constant(&mut self, value: u64, size: u32) -> VarnodeId {
        self.vars.create(Address::constant(value), size)
    }

    /// An annotation cell referencing a code address (branch and call targets).
    pub fn new_code_ref(&mut self, target: Address) -> VarnodeId {
        let vn = self.vars.create(target, 1);
        self.vars.get_mut(vn).flags |= VarFlags::ANNOTATION;
        vn
    }

    /// A fresh scratch cell in the unique space, attached as `op`'s output.
    pub fn new_unique_out(&mut self, op: OpId, size: u32) -> VarnodeId {
        let off = self.uniq_base;
        self.uniq_base += (size as u64).max(16);
        let vn = self.vars.create(Address::new(UNIQUE_SPACE, off), size);
        self.op_set_output(op, vn);
        vn
    }

    /// Turn a free cell into a function input, or hand back the exactly matching existing input.
    /// An overlap of different geometry is fatal to the function.
    pub fn make_input(&mut self, addr: Address, size: u32) -> VarnodeId {
        let vn = self.new_varnode(addr, size);
        match self.vars.set_input(vn) {
            Ok(existing) => {
                if existing != vn {
                    self.vars.destroy(vn);
                }
                existing
            }
            Err(e) => {
                self.warning(format!("{}", e), Some(addr));
                self.set_fatal(e);
                vn
            }
        }
    }

    // -- op creation and opcode edits --------------------------------------

    /// A dead op with empty input slots.
    pub fn new_op(&mut self, opcode: OpCode, addr: Address, nslots: usize) -> OpId {
        self.ops.create(opcode, addr, nslots)
    }

    /// A dead op with an explicit sequence number (stream decode and clone paths).
    pub fn new_op_with_seq(&mut self, opcode: OpCode, seq: SeqNum, nslots: usize) -> OpId {
        self.ops.create_with_seq(opcode, seq, nslots)
    }

    /// A phi op for `storage` with `nslots` pending inputs, inserted at the head of `block`.
    pub fn new_phi(&mut self, block: BlockId, addr: Address, size: u32, nslots: usize) -> OpId {
        let at = self
            .blocks
            .get(block)
            .first_op()
            .map(|op| self.ops.get(op).seq.addr)
            .unwrap_or(self.entry_addr);
        let op = self.ops.create(OpCode::Phi, at, nslots);
        let out = self.new_varnode(addr, size);
        self.op_set_output(op, out);
        self.op_insert_begin(op, block);
        op
    }

    /// Change an op's opcode. Making a block-tail op an unconditional BRANCH while its block has
    /// fan-out greater than one removes every non-primary out-edge (the two edits must land
    /// together or not at all).
    pub fn op_set_opcode(&mut self, op: OpId, opcode: OpCode) {
        if opcode == OpCode::Branch {
            if let Some(block) = self.ops.get(op).parent() {
                if self.blocks.get(block).last_op() == Some(op) {
                    while self.blocks.get(block).out_count() > 1 {
                        let extra = self.blocks.get(block).out_edges()[1].block;
                        let lost = self.blocks.remove_edge(block, extra);
                        self.patch_phi_slot_removal(extra, lost);
                    }
                }
            }
        }
        self.ops.set_opcode(op, opcode);
    }

    // -- input/output edits ------------------------------------------------

    /// Set (or clear, with `None`) the cell in an input slot, maintaining use back-references.
    /// A constant already read elsewhere is cloned instead of shared, unless it is a spacebase.
    pub fn op_set_input(&mut self, op: OpId, vn: Option<VarnodeId>, slot: usize) {
        if let Some(old) = self.ops.get(op).input(slot) {
            self.vars.remove_use(old, op);
            self.reclaim_if_orphaned(old);
        }
        let vn = vn.map(|vn| {
            let v = self.vars.get(vn);
            if v.is_constant()
                && !v.uses().is_empty()
                && !v.flags.contains(VarFlags::SPACEBASE)
            {
                let (value, size) = (v.addr.offset, v.size);
                self.new_constant(value, size)
            } else {
                vn
            }
        });
        if let Some(vn) = vn {
            self.vars.add_use(vn, op);
        }
        self.ops.get_mut(op).inputs[slot] = vn;
    }

    /// Clear an input slot, leaving it empty.
    pub fn op_unset_input(&mut self, op: OpId, slot: usize) {
        self.op_set_input(op, None, slot);
    }

    /// Remove an input slot entirely, shifting later slots down.
    pub fn op_remove_input(&mut self, op: OpId, slot: usize) {
        self.op_unset_input(op, slot);
        self.ops.get_mut(op).inputs.remove(slot);
    }

    /// Insert a fresh input slot holding `vn` at `slot`, shifting later slots up.
    pub fn op_insert_input(&mut self, op: OpId, vn: VarnodeId, slot: usize) {
        self.ops.get_mut(op).inputs.insert(slot, None);
        self.op_set_input(op, Some(vn), slot);
    }

    /// Swap two input slots.
    pub fn op_swap_input(&mut self, op: OpId, a: usize, b: usize) {
        self.ops.get_mut(op).inputs.swap(a, b);
    }

    /// Attach `vn` as the op's output. The cell must be free.
    pub fn op_set_output(&mut self, op: OpId, vn: VarnodeId) {
        assert!(
            self.ops.get(op).output().is_none(),
            "{:?} already has an output",
            op
        );
        let uniq = self.ops.uniq_of(op);
        self.vars.set_def(vn, op, uniq);
        self.ops.get_mut(op).output = Some(vn);
    }

    /// Detach the op's output, returning the now-free cell.
    pub fn op_unset_output(&mut self, op: OpId) -> Option<VarnodeId> {
        let out = self.ops.get(op).output()?;
        self.vars.clear_def(out);
        self.ops.get_mut(op).output = None;
        Some(out)
    }

    fn reclaim_if_orphaned(&mut self, vn: VarnodeId) {
        if !self.vars.is_live(vn) {
            return;
        }
        let v = self.vars.get(vn);
        if v.uses().is_empty()
            && v.def().is_none()
            && v.flags
                .intersects(VarFlags::CONSTANT | VarFlags::ANNOTATION)
        {
            self.vars.destroy(vn);
        }
    }

    // -- op placement ------------------------------------------------------

    fn op_insert(&mut self, op: OpId, block: BlockId, pos: usize) {
        assert!(self.ops.get(op).is_dead(), "{:?} is already placed", op);
        self.ops.mark_alive(op);
        self.ops.get_mut(op).parent = Some(block);
        self.blocks.get_mut(block).ops.insert(pos, op);
        self.blocks.renumber_block(block, &mut self.ops);
    }

    /// Insert `op` immediately before `follow`, stepping over any indirect-effect ops pinned to
    /// `follow`'s address so they stay adjacent to the op they annotate.
    pub fn op_insert_before(&mut self, op: OpId, follow: OpId) {
        let block = self
            .ops
            .get(follow)
            .parent()
            .expect("follow is not in a block");
        let mut pos = self.ops.get(follow).order();
        let follow_addr = self.ops.get(follow).seq.addr;
        while pos > 0 {
            let prev = self.blocks.get(block).ops()[pos - 1];
            let p = self.ops.get(prev);
            if p.opcode == OpCode::Indirect && p.seq.addr == follow_addr {
                pos -= 1;
            } else {
                break;
            }
        }
        self.op_insert(op, block, pos);
    }

    /// Insert `op` immediately after `prev`.
    pub fn op_insert_after(&mut self, op: OpId, prev: OpId) {
        let block = self
            .ops
            .get(prev)
            .parent()
            .expect("prev is not in a block");
        let pos = self.ops.get(prev).order() + 1;
        self.op_insert(op, block, pos);
    }

    /// Insert at the start of a block, after any phi ops (unless `op` is itself a phi).
    pub fn op_insert_begin(&mut self, op: OpId, block: BlockId) {
        let mut pos = 0usize;
        if self.ops.get(op).opcode != OpCode::Phi {
            let list = self.blocks.get(block).ops().to_vec();
            while pos < list.len() && self.ops.get(list[pos]).opcode == OpCode::Phi {
                pos += 1;
            }
        }
        self.op_insert(op, block, pos);
    }

    /// Insert at the end of a block, in front of a trailing branch if one is already there.
    pub fn op_insert_end(&mut self, op: OpId, block: BlockId) {
        let mut pos = self.blocks.get(block).ops().len();
        if !self.ops.get(op).opcode.is_branch() {
            if let Some(last) = self.blocks.get(block).last_op() {
                if self.ops.get(last).opcode.is_branch() {
                    pos -= 1;
                }
            }
        }
        self.op_insert(op, block, pos);
    }

    /// Pull an op out of its block without touching its data links. The op goes back on the dead
    /// list.
    pub fn op_uninsert(&mut self, op: OpId) {
        let block = self.ops.get(op).parent().expect("op is not placed");
        let pos = self.ops.get(op).order();
        let removed = self.blocks.get_mut(block).ops.remove(pos);
        assert_eq!(removed, op, "block order desynchronized");
        self.ops.get_mut(op).parent = None;
        self.ops.mark_dead(op);
        self.blocks.renumber_block(block, &mut self.ops);
    }

    /// Uninsert and sever all data links (inputs and output), keeping the op allocated.
    pub fn op_unlink(&mut self, op: OpId) {
        if !self.ops.get(op).is_dead() {
            self.op_uninsert(op);
        }
        for slot in 0..self.ops.get(op).num_inputs() {
            self.op_unset_input(op, slot);
        }
        if let Some(out) = self.op_unset_output(op) {
            if self.vars.get(out).uses().is_empty() {
                self.vars.destroy(out);
            }
        }
    }

    /// Unlink and free an op. The output must have no remaining readers.
    pub fn op_destroy(&mut self, op: OpId) {
        if let Some(out) = self.ops.get(op).output() {
            let readers = self.vars.get(out).uses().len();
            assert!(
                readers == 0,
                "{}",
                LowLevelError::LiveDescendants {
                    addr: self.ops.get(op).seq.addr,
                    descendants: readers
                }
            );
        }
        self.op_unlink(op);
        self.ops.destroy(op);
    }

    /// Free a dead, already-unlinked op with no checks. Teardown path.
    pub fn op_destroy_raw(&mut self, op: OpId) {
        self.ops.destroy(op);
    }

    // -- whole-value replacement -------------------------------------------

    /// Redirect every reader of `old` to `new`.
    pub fn total_replace(&mut self, old: VarnodeId, new: VarnodeId) {
        let readers: Vec<OpId> = self.vars.get(old).uses().to_vec();
        for op in readers {
            while let Some(slot) = self.ops.get(op).slot_of(old) {
                self.op_set_input(op, Some(new), slot);
            }
        }
    }

    /// Collapse an op with an output down to `output = COPY constant`.
    pub fn total_replace_constant(&mut self, op: OpId, value: u64) {
        let out = self
            .ops
            .get(op)
            .output()
            .expect("constant replacement needs an output");
        let size = self.vars.get(out).size;
        while self.ops.get(op).num_inputs() > 1 {
            let last = self.ops.get(op).num_inputs() - 1;
            self.op_remove_input(op, last);
        }
        if self.ops.get(op).num_inputs() == 0 {
            self.ops.get_mut(op).inputs.push(None);
        }
        let c = self.new_constant(value & OpCode::calc_mask(size), size);
        self.op_set_input(op, Some(c), 0);
        self.op_set_opcode(op, OpCode::Copy);
    }

    // -- phi patching around control-flow edits -----------------------------

    /// Drop the phi input slot that corresponded to a removed in-edge.
    fn patch_phi_slot_removal(&mut self, block: BlockId, lost_slot: usize) {
        let phis: Vec<OpId> = self
            .blocks
            .get(block)
            .ops()
            .iter()
            .copied()
            .filter(|&op| self.ops.get(op).opcode == OpCode::Phi)
            .collect();
        for phi in phis {
            if self.ops.get(phi).num_inputs() > lost_slot {
                self.op_remove_input(phi, lost_slot);
            }
            if self.ops.get(phi).num_inputs() == 1 {
                self.op_set_opcode(phi, OpCode::Copy);
            }
        }
    }

    /// Remove a block from the control flow, rerouting its predecessors to its single successor
    /// and patching the successor's phi ops: the slot fed by the removed block disappears, and
    /// one slot per rerouted predecessor appears, fed by the removed block's own phi inputs when
    /// the dropped value was defined by a phi inside the removed block.
    pub fn remove_from_flow(&mut self, block: BlockId) -> Result<(), LowLevelError> {
        let out_edges: Vec<BlockId> = self
            .blocks
            .get(block)
            .out_edges()
            .iter()
            .map(|e| e.block)
            .collect();
        if out_edges.len() > 1 {
            return Err(LowLevelError::Other(format!(
                "cannot remove {:?} from flow with fan-out {}",
                block,
                out_edges.len()
            )));
        }
        let preds: Vec<BlockId> = self
            .blocks
            .get(block)
            .in_edges()
            .iter()
            .map(|e| e.block)
            .collect();

        if let Some(&succ) = out_edges.first() {
            let dropped_slot = self
                .blocks
                .get(succ)
                .in_index_of(block)
                .expect("edge bookkeeping broken");
            let phis: Vec<OpId> = self
                .blocks
                .get(succ)
                .ops()
                .iter()
                .copied()
                .filter(|&op| self.ops.get(op).opcode == OpCode::Phi)
                .collect();
            // Capture what each phi received through the removed block before editing
            let dropped: Vec<Option<VarnodeId>> = phis
                .iter()
                .map(|&phi| self.ops.get(phi).input(dropped_slot))
                .collect();
            self.blocks.remove_edge(block, succ);
            for &phi in &phis {
                self.op_remove_input(phi, dropped_slot);
            }
            // The removed block's in-edge order fixes which phi slot each predecessor fed
            let pred_slots: Vec<(BlockId, usize)> =
                preds.iter().copied().enumerate().map(|(i, p)| (p, i)).collect();
            for (p, slot_in_removed) in pred_slots {
                self.blocks.switch_edge(p, block, succ);
                for (i, &phi) in phis.iter().enumerate() {
                    let v = dropped[i].expect("phi had an empty slot during flow removal");
                    let through_removed_phi = self.vars.get(v).def().and_then(|def| {
                        let d = self.ops.get(def);
                        (d.opcode == OpCode::Phi && d.parent() == Some(block))
                            .then(|| d.input(slot_in_removed))
                            .flatten()
                    });
                    let fill = through_removed_phi.unwrap_or(v);
                    let new_slot = self.ops.get(phi).num_inputs();
                    self.op_insert_input(phi, fill, new_slot);
                }
            }
            for &phi in &phis {
                if self.ops.get(phi).num_inputs() == 1 {
                    self.op_set_opcode(phi, OpCode::Copy);
                }
            }
        } else {
            for &p in &preds {
                self.blocks.remove_edge(p, block);
            }
        }

        // Tear the block's ops down
        let doomed: Vec<OpId> = self.blocks.get(block).ops().to_vec();
        for op in doomed.iter().rev() {
            self.op_unlink(*op);
        }
        for op in doomed {
            self.op_destroy_raw(op);
        }
        self.blocks.get_mut(block).ops.clear();
        self.blocks.remove_block(block);
        Ok(())
    }

    /// Duplicate `block` onto its `inedge`-th in-edge: the edge moves to a fresh clone carrying
    /// a copy of the full op sequence. Each phi in the original turns into a COPY inside the
    /// clone (of the input that arrived through the moved edge) and loses that input slot. A
    /// block with more than one out-edge cannot be split.
    pub fn node_split(&mut self, block: BlockId, inedge: usize) -> Result<BlockId, LowLevelError> {
        let fanout = self.blocks.get(block).out_count();
        if fanout > 1 {
            return Err(LowLevelError::BadNodeSplit {
                block_index: block.0,
                edge: inedge,
                fanout,
            });
        }
        let pred = self.blocks.get(block).in_edges()[inedge].block;
        let clone = self.blocks.new_block();
        self.blocks.get_mut(clone).flags |= BlockFlags::DUPLICATE;
        self.blocks.switch_edge(pred, block, clone);

        if fanout == 1 {
            let succ = self.blocks.get(block).out_edges()[0].block;
            let orig_slot = self
                .blocks
                .get(succ)
                .in_index_of(block)
                .expect("edge bookkeeping broken");
            self.blocks.add_edge(clone, succ);
            let new_slot = self.blocks.get(succ).in_count() - 1;
            let phis: Vec<OpId> = self
                .blocks
                .get(succ)
                .ops()
                .iter()
                .copied()
                .filter(|&op| self.ops.get(op).opcode == OpCode::Phi)
                .collect();
            for phi in phis {
                if let Some(v) = self.ops.get(phi).input(orig_slot) {
                    let at = self.ops.get(phi).num_inputs().min(new_slot);
                    self.op_insert_input(phi, v, at);
                }
            }
        }

        // Clone the op sequence, rewriting intra-block reads through the new outputs
        let originals: Vec<OpId> = self.blocks.get(block).ops().to_vec();
        let mut remap: UnorderedMap<VarnodeId, VarnodeId> = Default::default();
        for op in originals {
            let (opcode, seq_addr, nin, out) = {
                let o = self.ops.get(op);
                (o.opcode, o.seq.addr, o.num_inputs(), o.output())
            };
            if opcode == OpCode::Phi {
                let incoming = self
                    .ops
                    .get(op)
                    .input(inedge)
                    .expect("phi slot empty during node split");
                let copy = self.new_op(OpCode::Copy, seq_addr, 1);
                let (addr, size) = {
                    let out = out.expect("phi without output");
                    let v = self.vars.get(out);
                    (v.addr, v.size)
                };
                let new_out = self.new_varnode(addr, size);
                self.op_set_output(copy, new_out);
                let src = remap.get(&incoming).copied().unwrap_or(incoming);
                self.op_set_input(copy, Some(src), 0);
                self.op_insert_end(copy, clone);
                remap.insert(out.unwrap(), new_out);
                self.op_remove_input(op, inedge);
                if self.ops.get(op).num_inputs() == 1 {
                    self.op_set_opcode(op, OpCode::Copy);
                }
            } else {
                let copy = self.new_op(opcode, seq_addr, nin);
                let inherited = self.ops.get(op).flags;
                self.ops.get_mut(copy).flags = inherited | OpFlags::DEAD;
                for slot in 0..nin {
                    if let Some(vn) = self.ops.get(op).input(slot) {
                        let src = remap.get(&vn).copied().unwrap_or(vn);
                        self.op_set_input(copy, Some(src), slot);
                    }
                }
                if let Some(out) = out {
                    let (addr, size) = {
                        let v = self.vars.get(out);
                        (v.addr, v.size)
                    };
                    let new_out = self.new_varnode(addr, size);
                    self.op_set_output(copy, new_out);
                    remap.insert(out, new_out);
                }
                self.op_insert_end(copy, clone);
            }
        }
        Ok(clone)
    }

    /// Replace all reads of the exactly-`read` storage with SUBPIECE extractions from the
    /// covering storage, so heritage sees a single granularity.
    pub fn split_read_from(&mut self, read: (Address, u32), covering: (Address, u32)) {
        let delta = covering
            .0
            .contains(covering.1, &read.0, read.1)
            .expect("read storage not contained in covering storage");
        let truncate = match self.arch.endian {
            Endian::Little => delta,
            Endian::Big => (covering.1 as u64) - delta - (read.1 as u64),
        };
        let readers: Vec<(VarnodeId, OpId)> = self
            .vars
            .exact_range(read.0, read.1)
            .filter(|&vn| self.vars.get(vn).is_free())
            .flat_map(|vn| {
                self.vars
                    .get(vn)
                    .uses()
                    .iter()
                    .map(move |&op| (vn, op))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (vn, op) in readers {
            if self.ops.get(op).opcode.is_marker() || self.ops.get(op).is_dead() {
                continue;
            }
            let addr = self.ops.get(op).seq.addr;
            let sub = self.new_op(OpCode::SubPiece, addr, 2);
            let whole = self.new_varnode(covering.0, covering.1);
            self.op_set_input(sub, Some(whole), 0);
            let k = self.new_constant(truncate, 4);
            self.op_set_input(sub, Some(k), 1);
            let out = self.new_unique_out(sub, read.1);
            self.op_insert_before(sub, op);
            while let Some(slot) = self.ops.get(op).slot_of(vn) {
                self.op_set_input(op, Some(out), slot);
            }
        }
    }

    // -- raw op ingestion and block generation ------------------------------

    /// Allocate the cell for an emitted operand. Branch-target operands become annotations.
    fn ingest_cell(&mut self, data: VarnodeData, annotation: bool) -> VarnodeId {
        if annotation {
            self.new_code_ref(data.addr)
        } else {
            self.new_varnode(data.addr, data.size)
        }
    }

    /// Build the CFG from the raw (dead) op list: blocks start at block-start markers and branch
    /// targets, and end after every flow-altering op.
    pub fn generate_blocks(&mut self) {
        assert!(self.blocks.entry.is_none(), "blocks already generated");
        let raw: Vec<OpId> = self.ops.dead_iter().collect();
        if raw.is_empty() {
            return;
        }

        // Addresses that must start a block: explicit markers plus branch targets
        let mut starts: std::collections::BTreeSet<Address> = Default::default();
        starts.insert(self.ops.get(raw[0]).seq.addr);
        for &op in &raw {
            let o = self.ops.get(op);
            if o.flags.contains(OpFlags::STARTBASIC) {
                starts.insert(o.seq.addr);
            }
            if matches!(o.opcode, OpCode::Branch | OpCode::CBranch) {
                if let Some(t) = o.input(0) {
                    starts.insert(self.vars.get(t).addr);
                }
            }
        }

        // Partition the op sequence into blocks
        let mut block_of_addr: UnorderedMap<Address, BlockId> = Default::default();
        let mut order: Vec<(BlockId, Vec<OpId>)> = Vec::new();
        let mut current: Option<(BlockId, Vec<OpId>)> = None;
        let mut prev_flow_break = false;
        for &op in &raw {
            let (addr, opcode, startmark) = {
                let o = self.ops.get(op);
                (o.seq.addr, o.opcode, o.flags.contains(OpFlags::STARTMARK))
            };
            let boundary = current.is_none()
                || prev_flow_break
                || (startmark && starts.contains(&addr) && {
                    // Only the first op at the address opens the block
                    !block_of_addr.contains_key(&addr)
                });
            if boundary {
                if let Some(done) = current.take() {
                    order.push(done);
                }
                let b = self.blocks.new_block();
                block_of_addr.entry(addr).or_insert(b);
                current = Some((b, Vec::new()));
            }
            let cur = current.as_mut().unwrap();
            cur.1.push(op);
            prev_flow_break = opcode.is_flow_break() || opcode == OpCode::CBranch;
        }
        if let Some(done) = current.take() {
            order.push(done);
        }

        // Wire ops into blocks
        for (block, ops) in &order {
            for &op in ops {
                self.ops.mark_alive(op);
                self.ops.get_mut(op).parent = Some(*block);
                self.blocks.get_mut(*block).ops.push(op);
            }
            self.blocks.renumber_block(*block, &mut self.ops);
            let cover = {
                let list = self.blocks.get(*block).ops();
                match (list.first(), list.last()) {
                    (Some(&f), Some(&l)) => {
                        let fa = self.ops.get(f).seq.addr;
                        let la = self.ops.get(l).seq.addr;
                        (fa.space == la.space && fa <= la)
                            .then(|| crate::address::AddrRange::new(fa, la))
                    }
                    _ => None,
                }
            };
            self.blocks.get_mut(*block).cover = cover;
        }

        // Edges
        for i in 0..order.len() {
            let (block, ref ops) = order[i];
            let Some(&last) = ops.last() else { continue };
            let (opcode, target) = {
                let o = self.ops.get(last);
                let t = o.input(0).map(|t| self.vars.get(t).addr);
                (o.opcode, t)
            };
            let fallthrough = order.get(i + 1).map(|&(b, _)| b);
            match opcode {
                OpCode::Branch => {
                    if let Some(t) = target.and_then(|t| block_of_addr.get(&t).copied()) {
                        self.blocks.add_edge(block, t);
                    } else {
                        self.warning(
                            "branch to an address outside the function".to_string(),
                            target,
                        );
                    }
                }
                OpCode::CBranch => {
                    if let Some(ft) = fallthrough {
                        self.blocks.add_edge(block, ft);
                    }
                    if let Some(t) = target.and_then(|t| block_of_addr.get(&t).copied()) {
                        self.blocks.add_edge(block, t);
                    }
                }
                OpCode::BranchInd | OpCode::Return => {}
                _ => {
                    if let Some(ft) = fallthrough {
                        self.blocks.add_edge(block, ft);
                    }
                }
            }
        }

        let entry = order[0].0;
        self.blocks.entry = Some(entry);
        self.blocks.get_mut(entry).flags |= BlockFlags::ENTRY;

        // Register call specs for every call site discovered during flow
        let calls: Vec<OpId> = self
            .ops
            .opcode_iter(OpCode::Call)
            .chain(self.ops.opcode_iter(OpCode::CallInd))
            .filter(|&op| !self.ops.get(op).is_dead())
            .collect();
        for op in calls {
            let entry_addr = self
                .ops
                .get(op)
                .input(0)
                .map(|t| self.vars.get(t).addr)
                .filter(|a| !a.is_constant());
            let mut spec = FuncCallSpecs::new(op);
            spec.entry = entry_addr;
            self.callspecs.push(spec);
        }

        debug!("Generated blocks"; "func" => &self.name, "blocks" => order.len());
    }

    // -- analysis driver ---------------------------------------------------

    /// One heritage pass (SSA placement + renaming) over all heritable spaces.
    pub fn heritage_pass(&mut self) {
        let mut h = std::mem::take(&mut self.heritage);
        h.heritage(self);
        self.heritage = h;
    }

    /// Dead-code sweep honoring per-space delays.
    pub fn dead_code_pass(&mut self) -> usize {
        let mut h = std::mem::take(&mut self.heritage);
        let n = h.dead_code_elimination(self);
        self.heritage = h;
        n
    }

    /// Drive the full pipeline: heritage, the default action group, dead-code removal, and the
    /// jump-table recovery loop, then high-variable formation and type propagation.
    pub fn analyze(&mut self, actions: &mut ActionDatabase) -> Result<(), LowLevelError> {
        if self.blocks.entry.is_none() {
            self.generate_blocks();
        }
        self.blocks.calc_dominators();

        let mut rounds = 0usize;
        loop {
            rounds += 1;
            if rounds > CONFIG.max_action_passes {
                return Err(LowLevelError::ActionCapExceeded {
                    group: "driver".to_string(),
                    passes: rounds,
                });
            }
            self.heritage_pass();
            actions.apply_group(self, "default")?;
            self.dead_code_pass();
            let newly = self.recover_jump_tables(actions);
            if newly == 0 {
                break;
            }
        }

        self.with_highs(|highs, fd| highs.set_high_level(fd));
        self.merge_address_tied();
        crate::typeprop::propagate_types(self);

        if let Some(err) = self.fatal.take() {
            return Err(err);
        }
        Ok(())
    }

    /// Attempt recovery on every indirect branch that has no complete table yet. Returns how
    /// many tables progressed this round.
    fn recover_jump_tables(&mut self, actions: &mut ActionDatabase) -> usize {
        let pending: Vec<OpId> = self
            .ops
            .opcode_iter(OpCode::BranchInd)
            .filter(|&op| !self.ops.get(op).is_dead())
            .filter(|&op| {
                self.jump_table_for(op)
                    .map_or(true, |t| t.stage < 2)
            })
            .collect();
        let mut progressed = 0usize;
        for op in pending {
            if self.recovery_mode {
                break; // partial clones never recurse into recovery
            }
            match crate::jumptable::recover_jump_table(self, actions, op) {
                Ok(table) => {
                    let stage = table.stage;
                    let existed = self
                        .jumptables
                        .iter()
                        .position(|t| t.op == op);
                    let advanced = match existed {
                        Some(i) => {
                            let prev = self.jumptables[i].stage;
                            self.jumptables[i] = table;
                            stage > prev
                        }
                        None => {
                            self.jumptables.push(table);
                            true
                        }
                    };
                    if stage == 2 {
                        self.apply_jump_table(op);
                    }
                    if advanced {
                        progressed += 1;
                    }
                }
                Err(JumpTableError::Unreachable) => {
                    let addr = self.ops.get(op).seq.addr;
                    self.warning("unreachable indirect branch removed".to_string(), Some(addr));
                    if let Some(block) = self.ops.get(op).parent() {
                        let _ = self.remove_from_flow(block);
                    }
                }
                Err(e) => {
                    let addr = self.ops.get(op).seq.addr;
                    self.warning(format!("jump table not recovered: {}", e), Some(addr));
                }
            }
        }
        progressed
    }

    /// Wire a completed table into the CFG: one switch out-edge per target, goto-flagged edges
    /// for successors an override did not map, and the default-target flag when resolved.
    fn apply_jump_table(&mut self, op: OpId) {
        let Some(block) = self.ops.get(op).parent() else {
            return;
        };
        let (targets, default_index) = {
            let t = self.jump_table_for(op).expect("table disappeared");
            (t.targets.clone(), t.default_index)
        };
        let existing: Vec<BlockId> = self
            .blocks
            .get(block)
            .out_edges()
            .iter()
            .map(|e| e.block)
            .collect();
        let mut mapped = 0usize;
        for (i, &target) in targets.iter().enumerate() {
            let dest = self.blocks.iter().find(|&b| {
                self.blocks
                    .get(b)
                    .cover
                    .map_or(false, |c| c.first == target)
            });
            let Some(dest) = dest else {
                self.warning(
                    "jump table target outside the function".to_string(),
                    Some(target),
                );
                continue;
            };
            if !existing.contains(&dest) && self.blocks.get(block).out_index_of(dest).is_none() {
                self.blocks.add_edge(block, dest);
            }
            mapped += 1;
            if Some(i) == default_index {
                self.blocks.get_mut(dest).flags |= BlockFlags::DEFAULT_SWITCH_TARGET;
            }
        }
        // Successors the table did not account for stay reachable as explicit gotos
        let unmapped: Vec<BlockId> = self
            .blocks
            .get(block)
            .out_edges()
            .iter()
            .map(|e| e.block)
            .filter(|b| {
                !targets.iter().any(|t| {
                    self.blocks.get(*b).cover.map_or(false, |c| c.first == *t)
                })
            })
            .collect();
        for b in unmapped {
            self.blocks.label_goto_edge(block, b);
        }
        self.blocks.get_mut(block).flags |= BlockFlags::SWITCH_OUT;
        debug!("Applied jump table"; "func" => &self.name, "targets" => mapped);
    }

    /// Merge the high-variables of cells pinned to identical storage, wherever their covers do
    /// not intersect. Connectedness is tracked with a union-find over the cells, keyed by their
    /// exact storage.
    fn merge_address_tied(&mut self) {
        let mut connected = crate::containers::UnionFind::<VarnodeId>::new();
        let mut rep_of_storage: UnorderedMap<(Address, u32), VarnodeId> = Default::default();
        for vn in self.vars.all() {
            let v = self.vars.get(vn);
            if !v.flags.contains(VarFlags::ADDRTIED) || v.high.is_none() {
                continue;
            }
            match rep_of_storage.entry((v.addr, v.size)) {
                crate::containers::unordered::UnorderedMapEntry::Occupied(rep) => {
                    connected.union(*rep.get(), vn);
                }
                crate::containers::unordered::UnorderedMapEntry::Vacant(slot) => {
                    slot.insert(vn);
                    connected.union(vn, vn);
                }
            }
        }
        let groups: Vec<Vec<VarnodeId>> = connected
            .sets()
            .into_iter()
            .filter(|g| g.len() > 1)
            .map(|g| g.into_iter().copied().collect())
            .collect();
        self.with_highs(|highs, fd| {
            for group in groups {
                let mut base = fd.vars().get(group[0]).high.unwrap();
                for &vn in &group[1..] {
                    let other = fd.vars().get(vn).high.unwrap();
                    if !highs.is_live(other) || !highs.is_live(base) || other == base {
                        continue;
                    }
                    if !highs.intersection(fd, base, other) {
                        let (into, from) = if base < other {
                            (base, other)
                        } else {
                            (other, base)
                        };
                        highs.merge(fd, into, from);
                        base = into;
                    }
                }
            }
        });
    }

    /// Snapshot copy for jump-table recovery: arenas are copied by value, which keeps every
    /// cross-reference valid because ids are arena indices (the id-remapping table is the
    /// identity). The clone is flagged so nested recovery never starts.
    pub fn clone_partial(&self) -> Funcdata {
        Funcdata {
            name: format!("{}$jumptable", self.name),
            entry_addr: self.entry_addr,
            prototype: self.prototype.clone(),
            arch: Rc::clone(&self.arch),
            vars: self.vars.clone(),
            ops: self.ops.clone(),
            blocks: self.blocks.clone(),
            heritage: self.heritage.clone(),
            highs: HighStore::new(),
            symtab: SymbolTable::new(),
            jumptables: self.jumptables.clone(),
            callspecs: self.callspecs.clone(),
            resolved_unions: self.resolved_unions.clone(),
            warnings: Vec::new(),
            uniq_base: self.uniq_base,
            last_ingest_addr: self.last_ingest_addr,
            recovery_mode: true,
            fatal: None,
        }
    }
}

impl PcodeEmit for Funcdata {
    fn dump(
        &mut self,
        seq: SeqNum,
        opcode: OpCode,
        output: Option<VarnodeData>,
        inputs: &[VarnodeData],
        start_of_block: bool,
    ) {
        let op = self.new_op_with_seq(opcode, seq, inputs.len());
        let instruction_start = self.last_ingest_addr != Some(seq.addr);
        self.last_ingest_addr = Some(seq.addr);
        {
            let flags = &mut self.ops.get_mut(op).flags;
            if instruction_start {
                flags.insert(OpFlags::STARTMARK);
            }
            if start_of_block {
                flags.insert(OpFlags::STARTBASIC);
            }
        }
        for (slot, &data) in inputs.iter().enumerate() {
            let annotation = slot == 0
                && matches!(
                    opcode,
                    OpCode::Branch | OpCode::CBranch | OpCode::Call
                );
            let vn = self.ingest_cell(data, annotation);
            self.op_set_input(op, Some(vn), slot);
        }
        if let Some(out) = output {
            let vn = self.new_varnode(out.addr, out.size);
            self.op_set_output(op, vn);
        }
    }
}
