//! The basic-block graph: raw control flow plus the structured tree derived from it.
//!
//! The graph owns the blocks and their edges. Ops are owned by the op store; a block holds an
//! ordered list of [`OpId`]s and keeps each op's `order` field in sync so that cover intervals can
//! index positions inside a block. Any control-flow edit invalidates the structured tree, which is
//! rebuilt lazily on the next query.
//!
//! Edits that must patch phi inputs (`remove_from_flow`, `node_split`) live on the function
//! container, which has the editing API required to build the replacement COPY ops; the raw graph
//! surgery they use is here.

use crate::address::AddrRange;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::log::*;
use crate::op::{OpId, OpStore};
use bitflags::bitflags;

bitflags! {
    /// Properties of a basic block.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct BlockFlags: u32 {
        /// The function entry block
        const ENTRY = 1 << 0;
        /// Unreachable; awaiting removal
        const DEAD = 1 << 1;
        /// Terminates in a switch (recovered jump table)
        const SWITCH_OUT = 1 << 2;
        /// A clone produced by node splitting
        const DUPLICATE = 1 << 3;
        /// Produced by splicing two blocks together
        const JOINED = 1 << 4;
        /// The default target of a switch
        const DEFAULT_SWITCH_TARGET = 1 << 5;
    }
}

bitflags! {
    /// Properties of a single edge.
    #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
    pub struct EdgeFlags: u32 {
        /// Rendered as an explicit goto rather than absorbed into structure
        const GOTO = 1 << 0;
    }
}

/// Handle to a block in the [`BlockGraph`] arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) usize);

impl std::fmt::Debug for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "blk{}", self.0)
    }
}

/// A directed edge endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockEdge {
    pub block: BlockId,
    pub flags: EdgeFlags,
}

/// A contiguous run of operations with one predecessor list and one successor list.
#[derive(Debug, Default, Clone)]
pub struct BasicBlock {
    pub(crate) ops: Vec<OpId>,
    pub(crate) in_edges: Vec<BlockEdge>,
    pub(crate) out_edges: Vec<BlockEdge>,
    pub flags: BlockFlags,
    /// Immediate dominator, valid after the last `calc_dominators`.
    pub immed_dom: Option<BlockId>,
    /// Range of code addresses this block was generated from.
    pub cover: Option<AddrRange>,
}

impl BasicBlock {
    pub fn ops(&self) -> &[OpId] {
        &self.ops
    }

    pub fn first_op(&self) -> Option<OpId> {
        self.ops.first().copied()
    }

    pub fn last_op(&self) -> Option<OpId> {
        self.ops.last().copied()
    }

    pub fn in_count(&self) -> usize {
        self.in_edges.len()
    }

    pub fn out_count(&self) -> usize {
        self.out_edges.len()
    }

    pub fn in_edges(&self) -> &[BlockEdge] {
        &self.in_edges
    }

    pub fn out_edges(&self) -> &[BlockEdge] {
        &self.out_edges
    }

    /// The in-edge slot fed by `pred`, if any.
    pub fn in_index_of(&self, pred: BlockId) -> Option<usize> {
        self.in_edges.iter().position(|e| e.block == pred)
    }

    /// The out-edge slot leading to `succ`, if any.
    pub fn out_index_of(&self, succ: BlockId) -> Option<usize> {
        self.out_edges.iter().position(|e| e.block == succ)
    }
}

/// One composite node of the structured tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructBlock {
    /// A leaf: one basic block
    Basic(BlockId),
    /// Blocks executed one after the other
    Sequence(Vec<StructBlock>),
    IfThen {
        cond: Box<StructBlock>,
        then_body: Box<StructBlock>,
    },
    IfElse {
        cond: Box<StructBlock>,
        then_body: Box<StructBlock>,
        else_body: Box<StructBlock>,
    },
    /// Condition evaluated before each iteration
    While {
        cond: Box<StructBlock>,
        body: Box<StructBlock>,
    },
    /// Condition evaluated after each iteration
    DoWhile { body: Box<StructBlock> },
    InfiniteLoop { body: Box<StructBlock> },
    Switch {
        cond: Box<StructBlock>,
        cases: Vec<StructBlock>,
    },
    /// A node one of whose out-edges could not be absorbed and is rendered as a goto
    Goto {
        body: Box<StructBlock>,
        target: BlockId,
    },
}

/// The raw CFG plus the lazily rebuilt structured tree.
#[derive(Clone)]
pub struct BlockGraph {
    arena: Vec<Option<BasicBlock>>,
    pub entry: Option<BlockId>,
    structured: Option<StructBlock>,
}

impl Default for BlockGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockGraph {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            entry: None,
            structured: None,
        }
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.arena.len());
        self.arena.push(Some(BasicBlock::default()));
        self.touch();
        id
    }

    pub fn get(&self, id: BlockId) -> &BasicBlock {
        self.arena[id.0].as_ref().expect("stale BlockId")
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        self.structured = None;
        self.arena[id.0].as_mut().expect("stale BlockId")
    }

    pub fn is_live(&self, id: BlockId) -> bool {
        self.arena.get(id.0).map_or(false, |b| b.is_some())
    }

    /// Iterate live blocks in id order.
    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.arena.len())
            .map(BlockId)
            .filter(move |&id| self.arena[id.0].is_some())
    }

    pub fn num_blocks(&self) -> usize {
        self.arena.iter().filter(|b| b.is_some()).count()
    }

    /// Total arena slots, counting holes left by removed blocks. The stream codec aligns ids
    /// against this.
    pub fn arena_len(&self) -> usize {
        self.arena.len()
    }

    fn touch(&mut self) {
        self.structured = None;
    }

    /// Remove a block. It must carry no edges and no ops.
    pub fn remove_block(&mut self, id: BlockId) {
        {
            let b = self.get(id);
            assert!(
                b.in_edges.is_empty() && b.out_edges.is_empty() && b.ops.is_empty(),
                "removing {:?} while still wired",
                id
            );
        }
        if self.entry == Some(id) {
            self.entry = None;
        }
        self.arena[id.0] = None;
        self.touch();
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.get_mut(from).out_edges.push(BlockEdge {
            block: to,
            flags: EdgeFlags::empty(),
        });
        self.get_mut(to).in_edges.push(BlockEdge {
            block: from,
            flags: EdgeFlags::empty(),
        });
    }

    /// Remove the first `from -> to` edge. Returns the in-edge slot that disappeared from `to`,
    /// so phi inputs can be patched by the caller.
    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) -> usize {
        let out_slot = self
            .get(from)
            .out_index_of(to)
            .expect("no such out edge");
        self.get_mut(from).out_edges.remove(out_slot);
        let in_slot = self.get(to).in_index_of(from).expect("no such in edge");
        self.get_mut(to).in_edges.remove(in_slot);
        in_slot
    }

    /// Redirect the `from -> old` edge to `new`. The edge keeps its out-slot in `from`; `new`
    /// gains an in-edge at the end of its list. Returns the in-slot lost from `old` and the
    /// in-slot gained in `new`.
    pub fn switch_edge(&mut self, from: BlockId, old: BlockId, new: BlockId) -> (usize, usize) {
        let out_slot = self.get(from).out_index_of(old).expect("no such out edge");
        let flags = self.get(from).out_edges[out_slot].flags;
        self.get_mut(from).out_edges[out_slot] = BlockEdge { block: new, flags };
        let lost = self.get(old).in_index_of(from).expect("no such in edge");
        self.get_mut(old).in_edges.remove(lost);
        self.get_mut(new).in_edges.push(BlockEdge { block: from, flags });
        let gained = self.get(new).in_edges.len() - 1;
        (lost, gained)
    }

    /// Move out-edge `slot` of `from` to point at `new` instead, preserving the slot.
    pub fn move_out_edge(&mut self, from: BlockId, slot: usize, new: BlockId) {
        let old = self.get(from).out_edges[slot].block;
        let flags = self.get(from).out_edges[slot].flags;
        self.get_mut(from).out_edges[slot] = BlockEdge { block: new, flags };
        let lost = self.get(old).in_index_of(from).expect("no such in edge");
        self.get_mut(old).in_edges.remove(lost);
        self.get_mut(new).in_edges.push(BlockEdge { block: from, flags });
    }

    /// Set the goto flag on the `from -> to` edge (both directions of the record).
    pub fn label_goto_edge(&mut self, from: BlockId, to: BlockId) {
        let os = self.get(from).out_index_of(to).expect("no such out edge");
        self.get_mut(from).out_edges[os].flags |= EdgeFlags::GOTO;
        let is = self.get(to).in_index_of(from).expect("no such in edge");
        self.get_mut(to).in_edges[is].flags |= EdgeFlags::GOTO;
    }

    /// Append `b`'s op list onto `a` and take over `b`'s out-edges, removing `b` from the graph.
    /// `a` must have `b` as its sole successor and `b` must have `a` as its sole predecessor.
    /// The caller re-parents the moved ops; they are returned.
    pub fn splice_block(&mut self, a: BlockId, b: BlockId, ops: &mut OpStore) -> Vec<OpId> {
        assert_eq!(self.get(a).out_count(), 1);
        assert_eq!(self.get(a).out_edges[0].block, b);
        assert_eq!(self.get(b).in_count(), 1);
        self.remove_edge(a, b);
        let succs: Vec<BlockId> = self.get(b).out_edges.iter().map(|e| e.block).collect();
        for s in succs {
            // Keep the in-slot order of each successor: rewrite b's slot in place.
            let os = self.get(b).out_index_of(s).unwrap();
            let flags = self.get(b).out_edges[os].flags;
            self.get_mut(b).out_edges.remove(os);
            let is = self.get(s).in_index_of(b).unwrap();
            self.get_mut(s).in_edges[is] = BlockEdge { block: a, flags };
            self.get_mut(a).out_edges.push(BlockEdge { block: s, flags });
        }
        let moved = std::mem::take(&mut self.get_mut(b).ops);
        self.get_mut(a).flags |= BlockFlags::JOINED;
        self.get_mut(a).ops.extend(moved.iter().copied());
        self.remove_block(b);
        self.renumber_block(a, ops);
        moved
    }

    /// Refresh the `order` field of each op in the block.
    pub fn renumber_block(&mut self, id: BlockId, ops: &mut OpStore) {
        let list = self.get(id).ops.clone();
        for (i, op) in list.into_iter().enumerate() {
            ops.get_mut(op).order = i;
        }
    }

    /// Blocks reachable from the entry. Everything else is flagged dead (and reported).
    pub fn collect_reachable(&mut self) -> Vec<BlockId> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let mut seen: UnorderedSet<BlockId> = Default::default();
        let mut stack = vec![entry];
        let mut order = Vec::new();
        while let Some(b) = stack.pop() {
            if !seen.insert(b) {
                continue;
            }
            order.push(b);
            for e in &self.get(b).out_edges {
                stack.push(e.block);
            }
        }
        for id in self.iter().collect::<Vec<_>>() {
            if !seen.contains(&id) {
                debug!("Unreachable block"; "block" => ?id);
                self.get_mut(id).flags |= BlockFlags::DEAD;
            }
        }
        order
    }

    /// Blocks in reverse postorder from the entry.
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let Some(entry) = self.entry else {
            return Vec::new();
        };
        let mut seen: UnorderedSet<BlockId> = Default::default();
        let mut post = Vec::new();
        // Iterative DFS with an explicit phase marker
        let mut stack = vec![(entry, false)];
        while let Some((b, expanded)) = stack.pop() {
            if expanded {
                post.push(b);
                continue;
            }
            if !seen.insert(b) {
                continue;
            }
            stack.push((b, true));
            for e in self.get(b).out_edges.iter().rev() {
                if !seen.contains(&e.block) {
                    stack.push((e.block, false));
                }
            }
        }
        post.reverse();
        post
    }

    /// Iterative dominator computation (Cooper/Harvey/Kennedy). Fills `immed_dom` on every
    /// reachable block; the entry dominates itself.
    pub fn calc_dominators(&mut self) {
        let rpo = self.reverse_postorder();
        if rpo.is_empty() {
            return;
        }
        let entry = rpo[0];
        let mut number: UnorderedMap<BlockId, usize> = Default::default();
        for (i, &b) in rpo.iter().enumerate() {
            number.insert(b, i);
        }
        for &b in &rpo {
            self.get_mut(b).immed_dom = None;
        }
        self.get_mut(entry).immed_dom = Some(entry);
        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let preds: Vec<BlockId> = self
                    .get(b)
                    .in_edges
                    .iter()
                    .map(|e| e.block)
                    .filter(|p| number.contains_key(p) && self.get(*p).immed_dom.is_some())
                    .collect();
                let Some(&first) = preds.first() else {
                    continue;
                };
                let mut idom = first;
                for &p in preds.iter().skip(1) {
                    idom = self.intersect(idom, p, &number);
                }
                if self.get(b).immed_dom != Some(idom) {
                    self.get_mut(b).immed_dom = Some(idom);
                    changed = true;
                }
            }
        }
        // Re-querying get_mut above dropped the cached structure; that is correct, dominators
        // change only when the graph changed.
    }

    fn intersect(
        &self,
        mut a: BlockId,
        mut b: BlockId,
        number: &UnorderedMap<BlockId, usize>,
    ) -> BlockId {
        let num = |x: &BlockId| *number.get(x).expect("block missing from rpo numbering");
        while a != b {
            while num(&a) > num(&b) {
                a = self.get(a).immed_dom.expect("dominator not yet set");
            }
            while num(&b) > num(&a) {
                b = self.get(b).immed_dom.expect("dominator not yet set");
            }
        }
        a
    }

    /// Dominance frontier of every reachable block.
    pub fn dominance_frontiers(&self) -> UnorderedMap<BlockId, UnorderedSet<BlockId>> {
        let mut df: UnorderedMap<BlockId, UnorderedSet<BlockId>> = Default::default();
        for b in self.iter() {
            if self.get(b).in_count() < 2 {
                continue;
            }
            let Some(idom) = self.get(b).immed_dom else {
                continue;
            };
            for e in &self.get(b).in_edges {
                let mut runner = e.block;
                while runner != idom {
                    df.entry(runner).or_default().insert(b);
                    match self.get(runner).immed_dom {
                        Some(d) if d != runner => runner = d,
                        _ => break,
                    }
                }
            }
        }
        df
    }

    /// Back edges (`tail -> head` where head dominates tail), identifying natural loops.
    pub fn loop_back_edges(&self) -> Vec<(BlockId, BlockId)> {
        let mut out = Vec::new();
        for b in self.iter() {
            for e in &self.get(b).out_edges {
                if self.dominates(e.block, b) {
                    out.push((b, e.block));
                }
            }
        }
        out.sort();
        out
    }

    /// Whether `a` dominates `b` (per the last `calc_dominators`).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.get(cur).immed_dom {
                Some(d) if d != cur => cur = d,
                _ => return false,
            }
        }
    }

    /// The structured tree, rebuilding it if any edit occurred since the last query.
    pub fn structure(&mut self) -> &StructBlock {
        if self.structured.is_none() {
            let tree = self.structure_loops();
            self.structured = Some(tree);
        }
        self.structured.as_ref().unwrap()
    }

    /// Rebuild the structured tree from the raw CFG by iterated reduction. Edges that resist
    /// every reduction are converted to goto edges.
    pub fn structure_loops(&mut self) -> StructBlock {
        #[derive(Debug)]
        struct Node {
            body: StructBlock,
            succs: Vec<usize>,
            preds: Vec<usize>,
        }

        let ids: Vec<BlockId> = self.reverse_postorder();
        if ids.is_empty() {
            return StructBlock::Sequence(Vec::new());
        }
        let mut index: UnorderedMap<BlockId, usize> = Default::default();
        for (i, &b) in ids.iter().enumerate() {
            index.insert(b, i);
        }
        let mut nodes: Vec<Option<Node>> = ids
            .iter()
            .map(|&b| {
                Some(Node {
                    body: StructBlock::Basic(b),
                    succs: Vec::new(),
                    preds: Vec::new(),
                })
            })
            .collect();
        for (i, &b) in ids.iter().enumerate() {
            for e in &self.get(b).out_edges {
                if let Some(&j) = index.get(&e.block) {
                    nodes[i].as_mut().unwrap().succs.push(j);
                    nodes[j].as_mut().unwrap().preds.push(i);
                }
            }
        }

        fn unlink(nodes: &mut [Option<Node>], from: usize, to: usize) {
            let n = nodes[from].as_mut().unwrap();
            let p = n.succs.iter().position(|&s| s == to).unwrap();
            n.succs.remove(p);
            let m = nodes[to].as_mut().unwrap();
            let p = m.preds.iter().position(|&s| s == from).unwrap();
            m.preds.remove(p);
        }

        let live = |nodes: &[Option<Node>]| -> Vec<usize> {
            (0..nodes.len()).filter(|&i| nodes[i].is_some()).collect()
        };

        fn first_block_of(s: &StructBlock) -> BlockId {
            match s {
                StructBlock::Basic(b) => *b,
                StructBlock::Sequence(v) => first_block_of(v.first().expect("empty sequence")),
                StructBlock::IfThen { cond, .. }
                | StructBlock::IfElse { cond, .. }
                | StructBlock::While { cond, .. }
                | StructBlock::Switch { cond, .. } => first_block_of(cond),
                StructBlock::DoWhile { body }
                | StructBlock::InfiniteLoop { body }
                | StructBlock::Goto { body, .. } => first_block_of(body),
            }
        }

        loop {
            let mut changed = false;

            for i in live(&nodes) {
                // Earlier reductions in this pass may have consumed the node
                if nodes[i].is_none() {
                    continue;
                }
                // Self-loop: do-while
                if nodes[i].as_ref().unwrap().succs.contains(&i) {
                    unlink(&mut nodes, i, i);
                    let body = nodes[i].as_mut().unwrap();
                    body.body = StructBlock::DoWhile {
                        body: Box::new(body.body.clone()),
                    };
                    changed = true;
                    continue;
                }

                let succs = nodes[i].as_ref().unwrap().succs.clone();

                // Sequence: sole successor with a sole predecessor
                if let [s] = succs.as_slice() {
                    let s = *s;
                    if s != i && nodes[s].as_ref().unwrap().preds.len() == 1 {
                        unlink(&mut nodes, i, s);
                        let tail = nodes[s].take().unwrap();
                        let n = nodes[i].as_mut().unwrap();
                        let mut parts = match std::mem::replace(
                            &mut n.body,
                            StructBlock::Sequence(Vec::new()),
                        ) {
                            StructBlock::Sequence(v) => v,
                            other => vec![other],
                        };
                        match tail.body {
                            StructBlock::Sequence(mut v) => parts.append(&mut v),
                            other => parts.push(other),
                        }
                        n.body = StructBlock::Sequence(parts);
                        n.succs = tail.succs.clone();
                        for &t in &tail.succs {
                            for p in nodes[t].as_mut().unwrap().preds.iter_mut() {
                                if *p == s {
                                    *p = i;
                                }
                            }
                        }
                        changed = true;
                        continue;
                    }
                }

                if let [x, y] = succs.as_slice() {
                    let (x, y) = (*x, *y);
                    let one_in_one_out = |nodes: &[Option<Node>], n: usize| {
                        let node = nodes[n].as_ref().unwrap();
                        node.preds.len() == 1 && node.succs.len() <= 1
                    };
                    // While: one arm loops straight back to the condition
                    let mut matched = false;
                    for body in [x, y] {
                        let node = nodes[body].as_ref().unwrap();
                        if body != i && node.preds.len() == 1 && node.succs == vec![i] {
                            unlink(&mut nodes, i, body);
                            unlink(&mut nodes, body, i);
                            let b = nodes[body].take().unwrap();
                            let n = nodes[i].as_mut().unwrap();
                            n.body = StructBlock::While {
                                cond: Box::new(n.body.clone()),
                                body: Box::new(b.body),
                            };
                            changed = true;
                            matched = true;
                            break;
                        }
                    }
                    if matched {
                        continue;
                    }
                    // If-else: both arms converge on the same third node
                    let (nx, ny) = (nodes[x].as_ref().unwrap(), nodes[y].as_ref().unwrap());
                    if one_in_one_out(&nodes, x)
                        && one_in_one_out(&nodes, y)
                        && nx.succs.len() == 1
                        && nx.succs == ny.succs
                        && nx.succs[0] != i
                    {
                        let tail = nx.succs[0];
                        unlink(&mut nodes, i, x);
                        unlink(&mut nodes, i, y);
                        unlink(&mut nodes, x, tail);
                        unlink(&mut nodes, y, tail);
                        let bx = nodes[x].take().unwrap();
                        let by = nodes[y].take().unwrap();
                        let n = nodes[i].as_mut().unwrap();
                        n.body = StructBlock::IfElse {
                            cond: Box::new(n.body.clone()),
                            then_body: Box::new(bx.body),
                            else_body: Box::new(by.body),
                        };
                        n.succs.push(tail);
                        nodes[tail].as_mut().unwrap().preds.push(i);
                        changed = true;
                        continue;
                    }
                    // If-then: one arm falls straight through to the other successor
                    for (then_n, tail) in [(x, y), (y, x)] {
                        let node = nodes[then_n].as_ref().unwrap();
                        if then_n != i && node.preds.len() == 1 && node.succs == vec![tail] {
                            unlink(&mut nodes, i, then_n);
                            unlink(&mut nodes, then_n, tail);
                            let b = nodes[then_n].take().unwrap();
                            let n = nodes[i].as_mut().unwrap();
                            n.body = StructBlock::IfThen {
                                cond: Box::new(n.body.clone()),
                                then_body: Box::new(b.body),
                            };
                            changed = true;
                            matched = true;
                            break;
                        }
                    }
                    if matched {
                        continue;
                    }
                }

                // Switch: three or more successors, each a case body converging on one tail
                if succs.len() >= 3 {
                    let case_ok = |nodes: &[Option<Node>], n: usize| {
                        let node = nodes[n].as_ref().unwrap();
                        node.preds.len() == 1 && node.succs.len() <= 1
                    };
                    let tails: UnorderedSet<usize> = succs
                        .iter()
                        .filter(|&&s| case_ok(&nodes, s))
                        .flat_map(|&s| nodes[s].as_ref().unwrap().succs.clone())
                        .collect();
                    if succs.iter().all(|&s| case_ok(&nodes, s)) && tails.len() <= 1 {
                        let tail = tails.iter().next().copied();
                        let mut cases = Vec::new();
                        for s in succs {
                            unlink(&mut nodes, i, s);
                            if let Some(t) = tail {
                                if nodes[s].as_ref().unwrap().succs.contains(&t) {
                                    unlink(&mut nodes, s, t);
                                }
                            }
                            cases.push(nodes[s].take().unwrap().body);
                        }
                        let n = nodes[i].as_mut().unwrap();
                        n.body = StructBlock::Switch {
                            cond: Box::new(n.body.clone()),
                            cases,
                        };
                        if let Some(t) = tail {
                            n.succs.push(t);
                            nodes[t].as_mut().unwrap().preds.push(i);
                        }
                        changed = true;
                        continue;
                    }
                }

                // Two-node infinite loop with no exit
                if let [s] = nodes[i].as_ref().unwrap().succs.as_slice() {
                    let s = *s;
                    let back = nodes[s].as_ref().unwrap();
                    if s != i
                        && back.succs == vec![i]
                        && back.preds.len() == 1
                        && nodes[i].as_ref().unwrap().preds.iter().all(|&p| p == s)
                    {
                        unlink(&mut nodes, i, s);
                        unlink(&mut nodes, s, i);
                        let b = nodes[s].take().unwrap();
                        let n = nodes[i].as_mut().unwrap();
                        n.body = StructBlock::InfiniteLoop {
                            body: Box::new(StructBlock::Sequence(vec![
                                n.body.clone(),
                                b.body,
                            ])),
                        };
                        changed = true;
                        continue;
                    }
                }
            }

            let remaining = live(&nodes);
            if remaining.len() <= 1 {
                let root = remaining
                    .first()
                    .map(|&i| nodes[i].take().unwrap().body)
                    .unwrap_or(StructBlock::Sequence(Vec::new()));
                return root;
            }
            if !changed {
                // No reduction applies: surrender one edge as a goto and keep reducing. Pick the
                // edge whose target has the most predecessors, favoring merge points.
                let mut best: Option<(usize, usize, usize)> = None;
                for i in live(&nodes) {
                    for &s in &nodes[i].as_ref().unwrap().succs {
                        let w = nodes[s].as_ref().unwrap().preds.len();
                        if best.map_or(true, |(_, _, bw)| w > bw) {
                            best = Some((i, s, w));
                        }
                    }
                }
                let Some((from, to, _)) = best else {
                    // Disconnected leftovers: stitch them into a bare sequence.
                    let mut parts = Vec::new();
                    for i in remaining {
                        parts.push(nodes[i].take().unwrap().body);
                    }
                    return StructBlock::Sequence(parts);
                };
                unlink(&mut nodes, from, to);
                let target = first_block_of(&nodes[to].as_ref().unwrap().body);
                trace!("Structuring surrendered an edge as goto"; "target" => ?target);
                let n = nodes[from].as_mut().unwrap();
                n.body = StructBlock::Goto {
                    body: Box::new(n.body.clone()),
                    target,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (BlockGraph, [BlockId; 4]) {
        let mut g = BlockGraph::new();
        let a = g.new_block();
        let b = g.new_block();
        let c = g.new_block();
        let d = g.new_block();
        g.entry = Some(a);
        g.add_edge(a, b);
        g.add_edge(a, c);
        g.add_edge(b, d);
        g.add_edge(c, d);
        (g, [a, b, c, d])
    }

    #[test]
    fn dominators_of_a_diamond() {
        let (mut g, [a, b, c, d]) = diamond();
        g.calc_dominators();
        assert_eq!(g.get(b).immed_dom, Some(a));
        assert_eq!(g.get(c).immed_dom, Some(a));
        assert_eq!(g.get(d).immed_dom, Some(a));
        assert!(g.dominates(a, d));
        assert!(!g.dominates(b, d));
    }

    #[test]
    fn dominance_frontier_of_a_diamond() {
        let (mut g, [_a, b, c, d]) = diamond();
        g.calc_dominators();
        let df = g.dominance_frontiers();
        assert!(df.get(&b).unwrap().contains(&d));
        assert!(df.get(&c).unwrap().contains(&d));
    }

    #[test]
    fn diamond_structures_as_if_else() {
        let (mut g, _) = diamond();
        g.calc_dominators();
        match g.structure() {
            StructBlock::Sequence(parts) => {
                assert_eq!(parts.len(), 2);
                assert!(matches!(parts[0], StructBlock::IfElse { .. }));
            }
            other => panic!("unexpected structure {:?}", other),
        }
    }

    #[test]
    fn loop_detection() {
        let mut g = BlockGraph::new();
        let a = g.new_block();
        let b = g.new_block();
        let c = g.new_block();
        g.entry = Some(a);
        g.add_edge(a, b);
        g.add_edge(b, b); // self loop
        g.add_edge(b, c);
        g.calc_dominators();
        assert_eq!(g.loop_back_edges(), vec![(b, b)]);
    }

    #[test]
    fn splice_merges_a_linear_pair() {
        use crate::address::{Address, SpaceKind, SpaceManager};
        use crate::op::OpStore;
        use crate::opcode::OpCode;

        let mut mgr = SpaceManager::new();
        let code = mgr.add_space("code", SpaceKind::Code, 8, 0);
        let mut ops = OpStore::new();
        let mut g = BlockGraph::new();
        let a = g.new_block();
        let b = g.new_block();
        let c = g.new_block();
        g.entry = Some(a);
        g.add_edge(a, b);
        g.add_edge(b, c);

        let o1 = ops.create(OpCode::Copy, Address::new(code, 0x10), 1);
        let o2 = ops.create(OpCode::Copy, Address::new(code, 0x14), 1);
        g.get_mut(a).ops.push(o1);
        g.get_mut(b).ops.push(o2);
        g.renumber_block(a, &mut ops);
        g.renumber_block(b, &mut ops);

        let moved = g.splice_block(a, b, &mut ops);
        assert_eq!(moved, vec![o2]);
        assert!(!g.is_live(b));
        assert_eq!(g.get(a).ops(), &[o1, o2]);
        assert_eq!(ops.get(o2).order(), 1);
        assert!(g.get(a).flags.contains(BlockFlags::JOINED));
        assert_eq!(g.get(a).out_edges()[0].block, c);
        assert_eq!(g.get(c).in_edges()[0].block, a);
    }

    #[test]
    fn move_out_edge_preserves_slot() {
        let mut g = BlockGraph::new();
        let a = g.new_block();
        let b = g.new_block();
        let c = g.new_block();
        let d = g.new_block();
        g.entry = Some(a);
        g.add_edge(a, b);
        g.add_edge(a, c);
        g.move_out_edge(a, 0, d);
        assert_eq!(g.get(a).out_edges()[0].block, d);
        assert_eq!(g.get(a).out_edges()[1].block, c);
        assert_eq!(g.get(b).in_count(), 0);
        assert_eq!(g.get(d).in_edges()[0].block, a);
    }

    #[test]
    fn switch_edge_reports_slots() {
        let mut g = BlockGraph::new();
        let a = g.new_block();
        let b = g.new_block();
        let c = g.new_block();
        g.entry = Some(a);
        g.add_edge(a, b);
        let (lost, gained) = g.switch_edge(a, b, c);
        assert_eq!(lost, 0);
        assert_eq!(gained, 0);
        assert_eq!(g.get(a).out_edges[0].block, c);
        assert_eq!(g.get(b).in_count(), 0);
    }
}
