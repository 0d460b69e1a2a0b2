//! Heritage: construction of single-assignment form over the address-granular memory model.
//!
//! Each pass walks the address spaces in registration order, skipping spaces whose configured
//! delay has not yet expired. For every storage location written in a space, merge ops (phi) are
//! placed on the iterated dominance frontier of the writing blocks, and reads are renamed to the
//! reaching definition by a dominator-tree walk. A location read before any write becomes a
//! function input.
//!
//! Loads and stores through symbolic pointers get a *guard* recording the range the pointer may
//! take. While a store guard in a space is unresolved, heritage defers the space's locations; a
//! location deferred more than the configured limit is reported not-yet-heritaged, and the
//! rewrite loop must refrain from folding its reads to constants.

use crate::address::{Address, SpaceKind};
use crate::config::CONFIG;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::funcdata::Funcdata;
use crate::log::*;
use crate::blockgraph::BlockId;
use crate::op::OpId;
use crate::opcode::OpCode;
use crate::varnode::{VarFlags, VarnodeId};

/// Per-space heritage bookkeeping.
#[derive(Clone, Debug)]
pub struct HeritageInfo {
    /// Passes to wait before the space is first heritaged.
    pub delay: usize,
    /// Extra passes dead cells in the space survive before reclamation.
    pub deadcode_delay: usize,
    /// Whether dead code has ever been removed from the space.
    pub seen_dead: bool,
}

/// A load or store whose pointer is symbolic, paired with the value range the pointer can take.
#[derive(Clone, Debug)]
pub struct LoadGuard {
    pub op: OpId,
    /// The space the access reaches into.
    pub space: crate::address::SpaceId,
    /// Known inclusive offset range of the pointer; the full space when nothing is known.
    pub min: u64,
    pub max: u64,
    /// Guards start unresolved; value-set analysis during rewriting may narrow and resolve them.
    pub resolved: bool,
    /// Whether the guarded op is a store (stores block heritage of aliasable locations).
    pub is_store: bool,
}

impl LoadGuard {
    fn intersects(&self, addr: Address, size: u32) -> bool {
        addr.space == self.space
            && addr.offset <= self.max
            && self.min < addr.offset.saturating_add(size as u64)
    }
}

/// A storage location: exact (address, size) granule the renamer operates on.
type Location = (Address, u32);

/// The SSA builder state. Owned by the function container and taken out for the duration of each
/// pass.
#[derive(Default, Clone)]
pub struct Heritage {
    /// Completed heritage passes.
    pub pass_count: usize,
    info: UnorderedMap<crate::address::SpaceId, HeritageInfo>,
    guards: Vec<LoadGuard>,
    /// Deferral counts per location.
    defers: UnorderedMap<Location, usize>,
    /// Locations reported as not-yet-heritaged; reads of these must not be folded.
    not_heritaged: UnorderedSet<Location>,
    /// Locations already renamed; revisited only when fresh free reads appear.
    completed: UnorderedSet<Location>,
}

impl Heritage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The guards recorded so far.
    pub fn guards(&self) -> &[LoadGuard] {
        &self.guards
    }

    /// Mark the guard protecting `op` resolved with a narrowed range.
    pub fn resolve_guard(&mut self, op: OpId, min: u64, max: u64) {
        for g in &mut self.guards {
            if g.op == op {
                g.min = min;
                g.max = max;
                g.resolved = true;
            }
        }
    }

    /// Whether reads of this cell may be replaced by constants.
    pub fn is_heritaged(&self, addr: Address, size: u32) -> bool {
        !self.not_heritaged.contains(&(addr, size))
    }

    fn info_mut(&mut self, space: crate::address::SpaceId, delay: usize) -> &mut HeritageInfo {
        self.info.entry(space).or_insert_with(|| HeritageInfo {
            delay,
            deadcode_delay: CONFIG.deadcode_delay,
            seen_dead: false,
        })
    }

    /// One full heritage pass over every heritable space.
    pub fn heritage(&mut self, fd: &mut Funcdata) {
        fd.blocks_mut().calc_dominators();
        self.collect_guards(fd);

        let spaces: Vec<(crate::address::SpaceId, usize)> = fd
            .arch()
            .spaces
            .iter()
            .filter(|s| {
                matches!(
                    s.kind,
                    SpaceKind::Register | SpaceKind::Unique | SpaceKind::Stack | SpaceKind::Ram
                )
            })
            .map(|s| (s.index, s.delay))
            .collect();

        for (space, delay) in spaces {
            let info = self.info_mut(space, delay).clone();
            if self.pass_count < info.delay {
                continue;
            }
            self.heritage_space(fd, space);
        }

        // Free cells whose reads were all renamed away no longer belong to anything; after this
        // sweep every surviving cell is written, an input, a constant, or an annotation.
        let orphans: Vec<VarnodeId> = fd
            .vars()
            .all()
            .filter(|&vn| {
                let v = fd.vars().get(vn);
                v.is_free() && v.uses().is_empty()
            })
            .collect();
        for vn in orphans {
            fd.vars_mut().destroy(vn);
        }

        self.pass_count += 1;
    }

    /// Record guards for loads and stores whose pointer operand is not a constant.
    fn collect_guards(&mut self, fd: &mut Funcdata) {
        let known: UnorderedSet<OpId> = self.guards.iter().map(|g| g.op).collect();
        let loads: Vec<OpId> = fd
            .ops()
            .opcode_iter(OpCode::Load)
            .chain(fd.ops().opcode_iter(OpCode::Store))
            .filter(|&op| !fd.ops().get(op).is_dead() && !known.contains(&op))
            .collect();
        for op in loads {
            let (opcode, space_const, ptr) = {
                let o = fd.ops().get(op);
                (o.opcode, o.input(0), o.input(1))
            };
            let (Some(space_const), Some(ptr)) = (space_const, ptr) else {
                continue;
            };
            if fd.vars().get(ptr).is_constant() {
                continue;
            }
            let Some(space_off) = fd.vars().get(space_const).constant_value() else {
                continue;
            };
            let space = crate::address::SpaceId(space_off as usize);
            self.guards.push(LoadGuard {
                op,
                space,
                min: 0,
                max: u64::MAX,
                resolved: false,
                is_store: opcode == OpCode::Store,
            });
            trace!("Recorded pointer guard"; "op" => ?op, "store" => (opcode == OpCode::Store));
        }
    }

    /// Heritage one space: defer aliasable locations behind unresolved store guards, place phis,
    /// rename.
    fn heritage_space(&mut self, fd: &mut Funcdata, space: crate::address::SpaceId) {
        let locations = self.collect_locations(fd, space);
        if locations.is_empty() {
            return;
        }

        let mut ready: Vec<Location> = Vec::new();
        for loc in locations {
            let blocked = self
                .guards
                .iter()
                .any(|g| g.is_store && !g.resolved && g.intersects(loc.0, loc.1));
            if blocked {
                let defers = self.defers.entry(loc).or_insert(0);
                *defers += 1;
                if *defers > CONFIG.heritage_defer_limit {
                    if self.not_heritaged.insert(loc) {
                        warn!(
                            "Storage location exceeded its guard deferral limit";
                            "addr" => ?loc.0, "size" => loc.1
                        );
                        fd.warning(
                            "pointer writes prevent analysis of this storage".to_string(),
                            Some(loc.0),
                        );
                    }
                } else {
                    debug!("Deferring guarded location"; "addr" => ?loc.0, "count" => *defers);
                    continue;
                }
            }
            ready.push(loc);
        }

        for loc in ready {
            if self.completed.contains(&loc) {
                // Only fresh free reads remain: rename against the existing definitions
                // (including previously placed phis) without placing new ones.
                self.rename_location(fd, loc, &Default::default());
            } else {
                self.heritage_location(fd, loc);
                self.completed.insert(loc);
            }
        }
    }

    /// Distinct exact storage locations of the space that are written or read by alive ops, after
    /// splitting reads that are strictly contained in a larger written location.
    fn collect_locations(&mut self, fd: &mut Funcdata, space: crate::address::SpaceId) -> Vec<Location> {
        let mut written: UnorderedSet<Location> = Default::default();
        let mut read: UnorderedSet<Location> = Default::default();
        for op in fd.ops().alive_iter() {
            let o = fd.ops().get(op);
            if let Some(out) = o.output() {
                let v = fd.vars().get(out);
                if v.addr.space == space {
                    written.insert((v.addr, v.size));
                }
            }
            for i in 0..o.num_inputs() {
                if let Some(vn) = o.input(i) {
                    let v = fd.vars().get(vn);
                    if v.addr.space == space && v.is_free() {
                        read.insert((v.addr, v.size));
                    }
                }
            }
        }

        // Reads strictly inside a larger written location are split with SUBPIECE so every read
        // sees a single definer. Other partial overlaps are reported and left untouched.
        let contained: Vec<(Location, Location)> = read
            .iter()
            .filter(|r| !written.contains(*r))
            .filter_map(|&r| {
                written
                    .iter()
                    .find(|w| w.0.contains(w.1, &r.0, r.1).is_some() && **w != r)
                    .map(|&w| (r, w))
            })
            .collect();
        for (r, w) in &contained {
            fd.split_read_from(*r, *w);
            read.remove(r);
        }
        let overlapping: Vec<Location> = read
            .iter()
            .filter(|r| {
                written
                    .iter()
                    .any(|w| w != *r && w.0.overlaps(w.1, &r.0, r.1) && w.0.contains(w.1, &r.0, r.1).is_none())
            })
            .copied()
            .collect();
        for loc in overlapping {
            if self.not_heritaged.insert(loc) {
                warn!("Partially overlapping storage writes"; "addr" => ?loc.0, "size" => loc.1);
                fd.warning(
                    "partially overlapping writes prevent analysis of this storage".to_string(),
                    Some(loc.0),
                );
            }
            read.remove(&loc);
        }

        use itertools::Itertools;
        written
            .iter()
            .chain(read.iter())
            .copied()
            .filter(|loc| !self.completed.contains(loc) || read.contains(loc))
            .sorted()
            .dedup()
            .collect()
    }

    /// Phi placement and renaming for a single location.
    fn heritage_location(&mut self, fd: &mut Funcdata, loc: Location) {
        let (addr, size) = loc;

        // Blocks writing the location
        let mut write_blocks: UnorderedSet<BlockId> = Default::default();
        for op in fd.ops().alive_iter() {
            let o = fd.ops().get(op);
            if let (Some(out), Some(parent)) = (o.output(), o.parent()) {
                let v = fd.vars().get(out);
                if v.addr == addr && v.size == size {
                    write_blocks.insert(parent);
                }
            }
        }
        if write_blocks.is_empty() {
            // Read-only location: all reads become the same function input.
            self.rename_location(fd, loc, &Default::default());
            return;
        }

        // Iterated dominance frontier
        let df = fd.blocks().dominance_frontiers();
        let mut phi_blocks: UnorderedSet<BlockId> = Default::default();
        let mut work: Vec<BlockId> = write_blocks.iter().copied().collect();
        while let Some(b) = work.pop() {
            if let Some(frontier) = df.get(&b) {
                for &f in frontier {
                    if phi_blocks.insert(f) {
                        work.push(f);
                    }
                }
            }
        }

        // Insert one phi per frontier block, with one input slot per in-edge
        let mut phis: UnorderedMap<BlockId, OpId> = Default::default();
        for &b in &phi_blocks {
            let nslots = fd.blocks().get(b).in_count();
            if nslots < 2 {
                continue;
            }
            let op = fd.new_phi(b, addr, size, nslots);
            phis.insert(b, op);
        }

        self.rename_location(fd, loc, &phis);
    }

    /// Dominator-tree renaming walk for one location.
    fn rename_location(
        &mut self,
        fd: &mut Funcdata,
        loc: Location,
        phis: &UnorderedMap<BlockId, OpId>,
    ) {
        let (addr, size) = loc;
        let Some(entry) = fd.blocks().entry else {
            return;
        };

        // Children in the dominator tree
        let mut dom_children: UnorderedMap<BlockId, Vec<BlockId>> = Default::default();
        for b in fd.blocks().iter() {
            if let Some(d) = fd.blocks().get(b).immed_dom {
                if d != b {
                    dom_children.entry(d).or_default().push(b);
                }
            }
        }
        for kids in dom_children.iter_mut() {
            kids.1.sort();
        }

        let mut stack: Vec<VarnodeId> = Vec::new();
        let mut input_cell: Option<VarnodeId> = None;

        // Explicit DFS: (block, pushed-count, next-child-index)
        let mut walk: Vec<(BlockId, usize, usize)> = vec![(entry, 0, 0)];
        'outer: while let Some(frame) = walk.last_mut() {
            let (block, ref mut pushed, ref mut child_idx) = *frame;
            if *child_idx == 0 && *pushed == 0 {
                // First visit: rename ops of this block in order
                let ops: Vec<OpId> = fd.blocks().get(block).ops().to_vec();
                let mut pushes = 0usize;
                for op in ops {
                    let (opcode, nin, out) = {
                        let o = fd.ops().get(op);
                        (o.opcode, o.num_inputs(), o.output())
                    };
                    // Phi ops for this location only define; their inputs fill from predecessors
                    let is_our_phi = phis.get(&block) == Some(&op);
                    if !is_our_phi && opcode != OpCode::Phi {
                        for slot in 0..nin {
                            let Some(vn) = fd.ops().get(op).input(slot) else {
                                continue;
                            };
                            let v = fd.vars().get(vn);
                            if !(v.addr == addr && v.size == size && v.is_free()) {
                                continue;
                            }
                            let reaching = match stack.last() {
                                Some(&top) => top,
                                None => *input_cell.get_or_insert_with(|| {
                                    fd.make_input(addr, size)
                                }),
                            };
                            if reaching != vn {
                                fd.op_set_input(op, Some(reaching), slot);
                            }
                        }
                    }
                    if let Some(out) = out {
                        let v = fd.vars().get(out);
                        if v.addr == addr && v.size == size {
                            stack.push(out);
                            pushes += 1;
                        }
                    }
                }
                // Fill successor phi slots with the current reaching definition
                let succs: Vec<BlockId> = fd
                    .blocks()
                    .get(block)
                    .out_edges()
                    .iter()
                    .map(|e| e.block)
                    .collect();
                for s in succs {
                    let Some(&phi) = phis.get(&s) else { continue };
                    let Some(slot) = fd.blocks().get(s).in_index_of(block) else {
                        continue;
                    };
                    let reaching = match stack.last() {
                        Some(&top) => top,
                        None => *input_cell.get_or_insert_with(|| fd.make_input(addr, size)),
                    };
                    fd.op_set_input(phi, Some(reaching), slot);
                }
                frame.1 = pushes;
            }
            // Descend into the next dominator child
            let (block, pushed, child_idx) = *frame;
            let kids = dom_children.get(&block).map(Vec::as_slice).unwrap_or(&[]);
            if child_idx < kids.len() {
                let child = kids[child_idx];
                walk.last_mut().unwrap().2 += 1;
                walk.push((child, 0, 0));
                continue 'outer;
            }
            // Done with this block: pop its definitions
            for _ in 0..pushed {
                stack.pop();
            }
            walk.pop();
        }
    }

    /// Reclaim dead cells and ops in spaces whose dead-code delay has expired. An op dies when
    /// its output has no readers and the op has no side effect. Returns the number of ops
    /// removed.
    pub fn dead_code_elimination(&mut self, fd: &mut Funcdata) -> usize {
        let mut removed = 0usize;
        loop {
            let victim = fd.ops().alive_iter().find(|&op| {
                let o = fd.ops().get(op);
                if o.opcode.is_branch()
                    || o.opcode.is_call()
                    || matches!(o.opcode, OpCode::Store | OpCode::Return | OpCode::UserOp)
                    || o.flags.contains(crate::op::OpFlags::NOCOLLAPSE)
                {
                    return false;
                }
                match o.output() {
                    None => false,
                    Some(out) => {
                        let v = fd.vars().get(out);
                        let space_delay = self
                            .info
                            .get(&v.addr.space)
                            .map(|i| i.deadcode_delay)
                            .unwrap_or(CONFIG.deadcode_delay);
                        self.pass_count >= space_delay
                            && v.uses().is_empty()
                            && !v.flags.intersects(VarFlags::ADDRFORCE | VarFlags::PERSIST)
                    }
                }
            });
            let Some(op) = victim else { break };
            let space = fd
                .ops()
                .get(op)
                .output()
                .map(|o| fd.vars().get(o).addr.space);
            fd.op_destroy(op);
            if let Some(space) = space {
                if let Some(info) = self.info.get_mut(&space) {
                    info.seen_dead = true;
                }
            }
            removed += 1;
        }
        if removed > 0 {
            debug!("Dead code elimination"; "removed" => removed);
        }
        removed
    }
}
