//! High-variables: groups of value cells that must share one printable variable, and the
//! cover-intersection machinery that gates merging them.
//!
//! A cover maps each basic block to a sorted list of half-open intervals over the block's op
//! order, describing where the variable's value is live. Covers are recomputed lazily: any edit
//! marks the owning high-variable dirty, and the next intersection query rebuilds it. Pairwise
//! intersection verdicts are cached; the cache survives merges by migrating entries according to
//! the rules spelled out on [`HighStore::merge`].

use crate::blockgraph::BlockId;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::funcdata::Funcdata;
use crate::log::*;
use crate::opcode::OpCode;
use crate::varnode::{VarFlags, VarnodeId};

/// Handle to a high-variable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HighId(pub(crate) usize);

impl std::fmt::Debug for HighId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "hv{}", self.0)
    }
}

/// Result of intersecting two covers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CoverIntersect {
    /// No shared point
    None,
    /// The covers touch at single points only
    Boundary,
    /// The covers share an interval of positive length
    Proper,
}

/// Per-block live intervals, half-open over op order. `u32::MAX` as an end means live-out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cover {
    blocks: UnorderedMap<BlockId, Vec<(u32, u32)>>,
}

impl Cover {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn add(&mut self, block: BlockId, start: u32, end: u32) {
        let list = self.blocks.entry(block).or_default();
        list.push((start, end));
        list.sort();
        // Fuse abutting or overlapping intervals
        let mut fused: Vec<(u32, u32)> = Vec::new();
        for &(s, e) in list.iter() {
            match fused.last_mut() {
                Some(last) if s <= last.1 => last.1 = last.1.max(e),
                _ => fused.push((s, e)),
            }
        }
        *list = fused;
    }

    /// Merge another cover into this one.
    pub fn union(&mut self, other: &Cover) {
        for (&b, list) in other.blocks.iter() {
            for &(s, e) in list {
                self.add(b, s, e);
            }
        }
    }

    /// Three-valued intersection. Touch points are returned so the copy-shadow test can examine
    /// the ops there.
    pub fn intersect(&self, other: &Cover) -> (CoverIntersect, Vec<(BlockId, u32)>) {
        let mut touches = Vec::new();
        for (&b, mine) in self.blocks.iter() {
            let Some(theirs) = other.blocks.get(&b) else {
                continue;
            };
            for &(s0, e0) in mine {
                for &(s1, e1) in theirs {
                    let lo = s0.max(s1);
                    let hi = e0.min(e1);
                    if lo < hi {
                        return (CoverIntersect::Proper, Vec::new());
                    }
                    if lo == hi && (s0 == e1 || s1 == e0) {
                        touches.push((b, lo));
                    }
                }
            }
        }
        if touches.is_empty() {
            (CoverIntersect::None, touches)
        } else {
            (CoverIntersect::Boundary, touches)
        }
    }
}

/// A group of value cells occupying one storage name in the output.
#[derive(Debug, Default)]
pub struct HighVariable {
    pub(crate) members: Vec<VarnodeId>,
    pub datatype: Option<crate::typeprop::TypeId>,
    pub symbol: Option<crate::symbols::SymbolId>,
    /// Link to the composite whole this variable is a piece of, if any.
    pub piece: Option<HighId>,
    cover: Cover,
    cover_dirty: bool,
    /// Scratch traversal mark.
    pub mark: bool,
}

impl HighVariable {
    pub fn members(&self) -> &[VarnodeId] {
        &self.members
    }
}

/// Owns the high-variables of one function plus the intersection cache.
#[derive(Default)]
pub struct HighStore {
    arena: Vec<Option<HighVariable>>,
    cache: UnorderedMap<(HighId, HighId), bool>,
    /// Creation index captured by `set_high_level`; cells created before it are ignored.
    capture_index: Option<usize>,
}

impl HighStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: HighId) -> &HighVariable {
        self.arena[id.0].as_ref().expect("stale HighId")
    }

    pub fn get_mut(&mut self, id: HighId) -> &mut HighVariable {
        self.arena[id.0].as_mut().expect("stale HighId")
    }

    pub fn is_live(&self, id: HighId) -> bool {
        self.arena.get(id.0).map_or(false, |h| h.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = HighId> + '_ {
        (0..self.arena.len())
            .map(HighId)
            .filter(move |&id| self.arena[id.0].is_some())
    }

    pub fn capture_index(&self) -> Option<usize> {
        self.capture_index
    }

    /// Capture the current creation index: from here on every non-annotation cell belongs to a
    /// high-variable. Existing high state is discarded and rebuilt.
    pub fn set_high_level(&mut self, fd: &mut Funcdata) {
        self.arena.clear();
        self.cache.clear();
        self.capture_index = Some(fd.vars().create_count());
        let cells: Vec<VarnodeId> = fd.vars().all().collect();
        for vn in cells {
            if fd
                .vars()
                .get(vn)
                .flags
                .intersects(VarFlags::ANNOTATION)
            {
                continue;
            }
            let id = HighId(self.arena.len());
            self.arena.push(Some(HighVariable {
                members: vec![vn],
                cover_dirty: true,
                ..Default::default()
            }));
            fd.vars_mut().get_mut(vn).high = Some(id);
        }
        debug!("Captured high-level view"; "highs" => self.arena.len());
    }

    /// Attach a cell created after the capture point to a fresh high-variable.
    pub fn attach_new_cell(&mut self, fd: &mut Funcdata, vn: VarnodeId) -> HighId {
        let id = HighId(self.arena.len());
        self.arena.push(Some(HighVariable {
            members: vec![vn],
            cover_dirty: true,
            ..Default::default()
        }));
        fd.vars_mut().get_mut(vn).high = Some(id);
        id
    }

    /// Mark a high-variable's cover stale. All cached verdicts involving it become untrusted and
    /// are dropped on the spot (the spec's laziness is about recomputing the cover, not about
    /// keeping stale entries queryable).
    pub fn dirty_cover(&mut self, id: HighId) {
        self.get_mut(id).cover_dirty = true;
        self.cache.retain(|&(a, b), _| a != id && b != id);
    }

    fn key(a: HighId, b: HighId) -> (HighId, HighId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Whether two high-variables' covers intersect, consulting and filling the cache.
    pub fn intersection(&mut self, fd: &Funcdata, a: HighId, b: HighId) -> bool {
        if a == b {
            return true;
        }
        let key = Self::key(a, b);
        if let Some(&hit) = self.cache.get(&key) {
            return hit;
        }
        self.refresh_cover(fd, a);
        self.refresh_cover(fd, b);
        let (verdict, touches) = self.get(a).cover.intersect(&self.get(b).cover);
        let result = match verdict {
            CoverIntersect::None => false,
            CoverIntersect::Proper => true,
            CoverIntersect::Boundary => !self.copy_shadow(fd, a, b, &touches),
        };
        self.cache.insert(key, result);
        result
    }

    /// Boundary-touch refinement: a touch where one variable's cell is defined by a COPY (or a
    /// SUBPIECE at matching offset) of the other's cell does not count as an intersection.
    fn copy_shadow(
        &self,
        fd: &Funcdata,
        a: HighId,
        b: HighId,
        touches: &[(BlockId, u32)],
    ) -> bool {
        let members_a: UnorderedSet<VarnodeId> = self.get(a).members.iter().copied().collect();
        let members_b: UnorderedSet<VarnodeId> = self.get(b).members.iter().copied().collect();
        'touch: for &(block, point) in touches {
            for &op in fd.blocks().get(block).ops() {
                if fd.ops().get(op).order() as u32 != point {
                    continue;
                }
                let o = fd.ops().get(op);
                if !matches!(o.opcode, OpCode::Copy | OpCode::SubPiece) {
                    continue;
                }
                let (Some(out), Some(inp)) = (o.output(), o.input(0)) else {
                    continue;
                };
                let shadowed = (members_a.contains(&out) && members_b.contains(&inp))
                    || (members_b.contains(&out) && members_a.contains(&inp));
                if shadowed {
                    continue 'touch;
                }
            }
            return false; // a touch with no shadowing copy: real intersection
        }
        true
    }

    fn refresh_cover(&mut self, fd: &Funcdata, id: HighId) {
        if !self.get(id).cover_dirty {
            return;
        }
        let members = self.get(id).members.clone();
        let cover = build_cover(fd, &members);
        let h = self.get_mut(id);
        h.cover = cover;
        h.cover_dirty = false;
    }

    /// Merge `from` into `into`: members move over, covers union, and the cache migrates:
    /// every `true` entry `{from, x}` becomes `{into, x}` (still true); a `false` entry
    /// `{from, x}` survives only if `{into, x}` was also cached false; everything else must be
    /// recomputed lazily.
    pub fn merge(&mut self, fd: &mut Funcdata, into: HighId, from: HighId) {
        assert_ne!(into, from);
        let moved = std::mem::take(&mut self.get_mut(from).members);
        for &vn in &moved {
            fd.vars_mut().get_mut(vn).high = Some(into);
        }
        let from_cover = std::mem::take(&mut self.get_mut(from).cover);
        {
            let h = self.get_mut(into);
            h.members.extend(moved);
            h.members.sort();
            h.cover.union(&from_cover);
            // The member set changed; the next intersection query recomputes from scratch
            h.cover_dirty = true;
        }

        let old_cache = std::mem::take(&mut self.cache);
        let mut migrated: UnorderedMap<(HighId, HighId), bool> = Default::default();
        // Entries not involving either side carry over untouched; entries on `into` are held
        // aside to be checked against migrating `from` entries.
        let mut into_entries: UnorderedMap<HighId, bool> = Default::default();
        let mut from_entries: UnorderedMap<HighId, bool> = Default::default();
        for (&(x, y), &v) in old_cache.iter() {
            if x == from || y == from {
                let other = if x == from { y } else { x };
                if other != into {
                    from_entries.insert(other, v);
                }
            } else if x == into || y == into {
                let other = if x == into { y } else { x };
                into_entries.insert(other, v);
            } else {
                migrated.insert((x, y), v);
            }
        }
        for (other, v) in from_entries {
            let key = Self::key(into, other);
            if v {
                migrated.insert(key, true);
            } else if into_entries.get(&other) == Some(&false) {
                migrated.insert(key, false);
            }
            into_entries.remove(&other);
        }
        // `into` entries with no `from` counterpart are stale: the union may now intersect
        // where `into` alone did not, so only positive verdicts survive.
        for (other, v) in into_entries {
            if v {
                migrated.insert(Self::key(into, other), true);
            }
        }
        self.cache = migrated;

        self.arena[from.0] = None;
        trace!("Merged high variables"; "into" => ?into, "from" => ?from);
    }

    /// Number of cached verdicts; exposed for tests.
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Direct cache inspection; exposed for tests.
    pub fn cached(&self, a: HighId, b: HighId) -> Option<bool> {
        self.cache.get(&Self::key(a, b)).copied()
    }

    /// Pre-seed a cache entry; exposed for tests of the merge semantics.
    pub fn seed_cache(&mut self, a: HighId, b: HighId, v: bool) {
        self.cache.insert(Self::key(a, b), v);
    }
}

/// Compute the cover of a set of cells: for each cell, the interval from its definition to each
/// use, walking intervening blocks in full.
pub fn build_cover(fd: &Funcdata, members: &[VarnodeId]) -> Cover {
    let mut cover = Cover::default();
    for &vn in members {
        let v = fd.vars().get(vn);
        let def_point: Option<(BlockId, u32)> = match v.def() {
            Some(op) => fd
                .ops()
                .get(op)
                .parent()
                .map(|b| (b, fd.ops().get(op).order() as u32)),
            None => fd.blocks().entry.map(|e| (e, 0)),
        };
        let Some((def_block, def_order)) = def_point else {
            continue;
        };
        // A definition with no reader still occupies its definition point.
        cover.add(def_block, def_order, def_order);
        for &use_op in v.uses() {
            let Some(use_block) = fd.ops().get(use_op).parent() else {
                continue;
            };
            let use_order = fd.ops().get(use_op).order() as u32;
            if use_block == def_block {
                cover.add(def_block, def_order, use_order.max(def_order));
                continue;
            }
            // Walk back from the use to the definition, covering intermediate blocks fully.
            cover.add(use_block, 0, use_order);
            cover.add(def_block, def_order, u32::MAX);
            let mut seen: UnorderedSet<BlockId> = Default::default();
            seen.insert(use_block);
            seen.insert(def_block);
            let mut work: Vec<BlockId> = fd
                .blocks()
                .get(use_block)
                .in_edges()
                .iter()
                .map(|e| e.block)
                .collect();
            while let Some(b) = work.pop() {
                if !seen.insert(b) {
                    continue;
                }
                cover.add(b, 0, u32::MAX);
                for e in fd.blocks().get(b).in_edges() {
                    work.push(e.block);
                }
            }
        }
    }
    cover
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_fusion() {
        let mut c = Cover::default();
        c.add(BlockId(0), 0, 3);
        c.add(BlockId(0), 3, 5);
        c.add(BlockId(0), 7, 9);
        assert_eq!(c.blocks.get(&BlockId(0)).unwrap(), &vec![(0, 5), (7, 9)]);
    }

    #[test]
    fn three_valued_intersection() {
        let mut a = Cover::default();
        a.add(BlockId(0), 0, 4);
        let mut b = Cover::default();
        b.add(BlockId(0), 4, 8);
        let (verdict, touches) = a.intersect(&b);
        assert_eq!(verdict, CoverIntersect::Boundary);
        assert_eq!(touches, vec![(BlockId(0), 4)]);

        let mut c = Cover::default();
        c.add(BlockId(0), 3, 6);
        assert_eq!(a.intersect(&c).0, CoverIntersect::Proper);

        let mut d = Cover::default();
        d.add(BlockId(1), 0, 4);
        assert_eq!(a.intersect(&d).0, CoverIntersect::None);
    }
}
