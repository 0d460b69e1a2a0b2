//! A container mapping possibly-overlapping ranges of an ordered linear domain to records,
//! refined internally into disjoint sub-ranges.
//!
//! Each record occupies an inclusive interval `[first, last]` and carries a sub-sort key that
//! breaks ties among overlapping records sharing a boundary. Internally the container keeps the
//! common refinement of all record intervals: disjoint *pieces*, each knowing exactly which
//! records cover it. Inserting a record splits the pieces its endpoints land in (*unzip*); erasing
//! a record fuses adjacent pieces back together when no surviving record requires the boundary
//! (*zip*).
//!
//! Used for symbol range maps, the laned-register registry, and heritage range bookkeeping.

use std::collections::BTreeMap;

/// An ordered linear domain the map can refine. Implemented for the integer domains and for
/// [`Address`](crate::address::Address) offsets.
pub trait LinearDomain: Copy + Ord + std::fmt::Debug {
    /// The point immediately after `self`, or `None` at the top of the domain.
    fn succ(self) -> Option<Self>;
    /// The point immediately before `self`, or `None` at the bottom of the domain.
    fn pred(self) -> Option<Self>;
}

impl LinearDomain for u64 {
    fn succ(self) -> Option<Self> {
        self.checked_add(1)
    }
    fn pred(self) -> Option<Self> {
        self.checked_sub(1)
    }
}

impl LinearDomain for crate::address::Address {
    fn succ(self) -> Option<Self> {
        Some(Self {
            space: self.space,
            offset: self.offset.checked_add(1)?,
        })
    }
    fn pred(self) -> Option<Self> {
        Some(Self {
            space: self.space,
            offset: self.offset.checked_sub(1)?,
        })
    }
}

/// Handle to a record stored in a [`RangeMap`]. Stable for the record's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(usize);

impl std::fmt::Debug for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "rec{}", self.0)
    }
}

struct Record<D, V> {
    value: V,
    first: D,
    last: D,
    subsort: u32,
}

/// One disjoint piece of the refinement: the records covering `[start, end]`, ordered by
/// (subsort, record id).
#[derive(Debug)]
struct Piece<D> {
    end: D,
    records: Vec<RecordId>,
}

/// The sub-range interval map. See the module docs for semantics.
pub struct RangeMap<D: LinearDomain, V> {
    records: Vec<Option<Record<D, V>>>,
    pieces: BTreeMap<D, Piece<D>>,
}

impl<D: LinearDomain, V> Default for RangeMap<D, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: LinearDomain, V> RangeMap<D, V> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            pieces: BTreeMap::new(),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.records.iter().all(|r| r.is_none())
    }

    /// Access the value of a live record.
    pub fn value(&self, id: RecordId) -> &V {
        &self.records[id.0].as_ref().expect("record was erased").value
    }

    /// Mutable access to the value of a live record.
    pub fn value_mut(&mut self, id: RecordId) -> &mut V {
        &mut self.records[id.0].as_mut().expect("record was erased").value
    }

    /// The inclusive interval a live record occupies.
    pub fn bounds(&self, id: RecordId) -> (D, D) {
        let r = self.records[id.0].as_ref().expect("record was erased");
        (r.first, r.last)
    }

    /// Split the piece containing `point` so that a piece boundary starts exactly at `point`.
    /// No-op if `point` is already a piece start or lies in no piece.
    fn unzip(&mut self, point: D) {
        let Some((&start, piece)) = self.pieces.range(..=point).next_back() else {
            return;
        };
        if start == point || piece.end < point {
            return;
        }
        let records = piece.records.clone();
        let old_end = piece.end;
        let before_end = point.pred().expect("point > start implies a predecessor");
        self.pieces.get_mut(&start).unwrap().end = before_end;
        self.pieces.insert(
            point,
            Piece {
                end: old_end,
                records,
            },
        );
    }

    /// Fuse the piece starting at `boundary` into its predecessor if they are contiguous and
    /// covered by the same record set.
    fn zip(&mut self, boundary: D) {
        let Some(prev_start) = self
            .pieces
            .range(..boundary)
            .next_back()
            .map(|(&s, _)| s)
        else {
            return;
        };
        let (Some(prev_end), Some(next)) = (
            self.pieces.get(&prev_start).map(|p| p.end),
            self.pieces.get(&boundary),
        ) else {
            return;
        };
        if prev_end.succ() != Some(boundary) {
            return;
        }
        if self.pieces[&prev_start].records != next.records {
            return;
        }
        let next_end = next.end;
        self.pieces.remove(&boundary);
        self.pieces.get_mut(&prev_start).unwrap().end = next_end;
    }

    /// Insert a record covering the inclusive interval `[first, last]`. Existing pieces touching
    /// the endpoints are split; gaps inside the interval become fresh pieces covered only by the
    /// new record. Complexity is proportional to the number of intersected pieces.
    pub fn insert(&mut self, value: V, first: D, last: D, subsort: u32) -> RecordId {
        assert!(first <= last, "inverted range {:?}..{:?}", first, last);
        let id = RecordId(self.records.len());
        self.records.push(Some(Record {
            value,
            first,
            last,
            subsort,
        }));

        self.unzip(first);
        if let Some(after) = last.succ() {
            self.unzip(after);
        }

        // Walk the pieces intersecting [first, last], adding the record and collecting gaps.
        let mut gaps: Vec<(D, D)> = Vec::new();
        let mut cursor = first;
        let mut done = false;
        let starts: Vec<D> = self
            .pieces
            .range(first..=last)
            .map(|(&s, _)| s)
            .collect();
        for s in starts {
            if s > cursor {
                gaps.push((cursor, s.pred().unwrap()));
            }
            let piece = self.pieces.get_mut(&s).unwrap();
            let subsort_of = |records: &Vec<Option<Record<D, V>>>, rid: &RecordId| {
                records[rid.0].as_ref().map(|r| (r.subsort, rid.0))
            };
            let key = (subsort, id.0);
            let pos = piece
                .records
                .iter()
                .position(|r| subsort_of(&self.records, r) > Some(key))
                .unwrap_or(piece.records.len());
            piece.records.insert(pos, id);
            match piece.end.succ() {
                Some(next) => cursor = next,
                None => done = true,
            }
            if done {
                break;
            }
        }
        if !done && cursor <= last {
            gaps.push((cursor, last));
        }
        for (a, b) in gaps {
            self.pieces.insert(
                a,
                Piece {
                    end: b,
                    records: vec![id],
                },
            );
        }
        id
    }

    /// Erase a record, deleting the sub-ranges belonging only to it and fusing adjacent pieces
    /// whose covering sets become identical. Returns the record's value.
    pub fn erase(&mut self, id: RecordId) -> V {
        let record = self.records[id.0].take().expect("record erased twice");
        let (first, last) = (record.first, record.last);

        let starts: Vec<D> = self
            .pieces
            .range(first..=last)
            .map(|(&s, _)| s)
            .collect();
        for s in &starts {
            let piece = self.pieces.get_mut(s).unwrap();
            piece.records.retain(|r| *r != id);
            if piece.records.is_empty() {
                self.pieces.remove(s);
            }
        }
        // Try fusing at every boundary the record may have forced, including its own endpoints.
        for s in starts {
            self.zip(s);
        }
        if let Some(after) = last.succ() {
            self.zip(after);
        }
        record.value
    }

    /// All records covering `point`, in (subsort, insertion) order.
    pub fn find(&self, point: D) -> impl Iterator<Item = (RecordId, &V)> {
        let hit = self
            .pieces
            .range(..=point)
            .next_back()
            .filter(|(_, p)| p.end >= point)
            .map(|(_, p)| p.records.as_slice())
            .unwrap_or(&[]);
        hit.iter().map(move |&id| (id, self.value(id)))
    }

    /// The first record (if any) whose interval intersects `[a, b]`.
    pub fn find_overlap(&self, a: D, b: D) -> Option<RecordId> {
        // A piece covering `a` wins; otherwise the first piece starting inside the window.
        if let Some((_, piece)) = self
            .pieces
            .range(..=a)
            .next_back()
            .filter(|(_, p)| p.end >= a)
        {
            return piece.records.first().copied();
        }
        self.pieces
            .range(a..=b)
            .next()
            .and_then(|(_, p)| p.records.first().copied())
    }

    /// Iterate all live records.
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &V)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|r| (RecordId(i), &r.value)))
    }

    /// The refinement itself: disjoint `(start, end, covering records)` pieces in order. Exposed
    /// for the containers' own tests and for debugging.
    pub fn pieces(&self) -> impl Iterator<Item = (D, D, &[RecordId])> {
        self.pieces
            .iter()
            .map(|(&s, p)| (s, p.end, p.records.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape<V>(map: &RangeMap<u64, V>) -> Vec<(u64, u64, usize)> {
        map.pieces().map(|(a, b, r)| (a, b, r.len())).collect()
    }

    #[test]
    fn insert_refines_and_erase_zips() {
        let mut map: RangeMap<u64, &str> = RangeMap::new();
        let r1 = map.insert("R1", 0, 99, 0);
        let _r2 = map.insert("R2", 50, 149, 1);
        assert_eq!(shape(&map), vec![(0, 49, 1), (50, 99, 2), (100, 149, 1)]);

        map.erase(r1);
        // [50,99] and [100,149] fuse: no record splits the 99/100 boundary anymore.
        assert_eq!(shape(&map), vec![(50, 149, 1)]);
    }

    #[test]
    fn insert_then_erase_is_identity() {
        let mut map: RangeMap<u64, u32> = RangeMap::new();
        map.insert(7, 10, 20, 0);
        let before = shape(&map);
        let id = map.insert(8, 15, 30, 0);
        assert_eq!(map.erase(id), 8);
        assert_eq!(shape(&map), before);
    }

    #[test]
    fn find_honors_subsort_order() {
        let mut map: RangeMap<u64, &str> = RangeMap::new();
        map.insert("late", 0, 10, 5);
        map.insert("early", 5, 15, 1);
        let hits: Vec<&str> = map.find(7).map(|(_, v)| *v).collect();
        assert_eq!(hits, vec!["early", "late"]);
        assert_eq!(map.find(20).count(), 0);
    }

    #[test]
    fn find_overlap_prefers_leftmost() {
        let mut map: RangeMap<u64, &str> = RangeMap::new();
        let a = map.insert("a", 0, 4, 0);
        let b = map.insert("b", 10, 14, 0);
        assert_eq!(map.find_overlap(2, 12), Some(a));
        assert_eq!(map.find_overlap(6, 12), Some(b));
        assert_eq!(map.find_overlap(5, 9), None);
    }

    #[test]
    fn gap_filling_creates_single_piece() {
        let mut map: RangeMap<u64, &str> = RangeMap::new();
        map.insert("island", 100, 110, 0);
        map.insert("wide", 0, 200, 0);
        assert_eq!(
            shape(&map),
            vec![(0, 99, 1), (100, 110, 2), (111, 200, 1)]
        );
    }
}
