//! Registry of storage ranges that may be viewed as parallel independent lanes.
//!
//! Each record pairs a storage range with a bitmask of admissible lane widths in bytes. The
//! rewrite pipeline consults the registry before deciding whether to split a wide value cell into
//! lanes ahead of further analysis.

use crate::address::Address;
use crate::rangemap::{RangeMap, RecordId};

/// Admissible lane widths for one storage range, as a bitmask where bit `n` set means a lane
/// width of `n` bytes is allowed. Only widths 1, 2, 4, 8, and 16 are representable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LaneDescription {
    mask: u32,
}

impl LaneDescription {
    pub const ALLOWED_WIDTHS: [u32; 5] = [1, 2, 4, 8, 16];

    pub fn new(widths: &[u32]) -> Self {
        let mut mask = 0u32;
        for &w in widths {
            assert!(
                Self::ALLOWED_WIDTHS.contains(&w),
                "inadmissible lane width {}",
                w
            );
            mask |= 1 << w;
        }
        Self { mask }
    }

    pub fn allows(&self, width: u32) -> bool {
        width < 32 && self.mask & (1 << width) != 0
    }

    /// Admissible widths in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        Self::ALLOWED_WIDTHS
            .iter()
            .copied()
            .filter(|&w| self.allows(w))
    }
}

/// The per-architecture laned-register table.
#[derive(Default)]
pub struct LanedRegisterTable {
    map: RangeMap<Address, LaneDescription>,
}

impl LanedRegisterTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage range `[addr, addr+size)` as laned.
    pub fn add_laned_register(
        &mut self,
        addr: Address,
        size: u32,
        desc: LaneDescription,
    ) -> RecordId {
        assert!(size > 0);
        self.map.insert(desc, addr, addr.add(size as u64 - 1), 0)
    }

    /// The lane description covering the given storage, if the whole of it lies inside one
    /// registered range.
    pub fn get_lane_description(&self, addr: Address, size: u32) -> Option<LaneDescription> {
        let (id, desc) = self.map.find(addr).next()?;
        let (first, last) = self.map.bounds(id);
        let end = addr.add(size as u64 - 1);
        (end >= first && end <= last).then_some(*desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{SpaceKind, SpaceManager};

    #[test]
    fn widths_iterate_ascending_and_partial_overlap_misses() {
        let mut mgr = SpaceManager::new();
        let reg = mgr.add_space("register", SpaceKind::Register, 8, 0);
        let mut table = LanedRegisterTable::new();
        table.add_laned_register(
            Address::new(reg, 0x100),
            16,
            LaneDescription::new(&[4, 1, 8]),
        );
        let d = table
            .get_lane_description(Address::new(reg, 0x104), 8)
            .unwrap();
        assert_eq!(d.iter().collect::<Vec<_>>(), vec![1, 4, 8]);
        // Runs past the end of the registered range
        assert!(table
            .get_lane_description(Address::new(reg, 0x10c), 8)
            .is_none());
    }
}
