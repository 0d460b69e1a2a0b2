//! Byte-addressed positions within named address spaces, and inclusive ranges over them.
//!
//! Every value cell and operation in the engine is anchored at an [`Address`]: a pair of an
//! address-space handle and a byte offset. Spaces are totally ordered by their registration index,
//! and addresses are ordered lexicographically by (space, offset), which gives the whole engine a
//! single linear key for its ordered indexes.

use crate::containers::unordered::UnorderedMap;

/// Byte order of multi-byte values in memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endian {
    Big,
    Little,
}

/// What kind of storage an address space models.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpaceKind {
    /// Executable instructions
    Code,
    /// General RAM
    Ram,
    /// Processor registers
    Register,
    /// The in-function stack frame
    Stack,
    /// The constant pool: an address in this space *is* the constant value
    Constant,
    /// Scratch temporaries created during p-code generation and rewriting
    Unique,
    /// References to operations (used by indirect-effect inputs)
    Iop,
    /// References to call specifications
    Fspec,
}

/// Handle to a registered [`AddrSpace`]. Orders by registration index.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub(crate) usize);

impl std::fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "sp{}", self.0)
    }
}

/// The constant-pool space. Always registered first so constants sort before storage.
pub const CONST_SPACE: SpaceId = SpaceId(0);
/// The scratch-temporary space.
pub const UNIQUE_SPACE: SpaceId = SpaceId(1);
/// The operation-reference space.
pub const IOP_SPACE: SpaceId = SpaceId(2);
/// The call-spec-reference space.
pub const FSPEC_SPACE: SpaceId = SpaceId(3);

/// Description of a specific address space.
#[derive(Debug, Clone)]
pub struct AddrSpace {
    /// A name for the address space.
    pub name: String,
    /// What the space models.
    pub kind: SpaceKind,
    /// Size in bytes of a pointer into this space.
    pub wordsize: u32,
    /// Registration index; doubles as heritage ordering.
    pub index: SpaceId,
    /// Number of heritage passes reads from this space are delayed relative to the first pass.
    pub delay: usize,
}

/// Owns the ordered list of address spaces for one architecture.
///
/// The four internal spaces (constant, unique, iop, fspec) are seeded at fixed indexes; processor
/// spaces are registered after them. Heritage walks spaces in registration order.
pub struct SpaceManager {
    spaces: Vec<AddrSpace>,
    by_name: UnorderedMap<String, SpaceId>,
}

impl SpaceManager {
    /// A manager holding only the four internal spaces.
    pub fn new() -> Self {
        let mut mgr = Self {
            spaces: Vec::new(),
            by_name: Default::default(),
        };
        mgr.add_space("const", SpaceKind::Constant, 8, 0);
        mgr.add_space("unique", SpaceKind::Unique, 8, 0);
        mgr.add_space("iop", SpaceKind::Iop, 8, 0);
        mgr.add_space("fspec", SpaceKind::Fspec, 8, 0);
        mgr
    }

    /// Register a new space. Names must be unique.
    pub fn add_space(
        &mut self,
        name: impl Into<String>,
        kind: SpaceKind,
        wordsize: u32,
        delay: usize,
    ) -> SpaceId {
        let name = name.into();
        assert!(
            !self.by_name.contains_key(&name),
            "Address space {:?} registered twice",
            name
        );
        let index = SpaceId(self.spaces.len());
        self.by_name.insert(name.clone(), index);
        self.spaces.push(AddrSpace {
            name,
            kind,
            wordsize,
            index,
            delay,
        });
        index
    }

    /// Get the space registered under `id`.
    pub fn get(&self, id: SpaceId) -> &AddrSpace {
        &self.spaces[id.0]
    }

    /// Look a space up by name.
    pub fn by_name(&self, name: &str) -> Option<SpaceId> {
        self.by_name.get(name).copied()
    }

    /// The first registered space of the given kind, if any.
    pub fn first_of_kind(&self, kind: SpaceKind) -> Option<SpaceId> {
        self.spaces.iter().find(|s| s.kind == kind).map(|s| s.index)
    }

    /// Number of registered spaces.
    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    /// Whether only the internal spaces exist.
    pub fn is_empty(&self) -> bool {
        self.spaces.len() <= 4
    }

    /// Iterate spaces in registration (= heritage) order.
    pub fn iter(&self) -> impl Iterator<Item = &AddrSpace> {
        self.spaces.iter()
    }
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A byte position within an address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    pub space: SpaceId,
    pub offset: u64,
}

impl Address {
    pub fn new(space: SpaceId, offset: u64) -> Self {
        Self { space, offset }
    }

    /// An address in the constant pool; the offset is the constant's value.
    pub fn constant(value: u64) -> Self {
        Self {
            space: CONST_SPACE,
            offset: value,
        }
    }

    pub fn is_constant(&self) -> bool {
        self.space == CONST_SPACE
    }

    /// Whether `self..self+size` and `other..other+other_size` share any byte.
    pub fn overlaps(&self, size: u32, other: &Address, other_size: u32) -> bool {
        if self.space != other.space {
            return false;
        }
        let a0 = self.offset;
        let a1 = a0.saturating_add(size as u64);
        let b0 = other.offset;
        let b1 = b0.saturating_add(other_size as u64);
        a0 < b1 && b0 < a1
    }

    /// Whether `other..other+other_size` lies fully inside `self..self+size`. Returns the byte
    /// offset of `other` within `self` if so.
    pub fn contains(&self, size: u32, other: &Address, other_size: u32) -> Option<u64> {
        if self.space != other.space {
            return None;
        }
        if other.offset >= self.offset
            && other.offset.saturating_add(other_size as u64)
                <= self.offset.saturating_add(size as u64)
        {
            Some(other.offset - self.offset)
        } else {
            None
        }
    }

    /// The address `count` bytes further along, saturating at the end of the space.
    pub fn add(&self, count: u64) -> Address {
        Address {
            space: self.space,
            offset: self.offset.saturating_add(count),
        }
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.space == CONST_SPACE {
            write!(f, "#{:#x}", self.offset)
        } else {
            write!(f, "{:?}:{:#x}", self.space, self.offset)
        }
    }
}

/// `(address, order)` pair identifying one operation among the several that may be generated at a
/// single code address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum {
    pub addr: Address,
    /// Creation-unique disambiguator; never reused within one function.
    pub uniq: u32,
}

impl SeqNum {
    pub fn new(addr: Address, uniq: u32) -> Self {
        Self { addr, uniq }
    }
}

impl std::fmt::Debug for SeqNum {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}/{}", self.addr, self.uniq)
    }
}

/// An inclusive range of addresses within a single space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddrRange {
    pub first: Address,
    pub last: Address,
}

impl AddrRange {
    /// Build a range; `first` and `last` must share a space and be ordered.
    pub fn new(first: Address, last: Address) -> Self {
        assert_eq!(first.space, last.space);
        assert!(first.offset <= last.offset);
        Self { first, last }
    }

    pub fn contains_point(&self, addr: &Address) -> bool {
        addr.space == self.first.space
            && addr.offset >= self.first.offset
            && addr.offset <= self.last.offset
    }

    pub fn intersects(&self, other: &AddrRange) -> bool {
        self.first.space == other.first.space
            && self.first.offset <= other.last.offset
            && other.first.offset <= self.last.offset
    }

    /// Number of bytes covered. Saturates for ranges spanning the whole offset domain.
    pub fn len(&self) -> u64 {
        (self.last.offset - self.first.offset).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false // inclusive ranges always cover at least one byte
    }
}

impl std::fmt::Debug for AddrRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[{:?}..{:?}]", self.first, self.last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_ordering_is_space_then_offset() {
        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0);
        let a = Address::new(ram, 0x100);
        let b = Address::new(ram, 0x200);
        let c = Address::constant(0xffff_ffff);
        assert!(a < b);
        assert!(c < a); // constants sort first
    }

    #[test]
    fn overlap_and_containment() {
        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0);
        let base = Address::new(ram, 0x1000);
        assert!(base.overlaps(8, &Address::new(ram, 0x1004), 4));
        assert!(!base.overlaps(4, &Address::new(ram, 0x1004), 4));
        assert_eq!(base.contains(8, &Address::new(ram, 0x1006), 2), Some(6));
        assert_eq!(base.contains(8, &Address::new(ram, 0x1006), 4), None);
    }
}
