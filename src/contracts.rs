//! Contracts with the engine's external collaborators: the disassembler (p-code emission), the
//! loader (bytes), and the pretty-printer (token emission). The type database contract is
//! implemented by [`TypeStore`](crate::typeprop::TypeStore) directly.
//!
//! The [`Architecture`] handle aggregates the process-wide collaborators. Its lifecycle is "init
//! before any function analysis; teardown after all functions processed"; every function
//! container holds the handle explicitly, so there are no mutable singletons.

use crate::address::{Address, Endian, SeqNum, SpaceManager};
use crate::error::DataUnavailable;
use crate::lanes::LanedRegisterTable;
use crate::opcode::OpCode;
use crate::pattern::Pattern;
use crate::typeprop::TypeStore;
use std::cell::RefCell;

/// Plain storage descriptor used across the emission boundary, before cells exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarnodeData {
    pub addr: Address,
    pub size: u32,
}

/// The p-code emission contract. The disassembler invokes `dump` once per generated op, in
/// instruction order; the engine-side implementation allocates cells for storage it has not seen
/// and builds basic blocks from the block-start markers.
pub trait PcodeEmit {
    /// `start_of_block` is set on the first op of each basic block the disassembler detected.
    fn dump(
        &mut self,
        seq: SeqNum,
        opcode: OpCode,
        output: Option<VarnodeData>,
        inputs: &[VarnodeData],
        start_of_block: bool,
    );
}

/// The loader contract: fill a buffer with the bytes at an address.
pub trait LoadImage {
    fn load_fill(&self, buf: &mut [u8], addr: Address) -> Result<(), DataUnavailable>;
}

/// A loader over a flat byte image, sufficient for tests and for images already in memory.
pub struct MemoryImage {
    pub base: Address,
    pub bytes: Vec<u8>,
}

impl LoadImage for MemoryImage {
    fn load_fill(&self, buf: &mut [u8], addr: Address) -> Result<(), DataUnavailable> {
        let miss = || DataUnavailable {
            addr,
            size: buf.len() as u32,
        };
        if addr.space != self.base.space || addr.offset < self.base.offset {
            return Err(miss());
        }
        let start = (addr.offset - self.base.offset) as usize;
        let end = start.checked_add(buf.len()).ok_or_else(miss)?;
        if end > self.bytes.len() {
            return Err(miss());
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// A loader with no image at all; every read misses.
pub struct EmptyImage;

impl LoadImage for EmptyImage {
    fn load_fill(&self, buf: &mut [u8], addr: Address) -> Result<(), DataUnavailable> {
        Err(DataUnavailable {
            addr,
            size: buf.len() as u32,
        })
    }
}

/// The pretty-printer contract: a visitor over the final IR. Expressions are pushed in reverse
/// order of evaluation to drive a shunting-yard token emission; the default callbacks make every
/// hook optional.
pub trait PrintEmitter {
    /// Called once per op, keyed by opcode, as the structured tree is walked.
    fn emit_op(&mut self, opcode: OpCode, seq: SeqNum) {
        let _ = (opcode, seq);
    }
    /// Push a leaf token (a variable or constant).
    fn push_atom(&mut self, text: &str) {
        let _ = text;
    }
    /// Push an operator awaiting its operands.
    fn push_op(&mut self, name: &str) {
        let _ = name;
    }
    /// A lexical scope opens (block, loop body, branch arm).
    fn push_scope(&mut self) {}
    /// The innermost lexical scope closes.
    fn pop_scope(&mut self) {}
}

/// The process-wide architecture handle.
pub struct Architecture {
    pub spaces: SpaceManager,
    pub endian: Endian,
    pub types: RefCell<TypeStore>,
    pub lanes: LanedRegisterTable,
    pub loader: Box<dyn LoadImage>,
    /// Instruction-byte patterns recognizing compiler jump-assist forms around indirect
    /// branches.
    pub jump_assist: Vec<Pattern>,
    /// Storage ranges backed by read-only memory. Interior-mutable because a failed fold clears
    /// the attribute from behind a shared handle.
    readonly: RefCell<Vec<(Address, u32)>>,
}

impl Architecture {
    pub fn new(spaces: SpaceManager, endian: Endian, loader: Box<dyn LoadImage>) -> Self {
        Self {
            spaces,
            endian,
            types: RefCell::new(TypeStore::new()),
            lanes: LanedRegisterTable::new(),
            loader,
            jump_assist: Vec::new(),
            readonly: RefCell::new(Vec::new()),
        }
    }

    /// Declare `[addr, addr+size)` as read-only data.
    pub fn mark_readonly(&self, addr: Address, size: u32) {
        self.readonly.borrow_mut().push((addr, size));
    }

    /// Whether the whole of `[addr, addr+size)` lies in read-only memory.
    pub fn is_readonly(&self, addr: Address, size: u32) -> bool {
        self.readonly
            .borrow()
            .iter()
            .any(|(a, s)| a.contains(*s, &addr, size).is_some())
    }

    /// Drop any read-only claim covering the range (the loader failed to back it).
    pub fn clear_readonly(&self, addr: Address, size: u32) {
        self.readonly
            .borrow_mut()
            .retain(|(a, s)| !a.overlaps(*s, &addr, size));
    }
}

/// Walk a function's structured tree, feeding the pretty-printer contract. Each composite opens
/// a scope; within a block the ops run in order, each pushed as its operator followed by its
/// operands in reverse order of evaluation (shunting-yard ready).
pub fn emit_function(fd: &mut crate::funcdata::Funcdata, emitter: &mut dyn PrintEmitter) {
    use crate::blockgraph::StructBlock;

    fn walk(
        fd: &crate::funcdata::Funcdata,
        node: &StructBlock,
        emitter: &mut dyn PrintEmitter,
    ) {
        match node {
            StructBlock::Basic(b) => {
                for &op in fd.blocks().get(*b).ops() {
                    let o = fd.ops().get(op);
                    if o.flags.contains(crate::op::OpFlags::NONPRINTING) {
                        continue;
                    }
                    emitter.emit_op(o.opcode, o.seq);
                    emitter.push_op(o.opcode.name());
                    for slot in (0..o.num_inputs()).rev() {
                        if let Some(vn) = o.input(slot) {
                            let v = fd.vars().get(vn);
                            let text = match v.constant_value() {
                                Some(c) => format!("{:#x}", c),
                                None => format!("{:?}:{}", v.addr, v.size),
                            };
                            emitter.push_atom(&text);
                        }
                    }
                }
            }
            StructBlock::Sequence(parts) => {
                for p in parts {
                    walk(fd, p, emitter);
                }
            }
            StructBlock::IfThen { cond, then_body } => {
                walk(fd, cond, emitter);
                emitter.push_scope();
                walk(fd, then_body, emitter);
                emitter.pop_scope();
            }
            StructBlock::IfElse {
                cond,
                then_body,
                else_body,
            } => {
                walk(fd, cond, emitter);
                emitter.push_scope();
                walk(fd, then_body, emitter);
                emitter.pop_scope();
                emitter.push_scope();
                walk(fd, else_body, emitter);
                emitter.pop_scope();
            }
            StructBlock::While { cond, body } => {
                walk(fd, cond, emitter);
                emitter.push_scope();
                walk(fd, body, emitter);
                emitter.pop_scope();
            }
            StructBlock::DoWhile { body } | StructBlock::InfiniteLoop { body } => {
                emitter.push_scope();
                walk(fd, body, emitter);
                emitter.pop_scope();
            }
            StructBlock::Switch { cond, cases } => {
                walk(fd, cond, emitter);
                for case in cases {
                    emitter.push_scope();
                    walk(fd, case, emitter);
                    emitter.pop_scope();
                }
            }
            StructBlock::Goto { body, .. } => {
                walk(fd, body, emitter);
            }
        }
    }

    let tree = fd.blocks_mut().structure().clone();
    walk(fd, &tree, emitter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{SpaceKind, SpaceManager};

    #[test]
    fn memory_image_bounds() {
        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0);
        let img = MemoryImage {
            base: Address::new(ram, 0x1000),
            bytes: vec![1, 2, 3, 4],
        };
        let mut buf = [0u8; 2];
        img.load_fill(&mut buf, Address::new(ram, 0x1001)).unwrap();
        assert_eq!(buf, [2, 3]);
        assert!(img.load_fill(&mut buf, Address::new(ram, 0x1003)).is_err());
        assert!(img.load_fill(&mut buf, Address::new(ram, 0xfff)).is_err());
    }

    #[test]
    fn readonly_ranges_clear_on_failure() {
        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0);
        let arch = Architecture::new(mgr, Endian::Little, Box::new(EmptyImage));
        let a = Address::new(ram, 0x2000);
        arch.mark_readonly(a, 16);
        assert!(arch.is_readonly(Address::new(ram, 0x2004), 4));
        arch.clear_readonly(Address::new(ram, 0x2004), 4);
        assert!(!arch.is_readonly(Address::new(ram, 0x2004), 4));
    }
}
