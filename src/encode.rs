//! Persisted state: an opaque encoder/decoder pair and the function-structure round trip.
//!
//! The element tags and attribute names are part of the external compatibility surface and are
//! carried verbatim: `function`, `localdb`, `prototype`, `jumptablelist`, `jumptable`, `ast`,
//! `varnodes`, `block`, `blockedge`, `highlist`, `type`, `typeref`, `def`, `symbol_table`,
//! `scope`, plus per-kind symbol headers. Free-form attribute ordering is not preserved across a
//! round trip, but everything re-parses and the structure (ids, op-codes, edges, cell storage)
//! is identity.
//!
//! A decode failure aborts and discards the partial state: `decode_function` either returns a
//! complete function or an error, never a half-built one.

use crate::address::{Address, SeqNum, UNIQUE_SPACE};
use crate::blockgraph::{BlockEdge, BlockId, EdgeFlags};
use crate::containers::unordered::UnorderedMap;
use crate::contracts::Architecture;
use crate::error::ParseError;
use crate::funcdata::Funcdata;
use crate::jumptable::JumpTable;
use crate::op::OpId;
use crate::opcode::OpCode;
use crate::varnode::{VarFlags, VarnodeId};
use std::rc::Rc;

/// The sink half of the stream codec.
pub trait Encoder {
    fn open_element(&mut self, tag: &str);
    fn attribute(&mut self, name: &str, value: &str);
    fn close_element(&mut self, tag: &str);

    fn attr_u64(&mut self, name: &str, value: u64) {
        self.attribute(name, &format!("{:#x}", value));
    }
    fn attr_usize(&mut self, name: &str, value: usize) {
        self.attribute(name, &value.to_string());
    }
    fn attr_bool(&mut self, name: &str, value: bool) {
        self.attribute(name, if value { "true" } else { "false" });
    }
}

/// The source half of the stream codec.
pub trait Decoder {
    /// Enter the next child element, which must carry the expected tag.
    fn open_element(&mut self, expect: &str) -> Result<(), ParseError>;
    /// The tag of the next child element, if one follows at the current level.
    fn peek_element(&mut self) -> Option<String>;
    /// An attribute of the most recently opened element.
    fn attribute(&self, name: &str) -> Option<&str>;
    /// Leave the current element.
    fn close_element(&mut self, expect: &str) -> Result<(), ParseError>;

    fn need_attribute(&self, name: &str, element: &str) -> Result<&str, ParseError> {
        self.attribute(name).ok_or_else(|| ParseError::MissingAttribute {
            name: name.to_string(),
            element: element.to_string(),
        })
    }

    fn attr_u64(&self, name: &str, element: &str) -> Result<u64, ParseError> {
        let raw = self.need_attribute(name, element)?;
        parse_u64(raw).ok_or_else(|| ParseError::BadAttribute {
            name: name.to_string(),
            value: raw.to_string(),
        })
    }

    fn attr_usize(&self, name: &str, element: &str) -> Result<usize, ParseError> {
        Ok(self.attr_u64(name, element)? as usize)
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&amp;", "&")
}

/// Writes the XML-like text form.
#[derive(Default)]
pub struct TextEncoder {
    out: String,
    stack: Vec<String>,
    open_pending: bool,
}

impl TextEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(mut self) -> String {
        assert!(self.stack.is_empty(), "unclosed elements: {:?}", self.stack);
        if self.open_pending {
            self.out.push_str("/>");
        }
        self.out
    }
}

impl Encoder for TextEncoder {
    fn open_element(&mut self, tag: &str) {
        if self.open_pending {
            self.out.push('>');
        }
        self.out.push('<');
        self.out.push_str(tag);
        self.stack.push(tag.to_string());
        self.open_pending = true;
    }

    fn attribute(&mut self, name: &str, value: &str) {
        assert!(self.open_pending, "attribute outside an element header");
        self.out
            .push_str(&format!(" {}=\"{}\"", name, escape(value)));
    }

    fn close_element(&mut self, tag: &str) {
        let top = self.stack.pop().expect("close without open");
        assert_eq!(top, tag, "mismatched close");
        if self.open_pending {
            self.out.push_str("/>");
            self.open_pending = false;
        } else {
            self.out.push_str(&format!("</{}>", tag));
        }
    }
}

/// Reads the XML-like text form.
pub struct TextDecoder<'a> {
    src: &'a str,
    pos: usize,
    /// Open elements, with a flag for self-closed ones (no close token in the stream).
    stack: Vec<(String, bool)>,
    attrs: Vec<(String, String)>,
}

impl<'a> TextDecoder<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            stack: Vec::new(),
            attrs: Vec::new(),
        }
    }

    fn skip_ws(&mut self) {
        while self.src[self.pos..].starts_with(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn read_name(&mut self) -> String {
        let start = self.pos;
        while self.rest().starts_with(|c: char| {
            c.is_ascii_alphanumeric() || c == '_' || c == '-'
        }) {
            self.pos += 1;
        }
        self.src[start..self.pos].to_string()
    }
}

impl<'a> Decoder for TextDecoder<'a> {
    fn open_element(&mut self, expect: &str) -> Result<(), ParseError> {
        self.skip_ws();
        if !self.rest().starts_with('<') || self.rest().starts_with("</") {
            return Err(ParseError::Truncated {
                element: expect.to_string(),
            });
        }
        self.pos += 1;
        let name = self.read_name();
        if name != expect {
            return Err(ParseError::UnexpectedElement {
                expected: expect.to_string(),
                found: name,
            });
        }
        self.attrs.clear();
        loop {
            self.skip_ws();
            if self.rest().starts_with("/>") {
                self.pos += 2;
                self.stack.push((name, true));
                return Ok(());
            }
            if self.rest().starts_with('>') {
                self.pos += 1;
                self.stack.push((name, false));
                return Ok(());
            }
            let attr = self.read_name();
            if attr.is_empty() {
                return Err(ParseError::Truncated { element: name });
            }
            self.skip_ws();
            if !self.rest().starts_with('=') {
                return Err(ParseError::BadAttribute {
                    name: attr,
                    value: String::new(),
                });
            }
            self.pos += 1;
            self.skip_ws();
            if !self.rest().starts_with('"') {
                return Err(ParseError::BadAttribute {
                    name: attr,
                    value: String::new(),
                });
            }
            self.pos += 1;
            let vstart = self.pos;
            while !self.rest().starts_with('"') {
                if self.rest().is_empty() {
                    return Err(ParseError::Truncated { element: name });
                }
                self.pos += 1;
            }
            let value = unescape(&self.src[vstart..self.pos]);
            self.pos += 1;
            self.attrs.push((attr, value));
        }
    }

    fn peek_element(&mut self) -> Option<String> {
        // A self-closed element on top of the stack has no children
        if self.stack.last().map_or(false, |(_, closed)| *closed) {
            return None;
        }
        let save = self.pos;
        self.skip_ws();
        if self.rest().starts_with("</") || !self.rest().starts_with('<') {
            self.pos = save;
            return None;
        }
        self.pos += 1;
        let name = self.read_name();
        self.pos = save;
        (!name.is_empty()).then_some(name)
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn close_element(&mut self, expect: &str) -> Result<(), ParseError> {
        let (name, self_closed) = self.stack.pop().ok_or_else(|| ParseError::Truncated {
            element: expect.to_string(),
        })?;
        if name != expect {
            return Err(ParseError::UnexpectedElement {
                expected: expect.to_string(),
                found: name,
            });
        }
        if self_closed {
            return Ok(());
        }
        self.skip_ws();
        if !self.rest().starts_with("</") {
            return Err(ParseError::Truncated { element: name });
        }
        self.pos += 2;
        let found = self.read_name();
        if found != name {
            return Err(ParseError::UnexpectedElement {
                expected: name,
                found,
            });
        }
        self.skip_ws();
        if !self.rest().starts_with('>') {
            return Err(ParseError::Truncated { element: name });
        }
        self.pos += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Function structure
// ---------------------------------------------------------------------------

fn encode_addr(enc: &mut dyn Encoder, tag: &str, arch: &Architecture, addr: Address) {
    enc.open_element(tag);
    enc.attribute("space", &arch.spaces.get(addr.space).name);
    enc.attr_u64("offset", addr.offset);
    enc.close_element(tag);
}

fn decode_addr(
    dec: &mut dyn Decoder,
    tag: &str,
    arch: &Architecture,
) -> Result<Address, ParseError> {
    dec.open_element(tag)?;
    let space_name = dec.need_attribute("space", tag)?.to_string();
    let offset = dec.attr_u64("offset", tag)?;
    dec.close_element(tag)?;
    let space = arch
        .spaces
        .by_name(&space_name)
        .ok_or(ParseError::BadAttribute {
            name: "space".to_string(),
            value: space_name,
        })?;
    Ok(Address::new(space, offset))
}

/// Serialize a function's structure.
pub fn encode_function(fd: &Funcdata, enc: &mut dyn Encoder) {
    let arch = fd.arch();
    enc.open_element("function");
    enc.attribute("name", &fd.name);
    enc.attr_usize("size", 1);
    encode_addr(enc, "addr", arch, fd.entry_addr);

    enc.open_element("localdb");
    enc.attr_usize("scopesize", 1);
    enc.attr_usize("symbolsize", fd.symbols().iter_symbols().count());
    enc.close_element("localdb");

    enc.open_element("prototype");
    enc.attribute("model", &fd.prototype.model);
    for p in &fd.prototype.params {
        enc.open_element("param");
        enc.attribute("space", &arch.spaces.get(p.addr.space).name);
        enc.attr_u64("offset", p.addr.offset);
        enc.attr_u64("size", p.size as u64);
        if let Some(dt) = p.datatype {
            enc.attr_usize("typeref", dt.0);
        }
        enc.close_element("param");
    }
    if let Some(ret) = &fd.prototype.output {
        enc.open_element("returnsym");
        enc.attribute("space", &arch.spaces.get(ret.addr.space).name);
        enc.attr_u64("offset", ret.addr.offset);
        enc.attr_u64("size", ret.size as u64);
        if let Some(dt) = ret.datatype {
            enc.attr_usize("typeref", dt.0);
        }
        enc.close_element("returnsym");
    }
    enc.close_element("prototype");

    enc.open_element("jumptablelist");
    for (i, table) in fd.jump_tables().iter().enumerate() {
        enc.open_element("jumptable");
        enc.attr_usize("label", i);
        enc.attr_usize("op", table.op.0);
        enc.attr_usize("stage", table.stage as usize);
        if let Some(d) = table.default_index {
            enc.attr_usize("default", d);
        }
        for &t in &table.targets {
            encode_addr(enc, "dest", arch, t);
        }
        enc.close_element("jumptable");
    }
    enc.close_element("jumptablelist");

    enc.open_element("ast");
    enc.open_element("varnodes");
    let mut cell_ids: Vec<VarnodeId> = fd.vars().all().collect();
    cell_ids.sort();
    for vn in cell_ids {
        let v = fd.vars().get(vn);
        enc.open_element("def");
        enc.attr_usize("id", vn.0);
        enc.attribute("space", &arch.spaces.get(v.addr.space).name);
        enc.attr_u64("offset", v.addr.offset);
        enc.attr_u64("size", v.size as u64);
        enc.attr_u64("flags", v.flags.bits() as u64);
        enc.close_element("def");
    }
    enc.close_element("varnodes");

    let mut block_ids: Vec<BlockId> = fd.blocks().iter().collect();
    block_ids.sort();
    for &b in &block_ids {
        enc.open_element("block");
        enc.attr_usize("index", b.0);
        if fd.blocks().entry == Some(b) {
            enc.attr_bool("entry", true);
        }
        for &op in fd.blocks().get(b).ops() {
            let o = fd.ops().get(op);
            enc.open_element("op");
            enc.attr_usize("id", op.0);
            enc.attribute("code", o.opcode.name());
            enc.attribute("space", &arch.spaces.get(o.seq.addr.space).name);
            enc.attr_u64("offset", o.seq.addr.offset);
            enc.attr_u64("uniq", o.seq.uniq as u64);
            if let Some(out) = o.output() {
                enc.attr_usize("output", out.0);
            }
            for slot in 0..o.num_inputs() {
                match o.input(slot) {
                    Some(vn) => {
                        enc.open_element("input");
                        enc.attr_usize("id", vn.0);
                        enc.close_element("input");
                    }
                    None => {
                        enc.open_element("void");
                        enc.close_element("void");
                    }
                }
            }
            enc.close_element("op");
        }
        enc.close_element("block");
    }
    for &b in &block_ids {
        for (slot, e) in fd.blocks().get(b).in_edges().iter().enumerate() {
            enc.open_element("blockedge");
            enc.attr_usize("end", b.0);
            enc.attr_usize("start", e.block.0);
            enc.attr_usize("slot", slot);
            if e.flags.contains(EdgeFlags::GOTO) {
                enc.attr_bool("goto", true);
            }
            enc.close_element("blockedge");
        }
    }
    enc.open_element("highlist");
    for high in fd.highs().iter() {
        enc.open_element("high");
        enc.attr_usize("id", high.0);
        for &vn in fd.highs().get(high).members() {
            enc.open_element("member");
            enc.attr_usize("id", vn.0);
            enc.close_element("member");
        }
        enc.close_element("high");
    }
    enc.close_element("highlist");
    enc.close_element("ast");
    enc.close_element("function");
}

/// Rebuild a function from its encoded structure. Arena ids are reproduced exactly, including
/// holes left by destroyed entities.
pub fn decode_function(
    arch: Rc<Architecture>,
    dec: &mut dyn Decoder,
) -> Result<Funcdata, ParseError> {
    dec.open_element("function")?;
    let name = dec.need_attribute("name", "function")?.to_string();
    let _size = dec.attr_usize("size", "function")?;
    let entry = decode_addr(dec, "addr", &arch)?;
    let mut fd = Funcdata::new(name, entry, Rc::clone(&arch));

    dec.open_element("localdb")?;
    dec.close_element("localdb")?;

    dec.open_element("prototype")?;
    let mut prototype = crate::callspec::Prototype::unknown();
    prototype.model = dec.need_attribute("model", "prototype")?.to_string();
    fn decode_proto_slot(
        dec: &mut dyn Decoder,
        arch: &Architecture,
        tag: &str,
    ) -> Result<crate::callspec::ProtoParam, ParseError> {
        let space_name = dec.need_attribute("space", tag)?.to_string();
        let offset = dec.attr_u64("offset", tag)?;
        let size = dec.attr_u64("size", tag)? as u32;
        let datatype = dec
            .attribute("typeref")
            .and_then(parse_u64)
            .map(|v| crate::typeprop::TypeId(v as usize));
        let space = arch
            .spaces
            .by_name(&space_name)
            .ok_or(ParseError::BadAttribute {
                name: "space".to_string(),
                value: space_name,
            })?;
        Ok(crate::callspec::ProtoParam {
            addr: Address::new(space, offset),
            size,
            datatype,
        })
    }
    loop {
        match dec.peek_element().as_deref() {
            Some("param") => {
                dec.open_element("param")?;
                let p = decode_proto_slot(dec, &arch, "param")?;
                dec.close_element("param")?;
                prototype.params.push(p);
            }
            Some("returnsym") => {
                dec.open_element("returnsym")?;
                let p = decode_proto_slot(dec, &arch, "returnsym")?;
                dec.close_element("returnsym")?;
                prototype.output = Some(p);
            }
            _ => break,
        }
    }
    dec.close_element("prototype")?;
    fd.prototype = prototype;

    dec.open_element("jumptablelist")?;
    let mut tables: Vec<JumpTable> = Vec::new();
    while dec.peek_element().as_deref() == Some("jumptable") {
        dec.open_element("jumptable")?;
        let op = OpId(dec.attr_usize("op", "jumptable")?);
        let stage = dec.attr_usize("stage", "jumptable")? as u8;
        let default_index = dec
            .attribute("default")
            .and_then(parse_u64)
            .map(|v| v as usize);
        let mut table = JumpTable::new(op);
        table.stage = stage;
        table.default_index = default_index;
        while dec.peek_element().as_deref() == Some("dest") {
            table.targets.push(decode_addr(dec, "dest", &arch)?);
        }
        dec.close_element("jumptable")?;
        tables.push(table);
    }
    dec.close_element("jumptablelist")?;

    dec.open_element("ast")?;
    dec.open_element("varnodes")?;
    let mut fillers: Vec<VarnodeId> = Vec::new();
    while dec.peek_element().as_deref() == Some("def") {
        dec.open_element("def")?;
        let id = dec.attr_usize("id", "def")?;
        let space_name = dec.need_attribute("space", "def")?.to_string();
        let offset = dec.attr_u64("offset", "def")?;
        let size = dec.attr_u64("size", "def")? as u32;
        let flags_bits = dec.attr_u64("flags", "def")? as u32;
        dec.close_element("def")?;
        let space = arch
            .spaces
            .by_name(&space_name)
            .ok_or(ParseError::BadAttribute {
                name: "space".to_string(),
                value: space_name,
            })?;
        // Reproduce arena holes so ids line up exactly
        while fd.vars().create_count() < id {
            let filler = fd.vars_mut().create(Address::new(UNIQUE_SPACE, u64::MAX), 1);
            fillers.push(filler);
        }
        let vn = fd.new_varnode(Address::new(space, offset), size);
        if vn.0 != id {
            return Err(ParseError::BadAttribute {
                name: "id".to_string(),
                value: id.to_string(),
            });
        }
        let flags = VarFlags::from_bits_truncate(flags_bits);
        let restore = flags & !(VarFlags::INPUT | VarFlags::WRITTEN | VarFlags::CONSTANT);
        fd.vars_mut().get_mut(vn).flags |= restore;
        if flags.contains(VarFlags::INPUT) {
            let _ = fd.vars_mut().set_input(vn);
        }
    }
    for filler in fillers {
        fd.vars_mut().destroy(filler);
    }
    dec.close_element("varnodes")?;

    // Blocks with their op sequences: parse everything first, then build in id order so arena
    // ids reproduce exactly (including holes)
    struct OpDesc {
        id: usize,
        opcode: OpCode,
        seq: SeqNum,
        output: Option<usize>,
        inputs: Vec<Option<VarnodeId>>,
        block: usize,
    }
    let mut block_descs: Vec<(usize, bool, Vec<usize>)> = Vec::new();
    let mut op_descs: Vec<OpDesc> = Vec::new();
    while dec.peek_element().as_deref() == Some("block") {
        dec.open_element("block")?;
        let bindex = dec.attr_usize("index", "block")?;
        let is_entry = dec.attribute("entry") == Some("true");
        let mut op_order: Vec<usize> = Vec::new();
        while dec.peek_element().as_deref() == Some("op") {
            dec.open_element("op")?;
            let id = dec.attr_usize("id", "op")?;
            let code_name = dec.need_attribute("code", "op")?.to_string();
            let opcode = OpCode::from_name(&code_name).ok_or(ParseError::BadAttribute {
                name: "code".to_string(),
                value: code_name,
            })?;
            let space_name = dec.need_attribute("space", "op")?.to_string();
            let offset = dec.attr_u64("offset", "op")?;
            let uniq = dec.attr_u64("uniq", "op")? as u32;
            let output = dec.attribute("output").and_then(parse_u64).map(|v| v as usize);
            let space = arch
                .spaces
                .by_name(&space_name)
                .ok_or(ParseError::BadAttribute {
                    name: "space".to_string(),
                    value: space_name,
                })?;
            let mut inputs: Vec<Option<VarnodeId>> = Vec::new();
            loop {
                match dec.peek_element().as_deref() {
                    Some("input") => {
                        dec.open_element("input")?;
                        let vid = dec.attr_usize("id", "input")?;
                        dec.close_element("input")?;
                        inputs.push(Some(VarnodeId(vid)));
                    }
                    Some("void") => {
                        dec.open_element("void")?;
                        dec.close_element("void")?;
                        inputs.push(None);
                    }
                    _ => break,
                }
            }
            dec.close_element("op")?;
            op_order.push(id);
            op_descs.push(OpDesc {
                id,
                opcode,
                seq: SeqNum::new(Address::new(space, offset), uniq),
                output,
                inputs,
                block: bindex,
            });
        }
        dec.close_element("block")?;
        block_descs.push((bindex, is_entry, op_order));
    }

    // Build blocks in id order, with holes
    let mut entry_block: Option<BlockId> = None;
    let mut block_fillers: Vec<BlockId> = Vec::new();
    let mut sorted_blocks = block_descs.clone();
    sorted_blocks.sort_by_key(|(i, _, _)| *i);
    for (bindex, is_entry, _) in &sorted_blocks {
        while fd.blocks().arena_len() < *bindex {
            block_fillers.push(fd.blocks_mut().new_block());
        }
        let block = fd.blocks_mut().new_block();
        if block.0 != *bindex {
            return Err(ParseError::BadAttribute {
                name: "index".to_string(),
                value: bindex.to_string(),
            });
        }
        if *is_entry {
            entry_block = Some(block);
        }
    }
    for filler in block_fillers {
        fd.blocks_mut().remove_block(filler);
    }

    // Build ops in id order, with holes
    let mut op_fillers: Vec<OpId> = Vec::new();
    op_descs.sort_by_key(|d| d.id);
    for desc in &op_descs {
        while fd.ops().arena_len() < desc.id {
            let n = fd.ops().arena_len() as u32;
            let filler = fd.new_op_with_seq(
                OpCode::Copy,
                SeqNum::new(Address::new(UNIQUE_SPACE, u64::MAX), u32::MAX - n),
                0,
            );
            op_fillers.push(filler);
        }
        let op = fd.new_op_with_seq(desc.opcode, desc.seq, desc.inputs.len());
        if op.0 != desc.id {
            return Err(ParseError::BadAttribute {
                name: "id".to_string(),
                value: desc.id.to_string(),
            });
        }
        for (slot, vn) in desc.inputs.iter().enumerate() {
            if let Some(vn) = *vn {
                fd.vars_mut().add_use(vn, op);
                fd.ops_mut().get_mut(op).inputs[slot] = Some(vn);
            }
        }
        if let Some(out) = desc.output {
            fd.op_set_output(op, VarnodeId(out));
        }
    }
    for filler in op_fillers {
        fd.ops_mut().destroy(filler);
    }

    // Raw placement: the encoded order is already invariant-correct
    for (bindex, _, op_order) in &block_descs {
        let block = BlockId(*bindex);
        for (i, &opid) in op_order.iter().enumerate() {
            let op = OpId(opid);
            fd.ops_mut().mark_alive(op);
            fd.ops_mut().get_mut(op).parent = Some(block);
            fd.ops_mut().get_mut(op).order = i;
            fd.blocks_mut().get_mut(block).ops.push(op);
        }
    }
    fd.blocks_mut().entry = entry_block;
    if let Some(e) = entry_block {
        fd.blocks_mut().get_mut(e).flags |= crate::blockgraph::BlockFlags::ENTRY;
    }

    // Edges, rebuilt with exact slot order on both endpoints
    let mut in_lists: UnorderedMap<BlockId, Vec<(usize, BlockId, EdgeFlags)>> = Default::default();
    while dec.peek_element().as_deref() == Some("blockedge") {
        dec.open_element("blockedge")?;
        let end = BlockId(dec.attr_usize("end", "blockedge")?);
        let start = BlockId(dec.attr_usize("start", "blockedge")?);
        let slot = dec.attr_usize("slot", "blockedge")?;
        let flags = if dec.attribute("goto") == Some("true") {
            EdgeFlags::GOTO
        } else {
            EdgeFlags::empty()
        };
        dec.close_element("blockedge")?;
        in_lists.entry(end).or_default().push((slot, start, flags));
    }
    let mut ends: Vec<BlockId> = in_lists.keys().copied().collect();
    ends.sort();
    for end in ends {
        let mut list = in_lists.remove(&end).unwrap();
        list.sort();
        for (_, start, flags) in list {
            fd.blocks_mut().get_mut(end).in_edges.push(BlockEdge {
                block: start,
                flags,
            });
            fd.blocks_mut().get_mut(start).out_edges.push(BlockEdge {
                block: end,
                flags,
            });
        }
    }
    // High-variables are recomputed per pass; the encoded list is parsed and discarded
    dec.open_element("highlist")?;
    while dec.peek_element().as_deref() == Some("high") {
        dec.open_element("high")?;
        while dec.peek_element().as_deref() == Some("member") {
            dec.open_element("member")?;
            dec.close_element("member")?;
        }
        dec.close_element("high")?;
    }
    dec.close_element("highlist")?;
    dec.close_element("ast")?;
    dec.close_element("function")?;

    for table in tables {
        fd.add_jump_table(table);
    }
    Ok(fd)
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

fn symbol_header(kind: &crate::symbols::SymbolKind) -> &'static str {
    use crate::symbols::SymbolKind::*;
    match kind {
        Value => "value_sym_head",
        Dynamic { .. } => "dynamic_sym_head",
        Equate { .. } => "equate_sym_head",
        UnionFacet { .. } => "facet_sym_head",
        Function { .. } => "function_sym_head",
    }
}

/// Serialize a symbol table: the scope tree in arena order, each scope's symbols under their
/// per-kind headers.
pub fn encode_symbol_table(
    table: &crate::symbols::SymbolTable,
    arch: &Architecture,
    enc: &mut dyn Encoder,
) {
    enc.open_element("symbol_table");
    enc.attr_usize("scopesize", table.iter_scopes().count());
    enc.attr_usize("symbolsize", table.iter_symbols().count());
    for (sid, scope) in table.iter_scopes() {
        enc.open_element("scope");
        enc.attr_usize("id", sid.0);
        enc.attribute("name", &scope.name);
        if let Some(parent) = scope.parent {
            enc.attr_usize("parent", parent.0);
        }
        for (_, sym_id) in scope.iter_by_name() {
            let sym = table.symbol(sym_id);
            let tag = symbol_header(&sym.kind);
            enc.open_element(tag);
            enc.attr_u64("id", sym.id);
            enc.attribute("name", &sym.name);
            enc.attr_bool("typelock", sym.typelock);
            enc.attr_bool("namelock", sym.namelock);
            match &sym.kind {
                crate::symbols::SymbolKind::Value => {}
                crate::symbols::SymbolKind::Dynamic { addr, hash } => {
                    enc.attr_u64("hash", *hash);
                    encode_addr(enc, "addr", arch, *addr);
                }
                crate::symbols::SymbolKind::Equate { value } => {
                    enc.attr_u64("value", *value);
                }
                crate::symbols::SymbolKind::UnionFacet { union, field } => {
                    enc.attr_usize("facet", union.0);
                    enc.attribute("label", &field.to_string());
                }
                crate::symbols::SymbolKind::Function { entry } => {
                    encode_addr(enc, "addr", arch, *entry);
                }
            }
            if let Some((addr, size)) = sym.storage {
                enc.open_element("storage");
                enc.attribute("space", &arch.spaces.get(addr.space).name);
                enc.attr_u64("offset", addr.offset);
                enc.attr_u64("size", size as u64);
                enc.close_element("storage");
            }
            enc.close_element(tag);
        }
        enc.close_element("scope");
    }
    enc.close_element("symbol_table");
}

/// Rebuild a symbol table. Scope and symbol ids come out dense in encounter order, matching what
/// `purge` would produce.
pub fn decode_symbol_table(
    arch: &Architecture,
    dec: &mut dyn Decoder,
) -> Result<crate::symbols::SymbolTable, ParseError> {
    use crate::symbols::{SymbolKind, SymbolTable};

    dec.open_element("symbol_table")?;
    let mut table = SymbolTable::new();
    let mut scope_map: UnorderedMap<usize, crate::symbols::ScopeId> = Default::default();
    let headers = [
        "value_sym_head",
        "dynamic_sym_head",
        "equate_sym_head",
        "facet_sym_head",
        "function_sym_head",
    ];
    while dec.peek_element().as_deref() == Some("scope") {
        dec.open_element("scope")?;
        let old_id = dec.attr_usize("id", "scope")?;
        let name = dec.need_attribute("name", "scope")?.to_string();
        let parent = dec.attribute("parent").and_then(parse_u64).map(|v| v as usize);
        let scope = match parent {
            None => {
                scope_map.insert(old_id, table.global);
                table.global
            }
            Some(p) => {
                let parent_scope =
                    *scope_map.get(&p).ok_or_else(|| ParseError::BadAttribute {
                        name: "parent".to_string(),
                        value: p.to_string(),
                    })?;
                let s = table.add_scope_under(parent_scope, name);
                scope_map.insert(old_id, s);
                s
            }
        };
        while dec
            .peek_element()
            .as_deref()
            .map_or(false, |t| headers.contains(&t))
        {
            let tag = dec.peek_element().unwrap();
            dec.open_element(&tag)?;
            let name = dec.need_attribute("name", &tag)?.to_string();
            let typelock = dec.attribute("typelock") == Some("true");
            let namelock = dec.attribute("namelock") == Some("true");
            let hash = dec.attribute("hash").and_then(parse_u64);
            let value = dec.attribute("value").and_then(parse_u64);
            let facet = dec.attribute("facet").and_then(parse_u64);
            let label = dec.attribute("label").map(str::to_string);
            let kind = match tag.as_str() {
                "value_sym_head" => SymbolKind::Value,
                "dynamic_sym_head" => {
                    let addr = decode_addr(dec, "addr", arch)?;
                    SymbolKind::Dynamic {
                        addr,
                        hash: hash.ok_or_else(|| ParseError::MissingAttribute {
                            name: "hash".to_string(),
                            element: tag.clone(),
                        })?,
                    }
                }
                "equate_sym_head" => SymbolKind::Equate {
                    value: value.ok_or_else(|| ParseError::MissingAttribute {
                        name: "value".to_string(),
                        element: tag.clone(),
                    })?,
                },
                "facet_sym_head" => SymbolKind::UnionFacet {
                    union: crate::typeprop::TypeId(facet.ok_or_else(|| {
                        ParseError::MissingAttribute {
                            name: "facet".to_string(),
                            element: tag.clone(),
                        }
                    })? as usize),
                    field: label
                        .as_deref()
                        .and_then(|l| l.parse().ok())
                        .ok_or_else(|| ParseError::MissingAttribute {
                            name: "label".to_string(),
                            element: tag.clone(),
                        })?,
                },
                "function_sym_head" => {
                    let entry = decode_addr(dec, "addr", arch)?;
                    SymbolKind::Function { entry }
                }
                _ => unreachable!("header list is closed"),
            };
            let storage = if dec.peek_element().as_deref() == Some("storage") {
                dec.open_element("storage")?;
                let space_name = dec.need_attribute("space", "storage")?.to_string();
                let offset = dec.attr_u64("offset", "storage")?;
                let size = dec.attr_u64("size", "storage")? as u32;
                dec.close_element("storage")?;
                let space =
                    arch.spaces
                        .by_name(&space_name)
                        .ok_or(ParseError::BadAttribute {
                            name: "space".to_string(),
                            value: space_name,
                        })?;
                Some((Address::new(space, offset), size))
            } else {
                None
            };
            dec.close_element(&tag)?;
            let sid = table.add_symbol(scope, name, kind, None, storage);
            table.symbol_mut(sid).typelock = typelock;
            table.symbol_mut(sid).namelock = namelock;
        }
        dec.close_element("scope")?;
    }
    dec.close_element("symbol_table")?;
    Ok(table)
}

// ---------------------------------------------------------------------------
// Data-types
// ---------------------------------------------------------------------------

/// Serialize the type store. References to other types use `<typeref>` by id; the arena order
/// guarantees every reference points at an earlier entry.
pub fn encode_types(store: &crate::typeprop::TypeStore, enc: &mut dyn Encoder) {
    enc.open_element("typegrp");
    for (id, dt) in store.iter() {
        enc.open_element("type");
        enc.attr_usize("id", id.0);
        enc.attribute("name", &dt.name);
        enc.attr_u64("size", dt.size as u64);
        enc.attribute("metatype", dt.metatype.name());
        if dt.core {
            enc.attr_bool("core", true);
        }
        if let Some(elem) = dt.element {
            enc.open_element("typeref");
            enc.attr_usize("id", elem.0);
            enc.close_element("typeref");
        }
        for f in &dt.fields {
            enc.open_element("field");
            enc.attribute("name", &f.name);
            enc.attr_u64("offset", f.offset);
            enc.open_element("typeref");
            enc.attr_usize("id", f.datatype.0);
            enc.close_element("typeref");
            enc.close_element("field");
        }
        if let Some((container, offset)) = dt.container {
            enc.open_element("container");
            enc.attr_usize("id", container.0);
            enc.attr_u64("offset", offset);
            enc.close_element("container");
        }
        if let Some(td) = dt.typedef_of {
            enc.open_element("def");
            enc.attr_usize("id", td.0);
            enc.close_element("def");
        }
        enc.close_element("type");
    }
    enc.close_element("typegrp");
}

/// Rebuild a type store from its encoded arena.
pub fn decode_types(
    dec: &mut dyn Decoder,
) -> Result<crate::typeprop::TypeStore, ParseError> {
    use crate::typeprop::{DataType, Metatype, TypeField, TypeId, TypeStore};

    dec.open_element("typegrp")?;
    let mut arena: Vec<DataType> = Vec::new();
    while dec.peek_element().as_deref() == Some("type") {
        dec.open_element("type")?;
        let id = dec.attr_usize("id", "type")?;
        if id != arena.len() {
            return Err(ParseError::BadAttribute {
                name: "id".to_string(),
                value: id.to_string(),
            });
        }
        let name = dec.need_attribute("name", "type")?.to_string();
        let size = dec.attr_u64("size", "type")? as u32;
        let meta_name = dec.need_attribute("metatype", "type")?.to_string();
        let metatype = Metatype::from_name(&meta_name).ok_or(ParseError::BadAttribute {
            name: "metatype".to_string(),
            value: meta_name,
        })?;
        let core = dec.attribute("core") == Some("true");
        let mut element = None;
        let mut fields = Vec::new();
        let mut container = None;
        let mut typedef_of = None;
        loop {
            match dec.peek_element().as_deref() {
                Some("typeref") => {
                    dec.open_element("typeref")?;
                    element = Some(TypeId(dec.attr_usize("id", "typeref")?));
                    dec.close_element("typeref")?;
                }
                Some("field") => {
                    dec.open_element("field")?;
                    let fname = dec.need_attribute("name", "field")?.to_string();
                    let offset = dec.attr_u64("offset", "field")?;
                    dec.open_element("typeref")?;
                    let ft = TypeId(dec.attr_usize("id", "typeref")?);
                    dec.close_element("typeref")?;
                    dec.close_element("field")?;
                    fields.push(TypeField {
                        offset,
                        name: fname,
                        datatype: ft,
                    });
                }
                Some("container") => {
                    dec.open_element("container")?;
                    let cid = TypeId(dec.attr_usize("id", "container")?);
                    let offset = dec.attr_u64("offset", "container")?;
                    dec.close_element("container")?;
                    container = Some((cid, offset));
                }
                Some("def") => {
                    dec.open_element("def")?;
                    typedef_of = Some(TypeId(dec.attr_usize("id", "def")?));
                    dec.close_element("def")?;
                }
                _ => break,
            }
        }
        dec.close_element("type")?;
        arena.push(DataType {
            name,
            size,
            metatype,
            fields,
            element,
            container,
            core,
            typedef_of,
        });
    }
    dec.close_element("typegrp")?;
    Ok(TypeStore::from_arena(arena))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip_of_elements() {
        let mut enc = TextEncoder::new();
        enc.open_element("scope");
        enc.attribute("name", "outer \"quoted\"");
        enc.open_element("symbol_table");
        enc.attr_usize("scopesize", 2);
        enc.close_element("symbol_table");
        enc.close_element("scope");
        let text = enc.finish();

        let mut dec = TextDecoder::new(&text);
        dec.open_element("scope").unwrap();
        assert_eq!(dec.attribute("name"), Some("outer \"quoted\""));
        assert_eq!(dec.peek_element().as_deref(), Some("symbol_table"));
        dec.open_element("symbol_table").unwrap();
        assert_eq!(dec.attr_usize("scopesize", "symbol_table").unwrap(), 2);
        dec.close_element("symbol_table").unwrap();
        assert!(dec.peek_element().is_none());
        dec.close_element("scope").unwrap();
    }

    #[test]
    fn symbol_table_round_trip() {
        use crate::address::{Endian, SpaceKind, SpaceManager};
        use crate::contracts::EmptyImage;
        use crate::symbols::{SymbolKind, SymbolTable};

        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0);
        let arch = Architecture::new(mgr, Endian::Little, Box::new(EmptyImage));

        let mut table = SymbolTable::new();
        let g = table.global;
        table.add_symbol(
            g,
            "counter",
            SymbolKind::Value,
            None,
            Some((Address::new(ram, 0x100), 4)),
        );
        let inner = table.add_scope("locals");
        table.add_symbol(inner, "eq", SymbolKind::Equate { value: 0x2a }, None, None);

        let mut enc = TextEncoder::new();
        encode_symbol_table(&table, &arch, &mut enc);
        let first = enc.finish();

        let mut dec = TextDecoder::new(&first);
        let table2 = decode_symbol_table(&arch, &mut dec).unwrap();
        let mut enc2 = TextEncoder::new();
        encode_symbol_table(&table2, &arch, &mut enc2);
        assert_eq!(first, enc2.finish());
        assert_eq!(table2.iter_symbols().count(), 2);
        assert!(table2
            .lookup_by_address(Address::new(ram, 0x102))
            .is_some());
    }

    #[test]
    fn types_round_trip() {
        use crate::typeprop::{Metatype, TypeField, TypeStore};

        let mut store = TypeStore::new();
        let int4 = store.get_base(4, Metatype::Int);
        let ptr = store.get_pointer(8, int4, 1);
        let _s = store.add_composite(
            "pair",
            Metatype::Struct,
            12,
            vec![
                TypeField {
                    offset: 0,
                    name: "p".into(),
                    datatype: ptr,
                },
                TypeField {
                    offset: 8,
                    name: "n".into(),
                    datatype: int4,
                },
            ],
        );

        let mut enc = TextEncoder::new();
        encode_types(&store, &mut enc);
        let first = enc.finish();

        let mut dec = TextDecoder::new(&first);
        let store2 = decode_types(&mut dec).unwrap();
        let mut enc2 = TextEncoder::new();
        encode_types(&store2, &mut enc2);
        assert_eq!(first, enc2.finish());

        // Restored caches intern to the same ids
        let mut store2 = store2;
        assert_eq!(store2.get_base(4, Metatype::Int), int4);
        assert_eq!(store2.get_pointer(8, int4, 1), ptr);
    }

    #[test]
    fn bad_element_is_a_parse_error() {
        let mut dec = TextDecoder::new("<typeref id=\"3\"/>");
        match dec.open_element("type") {
            Err(ParseError::UnexpectedElement { expected, found }) => {
                assert_eq!(expected, "type");
                assert_eq!(found, "typeref");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
