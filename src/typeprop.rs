//! Data-types, the type-database contract, and type propagation across operation edges.
//!
//! The store interns every data-type and hands out [`TypeId`] handles; lookups are deterministic
//! and side-effect-free within a pass. The propagation loop seeds from cells with locked types
//! and flows types laterally along operation edges until nothing changes or the configured cap is
//! hit. Reads and writes of union-typed cells pick a field per data-flow edge; the choice is
//! cached in the function's resolved-union map and never overwritten once locked.

use crate::address::SeqNum;
use crate::config::CONFIG;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::funcdata::Funcdata;
use crate::log::*;
use crate::op::OpId;
use crate::opcode::OpCode;
use crate::varnode::{VarFlags, VarnodeId};

/// Handle to an interned data-type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub(crate) usize);

impl std::fmt::Debug for TypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ty{}", self.0)
    }
}

/// The broad class of a data-type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Metatype {
    Void,
    Bool,
    Uint,
    Int,
    Float,
    Code,
    Ptr,
    Array,
    Struct,
    Union,
    /// A byte-range view into a union, used while the field is still undecided
    PartialUnion,
    Unknown,
}

impl Metatype {
    /// Propagation preference: a lower rank displaces a higher one. Composites and pointers are
    /// the most informative; `Unknown`/`Void` give way to anything.
    pub fn rank(self) -> u8 {
        match self {
            Metatype::Struct | Metatype::Union | Metatype::Array => 0,
            Metatype::PartialUnion => 1,
            Metatype::Ptr => 2,
            Metatype::Float => 3,
            Metatype::Bool => 4,
            Metatype::Code => 5,
            Metatype::Int => 6,
            Metatype::Uint => 7,
            Metatype::Unknown => 8,
            Metatype::Void => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Metatype::Void => "void",
            Metatype::Bool => "bool",
            Metatype::Uint => "uint",
            Metatype::Int => "int",
            Metatype::Float => "float",
            Metatype::Code => "code",
            Metatype::Ptr => "ptr",
            Metatype::Array => "array",
            Metatype::Struct => "struct",
            Metatype::Union => "union",
            Metatype::PartialUnion => "partunion",
            Metatype::Unknown => "unknown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        use Metatype::*;
        Some(match name {
            "void" => Void,
            "bool" => Bool,
            "uint" => Uint,
            "int" => Int,
            "float" => Float,
            "code" => Code,
            "ptr" => Ptr,
            "array" => Array,
            "struct" => Struct,
            "union" => Union,
            "partunion" => PartialUnion,
            "unknown" => Unknown,
            _ => return None,
        })
    }
}

/// One component of a composite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeField {
    pub offset: u64,
    pub name: String,
    pub datatype: TypeId,
}

/// An interned data-type.
#[derive(Clone, Debug)]
pub struct DataType {
    pub name: String,
    pub size: u32,
    pub metatype: Metatype,
    /// Components, for structs and unions.
    pub fields: Vec<TypeField>,
    /// Referent for pointers, element for arrays.
    pub element: Option<TypeId>,
    /// For partial unions: the containing union and the byte offset of the view.
    pub container: Option<(TypeId, u64)>,
    /// A core type predates any user definitions.
    pub core: bool,
    /// The definition a typedef resolves to.
    pub typedef_of: Option<TypeId>,
}

/// The interning store. Implements the type-database contract consumed by the engine.
pub struct TypeStore {
    arena: Vec<DataType>,
    base_cache: UnorderedMap<(u32, Metatype), TypeId>,
    ptr_cache: UnorderedMap<(u32, TypeId, u32), TypeId>,
    partial_cache: UnorderedMap<(TypeId, u64, u32), TypeId>,
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeStore {
    pub fn new() -> Self {
        Self {
            arena: Vec::new(),
            base_cache: Default::default(),
            ptr_cache: Default::default(),
            partial_cache: Default::default(),
        }
    }

    pub fn get(&self, id: TypeId) -> &DataType {
        &self.arena[id.0]
    }

    fn intern(&mut self, dt: DataType) -> TypeId {
        let id = TypeId(self.arena.len());
        self.arena.push(dt);
        id
    }

    /// `get_base(size, metatype)`: the canonical atomic type of a size and class.
    pub fn get_base(&mut self, size: u32, metatype: Metatype) -> TypeId {
        if let Some(&id) = self.base_cache.get(&(size, metatype)) {
            return id;
        }
        let name = match metatype {
            Metatype::Void => "void".to_string(),
            Metatype::Bool => "bool".to_string(),
            Metatype::Uint => format!("uint{}", size),
            Metatype::Int => format!("int{}", size),
            Metatype::Float => format!("float{}", size),
            Metatype::Code => "code".to_string(),
            _ => format!("{}{}", metatype.name(), size),
        };
        let id = self.intern(DataType {
            name,
            size,
            metatype,
            fields: Vec::new(),
            element: None,
            container: None,
            core: true,
            typedef_of: None,
        });
        self.base_cache.insert((size, metatype), id);
        id
    }

    /// `get_pointer(size, element, word_size)`: the pointer type to `element`.
    pub fn get_pointer(&mut self, size: u32, element: TypeId, wordsize: u32) -> TypeId {
        if let Some(&id) = self.ptr_cache.get(&(size, element, wordsize)) {
            return id;
        }
        let name = format!("{} *", self.get(element).name);
        let id = self.intern(DataType {
            name,
            size,
            metatype: Metatype::Ptr,
            fields: Vec::new(),
            element: Some(element),
            container: None,
            core: false,
            typedef_of: None,
        });
        self.ptr_cache.insert((size, element, wordsize), id);
        id
    }

    /// Register a composite (struct or union) with explicit fields.
    pub fn add_composite(
        &mut self,
        name: impl Into<String>,
        metatype: Metatype,
        size: u32,
        fields: Vec<TypeField>,
    ) -> TypeId {
        assert!(matches!(metatype, Metatype::Struct | Metatype::Union));
        self.intern(DataType {
            name: name.into(),
            size,
            metatype,
            fields,
            element: None,
            container: None,
            core: false,
            typedef_of: None,
        })
    }

    /// Register an array of `count` elements.
    pub fn add_array(&mut self, element: TypeId, count: u32) -> TypeId {
        let (esz, ename) = {
            let e = self.get(element);
            (e.size, e.name.clone())
        };
        self.intern(DataType {
            name: format!("{}[{}]", ename, count),
            size: esz * count,
            metatype: Metatype::Array,
            fields: Vec::new(),
            element: Some(element),
            container: None,
            core: false,
            typedef_of: None,
        })
    }

    /// Register a typedef of an existing type.
    pub fn add_typedef(&mut self, name: impl Into<String>, of: TypeId) -> TypeId {
        let (size, metatype) = {
            let t = self.get(of);
            (t.size, t.metatype)
        };
        self.intern(DataType {
            name: name.into(),
            size,
            metatype,
            fields: Vec::new(),
            element: None,
            container: None,
            core: false,
            typedef_of: Some(of),
        })
    }

    /// `get_typedef_immediate(type)`: the definition a typedef resolves to, if `id` is one.
    pub fn get_typedef_immediate(&self, id: TypeId) -> Option<TypeId> {
        self.get(id).typedef_of
    }

    /// `get_exact_piece(composite, byte_offset, size)`: the component of a composite exactly
    /// occupying `[offset, offset+size)`, or `None`.
    pub fn get_exact_piece(&self, composite: TypeId, offset: u64, size: u32) -> Option<TypeId> {
        let t = self.get(composite);
        match t.metatype {
            Metatype::Struct | Metatype::Union => t
                .fields
                .iter()
                .find(|f| {
                    f.offset == offset && self.get(f.datatype).size == size
                })
                .map(|f| f.datatype),
            Metatype::Array => {
                let elem = t.element?;
                let esz = self.get(elem).size as u64;
                (esz == size as u64 && offset % esz == 0).then_some(elem)
            }
            _ => None,
        }
    }

    /// The partial-union view of `union_type` at the given window.
    pub fn get_partial_union(&mut self, union_type: TypeId, offset: u64, size: u32) -> TypeId {
        if let Some(&id) = self.partial_cache.get(&(union_type, offset, size)) {
            return id;
        }
        let name = format!("{}@{}:{}", self.get(union_type).name, offset, size);
        let id = self.intern(DataType {
            name,
            size,
            metatype: Metatype::PartialUnion,
            fields: Vec::new(),
            element: None,
            container: Some((union_type, offset)),
            core: false,
            typedef_of: None,
        });
        self.partial_cache.insert((union_type, offset, size), id);
        id
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Iterate all interned types in id order.
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &DataType)> {
        self.arena.iter().enumerate().map(|(i, t)| (TypeId(i), t))
    }

    /// Rebuild a store from a decoded arena, restoring the lookup caches. References inside the
    /// arena always point at earlier entries, so replay order is the arena order.
    pub fn from_arena(arena: Vec<DataType>) -> Self {
        let mut store = Self::new();
        for dt in arena {
            let id = TypeId(store.arena.len());
            match dt.metatype {
                Metatype::Ptr => {
                    if let Some(elem) = dt.element {
                        store.ptr_cache.insert((dt.size, elem, 1), id);
                    }
                }
                Metatype::PartialUnion => {
                    if let Some((u, off)) = dt.container {
                        store.partial_cache.insert((u, off, dt.size), id);
                    }
                }
                m if dt.core => {
                    store.base_cache.insert((dt.size, m), id);
                }
                _ => {}
            }
            store.arena.push(dt);
        }
        store
    }
}

/// The field chosen for one data-flow edge touching a union.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedUnion {
    /// Index into the union's field list; `-1` means the union is used whole.
    pub field: i32,
    /// Locked entries come from user facet symbols and are never overwritten.
    pub lock: bool,
}

/// Key of the resolved-union map: which union, at which op, on which slot (`-1` = output).
pub type ResolveEdge = (TypeId, SeqNum, i32);

/// The size of the component a composite carries at `offset`: the field starting there for
/// structs and unions, the element for arrays on an element boundary.
fn component_size_at(store: &TypeStore, composite: TypeId, offset: u64) -> Option<u32> {
    let t = store.get(composite);
    match t.metatype {
        Metatype::Struct | Metatype::Union => t
            .fields
            .iter()
            .find(|f| f.offset == offset)
            .map(|f| store.get(f.datatype).size),
        Metatype::Array => {
            let elem = t.element?;
            let esz = store.get(elem).size;
            (esz > 0 && offset % esz as u64 == 0).then_some(esz)
        }
        _ => None,
    }
}

/// Lateral propagation along one edge of an op: given the type `alt` on the source end, the type
/// the destination end should take, or `None` when nothing flows. `in_slot`/`out_slot` follow the
/// convention that `-1` names the output. `const_offset` is the op's byte displacement when its
/// offset operands are constant (already element-scaled for PTRADD); pointer arithmetic consults
/// the pointee composite through it to pick the addressed component.
pub fn propagate_type(
    store: &mut TypeStore,
    opcode: OpCode,
    alt: TypeId,
    in_slot: i32,
    out_slot: i32,
    const_offset: Option<u64>,
) -> Option<TypeId> {
    use OpCode::*;
    let meta = store.get(alt).metatype;
    match opcode {
        // Types flow through data-movement unchanged, in both directions.
        Copy | Phi | Indirect => Some(alt),
        // Pointer-ness survives plain arithmetic; scalars do not force anything.
        IntAdd | IntSub => (meta == Metatype::Ptr && out_slot == -1).then_some(alt),
        // Pointer arithmetic picks the component the displacement lands on: the output becomes a
        // pointer to the addressed field (or array element) when the pointee layout has one
        // exactly there.
        PtrAdd | PtrSub => {
            if meta != Metatype::Ptr || in_slot != 0 || out_slot != -1 {
                return None;
            }
            let ptr_size = store.get(alt).size;
            let Some(pointee) = store.get(alt).element else {
                return Some(alt);
            };
            let Some(off) = const_offset else {
                return Some(alt);
            };
            match component_size_at(store, pointee, off)
                .and_then(|size| store.get_exact_piece(pointee, off, size))
            {
                Some(piece) => Some(store.get_pointer(ptr_size, piece, 1)),
                None => Some(alt),
            }
        }
        // A load pulls the pointee out of its pointer; a typed result pushes a pointer back.
        Load => {
            if in_slot == 1 && out_slot == -1 {
                store.get(alt).element
            } else if in_slot == -1 && out_slot == 1 {
                let ptr_size = 8;
                Some(store.get_pointer(ptr_size, alt, 1))
            } else {
                None
            }
        }
        Store => {
            if in_slot == 1 && out_slot == 2 {
                store.get(alt).element
            } else if in_slot == 2 && out_slot == 1 {
                let ptr_size = 8;
                Some(store.get_pointer(ptr_size, alt, 1))
            } else {
                None
            }
        }
        // Comparing two values unifies their types across the comparison.
        IntEqual | IntNotEqual | IntLess | IntLessEqual | IntSLess | IntSLessEqual => {
            ((in_slot == 0 && out_slot == 1) || (in_slot == 1 && out_slot == 0)).then_some(alt)
        }
        // A truncation keeps a composite's typing only through an exact component, which the
        // caller resolves with `get_exact_piece`; nothing propagates along the raw edge.
        SubPiece => None,
        // An explicit cast is a propagation barrier.
        Cast => None,
        _ => None,
    }
}

/// The default output type an op produces when nothing more specific has propagated in.
pub fn output_token(store: &mut TypeStore, opcode: OpCode, out_size: u32) -> TypeId {
    use OpCode::*;
    let meta = match opcode {
        IntEqual | IntNotEqual | IntSLess | IntSLessEqual | IntLess | IntLessEqual | IntCarry
        | IntSCarry | IntSBorrow | BoolNegate | BoolXor | BoolAnd | BoolOr | FloatEqual
        | FloatNotEqual | FloatLess | FloatLessEqual | FloatIsNan => Metatype::Bool,
        FloatAdd | FloatSub | FloatMult | FloatDiv | FloatNeg | FloatAbs | FloatSqrt
        | Float2Float | FloatRound | FloatCeil | FloatFloor | Int2Float => Metatype::Float,
        IntSDiv | IntSRem | IntSext | IntSRightShift | Float2IntTrunc => Metatype::Int,
        IntAdd | IntSub | IntMult | IntUDiv | IntURem | IntAnd | IntOr | IntXor | IntZext
        | IntLeftShift | IntURightShift | IntTwosComp | IntOnesComp | Popcount => Metatype::Uint,
        _ => Metatype::Unknown,
    };
    store.get_base(out_size, meta)
}

/// The cast required when an op reads `slot` holding `current`, or `None` when the read is
/// well-typed as-is.
pub fn input_cast(
    store: &mut TypeStore,
    opcode: OpCode,
    slot: usize,
    current: TypeId,
    size: u32,
) -> Option<TypeId> {
    use OpCode::*;
    let want = match opcode {
        FloatAdd | FloatSub | FloatMult | FloatDiv | FloatNeg | FloatAbs | FloatSqrt
        | Float2Float | FloatRound | FloatCeil | FloatFloor | Float2IntTrunc => Metatype::Float,
        IntSDiv | IntSRem | IntSLess | IntSLessEqual | IntSRightShift | IntSext => Metatype::Int,
        BoolNegate | BoolXor | BoolAnd | BoolOr => Metatype::Bool,
        CBranch if slot == 1 => Metatype::Bool,
        _ => return None,
    };
    let have = store.get(current).metatype;
    (have != want && have != Metatype::Unknown).then(|| store.get_base(size, want))
}

/// Whether `cand` should displace `cur` on a cell.
fn prefer(store: &TypeStore, cur: Option<TypeId>, cand: TypeId) -> bool {
    match cur {
        None => true,
        Some(cur) => {
            store.get(cand).metatype.rank() < store.get(cur).metatype.rank()
        }
    }
}

/// Run the propagation loop over a function until fixed point (or the configured cap).
///
/// Seeds are the type-locked cells; their types never change. Constant pointers that land inside
/// a symbol's storage range are attached to the owning symbol as they are discovered.
pub fn propagate_types(fd: &mut Funcdata) {
    // Seed: locked cells keep their type; everything else starts from the op output token.
    let alive: Vec<OpId> = fd.ops().alive_iter().collect();
    for &op in &alive {
        let (opcode, out) = {
            let o = fd.ops().get(op);
            (o.opcode, o.output())
        };
        if let Some(out) = out {
            if fd.vars().get(out).datatype.is_none() {
                let size = fd.vars().get(out).size;
                let tok = {
                    let mut types = fd.arch().types.borrow_mut();
                    output_token(&mut types, opcode, size)
                };
                fd.vars_mut().get_mut(out).datatype = Some(tok);
            }
        }
    }

    let mut pass = 0usize;
    loop {
        pass += 1;
        if pass > CONFIG.type_propagation_passes {
            warn!("Type propagation hit its pass cap"; "passes" => pass);
            break;
        }
        let mut changed = false;
        for &op in &alive {
            let (opcode, inputs, output) = {
                let o = fd.ops().get(op);
                let ins: Vec<Option<VarnodeId>> =
                    (0..o.num_inputs()).map(|i| o.input(i)).collect();
                (o.opcode, ins, o.output())
            };
            // Every (source, destination) edge of the op
            let mut ends: Vec<(i32, VarnodeId)> = Vec::new();
            for (i, vn) in inputs.iter().enumerate() {
                if let Some(vn) = *vn {
                    ends.push((i as i32, vn));
                }
            }
            if let Some(out) = output {
                ends.push((-1, out));
            }
            // The byte displacement of pointer arithmetic, when its offset operands are constant
            let constant_in = |slot: usize| {
                inputs
                    .get(slot)
                    .copied()
                    .flatten()
                    .and_then(|vn| fd.vars().get(vn).constant_value())
            };
            let const_offset = match opcode {
                OpCode::PtrSub => constant_in(1),
                OpCode::PtrAdd => match (constant_in(1), constant_in(2)) {
                    (Some(index), Some(elem)) => Some(index.wrapping_mul(elem)),
                    _ => None,
                },
                _ => None,
            };
            for &(src_slot, src) in &ends {
                let Some(alt) = fd.vars().get(src).datatype else {
                    continue;
                };
                for &(dst_slot, dst) in &ends {
                    if src_slot == dst_slot {
                        continue;
                    }
                    let cand = {
                        let mut types = fd.arch().types.borrow_mut();
                        propagate_type(&mut types, opcode, alt, src_slot, dst_slot, const_offset)
                    };
                    let Some(cand) = cand else { continue };
                    let dst_vn = fd.vars().get(dst);
                    if dst_vn.flags.contains(VarFlags::TYPELOCK) {
                        continue;
                    }
                    if dst_vn.size != fd.arch().types.borrow().get(cand).size
                        && fd.arch().types.borrow().get(cand).metatype != Metatype::Ptr
                    {
                        continue;
                    }
                    let take = {
                        let types = fd.arch().types.borrow();
                        prefer(&types, dst_vn.datatype, cand)
                    };
                    if take {
                        fd.vars_mut().get_mut(dst).datatype = Some(cand);
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    attach_constant_pointers(fd, &alive);
    resolve_unions(fd, &alive);
}

/// Constant cells carrying a pointer type are rewritten to reference the owning symbol.
fn attach_constant_pointers(fd: &mut Funcdata, alive: &[OpId]) {
    let mut hits: Vec<(VarnodeId, crate::symbols::SymbolId)> = Vec::new();
    for &op in alive {
        let n = fd.ops().get(op).num_inputs();
        for i in 0..n {
            let Some(vn) = fd.ops().get(op).input(i) else {
                continue;
            };
            let v = fd.vars().get(vn);
            if !v.is_constant() || v.symbol.is_some() {
                continue;
            }
            let Some(dt) = v.datatype else { continue };
            if fd.arch().types.borrow().get(dt).metatype != Metatype::Ptr {
                continue;
            }
            let Some(ram) = fd.arch().spaces.first_of_kind(crate::address::SpaceKind::Ram)
            else {
                continue;
            };
            let target = crate::address::Address::new(ram, v.addr.offset);
            if let Some(sym) = fd.symbols().lookup_by_address(target) {
                hits.push((vn, sym));
            }
        }
    }
    for (vn, sym) in hits {
        fd.vars_mut().get_mut(vn).symbol = Some(sym);
    }
}

/// Pick a field for every data-flow edge that touches a union or partial-union typed cell.
/// Existing locked entries are honored; phi slots holding the same cell resolve identically.
pub fn resolve_unions(fd: &mut Funcdata, alive: &[OpId]) {
    for &op in alive {
        let (opcode, seq, inputs, output) = {
            let o = fd.ops().get(op);
            let ins: Vec<Option<VarnodeId>> = (0..o.num_inputs()).map(|i| o.input(i)).collect();
            (o.opcode, o.seq, ins, o.output())
        };
        let mut edges: Vec<(i32, VarnodeId)> = Vec::new();
        for (i, vn) in inputs.iter().enumerate() {
            if let Some(vn) = *vn {
                edges.push((i as i32, vn));
            }
        }
        if let Some(out) = output {
            edges.push((-1, out));
        }

        // For phi ops, slots carrying the same cell must resolve to the same field.
        let mut same_cell: UnorderedMap<VarnodeId, Vec<i32>> = Default::default();
        if opcode == OpCode::Phi {
            for &(slot, vn) in &edges {
                same_cell.entry(vn).or_default().push(slot);
            }
        }
        let mut decided: UnorderedSet<VarnodeId> = Default::default();

        for &(slot, vn) in &edges {
            let Some(dt) = fd.vars().get(vn).datatype else {
                continue;
            };
            let (union_type, offset) = {
                let types = fd.arch().types.borrow();
                let t = types.get(dt);
                match t.metatype {
                    Metatype::Union => (dt, 0u64),
                    Metatype::PartialUnion => match t.container {
                        Some((u, off)) => (u, off),
                        None => continue,
                    },
                    _ => continue,
                }
            };
            if opcode == OpCode::Phi && !decided.insert(vn) {
                continue; // already populated all slots for this cell below
            }
            let key: ResolveEdge = (union_type, seq, slot);
            if fd.resolved_union(&key).map_or(false, |r| r.lock) {
                continue;
            }
            let size = fd.vars().get(vn).size;
            let field = {
                let types = fd.arch().types.borrow();
                let u = types.get(union_type);
                u.fields
                    .iter()
                    .position(|f| {
                        f.offset == offset && types.get(f.datatype).size == size
                    })
                    .map(|i| i as i32)
                    .unwrap_or(-1)
            };
            let entry = ResolvedUnion { field, lock: false };
            if opcode == OpCode::Phi {
                for &s in same_cell.get(&vn).map(Vec::as_slice).unwrap_or(&[slot]) {
                    fd.set_resolved_union((union_type, seq, s), entry);
                }
            } else {
                fd.set_resolved_union(key, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_types_are_interned_once() {
        let mut store = TypeStore::new();
        let a = store.get_base(4, Metatype::Int);
        let b = store.get_base(4, Metatype::Int);
        assert_eq!(a, b);
        assert_eq!(store.get(a).name, "int4");
    }

    #[test]
    fn exact_piece_of_a_struct() {
        let mut store = TypeStore::new();
        let int4 = store.get_base(4, Metatype::Int);
        let int2 = store.get_base(2, Metatype::Int);
        let s = store.add_composite(
            "pair",
            Metatype::Struct,
            8,
            vec![
                TypeField {
                    offset: 0,
                    name: "lo".into(),
                    datatype: int4,
                },
                TypeField {
                    offset: 4,
                    name: "hi".into(),
                    datatype: int2,
                },
            ],
        );
        assert_eq!(store.get_exact_piece(s, 4, 2), Some(int2));
        assert_eq!(store.get_exact_piece(s, 4, 4), None);
        assert_eq!(store.get_exact_piece(s, 2, 2), None);
    }

    #[test]
    fn pointer_propagates_through_add() {
        let mut store = TypeStore::new();
        let int4 = store.get_base(4, Metatype::Int);
        let p = store.get_pointer(8, int4, 1);
        assert_eq!(
            propagate_type(&mut store, OpCode::IntAdd, p, 0, -1, None),
            Some(p)
        );
        assert_eq!(
            propagate_type(&mut store, OpCode::IntAdd, int4, 0, -1, None),
            None
        );
    }

    #[test]
    fn load_pulls_the_pointee() {
        let mut store = TypeStore::new();
        let f8 = store.get_base(8, Metatype::Float);
        let p = store.get_pointer(8, f8, 1);
        assert_eq!(
            propagate_type(&mut store, OpCode::Load, p, 1, -1, None),
            Some(f8)
        );
    }

    #[test]
    fn ptrsub_narrows_to_the_addressed_field() {
        let mut store = TypeStore::new();
        let int4 = store.get_base(4, Metatype::Int);
        let int2 = store.get_base(2, Metatype::Int);
        let s = store.add_composite(
            "pair",
            Metatype::Struct,
            8,
            vec![
                TypeField {
                    offset: 0,
                    name: "lo".into(),
                    datatype: int4,
                },
                TypeField {
                    offset: 4,
                    name: "hi".into(),
                    datatype: int2,
                },
            ],
        );
        let p = store.get_pointer(8, s, 1);
        let narrowed =
            propagate_type(&mut store, OpCode::PtrSub, p, 0, -1, Some(4)).unwrap();
        assert_eq!(store.get(narrowed).metatype, Metatype::Ptr);
        assert_eq!(store.get(narrowed).element, Some(int2));

        // No field starts at offset 2: the pointer flows through unnarrowed
        assert_eq!(
            propagate_type(&mut store, OpCode::PtrSub, p, 0, -1, Some(2)),
            Some(p)
        );
        // An unknown offset keeps pointer-ness without picking a component
        assert_eq!(
            propagate_type(&mut store, OpCode::PtrSub, p, 0, -1, None),
            Some(p)
        );
    }

    #[test]
    fn ptradd_narrows_to_the_array_element() {
        let mut store = TypeStore::new();
        let int4 = store.get_base(4, Metatype::Int);
        let arr = store.add_array(int4, 8);
        let p = store.get_pointer(8, arr, 1);
        // index 3, element size 4: byte displacement 12
        let narrowed =
            propagate_type(&mut store, OpCode::PtrAdd, p, 0, -1, Some(12)).unwrap();
        assert_eq!(store.get(narrowed).element, Some(int4));

        // Off an element boundary nothing narrows
        assert_eq!(
            propagate_type(&mut store, OpCode::PtrAdd, p, 0, -1, Some(6)),
            Some(p)
        );
    }
}
