//! The symbol table: nested scopes, name- and address-keyed lookup, purge with renumbering.
//!
//! Scopes form a tree rooted at the global scope. Each scope owns a name-ordered symbol map and
//! an address-ordered range map. Lookup walks parent scopes until a hit. Dynamic symbols have no
//! stable storage; they key on the code address and a hash of the defining op's local data-flow.

use crate::address::Address;
use crate::containers::unordered::UnorderedMap;
use crate::log::*;
use crate::rangemap::{RangeMap, RecordId};
use crate::typeprop::TypeId;
use std::collections::BTreeMap;

/// Handle to a scope in the table's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(pub(crate) usize);

impl std::fmt::Debug for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "scope{}", self.0)
    }
}

/// Handle to a symbol in the table's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(pub(crate) usize);

impl std::fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "sym{}", self.0)
    }
}

/// What a symbol stands for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SymbolKind {
    /// A plain variable with stable storage
    Value,
    /// Keyed by (code address, data-flow hash) rather than storage; used for temporaries
    Dynamic { addr: Address, hash: u64 },
    /// Overrides how a constant value prints
    Equate { value: u64 },
    /// Forces a union field choice wherever the symbol applies
    UnionFacet { union: TypeId, field: i32 },
    /// A function entry
    Function { entry: Address },
}

/// One entry of the symbol table.
#[derive(Clone, Debug)]
pub struct Symbol {
    /// Dense numeric id; recomputed by [`SymbolTable::purge`].
    pub id: u64,
    pub name: String,
    pub kind: SymbolKind,
    pub scope: ScopeId,
    pub typelock: bool,
    pub namelock: bool,
    pub datatype: Option<TypeId>,
    /// Storage backing the symbol, for kinds that have it.
    pub storage: Option<(Address, u32)>,
    /// Symbols not worth persisting are swept by `purge`.
    pub savable: bool,
    range_rec: Option<RecordId>,
}

/// A nested scope: name map plus address-range map.
pub struct Scope {
    /// Dense numeric id; recomputed by [`SymbolTable::purge`].
    pub id: u64,
    pub name: String,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    by_name: BTreeMap<String, SymbolId>,
    ranges: RangeMap<Address, SymbolId>,
    members: Vec<SymbolId>,
}

impl Scope {
    fn new(id: u64, name: String, parent: Option<ScopeId>) -> Self {
        Self {
            id,
            name,
            parent,
            children: Vec::new(),
            by_name: BTreeMap::new(),
            ranges: RangeMap::new(),
            members: Vec::new(),
        }
    }

    /// Symbols of this scope in name order.
    pub fn iter_by_name(&self) -> impl Iterator<Item = (&String, SymbolId)> {
        self.by_name.iter().map(|(n, &s)| (n, s))
    }

    pub fn num_symbols(&self) -> usize {
        self.members.len()
    }
}

/// The full table.
pub struct SymbolTable {
    scopes: Vec<Option<Scope>>,
    symbols: Vec<Option<Symbol>>,
    pub global: ScopeId,
    current: ScopeId,
    dynamic_index: UnorderedMap<(Address, u64), SymbolId>,
    next_symbol_id: u64,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let global = ScopeId(0);
        Self {
            scopes: vec![Some(Scope::new(0, "global".into(), None))],
            symbols: Vec::new(),
            global,
            current: global,
            dynamic_index: Default::default(),
            next_symbol_id: 0,
        }
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        self.scopes[id.0].as_ref().expect("stale ScopeId")
    }

    fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        self.scopes[id.0].as_mut().expect("stale ScopeId")
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        self.symbols[id.0].as_ref().expect("stale SymbolId")
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        self.symbols[id.0].as_mut().expect("stale SymbolId")
    }

    pub fn current_scope(&self) -> ScopeId {
        self.current
    }

    /// Push a new child of the current scope and make it current.
    pub fn add_scope(&mut self, name: impl Into<String>) -> ScopeId {
        let parent = self.current;
        let id = self.add_scope_under(parent, name);
        self.current = id;
        id
    }

    /// Push a new child of an explicit parent without changing the current scope. Used by the
    /// stream codec when replaying a scope tree.
    pub fn add_scope_under(&mut self, parent: ScopeId, name: impl Into<String>) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        let uid = self.scopes.iter().flatten().count() as u64;
        self.scopes
            .push(Some(Scope::new(uid, name.into(), Some(parent))));
        self.scope_mut(parent).children.push(id);
        id
    }

    /// All live scopes in arena order.
    pub fn iter_scopes(&self) -> impl Iterator<Item = (ScopeId, &Scope)> {
        self.scopes
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (ScopeId(i), s)))
    }

    /// Return to the parent of the current scope.
    pub fn pop_scope(&mut self) {
        let parent = self
            .scope(self.current)
            .parent
            .expect("cannot pop the global scope");
        self.current = parent;
    }

    /// Add a symbol to a scope. Name collisions within the scope are resolved by suffixing, the
    /// way redeclared locals pick up ordinals.
    pub fn add_symbol(
        &mut self,
        scope: ScopeId,
        name: impl Into<String>,
        kind: SymbolKind,
        datatype: Option<TypeId>,
        storage: Option<(Address, u32)>,
    ) -> SymbolId {
        let mut name = name.into();
        if self.scope(scope).by_name.contains_key(&name) {
            let mut n = 1usize;
            while self
                .scope(scope)
                .by_name
                .contains_key(&format!("{}_{}", name, n))
            {
                n += 1;
            }
            name = format!("{}_{}", name, n);
        }
        let sid = SymbolId(self.symbols.len());
        let numeric = self.next_symbol_id;
        self.next_symbol_id += 1;
        let range_rec = storage.map(|(addr, size)| {
            self.scope_mut(scope).ranges.insert(
                sid,
                addr,
                addr.add(size.max(1) as u64 - 1),
                0,
            )
        });
        if let SymbolKind::Dynamic { addr, hash } = kind {
            self.dynamic_index.insert((addr, hash), sid);
        }
        self.symbols.push(Some(Symbol {
            id: numeric,
            name: name.clone(),
            kind,
            scope,
            typelock: false,
            namelock: false,
            datatype,
            storage,
            savable: true,
            range_rec,
        }));
        let s = self.scope_mut(scope);
        s.by_name.insert(name, sid);
        s.members.push(sid);
        sid
    }

    /// Look a name up starting at the current scope and walking parents.
    pub fn lookup_by_name(&self, name: &str) -> Option<SymbolId> {
        let mut cur = Some(self.current);
        while let Some(s) = cur {
            if let Some(&sid) = self.scope(s).by_name.get(name) {
                return Some(sid);
            }
            cur = self.scope(s).parent;
        }
        None
    }

    /// Look an address up starting at the current scope and walking parents. Returns the first
    /// symbol whose storage range covers the address.
    pub fn lookup_by_address(&self, addr: Address) -> Option<SymbolId> {
        let mut cur = Some(self.current);
        while let Some(s) = cur {
            if let Some((_, &sid)) = self.scope(s).ranges.find(addr).next() {
                return Some(sid);
            }
            cur = self.scope(s).parent;
        }
        None
    }

    /// Look a dynamic symbol up by its (code address, data-flow hash) key.
    pub fn lookup_dynamic(&self, addr: Address, hash: u64) -> Option<SymbolId> {
        self.dynamic_index.get(&(addr, hash)).copied()
    }

    /// All live symbols, in arena order.
    pub fn iter_symbols(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (SymbolId(i), s)))
    }

    /// Remove symbols marked unsavable and scopes left empty, then renumber the surviving scopes
    /// and symbols so their numeric ids stay dense.
    pub fn purge(&mut self) {
        let doomed: Vec<SymbolId> = self
            .iter_symbols()
            .filter(|(_, s)| !s.savable)
            .map(|(id, _)| id)
            .collect();
        for sid in doomed {
            self.remove_symbol(sid);
        }

        // Drop empty leaf scopes (never the global), repeating until stable since removing a
        // child may empty its parent.
        loop {
            let victim = self
                .scopes
                .iter()
                .enumerate()
                .filter_map(|(i, s)| s.as_ref().map(|s| (ScopeId(i), s)))
                .find(|(id, s)| {
                    *id != self.global && s.members.is_empty() && s.children.is_empty()
                })
                .map(|(id, _)| id);
            let Some(id) = victim else { break };
            let parent = self.scope(id).parent.unwrap();
            self.scope_mut(parent).children.retain(|&c| c != id);
            if self.current == id {
                self.current = parent;
            }
            debug!("Purged empty scope"; "scope" => ?id);
            self.scopes[id.0] = None;
        }

        // Renumber densely, in arena order.
        let mut next = 0u64;
        for s in self.scopes.iter_mut().flatten() {
            s.id = next;
            next += 1;
        }
        let mut next = 0u64;
        for s in self.symbols.iter_mut().flatten() {
            s.id = next;
            next += 1;
        }
        self.next_symbol_id = next;
    }

    fn remove_symbol(&mut self, sid: SymbolId) {
        let sym = self.symbols[sid.0].take().expect("stale SymbolId");
        let scope = sym.scope;
        if let Some(rec) = sym.range_rec {
            self.scope_mut(scope).ranges.erase(rec);
        }
        if let SymbolKind::Dynamic { addr, hash } = sym.kind {
            self.dynamic_index.remove(&(addr, hash));
        }
        let s = self.scope_mut(scope);
        s.by_name.remove(&sym.name);
        s.members.retain(|&m| m != sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{SpaceKind, SpaceManager};

    #[test]
    fn lookup_walks_parent_scopes() {
        let mut mgr = SpaceManager::new();
        let ram = mgr.add_space("ram", SpaceKind::Ram, 8, 0);
        let mut table = SymbolTable::new();
        let g = table.global;
        table.add_symbol(
            g,
            "outer",
            SymbolKind::Value,
            None,
            Some((Address::new(ram, 0x100), 4)),
        );
        table.add_scope("inner");
        let inner = table.current_scope();
        table.add_symbol(inner, "local", SymbolKind::Value, None, None);

        assert!(table.lookup_by_name("local").is_some());
        assert!(table.lookup_by_name("outer").is_some());
        assert!(table
            .lookup_by_address(Address::new(ram, 0x102))
            .is_some());

        table.pop_scope();
        assert!(table.lookup_by_name("local").is_none());
    }

    #[test]
    fn purge_renumbers_densely() {
        let mut table = SymbolTable::new();
        let g = table.global;
        let a = table.add_symbol(g, "a", SymbolKind::Value, None, None);
        let b = table.add_symbol(g, "b", SymbolKind::Value, None, None);
        let c = table.add_symbol(g, "c", SymbolKind::Value, None, None);
        assert_eq!(table.symbol(b).id, 1);
        table.symbol_mut(b).savable = false;
        table.add_scope("doomed"); // empty, purged away
        table.pop_scope();
        table.purge();
        assert_eq!(table.symbol(a).id, 0);
        assert_eq!(table.symbol(c).id, 1);
        assert_eq!(table.iter_symbols().count(), 2);
        assert_eq!(table.scope(table.global).id, 0);
    }

    #[test]
    fn dynamic_symbols_key_on_hash() {
        let mut mgr = SpaceManager::new();
        let code = mgr.add_space("code", SpaceKind::Code, 8, 0);
        let mut table = SymbolTable::new();
        let g = table.global;
        let key = Address::new(code, 0x4000);
        let sid = table.add_symbol(
            g,
            "tmp",
            SymbolKind::Dynamic {
                addr: key,
                hash: 0xdead_beef,
            },
            None,
            None,
        );
        assert_eq!(table.lookup_dynamic(key, 0xdead_beef), Some(sid));
        assert_eq!(table.lookup_dynamic(key, 1), None);
    }
}
