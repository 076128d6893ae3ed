//! Symbols and lexically scoped symbol tables.
//!
//! Symbols are shared (`Rc<RefCell<_>>`) between the scope that owns them and
//! the AST nodes that reference them: the analyzer flips `address_taken`, the
//! storage planner assigns storage, and the HIR generator reads both. Scopes
//! form a parent chain; a function's scope is named after the function so a
//! `return` statement can find the enclosing function's type by scope-name
//! lookup.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::middle::ty::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Variable,
    Type,
}

/// Where a variable lives within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    Unassigned,
    /// A virtual register (scalars whose address is never taken).
    Vreg(u32),
    /// A byte offset into the locals region of the enclosing frame.
    FrameOffset(u32),
}

#[derive(Debug)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: String,
    pub ty: Rc<Type>,
    pub is_defined: bool,
    pub address_taken: bool,
    pub on_stack: bool,
    pub storage: StorageLocation,

    // function symbols only: locals-region size in bytes (set by the storage
    // planner) and the first vreg number never used (set by the HIR
    // generator, used for spill planning)
    pub frame_size: u32,
    pub vreg_limit: u32,
}

impl Symbol {
    /// A defined variable symbol not yet attached to a scope (function
    /// parameters are built before their scope exists).
    pub fn variable(name: impl Into<String>, ty: Rc<Type>) -> Self {
        Self::new(SymbolKind::Variable, name, ty, true)
    }

    fn new(kind: SymbolKind, name: impl Into<String>, ty: Rc<Type>, is_defined: bool) -> Self {
        Self {
            kind,
            name: name.into(),
            ty,
            is_defined,
            address_taken: false,
            on_stack: false,
            storage: StorageLocation::Unassigned,
            frame_size: 0,
            vreg_limit: 0,
        }
    }

    pub fn vreg(&self) -> Option<u32> {
        match self.storage {
            StorageLocation::Vreg(vreg) => Some(vreg),
            _ => None,
        }
    }

    pub fn frame_offset(&self) -> Option<u32> {
        match self.storage {
            StorageLocation::FrameOffset(offset) => Some(offset),
            _ => None,
        }
    }
}

pub type SymbolRef = Rc<RefCell<Symbol>>;

#[derive(Debug)]
pub struct SymbolTable {
    parent: Option<Rc<RefCell<SymbolTable>>>,
    name: String,
    symbols: Vec<SymbolRef>,
    index: HashMap<String, usize>,
}

impl SymbolTable {
    pub fn new(parent: Option<Rc<RefCell<SymbolTable>>>, name: impl Into<String>) -> Self {
        Self {
            parent,
            name: name.into(),
            symbols: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Rc<RefCell<SymbolTable>>> {
        self.parent.clone()
    }

    pub fn has_symbol_local(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn has_symbol_recursive(&self, name: &str) -> bool {
        self.lookup_recursive(name).is_some()
    }

    pub fn lookup_local(&self, name: &str) -> Option<SymbolRef> {
        self.index.get(name).map(|&i| self.symbols[i].clone())
    }

    pub fn lookup_recursive(&self, name: &str) -> Option<SymbolRef> {
        if let Some(symbol) = self.lookup_local(name) {
            return Some(symbol);
        }
        self.parent
            .as_ref()
            .and_then(|p| p.borrow().lookup_recursive(name))
    }

    pub fn lookup_recursive_of_kind(&self, name: &str, kind: SymbolKind) -> Option<SymbolRef> {
        if let Some(symbol) = self.lookup_local(name) {
            if symbol.borrow().kind == kind {
                return Some(symbol);
            }
        }
        self.parent
            .as_ref()
            .and_then(|p| p.borrow().lookup_recursive_of_kind(name, kind))
    }

    /// Insert unconditionally; the caller must check `has_symbol_local` first
    /// and raise the duplicate-symbol diagnostic itself (it has the
    /// `Location`).
    pub fn define(&mut self, kind: SymbolKind, name: &str, ty: Rc<Type>) -> SymbolRef {
        self.add(Symbol::new(kind, name, ty, true))
    }

    /// Like `define`, but the symbol is declared and not yet defined (a
    /// function prototype, for example).
    pub fn declare(&mut self, kind: SymbolKind, name: &str, ty: Rc<Type>) -> SymbolRef {
        self.add(Symbol::new(kind, name, ty, false))
    }

    pub fn define_symbol(&mut self, symbol: SymbolRef) -> SymbolRef {
        let name = symbol.borrow().name.clone();
        self.index.insert(name, self.symbols.len());
        self.symbols.push(symbol.clone());
        symbol
    }

    fn add(&mut self, symbol: Symbol) -> SymbolRef {
        self.define_symbol(Rc::new(RefCell::new(symbol)))
    }

    /// Symbols in the order they were added. Struct field collection depends
    /// on this order matching the source.
    pub fn symbols(&self) -> &[SymbolRef] {
        &self.symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ty::BasicTypeKind;

    fn int() -> Rc<Type> {
        Type::basic(BasicTypeKind::Int, true)
    }

    #[test]
    fn local_lookup_does_not_search_parents() {
        let global = Rc::new(RefCell::new(SymbolTable::new(None, "root")));
        global
            .borrow_mut()
            .define(SymbolKind::Variable, "x", int());

        let inner = SymbolTable::new(Some(global), "main");
        assert!(!inner.has_symbol_local("x"));
        assert!(inner.has_symbol_recursive("x"));
    }

    #[test]
    fn recursive_lookup_finds_nearest_binding() {
        let global = Rc::new(RefCell::new(SymbolTable::new(None, "root")));
        global
            .borrow_mut()
            .define(SymbolKind::Variable, "x", int());

        let mut inner = SymbolTable::new(Some(global.clone()), "main");
        let shadow = inner.define(SymbolKind::Variable, "x", Type::pointer(int()));

        let found = inner.lookup_recursive("x").unwrap();
        assert!(Rc::ptr_eq(&found, &shadow));
        assert!(found.borrow().ty.is_pointer());
    }

    #[test]
    fn lookup_by_kind_skips_other_kinds() {
        let global = Rc::new(RefCell::new(SymbolTable::new(None, "root")));
        global.borrow_mut().define(
            SymbolKind::Function,
            "f",
            Type::function(int(), Vec::new()),
        );

        let inner = SymbolTable::new(Some(global), "f");
        assert!(
            inner
                .lookup_recursive_of_kind("f", SymbolKind::Function)
                .is_some()
        );
        assert!(
            inner
                .lookup_recursive_of_kind("f", SymbolKind::Variable)
                .is_none()
        );
    }

    #[test]
    fn declare_marks_symbol_undefined() {
        let mut table = SymbolTable::new(None, "root");
        let f = table.declare(SymbolKind::Function, "f", Type::function(int(), Vec::new()));
        assert!(!f.borrow().is_defined);
    }
}
