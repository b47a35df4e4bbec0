//! Symbol model and symbol tables
//!
//! Symbols and types live in a single arena ([`Symbols`]) and are referred to
//! by small indices ([`SymbolId`], [`TypeId`]). AST nodes and tables store
//! ids, never pointers, so the scope graph (symbols shared between tables and
//! expression nodes, the `result` alias inside functions) needs no shared
//! ownership.
//!
//! A [`SymTable`] is a name-keyed mapping that preserves insertion order;
//! deterministic iteration order is what makes the emitted data segment and
//! the parameter offset assignment reproducible.
//!
//! Size conventions: integer 4 bytes, double 8, array `len × elem`, record
//! the sum of its fields (offsets in declaration order, no padding). A
//! by-reference parameter occupies 4 bytes on the stack (the address).

use crate::ast::Stmt;
use std::collections::HashMap;
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// The types of the language.
#[derive(Debug, Clone, PartialEq)]
pub enum Ty {
    Int,
    Double,
    /// Subrange of integer. The bounds are recorded for the symbol-table dump
    /// but the type behaves as integer everywhere else.
    IntRange { lo: i32, hi: i32 },
    Array { elem: TypeId, len: usize },
    Record { fields: SymTable },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SymbolKind {
    Var {
        ty: TypeId,
        /// Frame offset: negative for locals, positive for parameters and the
        /// function return slot, zero for globals.
        offset: i32,
        global: bool,
        by_ref: bool,
    },
    Const {
        /// Sequential id; the assembly label is `s_<num>` or `dc_<num>`.
        num: usize,
        value: String,
        ty: TypeId,
    },
    TypeAlias {
        ty: TypeId,
    },
    Proc {
        /// Parameter symbols in declaration order.
        params: Vec<SymbolId>,
        locals: SymTable,
        /// Bytes of local variables, for the prologue `sub esp, n`.
        local_size: usize,
        /// `None` for procedures.
        ret: Option<TypeId>,
        /// Attached after the body parses, so the symbol is visible to
        /// recursive calls inside it.
        body: Option<Stmt>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub used: bool,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn is_proc(&self) -> bool {
        matches!(self.kind, SymbolKind::Proc { .. })
    }
}

/// Name → symbol mapping preserving insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymTable {
    order: Vec<String>,
    map: HashMap<String, SymbolId>,
}

impl SymTable {
    pub fn new() -> Self {
        SymTable::default()
    }

    /// Insert under `name`. Re-inserting an existing name overwrites the
    /// mapping without changing its position.
    pub fn insert(&mut self, name: &str, id: SymbolId) {
        if self.map.insert(name.to_string(), id).is_none() {
            self.order.push(name.to_string());
        }
    }

    pub fn erase(&mut self, name: &str) {
        if self.map.remove(name).is_some() {
            self.order.retain(|n| n != name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.map.get(name).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Iterate `(name, id)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, SymbolId)> {
        self.order.iter().map(|n| (n.as_str(), self.map[n]))
    }
}

/// Arena of all symbols and types of one compilation.
#[derive(Debug)]
pub struct Symbols {
    types: Vec<Ty>,
    syms: Vec<Symbol>,
    pub int_type: TypeId,
    pub double_type: TypeId,
}

impl Symbols {
    pub fn new() -> Self {
        let mut arena = Symbols {
            types: Vec::new(),
            syms: Vec::new(),
            int_type: TypeId(0),
            double_type: TypeId(0),
        };
        arena.int_type = arena.add_type(Ty::Int);
        arena.double_type = arena.add_type(Ty::Double);
        arena
    }

    pub fn add_type(&mut self, ty: Ty) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub fn ty(&self, id: TypeId) -> &Ty {
        &self.types[id.0 as usize]
    }

    pub fn add_symbol(&mut self, sym: Symbol) -> SymbolId {
        let id = SymbolId(self.syms.len() as u32);
        self.syms.push(sym);
        id
    }

    pub fn sym(&self, id: SymbolId) -> &Symbol {
        &self.syms[id.0 as usize]
    }

    pub fn sym_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.syms[id.0 as usize]
    }

    pub fn mark_used(&mut self, id: SymbolId) {
        self.sym_mut(id).used = true;
    }

    /// Size of a value of this type, in bytes.
    pub fn size_of(&self, id: TypeId) -> usize {
        match self.ty(id) {
            Ty::Int | Ty::IntRange { .. } => 4,
            Ty::Double => 8,
            Ty::Array { elem, len } => len * self.size_of(*elem),
            Ty::Record { fields } => fields
                .iter()
                .map(|(_, f)| match self.sym(f).kind {
                    SymbolKind::Var { ty, .. } => self.size_of(ty),
                    _ => 0,
                })
                .sum(),
        }
    }

    pub fn is_int(&self, id: TypeId) -> bool {
        matches!(self.ty(id), Ty::Int | Ty::IntRange { .. })
    }

    pub fn is_double(&self, id: TypeId) -> bool {
        matches!(self.ty(id), Ty::Double)
    }

    pub fn is_scalar(&self, id: TypeId) -> bool {
        self.is_int(id) || self.is_double(id)
    }

    /// The type left after peeling `k` index levels off an array type.
    pub fn element_k_type(&self, mut id: TypeId, k: usize) -> TypeId {
        for _ in 0..k {
            if let Ty::Array { elem, .. } = self.ty(id) {
                id = *elem;
            }
        }
        id
    }

    /// Byte stride of one index step at level `k` (1-based): the size of the
    /// remainder after peeling `k` levels.
    pub fn element_size(&self, id: TypeId, k: usize) -> usize {
        self.size_of(self.element_k_type(id, k))
    }

    /// Number of 4-byte slots a value occupies; the `rep movsd` count for
    /// aggregate block copies (a double counts as two slots).
    pub fn flat_count(&self, id: TypeId) -> usize {
        self.size_of(id) / 4
    }

    /// Human-readable type name for diagnostics: `integer`, `double`,
    /// `range`, `record`, `array of ...`.
    pub fn type_name(&self, id: TypeId) -> String {
        match self.ty(id) {
            Ty::Int => "integer".to_string(),
            Ty::Double => "double".to_string(),
            Ty::IntRange { .. } => "range".to_string(),
            Ty::Record { .. } => "record".to_string(),
            Ty::Array { elem, .. } => format!("array of {}", self.type_name(*elem)),
        }
    }

    /// Total bytes of a procedure's arguments as pushed by the caller.
    pub fn args_size(&self, proc: SymbolId) -> usize {
        let SymbolKind::Proc { params, .. } = &self.sym(proc).kind else {
            return 0;
        };
        params
            .iter()
            .map(|&p| match self.sym(p).kind {
                SymbolKind::Var { ty, by_ref, .. } => {
                    if by_ref {
                        4
                    } else {
                        self.size_of(ty)
                    }
                }
                _ => 0,
            })
            .sum()
    }

    /// Size of a function's return slot; 0 for procedures.
    pub fn ret_size(&self, proc: SymbolId) -> usize {
        match &self.sym(proc).kind {
            SymbolKind::Proc { ret: Some(ty), .. } => self.size_of(*ty),
            _ => 0,
        }
    }
}

impl Default for Symbols {
    fn default() -> Self {
        Symbols::new()
    }
}

/// Render a symbol table for the `-p` dump. Only used symbols appear. Nested
/// tables (records, procedure locals) indent by five spaces per level.
pub fn dump_table(arena: &Symbols, table: &SymTable, out: &mut String, depth: usize) {
    let pad = " ".repeat(depth);
    for (name, id) in table.iter() {
        let sym = arena.sym(id);
        if !sym.used {
            continue;
        }
        match &sym.kind {
            SymbolKind::Var { ty, .. } => {
                let _ = writeln!(out, "{}{}\t{}", pad, name, describe_type(arena, *ty));
                if let Ty::Record { fields } = arena.ty(*ty) {
                    dump_table(arena, fields, out, depth + 5);
                    let _ = writeln!(out, "{}end", pad);
                }
            }
            SymbolKind::Const { value, ty, .. } => {
                let _ = writeln!(out, "{}{}\t{} {}", pad, name, arena.type_name(*ty), value);
            }
            SymbolKind::TypeAlias { ty } => {
                let _ = writeln!(out, "{}{}\t= {}", pad, name, describe_type(arena, *ty));
            }
            SymbolKind::Proc {
                params,
                locals,
                ret,
                body,
                ..
            } => {
                let kind = if ret.is_some() {
                    "function"
                } else {
                    "procedure"
                };
                let args = params
                    .iter()
                    .map(|&p| {
                        let p = arena.sym(p);
                        match p.kind {
                            SymbolKind::Var { ty, by_ref, .. } => format!(
                                "{}{}: {}",
                                if by_ref { "var " } else { "" },
                                p.name,
                                arena.type_name(ty)
                            ),
                            _ => p.name.clone(),
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                let ret_part = match ret {
                    Some(ty) => format!(": {}", arena.type_name(*ty)),
                    None => String::new(),
                };
                let _ = writeln!(out, "{}{}\t{}({}){}", pad, name, kind, args, ret_part);
                dump_table(arena, locals, out, depth + 5);
                if let Some(body) = body {
                    crate::ast::dump_stmt(body, out, depth + 5);
                }
            }
        }
    }
}

fn describe_type(arena: &Symbols, id: TypeId) -> String {
    match arena.ty(id) {
        Ty::Int => "integer".to_string(),
        Ty::Double => "double".to_string(),
        Ty::IntRange { lo, hi } => format!("range from {} to {}", lo, hi),
        Ty::Record { .. } => "record".to_string(),
        Ty::Array { elem, len } => format!("array[{}] of {}", len, describe_type(arena, *elem)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(arena: &mut Symbols, name: &str, ty: TypeId) -> SymbolId {
        arena.add_symbol(Symbol {
            name: name.to_string(),
            used: false,
            kind: SymbolKind::Var {
                ty,
                offset: 0,
                global: true,
                by_ref: false,
            },
        })
    }

    #[test]
    fn test_table_preserves_insertion_order() {
        let mut arena = Symbols::new();
        let int = arena.int_type;
        let mut table = SymTable::new();
        for name in ["zeta", "alpha", "mid"] {
            let id = var(&mut arena, name, int);
            table.insert(name, id);
        }
        let names: Vec<_> = table.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_table_erase() {
        let mut arena = Symbols::new();
        let int = arena.int_type;
        let mut table = SymTable::new();
        let a = var(&mut arena, "a", int);
        let b = var(&mut arena, "b", int);
        table.insert("a", a);
        table.insert("b", b);
        table.erase("a");
        assert!(!table.contains("a"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("b"), Some(b));
    }

    #[test]
    fn test_scalar_sizes() {
        let arena = Symbols::new();
        assert_eq!(arena.size_of(arena.int_type), 4);
        assert_eq!(arena.size_of(arena.double_type), 8);
    }

    #[test]
    fn test_array_sizes_and_strides() {
        let mut arena = Symbols::new();
        // array[3] of array[4] of integer
        let int = arena.int_type;
        let inner = arena.add_type(Ty::Array { elem: int, len: 4 });
        let outer = arena.add_type(Ty::Array {
            elem: inner,
            len: 3,
        });
        assert_eq!(arena.size_of(outer), 48);
        assert_eq!(arena.element_size(outer, 1), 16);
        assert_eq!(arena.element_size(outer, 2), 4);
        assert_eq!(arena.element_k_type(outer, 2), int);
        assert_eq!(arena.flat_count(outer), 12);
    }

    #[test]
    fn test_double_array_flat_count() {
        let mut arena = Symbols::new();
        let dbl = arena.double_type;
        let arr = arena.add_type(Ty::Array { elem: dbl, len: 5 });
        // Five doubles are ten 4-byte slots.
        assert_eq!(arena.flat_count(arr), 10);
    }

    #[test]
    fn test_record_size_is_field_sum() {
        let mut arena = Symbols::new();
        let mut fields = SymTable::new();
        let int = arena.int_type;
        let dbl = arena.double_type;
        let x = arena.add_symbol(Symbol {
            name: "x".into(),
            used: false,
            kind: SymbolKind::Var {
                ty: int,
                offset: 0,
                global: true,
                by_ref: false,
            },
        });
        let y = arena.add_symbol(Symbol {
            name: "y".into(),
            used: false,
            kind: SymbolKind::Var {
                ty: dbl,
                offset: 4,
                global: true,
                by_ref: false,
            },
        });
        fields.insert("x", x);
        fields.insert("y", y);
        let rec = arena.add_type(Ty::Record { fields });
        assert_eq!(arena.size_of(rec), 12);
        assert_eq!(arena.flat_count(rec), 3);
    }

    #[test]
    fn test_type_names() {
        let mut arena = Symbols::new();
        let int = arena.int_type;
        let arr = arena.add_type(Ty::Array { elem: int, len: 3 });
        let nested = arena.add_type(Ty::Array { elem: arr, len: 2 });
        assert_eq!(arena.type_name(int), "integer");
        assert_eq!(arena.type_name(nested), "array of array of integer");
    }
}
