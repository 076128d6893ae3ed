//! The type algebra: basic, qualified, pointer, array, struct, and function
//! types, shared by reference between symbols and AST nodes.
//!
//! Types are immutable once their member lists are finalised, with one
//! exception: struct member offsets and the overall struct size/alignment are
//! interior-mutable and written exactly once, when layout runs (triggered by
//! the storage planner or the first size query).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::middle::storage::{StorageCalculator, StorageMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BasicTypeKind {
    Char = 0,
    Short = 1,
    Int = 2,
    Long = 3,
    Void = 4,
}

impl BasicTypeKind {
    pub fn storage_size(self) -> u32 {
        match self {
            Self::Char => 1,
            Self::Short => 2,
            Self::Int => 4,
            Self::Long => 8,
            Self::Void => panic!("void has no storage size"),
        }
    }
}

impl core::fmt::Display for BasicTypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Char => "char",
            Self::Short => "short",
            Self::Int => "int",
            Self::Long => "long",
            Self::Void => "void",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeQualifier {
    Const,
    Volatile,
}

/// A named member of a struct type or a named parameter of a function type.
/// Struct member offsets are assigned when the owning struct is laid out.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub ty: Rc<Type>,
    offset: Rc<Cell<u32>>,
}

impl Member {
    pub fn new(name: impl Into<String>, ty: Rc<Type>) -> Self {
        Self {
            name: name.into(),
            ty,
            offset: Rc::new(Cell::new(0)),
        }
    }

    pub fn offset(&self) -> u32 {
        self.offset.get()
    }

    pub fn set_offset(&self, offset: u32) {
        self.offset.set(offset);
    }
}

#[derive(Debug)]
pub struct StructType {
    pub name: String,
    members: RefCell<Vec<Member>>,
    size: Cell<u32>,
    align: Cell<u32>,
    laid_out: Cell<bool>,
}

#[derive(Debug)]
pub enum Type {
    Basic {
        kind: BasicTypeKind,
        is_signed: bool,
    },
    Qualified {
        base: Rc<Type>,
        qualifier: TypeQualifier,
    },
    Pointer {
        base: Rc<Type>,
    },
    Array {
        base: Rc<Type>,
        length: u64,
    },
    Struct(StructType),
    Function {
        return_type: Rc<Type>,
        parameters: Vec<Member>,
    },
}

impl Type {
    pub fn basic(kind: BasicTypeKind, is_signed: bool) -> Rc<Type> {
        Rc::new(Type::Basic { kind, is_signed })
    }

    pub fn qualified(base: Rc<Type>, qualifier: TypeQualifier) -> Rc<Type> {
        Rc::new(Type::Qualified { base, qualifier })
    }

    pub fn pointer(base: Rc<Type>) -> Rc<Type> {
        Rc::new(Type::Pointer { base })
    }

    pub fn array(base: Rc<Type>, length: u64) -> Rc<Type> {
        Rc::new(Type::Array { base, length })
    }

    /// A struct type starts with no members so it can be entered into the
    /// symbol table before its fields are analyzed (self-reference through a
    /// pointer resolves by name lookup, not by a direct back-reference).
    pub fn struct_type(name: impl Into<String>) -> Rc<Type> {
        Rc::new(Type::Struct(StructType {
            name: name.into(),
            members: RefCell::new(Vec::new()),
            size: Cell::new(0),
            align: Cell::new(1),
            laid_out: Cell::new(false),
        }))
    }

    pub fn function(return_type: Rc<Type>, parameters: Vec<Member>) -> Rc<Type> {
        Rc::new(Type::Function {
            return_type,
            parameters,
        })
    }

    /* Predicates. All of these see through qualifiers. */

    pub fn unqualified(&self) -> &Type {
        match self {
            Type::Qualified { base, .. } => base.unqualified(),
            other => other,
        }
    }

    pub fn is_basic(&self) -> bool {
        matches!(self.unqualified(), Type::Basic { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(
            self.unqualified(),
            Type::Basic {
                kind: BasicTypeKind::Void,
                ..
            }
        )
    }

    pub fn is_integral(&self) -> bool {
        match self.unqualified() {
            Type::Basic { kind, .. } => *kind != BasicTypeKind::Void,
            _ => false,
        }
    }

    pub fn is_signed(&self) -> bool {
        match self.unqualified() {
            Type::Basic { is_signed, .. } => *is_signed,
            _ => false,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.unqualified(), Type::Pointer { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self.unqualified(), Type::Array { .. })
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.unqualified(), Type::Struct(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.unqualified(), Type::Function { .. })
    }

    pub fn is_const(&self) -> bool {
        match self {
            Type::Qualified { base, qualifier } => {
                *qualifier == TypeQualifier::Const || base.is_const()
            }
            _ => false,
        }
    }

    pub fn is_volatile(&self) -> bool {
        match self {
            Type::Qualified { base, qualifier } => {
                *qualifier == TypeQualifier::Volatile || base.is_volatile()
            }
            _ => false,
        }
    }

    pub fn basic_type_kind(&self) -> BasicTypeKind {
        match self.unqualified() {
            Type::Basic { kind, .. } => *kind,
            other => panic!("basic_type_kind on non-basic type {other}"),
        }
    }

    /// One layer in: pointee of a pointer, element of an array, return type
    /// of a function, inner type of a qualified type.
    pub fn base_type(&self) -> Rc<Type> {
        match self {
            Type::Qualified { base, .. }
            | Type::Pointer { base }
            | Type::Array { base, .. } => base.clone(),
            Type::Function { return_type, .. } => return_type.clone(),
            other => panic!("base_type on type {other} without a base"),
        }
    }

    pub fn array_length(&self) -> u64 {
        match self.unqualified() {
            Type::Array { length, .. } => *length,
            other => panic!("array_length on non-array type {other}"),
        }
    }

    /* Members */

    pub fn members(&self) -> Vec<Member> {
        match self.unqualified() {
            Type::Struct(s) => s.members.borrow().clone(),
            Type::Function { parameters, .. } => parameters.clone(),
            other => panic!("members on type {other} without members"),
        }
    }

    pub fn num_members(&self) -> usize {
        match self.unqualified() {
            Type::Struct(s) => s.members.borrow().len(),
            Type::Function { parameters, .. } => parameters.len(),
            other => panic!("num_members on type {other} without members"),
        }
    }

    /// Member lookup by name: struct field lookup and function parameter
    /// lookup share this.
    pub fn find_member(&self, name: &str) -> Option<Member> {
        match self.unqualified() {
            Type::Struct(s) => s.members.borrow().iter().find(|m| m.name == name).cloned(),
            Type::Function { parameters, .. } => {
                parameters.iter().find(|m| m.name == name).cloned()
            }
            _ => None,
        }
    }

    pub fn add_struct_member(&self, member: Member) {
        match self.unqualified() {
            Type::Struct(s) => {
                assert!(!s.laid_out.get(), "struct {} is already laid out", s.name);
                s.members.borrow_mut().push(member);
            }
            other => panic!("add_struct_member on non-struct type {other}"),
        }
    }

    pub fn struct_name(&self) -> &str {
        match self.unqualified() {
            Type::Struct(s) => &s.name,
            other => panic!("struct_name on non-struct type {other}"),
        }
    }

    /* Storage */

    /// Lay out the struct's members if this has not happened yet, writing
    /// each member's offset and the overall size and alignment.
    pub fn layout_struct(&self) {
        let Type::Struct(s) = self.unqualified() else {
            panic!("layout_struct on non-struct type {self}");
        };
        if s.laid_out.get() {
            return;
        }
        // mark first: a struct cannot contain itself by value, but lazy size
        // queries of *other* structs recurse through here
        s.laid_out.set(true);

        let mut calc = StorageCalculator::new(StorageMode::Struct);
        for member in s.members.borrow().iter() {
            member.set_offset(calc.add_field(&member.ty));
        }
        calc.finish();
        s.size.set(calc.size());
        s.align.set(calc.align());
    }

    pub fn storage_size(&self) -> u32 {
        match self.unqualified() {
            Type::Basic { kind, .. } => kind.storage_size(),
            Type::Pointer { .. } => 8,
            Type::Array { base, length } => base.storage_size() * (*length as u32),
            Type::Struct(s) => {
                self.layout_struct();
                s.size.get()
            }
            Type::Function { .. } => panic!("function types have no storage size"),
            Type::Qualified { .. } => unreachable!(),
        }
    }

    pub fn alignment(&self) -> u32 {
        match self.unqualified() {
            Type::Basic { kind, .. } => kind.storage_size(),
            Type::Pointer { .. } => 8,
            Type::Array { base, .. } => base.alignment(),
            Type::Struct(s) => {
                self.layout_struct();
                s.align.get()
            }
            Type::Function { .. } => panic!("function types have no alignment"),
            Type::Qualified { .. } => unreachable!(),
        }
    }

    /// Structural equality, ignoring qualifiers at every level. Structs
    /// compare by tag (tags are unique within a translation unit).
    pub fn is_same(&self, other: &Type) -> bool {
        match (self.unqualified(), other.unqualified()) {
            (
                Type::Basic {
                    kind: a,
                    is_signed: sa,
                },
                Type::Basic {
                    kind: b,
                    is_signed: sb,
                },
            ) => a == b && sa == sb,
            (Type::Pointer { base: a }, Type::Pointer { base: b }) => a.is_same(b),
            (
                Type::Array {
                    base: a,
                    length: la,
                },
                Type::Array {
                    base: b,
                    length: lb,
                },
            ) => la == lb && a.is_same(b),
            (Type::Struct(a), Type::Struct(b)) => a.name == b.name,
            (
                Type::Function {
                    return_type: ra,
                    parameters: pa,
                },
                Type::Function {
                    return_type: rb,
                    parameters: pb,
                },
            ) => {
                ra.is_same(rb)
                    && pa.len() == pb.len()
                    && pa.iter().zip(pb.iter()).all(|(a, b)| a.ty.is_same(&b.ty))
            }
            _ => false,
        }
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Basic { kind, is_signed } => {
                if !*is_signed {
                    write!(f, "unsigned ")?;
                }
                write!(f, "{kind}")
            }
            Type::Qualified { base, qualifier } => {
                let qualifier = match qualifier {
                    TypeQualifier::Const => "const",
                    TypeQualifier::Volatile => "volatile",
                };
                write!(f, "{qualifier} {base}")
            }
            Type::Pointer { base } => write!(f, "pointer to {base}"),
            Type::Array { base, length } => write!(f, "array of {length} x {base}"),
            Type::Struct(s) => write!(f, "struct {}", s.name),
            Type::Function {
                return_type,
                parameters,
            } => {
                write!(f, "function (")?;
                for (i, p) in parameters.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p.ty)?;
                }
                write!(f, ") returning {return_type}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int() -> Rc<Type> {
        Type::basic(BasicTypeKind::Int, true)
    }

    #[test]
    fn structural_equality_ignores_qualifiers() {
        let plain = int();
        let constant = Type::qualified(int(), TypeQualifier::Const);
        assert!(plain.is_same(&constant));
        assert!(constant.is_same(&plain));
        assert_eq!(plain.storage_size(), constant.storage_size());

        let ptr = Type::pointer(int());
        let ptr_to_const = Type::pointer(Type::qualified(int(), TypeQualifier::Volatile));
        assert!(ptr.is_same(&ptr_to_const));
    }

    #[test]
    fn signedness_and_kind_distinguish_basic_types() {
        assert!(!int().is_same(&Type::basic(BasicTypeKind::Int, false)));
        assert!(!int().is_same(&Type::basic(BasicTypeKind::Long, true)));
    }

    #[test]
    fn fixed_size_table() {
        assert_eq!(Type::basic(BasicTypeKind::Char, true).storage_size(), 1);
        assert_eq!(Type::basic(BasicTypeKind::Short, true).storage_size(), 2);
        assert_eq!(int().storage_size(), 4);
        assert_eq!(Type::basic(BasicTypeKind::Long, true).storage_size(), 8);
        assert_eq!(Type::pointer(int()).storage_size(), 8);
        assert_eq!(Type::pointer(int()).alignment(), 8);
    }

    #[test]
    fn array_size_scales_with_length() {
        let arr = Type::array(int(), 3);
        assert_eq!(arr.storage_size(), 12);
        assert_eq!(arr.alignment(), 4);
        assert_eq!(arr.array_length(), 3);
    }

    #[test]
    fn struct_layout_invariants() {
        // struct { char c; long l; short s; }
        let s = Type::struct_type("mixed");
        s.add_struct_member(Member::new("c", Type::basic(BasicTypeKind::Char, true)));
        s.add_struct_member(Member::new("l", Type::basic(BasicTypeKind::Long, true)));
        s.add_struct_member(Member::new("s", Type::basic(BasicTypeKind::Short, true)));
        s.layout_struct();

        let members = s.members();
        assert_eq!(members[0].offset(), 0);
        assert_eq!(members[1].offset(), 8);
        assert_eq!(members[2].offset(), 16);
        assert_eq!(s.alignment(), 8);
        // size is a multiple of alignment, offsets aligned and non-decreasing
        assert_eq!(s.storage_size() % s.alignment(), 0);
        assert_eq!(s.storage_size(), 24);
        let mut last = 0;
        for member in &members {
            assert_eq!(member.offset() % member.ty.alignment(), 0);
            assert!(member.offset() >= last);
            last = member.offset();
        }
    }

    #[test]
    fn member_lookup_by_name() {
        let s = Type::struct_type("point");
        s.add_struct_member(Member::new("x", int()));
        s.add_struct_member(Member::new("y", int()));
        s.layout_struct();
        assert_eq!(s.find_member("y").unwrap().offset(), 4);
        assert!(s.find_member("z").is_none());

        let f = Type::function(int(), vec![Member::new("n", int())]);
        assert!(f.find_member("n").is_some());
    }

    #[test]
    fn predicates_see_through_qualifiers() {
        let qualified_ptr = Type::qualified(Type::pointer(int()), TypeQualifier::Const);
        assert!(qualified_ptr.is_pointer());
        assert!(qualified_ptr.is_const());
        assert!(!qualified_ptr.is_volatile());
        assert!(!qualified_ptr.is_integral());
    }
}
