//! Storage planning: struct/union field packing and the per-function local
//! storage planner.
//!
//! Laying out fields in a struct and laying out memory-resident locals in a
//! stack frame are the same packing problem, so both go through
//! [`StorageCalculator`]. The planner classifies each local: integral and
//! pointer scalars whose address is never taken live in virtual registers,
//! everything else (arrays, structs, address-taken scalars) gets a frame
//! offset.

use crate::{
    diagnostics::{CompileError, Result},
    frontend::ast::{Node, NodeKind},
    middle::{
        symtab::{StorageLocation, SymbolRef},
        ty::Type,
    },
};

/// Virtual register reserved for a function's return value.
pub const VREG_RETVAL: u32 = 0;
/// First virtual register used for passing arguments.
pub const VREG_FIRST_ARG: u32 = 1;
/// Last virtual register used for passing arguments (at most 9 parameters).
pub const VREG_LAST_ARG: u32 = 9;
/// First virtual register of the reserved temporary range (10-15).
pub const VREG_FIRST_TEMP: u32 = 10;
/// First virtual register available for register-resident locals.
pub const VREG_FIRST_LOCAL: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Struct,
    Union,
}

/// Bytes of padding needed to bring `offset` up to `align`.
fn pad(offset: u32, align: u32) -> u32 {
    assert!(align.is_power_of_two());
    let misalignment = offset & (align - 1);
    if misalignment == 0 {
        0
    } else {
        align - misalignment
    }
}

#[derive(Debug)]
pub struct StorageCalculator {
    mode: StorageMode,
    size: u32,
    align: u32,
    finished: bool,
}

impl StorageCalculator {
    pub fn new(mode: StorageMode) -> Self {
        Self {
            mode,
            size: 0,
            align: 0,
            finished: false,
        }
    }

    /// Add a field of the given type, returning its storage offset.
    pub fn add_field(&mut self, ty: &Type) -> u32 {
        let size = ty.storage_size();
        let align = ty.alignment();

        // the largest field alignment becomes the overall alignment
        if align > self.align {
            self.align = align;
        }

        match self.mode {
            StorageMode::Struct => {
                self.size += pad(self.size, align);
                let field_offset = self.size;
                self.size += size;
                field_offset
            }
            StorageMode::Union => {
                if size > self.size {
                    self.size = size;
                }
                0
            }
        }
    }

    /// Call after all fields have been added; pads the total size up to the
    /// overall alignment.
    pub fn finish(&mut self) {
        if self.align == 0 {
            // no fields: size 0, alignment 1
            assert_eq!(self.size, 0);
            self.align = 1;
        } else if self.mode == StorageMode::Struct {
            self.size += pad(self.size, self.align);
        }

        assert!(self.align.is_power_of_two());
        assert_eq!(self.size % self.align, 0);
        self.finished = true;
    }

    pub fn size(&self) -> u32 {
        assert!(self.finished);
        self.size
    }

    pub fn align(&self) -> u32 {
        assert!(self.finished);
        self.align
    }
}

/// Per-function storage planner. Parameters take vregs 1..=9; locals that can
/// live in registers are numbered from 16 up; everything else is packed into
/// the frame's locals region.
#[derive(Debug)]
pub struct LocalStorageAllocation {
    calc: StorageCalculator,
    next_vreg: u32,
}

impl LocalStorageAllocation {
    pub fn new() -> Self {
        Self {
            calc: StorageCalculator::new(StorageMode::Struct),
            next_vreg: VREG_FIRST_LOCAL,
        }
    }

    /// Run on one function definition node (already analyzed). On return,
    /// every local symbol has storage assigned and the function symbol
    /// records the locals-region size.
    pub fn allocate_function(mut self, func: &Node) -> Result<()> {
        assert_eq!(func.kind, NodeKind::FunctionDefinition);

        let params = func.kid(3);
        for (i, param) in params.kids.iter().enumerate() {
            let number = VREG_FIRST_ARG + i as u32;
            if number > VREG_LAST_ARG {
                return Err(CompileError::semantic(
                    param.loc.clone(),
                    format!(
                        "function '{}' has more than {} parameters",
                        func.str(),
                        VREG_LAST_ARG
                    ),
                ));
            }
            let symbol = param.symbol();
            let mut symbol = symbol.borrow_mut();
            if self.needs_memory(&symbol.ty, symbol.address_taken) {
                symbol.on_stack = true;
                symbol.storage = StorageLocation::FrameOffset(self.calc.add_field(&symbol.ty));
            } else {
                symbol.storage = StorageLocation::Vreg(number);
            }
        }

        self.visit_statement(func.kid(4));

        self.calc.finish();
        let fn_symbol = func.symbol();
        fn_symbol.borrow_mut().frame_size = self.calc.size();
        fn_symbol.borrow_mut().vreg_limit = self.next_vreg;
        Ok(())
    }

    fn needs_memory(&self, ty: &Type, address_taken: bool) -> bool {
        !(ty.is_integral() || ty.is_pointer()) || address_taken
    }

    fn visit_statement(&mut self, n: &Node) {
        match n.kind {
            NodeKind::VariableDeclaration => {
                for declarator in &n.kid(1).kids {
                    self.allocate_local(declarator.symbol());
                }
            }
            NodeKind::StatementList => {
                for kid in &n.kids {
                    self.visit_statement(kid);
                }
            }
            NodeKind::WhileStatement | NodeKind::IfStatement => self.visit_statement(n.kid(1)),
            NodeKind::DoWhileStatement => self.visit_statement(n.kid(0)),
            NodeKind::ForStatement => self.visit_statement(n.kid(3)),
            NodeKind::IfElseStatement => {
                self.visit_statement(n.kid(1));
                self.visit_statement(n.kid(2));
            }
            _ => {}
        }
    }

    fn allocate_local(&mut self, symbol: SymbolRef) {
        let mut symbol = symbol.borrow_mut();
        if self.needs_memory(&symbol.ty, symbol.address_taken) {
            if symbol.ty.is_struct() {
                symbol.ty.layout_struct();
            }
            symbol.on_stack = true;
            symbol.storage = StorageLocation::FrameOffset(self.calc.add_field(&symbol.ty));
        } else {
            symbol.storage = StorageLocation::Vreg(self.next_vreg);
            self.next_vreg += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::ty::{BasicTypeKind, Type};

    fn int() -> std::rc::Rc<Type> {
        Type::basic(BasicTypeKind::Int, true)
    }

    #[test]
    fn struct_mode_packs_with_padding() {
        let mut calc = StorageCalculator::new(StorageMode::Struct);
        assert_eq!(calc.add_field(&Type::basic(BasicTypeKind::Char, true)), 0);
        assert_eq!(calc.add_field(&int()), 4);
        assert_eq!(calc.add_field(&Type::basic(BasicTypeKind::Char, true)), 8);
        calc.finish();
        assert_eq!(calc.size(), 12);
        assert_eq!(calc.align(), 4);
    }

    #[test]
    fn union_mode_overlays_fields() {
        let mut calc = StorageCalculator::new(StorageMode::Union);
        assert_eq!(calc.add_field(&int()), 0);
        assert_eq!(calc.add_field(&Type::basic(BasicTypeKind::Long, true)), 0);
        assert_eq!(calc.add_field(&Type::basic(BasicTypeKind::Char, true)), 0);
        calc.finish();
        assert_eq!(calc.size(), 8);
        assert_eq!(calc.align(), 8);
    }

    #[test]
    fn empty_struct_is_size_zero_align_one() {
        let mut calc = StorageCalculator::new(StorageMode::Struct);
        calc.finish();
        assert_eq!(calc.size(), 0);
        assert_eq!(calc.align(), 1);
    }

    #[test]
    fn size_is_multiple_of_alignment() {
        let mut calc = StorageCalculator::new(StorageMode::Struct);
        calc.add_field(&Type::basic(BasicTypeKind::Long, true));
        calc.add_field(&Type::basic(BasicTypeKind::Char, true));
        calc.finish();
        assert_eq!(calc.size() % calc.align(), 0);
        assert_eq!(calc.size(), 16);
    }

    mod planner {
        use super::*;
        use crate::frontend::{SourceFile, SourceFileOrigin, ast::NodeKind, parser::Parser};
        use crate::middle::sema::SemanticAnalysis;
        use indoc::indoc;

        fn plan(source: &str) -> Node {
            let source = SourceFile {
                contents: source.to_owned(),
                origin: SourceFileOrigin::Memory,
            };
            let mut unit = Parser::parse_unit(&source).unwrap();
            let mut sema = SemanticAnalysis::new();
            sema.visit(&mut unit).unwrap();
            for item in &unit.kids {
                if item.kind == NodeKind::FunctionDefinition {
                    LocalStorageAllocation::new().allocate_function(item).unwrap();
                }
            }
            unit
        }

        fn local(unit: &Node, fn_index: usize, decl_index: usize) -> SymbolRef {
            unit.kid(fn_index).kid(4).kid(decl_index).kid(1).kid(0).symbol()
        }

        #[test]
        fn scalars_get_vregs_from_sixteen() {
            let unit = plan(indoc! {"
                int main(void) {
                    int a;
                    int *p;
                    return 0;
                }
            "});
            assert_eq!(local(&unit, 0, 0).borrow().storage, StorageLocation::Vreg(16));
            assert_eq!(local(&unit, 0, 1).borrow().storage, StorageLocation::Vreg(17));
        }

        #[test]
        fn parameters_get_argument_vregs() {
            let unit = plan("int add(int a, int b) { return a + b; }");
            let params = &unit.kid(0).kid(3).kids;
            assert_eq!(
                params[0].symbol().borrow().storage,
                StorageLocation::Vreg(1)
            );
            assert_eq!(
                params[1].symbol().borrow().storage,
                StorageLocation::Vreg(2)
            );
        }

        #[test]
        fn arrays_structs_and_address_taken_scalars_go_to_memory() {
            let unit = plan(indoc! {"
                struct P { int x; int y; };
                int main(void) {
                    int arr[3];
                    struct P p;
                    int x;
                    int *q;
                    q = &x;
                    return 0;
                }
            "});
            let arr = local(&unit, 1, 0);
            assert!(arr.borrow().on_stack);
            assert_eq!(arr.borrow().storage, StorageLocation::FrameOffset(0));

            let p = local(&unit, 1, 1);
            assert!(p.borrow().on_stack);
            assert_eq!(p.borrow().storage, StorageLocation::FrameOffset(12));

            let x = local(&unit, 1, 2);
            assert!(x.borrow().on_stack, "address-taken scalar lives in memory");
            assert_eq!(x.borrow().storage, StorageLocation::FrameOffset(20));

            // q itself is a plain scalar
            assert_eq!(local(&unit, 1, 3).borrow().storage, StorageLocation::Vreg(16));

            // frame size covers the packed locals, padded to the alignment
            let fn_symbol = unit.kid(1).symbol();
            assert_eq!(fn_symbol.borrow().frame_size, 24);
        }

        #[test]
        fn too_many_parameters_is_an_error() {
            let source = SourceFile {
                contents:
                    "int f(int a, int b, int c, int d, int e, int g, int h, int i, int j, int k) { return 0; }"
                        .to_owned(),
                origin: SourceFileOrigin::Memory,
            };
            let mut unit = Parser::parse_unit(&source).unwrap();
            let mut sema = SemanticAnalysis::new();
            sema.visit(&mut unit).unwrap();
            let result = LocalStorageAllocation::new().allocate_function(unit.kid(0));
            assert!(result.is_err());
        }
    }
}
