//! AST -> HIR lowering.
//!
//! Runs once per function definition. Every `return` jumps to a single
//! per-function return label; loops are lowered with the test at the bottom
//! (one branch per iteration); address arithmetic for arrays, structs, and
//! pointers is materialised as 64-bit operations on temporaries.
//!
//! The label counter is threaded across functions so labels never collide;
//! the temporary-vreg counter starts above the storage planner's last
//! assigned vreg and is saved/restored around each statement list.

use crate::{
    diagnostics::{CompileError, Result},
    frontend::{
        ast::{LiteralValue, Node, NodeKind},
        lexer::TokenKind,
    },
    middle::{
        hir::{
            HighLevelOpcode as Op, Instruction, InstructionSequence, Operand, ins, select_opcode,
            select_opcode_for_type,
        },
        storage::{VREG_FIRST_ARG, VREG_RETVAL},
        symtab::{StorageLocation, Symbol},
        ty::Type,
    },
};

/// Generated code for one function, plus its string-literal table (flushed
/// into module-level rodata by the driver).
pub struct FunctionCode {
    pub iseq: InstructionSequence<Op>,
    pub strings: Vec<(String, String)>,
}

pub struct HighLevelCodegen {
    next_label: u32,
    next_string: u32,

    // per-function state
    iseq: InstructionSequence<Op>,
    strings: Vec<(String, String)>,
    return_label: String,
    next_vreg: u32,
    max_vreg: u32,
}

impl HighLevelCodegen {
    pub fn new() -> Self {
        Self {
            next_label: 0,
            next_string: 0,
            iseq: InstructionSequence::new(),
            strings: Vec::new(),
            return_label: String::new(),
            next_vreg: 0,
            max_vreg: 0,
        }
    }

    pub fn generate_function(&mut self, func: &mut Node) -> Result<FunctionCode> {
        assert_eq!(func.kind, NodeKind::FunctionDefinition);
        let fn_symbol = func.symbol();
        let fn_name = func.str().to_owned();
        let frame_size = fn_symbol.borrow().frame_size;

        self.iseq = InstructionSequence::new();
        self.strings = Vec::new();
        self.return_label = format!(".L{fn_name}_return");
        self.next_vreg = fn_symbol.borrow().vreg_limit;
        self.max_vreg = self.next_vreg;

        self.emit(ins(Op::Enter, vec![Operand::ImmIval(frame_size as i64)]));
        self.spill_memory_parameters(func)?;
        self.visit_statement(func.kid_mut(4))?;

        self.define_label(self.return_label.clone());
        self.emit(ins(Op::Leave, vec![Operand::ImmIval(frame_size as i64)]));
        self.emit(ins(Op::Ret, vec![]));

        fn_symbol.borrow_mut().vreg_limit = self.max_vreg;
        let mut iseq = std::mem::take(&mut self.iseq);
        iseq.fn_symbol = Some(fn_symbol);

        Ok(FunctionCode {
            iseq,
            strings: std::mem::take(&mut self.strings),
        })
    }

    /// Parameters arrive in argument vregs; the ones the planner put in
    /// memory (address-taken) are stored to their frame slots on entry.
    fn spill_memory_parameters(&mut self, func: &Node) -> Result<()> {
        for (i, param) in func.kid(3).kids.iter().enumerate() {
            let symbol = param.symbol();
            let symbol = symbol.borrow();
            let Some(offset) = symbol.frame_offset() else {
                continue;
            };
            if symbol.ty.is_struct() {
                return Err(CompileError::internal(
                    "struct parameters passed by value are not supported",
                ));
            }
            let addr = self.next_temp();
            self.emit(ins(
                Op::Localaddr,
                vec![Operand::Vreg(addr), Operand::ImmIval(offset as i64)],
            ));
            let mov = select_opcode_for_type(Op::MovB, &symbol.ty)?;
            self.emit(ins(
                mov,
                vec![
                    Operand::VregMem(addr),
                    Operand::Vreg(VREG_FIRST_ARG + i as u32),
                ],
            ));
        }
        Ok(())
    }

    fn emit(&mut self, instruction: Instruction<Op>) {
        self.iseq.append(instruction);
    }

    /// A label can land on an empty body (for example `while (c);`), in
    /// which case the previous pending label needs an instruction to attach
    /// to.
    fn define_label(&mut self, label: String) {
        if self.iseq.has_pending_label() {
            self.emit(ins(Op::Nop, vec![]));
        }
        self.iseq.define_label(label);
    }

    fn next_label(&mut self) -> String {
        let label = format!(".L{}", self.next_label);
        self.next_label += 1;
        label
    }

    fn next_temp(&mut self) -> u32 {
        let vreg = self.next_vreg;
        self.next_vreg += 1;
        if self.next_vreg > self.max_vreg {
            self.max_vreg = self.next_vreg;
        }
        vreg
    }

    /* Statements */

    fn visit_statement(&mut self, n: &mut Node) -> Result<()> {
        match n.kind {
            NodeKind::StatementList => {
                // temporaries are released on block exit
                let saved = self.next_vreg;
                for kid in &mut n.kids {
                    self.visit_statement(kid)?;
                }
                self.next_vreg = saved;
                Ok(())
            }
            NodeKind::EmptyStatement => Ok(()),
            NodeKind::VariableDeclaration => {
                // storage is already planned; only initializers emit code
                for declarator in &mut n.kid_mut(1).kids {
                    let Some(init_index) = declarator.declarator_initializer_index() else {
                        continue;
                    };
                    let symbol = declarator.symbol();
                    let ty = declarator.ty();
                    let value = self.visit_expression(declarator.kid_mut(init_index))?;
                    let dest = self.operand_for_symbol(&symbol.borrow())?;
                    if ty.is_struct() {
                        self.emit_block_copy(&dest, &value, ty.storage_size())?;
                    } else {
                        let mov = select_opcode_for_type(Op::MovB, &ty)?;
                        self.emit(ins(mov, vec![dest, value]));
                    }
                }
                Ok(())
            }
            NodeKind::ExpressionStatement => {
                self.visit_expression(n.kid_mut(0))?;
                Ok(())
            }
            NodeKind::ReturnStatement => {
                self.emit(ins(Op::Jmp, vec![Operand::Label(self.return_label.clone())]));
                Ok(())
            }
            NodeKind::ReturnExpressionStatement => {
                let value = self.visit_expression(n.kid_mut(0))?;
                let mov = select_opcode_for_type(Op::MovB, &n.kid(0).ty())?;
                self.emit(ins(mov, vec![Operand::Vreg(VREG_RETVAL), value]));
                self.emit(ins(Op::Jmp, vec![Operand::Label(self.return_label.clone())]));
                Ok(())
            }
            NodeKind::WhileStatement => {
                let top_label = self.next_label();
                let cmp_label = self.next_label();

                self.emit(ins(Op::Jmp, vec![Operand::Label(cmp_label.clone())]));
                self.define_label(top_label.clone());
                self.visit_statement(n.kid_mut(1))?;
                self.define_label(cmp_label);
                let condition = self.visit_expression(n.kid_mut(0))?;
                self.emit(ins(
                    Op::CjmpT,
                    vec![condition, Operand::Label(top_label)],
                ));
                Ok(())
            }
            NodeKind::DoWhileStatement => {
                let top_label = self.next_label();
                self.define_label(top_label.clone());
                self.visit_statement(n.kid_mut(0))?;
                let condition = self.visit_expression(n.kid_mut(1))?;
                self.emit(ins(
                    Op::CjmpT,
                    vec![condition, Operand::Label(top_label)],
                ));
                Ok(())
            }
            NodeKind::ForStatement => {
                let body_label = self.next_label();
                let cmp_label = self.next_label();

                self.visit_statement(n.kid_mut(0))?;
                self.emit(ins(Op::Jmp, vec![Operand::Label(cmp_label.clone())]));
                self.define_label(body_label.clone());
                self.visit_statement(n.kid_mut(3))?;
                self.visit_statement(n.kid_mut(2))?;
                self.define_label(cmp_label);
                if n.kid(1).kind == NodeKind::EmptyStatement {
                    self.emit(ins(Op::Jmp, vec![Operand::Label(body_label)]));
                } else {
                    let condition = self.visit_expression(n.kid_mut(1).kid_mut(0))?;
                    self.emit(ins(
                        Op::CjmpT,
                        vec![condition, Operand::Label(body_label)],
                    ));
                }
                Ok(())
            }
            NodeKind::IfStatement => {
                let skip_label = self.next_label();
                let condition = self.visit_expression(n.kid_mut(0))?;
                self.emit(ins(
                    Op::CjmpF,
                    vec![condition, Operand::Label(skip_label.clone())],
                ));
                self.visit_statement(n.kid_mut(1))?;
                self.define_label(skip_label);
                Ok(())
            }
            NodeKind::IfElseStatement => {
                let else_label = self.next_label();
                let end_label = self.next_label();

                let condition = self.visit_expression(n.kid_mut(0))?;
                self.emit(ins(
                    Op::CjmpF,
                    vec![condition, Operand::Label(else_label.clone())],
                ));
                self.visit_statement(n.kid_mut(1))?;
                self.emit(ins(Op::Jmp, vec![Operand::Label(end_label.clone())]));
                self.define_label(else_label);
                self.visit_statement(n.kid_mut(2))?;
                self.define_label(end_label);
                Ok(())
            }
            // a bare expression can appear in statement position inside a
            // `for` header; anything else is a bug upstream
            _ => {
                self.visit_expression(n)?;
                Ok(())
            }
        }
    }

    /* Expressions */

    fn visit_expression(&mut self, n: &mut Node) -> Result<Operand> {
        let operand = match n.kind {
            NodeKind::BinaryExpression => self.visit_binary_expression(n)?,
            NodeKind::UnaryExpression => self.visit_unary_expression(n)?,
            NodeKind::ImplicitConversion => self.visit_implicit_conversion(n)?,
            NodeKind::FunctionCallExpression => self.visit_function_call(n)?,
            NodeKind::ArrayElementRefExpression => self.visit_array_element_ref(n)?,
            NodeKind::FieldRefExpression => self.visit_field_ref(n)?,
            NodeKind::IndirectFieldRefExpression => self.visit_indirect_field_ref(n)?,
            NodeKind::VariableRef => self.visit_variable_ref(n)?,
            NodeKind::LiteralValue => self.visit_literal_value(n)?,
            other => {
                return Err(CompileError::internal(format!(
                    "unexpected expression node {other} in code generation"
                )));
            }
        };
        n.set_operand(operand.clone());
        Ok(operand)
    }

    fn visit_binary_expression(&mut self, n: &mut Node) -> Result<Operand> {
        let op = n.kid(0).token_kind();

        if op == TokenKind::Equals {
            return self.visit_assignment(n);
        }

        let lhs = self.visit_expression(n.kid_mut(1))?;
        let rhs = self.visit_expression(n.kid_mut(2))?;

        let base = match op {
            TokenKind::Plus => Op::AddB,
            TokenKind::Minus => Op::SubB,
            TokenKind::Asterisk => Op::MulB,
            TokenKind::Divide => Op::DivB,
            TokenKind::Modulus => Op::ModB,
            TokenKind::LessThan => Op::CmpltB,
            TokenKind::LessThanOrEqualTo => Op::CmplteB,
            TokenKind::GreaterThan => Op::CmpgtB,
            TokenKind::GreaterThanOrEqualTo => Op::CmpgteB,
            TokenKind::DoubleEquals => Op::CmpeqB,
            TokenKind::NotEquals => Op::CmpneqB,
            TokenKind::LogicalAnd => Op::AndB,
            TokenKind::LogicalOr => Op::OrB,
            other => {
                return Err(CompileError::internal(format!(
                    "unexpected binary operator {other:?} in code generation"
                )));
            }
        };

        // pointer +/- integer scales the integer by the element size
        let lhs_ty = n.kid(1).ty();
        if matches!(op, TokenKind::Plus | TokenKind::Minus)
            && (lhs_ty.is_pointer() || lhs_ty.is_array())
        {
            let element_size = lhs_ty.base_type().storage_size();
            let index = self.widen_index_to_quad(rhs, &n.kid(2).ty());
            let scaled = self.next_temp();
            self.emit(ins(
                Op::MulQ,
                vec![
                    Operand::Vreg(scaled),
                    index,
                    Operand::ImmIval(element_size as i64),
                ],
            ));
            let dest = self.next_temp();
            let opcode = if op == TokenKind::Plus { Op::AddQ } else { Op::SubQ };
            self.emit(ins(
                opcode,
                vec![Operand::Vreg(dest), lhs, Operand::Vreg(scaled)],
            ));
            return Ok(Operand::Vreg(dest));
        }

        let opcode = select_opcode_for_type(base, &n.kid(1).ty())?;
        let dest = self.next_temp();
        self.emit(ins(opcode, vec![Operand::Vreg(dest), lhs, rhs]));
        Ok(Operand::Vreg(dest))
    }

    fn visit_assignment(&mut self, n: &mut Node) -> Result<Operand> {
        let lhs = self.visit_expression(n.kid_mut(1))?;
        let rhs = self.visit_expression(n.kid_mut(2))?;

        let lhs_ty = n.kid(1).ty();
        if lhs_ty.is_struct() {
            let size = lhs_ty.storage_size();
            self.emit_block_copy(&lhs, &rhs, size)?;
            return Ok(lhs);
        }

        let mov = select_opcode_for_type(Op::MovB, &lhs_ty)?;
        self.emit(ins(mov, vec![lhs.clone(), rhs]));
        Ok(lhs)
    }

    /// Copy `size` bytes between two in-memory objects whose addresses are
    /// held in the base registers of the given operands, in 8/4/2/1-byte
    /// chunks through a temporary.
    fn emit_block_copy(&mut self, dst: &Operand, src: &Operand, size: u32) -> Result<()> {
        let (Some(dst_base), Some(src_base)) = (dst.base_vreg(), src.base_vreg()) else {
            return Err(CompileError::internal(
                "block copy operands must be address-based",
            ));
        };

        let mut offset: i64 = 0;
        let mut remaining = size;
        for chunk in [8u32, 4, 2, 1] {
            while remaining >= chunk {
                let mov = select_opcode(Op::MovB, chunk);
                let tmp = self.next_temp();
                self.emit(ins(
                    mov,
                    vec![
                        Operand::Vreg(tmp),
                        Operand::VregMemOff {
                            base: src_base,
                            offset,
                        },
                    ],
                ));
                self.emit(ins(
                    mov,
                    vec![
                        Operand::VregMemOff {
                            base: dst_base,
                            offset,
                        },
                        Operand::Vreg(tmp),
                    ],
                ));
                offset += chunk as i64;
                remaining -= chunk;
            }
        }
        Ok(())
    }

    fn visit_unary_expression(&mut self, n: &mut Node) -> Result<Operand> {
        let op = n.kid(0).token_kind();
        let operand = self.visit_expression(n.kid_mut(1))?;

        match op {
            TokenKind::Ampersand => {
                // the operand of & is in memory; its operand is either the
                // address itself or a memory reference through the address
                match operand {
                    Operand::VregMem(base) => Ok(Operand::Vreg(base)),
                    Operand::Vreg(_) => Ok(operand),
                    other => Err(CompileError::internal(format!(
                        "cannot take the address of operand {other:?}"
                    ))),
                }
            }
            TokenKind::Asterisk => {
                let pointer = self.load_if_memref(operand);
                Ok(pointer.to_memref())
            }
            TokenKind::Minus => {
                let opcode = select_opcode_for_type(Op::SubB, &n.ty())?;
                let dest = self.next_temp();
                self.emit(ins(
                    opcode,
                    vec![Operand::Vreg(dest), Operand::ImmIval(0), operand],
                ));
                Ok(Operand::Vreg(dest))
            }
            other => Err(CompileError::internal(format!(
                "unexpected unary operator {other:?} in code generation"
            ))),
        }
    }

    fn visit_implicit_conversion(&mut self, n: &mut Node) -> Result<Operand> {
        let operand = self.visit_expression(n.kid_mut(0))?;
        let src = n.kid(0).ty();
        let dst = n.ty();

        let src_size = src.storage_size();
        let dst_size = dst.storage_size();

        if dst_size == src_size {
            return Ok(operand);
        }

        let dest = self.next_temp();
        if dst_size < src_size {
            // narrowing is a plain move at the destination width
            let mov = select_opcode(Op::MovB, dst_size);
            self.emit(ins(mov, vec![Operand::Vreg(dest), operand]));
        } else {
            let opcode = widening_conversion(src.is_signed(), src_size, dst_size)?;
            self.emit(ins(opcode, vec![Operand::Vreg(dest), operand]));
        }
        Ok(Operand::Vreg(dest))
    }

    fn visit_function_call(&mut self, n: &mut Node) -> Result<Operand> {
        let name = n.kid(0).str().to_owned();
        let return_type = n.ty();

        // evaluate all arguments before loading the argument registers
        let mut args = Vec::new();
        for arg in &mut n.kid_mut(1).kids {
            let operand = self.visit_expression(arg)?;
            args.push((operand, arg.ty()));
        }

        for (i, (operand, ty)) in args.into_iter().enumerate() {
            let mov = select_opcode_for_type(Op::MovB, &ty)?;
            self.emit(ins(
                mov,
                vec![Operand::Vreg(VREG_FIRST_ARG + i as u32), operand],
            ));
        }

        self.emit(ins(Op::Call, vec![Operand::Label(name)]));

        if return_type.is_void() {
            return Ok(Operand::Vreg(VREG_RETVAL));
        }

        // save the result before another call can clobber vr0
        let mov = select_opcode_for_type(Op::MovB, &return_type)?;
        let dest = self.next_temp();
        self.emit(ins(mov, vec![Operand::Vreg(dest), Operand::Vreg(VREG_RETVAL)]));
        Ok(Operand::Vreg(dest))
    }

    fn visit_array_element_ref(&mut self, n: &mut Node) -> Result<Operand> {
        let base = self.visit_expression(n.kid_mut(0))?;
        let base = self.load_if_memref(base);

        let index = self.visit_expression(n.kid_mut(1))?;
        let index_ty = n.kid(1).ty();
        let index = self.widen_index_to_quad(index, &index_ty);

        let element_size = n.ty().storage_size();
        let scaled = self.next_temp();
        self.emit(ins(
            Op::MulQ,
            vec![
                Operand::Vreg(scaled),
                index,
                Operand::ImmIval(element_size as i64),
            ],
        ));

        let address = self.next_temp();
        self.emit(ins(
            Op::AddQ,
            vec![Operand::Vreg(address), base, Operand::Vreg(scaled)],
        ));

        Ok(self.value_operand_for_address(address, &n.ty()))
    }

    fn visit_field_ref(&mut self, n: &mut Node) -> Result<Operand> {
        let object = self.visit_expression(n.kid_mut(0))?;
        let Some(base) = object.base_vreg() else {
            return Err(CompileError::internal(
                "field reference base has no address register",
            ));
        };

        let object_ty = n.kid(0).ty();
        let member = object_ty
            .find_member(n.kid(1).str())
            .expect("analyzer verified the member exists");

        let address = self.next_temp();
        self.emit(ins(
            Op::AddQ,
            vec![
                Operand::Vreg(address),
                Operand::Vreg(base),
                Operand::ImmIval(member.offset() as i64),
            ],
        ));
        Ok(self.value_operand_for_address(address, &member.ty))
    }

    fn visit_indirect_field_ref(&mut self, n: &mut Node) -> Result<Operand> {
        let pointer = self.visit_expression(n.kid_mut(0))?;
        let pointer = self.load_if_memref(pointer);

        let pointee = n.kid(0).ty().base_type();
        let member = pointee
            .find_member(n.kid(1).str())
            .expect("analyzer verified the member exists");

        let address = self.next_temp();
        self.emit(ins(
            Op::AddQ,
            vec![
                Operand::Vreg(address),
                pointer,
                Operand::ImmIval(member.offset() as i64),
            ],
        ));
        Ok(self.value_operand_for_address(address, &member.ty))
    }

    fn visit_variable_ref(&mut self, n: &mut Node) -> Result<Operand> {
        let symbol = n.symbol();
        let symbol = symbol.borrow();
        self.operand_for_symbol(&symbol)
    }

    fn operand_for_symbol(&mut self, symbol: &Symbol) -> Result<Operand> {
        match symbol.storage {
            StorageLocation::Vreg(vreg) => Ok(Operand::Vreg(vreg)),
            StorageLocation::FrameOffset(offset) => {
                let address = self.next_temp();
                self.emit(ins(
                    Op::Localaddr,
                    vec![Operand::Vreg(address), Operand::ImmIval(offset as i64)],
                ));
                Ok(self.value_operand_for_address(address, &symbol.ty))
            }
            StorageLocation::Unassigned => {
                // a global: its label is the address
                let address = self.next_temp();
                self.emit(ins(
                    Op::MovQ,
                    vec![
                        Operand::Vreg(address),
                        Operand::ImmLabel(symbol.name.clone()),
                    ],
                ));
                Ok(self.value_operand_for_address(address, &symbol.ty))
            }
        }
    }

    fn visit_literal_value(&mut self, n: &mut Node) -> Result<Operand> {
        let literal = n.literal.clone().expect("literal node carries a value");
        match literal {
            LiteralValue::String(text) => {
                let name = format!("str{}", self.next_string);
                self.next_string += 1;
                self.strings.push((name.clone(), text));
                Ok(Operand::ImmLabel(name))
            }
            other => Ok(Operand::ImmIval(other.int_value())),
        }
    }

    /* Helpers */

    /// Arrays and structs are used by address; scalars through a memory
    /// reference.
    fn value_operand_for_address(&self, address: u32, ty: &Type) -> Operand {
        if ty.is_array() || ty.is_struct() {
            Operand::Vreg(address)
        } else {
            Operand::VregMem(address)
        }
    }

    /// Load a value held behind a memory reference into a fresh temporary
    /// (pointers stored in memory must be loaded before they can be used as
    /// base addresses).
    fn load_if_memref(&mut self, operand: Operand) -> Operand {
        if !operand.is_memref() {
            return operand;
        }
        let tmp = self.next_temp();
        self.emit(ins(Op::MovQ, vec![Operand::Vreg(tmp), operand]));
        Operand::Vreg(tmp)
    }

    /// Sign-extend (or move) an index value into a 64-bit temporary for
    /// address arithmetic.
    fn widen_index_to_quad(&mut self, operand: Operand, ty: &Type) -> Operand {
        if operand.is_imm_ival() {
            return operand;
        }
        let size = ty.storage_size();
        if size == 8 {
            return operand;
        }
        let opcode = widening_conversion(true, size, 8).expect("index widening");
        let dest = self.next_temp();
        self.emit(ins(opcode, vec![Operand::Vreg(dest), operand]));
        Operand::Vreg(dest)
    }
}

impl Default for HighLevelCodegen {
    fn default() -> Self {
        Self::new()
    }
}

fn widening_conversion(is_signed: bool, src_size: u32, dst_size: u32) -> Result<Op> {
    let opcode = match (is_signed, src_size, dst_size) {
        (true, 1, 2) => Op::SconvBw,
        (true, 1, 4) => Op::SconvBl,
        (true, 1, 8) => Op::SconvBq,
        (true, 2, 4) => Op::SconvWl,
        (true, 2, 8) => Op::SconvWq,
        (true, 4, 8) => Op::SconvLq,
        (false, 1, 2) => Op::UconvBw,
        (false, 1, 4) => Op::UconvBl,
        (false, 1, 8) => Op::UconvBq,
        (false, 2, 4) => Op::UconvWl,
        (false, 2, 8) => Op::UconvWq,
        (false, 4, 8) => Op::UconvLq,
        _ => {
            return Err(CompileError::internal(format!(
                "unsupported conversion from {src_size} to {dst_size} bytes"
            )));
        }
    };
    Ok(opcode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{SourceFile, SourceFileOrigin, parser::Parser};
    use crate::middle::{sema::SemanticAnalysis, storage::LocalStorageAllocation};
    use indoc::indoc;

    /// Parse, analyze, plan storage, and generate HIR for every function.
    fn compile(source: &str) -> Vec<FunctionCode> {
        let source = SourceFile {
            contents: source.to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut unit = Parser::parse_unit(&source).unwrap();
        let mut sema = SemanticAnalysis::new();
        sema.visit(&mut unit).unwrap();

        let mut codegen = HighLevelCodegen::new();
        let mut functions = Vec::new();
        for item in &mut unit.kids {
            if item.kind == NodeKind::FunctionDefinition {
                LocalStorageAllocation::new().allocate_function(item).unwrap();
                functions.push(codegen.generate_function(item).unwrap());
            }
        }
        functions
    }

    fn opcodes(code: &FunctionCode) -> Vec<Op> {
        code.iseq.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn function_has_one_enter_leave_ret() {
        let code = compile(indoc! {"
            int sum(int n) {
                int s;
                int i;
                s = 0;
                for (i = 1; i <= n; i = i + 1) s = s + i;
                return s;
            }
        "});
        let ops = opcodes(&code[0]);
        assert_eq!(ops.iter().filter(|&&op| op == Op::Enter).count(), 1);
        assert_eq!(ops.iter().filter(|&&op| op == Op::Leave).count(), 1);
        assert_eq!(ops.iter().filter(|&&op| op == Op::Ret).count(), 1);
    }

    #[test]
    fn return_moves_value_to_vr0() {
        let code = compile("int main(void) { return 0; }");
        let mov = code[0]
            .iseq
            .iter()
            .find(|i| i.opcode == Op::MovL)
            .expect("return emits a move");
        assert_eq!(*mov.operand(0), Operand::Vreg(0));
        assert_eq!(*mov.operand(1), Operand::ImmIval(0));
    }

    #[test]
    fn while_loop_tests_at_the_bottom() {
        let code = compile(indoc! {"
            int main(void) {
                int i;
                i = 0;
                while (i < 10) i = i + 1;
                return i;
            }
        "});
        let ops = opcodes(&code[0]);
        // an unconditional entry jump, one conditional jump at the bottom
        let jmp = ops.iter().position(|&op| op == Op::Jmp).unwrap();
        let cjmp = ops.iter().position(|&op| op == Op::CjmpT).unwrap();
        assert!(jmp < cjmp);
        let cmp = ops.iter().position(|&op| op == Op::CmpltL).unwrap();
        assert_eq!(cmp + 1, cjmp, "comparison feeds the bottom test directly");
    }

    #[test]
    fn address_taken_local_uses_localaddr() {
        let code = compile(indoc! {"
            int f(int *p) { *p = 11; return 0; }
            int main(void) {
                int x;
                f(&x);
                return x;
            }
        "});
        let main = &code[1];
        assert!(opcodes(main).contains(&Op::Localaddr));
    }

    #[test]
    fn array_element_store_scales_index() {
        let code = compile(indoc! {"
            int main(void) {
                int arr[3];
                arr[2] = 9;
                return arr[2];
            }
        "});
        let ops = opcodes(&code[0]);
        assert!(ops.contains(&Op::Localaddr));
        assert!(ops.contains(&Op::MulQ));
        assert!(ops.contains(&Op::AddQ));
        // the element store goes through a memory reference
        let store = code[0]
            .iseq
            .iter()
            .find(|i| i.opcode == Op::MovL && i.operand(0).is_memref())
            .expect("indexed store");
        assert_eq!(*store.operand(1), Operand::ImmIval(9));
    }

    #[test]
    fn small_operands_are_promoted() {
        let code = compile(indoc! {"
            int main(void) {
                char c;
                int x;
                c = 'a';
                x = c + 1;
                return x;
            }
        "});
        let ops = opcodes(&code[0]);
        assert!(ops.contains(&Op::SconvBl), "char promotes to int");
        assert!(ops.contains(&Op::AddL));
    }

    #[test]
    fn call_loads_argument_vregs_in_order() {
        let code = compile(indoc! {"
            int add(int a, int b) { return a + b; }
            int main(void) { return add(2, 3); }
        "});
        let main = &code[1];
        let moves: Vec<_> = main
            .iseq
            .iter()
            .filter(|i| i.opcode == Op::MovL && matches!(i.operand(0), Operand::Vreg(1 | 2)))
            .collect();
        assert_eq!(moves.len(), 2);
        assert_eq!(*moves[0].operand(0), Operand::Vreg(1));
        assert_eq!(*moves[1].operand(0), Operand::Vreg(2));
        assert!(opcodes(main).contains(&Op::Call));
    }

    #[test]
    fn string_literals_accumulate_with_global_numbering() {
        let code = compile(indoc! {"
            char *a(void) { return \"one\"; }
            char *b(void) { return \"two\"; }
        "});
        assert_eq!(code[0].strings, vec![("str0".to_owned(), "one".to_owned())]);
        assert_eq!(code[1].strings, vec![("str1".to_owned(), "two".to_owned())]);
    }

    #[test]
    fn labels_do_not_collide_across_functions() {
        let code = compile(indoc! {"
            int f(void) { int i; i = 0; while (i < 3) i = i + 1; return i; }
            int g(void) { int i; i = 0; while (i < 3) i = i + 1; return i; }
        "});
        let labels = |c: &FunctionCode| -> Vec<String> {
            c.iseq
                .iter_with_labels()
                .filter_map(|(l, _)| l.map(str::to_owned))
                .collect()
        };
        let f_labels = labels(&code[0]);
        let g_labels = labels(&code[1]);
        for label in &f_labels {
            if label.starts_with(".L") && !label.contains("_return") {
                assert!(!g_labels.contains(label));
            }
        }
    }

    #[test]
    fn struct_field_access_adds_member_offset() {
        let code = compile(indoc! {"
            struct P { int x; int y; };
            int main(void) {
                struct P p;
                p.x = 3;
                p.y = 4;
                return p.x + p.y;
            }
        "});
        let adds: Vec<_> = code[0]
            .iseq
            .iter()
            .filter(|i| i.opcode == Op::AddQ)
            .map(|i| i.operand(2).clone())
            .collect();
        assert!(adds.contains(&Operand::ImmIval(0)), "offset of x");
        assert!(adds.contains(&Operand::ImmIval(4)), "offset of y");
    }
}
