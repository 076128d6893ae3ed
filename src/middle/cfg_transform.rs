//! CFG transformation passes: dead-store elimination (guided by liveness),
//! constant propagation, and copy propagation.
//!
//! Each pass produces a new CFG and leaves its input intact. The shared
//! framework copies every block through a per-block hook, preserves each
//! block's code order, and re-adds the original edges between the mapped
//! blocks.

use hashbrown::HashMap;

use crate::middle::{
    cfg::{BasicBlock, BasicBlockKind, BlockId, ControlFlowGraph},
    hir::{HighLevelOpcode, Instruction, Operand, OpcodeInfo, is_def},
    live_vregs::LiveVregs,
    storage::VREG_FIRST_TEMP,
};

pub trait BasicBlockTransform<O> {
    /// Produce the transformed instructions of one basic block.
    fn transform_basic_block(&mut self, block: &BasicBlock<O>) -> Vec<Instruction<O>>;
}

pub fn transform_cfg<O: OpcodeInfo, T: BasicBlockTransform<O>>(
    cfg: &ControlFlowGraph<O>,
    transform: &mut T,
) -> ControlFlowGraph<O> {
    let mut result: ControlFlowGraph<O> = ControlFlowGraph::new();
    result.fn_symbol = cfg.fn_symbol.clone();

    // map blocks of the original CFG to blocks of the transformed CFG; the
    // code order of each original block is preserved so the result can be
    // flattened in the original layout
    let mut block_map: HashMap<BlockId, BlockId> = HashMap::new();
    for block in cfg.blocks() {
        let mapped = match block.kind {
            BasicBlockKind::Entry => result.entry_block(),
            BasicBlockKind::Exit => result.exit_block(),
            BasicBlockKind::Interior => {
                let id = result.create_basic_block(
                    BasicBlockKind::Interior,
                    block.code_order,
                    block.label.clone(),
                );
                result.block_mut(id).instructions = transform.transform_basic_block(block);
                id
            }
        };
        block_map.insert(block.id, mapped);
    }

    for block in cfg.blocks() {
        for edge in cfg.outgoing_edges(block.id) {
            result.create_edge(block_map[&edge.source], block_map[&edge.target], edge.kind);
        }
    }

    result
}

/* Dead-store elimination */

/// Argument and return vregs have implicit uses (at call sites and returns)
/// that liveness cannot observe, so their defs are always preserved.
fn is_arg_or_retval(vreg: u32) -> bool {
    vreg < VREG_FIRST_TEMP
}

pub struct DeadStoreElimination<'a, 'cfg> {
    liveness: &'a LiveVregs<'cfg>,
}

impl<'a, 'cfg> DeadStoreElimination<'a, 'cfg> {
    pub fn new(liveness: &'a LiveVregs<'cfg>) -> Self {
        Self { liveness }
    }
}

impl BasicBlockTransform<HighLevelOpcode> for DeadStoreElimination<'_, '_> {
    fn transform_basic_block(
        &mut self,
        block: &BasicBlock<HighLevelOpcode>,
    ) -> Vec<Instruction<HighLevelOpcode>> {
        let mut result = Vec::new();

        for (index, instruction) in block.instructions.iter().enumerate() {
            let mut keep = true;

            if is_def(instruction) {
                let dest = instruction
                    .operand(0)
                    .base_vreg()
                    .expect("def destinations are vregs");
                let live_after = self.liveness.fact_after_instruction(block.id, index);
                if !live_after.test(dest) && !is_arg_or_retval(dest) {
                    keep = false;
                }
            }

            if keep {
                result.push(instruction.clone());
            }
        }

        // a block must keep at least one instruction so its label still has
        // somewhere to attach when the CFG is flattened
        if result.is_empty() && !block.instructions.is_empty() {
            result.push(Instruction::new(HighLevelOpcode::Nop, vec![]));
        }

        result
    }
}

/* Local constant propagation */

#[derive(Default)]
pub struct ConstantPropagation;

impl ConstantPropagation {
    pub fn new() -> Self {
        Self
    }
}

impl BasicBlockTransform<HighLevelOpcode> for ConstantPropagation {
    fn transform_basic_block(
        &mut self,
        block: &BasicBlock<HighLevelOpcode>,
    ) -> Vec<Instruction<HighLevelOpcode>> {
        // vreg -> known constant, within this block only
        let mut constants: HashMap<u32, i64> = HashMap::new();
        let mut result = Vec::new();

        for instruction in &block.instructions {
            let mut instruction = instruction.clone();

            rewrite_source_operands(&mut instruction, |operand| {
                if let Operand::Vreg(vreg) = operand {
                    if let Some(&value) = constants.get(vreg) {
                        *operand = Operand::ImmIval(value);
                    }
                }
            });

            // arithmetic over two known constants becomes an immediate move
            if let Some(folded) = fold_constant_operation(&instruction) {
                instruction = folded;
            }

            if instruction.opcode.is_function_call() {
                constants.retain(|&vreg, _| !is_arg_or_retval(vreg));
            } else if is_def(&instruction) {
                let dest = instruction.operand(0).base_vreg().unwrap();
                let is_immediate_move = instruction
                    .opcode
                    .in_family(HighLevelOpcode::MovB)
                    && instruction.operand(1).is_imm_ival();
                if is_immediate_move {
                    constants.insert(dest, instruction.operand(1).imm_ival());
                } else {
                    constants.remove(&dest);
                }
            }

            result.push(instruction);
        }

        result
    }
}

/* Local copy propagation */

#[derive(Default)]
pub struct CopyPropagation;

impl CopyPropagation {
    pub fn new() -> Self {
        Self
    }
}

impl BasicBlockTransform<HighLevelOpcode> for CopyPropagation {
    fn transform_basic_block(
        &mut self,
        block: &BasicBlock<HighLevelOpcode>,
    ) -> Vec<Instruction<HighLevelOpcode>> {
        // vreg -> vreg holding the same value, within this block only
        let mut copies: HashMap<u32, u32> = HashMap::new();
        let mut result = Vec::new();

        for instruction in &block.instructions {
            let mut instruction = instruction.clone();

            rewrite_source_operands(&mut instruction, |operand| {
                if let Operand::Vreg(vreg) = operand {
                    if let Some(&source) = copies.get(vreg) {
                        *operand = Operand::Vreg(source);
                    }
                }
            });

            if instruction.opcode.is_function_call() {
                // calls clobber the argument and return vregs
                copies.retain(|&vreg, &mut source| {
                    !is_arg_or_retval(vreg) && !is_arg_or_retval(source)
                });
            } else if is_def(&instruction) {
                let dest = instruction.operand(0).base_vreg().unwrap();
                copies.remove(&dest);
                copies.retain(|_, &mut source| source != dest);

                let is_register_move = instruction
                    .opcode
                    .in_family(HighLevelOpcode::MovB)
                    && matches!(instruction.operand(1), Operand::Vreg(_));
                if is_register_move {
                    let source = instruction.operand(1).base_vreg().unwrap();
                    if source != dest {
                        copies.insert(dest, source);
                    }
                }
            }

            result.push(instruction);
        }

        result
    }
}

/// Statically evaluate a three-operand instruction whose sources are both
/// immediates, producing the equivalent immediate move.
fn fold_constant_operation(
    instruction: &Instruction<HighLevelOpcode>,
) -> Option<Instruction<HighLevelOpcode>> {
    use crate::middle::hir::{ins, select_opcode};

    if !is_def(instruction) || instruction.num_operands() != 3 {
        return None;
    }
    let (Operand::ImmIval(left), Operand::ImmIval(right)) =
        (instruction.operand(1), instruction.operand(2))
    else {
        return None;
    };
    let (left, right) = (*left, *right);

    let families: [(HighLevelOpcode, fn(i64, i64) -> Option<i64>); 13] = [
        (HighLevelOpcode::AddB, |a, b| Some(a.wrapping_add(b))),
        (HighLevelOpcode::SubB, |a, b| Some(a.wrapping_sub(b))),
        (HighLevelOpcode::MulB, |a, b| Some(a.wrapping_mul(b))),
        (HighLevelOpcode::DivB, |a, b| a.checked_div(b)),
        (HighLevelOpcode::ModB, |a, b| a.checked_rem(b)),
        (HighLevelOpcode::AndB, |a, b| Some(a & b)),
        (HighLevelOpcode::OrB, |a, b| Some(a | b)),
        (HighLevelOpcode::CmpltB, |a, b| Some((a < b) as i64)),
        (HighLevelOpcode::CmplteB, |a, b| Some((a <= b) as i64)),
        (HighLevelOpcode::CmpgtB, |a, b| Some((a > b) as i64)),
        (HighLevelOpcode::CmpgteB, |a, b| Some((a >= b) as i64)),
        (HighLevelOpcode::CmpeqB, |a, b| Some((a == b) as i64)),
        (HighLevelOpcode::CmpneqB, |a, b| Some((a != b) as i64)),
    ];

    for (base, eval) in families {
        if instruction.opcode.in_family(base) {
            let value = eval(left, right)?;
            let size = instruction.opcode.dest_operand_size();
            return Some(ins(
                select_opcode(HighLevelOpcode::MovB, size),
                vec![instruction.operand(0).clone(), Operand::ImmIval(value)],
            ));
        }
    }
    None
}

/// Apply `rewrite` to every operand in a source position: all operands of an
/// instruction without a destination, and operands 1.. otherwise. The
/// destination slot is never rewritten (a memory-reference destination keeps
/// its base register).
fn rewrite_source_operands(
    instruction: &mut Instruction<HighLevelOpcode>,
    mut rewrite: impl FnMut(&mut Operand),
) {
    let first_source = usize::from(instruction.opcode.has_dest_operand());
    for operand in instruction.operands.iter_mut().skip(first_source) {
        rewrite(operand);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        cfg::build_cfg,
        hir::{HighLevelOpcode as Op, InstructionSequence, ins},
        live_vregs::LiveVregsAnalysis,
    };

    fn instructions_of(cfg: &ControlFlowGraph<Op>) -> Vec<Vec<Instruction<Op>>> {
        cfg.blocks().map(|b| b.instructions.clone()).collect()
    }

    #[test]
    fn dead_store_is_dropped() {
        // vr17 is written and never read; vr16 flows to the return value
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::ImmIval(1)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(17), Operand::ImmIval(2)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::Vreg(16)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let mut liveness = LiveVregs::new(LiveVregsAnalysis, &cfg);
        liveness.execute();

        let result = transform_cfg(&cfg, &mut DeadStoreElimination::new(&liveness));
        let all: Vec<Instruction<Op>> = instructions_of(&result).concat();
        assert_eq!(all.len(), 3);
        assert!(
            !all.iter()
                .any(|i| i.operand(0) == &Operand::Vreg(17) && is_def(i))
        );
    }

    #[test]
    fn dead_store_keeps_stores_and_retval_defs() {
        // a store through memory and a vr0 def are never dropped
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::VregMem(16), Operand::ImmIval(7)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::ImmIval(0)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let mut liveness = LiveVregs::new(LiveVregsAnalysis, &cfg);
        liveness.execute();

        let result = transform_cfg(&cfg, &mut DeadStoreElimination::new(&liveness));
        assert_eq!(instructions_of(&result).concat().len(), 3);
    }

    #[test]
    fn constants_propagate_within_a_block() {
        // vr16 = 14; vr0 = vr16  =>  vr0 = 14
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::ImmIval(14)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::Vreg(16)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let result = transform_cfg(&cfg, &mut ConstantPropagation::new());
        let all = instructions_of(&result).concat();
        assert_eq!(*all[1].operand(1), Operand::ImmIval(14));
    }

    #[test]
    fn non_immediate_def_invalidates_the_constant() {
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::ImmIval(1)],
        ));
        seq.append(ins(
            Op::AddL,
            vec![Operand::Vreg(16), Operand::Vreg(17), Operand::Vreg(18)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::Vreg(16)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let result = transform_cfg(&cfg, &mut ConstantPropagation::new());
        let all = instructions_of(&result).concat();
        // the redefinition killed the mapping, so the final move still reads
        // the vreg
        assert_eq!(*all[2].operand(1), Operand::Vreg(16));
    }

    #[test]
    fn constant_propagation_is_idempotent() {
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::ImmIval(2)],
        ));
        seq.append(ins(
            Op::AddL,
            vec![Operand::Vreg(17), Operand::Vreg(16), Operand::ImmIval(3)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::Vreg(17)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let once = transform_cfg(&cfg, &mut ConstantPropagation::new());
        let twice = transform_cfg(&once, &mut ConstantPropagation::new());
        assert_eq!(instructions_of(&once), instructions_of(&twice));
    }

    #[test]
    fn copies_propagate_and_calls_clobber() {
        // vr17 = vr16; vr1 = vr17; call f; vr18 = vr17
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(17), Operand::Vreg(16)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(1), Operand::Vreg(17)],
        ));
        seq.append(ins(Op::Call, vec![Operand::Label("f".to_owned())]));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(18), Operand::Vreg(17)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let result = transform_cfg(&cfg, &mut CopyPropagation::new());
        let all = instructions_of(&result).concat();

        // vr17 reads become vr16 (the copy survives the call because neither
        // side is an argument register)
        assert_eq!(*all[1].operand(1), Operand::Vreg(16));
        assert_eq!(*all[3].operand(1), Operand::Vreg(16));
    }

    #[test]
    fn copy_mapping_dies_when_source_is_redefined() {
        // vr17 = vr16; vr16 = 9; vr0 = vr17  (vr17 must NOT become vr16)
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(17), Operand::Vreg(16)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::ImmIval(9)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::Vreg(17)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let result = transform_cfg(&cfg, &mut CopyPropagation::new());
        let all = instructions_of(&result).concat();
        assert_eq!(*all[2].operand(1), Operand::Vreg(17));
    }

    #[test]
    fn optimization_folds_constant_expression_before_return() {
        use crate::frontend::{SourceFile, SourceFileOrigin, ast::NodeKind, parser::Parser};
        use crate::middle::{
            hir_codegen::HighLevelCodegen, sema::SemanticAnalysis,
            storage::LocalStorageAllocation,
        };

        let source = SourceFile {
            contents: "int main(void) { int a; a = 2 + 3 * 4; return a; }".to_owned(),
            origin: SourceFileOrigin::Memory,
        };
        let mut unit = Parser::parse_unit(&source).unwrap();
        SemanticAnalysis::new().visit(&mut unit).unwrap();

        let main = &mut unit.kids[0];
        assert_eq!(main.kind, NodeKind::FunctionDefinition);
        LocalStorageAllocation::new().allocate_function(main).unwrap();
        let code = HighLevelCodegen::new().generate_function(main).unwrap();

        let cfg = build_cfg(&code.iseq);
        let cfg = transform_cfg(&cfg, &mut ConstantPropagation::new());
        let cfg = transform_cfg(&cfg, &mut CopyPropagation::new());
        let cfg = {
            let mut liveness = LiveVregs::new(LiveVregsAnalysis, &cfg);
            liveness.execute();
            transform_cfg(&cfg, &mut DeadStoreElimination::new(&liveness))
        };
        let optimized = cfg.create_instruction_sequence();

        // the return value is the folded immediate, and the multiply is gone
        let retval_move = optimized
            .iter()
            .find(|i| i.opcode == Op::MovL && *i.operand(0) == Operand::Vreg(0))
            .expect("return value move");
        assert_eq!(*retval_move.operand(1), Operand::ImmIval(14));
        assert!(!optimized.iter().any(|i| i.opcode == Op::MulL));
    }

    #[test]
    fn transform_preserves_edges_and_labels() {
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::CjmpF,
            vec![Operand::Vreg(16), Operand::Label(".L0".to_owned())],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(17), Operand::ImmIval(1)],
        ));
        seq.define_label(".L0");
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let result = transform_cfg(&cfg, &mut ConstantPropagation::new());

        assert_eq!(result.num_blocks(), cfg.num_blocks());
        assert!(
            result
                .blocks()
                .any(|b| b.label.as_deref() == Some(".L0"))
        );
        // edge multiset is preserved block-for-block
        for (old, new) in cfg.blocks().zip(result.blocks()) {
            assert_eq!(
                cfg.outgoing_edges(old.id).len(),
                result.outgoing_edges(new.id).len()
            );
        }
    }
}
