//! Control-flow graphs over instruction sequences.
//!
//! The builder partitions a linear instruction sequence into basic blocks
//! joined by fall-through or branch edges, with a distinguished empty entry
//! and exit block. Flattening produces a linear sequence again: in original
//! code order when every fall-through edge still connects adjacent blocks,
//! otherwise by grouping fall-through-connected blocks into chunks and
//! walking the graph from the entry.

use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::{
    index::{Index, IndexVec, simple_index},
    middle::{
        hir::{Instruction, InstructionSequence, OpcodeInfo},
        symtab::SymbolRef,
    },
};

simple_index! {
    /// Identifies a basic block within its CFG.
    pub struct BlockId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicBlockKind {
    Entry,
    Exit,
    Interior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// The target's first instruction follows the source's last instruction
    /// in the original sequence.
    FallThrough,
    /// The target is reached by a branch instruction.
    Branch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub kind: EdgeKind,
    pub source: BlockId,
    pub target: BlockId,
}

/// An instruction sequence in which only the last instruction can be a
/// branch.
#[derive(Debug)]
pub struct BasicBlock<O> {
    pub kind: BasicBlockKind,
    pub id: BlockId,
    pub label: Option<String>,
    /// Relative position of this block in the original sequence, used to
    /// preserve the original layout across transformations.
    pub code_order: i64,
    pub instructions: Vec<Instruction<O>>,
}

#[derive(Debug)]
pub struct ControlFlowGraph<O> {
    blocks: IndexVec<BlockId, BasicBlock<O>>,
    entry: BlockId,
    exit: BlockId,
    outgoing: HashMap<BlockId, Vec<Edge>>,
    incoming: HashMap<BlockId, Vec<Edge>>,
    pub fn_symbol: Option<SymbolRef>,
}

impl<O: OpcodeInfo> ControlFlowGraph<O> {
    pub fn new() -> Self {
        let mut blocks = IndexVec::new();
        let entry = blocks.push(BasicBlock {
            kind: BasicBlockKind::Entry,
            id: BlockId::new(0),
            label: None,
            code_order: -1,
            instructions: Vec::new(),
        });
        let exit = blocks.push(BasicBlock {
            kind: BasicBlockKind::Exit,
            id: BlockId::new(1),
            label: None,
            code_order: i64::MAX,
            instructions: Vec::new(),
        });
        Self {
            blocks,
            entry,
            exit,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            fn_symbol: None,
        }
    }

    pub fn entry_block(&self) -> BlockId {
        self.entry
    }

    pub fn exit_block(&self) -> BlockId {
        self.exit
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock<O> {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock<O> {
        &mut self.blocks[id]
    }

    /// Blocks in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock<O>> {
        self.blocks.iter()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.indices()
    }

    pub fn create_basic_block(
        &mut self,
        kind: BasicBlockKind,
        code_order: i64,
        label: Option<String>,
    ) -> BlockId {
        let id = self.blocks.next_index();
        self.blocks.push(BasicBlock {
            kind,
            id,
            label,
            code_order,
            instructions: Vec::new(),
        })
    }

    pub fn create_edge(&mut self, source: BlockId, target: BlockId, kind: EdgeKind) {
        assert!(
            self.lookup_edge(source, target).is_none(),
            "duplicate edge {source:?} -> {target:?}"
        );
        let edge = Edge {
            kind,
            source,
            target,
        };
        self.outgoing.entry(source).or_default().push(edge);
        self.incoming.entry(target).or_default().push(edge);
    }

    pub fn lookup_edge(&self, source: BlockId, target: BlockId) -> Option<&Edge> {
        self.outgoing
            .get(&source)?
            .iter()
            .find(|edge| edge.target == target)
    }

    pub fn outgoing_edges(&self, block: BlockId) -> &[Edge] {
        self.outgoing.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_edges(&self, block: BlockId) -> &[Edge] {
        self.incoming.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /* Flattening */

    /// Produce a linear instruction sequence. Uses the original block order
    /// whenever every fall-through edge connects a block to its successor in
    /// code order (so transformations that do not change edges preserve the
    /// exact original layout); otherwise reconstructs by chunks.
    pub fn create_instruction_sequence(&self) -> InstructionSequence<O> {
        let mut result = if self.can_use_original_block_order() {
            self.rebuild_instruction_sequence()
        } else {
            self.reconstruct_instruction_sequence()
        };
        result.fn_symbol = self.fn_symbol.clone();
        result
    }

    fn blocks_in_code_order(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.blocks.indices().collect();
        ids.sort_by_key(|&id| self.blocks[id].code_order);
        ids
    }

    fn can_use_original_block_order(&self) -> bool {
        let order = self.blocks_in_code_order();
        for pair in order.windows(2) {
            let (current, next) = (pair[0], pair[1]);
            for edge in self.outgoing_edges(current) {
                if edge.kind == EdgeKind::FallThrough && edge.target != next {
                    return false;
                }
            }
        }
        true
    }

    fn rebuild_instruction_sequence(&self) -> InstructionSequence<O> {
        let mut result = InstructionSequence::new();
        for id in self.blocks_in_code_order() {
            self.append_basic_block(&mut result, id);
        }
        result
    }

    fn append_basic_block(&self, iseq: &mut InstructionSequence<O>, id: BlockId) {
        let block = &self.blocks[id];
        if let Some(label) = &block.label {
            iseq.define_label(label.clone());
        }
        for instruction in &block.instructions {
            iseq.append(instruction.clone());
        }
    }

    /// Reconstruction for graphs whose control flow no longer matches the
    /// original layout. Blocks connected by fall-through edges form chunks
    /// that must be emitted contiguously; the chunk containing the exit
    /// block is deferred to the end.
    fn reconstruct_instruction_sequence(&self) -> InstructionSequence<O> {
        // group fall-through-connected blocks into chunks
        let mut chunks: Vec<Vec<BlockId>> = Vec::new();
        let mut chunk_of: HashMap<BlockId, usize> = HashMap::new();

        for id in self.blocks.indices() {
            for edge in self.outgoing_edges(id) {
                if edge.kind != EdgeKind::FallThrough {
                    continue;
                }
                let (pred, succ) = (edge.source, edge.target);
                match (chunk_of.get(&pred).copied(), chunk_of.get(&succ).copied()) {
                    (None, None) => {
                        chunks.push(vec![pred, succ]);
                        chunk_of.insert(pred, chunks.len() - 1);
                        chunk_of.insert(succ, chunks.len() - 1);
                    }
                    (None, Some(c)) => {
                        assert_eq!(chunks[c].first(), Some(&succ));
                        chunks[c].insert(0, pred);
                        chunk_of.insert(pred, c);
                    }
                    (Some(c), None) => {
                        assert_eq!(chunks[c].last(), Some(&pred));
                        chunks[c].push(succ);
                        chunk_of.insert(succ, c);
                    }
                    (Some(a), Some(b)) if a != b => {
                        let merged: Vec<BlockId> =
                            chunks[a].iter().chain(chunks[b].iter()).copied().collect();
                        for &block in &merged {
                            chunk_of.insert(block, a);
                        }
                        chunks[b].clear();
                        chunks[a] = merged;
                    }
                    (Some(_), Some(_)) => {}
                }
            }
        }

        let mut result = InstructionSequence::new();
        let mut finished = vec![false; self.blocks.len()];
        let mut exit_chunk: Option<usize> = None;

        let mut work_list = VecDeque::new();
        work_list.push_back(self.entry);

        while let Some(id) = work_list.pop_front() {
            if finished[id.index()] {
                continue;
            }

            if let Some(&chunk) = chunk_of.get(&id) {
                let is_exit_chunk = chunks[chunk]
                    .iter()
                    .any(|&b| self.blocks[b].kind == BasicBlockKind::Exit);
                if is_exit_chunk {
                    exit_chunk = Some(chunk);
                }
                for &block in &chunks[chunk] {
                    if is_exit_chunk {
                        // defer the instructions, but do find the successors
                        finished[block.index()] = true;
                    } else {
                        self.append_basic_block(&mut result, block);
                        finished[block.index()] = true;
                    }
                    for edge in self.outgoing_edges(block) {
                        work_list.push_back(edge.target);
                    }
                }
            } else {
                self.append_basic_block(&mut result, id);
                finished[id.index()] = true;
                for edge in self.outgoing_edges(id) {
                    work_list.push_back(edge.target);
                }
            }
        }

        if let Some(chunk) = exit_chunk {
            for &block in &chunks[chunk] {
                self.append_basic_block(&mut result, block);
            }
        }

        result
    }
}

impl<O: OpcodeInfo> Default for ControlFlowGraph<O> {
    fn default() -> Self {
        Self::new()
    }
}

/* Builder */

struct WorkItem {
    ins_index: usize,
    pred: BlockId,
    edge_kind: EdgeKind,
    label: Option<String>,
}

/// Build a CFG from a linear instruction sequence. The per-IR opcode
/// properties (`is_function_call`, `falls_through`) come from [`OpcodeInfo`].
pub fn build_cfg<O: OpcodeInfo>(iseq: &InstructionSequence<O>) -> ControlFlowGraph<O> {
    let mut cfg = ControlFlowGraph::new();
    cfg.fn_symbol = iseq.fn_symbol.clone();
    let num_instructions = iseq.len();

    // map of instruction index to the block starting at that index; a branch
    // that targets the end of the sequence targets the exit block
    let mut block_at: HashMap<usize, BlockId> = HashMap::new();
    block_at.insert(num_instructions, cfg.exit_block());

    let mut work_list = VecDeque::new();
    work_list.push_back(WorkItem {
        ins_index: 0,
        pred: cfg.entry_block(),
        edge_kind: EdgeKind::FallThrough,
        label: None,
    });

    let mut last: Option<BlockId> = None;

    while let Some(item) = work_list.pop_front() {
        assert!(item.ins_index <= num_instructions);

        if item.ins_index == num_instructions {
            let exit = cfg.exit_block();
            cfg.create_edge(item.pred, exit, item.edge_kind);
            continue;
        }

        let (bb, is_new_block) = match block_at.get(&item.ins_index) {
            Some(&bb) => {
                // first discovered by fall-through, now also reached by a
                // branch: it may not be labeled yet
                if item.edge_kind == EdgeKind::Branch && cfg.block(bb).label.is_none() {
                    cfg.block_mut(bb).label = item.label.clone();
                }
                (bb, false)
            }
            None => {
                let bb = scan_basic_block(&mut cfg, iseq, item.ins_index, item.label.clone());
                block_at.insert(item.ins_index, bb);
                (bb, true)
            }
        };

        debug_assert!(
            item.edge_kind != EdgeKind::Branch || cfg.block(bb).label == item.label,
            "block reached via two different labels"
        );

        cfg.create_edge(item.pred, bb, item.edge_kind);

        if !is_new_block {
            continue;
        }

        let last_ins = cfg.block(bb).instructions.last().unwrap();
        let ends_in_branch = last_ins.is_branch();
        let falls_through = last_ins.opcode.falls_through();

        if ends_in_branch {
            let target_label = last_ins.operands.last().unwrap().label().to_owned();
            let target_index = iseq
                .index_of_labeled_instruction(&target_label)
                .unwrap_or_else(|| panic!("branch to unknown label {target_label}"));
            work_list.push_back(WorkItem {
                ins_index: target_index,
                pred: bb,
                edge_kind: EdgeKind::Branch,
                label: Some(target_label),
            });
        }

        if falls_through {
            let target_index = item.ins_index + cfg.block(bb).instructions.len();
            assert!(target_index <= num_instructions);
            if target_index == num_instructions {
                // the block at the end of the sequence falls through to exit
                last = Some(bb);
            } else {
                work_list.push_back(WorkItem {
                    ins_index: target_index,
                    pred: bb,
                    edge_kind: EdgeKind::FallThrough,
                    label: None,
                });
            }
        }
    }

    if let Some(last) = last {
        let exit = cfg.exit_block();
        cfg.create_edge(last, exit, EdgeKind::FallThrough);
    }

    cfg
}

/// Scan instructions into a new block until reaching a branch, a call, the
/// end of the sequence, or an instruction that carries a label (and thus
/// begins a different block).
fn scan_basic_block<O: OpcodeInfo>(
    cfg: &mut ControlFlowGraph<O>,
    iseq: &InstructionSequence<O>,
    start: usize,
    label: Option<String>,
) -> BlockId {
    let bb = cfg.create_basic_block(BasicBlockKind::Interior, start as i64, label);

    let mut index = start;
    while index < iseq.len() {
        let instruction = iseq.get(index).clone();
        let opcode = instruction.opcode;
        let is_branch = instruction.is_branch();
        cfg.block_mut(bb).instructions.push(instruction);
        index += 1;

        if index >= iseq.len() {
            break;
        }
        if opcode.is_function_call() || is_branch {
            break;
        }
        if iseq.has_label_at(index) {
            break;
        }
    }

    assert!(!cfg.block(bb).instructions.is_empty());
    bb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::hir::{HighLevelOpcode as Op, Operand, ins};

    /// i = 0; while (i < 10) i = i + 1; return i
    fn loop_sequence() -> InstructionSequence<Op> {
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::ImmIval(0)],
        ));
        seq.append(ins(Op::Jmp, vec![Operand::Label(".L1".to_owned())]));
        seq.define_label(".L0");
        seq.append(ins(
            Op::AddL,
            vec![Operand::Vreg(16), Operand::Vreg(16), Operand::ImmIval(1)],
        ));
        seq.define_label(".L1");
        seq.append(ins(
            Op::CmpltL,
            vec![Operand::Vreg(17), Operand::Vreg(16), Operand::ImmIval(10)],
        ));
        seq.append(ins(
            Op::CjmpT,
            vec![Operand::Vreg(17), Operand::Label(".L0".to_owned())],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::Vreg(16)],
        ));
        seq.append(ins(Op::Ret, vec![]));
        seq
    }

    fn reachable_from_entry<O: OpcodeInfo>(cfg: &ControlFlowGraph<O>) -> Vec<BlockId> {
        let mut seen = vec![false; cfg.num_blocks()];
        let mut work = vec![cfg.entry_block()];
        let mut order = Vec::new();
        while let Some(id) = work.pop() {
            if seen[id.index()] {
                continue;
            }
            seen[id.index()] = true;
            order.push(id);
            for edge in cfg.outgoing_edges(id) {
                work.push(edge.target);
            }
        }
        order
    }

    #[test]
    fn cfg_integrity() {
        let cfg = build_cfg(&loop_sequence());

        assert!(cfg.incoming_edges(cfg.entry_block()).is_empty());
        assert!(cfg.outgoing_edges(cfg.exit_block()).is_empty());

        // every block other than entry is reachable from entry
        let reachable = reachable_from_entry(&cfg);
        assert_eq!(reachable.len(), cfg.num_blocks());

        // every edge connects blocks of this CFG, at most one per pair
        for id in cfg.block_ids() {
            let edges = cfg.outgoing_edges(id);
            for (i, edge) in edges.iter().enumerate() {
                assert_eq!(edge.source, id);
                assert!(edge.target.index() < cfg.num_blocks());
                for later in &edges[i + 1..] {
                    assert_ne!(edge.target, later.target);
                }
            }
        }
    }

    #[test]
    fn loop_shape() {
        let cfg = build_cfg(&loop_sequence());
        // entry, exit, init block, body block, test block, tail block
        assert_eq!(cfg.num_blocks(), 6);

        let body = cfg
            .blocks()
            .find(|b| b.label.as_deref() == Some(".L0"))
            .unwrap();
        let test = cfg
            .blocks()
            .find(|b| b.label.as_deref() == Some(".L1"))
            .unwrap();

        // the test block branches back to the body and falls through to the
        // return tail
        let back = cfg.lookup_edge(test.id, body.id).unwrap();
        assert_eq!(back.kind, EdgeKind::Branch);
        let body_to_test = cfg.lookup_edge(body.id, test.id).unwrap();
        assert_eq!(body_to_test.kind, EdgeKind::FallThrough);
    }

    #[test]
    fn flatten_round_trip_preserves_labels_and_length() {
        let original = loop_sequence();
        let cfg = build_cfg(&original);
        let flattened = cfg.create_instruction_sequence();

        assert_eq!(flattened.len(), original.len());
        for index in 0..original.len() {
            assert_eq!(original.label_at(index), flattened.label_at(index));
            assert_eq!(original.get(index), flattened.get(index));
        }
    }

    #[test]
    fn flatten_uses_code_order_when_fall_throughs_are_adjacent() {
        let cfg = build_cfg(&loop_sequence());
        // untransformed graphs always qualify for the fast path
        assert!(cfg.can_use_original_block_order());
    }

    #[test]
    fn calls_end_basic_blocks() {
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(Op::Call, vec![Operand::Label("f".to_owned())]));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::Vreg(0)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let call_block = cfg
            .blocks()
            .find(|b| b.kind == BasicBlockKind::Interior && !b.instructions.is_empty())
            .unwrap();
        assert_eq!(call_block.instructions.len(), 1);
        assert_eq!(call_block.instructions[0].opcode, Op::Call);
    }
}
