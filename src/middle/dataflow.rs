//! Generic dataflow framework: a worklist fixpoint over a user-supplied
//! semilattice and transfer function, parameterised by direction.
//!
//! "Logical" order follows the analysis direction: for a backward analysis
//! the logical beginning of a block is its program-order end, and logical
//! predecessors are its control-flow successors. Facts are stored at the
//! program-order beginning and end of every block; per-instruction facts are
//! recovered by replaying the block's transfer from its logical begin fact.

use crate::{
    index::{Index, IndexVec},
    middle::{
        cfg::{BlockId, ControlFlowGraph},
        hir::{Instruction, OpcodeInfo},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

pub trait DataflowAnalysis<O> {
    /// A lattice element.
    type Fact: Clone + PartialEq;

    const DIRECTION: Direction;

    /// The value that combines non-destructively with any known fact.
    fn top_fact(&self) -> Self::Fact;

    /// Meet operator: commutative, idempotent, absorbing.
    fn combine_facts(&self, left: &Self::Fact, right: &Self::Fact) -> Self::Fact;

    /// Transfer function for one instruction, applied in analysis order.
    fn model_instruction(&self, instruction: &Instruction<O>, fact: &mut Self::Fact);

    fn fact_to_string(&self, fact: &Self::Fact) -> String;
}

pub struct Dataflow<'cfg, O, A: DataflowAnalysis<O>> {
    analysis: A,
    cfg: &'cfg ControlFlowGraph<O>,
    begin_facts: IndexVec<BlockId, A::Fact>,
    end_facts: IndexVec<BlockId, A::Fact>,
    iter_order: Vec<BlockId>,
}

impl<'cfg, O: OpcodeInfo, A: DataflowAnalysis<O>> Dataflow<'cfg, O, A> {
    pub fn new(analysis: A, cfg: &'cfg ControlFlowGraph<O>) -> Self {
        let mut begin_facts = IndexVec::new();
        let mut end_facts = IndexVec::new();
        for _ in 0..cfg.num_blocks() {
            begin_facts.push(analysis.top_fact());
            end_facts.push(analysis.top_fact());
        }
        Self {
            analysis,
            cfg,
            begin_facts,
            end_facts,
            iter_order: Vec::new(),
        }
    }

    pub fn analysis(&self) -> &A {
        &self.analysis
    }

    /// Run to a fixpoint.
    pub fn execute(&mut self) {
        self.compute_iter_order();

        loop {
            let mut change = false;

            for i in 0..self.iter_order.len() {
                let id = self.iter_order[i];

                // meet of the logical predecessors' logical end facts
                let mut fact = self.analysis.top_fact();
                for pred in self.logical_predecessors(id) {
                    fact = self
                        .analysis
                        .combine_facts(&fact, &self.logical_end_facts()[pred]);
                }

                *self.logical_begin_fact_mut(id) = fact.clone();

                for instruction in self.instructions_in_analysis_order(id) {
                    self.analysis.model_instruction(instruction, &mut fact);
                }

                if fact != self.logical_end_facts()[id] {
                    change = true;
                    *self.logical_end_fact_mut(id) = fact;
                }
            }

            if !change {
                break;
            }
        }
    }

    /* Queries (program order) */

    pub fn fact_at_beginning_of_block(&self, block: BlockId) -> &A::Fact {
        &self.begin_facts[block]
    }

    pub fn fact_at_end_of_block(&self, block: BlockId) -> &A::Fact {
        &self.end_facts[block]
    }

    /// Fact after the instruction at `index` of `block`, in program order.
    pub fn fact_after_instruction(&self, block: BlockId, index: usize) -> A::Fact {
        self.instruction_fact(block, index, A::DIRECTION == Direction::Forward)
    }

    /// Fact before the instruction at `index` of `block`, in program order.
    pub fn fact_before_instruction(&self, block: BlockId, index: usize) -> A::Fact {
        self.instruction_fact(block, index, A::DIRECTION == Direction::Backward)
    }

    pub fn fact_to_string(&self, fact: &A::Fact) -> String {
        self.analysis.fact_to_string(fact)
    }

    /* Logical navigation */

    fn logical_end_facts(&self) -> &IndexVec<BlockId, A::Fact> {
        match A::DIRECTION {
            Direction::Forward => &self.end_facts,
            Direction::Backward => &self.begin_facts,
        }
    }

    fn logical_begin_fact_mut(&mut self, block: BlockId) -> &mut A::Fact {
        match A::DIRECTION {
            Direction::Forward => &mut self.begin_facts[block],
            Direction::Backward => &mut self.end_facts[block],
        }
    }

    fn logical_end_fact_mut(&mut self, block: BlockId) -> &mut A::Fact {
        match A::DIRECTION {
            Direction::Forward => &mut self.end_facts[block],
            Direction::Backward => &mut self.begin_facts[block],
        }
    }

    fn logical_begin_fact(&self, block: BlockId) -> &A::Fact {
        match A::DIRECTION {
            Direction::Forward => &self.begin_facts[block],
            Direction::Backward => &self.end_facts[block],
        }
    }

    fn logical_predecessors(&self, block: BlockId) -> Vec<BlockId> {
        match A::DIRECTION {
            Direction::Forward => self
                .cfg
                .incoming_edges(block)
                .iter()
                .map(|e| e.source)
                .collect(),
            Direction::Backward => self
                .cfg
                .outgoing_edges(block)
                .iter()
                .map(|e| e.target)
                .collect(),
        }
    }

    fn logical_successors(&self, block: BlockId) -> Vec<BlockId> {
        match A::DIRECTION {
            Direction::Forward => self
                .cfg
                .outgoing_edges(block)
                .iter()
                .map(|e| e.target)
                .collect(),
            Direction::Backward => self
                .cfg
                .incoming_edges(block)
                .iter()
                .map(|e| e.source)
                .collect(),
        }
    }

    fn instructions_in_analysis_order(
        &self,
        block: BlockId,
    ) -> Box<dyn Iterator<Item = &Instruction<O>> + '_> {
        let instructions = &self.cfg.block(block).instructions;
        match A::DIRECTION {
            Direction::Forward => Box::new(instructions.iter()),
            Direction::Backward => Box::new(instructions.iter().rev()),
        }
    }

    /// Reverse postorder on the CFG (forward) or the reversed CFG (backward).
    fn compute_iter_order(&mut self) {
        let start = match A::DIRECTION {
            Direction::Forward => self.cfg.entry_block(),
            Direction::Backward => self.cfg.exit_block(),
        };

        let mut visited = vec![false; self.cfg.num_blocks()];
        let mut order = Vec::new();
        self.postorder(start, &mut visited, &mut order);
        order.reverse();
        self.iter_order = order;
    }

    fn postorder(&self, block: BlockId, visited: &mut Vec<bool>, order: &mut Vec<BlockId>) {
        if visited[block.index()] {
            return;
        }
        visited[block.index()] = true;
        for successor in self.logical_successors(block) {
            self.postorder(successor, visited, order);
        }
        order.push(block);
    }

    /// Replay the block's transfer from its logical begin fact up to (or
    /// past) the instruction at program-order `index`.
    fn instruction_fact(
        &self,
        block: BlockId,
        index: usize,
        after_in_logical_order: bool,
    ) -> A::Fact {
        let instructions = &self.cfg.block(block).instructions;
        let mut fact = self.logical_begin_fact(block).clone();

        let positions: Vec<usize> = match A::DIRECTION {
            Direction::Forward => (0..instructions.len()).collect(),
            Direction::Backward => (0..instructions.len()).rev().collect(),
        };

        for position in positions {
            let at_instruction = position == index;
            if at_instruction && !after_in_logical_order {
                break;
            }
            self.analysis
                .model_instruction(&instructions[position], &mut fact);
            if at_instruction {
                break;
            }
        }

        fact
    }
}
