//! Live-virtual-register analysis: a backward dataflow over a bounded bitset
//! of vreg ids.
//!
//! Modeled backwards, a def kills the destination vreg and every use makes a
//! vreg live. A memory-reference operand in the destination slot is not a
//! kill; its base and index registers are uses (they are read to form the
//! address).

use std::fmt::Write;

use crate::middle::{
    dataflow::{Dataflow, DataflowAnalysis, Direction},
    hir::{HighLevelOpcode, Instruction, is_def, is_use},
};

/// Upper bound on vreg ids tracked by the analysis.
pub const MAX_VREGS: usize = 1024;

const WORDS: usize = MAX_VREGS / 64;

/// A fixed-size bitset of virtual register ids.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VregSet {
    words: [u64; WORDS],
}

impl VregSet {
    pub fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    pub fn set(&mut self, vreg: u32) {
        let vreg = vreg as usize;
        assert!(vreg < MAX_VREGS);
        self.words[vreg / 64] |= 1 << (vreg % 64);
    }

    pub fn reset(&mut self, vreg: u32) {
        let vreg = vreg as usize;
        assert!(vreg < MAX_VREGS);
        self.words[vreg / 64] &= !(1 << (vreg % 64));
    }

    pub fn test(&self, vreg: u32) -> bool {
        let vreg = vreg as usize;
        assert!(vreg < MAX_VREGS);
        self.words[vreg / 64] & (1 << (vreg % 64)) != 0
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut result = *self;
        for (word, other) in result.words.iter_mut().zip(other.words.iter()) {
            *word |= other;
        }
        result
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..MAX_VREGS as u32).filter(|&vreg| self.test(vreg))
    }
}

impl Default for VregSet {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for VregSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

pub struct LiveVregsAnalysis;

impl DataflowAnalysis<HighLevelOpcode> for LiveVregsAnalysis {
    type Fact = VregSet;
    const DIRECTION: Direction = Direction::Backward;

    fn top_fact(&self) -> VregSet {
        VregSet::new()
    }

    fn combine_facts(&self, left: &VregSet, right: &VregSet) -> VregSet {
        left.union(right)
    }

    fn model_instruction(&self, instruction: &Instruction<HighLevelOpcode>, fact: &mut VregSet) {
        if is_def(instruction) {
            let dest = instruction
                .operand(0)
                .base_vreg()
                .expect("def destinations are vregs");
            fact.reset(dest);
        }

        for index in 0..instruction.num_operands() {
            if is_use(instruction, index) {
                let operand = instruction.operand(index);
                if let Some(base) = operand.base_vreg() {
                    fact.set(base);
                }
                if let Some(idx) = operand.index_vreg() {
                    fact.set(idx);
                }
            }
        }
    }

    fn fact_to_string(&self, fact: &VregSet) -> String {
        let mut out = String::from("{");
        for (i, vreg) in fact.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write!(out, "{vreg}").unwrap();
        }
        out.push('}');
        out
    }
}

pub type LiveVregs<'cfg> = Dataflow<'cfg, HighLevelOpcode, LiveVregsAnalysis>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::{
        cfg::build_cfg,
        hir::{HighLevelOpcode as Op, InstructionSequence, Operand, ins},
    };

    #[test]
    fn bitset_basics() {
        let mut set = VregSet::new();
        set.set(0);
        set.set(63);
        set.set(64);
        set.set(1023);
        assert!(set.test(0) && set.test(63) && set.test(64) && set.test(1023));
        set.reset(63);
        assert!(!set.test(63));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 64, 1023]);

        let mut other = VregSet::new();
        other.set(63);
        let both = set.union(&other);
        assert!(both.test(63) && both.test(1023));
    }

    /// vr16 = 1; vr17 = vr16 + 1; vr0 = vr17; ret
    fn straight_line() -> InstructionSequence<Op> {
        let mut seq = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(16), Operand::ImmIval(1)],
        ));
        seq.append(ins(
            Op::AddL,
            vec![Operand::Vreg(17), Operand::Vreg(16), Operand::ImmIval(1)],
        ));
        seq.append(ins(
            Op::MovL,
            vec![Operand::Vreg(0), Operand::Vreg(17)],
        ));
        seq.append(ins(Op::Ret, vec![]));
        seq
    }

    #[test]
    fn uses_are_live_before_defs_kill() {
        let cfg = build_cfg(&straight_line());
        let mut live = LiveVregs::new(LiveVregsAnalysis, &cfg);
        live.execute();

        let block = cfg
            .blocks()
            .find(|b| !b.instructions.is_empty())
            .unwrap();

        // before `vr17 = vr16 + 1`, vr16 is live and vr17 is not
        let before_add = live.fact_before_instruction(block.id, 1);
        assert!(before_add.test(16));
        assert!(!before_add.test(17));

        // after the add, vr16 is dead and vr17 is live
        let after_add = live.fact_after_instruction(block.id, 1);
        assert!(!after_add.test(16));
        assert!(after_add.test(17));

        // nothing is live after the final move's use is consumed
        let at_end = live.fact_at_end_of_block(block.id);
        assert!(!at_end.test(0) && !at_end.test(16) && !at_end.test(17));
    }

    #[test]
    fn memory_destination_bases_stay_live() {
        // (vr16) = vr17 is a store, not a def of vr16
        let mut seq: InstructionSequence<Op> = InstructionSequence::new();
        seq.append(ins(
            Op::MovL,
            vec![Operand::VregMem(16), Operand::Vreg(17)],
        ));
        seq.append(ins(Op::Ret, vec![]));

        let cfg = build_cfg(&seq);
        let mut live = LiveVregs::new(LiveVregsAnalysis, &cfg);
        live.execute();

        let block = cfg.blocks().find(|b| !b.instructions.is_empty()).unwrap();
        let before = live.fact_before_instruction(block.id, 0);
        assert!(before.test(16), "store base address is a use");
        assert!(before.test(17), "stored value is a use");
    }

    #[test]
    fn backward_replay_is_consistent_with_transfer() {
        let cfg = build_cfg(&straight_line());
        let mut live = LiveVregs::new(LiveVregsAnalysis, &cfg);
        live.execute();

        for block in cfg.blocks() {
            for index in 0..block.instructions.len() {
                let after = live.fact_after_instruction(block.id, index);
                let mut modeled = after;
                live.analysis()
                    .model_instruction(&block.instructions[index], &mut modeled);
                assert_eq!(modeled, live.fact_before_instruction(block.id, index));
            }
        }
    }
}
