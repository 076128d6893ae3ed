//! Instruction selection: HIR to x86-64 LIR.
//!
//! Purely local translation over a fixed register mapping: vregs 0..=10 map
//! to machine registers, vregs from 11 up live in 8-byte spill slots below
//! the locals region. `%r10` and `%r11` are scratch registers that never
//! carry a value across HIR instructions (every instruction's result is
//! written back to its destination before the next one runs).
//!
//! Low-level instructions carry their operands in AT&T order (source first).

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::{
    backend::lowlevel::{LowLevelOpcode as LL, MachineReg, select_ll_opcode},
    diagnostics::{CompileError, Result},
    middle::hir::{
        HighLevelOpcode as HL, Instruction, InstructionSequence, Operand, OperandSize, ins,
    },
};

/// vregs 0..=10 in order: return value, arguments 1-9, first temporary.
const VREG_MREGS: [MachineReg; 11] = [
    MachineReg::Rax,
    MachineReg::Rdi,
    MachineReg::Rsi,
    MachineReg::Rdx,
    MachineReg::Rcx,
    MachineReg::R8,
    MachineReg::R9,
    MachineReg::R12,
    MachineReg::R13,
    MachineReg::R14,
    MachineReg::R15,
];

/// First vreg that has no machine register and spills to the stack.
const FIRST_SPILLED_VREG: u32 = 11;

/// Direct translations of high-level opcodes: arithmetic and widening moves,
/// plus the `setcc` used to capture each comparison's result.
static HL_TO_LL: Lazy<HashMap<HL, LL>> = Lazy::new(|| {
    let mut map = HashMap::new();

    for (hl, ll) in [
        (HL::AddB, LL::Addb),
        (HL::SubB, LL::Subb),
        (HL::AndB, LL::Andb),
        (HL::OrB, LL::Orb),
    ] {
        for offset in 0..4u16 {
            map.insert(
                HL::from_repr(hl as u16 + offset).unwrap(),
                LL::from_repr(ll as u16 + offset).unwrap(),
            );
        }
    }

    map.extend([
        (HL::MulW, LL::Imulw),
        (HL::MulL, LL::Imull),
        (HL::MulQ, LL::Imulq),
        (HL::SconvBw, LL::Movsbw),
        (HL::SconvBl, LL::Movsbl),
        (HL::SconvBq, LL::Movsbq),
        (HL::SconvWl, LL::Movswl),
        (HL::SconvWq, LL::Movswq),
        (HL::SconvLq, LL::Movslq),
        (HL::UconvBw, LL::Movzbw),
        (HL::UconvBl, LL::Movzbl),
        (HL::UconvBq, LL::Movzbq),
        (HL::UconvWl, LL::Movzwl),
        (HL::UconvWq, LL::Movzwq),
        (HL::UconvLq, LL::Movzlq),
    ]);

    for family in [
        (HL::CmpltB, LL::Setl),
        (HL::CmplteB, LL::Setle),
        (HL::CmpgtB, LL::Setg),
        (HL::CmpgteB, LL::Setge),
        (HL::CmpeqB, LL::Sete),
        (HL::CmpneqB, LL::Setne),
    ] {
        for offset in 0..4u16 {
            map.insert(HL::from_repr(family.0 as u16 + offset).unwrap(), family.1);
        }
    }

    map
});

fn mapped(hl_opcode: HL) -> Result<LL> {
    HL_TO_LL.get(&hl_opcode).copied().ok_or_else(|| {
        CompileError::internal(format!("high-level opcode {hl_opcode} not handled"))
    })
}

fn mreg(size: u32, reg: MachineReg) -> Operand {
    Operand::Mreg(OperandSize::from_bytes(size), reg)
}

pub struct LowLevelCodeGen {
    /// Size of the locals region (from the storage planner).
    locals_region_size: u32,
    /// Locals plus spill slots, padded to a multiple of 16.
    total_memory_storage: u32,
}

impl LowLevelCodeGen {
    pub fn new() -> Self {
        Self {
            locals_region_size: 0,
            total_memory_storage: 0,
        }
    }

    pub fn generate(
        &mut self,
        hl_iseq: &InstructionSequence<HL>,
    ) -> Result<InstructionSequence<LL>> {
        let fn_symbol = hl_iseq
            .fn_symbol
            .clone()
            .ok_or_else(|| CompileError::internal("instruction sequence has no function"))?;

        // frame: locals at the top, one 8-byte slot per spilled vreg below,
        // the total padded so %rsp stays 16-aligned after the prologue
        // pushes %rbp
        let (frame_size, vreg_limit) = {
            let symbol = fn_symbol.borrow();
            (symbol.frame_size, symbol.vreg_limit)
        };
        self.locals_region_size = frame_size;
        let spill_size = 8 * vreg_limit.saturating_sub(FIRST_SPILLED_VREG);
        self.total_memory_storage = (frame_size + spill_size).next_multiple_of(16);

        let mut ll_iseq = InstructionSequence::new();
        ll_iseq.fn_symbol = Some(fn_symbol);

        for (label, instruction) in hl_iseq.iter_with_labels() {
            if let Some(label) = label {
                ll_iseq.define_label(label);
            }
            self.translate_instruction(instruction, &mut ll_iseq)?;
        }

        Ok(ll_iseq)
    }

    fn translate_instruction(
        &mut self,
        hl_ins: &Instruction<HL>,
        out: &mut InstructionSequence<LL>,
    ) -> Result<()> {
        let opcode = hl_ins.opcode;
        let frame = self.total_memory_storage as i64;

        match opcode {
            HL::Nop => {
                out.append(ins(LL::Nop, vec![]));
                return Ok(());
            }
            HL::Enter => {
                out.append(ins(LL::Pushq, vec![mreg(8, MachineReg::Rbp)]));
                out.append(ins(
                    LL::Movq,
                    vec![mreg(8, MachineReg::Rsp), mreg(8, MachineReg::Rbp)],
                ));
                out.append(ins(
                    LL::Subq,
                    vec![Operand::ImmIval(frame), mreg(8, MachineReg::Rsp)],
                ));
                return Ok(());
            }
            HL::Leave => {
                out.append(ins(
                    LL::Addq,
                    vec![Operand::ImmIval(frame), mreg(8, MachineReg::Rsp)],
                ));
                out.append(ins(LL::Popq, vec![mreg(8, MachineReg::Rbp)]));
                return Ok(());
            }
            HL::Ret => {
                out.append(ins(LL::Retq, vec![]));
                return Ok(());
            }
            HL::Jmp => {
                out.append(ins(LL::Jmp, vec![hl_ins.operand(0).clone()]));
                return Ok(());
            }
            HL::Call => {
                out.append(ins(LL::Call, vec![hl_ins.operand(0).clone()]));
                return Ok(());
            }
            HL::CjmpT | HL::CjmpF => {
                // the condition has no inherent size; compare it as 32-bit
                let mut condition = self.get_ll_operand(hl_ins.operand(0), 4, out)?;
                if condition.is_imm_ival() {
                    // constant propagation can leave an immediate here
                    out.append(ins(LL::Movl, vec![condition, mreg(4, MachineReg::R10)]));
                    condition = mreg(4, MachineReg::R10);
                }
                out.append(ins(LL::Cmpl, vec![Operand::ImmIval(0), condition]));
                let jump = if opcode == HL::CjmpT { LL::Jne } else { LL::Je };
                out.append(ins(jump, vec![hl_ins.operand(1).clone()]));
                return Ok(());
            }
            HL::Localaddr => {
                // the planner's offsets grow downward from the top of the
                // locals region
                let dest = self.get_ll_operand(hl_ins.operand(0), 8, out)?;
                let offset = hl_ins.operand(1).imm_ival();
                let source = Operand::MregMemOff {
                    base: MachineReg::Rbp,
                    offset: offset - self.locals_region_size as i64,
                };
                out.append(ins(LL::Leaq, vec![source, mreg(8, MachineReg::R10)]));
                out.append(ins(LL::Movq, vec![mreg(8, MachineReg::R10), dest]));
                return Ok(());
            }
            _ => {}
        }

        // Operands are lowered immediately before their use: lowering a
        // memory reference through a spilled base loads the base into %r11,
        // which the next lowering is free to clobber.

        let src_size = opcode.source_operand_size();
        let dest_size = opcode.dest_operand_size();

        /* Moves */

        if opcode.in_family(HL::MovB) {
            let mov = select_ll_opcode(LL::Movb, src_size);
            let mut source = self.get_ll_operand(hl_ins.operand(1), src_size, out)?;
            if source.is_memref() && self.lowers_to_memref(hl_ins.operand(0)) {
                out.append(ins(mov, vec![source, mreg(src_size, MachineReg::R10)]));
                source = mreg(src_size, MachineReg::R10);
            }
            let dest = self.get_ll_operand(hl_ins.operand(0), dest_size, out)?;
            out.append(ins(mov, vec![source, dest]));
            return Ok(());
        }

        /* Widening conversions */

        if matches!(
            opcode,
            HL::SconvBw
                | HL::SconvBl
                | HL::SconvBq
                | HL::SconvWl
                | HL::SconvWq
                | HL::SconvLq
                | HL::UconvBw
                | HL::UconvBl
                | HL::UconvBq
                | HL::UconvWl
                | HL::UconvWq
                | HL::UconvLq
        ) {
            let source = self.get_ll_operand(hl_ins.operand(1), src_size, out)?;
            let narrow = mreg(src_size, MachineReg::R10);
            let wide = mreg(dest_size, MachineReg::R10);
            out.append(ins(select_ll_opcode(LL::Movb, src_size), vec![source, narrow.clone()]));
            out.append(ins(mapped(opcode)?, vec![narrow, wide.clone()]));
            let dest = self.get_ll_operand(hl_ins.operand(0), dest_size, out)?;
            out.append(ins(select_ll_opcode(LL::Movb, dest_size), vec![wide, dest]));
            return Ok(());
        }

        let mov = select_ll_opcode(LL::Movb, src_size);
        let scratch = mreg(src_size, MachineReg::R10);

        /* Add, subtract, multiply, bitwise and/or: stage the left operand in
         * %r10, apply the operator, store back */

        if opcode.in_family(HL::AddB)
            || opcode.in_family(HL::SubB)
            || opcode.in_family(HL::MulB)
            || opcode.in_family(HL::AndB)
            || opcode.in_family(HL::OrB)
        {
            let left = self.get_ll_operand(hl_ins.operand(1), src_size, out)?;
            out.append(ins(mov, vec![left, scratch.clone()]));
            let right = self.get_ll_operand(hl_ins.operand(2), src_size, out)?;
            out.append(ins(mapped(opcode)?, vec![right, scratch.clone()]));
            let dest = self.get_ll_operand(hl_ins.operand(0), dest_size, out)?;
            out.append(ins(mov, vec![scratch, dest]));
            return Ok(());
        }

        /* Division and modulo go through the idiv convention: dividend in
         * %rax (sign-extended into %rdx), divisor staged in %r10 */

        if opcode.in_family(HL::DivB) || opcode.in_family(HL::ModB) {
            let size = src_size.max(4);
            let mov = select_ll_opcode(LL::Movb, size);
            let (extend, divide) = if size == 8 {
                (LL::Cqto, LL::Idivq)
            } else {
                (LL::Cdq, LL::Idivl)
            };

            let left = self.get_ll_operand(hl_ins.operand(1), size, out)?;
            out.append(ins(mov, vec![left, mreg(size, MachineReg::Rax)]));
            out.append(ins(extend, vec![]));
            let right = self.get_ll_operand(hl_ins.operand(2), size, out)?;
            out.append(ins(mov, vec![right, mreg(size, MachineReg::R10)]));
            out.append(ins(divide, vec![mreg(size, MachineReg::R10)]));

            let result = if opcode.in_family(HL::DivB) {
                MachineReg::Rax
            } else {
                MachineReg::Rdx
            };
            let dest = self.get_ll_operand(hl_ins.operand(0), dest_size, out)?;
            out.append(ins(mov, vec![mreg(size, result), dest]));
            return Ok(());
        }

        /* Comparisons: compare, set the flag into %r10b, widen to the
         * destination width */

        if opcode.in_family(HL::CmpltB)
            || opcode.in_family(HL::CmplteB)
            || opcode.in_family(HL::CmpgtB)
            || opcode.in_family(HL::CmpgteB)
            || opcode.in_family(HL::CmpeqB)
            || opcode.in_family(HL::CmpneqB)
        {
            let left = self.get_ll_operand(hl_ins.operand(1), src_size, out)?;
            out.append(ins(mov, vec![left, scratch.clone()]));
            let right = self.get_ll_operand(hl_ins.operand(2), src_size, out)?;
            out.append(ins(
                select_ll_opcode(LL::Cmpb, src_size),
                vec![right, scratch],
            ));

            let flag = mreg(1, MachineReg::R10);
            out.append(ins(mapped(opcode)?, vec![flag.clone()]));

            let dest = self.get_ll_operand(hl_ins.operand(0), dest_size, out)?;
            if dest_size == 1 {
                out.append(ins(LL::Movb, vec![flag, dest]));
            } else {
                let widen = match dest_size {
                    2 => LL::Movzbw,
                    4 => LL::Movzbl,
                    8 => LL::Movzbq,
                    _ => unreachable!(),
                };
                let wide = mreg(dest_size, MachineReg::R10);
                out.append(ins(widen, vec![flag, wide.clone()]));
                out.append(ins(select_ll_opcode(LL::Movb, dest_size), vec![wide, dest]));
            }
            return Ok(());
        }

        Err(CompileError::internal(format!(
            "high-level opcode {opcode} not handled"
        )))
    }

    /// Will this high-level operand lower to a memory operand?
    fn lowers_to_memref(&self, operand: &Operand) -> bool {
        match operand {
            Operand::Vreg(vreg) => *vreg >= FIRST_SPILLED_VREG,
            other => other.is_memref(),
        }
    }

    /// Lower a high-level operand. `size` selects the machine-register
    /// width; memory references through spilled vregs load the base address
    /// into `%r11` first.
    fn get_ll_operand(
        &mut self,
        operand: &Operand,
        size: u32,
        out: &mut InstructionSequence<LL>,
    ) -> Result<Operand> {
        match operand {
            Operand::ImmIval(_) | Operand::Label(_) | Operand::ImmLabel(_) => Ok(operand.clone()),

            Operand::Vreg(vreg) if *vreg < FIRST_SPILLED_VREG => {
                Ok(mreg(size, VREG_MREGS[*vreg as usize]))
            }
            Operand::Vreg(vreg) => Ok(self.spill_slot(*vreg)),

            Operand::VregMem(base) => {
                let base = self.base_address_reg(*base, out);
                Ok(Operand::MregMem(base))
            }
            Operand::VregMemOff { base, offset } => {
                let base = self.base_address_reg(*base, out);
                Ok(Operand::MregMemOff {
                    base,
                    offset: *offset,
                })
            }
            Operand::VregMemIdx { base, index }
                if *base < FIRST_SPILLED_VREG && *index < FIRST_SPILLED_VREG =>
            {
                Ok(Operand::MregMemIdx {
                    base: VREG_MREGS[*base as usize],
                    index: VREG_MREGS[*index as usize],
                })
            }

            other => Err(CompileError::internal(format!(
                "cannot lower operand {other:?}"
            ))),
        }
    }

    /// Machine register holding the base address of a vreg memory reference.
    fn base_address_reg(&mut self, vreg: u32, out: &mut InstructionSequence<LL>) -> MachineReg {
        if vreg < FIRST_SPILLED_VREG {
            return VREG_MREGS[vreg as usize];
        }
        // the address lives in a spill slot; always a 64-bit load
        out.append(ins(
            LL::Movq,
            vec![self.spill_slot(vreg), mreg(8, MachineReg::R11)],
        ));
        MachineReg::R11
    }

    /// Spill slots sit directly below the locals region, 8 bytes per vreg.
    fn spill_slot(&self, vreg: u32) -> Operand {
        debug_assert!(vreg >= FIRST_SPILLED_VREG);
        let offset = self.locals_region_size as i64 + 8 * (vreg as i64 - 10);
        Operand::MregMemOff {
            base: MachineReg::Rbp,
            offset: -offset,
        }
    }
}

impl Default for LowLevelCodeGen {
    fn default() -> Self {
        Self::new()
    }
}
