//! Machine registers, x86-64 instruction mnemonics, and low-level code
//! formatting (GNU assembler syntax).
//!
//! Mnemonics with an operand-size suffix come in four contiguous enum
//! variants in `b`, `w`, `l`, `q` order, the same layout the high-level
//! opcodes use, so size selection is `base + log2(size_bytes)`.

use crate::middle::hir::{Instruction, OpcodeInfo, Operand, OperandSize};

/// Machine register names refer to the full 64-bit register; the operand
/// kind selects which width of the register is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[rustfmt::skip]
pub enum MachineReg {
    Rax, Rbx, Rcx, Rdx,
    Rsi, Rdi, Rsp, Rbp,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

#[rustfmt::skip]
const MREG_NAMES: [[&str; 4]; 16] = [
    ["al",   "ax",   "eax",  "rax"],
    ["bl",   "bx",   "ebx",  "rbx"],
    ["cl",   "cx",   "ecx",  "rcx"],
    ["dl",   "dx",   "edx",  "rdx"],
    ["sil",  "si",   "esi",  "rsi"],
    ["dil",  "di",   "edi",  "rdi"],
    ["spl",  "sp",   "esp",  "rsp"],
    ["bpl",  "bp",   "ebp",  "rbp"],
    ["r8b",  "r8w",  "r8d",  "r8"],
    ["r9b",  "r9w",  "r9d",  "r9"],
    ["r10b", "r10w", "r10d", "r10"],
    ["r11b", "r11w", "r11d", "r11"],
    ["r12b", "r12w", "r12d", "r12"],
    ["r13b", "r13w", "r13d", "r13"],
    ["r14b", "r14w", "r14d", "r14"],
    ["r15b", "r15w", "r15d", "r15"],
];

impl MachineReg {
    pub fn name(self, size: OperandSize) -> &'static str {
        let column = match size {
            OperandSize::Byte => 0,
            OperandSize::Word => 1,
            OperandSize::DWord => 2,
            OperandSize::QWord => 3,
        };
        MREG_NAMES[self as usize][column]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "lowercase")]
#[repr(u16)]
pub enum LowLevelOpcode {
    Nop,
    Movb,
    Movw,
    Movl,
    Movq,
    Addb,
    Addw,
    Addl,
    Addq,
    Subb,
    Subw,
    Subl,
    Subq,
    Andb,
    Andw,
    Andl,
    Andq,
    Orb,
    Orw,
    Orl,
    Orq,
    // pointers are always 64-bit
    Leaq,
    Jmp,
    Je,
    Jne,
    Jl,
    Jle,
    Jg,
    Jge,
    Jb,
    Jbe,
    Ja,
    Jae,
    Cmpb,
    Cmpw,
    Cmpl,
    Cmpq,
    Call,
    Imulw,
    Imull,
    Imulq,
    Idivl,
    Idivq,
    Cdq,
    Cqto,
    Pushq,
    Popq,
    Retq,
    Movsbw,
    Movsbl,
    Movsbq,
    Movswl,
    Movswq,
    Movslq,
    Movzbw,
    Movzbl,
    Movzbq,
    Movzwl,
    Movzwq,
    Movzlq,
    Setl,
    Setle,
    Setg,
    Setge,
    Sete,
    Setne,
}

impl OpcodeInfo for LowLevelOpcode {
    fn is_function_call(self) -> bool {
        self == Self::Call
    }

    fn falls_through(self) -> bool {
        self != Self::Jmp
    }
}

/// Size-variant selection for a four-variant low-level family whose `b`
/// variant is `base`.
pub fn select_ll_opcode(base: LowLevelOpcode, size: u32) -> LowLevelOpcode {
    let offset = match size {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => panic!("invalid operand size {size}"),
    };
    LowLevelOpcode::from_repr(base as u16 + offset).expect("opcode family is contiguous")
}

pub fn format_ll_operand(operand: &Operand) -> String {
    match operand {
        Operand::Mreg(size, reg) => format!("%{}", reg.name(*size)),
        Operand::MregMem(reg) => format!("(%{})", reg.name(OperandSize::QWord)),
        Operand::MregMemIdx { base, index } => format!(
            "(%{},%{})",
            base.name(OperandSize::QWord),
            index.name(OperandSize::QWord)
        ),
        Operand::MregMemOff { base, offset } => {
            format!("{offset}(%{})", base.name(OperandSize::QWord))
        }
        Operand::ImmIval(value) => format!("${value}"),
        Operand::Label(label) => label.clone(),
        Operand::ImmLabel(label) => format!("${label}"),
        other => panic!("virtual operand {other:?} in low-level code"),
    }
}

impl core::fmt::Display for Instruction<LowLevelOpcode> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // mnemonics are right-padded to 8 columns
        write!(f, "{:<8}", self.opcode.to_string())?;
        for (i, operand) in self.operands.iter().enumerate() {
            let separator = if i == 0 { " " } else { ", " };
            write!(f, "{separator}{}", format_ll_operand(operand))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middle::hir::ins;

    #[test]
    fn register_names_by_size() {
        assert_eq!(MachineReg::Rax.name(OperandSize::Byte), "al");
        assert_eq!(MachineReg::Rax.name(OperandSize::QWord), "rax");
        assert_eq!(MachineReg::Rdi.name(OperandSize::DWord), "edi");
        assert_eq!(MachineReg::R10.name(OperandSize::Word), "r10w");
    }

    #[test]
    fn size_selection_over_families() {
        assert_eq!(select_ll_opcode(LowLevelOpcode::Movb, 4), LowLevelOpcode::Movl);
        assert_eq!(select_ll_opcode(LowLevelOpcode::Addb, 8), LowLevelOpcode::Addq);
        assert_eq!(select_ll_opcode(LowLevelOpcode::Cmpb, 2), LowLevelOpcode::Cmpw);
    }

    #[test]
    fn att_operand_syntax() {
        let mov = ins(
            LowLevelOpcode::Movq,
            vec![
                Operand::Mreg(OperandSize::QWord, MachineReg::Rsp),
                Operand::Mreg(OperandSize::QWord, MachineReg::Rbp),
            ],
        );
        assert_eq!(mov.to_string(), "movq     %rsp, %rbp");

        let store = ins(
            LowLevelOpcode::Movl,
            vec![
                Operand::ImmIval(7),
                Operand::MregMemOff {
                    base: MachineReg::Rbp,
                    offset: -12,
                },
            ],
        );
        assert_eq!(store.to_string(), "movl     $7, -12(%rbp)");
    }
}
