//! The high-level IR: three-address instructions over virtual registers, plus
//! the instruction/operand/sequence plumbing shared with the low-level IR.
//!
//! Opcode families with four size variants are laid out contiguously in
//! `_b`, `_w`, `_l`, `_q` order so that `base + log2(size_bytes)` selects the
//! right variant.

use crate::{
    backend::lowlevel::MachineReg,
    diagnostics::{CompileError, Result},
    middle::{symtab::SymbolRef, ty::Type},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::FromRepr)]
#[strum(serialize_all = "snake_case")]
#[repr(u16)]
pub enum HighLevelOpcode {
    Nop,
    MovB,
    MovW,
    MovL,
    MovQ,
    AddB,
    AddW,
    AddL,
    AddQ,
    SubB,
    SubW,
    SubL,
    SubQ,
    MulB,
    MulW,
    MulL,
    MulQ,
    DivB,
    DivW,
    DivL,
    DivQ,
    ModB,
    ModW,
    ModL,
    ModQ,
    AndB,
    AndW,
    AndL,
    AndQ,
    OrB,
    OrW,
    OrL,
    OrQ,
    CmpltB,
    CmpltW,
    CmpltL,
    CmpltQ,
    CmplteB,
    CmplteW,
    CmplteL,
    CmplteQ,
    CmpgtB,
    CmpgtW,
    CmpgtL,
    CmpgtQ,
    CmpgteB,
    CmpgteW,
    CmpgteL,
    CmpgteQ,
    CmpeqB,
    CmpeqW,
    CmpeqL,
    CmpeqQ,
    CmpneqB,
    CmpneqW,
    CmpneqL,
    CmpneqQ,
    SconvBw,
    SconvBl,
    SconvBq,
    SconvWl,
    SconvWq,
    SconvLq,
    UconvBw,
    UconvBl,
    UconvBq,
    UconvWl,
    UconvWq,
    UconvLq,
    Jmp,
    CjmpT,
    CjmpF,
    Call,
    Enter,
    Leave,
    Ret,
    Localaddr,
}

impl HighLevelOpcode {
    /// True if `self` is any size variant of the family whose `_b` variant is
    /// `base`.
    pub fn in_family(self, base: HighLevelOpcode) -> bool {
        let (this, base) = (self as u16, base as u16);
        this >= base && this < base + 4
    }

    /// Does this opcode write its first operand?
    pub fn has_dest_operand(self) -> bool {
        !matches!(
            self,
            Self::Nop
                | Self::Ret
                | Self::Jmp
                | Self::Call
                | Self::Enter
                | Self::Leave
                | Self::CjmpT
                | Self::CjmpF
        )
    }

    /// Operand size in bytes of a sized opcode's sources.
    pub fn source_operand_size(self) -> u32 {
        match self {
            Self::SconvBw | Self::SconvBl | Self::SconvBq => 1,
            Self::UconvBw | Self::UconvBl | Self::UconvBq => 1,
            Self::SconvWl | Self::SconvWq | Self::UconvWl | Self::UconvWq => 2,
            Self::SconvLq | Self::UconvLq => 4,
            other => other.size_from_suffix(),
        }
    }

    /// Operand size in bytes of a sized opcode's destination.
    pub fn dest_operand_size(self) -> u32 {
        match self {
            Self::SconvBw | Self::UconvBw => 2,
            Self::SconvBl | Self::SconvWl | Self::UconvBl | Self::UconvWl => 4,
            Self::SconvBq | Self::SconvWq | Self::SconvLq => 8,
            Self::UconvBq | Self::UconvWq | Self::UconvLq => 8,
            other => other.size_from_suffix(),
        }
    }

    fn size_from_suffix(self) -> u32 {
        const FAMILIES: &[HighLevelOpcode] = &[
            HighLevelOpcode::MovB,
            HighLevelOpcode::AddB,
            HighLevelOpcode::SubB,
            HighLevelOpcode::MulB,
            HighLevelOpcode::DivB,
            HighLevelOpcode::ModB,
            HighLevelOpcode::AndB,
            HighLevelOpcode::OrB,
            HighLevelOpcode::CmpltB,
            HighLevelOpcode::CmplteB,
            HighLevelOpcode::CmpgtB,
            HighLevelOpcode::CmpgteB,
            HighLevelOpcode::CmpeqB,
            HighLevelOpcode::CmpneqB,
        ];
        for &base in FAMILIES {
            if self.in_family(base) {
                return 1 << (self as u16 - base as u16);
            }
        }
        panic!("opcode {self} has no operand size suffix");
    }
}

/// `base + log2(size_bytes)` opcode selection. `base` must be the `_b`
/// variant of a four-variant family.
pub fn select_opcode(base: HighLevelOpcode, size: u32) -> HighLevelOpcode {
    let offset = match size {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => panic!("invalid operand size {size}"),
    };
    HighLevelOpcode::from_repr(base as u16 + offset).expect("opcode family is contiguous")
}

/// Select the size variant for a type: basic types by their kind code,
/// pointers and arrays as `_q`.
pub fn select_opcode_for_type(base: HighLevelOpcode, ty: &Type) -> Result<HighLevelOpcode> {
    if ty.is_basic() && !ty.is_void() {
        Ok(HighLevelOpcode::from_repr(base as u16 + ty.basic_type_kind() as u16)
            .expect("opcode family is contiguous"))
    } else if ty.is_pointer() || ty.is_array() {
        Ok(select_opcode(base, 8))
    } else {
        Err(CompileError::internal(format!(
            "cannot select an opcode for type '{ty}'"
        )))
    }
}

/// Per-IR instruction properties needed by the CFG builder.
pub trait OpcodeInfo: Copy + Eq + core::fmt::Debug + 'static {
    fn is_function_call(self) -> bool;

    /// True for every opcode except unconditional jumps.
    fn falls_through(self) -> bool;
}

impl OpcodeInfo for HighLevelOpcode {
    fn is_function_call(self) -> bool {
        self == Self::Call
    }

    fn falls_through(self) -> bool {
        self != Self::Jmp
    }
}

/// Operand of an instruction. Used by both the high-level IR (virtual
/// registers) and the low-level IR (machine registers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// vr0
    Vreg(u32),
    /// (vr0)
    VregMem(u32),
    /// (vr0, vr1)
    VregMemIdx { base: u32, index: u32 },
    /// 8(vr0q)
    VregMemOff { base: u32, offset: i64 },

    /// %al / %ax / %eax / %rax depending on size
    Mreg(OperandSize, MachineReg),
    /// (%rax)
    MregMem(MachineReg),
    /// (%rax,%rsi)
    MregMemIdx { base: MachineReg, index: MachineReg },
    /// 8(%rax)
    MregMemOff { base: MachineReg, offset: i64 },

    /// $1
    ImmIval(i64),
    /// .L0
    Label(String),
    /// $printf
    ImmLabel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    Byte,
    Word,
    DWord,
    QWord,
}

impl OperandSize {
    pub fn from_bytes(size: u32) -> Self {
        match size {
            1 => Self::Byte,
            2 => Self::Word,
            4 => Self::DWord,
            8 => Self::QWord,
            _ => panic!("invalid operand size {size}"),
        }
    }
}

impl Operand {
    pub fn is_memref(&self) -> bool {
        matches!(
            self,
            Self::VregMem(_)
                | Self::VregMemIdx { .. }
                | Self::VregMemOff { .. }
                | Self::MregMem(_)
                | Self::MregMemIdx { .. }
                | Self::MregMemOff { .. }
        )
    }

    pub fn is_imm_ival(&self) -> bool {
        matches!(self, Self::ImmIval(_))
    }

    pub fn is_label(&self) -> bool {
        matches!(self, Self::Label(_))
    }

    pub fn is_imm_label(&self) -> bool {
        matches!(self, Self::ImmLabel(_))
    }

    pub fn imm_ival(&self) -> i64 {
        match self {
            Self::ImmIval(value) => *value,
            other => panic!("operand {other:?} has no immediate value"),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Label(label) | Self::ImmLabel(label) => label,
            other => panic!("operand {other:?} has no label"),
        }
    }

    /// Base virtual register, for any vreg-based operand kind.
    pub fn base_vreg(&self) -> Option<u32> {
        match self {
            Self::Vreg(vreg)
            | Self::VregMem(vreg)
            | Self::VregMemIdx { base: vreg, .. }
            | Self::VregMemOff { base: vreg, .. } => Some(*vreg),
            _ => None,
        }
    }

    pub fn index_vreg(&self) -> Option<u32> {
        match self {
            Self::VregMemIdx { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// vreg -> (vreg); 64-bit mreg -> (mreg).
    pub fn to_memref(&self) -> Operand {
        match self {
            Self::Vreg(vreg) => Self::VregMem(*vreg),
            Self::Mreg(OperandSize::QWord, reg) => Self::MregMem(*reg),
            other => panic!("cannot form a memory reference from {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction<O> {
    pub opcode: O,
    pub operands: Vec<Operand>,
}

impl<O: OpcodeInfo> Instruction<O> {
    pub fn new(opcode: O, operands: Vec<Operand>) -> Self {
        Self { opcode, operands }
    }

    pub fn operand(&self, index: usize) -> &Operand {
        &self.operands[index]
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// An instruction whose last operand is a (non-immediate) label is a
    /// branch.
    pub fn is_branch(&self) -> bool {
        !self.opcode.is_function_call()
            && self.operands.last().is_some_and(|operand| operand.is_label())
    }
}

/// Shorthand used all over the code generators.
pub fn ins<O: OpcodeInfo>(opcode: O, operands: Vec<Operand>) -> Instruction<O> {
    Instruction::new(opcode, operands)
}

/* Def/use model for HIR instructions */

/// A HIR instruction is a def if it has a destination operand and that
/// operand is a plain vreg.
pub fn is_def(instruction: &Instruction<HighLevelOpcode>) -> bool {
    instruction.opcode.has_dest_operand()
        && matches!(instruction.operands.first(), Some(Operand::Vreg(_)))
}

/// Does operand `index` of this instruction read a virtual register? The
/// destination slot counts only when it is a memory reference (the base and
/// index registers are read to form the address).
pub fn is_use(instruction: &Instruction<HighLevelOpcode>, index: usize) -> bool {
    let operand = instruction.operand(index);
    if index == 0 && instruction.opcode.has_dest_operand() {
        return operand.is_memref() && operand.base_vreg().is_some();
    }
    operand.base_vreg().is_some() || operand.index_vreg().is_some()
}

/* Instruction sequences */

#[derive(Debug, Clone)]
struct Slot<O> {
    label: Option<String>,
    instruction: Instruction<O>,
}

/// An ordered list of instructions with optional labels. A defined label
/// attaches to the next appended instruction; a label defined after the last
/// instruction (targeting the end of the function) is kept as pending.
#[derive(Debug, Clone)]
pub struct InstructionSequence<O> {
    slots: Vec<Slot<O>>,
    pending_label: Option<String>,
    /// Symbol of the defining function, carried for later passes that need
    /// frame information.
    pub fn_symbol: Option<SymbolRef>,
}

impl<O: OpcodeInfo> InstructionSequence<O> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            pending_label: None,
            fn_symbol: None,
        }
    }

    pub fn append(&mut self, instruction: Instruction<O>) {
        self.slots.push(Slot {
            label: self.pending_label.take(),
            instruction,
        });
    }

    /// Attach `label` to the next appended instruction.
    pub fn define_label(&mut self, label: impl Into<String>) {
        let label = label.into();
        assert!(
            self.pending_label.is_none(),
            "two labels for the same instruction"
        );
        self.pending_label = Some(label);
    }

    pub fn has_pending_label(&self) -> bool {
        self.pending_label.is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> &Instruction<O> {
        &self.slots[index].instruction
    }

    pub fn label_at(&self, index: usize) -> Option<&str> {
        self.slots.get(index).and_then(|slot| slot.label.as_deref())
    }

    pub fn has_label_at(&self, index: usize) -> bool {
        self.label_at(index).is_some()
    }

    pub fn has_label_at_end(&self) -> bool {
        self.pending_label.is_some()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Instruction<O>> {
        self.slots.iter().map(|slot| &slot.instruction)
    }

    pub fn iter_with_labels(&self) -> impl Iterator<Item = (Option<&str>, &Instruction<O>)> {
        self.slots
            .iter()
            .map(|slot| (slot.label.as_deref(), &slot.instruction))
    }

    /// Index of the instruction carrying `label`; the sequence length if the
    /// label is pending at the end.
    pub fn index_of_labeled_instruction(&self, label: &str) -> Option<usize> {
        if let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.label.as_deref() == Some(label))
        {
            return Some(index);
        }
        if self.pending_label.as_deref() == Some(label) {
            return Some(self.slots.len());
        }
        None
    }

    pub fn last_instruction(&self) -> Option<&Instruction<O>> {
        self.slots.last().map(|slot| &slot.instruction)
    }
}

impl<O: OpcodeInfo> Default for InstructionSequence<O> {
    fn default() -> Self {
        Self::new()
    }
}

/* Formatting */

pub fn format_hir_operand(operand: &Operand) -> String {
    match operand {
        Operand::Vreg(vreg) => format!("vr{vreg}"),
        Operand::VregMem(vreg) => format!("(vr{vreg})"),
        Operand::VregMemIdx { base, index } => format!("(vr{base}, vt{index})"),
        Operand::VregMemOff { base, offset } => format!("{offset}(vr{base}q)"),
        Operand::ImmIval(value) => format!("${value}"),
        Operand::Label(label) => label.clone(),
        Operand::ImmLabel(label) => format!("${label}"),
        other => panic!("machine operand {other:?} in high-level code"),
    }
}

impl core::fmt::Display for Instruction<HighLevelOpcode> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // mnemonics are right-padded to 8 columns
        write!(f, "{:<8}", self.opcode.to_string())?;
        for (i, operand) in self.operands.iter().enumerate() {
            let separator = if i == 0 { " " } else { ", " };
            write!(f, "{separator}{}", format_hir_operand(operand))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_selection_is_base_plus_log2_size() {
        let families = [
            HighLevelOpcode::MovB,
            HighLevelOpcode::AddB,
            HighLevelOpcode::SubB,
            HighLevelOpcode::MulB,
            HighLevelOpcode::DivB,
            HighLevelOpcode::ModB,
            HighLevelOpcode::AndB,
            HighLevelOpcode::OrB,
            HighLevelOpcode::CmpltB,
            HighLevelOpcode::CmplteB,
            HighLevelOpcode::CmpgtB,
            HighLevelOpcode::CmpgteB,
            HighLevelOpcode::CmpeqB,
            HighLevelOpcode::CmpneqB,
        ];
        for base in families {
            for (size, log2) in [(1u32, 0u16), (2, 1), (4, 2), (8, 3)] {
                let selected = select_opcode(base, size);
                assert_eq!(selected as u16, base as u16 + log2);
                assert_eq!(selected.source_operand_size(), size);
            }
        }
    }

    #[test]
    fn mnemonics_use_size_suffixes() {
        assert_eq!(HighLevelOpcode::MovL.to_string(), "mov_l");
        assert_eq!(HighLevelOpcode::CmpltQ.to_string(), "cmplt_q");
        assert_eq!(HighLevelOpcode::SconvBq.to_string(), "sconv_bq");
        assert_eq!(HighLevelOpcode::CjmpF.to_string(), "cjmp_f");
        assert_eq!(HighLevelOpcode::Localaddr.to_string(), "localaddr");
    }

    #[test]
    fn conversion_sizes() {
        assert_eq!(HighLevelOpcode::SconvWq.source_operand_size(), 2);
        assert_eq!(HighLevelOpcode::SconvWq.dest_operand_size(), 8);
        assert_eq!(HighLevelOpcode::UconvBl.source_operand_size(), 1);
        assert_eq!(HighLevelOpcode::UconvBl.dest_operand_size(), 4);
    }

    #[test]
    fn to_memref_wraps_vregs() {
        assert_eq!(Operand::Vreg(7).to_memref(), Operand::VregMem(7));
    }

    #[test]
    fn branch_detection_uses_last_label_operand() {
        let jump = ins(
            HighLevelOpcode::Jmp,
            vec![Operand::Label(".L0".to_owned())],
        );
        assert!(jump.is_branch());

        let call = ins(
            HighLevelOpcode::Call,
            vec![Operand::Label("f".to_owned())],
        );
        assert!(!call.is_branch());

        let mov = ins(
            HighLevelOpcode::MovL,
            vec![Operand::Vreg(0), Operand::ImmIval(1)],
        );
        assert!(!mov.is_branch());
    }

    #[test]
    fn def_use_model() {
        let mov = ins(
            HighLevelOpcode::MovL,
            vec![Operand::Vreg(16), Operand::Vreg(17)],
        );
        assert!(is_def(&mov));
        assert!(!is_use(&mov, 0));
        assert!(is_use(&mov, 1));

        // a store through a memory reference is not a def, but the base
        // register of the destination is a use
        let store = ins(
            HighLevelOpcode::MovL,
            vec![Operand::VregMem(16), Operand::ImmIval(3)],
        );
        assert!(!is_def(&store));
        assert!(is_use(&store, 0));
        assert!(!is_use(&store, 1));
    }

    #[test]
    fn sequence_labels_attach_to_next_instruction() {
        let mut seq: InstructionSequence<HighLevelOpcode> = InstructionSequence::new();
        seq.append(ins(HighLevelOpcode::Nop, vec![]));
        seq.define_label(".L0");
        seq.append(ins(HighLevelOpcode::Nop, vec![]));
        seq.define_label(".L1");

        assert!(!seq.has_label_at(0));
        assert_eq!(seq.label_at(1), Some(".L0"));
        assert_eq!(seq.index_of_labeled_instruction(".L0"), Some(1));
        assert!(seq.has_label_at_end());
        assert_eq!(seq.index_of_labeled_instruction(".L1"), Some(2));
    }

    #[test]
    fn hir_text_form() {
        let add = ins(
            HighLevelOpcode::AddL,
            vec![Operand::Vreg(10), Operand::Vreg(16), Operand::ImmIval(1)],
        );
        assert_eq!(add.to_string(), "add_l    vr10, vr16, $1");

        let store = ins(
            HighLevelOpcode::MovQ,
            vec![Operand::VregMem(11), Operand::ImmLabel("str0".to_owned())],
        );
        assert_eq!(store.to_string(), "mov_q    (vr11), $str0");
    }
}
