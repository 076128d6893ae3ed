//! Module emission: the `ModuleCollector` seam between code generation and
//! output, the assembly printer, and the diagnostic HIR/CFG printers.
//!
//! A `ModuleCollector` receives the string constants, global variables, and
//! per-function instruction sequences produced by the pipeline; what happens
//! to them depends on the selected output mode.

use colored::Colorize;

use crate::{
    backend::lowlevel_codegen::LowLevelCodeGen,
    diagnostics::Result,
    middle::{
        cfg::{BasicBlockKind, BlockId, ControlFlowGraph, EdgeKind, build_cfg},
        hir::{HighLevelOpcode, Instruction, InstructionSequence, OpcodeInfo},
        live_vregs::{LiveVregs, LiveVregsAnalysis},
        symtab::{SymbolKind, SymbolTable},
        ty::Type,
    },
};

pub trait ModuleCollector {
    fn collect_string_constant(&mut self, name: &str, value: &str);
    fn collect_global_var(&mut self, name: &str, ty: &Type);
    fn collect_function(&mut self, name: &str, iseq: InstructionSequence<HighLevelOpcode>)
    -> Result<()>;

    /// Called once after the whole translation unit has been collected.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/* Assembly output */

/// Collector for the default compile mode: lowers each function to LIR and
/// prints a complete GNU-syntax assembly module with `.rodata`, `.data`, and
/// `.text` sections (each emitted only when non-empty).
pub struct PrintAssembly {
    rodata: Vec<String>,
    data: Vec<String>,
    text: Vec<String>,
}

impl PrintAssembly {
    pub fn new() -> Self {
        Self {
            rodata: Vec::new(),
            data: Vec::new(),
            text: Vec::new(),
        }
    }
}

impl Default for PrintAssembly {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleCollector for PrintAssembly {
    fn collect_string_constant(&mut self, name: &str, value: &str) {
        self.rodata
            .push(format!("{name}: .string \"{}\"", escape_string(value)));
    }

    fn collect_global_var(&mut self, name: &str, ty: &Type) {
        self.data.push(format!("\t.globl {name}"));
        self.data.push(format!("\t.align {}", ty.alignment()));
        self.data.push(format!("{name}: .space {}", ty.storage_size()));
    }

    fn collect_function(
        &mut self,
        name: &str,
        iseq: InstructionSequence<HighLevelOpcode>,
    ) -> Result<()> {
        let ll_iseq = LowLevelCodeGen::new().generate(&iseq)?;

        self.text.push(format!("\t.globl {name}"));
        self.text.push(format!("{name}:"));
        for (label, instruction) in ll_iseq.iter_with_labels() {
            if let Some(label) = label {
                self.text.push(format!("{label}:"));
            }
            self.text.push(format!("\t{instruction}"));
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.rodata.is_empty() {
            println!("\t.section .rodata");
            for line in &self.rodata {
                println!("{line}");
            }
        }
        if !self.data.is_empty() {
            println!("\t.section .data");
            for line in &self.data {
                println!("{line}");
            }
        }
        if !self.text.is_empty() {
            println!("\t.section .text");
            for line in &self.text {
                println!("{line}");
            }
        }
        Ok(())
    }
}

fn escape_string(value: &str) -> String {
    let mut escaped = String::new();
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            '\r' => escaped.push_str("\\r"),
            '\0' => escaped.push_str("\\0"),
            other => escaped.push(other),
        }
    }
    escaped
}

/* HIR output */

/// Collector for `-h`: prints each function's high-level code.
pub struct PrintHighLevelCode;

impl ModuleCollector for PrintHighLevelCode {
    fn collect_string_constant(&mut self, _name: &str, _value: &str) {}

    fn collect_global_var(&mut self, _name: &str, _ty: &Type) {}

    fn collect_function(
        &mut self,
        name: &str,
        iseq: InstructionSequence<HighLevelOpcode>,
    ) -> Result<()> {
        println!("{} {}", "function".magenta(), name.blue());
        for (label, instruction) in iseq.iter_with_labels() {
            if let Some(label) = label {
                println!("{label}:");
            }
            println!("\t{instruction}");
        }
        println!();
        Ok(())
    }
}

/* CFG output */

/// Collector for `-C` and `-L`: prints each function's high-level CFG,
/// optionally annotated with live-vreg facts.
pub struct PrintHighLevelCfg {
    pub with_liveness: bool,
}

impl ModuleCollector for PrintHighLevelCfg {
    fn collect_string_constant(&mut self, _name: &str, _value: &str) {}

    fn collect_global_var(&mut self, _name: &str, _ty: &Type) {}

    fn collect_function(
        &mut self,
        name: &str,
        iseq: InstructionSequence<HighLevelOpcode>,
    ) -> Result<()> {
        println!("{} {}", "function".magenta(), name.blue());
        let cfg = build_cfg(&iseq);

        if self.with_liveness {
            let mut liveness = LiveVregs::new(LiveVregsAnalysis, &cfg);
            liveness.execute();
            print_cfg(
                &cfg,
                |block| Some(liveness.fact_to_string(liveness.fact_at_beginning_of_block(block))),
                |block| Some(liveness.fact_to_string(liveness.fact_at_end_of_block(block))),
            );
        } else {
            print_cfg(&cfg, |_| None, |_| None);
        }
        Ok(())
    }
}

/// Collector for `-c`: lowers each function and prints the low-level CFG.
pub struct PrintLowLevelCfg;

impl ModuleCollector for PrintLowLevelCfg {
    fn collect_string_constant(&mut self, _name: &str, _value: &str) {}

    fn collect_global_var(&mut self, _name: &str, _ty: &Type) {}

    fn collect_function(
        &mut self,
        name: &str,
        iseq: InstructionSequence<HighLevelOpcode>,
    ) -> Result<()> {
        println!("{} {}", "function".magenta(), name.blue());
        let ll_iseq = LowLevelCodeGen::new().generate(&iseq)?;
        let cfg = build_cfg(&ll_iseq);
        print_cfg(&cfg, |_| None, |_| None);
        Ok(())
    }
}

fn print_cfg<O: OpcodeInfo>(
    cfg: &ControlFlowGraph<O>,
    begin_annotation: impl Fn(BlockId) -> Option<String>,
    end_annotation: impl Fn(BlockId) -> Option<String>,
) where
    Instruction<O>: core::fmt::Display,
{
    use crate::index::Index;

    for block in cfg.blocks() {
        let mut header = format!("BASIC BLOCK {}", block.id.index());
        match block.kind {
            BasicBlockKind::Entry => header.push_str(" [entry]"),
            BasicBlockKind::Exit => header.push_str(" [exit]"),
            BasicBlockKind::Interior => {}
        }
        if let Some(label) = &block.label {
            header.push_str(&format!(" (label {label})"));
        }
        if let Some(annotation) = begin_annotation(block.id) {
            header.push_str(&format!("  /* {annotation} */"));
        }
        println!("{}", header.cyan());

        for instruction in &block.instructions {
            println!("\t{instruction}");
        }

        for edge in cfg.outgoing_edges(block.id) {
            let kind = match edge.kind {
                EdgeKind::FallThrough => "fall-through",
                EdgeKind::Branch => "branch",
            };
            println!("  {kind} EDGE to BASIC BLOCK {}", edge.target.index());
        }

        if let Some(annotation) = end_annotation(block.id) {
            println!("  At end of block: /* {annotation} */");
        }
        println!();
    }
}

/* Symbol table output */

/// `-a` dump of the global symbol table (functions, globals, struct types).
pub fn dump_symbol_table(table: &SymbolTable) {
    for symbol in table.symbols() {
        let symbol = symbol.borrow();
        let kind = match symbol.kind {
            SymbolKind::Function => "function",
            SymbolKind::Variable => "variable",
            SymbolKind::Type => "type",
        };
        println!("{kind} {} : {}", symbol.name.blue(), symbol.ty);

        if symbol.kind == SymbolKind::Type && symbol.ty.is_struct() {
            symbol.ty.layout_struct();
            for member in symbol.ty.members() {
                println!("\t{} : {} (offset {})", member.name, member.ty, member.offset());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_escaped_for_the_assembler() {
        assert_eq!(escape_string("hi\tthere\n"), "hi\\tthere\\n");
        assert_eq!(escape_string("say \"hi\""), "say \\\"hi\\\"");
        assert_eq!(escape_string("back\\slash"), "back\\\\slash");
    }
}
