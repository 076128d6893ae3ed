use std::path::PathBuf;

use clap::Parser as ClapParser;

use crate::{
    backend::emit::{
        ModuleCollector, PrintAssembly, PrintHighLevelCfg, PrintHighLevelCode, PrintLowLevelCfg,
        dump_symbol_table,
    },
    diagnostics::Result,
    frontend::{SourceFile, SourceFileOrigin, ast::NodeKind, lexer::Lexer, parser::Parser},
    middle::{
        cfg::build_cfg,
        cfg_transform::{
            ConstantPropagation, CopyPropagation, DeadStoreElimination, transform_cfg,
        },
        hir_codegen::HighLevelCodegen,
        live_vregs::{LiveVregs, LiveVregsAnalysis},
        sema::SemanticAnalysis,
        storage::LocalStorageAllocation,
        symtab::SymbolKind,
    },
};

mod backend;
mod diagnostics;
mod frontend;
mod index;
mod middle;

const MODE_FLAGS: [&str; 7] = [
    "print_tokens",
    "print_parse_tree",
    "analyze",
    "print_hir",
    "print_hir_cfg",
    "print_hir_cfg_liveness",
    "print_lir_cfg",
];

// `-h` selects high-level codegen (matching the historical interface), so
// clap's short help flag is disabled and help is `--help` only.
#[derive(Debug, ClapParser)]
#[command(version, about = "Compile a C-like source file to x86-64 assembly", long_about = None)]
#[command(disable_help_flag = true)]
struct Args {
    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Print tokens
    #[arg(short = 'l', overrides_with_all = MODE_FLAGS)]
    print_tokens: bool,

    /// Print the parse tree
    #[arg(short = 'p', overrides_with_all = MODE_FLAGS)]
    print_parse_tree: bool,

    /// Perform semantic analysis and print the symbol table
    #[arg(short = 'a', overrides_with_all = MODE_FLAGS)]
    analyze: bool,

    /// Print high-level code
    #[arg(short = 'h', overrides_with_all = MODE_FLAGS)]
    print_hir: bool,

    /// Print the CFG of the high-level code
    #[arg(short = 'C', overrides_with_all = MODE_FLAGS)]
    print_hir_cfg: bool,

    /// Print the CFG of the high-level code with liveness info
    #[arg(short = 'L', overrides_with_all = MODE_FLAGS)]
    print_hir_cfg_liveness: bool,

    /// Print the CFG of the low-level code
    #[arg(short = 'c', overrides_with_all = MODE_FLAGS)]
    print_lir_cfg: bool,

    /// Enable code optimization
    #[arg(short = 'o')]
    optimize: bool,

    source_file: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    PrintTokens,
    PrintParseTree,
    SemanticAnalysis,
    HighLevelCodegen,
    PrintHighLevelCfg,
    PrintHighLevelCfgLiveness,
    PrintLowLevelCfg,
    Compile,
}

impl Args {
    fn mode(&self) -> Mode {
        if self.print_tokens {
            Mode::PrintTokens
        } else if self.print_parse_tree {
            Mode::PrintParseTree
        } else if self.analyze {
            Mode::SemanticAnalysis
        } else if self.print_hir {
            Mode::HighLevelCodegen
        } else if self.print_hir_cfg {
            Mode::PrintHighLevelCfg
        } else if self.print_hir_cfg_liveness {
            Mode::PrintHighLevelCfgLiveness
        } else if self.print_lir_cfg {
            Mode::PrintLowLevelCfg
        } else {
            Mode::Compile
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            let _ = error.print();
            std::process::exit(1);
        }
    };

    if let Err(error) = process_source_file(&args) {
        eprintln!("{}", error.render());
        std::process::exit(1);
    }
}

fn process_source_file(args: &Args) -> Result<()> {
    let contents = std::fs::read_to_string(&args.source_file)?;
    let source = SourceFile {
        contents,
        origin: SourceFileOrigin::File(args.source_file.clone()),
    };
    let mode = args.mode();

    if mode == Mode::PrintTokens {
        for token in Lexer::scan_all(&source)? {
            println!("{:?}[{}]", token.kind, token.lexeme);
        }
        return Ok(());
    }

    let mut unit = Parser::parse_unit(&source)?;

    if mode == Mode::PrintParseTree {
        unit.print_tree();
        return Ok(());
    }

    let mut sema = SemanticAnalysis::new();
    sema.visit(&mut unit)?;

    if mode == Mode::SemanticAnalysis {
        dump_symbol_table(&sema.global_symtab().borrow());
        return Ok(());
    }

    let mut collector: Box<dyn ModuleCollector> = match mode {
        Mode::HighLevelCodegen => Box::new(PrintHighLevelCode),
        Mode::PrintHighLevelCfg => Box::new(PrintHighLevelCfg {
            with_liveness: false,
        }),
        Mode::PrintHighLevelCfgLiveness => Box::new(PrintHighLevelCfg {
            with_liveness: true,
        }),
        Mode::PrintLowLevelCfg => Box::new(PrintLowLevelCfg),
        Mode::Compile => Box::new(PrintAssembly::new()),
        _ => unreachable!(),
    };

    // global variables land in .data
    {
        let globals = sema.global_symtab();
        let globals = globals.borrow();
        for symbol in globals.symbols() {
            let symbol = symbol.borrow();
            if symbol.kind == SymbolKind::Variable {
                collector.collect_global_var(&symbol.name, &symbol.ty);
            }
        }
    }

    let mut codegen = HighLevelCodegen::new();
    for item in &mut unit.kids {
        if item.kind != NodeKind::FunctionDefinition {
            continue;
        }
        let fn_name = item.str().to_owned();

        LocalStorageAllocation::new().allocate_function(item)?;
        let code = codegen.generate_function(item)?;

        for (name, value) in &code.strings {
            collector.collect_string_constant(name, value);
        }

        let mut iseq = code.iseq;
        if args.optimize {
            let cfg = build_cfg(&iseq);
            let cfg = transform_cfg(&cfg, &mut ConstantPropagation::new());
            let cfg = transform_cfg(&cfg, &mut CopyPropagation::new());
            let cfg = {
                // dead-store elimination last, to sweep the moves the
                // propagation passes made redundant
                let mut liveness = LiveVregs::new(LiveVregsAnalysis, &cfg);
                liveness.execute();
                transform_cfg(&cfg, &mut DeadStoreElimination::new(&liveness))
            };
            iseq = cfg.create_instruction_sequence();
        }

        collector.collect_function(&fn_name, iseq)?;
    }

    collector.finish()
}
