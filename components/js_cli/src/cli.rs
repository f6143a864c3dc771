//! Command-line argument grammar.

use clap::Parser as ClapParser;
use memory_manager::HeapOptions;

/// Embeddable ECMAScript-5 engine.
#[derive(Debug, ClapParser)]
#[command(name = "kestrel-js", version, about = "Kestrel JavaScript engine")]
pub struct Cli {
    /// Execute an inline expression.
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    pub eval: Option<String>,

    /// Dump the AST as text instead of executing.
    #[arg(short = 't', long = "ast-text")]
    pub ast_text: bool,

    /// Dump the AST in binary form instead of executing.
    #[arg(short = 'b', long = "ast-binary")]
    pub ast_binary: bool,

    /// Compile and dump bytecode instead of executing.
    #[arg(short = 'c', long = "compile")]
    pub compile: bool,

    /// Format the result as JSON.
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Print memory statistics after execution.
    #[arg(long = "mm")]
    pub memory_stats: bool,

    /// Initial object arena size, in cells.
    #[arg(long = "vo", value_name = "N")]
    pub object_arena_size: Option<usize>,

    /// Initial function arena size, in cells.
    #[arg(long = "vf", value_name = "N")]
    pub function_arena_size: Option<usize>,

    /// Initial property arena size, in cells.
    #[arg(long = "vp", value_name = "N")]
    pub property_arena_size: Option<usize>,

    /// Dump a heap snapshot after initialization (not supported in this
    /// build; reported as an error).
    #[arg(long = "freeze", value_name = "FILE")]
    pub freeze: Option<String>,

    /// Script files to execute.
    pub files: Vec<String>,
}

impl Cli {
    /// Heap options assembled from the arena-size flags.
    pub fn heap_options(&self) -> HeapOptions {
        let mut opts = HeapOptions::default();
        if let Some(n) = self.object_arena_size {
            opts.object_arena_size = n;
        }
        if let Some(n) = self.function_arena_size {
            opts.function_arena_size = n;
        }
        if let Some(n) = self.property_arena_size {
            opts.property_arena_size = n;
        }
        opts
    }
}
