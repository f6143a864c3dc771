//! Kestrel JavaScript engine CLI.
//!
//! Parses arguments and delegates to the [`Runtime`]. Exit code is 0 on
//! success and 1 on any parse or runtime error.

use std::io::Write;
use std::process::ExitCode;

use clap::Parser as ClapParser;
use js_cli::{Cli, CliError, OutputMode, Runtime};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut runtime = Runtime::new(cli.heap_options(), cli.freeze.clone());
    runtime.mode = if cli.ast_text {
        OutputMode::AstText
    } else if cli.ast_binary {
        OutputMode::AstBinary
    } else if cli.compile {
        OutputMode::Bcode
    } else {
        OutputMode::Execute
    };
    runtime.json_output = cli.json;
    runtime.memory_stats = cli.memory_stats;

    if cli.eval.is_none() && cli.files.is_empty() {
        eprintln!("usage: kestrel-js [options] [-e EXPR] files...");
        eprintln!("run 'kestrel-js --help' for the option list");
        return ExitCode::from(1);
    }

    let mut status = ExitCode::SUCCESS;

    if let Some(expr) = &cli.eval {
        if let Err(code) = run_input(&mut runtime, expr.as_bytes(), None) {
            status = code;
        }
    }

    for file in &cli.files {
        let data = match std::fs::read(file) {
            Ok(d) => d,
            Err(e) => {
                eprintln!("error: could not read '{}': {}", file, e);
                status = ExitCode::from(1);
                continue;
            }
        };
        if let Err(code) = run_input(&mut runtime, &data, Some(file)) {
            status = code;
        }
    }

    if runtime.memory_stats {
        eprint!("{}", runtime.memory_report());
    }

    status
}

fn run_input(
    runtime: &mut Runtime,
    src: &[u8],
    filename: Option<&str>,
) -> Result<(), ExitCode> {
    match runtime.process(src, filename) {
        Ok(out) => {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&out);
            let _ = stdout.flush();
            Ok(())
        }
        Err(CliError::Uncaught(msg)) => {
            eprintln!("uncaught exception: {}", msg);
            Err(ExitCode::from(1))
        }
        Err(e) => {
            eprintln!("error: {}", e);
            Err(ExitCode::from(1))
        }
    }
}
