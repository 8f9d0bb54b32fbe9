//! Crux CLI.
//!
//! `crux` with no arguments starts the REPL; `crux <path>` compiles and
//! runs a source file. Exit codes: 0 success, 2 file read error, 64 usage,
//! 65 compile error, 70 runtime error.

mod repl;

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::debug;

use crux_core::{
    EXIT_COMPILE_ERROR, EXIT_FILE_ERROR, EXIT_RUNTIME_ERROR, EXIT_USAGE, InterpretError, Vm,
};

#[derive(Parser)]
#[command(name = "crux")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "The Crux scripting language", long_about = None)]
struct Cli {
    /// Source file to run; starts a REPL when omitted.
    path: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            eprintln!("Usage: crux [path]");
            process::exit(EXIT_USAGE);
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            return;
        }
    };

    let args: Vec<String> = std::env::args().collect();
    let mut vm = Vm::new(args);

    match cli.path {
        Some(path) => run_file(&mut vm, &path),
        None => repl::run(&mut vm),
    }
}

fn run_file(vm: &mut Vm, path: &PathBuf) {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error reading file '{}': {}.", path.display(), e);
            process::exit(EXIT_FILE_ERROR);
        }
    };
    debug!(path = %path.display(), "running file");
    match vm.interpret(&source, Some(path)) {
        Ok(()) => {}
        Err(InterpretError::Compile(_)) => process::exit(EXIT_COMPILE_ERROR),
        Err(InterpretError::Runtime(_)) => process::exit(EXIT_RUNTIME_ERROR),
    }
}
