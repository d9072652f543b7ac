//! Solis CLI
//!
//! Command-line driver for the interpreter: run a script file, start the
//! repl, or print version information. Interpretation errors are printed
//! but do not set the exit status; only failure to read input does.

use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;
use solis::{InterpretResult, Vm};

mod config;
mod repl;

#[derive(ClapParser)]
#[command(name = "solis")]
#[command(version = solis::VERSION)]
#[command(about = "The Solis scripting language", long_about = None)]
struct Cli {
    /// `help`, `version`, `repl`, or a path to a script file
    target: Option<String>,

    /// Path to a solis.toml (defaults to ./solis.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Skip registration of the OS class
    #[arg(long)]
    sandboxed: bool,

    /// Collect garbage on every allocation
    #[arg(long)]
    gc_stress: bool,

    /// Trace bytecode execution to stderr
    #[arg(long)]
    trace: bool,
}

fn help() {
    println!(" -- Solis CLI Help -- \n");
    println!("- help -> prints the help message.");
    println!("- version -> prints the version message.\n");
    println!("- repl -> starts the repl for running code.");
    println!("          :help can be typed to get repl help while within the repl.\n");
    println!("- solis {{filepath}} -> executes a file immediately with a clean VM.");
}

fn version() {
    println!(" Solis v{}", solis::VERSION);
}

fn run_file(vm: &mut Vm, path: &str) -> i32 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Error opening file '{path}': {err}");
            return 1;
        }
    };

    let name = std::path::Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("main")
        .to_string();

    match vm.interpret(&name, &source) {
        InterpretResult::CompileError => println!("Compile Error"),
        InterpretResult::RuntimeError => println!("Runtime Error"),
        InterpretResult::Ok => {}
    }
    0
}

fn main() {
    let cli = Cli::parse();

    let options = match config::load(cli.config.as_deref()) {
        Ok(mut options) => {
            options.sandboxed |= cli.sandboxed;
            options.gc_stress |= cli.gc_stress;
            options.trace |= cli.trace;
            options.from_env()
        }
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    let Some(target) = cli.target else {
        help();
        return;
    };

    match target.as_str() {
        "help" => help(),
        "version" => version(),
        "repl" => repl::run(options),
        path => {
            let mut vm = Vm::with_options(options);
            process::exit(run_file(&mut vm, path));
        }
    }
}
