//! Interactive repl
//!
//! Lines are compiled and executed against one persistent VM, so globals
//! and classes accumulate across inputs. Commands:
//!
//! - `:load <path>` load and execute a file
//! - `:r` reload the previously loaded file
//! - `:help` repl help
//! - `:quit` exit
//!
//! History persists to `~/.solis_history`.

use std::path::PathBuf;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use solis::{InterpretResult, Vm, VmOptions};

fn history_path() -> Option<PathBuf> {
    home::home_dir().map(|dir| dir.join(".solis_history"))
}

fn report(result: InterpretResult) {
    match result {
        InterpretResult::CompileError => println!("Compile Error"),
        InterpretResult::RuntimeError => println!("Runtime Error"),
        InterpretResult::Ok => {}
    }
}

fn load_file(vm: &mut Vm, path: &str) -> bool {
    match std::fs::read_to_string(path) {
        Ok(source) => {
            let name = std::path::Path::new(path)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("repl")
                .to_string();
            report(vm.interpret(&name, &source));
            true
        }
        Err(err) => {
            println!("Error opening file '{path}': {err}");
            false
        }
    }
}

fn print_help() {
    println!("-- Repl Commands --\n");
    println!(":load <path> -> Loads and executes a file in the repl.");
    println!(":r -> reloads the previous file and executes it.");
    println!(":quit -> quits the repl.");
    println!("\n Code can be directly typed into the repl to be executed.\n");
}

pub fn run(options: VmOptions) {
    let mut vm = Vm::with_options(options);

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Failed to start line editor: {err}");
            return;
        }
    };
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    let mut last_file: Option<String> = None;

    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        if input == ":quit" {
            break;
        } else if let Some(path) = input.strip_prefix(":load") {
            let path = path.trim();
            if path.is_empty() {
                println!("Please input a file path");
                continue;
            }
            if load_file(&mut vm, path) {
                last_file = Some(path.to_string());
            }
        } else if input == ":r" {
            match &last_file {
                Some(path) => {
                    let path = path.clone();
                    load_file(&mut vm, &path);
                }
                None => println!("Can't reload a file if it doesn't exist"),
            }
        } else if input == ":help" {
            print_help();
        } else if input.starts_with(':') {
            println!("Unknown command '{input}'; :help lists the commands.");
        } else {
            report(vm.interpret("repl", input));
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
}
