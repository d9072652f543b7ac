//! Solis: an embeddable scripting language
//!
//! A small, dynamically-typed, class-based language compiled to bytecode
//! by a single-pass Pratt compiler and executed on a stack-based virtual
//! machine with a precise mark-sweep garbage collector. The VM is
//! single-threaded and owns all of its state; two VMs in one process
//! share nothing.
//!
//! # Embedding
//!
//! ```no_run
//! use solis::{InterpretResult, Vm};
//!
//! let mut vm = Vm::new();
//! let result = vm.interpret("main", "var x = 25 + 5\nvar y = x + 2\n");
//! assert_eq!(result, InterpretResult::Ok);
//! assert_eq!(vm.get_global("y"), Some(solis::Value::number(32.0)));
//! ```

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

mod api;
mod compiler;
mod core;
mod gc;

pub use error::InterpretResult;
pub use heap::ObjId;
pub use object::{NativeFn, Operator, UserdataDrop};
pub use value::Value;
pub use vm::{Vm, VmOptions};

/// Crate version, surfaced by the CLI's `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
