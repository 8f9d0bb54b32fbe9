//! Crux: a small dynamically typed scripting language.
//!
//! This crate is the whole interpreter: the byte scanner and single-pass
//! compiler, the value and heap object model, the tracing garbage
//! collector with string interning, the stack VM with closures and shared
//! upvalues, the module loader, and the native standard library.
//!
//! The embedding surface is small: build a [`Vm`], feed it source with
//! [`Vm::interpret`], and map [`InterpretError`] to an exit code.

pub mod chunk;
pub mod compiler;
pub mod error;
mod gc;
pub mod heap;
mod intern;
pub mod modules;
mod natives;
pub mod object;
pub mod scanner;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{CompileError, ErrorKind, InterpretError, NativeError, VmPanic};
pub use value::{ObjRef, Value};
pub use vm::Vm;

/// Process exit codes, shared with the CLI.
pub const EXIT_FILE_ERROR: i32 = 2;
pub const EXIT_USAGE: i32 = 64;
pub const EXIT_COMPILE_ERROR: i32 = 65;
pub const EXIT_RUNTIME_ERROR: i32 = 70;
