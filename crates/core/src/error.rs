//! Error types shared between the compiler, the VM, and native functions.
//!
//! The interpreter has two error surfaces: compile errors, which are
//! reported to stderr with file and line context while parsing, and runtime
//! errors, which carry an [`ErrorKind`] and may either unwind the VM
//! (panics) or travel through the program as first-class `Result` values
//! produced by fallible natives.

use std::fmt;

/// Classification of a runtime error. Stored in every `Error` heap object
/// and attached to every VM panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Type,
    Value,
    Runtime,
    Math,
    Io,
    Memory,
    Import,
    StackOverflow,
    Name,
    Argument,
}

impl ErrorKind {
    /// The user-visible spelling, as printed in stack traces and by the
    /// `kind` method on error objects.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Type => "TYPE",
            ErrorKind::Value => "VALUE",
            ErrorKind::Runtime => "RUNTIME",
            ErrorKind::Math => "MATH",
            ErrorKind::Io => "IO",
            ErrorKind::Memory => "MEMORY",
            ErrorKind::Import => "IMPORT",
            ErrorKind::StackOverflow => "STACK_OVERFLOW",
            ErrorKind::Name => "NAME",
            ErrorKind::Argument => "ARGUMENT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a fallible native function.
///
/// The VM turns this into an `Error` heap object wrapped in an `Err` result,
/// which the program can inspect with `match`. Natives never unwind.
#[derive(Debug, Clone)]
pub struct NativeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NativeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for NativeError {}

/// A runtime error that unwinds the VM up to the module boundary.
///
/// The stack trace is printed at the raise site; the panic itself only
/// carries enough to classify the failure for the host.
#[derive(Debug, Clone)]
pub struct VmPanic {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for VmPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for VmPanic {}

/// Marker for a failed compilation. Individual diagnostics have already
/// been written to stderr by the time this is returned.
#[derive(Debug, Clone)]
pub struct CompileError {
    /// Number of diagnostics reported.
    pub count: usize,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 1 {
            write!(f, "compilation failed with 1 error")
        } else {
            write!(f, "compilation failed with {} errors", self.count)
        }
    }
}

impl std::error::Error for CompileError {}

/// Outcome of interpreting a source text, for the host to map to an exit
/// code: 65 for compile errors, 70 for runtime errors.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileError),
    Runtime(VmPanic),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{}", e),
            InterpretError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for InterpretError {}

impl From<CompileError> for InterpretError {
    fn from(e: CompileError) -> Self {
        InterpretError::Compile(e)
    }
}

impl From<VmPanic> for InterpretError {
    fn from(e: VmPanic) -> Self {
        InterpretError::Runtime(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_spelling() {
        assert_eq!(ErrorKind::StackOverflow.as_str(), "STACK_OVERFLOW");
        assert_eq!(ErrorKind::Type.to_string(), "TYPE");
    }

    #[test]
    fn test_compile_error_display() {
        assert_eq!(
            CompileError { count: 1 }.to_string(),
            "compilation failed with 1 error"
        );
        assert_eq!(
            CompileError { count: 3 }.to_string(),
            "compilation failed with 3 errors"
        );
    }
}
