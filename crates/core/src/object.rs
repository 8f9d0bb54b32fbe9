//! Heap object kinds.
//!
//! Every long-lived, mutable, or variable-sized entity is one variant of
//! [`Object`], reached through an [`ObjRef`]. Polymorphism over kinds is a
//! tagged sum switched on at each trace, free, and print site; there is no
//! subtype dispatch anywhere in the runtime.

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::error::{ErrorKind, NativeError};
use crate::modules::ModuleRecord;
use crate::table::Table;
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

/// Fallible native: returns a value or a native error. The VM wraps the
/// outcome in a heap `Result` object that the program matches on.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, NativeError>;

/// Infallible native: the returned value is pushed directly.
pub type NativeInfallibleFn = fn(&mut Vm, &[Value]) -> Value;

/// Interned immutable string. The hash is 32-bit FNV-1a of the bytes,
/// computed once at interning time.
#[derive(Debug)]
pub struct CruxString {
    pub text: String,
    pub hash: u32,
}

/// A compiled function: metadata plus its bytecode chunk. The chunk is
/// shared via `Rc` so the dispatch loop never holds a heap borrow across
/// an allocation.
#[derive(Debug)]
pub struct Function {
    /// Interned name; `None` for the implicit top-level function.
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Rc<Chunk>,
}

/// A function together with its captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// A captured variable. Open while the captured stack slot is alive,
/// closed (owning the value) once the slot dies.
#[derive(Debug)]
pub enum Upvalue {
    Open { module: ObjRef, slot: usize },
    Closed(Value),
}

#[derive(Debug)]
pub struct NativeFunction {
    pub name: ObjRef,
    pub arity: u8,
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct NativeInfallibleFunction {
    pub name: ObjRef,
    pub arity: u8,
    pub function: NativeInfallibleFn,
}

/// Fallible method: receives its receiver as `args[0]`. `arity` counts the
/// explicit arguments only.
#[derive(Debug)]
pub struct NativeMethod {
    pub name: ObjRef,
    pub arity: u8,
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct NativeInfallibleMethod {
    pub name: ObjRef,
    pub arity: u8,
    pub function: NativeInfallibleFn,
}

/// A two-variant result value produced by fallible natives and matched on
/// by user code.
#[derive(Debug, Clone, Copy)]
pub enum CruxResult {
    Ok(Value),
    /// References an `Error` object.
    Err(ObjRef),
}

/// A first-class runtime error.
#[derive(Debug)]
pub struct ErrorObject {
    pub message: ObjRef,
    pub kind: ErrorKind,
    /// Panics are unrecoverable; non-panics travel inside `Result`s.
    pub is_panic: bool,
}

/// Maximum vector dimension; components are stored inline.
pub const VECTOR_MAX_DIMS: usize = 4;

/// Fixed-dimension numeric vector.
#[derive(Debug, Clone, Copy)]
pub struct Vector {
    pub dims: usize,
    pub components: [f64; VECTOR_MAX_DIMS],
}

impl Vector {
    pub fn new(components: &[f64]) -> Self {
        let mut buf = [0.0; VECTOR_MAX_DIMS];
        buf[..components.len()].copy_from_slice(components);
        Self {
            dims: components.len(),
            components: buf,
        }
    }

    pub fn parts(&self) -> &[f64] {
        &self.components[..self.dims]
    }
}

/// A declared struct type: its name and the ordered field names.
#[derive(Debug)]
pub struct StructType {
    pub name: ObjRef,
    pub fields: Vec<ObjRef>,
}

/// An instance of a declared struct type.
#[derive(Debug)]
pub struct StructInstance {
    pub struct_type: ObjRef,
    pub fields: Table,
}

/// An open OS file wrapped for the program. The handle is closed when the
/// object is swept (or explicitly via the `close` method).
#[derive(Debug)]
pub struct FileHandle {
    pub path: ObjRef,
    pub file: Option<std::fs::File>,
}

/// The tagged sum of all heap object kinds.
#[derive(Debug)]
pub enum Object {
    String(CruxString),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    NativeFunction(NativeFunction),
    NativeInfallibleFunction(NativeInfallibleFunction),
    NativeMethod(NativeMethod),
    NativeInfallibleMethod(NativeInfallibleMethod),
    Array(Vec<Value>),
    Table(Table),
    Result(CruxResult),
    Error(ErrorObject),
    Vector(Vector),
    Struct(StructType),
    StructInstance(StructInstance),
    Module(ModuleRecord),
    File(FileHandle),
}

impl Object {
    /// The name `typeof` reports for values of this kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::Function(_) | Object::Closure(_) => "function",
            Object::Upvalue(_) => "upvalue",
            Object::NativeFunction(_)
            | Object::NativeInfallibleFunction(_)
            | Object::NativeMethod(_)
            | Object::NativeInfallibleMethod(_) => "native",
            Object::Array(_) => "array",
            Object::Table(_) => "table",
            Object::Result(_) => "result",
            Object::Error(_) => "error",
            Object::Vector(_) => "vector",
            Object::Struct(_) => "struct",
            Object::StructInstance(_) => "instance",
            Object::Module(_) => "module",
            Object::File(_) => "file",
        }
    }
}
