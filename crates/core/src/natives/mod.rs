//! Native function plumbing.
//!
//! Natives come in four shapes: fallible/infallible functions and
//! fallible/infallible methods. Fallible natives return
//! `Result<Value, NativeError>` and the VM wraps the outcome in a heap
//! `Result` object; infallible ones push their value directly. Methods
//! receive their receiver as `args[0]`.
//!
//! Registration happens once at VM startup with the collector paused:
//! the shared core table (bound into every module record), the per-type
//! method tables, and the native-module registry (`math`, `sys`, `time`,
//! `vec`, `fs`, `io`).

pub(crate) mod core;
pub(crate) mod fs;
pub(crate) mod io;
pub(crate) mod math;
pub(crate) mod sys;
pub(crate) mod time;
pub(crate) mod types;
pub(crate) mod vectors;

use crate::error::{ErrorKind, NativeError};
use crate::modules::ModuleRecord;
use crate::object::{
    NativeFn, NativeFunction, NativeInfallibleFn, NativeInfallibleFunction,
    NativeInfallibleMethod, NativeMethod, Object,
};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

/// Register everything. Runs with the heap paused, so nothing is rooted.
pub(crate) fn install(vm: &mut Vm) {
    let mut globals = Table::new();
    define_infallible(vm, &mut globals, "print", 1, core::print);
    define_infallible(vm, &mut globals, "println", 1, core::print);
    define_infallible(vm, &mut globals, "length", 1, core::length);
    define_infallible(vm, &mut globals, "int", 1, core::int_cast);
    define_infallible(vm, &mut globals, "float", 1, core::float_cast);
    define_infallible(vm, &mut globals, "string", 1, core::string_cast);
    define_infallible(vm, &mut globals, "array", 1, core::array_cast);
    define_fallible(vm, &mut globals, "sqrt", 1, math::sqrt);
    define_fallible(vm, &mut globals, "abs", 1, math::abs);
    define_fallible(vm, &mut globals, "pow", 2, math::pow);
    define_fallible(vm, &mut globals, "input", 0, io::read_line);
    vm.core_natives = globals;

    vm.string_methods = types::string_methods(vm);
    vm.array_methods = types::array_methods(vm);
    vm.table_methods = types::table_methods(vm);
    vm.error_methods = types::error_methods(vm);
    vm.result_methods = types::result_methods(vm);
    vm.vector_methods = vectors::vector_methods(vm);
    vm.file_methods = io::file_methods(vm);

    let math_table = math::module_table(vm);
    register_native_module(vm, "math", math_table);
    let sys_table = sys::module_table(vm);
    register_native_module(vm, "sys", sys_table);
    let time_table = time::module_table(vm);
    register_native_module(vm, "time", time_table);
    let vec_table = vectors::module_table(vm);
    register_native_module(vm, "vec", vec_table);
    let fs_table = fs::module_table(vm);
    register_native_module(vm, "fs", fs_table);
    let io_table = io::module_table(vm);
    register_native_module(vm, "io", io_table);
}

fn set_entry(vm: &mut Vm, table: &mut Table, name: &str, value: Value) {
    let name_ref = vm.copy_string(name);
    let hash = match vm.heap.string_hash(name_ref) {
        Some(h) => h,
        None => unreachable!("interned name must be a string"),
    };
    table.set(Value::Object(name_ref), hash, value);
}

pub(crate) fn define_fallible(
    vm: &mut Vm,
    table: &mut Table,
    name: &str,
    arity: u8,
    function: NativeFn,
) {
    let name_ref = vm.copy_string(name);
    let object = vm.alloc(Object::NativeFunction(NativeFunction {
        name: name_ref,
        arity,
        function,
    }));
    set_entry(vm, table, name, Value::Object(object));
}

pub(crate) fn define_infallible(
    vm: &mut Vm,
    table: &mut Table,
    name: &str,
    arity: u8,
    function: NativeInfallibleFn,
) {
    let name_ref = vm.copy_string(name);
    let object = vm.alloc(Object::NativeInfallibleFunction(NativeInfallibleFunction {
        name: name_ref,
        arity,
        function,
    }));
    set_entry(vm, table, name, Value::Object(object));
}

pub(crate) fn define_method(
    vm: &mut Vm,
    table: &mut Table,
    name: &str,
    arity: u8,
    function: NativeFn,
) {
    let name_ref = vm.copy_string(name);
    let object = vm.alloc(Object::NativeMethod(NativeMethod {
        name: name_ref,
        arity,
        function,
    }));
    set_entry(vm, table, name, Value::Object(object));
}

pub(crate) fn define_infallible_method(
    vm: &mut Vm,
    table: &mut Table,
    name: &str,
    arity: u8,
    function: NativeInfallibleFn,
) {
    let name_ref = vm.copy_string(name);
    let object = vm.alloc(Object::NativeInfallibleMethod(NativeInfallibleMethod {
        name: name_ref,
        arity,
        function,
    }));
    set_entry(vm, table, name, Value::Object(object));
}

/// Wrap a name table into a module record importable by bare name.
fn register_native_module(vm: &mut Vm, name: &str, publics: Table) {
    let name_ref = vm.copy_string(name);
    let mut record = ModuleRecord::new(name_ref);
    record.publics = publics;
    let module = vm.alloc(Object::Module(record));
    vm.native_modules.push((name.to_string(), module));
}

// ----- shared argument helpers -----

pub(crate) fn number_arg(args: &[Value], index: usize, name: &str) -> Result<f64, NativeError> {
    args[index].as_number().ok_or_else(|| {
        NativeError::new(
            ErrorKind::Type,
            format!("Argument <{}> must be a number.", name),
        )
    })
}

pub(crate) fn int_arg(args: &[Value], index: usize, name: &str) -> Result<i32, NativeError> {
    match args[index] {
        Value::Int(i) => Ok(i),
        _ => Err(NativeError::new(
            ErrorKind::Type,
            format!("Argument <{}> must be an integer.", name),
        )),
    }
}

pub(crate) fn string_arg(
    vm: &Vm,
    args: &[Value],
    index: usize,
    name: &str,
) -> Result<String, NativeError> {
    if let Value::Object(r) = args[index] {
        if let Object::String(s) = vm.heap.get(r) {
            return Ok(s.text.clone());
        }
    }
    Err(NativeError::new(
        ErrorKind::Type,
        format!("Argument <{}> must be of type 'string'.", name),
    ))
}
