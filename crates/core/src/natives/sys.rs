//! System natives, reachable through the `sys` native module.

use crate::error::{ErrorKind, NativeError};
use crate::natives::{define_fallible, define_infallible, int_arg, string_arg};
use crate::object::Object;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn module_table(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_fallible(vm, &mut table, "args", 0, args);
    define_infallible(vm, &mut table, "platform", 0, platform);
    define_infallible(vm, &mut table, "arch", 0, arch);
    define_fallible(vm, &mut table, "get_env", 1, get_env);
    define_fallible(vm, &mut table, "exit", 1, exit);
    table
}

/// `[argc, [argv...]]`, mirroring the process arguments the VM was
/// started with.
fn args(vm: &mut Vm, _args: &[Value]) -> Result<Value, NativeError> {
    let argv = vm.args.clone();
    let inner = vm.alloc(Object::Array(Vec::with_capacity(argv.len())));
    vm.push_root(Value::Object(inner));
    for arg in &argv {
        let s = vm.copy_string(arg);
        vm.heap.array_mut(inner).push(Value::Object(s));
    }
    let outer = vm.alloc(Object::Array(vec![
        Value::Int(argv.len() as i32),
        Value::Object(inner),
    ]));
    vm.pop_root();
    Ok(Value::Object(outer))
}

fn platform(vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Object(vm.copy_string(std::env::consts::OS))
}

fn arch(vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Object(vm.copy_string(std::env::consts::ARCH))
}

fn get_env(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let name = string_arg(vm, args, 0, "name")?;
    match std::env::var(&name) {
        Ok(value) => Ok(Value::Object(vm.take_string(value))),
        Err(_) => Err(NativeError::new(
            ErrorKind::Value,
            format!("Environment variable '{}' is not set.", name),
        )),
    }
}

fn exit(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let code = int_arg(args, 0, "code")?;
    std::process::exit(code)
}
