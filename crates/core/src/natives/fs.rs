//! Filesystem natives, reachable through the `fs` native module.

use std::path::Path;

use crate::error::{ErrorKind, NativeError};
use crate::natives::{define_fallible, string_arg};
use crate::object::Object;
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn module_table(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_fallible(vm, &mut table, "path_exists", 1, path_exists);
    define_fallible(vm, &mut table, "is_file", 1, is_file);
    define_fallible(vm, &mut table, "is_dir", 1, is_dir);
    define_fallible(vm, &mut table, "make_dir", 1, make_dir);
    define_fallible(vm, &mut table, "remove_dir", 1, remove_dir);
    define_fallible(vm, &mut table, "remove_file", 1, remove_file);
    define_fallible(vm, &mut table, "rename", 2, rename);
    define_fallible(vm, &mut table, "copy_file", 2, copy_file);
    define_fallible(vm, &mut table, "list_dir", 1, list_dir);
    table
}

fn io_error(action: &str, path: &str) -> NativeError {
    NativeError::new(
        ErrorKind::Io,
        format!("Could not {} '{}'.", action, path),
    )
}

fn path_exists(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    Ok(Value::Bool(Path::new(&path).exists()))
}

fn is_file(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    Ok(Value::Bool(Path::new(&path).is_file()))
}

fn is_dir(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    Ok(Value::Bool(Path::new(&path).is_dir()))
}

fn make_dir(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    std::fs::create_dir(&path).map_err(|_| io_error("create directory", &path))?;
    Ok(Value::Nil)
}

fn remove_dir(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    std::fs::remove_dir(&path).map_err(|_| io_error("remove directory", &path))?;
    Ok(Value::Nil)
}

fn remove_file(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    std::fs::remove_file(&path).map_err(|_| io_error("remove file", &path))?;
    Ok(Value::Nil)
}

fn rename(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let from = string_arg(vm, args, 0, "from")?;
    let to = string_arg(vm, args, 1, "to")?;
    std::fs::rename(&from, &to).map_err(|_| io_error("rename", &from))?;
    Ok(Value::Nil)
}

fn copy_file(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let from = string_arg(vm, args, 0, "from")?;
    let to = string_arg(vm, args, 1, "to")?;
    std::fs::copy(&from, &to).map_err(|_| io_error("copy file", &from))?;
    Ok(Value::Nil)
}

fn list_dir(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    let reader = std::fs::read_dir(&path).map_err(|_| io_error("read directory", &path))?;
    let names: Vec<String> = reader
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    let array = vm.alloc(Object::Array(Vec::with_capacity(names.len())));
    vm.push_root(Value::Object(array));
    for name in names {
        let s = vm.take_string(name);
        vm.heap.array_mut(array).push(Value::Object(s));
    }
    vm.pop_root();
    Ok(Value::Object(array))
}
