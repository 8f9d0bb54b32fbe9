//! Per-type method tables for strings, arrays, tables, errors, and
//! results. Dispatched by the VM's invoke path on the receiver's kind.

use crate::error::{ErrorKind, NativeError};
use crate::natives::{define_infallible_method, define_method, int_arg, string_arg};
use crate::object::{CruxResult, Object};
use crate::table::{Table, hash_value};
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn string_methods(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_infallible_method(vm, &mut table, "upper", 0, string_upper);
    define_infallible_method(vm, &mut table, "lower", 0, string_lower);
    define_infallible_method(vm, &mut table, "trim", 0, string_trim);
    define_method(vm, &mut table, "contains", 1, string_contains);
    define_method(vm, &mut table, "starts_with", 1, string_starts_with);
    define_method(vm, &mut table, "ends_with", 1, string_ends_with);
    define_method(vm, &mut table, "split", 1, string_split);
    define_method(vm, &mut table, "replace", 2, string_replace);
    table
}

pub(crate) fn array_methods(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_infallible_method(vm, &mut table, "push", 1, array_push);
    define_method(vm, &mut table, "pop", 0, array_pop);
    define_method(vm, &mut table, "insert", 2, array_insert);
    define_method(vm, &mut table, "remove", 1, array_remove);
    define_infallible_method(vm, &mut table, "contains", 1, array_contains);
    define_infallible_method(vm, &mut table, "index_of", 1, array_index_of);
    define_infallible_method(vm, &mut table, "reverse", 0, array_reverse);
    define_method(vm, &mut table, "slice", 2, array_slice);
    table
}

pub(crate) fn table_methods(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_infallible_method(vm, &mut table, "keys", 0, table_keys);
    define_infallible_method(vm, &mut table, "values", 0, table_values);
    define_method(vm, &mut table, "has", 1, table_has);
    define_method(vm, &mut table, "remove", 1, table_remove);
    table
}

pub(crate) fn error_methods(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_infallible_method(vm, &mut table, "message", 0, error_message);
    define_infallible_method(vm, &mut table, "kind", 0, error_kind);
    table
}

pub(crate) fn result_methods(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_infallible_method(vm, &mut table, "is_ok", 0, result_is_ok);
    define_infallible_method(vm, &mut table, "is_err", 0, result_is_err);
    define_method(vm, &mut table, "unwrap", 0, result_unwrap);
    define_infallible_method(vm, &mut table, "unwrap_or", 1, result_unwrap_or);
    table
}

// ----- strings -----

fn receiver_text(vm: &Vm, args: &[Value]) -> String {
    match args[0] {
        Value::Object(r) => vm.heap.string(r).to_string(),
        _ => String::new(),
    }
}

fn string_upper(vm: &mut Vm, args: &[Value]) -> Value {
    let text = receiver_text(vm, args).to_uppercase();
    Value::Object(vm.take_string(text))
}

fn string_lower(vm: &mut Vm, args: &[Value]) -> Value {
    let text = receiver_text(vm, args).to_lowercase();
    Value::Object(vm.take_string(text))
}

fn string_trim(vm: &mut Vm, args: &[Value]) -> Value {
    let text = receiver_text(vm, args).trim().to_string();
    Value::Object(vm.take_string(text))
}

fn string_contains(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let text = receiver_text(vm, args);
    let needle = string_arg(vm, args, 1, "needle")?;
    Ok(Value::Bool(text.contains(&needle)))
}

fn string_starts_with(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let text = receiver_text(vm, args);
    let prefix = string_arg(vm, args, 1, "prefix")?;
    Ok(Value::Bool(text.starts_with(&prefix)))
}

fn string_ends_with(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let text = receiver_text(vm, args);
    let suffix = string_arg(vm, args, 1, "suffix")?;
    Ok(Value::Bool(text.ends_with(&suffix)))
}

fn string_split(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let text = receiver_text(vm, args);
    let separator = string_arg(vm, args, 1, "separator")?;
    if separator.is_empty() {
        return Err(NativeError::new(
            ErrorKind::Value,
            "Argument <separator> must not be empty.",
        ));
    }
    let pieces: Vec<String> = text.split(&separator).map(str::to_string).collect();
    let array = vm.alloc(Object::Array(Vec::with_capacity(pieces.len())));
    vm.push_root(Value::Object(array));
    for piece in pieces {
        let s = vm.take_string(piece);
        vm.heap.array_mut(array).push(Value::Object(s));
    }
    vm.pop_root();
    Ok(Value::Object(array))
}

fn string_replace(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let text = receiver_text(vm, args);
    let from = string_arg(vm, args, 1, "from")?;
    let to = string_arg(vm, args, 2, "to")?;
    if from.is_empty() {
        return Err(NativeError::new(
            ErrorKind::Value,
            "Argument <from> must not be empty.",
        ));
    }
    let replaced = text.replace(&from, &to);
    Ok(Value::Object(vm.take_string(replaced)))
}

// ----- arrays -----

fn receiver_array(args: &[Value]) -> crate::value::ObjRef {
    match args[0] {
        Value::Object(r) => r,
        _ => panic!("method receiver is not an object"),
    }
}

fn array_push(vm: &mut Vm, args: &[Value]) -> Value {
    let r = receiver_array(args);
    vm.heap.array_mut(r).push(args[1]);
    Value::Nil
}

fn array_pop(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let r = receiver_array(args);
    vm.heap.array_mut(r).pop().ok_or_else(|| {
        NativeError::new(ErrorKind::Value, "Cannot pop from an empty array.")
    })
}

fn array_insert(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let r = receiver_array(args);
    let index = int_arg(args, 1, "index")?;
    let len = vm.heap.array(r).len();
    if index < 0 || index as usize > len {
        return Err(NativeError::new(
            ErrorKind::Value,
            format!("Array index {} is out of bounds.", index),
        ));
    }
    vm.heap.array_mut(r).insert(index as usize, args[2]);
    Ok(Value::Nil)
}

fn array_remove(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let r = receiver_array(args);
    let index = int_arg(args, 1, "index")?;
    let len = vm.heap.array(r).len();
    if index < 0 || index as usize >= len {
        return Err(NativeError::new(
            ErrorKind::Value,
            format!("Array index {} is out of bounds.", index),
        ));
    }
    Ok(vm.heap.array_mut(r).remove(index as usize))
}

fn array_contains(vm: &mut Vm, args: &[Value]) -> Value {
    let r = receiver_array(args);
    Value::Bool(vm.heap.array(r).contains(&args[1]))
}

fn array_index_of(vm: &mut Vm, args: &[Value]) -> Value {
    let r = receiver_array(args);
    match vm.heap.array(r).iter().position(|v| *v == args[1]) {
        Some(i) => Value::Int(i as i32),
        None => Value::Nil,
    }
}

fn array_reverse(vm: &mut Vm, args: &[Value]) -> Value {
    let r = receiver_array(args);
    vm.heap.array_mut(r).reverse();
    Value::Nil
}

fn array_slice(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let r = receiver_array(args);
    let start = int_arg(args, 1, "start")?;
    let end = int_arg(args, 2, "end")?;
    let len = vm.heap.array(r).len();
    if start < 0 || end < start || end as usize > len {
        return Err(NativeError::new(
            ErrorKind::Value,
            "Slice bounds are out of range.",
        ));
    }
    let items = vm.heap.array(r)[start as usize..end as usize].to_vec();
    Ok(Value::Object(vm.alloc(Object::Array(items))))
}

// ----- tables -----

fn receiver_table_snapshot(vm: &Vm, args: &[Value]) -> Vec<(Value, Value)> {
    match args[0] {
        Value::Object(r) => vm.heap.table(r).iter().collect(),
        _ => Vec::new(),
    }
}

fn table_keys(vm: &mut Vm, args: &[Value]) -> Value {
    let entries = receiver_table_snapshot(vm, args);
    let keys: Vec<Value> = entries.iter().map(|(k, _)| *k).collect();
    Value::Object(vm.alloc(Object::Array(keys)))
}

fn table_values(vm: &mut Vm, args: &[Value]) -> Value {
    let entries = receiver_table_snapshot(vm, args);
    let values: Vec<Value> = entries.iter().map(|(_, v)| *v).collect();
    Value::Object(vm.alloc(Object::Array(values)))
}

fn hashable(vm: &Vm, key: Value) -> Result<u32, NativeError> {
    hash_value(&vm.heap, key).ok_or_else(|| {
        NativeError::new(
            ErrorKind::Value,
            "Argument <key> must be a hashable value.",
        )
    })
}

fn table_has(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let Value::Object(r) = args[0] else {
        return Ok(Value::Bool(false));
    };
    let hash = hashable(vm, args[1])?;
    Ok(Value::Bool(vm.heap.table(r).get(args[1], hash).is_some()))
}

fn table_remove(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let Value::Object(r) = args[0] else {
        return Ok(Value::Bool(false));
    };
    let hash = hashable(vm, args[1])?;
    Ok(Value::Bool(vm.heap.table_mut(r).delete(args[1], hash)))
}

// ----- errors and results -----

fn error_message(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Object(r) => Value::Object(vm.heap.error(r).message),
        _ => Value::Nil,
    }
}

fn error_kind(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Object(r) => {
            let kind = vm.heap.error(r).kind;
            Value::Object(vm.copy_string(kind.as_str()))
        }
        _ => Value::Nil,
    }
}

fn result_variant(vm: &Vm, args: &[Value]) -> Option<CruxResult> {
    match args[0] {
        Value::Object(r) => match vm.heap.get(r) {
            Object::Result(result) => Some(*result),
            _ => None,
        },
        _ => None,
    }
}

fn result_is_ok(vm: &mut Vm, args: &[Value]) -> Value {
    Value::Bool(matches!(result_variant(vm, args), Some(CruxResult::Ok(_))))
}

fn result_is_err(vm: &mut Vm, args: &[Value]) -> Value {
    Value::Bool(matches!(result_variant(vm, args), Some(CruxResult::Err(_))))
}

fn result_unwrap(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    match result_variant(vm, args) {
        Some(CruxResult::Ok(v)) => Ok(v),
        _ => Err(NativeError::new(
            ErrorKind::Runtime,
            "Cannot unwrap an error result.",
        )),
    }
}

fn result_unwrap_or(vm: &mut Vm, args: &[Value]) -> Value {
    match result_variant(vm, args) {
        Some(CruxResult::Ok(v)) => v,
        _ => args[1],
    }
}
