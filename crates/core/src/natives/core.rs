//! Core natives bound into every module: printing, length, and casts.

use std::io::Write;

use crate::object::Object;
use crate::value::Value;
use crate::vm::Vm;

/// Print a value followed by a newline.
pub(crate) fn print(vm: &mut Vm, args: &[Value]) -> Value {
    let text = vm.format_value(args[0]);
    let _ = writeln!(vm.out, "{}", text);
    Value::Nil
}

/// Element count of a collection; nil for anything else.
pub(crate) fn length(vm: &mut Vm, args: &[Value]) -> Value {
    let Value::Object(r) = args[0] else {
        return Value::Nil;
    };
    match vm.heap.get(r) {
        Object::Array(items) => Value::Int(items.len() as i32),
        Object::String(s) => Value::Int(s.text.len() as i32),
        Object::Table(table) => Value::Int(table.len() as i32),
        _ => Value::Nil,
    }
}

pub(crate) fn int_cast(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Int(_) => args[0],
        Value::Float(f) => Value::Int(f as i32),
        Value::Bool(b) => Value::Int(i32::from(b)),
        Value::Nil => Value::Int(0),
        Value::Object(r) => match vm.heap.get(r) {
            Object::String(s) => match s.text.trim().parse::<f64>() {
                Ok(n) => Value::Int(n as i32),
                Err(_) => Value::Nil,
            },
            _ => Value::Nil,
        },
    }
}

pub(crate) fn float_cast(vm: &mut Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Float(_) => args[0],
        Value::Int(i) => Value::Float(f64::from(i)),
        Value::Bool(b) => Value::Float(if b { 1.0 } else { 0.0 }),
        Value::Nil => Value::Float(0.0),
        Value::Object(r) => match vm.heap.get(r) {
            Object::String(s) => match s.text.trim().parse::<f64>() {
                Ok(n) => Value::Float(n),
                Err(_) => Value::Nil,
            },
            _ => Value::Nil,
        },
    }
}

pub(crate) fn string_cast(vm: &mut Vm, args: &[Value]) -> Value {
    let text = vm.format_value(args[0]);
    Value::Object(vm.take_string(text))
}

/// Convert to an array: strings split into one-byte strings, tables
/// flatten to alternating key/value entries, anything else wraps.
pub(crate) fn array_cast(vm: &mut Vm, args: &[Value]) -> Value {
    if let Value::Object(r) = args[0] {
        match vm.heap.get(r) {
            Object::Array(_) => return args[0],
            Object::String(s) => {
                let bytes: Vec<u8> = s.text.bytes().collect();
                let array = vm.alloc(Object::Array(Vec::with_capacity(bytes.len())));
                vm.push_root(Value::Object(array));
                for byte in bytes {
                    let single = String::from_utf8_lossy(&[byte]).into_owned();
                    let piece = vm.take_string(single);
                    vm.heap.array_mut(array).push(Value::Object(piece));
                }
                vm.pop_root();
                return Value::Object(array);
            }
            Object::Table(table) => {
                let mut items = Vec::with_capacity(table.len() * 2);
                for (key, value) in table.iter() {
                    items.push(key);
                    items.push(value);
                }
                return Value::Object(vm.alloc(Object::Array(items)));
            }
            _ => {}
        }
    }
    Value::Object(vm.alloc(Object::Array(vec![args[0]])))
}
