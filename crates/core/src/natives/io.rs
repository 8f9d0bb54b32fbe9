//! I/O natives: stream output, stdin, and `File` objects with their
//! method table. A `File` holds its OS handle until `close` is called or
//! the object is swept, whichever comes first.

use std::fs::OpenOptions;
use std::io::{Read, Write};

use crate::error::{ErrorKind, NativeError};
use crate::natives::{define_fallible, define_infallible_method, define_method, string_arg};
use crate::object::{FileHandle, Object};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn module_table(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_fallible(vm, &mut table, "open", 2, open);
    define_fallible(vm, &mut table, "read_line", 0, read_line);
    define_fallible(vm, &mut table, "write", 1, write);
    define_fallible(vm, &mut table, "writeln", 1, writeln);
    table
}

pub(crate) fn file_methods(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_method(vm, &mut table, "read_all", 0, file_read_all);
    define_method(vm, &mut table, "read_line", 0, file_read_line);
    define_method(vm, &mut table, "write", 1, file_write);
    define_method(vm, &mut table, "writeln", 1, file_writeln);
    define_infallible_method(vm, &mut table, "close", 0, file_close);
    table
}

/// Open a file in mode `'r'`, `'w'`, or `'a'`.
fn open(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let path = string_arg(vm, args, 0, "path")?;
    let mode = string_arg(vm, args, 1, "mode")?;
    let mut options = OpenOptions::new();
    match mode.as_str() {
        "r" => options.read(true),
        "w" => options.write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        _ => {
            return Err(NativeError::new(
                ErrorKind::Value,
                "Argument <mode> must be 'r', 'w', or 'a'.",
            ));
        }
    };
    let file = options
        .open(&path)
        .map_err(|_| NativeError::new(ErrorKind::Io, format!("Could not open file '{}'.", path)))?;
    let path_ref = vm.copy_string(&path);
    vm.push_root(Value::Object(path_ref));
    let handle = vm.alloc(Object::File(FileHandle {
        path: path_ref,
        file: Some(file),
    }));
    vm.pop_root();
    Ok(Value::Object(handle))
}

/// Read one line from standard input, without the trailing newline.
pub(crate) fn read_line(vm: &mut Vm, _args: &[Value]) -> Result<Value, NativeError> {
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .map_err(|_| NativeError::new(ErrorKind::Io, "Could not read from standard input."))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Value::Object(vm.take_string(line)))
}

fn write(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let text = vm.format_value(args[0]);
    write!(vm.out, "{}", text)
        .map_err(|_| NativeError::new(ErrorKind::Io, "Could not write to standard output."))?;
    Ok(Value::Nil)
}

fn writeln(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let text = vm.format_value(args[0]);
    writeln!(vm.out, "{}", text)
        .map_err(|_| NativeError::new(ErrorKind::Io, "Could not write to standard output."))?;
    Ok(Value::Nil)
}

fn closed_error() -> NativeError {
    NativeError::new(ErrorKind::Io, "The file has already been closed.")
}

fn file_read_all(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let Value::Object(r) = args[0] else {
        return Err(closed_error());
    };
    let mut contents = String::new();
    {
        let handle = vm.heap.file_mut(r);
        let file = handle.file.as_mut().ok_or_else(closed_error)?;
        file.read_to_string(&mut contents)
            .map_err(|_| NativeError::new(ErrorKind::Io, "Could not read the file."))?;
    }
    Ok(Value::Object(vm.take_string(contents)))
}

/// Read up to the next newline. Nil at end of file.
fn file_read_line(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let Value::Object(r) = args[0] else {
        return Err(closed_error());
    };
    let mut bytes = Vec::new();
    let mut saw_any = false;
    {
        let handle = vm.heap.file_mut(r);
        let file = handle.file.as_mut().ok_or_else(closed_error)?;
        let mut byte = [0u8; 1];
        loop {
            match file.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    saw_any = true;
                    if byte[0] == b'\n' {
                        break;
                    }
                    if byte[0] != b'\r' {
                        bytes.push(byte[0]);
                    }
                }
                Err(_) => {
                    return Err(NativeError::new(
                        ErrorKind::Io,
                        "Could not read the file.",
                    ));
                }
            }
        }
    }
    if !saw_any {
        return Ok(Value::Nil);
    }
    let line = String::from_utf8_lossy(&bytes).into_owned();
    Ok(Value::Object(vm.take_string(line)))
}

fn file_write(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let Value::Object(r) = args[0] else {
        return Err(closed_error());
    };
    let text = string_arg(vm, args, 1, "text")?;
    let handle = vm.heap.file_mut(r);
    let file = handle.file.as_mut().ok_or_else(closed_error)?;
    file.write_all(text.as_bytes())
        .map_err(|_| NativeError::new(ErrorKind::Io, "Could not write to the file."))?;
    Ok(Value::Nil)
}

fn file_writeln(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let Value::Object(r) = args[0] else {
        return Err(closed_error());
    };
    let text = string_arg(vm, args, 1, "text")?;
    let handle = vm.heap.file_mut(r);
    let file = handle.file.as_mut().ok_or_else(closed_error)?;
    file.write_all(text.as_bytes())
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|_| NativeError::new(ErrorKind::Io, "Could not write to the file."))?;
    Ok(Value::Nil)
}

/// Close the OS handle now instead of waiting for the sweep finalizer.
fn file_close(vm: &mut Vm, args: &[Value]) -> Value {
    if let Value::Object(r) = args[0] {
        vm.heap.file_mut(r).file = None;
    }
    Value::Nil
}
