//! Math natives: a few bound globally (`sqrt`, `abs`, `pow`), the rest
//! reachable through the `math` native module.

use std::f64::consts;

use crate::error::{ErrorKind, NativeError};
use crate::natives::{define_fallible, define_infallible, number_arg};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn module_table(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_fallible(vm, &mut table, "pow", 2, pow);
    define_fallible(vm, &mut table, "sqrt", 1, sqrt);
    define_fallible(vm, &mut table, "abs", 1, abs);
    define_fallible(vm, &mut table, "sin", 1, sin);
    define_fallible(vm, &mut table, "cos", 1, cos);
    define_fallible(vm, &mut table, "tan", 1, tan);
    define_fallible(vm, &mut table, "asin", 1, asin);
    define_fallible(vm, &mut table, "acos", 1, acos);
    define_fallible(vm, &mut table, "atan", 1, atan);
    define_fallible(vm, &mut table, "exp", 1, exp);
    define_fallible(vm, &mut table, "ln", 1, ln);
    define_fallible(vm, &mut table, "log10", 1, log10);
    define_fallible(vm, &mut table, "ceil", 1, ceil);
    define_fallible(vm, &mut table, "floor", 1, floor);
    define_fallible(vm, &mut table, "round", 1, round);
    define_fallible(vm, &mut table, "min", 2, min);
    define_fallible(vm, &mut table, "max", 2, max);
    define_infallible(vm, &mut table, "pi", 0, pi);
    define_infallible(vm, &mut table, "e", 0, e);
    table
}

pub(crate) fn sqrt(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let x = number_arg(args, 0, "value")?;
    if x < 0.0 {
        return Err(NativeError::new(
            ErrorKind::Math,
            "Cannot take the square root of a negative number.",
        ));
    }
    Ok(Value::Float(x.sqrt()))
}

pub(crate) fn abs(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    match args[0] {
        Value::Int(i) => Ok(Value::Int(i.wrapping_abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        _ => Err(NativeError::new(
            ErrorKind::Type,
            "Argument <value> must be a number.",
        )),
    }
}

pub(crate) fn pow(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let base = number_arg(args, 0, "base")?;
    let exponent = number_arg(args, 1, "exponent")?;
    Ok(Value::Float(base.powf(exponent)))
}

fn sin(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.sin()))
}

fn cos(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.cos()))
}

fn tan(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.tan()))
}

fn asin(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let x = number_arg(args, 0, "value")?;
    if !(-1.0..=1.0).contains(&x) {
        return Err(NativeError::new(
            ErrorKind::Math,
            "Argument <value> must be between -1 and 1.",
        ));
    }
    Ok(Value::Float(x.asin()))
}

fn acos(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let x = number_arg(args, 0, "value")?;
    if !(-1.0..=1.0).contains(&x) {
        return Err(NativeError::new(
            ErrorKind::Math,
            "Argument <value> must be between -1 and 1.",
        ));
    }
    Ok(Value::Float(x.acos()))
}

fn atan(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.atan()))
}

fn exp(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.exp()))
}

fn ln(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let x = number_arg(args, 0, "value")?;
    if x <= 0.0 {
        return Err(NativeError::new(
            ErrorKind::Math,
            "Cannot take the logarithm of a non-positive number.",
        ));
    }
    Ok(Value::Float(x.ln()))
}

fn log10(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let x = number_arg(args, 0, "value")?;
    if x <= 0.0 {
        return Err(NativeError::new(
            ErrorKind::Math,
            "Cannot take the logarithm of a non-positive number.",
        ));
    }
    Ok(Value::Float(x.log10()))
}

fn ceil(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.ceil()))
}

fn floor(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.floor()))
}

fn round(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    Ok(Value::Float(number_arg(args, 0, "value")?.round()))
}

fn min(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = number_arg(args, 0, "first")?;
    let b = number_arg(args, 1, "second")?;
    Ok(if a <= b { args[0] } else { args[1] })
}

fn max(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let a = number_arg(args, 0, "first")?;
    let b = number_arg(args, 1, "second")?;
    Ok(if a >= b { args[0] } else { args[1] })
}

fn pi(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(consts::PI)
}

fn e(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(consts::E)
}
