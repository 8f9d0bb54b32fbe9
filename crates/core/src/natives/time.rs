//! Time natives, reachable through the `time` native module. Sleeps block
//! the OS thread; the runtime is single-threaded by design.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::NativeError;
use crate::natives::{define_fallible, define_infallible, number_arg};
use crate::table::Table;
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn module_table(vm: &mut Vm) -> Table {
    let mut table = Table::new();
    define_infallible(vm, &mut table, "now_seconds", 0, now_seconds);
    define_infallible(vm, &mut table, "now_millis", 0, now_millis);
    define_fallible(vm, &mut table, "sleep_seconds", 1, sleep_seconds);
    define_fallible(vm, &mut table, "sleep_millis", 1, sleep_millis);
    table
}

fn since_epoch() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

fn now_seconds(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(since_epoch().as_secs_f64())
}

fn now_millis(_vm: &mut Vm, _args: &[Value]) -> Value {
    Value::Float(since_epoch().as_millis() as f64)
}

fn sleep_seconds(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let seconds = number_arg(args, 0, "seconds")?.max(0.0);
    std::thread::sleep(Duration::from_secs_f64(seconds));
    Ok(Value::Nil)
}

fn sleep_millis(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let millis = number_arg(args, 0, "milliseconds")?.max(0.0);
    std::thread::sleep(Duration::from_secs_f64(millis / 1000.0));
    Ok(Value::Nil)
}
