//! End-to-end interpreter tests: source text in, stdout and exit status
//! out. Output is captured through the VM's pluggable writer.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crux_core::{InterpretError, Vm};

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), ()>, String) {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(vec![], Box::new(buffer.clone()));
    let result = vm.interpret(source, None).map_err(|_| ());
    let output = String::from_utf8(buffer.0.borrow().clone()).expect("output is UTF-8");
    (result, output)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert!(result.is_ok(), "program failed; output so far: {output:?}");
    output
}

#[test]
fn test_arithmetic_and_print() {
    assert_eq!(run_ok("print(1 + 2 * 3);"), "7\n");
}

#[test]
fn test_division_always_floats() {
    assert_eq!(run_ok("print(7 / 2);"), "3.5\n");
    assert_eq!(run_ok("print(4 / 2);"), "2\n");
}

#[test]
fn test_integer_overflow_wraps() {
    assert_eq!(run_ok("print(2147483647 + 1);"), "-2147483648\n");
}

#[test]
fn test_mixed_arithmetic_promotes() {
    assert_eq!(run_ok("print(1 + 0.5);"), "1.5\n");
    assert_eq!(run_ok("print(2 * 3.0);"), "6\n");
}

#[test]
fn test_power_and_shifts() {
    assert_eq!(run_ok("print(2 ** 10);"), "1024\n");
    assert_eq!(run_ok("print(2 ** -1);"), "0.5\n");
    assert_eq!(run_ok("print(2 ** 3 ** 2);"), "512\n");
    assert_eq!(run_ok("print(1 << 4);"), "16\n");
    assert_eq!(run_ok("print(256 >> 4);"), "16\n");
}

#[test]
fn test_equality_is_tag_first() {
    assert_eq!(run_ok("print(1 == 1.0);"), "false\n");
    assert_eq!(run_ok("print(1 == 1);"), "true\n");
    assert_eq!(run_ok("print(\"a\" + \"b\" == \"ab\");"), "true\n");
}

#[test]
fn test_string_ordering() {
    assert_eq!(run_ok("print(\"apple\" < \"banana\");"), "true\n");
}

#[test]
fn test_logical_operators_short_circuit() {
    assert_eq!(run_ok("print(true and 5);"), "5\n");
    assert_eq!(run_ok("print(false or \"x\");"), "x\n");
    assert_eq!(run_ok("print(nil and 1);"), "nil\n");
    assert_eq!(run_ok("print(not false);"), "true\n");
}

#[test]
fn test_typeof_operator() {
    assert_eq!(run_ok("print(typeof 1);"), "int\n");
    assert_eq!(run_ok("print(typeof 1.5);"), "float\n");
    assert_eq!(run_ok("print(typeof \"s\");"), "string\n");
    assert_eq!(run_ok("print(typeof [1]);"), "array\n");
    assert_eq!(run_ok("print(typeof nil);"), "nil\n");
}

#[test]
fn test_closure_captures_mutable_state() {
    let source = "\
fn make() { let x = 10; fn inc() { x = x + 1; return x; } return inc; }
let c = make(); print(c()); print(c());";
    assert_eq!(run_ok(source), "11\n12\n");
}

#[test]
fn test_closures_share_upvalues() {
    let source = "\
fn make() {
  let x = 0;
  fn inc() { x = x + 1; return x; }
  fn get() { return x; }
  return [inc, get];
}
let fns = make();
let inc = fns[0];
let get = fns[1];
inc(); inc();
print(get());";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn test_table_round_trip() {
    let source = "let t = {}; t[\"a\"] = 1; t[\"b\"] = 2; print(length(t));";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn test_table_literal_and_lookup() {
    assert_eq!(run_ok("let t = {\"k\": 41}; print(t[\"k\"] + 1);"), "42\n");
    assert_eq!(run_ok("let t = {1: \"one\"}; print(t[1]);"), "one\n");
    assert_eq!(run_ok("let t = {}; print(t[\"missing\"]);"), "nil\n");
}

#[test]
fn test_array_literals_and_indexing() {
    assert_eq!(run_ok("let a = [10, 20, 30]; print(a[1]);"), "20\n");
    assert_eq!(run_ok("let a = [1, 2]; a[0] = 9; print(a[0] + a[1]);"), "11\n");
    assert_eq!(run_ok("print(length([1, 2, 3]));"), "3\n");
}

#[test]
fn test_array_methods() {
    let source = "\
let a = [1, 2];
a.push(3);
print(length(a));
print(a.contains(2));
print(a.index_of(3));";
    assert_eq!(run_ok(source), "3\ntrue\n2\n");
}

#[test]
fn test_string_methods() {
    assert_eq!(run_ok("print(\"abc\".upper());"), "ABC\n");
    assert_eq!(run_ok("print(\"  x  \".trim());"), "x\n");
    assert_eq!(run_ok("print(\"h\" + \"i\"[0]);"), "hi\n");
}

#[test]
fn test_error_result_match() {
    let source = "\
let r = sqrt(-1);
match r { Ok(v) => print(v); Err(e) => print(\"bad\"); }";
    assert_eq!(run_ok(source), "bad\n");
}

#[test]
fn test_ok_result_match_binds_payload() {
    let source = "\
let r = sqrt(9);
match r { Ok(v) => print(v); Err(e) => print(\"bad\"); }";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn test_match_literals_and_default() {
    let source = "\
let x = 2;
match x {
  1 => print(\"one\");
  2 => print(\"two\");
  default => print(\"many\");
}
match 9 { 1 => print(\"one\"); default => print(\"many\"); }";
    assert_eq!(run_ok(source), "two\nmany\n");
}

#[test]
fn test_result_methods() {
    let source = "\
let good = sqrt(4);
let bad = sqrt(-4);
print(good.is_ok());
print(bad.is_err());
print(good.unwrap_or(0));
print(bad.unwrap_or(0));";
    assert_eq!(run_ok(source), "true\ntrue\n2\n0\n");
}

#[test]
fn test_error_object_kind() {
    let source = "\
match sqrt(-1) {
  Ok(v) => print(v);
  Err(e) => { print(e.kind()); print(e.message()); }
}";
    assert_eq!(
        run_ok(source),
        "MATH\nCannot take the square root of a negative number.\n"
    );
}

#[test]
fn test_while_and_for_loops() {
    let source = "\
let sum = 0;
let i = 0;
while (i < 5) { sum += i; i += 1; }
for (let j = 0; j < 5; j = j + 1) { sum += j; }
print(sum);";
    assert_eq!(run_ok(source), "20\n");
}

#[test]
fn test_break_and_continue() {
    let source = "\
let sum = 0;
for (let i = 0; i < 10; i = i + 1) {
  if (i == 3) { continue; }
  if (i == 6) { break; }
  sum += i;
}
print(sum);";
    // 0 + 1 + 2 + 4 + 5
    assert_eq!(run_ok(source), "12\n");
}

#[test]
fn test_structs() {
    let source = "\
struct Point { x, y }
let p = new Point { x: 1, y: 2 };
print(p.x + p.y);
p.x = 10;
print(p.x);
print(typeof p);";
    assert_eq!(run_ok(source), "3\n10\ninstance\n");
}

#[test]
fn test_casts_round_trip() {
    assert_eq!(run_ok("print(int(float(41)) + 1);"), "42\n");
    assert_eq!(run_ok("print(int(\"41\") + 1);"), "42\n");
    assert_eq!(run_ok("print(float(\"1.5\"));"), "1.5\n");
    assert_eq!(run_ok("print(string(42) + \"!\");"), "42!\n");
    assert_eq!(run_ok("print(int(true));"), "1\n");
}

#[test]
fn test_vector_module() {
    let source = "\
use {vec2, vec3} from \"vec\";
let a = vec2(3, 4);
match a.magnitude() { Ok(m) => print(m); Err(e) => print(\"bad\"); }
let b = vec3(1, 0, 0);
let c = vec3(0, 1, 0);
match b.cross(c) { Ok(v) => print(v.z()); Err(e) => print(\"bad\"); }";
    assert_eq!(run_ok(source), "5\n1\n");
}

#[test]
fn test_repl_state_persists_across_lines() {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(vec![], Box::new(buffer.clone()));
    vm.interpret("let a = 40;", None).expect("first line runs");
    vm.interpret("print(a + 2);", None).expect("second line runs");
    let output = String::from_utf8(buffer.0.borrow().clone()).expect("output is UTF-8");
    assert_eq!(output, "42\n");
}

#[test]
fn test_runtime_error_then_recovery() {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(vec![], Box::new(buffer.clone()));
    assert!(vm.interpret("print(undefined_name);", None).is_err());
    // The VM must remain usable, REPL-style.
    vm.interpret("print(1 + 1);", None).expect("vm recovered");
    let output = String::from_utf8(buffer.0.borrow().clone()).expect("output is UTF-8");
    assert_eq!(output, "2\n");
}

#[test]
fn test_runtime_errors() {
    let failing = [
        "print(undefined_name);",
        "print(1 / 0);",
        "print(5 % 0);",
        "print(1 + \"x\");",
        "print(1 < \"x\");",
        "print(1.5 << 1);",
        "print(-\"s\");",
        "let a = [1]; print(a[3]);",
        "let t = {}; t[0.0 / 0.0 * 0.0] = 1;",
        "let x = 5; x(1);",
        "fn f(a) { return a; } f(1, 2);",
    ];
    for source in failing {
        let (result, _) = run(source);
        assert!(result.is_err(), "expected runtime error for: {source}");
    }
}

#[test]
fn test_compile_error_classification() {
    let mut vm = Vm::new(vec![]);
    match vm.interpret("let x = ;", None) {
        Err(InterpretError::Compile(_)) => {}
        other => panic!("expected a compile error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_deep_recursion_overflows_frames() {
    let (result, _) = run("fn f() { return f(); } f();");
    assert!(result.is_err(), "unbounded recursion must raise an error");
}

#[test]
fn test_nan_table_key_is_rejected() {
    let (result, _) = run("let t = {}; t[(0.0 / 1.0) ** 0.5] = 1;");
    // sqrt via ** of a non-negative float is fine; build NaN explicitly
    // instead through float parsing.
    assert!(result.is_ok());
    let (result, _) = run("let t = {}; let nan = float(\"nan\"); t[nan] = 1;");
    assert!(result.is_err(), "NaN keys must raise a VALUE error");
}
