//! Collector behavior under allocation churn, driven through real
//! programs rather than synthetic heaps.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crux_core::Vm;

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

#[test]
fn test_long_lived_array_survives_churn() {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(vec![], Box::new(buffer.clone()));
    // Force frequent collections so the churn loop crosses many cycles.
    vm.heap.next_gc = 16 * 1024;

    let source = "\
let keep = [1, 2, 3];
for (let i = 0; i < 10000; i = i + 1) {
  let junk = [i, i + 1, i + 2];
}
print(keep[0] + keep[1] + keep[2]);
print(length(keep));";
    vm.interpret(source, None).expect("churn program runs");

    let output = String::from_utf8(buffer.0.borrow().clone()).expect("output is UTF-8");
    assert_eq!(output, "6\n3\n");
    // 10 000 dead arrays must not accumulate: after one more cycle the
    // heap is back to the same order of magnitude as the startup heap.
    vm.collect_garbage();
    assert!(
        vm.heap.live_count() < 1000,
        "live objects not bounded: {}",
        vm.heap.live_count()
    );
}

#[test]
fn test_collection_during_string_churn_keeps_interning_sound() {
    let mut vm = Vm::new(vec![]);
    vm.heap.next_gc = 16 * 1024;
    let source = "\
let keep = \"base\";
for (let i = 0; i < 5000; i = i + 1) {
  let s = string(i) + \"-suffix\";
}
let check = \"ba\" + \"se\";
";
    vm.interpret(source, None).expect("string churn runs");
    // Concatenation and interning agree after arbitrary collections.
    let a = vm.copy_string("base");
    let b = vm.copy_string("base");
    assert_eq!(a, b);
}

#[test]
fn test_closures_survive_collection() {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(vec![], Box::new(buffer.clone()));
    vm.heap.next_gc = 16 * 1024;
    let source = "\
fn make(base) {
  fn add(n) { return base + n; }
  return add;
}
let add5 = make(5);
for (let i = 0; i < 5000; i = i + 1) {
  let junk = [i, [i], [[i]]];
}
print(add5(37));";
    vm.interpret(source, None).expect("closure churn runs");
    let output = String::from_utf8(buffer.0.borrow().clone()).expect("output is UTF-8");
    assert_eq!(output, "42\n");
}

#[test]
fn test_bytes_allocated_shrinks_after_collection() {
    let mut vm = Vm::new(vec![]);
    vm.heap.next_gc = usize::MAX; // no automatic collections
    vm.interpret(
        "for (let i = 0; i < 2000; i = i + 1) { let junk = [i, i, i]; }",
        None,
    )
    .expect("program runs");
    let before = vm.heap.bytes_allocated;
    vm.collect_garbage();
    assert!(
        vm.heap.bytes_allocated < before,
        "sweep must return dead bytes to the ledger"
    );
}
