//! Tricolor mark-and-sweep collection.
//!
//! Stop-the-world, single-threaded. Roots are every module record's stack,
//! frames, globals, and open upvalues (reached through the module cache and
//! the current record), the VM-level tables, the import stack, the match
//! registers, and the native registries. The intern table is deliberately
//! not a root — its entries are scrubbed before sweep so unreachable
//! strings can die.
//!
//! The worklist discipline: marking an object grays it; blackening pops it
//! and marks everything it references. Children are gathered from an
//! immutable view of the object before any marks are written, so the
//! mutator's invariants never meet a half-traced object.

use tracing::debug;

use crate::heap::{GC_GROW_FACTOR, GcStatus, INITIAL_GC_THRESHOLD};
use crate::object::{CruxResult, Object, Upvalue};
use crate::table::Table;
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

impl Vm {
    /// Run a full collection. No-op while the heap is paused (during a
    /// collection, compilation, or bulk interning).
    pub fn collect_garbage(&mut self) {
        if self.heap.status == GcStatus::Paused {
            return;
        }
        self.heap.status = GcStatus::Paused;
        let before = self.heap.bytes_allocated;
        debug!(bytes = before, "gc begin");

        self.gray.clear();
        self.mark_roots();
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }

        // Intern entries are weak: drop the ones whose string is dead.
        self.strings.remove_unmarked_keys(&self.heap);

        let (freed, freed_bytes) = self.heap.sweep();
        self.heap.next_gc = std::cmp::max(
            self.heap.bytes_allocated * GC_GROW_FACTOR,
            INITIAL_GC_THRESHOLD,
        );
        self.heap.status = GcStatus::Running;
        debug!(
            freed,
            freed_bytes,
            live_bytes = self.heap.bytes_allocated,
            next_gc = self.heap.next_gc,
            "gc end"
        );
    }

    fn mark_roots(&mut self) {
        let mut pending: Vec<ObjRef> = Vec::new();
        pending.push(self.current_module);
        pending.push(self.main_module);
        pending.extend(self.import_stack.iter().copied());
        pending.extend(self.native_modules.iter().map(|(_, r)| *r));
        collect_table_refs(&self.module_cache, &mut pending);
        collect_table_refs(&self.core_natives, &mut pending);
        collect_table_refs(&self.string_methods, &mut pending);
        collect_table_refs(&self.array_methods, &mut pending);
        collect_table_refs(&self.table_methods, &mut pending);
        collect_table_refs(&self.error_methods, &mut pending);
        collect_table_refs(&self.result_methods, &mut pending);
        collect_table_refs(&self.vector_methods, &mut pending);
        collect_table_refs(&self.file_methods, &mut pending);
        if let Some(Value::Object(r)) = self.match_handler.target {
            pending.push(r);
        }
        if let Some(Value::Object(r)) = self.match_handler.bind {
            pending.push(r);
        }
        for r in pending {
            self.mark_object(r);
        }
    }

    pub(crate) fn mark_object(&mut self, r: ObjRef) {
        if self.heap.mark(r) {
            self.gray.push(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        let mut children = Vec::new();
        collect_children(self.heap.get(r), &mut children);
        for child in children {
            self.mark_object(child);
        }
    }
}

fn push_value(value: Value, out: &mut Vec<ObjRef>) {
    if let Value::Object(r) = value {
        out.push(r);
    }
}

fn collect_table_refs(table: &Table, out: &mut Vec<ObjRef>) {
    for (key, value) in table.iter() {
        push_value(key, out);
        push_value(value, out);
    }
}

/// Every outgoing reference of one object.
fn collect_children(object: &Object, out: &mut Vec<ObjRef>) {
    match object {
        Object::String(_) | Object::Vector(_) => {}
        Object::Function(f) => {
            if let Some(name) = f.name {
                out.push(name);
            }
            for constant in &f.chunk.constants {
                push_value(*constant, out);
            }
        }
        Object::Closure(c) => {
            out.push(c.function);
            out.extend(c.upvalues.iter().copied());
        }
        Object::Upvalue(Upvalue::Open { module, .. }) => out.push(*module),
        Object::Upvalue(Upvalue::Closed(v)) => push_value(*v, out),
        Object::NativeFunction(n) => out.push(n.name),
        Object::NativeInfallibleFunction(n) => out.push(n.name),
        Object::NativeMethod(n) => out.push(n.name),
        Object::NativeInfallibleMethod(n) => out.push(n.name),
        Object::Array(items) => {
            for item in items {
                push_value(*item, out);
            }
        }
        Object::Table(table) => collect_table_refs(table, out),
        Object::Result(CruxResult::Ok(v)) => push_value(*v, out),
        Object::Result(CruxResult::Err(e)) => out.push(*e),
        Object::Error(e) => out.push(e.message),
        Object::Struct(s) => {
            out.push(s.name);
            out.extend(s.fields.iter().copied());
        }
        Object::StructInstance(i) => {
            out.push(i.struct_type);
            collect_table_refs(&i.fields, out);
        }
        Object::Module(m) => {
            out.push(m.path);
            collect_table_refs(&m.globals, out);
            collect_table_refs(&m.publics, out);
            for value in &m.stack {
                push_value(*value, out);
            }
            for frame in &m.frames {
                out.push(frame.closure);
            }
            out.extend(m.open_upvalues.iter().copied());
            if let Some(closure) = m.module_closure {
                out.push(closure);
            }
        }
        Object::File(f) => out.push(f.path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CruxString;
    use crate::table::fnv1a;

    #[test]
    fn test_unreachable_objects_are_collected() {
        let mut vm = Vm::new(vec![]);
        let baseline = vm.heap.live_count();
        for i in 0..100 {
            let text = format!("garbage-{}", i);
            let hash = fnv1a(text.as_bytes());
            vm.heap.insert(Object::String(CruxString { text, hash }));
        }
        assert_eq!(vm.heap.live_count(), baseline + 100);
        vm.collect_garbage();
        assert_eq!(vm.heap.live_count(), baseline, "unrooted strings must die");
    }

    #[test]
    fn test_rooted_values_survive() {
        let mut vm = Vm::new(vec![]);
        let s = vm.copy_string("survivor");
        vm.push_root(Value::Object(s));
        vm.collect_garbage();
        assert_eq!(vm.heap.string(s), "survivor");
        vm.pop_root();
    }

    #[test]
    fn test_intern_table_is_weak() {
        let mut vm = Vm::new(vec![]);
        let s = vm.copy_string("ephemeral-and-unique");
        vm.collect_garbage();
        // The entry was scrubbed; re-interning allocates a fresh object
        // rather than resurrecting a dangling one.
        let again = vm.copy_string("ephemeral-and-unique");
        assert_eq!(vm.heap.string(again), "ephemeral-and-unique");
        let _ = s; // the old handle is dead and must not be dereferenced
    }

    #[test]
    fn test_collection_is_reentrancy_safe() {
        let mut vm = Vm::new(vec![]);
        vm.heap.status = GcStatus::Paused;
        let before = vm.heap.live_count();
        vm.collect_garbage(); // must be a no-op while paused
        assert_eq!(vm.heap.live_count(), before);
        vm.heap.status = GcStatus::Running;
    }

    #[test]
    fn test_threshold_grows_after_collection() {
        let mut vm = Vm::new(vec![]);
        vm.collect_garbage();
        assert!(vm.heap.next_gc >= INITIAL_GC_THRESHOLD);
    }
}
