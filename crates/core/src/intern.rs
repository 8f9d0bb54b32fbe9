//! String interning.
//!
//! One process-wide interner lives on the VM. Interning guarantees that at
//! most one live string object exists for any byte sequence, so string
//! equality is handle equality and table lookups never compare bytes. The
//! intern table is weak: the collector scrubs entries whose string died
//! before sweeping.

use crate::object::{CruxString, Object};
use crate::table::fnv1a;
use crate::value::{ObjRef, Value};
use crate::vm::Vm;

impl Vm {
    /// Intern `text`, copying it. Returns the canonical string without
    /// allocating when an equivalent entry already exists.
    pub fn copy_string(&mut self, text: &str) -> ObjRef {
        let hash = fnv1a(text.as_bytes());
        if let Some(existing) = self.strings.find_string(&self.heap, text, hash) {
            return existing;
        }
        let r = self.alloc(Object::String(CruxString {
            text: text.to_string(),
            hash,
        }));
        self.strings.set(Value::Object(r), hash, Value::Nil);
        r
    }

    /// Intern an owned buffer. On a hit the buffer is dropped and the
    /// canonical entry returned; on a miss the buffer is adopted as-is.
    pub fn take_string(&mut self, text: String) -> ObjRef {
        let hash = fnv1a(text.as_bytes());
        if let Some(existing) = self.strings.find_string(&self.heap, &text, hash) {
            return existing;
        }
        let r = self.alloc(Object::String(CruxString { text, hash }));
        self.strings.set(Value::Object(r), hash, Value::Nil);
        r
    }

    /// `+` on two strings. The operands must be rooted by the caller (the
    /// dispatch loop peeks them) since interning may collect.
    pub(crate) fn concatenate(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        let mut text = String::with_capacity(
            self.heap.string(a).len() + self.heap.string(b).len(),
        );
        text.push_str(self.heap.string(a));
        text.push_str(self.heap.string(b));
        self.take_string(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_idempotent() {
        let mut vm = Vm::new(vec![]);
        let a = vm.copy_string("hello");
        let b = vm.copy_string("hello");
        assert_eq!(a, b, "equal bytes must intern to the same object");
        let c = vm.take_string("hello".to_string());
        assert_eq!(a, c);
    }

    #[test]
    fn test_distinct_strings_distinct_objects() {
        let mut vm = Vm::new(vec![]);
        let a = vm.copy_string("alpha");
        let b = vm.copy_string("beta");
        assert_ne!(a, b);
        assert_eq!(vm.heap.string(a), "alpha");
        assert_eq!(vm.heap.string(b), "beta");
    }

    #[test]
    fn test_concatenation_interns() {
        let mut vm = Vm::new(vec![]);
        let a = vm.copy_string("foo");
        let b = vm.copy_string("bar");
        let joined = vm.concatenate(a, b);
        assert_eq!(vm.heap.string(joined), "foobar");
        assert_eq!(joined, vm.copy_string("foobar"));
    }

    #[test]
    fn test_length_prefix_no_collision() {
        let mut vm = Vm::new(vec![]);
        let a = vm.copy_string("ab");
        let b = vm.copy_string("abc");
        assert_ne!(a, b);
    }
}
