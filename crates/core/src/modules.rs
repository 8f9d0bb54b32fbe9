//! Module records and the module loader.
//!
//! Every source file executes inside its own [`ModuleRecord`]: its globals,
//! its value stack, its call frames, and its open-upvalue list. The VM
//! always has exactly one current record and swaps it when crossing a
//! module boundary. The loader deduplicates through a cache keyed by
//! resolved absolute path, detects cycles with an import stack, and runs a
//! loaded module's top-level code to completion before the importer
//! resumes.

use std::path::PathBuf;

use tracing::debug;

use crate::compiler;
use crate::error::ErrorKind;
use crate::object::{Closure, Object};
use crate::table::{Table, hash_value};
use crate::value::{ObjRef, Value};
use crate::vm::{Vm, VmError};

/// Upper bound on one module's value stack.
pub const STACK_MAX: usize = 16 * 1024;

/// Upper bound on one module's call-frame stack.
pub const FRAMES_MAX: usize = 256;

/// An ongoing function call.
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: ObjRef,
    /// Offset into the function's code.
    pub ip: usize,
    /// Index of the frame's first stack slot.
    pub slots: usize,
}

/// One source file's execution context.
#[derive(Debug)]
pub struct ModuleRecord {
    /// Resolved absolute path (interned string).
    pub path: ObjRef,
    pub globals: Table,
    /// Names exported with `pub`, importable by other modules.
    pub publics: Table,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues, sorted descending by stack slot.
    pub open_upvalues: Vec<ObjRef>,
    /// Closure wrapping the top-level function.
    pub module_closure: Option<ObjRef>,
    pub is_executing: bool,
}

impl ModuleRecord {
    pub fn new(path: ObjRef) -> Self {
        Self {
            path,
            globals: Table::new(),
            publics: Table::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            module_closure: None,
            is_executing: false,
        }
    }
}

impl Vm {
    /// Load the module named by `path_text`, executing its top level if it
    /// has not run yet. Returns the module record, which is cached for
    /// subsequent imports.
    pub(crate) fn load_module(&mut self, path_text: &str) -> Result<ObjRef, VmError> {
        if let Some(native) = self.native_module(path_text) {
            return Ok(native);
        }

        let resolved = self.resolve_module_path(path_text)?;
        let resolved_text = resolved.to_string_lossy().replace('\\', "/");
        let path_str = self.copy_string(&resolved_text);
        // Root the path for the duration of the load.
        self.push(Value::Object(path_str))
            .map_err(VmError::Panic)?;

        if self.import_stack.contains(&path_str) {
            self.drop_roots(1);
            return Err(self.import_panic(format!(
                "Circular import of module '{}'.",
                resolved_text
            )));
        }

        let hash = hash_value(&self.heap, Value::Object(path_str))
            .unwrap_or_default();
        if let Some(Value::Object(cached)) = self.module_cache.get(Value::Object(path_str), hash) {
            if self.heap.module(cached).is_executing {
                self.drop_roots(1);
                return Err(self.import_panic(format!(
                    "Circular import of module '{}'.",
                    resolved_text
                )));
            }
            self.drop_roots(1);
            return Ok(cached);
        }

        debug!(path = %resolved_text, "loading module");
        let source = match std::fs::read_to_string(&resolved) {
            Ok(s) => s,
            Err(_) => {
                self.drop_roots(1);
                return Err(self.import_panic(format!(
                    "Could not read module '{}'.",
                    resolved_text
                )));
            }
        };

        let function = match compiler::compile(self, &source, &resolved_text) {
            Ok(f) => f,
            Err(e) => {
                self.drop_roots(1);
                return Err(VmError::Compile(e));
            }
        };
        // Root the function while the record and closure are allocated.
        self.push(Value::Object(function))
            .map_err(VmError::Panic)?;

        let module_ref = self.alloc(Object::Module(ModuleRecord::new(path_str)));
        self.push(Value::Object(module_ref))
            .map_err(VmError::Panic)?;
        self.bind_core_natives(module_ref);
        self.module_cache
            .set(Value::Object(path_str), hash, Value::Object(module_ref));

        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.heap.module_mut(module_ref).module_closure = Some(closure);

        let result = self.execute_module(module_ref, closure);
        // path, function, record.
        self.drop_roots(3);
        result?;
        debug!(path = %resolved_text, "module loaded");
        Ok(module_ref)
    }

    /// Run a module's top-level closure to completion on its own stack,
    /// with the current record swapped out for the duration.
    fn execute_module(&mut self, module_ref: ObjRef, closure: ObjRef) -> Result<(), VmError> {
        let previous = self.current_module;
        let path = self.heap.module(module_ref).path;
        self.import_stack.push(path);
        self.current_module = module_ref;
        {
            let record = self.heap.module_mut(module_ref);
            record.is_executing = true;
            record.stack.push(Value::Object(closure));
        }
        let result = self
            .call_closure(closure, 0)
            .map_err(VmError::Panic)
            .and_then(|_| self.run());
        {
            let record = self.heap.module_mut(module_ref);
            record.is_executing = false;
            record.frames.clear();
            record.stack.clear();
            record.open_upvalues.clear();
        }
        self.import_stack.pop();
        self.current_module = previous;
        result
    }

    /// Resolve an import path relative to the importing file's directory
    /// and canonicalize it. Files without an extension get `.crx`.
    fn resolve_module_path(&mut self, path_text: &str) -> Result<PathBuf, VmError> {
        let importer = self.heap.string(self.heap.module(self.current_module).path);
        let base = PathBuf::from(importer)
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut candidate = base.join(path_text);
        if candidate.extension().is_none() {
            candidate.set_extension("crx");
        }
        candidate.canonicalize().map_err(|_| {
            self.import_panic(format!("Could not resolve module path '{}'.", path_text))
        })
    }

    fn import_panic(&mut self, message: String) -> VmError {
        VmError::Panic(self.runtime_panic(ErrorKind::Import, message))
    }

    /// Pop transient GC roots pushed on the current module's stack.
    fn drop_roots(&mut self, n: usize) {
        let record = self.heap.module_mut(self.current_module);
        let len = record.stack.len();
        record.stack.truncate(len.saturating_sub(n));
    }
}
