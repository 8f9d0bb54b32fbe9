//! The virtual machine: state, call machinery, and the dispatch loop.
//!
//! A `Vm` owns the heap, the string interner, the module cache, the
//! per-type method tables, and the native-module registry. Execution always
//! happens against exactly one current [`ModuleRecord`]; crossing a module
//! boundary swaps the record and nothing else.
//!
//! GC safety: any value that must survive an allocation is rooted on the
//! current module's value stack first (`push_root` / `pop_root`). The
//! dispatch loop itself never caches heap borrows across an allocation —
//! chunks are shared `Rc`s and stack positions are plain indices.

use std::io::Write;
use std::path::Path;
use std::rc::Rc;

use tracing::debug;

use crate::chunk::{Chunk, OpCode};
use crate::compiler;
use crate::error::{CompileError, ErrorKind, InterpretError, NativeError, VmPanic};
use crate::heap::{GcStatus, Heap};
use crate::modules::{CallFrame, FRAMES_MAX, ModuleRecord, STACK_MAX};
use crate::natives;
use crate::object::{
    Closure, CruxResult, ErrorObject, NativeFn, NativeInfallibleFn, Object, Upvalue,
};
use crate::table::{Table, hash_value};
use crate::value::{ObjRef, Value};

/// Registers backing the `match` construct: the value being matched and
/// the binding produced by the last successful pattern.
#[derive(Debug, Default)]
pub struct MatchHandler {
    pub target: Option<Value>,
    pub bind: Option<Value>,
}

/// Internal error channel of the dispatch loop. Compile errors can surface
/// at runtime when an import compiles a new module.
#[derive(Debug)]
pub(crate) enum VmError {
    Compile(CompileError),
    Panic(VmPanic),
}

impl From<VmPanic> for VmError {
    fn from(p: VmPanic) -> Self {
        VmError::Panic(p)
    }
}

impl From<VmError> for InterpretError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Compile(c) => InterpretError::Compile(c),
            VmError::Panic(p) => InterpretError::Runtime(p),
        }
    }
}

pub struct Vm {
    pub heap: Heap,
    /// String interner; weak with respect to the GC.
    pub(crate) strings: Table,
    /// Resolved path string -> module record.
    pub(crate) module_cache: Table,
    pub(crate) current_module: ObjRef,
    pub(crate) main_module: ObjRef,
    /// Paths currently being loaded, for cycle detection.
    pub(crate) import_stack: Vec<ObjRef>,
    /// Natives bound into every fresh module record.
    pub(crate) core_natives: Table,
    pub(crate) string_methods: Table,
    pub(crate) array_methods: Table,
    pub(crate) table_methods: Table,
    pub(crate) error_methods: Table,
    pub(crate) result_methods: Table,
    pub(crate) vector_methods: Table,
    pub(crate) file_methods: Table,
    /// Pre-registered modules importable by bare name.
    pub(crate) native_modules: Vec<(String, ObjRef)>,
    pub(crate) match_handler: MatchHandler,
    /// Reusable gray worklist for the collector.
    pub(crate) gray: Vec<ObjRef>,
    /// Raw command-line arguments, exposed through `sys.args`.
    pub args: Vec<String>,
    pub(crate) out: Box<dyn Write>,
}

impl Vm {
    pub fn new(args: Vec<String>) -> Self {
        Self::with_output(args, Box::new(std::io::stdout()))
    }

    /// Build a VM writing program output to `out`. Used by the REPL and by
    /// tests that capture stdout.
    pub fn with_output(args: Vec<String>, out: Box<dyn Write>) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            strings: Table::new(),
            module_cache: Table::new(),
            current_module: ObjRef(0),
            main_module: ObjRef(0),
            import_stack: Vec::new(),
            core_natives: Table::new(),
            string_methods: Table::new(),
            array_methods: Table::new(),
            table_methods: Table::new(),
            error_methods: Table::new(),
            result_methods: Table::new(),
            vector_methods: Table::new(),
            file_methods: Table::new(),
            native_modules: Vec::new(),
            match_handler: MatchHandler::default(),
            gray: Vec::new(),
            args,
            out,
        };
        // Initialization allocates freely; no roots exist yet.
        vm.heap.status = GcStatus::Paused;
        natives::install(&mut vm);
        let pseudo = std::env::current_dir()
            .map(|d| d.join("<repl>").to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| "<repl>".to_string());
        let path = vm.copy_string(&pseudo);
        let main = vm.alloc(Object::Module(ModuleRecord::new(path)));
        vm.bind_core_natives(main);
        vm.main_module = main;
        vm.current_module = main;
        vm.heap.status = GcStatus::Running;
        debug!("vm initialized");
        vm
    }

    /// Compile and execute `source` in the main module. When `path` is
    /// given it becomes the module's resolved path, which import
    /// resolution is relative to. Globals persist across calls, which is
    /// what keeps REPL state alive.
    pub fn interpret(&mut self, source: &str, path: Option<&Path>) -> Result<(), InterpretError> {
        if let Some(p) = path {
            let canon = p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
            let text = canon.to_string_lossy().replace('\\', "/");
            let s = self.copy_string(&text);
            self.heap.module_mut(self.main_module).path = s;
        }
        self.current_module = self.main_module;
        let path_text = self
            .heap
            .string(self.heap.module(self.main_module).path)
            .to_string();

        let function = compiler::compile(self, source, &path_text)?;

        self.push_root(Value::Object(function));
        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.pop_root();
        self.push_root(Value::Object(closure));

        let main_path = self.heap.module(self.main_module).path;
        self.import_stack.push(main_path);
        let result = self
            .call_closure(closure, 0)
            .map_err(VmError::Panic)
            .and_then(|_| self.run());
        self.import_stack.pop();

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.reset_after_error();
                Err(e.into())
            }
        }
    }

    /// Put the VM back into a runnable state after a runtime error, so a
    /// REPL can keep going.
    fn reset_after_error(&mut self) {
        self.current_module = self.main_module;
        let record = self.heap.module_mut(self.main_module);
        record.stack.clear();
        record.frames.clear();
        record.open_upvalues.clear();
        self.import_stack.clear();
        self.match_handler.target = None;
        self.match_handler.bind = None;
    }

    // ----- allocation and rooting -----

    /// Allocate a heap object, collecting first if the byte ledger crossed
    /// the threshold. Everything the caller needs to survive this call
    /// must be reachable from a root.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        if self.heap.status == GcStatus::Running && self.heap.bytes_allocated > self.heap.next_gc {
            self.collect_garbage();
        }
        self.heap.insert(object)
    }

    /// Root a transient value on the current module's stack. Pair with
    /// `pop_root`; the slot is invisible to the program.
    pub fn push_root(&mut self, value: Value) {
        self.heap
            .module_mut(self.current_module)
            .stack
            .push(value);
    }

    pub fn pop_root(&mut self) {
        self.heap.module_mut(self.current_module).stack.pop();
    }

    // ----- stack primitives -----

    pub(crate) fn push(&mut self, value: Value) -> Result<(), VmPanic> {
        if self.heap.module(self.current_module).stack.len() >= STACK_MAX {
            return Err(self.runtime_panic(ErrorKind::StackOverflow, "Stack overflow.".to_string()));
        }
        self.heap.module_mut(self.current_module).stack.push(value);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Result<Value, VmPanic> {
        match self.heap.module_mut(self.current_module).stack.pop() {
            Some(v) => Ok(v),
            None => Err(self.runtime_panic(ErrorKind::Runtime, "Stack underflow.".to_string())),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        let stack = &self.heap.module(self.current_module).stack;
        stack[stack.len() - 1 - distance]
    }

    fn stack_len(&self) -> usize {
        self.heap.module(self.current_module).stack.len()
    }

    fn truncate_stack(&mut self, len: usize) {
        self.heap
            .module_mut(self.current_module)
            .stack
            .truncate(len);
    }

    // ----- errors -----

    /// Raise a runtime panic: print the message and a frame-by-frame stack
    /// trace of the current module, then hand back the panic for
    /// propagation up to the module boundary.
    pub(crate) fn runtime_panic(&self, kind: ErrorKind, message: String) -> VmPanic {
        eprintln!("{} error: {}", kind, message);
        let record = self.heap.module(self.current_module);
        for frame in record.frames.iter().rev() {
            let closure = self.heap.closure(frame.closure);
            let function = self.heap.function(closure.function);
            let line = function.chunk.line_for(frame.ip);
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.string(name)),
                None => eprintln!("[line {}] in {}", line, self.heap.string(record.path)),
            }
        }
        VmPanic { kind, message }
    }

    /// The `typeof` name for a value.
    pub fn type_of(&self, value: Value) -> &'static str {
        match value {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Object(r) => self.heap.get(r).type_name(),
        }
    }

    /// Render a value the way `print` and `string()` do.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Object(r) => self.format_object(r),
        }
    }

    fn format_object(&self, r: ObjRef) -> String {
        match self.heap.get(r) {
            Object::String(s) => s.text.clone(),
            Object::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", self.heap.string(n)),
                None => "<script>".to_string(),
            },
            Object::Closure(c) => self.format_object(c.function),
            Object::NativeFunction(n) => format!("<native fn {}>", self.heap.string(n.name)),
            Object::NativeInfallibleFunction(n) => {
                format!("<native fn {}>", self.heap.string(n.name))
            }
            Object::NativeMethod(n) => format!("<native fn {}>", self.heap.string(n.name)),
            Object::NativeInfallibleMethod(n) => {
                format!("<native fn {}>", self.heap.string(n.name))
            }
            Object::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| self.format_value(*v)).collect();
                format!("[{}]", parts.join(", "))
            }
            Object::Table(table) => {
                let parts: Vec<String> = table
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.format_value(k), self.format_value(v)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Object::Result(CruxResult::Ok(v)) => format!("Ok({})", self.format_value(*v)),
            Object::Result(CruxResult::Err(e)) => format!("Err({})", self.format_object(*e)),
            Object::Error(e) => format!(
                "<{} error: {}>",
                e.kind.as_str(),
                self.heap.string(e.message)
            ),
            Object::Vector(v) => {
                let parts: Vec<String> = v.parts().iter().map(|c| c.to_string()).collect();
                format!("vec{}({})", v.dims, parts.join(", "))
            }
            Object::Struct(s) => format!("<struct {}>", self.heap.string(s.name)),
            Object::StructInstance(i) => {
                let name = self.heap.string(self.heap.struct_type(i.struct_type).name);
                let parts: Vec<String> = i
                    .fields
                    .iter()
                    .map(|(k, v)| format!("{}: {}", self.format_value(k), self.format_value(v)))
                    .collect();
                format!("{} {{ {} }}", name, parts.join(", "))
            }
            Object::Module(m) => format!("<module {}>", self.heap.string(m.path)),
            Object::Upvalue(_) => "<upvalue>".to_string(),
            Object::File(f) => format!("<file {}>", self.heap.string(f.path)),
        }
    }

    // ----- result wrapping -----

    /// Wrap a native's success value in a heap `Ok` result. The payload is
    /// rooted for the duration of the allocation.
    pub(crate) fn ok_result(&mut self, value: Value) -> ObjRef {
        self.push_root(value);
        let r = self.alloc(Object::Result(CruxResult::Ok(value)));
        self.pop_root();
        r
    }

    /// Build an `Err` result carrying a fresh error object.
    pub(crate) fn err_result(&mut self, error: NativeError) -> ObjRef {
        let message = self.copy_string(&error.message);
        self.push_root(Value::Object(message));
        let err = self.alloc(Object::Error(ErrorObject {
            message,
            kind: error.kind,
            is_panic: false,
        }));
        self.pop_root();
        self.push_root(Value::Object(err));
        let result = self.alloc(Object::Result(CruxResult::Err(err)));
        self.pop_root();
        result
    }

    // ----- calls -----

    pub(crate) fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), VmPanic> {
        if let Value::Object(r) = callee {
            match self.heap.get(r) {
                Object::Closure(_) => return self.call_closure(r, argc),
                Object::NativeFunction(n) => {
                    let (f, arity, name) = (n.function, n.arity, n.name);
                    return self.call_native_fallible(f, arity, name, argc, false);
                }
                Object::NativeInfallibleFunction(n) => {
                    let (f, arity, name) = (n.function, n.arity, n.name);
                    return self.call_native_infallible(f, arity, name, argc, false);
                }
                _ => {}
            }
        }
        Err(self.runtime_panic(
            ErrorKind::Type,
            format!("Value of type '{}' is not callable.", self.type_of(callee)),
        ))
    }

    pub(crate) fn call_closure(&mut self, closure: ObjRef, argc: u8) -> Result<(), VmPanic> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if argc != arity {
            return Err(self.runtime_panic(
                ErrorKind::Argument,
                format!("Expected {} arguments but got {}.", arity, argc),
            ));
        }
        let record = self.heap.module(self.current_module);
        if record.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_panic(
                ErrorKind::StackOverflow,
                "Call depth exceeded the frame limit.".to_string(),
            ));
        }
        let slots = record.stack.len() - argc as usize - 1;
        self.heap
            .module_mut(self.current_module)
            .frames
            .push(CallFrame {
                closure,
                ip: 0,
                slots,
            });
        Ok(())
    }

    fn check_native_arity(&self, name: ObjRef, arity: u8, argc: u8) -> Result<(), VmPanic> {
        if argc != arity {
            let name = self.heap.string(name).to_string();
            return Err(self.runtime_panic(
                ErrorKind::Argument,
                format!("Function '{}' expected {} arguments but got {}.", name, arity, argc),
            ));
        }
        Ok(())
    }

    /// Invoke a fallible native and push the resulting `Result` object.
    /// `with_receiver` is set for method calls, whose receiver occupies the
    /// callee slot and becomes `args[0]`.
    fn call_native_fallible(
        &mut self,
        f: NativeFn,
        arity: u8,
        name: ObjRef,
        argc: u8,
        with_receiver: bool,
    ) -> Result<(), VmPanic> {
        self.check_native_arity(name, arity, argc)?;
        let len = self.stack_len();
        let take = argc as usize + usize::from(with_receiver);
        let args: Vec<Value> = {
            let stack = &self.heap.module(self.current_module).stack;
            stack[len - take..].to_vec()
        };
        let outcome = f(self, &args);
        let result = match outcome {
            Ok(v) => self.ok_result(v),
            Err(e) => self.err_result(e),
        };
        self.truncate_stack(len - argc as usize - 1);
        self.push(Value::Object(result))
    }

    fn call_native_infallible(
        &mut self,
        f: NativeInfallibleFn,
        arity: u8,
        name: ObjRef,
        argc: u8,
        with_receiver: bool,
    ) -> Result<(), VmPanic> {
        self.check_native_arity(name, arity, argc)?;
        let len = self.stack_len();
        let take = argc as usize + usize::from(with_receiver);
        let args: Vec<Value> = {
            let stack = &self.heap.module(self.current_module).stack;
            stack[len - take..].to_vec()
        };
        let value = f(self, &args);
        self.truncate_stack(len - argc as usize - 1);
        self.push(value)
    }

    /// Method-call dispatch for `receiver.name(args)`.
    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), VmPanic> {
        let receiver = self.peek(argc as usize);
        let hash = match self.heap.string_hash(name) {
            Some(h) => h,
            None => panic!("method name is not a string"),
        };
        let Value::Object(r) = receiver else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' has no methods.", self.type_of(receiver)),
            ));
        };
        let key = Value::Object(name);
        match self.heap.get(r) {
            Object::Module(m) => {
                let found = m.publics.get(key, hash);
                let path = self.heap.string(m.path).to_string();
                let Some(callee) = found else {
                    let n = self.heap.string(name).to_string();
                    return Err(self.runtime_panic(
                        ErrorKind::Name,
                        format!("Module '{}' has no public member '{}'.", path, n),
                    ));
                };
                let base = self.stack_len() - argc as usize - 1;
                self.heap.module_mut(self.current_module).stack[base] = callee;
                self.call_value(callee, argc)
            }
            Object::StructInstance(i) => {
                let found = i.fields.get(key, hash);
                let type_name = self
                    .heap
                    .string(self.heap.struct_type(i.struct_type).name)
                    .to_string();
                let Some(callee) = found else {
                    let n = self.heap.string(name).to_string();
                    return Err(self.runtime_panic(
                        ErrorKind::Name,
                        format!("Instance of '{}' has no field '{}'.", type_name, n),
                    ));
                };
                let base = self.stack_len() - argc as usize - 1;
                self.heap.module_mut(self.current_module).stack[base] = callee;
                self.call_value(callee, argc)
            }
            other => {
                let table = match other {
                    Object::String(_) => &self.string_methods,
                    Object::Array(_) => &self.array_methods,
                    Object::Table(_) => &self.table_methods,
                    Object::Error(_) => &self.error_methods,
                    Object::Result(_) => &self.result_methods,
                    Object::Vector(_) => &self.vector_methods,
                    Object::File(_) => &self.file_methods,
                    _ => {
                        let type_name = other.type_name();
                        return Err(self.runtime_panic(
                            ErrorKind::Type,
                            format!("Value of type '{}' has no methods.", type_name),
                        ));
                    }
                };
                let found = table.get(key, hash);
                let Some(Value::Object(m)) = found else {
                    let type_name = self.heap.get(r).type_name();
                    let n = self.heap.string(name).to_string();
                    return Err(self.runtime_panic(
                        ErrorKind::Name,
                        format!("Value of type '{}' has no method '{}'.", type_name, n),
                    ));
                };
                match self.heap.get(m) {
                    Object::NativeMethod(n) => {
                        let (f, arity, mname) = (n.function, n.arity, n.name);
                        self.call_native_fallible(f, arity, mname, argc, true)
                    }
                    Object::NativeInfallibleMethod(n) => {
                        let (f, arity, mname) = (n.function, n.arity, n.name);
                        self.call_native_infallible(f, arity, mname, argc, true)
                    }
                    _ => panic!("method table entry is not a native method"),
                }
            }
        }
    }

    // ----- upvalues -----

    /// Find or create an open upvalue for a stack slot of the current
    /// module. The open list stays sorted descending by slot so closing a
    /// range is a prefix walk.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let module = self.current_module;
        {
            let record = self.heap.module(module);
            for &uv in &record.open_upvalues {
                if let Upvalue::Open { slot: s, .. } = self.heap.upvalue(uv) {
                    if *s == slot {
                        return uv;
                    }
                    if *s < slot {
                        break;
                    }
                }
            }
        }
        let created = self.alloc(Object::Upvalue(Upvalue::Open { module, slot }));
        let mut position = self.heap.module(module).open_upvalues.len();
        for (i, &uv) in self.heap.module(module).open_upvalues.iter().enumerate() {
            if let Upvalue::Open { slot: s, .. } = self.heap.upvalue(uv) {
                if *s < slot {
                    position = i;
                    break;
                }
            }
        }
        self.heap
            .module_mut(module)
            .open_upvalues
            .insert(position, created);
        created
    }

    /// Close every open upvalue at or above `from`, copying the referenced
    /// stack value into the upvalue's own cell.
    fn close_upvalues(&mut self, from: usize) {
        loop {
            let module = self.current_module;
            let Some(&uv) = self.heap.module(module).open_upvalues.first() else {
                return;
            };
            let (slot, owner) = match self.heap.upvalue(uv) {
                Upvalue::Open { slot, module } => (*slot, *module),
                Upvalue::Closed(_) => return,
            };
            if slot < from {
                return;
            }
            let value = self.heap.module(owner).stack[slot];
            *self.heap.upvalue_mut(uv) = Upvalue::Closed(value);
            self.heap.module_mut(module).open_upvalues.remove(0);
        }
    }

    fn read_upvalue(&self, uv: ObjRef) -> Value {
        match self.heap.upvalue(uv) {
            Upvalue::Open { module, slot } => self.heap.module(*module).stack[*slot],
            Upvalue::Closed(v) => *v,
        }
    }

    fn write_upvalue(&mut self, uv: ObjRef, value: Value) {
        match self.heap.upvalue(uv) {
            Upvalue::Open { module, slot } => {
                let (module, slot) = (*module, *slot);
                self.heap.module_mut(module).stack[slot] = value;
            }
            Upvalue::Closed(_) => *self.heap.upvalue_mut(uv) = Upvalue::Closed(value),
        }
    }

    // ----- frame cache -----

    fn load_frame(&self) -> (ObjRef, Rc<Chunk>, usize, usize) {
        let record = self.heap.module(self.current_module);
        let frame = record.frames.last().expect("no active call frame");
        let function = self.heap.closure(frame.closure).function;
        let chunk = Rc::clone(&self.heap.function(function).chunk);
        (frame.closure, chunk, frame.ip, frame.slots)
    }

    fn frame_sync(&mut self, ip: usize) {
        if let Some(frame) = self.heap.module_mut(self.current_module).frames.last_mut() {
            frame.ip = ip;
        }
    }

    pub(crate) fn native_module(&self, name: &str) -> Option<ObjRef> {
        self.native_modules
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| *r)
    }

    /// Copy the shared core natives into a fresh module's globals.
    pub(crate) fn bind_core_natives(&mut self, module: ObjRef) {
        let Vm {
            heap, core_natives, ..
        } = self;
        core_natives.add_all_into(&mut heap.module_mut(module).globals);
    }

    // ----- dispatch loop -----

    /// Execute frames of the current module until its last frame returns.
    pub(crate) fn run(&mut self) -> Result<(), VmError> {
        let (mut frame_closure, mut chunk, mut ip, mut slots) = self.load_frame();

        macro_rules! read_byte {
            () => {{
                let b = chunk.code[ip];
                ip += 1;
                b
            }};
        }
        macro_rules! read_short {
            () => {{
                let hi = chunk.code[ip] as usize;
                let lo = chunk.code[ip + 1] as usize;
                ip += 2;
                (hi << 8) | lo
            }};
        }
        macro_rules! read_constant {
            () => {{
                let index = read_byte!() as usize;
                chunk.constants[index]
            }};
        }
        macro_rules! read_string {
            () => {{
                match read_constant!() {
                    Value::Object(r) => r,
                    _ => panic!("constant is not a string"),
                }
            }};
        }
        macro_rules! reload_frame {
            () => {{
                let (fc, c, i, s) = self.load_frame();
                frame_closure = fc;
                chunk = c;
                ip = i;
                slots = s;
            }};
        }

        loop {
            self.frame_sync(ip);
            let op = match OpCode::from_byte(chunk.code[ip]) {
                Some(op) => op,
                None => panic!("unknown opcode {}", chunk.code[ip]),
            };
            ip += 1;

            match op {
                OpCode::Constant => {
                    let v = read_constant!();
                    self.push(v)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::PushInt => {
                    let b = read_byte!() as i8;
                    self.push(Value::Int(i32::from(b)))?;
                }
                OpCode::Pop => {
                    self.pop()?;
                }
                OpCode::Dup => {
                    let v = self.peek(0);
                    self.push(v)?;
                }
                OpCode::DefineGlobal => {
                    let name = read_string!();
                    let public = read_byte!() != 0;
                    let hash = self.heap.string_hash(name).unwrap_or_default();
                    let value = self.peek(0);
                    let key = Value::Object(name);
                    let record = self.heap.module_mut(self.current_module);
                    record.globals.set(key, hash, value);
                    if public {
                        record.publics.set(key, hash, value);
                    }
                    self.pop()?;
                }
                OpCode::GetGlobal => {
                    let name = read_string!();
                    let hash = self.heap.string_hash(name).unwrap_or_default();
                    let value = self
                        .heap
                        .module(self.current_module)
                        .globals
                        .get(Value::Object(name), hash);
                    match value {
                        Some(v) => self.push(v)?,
                        None => {
                            let n = self.heap.string(name).to_string();
                            return Err(self
                                .runtime_panic(
                                    ErrorKind::Name,
                                    format!("Undefined variable '{}'.", n),
                                )
                                .into());
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = read_string!();
                    let hash = self.heap.string_hash(name).unwrap_or_default();
                    let value = self.peek(0);
                    let key = Value::Object(name);
                    let is_new = self
                        .heap
                        .module_mut(self.current_module)
                        .globals
                        .set(key, hash, value);
                    if is_new {
                        self.heap
                            .module_mut(self.current_module)
                            .globals
                            .delete(key, hash);
                        let n = self.heap.string(name).to_string();
                        return Err(self
                            .runtime_panic(
                                ErrorKind::Name,
                                format!("Undefined variable '{}'.", n),
                            )
                            .into());
                    }
                    // A public binding tracks reassignment of its global.
                    let record = self.heap.module_mut(self.current_module);
                    if record.publics.get(key, hash).is_some() {
                        record.publics.set(key, hash, value);
                    }
                }
                OpCode::GetLocal => {
                    let slot = read_byte!() as usize;
                    let v = self.heap.module(self.current_module).stack[slots + slot];
                    self.push(v)?;
                }
                OpCode::SetLocal => {
                    let slot = read_byte!() as usize;
                    let v = self.peek(0);
                    self.heap.module_mut(self.current_module).stack[slots + slot] = v;
                }
                OpCode::GetUpvalue => {
                    let index = read_byte!() as usize;
                    let uv = self.heap.closure(frame_closure).upvalues[index];
                    let v = self.read_upvalue(uv);
                    self.push(v)?;
                }
                OpCode::SetUpvalue => {
                    let index = read_byte!() as usize;
                    let uv = self.heap.closure(frame_closure).upvalues[index];
                    let v = self.peek(0);
                    self.write_upvalue(uv, v);
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack_len() - 1;
                    self.close_upvalues(top);
                    self.pop()?;
                }
                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b))?;
                }
                OpCode::Greater | OpCode::Less => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    let result = self.compare(op, a, b)?;
                    self.pop()?;
                    self.pop()?;
                    self.push(result)?;
                }
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    match (a, b) {
                        (Value::Object(x), Value::Object(y))
                            if matches!(self.heap.get(x), Object::String(_))
                                && matches!(self.heap.get(y), Object::String(_)) =>
                        {
                            let joined = self.concatenate(x, y);
                            self.pop()?;
                            self.pop()?;
                            self.push(Value::Object(joined))?;
                        }
                        _ => self.arithmetic(op)?,
                    }
                }
                OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Modulus
                | OpCode::Power
                | OpCode::ShiftLeft
                | OpCode::ShiftRight => self.arithmetic(op)?,
                OpCode::Not => {
                    let v = self.pop()?;
                    self.push(Value::Bool(v.is_falsey()))?;
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    let negated = match v {
                        Value::Int(i) => Value::Int(i.wrapping_neg()),
                        Value::Float(f) => Value::Float(-f),
                        _ => {
                            return Err(self
                                .runtime_panic(
                                    ErrorKind::Type,
                                    format!(
                                        "Operand of type '{}' cannot be negated.",
                                        self.type_of(v)
                                    ),
                                )
                                .into());
                        }
                    };
                    self.pop()?;
                    self.push(negated)?;
                }
                OpCode::TypeOf => {
                    let v = self.peek(0);
                    let name = self.type_of(v);
                    let s = self.copy_string(name);
                    self.pop()?;
                    self.push(Value::Object(s))?;
                }
                OpCode::Jump => {
                    let offset = read_short!();
                    ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = read_short!();
                    if self.pop()?.is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::JumpIfFalsePeek => {
                    let offset = read_short!();
                    if self.peek(0).is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = read_short!();
                    ip -= offset;
                }
                OpCode::Call => {
                    let argc = read_byte!();
                    self.frame_sync(ip);
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                    reload_frame!();
                }
                OpCode::Invoke => {
                    let name = read_string!();
                    let argc = read_byte!();
                    self.frame_sync(ip);
                    self.invoke(name, argc)?;
                    reload_frame!();
                }
                OpCode::Closure => {
                    let function = match read_constant!() {
                        Value::Object(r) => r,
                        _ => panic!("closure constant is not a function"),
                    };
                    let count = self.heap.function(function).upvalue_count;
                    let closure = self.alloc(Object::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(count),
                    }));
                    self.push(Value::Object(closure))?;
                    for _ in 0..count {
                        let is_local = read_byte!() != 0;
                        let index = read_byte!() as usize;
                        let uv = if is_local {
                            self.capture_upvalue(slots + index)
                        } else {
                            self.heap.closure(frame_closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(uv);
                    }
                }
                OpCode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .heap
                        .module_mut(self.current_module)
                        .frames
                        .pop()
                        .expect("return without a frame");
                    self.close_upvalues(frame.slots);
                    if self.heap.module(self.current_module).frames.is_empty() {
                        self.truncate_stack(0);
                        return Ok(());
                    }
                    self.truncate_stack(frame.slots);
                    self.push(result)?;
                    reload_frame!();
                }
                OpCode::NewArray => {
                    let count = read_byte!() as usize;
                    let len = self.stack_len();
                    let items: Vec<Value> = {
                        let stack = &self.heap.module(self.current_module).stack;
                        stack[len - count..].to_vec()
                    };
                    let array = self.alloc(Object::Array(items));
                    self.truncate_stack(len - count);
                    self.push(Value::Object(array))?;
                }
                OpCode::NewTable => {
                    let pairs = read_byte!() as usize;
                    let len = self.stack_len();
                    let start = len - pairs * 2;
                    let mut table = Table::new();
                    for i in 0..pairs {
                        let key = self.heap.module(self.current_module).stack[start + i * 2];
                        let value = self.heap.module(self.current_module).stack[start + i * 2 + 1];
                        let hash = self.hashable_key(key)?;
                        table.set(key, hash, value);
                    }
                    let r = self.alloc(Object::Table(table));
                    self.truncate_stack(start);
                    self.push(Value::Object(r))?;
                }
                OpCode::NewStruct => {
                    let count = read_byte!() as usize;
                    let mut names = Vec::with_capacity(count);
                    for _ in 0..count {
                        names.push(read_string!());
                    }
                    self.new_struct_instance(count, &names)?;
                }
                OpCode::GetIndex => {
                    let index = self.peek(0);
                    let target = self.peek(1);
                    let value = self.index_get(target, index)?;
                    self.pop()?;
                    self.pop()?;
                    self.push(value)?;
                }
                OpCode::SetIndex => {
                    let value = self.peek(0);
                    let index = self.peek(1);
                    let target = self.peek(2);
                    self.index_set(target, index, value)?;
                    self.truncate_stack(self.stack_len() - 3);
                    self.push(value)?;
                }
                OpCode::GetProperty => {
                    let name = read_string!();
                    let target = self.peek(0);
                    let value = self.property_get(target, name)?;
                    self.pop()?;
                    self.push(value)?;
                }
                OpCode::SetProperty => {
                    let name = read_string!();
                    let value = self.peek(0);
                    let target = self.peek(1);
                    self.property_set(target, name, value)?;
                    self.truncate_stack(self.stack_len() - 2);
                    self.push(value)?;
                }
                OpCode::ImportFrom => {
                    let path = read_string!();
                    let count = read_byte!() as usize;
                    let mut names = Vec::with_capacity(count);
                    for _ in 0..count {
                        names.push(read_string!());
                    }
                    self.frame_sync(ip);
                    let path_text = self.heap.string(path).to_string();
                    let module = self.load_module(&path_text)?;
                    for name in names {
                        let hash = self.heap.string_hash(name).unwrap_or_default();
                        let key = Value::Object(name);
                        let value = self.heap.module(module).publics.get(key, hash);
                        let Some(value) = value else {
                            let n = self.heap.string(name).to_string();
                            return Err(self
                                .runtime_panic(
                                    ErrorKind::Import,
                                    format!("Module '{}' does not export '{}'.", path_text, n),
                                )
                                .into());
                        };
                        self.heap
                            .module_mut(self.current_module)
                            .globals
                            .set(key, hash, value);
                    }
                    reload_frame!();
                }
                OpCode::ImportAs => {
                    let path = read_string!();
                    let alias = read_string!();
                    self.frame_sync(ip);
                    let path_text = self.heap.string(path).to_string();
                    let module = self.load_module(&path_text)?;
                    let hash = self.heap.string_hash(alias).unwrap_or_default();
                    self.heap
                        .module_mut(self.current_module)
                        .globals
                        .set(Value::Object(alias), hash, Value::Object(module));
                    reload_frame!();
                }
                OpCode::SetMatchTarget => {
                    let v = self.pop()?;
                    self.match_handler.target = Some(v);
                }
                OpCode::MatchOk => {
                    let matched = match self.match_handler.target {
                        Some(Value::Object(r)) => match self.heap.get(r) {
                            Object::Result(CruxResult::Ok(v)) => Some(*v),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(v) = matched {
                        self.match_handler.bind = Some(v);
                    }
                    self.push(Value::Bool(matched.is_some()))?;
                }
                OpCode::MatchErr => {
                    let matched = match self.match_handler.target {
                        Some(Value::Object(r)) => match self.heap.get(r) {
                            Object::Result(CruxResult::Err(e)) => Some(Value::Object(*e)),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(v) = matched {
                        self.match_handler.bind = Some(v);
                    }
                    self.push(Value::Bool(matched.is_some()))?;
                }
                OpCode::MatchEqual => {
                    let pattern = self.pop()?;
                    let matched = self.match_handler.target == Some(pattern);
                    if matched {
                        self.match_handler.bind = self.match_handler.target;
                    }
                    self.push(Value::Bool(matched))?;
                }
                OpCode::GetMatchBind => {
                    let v = self.match_handler.bind.unwrap_or(Value::Nil);
                    self.push(v)?;
                }
                OpCode::ClearMatch => {
                    self.match_handler.target = None;
                    self.match_handler.bind = None;
                }
            }
        }
    }

    // ----- operator helpers -----

    fn compare(&self, op: OpCode, a: Value, b: Value) -> Result<Value, VmPanic> {
        if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
            return Ok(Value::Bool(if op == OpCode::Greater {
                x > y
            } else {
                x < y
            }));
        }
        if let (Value::Object(x), Value::Object(y)) = (a, b) {
            if let (Object::String(s1), Object::String(s2)) = (self.heap.get(x), self.heap.get(y)) {
                return Ok(Value::Bool(if op == OpCode::Greater {
                    s1.text > s2.text
                } else {
                    s1.text < s2.text
                }));
            }
        }
        Err(self.runtime_panic(
            ErrorKind::Type,
            format!(
                "Values of type '{}' and '{}' cannot be ordered.",
                self.type_of(a),
                self.type_of(b)
            ),
        ))
    }

    /// Numeric operators. Two ints stay int (wrapping), except division,
    /// which always yields float; a float operand promotes the other side.
    fn arithmetic(&mut self, op: OpCode) -> Result<(), VmPanic> {
        let b = self.peek(0);
        let a = self.peek(1);
        let result = match op {
            OpCode::Modulus => match (a, b) {
                (Value::Int(_), Value::Int(0)) => {
                    return Err(self.runtime_panic(
                        ErrorKind::Math,
                        "Division by zero is undefined.".to_string(),
                    ));
                }
                (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_rem(y)),
                _ => {
                    return Err(self.int_operand_panic("%", a, b));
                }
            },
            OpCode::ShiftLeft => match (a, b) {
                (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_shl(y as u32)),
                _ => return Err(self.int_operand_panic("<<", a, b)),
            },
            OpCode::ShiftRight => match (a, b) {
                (Value::Int(x), Value::Int(y)) => Value::Int(x.wrapping_shr(y as u32)),
                _ => return Err(self.int_operand_panic(">>", a, b)),
            },
            OpCode::Divide => {
                let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                    return Err(self.number_operand_panic(a, b));
                };
                if y == 0.0 {
                    return Err(self.runtime_panic(
                        ErrorKind::Math,
                        "Division by zero is undefined.".to_string(),
                    ));
                }
                Value::Float(x / y)
            }
            OpCode::Power => match (a, b) {
                (Value::Int(x), Value::Int(y)) if y >= 0 => {
                    Value::Int(x.wrapping_pow(y as u32))
                }
                _ => {
                    let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                        return Err(self.number_operand_panic(a, b));
                    };
                    Value::Float(x.powf(y))
                }
            },
            _ => match (a, b) {
                (Value::Int(x), Value::Int(y)) => Value::Int(match op {
                    OpCode::Add => x.wrapping_add(y),
                    OpCode::Subtract => x.wrapping_sub(y),
                    OpCode::Multiply => x.wrapping_mul(y),
                    _ => panic!("unexpected arithmetic op"),
                }),
                _ => {
                    let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                        return Err(self.number_operand_panic(a, b));
                    };
                    Value::Float(match op {
                        OpCode::Add => x + y,
                        OpCode::Subtract => x - y,
                        OpCode::Multiply => x * y,
                        _ => panic!("unexpected arithmetic op"),
                    })
                }
            },
        };
        self.pop()?;
        self.pop()?;
        self.push(result)
    }

    fn number_operand_panic(&self, a: Value, b: Value) -> VmPanic {
        self.runtime_panic(
            ErrorKind::Type,
            format!(
                "Operands of type '{}' and '{}' must be numbers.",
                self.type_of(a),
                self.type_of(b)
            ),
        )
    }

    fn int_operand_panic(&self, operator: &str, a: Value, b: Value) -> VmPanic {
        self.runtime_panic(
            ErrorKind::Type,
            format!(
                "Operands to '{}' must be integers, not '{}' and '{}'.",
                operator,
                self.type_of(a),
                self.type_of(b)
            ),
        )
    }

    /// Hash a table key or raise the appropriate panic.
    fn hashable_key(&self, key: Value) -> Result<u32, VmPanic> {
        match hash_value(&self.heap, key) {
            Some(h) => Ok(h),
            None => {
                if matches!(key, Value::Float(f) if f.is_nan()) {
                    Err(self.runtime_panic(
                        ErrorKind::Value,
                        "NaN is not a valid table key.".to_string(),
                    ))
                } else {
                    Err(self.runtime_panic(
                        ErrorKind::Value,
                        format!(
                            "A value of type '{}' cannot be used as a table key.",
                            self.type_of(key)
                        ),
                    ))
                }
            }
        }
    }

    fn index_get(&mut self, target: Value, index: Value) -> Result<Value, VmPanic> {
        let Value::Object(r) = target else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' cannot be indexed.", self.type_of(target)),
            ));
        };
        match self.heap.get(r) {
            Object::Array(items) => {
                let Value::Int(i) = index else {
                    return Err(self.runtime_panic(
                        ErrorKind::Type,
                        "An array index must be an integer.".to_string(),
                    ));
                };
                let len = items.len();
                if i < 0 || i as usize >= len {
                    return Err(self.runtime_panic(
                        ErrorKind::Runtime,
                        format!("Array index {} is out of bounds.", i),
                    ));
                }
                Ok(items[i as usize])
            }
            Object::Table(_) => {
                let hash = self.hashable_key(index)?;
                Ok(self
                    .heap
                    .table(r)
                    .get(index, hash)
                    .unwrap_or(Value::Nil))
            }
            Object::String(s) => {
                let Value::Int(i) = index else {
                    return Err(self.runtime_panic(
                        ErrorKind::Type,
                        "A string index must be an integer.".to_string(),
                    ));
                };
                if i < 0 || i as usize >= s.text.len() {
                    return Err(self.runtime_panic(
                        ErrorKind::Runtime,
                        format!("String index {} is out of bounds.", i),
                    ));
                }
                let byte = s.text.as_bytes()[i as usize];
                let single = String::from_utf8_lossy(&[byte]).into_owned();
                Ok(Value::Object(self.take_string(single)))
            }
            other => Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' cannot be indexed.", other.type_name()),
            )),
        }
    }

    fn index_set(&mut self, target: Value, index: Value, value: Value) -> Result<(), VmPanic> {
        let Value::Object(r) = target else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' cannot be indexed.", self.type_of(target)),
            ));
        };
        match self.heap.get(r) {
            Object::Array(items) => {
                let Value::Int(i) = index else {
                    return Err(self.runtime_panic(
                        ErrorKind::Type,
                        "An array index must be an integer.".to_string(),
                    ));
                };
                let len = items.len();
                if i < 0 || i as usize >= len {
                    return Err(self.runtime_panic(
                        ErrorKind::Runtime,
                        format!("Array index {} is out of bounds.", i),
                    ));
                }
                self.heap.array_mut(r)[i as usize] = value;
                Ok(())
            }
            Object::Table(_) => {
                let hash = self.hashable_key(index)?;
                self.heap.table_mut(r).set(index, hash, value);
                Ok(())
            }
            other => Err(self.runtime_panic(
                ErrorKind::Type,
                format!(
                    "Value of type '{}' does not support subscript assignment.",
                    other.type_name()
                ),
            )),
        }
    }

    fn property_get(&mut self, target: Value, name: ObjRef) -> Result<Value, VmPanic> {
        let hash = self.heap.string_hash(name).unwrap_or_default();
        let key = Value::Object(name);
        let Value::Object(r) = target else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' has no properties.", self.type_of(target)),
            ));
        };
        match self.heap.get(r) {
            Object::StructInstance(i) => match i.fields.get(key, hash) {
                Some(v) => Ok(v),
                None => {
                    let type_name = self
                        .heap
                        .string(self.heap.struct_type(i.struct_type).name)
                        .to_string();
                    let n = self.heap.string(name).to_string();
                    Err(self.runtime_panic(
                        ErrorKind::Name,
                        format!("Instance of '{}' has no field '{}'.", type_name, n),
                    ))
                }
            },
            Object::Module(m) => match m.publics.get(key, hash) {
                Some(v) => Ok(v),
                None => {
                    let path = self.heap.string(m.path).to_string();
                    let n = self.heap.string(name).to_string();
                    Err(self.runtime_panic(
                        ErrorKind::Name,
                        format!("Module '{}' has no public member '{}'.", path, n),
                    ))
                }
            },
            other => Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' has no properties.", other.type_name()),
            )),
        }
    }

    fn property_set(&mut self, target: Value, name: ObjRef, value: Value) -> Result<(), VmPanic> {
        let hash = self.heap.string_hash(name).unwrap_or_default();
        let key = Value::Object(name);
        let Value::Object(r) = target else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' has no fields.", self.type_of(target)),
            ));
        };
        match self.heap.get(r) {
            Object::StructInstance(i) => {
                if i.fields.get(key, hash).is_none() {
                    let type_name = self
                        .heap
                        .string(self.heap.struct_type(i.struct_type).name)
                        .to_string();
                    let n = self.heap.string(name).to_string();
                    return Err(self.runtime_panic(
                        ErrorKind::Name,
                        format!("Instance of '{}' has no field '{}'.", type_name, n),
                    ));
                }
                self.heap.instance_mut(r).fields.set(key, hash, value);
                Ok(())
            }
            other => Err(self.runtime_panic(
                ErrorKind::Type,
                format!("Value of type '{}' has no fields.", other.type_name()),
            )),
        }
    }

    /// Pop the field values and struct type, verify the fields against the
    /// declaration, and push the new instance. Undeclared fields are a
    /// `NAME` error; declared but unset fields default to nil.
    fn new_struct_instance(&mut self, count: usize, names: &[ObjRef]) -> Result<(), VmPanic> {
        let len = self.stack_len();
        let type_value = self.peek(count);
        let Some(type_ref) = type_value.as_object() else {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                "Only struct types can be instantiated.".to_string(),
            ));
        };
        if !matches!(self.heap.get(type_ref), Object::Struct(_)) {
            return Err(self.runtime_panic(
                ErrorKind::Type,
                "Only struct types can be instantiated.".to_string(),
            ));
        }
        let declared = self.heap.struct_type(type_ref).fields.clone();
        let mut fields = Table::new();
        for field in &declared {
            let hash = self.heap.string_hash(*field).unwrap_or_default();
            fields.set(Value::Object(*field), hash, Value::Nil);
        }
        for (i, name) in names.iter().enumerate() {
            if !declared.contains(name) {
                let type_name = self
                    .heap
                    .string(self.heap.struct_type(type_ref).name)
                    .to_string();
                let n = self.heap.string(*name).to_string();
                return Err(self.runtime_panic(
                    ErrorKind::Name,
                    format!("Struct '{}' has no field '{}'.", type_name, n),
                ));
            }
            let value = self.heap.module(self.current_module).stack[len - count + i];
            let hash = self.heap.string_hash(*name).unwrap_or_default();
            fields.set(Value::Object(*name), hash, value);
        }
        let instance = self.alloc(Object::StructInstance(crate::object::StructInstance {
            struct_type: type_ref,
            fields,
        }));
        self.truncate_stack(len - count - 1);
        self.push(Value::Object(instance))
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("live_objects", &self.heap.live_count())
            .field("bytes_allocated", &self.heap.bytes_allocated)
            .finish()
    }
}
