//! The register-based dispatch loop: call/return, upvalue open/close, class
//! and exception machinery, all built around the opcode table emitted by
//! `xan-compiler`.
//!
//! Grounded on `original_source/src/xan.c`'s `run()` and `callValue()` for
//! the overall shape (one tight `match` over a fetched 32-bit word, a
//! synchronous `callValue` for everything that isn't a closure), with the
//! raw-pointer frame/upvalue bookkeeping replaced by index-based structures
//! per `heap.rs`'s module doc.

use std::io::Write;

use xan_core::{
    ArrayObj, BoundMethodObj, Chunk, ClassObj, ClosureObj, GcRoots, Heap, Instr, InstanceObj,
    NativeContext, ObjData, ObjKind, ObjRef, OpCode, Reg, TableObj, UpvalueLocation, UpvalueObj,
    Value, XanTable, UV_IS_LOCAL,
};

use crate::display;
use crate::error::{InterpretResult, RuntimeError, TraceFrame};
use crate::frame::{CallFrame, TryHandler};
use crate::natives;

const FRAMES_MAX: usize = 256;

enum Step {
    Continue,
    Halt,
}

struct VmNativeContext<'a> {
    stdout: &'a mut dyn Write,
    receiver: Value,
    array_class: ObjRef,
    table_class: ObjRef,
    exception_class: ObjRef,
}

impl NativeContext for VmNativeContext<'_> {
    fn stdout(&mut self) -> &mut dyn Write {
        self.stdout
    }

    fn receiver(&self) -> Value {
        self.receiver
    }

    fn make_exception(&self, heap: &mut Heap, message: &str) -> Value {
        natives::build_exception(heap, self.exception_class, message)
    }

    fn lookup_class(&self, _heap: &Heap, name: &str) -> Option<ObjRef> {
        match name {
            "Array" => Some(self.array_class),
            "Table" => Some(self.table_class),
            "Exception" => Some(self.exception_class),
            _ => None,
        }
    }
}

/// Roots the garbage collector needs from a live `Vm`, borrowed rather than
/// owned so `Vm::maybe_collect` can hand this to `Heap::collect_garbage`
/// while keeping `heap` itself as a disjoint mutable borrow.
struct Roots<'a> {
    stack: &'a [Value],
    frames: &'a [CallFrame],
    open_upvalues: &'a [ObjRef],
    globals: &'a XanTable,
    array_class: ObjRef,
    table_class: ObjRef,
    exception_class: ObjRef,
    init_string: ObjRef,
    msg_key: ObjRef,
}

impl GcRoots for Roots<'_> {
    fn mark_roots(&self, heap: &mut Heap) {
        for &v in self.stack {
            heap.mark_value(v);
        }
        for frame in self.frames {
            heap.mark_object(frame.closure);
        }
        for &r in self.open_upvalues {
            heap.mark_object(r);
        }
        for (k, v) in self.globals.iter() {
            heap.mark_object(k);
            heap.mark_value(v);
        }
        heap.mark_object(self.array_class);
        heap.mark_object(self.table_class);
        heap.mark_object(self.exception_class);
        heap.mark_object(self.init_string);
        heap.mark_object(self.msg_key);
    }
}

/// The virtual machine: owns the heap, the value stack, the call-frame
/// stack, the open-upvalue list, the try-handler stack, and the globals
/// table. One `Vm` is one persistent execution context — reused across
/// REPL lines by whatever embeds it, the way `interpret()` reuses a single
/// VM in the original.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    try_handlers: Vec<TryHandler>,
    /// Ascending by absolute stack slot (the original's list is sorted
    /// descending because it walks from `stackTop` down; a plain `Vec`
    /// sorted ascending makes "close everything above a threshold" a
    /// pop-from-the-back loop instead of a pop-from-the-front one).
    open_upvalues: Vec<ObjRef>,
    globals: XanTable,
    array_class: ObjRef,
    table_class: ObjRef,
    exception_class: ObjRef,
    init_string: ObjRef,
    msg_key: ObjRef,
    stdout: Box<dyn Write>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_stdout(Box::new(std::io::stdout()))
    }

    /// Builds a VM that writes `print` output to `stdout` instead of the
    /// process's real standard output; used by tests that want to capture
    /// it.
    pub fn with_stdout(stdout: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let mut globals = XanTable::new();
        let builtins = natives::install(&mut heap, &mut globals);
        let init_string = heap.intern(b"init");
        let msg_key = heap.intern(b"msg");
        Vm {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            try_handlers: Vec::new(),
            open_upvalues: Vec::new(),
            globals,
            array_class: builtins.array_class,
            table_class: builtins.table_class,
            exception_class: builtins.exception_class,
            init_string,
            msg_key,
            stdout,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn set_stress_gc(&mut self, stress: bool) {
        self.heap.stress_gc = stress;
    }

    /// Compiles and runs `source` against this VM's persistent state
    /// (globals survive across calls, matching a REPL line-by-line
    /// session).
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let func_ref = match xan_compiler::compile(source, &mut self.heap) {
            Ok(f) => f,
            Err(errors) => return InterpretResult::CompileError(errors),
        };
        let closure_ref = self.heap.allocate(ObjData::Closure(ClosureObj {
            function: func_ref,
            upvalues: Vec::new(),
        }));
        self.stack.clear();
        self.frames.clear();
        self.try_handlers.clear();
        self.open_upvalues.clear();
        if let Err(e) = self.push_script_frame(closure_ref) {
            return InterpretResult::RuntimeError(e);
        }
        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(e) => InterpretResult::RuntimeError(e),
        }
    }

    // ---- frame / call machinery ----------------------------------------

    fn ensure_stack(&mut self, len: usize) {
        if self.stack.len() < len {
            self.stack.resize(len, Value::Nil);
        }
    }

    fn push_script_frame(&mut self, closure_ref: ObjRef) -> Result<(), RuntimeError> {
        let function = match self.heap.data(closure_ref) {
            ObjData::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let stack_used = match self.heap.data(function) {
            ObjData::Function(f) => f.stack_used,
            _ => unreachable!(),
        };
        self.ensure_stack(stack_used as usize);
        self.frames.push(CallFrame {
            closure: closure_ref,
            function,
            ip: 0,
            base: 0,
        });
        Ok(())
    }

    fn call_closure(&mut self, closure_ref: ObjRef, base: usize, argc: usize) -> Result<(), Value> {
        let function = match self.heap.data(closure_ref) {
            ObjData::Closure(c) => c.function,
            _ => unreachable!("call_closure invoked on a non-closure"),
        };
        let (arity_min, arity_max, stack_used) = match self.heap.data(function) {
            ObjData::Function(f) => (f.arity_min as usize, f.arity_max as usize, f.stack_used),
            _ => unreachable!(),
        };
        if argc < arity_min || argc > arity_max {
            let expected = if argc < arity_min { arity_min } else { arity_max };
            return Err(self.runtime_error(&format!("Expected {expected} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let entry_pc = match self.heap.data(function) {
            ObjData::Function(f) => f.code_offsets[arity_max - argc] as usize,
            _ => unreachable!(),
        };
        self.ensure_stack(base + stack_used as usize);
        self.frames.push(CallFrame {
            closure: closure_ref,
            function,
            ip: entry_pc,
            base,
        });
        Ok(())
    }

    fn call_native(&mut self, native_ref: ObjRef, base: usize, argc: usize, receiver: Value) -> Result<(), Value> {
        let f = match self.heap.data(native_ref) {
            ObjData::Native(n) => n.function,
            _ => unreachable!("call_native invoked on a non-native"),
        };
        let args: Vec<Value> = self.stack[base + 1..base + 1 + argc].to_vec();
        let mut ctx = VmNativeContext {
            stdout: self.stdout.as_mut(),
            receiver,
            array_class: self.array_class,
            table_class: self.table_class,
            exception_class: self.exception_class,
        };
        match f(&mut self.heap, &mut ctx, &args) {
            Ok(v) => {
                self.stack[base] = v;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn call_class(&mut self, class_ref: ObjRef, base: usize, argc: usize) -> Result<(), Value> {
        let init_hash = self.heap.string_hash(self.init_string);
        let init_key = self.init_string;
        let init_method = match self.heap.data(class_ref) {
            ObjData::Class(c) => c.methods.get(init_key, init_hash),
            _ => unreachable!("call_class invoked on a non-class"),
        };
        match init_method {
            Some(Value::Obj(method_ref)) if self.heap.kind(method_ref) == ObjKind::Closure => {
                let instance = Value::Obj(self.heap.allocate(ObjData::Instance(InstanceObj {
                    klass: class_ref,
                    fields: XanTable::new(),
                })));
                self.stack[base] = instance;
                self.call_closure(method_ref, base, argc)
            }
            Some(Value::Obj(method_ref)) if self.heap.kind(method_ref) == ObjKind::Native => {
                // Pass the class itself as the receiver (rather than `Nil`)
                // so a native `init` reached through a subclass constructs
                // an instance of that subclass, not of whichever built-in
                // registered the native (see `natives::invoked_class`).
                self.call_native(method_ref, base, argc, Value::Obj(class_ref))
            }
            _ => {
                if argc != 0 {
                    return Err(self.runtime_error(&format!("Expected 0 arguments but got {argc}.")));
                }
                let instance = Value::Obj(self.heap.allocate(ObjData::Instance(InstanceObj {
                    klass: class_ref,
                    fields: XanTable::new(),
                })));
                self.stack[base] = instance;
                Ok(())
            }
        }
    }

    fn call_value(&mut self, base: usize, argc: usize) -> Result<(), Value> {
        let callee = self.stack[base];
        let Value::Obj(r) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match self.heap.kind(r) {
            ObjKind::Closure => self.call_closure(r, base, argc),
            ObjKind::Native => self.call_native(r, base, argc, Value::Nil),
            ObjKind::Class => self.call_class(r, base, argc),
            ObjKind::BoundMethod => {
                let (receiver, method) = match self.heap.data(r) {
                    ObjData::BoundMethod(b) => (b.receiver, b.method),
                    _ => unreachable!(),
                };
                self.stack[base] = receiver;
                match self.heap.kind(method) {
                    ObjKind::Closure => self.call_closure(method, base, argc),
                    ObjKind::Native => self.call_native(method, base, argc, receiver),
                    _ => unreachable!("bound method must wrap a closure or native"),
                }
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    // ---- upvalues --------------------------------------------------------

    fn slot_of(&self, r: ObjRef) -> usize {
        match self.heap.data(r) {
            ObjData::Upvalue(u) => match u.location {
                UpvalueLocation::Open(s) => s,
                UpvalueLocation::Closed(_) => unreachable!("closed upvalue left in the open list"),
            },
            _ => unreachable!(),
        }
    }

    fn find_or_create_upvalue(&mut self, slot: usize) -> ObjRef {
        if let Ok(idx) = self.open_upvalues.binary_search_by_key(&slot, |&r| self.slot_of(r)) {
            return self.open_upvalues[idx];
        }
        let uv = self.heap.allocate(ObjData::Upvalue(UpvalueObj {
            location: UpvalueLocation::Open(slot),
            next: None,
        }));
        let pos = self.open_upvalues.partition_point(|&r| self.slot_of(r) < slot);
        self.open_upvalues.insert(pos, uv);
        uv
    }

    fn close_upvalues_from(&mut self, threshold: usize) {
        while let Some(&last) = self.open_upvalues.last() {
            if self.slot_of(last) < threshold {
                break;
            }
            self.open_upvalues.pop();
            let slot = self.slot_of(last);
            let value = self.stack[slot];
            if let ObjData::Upvalue(u) = self.heap.data_mut(last) {
                u.location = UpvalueLocation::Closed(value);
            }
        }
    }

    fn read_upvalue(&self, r: ObjRef) -> Value {
        match self.heap.data(r) {
            ObjData::Upvalue(u) => match u.location {
                UpvalueLocation::Open(s) => self.stack[s],
                UpvalueLocation::Closed(v) => v,
            },
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, r: ObjRef, v: Value) {
        let loc = match self.heap.data(r) {
            ObjData::Upvalue(u) => u.location,
            _ => unreachable!(),
        };
        match loc {
            UpvalueLocation::Open(s) => self.stack[s] = v,
            UpvalueLocation::Closed(_) => {
                if let ObjData::Upvalue(u) = self.heap.data_mut(r) {
                    u.location = UpvalueLocation::Closed(v);
                }
            }
        }
    }

    // ---- exceptions ------------------------------------------------------

    fn runtime_error(&mut self, message: &str) -> Value {
        tracing::warn!("runtime error raised: {}", message);
        natives::build_exception(&mut self.heap, self.exception_class, message)
    }

    fn class_is_exception(&self, mut class_ref: ObjRef) -> bool {
        loop {
            match self.heap.data(class_ref) {
                ObjData::Class(c) => {
                    if c.is_exception {
                        return true;
                    }
                    match c.superclass {
                        Some(s) => class_ref = s,
                        None => return false,
                    }
                }
                _ => return false,
            }
        }
    }

    fn is_exception_value(&self, v: Value) -> bool {
        match v {
            Value::Obj(r) => match self.heap.data(r) {
                ObjData::Instance(i) => self.class_is_exception(i.klass),
                _ => false,
            },
            _ => false,
        }
    }

    fn exception_matches(&self, exc_value: Value, type_name_value: Value) -> bool {
        let (Value::Obj(name_ref), Value::Obj(exc_ref)) = (type_name_value, exc_value) else {
            return false;
        };
        let klass = match self.heap.data(exc_ref) {
            ObjData::Instance(i) => i.klass,
            _ => return false,
        };
        let mut cur = Some(klass);
        while let Some(c) = cur {
            match self.heap.data(c) {
                ObjData::Class(class) => {
                    if class.name == name_ref {
                        return true;
                    }
                    cur = class.superclass;
                }
                _ => return false,
            }
        }
        false
    }

    /// Unwinds to the nearest try handler, closing upvalues owned by every
    /// frame discarded along the way. Returns `Err` once the try-stack is
    /// exhausted, meaning this exception is uncaught.
    fn unwind(&mut self, value: Value) -> Result<(), RuntimeError> {
        loop {
            let Some(handler) = self.try_handlers.pop() else {
                return Err(self.build_runtime_error(value));
            };
            if handler.frame_index >= self.frames.len() {
                continue;
            }
            if handler.frame_index + 1 < self.frames.len() {
                let discarded_base = self.frames[handler.frame_index + 1].base;
                self.close_upvalues_from(discarded_base);
            }
            self.frames.truncate(handler.frame_index + 1);
            let base = self.frames.last().unwrap().base;
            self.frames.last_mut().unwrap().ip = handler.handler_pc;
            self.stack[base + handler.exception_slot as usize] = value;
            return Ok(());
        }
    }

    fn format_exception_message(&self, value: Value) -> String {
        if let Value::Obj(r) = value {
            if let ObjData::Instance(i) = self.heap.data(r) {
                let hash = self.heap.string_hash(self.msg_key);
                if let Some(msg_val) = i.fields.get(self.msg_key, hash) {
                    return display::format_value(&self.heap, msg_val);
                }
            }
        }
        display::format_value(&self.heap, value)
    }

    fn function_name(&self, function_ref: ObjRef) -> Option<String> {
        match self.heap.data(function_ref) {
            ObjData::Function(f) => f
                .name
                .map(|n| String::from_utf8_lossy(self.heap.string_bytes(n)).into_owned()),
            _ => None,
        }
    }

    fn build_runtime_error(&self, value: Value) -> RuntimeError {
        let message = self.format_exception_message(value);
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function_name = self.function_name(frame.function);
            let line = self.line_at(frame.function, frame.ip);
            trace.push(TraceFrame { function_name, line });
        }
        RuntimeError { message, trace }
    }

    // ---- properties & subscripts ------------------------------------------

    fn bind_method(&mut self, klass: ObjRef, receiver: Value, name_ref: ObjRef) -> Result<Value, Value> {
        let hash = self.heap.string_hash(name_ref);
        let method = match self.heap.data(klass) {
            ObjData::Class(c) => c.methods.get(name_ref, hash),
            _ => None,
        };
        match method {
            Some(Value::Obj(m)) => {
                let bound = self.heap.allocate(ObjData::BoundMethod(BoundMethodObj { receiver, method: m }));
                Ok(Value::Obj(bound))
            }
            _ => {
                let name = String::from_utf8_lossy(self.heap.string_bytes(name_ref)).into_owned();
                Err(self.runtime_error(&format!("Undefined property '{name}'.")))
            }
        }
    }

    fn get_property(&mut self, obj: Value, name_ref: ObjRef) -> Result<Value, Value> {
        let Value::Obj(r) = obj else {
            return Err(self.runtime_error("Only instances have fields/properties."));
        };
        let (field_val, klass) = match self.heap.data(r) {
            ObjData::Instance(i) => {
                let hash = self.heap.string_hash(name_ref);
                (i.fields.get(name_ref, hash), i.klass)
            }
            ObjData::Array(a) => (None, a.klass),
            ObjData::Table(t) => (None, t.klass),
            _ => return Err(self.runtime_error("Only instances have fields/properties.")),
        };
        if let Some(v) = field_val {
            return Ok(v);
        }
        self.bind_method(klass, obj, name_ref)
    }

    fn set_property(&mut self, obj: Value, name_ref: ObjRef, value: Value) -> Result<(), Value> {
        let Value::Obj(r) = obj else {
            return Err(self.runtime_error("Only instances have fields/properties."));
        };
        if self.heap.kind(r) != ObjKind::Instance {
            return Err(self.runtime_error("Only instances have fields/properties."));
        }
        let hash = self.heap.string_hash(name_ref);
        if let ObjData::Instance(i) = self.heap.data_mut(r) {
            i.fields.set(name_ref, hash, value);
        }
        Ok(())
    }

    fn array_index(&mut self, key: Value) -> Result<usize, Value> {
        let Value::Number(n) = key else {
            return Err(self.runtime_error("Arrays can only be subscripted by numbers."));
        };
        if n.fract() != 0.0 {
            return Err(self.runtime_error("Subscript must be an integer."));
        }
        if n < 0.0 {
            return Err(self.runtime_error("Subscript out of bounds."));
        }
        Ok(n as usize)
    }

    fn get_subscript(&mut self, obj: Value, key: Value) -> Result<Value, Value> {
        let Value::Obj(r) = obj else {
            return Err(self.runtime_error("Only arrays and tables can be subscripted."));
        };
        match self.heap.kind(r) {
            ObjKind::Array => {
                let idx = self.array_index(key)?;
                match self.heap.data(r) {
                    ObjData::Array(a) if idx < a.values.len() => Ok(a.values[idx]),
                    ObjData::Array(_) => Err(self.runtime_error("Subscript out of bounds.")),
                    _ => unreachable!(),
                }
            }
            ObjKind::Table => {
                let Value::Obj(key_ref) = key else {
                    return Err(self.runtime_error("Tables can only be subscripted by strings."));
                };
                if self.heap.kind(key_ref) != ObjKind::String {
                    return Err(self.runtime_error("Tables can only be subscripted by strings."));
                }
                let hash = self.heap.string_hash(key_ref);
                match self.heap.data(r) {
                    ObjData::Table(t) => Ok(t.table.get(key_ref, hash).unwrap_or(Value::Nil)),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.runtime_error("Only arrays and tables can be subscripted.")),
        }
    }

    fn set_subscript(&mut self, obj: Value, key: Value, value: Value) -> Result<(), Value> {
        let Value::Obj(r) = obj else {
            return Err(self.runtime_error("Only arrays and tables can be subscripted."));
        };
        match self.heap.kind(r) {
            ObjKind::Array => {
                let idx = self.array_index(key)?;
                if let ObjData::Array(a) = self.heap.data_mut(r) {
                    if idx >= a.values.len() {
                        a.values.resize(idx + 1, Value::Nil);
                    }
                    a.values[idx] = value;
                }
                Ok(())
            }
            ObjKind::Table => {
                let Value::Obj(key_ref) = key else {
                    return Err(self.runtime_error("Tables can only be subscripted by strings."));
                };
                if self.heap.kind(key_ref) != ObjKind::String {
                    return Err(self.runtime_error("Tables can only be subscripted by strings."));
                }
                let hash = self.heap.string_hash(key_ref);
                if let ObjData::Table(t) = self.heap.data_mut(r) {
                    t.table.set(key_ref, hash, value);
                }
                Ok(())
            }
            _ => Err(self.runtime_error("Only arrays and tables can be subscripted.")),
        }
    }

    // ---- arithmetic --------------------------------------------------------

    fn as_number(&mut self, v: Value) -> Result<f64, Value> {
        v.as_number().ok_or_else(|| self.runtime_error("Operand(s) must be number(s)."))
    }

    // ---- small per-frame accessors ----------------------------------------

    fn reg(&self, frame: &CallFrame, r: Reg) -> Value {
        self.stack[frame.base + r as usize]
    }

    fn set_reg(&mut self, frame: &CallFrame, r: Reg, v: Value) {
        self.stack[frame.base + r as usize] = v;
    }

    fn set_ip(&mut self, ip: usize) {
        self.frames.last_mut().unwrap().ip = ip;
    }

    fn chunk_of<'a>(&'a self, function: ObjRef) -> &'a Chunk {
        match self.heap.data(function) {
            ObjData::Function(f) => &f.chunk,
            _ => unreachable!(),
        }
    }

    fn instr_at(&self, function: ObjRef, ip: usize) -> Instr {
        self.chunk_of(function).code[ip]
    }

    fn line_at(&self, function: ObjRef, ip: usize) -> usize {
        self.chunk_of(function).line_at(ip)
    }

    fn constant(&self, function: ObjRef, idx: u16) -> Value {
        self.chunk_of(function).constants[idx as usize]
    }

    fn companion_branch(&mut self, frame: &CallFrame, condition: bool) {
        if condition {
            self.set_ip(frame.ip + 1);
        } else {
            self.set_ip(frame.ip + 2);
        }
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let roots = Roots {
            stack: &self.stack,
            frames: &self.frames,
            open_upvalues: &self.open_upvalues,
            globals: &self.globals,
            array_class: self.array_class,
            table_class: self.table_class,
            exception_class: self.exception_class,
            init_string: self.init_string,
            msg_key: self.msg_key,
        };
        let before = self.heap.bytes_allocated;
        self.heap.collect_garbage(&roots);
        tracing::debug!(
            "gc cycle: collected {} bytes, next at {}",
            before.saturating_sub(self.heap.bytes_allocated),
            self.heap.next_gc
        );
    }

    // ---- the dispatch loop -------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.maybe_collect();
            match self.execute_one() {
                Ok(Step::Continue) => {}
                Ok(Step::Halt) => return Ok(()),
                Err(exc) => self.unwind(exc)?,
            }
        }
    }

    fn execute_one(&mut self) -> Result<Step, Value> {
        let frame = *self.frames.last().expect("run() called with no active frame");
        let instr = self.instr_at(frame.function, frame.ip);

        match instr.op() {
            OpCode::LoadConst => {
                let v = self.constant(frame.function, instr.d());
                self.set_reg(&frame, instr.a(), v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::Primitive => {
                let v = match instr.d() {
                    0 => Value::Nil,
                    1 => Value::Bool(true),
                    _ => Value::Bool(false),
                };
                self.set_reg(&frame, instr.a(), v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::Negate => {
                let v = self.reg(&frame, instr.b());
                let n = self.as_number(v)?;
                self.set_reg(&frame, instr.a(), Value::Number(-n));
                self.set_ip(frame.ip + 1);
            }
            OpCode::Not => {
                let v = self.reg(&frame, instr.b());
                let truthy = v.is_truthy(&self.heap);
                self.set_reg(&frame, instr.a(), Value::Bool(!truthy));
                self.set_ip(frame.ip + 1);
            }
            OpCode::Mov => {
                let v = self.reg(&frame, instr.b());
                self.set_reg(&frame, instr.a(), v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::DefineGlobal => {
                let name_ref = self.as_string_constant(frame.function, instr.d());
                let hash = self.heap.string_hash(name_ref);
                let v = self.reg(&frame, instr.a());
                self.globals.set(name_ref, hash, v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::GetGlobal => {
                let name_ref = self.as_string_constant(frame.function, instr.d());
                let hash = self.heap.string_hash(name_ref);
                match self.globals.get(name_ref, hash) {
                    Some(v) => {
                        self.set_reg(&frame, instr.a(), v);
                        self.set_ip(frame.ip + 1);
                    }
                    None => return Err(self.undefined_variable(name_ref)),
                }
            }
            OpCode::SetGlobal => {
                let name_ref = self.as_string_constant(frame.function, instr.d());
                let hash = self.heap.string_hash(name_ref);
                if self.globals.get(name_ref, hash).is_none() {
                    return Err(self.undefined_variable(name_ref));
                }
                let v = self.reg(&frame, instr.a());
                self.globals.set(name_ref, hash, v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::Equal | OpCode::NotEqual | OpCode::Greater | OpCode::GreaterEqual | OpCode::Less
            | OpCode::LessEqual | OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                let l = self.reg(&frame, instr.b());
                let r = self.reg(&frame, instr.c());
                let result = self.binary_op(instr.op(), l, r)?;
                self.set_reg(&frame, instr.a(), result);
                self.set_ip(frame.ip + 1);
            }
            OpCode::Jump => {
                let target = (frame.ip as i32 + 1 + instr.jump_offset()) as usize;
                self.set_ip(target);
            }
            OpCode::JumpIfFalse => {
                let v = self.reg(&frame, instr.a());
                if !v.is_truthy(&self.heap) {
                    self.set_ip((frame.ip as i32 + 1 + instr.jump_offset()) as usize);
                } else {
                    self.set_ip(frame.ip + 1);
                }
            }
            OpCode::JumpIfTrue => {
                let v = self.reg(&frame, instr.a());
                if v.is_truthy(&self.heap) {
                    self.set_ip((frame.ip as i32 + 1 + instr.jump_offset()) as usize);
                } else {
                    self.set_ip(frame.ip + 1);
                }
            }
            OpCode::CopyJumpIfFalse => {
                let b = self.reg(&frame, instr.b());
                self.set_reg(&frame, instr.a(), b);
                let falsy = !b.is_truthy(&self.heap);
                self.companion_branch(&frame, falsy);
            }
            OpCode::CopyJumpIfTrue => {
                let b = self.reg(&frame, instr.b());
                self.set_reg(&frame, instr.a(), b);
                let truthy = b.is_truthy(&self.heap);
                self.companion_branch(&frame, truthy);
            }
            OpCode::Call => {
                let base = frame.base + instr.a() as usize;
                let argc = instr.c() as usize;
                self.set_ip(frame.ip + 1);
                self.call_value(base, argc)?;
            }
            OpCode::Return => {
                let value = self.reg(&frame, instr.a());
                self.close_upvalues_from(frame.base);
                self.frames.pop();
                if self.frames.is_empty() {
                    return Ok(Step::Halt);
                }
                self.stack[frame.base] = value;
            }
            OpCode::Closure => {
                let func_ref = match self.constant(frame.function, instr.d()) {
                    Value::Obj(r) => r,
                    _ => unreachable!("CLOSURE constant must be a function"),
                };
                let descriptors = match self.heap.data(func_ref) {
                    ObjData::Function(f) => f.upvalue_descriptors.clone(),
                    _ => unreachable!(),
                };
                let mut upvalues = Vec::with_capacity(descriptors.len());
                for d in descriptors {
                    let index = (d & 0xff) as usize;
                    if d & UV_IS_LOCAL != 0 {
                        upvalues.push(self.find_or_create_upvalue(frame.base + index));
                    } else {
                        let parent = match self.heap.data(frame.closure) {
                            ObjData::Closure(c) => c.upvalues[index],
                            _ => unreachable!(),
                        };
                        upvalues.push(parent);
                    }
                }
                let closure_ref = self.heap.allocate(ObjData::Closure(ClosureObj {
                    function: func_ref,
                    upvalues,
                }));
                tracing::debug!(
                    "closure created: {}",
                    self.function_name(func_ref).unwrap_or_else(|| "<script>".to_string())
                );
                self.set_reg(&frame, instr.a(), Value::Obj(closure_ref));
                self.set_ip(frame.ip + 1);
            }
            OpCode::GetUpval => {
                let uv = match self.heap.data(frame.closure) {
                    ObjData::Closure(c) => c.upvalues[instr.b() as usize],
                    _ => unreachable!(),
                };
                let v = self.read_upvalue(uv);
                self.set_reg(&frame, instr.a(), v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::SetUpval => {
                let uv = match self.heap.data(frame.closure) {
                    ObjData::Closure(c) => c.upvalues[instr.a() as usize],
                    _ => unreachable!(),
                };
                let v = self.reg(&frame, instr.b());
                self.write_upvalue(uv, v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::CloseUpvalues => {
                self.close_upvalues_from(frame.base + instr.a() as usize);
                self.set_ip(frame.ip + 1);
            }
            OpCode::Class => {
                let name_ref = self.as_string_constant(frame.function, instr.d());
                let class_ref = self.heap.allocate(ObjData::Class(ClassObj {
                    name: name_ref,
                    methods: XanTable::new(),
                    is_exception: false,
                    superclass: None,
                }));
                self.set_reg(&frame, instr.a(), Value::Obj(class_ref));
                self.set_ip(frame.ip + 1);
            }
            OpCode::Method => {
                let class_val = self.reg(&frame, instr.a());
                let closure_val = self.reg(&frame, instr.b());
                let name_val = self.reg(&frame, instr.c());
                let (Value::Obj(class_ref), Value::Obj(name_ref)) = (class_val, name_val) else {
                    unreachable!("METHOD operands must be a class and a name constant");
                };
                let hash = self.heap.string_hash(name_ref);
                if let ObjData::Class(c) = self.heap.data_mut(class_ref) {
                    c.methods.set(name_ref, hash, closure_val);
                }
                self.set_ip(frame.ip + 1);
            }
            OpCode::Inherit => {
                // class_declaration() emits `Inherit subclass_reg, super_reg`.
                let Value::Obj(sub_ref) = self.reg(&frame, instr.a()) else {
                    unreachable!("Inherit's A operand is always the subclass being declared");
                };
                let Value::Obj(super_ref) = self.reg(&frame, instr.b()) else {
                    return Err(self.runtime_error("Superclass must be a class."));
                };
                if self.heap.kind(super_ref) != ObjKind::Class {
                    return Err(self.runtime_error("Superclass must be a class."));
                }
                let (super_methods, super_is_exc) = match self.heap.data(super_ref) {
                    ObjData::Class(c) => (c.methods.clone(), c.is_exception),
                    _ => unreachable!(),
                };
                if let ObjData::Class(c) = self.heap.data_mut(sub_ref) {
                    c.methods.add_all(&super_methods);
                    c.superclass = Some(super_ref);
                    if super_is_exc {
                        c.is_exception = true;
                    }
                }
                self.set_ip(frame.ip + 1);
            }
            OpCode::GetSuper => {
                let super_val = self.reg(&frame, instr.b());
                let Value::Obj(super_ref) = super_val else {
                    return Err(self.runtime_error("Superclass must be a class."));
                };
                let name_val = self.reg(&frame, instr.c());
                let Value::Obj(name_ref) = name_val else {
                    unreachable!("GET_SUPER name operand must be a string constant");
                };
                let this_val = self.stack[frame.base];
                let bound = self.bind_method(super_ref, this_val, name_ref)?;
                self.set_reg(&frame, instr.a(), bound);
                self.set_ip(frame.ip + 1);
            }
            OpCode::GetProperty => {
                let obj = self.reg(&frame, instr.b());
                let name_val = self.reg(&frame, instr.c());
                let Value::Obj(name_ref) = name_val else {
                    unreachable!("GET_PROPERTY name operand must be a string constant");
                };
                let v = self.get_property(obj, name_ref)?;
                self.set_reg(&frame, instr.a(), v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::SetProperty => {
                let value = self.reg(&frame, instr.a());
                let obj = self.reg(&frame, instr.b());
                let name_val = self.reg(&frame, instr.c());
                let Value::Obj(name_ref) = name_val else {
                    unreachable!("SET_PROPERTY name operand must be a string constant");
                };
                self.set_property(obj, name_ref, value)?;
                self.set_ip(frame.ip + 1);
            }
            OpCode::NewArray => {
                let base_reg = instr.a();
                let count = instr.b() as usize;
                let start = frame.base + base_reg as usize + 1;
                let values: Vec<Value> = self.stack[start..start + count].to_vec();
                let r = self.heap.allocate(ObjData::Array(ArrayObj {
                    klass: self.array_class,
                    values,
                }));
                self.set_reg(&frame, base_reg, Value::Obj(r));
                self.set_ip(frame.ip + 1);
            }
            OpCode::NewTable => {
                let base_reg = instr.a();
                let count = instr.b() as usize;
                let start = frame.base + base_reg as usize + 1;
                let mut table = XanTable::new();
                for i in 0..count {
                    let key = self.stack[start + 2 * i];
                    let val = self.stack[start + 2 * i + 1];
                    let Value::Obj(key_ref) = key else {
                        unreachable!("table literal key must be an interned string");
                    };
                    let hash = self.heap.string_hash(key_ref);
                    table.set(key_ref, hash, val);
                }
                let r = self.heap.allocate(ObjData::Table(TableObj {
                    klass: self.table_class,
                    table,
                }));
                self.set_reg(&frame, base_reg, Value::Obj(r));
                self.set_ip(frame.ip + 1);
            }
            OpCode::GetSubscript => {
                let obj = self.reg(&frame, instr.b());
                let key = self.reg(&frame, instr.c());
                let v = self.get_subscript(obj, key)?;
                self.set_reg(&frame, instr.a(), v);
                self.set_ip(frame.ip + 1);
            }
            OpCode::SetSubscript => {
                let value = self.reg(&frame, instr.a());
                let obj = self.reg(&frame, instr.b());
                let key = self.reg(&frame, instr.c());
                self.set_subscript(obj, key, value)?;
                self.set_ip(frame.ip + 1);
            }
            OpCode::BeginTry => {
                self.try_handlers.push(TryHandler {
                    handler_pc: instr.d() as usize,
                    exception_slot: instr.a(),
                    frame_index: self.frames.len() - 1,
                });
                self.set_ip(frame.ip + 1);
            }
            OpCode::EndTry => {
                self.try_handlers.pop();
                self.set_ip(frame.ip + 1);
            }
            OpCode::JumpIfNotExc => {
                let type_val = self.reg(&frame, instr.a());
                let exc_val = self.reg(&frame, instr.b());
                let matched = self.exception_matches(exc_val, type_val);
                self.companion_branch(&frame, !matched);
            }
            OpCode::Throw => {
                let value = self.reg(&frame, instr.a());
                if self.is_exception_value(value) {
                    return Err(value);
                }
                return Err(self.runtime_error("Only exceptions can be thrown."));
            }
        }
        Ok(Step::Continue)
    }

    fn as_string_constant(&self, function: ObjRef, idx: u16) -> ObjRef {
        match self.constant(function, idx) {
            Value::Obj(r) => r,
            _ => unreachable!("constant must be an interned string"),
        }
    }

    fn undefined_variable(&mut self, name_ref: ObjRef) -> Value {
        let name = String::from_utf8_lossy(self.heap.string_bytes(name_ref)).into_owned();
        self.runtime_error(&format!("Undefined variable '{name}'."))
    }

    fn binary_op(&mut self, op: OpCode, l: Value, r: Value) -> Result<Value, Value> {
        match op {
            OpCode::Equal => Ok(Value::Bool(l.values_equal(&r))),
            OpCode::NotEqual => Ok(Value::Bool(!l.values_equal(&r))),
            OpCode::Add => match (l, r) {
                (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
                (Value::Obj(ra), Value::Obj(rb))
                    if self.heap.kind(ra) == ObjKind::String && self.heap.kind(rb) == ObjKind::String =>
                {
                    let mut bytes = self.heap.string_bytes(ra).to_vec();
                    bytes.extend_from_slice(self.heap.string_bytes(rb));
                    Ok(Value::Obj(self.heap.intern(&bytes)))
                }
                _ => Err(self.runtime_error("Operand(s) must be number(s).")),
            },
            OpCode::Sub => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Number(a - b))
            }
            OpCode::Mul => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Number(a * b))
            }
            OpCode::Div => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Number(a / b))
            }
            OpCode::Mod => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Number(a % b))
            }
            OpCode::Less => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Bool(a < b))
            }
            OpCode::LessEqual => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Bool(a <= b))
            }
            OpCode::Greater => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Bool(a > b))
            }
            OpCode::GreaterEqual => {
                let a = self.as_number(l)?;
                let b = self.as_number(r)?;
                Ok(Value::Bool(a >= b))
            }
            _ => unreachable!("binary_op called with a non-binary opcode"),
        }
    }
}
