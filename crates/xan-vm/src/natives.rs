//! The minimal native surface named in §1 of the spec: `clock`, `print`,
//! and the `Array` / `Table` / `Exception` built-in classes.
//!
//! Grounded on `original_source/src/builtin.c` (`clockNative`,
//! `printNative`, the `BuiltinClasses`/`BuiltinMethods` registration
//! tables), `original_source/src/array.c` (`ArrayInit`/`ArrayCount`), and
//! `original_source/src/exception.c` (`ExceptionInit`). `push`/`pop` on
//! `Array` and `count` on `Table` are additions the original doesn't have
//! (see SPEC_FULL.md §2) needed for a usable growable sequence and a way
//! to ask a table its size without iterating by hand.

use xan_core::{fnv1a, ArrayObj, Heap, InstanceObj, NativeContext, NativeFn, ObjData, ObjKind, ObjRef, Value, XanTable};

fn receiver_ref(ctx: &dyn NativeContext) -> ObjRef {
    match ctx.receiver() {
        Value::Obj(r) => r,
        // Guaranteed by the VM's method-dispatch path: these natives are
        // only ever reached as bound methods on an Array/Table instance.
        _ => unreachable!("native method invoked without an object receiver"),
    }
}

/// An `init` native reached via `call_class` (not a bound-method call) sees
/// the invoked class itself as its receiver, so a subclass's constructor
/// call produces an instance of the *subclass*, not of whichever built-in
/// registered the native. Falls back to `default_name` for the rare caller
/// that invokes the native directly with no class receiver bound.
fn invoked_class(heap: &Heap, ctx: &dyn NativeContext, default_name: &str) -> ObjRef {
    match ctx.receiver() {
        Value::Obj(r) if heap.kind(r) == ObjKind::Class => r,
        _ => ctx
            .lookup_class(heap, default_name)
            .unwrap_or_else(|| panic!("{default_name} class must be registered before construction")),
    }
}

fn clock_native(_heap: &mut Heap, _ctx: &mut dyn NativeContext, _args: &[Value]) -> Result<Value, Value> {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

fn print_native(heap: &mut Heap, ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, Value> {
    let v = args.first().copied().unwrap_or(Value::Nil);
    let text = crate::display::format_value(heap, v);
    let _ = writeln!(ctx.stdout(), "{text}");
    Ok(Value::Nil)
}

fn array_init(heap: &mut Heap, ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, Value> {
    let count = match args.first() {
        None => 0usize,
        Some(Value::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => *n as usize,
        Some(_) => return Err(ctx.make_exception(heap, "Array.init expects a non-negative integer count.")),
    };
    let fill = args.get(1).copied().unwrap_or(Value::Nil);
    let klass = invoked_class(heap, ctx, "Array");
    let arr = ArrayObj {
        klass,
        values: vec![fill; count],
    };
    Ok(Value::Obj(heap.allocate(ObjData::Array(arr))))
}

fn array_count(heap: &mut Heap, ctx: &mut dyn NativeContext, _args: &[Value]) -> Result<Value, Value> {
    let r = receiver_ref(ctx);
    match heap.data(r) {
        ObjData::Array(a) => Ok(Value::Number(a.values.len() as f64)),
        _ => unreachable!("Array.count receiver was not an array"),
    }
}

fn array_push(heap: &mut Heap, ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, Value> {
    let r = receiver_ref(ctx);
    let v = args.first().copied().unwrap_or(Value::Nil);
    match heap.data_mut(r) {
        ObjData::Array(a) => a.values.push(v),
        _ => unreachable!("Array.push receiver was not an array"),
    }
    Ok(Value::Obj(r))
}

fn array_pop(heap: &mut Heap, ctx: &mut dyn NativeContext, _args: &[Value]) -> Result<Value, Value> {
    let r = receiver_ref(ctx);
    let popped = match heap.data_mut(r) {
        ObjData::Array(a) => a.values.pop(),
        _ => unreachable!("Array.pop receiver was not an array"),
    };
    popped.ok_or_else(|| ctx.make_exception(heap, "pop() called on an empty array."))
}

fn table_count(heap: &mut Heap, ctx: &mut dyn NativeContext, _args: &[Value]) -> Result<Value, Value> {
    let r = receiver_ref(ctx);
    match heap.data(r) {
        ObjData::Table(t) => Ok(Value::Number(t.table.count() as f64)),
        _ => unreachable!("Table.count receiver was not a table"),
    }
}

fn exception_init(heap: &mut Heap, ctx: &mut dyn NativeContext, args: &[Value]) -> Result<Value, Value> {
    let msg = args.first().copied().unwrap_or(Value::Nil);
    let klass = invoked_class(heap, ctx, "Exception");
    Ok(build_exception_instance(heap, klass, msg))
}

/// Builds an `Exception` instance with `msg` set directly to `message_value`
/// (already a `Value`, not necessarily a string — the language doesn't stop
/// you from throwing `Exception(42)`). Shared between the user-visible
/// `Exception.init` native and the VM's own built-in runtime errors (see
/// `Vm::runtime_error`), which always pass an interned string.
pub fn build_exception_instance(heap: &mut Heap, exception_class: ObjRef, message_value: Value) -> Value {
    let key = heap.intern(b"msg");
    let mut fields = XanTable::new();
    fields.set(key, fnv1a(b"msg"), message_value);
    Value::Obj(heap.allocate(ObjData::Instance(InstanceObj {
        klass: exception_class,
        fields,
    })))
}

/// Convenience wrapper for the common case: a built-in error described by a
/// plain `&str`, interned on the spot.
pub fn build_exception(heap: &mut Heap, exception_class: ObjRef, message: &str) -> Value {
    let msg = Value::Obj(heap.intern(message.as_bytes()));
    build_exception_instance(heap, exception_class, msg)
}

fn define_native(heap: &mut Heap, globals: &mut XanTable, name: &str, f: NativeFn) {
    let name_ref = heap.intern(name.as_bytes());
    let hash = heap.string_hash(name_ref);
    let native_ref = heap.allocate(ObjData::Native(xan_core::NativeObj { name: name_ref, function: f }));
    globals.set(name_ref, hash, Value::Obj(native_ref));
}

fn define_method(heap: &mut Heap, methods: &mut XanTable, name: &str, f: NativeFn) {
    let name_ref = heap.intern(name.as_bytes());
    let hash = heap.string_hash(name_ref);
    let native_ref = heap.allocate(ObjData::Native(xan_core::NativeObj { name: name_ref, function: f }));
    methods.set(name_ref, hash, Value::Obj(native_ref));
}

/// The three built-in classes, returned so the VM can cache their
/// `ObjRef`s (array/table literals need `Array`/`Table`'s ref for their
/// `klass` field; `OP_THROW`/catch-matching need `Exception`'s).
pub struct Builtins {
    pub array_class: ObjRef,
    pub table_class: ObjRef,
    pub exception_class: ObjRef,
}

/// Registers `clock`, `print`, and the `Array`/`Table`/`Exception`
/// classes into `globals`, mirroring `object.c`'s `defineNativeClass`
/// (class-name string interned, methods table built up one native at a
/// time, then the class bound as a global) and `builtin.c`'s direct
/// `NativeDef` registration for bare functions.
pub fn install(heap: &mut Heap, globals: &mut XanTable) -> Builtins {
    define_native(heap, globals, "clock", clock_native);
    define_native(heap, globals, "print", print_native);

    let mut array_methods = XanTable::new();
    define_method(heap, &mut array_methods, "init", array_init);
    define_method(heap, &mut array_methods, "count", array_count);
    define_method(heap, &mut array_methods, "push", array_push);
    define_method(heap, &mut array_methods, "pop", array_pop);
    let array_name = heap.intern(b"Array");
    let array_class = heap.allocate(ObjData::Class(xan_core::ClassObj {
        name: array_name,
        methods: array_methods,
        is_exception: false,
        superclass: None,
    }));
    globals.set(array_name, heap.string_hash(array_name), Value::Obj(array_class));

    let mut table_methods = XanTable::new();
    define_method(heap, &mut table_methods, "count", table_count);
    let table_name = heap.intern(b"Table");
    let table_class = heap.allocate(ObjData::Class(xan_core::ClassObj {
        name: table_name,
        methods: table_methods,
        is_exception: false,
        superclass: None,
    }));
    globals.set(table_name, heap.string_hash(table_name), Value::Obj(table_class));

    let mut exception_methods = XanTable::new();
    define_method(heap, &mut exception_methods, "init", exception_init);
    let exception_name = heap.intern(b"Exception");
    let exception_class = heap.allocate(ObjData::Class(xan_core::ClassObj {
        name: exception_name,
        methods: exception_methods,
        is_exception: true,
        superclass: None,
    }));
    globals.set(exception_name, heap.string_hash(exception_name), Value::Obj(exception_class));

    Builtins {
        array_class,
        table_class,
        exception_class,
    }
}
