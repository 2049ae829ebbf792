//! Value-to-text formatting for `print` and uncaught-exception reporting.
//!
//! Grounded on `original_source/src/object.c`'s `fprintObject`/`printObject`:
//! functions print as `<fn name>` (or `<script>` for the top-level function),
//! arrays as `[e1, e2]`, instances as `ClassName instance`, classes as their
//! bare name, natives as `<native fn>`, bound methods delegate to whatever
//! they're bound to, and strings print their raw bytes.

use xan_core::{Heap, ObjData, Value};

pub fn format_value(heap: &Heap, v: Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::Obj(r) => format_object(heap, r),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn format_object(heap: &Heap, r: xan_core::ObjRef) -> String {
    match heap.data(r) {
        ObjData::Str(s) => String::from_utf8_lossy(&s.chars).into_owned(),
        ObjData::Native(_) => "<native fn>".to_string(),
        ObjData::Function(f) => match f.name {
            Some(n) => format!("<fn {}>", String::from_utf8_lossy(heap.string_bytes(n))),
            None => "<script>".to_string(),
        },
        ObjData::Closure(c) => format_object(heap, c.function),
        ObjData::Upvalue(_) => "upvalue".to_string(),
        ObjData::Class(c) => String::from_utf8_lossy(heap.string_bytes(c.name)).into_owned(),
        ObjData::Array(a) => {
            let parts: Vec<String> = a.values.iter().map(|v| format_value(heap, *v)).collect();
            format!("[{}]", parts.join(", "))
        }
        ObjData::Instance(i) => {
            let name = match heap.data(i.klass) {
                ObjData::Class(c) => String::from_utf8_lossy(heap.string_bytes(c.name)).into_owned(),
                _ => "?".to_string(),
            };
            format!("{name} instance")
        }
        ObjData::BoundMethod(b) => format_object(heap, b.method),
        ObjData::Table(_) => "table".to_string(),
    }
}
