//! xanvm: the frame-stack interpreter, upvalue machinery, exception
//! unwinding, and the native-function surface (`clock`, `print`, `Array`,
//! `Table`, `Exception`) that together execute bytecode emitted by
//! `xan-compiler` over the value/object model in `xan-core`.
//!
//! # Modules
//!
//! - `vm`: the dispatch loop, call/return, upvalue open/close, GC roots
//! - `frame`: per-call-frame and try-handler bookkeeping
//! - `natives`: the minimal built-in surface named in the spec
//! - `display`: `Value` -> text formatting for `print` and stack traces
//! - `error`: the top-level `InterpretResult` and uncaught-exception report

pub mod display;
pub mod error;
pub mod frame;
pub mod natives;
pub mod vm;

pub use error::{InterpretResult, RuntimeError, TraceFrame};
pub use vm::Vm;
