//! Call-frame and exception-handler bookkeeping.
//!
//! The original threads raw `Value*` pointers through `CallFrame.slots`
//! and rebases them whenever the stack array grows. Here the VM's value
//! stack is a plain `Vec<Value>` and every frame instead records `base`,
//! an index into that vec — so a realloc that moves the vec never
//! invalidates a frame, and nothing needs a rebase pass.

use xan_core::ObjRef;

#[derive(Clone, Copy)]
pub struct CallFrame {
    /// The `Closure` object this frame is executing.
    pub closure: ObjRef,
    /// `closure`'s underlying `Function`, cached so the dispatch loop
    /// doesn't re-deref through the closure on every fetch.
    pub function: ObjRef,
    /// Index of the next instruction to fetch, in the closure's
    /// function's `Chunk::code`.
    pub ip: usize,
    /// `stack[base]` is this frame's register 0.
    pub base: usize,
}

/// One entry of the VM's try-stack, pushed by `OP_BEGIN_TRY` and popped
/// either by `OP_END_TRY` (falling out of the `try` block normally) or by
/// exception unwinding (`Vm::unwind`).
#[derive(Clone, Copy)]
pub struct TryHandler {
    /// PC (within the owning frame's chunk) of the first catch clause.
    pub handler_pc: usize,
    /// Register the caught exception value is written into.
    pub exception_slot: xan_core::Reg,
    /// Index into `Vm::frames` of the frame that installed this handler.
    /// Unwinding truncates `frames` back to `frame_index + 1`.
    pub frame_index: usize,
}
