//! xan-core: value/object model, string-interning hash table, bytecode chunk
//! encoding and the tracing mark-and-sweep collector shared by the compiler
//! and the VM.
//!
//! # Modules
//!
//! - `value`: the tagged `Value` union and object-reference handles
//! - `object`: concrete heap object kinds (strings, functions, closures, …)
//! - `table`: open-addressing hash table with tombstones (interning, globals,
//!   user `Table` objects all share this implementation)
//! - `chunk`: packed 32-bit instruction words and the per-function code unit
//! - `heap`: the allocator and tracing GC

pub mod chunk;
pub mod error;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, Instr, OpCode, Reg, JUMP_BIAS, NO_JUMP, NO_REG};
pub use error::CoreError;
pub use heap::{GcRoots, Heap};
pub use object::{
    ArrayObj, BoundMethodObj, ClassObj, ClosureObj, FunctionObj, FunctionType, InstanceObj,
    NativeContext, NativeFn, NativeObj, ObjData, ObjKind, TableObj, UpvalueLocation, UpvalueObj,
    XanString, UV_IS_LOCAL,
};
pub use table::{fnv1a, XanTable};
pub use value::{ObjRef, Value};
