//! Concrete heap object kinds.
//!
//! Every variant of [`ObjData`] is owned by exactly one [`crate::heap::Heap`]
//! slot; cross-references between objects go through [`ObjRef`] indices
//! rather than pointers, so the collector never has to rebase anything when
//! the arena grows.

use crate::chunk::{Chunk, Reg};
use crate::table::XanTable;
use crate::value::{ObjRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    String,
    Native,
    Function,
    Closure,
    Upvalue,
    Class,
    Array,
    Instance,
    BoundMethod,
    Table,
}

pub struct XanString {
    pub chars: Vec<u8>,
    pub hash: u32,
}

/// `args` excludes the receiver; for methods, callers pass the receiver
/// separately (it lives in the callee's register window at the call site,
/// matching `args[-1]` in the original ABI).
pub type NativeFn = fn(&mut crate::heap::Heap, &mut dyn NativeContext, &[Value]) -> Result<Value, Value>;

/// Everything a native needs from the VM besides the heap: printing, the
/// bound receiver (methods only), and a way to raise an exception without
/// having to know the VM's internal class layout. Kept as a trait object
/// so xan-core does not depend on xan-vm.
pub trait NativeContext {
    fn stdout(&mut self) -> &mut dyn std::io::Write;
    fn receiver(&self) -> Value;
    /// Builds an `Exception` instance carrying `message` as its `msg`
    /// field, using whichever class the embedding VM registered as the
    /// built-in exception type. Natives that want to fail return
    /// `Err(ctx.make_exception(heap, "..."))`.
    fn make_exception(&self, heap: &mut crate::heap::Heap, message: &str) -> Value;
    /// Looks a class up by name in the globals table; used by native
    /// initializers (e.g. `Array`'s) that construct a fresh object of a
    /// known built-in kind rather than mutating a pre-built receiver.
    fn lookup_class(&self, heap: &crate::heap::Heap, name: &str) -> Option<ObjRef>;
}

pub struct NativeObj {
    pub name: ObjRef,
    pub function: NativeFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

/// Bit 0x100 of a packed upvalue descriptor marks it as capturing an
/// enclosing *local* slot rather than forwarding an enclosing *upvalue*.
pub const UV_IS_LOCAL: u16 = 0x100;

pub struct FunctionObj {
    pub arity_min: u8,
    pub arity_max: u8,
    /// `code_offsets[maxArity - argc]` is the entry PC for a call supplying
    /// `argc` arguments; default-valued parameters are filled in by the
    /// prologue code between successive offsets.
    pub code_offsets: Vec<u32>,
    pub upvalue_descriptors: Vec<u16>,
    pub stack_used: Reg,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

pub struct UpvalueObj {
    /// `Open(index)` names a live slot in the VM's value arena. `Closed`
    /// owns the value directly. See `heap::Heap` doc comment for why this
    /// replaces the original's raw `Value*`.
    pub location: UpvalueLocation,
    pub next: Option<ObjRef>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueLocation {
    Open(usize),
    Closed(Value),
}

pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

pub struct ClassObj {
    pub name: ObjRef,
    pub methods: XanTable,
    pub is_exception: bool,
    /// Not present in the original model (`OP_INHERIT` only copies methods,
    /// discarding the link). Kept here so `catch (Type e)` can walk the
    /// chain instead of matching only the exact thrown class.
    pub superclass: Option<ObjRef>,
}

pub struct ArrayObj {
    pub klass: ObjRef,
    pub values: Vec<Value>,
}

pub struct InstanceObj {
    pub klass: ObjRef,
    pub fields: XanTable,
}

pub struct TableObj {
    pub klass: ObjRef,
    pub table: XanTable,
}

pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

pub enum ObjData {
    Str(XanString),
    Native(NativeObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Array(ArrayObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Table(TableObj),
}

impl ObjData {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjData::Str(_) => ObjKind::String,
            ObjData::Native(_) => ObjKind::Native,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Array(_) => ObjKind::Array,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::BoundMethod(_) => ObjKind::BoundMethod,
            ObjData::Table(_) => ObjKind::Table,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ObjData::Str(_) => "OBJ_STRING",
            ObjData::Native(_) => "OBJ_NATIVE",
            ObjData::Function(_) => "OBJ_FUNCTION",
            ObjData::Closure(_) => "OBJ_CLOSURE",
            ObjData::Upvalue(_) => "OBJ_UPVALUE",
            ObjData::Class(_) => "OBJ_CLASS",
            ObjData::Array(_) => "OBJ_ARRAY",
            ObjData::Instance(_) => "OBJ_INSTANCE",
            ObjData::BoundMethod(_) => "OBJ_BOUND_METHOD",
            ObjData::Table(_) => "OBJ_TABLE",
        }
    }
}
