//! Error type for invariant violations inside the core crate itself.
//!
//! This is distinct from compile errors (xan-compiler) and runtime
//! exceptions (xan-vm): it only fires when an invariant the rest of the
//! workspace relies on has been broken, e.g. an `ObjRef` that outlived its
//! heap slot.

use std::fmt;

#[derive(Debug)]
pub enum CoreError {
    /// An `ObjRef` pointed at a freed or never-allocated heap slot.
    DanglingRef(crate::value::ObjRef),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::DanglingRef(r) => write!(f, "dangling object reference: {r:?}"),
        }
    }
}

impl std::error::Error for CoreError {}
