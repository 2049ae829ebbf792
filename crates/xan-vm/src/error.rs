//! The top-level outcome of running a script, and the host-visible
//! representation of an uncaught exception.
//!
//! Exceptions *inside* a running script are plain `Value`s (instances of
//! a class whose `is_exception` flag is set) caught or rethrown entirely
//! in terms of the object model — see `vm::Vm::unwind`. A `RuntimeError`
//! only comes into being once an exception reaches the outermost frame
//! with no handler left to catch it.

use std::fmt;

use xan_compiler::CompileError;

/// One entry of the stack trace printed for an uncaught exception: the
/// name of the function active in that frame (or `None` for the
/// top-level script) and the source line the instruction pointer was at.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function_name: Option<String>,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            match &frame.function_name {
                Some(name) => writeln!(f, "[line {}] in {}", frame.line, name)?,
                None => writeln!(f, "[line {}] in script", frame.line)?,
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

#[derive(Debug, Clone)]
pub enum InterpretResult {
    Ok,
    CompileError(Vec<CompileError>),
    RuntimeError(RuntimeError),
}

impl InterpretResult {
    /// The host process exit code this result corresponds to (§6).
    pub fn exit_code(&self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError(_) => 65,
            InterpretResult::RuntimeError(_) => 70,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, InterpretResult::Ok)
    }
}
