//! Compile-time diagnostics.
//!
//! Errors are collected rather than raised eagerly: the parser enters
//! *panic mode* on the first error, suppresses further reports until it
//! resynchronizes at the next statement boundary, and keeps parsing so a
//! single compile can report more than one problem.

use std::fmt;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: usize,
    pub message: String,
    /// The offending lexeme, or empty at end of input.
    pub lexeme: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lexeme.is_empty() {
            write!(f, "[line {}] Error at end: {}", self.line, self.message)
        } else {
            write!(
                f,
                "[line {}] Error at '{}': {}",
                self.line, self.lexeme, self.message
            )
        }
    }
}

impl std::error::Error for CompileError {}
