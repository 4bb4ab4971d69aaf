//! Error types raised by the VM.
//!
//! ```text
//! VmError       - a runtime error raised by a script or a native function
//! CompileError  - a lexer/parser failure while compiling a buffer
//! ```

use std::fmt;

use thiserror::Error;

use crate::value::Value;

/// Result alias used by the stack API and native functions.
pub type VmResult<T> = Result<T, VmError>;

/// One entry of the call stack captured while an error unwinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name, `"unknown"` for anonymous functions.
    pub function: String,
    /// Source name of the buffer the function was compiled from.
    /// `None` for native functions.
    pub source: Option<String>,
    /// Line being executed when the error passed through this frame.
    pub line: Option<u32>,
}

impl TraceFrame {
    pub fn native(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            source: None,
            line: None,
        }
    }

    pub fn script(function: impl Into<String>, source: impl Into<String>, line: u32) -> Self {
        Self {
            function: function.into(),
            source: Some(source.into()),
            line: Some(line),
        }
    }
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.source, self.line) {
            (Some(source), Some(line)) => {
                write!(f, "*FUNCTION [{}()] {} line [{}]", self.function, source, line)
            }
            _ => write!(f, "*FUNCTION [{}()] native", self.function),
        }
    }
}

/// A runtime error raised inside the VM.
///
/// The thrown value is kept as-is so `catch` blocks observe exactly what was
/// thrown; `message` is its rendered form.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct VmError {
    value: Value,
    message: String,
    trace: Vec<TraceFrame>,
}

impl VmError {
    /// Raise an error carrying a string message.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            value: Value::from(message.as_str()),
            message,
            trace: Vec::new(),
        }
    }

    /// Raise an error carrying an arbitrary thrown value.
    pub fn from_value(value: Value) -> Self {
        let message = value.to_string();
        Self {
            value,
            message,
            trace: Vec::new(),
        }
    }

    /// The thrown value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The rendered error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Frames the error unwound through, innermost first.
    pub fn trace(&self) -> &[TraceFrame] {
        &self.trace
    }

    pub(crate) fn push_frame(&mut self, frame: TraceFrame) {
        self.trace.push(frame);
    }
}

/// A failure while compiling a script buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_name}:{line}:{column}: {message}")]
pub struct CompileError {
    pub message: String,
    pub source_name: String,
    pub line: u32,
    pub column: u32,
}

impl CompileError {
    pub fn new(message: impl Into<String>, source_name: &str, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            source_name: source_name.to_string(),
            line,
            column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_error_from_string() {
        let error = VmError::new("boom");
        assert_eq!(error.message(), "boom");
        assert_eq!(error.to_string(), "boom");
        assert!(matches!(error.value(), Value::String(s) if &**s == "boom"));
    }

    #[test]
    fn vm_error_from_value_renders_message() {
        let error = VmError::from_value(Value::Integer(42));
        assert_eq!(error.message(), "42");
    }

    #[test]
    fn trace_frame_display() {
        let frame = TraceFrame::script("main", "test.nut", 3);
        assert_eq!(frame.to_string(), "*FUNCTION [main()] test.nut line [3]");
        let frame = TraceFrame::native("getF");
        assert_eq!(frame.to_string(), "*FUNCTION [getF()] native");
    }

    #[test]
    fn compile_error_display() {
        let error = CompileError::new("expected ';'", "buf", 2, 7);
        assert_eq!(error.to_string(), "buf:2:7: expected ';'");
    }
}
