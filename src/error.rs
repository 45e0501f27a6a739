//! Error types for the script runtime
//!
//! Errors fall into three groups: runtime errors raised by scripts or
//! native callbacks (catchable by in-script handlers), internal VM errors
//! (invariant violations, never catchable) and host-facing failures such as
//! malformed bytecode or an exhausted instruction budget.

use std::fmt;

use crate::value::Value;

/// Result type for script runtime operations
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Main error type for script runtime operations
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// Script-level error, catchable by an error handler frame
    #[error("{0}")]
    Runtime(#[from] RuntimeError),

    /// VM invariant violation
    #[error("internal VM error: {0}")]
    Internal(String),

    /// Restriction hit while evaluating a watch or debug expression
    #[error("dynamic expression error: {0}")]
    DynamicExpression(String),

    /// Malformed or incompatible bytecode dump
    #[error("invalid bytecode: {0}")]
    Bytecode(String),

    /// The hard instruction budget was exhausted
    #[error("instruction limit exceeded")]
    InstructionLimitExceeded,

    /// The runtime was entered from a second OS thread
    #[error("script runtime accessed concurrently from a different thread")]
    ConcurrentAccess,

    /// I/O failure while reading or writing bytecode
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScriptError {
    /// Shorthand for a generic runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime(RuntimeError::new(RuntimeErrorKind::Generic, message))
    }

    /// Shorthand for an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        ScriptError::Internal(message.into())
    }

    /// Whether an in-script error handler may intercept this error
    pub fn is_catchable(&self) -> bool {
        matches!(self, ScriptError::Runtime(_))
    }

    /// The runtime error payload, if any
    pub fn as_runtime(&self) -> Option<&RuntimeError> {
        match self {
            ScriptError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

/// Classification of runtime errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    Generic,
    Arithmetic,
    Concatenation,
    Comparison,
    Index,
    Call,
    BadArgument,
    Coroutine,
    StackOverflow,
}

/// One entry of the call-stack snapshot captured when an error is raised
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrameInfo {
    /// Function name if known
    pub function_name: Option<String>,

    /// Formatted source location of the active instruction
    pub location: Option<String>,

    /// Whether the frame belongs to a native callback
    pub is_native: bool,
}

impl fmt::Display for StackFrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.function_name.as_deref().unwrap_or("<anonymous>");
        match (&self.location, self.is_native) {
            (_, true) => write!(f, "[native]: in function '{}'", name),
            (Some(loc), false) => write!(f, "{}: in function '{}'", loc, name),
            (None, false) => write!(f, "?: in function '{}'", name),
        }
    }
}

/// A script runtime error with optional location decoration
#[derive(Debug, Clone)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
    message: String,
    decorated_message: Option<String>,
    instruction_pointer: Option<usize>,
    call_stack: Vec<StackFrameInfo>,
    pub(crate) unwind_decorated: bool,
}

impl RuntimeError {
    /// Create a new runtime error of the given kind
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
            decorated_message: None,
            instruction_pointer: None,
            call_stack: Vec::new(),
            unwind_decorated: false,
        }
    }

    pub fn arithmetic_on(value: &Value) -> Self {
        Self::new(
            RuntimeErrorKind::Arithmetic,
            format!("attempt to perform arithmetic on a {} value", value.type_name()),
        )
    }

    pub fn concat_on(value: &Value) -> Self {
        Self::new(
            RuntimeErrorKind::Concatenation,
            format!("attempt to concatenate a {} value", value.type_name()),
        )
    }

    pub fn compare(left: &Value, right: &Value) -> Self {
        let (l, r) = (left.type_name(), right.type_name());
        let message = if l == r {
            format!("attempt to compare two {} values", l)
        } else {
            format!("attempt to compare {} with {}", l, r)
        };
        Self::new(RuntimeErrorKind::Comparison, message)
    }

    pub fn index_on(value: &Value) -> Self {
        Self::new(
            RuntimeErrorKind::Index,
            format!("attempt to index a {} value", value.type_name()),
        )
    }

    pub fn length_of(value: &Value) -> Self {
        Self::new(
            RuntimeErrorKind::Arithmetic,
            format!("attempt to get length of a {} value", value.type_name()),
        )
    }

    /// Error for calling a non-callable value; `near` is the expression text
    pub fn call_on(value: &Value, near: Option<&str>) -> Self {
        let message = match near {
            Some(name) => format!("attempt to call a {} value near '{}'", value.type_name(), name),
            None => format!("attempt to call a {} value", value.type_name()),
        };
        Self::new(RuntimeErrorKind::Call, message)
    }

    pub fn bad_argument(arg_num: usize, func_name: &str, expected: &str, got: &Value) -> Self {
        let got = if got.is_void() { "no value" } else { got.type_name() };
        Self::new(
            RuntimeErrorKind::BadArgument,
            format!(
                "bad argument #{} to '{}' ({} expected, got {})",
                arg_num, func_name, expected, got
            ),
        )
    }

    pub fn coroutine(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Coroutine, message)
    }

    pub fn stack_overflow() -> Self {
        Self::new(RuntimeErrorKind::StackOverflow, "stack overflow")
    }

    pub fn kind(&self) -> RuntimeErrorKind {
        self.kind
    }

    /// The undecorated message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The message with source location, once decorated
    pub fn decorated_message(&self) -> Option<&str> {
        self.decorated_message.as_deref()
    }

    /// Decorated message if present, raw message otherwise
    pub fn display_message(&self) -> &str {
        self.decorated_message.as_deref().unwrap_or(&self.message)
    }

    pub fn instruction_pointer(&self) -> Option<usize> {
        self.instruction_pointer
    }

    pub fn call_stack(&self) -> &[StackFrameInfo] {
        &self.call_stack
    }

    pub fn is_decorated(&self) -> bool {
        self.decorated_message.is_some() || self.instruction_pointer.is_some()
    }

    pub(crate) fn set_decoration(
        &mut self,
        decorated: Option<String>,
        ip: usize,
        call_stack: Vec<StackFrameInfo>,
    ) {
        self.decorated_message = decorated;
        self.instruction_pointer = Some(ip);
        self.call_stack = call_stack;
    }

    pub(crate) fn set_decorated_message(&mut self, message: String) {
        self.decorated_message = Some(message);
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_message())
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_messages() {
        let e = RuntimeError::arithmetic_on(&Value::Nil);
        assert_eq!(e.message(), "attempt to perform arithmetic on a nil value");

        let e = RuntimeError::call_on(&Value::Boolean(true), Some("foo"));
        assert_eq!(e.message(), "attempt to call a boolean value near 'foo'");

        let e = RuntimeError::bad_argument(2, "insert", "number", &Value::Void);
        assert_eq!(e.message(), "bad argument #2 to 'insert' (number expected, got no value)");

        let e = RuntimeError::compare(&Value::Number(1.0), &Value::Nil);
        assert_eq!(e.message(), "attempt to compare number with nil");
    }

    #[test]
    fn test_catchability() {
        assert!(ScriptError::runtime("boom").is_catchable());
        assert!(!ScriptError::internal("bad").is_catchable());
        assert!(!ScriptError::InstructionLimitExceeded.is_catchable());
    }

    #[test]
    fn test_display_prefers_decorated() {
        let mut e = RuntimeError::new(RuntimeErrorKind::Generic, "oops");
        assert_eq!(e.to_string(), "oops");
        e.set_decorated_message("chunk_0:(1,0-4): oops".to_string());
        assert_eq!(ScriptError::from(e).to_string(), "chunk_0:(1,0-4): oops");
    }
}
