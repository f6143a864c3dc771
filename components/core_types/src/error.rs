//! Error kinds shared across the engine.
//!
//! Two layers live here: the host-boundary [`ExecError`] (what an embedder
//! sees from `exec`/`apply`) and the [`ErrorKind`] discriminant used when
//! constructing JavaScript error objects.

use thiserror::Error;

/// Kinds of JavaScript error objects the engine can construct.
///
/// These correspond to the built-in error constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Syntax error in JavaScript code.
    SyntaxError,
    /// Type error (e.g. calling a non-function).
    TypeError,
    /// Reference to an undefined variable.
    ReferenceError,
    /// Value out of allowed range.
    RangeError,
    /// Error in eval().
    EvalError,
    /// Internal engine error; must not be catchable by user code.
    InternalError,
    /// Plain `Error`.
    Error,
}

impl ErrorKind {
    /// Constructor name of the corresponding JavaScript error object.
    pub fn ctor_name(self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::EvalError => "EvalError",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::Error => "Error",
        }
    }
}

/// Host-boundary execution error.
///
/// `exec` and friends return `Result<Val, ExecError>`; success is the
/// fourth outcome. An `Exception` result leaves the thrown value in
/// the engine, retrievable with `get_thrown_value()`.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The source failed to parse, or the AST exceeded the skip width.
    /// The message includes file, line, column and a caret-annotated line.
    #[error("{0}")]
    Syntax(String),
    /// A thrown JavaScript value escaped the bottom call frame.
    #[error("exception thrown")]
    Exception,
    /// Assert-class failure; not catchable by user code.
    #[error("internal error: {0}")]
    Internal(String),
    /// The host requested interruption between instructions.
    #[error("execution interrupted")]
    Interrupted,
}

/// Result alias for fallible engine operations.
pub type ExecResult<T> = Result<T, ExecError>;
