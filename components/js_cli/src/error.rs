//! Error types for the CLI.

use core_types::ExecError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Parse or execution failure inside the engine.
    #[error("{0}")]
    Engine(#[from] ExecError),

    /// A JavaScript value was thrown and not caught; the rendered value
    /// is carried here.
    #[error("uncaught exception: {0}")]
    Uncaught(String),

    /// File I/O failure.
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;
