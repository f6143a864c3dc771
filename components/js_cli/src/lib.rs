//! Command-line driver for the Kestrel engine.
//!
//! The binary is `kestrel-js`; this library exposes the pieces so the
//! integration tests can drive them without spawning a process.

#![warn(clippy::all)]
#![deny(unsafe_code)]

mod cli;
mod error;
mod runtime;

pub use cli::Cli;
pub use error::{CliError, CliResult};
pub use runtime::{OutputMode, Runtime};
