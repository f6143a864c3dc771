//! Core value types for the Kestrel JavaScript engine.
//!
//! This crate provides the foundational types the rest of the engine builds
//! on: the NaN-boxed value word, the varint codec shared by the AST, string
//! heap and bytecode layers, error kinds, and source positions.
//!
//! # Overview
//!
//! - [`Val`] - 64-bit NaN-boxed JavaScript value
//! - [`ValKind`] - decoded tag/payload view of a `Val`
//! - [`ExecError`] / [`ErrorKind`] - host-boundary and JS-object error kinds
//! - [`SourcePosition`] - source location for diagnostics
//! - [`varint`] - length encoding used across binary formats

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod error;
mod source;
mod value;
pub mod varint;

pub use error::{ErrorKind, ExecError, ExecResult};
pub use source::SourcePosition;
pub use value::{Handle, Val, ValKind};
