//! The Kestrel virtual machine and engine API.
//!
//! - [`Engine`] - an engine instance: heap, data stack, call frames, and
//!   the embedder API (`exec`, `apply`, `parse_json`, `own`, ...)
//! - [`CallFrame`] - private/bcode/cfunc call frames
//! - conversions - ES5 ToPrimitive/ToNumber/ToString, equality, `typeof`
//!
//! The evaluator treats `throw`, `return`, `break` and `continue` as one
//! unwinding mechanism over per-frame try-stacks of packed integers.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod call_frame;
mod conversion;
mod dispatch;
mod engine;
mod exceptions;

pub use call_frame::{BlockTag, CallFrame};
pub use conversion::{number_to_string, str_to_number, PrimitiveHint};
pub use engine::{CFunc, Engine, EngineOptions, ExecOpts};
