//! Bytecode format for the Kestrel VM.
//!
//! - [`Opcode`] - single-byte stack-machine instructions
//! - [`Bcode`] - compiled function/script: names section, ops, literals
//! - [`BcodeBuilder`] - emission API used by the compiler
//!
//! Binary serialization of bcode lives in the `parser` crate, next to the
//! compiler, because inlining literals requires heap access.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bcode;
pub mod builder;
pub mod opcode;

pub use bcode::{Bcode, InlineLitTag, BCODE_SIGNATURE, MAX_INLINE_LIT_TAG};
pub use builder::{BcodeBuilder, BcodeOff, LitRef};
pub use opcode::{Opcode, OP_LINE_NO, OP_MAX};
