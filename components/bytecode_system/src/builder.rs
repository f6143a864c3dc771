//! Bcode builder: mutable counterpart of [`Bcode`](crate::Bcode) used by
//! the compiler.
//!
//! Names must all be added before the first opcode is emitted; jump targets
//! are reserved with [`BcodeBuilder::add_target`] and patched once the
//! destination is known.

use core_types::varint::{append_varint, msb_lsb_swap, varint_len};
use core_types::{ExecError, ExecResult, Val};
use std::cell::RefCell;
use std::rc::Rc;

use crate::bcode::{Bcode, InlineLitTag, ARGS_CNT_MAX, MAX_INLINE_LIT_TAG, NAMES_CNT_MAX};
use crate::opcode::Opcode;

/// Absolute offset into a bcode's `ops` buffer.
pub type BcodeOff = u32;

/// Reference to a literal added with one of the `add_lit_*` methods.
///
/// Strings and numbers are inlined into the instruction stream; values that
/// cannot be inlined live in the literal table and are referenced by a
/// biased index.
#[derive(Debug, Clone, PartialEq)]
pub enum LitRef {
    /// Index into the literal table.
    Table(usize),
    /// Number inlined into `ops`.
    InlineNum(f64),
    /// String bytes inlined into `ops`.
    InlineStr(Vec<u8>),
}

/// Builder for a [`Bcode`].
#[derive(Debug)]
pub struct BcodeBuilder {
    ops: Vec<u8>,
    lit: Vec<Val>,
    names_cnt: u16,
    names_end: usize,
    /// Number of declared parameters; set by the compiler.
    pub args_cnt: u8,
    /// Whether the first name is the function name.
    pub func_name_present: bool,
    strict_mode: bool,
    filename: Option<Rc<str>>,
}

impl BcodeBuilder {
    /// Creates a builder for a bcode with the given mode and filename.
    pub fn new(strict_mode: bool, filename: Option<Rc<str>>) -> BcodeBuilder {
        BcodeBuilder {
            ops: Vec::new(),
            lit: Vec::new(),
            names_cnt: 0,
            names_end: 0,
            args_cnt: 0,
            func_name_present: false,
            strict_mode,
            filename,
        }
    }

    /// Whether this bcode compiles in strict mode.
    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// Switches the builder to strict mode (seen `'use strict'`).
    pub fn set_strict_mode(&mut self) {
        self.strict_mode = true;
    }

    /// Appends a name to the names section, keeping it ahead of any emitted
    /// opcodes. Fails when the names count would exceed the field width.
    pub fn add_name(&mut self, name: &[u8]) -> ExecResult<()> {
        if usize::from(self.names_cnt) + 1 > NAMES_CNT_MAX {
            return Err(ExecError::Syntax("too many variables".to_string()));
        }
        let mut entry = Vec::with_capacity(varint_len(name.len()) + name.len() + 1);
        append_varint(&mut entry, name.len());
        entry.extend_from_slice(name);
        entry.push(0);
        self.ops.splice(self.names_end..self.names_end, entry.iter().copied());
        self.names_end += entry.len();
        self.names_cnt += 1;
        Ok(())
    }

    /// Registers a parameter count, enforcing the one-byte arity limit.
    pub fn set_args_cnt(&mut self, n: usize) -> ExecResult<()> {
        if n > ARGS_CNT_MAX {
            return Err(ExecError::Syntax("too many arguments".to_string()));
        }
        self.args_cnt = n as u8;
        Ok(())
    }

    /// Emits a bare opcode.
    pub fn op(&mut self, op: Opcode) {
        self.ops.push(op as u8);
    }

    /// Appends a raw one-byte operand (call arity).
    pub fn add_u8(&mut self, b: u8) {
        self.ops.push(b);
    }

    /// Appends a varint operand.
    pub fn add_varint(&mut self, value: usize) {
        append_varint(&mut self.ops, value);
    }

    /// Whether `name` is already present in the names section.
    pub fn has_name(&self, name: &[u8]) -> bool {
        let mut pos = 0;
        for _ in 0..self.names_cnt {
            let (len, llen) = core_types::varint::read_varint(&self.ops[pos..]);
            let start = pos + llen;
            if &self.ops[start..start + len] == name {
                return true;
            }
            pos = start + len + 1;
        }
        false
    }

    /// The filename this bcode will carry.
    pub fn filename(&self) -> Option<Rc<str>> {
        self.filename.clone()
    }

    /// Adds a string literal; always inlined.
    pub fn add_lit_str(&mut self, bytes: &[u8]) -> LitRef {
        LitRef::InlineStr(bytes.to_vec())
    }

    /// Adds a number literal; always inlined.
    pub fn add_lit_num(&mut self, n: f64) -> LitRef {
        LitRef::InlineNum(n)
    }

    /// Adds a non-inlineable literal (function, regexp) to the table.
    pub fn add_lit_val(&mut self, v: Val) -> LitRef {
        let idx = self.lit.len();
        self.lit.push(v);
        LitRef::Table(idx)
    }

    /// Emits an opcode with a literal operand, encoding the literal either
    /// inline or as a biased table index.
    pub fn op_lit(&mut self, op: Opcode, lit: &LitRef) {
        self.op(op);
        match lit {
            LitRef::Table(idx) => {
                self.add_varint(idx + MAX_INLINE_LIT_TAG);
            }
            LitRef::InlineStr(bytes) => {
                self.add_varint(InlineLitTag::String as usize);
                self.add_varint(bytes.len());
                self.ops.extend_from_slice(bytes);
                self.ops.push(0);
            }
            LitRef::InlineNum(n) => {
                self.add_varint(InlineLitTag::Number as usize);
                self.ops.extend_from_slice(&Val::number(*n).to_bits().to_le_bytes());
            }
        }
    }

    /// Shorthand for `op_lit(Opcode::PushLit, lit)`.
    pub fn push_lit(&mut self, lit: &LitRef) {
        self.op_lit(Opcode::PushLit, lit);
    }

    /// Pushes an inline function literal: the pre-serialized body of a
    /// nested function, embedded directly in `ops` (precompiling mode).
    pub fn push_inline_func(&mut self, body: &[u8]) {
        self.op(Opcode::PushLit);
        self.add_varint(InlineLitTag::Func as usize);
        self.ops.extend_from_slice(body);
    }

    /// Pushes an inline regexp literal: source and flags as
    /// varint-prefixed NUL-terminated strings (precompiling mode).
    pub fn push_inline_regexp(&mut self, source: &[u8], flags: &[u8]) {
        self.op(Opcode::PushLit);
        self.add_varint(InlineLitTag::Regexp as usize);
        self.add_varint(source.len());
        self.ops.extend_from_slice(source);
        self.ops.push(0);
        self.add_varint(flags.len());
        self.ops.extend_from_slice(flags);
        self.ops.push(0);
    }

    /// Current write position.
    pub fn pos(&self) -> BcodeOff {
        self.ops.len() as BcodeOff
    }

    /// Reserves a 32-bit jump target slot, returning its position for
    /// [`BcodeBuilder::patch_target`].
    pub fn add_target(&mut self) -> BcodeOff {
        let label = self.pos();
        self.ops.extend_from_slice(&[0; 4]);
        label
    }

    /// Emits an opcode followed by a reserved target slot.
    pub fn op_target(&mut self, op: Opcode) -> BcodeOff {
        self.op(op);
        self.add_target()
    }

    /// Patches a previously reserved target slot with an absolute offset.
    pub fn patch_target(&mut self, label: BcodeOff, target: BcodeOff) {
        let label = label as usize;
        self.ops[label..label + 4].copy_from_slice(&target.to_le_bytes());
    }

    /// Appends a line-number record: the varint of `(line_no << 1) | 1`
    /// with its first byte MSB/LSB-swapped, so the VM sees a byte with the
    /// top bit set and knows it is not an instruction.
    pub fn append_lineno(&mut self, line_no: u32) {
        let offset = self.ops.len();
        append_varint(&mut self.ops, ((line_no as usize) << 1) | 1);
        self.ops[offset] = msb_lsb_swap(self.ops[offset]);
        debug_assert!(self.ops[offset] & 0x80 != 0);
    }

    /// Finishes the build and produces an immutable [`Bcode`].
    pub fn finalize(self) -> Bcode {
        Bcode {
            ops: self.ops,
            lit: RefCell::new(self.lit),
            names_cnt: self.names_cnt,
            args_cnt: self.args_cnt,
            strict_mode: self.strict_mode,
            frozen: false,
            ops_in_rom: false,
            deserialized: false,
            func_name_present: self.func_name_present,
            filename: self.filename,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::varint::read_varint;

    #[test]
    fn test_names_precede_opcodes() {
        let mut bb = BcodeBuilder::new(false, None);
        bb.op(Opcode::PushZero);
        bb.add_name(b"a").unwrap();
        bb.add_name(b"b").unwrap();
        let b = bb.finalize();
        let names: Vec<&[u8]> = b.names().collect();
        assert_eq!(names, vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(b.ops[b.end_names()], Opcode::PushZero as u8);
    }

    #[test]
    fn test_inline_string_lit() {
        let mut bb = BcodeBuilder::new(false, None);
        let lit = bb.add_lit_str(b"abcdef");
        bb.push_lit(&lit);
        let b = bb.finalize();
        assert_eq!(b.ops[0], Opcode::PushLit as u8);
        let (tag, used) = read_varint(&b.ops[1..]);
        assert_eq!(tag, InlineLitTag::String as usize);
        let (len, used2) = read_varint(&b.ops[1 + used..]);
        assert_eq!(len, 6);
        let start = 1 + used + used2;
        assert_eq!(&b.ops[start..start + 6], b"abcdef");
        assert_eq!(b.ops[start + 6], 0);
    }

    #[test]
    fn test_inline_number_lit() {
        let mut bb = BcodeBuilder::new(false, None);
        let lit = bb.add_lit_num(6.5);
        bb.push_lit(&lit);
        let b = bb.finalize();
        let (tag, used) = read_varint(&b.ops[1..]);
        assert_eq!(tag, InlineLitTag::Number as usize);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&b.ops[1 + used..9 + used]);
        assert_eq!(Val::from_bits(u64::from_le_bytes(raw)).as_f64(), 6.5);
    }

    #[test]
    fn test_table_lit_is_biased() {
        let mut bb = BcodeBuilder::new(false, None);
        let lit = bb.add_lit_val(Val::function(3));
        bb.push_lit(&lit);
        let b = bb.finalize();
        let (idx, _) = read_varint(&b.ops[1..]);
        assert_eq!(idx, MAX_INLINE_LIT_TAG);
        assert_eq!(b.lit.borrow()[0], Val::function(3));
    }

    #[test]
    fn test_target_patching() {
        let mut bb = BcodeBuilder::new(false, None);
        let label = bb.op_target(Opcode::Jmp);
        bb.op(Opcode::PushOne);
        let target = bb.pos();
        bb.patch_target(label, target);
        let b = bb.finalize();
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&b.ops[1..5]);
        assert_eq!(u32::from_le_bytes(raw), 6);
    }

    #[test]
    fn test_lineno_record_has_high_bit() {
        let mut bb = BcodeBuilder::new(false, None);
        bb.append_lineno(12);
        let b = bb.finalize();
        assert!(b.ops[0] & 0x80 != 0);
        // Undo the swap and decode: value is (12 << 1) | 1.
        let mut buf = b.ops.clone();
        buf[0] = msb_lsb_swap(buf[0]);
        let (value, _) = read_varint(&buf);
        assert_eq!(value >> 1, 12);
    }

    #[test]
    fn test_args_cnt_limit() {
        let mut bb = BcodeBuilder::new(false, None);
        assert!(bb.set_args_cnt(255).is_ok());
        assert!(bb.set_args_cnt(256).is_err());
    }
}
