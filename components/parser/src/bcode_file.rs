//! Binary bcode streams.
//!
//! A stream is the `V\x07BCODE:` signature followed by the root function:
//! varint `args_cnt`, varint `names_cnt`, varint `func_name_present`,
//! varint `ops_len`, then the ops bytes. Every literal is inlined into
//! `ops` (the compiler's precompiling mode guarantees this), so the
//! standalone literal table is always empty on disk; nested functions
//! appear recursively behind the inline-function literal tag.

use std::cell::RefCell;
use std::rc::Rc;

use bytecode_system::{Bcode, BCODE_SIGNATURE};
use core_types::varint::{append_varint, read_varint};
use core_types::{ExecError, ExecResult};

/// Serializes a bcode stream with its signature. The bcode must have
/// been compiled in precompiling mode, i.e. with an empty literal table.
pub fn serialize_bcode(bcode: &Bcode) -> ExecResult<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(BCODE_SIGNATURE);
    write_func(&mut out, bcode)?;
    Ok(out)
}

/// Serializes one function body without the stream signature; used for
/// the root and, via the compiler, for nested inline function literals.
pub fn write_func(out: &mut Vec<u8>, bcode: &Bcode) -> ExecResult<()> {
    if !bcode.lit.borrow().is_empty() {
        return Err(ExecError::Internal(
            "cannot serialize bcode with non-inlined literals".to_string(),
        ));
    }
    append_varint(out, bcode.args_cnt as usize);
    append_varint(out, bcode.names_cnt as usize);
    append_varint(out, usize::from(bcode.func_name_present));
    append_varint(out, bcode.ops.len());
    out.extend_from_slice(&bcode.ops);
    Ok(())
}

/// Serializes one function body into a fresh buffer.
pub fn func_bytes(bcode: &Bcode) -> ExecResult<Vec<u8>> {
    let mut out = Vec::new();
    write_func(&mut out, bcode)?;
    Ok(out)
}

/// Deserializes a bcode stream (signature included).
pub fn deserialize_bcode(data: &[u8], filename: Option<Rc<str>>) -> ExecResult<Bcode> {
    let body = data.strip_prefix(BCODE_SIGNATURE).ok_or_else(|| {
        ExecError::Syntax("bad bcode signature".to_string())
    })?;
    let mut pos = 0;
    read_func(body, &mut pos, false, filename)
}

/// Reads one serialized function at `pos`, advancing past it. Strictness
/// and filename are inherited from the enclosing bcode, as the on-disk
/// form does not carry them.
pub fn read_func(
    data: &[u8],
    pos: &mut usize,
    strict_mode: bool,
    filename: Option<Rc<str>>,
) -> ExecResult<Bcode> {
    let overrun = || ExecError::Syntax("truncated bcode stream".to_string());
    if *pos >= data.len() {
        return Err(overrun());
    }
    let (args_cnt, n) = read_varint(&data[*pos..]);
    *pos += n;
    let (names_cnt, n) = read_varint(&data[*pos..]);
    *pos += n;
    let (func_name_present, n) = read_varint(&data[*pos..]);
    *pos += n;
    let (ops_len, n) = read_varint(&data[*pos..]);
    *pos += n;
    if *pos + ops_len > data.len() {
        return Err(overrun());
    }
    let ops = data[*pos..*pos + ops_len].to_vec();
    *pos += ops_len;

    Ok(Bcode {
        ops,
        lit: RefCell::new(Vec::new()),
        names_cnt: names_cnt as u16,
        args_cnt: args_cnt as u8,
        strict_mode,
        frozen: false,
        ops_in_rom: false,
        deserialized: true,
        func_name_present: func_name_present != 0,
        filename,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode_gen::compile_script;
    use crate::parser::Parser;
    use memory_manager::{Heap, HeapOptions};

    fn compiled(src: &str, precompile: bool) -> Rc<Bcode> {
        let ast = Parser::new(src).unwrap().parse().unwrap();
        let mut heap = Heap::new(HeapOptions::default());
        compile_script(&ast, &mut heap, None, precompile).unwrap()
    }

    #[test]
    fn test_roundtrip_simple_script() {
        let b = compiled("1 + 2 * 3;", true);
        let bytes = serialize_bcode(&b).unwrap();
        assert!(bytes.starts_with(BCODE_SIGNATURE));
        let back = deserialize_bcode(&bytes, None).unwrap();
        assert_eq!(back.ops, b.ops);
        assert_eq!(back.names_cnt, b.names_cnt);
        assert_eq!(back.args_cnt, b.args_cnt);
        assert!(back.deserialized);
        assert!(back.lit.borrow().is_empty());
    }

    #[test]
    fn test_nested_functions_are_inlined() {
        let b = compiled("function f(x) { return x + 1; } var a = 2;", true);
        assert!(b.lit.borrow().is_empty(), "precompiled bcode has no table lits");
        let bytes = serialize_bcode(&b).unwrap();
        let back = deserialize_bcode(&bytes, None).unwrap();
        assert_eq!(back.ops, b.ops);
    }

    #[test]
    fn test_runtime_compiled_bcode_refuses_to_serialize() {
        let b = compiled("function f() {}", false);
        assert!(!b.lit.borrow().is_empty());
        assert!(serialize_bcode(&b).is_err());
    }

    #[test]
    fn test_bad_signature_rejected() {
        assert!(deserialize_bcode(b"not bcode", None).is_err());
    }
}
