//! ECMAScript type conversions and equality.
//!
//! Abstract equality follows ES5 table 11.9.3 directly. Number-to-string
//! uses shortest-round-trip digits (ryu) reformatted per the 9.8.1 rules:
//! plain decimal for decimal exponents in (-7, 21), exponent notation
//! outside.

use core_types::{ErrorKind, ExecResult, Val, ValKind};
use memory_manager::GetResult;

use crate::engine::Engine;

/// Hint for object-to-primitive conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveHint {
    /// Prefer `valueOf`.
    Number,
    /// Prefer `toString`.
    String,
    /// No preference; numbers win (there are no Date objects in the
    /// core, so the Date special case never applies).
    Auto,
}

impl Engine {
    /// ES5 ToBoolean.
    pub fn to_boolean(&self, v: Val) -> bool {
        match v.kind() {
            ValKind::Undefined | ValKind::Null => false,
            ValKind::Bool(b) => b,
            ValKind::Nan => false,
            ValKind::Number(n) => n != 0.0,
            _ if v.is_string() => self.heap.strings.str_len(v).map(|l| l != 0).unwrap_or(false),
            _ => true,
        }
    }

    /// ES5 ToNumber.
    pub fn to_number(&mut self, v: Val) -> ExecResult<f64> {
        match v.kind() {
            ValKind::Number(n) => Ok(n),
            ValKind::Nan => Ok(f64::NAN),
            ValKind::Undefined => Ok(f64::NAN),
            ValKind::Null => Ok(0.0),
            ValKind::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
            _ if v.is_string() => {
                let bytes = self
                    .heap
                    .strings
                    .get(v)
                    .map_err(|e| self.stale_string(e))?
                    .bytes()
                    .to_vec();
                Ok(str_to_number(&bytes))
            }
            _ => {
                let p = self.to_primitive(v, PrimitiveHint::Number)?;
                if p.is_primitive() {
                    self.to_number(p)
                } else {
                    Ok(f64::NAN)
                }
            }
        }
    }

    /// ES5 ToString, producing a string value.
    pub fn to_string_val(&mut self, v: Val) -> ExecResult<Val> {
        match v.kind() {
            ValKind::Undefined => Ok(self.mk_string("undefined")),
            ValKind::Null => Ok(self.mk_string("null")),
            ValKind::Bool(b) => Ok(self.mk_string(if b { "true" } else { "false" })),
            ValKind::Nan => Ok(self.mk_string("NaN")),
            ValKind::Number(n) => {
                let s = number_to_string(n);
                Ok(self.mk_string(&s))
            }
            _ if v.is_string() => Ok(v),
            _ => {
                let p = self.to_primitive(v, PrimitiveHint::String)?;
                if p.is_primitive() {
                    self.to_string_val(p)
                } else {
                    Err(self.throw_error(ErrorKind::TypeError, "cannot convert to string"))
                }
            }
        }
    }

    /// ES5 ToPrimitive with `valueOf`/`toString` dispatch.
    ///
    /// Without the standard library, plain objects have neither method;
    /// the fallbacks mirror what `Object.prototype.toString` and
    /// `Array.prototype.join` would produce, so that concatenation and
    /// comparison behave as embedders expect.
    pub fn to_primitive(&mut self, v: Val, hint: PrimitiveHint) -> ExecResult<Val> {
        if v.is_primitive() {
            return Ok(v);
        }
        let order: [&[u8]; 2] = match hint {
            PrimitiveHint::String => [b"toString", b"valueOf"],
            PrimitiveHint::Number | PrimitiveHint::Auto => [b"valueOf", b"toString"],
        };
        for name in order {
            let name_val = self.heap.strings.mk_string(name);
            if let GetResult::Value(f) = self.heap.get_prop(v, name_val) {
                if f.is_callable() {
                    let r = self.apply(f, v, &[])?;
                    if r.is_primitive() {
                        return Ok(r);
                    }
                }
            }
        }
        if self.heap.is_array(v) {
            return self.array_join_fallback(v);
        }
        if v.is_function() || v.is_cfunction() {
            return Ok(self.mk_string("[function]"));
        }
        Ok(self.mk_string("[object Object]"))
    }

    fn array_join_fallback(&mut self, arr: Val) -> ExecResult<Val> {
        let len = self.heap.array_length(arr);
        let mut out: Vec<u8> = Vec::new();
        for i in 0..len {
            if i > 0 {
                out.push(b',');
            }
            let elem = self.heap.array_get(arr, i);
            if elem.is_undefined() || elem.is_null() {
                continue;
            }
            let s = self.to_string_val(elem)?;
            let bytes = self
                .heap
                .strings
                .get(s)
                .map_err(|e| self.stale_string(e))?
                .bytes()
                .to_vec();
            out.extend_from_slice(&bytes);
        }
        let v = self.heap.strings.mk_string(&out);
        Ok(v)
    }

    /// ES5 ToInt32.
    pub fn to_int32(&mut self, v: Val) -> ExecResult<i32> {
        Ok(self.to_uint32(v)? as i32)
    }

    /// ES5 ToUint32.
    pub fn to_uint32(&mut self, v: Val) -> ExecResult<u32> {
        let n = self.to_number(v)?;
        if !n.is_finite() || n == 0.0 {
            return Ok(0);
        }
        let t = n.trunc();
        Ok((t.rem_euclid(4294967296.0)) as u32)
    }

    /// Strict equality (`===`).
    pub fn strict_equals(&self, a: Val, b: Val) -> bool {
        if a.is_number() && b.is_number() {
            // NaN compares unequal to itself; +0 equals -0.
            return a.as_f64() == b.as_f64();
        }
        if a.is_string() && b.is_string() {
            return self.heap.strings.str_eq(a, b);
        }
        // Booleans, null, undefined and reference types compare by
        // representation.
        a == b
    }

    /// Abstract equality (`==`), per ES5 table 11.9.3.
    pub fn abstract_equals(&mut self, a: Val, b: Val) -> ExecResult<bool> {
        // 1. Same type.
        if same_abstract_type(a, b) {
            return Ok(self.strict_equals(a, b));
        }
        // 2-3. null == undefined.
        if (a.is_null() && b.is_undefined()) || (a.is_undefined() && b.is_null()) {
            return Ok(true);
        }
        // 4-5. number vs string.
        if a.is_number() && b.is_string() {
            let bn = self.to_number(b)?;
            return Ok(a.as_f64() == bn);
        }
        if a.is_string() && b.is_number() {
            let an = self.to_number(a)?;
            return Ok(an == b.as_f64());
        }
        // 6-7. booleans coerce to numbers.
        if a.is_boolean() {
            let an = Val::number(self.to_number(a)?);
            return self.abstract_equals(an, b);
        }
        if b.is_boolean() {
            let bn = Val::number(self.to_number(b)?);
            return self.abstract_equals(a, bn);
        }
        // 8-9. number or string vs object.
        let a_numstr = a.is_number() || a.is_string();
        let b_obj = !b.is_primitive();
        if a_numstr && b_obj {
            let bp = self.to_primitive(b, PrimitiveHint::Auto)?;
            return self.abstract_equals(a, bp);
        }
        let b_numstr = b.is_number() || b.is_string();
        let a_obj = !a.is_primitive();
        if b_numstr && a_obj {
            let ap = self.to_primitive(a, PrimitiveHint::Auto)?;
            return self.abstract_equals(ap, b);
        }
        Ok(false)
    }

    /// `typeof` result string.
    pub fn typeof_str(&self, v: Val) -> &'static str {
        match v.kind() {
            ValKind::Undefined => "undefined",
            ValKind::Null => "object",
            ValKind::Bool(_) => "boolean",
            ValKind::Number(_) | ValKind::Nan => "number",
            ValKind::Function(_) | ValKind::CFunction(_) => "function",
            _ if v.is_string() => "string",
            _ => "object",
        }
    }
}

fn same_abstract_type(a: Val, b: Val) -> bool {
    (a.is_number() && b.is_number())
        || (a.is_string() && b.is_string())
        || (a.is_boolean() && b.is_boolean())
        || (a.is_null() && b.is_null())
        || (a.is_undefined() && b.is_undefined())
        || (!a.is_primitive() && !b.is_primitive())
}

/// ES5 9.8.1 number-to-string.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let neg = n < 0.0;
    let mut buf = ryu::Buffer::new();
    let shortest = buf.format(n.abs());

    // Decompose the shortest representation into a digit string and a
    // decimal exponent: value = 0.<digits> * 10^exp.
    let (mantissa, e_part) = match shortest.split_once(['e', 'E']) {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (shortest, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    let mut digits: Vec<u8> = Vec::with_capacity(int_part.len() + frac_part.len());
    digits.extend_from_slice(int_part.as_bytes());
    digits.extend_from_slice(frac_part.as_bytes());
    let mut exp = int_part.len() as i32 + e_part;
    while digits.first() == Some(&b'0') {
        digits.remove(0);
        exp -= 1;
    }
    while digits.last() == Some(&b'0') {
        digits.pop();
    }
    let k = digits.len() as i32;
    let digits = String::from_utf8(digits).expect("ascii digits");

    let body = if k <= exp && exp <= 21 {
        let mut s = digits;
        for _ in 0..(exp - k) {
            s.push('0');
        }
        s
    } else if 0 < exp && exp <= 21 {
        format!("{}.{}", &digits[..exp as usize], &digits[exp as usize..])
    } else if -6 < exp && exp <= 0 {
        let mut s = String::from("0.");
        for _ in 0..(-exp) {
            s.push('0');
        }
        s.push_str(&digits);
        s
    } else {
        let e = exp - 1;
        let mantissa = if digits.len() == 1 {
            digits
        } else {
            format!("{}.{}", &digits[..1], &digits[1..])
        };
        format!("{}e{}{}", mantissa, if e >= 0 { "+" } else { "-" }, e.abs())
    };
    if neg {
        format!("-{}", body)
    } else {
        body
    }
}

/// ES5 ToNumber for string input.
pub fn str_to_number(bytes: &[u8]) -> f64 {
    let s = match std::str::from_utf8(bytes) {
        Ok(s) => s.trim(),
        Err(_) => return f64::NAN,
    };
    if s.is_empty() {
        return 0.0;
    }
    let (sign, body) = match s.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, s.strip_prefix('+').unwrap_or(s)),
    };
    if body == "Infinity" {
        return sign * f64::INFINITY;
    }
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        return match u64::from_str_radix(hex, 16) {
            Ok(v) => sign * v as f64,
            Err(_) => f64::NAN,
        };
    }
    // Rust's parser accepts forms ECMAScript does not ("inf", "nan").
    if body.bytes().any(|b| b.is_ascii_alphabetic() && !matches!(b, b'e' | b'E')) {
        return f64::NAN;
    }
    body.parse::<f64>().map(|v| sign * v).unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_to_string_basic() {
        assert_eq!(number_to_string(0.0), "0");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1.0), "1");
        assert_eq!(number_to_string(-1.5), "-1.5");
        assert_eq!(number_to_string(123.456), "123.456");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_number_to_string_boundaries() {
        assert_eq!(number_to_string(2f64.powi(53)), "9007199254740992");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(1e20), "100000000000000000000");
        assert_eq!(number_to_string(1e-6), "0.000001");
        assert_eq!(number_to_string(1e-7), "1e-7");
        assert_eq!(number_to_string(1.2345e-7), "1.2345e-7");
        assert_eq!(number_to_string(5e-324), "5e-324");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(150.0), "150");
    }

    #[test]
    fn test_str_to_number() {
        assert_eq!(str_to_number(b""), 0.0);
        assert_eq!(str_to_number(b"  42  "), 42.0);
        assert_eq!(str_to_number(b"-1.5e2"), -150.0);
        assert_eq!(str_to_number(b"0x20"), 32.0);
        assert_eq!(str_to_number(b"Infinity"), f64::INFINITY);
        assert_eq!(str_to_number(b"-Infinity"), f64::NEG_INFINITY);
        assert!(str_to_number(b"12abc").is_nan());
        assert!(str_to_number(b"inf").is_nan());
        assert!(str_to_number(b"nan").is_nan());
    }

    #[test]
    fn test_strict_equals() {
        let e = Engine::new();
        assert!(e.strict_equals(Val::number(1.0), Val::number(1.0)));
        assert!(!e.strict_equals(Val::NAN, Val::NAN));
        assert!(e.strict_equals(Val::number(0.0), Val::number(-0.0)));
        assert!(!e.strict_equals(Val::number(1.0), Val::TRUE));
        assert!(e.strict_equals(Val::NULL, Val::NULL));
        assert!(!e.strict_equals(Val::NULL, Val::UNDEFINED));
    }

    #[test]
    fn test_abstract_equals_table() {
        let mut e = Engine::new();
        // null == undefined
        assert!(e.abstract_equals(Val::NULL, Val::UNDEFINED).unwrap());
        // number == string
        let s5 = e.mk_string("5");
        assert!(e.abstract_equals(Val::number(5.0), s5).unwrap());
        // boolean coercion
        let s1 = e.mk_string("1");
        assert!(e.abstract_equals(Val::TRUE, s1).unwrap());
        // NaN never equals
        assert!(!e.abstract_equals(Val::NAN, Val::NAN).unwrap());
        // null does not equal 0
        assert!(!e.abstract_equals(Val::NULL, Val::ZERO).unwrap());
    }

    #[test]
    fn test_to_boolean() {
        let mut e = Engine::new();
        assert!(!e.to_boolean(Val::UNDEFINED));
        assert!(!e.to_boolean(Val::NULL));
        assert!(!e.to_boolean(Val::ZERO));
        assert!(!e.to_boolean(Val::NAN));
        let empty = e.mk_string("");
        assert!(!e.to_boolean(empty));
        let s = e.mk_string("x");
        assert!(e.to_boolean(s));
        let obj = e.mk_object();
        assert!(e.to_boolean(obj));
    }
}
