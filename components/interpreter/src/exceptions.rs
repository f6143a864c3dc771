//! JavaScript error objects and stack traces.
//!
//! Error constructors build a plain object carrying `name` and `message`,
//! plus a `stack` string assembled from the live call-frame chain when
//! filename and line data are available.

use core_types::{ErrorKind, ExecError, Val};
use memory_manager::{StringError, ATTR_NON_ENUMERABLE};

use crate::call_frame::FRAME_BCODE;
use crate::engine::Engine;

impl Engine {
    /// Builds an error object of the given kind without throwing it.
    pub fn mk_error_object(&mut self, kind: ErrorKind, message: &str) -> Val {
        let obj = self.heap.mk_object(Val::NULL);
        let name_key = self.mk_string("name");
        let name_val = self.mk_string(kind.ctor_name());
        self.heap.def_prop(obj, name_key, 0, name_val);
        let msg_key = self.mk_string("message");
        let msg_val = self.mk_string(message);
        self.heap.def_prop(obj, msg_key, 0, msg_val);
        if let Some(stack) = self.stack_trace_string() {
            let stack_key = self.mk_string("stack");
            let stack_val = self.mk_string(&stack);
            self.heap
                .def_prop(obj, stack_key, ATTR_NON_ENUMERABLE, stack_val);
        }
        obj
    }

    /// Builds and throws an error object; returns the error for use with
    /// `return Err(...)`.
    pub fn throw_error(&mut self, kind: ErrorKind, message: &str) -> ExecError {
        if kind == ErrorKind::InternalError {
            // Internal errors must not be catchable by user code.
            return ExecError::Internal(message.to_string());
        }
        let obj = self.mk_error_object(kind, message);
        self.throw(obj)
    }

    /// Formats a message and throws, mirroring the printf-style helper of
    /// the original API.
    pub fn throwf(&mut self, kind: ErrorKind, message: String) -> ExecError {
        self.throw_error(kind, &message)
    }

    pub(crate) fn stale_string(&self, e: StringError) -> ExecError {
        ExecError::Internal(format!("string dereference failed: {:?}", e))
    }

    /// Walks the call-frame chain newest to oldest and renders one line
    /// per frame. Returns `None` when no frame has position data.
    pub fn stack_trace_string(&self) -> Option<String> {
        let mut lines: Vec<String> = Vec::new();
        for frame in self.frames.iter().rev() {
            if frame.type_mask & FRAME_BCODE != 0 {
                let bcode = frame.bcode.as_ref()?;
                let file: &str = bcode.filename.as_deref().unwrap_or("<anonymous>");
                let func_name = if bcode.func_name_present {
                    bcode
                        .names()
                        .next()
                        .filter(|n| !n.is_empty())
                        .map(|n| String::from_utf8_lossy(n).into_owned())
                } else {
                    None
                };
                match func_name {
                    Some(name) => {
                        lines.push(format!("  at {} ({}:{})", name, file, frame.line_no))
                    }
                    None => lines.push(format!("  at {}:{}", file, frame.line_no)),
                }
            } else if let Some(idx) = frame.cfunc {
                lines.push(format!("  at cfunc_{}", idx));
            }
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_object_shape() {
        let mut e = Engine::new();
        let obj = e.mk_error_object(ErrorKind::TypeError, "x is not a function");
        let name_key = e.mk_string("name");
        let name = match e.heap.get_prop(obj, name_key) {
            memory_manager::GetResult::Value(v) => v,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(e.string_bytes(name).unwrap(), b"TypeError");
        let msg_key = e.mk_string("message");
        let msg = match e.heap.get_prop(obj, msg_key) {
            memory_manager::GetResult::Value(v) => v,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(e.string_bytes(msg).unwrap(), b"x is not a function");
    }

    #[test]
    fn test_internal_errors_are_not_catchable() {
        let mut e = Engine::new();
        let err = e.throw_error(ErrorKind::InternalError, "arena corrupt");
        assert!(matches!(err, ExecError::Internal(_)));
        assert!(e.get_thrown_value().is_none());
    }
}
