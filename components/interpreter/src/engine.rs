//! The engine: heap, VM state, and the embedder-facing API.
//!
//! All of the state the original kept in globals (GC roots, thrown-error
//! state, the opcode history ring) lives here and is threaded explicitly
//! through every entry point.

use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrayvec::ArrayVec;
use bytecode_system::{Bcode, BcodeBuilder, Opcode};
use core_types::{ErrorKind, ExecError, ExecResult, Val};
use memory_manager::{Heap, HeapOptions, HeapStat, OwnedRef, ATTR_NON_ENUMERABLE};
use parser::{bcode_file, compile_json_expr, compile_script, Ast, Parser};

use crate::call_frame::CallFrame;

/// Signature of a native function. Arguments are reached through
/// [`Engine::arg`]/[`Engine::argc`]; the returned value is pushed as the
/// call result.
pub type CFunc = fn(&mut Engine) -> ExecResult<Val>;

/// Engine construction options.
#[derive(Debug, Default, Clone)]
pub struct EngineOptions {
    /// Initial arena sizes.
    pub heap: HeapOptions,
    /// Heap-snapshot output path. Accepted for compatibility; snapshot
    /// support is not compiled into this build.
    pub freeze_file: Option<String>,
}

/// Options for [`Engine::exec_opt`].
#[derive(Debug, Default, Clone)]
pub struct ExecOpts {
    /// Filename used in diagnostics and stack traces.
    pub filename: Option<String>,
    /// `this` for the top-level code; the global object when unset.
    pub this_obj: Option<Val>,
    /// Treat the input as JSON text.
    pub is_json: bool,
}

/// Engine-wide value slots; every slot is a GC root.
#[derive(Debug)]
pub(crate) struct EngineVals {
    pub global_object: Val,
    pub thrown_error: Val,
    pub returned_value: Val,
    pub stash: Val,
    /// Best-effort callee name context for `TypeError` messages: the
    /// last variable or property name pushed before a call.
    pub last_name: [Val; 2],
}

/// An embeddable ECMAScript-5 engine instance.
pub struct Engine {
    /// Arenas, strings and root lists.
    pub heap: Heap,
    pub(crate) stack: Vec<Val>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) bottom_frame: usize,
    pub(crate) cfuncs: Vec<CFunc>,
    pub(crate) vals: EngineVals,
    pub(crate) is_thrown: bool,
    pub(crate) is_returned: bool,
    pub(crate) is_breaking: bool,
    pub(crate) is_continuing: bool,
    pub(crate) is_stashed: bool,
    /// Message deferred by `CHECK_CALL` until the arguments have been
    /// evaluated, as the standard requires.
    pub(crate) pending_call_error: Option<String>,
    /// Ring of recent non-call opcodes, for call-error context.
    pub(crate) last_ops: ArrayVec<Opcode, 4>,
    /// Bcodes pinned by in-flight evaluations (GC root R3).
    pub(crate) active_bcodes: Vec<Rc<Bcode>>,
    /// Arguments of the current native call.
    pub(crate) cfunc_args: Val,
    interrupted: Arc<AtomicBool>,
    pub(crate) stack_high_water: usize,
    pub(crate) frame_high_water: usize,
    freeze_file: Option<String>,
}

impl Engine {
    /// Creates an engine with default options.
    pub fn new() -> Engine {
        Engine::with_options(EngineOptions::default())
    }

    /// Creates an engine with explicit arena sizes.
    pub fn with_options(opts: EngineOptions) -> Engine {
        let mut heap = Heap::new(opts.heap);
        let function_prototype = heap.mk_object(Val::NULL);
        heap.function_prototype = function_prototype;
        let global = heap.mk_object(Val::NULL);

        let mut engine = Engine {
            heap,
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(16),
            bottom_frame: 0,
            cfuncs: Vec::new(),
            vals: EngineVals {
                global_object: global,
                thrown_error: Val::UNDEFINED,
                returned_value: Val::UNDEFINED,
                stash: Val::UNDEFINED,
                last_name: [Val::UNDEFINED, Val::UNDEFINED],
            },
            is_thrown: false,
            is_returned: false,
            is_breaking: false,
            is_continuing: false,
            is_stashed: false,
            pending_call_error: None,
            last_ops: ArrayVec::new(),
            active_bcodes: Vec::new(),
            cfunc_args: Val::UNDEFINED,
            interrupted: Arc::new(AtomicBool::new(false)),
            stack_high_water: 0,
            frame_high_water: 0,
            freeze_file: opts.freeze_file,
        };
        engine.init_globals();
        engine
    }

    fn init_globals(&mut self) {
        let global = self.vals.global_object;
        let nan = self.mk_string("NaN");
        self.heap
            .def_prop(global, nan, ATTR_NON_ENUMERABLE, Val::NAN);
        let inf = self.mk_string("Infinity");
        self.heap.def_prop(
            global,
            inf,
            ATTR_NON_ENUMERABLE,
            Val::number(f64::INFINITY),
        );
        let undef = self.mk_string("undefined");
        self.heap
            .def_prop(global, undef, ATTR_NON_ENUMERABLE, Val::UNDEFINED);

        // The JSON.parse contract of the core: delegates to the engine's
        // JSON-mode execution path.
        let json = self.heap.mk_object(Val::NULL);
        let parse = self.mk_cfunction(cfunc_json_parse);
        let parse_name = self.mk_string("parse");
        self.heap.def_prop(json, parse_name, 0, parse);
        let json_name = self.mk_string("JSON");
        self.heap.def_prop(global, json_name, ATTR_NON_ENUMERABLE, json);
    }

    /// The global object.
    pub fn global(&self) -> Val {
        self.vals.global_object
    }

    // ---- execution entry points ----

    /// Executes JavaScript source, a binary AST stream, or a binary bcode
    /// stream, selected by signature.
    pub fn exec(&mut self, src: &str) -> ExecResult<Val> {
        self.exec_bytes(src.as_bytes(), ExecOpts::default())
    }

    /// Executes with options.
    pub fn exec_opt(&mut self, src: &str, opts: ExecOpts) -> ExecResult<Val> {
        self.exec_bytes(src.as_bytes(), opts)
    }

    /// Parses a JSON text into a value.
    pub fn parse_json(&mut self, src: &str) -> ExecResult<Val> {
        self.exec_bytes(
            src.as_bytes(),
            ExecOpts {
                is_json: true,
                ..ExecOpts::default()
            },
        )
    }

    /// Executes a file's contents.
    pub fn exec_file(&mut self, path: &str) -> ExecResult<Val> {
        let data = std::fs::read(path)
            .map_err(|e| ExecError::Syntax(format!("cannot open [{}]: {}", path, e)))?;
        self.exec_bytes(
            &data,
            ExecOpts {
                filename: Some(path.to_string()),
                ..ExecOpts::default()
            },
        )
    }

    /// Parses a JSON file.
    pub fn parse_json_file(&mut self, path: &str) -> ExecResult<Val> {
        let data = std::fs::read(path)
            .map_err(|e| ExecError::Syntax(format!("cannot open [{}]: {}", path, e)))?;
        self.exec_bytes(
            &data,
            ExecOpts {
                filename: Some(path.to_string()),
                is_json: true,
                ..ExecOpts::default()
            },
        )
    }

    /// Executes raw input bytes: bcode stream, AST stream, or source.
    pub fn exec_bytes(&mut self, src: &[u8], opts: ExecOpts) -> ExecResult<Val> {
        if self.freeze_file.is_some() {
            return Err(ExecError::Internal(
                "freeze support is not compiled into this build".to_string(),
            ));
        }
        let filename_rc: Option<Rc<str>> = opts.filename.as_deref().map(Rc::from);

        let bcode = if src.starts_with(bytecode_system::BCODE_SIGNATURE) {
            Rc::new(bcode_file::deserialize_bcode(src, filename_rc)?)
        } else {
            let ast = if src.starts_with(parser::AST_SIGNATURE) {
                Ast::from_binary(src)
                    .ok_or_else(|| ExecError::Syntax("bad AST signature".to_string()))?
            } else {
                let text = std::str::from_utf8(src)
                    .map_err(|_| ExecError::Syntax("source is not valid UTF-8".to_string()))?;
                let p = Parser::new(text).map_err(|e| self.syntax_error(e, &opts, text))?;
                let parsed = if opts.is_json { p.parse_json() } else { p.parse() };
                parsed.map_err(|e| self.syntax_error(e, &opts, text))?
            };
            if opts.is_json {
                compile_json_expr(&ast, &mut self.heap, filename_rc)?
            } else {
                compile_script(&ast, &mut self.heap, filename_rc, false)?
            }
        };

        let this = opts.this_obj.unwrap_or(self.vals.global_object);
        self.active_bcodes.push(Rc::clone(&bcode));
        let res = self.eval_bcode(&bcode, this, true);
        self.active_bcodes.pop();
        res
    }

    fn syntax_error(&mut self, e: parser::ParseError, opts: &ExecOpts, src: &str) -> ExecError {
        let filename = opts.filename.as_deref().unwrap_or("<anonymous>");
        let msg = e.format(filename, src);
        // Leave a catchable SyntaxError object in the thrown slot too.
        let err_obj = self.mk_error_object(ErrorKind::SyntaxError, &msg);
        self.vals.thrown_error = err_obj;
        self.is_thrown = true;
        ExecError::Syntax(msg)
    }

    /// Calls a function value with an explicit `this` and arguments.
    pub fn apply(&mut self, func: Val, this: Val, args: &[Val]) -> ExecResult<Val> {
        // Wrapper bcode, as the original generates for apply: the
        // literals table roots the values for the duration of the call.
        let mut bb = BcodeBuilder::new(false, None);
        bb.op(Opcode::PushUndefined);
        let this_lit = bb.add_lit_val(this);
        bb.push_lit(&this_lit);
        let func_lit = bb.add_lit_val(func);
        bb.push_lit(&func_lit);
        bb.op(Opcode::CheckCall);
        for a in args {
            let lit = bb.add_lit_val(*a);
            bb.push_lit(&lit);
        }
        if args.len() > 255 {
            return Err(ExecError::Syntax("too many arguments".to_string()));
        }
        bb.op(Opcode::Call);
        bb.add_u8(args.len() as u8);
        bb.op(Opcode::SwapDrop);
        let bcode = Rc::new(bb.finalize());
        self.active_bcodes.push(Rc::clone(&bcode));
        let res = self.eval_bcode(&bcode, this, false);
        self.active_bcodes.pop();
        res
    }

    /// Compiles source into a serialized binary bcode stream (all
    /// literals inlined).
    pub fn compile_binary_bcode(&mut self, src: &str, filename: Option<&str>) -> ExecResult<Vec<u8>> {
        let ast = Parser::new(src)
            .and_then(|p| p.parse())
            .map_err(|e| ExecError::Syntax(e.format(filename.unwrap_or("<anonymous>"), src)))?;
        let bcode = compile_script(&ast, &mut self.heap, filename.map(Rc::from), true)?;
        bcode_file::serialize_bcode(&bcode)
    }

    // ---- value constructors and accessors ----

    /// Creates a string value, copying the bytes.
    pub fn mk_string(&mut self, s: &str) -> Val {
        let v = self.heap.strings.mk_string(s.as_bytes());
        self.heap.need_gc = self.heap.need_gc || self.heap.strings.need_gc;
        v
    }

    /// Creates a string value without copying (static data).
    pub fn mk_string_foreign(&mut self, s: &'static [u8]) -> Val {
        self.heap.strings.mk_string_foreign(s)
    }

    /// Copies a string value's bytes out of the engine.
    pub fn string_bytes(&self, v: Val) -> ExecResult<Vec<u8>> {
        self.heap
            .strings
            .get(v)
            .map(|s| s.bytes().to_vec())
            .map_err(|e| ExecError::Internal(format!("{:?}", e)))
    }

    /// Creates an empty object with the default prototype (none).
    pub fn mk_object(&mut self) -> Val {
        self.heap.mk_object(Val::NULL)
    }

    /// Creates an empty dense array.
    pub fn mk_array(&mut self) -> Val {
        self.heap.mk_dense_array(Val::NULL)
    }

    /// Registers a native function and returns its value.
    pub fn mk_cfunction(&mut self, f: CFunc) -> Val {
        let idx = self.cfuncs.len() as u32;
        self.cfuncs.push(f);
        Val::cfunction(idx)
    }

    /// Number of arguments of the current native call.
    pub fn argc(&self) -> usize {
        self.heap.array_length(self.cfunc_args)
    }

    /// The `i`-th argument of the current native call.
    pub fn arg(&self, i: usize) -> Val {
        self.heap.array_get(self.cfunc_args, i)
    }

    /// The `this` value of the current native call.
    pub fn this(&self) -> Val {
        self.frames
            .last()
            .map(|f| f.this_val)
            .unwrap_or(Val::UNDEFINED)
    }

    // ---- roots ----

    /// Pushes a value onto the user-owned root list (LIFO).
    pub fn own(&mut self, v: Val) -> OwnedRef {
        self.heap.own(v)
    }

    /// Pops the most recently owned value; `false` if out of order.
    pub fn disown(&mut self, r: OwnedRef) -> bool {
        self.heap.disown(r)
    }

    /// Re-reads an owned value after a collection.
    pub fn owned_value(&self, r: OwnedRef) -> Option<Val> {
        self.heap.owned_value(r)
    }

    // ---- control ----

    /// Enables or disables automatic garbage collection.
    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.heap.gc_enabled = enabled;
    }

    /// Runs a full collection cycle immediately.
    pub fn gc(&mut self) -> ExecResult<()> {
        self.run_gc(None)
    }

    /// A handle the host may set from another thread to interrupt the VM
    /// between instructions.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Requests interruption of the running VM.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_interrupt(&mut self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    // ---- thrown-error state ----

    /// Throws an arbitrary value.
    pub fn throw(&mut self, v: Val) -> ExecError {
        self.vals.thrown_error = v;
        self.is_thrown = true;
        ExecError::Exception
    }

    /// The currently thrown value, if any.
    pub fn get_thrown_value(&self) -> Option<Val> {
        if self.is_thrown {
            Some(self.vals.thrown_error)
        } else {
            None
        }
    }

    /// Clears the thrown state.
    pub fn clear_thrown(&mut self) {
        self.is_thrown = false;
        self.vals.thrown_error = Val::UNDEFINED;
    }

    /// Re-raises the current thrown value.
    pub fn rethrow(&mut self) -> ExecResult<()> {
        if self.is_thrown {
            Err(ExecError::Exception)
        } else {
            Ok(())
        }
    }

    // ---- statistics ----

    /// Heap occupancy report.
    pub fn heap_stat(&self) -> HeapStat {
        self.heap.heap_stat()
    }

    /// Data-stack and call-stack high-water marks.
    pub fn stack_stat(&self) -> (usize, usize) {
        (self.stack_high_water, self.frame_high_water)
    }

    /// Resets the stack statistics.
    pub fn stack_stat_clean(&mut self) {
        self.stack_high_water = self.stack.len();
        self.frame_high_water = self.frames.len();
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}

/// `JSON.parse(text)`: the core's JSON entry point exposed to scripts.
fn cfunc_json_parse(e: &mut Engine) -> ExecResult<Val> {
    let text_val = e.arg(0);
    let text = if text_val.is_string() {
        String::from_utf8_lossy(&e.string_bytes(text_val)?).into_owned()
    } else {
        let s = e.to_string_val(text_val)?;
        String::from_utf8_lossy(&e.string_bytes(s)?).into_owned()
    };
    match e.parse_json(&text) {
        Ok(v) => Ok(v),
        Err(ExecError::Syntax(msg)) => {
            let err = e.mk_error_object(ErrorKind::SyntaxError, &msg);
            Err(e.throw(err))
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_basics() {
        let mut e = Engine::new();
        let v = e.exec("1 + 2 * 3").unwrap();
        assert_eq!(v.as_f64(), 7.0);
    }

    #[test]
    fn test_own_disown() {
        let mut e = Engine::new();
        let s = e.mk_string("a long enough string to go on the heap");
        let r = e.own(s);
        assert_eq!(e.owned_value(r), Some(s));
        assert!(e.disown(r));
    }

    #[test]
    fn test_thrown_state_roundtrip() {
        let mut e = Engine::new();
        let err = e.exec("throw 42;");
        assert!(matches!(err, Err(ExecError::Exception)));
        let thrown = e.get_thrown_value().unwrap();
        assert_eq!(thrown.as_f64(), 42.0);
        e.clear_thrown();
        assert!(e.get_thrown_value().is_none());
    }

    #[test]
    fn test_freeze_is_rejected() {
        let mut e = Engine::with_options(EngineOptions {
            freeze_file: Some("/tmp/kestrel.frozen".to_string()),
            ..EngineOptions::default()
        });
        assert!(matches!(e.exec("1"), Err(ExecError::Internal(_))));
    }
}
