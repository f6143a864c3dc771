//! The bytecode evaluator.
//!
//! A stack machine over `Val`s. Control-flow effects (`throw`, `return`,
//! `break`, `continue`) all resolve through the per-frame try-stack: the
//! VM scans it for a matching protected region, honoring intervening
//! `finally` blocks by latching the pending effect and resuming it from
//! `AFTER_FINALLY`.

use std::rc::Rc;

use bytecode_system::{Bcode, InlineLitTag, Opcode, MAX_INLINE_LIT_TAG, OP_LINE_NO};
use core_types::varint::{msb_lsb_swap, read_varint};
use core_types::{ErrorKind, ExecError, ExecResult, Val, ValKind};
use memory_manager::{
    GcRoots, GetResult, SetResult, ATTR_NON_CONFIGURABLE, ATTR_NON_ENUMERABLE,
};
use parser::bcode_file;

use crate::call_frame::{
    lblock_pack, lblock_unpack, BlockTag, CallFrame, FRAME_BCODE, FRAME_CFUNC, FRAME_PRIVATE,
};
use crate::conversion::PrimitiveHint;
use crate::engine::Engine;

/// Evaluator registers: the bcode being executed and the ops cursor.
pub(crate) struct Regs {
    pub bcode: Rc<Bcode>,
    pub pc: usize,
    pub end: usize,
}

const BLOCK_CATCH: u8 = 1 << 0;
const BLOCK_FINALLY: u8 = 1 << 1;
const BLOCK_LOOP: u8 = 1 << 2;
const BLOCK_SWITCH: u8 = 1 << 3;

fn block_bit(tag: BlockTag) -> u8 {
    match tag {
        BlockTag::Catch => BLOCK_CATCH,
        BlockTag::Finally => BLOCK_FINALLY,
        BlockTag::Loop => BLOCK_LOOP,
        BlockTag::Switch => BLOCK_SWITCH,
    }
}

impl Engine {
    /// Evaluates a bcode with the given `this`, pushing a fresh bottom
    /// frame. Exceptions unwind no further than this frame.
    pub(crate) fn eval_bcode(
        &mut self,
        bcode: &Rc<Bcode>,
        this: Val,
        reset_line_no: bool,
    ) -> ExecResult<Val> {
        let saved_bottom = self.bottom_frame;
        let saved_stack_len = self.stack.len();
        let saved_frames_len = self.frames.len();

        let scope = self.vals.global_object;
        // Script-level declarations become non-configurable globals.
        let names: Vec<Vec<u8>> = bcode.names().map(|n| n.to_vec()).collect();
        for name in names {
            let name_val = self.heap.strings.mk_string(&name);
            if self.heap.get_own_prop(scope, name_val).is_none() {
                self.heap
                    .def_prop(scope, name_val, ATTR_NON_CONFIGURABLE, Val::UNDEFINED);
            }
        }

        let mut frame = CallFrame::bcode(
            Rc::clone(bcode),
            scope,
            this,
            usize::MAX,
            saved_stack_len,
            false,
        );
        frame.line_no = if reset_line_no {
            1
        } else {
            self.frames.last().map(|f| f.line_no).unwrap_or(1)
        };
        self.frames.push(frame);
        self.frame_high_water = self.frame_high_water.max(self.frames.len());
        self.bottom_frame = self.frames.len() - 1;

        let mut r = Regs {
            bcode: Rc::clone(bcode),
            pc: bcode.end_names(),
            end: bcode.ops.len(),
        };
        let result = self.run(&mut r);

        let out = match result {
            Ok(()) => Ok(self.pop()),
            Err(e) => Err(e),
        };
        self.frames.truncate(saved_frames_len);
        self.stack.truncate(saved_stack_len);
        self.bottom_frame = saved_bottom;
        out
    }

    fn run(&mut self, r: &mut Regs) -> ExecResult<()> {
        'vm: loop {
            if r.pc >= r.end {
                if self.frames.len() - 1 > self.bottom_frame {
                    // Fell off the end of a callee without RET.
                    self.push(Val::UNDEFINED);
                    self.adjust_retval();
                    self.perform_return(r, true)?;
                    continue 'vm;
                }
                return Ok(());
            }
            if self.take_interrupt() {
                return Err(ExecError::Interrupted);
            }
            if self.heap.gc_enabled && (self.heap.need_gc || self.heap.strings.need_gc) {
                self.run_gc(Some(r))?;
            }

            let byte = r.bcode.ops[r.pc];
            if byte >= OP_LINE_NO {
                let mut buf = [0u8; 8];
                let avail = (r.end - r.pc).min(8);
                buf[..avail].copy_from_slice(&r.bcode.ops[r.pc..r.pc + avail]);
                buf[0] = msb_lsb_swap(buf[0]);
                let (value, llen) = read_varint(&buf);
                if let Some(f) = self.frames.last_mut() {
                    f.line_no = (value >> 1) as u32;
                }
                r.pc += llen;
                continue 'vm;
            }

            let op = Opcode::from_u8(byte).ok_or_else(|| {
                ExecError::Internal(format!("unknown opcode: {}", byte))
            })?;
            self.push_op_history(op);
            let mut pc = r.pc + 1;

            match op {
                Opcode::Drop => {
                    self.pop();
                }
                Opcode::Dup => {
                    let v = self.tos();
                    self.push(v);
                }
                Opcode::TwoDup => {
                    let b = self.tos();
                    let a = self.stack[self.stack.len() - 2];
                    self.push(a);
                    self.push(b);
                }
                Opcode::Swap => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }
                Opcode::Stash => {
                    debug_assert!(!self.is_stashed);
                    self.vals.stash = self.tos();
                    self.is_stashed = true;
                }
                Opcode::Unstash => {
                    debug_assert!(self.is_stashed);
                    self.pop();
                    let v = self.vals.stash;
                    self.push(v);
                    self.vals.stash = Val::UNDEFINED;
                    self.is_stashed = false;
                }
                Opcode::SwapDrop => {
                    let keep = self.pop();
                    self.pop();
                    self.push(keep);
                }

                Opcode::PushUndefined => self.push(Val::UNDEFINED),
                Opcode::PushNull => self.push(Val::NULL),
                Opcode::PushThis => {
                    let this = self.current_this();
                    self.push(this);
                    self.reset_last_name();
                }
                Opcode::PushTrue => {
                    self.push(Val::TRUE);
                    self.reset_last_name();
                }
                Opcode::PushFalse => {
                    self.push(Val::FALSE);
                    self.reset_last_name();
                }
                Opcode::PushZero => self.push(Val::ZERO),
                Opcode::PushOne => self.push(Val::number(1.0)),
                Opcode::PushLit => {
                    let v = self.decode_lit(r, &mut pc)?;
                    if v.is_string() {
                        self.vals.last_name[1] = self.vals.last_name[0];
                        self.vals.last_name[0] = v;
                    } else {
                        self.reset_last_name();
                    }
                    self.push(v);
                }

                Opcode::Not => {
                    let v = self.pop();
                    let res = self.to_int32_v(v);
                    let n = self.vm_try(r, res)?;
                    match n {
                        Some(n) => self.push(Val::number(!n as f64)),
                        None => continue 'vm,
                    }
                }
                Opcode::LogicalNot => {
                    let v = self.pop();
                    let b = self.to_boolean(v);
                    self.push(Val::boolean(!b));
                }
                Opcode::Neg => {
                    let v = self.pop();
                    let res = self.to_number_v(v);
                    match self.vm_try(r, res)? {
                        Some(n) => self.push(Val::number(-n)),
                        None => continue 'vm,
                    }
                }
                Opcode::Pos => {
                    let v = self.pop();
                    let res = self.to_number_v(v);
                    match self.vm_try(r, res)? {
                        Some(n) => self.push(Val::number(n)),
                        None => continue 'vm,
                    }
                }

                Opcode::Add => {
                    let b = self.pop();
                    let a = self.pop();
                    let res = self.add_values(a, b);
                    match self.vm_try(r, res)? {
                        Some(v) => self.push(v),
                        None => continue 'vm,
                    }
                }
                Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem => {
                    let b = self.pop();
                    let a = self.pop();
                    let res = self.numeric_binop(op, a, b);
                    match self.vm_try(r, res)? {
                        Some(v) => self.push(v),
                        None => continue 'vm,
                    }
                }
                Opcode::Lshift
                | Opcode::Rshift
                | Opcode::Urshift
                | Opcode::Or
                | Opcode::Xor
                | Opcode::And => {
                    let b = self.pop();
                    let a = self.pop();
                    let res = self.integer_binop(op, a, b);
                    match self.vm_try(r, res)? {
                        Some(v) => self.push(v),
                        None => continue 'vm,
                    }
                }

                Opcode::EqEq => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.strict_equals(a, b);
                    self.push(Val::boolean(eq));
                }
                Opcode::NeNe => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.strict_equals(a, b);
                    self.push(Val::boolean(!eq));
                }
                Opcode::Eq | Opcode::Ne => {
                    let b = self.pop();
                    let a = self.pop();
                    let res = self.abstract_equals(a, b);
                    match self.vm_try(r, res)? {
                        Some(eq) => self.push(Val::boolean(if op == Opcode::Eq { eq } else { !eq })),
                        None => continue 'vm,
                    }
                }
                Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
                    let b = self.pop();
                    let a = self.pop();
                    let res = self.relational(op, a, b);
                    match self.vm_try(r, res)? {
                        Some(v) => self.push(Val::boolean(v)),
                        None => continue 'vm,
                    }
                }
                Opcode::Instanceof => {
                    let b = self.pop();
                    let a = self.pop();
                    let res = self.instance_of(a, b);
                    match self.vm_try(r, res)? {
                        Some(v) => self.push(Val::boolean(v)),
                        None => continue 'vm,
                    }
                }
                Opcode::In => {
                    let b = self.pop();
                    let a = self.pop();
                    let res = self.in_operator(a, b);
                    match self.vm_try(r, res)? {
                        Some(v) => self.push(Val::boolean(v)),
                        None => continue 'vm,
                    }
                }
                Opcode::Typeof => {
                    let v = self.pop();
                    let s = self.typeof_str(v);
                    let sv = self.mk_string(s);
                    self.push(sv);
                }

                Opcode::Get => {
                    let key = self.pop();
                    let obj = self.pop();
                    let res = self.op_get(obj, key);
                    match self.vm_try(r, res)? {
                        Some(v) => self.push(v),
                        None => continue 'vm,
                    }
                }
                Opcode::Set => {
                    let value = self.pop();
                    let key = self.pop();
                    let obj = self.pop();
                    let res = self.op_set(obj, key, value);
                    match self.vm_try(r, res)? {
                        Some(()) => self.push(value),
                        None => continue 'vm,
                    }
                }
                Opcode::GetVar => {
                    let name = self.decode_lit(r, &mut pc)?;
                    self.vals.last_name[0] = name;
                    self.vals.last_name[1] = Val::UNDEFINED;
                    match self.lookup_var(name) {
                        Some(v) => self.push(v),
                        None => {
                            let text = self.name_text(name);
                            let _ = self.throw_error(
                                ErrorKind::ReferenceError,
                                &format!("[{}] is not defined", text),
                            );
                            self.perform_throw(r, false)?;
                            continue 'vm;
                        }
                    }
                }
                Opcode::SafeGetVar => {
                    let name = self.decode_lit(r, &mut pc)?;
                    let v = self.lookup_var(name).unwrap_or(Val::UNDEFINED);
                    self.push(v);
                }
                Opcode::SetVar => {
                    let name = self.decode_lit(r, &mut pc)?;
                    let value = self.tos();
                    let strict = r.bcode.strict_mode;
                    let res = self.store_var(name, value, strict);
                    match self.vm_try(r, res)? {
                        Some(()) => {}
                        None => continue 'vm,
                    }
                }
                Opcode::Delete => {
                    let key = self.pop();
                    let obj = self.pop();
                    let strict = r.bcode.strict_mode;
                    let res = self.op_delete(obj, key, strict);
                    match self.vm_try(r, res)? {
                        Some(ok) => self.push(Val::boolean(ok)),
                        None => continue 'vm,
                    }
                }
                Opcode::DeleteVar => {
                    let name = self.decode_lit(r, &mut pc)?;
                    let deleted = self.delete_var(name, r.bcode.strict_mode);
                    self.push(Val::boolean(deleted));
                }

                Opcode::Jmp => {
                    let target = self.get_target(r, &mut pc);
                    r.pc = target as usize;
                    continue 'vm;
                }
                Opcode::JmpTrue => {
                    let target = self.get_target(r, &mut pc);
                    let v = self.pop();
                    if self.to_boolean(v) {
                        r.pc = target as usize;
                        continue 'vm;
                    }
                }
                Opcode::JmpFalse => {
                    let target = self.get_target(r, &mut pc);
                    let v = self.pop();
                    if !self.to_boolean(v) {
                        r.pc = target as usize;
                        continue 'vm;
                    }
                }
                Opcode::JmpTrueDrop => {
                    let target = self.get_target(r, &mut pc);
                    let v = self.pop();
                    if self.to_boolean(v) {
                        self.pop();
                        r.pc = target as usize;
                        continue 'vm;
                    }
                }
                Opcode::JmpIfContinue => {
                    let target = self.get_target(r, &mut pc);
                    if self.is_continuing {
                        self.is_continuing = false;
                        r.pc = target as usize;
                        continue 'vm;
                    }
                    self.is_continuing = false;
                }

                Opcode::CreateObj => {
                    let v = self.heap.mk_object(Val::NULL);
                    self.push(v);
                }
                Opcode::CreateArr => {
                    let v = self.heap.mk_dense_array(Val::NULL);
                    self.push(v);
                }
                Opcode::NextProp => {
                    let handle = self.pop();
                    let obj = self.pop();
                    match self.next_prop(obj, handle) {
                        Some((obj2, handle2, key)) => {
                            self.push(obj2);
                            self.push(handle2);
                            self.push(key);
                            self.push(Val::TRUE);
                        }
                        None => {
                            self.push(obj);
                            self.push(handle);
                            self.push(Val::UNDEFINED);
                            self.push(Val::FALSE);
                        }
                    }
                }
                Opcode::FuncLit => {
                    let half = self.pop();
                    let res = self.instantiate_function(half);
                    match self.vm_try(r, res)? {
                        Some(f) => self.push(f),
                        None => continue 'vm,
                    }
                }

                Opcode::CheckCall => {
                    let f = self.tos();
                    if !f.is_callable() {
                        self.pending_call_error = Some(self.call_error_message());
                    }
                }
                Opcode::Call | Opcode::New => {
                    let argc = r.bcode.ops[pc] as usize;
                    pc += 1;
                    r.pc = pc;
                    self.perform_call(r, op == Opcode::New, argc)?;
                    continue 'vm;
                }
                Opcode::Ret => {
                    self.adjust_retval();
                    self.perform_return(r, true)?;
                    continue 'vm;
                }

                Opcode::TryPushCatch
                | Opcode::TryPushFinally
                | Opcode::TryPushLoop
                | Opcode::TryPushSwitch => {
                    let target = self.get_target(r, &mut pc);
                    let tag = match op {
                        Opcode::TryPushCatch => BlockTag::Catch,
                        Opcode::TryPushFinally => BlockTag::Finally,
                        Opcode::TryPushLoop => BlockTag::Loop,
                        _ => BlockTag::Switch,
                    };
                    self.try_push(target, tag);
                }
                Opcode::TryPop => {
                    self.try_pop()?;
                }
                Opcode::AfterFinally => {
                    if self.is_thrown {
                        self.perform_throw(r, false)?;
                        continue 'vm;
                    } else if self.is_returned {
                        self.perform_return(r, false)?;
                        continue 'vm;
                    } else if self.is_breaking {
                        self.perform_break(r)?;
                        continue 'vm;
                    }
                }
                Opcode::Throw => {
                    let v = self.pop();
                    self.vals.thrown_error = v;
                    self.is_thrown = true;
                    self.perform_throw(r, false)?;
                    continue 'vm;
                }
                Opcode::Break => {
                    self.perform_break(r)?;
                    continue 'vm;
                }
                Opcode::Continue => {
                    self.is_continuing = true;
                    self.perform_break(r)?;
                    continue 'vm;
                }
                Opcode::EnterCatch => {
                    let name = self.decode_lit(r, &mut pc)?;
                    let thrown = self.pop();
                    let outer = self.get_scope();
                    let scope_frame = self.heap.mk_object(outer);
                    self.heap.def_prop(scope_frame, name, 0, thrown);
                    let frame = CallFrame::private(scope_frame, self.stack.len());
                    self.frames.push(frame);
                    self.frame_high_water = self.frame_high_water.max(self.frames.len());
                }
                Opcode::ExitCatch => {
                    let mask = self.unwind_stack_1level(r);
                    debug_assert_eq!(mask, FRAME_PRIVATE);
                }
            }

            r.pc = pc;
        }
    }

    // ---- small per-op helpers ----

    pub(crate) fn push(&mut self, v: Val) {
        self.stack.push(v);
        self.stack_high_water = self.stack_high_water.max(self.stack.len());
    }

    pub(crate) fn pop(&mut self) -> Val {
        self.stack.pop().unwrap_or(Val::UNDEFINED)
    }

    fn tos(&self) -> Val {
        *self.stack.last().unwrap_or(&Val::UNDEFINED)
    }

    fn reset_last_name(&mut self) {
        self.vals.last_name = [Val::UNDEFINED, Val::UNDEFINED];
    }

    fn push_op_history(&mut self, op: Opcode) {
        if matches!(op, Opcode::CheckCall | Opcode::Call | Opcode::New) {
            return;
        }
        if self.last_ops.is_full() {
            self.last_ops.truncate(self.last_ops.capacity() - 1);
        }
        self.last_ops.insert(0, op);
    }

    fn name_text(&self, name: Val) -> String {
        self.heap
            .strings
            .get(name)
            .map(|s| String::from_utf8_lossy(s.bytes()).into_owned())
            .unwrap_or_else(|_| "?".to_string())
    }

    /// Best-effort callee name for the `TypeError` thrown on calling a
    /// non-callable, built from the recent-opcode ring.
    fn call_error_message(&self) -> String {
        if self.last_ops.first() == Some(&Opcode::GetVar) {
            let n = self.name_text(self.vals.last_name[0]);
            return format!("{} is not a function", n);
        }
        if self.last_ops.first() == Some(&Opcode::Get)
            && self.last_ops.get(1) == Some(&Opcode::PushLit)
        {
            let n0 = self.name_text(self.vals.last_name[0]);
            if self.vals.last_name[1].is_undefined() {
                return format!("{} is not a function", n0);
            }
            let n1 = self.name_text(self.vals.last_name[1]);
            return format!("{}.{} is not a function", n1, n0);
        }
        "value is not a function".to_string()
    }

    fn current_this(&self) -> Val {
        self.frames
            .iter()
            .rev()
            .find(|f| f.type_mask & (FRAME_BCODE | FRAME_CFUNC) != 0)
            .map(|f| f.this_val)
            .unwrap_or(Val::UNDEFINED)
    }

    pub(crate) fn get_scope(&self) -> Val {
        self.frames
            .iter()
            .rev()
            .find(|f| f.type_mask & FRAME_PRIVATE != 0)
            .map(|f| f.scope)
            .unwrap_or(self.vals.global_object)
    }

    fn get_target(&self, r: &Regs, pc: &mut usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&r.bcode.ops[*pc..*pc + 4]);
        *pc += 4;
        u32::from_le_bytes(raw)
    }

    fn decode_lit(&mut self, r: &Regs, pc: &mut usize) -> ExecResult<Val> {
        let ops = &r.bcode.ops;
        let (idx, llen) = read_varint(&ops[*pc..]);
        *pc += llen;
        if idx >= MAX_INLINE_LIT_TAG {
            let table = r.bcode.lit.borrow();
            return table
                .get(idx - MAX_INLINE_LIT_TAG)
                .copied()
                .ok_or_else(|| ExecError::Internal("literal index out of range".to_string()));
        }
        if idx == InlineLitTag::String as usize {
            let (len, l2) = read_varint(&ops[*pc..]);
            *pc += l2;
            let bytes = ops[*pc..*pc + len].to_vec();
            *pc += len + 1; // bytes + NUL
            let v = self.heap.strings.mk_string(&bytes);
            Ok(v)
        } else if idx == InlineLitTag::Number as usize {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&ops[*pc..*pc + 8]);
            *pc += 8;
            Ok(Val::from_bits(u64::from_le_bytes(raw)))
        } else if idx == InlineLitTag::Func as usize {
            let inner = bcode_file::read_func(
                ops,
                pc,
                r.bcode.strict_mode,
                r.bcode.filename.clone(),
            )?;
            Ok(self.heap.mk_function(Val::UNDEFINED, Rc::new(inner)))
        } else {
            // Inline regexp: source and flags strings.
            let (slen, l2) = read_varint(&ops[*pc..]);
            *pc += l2;
            let src = ops[*pc..*pc + slen].to_vec();
            *pc += slen + 1;
            let (flen, l3) = read_varint(&ops[*pc..]);
            *pc += l3;
            let flags = ops[*pc..*pc + flen].to_vec();
            *pc += flen + 1;
            let src = String::from_utf8_lossy(&src).into_owned();
            let flags = String::from_utf8_lossy(&flags).into_owned();
            self.heap
                .mk_regexp(&src, &flags)
                .map_err(ExecError::Internal)
        }
    }

    /// Converts `Err(Exception)` into in-VM unwinding; other errors
    /// propagate. Returns `None` when control was transferred.
    fn vm_try<T>(&mut self, r: &mut Regs, res: ExecResult<T>) -> ExecResult<Option<T>> {
        match res {
            Ok(v) => Ok(Some(v)),
            Err(ExecError::Exception) => {
                self.perform_throw(r, false)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    // Conversion shims that keep borrowck happy inside the big match.
    fn to_number_v(&mut self, v: Val) -> ExecResult<f64> {
        self.to_number(v)
    }
    fn to_int32_v(&mut self, v: Val) -> ExecResult<i32> {
        self.to_int32(v)
    }

    // ---- variable access ----

    fn lookup_var(&self, name: Val) -> Option<Val> {
        let mut cur = self.get_scope();
        loop {
            if let Some(ph) = self.heap.get_own_prop(cur, name) {
                return self.heap.prop(ph).map(|p| p.value);
            }
            let proto = self.heap.proto_of(cur);
            if proto.is_object() {
                cur = proto;
            } else {
                return None;
            }
        }
    }

    fn store_var(&mut self, name: Val, value: Val, strict: bool) -> ExecResult<()> {
        let mut cur = self.get_scope();
        loop {
            if let Some(ph) = self.heap.get_own_prop(cur, name) {
                if let Some(p) = self.heap.prop_mut(ph) {
                    p.value = value;
                }
                return Ok(());
            }
            let proto = self.heap.proto_of(cur);
            if proto.is_object() {
                cur = proto;
            } else {
                break;
            }
        }
        if strict {
            let text = self.name_text(name);
            return Err(self.throw_error(
                ErrorKind::ReferenceError,
                &format!("[{}] is not defined", text),
            ));
        }
        let global = self.vals.global_object;
        self.heap.def_prop(global, name, 0, value);
        Ok(())
    }

    fn delete_var(&mut self, name: Val, strict: bool) -> bool {
        if strict {
            let scope = self.get_scope();
            return self.heap.del_prop(scope, name);
        }
        let mut cur = self.get_scope();
        loop {
            if self.heap.get_own_prop(cur, name).is_some() {
                return self.heap.del_prop(cur, name);
            }
            let proto = self.heap.proto_of(cur);
            if proto.is_object() {
                cur = proto;
            } else {
                return true;
            }
        }
    }

    // ---- property access ----

    fn key_to_string(&mut self, key: Val) -> ExecResult<Val> {
        if key.is_string() {
            Ok(key)
        } else {
            self.to_string_val(key)
        }
    }

    fn op_get(&mut self, obj: Val, key: Val) -> ExecResult<Val> {
        let key = self.key_to_string(key)?;
        if obj.is_undefined() || obj.is_null() {
            let k = self.name_text(key);
            return Err(self.throw_error(
                ErrorKind::TypeError,
                &format!("cannot read property '{}' of {}", k, self.typeof_like(obj)),
            ));
        }
        if obj.is_string() {
            return self.string_prop(obj, key);
        }
        if obj.is_primitive() {
            return Ok(Val::UNDEFINED);
        }
        match self.heap.get_prop(obj, key) {
            GetResult::Value(v) => Ok(v),
            GetResult::CallGetter(getter) => self.apply(getter, obj, &[]),
            GetResult::Missing => Ok(Val::UNDEFINED),
        }
    }

    fn typeof_like(&self, v: Val) -> &'static str {
        if v.is_null() {
            "null"
        } else {
            "undefined"
        }
    }

    fn string_prop(&mut self, s: Val, key: Val) -> ExecResult<Val> {
        let bytes = self
            .heap
            .strings
            .get(s)
            .map_err(|e| self.stale_string(e))?
            .bytes()
            .to_vec();
        let key_bytes = self
            .heap
            .strings
            .get(key)
            .map_err(|e| self.stale_string(e))?
            .bytes()
            .to_vec();
        if key_bytes == b"length" {
            let text = String::from_utf8_lossy(&bytes);
            return Ok(Val::number(text.chars().count() as f64));
        }
        if let Some(i) = self.heap.name_as_index(key) {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            if let Some(ch) = text.chars().nth(i) {
                let mut buf = [0u8; 4];
                let v = self.heap.strings.mk_string(ch.encode_utf8(&mut buf).as_bytes());
                return Ok(v);
            }
        }
        Ok(Val::UNDEFINED)
    }

    fn op_set(&mut self, obj: Val, key: Val, value: Val) -> ExecResult<()> {
        let key = self.key_to_string(key)?;
        if obj.is_undefined() || obj.is_null() {
            let k = self.name_text(key);
            return Err(self.throw_error(
                ErrorKind::TypeError,
                &format!("cannot set property '{}' of {}", k, self.typeof_like(obj)),
            ));
        }
        if obj.is_primitive() {
            return Ok(());
        }
        match self.heap.set_prop(obj, key, value) {
            SetResult::Done => Ok(()),
            SetResult::CallSetter(setter) => {
                self.apply(setter, obj, &[value])?;
                Ok(())
            }
            SetResult::NotWritable | SetResult::NotExtensible => {
                let strict = self
                    .frames
                    .iter()
                    .rev()
                    .find_map(|f| f.bcode.as_ref())
                    .map(|b| b.strict_mode)
                    .unwrap_or(false);
                if strict {
                    let k = self.name_text(key);
                    Err(self.throw_error(
                        ErrorKind::TypeError,
                        &format!("cannot assign to read only property '{}'", k),
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    fn op_delete(&mut self, obj: Val, key: Val, strict: bool) -> ExecResult<bool> {
        let key = self.key_to_string(key)?;
        if obj.is_primitive() {
            return Ok(true);
        }
        let deleted = self.heap.del_prop(obj, key);
        if !deleted && strict {
            let k = self.name_text(key);
            return Err(self.throw_error(
                ErrorKind::TypeError,
                &format!("cannot delete property '{}'", k),
            ));
        }
        Ok(deleted)
    }

    // ---- operators ----

    fn add_values(&mut self, a: Val, b: Val) -> ExecResult<Val> {
        let ap = self.to_primitive(a, PrimitiveHint::Auto)?;
        let bp = self.to_primitive(b, PrimitiveHint::Auto)?;
        if ap.is_string() || bp.is_string() {
            let astr = self.to_string_val(ap)?;
            let bstr = self.to_string_val(bp)?;
            return self.concat_strings(astr, bstr);
        }
        let an = self.to_number(ap)?;
        let bn = self.to_number(bp)?;
        Ok(Val::number(an + bn))
    }

    /// String concatenation: one owned allocation of the summed length.
    pub fn concat_strings(&mut self, a: Val, b: Val) -> ExecResult<Val> {
        let mut out = self
            .heap
            .strings
            .get(a)
            .map_err(|e| self.stale_string(e))?
            .bytes()
            .to_vec();
        let bb = self
            .heap
            .strings
            .get(b)
            .map_err(|e| self.stale_string(e))?
            .bytes()
            .to_vec();
        out.extend_from_slice(&bb);
        let v = self.heap.strings.mk_string(&out);
        self.heap.need_gc = self.heap.need_gc || self.heap.strings.need_gc;
        Ok(v)
    }

    fn numeric_binop(&mut self, op: Opcode, a: Val, b: Val) -> ExecResult<Val> {
        let an = self.to_number(a)?;
        let bn = self.to_number(b)?;
        let res = match op {
            Opcode::Sub => an - bn,
            Opcode::Mul => an * bn,
            Opcode::Div => an / bn,
            Opcode::Rem => an % bn,
            _ => unreachable!(),
        };
        Ok(Val::number(res))
    }

    fn integer_binop(&mut self, op: Opcode, a: Val, b: Val) -> ExecResult<Val> {
        let res = match op {
            Opcode::Lshift => {
                let x = self.to_int32(a)?;
                let s = self.to_uint32(b)? & 31;
                (x << s) as f64
            }
            Opcode::Rshift => {
                let x = self.to_int32(a)?;
                let s = self.to_uint32(b)? & 31;
                (x >> s) as f64
            }
            Opcode::Urshift => {
                let x = self.to_uint32(a)?;
                let s = self.to_uint32(b)? & 31;
                (x >> s) as f64
            }
            Opcode::Or => (self.to_int32(a)? | self.to_int32(b)?) as f64,
            Opcode::Xor => (self.to_int32(a)? ^ self.to_int32(b)?) as f64,
            Opcode::And => (self.to_int32(a)? & self.to_int32(b)?) as f64,
            _ => unreachable!(),
        };
        Ok(Val::number(res))
    }

    fn relational(&mut self, op: Opcode, a: Val, b: Val) -> ExecResult<bool> {
        let ap = self.to_primitive(a, PrimitiveHint::Number)?;
        let bp = self.to_primitive(b, PrimitiveHint::Number)?;
        if ap.is_string() && bp.is_string() {
            let ord = self
                .heap
                .strings
                .str_cmp(ap, bp)
                .map_err(|e| self.stale_string(e))?;
            return Ok(match op {
                Opcode::Lt => ord.is_lt(),
                Opcode::Le => ord.is_le(),
                Opcode::Gt => ord.is_gt(),
                Opcode::Ge => ord.is_ge(),
                _ => unreachable!(),
            });
        }
        let an = self.to_number(ap)?;
        let bn = self.to_number(bp)?;
        if an.is_nan() || bn.is_nan() {
            return Ok(false);
        }
        Ok(match op {
            Opcode::Lt => an < bn,
            Opcode::Le => an <= bn,
            Opcode::Gt => an > bn,
            Opcode::Ge => an >= bn,
            _ => unreachable!(),
        })
    }

    fn instance_of(&mut self, a: Val, b: Val) -> ExecResult<bool> {
        if !b.is_callable() {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                "expecting a function in instanceof check",
            ));
        }
        let proto_key = self.heap.strings.mk_string(b"prototype");
        let proto = match self.heap.get_prop(b, proto_key) {
            GetResult::Value(v) => v,
            _ => return Ok(false),
        };
        if a.is_primitive() {
            return Ok(false);
        }
        let mut cur = self.heap.proto_of(a);
        for _ in 0..memory_manager::MAX_PROTO_DEPTH {
            if !cur.is_object() {
                return Ok(false);
            }
            if cur == proto {
                return Ok(true);
            }
            cur = self.heap.proto_of(cur);
        }
        Ok(false)
    }

    fn in_operator(&mut self, key: Val, obj: Val) -> ExecResult<bool> {
        if obj.is_primitive() {
            return Err(self.throw_error(
                ErrorKind::TypeError,
                "cannot use 'in' operator on a non-object",
            ));
        }
        let key = self.key_to_string(key)?;
        if self.heap.is_array(obj) {
            if let Some(i) = self.heap.name_as_index(key) {
                return Ok(i < self.heap.array_length(obj));
            }
        }
        Ok(!matches!(self.heap.get_prop(obj, key), GetResult::Missing))
    }

    // ---- for-in iteration ----

    const ITER_DENSE: usize = 1 << 40;
    const ITER_PROP: usize = 2 << 40;
    const ITER_PAYLOAD: usize = (1 << 40) - 1;

    fn next_prop(&mut self, obj: Val, handle: Val) -> Option<(Val, Val, Val)> {
        let mut cur_obj = obj;
        let mut state = handle.as_foreign();
        loop {
            if !(cur_obj.is_object() || cur_obj.is_function()) {
                return None;
            }
            // Dense-array indices come first.
            if self.heap.is_array(cur_obj) {
                let start = match state {
                    Some(s) if s & Self::ITER_DENSE != 0 => (s & Self::ITER_PAYLOAD) + 1,
                    Some(_) => usize::MAX, // already past the dense part
                    None => 0,
                };
                if start != usize::MAX {
                    let len = self.heap.array_length(cur_obj);
                    if start < len {
                        let key_text = start.to_string();
                        let key = self.heap.strings.mk_string(key_text.as_bytes());
                        let h = Val::foreign(Self::ITER_DENSE | start);
                        return Some((cur_obj, h, key));
                    }
                    state = None;
                }
            }
            // Then the property list.
            let mut cursor = match state {
                Some(s) if s & Self::ITER_PROP != 0 => {
                    let ph = (s & Self::ITER_PAYLOAD) as u32;
                    self.heap.prop(ph).and_then(|p| p.next)
                }
                _ => self.first_prop_of(cur_obj),
            };
            while let Some(ph) = cursor {
                let p = self.heap.prop(ph)?;
                let enumerable = p.attrs
                    & (memory_manager::ATTR_HIDDEN | ATTR_NON_ENUMERABLE)
                    == 0;
                if enumerable && p.name.is_string() {
                    let key = p.name;
                    let h = Val::foreign(Self::ITER_PROP | ph as usize);
                    return Some((cur_obj, h, key));
                }
                cursor = p.next;
            }
            // Exhausted: continue into the prototype.
            cur_obj = self.heap.proto_of(cur_obj);
            state = None;
        }
    }

    fn first_prop_of(&self, obj: Val) -> Option<u32> {
        match obj.kind() {
            ValKind::Object(h) => self.heap.objects.get(h)?.props,
            ValKind::Function(h) => self.heap.functions.get(h)?.props,
            _ => None,
        }
    }

    // ---- function instantiation and calls ----

    /// Completes a half-done function literal: a fresh function cell
    /// sharing the bcode, closing over the current scope, with a fresh
    /// `prototype` object whose `constructor` points back.
    fn instantiate_function(&mut self, half: Val) -> ExecResult<Val> {
        let ValKind::Function(h) = half.kind() else {
            return Err(ExecError::Internal(
                "FUNC_LIT on a non-function literal".to_string(),
            ));
        };
        let bcode = Rc::clone(
            &self
                .heap
                .functions
                .get(h)
                .ok_or_else(|| ExecError::Internal("dangling function literal".to_string()))?
                .bcode,
        );
        let scope = self.get_scope();
        let f = self.heap.mk_function(scope, bcode);
        let proto = self.heap.mk_object(Val::NULL);
        let ctor_key = self.heap.strings.mk_string(b"constructor");
        self.heap.def_prop(proto, ctor_key, ATTR_NON_ENUMERABLE, f);
        let proto_key = self.heap.strings.mk_string(b"prototype");
        self.heap.def_prop(
            f,
            proto_key,
            ATTR_NON_ENUMERABLE | ATTR_NON_CONFIGURABLE,
            proto,
        );
        Ok(f)
    }

    fn perform_call(&mut self, r: &mut Regs, is_constructor: bool, argc: usize) -> ExecResult<()> {
        if self.stack.len() < argc + 2 {
            return Err(ExecError::Internal("stack underflow in call".to_string()));
        }
        let args = self.heap.mk_dense_array(Val::NULL);
        for i in (0..argc).rev() {
            let v = self.pop();
            self.heap.array_set(args, i, v);
        }
        let func = self.pop();
        let mut this = self.pop();

        if let Some(msg) = self.pending_call_error.take() {
            let _ = self.throw_error(ErrorKind::TypeError, &msg);
            return self.perform_throw(r, false);
        }

        if is_constructor {
            let proto_key = self.heap.strings.mk_string(b"prototype");
            let proto = match self.heap.get_prop(func, proto_key) {
                GetResult::Value(v) if v.is_object() => v,
                _ => {
                    let _ = self.throw_error(
                        ErrorKind::TypeError,
                        "constructor prototype is not an object",
                    );
                    return self.perform_throw(r, false);
                }
            };
            this = self.heap.mk_object(proto);
        }

        match func.kind() {
            ValKind::CFunction(idx) => {
                let f = *self
                    .cfuncs
                    .get(idx as usize)
                    .ok_or_else(|| ExecError::Internal("bad cfunction index".to_string()))?;
                let frame = CallFrame::cfunc(idx, this, self.stack.len(), is_constructor);
                self.frames.push(frame);
                self.frame_high_water = self.frame_high_water.max(self.frames.len());
                let saved_args = std::mem::replace(&mut self.cfunc_args, args);
                let res = f(self);
                self.cfunc_args = saved_args;
                self.frames.pop();
                match res {
                    Ok(mut v) => {
                        if is_constructor && v.is_primitive() {
                            v = this;
                        }
                        self.push(v);
                        Ok(())
                    }
                    Err(ExecError::Exception) => self.perform_throw(r, false),
                    Err(e) => Err(e),
                }
            }
            ValKind::Function(h) => {
                let cell = self
                    .heap
                    .functions
                    .get(h)
                    .ok_or_else(|| ExecError::Internal("dangling function".to_string()))?;
                let bcode = Rc::clone(&cell.bcode);
                let captured = cell.scope;

                if !bcode.strict_mode && !is_constructor && (this.is_undefined() || this.is_null())
                {
                    this = self.vals.global_object;
                }

                let outer = if captured.is_object() {
                    captured
                } else {
                    self.vals.global_object
                };
                let scope = self.heap.mk_object(outer);

                let names: Vec<Vec<u8>> = bcode.names().map(|n| n.to_vec()).collect();
                let mut i = 0usize;
                if bcode.func_name_present {
                    let fname = &names[0];
                    if !fname.is_empty() {
                        let key = self.heap.strings.mk_string(fname);
                        self.heap.def_prop(scope, key, 0, func);
                    }
                    i = 1;
                }
                for a in 0..bcode.args_cnt as usize {
                    let key = self.heap.strings.mk_string(&names[i + a]);
                    let v = self.heap.array_get(args, a);
                    self.heap.def_prop(scope, key, 0, v);
                }
                i += bcode.args_cnt as usize;
                let args_key = self.heap.strings.mk_string(b"arguments");
                self.heap.def_prop(scope, args_key, 0, args);
                for name in &names[i..] {
                    let key = self.heap.strings.mk_string(name);
                    self.heap.def_prop(scope, key, 0, Val::UNDEFINED);
                }

                let line_no = self.frames.last().map(|f| f.line_no).unwrap_or(1);
                let mut frame = CallFrame::bcode(
                    Rc::clone(&bcode),
                    scope,
                    this,
                    r.pc,
                    self.stack.len(),
                    is_constructor,
                );
                frame.line_no = line_no;
                self.frames.push(frame);
                self.frame_high_water = self.frame_high_water.max(self.frames.len());

                r.pc = bcode.end_names();
                r.end = bcode.ops.len();
                r.bcode = bcode;
                Ok(())
            }
            _ => {
                // CHECK_CALL was bypassed (host bcode); throw now.
                let _ = self.throw_error(ErrorKind::TypeError, "value is not a function");
                self.perform_throw(r, false)
            }
        }
    }

    /// If the innermost bcode frame is a constructor call and the value
    /// on top of the stack is primitive, replace it with `this`.
    fn adjust_retval(&mut self) {
        let Some(frame) = self
            .frames
            .iter()
            .rev()
            .find(|f| f.type_mask & FRAME_BCODE != 0)
        else {
            return;
        };
        if frame.is_constructor && self.tos().is_primitive() {
            let this = frame.this_val;
            self.pop();
            self.push(this);
        }
    }

    // ---- try-stack machinery ----

    fn innermost_private_idx(&self) -> usize {
        self.frames
            .iter()
            .rposition(|f| f.type_mask & FRAME_PRIVATE != 0)
            .expect("a private frame always exists while executing")
    }

    fn try_push(&mut self, target: u32, tag: BlockTag) {
        let idx = self.innermost_private_idx();
        let mut arr = self.frames[idx].try_stack;
        if !self.heap.is_array(arr) {
            arr = self.heap.mk_dense_array(Val::NULL);
            self.frames[idx].try_stack = arr;
        }
        let packed = lblock_pack(target, tag, self.stack.len());
        self.heap.array_push(arr, Val::number(packed));
    }

    fn try_pop(&mut self) -> ExecResult<()> {
        let idx = self.innermost_private_idx();
        let arr = self.frames[idx].try_stack;
        let len = self.heap.array_length(arr);
        if !self.heap.is_array(arr) || len == 0 {
            return Err(ExecError::Internal(
                "TRY_POP with an empty try stack".to_string(),
            ));
        }
        self.heap.array_del(arr, len - 1);
        Ok(())
    }

    /// Scans the current frame's try-stack for a block in `wanted`,
    /// popping non-matching entries. On a match, transfers control to the
    /// recorded offset (optionally restoring the recorded stack size) and
    /// leaves the matched entry in place for the landing site's
    /// `TRY_POP`.
    fn unwind_local_blocks(
        &mut self,
        r: &mut Regs,
        wanted: u8,
        restore_stack_size: bool,
    ) -> Option<BlockTag> {
        let idx = self.innermost_private_idx();
        let arr = self.frames[idx].try_stack;
        if !self.heap.is_array(arr) {
            return None;
        }
        loop {
            let len = self.heap.array_length(arr);
            if len == 0 {
                return None;
            }
            let packed = self.heap.array_get(arr, len - 1).as_f64();
            let (offset, tag, stack_size) = lblock_unpack(packed);
            if block_bit(tag) & wanted != 0 {
                r.pc = offset as usize;
                if restore_stack_size && stack_size < self.stack.len() {
                    self.stack.truncate(stack_size);
                }
                return Some(tag);
            }
            self.heap.array_del(arr, len - 1);
        }
    }

    /// Drops the top call frame, restoring the data stack and, for bcode
    /// frames, the caller's registers. Returns the dropped frame's mask.
    fn unwind_stack_1level(&mut self, r: &mut Regs) -> u8 {
        let frame = self.frames.pop().expect("call stack not empty");
        let mask = frame.type_mask;
        if mask & FRAME_PRIVATE != 0 {
            self.stack.truncate(frame.saved_stack_len.min(self.stack.len()));
        }
        if mask & FRAME_BCODE != 0 {
            if let Some(caller) = self
                .frames
                .iter()
                .rev()
                .find(|f| f.type_mask & FRAME_BCODE != 0)
            {
                let bcode = Rc::clone(caller.bcode.as_ref().expect("bcode frame has bcode"));
                r.end = bcode.ops.len();
                r.bcode = bcode;
            }
            r.pc = frame.saved_ops;
        }
        mask
    }

    fn perform_return(&mut self, r: &mut Regs, take_retval: bool) -> ExecResult<()> {
        debug_assert!(take_retval || self.is_returned);
        if take_retval {
            self.vals.returned_value = self.pop();
            self.is_returned = true;
            // Returning dismisses any error being thrown (e.g. a return
            // inside finally).
            self.is_thrown = false;
            self.vals.thrown_error = Val::UNDEFINED;
        }
        loop {
            if self
                .unwind_local_blocks(r, BLOCK_FINALLY, false)
                .is_some()
            {
                return Ok(());
            }
            if self.frames.len() <= self.bottom_frame + 1 {
                return Err(ExecError::Internal(
                    "return unwound past the bottom frame".to_string(),
                ));
            }
            if self.unwind_stack_1level(r) & FRAME_BCODE != 0 {
                let v = self.vals.returned_value;
                self.push(v);
                self.is_returned = false;
                self.vals.returned_value = Val::UNDEFINED;
                return Ok(());
            }
        }
    }

    pub(crate) fn perform_throw(&mut self, r: &mut Regs, take_thrown: bool) -> ExecResult<()> {
        debug_assert!(take_thrown || self.is_thrown);
        if take_thrown {
            self.vals.thrown_error = self.pop();
            self.is_thrown = true;
            self.is_returned = false;
            self.vals.returned_value = Val::UNDEFINED;
        }
        loop {
            match self.unwind_local_blocks(r, BLOCK_CATCH | BLOCK_FINALLY, true) {
                Some(BlockTag::Catch) => {
                    let v = self.vals.thrown_error;
                    self.push(v);
                    self.is_thrown = false;
                    self.vals.thrown_error = Val::UNDEFINED;
                    return Ok(());
                }
                Some(_) => return Ok(()), // entering finally with the throw latched
                None => {
                    if self.frames.len() - 1 > self.bottom_frame {
                        self.unwind_stack_1level(r);
                    } else {
                        // Reached the bottom: uncaught exception.
                        return Err(ExecError::Exception);
                    }
                }
            }
        }
    }

    fn perform_break(&mut self, r: &mut Regs) -> ExecResult<()> {
        self.is_breaking = false;
        let wanted = if self.is_continuing {
            BLOCK_LOOP
        } else {
            BLOCK_LOOP | BLOCK_SWITCH
        };
        loop {
            match self.unwind_local_blocks(r, wanted | BLOCK_FINALLY, false) {
                Some(BlockTag::Finally) => {
                    self.is_breaking = true;
                    return Ok(());
                }
                Some(_) => return Ok(()),
                None => {
                    if self.frames.len() <= self.bottom_frame + 1 {
                        return Err(ExecError::Internal(
                            "break outside any loop or switch".to_string(),
                        ));
                    }
                    let mask = self.unwind_stack_1level(r);
                    debug_assert_eq!(mask, FRAME_PRIVATE);
                }
            }
        }
    }

    // ---- GC ----

    /// Runs a collection with the VM state as roots, then invokes any
    /// destructors of reclaimed objects.
    pub fn run_gc(&mut self, r: Option<&Regs>) -> ExecResult<()> {
        let current_bcode = r.map(|r| Rc::clone(&r.bcode));
        let stats = {
            let Engine {
                heap,
                stack,
                frames,
                vals,
                active_bcodes,
                cfunc_args,
                ..
            } = self;
            let mut roots = VmRoots {
                stack,
                frames,
                vals,
                active_bcodes,
                cfunc_args,
                current_bcode: current_bcode.as_ref(),
            };
            heap.gc(&mut roots)
                .map_err(|e| ExecError::Internal(format!("gc failed: {:?}", e)))?
        };
        for (dtor, data) in stats.destructors {
            if let ValKind::CFunction(idx) = dtor.kind() {
                if let Some(&f) = self.cfuncs.get(idx as usize) {
                    let args = self.heap.mk_dense_array(Val::NULL);
                    self.heap.array_push(args, data);
                    let saved = std::mem::replace(&mut self.cfunc_args, args);
                    let _ = f(self);
                    self.cfunc_args = saved;
                    self.clear_thrown();
                }
            }
        }
        Ok(())
    }
}

struct VmRoots<'a> {
    stack: &'a mut Vec<Val>,
    frames: &'a mut Vec<CallFrame>,
    vals: &'a mut crate::engine::EngineVals,
    active_bcodes: &'a Vec<Rc<Bcode>>,
    cfunc_args: &'a mut Val,
    current_bcode: Option<&'a Rc<Bcode>>,
}

impl<'a> GcRoots for VmRoots<'a> {
    fn visit_slots(&mut self, f: &mut dyn FnMut(&mut Val)) {
        for v in self.stack.iter_mut() {
            f(v);
        }
        for frame in self.frames.iter_mut() {
            f(&mut frame.scope);
            f(&mut frame.try_stack);
            f(&mut frame.this_val);
        }
        f(&mut self.vals.global_object);
        f(&mut self.vals.thrown_error);
        f(&mut self.vals.returned_value);
        f(&mut self.vals.stash);
        for v in self.vals.last_name.iter_mut() {
            f(v);
        }
        f(self.cfunc_args);
    }

    fn visit_bcodes(&mut self, f: &mut dyn FnMut(&Rc<Bcode>)) {
        for frame in self.frames.iter() {
            if let Some(b) = &frame.bcode {
                f(b);
            }
        }
        for b in self.active_bcodes.iter() {
            f(b);
        }
        if let Some(b) = self.current_bcode {
            f(b);
        }
    }
}
