//! AST to bytecode lowering.
//!
//! Expressions are emitted post-order with the operator's opcode last;
//! short-circuit forms and control flow patch jump targets after the fact.
//! Loops, switches and try blocks are all protected by try-stack entries
//! so that `break`, `continue`, `return` and `throw` share one unwinding
//! mechanism in the VM.

use std::rc::Rc;

use bytecode_system::{Bcode, BcodeBuilder, Opcode};
use core_types::{ExecError, ExecResult, Val};
use memory_manager::Heap;

use crate::ast::{
    Ast, AstTag, SKIP_DOWHILE_COND, SKIP_END, SKIP_FOR_BODY, SKIP_FUNC_BODY, SKIP_IF_TRUE_END,
    SKIP_SWITCH_DEFAULT, SKIP_TRY_CATCH, SKIP_TRY_FINALLY, SKIP_VAR_NEXT,
};
use crate::lexer::parse_js_number;

/// Compiles a parsed script into bcode. Strict mode is taken from a
/// leading `'use strict'` directive. With `precompile` set, function and
/// regexp literals are inlined into `ops` (required for serialization)
/// instead of being constructed in the heap.
pub fn compile_script(
    ast: &Ast,
    heap: &mut Heap,
    filename: Option<Rc<str>>,
    precompile: bool,
) -> ExecResult<Rc<Bcode>> {
    let mut pos = 0;
    let tag = ast.fetch_tag(&mut pos);
    if tag != AstTag::Script {
        return Err(ExecError::Internal("AST root is not a script".to_string()));
    }
    let script_pos = pos;
    let end = ast.get_skip(script_pos, SKIP_END);
    ast.move_to_children(&mut pos);

    let strict = first_stmt_is_use_strict(ast, pos, end);
    let mut bb = BcodeBuilder::new(strict, filename);
    let mut c = Compiler {
        ast,
        heap,
        cur_line: 0,
        precompile,
    };
    let func_decls = c.hoist_names(&mut bb, script_pos)?;

    bb.op(Opcode::PushUndefined);
    c.emit_hoisted_functions(&mut bb, &func_decls)?;
    let mut p = pos;
    while p < end {
        c.compile_stmt(&mut bb, &mut p, true)?;
    }
    Ok(Rc::new(bb.finalize()))
}

/// Compiles a JSON-mode AST: a single expression whose value is the
/// result of the bcode.
pub fn compile_json_expr(
    ast: &Ast,
    heap: &mut Heap,
    filename: Option<Rc<str>>,
) -> ExecResult<Rc<Bcode>> {
    let mut bb = BcodeBuilder::new(false, filename);
    let mut c = Compiler {
        ast,
        heap,
        cur_line: 0,
        precompile: false,
    };
    let mut pos = 0;
    c.compile_expr(&mut bb, &mut pos)?;
    Ok(Rc::new(bb.finalize()))
}

fn first_stmt_is_use_strict(ast: &Ast, pos: usize, end: usize) -> bool {
    if pos >= end {
        return false;
    }
    let mut p = pos;
    ast.fetch_tag(&mut p) == AstTag::UseStrict
}

fn syn(msg: impl Into<String>) -> ExecError {
    ExecError::Syntax(msg.into())
}

struct Compiler<'a> {
    ast: &'a Ast,
    heap: &'a mut Heap,
    cur_line: u32,
    precompile: bool,
}

impl<'a> Compiler<'a> {
    /// Walks the hoisting chain of a `SCRIPT` or `FUNC` node and adds
    /// every declared name to the builder's names section. Must run
    /// before any opcode is emitted. Returns the hoisted function
    /// declarations as `(name, FUNC node offset)` pairs, in source order.
    fn hoist_names(
        &mut self,
        bb: &mut BcodeBuilder,
        fpos: usize,
    ) -> ExecResult<Vec<(Vec<u8>, usize)>> {
        let mut func_decls = Vec::new();
        let mut v = self.ast.get_skip(fpos, SKIP_VAR_NEXT);
        while v != fpos {
            // `v` is one past a VAR node's tag.
            let var_end = self.ast.get_skip(v, SKIP_END);
            let mut p = v;
            self.ast.move_to_children(&mut p);
            while p < var_end {
                let decl_tag_off = p;
                let tag = self.ast.fetch_tag(&mut p);
                if matches!(tag, AstTag::VarDecl | AstTag::FuncDecl) {
                    let name = self.ast.get_inlined_data(p).to_vec();
                    if tag == AstTag::FuncDecl {
                        let mut fp = p;
                        self.ast.move_to_children(&mut fp);
                        func_decls.push((name.clone(), fp));
                    }
                    if !bb.has_name(&name) {
                        bb.add_name(&name)?;
                    }
                }
                p = decl_tag_off;
                self.ast.skip_tree(&mut p);
            }
            let next = self.ast.get_skip(v, SKIP_VAR_NEXT);
            if next == v {
                break;
            }
            v = next;
        }
        Ok(func_decls)
    }

    /// Emits the hoisted function-declaration initializations: function
    /// values exist before any statement of the enclosing body runs.
    fn emit_hoisted_functions(
        &mut self,
        bb: &mut BcodeBuilder,
        func_decls: &[(Vec<u8>, usize)],
    ) -> ExecResult<()> {
        for (name, func_pos) in func_decls {
            let mut pos = *func_pos;
            self.compile_expr(bb, &mut pos)?;
            let lit = bb.add_lit_str(name);
            bb.op_lit(Opcode::SetVar, &lit);
            bb.op(Opcode::Drop);
        }
        Ok(())
    }

    fn emit_lineno(&mut self, bb: &mut BcodeBuilder, node_pos: usize) {
        let line = self.ast.get_line_no(node_pos);
        if line != 0 && line != self.cur_line {
            bb.append_lineno(line);
            self.cur_line = line;
        }
    }

    /// Compiles one statement. At script level, expression statements
    /// replace the accumulated script result via `SWAP_DROP`; in function
    /// bodies their value is dropped.
    fn compile_stmt(
        &mut self,
        bb: &mut BcodeBuilder,
        pos: &mut usize,
        script_level: bool,
    ) -> ExecResult<()> {
        let tag_off = *pos;
        let tag = self.ast.fetch_tag(pos);
        self.emit_lineno(bb, *pos);
        match tag {
            AstTag::Nop | AstTag::Debugger | AstTag::UseStrict => {
                if tag == AstTag::UseStrict {
                    bb.set_strict_mode();
                }
                self.ast.move_to_children(pos);
                Ok(())
            }
            AstTag::Var => self.compile_var(bb, pos),
            AstTag::If => {
                let npos = *pos;
                let true_end = self.ast.get_skip(npos, SKIP_IF_TRUE_END);
                let end = self.ast.get_skip(npos, SKIP_END);
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                let lbl_false = bb.op_target(Opcode::JmpFalse);
                while *pos < true_end {
                    self.compile_stmt(bb, pos, script_level)?;
                }
                if true_end != end {
                    let lbl_end = bb.op_target(Opcode::Jmp);
                    bb.patch_target(lbl_false, bb.pos());
                    while *pos < end {
                        self.compile_stmt(bb, pos, script_level)?;
                    }
                    bb.patch_target(lbl_end, bb.pos());
                } else {
                    bb.patch_target(lbl_false, bb.pos());
                }
                Ok(())
            }
            AstTag::While => {
                let npos = *pos;
                let end = self.ast.get_skip(npos, SKIP_END);
                self.ast.move_to_children(pos);
                let mut cond_pos = *pos;
                self.ast.skip_tree(pos); // over the condition

                // Body first, condition after: the entry jump reaches the
                // condition, which loops back while truthy.
                let lbl_try = bb.op_target(Opcode::TryPushLoop);
                let lbl_to_cond = bb.op_target(Opcode::Jmp);
                let body_target = bb.pos();
                while *pos < end {
                    self.compile_stmt(bb, pos, script_level)?;
                }
                let cond_target = bb.pos();
                bb.patch_target(lbl_to_cond, cond_target);
                self.compile_expr(bb, &mut cond_pos)?;
                let lbl_back = bb.op_target(Opcode::JmpTrue);
                bb.patch_target(lbl_back, body_target);
                bb.patch_target(lbl_try, bb.pos());
                let lbl_cont = bb.op_target(Opcode::JmpIfContinue);
                bb.patch_target(lbl_cont, cond_target);
                bb.op(Opcode::TryPop);
                Ok(())
            }
            AstTag::DoWhile => {
                let npos = *pos;
                let cond_skip = self.ast.get_skip(npos, SKIP_DOWHILE_COND);
                self.ast.move_to_children(pos);

                let lbl_try = bb.op_target(Opcode::TryPushLoop);
                let body_target = bb.pos();
                while *pos < cond_skip {
                    self.compile_stmt(bb, pos, script_level)?;
                }
                let cond_target = bb.pos();
                self.compile_expr(bb, pos)?;
                let lbl_back = bb.op_target(Opcode::JmpTrue);
                bb.patch_target(lbl_back, body_target);
                bb.patch_target(lbl_try, bb.pos());
                let lbl_cont = bb.op_target(Opcode::JmpIfContinue);
                bb.patch_target(lbl_cont, cond_target);
                bb.op(Opcode::TryPop);
                Ok(())
            }
            AstTag::For => {
                let npos = *pos;
                let body_skip = self.ast.get_skip(npos, SKIP_FOR_BODY);
                let end = self.ast.get_skip(npos, SKIP_END);
                self.ast.move_to_children(pos);

                // init
                self.compile_stmt_like_init(bb, pos)?;
                // Remember cond and iter subtree positions, then emit in
                // execution order: body, iter, cond.
                let cond_pos = *pos;
                self.ast.skip_tree(pos);
                let iter_pos = *pos;
                self.ast.skip_tree(pos);
                debug_assert!(*pos <= body_skip);
                *pos = body_skip;

                let lbl_try = bb.op_target(Opcode::TryPushLoop);
                let lbl_to_cond = bb.op_target(Opcode::Jmp);
                let body_target = bb.pos();
                while *pos < end {
                    self.compile_stmt(bb, pos, script_level)?;
                }
                let iter_target = bb.pos();
                {
                    let mut ip = iter_pos;
                    if !self.node_is_nop(ip) {
                        self.compile_expr(bb, &mut ip)?;
                        bb.op(Opcode::Drop);
                    }
                }
                bb.patch_target(lbl_to_cond, bb.pos());
                {
                    let mut cp = cond_pos;
                    if self.node_is_nop(cp) {
                        bb.op(Opcode::PushTrue);
                    } else {
                        self.compile_expr(bb, &mut cp)?;
                    }
                }
                let lbl_back = bb.op_target(Opcode::JmpTrue);
                bb.patch_target(lbl_back, body_target);
                bb.patch_target(lbl_try, bb.pos());
                let lbl_cont = bb.op_target(Opcode::JmpIfContinue);
                bb.patch_target(lbl_cont, iter_target);
                bb.op(Opcode::TryPop);
                Ok(())
            }
            AstTag::ForIn => {
                let npos = *pos;
                let end = self.ast.get_skip(npos, SKIP_END);
                self.ast.move_to_children(pos);

                // Loop variable: `var x` or a plain identifier.
                let target_name = self.for_in_target(pos)?;
                // Object expression.
                self.compile_expr(bb, pos)?;
                // Dummy third subtree.
                self.ast.skip_tree(pos);

                bb.op(Opcode::PushNull); // initial iteration handle
                let lbl_try = bb.op_target(Opcode::TryPushLoop);
                let loop_target = bb.pos();
                bb.op(Opcode::NextProp);
                let lbl_out = bb.op_target(Opcode::JmpFalse);
                let name_lit = bb.add_lit_str(&target_name);
                bb.op_lit(Opcode::SetVar, &name_lit);
                bb.op(Opcode::Drop);
                while *pos < end {
                    self.compile_stmt(bb, pos, script_level)?;
                }
                let lbl_back = bb.op_target(Opcode::Jmp);
                bb.patch_target(lbl_back, loop_target);
                bb.patch_target(lbl_out, bb.pos());
                bb.op(Opcode::Drop); // leftover key slot
                bb.patch_target(lbl_try, bb.pos());
                let lbl_cont = bb.op_target(Opcode::JmpIfContinue);
                bb.patch_target(lbl_cont, loop_target);
                bb.op(Opcode::TryPop);
                bb.op(Opcode::Drop); // handle
                bb.op(Opcode::Drop); // object
                Ok(())
            }
            AstTag::Try => self.compile_try(bb, pos, script_level),
            AstTag::Switch => self.compile_switch(bb, pos, script_level),
            AstTag::ValueReturn => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Ret);
                Ok(())
            }
            AstTag::Return => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::PushUndefined);
                bb.op(Opcode::Ret);
                Ok(())
            }
            AstTag::Throw => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Throw);
                Ok(())
            }
            AstTag::Break => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::Break);
                Ok(())
            }
            AstTag::Continue => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::Continue);
                Ok(())
            }
            AstTag::Label => {
                // The label itself compiles to nothing; only the bare
                // break/continue forms are supported.
                self.ast.move_to_children(pos);
                Ok(())
            }
            AstTag::LabeledBreak | AstTag::LabeledContinue => {
                Err(syn("labeled break and continue are not supported"))
            }
            AstTag::With => Err(syn("with statement is not supported")),
            _ => {
                // Expression statement.
                *pos = tag_off;
                self.compile_expr(bb, pos)?;
                if script_level {
                    bb.op(Opcode::SwapDrop);
                } else {
                    bb.op(Opcode::Drop);
                }
                Ok(())
            }
        }
    }

    fn node_is_nop(&self, pos: usize) -> bool {
        AstTag::from_byte(self.ast.buf[pos]).0 == AstTag::Nop
    }

    /// Compiles a `for` initializer: a VAR node, a NOP, or an expression
    /// whose value is dropped.
    fn compile_stmt_like_init(&mut self, bb: &mut BcodeBuilder, pos: &mut usize) -> ExecResult<()> {
        let tag_off = *pos;
        let tag = self.ast.fetch_tag(pos);
        match tag {
            AstTag::Nop => {
                self.ast.move_to_children(pos);
                Ok(())
            }
            AstTag::Var => self.compile_var(bb, pos),
            _ => {
                *pos = tag_off;
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Drop);
                Ok(())
            }
        }
    }

    /// Reads the for-in loop target, returning the variable name.
    fn for_in_target(&mut self, pos: &mut usize) -> ExecResult<Vec<u8>> {
        let tag_off = *pos;
        let tag = self.ast.fetch_tag(pos);
        match tag {
            AstTag::Var => {
                let var_end = self.ast.get_skip(*pos, SKIP_END);
                self.ast.move_to_children(pos);
                let decl_tag = self.ast.fetch_tag(pos);
                if decl_tag != AstTag::VarDecl {
                    return Err(syn("invalid for-in variable"));
                }
                let name = self.ast.get_inlined_data(*pos).to_vec();
                *pos = tag_off;
                self.ast.skip_tree(pos);
                debug_assert_eq!(*pos, var_end);
                Ok(name)
            }
            AstTag::Ident => {
                let name = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                Ok(name)
            }
            _ => Err(syn("unsupported for-in target")),
        }
    }

    fn compile_var(&mut self, bb: &mut BcodeBuilder, pos: &mut usize) -> ExecResult<()> {
        let var_end = self.ast.get_skip(*pos, SKIP_END);
        self.ast.move_to_children(pos);
        while *pos < var_end {
            let tag = self.ast.fetch_tag(pos);
            match tag {
                AstTag::VarDecl => {
                    let name = self.ast.get_inlined_data(*pos).to_vec();
                    self.ast.move_to_children(pos);
                    if self.node_is_nop(*pos) {
                        // Declaration without initializer: the name is
                        // already set to undefined at frame entry.
                        self.ast.skip_tree(pos);
                    } else {
                        self.compile_expr(bb, pos)?;
                        let lit = bb.add_lit_str(&name);
                        bb.op_lit(Opcode::SetVar, &lit);
                        bb.op(Opcode::Drop);
                    }
                }
                AstTag::FuncDecl => {
                    // Already initialized by the hoisting prologue.
                    self.ast.move_to_children(pos);
                    self.ast.skip_tree(pos);
                }
                _ => return Err(syn("malformed var declaration")),
            }
        }
        Ok(())
    }

    fn compile_try(
        &mut self,
        bb: &mut BcodeBuilder,
        pos: &mut usize,
        script_level: bool,
    ) -> ExecResult<()> {
        let npos = *pos;
        let catch_skip = self.ast.get_skip(npos, SKIP_TRY_CATCH);
        let finally_skip = self.ast.get_skip(npos, SKIP_TRY_FINALLY);
        let end = self.ast.get_skip(npos, SKIP_END);
        let has_catch = catch_skip != finally_skip;
        let has_finally = finally_skip != end;
        self.ast.move_to_children(pos);

        let lbl_finally = if has_finally {
            Some(bb.op_target(Opcode::TryPushFinally))
        } else {
            None
        };
        let lbl_catch = if has_catch {
            Some(bb.op_target(Opcode::TryPushCatch))
        } else {
            None
        };

        while *pos < catch_skip {
            self.compile_stmt(bb, pos, script_level)?;
        }

        let mut lbl_past_catch = None;
        if has_catch {
            bb.op(Opcode::TryPop);
            lbl_past_catch = Some(bb.op_target(Opcode::Jmp));
            bb.patch_target(lbl_catch.unwrap(), bb.pos());
            bb.op(Opcode::TryPop);
            // The thrown value is on the stack; bind it in a fresh scope.
            let name_tag = self.ast.fetch_tag(pos);
            if name_tag != AstTag::Ident {
                return Err(syn("malformed catch clause"));
            }
            let name = self.ast.get_inlined_data(*pos).to_vec();
            self.ast.move_to_children(pos);
            let lit = bb.add_lit_str(&name);
            bb.op_lit(Opcode::EnterCatch, &lit);
            while *pos < finally_skip {
                self.compile_stmt(bb, pos, script_level)?;
            }
            bb.op(Opcode::ExitCatch);
        }
        if let Some(l) = lbl_past_catch {
            bb.patch_target(l, bb.pos());
        }

        if has_finally {
            bb.patch_target(lbl_finally.unwrap(), bb.pos());
            bb.op(Opcode::TryPop);
            while *pos < end {
                self.compile_stmt(bb, pos, script_level)?;
            }
            bb.op(Opcode::AfterFinally);
        }
        *pos = end;
        Ok(())
    }

    fn compile_switch(
        &mut self,
        bb: &mut BcodeBuilder,
        pos: &mut usize,
        script_level: bool,
    ) -> ExecResult<()> {
        let npos = *pos;
        let end = self.ast.get_skip(npos, SKIP_END);
        let default_off = self.ast.get_skip(npos, SKIP_SWITCH_DEFAULT);
        let has_default = default_off != npos;
        self.ast.move_to_children(pos);

        self.compile_expr(bb, pos)?;
        let lbl_try = bb.op_target(Opcode::TryPushSwitch);

        // First pass: emit the dispatch comparisons for each case.
        let mut case_labels = Vec::new();
        {
            let mut p = *pos;
            while p < end {
                let case_tag_off = p;
                let tag = self.ast.fetch_tag(&mut p);
                match tag {
                    AstTag::Case => {
                        let case_end = self.ast.get_skip(p, SKIP_END);
                        self.ast.move_to_children(&mut p);
                        bb.op(Opcode::Dup);
                        self.compile_expr(bb, &mut p)?;
                        bb.op(Opcode::EqEq);
                        case_labels.push((case_tag_off, bb.op_target(Opcode::JmpTrueDrop)));
                        p = case_end;
                    }
                    AstTag::Default => {
                        p = self.ast.get_skip(p, SKIP_END);
                    }
                    _ => return Err(syn("malformed switch body")),
                }
            }
        }
        bb.op(Opcode::Drop); // selector did not match any case
        let lbl_no_match = bb.op_target(Opcode::Jmp);

        // Second pass: emit case and default bodies in source order, so
        // fall-through works.
        let mut default_target = None;
        let mut p = *pos;
        while p < end {
            let case_tag_off = p;
            let tag = self.ast.fetch_tag(&mut p);
            let body_end = self.ast.get_skip(p, SKIP_END);
            match tag {
                AstTag::Case => {
                    self.ast.move_to_children(&mut p);
                    self.ast.skip_tree(&mut p); // case value, already emitted
                    let target = bb.pos();
                    if let Some((_, lbl)) = case_labels.iter().find(|(off, _)| *off == case_tag_off)
                    {
                        bb.patch_target(*lbl, target);
                    }
                    while p < body_end {
                        self.compile_stmt(bb, &mut p, script_level)?;
                    }
                }
                AstTag::Default => {
                    self.ast.move_to_children(&mut p);
                    default_target = Some(bb.pos());
                    while p < body_end {
                        self.compile_stmt(bb, &mut p, script_level)?;
                    }
                }
                _ => return Err(syn("malformed switch body")),
            }
            p = body_end;
        }
        let exit = bb.pos();
        bb.patch_target(lbl_try, exit);
        bb.patch_target(
            lbl_no_match,
            if has_default {
                default_target.ok_or_else(|| syn("malformed switch default"))?
            } else {
                exit
            },
        );
        bb.op(Opcode::TryPop);
        *pos = end;
        Ok(())
    }

    // ---- expressions ----

    fn compile_expr(&mut self, bb: &mut BcodeBuilder, pos: &mut usize) -> ExecResult<()> {
        let tag_off = *pos;
        let tag = self.ast.fetch_tag(pos);
        self.emit_lineno(bb, *pos);
        match tag {
            AstTag::Num => {
                let raw = self.ast.get_inlined_data(*pos);
                let n = parse_js_number(std::str::from_utf8(raw).unwrap_or(""))
                    .ok_or_else(|| syn("invalid number literal"))?;
                self.ast.move_to_children(pos);
                if n == 0.0 && n.is_sign_positive() {
                    bb.op(Opcode::PushZero);
                } else if n == 1.0 {
                    bb.op(Opcode::PushOne);
                } else {
                    let lit = bb.add_lit_num(n);
                    bb.push_lit(&lit);
                }
                Ok(())
            }
            AstTag::Str => {
                let s = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                let lit = bb.add_lit_str(&s);
                bb.push_lit(&lit);
                Ok(())
            }
            AstTag::Regex => {
                let text = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                let (source, flags) = split_regex_literal(&text)?;
                if self.precompile {
                    // Validate now, embed the source form; the VM builds
                    // the value when the literal is first pushed.
                    self.heap
                        .mk_regexp(source, flags)
                        .map_err(ExecError::Syntax)?;
                    bb.push_inline_regexp(source.as_bytes(), flags.as_bytes());
                } else {
                    let v = self
                        .heap
                        .mk_regexp(source, flags)
                        .map_err(ExecError::Syntax)?;
                    let lit = bb.add_lit_val(v);
                    bb.push_lit(&lit);
                }
                Ok(())
            }
            AstTag::Ident => {
                let name = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                let lit = bb.add_lit_str(&name);
                bb.op_lit(Opcode::GetVar, &lit);
                Ok(())
            }
            AstTag::This => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::PushThis);
                Ok(())
            }
            AstTag::True => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::PushTrue);
                Ok(())
            }
            AstTag::False => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::PushFalse);
                Ok(())
            }
            AstTag::Null => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::PushNull);
                Ok(())
            }
            AstTag::Undefined => {
                self.ast.move_to_children(pos);
                bb.op(Opcode::PushUndefined);
                Ok(())
            }
            AstTag::Func => {
                *pos = tag_off;
                let child = self.compile_function(bb.strict_mode(), bb.filename(), pos)?;
                if self.precompile {
                    let body = crate::bcode_file::func_bytes(&child)?;
                    bb.push_inline_func(&body);
                } else {
                    let func_val = self.heap.mk_function(Val::UNDEFINED, child);
                    let lit = bb.add_lit_val(func_val);
                    bb.push_lit(&lit);
                }
                bb.op(Opcode::FuncLit);
                Ok(())
            }
            AstTag::Seq => {
                let end = self.ast.get_skip(*pos, SKIP_END);
                self.ast.move_to_children(pos);
                let mut first = true;
                while *pos < end {
                    if !first {
                        bb.op(Opcode::Drop);
                    }
                    self.compile_expr(bb, pos)?;
                    first = false;
                }
                Ok(())
            }
            AstTag::LogicalAnd | AstTag::LogicalOr => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Dup);
                let lbl = if tag == AstTag::LogicalAnd {
                    bb.op_target(Opcode::JmpFalse)
                } else {
                    bb.op_target(Opcode::JmpTrue)
                };
                bb.op(Opcode::Drop);
                self.compile_expr(bb, pos)?;
                bb.patch_target(lbl, bb.pos());
                Ok(())
            }
            AstTag::Cond => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                let lbl_false = bb.op_target(Opcode::JmpFalse);
                self.compile_expr(bb, pos)?;
                let lbl_end = bb.op_target(Opcode::Jmp);
                bb.patch_target(lbl_false, bb.pos());
                self.compile_expr(bb, pos)?;
                bb.patch_target(lbl_end, bb.pos());
                Ok(())
            }
            AstTag::Add
            | AstTag::Sub
            | AstTag::Mul
            | AstTag::Div
            | AstTag::Rem
            | AstTag::Lshift
            | AstTag::Rshift
            | AstTag::Urshift
            | AstTag::Or
            | AstTag::Xor
            | AstTag::And
            | AstTag::Eq
            | AstTag::EqEq
            | AstTag::Ne
            | AstTag::NeNe
            | AstTag::Lt
            | AstTag::Le
            | AstTag::Gt
            | AstTag::Ge
            | AstTag::In
            | AstTag::Instanceof => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                self.compile_expr(bb, pos)?;
                bb.op(binary_opcode(tag));
                Ok(())
            }
            AstTag::Positive => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Pos);
                Ok(())
            }
            AstTag::Negative => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Neg);
                Ok(())
            }
            AstTag::Not => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Not);
                Ok(())
            }
            AstTag::LogicalNot => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::LogicalNot);
                Ok(())
            }
            AstTag::Void => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Drop);
                bb.op(Opcode::PushUndefined);
                Ok(())
            }
            AstTag::Typeof => {
                self.ast.move_to_children(pos);
                // `typeof undeclared` must not throw.
                let inner_off = *pos;
                let inner_tag = AstTag::from_byte(self.ast.buf[inner_off]).0;
                if inner_tag == AstTag::Ident {
                    self.ast.fetch_tag(pos);
                    let name = self.ast.get_inlined_data(*pos).to_vec();
                    self.ast.move_to_children(pos);
                    let lit = bb.add_lit_str(&name);
                    bb.op_lit(Opcode::SafeGetVar, &lit);
                } else {
                    self.compile_expr(bb, pos)?;
                }
                bb.op(Opcode::Typeof);
                Ok(())
            }
            AstTag::Delete => {
                self.ast.move_to_children(pos);
                let inner_off = *pos;
                let inner_tag = self.ast.fetch_tag(pos);
                match inner_tag {
                    AstTag::Member => {
                        let name = self.ast.get_inlined_data(*pos).to_vec();
                        self.ast.move_to_children(pos);
                        self.compile_expr(bb, pos)?;
                        let lit = bb.add_lit_str(&name);
                        bb.push_lit(&lit);
                        bb.op(Opcode::Delete);
                    }
                    AstTag::Index => {
                        self.ast.move_to_children(pos);
                        self.compile_expr(bb, pos)?;
                        self.compile_expr(bb, pos)?;
                        bb.op(Opcode::Delete);
                    }
                    AstTag::Ident => {
                        let name = self.ast.get_inlined_data(*pos).to_vec();
                        self.ast.move_to_children(pos);
                        let lit = bb.add_lit_str(&name);
                        bb.op_lit(Opcode::DeleteVar, &lit);
                    }
                    _ => {
                        // Deleting a non-reference evaluates the operand
                        // and yields true.
                        *pos = inner_off;
                        self.compile_expr(bb, pos)?;
                        bb.op(Opcode::Drop);
                        bb.op(Opcode::PushTrue);
                    }
                }
                Ok(())
            }
            AstTag::Preinc | AstTag::Predec | AstTag::Postinc | AstTag::Postdec => {
                self.compile_incdec(bb, pos, tag)
            }
            AstTag::Assign => self.compile_assign(bb, pos, None),
            AstTag::PlusAssign => self.compile_assign(bb, pos, Some(Opcode::Add)),
            AstTag::MinusAssign => self.compile_assign(bb, pos, Some(Opcode::Sub)),
            AstTag::MulAssign => self.compile_assign(bb, pos, Some(Opcode::Mul)),
            AstTag::DivAssign => self.compile_assign(bb, pos, Some(Opcode::Div)),
            AstTag::RemAssign => self.compile_assign(bb, pos, Some(Opcode::Rem)),
            AstTag::AndAssign => self.compile_assign(bb, pos, Some(Opcode::And)),
            AstTag::OrAssign => self.compile_assign(bb, pos, Some(Opcode::Or)),
            AstTag::XorAssign => self.compile_assign(bb, pos, Some(Opcode::Xor)),
            AstTag::LshiftAssign => self.compile_assign(bb, pos, Some(Opcode::Lshift)),
            AstTag::RshiftAssign => self.compile_assign(bb, pos, Some(Opcode::Rshift)),
            AstTag::UrshiftAssign => self.compile_assign(bb, pos, Some(Opcode::Urshift)),
            AstTag::Member => {
                let name = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                let lit = bb.add_lit_str(&name);
                bb.push_lit(&lit);
                bb.op(Opcode::Get);
                Ok(())
            }
            AstTag::Index => {
                self.ast.move_to_children(pos);
                self.compile_expr(bb, pos)?;
                self.compile_expr(bb, pos)?;
                bb.op(Opcode::Get);
                Ok(())
            }
            AstTag::Call | AstTag::New => {
                let end = self.ast.get_skip(*pos, SKIP_END);
                self.ast.move_to_children(pos);
                // Receiver and callee.
                let callee_off = *pos;
                let callee_tag = AstTag::from_byte(self.ast.buf[callee_off]).0;
                if tag == AstTag::Call && callee_tag == AstTag::Member {
                    self.ast.fetch_tag(pos);
                    let name = self.ast.get_inlined_data(*pos).to_vec();
                    self.ast.move_to_children(pos);
                    self.compile_expr(bb, pos)?; // object
                    bb.op(Opcode::Dup);
                    let lit = bb.add_lit_str(&name);
                    bb.push_lit(&lit);
                    bb.op(Opcode::Get);
                } else if tag == AstTag::Call && callee_tag == AstTag::Index {
                    self.ast.fetch_tag(pos);
                    self.ast.move_to_children(pos);
                    self.compile_expr(bb, pos)?; // object
                    bb.op(Opcode::Dup);
                    self.compile_expr(bb, pos)?; // key
                    bb.op(Opcode::Get);
                } else {
                    bb.op(Opcode::PushUndefined); // this
                    self.compile_expr(bb, pos)?; // callee
                }
                bb.op(Opcode::CheckCall);
                let mut argc = 0usize;
                while *pos < end {
                    self.compile_expr(bb, pos)?;
                    argc += 1;
                }
                if argc > 255 {
                    return Err(syn("too many arguments in call"));
                }
                bb.op(if tag == AstTag::New {
                    Opcode::New
                } else {
                    Opcode::Call
                });
                bb.add_u8(argc as u8);
                Ok(())
            }
            AstTag::Array => {
                let end = self.ast.get_skip(*pos, SKIP_END);
                self.ast.move_to_children(pos);
                bb.op(Opcode::CreateArr);
                let mut index = 0usize;
                while *pos < end {
                    let elem_off = *pos;
                    let elem_tag = AstTag::from_byte(self.ast.buf[elem_off]).0;
                    if elem_tag == AstTag::Nop {
                        self.ast.fetch_tag(pos);
                        self.ast.move_to_children(pos);
                        index += 1;
                        continue;
                    }
                    bb.op(Opcode::Dup);
                    let lit = bb.add_lit_num(index as f64);
                    bb.push_lit(&lit);
                    self.compile_expr(bb, pos)?;
                    bb.op(Opcode::Set);
                    bb.op(Opcode::Drop);
                    index += 1;
                }
                Ok(())
            }
            AstTag::Object => {
                let end = self.ast.get_skip(*pos, SKIP_END);
                self.ast.move_to_children(pos);
                bb.op(Opcode::CreateObj);
                while *pos < end {
                    let prop_tag = self.ast.fetch_tag(pos);
                    match prop_tag {
                        AstTag::Prop => {
                            let name = self.ast.get_inlined_data(*pos).to_vec();
                            self.ast.move_to_children(pos);
                            bb.op(Opcode::Dup);
                            let lit = bb.add_lit_str(&name);
                            bb.push_lit(&lit);
                            self.compile_expr(bb, pos)?;
                            bb.op(Opcode::Set);
                            bb.op(Opcode::Drop);
                        }
                        AstTag::Getter | AstTag::Setter => {
                            return Err(syn(
                                "get/set accessors in object literals are not supported",
                            ));
                        }
                        _ => return Err(syn("malformed object literal")),
                    }
                }
                Ok(())
            }
            other => Err(syn(format!(
                "unexpected {} node in expression",
                other.def().name
            ))),
        }
    }


    /// Lowers pre/post increment and decrement. The result of the postfix
    /// forms is the numeric coercion of the old value, kept across the
    /// store via the stash register.
    fn compile_incdec(
        &mut self,
        bb: &mut BcodeBuilder,
        pos: &mut usize,
        tag: AstTag,
    ) -> ExecResult<()> {
        let op = if tag == AstTag::Preinc || tag == AstTag::Postinc {
            Opcode::Add
        } else {
            Opcode::Sub
        };
        let post = tag == AstTag::Postinc || tag == AstTag::Postdec;
        self.ast.move_to_children(pos);
        let target_off = *pos;
        let target_tag = self.ast.fetch_tag(pos);
        match target_tag {
            AstTag::Ident => {
                let name = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                let lit = bb.add_lit_str(&name);
                bb.op_lit(Opcode::GetVar, &lit);
                bb.op(Opcode::Pos);
                if post {
                    bb.op(Opcode::Dup);
                }
                bb.op(Opcode::PushOne);
                bb.op(op);
                bb.op_lit(Opcode::SetVar, &lit);
                if post {
                    bb.op(Opcode::Drop);
                }
                Ok(())
            }
            AstTag::Member | AstTag::Index => {
                if target_tag == AstTag::Member {
                    let name = self.ast.get_inlined_data(*pos).to_vec();
                    self.ast.move_to_children(pos);
                    self.compile_expr(bb, pos)?;
                    let lit = bb.add_lit_str(&name);
                    bb.push_lit(&lit);
                } else {
                    self.ast.move_to_children(pos);
                    self.compile_expr(bb, pos)?;
                    self.compile_expr(bb, pos)?;
                }
                bb.op(Opcode::TwoDup);
                bb.op(Opcode::Get);
                bb.op(Opcode::Pos);
                if post {
                    bb.op(Opcode::Stash);
                }
                bb.op(Opcode::PushOne);
                bb.op(op);
                bb.op(Opcode::Set);
                if post {
                    bb.op(Opcode::Unstash);
                }
                let _ = target_off;
                Ok(())
            }
            _ => Err(syn("invalid increment/decrement target")),
        }
    }

    fn compile_assign(
        &mut self,
        bb: &mut BcodeBuilder,
        pos: &mut usize,
        binop: Option<Opcode>,
    ) -> ExecResult<()> {
        self.ast.move_to_children(pos);
        let target_tag = self.ast.fetch_tag(pos);
        match target_tag {
            AstTag::Ident => {
                let name = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                let lit = bb.add_lit_str(&name);
                if let Some(op) = binop {
                    bb.op_lit(Opcode::GetVar, &lit);
                    self.compile_expr(bb, pos)?;
                    bb.op(op);
                } else {
                    self.compile_expr(bb, pos)?;
                }
                bb.op_lit(Opcode::SetVar, &lit);
                Ok(())
            }
            AstTag::Member | AstTag::Index => {
                if target_tag == AstTag::Member {
                    let name = self.ast.get_inlined_data(*pos).to_vec();
                    self.ast.move_to_children(pos);
                    self.compile_expr(bb, pos)?;
                    let lit = bb.add_lit_str(&name);
                    bb.push_lit(&lit);
                } else {
                    self.ast.move_to_children(pos);
                    self.compile_expr(bb, pos)?;
                    self.compile_expr(bb, pos)?;
                }
                if let Some(op) = binop {
                    bb.op(Opcode::TwoDup);
                    bb.op(Opcode::Get);
                    self.compile_expr(bb, pos)?;
                    bb.op(op);
                } else {
                    self.compile_expr(bb, pos)?;
                }
                bb.op(Opcode::Set);
                Ok(())
            }
            _ => Err(syn("invalid assignment target")),
        }
    }

    /// Compiles a `FUNC` node into its own bcode; `FUNC_LIT` completes
    /// instantiation (scope, prototype) at runtime.
    fn compile_function(
        &mut self,
        parent_strict: bool,
        filename: Option<Rc<str>>,
        pos: &mut usize,
    ) -> ExecResult<Rc<Bcode>> {
        let tag = self.ast.fetch_tag(pos);
        debug_assert_eq!(tag, AstTag::Func);
        let fpos = *pos;
        let body_skip = self.ast.get_skip(fpos, SKIP_FUNC_BODY);
        let end = self.ast.get_skip(fpos, SKIP_END);
        self.ast.move_to_children(pos);

        let saved_line = self.cur_line;
        self.cur_line = 0;

        // Strictness: inherited, or declared by the body's first node.
        let strict = parent_strict || first_stmt_is_use_strict(self.ast, body_skip, end);
        let mut bb = BcodeBuilder::new(strict, filename);

        // Function name, if present.
        let name_tag = self.ast.fetch_tag(pos);
        match name_tag {
            AstTag::Ident => {
                let name = self.ast.get_inlined_data(*pos).to_vec();
                self.ast.move_to_children(pos);
                bb.add_name(&name)?;
                bb.func_name_present = true;
            }
            AstTag::Nop => {
                self.ast.move_to_children(pos);
                bb.add_name(b"")?;
                bb.func_name_present = true;
            }
            _ => return Err(syn("malformed function node")),
        }

        // Parameters.
        let mut args_cnt = 0usize;
        while *pos < body_skip {
            let ptag = self.ast.fetch_tag(pos);
            if ptag != AstTag::Ident {
                return Err(syn("malformed parameter list"));
            }
            let pname = self.ast.get_inlined_data(*pos).to_vec();
            self.ast.move_to_children(pos);
            bb.add_name(&pname)?;
            args_cnt += 1;
        }
        bb.set_args_cnt(args_cnt)?;

        // Hoisted locals and nested function declarations.
        let func_decls = self.hoist_names(&mut bb, fpos)?;
        self.emit_hoisted_functions(&mut bb, &func_decls)?;

        // Body.
        *pos = body_skip;
        while *pos < end {
            self.compile_stmt(&mut bb, pos, false)?;
        }
        bb.op(Opcode::PushUndefined);
        bb.op(Opcode::Ret);

        self.cur_line = saved_line;
        *pos = end;

        Ok(Rc::new(bb.finalize()))
    }
}

fn split_regex_literal(text: &[u8]) -> ExecResult<(&str, &str)> {
    let s = std::str::from_utf8(text).map_err(|_| syn("invalid regex literal"))?;
    let body = s.strip_prefix('/').ok_or_else(|| syn("invalid regex literal"))?;
    let slash = body.rfind('/').ok_or_else(|| syn("invalid regex literal"))?;
    Ok((&body[..slash], &body[slash + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use bytecode_system::opcode::OP_LINE_NO;
    use memory_manager::HeapOptions;

    fn compile(src: &str) -> Rc<Bcode> {
        let ast = Parser::new(src).unwrap().parse().unwrap();
        let mut heap = Heap::new(HeapOptions::default());
        compile_script(&ast, &mut heap, None, false).unwrap()
    }

    /// Decodes the instruction stream into opcodes, skipping operands and
    /// line-number records.
    fn opcodes_of(b: &Bcode) -> Vec<Opcode> {
        let mut out = Vec::new();
        let mut pos = b.end_names();
        while pos < b.ops.len() {
            let byte = b.ops[pos];
            if byte >= OP_LINE_NO {
                let mut buf = [0u8; 8];
                let avail = (b.ops.len() - pos).min(8);
                buf[..avail].copy_from_slice(&b.ops[pos..pos + avail]);
                buf[0] = core_types::varint::msb_lsb_swap(buf[0]);
                let (_, llen) = core_types::varint::read_varint(&buf);
                pos += llen;
                continue;
            }
            let op = Opcode::from_u8(byte).expect("valid opcode");
            out.push(op);
            pos += 1;
            if op.has_lit_operand() {
                let (tag, llen) = core_types::varint::read_varint(&b.ops[pos..]);
                pos += llen;
                match tag {
                    0 => {
                        let (len, l2) = core_types::varint::read_varint(&b.ops[pos..]);
                        pos += l2 + len + 1;
                    }
                    1 => pos += 8,
                    _ => {}
                }
            } else if op.has_target_operand() {
                pos += 4;
            } else if op.has_argc_operand() {
                pos += 1;
            }
        }
        out
    }

    #[test]
    fn test_arithmetic_is_post_order() {
        let b = compile("1 + 2 * 3;");
        let ops = opcodes_of(&b);
        assert_eq!(
            ops,
            vec![
                Opcode::PushUndefined,
                Opcode::PushOne,
                Opcode::PushLit,
                Opcode::PushLit,
                Opcode::Mul,
                Opcode::Add,
                Opcode::SwapDrop,
            ]
        );
    }

    #[test]
    fn test_var_names_are_hoisted() {
        let b = compile("var a = 1; var b;");
        let names: Vec<&[u8]> = b.names().collect();
        assert_eq!(names, vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(b.locals_cnt(), 2);
    }

    #[test]
    fn test_function_names_section() {
        let b = compile("function f(x, y) { var z; }");
        // The script itself hoists `f`.
        let names: Vec<&[u8]> = b.names().collect();
        assert_eq!(names, vec![&b"f"[..]]);
        // The nested function bcode holds name, params, locals in order.
        let lits = b.lit.borrow();
        assert_eq!(lits.len(), 1);
        // (The literal is the half-done function; its bcode is checked
        // through the VM tests in the interpreter crate.)
    }

    #[test]
    fn test_loop_uses_try_stack() {
        let b = compile("while (1) { break; }");
        let ops = opcodes_of(&b);
        assert!(ops.contains(&Opcode::TryPushLoop));
        assert!(ops.contains(&Opcode::Break));
        assert!(ops.contains(&Opcode::JmpIfContinue));
        assert_eq!(
            ops.iter().filter(|o| **o == Opcode::TryPop).count(),
            1
        );
    }

    #[test]
    fn test_try_catch_finally_shape() {
        let b = compile("try { 1; } catch (e) { 2; } finally { 3; }");
        let ops = opcodes_of(&b);
        assert!(ops.contains(&Opcode::TryPushFinally));
        assert!(ops.contains(&Opcode::TryPushCatch));
        assert!(ops.contains(&Opcode::EnterCatch));
        assert!(ops.contains(&Opcode::ExitCatch));
        assert!(ops.contains(&Opcode::AfterFinally));
        // Two protected regions, each popped once on the normal path,
        // plus the pop at the catch landing site.
        assert_eq!(ops.iter().filter(|o| **o == Opcode::TryPop).count(), 3);
    }

    #[test]
    fn test_method_call_receiver() {
        let b = compile("o.m(1);");
        let ops = opcodes_of(&b);
        let expected = [
            Opcode::GetVar,
            Opcode::Dup,
            Opcode::PushLit,
            Opcode::Get,
            Opcode::CheckCall,
            Opcode::PushOne,
            Opcode::Call,
        ];
        let start = ops
            .iter()
            .position(|o| *o == Opcode::GetVar)
            .expect("receiver load");
        assert_eq!(&ops[start..start + expected.len()], &expected);
    }

    #[test]
    fn test_unsupported_constructs_error() {
        let check = |src: &str| {
            let ast = Parser::new(src).unwrap().parse().unwrap();
            let mut heap = Heap::new(HeapOptions::default());
            compile_script(&ast, &mut heap, None, false)
        };
        assert!(check("with (o) { a; }").is_err());
        assert!(check("x: while (1) { break x; }").is_err());
        assert!(check("var o = { get a() { return 1; } };").is_err());
    }

    #[test]
    fn test_strict_mode_flag() {
        assert!(compile("'use strict'; var a;").strict_mode);
        assert!(!compile("var a;").strict_mode);
    }

    #[test]
    fn test_json_expr_compiles() {
        let ast = Parser::new("{\"a\": [1, 2]}").unwrap().parse_json().unwrap();
        let mut heap = Heap::new(HeapOptions::default());
        let b = compile_json_expr(&ast, &mut heap, None).unwrap();
        let ops = opcodes_of(&b);
        assert_eq!(ops[0], Opcode::CreateObj);
        assert!(ops.contains(&Opcode::CreateArr));
    }

    #[test]
    fn test_line_number_records_present() {
        let b = compile("var a = 1;\nvar b = 2;");
        let code = &b.ops[b.end_names()..];
        assert!(code.iter().any(|byte| *byte >= OP_LINE_NO));
    }
}

fn binary_opcode(tag: AstTag) -> Opcode {
    match tag {
        AstTag::Add => Opcode::Add,
        AstTag::Sub => Opcode::Sub,
        AstTag::Mul => Opcode::Mul,
        AstTag::Div => Opcode::Div,
        AstTag::Rem => Opcode::Rem,
        AstTag::Lshift => Opcode::Lshift,
        AstTag::Rshift => Opcode::Rshift,
        AstTag::Urshift => Opcode::Urshift,
        AstTag::Or => Opcode::Or,
        AstTag::Xor => Opcode::Xor,
        AstTag::And => Opcode::And,
        AstTag::Eq => Opcode::Eq,
        AstTag::EqEq => Opcode::EqEq,
        AstTag::Ne => Opcode::Ne,
        AstTag::NeNe => Opcode::NeNe,
        AstTag::Lt => Opcode::Lt,
        AstTag::Le => Opcode::Le,
        AstTag::Gt => Opcode::Gt,
        AstTag::Ge => Opcode::Ge,
        AstTag::In => Opcode::In,
        AstTag::Instanceof => Opcode::Instanceof,
        _ => unreachable!("not a binary operator tag"),
    }
}
