//! ES5 parser producing the packed AST.
//!
//! The parser never recurses on the host stack: every production is a
//! frame on an explicit work stack, so worst-case stack depth is bounded
//! regardless of how deeply the source nests. Each frame variant carries
//! the production's locals (AST positions to patch, loop flags); "resume"
//! frames encode what to do when a sub-parse completes.

use core_types::SourcePosition;

use crate::ast::{
    Ast, AstTag, SKIP_DOWHILE_COND, SKIP_END, SKIP_FOR_BODY, SKIP_FUNC_BODY, SKIP_IF_TRUE_END,
    SKIP_SWITCH_DEFAULT, SKIP_TRY_CATCH, SKIP_TRY_FINALLY, SKIP_VAR_NEXT,
};
use crate::error::ParseError;
use crate::lexer::{Keyword, Lexer, Punct, Tok};

/// Upper bound on the explicit work stack; exceeding it means the source
/// nests deeper than any legitimate script.
const MAX_WORK_DEPTH: usize = 8192;

/// Highest binary-operator precedence level; levels above it are unary.
const MAX_BIN_LEVEL: u8 = 10;

/// Per-function (or script) parsing context: the hoisting chain and the
/// flags that used to be engine-wide globals.
struct FuncCtx {
    /// Position (one past the tag) of the `FUNC` or `SCRIPT` node.
    node_pos: usize,
    /// Position of the last `VAR` node linked into the hoisting chain.
    last_var: Option<usize>,
    /// Strict mode in effect.
    strict: bool,
    /// Whether this is a function body (enables `return`).
    is_function: bool,
    loop_depth: u32,
    switch_depth: u32,
}

/// What terminates a statement run.
#[derive(Debug, Clone, Copy, PartialEq)]
enum StmtsEnd {
    /// Until a closing brace, which is consumed.
    Brace,
    /// Until end of input.
    Eof,
    /// Until `case`, `default` or `}`, none of which is consumed.
    CaseBody,
}

/// One frame of the explicit parser stack.
#[derive(Debug)]
enum Work {
    Stmts(StmtsEnd),
    Stmt,
    ExpectSemicolon,
    SetSkip { pos: usize, skip: usize },
    ExitLoop,

    // Statements.
    IfAfterCond { pos: usize },
    IfAfterTrue { pos: usize },
    WhileAfterCond { pos: usize },
    DoWhileAfterBody { pos: usize },
    DoWhileClose { pos: usize },
    ForAfterInit { pos: usize },
    ForAfterCond { pos: usize },
    ForAfterIter { pos: usize },
    ForInAfterObj { pos: usize },
    VarLoop { vpos: usize, no_in: bool, semi: bool },
    VarAfterDecl { vpos: usize, no_in: bool, semi: bool },
    TryAfterBlock { pos: usize },
    TryAfterCatch { pos: usize },
    TryFinally { pos: usize },
    SwitchAfterExpr { pos: usize },
    SwitchBody { pos: usize },
    CaseAfterExpr { cpos: usize },
    WithAfterExpr { pos: usize },
    FuncEnd { fpos: usize },

    // Expressions.
    Expr,
    ExprNoIn,
    CommaLoop { start: usize, seq_pos: Option<usize>, no_in: bool },
    AssignExpr { no_in: bool },
    AssignTail { start: usize, no_in: bool },
    TernaryTail { start: usize, no_in: bool },
    TernaryColon { no_in: bool },
    BinExpr { level: u8, no_in: bool },
    BinLoop { level: u8, start: usize, no_in: bool },
    UnaryExpr,
    PostfixTail { start: usize },
    LeftHandSide,
    MemberNoCall,
    MemberTail { start: usize },
    MemberIndexEnd { start: usize },
    NewAfterCtor { pos: usize, allow_call: bool },
    NewArgs { pos: usize, allow_call: bool },
    CallTail { start: usize },
    CallIndexEnd { start: usize },
    CallArgs { pos: usize, start: usize },
    Primary,
    ExpectRParen,
    ArrayLit { pos: usize },
    ArrayAfterElem { pos: usize },
    ObjLit { pos: usize },
    ObjAfterProp { pos: usize },
    FuncLit { name: Option<Vec<u8>> },

    // JSON mode.
    JsonValue,
    JsonObj { pos: usize },
    JsonObjNext { pos: usize },
    JsonArrNext { pos: usize },
}

/// The ES5 parser.
pub struct Parser<'a> {
    lx: Lexer<'a>,
    ast: Ast,
    cur: Tok,
    nl_before: bool,
    cur_line: u32,
    work: Vec<Work>,
    funcs: Vec<FuncCtx>,
    last_line: u32,
    pending_line: Option<u32>,
}

impl<'a> Parser<'a> {
    /// Creates a parser over `src`.
    pub fn new(src: &'a str) -> Result<Parser<'a>, ParseError> {
        let mut lx = Lexer::new(src);
        let cur = lx.next_token()?;
        let nl = lx.line_terminator_before_token;
        let line = lx.tok_line;
        Ok(Parser {
            lx,
            ast: Ast::new(),
            cur,
            nl_before: nl,
            cur_line: line,
            work: Vec::new(),
            funcs: Vec::new(),
            last_line: 0,
            pending_line: None,
        })
    }

    /// Parses a complete script into a packed AST.
    pub fn parse(mut self) -> Result<Ast, ParseError> {
        let spos = self.add_node(AstTag::Script);
        self.funcs.push(FuncCtx {
            node_pos: spos,
            last_var: None,
            strict: false,
            is_function: false,
            loop_depth: 0,
            switch_depth: 0,
        });
        self.maybe_use_strict()?;
        self.work.push(Work::SetSkip {
            pos: spos,
            skip: SKIP_END,
        });
        self.work.push(Work::Stmts(StmtsEnd::Eof));
        self.run()?;
        self.finish()
    }

    /// Parses a single JSON value into a packed AST (no `SCRIPT` node).
    pub fn parse_json(mut self) -> Result<Ast, ParseError> {
        self.work.push(Work::JsonValue);
        self.run()?;
        if self.cur != Tok::Eof {
            return Err(self.err("unexpected trailing input"));
        }
        self.finish()
    }

    fn finish(self) -> Result<Ast, ParseError> {
        if self.ast.has_overflow {
            return Err(ParseError::new(
                "script too large".to_string(),
                SourcePosition::start(),
            ));
        }
        Ok(self.ast)
    }

    fn run(&mut self) -> Result<(), ParseError> {
        while let Some(w) = self.work.pop() {
            if self.work.len() > MAX_WORK_DEPTH {
                return Err(self.err("code too deeply nested"));
            }
            self.step(w)?;
        }
        Ok(())
    }

    // ---- token plumbing ----

    fn advance(&mut self) -> Result<Tok, ParseError> {
        let old = std::mem::replace(&mut self.cur, self.lx.next_token()?);
        self.nl_before = self.lx.line_terminator_before_token;
        self.cur_line = self.lx.tok_line;
        Ok(old)
    }

    fn expect_punct(&mut self, p: Punct) -> Result<(), ParseError> {
        if self.cur == Tok::Punct(p) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.err(format!("expected {:?}, found {:?}", p, self.cur)))
        }
    }

    fn expect_keyword(&mut self, k: Keyword) -> Result<(), ParseError> {
        if self.cur == Tok::Keyword(k) {
            self.advance()?;
            Ok(())
        } else {
            Err(self.err(format!("expected {:?}", k)))
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.cur.clone() {
            Tok::Ident(name) => {
                self.advance()?;
                Ok(name)
            }
            other => Err(self.err(format!("expected identifier, found {:?}", other))),
        }
    }

    fn err(&self, msg: impl Into<String>) -> ParseError {
        ParseError::new(msg.into(), self.lx.position())
    }

    fn strict(&self) -> bool {
        self.funcs.last().map(|c| c.strict).unwrap_or(false)
    }

    // ---- AST plumbing ----

    fn add_node(&mut self, tag: AstTag) -> usize {
        let at = self.ast.buf.len();
        let pos = self.ast.insert_node(at, tag);
        self.consume_pending_line(at);
        pos
    }

    fn add_inlined(&mut self, tag: AstTag, data: &[u8]) -> usize {
        let at = self.ast.buf.len();
        let pos = self.ast.insert_inlined_node(at, tag, data);
        self.consume_pending_line(at);
        pos
    }

    fn consume_pending_line(&mut self, tag_off: usize) {
        if let Some(line) = self.pending_line.take() {
            self.ast.add_line_no(tag_off, line);
            self.last_line = line;
        }
    }

    /// Links a freshly inserted `VAR` node (position one past its tag)
    /// into the enclosing function's hoisting chain.
    fn link_var(&mut self, vpos: usize) {
        let ctx = self.funcs.last_mut().expect("inside a script or function");
        match ctx.last_var {
            None => {
                let node_pos = ctx.node_pos;
                ctx.last_var = Some(vpos);
                self.ast.modify_skip(node_pos, vpos, SKIP_VAR_NEXT);
            }
            Some(prev) => {
                ctx.last_var = Some(vpos);
                self.ast.modify_skip(prev, vpos, SKIP_VAR_NEXT);
            }
        }
    }

    fn maybe_use_strict(&mut self) -> Result<(), ParseError> {
        if let Tok::Str(s) = &self.cur {
            if s == b"use strict" {
                let next_ends = matches!(
                    self.lx.peek_token()?,
                    Tok::Punct(Punct::Semicolon) | Tok::Punct(Punct::RBrace) | Tok::Eof
                ) || self.lx.newline_before_peek()?;
                if next_ends {
                    self.advance()?;
                    if self.cur == Tok::Punct(Punct::Semicolon) {
                        self.advance()?;
                    }
                    self.add_node(AstTag::UseStrict);
                    self.funcs.last_mut().expect("ctx").strict = true;
                }
            }
        }
        Ok(())
    }

    // ---- the machine ----

    fn step(&mut self, w: Work) -> Result<(), ParseError> {
        match w {
            Work::Stmts(end) => self.step_stmts(end),
            Work::Stmt => self.step_stmt(),
            Work::ExpectSemicolon => self.step_expect_semicolon(),
            Work::SetSkip { pos, skip } => {
                self.ast.set_skip(pos, skip);
                Ok(())
            }
            Work::ExitLoop => {
                self.funcs.last_mut().expect("ctx").loop_depth -= 1;
                Ok(())
            }

            Work::IfAfterCond { pos } => {
                self.expect_punct(Punct::RParen)?;
                self.work.push(Work::IfAfterTrue { pos });
                self.work.push(Work::Stmt);
                Ok(())
            }
            Work::IfAfterTrue { pos } => {
                self.ast.set_skip(pos, SKIP_IF_TRUE_END);
                if self.cur == Tok::Keyword(Keyword::Else) {
                    self.advance()?;
                    self.work.push(Work::SetSkip {
                        pos,
                        skip: SKIP_END,
                    });
                    self.work.push(Work::Stmt);
                } else {
                    self.ast.set_skip(pos, SKIP_END);
                }
                Ok(())
            }
            Work::WhileAfterCond { pos } => {
                self.expect_punct(Punct::RParen)?;
                self.funcs.last_mut().expect("ctx").loop_depth += 1;
                self.work.push(Work::SetSkip {
                    pos,
                    skip: SKIP_END,
                });
                self.work.push(Work::ExitLoop);
                self.work.push(Work::Stmt);
                Ok(())
            }
            Work::DoWhileAfterBody { pos } => {
                self.funcs.last_mut().expect("ctx").loop_depth -= 1;
                self.ast.set_skip(pos, SKIP_DOWHILE_COND);
                self.expect_keyword(Keyword::While)?;
                self.expect_punct(Punct::LParen)?;
                self.work.push(Work::DoWhileClose { pos });
                self.work.push(Work::Expr);
                Ok(())
            }
            Work::DoWhileClose { pos } => {
                self.expect_punct(Punct::RParen)?;
                self.ast.set_skip(pos, SKIP_END);
                if self.cur == Tok::Punct(Punct::Semicolon) {
                    self.advance()?;
                }
                Ok(())
            }
            Work::ForAfterInit { pos } => {
                if self.cur == Tok::Keyword(Keyword::In) {
                    self.advance()?;
                    self.ast.modify_tag(pos - 1, AstTag::ForIn);
                    self.work.push(Work::ForInAfterObj { pos });
                    self.work.push(Work::Expr);
                } else {
                    self.expect_punct(Punct::Semicolon)?;
                    if self.cur == Tok::Punct(Punct::Semicolon) {
                        self.add_node(AstTag::Nop);
                        self.work.push(Work::ForAfterCond { pos });
                    } else {
                        self.work.push(Work::ForAfterCond { pos });
                        self.work.push(Work::Expr);
                    }
                }
                Ok(())
            }
            Work::ForAfterCond { pos } => {
                self.expect_punct(Punct::Semicolon)?;
                if self.cur == Tok::Punct(Punct::RParen) {
                    self.add_node(AstTag::Nop);
                    self.work.push(Work::ForAfterIter { pos });
                } else {
                    self.work.push(Work::ForAfterIter { pos });
                    self.work.push(Work::Expr);
                }
                Ok(())
            }
            Work::ForAfterIter { pos } => {
                self.expect_punct(Punct::RParen)?;
                self.ast.set_skip(pos, SKIP_FOR_BODY);
                self.funcs.last_mut().expect("ctx").loop_depth += 1;
                self.work.push(Work::SetSkip {
                    pos,
                    skip: SKIP_END,
                });
                self.work.push(Work::ExitLoop);
                self.work.push(Work::Stmt);
                Ok(())
            }
            Work::ForInAfterObj { pos } => {
                self.add_node(AstTag::Nop);
                self.expect_punct(Punct::RParen)?;
                self.ast.set_skip(pos, SKIP_FOR_BODY);
                self.funcs.last_mut().expect("ctx").loop_depth += 1;
                self.work.push(Work::SetSkip {
                    pos,
                    skip: SKIP_END,
                });
                self.work.push(Work::ExitLoop);
                self.work.push(Work::Stmt);
                Ok(())
            }
            Work::VarLoop { vpos, no_in, semi } => {
                let name = self.expect_ident()?;
                self.add_inlined(AstTag::VarDecl, name.as_bytes());
                if self.cur == Tok::Punct(Punct::Assign) {
                    self.advance()?;
                    self.work.push(Work::VarAfterDecl { vpos, no_in, semi });
                    self.work.push(Work::AssignExpr { no_in });
                } else {
                    self.add_node(AstTag::Nop);
                    self.work.push(Work::VarAfterDecl { vpos, no_in, semi });
                }
                Ok(())
            }
            Work::VarAfterDecl { vpos, no_in, semi } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.work.push(Work::VarLoop { vpos, no_in, semi });
                } else {
                    self.ast.set_skip(vpos, SKIP_END);
                    if semi {
                        self.work.push(Work::ExpectSemicolon);
                    }
                }
                Ok(())
            }
            Work::TryAfterBlock { pos } => {
                self.ast.set_skip(pos, SKIP_TRY_CATCH);
                let has_catch = self.cur == Tok::Keyword(Keyword::Catch);
                if has_catch {
                    self.advance()?;
                    self.expect_punct(Punct::LParen)?;
                    let name = self.expect_ident()?;
                    self.add_inlined(AstTag::Ident, name.as_bytes());
                    self.expect_punct(Punct::RParen)?;
                    self.expect_punct(Punct::LBrace)?;
                    self.work.push(Work::TryAfterCatch { pos });
                    self.work.push(Work::Stmts(StmtsEnd::Brace));
                } else {
                    self.work.push(Work::TryAfterCatch { pos });
                }
                Ok(())
            }
            Work::TryAfterCatch { pos } => {
                self.ast.set_skip(pos, SKIP_TRY_FINALLY);
                if self.cur == Tok::Keyword(Keyword::Finally) {
                    self.advance()?;
                    self.expect_punct(Punct::LBrace)?;
                    self.work.push(Work::TryFinally { pos });
                    self.work.push(Work::Stmts(StmtsEnd::Brace));
                } else {
                    // A catch must have been present.
                    if self.ast.get_skip(pos, SKIP_TRY_CATCH)
                        == self.ast.get_skip(pos, SKIP_TRY_FINALLY)
                    {
                        return Err(self.err("missing catch or finally after try"));
                    }
                    self.ast.set_skip(pos, SKIP_END);
                }
                Ok(())
            }
            Work::TryFinally { pos } => {
                self.ast.set_skip(pos, SKIP_END);
                Ok(())
            }
            Work::SwitchAfterExpr { pos } => {
                self.expect_punct(Punct::RParen)?;
                self.expect_punct(Punct::LBrace)?;
                self.work.push(Work::SwitchBody { pos });
                Ok(())
            }
            Work::SwitchBody { pos } => {
                if self.cur == Tok::Punct(Punct::RBrace) {
                    self.advance()?;
                    self.funcs.last_mut().expect("ctx").switch_depth -= 1;
                    self.ast.set_skip(pos, SKIP_END);
                    return Ok(());
                }
                if self.cur == Tok::Keyword(Keyword::Case) {
                    self.advance()?;
                    let cpos = self.add_node(AstTag::Case);
                    self.work.push(Work::SwitchBody { pos });
                    self.work.push(Work::CaseAfterExpr { cpos });
                    self.work.push(Work::Expr);
                    return Ok(());
                }
                if self.cur == Tok::Keyword(Keyword::Default) {
                    self.advance()?;
                    let dtag = self.ast.buf.len();
                    let dpos = self.ast.insert_node(dtag, AstTag::Default);
                    self.ast.modify_skip(pos, dtag, SKIP_SWITCH_DEFAULT);
                    self.expect_punct(Punct::Colon)?;
                    self.work.push(Work::SwitchBody { pos });
                    self.work.push(Work::SetSkip {
                        pos: dpos,
                        skip: SKIP_END,
                    });
                    self.work.push(Work::Stmts(StmtsEnd::CaseBody));
                    return Ok(());
                }
                Err(self.err("expected case, default or } in switch body"))
            }
            Work::CaseAfterExpr { cpos } => {
                self.expect_punct(Punct::Colon)?;
                self.work.push(Work::SetSkip {
                    pos: cpos,
                    skip: SKIP_END,
                });
                self.work.push(Work::Stmts(StmtsEnd::CaseBody));
                Ok(())
            }
            Work::WithAfterExpr { pos } => {
                self.expect_punct(Punct::RParen)?;
                self.work.push(Work::SetSkip {
                    pos,
                    skip: SKIP_END,
                });
                self.work.push(Work::Stmt);
                Ok(())
            }
            Work::FuncEnd { fpos } => {
                self.ast.set_skip(fpos, SKIP_END);
                self.funcs.pop();
                Ok(())
            }

            Work::Expr => {
                let start = self.ast.buf.len();
                self.work.push(Work::CommaLoop {
                    start,
                    seq_pos: None,
                    no_in: false,
                });
                self.work.push(Work::AssignExpr { no_in: false });
                Ok(())
            }
            Work::ExprNoIn => {
                let start = self.ast.buf.len();
                self.work.push(Work::CommaLoop {
                    start,
                    seq_pos: None,
                    no_in: true,
                });
                self.work.push(Work::AssignExpr { no_in: true });
                Ok(())
            }
            Work::CommaLoop {
                start,
                seq_pos,
                no_in,
            } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    let sp = match seq_pos {
                        Some(sp) => sp,
                        None => self.ast.insert_node(start, AstTag::Seq),
                    };
                    self.work.push(Work::CommaLoop {
                        start,
                        seq_pos: Some(sp),
                        no_in,
                    });
                    self.work.push(Work::AssignExpr { no_in });
                } else if let Some(sp) = seq_pos {
                    self.ast.set_skip(sp, SKIP_END);
                }
                Ok(())
            }
            Work::AssignExpr { no_in } => {
                let start = self.ast.buf.len();
                self.work.push(Work::AssignTail { start, no_in });
                self.work.push(Work::TernaryTail { start, no_in });
                self.work.push(Work::BinExpr { level: 1, no_in });
                Ok(())
            }
            Work::TernaryTail { start, no_in } => {
                if self.cur == Tok::Punct(Punct::Question) {
                    self.advance()?;
                    self.ast.insert_node(start, AstTag::Cond);
                    self.work.push(Work::TernaryColon { no_in });
                    self.work.push(Work::AssignExpr { no_in: false });
                }
                Ok(())
            }
            Work::TernaryColon { no_in } => {
                self.expect_punct(Punct::Colon)?;
                self.work.push(Work::AssignExpr { no_in });
                Ok(())
            }
            Work::AssignTail { start, no_in } => {
                if let Some(tag) = assign_op_tag(&self.cur) {
                    let (lhs_tag, _) = AstTag::from_byte(self.ast.buf[start]);
                    if !matches!(lhs_tag, AstTag::Ident | AstTag::Member | AstTag::Index) {
                        return Err(self.err("invalid assignment target"));
                    }
                    self.advance()?;
                    self.ast.insert_node(start, tag);
                    self.work.push(Work::AssignExpr { no_in });
                }
                Ok(())
            }
            Work::BinExpr { level, no_in } => {
                if level > MAX_BIN_LEVEL {
                    self.work.push(Work::UnaryExpr);
                } else {
                    let start = self.ast.buf.len();
                    self.work.push(Work::BinLoop {
                        level,
                        start,
                        no_in,
                    });
                    self.work.push(Work::BinExpr {
                        level: level + 1,
                        no_in,
                    });
                }
                Ok(())
            }
            Work::BinLoop {
                level,
                start,
                no_in,
            } => {
                if let Some(tag) = bin_op_tag(&self.cur, level, no_in) {
                    self.advance()?;
                    self.ast.insert_node(start, tag);
                    self.work.push(Work::BinLoop {
                        level,
                        start,
                        no_in,
                    });
                    self.work.push(Work::BinExpr {
                        level: level + 1,
                        no_in,
                    });
                }
                Ok(())
            }
            Work::UnaryExpr => {
                let tag = match &self.cur {
                    Tok::Punct(Punct::Not) => Some(AstTag::LogicalNot),
                    Tok::Punct(Punct::Tilde) => Some(AstTag::Not),
                    Tok::Punct(Punct::Plus) => Some(AstTag::Positive),
                    Tok::Punct(Punct::Minus) => Some(AstTag::Negative),
                    Tok::Punct(Punct::PlusPlus) => Some(AstTag::Preinc),
                    Tok::Punct(Punct::MinusMinus) => Some(AstTag::Predec),
                    Tok::Keyword(Keyword::Delete) => Some(AstTag::Delete),
                    Tok::Keyword(Keyword::Void) => Some(AstTag::Void),
                    Tok::Keyword(Keyword::Typeof) => Some(AstTag::Typeof),
                    _ => None,
                };
                match tag {
                    Some(tag) => {
                        self.advance()?;
                        self.add_node(tag);
                        self.work.push(Work::UnaryExpr);
                    }
                    None => {
                        let start = self.ast.buf.len();
                        self.work.push(Work::PostfixTail { start });
                        self.work.push(Work::LeftHandSide);
                    }
                }
                Ok(())
            }
            Work::PostfixTail { start } => {
                if !self.nl_before {
                    if self.cur == Tok::Punct(Punct::PlusPlus) {
                        self.advance()?;
                        self.ast.insert_node(start, AstTag::Postinc);
                    } else if self.cur == Tok::Punct(Punct::MinusMinus) {
                        self.advance()?;
                        self.ast.insert_node(start, AstTag::Postdec);
                    }
                }
                Ok(())
            }
            Work::LeftHandSide => {
                if self.cur == Tok::Keyword(Keyword::New) {
                    self.advance()?;
                    let pos = self.add_node(AstTag::New);
                    self.work.push(Work::NewAfterCtor {
                        pos,
                        allow_call: true,
                    });
                    self.work.push(Work::MemberNoCall);
                } else {
                    let start = self.ast.buf.len();
                    self.work.push(Work::CallTail { start });
                    self.work.push(Work::Primary);
                }
                Ok(())
            }
            Work::MemberNoCall => {
                if self.cur == Tok::Keyword(Keyword::New) {
                    self.advance()?;
                    let pos = self.add_node(AstTag::New);
                    self.work.push(Work::NewAfterCtor {
                        pos,
                        allow_call: false,
                    });
                    self.work.push(Work::MemberNoCall);
                } else {
                    let start = self.ast.buf.len();
                    self.work.push(Work::MemberTail { start });
                    self.work.push(Work::Primary);
                }
                Ok(())
            }
            Work::MemberTail { start } => {
                if self.cur == Tok::Punct(Punct::Dot) {
                    self.advance()?;
                    let name = self.member_name()?;
                    self.ast.insert_inlined_node(start, AstTag::Member, &name);
                    self.work.push(Work::MemberTail { start });
                } else if self.cur == Tok::Punct(Punct::LBracket) {
                    self.advance()?;
                    self.ast.insert_node(start, AstTag::Index);
                    self.work.push(Work::MemberIndexEnd { start });
                    self.work.push(Work::Expr);
                }
                Ok(())
            }
            Work::MemberIndexEnd { start } => {
                self.expect_punct(Punct::RBracket)?;
                self.work.push(Work::MemberTail { start });
                Ok(())
            }
            Work::NewAfterCtor { pos, allow_call } => {
                if self.cur == Tok::Punct(Punct::LParen) {
                    self.advance()?;
                    if self.cur == Tok::Punct(Punct::RParen) {
                        self.advance()?;
                        self.finish_new(pos, allow_call);
                    } else {
                        self.work.push(Work::NewArgs { pos, allow_call });
                        self.work.push(Work::AssignExpr { no_in: false });
                        return Ok(());
                    }
                } else {
                    self.finish_new(pos, allow_call);
                }
                Ok(())
            }
            Work::NewArgs { pos, allow_call } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.work.push(Work::NewArgs { pos, allow_call });
                    self.work.push(Work::AssignExpr { no_in: false });
                } else if self.cur == Tok::Punct(Punct::RParen) {
                    self.advance()?;
                    self.finish_new(pos, allow_call);
                } else {
                    return Err(self.err("expected , or ) in arguments"));
                }
                Ok(())
            }
            Work::CallTail { start } => {
                match &self.cur {
                    Tok::Punct(Punct::Dot) => {
                        self.advance()?;
                        let name = self.member_name()?;
                        self.ast.insert_inlined_node(start, AstTag::Member, &name);
                        self.work.push(Work::CallTail { start });
                    }
                    Tok::Punct(Punct::LBracket) => {
                        self.advance()?;
                        self.ast.insert_node(start, AstTag::Index);
                        self.work.push(Work::CallIndexEnd { start });
                        self.work.push(Work::Expr);
                    }
                    Tok::Punct(Punct::LParen) => {
                        self.advance()?;
                        let pos = self.ast.insert_node(start, AstTag::Call);
                        if self.cur == Tok::Punct(Punct::RParen) {
                            self.advance()?;
                            self.ast.set_skip(pos, SKIP_END);
                            self.work.push(Work::CallTail { start });
                        } else {
                            self.work.push(Work::CallArgs { pos, start });
                            self.work.push(Work::AssignExpr { no_in: false });
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            Work::CallIndexEnd { start } => {
                self.expect_punct(Punct::RBracket)?;
                self.work.push(Work::CallTail { start });
                Ok(())
            }
            Work::CallArgs { pos, start } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.work.push(Work::CallArgs { pos, start });
                    self.work.push(Work::AssignExpr { no_in: false });
                } else if self.cur == Tok::Punct(Punct::RParen) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                    self.work.push(Work::CallTail { start });
                } else {
                    return Err(self.err("expected , or ) in arguments"));
                }
                Ok(())
            }
            Work::Primary => self.step_primary(),
            Work::ExpectRParen => self.expect_punct(Punct::RParen),
            Work::ArrayLit { pos } => {
                if self.cur == Tok::Punct(Punct::RBracket) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                } else if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.add_node(AstTag::Nop);
                    self.work.push(Work::ArrayLit { pos });
                } else {
                    self.work.push(Work::ArrayAfterElem { pos });
                    self.work.push(Work::AssignExpr { no_in: false });
                }
                Ok(())
            }
            Work::ArrayAfterElem { pos } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.work.push(Work::ArrayLit { pos });
                } else if self.cur == Tok::Punct(Punct::RBracket) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                } else {
                    return Err(self.err("expected , or ] in array literal"));
                }
                Ok(())
            }
            Work::ObjLit { pos } => {
                if self.cur == Tok::Punct(Punct::RBrace) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                    return Ok(());
                }
                self.step_obj_prop(pos)
            }
            Work::ObjAfterProp { pos } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.work.push(Work::ObjLit { pos });
                } else if self.cur == Tok::Punct(Punct::RBrace) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                } else {
                    return Err(self.err("expected , or } in object literal"));
                }
                Ok(())
            }
            Work::FuncLit { name } => self.step_func_lit(name),

            Work::JsonValue => self.step_json_value(),
            Work::JsonObj { pos } => {
                if self.cur == Tok::Punct(Punct::RBrace) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                    return Ok(());
                }
                self.step_json_member(pos)
            }
            Work::JsonObjNext { pos } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.step_json_member(pos)
                } else if self.cur == Tok::Punct(Punct::RBrace) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                    Ok(())
                } else {
                    Err(self.err("expected , or } in JSON object"))
                }
            }
            Work::JsonArrNext { pos } => {
                if self.cur == Tok::Punct(Punct::Comma) {
                    self.advance()?;
                    self.work.push(Work::JsonArrNext { pos });
                    self.work.push(Work::JsonValue);
                    Ok(())
                } else if self.cur == Tok::Punct(Punct::RBracket) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                    Ok(())
                } else {
                    Err(self.err("expected , or ] in JSON array"))
                }
            }
        }
    }

    fn finish_new(&mut self, pos: usize, allow_call: bool) {
        self.ast.set_skip(pos, SKIP_END);
        if allow_call {
            self.work.push(Work::CallTail { start: pos - 1 });
        } else {
            self.work.push(Work::MemberTail { start: pos - 1 });
        }
    }

    fn member_name(&mut self) -> Result<Vec<u8>, ParseError> {
        // Reserved words are permitted after `.`.
        match self.cur.clone() {
            Tok::Ident(name) => {
                self.advance()?;
                Ok(name.into_bytes())
            }
            Tok::Keyword(k) => {
                self.advance()?;
                Ok(keyword_text(k).as_bytes().to_vec())
            }
            other => Err(self.err(format!("expected property name, found {:?}", other))),
        }
    }

    fn step_stmts(&mut self, end: StmtsEnd) -> Result<(), ParseError> {
        let done = match end {
            StmtsEnd::Brace => {
                if self.cur == Tok::Punct(Punct::RBrace) {
                    self.advance()?;
                    true
                } else if self.cur == Tok::Eof {
                    return Err(self.err("unexpected end of input, expected }"));
                } else {
                    false
                }
            }
            StmtsEnd::Eof => self.cur == Tok::Eof,
            StmtsEnd::CaseBody => matches!(
                self.cur,
                Tok::Keyword(Keyword::Case) | Tok::Keyword(Keyword::Default)
            ) || self.cur == Tok::Punct(Punct::RBrace),
        };
        if !done {
            self.work.push(Work::Stmts(end));
            self.work.push(Work::Stmt);
        }
        Ok(())
    }

    fn step_expect_semicolon(&mut self) -> Result<(), ParseError> {
        // A statement ends at `;`, end of input, `}`, or a newline right
        // after its last token.
        if self.cur == Tok::Punct(Punct::Semicolon) {
            self.advance()?;
            Ok(())
        } else if self.cur == Tok::Eof
            || self.cur == Tok::Punct(Punct::RBrace)
            || self.nl_before
        {
            Ok(())
        } else {
            Err(self.err(format!("expected ; found {:?}", self.cur)))
        }
    }

    fn step_stmt(&mut self) -> Result<(), ParseError> {
        if self.cur_line != self.last_line {
            self.pending_line = Some(self.cur_line);
        }
        #[cfg(feature = "force_line_numbers")]
        {
            self.pending_line = Some(self.cur_line);
        }
        match self.cur.clone() {
            Tok::Punct(Punct::LBrace) => {
                self.pending_line = None;
                self.advance()?;
                self.work.push(Work::Stmts(StmtsEnd::Brace));
                Ok(())
            }
            Tok::Punct(Punct::Semicolon) => {
                self.pending_line = None;
                self.advance()?;
                Ok(())
            }
            Tok::Keyword(Keyword::Var) => {
                self.advance()?;
                let vpos = self.add_node(AstTag::Var);
                self.link_var(vpos);
                self.work.push(Work::VarLoop {
                    vpos,
                    no_in: false,
                    semi: true,
                });
                Ok(())
            }
            Tok::Keyword(Keyword::If) => {
                self.advance()?;
                let pos = self.add_node(AstTag::If);
                self.expect_punct(Punct::LParen)?;
                self.work.push(Work::IfAfterCond { pos });
                self.work.push(Work::Expr);
                Ok(())
            }
            Tok::Keyword(Keyword::While) => {
                self.advance()?;
                let pos = self.add_node(AstTag::While);
                self.expect_punct(Punct::LParen)?;
                self.work.push(Work::WhileAfterCond { pos });
                self.work.push(Work::Expr);
                Ok(())
            }
            Tok::Keyword(Keyword::Do) => {
                self.advance()?;
                let pos = self.add_node(AstTag::DoWhile);
                self.funcs.last_mut().expect("ctx").loop_depth += 1;
                self.work.push(Work::DoWhileAfterBody { pos });
                self.work.push(Work::Stmt);
                Ok(())
            }
            Tok::Keyword(Keyword::For) => {
                self.advance()?;
                let pos = self.add_node(AstTag::For);
                self.expect_punct(Punct::LParen)?;
                if self.cur == Tok::Punct(Punct::Semicolon) {
                    self.add_node(AstTag::Nop);
                    self.work.push(Work::ForAfterInit { pos });
                } else if self.cur == Tok::Keyword(Keyword::Var) {
                    self.advance()?;
                    let vpos = self.add_node(AstTag::Var);
                    self.link_var(vpos);
                    self.work.push(Work::ForAfterInit { pos });
                    self.work.push(Work::VarLoop {
                        vpos,
                        no_in: true,
                        semi: false,
                    });
                } else {
                    self.work.push(Work::ForAfterInit { pos });
                    self.work.push(Work::ExprNoIn);
                }
                Ok(())
            }
            Tok::Keyword(Keyword::Switch) => {
                self.advance()?;
                let pos = self.add_node(AstTag::Switch);
                self.expect_punct(Punct::LParen)?;
                self.funcs.last_mut().expect("ctx").switch_depth += 1;
                self.work.push(Work::SwitchAfterExpr { pos });
                self.work.push(Work::Expr);
                Ok(())
            }
            Tok::Keyword(Keyword::Try) => {
                self.advance()?;
                let pos = self.add_node(AstTag::Try);
                self.expect_punct(Punct::LBrace)?;
                self.work.push(Work::TryAfterBlock { pos });
                self.work.push(Work::Stmts(StmtsEnd::Brace));
                Ok(())
            }
            Tok::Keyword(Keyword::With) => {
                if self.strict() {
                    return Err(self.err("with is not allowed in strict mode"));
                }
                self.advance()?;
                let pos = self.add_node(AstTag::With);
                self.expect_punct(Punct::LParen)?;
                self.work.push(Work::WithAfterExpr { pos });
                self.work.push(Work::Expr);
                Ok(())
            }
            Tok::Keyword(Keyword::Function) => {
                self.advance()?;
                let vpos = self.add_node(AstTag::Var);
                self.link_var(vpos);
                let name = self.expect_ident()?;
                self.add_inlined(AstTag::FuncDecl, name.as_bytes());
                self.work.push(Work::SetSkip {
                    pos: vpos,
                    skip: SKIP_END,
                });
                self.work.push(Work::FuncLit {
                    name: Some(name.into_bytes()),
                });
                Ok(())
            }
            Tok::Keyword(Keyword::Return) => {
                let in_function = self.funcs.iter().any(|c| c.is_function);
                if !in_function {
                    return Err(self.err("illegal return outside a function"));
                }
                self.advance()?;
                if self.cur == Tok::Punct(Punct::Semicolon)
                    || self.cur == Tok::Punct(Punct::RBrace)
                    || self.cur == Tok::Eof
                    || self.nl_before
                {
                    self.add_node(AstTag::Return);
                    self.work.push(Work::ExpectSemicolon);
                } else {
                    self.add_node(AstTag::ValueReturn);
                    self.work.push(Work::ExpectSemicolon);
                    self.work.push(Work::Expr);
                }
                Ok(())
            }
            Tok::Keyword(Keyword::Throw) => {
                self.advance()?;
                if self.nl_before {
                    return Err(self.err("illegal newline after throw"));
                }
                self.add_node(AstTag::Throw);
                self.work.push(Work::ExpectSemicolon);
                self.work.push(Work::Expr);
                Ok(())
            }
            Tok::Keyword(Keyword::Break) => {
                self.advance()?;
                let ctx = self.funcs.last().expect("ctx");
                if let (Tok::Ident(label), false) = (self.cur.clone(), self.nl_before) {
                    self.advance()?;
                    self.add_node(AstTag::LabeledBreak);
                    self.add_inlined(AstTag::Label, label.as_bytes());
                } else {
                    if ctx.loop_depth == 0 && ctx.switch_depth == 0 {
                        return Err(self.err("illegal break"));
                    }
                    self.add_node(AstTag::Break);
                }
                self.work.push(Work::ExpectSemicolon);
                Ok(())
            }
            Tok::Keyword(Keyword::Continue) => {
                self.advance()?;
                let ctx = self.funcs.last().expect("ctx");
                if let (Tok::Ident(label), false) = (self.cur.clone(), self.nl_before) {
                    self.advance()?;
                    self.add_node(AstTag::LabeledContinue);
                    self.add_inlined(AstTag::Label, label.as_bytes());
                } else {
                    if ctx.loop_depth == 0 {
                        return Err(self.err("illegal continue"));
                    }
                    self.add_node(AstTag::Continue);
                }
                self.work.push(Work::ExpectSemicolon);
                Ok(())
            }
            Tok::Keyword(Keyword::Debugger) => {
                self.advance()?;
                self.add_node(AstTag::Debugger);
                self.work.push(Work::ExpectSemicolon);
                Ok(())
            }
            Tok::Ident(name) => {
                // A label is an identifier directly followed by a colon.
                if *self.lx.peek_token()? == Tok::Punct(Punct::Colon) {
                    self.advance()?;
                    self.advance()?;
                    self.add_inlined(AstTag::Label, name.as_bytes());
                    self.work.push(Work::Stmt);
                    Ok(())
                } else {
                    self.work.push(Work::ExpectSemicolon);
                    self.work.push(Work::Expr);
                    Ok(())
                }
            }
            _ => {
                self.work.push(Work::ExpectSemicolon);
                self.work.push(Work::Expr);
                Ok(())
            }
        }
    }

    fn step_primary(&mut self) -> Result<(), ParseError> {
        match self.cur.clone() {
            Tok::Number(raw) => {
                self.advance()?;
                self.add_inlined(AstTag::Num, raw.as_bytes());
                Ok(())
            }
            Tok::Str(s) => {
                self.advance()?;
                self.add_inlined(AstTag::Str, &s);
                Ok(())
            }
            Tok::Regex { source, flags } => {
                self.advance()?;
                let text = format!("/{}/{}", source, flags);
                self.add_inlined(AstTag::Regex, text.as_bytes());
                Ok(())
            }
            Tok::Ident(name) => {
                self.advance()?;
                if name == "undefined" {
                    self.add_node(AstTag::Undefined);
                } else {
                    self.add_inlined(AstTag::Ident, name.as_bytes());
                }
                Ok(())
            }
            Tok::Keyword(Keyword::This) => {
                self.advance()?;
                self.add_node(AstTag::This);
                Ok(())
            }
            Tok::Keyword(Keyword::True) => {
                self.advance()?;
                self.add_node(AstTag::True);
                Ok(())
            }
            Tok::Keyword(Keyword::False) => {
                self.advance()?;
                self.add_node(AstTag::False);
                Ok(())
            }
            Tok::Keyword(Keyword::Null) => {
                self.advance()?;
                self.add_node(AstTag::Null);
                Ok(())
            }
            Tok::Keyword(Keyword::Function) => {
                self.advance()?;
                let name = match self.cur.clone() {
                    Tok::Ident(n) => {
                        self.advance()?;
                        Some(n.into_bytes())
                    }
                    _ => None,
                };
                self.work.push(Work::FuncLit { name });
                Ok(())
            }
            Tok::Punct(Punct::LParen) => {
                self.advance()?;
                self.work.push(Work::ExpectRParen);
                self.work.push(Work::Expr);
                Ok(())
            }
            Tok::Punct(Punct::LBracket) => {
                self.advance()?;
                let pos = self.add_node(AstTag::Array);
                self.work.push(Work::ArrayLit { pos });
                Ok(())
            }
            Tok::Punct(Punct::LBrace) => {
                self.advance()?;
                let pos = self.add_node(AstTag::Object);
                self.work.push(Work::ObjLit { pos });
                Ok(())
            }
            other => Err(self.err(format!("unexpected token {:?}", other))),
        }
    }

    fn prop_name(&mut self) -> Result<Vec<u8>, ParseError> {
        match self.cur.clone() {
            Tok::Ident(name) => {
                self.advance()?;
                Ok(name.into_bytes())
            }
            Tok::Str(s) => {
                self.advance()?;
                Ok(s)
            }
            Tok::Number(raw) => {
                self.advance()?;
                Ok(raw.into_bytes())
            }
            Tok::Keyword(k) => {
                // Reserved words are permitted as property names.
                self.advance()?;
                Ok(keyword_text(k).as_bytes().to_vec())
            }
            other => Err(self.err(format!("expected property name, found {:?}", other))),
        }
    }

    fn step_obj_prop(&mut self, pos: usize) -> Result<(), ParseError> {
        // get/set accessors, unless `get`/`set` is itself a plain key.
        if let Tok::Ident(word) = self.cur.clone() {
            if word == "get" || word == "set" {
                let next = self.lx.peek_token()?.clone();
                let is_accessor = !matches!(
                    next,
                    Tok::Punct(Punct::Colon)
                        | Tok::Punct(Punct::Comma)
                        | Tok::Punct(Punct::RBrace)
                        | Tok::Punct(Punct::LParen)
                );
                if is_accessor {
                    self.advance()?;
                    let tag = if word == "get" {
                        AstTag::Getter
                    } else {
                        AstTag::Setter
                    };
                    self.add_node(tag);
                    let name = self.prop_name()?;
                    self.work.push(Work::ObjAfterProp { pos });
                    self.work.push(Work::FuncLit { name: Some(name) });
                    return Ok(());
                }
            }
        }
        let name = self.prop_name()?;
        if self.cur == Tok::Punct(Punct::LParen) {
            // Method shorthand: `name(args) { body }`.
            self.add_inlined(AstTag::Prop, &name);
            self.work.push(Work::ObjAfterProp { pos });
            self.work.push(Work::FuncLit { name: Some(name) });
            return Ok(());
        }
        self.expect_punct(Punct::Colon)?;
        self.add_inlined(AstTag::Prop, &name);
        self.work.push(Work::ObjAfterProp { pos });
        self.work.push(Work::AssignExpr { no_in: false });
        Ok(())
    }

    fn step_func_lit(&mut self, name: Option<Vec<u8>>) -> Result<(), ParseError> {
        let fpos = self.add_node(AstTag::Func);
        match &name {
            Some(n) => {
                self.ast
                    .insert_inlined_node(self.ast.buf.len(), AstTag::Ident, n);
            }
            None => {
                self.add_node(AstTag::Nop);
            }
        }
        let strict = self.strict();
        self.funcs.push(FuncCtx {
            node_pos: fpos,
            last_var: None,
            strict,
            is_function: true,
            loop_depth: 0,
            switch_depth: 0,
        });
        self.expect_punct(Punct::LParen)?;
        while self.cur != Tok::Punct(Punct::RParen) {
            let param = self.expect_ident()?;
            self.ast
                .insert_inlined_node(self.ast.buf.len(), AstTag::Ident, param.as_bytes());
            if self.cur == Tok::Punct(Punct::Comma) {
                self.advance()?;
            } else {
                break;
            }
        }
        self.expect_punct(Punct::RParen)?;
        self.ast.set_skip(fpos, SKIP_FUNC_BODY);
        self.expect_punct(Punct::LBrace)?;
        self.maybe_use_strict()?;
        self.work.push(Work::FuncEnd { fpos });
        self.work.push(Work::Stmts(StmtsEnd::Brace));
        Ok(())
    }

    fn step_json_value(&mut self) -> Result<(), ParseError> {
        match self.cur.clone() {
            Tok::Punct(Punct::LBrace) => {
                self.advance()?;
                let pos = self.add_node(AstTag::Object);
                self.work.push(Work::JsonObj { pos });
                Ok(())
            }
            Tok::Punct(Punct::LBracket) => {
                self.advance()?;
                let pos = self.add_node(AstTag::Array);
                if self.cur == Tok::Punct(Punct::RBracket) {
                    self.advance()?;
                    self.ast.set_skip(pos, SKIP_END);
                } else {
                    self.work.push(Work::JsonArrNext { pos });
                    self.work.push(Work::JsonValue);
                }
                Ok(())
            }
            Tok::Str(s) => {
                self.advance()?;
                self.add_inlined(AstTag::Str, &s);
                Ok(())
            }
            Tok::Number(raw) => {
                self.advance()?;
                self.add_inlined(AstTag::Num, raw.as_bytes());
                Ok(())
            }
            Tok::Punct(Punct::Minus) => {
                self.advance()?;
                self.add_node(AstTag::Negative);
                match self.cur.clone() {
                    Tok::Number(raw) => {
                        self.advance()?;
                        self.add_inlined(AstTag::Num, raw.as_bytes());
                        Ok(())
                    }
                    other => Err(self.err(format!("invalid JSON number, found {:?}", other))),
                }
            }
            Tok::Keyword(Keyword::True) => {
                self.advance()?;
                self.add_node(AstTag::True);
                Ok(())
            }
            Tok::Keyword(Keyword::False) => {
                self.advance()?;
                self.add_node(AstTag::False);
                Ok(())
            }
            Tok::Keyword(Keyword::Null) => {
                self.advance()?;
                self.add_node(AstTag::Null);
                Ok(())
            }
            other => Err(self.err(format!("invalid JSON value, found {:?}", other))),
        }
    }

    fn step_json_member(&mut self, pos: usize) -> Result<(), ParseError> {
        match self.cur.clone() {
            Tok::Str(name) => {
                self.advance()?;
                self.expect_punct(Punct::Colon)?;
                self.add_inlined(AstTag::Prop, &name);
                self.work.push(Work::JsonObjNext { pos });
                self.work.push(Work::JsonValue);
                Ok(())
            }
            other => Err(self.err(format!("expected JSON object key, found {:?}", other))),
        }
    }
}

fn assign_op_tag(tok: &Tok) -> Option<AstTag> {
    match tok {
        Tok::Punct(Punct::Assign) => Some(AstTag::Assign),
        Tok::Punct(Punct::PlusEq) => Some(AstTag::PlusAssign),
        Tok::Punct(Punct::MinusEq) => Some(AstTag::MinusAssign),
        Tok::Punct(Punct::StarEq) => Some(AstTag::MulAssign),
        Tok::Punct(Punct::SlashEq) => Some(AstTag::DivAssign),
        Tok::Punct(Punct::PercentEq) => Some(AstTag::RemAssign),
        Tok::Punct(Punct::AndEq) => Some(AstTag::AndAssign),
        Tok::Punct(Punct::OrEq) => Some(AstTag::OrAssign),
        Tok::Punct(Punct::XorEq) => Some(AstTag::XorAssign),
        Tok::Punct(Punct::LtLtEq) => Some(AstTag::LshiftAssign),
        Tok::Punct(Punct::GtGtEq) => Some(AstTag::RshiftAssign),
        Tok::Punct(Punct::GtGtGtEq) => Some(AstTag::UrshiftAssign),
        _ => None,
    }
}

fn bin_op_tag(tok: &Tok, level: u8, no_in: bool) -> Option<AstTag> {
    match (level, tok) {
        (1, Tok::Punct(Punct::OrOr)) => Some(AstTag::LogicalOr),
        (2, Tok::Punct(Punct::AndAnd)) => Some(AstTag::LogicalAnd),
        (3, Tok::Punct(Punct::Or)) => Some(AstTag::Or),
        (4, Tok::Punct(Punct::Xor)) => Some(AstTag::Xor),
        (5, Tok::Punct(Punct::And)) => Some(AstTag::And),
        (6, Tok::Punct(Punct::EqEq)) => Some(AstTag::Eq),
        (6, Tok::Punct(Punct::NotEq)) => Some(AstTag::Ne),
        (6, Tok::Punct(Punct::EqEqEq)) => Some(AstTag::EqEq),
        (6, Tok::Punct(Punct::NotEqEq)) => Some(AstTag::NeNe),
        (7, Tok::Punct(Punct::Lt)) => Some(AstTag::Lt),
        (7, Tok::Punct(Punct::Gt)) => Some(AstTag::Gt),
        (7, Tok::Punct(Punct::LtEq)) => Some(AstTag::Le),
        (7, Tok::Punct(Punct::GtEq)) => Some(AstTag::Ge),
        (7, Tok::Keyword(Keyword::In)) if !no_in => Some(AstTag::In),
        (7, Tok::Keyword(Keyword::Instanceof)) => Some(AstTag::Instanceof),
        (8, Tok::Punct(Punct::LtLt)) => Some(AstTag::Lshift),
        (8, Tok::Punct(Punct::GtGt)) => Some(AstTag::Rshift),
        (8, Tok::Punct(Punct::GtGtGt)) => Some(AstTag::Urshift),
        (9, Tok::Punct(Punct::Plus)) => Some(AstTag::Add),
        (9, Tok::Punct(Punct::Minus)) => Some(AstTag::Sub),
        (10, Tok::Punct(Punct::Star)) => Some(AstTag::Mul),
        (10, Tok::Punct(Punct::Slash)) => Some(AstTag::Div),
        (10, Tok::Punct(Punct::Percent)) => Some(AstTag::Rem),
        _ => None,
    }
}

fn keyword_text(k: Keyword) -> &'static str {
    match k {
        Keyword::Break => "break",
        Keyword::Case => "case",
        Keyword::Catch => "catch",
        Keyword::Continue => "continue",
        Keyword::Debugger => "debugger",
        Keyword::Default => "default",
        Keyword::Delete => "delete",
        Keyword::Do => "do",
        Keyword::Else => "else",
        Keyword::False => "false",
        Keyword::Finally => "finally",
        Keyword::For => "for",
        Keyword::Function => "function",
        Keyword::If => "if",
        Keyword::In => "in",
        Keyword::Instanceof => "instanceof",
        Keyword::New => "new",
        Keyword::Null => "null",
        Keyword::Return => "return",
        Keyword::Switch => "switch",
        Keyword::This => "this",
        Keyword::Throw => "throw",
        Keyword::True => "true",
        Keyword::Try => "try",
        Keyword::Typeof => "typeof",
        Keyword::Var => "var",
        Keyword::Void => "void",
        Keyword::While => "while",
        Keyword::With => "with",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Ast {
        Parser::new(src).unwrap().parse().unwrap()
    }

    fn dump(src: &str) -> String {
        let ast = parse_ok(src);
        let mut out = String::new();
        let mut pos = 0;
        ast.dump_tree(&mut out, &mut pos, 0);
        out
    }

    #[test]
    fn test_expression_statement() {
        let out = dump("1 + 2 * 3;");
        assert_eq!(out, "SCRIPT\n  ADD\n    NUM \"1\"\n    MUL\n      NUM \"2\"\n      NUM \"3\"\n");
    }

    #[test]
    fn test_precedence_and_associativity() {
        // Left associativity: (1 - 2) - 3.
        let out = dump("1 - 2 - 3;");
        assert_eq!(
            out,
            "SCRIPT\n  SUB\n    SUB\n      NUM \"1\"\n      NUM \"2\"\n    NUM \"3\"\n"
        );
    }

    #[test]
    fn test_var_statement_and_hoisting_chain() {
        let ast = parse_ok("var a = 1, b;");
        let mut pos = 0;
        assert_eq!(ast.fetch_tag(&mut pos), AstTag::Script);
        let script = pos;
        let first_var = ast.get_skip(script, crate::ast::SKIP_SCRIPT_FIRST_VAR);
        assert_ne!(first_var, script, "var chain head must be linked");
        let mut vp = first_var;
        let tag = AstTag::from_byte(ast.buf[vp - 1]).0;
        assert_eq!(tag, AstTag::Var);
        // Chain terminates: next skip points at the node itself.
        assert_eq!(ast.get_skip(vp, SKIP_VAR_NEXT), vp);
        // The VAR node has two declarations.
        ast.move_to_children(&mut vp);
        assert_eq!(ast.fetch_tag(&mut vp), AstTag::VarDecl);
    }

    #[test]
    fn test_function_declaration_is_hoisted_var() {
        let out = dump("function f(a, b) { return a; }");
        assert!(out.starts_with("SCRIPT\n  VAR\n    FUNC_DECL \"f\"\n      FUNC\n"));
        assert!(out.contains("VAL_RETURN"));
    }

    #[test]
    fn test_if_else_regions() {
        let ast = parse_ok("if (x) a; else b;");
        let mut pos = 0;
        ast.fetch_tag(&mut pos);
        let script = pos;
        ast.move_to_children(&mut pos);
        assert_eq!(ast.fetch_tag(&mut pos), AstTag::If);
        let ifpos = pos;
        let true_end = ast.get_skip(ifpos, SKIP_IF_TRUE_END);
        let end = ast.get_skip(ifpos, SKIP_END);
        assert!(true_end < end, "else branch lives between the skips");
        let _ = script;
    }

    #[test]
    fn test_for_promotion_to_for_in() {
        let out = dump("for (var k in obj) x;");
        assert!(out.starts_with("SCRIPT\n  FOR_IN\n"), "got: {}", out);
        let out2 = dump("for (var i = 0; i < 3; i++) x;");
        assert!(out2.starts_with("SCRIPT\n  FOR\n"), "got: {}", out2);
    }

    #[test]
    fn test_member_call_chain() {
        let out = dump("a.b[c](1);");
        assert!(
            out.starts_with("SCRIPT\n  CALL\n    INDEX\n      MEMBER \"b\"\n        IDENT \"a\"\n"),
            "got: {}",
            out
        );
    }

    #[test]
    fn test_new_with_and_without_args() {
        let out = dump("new C(1); new D;");
        assert!(out.contains("NEW\n    IDENT \"C\"\n    NUM \"1\"\n"), "got: {}", out);
        assert!(out.contains("NEW\n    IDENT \"D\"\n"), "got: {}", out);
    }

    #[test]
    fn test_object_literal_forms() {
        let out = dump("x = { a: 1, 'b': 2, 3: c, if: 4 };");
        assert!(out.contains("PROP \"a\""));
        assert!(out.contains("PROP \"b\""));
        assert!(out.contains("PROP \"3\""));
        assert!(out.contains("PROP \"if\""), "reserved word as property name");
    }

    #[test]
    fn test_object_method_shorthand_and_accessors() {
        let out = dump("x = { m(a) { return a; }, get p() { return 1; } };");
        assert!(out.contains("PROP \"m\"\n      FUNC\n"), "got: {}", out);
        assert!(out.contains("GETTER\n      FUNC\n"), "got: {}", out);
    }

    #[test]
    fn test_try_catch_finally_skips() {
        let ast = parse_ok("try { a; } catch (e) { b; } finally { c; }");
        let mut pos = 0;
        ast.fetch_tag(&mut pos);
        let mut p = pos;
        ast.move_to_children(&mut p);
        assert_eq!(ast.fetch_tag(&mut p), AstTag::Try);
        let tpos = p;
        let catch = ast.get_skip(tpos, SKIP_TRY_CATCH);
        let finally = ast.get_skip(tpos, SKIP_TRY_FINALLY);
        let end = ast.get_skip(tpos, SKIP_END);
        assert!(catch < finally && finally < end);
    }

    #[test]
    fn test_try_requires_catch_or_finally() {
        assert!(Parser::new("try { a; }").unwrap().parse().is_err());
    }

    #[test]
    fn test_asi_newline_terminates() {
        // A newline substitutes for the semicolon.
        parse_ok("var a = 1\nvar b = 2\n");
        // `return` followed by a newline returns undefined.
        let out = dump("function f() { return\n1; }");
        assert!(out.contains("RETURN\n"), "bare return, value is a separate stmt");
    }

    #[test]
    fn test_asi_requires_termination() {
        assert!(Parser::new("var a = 1 var b").unwrap().parse().is_err());
    }

    #[test]
    fn test_strict_mode_rejects_with() {
        assert!(Parser::new("'use strict'; with (x) { a; }")
            .unwrap()
            .parse()
            .is_err());
        assert!(Parser::new("with (x) { a; }").unwrap().parse().is_ok());
    }

    #[test]
    fn test_break_outside_loop_rejected() {
        assert!(Parser::new("break;").unwrap().parse().is_err());
        assert!(Parser::new("while (1) break;").unwrap().parse().is_ok());
        assert!(Parser::new("continue;").unwrap().parse().is_err());
    }

    #[test]
    fn test_ternary_and_assignment() {
        let out = dump("a = b ? 1 : 2;");
        assert!(
            out.starts_with("SCRIPT\n  ASSIGN\n    IDENT \"a\"\n    COND\n"),
            "got: {}",
            out
        );
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(Parser::new("1 = 2;").unwrap().parse().is_err());
    }

    #[test]
    fn test_switch_default_skip() {
        let ast = parse_ok("switch (x) { case 1: a; break; default: b; }");
        let mut pos = 0;
        ast.fetch_tag(&mut pos);
        let mut p = pos;
        ast.move_to_children(&mut p);
        assert_eq!(ast.fetch_tag(&mut p), AstTag::Switch);
        let spos = p;
        let def = ast.get_skip(spos, SKIP_SWITCH_DEFAULT);
        assert_ne!(def, spos, "default clause is reachable through the skip");
        assert_eq!(AstTag::from_byte(ast.buf[def]).0, AstTag::Default);
    }

    #[test]
    fn test_json_mode() {
        let ast = Parser::new("{\"a\": [1, -2, true], \"b\": null}")
            .unwrap()
            .parse_json()
            .unwrap();
        let mut out = String::new();
        let mut pos = 0;
        ast.dump_tree(&mut out, &mut pos, 0);
        assert!(out.starts_with("OBJECT\n"), "got: {}", out);
        assert!(out.contains("NEG"), "negative number in JSON");
        assert!(Parser::new("{a: 1}").unwrap().parse_json().is_err());
        assert!(Parser::new("1 2").unwrap().parse_json().is_err());
    }

    #[test]
    fn test_sequence_expression() {
        let out = dump("a, b, c;");
        assert!(
            out.starts_with("SCRIPT\n  SEQ\n    IDENT \"a\"\n    IDENT \"b\"\n    IDENT \"c\"\n"),
            "got: {}",
            out
        );
    }

    #[test]
    fn test_regex_literal_in_ast() {
        let out = dump("x = /a+b/gi;");
        assert!(out.contains("REGEX \"/a+b/gi\""), "got: {}", out);
    }

    #[test]
    fn test_line_numbers_attached_on_new_lines() {
        let ast = parse_ok("a;\nb;\n\nc;");
        // Walk nodes and count line-number annotations.
        let mut found = Vec::new();
        let mut pos = 0;
        ast.fetch_tag(&mut pos);
        let script = pos;
        let mut p = script;
        ast.move_to_children(&mut p);
        while p < ast.get_skip(script, SKIP_END) {
            let node_tag_off = p;
            ast.fetch_tag(&mut p);
            let line = ast.get_line_no(node_tag_off + 1);
            if line != 0 {
                found.push(line);
            }
            p = node_tag_off;
            ast.skip_tree(&mut p);
        }
        assert_eq!(found, vec![1, 2, 4]);
    }

    #[test]
    fn test_deeply_nested_source_is_bounded() {
        // A pathological input must error out, not blow the host stack.
        let src = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
        assert!(Parser::new(&src).unwrap().parse().is_err());
    }

    #[test]
    fn test_labeled_statement() {
        let out = dump("top: while (1) { break top; }");
        assert!(out.contains("LABEL \"top\""), "got: {}", out);
        assert!(out.contains("LAB_BREAK"), "got: {}", out);
    }
}
