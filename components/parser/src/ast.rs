//! Packed abstract syntax tree.
//!
//! The AST is a flat byte buffer of tagged variable-length nodes, used as
//! the intermediate form between the parser and the bytecode compiler. A
//! node is: one tag byte (high bit set when a line-number varint follows
//! the skips), `num_skips` relative forward offsets, an optional varint
//! length plus inlined bytes, then the fixed subtrees, then, for
//! open-ended nodes, a run of children delimited by the `end` skip.

use core_types::varint::{read_varint, varint_len, write_varint};

/// Signature prefixed to binary AST streams.
pub const AST_SIGNATURE: &[u8] = b"V\x07ASTV10";

#[cfg(not(feature = "large_ast"))]
type AstSkipT = u16;
#[cfg(feature = "large_ast")]
type AstSkipT = u32;

const SKIP_SIZE: usize = std::mem::size_of::<AstSkipT>();
const SKIP_MAX: usize = AstSkipT::MAX as usize;

/// Tag byte flag marking a node that carries a line-number varint.
pub const TAG_LINENO_PRESENT: u8 = 0x80;

/// Skip slot shared by every open-ended node: offset of the node's end.
pub const SKIP_END: usize = 0;
/// `var`/`function` declaration chaining for hoisting.
pub const SKIP_VAR_NEXT: usize = 1;
/// First hoisted declaration of a `SCRIPT` node.
pub const SKIP_SCRIPT_FIRST_VAR: usize = 1;
/// Offset of a `FOR` node's body.
pub const SKIP_FOR_BODY: usize = 1;
/// Offset of a `DOWHILE` node's condition.
pub const SKIP_DOWHILE_COND: usize = 1;
/// Offset of the end of an `IF` node's true branch.
pub const SKIP_IF_TRUE_END: usize = 1;
/// Offset of a `TRY` node's catch clause.
pub const SKIP_TRY_CATCH: usize = 1;
/// Offset of a `TRY` node's finally clause.
pub const SKIP_TRY_FINALLY: usize = 2;
/// First hoisted declaration of a `FUNC` node.
pub const SKIP_FUNC_FIRST_VAR: usize = 1;
/// Offset of a `FUNC` node's body.
pub const SKIP_FUNC_BODY: usize = 2;
/// Offset of a `SWITCH` node's default clause.
pub const SKIP_SWITCH_DEFAULT: usize = 1;

macro_rules! ast_tags {
    ($(($variant:ident, $name:literal, $varint:literal, $inlined:literal,
        $skips:literal, $subtrees:literal)),* $(,)?) => {
        /// AST node tags.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        #[allow(missing_docs)]
        pub enum AstTag {
            $($variant),*
        }

        /// Static layout descriptor for each tag.
        #[derive(Debug, Clone, Copy)]
        pub struct AstNodeDef {
            /// Tag mnemonic, used by the text dump.
            pub name: &'static str,
            /// Whether a varint follows the skips (and line number).
            pub has_varint: bool,
            /// Whether inlined bytes (sized by the varint) follow.
            pub has_inlined: bool,
            /// Number of skip slots.
            pub num_skips: u8,
            /// Number of fixed subtrees before the open-ended children.
            pub num_subtrees: u8,
        }

        /// Descriptor table, indexed by tag byte.
        pub const AST_NODE_DEFS: &[AstNodeDef] = &[
            $(AstNodeDef {
                name: $name,
                has_varint: $varint != 0,
                has_inlined: $inlined != 0,
                num_skips: $skips,
                num_subtrees: $subtrees,
            }),*
        ];

        const TAG_LIST: &[AstTag] = &[$(AstTag::$variant),*];
    };
}

ast_tags! {
    (Nop, "NOP", 0, 0, 0, 0),
    (Script, "SCRIPT", 0, 0, 2, 0),
    (Var, "VAR", 0, 0, 2, 0),
    (VarDecl, "VAR_DECL", 1, 1, 0, 1),
    (FuncDecl, "FUNC_DECL", 1, 1, 0, 1),
    (If, "IF", 0, 0, 2, 1),
    (Func, "FUNC", 0, 0, 3, 1),
    (Assign, "ASSIGN", 0, 0, 0, 2),
    (RemAssign, "REM_ASSIGN", 0, 0, 0, 2),
    (MulAssign, "MUL_ASSIGN", 0, 0, 0, 2),
    (DivAssign, "DIV_ASSIGN", 0, 0, 0, 2),
    (XorAssign, "XOR_ASSIGN", 0, 0, 0, 2),
    (PlusAssign, "PLUS_ASSIGN", 0, 0, 0, 2),
    (MinusAssign, "MINUS_ASSIGN", 0, 0, 0, 2),
    (OrAssign, "OR_ASSIGN", 0, 0, 0, 2),
    (AndAssign, "AND_ASSIGN", 0, 0, 0, 2),
    (LshiftAssign, "LSHIFT_ASSIGN", 0, 0, 0, 2),
    (RshiftAssign, "RSHIFT_ASSIGN", 0, 0, 0, 2),
    (UrshiftAssign, "URSHIFT_ASSIGN", 0, 0, 0, 2),
    (Num, "NUM", 1, 1, 0, 0),
    (Ident, "IDENT", 1, 1, 0, 0),
    (Str, "STRING", 1, 1, 0, 0),
    (Regex, "REGEX", 1, 1, 0, 0),
    (Label, "LABEL", 1, 1, 0, 0),
    (Seq, "SEQ", 0, 0, 1, 0),
    (While, "WHILE", 0, 0, 1, 1),
    (DoWhile, "DOWHILE", 0, 0, 2, 0),
    (For, "FOR", 0, 0, 2, 3),
    (ForIn, "FOR_IN", 0, 0, 2, 3),
    (Cond, "COND", 0, 0, 0, 3),
    (Debugger, "DEBUGGER", 0, 0, 0, 0),
    (Break, "BREAK", 0, 0, 0, 0),
    (LabeledBreak, "LAB_BREAK", 0, 0, 0, 1),
    (Continue, "CONTINUE", 0, 0, 0, 0),
    (LabeledContinue, "LAB_CONTINUE", 0, 0, 0, 1),
    (Return, "RETURN", 0, 0, 0, 0),
    (ValueReturn, "VAL_RETURN", 0, 0, 0, 1),
    (Throw, "THROW", 0, 0, 0, 1),
    (Try, "TRY", 0, 0, 3, 1),
    (Switch, "SWITCH", 0, 0, 2, 1),
    (Case, "CASE", 0, 0, 1, 1),
    (Default, "DEFAULT", 0, 0, 1, 0),
    (With, "WITH", 0, 0, 1, 1),
    (LogicalOr, "LOG_OR", 0, 0, 0, 2),
    (LogicalAnd, "LOG_AND", 0, 0, 0, 2),
    (Or, "OR", 0, 0, 0, 2),
    (Xor, "XOR", 0, 0, 0, 2),
    (And, "AND", 0, 0, 0, 2),
    (Eq, "EQ", 0, 0, 0, 2),
    (EqEq, "EQ_EQ", 0, 0, 0, 2),
    (Ne, "NE", 0, 0, 0, 2),
    (NeNe, "NE_NE", 0, 0, 0, 2),
    (Le, "LE", 0, 0, 0, 2),
    (Lt, "LT", 0, 0, 0, 2),
    (Ge, "GE", 0, 0, 0, 2),
    (Gt, "GT", 0, 0, 0, 2),
    (In, "IN", 0, 0, 0, 2),
    (Instanceof, "INSTANCEOF", 0, 0, 0, 2),
    (Lshift, "LSHIFT", 0, 0, 0, 2),
    (Rshift, "RSHIFT", 0, 0, 0, 2),
    (Urshift, "URSHIFT", 0, 0, 0, 2),
    (Add, "ADD", 0, 0, 0, 2),
    (Sub, "SUB", 0, 0, 0, 2),
    (Rem, "REM", 0, 0, 0, 2),
    (Mul, "MUL", 0, 0, 0, 2),
    (Div, "DIV", 0, 0, 0, 2),
    (Positive, "POS", 0, 0, 0, 1),
    (Negative, "NEG", 0, 0, 0, 1),
    (Not, "NOT", 0, 0, 0, 1),
    (LogicalNot, "LOGICAL_NOT", 0, 0, 0, 1),
    (Void, "VOID", 0, 0, 0, 1),
    (Delete, "DELETE", 0, 0, 0, 1),
    (Typeof, "TYPEOF", 0, 0, 0, 1),
    (Preinc, "PREINC", 0, 0, 0, 1),
    (Predec, "PREDEC", 0, 0, 0, 1),
    (Postinc, "POSTINC", 0, 0, 0, 1),
    (Postdec, "POSTDEC", 0, 0, 0, 1),
    (Member, "MEMBER", 1, 1, 0, 1),
    (Index, "INDEX", 0, 0, 0, 2),
    (Call, "CALL", 0, 0, 1, 1),
    (New, "NEW", 0, 0, 1, 1),
    (Array, "ARRAY", 0, 0, 1, 0),
    (Object, "OBJECT", 0, 0, 1, 0),
    (Prop, "PROP", 1, 1, 0, 1),
    (Getter, "GETTER", 0, 0, 0, 1),
    (Setter, "SETTER", 0, 0, 0, 1),
    (This, "THIS", 0, 0, 0, 0),
    (True, "TRUE", 0, 0, 0, 0),
    (False, "FALSE", 0, 0, 0, 0),
    (Null, "NULL", 0, 0, 0, 0),
    (Undefined, "UNDEF", 0, 0, 0, 0),
    (UseStrict, "USE_STRICT", 0, 0, 0, 0),
}

impl AstTag {
    /// Decodes a raw tag byte, returning the tag and whether the
    /// line-number flag was set.
    pub fn from_byte(b: u8) -> (AstTag, bool) {
        let lineno = b & TAG_LINENO_PRESENT != 0;
        let t = b & !TAG_LINENO_PRESENT;
        debug_assert!((t as usize) < TAG_LIST.len());
        (TAG_LIST[t as usize], lineno)
    }

    /// Layout descriptor for this tag.
    pub fn def(self) -> &'static AstNodeDef {
        &AST_NODE_DEFS[self as usize]
    }
}

/// The packed AST buffer.
#[derive(Debug, Default)]
pub struct Ast {
    /// Raw node bytes.
    pub buf: Vec<u8>,
    /// One-shot flag set when a skip delta exceeded the skip width; the
    /// parser surfaces it as a "script too large" syntax error.
    pub has_overflow: bool,
}

impl Ast {
    /// Creates an empty AST.
    pub fn new() -> Ast {
        Ast {
            buf: Vec::new(),
            has_overflow: false,
        }
    }

    /// Wraps raw packed bytes (e.g. a deserialized binary AST).
    pub fn from_bytes(buf: Vec<u8>) -> Ast {
        Ast {
            buf,
            has_overflow: false,
        }
    }

    /// Inserts a node's tag byte and zeroed skip table at `pos`, setting
    /// the `end` skip to the current buffer end. Returns the offset one
    /// byte past the tag, which is what skip accessors expect.
    pub fn insert_node(&mut self, pos: usize, tag: AstTag) -> usize {
        let d = tag.def();
        let mut head = Vec::with_capacity(1 + SKIP_SIZE * d.num_skips as usize);
        head.push(tag as u8);
        head.resize(1 + SKIP_SIZE * d.num_skips as usize, 0);
        self.buf.splice(pos..pos, head);
        if d.num_skips > 0 {
            self.set_skip(pos + 1, SKIP_END);
        }
        pos + 1
    }

    /// Rewrites the tag of an already emitted node, preserving the
    /// line-number flag. Used to promote `for` to `for-in`.
    pub fn modify_tag(&mut self, tag_off: usize, tag: AstTag) {
        self.buf[tag_off] = tag as u8 | (self.buf[tag_off] & TAG_LINENO_PRESENT);
    }

    /// Attaches a line number to the node whose tag byte is at `tag_off`:
    /// inserts a varint after the skips and sets the tag flag.
    pub fn add_line_no(&mut self, tag_off: usize, line_no: u32) {
        let mut ln_off = tag_off + 1;
        self.move_to_inlined_data(&mut ln_off);
        let mut tmp = [0u8; 8];
        let llen = write_varint(&mut tmp, line_no as usize);
        self.buf.splice(ln_off..ln_off, tmp[..llen].iter().copied());
        debug_assert!(self.buf[tag_off] < TAG_LINENO_PRESENT);
        self.buf[tag_off] |= TAG_LINENO_PRESENT;
    }

    /// Patches skip slot `skip` of the node at `pos` (one past the tag)
    /// with the current buffer end. Returns the patched target.
    pub fn set_skip(&mut self, pos: usize, skip: usize) -> usize {
        self.modify_skip(pos, self.buf.len(), skip)
    }

    /// Patches skip slot `skip` of the node at `pos` with `target`,
    /// stored as a delta. An over-wide delta raises the overflow flag.
    pub fn modify_skip(&mut self, pos: usize, target: usize, skip: usize) -> usize {
        let delta = target - pos;
        if delta > SKIP_MAX {
            self.has_overflow = true;
            return target;
        }
        let off = pos + skip * SKIP_SIZE;
        let bytes = (delta as AstSkipT).to_be_bytes();
        self.buf[off..off + SKIP_SIZE].copy_from_slice(&bytes);
        target
    }

    /// Reads skip slot `skip` of the node at `pos` (one past the tag),
    /// returning the absolute offset it points to.
    pub fn get_skip(&self, pos: usize, skip: usize) -> usize {
        let off = pos + skip * SKIP_SIZE;
        let mut raw = [0u8; SKIP_SIZE];
        raw.copy_from_slice(&self.buf[off..off + SKIP_SIZE]);
        pos + AstSkipT::from_be_bytes(raw) as usize
    }

    /// Reads the tag at the cursor and advances past the tag byte.
    pub fn fetch_tag(&self, ppos: &mut usize) -> AstTag {
        let (tag, _) = AstTag::from_byte(self.buf[*ppos]);
        *ppos += 1;
        tag
    }

    /// Line number attached to the node at `pos` (one past the tag), or 0.
    pub fn get_line_no(&self, pos: usize) -> u32 {
        let (tag, lineno) = AstTag::from_byte(self.buf[pos - 1]);
        if !lineno {
            return 0;
        }
        let off = pos + tag.def().num_skips as usize * SKIP_SIZE;
        let (v, _) = read_varint(&self.buf[off..]);
        v as u32
    }

    /// Advances the cursor (positioned one past a tag) to the node's
    /// varint/inlined data: past the skip table and line number.
    pub fn move_to_inlined_data(&self, ppos: &mut usize) {
        let (tag, lineno) = AstTag::from_byte(self.buf[*ppos - 1]);
        *ppos += tag.def().num_skips as usize * SKIP_SIZE;
        if lineno {
            let (_, llen) = read_varint(&self.buf[*ppos..]);
            *ppos += llen;
        }
    }

    /// Advances the cursor (positioned one past a tag) to the node's
    /// first subtree: past skips, line number, and inlined data.
    pub fn move_to_children(&self, ppos: &mut usize) {
        let (tag, _) = AstTag::from_byte(self.buf[*ppos - 1]);
        let d = tag.def();
        self.move_to_inlined_data(ppos);
        if d.has_varint {
            let (len, llen) = read_varint(&self.buf[*ppos..]);
            *ppos += llen;
            if d.has_inlined {
                *ppos += len;
            }
        }
    }

    /// Inserts a node carrying inlined bytes at `pos`.
    pub fn insert_inlined_node(&mut self, pos: usize, tag: AstTag, data: &[u8]) -> usize {
        debug_assert!(tag.def().has_inlined);
        let offset = self.insert_node(pos, tag);
        let ins = offset + tag.def().num_skips as usize * SKIP_SIZE;
        let mut body = Vec::with_capacity(varint_len(data.len()) + data.len());
        let mut tmp = [0u8; 10];
        let llen = write_varint(&mut tmp, data.len());
        body.extend_from_slice(&tmp[..llen]);
        body.extend_from_slice(data);
        self.buf.splice(ins..ins, body);
        offset
    }

    /// Inlined bytes of the node at `pos` (one past the tag).
    pub fn get_inlined_data(&self, pos: usize) -> &[u8] {
        let mut p = pos;
        self.move_to_inlined_data(&mut p);
        let (len, llen) = read_varint(&self.buf[p..]);
        &self.buf[p + llen..p + llen + len]
    }

    /// Advances the cursor past a whole subtree. The cursor must be at a
    /// tag byte.
    pub fn skip_tree(&self, ppos: &mut usize) {
        let tag = self.fetch_tag(ppos);
        let d = tag.def();
        let pos_after_tag = *ppos;
        self.move_to_children(ppos);
        for _ in 0..d.num_subtrees {
            self.skip_tree(ppos);
        }
        if d.num_skips > 0 {
            let end = self.get_skip(pos_after_tag, SKIP_END);
            while *ppos < end {
                self.skip_tree(ppos);
            }
        }
    }

    /// Serializes the AST with its binary signature.
    pub fn to_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AST_SIGNATURE.len() + self.buf.len());
        out.extend_from_slice(AST_SIGNATURE);
        out.extend_from_slice(&self.buf);
        out
    }

    /// Deserializes a binary AST stream, validating the signature.
    pub fn from_binary(data: &[u8]) -> Option<Ast> {
        let body = data.strip_prefix(AST_SIGNATURE)?;
        Some(Ast::from_bytes(body.to_vec()))
    }

    /// Writes an indented text dump of the subtree at the cursor, one
    /// node per line, advancing the cursor past it.
    pub fn dump_tree(&self, out: &mut String, ppos: &mut usize, depth: usize) {
        let tag = self.fetch_tag(ppos);
        let d = tag.def();
        let pos_after_tag = *ppos;
        for _ in 0..depth {
            out.push_str("  ");
        }
        out.push_str(d.name);
        if d.has_inlined {
            out.push_str(" \"");
            out.push_str(&String::from_utf8_lossy(self.get_inlined_data(pos_after_tag)));
            out.push('"');
        }
        out.push('\n');
        self.move_to_children(ppos);
        for _ in 0..d.num_subtrees {
            self.dump_tree(out, ppos, depth + 1);
        }
        if d.num_skips > 0 {
            let end = self.get_skip(pos_after_tag, SKIP_END);
            while *ppos < end {
                self.dump_tree(out, ppos, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_table_is_complete() {
        assert_eq!(AST_NODE_DEFS.len(), TAG_LIST.len());
        assert!(AST_NODE_DEFS.len() <= TAG_LINENO_PRESENT as usize);
        assert_eq!(AstTag::UseStrict.def().name, "USE_STRICT");
    }

    #[test]
    fn test_simple_node_roundtrip() {
        let mut a = Ast::new();
        let start = a.buf.len();
        a.insert_node(start, AstTag::True);
        let mut pos = 0;
        assert_eq!(a.fetch_tag(&mut pos), AstTag::True);
        assert_eq!(pos, 1);
    }

    #[test]
    fn test_inlined_node() {
        let mut a = Ast::new();
        a.insert_inlined_node(0, AstTag::Ident, b"answer");
        let mut pos = 0;
        assert_eq!(a.fetch_tag(&mut pos), AstTag::Ident);
        assert_eq!(a.get_inlined_data(pos), b"answer");
        a.move_to_children(&mut pos);
        assert_eq!(pos, a.buf.len());
    }

    #[test]
    fn test_script_with_skips() {
        let mut a = Ast::new();
        let script = a.insert_node(0, AstTag::Script);
        a.insert_inlined_node(a.buf.len(), AstTag::Num, b"1");
        a.set_skip(script, SKIP_END);
        let end = a.get_skip(script, SKIP_END);
        assert_eq!(end, a.buf.len());
        let mut pos = script;
        a.move_to_children(&mut pos);
        assert_eq!(a.fetch_tag(&mut pos), AstTag::Num);
    }

    #[test]
    fn test_insert_node_in_the_middle() {
        // Build `IDENT`, then wrap it in a NEG node the way the parser
        // wraps an operand after seeing the operator.
        let mut a = Ast::new();
        let start = 0;
        a.insert_inlined_node(start, AstTag::Ident, b"x");
        a.insert_node(start, AstTag::Negative);
        let mut pos = 0;
        assert_eq!(a.fetch_tag(&mut pos), AstTag::Negative);
        a.move_to_children(&mut pos);
        assert_eq!(a.fetch_tag(&mut pos), AstTag::Ident);
    }

    #[test]
    fn test_modify_tag_promotes_for() {
        let mut a = Ast::new();
        a.insert_node(0, AstTag::For);
        a.modify_tag(0, AstTag::ForIn);
        let mut pos = 0;
        assert_eq!(a.fetch_tag(&mut pos), AstTag::ForIn);
    }

    #[test]
    fn test_line_numbers() {
        let mut a = Ast::new();
        let pos_after = a.insert_inlined_node(0, AstTag::Ident, b"v");
        assert_eq!(a.get_line_no(pos_after), 0);
        a.add_line_no(0, 42);
        assert_eq!(a.get_line_no(pos_after), 42);
        assert_eq!(a.get_inlined_data(pos_after), b"v");
    }

    #[test]
    fn test_skip_tree_over_binary_op() {
        let mut a = Ast::new();
        a.insert_node(0, AstTag::Add);
        a.insert_inlined_node(a.buf.len(), AstTag::Num, b"1");
        a.insert_inlined_node(a.buf.len(), AstTag::Num, b"2");
        let mut pos = 0;
        a.skip_tree(&mut pos);
        assert_eq!(pos, a.buf.len());
    }

    #[test]
    fn test_binary_roundtrip() {
        let mut a = Ast::new();
        let script = a.insert_node(0, AstTag::Script);
        a.insert_inlined_node(a.buf.len(), AstTag::Str, b"hi");
        a.set_skip(script, SKIP_END);
        let bin = a.to_binary();
        assert!(bin.starts_with(AST_SIGNATURE));
        let back = Ast::from_binary(&bin).unwrap();
        assert_eq!(back.buf, a.buf);
        assert!(Ast::from_binary(b"garbage").is_none());
    }

    #[test]
    fn test_dump_tree() {
        let mut a = Ast::new();
        let script = a.insert_node(0, AstTag::Script);
        a.insert_inlined_node(a.buf.len(), AstTag::Ident, b"x");
        a.set_skip(script, SKIP_END);
        let mut out = String::new();
        let mut pos = 0;
        a.dump_tree(&mut out, &mut pos, 0);
        assert_eq!(out, "SCRIPT\n  IDENT \"x\"\n");
    }
}
