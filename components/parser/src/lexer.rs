//! ES5 tokenizer.
//!
//! Produces one token at a time with byte-accurate source positions. The
//! `/` character is ambiguous between division and a regex literal; it is
//! resolved by the previous token: a regex is scanned only when the
//! preceding token cannot terminate an expression.

use core_types::SourcePosition;

use crate::error::ParseError;

/// ES5 keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    /// `break`
    Break,
    /// `case`
    Case,
    /// `catch`
    Catch,
    /// `continue`
    Continue,
    /// `debugger`
    Debugger,
    /// `default`
    Default,
    /// `delete`
    Delete,
    /// `do`
    Do,
    /// `else`
    Else,
    /// `false`
    False,
    /// `finally`
    Finally,
    /// `for`
    For,
    /// `function`
    Function,
    /// `if`
    If,
    /// `in`
    In,
    /// `instanceof`
    Instanceof,
    /// `new`
    New,
    /// `null`
    Null,
    /// `return`
    Return,
    /// `switch`
    Switch,
    /// `this`
    This,
    /// `throw`
    Throw,
    /// `true`
    True,
    /// `try`
    Try,
    /// `typeof`
    Typeof,
    /// `var`
    Var,
    /// `void`
    Void,
    /// `while`
    While,
    /// `with`
    With,
}

/// Sorted keyword table for binary search over identifier-like tokens.
static KEYWORDS: &[(&str, Keyword)] = &[
    ("break", Keyword::Break),
    ("case", Keyword::Case),
    ("catch", Keyword::Catch),
    ("continue", Keyword::Continue),
    ("debugger", Keyword::Debugger),
    ("default", Keyword::Default),
    ("delete", Keyword::Delete),
    ("do", Keyword::Do),
    ("else", Keyword::Else),
    ("false", Keyword::False),
    ("finally", Keyword::Finally),
    ("for", Keyword::For),
    ("function", Keyword::Function),
    ("if", Keyword::If),
    ("in", Keyword::In),
    ("instanceof", Keyword::Instanceof),
    ("new", Keyword::New),
    ("null", Keyword::Null),
    ("return", Keyword::Return),
    ("switch", Keyword::Switch),
    ("this", Keyword::This),
    ("throw", Keyword::Throw),
    ("true", Keyword::True),
    ("try", Keyword::Try),
    ("typeof", Keyword::Typeof),
    ("var", Keyword::Var),
    ("void", Keyword::Void),
    ("while", Keyword::While),
    ("with", Keyword::With),
];

/// Punctuators and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Semicolon,
    Comma,
    Dot,
    Colon,
    Question,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    EqEqEq,
    NotEq,
    NotEqEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Not,
    And,
    Or,
    Xor,
    Tilde,
    LtLt,
    GtGt,
    GtGtGt,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    AndEq,
    OrEq,
    XorEq,
    LtLtEq,
    GtGtEq,
    GtGtGtEq,
    PlusPlus,
    MinusMinus,
}

/// Token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Identifier, with `\uXXXX` escapes already decoded.
    Ident(String),
    /// Number literal; the raw source text is preserved for the AST.
    Number(String),
    /// String literal, with escapes decoded.
    Str(Vec<u8>),
    /// Regex literal: `source` body and `flags` letters.
    Regex {
        /// Pattern between the slashes.
        source: String,
        /// Flag letters (`g`, `i`, `m`).
        flags: String,
    },
    /// Keyword.
    Keyword(Keyword),
    /// Punctuator.
    Punct(Punct),
    /// End of input.
    Eof,
}

impl Tok {
    /// Whether this token can terminate an expression; if so, a following
    /// `/` is division, not a regex literal.
    fn ends_expression(&self) -> bool {
        matches!(
            self,
            Tok::Ident(_)
                | Tok::Number(_)
                | Tok::Str(_)
                | Tok::Regex { .. }
                | Tok::Keyword(Keyword::This | Keyword::True | Keyword::False | Keyword::Null)
                | Tok::Punct(
                    Punct::RParen | Punct::RBracket | Punct::RBrace | Punct::PlusPlus
                        | Punct::MinusMinus
                )
        )
    }
}

/// Saved lexer position, restorable with [`Lexer::restore`].
#[derive(Debug, Clone)]
pub struct LexerState {
    pos: usize,
    line: u32,
    column: u32,
    prev_tok: Option<Tok>,
    peeked: Option<(Tok, bool, u32)>,
    line_terminator_before_token: bool,
    tok_line: u32,
}

/// Tokenizer over a source string.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    line: u32,
    column: u32,
    prev_tok: Option<Tok>,
    peeked: Option<(Tok, bool, u32)>,
    /// Whether a line terminator preceded the most recently returned
    /// token; drives automatic semicolon insertion.
    pub line_terminator_before_token: bool,
    /// Line on which the most recently returned token starts.
    pub tok_line: u32,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer over `src`.
    pub fn new(src: &'a str) -> Lexer<'a> {
        Lexer {
            src,
            pos: 0,
            line: 1,
            column: 1,
            prev_tok: None,
            peeked: None,
            line_terminator_before_token: false,
            tok_line: 1,
        }
    }

    /// Current source position.
    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            line: self.line,
            column: self.column,
            offset: self.pos,
        }
    }

    /// Saves the full lexer state for backtracking.
    pub fn save(&self) -> LexerState {
        LexerState {
            pos: self.pos,
            line: self.line,
            column: self.column,
            prev_tok: self.prev_tok.clone(),
            peeked: self.peeked.clone(),
            line_terminator_before_token: self.line_terminator_before_token,
            tok_line: self.tok_line,
        }
    }

    /// Restores a previously saved state.
    pub fn restore(&mut self, st: LexerState) {
        self.pos = st.pos;
        self.line = st.line;
        self.column = st.column;
        self.prev_tok = st.prev_tok;
        self.peeked = st.peeked;
        self.line_terminator_before_token = st.line_terminator_before_token;
        self.tok_line = st.tok_line;
    }

    /// Returns the next token, consuming it.
    pub fn next_token(&mut self) -> Result<Tok, ParseError> {
        let (tok, nl, line) = match self.peeked.take() {
            Some(t) => t,
            None => self.scan()?,
        };
        self.line_terminator_before_token = nl;
        self.tok_line = line;
        self.prev_tok = Some(tok.clone());
        Ok(tok)
    }

    /// Peeks at the next token without consuming it.
    pub fn peek_token(&mut self) -> Result<&Tok, ParseError> {
        if self.peeked.is_none() {
            let t = self.scan()?;
            self.peeked = Some(t);
        }
        Ok(&self.peeked.as_ref().unwrap().0)
    }

    /// Whether a line terminator separates the last consumed token from
    /// the upcoming one.
    pub fn newline_before_peek(&mut self) -> Result<bool, ParseError> {
        if self.peeked.is_none() {
            let t = self.scan()?;
            self.peeked = Some(t);
        }
        Ok(self.peeked.as_ref().unwrap().1)
    }

    fn scan(&mut self) -> Result<(Tok, bool, u32), ParseError> {
        let line_before = self.line;
        self.skip_whitespace_and_comments();
        let newline_crossed = self.line > line_before;
        let tok_line = self.line;

        if self.at_end() {
            return Ok((Tok::Eof, newline_crossed, tok_line));
        }

        let ch = self.peek_char();
        let tok = if ch == '"' || ch == '\'' {
            self.scan_string(ch)?
        } else if ch.is_ascii_digit()
            || (ch == '.' && self.peek_char_at(1).is_some_and(|c| c.is_ascii_digit()))
        {
            self.scan_number()?
        } else if is_ident_start(ch) || ch == '\\' {
            self.scan_ident()?
        } else if ch == '/' && self.regex_allowed() {
            self.scan_regex()?
        } else {
            self.scan_punct()?
        };
        Ok((tok, newline_crossed, tok_line))
    }

    fn regex_allowed(&self) -> bool {
        match &self.prev_tok {
            Some(t) => !t.ends_expression(),
            None => true,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek_char(&self) -> char {
        self.src[self.pos..].chars().next().unwrap_or('\0')
    }

    fn peek_char_at(&self, n: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(n)
    }

    fn advance(&mut self) -> char {
        let ch = self.peek_char();
        self.pos += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        ch
    }

    fn match_char(&mut self, expected: char) -> bool {
        if !self.at_end() && self.peek_char() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            if self.at_end() {
                return;
            }
            let ch = self.peek_char();
            match ch {
                ' ' | '\t' | '\r' | '\n' | '\u{0b}' | '\u{0c}' | '\u{a0}' => {
                    self.advance();
                }
                '/' if self.peek_char_at(1) == Some('/') => {
                    while !self.at_end() && self.peek_char() != '\n' {
                        self.advance();
                    }
                }
                '/' if self.peek_char_at(1) == Some('*') => {
                    self.advance();
                    self.advance();
                    while !self.at_end() {
                        if self.peek_char() == '*' && self.peek_char_at(1) == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn err(&self, msg: impl Into<String>) -> ParseError {
        ParseError::new(msg.into(), self.position())
    }

    fn scan_string(&mut self, quote: char) -> Result<Tok, ParseError> {
        self.advance(); // opening quote
        let mut out: Vec<u8> = Vec::new();
        loop {
            if self.at_end() {
                return Err(self.err("unterminated string literal"));
            }
            let ch = self.advance();
            if ch == quote {
                break;
            }
            if ch == '\n' {
                return Err(self.err("unterminated string literal"));
            }
            if ch != '\\' {
                let mut buf = [0u8; 4];
                out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                continue;
            }
            if self.at_end() {
                return Err(self.err("unterminated string literal"));
            }
            let esc = self.advance();
            match esc {
                'b' => out.push(0x08),
                'f' => out.push(0x0C),
                'n' => out.push(b'\n'),
                'r' => out.push(b'\r'),
                't' => out.push(b'\t'),
                'v' => out.push(0x0B),
                '0' => out.push(0),
                '\n' => {} // line continuation
                'x' => {
                    let hi = self.hex_digit()?;
                    let lo = self.hex_digit()?;
                    out.push((hi << 4 | lo) as u8);
                }
                'u' => {
                    let cp = self.unicode_escape()?;
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(cp.encode_utf8(&mut buf).as_bytes());
                }
                other => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        Ok(Tok::Str(out))
    }

    fn hex_digit(&mut self) -> Result<u32, ParseError> {
        let ch = self.advance();
        ch.to_digit(16).ok_or_else(|| self.err("invalid hex escape"))
    }

    fn unicode_escape(&mut self) -> Result<char, ParseError> {
        let mut cp = 0u32;
        for _ in 0..4 {
            cp = cp << 4 | self.hex_digit()?;
        }
        char::from_u32(cp).ok_or_else(|| self.err("invalid unicode escape"))
    }

    fn scan_number(&mut self) -> Result<Tok, ParseError> {
        let start = self.pos;
        if self.peek_char() == '0'
            && matches!(self.peek_char_at(1), Some('x') | Some('X'))
        {
            self.advance();
            self.advance();
            if !self.peek_char().is_ascii_hexdigit() {
                return Err(self.err("invalid hex literal"));
            }
            while !self.at_end() && self.peek_char().is_ascii_hexdigit() {
                self.advance();
            }
        } else {
            while !self.at_end() && self.peek_char().is_ascii_digit() {
                self.advance();
            }
            if !self.at_end() && self.peek_char() == '.' {
                self.advance();
                while !self.at_end() && self.peek_char().is_ascii_digit() {
                    self.advance();
                }
            }
            if !self.at_end() && matches!(self.peek_char(), 'e' | 'E') {
                self.advance();
                if matches!(self.peek_char(), '+' | '-') {
                    self.advance();
                }
                if !self.peek_char().is_ascii_digit() {
                    return Err(self.err("invalid number literal"));
                }
                while !self.at_end() && self.peek_char().is_ascii_digit() {
                    self.advance();
                }
            }
        }
        let raw = &self.src[start..self.pos];
        if parse_js_number(raw).is_none() {
            return Err(self.err(format!("invalid number: {}", raw)));
        }
        Ok(Tok::Number(raw.to_string()))
    }

    fn scan_ident(&mut self) -> Result<Tok, ParseError> {
        let mut ident = String::new();
        loop {
            if self.at_end() {
                break;
            }
            let ch = self.peek_char();
            if ch == '\\' {
                if self.peek_char_at(1) != Some('u') {
                    return Err(self.err("invalid identifier escape"));
                }
                self.advance();
                self.advance();
                let cp = self.unicode_escape()?;
                if !(is_ident_start(cp) || cp.is_ascii_digit()) {
                    return Err(self.err("invalid identifier escape"));
                }
                ident.push(cp);
            } else if is_ident_start(ch) || (!ident.is_empty() && ch.is_ascii_digit()) {
                ident.push(self.advance());
            } else {
                break;
            }
        }
        if ident.is_empty() {
            return Err(self.err(format!("unexpected character '{}'", self.peek_char())));
        }
        match KEYWORDS.binary_search_by(|(k, _)| (*k).cmp(ident.as_str())) {
            Ok(i) => Ok(Tok::Keyword(KEYWORDS[i].1)),
            Err(_) => Ok(Tok::Ident(ident)),
        }
    }

    fn scan_regex(&mut self) -> Result<Tok, ParseError> {
        self.advance(); // leading slash
        let mut source = String::new();
        let mut in_class = false;
        loop {
            if self.at_end() || self.peek_char() == '\n' {
                return Err(self.err("unterminated regex literal"));
            }
            let ch = self.advance();
            match ch {
                '\\' => {
                    source.push(ch);
                    if self.at_end() {
                        return Err(self.err("unterminated regex literal"));
                    }
                    source.push(self.advance());
                }
                '[' => {
                    in_class = true;
                    source.push(ch);
                }
                ']' => {
                    in_class = false;
                    source.push(ch);
                }
                '/' if !in_class => break,
                _ => source.push(ch),
            }
        }
        let mut flags = String::new();
        while !self.at_end() && matches!(self.peek_char(), 'g' | 'i' | 'm') {
            flags.push(self.advance());
        }
        Ok(Tok::Regex { source, flags })
    }

    fn scan_punct(&mut self) -> Result<Tok, ParseError> {
        use Punct::*;
        let ch = self.advance();
        let p = match ch {
            '(' => LParen,
            ')' => RParen,
            '{' => LBrace,
            '}' => RBrace,
            '[' => LBracket,
            ']' => RBracket,
            ';' => Semicolon,
            ',' => Comma,
            '.' => Dot,
            ':' => Colon,
            '?' => Question,
            '~' => Tilde,
            '=' => {
                if self.match_char('=') {
                    if self.match_char('=') {
                        EqEqEq
                    } else {
                        EqEq
                    }
                } else {
                    Assign
                }
            }
            '!' => {
                if self.match_char('=') {
                    if self.match_char('=') {
                        NotEqEq
                    } else {
                        NotEq
                    }
                } else {
                    Not
                }
            }
            '+' => {
                if self.match_char('+') {
                    PlusPlus
                } else if self.match_char('=') {
                    PlusEq
                } else {
                    Plus
                }
            }
            '-' => {
                if self.match_char('-') {
                    MinusMinus
                } else if self.match_char('=') {
                    MinusEq
                } else {
                    Minus
                }
            }
            '*' => {
                if self.match_char('=') {
                    StarEq
                } else {
                    Star
                }
            }
            '/' => {
                if self.match_char('=') {
                    SlashEq
                } else {
                    Slash
                }
            }
            '%' => {
                if self.match_char('=') {
                    PercentEq
                } else {
                    Percent
                }
            }
            '<' => {
                if self.match_char('<') {
                    if self.match_char('=') {
                        LtLtEq
                    } else {
                        LtLt
                    }
                } else if self.match_char('=') {
                    LtEq
                } else {
                    Lt
                }
            }
            '>' => {
                if self.match_char('>') {
                    if self.match_char('>') {
                        if self.match_char('=') {
                            GtGtGtEq
                        } else {
                            GtGtGt
                        }
                    } else if self.match_char('=') {
                        GtGtEq
                    } else {
                        GtGt
                    }
                } else if self.match_char('=') {
                    GtEq
                } else {
                    Gt
                }
            }
            '&' => {
                if self.match_char('&') {
                    AndAnd
                } else if self.match_char('=') {
                    AndEq
                } else {
                    And
                }
            }
            '|' => {
                if self.match_char('|') {
                    OrOr
                } else if self.match_char('=') {
                    OrEq
                } else {
                    Or
                }
            }
            '^' => {
                if self.match_char('=') {
                    XorEq
                } else {
                    Xor
                }
            }
            other => return Err(self.err(format!("unexpected character '{}'", other))),
        };
        Ok(Tok::Punct(p))
    }
}

fn is_ident_start(ch: char) -> bool {
    ch == '$' || ch == '_' || ch.is_ascii_alphabetic() || (!ch.is_ascii() && ch.is_alphabetic())
}

/// Parses JavaScript number-literal text: decimal with optional fraction
/// and exponent, or `0x` hex. Returns `None` on malformed input.
pub fn parse_js_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    raw.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        let mut lx = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let t = lx.next_token().unwrap();
            if t == Tok::Eof {
                break;
            }
            out.push(t);
        }
        out
    }

    #[test]
    fn test_empty_source() {
        assert_eq!(toks(""), vec![]);
    }

    #[test]
    fn test_identifiers_and_keywords() {
        assert_eq!(
            toks("var $x _y foo1"),
            vec![
                Tok::Keyword(Keyword::Var),
                Tok::Ident("$x".into()),
                Tok::Ident("_y".into()),
                Tok::Ident("foo1".into()),
            ]
        );
    }

    #[test]
    fn test_unicode_escape_in_identifier() {
        assert_eq!(toks("\\u0061bc"), vec![Tok::Ident("abc".into())]);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            toks("1 2.5 .5 1e3 0x20"),
            vec![
                Tok::Number("1".into()),
                Tok::Number("2.5".into()),
                Tok::Number(".5".into()),
                Tok::Number("1e3".into()),
                Tok::Number("0x20".into()),
            ]
        );
        assert_eq!(parse_js_number("0x20"), Some(32.0));
        assert_eq!(parse_js_number("1e3"), Some(1000.0));
        assert_eq!(parse_js_number(".5"), Some(0.5));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            toks(r#"'a\tb\n\x41B'"#),
            vec![Tok::Str(b"a\tb\nAB".to_vec())]
        );
    }

    #[test]
    fn test_string_line_continuation() {
        assert_eq!(toks("'a\\\nb'"), vec![Tok::Str(b"ab".to_vec())]);
    }

    #[test]
    fn test_punct_ladder() {
        assert_eq!(
            toks(">>>= === !== >>> <<="),
            vec![
                Tok::Punct(Punct::GtGtGtEq),
                Tok::Punct(Punct::EqEqEq),
                Tok::Punct(Punct::NotEqEq),
                Tok::Punct(Punct::GtGtGt),
                Tok::Punct(Punct::LtLtEq),
            ]
        );
    }

    #[test]
    fn test_regex_vs_division() {
        // After an identifier, slash is division.
        assert_eq!(
            toks("a / b"),
            vec![
                Tok::Ident("a".into()),
                Tok::Punct(Punct::Slash),
                Tok::Ident("b".into()),
            ]
        );
        // After `=`, slash starts a regex literal.
        assert_eq!(
            toks("x = /ab[/]c/gi"),
            vec![
                Tok::Ident("x".into()),
                Tok::Punct(Punct::Assign),
                Tok::Regex {
                    source: "ab[/]c".into(),
                    flags: "gi".into()
                },
            ]
        );
    }

    #[test]
    fn test_comments_and_newline_flag() {
        let mut lx = Lexer::new("a // trailing\nb /* c */ d");
        assert_eq!(lx.next_token().unwrap(), Tok::Ident("a".into()));
        assert_eq!(lx.next_token().unwrap(), Tok::Ident("b".into()));
        assert!(lx.line_terminator_before_token);
        assert_eq!(lx.next_token().unwrap(), Tok::Ident("d".into()));
        assert!(!lx.line_terminator_before_token);
    }

    #[test]
    fn test_save_restore() {
        let mut lx = Lexer::new("a b c");
        assert_eq!(lx.next_token().unwrap(), Tok::Ident("a".into()));
        let st = lx.save();
        assert_eq!(lx.next_token().unwrap(), Tok::Ident("b".into()));
        lx.restore(st);
        assert_eq!(lx.next_token().unwrap(), Tok::Ident("b".into()));
    }

    #[test]
    fn test_reserved_word_is_keyword() {
        assert_eq!(toks("in"), vec![Tok::Keyword(Keyword::In)]);
        assert_eq!(toks("instanceof"), vec![Tok::Keyword(Keyword::Instanceof)]);
    }
}
