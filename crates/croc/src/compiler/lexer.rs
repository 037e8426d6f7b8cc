//! The lexer: source text to tokens.
//!
//! Tracks a `{file, line, col}` location per token, captures doc comments
//! onto neighboring tokens, honors `#line` pragmas, and knows the full
//! literal surface: escape-rich and raw strings, verbatim `[[...]]` /
//! `[=[...]=]` strings, and binary/hex/decimal/float numeric literals with
//! `_` digit separators.

use strum::Display;

use crate::{
    compiler::{CompileLoc, CompilerFlags},
    errors::{CompileError, CompilePhase},
    intern::{Interns, StringId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum TokenKind {
    // Keywords
    #[strum(serialize = "and")]
    And,
    #[strum(serialize = "as")]
    As,
    #[strum(serialize = "assert")]
    Assert,
    #[strum(serialize = "break")]
    Break,
    #[strum(serialize = "case")]
    Case,
    #[strum(serialize = "catch")]
    Catch,
    #[strum(serialize = "class")]
    Class,
    #[strum(serialize = "continue")]
    Continue,
    #[strum(serialize = "default")]
    Default,
    #[strum(serialize = "do")]
    Do,
    #[strum(serialize = "else")]
    Else,
    #[strum(serialize = "false")]
    False,
    #[strum(serialize = "finally")]
    Finally,
    #[strum(serialize = "for")]
    For,
    #[strum(serialize = "foreach")]
    Foreach,
    #[strum(serialize = "function")]
    Function,
    #[strum(serialize = "global")]
    Global,
    #[strum(serialize = "if")]
    If,
    #[strum(serialize = "import")]
    Import,
    #[strum(serialize = "in")]
    In,
    #[strum(serialize = "is")]
    Is,
    #[strum(serialize = "local")]
    Local,
    #[strum(serialize = "namespace")]
    Namespace,
    #[strum(serialize = "not")]
    Not,
    #[strum(serialize = "null")]
    Null,
    #[strum(serialize = "or")]
    Or,
    #[strum(serialize = "return")]
    Return,
    #[strum(serialize = "scope")]
    Scope,
    #[strum(serialize = "switch")]
    Switch,
    #[strum(serialize = "this")]
    This,
    #[strum(serialize = "throw")]
    Throw,
    #[strum(serialize = "true")]
    True,
    #[strum(serialize = "try")]
    Try,
    #[strum(serialize = "vararg")]
    Vararg,
    #[strum(serialize = "while")]
    While,
    #[strum(serialize = "yield")]
    Yield,

    // Symbols
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "+=")]
    AddEq,
    #[strum(serialize = "++")]
    Inc,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "-=")]
    SubEq,
    #[strum(serialize = "--")]
    Dec,
    #[strum(serialize = "~")]
    Cat,
    #[strum(serialize = "~=")]
    CatEq,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "*=")]
    MulEq,
    #[strum(serialize = "?=")]
    DefaultEq,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "/=")]
    DivEq,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "%=")]
    ModEq,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = "<=>")]
    Cmp3,
    #[strum(serialize = "<<")]
    Shl,
    #[strum(serialize = "<<=")]
    ShlEq,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = ">>")]
    Shr,
    #[strum(serialize = ">>=")]
    ShrEq,
    #[strum(serialize = ">>>")]
    UShr,
    #[strum(serialize = ">>>=")]
    UShrEq,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "&=")]
    BitAndEq,
    #[strum(serialize = "&&")]
    AndAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "|=")]
    BitOrEq,
    #[strum(serialize = "||")]
    OrOr,
    #[strum(serialize = "^")]
    Xor,
    #[strum(serialize = "^=")]
    XorEq,
    #[strum(serialize = "=")]
    Assign,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = ".")]
    Dot,
    #[strum(serialize = "..")]
    DotDot,
    #[strum(serialize = "...")]
    Ellipsis,
    #[strum(serialize = "!")]
    Bang,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "(")]
    LParen,
    #[strum(serialize = ")")]
    RParen,
    #[strum(serialize = "[")]
    LBracket,
    #[strum(serialize = "]")]
    RBracket,
    #[strum(serialize = "{{")]
    LBrace,
    #[strum(serialize = "}}")]
    RBrace,
    #[strum(serialize = ":")]
    Colon,
    #[strum(serialize = ",")]
    Comma,
    #[strum(serialize = ";")]
    Semicolon,
    #[strum(serialize = "#")]
    Length,
    #[strum(serialize = "?")]
    Question,
    #[strum(serialize = "\\")]
    Backslash,
    #[strum(serialize = "->")]
    Arrow,
    #[strum(serialize = "@")]
    At,

    // Value-carrying tokens
    #[strum(serialize = "Identifier")]
    Ident,
    #[strum(serialize = "String Literal")]
    StringLiteral,
    #[strum(serialize = "Int Literal")]
    IntLiteral,
    #[strum(serialize = "Float Literal")]
    FloatLiteral,
    #[strum(serialize = "<EOF>")]
    Eof,
}

fn lookup_keyword(s: &str) -> Option<TokenKind> {
    use TokenKind as T;
    Some(match s {
        "and" => T::And,
        "as" => T::As,
        "assert" => T::Assert,
        "break" => T::Break,
        "case" => T::Case,
        "catch" => T::Catch,
        "class" => T::Class,
        "continue" => T::Continue,
        "default" => T::Default,
        "do" => T::Do,
        "else" => T::Else,
        "false" => T::False,
        "finally" => T::Finally,
        "for" => T::For,
        "foreach" => T::Foreach,
        "function" => T::Function,
        "global" => T::Global,
        "if" => T::If,
        "import" => T::Import,
        "in" => T::In,
        "is" => T::Is,
        "local" => T::Local,
        "namespace" => T::Namespace,
        "not" => T::Not,
        "null" => T::Null,
        "or" => T::Or,
        "return" => T::Return,
        "scope" => T::Scope,
        "switch" => T::Switch,
        "this" => T::This,
        "throw" => T::Throw,
        "true" => T::True,
        "try" => T::Try,
        "vararg" => T::Vararg,
        "while" => T::While,
        "yield" => T::Yield,
        _ => return None,
    })
}

#[derive(Debug, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub loc: CompileLoc,
    /// Payload of identifier and string tokens.
    pub string_value: Option<StringId>,
    pub int_value: i64,
    pub float_value: f64,
    /// True when at least one newline separates this token from the previous.
    pub newline_before: bool,
    /// Doc comment preceding this token on its own line(s).
    pub pre_comment: Option<(StringId, CompileLoc)>,
}

impl Token {
    fn at(kind: TokenKind, loc: CompileLoc) -> Self {
        Self {
            kind,
            loc,
            string_value: None,
            int_value: 0,
            float_value: 0.0,
            newline_before: false,
            pre_comment: None,
        }
    }
}

pub(crate) struct Lexer<'a> {
    interns: &'a mut Interns,
    flags: CompilerFlags,
    file_name: String,
    file_id: StringId,
    chars: Vec<char>,
    pos: usize,
    loc: CompileLoc,
    tok: Token,
    peeked: Option<Token>,
    newline_since_last_tok: bool,
    tok_since_last_newline: bool,
    pending_pre_comment: Option<(StringId, CompileLoc)>,
    /// Doc comment trailing the most recently returned token on its line.
    post_comment: Option<(StringId, CompileLoc)>,
    line_pragma: Option<(u32, Option<StringId>)>,
}

impl<'a> Lexer<'a> {
    pub fn new(
        interns: &'a mut Interns,
        flags: CompilerFlags,
        file_name: &str,
        source: &str,
    ) -> Result<Self, CompileError> {
        let file_id = interns.intern(file_name);
        let mut chars: Vec<char> = source.chars().collect();
        // Optional shebang on line 1.
        if chars.len() >= 2 && chars[0] == '#' && chars[1] == '!' {
            let end = chars.iter().position(|&c| c == '\n' || c == '\r').unwrap_or(chars.len());
            chars.drain(..end);
        }
        let mut lexer = Self {
            interns,
            flags,
            file_name: file_name.to_owned(),
            file_id,
            chars,
            pos: 0,
            loc: CompileLoc { file: file_id, line: 1, col: 1 },
            tok: Token::at(TokenKind::Eof, CompileLoc { file: file_id, line: 1, col: 1 }),
            peeked: None,
            newline_since_last_tok: true,
            tok_since_last_newline: false,
            pending_pre_comment: None,
            post_comment: None,
            line_pragma: None,
        };
        lexer.next()?;
        Ok(lexer)
    }

    pub fn interns(&self) -> &Interns {
        self.interns
    }

    pub fn interns_mut(&mut self) -> &mut Interns {
        self.interns
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_id(&self) -> StringId {
        self.file_id
    }

    pub fn tok(&self) -> &Token {
        &self.tok
    }

    pub fn loc(&self) -> CompileLoc {
        self.tok.loc
    }

    /// Doc comment trailing the most recently consumed token, if any.
    pub fn take_post_comment(&mut self) -> Option<(StringId, CompileLoc)> {
        self.post_comment.take()
    }

    pub fn error(&self, loc: CompileLoc, msg: impl Into<String>) -> CompileError {
        self.error_at(CompilePhase::Lexical, loc, msg.into(), false)
    }

    fn eof_error(&self, loc: CompileLoc, msg: impl Into<String>) -> CompileError {
        self.error_at(CompilePhase::Lexical, loc, msg.into(), true)
    }

    pub fn syn_error(&self, loc: CompileLoc, msg: impl Into<String>) -> CompileError {
        self.error_at(CompilePhase::Syntax, loc, msg.into(), false)
    }

    fn error_at(&self, phase: CompilePhase, loc: CompileLoc, msg: String, is_eof: bool) -> CompileError {
        let file = if loc.file == self.file_id {
            self.file_name.clone()
        } else {
            self.interns.get(loc.file).to_owned()
        };
        let mut e = CompileError::new(phase, msg, &file, loc.line, loc.col);
        e.is_eof = is_eof;
        e
    }

    // === Token stream interface used by the parser ===

    /// Advances to the next token and returns the one that was current.
    pub fn next(&mut self) -> Result<Token, CompileError> {
        let prev = self.tok.clone();
        self.tok = match self.peeked.take() {
            Some(t) => t,
            None => self.next_token()?,
        };
        Ok(prev)
    }

    pub fn peek(&mut self) -> Result<&Token, CompileError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.next_token()?);
        }
        Ok(self.peeked.as_ref().expect("just set"))
    }

    pub fn check(&self, kind: TokenKind) -> bool {
        self.tok.kind == kind
    }

    pub fn expect(&mut self, kind: TokenKind) -> Result<Token, CompileError> {
        if self.tok.kind == kind {
            self.next()
        } else {
            Err(self.syn_error(self.tok.loc, format!("'{}' expected, not '{}'", kind, self.tok.kind)))
        }
    }

    /// True when the current position satisfies a statement terminator.
    pub fn is_statement_term(&self) -> bool {
        self.tok.newline_before
            || matches!(
                self.tok.kind,
                TokenKind::Eof | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::RParen | TokenKind::RBracket
            )
    }

    /// Consumes a statement terminator: a newline-before suffices, a
    /// semicolon is consumed, closers and EOF satisfy without consuming.
    pub fn statement_term(&mut self) -> Result<(), CompileError> {
        if self.tok.newline_before {
            return Ok(());
        }
        match self.tok.kind {
            TokenKind::Eof | TokenKind::RBrace | TokenKind::RParen | TokenKind::RBracket => Ok(()),
            TokenKind::Semicolon => {
                self.next()?;
                Ok(())
            }
            other => Err(self.syn_error(self.tok.loc, format!("Statement terminator expected, not '{other}'"))),
        }
    }

    // === Character-level machinery ===

    fn cur(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn ahead(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
        self.loc.col += 1;
    }

    /// Consumes one line terminator (LF, CR, or CRLF) and advances the line
    /// counter, applying any pending `#line` pragma.
    fn next_line(&mut self) {
        match self.cur() {
            Some('\r') => {
                self.pos += 1;
                if self.cur() == Some('\n') {
                    self.pos += 1;
                }
            }
            Some('\n') => self.pos += 1,
            _ => return,
        }
        if let Some((line, file)) = self.line_pragma.take() {
            self.loc.line = line;
            if let Some(f) = file {
                self.loc.file = f;
            }
        } else {
            self.loc.line += 1;
        }
        self.loc.col = 1;
        self.tok_since_last_newline = false;
    }

    fn is_eol(&self) -> bool {
        matches!(self.cur(), None | Some('\n' | '\r'))
    }

    // === Comments and pragmas ===

    fn add_doc_comment(&mut self, text: String, loc: CompileLoc) -> Result<(), CompileError> {
        let id = self.interns.intern(&text);
        if self.tok_since_last_newline {
            if self.post_comment.is_some() {
                return Err(self.error(loc, "Cannot have multiple doc comments in a row; merge them into one comment"));
            }
            self.post_comment = Some((id, loc));
        } else {
            if self.pending_pre_comment.is_some() {
                return Err(self.error(loc, "Cannot have multiple doc comments in a row; merge them into one comment"));
            }
            self.pending_pre_comment = Some((id, loc));
        }
        Ok(())
    }

    /// Already consumed `//`; handles doc comments and plain line comments.
    fn read_line_comment(&mut self) -> Result<(), CompileError> {
        if self.flags.doc_comments && self.cur() == Some('/') {
            self.advance();
            let loc = self.loc;
            while self.cur() == Some('/') {
                self.advance();
            }
            while matches!(self.cur(), Some(' ' | '\t')) {
                self.advance();
            }
            let mut buf = String::new();
            while !self.is_eol() {
                buf.push(self.cur().expect("not eol"));
                self.advance();
            }
            buf.push('\n');
            self.add_doc_comment(buf, loc)?;
        } else {
            while !self.is_eol() {
                self.advance();
            }
        }
        Ok(())
    }

    /// Already consumed `#`; tries to read a `#line N "file"` pragma and
    /// falls back to a plain comment-to-end-of-line.
    fn read_line_pragma(&mut self) -> Result<(), CompileError> {
        let word: String = (0..4).filter_map(|i| self.ahead(i)).collect();
        if word != "line" || !matches!(self.ahead(4), Some(' ' | '\t')) {
            while !self.is_eol() {
                self.advance();
            }
            return Ok(());
        }
        for _ in 0..4 {
            self.advance();
        }
        while matches!(self.cur(), Some(' ' | '\t')) {
            self.advance();
        }
        if !matches!(self.cur(), Some('0'..='9')) {
            return Err(self.error(self.loc, "Line number expected"));
        }
        let num_loc = self.loc;
        let mut digits = String::new();
        while matches!(self.cur(), Some('0'..='9' | '_')) {
            if self.cur() != Some('_') {
                digits.push(self.cur().expect("digit"));
            }
            self.advance();
        }
        let line: u32 = digits.parse().map_err(|_| self.error(num_loc, "Line number overflow"))?;
        if line < 1 {
            return Err(self.error(num_loc, "Invalid line number"));
        }

        let mut file = None;
        if !self.is_eol() {
            if !matches!(self.cur(), Some(' ' | '\t')) {
                return Err(self.error(self.loc, "Filename expected"));
            }
            while matches!(self.cur(), Some(' ' | '\t')) {
                self.advance();
            }
            if self.cur() != Some('"') {
                return Err(self.error(self.loc, "Filename expected"));
            }
            let name_loc = self.loc;
            self.advance();
            let mut buf = String::new();
            while self.cur() != Some('"') {
                if self.is_eol() {
                    return Err(self.error(self.loc, "Unterminated line pragma filename"));
                }
                buf.push(self.cur().expect("not eol"));
                self.advance();
            }
            if buf.is_empty() {
                return Err(self.error(name_loc, "Filename cannot be empty"));
            }
            self.advance();
            if !self.is_eol() {
                return Err(self.error(self.loc, "End-of-line expected immediately after line pragma"));
            }
            file = Some(self.interns.intern(&buf));
        }

        self.line_pragma = Some((line, file));
        Ok(())
    }

    /// Already consumed `/*`; block comments nest, and `/** ... */` is a doc
    /// comment.
    fn read_block_comment(&mut self, begin: CompileLoc) -> Result<(), CompileError> {
        let is_doc = self.flags.doc_comments && self.cur() == Some('*') && self.ahead(1) != Some('/');
        let mut buf = String::new();
        let doc_loc;
        if is_doc {
            self.advance();
            doc_loc = self.loc;
        } else {
            doc_loc = begin;
        }

        let mut nesting = 1usize;
        loop {
            match self.cur() {
                None => return Err(self.eof_error(begin, "Unterminated block comment")),
                Some('/') if self.ahead(1) == Some('*') => {
                    nesting += 1;
                    buf.push_str("/*");
                    self.advance();
                    self.advance();
                }
                Some('*') if self.ahead(1) == Some('/') => {
                    self.advance();
                    self.advance();
                    nesting -= 1;
                    if nesting == 0 {
                        break;
                    }
                    buf.push_str("*/");
                }
                Some('\n' | '\r') => {
                    buf.push('\n');
                    self.next_line();
                }
                Some(c) => {
                    buf.push(c);
                    self.advance();
                }
            }
        }

        if is_doc {
            self.add_doc_comment(buf, doc_loc)?;
        }
        Ok(())
    }

    // === Literals ===

    fn read_hex_digits(&mut self, num: usize) -> Result<u32, CompileError> {
        let mut ret: u32 = 0;
        for _ in 0..num {
            let Some(c) = self.cur().filter(char::is_ascii_hexdigit) else {
                return Err(self.error(self.loc, "Hexadecimal escape digits expected"));
            };
            ret = (ret << 4) | c.to_digit(16).expect("hex digit");
            self.advance();
        }
        Ok(ret)
    }

    fn read_escape_sequence(&mut self, begin: CompileLoc) -> Result<char, CompileError> {
        debug_assert_eq!(self.cur(), Some('\\'));
        self.advance();
        let Some(c) = self.cur() else {
            return Err(self.eof_error(begin, "Unterminated string literal"));
        };
        let ret = match c {
            'n' => {
                self.advance();
                '\n'
            }
            'r' => {
                self.advance();
                '\r'
            }
            't' => {
                self.advance();
                '\t'
            }
            '\\' => {
                self.advance();
                '\\'
            }
            '"' => {
                self.advance();
                '"'
            }
            '\'' => {
                self.advance();
                '\''
            }
            'x' => {
                self.advance();
                let x = self.read_hex_digits(2)?;
                if x > 0x7F {
                    return Err(self.error(self.loc, "Hexadecimal escape sequence too large"));
                }
                char::from_u32(x).expect("ascii")
            }
            'u' => {
                self.advance();
                let x = self.read_hex_digits(4)?;
                if x == 0xFFFE || x == 0xFFFF {
                    return Err(self.error(self.loc, format!("Unicode escape '\\u{x:04x}' is illegal")));
                }
                char::from_u32(x).ok_or_else(|| self.error(self.loc, format!("Unicode escape '\\u{x:04x}' is illegal")))?
            }
            'U' => {
                self.advance();
                let x = self.read_hex_digits(8)?;
                if x == 0xFFFE || x == 0xFFFF {
                    return Err(self.error(self.loc, format!("Unicode escape '\\U{x:08x}' is illegal")));
                }
                char::from_u32(x).ok_or_else(|| self.error(self.loc, format!("Unicode escape '\\U{x:08x}' too large")))?
            }
            '0'..='9' => {
                let mut n = 0u32;
                let mut count = 0;
                while count < 3 && matches!(self.cur(), Some('0'..='9')) {
                    n = n * 10 + self.cur().expect("digit").to_digit(10).expect("digit");
                    self.advance();
                    count += 1;
                }
                if n > 0x7F {
                    return Err(self.error(self.loc, "Numeric escape sequence too large"));
                }
                char::from_u32(n).expect("ascii")
            }
            other => return Err(self.error(self.loc, format!("Invalid string escape sequence '\\{other}'"))),
        };
        Ok(ret)
    }

    /// Reads a quoted string literal; `escape` is false for `@"..."` raw
    /// strings.
    fn read_string_literal(&mut self, escape: bool) -> Result<StringId, CompileError> {
        let begin = self.loc;
        let delimiter = self.cur().expect("string opener");
        self.advance();

        let mut buf = String::new();
        loop {
            match self.cur() {
                None => return Err(self.eof_error(begin, "Unterminated string literal")),
                Some('\r' | '\n') => {
                    buf.push('\n');
                    self.next_line();
                }
                Some('\\') if escape => {
                    let c = self.read_escape_sequence(begin)?;
                    buf.push(c);
                }
                Some(c) if c == delimiter => break,
                Some(c) => {
                    buf.push(c);
                    self.advance();
                }
            }
        }

        self.advance();
        Ok(self.interns.intern(&buf))
    }

    /// Reads `[[...]]` / `[=[...]=]` verbatim strings; already consumed the
    /// first `[`. Returns `None` if this is not a verbatim opening (plain
    /// `[` token).
    fn read_verbatim_string(&mut self, begin: CompileLoc) -> Result<Option<StringId>, CompileError> {
        let mut equals = 0usize;
        while self.ahead(equals) == Some('=') {
            equals += 1;
        }
        if self.ahead(equals) != Some('[') {
            return Ok(None);
        }
        for _ in 0..=equals {
            self.advance();
        }
        // A newline immediately after the opening is not part of the string.
        if matches!(self.cur(), Some('\n' | '\r')) {
            self.next_line();
        }

        let mut buf = String::new();
        loop {
            match self.cur() {
                None => return Err(self.eof_error(begin, "Unterminated verbatim string literal")),
                Some('\n' | '\r') => {
                    buf.push('\n');
                    self.next_line();
                }
                Some(']') => {
                    let mut count = 0usize;
                    while self.ahead(1 + count) == Some('=') {
                        count += 1;
                    }
                    if count == equals && self.ahead(1 + count) == Some(']') {
                        for _ in 0..(equals + 2) {
                            self.advance();
                        }
                        return Ok(Some(self.interns.intern(&buf)));
                    }
                    buf.push(']');
                    self.advance();
                }
                Some(c) => {
                    buf.push(c);
                    self.advance();
                }
            }
        }
    }

    /// Numeric literal: decimal (with `_` separators), `0x...`, `0b...`, or
    /// a float with optional exponent. `prepend_point` handles the `.5` form.
    fn read_num_literal(&mut self, prepend_point: bool) -> Result<(TokenKind, i64, f64), CompileError> {
        let begin = self.loc;
        let mut buf = String::new();
        let mut has_point = false;

        if prepend_point {
            has_point = true;
            buf.push('.');
        } else if self.cur() == Some('0') {
            self.advance();
            match self.cur() {
                Some('b' | 'B') => {
                    self.advance();
                    if !matches!(self.cur(), Some('0' | '1' | '_')) {
                        return Err(self.error(self.loc, "Binary digit expected"));
                    }
                    while matches!(self.cur(), Some('0' | '1' | '_')) {
                        if self.cur() != Some('_') {
                            buf.push(self.cur().expect("digit"));
                        }
                        self.advance();
                    }
                    let v = u64::from_str_radix(&buf, 2)
                        .map_err(|_| self.error(begin, "Binary integer literal overflow"))?;
                    return Ok((TokenKind::IntLiteral, v as i64, 0.0));
                }
                Some('x' | 'X') => {
                    self.advance();
                    if !matches!(self.cur(), Some(c) if c.is_ascii_hexdigit() || c == '_') {
                        return Err(self.error(self.loc, "Hexadecimal digit expected"));
                    }
                    while matches!(self.cur(), Some(c) if c.is_ascii_hexdigit() || c == '_') {
                        if self.cur() != Some('_') {
                            buf.push(self.cur().expect("digit"));
                        }
                        self.advance();
                    }
                    let v = u64::from_str_radix(&buf, 16)
                        .map_err(|_| self.error(begin, "Hexadecimal integer literal overflow"))?;
                    return Ok((TokenKind::IntLiteral, v as i64, 0.0));
                }
                _ => buf.push('0'),
            }
        }

        while !has_point {
            match self.cur() {
                Some(c @ '0'..='9') => {
                    buf.push(c);
                    self.advance();
                }
                Some('.') => match self.ahead(1) {
                    Some('0'..='9' | '_') => {
                        has_point = true;
                        buf.push('.');
                        self.advance();
                        if let Some(c @ '0'..='9') = self.cur() {
                            buf.push(c);
                            self.advance();
                        } else if self.cur() == Some('_') {
                            self.advance();
                        }
                    }
                    // The next token is `..` or a field access.
                    _ => break,
                },
                Some('_') => self.advance(),
                _ => break,
            }
        }

        let mut has_exponent = false;
        loop {
            match self.cur() {
                Some(c @ '0'..='9') => {
                    buf.push(c);
                    self.advance();
                }
                Some('e' | 'E') => {
                    has_exponent = true;
                    buf.push('e');
                    self.advance();
                    if matches!(self.cur(), Some('-' | '+')) {
                        buf.push(self.cur().expect("sign"));
                        self.advance();
                    }
                    if !matches!(self.cur(), Some('0'..='9' | '_')) {
                        return Err(self.error(self.loc, format!("Exponent value expected in float literal '{buf}'")));
                    }
                    while matches!(self.cur(), Some('0'..='9' | '_')) {
                        if self.cur() != Some('_') {
                            buf.push(self.cur().expect("digit"));
                        }
                        self.advance();
                    }
                    break;
                }
                Some('_') => self.advance(),
                _ => break,
            }
        }

        if !has_point && !has_exponent {
            let v: i64 = buf.parse().map_err(|_| self.error(begin, "Decimal integer literal overflow"))?;
            Ok((TokenKind::IntLiteral, v, 0.0))
        } else {
            let v: f64 = buf.parse().map_err(|_| self.error(begin, "Invalid floating point literal"))?;
            Ok((TokenKind::FloatLiteral, 0, v))
        }
    }

    // === The token scanner ===

    fn next_token(&mut self) -> Result<Token, CompileError> {
        self.newline_since_last_tok = false;

        loop {
            let loc = self.loc;
            let Some(c) = self.cur() else {
                let mut t = Token::at(TokenKind::Eof, loc);
                t.newline_before = true;
                t.pre_comment = self.pending_pre_comment.take();
                return Ok(t);
            };

            match c {
                '\r' | '\n' => {
                    self.newline_since_last_tok = true;
                    self.next_line();
                    continue;
                }
                ' ' | '\t' | '\u{000B}' | '\u{000C}' => {
                    self.advance();
                    continue;
                }
                '/' => {
                    if self.ahead(1) == Some('/') {
                        self.advance();
                        self.advance();
                        self.read_line_comment()?;
                        continue;
                    }
                    if self.ahead(1) == Some('*') {
                        self.advance();
                        self.advance();
                        self.read_block_comment(loc)?;
                        continue;
                    }
                    return self.finish_symbol(loc);
                }
                '#' => {
                    // `#line` pragmas look like comments; a bare `#` is the
                    // length operator.
                    let is_pragma = {
                        let word: String = (1..5).filter_map(|i| self.ahead(i)).collect();
                        word == "line" && matches!(self.ahead(5), Some(' ' | '\t'))
                    };
                    if is_pragma {
                        self.advance();
                        self.read_line_pragma()?;
                        continue;
                    }
                    return self.finish_symbol(loc);
                }
                _ => return self.finish_symbol(loc),
            }
        }
    }

    fn make_token(&mut self, kind: TokenKind, loc: CompileLoc) -> Token {
        let mut t = Token::at(kind, loc);
        t.newline_before = self.newline_since_last_tok;
        t.pre_comment = self.pending_pre_comment.take();
        self.tok_since_last_newline = true;
        t
    }

    fn finish_symbol(&mut self, loc: CompileLoc) -> Result<Token, CompileError> {
        use TokenKind as T;
        let c = self.cur().expect("caller checked");

        // Identifiers and keywords
        if c.is_alphabetic() || c == '_' {
            let mut name = String::new();
            while let Some(c) = self.cur() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            let mut t = if let Some(kw) = lookup_keyword(&name) {
                self.make_token(kw, loc)
            } else {
                let mut t = self.make_token(T::Ident, loc);
                t.string_value = Some(self.interns.intern(&name));
                t
            };
            if t.kind == T::True {
                t.int_value = 1;
            }
            return Ok(t);
        }

        // Numbers
        if c.is_ascii_digit() {
            let (kind, iv, fv) = self.read_num_literal(false)?;
            let mut t = self.make_token(kind, loc);
            t.int_value = iv;
            t.float_value = fv;
            return Ok(t);
        }

        // Strings
        match c {
            '"' | '\'' => {
                let id = self.read_string_literal(true)?;
                let mut t = self.make_token(T::StringLiteral, loc);
                t.string_value = Some(id);
                return Ok(t);
            }
            '@' if matches!(self.ahead(1), Some('"' | '\'')) => {
                self.advance();
                let id = self.read_string_literal(false)?;
                let mut t = self.make_token(T::StringLiteral, loc);
                t.string_value = Some(id);
                return Ok(t);
            }
            '[' => {
                if matches!(self.ahead(1), Some('[' | '=')) {
                    self.advance();
                    if let Some(id) = self.read_verbatim_string(loc)? {
                        let mut t = self.make_token(T::StringLiteral, loc);
                        t.string_value = Some(id);
                        return Ok(t);
                    }
                    return Ok(self.make_token(T::LBracket, loc));
                }
                self.advance();
                return Ok(self.make_token(T::LBracket, loc));
            }
            _ => {}
        }

        // Operators and punctuation, longest match first.
        macro_rules! sym {
            ($kind:expr, $len:expr) => {{
                for _ in 0..$len {
                    self.advance();
                }
                return Ok(self.make_token($kind, loc));
            }};
        }

        let c1 = self.ahead(1);
        let c2 = self.ahead(2);
        let c3 = self.ahead(3);
        match c {
            '+' => match c1 {
                Some('=') => sym!(T::AddEq, 2),
                Some('+') => sym!(T::Inc, 2),
                _ => sym!(T::Add, 1),
            },
            '-' => match c1 {
                Some('=') => sym!(T::SubEq, 2),
                Some('-') => sym!(T::Dec, 2),
                Some('>') => sym!(T::Arrow, 2),
                _ => sym!(T::Sub, 1),
            },
            '~' => match c1 {
                Some('=') => sym!(T::CatEq, 2),
                _ => sym!(T::Cat, 1),
            },
            '*' => match c1 {
                Some('=') => sym!(T::MulEq, 2),
                _ => sym!(T::Mul, 1),
            },
            '/' => match c1 {
                Some('=') => sym!(T::DivEq, 2),
                _ => sym!(T::Div, 1),
            },
            '%' => match c1 {
                Some('=') => sym!(T::ModEq, 2),
                _ => sym!(T::Mod, 1),
            },
            '<' => match (c1, c2) {
                (Some('='), Some('>')) => sym!(T::Cmp3, 3),
                (Some('='), _) => sym!(T::Le, 2),
                (Some('<'), Some('=')) => sym!(T::ShlEq, 3),
                (Some('<'), _) => sym!(T::Shl, 2),
                _ => sym!(T::Lt, 1),
            },
            '>' => match (c1, c2, c3) {
                (Some('='), ..) => sym!(T::Ge, 2),
                (Some('>'), Some('>'), Some('=')) => sym!(T::UShrEq, 4),
                (Some('>'), Some('>'), _) => sym!(T::UShr, 3),
                (Some('>'), Some('='), _) => sym!(T::ShrEq, 3),
                (Some('>'), ..) => sym!(T::Shr, 2),
                _ => sym!(T::Gt, 1),
            },
            '&' => match c1 {
                Some('&') => sym!(T::AndAnd, 2),
                Some('=') => sym!(T::BitAndEq, 2),
                _ => sym!(T::BitAnd, 1),
            },
            '|' => match c1 {
                Some('|') => sym!(T::OrOr, 2),
                Some('=') => sym!(T::BitOrEq, 2),
                _ => sym!(T::BitOr, 1),
            },
            '^' => match c1 {
                Some('=') => sym!(T::XorEq, 2),
                _ => sym!(T::Xor, 1),
            },
            '=' => match c1 {
                Some('=') => sym!(T::Eq, 2),
                _ => sym!(T::Assign, 1),
            },
            '.' => match c1 {
                Some('0'..='9') => {
                    self.advance();
                    let (kind, _, fv) = self.read_num_literal(true)?;
                    debug_assert_eq!(kind, T::FloatLiteral);
                    let mut t = self.make_token(T::FloatLiteral, loc);
                    t.float_value = fv;
                    Ok(t)
                }
                Some('.') => match c2 {
                    Some('.') => sym!(T::Ellipsis, 3),
                    _ => sym!(T::DotDot, 2),
                },
                _ => sym!(T::Dot, 1),
            },
            '!' => match c1 {
                Some('=') => sym!(T::Ne, 2),
                _ => sym!(T::Bang, 1),
            },
            '?' => match c1 {
                Some('=') => sym!(T::DefaultEq, 2),
                _ => sym!(T::Question, 1),
            },
            '(' => sym!(T::LParen, 1),
            ')' => sym!(T::RParen, 1),
            ']' => sym!(T::RBracket, 1),
            '{' => sym!(T::LBrace, 1),
            '}' => sym!(T::RBrace, 1),
            ':' => sym!(T::Colon, 1),
            ',' => sym!(T::Comma, 1),
            ';' => sym!(T::Semicolon, 1),
            '#' => sym!(T::Length, 1),
            '\\' => sym!(T::Backslash, 1),
            '@' => sym!(T::At, 1),
            other => Err(self.error(loc, format!("Invalid character '{other}'"))),
        }
    }
}
