use once_cell::sync::Lazy;

use crate::{
    error::Result,
    session::LexerSession,
    CAT, DEF_MAGIC, ID_MAX, IN_SRC, RT_END, ST_QUOTE, TOKEN_MAX, TOK_SEP,
};

pub(crate) const LET: u8 = 0x01;
pub(crate) const DIG: u8 = 0x02;
pub(crate) const DOT: u8 = 0x04;
pub(crate) const PUNC: u8 = 0x08;
pub(crate) const QUO: u8 = 0x10;
pub(crate) const SPA: u8 = 0x20;
pub(crate) const HSP: u8 = 0x40;

/// Character classification, indexed by byte.  The marker bytes used in
/// macro replay text are classified so the scanners handle them without
/// special cases: [`IN_SRC`] and [`DEF_MAGIC`] read as letters, [`TOK_SEP`]
/// as horizontal space, [`RT_END`] as vertical space.
pub(crate) static CHAR_TYPE: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut t = [0u8; 256];
    for c in b'a'..=b'z' {
        t[c as usize] = LET;
    }
    for c in b'A'..=b'Z' {
        t[c as usize] = LET;
    }
    t[b'_' as usize] = LET;
    t[IN_SRC as usize] = LET;
    t[DEF_MAGIC as usize] = LET;
    for c in b'0'..=b'9' {
        t[c as usize] = DIG;
    }
    t[b'.' as usize] = DOT;
    for c in *b"!#%&()*+,-/:;<=>?[]^{|}~" {
        t[c as usize] = PUNC;
    }
    t[b'"' as usize] = QUO;
    t[b'\'' as usize] = QUO;
    t[b' ' as usize] = SPA | HSP;
    t[b'\t' as usize] = SPA | HSP;
    t[TOK_SEP as usize] = SPA | HSP;
    for c in [b'\n', b'\r', 0x0b, 0x0c, RT_END] {
        t[c as usize] = SPA;
    }
    t
});

/// What a scanned preprocessing token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// Identifier.
    Name,
    /// Preprocessing number.
    Number,
    /// String literal.
    Str,
    /// Character constant.
    Chr,
    /// Wide string literal.
    WideStr,
    /// Wide character constant.
    WideChr,
    /// Operator or punctuator; see [`OpCode`].
    Op,
    /// Token separator: whitespace or an in-band separator byte.
    Sep,
    /// Any other byte, passed through one at a time.
    Spe,
}

/// Which operator an [`TokenType::Op`] token is.  Operators that only
/// matter to downstream consumers (compound assignments and the like) are
/// grouped by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    LeftParen,
    RightParen,
    Question,
    Colon,
    Complement,
    Equal,
    NotEqual,
    Not,
    LogicalAnd,
    LogicalOr,
    And,
    Or,
    Xor,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    ShiftLeft,
    ShiftRight,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    /// `##` in a macro definition or call.
    Concat,
    /// `#` in a macro definition or call.
    Stringize,
    Ellipsis,
    /// Any other one-character punctuator.
    Punctuator1,
    /// Any other two-character punctuator.
    Punctuator2,
    /// Any other three-character punctuator.
    Punctuator3,
}

/// Growable token buffer with an explicit size limit.  Pushing never fails
/// and never truncates; each scanner checks [`TokenBuf::over_limit`] at its
/// own checkpoint and reports the overflow with its own context.
#[derive(Debug, Clone)]
pub struct TokenBuf {
    buf: Vec<u8>,
    limit: usize,
}

impl TokenBuf {
    pub fn new() -> Self {
        Self::with_limit(TOKEN_MAX)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, c: u8) {
        self.buf.push(c);
    }

    pub fn pop(&mut self) -> Option<u8> {
        self.buf.pop()
    }

    pub fn extend_from_slice(&mut self, s: &[u8]) {
        self.buf.extend_from_slice(s);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn over_limit(&self) -> bool {
        self.buf.len() > self.limit
    }
}

impl Default for TokenBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        String::from_utf8_lossy(&self.buf).fmt(f)
    }
}

impl LexerSession {
    /// Scan one preprocessing token starting with `c`, appending its text
    /// to `out`.  The scanned identifier is also left in
    /// [`LexerSession::identifier`] and an operator's code in
    /// [`LexerSession::openum`].
    ///
    /// The caller deals with `'\n'` itself; scanned here it would read as
    /// a separator.
    pub fn scan_token(&mut self, c: u8, out: &mut TokenBuf) -> Result<TokenType> {
        let start = out.len();
        self.in_token = true;
        let result = self.scan_token_in(c, out);
        self.in_token = false;
        if result.is_ok() && out.over_limit() {
            let text = String::from_utf8_lossy(&out.as_bytes()[start..]).into_owned();
            return self.cfatal(format!("Buffer overflow scanning token \"{text}\""));
        }
        if let Ok(token_type) = &result {
            log::trace!(
                "LexerSession::scan_token(): {token_type:?} {:?}",
                String::from_utf8_lossy(&out.as_bytes()[start..])
            );
        }
        result
    }

    fn scan_token_in(&mut self, c: u8, out: &mut TokenBuf) -> Result<TokenType> {
        let t = CHAR_TYPE[c as usize];
        if t & LET != 0 {
            if c == b'L' {
                let next = self.get_ch()?;
                if CHAR_TYPE[next as usize] & QUO != 0 {
                    out.push(b'L');
                    self.scan_quote(next, out, true)?;
                    return Ok(if next == b'"' {
                        TokenType::WideStr
                    } else {
                        TokenType::WideChr
                    });
                }
                self.unget_ch()?;
            }
            self.scan_id(c)?;
            let id = std::mem::take(&mut self.identifier);
            out.extend_from_slice(&id);
            self.identifier = id;
            return Ok(TokenType::Name);
        }
        if t & QUO != 0 {
            self.scan_quote(c, out, true)?;
            return Ok(if c == b'"' {
                TokenType::Str
            } else {
                TokenType::Chr
            });
        }
        if t & DOT != 0 {
            let next = self.get_ch()?;
            self.unget_ch()?;
            if CHAR_TYPE[next as usize] & DIG != 0 {
                return self.scan_number(c, out);
            }
            return self.scan_op(c, out);
        }
        if t & DIG != 0 {
            return self.scan_number(c, out);
        }
        if t & PUNC != 0 {
            return self.scan_op(c, out);
        }
        out.push(c);
        if c == CAT || c == ST_QUOTE || t & SPA != 0 {
            return Ok(TokenType::Sep);
        }
        Ok(TokenType::Spe)
    }

    /// Scan an identifier into [`LexerSession::identifier`].  A marker byte
    /// prefixed to the name in replay text is carried along.  Identifiers
    /// longer than [`ID_MAX`] are truncated with a warning; past four times
    /// that, with an error.
    fn scan_id(&mut self, mut c: u8) -> Result<()> {
        self.identifier.clear();
        if c == IN_SRC {
            self.identifier.push(c);
            c = self.get_ch()?;
        }
        if c == DEF_MAGIC {
            self.identifier.push(c);
            c = self.get_ch()?;
        }
        let mut len = 0usize;
        loop {
            if len < ID_MAX * 4 {
                self.identifier.push(c);
            }
            len += 1;
            c = self.get_ch()?;
            if CHAR_TYPE[c as usize] & (LET | DIG) == 0 {
                break;
            }
        }
        self.unget_ch()?;
        if len > ID_MAX {
            self.identifier.truncate(ID_MAX);
            let text = String::from_utf8_lossy(&self.identifier).into_owned();
            if len > ID_MAX * 4 {
                self.cerror(format!("Too long identifier truncated to \"{text}\""))?;
            } else {
                self.cwarn(format!("Too long identifier truncated to \"{text}\""))?;
            }
        }
        Ok(())
    }

    /// Scan a preprocessing number: digits, letters, dots, and exponent
    /// signs after `e` / `E`.
    fn scan_number(&mut self, mut c: u8, out: &mut TokenBuf) -> Result<TokenType> {
        let start = out.len();
        loop {
            out.push(c);
            if c == b'e' || c == b'E' {
                c = self.get_ch()?;
                if c == b'+' || c == b'-' {
                    out.push(c);
                    c = self.get_ch()?;
                }
            } else {
                c = self.get_ch()?;
            }
            if CHAR_TYPE[c as usize] & (DIG | DOT | LET) == 0 {
                break;
            }
        }
        self.unget_ch()?;
        if out.over_limit() {
            let text = String::from_utf8_lossy(&out.as_bytes()[start..]).into_owned();
            return self.cfatal(format!("Too long pp-number token \"{text}\""));
        }
        Ok(TokenType::Number)
    }

    /// Scan a quoted literal whose opening delimiter was `delim` into
    /// `out`; `'<'` means a header name closed by `'>'`, with no escape
    /// processing.  An unterminated literal leaves its partial text in
    /// `out` with the line end pushed back; `diag` selects whether that
    /// (and an empty character constant) is reported here, so a literal
    /// rescanned after normalization is reported exactly once.
    pub fn scan_quote(&mut self, delim: u8, out: &mut TokenBuf, diag: bool) -> Result<()> {
        self.in_token = true;
        let result = self.scan_quote_in(delim, out, diag);
        self.in_token = false;
        result
    }

    fn scan_quote_in(&mut self, delim: u8, out: &mut TokenBuf, diag: bool) -> Result<()> {
        let start = out.len();
        out.push(delim);
        let close = if delim == b'<' { b'>' } else { delim };
        let mut terminated = false;
        loop {
            let c = self.get_ch()?;
            if c == close {
                out.push(c);
                terminated = true;
                break;
            }
            match c {
                crate::EOS | b'\n' => {
                    self.unget_ch()?;
                    break;
                }
                b'\\' if close != b'>' => {
                    out.push(c);
                    let escaped = self.get_ch()?;
                    if escaped == crate::EOS || escaped == b'\n' {
                        self.unget_ch()?;
                        break;
                    }
                    out.push(escaped);
                }
                _ => out.push(c),
            }
        }
        if out.over_limit() {
            return self.cfatal("Too long quotation");
        }
        if !diag {
            return Ok(());
        }
        if !terminated {
            let what = match close {
                b'\'' => "character constant",
                b'>' => "header name",
                _ => "string literal",
            };
            let text = String::from_utf8_lossy(&out.as_bytes()[start..]).into_owned();
            self.cerror(format!("Unterminated {what} {text}"))?;
        } else if close == b'\'' && out.len() - start == 2 {
            let text = String::from_utf8_lossy(&out.as_bytes()[start..]).into_owned();
            self.cerror(format!("Empty character constant {text}"))?;
        }
        Ok(())
    }

    /// Scan an operator or punctuator, longest match first, backing off
    /// over characters that turn out not to belong to it.
    fn scan_op(&mut self, c: u8, out: &mut TokenBuf) -> Result<TokenType> {
        use OpCode::*;
        out.push(c);
        let openum = match c {
            b'(' => LeftParen,
            b')' => RightParen,
            b'?' => Question,
            b':' => Colon,
            b'~' => Complement,
            b',' | b';' | b'[' | b']' | b'{' | b'}' => Punctuator1,
            b'#' => {
                let in_macro = self.in_define || self.macro_line != 0;
                let c2 = self.get_ch()?;
                if in_macro && c2 == b'#' {
                    out.push(c2);
                    Concat
                } else {
                    self.unget_ch()?;
                    if in_macro {
                        Stringize
                    } else {
                        Punctuator1
                    }
                }
            }
            b'&' => match self.get_ch()? {
                b'&' => {
                    out.push(b'&');
                    LogicalAnd
                }
                b'=' => {
                    out.push(b'=');
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    And
                }
            },
            b'|' => match self.get_ch()? {
                b'|' => {
                    out.push(b'|');
                    LogicalOr
                }
                b'=' => {
                    out.push(b'=');
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    Or
                }
            },
            b'^' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    Xor
                }
            },
            b'!' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    NotEqual
                }
                _ => {
                    self.unget_ch()?;
                    Not
                }
            },
            b'=' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    Equal
                }
                _ => {
                    self.unget_ch()?;
                    Punctuator1
                }
            },
            b'<' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    LessEqual
                }
                b'<' => match self.get_ch()? {
                    b'=' => {
                        out.extend_from_slice(b"<=");
                        Punctuator3
                    }
                    _ => {
                        self.unget_ch()?;
                        out.push(b'<');
                        ShiftLeft
                    }
                },
                _ => {
                    self.unget_ch()?;
                    Less
                }
            },
            b'>' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    GreaterEqual
                }
                b'>' => match self.get_ch()? {
                    b'=' => {
                        out.extend_from_slice(b">=");
                        Punctuator3
                    }
                    _ => {
                        self.unget_ch()?;
                        out.push(b'>');
                        ShiftRight
                    }
                },
                _ => {
                    self.unget_ch()?;
                    Greater
                }
            },
            b'+' => match self.get_ch()? {
                c2 @ (b'+' | b'=') => {
                    out.push(c2);
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    Add
                }
            },
            b'-' => match self.get_ch()? {
                c2 @ (b'-' | b'=' | b'>') => {
                    out.push(c2);
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    Subtract
                }
            },
            b'*' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    Multiply
                }
            },
            b'/' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    Divide
                }
            },
            b'%' => match self.get_ch()? {
                b'=' => {
                    out.push(b'=');
                    Punctuator2
                }
                _ => {
                    self.unget_ch()?;
                    Modulo
                }
            },
            b'.' => match self.get_ch()? {
                b'.' => match self.get_ch()? {
                    b'.' => {
                        out.extend_from_slice(b"..");
                        Ellipsis
                    }
                    _ => {
                        // Two dots do not make a token; give both back.
                        self.unget_ch()?;
                        self.unget_ch()?;
                        Punctuator1
                    }
                },
                _ => {
                    self.unget_ch()?;
                    Punctuator1
                }
            },
            _ => Punctuator1,
        };
        self.openum = Some(openum);
        Ok(TokenType::Op)
    }

    /// Read past horizontal whitespace, including in-band token
    /// separators, and return the first character that is neither.
    pub fn skip_ws(&mut self) -> Result<u8> {
        loop {
            let c = self.get_ch()?;
            if CHAR_TYPE[c as usize] & HSP == 0 {
                return Ok(c);
            }
        }
    }

    /// Discard the rest of the current logical line, popping any replay
    /// frames stacked on top of it, newline included.
    pub fn skip_nl(&mut self) -> Result<()> {
        loop {
            let is_file = match self.stack.last_mut() {
                None => return Ok(()),
                Some(frame) => {
                    frame.cursor = frame.buf.len() - 1;
                    frame.is_file()
                }
            };
            if is_file {
                return Ok(());
            }
            // Pops the exhausted replay frame; the character it comes back
            // with belongs to the line being discarded anyway.
            self.get_ch()?;
        }
    }
}
