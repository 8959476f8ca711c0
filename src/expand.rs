use std::convert::Infallible;
use std::io::Write;
use std::rc::Rc;

use crate::{
    error::Result,
    lexer::{TokenBuf, TokenType},
    session::{save_string, LexerSession, MACRO_ERROR},
    CHAR_EOF, EOS,
};

/// Replacement text produced by a macro expansion, ready to be pushed
/// back as a replay frame.
#[derive(Debug, Default)]
pub struct Expansion {
    pub text: Vec<u8>,
    /// An operator in the replacement deferred its effect to the point
    /// where the text is rescanned.  See [`LexerSession::get_unexpandable`].
    pub deferred_marker: bool,
}

/// The macro table, seen from the lexer's side.  The lexer hands over a
/// scanned name, the scope decides whether it is callable here (it may
/// read ahead through the session to look for an argument list) and
/// produces the replacement text.
pub trait MacroScope {
    type Handle;

    /// Whether `name` is bound to a macro callable at the current
    /// position.
    fn lookup(&mut self, lex: &mut LexerSession, name: &[u8]) -> Result<Option<Self::Handle>>;

    /// Expand the macro behind `handle` once, consuming its arguments
    /// from the session if it has any.
    fn expand(&mut self, lex: &mut LexerSession, handle: &Self::Handle) -> Result<Expansion>;

    /// The macro's definition, for diagnostics.
    fn definition(&self, name: &[u8]) -> Option<Rc<str>>;
}

/// Scope with no macros at all; every name is unexpandable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMacros;

impl MacroScope for NoMacros {
    type Handle = Infallible;

    fn lookup(&mut self, _lex: &mut LexerSession, _name: &[u8]) -> Result<Option<Infallible>> {
        Ok(None)
    }

    fn expand(&mut self, _lex: &mut LexerSession, handle: &Infallible) -> Result<Expansion> {
        match *handle {}
    }

    fn definition(&self, _name: &[u8]) -> Option<Rc<str>> {
        None
    }
}

impl LexerSession {
    /// Scan the next token starting with `c`, expanding macros through
    /// `scope` until an unexpandable token comes out, and append that
    /// token to `out`.  Returns `None` at the end of the line or of the
    /// input, pushing the terminating character back when there is one.
    ///
    /// A name scanned out of replay text is returned as-is even when it
    /// is still bound, so a self-referencing replacement cannot loop
    /// here; rescanning policy beyond that single round belongs to the
    /// scope.  With `diag` set, an expansion that yields no token at all
    /// is reported, except while bailing out of a broken call.
    pub fn get_unexpandable<S: MacroScope>(
        &mut self,
        scope: &mut S,
        mut c: u8,
        out: &mut TokenBuf,
        diag: bool,
    ) -> Result<Option<TokenType>> {
        loop {
            if c == EOS || c == b'\n' || c == CHAR_EOF {
                self.unget_ch()?;
                return Ok(None);
            }
            let from_file = self.top_is_file();
            let start = out.len();
            let token_type = self.scan_token(c, out)?;
            if token_type != TokenType::Name || !from_file {
                return Ok(Some(token_type));
            }
            let name_bytes = self.identifier.clone();
            let handle = match scope.lookup(self, &name_bytes)? {
                Some(handle) => handle,
                None => return Ok(Some(token_type)),
            };
            // The name is replaced by whatever the expansion rescans to.
            out.truncate(start);
            let expansion = scope.expand(self, &handle)?;
            if expansion.deferred_marker {
                self.cerror("_Pragma operator found in directive line")?;
            }
            let name = save_string(&String::from_utf8_lossy(&name_bytes));
            let depth = self.depth();
            self.unget_string(&expansion.text, Some(name.clone()));
            c = self.skip_ws()?;
            if self.depth() <= depth && diag && self.macro_line != MACRO_ERROR {
                // The replay frame is already gone: nothing but
                // whitespace came out of the expansion.
                self.cwarn(format!("Macro \"{name}\" is expanded to 0 token"))?;
                if let Some(def) = scope.definition(&name_bytes) {
                    let note = crate::diag::format_macro_note(&name, &def);
                    writeln!(self.sinks.err, "{note}")?;
                }
            }
        }
    }
}
