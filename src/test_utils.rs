//! Helpers shared by the unit tests: throwaway source files and
//! pre-wired sessions capturing their output in memory.

use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::lexer::{TokenBuf, TokenType};
use crate::output::{MemSink, Sink, SinkSet};
use crate::session::{LexerSession, Options};
use crate::CHAR_EOF;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// A real file on disk holding test input, deleted again on drop.
pub(crate) struct TempSource {
    path: String,
}

impl TempSource {
    pub(crate) fn new(contents: impl AsRef<[u8]>) -> Self {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!("pplex-test-{}-{n}.c", std::process::id()));
        fs::write(&path, contents.as_ref()).unwrap();
        Self {
            path: path.to_string_lossy().into_owned(),
        }
    }

    pub(crate) fn path_str(&self) -> &str {
        &self.path
    }

    /// The resolved path a frame opened from this file will carry; the
    /// stored path is absolute, so it is used as is.
    pub(crate) fn full_path(&self) -> &str {
        &self.path
    }
}

impl Drop for TempSource {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Session with nothing on the input stack; feed it with `unget_string`.
pub(crate) fn bare_session() -> (LexerSession, MemSink, MemSink) {
    let (out_sink, out) = Sink::mem();
    let (err_sink, err) = Sink::mem();
    let sinks = SinkSet::with_sinks(out_sink, err_sink);
    (LexerSession::new(Options::default(), sinks), out, err)
}

/// Session reading a freshly written file holding `contents`.
pub(crate) fn file_session(
    contents: impl AsRef<[u8]>,
) -> (LexerSession, MemSink, MemSink, TempSource) {
    let src = TempSource::new(contents);
    let (mut lex, out, err) = bare_session();
    assert!(lex.push_file(src.path_str(), false).unwrap());
    (lex, out, err, src)
}

/// Drain the session character by character into a string.
pub(crate) fn read_to_eof(lex: &mut LexerSession) -> String {
    let mut bytes = Vec::new();
    loop {
        match lex.get_ch() {
            Ok(CHAR_EOF) => break,
            Ok(c) => bytes.push(c),
            Err(e) => panic!("read failed: {e}"),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Tokenize pushed-back text into (type, text) pairs.
pub(crate) fn scan_all(src: &[u8]) -> Vec<(TokenType, String)> {
    let (mut lex, _out, _err) = bare_session();
    lex.unget_string(src, None);
    let mut tokens = Vec::new();
    loop {
        let c = lex.skip_ws().unwrap();
        if c == CHAR_EOF {
            break;
        }
        if c == b'\n' {
            continue;
        }
        let mut out = TokenBuf::new();
        let token_type = lex.scan_token(c, &mut out).unwrap();
        tokens.push((token_type, out.to_string()));
    }
    tokens
}
