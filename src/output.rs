use std::{cell::RefCell, io::Write, rc::Rc};

use crate::{
    error::Result,
    lexer::{CHAR_TYPE, SPA},
    session::LexerSession,
};

/// A reference counted handle to an output stream which can be cloned, and
/// which an input frame can hold on to while a nested stream temporarily
/// takes its place.
///
/// [`Sink::mem`] backs the stream with an in-memory buffer, which is how the
/// tests capture preprocessed output without touching the filesystem.
#[derive(Clone)]
pub struct Sink(Rc<RefCell<dyn Write>>);

impl Sink {
    pub fn new(writer: impl Write + 'static) -> Self {
        Self(Rc::new(RefCell::new(writer)))
    }

    /// A sink writing into a shared in-memory buffer; the returned handle
    /// reads it back.
    pub fn mem() -> (Self, MemSink) {
        let buffer = Rc::new(RefCell::new(Vec::new()));
        (
            Self(Rc::new(RefCell::new(SharedBuffer(buffer.clone())))),
            MemSink(buffer),
        )
    }

    /// A sink which discards everything written to it.
    pub fn sink() -> Self {
        Self::new(std::io::sink())
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Read side of [`Sink::mem`].
pub struct MemSink(Rc<RefCell<Vec<u8>>>);

impl MemSink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

/// The three streams lexing writes to: preprocessed text, diagnostics, and
/// debug dumps.  A set is saved into the including frame whenever a new
/// frame is pushed, and restored when a source file frame is popped, so a
/// redirection (e.g. by an output-switching pragma) stays local to the file
/// that requested it.
#[derive(Clone)]
pub struct SinkSet {
    pub out: Sink,
    pub err: Sink,
    pub dbg: Sink,
}

impl SinkSet {
    pub fn new(out: impl Write + 'static, err: impl Write + 'static) -> Self {
        Self::with_sinks(Sink::new(out), Sink::new(err))
    }

    /// Debug output shares the error sink; a caller that wants it elsewhere
    /// can reassign `dbg` afterwards.
    pub fn with_sinks(out: Sink, err: Sink) -> Self {
        Self {
            out,
            dbg: err.clone(),
            err,
        }
    }
}

impl LexerSession {
    /// Put out a `#line` marker for the current source position, unless the
    /// last marker already said exactly that.  `flag` distinguishes entering
    /// an included file (1) from returning to the includer (2); it is only
    /// appended when marker flags were requested.
    pub(crate) fn sharp(&mut self, flag: u8) -> Result<()> {
        let result = self.put_marker(flag);
        // Output is in sync with the source position again either way.
        self.wrong_line = false;
        result
    }

    fn put_marker(&mut self, flag: u8) -> Result<()> {
        if !self.opts.line_markers {
            return Ok(());
        }
        // The innermost file-backed frame names the location; macro replay
        // frames above it have no line of their own.
        let Some(frame) = self.stack.iter().rev().find(|f| f.is_file()) else {
            return Ok(());
        };
        let name = frame.marker_name();
        if self.sh_line == self.src_line && self.sh_name.as_deref() == Some(&*name) {
            return Ok(());
        }
        self.sh_line = self.src_line;
        self.sh_name = Some(name.clone());
        if self.opts.keep_comments {
            // Make sure the marker starts on a line of its own.
            self.sinks.out.write_all(b"\n")?;
        }
        log::debug!("LexerSession::sharp(): #line {} \"{name}\"", self.src_line);
        write!(self.sinks.out, "#line {} \"{name}\"", self.src_line)?;
        if self.opts.marker_flags && flag != 0 {
            write!(self.sinks.out, " {flag}")?;
        }
        self.sinks.out.write_all(b"\n")?;
        Ok(())
    }

    /// Write one finished line of preprocessed output: trailing whitespace
    /// trimmed, exactly one terminating newline.
    pub(crate) fn putout(&mut self, line: &[u8]) -> Result<()> {
        let mut end = line.len();
        while end > 0 && CHAR_TYPE[line[end - 1] as usize] & SPA != 0 {
            end -= 1;
        }
        if let Err(e) = self
            .sinks
            .out
            .write_all(&line[..end])
            .and_then(|_| self.sinks.out.write_all(b"\n"))
        {
            log::debug!("LexerSession::putout(): write failed: {e}");
            return self.cfatal("File write error");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::*;

    #[test]
    fn test_mem_sink_round_trip() {
        let (mut sink, mem) = Sink::mem();
        sink.write_all(b"first").unwrap();
        let mut clone = sink.clone();
        clone.write_all(b" second").unwrap();
        assert_eq!(mem.contents(), b"first second");
    }
}
