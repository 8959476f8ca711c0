use std::io::{BufRead, Write};

use crate::{
    error::Result,
    input::{Frame, FrameIo},
    lexer::{TokenBuf, CHAR_TYPE, HSP},
    session::{LexerSession, MACRO_ERROR},
    EOS, LINE_BUF_SIZE, MAX_CAT_LINE,
};

/// Record of the most recent run of physical lines catenated into one
/// logical line, by backslash-newline splices or by a multi-line comment.
///
/// `len[i]` is the cumulative length of the text contributed by the first
/// `i` physical lines (`len[0]` is always 0), so a column in the catenated
/// line maps back to the physical line and column it came from.
#[derive(Debug, Default, Clone)]
pub struct CatRecord {
    pub start_line: u64,
    pub last_line: u64,
    pub len: Vec<usize>,
}

impl CatRecord {
    pub(crate) fn reset(&mut self) {
        self.start_line = 0;
        self.last_line = 0;
        self.len.clear();
    }

    fn begin(&mut self, start_line: u64) {
        self.start_line = start_line;
        self.last_line = 0;
        self.len.clear();
        self.len.push(0);
    }

    fn push_segment(&mut self, cumulative: usize) {
        if self.len.len() <= MAX_CAT_LINE {
            self.len.push(cumulative);
        }
    }

    /// Physical line and 0-based column for 0-based `col` in the catenated
    /// line this record describes.  A column sitting exactly on a segment
    /// boundary belongs to the earlier line, at the splice point itself.
    fn map(&self, col: usize) -> (u64, usize) {
        let mut i = 1;
        while i + 1 < self.len.len() && self.len[i] < col {
            i += 1;
        }
        (self.start_line + i as u64 - 1, col - self.len[i - 1])
    }
}

impl LexerSession {
    /// Map a 0-based column of logical line `line` back to the physical
    /// line and 1-based column it came from, undoing comment catenation
    /// and then backslash-newline splices.  Both records apply in turn, so
    /// a comment whose opening line was itself spliced maps all the way
    /// back.  Positions inside text a comment replaced map approximately.
    pub fn get_src_location(&self, line: u64, col: usize) -> (u64, usize) {
        let (mut line, mut col) = (line, col);
        for record in [&self.com_record, &self.bsl_record] {
            if record.last_line == line && record.len.len() > 1 {
                let (l, c) = record.map(col);
                line = l;
                col = c;
            }
        }
        (line, col + 1)
    }

    /// Read the next logical line of the current file frame: translation
    /// phases one and two.  Physical lines ending in backslash-newline are
    /// spliced, CRLF becomes LF, NUL bytes are dropped.  At end of file the
    /// missing pieces (final newline, comment terminator) are supplied
    /// first; once nothing is left, returns `false`.
    fn get_line(&mut self, in_comment: bool) -> Result<bool> {
        if self.stack.is_empty() {
            return Ok(false);
        }
        let top = self.stack.len() - 1;
        {
            let frame = &mut self.stack[top];
            frame.buf.clear();
            frame.cursor = 0;
            // The descriptor may have been released to make room for a
            // deeper include; pick up where it left off.
            let path = frame.full_path.clone();
            if let Err(e) = frame.reopen() {
                log::debug!("LexerSession::get_line(): reopen failed: {e}");
                return self.cfatal(format!("Can't reopen file {path:?}"));
            }
        }
        // A backslash-newline was dropped and nothing has been read after
        // it yet.
        let mut pending_splice = false;
        let mut spliced_lines = 0usize;
        loop {
            let start = {
                let Frame { buf, io, .. } = &mut self.stack[top];
                let FrameIo::File {
                    reader: Some(reader),
                    ..
                } = io
                else {
                    return Ok(false);
                };
                let start = buf.len();
                let n = reader.read_until(b'\n', buf)?;
                if n == 0 {
                    break;
                }
                // NUL bytes are not input; dropping them here keeps EOS
                // unambiguous as the buffer terminator.
                if buf[start..].contains(&EOS) {
                    let mut segment = buf.split_off(start);
                    segment.retain(|&c| c != EOS);
                    buf.append(&mut segment);
                }
                start
            };
            self.src_line += 1;
            pending_splice = false;

            let (total, ends_nl, ends_crlf) = {
                let buf = &self.stack[top].buf;
                (
                    buf.len(),
                    buf.last() == Some(&b'\n'),
                    buf[start..].ends_with(b"\r\n"),
                )
            };
            if total - start >= LINE_BUF_SIZE {
                return self.cfatal("Too long source line");
            }
            if total >= LINE_BUF_SIZE {
                return self.cfatal("Too long logical line");
            }
            if !ends_nl {
                // Unterminated final line; dealt with below.
                break;
            }
            if ends_crlf {
                let buf = &mut self.stack[top].buf;
                let l = buf.len();
                buf[l - 2] = b'\n';
                buf.truncate(l - 1);
                if !self.cr_warned {
                    self.cr_warned = true;
                    self.cwarn("Converted [CR+LF] to [LF]")?;
                }
            }

            let len = self.stack[top].buf.len();
            if len >= 2 && self.stack[top].buf[len - 2] == b'\\' {
                // Splice: drop the backslash-newline and read on.
                self.stack[top].buf.truncate(len - 2);
                if spliced_lines == 0 {
                    self.bsl_record.begin(self.src_line);
                }
                spliced_lines += 1;
                self.bsl_record.push_segment(self.stack[top].buf.len());
                pending_splice = true;
                // The spliced line reads as its last physical line; a
                // marker is owed before it goes out.
                self.wrong_line = true;
                continue;
            }
            if spliced_lines > 0 {
                self.bsl_record.push_segment(len - 1);
                self.bsl_record.last_line = self.src_line;
            }
            let frame = &mut self.stack[top];
            frame.buf.push(EOS);
            frame.cursor = 0;
            return Ok(true);
        }
        self.at_eof(in_comment, pending_splice)
    }

    /// Supply what the file ended without, one piece per call, then report
    /// anything left open.  Returns `true` while a supplemented line is
    /// ready to be parsed.
    fn at_eof(&mut self, in_comment: bool, pending_splice: bool) -> Result<bool> {
        let top = self.stack.len() - 1;
        let what = if self.stack.len() > 1 { "file" } else { "input" };
        if pending_splice {
            self.cwarn(format!("End of {what} with \\, deleted the \\"))?;
            let frame = &mut self.stack[top];
            frame.buf.push(b'\n');
            frame.buf.push(EOS);
            frame.cursor = 0;
            return Ok(true);
        }
        let missing_nl = {
            let buf = &self.stack[top].buf;
            !buf.is_empty() && buf.last() != Some(&b'\n')
        };
        if missing_nl {
            self.cwarn(format!("End of {what} with no newline, supplemented newline"))?;
            let frame = &mut self.stack[top];
            frame.buf.push(b'\n');
            frame.buf.push(EOS);
            frame.cursor = 0;
            return Ok(true);
        }
        if in_comment {
            self.cwarn(format!(
                "End of {what} with unterminated comment, terminated the comment"
            ))?;
            let frame = &mut self.stack[top];
            frame.buf.clear();
            frame.buf.extend_from_slice(b"*/\n");
            frame.buf.push(EOS);
            frame.cursor = 0;
            return Ok(true);
        }
        let open_cond = {
            let frame = &self.stack[top];
            (self.cond_stack.len() > frame.init_cond_depth).then(|| {
                (
                    self.cond_stack[frame.init_cond_depth],
                    frame.init_cond_depth,
                )
            })
        };
        if let Some((line, depth)) = open_cond {
            self.cerror(format!(
                "End of {what} within #if (#ifdef) section started at line {line}"
            ))?;
            self.cond_stack.truncate(depth);
        }
        if self.macro_line != 0 && self.macro_line != MACRO_ERROR && self.in_getarg {
            let line = self.macro_line;
            self.cerror(format!("End of {what} within macro call started at line {line}"))?;
            self.macro_line = MACRO_ERROR;
        }
        Ok(false)
    }

    /// Refill the current file frame with its next logical line, normalized
    /// (translation phase three): comments collapse to one space, runs of
    /// horizontal whitespace squeeze to one space, control characters are
    /// policed.  String and character literals pass through untouched.
    pub(crate) fn parse_line(&mut self) -> Result<bool> {
        if !self.get_line(false)? {
            return Ok(false);
        }
        let top = self.stack.len() - 1;
        let keep_spaces = self.opts.keep_spaces;
        let mut line = TokenBuf::with_limit(LINE_BUF_SIZE);

        // Horizontal whitespace opening the line is kept verbatim; the
        // squeezing below applies between tokens only.
        let mut c = self.next_raw(top);
        while CHAR_TYPE[c as usize] & HSP != 0 {
            line.push(c);
            c = self.next_raw(top);
        }
        loop {
            match c {
                b'/' if self.peek_raw(top) == b'*' => {
                    self.next_raw(top);
                    if !self.read_a_comment(&mut line)? {
                        return Ok(false);
                    }
                    if line.over_limit() {
                        return self.cfatal("Too long line spliced by comments");
                    }
                    // The comment reads as one space.
                    let after_space = matches!(
                        line.as_bytes().last(), Some(&p) if CHAR_TYPE[p as usize] & HSP != 0
                    );
                    if !after_space {
                        line.push(b' ');
                    }
                }
                b'/' if self.peek_raw(top) == b'/' => {
                    self.cwarn("Parsed \"//\" as comment")?;
                    if self.opts.keep_comments {
                        // Passed through whole; the output line ends here.
                        self.sinks.out.write_all(&[b'/'])?;
                        while self.peek_raw(top) != b'\n' {
                            let c = self.next_raw(top);
                            self.sinks.out.write_all(&[c])?;
                        }
                        self.sinks.out.write_all(b"\n")?;
                        self.wrong_line = true;
                    }
                    break;
                }
                b'\'' | b'"' => {
                    self.scan_quote(c, &mut line, false)?;
                }
                b' ' | b'\t' => squeeze_space(&mut line, keep_spaces, c),
                b'\r' | b'\x0b' | b'\x0c' => {
                    // Stray CR (a CRLF pair is already folded), vertical
                    // tab and form feed read as whitespace.
                    self.cwarn(format!("Converted 0x{c:02x} to a space"))?;
                    squeeze_space(&mut line, keep_spaces, b' ');
                }
                b'\n' => break,
                _ if c < 0x20 || c == 0x7f => {
                    self.cerror(format!(
                        "Illegal control character 0x{c:02x}, skipped the character"
                    ))?;
                }
                _ => line.push(c),
            }
            c = self.next_raw(top);
        }
        // One squeezed space before the newline serves nothing.
        if line.as_bytes().last() == Some(&b' ') {
            line.pop();
        }
        line.push(b'\n');
        if line.over_limit() {
            return self.cfatal("Too long line spliced by comments");
        }
        let frame = &mut self.stack[top];
        frame.buf.clear();
        frame.buf.extend_from_slice(line.as_bytes());
        frame.buf.push(EOS);
        frame.cursor = 0;
        if self.macro_line != 0 && self.macro_line != MACRO_ERROR {
            // This line is about to be read as macro arguments, even if
            // it looks like a directive.
            let text = line.as_bytes();
            let first = text
                .iter()
                .position(|&c| CHAR_TYPE[c as usize] & HSP == 0)
                .unwrap_or(text.len());
            let directive_like = text.get(first) == Some(&b'#')
                || (text.get(first) == Some(&b'%') && text.get(first + 1) == Some(&b':'));
            if directive_like {
                let line_no = self.macro_line;
                self.cwarn(format!(
                    "Macro started at line {line_no} swallowed directive-like line"
                ))?;
            }
        }
        Ok(true)
    }

    /// Read a `/* ... */` comment through to its terminator, refilling
    /// across lines, and keep the catenation record current.  In
    /// keep-comments mode the text is copied through to the output as it
    /// is read.  Returns `false` only if the input ends for good inside
    /// the comment.
    fn read_a_comment(&mut self, line: &mut TokenBuf) -> Result<bool> {
        let top = self.stack.len() - 1;
        let keep = self.opts.keep_comments;
        if keep {
            self.sinks.out.write_all(b"/*")?;
        }
        let mut crossed_lines = 0usize;
        let mut consumed = 0usize;
        loop {
            let c = self.next_raw(top);
            match c {
                b'/' if self.peek_raw(top) == b'*' => {
                    self.cwarn("\"/*\" within comment")?;
                    if keep {
                        self.sinks.out.write_all(&[c])?;
                    }
                }
                b'*' if self.peek_raw(top) == b'/' => {
                    self.next_raw(top);
                    // A comment kept to one line claims no record; an
                    // earlier line-crossing one may still be consulted.
                    if crossed_lines > 0 {
                        consumed += self.stack[top].buf.len().saturating_sub(2);
                        self.com_record.push_segment(consumed);
                        self.com_record.last_line = self.src_line;
                    }
                    if keep {
                        // The copied comment ends its own output line.
                        self.sinks.out.write_all(b"*/\n")?;
                        self.wrong_line = true;
                    }
                    return Ok(true);
                }
                b'\n' => {
                    // This physical line ends inside the comment; account
                    // for it and read the next one.
                    if crossed_lines == 0 {
                        self.com_record.begin(self.src_line);
                    }
                    crossed_lines += 1;
                    consumed += self.stack[top].buf.len().saturating_sub(2);
                    self.com_record.push_segment(consumed);
                    if keep {
                        self.sinks.out.write_all(b"\n")?;
                    }
                    if !self.get_line(true)? {
                        return Ok(false);
                    }
                    // A line marker is owed after the comment.
                    self.wrong_line = true;
                }
                _ => {
                    if keep {
                        self.sinks.out.write_all(&[c])?;
                    }
                }
            }
        }
    }

    fn next_raw(&mut self, top: usize) -> u8 {
        let frame = &mut self.stack[top];
        let c = frame.buf[frame.cursor];
        frame.cursor += 1;
        c
    }

    fn peek_raw(&self, top: usize) -> u8 {
        let frame = &self.stack[top];
        frame.buf[frame.cursor]
    }
}

fn squeeze_space(line: &mut TokenBuf, keep_spaces: bool, verbatim: u8) {
    if keep_spaces {
        line.push(verbatim);
    } else {
        let after_space = matches!(
            line.as_bytes().last(), Some(&p) if CHAR_TYPE[p as usize] & HSP != 0
        );
        if !after_space {
            line.push(b' ');
        }
    }
}
