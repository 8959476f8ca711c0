use std::{
    fs,
    io::{BufRead, BufReader, Seek, SeekFrom},
    path::{Path, PathBuf},
    rc::Rc,
};

use crate::{
    error::Result,
    output::SinkSet,
    session::LexerSession,
    CHAR_EOF, EOS, FD_BUDGET, INCLUDE_NEST, STD_INCLUDE_NEST,
};

/// One level of the input stack: either a source file being read line by
/// line, or a piece of pushed-back text (usually a macro expansion) being
/// replayed.
///
/// `buf` holds the current logical line (file frames) or the whole replay
/// text (text frames) and is always terminated by an [`EOS`] byte, so the
/// read fast path can hand out bytes without a bounds test of its own.
pub struct Frame {
    pub(crate) buf: Vec<u8>,
    pub(crate) cursor: usize,
    /// File name as requested, or the macro name a replay frame stands for.
    pub(crate) name: Option<Rc<str>>,
    /// Resolved path of a file frame; what markers and diagnostics print.
    pub(crate) full_path: Option<Rc<str>>,
    /// Source line of the includer at the moment this frame was pushed.
    pub(crate) saved_line: u64,
    /// Output sinks at the moment this frame was pushed; popping a file
    /// frame puts them back.
    pub(crate) saved_sinks: Option<SinkSet>,
    /// Pushed on behalf of an `-include`-style option rather than from the
    /// source text; suppresses the line markers around the push.
    pub(crate) include_opt: bool,
    /// Conditional nesting depth at the push, to catch `#if` sections left
    /// open when the frame ends.
    pub(crate) init_cond_depth: usize,
    pub(crate) io: FrameIo,
}

pub(crate) enum FrameIo {
    File {
        /// `None` while the descriptor is lent out under the open-file
        /// budget; `stream_pos` then remembers where to resume.
        reader: Option<BufReader<fs::File>>,
        stream_pos: u64,
    },
    Text,
}

impl Frame {
    fn file(
        reader: BufReader<fs::File>,
        name: Rc<str>,
        full_path: Rc<str>,
        include_opt: bool,
        saved_line: u64,
        saved_sinks: SinkSet,
        init_cond_depth: usize,
    ) -> Self {
        Self {
            // Forces the first read into a refill.
            buf: vec![EOS],
            cursor: 0,
            name: Some(name),
            full_path: Some(full_path),
            saved_line,
            saved_sinks: Some(saved_sinks),
            include_opt,
            init_cond_depth,
            io: FrameIo::File {
                reader: Some(reader),
                stream_pos: 0,
            },
        }
    }

    fn text(
        text: &[u8],
        name: Option<Rc<str>>,
        saved_line: u64,
        init_cond_depth: usize,
    ) -> Self {
        let mut buf = Vec::with_capacity(text.len() + 1);
        buf.extend_from_slice(text);
        // NUL has no place in replay text; it would read as end of frame.
        buf.retain(|&c| c != EOS);
        buf.push(EOS);
        Self {
            buf,
            cursor: 0,
            name,
            full_path: None,
            saved_line,
            saved_sinks: None,
            include_opt: false,
            init_cond_depth,
            io: FrameIo::Text,
        }
    }

    pub(crate) fn is_file(&self) -> bool {
        matches!(self.io, FrameIo::File { .. })
    }

    fn is_open_file(&self) -> bool {
        matches!(self.io, FrameIo::File { reader: Some(_), .. })
    }

    /// Directory of this frame's file, for resolving includes named
    /// relative to it.
    fn directory(&self) -> Option<PathBuf> {
        let full = self.full_path.as_deref()?;
        Some(Path::new(full).parent()?.to_path_buf())
    }

    pub(crate) fn marker_name(&self) -> Rc<str> {
        match (&self.full_path, &self.name) {
            (Some(full), _) => full.clone(),
            (None, Some(name)) => name.clone(),
            (None, None) => Rc::from(""),
        }
    }

    /// Give up this frame's file descriptor, remembering the position to
    /// resume from.
    fn release_descriptor(&mut self) -> std::io::Result<()> {
        if let FrameIo::File { reader, stream_pos } = &mut self.io {
            if let Some(r) = reader.as_mut() {
                *stream_pos = r.stream_position()?;
                log::debug!(
                    "Frame::release_descriptor(): {:?} at offset {stream_pos}",
                    self.full_path
                );
                *reader = None;
            }
        }
        Ok(())
    }

    pub(crate) fn reopen(&mut self) -> std::io::Result<()> {
        let Some(full) = self.full_path.clone() else {
            return Ok(());
        };
        if let FrameIo::File { reader, stream_pos } = &mut self.io {
            if reader.is_none() {
                let mut file = fs::File::open(&*full)?;
                if *stream_pos > 0 {
                    file.seek(SeekFrom::Start(*stream_pos))?;
                }
                log::debug!("Frame::reopen(): {full:?} at offset {stream_pos}");
                *reader = Some(BufReader::new(file));
            }
        }
        Ok(())
    }
}

impl LexerSession {
    /// Get the next character of input.
    ///
    /// While a token scanner has claimed the read position (`in_token`),
    /// bytes come straight out of the current frame's buffer, including its
    /// terminating [`EOS`]; a token therefore never continues across a
    /// refill or a frame boundary.  Otherwise [`EOS`] triggers reading the
    /// next logical line of a file frame, or popping an exhausted frame and
    /// resuming its includer.  Once the whole stack is gone every call
    /// returns [`CHAR_EOF`].
    pub fn get_ch(&mut self) -> Result<u8> {
        if self.in_token {
            let frame = self.stack.last_mut().unwrap();
            let c = frame.buf[frame.cursor];
            frame.cursor += 1;
            return Ok(c);
        }
        loop {
            let refillable = match self.stack.last_mut() {
                None => return Ok(CHAR_EOF),
                Some(frame) => {
                    let c = frame.buf[frame.cursor];
                    frame.cursor += 1;
                    if c != EOS {
                        return Ok(c);
                    }
                    // End of this frame's buffer.  A file frame refills
                    // even while its descriptor is released; the refill
                    // reopens it at the saved position.
                    frame.is_file()
                }
            };
            if refillable && self.parse_line()? {
                continue;
            }
            let popped = self.stack.pop().unwrap();
            if self.stack.is_empty() {
                log::debug!("LexerSession::get_ch(): end of all input");
                return Ok(CHAR_EOF);
            }
            if popped.is_file() {
                self.return_to_includer(&popped)?;
            } else if let Some(name) = &popped.name {
                // A named replay frame ran out while a macro call is being
                // read; keep the name around for diagnostics.
                if self.macro_name.is_some() {
                    self.tracer.note(name.clone(), None);
                }
            }
        }
    }

    /// Push the last character back.  One character of pushback is always
    /// available per read; trying to back up past the start of the current
    /// buffer is a bug in the caller.
    pub fn unget_ch(&mut self) -> Result<()> {
        let at_start = match self.stack.last() {
            // After end of all input there is nothing to back over.
            None => return Ok(()),
            Some(frame) => frame.cursor == 0,
        };
        if at_start {
            return self.cfatal("Bug: Too much pushback");
        }
        self.stack.last_mut().unwrap().cursor -= 1;
        Ok(())
    }

    /// Push back `text` as a replay frame of its own; the next reads will
    /// see it before anything currently on the stack.  `name` tags the
    /// frame with the macro it came from.
    pub fn unget_string(&mut self, text: &[u8], name: Option<Rc<str>>) {
        log::trace!(
            "LexerSession::unget_string(): {:?} as {name:?}",
            String::from_utf8_lossy(text)
        );
        let frame = Frame::text(text, name, self.src_line, self.cond_depth());
        self.stack.push(frame);
    }

    /// Number of frames currently stacked.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn top_is_file(&self) -> bool {
        self.stack.last().is_some_and(Frame::is_file)
    }

    /// Open `filename` and make it the current input.  Returns `Ok(false)`
    /// if the file could not be found along the search path.
    ///
    /// The name is resolved against the directory of the current file
    /// first, then against each `-I` directory in order.  An absolute name
    /// is taken as is.
    pub fn push_file(&mut self, filename: &str, include_opt: bool) -> Result<bool> {
        if self.include_nest >= INCLUDE_NEST {
            return self.cfatal(format!(
                "Too deeply nested #include (max {INCLUDE_NEST})"
            ));
        }
        let Some((file, full_path)) = self.search_file(filename)? else {
            return Ok(false);
        };
        let mut reader = BufReader::new(file);
        skip_bom(&mut reader)?;

        // Marker for the includer's position before switching files.
        if !include_opt {
            self.sharp(0)?;
        }

        let name = crate::session::save_string(filename);
        let full: Rc<str> = Rc::from(full_path.to_string_lossy().into_owned());
        log::debug!("LexerSession::push_file(): {full:?}");
        let frame = Frame::file(
            reader,
            name.clone(),
            full.clone(),
            include_opt,
            self.src_line,
            self.sinks.clone(),
            self.cond_depth(),
        );
        self.stack.push(frame);
        self.include_nest += 1;
        if self.include_nest == STD_INCLUDE_NEST + 1 {
            self.cwarn(format!(
                "More than {STD_INCLUDE_NEST} nesting of #include"
            ))?;
        }
        self.cur_fname = Some(name);
        self.cur_fullname = Some(full);
        // Line numbers restart, and so do the catenation records.
        self.bsl_record.reset();
        self.com_record.reset();
        if !include_opt {
            self.src_line = 1;
            self.sharp(1)?;
        }
        self.src_line = 0;
        Ok(true)
    }

    /// Find `filename` along the search path and open it, giving up a
    /// descriptor first if the budget is spent.
    fn search_file(&mut self, filename: &str) -> Result<Option<(fs::File, PathBuf)>> {
        if self.open_file_count() >= FD_BUDGET {
            // The oldest ancestor resumes last; its stream goes first.
            let released = self
                .stack
                .iter_mut()
                .find(|f| f.is_open_file())
                .map(Frame::release_descriptor);
            if let Some(Err(e)) = released {
                return Err(e.into());
            }
        }
        let name = Path::new(filename);
        let mut candidates = Vec::new();
        if name.is_absolute() {
            candidates.push(name.to_path_buf());
        } else {
            let cur_dir = self
                .stack
                .iter()
                .rev()
                .filter(|f| f.is_file())
                .find_map(Frame::directory);
            match cur_dir {
                Some(dir) => candidates.push(dir.join(name)),
                None => candidates.push(name.to_path_buf()),
            }
            for dir in &self.opts.include_dirs {
                candidates.push(dir.join(name));
            }
        }
        for candidate in candidates {
            match fs::File::open(&candidate) {
                Ok(file) => return Ok(Some((file, candidate))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    fn open_file_count(&self) -> usize {
        self.stack.iter().filter(|f| f.is_open_file()).count()
    }

    /// Bookkeeping for popping a file frame: restore the includer's
    /// identity, line number and sinks, get its descriptor back if it was
    /// lent out, and mark the return in the output.
    fn return_to_includer(&mut self, popped: &Frame) -> Result<()> {
        log::debug!(
            "LexerSession::return_to_includer(): leaving {:?}",
            popped.full_path
        );
        self.src_line = popped.saved_line;
        self.newlines = 0;
        self.bsl_record.reset();
        self.com_record.reset();
        if let Some(sinks) = popped.saved_sinks.clone() {
            self.sinks = sinks;
        }

        let parent = self.stack.last_mut().unwrap();
        let parent_path = parent.full_path.clone();
        if let Err(e) = parent.reopen() {
            log::debug!("LexerSession::return_to_includer(): reopen failed: {e}");
            return self.cfatal(format!("Can't reopen file {parent_path:?}"));
        }
        let file_parent = self.stack.iter().rev().find(|f| f.is_file());
        if let Some(p) = file_parent {
            self.cur_fname = p.name.clone();
            self.cur_fullname = p.full_path.clone();
        }
        self.include_nest -= 1;

        let flag = if self.stack.last().unwrap().include_opt {
            1
        } else if popped.include_opt {
            0
        } else {
            2
        };
        self.src_line += 1;
        self.sharp(flag)?;
        self.src_line -= 1;
        Ok(())
    }
}

/// A UTF-8 byte order mark at the very start of a file is not input.
fn skip_bom(reader: &mut BufReader<fs::File>) -> std::io::Result<()> {
    let head = reader.fill_buf()?;
    if head.starts_with(&[0xEF, 0xBB, 0xBF]) {
        log::debug!("skip_bom(): dropped byte order mark");
        reader.consume(3);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::*;
    use crate::output::Sink;
    use crate::test_utils::{bare_session, file_session, read_to_eof, TempSource};
    use crate::Error;

    #[test]
    fn test_text_frames_replay_in_stack_order() {
        let (mut lex, _out, _err) = bare_session();
        lex.unget_string(b"old", None);
        lex.unget_string(b"new", None);
        let mut got = Vec::new();
        loop {
            let c = lex.get_ch().unwrap();
            if c == CHAR_EOF {
                break;
            }
            got.push(c);
        }
        assert_eq!(got, b"newold");
    }

    #[test]
    fn test_unget_ch_backs_up_one_character() {
        let (mut lex, _out, _err) = bare_session();
        lex.unget_string(b"ab", None);
        assert_eq!(lex.get_ch().unwrap(), b'a');
        lex.unget_ch().unwrap();
        assert_eq!(lex.get_ch().unwrap(), b'a');
        assert_eq!(lex.get_ch().unwrap(), b'b');
    }

    #[test]
    fn test_pushback_past_buffer_start_is_fatal() {
        let (mut lex, _out, _err) = bare_session();
        lex.unget_string(b"x", None);
        // One step forward allows one step back; the second is the bug.
        assert_eq!(lex.get_ch().unwrap(), b'x');
        lex.unget_ch().unwrap();
        let err = lex.unget_ch().unwrap_err();
        assert!(matches!(err, Error::Fatal(msg) if msg.contains("Too much pushback")));
    }

    #[test]
    fn test_unget_after_end_of_input_is_harmless() {
        let (mut lex, _out, _err) = bare_session();
        assert_eq!(lex.get_ch().unwrap(), CHAR_EOF);
        lex.unget_ch().unwrap();
        assert_eq!(lex.get_ch().unwrap(), CHAR_EOF);
    }

    #[test]
    fn test_in_token_read_stops_at_frame_end() {
        let (mut lex, _out, _err) = bare_session();
        lex.unget_string(b"ab", Some("m".into()));
        lex.unget_string(b"x", None);
        lex.in_token = true;
        assert_eq!(lex.get_ch().unwrap(), b'x');
        // The frame's terminating EOS comes out instead of the next
        // frame's content.
        assert_eq!(lex.get_ch().unwrap(), EOS);
        lex.unget_ch().unwrap();
        lex.in_token = false;
        // The ordinary path falls through to the frame below.
        assert_eq!(lex.get_ch().unwrap(), b'a');
    }

    #[test]
    fn test_nul_bytes_never_reach_replay_text() {
        let (mut lex, _out, _err) = bare_session();
        lex.unget_string(b"a\0b", None);
        assert_eq!(lex.get_ch().unwrap(), b'a');
        assert_eq!(lex.get_ch().unwrap(), b'b');
        assert_eq!(lex.get_ch().unwrap(), CHAR_EOF);
    }

    #[test]
    fn test_included_file_reads_before_the_rest_of_the_includer() {
        let inner = TempSource::new(b"INNER\n");
        let (mut lex, out, _err, src) = file_session(b"one\ntwo\n");
        let mut first = String::new();
        loop {
            let c = lex.get_ch().unwrap();
            first.push(c as char);
            if c == b'\n' {
                break;
            }
        }
        assert_eq!(first, "one\n");
        assert!(lex.push_file(inner.path_str(), false).unwrap());
        assert_eq!(read_to_eof(&mut lex), "INNER\ntwo\n");
        // Markers report entering the include and landing back on the
        // includer's next line.
        let out = out.to_string_lossy();
        assert!(out.contains(&format!("#line 1 \"{}\"", inner.full_path())), "{out}");
        assert!(out.contains(&format!("#line 2 \"{}\"", src.full_path())), "{out}");
    }

    #[test]
    fn test_marker_flags_tag_include_transitions() {
        let inner = TempSource::new(b"i\n");
        let (mut lex, out, _err, src) = file_session(b"a\nb\n");
        lex.opts.marker_flags = true;
        while lex.get_ch().unwrap() != b'\n' {}
        assert!(lex.push_file(inner.path_str(), false).unwrap());
        read_to_eof(&mut lex);
        let out = out.to_string_lossy();
        assert!(out.contains(&format!("#line 1 \"{}\" 1", inner.full_path())), "{out}");
        assert!(out.contains(&format!("#line 2 \"{}\" 2", src.full_path())), "{out}");
    }

    #[test]
    fn test_descriptor_budget_stays_transparent_across_releases() {
        let sources: Vec<TempSource> = (0..FD_BUDGET + 2)
            .map(|i| TempSource::new(format!("file{i}\n")))
            .collect();
        let (mut lex, _out, _err) = bare_session();
        for src in &sources {
            assert!(lex.push_file(src.path_str(), false).unwrap());
        }
        // More frames than descriptors; the released ones reopen at their
        // saved positions and none of the text goes missing.
        let expected: String = (0..FD_BUDGET + 2)
            .rev()
            .map(|i| format!("file{i}\n"))
            .collect();
        assert_eq!(read_to_eof(&mut lex), expected);
    }

    #[test]
    fn test_released_file_resumes_under_a_replay_frame() {
        let sources: Vec<TempSource> = (0..FD_BUDGET)
            .map(|i| TempSource::new(format!("file{i}\n")))
            .collect();
        let (mut lex, _out, _err, _src) = file_session(b"head\nrest of the root\n");
        let mut first = String::new();
        loop {
            let c = lex.get_ch().unwrap();
            first.push(c as char);
            if c == b'\n' {
                break;
            }
        }
        assert_eq!(first, "head\n");
        // A replay frame sits between the root and the includes, so the
        // root resumes from a plain frame pop rather than a file pop.
        lex.unget_string(b"T", None);
        for src in &sources {
            assert!(lex.push_file(src.path_str(), false).unwrap());
        }
        let includes: String = (0..FD_BUDGET).rev().map(|i| format!("file{i}\n")).collect();
        assert_eq!(
            read_to_eof(&mut lex),
            format!("{includes}Trest of the root\n")
        );
    }

    #[test]
    fn test_include_nesting_past_the_hard_limit_is_fatal() {
        let (mut lex, _out, err, src) = file_session(b"x\n");
        let result = loop {
            match lex.push_file(src.path_str(), false) {
                Ok(true) => continue,
                other => break other,
            }
        };
        assert!(
            matches!(result, Err(Error::Fatal(msg)) if msg.contains("Too deeply nested #include"))
        );
        assert!(err
            .to_string_lossy()
            .contains("More than 15 nesting of #include"));
    }

    #[test]
    fn test_sinks_restored_when_a_file_frame_pops() {
        let inner = TempSource::new(b"i\n");
        let (mut lex, out, _err, _src) = file_session(b"a\n");
        assert!(lex.push_file(inner.path_str(), false).unwrap());
        let (redirect_sink, redirect) = Sink::mem();
        lex.sinks.out = redirect_sink;
        read_to_eof(&mut lex);
        // Popping the include put the saved sinks back.
        lex.putout(b"after").unwrap();
        assert!(out.to_string_lossy().ends_with("after\n"));
        assert!(redirect.contents().is_empty());
    }
}
