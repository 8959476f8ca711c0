use std::fmt::Write as _;
use std::io::Write as _;
use std::rc::Rc;

use crate::{
    error::{Error, Result},
    session::LexerSession,
    CAT, DEF_MAGIC, EOS, IN_SRC, RT_END, ST_QUOTE, TOK_SEP,
};

/// How many in-flight expansions are remembered for diagnostics.
const TRACE_RING: usize = 16;

/// Ring of macros noted as expanding since the current call started, with
/// the definition each had at that moment.  Printed under error reports so
/// a message pointing into replay text still names its origin.
#[derive(Debug, Default)]
pub(crate) struct ExpandTracer {
    entries: Vec<(Rc<str>, Option<Rc<str>>)>,
}

impl ExpandTracer {
    pub(crate) fn note(&mut self, name: Rc<str>, definition: Option<Rc<str>>) {
        if self.entries.iter().any(|(n, _)| **n == *name) {
            return;
        }
        if self.entries.len() == TRACE_RING {
            self.entries.remove(0);
        }
        self.entries.push((name, definition));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn entries(&self) -> &[(Rc<str>, Option<Rc<str>>)] {
        &self.entries
    }

    fn definition_of(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| **n == *name)
            .and_then(|(_, d)| d.as_deref())
    }
}

pub(crate) fn format_macro_note(name: &str, definition: &str) -> String {
    format!("    macro \"{name}\" defined as: {definition}")
}

/// Strip in-band marker bytes out of text bound for a diagnostic, and fold
/// embedded newlines to spaces.
fn escape_markers(text: &str) -> String {
    let skip = [TOK_SEP, RT_END, CAT, ST_QUOTE, DEF_MAGIC, IN_SRC];
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\n' {
            out.push(' ');
        } else if !(c.is_ascii() && skip.contains(&(c as u8))) {
            out.push(c);
        }
    }
    if text.ends_with('\n') {
        out.pop();
    }
    out
}

/// A frame's line text, without the terminator and trailing newline.  The
/// buffer is not always terminated yet when a diagnostic fires mid-read.
fn line_text(buf: &[u8]) -> String {
    let mut end = buf.len();
    if buf.last() == Some(&EOS) {
        end -= 1;
    }
    let mut text = String::from_utf8_lossy(&buf[..end]).into_owned();
    if text.ends_with('\n') {
        text.pop();
    }
    text
}

impl LexerSession {
    /// Report and fail.  The full context goes to the error sink; the
    /// returned error carries the bare message for the caller.
    pub(crate) fn cfatal<T>(&mut self, msg: impl Into<String>) -> Result<T> {
        let msg = msg.into();
        self.do_msg("fatal error", &msg)?;
        Err(Error::Fatal(msg))
    }

    /// Report and count an error, then continue.
    pub(crate) fn cerror(&mut self, msg: impl Into<String>) -> Result<()> {
        self.errors += 1;
        self.do_msg("error", &msg.into())
    }

    /// Report a warning; not counted.
    pub(crate) fn cwarn(&mut self, msg: impl Into<String>) -> Result<()> {
        self.do_msg("warning", &msg.into())
    }

    /// Print one diagnostic with its source context: location header,
    /// current source line, the chain of includers, and the macros being
    /// expanded.
    fn do_msg(&mut self, severity: &str, msg: &str) -> Result<()> {
        // Output written so far should precede the report.
        self.sinks.out.flush()?;

        let msg = escape_markers(msg);
        let mut report = String::new();
        let files: Vec<usize> = self
            .stack
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.is_file())
            .map(|(i, _)| i)
            .collect();
        if files.is_empty() {
            let _ = writeln!(report, "{msg}");
        } else {
            let name = self.cur_fullname.as_deref().unwrap_or("<input>");
            let _ = writeln!(report, "{name}:{}: {severity}: {msg}", self.src_line);
        }

        // The line an includer stands on was snapshotted into the frame
        // pushed on top of it; the innermost file is at the session's
        // current line.
        let line_of = |i: usize| -> u64 {
            match files.iter().position(|&f| f == i) {
                Some(p) if p + 1 < files.len() => self.stack[files[p + 1]].saved_line,
                _ => self.src_line,
            }
        };

        let mut walk_from = self.stack.len();
        if let Some(top) = self.stack.last() {
            if top.is_file() {
                let _ = writeln!(report, "    {}", line_text(&top.buf));
                walk_from -= 1;
            }
        }
        for i in (0..walk_from).rev() {
            let frame = &self.stack[i];
            if frame.is_file() {
                let path = frame
                    .full_path
                    .as_deref()
                    .or(frame.name.as_deref())
                    .unwrap_or("<input>");
                let _ = writeln!(
                    report,
                    "    from {path}: {}:    {}",
                    line_of(i),
                    line_text(&frame.buf)
                );
            } else if let Some(name) = frame.name.as_deref() {
                // A replay frame under expansion; skip a repeat of the
                // frame directly beneath it.
                let repeat = i
                    .checked_sub(1)
                    .and_then(|below| self.stack[below].name.as_deref())
                    .is_some_and(|n| n == name);
                if !repeat {
                    if let Some(def) = self.tracer.definition_of(name) {
                        let _ = writeln!(report, "{}", format_macro_note(name, def));
                    }
                }
            }
        }

        if let Some(mac) = &self.macro_name {
            // The call being collected leads the list; then everything
            // noted since it started, once each, skipping names already
            // shown with a stacked replay frame.
            let stacked: Vec<&str> = self
                .stack
                .iter()
                .filter(|frame| !frame.is_file())
                .filter_map(|frame| frame.name.as_deref())
                .collect();
            let head = [(mac.clone(), None)];
            let mut shown: Vec<&str> = Vec::new();
            for (name, def) in head.iter().chain(self.tracer.entries()) {
                let name = name.as_ref();
                if shown.contains(&name) {
                    continue;
                }
                shown.push(name);
                if stacked.contains(&name) {
                    continue;
                }
                let def = def.as_deref().or_else(|| self.tracer.definition_of(name));
                if let Some(def) = def {
                    let _ = writeln!(report, "{}", format_macro_note(name, def));
                }
            }
        }

        self.sinks.err.write_all(report.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use test_log::test;

    use super::*;
    use crate::session::save_string;
    use crate::test_utils::{bare_session, file_session, TempSource};

    #[test]
    fn test_tracer_dedups_and_caps_entries() {
        let mut tracer = ExpandTracer::default();
        for i in 0..20 {
            tracer.note(save_string(&format!("mac{i}")), None);
        }
        assert_eq!(tracer.entries().len(), TRACE_RING);
        // Oldest entries rolled off the ring.
        assert_eq!(&*tracer.entries()[0].0, "mac4");
        tracer.note(save_string("mac10"), None);
        assert_eq!(tracer.entries().len(), TRACE_RING);
    }

    #[test]
    fn test_escape_markers_strips_in_band_bytes() {
        let raw = format!("a{}b{}c\nd", TOK_SEP as char, CAT as char);
        assert_eq!(escape_markers(&raw), "abc d");
    }

    #[test]
    fn test_error_report_shows_location_and_line() {
        let (mut lex, _out, err, _src) = file_session("abc\n");
        lex.get_ch().unwrap();
        lex.cerror("Bad thing").unwrap();
        assert_eq!(lex.errors, 1);
        let err = err.to_string_lossy();
        assert!(err.contains(":1: error: Bad thing"), "{err}");
        assert!(err.contains("    abc"), "{err}");
    }

    #[test]
    fn test_warning_is_not_counted() {
        let (mut lex, _out, err, _src) = file_session("x\n");
        lex.get_ch().unwrap();
        lex.cwarn("Just so you know").unwrap();
        assert_eq!(lex.errors, 0);
        assert!(err.to_string_lossy().contains(": warning: Just so you know"));
    }

    #[test]
    fn test_fatal_reports_then_fails() {
        let (mut lex, _out, err, _src) = file_session("x\n");
        lex.get_ch().unwrap();
        let result: Result<()> = lex.cfatal("Out of road");
        assert!(matches!(result, Err(Error::Fatal(msg)) if msg == "Out of road"));
        assert!(err.to_string_lossy().contains(": fatal error: Out of road"));
    }

    #[test]
    fn test_report_without_a_file_has_no_location_header() {
        let (mut lex, _out, err) = bare_session();
        lex.cerror("floating").unwrap();
        let err = err.to_string_lossy();
        assert!(err.contains("floating"), "{err}");
        assert!(!err.contains(": error:"), "{err}");
    }

    #[test]
    fn test_includer_chain_is_reported() {
        let (mut lex, _out, err, outer) = file_session("first line\n");
        lex.get_ch().unwrap();
        let inner = TempSource::new("inner\n");
        lex.push_file(inner.path_str(), false).unwrap();
        lex.get_ch().unwrap();
        lex.cerror("Deep trouble").unwrap();
        let err = err.to_string_lossy();
        assert!(err.contains("    inner"), "{err}");
        let from = format!("    from {}: 1:    first line", outer.full_path());
        assert!(err.contains(&from), "{err}");
    }

    #[test]
    fn test_expanding_macro_definitions_printed_once() {
        let (mut lex, _out, err) = bare_session();
        lex.begin_macro_call(save_string("M"), 3);
        lex.note_expanding(save_string("M"), Some(save_string("#define M 1")));
        lex.note_expanding(save_string("N"), Some(save_string("#define N M")));
        lex.note_expanding(save_string("M"), Some(save_string("#define M 2")));
        lex.cerror("boom").unwrap();
        let err = err.to_string_lossy();
        assert_eq!(
            err.matches("macro \"M\" defined as: #define M 1").count(),
            1,
            "{err}"
        );
        assert!(err.contains("macro \"N\" defined as: #define N M"), "{err}");
    }

    #[test]
    fn test_stacked_replay_frame_reported_through_walk() {
        let (mut lex, _out, err) = bare_session();
        lex.begin_macro_call(save_string("M"), 1);
        lex.note_expanding(save_string("M"), Some(save_string("#define M x")));
        lex.unget_string(b"x", Some(save_string("M")));
        lex.cerror("mid-replay").unwrap();
        let err = err.to_string_lossy();
        // Once from the frame walk; the trailer skips the stacked name.
        assert_eq!(
            err.matches("macro \"M\" defined as: #define M x").count(),
            1,
            "{err}"
        );
    }
}
