use std::{path::PathBuf, rc::Rc};

use crate::{
    diag::ExpandTracer,
    input::Frame,
    lexer::OpCode,
    line::CatRecord,
    output::SinkSet,
};

/// Marks a macro call whose argument list ran into end of file; suppresses
/// the usual diagnostics for that call.
pub const MACRO_ERROR: u64 = u64::MAX;

/// Knobs affecting lexing and output, filled in from the command line.
#[derive(Debug, Clone)]
pub struct Options {
    /// Keep comments in the output instead of collapsing each to a space.
    pub keep_comments: bool,
    /// Keep runs of horizontal whitespace instead of squeezing them.
    pub keep_spaces: bool,
    /// Emit `#line` markers when the output falls out of step with the
    /// source.
    pub line_markers: bool,
    /// Append `1` / `2` to markers that enter / leave an included file.
    pub marker_flags: bool,
    /// Directories searched for quoted include names, in order.
    pub include_dirs: Vec<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_comments: false,
            keep_spaces: false,
            line_markers: true,
            marker_flags: false,
            include_dirs: Vec::new(),
        }
    }
}

/// All state of one lexing run: the frame stack, the output sinks, line
/// bookkeeping and diagnostics counters.  Methods on this type make up the
/// character, line and token layers; everything is single threaded and
/// re-entrant only in the sense that a fresh session starts clean.
pub struct LexerSession {
    pub opts: Options,
    pub(crate) stack: Vec<Frame>,
    pub(crate) sinks: SinkSet,

    /// Set while a token scanner owns the read position.  While set,
    /// [`LexerSession::get_ch`] will not refill or pop a frame, so a token
    /// never straddles a frame boundary.
    pub(crate) in_token: bool,
    /// Current logical line number of the innermost source file.
    pub src_line: u64,
    /// Output no longer corresponds line-for-line to the source; the next
    /// output line should be preceded by a `#line` marker.
    pub(crate) wrong_line: bool,
    /// Blank source lines seen but not yet reflected in the output.
    pub(crate) newlines: usize,

    /// Display name of the current source file (as it appears in markers).
    pub(crate) cur_fname: Option<Rc<str>>,
    /// Resolved path of the current source file (as diagnostics print it).
    pub(crate) cur_fullname: Option<Rc<str>>,
    pub(crate) include_nest: usize,

    /// Text of the identifier most recently scanned.
    pub identifier: Vec<u8>,
    /// Operator code of the punctuator most recently scanned.
    pub openum: Option<OpCode>,
    /// The token layer is lexing a macro definition body; `#` and `##` are
    /// reported as stringize / concat operators there.
    pub in_define: bool,

    /// Line catenation records for backslash-newline splices and for
    /// comments spanning lines, most recent catenation each.
    pub(crate) bsl_record: CatRecord,
    pub(crate) com_record: CatRecord,

    // Last `#line` marker written, to suppress repeats.
    pub(crate) sh_line: u64,
    pub(crate) sh_name: Option<Rc<str>>,

    /// Recoverable errors reported so far.
    pub errors: usize,
    pub(crate) cr_warned: bool,
    pub(crate) tracer: ExpandTracer,

    /// Lines at which the conditional layer opened `#if` sections that are
    /// still unclosed.  Maintained by the caller through
    /// [`LexerSession::cond_push`] / [`LexerSession::cond_pop`]; end of
    /// file checks it against the frame's snapshot.
    pub(crate) cond_stack: Vec<u64>,
    /// Name and line of the macro call the expander is currently reading
    /// arguments for, if any ([`MACRO_ERROR`] once that call failed).
    pub macro_name: Option<Rc<str>>,
    pub macro_line: u64,
    pub in_getarg: bool,
}

impl LexerSession {
    pub fn new(opts: Options, sinks: SinkSet) -> Self {
        Self {
            opts,
            stack: Vec::new(),
            sinks,
            in_token: false,
            src_line: 0,
            wrong_line: false,
            newlines: 0,
            cur_fname: None,
            cur_fullname: None,
            include_nest: 0,
            identifier: Vec::new(),
            openum: None,
            in_define: false,
            bsl_record: CatRecord::default(),
            com_record: CatRecord::default(),
            sh_line: 0,
            sh_name: None,
            errors: 0,
            cr_warned: false,
            tracer: ExpandTracer::default(),
            cond_stack: Vec::new(),
            macro_name: None,
            macro_line: 0,
            in_getarg: false,
        }
    }

    /// Number of `#if` sections currently open.
    pub fn cond_depth(&self) -> usize {
        self.cond_stack.len()
    }

    /// The conditional layer opened an `#if` section at `line`.
    pub fn cond_push(&mut self, line: u64) {
        self.cond_stack.push(line);
    }

    /// The conditional layer closed the innermost `#if` section.
    pub fn cond_pop(&mut self) -> Option<u64> {
        self.cond_stack.pop()
    }

    /// The macro layer started reading the argument list of a call to
    /// `name` at `line`.  End of file inside the call is then an error.
    pub fn begin_macro_call(&mut self, name: Rc<str>, line: u64) {
        self.macro_name = Some(name);
        self.macro_line = line;
        self.in_getarg = true;
    }

    /// The macro layer finished (or abandoned) the current call.
    pub fn end_macro_call(&mut self) {
        self.macro_name = None;
        self.macro_line = 0;
        self.in_getarg = false;
        self.tracer.clear();
    }

    /// Record that `name` is being expanded, for later diagnostics.
    pub fn note_expanding(&mut self, name: Rc<str>, definition: Option<Rc<str>>) {
        self.tracer.note(name, definition);
    }
}

/// Keep a copy of a transient name for as long as anything may refer to it.
pub fn save_string(s: &str) -> Rc<str> {
    Rc::from(s)
}
