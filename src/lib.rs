use std::{fs, io::Write, path::PathBuf};

use error::{Error, Result};

pub mod error;

mod diag;
mod expand;
mod input;
mod lexer;
mod line;
mod main_loop;
mod output;
mod session;
#[cfg(test)]
mod test_utils;

pub use expand::{Expansion, MacroScope, NoMacros};
pub use lexer::{OpCode, TokenBuf, TokenType};
pub use line::CatRecord;
pub use output::{MemSink, Sink, SinkSet};
pub use session::{save_string, LexerSession, Options, MACRO_ERROR};

/// Terminates every frame buffer; never appears in input text.
pub const EOS: u8 = b'\0';
/// Returned by [`LexerSession::get_ch`] once the whole input is consumed.
pub const CHAR_EOF: u8 = 0x1a;

// In-band marker bytes.  A macro layer sitting on top of this crate weaves
// them into replay text; the scanners and the diagnostics printer know how
// to read past them.  All of them are control characters a source file is
// not allowed to contain.
/// Prefixed to a macro name in replay text to keep it from expanding again.
pub const DEF_MAGIC: u8 = 0x19;
/// Prefixed to a name token that came straight from a source file.
pub const IN_SRC: u8 = 0x1b;
/// Marks the end of replacement text being rescanned.
pub const RT_END: u8 = 0x1c;
/// Stands for a `"` inside a stringized argument.
pub const ST_QUOTE: u8 = 0x1d;
/// Stands for the `##` operator in a macro body under expansion.
pub const CAT: u8 = 0x1e;
/// Separates adjacent tokens in replay text so they cannot run together;
/// reads as horizontal whitespace and never reaches the output.
pub const TOK_SEP: u8 = 0x1f;

/// Size of the logical line buffer, and so the longest line accepted.
pub const LINE_BUF_SIZE: usize = 0x10000;
/// Identifiers longer than this are truncated, with a warning.
pub const ID_MAX: usize = 1024;
/// Longest token the scanners will store; going past it is fatal.
pub const TOKEN_MAX: usize = LINE_BUF_SIZE;
/// Hard cap on `#include` nesting.
pub const INCLUDE_NEST: usize = 256;
/// Include nesting depth beyond which C99 no longer guarantees anything.
pub const STD_INCLUDE_NEST: usize = 15;
/// How many file descriptors the frame stack may keep open at once; older
/// frames give theirs up and reopen on return.
pub const FD_BUDGET: usize = 8;
/// Most physical lines one catenation record keeps track of.
pub const MAX_CAT_LINE: usize = 256;

#[derive(Debug, clap::Parser, Clone)]
#[command(version, about)]
pub struct Args {
    /// Write comments through to the output instead of collapsing each to
    /// a space.
    #[arg(short = 'C', long)]
    pub keep_comments: bool,
    /// Keep runs of horizontal white space instead of squeezing each run
    /// to a single space.
    #[arg(short = 'k', long)]
    pub keep_spaces: bool,
    /// Don't put out `#line` markers.
    #[arg(short = 'P', long)]
    pub no_line_markers: bool,
    /// Append `1` or `2` to markers that enter or leave an included file.
    #[arg(long)]
    pub marker_flags: bool,
    /// Add a directory to the include search path.
    #[arg(short = 'I', long = "include")]
    pub include_dirs: Vec<PathBuf>,
    /// The source file to read.
    pub file: PathBuf,
    /// Write preprocessed text here instead of to standard output.
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            keep_comments: false,
            keep_spaces: false,
            no_line_markers: false,
            marker_flags: false,
            include_dirs: Vec::default(),
            file: PathBuf::default(),
            output: None,
        }
    }
}

/// Run one pass over `args.file`, writing preprocessed text to
/// `args.output` (or `stdout`) and diagnostics to `stderr`.
pub fn run<STDOUT: Write + 'static, STDERR: Write + 'static>(
    stdout: STDOUT,
    stderr: STDERR,
    args: Args,
) -> Result<()> {
    let opts = Options {
        keep_comments: args.keep_comments,
        // Copied-through comments keep the spacing around them too.
        keep_spaces: args.keep_spaces || args.keep_comments,
        line_markers: !args.no_line_markers,
        marker_flags: args.marker_flags,
        include_dirs: args.include_dirs,
    };
    let out = match &args.output {
        Some(path) => match fs::File::create(path) {
            Ok(file) => Sink::new(file),
            Err(e) => {
                log::debug!("run(): creating {} failed: {e}", path.display());
                return Err(Error::Fatal(format!(
                    "Can't open output file \"{}\"",
                    path.display()
                )));
            }
        },
        None => Sink::new(stdout),
    };
    let mut lex = LexerSession::new(opts, SinkSet::with_sinks(out, Sink::new(stderr)));
    let filename = args.file.to_string_lossy();
    if !lex.push_file(&filename, false)? {
        return lex.cfatal(format!("Can't open input file \"{filename}\""));
    }
    lex.preprocess(&mut NoMacros)?;
    if lex.errors > 0 {
        return Err(Error::Failed(lex.errors));
    }
    Ok(())
}
