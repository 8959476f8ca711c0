use std::io::Write;

use crate::{
    error::Result,
    expand::MacroScope,
    lexer::{TokenBuf, CHAR_TYPE, HSP},
    session::LexerSession,
    CHAR_EOF, TOK_SEP,
};

impl LexerSession {
    /// The main copy loop: read logical lines, lex each into tokens
    /// (expanding macro names through `scope`), and write them out with
    /// line markers keeping the output in step with the source.
    pub fn preprocess<S: MacroScope>(&mut self, scope: &mut S) -> Result<()> {
        let mut line = TokenBuf::new();
        'input: loop {
            self.newlines = 0;
            // Absorb blank lines and line-leading whitespace until a
            // token turns up.
            let mut c;
            loop {
                line.clear();
                c = self.get_ch()?;
                while CHAR_TYPE[c as usize] & HSP != 0 {
                    // Token separators from replay text are dropped;
                    // real spaces at the line top are kept.
                    if c != TOK_SEP {
                        line.push(c);
                    }
                    c = self.get_ch()?;
                }
                if c != b'\n' {
                    break;
                }
                if self.opts.keep_comments {
                    // Comments of this line were already written; the
                    // line break belongs with them.
                    self.sinks.out.write_all(b"\n")?;
                } else {
                    self.newlines += 1;
                }
            }
            if c == CHAR_EOF {
                break 'input;
            }

            // There is a token to copy; first catch up on the lines
            // skipped above.
            if self.wrong_line || self.newlines > 10 {
                self.sharp(0)?;
            } else {
                for _ in 0..self.newlines {
                    self.sinks.out.write_all(b"\n")?;
                }
            }

            while c != b'\n' && c != CHAR_EOF {
                // None means the line ended inside replay text; the
                // newline is pushed back and read again just below.
                let _ = self.get_unexpandable(scope, c, &mut line, false)?;
                c = self.get_ch()?;
                while CHAR_TYPE[c as usize] & HSP != 0 {
                    if c != TOK_SEP {
                        line.push(c);
                    }
                    c = self.get_ch()?;
                }
            }
            self.putout(line.as_bytes())?;
        }
        Ok(())
    }
}
