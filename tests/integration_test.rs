//! End to end runs over the fixture files, checking the preprocessed text
//! and the diagnostics byte for byte.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use similar_asserts::assert_eq;

use pplex::error::{Error, Result};

/// In-memory stand-in for stdout / stderr; clones share the buffer, so the
/// copy handed to [`pplex::run`] fills the one kept for assertions.
#[derive(Clone, Default)]
struct Captured(Rc<RefCell<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn preprocess(args: pplex::Args) -> (Result<()>, String, String) {
    let out = Captured::default();
    let err = Captured::default();
    let result = pplex::run(out.clone(), err.clone(), args);
    (result, out.text(), err.text())
}

#[test]
fn test_copies_a_file_behind_an_initial_marker() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/basic.c".into(),
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"#line 1 "tests/fixtures/basic.c"
int main(void)
{
    return 0;
}
"#
    );
    assert_eq!(err, "");
}

#[test]
fn test_crlf_input_comes_out_with_bare_newlines() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/crlf.c".into(),
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"#line 1 "tests/fixtures/crlf.c"
a = 1;
b = 2;
"#
    );
    // Warned once, not per line.
    assert_eq!(
        err,
        "tests/fixtures/crlf.c:1: warning: Converted [CR+LF] to [LF]\n    a = 1;\n"
    );
}

#[test]
fn test_byte_order_mark_is_not_input() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/bom.c".into(),
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"#line 1 "tests/fixtures/bom.c"
bom = 1;
"#
    );
    assert_eq!(err, "");
}

#[test]
fn test_missing_final_newline_is_supplemented() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/no_newline.c".into(),
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"#line 1 "tests/fixtures/no_newline.c"
y = 2;
"#
    );
    assert_eq!(
        err,
        "tests/fixtures/no_newline.c:1: warning: \
         End of input with no newline, supplemented newline\n    y = 2;\n"
    );
}

#[test]
fn test_spliced_line_is_marked_with_its_last_physical_line() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/spliced.c".into(),
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"#line 1 "tests/fixtures/spliced.c"
#line 2 "tests/fixtures/spliced.c"
onetwo
three
"#
    );
    assert_eq!(err, "");
}

#[test]
fn test_comment_crossing_lines_resyncs_the_markers() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/comment_cross.c".into(),
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"#line 1 "tests/fixtures/comment_cross.c"
#line 2 "tests/fixtures/comment_cross.c"
a b
after
"#
    );
    assert_eq!(err, "");
}

#[test]
fn test_comments_collapse_by_default() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/comments.c".into(),
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"#line 1 "tests/fixtures/comments.c"
a b

c
"#
    );
    assert_eq!(
        err,
        "tests/fixtures/comments.c:2: warning: Parsed \"//\" as comment\n    // tail\n"
    );
}

#[test]
fn test_keep_comments_writes_them_through() {
    let (result, out, _err) = preprocess(pplex::Args {
        file: "tests/fixtures/comments.c".into(),
        keep_comments: true,
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(
        out,
        r#"
#line 1 "tests/fixtures/comments.c"
/* note */
a b
// tail


#line 3 "tests/fixtures/comments.c"
c
"#
    );
}

#[test]
fn test_no_line_markers_suppresses_all_markers() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/spliced.c".into(),
        no_line_markers: true,
        ..Default::default()
    });
    assert!(result.is_ok());
    assert_eq!(out, "onetwo\nthree\n");
    assert_eq!(err, "");
}

#[test]
fn test_control_character_fails_the_run() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/control.c".into(),
        ..Default::default()
    });
    assert!(matches!(result, Err(Error::Failed(1))));
    // The character is skipped but the rest of the line still comes out.
    assert_eq!(out, "#line 1 \"tests/fixtures/control.c\"\nab\n");
    assert_eq!(
        err,
        "tests/fixtures/control.c:1: error: \
         Illegal control character 0x01, skipped the character\n    a\u{1}b\n"
    );
}

#[test]
fn test_missing_input_file_is_fatal() {
    let (result, out, err) = preprocess(pplex::Args {
        file: "tests/fixtures/absent.c".into(),
        ..Default::default()
    });
    assert!(matches!(result, Err(Error::Fatal(_))));
    assert_eq!(out, "");
    assert_eq!(err, "Can't open input file \"tests/fixtures/absent.c\"\n");
}

#[test]
fn test_output_lands_in_the_named_file() {
    let target = std::env::temp_dir().join(format!("pplex-it-{}.out", std::process::id()));
    let (result, out, _err) = preprocess(pplex::Args {
        file: "tests/fixtures/basic.c".into(),
        output: Some(target.clone()),
        ..Default::default()
    });
    assert!(result.is_ok());
    // Nothing on stdout once a file takes the output.
    assert_eq!(out, "");
    let written = std::fs::read_to_string(&target).unwrap();
    let _ = std::fs::remove_file(&target);
    assert!(written.starts_with("#line 1 \"tests/fixtures/basic.c\"\n"));
    assert!(written.ends_with("}\n"));
}
