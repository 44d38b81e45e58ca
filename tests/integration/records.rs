use crate::common::{Harness, PROMPT_BUF, PROMPT_NS};
use serial_test::serial;

#[test]
#[serial]
fn test_async_records_update_session() {
    let mut harness = Harness::new();
    harness.initialize();

    harness.gdb_records(&[
        r#"=thread-group-started,id="i1",pid="4242""#,
        r#"*running,thread-id="all""#,
    ]);
    harness.pump();
    {
        let session = harness.ctx().session.borrow();
        assert_eq!(session.pid, 4242);
        assert!(!session.is_stopped);
    }

    harness.gdb_records(&[
        r#"*stopped,reason="breakpoint-hit",disp="keep",bkptno="1",frame={level="0",addr="0x0000555555555139",func="main",args=[]},thread-id="2",stopped-threads="all""#,
    ]);
    harness.pump();
    {
        let session = harness.ctx().session.borrow();
        assert!(session.is_stopped);
        assert_eq!(session.selected_thread, 2);
        assert_eq!(session.selected_frame, 0);
    }

    harness.gdb_records(&[
        r#"=thread-selected,id="3",frame={level="1",addr="0x0000555555555150",func="helper"}"#,
        r#"=library-loaded,id="/lib/libc.so.6",target-name="/lib/libc.so.6",symbols-loaded="0""#,
        r#"*stopped,reason="exited-normally""#,
    ]);
    harness.pump();
    {
        let session = harness.ctx().session.borrow();
        assert_eq!(session.selected_thread, 3);
        assert_eq!(session.selected_frame, 0);
        assert_eq!(session.pid, -1);
    }
    harness.assert_no_request();
}

#[test]
#[serial]
fn test_console_and_errors_reach_prompt() {
    let mut harness = Harness::new();
    harness.initialize();

    harness.gdb_records(&[
        r#"~"Reading symbols from app...\n""#,
        r#"@"program output\n""#,
        r#"&"log line\n""#,
        r#"^error,msg="No symbol table is loaded.  Use the \"file\" command.""#,
    ]);
    harness.pump();

    let console = harness.expect("nvim_buf_set_lines");
    assert_eq!(console.int_arg(0), PROMPT_BUF);
    assert_eq!(console.int_arg(1), 0);
    assert_eq!(console.int_arg(2), 0);
    assert_eq!(console.arg(4).count(), 1);
    assert_eq!(console.arg(4).at(0), "Reading symbols from app...");

    let error = harness.expect("nvim_buf_set_lines");
    assert_eq!(error.int_arg(1), 1);
    assert_eq!(
        error.arg(4).at(0),
        r#"No symbol table is loaded.  Use the "file" command."#
    );
    let highlight = harness.expect("nvim_buf_set_extmark");
    assert_eq!(highlight.int_arg(0), PROMPT_BUF);
    assert_eq!(highlight.int_arg(1), PROMPT_NS);
    assert_eq!(highlight.int_arg(2), 1);
    assert_eq!(highlight.arg(4).get("line_hl_group"), "ErrorMsg");
    harness.assert_no_request();

    assert_eq!(harness.ctx().session.borrow().num_lines_written, 2);
}

#[test]
#[serial]
fn test_long_console_output_is_split() {
    let mut harness = Harness::new();
    harness.initialize();

    let text: String = (0..20).map(|i| format!("line {i}\\n")).collect();
    harness.gdb_records(&[format!("~\"{text}\"").as_str()]);
    harness.pump();

    let first = harness.expect("nvim_buf_set_lines");
    assert_eq!(first.arg(4).count(), 15);
    assert_eq!(first.arg(4).at(14), "line 14");
    let second = harness.expect("nvim_buf_set_lines");
    assert_eq!(second.int_arg(1), 15);
    assert_eq!(second.arg(4).count(), 5);
    assert_eq!(second.arg(4).at(4), "line 19");
    assert_eq!(harness.ctx().session.borrow().num_lines_written, 20);
}

#[test]
#[serial]
fn test_output_before_initialization_is_logged() {
    let mut harness = Harness::new();
    for _ in 0..8 {
        harness.request();
    }
    harness.gdb_records(&[r#"~"early output\n""#]);
    harness.pump();
    harness.assert_no_request();
    assert_eq!(harness.ctx().session.borrow().num_lines_written, 0);
}
