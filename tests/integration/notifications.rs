use crate::common::{mp_array, mp_int, mp_str, Harness, SourceFile};
use serial_test::serial;

#[test]
#[serial]
fn test_console_command_is_forwarded() {
    let mut harness = Harness::new();
    harness.notify("pdp/command", &[mp_str("bt")]);
    harness.pump();
    assert_eq!(harness.gdb_command(), r#"1-interpreter-exec console "bt""#);

    harness.notify("pdp/command", &[mp_str(r#"print "x""#)]);
    harness.notify("pdp/mi", &[mp_str("-break-list")]);
    harness.pump();
    assert_eq!(
        harness.gdb_command(),
        r#"2-interpreter-exec console "print \"x\"""#
    );
    assert_eq!(harness.gdb_command(), "3-break-list");
}

#[test]
#[serial]
fn test_unknown_notification_is_ignored() {
    let mut harness = Harness::new();
    harness.notify("pdp/unknown", &[mp_int(1), mp_array(&[mp_str("x")])]);
    harness.notify("pdp/mi", &[mp_str("-exec-run")]);
    harness.pump();
    assert!(harness.coordinator.is_running());
    assert_eq!(harness.gdb_command(), "1-exec-run");
}

#[test]
#[serial]
fn test_buffer_notifications() {
    let source = SourceFile::new("buffers.c");
    let mut harness = Harness::new();
    harness.initialize();

    harness.notify("pdp/buf_changed", &[mp_int(7), mp_str(&source.path)]);
    harness.notify("pdp/buf_changed", &[mp_int(8), mp_str("relative.c")]);
    harness.pump();
    {
        let session = harness.ctx().session.borrow();
        assert_eq!(session.opened_buffers.get(&source.path), Some(&7));
        assert_eq!(session.opened_buffers.len(), 1);
    }

    harness.notify("pdp/buf_removed", &[mp_str(&source.path)]);
    harness.pump();
    assert!(harness.ctx().session.borrow().opened_buffers.is_empty());
    harness.assert_no_request();
}

#[test]
#[serial]
fn test_unawaited_responses_are_skipped() {
    let mut harness = Harness::new();
    harness.initialize();

    // set_lines with a nested result nobody waits for
    harness.gdb_records(&[r#"~"hello\n""#]);
    harness.pump();
    let request = harness.expect("nvim_buf_set_lines");
    harness.respond(
        request.token(),
        &mp_array(&[mp_int(1), mp_array(&[mp_str("a"), mp_int(300)])]),
    );
    harness.notify("pdp/mi", &[mp_str("-exec-next")]);
    harness.pump();
    assert_eq!(harness.gdb_command(), "1-exec-next");
    assert!(harness.coordinator.is_idle());
}
