use crate::common::{mp_int, mp_str, Harness, SourceFile, BREAKPOINT_NS, MP_NIL, PROMPT_BUF};
use serial_test::serial;

fn created(id: &str, path: &str, line: i64) -> String {
    format!(
        r#"=breakpoint-created,bkpt={{number="{id}",type="breakpoint",disp="keep",enabled="y",addr="0x0000000000001139",func="main",file="main.c",fullname="{path}",line="{line}",thread-groups=["i1"],times="0",original-location="main.c:{line}"}}"#
    )
}

#[test]
#[serial]
fn test_breakpoint_sign_lifecycle() {
    let source = SourceFile::new("lifecycle.c");
    let mut harness = Harness::new();
    harness.initialize();

    harness.gdb_records(&[
        r#"=thread-group-started,id="i1",pid="4242""#,
        created("1", &source.path, 4).as_str(),
    ]);
    harness.pump();

    let bufnr = harness.expect("nvim_call_function");
    assert_eq!(bufnr.arg(0), "bufnr");
    assert_eq!(bufnr.arg(1).at(0), source.path.as_str());

    let lines = harness.expect("nvim_buf_set_lines");
    assert_eq!(lines.int_arg(0), PROMPT_BUF);
    assert_eq!(lines.arg(4).at(0), "*1 in main");
    let id_hl = harness.expect("nvim_buf_set_extmark");
    assert_eq!(id_hl.int_arg(3), 0);
    assert_eq!(id_hl.arg(4).get("end_col").as_int(), Some(2));
    assert_eq!(id_hl.arg(4).get("hl_group"), "debugIdentifier");
    let location_hl = harness.expect("nvim_buf_set_extmark");
    assert_eq!(location_hl.int_arg(3), 6);
    assert_eq!(location_hl.arg(4).get("hl_group"), "debugJumpable");
    harness.expect("nvim_set_option_value");

    harness.respond(bufnr.token(), &mp_int(5));
    harness.respond(lines.token(), &[MP_NIL]);
    harness.pump();

    let mark = harness.expect("nvim_buf_set_extmark");
    assert_eq!(mark.int_arg(0), 5);
    assert_eq!(mark.int_arg(1), BREAKPOINT_NS);
    assert_eq!(mark.int_arg(2), 3);
    assert_eq!(mark.arg(4).get("sign_text"), "1");
    assert_eq!(mark.arg(4).get("sign_hl_group"), "debugBreakpoint");
    harness.respond(mark.token(), &mp_int(77));
    harness.pump();
    assert_eq!(
        harness.ctx().breakpoints.borrow().find("1").map(|b| b.extmark),
        Some(77)
    );

    // the message line is a jump to the breakpoint location
    harness.notify("pdp/jump", &[mp_int(0)]);
    harness.pump();
    let jump = harness.expect("nvim_command");
    assert_eq!(jump.arg(0), format!("edit +4 {}", source.path).as_str());

    harness.gdb_records(&[r#"=breakpoint-deleted,id="1""#]);
    harness.pump();
    assert!(harness.ctx().breakpoints.borrow().is_empty());
    let bufnr = harness.expect("nvim_call_function");
    harness.respond(bufnr.token(), &mp_int(5));
    harness.pump();
    let delete = harness.expect("nvim_buf_del_extmark");
    assert_eq!(delete.int_arg(0), 5);
    assert_eq!(delete.int_arg(1), BREAKPOINT_NS);
    assert_eq!(delete.int_arg(2), 77);
    harness.assert_no_request();
    assert!(harness.coordinator.is_idle());
}

#[test]
#[serial]
fn test_jump_escapes_special_file_names() {
    let source = SourceFile::new("a%b#c|d.c");
    let mut harness = Harness::new();
    harness.initialize();

    harness.gdb_records(&[
        r#"=thread-group-started,id="i1",pid="4242""#,
        created("1", &source.path, 4).as_str(),
    ]);
    harness.pump();
    let bufnr = harness.expect("nvim_call_function");
    let lines = harness.expect("nvim_buf_set_lines");
    harness.expect("nvim_buf_set_extmark");
    harness.expect("nvim_buf_set_extmark");
    harness.expect("nvim_set_option_value");
    harness.respond(bufnr.token(), &mp_int(-1));
    harness.respond(lines.token(), &[MP_NIL]);
    harness.pump();
    harness.assert_no_request();

    harness.notify("pdp/jump", &[mp_int(0)]);
    harness.pump();
    let jump = harness.expect("nvim_command");
    let escaped = source
        .path
        .replace('%', "\\%")
        .replace('#', "\\#")
        .replace('|', "\\|");
    assert!(escaped.ends_with(r"a\%b\#c\|d.c"));
    assert_eq!(jump.arg(0), format!("edit +4 {escaped}").as_str());
}

#[test]
#[serial]
fn test_breakpoint_in_closed_file_gets_no_sign() {
    let source = SourceFile::new("closed.c");
    let mut harness = Harness::new();
    harness.initialize();

    // no inferior yet, so no prompt message either
    harness.gdb_records(&[created("2", &source.path, 2).as_str()]);
    harness.pump();
    let bufnr = harness.expect("nvim_call_function");
    harness.respond(bufnr.token(), &mp_int(-1));
    harness.pump();
    harness.assert_no_request();
    assert_eq!(
        harness.ctx().breakpoints.borrow().find("2").map(|b| b.extmark),
        Some(0)
    );

    // opening the file places the sign
    harness.notify("pdp/buf_changed", &[mp_int(9), mp_str(&source.path)]);
    harness.pump();
    let bufnr = harness.expect("nvim_call_function");
    harness.respond(bufnr.token(), &mp_int(9));
    harness.pump();
    let mark = harness.expect("nvim_buf_set_extmark");
    assert_eq!(mark.int_arg(0), 9);
    assert_eq!(mark.int_arg(2), 1);
    harness.respond(mark.token(), &mp_int(3));
    harness.pump();
    assert_eq!(
        harness.ctx().breakpoints.borrow().find("2").map(|b| b.extmark),
        Some(3)
    );
}

#[test]
#[serial]
fn test_pending_and_watchpoints_are_reported() {
    let mut harness = Harness::new();
    harness.initialize();

    harness.gdb_records(&[
        r#"=breakpoint-created,bkpt={number="3",type="breakpoint",disp="keep",enabled="y",addr="<PENDING>",pending="libfoo.c:10",times="0",original-location="libfoo.c:10"}"#,
        r#"=breakpoint-created,bkpt={number="4",type="hw watchpoint",disp="keep",enabled="y",addr="",exp="counter",what="counter",times="0"}"#,
    ]);
    harness.pump();

    let pending = harness.expect("nvim_buf_set_lines");
    assert_eq!(pending.arg(4).at(0), "Breakpoint 3 (libfoo.c:10) pending");
    let watch = harness.expect("nvim_buf_set_lines");
    assert_eq!(watch.arg(4).at(0), "Watchpoint 4 (counter)");
    harness.assert_no_request();
    assert!(harness.ctx().breakpoints.borrow().is_empty());
}
