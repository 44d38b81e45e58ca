mod common;

mod breakpoints;
mod notifications;
mod records;

use crate::common::{Harness, PROMPT_BUF};
use pdp::coordinator::session::{BufferSlot, Namespace};
use serial_test::serial;

#[test]
#[serial]
fn test_initialize_editor_state() {
    let mut harness = Harness::new();
    harness.initialize();

    let session = harness.ctx().session.borrow();
    assert_eq!(session.buffer(BufferSlot::Prompt), PROMPT_BUF);
    assert_eq!(session.buffer(BufferSlot::Capture), 20);
    assert_eq!(session.buffer(BufferSlot::Asm), 21);
    assert_eq!(session.buffer(BufferSlot::Io), 22);
    assert_eq!(session.namespace(Namespace::Highlight), 10);
    assert_eq!(session.namespace(Namespace::Breakpoint), 16);
    assert_eq!(session.num_lines_written, 0);
    assert!(session.opened_buffers.is_empty());
    drop(session);

    assert!(harness.coordinator.is_idle());
    assert!(harness.coordinator.is_running());
}

#[test]
#[serial]
fn test_handlers_stay_suspended_without_responses() {
    let mut harness = Harness::new();
    // namespaces and buffer listing
    assert_eq!(harness.ctx().dispatcher.len(), 2);
    assert!(!harness.coordinator.is_idle());

    let first = harness.expect("nvim_create_namespace");
    harness.respond(first.token(), &common::mp_int(10));
    harness.pump();
    assert_eq!(harness.ctx().dispatcher.len(), 2);
    assert_eq!(
        harness.ctx().session.borrow().namespace(Namespace::Highlight),
        10
    );

    harness.coordinator.shutdown();
    assert!(harness.ctx().dispatcher.is_empty());
}

#[test]
#[serial]
fn test_peer_hangup_stops_coordinator() {
    let mut harness = Harness::new();
    harness.close_gdb();
    harness.pump();
    assert!(!harness.coordinator.is_running());

    let mut harness = Harness::new();
    harness.close_editor();
    harness.pump();
    assert!(!harness.coordinator.is_running());
}
