//! Integration tests for relay-mux.
//!
//! These tests spawn the real daemon in a temp data directory, send it
//! command-socket requests, and connect to it as viewers over the display
//! socket.

#![allow(dead_code)]

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;

// ── Command socket tests ────────────────────────────────────────────

#[test]
fn list_with_no_sessions() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let reply = handle.command(&["list"]).expect("list failed");
    assert_eq!(reply.stdout, "(no sessions)\n");
    assert_eq!(reply.exit, Some(0));
}

#[test]
fn unknown_command_fails_with_message() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let reply = handle
        .command(&["no-such-verb-or-program"])
        .expect("request failed");
    assert_eq!(reply.exit, Some(1));
    assert!(
        reply.stderr.contains("unknown command"),
        "stderr: {:?}",
        reply.stderr
    );
}

#[test]
fn new_prints_url_and_list_shows_session() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let reply = handle.command(&["new", "/bin/cat"]).expect("new failed");
    assert_eq!(reply.exit, Some(0));
    let (session, window) = parse_url(&reply.stdout).expect("no viewer url");
    assert_ne!(session, window);

    let list = handle.command(&["list"]).expect("list failed");
    assert!(
        list.stdout.contains(&format!("session#: {session}")),
        "list: {:?}",
        list.stdout
    );
}

#[test]
fn client_binary_passes_descriptors() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    handle.command(&["new", "/bin/cat"]).expect("new failed");
    let output = handle.client(&["list"]).expect("client failed");
    assert!(output.status.success(), "status: {:?}", output.status);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("session#: 1"), "stdout: {:?}", stdout);
}

#[test]
fn kill_server_stops_the_daemon() {
    let mut handle = spawn_daemon().expect("failed to spawn daemon");
    handle.command(&["new", "/bin/cat"]).expect("new failed");
    let reply = handle.command(&["kill-server"]).expect("kill-server failed");
    assert_eq!(reply.exit, Some(0));
    let exited = wait_until(Duration::from_secs(10), || {
        matches!(handle.child.try_wait(), Ok(Some(_)))
    });
    assert!(exited, "daemon still running after kill-server");
    assert!(socket_gone(&handle.command_socket));
}

// ── Viewer tests ────────────────────────────────────────────────────

#[test]
fn viewer_sees_output_and_end_of_session() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let reply = handle
        .command(&["new", "/bin/sh", "-c", "echo hi-there; sleep 0.5"])
        .expect("new failed");
    let (session, window) = parse_url(&reply.stdout).expect("no viewer url");

    let mut viewer = handle
        .viewer(json!({"session-number": session, "window": window}))
        .expect("viewer connect failed");
    viewer.send_event("VERSION", "test 1").expect("send VERSION");

    assert!(
        viewer.wait_for(b"hi-there", Duration::from_secs(5)),
        "output never arrived: {:?}",
        String::from_utf8_lossy(&viewer.received)
    );
    assert!(
        viewer.wait_for(SESSION_ENDED, Duration::from_secs(5)),
        "no end-of-session notice"
    );
}

#[test]
fn two_viewers_share_a_session() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let reply = handle.command(&["new", "/bin/cat"]).expect("new failed");
    let (session, window) = parse_url(&reply.stdout).expect("no viewer url");

    let mut a = handle
        .viewer(json!({"session-number": session, "window": window}))
        .expect("viewer a");
    a.send_event("VERSION", "test 1").expect("send VERSION");
    let mut b = handle
        .viewer(json!({"session-number": session}))
        .expect("viewer b");
    b.send_event("VERSION", "test 1").expect("send VERSION");
    a.collect(Duration::from_millis(300));

    a.send_input(b"shared-line\n").expect("send input");
    assert!(a.wait_for(b"shared-line", Duration::from_secs(5)), "viewer a");
    assert!(b.wait_for(b"shared-line", Duration::from_secs(5)), "viewer b");
}

#[test]
fn unacknowledged_output_pauses_the_session() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let reply = handle.command(&["new", "yes"]).expect("new failed");
    let (session, window) = parse_url(&reply.stdout).expect("no viewer url");

    let mut viewer = handle
        .viewer(json!({"session-number": session, "window": window}))
        .expect("viewer connect failed");
    viewer.send_event("VERSION", "test 1").expect("send VERSION");

    viewer.collect(Duration::from_secs(1));
    let first = viewer.output().len();
    assert!(first > 0, "no output at all");
    assert!(first < 64 * 1024 + 8000, "flow control ignored: {first} bytes");

    viewer.collect(Duration::from_millis(500));
    assert_eq!(viewer.output().len(), first, "output kept flowing while paused");

    viewer
        .send_event("RECEIVED", &first.to_string())
        .expect("send RECEIVED");
    viewer.collect(Duration::from_secs(1));
    assert!(viewer.output().len() > first, "acknowledgement did not resume output");
}

#[test]
fn viewer_without_connect_gets_a_default_shell() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let stream = std::os::unix::net::UnixStream::connect(&handle.display_socket).expect("connect");
    let mut viewer = Viewer::new(stream);
    viewer.send_event("VERSION", "test 1").expect("send VERSION");
    viewer
        .send_input(b"echo marker-$((40+2))\n")
        .expect("send input");
    assert!(
        viewer.wait_for(b"marker-42", Duration::from_secs(10)),
        "shell output never arrived: {:?}",
        String::from_utf8_lossy(&viewer.output())
    );
}

#[test]
fn out_of_range_window_hint_is_ignored() {
    let handle = spawn_daemon().expect("failed to spawn daemon");
    let mut viewer = handle
        .viewer(json!({"window": 4_000_000_000u32}))
        .expect("viewer connect failed");
    viewer.send_event("VERSION", "test 1").expect("send VERSION");
    viewer
        .send_input(b"echo alive-$((6*7))\n")
        .expect("send input");
    assert!(
        viewer.wait_for(b"alive-42", Duration::from_secs(10)),
        "shell output never arrived: {:?}",
        String::from_utf8_lossy(&viewer.output())
    );
    let list = handle.command(&["list"]).expect("daemon stopped answering");
    assert!(list.stdout.contains("#windows: 1"), "list: {:?}", list.stdout);
}
