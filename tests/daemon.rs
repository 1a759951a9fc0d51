//! End-to-end tests: a live daemon on a loopback listener, driven by the
//! real host client.
//!
//! These cover the concrete protocol scenarios:
//! - keepalive round trip
//! - spawn with output and exit-code propagation
//! - stdin routing into a long-lived child
//! - kill and the signal-derived exit frame
//! - is_running across the process lifetime
//! - bounded file reads and binary installs
//! - session create idempotence over the wire
//!
//! Spawns run with networking enabled so the children execute directly;
//! the sandbox-helper path needs a provisioned guest image.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use vmsandbox::client::{ClientEvent, VmClient};
use vmsandbox::error::SessionError;
use vmsandbox::server::{self, Daemon};
use vmsandbox::session::{AccountProvisioner, SessionRegistry};

/// Provisioner fake: every account operation succeeds without touching the
/// system user database.
#[derive(Debug, Default)]
struct FakeAccounts;

impl AccountProvisioner for FakeAccounts {
    fn ensure_group(&self, _gid: u32, _name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn ensure_user(
        &self,
        _uid: u32,
        _gid: u32,
        _name: &str,
        _home: &Path,
        _shell: &str,
    ) -> Result<(), SessionError> {
        Ok(())
    }

    fn delete_user(&self, _name: &str) -> Result<(), SessionError> {
        Ok(())
    }

    fn recursive_chown(&self, _path: &Path, _uid: u32, _gid: u32) -> Result<(), SessionError> {
        Ok(())
    }
}

struct TestEnv {
    port: u16,
    // Held so the scratch directories outlive the daemon.
    _scratch: tempfile::TempDir,
}

async fn start_daemon() -> TestEnv {
    let scratch = tempfile::tempdir().expect("failed to create scratch dir");
    let bin_dir = scratch.path().join("bin");
    std::fs::create_dir_all(&bin_dir).expect("failed to create bin dir");

    let sessions = SessionRegistry::new(Box::new(FakeAccounts))
        .with_home_base(scratch.path().join("home"));
    let daemon = Daemon::new()
        .with_sessions(sessions)
        .with_bin_dir(&bin_dir);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(server::run(listener, Arc::new(daemon)));

    TestEnv {
        port,
        _scratch: scratch,
    }
}

async fn connect(env: &TestEnv) -> (VmClient, UnboundedReceiver<ClientEvent>) {
    let mut client = VmClient::connect("127.0.0.1", env.port)
        .await
        .expect("failed to connect");
    let events = client.take_events().expect("first event-stream take");
    (client, events)
}

/// Drains events until the exit frame for `id`, collecting stdout/stderr.
async fn wait_for_exit(
    events: &mut UnboundedReceiver<ClientEvent>,
    id: u32,
) -> (String, String, i32, Option<i32>) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Stdout { id: eid, data } if eid == id => stdout.push_str(&data),
            ClientEvent::Stderr { id: eid, data } if eid == id => stderr.push_str(&data),
            ClientEvent::Exit {
                id: eid,
                code,
                signal,
            } if eid == id => return (stdout, stderr, code, signal),
            _ => {}
        }
    }
    panic!("connection closed before exit frame for id {id}");
}

// =============================================================================
// Keepalive
// =============================================================================

#[tokio::test]
async fn test_ping_pong() {
    let env = start_daemon().await;
    let (client, _events) = connect(&env).await;
    client.ping().await.expect("ping should succeed");
}

// =============================================================================
// Spawn lifecycle
// =============================================================================

#[tokio::test]
async fn test_spawn_echo_streams_output() {
    let env = start_daemon().await;
    let (client, mut events) = connect(&env).await;

    let spawned = client
        .spawn_raw("/bin/echo", &[String::from("hi")])
        .await
        .expect("spawn should succeed");
    assert!(spawned.pid > 0);
    assert!(spawned.handle.starts_with("proc-"));

    let (stdout, _stderr, code, signal) = wait_for_exit(&mut events, spawned.id).await;
    assert_eq!(stdout, "hi\n");
    assert_eq!(code, 0);
    assert!(signal.is_none());
}

#[tokio::test]
async fn test_exit_code_is_preserved() {
    let env = start_daemon().await;
    let (client, mut events) = connect(&env).await;

    let spawned = client
        .spawn_raw("/bin/sh", &[String::from("-c"), String::from("exit 7")])
        .await
        .expect("spawn should succeed");

    let (_stdout, _stderr, code, _signal) = wait_for_exit(&mut events, spawned.id).await;
    assert_eq!(code, 7);
}

#[tokio::test]
async fn test_stderr_is_separate() {
    let env = start_daemon().await;
    let (client, mut events) = connect(&env).await;

    let spawned = client
        .spawn_raw(
            "/bin/sh",
            &[String::from("-c"), String::from("echo out; echo err >&2")],
        )
        .await
        .expect("spawn should succeed");

    let (stdout, stderr, code, _signal) = wait_for_exit(&mut events, spawned.id).await;
    assert_eq!(stdout, "out\n");
    assert_eq!(stderr, "err\n");
    assert_eq!(code, 0);
}

#[tokio::test]
async fn test_stdin_reaches_cat() {
    let env = start_daemon().await;
    let (client, mut events) = connect(&env).await;

    let spawned = client
        .spawn_raw("/bin/cat", &[])
        .await
        .expect("spawn should succeed");

    client
        .send_stdin(spawned.id, &spawned.handle, "abc")
        .await
        .expect("stdin should send");

    // cat echoes the bytes back, then dies on SIGTERM.
    let mut echoed = String::new();
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Stdout { id, data } if id == spawned.id => {
                echoed.push_str(&data);
                if echoed == "abc" {
                    client
                        .kill(&spawned.handle, 15)
                        .await
                        .expect("kill should send");
                }
            }
            ClientEvent::Exit { id, .. } if id == spawned.id => break,
            _ => {}
        }
    }
    assert_eq!(echoed, "abc");
}

#[tokio::test]
async fn test_kill_reports_signal_exit() {
    let env = start_daemon().await;
    let (client, mut events) = connect(&env).await;

    let spawned = client
        .spawn_raw("/bin/sleep", &[String::from("60")])
        .await
        .expect("spawn should succeed");

    client
        .kill(&spawned.handle, 9)
        .await
        .expect("kill should send");

    let (_stdout, _stderr, code, signal) = wait_for_exit(&mut events, spawned.id).await;
    assert_eq!(code, -1);
    assert_eq!(signal, Some(9));
}

#[tokio::test]
async fn test_is_running_lifecycle() {
    let env = start_daemon().await;
    let (client, mut events) = connect(&env).await;

    let spawned = client
        .spawn_raw("/bin/sleep", &[String::from("1")])
        .await
        .expect("spawn should succeed");

    let status = client
        .is_running(&spawned.handle)
        .await
        .expect("status request should succeed");
    assert!(status.running);
    assert_eq!(status.pid, Some(spawned.pid));

    let (_stdout, _stderr, code, _signal) = wait_for_exit(&mut events, spawned.id).await;
    assert_eq!(code, 0);

    let status = client
        .is_running(&spawned.handle)
        .await
        .expect("status request should succeed");
    assert!(!status.running);
    assert!(status.pid.is_none());
}

#[tokio::test]
async fn test_spawn_unknown_binary_exits_127() {
    let env = start_daemon().await;
    let (client, mut events) = connect(&env).await;

    let spawned = client
        .spawn_raw("/no/such/binary", &[])
        .await
        .expect("the spawn itself succeeds; exec failure arrives as exit 127");

    let (_stdout, _stderr, code, _signal) = wait_for_exit(&mut events, spawned.id).await;
    assert_eq!(code, 127);
}

// =============================================================================
// Filesystem operations
// =============================================================================

#[tokio::test]
async fn test_read_file_round_trip() {
    let env = start_daemon().await;
    let (client, _events) = connect(&env).await;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("x");
    std::fs::write(&path, [1u8, 2, 3]).expect("write fixture");

    let contents = client
        .read_file(path.to_str().expect("utf8 path"))
        .await
        .expect("read should succeed");
    assert_eq!(contents, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_read_missing_file_is_an_error() {
    let env = start_daemon().await;
    let (client, _events) = connect(&env).await;

    let result = client.read_file("/definitely/not/here").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_install_binary_lands_executable() {
    let env = start_daemon().await;
    let (client, _events) = connect(&env).await;

    client
        .install("hello", b"#!/bin/sh\necho hi\n", true)
        .await
        .expect("install should succeed");

    let installed = env._scratch.path().join("bin").join("hello");
    let metadata = std::fs::metadata(&installed).expect("installed file should exist");
    use std::os::unix::fs::PermissionsExt;
    assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
    assert_eq!(
        std::fs::read(&installed).expect("read back"),
        b"#!/bin/sh\necho hi\n"
    );
}

// =============================================================================
// Sessions over the wire
// =============================================================================

#[tokio::test]
async fn test_session_create_is_idempotent_over_wire() {
    use vmsandbox::protocol::frame::Frame;
    use vmsandbox::protocol::message::{MessageType, SessionCreateRequest, SessionReply};
    use vmsandbox::protocol::ws;
    use tokio::io::BufReader;

    let env = start_daemon().await;

    // Session frames have no client helper; speak the codec directly.
    let stream = tokio::net::TcpStream::connect(("127.0.0.1", env.port))
        .await
        .expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    ws::client_handshake(&mut reader, &mut write_half, "127.0.0.1", env.port)
        .await
        .expect("handshake");

    let request = Frame::json(
        MessageType::SessionCreate,
        &SessionCreateRequest {
            uid: 2001,
            username: None,
        },
    );

    let mut replies = Vec::new();
    for _ in 0..2 {
        ws::write_frame(&mut write_half, &request.encode(), true)
            .await
            .expect("request write");
        let bytes = ws::read_frame(&mut reader)
            .await
            .expect("reply read")
            .expect("reply should not be a close frame");
        let frame = Frame::decode(&bytes).expect("reply should decode");
        assert_eq!(frame.message_type(), Some(MessageType::Ok));
        let reply: SessionReply = serde_json::from_slice(&frame.payload).expect("session payload");
        replies.push(reply);
    }

    assert_eq!(replies[0], replies[1]);
    assert_eq!(replies[0].uid, 2001);
    assert_eq!(replies[0].gid, 2001);
    assert_eq!(replies[0].username, "session2001");

    // The home tree was created under the scratch base.
    let home = Path::new(&replies[0].home_dir);
    assert!(home.ends_with("2001"));
    assert!(home.join("mnt").is_dir());
    assert!(home.join("tmp").is_dir());
}
