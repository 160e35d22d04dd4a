//! Control-plane integration tests: one in-process daemon, real session
//! endpoints, literal wire frames on `daemon.sock`.

mod common;

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use common::{start_endpoint, TestDaemon};
use tether_wire::DaemonRequest;

const S1: &str = "11111111-1111-1111-1111-111111111111";

#[tokio::test]
async fn local_relay_happy_path() {
    let daemon = TestDaemon::start("relay-happy").await;
    let (_agent, endpoint) = start_endpoint(&daemon.dir, S1).await;

    let mut client = daemon.client().await;
    common::wait_for_session(&mut client, S1, true).await;

    // list_sessions shows the one local session.
    let resp = client.request(&DaemonRequest::ListSessions).await.unwrap();
    assert!(resp.success);
    let sessions = resp.data.unwrap()["sessions"].clone();
    let sessions = sessions.as_array().unwrap().clone();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], S1);
    assert_eq!(sessions[0]["isRemote"], false);
    assert!(sessions[0]["name"].as_str().is_some_and(|n| !n.is_empty()));

    // Relay get_message with no messages yet: null.
    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: S1.into(),
            rpc_command: serde_json::json!({"type":"get_message"}),
            request_id: "r1".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert!(resp.success, "relay failed: {:?}", resp.error);
    let data = resp.data.unwrap();
    assert_eq!(data["requestId"], "r1");
    assert_eq!(data["response"]["success"], true);
    assert_eq!(data["response"]["data"]["message"], serde_json::Value::Null);

    endpoint.shutdown().await;
    daemon.kill().await;
}

#[tokio::test]
async fn relay_resolves_alias_afresh() {
    let daemon = TestDaemon::start("relay-alias").await;
    let (agent, endpoint) = start_endpoint(&daemon.dir, S1).await;
    agent.name.lock().unwrap().replace("amber-fox".into());

    let mut client = daemon.client().await;
    common::wait_for_session(&mut client, S1, true).await;

    // Wait for the endpoint's alias sync to land.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while daemon.dir.read_alias("amber-fox").is_none() {
        assert!(tokio::time::Instant::now() < deadline, "alias never appeared");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: "amber-fox".into(),
            rpc_command: serde_json::json!({"type":"get_message"}),
            request_id: "r2".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.data.unwrap()["response"]["success"], true);

    endpoint.shutdown().await;
    daemon.kill().await;
}

#[tokio::test]
async fn relay_unknown_session_is_not_found() {
    let daemon = TestDaemon::start("relay-missing").await;
    let mut client = daemon.client().await;

    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: "no-such-session".into(),
            rpc_command: serde_json::json!({"type":"get_message"}),
            request_id: "r3".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.error.as_deref(), Some("Session not found"));

    daemon.kill().await;
}

#[tokio::test]
async fn relay_rejects_unsafe_target_ids() {
    let daemon = TestDaemon::start("relay-unsafe").await;
    let mut client = daemon.client().await;

    for target in ["../daemon", "a/b", "a\\b"] {
        let resp = client
            .request(&DaemonRequest::Relay {
                target_session_id: target.into(),
                rpc_command: serde_json::json!({"type":"get_message"}),
                request_id: "r4".into(),
                fire_and_forget: false,
            })
            .await
            .unwrap();
        assert!(!resp.success, "unsafe id {target} was accepted");
    }

    daemon.kill().await;
}

#[tokio::test]
async fn rate_limit_admits_thirty_then_fails() {
    let daemon = TestDaemon::start("ratelimit").await;
    let (_agent, endpoint) = start_endpoint(&daemon.dir, S1).await;
    let mut client = daemon.client().await;
    common::wait_for_session(&mut client, S1, true).await;

    for i in 0..30 {
        let resp = client
            .request(&DaemonRequest::Relay {
                target_session_id: S1.into(),
                rpc_command: serde_json::json!({"type":"get_message"}),
                request_id: format!("r{i}"),
                fire_and_forget: false,
            })
            .await
            .unwrap();
        assert!(resp.success, "relay {i} unexpectedly failed: {:?}", resp.error);
    }

    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: S1.into(),
            rpc_command: serde_json::json!({"type":"get_message"}),
            request_id: "r30".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.error.as_deref(), Some("Rate limit exceeded"));

    // The rejection left an audit line.
    let audit = std::fs::read_to_string(daemon.dir.audit_log()).unwrap();
    let last: serde_json::Value = serde_json::from_str(audit.lines().last().unwrap()).unwrap();
    assert_eq!(last["result"], "fail");
    assert_eq!(last["error"], "Rate limit exceeded");
    assert_eq!(last["peer"], "local");
    assert_eq!(last["data"]["targetSessionId"], S1);

    endpoint.shutdown().await;
    daemon.kill().await;
}

#[tokio::test]
async fn oversized_frame_gets_one_error_then_close() {
    let daemon = TestDaemon::start("oversize").await;

    let stream = UnixStream::connect(daemon.dir.daemon_sock()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut frame = vec![b'x'; 9000];
    frame.push(b'\n');
    write.write_all(&frame).await.unwrap();

    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(value["type"], "error");
    assert_eq!(value["error"], "Message size exceeds 8192 bytes");

    line.clear();
    let n = tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "connection should be closed");

    daemon.kill().await;
}

#[tokio::test]
async fn parse_error_keeps_control_connection_open() {
    let daemon = TestDaemon::start("parse").await;

    let stream = UnixStream::connect(daemon.dir.daemon_sock()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    write.write_all(b"not json\n").await.unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(value["success"], false);

    // Unknown tags are rejected, not routed.
    write
        .write_all(b"{\"type\":\"bogus_command\"}\n")
        .await
        .unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(value["success"], false);

    // Still serving.
    write.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
    line.clear();
    reader.read_line(&mut line).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(value["success"], true);
    assert_eq!(value["command"], "status");

    daemon.kill().await;
}

#[tokio::test]
async fn status_reports_counts() {
    let daemon = TestDaemon::start("status").await;
    let (_agent, endpoint) = start_endpoint(&daemon.dir, S1).await;
    let mut client = daemon.client().await;
    common::wait_for_session(&mut client, S1, true).await;

    let resp = client.request(&DaemonRequest::Status).await.unwrap();
    assert!(resp.success);
    let data = resp.data.unwrap();
    assert_eq!(data["port"].as_u64().unwrap(), daemon.port as u64);
    assert_eq!(data["localSessions"], 1);
    assert_eq!(data["connectedPeers"], 0);
    assert!(data["pid"].as_u64().is_some());

    endpoint.shutdown().await;
    daemon.kill().await;
}

#[tokio::test]
async fn start_daemon_is_acknowledged() {
    let daemon = TestDaemon::start("startdaemon").await;
    let mut client = daemon.client().await;
    let resp = client.request(&DaemonRequest::StartDaemon).await.unwrap();
    assert!(resp.success);
    assert_eq!(resp.command, "start-daemon");
    daemon.kill().await;
}

#[tokio::test]
async fn fire_and_forget_acks_before_delivery() {
    let daemon = TestDaemon::start("faf").await;
    let (agent, endpoint) = start_endpoint(&daemon.dir, S1).await;
    let mut client = daemon.client().await;
    common::wait_for_session(&mut client, S1, true).await;

    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: S1.into(),
            rpc_command: serde_json::json!({"type":"send","message":"ping"}),
            request_id: "r5".into(),
            fire_and_forget: true,
        })
        .await
        .unwrap();
    assert!(resp.success);
    assert_eq!(resp.data.unwrap()["requestId"], "r5");

    // Delivery still lands, just in the background.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !agent.delivered.lock().await.is_empty() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "message never delivered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    endpoint.shutdown().await;
    daemon.kill().await;
}

#[tokio::test]
async fn relay_times_out_on_silent_endpoint() {
    let daemon = TestDaemon::start("silent").await;

    // A bare listener that accepts and never answers, masquerading as a
    // session endpoint.
    let silent_id = "silent-session";
    let listener = tokio::net::UnixListener::bind(daemon.dir.endpoint_sock(silent_id)).unwrap();
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let mut client = daemon.client().await;
    common::wait_for_session(&mut client, silent_id, true).await;

    // Unknown command kind → 10 s deadline.
    let started = tokio::time::Instant::now();
    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: silent_id.into(),
            rpc_command: serde_json::json!({"type":"poke"}),
            request_id: "r6".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(resp.error.as_deref(), Some("Relay timeout after 10000ms"));
    assert!(started.elapsed() >= Duration::from_secs(10));

    // The daemon is still healthy afterwards.
    let resp = client.request(&DaemonRequest::Status).await.unwrap();
    assert!(resp.success);

    hold.abort();
    daemon.kill().await;
}

#[tokio::test]
async fn kill_removes_singletons() {
    let daemon = TestDaemon::start("kill").await;
    let sock = daemon.dir.daemon_sock();
    let pid = daemon.dir.daemon_pid();
    assert!(sock.exists());
    assert!(pid.exists());

    let root = daemon.dir.root().to_owned();
    daemon.kill().await;
    // kill() removed the whole scratch tree; the singletons must not have
    // outlived the daemon regardless.
    assert!(!sock.exists());
    assert!(!pid.exists());
    let _ = std::fs::remove_dir_all(root);
}
