//! Federation integration tests: two in-process daemons on localhost,
//! real TCP links, real session endpoints behind them.

mod common;

use std::time::Duration;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use common::{start_endpoint, TestDaemon};
use tether_wire::{DaemonRequest, LineCodec, PeerMessage};

const S2: &str = "22222222-2222-2222-2222-222222222222";

/// Connect daemon `a` to daemon `b` and wait for the link to open.
async fn federate(a: &TestDaemon, b: &TestDaemon) {
    let mut client = a.client().await;
    let resp = client
        .request(&DaemonRequest::AddPeer {
            host: "127.0.0.1".into(),
            port: Some(b.port),
        })
        .await
        .unwrap();
    assert!(resp.success, "add_peer failed: {:?}", resp.error);
}

#[tokio::test]
async fn session_delta_reaches_remote_subscriber() {
    let a = TestDaemon::start("fed-a").await;
    let b = TestDaemon::start("fed-b").await;

    // Subscribe on A before anything happens.
    let mut subscriber = a.client().await;
    let resp = subscriber.request(&DaemonRequest::Subscribe).await.unwrap();
    assert!(resp.success);

    federate(&a, &b).await;
    common::wait_for_event(&mut subscriber, "peer_connected", Duration::from_secs(5)).await;

    // A session appearing on B shows up as a remote delta on A.
    let (_agent, endpoint) = start_endpoint(&b.dir, S2).await;
    let event =
        common::wait_for_event(&mut subscriber, "session_added", Duration::from_secs(10)).await;
    assert_eq!(event["data"]["sessionId"], S2);
    assert_eq!(event["data"]["isRemote"], true);
    assert_eq!(event["data"]["host"], "127.0.0.1");
    assert!(event["data"]["name"].as_str().is_some_and(|n| !n.is_empty()));

    // And on A's list_sessions, tagged remote.
    let mut client = a.client().await;
    common::wait_for_session(&mut client, S2, true).await;

    // Stopping it produces exactly one matching removal.
    endpoint.shutdown().await;
    let event =
        common::wait_for_event(&mut subscriber, "session_removed", Duration::from_secs(10)).await;
    assert_eq!(event["data"]["sessionId"], S2);
    common::wait_for_session(&mut client, S2, false).await;

    b.kill().await;
    a.kill().await;
}

#[tokio::test]
async fn cross_host_relay_round_trips() {
    let a = TestDaemon::start("xr-a").await;
    let b = TestDaemon::start("xr-b").await;
    federate(&a, &b).await;

    let (agent, endpoint) = start_endpoint(&b.dir, S2).await;
    *agent.last_message.lock().await = Some("remote says hi".into());

    let mut client = a.client().await;
    common::wait_for_session(&mut client, S2, true).await;

    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: S2.into(),
            rpc_command: serde_json::json!({"type":"get_message"}),
            request_id: "r7".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert!(resp.success, "cross-host relay failed: {:?}", resp.error);
    let data = resp.data.unwrap();
    assert_eq!(data["requestId"], "r7");
    assert_eq!(data["response"]["success"], true);
    assert_eq!(data["response"]["data"]["message"], "remote says hi");

    endpoint.shutdown().await;
    b.kill().await;
    a.kill().await;
}

#[tokio::test]
async fn lost_peer_retries_once_then_gives_up() {
    let a = TestDaemon::start("loss-a").await;
    let b = TestDaemon::start("loss-b").await;

    let mut subscriber = a.client().await;
    subscriber.request(&DaemonRequest::Subscribe).await.unwrap();

    federate(&a, &b).await;
    common::wait_for_event(&mut subscriber, "peer_connected", Duration::from_secs(5)).await;

    let (_agent, _endpoint) = start_endpoint(&b.dir, S2).await;
    common::wait_for_event(&mut subscriber, "session_added", Duration::from_secs(10)).await;

    // Take B down; its port stops answering, so A's retry cannot land.
    b.kill().await;

    common::wait_for_event(&mut subscriber, "peer_disconnected", Duration::from_secs(15)).await;
    let removal =
        common::wait_for_event(&mut subscriber, "session_removed", Duration::from_secs(5)).await;
    assert_eq!(removal["data"]["sessionId"], S2);

    // While the peer is down, its last-known session is unreachable, not
    // unknown.
    let mut client = a.client().await;
    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: S2.into(),
            rpc_command: serde_json::json!({"type":"get_message"}),
            request_id: "r8".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert!(!resp.success);
    assert_eq!(
        resp.error.as_deref(),
        Some("session is on a disconnected peer")
    );

    // One reconnect attempt (~3 s) fails, then the budget is gone.
    common::wait_for_event(&mut subscriber, "peer_gave_up", Duration::from_secs(20)).await;
    let resp = client.request(&DaemonRequest::Status).await.unwrap();
    let peers = resp.data.unwrap()["peers"].clone();
    let peer = peers
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["host"] == "127.0.0.1")
        .cloned()
        .unwrap();
    assert_eq!(peer["transport"], "closed");
    assert_eq!(peer["gaveUp"], true);

    a.kill().await;
}

#[tokio::test]
async fn remove_peer_drops_sessions_and_config() {
    let a = TestDaemon::start("rm-a").await;
    let b = TestDaemon::start("rm-b").await;
    federate(&a, &b).await;

    // add_peer persisted the address.
    let config = std::fs::read_to_string(a.dir.config_file()).unwrap();
    let config: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert_eq!(config["peers"][0], format!("127.0.0.1:{}", b.port));

    let (_agent, endpoint) = start_endpoint(&b.dir, S2).await;
    let mut client = a.client().await;
    common::wait_for_session(&mut client, S2, true).await;

    let resp = client
        .request(&DaemonRequest::RemovePeer {
            host: "127.0.0.1".into(),
        })
        .await
        .unwrap();
    assert!(resp.success);

    common::wait_for_session(&mut client, S2, false).await;
    let config = std::fs::read_to_string(a.dir.config_file()).unwrap();
    let config: serde_json::Value = serde_json::from_str(&config).unwrap();
    assert!(config["peers"].as_array().unwrap().is_empty());

    // The entry is gone, so the target is now unknown rather than
    // unreachable.
    let resp = client
        .request(&DaemonRequest::Relay {
            target_session_id: S2.into(),
            rpc_command: serde_json::json!({"type":"get_message"}),
            request_id: "r9".into(),
            fire_and_forget: false,
        })
        .await
        .unwrap();
    assert_eq!(resp.error.as_deref(), Some("Session not found"));

    endpoint.shutdown().await;
    b.kill().await;
    a.kill().await;
}

#[tokio::test]
async fn add_peer_to_dead_port_fails() {
    let a = TestDaemon::start("dead-a").await;
    let dead_port = common::pick_port();

    let mut client = a.client().await;
    let resp = client
        .request(&DaemonRequest::AddPeer {
            host: "127.0.0.1".into(),
            port: Some(dead_port),
        })
        .await
        .unwrap();
    assert!(!resp.success);

    a.kill().await;
}

#[tokio::test]
async fn duplicate_inbound_hello_replaces_older_link() {
    let a = TestDaemon::start("dup-a").await;

    // First raw "daemon" introduces itself as ghost-host.
    let hello = PeerMessage::Hello {
        host: "ghost-host".into(),
        port: 9,
        sessions: vec![],
    };
    let stream = TcpStream::connect(("127.0.0.1", a.port)).await.unwrap();
    let mut first = Framed::new(stream, LineCodec);
    first
        .send(serde_json::to_string(&hello).unwrap())
        .await
        .unwrap();
    // Read A's hello off the first link.
    let line = tokio::time::timeout(Duration::from_secs(5), first.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        serde_json::from_str::<PeerMessage>(&line).unwrap(),
        PeerMessage::Hello { .. }
    ));

    // Second link for the same host: the older one must die.
    let stream = TcpStream::connect(("127.0.0.1", a.port)).await.unwrap();
    let mut second = Framed::new(stream, LineCodec);
    second
        .send(serde_json::to_string(&hello).unwrap())
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        serde_json::from_str::<PeerMessage>(&line).unwrap(),
        PeerMessage::Hello { .. }
    ));

    // The first connection is closed by A.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout(Duration::from_secs(10), first.next()).await {
            Ok(None) => break,
            Ok(Some(Ok(_))) => {
                // Deltas or heartbeats may drain first.
                assert!(tokio::time::Instant::now() < deadline, "older link never closed");
            }
            Ok(Some(Err(_))) => break,
            Err(_) => panic!("older link never closed"),
        }
    }

    // Exactly one peer entry for the host survives, and it is open.
    let mut client = a.client().await;
    let resp = client.request(&DaemonRequest::Status).await.unwrap();
    let data = resp.data.unwrap();
    let ghosts: Vec<_> = data["peers"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|p| p["host"] == "ghost-host")
        .collect();
    assert_eq!(ghosts.len(), 1);
    assert_eq!(ghosts[0]["transport"], "open");

    a.kill().await;
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let a = TestDaemon::start("nohello").await;

    let stream = TcpStream::connect(("127.0.0.1", a.port)).await.unwrap();
    let mut framed = Framed::new(stream, LineCodec);
    // A's own hello arrives first.
    let _ = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap();
    framed
        .send(serde_json::to_string(&PeerMessage::Heartbeat).unwrap())
        .await
        .unwrap();

    // The daemon drops the connection without installing a peer.
    let closed = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap();
    assert!(matches!(closed, None | Some(Err(_))));

    let mut client = a.client().await;
    let resp = client.request(&DaemonRequest::Status).await.unwrap();
    assert_eq!(resp.data.unwrap()["connectedPeers"], 0);

    a.kill().await;
}

#[tokio::test]
async fn peer_rpc_is_rate_limited_per_peer() {
    let a = TestDaemon::start("peer-rl").await;

    // Handshake as a raw peer daemon.
    let stream = TcpStream::connect(("127.0.0.1", a.port)).await.unwrap();
    let mut framed = Framed::new(stream, LineCodec);
    framed
        .send(
            serde_json::to_string(&PeerMessage::Hello {
                host: "limited-host".into(),
                port: 9,
                sessions: vec![],
            })
            .unwrap(),
        )
        .await
        .unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .unwrap();

    // Fire 31 RPCs at a nonexistent session; every one draws a response,
    // and the 31st is the rate-limit rejection.
    for i in 0..31 {
        framed
            .send(
                serde_json::to_string(&PeerMessage::Rpc {
                    target_session_id: "missing".into(),
                    request_id: format!("w{i}"),
                    command: serde_json::json!({"type":"get_message"}),
                })
                .unwrap(),
            )
            .await
            .unwrap();
    }

    let mut failures = Vec::new();
    let mut seen = 0;
    while seen < 31 {
        let line = tokio::time::timeout(Duration::from_secs(10), framed.next())
            .await
            .expect("timed out reading rpc responses")
            .unwrap()
            .unwrap();
        match serde_json::from_str::<PeerMessage>(&line).unwrap() {
            PeerMessage::RpcResponse { response, .. } => {
                seen += 1;
                failures.push(response["error"].as_str().unwrap_or("").to_owned());
            }
            _ => continue,
        }
    }
    assert_eq!(
        failures.iter().filter(|e| e == &"Rate limit exceeded").count(),
        1
    );
    assert_eq!(
        failures.iter().filter(|e| e == &"Session not found").count(),
        30
    );

    a.kill().await;
}
