//! Integration tests for the session handshake between client and server
//! managers.

mod common;

use std::time::Duration;

use common::{
    MemoryDialer, PipeDialer, capture, expect_event, listen, next_args, next_event,
    next_event_within,
};
use peerbridge::prelude::*;
use serde_json::json;
use tokio::time::Instant;

fn pair(server_config: ManagerConfig, client_config: ManagerConfig) -> (
    ServerManager,
    ClientManager<MemoryDialer>,
    MemoryDialer,
) {
    let server = ServerManager::new(server_config);
    let dialer = MemoryDialer::new(server.clone());
    let client = ClientManager::with_dialer("memory", 0, client_config, dialer.clone());
    (server, client, dialer)
}

#[tokio::test]
async fn test_session_established_on_both_sides() {
    let (server, client, _dialer) = pair(
        ManagerConfig::with_secret("open sesame"),
        ManagerConfig::with_secret("open sesame"),
    );
    let mut server_events = capture(&server);
    let mut client_events = capture(&client);

    client.start();

    let on_server = expect_event(&mut server_events, LifecycleKind::SessionStarted).await;
    let on_client = expect_event(&mut client_events, LifecycleKind::SessionStarted).await;

    let server_session = on_server.endpoint().session().unwrap();
    let client_session = on_client.endpoint().session().unwrap();
    assert_eq!(server_session.state(), SessionState::Established);
    assert_eq!(client_session.state(), SessionState::Established);
    assert_eq!(server_session.role(), Some(Role::Server));
    assert_eq!(client_session.role(), Some(Role::Client));

    let id = server_session.session_id().unwrap();
    assert_eq!(id.len(), 32);
    assert_eq!(client_session.session_id(), Some(id));

    assert!(on_client.endpoint().has_protocol("KeepAliveProtocol"));
    assert!(on_client.endpoint().has_protocol("EventProtocol"));
    assert_eq!(server.session_count(), 1);

    client.shutdown();
    client.join().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_wrong_secret_is_rejected_and_closes_client() {
    let (server, client, dialer) = pair(
        ManagerConfig::with_secret("right"),
        ManagerConfig::with_secret("wrong"),
    );
    let mut server_events = capture(&server);
    let mut client_events = capture(&client);

    client.start();

    let rejected = expect_event(&mut client_events, LifecycleKind::SessionError).await;
    assert!(rejected.reason().unwrap().contains("rejected"));
    assert!(rejected.endpoint().is_closed());
    expect_event(&mut server_events, LifecycleKind::SessionError).await;

    // A rejection is final: no reconnect, no session-started.
    client.join().await.unwrap();
    assert_eq!(dialer.dials(), 1);
    assert!(client_events.try_recv().is_err());
    assert_eq!(server.session_count(), 0);
    server.shutdown();
}

#[tokio::test]
async fn test_rejected_client_closes_without_keep_alive() {
    let (dialer, mut peers) = PipeDialer::new();
    let client = ClientManager::with_dialer("memory", 0, ManagerConfig::with_secret("wrong"), dialer);
    let mut client_events = capture(&client);
    client.start();
    let mut peer = peers.recv().await.unwrap();
    assert_eq!(peer.recv_json().await.unwrap()["payload"], "SessionStart");

    peer.send_json(json!({
        "protocol": "SessionProtocol",
        "type": "reply",
        "payload": "SessionStartAck",
        "accepted": false,
        "reason": "bad secret",
    }))
    .await;

    let rejected = expect_event(&mut client_events, LifecycleKind::SessionError).await;
    assert!(rejected.reason().unwrap().contains("bad secret"));
    // The stream ends with nothing further on the wire.
    assert!(peer.recv_json().await.is_none());
    client.join().await.unwrap();
    assert!(client_events.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_secret_is_rejected_by_protected_server() {
    let (server, client, _dialer) = pair(
        ManagerConfig::with_secret("right"),
        ManagerConfig::default(),
    );
    let mut client_events = capture(&client);

    client.start();

    expect_event(&mut client_events, LifecycleKind::SessionError).await;
    client.join().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_open_server_accepts_any_secret() {
    let (server, client, _dialer) = pair(
        ManagerConfig::default(),
        ManagerConfig::with_secret("whatever"),
    );
    let mut client_events = capture(&client);

    client.start();

    expect_event(&mut client_events, LifecycleKind::SessionStarted).await;
    client.shutdown();
    client.join().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_client_stop_session_stops_both_sides() {
    let (server, client, _dialer) = pair(ManagerConfig::default(), ManagerConfig::default());
    let mut server_events = capture(&server);
    let mut client_events = capture(&client);
    client.start();
    expect_event(&mut server_events, LifecycleKind::SessionStarted).await;
    expect_event(&mut client_events, LifecycleKind::SessionStarted).await;

    client.stop_session().unwrap();

    expect_event(&mut client_events, LifecycleKind::SessionStopped).await;
    expect_event(&mut server_events, LifecycleKind::SessionStopped).await;
    client.join().await.unwrap();
    assert_eq!(server.session_count(), 0);
    server.shutdown();
}

#[tokio::test]
async fn test_server_stop_session_stops_both_sides() {
    let (server, client, dialer) = pair(ManagerConfig::default(), ManagerConfig::default());
    let mut server_events = capture(&server);
    let mut client_events = capture(&client);
    client.start();
    let started = expect_event(&mut server_events, LifecycleKind::SessionStarted).await;
    expect_event(&mut client_events, LifecycleKind::SessionStarted).await;

    started.endpoint().stop_session().unwrap();

    expect_event(&mut server_events, LifecycleKind::SessionStopped).await;
    expect_event(&mut client_events, LifecycleKind::SessionStopped).await;
    client.join().await.unwrap();
    assert_eq!(dialer.dials(), 1);
    server.shutdown();
}

#[tokio::test]
async fn test_stop_session_without_connection_fails() {
    let client = ClientManager::with_dialer(
        "memory",
        0,
        ManagerConfig::default(),
        common::RefusingDialer::default(),
    );
    assert!(matches!(
        client.stop_session(),
        Err(PeerbridgeError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_abrupt_disconnect_reconnects_after_backoff() {
    let (server, client, dialer) = pair(ManagerConfig::default(), ManagerConfig::default());
    let mut server_events = capture(&server);
    let mut client_events = capture(&client);
    client.start();
    expect_event(&mut server_events, LifecycleKind::SessionStarted).await;
    let first = expect_event(&mut client_events, LifecycleKind::SessionStarted).await;

    dialer.trip();
    // Wake the tripped reader.
    assert_eq!(server.broadcast("PING", ["1"]), 1);

    let error = expect_event(&mut client_events, LifecycleKind::SessionError).await;
    let dropped = Instant::now();
    assert_eq!(error.endpoint(), first.endpoint());
    assert_eq!(error.reason(), Some("disconnected abruptly"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(dialer.dials(), 1);
    assert_eq!(client.retry_count(), 1);

    let second = next_event_within(&mut client_events, Duration::from_secs(60)).await;
    assert_eq!(second.kind(), LifecycleKind::SessionStarted);
    assert_eq!(dropped.elapsed(), ReconnectPolicy::DEFAULT_BACKOFF);
    assert_ne!(second.endpoint(), first.endpoint());
    assert_eq!(dialer.dials(), 2);
    assert_eq!(client.retry_count(), 0);

    client.shutdown();
    client.join().await.unwrap();
    server.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_serve_racing_shutdown_never_leaves_open_endpoint() {
    for _ in 0..200 {
        let server = ServerManager::new(ManagerConfig::default());
        let (near, _far) = Connection::in_memory_pair();

        let stopper = {
            let server = server.clone();
            tokio::spawn(async move { server.shutdown() })
        };
        let served = server.serve_connection(near);
        stopper.await.unwrap();

        match served {
            Ok(endpoint) => assert!(endpoint.is_closed()),
            Err(e) => assert!(matches!(e, PeerbridgeError::Shutdown)),
        }
        assert_eq!(server.endpoint_count(), 0);
    }
}

// =========================================================================
// Events across a session
// =========================================================================

#[tokio::test]
async fn test_client_event_reaches_server_subscriber() {
    let (server, client, _dialer) = pair(ManagerConfig::default(), ManagerConfig::default());
    let (tx, mut shares) = tokio::sync::mpsc::unbounded_channel();
    server.on(LifecycleKind::SessionStarted, move |event| {
        let tx = tx.clone();
        event.endpoint().on("SHARE_BOARD", move |args: &[String]| {
            let _ = tx.send(args.to_vec());
        });
    });
    client.on(LifecycleKind::SessionStarted, |event| {
        event
            .endpoint()
            .emit("SHARE_BOARD", ["localhost:3200:board1"])
            .unwrap();
    });

    client.start();

    assert_eq!(next_args(&mut shares).await, vec!["localhost:3200:board1"]);
    client.shutdown();
    client.join().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_broadcast_reaches_every_established_client() {
    let server = ServerManager::new(ManagerConfig::default());
    let mut server_events = capture(&server);
    let mut inboxes = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..2 {
        let client = ClientManager::with_dialer(
            "memory",
            0,
            ManagerConfig::default(),
            MemoryDialer::new(server.clone()),
        );
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        client.on(LifecycleKind::SessionStarted, move |event| {
            let tx = tx.clone();
            event.endpoint().on("SHARING_BOARD", move |args: &[String]| {
                let _ = tx.send(args.to_vec());
            });
        });
        client.start();
        inboxes.push(rx);
        clients.push(client);
    }
    expect_event(&mut server_events, LifecycleKind::SessionStarted).await;
    expect_event(&mut server_events, LifecycleKind::SessionStarted).await;

    assert_eq!(server.established_endpoints().len(), 2);
    assert_eq!(server.broadcast("SHARING_BOARD", ["h:1:b"]), 2);

    for inbox in &mut inboxes {
        assert_eq!(next_args(inbox).await, vec!["h:1:b"]);
    }
    server.shutdown();
    for client in &clients {
        client.join().await.unwrap();
    }
}

// =========================================================================
// Raw wire
// =========================================================================

#[tokio::test]
async fn test_server_acks_session_start_on_the_wire() {
    let server = ServerManager::new(ManagerConfig::with_secret("s3cret"));
    let (near, far) = Connection::in_memory_pair();
    server.serve_connection(near).unwrap();
    let mut peer = common::RawPeer::new(far);

    let ack = peer.open_session(Some("s3cret")).await;

    assert_eq!(ack["protocol"], "SessionProtocol");
    assert_eq!(ack["type"], "reply");
    assert_eq!(ack["payload"], "SessionStartAck");
    assert_eq!(ack["accepted"], true);
    assert_eq!(ack["session_id"].as_str().unwrap().len(), 32);
    server.shutdown();
}

#[tokio::test]
async fn test_server_rejects_traffic_before_session() {
    let server = ServerManager::new(ManagerConfig::default());
    let mut server_events = capture(&server);
    let (near, far) = Connection::in_memory_pair();
    let endpoint = server.serve_connection(near).unwrap();
    let mut peer = common::RawPeer::new(far);

    peer.send_json(json!({"protocol": "KeepAliveProtocol", "type": "request", "payload": "KeepAliveRequest"}))
        .await;

    let error = next_event(&mut server_events).await;
    assert_eq!(error.kind(), LifecycleKind::SessionError);
    assert_eq!(error.reason(), Some("invalid message"));
    endpoint.wait_closed().await;
    assert!(peer.recv_json().await.is_none());
    assert_eq!(server.endpoint_count(), 0);
}

#[tokio::test]
async fn test_duplicate_session_start_is_violation() {
    let server = ServerManager::new(ManagerConfig::default());
    let mut server_events = capture(&server);
    let (near, far) = Connection::in_memory_pair();
    server.serve_connection(near).unwrap();
    let mut peer = common::RawPeer::new(far);
    peer.open_session(None).await;
    expect_event(&mut server_events, LifecycleKind::SessionStarted).await;

    peer.send_json(json!({"protocol": "SessionProtocol", "type": "request", "payload": "SessionStart"}))
        .await;

    let error = expect_event(&mut server_events, LifecycleKind::SessionError).await;
    assert_eq!(error.reason(), Some("SessionProtocol violation"));
}

#[tokio::test]
async fn test_client_sends_session_start_with_secret() {
    let (dialer, mut peers) = PipeDialer::new();
    let client = ClientManager::with_dialer("memory", 0, ManagerConfig::with_secret("pw"), dialer);
    let mut client_events = capture(&client);
    client.start();
    let mut peer = peers.recv().await.unwrap();

    let start = peer.recv_json().await.unwrap();
    assert_eq!(
        start,
        json!({"protocol": "SessionProtocol", "type": "request", "payload": "SessionStart", "secret": "pw"})
    );
    peer.send_json(json!({
        "protocol": "SessionProtocol",
        "type": "reply",
        "payload": "SessionStartAck",
        "accepted": true,
        "session_id": "abc",
    }))
    .await;

    let started = expect_event(&mut client_events, LifecycleKind::SessionStarted).await;
    assert_eq!(started.endpoint().session().unwrap().session_id().as_deref(), Some("abc"));
    // Keep-alive opens immediately once the session is up.
    let ping = peer.recv_json().await.unwrap();
    assert_eq!(ping["protocol"], "KeepAliveProtocol");
    assert_eq!(ping["payload"], "KeepAliveRequest");

    let mut welcome = listen(started.endpoint(), "WELCOME");
    peer.send_json(json!({
        "protocol": "EventProtocol",
        "type": "request",
        "payload": "Event",
        "name": "WELCOME",
        "args": ["hi"],
    }))
    .await;
    assert_eq!(next_args(&mut welcome).await, vec!["hi"]);

    client.shutdown();
    client.join().await.unwrap();
}
