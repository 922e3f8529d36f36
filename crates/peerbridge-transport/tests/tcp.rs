//! Integration tests for the TCP transport.
//!
//! These bind a real listener on an OS-assigned port and dial it, so they
//! exercise name resolution, accept, and line framing end to end.

use peerbridge_transport::{Dialer, TcpDialer, TcpTransport, Transport, TransportError};

#[tokio::test]
async fn test_tcp_accept_and_exchange_lines() {
    let mut transport = TcpTransport::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let port = transport.local_addr().port();

    let server = tokio::spawn(async move {
        transport.accept().await.expect("should accept")
    });

    let client = TcpDialer
        .dial("127.0.0.1", port)
        .await
        .expect("should dial");
    let server_conn = server.await.expect("task should complete");

    assert_ne!(client.id(), server_conn.id());
    assert!(server_conn.peer().starts_with("127.0.0.1:"));

    let (mut client_rx, mut client_tx) = client.into_split();
    let (mut server_rx, mut server_tx) = server_conn.into_split();

    // --- Client sends, server receives ---
    client_tx.send(br#"{"hello":"server"}"#).await.unwrap();
    let frame = server_rx.recv().await.unwrap().unwrap();
    assert_eq!(frame, br#"{"hello":"server"}"#);

    // --- Server sends, client receives ---
    server_tx.send(b"pong").await.unwrap();
    assert_eq!(client_rx.recv().await.unwrap().unwrap(), b"pong");

    // --- Client closes, server sees EOF ---
    client_tx.close().await.unwrap();
    assert!(server_rx.recv().await.unwrap().is_none());
}

#[tokio::test]
async fn test_tcp_dial_refused_is_transient() {
    // Bind then drop to get a port with nothing listening on it.
    let port = {
        let transport = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        transport.local_addr().port()
    };

    let err = TcpDialer.dial("127.0.0.1", port).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectFailed(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_tcp_dial_unknown_host_is_fatal() {
    let err = TcpDialer
        .dial("peerbridge-host.invalid", 3100)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::UnknownHost { .. }));
    assert!(err.is_fatal());
}
