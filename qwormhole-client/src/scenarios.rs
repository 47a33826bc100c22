//! Client/server scenarios over loopback.

use crate::client::{Client, ClientEvents, SendOptions};
use crate::config::ClientConfig;
use crate::connection::{ClientEvent, ConnectionState};
use crate::transport::TransportSelector;
use bytes::Bytes;
use qwormhole_core::{ReconnectConfig, Telemetry};
use qwormhole_protocol::handshake::build_plain;
use qwormhole_protocol::{ControlMessage, ErrorClass, Framer, HandshakeIdentity, Tags};
use qwormhole_server::{
    ConnectionHooks, ConnectionId, ConnectionInfo, KeyAllowList, Server, ServerConfig,
    ServerError, ServerEvent, ServerEvents,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

async fn start(config: ServerConfig) -> (Server, ServerEvents, SocketAddr) {
    let (server, mut events) = Server::new(config);
    let addr = server.listen("127.0.0.1", 0).await.unwrap();
    assert!(matches!(
        events.recv().await,
        Some(ServerEvent::Listening { .. })
    ));
    (server, events, addr)
}

/// Echoes every message back prefixed with `echo:`.
fn spawn_echo(server: Server, mut events: ServerEvents) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let ServerEvent::Message {
                connection_id,
                payload,
            } = event
            {
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&payload);
                let _ = server.send_to(&connection_id, &reply);
            }
        }
    });
}

fn tcp_client(config: ClientConfig) -> (Client, ClientEvents) {
    Client::new(config, TransportSelector::tcp())
}

fn fast_retry(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        enabled: true,
        initial_delay_ms: 10,
        max_delay_ms: 1000,
        multiplier: 2.0,
        max_attempts: Some(max_attempts),
    }
}

async fn next_event(events: &mut ClientEvents) -> ClientEvent {
    timeout(WAIT, events.recv())
        .await
        .unwrap()
        .expect("client events closed")
}

async fn next_message(events: &mut ClientEvents) -> Bytes {
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(ClientEvent::Message { payload }) => return payload,
            Some(ClientEvent::Close { .. }) | None => panic!("closed before a message arrived"),
            Some(_) => {}
        }
    }
}

async fn next_connection(events: &mut ServerEvents) -> ConnectionId {
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(ServerEvent::Connection { id, .. }) => return id,
            Some(_) => {}
            None => panic!("server events closed"),
        }
    }
}

/// Waits for the pre-admission failure of a connection that never registered.
async fn next_refusal(events: &mut ServerEvents) -> String {
    let mut message = None;
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(ServerEvent::Error { message: m, .. }) => message = Some(m),
            Some(ServerEvent::ClientClosed { had_error, .. }) => {
                assert!(had_error);
                return message.expect("close without a preceding error");
            }
            Some(ServerEvent::Connection { .. }) => panic!("refused client was registered"),
            Some(_) => {}
            None => panic!("server events closed"),
        }
    }
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (server, events, addr) = start(ServerConfig::new()).await;
    spawn_echo(server.clone(), events);

    let (client, mut client_events) = tcp_client(ClientConfig::new("127.0.0.1", addr.port()));
    assert!(client.connect().await.unwrap().is_none());
    client
        .send(Bytes::from_static(b"ping"), SendOptions::default())
        .await
        .unwrap();

    assert_eq!(next_message(&mut client_events).await.as_ref(), b"echo:ping");

    client.disconnect().await;
    timeout(WAIT, async {
        while server.connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_reconnect_backoff_then_terminal_close() {
    // Reserve a port nobody listens on
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let telemetry = Arc::new(Telemetry::new().unwrap());
    let (client, mut events) = tcp_client(
        ClientConfig::new("127.0.0.1", port)
            .with_reconnect(fast_retry(3))
            .with_connect_timeout(Duration::from_secs(2)),
    );
    let client = client.with_telemetry(telemetry.clone());
    assert!(client.connect().await.is_err());

    let mut attempts = Vec::new();
    let mut errors = 0;
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(ClientEvent::Reconnecting { attempt, delay }) => attempts.push((attempt, delay)),
            Some(ClientEvent::Error { class, .. }) => {
                assert_eq!(class, ErrorClass::Transport);
                errors += 1;
            }
            Some(ClientEvent::Close {
                had_error,
                terminal,
            }) => {
                assert!(had_error);
                assert!(terminal);
                break;
            }
            Some(other) => panic!("unexpected {:?}", other),
            None => panic!("events closed without a terminal close"),
        }
    }

    assert_eq!(
        attempts,
        vec![
            (1, Duration::from_millis(10)),
            (2, Duration::from_millis(20)),
            (3, Duration::from_millis(40)),
        ]
    );
    assert_eq!(errors, 4);
    assert_eq!(telemetry.snapshot().reconnect_attempts, 3);
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_server_close_mid_session_reconnects() {
    let (server, server_events, addr) = start(ServerConfig::new()).await;
    let (watcher, mut watched) = tokio::sync::mpsc::unbounded_channel();
    let echo = server.clone();
    tokio::spawn(async move {
        let mut events = server_events;
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Connection { id, .. } => {
                    let _ = watcher.send(id);
                }
                ServerEvent::Message {
                    connection_id,
                    payload,
                } => {
                    let _ = echo.send_to(&connection_id, &payload);
                }
                _ => {}
            }
        }
    });

    let (client, mut events) = tcp_client(
        ClientConfig::new("127.0.0.1", addr.port()).with_reconnect(fast_retry(5)),
    );
    client.connect().await.unwrap();
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
    assert!(matches!(next_event(&mut events).await, ClientEvent::Ready { .. }));

    let first = timeout(WAIT, watched.recv()).await.unwrap().unwrap();
    server.close_connection(&first).unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Close {
            had_error: false,
            terminal: false
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(10)
        }
    );
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
    assert!(matches!(next_event(&mut events).await, ClientEvent::Ready { .. }));

    let second = timeout(WAIT, watched.recv()).await.unwrap().unwrap();
    assert_ne!(first, second);
    assert_eq!(client.state(), ConnectionState::Ready);

    client
        .send(Bytes::from_static(b"again"), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(next_message(&mut events).await.as_ref(), b"again");
}

#[tokio::test]
async fn test_rejected_handshake_closes_both_sides() {
    let (server, mut server_events, addr) =
        start(ServerConfig::new().with_protocol_version("1.0")).await;

    let (client, mut events) = tcp_client(
        ClientConfig::new("127.0.0.1", addr.port())
            .with_protocol_version("2.0")
            .with_reconnect(ReconnectConfig::disabled()),
    );
    assert!(client.connect().await.is_err());

    let mut saw_error = false;
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(ClientEvent::Error { class, .. }) => {
                assert_eq!(class, ErrorClass::Protocol);
                saw_error = true;
            }
            Some(ClientEvent::Close { had_error, .. }) => {
                assert!(had_error);
                break;
            }
            Some(_) => {}
            None => panic!("events closed without close"),
        }
    }
    assert!(saw_error);

    assert!(next_refusal(&mut server_events)
        .await
        .contains("version mismatch"));
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_rejection_pairs_error_and_close_across_retries() {
    let (server, mut server_events, addr) =
        start(ServerConfig::new().with_protocol_version("1.0")).await;

    let (client, mut events) = tcp_client(
        ClientConfig::new("127.0.0.1", addr.port())
            .with_protocol_version("2.0")
            .with_reconnect(fast_retry(1)),
    );
    assert!(client.connect().await.is_err());

    assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Error {
            class: ErrorClass::Protocol,
            ..
        }
    ));
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Close {
            had_error: true,
            terminal: false
        }
    );
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Reconnecting {
            attempt: 1,
            delay: Duration::from_millis(10)
        }
    );
    assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Error {
            class: ErrorClass::Protocol,
            ..
        }
    ));
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Close {
            had_error: true,
            terminal: true
        }
    );
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());
    assert_eq!(client.state(), ConnectionState::Closed);

    next_refusal(&mut server_events).await;
    next_refusal(&mut server_events).await;
    assert_eq!(server.connection_count(), 0);
}

/// Turns away every peer that completed a handshake.
struct RequireAnonymous;

impl ConnectionHooks for RequireAnonymous {
    fn authorize_connection(&self, info: &ConnectionInfo) -> Result<bool, ServerError> {
        Ok(info.handshake.is_none())
    }
}

#[tokio::test]
async fn test_authorize_hook_rejection() {
    let (server, mut server_events, addr) = start(
        ServerConfig::new()
            .with_protocol_version("1.0")
            .with_hooks(Arc::new(RequireAnonymous)),
    )
    .await;

    let (client, mut events) = tcp_client(
        ClientConfig::new("127.0.0.1", addr.port())
            .with_protocol_version("1.0")
            .with_reconnect(ReconnectConfig::disabled()),
    );
    assert!(client.connect().await.is_err());

    assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
    assert!(matches!(
        next_event(&mut events).await,
        ClientEvent::Error {
            class: ErrorClass::Protocol,
            ..
        }
    ));
    assert_eq!(
        next_event(&mut events).await,
        ClientEvent::Close {
            had_error: true,
            terminal: true
        }
    );
    assert!(timeout(WAIT, events.recv()).await.unwrap().is_none());

    assert!(next_refusal(&mut server_events)
        .await
        .contains("not authorized"));
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_frame_coalesced_with_handshake() {
    let (server, mut server_events, addr) =
        start(ServerConfig::new().with_protocol_version("1.0")).await;

    let framer = Framer::length_prefixed();
    let hello = ControlMessage::Handshake(build_plain(Some("1.0"), &Tags::new()));
    let mut bytes = framer.encode(&hello.to_vec().unwrap()).unwrap().to_vec();
    bytes.extend_from_slice(&framer.encode(b"early").unwrap());

    // One write, then nothing more from the peer
    let mut peer = TcpStream::connect(addr).await.unwrap();
    peer.write_all(&bytes).await.unwrap();

    let id = next_connection(&mut server_events).await;
    loop {
        match timeout(WAIT, server_events.recv()).await.unwrap() {
            Some(ServerEvent::Message {
                connection_id,
                payload,
            }) => {
                assert_eq!(connection_id, id);
                assert_eq!(payload.as_ref(), b"early");
                break;
            }
            Some(ServerEvent::ClientClosed { .. }) | None => panic!("closed before delivery"),
            Some(_) => {}
        }
    }
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_signed_handshake_with_allow_list() {
    let client_identity = Arc::new(HandshakeIdentity::generate());
    let server_identity = Arc::new(HandshakeIdentity::generate());
    let allow = KeyAllowList::new(vec![KeyAllowList::hash_key(
        &client_identity.public_key_base64(),
    )]);

    let (server, mut server_events, addr) = start(
        ServerConfig::new()
            .with_protocol_version("1.0")
            .with_identity(server_identity.clone())
            .with_require_signed(true)
            .with_hooks(Arc::new(allow)),
    )
    .await;

    let (client, _events) = tcp_client(
        ClientConfig::new("127.0.0.1", addr.port())
            .with_protocol_version("1.0")
            .with_identity(client_identity.clone())
            .with_handshake_tag("role", "agent"),
    );
    let server_record = client.connect().await.unwrap().unwrap();
    assert!(server_record.is_signed());
    assert_eq!(
        server_record.public_key.as_deref(),
        Some(server_identity.public_key_base64().as_str())
    );

    loop {
        match timeout(WAIT, server_events.recv()).await.unwrap() {
            Some(ServerEvent::Connection { handshake, .. }) => {
                let record = handshake.unwrap();
                assert!(record.is_signed());
                assert_eq!(
                    record.public_key.as_deref(),
                    Some(client_identity.public_key_base64().as_str())
                );
                break;
            }
            Some(_) => {}
            None => panic!("server events closed"),
        }
    }
    assert_eq!(server.connection_count(), 1);

    // A different key is turned away
    let (stranger, _stranger_events) = tcp_client(
        ClientConfig::new("127.0.0.1", addr.port())
            .with_protocol_version("1.0")
            .with_identity(Arc::new(HandshakeIdentity::generate()))
            .with_reconnect(ReconnectConfig::disabled()),
    );
    assert!(stranger.connect().await.is_err());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_slow_consumer_is_dropped_alone() {
    let threshold = 4 * 1024 * 1024;
    let (server, mut server_events, addr) =
        start(ServerConfig::new().with_max_backpressure_bytes(threshold)).await;

    // Never reads
    let _slow = TcpStream::connect(addr).await.unwrap();
    let slow_id = next_connection(&mut server_events).await;

    let (healthy, _healthy_events) = tcp_client(ClientConfig::new("127.0.0.1", addr.port()));
    healthy.connect().await.unwrap();
    let healthy_id = next_connection(&mut server_events).await;

    let chunk = vec![7u8; 1024 * 1024];
    let mut overflowed = false;
    for _ in 0..256 {
        if server.send_to(&slow_id, &chunk).is_err() {
            overflowed = true;
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(overflowed);

    let mut saw_backpressure = false;
    loop {
        match timeout(WAIT, server_events.recv()).await.unwrap() {
            Some(ServerEvent::Backpressure {
                connection_id,
                threshold: limit,
                ..
            }) => {
                assert_eq!(connection_id, slow_id);
                assert_eq!(limit, threshold);
                saw_backpressure = true;
            }
            Some(ServerEvent::Error {
                connection_id,
                class,
                ..
            }) => {
                assert_eq!(connection_id, Some(slow_id));
                assert_eq!(class, ErrorClass::Resource);
            }
            Some(ServerEvent::ClientClosed {
                connection_id,
                had_error,
            }) => {
                assert_eq!(connection_id, slow_id);
                assert!(had_error);
                break;
            }
            Some(_) => {}
            None => panic!("server events closed"),
        }
    }
    assert!(saw_backpressure);

    let remaining = server.connections();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, healthy_id);
}

#[tokio::test]
async fn test_broadcast_reaches_all_clients() {
    let (server, mut server_events, addr) = start(ServerConfig::new()).await;

    let (a, mut a_events) = tcp_client(ClientConfig::new("127.0.0.1", addr.port()));
    a.connect().await.unwrap();
    next_connection(&mut server_events).await;
    let (b, mut b_events) = tcp_client(ClientConfig::new("127.0.0.1", addr.port()));
    b.connect().await.unwrap();
    next_connection(&mut server_events).await;

    assert_eq!(server.broadcast(b"news").unwrap(), 2);
    assert_eq!(next_message(&mut a_events).await.as_ref(), b"news");
    assert_eq!(next_message(&mut b_events).await.as_ref(), b"news");

    server.shutdown().await;
    assert_eq!(server.connection_count(), 0);
}
