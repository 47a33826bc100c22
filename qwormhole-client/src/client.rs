//! High-level client API.

use crate::config::ClientConfig;
use crate::connection::{ClientEvent, Command, ConnectionState, Driver, SendRequest, Shared};
use crate::error::ClientError;
use crate::transport::TransportSelector;
use bytes::Bytes;
use parking_lot::Mutex;
use qwormhole_core::Telemetry;
use qwormhole_protocol::HandshakeRecord;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Per-send options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Lower values are written first when rate limiting queues sends.
    pub priority: i32,
    /// Fail with [`ClientError::NotConnected`] instead of queueing when the
    /// connection is not ready.
    pub require_connected: bool,
}

impl SendOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn connected_only(mut self) -> Self {
        self.require_connected = true;
        self
    }
}

/// Receiving end of a client's event stream.
#[derive(Debug)]
pub struct ClientEvents {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl ClientEvents {
    /// Waits for the next event. Returns `None` once the client is closed
    /// and every event has been consumed.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        self.rx.try_recv().ok()
    }
}

struct Startup {
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

/// A reconnecting, framed client connection.
pub struct Client {
    config: Arc<ClientConfig>,
    selector: TransportSelector,
    telemetry: Option<Arc<Telemetry>>,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    startup: Mutex<Option<Startup>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a client. Nothing is opened until [`Client::connect`].
    pub fn new(config: ClientConfig, selector: TransportSelector) -> (Self, ClientEvents) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            config: Arc::new(config),
            selector,
            telemetry: None,
            shared: Arc::new(Shared::new()),
            commands,
            startup: Mutex::new(Some(Startup {
                commands: commands_rx,
                events: events_tx,
            })),
            driver: Mutex::new(None),
        };
        (client, ClientEvents { rx: events_rx })
    }

    /// Records this client's activity in `telemetry`.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.selector.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns whether a partially written frame is still being flushed.
    pub fn is_draining(&self) -> bool {
        self.shared.is_draining()
    }

    /// Starts the connection and waits for the first attempt to finish.
    ///
    /// Returns the server's handshake when one was exchanged. If the first
    /// attempt fails with a retryable error the error is returned here while
    /// reconnects continue in the background; watch the event stream for
    /// the outcome.
    pub async fn connect(&self) -> Result<Option<HandshakeRecord>, ClientError> {
        self.config.validate()?;

        let capability = self.selector.selected();
        if !capability.is_available() {
            return Err(ClientError::Configuration(format!(
                "transport '{}' is not available",
                capability.name()
            )));
        }
        if self.config.tls_enabled() && !capability.supports_tls() {
            return Err(ClientError::Configuration(format!(
                "transport '{}' does not support TLS",
                capability.name()
            )));
        }

        let startup = self.startup.lock().take().ok_or_else(|| {
            ClientError::Configuration("connect may only be called once per client".into())
        })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver::new(
            self.config.clone(),
            capability,
            startup.commands,
            startup.events,
            self.shared.clone(),
            self.telemetry.clone(),
            ready_tx,
        );
        *self.driver.lock() = Some(tokio::spawn(driver.run()));

        ready_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Sends one payload as one frame.
    ///
    /// Resolves once the whole frame has been handed to the transport. Sends
    /// made before the connection is ready are queued and flushed in order
    /// once it is, unless `require_connected` is set.
    pub async fn send(
        &self,
        payload: impl Into<Bytes>,
        options: SendOptions,
    ) -> Result<(), ClientError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ClientError::ConnectionClosed);
        }
        if options.require_connected && state != ConnectionState::Ready {
            return Err(ClientError::NotConnected);
        }

        let (done, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(SendRequest {
                payload: payload.into(),
                priority: options.priority,
                require_connected: options.require_connected,
                done,
            }))
            .map_err(|_| ClientError::ConnectionClosed)?;

        done_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Closes the connection and stops reconnecting.
    ///
    /// Queued sends fail with [`ClientError::ConnectionClosed`]. A terminal
    /// close event is the last event emitted.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);

        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
            return;
        }

        // Never connected: settle queued sends ourselves
        let startup = self.startup.lock().take();
        if let Some(mut startup) = startup {
            while let Ok(cmd) = startup.commands.try_recv() {
                if let Command::Send(req) = cmd {
                    let _ = req.done.send(Err(ClientError::ConnectionClosed));
                }
            }
            self.shared.set_state(ConnectionState::Closed);
            let _ = startup.events.send(ClientEvent::Close {
                had_error: false,
                terminal: true,
            });
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("transport", &self.selector.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsClientConfig;
    use crate::transport::{
        ConnectOptions, StreamReader, StreamWriter, TransportCapability, TransportChannel,
        TransportKind, TransportPreference,
    };
    use async_trait::async_trait;
    use qwormhole_core::ReconnectConfig;
    use qwormhole_protocol::handshake::build_plain;
    use qwormhole_protocol::{
        ControlMessage, ErrorClass, Framer, HandshakeError, HandshakeVerifier, Heartbeat, Tags,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// In-memory capability: every connect hands the peer end to the test.
    struct Duplex {
        peers: mpsc::UnboundedSender<DuplexStream>,
        buffer: usize,
    }

    #[async_trait]
    impl TransportCapability for Duplex {
        fn name(&self) -> &'static str {
            "duplex"
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Accelerated
        }

        fn supports_tls(&self) -> bool {
            false
        }

        async fn connect(&self, _: &ConnectOptions) -> Result<TransportChannel, ClientError> {
            let (ours, theirs) = tokio::io::duplex(self.buffer);
            self.peers
                .send(theirs)
                .map_err(|_| ClientError::Io(std::io::ErrorKind::ConnectionRefused.into()))?;
            let (r, w) = tokio::io::split(ours);
            Ok(TransportChannel {
                reader: Box::new(StreamReader::new(r)),
                writer: Box::new(StreamWriter::new(w)),
                local_addr: None,
                peer_addr: None,
            })
        }
    }

    fn setup(
        config: ClientConfig,
        buffer: usize,
    ) -> (Client, ClientEvents, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let selector = TransportSelector::new(
            vec![Arc::new(Duplex { peers: tx, buffer })],
            Arc::new(crate::tcp::TcpTransport::new()),
            TransportPreference::Auto,
        );
        let (client, events) = Client::new(config, selector);
        (client, events, rx)
    }

    fn config() -> ClientConfig {
        ClientConfig::new("peer", 1).with_reconnect(ReconnectConfig::disabled())
    }

    async fn next_event(events: &mut ClientEvents) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    async fn read_frame(stream: &mut DuplexStream, framer: &mut Framer) -> Bytes {
        loop {
            if let Some(frame) = framer.next_frame().unwrap() {
                return frame;
            }
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed the stream");
            framer.extend(&buf[..n]);
        }
    }

    async fn write_frame(stream: &mut DuplexStream, payload: &[u8]) {
        let frame = Framer::length_prefixed().encode(payload).unwrap();
        stream.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_flow_and_heartbeats_are_swallowed() {
        let (client, mut events, mut peers) = setup(config(), 4096);
        assert_eq!(client.transport_name(), "duplex");

        assert!(client.connect().await.unwrap().is_none());
        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Ready { handshake: None }
        );

        let mut peer = peers.recv().await.unwrap();
        let heartbeat = ControlMessage::Heartbeat(Heartbeat { ts: 1 }).to_vec().unwrap();
        write_frame(&mut peer, &heartbeat).await;
        write_frame(&mut peer, b"hello").await;
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Message {
                payload: Bytes::from_static(b"hello")
            }
        );

        client.send("ping", SendOptions::default()).await.unwrap();
        let mut framer = Framer::length_prefixed();
        assert_eq!(read_frame(&mut peer, &mut framer).await.as_ref(), b"ping");

        client.disconnect().await;
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Close {
                had_error: false,
                terminal: true
            }
        );
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.send("late", SendOptions::default()).await,
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_handshake_exchange() {
        let cfg = config()
            .with_protocol_version("1.0")
            .with_handshake_tag("role", "sensor");
        let (client, mut events, mut peers) = setup(cfg, 4096);

        let server = tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            let mut framer = Framer::length_prefixed();
            let hello = read_frame(&mut peer, &mut framer).await;
            let record = HandshakeVerifier::new(Some("1.0".into()))
                .verify_frame(&hello)
                .unwrap();

            let mut tags = Tags::new();
            tags.insert("node".into(), "hub".into());
            let reply = ControlMessage::Handshake(build_plain(Some("1.0"), &tags));
            write_frame(&mut peer, &reply.to_vec().unwrap()).await;
            (record, peer)
        });

        let handshake = client.connect().await.unwrap().unwrap();
        assert_eq!(handshake.protocol_version.as_deref(), Some("1.0"));
        assert_eq!(handshake.tags.get("node"), Some(&"hub".into()));

        let (record, _peer) = server.await.unwrap();
        assert_eq!(record.tags.get("role"), Some(&"sensor".into()));

        assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
        assert!(matches!(
            next_event(&mut events).await,
            ClientEvent::Ready { handshake: Some(_) }
        ));
    }

    #[tokio::test]
    async fn test_frame_coalesced_with_handshake_reply() {
        let (client, mut events, mut peers) = setup(config().with_protocol_version("1.0"), 4096);

        let server = tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            let mut framer = Framer::length_prefixed();
            read_frame(&mut peer, &mut framer).await;

            // Reply and first message in a single write, then silence
            let reply = ControlMessage::Handshake(build_plain(Some("1.0"), &Tags::new()));
            let mut bytes = framer.encode(&reply.to_vec().unwrap()).unwrap().to_vec();
            bytes.extend_from_slice(&framer.encode(b"welcome").unwrap());
            peer.write_all(&bytes).await.unwrap();
            peer
        });

        client.connect().await.unwrap();
        let _peer = server.await.unwrap();

        assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
        assert!(matches!(next_event(&mut events).await, ClientEvent::Ready { .. }));
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Message {
                payload: Bytes::from_static(b"welcome")
            }
        );
    }

    #[tokio::test]
    async fn test_rejected_handshake_pairs_error_and_close_while_retrying() {
        let reconnect = ReconnectConfig {
            initial_delay_ms: 10,
            max_attempts: Some(1),
            ..Default::default()
        };
        let cfg = config()
            .with_protocol_version("1.0")
            .with_reconnect(reconnect);
        let (client, mut events, mut peers) = setup(cfg, 4096);

        // Reads each handshake, then hangs up without replying
        let server = tokio::spawn(async move {
            for _ in 0..2 {
                let mut peer = peers.recv().await.unwrap();
                let mut framer = Framer::length_prefixed();
                read_frame(&mut peer, &mut framer).await;
            }
        });

        assert!(client.connect().await.is_err());

        for terminal in [false, true] {
            assert!(matches!(next_event(&mut events).await, ClientEvent::Connect { .. }));
            assert!(matches!(next_event(&mut events).await, ClientEvent::Error { .. }));
            assert_eq!(
                next_event(&mut events).await,
                ClientEvent::Close {
                    had_error: true,
                    terminal
                }
            );
            if !terminal {
                assert_eq!(
                    next_event(&mut events).await,
                    ClientEvent::Reconnecting {
                        attempt: 1,
                        delay: Duration::from_millis(10)
                    }
                );
            }
        }
        server.await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_terminal_without_reconnect() {
        let (client, mut events, mut peers) = setup(config().with_protocol_version("1.0"), 4096);

        let server = tokio::spawn(async move {
            let mut peer = peers.recv().await.unwrap();
            let mut framer = Framer::length_prefixed();
            read_frame(&mut peer, &mut framer).await;
            let reply = ControlMessage::Handshake(build_plain(Some("2.0"), &Tags::new()));
            write_frame(&mut peer, &reply.to_vec().unwrap()).await;
            peer
        });

        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Handshake(HandshakeError::VersionMismatch { .. })
        ));
        let _peer = server.await.unwrap();

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
    }

    #[tokio::test]
    async fn test_peer_closing_during_handshake_is_rejection() {
        let (client, _events, mut peers) = setup(config().with_protocol_version("1.0"), 4096);
        let server = tokio::spawn(async move {
            let peer = peers.recv().await.unwrap();
            drop(peer);
        });

        let err = client.connect().await.unwrap_err();
        server.await.unwrap();
        assert!(matches!(
            err,
            ClientError::Handshake(HandshakeError::Rejected) | ClientError::Io(_)
        ));
    }

    #[tokio::test]
    async fn test_require_connected_fails_before_ready() {
        let (client, _events, _peers) = setup(config(), 4096);
        let err = client
            .send("x", SendOptions::default().connected_only())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_tls_on_capability_without_tls() {
        let (client, _events, _peers) = setup(config().with_tls(TlsClientConfig::new()), 4096);
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let (client, _events, _peers) = setup(config(), 4096);
        client.connect().await.unwrap();
        assert!(matches!(
            client.connect().await,
            Err(ClientError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_sends_before_ready_are_flushed_in_order() {
        let (client, _events, mut peers) = setup(config(), 4096);
        let client = Arc::new(client);

        let first = tokio::spawn({
            let c = client.clone();
            async move { c.send("first", SendOptions::default()).await }
        });
        let second = tokio::spawn({
            let c = client.clone();
            async move { c.send("second", SendOptions::default()).await }
        });
        tokio::task::yield_now().await;

        client.connect().await.unwrap();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let mut peer = peers.recv().await.unwrap();
        let mut framer = Framer::length_prefixed();
        assert_eq!(read_frame(&mut peer, &mut framer).await.as_ref(), b"first");
        assert_eq!(read_frame(&mut peer, &mut framer).await.as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_is_fatal() {
        let (client, mut events, mut peers) = setup(config().with_max_frame_length(8), 4096);
        client.connect().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        let mut peer = peers.recv().await.unwrap();
        peer.write_all(&100u32.to_be_bytes()).await.unwrap();

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
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_close() {
        let reconnect = ReconnectConfig {
            initial_delay_ms: 10,
            ..Default::default()
        };
        let (client, mut events, mut peers) = setup(config().with_reconnect(reconnect), 4096);
        let telemetry = Arc::new(Telemetry::new().unwrap());
        let client = client.with_telemetry(telemetry.clone());

        client.connect().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        drop(peers.recv().await.unwrap());
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

        let mut peer = peers.recv().await.unwrap();
        client.send("again", SendOptions::default()).await.unwrap();
        let mut framer = Framer::length_prefixed();
        assert_eq!(read_frame(&mut peer, &mut framer).await.as_ref(), b"again");

        let snap = telemetry.snapshot();
        assert_eq!(snap.reconnect_attempts, 1);
        assert_eq!(snap.connections_opened, 2);
        assert_eq!(snap.connections_active, 1);
    }

    #[tokio::test]
    async fn test_partial_writes_set_draining_until_flushed() {
        let (client, _events, mut peers) = setup(config(), 8);
        let client = Arc::new(client);
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        let sending = tokio::spawn({
            let c = client.clone();
            async move { c.send(vec![7u8; 64], SendOptions::default()).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.is_draining() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let mut framer = Framer::length_prefixed();
        assert_eq!(read_frame(&mut peer, &mut framer).await.len(), 64);
        sending.await.unwrap().unwrap();
        assert!(!client.is_draining());
    }

    #[tokio::test]
    async fn test_rate_limited_sends_follow_priority() {
        // 10-byte burst, 20 bytes/s: each 8-byte frame waits for tokens
        let (client, _events, mut peers) = setup(config().with_rate_limit(20, Some(10)), 4096);
        let client = Arc::new(client);
        client.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        client.send("burst!", SendOptions::default()).await.unwrap();

        let low = tokio::spawn({
            let c = client.clone();
            async move { c.send("low!", SendOptions::default().with_priority(9)).await }
        });
        let high = tokio::spawn({
            let c = client.clone();
            async move { c.send("high", SendOptions::default().with_priority(1)).await }
        });

        let mut framer = Framer::length_prefixed();
        assert_eq!(read_frame(&mut peer, &mut framer).await.as_ref(), b"burst!");
        assert_eq!(read_frame(&mut peer, &mut framer).await.as_ref(), b"high");
        assert_eq!(read_frame(&mut peer, &mut framer).await.as_ref(), b"low!");
        low.await.unwrap().unwrap();
        high.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_before_connect() {
        let (client, mut events, _peers) = setup(config(), 4096);
        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Close {
                had_error: false,
                terminal: true
            }
        );
    }
}
