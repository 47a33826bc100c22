//! TCP server implementation.

use crate::config::Config;
use crate::error::ServerError;
use crate::hooks::{AllowAll, ConnectionHooks, KeyAllowList};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRegistry};
use crate::session::{write_loop, Session, WriteContext, CLOSE_DRAIN_TIMEOUT};
use crate::stream::ServerStream;
use bytes::Bytes;
use parking_lot::Mutex;
use qwormhole_core::Telemetry;
use qwormhole_protocol::handshake::{build_plain, build_signed};
use qwormhole_protocol::{
    ControlMessage, ErrorClass, Framer, FramingMode, HandshakeError, HandshakeIdentity,
    HandshakeRecord, HandshakeVerifier, TagCheck, Tags, DEFAULT_MAX_BACKPRESSURE_BYTES,
    DEFAULT_MAX_FRAME_LENGTH,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

/// Events produced by a [`Server`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening {
        address: SocketAddr,
    },
    /// A connection passed admission and was registered.
    Connection {
        id: ConnectionId,
        remote_addr: SocketAddr,
        handshake: Option<HandshakeRecord>,
    },
    Message {
        connection_id: ConnectionId,
        payload: Bytes,
    },
    Backpressure {
        connection_id: ConnectionId,
        queued_bytes: usize,
        threshold: usize,
    },
    Drain {
        connection_id: ConnectionId,
    },
    ClientClosed {
        connection_id: ConnectionId,
        had_error: bool,
    },
    Error {
        connection_id: Option<ConnectionId>,
        class: ErrorClass,
        message: String,
    },
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    pub framing: FramingMode,
    pub max_frame_length: u32,
    /// Outbound bytes a connection may have queued before it is dropped.
    pub max_backpressure_bytes: usize,
    pub max_connections: usize,
    /// Require a handshake as the first frame even when no version or
    /// identity is configured.
    pub require_handshake: bool,
    pub protocol_version: Option<String>,
    pub handshake_tags: Tags,
    /// Signs the server's handshake reply when set.
    pub identity: Option<Arc<HandshakeIdentity>>,
    pub require_signed: bool,
    /// Extra predicate over client handshake tags.
    pub tag_check: Option<TagCheck>,
    /// Bounds TLS accept plus handshake exchange.
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub read_buffer_size: usize,
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    pub telemetry: Option<Arc<Telemetry>>,
    pub hooks: Arc<dyn ConnectionHooks>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("framing", &self.framing)
            .field("max_frame_length", &self.max_frame_length)
            .field("max_backpressure_bytes", &self.max_backpressure_bytes)
            .field("max_connections", &self.max_connections)
            .field("require_handshake", &self.require_handshake)
            .field("protocol_version", &self.protocol_version)
            .field("handshake_tags", &self.handshake_tags)
            .field("identity", &self.identity)
            .field("require_signed", &self.require_signed)
            .field("tag_check", &self.tag_check.is_some())
            .field("handshake_timeout", &self.handshake_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("telemetry_enabled", &self.telemetry.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            framing: FramingMode::LengthPrefixed,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_backpressure_bytes: DEFAULT_MAX_BACKPRESSURE_BYTES,
            max_connections: 1024,
            require_handshake: false,
            protocol_version: None,
            handshake_tags: Tags::new(),
            identity: None,
            require_signed: false,
            tag_check: None,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            read_buffer_size: 64 * 1024,
            tls_acceptor: None,
            telemetry: None,
            hooks: Arc::new(AllowAll),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a server configuration from the daemon's YAML configuration,
    /// loading TLS material, the signing seed and the key allow list.
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let mut handshake = config.handshake.clone();
        handshake
            .load_allowed_keys()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;

        let mut server = Self {
            framing: config.framing.mode,
            max_frame_length: config.framing.max_frame_length,
            max_backpressure_bytes: config.framing.max_backpressure_bytes,
            max_connections: config.network.max_connections,
            require_handshake: handshake.is_enabled(),
            protocol_version: handshake.protocol_version.clone(),
            handshake_tags: handshake.tags.clone(),
            require_signed: handshake.require_signed,
            idle_timeout: config.network.idle_timeout(),
            read_buffer_size: config.network.read_buffer_size,
            ..Self::default()
        };
        if let Some(timeout) = handshake.timeout() {
            server.handshake_timeout = timeout;
        }

        let seed = handshake
            .read_signing_seed()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;
        if let Some(seed) = seed {
            let identity = HandshakeIdentity::from_base64_seed(&seed)
                .map_err(|e| ServerError::Configuration(format!("signing key: {}", e)))?;
            tracing::info!("Handshake signing key {}", identity.public_key_base64());
            server.identity = Some(Arc::new(identity));
        }

        if !handshake.allowed_key_hashes.is_empty() {
            let allow = KeyAllowList::new(handshake.allowed_key_hashes);
            tracing::info!("Admitting {} allow-listed client keys", allow.key_count());
            server.require_signed = true;
            server.hooks = Arc::new(allow);
        }

        if config.tls.enabled {
            server.tls_acceptor = Some(Arc::new(crate::tls::build_acceptor(&config.tls)?));
        }

        Ok(server)
    }

    pub fn with_framing(mut self, framing: FramingMode) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_max_frame_length(mut self, max: u32) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_max_backpressure_bytes(mut self, max: usize) -> Self {
        self.max_backpressure_bytes = max;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    pub fn with_handshake_tags(mut self, tags: Tags) -> Self {
        self.handshake_tags = tags;
        self
    }

    pub fn with_identity(mut self, identity: Arc<HandshakeIdentity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_require_signed(mut self, require: bool) -> Self {
        self.require_signed = require;
        self
    }

    pub fn with_tag_check(mut self, check: impl Fn(&Tags) -> bool + Send + Sync + 'static) -> Self {
        self.tag_check = Some(Arc::new(check));
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn ConnectionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Returns whether clients must open with a handshake.
    pub fn handshake_enabled(&self) -> bool {
        self.require_handshake
            || self.require_signed
            || self.protocol_version.is_some()
            || self.identity.is_some()
            || self.tag_check.is_some()
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_frame_length == 0 {
            return Err(ServerError::Configuration(
                "max_frame_length must be > 0".into(),
            ));
        }
        if self.max_backpressure_bytes == 0 {
            return Err(ServerError::Configuration(
                "max_backpressure_bytes must be > 0".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ServerError::Configuration(
                "max_connections must be > 0".into(),
            ));
        }
        Ok(())
    }

    fn verifier(&self) -> HandshakeVerifier {
        HandshakeVerifier::new(self.protocol_version.clone())
            .require_signed(self.require_signed)
            .with_tag_check(self.tag_check.clone())
    }

    /// Encodes the handshake frame sent back to clients.
    fn handshake_reply(&self, framer: &Framer) -> Result<Bytes, ServerError> {
        let version = self.protocol_version.as_deref();
        let msg = match &self.identity {
            Some(identity) => build_signed(version, &self.handshake_tags, identity)?,
            None => build_plain(version, &self.handshake_tags),
        };
        Ok(framer.encode(&ControlMessage::Handshake(msg).to_vec()?)?)
    }
}

/// Receiving end of a server's event stream.
#[derive(Debug)]
pub struct ServerEvents {
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl ServerEvents {
    /// Waits for the next event. Returns `None` once the server and all of
    /// its connections are gone.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.rx.try_recv().ok()
    }
}

struct ServerInner {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    events: mpsc::UnboundedSender<ServerEvent>,
    /// Encode-only framer shared by broadcast and send_to.
    encoder: Framer,
    local_addr: Mutex<Option<SocketAddr>>,
    stop: watch::Sender<bool>,
}

/// A framed TCP server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Creates a server. Nothing is bound until [`Server::listen`].
    pub fn new(config: ServerConfig) -> (Self, ServerEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let encoder = Framer::new(config.framing, config.max_frame_length);
        let server = Self {
            inner: Arc::new(ServerInner {
                config,
                registry: Arc::new(ConnectionRegistry::new()),
                events,
                encoder,
                local_addr: Mutex::new(None),
                stop,
            }),
        };
        (server, ServerEvents { rx })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn telemetry(&self) -> Option<&Arc<Telemetry>> {
        self.inner.config.telemetry.as_ref()
    }

    /// Binds and starts accepting. Port 0 picks an ephemeral port; the
    /// bound address is returned.
    pub async fn listen(&self, host: &str, port: u16) -> Result<SocketAddr, ServerError> {
        self.inner.config.validate()?;
        if *self.inner.stop.borrow() {
            return Err(ServerError::ShuttingDown);
        }
        if self.inner.local_addr.lock().is_some() {
            return Err(ServerError::AlreadyListening);
        }

        let listener = TcpListener::bind((host, port)).await?;
        let address = listener.local_addr()?;
        {
            let mut local = self.inner.local_addr.lock();
            if local.is_some() {
                return Err(ServerError::AlreadyListening);
            }
            *local = Some(address);
        }

        let mode = if self.inner.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!("Server listening on {} ({})", address, mode);
        let _ = self.inner.events.send(ServerEvent::Listening { address });

        tokio::spawn(accept_loop(
            self.inner.clone(),
            listener,
            self.inner.stop.subscribe(),
        ));
        Ok(address)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Frames `payload` once and queues it on every connection. Returns the
    /// number of connections that accepted it.
    pub fn broadcast(&self, payload: &[u8]) -> Result<usize, ServerError> {
        let frame = self.inner.encoder.encode(payload)?;
        Ok(self.inner.registry.broadcast(&frame))
    }

    pub fn send_to(&self, id: &ConnectionId, payload: &[u8]) -> Result<(), ServerError> {
        let handle = self
            .inner
            .registry
            .get(id)
            .ok_or(ServerError::UnknownConnection(*id))?;
        let frame = self.inner.encoder.encode(payload)?;
        handle.enqueue(frame).map(|_| ())
    }

    /// Stops reading from the connection and closes it once its queued
    /// frames are written. Closing an already-closing connection is a no-op.
    pub fn close_connection(&self, id: &ConnectionId) -> Result<(), ServerError> {
        let handle = self
            .inner
            .registry
            .get(id)
            .ok_or(ServerError::UnknownConnection(*id))?;
        if handle.request_close() {
            tracing::debug!("[{}] Close requested", id);
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner.registry.infos()
    }

    pub fn is_backpressured(&self, id: &ConnectionId) -> Option<bool> {
        self.inner.registry.get(id).map(|h| h.is_backpressured())
    }

    /// Stops accepting, closes every connection and waits for them to go
    /// away, bounded by the close drain timeout.
    pub async fn shutdown(&self) {
        if self.inner.stop.send_replace(true) {
            return;
        }
        tracing::info!("Server shutting down");

        let handles = self.inner.registry.handles();
        for handle in &handles {
            handle.request_close();
        }

        let mut count = self.inner.registry.watch_count();
        let wait = count.wait_for(|n| *n == 0);
        if tokio::time::timeout(CLOSE_DRAIN_TIMEOUT + Duration::from_secs(1), wait)
            .await
            .is_err()
        {
            tracing::warn!(
                "{} connections still open after shutdown",
                self.inner.registry.len()
            );
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.stop.borrow()
    }
}

async fn accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((tcp, remote_addr)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.admit(tcp, remote_addr).await });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = stop.changed() => break,
        }
    }
    tracing::debug!("Accept loop stopped");
}

struct Admitted {
    stream: ServerStream,
    framer: Framer,
    handshake: Option<HandshakeRecord>,
}

impl ServerInner {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    async fn admit(self: Arc<Self>, tcp: TcpStream, remote_addr: SocketAddr) {
        let id = ConnectionId::new();
        match self.prepare(tcp, remote_addr, id).await {
            Ok(admitted) => self.register(id, remote_addr, admitted).await,
            Err(e) => {
                let class = e.class();
                tracing::warn!("[{}] Connection rejected: {}", remote_addr, e);
                if let Some(t) = &self.config.telemetry {
                    if matches!(e, ServerError::Handshake(_)) {
                        t.handshake_failures.inc();
                    }
                    t.record_error(class);
                }
                self.emit(ServerEvent::Error {
                    connection_id: Some(id),
                    class,
                    message: e.to_string(),
                });
                self.emit(ServerEvent::ClientClosed {
                    connection_id: id,
                    had_error: true,
                });
            }
        }
    }

    /// Runs admission in order: address hook, connection limit, TLS,
    /// handshake, authorization hook.
    async fn prepare(
        &self,
        tcp: TcpStream,
        remote_addr: SocketAddr,
        id: ConnectionId,
    ) -> Result<Admitted, ServerError> {
        let config = &self.config;
        if *self.stop.borrow() {
            return Err(ServerError::ShuttingDown);
        }
        if !config.hooks.allow_connection(remote_addr)? {
            return Err(ServerError::Rejected(format!(
                "address {} not allowed",
                remote_addr
            )));
        }
        if self.registry.len() >= config.max_connections {
            return Err(ServerError::ConnectionLimit(config.max_connections));
        }
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("[{}] Cannot set TCP_NODELAY: {}", remote_addr, e);
        }

        let exchange = async {
            let mut stream = match &config.tls_acceptor {
                Some(acceptor) => {
                    tracing::debug!("[{}] Performing TLS handshake", remote_addr);
                    let tls = acceptor
                        .accept(tcp)
                        .await
                        .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                    ServerStream::Tls {
                        stream: Box::new(tls),
                    }
                }
                None => ServerStream::Plain { stream: tcp },
            };

            let mut framer = Framer::new(config.framing, config.max_frame_length);
            let handshake = if config.handshake_enabled() {
                Some(self.read_handshake(&mut stream, &mut framer, id).await?)
            } else {
                None
            };

            // A rejected peer gets no reply
            let info = ConnectionInfo {
                id,
                remote_addr,
                handshake: handshake.clone(),
            };
            if !config.hooks.authorize_connection(&info)? {
                return Err(ServerError::Rejected("not authorized".into()));
            }

            if handshake.is_some() {
                let reply = config.handshake_reply(&framer)?;
                stream.write_all(&reply).await?;
                stream.flush().await?;
            }
            Ok::<_, ServerError>(Admitted {
                stream,
                framer,
                handshake,
            })
        };

        tokio::time::timeout(config.handshake_timeout, exchange)
            .await
            .map_err(|_| ServerError::Timeout("connection handshake"))?
    }

    /// Reads frames until the first one is complete and verifies it.
    async fn read_handshake(
        &self,
        stream: &mut ServerStream,
        framer: &mut Framer,
        id: ConnectionId,
    ) -> Result<HandshakeRecord, ServerError> {
        let verifier = self.config.verifier();
        let conn = id.to_string();
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];
        loop {
            if let Some(payload) = framer.next_frame()? {
                let record = verifier.verify_frame(&payload)?;
                tracing::debug!(
                    "[{}] Handshake verified (version={:?}, signed={})",
                    id,
                    record.protocol_version,
                    record.is_signed()
                );
                return Ok(record);
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(HandshakeError::Malformed("peer closed before handshake".into()).into());
            }
            if let Some(t) = &self.config.telemetry {
                t.record_read(&conn, n);
            }
            framer.extend(&buf[..n]);
        }
    }

    async fn register(
        self: Arc<Self>,
        id: ConnectionId,
        remote_addr: SocketAddr,
        admitted: Admitted,
    ) {
        let Admitted {
            stream,
            framer,
            handshake,
        } = admitted;
        let tls = if stream.is_tls() { " (TLS)" } else { "" };

        // Answers a client that sends a handshake nobody asked for
        let reply = if self.config.handshake_enabled() {
            None
        } else {
            match self.config.handshake_reply(&framer) {
                Ok(reply) => Some(reply),
                Err(e) => {
                    tracing::warn!("Cannot encode handshake reply: {}", e);
                    None
                }
            }
        };

        let info = ConnectionInfo {
            id,
            remote_addr,
            handshake: handshake.clone(),
        };
        let (handle, outbound, control) =
            ConnectionHandle::new(info, self.config.max_backpressure_bytes);
        let (reader, writer) = tokio::io::split(stream);
        let writer = tokio::spawn(write_loop(
            writer,
            outbound,
            WriteContext {
                id,
                shared: handle.shared(),
                threshold: handle.threshold,
                events: self.events.clone(),
                telemetry: self.config.telemetry.clone(),
            },
        ));

        if let Some(t) = &self.config.telemetry {
            t.connection_opened(&id.to_string());
        }
        self.registry.insert(handle.clone());
        tracing::info!("Client connected: {} ({}){}", remote_addr, id, tls);
        self.emit(ServerEvent::Connection {
            id,
            remote_addr,
            handshake,
        });

        // Shutdown may have swept the registry before this insert
        if *self.stop.borrow() {
            handle.request_close();
        }

        let session = Session {
            handle,
            framer,
            reply,
            events: self.events.clone(),
            telemetry: self.config.telemetry.clone(),
            registry: self.registry.clone(),
            idle_timeout: self.config.idle_timeout,
            read_buffer_size: self.config.read_buffer_size,
        };
        session.run(reader, writer, control).await;
    }
}
