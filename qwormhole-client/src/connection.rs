//! Connection driver.
//!
//! One tokio task owns a client's socket lifecycle and is the only producer
//! of its events:
//!
//! ```text
//! Idle -> Connecting -> (Handshaking) -> Ready -> Closing -> Closed
//!             \               \            \
//!              +---------------+------------+--> Reconnecting -> Connecting
//! ```
//!
//! Writes go through a separate writer task so a slow socket never stalls
//! reads, and a partially written frame is always finished from its unsent
//! remainder.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::{ConnectOptions, TransportCapability, TransportChannel, TransportWriter};
use bytes::Bytes;
use qwormhole_core::{Admission, RateLimiter, ReconnectState, Telemetry};
use qwormhole_protocol::handshake::{build_plain, build_signed};
use qwormhole_protocol::{
    ControlMessage, ErrorClass, FrameEvent, Framer, HandshakeError, HandshakeRecord, Heartbeat,
};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Lifecycle state of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Idle = 0,
    Connecting = 1,
    Handshaking = 2,
    Ready = 3,
    Reconnecting = 4,
    Closing = 5,
    Closed = 6,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Handshaking,
            3 => ConnectionState::Ready,
            4 => ConnectionState::Reconnecting,
            5 => ConnectionState::Closing,
            6 => ConnectionState::Closed,
            _ => ConnectionState::Idle,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// Events emitted by a client, in the order the driver observed them.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Socket connected, before any handshake.
    Connect {
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    },
    /// Connection usable. Carries the server's verified handshake.
    Ready { handshake: Option<HandshakeRecord> },
    Message { payload: Bytes },
    /// A connection ended. `terminal` means no reconnect will follow.
    Close { had_error: bool, terminal: bool },
    Error { class: ErrorClass, message: String },
    Reconnecting { attempt: u32, delay: Duration },
}

/// State shared between the driver, its writer task and the client handle.
#[derive(Debug)]
pub(crate) struct Shared {
    state: AtomicU8,
    draining: AtomicBool,
    pending_writes: AtomicUsize,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Idle as u8),
            draining: AtomicBool::new(false),
            pending_writes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            tracing::trace!(
                "Client state {:?} -> {:?}",
                ConnectionState::from_u8(prev),
                state
            );
        }
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn reset_writes(&self) {
        self.draining.store(false, Ordering::Release);
        self.pending_writes.store(0, Ordering::Release);
    }
}

pub(crate) type Completion = oneshot::Sender<Result<(), ClientError>>;

/// An application send waiting for the driver.
pub(crate) struct SendRequest {
    pub payload: Bytes,
    pub priority: i32,
    pub require_connected: bool,
    pub done: Completion,
}

pub(crate) enum Command {
    Send(SendRequest),
    Disconnect,
}

struct OutboundFrame {
    bytes: Bytes,
    done: Option<Completion>,
}

impl OutboundFrame {
    fn fail(self, error: ClientError) {
        if let Some(done) = self.done {
            let _ = done.send(Err(error));
        }
    }
}

struct Established {
    channel: TransportChannel,
    framer: Framer,
    limiter: Option<RateLimiter<OutboundFrame>>,
    handshake: Option<HandshakeRecord>,
}

enum Phase {
    Ready(Established),
    /// `connected` is set once `Connect` was emitted for the attempt.
    Failed {
        error: ClientError,
        connected: bool,
    },
    Disconnected,
}

enum SessionEnd {
    Disconnected,
    /// `None` is a clean end of stream from the peer.
    Lost(Option<ClientError>),
}

/// Per-connection write path.
struct Session {
    id: String,
    framer: Framer,
    limiter: Option<RateLimiter<OutboundFrame>>,
    frames: mpsc::UnboundedSender<OutboundFrame>,
    shared: Arc<Shared>,
}

impl Session {
    fn write(&self, frame: OutboundFrame) {
        self.shared.pending_writes.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(frame)) = self.frames.send(frame) {
            self.shared.pending_writes.fetch_sub(1, Ordering::AcqRel);
            frame.fail(ClientError::ConnectionClosed);
        }
    }

    fn drain_limiter(&mut self) {
        let admitted = match self.limiter.as_mut() {
            Some(limiter) => limiter.drain(Instant::now()),
            None => return,
        };
        for frame in admitted {
            self.write(frame);
        }
    }

    fn next_admission_at(&mut self) -> Option<tokio::time::Instant> {
        self.limiter
            .as_mut()
            .and_then(|l| l.next_admission_at(Instant::now()))
            .map(tokio::time::Instant::from_std)
    }
}

pub(crate) struct Driver {
    config: Arc<ClientConfig>,
    capability: Arc<dyn TransportCapability>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    shared: Arc<Shared>,
    telemetry: Option<Arc<Telemetry>>,
    reconnect: ReconnectState,
    backlog: VecDeque<SendRequest>,
    ready: Option<oneshot::Sender<Result<Option<HandshakeRecord>, ClientError>>>,
}

impl Driver {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        capability: Arc<dyn TransportCapability>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<ClientEvent>,
        shared: Arc<Shared>,
        telemetry: Option<Arc<Telemetry>>,
        ready: oneshot::Sender<Result<Option<HandshakeRecord>, ClientError>>,
    ) -> Self {
        let reconnect = ReconnectState::new(config.reconnect.clone());
        Self {
            config,
            capability,
            commands,
            events,
            shared,
            telemetry,
            reconnect,
            backlog: VecDeque::new(),
            ready: Some(ready),
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: &ClientError) {
        let class = error.class();
        tracing::warn!(
            "Connection to {}:{} failed ({}): {}",
            self.config.host,
            self.config.port,
            class,
            error
        );
        if let Some(t) = &self.telemetry {
            t.record_error(class);
        }
        self.emit(ClientEvent::Error {
            class,
            message: error.to_string(),
        });
    }

    /// Runs until the client disconnects or reconnects are exhausted.
    pub(crate) async fn run(mut self) {
        loop {
            let (attempt, delay) = match self.connect_phase().await {
                Phase::Disconnected => return self.finish(false),
                Phase::Failed { error, connected } => {
                    self.emit_error(&error);
                    let retry = self.schedule_retry(Some(&error));
                    if let Some(ready) = self.ready.take() {
                        let _ = ready.send(Err(error));
                    }
                    match retry {
                        Some(next) => {
                            if connected {
                                self.emit(ClientEvent::Close {
                                    had_error: true,
                                    terminal: false,
                                });
                            }
                            next
                        }
                        None => return self.finish(true),
                    }
                }
                Phase::Ready(established) => match self.run_session(established).await {
                    SessionEnd::Disconnected => return self.finish(false),
                    SessionEnd::Lost(error) => {
                        if let Some(ref e) = error {
                            self.emit_error(e);
                        }
                        let retry = self.schedule_retry(error.as_ref());
                        self.emit(ClientEvent::Close {
                            had_error: error.is_some(),
                            terminal: retry.is_none(),
                        });
                        match retry {
                            Some(next) => next,
                            None => {
                                self.shared.set_state(ConnectionState::Closed);
                                self.fail_backlog();
                                return;
                            }
                        }
                    }
                },
            };

            if !self.backoff(attempt, delay).await {
                return self.finish(false);
            }
        }
    }

    /// Returns the next attempt, or `None` when the failure is terminal.
    fn schedule_retry(&mut self, error: Option<&ClientError>) -> Option<(u32, Duration)> {
        if error.map(|e| !e.is_retryable()).unwrap_or(false) {
            return None;
        }
        self.reconnect.next_attempt()
    }

    /// Waits out a backoff delay. Returns `false` if the client disconnected.
    async fn backoff(&mut self, attempt: u32, delay: Duration) -> bool {
        self.shared.set_state(ConnectionState::Reconnecting);
        if let Some(t) = &self.telemetry {
            t.reconnect_attempts.inc();
        }
        tracing::info!(
            "Reconnecting to {}:{} (attempt {}, in {:?})",
            self.config.host,
            self.config.port,
            attempt,
            delay
        );
        self.emit(ClientEvent::Reconnecting { attempt, delay });

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Disconnect) => return false,
                    Some(Command::Send(req)) => self.hold(req),
                },
                _ = &mut sleep => return true,
            }
        }
    }

    /// Queues a send made while not ready.
    fn hold(&mut self, req: SendRequest) {
        if req.require_connected {
            let _ = req.done.send(Err(ClientError::NotConnected));
        } else {
            self.backlog.push_back(req);
        }
    }

    fn fail_backlog(&mut self) {
        for req in self.backlog.drain(..) {
            let _ = req.done.send(Err(ClientError::ConnectionClosed));
        }
    }

    /// Emits the terminal close and stops.
    fn finish(&mut self, had_error: bool) {
        self.shared.set_state(ConnectionState::Closing);
        self.fail_backlog();
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(ClientError::ConnectionClosed));
        }
        self.shared.set_state(ConnectionState::Closed);
        self.emit(ClientEvent::Close {
            had_error,
            terminal: true,
        });
        tracing::debug!("Client driver for {}:{} stopped", self.config.host, self.config.port);
    }

    async fn connect_phase(&mut self) -> Phase {
        self.shared.set_state(ConnectionState::Connecting);

        let connected = AtomicBool::new(false);
        let attempt = tokio::time::timeout(
            self.config.connect_timeout(),
            establish(
                self.config.clone(),
                self.capability.clone(),
                self.shared.clone(),
                self.events.clone(),
                self.telemetry.clone(),
                &connected,
            ),
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    None | Some(Command::Disconnect) => return Phase::Disconnected,
                    Some(Command::Send(req)) => self.hold(req),
                },
                res = &mut attempt => {
                    let error = match res {
                        Ok(Ok(established)) => return Phase::Ready(established),
                        Ok(Err(e)) => e,
                        Err(_) => ClientError::Timeout("connect"),
                    };
                    return Phase::Failed {
                        error,
                        connected: connected.load(Ordering::Acquire),
                    };
                }
            }
        }
    }

    fn enqueue(&self, session: &mut Session, req: SendRequest) {
        let bytes = match session.framer.encode(&req.payload) {
            Ok(b) => b,
            Err(e) => {
                let _ = req.done.send(Err(e.into()));
                return;
            }
        };
        let frame = OutboundFrame {
            bytes,
            done: Some(req.done),
        };

        match session.limiter.as_mut() {
            Some(limiter) => {
                let len = frame.bytes.len() as u64;
                if let Admission::Admitted(frame) =
                    limiter.submit(frame, len, req.priority, Instant::now())
                {
                    session.write(frame);
                }
            }
            None => session.write(frame),
        }
    }

    fn send_heartbeat(&self, session: &Session) {
        let encoded = ControlMessage::Heartbeat(Heartbeat::now())
            .to_vec()
            .map_err(ClientError::from)
            .and_then(|json| session.framer.encode(&json).map_err(ClientError::from));
        match encoded {
            Ok(bytes) => session.write(OutboundFrame { bytes, done: None }),
            Err(e) => tracing::warn!("Cannot encode heartbeat: {}", e),
        }
    }

    /// Decodes a chunk and emits its messages. Control frames are swallowed.
    fn deliver(&self, session: &mut Session, chunk: &[u8]) -> Result<(), ClientError> {
        for event in session.framer.push(chunk) {
            match event {
                FrameEvent::Payload(payload) => {
                    if let Some(t) = &self.telemetry {
                        t.record_frame_in(&session.id);
                    }
                    match ControlMessage::parse(&payload) {
                        Ok(Some(ControlMessage::Heartbeat(hb))) => {
                            tracing::trace!("Heartbeat from server (ts={})", hb.ts);
                        }
                        Ok(Some(ControlMessage::Handshake(_))) => {
                            tracing::debug!("Ignoring handshake frame on ready connection");
                        }
                        _ => self.emit(ClientEvent::Message { payload }),
                    }
                }
                FrameEvent::Error(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn run_session(&mut self, established: Established) -> SessionEnd {
        let Established {
            channel,
            framer,
            limiter,
            handshake,
        } = established;
        let TransportChannel {
            mut reader, writer, ..
        } = channel;

        let id = Uuid::new_v4().to_string();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (failed_tx, mut failed_rx) = oneshot::channel();

        self.shared.reset_writes();
        tokio::spawn(write_loop(
            writer,
            frames_rx,
            close_rx,
            failed_tx,
            self.shared.clone(),
            self.telemetry.clone(),
            id.clone(),
        ));

        let mut session = Session {
            id,
            framer,
            limiter,
            frames: frames_tx,
            shared: self.shared.clone(),
        };

        self.shared.set_state(ConnectionState::Ready);
        self.reconnect.reset();
        if let Some(t) = &self.telemetry {
            t.connection_opened(&session.id);
        }
        tracing::info!("Connected to {}:{}", self.config.host, self.config.port);
        self.emit(ClientEvent::Ready {
            handshake: handshake.clone(),
        });
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(handshake));
        }

        while let Some(req) = self.backlog.pop_front() {
            self.enqueue(&mut session, req);
        }

        let mut heartbeat = self.config.heartbeat_interval().map(|period| {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let idle = self.config.idle_timeout();
        let read_size = self.config.read_buffer_size;
        let mut last_inbound = tokio::time::Instant::now();

        // Frames that arrived together with the handshake reply
        let end = match self.deliver(&mut session, &[]) {
            Err(e) => SessionEnd::Lost(Some(e)),
            Ok(()) => loop {
                let drain_at = session.next_admission_at();
                let idle_at = idle.map(|d| last_inbound + d);

                tokio::select! {
                    biased;
                    cmd = self.commands.recv() => match cmd {
                        None | Some(Command::Disconnect) => break SessionEnd::Disconnected,
                        Some(Command::Send(req)) => self.enqueue(&mut session, req),
                    },
                    failed = &mut failed_rx => {
                        let error = match failed {
                            Ok(e) => ClientError::Io(e),
                            Err(_) => ClientError::ConnectionClosed,
                        };
                        break SessionEnd::Lost(Some(error));
                    }
                    read = reader.poll_receive(read_size) => match read {
                        Ok(chunk) if chunk.is_empty() => break SessionEnd::Lost(None),
                        Ok(chunk) => {
                            last_inbound = tokio::time::Instant::now();
                            if let Some(t) = &self.telemetry {
                                t.record_read(&session.id, chunk.len());
                            }
                            if let Err(e) = self.deliver(&mut session, &chunk) {
                                break SessionEnd::Lost(Some(e));
                            }
                        }
                        Err(e) => break SessionEnd::Lost(Some(ClientError::Io(e))),
                    },
                    _ = sleep_until(drain_at), if drain_at.is_some() => session.drain_limiter(),
                    _ = tick(&mut heartbeat), if heartbeat.is_some() => {
                        self.send_heartbeat(&session)
                    }
                    _ = sleep_until(idle_at), if idle_at.is_some() => {
                        break SessionEnd::Lost(Some(ClientError::Timeout("idle")));
                    }
                }
            },
        };

        self.shared.set_state(match end {
            SessionEnd::Disconnected => ConnectionState::Closing,
            SessionEnd::Lost(_) => ConnectionState::Reconnecting,
        });
        let _ = close_tx.send(());
        if let Some(limiter) = session.limiter.as_mut() {
            for frame in limiter.clear() {
                frame.fail(ClientError::ConnectionClosed);
            }
        }
        if let Some(t) = &self.telemetry {
            t.connection_closed(&session.id);
        }
        drop(session);
        self.shared.reset_writes();
        end
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Connects and, when configured, exchanges handshakes.
async fn establish(
    config: Arc<ClientConfig>,
    capability: Arc<dyn TransportCapability>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ClientEvent>,
    telemetry: Option<Arc<Telemetry>>,
    connected: &AtomicBool,
) -> Result<Established, ClientError> {
    let limiter = config
        .rate_limit()
        .map(|limit| RateLimiter::new(limit, Instant::now()))
        .transpose()?;

    let options = ConnectOptions {
        host: config.host.clone(),
        port: config.port,
        tls: config.tls.clone(),
        interface_name: config.interface_name.clone(),
        local_address: config.local_address,
        local_port: config.local_port,
        connect_timeout: config.connect_timeout(),
    };

    let mut channel = capability.connect(&options).await?;
    tracing::debug!(
        "Transport '{}' connected {:?} -> {:?}",
        capability.name(),
        channel.local_addr,
        channel.peer_addr
    );
    connected.store(true, Ordering::Release);
    let _ = events.send(ClientEvent::Connect {
        local_addr: channel.local_addr,
        peer_addr: channel.peer_addr,
    });

    let mut framer = Framer::new(config.framing, config.max_frame_length);
    let mut handshake = None;
    if config.handshake_enabled() {
        shared.set_state(ConnectionState::Handshaking);
        match exchange_handshake(&config, &mut channel, &mut framer, &shared).await {
            Ok(record) => handshake = Some(record),
            Err(e) => {
                if let Some(t) = &telemetry {
                    t.handshake_failures.inc();
                }
                let _ = channel.writer.close().await;
                return Err(e);
            }
        }
    }

    Ok(Established {
        channel,
        framer,
        limiter,
        handshake,
    })
}

/// Sends our handshake and verifies the server's reply.
async fn exchange_handshake(
    config: &ClientConfig,
    channel: &mut TransportChannel,
    framer: &mut Framer,
    shared: &Shared,
) -> Result<HandshakeRecord, ClientError> {
    let version = config.protocol_version.as_deref();
    let msg = match &config.identity {
        Some(identity) => build_signed(version, &config.handshake_tags, identity)?,
        None => build_plain(version, &config.handshake_tags),
    };
    let frame = framer.encode(&ControlMessage::Handshake(msg).to_vec()?)?;
    write_frame(channel.writer.as_mut(), &frame, shared, None, "").await?;

    let verifier = config.verifier();
    loop {
        if let Some(payload) = framer.next_frame()? {
            return Ok(verifier.verify_frame(&payload)?);
        }
        let chunk = channel.reader.poll_receive(config.read_buffer_size).await?;
        if chunk.is_empty() {
            // The server closes without replying when it rejects us
            return Err(HandshakeError::Rejected.into());
        }
        framer.extend(&chunk);
    }
}

/// Writes a whole frame, resuming after partial writes.
async fn write_frame(
    writer: &mut dyn TransportWriter,
    bytes: &[u8],
    shared: &Shared,
    telemetry: Option<&Telemetry>,
    conn_id: &str,
) -> io::Result<()> {
    let mut offset = 0;
    while offset < bytes.len() {
        let n = writer.send(&bytes[offset..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "transport accepted no bytes",
            ));
        }
        offset += n;
        if let Some(t) = telemetry {
            t.record_write(conn_id, n);
        }
        if offset < bytes.len() && !shared.draining.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                "Partial write ({} of {} bytes), draining",
                offset,
                bytes.len()
            );
            if let Some(t) = telemetry {
                t.backpressure_events.inc();
            }
        }
    }
    Ok(())
}

/// Owns the transport writer for one connection.
///
/// Frames are written strictly in channel order. A close signal wins over
/// queued frames; anything left in the channel is dropped, which fails its
/// completion.
async fn write_loop(
    mut writer: Box<dyn TransportWriter>,
    mut frames: mpsc::UnboundedReceiver<OutboundFrame>,
    mut close: oneshot::Receiver<()>,
    failed: oneshot::Sender<io::Error>,
    shared: Arc<Shared>,
    telemetry: Option<Arc<Telemetry>>,
    conn_id: String,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut close => break,
            frame = frames.recv() => match frame {
                Some(f) => f,
                None => break,
            },
        };

        if let Err(e) = write_frame(
            writer.as_mut(),
            &frame.bytes,
            &shared,
            telemetry.as_deref(),
            &conn_id,
        )
        .await
        {
            tracing::debug!("Write failed on {}: {}", conn_id, e);
            frame.fail(ClientError::ConnectionClosed);
            let _ = failed.send(e);
            return;
        }

        if let Some(t) = &telemetry {
            t.record_frame_out(&conn_id);
        }
        if shared.pending_writes.fetch_sub(1, Ordering::AcqRel) == 1
            && shared.draining.swap(false, Ordering::AcqRel)
        {
            tracing::debug!("Outbound queue drained on {}", conn_id);
            if let Some(t) = &telemetry {
                t.drain_events.inc();
            }
        }
        if let Some(done) = frame.done {
            let _ = done.send(Ok(()));
        }
    }
    let _ = writer.close().await;
}
