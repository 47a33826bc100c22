//! Per-connection driver.
//!
//! Each registered connection runs two tasks: the session loop, which reads
//! and decodes inbound frames and reacts to control requests, and the write
//! loop, which owns the write half and flushes queued frames in order.

use crate::error::ServerError;
use crate::registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionShared, Control, Outbound,
};
use crate::server::ServerEvent;
use bytes::Bytes;
use qwormhole_core::Telemetry;
use qwormhole_protocol::{ControlMessage, FrameEvent, Framer};
use std::io;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long a closing connection may take to flush its queue.
pub const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

enum Ending {
    PeerClosed,
    Closed,
    Failed(ServerError),
}

/// Reader side of one connection.
pub(crate) struct Session {
    pub handle: ConnectionHandle,
    pub framer: Framer,
    /// Reply for a client that opens with a handshake the server did not ask for.
    pub reply: Option<Bytes>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub telemetry: Option<Arc<Telemetry>>,
    pub registry: Arc<ConnectionRegistry>,
    pub idle_timeout: Option<Duration>,
    pub read_buffer_size: usize,
}

impl Session {
    fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn run<R>(
        mut self,
        mut reader: R,
        mut writer: JoinHandle<io::Result<()>>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) where
        R: AsyncRead + Unpin,
    {
        let conn = self.id().to_string();
        let mut buf = vec![0u8; self.read_buffer_size.max(1)];
        let mut first_frame = true;
        let mut idle_deadline = self.idle_timeout.map(|d| Instant::now() + d);

        // Frames that arrived together with the handshake
        let ending = match self.on_chunk(&conn, &[], &mut first_frame) {
            Err(e) => Ending::Failed(e),
            Ok(()) => loop {
                tokio::select! {
                    biased;

                    request = control.recv() => match request {
                        Some(Control::Overflow { queued }) => {
                            let threshold = self.handle.threshold;
                            tracing::warn!(
                                "[{}] Outbound queue {} bytes over limit {}, dropping connection",
                                self.handle.info.remote_addr,
                                queued,
                                threshold
                            );
                            if let Some(t) = &self.telemetry {
                                t.backpressure_events.inc();
                            }
                            self.emit(ServerEvent::Backpressure {
                                connection_id: self.id(),
                                queued_bytes: queued,
                                threshold,
                            });
                            break Ending::Failed(ServerError::Backpressure { queued, threshold });
                        }
                        Some(Control::Close) | None => {
                            break self.drain(&mut writer).await;
                        }
                    },

                    result = &mut writer => {
                        break match result {
                            Ok(Ok(())) => Ending::Closed,
                            Ok(Err(e)) => Ending::Failed(e.into()),
                            Err(e) => Ending::Failed(ServerError::TaskFailed(e.to_string())),
                        };
                    }

                    result = reader.read(&mut buf) => match result {
                        Ok(0) => break Ending::PeerClosed,
                        Ok(n) => {
                            tracing::debug!(
                                "[{}] Received {} bytes",
                                self.handle.info.remote_addr,
                                n
                            );
                            if let Some(t) = &self.telemetry {
                                t.record_read(&conn, n);
                            }
                            idle_deadline = self.idle_timeout.map(|d| Instant::now() + d);
                            if let Err(e) = self.on_chunk(&conn, &buf[..n], &mut first_frame) {
                                break Ending::Failed(e);
                            }
                        }
                        Err(e) => break Ending::Failed(e.into()),
                    },

                    _ = sleep_until(idle_deadline) => {
                        break Ending::Failed(ServerError::Timeout("idle connection"));
                    }
                }
            },
        };

        if !writer.is_finished() {
            writer.abort();
        }
        self.teardown(&conn, ending);
    }

    fn on_chunk(
        &mut self,
        conn: &str,
        chunk: &[u8],
        first_frame: &mut bool,
    ) -> Result<(), ServerError> {
        for event in self.framer.push(chunk) {
            let payload = match event {
                FrameEvent::Payload(payload) => payload,
                FrameEvent::Error(e) => return Err(e.into()),
            };
            if let Some(t) = &self.telemetry {
                t.record_frame_in(conn);
            }
            let reply = if std::mem::take(first_frame) {
                self.reply.take()
            } else {
                None
            };

            match ControlMessage::parse(&payload) {
                Ok(Some(ControlMessage::Heartbeat(hb))) => {
                    tracing::trace!("[{}] Heartbeat (ts={})", self.id(), hb.ts);
                }
                Ok(Some(ControlMessage::Handshake(_))) => match reply {
                    Some(reply) => {
                        tracing::debug!("[{}] Answering unsolicited handshake", self.id());
                        self.handle.enqueue(reply)?;
                    }
                    None => tracing::debug!("[{}] Ignoring repeated handshake", self.id()),
                },
                _ => self.emit(ServerEvent::Message {
                    connection_id: self.id(),
                    payload,
                }),
            }
        }
        Ok(())
    }

    /// Flushes everything queued before the close request, then shuts the
    /// socket down.
    async fn drain(&self, writer: &mut JoinHandle<io::Result<()>>) -> Ending {
        tracing::debug!(
            "[{}] Closing, {} bytes queued",
            self.id(),
            self.handle.queued_bytes()
        );
        self.handle.finish();
        match tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(Ok(()))) => Ending::Closed,
            Ok(Ok(Err(e))) => Ending::Failed(e.into()),
            Ok(Err(e)) => Ending::Failed(ServerError::TaskFailed(e.to_string())),
            Err(_) => Ending::Failed(ServerError::Timeout("close drain")),
        }
    }

    fn teardown(&self, conn: &str, ending: Ending) {
        let id = self.id();
        let remote_addr = self.handle.info.remote_addr;
        let had_error = match ending {
            Ending::PeerClosed => {
                tracing::debug!("[{}] Connection closed by client", remote_addr);
                false
            }
            Ending::Closed => false,
            Ending::Failed(e) => {
                let class = e.class();
                tracing::debug!("[{}] Connection error: {}", remote_addr, e);
                if let Some(t) = &self.telemetry {
                    t.record_error(class);
                }
                self.emit(ServerEvent::Error {
                    connection_id: Some(id),
                    class,
                    message: e.to_string(),
                });
                true
            }
        };

        self.registry.remove(&id);
        if let Some(t) = &self.telemetry {
            t.connection_closed(conn);
        }
        tracing::info!("Client disconnected: {} ({})", remote_addr, id);
        self.emit(ServerEvent::ClientClosed {
            connection_id: id,
            had_error,
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// State the write loop reports backpressure through.
pub(crate) struct WriteContext {
    pub id: ConnectionId,
    pub shared: Arc<ConnectionShared>,
    pub threshold: usize,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    pub telemetry: Option<Arc<Telemetry>>,
}

impl WriteContext {
    fn stalled(&self) {
        if self.shared.backpressured.swap(true, Ordering::AcqRel) {
            return;
        }
        let queued_bytes = self.shared.queued_bytes.load(Ordering::Acquire);
        tracing::debug!("[{}] Write stalled, {} bytes queued", self.id, queued_bytes);
        if let Some(t) = &self.telemetry {
            t.backpressure_events.inc();
        }
        let _ = self.events.send(ServerEvent::Backpressure {
            connection_id: self.id,
            queued_bytes,
            threshold: self.threshold,
        });
    }

    fn written(&self, len: usize) {
        let before = self.shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
        if before == len && self.shared.backpressured.swap(false, Ordering::AcqRel) {
            tracing::debug!("[{}] Outbound queue drained", self.id);
            if let Some(t) = &self.telemetry {
                t.drain_events.inc();
            }
            let _ = self.events.send(ServerEvent::Drain {
                connection_id: self.id,
            });
        }
    }
}

/// Writes queued frames in order until `Finish` arrives or the queue closes.
pub(crate) async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ctx: WriteContext,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let conn = ctx.id.to_string();
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => {
                write_frame(&mut writer, &frame, &ctx, &conn).await?;
                if let Some(t) = &ctx.telemetry {
                    t.record_frame_out(&conn);
                }
                ctx.written(frame.len());
            }
            Outbound::Finish => {
                writer.flush().await?;
                if let Err(e) = writer.shutdown().await {
                    tracing::debug!("[{}] Shutdown after drain failed: {}", ctx.id, e);
                }
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Writes one frame. A write that returns pending or accepts only part of
/// the frame marks the connection backpressured.
async fn write_frame<W>(
    writer: &mut W,
    frame: &[u8],
    ctx: &WriteContext,
    conn: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut offset = 0;
    while offset < frame.len() {
        let rest = &frame[offset..];
        let n = std::future::poll_fn(|cx| {
            let poll = Pin::new(&mut *writer).poll_write(cx, rest);
            if poll.is_pending() {
                ctx.stalled();
            }
            poll
        })
        .await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket accepted no bytes",
            ));
        }
        offset += n;
        if let Some(t) = &ctx.telemetry {
            t.record_write(conn, n);
        }
        if offset < frame.len() {
            ctx.stalled();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionInfo;
    use qwormhole_protocol::{ErrorClass, FramingMode};
    use tokio::io::AsyncWriteExt;

    fn context(
        threshold: usize,
    ) -> (
        WriteContext,
        Arc<ConnectionShared>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ConnectionShared::default());
        let ctx = WriteContext {
            id: ConnectionId::new(),
            shared: shared.clone(),
            threshold,
            events,
            telemetry: Some(Arc::new(Telemetry::new().unwrap())),
        };
        (ctx, shared, rx)
    }

    #[tokio::test]
    async fn test_whole_writes_do_not_backpressure() {
        let (ctx, shared, mut events) = context(100);
        shared.queued_bytes.store(4, Ordering::Release);
        let mut mock = tokio_test::io::Builder::new().write(b"abcd").build();

        write_frame(&mut mock, b"abcd", &ctx, "c").await.unwrap();
        ctx.written(4);

        assert!(!shared.backpressured.load(Ordering::Acquire));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_write_backpressures_then_drains() {
        let (ctx, shared, mut events) = context(100);
        shared.queued_bytes.store(6, Ordering::Release);
        let mut mock = tokio_test::io::Builder::new()
            .write(b"abc")
            .write(b"def")
            .build();

        write_frame(&mut mock, b"abcdef", &ctx, "c").await.unwrap();
        assert!(shared.backpressured.load(Ordering::Acquire));
        assert!(matches!(
            events.try_recv(),
            Ok(ServerEvent::Backpressure {
                queued_bytes: 6,
                threshold: 100,
                ..
            })
        ));

        ctx.written(6);
        assert!(matches!(events.try_recv(), Ok(ServerEvent::Drain { .. })));
        assert!(!shared.backpressured.load(Ordering::Acquire));
        let snapshot = ctx.telemetry.as_ref().unwrap().snapshot();
        assert_eq!(snapshot.backpressure_events, 1);
        assert_eq!(snapshot.drain_events, 1);
    }

    #[tokio::test]
    async fn test_write_loop_finish_flushes_in_order() {
        let (ctx, shared, _events) = context(100);
        shared.queued_bytes.store(4, Ordering::Release);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Outbound::Frame(Bytes::from_static(b"ab"))).unwrap();
        tx.send(Outbound::Frame(Bytes::from_static(b"cd"))).unwrap();
        tx.send(Outbound::Finish).unwrap();
        tx.send(Outbound::Frame(Bytes::from_static(b"never"))).unwrap();

        let mock = tokio_test::io::Builder::new().write(b"ab").write(b"cd").build();
        write_loop(mock, rx, ctx).await.unwrap();
        assert_eq!(shared.queued_bytes.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_write_loop_reports_errors() {
        let (ctx, _shared, _events) = context(100);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Outbound::Frame(Bytes::from_static(b"ab"))).unwrap();

        let mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let err = write_loop(mock, rx, ctx).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    struct Harness {
        handle: ConnectionHandle,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        registry: Arc<ConnectionRegistry>,
        task: JoinHandle<()>,
        client: tokio::io::DuplexStream,
    }

    fn start(threshold: usize, reply: Option<Bytes>, idle: Option<Duration>) -> Harness {
        start_with(Framer::new(FramingMode::LengthPrefixed, 1024), threshold, reply, idle)
    }

    fn start_with(
        framer: Framer,
        threshold: usize,
        reply: Option<Bytes>,
        idle: Option<Duration>,
    ) -> Harness {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);
        let (events_tx, events) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, outbound, control) = ConnectionHandle::new(
            ConnectionInfo {
                id: ConnectionId::new(),
                remote_addr: "127.0.0.1:6000".parse().unwrap(),
                handshake: None,
            },
            threshold,
        );
        registry.insert(handle.clone());

        let writer = tokio::spawn(write_loop(
            writer,
            outbound,
            WriteContext {
                id: handle.id(),
                shared: handle.shared(),
                threshold,
                events: events_tx.clone(),
                telemetry: None,
            },
        ));
        let session = Session {
            handle: handle.clone(),
            framer,
            reply,
            events: events_tx,
            telemetry: None,
            registry: registry.clone(),
            idle_timeout: idle,
            read_buffer_size: 512,
        };
        let task = tokio::spawn(session.run(reader, writer, control));
        Harness {
            handle,
            events,
            registry,
            task,
            client,
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        Framer::length_prefixed().encode(payload).unwrap().to_vec()
    }

    async fn read_frame(stream: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let len = stream.read_u32().await.unwrap() as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    #[tokio::test]
    async fn test_messages_delivered_and_heartbeats_swallowed() {
        let mut h = start(1024, None, None);
        let mut bytes = frame(br#"{"type":"heartbeat","ts":1}"#);
        bytes.extend(frame(b"hello"));
        bytes.extend(frame(br#"{"type":"handshake","version":"1"}"#));
        // Split mid-header
        h.client.write_all(&bytes[..3]).await.unwrap();
        h.client.write_all(&bytes[3..]).await.unwrap();

        match h.events.recv().await.unwrap() {
            ServerEvent::Message { payload, .. } => assert_eq!(payload.as_ref(), b"hello"),
            other => panic!("unexpected {:?}", other),
        }

        drop(h.client);
        h.task.await.unwrap();
        assert!(matches!(
            h.events.recv().await.unwrap(),
            ServerEvent::ClientClosed {
                had_error: false,
                ..
            }
        ));
        assert_eq!(h.registry.len(), 0);
    }

    #[tokio::test]
    async fn test_writer_panic_is_unknown_error() {
        let (_client, server) = tokio::io::duplex(1024);
        let (reader, _writer) = tokio::io::split(server);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, _outbound, control) = ConnectionHandle::new(
            ConnectionInfo {
                id: ConnectionId::new(),
                remote_addr: "127.0.0.1:6000".parse().unwrap(),
                handshake: None,
            },
            1024,
        );
        registry.insert(handle.clone());

        let writer: JoinHandle<io::Result<()>> = tokio::spawn(async { panic!("writer crashed") });
        let session = Session {
            handle,
            framer: Framer::length_prefixed(),
            reply: None,
            events: events_tx,
            telemetry: None,
            registry: registry.clone(),
            idle_timeout: None,
            read_buffer_size: 512,
        };
        session.run(reader, writer, control).await;

        match events.recv().await.unwrap() {
            ServerEvent::Error { class, message, .. } => {
                assert_eq!(class, ErrorClass::Unknown);
                assert!(message.contains("connection task failed"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            ServerEvent::ClientClosed {
                had_error: true,
                ..
            }
        ));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_frames_buffered_behind_handshake_delivered() {
        let mut framer = Framer::new(FramingMode::LengthPrefixed, 1024);
        framer.extend(&frame(b"early"));
        let mut h = start_with(framer, 1024, None, None);

        // Nothing else is written by the peer
        match tokio::time::timeout(Duration::from_secs(5), h.events.recv()).await {
            Ok(Some(ServerEvent::Message { payload, .. })) => {
                assert_eq!(payload.as_ref(), b"early")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_handshake_answered_once() {
        let reply = Bytes::from(frame(br#"{"type":"handshake"}"#));
        let mut h = start(1024, Some(reply), None);
        h.client
            .write_all(&frame(br#"{"type":"handshake","version":"1"}"#))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut h.client).await, br#"{"type":"handshake"}"#);

        h.client.write_all(&frame(b"after")).await.unwrap();
        assert!(matches!(
            h.events.recv().await.unwrap(),
            ServerEvent::Message { .. }
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_connection() {
        let mut h = start(1024, None, None);
        h.client.write_all(&4096u32.to_be_bytes()).await.unwrap();
        h.task.await.unwrap();

        match h.events.recv().await.unwrap() {
            ServerEvent::Error {
                connection_id,
                class,
                ..
            } => {
                assert_eq!(connection_id, Some(h.handle.id()));
                assert_eq!(class, qwormhole_protocol::ErrorClass::Protocol);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            h.events.recv().await.unwrap(),
            ServerEvent::ClientClosed {
                had_error: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_close_drains_queued_frames() {
        let mut h = start(1024, None, None);
        h.handle.enqueue(Bytes::from(frame(b"one"))).unwrap();
        h.handle.enqueue(Bytes::from(frame(b"two"))).unwrap();
        assert!(h.handle.request_close());

        assert_eq!(read_frame(&mut h.client).await, b"one");
        assert_eq!(read_frame(&mut h.client).await, b"two");
        let mut rest = Vec::new();
        h.client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        h.task.await.unwrap();
        assert!(matches!(
            h.events.recv().await.unwrap(),
            ServerEvent::ClientClosed {
                had_error: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_overflow_emits_backpressure_before_close() {
        let mut h = start(8, None, None);
        let _ = h.handle.enqueue(Bytes::from_static(b"0123456789"));
        h.task.await.unwrap();

        let mut saw_backpressure = false;
        loop {
            match h.events.recv().await.unwrap() {
                ServerEvent::Backpressure { threshold, .. } => {
                    assert_eq!(threshold, 8);
                    saw_backpressure = true;
                }
                ServerEvent::Error { class, .. } => {
                    assert_eq!(class, qwormhole_protocol::ErrorClass::Resource);
                }
                ServerEvent::ClientClosed { had_error, .. } => {
                    assert!(had_error);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(saw_backpressure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let mut h = start(1024, None, Some(Duration::from_secs(30)));
        h.task.await.unwrap();
        match h.events.recv().await.unwrap() {
            ServerEvent::Error { message, .. } => assert!(message.contains("idle")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
