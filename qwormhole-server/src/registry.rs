//! Live connection registry.
//!
//! The registry is the only state shared across connections. Inserts and
//! removals take the write lock; broadcast and lookups take the read lock.
//! Enqueueing never blocks: frames go onto an unbounded per-connection
//! queue whose byte total is checked against the backpressure threshold.

use crate::error::ServerError;
use bytes::Bytes;
use parking_lot::RwLock;
use qwormhole_protocol::HandshakeRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Server-assigned connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Public view of a registered connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub handshake: Option<HandshakeRecord>,
}

/// Items consumed by a connection's writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Bytes),
    /// Everything before this has been written; shut the socket down.
    Finish,
}

/// Requests delivered to a connection's driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Close,
    Overflow { queued: usize },
}

/// Counters shared by a connection's handle, driver and writer.
#[derive(Debug, Default)]
pub(crate) struct ConnectionShared {
    pub queued_bytes: AtomicUsize,
    pub backpressured: AtomicBool,
    pub closing: AtomicBool,
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub info: ConnectionInfo,
    pub threshold: usize,
    outbound: mpsc::UnboundedSender<Outbound>,
    control: mpsc::UnboundedSender<Control>,
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        info: ConnectionInfo,
        threshold: usize,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedReceiver<Control>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (control, control_rx) = mpsc::unbounded_channel();
        let handle = Self {
            info,
            threshold,
            outbound,
            control,
            shared: Arc::new(ConnectionShared::default()),
        };
        (handle, outbound_rx, control_rx)
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub(crate) fn shared(&self) -> Arc<ConnectionShared> {
        self.shared.clone()
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.shared.queued_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn is_backpressured(&self) -> bool {
        self.shared.backpressured.load(Ordering::Acquire)
    }

    /// Queues an encoded frame. Returns the queued byte total.
    ///
    /// Crossing the threshold marks the connection closing and asks its
    /// driver to tear it down.
    pub(crate) fn enqueue(&self, frame: Bytes) -> Result<usize, ServerError> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(ServerError::ConnectionClosing(self.id()));
        }

        let len = frame.len();
        let queued = self.shared.queued_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if queued > self.threshold {
            if !self.shared.closing.swap(true, Ordering::AcqRel) {
                let _ = self.control.send(Control::Overflow { queued });
            }
            return Err(ServerError::Backpressure {
                queued,
                threshold: self.threshold,
            });
        }

        self.outbound.send(Outbound::Frame(frame)).map_err(|_| {
            self.shared.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            ServerError::ConnectionClosing(self.id())
        })?;
        Ok(queued)
    }

    /// Stops new enqueues and asks the driver to drain and close.
    /// Returns `false` if the connection was already closing.
    pub(crate) fn request_close(&self) -> bool {
        if self.shared.closing.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.control.send(Control::Close);
        true
    }

    pub(crate) fn finish(&self) {
        let _ = self.outbound.send(Outbound::Finish);
    }
}

pub(crate) struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    count: watch::Sender<usize>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            connections: RwLock::new(HashMap::new()),
            count,
        }
    }

    pub(crate) fn insert(&self, handle: ConnectionHandle) {
        let mut connections = self.connections.write();
        connections.insert(handle.id(), handle);
        self.count.send_replace(connections.len());
    }

    pub(crate) fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write();
        let removed = connections.remove(id);
        self.count.send_replace(connections.len());
        removed
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.read().get(id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub(crate) fn infos(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .read()
            .values()
            .map(|h| h.info.clone())
            .collect();
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub(crate) fn handles(&self) -> Vec<ConnectionHandle> {
        self.connections.read().values().cloned().collect()
    }

    /// Enqueues `frame` on every connection. Returns how many accepted it.
    pub(crate) fn broadcast(&self, frame: &Bytes) -> usize {
        let connections = self.connections.read();
        connections
            .values()
            .filter(|handle| match handle.enqueue(frame.clone()) {
                Ok(_) => true,
                Err(e) => {
                    tracing::debug!("Broadcast skipped {}: {}", handle.id(), e);
                    false
                }
            })
            .count()
    }

    pub(crate) fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }
}
