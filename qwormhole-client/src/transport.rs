//! Transport capability abstraction.
//!
//! A capability is the minimal surface the connection driver needs from a
//! socket implementation: connect, send (possibly partial), receive and
//! close. The TCP fallback lives in [`crate::tcp`]; accelerated backends
//! plug in through the same trait. A [`TransportSelector`] picks one
//! capability once, at construction.

use crate::config::TlsClientConfig;
use crate::error::ClientError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Where a capability sits in the selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Accelerated,
    Fallback,
}

/// Caller preference for backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportPreference {
    /// First available accelerated backend, else the fallback.
    #[default]
    Auto,
    FallbackOnly,
}

/// Parameters for a single connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsClientConfig>,
    pub interface_name: Option<String>,
    pub local_address: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|t| t.enabled).unwrap_or(false)
    }
}

/// Inbound half of a connected transport.
#[async_trait]
pub trait TransportReader: Send {
    /// Waits for up to `max_bytes`. An empty result means end of stream.
    async fn poll_receive(&mut self, max_bytes: usize) -> io::Result<Bytes>;
}

/// Outbound half of a connected transport.
#[async_trait]
pub trait TransportWriter: Send {
    /// Writes a prefix of `bytes` and returns its length. May be shorter
    /// than `bytes` when the socket cannot take everything at once.
    async fn send(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Shuts the outbound direction down.
    async fn close(&mut self) -> io::Result<()>;
}

/// A connected transport, split into independently owned halves.
pub struct TransportChannel {
    pub reader: Box<dyn TransportReader>,
    pub writer: Box<dyn TransportWriter>,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// A socket implementation usable by the connection driver.
#[async_trait]
pub trait TransportCapability: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn kind(&self) -> TransportKind;

    /// Probed once by the selector.
    fn is_available(&self) -> bool {
        true
    }

    fn supports_tls(&self) -> bool;

    async fn connect(&self, options: &ConnectOptions) -> Result<TransportChannel, ClientError>;
}

/// Chooses the capability used for every connection of a client.
#[derive(Clone)]
pub struct TransportSelector {
    selected: Arc<dyn TransportCapability>,
    preference: TransportPreference,
}

impl TransportSelector {
    /// Resolves the capability now. Accelerated candidates are tried in
    /// order; the fallback is used when none is available or the
    /// preference excludes them.
    pub fn new(
        accelerated: Vec<Arc<dyn TransportCapability>>,
        fallback: Arc<dyn TransportCapability>,
        preference: TransportPreference,
    ) -> Self {
        let selected = match preference {
            TransportPreference::FallbackOnly => fallback,
            TransportPreference::Auto => accelerated
                .into_iter()
                .find(|c| {
                    let available = c.is_available();
                    if !available {
                        tracing::debug!("Transport '{}' unavailable, skipping", c.name());
                    }
                    available
                })
                .unwrap_or(fallback),
        };
        tracing::debug!(
            "Selected transport '{}' ({:?})",
            selected.name(),
            selected.kind()
        );
        Self {
            selected,
            preference,
        }
    }

    /// Selector that always uses plain TCP.
    pub fn tcp() -> Self {
        Self::new(
            Vec::new(),
            Arc::new(crate::tcp::TcpTransport::new()),
            TransportPreference::Auto,
        )
    }

    pub fn selected(&self) -> Arc<dyn TransportCapability> {
        self.selected.clone()
    }

    pub fn name(&self) -> &'static str {
        self.selected.name()
    }

    pub fn kind(&self) -> TransportKind {
        self.selected.kind()
    }

    pub fn preference(&self) -> TransportPreference {
        self.preference
    }
}

impl Default for TransportSelector {
    fn default() -> Self {
        Self::tcp()
    }
}

impl std::fmt::Debug for TransportSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSelector")
            .field("selected", &self.selected.name())
            .field("preference", &self.preference)
            .finish()
    }
}

/// [`TransportReader`] over any tokio reader.
pub struct StreamReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin + Send> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> TransportReader for StreamReader<R> {
    async fn poll_receive(&mut self, max_bytes: usize) -> io::Result<Bytes> {
        if self.buf.len() < max_bytes {
            self.buf.resize(max_bytes, 0);
        }
        let n = self.inner.read(&mut self.buf[..max_bytes]).await?;
        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }
}

/// [`TransportWriter`] over any tokio writer.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> TransportWriter for StreamWriter<W> {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(bytes).await?;
        self.inner.flush().await?;
        Ok(n)
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
