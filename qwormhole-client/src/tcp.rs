//! TCP fallback transport with optional TLS and local binding.

use crate::error::ClientError;
use crate::stream::ClientStream;
use crate::tls::build_connector;
use crate::transport::{
    ConnectOptions, StreamReader, StreamWriter, TransportCapability, TransportChannel,
    TransportKind,
};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, TcpSocket};

/// Plain tokio sockets. Always available.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

async fn resolve(options: &ConnectOptions) -> Result<SocketAddr, ClientError> {
    let addrs: Vec<SocketAddr> = lookup_host((options.host.as_str(), options.port))
        .await?
        .collect();

    // Match the address family of an explicit local address
    let wanted_v4 = options.local_address.map(|a| a.is_ipv4());
    addrs
        .iter()
        .find(|a| wanted_v4.map(|v4| a.is_ipv4() == v4).unwrap_or(true))
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| {
            ClientError::Configuration(format!("cannot resolve host '{}'", options.host))
        })
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_interface(socket: &TcpSocket, name: &str) -> Result<(), ClientError> {
    socket.bind_device(Some(name.as_bytes())).map_err(|e| {
        ClientError::Configuration(format!("cannot bind to interface '{}': {}", name, e))
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_interface(_socket: &TcpSocket, name: &str) -> Result<(), ClientError> {
    Err(ClientError::Configuration(format!(
        "binding to interface '{}' is not supported on this platform",
        name
    )))
}

#[async_trait]
impl TransportCapability for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    fn supports_tls(&self) -> bool {
        true
    }

    async fn connect(&self, options: &ConnectOptions) -> Result<TransportChannel, ClientError> {
        let addr = resolve(options).await?;
        tracing::debug!("Connecting to {} ({})", options.host, addr);

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(ref name) = options.interface_name {
            bind_interface(&socket, name)?;
        }

        if options.local_address.is_some() || options.local_port.is_some() {
            let ip = options.local_address.unwrap_or(if addr.is_ipv4() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            });
            let local = SocketAddr::new(ip, options.local_port.unwrap_or(0));
            socket.bind(local).map_err(|e| {
                ClientError::Configuration(format!("cannot bind local address {}: {}", local, e))
            })?;
        }

        let tcp = tokio::time::timeout(options.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| ClientError::Timeout("connect"))??;
        tcp.set_nodelay(true).ok();

        let stream = match options.tls.as_ref().filter(|t| t.enabled) {
            Some(tls) => {
                let (connector, server_name) = build_connector(tls, &options.host)?;
                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| ClientError::TlsHandshake(e.to_string()))?;
                tracing::debug!("TLS established with {}", addr);
                ClientStream::Tls {
                    stream: Box::new(tls_stream),
                }
            }
            None => ClientStream::Plain { stream: tcp },
        };

        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = tokio::io::split(stream);

        Ok(TransportChannel {
            reader: Box::new(StreamReader::new(read_half)),
            writer: Box::new(StreamWriter::new(write_half)),
            local_addr,
            peer_addr,
        })
    }
}
