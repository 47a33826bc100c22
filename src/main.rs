//! qwormhole - framed TCP transport daemon
//!
//! Runs an echo endpoint on the qwormhole server: every message a client
//! sends comes back prefixed with `echo:`.

use qwormhole_core::Telemetry;
use qwormhole_server::metrics::run_metrics_server;
use qwormhole_server::{Config, Server, ServerConfig, ServerEvent};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

const ECHO_PREFIX: &[u8] = b"echo:";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if QWORMHOLE_CONFIG is set, then env overrides)
    let config_path = std::env::var("QWORMHOLE_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // An explicit config file must load
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::warn!("Invalid environment configuration ({}), using defaults", e);
            Config::default()
        }
    };

    tracing::info!("Starting qwormhole server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Framing: {:?}", config.framing.mode);
    tracing::info!(
        "  Max frame / backpressure: {} / {} bytes",
        config.framing.max_frame_length,
        config.framing.max_backpressure_bytes
    );
    if config.handshake.is_enabled() {
        tracing::info!(
            "  Handshake: required (version={:?}, signed={})",
            config.handshake.protocol_version,
            config.handshake.require_signed
        );
    } else {
        tracing::info!("  Handshake: optional");
    }
    if config.tls.enabled {
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let telemetry = Arc::new(Telemetry::new()?);
    let server_config = ServerConfig::from_config(&config)?.with_telemetry(telemetry.clone());
    let (server, mut events) = Server::new(server_config);

    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let addr = config.metrics.bind_addr;
        let telemetry = telemetry.clone();
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, telemetry, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let bind = config.network.bind_addr;
    server.listen(&bind.ip().to_string(), bind.port()).await?;

    let echo = server.clone();
    let events_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handle_event(&echo, event);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping server...");
    server.shutdown().await;

    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }
    events_handle.abort();

    let stats = telemetry.snapshot();
    tracing::info!(
        "Server stopped ({} connections, {} bytes in, {} bytes out)",
        stats.connections_opened,
        stats.bytes_in,
        stats.bytes_out
    );
    Ok(())
}

fn handle_event(server: &Server, event: ServerEvent) {
    match event {
        ServerEvent::Message {
            connection_id,
            payload,
        } => {
            let mut reply = Vec::with_capacity(ECHO_PREFIX.len() + payload.len());
            reply.extend_from_slice(ECHO_PREFIX);
            reply.extend_from_slice(&payload);
            if let Err(e) = server.send_to(&connection_id, &reply) {
                tracing::debug!("[{}] Echo dropped: {}", connection_id, e);
            }
        }
        ServerEvent::Backpressure {
            connection_id,
            queued_bytes,
            threshold,
        } => {
            tracing::debug!(
                "[{}] Backpressure: {} of {} bytes queued",
                connection_id,
                queued_bytes,
                threshold
            );
        }
        ServerEvent::Error {
            connection_id: Some(id),
            class,
            message,
        } => tracing::warn!("[{}] {} error: {}", id, class, message),
        ServerEvent::Error {
            connection_id: None,
            class,
            message,
        } => tracing::warn!("{} error: {}", class, message),
        _ => {}
    }
}
