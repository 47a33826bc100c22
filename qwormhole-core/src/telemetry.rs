//! Passive counters for transport activity.
//!
//! Each [`Telemetry`] owns its own Prometheus registry so several clients
//! and servers in one process never share counters.

use dashmap::DashMap;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use qwormhole_protocol::ErrorClass;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct ConnectionCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

/// Byte and frame counts for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
}

/// Point-in-time view of every counter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connections_active: i64,
    pub backpressure_events: u64,
    pub drain_events: u64,
    pub reconnect_attempts: u64,
    pub handshake_failures: u64,
    pub protocol_errors: u64,
    pub per_connection: Vec<(String, ConnectionSnapshot)>,
}

/// Prometheus-backed telemetry aggregator.
pub struct Telemetry {
    registry: Registry,
    pub bytes_in: IntCounter,
    pub bytes_out: IntCounter,
    pub frames_in: IntCounter,
    pub frames_out: IntCounter,
    pub connections_opened: IntCounter,
    pub connections_closed: IntCounter,
    pub connections_active: IntGauge,
    pub backpressure_events: IntCounter,
    pub drain_events: IntCounter,
    pub reconnect_attempts: IntCounter,
    pub handshake_failures: IntCounter,
    /// Fatal connection errors by class.
    pub errors_total: IntCounterVec,
    connections: DashMap<String, ConnectionCounters>,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let c = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl Telemetry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_active = IntGauge::with_opts(Opts::new(
            "qwormhole_connections_active",
            "Number of currently open connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("qwormhole_errors_total", "Fatal connection errors by class"),
            &["class"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        Ok(Self {
            bytes_in: counter(&registry, "qwormhole_bytes_in_total", "Bytes read from sockets")?,
            bytes_out: counter(&registry, "qwormhole_bytes_out_total", "Bytes written to sockets")?,
            frames_in: counter(&registry, "qwormhole_frames_in_total", "Payloads decoded")?,
            frames_out: counter(&registry, "qwormhole_frames_out_total", "Payloads fully written")?,
            connections_opened: counter(
                &registry,
                "qwormhole_connections_opened_total",
                "Connections that became usable",
            )?,
            connections_closed: counter(
                &registry,
                "qwormhole_connections_closed_total",
                "Connections torn down",
            )?,
            backpressure_events: counter(
                &registry,
                "qwormhole_backpressure_total",
                "Writes that could not complete immediately",
            )?,
            drain_events: counter(
                &registry,
                "qwormhole_drain_total",
                "Outbound queues emptied after backpressure",
            )?,
            reconnect_attempts: counter(
                &registry,
                "qwormhole_reconnect_attempts_total",
                "Client reconnect attempts scheduled",
            )?,
            handshake_failures: counter(
                &registry,
                "qwormhole_handshake_failures_total",
                "Rejected or malformed handshakes",
            )?,
            connections_active,
            errors_total,
            registry,
            connections: DashMap::new(),
        })
    }

    pub fn connection_opened(&self, id: &str) {
        self.connections_opened.inc();
        self.connections_active.inc();
        self.connections.insert(id.to_string(), ConnectionCounters::default());
    }

    /// Records the teardown of a connection opened with
    /// [`Telemetry::connection_opened`]. Unknown ids are ignored.
    pub fn connection_closed(&self, id: &str) {
        if self.connections.remove(id).is_some() {
            self.connections_closed.inc();
            self.connections_active.dec();
        }
    }

    pub fn record_read(&self, id: &str, bytes: usize) {
        self.bytes_in.inc_by(bytes as u64);
        if let Some(c) = self.connections.get(id) {
            c.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn record_write(&self, id: &str, bytes: usize) {
        self.bytes_out.inc_by(bytes as u64);
        if let Some(c) = self.connections.get(id) {
            c.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn record_frame_in(&self, id: &str) {
        self.frames_in.inc();
        if let Some(c) = self.connections.get(id) {
            c.frames_in.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_frame_out(&self, id: &str) {
        self.frames_out.inc();
        if let Some(c) = self.connections.get(id) {
            c.frames_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_error(&self, class: ErrorClass) {
        self.errors_total
            .with_label_values(&[&class.to_string()])
            .inc();
    }

    pub fn protocol_errors(&self) -> u64 {
        self.errors_total
            .with_label_values(&[&ErrorClass::Protocol.to_string()])
            .get()
    }

    pub fn connection_stats(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.connections.get(id).map(|c| ConnectionSnapshot {
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            frames_in: c.frames_in.load(Ordering::Relaxed),
            frames_out: c.frames_out.load(Ordering::Relaxed),
        })
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let mut per_connection: Vec<(String, ConnectionSnapshot)> = self
            .connections
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    entry.key().clone(),
                    ConnectionSnapshot {
                        bytes_in: c.bytes_in.load(Ordering::Relaxed),
                        bytes_out: c.bytes_out.load(Ordering::Relaxed),
                        frames_in: c.frames_in.load(Ordering::Relaxed),
                        frames_out: c.frames_out.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        per_connection.sort_by(|a, b| a.0.cmp(&b.0));

        TelemetrySnapshot {
            bytes_in: self.bytes_in.get(),
            bytes_out: self.bytes_out.get(),
            frames_in: self.frames_in.get(),
            frames_out: self.frames_out.get(),
            connections_opened: self.connections_opened.get(),
            connections_closed: self.connections_closed.get(),
            connections_active: self.connections_active.get(),
            backpressure_events: self.backpressure_events.get(),
            drain_events: self.drain_events.get(),
            reconnect_attempts: self.reconnect_attempts.get(),
            handshake_failures: self.handshake_failures.get(),
            protocol_errors: self.protocol_errors(),
            per_connection,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("connections_active", &self.connections_active.get())
            .finish_non_exhaustive()
    }
}
