//! HTTP exporter for transport telemetry.
//!
//! Routes:
//! - `/metrics`: Prometheus text format
//! - `/health`, `/healthz`: liveness
//! - `/stats`: JSON snapshot, including per-connection counters

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use qwormhole_core::Telemetry;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Binds `addr` and serves telemetry until `shutdown` fires.
pub async fn run_metrics_server(
    addr: SocketAddr,
    telemetry: Arc<Telemetry>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);
    serve(listener, telemetry, shutdown).await;
    Ok(())
}

/// Serves telemetry on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    telemetry: Arc<Telemetry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let telemetry = telemetry.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                let response = route(req.uri().path(), &telemetry);
                                async move { Ok::<_, Infallible>(response) }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }
}

fn respond(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn route(path: &str, telemetry: &Telemetry) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match telemetry.encode() {
            Ok(body) => respond(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, body),
            Err(e) => {
                tracing::warn!("Cannot encode metrics: {}", e);
                respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                )
            }
        },
        "/health" | "/healthz" => respond(StatusCode::OK, "text/plain", "OK"),
        "/stats" => match serde_json::to_vec(&telemetry.snapshot()) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                e.to_string(),
            ),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}
