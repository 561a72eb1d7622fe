use crate::health::HealthState;
use anyhow::Result;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct ProbeState {
    health: Arc<HealthState>,
    registry: Registry,
}

/// Serve `/live`, `/ready`, `/status` and `/metrics` until `shutdown` fires.
/// Returns the bound address, which matters when `addr` uses port 0.
pub async fn start_health_server(
    addr: SocketAddr,
    health: Arc<HealthState>,
    registry: Registry,
    shutdown: CancellationToken,
) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(ProbeState { health, registry });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    tracing::info!(addr=?bound, "health server listening");
    tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error=?e, "health server failed");
        }
    });
    Ok(bound)
}

fn probe(ok: bool, key: &'static str) -> Response {
    let code = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let mut body = serde_json::Map::new();
    body.insert(key.to_string(), ok.into());
    (code, Json(body)).into_response()
}

async fn live(State(st): State<ProbeState>) -> Response { probe(st.health.is_live(), "live") }

async fn ready(State(st): State<ProbeState>) -> Response { probe(st.health.is_ready(), "ready") }

async fn status(State(st): State<ProbeState>) -> Response { Json(st.health.snapshot()).into_response() }

async fn metrics(State(st): State<ProbeState>) -> Response {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&st.registry.gather(), &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response();
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], buf).into_response()
}
