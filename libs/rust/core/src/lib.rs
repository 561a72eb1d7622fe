//! Shared service plumbing for the model sync sidecar.
//!
//! Tracing setup, layered configuration loading, health/readiness state and the
//! HTTP surface an orchestration platform probes. Nothing here is global apart
//! from the tracing subscriber itself: health and metrics live in explicit
//! structs that the service constructs once and hands around.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub mod health;
pub mod lifecycle;
mod server;
pub mod settings;

pub use health::{HealthState, StatusSnapshot};
pub use lifecycle::{StartupPhase, StartupState};
pub use server::start_health_server;
pub use settings::load_layered;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Env var switching the fmt layer to flattened JSON lines.
pub const JSON_LOG_ENV: &str = "SYNC_JSON_LOG";

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
/// Calling this more than once is a no-op.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var(JSON_LOG_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_level))?;
        let json_layer = json.then(|| {
            fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
        });
        let text_layer = (!json).then(|| {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
        });
        tracing_subscriber::registry()
            .with(filter)
            .with(json_layer)
            .with(text_layer)
            .try_init()?;
        Ok(())
    })?;
    info!(target: "sync_core", service, "tracing initialized");
    Ok(())
}

/// Resolve once SIGINT or SIGTERM arrives, then cancel `token`.
pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error=?e, "ctrl_c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error=?e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received_sigint"),
        _ = terminate => info!("received_sigterm"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}
