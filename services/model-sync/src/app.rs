//! Process wiring: build the components from [`Settings`], walk the startup
//! phases, then hand control to the poll loop.

use crate::metrics::SyncMetrics;
use crate::orchestrator::{startup_check, SyncOptions, SyncOrchestrator};
use crate::serving::ServingConfigStore;
use crate::settings::Settings;
use crate::store::{ObjectStore, ObjectStoreClient, S3Store};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{start_health_server, HealthState, StartupPhase};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Startup checks, initial cycle, then poll until shutdown.
    Daemon,
    /// Startup checks and a single cycle.
    Once,
    /// Startup checks only.
    HealthCheckOnly,
}

/// Liveness grace: three missed cycles plus a minute for slow downloads.
pub fn stale_after(interval: Duration) -> Duration { interval * 3 + Duration::from_secs(60) }

pub async fn run(settings: Settings, mode: RunMode, shutdown: CancellationToken) -> Result<bool> {
    let backend: Arc<dyn ObjectStore> = Arc::new(S3Store::new(&settings.store));
    run_with_store(settings, mode, backend, shutdown).await
}

/// Returns `Ok(true)` when the run ended healthy: checks passed and, in
/// `Once` mode, every discovered model synced. Startup failures are errors.
pub async fn run_with_store(
    settings: Settings,
    mode: RunMode,
    backend: Arc<dyn ObjectStore>,
    shutdown: CancellationToken,
) -> Result<bool> {
    let metrics = Arc::new(SyncMetrics::new().context("registering metrics")?);
    let options = SyncOptions::from_settings(&settings);
    let health = HealthState::new(stale_after(options.interval));

    if mode == RunMode::Daemon && settings.health.port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.health.port));
        start_health_server(addr, health.clone(), metrics.registry().clone(), shutdown.clone())
            .await
            .with_context(|| format!("binding health server on {addr}"))?;
    }

    health.advance_to(StartupPhase::HealthCheck);
    let client = ObjectStoreClient::new(backend, metrics.clone());
    if let Err(e) = startup_check(&client, &options, &settings.serving.config_path).await {
        error!(error=%e, "startup_health_check_failed");
        health.mark_not_live();
        if mode == RunMode::HealthCheckOnly {
            return Ok(false);
        }
        return Err(e).context("startup health check");
    }
    info!("startup health check passed");
    if mode == RunMode::HealthCheckOnly {
        return Ok(true);
    }

    let serving = ServingConfigStore::open(&settings.serving.config_path, settings.serving.discovery_path())
        .context("loading serving config")?;
    let orchestrator = SyncOrchestrator::new(client, serving, options, metrics);

    health.advance_to(StartupPhase::InitialSync);
    let initial = orchestrator.run_cycle(&health).await;
    if mode == RunMode::Once {
        return Ok(initial.map_or(false, |r| r.all_succeeded()));
    }

    health.advance_to(StartupPhase::Polling);
    orchestrator.run(&health, shutdown).await;
    info!("model sync stopped");
    Ok(true)
}
