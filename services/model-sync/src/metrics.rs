//! Prometheus metrics for the sync loop. One registry per process, owned here
//! and exposed through the health server's `/metrics`.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

pub struct SyncMetrics {
    registry: Registry,
    pub cycles_total: IntCounter,
    pub cycle_panics_total: IntCounter,
    pub cycle_duration_seconds: Histogram,
    pub models_synced_total: IntCounter,
    pub model_failures_total: IntCounter,
    pub downloads_total: IntCounter,
    pub download_failures_total: IntCounter,
    pub download_bytes_total: IntCounter,
    pub config_saves_total: IntCounter,
    pub config_save_failures_total: IntCounter,
    pub rejected_keys_total: IntCounter,
    pub registered_models: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl SyncMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("model_sync_cycle_duration_seconds", "Wall time of one discover+sync+persist cycle")
                .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        )?;
        registry.register(Box::new(cycle_duration_seconds.clone()))?;
        let registered_models = IntGauge::new("model_sync_registered_models", "Models currently present in the serving config")?;
        registry.register(Box::new(registered_models.clone()))?;
        Ok(Self {
            cycles_total: counter(&registry, "model_sync_cycles_total", "Completed poll cycles")?,
            cycle_panics_total: counter(&registry, "model_sync_cycle_panics_total", "Poll cycles aborted by a panic")?,
            models_synced_total: counter(&registry, "model_sync_models_synced_total", "Model registrations written to the serving config")?,
            model_failures_total: counter(&registry, "model_sync_model_failures_total", "Per-model sync failures")?,
            downloads_total: counter(&registry, "model_sync_downloads_total", "Artifacts downloaded")?,
            download_failures_total: counter(&registry, "model_sync_download_failures_total", "Artifact downloads that failed")?,
            download_bytes_total: counter(&registry, "model_sync_download_bytes_total", "Bytes written by artifact downloads")?,
            config_saves_total: counter(&registry, "model_sync_config_saves_total", "Successful serving config saves")?,
            config_save_failures_total: counter(&registry, "model_sync_config_save_failures_total", "Failed serving config saves")?,
            rejected_keys_total: counter(&registry, "model_sync_rejected_keys_total", "Bucket keys that fit no recognised layout")?,
            cycle_duration_seconds,
            registered_models,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry { &self.registry }
}
