//! Sync orchestrator: one poll cycle is
//! `DISCOVER -> SYNC_EACH_MODEL -> PERSIST_IF_CHANGED`, then the loop sleeps.
//!
//! Per model, a registration is written only after every changed artifact of
//! that (name, version) group landed on disk, and it is saved immediately so
//! one failing model never holds back another. Tracker hashes are committed
//! per artifact only after its download succeeded.

use crate::layout::{artifact_path, classify, ArtifactKey, KeyClass, RejectReason};
use crate::metrics::SyncMetrics;
use crate::serving::{ServingConfigError, ServingConfigStore, ServingModelEntry};
use crate::settings::Settings;
use crate::store::{normalize_etag, ObjectInfo, ObjectStoreClient, StoreError};
use crate::tracker::{ChangeTracker, TrackedArtifact};
use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sync_core::HealthState;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub bucket: String,
    /// Normalized listing prefix (`""` or ending in `/`).
    pub prefix: String,
    pub models_root: PathBuf,
    pub interval: Duration,
    pub max_concurrent_models: usize,
    pub prune_removed: bool,
    pub adopt_local_artifacts: bool,
}

impl SyncOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bucket: settings.store.bucket.clone(),
            prefix: settings.store.key_prefix(),
            models_root: settings.sync.models_path.clone(),
            interval: settings.sync.poll_interval(),
            max_concurrent_models: settings.sync.max_concurrent_models.max(1),
            prune_removed: settings.sync.prune_removed,
            adopt_local_artifacts: settings.sync.adopt_local_artifacts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub key: String,
    /// Path below the version directory.
    pub relative_path: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelGroup {
    pub name: String,
    pub version: String,
    pub files: Vec<ArtifactFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedKey {
    pub key: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub groups: Vec<ModelGroup>,
    pub rejected: Vec<RejectedKey>,
    pub objects_listed: usize,
}

/// Group a bucket listing into one [`ModelGroup`] per (name, version),
/// ordered by name then version. `prefix` is stripped before classification.
pub fn group_objects(objects: Vec<ObjectInfo>, prefix: &str) -> Discovery {
    let objects_listed = objects.len();
    let mut groups: BTreeMap<(String, String), Vec<ArtifactFile>> = BTreeMap::new();
    let mut rejected = Vec::new();
    for obj in objects {
        let relative = obj.key.strip_prefix(prefix).unwrap_or(&obj.key);
        match classify(relative) {
            KeyClass::Artifact(ArtifactKey { model, version, relative_path, .. }) => {
                groups.entry((model, version)).or_default().push(ArtifactFile {
                    relative_path,
                    size: obj.size,
                    last_modified: obj.last_modified,
                    hash: obj.hash.as_deref().map(normalize_etag).filter(|h| !h.is_empty()),
                    key: obj.key,
                });
            }
            KeyClass::DirectoryMarker => {}
            KeyClass::Rejected(reason) => rejected.push(RejectedKey { key: obj.key, reason }),
        }
    }
    let groups = groups.into_iter().map(|((name, version), files)| ModelGroup { name, version, files }).collect();
    Discovery { groups, rejected, objects_listed }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub name: String,
    pub version: String,
    pub downloaded: usize,
    pub adopted: usize,
    pub registered: bool,
    pub error: Option<String>,
}

impl ModelReport {
    fn new(group: &ModelGroup) -> Self {
        Self { name: group.name.clone(), version: group.version.clone(), downloaded: 0, adopted: 0, registered: false, error: None }
    }

    pub fn succeeded(&self) -> bool { self.error.is_none() }

    fn fail(mut self, reason: String) -> Self {
        self.error = Some(reason);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub discovered: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub unchanged: usize,
    pub downloads: usize,
    pub rejected_keys: usize,
    pub pruned: usize,
    pub evicted: usize,
    pub persisted: bool,
    pub duration_ms: u64,
    pub failed_models: Vec<String>,
}

impl CycleReport {
    pub fn all_succeeded(&self) -> bool { self.failed == 0 }
}

#[derive(Debug, Error)]
pub enum StartupCheckError {
    #[error("object store unreachable: {0}")]
    Store(#[from] StoreError),
    #[error("models directory {path} unusable: {source}")]
    ModelsRoot { path: PathBuf, source: std::io::Error },
    #[error("serving config directory {path} unusable: {reason}")]
    ConfigDir { path: PathBuf, reason: String },
}

/// Bucket reachable, models root present (created if needed), serving
/// config directory present and writable.
pub async fn startup_check(client: &ObjectStoreClient, options: &SyncOptions, config_path: &Path) -> Result<(), StartupCheckError> {
    client.check_bucket(&options.bucket).await?;
    info!(bucket=%options.bucket, "health check: object store reachable");

    let root = &options.models_root;
    let models_err = |source| StartupCheckError::ModelsRoot { path: root.clone(), source };
    tokio::fs::create_dir_all(root).await.map_err(models_err)?;
    let meta = tokio::fs::metadata(root).await.map_err(models_err)?;
    if !meta.is_dir() {
        return Err(models_err(std::io::Error::new(std::io::ErrorKind::Other, "not a directory")));
    }
    info!(path=%root.display(), "health check: models directory accessible");

    let dir = match config_path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let config_err = |reason: String| StartupCheckError::ConfigDir { path: dir.clone(), reason };
    match tokio::fs::metadata(&dir).await {
        Ok(m) if m.is_dir() => {}
        Ok(_) => return Err(config_err("not a directory".into())),
        Err(e) => return Err(config_err(e.to_string())),
    }
    // probe writability the same way saves will: a temp file in that directory
    tempfile::NamedTempFile::new_in(&dir).map_err(|e| config_err(format!("not writable: {e}")))?;
    info!(path=%dir.display(), "health check: serving config directory writable");
    Ok(())
}

pub struct SyncOrchestrator {
    client: ObjectStoreClient,
    tracker: Mutex<ChangeTracker>,
    serving: Arc<Mutex<ServingConfigStore>>,
    options: SyncOptions,
    metrics: Arc<SyncMetrics>,
    cycle: AtomicU64,
}

impl SyncOrchestrator {
    pub fn new(client: ObjectStoreClient, serving: ServingConfigStore, options: SyncOptions, metrics: Arc<SyncMetrics>) -> Self {
        metrics.registered_models.set(serving.len() as i64);
        Self { client, tracker: Mutex::new(ChangeTracker::new()), serving: Arc::new(Mutex::new(serving)), options, metrics, cycle: AtomicU64::new(0) }
    }

    pub fn options(&self) -> &SyncOptions { &self.options }
    pub fn serving_entries(&self) -> Vec<ServingModelEntry> { self.serving.lock().entries().cloned().collect() }
    pub fn tracked(&self, path: &Path) -> Option<TrackedArtifact> { self.tracker.lock().get(path).cloned() }

    pub async fn discover(&self) -> Discovery {
        let objects = self.client.list(&self.options.bucket, &self.options.prefix).await;
        let discovery = group_objects(objects, &self.options.prefix);
        for r in &discovery.rejected {
            warn!(key=%r.key, reason=%r.reason, "key_quarantined");
        }
        self.metrics.rejected_keys_total.inc_by(discovery.rejected.len() as u64);
        info!(objects = discovery.objects_listed, groups = discovery.groups.len(), rejected = discovery.rejected.len(), "discovery_complete");
        discovery
    }

    #[instrument(skip(self, group), fields(model=%group.name, version=%group.version))]
    pub async fn sync_model(&self, group: &ModelGroup) -> ModelReport {
        let mut report = ModelReport::new(group);
        let model_dir = self.options.models_root.join(&group.name);
        for file in &group.files {
            let local = artifact_path(&model_dir, &group.version, &file.relative_path);
            let hash = self.resolve_hash(file).await;
            if !self.is_pending(&local, &hash) {
                continue;
            }
            if self.options.adopt_local_artifacts && local_matches(&local, file).await {
                self.commit(&local, &hash);
                report.adopted += 1;
                debug!(key=%file.key, "local_artifact_adopted");
                continue;
            }
            if !self.client.download(&self.options.bucket, &file.key, &local).await {
                return report.fail(format!("download of {} failed", file.key));
            }
            self.commit(&local, &hash);
            report.downloaded += 1;
        }

        let registered = self.is_registered(&group.name);
        if report.downloaded == 0 && registered {
            debug!("model_unchanged");
            return report;
        }
        if !registered {
            info!(downloaded = report.downloaded, "registering model");
        }
        match self.register(&group.name, &model_dir).await {
            Ok(()) => {
                report.registered = true;
                info!(downloaded = report.downloaded, adopted = report.adopted, "model_synced");
                report
            }
            Err(e) => {
                error!(error=%e, "model_registration_failed");
                report.fail(e.to_string())
            }
        }
    }

    /// One full cycle. Never fails: every problem is folded into the report.
    pub async fn sync_all(&self) -> CycleReport {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let span = info_span!("sync_cycle", cycle);
        self.sync_all_inner(cycle).instrument(span).await
    }

    async fn sync_all_inner(&self, cycle: u64) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport { cycle, ..Default::default() };

        let discovery = self.discover().await;
        report.discovered = discovery.groups.len();
        report.rejected_keys = discovery.rejected.len();

        if discovery.groups.is_empty() {
            info!("nothing to do");
        } else {
            let outcomes: Vec<ModelReport> = futures::stream::iter(discovery.groups.iter())
                .map(|g| self.sync_model(g))
                .buffer_unordered(self.options.max_concurrent_models)
                .collect()
                .await;
            for m in outcomes {
                report.downloads += m.downloaded;
                if m.succeeded() {
                    report.succeeded += 1;
                    if m.registered {
                        self.metrics.models_synced_total.inc();
                    } else {
                        report.unchanged += 1;
                    }
                } else {
                    report.failed += 1;
                    self.metrics.model_failures_total.inc();
                    report.failed_models.push(format!("{}:{}", m.name, m.version));
                }
            }
            report.failed_models.sort();
            report.evicted = self.evict_unseen(&discovery.groups);
            if self.options.prune_removed {
                let present: HashSet<&str> = discovery.groups.iter().map(|g| g.name.as_str()).collect();
                report.pruned = self.prune_absent(&present);
            }
        }

        report.persisted = self.persist_if_changed().await;
        self.metrics.registered_models.set(self.serving.lock().len() as i64);

        let elapsed = started.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        self.metrics.cycles_total.inc();
        self.metrics.cycle_duration_seconds.observe(elapsed.as_secs_f64());
        info!(
            discovered = report.discovered,
            succeeded = report.succeeded,
            failed = report.failed,
            unchanged = report.unchanged,
            downloads = report.downloads,
            rejected = report.rejected_keys,
            pruned = report.pruned,
            evicted = report.evicted,
            duration_ms = report.duration_ms,
            "cycle_complete: synced {}/{} models",
            report.succeeded,
            report.discovered
        );
        report
    }

    /// Run one cycle, surviving panics, and publish the outcome to `health`.
    pub async fn run_cycle(&self, health: &HealthState) -> Option<CycleReport> {
        let outcome = AssertUnwindSafe(self.sync_all()).catch_unwind().await;
        health.heartbeat();
        match outcome {
            Ok(report) => {
                health.record_report(&report);
                Some(report)
            }
            Err(panic) => {
                self.metrics.cycle_panics_total.inc();
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                error!(panic=%msg, "sync_cycle_panicked");
                None
            }
        }
    }

    /// Sleep one interval, run a cycle, repeat. Cancellation is only observed
    /// while sleeping, so an in-flight cycle always completes its writes.
    pub async fn run(&self, health: &HealthState, shutdown: CancellationToken) {
        info!(interval_secs = self.options.interval.as_secs(), "poll loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.interval) => {}
            }
            self.run_cycle(health).await;
        }
        info!("poll loop stopped");
    }

    async fn resolve_hash(&self, file: &ArtifactFile) -> String {
        if let Some(h) = &file.hash {
            return h.clone();
        }
        if let Some(h) = self.client.head_hash(&self.options.bucket, &file.key).await {
            if !h.is_empty() {
                return h;
            }
        }
        let modified = file.last_modified.map(|t| t.timestamp_millis()).unwrap_or(0);
        format!("{}:{}", file.size, modified)
    }

    fn is_pending(&self, path: &Path, hash: &str) -> bool { self.tracker.lock().peek_changed(path, hash) }

    fn commit(&self, path: &Path, hash: &str) { self.tracker.lock().commit(path, hash) }

    fn is_registered(&self, name: &str) -> bool { self.serving.lock().contains(name) }

    async fn register(&self, name: &str, model_dir: &Path) -> Result<(), ServingConfigError> {
        let name = name.to_string();
        let model_dir = model_dir.to_path_buf();
        self.on_serving(move |serving, metrics| {
            serving.add_or_update(&name, &model_dir)?;
            save_counted(serving, metrics)
        })
        .await
    }

    /// Run `f` against the serving store on the blocking pool, since saves fsync.
    async fn on_serving<T, F>(&self, f: F) -> Result<T, ServingConfigError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ServingConfigStore, &SyncMetrics) -> Result<T, ServingConfigError> + Send + 'static,
    {
        let serving = self.serving.clone();
        let metrics = self.metrics.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = serving.lock();
            f(&mut *guard, &*metrics)
        });
        match task.await {
            Ok(result) => result,
            Err(e) => match e.try_into_panic() {
                Ok(panic) => std::panic::resume_unwind(panic),
                Err(e) => Err(ServingConfigError::Interrupted(e.to_string())),
            },
        }
    }

    fn evict_unseen(&self, groups: &[ModelGroup]) -> usize {
        let seen: HashSet<PathBuf> = groups
            .iter()
            .flat_map(|g| {
                let model_dir = self.options.models_root.join(&g.name);
                g.files.iter().map(move |f| artifact_path(&model_dir, &g.version, &f.relative_path))
            })
            .collect();
        let evicted = self.tracker.lock().retain_seen(&seen);
        if evicted > 0 {
            debug!(evicted, "tracker_entries_evicted");
        }
        evicted
    }

    fn prune_absent(&self, present: &HashSet<&str>) -> usize {
        let mut serving = self.serving.lock();
        let stale: Vec<String> = serving.names().filter(|n| !present.contains(n)).map(str::to_string).collect();
        for name in &stale {
            if serving.remove(name).is_ok() {
                info!(model=%name, "model_pruned");
            }
        }
        stale.len()
    }

    /// Save if anything is still unsaved (failed earlier save, prune,
    /// normalized legacy document). Returns whether a save succeeded.
    async fn persist_if_changed(&self) -> bool {
        let saved = self
            .on_serving(|serving, metrics| {
                if !serving.is_dirty() {
                    return Ok(false);
                }
                save_counted(serving, metrics).map(|()| true)
            })
            .await;
        match saved {
            Ok(saved) => saved,
            Err(e) => {
                error!(error=%e, "serving_config_persist_failed");
                false
            }
        }
    }
}

fn save_counted(serving: &mut ServingConfigStore, metrics: &SyncMetrics) -> Result<(), ServingConfigError> {
    match serving.save() {
        Ok(_) => {
            metrics.config_saves_total.inc();
            Ok(())
        }
        Err(e) => {
            metrics.config_save_failures_total.inc();
            Err(e)
        }
    }
}

/// Best-effort "already have it": same size and not older than the remote
/// object, compared in whole seconds (the resolution S3 reports).
async fn local_matches(local: &Path, file: &ArtifactFile) -> bool {
    let Ok(meta) = tokio::fs::metadata(local).await else { return false };
    if !meta.is_file() || meta.len() != file.size {
        return false;
    }
    match (file.last_modified, meta.modified()) {
        (Some(remote), Ok(local_mtime)) => DateTime::<Utc>::from(local_mtime).timestamp() >= remote.timestamp(),
        (None, _) => true,
        (Some(_), Err(_)) => false,
    }
}
