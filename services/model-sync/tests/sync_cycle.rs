use model_sync::metrics::SyncMetrics;
use model_sync::{MemoryStore, ObjectStore, ObjectStoreClient, ServingConfigStore, SyncOptions, SyncOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const BUCKET: &str = "models";

struct Harness {
    dir: TempDir,
    store: Arc<MemoryStore>,
    metrics: Arc<SyncMetrics>,
    orch: SyncOrchestrator,
}

fn options(root: &Path) -> SyncOptions {
    SyncOptions {
        bucket: BUCKET.into(),
        prefix: String::new(),
        models_root: root.to_path_buf(),
        interval: Duration::from_secs(1),
        max_concurrent_models: 1,
        prune_removed: false,
        adopt_local_artifacts: false,
    }
}

impl Harness {
    fn new() -> Self { Self::with(|_| {}) }

    fn with(tweak: impl FnOnce(&mut SyncOptions)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.create_bucket(BUCKET);
        let (metrics, orch) = build(&dir, store.clone(), tweak);
        Self { dir, store, metrics, orch }
    }

    fn root(&self) -> PathBuf { self.dir.path().join("models") }
    fn config_path(&self) -> PathBuf { self.dir.path().join("config.json") }
    fn discovery_path(&self) -> PathBuf { self.dir.path().join("models.json") }

    fn config_json(&self) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(self.config_path()).unwrap()).unwrap()
    }

    fn registered(&self) -> Vec<String> {
        let doc = self.config_json();
        doc["model_config_list"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["config"]["name"].as_str().unwrap().to_string())
            .collect()
    }
}

fn build(dir: &TempDir, store: Arc<MemoryStore>, tweak: impl FnOnce(&mut SyncOptions)) -> (Arc<SyncMetrics>, SyncOrchestrator) {
    let metrics = Arc::new(SyncMetrics::new().unwrap());
    let backend: Arc<dyn ObjectStore> = store;
    let client = ObjectStoreClient::new(backend, metrics.clone());
    let serving = ServingConfigStore::open(dir.path().join("config.json"), dir.path().join("models.json")).unwrap();
    let mut opts = options(&dir.path().join("models"));
    tweak(&mut opts);
    let orch = SyncOrchestrator::new(client, serving, opts, metrics.clone());
    (metrics, orch)
}

fn set_mtime(path: &Path, at: SystemTime) {
    std::fs::File::options().write(true).open(path).unwrap().set_modified(at).unwrap();
}

fn seed(store: &MemoryStore) {
    store.put(BUCKET, "modelA/1/weights.bin", b"weights-a".to_vec());
    store.put(BUCKET, "modelA/1/meta.json", b"{}".to_vec());
    store.put(BUCKET, "modelB/graph.bin", b"graph-b".to_vec());
}

#[tokio::test]
async fn first_cycle_downloads_and_registers_every_model() {
    let h = Harness::new();
    seed(&h.store);

    let report = h.orch.sync_all().await;
    assert_eq!(report.discovered, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.downloads, 3);
    assert!(report.all_succeeded());

    let root = h.root();
    assert_eq!(std::fs::read(root.join("modelA/1/weights.bin")).unwrap(), b"weights-a");
    assert_eq!(std::fs::read(root.join("modelA/1/meta.json")).unwrap(), b"{}");
    assert_eq!(std::fs::read(root.join("modelB/1/graph.bin")).unwrap(), b"graph-b");

    let doc = h.config_json();
    let first = &doc["model_config_list"][0]["config"];
    assert_eq!(first["name"], "modelA");
    assert_eq!(first["base_path"], root.join("modelA").to_str().unwrap());
    assert_eq!(h.registered(), vec!["modelA", "modelB"]);

    let discovery: serde_json::Value = serde_json::from_slice(&std::fs::read(h.discovery_path()).unwrap()).unwrap();
    assert_eq!(discovery["models"], serde_json::json!(["modelA", "modelB"]));
    assert_eq!(h.metrics.registered_models.get(), 2);
}

#[tokio::test]
async fn unchanged_bucket_means_no_downloads_and_no_writes() {
    let h = Harness::new();
    seed(&h.store);
    h.orch.sync_all().await;
    let opened = h.store.download_count();
    let mtime = std::fs::metadata(h.config_path()).unwrap().modified().unwrap();

    let report = h.orch.sync_all().await;
    assert_eq!(report.downloads, 0);
    assert_eq!(report.unchanged, 2);
    assert!(!report.persisted);
    assert_eq!(h.store.download_count(), opened);
    assert_eq!(std::fs::metadata(h.config_path()).unwrap().modified().unwrap(), mtime);
}

#[tokio::test]
async fn changed_object_is_downloaded_again() {
    let h = Harness::new();
    seed(&h.store);
    h.orch.sync_all().await;

    h.store.put(BUCKET, "modelB/graph.bin", b"graph-b-v2".to_vec());
    let report = h.orch.sync_all().await;
    assert_eq!(report.downloads, 1);
    assert_eq!(std::fs::read(h.root().join("modelB/1/graph.bin")).unwrap(), b"graph-b-v2");
    assert_eq!(h.registered(), vec!["modelA", "modelB"]);
}

#[tokio::test]
async fn one_failing_model_does_not_block_others() {
    let h = Harness::new();
    seed(&h.store);
    h.store.fail_downloads("modelA/1/meta.json", true);

    let report = h.orch.sync_all().await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_models, vec!["modelA:1".to_string()]);
    assert_eq!(h.registered(), vec!["modelB"]);
    assert!(h.orch.tracked(&h.root().join("modelA/1/meta.json")).is_none());

    h.store.fail_downloads("modelA/1/meta.json", false);
    let report = h.orch.sync_all().await;
    assert!(report.all_succeeded());
    assert_eq!(report.downloads, 2);
    assert_eq!(h.registered(), vec!["modelA", "modelB"]);
}

#[tokio::test]
async fn interrupted_download_leaves_no_artifact_and_retries() {
    let h = Harness::new();
    h.store.put(BUCKET, "m/1/w.bin", vec![1u8; 1024]);
    h.store.break_stream("m/1/w.bin", true);

    let report = h.orch.sync_all().await;
    assert_eq!(report.failed, 1);
    let target = h.root().join("m/1/w.bin");
    assert!(!target.exists());
    let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap()).unwrap().collect();
    assert!(leftovers.is_empty());
    assert!(!h.config_path().exists());

    h.store.break_stream("m/1/w.bin", false);
    assert!(h.orch.sync_all().await.all_succeeded());
    assert_eq!(std::fs::read(&target).unwrap().len(), 1024);
}

#[tokio::test]
async fn listing_failure_keeps_existing_registrations() {
    let h = Harness::with(|o| o.prune_removed = true);
    seed(&h.store);
    h.orch.sync_all().await;

    h.store.fail_listing(true);
    let report = h.orch.sync_all().await;
    assert_eq!(report.discovered, 0);
    assert_eq!(report.pruned, 0);
    assert_eq!(h.registered(), vec!["modelA", "modelB"]);
}

#[tokio::test]
async fn removed_models_are_pruned_when_enabled() {
    let h = Harness::with(|o| o.prune_removed = true);
    seed(&h.store);
    h.orch.sync_all().await;

    h.store.delete(BUCKET, "modelB/graph.bin");
    let report = h.orch.sync_all().await;
    assert_eq!(report.pruned, 1);
    assert!(report.persisted);
    assert_eq!(h.registered(), vec!["modelA"]);
    // artifacts stay on disk
    assert!(h.root().join("modelB/1/graph.bin").exists());
}

#[tokio::test]
async fn removed_models_stay_registered_by_default() {
    let h = Harness::new();
    seed(&h.store);
    h.orch.sync_all().await;
    h.store.delete(BUCKET, "modelB/graph.bin");
    let report = h.orch.sync_all().await;
    assert_eq!(report.pruned, 0);
    assert_eq!(h.registered(), vec!["modelA", "modelB"]);
}

#[tokio::test]
async fn returning_model_is_fetched_and_registered_again() {
    let h = Harness::with(|o| o.prune_removed = true);
    seed(&h.store);
    h.orch.sync_all().await;

    h.store.delete(BUCKET, "modelB/graph.bin");
    h.orch.sync_all().await;
    assert_eq!(h.registered(), vec!["modelA"]);

    h.store.put(BUCKET, "modelB/graph.bin", b"graph-b".to_vec());
    let report = h.orch.sync_all().await;
    assert_eq!(report.downloads, 1);
    assert_eq!(h.registered(), vec!["modelA", "modelB"]);
}

#[tokio::test]
async fn tracker_forgets_keys_that_left_the_bucket() {
    let h = Harness::new();
    seed(&h.store);
    h.store.put(BUCKET, "modelA/2/weights.bin", b"v2".to_vec());
    h.orch.sync_all().await;
    let old = h.root().join("modelA/1/weights.bin");
    assert!(h.orch.tracked(&old).is_some());

    h.store.delete(BUCKET, "modelA/1/weights.bin");
    h.store.delete(BUCKET, "modelA/1/meta.json");
    let report = h.orch.sync_all().await;
    assert_eq!(report.evicted, 2);
    assert!(h.orch.tracked(&old).is_none());
    assert!(h.orch.tracked(&h.root().join("modelA/2/weights.bin")).is_some());

    h.store.fail_listing(true);
    assert_eq!(h.orch.sync_all().await.evicted, 0);
    assert!(h.orch.tracked(&h.root().join("modelB/1/graph.bin")).is_some());
}

#[tokio::test]
async fn failed_save_is_retried_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    store.create_bucket(BUCKET);
    store.put(BUCKET, "m/1/w.bin", b"w".to_vec());
    let metrics = Arc::new(SyncMetrics::new().unwrap());
    let cfg_dir = dir.path().join("serving");
    let serving = ServingConfigStore::open(cfg_dir.join("config.json"), cfg_dir.join("models.json")).unwrap();
    let backend: Arc<dyn ObjectStore> = store.clone();
    let orch = SyncOrchestrator::new(
        ObjectStoreClient::new(backend, metrics.clone()),
        serving,
        options(&dir.path().join("models")),
        metrics.clone(),
    );

    let report = orch.sync_all().await;
    assert_eq!(report.failed, 1);
    assert!(!report.persisted);
    assert_eq!(metrics.config_save_failures_total.get(), 2);
    assert_eq!(orch.serving_entries().len(), 1);

    std::fs::create_dir_all(&cfg_dir).unwrap();
    let report = orch.sync_all().await;
    assert!(report.persisted);
    assert_eq!(report.downloads, 0);
    assert!(cfg_dir.join("config.json").exists());
}

#[tokio::test]
async fn listing_without_etags_falls_back_to_head() {
    let h = Harness::new();
    let etag = h.store.put(BUCKET, "m/1/w.bin", b"abc".to_vec());
    h.store.omit_listing_hashes(true);

    assert!(h.orch.sync_all().await.all_succeeded());
    let tracked = h.orch.tracked(&h.root().join("m/1/w.bin")).unwrap();
    assert_eq!(tracked.last_hash, etag);
    assert_eq!(h.orch.sync_all().await.downloads, 0);
}

#[tokio::test]
async fn matching_local_artifacts_are_adopted_without_download() {
    let h = Harness::with(|o| o.adopt_local_artifacts = true);
    h.store.put(BUCKET, "m/1/w.bin", b"12345".to_vec());
    let local = h.root().join("m/1/w.bin");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"12345").unwrap();
    set_mtime(&local, SystemTime::now() + Duration::from_secs(5));

    let report = h.orch.sync_all().await;
    assert!(report.all_succeeded());
    assert_eq!(report.downloads, 0);
    assert_eq!(h.store.download_count(), 0);
    assert_eq!(h.registered(), vec!["m"]);
}

#[tokio::test]
async fn stale_local_artifacts_are_downloaded() {
    let h = Harness::with(|o| o.adopt_local_artifacts = true);
    h.store.put(BUCKET, "m/1/w.bin", b"fresh".to_vec());
    let local = h.root().join("m/1/w.bin");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, b"stale").unwrap();
    set_mtime(&local, SystemTime::now() - Duration::from_secs(3600));

    let report = h.orch.sync_all().await;
    assert_eq!(report.downloads, 1);
    assert_eq!(std::fs::read(&local).unwrap(), b"fresh");
}

#[tokio::test]
async fn keys_with_unusable_model_names_are_quarantined() {
    let h = Harness::new();
    h.store.put(BUCKET, " /1/w.bin", b"w".to_vec());
    h.store.put(BUCKET, "a\\b/1/w.bin", b"w".to_vec());
    h.store.put(BUCKET, "ok/1/w.bin", b"w".to_vec());

    for _ in 0..2 {
        let report = h.orch.sync_all().await;
        assert_eq!(report.discovered, 1);
        assert_eq!(report.rejected_keys, 2);
        assert!(report.all_succeeded());
    }
    assert_eq!(h.store.download_count(), 1);
    assert!(!h.root().join(" ").exists());
    assert_eq!(h.registered(), vec!["ok"]);
}

#[tokio::test]
async fn deep_keys_keep_their_sub_path_and_strays_are_counted() {
    let h = Harness::new();
    h.store.put(BUCKET, "m/2/variables/variables.index", b"i".to_vec());
    h.store.put(BUCKET, "m/2/saved_model.pb", b"p".to_vec());
    h.store.put(BUCKET, "README.md", b"hi".to_vec());
    h.store.put(BUCKET, "m/", Vec::new());

    let report = h.orch.sync_all().await;
    assert_eq!(report.discovered, 1);
    assert_eq!(report.rejected_keys, 1);
    assert_eq!(h.metrics.rejected_keys_total.get(), 1);
    assert!(h.root().join("m/2/variables/variables.index").exists());
    assert!(h.root().join("m/2/saved_model.pb").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parallel_models_all_complete() {
    let h = Harness::with(|o| o.max_concurrent_models = 4);
    for i in 0..8 {
        h.store.put(BUCKET, &format!("model{i}/1/w.bin"), vec![i as u8; 64]);
    }
    let report = h.orch.sync_all().await;
    assert_eq!(report.succeeded, 8);
    assert_eq!(h.registered().len(), 8);
    assert_eq!(h.metrics.models_synced_total.get(), 8);
    assert_eq!(h.metrics.config_saves_total.get(), 8);
}

#[tokio::test]
async fn cycles_are_numbered_and_recorded() {
    let h = Harness::new();
    seed(&h.store);
    let health = sync_core::HealthState::new(Duration::from_secs(60));
    let first = h.orch.run_cycle(&health).await.unwrap();
    let second = h.orch.run_cycle(&health).await.unwrap();
    assert_eq!((first.cycle, second.cycle), (1, 2));
    let snap = health.snapshot();
    assert!(snap.last_heartbeat.is_some());
    assert_eq!(snap.last_report.unwrap()["cycle"], 2);
    assert_eq!(h.metrics.cycles_total.get(), 2);
}

#[tokio::test]
async fn poll_loop_exits_on_cancellation() {
    let h = Harness::new();
    let health = sync_core::HealthState::new(Duration::from_secs(60));
    let token = tokio_util::sync::CancellationToken::new();
    token.cancel();
    h.orch.run(&health, token).await;
    assert_eq!(h.metrics.cycles_total.get(), 0);
}
