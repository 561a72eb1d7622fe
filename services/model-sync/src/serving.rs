//! Serving configuration store: sole writer of the model server's config file
//! and of the lightweight discovery document next to it.
//!
//! Wire format consumed by the serving process:
//!
//! ```json
//! {"model_config_list": [{"config": {"name": "resnet", "base_path": "/models/resnet"}}]}
//! ```
//!
//! Every write goes to a temp file in the target directory which is fsynced and
//! then renamed over the target, so readers see either the previous complete
//! document or the new one.

use crate::layout::is_valid_model_name;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServingConfigError {
    #[error("invalid model name `{0}`")]
    InvalidName(String),
    #[error("base path for model `{0}` is not valid UTF-8")]
    NonUtf8Path(String),
    #[error("model `{0}` is not registered")]
    UnknownModel(String),
    #[error("cannot read serving config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("serving config {path} is not a valid document: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("cannot encode serving config: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cannot write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("serving config update did not complete: {0}")]
    Interrupted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServingModelEntry {
    pub name: String,
    pub base_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelConfigItem {
    config: ServingModelEntry,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    model_config_list: Vec<ModelConfigItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub models: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub models: usize,
    pub discovery_written: bool,
}

#[derive(Debug)]
pub struct ServingConfigStore {
    config_path: PathBuf,
    discovery_path: PathBuf,
    models: BTreeMap<String, ServingModelEntry>,
    dirty: bool,
}

impl ServingConfigStore {
    /// Empty store; nothing is read until [`load`](Self::load).
    pub fn new(config_path: impl Into<PathBuf>, discovery_path: impl Into<PathBuf>) -> Self {
        Self { config_path: config_path.into(), discovery_path: discovery_path.into(), models: BTreeMap::new(), dirty: false }
    }

    pub fn open(config_path: impl Into<PathBuf>, discovery_path: impl Into<PathBuf>) -> Result<Self, ServingConfigError> {
        let mut store = Self::new(config_path, discovery_path);
        store.load()?;
        Ok(store)
    }

    /// Replace the in-memory map with the on-disk document, keeping only
    /// `name` and `base_path` of each entry. A missing file means no models.
    /// Returns the number of models loaded.
    pub fn load(&mut self) -> Result<usize, ServingConfigError> {
        sweep_stale_temp_files(&self.config_path);
        sweep_stale_temp_files(&self.discovery_path);
        let raw = match std::fs::read(&self.config_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path=%self.config_path.display(), "no serving config yet, starting empty");
                self.models.clear();
                self.dirty = false;
                return Ok(0);
            }
            Err(source) => return Err(ServingConfigError::Read { path: self.config_path.clone(), source }),
        };
        let parse_err = |source| ServingConfigError::Parse { path: self.config_path.clone(), source };
        let value: serde_json::Value = serde_json::from_slice(&raw).map_err(parse_err)?;
        let legacy = count_legacy_fields(&value);
        let doc: ConfigDocument = serde_json::from_value(value).map_err(parse_err)?;

        let mut models = BTreeMap::new();
        for item in doc.model_config_list {
            let entry = item.config;
            if models.contains_key(&entry.name) {
                warn!(model=%entry.name, "duplicate model entry in serving config, keeping the last one");
            }
            models.insert(entry.name.clone(), entry);
        }
        self.models = models;
        // rewrite on the next persist so dropped fields disappear from disk
        self.dirty = legacy > 0;
        info!(models = self.models.len(), legacy_fields = legacy, path=%self.config_path.display(), "serving config loaded");
        Ok(self.models.len())
    }

    /// Upsert in memory only. Returns whether the entry was new or different.
    pub fn add_or_update(&mut self, name: &str, base_path: &Path) -> Result<bool, ServingConfigError> {
        validate_name(name)?;
        let base_path = base_path.to_str().ok_or_else(|| ServingConfigError::NonUtf8Path(name.to_string()))?;
        let entry = ServingModelEntry { name: name.to_string(), base_path: base_path.to_string() };
        if self.models.get(name) == Some(&entry) {
            debug!(model=%name, "serving entry unchanged");
            return Ok(false);
        }
        info!(model=%name, base_path=%entry.base_path, "serving entry upserted");
        self.models.insert(name.to_string(), entry);
        self.dirty = true;
        Ok(true)
    }

    pub fn remove(&mut self, name: &str) -> Result<(), ServingConfigError> {
        if self.models.remove(name).is_none() {
            warn!(model=%name, "model not present in serving config");
            return Err(ServingConfigError::UnknownModel(name.to_string()));
        }
        info!(model=%name, "serving entry removed");
        self.dirty = true;
        Ok(())
    }

    /// Persist the whole map, then regenerate the discovery document. On
    /// failure the in-memory map stays as the desired state and the store
    /// stays dirty. A discovery write failure is logged but does not fail the save.
    pub fn save(&mut self) -> Result<SaveReport, ServingConfigError> {
        let doc = ConfigDocument {
            model_config_list: self.models.values().cloned().map(|config| ModelConfigItem { config }).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&self.config_path, &bytes)
            .map_err(|source| ServingConfigError::Write { path: self.config_path.clone(), source })?;
        self.dirty = false;
        info!(models = self.models.len(), path=%self.config_path.display(), "serving config saved");

        let discovery_written = match self.save_discovery() {
            Ok(()) => true,
            Err(e) => {
                warn!(error=%e, "discovery document not written");
                false
            }
        };
        Ok(SaveReport { models: self.models.len(), discovery_written })
    }

    fn save_discovery(&self) -> Result<(), ServingConfigError> {
        let doc = DiscoveryDocument { models: self.models.keys().cloned().collect(), updated_at: Utc::now() };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&self.discovery_path, &bytes)
            .map_err(|source| ServingConfigError::Write { path: self.discovery_path.clone(), source })?;
        debug!(models = doc.models.len(), path=%self.discovery_path.display(), "discovery document saved");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool { self.models.contains_key(name) }
    pub fn get(&self, name: &str) -> Option<&ServingModelEntry> { self.models.get(name) }
    pub fn entries(&self) -> impl Iterator<Item = &ServingModelEntry> { self.models.values() }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.models.keys().map(String::as_str) }
    pub fn len(&self) -> usize { self.models.len() }
    pub fn is_empty(&self) -> bool { self.models.is_empty() }
    pub fn is_dirty(&self) -> bool { self.dirty }
    pub fn config_path(&self) -> &Path { &self.config_path }
    pub fn discovery_path(&self) -> &Path { &self.discovery_path }
}

fn validate_name(name: &str) -> Result<(), ServingConfigError> {
    if is_valid_model_name(name) { Ok(()) } else { Err(ServingConfigError::InvalidName(name.to_string())) }
}

/// Fields other than `name`/`base_path` inside entries, or other than
/// `config` around them.
fn count_legacy_fields(doc: &serde_json::Value) -> usize {
    let Some(list) = doc.get("model_config_list").and_then(|l| l.as_array()) else { return 0 };
    list.iter()
        .map(|item| {
            let outer = item.as_object().map_or(0, |o| o.keys().filter(|k| *k != "config").count());
            let inner = item
                .get("config")
                .and_then(|c| c.as_object())
                .map_or(0, |c| c.keys().filter(|k| *k != "name" && *k != "base_path").count());
            outer + inner
        })
        .sum()
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    }
}

/// `.{file_name}.` / `.tmp`, the name shape of in-flight writes to `path`.
fn temp_affixes(path: &Path) -> (String, &'static str) {
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("config");
    (format!(".{file_name}."), ".tmp")
}

/// Remove temp files a crash between write and rename left behind.
fn sweep_stale_temp_files(path: &Path) {
    let dir = parent_dir(path);
    let (prefix, suffix) = temp_affixes(path);
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !(name.starts_with(&prefix) && name.ends_with(suffix)) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => info!(path=%entry.path().display(), "stale temp file removed"),
            Err(e) => warn!(path=%entry.path().display(), error=%e, "stale temp file not removed"),
        }
    }
}

/// Temp file in the target's directory, fsync, rename over the target.
/// The temp file is removed on any failure before the rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> { write_atomic_with(path, bytes, |_| Ok(())) }

/// `write_atomic` with a hook that runs on the fully written temp file just
/// before the rename.
fn write_atomic_with(path: &Path, bytes: &[u8], before_rename: impl FnOnce(&Path) -> io::Result<()>) -> io::Result<()> {
    let dir = parent_dir(path);
    let (prefix, suffix) = temp_affixes(path);
    let mut tmp = tempfile::Builder::new().prefix(&prefix).suffix(suffix).tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file().set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    before_rename(tmp.path())?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        debug!(error=?e, dir=%dir.display(), "directory fsync skipped");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}
