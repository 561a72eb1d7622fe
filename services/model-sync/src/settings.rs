//! Strongly typed sidecar configuration, validated once at startup.
//!
//! Section and field aliases (`minio`, `ovms`, `bucket_name`, `interval_secs`)
//! keep older sync-config files loadable unchanged.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub const ENV_PREFIX: &str = "MODEL_SYNC";
pub const DEFAULT_CONFIG_PATH: &str = "/config/sync-config.yaml";
pub const DISCOVERY_FILE_NAME: &str = "models.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid { field, reason: reason.into() }
}

/// Credential string that never shows up in `Debug` output or logs.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn expose(&self) -> &str { &self.0 }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("\"***\"") }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(alias = "minio")]
    pub store: StoreSettings,
    #[serde(alias = "ovms")]
    pub serving: ServingSettings,
    pub sync: SyncSettings,
    #[serde(default)]
    pub health: HealthSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: Secret,
    #[serde(alias = "bucket_name")]
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServingSettings {
    pub config_path: PathBuf,
    #[serde(default)]
    pub discovery_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    pub models_path: PathBuf,
    #[serde(default = "default_interval", alias = "interval_secs")]
    pub interval: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrent_models: usize,
    #[serde(default)]
    pub prune_removed: bool,
    #[serde(default)]
    pub adopt_local_artifacts: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSettings {
    fn default() -> Self { Self { port: default_health_port() } }
}

fn default_region() -> String { "us-east-1".into() }
fn default_request_timeout() -> u64 { 60 }
fn default_interval() -> u64 { 30 }
fn default_log_level() -> String { "info".into() }
fn default_concurrency() -> usize { 1 }
fn default_health_port() -> u16 { 8080 }

impl Settings {
    /// Load file (if given) + `MODEL_SYNC_*` env overrides, then validate.
    pub fn load(file: Option<&Path>) -> Result<Self, SettingsError> {
        let settings: Settings = sync_core::load_layered(file, ENV_PREFIX)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let store = &self.store;
        if store.endpoint.trim().is_empty() { return Err(invalid("store.endpoint", "must not be empty")); }
        if let Some((scheme, _)) = store.endpoint.split_once("://") {
            if scheme != "http" && scheme != "https" {
                return Err(invalid("store.endpoint", format!("unsupported scheme `{scheme}`")));
            }
        }
        if store.access_key.is_empty() { return Err(invalid("store.access_key", "must not be empty")); }
        if store.secret_key.expose().is_empty() { return Err(invalid("store.secret_key", "must not be empty")); }
        if store.bucket.trim().is_empty() { return Err(invalid("store.bucket", "must not be empty")); }
        if store.request_timeout_secs == 0 { return Err(invalid("store.request_timeout_secs", "must be at least 1")); }

        if self.serving.config_path.file_name().is_none() {
            return Err(invalid("serving.config_path", "must name a file"));
        }
        if self.sync.models_path.as_os_str().is_empty() {
            return Err(invalid("sync.models_path", "must not be empty"));
        }
        if self.sync.interval == 0 { return Err(invalid("sync.interval", "must be at least 1 second")); }
        if self.sync.max_concurrent_models == 0 {
            return Err(invalid("sync.max_concurrent_models", "must be at least 1"));
        }
        self.sync.level_filter()?;
        Ok(())
    }
}

impl StoreSettings {
    /// Endpoint with an explicit scheme; bare `host:port` follows `secure`.
    pub fn endpoint_url(&self) -> String {
        let ep = self.endpoint.trim().trim_end_matches('/');
        if ep.contains("://") {
            ep.to_string()
        } else if self.secure {
            format!("https://{ep}")
        } else {
            format!("http://{ep}")
        }
    }

    /// Listing prefix, normalized to `""` or `something/`.
    pub fn key_prefix(&self) -> String {
        let p = self.prefix.trim_matches('/');
        if p.is_empty() { String::new() } else { format!("{p}/") }
    }

    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}

impl ServingSettings {
    pub fn discovery_path(&self) -> PathBuf {
        match &self.discovery_path {
            Some(p) => p.clone(),
            None => self
                .config_path
                .parent()
                .map(|d| d.join(DISCOVERY_FILE_NAME))
                .unwrap_or_else(|| PathBuf::from(DISCOVERY_FILE_NAME)),
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.interval) }

    pub fn level_filter(&self) -> Result<LevelFilter, SettingsError> {
        let lvl = self.log_level.trim().to_ascii_lowercase();
        let lvl = if lvl == "warning" { "warn".to_string() } else { lvl };
        LevelFilter::from_str(&lvl).map_err(|_| invalid("sync.log_level", format!("unknown level `{}`", self.log_level)))
    }
}
