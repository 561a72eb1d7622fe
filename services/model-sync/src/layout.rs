//! Bucket key convention.
//!
//! Keys are read relative to the configured prefix:
//!
//! | key                         | model | version | local path under version dir |
//! |-----------------------------|-------|---------|------------------------------|
//! | `name/version/file`         | name  | version | `file`                       |
//! | `name/version/sub/file`     | name  | version | `sub/file`                   |
//! | `name/file`                 | name  | `1`     | `file`                       |
//! | `name/` (trailing slash)    | directory marker, ignored                       |
//! | `file`, `a//b`, `a/../b`    | rejected and reported                           |
//! | `a\b/1/file`, ` /1/file`    | rejected: not a usable model name               |

use std::fmt;
use std::path::{Path, PathBuf};

/// Version assumed when a key has no explicit version segment.
pub const DEFAULT_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKey {
    pub model: String,
    pub version: String,
    /// Path below the version directory, `/`-separated.
    pub relative_path: String,
    pub implicit_version: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    TopLevel,
    EmptySegment,
    DotSegment,
    InvalidName,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Empty => "empty key",
            RejectReason::TopLevel => "object outside any model directory",
            RejectReason::EmptySegment => "empty path segment",
            RejectReason::DotSegment => "relative path segment",
            RejectReason::InvalidName => "model segment is not a valid model name",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyClass {
    Artifact(ArtifactKey),
    DirectoryMarker,
    Rejected(RejectReason),
}

/// Names the serving config accepts: non-blank, no path separators, not `.`/`..`.
pub fn is_valid_model_name(name: &str) -> bool {
    !(name.trim().is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == "..")
}

pub fn classify(relative_key: &str) -> KeyClass {
    if relative_key.is_empty() { return KeyClass::Rejected(RejectReason::Empty); }
    if relative_key.ends_with('/') { return KeyClass::DirectoryMarker; }
    let parts: Vec<&str> = relative_key.split('/').collect();
    if parts.iter().any(|p| p.is_empty()) { return KeyClass::Rejected(RejectReason::EmptySegment); }
    if parts.iter().any(|p| *p == "." || *p == "..") { return KeyClass::Rejected(RejectReason::DotSegment); }
    match parts.as_slice() {
        [_] => KeyClass::Rejected(RejectReason::TopLevel),
        [model, ..] if !is_valid_model_name(model) => KeyClass::Rejected(RejectReason::InvalidName),
        [model, file] => KeyClass::Artifact(ArtifactKey {
            model: model.to_string(),
            version: DEFAULT_VERSION.to_string(),
            relative_path: file.to_string(),
            implicit_version: true,
        }),
        [model, version, rest @ ..] => KeyClass::Artifact(ArtifactKey {
            model: model.to_string(),
            version: version.to_string(),
            relative_path: rest.join("/"),
            implicit_version: false,
        }),
        [] => KeyClass::Rejected(RejectReason::Empty),
    }
}

impl ArtifactKey {
    /// `models_root/model`, the base path written to the serving config.
    pub fn model_dir(&self, models_root: &Path) -> PathBuf { models_root.join(&self.model) }

    /// `models_root/model/version/relative_path`.
    pub fn local_path(&self, models_root: &Path) -> PathBuf {
        artifact_path(&self.model_dir(models_root), &self.version, &self.relative_path)
    }
}

/// `model_dir/version/relative_path`, splitting `relative_path` on `/`.
pub fn artifact_path(model_dir: &Path, version: &str, relative_path: &str) -> PathBuf {
    let mut p = model_dir.join(version);
    for seg in relative_path.split('/') {
        p.push(seg);
    }
    p
}
