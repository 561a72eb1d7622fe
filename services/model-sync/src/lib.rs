//! Model artifact sync sidecar.
//!
//! Polls an S3-compatible bucket laid out as `model/version/file`, mirrors
//! changed artifacts into a local models directory and keeps the model
//! server's JSON config (plus a `models.json` discovery file) in step.

pub mod app;
pub mod layout;
pub mod metrics;
pub mod orchestrator;
pub mod serving;
pub mod settings;
pub mod store;
pub mod tracker;

pub use app::{run, run_with_store, RunMode};
pub use orchestrator::{CycleReport, Discovery, ModelGroup, ModelReport, SyncOptions, SyncOrchestrator};
pub use serving::{ServingConfigError, ServingConfigStore, ServingModelEntry};
pub use settings::Settings;
pub use store::{ObjectInfo, ObjectStore, ObjectStoreClient, S3Store, StoreError};
#[cfg(any(test, feature = "test-util"))]
pub use store::MemoryStore;
pub use tracker::ChangeTracker;
