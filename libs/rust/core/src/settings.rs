//! Layered configuration: optional file, then `<PREFIX>_SECTION__FIELD` env vars.
//!
//! Defaults belong to the target type (serde `default` attributes) so the
//! loader stays schema-agnostic.

use serde::de::DeserializeOwned;
use std::path::Path;

pub fn load_layered<T: DeserializeOwned>(file: Option<&Path>, env_prefix: &str) -> Result<T, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = file {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );
    builder.build()?.try_deserialize()
}
