//! Layered CLI settings.
//!
//! Sources, lowest precedence first: built-in defaults, an optional config
//! file, then `PKTSCOPE__*` environment variables
//! (e.g. `PKTSCOPE__OBSERVER__PAYLOAD_PREVIEW=128`).

use pktscope_observer::ObserverConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::commands::Result;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PKTSCOPE";

/// Settings for the `pktscope` binary.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Log level used when neither `-v` nor `RUST_LOG` is given.
    pub log_level: String,
    /// `pretty` or `json`.
    pub log_format: String,
    /// Transport observation settings.
    pub observer: ObserverConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "debug".to_string(),
            log_format: "pretty".to_string(),
            observer: ObserverConfig::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if given) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.observer.validate()?;
        Ok(settings)
    }
}
