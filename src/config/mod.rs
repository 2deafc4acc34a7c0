pub mod compute;

pub use compute::{CloudServiceKind, ComputeConfig};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Process-level settings: which project and provisioning service this
/// session talks to, plus request tuning. Loaded from an optional TOML file
/// with `NIMBUS_`-prefixed environment overrides layered on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub project: String,
    pub service_url: String,
    pub log_level: String,
    pub request: RequestSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub min_request_interval_ms: u64,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            min_request_interval_ms: 100,
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self> {
        Self::load(None)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("project", "local-project")?
            .set_default("service_url", "http://localhost:8080")?
            .set_default("log_level", "info")?
            .set_default("request.max_retries", 3)?
            .set_default("request.base_delay_ms", 250)?
            .set_default("request.min_request_interval_ms", 100)?;

        builder = match path {
            Some(p) => builder.add_source(config::File::from(p)),
            None => builder.add_source(config::File::with_name("nimbus").required(false)),
        };

        let cfg = builder
            .add_source(config::Environment::with_prefix("NIMBUS").separator("__"))
            .build()
            .context("Failed to assemble settings")?;

        cfg.try_deserialize()
            .context("Failed to deserialize settings")
    }
}
