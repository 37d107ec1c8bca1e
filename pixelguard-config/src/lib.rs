//! # PixelGuard Configuration System
//!
//! Hierarchical configuration for the pattern-management pipeline.
//!
//! ## Features
//! - **Unified Configuration**: one document covers orchestration, validation, monitoring and storage
//! - **Validation**: every threshold is range-checked after merging
//! - **Environment Awareness**: `PIXELGUARD_ENV` selects an override file

#![warn(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

mod error;
mod health;
mod ledger;
mod monitor;
mod orchestrator;
mod policy;
mod telemetry;
mod validation;

pub use error::ConfigError;
pub use health::HealthConfig;
pub use ledger::LedgerConfig;
pub use monitor::{MonitorConfig, SourceConfig};
pub use orchestrator::OrchestratorConfig;
pub use policy::ValidationConfig;
pub use telemetry::TelemetryConfig;

const BASE_FILE: &str = "config/pixelguard.yaml";
const ENV_PREFIX: &str = "PIXELGUARD_";

/// Top-level configuration container for all PixelGuard components.
#[derive(Debug, Serialize, Deserialize, Validate, Default, Clone)]
pub struct PixelGuardConfig {
    /// Orchestrator toggles, rollback ceiling and scheduling.
    #[validate(nested)]
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Validation stage thresholds.
    #[validate(nested)]
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Sources and fetch limits.
    #[validate(nested)]
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Health classification thresholds.
    #[validate(nested)]
    #[serde(default)]
    pub health: HealthConfig,

    /// Ledger storage.
    #[validate(nested)]
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Logging and metrics.
    #[validate(nested)]
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl PixelGuardConfig {
    /// Load configuration from default files and environment.
    ///
    /// Hierarchy:
    /// 1. Default values
    /// 2. `config/pixelguard.yaml`, skipped when missing
    /// 3. `config/<PIXELGUARD_ENV>.yaml`
    /// 4. `PIXELGUARD_*` environment variables (`__` separates sections)
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(PixelGuardConfig::default()));

        if Path::new(BASE_FILE).exists() {
            figment = figment.merge(Yaml::file(BASE_FILE));
        }

        let env = std::env::var("PIXELGUARD_ENV").unwrap_or_else(|_| "production".into());
        let env_file = format!("config/{}.yaml", env);
        if Path::new(&env_file).exists() {
            figment = figment.merge(Yaml::file(env_file));
        }

        Self::finish(figment)
    }

    /// Load configuration from a specific file, still honouring environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(PathBuf::from(path)));
        }

        let figment = Figment::from(Serialized::defaults(PixelGuardConfig::default()))
            .merge(Yaml::file(path));
        Self::finish(figment)
    }

    fn finish(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).ignore(&["ENV"]).split("__"))
            .extract()
            .map_err(ConfigError::from)
            .and_then(|config: Self| {
                config.validate()?;
                Ok(config)
            })
    }
}
