//! Source monitoring configuration.
//!
//! Lists the remote pattern providers and the scheduling limits of the
//! change monitor.

use std::path::PathBuf;
use std::time::Duration;

use pixelguard_core::model::Priority;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

/// Change monitor parameters.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct MonitorConfig {
    /// Global ceiling on concurrent fetches.
    #[validate(range(min = 1, max = 64))]
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_fetches: usize,

    /// How often each source task wakes to check whether it is due (seconds).
    #[validate(range(min = 1, max = 3600))]
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Where cached source content and source state are kept.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Pattern sources.
    #[validate(nested)]
    #[validate(custom(function = validation::validate_unique_sources))]
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_max_in_flight() -> usize {
    4
}
fn default_tick_interval() -> u64 {
    30
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

impl MonitorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_in_flight_fetches: default_max_in_flight(),
            tick_interval_secs: default_tick_interval(),
            cache_dir: default_cache_dir(),
            sources: Vec::new(),
        }
    }
}

/// A named pattern provider. The locator is opaque to the core (URL or path).
#[derive(Debug, Serialize, Deserialize, Validate, Clone, PartialEq)]
pub struct SourceConfig {
    #[validate(custom(function = validation::validate_source_name))]
    pub name: String,

    #[validate(length(min = 1, max = 2048))]
    pub locator: String,

    /// Minutes-scale schedules are typical; stored in seconds.
    #[validate(range(min = 1, max = 604_800))]
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default)]
    pub priority: Priority,
}

fn default_poll_interval() -> u64 {
    3600
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locator: locator.into(),
            poll_interval_secs: default_poll_interval(),
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
