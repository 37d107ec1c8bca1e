//! Control-loop configuration.
//!
//! The recognized switches of the update pipeline: validation gate, automatic
//! rollback, rollback ceiling, scheduling intervals and the manual kill switch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct OrchestratorConfig {
    /// Route changes through the validator before committing.
    #[serde(default = "default_true")]
    pub validation_enabled: bool,

    /// Roll back automatically on apply failure or critical health.
    #[serde(default = "default_true")]
    pub auto_rollback: bool,

    /// Rollbacks allowed before the orchestrator stops itself.
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_max_rollback_attempts")]
    pub max_rollback_attempts: u32,

    /// Seconds between health samples.
    #[validate(range(min = 1, max = 86_400))]
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Seconds between forced polls of every source.
    #[validate(range(min = 1, max = 604_800))]
    #[serde(default = "default_pattern_refresh_interval")]
    pub pattern_refresh_interval_secs: u64,

    /// Manual kill switch. While set, every change is dropped with a log entry.
    #[serde(default)]
    pub emergency_stop: bool,

    /// Capacity of each inter-stage queue (must be a power of two).
    #[validate(range(min = 2, max = 65_536))]
    #[validate(custom(function = validation::validate_power_of_two))]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bounded wait of every queue read, in milliseconds.
    #[validate(range(min = 1, max = 60_000))]
    #[serde(default = "default_queue_poll_timeout")]
    pub queue_poll_timeout_ms: u64,

    /// Candidate patterns validated per change event.
    #[validate(range(min = 1, max = 10_000))]
    #[serde(default = "default_max_candidates")]
    pub max_candidates_per_change: usize,

    /// How long `shutdown` waits for each worker.
    #[validate(range(min = 1, max = 300))]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Author recorded on automatic commits.
    #[validate(length(min = 1, max = 128))]
    #[serde(default = "default_author")]
    pub author: String,
}

fn default_true() -> bool {
    true
}
fn default_max_rollback_attempts() -> u32 {
    3
}
fn default_health_check_interval() -> u64 {
    300
}
fn default_pattern_refresh_interval() -> u64 {
    3600
}
fn default_queue_capacity() -> usize {
    256
}
fn default_queue_poll_timeout() -> u64 {
    500
}
fn default_max_candidates() -> usize {
    20
}
fn default_shutdown_timeout() -> u64 {
    5
}
fn default_author() -> String {
    "auto-update".into()
}

impl OrchestratorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn pattern_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.pattern_refresh_interval_secs)
    }

    pub fn queue_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            validation_enabled: true,
            auto_rollback: true,
            max_rollback_attempts: default_max_rollback_attempts(),
            health_check_interval_secs: default_health_check_interval(),
            pattern_refresh_interval_secs: default_pattern_refresh_interval(),
            emergency_stop: false,
            queue_capacity: default_queue_capacity(),
            queue_poll_timeout_ms: default_queue_poll_timeout(),
            max_candidates_per_change: default_max_candidates(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            author: default_author(),
        }
    }
}
