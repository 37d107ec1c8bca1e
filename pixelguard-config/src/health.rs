//! Health classification thresholds.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct HealthConfig {
    /// Match latency above which the system is critical (milliseconds).
    #[validate(range(min = 0.001, max = 60_000.0))]
    #[serde(default = "default_critical_latency")]
    pub critical_latency_ms: f64,

    /// Match latency above which the system is degraded (milliseconds).
    #[validate(range(min = 0.001, max = 60_000.0))]
    #[serde(default = "default_degraded_latency")]
    pub degraded_latency_ms: f64,

    /// Index memory above which the system is degraded (megabytes).
    #[validate(range(min = 1.0, max = 1_000_000.0))]
    #[serde(default = "default_degraded_memory")]
    pub degraded_memory_mb: f64,

    /// False-positive rate above which the system is critical.
    #[validate(custom(function = validation::validate_fraction))]
    #[serde(default = "default_critical_fp_rate")]
    pub critical_false_positive_rate: f64,

    /// Samples kept in the health ring buffer.
    #[validate(range(min = 1, max = 10_000))]
    #[serde(default = "default_history_len")]
    pub history_len: usize,
}

fn default_critical_latency() -> f64 {
    100.0
}
fn default_degraded_latency() -> f64 {
    50.0
}
fn default_degraded_memory() -> f64 {
    500.0
}
fn default_critical_fp_rate() -> f64 {
    0.01
}
fn default_history_len() -> usize {
    100
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            critical_latency_ms: default_critical_latency(),
            degraded_latency_ms: default_degraded_latency(),
            degraded_memory_mb: default_degraded_memory(),
            critical_false_positive_rate: default_critical_fp_rate(),
            history_len: default_history_len(),
        }
    }
}
