//! Pattern validation policy.
//!
//! Thresholds for the four validation stages and for overall acceptance. The
//! defaults are the policy constants the pipeline shipped with; none of them are
//! derived, so all of them are overridable.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct ValidationConfig {
    /// Compile-time budget of a candidate pattern (milliseconds).
    #[validate(range(min = 1, max = 10_000))]
    #[serde(default = "default_syntax_budget")]
    pub syntax_budget_ms: u64,

    /// Longest accepted pattern, in characters.
    #[validate(range(min = 16, max = 100_000))]
    #[serde(default = "default_max_pattern_length")]
    pub max_pattern_length: usize,

    /// Most capture groups a pattern may open.
    #[validate(range(min = 1, max = 1_000))]
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    /// Average per-URL match latency ceiling (nanoseconds).
    #[validate(range(min = 1_000, max = 1_000_000_000))]
    #[serde(default = "default_max_avg_match_ns")]
    pub max_avg_match_ns: u64,

    /// Unbounded wildcard runs (`.*`, `.+`) tolerated before a pattern is
    /// considered a backtracking hazard.
    #[validate(range(min = 0, max = 64))]
    #[serde(default = "default_max_wildcard_runs")]
    pub max_wildcard_runs: usize,

    /// Ceiling on the legitimate-corpus match rate.
    #[validate(custom(function = validation::validate_fraction))]
    #[serde(default = "default_max_false_positive_rate")]
    pub max_false_positive_rate: f64,

    /// Minimum combined reputation confidence.
    #[validate(custom(function = validation::validate_fraction))]
    #[serde(default = "default_min_reputation_confidence")]
    pub min_reputation_confidence: f64,

    /// Mean stage score a pattern must exceed to be accepted.
    #[validate(custom(function = validation::validate_fraction))]
    #[serde(default = "default_acceptance_score")]
    pub acceptance_score: f64,

    /// Fraction of failed stages a pattern must stay under to be accepted.
    #[validate(custom(function = validation::validate_fraction))]
    #[serde(default = "default_max_failed_stage_fraction")]
    pub max_failed_stage_fraction: f64,

    /// Worker threads used by batch validation.
    #[validate(range(min = 1, max = 256))]
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Directory holding `legitimate_domains.txt` and `known_trackers.txt`.
    /// When unset the built-in corpus is used.
    #[serde(default)]
    pub corpus_dir: Option<PathBuf>,
}

fn default_syntax_budget() -> u64 {
    10
}
fn default_max_pattern_length() -> usize {
    1000
}
fn default_max_groups() -> usize {
    20
}
fn default_max_avg_match_ns() -> u64 {
    1_000_000
}
fn default_max_wildcard_runs() -> usize {
    2
}
fn default_max_false_positive_rate() -> f64 {
    0.001
}
fn default_min_reputation_confidence() -> f64 {
    0.6
}
fn default_acceptance_score() -> f64 {
    0.7
}
fn default_max_failed_stage_fraction() -> f64 {
    0.2
}
fn default_workers() -> usize {
    num_cpus::get().clamp(1, 8)
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            syntax_budget_ms: default_syntax_budget(),
            max_pattern_length: default_max_pattern_length(),
            max_groups: default_max_groups(),
            max_avg_match_ns: default_max_avg_match_ns(),
            max_wildcard_runs: default_max_wildcard_runs(),
            max_false_positive_rate: default_max_false_positive_rate(),
            min_reputation_confidence: default_min_reputation_confidence(),
            acceptance_score: default_acceptance_score(),
            max_failed_stage_fraction: default_max_failed_stage_fraction(),
            workers: default_workers(),
            corpus_dir: None,
        }
    }
}
