//! Stage outcomes and their aggregation.

use std::fmt;

use pixelguard_config::ValidationConfig;
use serde::{Deserialize, Serialize};

/// Validation stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Syntax,
    Performance,
    FalsePositive,
    Reputation,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Syntax,
        Stage::Performance,
        Stage::FalsePositive,
        Stage::Reputation,
    ];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Syntax => "syntax",
            Stage::Performance => "performance",
            Stage::FalsePositive => "false_positive",
            Stage::Reputation => "reputation",
        };
        f.write_str(s)
    }
}

/// Measurements recorded by each stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageDetails {
    Syntax {
        compile_time_ms: f64,
        complexity_score: f64,
        pattern_length: usize,
        group_count: usize,
        issues: Vec<String>,
        error: Option<String>,
    },
    Performance {
        avg_match_ns: f64,
        p99_match_ns: f64,
        urls_tested: usize,
        matches: usize,
        wildcard_runs: usize,
        time_score: f64,
        consistency_score: f64,
    },
    FalsePositive {
        false_positive_rate: f64,
        true_positive_rate: f64,
        false_positives: usize,
        true_positives: usize,
        examples: Vec<String>,
    },
    Reputation {
        domains: Vec<String>,
        community_score: f64,
        threat_intel_score: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub pattern: String,
    pub source: String,
    pub stage: Stage,
    pub passed: bool,
    /// Always within `[0, 1]`.
    pub score: f64,
    pub details: StageDetails,
    pub duration_ms: f64,
}

/// Every stage result of one candidate. Stages after the first failure are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    pub pattern: String,
    pub source: String,
    pub results: Vec<ValidationResult>,
}

impl PatternReport {
    pub fn result(&self, stage: Stage) -> Option<&ValidationResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn syntax_passed(&self) -> bool {
        self.result(Stage::Syntax).is_some_and(|r| r.passed)
    }

    pub fn all_passed(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.passed)
    }

    pub fn mean_score(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.results.iter().map(|r| r.score).sum::<f64>() / self.results.len() as f64
    }

    pub fn failed_fraction(&self) -> f64 {
        if self.results.is_empty() {
            return 1.0;
        }
        let failed = self.results.iter().filter(|r| !r.passed).count();
        failed as f64 / self.results.len() as f64
    }

    /// Syntax passed, mean score above the acceptance score, failed fraction under the ceiling.
    pub fn accepted(&self, policy: &ValidationConfig) -> bool {
        self.syntax_passed()
            && self.mean_score() > policy.acceptance_score
            && self.failed_fraction() < policy.max_failed_stage_fraction
    }
}

/// Aggregate over a batch, as written to the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_patterns: usize,
    pub passed_patterns: usize,
    pub failed_patterns: usize,
    pub avg_score: f64,
    pub success_rate: f64,
}

impl BatchSummary {
    pub fn from_reports(reports: &[PatternReport]) -> Self {
        let total = reports.len();
        let passed = reports.iter().filter(|r| r.all_passed()).count();
        let (avg_score, success_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                reports.iter().map(PatternReport::mean_score).sum::<f64>() / total as f64,
                passed as f64 / total as f64,
            )
        };
        Self {
            total_patterns: total,
            passed_patterns: passed,
            failed_patterns: total - passed,
            avg_score,
            success_rate,
        }
    }
}

/// Verdict on a whole change, pooled over every stage result of every candidate.
///
/// A batch with no candidates passes: there is nothing to reject.
pub fn batch_accepted(reports: &[PatternReport], policy: &ValidationConfig) -> bool {
    let results: Vec<&ValidationResult> = reports.iter().flat_map(|r| &r.results).collect();
    if results.is_empty() {
        return true;
    }
    if reports.iter().any(|r| !r.syntax_passed()) {
        return false;
    }
    let total = results.len() as f64;
    let avg = results.iter().map(|r| r.score).sum::<f64>() / total;
    let failed = results.iter().filter(|r| !r.passed).count() as f64 / total;
    avg > policy.acceptance_score && failed < policy.max_failed_stage_fraction
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(stage: Stage, passed: bool, score: f64) -> ValidationResult {
        ValidationResult {
            pattern: "p".into(),
            source: "s".into(),
            stage,
            passed,
            score,
            details: StageDetails::Reputation {
                domains: vec![],
                community_score: score,
                threat_intel_score: score,
            },
            duration_ms: 0.0,
        }
    }

    fn report(results: Vec<ValidationResult>) -> PatternReport {
        PatternReport {
            pattern: "p".into(),
            source: "s".into(),
            results,
        }
    }

    #[test]
    fn acceptance_needs_score_and_low_failure_fraction() {
        let policy = ValidationConfig::default();
        let good = report(Stage::ORDER.iter().map(|s| result(*s, true, 0.9)).collect());
        assert!(good.accepted(&policy));

        let low_score = report(Stage::ORDER.iter().map(|s| result(*s, true, 0.6)).collect());
        assert!(!low_score.accepted(&policy));

        let one_failed = report(vec![
            result(Stage::Syntax, true, 1.0),
            result(Stage::Performance, false, 0.9),
        ]);
        assert!(!one_failed.accepted(&policy));
    }

    #[test]
    fn summary_counts_patterns() {
        let reports = vec![
            report(vec![result(Stage::Syntax, true, 1.0)]),
            report(vec![result(Stage::Syntax, false, 0.0)]),
        ];
        let summary = BatchSummary::from_reports(&reports);
        assert_eq!(summary.total_patterns, 2);
        assert_eq!(summary.passed_patterns, 1);
        assert!((summary.avg_score - 0.5).abs() < 1e-9);
        assert!((summary.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_batch_passes() {
        assert!(batch_accepted(&[], &ValidationConfig::default()));
    }

    #[test]
    fn syntax_failure_rejects_batch() {
        let mut reports: Vec<PatternReport> = (0..9)
            .map(|_| report(Stage::ORDER.iter().map(|s| result(*s, true, 1.0)).collect()))
            .collect();
        reports.push(report(vec![result(Stage::Syntax, false, 0.0)]));
        assert!(!batch_accepted(&reports, &ValidationConfig::default()));
    }
}
