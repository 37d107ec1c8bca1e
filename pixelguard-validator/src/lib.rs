//! # PixelGuard Validator
//!
//! Runs candidate patterns through the ordered validation stages before they
//! can reach a commit.
//!
//! ### Key Submodules:
//! - `stages`: syntax, performance, false-positive and reputation checks
//! - `corpus`: legitimate and tracker URL sets the stages run against
//! - `result`: per-stage results, per-pattern reports and batch verdicts
//! - `reputation`: pluggable community score source
//!
//! Stages run strictly in order and stop at the first failure, so a report
//! never carries results for stages after the failing one.

pub mod corpus;
pub mod reputation;
pub mod result;
pub mod stages;

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel;
use pixelguard_config::ValidationConfig;
use pixelguard_detection::Rule;
use thiserror::Error;
use tracing::{debug, instrument, warn};

pub use corpus::Corpus;
pub use reputation::{CommunityScore, KeywordCommunityScore};
pub use result::{batch_accepted, BatchSummary, PatternReport, Stage, StageDetails, ValidationResult};

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("Corpus error: {0}")]
    Corpus(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validates candidate patterns against a fixed policy and corpus.
#[derive(Clone)]
pub struct PatternValidator {
    policy: ValidationConfig,
    corpus: Arc<Corpus>,
    community: Arc<dyn CommunityScore>,
}

impl PatternValidator {
    pub fn new(policy: ValidationConfig, corpus: Corpus) -> Self {
        Self {
            policy,
            corpus: Arc::new(corpus),
            community: Arc::new(KeywordCommunityScore),
        }
    }

    /// Loads the corpus from `corpus_dir` when configured, the built-in corpus otherwise.
    pub fn from_config(policy: &ValidationConfig) -> Result<Self, ValidatorError> {
        let corpus = match &policy.corpus_dir {
            Some(dir) => Corpus::load(dir)?,
            None => Corpus::builtin(),
        };
        Ok(Self::new(policy.clone(), corpus))
    }

    /// Replaces the community score source.
    pub fn with_community(mut self, community: Arc<dyn CommunityScore>) -> Self {
        self.community = community;
        self
    }

    pub fn policy(&self) -> &ValidationConfig {
        &self.policy
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    /// Runs every stage on one candidate line, stopping at the first failure.
    #[instrument(skip_all, fields(source = source))]
    pub fn validate(&self, pattern: &str, source: &str) -> PatternReport {
        let started = Instant::now();
        let mut report = PatternReport {
            pattern: pattern.to_string(),
            source: source.to_string(),
            results: Vec::with_capacity(Stage::ORDER.len()),
        };

        let Some(rule) = Rule::parse(pattern) else {
            report.results.push(unparseable(pattern, source));
            return report;
        };

        let (syntax, compiled) = stages::syntax(&rule.expression(), pattern, source, &self.policy);
        report.results.push(syntax);
        let Some(regex) = compiled else {
            debug!(pattern, "Rejected at syntax stage");
            return report;
        };

        let performance = stages::performance(&regex, pattern, source, &self.policy, &self.corpus);
        let passed = performance.passed;
        report.results.push(performance);
        if !passed {
            debug!(pattern, "Rejected at performance stage");
            return report;
        }

        let false_positive =
            stages::false_positive(&regex, pattern, source, &self.policy, &self.corpus);
        let passed = false_positive.passed;
        report.results.push(false_positive);
        if !passed {
            debug!(pattern, "Rejected at false-positive stage");
            return report;
        }

        report.results.push(stages::reputation(
            &rule,
            source,
            &self.policy,
            &self.corpus,
            self.community.as_ref(),
        ));

        debug!(
            pattern,
            elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0,
            accepted = report.accepted(&self.policy),
            "Pattern validated"
        );
        report
    }

    /// Validates `(pattern, source)` candidates on a bounded worker pool.
    ///
    /// Reports come back in input order. A failing candidate never affects another.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn validate_batch(&self, candidates: &[(String, String)]) -> Vec<PatternReport> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let workers = self.policy.workers.clamp(1, candidates.len());
        let (job_tx, job_rx) = channel::unbounded::<(usize, &(String, String))>();
        let (report_tx, report_rx) = channel::unbounded::<(usize, PatternReport)>();

        for job in candidates.iter().enumerate() {
            // The receiver outlives this loop, so sending cannot fail.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let scoped = crossbeam::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let report_tx = report_tx.clone();
                scope.spawn(move |_| {
                    for (i, (pattern, source)) in job_rx.iter() {
                        if report_tx.send((i, self.validate(pattern, source))).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        drop(report_tx);
        if scoped.is_err() {
            warn!("A validation worker panicked; its candidates are reported as failed");
        }

        let mut reports: Vec<Option<PatternReport>> = vec![None; candidates.len()];
        for (i, report) in report_rx.iter() {
            reports[i] = Some(report);
        }
        reports
            .into_iter()
            .zip(candidates)
            .map(|(report, (pattern, source))| {
                report.unwrap_or_else(|| PatternReport {
                    pattern: pattern.clone(),
                    source: source.clone(),
                    results: vec![unparseable(pattern, source)],
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for PatternValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatternValidator")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn unparseable(pattern: &str, source: &str) -> ValidationResult {
    ValidationResult {
        pattern: pattern.to_string(),
        source: source.to_string(),
        stage: Stage::Syntax,
        passed: false,
        score: 0.0,
        details: StageDetails::Syntax {
            compile_time_ms: 0.0,
            complexity_score: 0.0,
            pattern_length: pattern.chars().count(),
            group_count: 0,
            issues: vec!["line carries no network rule".to_string()],
            error: None,
        },
        duration_ms: 0.0,
    }
}
