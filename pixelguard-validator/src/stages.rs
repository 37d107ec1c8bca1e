//! ## pixelguard-validator::stages
//! **The four validation stages**
//!
//! ### Expectations:
//! - Every stage returns a [`ValidationResult`] with a score in `[0, 1]`
//! - Stages never error; a broken pattern is a failed result
//! - Only the performance stage measures time on the hot path
//!
//! The regex engine runs in linear time, so catastrophic backtracking cannot be
//! observed by timing alone. The performance stage therefore also counts
//! unbounded wildcard runs, which would backtrack in the engines these rules are
//! shared with.

use std::collections::BTreeSet;
use std::time::Instant;

use once_cell::sync::Lazy;
use pixelguard_config::ValidationConfig;
use pixelguard_detection::{domain, Rule};
use regex::Regex;

use crate::corpus::Corpus;
use crate::reputation::CommunityScore;
use crate::result::{Stage, StageDetails, ValidationResult};

const MAX_REPUTATION_DOMAINS: usize = 10;
const FALSE_POSITIVE_EXAMPLES: usize = 5;

static DOMAIN_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-z0-9][a-z0-9.-]*\.[a-z]{2,}").expect("valid domain token pattern")
});

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1_000.0
}

/// Stage 1. Returns the compiled expression when the stage passed.
pub fn syntax(
    expression: &str,
    pattern: &str,
    source: &str,
    policy: &ValidationConfig,
) -> (ValidationResult, Option<Regex>) {
    let started = Instant::now();
    let complexity_score = complexity_score(expression);

    let compile_start = Instant::now();
    let compiled = Regex::new(expression);
    let compile_time_ms = elapsed_ms(compile_start);

    let regex = match compiled {
        Ok(regex) => regex,
        Err(e) => {
            let result = ValidationResult {
                pattern: pattern.to_string(),
                source: source.to_string(),
                stage: Stage::Syntax,
                passed: false,
                score: 0.0,
                details: StageDetails::Syntax {
                    compile_time_ms,
                    complexity_score,
                    pattern_length: expression.chars().count(),
                    group_count: 0,
                    issues: vec!["regex compilation failed".to_string()],
                    error: Some(e.to_string()),
                },
                duration_ms: elapsed_ms(started),
            };
            return (result, None);
        }
    };

    let pattern_length = expression.chars().count();
    let group_count = regex.captures_len().saturating_sub(1);
    let mut issues = Vec::new();
    if pattern_length > policy.max_pattern_length {
        issues.push(format!(
            "pattern too long ({pattern_length} > {} chars)",
            policy.max_pattern_length
        ));
    }
    if group_count > policy.max_groups {
        issues.push(format!(
            "too many capture groups ({group_count} > {})",
            policy.max_groups
        ));
    }
    if has_nested_quantifier(expression) {
        issues.push("nested quantifier".to_string());
    }
    if compile_time_ms > policy.syntax_budget_ms as f64 {
        issues.push(format!(
            "compile time {compile_time_ms:.2}ms over {}ms budget",
            policy.syntax_budget_ms
        ));
    }

    let compile_score = 1.0 - (compile_time_ms / 100.0).min(0.8);
    let passed = issues.is_empty();
    let result = ValidationResult {
        pattern: pattern.to_string(),
        source: source.to_string(),
        stage: Stage::Syntax,
        passed,
        score: ((compile_score + complexity_score) / 2.0).clamp(0.0, 1.0),
        details: StageDetails::Syntax {
            compile_time_ms,
            complexity_score,
            pattern_length,
            group_count,
            issues,
            error: None,
        },
        duration_ms: elapsed_ms(started),
    };
    (result, passed.then_some(regex))
}

/// Stage 2. Average latency over the performance corpus plus the wildcard hazard check.
pub fn performance(
    regex: &Regex,
    pattern: &str,
    source: &str,
    policy: &ValidationConfig,
    corpus: &Corpus,
) -> ValidationResult {
    let started = Instant::now();
    let urls = corpus.performance_urls();
    let mut timings = Vec::with_capacity(urls.len());
    let mut matches = 0;

    for url in urls {
        let t = Instant::now();
        if regex.is_match(url) {
            matches += 1;
        }
        timings.push(t.elapsed().as_nanos() as f64);
    }

    let (avg, p99) = if timings.is_empty() {
        (0.0, 0.0)
    } else {
        let avg = timings.iter().sum::<f64>() / timings.len() as f64;
        timings.sort_by(|a, b| a.total_cmp(b));
        let rank = ((timings.len() as f64 * 0.99).ceil() as usize).clamp(1, timings.len());
        (avg, timings[rank - 1])
    };

    let wildcard_runs = wildcard_runs(regex.as_str());
    let hazardous = wildcard_runs > policy.max_wildcard_runs;
    let ceiling = policy.max_avg_match_ns as f64;

    let time_score = if hazardous {
        0.0
    } else {
        1.0 - (avg / ceiling).min(1.0)
    };
    let consistency_score = if avg > 0.0 {
        1.0 - ((p99 - avg) / avg).clamp(0.0, 1.0)
    } else {
        1.0
    };

    ValidationResult {
        pattern: pattern.to_string(),
        source: source.to_string(),
        stage: Stage::Performance,
        passed: avg < ceiling && !hazardous,
        score: (time_score + consistency_score) / 2.0,
        details: StageDetails::Performance {
            avg_match_ns: avg,
            p99_match_ns: p99,
            urls_tested: urls.len(),
            matches,
            wildcard_runs,
            time_score,
            consistency_score,
        },
        duration_ms: elapsed_ms(started),
    }
}

/// Stage 3. Match rate over legitimate URLs gates; tracker match rate only scores.
pub fn false_positive(
    regex: &Regex,
    pattern: &str,
    source: &str,
    policy: &ValidationConfig,
    corpus: &Corpus,
) -> ValidationResult {
    let started = Instant::now();
    let legitimate = corpus.legitimate_urls();
    let trackers = corpus.tracker_urls();

    let false_positives: Vec<&String> = legitimate.iter().filter(|u| regex.is_match(u)).collect();
    let true_positives = trackers.iter().filter(|u| regex.is_match(u)).count();

    let fp_rate = rate(false_positives.len(), legitimate.len());
    let tp_rate = rate(true_positives, trackers.len());

    let fp_score = if policy.max_false_positive_rate > 0.0 {
        1.0 - (fp_rate / policy.max_false_positive_rate).min(1.0)
    } else if fp_rate > 0.0 {
        0.0
    } else {
        1.0
    };

    ValidationResult {
        pattern: pattern.to_string(),
        source: source.to_string(),
        stage: Stage::FalsePositive,
        passed: fp_rate < policy.max_false_positive_rate
            || (fp_rate == 0.0 && policy.max_false_positive_rate == 0.0),
        score: fp_score * 0.7 + tp_rate * 0.3,
        details: StageDetails::FalsePositive {
            false_positive_rate: fp_rate,
            true_positive_rate: tp_rate,
            false_positives: false_positives.len(),
            true_positives,
            examples: false_positives
                .iter()
                .take(FALSE_POSITIVE_EXAMPLES)
                .map(|u| u.to_string())
                .collect(),
        },
        duration_ms: elapsed_ms(started),
    }
}

/// Stage 4. Combined community and threat-intelligence confidence.
pub fn reputation(
    rule: &Rule,
    source: &str,
    policy: &ValidationConfig,
    corpus: &Corpus,
    community: &dyn CommunityScore,
) -> ValidationResult {
    let started = Instant::now();
    let domains = extract_domains(rule);

    let (community_score, threat_intel_score) = if domains.is_empty() {
        (0.5, 0.5)
    } else {
        let n = domains.len() as f64;
        let community_total: f64 = domains
            .iter()
            .map(|d| community.score(d).unwrap_or(0.5))
            .sum();
        let intel_total: f64 = domains.iter().map(|d| threat_intel(d, corpus)).sum();
        (community_total / n, intel_total / n)
    };
    let score = ((community_score + threat_intel_score) / 2.0).clamp(0.0, 1.0);

    ValidationResult {
        pattern: rule.raw.clone(),
        source: source.to_string(),
        stage: Stage::Reputation,
        passed: score >= policy.min_reputation_confidence,
        score,
        details: StageDetails::Reputation {
            domains,
            community_score,
            threat_intel_score,
        },
        duration_ms: elapsed_ms(started),
    }
}

fn rate(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn threat_intel(domain: &str, corpus: &Corpus) -> f64 {
    let candidates = || std::iter::once(domain).chain(domain::parents(domain));
    if candidates().any(|d| corpus.is_tracker(d)) {
        0.9
    } else if candidates().any(|d| corpus.is_legitimate(d)) {
        0.1
    } else {
        0.5
    }
}

/// Domains named by a rule: its index key plus hostname-like tokens of the raw text.
pub fn extract_domains(rule: &Rule) -> Vec<String> {
    let mut domains = BTreeSet::new();
    if let Some(key) = &rule.domain {
        domains.insert(key.clone());
    }
    let unescaped = rule.raw.replace("\\.", ".").to_ascii_lowercase();
    for token in DOMAIN_TOKEN.find_iter(&unescaped) {
        let token = token.as_str().trim_matches('.');
        if token.len() > 4 {
            let token = token.strip_prefix("www.").unwrap_or(token);
            domains.insert(token.to_string());
        }
    }
    domains.into_iter().take(MAX_REPUTATION_DOMAINS).collect()
}

/// Lower is more complex. Each factor saturates at 1.
pub fn complexity_score(expression: &str) -> f64 {
    let count = |needle: &str| expression.matches(needle).count() as f64;
    let factors = [
        expression.chars().count() as f64 / 1000.0,
        count("|") / 10.0,
        count("(") / 20.0,
        (count("*") + count("+")) / 10.0,
        (count("(?=") + count("(?!")) / 5.0,
        count(".*") / 5.0,
    ];
    let total: f64 = factors.iter().map(|f| f.min(1.0)).sum();
    (1.0 - total / factors.len() as f64).max(0.0)
}

/// Unbounded wildcard runs (`.*`, `.+`) outside character classes.
pub fn wildcard_runs(expression: &str) -> usize {
    let mut runs = 0;
    let mut in_class = false;
    let mut chars = expression.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '.' if !in_class => {
                if matches!(chars.peek(), Some('*') | Some('+')) {
                    runs += 1;
                }
            }
            _ => {}
        }
    }
    runs
}

/// A quantified group whose body is itself quantified, e.g. `(a+)+`.
pub fn has_nested_quantifier(expression: &str) -> bool {
    let mut groups: Vec<bool> = Vec::new();
    let mut in_class = false;
    let mut closed_quantified_group = false;
    let mut chars = expression.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            chars.next();
            closed_quantified_group = false;
            continue;
        }
        if in_class {
            if c == ']' {
                in_class = false;
            }
            continue;
        }
        match c {
            '[' => {
                in_class = true;
                closed_quantified_group = false;
            }
            '(' => {
                groups.push(false);
                closed_quantified_group = false;
            }
            ')' => {
                let inner = groups.pop().unwrap_or(false);
                if inner {
                    if let Some(parent) = groups.last_mut() {
                        *parent = true;
                    }
                }
                closed_quantified_group = inner;
            }
            '*' | '+' | '{' => {
                if closed_quantified_group {
                    return true;
                }
                if let Some(group) = groups.last_mut() {
                    *group = true;
                }
            }
            '?' => {}
            _ => closed_quantified_group = false,
        }
    }
    false
}
