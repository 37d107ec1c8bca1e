//! ## pixelguard-detection::index
//! **O(1) domain index with build-then-swap reloads**
//!
//! ### Expectations:
//! - `lookup` is one hash probe per label of the URL host, independent of corpus size
//! - Rebuilds happen off to the side; readers see the old or the new index, never a mix
//! - Sub-pattern matching only touches the patterns of the looked-up domain
//!
//! ### Components:
//! - [`IndexSnapshot`]: immutable, fully compiled index built from a [`Snapshot`]
//! - [`PatternIndex`]: the live handle holding the current snapshot and hit/miss counters

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use parking_lot::RwLock;
use pixelguard_core::model::{Confidence, Priority, Snapshot, ThreatLevel};
use regex::RegexSet;
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::domain;
use crate::rules::{Matcher, Rule};
use crate::DetectionError;

/// Fixed per-entry overhead used by the memory estimate.
const ENTRY_OVERHEAD_BYTES: usize = 96;

/// Compiled matchers for a group of rules.
#[derive(Debug, Default)]
pub struct PatternSet {
    raw: Vec<String>,
    literals: Option<AhoCorasick>,
    literal_ids: Vec<usize>,
    expressions: Option<RegexSet>,
    expression_ids: Vec<usize>,
}

impl PatternSet {
    fn compile<'a>(rules: impl IntoIterator<Item = &'a Rule>) -> Result<Self, DetectionError> {
        let mut set = PatternSet::default();
        let mut literals = Vec::new();
        let mut expressions = Vec::new();

        for rule in rules {
            let id = set.raw.len();
            set.raw.push(rule.raw.clone());
            match &rule.matcher {
                Matcher::Literal(text) => {
                    literals.push(text.as_str());
                    set.literal_ids.push(id);
                }
                Matcher::Expression(expr) => {
                    expressions.push(expr.as_str());
                    set.expression_ids.push(id);
                }
            }
        }

        if !literals.is_empty() {
            let automaton = AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .build(&literals)
                .map_err(|e| DetectionError::PatternError(e.to_string()))?;
            set.literals = Some(automaton);
        }
        if !expressions.is_empty() {
            let compiled = RegexSet::new(&expressions)
                .map_err(|e| set.expression_error(&expressions, e))?;
            set.expressions = Some(compiled);
        }
        Ok(set)
    }

    // RegexSet errors do not say which member failed; find it on the error path only.
    fn expression_error(&self, expressions: &[&str], err: regex::Error) -> DetectionError {
        let culprit = expressions
            .iter()
            .position(|expr| regex::Regex::new(expr).is_err())
            .map(|i| self.raw[self.expression_ids[i]].as_str());
        match culprit {
            Some(raw) => DetectionError::PatternError(format!("{raw}: {err}")),
            None => DetectionError::PatternError(err.to_string()),
        }
    }

    /// Raw rules matching `url`, in rule order.
    pub fn matches(&self, url: &str) -> Vec<&str> {
        let mut hits = BTreeSet::new();
        if let Some(automaton) = &self.literals {
            for m in automaton.find_overlapping_iter(url) {
                hits.insert(self.literal_ids[m.pattern().as_usize()]);
            }
        }
        if let Some(set) = &self.expressions {
            for i in set.matches(url).into_iter() {
                hits.insert(self.expression_ids[i]);
            }
        }
        hits.into_iter().map(|id| self.raw[id].as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Threat metadata for one base domain.
#[derive(Debug, Serialize)]
pub struct DomainIndexEntry {
    pub base_domain: String,
    pub threat_level: ThreatLevel,
    /// Highest-priority source listing the domain.
    pub source: String,
    pub confidence: Confidence,
    /// Every source listing the domain.
    pub sources: Vec<String>,
    pub sub_patterns: Vec<String>,
    #[serde(skip)]
    matchers: PatternSet,
}

impl DomainIndexEntry {
    /// Sub-patterns of this entry that match `url`.
    pub fn match_sub_patterns(&self, url: &str) -> Vec<String> {
        self.matchers.matches(url).into_iter().map(str::to_string).collect()
    }
}

/// Immutable compiled index. Built once, never mutated.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    domains: HashMap<String, Arc<DomainIndexEntry>>,
    global: PatternSet,
    rule_count: usize,
    approx_bytes: usize,
}

impl IndexSnapshot {
    /// Builds a compiled index from `snapshot`.
    ///
    /// Deterministic in its inputs. Sources missing from `priorities` are
    /// treated as medium priority.
    #[instrument(skip_all, fields(sources = snapshot.source_count()))]
    pub fn build(
        snapshot: &Snapshot,
        priorities: &HashMap<String, Priority>,
    ) -> Result<Self, DetectionError> {
        let mut by_domain: BTreeMap<String, BTreeMap<&str, Vec<Rule>>> = BTreeMap::new();
        let mut global: BTreeMap<String, Rule> = BTreeMap::new();

        for (source, patterns) in snapshot.sources() {
            for pattern in patterns {
                let Some(rule) = Rule::parse(pattern) else {
                    continue;
                };
                match rule.domain.clone() {
                    Some(key) => by_domain
                        .entry(key)
                        .or_default()
                        .entry(source.as_str())
                        .or_default()
                        .push(rule),
                    None => {
                        global.entry(rule.raw.clone()).or_insert(rule);
                    }
                }
            }
        }

        let mut index = IndexSnapshot {
            domains: HashMap::with_capacity(by_domain.len()),
            global: PatternSet::compile(global.values())?,
            rule_count: global.len(),
            approx_bytes: global.keys().map(String::len).sum(),
        };

        for (key, per_source) in by_domain {
            let entry = build_entry(&key, per_source, priorities)?;
            index.rule_count += entry.sub_patterns.len();
            index.approx_bytes += ENTRY_OVERHEAD_BYTES
                + key.len()
                + entry.sub_patterns.iter().map(String::len).sum::<usize>();
            index.domains.insert(key, Arc::new(entry));
        }

        debug!(
            domains = index.domains.len(),
            global = index.global.len(),
            "Index built"
        );
        Ok(index)
    }

    /// Exact base-domain probe, then parent domains nearest first.
    pub fn lookup(&self, url: &str) -> Option<Arc<DomainIndexEntry>> {
        let base = domain::base_domain(url)?;
        if let Some(entry) = self.domains.get(&base) {
            return Some(Arc::clone(entry));
        }
        let entry = domain::parents(&base)
            .find_map(|parent| self.domains.get(parent))
            .map(Arc::clone);
        entry
    }

    /// Domain-less rules matching `url`.
    pub fn match_global(&self, url: &str) -> Vec<String> {
        self.global.matches(url).into_iter().map(str::to_string).collect()
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn approx_memory_bytes(&self) -> usize {
        self.approx_bytes
    }
}

fn build_entry(
    key: &str,
    per_source: BTreeMap<&str, Vec<Rule>>,
    priorities: &HashMap<String, Priority>,
) -> Result<DomainIndexEntry, DetectionError> {
    let priority_of = |source: &str| priorities.get(source).copied().unwrap_or_default();

    // Highest priority wins; among equals the first name in order.
    let mut best: Option<(&str, Priority)> = None;
    for &source in per_source.keys() {
        let priority = priority_of(source);
        if best.map_or(true, |(_, p)| priority > p) {
            best = Some((source, priority));
        }
    }
    let (source, priority) = best.ok_or_else(|| {
        DetectionError::PatternError(format!("domain {key} has no contributing source"))
    })?;

    let threat_level = if per_source.len() > 1 {
        ThreatLevel::Critical
    } else {
        priority.threat_level()
    };

    let mut rules: BTreeMap<&str, &Rule> = BTreeMap::new();
    for rule in per_source.values().flatten() {
        rules.entry(rule.raw.as_str()).or_insert(rule);
    }
    let matchers = PatternSet::compile(rules.values().copied())?;

    Ok(DomainIndexEntry {
        base_domain: key.to_string(),
        threat_level,
        source: source.to_string(),
        confidence: priority.confidence(),
        sources: per_source.keys().map(|s| s.to_string()).collect(),
        sub_patterns: rules.keys().map(|s| s.to_string()).collect(),
        matchers,
    })
}

/// Counters and sizes reported to the health sampler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub domains: usize,
    pub rules: usize,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub approx_memory_bytes: usize,
}

impl IndexStats {
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    pub fn approx_memory_mb(&self) -> f64 {
        self.approx_memory_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Live pattern index shared by every reader.
pub struct PatternIndex {
    current: RwLock<Arc<IndexSnapshot>>,
    priorities: HashMap<String, Priority>,
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PatternIndex {
    pub fn new(priorities: HashMap<String, Priority>) -> Self {
        Self {
            current: RwLock::new(Arc::new(IndexSnapshot::default())),
            priorities,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Compiles `snapshot` without touching the live index.
    pub fn build(&self, snapshot: &Snapshot) -> Result<IndexSnapshot, DetectionError> {
        IndexSnapshot::build(snapshot, &self.priorities)
    }

    /// Replaces the live index in one pointer swap.
    pub fn swap(&self, built: IndexSnapshot) {
        let built = Arc::new(built);
        *self.current.write() = built;
    }

    /// Build-then-swap. On error the live index is left as it was.
    #[instrument(skip_all)]
    pub fn rebuild(&self, snapshot: &Snapshot) -> Result<IndexStats, DetectionError> {
        let built = self.build(snapshot)?;
        info!(
            domains = built.domain_count(),
            rules = built.rule_count(),
            "Pattern index reloaded"
        );
        self.swap(built);
        Ok(self.stats())
    }

    /// The snapshot readers are currently served from.
    pub fn current(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read())
    }

    #[inline]
    pub fn lookup(&self, url: &str) -> Option<Arc<DomainIndexEntry>> {
        let found = self.current().lookup(url);
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn match_sub_patterns(&self, url: &str, entry: &DomainIndexEntry) -> Vec<String> {
        entry.match_sub_patterns(url)
    }

    pub fn match_global(&self, url: &str) -> Vec<String> {
        self.current().match_global(url)
    }

    pub fn stats(&self) -> IndexStats {
        let current = self.current();
        IndexStats {
            domains: current.domain_count(),
            rules: current.rule_count(),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            approx_memory_bytes: current.approx_memory_bytes(),
        }
    }
}

impl Default for PatternIndex {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
