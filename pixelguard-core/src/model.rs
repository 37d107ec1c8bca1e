//! ## pixelguard-core::model
//! **Pattern snapshots and the small enums shared across the pipeline**
//!
//! A [`Snapshot`] is the full materialized state of every source's pattern set.
//! It is ordered (`BTreeMap`/`BTreeSet`) so that hashing and serialization are
//! deterministic for identical content.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Full mapping of source name to its current pattern set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, BTreeSet<String>>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from `(source, patterns)` pairs. Sources with no patterns are dropped.
    pub fn from_sources<S, I, P>(sources: I) -> Self
    where
        S: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = (S, Vec<P>)>,
    {
        let mut snapshot = Self::new();
        for (source, patterns) in sources {
            let set: BTreeSet<String> = patterns.into_iter().map(Into::into).collect();
            if !set.is_empty() {
                snapshot.0.insert(source.into(), set);
            }
        }
        snapshot
    }

    pub fn sources(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    pub fn patterns(&self, source: &str) -> Option<&BTreeSet<String>> {
        self.0.get(source)
    }

    pub fn source_count(&self) -> usize {
        self.0.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, pattern: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(_, patterns)| patterns.contains(pattern))
            .map(|(source, _)| source.as_str())
    }

    /// Returns a new snapshot with `added` inserted into and `removed` taken out of `source`.
    ///
    /// A source whose pattern set becomes empty disappears from the snapshot, so that
    /// "no patterns" has exactly one representation.
    pub fn with_change(&self, source: &str, added: &[String], removed: &[String]) -> Self {
        let mut next = self.clone();
        let entry = next.0.entry(source.to_string()).or_default();
        for pattern in removed {
            entry.remove(pattern);
        }
        entry.extend(added.iter().cloned());
        if entry.is_empty() {
            next.0.remove(source);
        }
        next
    }

    /// Per-source set difference from `self` to `newer`.
    pub fn diff(&self, newer: &Snapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        let sources: BTreeSet<&String> = self.0.keys().chain(newer.0.keys()).collect();
        let empty = BTreeSet::new();

        for source in sources {
            let old = self.0.get(source).unwrap_or(&empty);
            let new = newer.0.get(source).unwrap_or(&empty);
            let added: Vec<String> = new.difference(old).cloned().collect();
            let removed: Vec<String> = old.difference(new).cloned().collect();
            if !added.is_empty() || !removed.is_empty() {
                diff.sources.insert(source.clone(), SourceChanges { added, removed });
            }
        }
        diff
    }
}

impl FromIterator<(String, BTreeSet<String>)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (String, BTreeSet<String>)>>(iter: T) -> Self {
        Self(iter.into_iter().filter(|(_, set)| !set.is_empty()).collect())
    }
}

/// Added/removed patterns for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Structural difference between two snapshots, keyed by source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub sources: BTreeMap<String, SourceChanges>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn added(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .sources
            .values()
            .flat_map(|c| c.added.iter().cloned())
            .collect();
        all.sort();
        all
    }

    pub fn removed(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .sources
            .values()
            .flat_map(|c| c.removed.iter().cloned())
            .collect();
        all.sort();
        all
    }

    pub fn added_count(&self) -> usize {
        self.sources.values().map(|c| c.added.len()).sum()
    }

    pub fn removed_count(&self) -> usize {
        self.sources.values().map(|c| c.removed.len()).sum()
    }

    pub fn sources_modified(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }
}

/// Threat level attached to an indexed domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn is_malicious(self) -> bool {
        matches!(self, ThreatLevel::High | ThreatLevel::Critical)
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Scheduling priority of a pattern source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn threat_level(self) -> ThreatLevel {
        match self {
            Priority::High => ThreatLevel::High,
            Priority::Medium => ThreatLevel::Medium,
            Priority::Low => ThreatLevel::Low,
        }
    }

    pub fn confidence(self) -> Confidence {
        match self {
            Priority::High => Confidence::High,
            Priority::Medium => Confidence::Medium,
            Priority::Low => Confidence::Low,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl std::str::FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(CoreError::UnknownVariant {
                kind: "priority",
                value: s.to_string(),
            }),
        }
    }
}

/// Classified system health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

/// One periodic health sample. Kept in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub timestamp: DateTime<Utc>,
    /// Mean lookup latency over the sample, in milliseconds.
    pub match_latency_ms: f64,
    pub pattern_count: usize,
    pub false_positive_rate: f64,
    pub cache_hit_rate: f64,
    pub memory_mb: f64,
    pub status: HealthStatus,
}
