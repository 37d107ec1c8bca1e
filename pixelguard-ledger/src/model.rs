//! ## pixelguard-ledger::model
//! **Records of the pattern ledger**
//!
//! Commits carry the full materialized snapshot, never a delta, so rolling back
//! is a single read. The structural diff against the parent is stored beside it
//! for audit only.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use pixelguard_core::model::{Snapshot, SnapshotDiff, SourceChanges, SystemHealth};
use pixelguard_validator::BatchSummary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Initial,
    Update,
    Rollback,
}

/// What a commit changed relative to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub kind: ChangeKind,
    pub patterns_added: usize,
    pub patterns_removed: usize,
    pub sources_modified: Vec<String>,
    pub details: BTreeMap<String, SourceChanges>,
    /// Rollback commits only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChangeSummary {
    pub fn from_diff(kind: ChangeKind, diff: SnapshotDiff) -> Self {
        Self {
            kind,
            patterns_added: diff.added_count(),
            patterns_removed: diff.removed_count(),
            sources_modified: diff.sources_modified(),
            details: diff.sources,
            target_commit: None,
            reason: None,
        }
    }
}

/// Immutable, content-addressed ledger node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub commit_id: String,
    /// `None` only for the root commit.
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub message: String,
    pub changes: ChangeSummary,
    pub pattern_snapshot: Snapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_results: Option<BatchSummary>,
    pub branch: String,
}

impl Commit {
    /// Builds a commit and derives its id from every other field.
    pub fn new(
        parent_id: Option<String>,
        author: impl Into<String>,
        message: impl Into<String>,
        changes: ChangeSummary,
        pattern_snapshot: Snapshot,
        validation_results: Option<BatchSummary>,
        branch: impl Into<String>,
    ) -> Self {
        let mut commit = Self {
            commit_id: String::new(),
            parent_id,
            timestamp: Utc::now(),
            author: author.into(),
            message: message.into(),
            changes,
            pattern_snapshot,
            validation_results,
            branch: branch.into(),
        };
        commit.commit_id = commit.content_hash();
        commit
    }

    /// blake3 over the serialized record with an empty id.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        let mut hashed = self.clone();
        hashed.commit_id.clear();
        // Serializing plain data with string keys cannot fail.
        if let Ok(bytes) = serde_json::to_vec(&hashed) {
            hasher.update(&bytes);
        }
        hasher.finalize().to_hex().to_string()
    }

    pub fn is_rollback(&self) -> bool {
        self.changes.kind == ChangeKind::Rollback
    }

    pub fn short_id(&self) -> &str {
        &self.commit_id[..self.commit_id.len().min(8)]
    }
}

/// Named pointer to a head commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub head_commit: Option<String>,
    pub created: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch: Option<String>,
}

impl Branch {
    pub fn new(name: impl Into<String>, head_commit: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            head_commit,
            created: now,
            last_updated: now,
            parent_branch: None,
        }
    }
}

/// Audit record written once a rollback commit has landed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackPoint {
    pub rollback_id: String,
    /// Head of the branch before the rollback.
    pub commit_id: Option<String>,
    pub target_commit: String,
    pub branch: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub pattern_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<SystemHealth>,
    pub automatic: bool,
}

/// Pure comparison of two commits' snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDiff {
    pub from_commit: String,
    pub to_commit: String,
    pub added_patterns: Vec<String>,
    pub removed_patterns: Vec<String>,
    pub source_changes: BTreeMap<String, SourceChanges>,
}

impl PatternDiff {
    pub fn between(from: &Commit, to: &Commit) -> Self {
        let diff = from.pattern_snapshot.diff(&to.pattern_snapshot);
        Self {
            from_commit: from.commit_id.clone(),
            to_commit: to.commit_id.clone(),
            added_patterns: diff.added(),
            removed_patterns: diff.removed(),
            source_changes: diff.sources,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_changes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternAction {
    Added,
    Removed,
    Present,
}

/// One appearance of a pattern in the history of the current branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternHistoryEntry {
    pub commit_id: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub author: String,
    pub source: String,
    pub action: PatternAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub patterns_added: usize,
    pub patterns_removed: usize,
    pub rollbacks: usize,
    pub sources_modified: usize,
}

/// Reporting view over the commits of a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub export_timestamp: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    pub total_commits: usize,
    pub commits: Vec<Commit>,
    pub summary: AuditSummary,
}

/// Durable record of a rejected change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub source: String,
    pub revision: String,
    pub timestamp: DateTime<Utc>,
    pub summary: BatchSummary,
    /// Candidates that did not pass every stage.
    pub rejected_patterns: Vec<String>,
}
