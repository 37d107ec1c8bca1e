//! ## pixelguard-ledger::ledger
//! **Append-only version control for pattern snapshots**
//!
//! ### Expectations:
//! - History is never rewritten; a rollback is a new commit carrying an older snapshot
//! - Concurrent commits on one branch are serialized by the store's head CAS
//! - Every non-root commit's parent exists in the store

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pixelguard_config::LedgerConfig;
use pixelguard_core::model::{Snapshot, SnapshotDiff, SystemHealth};
use pixelguard_validator::BatchSummary;
use tracing::{debug, error, info, instrument, warn};

use crate::model::{
    AuditSummary, AuditTrail, Branch, ChangeKind, ChangeSummary, Commit, PatternAction,
    PatternDiff, PatternHistoryEntry, RollbackPoint, ValidationFailure,
};
use crate::store::{FileStore, LedgerStore, MemoryStore};
use crate::LedgerError;

const MAX_COMMIT_ATTEMPTS: usize = 64;
const ROLLBACK_AUTHOR: &str = "rollback-system";

pub struct PatternLedger {
    store: Arc<dyn LedgerStore>,
    current_branch: RwLock<String>,
    history_limit: usize,
}

impl PatternLedger {
    /// File-backed ledger rooted at `config.root`.
    pub fn open(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let store = FileStore::open(&config.root)?;
        Self::with_store(Arc::new(store), &config.default_branch, config.history_limit)
    }

    /// Ledger that lives only as long as the process.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let config = LedgerConfig::default();
        Self::with_store(
            Arc::new(MemoryStore::new()),
            &config.default_branch,
            config.history_limit,
        )
    }

    /// Wraps `store`, creating `default_branch` and the empty root commit if absent.
    pub fn with_store(
        store: Arc<dyn LedgerStore>,
        default_branch: &str,
        history_limit: usize,
    ) -> Result<Self, LedgerError> {
        if store.get_branch(default_branch)?.is_none() {
            store.create_branch(Branch::new(default_branch, None))?;
            let root = Commit::new(
                None,
                "system",
                "Initial commit",
                ChangeSummary::from_diff(ChangeKind::Initial, SnapshotDiff::default()),
                Snapshot::new(),
                None,
                default_branch,
            );
            store.append_commit(&root, None)?;
            info!(commit = root.short_id(), branch = default_branch, "Ledger initialized");
        }
        Ok(Self {
            store,
            current_branch: RwLock::new(default_branch.to_string()),
            history_limit: history_limit.max(1),
        })
    }

    pub fn current_branch(&self) -> String {
        self.current_branch.read().clone()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub fn head_id(&self) -> Result<Option<String>, LedgerError> {
        let branch = self.current_branch();
        self.store
            .get_branch(&branch)?
            .map(|b| b.head_commit)
            .ok_or(LedgerError::BranchNotFound(branch))
    }

    /// Head commit of the current branch.
    pub fn head(&self) -> Result<Commit, LedgerError> {
        let head = self
            .head_id()?
            .ok_or_else(|| LedgerError::CommitNotFound("HEAD".to_string()))?;
        self.require(&head)
    }

    pub fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>, LedgerError> {
        self.store.get_commit(commit_id)
    }

    fn require(&self, commit_id: &str) -> Result<Commit, LedgerError> {
        self.store
            .get_commit(commit_id)?
            .ok_or_else(|| LedgerError::CommitNotFound(commit_id.to_string()))
    }

    /// Records `snapshot` as the new head of the current branch.
    ///
    /// `snapshot` is taken as the complete new state: a head that moves
    /// meanwhile is replaced, not merged. Callers that derived `snapshot` from
    /// a head they read use [`PatternLedger::commit_on`].
    #[instrument(skip_all, fields(message = message))]
    pub fn commit(
        &self,
        snapshot: Snapshot,
        message: &str,
        author: &str,
        validation: Option<BatchSummary>,
    ) -> Result<String, LedgerError> {
        self.append(|parent| {
            let diff = parent
                .map(|p| p.pattern_snapshot.diff(&snapshot))
                .unwrap_or_else(|| Snapshot::new().diff(&snapshot));
            (
                author.to_string(),
                message.to_string(),
                ChangeSummary::from_diff(ChangeKind::Update, diff),
                snapshot.clone(),
                validation,
            )
        })
    }

    /// Commits `snapshot` only if `parent_id` is still the head of the current branch.
    ///
    /// Fails with [`LedgerError::HeadConflict`] without writing anything when the
    /// head has moved, so the caller can rebuild its snapshot from the new head.
    #[instrument(skip_all, fields(parent = parent_id, message = message))]
    pub fn commit_on(
        &self,
        parent_id: &str,
        snapshot: Snapshot,
        message: &str,
        author: &str,
        validation: Option<BatchSummary>,
    ) -> Result<String, LedgerError> {
        let parent = self.require(parent_id)?;
        let branch = self.current_branch();
        let diff = parent.pattern_snapshot.diff(&snapshot);
        let commit = Commit::new(
            Some(parent.commit_id),
            author,
            message,
            ChangeSummary::from_diff(ChangeKind::Update, diff),
            snapshot,
            validation,
            branch.as_str(),
        );
        self.store.append_commit(&commit, Some(parent_id))?;
        info!(
            commit = commit.short_id(),
            branch = %branch,
            added = commit.changes.patterns_added,
            removed = commit.changes.patterns_removed,
            "Committed pattern snapshot"
        );
        Ok(commit.commit_id)
    }

    /// Read head, build on it, CAS the head; retry from a fresh read on conflict.
    fn append<F>(&self, build: F) -> Result<String, LedgerError>
    where
        F: Fn(Option<&Commit>) -> (String, String, ChangeSummary, Snapshot, Option<BatchSummary>),
    {
        let branch = self.current_branch();
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let head_id = self
                .store
                .get_branch(&branch)?
                .ok_or_else(|| LedgerError::BranchNotFound(branch.clone()))?
                .head_commit;
            let parent = match &head_id {
                Some(id) => Some(self.require(id)?),
                None => None,
            };

            let (author, message, changes, snapshot, validation) = build(parent.as_ref());
            let commit = Commit::new(
                head_id.clone(),
                author,
                message,
                changes,
                snapshot,
                validation,
                branch.as_str(),
            );

            match self.store.append_commit(&commit, head_id.as_deref()) {
                Ok(()) => {
                    info!(
                        commit = commit.short_id(),
                        branch = %branch,
                        added = commit.changes.patterns_added,
                        removed = commit.changes.patterns_removed,
                        "Committed pattern snapshot"
                    );
                    return Ok(commit.commit_id);
                }
                Err(LedgerError::HeadConflict { .. }) => {
                    debug!(attempt, branch = %branch, "Branch head moved, retrying commit");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(branch = %branch, "Commit abandoned after repeated head conflicts");
        Err(LedgerError::HeadConflict {
            branch,
            expected: None,
            found: None,
        })
    }

    /// Structural comparison of two commits' snapshots.
    pub fn diff(&self, from_id: &str, to_id: &str) -> Result<PatternDiff, LedgerError> {
        let from = self.require(from_id)?;
        let to = self.require(to_id)?;
        Ok(PatternDiff::between(&from, &to))
    }

    /// Creates a new commit carrying the snapshot of `target_id`.
    ///
    /// Fails with [`LedgerError::CommitNotFound`] without touching the ledger when
    /// the target does not exist. Returns the id of the rollback commit.
    #[instrument(skip_all, fields(target_commit = target_id))]
    pub fn rollback_to_commit(
        &self,
        target_id: &str,
        reason: &str,
        health: Option<SystemHealth>,
        automatic: bool,
    ) -> Result<String, LedgerError> {
        let Some(target) = self.store.get_commit(target_id)? else {
            error!(target_commit = target_id, "Rollback target not found");
            return Err(LedgerError::CommitNotFound(target_id.to_string()));
        };

        // Head the rollback commit actually replaced, set by the winning attempt.
        let replaced: RefCell<Option<(String, usize)>> = RefCell::new(None);
        let message = format!("Rollback to {}: {reason}", target.short_id());
        let id = self.append(|parent| {
            *replaced.borrow_mut() =
                parent.map(|p| (p.commit_id.clone(), p.pattern_snapshot.pattern_count()));
            let diff = parent
                .map(|p| p.pattern_snapshot.diff(&target.pattern_snapshot))
                .unwrap_or_default();
            let mut changes = ChangeSummary::from_diff(ChangeKind::Rollback, diff);
            changes.target_commit = Some(target.commit_id.clone());
            changes.reason = Some(reason.to_string());
            (
                ROLLBACK_AUTHOR.to_string(),
                message.clone(),
                changes,
                target.pattern_snapshot.clone(),
                None,
            )
        })?;

        let (replaced_id, pattern_count) = replaced.into_inner().unzip();
        let point = RollbackPoint {
            rollback_id: rollback_id(
                replaced_id.as_deref().unwrap_or_default(),
                &target.commit_id,
                reason,
            ),
            commit_id: replaced_id,
            target_commit: target.commit_id.clone(),
            branch: self.current_branch(),
            timestamp: Utc::now(),
            reason: reason.to_string(),
            pattern_count: pattern_count.unwrap_or_default(),
            health,
            automatic,
        };
        // The commit already records target and reason; a point that fails to persist is logged.
        if let Err(e) = self.store.append_rollback_point(&point) {
            error!(commit = %id, error = %e, "Rollback point could not be recorded");
        }
        warn!(target_commit = target.short_id(), reason, "Rolled back pattern set");
        Ok(id)
    }

    /// Walks parent links from the head, newest first.
    pub fn get_history(&self, limit: usize) -> Result<Vec<Commit>, LedgerError> {
        let limit = limit.min(self.history_limit);
        let mut history = Vec::new();
        let mut next = self.head_id()?;
        while let Some(id) = next {
            if history.len() >= limit {
                break;
            }
            let commit = self.store.get_commit(&id)?.ok_or_else(|| {
                LedgerError::CorruptStore(format!("parent {id} missing from history"))
            })?;
            next = commit.parent_id.clone();
            history.push(commit);
        }
        Ok(history)
    }

    /// Newest non-rollback commit older than the commit whose snapshot is live.
    ///
    /// The live commit is the head, or the head's target when the head is a
    /// rollback, so successive emergency rollbacks walk further back.
    pub fn latest_stable_commit(&self) -> Result<Option<Commit>, LedgerError> {
        let history = self.get_history(self.history_limit)?;
        let live = match history.first() {
            Some(head) if head.is_rollback() => head.changes.target_commit.clone(),
            Some(head) => Some(head.commit_id.clone()),
            None => None,
        };
        let Some(live) = live else {
            return Ok(None);
        };
        Ok(history
            .into_iter()
            .skip_while(|c| c.commit_id != live)
            .skip(1)
            .find(|c| !c.is_rollback()))
    }

    /// New branch pointing at `from` (default: the current head).
    pub fn create_branch(&self, name: &str, from: Option<&str>) -> Result<(), LedgerError> {
        let head = match from {
            Some(id) => Some(self.require(id)?.commit_id),
            None => self.head_id()?,
        };
        let mut branch = Branch::new(name, head);
        branch.parent_branch = Some(self.current_branch());
        self.store.create_branch(branch)?;
        info!(branch = name, "Branch created");
        Ok(())
    }

    pub fn switch_branch(&self, name: &str) -> Result<(), LedgerError> {
        if self.store.get_branch(name)?.is_none() {
            return Err(LedgerError::BranchNotFound(name.to_string()));
        }
        *self.current_branch.write() = name.to_string();
        info!(branch = name, "Switched branch");
        Ok(())
    }

    pub fn list_branches(&self) -> Result<Vec<Branch>, LedgerError> {
        self.store.list_branches()
    }

    /// Commits of the current branch within `[start, end]`, with aggregate counts.
    pub fn export_audit_trail(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<AuditTrail, LedgerError> {
        let now = Utc::now();
        let end = end.unwrap_or(now);
        let commits: Vec<Commit> = self
            .get_history(self.history_limit)?
            .into_iter()
            .filter(|c| start.map_or(true, |s| c.timestamp >= s) && c.timestamp <= end)
            .collect();

        let sources: BTreeSet<&String> = commits
            .iter()
            .flat_map(|c| &c.changes.sources_modified)
            .collect();
        let summary = AuditSummary {
            patterns_added: commits.iter().map(|c| c.changes.patterns_added).sum(),
            patterns_removed: commits.iter().map(|c| c.changes.patterns_removed).sum(),
            rollbacks: commits.iter().filter(|c| c.is_rollback()).count(),
            sources_modified: sources.len(),
        };

        Ok(AuditTrail {
            export_timestamp: now,
            start,
            end,
            total_commits: commits.len(),
            commits,
            summary,
        })
    }

    /// Commits in which `pattern` was added, removed or present, newest first.
    pub fn pattern_history(
        &self,
        pattern: &str,
        limit: usize,
    ) -> Result<Vec<PatternHistoryEntry>, LedgerError> {
        let mut entries = Vec::new();
        for commit in self.get_history(limit.saturating_mul(3))? {
            let entry = |source: &str, action| PatternHistoryEntry {
                commit_id: commit.commit_id.clone(),
                timestamp: commit.timestamp,
                message: commit.message.clone(),
                author: commit.author.clone(),
                source: source.to_string(),
                action,
            };
            for (source, changes) in &commit.changes.details {
                if changes.added.iter().any(|p| p == pattern) {
                    entries.push(entry(source, PatternAction::Added));
                } else if changes.removed.iter().any(|p| p == pattern) {
                    entries.push(entry(source, PatternAction::Removed));
                }
            }
            if let Some(source) = commit.pattern_snapshot.contains(pattern) {
                entries.push(entry(source, PatternAction::Present));
            }
        }
        entries.truncate(limit);
        Ok(entries)
    }

    /// Appends a rejected change to the failure log.
    pub fn record_validation_failure(&self, failure: &ValidationFailure) -> Result<(), LedgerError> {
        self.store.append_validation_failure(failure)?;
        warn!(
            source = %failure.source,
            revision = %failure.revision,
            failed = failure.summary.failed_patterns,
            "Validation failure recorded"
        );
        Ok(())
    }

    pub fn validation_failures(&self) -> Result<Vec<ValidationFailure>, LedgerError> {
        self.store.validation_failures()
    }

    pub fn rollback_points(&self) -> Result<Vec<RollbackPoint>, LedgerError> {
        self.store.rollback_points()
    }
}

fn rollback_id(head: &str, target: &str, reason: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(head.as_bytes());
    hasher.update(target.as_bytes());
    hasher.update(reason.as_bytes());
    hasher.update(&Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn snap(patterns: &[&str]) -> Snapshot {
        Snapshot::from_sources([("s", patterns.to_vec())])
    }

    #[test]
    fn diff_across_three_commits() {
        let ledger = PatternLedger::in_memory().unwrap();
        let c1 = ledger.head_id().unwrap().unwrap();
        ledger.commit(snap(&["p1"]), "add p1", "test", None).unwrap();
        let c3 = ledger.commit(snap(&["p1", "p2"]), "add p2", "test", None).unwrap();

        let diff = ledger.diff(&c1, &c3).unwrap();
        assert_eq!(diff.added_patterns, vec!["p1", "p2"]);

        let c2 = ledger.get_history(3).unwrap()[1].commit_id.clone();
        let diff = ledger.diff(&c2, &c3).unwrap();
        assert_eq!(diff.added_patterns, vec!["p2"]);
        assert!(diff.removed_patterns.is_empty());
    }

    #[test]
    fn empty_then_two_commits_reports_single_addition() {
        let ledger = PatternLedger::in_memory().unwrap();
        let c1 = ledger.commit(Snapshot::new(), "empty", "test", None).unwrap();
        ledger.commit(snap(&["p1"]), "p1", "test", None).unwrap();
        let c3 = ledger.commit(snap(&["p1", "p2"]), "p2", "test", None).unwrap();

        let diff = ledger.diff(&c1, &c3).unwrap();
        assert_eq!(diff.added_patterns, vec!["p1", "p2"]);
        let c2 = ledger.get_history(2).unwrap()[1].commit_id.clone();
        assert_eq!(ledger.diff(&c2, &c3).unwrap().added_patterns, vec!["p2"]);
    }

    #[test]
    fn rollback_appends_a_commit_with_the_target_snapshot() {
        let ledger = PatternLedger::in_memory().unwrap();
        let c0 = ledger.commit(snap(&["a"]), "c0", "test", None).unwrap();
        let c1 = ledger.commit(snap(&["a", "b"]), "c1", "test", None).unwrap();
        let c2 = ledger.commit(snap(&["b", "c"]), "c2", "test", None).unwrap();
        let before: Vec<Commit> = [&c0, &c1, &c2]
            .iter()
            .map(|id| ledger.get_commit(id).unwrap().unwrap())
            .collect();
        let history_len = ledger.get_history(100).unwrap().len();

        let rollback = ledger.rollback_to_commit(&c0, "bad update", None, false).unwrap();

        let head = ledger.get_history(1).unwrap().remove(0);
        assert_eq!(head.commit_id, rollback);
        assert_eq!(head.pattern_snapshot, before[0].pattern_snapshot);
        assert!(head.is_rollback());
        assert_eq!(head.changes.target_commit.as_deref(), Some(c0.as_str()));
        assert_eq!(ledger.get_history(100).unwrap().len(), history_len + 1);
        for commit in &before {
            assert_eq!(&ledger.get_commit(&commit.commit_id).unwrap().unwrap(), commit);
        }

        let points = ledger.rollback_points().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].commit_id.as_deref(), Some(c2.as_str()));
    }

    #[test]
    fn rollback_to_missing_commit_changes_nothing() {
        let ledger = PatternLedger::in_memory().unwrap();
        ledger.commit(snap(&["a"]), "c0", "test", None).unwrap();
        let head = ledger.head_id().unwrap();

        let err = ledger.rollback_to_commit("deadbeef", "nope", None, false);
        assert!(matches!(err, Err(LedgerError::CommitNotFound(_))));
        assert_eq!(ledger.head_id().unwrap(), head);
        assert!(ledger.rollback_points().unwrap().is_empty());
    }

    #[test]
    fn concurrent_commits_form_one_chain() {
        const N: usize = 16;
        let ledger = Arc::new(PatternLedger::in_memory().unwrap());
        let root = ledger.head_id().unwrap().unwrap();

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let name = format!("p{i}");
                    ledger
                        .commit(snap(&[name.as_str()]), &format!("commit {i}"), "test", None)
                        .unwrap()
                })
            })
            .collect();
        let ids: BTreeSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), N);

        let history = ledger.get_history(N + 10).unwrap();
        assert_eq!(history.len(), N + 1);
        assert_eq!(history.last().unwrap().commit_id, root);
        assert!(ids.contains(&history[0].commit_id));
        for pair in history.windows(2) {
            assert_eq!(pair[0].parent_id.as_deref(), Some(pair[1].commit_id.as_str()));
        }
        let chained: BTreeSet<String> =
            history[..N].iter().map(|c| c.commit_id.clone()).collect();
        assert_eq!(chained, ids);
    }

    #[test]
    fn branches_are_independent_pointers() {
        let ledger = PatternLedger::in_memory().unwrap();
        ledger.commit(snap(&["a"]), "main work", "test", None).unwrap();
        ledger.create_branch("experiment", None).unwrap();
        assert!(matches!(
            ledger.create_branch("experiment", None),
            Err(LedgerError::BranchExists(_))
        ));

        ledger.switch_branch("experiment").unwrap();
        ledger.commit(snap(&["a", "b"]), "experiment work", "test", None).unwrap();
        assert_eq!(ledger.current_branch(), "experiment");

        ledger.switch_branch("main").unwrap();
        assert_eq!(ledger.head().unwrap().pattern_snapshot, snap(&["a"]));
        assert_eq!(ledger.list_branches().unwrap().len(), 2);
        assert!(matches!(
            ledger.switch_branch("nope"),
            Err(LedgerError::BranchNotFound(_))
        ));
    }

    #[test]
    fn history_respects_limit() {
        let ledger = PatternLedger::with_store(Arc::new(MemoryStore::new()), "main", 3).unwrap();
        for i in 0..5 {
            ledger.commit(snap(&[format!("p{i}").as_str()]), "c", "test", None).unwrap();
        }
        assert_eq!(ledger.get_history(100).unwrap().len(), 3);
        assert_eq!(ledger.get_history(2).unwrap().len(), 2);
    }

    #[test]
    fn audit_trail_counts_changes_and_rollbacks() {
        let ledger = PatternLedger::in_memory().unwrap();
        let c0 = ledger.commit(snap(&["a"]), "c0", "test", None).unwrap();
        ledger.commit(snap(&["a", "b"]), "c1", "test", None).unwrap();
        ledger.rollback_to_commit(&c0, "manual", None, false).unwrap();

        let audit = ledger.export_audit_trail(None, None).unwrap();
        assert_eq!(audit.total_commits, 4);
        assert_eq!(audit.summary.patterns_added, 2);
        assert_eq!(audit.summary.patterns_removed, 1);
        assert_eq!(audit.summary.rollbacks, 1);
        assert_eq!(audit.summary.sources_modified, 1);

        let future = Utc::now() + chrono::Duration::hours(1);
        let empty = ledger.export_audit_trail(Some(future), None).unwrap();
        assert_eq!(empty.total_commits, 0);
    }

    #[test]
    fn pattern_history_tracks_lifecycle() {
        let ledger = PatternLedger::in_memory().unwrap();
        ledger.commit(snap(&["a"]), "add", "test", None).unwrap();
        ledger.commit(snap(&["b"]), "remove", "test", None).unwrap();

        let history = ledger.pattern_history("a", 10).unwrap();
        let actions: Vec<PatternAction> = history.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![PatternAction::Removed, PatternAction::Added, PatternAction::Present]
        );
        assert!(history.iter().all(|e| e.source == "s"));
    }

    #[test]
    fn latest_stable_walks_back_past_rollbacks() {
        let ledger = PatternLedger::in_memory().unwrap();
        let root = ledger.head_id().unwrap().unwrap();
        let c0 = ledger.commit(snap(&["a"]), "c0", "test", None).unwrap();
        let c1 = ledger.commit(snap(&["a", "b"]), "c1", "test", None).unwrap();
        assert_eq!(ledger.latest_stable_commit().unwrap().unwrap().commit_id, c0);

        ledger.rollback_to_commit(&c0, "manual", None, false).unwrap();
        assert_eq!(ledger.latest_stable_commit().unwrap().unwrap().commit_id, root);
        assert_ne!(ledger.head_id().unwrap().unwrap(), c1);

        ledger.rollback_to_commit(&root, "manual", None, false).unwrap();
        assert!(ledger.latest_stable_commit().unwrap().is_none());
    }

    #[test]
    fn file_backed_ledger_reopens_with_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig {
            root: dir.path().join("ledger"),
            ..Default::default()
        };
        let id = {
            let ledger = PatternLedger::open(&config).unwrap();
            ledger.commit(snap(&["a"]), "persisted", "test", None).unwrap()
        };
        let ledger = PatternLedger::open(&config).unwrap();
        assert_eq!(ledger.head_id().unwrap(), Some(id));
        assert_eq!(ledger.get_history(10).unwrap().len(), 2);
    }

    fn file_config(dir: &std::path::Path) -> LedgerConfig {
        LedgerConfig {
            root: dir.join("ledger"),
            ..Default::default()
        }
    }

    #[test]
    fn rollback_from_another_handle_stays_in_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path());
        let operator = PatternLedger::open(&config).unwrap();
        let service = PatternLedger::open(&config).unwrap();

        let c1 = service.commit(snap(&["a"]), "c1", "test", None).unwrap();
        service.commit(snap(&["a", "b"]), "c2", "test", None).unwrap();
        let rollback = operator.rollback_to_commit(&c1, "operator", None, false).unwrap();

        let head = service.head().unwrap();
        assert_eq!(head.commit_id, rollback);
        let c3 = service
            .commit_on(&head.commit_id, snap(&["a", "c"]), "c3", "test", None)
            .unwrap();

        let history = operator.get_history(10).unwrap();
        let ids: Vec<&str> = history.iter().map(|c| c.commit_id.as_str()).collect();
        assert_eq!(ids[0], c3);
        assert_eq!(ids[1], rollback);
        assert_eq!(history[0].parent_id.as_deref(), Some(rollback.as_str()));
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn handles_committing_concurrently_form_one_chain() {
        const HANDLES: usize = 4;
        const PER_HANDLE: usize = 5;
        let dir = tempfile::tempdir().unwrap();
        let config = file_config(dir.path());
        PatternLedger::open(&config).unwrap();

        let workers: Vec<_> = (0..HANDLES)
            .map(|h| {
                let config = config.clone();
                thread::spawn(move || {
                    let ledger = PatternLedger::open(&config).unwrap();
                    (0..PER_HANDLE)
                        .map(|i| {
                            let pattern = format!("h{h}-p{i}");
                            ledger
                                .commit(snap(&[pattern.as_str()]), "c", "test", None)
                                .unwrap()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let ids: BTreeSet<String> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();

        let history = PatternLedger::open(&config).unwrap().get_history(100).unwrap();
        assert_eq!(history.len(), HANDLES * PER_HANDLE + 1);
        for pair in history.windows(2) {
            assert_eq!(pair[0].parent_id.as_deref(), Some(pair[1].commit_id.as_str()));
        }
        let chained: BTreeSet<String> = history[..HANDLES * PER_HANDLE]
            .iter()
            .map(|c| c.commit_id.clone())
            .collect();
        assert_eq!(chained, ids);
    }

    #[test]
    fn commit_on_a_moved_head_is_refused() {
        let ledger = PatternLedger::in_memory().unwrap();
        let c1 = ledger.commit(snap(&["a"]), "c1", "test", None).unwrap();
        ledger.rollback_to_commit(&c1, "manual", None, false).unwrap();
        let head = ledger.head_id().unwrap();

        let stale = ledger.commit_on(&c1, snap(&["a", "b"]), "stale", "test", None);
        assert!(matches!(stale, Err(LedgerError::HeadConflict { .. })));
        assert_eq!(ledger.head_id().unwrap(), head);
    }

    /// Memory store whose commit appends can be switched off.
    #[derive(Default)]
    struct SealableStore {
        inner: MemoryStore,
        sealed: std::sync::atomic::AtomicBool,
    }

    impl LedgerStore for SealableStore {
        fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>, LedgerError> {
            self.inner.get_commit(commit_id)
        }
        fn append_commit(&self, commit: &Commit, expected: Option<&str>) -> Result<(), LedgerError> {
            if self.sealed.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(LedgerError::Io(std::io::Error::other("sealed")));
            }
            self.inner.append_commit(commit, expected)
        }
        fn get_branch(&self, name: &str) -> Result<Option<Branch>, LedgerError> {
            self.inner.get_branch(name)
        }
        fn list_branches(&self) -> Result<Vec<Branch>, LedgerError> {
            self.inner.list_branches()
        }
        fn create_branch(&self, branch: Branch) -> Result<(), LedgerError> {
            self.inner.create_branch(branch)
        }
        fn append_rollback_point(&self, point: &RollbackPoint) -> Result<(), LedgerError> {
            self.inner.append_rollback_point(point)
        }
        fn rollback_points(&self) -> Result<Vec<RollbackPoint>, LedgerError> {
            self.inner.rollback_points()
        }
        fn append_validation_failure(&self, failure: &ValidationFailure) -> Result<(), LedgerError> {
            self.inner.append_validation_failure(failure)
        }
        fn validation_failures(&self) -> Result<Vec<ValidationFailure>, LedgerError> {
            self.inner.validation_failures()
        }
    }

    #[test]
    fn failed_rollback_commit_leaves_no_rollback_point() {
        let store = Arc::new(SealableStore::default());
        let ledger = PatternLedger::with_store(store.clone(), "main", 100).unwrap();
        let c1 = ledger.commit(snap(&["a"]), "c1", "test", None).unwrap();
        let c2 = ledger.commit(snap(&["a", "b"]), "c2", "test", None).unwrap();

        store.sealed.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            ledger.rollback_to_commit(&c1, "bad", None, true),
            Err(LedgerError::Io(_))
        ));
        assert!(ledger.rollback_points().unwrap().is_empty());

        store.sealed.store(false, std::sync::atomic::Ordering::SeqCst);
        let id = ledger.rollback_to_commit(&c1, "bad", None, true).unwrap();
        let points = ledger.rollback_points().unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].commit_id.as_deref(), Some(c2.as_str()));
        assert_eq!(ledger.head_id().unwrap(), Some(id));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn diff_recovers_the_committed_patch(
                base in prop::collection::btree_set("[a-e]{1,3}", 0..6),
                added in prop::collection::btree_set("[f-j]{1,3}", 0..6),
                remove_mask in prop::collection::vec(any::<bool>(), 6),
            ) {
                let ledger = PatternLedger::in_memory().unwrap();
                let base_snap: Snapshot =
                    [("s".to_string(), base.clone())].into_iter().collect();
                let a = ledger.commit(base_snap.clone(), "base", "test", None).unwrap();

                let removed: Vec<String> = base
                    .iter()
                    .zip(&remove_mask)
                    .filter(|(_, remove)| **remove)
                    .map(|(p, _)| p.clone())
                    .collect();
                let added: Vec<String> = added.into_iter().collect();
                let b = ledger
                    .commit(base_snap.with_change("s", &added, &removed), "patch", "test", None)
                    .unwrap();

                let diff = ledger.diff(&a, &b).unwrap();
                prop_assert_eq!(diff.added_patterns, added);
                prop_assert_eq!(diff.removed_patterns, removed);
            }
        }
    }
}
