//! ## pixelguard-ledger::store
//! **Persistence behind the pattern ledger**
//!
//! Layout of a [`FileStore`] root:
//! - `commits/<commit_id>.json`: one immutable file per commit
//! - `branches.json`: the branch-pointer table, the only mutable file
//! - `rollbacks.jsonl`: append-only rollback points
//! - `validation_failures.jsonl`: append-only rejected changes
//! - `ledger.lock`: advisory lock held by writers
//!
//! ### Expectations:
//! - `append_commit` is a compare-and-swap on the branch head: the commit is
//!   written and the head moved only if the head still equals `expected`
//! - Commit files are never rewritten once they exist
//! - Every handle on a root sees the same branch heads

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::model::{Branch, Commit, RollbackPoint, ValidationFailure};
use crate::LedgerError;

const COMMITS_DIR: &str = "commits";
const BRANCHES_FILE: &str = "branches.json";
const ROLLBACKS_FILE: &str = "rollbacks.jsonl";
const FAILURES_FILE: &str = "validation_failures.jsonl";
const LOCK_FILE: &str = "ledger.lock";

pub trait LedgerStore: Send + Sync {
    fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>, LedgerError>;

    /// Stores `commit` and advances `commit.branch` to it, provided the branch
    /// head still equals `expected`. Fails with [`LedgerError::HeadConflict`] otherwise.
    fn append_commit(&self, commit: &Commit, expected: Option<&str>) -> Result<(), LedgerError>;

    fn get_branch(&self, name: &str) -> Result<Option<Branch>, LedgerError>;

    fn list_branches(&self) -> Result<Vec<Branch>, LedgerError>;

    /// Fails with [`LedgerError::BranchExists`] if the name is taken.
    fn create_branch(&self, branch: Branch) -> Result<(), LedgerError>;

    fn append_rollback_point(&self, point: &RollbackPoint) -> Result<(), LedgerError>;

    fn rollback_points(&self) -> Result<Vec<RollbackPoint>, LedgerError>;

    fn append_validation_failure(&self, failure: &ValidationFailure) -> Result<(), LedgerError>;

    fn validation_failures(&self) -> Result<Vec<ValidationFailure>, LedgerError>;
}

fn advance_head(
    branches: &mut BTreeMap<String, Branch>,
    commit: &Commit,
    expected: Option<&str>,
) -> Result<(), LedgerError> {
    let branch = branches
        .get_mut(&commit.branch)
        .ok_or_else(|| LedgerError::BranchNotFound(commit.branch.clone()))?;
    if branch.head_commit.as_deref() != expected {
        return Err(LedgerError::HeadConflict {
            branch: commit.branch.clone(),
            expected: expected.map(str::to_string),
            found: branch.head_commit.clone(),
        });
    }
    branch.head_commit = Some(commit.commit_id.clone());
    branch.last_updated = commit.timestamp;
    Ok(())
}

fn check_parent(commit: &Commit, expected: Option<&str>) -> Result<(), LedgerError> {
    if commit.parent_id.as_deref() != expected {
        return Err(LedgerError::CorruptStore(format!(
            "commit {} does not descend from the expected head",
            commit.short_id()
        )));
    }
    Ok(())
}

/// Process-local store, used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    commits: RwLock<HashMap<String, Commit>>,
    branches: Mutex<BTreeMap<String, Branch>>,
    rollbacks: Mutex<Vec<RollbackPoint>>,
    failures: Mutex<Vec<ValidationFailure>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>, LedgerError> {
        Ok(self.commits.read().get(commit_id).cloned())
    }

    fn append_commit(&self, commit: &Commit, expected: Option<&str>) -> Result<(), LedgerError> {
        check_parent(commit, expected)?;
        let mut branches = self.branches.lock();
        advance_head(&mut branches, commit, expected)?;
        self.commits
            .write()
            .insert(commit.commit_id.clone(), commit.clone());
        Ok(())
    }

    fn get_branch(&self, name: &str) -> Result<Option<Branch>, LedgerError> {
        Ok(self.branches.lock().get(name).cloned())
    }

    fn list_branches(&self) -> Result<Vec<Branch>, LedgerError> {
        Ok(self.branches.lock().values().cloned().collect())
    }

    fn create_branch(&self, branch: Branch) -> Result<(), LedgerError> {
        let mut branches = self.branches.lock();
        if branches.contains_key(&branch.name) {
            return Err(LedgerError::BranchExists(branch.name));
        }
        branches.insert(branch.name.clone(), branch);
        Ok(())
    }

    fn append_rollback_point(&self, point: &RollbackPoint) -> Result<(), LedgerError> {
        self.rollbacks.lock().push(point.clone());
        Ok(())
    }

    fn rollback_points(&self) -> Result<Vec<RollbackPoint>, LedgerError> {
        Ok(self.rollbacks.lock().clone())
    }

    fn append_validation_failure(&self, failure: &ValidationFailure) -> Result<(), LedgerError> {
        self.failures.lock().push(failure.clone());
        Ok(())
    }

    fn validation_failures(&self) -> Result<Vec<ValidationFailure>, LedgerError> {
        Ok(self.failures.lock().clone())
    }
}

/// JSON files under a root directory.
///
/// Branch heads are read from disk on every call, so several handles (and
/// processes) on one root agree on the head. Writers take an exclusive lock
/// on `ledger.lock` for the whole read-check-write of the branch table.
pub struct FileStore {
    root: PathBuf,
    lock: Mutex<fd_lock::RwLock<File>>,
}

impl FileStore {
    /// Opens (creating if needed) the store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let root = root.into();
        fs::create_dir_all(root.join(COMMITS_DIR))?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        let store = Self {
            root,
            lock: Mutex::new(fd_lock::RwLock::new(lock_file)),
        };
        // Surface a corrupt branch table at open time rather than on first use.
        store.read_branches()?;
        debug!(root = %store.root.display(), "Ledger store opened");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn commit_path(&self, commit_id: &str) -> PathBuf {
        self.root.join(COMMITS_DIR).join(format!("{commit_id}.json"))
    }

    fn read_branches(&self) -> Result<BTreeMap<String, Branch>, LedgerError> {
        let path = self.root.join(BRANCHES_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| LedgerError::CorruptStore(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `update` on a fresh copy of the branch table while holding the
    /// store lock, persisting the table only if `update` succeeds.
    fn update_branches<F>(&self, update: F) -> Result<(), LedgerError>
    where
        F: FnOnce(&mut BTreeMap<String, Branch>) -> Result<(), LedgerError>,
    {
        let mut lock = self.lock.lock();
        let _exclusive = lock.write()?;
        let mut branches = self.read_branches()?;
        update(&mut branches)?;
        write_atomic(&self.root.join(BRANCHES_FILE), &branches)
    }

    fn append_line<T: Serialize>(&self, file: &str, record: &T) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut lock = self.lock.lock();
        let _exclusive = lock.write()?;
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file))?;
        out.write_all(line.as_bytes())?;
        Ok(())
    }

    fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, LedgerError> {
        let path = self.root.join(file);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| {
                    LedgerError::CorruptStore(format!("{}:{}: {e}", path.display(), n + 1))
                })
            })
            .collect()
    }
}

// Unique temp file in the target directory, renamed over `path`.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn is_commit_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_hexdigit())
}

impl LedgerStore for FileStore {
    fn get_commit(&self, commit_id: &str) -> Result<Option<Commit>, LedgerError> {
        if !is_commit_id(commit_id) {
            return Ok(None);
        }
        let bytes = match fs::read(self.commit_path(commit_id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let commit: Commit = serde_json::from_slice(&bytes)
            .map_err(|e| LedgerError::CorruptStore(format!("commit {commit_id}: {e}")))?;
        if commit.commit_id != commit_id {
            return Err(LedgerError::CorruptStore(format!(
                "commit {commit_id} holds {}",
                commit.commit_id
            )));
        }
        Ok(Some(commit))
    }

    fn append_commit(&self, commit: &Commit, expected: Option<&str>) -> Result<(), LedgerError> {
        check_parent(commit, expected)?;
        self.update_branches(|branches| {
            advance_head(branches, commit, expected)?;
            let path = self.commit_path(&commit.commit_id);
            if !path.exists() {
                write_atomic(&path, commit)?;
            }
            Ok(())
        })
    }

    fn get_branch(&self, name: &str) -> Result<Option<Branch>, LedgerError> {
        Ok(self.read_branches()?.remove(name))
    }

    fn list_branches(&self) -> Result<Vec<Branch>, LedgerError> {
        Ok(self.read_branches()?.into_values().collect())
    }

    fn create_branch(&self, branch: Branch) -> Result<(), LedgerError> {
        self.update_branches(|branches| {
            if branches.contains_key(&branch.name) {
                return Err(LedgerError::BranchExists(branch.name));
            }
            branches.insert(branch.name.clone(), branch);
            Ok(())
        })
    }

    fn append_rollback_point(&self, point: &RollbackPoint) -> Result<(), LedgerError> {
        self.append_line(ROLLBACKS_FILE, point)
    }

    fn rollback_points(&self) -> Result<Vec<RollbackPoint>, LedgerError> {
        self.read_lines(ROLLBACKS_FILE)
    }

    fn append_validation_failure(&self, failure: &ValidationFailure) -> Result<(), LedgerError> {
        self.append_line(FAILURES_FILE, failure)
    }

    fn validation_failures(&self) -> Result<Vec<ValidationFailure>, LedgerError> {
        self.read_lines(FAILURES_FILE)
    }
}
