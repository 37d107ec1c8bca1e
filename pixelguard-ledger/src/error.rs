use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Commit not found: {0}")]
    CommitNotFound(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    /// The branch head moved between read and update.
    #[error("Head of branch {branch} moved (expected {expected:?}, found {found:?})")]
    HeadConflict {
        branch: String,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("Corrupt ledger store: {0}")]
    CorruptStore(String),

    #[error("Ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
