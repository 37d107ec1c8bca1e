//! # PixelGuard Ledger
//!
//! Commit-style version control for pattern sets: an append-only log of full
//! snapshots with parent links, named branches, rollback points and the
//! validation-failure log.
//!
//! ### Key Submodules:
//! - `ledger`: [`PatternLedger`], the operations used by the orchestrator and the CLI
//! - `store`: the [`LedgerStore`] trait with in-memory and file-backed implementations
//! - `model`: commit, branch, diff and audit records (all JSON-serializable)
//!
//! The ledger is the single source of truth. The in-memory pattern index is a
//! cache rebuilt from the head snapshot.

mod error;
pub mod ledger;
pub mod model;
pub mod store;

pub use error::LedgerError;
pub use ledger::PatternLedger;
pub use model::{
    AuditSummary, AuditTrail, Branch, ChangeKind, ChangeSummary, Commit, PatternAction,
    PatternDiff, PatternHistoryEntry, RollbackPoint, ValidationFailure,
};
pub use store::{FileStore, LedgerStore, MemoryStore};
