//! # PixelGuard Monitor
//!
//! Watches external pattern sources and turns content deltas into
//! [`ChangeEvent`](pixelguard_core::events::ChangeEvent)s on the pipeline's
//! inbound queue.
//!
//! ### Key Submodules:
//! - `monitor`: [`ChangeMonitor`], scheduling, diffing and acknowledgement
//! - `fetch`: the [`SourceFetcher`] seam and the local [`FileFetcher`]
//! - `source`: persisted per-source state and cached baselines

pub mod fetch;
pub mod monitor;
pub mod source;

use thiserror::Error;

pub use fetch::{FileFetcher, Fetched, SourceFetcher};
pub use monitor::{content_revision, ChangeMonitor, PendingChange, PollOutcome, PollReport, SourceStatus};
pub use source::{SourceCache, SourceState};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Fetch I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Source rejected: {0}")]
    Rejected(String),

    #[error("Source cache error: {0}")]
    Cache(String),
}
