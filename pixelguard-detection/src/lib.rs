//! # PixelGuard Detection
//!
//! The match-time side of the pipeline: rule conversion, the O(1) domain
//! index and the per-email scan built on top of it.

pub mod domain;
pub mod index;
pub mod rules;
pub mod scan;

use thiserror::Error;

pub use index::{DomainIndexEntry, IndexSnapshot, IndexStats, PatternIndex};
pub use rules::{parse_rules, Matcher, Rule};
pub use scan::{scan_body, Classification, ContentClassifier, NullClassifier, ScanReport};

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Pattern compilation failed: {0}")]
    PatternError(String),
}
