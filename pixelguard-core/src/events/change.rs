//! Change events emitted by the source monitor.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a line of source content carries a rule. Blank lines and `!`/`#` comments do not.
pub fn is_significant_line(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty() && !line.starts_with('!') && !line.starts_with('#')
}

/// The normalized line set of a source document.
pub fn significant_lines(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter(|line| is_significant_line(line))
        .map(|line| line.trim().to_string())
        .collect()
}

/// One detected delta of a source's content. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_name: String,
    pub timestamp: DateTime<Utc>,
    /// Upstream revision tag, or a content hash when the source exposes none.
    pub revision_id: String,
    pub added_lines: Vec<String>,
    pub removed_lines: Vec<String>,
}

impl ChangeEvent {
    pub fn new(
        source_name: impl Into<String>,
        revision_id: impl Into<String>,
        added_lines: Vec<String>,
        removed_lines: Vec<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            timestamp: Utc::now(),
            revision_id: revision_id.into(),
            added_lines,
            removed_lines,
        }
    }

    /// Line-set difference between two versions of a source document.
    ///
    /// Order and duplicates are ignored. Returns `None` when nothing significant changed.
    pub fn between(
        source_name: impl Into<String>,
        revision_id: impl Into<String>,
        previous: &str,
        current: &str,
    ) -> Option<Self> {
        let old = significant_lines(previous);
        let new = significant_lines(current);
        let added: Vec<String> = new.difference(&old).cloned().collect();
        let removed: Vec<String> = old.difference(&new).cloned().collect();
        let event = Self::new(source_name, revision_id, added, removed);
        (!event.is_empty()).then_some(event)
    }

    pub fn is_empty(&self) -> bool {
        self.added_lines.is_empty() && self.removed_lines.is_empty()
    }

    /// Short revision for log lines.
    pub fn short_revision(&self) -> &str {
        let end = self
            .revision_id
            .char_indices()
            .nth(12)
            .map_or(self.revision_id.len(), |(i, _)| i);
        &self.revision_id[..end]
    }
}
