//! Per-source monitor state and its on-disk cache.
//!
//! `<cache_dir>/sources.json` holds the [`SourceState`] of every source;
//! `<cache_dir>/<name>.txt` holds the last accepted content, the baseline the
//! next fetch is diffed against.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::FetchError;

const STATE_FILE: &str = "sources.json";

/// Mutable bookkeeping of one source. Only the monitor writes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceState {
    pub cache_tag: Option<String>,
    pub last_seen_revision: Option<String>,
    pub last_poll_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Files under the monitor's cache directory.
#[derive(Debug, Clone)]
pub struct SourceCache {
    dir: PathBuf,
}

impl SourceCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn content_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.txt"))
    }

    /// Saved states. A missing or unreadable file yields an empty map.
    pub async fn load_states(&self) -> BTreeMap<String, SourceState> {
        let path = self.dir.join(STATE_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "Discarding unreadable source state");
                BTreeMap::new()
            }),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Source state unavailable");
                }
                BTreeMap::new()
            }
        }
    }

    pub async fn save_states(&self, states: &BTreeMap<String, SourceState>) -> Result<(), FetchError> {
        let bytes = serde_json::to_vec_pretty(states)
            .map_err(|e| FetchError::Cache(format!("source state: {e}")))?;
        self.write(STATE_FILE, bytes).await
    }

    /// Last accepted content of `name`, empty when never fetched.
    pub async fn content(&self, name: &str) -> Result<String, FetchError> {
        match tokio::fs::read_to_string(self.content_path(name)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn store_content(&self, name: &str, content: &str) -> Result<(), FetchError> {
        self.write(&format!("{name}.txt"), content.as_bytes().to_vec())
            .await
    }

    /// Replaces `file` through a uniquely named temporary file in the same directory.
    async fn write(&self, file: &str, bytes: Vec<u8>) -> Result<(), FetchError> {
        let dir = self.dir.clone();
        let path = self.dir.join(file);
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            fs::create_dir_all(&dir)?;
            let mut tmp = NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| FetchError::Cache(format!("cache write: {e}")))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn states_and_content_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceCache::new(dir.path().join("cache"));
        assert!(cache.load_states().await.is_empty());
        assert_eq!(cache.content("x").await.unwrap(), "");

        let mut states = BTreeMap::new();
        states.insert(
            "x".to_string(),
            SourceState {
                cache_tag: Some("tag".into()),
                last_seen_revision: Some("rev".into()),
                last_poll_time: Some(Utc::now()),
                last_error: None,
            },
        );
        cache.save_states(&states).await.unwrap();
        cache.store_content("x", "a\nb").await.unwrap();

        assert_eq!(cache.load_states().await, states);
        assert_eq!(cache.content("x").await.unwrap(), "a\nb");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceCache::new(dir.path().join("cache"));

        let mut saves = tokio::task::JoinSet::new();
        for i in 0..64 {
            let cache = cache.clone();
            saves.spawn(async move {
                let mut states = BTreeMap::new();
                states.insert(format!("s{i}"), SourceState::default());
                cache.save_states(&states).await
            });
        }
        while let Some(saved) = saves.join_next().await {
            saved.unwrap().unwrap();
        }

        let states = cache.load_states().await;
        assert_eq!(states.len(), 1);
        let leftovers: Vec<_> = fs::read_dir(cache.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .filter(|name| name != STATE_FILE)
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn source_named_like_the_state_file_keeps_both() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SourceCache::new(dir.path().join("cache"));
        let mut states = BTreeMap::new();
        states.insert("sources".to_string(), SourceState::default());

        let (saved, stored) = tokio::join!(
            cache.save_states(&states),
            cache.store_content("sources", "||a.com^")
        );
        saved.unwrap();
        stored.unwrap();
        assert_eq!(cache.load_states().await, states);
        assert_eq!(cache.content("sources").await.unwrap(), "||a.com^");
    }
}
