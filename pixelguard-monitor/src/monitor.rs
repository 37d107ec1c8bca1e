//! ## pixelguard-monitor::monitor
//! **Polls sources and emits change events**
//!
//! ### Expectations:
//! - A source whose content is unchanged (same tag or same content hash) emits nothing
//! - The cached baseline advances only after the event was accepted by the queue
//! - A failing source never delays or blocks another one
//! - At most `max_in_flight_fetches` fetches run at once, and never two for one source

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pixelguard_config::{MonitorConfig, SourceConfig};
use pixelguard_core::events::{ChangeEvent, QueueSender};
use pixelguard_core::model::Priority;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::fetch::{Fetched, SourceFetcher};
use crate::source::{SourceCache, SourceState};
use crate::FetchError;

const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// A detected change not yet acknowledged. Dropping it leaves the baseline untouched.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub event: ChangeEvent,
    content: String,
    cache_tag: Option<String>,
}

/// Result of polling one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Changed,
    /// The change could not be enqueued; it is detected again on the next poll.
    Deferred,
    Failed(String),
}

/// Tally of one polling round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub polled: usize,
    pub changes: usize,
    pub unchanged: usize,
    pub deferred: usize,
    /// Sources already being polled by another round.
    pub skipped: usize,
    /// `(source, error)` pairs.
    pub errors: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub priority: Priority,
    pub last_poll: Option<DateTime<Utc>>,
    pub next_poll: Option<DateTime<Utc>>,
    pub last_revision: Option<String>,
    pub last_error: Option<String>,
}

pub struct ChangeMonitor {
    sources: Vec<SourceConfig>,
    fetcher: Arc<dyn SourceFetcher>,
    cache: SourceCache,
    states: Mutex<BTreeMap<String, SourceState>>,
    // Held from state update to save, so the file never goes back to an older map.
    state_saves: tokio::sync::Mutex<()>,
    in_flight: Mutex<HashSet<String>>,
    fetch_limit: Arc<Semaphore>,
    events: QueueSender<ChangeEvent>,
    enqueue_timeout: Duration,
}

impl ChangeMonitor {
    /// Creates a monitor, restoring saved source state from the cache directory.
    pub async fn new(
        config: &MonitorConfig,
        fetcher: Arc<dyn SourceFetcher>,
        events: QueueSender<ChangeEvent>,
    ) -> Self {
        let cache = SourceCache::new(&config.cache_dir);
        let mut states = cache.load_states().await;
        states.retain(|name, _| config.sources.iter().any(|s| &s.name == name));
        info!(
            sources = config.sources.len(),
            restored = states.len(),
            "Change monitor ready"
        );

        Self {
            sources: config.sources.clone(),
            fetcher,
            cache,
            states: Mutex::new(states),
            state_saves: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
            fetch_limit: Arc::new(Semaphore::new(config.max_in_flight_fetches.max(1))),
            events,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
        }
    }

    /// How long an event may wait for queue capacity before the change is deferred.
    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub fn state(&self, name: &str) -> Option<SourceState> {
        self.states.lock().get(name).cloned()
    }

    fn is_due(&self, source: &SourceConfig, now: DateTime<Utc>) -> bool {
        match self.state(&source.name).and_then(|s| s.last_poll_time) {
            None => true,
            Some(last) => (now - last)
                .to_std()
                .map_or(false, |elapsed| elapsed >= source.poll_interval()),
        }
    }

    async fn update_state(&self, name: &str, update: impl FnOnce(&mut SourceState)) {
        let _serialized = self.state_saves.lock().await;
        let snapshot = {
            let mut states = self.states.lock();
            update(states.entry(name.to_string()).or_default());
            states.clone()
        };
        if let Err(e) = self.cache.save_states(&snapshot).await {
            warn!(source = name, error = %e, "Failed to persist source state");
        }
    }

    /// Fetches `source` and diffs it against the cached baseline.
    ///
    /// Returns `None` when nothing significant changed. Only bookkeeping is
    /// updated here; the baseline moves in [`ChangeMonitor::acknowledge`].
    #[instrument(skip_all, fields(source = %source.name))]
    pub async fn check(&self, source: &SourceConfig) -> Result<Option<PendingChange>, FetchError> {
        let previous = self.state(&source.name).unwrap_or_default();
        let fetched = self
            .fetcher
            .fetch(source, previous.cache_tag.as_deref())
            .await;
        let now = Utc::now();

        let (body, cache_tag) = match fetched {
            Err(e) => {
                let message = e.to_string();
                self.update_state(&source.name, |s| {
                    s.last_poll_time = Some(now);
                    s.last_error = Some(message);
                })
                .await;
                return Err(e);
            }
            Ok(Fetched::NotModified) => {
                self.update_state(&source.name, |s| {
                    s.last_poll_time = Some(now);
                    s.last_error = None;
                })
                .await;
                debug!("Source not modified");
                return Ok(None);
            }
            Ok(Fetched::Content { body, cache_tag }) => (body, cache_tag),
        };

        let revision = content_revision(&body);
        self.update_state(&source.name, |s| {
            s.last_poll_time = Some(now);
            s.last_error = None;
        })
        .await;

        if previous.last_seen_revision.as_deref() == Some(revision.as_str()) {
            self.update_state(&source.name, |s| s.cache_tag = cache_tag).await;
            debug!("Source content unchanged");
            return Ok(None);
        }

        let baseline = self.cache.content(&source.name).await?;
        match ChangeEvent::between(source.name.as_str(), revision.as_str(), &baseline, &body) {
            Some(event) => Ok(Some(PendingChange {
                event,
                content: body,
                cache_tag,
            })),
            None => {
                // Only comments, blank lines or ordering moved: adopt silently.
                self.adopt(&source.name, &body, revision, cache_tag).await?;
                debug!("Source changed without significant lines");
                Ok(None)
            }
        }
    }

    /// Makes the content of an accepted change the new baseline.
    pub async fn acknowledge(&self, pending: PendingChange) -> Result<(), FetchError> {
        let PendingChange {
            event,
            content,
            cache_tag,
        } = pending;
        self.adopt(&event.source_name, &content, event.revision_id, cache_tag)
            .await
    }

    async fn adopt(
        &self,
        name: &str,
        content: &str,
        revision: String,
        cache_tag: Option<String>,
    ) -> Result<(), FetchError> {
        self.cache.store_content(name, content).await?;
        self.update_state(name, |s| {
            s.last_seen_revision = Some(revision);
            s.cache_tag = cache_tag;
        })
        .await;
        Ok(())
    }

    /// Check, enqueue, acknowledge.
    pub async fn poll_source(&self, source: &SourceConfig) -> PollOutcome {
        let pending = match self.check(source).await {
            Ok(Some(pending)) => pending,
            Ok(None) => return PollOutcome::Unchanged,
            Err(e) => {
                warn!(source = %source.name, error = %e, "Source fetch failed");
                return PollOutcome::Failed(e.to_string());
            }
        };

        let event = pending.event.clone();
        if let Err(e) = self
            .events
            .send_timeout(event, self.enqueue_timeout)
            .await
        {
            warn!(
                source = %source.name,
                revision = pending.event.short_revision(),
                error = %e,
                "Change event not accepted, baseline kept"
            );
            return PollOutcome::Deferred;
        }

        info!(
            source = %source.name,
            revision = pending.event.short_revision(),
            added = pending.event.added_lines.len(),
            removed = pending.event.removed_lines.len(),
            "Change detected"
        );
        if let Err(e) = self.acknowledge(pending).await {
            warn!(source = %source.name, error = %e, "Failed to store new baseline");
        }
        PollOutcome::Changed
    }

    /// Polls every due source (every source when `force`) concurrently.
    pub async fn poll(self: &Arc<Self>, force: bool) -> PollReport {
        let now = Utc::now();
        let mut report = PollReport::default();
        let mut tasks = JoinSet::new();

        for source in self.sources.iter().filter(|s| force || self.is_due(s, now)) {
            if !self.in_flight.lock().insert(source.name.clone()) {
                report.skipped += 1;
                continue;
            }
            let monitor = Arc::clone(self);
            let permits = Arc::clone(&self.fetch_limit);
            let source = source.clone();
            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => monitor.poll_source(&source).await,
                    Err(_) => PollOutcome::Failed("fetch limiter closed".to_string()),
                };
                monitor.in_flight.lock().remove(&source.name);
                (source.name, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            report.polled += 1;
            match joined {
                Ok((_, PollOutcome::Unchanged)) => report.unchanged += 1,
                Ok((_, PollOutcome::Changed)) => report.changes += 1,
                Ok((_, PollOutcome::Deferred)) => report.deferred += 1,
                Ok((name, PollOutcome::Failed(error))) => report.errors.push((name, error)),
                Err(e) => report.errors.push(("<task>".to_string(), e.to_string())),
            }
        }
        report
    }

    pub fn status(&self) -> Vec<SourceStatus> {
        let states = self.states.lock();
        self.sources
            .iter()
            .map(|source| {
                let state = states.get(&source.name).cloned().unwrap_or_default();
                let next_poll = state.last_poll_time.and_then(|last| {
                    chrono::Duration::from_std(source.poll_interval())
                        .ok()
                        .map(|interval| last + interval)
                });
                SourceStatus {
                    name: source.name.clone(),
                    priority: source.priority,
                    last_poll: state.last_poll_time,
                    next_poll,
                    last_revision: state.last_seen_revision,
                    last_error: state.last_error,
                }
            })
            .collect()
    }
}

/// Revision id of fetched content: the first 16 hex digits of its blake3 hash.
pub fn content_revision(content: &str) -> String {
    let hash = blake3::hash(content.as_bytes()).to_hex();
    hash[..16].to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use async_trait::async_trait;
    use pixelguard_core::events::{bounded, QueueReceiver};

    use super::*;

    /// Serves whatever content the test last set, or an error.
    #[derive(Default)]
    struct StaticFetcher {
        content: Mutex<HashMap<String, Result<String, String>>>,
    }

    impl StaticFetcher {
        fn set(&self, name: &str, content: &str) {
            self.content
                .lock()
                .insert(name.to_string(), Ok(content.to_string()));
        }

        fn fail(&self, name: &str) {
            self.content
                .lock()
                .insert(name.to_string(), Err("connection reset".to_string()));
        }
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch(
            &self,
            source: &SourceConfig,
            _cache_tag: Option<&str>,
        ) -> Result<Fetched, FetchError> {
            match self.content.lock().get(&source.name).cloned() {
                Some(Ok(body)) => Ok(Fetched::Content {
                    body,
                    cache_tag: None,
                }),
                Some(Err(e)) => Err(FetchError::Rejected(e)),
                None => Err(FetchError::NotFound(source.locator.clone())),
            }
        }
    }

    async fn monitor(
        cache_dir: &Path,
        names: &[&str],
        capacity: usize,
    ) -> (Arc<ChangeMonitor>, Arc<StaticFetcher>, QueueReceiver<ChangeEvent>) {
        let config = MonitorConfig {
            cache_dir: cache_dir.to_path_buf(),
            sources: names
                .iter()
                .map(|n| SourceConfig::new(*n, format!("mem://{n}")))
                .collect(),
            ..Default::default()
        };
        let fetcher = Arc::new(StaticFetcher::default());
        let (tx, rx) = bounded(capacity).unwrap();
        let monitor = ChangeMonitor::new(&config, fetcher.clone(), tx)
            .await
            .with_enqueue_timeout(Duration::from_millis(20));
        (Arc::new(monitor), fetcher, rx)
    }

    fn drain(rx: &mut QueueReceiver<ChangeEvent>) -> Vec<ChangeEvent> {
        std::iter::from_fn(|| rx.try_recv()).collect()
    }

    #[tokio::test]
    async fn appended_line_emits_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, fetcher, mut rx) = monitor(dir.path(), &["X"], 8).await;

        fetcher.set("X", "a\nb");
        assert_eq!(monitor.poll(true).await.changes, 1);
        drain(&mut rx);

        fetcher.set("X", "a\nb\nc");
        let report = monitor.poll(true).await;
        assert_eq!(report.changes, 1);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source_name, "X");
        assert_eq!(events[0].added_lines, vec!["c"]);
        assert!(events[0].removed_lines.is_empty());
    }

    #[tokio::test]
    async fn unchanged_content_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, fetcher, mut rx) = monitor(dir.path(), &["X"], 8).await;
        fetcher.set("X", "a\nb");
        monitor.poll(true).await;
        drain(&mut rx);

        let report = monitor.poll(true).await;
        assert_eq!(report.unchanged, 1);
        assert!(drain(&mut rx).is_empty());

        fetcher.set("X", "# header\nb\n\na");
        assert_eq!(monitor.poll(true).await.unchanged, 1);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn failing_source_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, fetcher, mut rx) = monitor(dir.path(), &["bad", "good"], 8).await;
        fetcher.fail("bad");
        fetcher.set("good", "||tracker.com^");

        let report = monitor.poll(true).await;
        assert_eq!(report.polled, 2);
        assert_eq!(report.changes, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, "bad");
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(monitor.state("bad").unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn rejected_event_keeps_the_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, fetcher, mut rx) = monitor(dir.path(), &["X"], 2).await;

        fetcher.set("X", "a");
        monitor.poll(true).await;
        fetcher.set("X", "a\nb");
        monitor.poll(true).await;
        fetcher.set("X", "a\nb\nc");
        let report = monitor.poll(true).await;
        assert_eq!(report.deferred, 1);

        // Room again: the deferred change is detected against the old baseline.
        assert_eq!(drain(&mut rx).len(), 2);
        monitor.poll(true).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].added_lines, vec!["c"]);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (monitor, fetcher, _rx) = monitor(dir.path(), &["X"], 8).await;
            fetcher.set("X", "a\nb");
            monitor.poll(true).await;
        }
        let (monitor, fetcher, mut rx) = monitor(dir.path(), &["X"], 8).await;
        assert!(monitor.state("X").unwrap().last_seen_revision.is_some());
        assert_eq!(monitor.poll(false).await.polled, 0);

        fetcher.set("X", "a\nb");
        assert_eq!(monitor.poll(true).await.unchanged, 1);
        assert!(drain(&mut rx).is_empty());
        let status = monitor.status();
        assert_eq!(status.len(), 1);
        assert!(status[0].next_poll > status[0].last_poll);
    }

    #[test]
    fn revision_is_stable() {
        assert_eq!(content_revision("a\nb"), content_revision("a\nb"));
        assert_ne!(content_revision("a\nb"), content_revision("a\nb\n"));
        assert_eq!(content_revision("x").len(), 16);
    }
}
