//! ## pixelguard-engine::orchestrator
//! **Closed control loop over the pattern pipeline**
//!
//! change worker → validation worker → commit worker, plus a health worker and
//! the monitor's polling loop, all sharing one [`Orchestrator`] context.
//!
//! ### Expectations:
//! - Every queue read waits at most `queue_poll_timeout_ms`, so workers see shutdown promptly
//! - While the emergency stop is engaged every change is dropped with a log entry and a metric
//! - A successful commit resets the rollback counter; a rollback past the ceiling stops the loop
//! - The index is always rebuilt from the ledger head after a rollback
//! - Head read, commit and index swap run under one lock; the index only ever
//!   holds a snapshot the ledger has committed

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::{Mutex, RwLock};
use pixelguard_config::PixelGuardConfig;
use pixelguard_core::events::{bounded, ChangeEvent, QueueReceiver, QueueSender, Recv};
use pixelguard_core::model::{HealthStatus, SystemHealth};
use pixelguard_detection::{IndexStats, PatternIndex};
use pixelguard_ledger::{Commit, LedgerError, PatternLedger, ValidationFailure};
use pixelguard_monitor::{ChangeMonitor, PollReport, SourceFetcher};
use pixelguard_telemetry::{logging::EventLogger, MetricsRecorder};
use pixelguard_validator::{batch_accepted, BatchSummary, PatternValidator};
use tokio::sync::{watch, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::health::{HealthHistory, HealthProbe, IndexHealthProbe};
use crate::status::{OrchestratorState, OrchestratorStatus, QueueDepths};
use crate::EngineError;

/// Head moves by another ledger handle tolerated before an apply gives up.
const MAX_APPLY_ATTEMPTS: usize = 8;

/// A change cleared for the commit worker.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub event: ChangeEvent,
    /// `None` when validation is disabled.
    pub validation: Option<BatchSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeRoute {
    Validation,
    Commit,
    Dropped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationVerdict {
    Accepted(BatchSummary),
    Rejected(ValidationFailure),
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Committed(String),
    /// The update failed and the ledger was rolled back; holds the rollback commit id.
    RolledBack(String),
    Dropped,
}

enum RollbackTarget<'a> {
    Commit(&'a str),
    LatestStable,
}

struct Receivers {
    changes: QueueReceiver<ChangeEvent>,
    validation: QueueReceiver<ChangeEvent>,
    commits: QueueReceiver<CommitRequest>,
}

/// Context object owning every piece of mutable control-loop state.
pub struct Orchestrator {
    config: Arc<PixelGuardConfig>,
    ledger: Arc<PatternLedger>,
    index: Arc<PatternIndex>,
    validator: PatternValidator,
    monitor: Arc<ChangeMonitor>,
    metrics: Arc<MetricsRecorder>,
    probe: Arc<dyn HealthProbe>,

    running: Arc<AtomicBool>,
    emergency_stop: AtomicBool,
    rollback_count: AtomicU32,
    state: RwLock<OrchestratorState>,
    health: Mutex<HealthHistory>,
    last_update: RwLock<Option<DateTime<Utc>>>,
    // Held by every head-moving operation until the index matches the new head.
    ledger_lock: tokio::sync::Mutex<()>,

    changes: QueueSender<ChangeEvent>,
    to_validation: QueueSender<ChangeEvent>,
    to_commit: QueueSender<CommitRequest>,
    receivers: Mutex<Option<Receivers>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Orchestrator {
    /// Wires the pipeline. Nothing runs until [`Orchestrator::start`].
    pub async fn new(
        config: PixelGuardConfig,
        ledger: PatternLedger,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Result<Self, EngineError> {
        info!("Initializing orchestrator");
        let capacity = config.orchestrator.queue_capacity;
        let (changes, changes_rx) = bounded(capacity)?;
        let (to_validation, validation_rx) = bounded(capacity)?;
        let (to_commit, commits_rx) = bounded(capacity)?;

        let priorities = config
            .monitor
            .sources
            .iter()
            .map(|s| (s.name.clone(), s.priority))
            .collect();
        let index = Arc::new(PatternIndex::new(priorities));
        let validator = PatternValidator::from_config(&config.validation)?;
        let probe = Arc::new(IndexHealthProbe::new(
            Arc::clone(&index),
            Arc::new(validator.corpus().clone()),
        ));
        let monitor =
            Arc::new(ChangeMonitor::new(&config.monitor, fetcher, changes.clone()).await);

        let initial_state = if config.orchestrator.emergency_stop {
            warn!("Emergency stop engaged by configuration");
            OrchestratorState::EmergencyStopped
        } else {
            OrchestratorState::Idle
        };
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            emergency_stop: AtomicBool::new(config.orchestrator.emergency_stop),
            health: Mutex::new(HealthHistory::new(config.health.history_len)),
            config: Arc::new(config),
            ledger: Arc::new(ledger),
            index,
            validator,
            monitor,
            metrics: Arc::new(MetricsRecorder::new()),
            probe,
            running: Arc::new(AtomicBool::new(false)),
            rollback_count: AtomicU32::new(0),
            state: RwLock::new(initial_state),
            last_update: RwLock::new(None),
            ledger_lock: tokio::sync::Mutex::new(()),
            changes,
            to_validation,
            to_commit,
            receivers: Mutex::new(Some(Receivers {
                changes: changes_rx,
                validation: validation_rx,
                commits: commits_rx,
            })),
            shutdown,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Replaces the default index/corpus health probe.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn ledger(&self) -> &Arc<PatternLedger> {
        &self.ledger
    }

    pub fn index(&self) -> &Arc<PatternIndex> {
        &self.index
    }

    pub fn monitor(&self) -> &Arc<ChangeMonitor> {
        &self.monitor
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    pub fn rollback_count(&self) -> u32 {
        self.rollback_count.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Health samples, oldest first.
    pub fn health_history(&self) -> Vec<SystemHealth> {
        self.health.lock().to_vec()
    }

    /// Enqueues a change as if the monitor had produced it.
    pub fn submit_change(&self, event: ChangeEvent) -> Result<(), EngineError> {
        self.changes.try_send(event)?;
        Ok(())
    }

    // EmergencyStopped is sticky until cleared explicitly.
    fn transition(&self, to: OrchestratorState) {
        let mut state = self.state.write();
        if *state == OrchestratorState::EmergencyStopped || *state == to {
            return;
        }
        debug!(from = ?*state, to = ?to, "State transition");
        *state = to;
    }

    /// Rebuilds the index from the head snapshot of the current branch.
    pub fn reload_index(&self) -> Result<IndexStats, EngineError> {
        let head = self.ledger.head()?;
        let stats = self.index.rebuild(&head.pattern_snapshot)?;
        self.metrics.set_index_patterns(stats.rules);
        debug!(commit = head.short_id(), rules = stats.rules, "Index reloaded from head");
        Ok(stats)
    }

    /// Reloads the index from the ledger and spawns every worker.
    pub fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or(EngineError::AlreadyStarted)?;
        let stats = self.reload_index()?;
        self.running.store(true, Ordering::SeqCst);
        self.transition(OrchestratorState::Watching);

        let mut workers = self.workers.lock();
        workers.push((
            "change",
            tokio::spawn(Arc::clone(self).change_worker(receivers.changes)),
        ));
        workers.push((
            "validation",
            tokio::spawn(Arc::clone(self).validation_worker(receivers.validation)),
        ));
        workers.push((
            "commit",
            tokio::spawn(Arc::clone(self).commit_worker(receivers.commits)),
        ));
        workers.push((
            "health",
            tokio::spawn(Arc::clone(self).health_worker(self.shutdown.subscribe())),
        ));
        workers.push((
            "monitor",
            tokio::spawn(Arc::clone(self).monitor_worker(self.shutdown.subscribe())),
        ));

        info!(
            domains = stats.domains,
            rules = stats.rules,
            sources = self.monitor.sources().len(),
            validation = self.config.orchestrator.validation_enabled,
            auto_rollback = self.config.orchestrator.auto_rollback,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stops scheduling new work and joins every worker, each within `shutdown_timeout`.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down orchestrator");
        // No subscriber left only means every timed worker already exited.
        let _ = self.shutdown.send(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        let timeout = self.config.orchestrator.shutdown_timeout();
        for (name, handle) in workers {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!(worker = name, "Worker joined"),
                Ok(Err(e)) => error!(worker = name, error = %e, "Worker failed"),
                Err(_) => {
                    warn!(worker = name, "Worker did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        self.transition(OrchestratorState::Idle);
        info!("Orchestrator shutdown complete");
    }

    async fn drop_change(&self, event: &ChangeEvent, reason: &'static str) {
        warn!(
            source = %event.source_name,
            revision = event.short_revision(),
            added = event.added_lines.len(),
            removed = event.removed_lines.len(),
            reason,
            "Change dropped"
        );
        self.metrics.inc_dropped(reason);
        EventLogger::log_event(
            "change_dropped",
            vec![
                KeyValue::new("source", event.source_name.clone()),
                KeyValue::new("revision", event.revision_id.clone()),
                KeyValue::new("reason", reason),
            ],
        )
        .await;
    }

    /// Forwards a change to validation, or straight to commit when validation is off.
    pub async fn route_change(&self, event: ChangeEvent) -> ChangeRoute {
        self.metrics.inc_changes();
        if self.is_emergency_stopped() {
            self.drop_change(&event, "emergency_stop").await;
            return ChangeRoute::Dropped;
        }

        let wait = self.config.orchestrator.shutdown_timeout();
        let (route, sent) = if self.config.orchestrator.validation_enabled {
            (
                ChangeRoute::Validation,
                self.to_validation.send_timeout(event.clone(), wait).await,
            )
        } else {
            let request = CommitRequest {
                event: event.clone(),
                validation: None,
            };
            (ChangeRoute::Commit, self.to_commit.send_timeout(request, wait).await)
        };
        match sent {
            Ok(()) => {
                debug!(source = %event.source_name, route = ?route, "Change routed");
                route
            }
            Err(e) => {
                error!(source = %event.source_name, error = %e, "Next stage unavailable");
                self.drop_change(&event, "queue_unavailable").await;
                ChangeRoute::Dropped
            }
        }
    }

    /// Validates at most `max_candidates_per_change` added lines of `event`.
    ///
    /// The change is accepted or rejected as a whole. Rejections go to the
    /// ledger's failure log and are not retried.
    #[instrument(skip_all, fields(source = %event.source_name, revision = event.short_revision()))]
    pub async fn validate_change(
        &self,
        event: &ChangeEvent,
    ) -> Result<ValidationVerdict, EngineError> {
        if self.is_emergency_stopped() {
            self.drop_change(event, "emergency_stop").await;
            return Ok(ValidationVerdict::Dropped);
        }
        self.transition(OrchestratorState::Validating);

        let candidates: Vec<(String, String)> = event
            .added_lines
            .iter()
            .take(self.config.orchestrator.max_candidates_per_change)
            .map(|line| (line.clone(), event.source_name.clone()))
            .collect();
        let validator = self.validator.clone();
        let started = Instant::now();
        let reports =
            tokio::task::spawn_blocking(move || validator.validate_batch(&candidates)).await?;
        self.metrics
            .observe_validation_ms(started.elapsed().as_secs_f64() * 1_000.0);

        let summary = BatchSummary::from_reports(&reports);
        let verdict = if batch_accepted(&reports, self.validator.policy()) {
            info!(
                candidates = summary.total_patterns,
                avg_score = summary.avg_score,
                "Change passed validation"
            );
            ValidationVerdict::Accepted(summary)
        } else {
            let failure = ValidationFailure {
                source: event.source_name.clone(),
                revision: event.revision_id.clone(),
                timestamp: Utc::now(),
                summary,
                rejected_patterns: reports
                    .iter()
                    .filter(|r| !r.all_passed())
                    .map(|r| r.pattern.clone())
                    .collect(),
            };
            self.ledger.record_validation_failure(&failure)?;
            self.metrics
                .add_validation_failures(failure.rejected_patterns.len() as u64);
            EventLogger::log_event(
                "validation_failure",
                vec![
                    KeyValue::new("source", failure.source.clone()),
                    KeyValue::new("revision", failure.revision.clone()),
                    KeyValue::new("rejected", failure.rejected_patterns.len() as i64),
                ],
            )
            .await;
            ValidationVerdict::Rejected(failure)
        };
        self.transition(OrchestratorState::Watching);
        Ok(verdict)
    }

    /// Applies a cleared change: commit it on top of the head, then hot-swap the index.
    ///
    /// The head the change was applied to is the rollback point. Any failure
    /// rolls back to it when `auto_rollback` is set. A head moved by another
    /// ledger handle in between is picked up and the change re-applied to it.
    #[instrument(skip_all, fields(source = %request.event.source_name))]
    pub async fn apply_change(&self, request: CommitRequest) -> Result<ApplyOutcome, EngineError> {
        let serialized = self.ledger_lock.lock().await;
        // A rollback holding the lock may have engaged the stop.
        if self.is_emergency_stopped() {
            self.drop_change(&request.event, "emergency_stop").await;
            return Ok(ApplyOutcome::Dropped);
        }
        self.transition(OrchestratorState::Committing);

        let event = &request.event;
        let mut attempt = 1;
        let (rollback_point, result) = loop {
            let head = self.ledger.head()?;
            match self.commit_on_head(&head, &request) {
                Err(EngineError::Ledger(LedgerError::HeadConflict { found, .. }))
                    if attempt < MAX_APPLY_ATTEMPTS =>
                {
                    debug!(attempt, head = ?found, "Head moved while applying, retrying on the new head");
                    attempt += 1;
                }
                result => break (head.commit_id, result),
            }
        };

        match result {
            Ok(commit_id) => {
                drop(serialized);
                self.rollback_count.store(0, Ordering::SeqCst);
                *self.last_update.write() = Some(Utc::now());
                self.metrics.inc_commits();
                self.transition(OrchestratorState::Healthy);
                EventLogger::log_event(
                    "pattern_commit",
                    vec![
                        KeyValue::new("commit_id", commit_id.clone()),
                        KeyValue::new("source", event.source_name.clone()),
                        KeyValue::new("added", event.added_lines.len() as i64),
                        KeyValue::new("removed", event.removed_lines.len() as i64),
                    ],
                )
                .await;
                Ok(ApplyOutcome::Committed(commit_id))
            }
            Err(e) => {
                error!(
                    source = %event.source_name,
                    rollback_point = %rollback_point,
                    error = %e,
                    "Applying update failed"
                );
                if !self.config.orchestrator.auto_rollback {
                    // Nothing was committed or swapped.
                    self.transition(OrchestratorState::Watching);
                    return Err(e);
                }
                let reason = format!("apply failed for {}: {e}", event.source_name);
                let id = self
                    .rollback_serialized(
                        &serialized,
                        RollbackTarget::Commit(&rollback_point),
                        &reason,
                        None,
                    )
                    .await?;
                Ok(ApplyOutcome::RolledBack(id))
            }
        }
    }

    /// Commits `request` on top of `head`; the index is swapped only once the commit landed.
    fn commit_on_head(&self, head: &Commit, request: &CommitRequest) -> Result<String, EngineError> {
        let event = &request.event;
        let snapshot = head.pattern_snapshot.with_change(
            &event.source_name,
            &event.added_lines,
            &event.removed_lines,
        );
        let built = self.index.build(&snapshot)?;

        let message = format!(
            "Update {} to {}: +{} -{}",
            event.source_name,
            event.short_revision(),
            event.added_lines.len(),
            event.removed_lines.len()
        );
        let id = self.ledger.commit_on(
            &head.commit_id,
            snapshot,
            &message,
            &self.config.orchestrator.author,
            request.validation,
        )?;

        let rules = built.rule_count();
        self.index.swap(built);
        self.metrics.set_index_patterns(rules);
        Ok(id)
    }

    /// Counted rollback. Past the ceiling the emergency stop is engaged instead.
    async fn rollback(
        &self,
        target: RollbackTarget<'_>,
        reason: &str,
        health: Option<SystemHealth>,
    ) -> Result<String, EngineError> {
        let serialized = self.ledger_lock.lock().await;
        self.rollback_serialized(&serialized, target, reason, health)
            .await
    }

    async fn rollback_serialized(
        &self,
        _serialized: &MutexGuard<'_, ()>,
        target: RollbackTarget<'_>,
        reason: &str,
        health: Option<SystemHealth>,
    ) -> Result<String, EngineError> {
        let attempts = self.rollback_count.load(Ordering::SeqCst);
        let ceiling = self.config.orchestrator.max_rollback_attempts;
        if attempts >= ceiling {
            let why = format!("{attempts} rollbacks reached the ceiling of {ceiling}");
            self.engage_emergency_stop(&why).await;
            return Err(EngineError::EmergencyStopped(why));
        }

        let target = match target {
            RollbackTarget::Commit(id) => id.to_string(),
            RollbackTarget::LatestStable => self
                .ledger
                .latest_stable_commit()?
                .map(|c| c.commit_id)
                .ok_or(EngineError::NoStableCommit)?,
        };

        self.transition(OrchestratorState::RollingBack);
        let attempt = self.rollback_count.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self
            .ledger
            .rollback_to_commit(&target, reason, health, true)
            .map_err(EngineError::from)
            .and_then(|id| self.reload_index().map(|_| id));
        self.transition(OrchestratorState::Watching);
        let id = result?;

        self.metrics.inc_rollbacks();
        warn!(attempt, ceiling, target_commit = %target, reason, "Automatic rollback complete");
        EventLogger::log_event(
            "rollback",
            vec![
                KeyValue::new("commit_id", id.clone()),
                KeyValue::new("target_commit", target),
                KeyValue::new("attempt", i64::from(attempt)),
                KeyValue::new("reason", reason.to_string()),
            ],
        )
        .await;
        Ok(id)
    }

    /// Operator rollback. Not counted against the ceiling and allowed while stopped.
    pub async fn manual_rollback(&self, commit_id: &str, reason: &str) -> Result<String, EngineError> {
        let _serialized = self.ledger_lock.lock().await;
        let health = self.health.lock().latest().cloned();
        let id = self
            .ledger
            .rollback_to_commit(commit_id, reason, health, false)?;
        self.reload_index()?;
        self.metrics.inc_rollbacks();
        self.transition(OrchestratorState::Watching);
        EventLogger::log_event(
            "manual_rollback",
            vec![
                KeyValue::new("commit_id", id.clone()),
                KeyValue::new("target_commit", commit_id.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        )
        .await;
        Ok(id)
    }

    pub async fn engage_emergency_stop(&self, reason: &str) {
        self.emergency_stop.store(true, Ordering::SeqCst);
        *self.state.write() = OrchestratorState::EmergencyStopped;
        error!(reason, "Emergency stop engaged, further changes will be dropped");
        EventLogger::log_event(
            "emergency_stop",
            vec![
                KeyValue::new("reason", reason.to_string()),
                KeyValue::new("rollback_count", i64::from(self.rollback_count())),
            ],
        )
        .await;
    }

    /// Operator intervention: resumes processing and resets the rollback counter.
    pub async fn clear_emergency_stop(&self) {
        self.emergency_stop.store(false, Ordering::SeqCst);
        self.rollback_count.store(0, Ordering::SeqCst);
        *self.state.write() = if self.is_running() {
            OrchestratorState::Watching
        } else {
            OrchestratorState::Idle
        };
        info!("Emergency stop cleared");
        EventLogger::log_event("emergency_stop_cleared", Vec::new()).await;
    }

    /// Samples and classifies health; a critical sample triggers an emergency
    /// rollback to the latest stable commit when `auto_rollback` is set.
    pub async fn health_tick(&self) -> Result<SystemHealth, EngineError> {
        let health = self.probe.sample().await.into_health(&self.config.health);
        self.metrics
            .observe_lookup_ns(health.match_latency_ms * 1_000_000.0);
        self.health.lock().push(health.clone());

        match health.status {
            HealthStatus::Healthy => debug!(
                latency_ms = health.match_latency_ms,
                patterns = health.pattern_count,
                "System healthy"
            ),
            HealthStatus::Degraded => warn!(
                latency_ms = health.match_latency_ms,
                memory_mb = health.memory_mb,
                "System degraded"
            ),
            HealthStatus::Critical => {
                error!(
                    latency_ms = health.match_latency_ms,
                    false_positive_rate = health.false_positive_rate,
                    "System health critical"
                );
                if self.is_emergency_stopped() {
                    warn!("Emergency stop engaged, no automatic rollback");
                } else if self.config.orchestrator.auto_rollback {
                    self.rollback(
                        RollbackTarget::LatestStable,
                        "critical system health",
                        Some(health.clone()),
                    )
                    .await?;
                }
            }
        }
        Ok(health)
    }

    /// One polling round of the change monitor.
    pub async fn poll_sources(&self, force: bool) -> PollReport {
        let report = self.monitor.poll(force).await;
        for (source, error) in &report.errors {
            self.metrics.inc_fetch_errors(source);
            debug!(source = %source, error = %error, "Fetch error recorded");
        }
        if report.polled > 0 {
            debug!(
                polled = report.polled,
                changes = report.changes,
                deferred = report.deferred,
                errors = report.errors.len(),
                force,
                "Polling round finished"
            );
        }
        report
    }

    pub fn status(&self) -> OrchestratorStatus {
        let index = self.index.stats();
        OrchestratorStatus {
            state: self.state(),
            running: self.is_running(),
            emergency_stop: self.is_emergency_stopped(),
            rollback_count: self.rollback_count(),
            max_rollback_attempts: self.config.orchestrator.max_rollback_attempts,
            last_update: *self.last_update.read(),
            branch: self.ledger.current_branch(),
            head_commit: self.ledger.head_id().ok().flatten(),
            pattern_count: index.rules,
            index,
            health: self.health.lock().latest().cloned(),
            queues: QueueDepths {
                changes: self.changes.depth().get(),
                validation: self.to_validation.depth().get(),
                commits: self.to_commit.depth().get(),
            },
            sources: self.monitor.status(),
        }
    }

    async fn change_worker(self: Arc<Self>, mut changes: QueueReceiver<ChangeEvent>) {
        info!("Change worker started");
        let wait = self.config.orchestrator.queue_poll_timeout();
        while self.is_running() {
            match changes.recv_timeout(wait).await {
                Recv::Item(event) => {
                    self.route_change(event).await;
                }
                Recv::Timeout => {}
                Recv::Closed => break,
            }
        }
        info!("Change worker stopped");
    }

    async fn validation_worker(self: Arc<Self>, mut validation: QueueReceiver<ChangeEvent>) {
        info!("Validation worker started");
        let wait = self.config.orchestrator.queue_poll_timeout();
        while self.is_running() {
            let event = match validation.recv_timeout(wait).await {
                Recv::Item(event) => event,
                Recv::Timeout => continue,
                Recv::Closed => break,
            };
            match self.validate_change(&event).await {
                Ok(ValidationVerdict::Accepted(summary)) => {
                    let request = CommitRequest {
                        event: event.clone(),
                        validation: Some(summary),
                    };
                    let sent = self
                        .to_commit
                        .send_timeout(request, self.config.orchestrator.shutdown_timeout())
                        .await;
                    if let Err(e) = sent {
                        error!(source = %event.source_name, error = %e, "Commit stage unavailable");
                        self.drop_change(&event, "queue_unavailable").await;
                    }
                }
                Ok(ValidationVerdict::Rejected(_) | ValidationVerdict::Dropped) => {}
                Err(e) => {
                    error!(source = %event.source_name, error = %e, "Validation failed to run");
                    self.transition(OrchestratorState::Watching);
                }
            }
        }
        info!("Validation worker stopped");
    }

    async fn commit_worker(self: Arc<Self>, mut commits: QueueReceiver<CommitRequest>) {
        info!("Commit worker started");
        let wait = self.config.orchestrator.queue_poll_timeout();
        while self.is_running() {
            let request = match commits.recv_timeout(wait).await {
                Recv::Item(request) => request,
                Recv::Timeout => continue,
                Recv::Closed => break,
            };
            let source = request.event.source_name.clone();
            match self.apply_change(request).await {
                Ok(ApplyOutcome::Committed(id)) => {
                    debug!(source = %source, commit = %id, "Change committed")
                }
                Ok(ApplyOutcome::RolledBack(id)) => {
                    warn!(source = %source, commit = %id, "Change rolled back")
                }
                Ok(ApplyOutcome::Dropped) => {}
                Err(e) => error!(source = %source, error = %e, "Commit failed"),
            }
        }
        info!("Commit worker stopped");
    }

    async fn health_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Health worker started");
        let mut ticker = tokio::time::interval(self.config.orchestrator.health_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; sample after one full interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.is_running() {
                break;
            }
            if let Err(e) = self.health_tick().await {
                error!(error = %e, "Health check failed");
            }
        }
        info!("Health worker stopped");
    }

    async fn monitor_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Monitor loop started");
        let mut ticker = tokio::time::interval(self.config.monitor.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let refresh = self.config.orchestrator.pattern_refresh_interval();
        let mut last_refresh: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if !self.is_running() {
                break;
            }
            let force = last_refresh.map_or(true, |at| at.elapsed() >= refresh);
            if force {
                last_refresh = Some(Instant::now());
            }
            self.poll_sources(force).await;
        }
        info!("Monitor loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use pixelguard_core::model::Snapshot;
    use pixelguard_monitor::FileFetcher;
    use tracing_test::traced_test;

    use super::*;

    async fn orchestrator(mutate: impl FnOnce(&mut PixelGuardConfig)) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PixelGuardConfig::default();
        config.monitor.cache_dir = dir.path().join("cache");
        config.validation.workers = 2;
        mutate(&mut config);
        let ledger = PatternLedger::in_memory().unwrap();
        let orchestrator = Orchestrator::new(config, ledger, Arc::new(FileFetcher))
            .await
            .unwrap();
        (orchestrator, dir)
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn accepted_change_is_committed_and_indexed() {
        let (orchestrator, _dir) = orchestrator(|_| {}).await;
        let event = ChangeEvent::new("easylist", "r1", lines(&["||doubleclick.net^"]), vec![]);

        let ValidationVerdict::Accepted(summary) =
            orchestrator.validate_change(&event).await.unwrap()
        else {
            panic!("tracker rule should pass validation");
        };
        let outcome = orchestrator
            .apply_change(CommitRequest {
                event,
                validation: Some(summary),
            })
            .await
            .unwrap();

        let ApplyOutcome::Committed(id) = outcome else {
            panic!("expected a commit, got {outcome:?}");
        };
        let head = orchestrator.ledger().head().unwrap();
        assert_eq!(head.commit_id, id);
        assert_eq!(head.validation_results, Some(summary));
        assert!(orchestrator
            .index()
            .lookup("https://ad.doubleclick.net/pixel.gif")
            .is_some());
        assert_eq!(orchestrator.state(), OrchestratorState::Healthy);
    }

    #[tokio::test]
    async fn rejected_change_lands_in_failure_log() {
        let (orchestrator, _dir) = orchestrator(|_| {}).await;
        let event = ChangeEvent::new("list", "r2", lines(&["/tracker(/"]), vec![]);

        let verdict = orchestrator.validate_change(&event).await.unwrap();
        let ValidationVerdict::Rejected(failure) = verdict else {
            panic!("broken pattern must be rejected");
        };
        assert_eq!(failure.rejected_patterns, vec!["/tracker(/".to_string()]);
        let logged = orchestrator.ledger().validation_failures().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].revision, "r2");
    }

    #[tokio::test]
    async fn index_build_failure_rolls_back_to_previous_head() {
        let (orchestrator, _dir) = orchestrator(|c| c.orchestrator.validation_enabled = false).await;
        let before = orchestrator.ledger().head_id().unwrap().unwrap();

        let event = ChangeEvent::new("list", "r3", lines(&["/tracker(/"]), vec![]);
        let outcome = orchestrator
            .apply_change(CommitRequest {
                event,
                validation: None,
            })
            .await
            .unwrap();

        let ApplyOutcome::RolledBack(id) = outcome else {
            panic!("expected a rollback, got {outcome:?}");
        };
        let head = orchestrator.ledger().head().unwrap();
        assert_eq!(head.commit_id, id);
        assert!(head.is_rollback());
        assert_eq!(head.changes.target_commit.as_deref(), Some(before.as_str()));
        assert_eq!(orchestrator.rollback_count(), 1);
        assert_eq!(orchestrator.state(), OrchestratorState::Watching);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_apply_and_rollback_keep_index_on_head() {
        let (orchestrator, _dir) = orchestrator(|c| c.orchestrator.validation_enabled = false).await;
        let orchestrator = Arc::new(orchestrator);
        let base = orchestrator
            .ledger()
            .commit(Snapshot::from_sources([("s", vec!["||base-tracker.com^"])]), "base", "test", None)
            .unwrap();
        orchestrator.reload_index().unwrap();

        for round in 0..32 {
            let rule = format!("||t{round}-tracker.com^");
            let event = ChangeEvent::new("list", format!("r{round}"), vec![rule.clone()], vec![]);
            let applying = tokio::spawn({
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    orchestrator
                        .apply_change(CommitRequest { event, validation: None })
                        .await
                }
            });
            let rolling = tokio::spawn({
                let orchestrator = Arc::clone(&orchestrator);
                let base = base.clone();
                async move { orchestrator.manual_rollback(&base, "operator").await }
            });
            let applied = applying.await.unwrap().unwrap();
            let rollback = rolling.await.unwrap().unwrap();
            assert!(matches!(applied, ApplyOutcome::Committed(_)), "{applied:?}");

            let head = orchestrator.ledger().head().unwrap();
            assert_eq!(
                orchestrator.index().current().rule_count(),
                head.pattern_snapshot.pattern_count()
            );
            assert_eq!(
                orchestrator
                    .index()
                    .lookup(&format!("https://t{round}-tracker.com/p.gif"))
                    .is_some(),
                head.pattern_snapshot.contains(&rule).is_some()
            );
            let history = orchestrator.ledger().get_history(4).unwrap();
            assert!(history.iter().any(|c| c.commit_id == rollback));
        }
    }

    #[tokio::test]
    async fn commit_resets_rollback_counter() {
        let (orchestrator, _dir) = orchestrator(|c| c.orchestrator.validation_enabled = false).await;
        let broken = ChangeEvent::new("list", "bad", lines(&["/tracker(/"]), vec![]);
        orchestrator
            .apply_change(CommitRequest { event: broken, validation: None })
            .await
            .unwrap();
        assert_eq!(orchestrator.rollback_count(), 1);

        let good = ChangeEvent::new("list", "good", lines(&["||tracker.com^"]), vec![]);
        orchestrator
            .apply_change(CommitRequest { event: good, validation: None })
            .await
            .unwrap();
        assert_eq!(orchestrator.rollback_count(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn emergency_stop_drops_changes() {
        let (orchestrator, _dir) = orchestrator(|c| c.orchestrator.emergency_stop = true).await;
        assert_eq!(orchestrator.state(), OrchestratorState::EmergencyStopped);

        let event = ChangeEvent::new("list", "r4", lines(&["||tracker.com^"]), vec![]);
        assert_eq!(orchestrator.route_change(event.clone()).await, ChangeRoute::Dropped);
        assert_eq!(
            orchestrator
                .apply_change(CommitRequest { event, validation: None })
                .await
                .unwrap(),
            ApplyOutcome::Dropped
        );
        assert_eq!(orchestrator.ledger().get_history(10).unwrap().len(), 1);
        assert_eq!(
            orchestrator
                .metrics()
                .changes_dropped
                .with_label_values(&["emergency_stop"])
                .get(),
            2
        );

        assert!(logs_contain("Change dropped"));

        orchestrator.clear_emergency_stop().await;
        assert!(!orchestrator.is_emergency_stopped());
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn manual_rollback_restores_snapshot_and_index() {
        let (orchestrator, _dir) = orchestrator(|_| {}).await;
        let ledger = orchestrator.ledger();
        let first = ledger
            .commit(Snapshot::from_sources([("s", vec!["||a-tracker.com^"])]), "one", "test", None)
            .unwrap();
        ledger
            .commit(Snapshot::from_sources([("s", vec!["||b-tracker.com^"])]), "two", "test", None)
            .unwrap();
        orchestrator.reload_index().unwrap();
        assert!(orchestrator.index().lookup("https://b-tracker.com/p.gif").is_some());

        orchestrator.manual_rollback(&first, "operator").await.unwrap();
        assert!(orchestrator.index().lookup("https://a-tracker.com/p.gif").is_some());
        assert!(orchestrator.index().lookup("https://b-tracker.com/p.gif").is_none());
        assert_eq!(orchestrator.rollback_count(), 0);

        assert!(matches!(
            orchestrator.manual_rollback("feedface", "operator").await,
            Err(EngineError::Ledger(_))
        ));
    }

    #[tokio::test]
    async fn status_serializes() {
        let (orchestrator, _dir) = orchestrator(|_| {}).await;
        let status = orchestrator.status();
        assert_eq!(status.state, OrchestratorState::Idle);
        assert_eq!(status.queues, QueueDepths::default());
        let json = status.to_json().unwrap();
        assert!(json.contains("\"state\": \"idle\""));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (orchestrator, _dir) = orchestrator(|_| {}).await;
        let orchestrator = Arc::new(orchestrator);
        orchestrator.start().unwrap();
        assert!(matches!(orchestrator.start(), Err(EngineError::AlreadyStarted)));
        orchestrator.shutdown().await;
        assert!(!orchestrator.is_running());
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
    }
}
