use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pixelguard_config::{PixelGuardConfig, SourceConfig};
use pixelguard_core::events::ChangeEvent;
use pixelguard_core::model::{HealthStatus, Snapshot};
use pixelguard_engine::{
    EngineError, HealthProbe, HealthSample, Orchestrator, OrchestratorState,
};
use pixelguard_ledger::PatternLedger;
use pixelguard_monitor::FileFetcher;

/// Reports a latency far above every threshold.
struct CriticalProbe;

#[async_trait]
impl HealthProbe for CriticalProbe {
    async fn sample(&self) -> HealthSample {
        HealthSample {
            match_latency_ms: 500.0,
            pattern_count: 1,
            ..Default::default()
        }
    }
}

fn config(dir: &Path) -> PixelGuardConfig {
    let mut config = PixelGuardConfig::default();
    config.monitor.cache_dir = dir.join("cache");
    config.validation.workers = 2;
    config.orchestrator.queue_poll_timeout_ms = 50;
    config.orchestrator.shutdown_timeout_secs = 2;
    config
}

fn snap(patterns: &[&str]) -> Snapshot {
    Snapshot::from_sources([("s", patterns.to_vec())])
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn critical_health_rolls_back_once_per_observation_until_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(
        config(dir.path()),
        PatternLedger::in_memory().unwrap(),
        Arc::new(FileFetcher),
    )
    .await
    .unwrap()
    .with_probe(Arc::new(CriticalProbe));

    let ledger = Arc::clone(orchestrator.ledger());
    ledger.commit(snap(&["||a.com^"]), "c1", "test", None).unwrap();
    ledger.commit(snap(&["||a.com^", "||b.com^"]), "c2", "test", None).unwrap();
    ledger
        .commit(snap(&["||a.com^", "||b.com^", "||c.com^"]), "c3", "test", None)
        .unwrap();
    let committed = ledger.get_history(100).unwrap().len();

    for observation in 1..=3u32 {
        let health = orchestrator.health_tick().await.unwrap();
        assert_eq!(health.status, HealthStatus::Critical);
        assert_eq!(orchestrator.rollback_count(), observation);

        let history = ledger.get_history(100).unwrap();
        assert_eq!(history.len(), committed + observation as usize);
        let head = &history[0];
        assert!(head.is_rollback());
        let target = ledger
            .get_commit(head.changes.target_commit.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(head.pattern_snapshot, target.pattern_snapshot);
    }

    let stopped = orchestrator.health_tick().await;
    assert!(matches!(stopped, Err(EngineError::EmergencyStopped(_))));
    assert_eq!(orchestrator.state(), OrchestratorState::EmergencyStopped);
    assert_eq!(orchestrator.rollback_count(), 3);
    assert_eq!(ledger.get_history(100).unwrap().len(), committed + 3);
    assert_eq!(ledger.rollback_points().unwrap().len(), 3);

    // Further critical samples are recorded but change nothing.
    orchestrator.health_tick().await.unwrap();
    assert_eq!(ledger.get_history(100).unwrap().len(), committed + 3);
    assert_eq!(orchestrator.health_history().len(), 5);
}

#[tokio::test]
async fn source_change_flows_through_to_index_and_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("trackers.txt");
    std::fs::write(&list, "! tracker list\n||doubleclick.net^\n").unwrap();

    let mut config = config(dir.path());
    config.monitor.sources =
        vec![SourceConfig::new("trackers", list.to_string_lossy()).with_poll_interval(Duration::from_secs(1))];
    let orchestrator = Arc::new(
        Orchestrator::new(config, PatternLedger::in_memory().unwrap(), Arc::new(FileFetcher))
            .await
            .unwrap(),
    );
    orchestrator.start().unwrap();

    // The monitor loop polls every source once at startup.
    eventually("first commit", || {
        orchestrator
            .index()
            .lookup("https://stats.doubleclick.net/pixel.gif")
            .is_some()
    })
    .await;
    let first = orchestrator.ledger().head().unwrap();
    assert!(first.validation_results.is_some());

    std::fs::write(&list, "! tracker list\n||doubleclick.net^\n||taboola.com^\n").unwrap();
    let report = orchestrator.poll_sources(true).await;
    assert_eq!(report.errors, Vec::new());
    eventually("second commit", || {
        orchestrator
            .index()
            .lookup("https://cdn.taboola.com/beacon.gif")
            .is_some()
    })
    .await;

    let head = orchestrator.ledger().head().unwrap();
    let diff = orchestrator
        .ledger()
        .diff(&first.commit_id, &head.commit_id)
        .unwrap();
    assert_eq!(diff.added_patterns, vec!["||taboola.com^".to_string()]);
    assert!(diff.removed_patterns.is_empty());

    let status = orchestrator.status();
    assert_eq!(status.sources.len(), 1);
    assert_eq!(status.rollback_count, 0);
    assert!(status.last_update.is_some());

    orchestrator.shutdown().await;
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn rejected_change_never_reaches_the_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Arc::new(
        Orchestrator::new(
            config(dir.path()),
            PatternLedger::in_memory().unwrap(),
            Arc::new(FileFetcher),
        )
        .await
        .unwrap(),
    );
    orchestrator.start().unwrap();
    let root = orchestrator.ledger().head_id().unwrap();

    orchestrator
        .submit_change(ChangeEvent::new(
            "manual",
            "rev-1",
            vec!["/(a+)+b/".to_string()],
            Vec::new(),
        ))
        .unwrap();
    eventually("failure log entry", || {
        !orchestrator.ledger().validation_failures().unwrap().is_empty()
    })
    .await;

    assert_eq!(orchestrator.ledger().head_id().unwrap(), root);
    let failures = orchestrator.ledger().validation_failures().unwrap();
    assert_eq!(failures[0].source, "manual");
    assert_eq!(failures[0].rejected_patterns, vec!["/(a+)+b/".to_string()]);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn removal_only_change_drops_patterns_from_index() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("trackers.txt");
    std::fs::write(&list, "||doubleclick.net^\n||taboola.com^\n").unwrap();

    let mut config = config(dir.path());
    config.monitor.sources =
        vec![SourceConfig::new("trackers", list.to_string_lossy()).with_poll_interval(Duration::from_secs(1))];
    let orchestrator = Arc::new(
        Orchestrator::new(config, PatternLedger::in_memory().unwrap(), Arc::new(FileFetcher))
            .await
            .unwrap(),
    );
    orchestrator.start().unwrap();
    eventually("first commit", || {
        orchestrator
            .index()
            .lookup("https://cdn.taboola.com/beacon.gif")
            .is_some()
    })
    .await;
    let first = orchestrator.ledger().head().unwrap();

    std::fs::write(&list, "||doubleclick.net^\n").unwrap();
    orchestrator.poll_sources(true).await;
    eventually("removal commit", || {
        orchestrator
            .index()
            .lookup("https://cdn.taboola.com/beacon.gif")
            .is_none()
    })
    .await;

    let head = orchestrator.ledger().head().unwrap();
    assert!(!head.is_rollback());
    assert_eq!(head.validation_results.map(|v| v.total_patterns), Some(0));
    assert_eq!(head.pattern_snapshot.pattern_count(), 1);
    let diff = orchestrator
        .ledger()
        .diff(&first.commit_id, &head.commit_id)
        .unwrap();
    assert!(diff.added_patterns.is_empty());
    assert_eq!(diff.removed_patterns, vec!["||taboola.com^".to_string()]);
    assert!(orchestrator
        .index()
        .lookup("https://stats.doubleclick.net/pixel.gif")
        .is_some());

    orchestrator.shutdown().await;
}
