//! Operator-facing view of a running orchestrator.

use chrono::{DateTime, Utc};
use pixelguard_core::model::SystemHealth;
use pixelguard_detection::IndexStats;
use pixelguard_monitor::SourceStatus;
use serde::Serialize;

/// Logical state of the control loop.
///
/// `EmergencyStopped` is left only through
/// [`Orchestrator::clear_emergency_stop`](crate::Orchestrator::clear_emergency_stop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    Watching,
    Validating,
    Committing,
    Healthy,
    RollingBack,
    EmergencyStopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub changes: usize,
    pub validation: usize,
    pub commits: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub state: OrchestratorState,
    pub running: bool,
    pub emergency_stop: bool,
    pub rollback_count: u32,
    pub max_rollback_attempts: u32,
    pub last_update: Option<DateTime<Utc>>,
    pub branch: String,
    pub head_commit: Option<String>,
    pub pattern_count: usize,
    pub index: IndexStats,
    pub health: Option<SystemHealth>,
    pub queues: QueueDepths,
    pub sources: Vec<SourceStatus>,
}

impl OrchestratorStatus {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
