use pixelguard_core::events::EventError;
use pixelguard_detection::DetectionError;
use pixelguard_ledger::LedgerError;
use pixelguard_validator::ValidatorError;
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Index build failed: {0}")]
    Detection(#[from] DetectionError),

    #[error("Validator setup failed: {0}")]
    Validator(#[from] ValidatorError),

    #[error("No stable commit to roll back to")]
    NoStableCommit,

    #[error("Emergency stop engaged: {0}")]
    EmergencyStopped(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Orchestrator already started")]
    AlreadyStarted,

    #[error("Worker task failed: {0}")]
    Join(#[from] JoinError),
}

impl From<EventError> for EngineError {
    fn from(err: EventError) -> Self {
        EngineError::Config(err.to_string())
    }
}
