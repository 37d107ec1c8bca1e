//! # PixelGuard Engine
//!
//! The orchestrator that closes the pattern lifecycle loop: detected source
//! changes are validated, committed to the ledger, hot-loaded into the index and
//! watched by the health sampler, which rolls back bad updates.
//!
//! ### Key Submodules:
//! - `orchestrator`: [`Orchestrator`], its workers and the manual operator controls
//! - `health`: the [`HealthProbe`] seam, classification and the sample ring buffer
//! - `status`: [`OrchestratorState`] and the JSON status report

mod error;
pub mod health;
pub mod orchestrator;
pub mod status;

pub use error::EngineError;
pub use health::{HealthHistory, HealthProbe, HealthSample, IndexHealthProbe};
pub use orchestrator::{ApplyOutcome, ChangeRoute, CommitRequest, Orchestrator, ValidationVerdict};
pub use status::{OrchestratorState, OrchestratorStatus, QueueDepths};

pub mod prelude {
    pub use super::{EngineError, Orchestrator, OrchestratorState, OrchestratorStatus};
}
