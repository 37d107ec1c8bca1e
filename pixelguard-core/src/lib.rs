//! # pixelguard-core
//!
//! Shared foundation for the pattern lifecycle pipeline.
//!
//! ### Key Submodules:
//! - `model`: snapshots, threat levels, confidence and priority enums
//! - `events`: change events and the bounded FIFO queues between pipeline stages
//! - `error`: crate-level error type
//!
//! Every other crate depends on this one; nothing here does I/O.

pub mod error;
pub mod events;
pub mod model;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::events::*;
    pub use crate::model::*;
}

pub use error::CoreError;
