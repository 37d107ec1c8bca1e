//! # PixelGuard Telemetry
//!
//! Structured event logging and Prometheus metrics for the pattern pipeline.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
