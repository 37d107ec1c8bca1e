//! ## pixelguard-telemetry::logging
//! **Structured event logging with tracing and OpenTelemetry key-values**
//!
//! ### Expectations:
//! - Every state change of the pipeline is emitted as one `pipeline_event` span
//! - `RUST_LOG` overrides the configured default level
//! - Repeated initialization is harmless

use opentelemetry::KeyValue;
use tracing::{info_span, Instrument};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global subscriber. A subscriber that is already installed is kept.
    pub fn init_with_level(default_level: &str) {
        let _ = fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default_level)),
            )
            .with_thread_names(true)
            .with_span_events(FmtSpan::ENTER)
            .try_init();
    }

    #[inline]
    pub async fn log_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!(
            "pipeline_event",
            event_type = event_type,
            otel.kind = "INTERNAL"
        );

        async {
            tracing::info!(
                metadata = ?metadata,
                "Pipeline event recorded"
            );
        }
        .instrument(span)
        .await
    }

    /// Blocking counterpart of [`EventLogger::log_event`] for worker threads.
    pub fn record_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!(
            "pipeline_event",
            event_type = event_type,
            otel.kind = "INTERNAL"
        );
        let _entered = span.enter();
        tracing::info!(metadata = ?metadata, "Pipeline event recorded");
    }
}
