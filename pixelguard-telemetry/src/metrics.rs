//! ## pixelguard-telemetry::metrics
//! **Prometheus registry for the pattern pipeline**
//!
//! ### Expectations:
//! - Cloning a recorder shares the underlying metrics
//! - Lookup latency is bucketed in nanoseconds, validation latency in milliseconds

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub changes: IntCounter,
    pub changes_dropped: IntCounterVec,
    pub commits: IntCounter,
    pub rollbacks: IntCounter,
    pub validation_failures: IntCounter,
    pub fetch_errors: IntCounterVec,
    pub index_patterns: IntGauge,
    pub lookup_latency: Histogram,
    pub validation_latency: Histogram,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRecorder {
    /// Builds a recorder with a private registry.
    ///
    /// Metric names are static, so construction only fails on programmer error.
    pub fn new() -> Self {
        Self::try_new().expect("static metric definitions are valid")
    }

    pub fn try_new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let changes = IntCounter::new("pixelguard_changes_total", "Change events observed")?;
        let changes_dropped = IntCounterVec::new(
            Opts::new(
                "pixelguard_changes_dropped_total",
                "Change events dropped before commit",
            ),
            &["reason"],
        )?;
        let commits = IntCounter::new("pixelguard_commits_total", "Ledger commits written")?;
        let rollbacks = IntCounter::new("pixelguard_rollbacks_total", "Rollbacks performed")?;
        let validation_failures = IntCounter::new(
            "pixelguard_validation_failures_total",
            "Candidate patterns rejected by validation",
        )?;
        let fetch_errors = IntCounterVec::new(
            Opts::new("pixelguard_fetch_errors_total", "Failed source fetches"),
            &["source"],
        )?;
        let index_patterns =
            IntGauge::new("pixelguard_index_patterns", "Patterns in the live index")?;
        let lookup_latency = Histogram::with_opts(
            HistogramOpts::new("pixelguard_lookup_latency_ns", "Index lookup time")
                .buckets(vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]),
        )?;
        let validation_latency = Histogram::with_opts(
            HistogramOpts::new(
                "pixelguard_validation_latency_ms",
                "Batch validation time",
            )
            .buckets(vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0]),
        )?;

        registry.register(Box::new(changes.clone()))?;
        registry.register(Box::new(changes_dropped.clone()))?;
        registry.register(Box::new(commits.clone()))?;
        registry.register(Box::new(rollbacks.clone()))?;
        registry.register(Box::new(validation_failures.clone()))?;
        registry.register(Box::new(fetch_errors.clone()))?;
        registry.register(Box::new(index_patterns.clone()))?;
        registry.register(Box::new(lookup_latency.clone()))?;
        registry.register(Box::new(validation_latency.clone()))?;

        Ok(Self {
            registry,
            changes,
            changes_dropped,
            commits,
            rollbacks,
            validation_failures,
            fetch_errors,
            index_patterns,
            lookup_latency,
            validation_latency,
        })
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("metrics are not UTF-8: {e}")))
    }

    pub fn inc_changes(&self) {
        self.changes.inc();
    }

    pub fn inc_dropped(&self, reason: &str) {
        self.changes_dropped.with_label_values(&[reason]).inc();
    }

    pub fn inc_commits(&self) {
        self.commits.inc();
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.inc();
    }

    pub fn add_validation_failures(&self, count: u64) {
        self.validation_failures.inc_by(count);
    }

    pub fn inc_fetch_errors(&self, source: &str) {
        self.fetch_errors.with_label_values(&[source]).inc();
    }

    pub fn set_index_patterns(&self, count: usize) {
        self.index_patterns.set(count as i64);
    }

    pub fn observe_lookup_ns(&self, nanos: f64) {
        self.lookup_latency.observe(nanos);
    }

    pub fn observe_validation_ms(&self, millis: f64) {
        self.validation_latency.observe(millis);
    }
}
