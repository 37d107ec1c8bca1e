//! ## pixelguard-engine::health
//! **Health sampling and classification**
//!
//! ### Expectations:
//! - Classification is a pure function of the thresholds and one sample
//! - Probing never touches the live index's hit/miss counters
//! - The history keeps only the newest `history_len` samples

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use pixelguard_config::HealthConfig;
use pixelguard_core::model::{HealthStatus, SystemHealth};
use pixelguard_detection::PatternIndex;
use pixelguard_validator::Corpus;

/// Raw measurements, before classification.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HealthSample {
    pub match_latency_ms: f64,
    pub pattern_count: usize,
    pub false_positive_rate: f64,
    pub cache_hit_rate: f64,
    pub memory_mb: f64,
}

impl HealthSample {
    pub fn classify(&self, thresholds: &HealthConfig) -> HealthStatus {
        if self.match_latency_ms > thresholds.critical_latency_ms
            || self.false_positive_rate > thresholds.critical_false_positive_rate
        {
            HealthStatus::Critical
        } else if self.match_latency_ms > thresholds.degraded_latency_ms
            || self.memory_mb > thresholds.degraded_memory_mb
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn into_health(self, thresholds: &HealthConfig) -> SystemHealth {
        SystemHealth {
            timestamp: Utc::now(),
            match_latency_ms: self.match_latency_ms,
            pattern_count: self.pattern_count,
            false_positive_rate: self.false_positive_rate,
            cache_hit_rate: self.cache_hit_rate,
            memory_mb: self.memory_mb,
            status: self.classify(thresholds),
        }
    }
}

/// Source of health measurements for the health worker.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn sample(&self) -> HealthSample;
}

/// Measures the live index against the validation corpus.
///
/// Latency is the mean time of a lookup plus sub-pattern match over the
/// performance URLs; the false-positive rate is the share of legitimate URLs
/// the index flags.
pub struct IndexHealthProbe {
    index: Arc<PatternIndex>,
    corpus: Arc<Corpus>,
}

impl IndexHealthProbe {
    pub fn new(index: Arc<PatternIndex>, corpus: Arc<Corpus>) -> Self {
        Self { index, corpus }
    }

    fn flags(snapshot: &pixelguard_detection::IndexSnapshot, url: &str) -> bool {
        match snapshot.lookup(url) {
            Some(entry) => !entry.match_sub_patterns(url).is_empty(),
            None => !snapshot.match_global(url).is_empty(),
        }
    }
}

#[async_trait]
impl HealthProbe for IndexHealthProbe {
    async fn sample(&self) -> HealthSample {
        let snapshot = self.index.current();

        let urls = self.corpus.performance_urls();
        let started = Instant::now();
        for url in urls {
            std::hint::black_box(Self::flags(&snapshot, url));
        }
        let match_latency_ms = if urls.is_empty() {
            0.0
        } else {
            started.elapsed().as_secs_f64() * 1000.0 / urls.len() as f64
        };

        let legitimate = self.corpus.legitimate_urls();
        let flagged = legitimate
            .iter()
            .filter(|url| Self::flags(&snapshot, url))
            .count();
        let false_positive_rate = if legitimate.is_empty() {
            0.0
        } else {
            flagged as f64 / legitimate.len() as f64
        };

        let stats = self.index.stats();
        HealthSample {
            match_latency_ms,
            pattern_count: stats.rules,
            false_positive_rate,
            cache_hit_rate: stats.hit_rate(),
            memory_mb: stats.approx_memory_mb(),
        }
    }
}

/// Ring buffer of classified samples.
#[derive(Debug)]
pub struct HealthHistory {
    samples: VecDeque<SystemHealth>,
    capacity: usize,
}

impl HealthHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, health: SystemHealth) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(health);
    }

    pub fn latest(&self) -> Option<&SystemHealth> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<SystemHealth> {
        self.samples.iter().cloned().collect()
    }
}
