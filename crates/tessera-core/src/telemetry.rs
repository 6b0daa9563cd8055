//! Pluggable metrics sink.
//!
//! The engine instruments its processing loop with `tracing` spans and a
//! small set of counters emitted through [`MetricsSink`]. Export backends
//! are out of scope; embeddings plug in whatever sink they run.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counter and duration metrics emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    /// Envelopes accepted for processing.
    EventsReceived,
    /// Event envelopes published on the bus.
    EventsEmitted,
    /// Command envelopes routed downstream.
    CommandsSent,
    /// Duplicate deliveries answered from the store.
    IdempotencyHits,
    /// Ingress scope or contract rejections.
    SecurityViolations,
    /// Optimistic concurrency conflicts.
    ConcurrencyConflicts,
    /// Adapter decision failures.
    AdapterFailures,
    /// Messages moved to the dead-letter queue.
    DeadLetters,
    /// Wall-clock processing duration per message.
    ProcessingDurationMs,
}

impl Metric {
    /// Stable metric name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EventsReceived => "events_received_total",
            Self::EventsEmitted => "events_emitted_total",
            Self::CommandsSent => "commands_sent_total",
            Self::IdempotencyHits => "idempotency_hits_total",
            Self::SecurityViolations => "security_violations_total",
            Self::ConcurrencyConflicts => "concurrency_conflicts_total",
            Self::AdapterFailures => "adapter_failures_total",
            Self::DeadLetters => "dead_letters_total",
            Self::ProcessingDurationMs => "event_processing_duration_ms",
        }
    }
}

/// Sink for engine metrics.
pub trait MetricsSink: Send + Sync {
    /// Increments a counter.
    fn incr(&self, metric: Metric, by: u64);

    /// Records an observed duration in milliseconds.
    fn observe_duration_ms(&self, metric: Metric, ms: u64);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _metric: Metric, _by: u64) {}

    fn observe_duration_ms(&self, _metric: Metric, _ms: u64) {}
}

/// In-memory sink exposing a counter snapshot, for tests and local
/// introspection.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    counters: Mutex<BTreeMap<&'static str, u64>>,
}

impl CounterMetrics {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter.
    #[must_use]
    pub fn get(&self, metric: Metric) -> u64 {
        self.counters
            .lock()
            .expect("metrics mutex poisoned")
            .get(metric.name())
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of every counter, keyed by metric name.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.counters
            .lock()
            .expect("metrics mutex poisoned")
            .clone()
    }
}

impl MetricsSink for CounterMetrics {
    fn incr(&self, metric: Metric, by: u64) {
        let mut counters = self.counters.lock().expect("metrics mutex poisoned");
        *counters.entry(metric.name()).or_insert(0) += by;
    }

    fn observe_duration_ms(&self, metric: Metric, ms: u64) {
        let mut counters = self.counters.lock().expect("metrics mutex poisoned");
        *counters.entry(metric.name()).or_insert(0) += ms;
    }
}
