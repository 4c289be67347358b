//! Per-operation measurements
//!
//! Collection operations and lock calls report one sample each. Sinks decide
//! where samples go; the default forwards them to `tracing`.

use std::sync::Mutex;
use std::time::Instant;

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Error,
}

impl Outcome {
    pub fn of<T, E>(result: &std::result::Result<T, E>) -> Self {
        if result.is_ok() { Self::Ok } else { Self::Error }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// One measured operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSample {
    pub operation: String,
    pub backend: String,
    pub duration_micros: u64,
    pub outcome: Outcome,
}

impl OperationSample {
    pub fn new(operation: &str, backend: &str, started: Instant, outcome: Outcome) -> Self {
        Self {
            operation: operation.to_string(),
            backend: backend.to_string(),
            duration_micros: started.elapsed().as_micros().min(u64::MAX as u128) as u64,
            outcome,
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, sample: &OperationSample);
}

/// Emits every sample as a `debug` event on the `tenantdb::metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, sample: &OperationSample) {
        tracing::debug!(
            target: "tenantdb::metrics",
            operation = %sample.operation,
            backend = %sample.backend,
            duration_micros = sample.duration_micros,
            outcome = sample.outcome.as_str(),
            "operation"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _sample: &OperationSample) {}
}

/// Keeps samples in memory
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    samples: Mutex<Vec<OperationSample>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> Vec<OperationSample> {
        self.samples.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Samples for one operation name
    pub fn count(&self, operation: &str) -> usize {
        self.samples
            .lock()
            .map(|s| s.iter().filter(|sample| sample.operation == operation).count())
            .unwrap_or(0)
    }

    /// Per-operation count and total duration, sorted by operation
    pub fn summary(&self) -> Vec<(String, usize, u64)> {
        let mut totals: std::collections::BTreeMap<String, (usize, u64)> = Default::default();
        for sample in self.samples() {
            let entry = totals.entry(sample.operation).or_default();
            entry.0 += 1;
            entry.1 += sample.duration_micros;
        }
        totals.into_iter().map(|(op, (n, micros))| (op, n, micros)).collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, sample: &OperationSample) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(sample.clone());
        }
    }
}
