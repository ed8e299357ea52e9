use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

pub const GAUGE_ASYNC_BATCH_SIZE: &str = "async_batch_size";
pub const GAUGE_ASYNC_WAIT_QUERY_SIZE: &str = "async_wait_query_size";
pub const GAUGE_ASYNC_ITERATE_LATENCY_MS: &str = "async_iterate_latency_ms";
pub const GAUGE_KV_CACHE_MEM_USED_RATIO: &str = "kv_cache_mem_used_ratio";
pub const COUNTER_ERROR_EXIT: &str = "error_exit";

/// Sink for the engine's per-step gauges and counters.
///
/// The engine reports through this trait only; hosts plug in their metrics
/// pipeline, tests plug in [`RecordingMetrics`].
pub trait MetricsSink: Send + Sync {
    fn gauge(&self, name: &'static str, value: f64);
    fn counter(&self, name: &'static str, value: u64);
    /// Push buffered values out; called before a fatal exit.
    fn flush(&self) {}
}

/// Default sink: emits every report as a `tracing` debug event.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn gauge(&self, name: &'static str, value: f64) {
        debug!(metric = name, value, "gauge");
    }

    fn counter(&self, name: &'static str, value: u64) {
        debug!(metric = name, value, "counter");
    }
}

/// In-memory sink that keeps every reported value, for assertions.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    gauges: Mutex<HashMap<&'static str, Vec<f64>>>,
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge_values(&self, name: &str) -> Vec<f64> {
        self.gauges
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.gauge_values(name).last().copied()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for RecordingMetrics {
    fn gauge(&self, name: &'static str, value: f64) {
        self.gauges
            .lock()
            .expect("metrics lock poisoned")
            .entry(name)
            .or_default()
            .push(value);
    }

    fn counter(&self, name: &'static str, value: u64) {
        *self
            .counters
            .lock()
            .expect("metrics lock poisoned")
            .entry(name)
            .or_default() += value;
    }
}

/// Wall-clock timer for one worker iteration.
#[derive(Debug)]
pub struct StepTimer {
    started: Instant,
}

impl StepTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1e3
    }
}
