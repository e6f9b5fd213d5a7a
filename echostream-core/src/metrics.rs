//! Minimal metric primitives used by the input pipeline.
//!
//! The surrounding runtime owns metric registration and reporting; the
//! replay core only needs cheap shared counters and gauges it can bump on
//! the hot path.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap;

/// Cloneable shared counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    count: Arc<AtomicU64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Last-emitted watermark timestamp, readable from the metrics reporter.
#[derive(Debug, Clone)]
pub struct WatermarkGauge {
    current: Arc<AtomicI64>,
}

impl Default for WatermarkGauge {
    fn default() -> Self {
        Self {
            current: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }
}

impl WatermarkGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, timestamp: i64) {
        self.current.store(timestamp, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }
}

/// Pull-style gauge backed by a closure.
#[derive(Clone)]
pub struct Gauge {
    read: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Gauge {
    pub fn new<F: Fn() -> i64 + Send + Sync + 'static>(read: F) -> Self {
        Self {
            read: Arc::new(read),
        }
    }

    pub fn value(&self) -> i64 {
        (self.read)()
    }
}

impl std::fmt::Debug for Gauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gauge").field("value", &self.value()).finish()
    }
}

/// Metrics owned by one operator instance.
#[derive(Debug, Clone, Default)]
pub struct OperatorMetricGroup {
    pub num_records_in: Counter,
    pub num_records_out: Counter,
}

impl OperatorMetricGroup {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Task-level IO metrics; gauges are registered by name.
#[derive(Default)]
pub struct TaskIoMetricGroup {
    gauges: Mutex<AHashMap<&'static str, Gauge>>,
}

impl TaskIoMetricGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_gauge(&self, name: &'static str, gauge: Gauge) {
        self.gauges.lock().expect("metric lock").insert(name, gauge);
    }

    pub fn gauge(&self, name: &str) -> Option<Gauge> {
        self.gauges.lock().expect("metric lock").get(name).cloned()
    }
}
