//! Execution statistics for the IVM engine (feature: `metrics`).
//!
//! The engine counts graph runs, emitted result batches, and live-query
//! compilations in process-wide counters. A [`MetricsCollector`] snapshots
//! the built-in counters — and any custom [`Metric`]s registered with it —
//! into JSON for printing or assertion in tests.

use serde_json::{json, Value};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Trait for custom metrics.
pub trait Metric: Send + Sync + Any {
    /// The metric's name (e.g. `graph_runs`).
    fn name(&self) -> &str;

    /// The current value as JSON.
    fn value(&self) -> Value;

    /// Optional description of what this metric measures.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Cast to `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// Built-in engine counters.
#[derive(Default)]
pub struct EngineCounters {
    graph_runs: AtomicU64,
    result_batches: AtomicU64,
    compilations: AtomicU64,
}

impl EngineCounters {
    pub fn record_graph_run(&self) {
        self.graph_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_batch(&self) {
        self.result_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compilation(&self) {
        self.compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn graph_runs(&self) -> u64 {
        self.graph_runs.load(Ordering::Relaxed)
    }

    pub fn result_batches(&self) -> u64 {
        self.result_batches.load(Ordering::Relaxed)
    }

    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }
}

static COUNTERS: OnceLock<EngineCounters> = OnceLock::new();

/// The process-wide engine counters.
pub fn counters() -> &'static EngineCounters {
    COUNTERS.get_or_init(EngineCounters::default)
}

/// Collects built-in and custom metrics into a JSON report.
#[derive(Default)]
pub struct MetricsCollector {
    custom: Vec<Box<dyn Metric>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom metric alongside the built-ins.
    pub fn register(&mut self, metric: Box<dyn Metric>) {
        self.custom.push(metric);
    }

    /// Snapshot all metrics as a JSON object.
    pub fn report(&self) -> Value {
        let counters = counters();
        let mut map = serde_json::Map::new();
        map.insert("graph_runs".to_string(), json!(counters.graph_runs()));
        map.insert("result_batches".to_string(), json!(counters.result_batches()));
        map.insert("compilations".to_string(), json!(counters.compilations()));
        for metric in &self.custom {
            map.insert(metric.name().to_string(), metric.value());
        }
        Value::Object(map)
    }

    /// Print the report to stdout.
    pub fn print(&self) {
        match serde_json::to_string_pretty(&self.report()) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{}", self.report()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl Metric for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn value(&self) -> Value {
            json!(self.0)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn report_includes_builtins_and_custom() {
        let before = counters().graph_runs();
        counters().record_graph_run();
        assert_eq!(counters().graph_runs(), before + 1);

        let mut collector = MetricsCollector::new();
        collector.register(Box::new(Fixed(42)));
        let report = collector.report();
        assert!(report.get("graph_runs").is_some());
        assert_eq!(report["fixed"], json!(42));
    }
}
