//! Metrics collection for InferLoop
//!
//! This module provides Prometheus metrics for observability.
//! Metrics are grouped by the component that records them.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for InferLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub tasks: TaskMetrics,
    pub models: ModelMetrics,
    pub batching: BatchMetrics,
}

/// Task lifecycle metrics
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    /// Total number of submitted tasks
    pub submitted_total: IntCounter,

    /// Total number of tasks that reached Success
    pub succeeded_total: IntCounter,

    /// Total number of tasks that reached Failure, by error kind
    pub failed_total: IntCounterVec,

    /// Submissions rejected by backpressure
    pub rejected_total: IntCounter,

    /// Tasks currently executing
    pub active: IntGauge,

    /// Tasks waiting for a worker
    pub queue_depth: IntGauge,

    /// Execution duration (Running to terminal)
    pub duration: Histogram,
}

/// Model registry metrics
#[derive(Debug, Clone)]
pub struct ModelMetrics {
    /// Successful model loads
    pub loads_total: IntCounter,

    /// Failed model loads
    pub load_failures_total: IntCounter,

    /// Model load duration
    pub load_duration: Histogram,

    /// Time spent waiting for the load lock
    pub lock_wait: Histogram,

    /// Models held in the process cache
    pub cached: IntGauge,
}

/// Dynamic batching metrics
#[derive(Debug, Clone)]
pub struct BatchMetrics {
    /// Batches flushed to the engine
    pub flushes_total: IntCounter,

    /// Prompts parked waiting for peers
    pub parked_total: IntCounter,

    /// Single-prompt inferences that bypassed batching
    pub direct_total: IntCounter,

    /// Flushed batch size distribution
    pub batch_size: Histogram,

    /// Batched inference duration
    pub inference_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let metric = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("histogram registered once");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let tasks = TaskMetrics {
            submitted_total: counter(&registry, "inferloop_tasks_submitted_total", "Total number of submitted tasks"),
            succeeded_total: counter(&registry, "inferloop_tasks_succeeded_total", "Total number of successful tasks"),
            failed_total: counter_vec(
                &registry,
                "inferloop_tasks_failed_total",
                "Total number of failed tasks",
                &["kind"],
            ),
            rejected_total: counter(&registry, "inferloop_tasks_rejected_total", "Submissions rejected because the work queue was full"),
            active: gauge(&registry, "inferloop_tasks_active", "Tasks currently executing"),
            queue_depth: gauge(&registry, "inferloop_task_queue_depth", "Tasks waiting for a worker"),
            duration: histogram(
                &registry,
                "inferloop_task_duration_seconds",
                "Task execution duration in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
            ),
        };

        let models = ModelMetrics {
            loads_total: counter(&registry, "inferloop_model_loads_total", "Total number of model loads"),
            load_failures_total: counter(&registry, "inferloop_model_load_failures_total", "Total number of failed model loads"),
            load_duration: histogram(
                &registry,
                "inferloop_model_load_duration_seconds",
                "Model load duration in seconds",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0],
            ),
            lock_wait: histogram(
                &registry,
                "inferloop_model_lock_wait_seconds",
                "Time spent waiting for a model load lock",
                vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0],
            ),
            cached: gauge(&registry, "inferloop_models_cached", "Models held in the process cache"),
        };

        let batching = BatchMetrics {
            flushes_total: counter(&registry, "inferloop_batch_flushes_total", "Total number of flushed batches"),
            parked_total: counter(&registry, "inferloop_batch_parked_total", "Prompts parked waiting for peers"),
            direct_total: counter(&registry, "inferloop_batch_direct_total", "Prompts that bypassed batching"),
            batch_size: histogram(
                &registry,
                "inferloop_batch_size",
                "Flushed batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0],
            ),
            inference_duration: histogram(
                &registry,
                "inferloop_batch_inference_duration_seconds",
                "Batched inference duration in seconds",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            ),
        };

        MetricsRegistry {
            registry,
            tasks,
            models,
            batching,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}\n", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}
