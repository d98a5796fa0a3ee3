// Centralized Observability Infrastructure
// Structured logging, trace-id propagation, and lightweight metrics for the
// retrieval engine, the API surface, and the worker runtime.

use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for metrics
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static RETRIEVAL_COUNTER: AtomicU64 = AtomicU64::new(0);
static JOB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure.
/// This should be called once at application startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("ragdb=debug,info")
    } else {
        EnvFilter::new("ragdb=info,warn")
    };

    // Quiet flag takes precedence over RUST_LOG.
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("ragdb observability initialized");
            }
            Ok(())
        }
        Err(_) => {
            // Already initialized, which is fine in test environments
            Ok(())
        }
    }
}

/// Operation kinds for structured logging across the engine. Each variant
/// is emitted from exactly one site: the processor, the retriever, the
/// orchestrator, or the worker.
#[derive(Debug, Clone)]
pub enum Operation {
    // Ingestion plane
    DocumentProcess { doc_id: i64, chunk_count: usize },

    // Query plane
    Retrieve { query: String, result_count: usize },
    Generate { model: String, output_tokens: u64 },

    // Job plane
    JobDispatch { function: String, job_id: Uuid },
    JobComplete { function: String, job_id: Uuid },
    JobRetry { function: String, attempt: u32 },

    // System
    Startup { version: String },
    Reconcile { rows_failed: usize },
}

/// Metric types for performance monitoring
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter { name: &'static str, value: u64 },
    Gauge { name: &'static str, value: f64 },
    Timer { name: &'static str, duration: Duration },
}

/// Operation context for tracing through the system
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub operation: String,
    pub start_time: Instant,
    pub attributes: Vec<(String, String)>,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            operation: operation.into(),
            start_time: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((key.into(), value.into()));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log an operation with full context
pub fn log_operation(ctx: &OperationContext, op: &Operation, result: &Result<()>) {
    let elapsed = ctx.elapsed();
    let attrs = ctx
        .attributes
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ");

    match result {
        Ok(()) => {
            info!(
                trace_id = %ctx.trace_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis() as u64,
                attributes = %attrs,
                "Operation completed: {:?}", op
            );
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis() as u64,
                attributes = %attrs,
                error = %e,
                "Operation failed: {:?}", op
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }

    match op {
        Operation::Retrieve { .. } => {
            RETRIEVAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::JobDispatch { .. } | Operation::JobComplete { .. } => {
            JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

/// Record a metric
pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => debug!("metric.counter {} = {}", name, value),
        MetricType::Gauge { name, value } => debug!("metric.gauge {} = {}", name, value),
        MetricType::Timer { name, duration } => debug!("metric.timer {} = {:?}", name, duration),
    }
}

/// Execute a future with a trace context, logging start/finish and timing.
pub async fn with_trace_id<F, T>(operation: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let ctx = OperationContext::new(operation);
    let trace_id = ctx.trace_id;

    debug!(trace_id = %trace_id, "Starting operation: {}", operation);

    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    match &result {
        Ok(_) => {
            info!(
                trace_id = %trace_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Operation completed: {}", operation
            );
            record_metric(MetricType::Timer {
                name: "operation.duration",
                duration: elapsed,
            });
        }
        Err(e) => {
            error!(
                trace_id = %trace_id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %e,
                "Operation failed: {}", operation
            );
            record_metric(MetricType::Counter {
                name: "operation.errors",
                value: 1,
            });
        }
    }

    result
}

/// Get current metrics snapshot
pub fn get_metrics() -> serde_json::Value {
    serde_json::json!({
        "operations": {
            "total": OPERATION_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
            "retrievals": RETRIEVAL_COUNTER.load(Ordering::Relaxed),
            "jobs": JOB_COUNTER.load(Ordering::Relaxed),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_context_creation() {
        let mut ctx = OperationContext::new("hybrid_retrieve");
        assert_eq!(ctx.operation, "hybrid_retrieve");
        ctx.add_attribute("kb_ids", "1,2");
        assert_eq!(ctx.attributes.len(), 1);
    }

    #[tokio::test]
    async fn test_with_trace_id() {
        let result = with_trace_id("test_async_op", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, anyhow::Error>(42)
        })
        .await;

        assert_eq!(result.expect("operation should succeed"), 42);
    }

    #[test]
    fn test_metrics_snapshot() {
        record_metric(MetricType::Counter {
            name: "test.counter",
            value: 1,
        });
        let metrics = get_metrics();
        assert!(metrics["timestamp"].is_string());
        assert!(metrics["operations"].is_object());
    }

    #[test]
    fn test_log_operation_advances_counters() {
        let ctx = OperationContext::new("hybrid_retrieve");
        log_operation(
            &ctx,
            &Operation::Retrieve {
                query: "3306".into(),
                result_count: 1,
            },
            &Ok(()),
        );
        let after = get_metrics();
        assert!(after["operations"]["retrievals"].as_u64().unwrap() >= 1);
        assert!(after["operations"]["total"].as_u64().unwrap() >= 1);

        log_operation(
            &ctx,
            &Operation::JobDispatch {
                function: "process_document".into(),
                job_id: Uuid::new_v4(),
            },
            &Ok(()),
        );
        assert!(get_metrics()["operations"]["jobs"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn test_logging_level_configurations() {
        for filter_str in ["error", "ragdb=debug,info", "ragdb=info,warn"] {
            assert!(EnvFilter::try_new(filter_str).is_ok());
        }
    }
}
