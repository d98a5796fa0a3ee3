// Worker Runtime
// Consumes the job queues and dispatches to the document processor, the
// knowledge-base delete cascade, and the evaluation pipeline. Before
// accepting any job the worker reconciles rows stranded in transient states
// by a crashed predecessor.

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_QUEUE, DOCLING_QUEUE};
use crate::contracts::{BlobStore, DualIndex, IndexFilter, JobQueue, JobRecord, MetadataStore};
use crate::errors::RagError;
use crate::evaluation::EvaluationPipeline;
use crate::job_queue::{job_spec, JobSpec};
use crate::loader::{classify, FileClass};
use crate::models::KnowledgeStatus;
use crate::observability::{log_operation, Operation, OperationContext};
use crate::processor::{delete_document, DocumentProcessor};
use crate::types::index_name_for;

/// Extra lease time past the per-function timeout, so the supervisor always
/// fires before the queue re-delivers.
const LEASE_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Enqueue helpers used by the API surface
// ---------------------------------------------------------------------------

/// Route a `process_document` job: structure-aware formats go to the
/// docling queue (its workers carry the heavy parser), everything else to
/// the default queue.
pub fn queue_for_file(filename: &str) -> &'static str {
    match classify(filename) {
        FileClass::Structured => DOCLING_QUEUE,
        _ => DEFAULT_QUEUE,
    }
}

pub async fn enqueue_process_document(
    queue: &Arc<dyn JobQueue>,
    filename: &str,
    doc_id: i64,
) -> Result<Uuid> {
    let spec = job_spec("process_document").expect("registered function");
    queue
        .enqueue(
            queue_for_file(filename),
            "process_document",
            json!({ "doc_id": doc_id }),
            spec.max_tries,
        )
        .await
        .map_err(|e| RagError::QueueUnavailable(format!("{e:#}")).into())
}

pub async fn enqueue_delete_knowledge(
    queue: &Arc<dyn JobQueue>,
    knowledge_id: i64,
) -> Result<Uuid> {
    let spec = job_spec("delete_knowledge").expect("registered function");
    queue
        .enqueue(
            DEFAULT_QUEUE,
            "delete_knowledge",
            json!({ "knowledge_id": knowledge_id }),
            spec.max_tries,
        )
        .await
        .map_err(|e| RagError::QueueUnavailable(format!("{e:#}")).into())
}

pub async fn enqueue_generate_testset(
    queue: &Arc<dyn JobQueue>,
    testset_id: i64,
    source_doc_ids: &[i64],
    size: usize,
    generator_model: &str,
) -> Result<Uuid> {
    let spec = job_spec("generate_testset").expect("registered function");
    queue
        .enqueue(
            DEFAULT_QUEUE,
            "generate_testset",
            json!({
                "testset_id": testset_id,
                "source_doc_ids": source_doc_ids,
                "size": size,
                "generator_model": generator_model,
            }),
            spec.max_tries,
        )
        .await
        .map_err(|e| RagError::QueueUnavailable(format!("{e:#}")).into())
}

pub async fn enqueue_run_experiment(
    queue: &Arc<dyn JobQueue>,
    experiment_id: i64,
) -> Result<Uuid> {
    let spec = job_spec("run_experiment").expect("registered function");
    queue
        .enqueue(
            DEFAULT_QUEUE,
            "run_experiment",
            json!({ "experiment_id": experiment_id }),
            spec.max_tries,
        )
        .await
        .map_err(|e| RagError::QueueUnavailable(format!("{e:#}")).into())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct WorkerRuntime {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn DualIndex>,
    processor: Arc<DocumentProcessor>,
    evaluation: Arc<EvaluationPipeline>,
    /// Queues this worker consumes, in polling order.
    queues: Vec<String>,
    poll_interval: Duration,
}

impl WorkerRuntime {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn DualIndex>,
        processor: Arc<DocumentProcessor>,
        evaluation: Arc<EvaluationPipeline>,
    ) -> Self {
        Self {
            queue,
            store,
            blobs,
            index,
            processor,
            evaluation,
            queues: vec![DEFAULT_QUEUE.to_string(), DOCLING_QUEUE.to_string()],
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        self.queues = queues;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reset rows stranded in transient states by a crashed worker. Runs
    /// before the first dequeue so the UI never shows a job as live that no
    /// process is running.
    pub async fn reconcile_interrupted(&self) -> Result<()> {
        let ctx = OperationContext::new("reconcile_interrupted");
        let report = self.store.reset_interrupted().await?;
        if report.total() > 0 {
            warn!(
                documents = report.documents,
                testsets = report.testsets,
                experiments = report.experiments,
                knowledges = report.knowledges,
                "Reconciled interrupted rows from a previous run"
            );
        }
        log_operation(
            &ctx,
            &Operation::Reconcile {
                rows_failed: report.total(),
            },
            &Ok(()),
        );
        Ok(())
    }

    /// Run forever: reconcile once, then poll the queues one job at a time.
    /// The pipelines are memory-heavy, so a worker process runs a single
    /// job; the fleet scales by adding workers.
    #[instrument(skip_all)]
    pub async fn run(&self) -> Result<()> {
        let ctx = OperationContext::new("worker_startup");
        self.reconcile_interrupted().await?;
        log_operation(
            &ctx,
            &Operation::Startup {
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            &Ok(()),
        );
        info!(queues = ?self.queues, "Worker accepting jobs");

        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Try each queue once; returns whether a job was handled.
    pub async fn tick(&self) -> Result<bool> {
        for queue_name in &self.queues {
            // Lease long enough for the slowest registered function.
            let lease = longest_timeout() + LEASE_GRACE;
            if let Some(job) = self.queue.dequeue(queue_name, lease).await? {
                self.handle(queue_name, job).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle(&self, queue_name: &str, job: JobRecord) -> Result<()> {
        let Some(spec) = job_spec(&job.function) else {
            warn!(function = %job.function, job_id = %job.id, "Unknown job function, dropping");
            return self.queue.ack(queue_name, job.id).await;
        };

        let mut ctx = OperationContext::new("job_dispatch");
        ctx.add_attribute("queue", queue_name);
        ctx.add_attribute("attempt", job.attempt.to_string());
        log_operation(
            &ctx,
            &Operation::JobDispatch {
                function: job.function.clone(),
                job_id: job.id,
            },
            &Ok(()),
        );

        let outcome = tokio::time::timeout(spec.timeout, self.dispatch(&job)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "job timed out after {}s",
                spec.timeout.as_secs()
            )),
        };

        match result {
            Ok(()) => {
                log_operation(
                    &ctx,
                    &Operation::JobComplete {
                        function: job.function.clone(),
                        job_id: job.id,
                    },
                    &Ok(()),
                );
                self.queue.ack(queue_name, job.id).await
            }
            Err(e) if job.attempt < job.max_tries => {
                warn!(
                    function = %job.function,
                    job_id = %job.id,
                    attempt = job.attempt,
                    error = %format!("{e:#}"),
                    "Job failed, scheduling retry"
                );
                log_operation(
                    &ctx,
                    &Operation::JobRetry {
                        function: job.function.clone(),
                        attempt: job.attempt,
                    },
                    &Ok(()),
                );
                self.queue
                    .nack_retry(queue_name, job.id, spec.retry_delay)
                    .await
            }
            Err(e) => {
                log_operation(
                    &ctx,
                    &Operation::JobComplete {
                        function: job.function.clone(),
                        job_id: job.id,
                    },
                    &Err(anyhow!("{e:#}")),
                );
                self.mark_terminal_failure(&job, &e).await;
                self.queue.ack(queue_name, job.id).await
            }
        }
    }

    async fn dispatch(&self, job: &JobRecord) -> Result<()> {
        match job.function.as_str() {
            "process_document" => {
                let doc_id = arg_i64(&job.args, "doc_id")?;
                self.processor.process(doc_id).await
            }
            "delete_knowledge" => {
                let knowledge_id = arg_i64(&job.args, "knowledge_id")?;
                self.delete_knowledge(knowledge_id).await
            }
            "generate_testset" => {
                let testset_id = arg_i64(&job.args, "testset_id")?;
                let source_doc_ids: Vec<i64> = job
                    .args
                    .get("source_doc_ids")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let size = job
                    .args
                    .get("size")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(10) as usize;
                let generator_model = job
                    .args
                    .get("generator_model")
                    .and_then(|v| v.as_str())
                    .unwrap_or("qwen-max")
                    .to_string();
                self.evaluation
                    .generate_testset(testset_id, &source_doc_ids, size, &generator_model)
                    .await
            }
            "run_experiment" => {
                let experiment_id = arg_i64(&job.args, "experiment_id")?;
                self.evaluation.run_experiment(experiment_id).await
            }
            other => bail!("unregistered job function: {other}"),
        }
    }

    /// Delete a knowledge base and everything it owns, in dependency order:
    /// every document under the atomic-delete rule, then experiments, then
    /// the row, then the logical index.
    async fn delete_knowledge(&self, knowledge_id: i64) -> Result<()> {
        let knowledge = self
            .store
            .get_knowledge(knowledge_id)
            .await?
            .ok_or_else(|| anyhow!("knowledge base {knowledge_id} not found"))?;
        if knowledge.status != KnowledgeStatus::Deleting {
            warn!(
                knowledge_id,
                status = ?knowledge.status,
                "Knowledge base not in DELETING state, proceeding anyway"
            );
        }

        for doc in self.store.list_documents(knowledge_id).await? {
            delete_document(&self.store, &self.blobs, &self.index, doc.id).await?;
        }

        let experiments = self
            .store
            .delete_experiments_by_knowledge(knowledge_id)
            .await?;
        if !experiments.is_empty() {
            info!(knowledge_id, count = experiments.len(), "Deleted experiments");
        }

        self.store.delete_knowledge_row(knowledge_id).await?;
        self.index
            .drop_index(&index_name_for(knowledge_id))
            .await?;

        info!(knowledge_id, "Knowledge base deleted");
        Ok(())
    }

    /// After the last retry, make sure the owning row reflects the failure.
    /// Most handlers already did; the delete cascade leaves the knowledge
    /// base in DELETING, which would otherwise look live forever.
    async fn mark_terminal_failure(&self, job: &JobRecord, _error: &anyhow::Error) {
        if job.function == "delete_knowledge" {
            if let Ok(knowledge_id) = arg_i64(&job.args, "knowledge_id") {
                if let Err(e) = self
                    .store
                    .set_knowledge_status(knowledge_id, KnowledgeStatus::Failed)
                    .await
                {
                    error!(knowledge_id, error = %e, "Failed to mark knowledge base FAILED");
                }
            }
        }
    }
}

fn longest_timeout() -> Duration {
    crate::job_queue::JOB_SPECS
        .iter()
        .map(|s: &JobSpec| s.timeout)
        .max()
        .unwrap_or(Duration::from_secs(600))
}

fn arg_i64(args: &serde_json::Value, key: &str) -> Result<i64> {
    args.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow!("job args missing {key}"))
}
