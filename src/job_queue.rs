// Durable Job Queue
// Named queues persisted as one JSON file per job under the queue directory.
// Delivery is at-least-once: dequeue takes a visibility lease, and a job
// neither acked nor retried before the lease expires becomes eligible again.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::contracts::{JobQueue, JobRecord};

/// Per-function retry policy and timeout.
#[derive(Debug, Clone, Copy)]
pub struct JobSpec {
    pub function: &'static str,
    pub max_tries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

/// The function table: every background job the worker knows how to run.
pub const JOB_SPECS: &[JobSpec] = &[
    JobSpec {
        function: "process_document",
        max_tries: 3,
        retry_delay: Duration::from_secs(5),
        timeout: Duration::from_secs(600),
    },
    JobSpec {
        function: "delete_knowledge",
        max_tries: 3,
        retry_delay: Duration::from_secs(2),
        timeout: Duration::from_secs(300),
    },
    JobSpec {
        function: "generate_testset",
        max_tries: 3,
        retry_delay: Duration::from_secs(10),
        timeout: Duration::from_secs(1800),
    },
    JobSpec {
        function: "run_experiment",
        max_tries: 3,
        retry_delay: Duration::from_secs(10),
        timeout: Duration::from_secs(1800),
    },
];

pub fn job_spec(function: &str) -> Option<&'static JobSpec> {
    JOB_SPECS.iter().find(|s| s.function == function)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredJob {
    record: JobRecord,
    leased_until: Option<DateTime<Utc>>,
}

/// File-backed queue implementation.
pub struct FileJobQueue {
    root: PathBuf,
    /// queue name -> job id -> job
    state: Mutex<HashMap<String, HashMap<Uuid, StoredJob>>>,
}

impl FileJobQueue {
    /// Open the queue root, loading any jobs left over from a prior process.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create queue root: {}", root.display()))?;

        let mut state: HashMap<String, HashMap<Uuid, StoredJob>> = HashMap::new();
        let mut dirs = tokio::fs::read_dir(&root).await?;
        while let Some(dir_entry) = dirs.next_entry().await? {
            if !dir_entry.file_type().await?.is_dir() {
                continue;
            }
            let queue_name = dir_entry.file_name().to_string_lossy().to_string();
            let mut jobs = HashMap::new();

            let mut files = tokio::fs::read_dir(dir_entry.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                match tokio::fs::read(&path).await {
                    Ok(bytes) => match serde_json::from_slice::<StoredJob>(&bytes) {
                        Ok(job) => {
                            jobs.insert(job.record.id, job);
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "Skipping unreadable job file")
                        }
                    },
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable job file")
                    }
                }
            }
            if !jobs.is_empty() {
                debug!(queue = %queue_name, count = jobs.len(), "Recovered persisted jobs");
            }
            state.insert(queue_name, jobs);
        }

        Ok(Self {
            root,
            state: Mutex::new(state),
        })
    }

    fn job_path(&self, queue: &str, job_id: Uuid) -> PathBuf {
        self.root.join(queue).join(format!("{job_id}.json"))
    }

    async fn persist(&self, queue: &str, job: &StoredJob) -> Result<()> {
        let dir = self.root.join(queue);
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.job_path(queue, job.record.id);
        let bytes = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to persist job: {}", path.display()))
    }

    async fn unlink(&self, queue: &str, job_id: Uuid) -> Result<()> {
        let path = self.job_path(queue, job_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove job: {}", path.display())),
        }
    }
}

#[async_trait]
impl JobQueue for FileJobQueue {
    async fn enqueue(
        &self,
        queue: &str,
        function: &str,
        args: serde_json::Value,
        max_tries: u32,
    ) -> Result<Uuid> {
        let now = Utc::now();
        let record = JobRecord {
            id: Uuid::new_v4(),
            function: function.to_string(),
            args,
            queue: queue.to_string(),
            enqueued_at: now,
            available_at: now,
            attempt: 0,
            max_tries,
        };
        let job = StoredJob {
            record,
            leased_until: None,
        };

        // Persist before exposing the job so a crash between the two cannot
        // lose an acknowledged enqueue.
        self.persist(queue, &job).await?;

        let job_id = job.record.id;
        let mut state = self.state.lock().await;
        state
            .entry(queue.to_string())
            .or_default()
            .insert(job_id, job);

        debug!(queue, function, %job_id, "Job enqueued");
        Ok(job_id)
    }

    async fn dequeue(&self, queue: &str, visibility: Duration) -> Result<Option<JobRecord>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(jobs) = state.get_mut(queue) else {
            return Ok(None);
        };

        // Oldest eligible job first: available, and not under a live lease.
        let candidate = jobs
            .values()
            .filter(|j| j.record.available_at <= now)
            .filter(|j| j.leased_until.map(|t| t <= now).unwrap_or(true))
            .min_by_key(|j| j.record.enqueued_at)
            .map(|j| j.record.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let job = jobs.get_mut(&job_id).expect("candidate exists");
        job.record.attempt += 1;
        job.leased_until = Some(
            now + ChronoDuration::from_std(visibility).unwrap_or_else(|_| ChronoDuration::seconds(600)),
        );
        let snapshot = job.clone();
        drop(state);

        self.persist(queue, &snapshot).await?;
        Ok(Some(snapshot.record))
    }

    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let removed = state
            .get_mut(queue)
            .and_then(|jobs| jobs.remove(&job_id))
            .is_some();
        drop(state);

        if !removed {
            return Err(anyhow!("Unknown job {job_id} on queue {queue}"));
        }
        self.unlink(queue, job_id).await
    }

    async fn nack_retry(&self, queue: &str, job_id: Uuid, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let job = state
            .get_mut(queue)
            .and_then(|jobs| jobs.get_mut(&job_id))
            .ok_or_else(|| anyhow!("Unknown job {job_id} on queue {queue}"))?;

        job.leased_until = None;
        job.record.available_at =
            Utc::now() + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(5));
        let snapshot = job.clone();
        drop(state);

        self.persist(queue, &snapshot).await
    }
}

/// Production factory for the job queue.
pub async fn create_job_queue(root: impl AsRef<Path>) -> Result<Arc<dyn JobQueue>> {
    Ok(Arc::new(FileJobQueue::open(root).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_function_table() {
        let spec = job_spec("process_document").unwrap();
        assert_eq!(spec.max_tries, 3);
        assert_eq!(spec.retry_delay, Duration::from_secs(5));
        assert_eq!(spec.timeout, Duration::from_secs(600));

        assert_eq!(
            job_spec("delete_knowledge").unwrap().timeout,
            Duration::from_secs(300)
        );
        assert!(job_spec("no_such_function").is_none());
    }

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() -> Result<()> {
        let dir = TempDir::new()?;
        let queue = FileJobQueue::open(dir.path()).await?;

        let id = queue
            .enqueue("default", "process_document", json!({"doc_id": 7}), 3)
            .await?;

        let job = queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .expect("job available");
        assert_eq!(job.id, id);
        assert_eq!(job.function, "process_document");
        assert_eq!(job.attempt, 1);
        assert_eq!(job.args["doc_id"], 7);

        // Leased: not visible to a second consumer.
        assert!(queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .is_none());

        queue.ack("default", id).await?;
        assert!(queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_retry_with_delay() -> Result<()> {
        let dir = TempDir::new()?;
        let queue = FileJobQueue::open(dir.path()).await?;

        let id = queue
            .enqueue("default", "process_document", json!({"doc_id": 1}), 3)
            .await?;
        let job = queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .unwrap();
        assert_eq!(job.attempt, 1);

        queue
            .nack_retry("default", id, Duration::from_millis(20))
            .await?;
        // Not yet available.
        assert!(queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let retried = queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .unwrap();
        assert_eq!(retried.id, id);
        assert_eq!(retried.attempt, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_lease_expiry_redelivers() -> Result<()> {
        let dir = TempDir::new()?;
        let queue = FileJobQueue::open(dir.path()).await?;

        queue
            .enqueue("default", "process_document", json!({"doc_id": 2}), 3)
            .await?;
        let first = queue
            .dequeue("default", Duration::from_millis(20))
            .await?
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .expect("lease expired, job redelivered");
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempt, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_queues_are_isolated() -> Result<()> {
        let dir = TempDir::new()?;
        let queue = FileJobQueue::open(dir.path()).await?;

        queue
            .enqueue("docling", "process_document", json!({"doc_id": 3}), 3)
            .await?;

        assert!(queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .is_none());
        assert!(queue
            .dequeue("docling", Duration::from_secs(60))
            .await?
            .is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_jobs_survive_reopen() -> Result<()> {
        let dir = TempDir::new()?;
        let id = {
            let queue = FileJobQueue::open(dir.path()).await?;
            queue
                .enqueue("default", "delete_knowledge", json!({"knowledge_id": 4}), 3)
                .await?
        };

        let reopened = FileJobQueue::open(dir.path()).await?;
        let job = reopened
            .dequeue("default", Duration::from_secs(60))
            .await?
            .expect("persisted job survives restart");
        assert_eq!(job.id, id);
        assert_eq!(job.function, "delete_knowledge");
        Ok(())
    }

    #[tokio::test]
    async fn test_fifo_order() -> Result<()> {
        let dir = TempDir::new()?;
        let queue = FileJobQueue::open(dir.path()).await?;

        let first = queue
            .enqueue("default", "process_document", json!({"doc_id": 1}), 3)
            .await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue
            .enqueue("default", "process_document", json!({"doc_id": 2}), 3)
            .await?;

        let job = queue
            .dequeue("default", Duration::from_secs(60))
            .await?
            .unwrap();
        assert_eq!(job.id, first);
        Ok(())
    }
}
