// Adapter Contracts
// Trait definitions for the five pluggable adapters: blob store, metadata
// store, dual index, job queue, and quota ledger. Components depend on these
// traits only; concrete backends are wired in at process init.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    ChatSession, ChunkRow, Document, Experiment, Knowledge, KnowledgeStatus, Membership, Message,
    MessageSource, MetricScores, Role, Testset, TokenUsage, User,
};
use crate::types::UtcDay;

// ---------------------------------------------------------------------------
// C1: Blob store
// ---------------------------------------------------------------------------

/// Content-addressed object storage for original files and generated
/// artifacts.
///
/// # Contract
/// - Object paths are opaque keys chosen by the caller; `put` to an existing
///   path overwrites (callers guarantee uniqueness via
///   [`upload_object_path`]).
/// - `get` of a missing path is an error, `delete` of a missing path is not.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Blob path for an uploaded document: `{kb_id}/{uuid}_{filename}`.
///
/// The embedded UUID guarantees two uploads of the same filename to the same
/// knowledge base never collide, so a blob path is never reused.
pub fn upload_object_path(knowledge_id: i64, filename: &str) -> String {
    format!("{knowledge_id}/{}_{filename}", Uuid::new_v4())
}

/// Blob path for a generated test-set CSV.
pub fn testset_object_path(testset_id: i64) -> String {
    format!("testsets/{testset_id}.csv")
}

// ---------------------------------------------------------------------------
// C3: Dual index
// ---------------------------------------------------------------------------

/// Metadata carried by every index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: i64,
    pub knowledge_id: i64,
    /// Original filename the chunk came from.
    pub source: String,
    pub page_number: Option<u32>,
    pub chunk_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_content: Option<String>,
    /// Populated by the reranker when a cross-encoder pass ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// One entry to write into a logical index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// One search hit returned from a logical index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHit {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: ChunkMetadata,
}

/// Filter terms for deletes and tenant-scoped searches.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexFilter {
    DocId(i64),
    KnowledgeId(i64),
    /// Tenant filter: entry's knowledge_id must be one of these.
    KnowledgeIds(Vec<i64>),
}

impl IndexFilter {
    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        match self {
            IndexFilter::DocId(id) => metadata.doc_id == *id,
            IndexFilter::KnowledgeId(id) => metadata.knowledge_id == *id,
            IndexFilter::KnowledgeIds(ids) => ids.contains(&metadata.knowledge_id),
        }
    }
}

/// One logical index per knowledge base, exposing dense-kNN and BM25 views
/// over the same entries.
///
/// # Contract
/// - `ensure_index` is idempotent.
/// - `bulk_upsert` is all-or-nothing per batch and returns generated entry
///   ids in input order.
/// - Search operations accept several logical indices and merge by score,
///   never returning an entry whose metadata fails the filter.
#[async_trait]
pub trait DualIndex: Send + Sync {
    async fn ensure_index(&self, name: &str, dim: usize) -> Result<()>;

    async fn bulk_upsert(&self, name: &str, entries: Vec<IndexEntry>) -> Result<Vec<String>>;

    async fn delete_by_filter(&self, name: &str, filter: &IndexFilter) -> Result<usize>;

    async fn drop_index(&self, name: &str) -> Result<()>;

    /// Top-k entries by cosine similarity to `vector`.
    async fn knn(
        &self,
        names: &[String],
        vector: &[f32],
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>>;

    /// Top-k entries by BM25 lexical score for `query`.
    async fn bm25(
        &self,
        names: &[String],
        query: &str,
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>>;
}

// ---------------------------------------------------------------------------
// C4: Job queue
// ---------------------------------------------------------------------------

/// A queued unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub function: String,
    pub args: serde_json::Value,
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
    /// Not eligible for dequeue before this instant (retry delays).
    pub available_at: DateTime<Utc>,
    /// 1-based attempt number of the current lease.
    pub attempt: u32,
    pub max_tries: u32,
}

/// Durable, named queues with at-least-once delivery.
///
/// # Contract
/// - Jobs survive process restarts.
/// - `dequeue` leases a job for `visibility`; a job neither acked nor
///   retried within its lease becomes eligible again (attempt preserved).
/// - `ack` removes the job permanently; `nack_retry` re-queues it after a
///   delay with the attempt counter advanced.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        function: &str,
        args: serde_json::Value,
        max_tries: u32,
    ) -> Result<Uuid>;

    async fn dequeue(&self, queue: &str, visibility: Duration) -> Result<Option<JobRecord>>;

    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<()>;

    async fn nack_retry(&self, queue: &str, job_id: Uuid, delay: Duration) -> Result<()>;
}

// ---------------------------------------------------------------------------
// C5: Quota ledger
// ---------------------------------------------------------------------------

/// Per-user daily counters with atomic increment and midnight rollover.
///
/// Counters key on `(user_id, UTC day)` and are monotonic within a day.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Atomically increment the request counter, returning the new value.
    async fn incr_requests(&self, user_id: i64, day: UtcDay) -> Result<i64>;

    async fn read_tokens(&self, user_id: i64, day: UtcDay) -> Result<i64>;

    /// Atomically add to the token counter, returning the new value.
    async fn add_tokens(&self, user_id: i64, day: UtcDay, amount: i64) -> Result<i64>;
}

// ---------------------------------------------------------------------------
// C2: Metadata store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub hashed_password: String,
    pub full_name: Option<String>,
    pub plan: String,
    pub daily_request_cap: i64,
    pub daily_token_cap: i64,
}

#[derive(Debug, Clone)]
pub struct NewKnowledge {
    pub name: String,
    pub description: Option<String>,
    pub embed_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Default)]
pub struct KnowledgeUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub knowledge_id: i64,
    pub filename: String,
    pub blob_path: String,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewChunkRow {
    pub index_entry_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: i64,
    pub knowledge_id: i64,
    pub title: String,
    pub icon: String,
    pub top_k: usize,
}

/// Partial session update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub title: Option<String>,
    pub icon: Option<String>,
    pub top_k: Option<usize>,
    pub knowledge_ids: Option<Vec<i64>>,
}

/// The assistant half of a persisted chat turn.
#[derive(Debug, Clone)]
pub struct AssistantTurn {
    pub content: String,
    pub sources: Vec<MessageSource>,
    pub usage: TokenUsage,
    pub partial: bool,
}

/// Row counts reset by worker-startup reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub documents: usize,
    pub testsets: usize,
    pub experiments: usize,
    pub knowledges: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.documents + self.testsets + self.experiments + self.knowledges
    }
}

/// Relational persistence of users, knowledge bases, documents, chunk
/// mappings, chat, and evaluation entities.
///
/// Methods that touch several rows (`complete_document`, `append_turn`,
/// `delete_document_row`, `reset_interrupted`) are single units of work:
/// they either apply entirely or leave the store unchanged.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    // Users
    async fn create_user(&self, user: NewUser) -> Result<User>;
    async fn get_user(&self, user_id: i64) -> Result<Option<User>>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    // Knowledge bases
    async fn create_knowledge(&self, kb: NewKnowledge, owner_id: i64) -> Result<Knowledge>;
    async fn get_knowledge(&self, knowledge_id: i64) -> Result<Option<Knowledge>>;
    async fn list_knowledge_for_user(&self, user_id: i64) -> Result<Vec<Knowledge>>;
    async fn update_knowledge(
        &self,
        knowledge_id: i64,
        update: KnowledgeUpdate,
    ) -> Result<Knowledge>;
    async fn set_knowledge_status(
        &self,
        knowledge_id: i64,
        status: KnowledgeStatus,
    ) -> Result<()>;
    /// Remove the knowledge row itself. Documents and experiments must have
    /// been deleted first; the cascade is an explicit ordered procedure in
    /// the worker, never a store side effect.
    async fn delete_knowledge_row(&self, knowledge_id: i64) -> Result<()>;

    // Memberships
    async fn upsert_membership(&self, membership: Membership) -> Result<()>;
    async fn remove_membership(&self, user_id: i64, knowledge_id: i64) -> Result<()>;
    async fn get_role(&self, user_id: i64, knowledge_id: i64) -> Result<Option<Role>>;
    async fn list_members(&self, knowledge_id: i64) -> Result<Vec<Membership>>;

    // Documents
    async fn create_document(&self, doc: NewDocument) -> Result<Document>;
    async fn get_document(&self, doc_id: i64) -> Result<Option<Document>>;
    async fn list_documents(&self, knowledge_id: i64) -> Result<Vec<Document>>;
    /// Acquire-and-mark for the processor: atomically re-read the document
    /// and its knowledge base and flip status to PROCESSING. Fails when the
    /// document is not in PENDING or FAILED.
    async fn mark_document_processing(&self, doc_id: i64) -> Result<(Document, Knowledge)>;
    /// Atomically insert chunk mapping rows and flip status to COMPLETED.
    async fn complete_document(&self, doc_id: i64, chunks: Vec<NewChunkRow>) -> Result<()>;
    async fn fail_document(&self, doc_id: i64, error: &str) -> Result<()>;
    /// Atomically remove a document row and its chunk mappings.
    async fn delete_document_row(&self, doc_id: i64) -> Result<()>;
    async fn list_chunks(&self, doc_id: i64) -> Result<Vec<ChunkRow>>;
    async fn count_chunks(&self, doc_id: i64) -> Result<usize>;

    // Chat sessions
    async fn create_session(&self, session: NewSession) -> Result<ChatSession>;
    async fn get_session(&self, session_id: Uuid, user_id: i64) -> Result<Option<ChatSession>>;
    async fn list_sessions(
        &self,
        user_id: i64,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<ChatSession>>;
    async fn update_session(
        &self,
        session_id: Uuid,
        user_id: i64,
        update: SessionUpdate,
    ) -> Result<ChatSession>;
    async fn soft_delete_session(&self, session_id: Uuid, user_id: i64) -> Result<()>;
    /// Most recent `limit` messages, returned oldest-first.
    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<Message>>;
    /// Persist a full chat turn: the user message, the assistant message,
    /// the session's updated_at, and the auto-generated title when the
    /// session still carries the default one.
    async fn append_turn(
        &self,
        session_id: Uuid,
        user_content: &str,
        assistant: AssistantTurn,
    ) -> Result<()>;

    // Test sets
    async fn create_testset(&self, name: &str) -> Result<Testset>;
    async fn get_testset(&self, testset_id: i64) -> Result<Option<Testset>>;
    async fn list_testsets(&self) -> Result<Vec<Testset>>;
    async fn mark_testset_generating(&self, testset_id: i64) -> Result<()>;
    async fn complete_testset(&self, testset_id: i64, blob_path: &str) -> Result<()>;
    async fn fail_testset(&self, testset_id: i64, error: &str) -> Result<()>;
    async fn delete_testset_row(&self, testset_id: i64) -> Result<()>;

    // Experiments
    async fn create_experiment(
        &self,
        knowledge_id: i64,
        testset_id: i64,
        params: serde_json::Value,
    ) -> Result<Experiment>;
    async fn get_experiment(&self, experiment_id: i64) -> Result<Option<Experiment>>;
    async fn list_experiments(&self, knowledge_id: Option<i64>) -> Result<Vec<Experiment>>;
    async fn mark_experiment_running(&self, experiment_id: i64) -> Result<()>;
    async fn complete_experiment(
        &self,
        experiment_id: i64,
        scores: MetricScores,
    ) -> Result<()>;
    async fn fail_experiment(&self, experiment_id: i64, error: &str) -> Result<()>;
    async fn delete_experiment_row(&self, experiment_id: i64) -> Result<()>;
    async fn delete_experiments_by_knowledge(&self, knowledge_id: i64) -> Result<Vec<i64>>;

    // Worker-startup reconciliation: flip every in-flight row (document
    // PROCESSING, testset GENERATING, experiment RUNNING, knowledge
    // DELETING) to FAILED in one unit of work.
    async fn reset_interrupted(&self) -> Result<ReconcileReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_object_path_unique() {
        let a = upload_object_path(7, "report.pdf");
        let b = upload_object_path(7, "report.pdf");
        assert_ne!(a, b);
        assert!(a.starts_with("7/"));
        assert!(a.ends_with("_report.pdf"));
    }

    #[test]
    fn test_testset_object_path() {
        assert_eq!(testset_object_path(3), "testsets/3.csv");
    }

    #[test]
    fn test_index_filter_matches() {
        let meta = ChunkMetadata {
            doc_id: 11,
            knowledge_id: 2,
            source: "a.md".into(),
            page_number: None,
            chunk_index: 0,
            parent_id: None,
            parent_content: None,
            rerank_score: None,
        };

        assert!(IndexFilter::DocId(11).matches(&meta));
        assert!(!IndexFilter::DocId(12).matches(&meta));
        assert!(IndexFilter::KnowledgeId(2).matches(&meta));
        assert!(IndexFilter::KnowledgeIds(vec![1, 2, 3]).matches(&meta));
        assert!(!IndexFilter::KnowledgeIds(vec![4]).matches(&meta));
    }
}
