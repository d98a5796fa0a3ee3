// Domain entity records.
// Plain serde records persisted by the metadata store; mutation flows through
// the store's unit-of-work methods, never through shared mutable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Processing state of an ingested document.
///
/// Transitions are a subsequence of PENDING -> PROCESSING -> {COMPLETED,
/// FAILED}; a document never moves backward, and FAILED is terminal until an
/// operator re-dispatches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocStatus {
    /// Whether moving to `next` respects the forward-only lifecycle.
    pub fn can_transition_to(&self, next: DocStatus) -> bool {
        matches!(
            (self, next),
            (DocStatus::Pending, DocStatus::Processing)
                | (DocStatus::Processing, DocStatus::Completed)
                | (DocStatus::Processing, DocStatus::Failed)
                | (DocStatus::Failed, DocStatus::Processing)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KnowledgeStatus {
    Normal,
    Deleting,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestsetStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Capability tier a membership grants on a knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Viewer,
    Editor,
    Owner,
}

impl Role {
    pub fn can_query(&self) -> bool {
        true
    }

    pub fn can_write_documents(&self) -> bool {
        *self >= Role::Editor
    }

    pub fn can_manage(&self) -> bool {
        *self >= Role::Owner
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub hashed_password: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub plan: String,
    pub daily_request_cap: i64,
    pub daily_token_cap: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Knowledge {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub embed_model: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub status: KnowledgeStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: i64,
    pub knowledge_id: i64,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub knowledge_id: i64,
    pub filename: String,
    /// Blob-store object path; unique and never reused.
    pub blob_path: String,
    pub content_hash: Option<String>,
    pub status: DocStatus,
    pub error_message: Option<String>,
    pub meta_info: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mapping row between a document and one indexed chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRow {
    pub id: i64,
    pub document_id: i64,
    /// Entry id in the dual index.
    pub index_entry_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: Uuid,
    pub user_id: i64,
    /// Primary knowledge base; always a member of `knowledge_ids`.
    pub knowledge_id: i64,
    pub knowledge_ids: Vec<i64>,
    pub title: String,
    pub icon: String,
    pub top_k: usize,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_SESSION_TITLE: &str = "New Chat";

impl ChatSession {
    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_SESSION_TITLE
    }
}

/// A retrieval citation attached to an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSource {
    pub filename: String,
    pub page_number: Option<u32>,
    pub chunk_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub sources: Vec<MessageSource>,
    pub token_usage: u64,
    /// Set when a streaming turn was cut short by a client disconnect.
    pub partial: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Testset {
    pub id: i64,
    pub name: String,
    /// CSV artifact path in the blob store.
    pub blob_path: Option<String>,
    pub status: TestsetStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Scalar metric averages produced by an experiment run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricScores {
    pub faithfulness: f64,
    pub answer_relevancy: f64,
    pub context_recall: f64,
    pub context_precision: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub knowledge_id: i64,
    pub testset_id: i64,
    pub params: HashMap<String, serde_json::Value>,
    pub scores: Option<MetricScores>,
    pub status: ExperimentStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Token accounting for one generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_status_monotonic() {
        assert!(DocStatus::Pending.can_transition_to(DocStatus::Processing));
        assert!(DocStatus::Processing.can_transition_to(DocStatus::Completed));
        assert!(DocStatus::Processing.can_transition_to(DocStatus::Failed));
        // Re-dispatch of a failed document restarts processing.
        assert!(DocStatus::Failed.can_transition_to(DocStatus::Processing));

        assert!(!DocStatus::Completed.can_transition_to(DocStatus::Pending));
        assert!(!DocStatus::Processing.can_transition_to(DocStatus::Pending));
        assert!(!DocStatus::Completed.can_transition_to(DocStatus::Processing));
    }

    #[test]
    fn test_role_capabilities() {
        assert!(Role::Viewer.can_query());
        assert!(!Role::Viewer.can_write_documents());
        assert!(Role::Editor.can_write_documents());
        assert!(!Role::Editor.can_manage());
        assert!(Role::Owner.can_manage());
    }

    #[test]
    fn test_status_serde_casing() {
        let json = serde_json::to_string(&DocStatus::Processing).unwrap();
        assert_eq!(json, "\"PROCESSING\"");
        let role: MessageRole = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, MessageRole::Assistant);
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 120,
            output_tokens: 80,
        };
        assert_eq!(usage.total(), 200);
    }
}
