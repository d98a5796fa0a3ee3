// RagDB - Multi-tenant retrieval-augmented generation engine
// Root library module

pub mod auth;
pub mod blob_store;
pub mod chunker;
pub mod config;
pub mod contracts;
pub mod dual_index;
pub mod embeddings;
pub mod errors;
pub mod evaluation;
pub mod factory;
pub mod http_server;
pub mod job_queue;
pub mod llm;
pub mod loader;
pub mod metadata_store;
pub mod models;
pub mod observability;
pub mod processor;
pub mod prompts;
pub mod quota;
pub mod rag;
pub mod rerank;
pub mod retriever;
pub mod types;
pub mod worker;

// Re-export observability entry points
pub use observability::{
    init_logging, init_logging_with_level, log_operation, record_metric, with_trace_id,
    MetricType, Operation,
};

// Re-export adapter contracts
pub use contracts::{
    BlobStore, ChunkMetadata, DualIndex, IndexEntry, IndexFilter, IndexHit, JobQueue, JobRecord,
    MetadataStore, QuotaLedger,
};

// Re-export validated types
pub use types::{index_name_for, ChunkParams, UtcDay, ValidatedEmail, ValidatedTopK};

// Re-export domain entities
pub use models::{
    ChatSession, ChunkRow, DocStatus, Document, Experiment, ExperimentStatus, Knowledge,
    KnowledgeStatus, Membership, Message, MessageRole, MessageSource, MetricScores, Role,
    Testset, TestsetStatus, TokenUsage, User,
};

// Re-export error kinds
pub use errors::{truncate_error, RagError, INTERRUPTED_MESSAGE};

// Re-export adapter implementations and factories
pub use blob_store::{create_blob_store, FileBlobStore};
pub use dual_index::{cjk_tokenize, create_dual_index, EmbeddedDualIndex};
pub use job_queue::{create_job_queue, job_spec, FileJobQueue, JobSpec, JOB_SPECS};
pub use metadata_store::{create_metadata_store, MemoryMetadataStore, PgMetadataStore};
pub use quota::{create_quota_ledger, MemoryQuotaLedger};

// Re-export embedding providers
pub use embeddings::models as embedding_models;
pub use embeddings::{
    EmbedderRegistry, EmbeddingConfig, EmbeddingProvider, EmbeddingProviderType, EmbeddingResult,
    EmbeddingService, ProviderConfig,
};

// Re-export chat models
pub use llm::{ChatCompletion, ChatMessage, ChatModel, ChatProvider, HttpChatModel, ScriptedChatModel};

// Re-export the retrieval core
pub use retriever::{collapse_documents, rrf_fusion, HybridRetriever, RetrieveOptions, Strategy};

// Re-export pipelines and runtime
pub use evaluation::{EvaluationPipeline, TestsetRow};
pub use processor::{delete_document, DocumentProcessor};
pub use rag::{ChatModelFactory, ChatTurnRequest, ChatTurnResult, RagOrchestrator, StreamEvent};
pub use worker::{queue_for_file, WorkerRuntime};

// Re-export server assembly
pub use config::Settings;
pub use factory::Engine;
pub use http_server::{create_server, start_server, AppState, ErrorResponse};
