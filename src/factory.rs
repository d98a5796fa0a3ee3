// Factory functions for production-ready component wiring.
// Pooled clients are built once here and injected everywhere; no component
// constructs its own adapter.

use anyhow::Result;
use std::sync::Arc;

use crate::blob_store::create_blob_store;
use crate::config::Settings;
use crate::dual_index::create_dual_index;
use crate::embeddings::{EmbedderRegistry, EmbeddingService};
use crate::evaluation::EvaluationPipeline;
use crate::http_server::AppState;
use crate::job_queue::create_job_queue;
use crate::loader::StructuredParserClient;
use crate::metadata_store::create_metadata_store;
use crate::processor::DocumentProcessor;
use crate::quota::create_quota_ledger;
use crate::rag::{HttpChatModelFactory, RagOrchestrator};
use crate::rerank::RerankClient;
use crate::retriever::HybridRetriever;
use crate::worker::WorkerRuntime;

/// The pooled-client registry: every adapter and engine component, built
/// once from settings.
pub struct Engine {
    pub state: AppState,
    processor: Arc<DocumentProcessor>,
}

impl Engine {
    pub async fn build(settings: Settings) -> Result<Self> {
        let store = create_metadata_store(settings.database_url.as_deref()).await?;
        let blobs = create_blob_store(settings.data_dir.join("blobs")).await?;
        let index = create_dual_index(settings.data_dir.join("index")).await?;
        let queue = create_job_queue(settings.data_dir.join("queue")).await?;
        let quota = create_quota_ledger();

        let embedders = Arc::new(EmbedderRegistry::new(settings.clone()));
        // Query-side embedding uses the deployment's default model; per-KB
        // models apply on the write path.
        let query_embedder: Arc<EmbeddingService> =
            embedders.for_model(&settings.default_embed_model).await?;

        let rerank = match &settings.rerank_base_url {
            Some(base_url) => Some(Arc::new(RerankClient::new(
                base_url,
                &settings.rerank_model_name,
                settings.rerank_threshold,
            )?)),
            None => None,
        };
        let parser = match &settings.parser_base_url {
            Some(base_url) => Some(Arc::new(StructuredParserClient::new(base_url)?)),
            None => None,
        };

        let retriever = Arc::new(HybridRetriever::new(
            index.clone(),
            query_embedder,
            rerank,
        ));
        let models = Arc::new(HttpChatModelFactory::new(settings.clone()));
        let orchestrator = Arc::new(RagOrchestrator::new(
            store.clone(),
            quota.clone(),
            retriever.clone(),
            models.clone(),
            settings.default_llm_model.clone(),
        ));
        let evaluation = Arc::new(EvaluationPipeline::new(
            store.clone(),
            blobs.clone(),
            retriever,
            models,
            settings.default_llm_model.clone(),
        ));
        let processor = Arc::new(DocumentProcessor::new(
            store.clone(),
            blobs.clone(),
            index.clone(),
            embedders,
            parser,
        ));

        Ok(Self {
            state: AppState {
                settings,
                store,
                blobs,
                index,
                queue,
                quota,
                orchestrator,
                evaluation,
            },
            processor,
        })
    }

    pub fn worker(&self) -> WorkerRuntime {
        WorkerRuntime::new(
            self.state.queue.clone(),
            self.state.store.clone(),
            self.state.blobs.clone(),
            self.state.index.clone(),
            self.processor.clone(),
            self.state.evaluation.clone(),
        )
    }
}
