// Shared fixtures for integration tests: an embedded engine wired from
// in-memory and temp-dir adapters, with deterministic embeddings and a
// scripted chat model.

use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;

use ragdb::contracts::{NewDocument, NewKnowledge, NewUser};
use ragdb::{
    create_blob_store, create_quota_ledger, BlobStore, ChatModel, ChatModelFactory,
    DocumentProcessor, DualIndex, EmbedderRegistry, EmbeddingService, EvaluationPipeline,
    FileJobQueue, HybridRetriever, JobQueue, Knowledge, MemoryMetadataStore, MetadataStore,
    QuotaLedger, ScriptedChatModel, Settings, User,
};

pub struct ScriptedFactory {
    response: String,
}

impl ScriptedFactory {
    pub fn answering(response: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            response: response.into(),
        })
    }
}

impl ChatModelFactory for ScriptedFactory {
    fn model(&self, _name: &str) -> Result<Arc<dyn ChatModel>> {
        Ok(Arc::new(ScriptedChatModel::always(self.response.clone())))
    }
}

pub struct TestWorld {
    pub dir: TempDir,
    pub settings: Settings,
    pub store: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub index: Arc<dyn DualIndex>,
    pub queue: Arc<dyn JobQueue>,
    pub quota: Arc<dyn QuotaLedger>,
    pub embedders: Arc<EmbedderRegistry>,
    pub processor: Arc<DocumentProcessor>,
    pub retriever: Arc<HybridRetriever>,
    pub user: User,
}

impl TestWorld {
    pub async fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        let settings = Settings::for_tests(dir.path());

        let store: Arc<dyn MetadataStore> = Arc::new(MemoryMetadataStore::new());
        let blobs = create_blob_store(dir.path().join("blobs")).await?;
        let index: Arc<dyn DualIndex> =
            Arc::new(ragdb::EmbeddedDualIndex::open(dir.path().join("index")).await?);
        let queue: Arc<dyn JobQueue> =
            Arc::new(FileJobQueue::open(dir.path().join("queue")).await?);
        let quota = create_quota_ledger();

        let embedders = Arc::new(EmbedderRegistry::new(settings.clone()));
        let query_embedder: Arc<EmbeddingService> = embedders.for_model("deterministic").await?;

        let processor = Arc::new(DocumentProcessor::new(
            store.clone(),
            blobs.clone(),
            index.clone(),
            embedders.clone(),
            None,
        ));
        let retriever = Arc::new(HybridRetriever::new(index.clone(), query_embedder, None));

        let user = store
            .create_user(NewUser {
                email: "tester@example.com".into(),
                hashed_password: "hash".into(),
                full_name: None,
                plan: "free".into(),
                daily_request_cap: settings.daily_request_cap,
                daily_token_cap: settings.daily_token_cap,
            })
            .await?;

        Ok(Self {
            dir,
            settings,
            store,
            blobs,
            index,
            queue,
            quota,
            embedders,
            processor,
            retriever,
            user,
        })
    }

    pub fn evaluation(&self, factory: Arc<ScriptedFactory>) -> Arc<EvaluationPipeline> {
        Arc::new(EvaluationPipeline::new(
            self.store.clone(),
            self.blobs.clone(),
            self.retriever.clone(),
            factory,
            "test-llm".into(),
        ))
    }

    pub async fn create_kb(&self, name: &str) -> Result<Knowledge> {
        self.store
            .create_knowledge(
                NewKnowledge {
                    name: name.into(),
                    description: None,
                    embed_model: "deterministic".into(),
                    chunk_size: 500,
                    chunk_overlap: 50,
                },
                self.user.id,
            )
            .await
    }

    /// Upload a file into the blob store, create the document row, and run
    /// the processor on it directly (bypassing the queue).
    pub async fn ingest(
        &self,
        kb: &Knowledge,
        filename: &str,
        content: &str,
    ) -> Result<ragdb::Document> {
        let blob_path = ragdb::contracts::upload_object_path(kb.id, filename);
        self.blobs.put(&blob_path, content.as_bytes()).await?;
        let doc = self
            .store
            .create_document(NewDocument {
                knowledge_id: kb.id,
                filename: filename.into(),
                blob_path,
                content_hash: None,
            })
            .await?;
        self.processor.process(doc.id).await?;
        Ok(self
            .store
            .get_document(doc.id)
            .await?
            .expect("document exists"))
    }
}
