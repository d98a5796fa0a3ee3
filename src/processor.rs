// Document Processor
// The ingestion pipeline behind `process_document` jobs: download the blob,
// route it to a parser, chunk, embed, and dual-index the result. Database
// transactions stay short; parse and chunk work runs off the request path on
// the blocking executor.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task;
use tracing::{error, info, warn};

use crate::chunker::{chunk_document, Chunk};
use crate::contracts::{
    BlobStore, ChunkMetadata, DualIndex, IndexEntry, IndexFilter, MetadataStore, NewChunkRow,
};
use crate::embeddings::EmbedderRegistry;
use crate::errors::{truncate_error, RagError};
use crate::loader::{self, StructuredParserClient};
use crate::observability::{log_operation, Operation, OperationContext};
use crate::types::{index_name_for, ChunkParams};

/// Whole-pipeline watchdog; a run exceeding this fails the document.
pub const PROCESS_DEADLINE: Duration = Duration::from_secs(600);

pub struct DocumentProcessor {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn DualIndex>,
    embedders: Arc<EmbedderRegistry>,
    parser: Option<Arc<StructuredParserClient>>,
    deadline: Duration,
}

impl DocumentProcessor {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        index: Arc<dyn DualIndex>,
        embedders: Arc<EmbedderRegistry>,
        parser: Option<Arc<StructuredParserClient>>,
    ) -> Self {
        Self {
            store,
            blobs,
            index,
            embedders,
            parser,
            deadline: PROCESS_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Process one document end to end.
    ///
    /// Any failure lands the document in FAILED with a truncated error
    /// message; the job queue decides whether to retry, and a retry restarts
    /// from the beginning.
    pub async fn process(&self, doc_id: i64) -> Result<()> {
        let mut ctx = OperationContext::new("process_document");

        // Acquire-and-mark is its own short transaction; the connection is
        // released before any long-running work starts.
        let (doc, knowledge) = self
            .store
            .mark_document_processing(doc_id)
            .await
            .with_context(|| format!("document {doc_id} not processable"))?;
        ctx.add_attribute("filename", doc.filename.as_str());

        info!(
            doc_id,
            knowledge_id = knowledge.id,
            filename = %doc.filename,
            "Processing document"
        );

        let result = tokio::time::timeout(self.deadline, self.run_pipeline(&doc, &knowledge)).await;

        let outcome = match result {
            Ok(Ok(chunk_count)) => {
                log_operation(
                    &ctx,
                    &Operation::DocumentProcess { doc_id, chunk_count },
                    &Ok(()),
                );
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => anyhow!(
                "processing deadline of {}s exceeded",
                self.deadline.as_secs()
            ),
        };

        log_operation(
            &ctx,
            &Operation::DocumentProcess {
                doc_id,
                chunk_count: 0,
            },
            &Err(anyhow!("{outcome:#}")),
        );
        // A fresh short transaction records the failure; the original error
        // is what the caller retries on.
        if let Err(mark_err) = self
            .store
            .fail_document(doc_id, &truncate_error(&outcome))
            .await
        {
            error!(doc_id, error = %mark_err, "Failed to record document failure");
        }
        Err(outcome)
    }

    async fn run_pipeline(
        &self,
        doc: &crate::models::Document,
        knowledge: &crate::models::Knowledge,
    ) -> Result<usize> {
        let bytes = self
            .blobs
            .get(&doc.blob_path)
            .await
            .with_context(|| format!("blob fetch failed: {}", doc.blob_path))?;

        // Parse, routed on the filename suffix (structure-aware formats go
        // out of process; plain loads are cheap enough inline).
        let parsed = loader::load_document(&doc.filename, &bytes, self.parser.as_deref()).await?;

        // Chunking is CPU-bound; keep it off the async executor.
        let params = ChunkParams::new(knowledge.chunk_size, knowledge.chunk_overlap)?;
        let chunks =
            task::spawn_blocking(move || chunk_document(&parsed, params)).await?;
        if chunks.is_empty() {
            return Err(RagError::ParseFailed(format!(
                "{} produced no chunks",
                doc.filename
            ))
            .into());
        }

        // Embed in deterministic provider-sized batches. A failure anywhere
        // fails the whole document; partial indexing is worse than none.
        let embedder = self.embedders.for_model(&knowledge.embed_model).await?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embedded = embedder
            .embed_texts(&texts)
            .await
            .map_err(|e| RagError::EmbedFailed(format!("{e:#}")))?;

        let index_name = index_name_for(knowledge.id);
        self.index
            .ensure_index(&index_name, embedder.dimension())
            .await?;

        // A re-processed document must not leave stale entries behind; the
        // new write is causally ordered after this delete.
        self.index
            .delete_by_filter(&index_name, &IndexFilter::DocId(doc.id))
            .await
            .map_err(|e| RagError::IndexWriteFailed(format!("{e:#}")))?;

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(&embedded.embeddings)
            .enumerate()
            .map(|(i, (chunk, vector))| {
                build_entry(doc.id, knowledge.id, &doc.filename, i, chunk, vector.clone())
            })
            .collect();

        let entry_ids = self
            .index
            .bulk_upsert(&index_name, entries)
            .await
            .map_err(|e| RagError::IndexWriteFailed(format!("{e:#}")))?;

        // Index first, then the chunk-mapping rows and the COMPLETED flip in
        // one transaction. If that transaction fails, compensate by removing
        // what we just indexed so index and database stay in agreement.
        let rows: Vec<NewChunkRow> = chunks
            .iter()
            .zip(&entry_ids)
            .enumerate()
            .map(|(i, (chunk, entry_id))| NewChunkRow {
                index_entry_id: entry_id.clone(),
                chunk_index: i,
                content: chunk.text.clone(),
                page_number: chunk.page_number,
            })
            .collect();

        let chunk_count = rows.len();
        if let Err(e) = self.store.complete_document(doc.id, rows).await {
            warn!(doc_id = doc.id, "Completing document failed, compensating index write");
            if let Err(comp) = self
                .index
                .delete_by_filter(&index_name, &IndexFilter::DocId(doc.id))
                .await
            {
                error!(doc_id = doc.id, error = %comp, "Index compensation failed");
            }
            return Err(e);
        }

        Ok(chunk_count)
    }
}

fn build_entry(
    doc_id: i64,
    knowledge_id: i64,
    source: &str,
    chunk_index: usize,
    chunk: &Chunk,
    vector: Vec<f32>,
) -> IndexEntry {
    IndexEntry {
        text: chunk.text.clone(),
        vector,
        metadata: ChunkMetadata {
            doc_id,
            knowledge_id,
            source: source.to_string(),
            page_number: chunk.page_number,
            chunk_index,
            parent_id: chunk.parent_id.clone(),
            parent_content: chunk.parent_content.clone(),
            rerank_score: None,
        },
    }
}

/// Delete a document with the ordering guarantee: index entries first, then
/// rows, then the blob. If the index removal fails nothing else is touched;
/// a failed blob removal is logged but does not undo the delete.
pub async fn delete_document(
    store: &Arc<dyn MetadataStore>,
    blobs: &Arc<dyn BlobStore>,
    index: &Arc<dyn DualIndex>,
    doc_id: i64,
) -> Result<()> {
    let doc = store
        .get_document(doc_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("document {doc_id}")))?;

    let index_name = index_name_for(doc.knowledge_id);
    index
        .delete_by_filter(&index_name, &IndexFilter::DocId(doc_id))
        .await
        .map_err(|e| RagError::IndexWriteFailed(format!("{e:#}")))?;

    store.delete_document_row(doc_id).await?;

    if let Err(e) = blobs.delete(&doc.blob_path).await {
        warn!(doc_id, blob_path = %doc.blob_path, error = %e, "Blob removal failed after delete");
    }

    Ok(())
}
