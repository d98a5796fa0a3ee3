// Hybrid Retriever
// Per query: parallel dense-kNN and BM25 passes over the caller's knowledge
// bases, Reciprocal-Rank-Fusion merge, optional cross-encoder rerank, and
// optional parent-document collapse. Every pass carries the tenant filter.

use anyhow::{ensure, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::contracts::{DualIndex, IndexFilter, IndexHit};
use crate::embeddings::EmbeddingService;
use crate::errors::RagError;
use crate::observability::{log_operation, Operation, OperationContext};
use crate::rerank::RerankClient;
use crate::types::{index_name_for, ValidatedTopK};

/// RRF smoothing constant.
const RRF_K: f32 = 60.0;

/// Retrieval strategies exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Dense kNN only.
    Dense,
    /// Dense + BM25 fused by RRF.
    Hybrid,
    /// Hybrid plus a cross-encoder pass.
    Rerank,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetrieveOptions {
    pub collapse_parents: bool,
    /// Override the recall budget; defaults to max(50, top_k * 10).
    pub recall_k: Option<usize>,
}

/// Stable identity for fusion: index entry id, else doc id, else a content
/// hash. Two chunks with identical text and no identity metadata therefore
/// fuse into one entry, first-seen payload winning.
fn fusion_key(hit: &IndexHit) -> String {
    if !hit.id.is_empty() {
        return hit.id.clone();
    }
    if hit.metadata.doc_id != 0 {
        return format!("doc:{}", hit.metadata.doc_id);
    }
    hex::encode(Sha256::digest(hit.text.as_bytes()))
}

/// Reciprocal Rank Fusion.
///
/// Each document at 0-based rank `r` in list `i` contributes
/// `w_i / (RRF_K + r + 1)`; contributions sum across lists keyed by the
/// stable identity. Output is sorted by fused score descending, ties broken
/// by the minimum rank the document was seen at. A weight of 0 eliminates a
/// stream entirely.
pub fn rrf_fusion(lists: Vec<Vec<IndexHit>>, weights: Option<Vec<f32>>) -> Vec<IndexHit> {
    if lists.is_empty() {
        return Vec::new();
    }
    let weights = weights.unwrap_or_else(|| vec![1.0; lists.len()]);

    struct Fused {
        score: f32,
        min_rank: usize,
        hit: IndexHit,
    }

    let mut fused: HashMap<String, Fused> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for (list, weight) in lists.into_iter().zip(weights) {
        if weight == 0.0 {
            continue;
        }
        for (rank, hit) in list.into_iter().enumerate() {
            let key = fusion_key(&hit);
            let increment = weight / (RRF_K + rank as f32 + 1.0);

            match fused.get_mut(&key) {
                Some(entry) => {
                    entry.score += increment;
                    entry.min_rank = entry.min_rank.min(rank);
                }
                None => {
                    fused.insert(
                        key.clone(),
                        Fused {
                            score: increment,
                            min_rank: rank,
                            hit,
                        },
                    );
                    order.push(key);
                }
            }
        }
    }

    let mut results: Vec<Fused> = order
        .into_iter()
        .filter_map(|key| fused.remove(&key))
        .collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.min_rank.cmp(&b.min_rank))
    });

    results
        .into_iter()
        .map(|f| {
            let mut hit = f.hit;
            hit.score = f.score;
            hit
        })
        .collect()
}

/// Collapse child chunks onto their parent documents (small-to-big).
///
/// Children sharing a parent dedup to one result carrying the parent's
/// content; children without parent metadata pass through deduplicated by
/// their own identity. Collection stops once `top_k` unique results exist.
pub fn collapse_documents(hits: Vec<IndexHit>, top_k: Option<usize>) -> Vec<IndexHit> {
    let mut seen = std::collections::HashSet::new();
    let mut collapsed = Vec::new();

    for hit in hits {
        match (&hit.metadata.parent_id, &hit.metadata.parent_content) {
            (Some(parent_id), Some(parent_content)) => {
                if !seen.insert(parent_id.clone()) {
                    continue;
                }
                let mut parent = hit.clone();
                parent.text = parent_content.clone();
                parent.metadata.parent_content = None;
                collapsed.push(parent);
            }
            _ => {
                if !seen.insert(fusion_key(&hit)) {
                    continue;
                }
                collapsed.push(hit);
            }
        }

        if let Some(k) = top_k {
            if collapsed.len() >= k {
                break;
            }
        }
    }

    debug!(parents = collapsed.len(), "Parent collapse completed");
    collapsed
}

/// Hybrid retrieval over one or more knowledge bases.
pub struct HybridRetriever {
    index: Arc<dyn DualIndex>,
    embedder: Arc<EmbeddingService>,
    rerank: Option<Arc<RerankClient>>,
}

impl HybridRetriever {
    pub fn new(
        index: Arc<dyn DualIndex>,
        embedder: Arc<EmbeddingService>,
        rerank: Option<Arc<RerankClient>>,
    ) -> Self {
        Self {
            index,
            embedder,
            rerank,
        }
    }

    /// Retrieve `top_k` chunks for `query` across `kb_ids`.
    ///
    /// The two first-stage passes run concurrently; if one fails retrieval
    /// degrades to the surviving pass, and only both failing surfaces an
    /// index error. At most one round-trip per sub-index per call.
    pub async fn retrieve(
        &self,
        query: &str,
        kb_ids: &[i64],
        top_k: ValidatedTopK,
        strategy: Strategy,
        options: RetrieveOptions,
    ) -> Result<Vec<IndexHit>> {
        ensure!(!kb_ids.is_empty(), "retrieve requires at least one knowledge base");

        let mut ctx = OperationContext::new("hybrid_retrieve");
        ctx.add_attribute("kb_ids", format!("{kb_ids:?}"));
        ctx.add_attribute("strategy", format!("{strategy:?}"));

        let recall_k = options.recall_k.unwrap_or_else(|| top_k.recall_k());
        let filter = IndexFilter::KnowledgeIds(kb_ids.to_vec());
        let names: Vec<String> = kb_ids.iter().map(|id| index_name_for(*id)).collect();

        let fused = match strategy {
            Strategy::Dense => {
                let vector = self
                    .embedder
                    .embed_text(query)
                    .await
                    .map_err(|e| RagError::EmbedFailed(format!("{e:#}")))?;
                self.index
                    .knn(&names, &vector, recall_k, Some(&filter))
                    .await
                    .map_err(|e| RagError::IndexReadFailed(format!("{e:#}")))?
            }
            Strategy::Hybrid | Strategy::Rerank => {
                self.first_stage(query, &names, recall_k, &filter).await?
            }
        };

        let use_rerank = matches!(strategy, Strategy::Rerank) || self.rerank.is_some();
        let selected = match (&self.rerank, use_rerank) {
            (Some(rerank), true) => {
                let candidates: Vec<IndexHit> =
                    fused.into_iter().take(recall_k).collect();
                rerank.rerank(query, candidates, top_k.get()).await
            }
            _ => fused,
        };

        let results = if options.collapse_parents {
            collapse_documents(selected, Some(top_k.get()))
        } else {
            let mut selected = selected;
            selected.truncate(top_k.get());
            selected
        };

        log_operation(
            &ctx,
            &Operation::Retrieve {
                query: query.chars().take(50).collect(),
                result_count: results.len(),
            },
            &Ok(()),
        );
        Ok(results)
    }

    /// Run the dense and BM25 passes concurrently and fuse them.
    async fn first_stage(
        &self,
        query: &str,
        names: &[String],
        recall_k: usize,
        filter: &IndexFilter,
    ) -> Result<Vec<IndexHit>> {
        let dense_pass = async {
            let vector = self
                .embedder
                .embed_text(query)
                .await
                .map_err(|e| anyhow::anyhow!(RagError::EmbedFailed(format!("{e:#}"))))?;
            self.index
                .knn(names, &vector, recall_k, Some(filter))
                .await
        };
        let bm25_pass = self.index.bm25(names, query, recall_k, Some(filter));

        let (dense, lexical) = tokio::join!(dense_pass, bm25_pass);

        match (dense, lexical) {
            (Ok(dense), Ok(lexical)) => Ok(rrf_fusion(vec![dense, lexical], None)),
            (Ok(dense), Err(e)) => {
                warn!(error = %e, "BM25 pass failed, using dense results only");
                Ok(rrf_fusion(vec![dense], None))
            }
            (Err(e), Ok(lexical)) => {
                warn!(error = %e, "Dense pass failed, using BM25 results only");
                Ok(rrf_fusion(vec![lexical], None))
            }
            (Err(dense_err), Err(lexical_err)) => Err(RagError::IndexReadFailed(format!(
                "both passes failed: dense: {dense_err:#}; bm25: {lexical_err:#}"
            ))
            .into()),
        }
    }
}
