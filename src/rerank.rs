// Rerank Service Client
// Calls a TEI-compatible cross-encoder endpoint. Inputs are split into
// batches of at most 32 texts submitted concurrently; results are remapped to
// global indices, threshold-filtered, and sorted. A failed call degrades to
// the caller's fused order.

use anyhow::{Context, Result};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::contracts::IndexHit;

const RERANK_BATCH_SIZE: usize = 32;

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    texts: &'a [String],
    truncate: bool,
}

#[derive(Debug, Deserialize)]
struct RerankItem {
    index: usize,
    score: f32,
}

pub struct RerankClient {
    client: reqwest::Client,
    base_url: String,
    model_name: String,
    threshold: f32,
}

impl RerankClient {
    pub fn new(base_url: &str, model_name: &str, threshold: f32) -> Result<Self> {
        // Cross-encoder scoring is heavy; allow a long overall timeout with a
        // short connect timeout.
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_name: model_name.to_string(),
            threshold,
        })
    }

    async fn score_batch(
        &self,
        query: &str,
        texts: &[String],
        start_index: usize,
    ) -> Result<Vec<RerankItem>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = RerankRequest {
            query,
            texts,
            truncate: true,
        };

        let response = self
            .client
            .post(format!("{}/rerank", self.base_url))
            .json(&request)
            .send()
            .await
            .context("rerank request failed")?
            .error_for_status()
            .context("rerank service returned an error status")?;

        let mut items: Vec<RerankItem> = response.json().await?;
        for item in &mut items {
            item.index += start_index;
        }
        Ok(items)
    }

    /// Rerank `hits` against `query`, keeping at most `top_n` with score >=
    /// threshold and stamping `metadata.rerank_score`.
    ///
    /// On any service failure the first `top_n` hits are returned unchanged:
    /// degraded order beats a failed request.
    pub async fn rerank(&self, query: &str, hits: Vec<IndexHit>, top_n: usize) -> Vec<IndexHit> {
        if hits.is_empty() {
            return hits;
        }

        let texts: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        let batches: Vec<_> = texts
            .chunks(RERANK_BATCH_SIZE)
            .enumerate()
            .map(|(i, batch)| self.score_batch(query, batch, i * RERANK_BATCH_SIZE))
            .collect();

        let scored = match try_join_all(batches).await {
            Ok(results) => results.into_iter().flatten().collect::<Vec<_>>(),
            Err(e) => {
                warn!(model = %self.model_name, error = %e, "Rerank unavailable, keeping fused order");
                let mut hits = hits;
                hits.truncate(top_n);
                return hits;
            }
        };

        let mut scored = scored;
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut reranked = Vec::with_capacity(top_n);
        for item in scored {
            if item.score < self.threshold {
                continue;
            }
            let Some(hit) = hits.get(item.index) else {
                continue;
            };
            let mut hit = hit.clone();
            hit.metadata.rerank_score = Some(item.score);
            reranked.push(hit);
            if reranked.len() >= top_n {
                break;
            }
        }

        info!(
            input = hits.len(),
            output = reranked.len(),
            "Rerank completed"
        );
        reranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::ChunkMetadata;

    fn hit(text: &str, doc_id: i64) -> IndexHit {
        IndexHit {
            id: format!("e{doc_id}"),
            text: text.to_string(),
            score: 0.0,
            metadata: ChunkMetadata {
                doc_id,
                knowledge_id: 1,
                source: "a.txt".into(),
                page_number: None,
                chunk_index: 0,
                parent_id: None,
                parent_content: None,
                rerank_score: None,
            },
        }
    }

    #[tokio::test]
    async fn test_unreachable_service_degrades_to_fused_order() -> Result<()> {
        // Nothing listens on this port; the call must not error.
        let client = RerankClient::new("http://127.0.0.1:1", "test-model", 0.0)?;
        let hits = vec![hit("first", 1), hit("second", 2), hit("third", 3)];

        let result = client.rerank("query", hits, 2).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].metadata.doc_id, 1);
        assert_eq!(result[1].metadata.doc_id, 2);
        // Degraded results carry no rerank score.
        assert!(result[0].metadata.rerank_score.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_input_is_noop() -> Result<()> {
        let client = RerankClient::new("http://127.0.0.1:1", "test-model", 0.0)?;
        let result = client.rerank("query", Vec::new(), 5).await;
        assert!(result.is_empty());
        Ok(())
    }
}
