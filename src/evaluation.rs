// Evaluation Pipeline
// Offline plane: synthesize question/ground-truth test sets from ingested
// corpora, replay them against a retriever configuration, and score each row
// with LLM-as-judge metrics. Individual metric failures score 0.0 and the
// run continues.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::contracts::{testset_object_path, BlobStore, MetadataStore};
use crate::errors::truncate_error;
use crate::llm::{ChatMessage, ChatModel};
use crate::models::MetricScores;
use crate::prompts;
use crate::rag::ChatModelFactory;
use crate::retriever::{HybridRetriever, RetrieveOptions, Strategy};
use crate::types::ValidatedTopK;

/// Experiment rows are replayed in batches of this size.
const EVAL_BATCH_SIZE: usize = 16;

/// One synthesized evaluation example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsetRow {
    pub question: String,
    pub ground_truth: String,
    pub reference_contexts: String,
}

/// Runtime parameters an experiment may carry.
#[derive(Debug, Clone, Deserialize)]
pub struct ExperimentParams {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub llm_model: Option<String>,
}

fn default_top_k() -> usize {
    5
}

fn default_strategy() -> String {
    "hybrid".to_string()
}

impl ExperimentParams {
    pub fn strategy(&self) -> Strategy {
        match self.strategy.as_str() {
            "dense" => Strategy::Dense,
            "rerank" => Strategy::Rerank,
            _ => Strategy::Hybrid,
        }
    }
}

pub struct EvaluationPipeline {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    retriever: Arc<HybridRetriever>,
    models: Arc<dyn ChatModelFactory>,
    default_model: String,
}

impl EvaluationPipeline {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        retriever: Arc<HybridRetriever>,
        models: Arc<dyn ChatModelFactory>,
        default_model: String,
    ) -> Self {
        Self {
            store,
            blobs,
            retriever,
            models,
            default_model,
        }
    }

    /// Generate a test set from the chunks of the given documents and write
    /// it to a CSV blob. Failures land on the Testset row.
    pub async fn generate_testset(
        &self,
        testset_id: i64,
        source_doc_ids: &[i64],
        size: usize,
        generator_model: &str,
    ) -> Result<()> {
        self.store.mark_testset_generating(testset_id).await?;

        let result = self
            .generate_rows(testset_id, source_doc_ids, size, generator_model)
            .await;

        match result {
            Ok(blob_path) => {
                self.store.complete_testset(testset_id, &blob_path).await?;
                Ok(())
            }
            Err(e) => {
                self.store
                    .fail_testset(testset_id, &truncate_error(&e))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn generate_rows(
        &self,
        testset_id: i64,
        source_doc_ids: &[i64],
        size: usize,
        generator_model: &str,
    ) -> Result<String> {
        let mut contexts = Vec::new();
        for doc_id in source_doc_ids {
            for chunk in self.store.list_chunks(*doc_id).await? {
                contexts.push(chunk.content);
            }
        }
        if contexts.is_empty() {
            return Err(anyhow!("source documents carry no chunks"));
        }

        // Spread examples across the corpus rather than draining one doc.
        let stride = (contexts.len() / size.max(1)).max(1);
        let selected: Vec<&String> = contexts.iter().step_by(stride).take(size).collect();

        let model = self.models.model(generator_model)?;
        let mut rows = Vec::new();
        for context in selected {
            match synthesize_row(&model, context).await {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Skipping unusable generated example")
                }
            }
        }
        if rows.is_empty() {
            return Err(anyhow!("generator produced no usable examples"));
        }

        let csv_bytes = write_csv(&rows)?;
        let blob_path = testset_object_path(testset_id);
        self.blobs.put(&blob_path, &csv_bytes).await?;

        info!(testset_id, rows = rows.len(), "Test set generated");
        Ok(blob_path)
    }

    /// Replay a test set against the experiment's retriever configuration
    /// and score it. Failures land on the Experiment row.
    pub async fn run_experiment(&self, experiment_id: i64) -> Result<()> {
        self.store.mark_experiment_running(experiment_id).await?;

        let result = self.run_experiment_inner(experiment_id).await;
        match result {
            Ok(scores) => {
                self.store
                    .complete_experiment(experiment_id, scores)
                    .await?;
                Ok(())
            }
            Err(e) => {
                self.store
                    .fail_experiment(experiment_id, &truncate_error(&e))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn run_experiment_inner(&self, experiment_id: i64) -> Result<MetricScores> {
        let experiment = self
            .store
            .get_experiment(experiment_id)
            .await?
            .ok_or_else(|| anyhow!("experiment {experiment_id} not found"))?;
        let testset = self
            .store
            .get_testset(experiment.testset_id)
            .await?
            .ok_or_else(|| anyhow!("testset {} not found", experiment.testset_id))?;
        let blob_path = testset
            .blob_path
            .ok_or_else(|| anyhow!("testset {} has no artifact", experiment.testset_id))?;

        let params: ExperimentParams =
            serde_json::from_value(serde_json::Value::Object(
                experiment.params.clone().into_iter().collect(),
            ))
            .context("invalid experiment params")?;

        let csv_bytes = self.blobs.get(&blob_path).await?;
        let rows = read_csv(&csv_bytes)?;
        if rows.is_empty() {
            return Err(anyhow!("test set is empty"));
        }

        let model_name = params
            .llm_model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let model = self.models.model(&model_name)?;
        let top_k = ValidatedTopK::new(params.top_k)?;

        let mut totals = MetricScores::default();
        let row_count = rows.len();

        for batch in rows.chunks(EVAL_BATCH_SIZE) {
            // Batch-retrieve, then batch-answer, then judge row by row.
            let mut retrieved = Vec::with_capacity(batch.len());
            for row in batch {
                let hits = self
                    .retriever
                    .retrieve(
                        &row.question,
                        &[experiment.knowledge_id],
                        top_k,
                        params.strategy(),
                        RetrieveOptions::default(),
                    )
                    .await?;
                let context = hits
                    .iter()
                    .map(|h| h.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                retrieved.push(context);
            }

            let mut answers = Vec::with_capacity(batch.len());
            for (row, context) in batch.iter().zip(&retrieved) {
                let vars = HashMap::from([
                    ("context", context.as_str()),
                    ("question", row.question.as_str()),
                ]);
                let completion = model
                    .complete(&[ChatMessage::user(prompts::render(
                        prompts::RAG_ANSWER,
                        &vars,
                    ))])
                    .await?;
                answers.push(completion.content);
            }

            for ((row, context), answer) in batch.iter().zip(&retrieved).zip(&answers) {
                let scores = judge_row(&model, row, context, answer).await;
                totals.faithfulness += scores.faithfulness;
                totals.answer_relevancy += scores.answer_relevancy;
                totals.context_recall += scores.context_recall;
                totals.context_precision += scores.context_precision;
            }
        }

        let n = row_count as f64;
        let scores = MetricScores {
            faithfulness: totals.faithfulness / n,
            answer_relevancy: totals.answer_relevancy / n,
            context_recall: totals.context_recall / n,
            context_precision: totals.context_precision / n,
        };
        info!(experiment_id, rows = row_count, ?scores, "Experiment completed");
        Ok(scores)
    }
}

async fn synthesize_row(model: &Arc<dyn ChatModel>, context: &str) -> Result<TestsetRow> {
    let vars = HashMap::from([("context", context)]);
    let completion = model
        .complete(&[ChatMessage::user(prompts::render(
            prompts::TESTSET_GENERATE,
            &vars,
        ))])
        .await?;

    let mut question = None;
    let mut ground_truth = None;
    for line in completion.content.lines() {
        if let Some(rest) = line.trim().strip_prefix("QUESTION:") {
            question = Some(rest.trim().to_string());
        } else if let Some(rest) = line.trim().strip_prefix("GROUND_TRUTH:") {
            ground_truth = Some(rest.trim().to_string());
        }
    }

    match (question, ground_truth) {
        (Some(question), Some(ground_truth))
            if !question.is_empty() && !ground_truth.is_empty() =>
        {
            Ok(TestsetRow {
                question,
                ground_truth,
                reference_contexts: context.to_string(),
            })
        }
        _ => Err(anyhow!("generator response missing QUESTION/GROUND_TRUTH")),
    }
}

/// Score one row with the four judge metrics. A failed judge call scores
/// that metric 0.0 and the row continues.
async fn judge_row(
    model: &Arc<dyn ChatModel>,
    row: &TestsetRow,
    context: &str,
    answer: &str,
) -> MetricScores {
    let judge = |prompt_name: &'static str, vars: HashMap<&'static str, String>| {
        let model = model.clone();
        async move {
            let borrowed: HashMap<&str, &str> =
                vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
            let rendered = prompts::render(prompt_name, &borrowed);
            match model.complete(&[ChatMessage::user(rendered)]).await {
                Ok(completion) => parse_score(&completion.content).unwrap_or(0.0),
                Err(e) => {
                    warn!(metric = prompt_name, error = %format!("{e:#}"), "Judge call failed");
                    0.0
                }
            }
        }
    };

    let faithfulness = judge(
        prompts::JUDGE_FAITHFULNESS,
        HashMap::from([
            ("context", context.to_string()),
            ("question", row.question.clone()),
            ("answer", answer.to_string()),
        ]),
    )
    .await;
    let answer_relevancy = judge(
        prompts::JUDGE_ANSWER_RELEVANCY,
        HashMap::from([
            ("question", row.question.clone()),
            ("answer", answer.to_string()),
        ]),
    )
    .await;
    let context_recall = judge(
        prompts::JUDGE_CONTEXT_RECALL,
        HashMap::from([
            ("context", context.to_string()),
            ("ground_truth", row.ground_truth.clone()),
        ]),
    )
    .await;
    let context_precision = judge(
        prompts::JUDGE_CONTEXT_PRECISION,
        HashMap::from([
            ("context", context.to_string()),
            ("question", row.question.clone()),
            ("ground_truth", row.ground_truth.clone()),
        ]),
    )
    .await;

    MetricScores {
        faithfulness,
        answer_relevancy,
        context_recall,
        context_precision,
    }
}

/// Extract the first parseable float from a judge response, clamped to
/// [0, 1].
fn parse_score(response: &str) -> Option<f64> {
    response
        .split_whitespace()
        .find_map(|token| token.trim_matches(|c: char| !c.is_ascii_digit() && c != '.').parse::<f64>().ok())
        .map(|score| score.clamp(0.0, 1.0))
}

fn write_csv(rows: &[TestsetRow]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow!("csv flush failed: {e}"))
}

fn read_csv(bytes: &[u8]) -> Result<Vec<TestsetRow>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record.context("invalid test set row")?);
    }
    Ok(rows)
}
