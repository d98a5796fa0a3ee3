// RAG Orchestrator
// One chat turn: quota gate, history window, query rewrite, hybrid
// retrieval, generation (unary or streamed through a bounded channel), and
// transactional persistence of the turn. Streaming persistence happens after
// the producer finishes, including partial turns cut off by a disconnect.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::contracts::{AssistantTurn, IndexHit, MetadataStore, QuotaLedger};
use crate::errors::RagError;
use crate::llm::{ChatMessage, ChatModel};
use crate::models::{ChatSession, Message, MessageRole, MessageSource, TokenUsage, User};
use crate::observability::{log_operation, Operation, OperationContext};
use crate::prompts;
use crate::retriever::{HybridRetriever, RetrieveOptions, Strategy};
use crate::types::{UtcDay, ValidatedTopK};

/// History window per turn.
const HISTORY_LIMIT: usize = 20;

/// Streaming channel depth; the producer blocks (backpressure) when the
/// transport cannot drain fast enough.
const STREAM_BUFFER: usize = 64;

/// Resolves a model name to a chat model. The HTTP factory builds providers
/// from settings; tests substitute scripted models.
pub trait ChatModelFactory: Send + Sync {
    fn model(&self, name: &str) -> Result<Arc<dyn ChatModel>>;
}

pub struct HttpChatModelFactory {
    settings: crate::config::Settings,
}

impl HttpChatModelFactory {
    pub fn new(settings: crate::config::Settings) -> Self {
        Self { settings }
    }
}

impl ChatModelFactory for HttpChatModelFactory {
    fn model(&self, name: &str) -> Result<Arc<dyn ChatModel>> {
        Ok(Arc::new(crate::llm::HttpChatModel::from_settings(
            name,
            &self.settings,
        )?))
    }
}

#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub llm_model: Option<String>,
    pub strategy: Strategy,
}

#[derive(Debug, Clone)]
pub struct ChatTurnResult {
    pub answer: String,
    pub sources: Vec<MessageSource>,
    pub usage: TokenUsage,
}

/// Events emitted on the streaming path, in order: one `Sources`, any number
/// of `Token`s, one terminal `Done`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Sources(Vec<MessageSource>),
    Token(String),
    Done { input_tokens: u64, output_tokens: u64 },
}

pub struct RagOrchestrator {
    store: Arc<dyn MetadataStore>,
    quota: Arc<dyn QuotaLedger>,
    retriever: Arc<HybridRetriever>,
    models: Arc<dyn ChatModelFactory>,
    default_model: String,
}

impl RagOrchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        quota: Arc<dyn QuotaLedger>,
        retriever: Arc<HybridRetriever>,
        models: Arc<dyn ChatModelFactory>,
        default_model: String,
    ) -> Self {
        Self {
            store,
            quota,
            retriever,
            models,
            default_model,
        }
    }

    /// Admit or reject the turn against the user's daily caps. The request
    /// counter increments first (its own admission is the check); the token
    /// counter is a preflight read only.
    async fn quota_gate(&self, user: &User) -> Result<()> {
        let day = UtcDay::today();

        let requests = self.quota.incr_requests(user.id, day).await?;
        if requests > user.daily_request_cap {
            return Err(RagError::QuotaExceededRequests(user.daily_request_cap).into());
        }

        let tokens = self.quota.read_tokens(user.id, day).await?;
        if tokens >= user.daily_token_cap {
            return Err(RagError::QuotaExceededTokens(user.daily_token_cap).into());
        }
        Ok(())
    }

    fn history_to_messages(history: &[Message]) -> Vec<ChatMessage> {
        history
            .iter()
            .map(|m| match m.role {
                MessageRole::User => ChatMessage::user(&m.content),
                MessageRole::Assistant => ChatMessage::assistant(&m.content),
            })
            .collect()
    }

    /// Rewrite a follow-up query into a standalone one. Any failure falls
    /// through to the original query.
    async fn rewrite_query(
        &self,
        model: &Arc<dyn ChatModel>,
        history: &[Message],
        query: &str,
    ) -> String {
        if history.is_empty() {
            return query.to_string();
        }

        let mut messages = vec![ChatMessage::system(prompts::template(prompts::QUERY_REWRITE))];
        messages.extend(Self::history_to_messages(history));
        messages.push(ChatMessage::user(query));

        match model.complete(&messages).await {
            Ok(completion) => {
                let rewritten = completion.content.trim().to_string();
                if rewritten.is_empty() {
                    return query.to_string();
                }
                info!(original = %query, rewritten = %rewritten, "Query rewritten");
                rewritten
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Query rewrite failed, using original query");
                query.to_string()
            }
        }
    }

    fn sources_from_hits(hits: &[IndexHit]) -> Vec<MessageSource> {
        hits.iter()
            .map(|h| MessageSource {
                filename: h.metadata.source.clone(),
                page_number: h.metadata.page_number,
                chunk_content: h.text.clone(),
                score: h.metadata.rerank_score.or(Some(h.score)),
            })
            .collect()
    }

    fn answer_messages(hits: &[IndexHit], question: &str) -> Vec<ChatMessage> {
        let context = hits
            .iter()
            .map(|h| h.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let vars = HashMap::from([("context", context.as_str()), ("question", question)]);
        vec![ChatMessage::user(prompts::render(prompts::RAG_ANSWER, &vars))]
    }

    /// Shared front half of a turn: gate, history, rewrite, retrieve.
    async fn prepare(
        &self,
        user: &User,
        session: &ChatSession,
        request: &ChatTurnRequest,
    ) -> Result<(Arc<dyn ChatModel>, Vec<IndexHit>)> {
        self.quota_gate(user).await?;

        let model_name = request
            .llm_model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let model = self.models.model(&model_name)?;

        let history = self
            .store
            .recent_messages(session.id, HISTORY_LIMIT)
            .await?;
        let effective_query = self
            .rewrite_query(&model, &history, &request.query)
            .await;

        let top_k = ValidatedTopK::new(request.top_k.unwrap_or(session.top_k))?;
        let hits = self
            .retriever
            .retrieve(
                &effective_query,
                &session.knowledge_ids,
                top_k,
                request.strategy,
                RetrieveOptions::default(),
            )
            .await?;

        Ok((model, hits))
    }

    /// Run one unary chat turn end to end.
    pub async fn answer(
        &self,
        user: &User,
        session: &ChatSession,
        request: ChatTurnRequest,
    ) -> Result<ChatTurnResult> {
        let ctx = OperationContext::new("chat_completion");
        let (model, hits) = self.prepare(user, session, &request).await?;
        let sources = Self::sources_from_hits(&hits);

        let completion = model
            .complete(&Self::answer_messages(&hits, &request.query))
            .await
            .context("generation failed")?;
        log_operation(
            &ctx,
            &Operation::Generate {
                model: model.model_name().to_string(),
                output_tokens: completion.usage.output_tokens,
            },
            &Ok(()),
        );

        // The assistant message persists strictly after the full answer.
        self.store
            .append_turn(
                session.id,
                &request.query,
                AssistantTurn {
                    content: completion.content.clone(),
                    sources: sources.clone(),
                    usage: completion.usage,
                    partial: false,
                },
            )
            .await?;

        self.quota
            .add_tokens(user.id, UtcDay::today(), completion.usage.total() as i64)
            .await?;

        Ok(ChatTurnResult {
            answer: completion.content,
            sources,
            usage: completion.usage,
        })
    }

    /// Run one streaming chat turn.
    ///
    /// Errors in the front half (quota, retrieval) surface before any event
    /// is emitted. Afterwards a producer task owns generation; dropping the
    /// returned receiver cancels it, and whatever was produced is still
    /// persisted with `partial = true`.
    pub async fn answer_stream(
        self: &Arc<Self>,
        user: &User,
        session: &ChatSession,
        request: ChatTurnRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let (model, hits) = self.prepare(user, session, &request).await?;
        let sources = Self::sources_from_hits(&hits);

        let (event_tx, event_rx) = mpsc::channel(STREAM_BUFFER);
        let orchestrator = self.clone();
        let session_id = session.id;
        let user_id = user.id;
        let query = request.query.clone();

        tokio::spawn(async move {
            let ctx = OperationContext::new("chat_completion_stream");
            let _ = event_tx.send(StreamEvent::Sources(sources.clone())).await;

            let (token_tx, mut token_rx) = mpsc::channel::<String>(STREAM_BUFFER);
            let messages = Self::answer_messages(&hits, &query);
            let model_name = model.model_name().to_string();
            let generator =
                tokio::spawn(async move { model.stream(&messages, token_tx).await });

            let mut answer = String::new();
            let mut disconnected = false;
            while let Some(token) = token_rx.recv().await {
                answer.push_str(&token);
                if !disconnected && event_tx.send(StreamEvent::Token(token)).await.is_err() {
                    // Transport gone. Stop forwarding; dropping the token
                    // receiver on loop exit cancels the generator.
                    disconnected = true;
                    break;
                }
            }
            drop(token_rx);

            let usage = match generator.await {
                Ok(Ok(usage)) => usage,
                Ok(Err(e)) => {
                    warn!(error = %format!("{e:#}"), "Streaming generation failed");
                    TokenUsage::default()
                }
                Err(e) => {
                    warn!(error = %e, "Generator task panicked");
                    TokenUsage::default()
                }
            };
            log_operation(
                &ctx,
                &Operation::Generate {
                    model: model_name,
                    output_tokens: usage.output_tokens,
                },
                &Ok(()),
            );

            if !disconnected {
                let _ = event_tx
                    .send(StreamEvent::Done {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    })
                    .await;
            }

            // Persist whatever was produced, after the stream terminated.
            if let Err(e) = orchestrator
                .store
                .append_turn(
                    session_id,
                    &query,
                    AssistantTurn {
                        content: answer,
                        sources,
                        usage,
                        partial: disconnected,
                    },
                )
                .await
            {
                warn!(error = %format!("{e:#}"), "Failed to persist streamed turn");
            }

            if let Err(e) = orchestrator
                .quota
                .add_tokens(user_id, UtcDay::today(), usage.total() as i64)
                .await
            {
                warn!(error = %format!("{e:#}"), "Failed to update token quota");
            }
        });

        Ok(event_rx)
    }
}
