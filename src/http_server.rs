// HTTP REST API Server
// JSON surface over the engine: auth, knowledge-base and document CRUD,
// chat sessions with unary or SSE-streamed completions, and the evaluation
// plane. Thin adapters only; behavior lives in the components.

use anyhow::Result;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query as AxumQuery, State},
    http::StatusCode,
    middleware,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Extension, Form, Router,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{self, AuthContext, AuthState};
use crate::config::Settings;
use crate::contracts::{
    upload_object_path, BlobStore, DualIndex, JobQueue, MetadataStore, NewDocument, NewKnowledge,
    NewSession, QuotaLedger, SessionUpdate,
};
use crate::errors::RagError;
use crate::evaluation::EvaluationPipeline;
use crate::models::{
    ChatSession, Document, Experiment, Knowledge, KnowledgeStatus, Membership, Message, Role,
    Testset, User, DEFAULT_SESSION_TITLE,
};
use crate::observability::{get_metrics, with_trace_id};
use crate::processor::delete_document;
use crate::rag::{ChatTurnRequest, RagOrchestrator, StreamEvent};
use crate::retriever::Strategy;
use crate::types::ValidatedEmail;
use crate::worker;

// Uploads up to 100MB; larger files are rejected at the transport.
const MAX_UPLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Application state shared across handlers: the pooled-client registry
/// built once at process init.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub store: Arc<dyn MetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub index: Arc<dyn DualIndex>,
    pub queue: Arc<dyn JobQueue>,
    pub quota: Arc<dyn QuotaLedger>,
    pub orchestrator: Arc<RagOrchestrator>,
    pub evaluation: Arc<EvaluationPipeline>,
}

// ---------------------------------------------------------------------------
// Error plumbing
// ---------------------------------------------------------------------------

/// Error response payload
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Transport-side error wrapper. Typed kinds map onto their HTTP status;
/// anything else is a 500.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match self.0.downcast_ref::<RagError>() {
            Some(kind) => (
                StatusCode::from_u16(kind.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                kind.code().to_string(),
            ),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error".into()),
        };
        if status.is_server_error() {
            warn!(error = %format!("{:#}", self.0), "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: code,
                message: format!("{:#}", self.0),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// User payload with the password hash stripped.
#[derive(Debug, Serialize)]
pub struct UserRead {
    pub id: i64,
    pub email: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub plan: String,
    pub daily_request_cap: i64,
    pub daily_token_cap: i64,
}

impl From<User> for UserRead {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            full_name: user.full_name,
            is_active: user.is_active,
            is_superuser: user.is_superuser,
            plan: user.plan,
            daily_request_cap: user.daily_request_cap,
            daily_token_cap: user.daily_token_cap,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AccessTokenForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
pub struct KnowledgeCreateRequest {
    pub name: String,
    pub description: Option<String>,
    pub embed_model: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct KnowledgeUpdateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MemberRequest {
    pub user_id: i64,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct SessionCreateRequest {
    pub knowledge_id: i64,
    pub title: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionUpdateRequest {
    pub title: Option<String>,
    pub icon: Option<String>,
    pub top_k: Option<usize>,
    pub knowledge_ids: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    pub query: String,
    pub top_k: Option<usize>,
    pub llm_model: Option<String>,
    pub strategy: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub answer: String,
    pub sources: Vec<crate::models::MessageSource>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Deserialize)]
pub struct TestsetCreateRequest {
    pub name: String,
    pub source_doc_ids: Vec<i64>,
    pub size: Option<usize>,
    pub generator_model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExperimentCreateRequest {
    pub knowledge_id: i64,
    pub testset_id: i64,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ExperimentListQuery {
    pub knowledge_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub doc_id: i64,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

fn parse_strategy(raw: Option<&str>) -> Strategy {
    match raw {
        Some("dense") => Strategy::Dense,
        Some("rerank") => Strategy::Rerank,
        _ => Strategy::Hybrid,
    }
}

// ---------------------------------------------------------------------------
// Auth routes
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<UserRead>> {
    let email = ValidatedEmail::new(&request.email)
        .map_err(|e| RagError::ConflictState(format!("{e:#}")))?;
    if state.store.get_user_by_email(email.as_str()).await?.is_some() {
        return Err(RagError::ConflictState(format!("email taken: {email}")).into());
    }

    let user = state
        .store
        .create_user(crate::contracts::NewUser {
            email: email.as_str().to_string(),
            hashed_password: auth::hash_password(&request.password)?,
            full_name: request.full_name,
            plan: "free".to_string(),
            daily_request_cap: state.settings.daily_request_cap,
            daily_token_cap: state.settings.daily_token_cap,
        })
        .await?;

    info!(user_id = user.id, "User registered");
    Ok(Json(user.into()))
}

async fn access_token(
    State(state): State<AppState>,
    Form(form): Form<AccessTokenForm>,
) -> ApiResult<Json<AccessTokenResponse>> {
    let user = state
        .store
        .get_user_by_email(&form.username)
        .await?
        .ok_or_else(|| RagError::AuthInvalid("bad credentials".to_string()))?;

    if !user.is_active || !auth::verify_password(&form.password, &user.hashed_password) {
        return Err(RagError::AuthInvalid("bad credentials".to_string()).into());
    }

    let token = auth::issue_token(
        user.id,
        &state.settings.jwt_secret,
        state.settings.access_token_ttl,
    )?;
    Ok(Json(AccessTokenResponse {
        access_token: token,
        token_type: "bearer".to_string(),
    }))
}

async fn test_token(Extension(ctx): Extension<AuthContext>) -> Json<UserRead> {
    Json(ctx.user.into())
}

// ---------------------------------------------------------------------------
// Knowledge-base routes
// ---------------------------------------------------------------------------

async fn create_knowledge(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<KnowledgeCreateRequest>,
) -> ApiResult<Json<Knowledge>> {
    let kb = state
        .store
        .create_knowledge(
            NewKnowledge {
                name: request.name,
                description: request.description,
                embed_model: request
                    .embed_model
                    .unwrap_or_else(|| state.settings.default_embed_model.clone()),
                chunk_size: request.chunk_size.unwrap_or(state.settings.chunk_size),
                chunk_overlap: request
                    .chunk_overlap
                    .unwrap_or(state.settings.chunk_overlap),
            },
            ctx.user.id,
        )
        .await?;
    Ok(Json(kb))
}

async fn list_knowledges(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<Vec<Knowledge>>> {
    Ok(Json(state.store.list_knowledge_for_user(ctx.user.id).await?))
}

async fn get_knowledge(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(knowledge_id): Path<i64>,
) -> ApiResult<Json<Knowledge>> {
    auth::require_role(&state.store, &ctx.user, knowledge_id, Role::Viewer).await?;
    let kb = state
        .store
        .get_knowledge(knowledge_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("knowledge base {knowledge_id}")))?;
    Ok(Json(kb))
}

async fn update_knowledge(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(knowledge_id): Path<i64>,
    Json(request): Json<KnowledgeUpdateRequest>,
) -> ApiResult<Json<Knowledge>> {
    auth::require_role(&state.store, &ctx.user, knowledge_id, Role::Editor).await?;
    let kb = state
        .store
        .update_knowledge(
            knowledge_id,
            crate::contracts::KnowledgeUpdate {
                name: request.name,
                description: request.description.map(Some),
            },
        )
        .await?;
    Ok(Json(kb))
}

/// Delete a knowledge base asynchronously: flip to DELETING, enqueue the
/// cascade. A failed enqueue restores the previous status so the row never
/// sticks in a transient state with no job behind it.
async fn delete_knowledge(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(knowledge_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    auth::require_role(&state.store, &ctx.user, knowledge_id, Role::Owner).await?;
    let kb = state
        .store
        .get_knowledge(knowledge_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("knowledge base {knowledge_id}")))?;
    let prior_status = kb.status;

    state
        .store
        .set_knowledge_status(knowledge_id, KnowledgeStatus::Deleting)
        .await?;

    if let Err(e) = worker::enqueue_delete_knowledge(&state.queue, knowledge_id).await {
        state
            .store
            .set_knowledge_status(knowledge_id, prior_status)
            .await
            .ok();
        return Err(e.into());
    }

    Ok(Json(serde_json::json!({
        "message": format!("knowledge base {} scheduled for deletion", kb.name)
    })))
}

async fn list_knowledge_documents(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(knowledge_id): Path<i64>,
) -> ApiResult<Json<Vec<Document>>> {
    auth::require_role(&state.store, &ctx.user, knowledge_id, Role::Viewer).await?;
    Ok(Json(state.store.list_documents(knowledge_id).await?))
}

async fn add_member(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(knowledge_id): Path<i64>,
    Json(request): Json<MemberRequest>,
) -> ApiResult<StatusCode> {
    auth::require_role(&state.store, &ctx.user, knowledge_id, Role::Owner).await?;
    state
        .store
        .get_user(request.user_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("user {}", request.user_id)))?;
    state
        .store
        .upsert_membership(Membership {
            user_id: request.user_id,
            knowledge_id,
            role: request.role,
        })
        .await?;
    Ok(StatusCode::OK)
}

async fn remove_member(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path((knowledge_id, user_id)): Path<(i64, i64)>,
) -> ApiResult<StatusCode> {
    auth::require_role(&state.store, &ctx.user, knowledge_id, Role::Owner).await?;
    state.store.remove_membership(user_id, knowledge_id).await?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Document routes
// ---------------------------------------------------------------------------

async fn upload_document(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(knowledge_id): Path<i64>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    auth::require_role(&state.store, &ctx.user, knowledge_id, Role::Editor).await?;
    let kb = state
        .store
        .get_knowledge(knowledge_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("knowledge base {knowledge_id}")))?;
    if kb.status == KnowledgeStatus::Deleting {
        return Err(RagError::ConflictState(format!(
            "knowledge base '{}' is being deleted",
            kb.name
        ))
        .into());
    }

    let mut filename = None;
    let mut bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| anyhow::anyhow!("multipart read failed: {e}"))?
    {
        if field.name() == Some("file") {
            filename = field.file_name().map(String::from);
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| anyhow::anyhow!("upload read failed: {e}"))?,
            );
        }
    }
    let filename =
        filename.ok_or_else(|| RagError::ConflictState("missing file field".to_string()))?;
    let bytes = bytes.ok_or_else(|| RagError::ConflictState("empty upload".to_string()))?;

    // Content-addressed path: same filename twice never collides.
    let blob_path = upload_object_path(knowledge_id, &filename);
    let content_hash = hex::encode(Sha256::digest(&bytes));
    state.blobs.put(&blob_path, &bytes).await?;

    let doc = state
        .store
        .create_document(NewDocument {
            knowledge_id,
            filename: filename.clone(),
            blob_path,
            content_hash: Some(content_hash),
        })
        .await?;

    // Enqueue failure must not leave a PENDING row that will never run.
    if let Err(e) = worker::enqueue_process_document(&state.queue, &filename, doc.id).await {
        state
            .store
            .fail_document(doc.id, &format!("enqueue failed: {e:#}"))
            .await
            .ok();
        return Err(e.into());
    }

    info!(doc_id = doc.id, knowledge_id, filename = %filename, "Document uploaded");
    Ok(Json(UploadResponse { doc_id: doc.id }))
}

async fn get_document(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(doc_id): Path<i64>,
) -> ApiResult<Json<Document>> {
    let doc = state
        .store
        .get_document(doc_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("document {doc_id}")))?;
    auth::require_role(&state.store, &ctx.user, doc.knowledge_id, Role::Viewer).await?;
    Ok(Json(doc))
}

/// Synchronous document delete honoring the ordering guarantee: index
/// entries, then rows, then blob.
async fn delete_document_route(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(doc_id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let doc = state
        .store
        .get_document(doc_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("document {doc_id}")))?;
    auth::require_role(&state.store, &ctx.user, doc.knowledge_id, Role::Editor).await?;

    with_trace_id(
        "delete_document",
        delete_document(&state.store, &state.blobs, &state.index, doc_id),
    )
    .await?;
    Ok(Json(serde_json::json!({ "message": "document deleted" })))
}

// ---------------------------------------------------------------------------
// Chat routes
// ---------------------------------------------------------------------------

async fn create_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<SessionCreateRequest>,
) -> ApiResult<Json<ChatSession>> {
    auth::require_role(&state.store, &ctx.user, request.knowledge_id, Role::Viewer).await?;
    let session = state
        .store
        .create_session(NewSession {
            user_id: ctx.user.id,
            knowledge_id: request.knowledge_id,
            title: request
                .title
                .unwrap_or_else(|| DEFAULT_SESSION_TITLE.to_string()),
            icon: request.icon.unwrap_or_else(|| "message-square".to_string()),
            top_k: state.settings.top_k,
        })
        .await?;
    Ok(Json(session))
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> ApiResult<Json<Vec<ChatSession>>> {
    Ok(Json(state.store.list_sessions(ctx.user.id, 0, 50).await?))
}

async fn update_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<SessionUpdateRequest>,
) -> ApiResult<Json<ChatSession>> {
    // Expanding the searchable set requires access to every added KB.
    if let Some(ids) = &request.knowledge_ids {
        for id in ids {
            auth::require_role(&state.store, &ctx.user, *id, Role::Viewer).await?;
        }
    }
    let session = state
        .store
        .update_session(
            session_id,
            ctx.user.id,
            SessionUpdate {
                title: request.title,
                icon: request.icon,
                top_k: request.top_k,
                knowledge_ids: request.knowledge_ids,
            },
        )
        .await?;
    Ok(Json(session))
}

async fn delete_session(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .store
        .soft_delete_session(session_id, ctx.user.id)
        .await?;
    Ok(StatusCode::OK)
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Message>>> {
    state
        .store
        .get_session(session_id, ctx.user.id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("session {session_id}")))?;
    Ok(Json(state.store.recent_messages(session_id, 200).await?))
}

/// One chat turn: unary JSON or an SSE stream, chosen by the request.
async fn completion(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CompletionRequest>,
) -> ApiResult<Response> {
    let session = state
        .store
        .get_session(session_id, ctx.user.id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("session {session_id}")))?;

    let turn = ChatTurnRequest {
        query: request.query,
        top_k: request.top_k,
        llm_model: request.llm_model,
        strategy: parse_strategy(request.strategy.as_deref()),
    };

    if !request.stream {
        let result = with_trace_id(
            "chat_completion",
            state.orchestrator.answer(&ctx.user, &session, turn),
        )
        .await?;
        return Ok(Json(CompletionResponse {
            answer: result.answer,
            sources: result.sources,
            input_tokens: result.usage.input_tokens,
            output_tokens: result.usage.output_tokens,
        })
        .into_response());
    }

    let rx = state
        .orchestrator
        .answer_stream(&ctx.user, &session, turn)
        .await?;

    let stream = ReceiverStream::new(rx).map(|event| match event {
        StreamEvent::Sources(sources) => Event::default().event("sources").json_data(&sources),
        StreamEvent::Token(token) => Event::default().event("message").json_data(&token),
        StreamEvent::Done {
            input_tokens,
            output_tokens,
        } => Event::default().event("usage").json_data(&serde_json::json!({
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        })),
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

// ---------------------------------------------------------------------------
// Evaluation routes
// ---------------------------------------------------------------------------

async fn create_testset(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Json(request): Json<TestsetCreateRequest>,
) -> ApiResult<Json<Testset>> {
    let testset = state.store.create_testset(&request.name).await?;

    let size = request.size.unwrap_or(state.settings.testset_size);
    let generator_model = request
        .generator_model
        .unwrap_or_else(|| state.settings.default_llm_model.clone());

    if let Err(e) = worker::enqueue_generate_testset(
        &state.queue,
        testset.id,
        &request.source_doc_ids,
        size,
        &generator_model,
    )
    .await
    {
        state
            .store
            .fail_testset(testset.id, &format!("enqueue failed: {e:#}"))
            .await
            .ok();
        return Err(e.into());
    }

    Ok(Json(testset))
}

async fn list_testsets(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
) -> ApiResult<Json<Vec<Testset>>> {
    Ok(Json(state.store.list_testsets().await?))
}

async fn get_testset(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Path(testset_id): Path<i64>,
) -> ApiResult<Json<Testset>> {
    let testset = state
        .store
        .get_testset(testset_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("testset {testset_id}")))?;
    Ok(Json(testset))
}

async fn delete_testset(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Path(testset_id): Path<i64>,
) -> ApiResult<StatusCode> {
    let testset = state
        .store
        .get_testset(testset_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("testset {testset_id}")))?;
    if let Some(blob_path) = &testset.blob_path {
        state.blobs.delete(blob_path).await.ok();
    }
    state.store.delete_testset_row(testset_id).await?;
    Ok(StatusCode::OK)
}

async fn create_experiment(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<ExperimentCreateRequest>,
) -> ApiResult<Json<Experiment>> {
    auth::require_role(&state.store, &ctx.user, request.knowledge_id, Role::Editor).await?;
    state
        .store
        .get_testset(request.testset_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("testset {}", request.testset_id)))?;

    let experiment = state
        .store
        .create_experiment(request.knowledge_id, request.testset_id, request.params)
        .await?;

    if let Err(e) = worker::enqueue_run_experiment(&state.queue, experiment.id).await {
        state
            .store
            .fail_experiment(experiment.id, &format!("enqueue failed: {e:#}"))
            .await
            .ok();
        return Err(e.into());
    }

    Ok(Json(experiment))
}

async fn list_experiments(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    AxumQuery(query): AxumQuery<ExperimentListQuery>,
) -> ApiResult<Json<Vec<Experiment>>> {
    Ok(Json(state.store.list_experiments(query.knowledge_id).await?))
}

async fn get_experiment(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Path(experiment_id): Path<i64>,
) -> ApiResult<Json<Experiment>> {
    let experiment = state
        .store
        .get_experiment(experiment_id)
        .await?
        .ok_or_else(|| RagError::NotFound(format!("experiment {experiment_id}")))?;
    Ok(Json(experiment))
}

async fn delete_experiment(
    State(state): State<AppState>,
    Extension(_ctx): Extension<AuthContext>,
    Path(experiment_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.store.delete_experiment_row(experiment_id).await?;
    Ok(StatusCode::OK)
}

// ---------------------------------------------------------------------------
// Server assembly
// ---------------------------------------------------------------------------

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Operation-counter snapshot for scrapers and debugging.
async fn metrics() -> Json<serde_json::Value> {
    Json(get_metrics())
}

/// Build the router. Everything behind the auth middleware except health
/// and the two credential routes.
pub fn create_server(state: AppState) -> Router {
    let auth_state = AuthState {
        store: state.store.clone(),
        jwt_secret: state.settings.jwt_secret.clone(),
    };

    let protected = Router::new()
        .route("/auth/test-token", post(test_token))
        .route(
            "/knowledge/knowledges",
            get(list_knowledges).post(create_knowledge),
        )
        .route(
            "/knowledge/knowledges/:id",
            get(get_knowledge)
                .put(update_knowledge)
                .delete(delete_knowledge),
        )
        .route(
            "/knowledge/knowledges/:id/documents",
            get(list_knowledge_documents),
        )
        .route("/knowledge/:kb_id/upload", post(upload_document))
        .route(
            "/knowledge/documents/:id",
            get(get_document).delete(delete_document_route),
        )
        .route("/knowledge/:kb_id/members", post(add_member))
        .route(
            "/knowledge/:kb_id/members/:user_id",
            delete(remove_member),
        )
        .route("/chat/sessions", post(create_session).get(list_sessions))
        .route(
            "/chat/sessions/:uuid",
            put(update_session).delete(delete_session),
        )
        .route("/chat/sessions/:uuid/messages", get(list_messages))
        .route("/chat/sessions/:uuid/completion", post(completion))
        .route("/evaluation/testsets", post(create_testset).get(list_testsets))
        .route(
            "/evaluation/testsets/:id",
            get(get_testset).delete(delete_testset),
        )
        .route(
            "/evaluation/experiments",
            post(create_experiment).get(list_experiments),
        )
        .route(
            "/evaluation/experiments/:id",
            get(get_experiment).delete(delete_experiment),
        )
        .layer(middleware::from_fn_with_state(auth_state, auth::auth_middleware))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/auth/register", post(register))
        .route("/auth/access-token", post(access_token))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn start_server(state: AppState, addr: &str) -> Result<()> {
    let app = create_server(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategy() {
        assert_eq!(parse_strategy(Some("dense")), Strategy::Dense);
        assert_eq!(parse_strategy(Some("rerank")), Strategy::Rerank);
        assert_eq!(parse_strategy(Some("hybrid")), Strategy::Hybrid);
        assert_eq!(parse_strategy(None), Strategy::Hybrid);
        assert_eq!(parse_strategy(Some("unknown")), Strategy::Hybrid);
    }

    #[test]
    fn test_user_read_strips_hash() {
        let user = User {
            id: 1,
            email: "a@b.co".into(),
            hashed_password: "secret-hash".into(),
            full_name: None,
            is_active: true,
            is_superuser: false,
            plan: "free".into(),
            daily_request_cap: 200,
            daily_token_cap: 500_000,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let read: UserRead = user.into();
        let json = serde_json::to_string(&read).unwrap();
        assert!(!json.contains("secret-hash"));
        assert!(json.contains("a@b.co"));
    }
}
