// Application configuration loaded once from the environment.
// A Settings value is constructed at process init and injected into the
// component registry; nothing reads the environment after startup.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Queue the API routes structure-aware parse work onto.
pub const DOCLING_QUEUE: &str = "docling";
/// Queue for everything else.
pub const DEFAULT_QUEUE: &str = "default";

/// Process-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the blob store and embedded adapters.
    pub data_dir: PathBuf,
    /// Postgres connection string; `None` selects the in-memory store
    /// (embedded development mode).
    pub database_url: Option<String>,

    // Retrieval
    pub embedding_dim: usize,
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    // Providers
    pub default_llm_model: String,
    pub default_embed_model: String,
    pub dashscope_api_key: Option<String>,
    pub dashscope_base_url: String,
    pub deepseek_api_key: Option<String>,
    pub deepseek_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,

    // Rerank service (TEI-compatible); absent disables reranking.
    pub rerank_base_url: Option<String>,
    pub rerank_model_name: String,
    pub rerank_threshold: f32,

    // Structured parse service for PDF/DOCX; absent fails such uploads
    // at processing time.
    pub parser_base_url: Option<String>,

    // Security
    pub jwt_secret: String,
    pub access_token_ttl: Duration,

    // Quota plan defaults for newly registered users
    pub daily_request_cap: i64,
    pub daily_token_cap: i64,

    // Evaluation
    pub testset_size: usize,
}

impl Settings {
    /// Load settings from the environment, honoring a `.env` file when present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let data_dir = std::env::var("RAGDB_DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let jwt_secret = std::env::var("RAGDB_SECRET_KEY")
            .context("RAGDB_SECRET_KEY must be set (HS256 signing key)")?;

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            database_url: std::env::var("DATABASE_URL").ok(),
            embedding_dim: env_parse("RAGDB_EMBEDDING_DIM", 1024)?,
            top_k: env_parse("RAGDB_TOP_K", 5)?,
            chunk_size: env_parse("RAGDB_CHUNK_SIZE", 500)?,
            chunk_overlap: env_parse("RAGDB_CHUNK_OVERLAP", 50)?,
            default_llm_model: std::env::var("RAGDB_DEFAULT_LLM_MODEL")
                .unwrap_or_else(|_| "qwen-flash".to_string()),
            default_embed_model: std::env::var("RAGDB_DEFAULT_EMBED_MODEL")
                .unwrap_or_else(|_| "text-embedding-v4".to_string()),
            dashscope_api_key: std::env::var("DASHSCOPE_API_KEY").ok(),
            dashscope_base_url: std::env::var("DASHSCOPE_BASE_URL").unwrap_or_else(|_| {
                "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
            }),
            deepseek_api_key: std::env::var("DEEPSEEK_API_KEY").ok(),
            deepseek_base_url: std::env::var("DEEPSEEK_BASE_URL")
                .unwrap_or_else(|_| "https://api.deepseek.com".to_string()),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            openai_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            rerank_base_url: std::env::var("RERANK_BASE_URL").ok(),
            rerank_model_name: std::env::var("RERANK_MODEL_NAME")
                .unwrap_or_else(|_| "BAAI/bge-reranker-v2-m3".to_string()),
            rerank_threshold: env_parse("RERANK_THRESHOLD", 0.0)?,
            parser_base_url: std::env::var("PARSER_BASE_URL").ok(),
            jwt_secret,
            access_token_ttl: Duration::from_secs(
                env_parse("ACCESS_TOKEN_EXPIRE_MINUTES", 30u64)? * 60,
            ),
            daily_request_cap: env_parse("RAGDB_DAILY_REQUEST_CAP", 200)?,
            daily_token_cap: env_parse("RAGDB_DAILY_TOKEN_CAP", 500_000)?,
            testset_size: env_parse("RAGDB_TESTSET_SIZE", 10)?,
        })
    }

    /// Settings for tests and embedded usage: everything local, no providers.
    pub fn for_tests(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            database_url: None,
            embedding_dim: 64,
            top_k: 5,
            chunk_size: 500,
            chunk_overlap: 50,
            default_llm_model: "test-llm".to_string(),
            default_embed_model: "deterministic".to_string(),
            dashscope_api_key: None,
            dashscope_base_url: String::new(),
            deepseek_api_key: None,
            deepseek_base_url: String::new(),
            openai_api_key: None,
            openai_base_url: String::new(),
            rerank_base_url: None,
            rerank_model_name: String::new(),
            rerank_threshold: 0.0,
            parser_base_url: None,
            jwt_secret: "test-secret".to_string(),
            access_token_ttl: Duration::from_secs(30 * 60),
            daily_request_cap: 200,
            daily_token_cap: 500_000,
            testset_size: 4,
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw}")),
        Err(_) => Ok(default),
    }
}
