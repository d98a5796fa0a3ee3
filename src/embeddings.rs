// Embeddings Module - Pluggable embedding providers for dense retrieval
// Cloud providers speak the OpenAI-compatible /embeddings wire format; the
// deterministic provider backs tests and embedded development mode.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Configuration for embedding providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderType,
    pub model_name: String,
    pub dimension: usize,
    pub max_batch_size: usize,
    pub provider_config: ProviderConfig,
}

/// Available embedding provider types.
///
/// Adding a provider means adding a variant here and a preset in [`models`];
/// no conditionals elsewhere dispatch on model-name strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingProviderType {
    DashScope,
    OpenAI,
    Deterministic,
}

/// Provider-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProviderConfig {
    /// Any OpenAI-compatible endpoint (DashScope compatible-mode included).
    OpenAICompatible {
        api_key: String,
        api_base: String,
    },
    Deterministic,
}

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub embeddings: Vec<Vec<f32>>,
    pub model_used: String,
    pub tokens_used: Option<usize>,
}

/// Trait for embedding providers
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Generate embedding for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding returned"))
    }

    /// Get the dimension of embeddings produced by this provider
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size
    fn max_batch_size(&self) -> usize;
}

/// Deterministic embedding provider.
///
/// Projects each token into the vector space by hashing it, so texts that
/// share vocabulary land near each other. Retrieval over these vectors is
/// meaningful enough for tests and offline development without a provider
/// key; it is not a substitute for a learned model.
#[derive(Debug)]
pub struct DeterministicEmbeddingProvider {
    config: EmbeddingConfig,
}

impl DeterministicEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        if config.provider != EmbeddingProviderType::Deterministic {
            return Err(anyhow!("Config is not for the deterministic provider"));
        }
        Ok(Self { config })
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let dim = self.config.dimension;
        let mut vector = vec![0.0f32; dim];

        for token in crate::dual_index::cjk_tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let bucket = u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes")) as usize % dim;
            let sign_byte = digest[8];
            vector[bucket] += if sign_byte & 1 == 0 { 1.0 } else { -1.0 };
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for DeterministicEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let embeddings = texts.iter().map(|t| self.embed_one(t)).collect();
        Ok(EmbeddingResult {
            embeddings,
            model_used: self.config.model_name.clone(),
            tokens_used: Some(0),
        })
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }
}

/// OpenAI-compatible embedding provider (OpenAI, DashScope compatible mode)
#[derive(Debug)]
pub struct OpenAIEmbeddingProvider {
    config: EmbeddingConfig,
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAIEmbeddingProvider {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let (api_key, api_base) = match &config.provider_config {
            ProviderConfig::OpenAICompatible { api_key, api_base } => {
                (api_key.clone(), api_base.trim_end_matches('/').to_string())
            }
            ProviderConfig::Deterministic => {
                return Err(anyhow!("Config is not for an HTTP provider"))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            config,
            client,
            api_key,
            api_base,
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult {
                embeddings: Vec::new(),
                model_used: self.config.model_name.clone(),
                tokens_used: Some(0),
            });
        }

        #[derive(Serialize)]
        struct EmbeddingRequest {
            input: Vec<String>,
            model: String,
            encoding_format: String,
        }

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
            usage: Usage,
        }

        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
            index: usize,
        }

        #[derive(Deserialize)]
        struct Usage {
            total_tokens: usize,
        }

        let request = EmbeddingRequest {
            input: texts.to_vec(),
            model: self.config.model_name.clone(),
            encoding_format: "float".to_string(),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(anyhow!("Embedding API error: {}", error_text));
        }

        let embedding_response: EmbeddingResponse = response.json().await?;

        // Sort embeddings by index to maintain input order
        let mut sorted_data = embedding_response.data;
        sorted_data.sort_by_key(|d| d.index);

        let embeddings = sorted_data.into_iter().map(|d| d.embedding).collect();

        Ok(EmbeddingResult {
            embeddings,
            model_used: self.config.model_name.clone(),
            tokens_used: Some(embedding_response.usage.total_tokens),
        })
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }
}

/// Embedding service that manages a provider and a query cache
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let provider: Arc<dyn EmbeddingProvider> = match config.provider {
            EmbeddingProviderType::Deterministic => {
                Arc::new(DeterministicEmbeddingProvider::new(config)?)
            }
            EmbeddingProviderType::DashScope | EmbeddingProviderType::OpenAI => {
                Arc::new(OpenAIEmbeddingProvider::new(config)?)
            }
        };

        Ok(Self {
            provider,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Generate embedding for a single text with caching.
    /// Queries repeat far more than chunks, so only this path caches.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        {
            let cache = self.cache.read().await;
            if let Some(embedding) = cache.get(text) {
                return Ok(embedding.clone());
            }
        }

        let embedding = self.provider.embed_text(text).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(text.to_string(), embedding.clone());
        }

        Ok(embedding)
    }

    /// Generate embeddings for multiple texts in deterministic provider-sized
    /// batches, preserving input order.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        let batch_size = self.provider.max_batch_size().max(1);
        let mut embeddings = Vec::with_capacity(texts.len());
        let mut tokens_used = 0usize;

        for batch in texts.chunks(batch_size) {
            let result = self.provider.embed_texts(batch).await?;
            if result.embeddings.len() != batch.len() {
                return Err(anyhow!(
                    "Provider returned {} embeddings for a batch of {}",
                    result.embeddings.len(),
                    batch.len()
                ));
            }
            embeddings.extend(result.embeddings);
            tokens_used += result.tokens_used.unwrap_or(0);
        }

        Ok(EmbeddingResult {
            embeddings,
            model_used: self.provider.model_name().to_string(),
            tokens_used: Some(tokens_used),
        })
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }
}

/// Resolves a knowledge base's embed-model name to a shared service.
///
/// Services are built lazily and cached per model, so concurrent ingestion
/// jobs for knowledge bases sharing a model share one client and one cache.
pub struct EmbedderRegistry {
    settings: crate::config::Settings,
    services: RwLock<HashMap<String, Arc<EmbeddingService>>>,
}

impl EmbedderRegistry {
    pub fn new(settings: crate::config::Settings) -> Self {
        Self {
            settings,
            services: RwLock::new(HashMap::new()),
        }
    }

    fn config_for(&self, model: &str) -> Result<EmbeddingConfig> {
        if model == "deterministic" {
            return Ok(models::deterministic(self.settings.embedding_dim));
        }
        if model.starts_with("text-embedding-v") {
            let key = self
                .settings
                .dashscope_api_key
                .clone()
                .ok_or_else(|| anyhow!("DASHSCOPE_API_KEY required for model {model}"))?;
            let mut config =
                models::dashscope_text_embedding_v4(key, self.settings.dashscope_base_url.clone());
            config.model_name = model.to_string();
            config.dimension = self.settings.embedding_dim;
            return Ok(config);
        }
        if model.starts_with("text-embedding-3") {
            let key = self
                .settings
                .openai_api_key
                .clone()
                .ok_or_else(|| anyhow!("OPENAI_API_KEY required for model {model}"))?;
            let mut config =
                models::openai_text_embedding_3_small(key, self.settings.openai_base_url.clone());
            config.model_name = model.to_string();
            config.dimension = self.settings.embedding_dim;
            return Ok(config);
        }
        Err(anyhow!("Unknown embedding model: {model}"))
    }

    pub async fn for_model(&self, model: &str) -> Result<Arc<EmbeddingService>> {
        {
            let services = self.services.read().await;
            if let Some(service) = services.get(model) {
                return Ok(service.clone());
            }
        }

        let service = Arc::new(EmbeddingService::new(self.config_for(model)?)?);
        let mut services = self.services.write().await;
        Ok(services
            .entry(model.to_string())
            .or_insert(service)
            .clone())
    }
}

/// Predefined model configurations
pub mod models {
    use super::*;

    /// DashScope text-embedding-v4 via the compatible-mode endpoint (1024 dims)
    pub fn dashscope_text_embedding_v4(api_key: String, api_base: String) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: EmbeddingProviderType::DashScope,
            model_name: "text-embedding-v4".to_string(),
            dimension: 1024,
            max_batch_size: 10,
            provider_config: ProviderConfig::OpenAICompatible { api_key, api_base },
        }
    }

    /// OpenAI text-embedding-3-small (1536 dimensions)
    pub fn openai_text_embedding_3_small(api_key: String, api_base: String) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: EmbeddingProviderType::OpenAI,
            model_name: "text-embedding-3-small".to_string(),
            dimension: 1536,
            max_batch_size: 2048,
            provider_config: ProviderConfig::OpenAICompatible { api_key, api_base },
        }
    }

    /// Deterministic hash embeddings for tests and embedded development
    pub fn deterministic(dimension: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: EmbeddingProviderType::Deterministic,
            model_name: "deterministic".to_string(),
            dimension,
            max_batch_size: 32,
            provider_config: ProviderConfig::Deterministic,
        }
    }
}
