//! Embedding capability abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete backends:
//! - **[`HashingEmbedder`]**: deterministic feature hashing over word tokens; offline, no model.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs a model in-process via fastembed (feature `local-embeddings-fastembed`).
//!
//! Also provides [`cosine_similarity`], the default scoring function of the
//! vector index.
//!
//! # Failure Contract
//!
//! Backends make exactly one attempt per batch. Failures surface as
//! [`QaError::EmbeddingService`], flagged retryable for transient conditions:
//! - HTTP 429 (rate limited) and 5xx (server error) → retryable
//! - HTTP 4xx (client error, not 429) → not retryable
//! - Network errors → retryable
//!
//! Retry and backoff live in the retriever. A failed call never yields a
//! zero vector in place of a real embedding.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{QaError, QaResult};

/// An external capability that maps text to fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the dimensionality every vector from this instance has.
    fn dims(&self) -> usize;

    /// Embed a batch of texts. The output is index-aligned with `texts`.
    async fn embed_batch(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>>;

    /// Embed a single text (e.g. a question).
    async fn embed(&self, text: &str) -> QaResult<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| QaError::embedding_fatal("empty embedding response"))
    }
}

/// Verify a backend response: one vector per input, each `dims` long.
pub fn check_batch(dims: usize, inputs: usize, vectors: Vec<Vec<f32>>) -> QaResult<Vec<Vec<f32>>> {
    if vectors.len() != inputs {
        return Err(QaError::embedding_fatal(format!(
            "embedding service returned {} vectors for {} inputs",
            vectors.len(),
            inputs
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(QaError::DimensionMismatch {
            expected: dims,
            actual: bad.len(),
        });
    }
    Ok(vectors)
}

// ============ Hashing Embedder ============

/// Deterministic bag-of-words embedder.
///
/// Lowercased alphanumeric tokens are hashed (FNV-1a) into `dims` signed
/// buckets and the result is L2-normalized. Texts sharing words get
/// positive cosine similarity, which is enough for tests and for running
/// the pipeline without any model.
pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for x in vec.iter_mut() {
                *x /= norm;
            }
        }
        vec
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        "hashing"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

// ============ Shared HTTP plumbing ============

fn build_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Send one request and classify the outcome per the failure contract.
async fn send_embedding_request(
    request: reqwest::RequestBuilder,
    service: &str,
) -> QaResult<serde_json::Value> {
    let response = request
        .send()
        .await
        .map_err(|e| QaError::embedding_transient(format!("{} request failed: {}", service, e)))?;

    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(|e| {
            QaError::embedding_fatal(format!("{} returned invalid JSON: {}", service, e))
        });
    }

    let body_text = response.text().await.unwrap_or_default();
    let message = format!("{} API error {}: {}", service, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(QaError::embedding_transient(message))
    } else {
        Err(QaError::embedding_fatal(message))
    }
}

fn json_to_vec(value: &serde_json::Value, what: &str) -> QaResult<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| QaError::embedding_fatal(format!("invalid response: {} is not an array", what)))?;
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| QaError::embedding_fatal(format!("invalid response: non-numeric {}", what)))
        })
        .collect()
}

// ============ OpenAI Embedder ============

/// Embedder backed by `POST /v1/embeddings`.
///
/// Requires the `OPENAI_API_KEY` environment variable. Batches larger than
/// `batch_size` are split into several requests.
pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is not in the environment.
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let base_url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            base_url,
            api_key,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let request = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body);
            let json = send_embedding_request(request, "OpenAI").await?;
            let vectors = parse_openai_response(&json)?;
            out.extend(check_batch(self.dims, batch.len(), vectors)?);
        }
        Ok(out)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index` field.
fn parse_openai_response(json: &serde_json::Value) -> QaResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| QaError::embedding_fatal("invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| QaError::embedding_fatal("invalid OpenAI response: missing embedding"))?;
        indexed.push((index, json_to_vec(embedding, "embedding")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Embedder ============

/// Embedder backed by a local Ollama instance (`POST /api/embed`).
///
/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    batch_size: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            batch_size: config.batch_size.max(1),
            url,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({
                "model": self.model,
                "input": batch,
            });
            let request = self.client.post(format!("{}/api/embed", self.url)).json(&body);
            let json = send_embedding_request(request, "Ollama").await?;
            let vectors = parse_ollama_response(&json)?;
            out.extend(check_batch(self.dims, batch.len(), vectors)?);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> QaResult<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| QaError::embedding_fatal("invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|embedding| json_to_vec(embedding, "embedding"))
        .collect()
}

// ============ Local Embedder (fastembed) ============

/// In-process embedder using fastembed.
///
/// The model is downloaded from Hugging Face on first construction and
/// cached; after that no network calls are made.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEmbedder {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "all-minilm-l6-v2".to_string());
        let (fastembed_model, default_dims) = config_to_fastembed_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        Ok(Self {
            model_name,
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size.max(1),
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> anyhow::Result<(fastembed::EmbeddingModel, usize)> {
    match name {
        "all-minilm-l6-v2" => Ok((fastembed::EmbeddingModel::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((fastembed::EmbeddingModel::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((fastembed::EmbeddingModel::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((fastembed::EmbeddingModel::BGELargeENV15, 1024)),
        "nomic-embed-text-v1.5" => Ok((fastembed::EmbeddingModel::NomicEmbedTextV15, 768)),
        other => anyhow::bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> QaResult<Vec<Vec<f32>>> {
        let model = self.model.clone();
        let batch_size = self.batch_size;
        let inputs = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| QaError::embedding_fatal("local embedding model lock poisoned"))?;
            model
                .embed(inputs, Some(batch_size))
                .map_err(|e| QaError::embedding_fatal(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| QaError::embedding_fatal(format!("local embedding task failed: {}", e)))??;

        check_batch(self.dims, texts.len(), vectors)
    }
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Embedder |
/// |-------------|----------|
/// | `"hashing"` | [`HashingEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires `local-embeddings-fastembed`) |
pub fn create_embedder(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dims.unwrap_or(256)))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => anyhow::bail!(
            "Local embedding provider requires --features local-embeddings-fastembed"
        ),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value clamped to `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or
/// zero-norm vectors.
///
/// # Formula
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(64);
        let texts = vec!["Hospitalization is covered".to_string(), "".to_string()];
        let a = embedder.embed_batch(&texts).await.unwrap();
        let b = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|v| v.len() == 64));
        assert!((a[0].iter().map(|x| x * x).sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(a[1].iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_hashing_embedder_shared_words_score_higher() {
        let embedder = HashingEmbedder::new(256);
        let q = embedder.embed("Does this policy cover hospitalization?").await.unwrap();
        let hit = embedder.embed("Hospitalization is covered up to $50,000.").await.unwrap();
        let miss = embedder.embed("Dental implants carry a separate rider.").await.unwrap();
        assert!(cosine_similarity(&q, &hit) > cosine_similarity(&q, &miss));
    }

    #[test]
    fn test_check_batch_rejects_wrong_shape() {
        let err = check_batch(3, 2, vec![vec![0.0; 3]]).unwrap_err();
        assert!(matches!(err, QaError::EmbeddingService { .. }));

        let err = check_batch(3, 2, vec![vec![0.0; 3], vec![0.0; 4]]).unwrap_err();
        assert!(matches!(
            err,
            QaError::DimensionMismatch {
                expected: 3,
                actual: 4
            }
        ));

        assert!(check_batch(3, 1, vec![vec![0.0; 3]]).is_ok());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.5], [1.0, 0.0]] });
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors.len(), 2);

        let bad = serde_json::json!({ "embedding": [] });
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn test_create_embedder_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "nope".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
