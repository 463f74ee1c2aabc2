//! TOML configuration.
//!
//! Every section and every field has a default, so an empty file (or no
//! file at all, via [`Config::default`]) yields a working offline setup:
//! hashing embeddings, rule-based answers, server on `127.0.0.1:8000`.
//!
//! ```toml
//! [chunking]
//! max_chars = 1000
//! overlap_chars = 200
//!
//! [retrieval]
//! top_k = 5
//! max_context_chars = 6000
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [completion]
//! provider = "gemini"
//! model = "gemini-1.5-flash"
//!
//! [server]
//! bind = "127.0.0.1:8000"
//! auth_token = "change-me"
//! ```
//!
//! API keys are never read from this file; they come from `OPENAI_API_KEY`
//! and `GEMINI_API_KEY`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    /// Questions answered at the same time within one run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Wall-clock budget for one run, in seconds.
    #[serde(default = "default_request_budget_secs")]
    pub request_budget_secs: u64,
    /// Retries after the first attempt for transient embedding failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            max_concurrency: default_max_concurrency(),
            request_budget_secs: default_request_budget_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn request_budget(&self) -> Duration {
        Duration::from_secs(self.request_budget_secs)
    }
}

fn default_top_k() -> i64 {
    5
}
fn default_max_context_chars() -> usize {
    6000
}
fn default_max_concurrency() -> usize {
    4
}
fn default_request_budget_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    250
}
fn default_backoff_max_ms() -> u64 {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible gateway, remote Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_completion_timeout_secs(),
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_completion_provider() -> String {
    "rules".to_string()
}
fn default_temperature() -> f32 {
    0.1
}
fn default_max_tokens() -> u32 {
    512
}
fn default_completion_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Downloads larger than this are rejected.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Number of prepared documents kept. `0` disables the cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    16
}
fn default_cache_ttl_secs() -> u64 {
    900
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// When set, `POST /run` requires `Authorization: Bearer <token>`.
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            auth_token: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.max_chars {
        anyhow::bail!("chunking.overlap_chars must be smaller than chunking.max_chars");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.max_context_chars == 0 {
        anyhow::bail!("retrieval.max_context_chars must be > 0");
    }
    if config.retrieval.max_concurrency == 0 {
        anyhow::bail!("retrieval.max_concurrency must be > 0");
    }
    if config.retrieval.request_budget_secs == 0 {
        anyhow::bail!("retrieval.request_budget_secs must be > 0");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "hashing" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0");
    }

    // Validate completion
    match config.completion.provider.as_str() {
        "rules" | "disabled" | "openai" | "gemini" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be rules, disabled, openai, gemini, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let file = write_config("");
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.chunking.overlap_chars, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.max_context_chars, 6000);
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.completion.provider, "rules");
        assert!(config.completion.is_enabled());
        assert_eq!(config.cache.capacity, 16);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.server.auth_token.is_none());
    }

    #[test]
    fn test_overrides() {
        let file = write_config(
            r#"
[chunking]
max_chars = 500
overlap_chars = 50

[retrieval]
top_k = 3
request_budget_secs = 10

[completion]
provider = "gemini"
model = "gemini-1.5-flash"

[server]
bind = "0.0.0.0:9000"
auth_token = "secret"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chunking.max_chars, 500);
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.request_budget(), Duration::from_secs(10));
        assert_eq!(config.completion.provider, "gemini");
        assert_eq!(config.server.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_max() {
        let file = write_config("[chunking]\nmax_chars = 100\noverlap_chars = 100\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_rejects_zero_top_k() {
        let file = write_config("[retrieval]\ntop_k = 0\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_remote_embedding_requires_model_and_dims() {
        let file = write_config("[embedding]\nprovider = \"openai\"\n");
        assert!(load_config(file.path()).is_err());

        let file = write_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        );
        assert!(load_config(file.path()).is_ok());
    }

    #[test]
    fn test_rejects_unknown_providers() {
        let file = write_config("[embedding]\nprovider = \"magic\"\n");
        assert!(load_config(file.path()).is_err());

        let file = write_config("[completion]\nprovider = \"magic\"\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_config(Path::new("/nonexistent/pqa.toml")).is_err());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }
}
