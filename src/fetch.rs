//! Document retrieval: URL download, local file read, or inline text.
//!
//! Every failure (unreachable host, non-2xx status, oversize body, missing
//! file, unextractable bytes) surfaces as [`QaError::Fetch`], which aborts
//! the whole run.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::config::FetchConfig;
use crate::error::{QaError, QaResult};
use crate::extract::{detect_format, extract_text, DocumentFormat};
use crate::models::DocumentSource;

/// Turns a [`DocumentSource`] into plain text.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, source: &DocumentSource) -> QaResult<String>;
}

/// The production fetcher: reqwest for URLs, tokio::fs for paths.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("policy-qa/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    async fn download(&self, url: &str) -> QaResult<String> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| QaError::fetch(format!("GET {} failed: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(QaError::fetch(format!("GET {} returned {}", url, status)));
        }
        if let Some(len) = resp.content_length() {
            if len > self.max_bytes {
                return Err(self.too_large(url));
            }
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| QaError::fetch(format!("reading {} failed: {}", url, e)))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > self.max_bytes {
                return Err(self.too_large(url));
            }
        }

        let format = detect_format(content_type.as_deref(), url, &bytes);
        tracing::debug!(url, bytes = bytes.len(), ?format, "document downloaded");
        extract(bytes, format, url).await
    }

    async fn read_file(&self, path: &Path) -> QaResult<String> {
        let label = path.display().to_string();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| QaError::fetch(format!("cannot read {}: {}", label, e)))?;
        if meta.len() > self.max_bytes {
            return Err(self.too_large(&label));
        }
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| QaError::fetch(format!("cannot read {}: {}", label, e)))?;
        let format = detect_format(None, &label, &bytes);
        extract(bytes, format, &label).await
    }

    fn too_large(&self, what: &str) -> QaError {
        QaError::fetch(format!(
            "{} exceeds the {} byte download limit",
            what, self.max_bytes
        ))
    }
}

/// PDF parsing is CPU-bound; keep it off the async workers.
async fn extract(bytes: Vec<u8>, format: DocumentFormat, label: &str) -> QaResult<String> {
    let text = tokio::task::spawn_blocking(move || extract_text(&bytes, format))
        .await
        .map_err(|e| QaError::fetch(format!("extraction task failed: {}", e)))?
        .map_err(|e| QaError::fetch(format!("{}: {}", label, e)))?;
    Ok(text)
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, source: &DocumentSource) -> QaResult<String> {
        match source {
            DocumentSource::Url(url) => self.download(url).await,
            DocumentSource::Path(path) => self.read_file(path).await,
            DocumentSource::Text(text) => Ok(text.clone()),
        }
    }
}
