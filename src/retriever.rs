//! Per-document index preparation and per-question passage lookup.
//!
//! [`Retriever::prepare`] chunks a document, embeds every passage in one
//! batch, and freezes the vectors into an [`IndexHandle`].
//! [`Retriever::retrieve`] embeds a question and ranks the handle's passages.
//!
//! # Retry
//!
//! Embedding calls are retried here, not in the embedders. Only errors
//! flagged retryable (rate limits, server errors, network failures) are
//! retried, with exponential backoff:
//!
//! ```text
//! delay(n) = min(backoff_base * 2^n, backoff_max)
//! ```
//!
//! # Stage tagging
//!
//! Every error leaving `prepare` is tagged [`Stage::Ingestion`], every error
//! leaving `retrieve` is tagged [`Stage::Retrieval`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::chunk_text;
use crate::config::{ChunkingConfig, RetrievalConfig};
use crate::embedding::{check_batch, Embedder};
use crate::error::{QaError, QaResult, Stage};
use crate::index::{IndexEntry, VectorIndex};
use crate::models::{Document, Passage, RetrievalResult, ScoredPassage};

/// Bounded exponential backoff for transient embedding failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            max_delay: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op`, retrying retryable failures according to `policy`.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> QaResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QaResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                tracing::warn!(
                    operation = what,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A prepared, read-only index over one document's passages.
///
/// Shared between concurrently answered questions; nothing mutates it
/// after [`Retriever::prepare`] returns.
#[derive(Debug)]
pub struct IndexHandle {
    document_id: String,
    passages: Vec<Passage>,
    index: VectorIndex,
}

impl IndexHandle {
    /// Content hash of the document this handle was built from.
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn passages(&self) -> &[Passage] {
        &self.passages
    }

    pub fn passage_count(&self) -> usize {
        self.passages.len()
    }
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    retry: RetryPolicy,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, chunking: ChunkingConfig, retry: RetryPolicy) -> Self {
        Self {
            embedder,
            chunking,
            retry,
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Chunk, batch-embed, and index `document`.
    pub async fn prepare(&self, document: &Document) -> QaResult<IndexHandle> {
        self.prepare_inner(document)
            .await
            .map_err(|e| e.at_stage(Stage::Ingestion))
    }

    async fn prepare_inner(&self, document: &Document) -> QaResult<IndexHandle> {
        let passages = chunk_text(
            &document.text,
            self.chunking.max_chars,
            self.chunking.overlap_chars,
        )?;
        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();

        let embedder = &self.embedder;
        let batch = &texts;
        let vectors = with_backoff(&self.retry, "embed passages", move || {
            embedder.embed_batch(batch)
        })
        .await?;
        let vectors = check_batch(self.embedder.dims(), texts.len(), vectors)?;

        let entries = passages
            .iter()
            .zip(vectors)
            .map(|(passage, vector)| IndexEntry {
                passage_index: passage.index,
                vector,
            })
            .collect();
        let mut index = VectorIndex::new();
        index.build(entries)?;

        tracing::debug!(
            document_id = %document.id,
            passages = passages.len(),
            model = self.embedder.model_name(),
            "index prepared"
        );

        Ok(IndexHandle {
            document_id: document.id.clone(),
            passages,
            index,
        })
    }

    /// Return the `k` passages of `handle` most similar to `question`.
    ///
    /// `k <= 0` fails with [`QaError::InvalidArgument`] before any
    /// embedding call is made.
    pub async fn retrieve(
        &self,
        handle: &IndexHandle,
        question: &str,
        k: i64,
    ) -> QaResult<RetrievalResult> {
        self.retrieve_inner(handle, question, k)
            .await
            .map_err(|e| e.at_stage(Stage::Retrieval))
    }

    async fn retrieve_inner(
        &self,
        handle: &IndexHandle,
        question: &str,
        k: i64,
    ) -> QaResult<RetrievalResult> {
        if k <= 0 {
            return Err(QaError::invalid(format!("k must be >= 1, got {}", k)));
        }

        let embedder = &self.embedder;
        let query_vec = with_backoff(&self.retry, "embed question", move || {
            embedder.embed(question)
        })
        .await?;

        let hits = handle
            .index
            .query(&query_vec, k)?
            .into_iter()
            .filter_map(|hit| {
                handle
                    .passages
                    .get(hit.passage_index)
                    .map(|passage| ScoredPassage {
                        passage: passage.clone(),
                        score: hit.score,
                    })
            })
            .collect();

        Ok(RetrievalResult { hits })
    }
}
