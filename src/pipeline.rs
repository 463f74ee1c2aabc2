//! Top-level orchestration of one question-answering run.
//!
//! # Flow
//!
//! ```text
//! run(source, questions, options)
//!   │
//!   ├── validate options                      (InvalidArgument → abort)
//!   ├── fetch document                        (Fetch → abort)
//!   ├── empty check                           (EmptyDocument → abort)
//!   ├── cache lookup by content hash
//!   │     └── miss: Retriever::prepare        (any error → abort)
//!   │
//!   └── for each question, at most `max_concurrency` at a time:
//!         retrieve → synthesize               (any error → error-marked Answer)
//! ```
//!
//! # Budget
//!
//! A watcher task cancels the run's [`CancellationToken`] once `budget` has
//! elapsed. The caller's own token, when given, is its parent. If the run is
//! stopped before the index is ready it fails with [`QaError::Timeout`] (or
//! [`QaError::Cancelled`] when the caller cancelled); afterwards every
//! question still in flight or still queued resolves to an answer carrying
//! that error, keeping whatever passages it had already retrieved, and the
//! report is returned with whatever finished.
//!
//! # Versions
//!
//! A URL or path source starts at version 1 and moves up whenever its
//! content hash changes. Only the most recent [`VERSION_HISTORY`] sources
//! are remembered. Inline text has no identity beyond its content, so it is
//! always version 1.

use futures::future::join_all;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::IndexCache;
use crate::completion::create_completion;
use crate::config::{Config, RetrievalConfig};
use crate::embedding::create_embedder;
use crate::error::{QaError, QaResult};
use crate::fetch::{DocumentFetcher, HttpFetcher};
use crate::models::{Answer, Document, DocumentSource, RetrievedPassage, RunReport};
use crate::retriever::{IndexHandle, RetryPolicy, Retriever};
use crate::synth::AnswerSynthesizer;

/// Per-run knobs. Defaults come from `[retrieval]`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Passages retrieved per question.
    pub k: i64,
    /// Passage text allowed into one prompt.
    pub max_context_chars: usize,
    /// Questions processed at the same time.
    pub max_concurrency: usize,
    /// Wall-clock budget for the whole run.
    pub budget: Duration,
    /// Caller-owned cancellation; cancelling it ends the run like an expired budget.
    pub cancel: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

impl RunOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            k: config.top_k,
            max_context_chars: config.max_context_chars,
            max_concurrency: config.max_concurrency,
            budget: config.request_budget(),
            cancel: None,
        }
    }

    /// Why a stopped run stopped: the caller's token, or the budget.
    fn stop_reason(&self) -> QaError {
        match &self.cancel {
            Some(cancel) if cancel.is_cancelled() => QaError::Cancelled,
            _ => QaError::Timeout(self.budget),
        }
    }

    fn validate(&self) -> QaResult<()> {
        if self.k <= 0 {
            return Err(QaError::invalid(format!("k must be >= 1, got {}", self.k)));
        }
        if self.max_context_chars == 0 {
            return Err(QaError::invalid("max_context_chars must be > 0"));
        }
        if self.max_concurrency == 0 {
            return Err(QaError::invalid("max_concurrency must be > 0"));
        }
        if self.budget.is_zero() {
            return Err(QaError::invalid("budget must be > 0"));
        }
        Ok(())
    }
}

/// Sources whose last content hash and version are remembered.
pub const VERSION_HISTORY: usize = 1024;

/// A ready index plus the document it was built from.
struct Prepared {
    document: Document,
    handle: Arc<IndexHandle>,
    cache_hit: bool,
}

pub struct PipelineCoordinator {
    fetcher: Arc<dyn DocumentFetcher>,
    retriever: Arc<Retriever>,
    synthesizer: Arc<AnswerSynthesizer>,
    cache: Option<Arc<IndexCache>>,
    defaults: RunOptions,
    /// Source label → (content hash, version) of the last fetch.
    versions: Mutex<LruCache<String, (String, u64)>>,
}

impl PipelineCoordinator {
    pub fn new(
        fetcher: Arc<dyn DocumentFetcher>,
        retriever: Arc<Retriever>,
        synthesizer: Arc<AnswerSynthesizer>,
    ) -> Self {
        Self {
            fetcher,
            retriever,
            synthesizer,
            cache: None,
            defaults: RunOptions::default(),
            versions: Mutex::new(LruCache::new(
                NonZeroUsize::new(VERSION_HISTORY).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    pub fn with_cache(mut self, cache: Arc<IndexCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_defaults(mut self, defaults: RunOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Wire up fetcher, embedder, completion backend, and cache from config.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let completion = create_completion(&config.completion)?;
        let retriever = Retriever::new(
            embedder,
            config.chunking.clone(),
            RetryPolicy::from_config(&config.retrieval),
        );
        let fetcher = HttpFetcher::new(&config.fetch)?;

        let mut coordinator = Self::new(
            Arc::new(fetcher),
            Arc::new(retriever),
            Arc::new(AnswerSynthesizer::new(completion)),
        )
        .with_defaults(RunOptions::from_config(&config.retrieval));
        if let Some(cache) = IndexCache::from_config(&config.cache) {
            coordinator = coordinator.with_cache(Arc::new(cache));
        }
        Ok(coordinator)
    }

    pub fn cache(&self) -> Option<&Arc<IndexCache>> {
        self.cache.as_ref()
    }

    /// A copy of the configured defaults, for callers that override a few fields.
    pub fn default_options(&self) -> RunOptions {
        self.defaults.clone()
    }

    /// Answer `questions` about the document at `source`.
    ///
    /// The report always holds exactly one answer per question, in input
    /// order. Only document-level failures (options, fetch, empty text,
    /// ingestion, budget exhausted before the index was ready) return `Err`.
    pub async fn run(
        &self,
        source: &DocumentSource,
        questions: &[String],
        options: RunOptions,
    ) -> QaResult<RunReport> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", %run_id);
        self.run_inner(run_id, source, questions, options)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        source: &DocumentSource,
        questions: &[String],
        options: RunOptions,
    ) -> QaResult<RunReport> {
        let started = Instant::now();
        options.validate()?;
        tracing::info!(
            source = %source.label(),
            questions = questions.len(),
            k = options.k,
            "run started"
        );

        let token = match &options.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        // Stops the watcher when this run returns, however it returns.
        let _stop_watcher = token.clone().drop_guard();
        spawn_deadline_watcher(token.clone(), options.budget);

        let loaded = tokio::select! {
            biased;
            _ = token.cancelled() => Err(options.stop_reason()),
            res = self.load(source) => res,
        };
        let prepared = loaded?;

        let semaphore = Semaphore::new(options.max_concurrency);
        let outcomes = join_all(questions.iter().map(|question| {
            self.answer_one(&prepared.handle, question, &options, &semaphore, &token)
        }))
        .await;

        let mut answers = Vec::with_capacity(outcomes.len());
        let mut per_question_latency = Vec::with_capacity(outcomes.len());
        let mut retrieved_passages = Vec::with_capacity(outcomes.len());
        for (answer, latency, retrieved) in outcomes {
            answers.push(answer);
            per_question_latency.push(latency);
            retrieved_passages.push(retrieved);
        }

        let failed = answers.iter().filter(|a| a.is_error()).count();
        let processing_time = started.elapsed().as_secs_f64();
        tracing::info!(
            document_id = %prepared.document.id,
            cache_hit = prepared.cache_hit,
            answered = answers.len() - failed,
            failed,
            processing_time,
            "run finished"
        );

        Ok(RunReport {
            run_id,
            document_id: prepared.document.id.clone(),
            document_version: prepared.document.version,
            passage_count: prepared.handle.passage_count(),
            cache_hit: prepared.cache_hit,
            answers,
            per_question_latency,
            retrieved_passages,
            processing_time,
        })
    }

    /// Fetch the document and obtain its index, from cache or freshly built.
    async fn load(&self, source: &DocumentSource) -> QaResult<Prepared> {
        let text = self.fetcher.fetch(source).await?;
        if text.trim().is_empty() {
            return Err(QaError::EmptyDocument);
        }
        let mut document = Document::new(source.label(), text);
        document.version = self.stamp_version(source, &document);

        if let Some(cache) = &self.cache {
            if let Some(handle) = cache.get(&document.id).await {
                tracing::debug!(document_id = %document.id, "index cache hit");
                return Ok(Prepared {
                    document,
                    handle,
                    cache_hit: true,
                });
            }
        }

        let handle = Arc::new(self.retriever.prepare(&document).await?);
        if let Some(cache) = &self.cache {
            cache.insert(handle.clone()).await;
        }
        Ok(Prepared {
            document,
            handle,
            cache_hit: false,
        })
    }

    /// Version 1 on first sight of a source; +1 whenever its content changes.
    fn stamp_version(&self, source: &DocumentSource, document: &Document) -> u64 {
        if matches!(source, DocumentSource::Text(_)) {
            return 1;
        }
        let mut versions = match self.versions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match versions.get_mut(&document.source) {
            Some(entry) => {
                if entry.0 != document.id {
                    entry.0 = document.id.clone();
                    entry.1 += 1;
                }
                entry.1
            }
            None => {
                versions.put(document.source.clone(), (document.id.clone(), 1));
                1
            }
        }
    }

    /// Answer one question; never fails, errors become error-marked answers.
    async fn answer_one(
        &self,
        handle: &IndexHandle,
        question: &str,
        options: &RunOptions,
        semaphore: &Semaphore,
        token: &CancellationToken,
    ) -> (Answer, f64, Vec<RetrievedPassage>) {
        let started = Instant::now();
        let mut retrieved = Vec::new();
        let finished = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            answer = self.process(handle, question, options, semaphore, &mut retrieved) => {
                Some(answer)
            }
        };
        let answer = finished.unwrap_or_else(|| Answer::failed(&options.stop_reason()));
        if let Some(err) = &answer.error {
            tracing::warn!(question, kind = %err.kind, error = %err.message, "question failed");
        }
        (answer, started.elapsed().as_secs_f64(), retrieved)
    }

    /// Retrieve then synthesize. Hits land in `retrieved` as soon as they
    /// are known, so they survive a cancelled synthesis.
    async fn process(
        &self,
        handle: &IndexHandle,
        question: &str,
        options: &RunOptions,
        semaphore: &Semaphore,
        retrieved: &mut Vec<RetrievedPassage>,
    ) -> Answer {
        let _permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Answer::failed(&QaError::synthesis("question scheduler closed")),
        };

        let retrieval = match self.retriever.retrieve(handle, question, options.k).await {
            Ok(retrieval) => retrieval,
            Err(err) => return Answer::failed(&err),
        };
        *retrieved = retrieval.hits.iter().map(RetrievedPassage::from).collect();

        match self
            .synthesizer
            .synthesize(question, &retrieval.passages(), options.max_context_chars)
            .await
        {
            Ok(answer) => answer,
            Err(err) => Answer::failed(&err),
        }
    }
}

/// Cancel `token` once `budget` has elapsed, unless it is cancelled first.
fn spawn_deadline_watcher(token: CancellationToken, budget: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(budget) => {
                tracing::warn!(budget_secs = budget.as_secs_f64(), "request budget exhausted");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::RuleBasedCompletion;
    use crate::config::{ChunkingConfig, FetchConfig};
    use crate::embedding::HashingEmbedder;

    fn coordinator() -> PipelineCoordinator {
        let retriever = Retriever::new(
            Arc::new(HashingEmbedder::new(64)),
            ChunkingConfig::default(),
            RetryPolicy::none(),
        );
        PipelineCoordinator::new(
            Arc::new(HttpFetcher::new(&FetchConfig::default()).unwrap()),
            Arc::new(retriever),
            Arc::new(AnswerSynthesizer::new(Arc::new(RuleBasedCompletion))),
        )
    }

    fn stamp(qa: &PipelineCoordinator, url: &str, text: &str) -> u64 {
        let source = DocumentSource::Url(url.to_string());
        qa.stamp_version(&source, &Document::new(source.label(), text))
    }

    #[test]
    fn test_version_follows_content_changes() {
        let qa = coordinator();
        assert_eq!(stamp(&qa, "https://a.example/p.pdf", "v1"), 1);
        assert_eq!(stamp(&qa, "https://a.example/p.pdf", "v1"), 1);
        assert_eq!(stamp(&qa, "https://a.example/p.pdf", "v2"), 2);
        assert_eq!(stamp(&qa, "https://b.example/p.pdf", "v2"), 1);
    }

    #[test]
    fn test_inline_text_is_always_version_one() {
        let qa = coordinator();
        for text in ["Dental cover A.", "Vision cover B.", "Dental cover A."] {
            let source = DocumentSource::Text(text.to_string());
            let document = Document::new(source.label(), text);
            assert_eq!(qa.stamp_version(&source, &document), 1);
        }
        assert_eq!(qa.versions.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_version_history_is_bounded() {
        let mut qa = coordinator();
        qa.versions = Mutex::new(LruCache::new(NonZeroUsize::new(2).unwrap()));

        stamp(&qa, "https://a.example/p.pdf", "one");
        stamp(&qa, "https://a.example/p.pdf", "two");
        stamp(&qa, "https://b.example/p.pdf", "one");
        stamp(&qa, "https://c.example/p.pdf", "one");

        assert_eq!(qa.versions.lock().unwrap().len(), 2);
        // The oldest source was forgotten, so it starts over.
        assert_eq!(stamp(&qa, "https://a.example/p.pdf", "three"), 1);
    }

    #[test]
    fn test_stop_reason_distinguishes_caller_cancel() {
        let options = RunOptions::default();
        assert!(matches!(options.stop_reason(), QaError::Timeout(_)));

        let cancel = CancellationToken::new();
        let options = RunOptions {
            cancel: Some(cancel.clone()),
            ..RunOptions::default()
        };
        assert!(matches!(options.stop_reason(), QaError::Timeout(_)));
        cancel.cancel();
        assert!(matches!(options.stop_reason(), QaError::Cancelled));
    }
}
