//! Core data models that flow through the question-answering pipeline.
//!
//! A [`Document`] is chunked into [`Passage`]s, the passages are ranked into a
//! [`RetrievalResult`] per question, and each question yields one [`Answer`].
//! [`RunReport`] is what the coordinator hands back to its caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{ErrorKind, QaError};

/// Where a document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentSource {
    /// `http://` or `https://` URL.
    Url(String),
    /// File on the local filesystem.
    Path(std::path::PathBuf),
    /// Text supplied inline by the caller.
    Text(String),
}

impl DocumentSource {
    /// Interpret a user-supplied string: URLs stay URLs, everything else is a path.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            DocumentSource::Url(trimmed.to_string())
        } else {
            DocumentSource::Path(std::path::PathBuf::from(trimmed))
        }
    }

    /// Short label for logs and reports.
    pub fn label(&self) -> String {
        match self {
            DocumentSource::Url(url) => url.clone(),
            DocumentSource::Path(path) => path.display().to_string(),
            DocumentSource::Text(text) => format!("inline:{}b", text.len()),
        }
    }
}

/// An ingested document. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Document {
    /// SHA-256 hex digest of `text`.
    pub id: String,
    /// Source label (URL, path, or inline marker).
    pub source: String,
    /// Extracted plain text.
    pub text: String,
    /// Bumped when the same source is re-fetched with different content.
    pub version: u64,
    pub fetched_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: content_hash(&text),
            source: source.into(),
            text,
            version: 1,
            fetched_at: Utc::now(),
        }
    }
}

/// SHA-256 hex digest used as the document identity and cache key.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A contiguous excerpt of a document.
///
/// `text == document.text[start_offset..end_offset]`, and `index` follows
/// document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Passage {
    pub index: usize,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

/// A passage paired with its similarity to a query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

/// Top-k passages for one question, best first.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredPassage>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Passages in rank order, without scores.
    pub fn passages(&self) -> Vec<Passage> {
        self.hits.iter().map(|h| h.passage.clone()).collect()
    }
}

/// Why an answer slot holds a placeholder instead of a synthesized answer.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerError {
    pub kind: ErrorKind,
    pub message: String,
}

/// The answer to one question.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// Exactly the passages that were placed in the prompt.
    pub cited_passages: Vec<Passage>,
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AnswerError>,
}

impl Answer {
    /// Placeholder answer carrying the error kind of a failed question.
    pub fn failed(err: &QaError) -> Self {
        let kind = err.kind();
        let text = match kind {
            ErrorKind::NoContext => {
                "No relevant information found in the policy document for this question."
                    .to_string()
            }
            ErrorKind::Timeout => {
                "The answer could not be produced within the request time budget.".to_string()
            }
            ErrorKind::Cancelled => {
                "The run was cancelled before this answer was produced.".to_string()
            }
            _ => format!("The answer could not be produced: {}", err),
        };
        Self {
            text,
            cited_passages: Vec::new(),
            confidence: None,
            error: Some(AnswerError {
                kind,
                message: err.to_string(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A retrieved passage as exposed in the run report.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedPassage {
    pub index: usize,
    pub text: String,
    pub score: f32,
}

impl From<&ScoredPassage> for RetrievedPassage {
    fn from(hit: &ScoredPassage) -> Self {
        Self {
            index: hit.passage.index,
            text: hit.passage.text.clone(),
            score: hit.score,
        }
    }
}

/// Everything a `run` call returns. The three per-question vectors are
/// index-aligned with the input questions.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub document_id: String,
    pub document_version: u64,
    pub passage_count: usize,
    pub cache_hit: bool,
    pub answers: Vec<Answer>,
    /// Seconds spent on each question.
    pub per_question_latency: Vec<f64>,
    pub retrieved_passages: Vec<Vec<RetrievedPassage>>,
    /// Wall-clock seconds for the whole run.
    pub processing_time: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_document_id_is_content_hash() {
        let a = Document::new("a.txt", "same text");
        let b = Document::new("b.txt", "same text");
        let c = Document::new("a.txt", "other text");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn test_source_parse() {
        assert_eq!(
            DocumentSource::parse("https://example.com/policy.pdf"),
            DocumentSource::Url("https://example.com/policy.pdf".to_string())
        );
        assert!(matches!(
            DocumentSource::parse("./policy.pdf"),
            DocumentSource::Path(_)
        ));
    }

    #[test]
    fn test_failed_answer_carries_kind() {
        let answer = Answer::failed(&QaError::NoContext);
        assert!(answer.is_error());
        assert!(answer.cited_passages.is_empty());
        assert_eq!(answer.error.as_ref().unwrap().kind, ErrorKind::NoContext);
        assert!(answer.text.contains("No relevant information"));

        let answer = Answer::failed(&QaError::Timeout(Duration::from_secs(5)));
        assert_eq!(answer.error.unwrap().kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_answer_serialization_skips_absent_error() {
        let answer = Answer {
            text: "Yes.".to_string(),
            cited_passages: Vec::new(),
            confidence: Some(0.9),
            error: None,
        };
        let json = serde_json::to_value(&answer).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["text"], "Yes.");
    }
}
