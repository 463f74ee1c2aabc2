//! Text-completion backends used by the answer synthesizer.
//!
//! | Config Value | Backend | Endpoint |
//! |--------------|---------|----------|
//! | `"openai"` | [`OpenAICompletion`] | `POST {url}/chat/completions` |
//! | `"gemini"` | [`GeminiCompletion`] | `POST {url}/models/{model}:generateContent` |
//! | `"ollama"` | [`OllamaCompletion`] | `POST {url}/api/generate` |
//! | `"rules"` | [`RuleBasedCompletion`] | none (offline) |
//! | `"disabled"` | [`DisabledCompletion`] | none |
//!
//! Every failure (network, non-2xx status, malformed body) becomes
//! [`QaError::Synthesis`]. Completion calls are not retried; a failed call
//! degrades only the question that made it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CompletionConfig;
use crate::error::{QaError, QaResult};

/// An external capability that continues a prompt.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> QaResult<String>;
}

const SYSTEM_PROMPT: &str = "You are an expert insurance claims assistant. \
    Answer only from the policy clauses supplied in the prompt and never invent clauses.";

fn build_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

async fn send_completion_request<T: for<'de> Deserialize<'de>>(
    request: reqwest::RequestBuilder,
    service: &str,
) -> QaResult<T> {
    let resp = request
        .send()
        .await
        .map_err(|e| QaError::synthesis(format!("failed to call {}: {}", service, e)))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        return Err(QaError::synthesis(format!(
            "{} returned {}: {}",
            service, status, text
        )));
    }
    resp.json()
        .await
        .map_err(|e| QaError::synthesis(format!("failed to parse {} response: {}", service, e)))
}

// ============ OpenAI ============

pub struct OpenAICompletion {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionProvider for OpenAICompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> QaResult<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key.trim()))
            .json(&body);
        let parsed: ChatResponse = send_completion_request(request, "OpenAI").await?;
        Ok(parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

// ============ Gemini ============

pub struct GeminiCompletion {
    model: String,
    base_url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl GeminiCompletion {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| "gemini-1.5-flash".to_string()),
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiResponse {
    fn into_text(self) -> String {
        self.candidates
            .into_iter()
            .filter_map(|c| c.content)
            .next()
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl CompletionProvider for GeminiCompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> QaResult<String> {
        let body = serde_json::json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_tokens,
            },
        });
        let request = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", self.api_key.trim())
            .json(&body);
        let parsed: GeminiResponse = send_completion_request(request, "Gemini").await?;
        Ok(parsed.into_text())
    }
}

// ============ Ollama ============

pub struct OllamaCompletion {
    model: String,
    url: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OllamaCompletion {
    pub fn new(config: &CompletionConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for Ollama provider"))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    #[serde(default)]
    response: String,
}

#[async_trait]
impl CompletionProvider for OllamaCompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> QaResult<String> {
        let body = serde_json::json!({
            "model": self.model,
            "system": SYSTEM_PROMPT,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let request = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body);
        let parsed: OllamaGenerateResponse = send_completion_request(request, "Ollama").await?;
        Ok(parsed.response)
    }
}

// ============ Rules ============

/// A question topic and the clause wording that addresses it.
struct Topic {
    /// Question keywords; single words match word prefixes, phrases match substrings.
    asks: &'static [&'static str],
    /// Clause keywords, matched the same way.
    mentions: &'static [&'static str],
    found: &'static str,
    missing: &'static str,
}

/// Checked in order; the first topic whose `asks` match the question wins.
const TOPICS: &[Topic] = &[
    Topic {
        asks: &["exclu", "not covered"],
        mentions: &["exclu", "not covered", "not payable"],
        found: "The policy lists exclusions relevant to this question",
        missing: "No exclusion wording was found for this question",
    },
    Topic {
        asks: &["waiting period", "wait", "pre-existing"],
        mentions: &["waiting", "pre-existing", "month"],
        found: "Waiting periods for this are set out",
        missing: "No waiting-period wording was found for this question",
    },
    Topic {
        asks: &["maternity", "pregnan", "childbirth"],
        mentions: &["maternity", "pregnan", "child", "newborn"],
        found: "Maternity benefits are addressed",
        missing: "No maternity wording was found for this question",
    },
    Topic {
        asks: &["cosmetic", "plastic", "surgery"],
        mentions: &["cosmetic", "plastic", "surg"],
        found: "Surgical and cosmetic procedures are addressed",
        missing: "No surgery wording was found for this question",
    },
    Topic {
        asks: &["sum insured", "limit", "amount", "benefit", "how much"],
        mentions: &["sum insured", "limit", "up to", "amount", "capped", "$"],
        found: "Limits and amounts for this are specified",
        missing: "No limit or amount was found for this question",
    },
    Topic {
        asks: &["claim", "settlement", "reimburse", "cashless"],
        mentions: &["claim", "settle", "reimburse", "cashless"],
        found: "The claim procedure is described",
        missing: "No claim procedure was found for this question",
    },
    Topic {
        asks: &["premium", "payment", "grace"],
        mentions: &["premium", "payment", "grace"],
        found: "Premium and payment terms are specified",
        missing: "No premium or payment terms were found for this question",
    },
    Topic {
        asks: &["eligib", "entry age", "how old"],
        mentions: &["eligib", "age", "years old"],
        found: "Eligibility criteria are given",
        missing: "No eligibility criteria were found for this question",
    },
    Topic {
        asks: &["tenure", "duration", "renew", "policy term"],
        mentions: &["year", "term", "renew", "period"],
        found: "The policy term and renewal conditions are given",
        missing: "No policy term wording was found for this question",
    },
    Topic {
        asks: &["cover", "treatment", "medical", "hospital"],
        mentions: &["cover", "hospital", "treatment", "medical"],
        found: "Coverage for this is set out",
        missing: "No coverage wording was found for this question",
    },
];

fn matches_any(text: &str, words: &[&str], keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| {
        if kw.contains(' ') || !kw.chars().all(char::is_alphanumeric) {
            text.contains(kw)
        } else {
            words.iter().any(|w| w.starts_with(kw))
        }
    })
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect()
}

/// Indices of the clauses whose text matches any of `keywords`.
fn mentioning(clauses: &[(usize, String)], keywords: &[&str]) -> Vec<usize> {
    clauses
        .iter()
        .filter(|(_, text)| {
            let lower = text.to_lowercase();
            matches_any(&lower, &words(&lower), keywords)
        })
        .map(|(i, _)| *i)
        .collect()
}

/// Question and `(index, text)` clauses recovered from a synthesizer prompt.
fn parse_prompt(prompt: &str) -> (String, Vec<(usize, String)>) {
    let mut question = String::new();
    let mut clauses: Vec<(usize, String)> = Vec::new();
    let mut in_clauses = false;

    for line in prompt.lines() {
        if let Some(q) = line.strip_prefix("Question: ") {
            question = q.trim().to_string();
        } else if line.starts_with("Relevant Policy Clauses:") {
            in_clauses = true;
        } else if line.starts_with("Instructions:") {
            in_clauses = false;
        } else if in_clauses {
            let header = line.strip_prefix("Clause ").and_then(|rest| {
                let (index, text) = rest.split_once(':')?;
                Some((index.trim().parse::<usize>().ok()?, text.trim()))
            });
            match (header, clauses.last_mut()) {
                (Some((index, text)), _) => clauses.push((index, text.to_string())),
                (None, Some((_, text))) if !line.trim().is_empty() => {
                    text.push('\n');
                    text.push_str(line.trim());
                }
                _ => {}
            }
        }
    }
    (question, clauses)
}

fn clause_list(indices: &[usize]) -> String {
    let joined = indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    if indices.len() == 1 {
        format!("Clause {}", joined)
    } else {
        format!("Clauses {}", joined)
    }
}

/// Offline answers built from keyword rules over the clauses in the prompt.
///
/// The question is matched against a fixed table of insurance topics; the
/// answer names the clauses that mention the topic, or every clause in the
/// prompt when none do. No network access and no model.
pub struct RuleBasedCompletion;

#[async_trait]
impl CompletionProvider for RuleBasedCompletion {
    fn model_name(&self) -> &str {
        "rules"
    }

    async fn complete(&self, prompt: &str) -> QaResult<String> {
        let (question, clauses) = parse_prompt(prompt);
        if clauses.is_empty() {
            return Err(QaError::synthesis("prompt contains no policy clauses"));
        }
        let question_lower = question.to_lowercase();
        let question_words = words(&question_lower);
        let all: Vec<usize> = clauses.iter().map(|(i, _)| *i).collect();

        let topic = TOPICS
            .iter()
            .find(|t| matches_any(&question_lower, &question_words, t.asks));

        let (sentence, confidence) = match topic {
            Some(topic) => {
                let cited = mentioning(&clauses, topic.mentions);
                if cited.is_empty() {
                    (
                        format!("{}; see {}.", topic.missing, clause_list(&all)),
                        "Low",
                    )
                } else {
                    (format!("{} in {}.", topic.found, clause_list(&cited)), "Medium")
                }
            }
            None => {
                let keywords: Vec<&str> = question_words
                    .iter()
                    .copied()
                    .filter(|w| w.len() > 3)
                    .collect();
                let cited = mentioning(&clauses, &keywords);
                if cited.is_empty() {
                    (
                        format!("The closest policy wording is in {}.", clause_list(&all)),
                        "Low",
                    )
                } else {
                    (
                        format!("This is addressed in {}.", clause_list(&cited)),
                        "Low",
                    )
                }
            }
        };

        Ok(format!("{}\nConfidence: {}", sentence, confidence))
    }
}

// ============ Disabled ============

/// Placeholder for runs that should only retrieve.
///
/// Retrieval still runs; every answer comes back error-marked with
/// `synthesis`, and the report still lists the retrieved passages.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionProvider for DisabledCompletion {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn complete(&self, _prompt: &str) -> QaResult<String> {
        Err(QaError::synthesis(
            "completion provider is disabled. Set [completion] provider in config.",
        ))
    }
}

pub fn create_completion(config: &CompletionConfig) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "rules" => Ok(Arc::new(RuleBasedCompletion)),
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "openai" => Ok(Arc::new(OpenAICompletion::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiCompletion::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaCompletion::new(config)?)),
        other => anyhow::bail!("Unknown completion provider: {}", other),
    }
}
