//! Grounded answer synthesis.
//!
//! # Context selection
//!
//! The question's own length is charged against `max_context_chars` first.
//! Passages arrive best-first. They are taken in that order while their
//! combined text length stays within what is left; the first passage
//! that does not fit ends the selection. Passages are never reordered or
//! skipped over, so the highest-ranked ones always make it into the prompt.
//! If even the first passage is too long, it is cut to the budget (on a
//! char boundary) and still cited.
//!
//! # Prompt
//!
//! ```text
//! You're an expert insurance claims assistant. ...
//!
//! Question: <question>
//!
//! Relevant Policy Clauses:
//! Clause 0: <text>
//!
//! Clause 3: <text>
//!
//! Instructions:
//! 1. ...
//! 5. End with a final line `Confidence: High`, `Confidence: Medium` or `Confidence: Low`.
//!
//! Answer:
//! ```
//!
//! The confidence line is parsed into [`Answer::confidence`]
//! (High 0.9, Medium 0.6, Low 0.3) and removed from the answer text.

use std::sync::Arc;

use crate::completion::CompletionProvider;
use crate::error::{QaError, QaResult};
use crate::models::{Answer, Passage};

pub struct AnswerSynthesizer {
    completion: Arc<dyn CompletionProvider>,
}

impl AnswerSynthesizer {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self { completion }
    }

    /// Answer `question` from `passages`, citing exactly the passages that
    /// were placed in the prompt.
    ///
    /// # Errors
    ///
    /// - [`QaError::NoContext`] if `passages` is empty.
    /// - [`QaError::InvalidArgument`] if `max_context_chars == 0` or the
    ///   question alone uses it up.
    /// - [`QaError::Synthesis`] if the completion call fails or returns no text.
    pub async fn synthesize(
        &self,
        question: &str,
        passages: &[Passage],
        max_context_chars: usize,
    ) -> QaResult<Answer> {
        if passages.is_empty() {
            return Err(QaError::NoContext);
        }
        if max_context_chars == 0 {
            return Err(QaError::invalid("max_context_chars must be > 0"));
        }
        let question = question.trim();
        let remaining = max_context_chars.saturating_sub(question.len());
        if remaining == 0 {
            return Err(QaError::invalid(format!(
                "question is {} bytes, max_context_chars is {}",
                question.len(),
                max_context_chars
            )));
        }

        let context = select_context(passages, remaining);
        let prompt = build_prompt(question, &context);
        tracing::debug!(
            model = self.completion.model_name(),
            passages = context.len(),
            prompt_bytes = prompt.len(),
            "requesting completion"
        );

        let raw = self.completion.complete(&prompt).await?;
        let (text, confidence) = parse_completion(&raw);
        if text.is_empty() {
            return Err(QaError::synthesis("completion returned an empty answer"));
        }

        Ok(Answer {
            text,
            cited_passages: context.iter().map(|c| c.passage.clone()).collect(),
            confidence,
            error: None,
        })
    }
}

/// A passage as it will appear in the prompt.
#[derive(Debug, Clone)]
pub struct ContextPassage<'a> {
    pub passage: &'a Passage,
    /// Full text, or a char-boundary prefix when it alone exceeds the budget.
    pub text: &'a str,
}

/// Take leading passages while their text fits in `max_chars`.
pub fn select_context(passages: &[Passage], max_chars: usize) -> Vec<ContextPassage<'_>> {
    let mut selected = Vec::new();
    let mut used = 0usize;

    for passage in passages {
        let len = passage.text.len();
        if used + len <= max_chars {
            used += len;
            selected.push(ContextPassage {
                passage,
                text: &passage.text,
            });
            continue;
        }
        if selected.is_empty() {
            let mut cut = max_chars.min(len);
            while cut > 0 && !passage.text.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut > 0 {
                selected.push(ContextPassage {
                    passage,
                    text: &passage.text[..cut],
                });
            }
        }
        break;
    }

    selected
}

pub fn build_prompt(question: &str, context: &[ContextPassage<'_>]) -> String {
    let clauses = context
        .iter()
        .map(|c| format!("Clause {}: {}", c.passage.index, c.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut prompt = String::new();
    prompt.push_str("You're an expert insurance claims assistant. Based on the following policy clauses, answer the user's question in clear terms and justify your answer using the source clauses.\n\n");
    prompt.push_str("Question: ");
    prompt.push_str(question.trim());
    prompt.push_str("\n\nRelevant Policy Clauses:\n");
    prompt.push_str(&clauses);
    prompt.push_str("\n\nInstructions:\n");
    prompt.push_str("1. Provide a clear yes/no answer if applicable\n");
    prompt.push_str("2. Reference specific clause numbers/sections\n");
    prompt.push_str("3. Keep response concise (1-2 sentences)\n");
    prompt.push_str("4. If information is insufficient, state clearly\n");
    prompt.push_str("5. End with a final line `Confidence: High`, `Confidence: Medium` or `Confidence: Low`\n");
    prompt.push_str("\nAnswer:");
    prompt
}

/// Split a raw completion into answer text and confidence.
pub fn parse_completion(raw: &str) -> (String, Option<f32>) {
    let mut confidence = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        match parse_confidence_line(line) {
            Some(value) => confidence = Some(value),
            None => lines.push(line),
        }
    }

    let text = lines.join("\n");
    let text = text.trim();
    let text = strip_prefix_ignore_case(text, "answer:").unwrap_or(text).trim();
    (text.to_string(), confidence)
}

fn parse_confidence_line(line: &str) -> Option<f32> {
    let cleaned = line.trim().trim_matches(|c: char| c == '*' || c == '_' || c == '`');
    let rest = strip_prefix_ignore_case(cleaned, "confidence")?;
    let rest = rest.trim_start_matches(|c: char| c == '*' || c.is_whitespace());
    let level = rest
        .strip_prefix(':')?
        .trim_matches(|c: char| c == '*' || c == '.' || c.is_whitespace());
    match level.to_ascii_lowercase().as_str() {
        "high" => Some(0.9),
        "medium" | "med" => Some(0.6),
        "low" => Some(0.3),
        _ => None,
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn passage(index: usize, text: &str) -> Passage {
        Passage {
            index,
            text: text.to_string(),
            start_offset: 0,
            end_offset: text.len(),
        }
    }

    /// Returns a fixed reply and records the prompt it was given.
    struct CannedCompletion {
        reply: Result<String, String>,
        last_prompt: Mutex<Option<String>>,
    }

    impl CannedCompletion {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(reply.to_string()),
                last_prompt: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl CompletionProvider for CannedCompletion {
        fn model_name(&self) -> &str {
            "canned"
        }
        async fn complete(&self, prompt: &str) -> QaResult<String> {
            *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
            self.reply.clone().map_err(QaError::synthesis)
        }
    }

    #[tokio::test]
    async fn test_cites_only_passages_in_prompt() {
        let completion = CannedCompletion::ok("Yes, per Clause 0.\nConfidence: High");
        let synth = AnswerSynthesizer::new(completion.clone());
        let passages = vec![
            passage(0, "Hospitalization is covered up to $50,000."),
            passage(4, "Room rent is capped at 1% of the sum insured."),
            passage(2, "Pre-existing conditions are excluded for 24 months."),
        ];

        let answer = synth
            .synthesize("Is hospitalization covered?", &passages, 27 + 90)
            .await
            .unwrap();

        assert_eq!(answer.text, "Yes, per Clause 0.");
        assert_eq!(answer.confidence, Some(0.9));
        let cited: Vec<usize> = answer.cited_passages.iter().map(|p| p.index).collect();
        assert_eq!(cited, vec![0, 4]);

        let prompt = completion.last_prompt.lock().unwrap().clone().unwrap();
        assert!(prompt.contains("Question: Is hospitalization covered?"));
        assert!(prompt.contains("Clause 0: Hospitalization is covered"));
        assert!(prompt.contains("Clause 4: Room rent"));
        assert!(!prompt.contains("Pre-existing"));
    }

    #[tokio::test]
    async fn test_empty_passages_is_no_context() {
        let synth = AnswerSynthesizer::new(CannedCompletion::ok("unused"));
        let err = synth.synthesize("q", &[], 100).await.unwrap_err();
        assert!(matches!(err, QaError::NoContext));
    }

    #[tokio::test]
    async fn test_completion_failure_is_synthesis_error() {
        let completion = Arc::new(CannedCompletion {
            reply: Err("upstream 500".to_string()),
            last_prompt: Mutex::new(None),
        });
        let synth = AnswerSynthesizer::new(completion);
        let err = synth
            .synthesize("q", &[passage(0, "text")], 100)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::Synthesis(_)));
    }

    #[tokio::test]
    async fn test_blank_completion_is_synthesis_error() {
        let synth = AnswerSynthesizer::new(CannedCompletion::ok("  \nConfidence: Low\n"));
        let err = synth
            .synthesize("q", &[passage(0, "text")], 100)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::Synthesis(_)));
    }

    #[tokio::test]
    async fn test_question_length_counts_against_budget() {
        let completion = CannedCompletion::ok("Clause 0.");
        let synth = AnswerSynthesizer::new(completion.clone());
        let passages = vec![passage(0, "aaaaaaaaaa"), passage(1, "bbbbbbbbbb")];

        // 20 bytes fit both passages on their own, but not next to a 5-byte question.
        let answer = synth.synthesize("Why?!", &passages, 20).await.unwrap();
        let cited: Vec<usize> = answer.cited_passages.iter().map(|p| p.index).collect();
        assert_eq!(cited, vec![0]);

        let answer = synth.synthesize("Why?!", &passages, 25).await.unwrap();
        assert_eq!(answer.cited_passages.len(), 2);
    }

    #[tokio::test]
    async fn test_question_longer_than_budget_is_invalid() {
        let synth = AnswerSynthesizer::new(CannedCompletion::ok("unused"));
        let question = "Is hospitalization covered? ".repeat(10);
        let err = synth
            .synthesize(&question, &[passage(0, "text")], 100)
            .await
            .unwrap_err();
        assert!(matches!(err, QaError::InvalidArgument(_)));
    }

    #[test]
    fn test_selection_never_skips_ahead() {
        let passages = vec![
            passage(0, "aaaaaaaaaa"),
            passage(1, "bbbbbbbbbbbbbbbbbbbb"),
            passage(2, "cc"),
        ];
        // The third passage would fit, but the second one ends the selection.
        let selected = select_context(&passages, 15);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].passage.index, 0);
    }

    #[test]
    fn test_oversized_first_passage_is_truncated() {
        let passages = vec![passage(7, "Coverage éligible everywhere")];
        let selected = select_context(&passages, 11);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].passage.index, 7);
        assert!(selected[0].text.len() <= 11);
        assert!(passages[0].text.starts_with(selected[0].text));
    }

    #[test]
    fn test_parse_completion_variants() {
        assert_eq!(
            parse_completion("Answer: No, dental is excluded (Clause 3).\n**Confidence:** Medium"),
            ("No, dental is excluded (Clause 3).".to_string(), Some(0.6))
        );
        assert_eq!(
            parse_completion("Yes.\nconfidence: low."),
            ("Yes.".to_string(), Some(0.3))
        );
        assert_eq!(
            parse_completion("  The policy does not say.  "),
            ("The policy does not say.".to_string(), None)
        );
        // A confidence mention inside the answer is not a confidence line.
        assert_eq!(
            parse_completion("Confidence intervals are not covered."),
            ("Confidence intervals are not covered.".to_string(), None)
        );
    }
}
