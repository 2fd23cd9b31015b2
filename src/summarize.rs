//! Summarization of extracted text via the generative model.
//!
//! The model sees a bounded excerpt of the text. When the text exceeds the
//! character budget, the excerpt keeps the head and the tail of the document
//! with a `[...]` marker between them, so both the introduction and the
//! conclusion survive truncation.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{LimitsConfig, ModelConfig};
use crate::error::PipelineError;
use crate::model::{GenerativeModel, ModelRequest};
use crate::models::SummaryResult;
use crate::retry::{self, Deadline, RetryPolicy, Step};

const SUMMARY_PROMPT: &str = "\
Please provide a comprehensive summary of the following document.
Include the main topics, key points, and any important details.
Keep the summary clear and well-structured.

Document text:
";

const ELISION: &str = "\n\n[...]\n\n";

/// Bounded excerpt of `text`: the whole text when it fits in `max_chars`,
/// otherwise roughly three quarters head and one quarter tail.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }

    let head_chars = max_chars * 3 / 4;
    let tail_chars = max_chars - head_chars;
    let head: String = text.chars().take(head_chars).collect();
    let tail: String = text.chars().skip(total - tail_chars).collect();
    format!("{}{}{}", head.trim_end(), ELISION, tail.trim_start())
}

pub struct Summarizer {
    model: Arc<dyn GenerativeModel>,
    policy: RetryPolicy,
    call_timeout: Duration,
    excerpt_chars: usize,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

impl Summarizer {
    pub fn new(
        model: Arc<dyn GenerativeModel>,
        policy: RetryPolicy,
        model_config: &ModelConfig,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            model,
            policy,
            call_timeout: model_config.timeout(),
            excerpt_chars: limits.summary_excerpt_chars,
            max_tokens: model_config.summary_max_tokens,
            temperature: model_config.summary_temperature,
            top_p: model_config.top_p,
        }
    }

    /// Summarize `text`. Callers skip this for empty text.
    pub async fn summarize(
        &self,
        text: &str,
        deadline: &Deadline,
    ) -> Result<SummaryResult, PipelineError> {
        let request = ModelRequest {
            prompt: format!(
                "{}{}\n\nSummary:",
                SUMMARY_PROMPT,
                excerpt(text, self.excerpt_chars)
            ),
            attachment: None,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        };

        let response = retry::with_backoff(
            &self.policy,
            Step::Summarize,
            self.call_timeout,
            deadline,
            || self.model.invoke(&request),
        )
        .await?;

        tracing::debug!(
            model = self.model.model_id(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "summary generated"
        );
        Ok(SummaryResult {
            summary: response.text,
            model_id: response.model_id,
            token_usage: response.usage,
        })
    }
}
