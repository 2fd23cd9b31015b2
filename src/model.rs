//! Generative model abstraction and the Bedrock implementation.
//!
//! Defines the [`GenerativeModel`] trait used by both the vision extractor
//! and the summarizer, and [`BedrockModel`], which calls the Bedrock
//! `InvokeModel` API with an Anthropic messages body:
//!
//! ```json
//! {
//!   "anthropic_version": "bedrock-2023-05-31",
//!   "max_tokens": 8000,
//!   "temperature": 0.1,
//!   "top_p": 0.9,
//!   "messages": [{ "role": "user", "content": [
//!     { "type": "text", "text": "..." },
//!     { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "..." } }
//!   ]}]
//! }
//! ```
//!
//! # Error mapping
//!
//! - HTTP 429, 408, 5xx, timeouts, connection errors → `ModelUnavailable` (retried)
//! - HTTP 400, 413, 415, 422 → `UnsupportedContent`
//! - HTTP 401, 403, 404 → `Config`
//! - `stop_reason == "refusal"` or a response without text → `ModelRefusal`

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};

use crate::aws::{self, AwsCredentials, Endpoint, RequestParts};
use crate::config::ModelConfig;
use crate::error::{body_excerpt, transport_error, PipelineError};
use crate::models::TokenUsage;

const ANTHROPIC_VERSION: &str = "bedrock-2023-05-31";

/// How binary input is presented to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Document,
}

#[derive(Debug, Clone)]
pub struct Attachment<'a> {
    pub kind: AttachmentKind,
    pub media_type: &'a str,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct ModelRequest<'a> {
    pub prompt: String,
    pub attachment: Option<Attachment<'a>>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub model_id: String,
    pub usage: TokenUsage,
}

/// A callable generative-AI inference service.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Model identifier recorded on summaries.
    fn model_id(&self) -> &str;

    /// Run one inference call. No retries happen here; callers wrap this in
    /// [`crate::retry::with_backoff`].
    async fn invoke(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, PipelineError>;
}

/// Bedrock runtime client for Anthropic models.
pub struct BedrockModel {
    client: reqwest::Client,
    creds: AwsCredentials,
    model_id: String,
    region: String,
    endpoint: Endpoint,
}

impl BedrockModel {
    pub fn new(config: &ModelConfig, creds: AwsCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        let endpoint = match config.endpoint_url {
            Some(ref url) => Endpoint::parse(url),
            None => Endpoint::https(format!("bedrock-runtime.{}.amazonaws.com", config.region)),
        };
        Ok(Self {
            client,
            creds,
            model_id: config.model_id.clone(),
            region: config.region.clone(),
            endpoint,
        })
    }
}

#[async_trait]
impl GenerativeModel for BedrockModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn invoke(&self, request: &ModelRequest<'_>) -> Result<ModelResponse, PipelineError> {
        let body = serde_json::to_vec(&build_body(request))
            .map_err(|e| PipelineError::Internal(format!("failed to encode request: {}", e)))?;

        let extra_headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ];
        let signed = aws::sign(
            &self.creds,
            &RequestParts {
                method: "POST",
                endpoint: &self.endpoint,
                path_segments: &["model", self.model_id.as_str(), "invoke"],
                query: &[],
                extra_headers: &extra_headers,
                payload: &body,
                region: &self.region,
                service: "bedrock",
            },
            Utc::now(),
        );

        let mut req = self.client.post(&signed.url).body(body);
        for (name, value) in &signed.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&e, PipelineError::ModelUnavailable))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(&e, PipelineError::ModelUnavailable))?;

        if !status.is_success() {
            return Err(classify_invoke_failure(status.as_u16(), &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| {
            PipelineError::ModelUnavailable(format!("malformed model response: {}", e))
        })?;
        parse_response(&self.model_id, &json)
    }
}

/// Build the Anthropic messages request body.
pub fn build_body(request: &ModelRequest<'_>) -> Value {
    let mut content = vec![json!({ "type": "text", "text": request.prompt })];
    if let Some(ref attachment) = request.attachment {
        let block_type = match attachment.kind {
            AttachmentKind::Image => "image",
            AttachmentKind::Document => "document",
        };
        content.push(json!({
            "type": block_type,
            "source": {
                "type": "base64",
                "media_type": attachment.media_type,
                "data": BASE64_STANDARD.encode(attachment.bytes),
            }
        }));
    }

    json!({
        "anthropic_version": ANTHROPIC_VERSION,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
        "top_p": request.top_p,
        "messages": [{ "role": "user", "content": content }],
    })
}

/// Parse an Anthropic messages response into a [`ModelResponse`].
pub fn parse_response(model_id: &str, json: &Value) -> Result<ModelResponse, PipelineError> {
    let stop_reason = json
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if stop_reason == "refusal" {
        return Err(PipelineError::ModelRefusal(
            "model declined to process the content".to_string(),
        ));
    }

    let text: String = json
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(PipelineError::ModelRefusal(
            "empty response from model".to_string(),
        ));
    }

    let usage = json
        .get("usage")
        .map(|u| TokenUsage {
            input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        })
        .unwrap_or_default();

    let model_id = json
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(model_id)
        .to_string();

    Ok(ModelResponse {
        text,
        model_id,
        usage,
    })
}

fn classify_invoke_failure(status: u16, body: &str) -> PipelineError {
    let message = format!("Bedrock InvokeModel failed (HTTP {}): {}", status, body_excerpt(body));
    match status {
        408 | 429 => PipelineError::ModelUnavailable(message),
        s if s >= 500 => PipelineError::ModelUnavailable(message),
        401 | 403 | 404 => PipelineError::Config(message),
        _ => PipelineError::UnsupportedContent(message),
    }
}
