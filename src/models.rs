//! Core data models that flow through the document pipeline.
//!
//! ```text
//! DocumentEvent ─▶ RawObject ─▶ ExtractionResult ─▶ SummaryResult? ─▶ DocumentRecord
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;

/// An object-created notification for a single object. Consumed once per
/// pipeline invocation; duplicates are expected and converge on the same
/// [`DocumentRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEvent {
    pub bucket: String,
    pub key: String,
    pub version: Option<String>,
}

impl DocumentEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, version: Option<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            version,
        }
    }

    /// Deterministic record key for this `(bucket, key, version)` triple.
    ///
    /// Components are NUL-separated before hashing so that `("ab", "c")` and
    /// `("a", "bc")` cannot collide.
    pub fn document_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.bucket.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.key.as_bytes());
        hasher.update([0u8]);
        if let Some(ref version) = self.version {
            hasher.update(version.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

/// Bytes and metadata of a fetched object. Dropped after extraction.
#[derive(Debug, Clone)]
pub struct RawObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub content_length: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    /// User-defined `x-amz-meta-*` headers, prefix stripped.
    pub user_metadata: BTreeMap<String, String>,
}

/// Output of the format classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentClass {
    TextLike,
    ImageLike,
    PdfLike,
    Unsupported,
}

impl ContentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentClass::TextLike => "text_like",
            ContentClass::ImageLike => "image_like",
            ContentClass::PdfLike => "pdf_like",
            ContentClass::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStrategy {
    Direct,
    Vision,
}

impl ExtractionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStrategy::Direct => "direct",
            ExtractionStrategy::Vision => "vision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ExtractionStrategy::Direct),
            "vision" => Some(ExtractionStrategy::Vision),
            _ => None,
        }
    }
}

/// A non-fatal step failure recorded on the result instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
}

impl From<&PipelineError> for StepFailure {
    fn from(err: &PipelineError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Extracted text. `text` is always present, empty when extraction failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    pub text: String,
    /// The strategy that produced `text`.
    pub strategy_used: ExtractionStrategy,
    pub fallback_applied: bool,
    pub extraction_error: Option<StepFailure>,
    /// Model usage of the vision calls that produced `text`.
    pub token_usage: Option<TokenUsage>,
}

impl ExtractionResult {
    pub fn is_degraded(&self) -> bool {
        self.fallback_applied || self.extraction_error.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryResult {
    pub summary: String,
    pub model_id: String,
    pub token_usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Succeeded,
    Partial,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Succeeded => "succeeded",
            RecordStatus::Partial => "partial",
            RecordStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(RecordStatus::Succeeded),
            "partial" => Some(RecordStatus::Partial),
            "failed" => Some(RecordStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub content_length: u64,
    /// RFC 3339 timestamp, when the store reported one.
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn from_object(object: &RawObject) -> Self {
        Self {
            content_type: object.content_type.clone(),
            content_length: object.content_length,
            last_modified: object.last_modified.map(|ts| ts.to_rfc3339()),
            etag: object.etag.clone(),
            user: object.user_metadata.clone(),
        }
    }
}

/// The persisted result of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub bucket: String,
    pub object_key: String,
    pub object_version: Option<String>,
    /// Unix seconds; the object's last-modified time when known.
    pub upload_timestamp: i64,
    pub metadata: ObjectMetadata,
    pub raw_text: String,
    pub summary: String,
    pub text_length: usize,
    pub summary_length: usize,
    pub processed_at: DateTime<Utc>,
    pub status: RecordStatus,
    pub strategy_used: ExtractionStrategy,
    pub fallback_applied: bool,
    pub extraction_error: Option<StepFailure>,
    pub summary_error: Option<StepFailure>,
    pub summary_model_id: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl DocumentRecord {
    /// Assemble the record for an invocation. The status is `succeeded`
    /// only when extraction was not degraded and a summary exists.
    pub fn assemble(
        event: &DocumentEvent,
        metadata: ObjectMetadata,
        upload_timestamp: Option<DateTime<Utc>>,
        extraction: ExtractionResult,
        summary: Option<SummaryResult>,
        summary_error: Option<StepFailure>,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let status = if extraction.is_degraded() || summary.is_none() {
            RecordStatus::Partial
        } else {
            RecordStatus::Succeeded
        };

        let mut token_usage = extraction.token_usage;
        let (summary_text, summary_model_id) = match summary {
            Some(s) => {
                token_usage.get_or_insert_with(TokenUsage::default).add(s.token_usage);
                (s.summary, Some(s.model_id))
            }
            None => (String::new(), None),
        };

        Self {
            document_id: event.document_id(),
            bucket: event.bucket.clone(),
            object_key: event.key.clone(),
            object_version: event.version.clone(),
            upload_timestamp: upload_timestamp.unwrap_or(processed_at).timestamp(),
            metadata,
            text_length: text_length(&extraction.text),
            summary_length: text_length(&summary_text),
            raw_text: extraction.text,
            summary: summary_text,
            processed_at,
            status,
            strategy_used: extraction.strategy_used,
            fallback_applied: extraction.fallback_applied,
            extraction_error: extraction.extraction_error,
            summary_error,
            summary_model_id,
            token_usage,
        }
    }
}

/// Length in characters (Unicode scalar values), the unit used for
/// `text_length` and `summary_length`.
pub fn text_length(text: &str) -> usize {
    text.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extraction(text: &str, fallback: bool) -> ExtractionResult {
        ExtractionResult {
            text: text.to_string(),
            strategy_used: ExtractionStrategy::Direct,
            fallback_applied: fallback,
            extraction_error: None,
            token_usage: None,
        }
    }

    fn metadata() -> ObjectMetadata {
        ObjectMetadata {
            content_type: "text/plain".into(),
            content_length: 5,
            last_modified: None,
            etag: None,
            user: BTreeMap::new(),
        }
    }

    #[test]
    fn document_id_is_deterministic() {
        let a = DocumentEvent::new("b1", "report.pdf", None);
        let b = DocumentEvent::new("b1", "report.pdf", None);
        assert_eq!(a.document_id(), b.document_id());
        assert_eq!(a.document_id().len(), 64);
    }

    #[test]
    fn document_id_separates_components() {
        let a = DocumentEvent::new("ab", "c", None);
        let b = DocumentEvent::new("a", "bc", None);
        assert_ne!(a.document_id(), b.document_id());

        let v1 = DocumentEvent::new("b", "k", Some("1".into()));
        let v2 = DocumentEvent::new("b", "k", Some("2".into()));
        let none = DocumentEvent::new("b", "k", None);
        assert_ne!(v1.document_id(), v2.document_id());
        assert_ne!(v1.document_id(), none.document_id());
    }

    #[test]
    fn text_length_counts_chars() {
        assert_eq!(text_length("héllo"), 5);
        assert_eq!(text_length(""), 0);
    }

    #[test]
    fn assemble_succeeded_with_summary() {
        let event = DocumentEvent::new("b", "k.txt", None);
        let now = Utc::now();
        let record = DocumentRecord::assemble(
            &event,
            metadata(),
            None,
            extraction("hello", false),
            Some(SummaryResult {
                summary: "hi".into(),
                model_id: "m".into(),
                token_usage: TokenUsage::default(),
            }),
            None,
            now,
        );
        assert_eq!(record.status, RecordStatus::Succeeded);
        assert_eq!(record.text_length, 5);
        assert_eq!(record.summary_length, 2);
        assert_eq!(record.upload_timestamp, now.timestamp());
        assert_eq!(record.summary_model_id.as_deref(), Some("m"));
    }

    #[test]
    fn assemble_partial_without_summary_or_with_fallback() {
        let event = DocumentEvent::new("b", "k.txt", None);
        let record = DocumentRecord::assemble(
            &event,
            metadata(),
            None,
            extraction("", false),
            None,
            None,
            Utc::now(),
        );
        assert_eq!(record.status, RecordStatus::Partial);
        assert_eq!(record.summary_length, 0);
        assert!(record.summary.is_empty());

        let record = DocumentRecord::assemble(
            &event,
            metadata(),
            None,
            extraction("text", true),
            Some(SummaryResult {
                summary: "s".into(),
                model_id: "m".into(),
                token_usage: TokenUsage::default(),
            }),
            None,
            Utc::now(),
        );
        assert_eq!(record.status, RecordStatus::Partial);
    }

    #[test]
    fn token_usage_sums_vision_and_summary_calls() {
        let event = DocumentEvent::new("b", "scan.png", None);
        let mut vision = extraction("text", false);
        vision.strategy_used = ExtractionStrategy::Vision;
        vision.token_usage = Some(TokenUsage {
            input_tokens: 1500,
            output_tokens: 40,
        });
        let record = DocumentRecord::assemble(
            &event,
            metadata(),
            None,
            vision,
            Some(SummaryResult {
                summary: "s".into(),
                model_id: "m".into(),
                token_usage: TokenUsage {
                    input_tokens: 60,
                    output_tokens: 5,
                },
            }),
            None,
            Utc::now(),
        );
        assert_eq!(
            record.token_usage,
            Some(TokenUsage {
                input_tokens: 1560,
                output_tokens: 45,
            })
        );

        let record = DocumentRecord::assemble(
            &event,
            metadata(),
            None,
            extraction("", false),
            None,
            None,
            Utc::now(),
        );
        assert_eq!(record.token_usage, None);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RecordStatus::Succeeded,
            RecordStatus::Partial,
            RecordStatus::Failed,
        ] {
            assert_eq!(RecordStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExtractionStrategy::parse("vision"), Some(ExtractionStrategy::Vision));
        assert_eq!(ExtractionStrategy::parse("ocr"), None);
    }
}
