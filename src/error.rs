//! Typed failure taxonomy for the document pipeline.
//!
//! Every adapter (object store, generative model, result store) maps its
//! transport errors into [`PipelineError`]. The orchestrator then decides
//! between retry, degrade-and-continue, and terminal failure from the variant
//! alone:
//!
//! | Variant | Retried | Effect when it persists |
//! |---------|---------|-------------------------|
//! | `NotFound` | no | terminal, no record |
//! | `TransientStore` | yes | terminal, no record |
//! | `ModelUnavailable` | yes | extraction falls back / summary dropped |
//! | `StoreUnavailable` | yes | terminal, no record |
//! | `Decode` | no | empty text, record is `partial` |
//! | `ModelRefusal` | no | extraction falls back / summary dropped |
//! | `UnsupportedContent` | no | extraction falls back |
//! | `DeadlineExceeded` | no | remaining retries skipped |

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("object s3://{bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("object store unavailable: {0}")]
    TransientStore(String),
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("content is not valid text: {0}")]
    Decode(String),
    #[error("model refused the request: {0}")]
    ModelRefusal(String),
    #[error("unsupported content: {0}")]
    UnsupportedContent(String),
    #[error("invocation deadline exceeded during {step}")]
    DeadlineExceeded { step: &'static str },
    #[error("configuration error: {0}")]
    Config(String),
    /// A step panicked; caught at the orchestrator boundary.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the per-step backoff loop should try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientStore(_)
                | PipelineError::ModelUnavailable(_)
                | PipelineError::StoreUnavailable(_)
        )
    }

    /// Stable snake_case tag used in logs and persisted failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::TransientStore(_) => "transient_store",
            PipelineError::ModelUnavailable(_) => "model_unavailable",
            PipelineError::StoreUnavailable(_) => "store_unavailable",
            PipelineError::Decode(_) => "decode",
            PipelineError::ModelRefusal(_) => "model_refusal",
            PipelineError::UnsupportedContent(_) => "unsupported_content",
            PipelineError::DeadlineExceeded { .. } => "deadline_exceeded",
            PipelineError::Config(_) => "config",
            PipelineError::Internal(_) => "internal",
        }
    }
}

/// Map a `reqwest` transport failure (connect, timeout, body read) to the
/// retryable error of the calling step.
pub(crate) fn transport_error(
    err: &reqwest::Error,
    wrap: fn(String) -> PipelineError,
) -> PipelineError {
    if err.is_timeout() {
        wrap(format!("request timed out: {}", err))
    } else if err.is_connect() {
        wrap(format!("connection failed: {}", err))
    } else {
        wrap(err.to_string())
    }
}

/// Truncate an HTTP error body for inclusion in an error message.
pub(crate) fn body_excerpt(body: &str) -> String {
    body.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(PipelineError::TransientStore("x".into()).is_retryable());
        assert!(PipelineError::ModelUnavailable("x".into()).is_retryable());
        assert!(PipelineError::StoreUnavailable("x".into()).is_retryable());

        assert!(!PipelineError::NotFound {
            bucket: "b".into(),
            key: "k".into()
        }
        .is_retryable());
        assert!(!PipelineError::Decode("x".into()).is_retryable());
        assert!(!PipelineError::ModelRefusal("x".into()).is_retryable());
        assert!(!PipelineError::UnsupportedContent("x".into()).is_retryable());
        assert!(!PipelineError::DeadlineExceeded { step: "fetch" }.is_retryable());
    }

    #[test]
    fn display_includes_object_reference() {
        let err = PipelineError::NotFound {
            bucket: "b1".into(),
            key: "a/b.pdf".into(),
        };
        assert_eq!(err.to_string(), "object s3://b1/a/b.pdf not found");
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn body_excerpt_is_bounded() {
        let long = "x".repeat(2000);
        assert_eq!(body_excerpt(&long).len(), 500);
    }
}
