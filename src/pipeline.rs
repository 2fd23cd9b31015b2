//! Pipeline orchestrator.
//!
//! One invocation processes one [`DocumentEvent`] through a strictly forward
//! state machine:
//!
//! ```text
//! Fetching ─▶ Classifying ─▶ Extracting ─▶ Summarizing ─▶ Storing ─▶ Done
//!    │                                                       │
//!    └──────────────────────▶ Failed ◀───────────────────────┘
//! ```
//!
//! Only two things end an invocation without a record: the fetch failing
//! (object missing, store unreachable after retries, deadline) and the
//! final write failing after retries. Extraction and summarization failures
//! degrade the record to `partial` instead.
//!
//! Every invocation emits exactly one `pipeline.invocation` info event with
//! the object reference, strategy, fallback flag, per-step timings and the
//! final status or failure kind.
//!
//! Invocations are independent. [`Pipeline::process_all`] runs a batch
//! concurrently (bounded by `pipeline.max_concurrent`); the only shared
//! state is the result store, written through per-document upserts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::classify::classify;
use crate::config::Config;
use crate::error::PipelineError;
use crate::event::{self, HandlerResponse, RecordResult};
use crate::extract::TextExtractor;
use crate::model::GenerativeModel;
use crate::models::{DocumentEvent, DocumentRecord, ObjectMetadata, StepFailure};
use crate::object_store::{ObjectFetcher, ObjectStore};
use crate::retry::{Deadline, RetryPolicy};
use crate::store::{DocumentStore, ResultWriter};
use crate::summarize::Summarizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Fetching,
    Classifying,
    Extracting,
    Summarizing,
    Storing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Fetching => "fetching",
            PipelineState::Classifying => "classifying",
            PipelineState::Extracting => "extracting",
            PipelineState::Summarizing => "summarizing",
            PipelineState::Storing => "storing",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
        }
    }
}

/// Result of one invocation: a stored record or a typed terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Stored(DocumentRecord),
    Failed {
        event: DocumentEvent,
        /// State the invocation was in when it failed.
        state: PipelineState,
        error: PipelineError,
    },
}

impl PipelineOutcome {
    pub fn record(&self) -> Option<&DocumentRecord> {
        match self {
            PipelineOutcome::Stored(record) => Some(record),
            PipelineOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&PipelineError> {
        match self {
            PipelineOutcome::Stored(_) => None,
            PipelineOutcome::Failed { error, .. } => Some(error),
        }
    }

    /// Per-record entry of the handler response.
    pub fn to_result(&self) -> RecordResult {
        match self {
            PipelineOutcome::Stored(record) => RecordResult::Processed {
                document_id: record.document_id.clone(),
                bucket: record.bucket.clone(),
                key: record.object_key.clone(),
                status: record.status.as_str().to_string(),
                text_length: record.text_length,
                summary_length: record.summary_length,
            },
            PipelineOutcome::Failed { event, error, .. } => RecordResult::Error {
                bucket: event.bucket.clone(),
                key: event.key.clone(),
                status: "error".to_string(),
                error: error.to_string(),
                error_kind: error.kind().to_string(),
            },
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StepTimings {
    fetch_ms: Option<u64>,
    extract_ms: Option<u64>,
    summarize_ms: Option<u64>,
    store_ms: Option<u64>,
}

fn millis(since: Instant) -> Option<u64> {
    Some(since.elapsed().as_millis() as u64)
}

pub struct Pipeline {
    fetcher: ObjectFetcher,
    extractor: TextExtractor,
    summarizer: Summarizer,
    writer: ResultWriter,
    deadline_budget: Duration,
    max_concurrent: usize,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        objects: Arc<dyn ObjectStore>,
        model: Arc<dyn GenerativeModel>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        Self {
            fetcher: ObjectFetcher::new(objects, policy, config.object_store.timeout()),
            extractor: TextExtractor::new(model.clone(), policy, &config.model, &config.limits),
            summarizer: Summarizer::new(model, policy, &config.model, &config.limits),
            writer: ResultWriter::new(documents, policy, config.db.timeout()),
            deadline_budget: config.pipeline.deadline(),
            max_concurrent: config.pipeline.max_concurrent,
        }
    }

    /// Run one invocation. A panic inside a step is caught here and reported
    /// as an `Internal` failure.
    pub async fn process(self: &Arc<Self>, event: &DocumentEvent) -> PipelineOutcome {
        let pipeline = Arc::clone(self);
        let owned = event.clone();
        match tokio::spawn(async move { pipeline.run(&owned).await }).await {
            Ok(outcome) => outcome,
            Err(join_err) => aborted(event.clone(), &join_err.to_string()),
        }
    }

    /// Run a batch of invocations concurrently. Outcomes are returned in
    /// event order.
    pub async fn process_all(self: &Arc<Self>, events: Vec<DocumentEvent>) -> Vec<PipelineOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for (index, event) in events.iter().cloned().enumerate() {
            let pipeline = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, pipeline.process(&event).await)
            });
        }

        let mut slots: Vec<Option<PipelineOutcome>> = vec![None; events.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(join_err) => tracing::error!(error = %join_err, "batch task aborted"),
            }
        }
        fill_aborted(events, slots)
    }

    async fn run(&self, event: &DocumentEvent) -> PipelineOutcome {
        let deadline = Deadline::after(self.deadline_budget);
        let mut timings = StepTimings::default();

        tracing::debug!(uri = %event.uri(), state = PipelineState::Fetching.as_str(), "step");
        let started = Instant::now();
        let object = match self.fetcher.fetch(event, &deadline).await {
            Ok(object) => object,
            Err(error) => {
                timings.fetch_ms = millis(started);
                return self.fail(event, PipelineState::Fetching, error, &timings, &deadline);
            }
        };
        timings.fetch_ms = millis(started);

        let class = classify(&object.content_type, &event.key);
        tracing::debug!(
            uri = %event.uri(),
            state = PipelineState::Classifying.as_str(),
            class = class.as_str(),
            "step"
        );

        tracing::debug!(uri = %event.uri(), state = PipelineState::Extracting.as_str(), "step");
        let started = Instant::now();
        let extraction = self
            .extractor
            .extract(&object, &event.key, class, &deadline)
            .await;
        timings.extract_ms = millis(started);

        let metadata = ObjectMetadata::from_object(&object);
        let last_modified = object.last_modified;
        drop(object);

        let (summary, summary_error) = if extraction.text.trim().is_empty() {
            tracing::debug!(uri = %event.uri(), "no text extracted, skipping summarization");
            (None, None)
        } else {
            tracing::debug!(uri = %event.uri(), state = PipelineState::Summarizing.as_str(), "step");
            let started = Instant::now();
            let result = self.summarizer.summarize(&extraction.text, &deadline).await;
            timings.summarize_ms = millis(started);
            match result {
                Ok(summary) => (Some(summary), None),
                Err(error) => {
                    tracing::warn!(
                        uri = %event.uri(),
                        error = %error,
                        kind = error.kind(),
                        "summarization failed, storing without summary"
                    );
                    (None, Some(StepFailure::from(&error)))
                }
            }
        };

        let record = DocumentRecord::assemble(
            event,
            metadata,
            last_modified,
            extraction,
            summary,
            summary_error,
            Utc::now(),
        );

        tracing::debug!(uri = %event.uri(), state = PipelineState::Storing.as_str(), "step");
        let started = Instant::now();
        let written = self.writer.write(&record, &deadline).await;
        timings.store_ms = millis(started);
        let write = match written {
            Ok(outcome) => outcome,
            Err(error) => {
                return self.fail(event, PipelineState::Storing, error, &timings, &deadline)
            }
        };

        tracing::info!(
            bucket = %record.bucket,
            key = %record.object_key,
            version = record.object_version.as_deref().unwrap_or(""),
            document_id = %record.document_id,
            state = PipelineState::Done.as_str(),
            write = write.as_str(),
            strategy = record.strategy_used.as_str(),
            fallback_applied = record.fallback_applied,
            summarized = record.summary_model_id.is_some(),
            status = record.status.as_str(),
            text_length = record.text_length,
            summary_length = record.summary_length,
            fetch_ms = timings.fetch_ms,
            extract_ms = timings.extract_ms,
            summarize_ms = timings.summarize_ms,
            store_ms = timings.store_ms,
            elapsed_ms = deadline.elapsed().as_millis() as u64,
            "pipeline.invocation"
        );

        PipelineOutcome::Stored(record)
    }

    fn fail(
        &self,
        event: &DocumentEvent,
        state: PipelineState,
        error: PipelineError,
        timings: &StepTimings,
        deadline: &Deadline,
    ) -> PipelineOutcome {
        tracing::error!(
            bucket = %event.bucket,
            key = %event.key,
            version = event.version.as_deref().unwrap_or(""),
            document_id = %event.document_id(),
            state = state.as_str(),
            status = PipelineState::Failed.as_str(),
            error_kind = error.kind(),
            error = %error,
            fetch_ms = timings.fetch_ms,
            extract_ms = timings.extract_ms,
            summarize_ms = timings.summarize_ms,
            store_ms = timings.store_ms,
            elapsed_ms = deadline.elapsed().as_millis() as u64,
            "pipeline.invocation"
        );
        PipelineOutcome::Failed {
            event: event.clone(),
            state,
            error,
        }
    }
}

/// Terminal outcome of an invocation whose task did not complete.
fn aborted(event: DocumentEvent, reason: &str) -> PipelineOutcome {
    let error = PipelineError::Internal(format!("invocation aborted: {}", reason));
    tracing::error!(
        bucket = %event.bucket,
        key = %event.key,
        state = PipelineState::Failed.as_str(),
        error_kind = error.kind(),
        error = %error,
        "pipeline.invocation"
    );
    PipelineOutcome::Failed {
        event,
        state: PipelineState::Failed,
        error,
    }
}

/// Pair batch results with their events; an event whose task never reported
/// back becomes an `Internal` failure so every event has an outcome.
fn fill_aborted(
    events: Vec<DocumentEvent>,
    slots: Vec<Option<PipelineOutcome>>,
) -> Vec<PipelineOutcome> {
    events
        .into_iter()
        .zip(slots)
        .map(|(event, slot)| slot.unwrap_or_else(|| aborted(event, "task did not complete")))
        .collect()
}

/// Process every object named by a notification document and build the
/// handler response. An unparseable notification yields a 500 response.
pub async fn handle_notification(pipeline: &Arc<Pipeline>, json: &str) -> HandlerResponse {
    let events = match event::parse_notification(json) {
        Ok(events) => events,
        Err(err) => {
            tracing::error!(error = %format!("{:#}", err), "rejecting notification");
            return HandlerResponse::error(&err);
        }
    };

    let outcomes = pipeline.process_all(events).await;
    HandlerResponse::processed(outcomes.iter().map(PipelineOutcome::to_result).collect())
}
