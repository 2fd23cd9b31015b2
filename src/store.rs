//! Result persistence: the [`DocumentStore`] trait, its SQLite backend,
//! and the retrying [`ResultWriter`] used by the pipeline.
//!
//! Records are keyed by `document_id`. Writes are single-statement upserts,
//! so a record is either fully written or not written at all. When two
//! writes race for the same document, the one with the later
//! `processed_at` wins; an older write arriving late leaves the newer
//! record in place and reports [`WriteOutcome::Superseded`].
//!
//! A write whose attempts all fail is checked once more with a point lookup
//! before the failure is reported: a timed-out attempt may still have
//! committed, and a stored record must never sit behind a failed invocation.
//!
//! # Error mapping
//!
//! | sqlx error | Pipeline error |
//! |------------|----------------|
//! | `SQLITE_BUSY`, `SQLITE_LOCKED`, pool timeout, pool closed, I/O | `StoreUnavailable` (retried) |
//! | anything else | `Internal` (terminal) |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::PipelineError;
use crate::models::{DocumentRecord, ExtractionStrategy, RecordStatus};
use crate::retry::{self, Deadline, RetryPolicy, Step};

/// What an upsert did to the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// A record with a later `processed_at` is stored and was kept.
    Superseded,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Written => "written",
            WriteOutcome::Superseded => "superseded",
        }
    }
}

/// Key-value persistence of [`DocumentRecord`]s.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or overwrite the record with the same `document_id`, unless
    /// the stored one was processed later.
    async fn upsert(&self, record: &DocumentRecord) -> Result<WriteOutcome, PipelineError>;

    /// Point lookup by `document_id`.
    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, PipelineError>;

    /// Full scan, most recently processed first.
    async fn scan(&self, limit: Option<usize>) -> Result<Vec<DocumentRecord>, PipelineError>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap a pool whose schema has already been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert(&self, record: &DocumentRecord) -> Result<WriteOutcome, PipelineError> {
        let metadata_json = to_json(&record.metadata)?;
        let extraction_error_json = record.extraction_error.as_ref().map(to_json).transpose()?;
        let summary_error_json = record.summary_error.as_ref().map(to_json).transpose()?;
        let token_usage_json = record.token_usage.as_ref().map(to_json).transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents (
                document_id, bucket, object_key, object_version, upload_timestamp,
                metadata_json, raw_text, summary, text_length, summary_length,
                processed_at, processed_at_ms, status, strategy_used, fallback_applied,
                extraction_error_json, summary_error_json, summary_model_id, token_usage_json
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                bucket = excluded.bucket,
                object_key = excluded.object_key,
                object_version = excluded.object_version,
                upload_timestamp = excluded.upload_timestamp,
                metadata_json = excluded.metadata_json,
                raw_text = excluded.raw_text,
                summary = excluded.summary,
                text_length = excluded.text_length,
                summary_length = excluded.summary_length,
                processed_at = excluded.processed_at,
                processed_at_ms = excluded.processed_at_ms,
                status = excluded.status,
                strategy_used = excluded.strategy_used,
                fallback_applied = excluded.fallback_applied,
                extraction_error_json = excluded.extraction_error_json,
                summary_error_json = excluded.summary_error_json,
                summary_model_id = excluded.summary_model_id,
                token_usage_json = excluded.token_usage_json
            WHERE excluded.processed_at_ms >= documents.processed_at_ms
            "#,
        )
        .bind(&record.document_id)
        .bind(&record.bucket)
        .bind(&record.object_key)
        .bind(&record.object_version)
        .bind(record.upload_timestamp)
        .bind(&metadata_json)
        .bind(&record.raw_text)
        .bind(&record.summary)
        .bind(record.text_length as i64)
        .bind(record.summary_length as i64)
        .bind(record.processed_at.to_rfc3339())
        .bind(record.processed_at.timestamp_millis())
        .bind(record.status.as_str())
        .bind(record.strategy_used.as_str())
        .bind(record.fallback_applied)
        .bind(&extraction_error_json)
        .bind(&summary_error_json)
        .bind(&record.summary_model_id)
        .bind(&token_usage_json)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        // the conflict guard turns a stale write into a no-op
        if result.rows_affected() == 0 {
            tracing::debug!(
                document_id = %record.document_id,
                processed_at = %record.processed_at,
                "upsert superseded by a newer record"
            );
            return Ok(WriteOutcome::Superseded);
        }
        Ok(WriteOutcome::Written)
    }

    async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, PipelineError> {
        let row = sqlx::query("SELECT * FROM documents WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn scan(&self, limit: Option<usize>) -> Result<Vec<DocumentRecord>, PipelineError> {
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let rows = sqlx::query(
            "SELECT * FROM documents ORDER BY processed_at_ms DESC, document_id LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(record_from_row).collect()
    }
}

fn store_error(err: sqlx::Error) -> PipelineError {
    let transient = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes
            let primary = db
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .map(|c| c & 0xff);
            matches!(primary, Some(5) | Some(6))
        }
        _ => false,
    };
    if transient {
        PipelineError::StoreUnavailable(err.to_string())
    } else {
        PipelineError::Internal(format!("result store: {}", err))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, PipelineError> {
    serde_json::to_string(value).map_err(|e| PipelineError::Internal(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>, PipelineError> {
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| PipelineError::Internal(format!("corrupt {} column: {}", column, e)))
    })
    .transpose()
}

fn record_from_row(row: &SqliteRow) -> Result<DocumentRecord, PipelineError> {
    let column = |e: sqlx::Error| PipelineError::Internal(format!("result store row: {}", e));

    let processed_at: String = row.try_get("processed_at").map_err(column)?;
    let processed_at = DateTime::parse_from_rfc3339(&processed_at)
        .map_err(|e| PipelineError::Internal(format!("corrupt processed_at: {}", e)))?
        .with_timezone(&Utc);

    let status: String = row.try_get("status").map_err(column)?;
    let strategy: String = row.try_get("strategy_used").map_err(column)?;
    let text_length: i64 = row.try_get("text_length").map_err(column)?;
    let summary_length: i64 = row.try_get("summary_length").map_err(column)?;

    let metadata = from_json("metadata_json", Some(row.try_get("metadata_json").map_err(column)?))?
        .ok_or_else(|| PipelineError::Internal("missing metadata".to_string()))?;

    Ok(DocumentRecord {
        document_id: row.try_get("document_id").map_err(column)?,
        bucket: row.try_get("bucket").map_err(column)?,
        object_key: row.try_get("object_key").map_err(column)?,
        object_version: row.try_get("object_version").map_err(column)?,
        upload_timestamp: row.try_get("upload_timestamp").map_err(column)?,
        metadata,
        raw_text: row.try_get("raw_text").map_err(column)?,
        summary: row.try_get("summary").map_err(column)?,
        text_length: text_length as usize,
        summary_length: summary_length as usize,
        processed_at,
        status: RecordStatus::parse(&status)
            .ok_or_else(|| PipelineError::Internal(format!("unknown status {}", status)))?,
        strategy_used: ExtractionStrategy::parse(&strategy)
            .ok_or_else(|| PipelineError::Internal(format!("unknown strategy {}", strategy)))?,
        fallback_applied: row.try_get("fallback_applied").map_err(column)?,
        extraction_error: from_json(
            "extraction_error_json",
            row.try_get("extraction_error_json").map_err(column)?,
        )?,
        summary_error: from_json(
            "summary_error_json",
            row.try_get("summary_error_json").map_err(column)?,
        )?,
        summary_model_id: row.try_get("summary_model_id").map_err(column)?,
        token_usage: from_json(
            "token_usage_json",
            row.try_get("token_usage_json").map_err(column)?,
        )?,
    })
}

/// Writes records through a [`DocumentStore`], retrying `StoreUnavailable`.
/// Exhausted retries are terminal for the invocation.
pub struct ResultWriter {
    store: Arc<dyn DocumentStore>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn DocumentStore>, policy: RetryPolicy, call_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            call_timeout,
        }
    }

    pub async fn write(
        &self,
        record: &DocumentRecord,
        deadline: &Deadline,
    ) -> Result<WriteOutcome, PipelineError> {
        let written = retry::with_backoff(
            &self.policy,
            Step::Store,
            self.call_timeout,
            deadline,
            || self.store.upsert(record),
        )
        .await;

        match written {
            Ok(outcome) => {
                tracing::debug!(
                    document_id = %record.document_id,
                    outcome = outcome.as_str(),
                    "record stored"
                );
                Ok(outcome)
            }
            Err(err) => match self.confirm(record).await {
                Some(outcome) => {
                    tracing::warn!(
                        document_id = %record.document_id,
                        error = %err,
                        outcome = outcome.as_str(),
                        "write reported failure but the store holds the record"
                    );
                    Ok(outcome)
                }
                None => Err(err),
            },
        }
    }

    /// Look up what the store holds for `record` after a failed write.
    async fn confirm(&self, record: &DocumentRecord) -> Option<WriteOutcome> {
        let lookup =
            tokio::time::timeout(self.call_timeout, self.store.get(&record.document_id)).await;
        match lookup {
            Ok(Ok(Some(stored))) if stored == *record => Some(WriteOutcome::Written),
            Ok(Ok(Some(stored))) if stored.processed_at > record.processed_at => {
                Some(WriteOutcome::Superseded)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        DocumentEvent, ExtractionResult, ObjectMetadata, StepFailure, SummaryResult, TokenUsage,
    };
    use chrono::TimeZone;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> SqliteStore {
        let pool = crate::db::connect_path(&tmp.path().join("docs.sqlite"))
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn record(text: &str, processed_ms: i64) -> DocumentRecord {
        let event = DocumentEvent::new("b1", "notes/a.txt", Some("v1".to_string()));
        let metadata = ObjectMetadata {
            content_type: "text/plain".into(),
            content_length: text.len() as u64,
            last_modified: None,
            etag: Some("e1".into()),
            user: BTreeMap::from([("team".to_string(), "ops".to_string())]),
        };
        let extraction = ExtractionResult {
            text: text.to_string(),
            strategy_used: ExtractionStrategy::Direct,
            fallback_applied: false,
            extraction_error: None,
            token_usage: None,
        };
        let summary = SummaryResult {
            summary: "sum".into(),
            model_id: "m".into(),
            token_usage: TokenUsage {
                input_tokens: 4,
                output_tokens: 1,
            },
        };
        DocumentRecord::assemble(
            &event,
            metadata,
            None,
            extraction,
            Some(summary),
            None,
            Utc.timestamp_millis_opt(processed_ms).unwrap(),
        )
    }

    #[tokio::test]
    async fn upsert_then_get_returns_same_record() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let mut rec = record("hello", 1_700_000_000_000);
        rec.summary_error = Some(StepFailure {
            kind: "model_refusal".into(),
            message: "no".into(),
        });

        store.upsert(&rec).await.unwrap();
        let loaded = store.get(&rec.document_id).await.unwrap().unwrap();
        assert_eq!(loaded, rec);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn later_write_overwrites_and_older_write_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        assert_eq!(
            store.upsert(&record("first", 1_000)).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            store.upsert(&record("second", 2_000)).await.unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            store.upsert(&record("stale", 1_500)).await.unwrap(),
            WriteOutcome::Superseded
        );

        let all = store.scan(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].raw_text, "second");
    }

    #[tokio::test]
    async fn scan_orders_newest_first_and_limits() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;

        for (i, key) in ["a.txt", "b.txt", "c.txt"].iter().enumerate() {
            let mut rec = record("x", 1_000 * (i as i64 + 1));
            rec.object_key = key.to_string();
            rec.document_id = DocumentEvent::new("b1", *key, None).document_id();
            store.upsert(&rec).await.unwrap();
        }

        let keys: Vec<String> = store
            .scan(Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.object_key)
            .collect();
        assert_eq!(keys, vec!["c.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        crate::migrate::apply(store.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn rewrite_with_same_timestamp_is_written() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let rec = record("same", 1_000);
        store.upsert(&rec).await.unwrap();
        assert_eq!(store.upsert(&rec).await.unwrap(), WriteOutcome::Written);
    }

    /// Optionally commits the record, then stalls past any sane call timeout.
    struct StallingStore {
        commits: bool,
        attempts: AtomicU32,
        records: Mutex<HashMap<String, DocumentRecord>>,
    }

    impl StallingStore {
        fn new(commits: bool) -> Self {
            Self {
                commits,
                attempts: AtomicU32::new(0),
                records: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for StallingStore {
        async fn upsert(&self, record: &DocumentRecord) -> Result<WriteOutcome, PipelineError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.commits {
                self.records
                    .lock()
                    .unwrap()
                    .insert(record.document_id.clone(), record.clone());
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(WriteOutcome::Written)
        }

        async fn get(&self, document_id: &str) -> Result<Option<DocumentRecord>, PipelineError> {
            Ok(self.records.lock().unwrap().get(document_id).cloned())
        }

        async fn scan(&self, _limit: Option<usize>) -> Result<Vec<DocumentRecord>, PipelineError> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }
    }

    fn stalling_writer(store: Arc<StallingStore>) -> ResultWriter {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        ResultWriter::new(store, policy, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn timed_out_write_that_committed_is_reported_written() {
        let store = Arc::new(StallingStore::new(true));
        let writer = stalling_writer(store.clone());
        let rec = record("committed", 1_000);

        let outcome = writer
            .write(&rec, &Deadline::after(Duration::from_secs(10)))
            .await;

        assert_eq!(outcome, Ok(WriteOutcome::Written));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timed_out_write_without_commit_fails() {
        let store = Arc::new(StallingStore::new(false));
        let writer = stalling_writer(store.clone());

        let outcome = writer
            .write(&record("lost", 1_000), &Deadline::after(Duration::from_secs(10)))
            .await;

        assert!(matches!(outcome, Err(PipelineError::StoreUnavailable(_))));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pool_timeout_is_transient() {
        assert!(store_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!store_error(sqlx::Error::RowNotFound).is_retryable());
    }
}
