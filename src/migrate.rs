use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the schema on an open pool. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per (bucket, key, version), keyed by the derived document_id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            document_id TEXT PRIMARY KEY,
            bucket TEXT NOT NULL,
            object_key TEXT NOT NULL,
            object_version TEXT,
            upload_timestamp INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            raw_text TEXT NOT NULL,
            summary TEXT NOT NULL,
            text_length INTEGER NOT NULL,
            summary_length INTEGER NOT NULL,
            processed_at TEXT NOT NULL,
            processed_at_ms INTEGER NOT NULL,
            status TEXT NOT NULL,
            strategy_used TEXT NOT NULL,
            fallback_applied INTEGER NOT NULL DEFAULT 0,
            extraction_error_json TEXT,
            summary_error_json TEXT,
            summary_model_id TEXT,
            token_usage_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_processed_at ON documents(processed_at_ms DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_object ON documents(bucket, object_key)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
