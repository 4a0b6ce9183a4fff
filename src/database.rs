use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;

use crate::attempt::{Attempt, AttemptStatus};
use crate::failure::PipelineError;

/// Append-only record of every processing attempt.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Durable once this returns `Ok`.
    async fn append(&self, attempt: &Attempt) -> Result<(), PipelineError>;

    /// Whether an attempt was already recorded for this mailbox message.
    async fn exists_for(&self, message_id: &str) -> Result<bool, PipelineError>;

    async fn count(&self) -> Result<u64, PipelineError>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

const COLUMNS: &str = "process_id, message_id, datetime, email_sender, email_subject, \
    email_content, extracted_link, status, error_details, final_result";

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self> {
        info!("Opening result store {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Unable to open SQLite database {}", path.display()))?;

        // Create the table and indexes on first use
        let store = SqliteStore { pool };
        store.create_tables_if_not_exists().await?;
        Ok(store)
    }

    async fn create_tables_if_not_exists(&self) -> Result<()> {
        debug!("Checking/creating rpa_records table");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rpa_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                process_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                datetime TEXT NOT NULL,
                email_sender TEXT NOT NULL,
                email_subject TEXT NOT NULL,
                email_content TEXT NOT NULL,
                extracted_link TEXT,
                status TEXT NOT NULL,
                error_details TEXT,
                final_result TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Unable to create rpa_records table")?;

        for (name, ddl) in [
            (
                "process_id",
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_rpa_records_process_id ON rpa_records (process_id)",
            ),
            (
                "message_id",
                "CREATE INDEX IF NOT EXISTS idx_rpa_records_message_id ON rpa_records (message_id)",
            ),
            (
                "datetime",
                "CREATE INDEX IF NOT EXISTS idx_rpa_records_datetime ON rpa_records (datetime DESC)",
            ),
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Unable to create index on {}", name))?;
        }

        Ok(())
    }

    /// Most recent attempts first.
    pub async fn recent(&self, limit: u32) -> Result<Vec<Attempt>, PipelineError> {
        let sql = format!(
            "SELECT {} FROM rpa_records ORDER BY datetime DESC, id DESC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row_to_attempt(row).map_err(PipelineError::from)).collect()
    }

    /// Most recent non-successful attempts first.
    pub async fn failures(&self, limit: u32) -> Result<Vec<Attempt>, PipelineError> {
        let sql = format!(
            "SELECT {} FROM rpa_records WHERE status <> ? ORDER BY datetime DESC, id DESC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(AttemptStatus::Success.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| row_to_attempt(row).map_err(PipelineError::from)).collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn append(&self, attempt: &Attempt) -> Result<(), PipelineError> {
        let sql = format!(
            "INSERT INTO rpa_records ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(&attempt.process_id)
            .bind(&attempt.message_id)
            .bind(attempt.timestamp)
            .bind(&attempt.sender)
            .bind(&attempt.subject)
            .bind(&attempt.content)
            .bind(&attempt.extracted_target)
            .bind(attempt.status.as_str())
            .bind(&attempt.detailed_error)
            .bind(&attempt.final_result)
            .execute(&self.pool)
            .await?;

        debug!(
            "Recorded {} for message {} ({})",
            attempt.process_id, attempt.message_id, attempt.status
        );
        Ok(())
    }

    async fn exists_for(&self, message_id: &str) -> Result<bool, PipelineError> {
        let found = sqlx::query("SELECT 1 FROM rpa_records WHERE message_id = ? LIMIT 1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn count(&self) -> Result<u64, PipelineError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rpa_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn row_to_attempt(row: &SqliteRow) -> Result<Attempt, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = AttemptStatus::parse(&status)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown attempt status '{}'", status).into()))?;
    let timestamp: DateTime<Utc> = row.try_get("datetime")?;

    Ok(Attempt {
        process_id: row.try_get("process_id")?,
        message_id: row.try_get("message_id")?,
        timestamp,
        sender: row.try_get("email_sender")?,
        subject: row.try_get("email_subject")?,
        content: row.try_get("email_content")?,
        extracted_target: row.try_get("extracted_link")?,
        status,
        detailed_error: row.try_get("error_details")?,
        final_result: row.try_get("final_result")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn attempt(message_id: &str, status: AttemptStatus, minutes_ago: i64) -> Attempt {
        let now = Utc::now() - Duration::minutes(minutes_ago);
        Attempt {
            process_id: crate::attempt::new_process_id(now),
            message_id: message_id.to_string(),
            timestamp: now,
            sender: "Alice <alice@example.com>".to_string(),
            subject: "Please confirm".to_string(),
            content: "https://svc.example/confirm?id=42".to_string(),
            extracted_target: Some("https://svc.example/confirm?id=42".to_string()),
            status,
            detailed_error: (!status.is_success()).then(|| "boom".to_string()),
            final_result: None,
        }
    }

    #[tokio::test]
    async fn test_append_and_dedup_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("rpa.db")).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 0);
        assert!(!store.exists_for("1:42").await.unwrap());

        assert_ok!(store.append(&attempt("1:42", AttemptStatus::Success, 0)).await);

        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.exists_for("1:42").await.unwrap());
        assert!(!store.exists_for("1:43").await.unwrap());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpa.db");

        let written = attempt("1:7", AttemptStatus::Timeout, 0);
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.append(&written).await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].process_id, written.process_id);
        assert_eq!(recent[0].status, AttemptStatus::Timeout);
        assert_eq!(recent[0].timestamp, written.timestamp);
        assert_eq!(recent[0].extracted_target, written.extracted_target);
    }

    #[tokio::test]
    async fn test_duplicate_process_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("rpa.db")).await.unwrap();

        let record = attempt("1:1", AttemptStatus::Success, 0);
        assert_ok!(store.append(&record).await);
        let err = assert_err!(store.append(&record).await);
        assert!(matches!(err, PipelineError::Store(_)));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recent_and_failures_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("rpa.db")).await.unwrap();

        store.append(&attempt("1:1", AttemptStatus::Success, 30)).await.unwrap();
        store.append(&attempt("1:2", AttemptStatus::ElementNotFound, 20)).await.unwrap();
        store.append(&attempt("1:3", AttemptStatus::NoTargetFound, 10)).await.unwrap();
        store.append(&attempt("1:4", AttemptStatus::Success, 0)).await.unwrap();

        let recent: Vec<String> = store
            .recent(3)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.message_id)
            .collect();
        assert_eq!(recent, vec!["1:4", "1:3", "1:2"]);

        let failures: Vec<AttemptStatus> = store
            .failures(10)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.status)
            .collect();
        assert_eq!(
            failures,
            vec![AttemptStatus::NoTargetFound, AttemptStatus::ElementNotFound]
        );
    }
}
