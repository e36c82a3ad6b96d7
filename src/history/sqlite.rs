//! SQLite history backend
//!
//! One row per session; the full session is stored as JSON alongside the
//! columns needed for lookups.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use super::{sort_most_recent_first, HistoryError, HistoryStore};
use crate::polls::{HistoryRecord, PollSession};

/// SQLite-backed [`HistoryStore`].
pub struct SqliteHistoryStore {
    pool: Pool<Sqlite>,
}

impl SqliteHistoryStore {
    /// Connect to `url`, creating the database file and table if needed.
    pub async fn connect(url: &str) -> Result<Self, HistoryError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| HistoryError::Storage(format!("Invalid database url: {}", e)))?
            .create_if_missing(true);

        // A single connection keeps `sqlite::memory:` databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| HistoryError::Storage(format!("Failed to connect: {}", e)))?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), HistoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                end_time INTEGER,
                record TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(format!("Failed to create table: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_polls_status ON polls(status)")
            .execute(&self.pool)
            .await
            .map_err(|e| HistoryError::Storage(format!("Failed to create index: {}", e)))?;

        Ok(())
    }

    fn decode(record: &str) -> Result<PollSession, HistoryError> {
        Ok(serde_json::from_str(record)?)
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn save(&self, session: &PollSession) -> Result<(), HistoryError> {
        let record = serde_json::to_string(session)?;
        sqlx::query(
            r#"
            INSERT INTO polls (id, status, end_time, record)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                end_time = excluded.end_time,
                record = excluded.record
            "#,
        )
        .bind(session.id.0 as i64)
        .bind(session.status.as_str())
        .bind(session.end_time)
        .bind(record)
        .execute(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(format!("Failed to save poll {}: {}", session.id, e)))?;
        Ok(())
    }

    async fn find_active(&self) -> Result<Option<PollSession>, HistoryError> {
        let row = sqlx::query(
            "SELECT record FROM polls WHERE status = 'active' ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(format!("Query failed: {}", e)))?;

        row.map(|row| Self::decode(&row.get::<String, _>("record")))
            .transpose()
    }

    async fn list_completed(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let rows = sqlx::query(
            "SELECT record FROM polls WHERE status = 'completed' ORDER BY end_time DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| HistoryError::Storage(format!("Query failed: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let session = Self::decode(&row.get::<String, _>("record"))?;
            match session.into_record() {
                Some(record) => records.push(record),
                None => tracing::warn!("skipping completed poll row without an end time"),
            }
        }
        sort_most_recent_first(&mut records);
        Ok(records)
    }
}
