// src/state_manager.rs

use crate::models::{FailureKind, FileFailure, JobId, JobRecord, JobStatus};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_rusqlite::Connection;
use tracing::info;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage for the externally visible job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts or replaces the record.
    async fn save(&self, record: &JobRecord) -> Result<(), StateError>;
    async fn load(&self, job_id: JobId) -> Result<Option<JobRecord>, StateError>;
    async fn load_all(&self) -> Result<Vec<JobRecord>, StateError>;
}

/// Process-local store. Records are lost when the store is dropped.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, record: &JobRecord) -> Result<(), StateError> {
        self.records.write().await.insert(record.job_id, record.clone());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<JobRecord>, StateError> {
        Ok(self.records.read().await.get(&job_id).cloned())
    }

    async fn load_all(&self) -> Result<Vec<JobRecord>, StateError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// Persists job records to an SQLite database, one JSON document per job.
pub struct SqliteJobStore {
    conn: Connection,
}

impl SqliteJobStore {
    /// Opens (or creates) the database at `db_path`.
    ///
    /// Jobs left non-terminal by a previous process are marked failed, since
    /// nothing will ever finish them.
    pub async fn open(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let store = Self { conn };
        store.setup_database().await?;
        store.fail_interrupted().await?;
        Ok(store)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute(
                    "CREATE TABLE IF NOT EXISTS jobs (
                        id              TEXT PRIMARY KEY,
                        record          TEXT NOT NULL
                    )",
                    [],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn fail_interrupted(&self) -> Result<(), StateError> {
        for mut record in self.load_all().await? {
            if record.status.is_terminal() {
                continue;
            }
            record.status = JobStatus::Failed;
            record.errors.push(FileFailure::new(
                PathBuf::new(),
                FailureKind::Cancelled,
                "interrupted by process restart",
            ));
            self.save(&record).await?;
            info!(job_id = %record.job_id, "marked interrupted job as failed");
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn save(&self, record: &JobRecord) -> Result<(), StateError> {
        let data = serde_json::to_string(record)?;
        let job_id = record.job_id.to_string();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO jobs (id, record) VALUES (?1, ?2)",
                    params![job_id, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<JobRecord>, StateError> {
        let job_id = job_id.to_string();
        let data: Option<String> = self
            .conn
            .call(move |conn| {
                let data = conn
                    .query_row("SELECT record FROM jobs WHERE id = ?1", params![job_id], |row| row.get::<_, String>(0))
                    .optional()?;
                Ok(data)
            })
            .await?;
        match data {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> Result<Vec<JobRecord>, StateError> {
        let rows: Vec<String> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT record FROM jobs")?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StateError::from))
            .collect()
    }
}
