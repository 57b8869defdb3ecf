//! Checkpoint persistence.
//!
//! The engine checkpoints after every successful page so a crash loses at
//! most one in-flight page. Saving is fire-and-forget: failures are logged
//! and never fatal to the crawl.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{params, Connection};

/// Snapshot of resumable run state.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint {
    pub cursor: Option<String>,
    pub accumulated: u64,
    pub last_item_id: Option<String>,
    pub session_id: Option<String>,
}

/// Persistence sink for checkpoints.
#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn save(&self, run_id: &str, checkpoint: &Checkpoint) -> anyhow::Result<()>;
    async fn load(&self, run_id: &str) -> anyhow::Result<Option<Checkpoint>>;
}

/// Discards checkpoints; used when resumability is not needed.
#[derive(Debug, Default)]
pub struct NullCheckpointSink;

#[async_trait]
impl CheckpointSink for NullCheckpointSink {
    async fn save(&self, _run_id: &str, _checkpoint: &Checkpoint) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load(&self, _run_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        Ok(None)
    }
}

/// SQLite-backed checkpoint store.
#[derive(Debug)]
pub struct SqliteCheckpointSink {
    db_path: PathBuf,
}

/// Open a database connection with proper concurrency settings.
fn open_db(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 30000;
    "#,
    )?;
    Ok(conn)
}

impl SqliteCheckpointSink {
    pub fn new(db_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = open_db(&db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS run_checkpoints (
                run_id TEXT PRIMARY KEY,
                cursor TEXT,
                accumulated INTEGER NOT NULL DEFAULT 0,
                last_item_id TEXT,
                session_id TEXT,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        )?;
        Ok(Self { db_path })
    }
}

#[async_trait]
impl CheckpointSink for SqliteCheckpointSink {
    async fn save(&self, run_id: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let db_path = self.db_path.clone();
        let run_id = run_id.to_string();
        let cp = checkpoint.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let conn = open_db(&db_path)?;
            conn.execute(
                r#"
                INSERT INTO run_checkpoints (run_id, cursor, accumulated, last_item_id, session_id, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, CURRENT_TIMESTAMP)
                ON CONFLICT(run_id) DO UPDATE SET
                    cursor = excluded.cursor,
                    accumulated = excluded.accumulated,
                    last_item_id = excluded.last_item_id,
                    session_id = excluded.session_id,
                    updated_at = CURRENT_TIMESTAMP
                "#,
                params![
                    run_id,
                    cp.cursor,
                    cp.accumulated as i64,
                    cp.last_item_id,
                    cp.session_id
                ],
            )?;
            Ok(())
        })
        .await?
    }

    async fn load(&self, run_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        let db_path = self.db_path.clone();
        let run_id = run_id.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Checkpoint>> {
            let conn = open_db(&db_path)?;
            let mut stmt = conn.prepare(
                "SELECT cursor, accumulated, last_item_id, session_id FROM run_checkpoints WHERE run_id = ?1",
            )?;
            let mut rows = stmt.query(params![run_id])?;
            if let Some(row) = rows.next()? {
                Ok(Some(Checkpoint {
                    cursor: row.get(0)?,
                    accumulated: row.get::<_, i64>(1)? as u64,
                    last_item_id: row.get(2)?,
                    session_id: row.get(3)?,
                }))
            } else {
                Ok(None)
            }
        })
        .await?
    }
}
