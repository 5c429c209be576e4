//! SQLite implementation of the DocStore trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking. Each `add` runs in an
//! IMMEDIATE transaction, so minting the sync id and writing the batch is one
//! atomic step with respect to other writers on the same file.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use driftsync_core::{
    AckCommitsEvent, Commit, CommitRef, CommitsEvent, HeadSet, ServerAnnotation, SyncId,
};

use crate::batch::{plan_batch, StoredCommit};
use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::DocStore;

const COMMIT_COLUMNS: &str = "commit_ref, base_ref, merge_ref, delta, metadata,
     remote_sync_id, remote_sync_index, main";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteDocStore {
    /// The SQLite connection. `None` once closed.
    conn: Arc<Mutex<Option<Connection>>>,
    /// Backing file, `None` for in-memory databases.
    path: Option<PathBuf>,
}

impl SqliteDocStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut conn = Connection::open(&path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: Some(path),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: None,
        })
    }

    /// Run a blocking operation against the open connection.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            let conn = guard.as_mut().ok_or(StoreError::Closed)?;
            f(conn).map_err(classify)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }

    /// Take the connection out and close it.
    fn take_and_close(&self) -> Result<()> {
        let mut guard = self.conn.lock().map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                Some(format!("mutex poisoned: {}", e)),
            ))
        })?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| StoreError::from(e))?;
        }
        Ok(())
    }
}

// I/O level failures mean the file is gone or unreachable
fn classify(e: StoreError) -> StoreError {
    use rusqlite::ErrorCode;

    let code = match &e {
        StoreError::Database(db) => db.sqlite_error_code(),
        _ => None,
    };
    match code {
        Some(ErrorCode::SystemIoFailure | ErrorCode::CannotOpen | ErrorCode::NotADatabase) => {
            StoreError::Disconnected(e.to_string())
        }
        _ => e,
    }
}

// Helper to convert a row to Commit
fn row_to_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Commit> {
    let metadata_cbor: Vec<u8> = row.get("metadata")?;
    let metadata: serde_json::Value = ciborium::from_reader(&metadata_cbor[..])
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Blob, Box::new(e)))?;
    let delta: Option<Vec<u8>> = row.get("delta")?;

    Ok(Commit {
        id: CommitRef::new(row.get::<_, String>("commit_ref")?),
        base_ref: row.get::<_, Option<String>>("base_ref")?.map(CommitRef::new),
        merge_ref: row.get::<_, Option<String>>("merge_ref")?.map(CommitRef::new),
        delta: delta.map(Bytes::from),
        metadata,
        server: Some(ServerAnnotation {
            remote_sync_id: sync_id_column(row, 5)?,
            remote_sync_index: row.get("remote_sync_index")?,
            main: row.get("main")?,
        }),
    })
}

// Sync ids are stored as INTEGER, so they must fit in an i64
fn sync_id_param(id: SyncId) -> Result<i64> {
    i64::try_from(id.get())
        .map_err(|_| StoreError::InvalidData(format!("sync id {id} exceeds the storable range")))
}

fn sync_id_value(value: i64) -> Result<SyncId> {
    u64::try_from(value)
        .map(SyncId)
        .map_err(|_| StoreError::InvalidData(format!("negative sync id {value}")))
}

fn sync_id_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<SyncId> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value)
        .map(SyncId)
        .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

// Helper to encode metadata to CBOR
fn encode_metadata(metadata: &serde_json::Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(metadata, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn load_commit(conn: &Connection, r: &CommitRef) -> Result<Option<Commit>> {
    conn.query_row(
        &format!("SELECT {COMMIT_COLUMNS} FROM commits WHERE commit_ref = ?1"),
        params![r.as_str()],
        row_to_commit,
    )
    .optional()
    .map_err(StoreError::from)
}

fn load_heads(conn: &Connection) -> Result<HeadSet> {
    let mut stmt = conn.prepare("SELECT commit_ref FROM heads")?;
    let heads = stmt
        .query_map([], |row| row.get::<_, String>(0).map(CommitRef::new))?
        .collect::<rusqlite::Result<HeadSet>>()?;
    Ok(heads)
}

fn insert_commit(conn: &Connection, stored: &StoredCommit) -> Result<()> {
    let commit = &stored.commit;
    let server = commit
        .server
        .ok_or_else(|| StoreError::InvalidData(format!("commit {} has no annotation", commit.id)))?;

    conn.execute(
        "INSERT INTO commits (
            commit_ref, base_ref, merge_ref, delta, metadata,
            remote_sync_id, remote_sync_index, main, sync_id, sync_index
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            commit.id.as_str(),
            commit.base_ref.as_ref().map(CommitRef::as_str),
            commit.merge_ref.as_ref().map(CommitRef::as_str),
            commit.delta.as_deref(),
            encode_metadata(&commit.metadata)?,
            sync_id_param(server.remote_sync_id)?,
            server.remote_sync_index,
            server.main,
            sync_id_param(stored.sync_id)?,
            stored.sync_index,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl DocStore for SqliteDocStore {
    async fn add(&self, commits: &[Commit]) -> Result<AckCommitsEvent> {
        let commits = commits.to_vec();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let counter: i64 = tx.query_row(
                "SELECT sync_counter FROM sync_state WHERE id = 0",
                [],
                |row| row.get(0),
            )?;
            let sync_id = sync_id_value(counter)?.next();
            let stored_sync_id = sync_id_param(sync_id)?;
            let heads = load_heads(&tx)?;

            let plan = plan_batch(&commits, heads, sync_id, |r| load_commit(&tx, r))?;

            for stored in &plan.inserts {
                insert_commit(&tx, stored)?;
            }
            tx.execute("DELETE FROM heads", [])?;
            for head in plan.heads.iter() {
                tx.execute("INSERT INTO heads (commit_ref) VALUES (?1)", params![head.as_str()])?;
            }
            tx.execute(
                "UPDATE sync_state SET sync_counter = ?1 WHERE id = 0",
                params![stored_sync_id],
            )?;
            tx.commit()?;

            tracing::debug!(sync_id = %sync_id, stored = plan.inserts.len(), "sqlite batch stored");
            Ok(plan.ack)
        })
        .await
    }

    async fn get_commits_event(&self, since: Option<SyncId>) -> Result<CommitsEvent> {
        self.with_conn(move |conn| {
            let sync_id: i64 = conn.query_row(
                "SELECT sync_counter FROM sync_state WHERE id = 0",
                [],
                |row| row.get(0),
            )?;

            let after = match since {
                Some(since) => sync_id_param(since)?,
                None => 0,
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT {COMMIT_COLUMNS} FROM commits
                 WHERE sync_id > ?1
                 ORDER BY sync_id, sync_index"
            ))?;
            let commits = stmt
                .query_map(params![after], row_to_commit)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(CommitsEvent {
                commits,
                sync_id: sync_id_value(sync_id)?,
            })
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.take_and_close()
    }

    async fn delete(&self) -> Result<()> {
        self.take_and_close()?;
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_add_and_get_commits() {
        let store = SqliteDocStore::open_memory().unwrap();
        let commit = Commit::new("1")
            .with_delta(Bytes::from_static(b"hello"))
            .with_metadata(json!({"author": "a", "n": 3}));

        let ack = store.add(&[commit.clone()]).await.unwrap();
        assert_eq!(ack.sync_id, SyncId(1));
        assert_eq!(ack.acks[0].metadata, json!({"author": "a", "n": 3}));

        let event = store.get_commits_event(None).await.unwrap();
        assert_eq!(event.commits.len(), 1);
        let stored = &event.commits[0];
        assert_eq!(stored.delta, commit.delta);
        assert_eq!(stored.metadata, commit.metadata);
        assert_eq!(
            stored.server,
            Some(ServerAnnotation {
                remote_sync_id: SyncId(1),
                remote_sync_index: 0,
                main: true
            })
        );
    }

    #[tokio::test]
    async fn test_unstorable_sync_id_is_rejected() {
        let store = SqliteDocStore::open_memory().unwrap();
        let mut commit = Commit::new("1");
        commit.server = Some(ServerAnnotation {
            remote_sync_id: SyncId(u64::MAX),
            remote_sync_index: 0,
            main: true,
        });

        let result = store.add(&[commit]).await;
        assert!(matches!(result, Err(StoreError::InvalidData(_))));
        assert!(store.get_commits_event(None).await.unwrap().commits.is_empty());

        let result = store.get_commits_event(Some(SyncId(u64::MAX))).await;
        assert!(matches!(result, Err(StoreError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_idempotent_add() {
        let store = SqliteDocStore::open_memory().unwrap();
        store.add(&[Commit::new("1")]).await.unwrap();
        let again = store.add(&[Commit::new("1")]).await.unwrap();

        assert_eq!(again.sync_id, SyncId(2));
        assert_eq!(again.acks[0].server.remote_sync_id, SyncId(1));
        assert_eq!(store.get_commits_event(None).await.unwrap().commits.len(), 1);
    }

    #[tokio::test]
    async fn test_since_cursor() {
        let store = SqliteDocStore::open_memory().unwrap();
        store.add(&[Commit::new("1")]).await.unwrap();
        store.add(&[Commit::new("2").with_base("1")]).await.unwrap();

        let event = store.get_commits_event(Some(SyncId(1))).await.unwrap();
        let refs: Vec<_> = event.commits.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(refs, vec!["2"]);
        assert_eq!(event.sync_id, SyncId(2));
    }

    #[tokio::test]
    async fn test_reopen_continues_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.db");

        let store = SqliteDocStore::open(&path).unwrap();
        store.add(&[Commit::new("1")]).await.unwrap();
        store.add(&[]).await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.add(&[]).await, Err(StoreError::Closed)));

        let store = SqliteDocStore::open(&path).unwrap();
        let ack = store.add(&[Commit::new("2").with_base("1")]).await.unwrap();
        assert_eq!(ack.sync_id, SyncId(3));
        assert!(ack.acks[0].server.main);
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.db");

        let store = SqliteDocStore::open(&path).unwrap();
        store.add(&[Commit::new("1")]).await.unwrap();
        store.delete().await.unwrap();
        assert!(!path.exists());
    }
}
