//! Fixed-delay reconnection around a store backend.
//!
//! When the inner store reports that its backing went away, the wrapper
//! drops the handle and refuses work until the reconnect delay elapses.
//! Writes in that window fail fast with [`StoreError::Unavailable`]; nothing
//! is queued, so the caller decides when to retry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use driftsync_core::{AckCommitsEvent, Commit, CommitsEvent, SyncId};

use crate::error::{Result, StoreError};
use crate::memory::{MemoryBacking, MemoryDocStore};
use crate::sqlite::SqliteDocStore;
use crate::traits::DocStore;

/// Opens fresh handles on one backing.
#[async_trait]
pub trait StoreOpener: Send + Sync {
    type Store: DocStore + 'static;

    async fn open(&self) -> Result<Self::Store>;
}

/// Opens [`MemoryDocStore`] handles on a shared backing.
pub struct MemoryOpener {
    backing: Arc<MemoryBacking>,
}

impl MemoryOpener {
    pub fn new(backing: Arc<MemoryBacking>) -> Self {
        Self { backing }
    }
}

#[async_trait]
impl StoreOpener for MemoryOpener {
    type Store = MemoryDocStore;

    async fn open(&self) -> Result<MemoryDocStore> {
        MemoryDocStore::open(self.backing.clone())
    }
}

/// Opens [`SqliteDocStore`] handles on one database file.
pub struct SqliteOpener {
    path: PathBuf,
}

impl SqliteOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StoreOpener for SqliteOpener {
    type Store = SqliteDocStore;

    async fn open(&self) -> Result<SqliteDocStore> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || SqliteDocStore::open(path))
            .await
            .map_err(|e| StoreError::Disconnected(format!("open task failed: {}", e)))?
    }
}

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay between losing the backing and the next open attempt.
    pub reconnect_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

enum Connection<S> {
    Connected(Arc<S>),
    Reconnecting { retry_at: Instant },
    Closed,
}

/// A [`DocStore`] that reopens its backing after a disconnect.
pub struct ReconnectingStore<O: StoreOpener> {
    opener: O,
    config: ReconnectConfig,
    state: Mutex<Connection<O::Store>>,
}

impl<O: StoreOpener> ReconnectingStore<O> {
    /// Open the first handle. Failure here is returned, not retried.
    pub async fn open(opener: O, config: ReconnectConfig) -> Result<Self> {
        let store = opener.open().await?;
        Ok(Self {
            opener,
            config,
            state: Mutex::new(Connection::Connected(Arc::new(store))),
        })
    }

    /// True while a handle is held.
    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, Connection::Connected(_))
    }

    async fn current(&self) -> Result<Arc<O::Store>> {
        let mut state = self.state.lock().await;
        let retry_at = match &*state {
            Connection::Connected(store) => return Ok(store.clone()),
            Connection::Closed => return Err(StoreError::Closed),
            Connection::Reconnecting { retry_at } => *retry_at,
        };
        if Instant::now() < retry_at {
            return Err(StoreError::Unavailable);
        }

        match self.opener.open().await {
            Ok(store) => {
                let store = Arc::new(store);
                *state = Connection::Connected(store.clone());
                tracing::info!("store reconnected");
                Ok(store)
            }
            Err(e) => {
                tracing::warn!(error = %e, delay = ?self.config.reconnect_delay, "store reconnect failed");
                *state = Connection::Reconnecting {
                    retry_at: Instant::now() + self.config.reconnect_delay,
                };
                Err(StoreError::Unavailable)
            }
        }
    }

    async fn observe<T>(&self, result: &Result<T>) {
        let Err(e) = result else { return };
        if !e.is_disconnect() {
            return;
        }
        let mut state = self.state.lock().await;
        if matches!(*state, Connection::Connected(_)) {
            tracing::warn!(error = %e, delay = ?self.config.reconnect_delay, "store disconnected");
            *state = Connection::Reconnecting {
                retry_at: Instant::now() + self.config.reconnect_delay,
            };
        }
    }
}

#[async_trait]
impl<O: StoreOpener> DocStore for ReconnectingStore<O> {
    async fn add(&self, commits: &[Commit]) -> Result<AckCommitsEvent> {
        let store = self.current().await?;
        let result = store.add(commits).await;
        self.observe(&result).await;
        result
    }

    async fn get_commits_event(&self, since: Option<SyncId>) -> Result<CommitsEvent> {
        let store = self.current().await?;
        let result = store.get_commits_event(since).await;
        self.observe(&result).await;
        result
    }

    async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.lock().await, Connection::Closed);
        match previous {
            Connection::Connected(store) => store.close().await,
            _ => Ok(()),
        }
    }

    async fn delete(&self) -> Result<()> {
        let store = match self.current().await {
            Ok(store) => store,
            Err(StoreError::Closed) => Arc::new(self.opener.open().await?),
            Err(e) => return Err(e),
        };
        *self.state.lock().await = Connection::Closed;
        store.delete().await
    }
}
