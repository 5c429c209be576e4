//! In-memory implementation of the DocStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite, and a
//! [`MemoryBacking`] outlives the handles opened on it, so close/reopen and
//! dropped connections can be exercised without touching disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use driftsync_core::{AckCommitsEvent, Commit, CommitRef, CommitsEvent, HeadSet, SyncId};

use crate::batch::{plan_batch, StoredCommit};
use crate::error::{Result, StoreError};
use crate::traits::DocStore;

/// Durable state shared by every handle opened on it.
#[derive(Default)]
pub struct MemoryBacking {
    inner: Mutex<BackingInner>,
}

#[derive(Default)]
struct BackingInner {
    /// Commits in (sync id, index) order.
    commits: Vec<StoredCommit>,

    /// Position index: ref -> offset in `commits`.
    index: HashMap<CommitRef, usize>,

    heads: HeadSet,

    /// Highest sync id minted.
    sync_id: SyncId,

    /// Simulated loss of the backing.
    disconnected: bool,
}

impl MemoryBacking {
    /// Create a new empty backing.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the backing going away (or coming back).
    pub fn set_disconnected(&self, disconnected: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.disconnected = disconnected;
        }
    }

    /// Number of stored commits.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.commits.len()).unwrap_or(0)
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, BackingInner>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StoreError::InvalidData(format!("mutex poisoned: {}", e)))?;
        if inner.disconnected {
            return Err(StoreError::Disconnected("memory backing unavailable".into()));
        }
        Ok(inner)
    }
}

impl BackingInner {
    fn get(&self, r: &CommitRef) -> Option<Commit> {
        self.index.get(r).map(|&i| self.commits[i].commit.clone())
    }
}

/// In-memory store handle.
pub struct MemoryDocStore {
    backing: Arc<MemoryBacking>,
    closed: AtomicBool,
}

impl MemoryDocStore {
    /// Open a handle on a fresh backing.
    pub fn new() -> Self {
        Self {
            backing: MemoryBacking::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open a handle on an existing backing.
    pub fn open(backing: Arc<MemoryBacking>) -> Result<Self> {
        drop(backing.lock()?);
        Ok(Self {
            backing,
            closed: AtomicBool::new(false),
        })
    }

    /// The shared backing.
    pub fn backing(&self) -> &Arc<MemoryBacking> {
        &self.backing
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryDocStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn add(&self, commits: &[Commit]) -> Result<AckCommitsEvent> {
        self.check_open()?;
        let mut inner = self.backing.lock()?;

        let sync_id = inner.sync_id.next();
        let plan = {
            let state = &*inner;
            plan_batch(commits, state.heads.clone(), sync_id, |r| Ok(state.get(r)))?
        };

        inner.sync_id = sync_id;
        for stored in plan.inserts {
            let offset = inner.commits.len();
            inner.index.insert(stored.commit.id.clone(), offset);
            inner.commits.push(stored);
        }
        inner.heads = plan.heads;

        tracing::debug!(sync_id = %sync_id, acks = plan.ack.acks.len(), "memory batch stored");
        Ok(plan.ack)
    }

    async fn get_commits_event(&self, since: Option<SyncId>) -> Result<CommitsEvent> {
        self.check_open()?;
        let inner = self.backing.lock()?;

        let commits = inner
            .commits
            .iter()
            .filter(|s| since.map_or(true, |since| s.sync_id > since))
            .map(|s| s.commit.clone())
            .collect();

        Ok(CommitsEvent {
            commits,
            sync_id: inner.sync_id,
        })
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut inner = self
            .backing
            .inner
            .lock()
            .map_err(|e| StoreError::InvalidData(format!("mutex poisoned: {}", e)))?;
        *inner = BackingInner::default();
        Ok(())
    }
}
