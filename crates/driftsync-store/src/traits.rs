//! DocStore trait: the abstract interface for commit persistence.
//!
//! This trait allows clients to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use driftsync_core::{AckCommitsEvent, Commit, CommitsEvent, SyncId};

use crate::error::Result;

/// The DocStore trait: async interface for one document's commit log.
///
/// # Design Notes
///
/// - **Idempotent adds**: Re-adding a stored ref is acknowledged again with
///   its stored annotation and is not duplicated.
/// - **Unknown parents**: A commit whose parent is neither stored nor earlier
///   in the batch is rejected with `unknown-ref`, and so is everything built
///   on it.
/// - **One sync id per call**: Every `add` mints exactly one sync id, even
///   for empty or fully rejected batches. Sync ids survive close/reopen.
#[async_trait]
pub trait DocStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Commit Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Add one ordered batch of commits.
    async fn add(&self, commits: &[Commit]) -> Result<AckCommitsEvent>;

    /// Get stored commits ordered strictly after `since` (all if `None`),
    /// annotated, plus the current sync id.
    async fn get_commits_event(&self, since: Option<SyncId>) -> Result<CommitsEvent>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Close this handle. Later calls fail with `StoreError::Closed`.
    async fn close(&self) -> Result<()>;

    /// Close and destroy the backing.
    async fn delete(&self) -> Result<()>;
}
