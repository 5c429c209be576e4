//! # driftsync Store
//!
//! Storage contract for one document's commit log, with SQLite and
//! in-memory implementations.
//!
//! ## Overview
//!
//! The [`DocStore`] trait owns the authoritative order of a document's
//! commits. Every `add` call mints one [`SyncId`](driftsync_core::SyncId),
//! deduplicates by ref, rejects commits with unresolved parents, tracks the
//! head set and annotates accepted commits. The primary implementation is
//! [`SqliteDocStore`], with [`MemoryDocStore`] for testing.
//!
//! ## Key Types
//!
//! - [`DocStore`] - The async trait for all storage operations
//! - [`SqliteDocStore`] - SQLite-based persistent storage
//! - [`MemoryDocStore`] - In-memory storage over a reopenable [`MemoryBacking`]
//! - [`ReconnectingStore`] - Fixed-delay reconnect wrapper with fail-fast writes
//!
//! ## Usage
//!
//! ```rust,no_run
//! use driftsync_core::Commit;
//! use driftsync_store::{DocStore, SqliteDocStore};
//!
//! async fn example() {
//!     let store = SqliteDocStore::open("doc.db").unwrap();
//!
//!     let ack = store
//!         .add(&[Commit::new("1"), Commit::new("2").with_base("1")])
//!         .await
//!         .unwrap();
//!     assert!(ack.is_clean());
//!
//!     let event = store.get_commits_event(None).await.unwrap();
//!     assert_eq!(event.commits.len(), 2);
//! }
//! ```

pub mod batch;
pub mod error;
pub mod memory;
pub mod migration;
pub mod reconnect;
pub mod sqlite;
pub mod traits;

pub use batch::{plan_batch, BatchPlan, StoredCommit};
pub use error::{Result, StoreError};
pub use memory::{MemoryBacking, MemoryDocStore};
pub use reconnect::{MemoryOpener, ReconnectConfig, ReconnectingStore, SqliteOpener, StoreOpener};
pub use sqlite::SqliteDocStore;
pub use traits::DocStore;
