//! # driftsync
//!
//! Local-first document sync: every edit is an immutable commit, divergent
//! histories collapse through a deterministic merge, and one elected actor
//! per device replicates to the remote.
//!
//! ## Overview
//!
//! - **Commits**: Immutable nodes with up to two parents and an opaque delta
//! - **Stores**: Assign each batch a monotonic sync id and track heads
//! - **Actors**: Coordinate clients sharing one store and elect a leader
//! - **Clients**: Hold the working document and merge what arrives
//!
//! ## Usage
//!
//! ```rust,no_run
//! use driftsync::{Client, ClientConfig};
//! use driftsync::store::MemoryDocStore;
//! use driftsync::sync::memory::MemoryBus;
//! use driftsync::sync::ActorId;
//! use driftsync::Differ;
//!
//! async fn example<D: Differ<Doc = String>>(differ: D) {
//!     let bus = MemoryBus::new();
//!     let mut client = Client::open(
//!         differ,
//!         MemoryDocStore::new(),
//!         bus.join(ActorId::random()),
//!         None,
//!         ClientConfig::new("alice", "tab-1"),
//!     );
//!
//!     client
//!         .update_doc("hello".to_string(), serde_json::json!({"msg": "first edit"}))
//!         .await
//!         .unwrap();
//!     while client.process_next().await.unwrap() {
//!         if client.unacked().is_empty() {
//!             break;
//!         }
//!     }
//!     client.shutdown().await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `driftsync::core` - Commits, validation and the merge engine
//! - `driftsync::store` - Storage contract, SQLite and memory backends
//! - `driftsync::sync` - Actors, leader election and transports

pub mod client;
pub mod config;
pub mod error;
pub mod status;

// Re-export component crates
pub use driftsync_core as core;
pub use driftsync_store as store;
pub use driftsync_sync as sync;

// Re-export main types for convenience
pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use status::{LocalRead, LocalSave, SyncStatus};

// Re-export commonly used core types
pub use driftsync_core::{Commit, CommitRef, Differ, MergeEngine, SyncId};
