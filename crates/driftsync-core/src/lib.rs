//! # driftsync Core
//!
//! Pure primitives for driftsync: commits, head sets, causal-order
//! validation and the deterministic merge engine.
//!
//! This crate contains no I/O, no storage, no networking. Everything here is
//! computation over an in-memory commit graph.
//!
//! ## Key Types
//!
//! - [`Commit`] - Immutable node in the history graph
//! - [`CommitRef`] - Opaque unique identifier of a commit
//! - [`HeadSet`] - Refs with no known descendant
//! - [`SyncId`] - Monotonic batch token minted by a store
//! - [`MergeEngine`] - Materializes documents and collapses divergent heads
//! - [`Differ`] - Application-supplied diff, patch and merge callbacks
//!
//! ## Ref hashing
//!
//! [`hash_ref`] gives applications a content-addressed ref built from
//! canonical CBOR and Blake3. See [`commit`] module.

pub mod commit;
pub mod error;
pub mod event;
pub mod graph;
pub mod heads;
pub mod merge;
pub mod types;
pub mod validation;

pub use commit::{hash_ref, Commit};
pub use error::{CoreError, GraphError, MergeError, ValidationError};
pub use event::{add_invalid_refs, AckCommitsEvent, CommitAck, CommitsEvent, RefError, RefErrorCode};
pub use graph::CommitGraph;
pub use heads::HeadSet;
pub use merge::{Differ, MergeEngine};
pub use types::{CommitRef, ServerAnnotation, SyncId};
pub use validation::{validate_commit_order, validate_commit_order_with, CommitOrder};
