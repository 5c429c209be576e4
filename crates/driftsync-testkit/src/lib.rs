//! # driftsync Testkit
//!
//! Testing utilities for driftsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Commit builders, a JSON-object differ and device setup
//! - **Generators**: Proptest strategies for chains and commit DAGs
//!
//! Cross-crate integration tests live in this crate's `tests/` directory.
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use driftsync_core::validate_commit_order;
//! use driftsync_testkit::generators::{dag_from_params, DagParams};
//!
//! proptest! {
//!     #[test]
//!     fn dags_validate(params: DagParams) {
//!         let commits = dag_from_params(&params);
//!         prop_assert!(validate_commit_order(&commits).is_ok());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust
//! use driftsync_testkit::fixtures::{diamond, doc, JsonDiffer};
//! use driftsync_core::{validate_commit_order, MergeEngine};
//! use serde_json::json;
//!
//! let order = validate_commit_order(&diamond()).unwrap();
//! assert!(order.referenced_commits.is_empty());
//!
//! let mut engine = MergeEngine::new(JsonDiffer::new());
//! engine.commit_doc(doc(json!({"title": "draft"})), json!({})).unwrap();
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{init_tracing, Device, JsonDiffer, JsonDoc};
