//! Error types for driftsync core.

use thiserror::Error;

use crate::types::CommitRef;

/// Core errors that can occur while encoding commit content.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for commit structure and batch ordering.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("commit {0} has a mergeRef but no baseRef")]
    MergeWithoutBase(CommitRef),

    #[error("commit {0} names itself as a parent")]
    SelfReference(CommitRef),

    /// A batch presented a parent after the commit that depends on it.
    #[error("ordering violation: {parent} appears after its dependent {dependent}")]
    OrderViolation {
        parent: CommitRef,
        dependent: CommitRef,
    },
}

/// Errors raised by the in-memory commit graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("commit {commit} references unknown parent {parent}")]
    UnknownParent { commit: CommitRef, parent: CommitRef },

    #[error("unknown commit: {0}")]
    UnknownCommit(CommitRef),

    #[error("invalid commit: {0}")]
    Invalid(#[from] ValidationError),
}

/// Errors raised while materializing or merging documents.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The application's patch, merge or ref callback failed for this ref.
    ///
    /// Nothing is cached for the ref; callers may retry later.
    #[error("document unavailable for {commit}: {source}")]
    DocumentUnavailable {
        commit: CommitRef,
        #[source]
        source: anyhow::Error,
    },

    /// Diffing or ref computation failed for a new local edit.
    #[error("differ failed: {0}")]
    Differ(#[source] anyhow::Error),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
}
