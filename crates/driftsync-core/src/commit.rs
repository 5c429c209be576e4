//! Commit: the immutable node of the history graph.
//!
//! A commit names at most two parents by ref. Parent links are values, never
//! pointers, so the graph is an arena keyed by [`CommitRef`].

use bytes::Bytes;
use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ValidationError};
use crate::types::{CommitRef, ServerAnnotation};

/// Domain separator mixed into every content-addressed ref.
const REF_DOMAIN: &[u8] = b"driftsync-ref-v0:";

/// Canonical field keys for ref hashing.
///
/// Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub const BASE_REF: u64 = 0;
    pub const MERGE_REF: u64 = 1;
    pub const DELTA: u64 = 2;
    pub const METADATA: u64 = 3;
}

/// An immutable edit in the commit graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Unique identifier.
    #[serde(rename = "ref")]
    pub id: CommitRef,
    /// Linear parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<CommitRef>,
    /// Second parent, merge commits only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_ref: Option<CommitRef>,
    /// Opaque patch payload, interpreted only by the application's differ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Bytes>,
    /// Application-defined annotation.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Store annotation, attached once the commit is durably ordered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerAnnotation>,
}

impl Commit {
    /// Create a root commit with no parents, delta or metadata.
    pub fn new(id: impl Into<CommitRef>) -> Self {
        Self {
            id: id.into(),
            base_ref: None,
            merge_ref: None,
            delta: None,
            metadata: serde_json::Value::Null,
            server: None,
        }
    }

    /// Set the linear parent.
    pub fn with_base(mut self, base: impl Into<CommitRef>) -> Self {
        self.base_ref = Some(base.into());
        self
    }

    /// Set the merge parent.
    pub fn with_merge(mut self, merge: impl Into<CommitRef>) -> Self {
        self.merge_ref = Some(merge.into());
        self
    }

    /// Set the delta payload.
    pub fn with_delta(mut self, delta: impl Into<Bytes>) -> Self {
        self.delta = Some(delta.into());
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// True if the commit has no parents.
    pub fn is_root(&self) -> bool {
        self.base_ref.is_none() && self.merge_ref.is_none()
    }

    /// True if the commit names a merge parent.
    pub fn is_merge(&self) -> bool {
        self.merge_ref.is_some()
    }

    /// Iterate over declared parents, base first.
    pub fn parents(&self) -> impl Iterator<Item = &CommitRef> {
        self.base_ref.iter().chain(self.merge_ref.iter())
    }

    /// Check structural rules that do not depend on any other commit.
    pub fn validate_structure(&self) -> Result<(), ValidationError> {
        if self.merge_ref.is_some() && self.base_ref.is_none() {
            return Err(ValidationError::MergeWithoutBase(self.id.clone()));
        }
        if self.parents().any(|p| p == &self.id) {
            return Err(ValidationError::SelfReference(self.id.clone()));
        }
        Ok(())
    }
}

/// Compute a content-addressed ref from a commit's parents and content.
///
/// The ref is `hex(Blake3(domain || canonical_cbor(fields)))`. Metadata is
/// encoded through serde, and JSON object keys come out sorted, so equal
/// inputs give equal refs on every platform.
pub fn hash_ref(
    base_ref: Option<&CommitRef>,
    merge_ref: Option<&CommitRef>,
    delta: Option<&Bytes>,
    metadata: &serde_json::Value,
) -> Result<CommitRef, CoreError> {
    let text_or_null = |r: Option<&CommitRef>| match r {
        Some(r) => Value::Text(r.as_str().to_owned()),
        None => Value::Null,
    };

    let metadata = Value::serialized(metadata)
        .map_err(|e| CoreError::EncodingError(e.to_string()))?;

    let entries = vec![
        (Value::Integer(keys::BASE_REF.into()), text_or_null(base_ref)),
        (Value::Integer(keys::MERGE_REF.into()), text_or_null(merge_ref)),
        (
            Value::Integer(keys::DELTA.into()),
            match delta {
                Some(d) => Value::Bytes(d.to_vec()),
                None => Value::Null,
            },
        ),
        (Value::Integer(keys::METADATA.into()), metadata),
    ];

    let mut buf = Vec::new();
    ciborium::into_writer(&Value::Map(entries), &mut buf)
        .map_err(|e| CoreError::EncodingError(e.to_string()))?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(REF_DOMAIN);
    hasher.update(&buf);
    Ok(CommitRef::new(hex::encode(hasher.finalize().as_bytes())))
}
