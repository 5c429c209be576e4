//! Commit and acknowledgement events exchanged with stores and peers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::commit::Commit;
use crate::types::{CommitRef, ServerAnnotation, SyncId};

/// A batch of commits plus the sync id it brings the receiver up to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitsEvent {
    pub commits: Vec<Commit>,
    pub sync_id: SyncId,
}

/// Per-commit acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAck {
    #[serde(rename = "ref")]
    pub id: CommitRef,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub server: ServerAnnotation,
}

/// Kind of a per-ref failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefErrorCode {
    /// A parent could not be resolved. Recoverable once it arrives.
    UnknownRef,
    /// The commit names itself as a parent.
    InvalidCommit,
    /// The store failed on this ref.
    Internal,
}

/// A per-ref failure reported in an acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefError {
    pub code: RefErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RefError {
    /// An `unknown-ref` error with a message.
    pub fn unknown_ref(message: impl Into<String>) -> Self {
        Self {
            code: RefErrorCode::UnknownRef,
            message: Some(message.into()),
        }
    }

    /// An `invalid-commit` error with a message.
    pub fn invalid_commit(message: impl Into<String>) -> Self {
        Self {
            code: RefErrorCode::InvalidCommit,
            message: Some(message.into()),
        }
    }
}

/// Result of a store `add` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckCommitsEvent {
    /// Acks in batch order, one per accepted or already-stored ref.
    pub acks: Vec<CommitAck>,
    /// Rejected refs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ref_errors: BTreeMap<CommitRef, RefError>,
    /// Sync id reached by the call.
    pub sync_id: SyncId,
}

impl AckCommitsEvent {
    /// True if every commit in the batch was accepted.
    pub fn is_clean(&self) -> bool {
        self.ref_errors.is_empty()
    }

    /// Look up the ack for a ref.
    pub fn ack_for(&self, r: &CommitRef) -> Option<&CommitAck> {
        self.acks.iter().find(|a| &a.id == r)
    }
}

/// Report every invalid ref as `unknown-ref`, keeping errors already present.
pub fn add_invalid_refs(ack: &mut AckCommitsEvent, invalid_refs: &BTreeSet<CommitRef>) {
    for r in invalid_refs {
        ack.ref_errors
            .entry(r.clone())
            .or_insert_with(|| RefError {
                code: RefErrorCode::UnknownRef,
                message: None,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_invalid_refs_keeps_existing() {
        let mut ack = AckCommitsEvent::default();
        ack.ref_errors
            .insert(CommitRef::from("a"), RefError::invalid_commit("bad"));

        let invalid = BTreeSet::from([CommitRef::from("a"), CommitRef::from("b")]);
        add_invalid_refs(&mut ack, &invalid);

        assert_eq!(ack.ref_errors.len(), 2);
        assert_eq!(ack.ref_errors[&CommitRef::from("a")].code, RefErrorCode::InvalidCommit);
        assert_eq!(ack.ref_errors[&CommitRef::from("b")].code, RefErrorCode::UnknownRef);
        assert!(!ack.is_clean());
    }

    #[test]
    fn test_ref_error_code_wire_names() {
        let json = serde_json::to_value(RefError::unknown_ref("unknown baseRef")).unwrap();
        assert_eq!(json["code"], "unknown-ref");
        assert_eq!(json["message"], "unknown baseRef");
        assert_eq!(
            serde_json::to_value(RefErrorCode::InvalidCommit).unwrap(),
            "invalid-commit"
        );
    }
}
