//! Batch planning shared by every store backend.
//!
//! Backends load their head set and mint the next sync id under their own
//! lock or transaction, then hand the batch to [`plan_batch`]. The plan says
//! exactly which rows to write, which acks to return and what the head set
//! becomes, so every backend accepts and rejects the same commits.

use std::collections::HashSet;

use driftsync_core::{
    AckCommitsEvent, Commit, CommitAck, CommitRef, HeadSet, RefError, ServerAnnotation, SyncId,
};

use crate::error::Result;

/// A commit as persisted, with its local ordering position.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCommit {
    /// The commit, always carrying a server annotation.
    pub commit: Commit,
    /// Sync id of the batch that stored it locally.
    pub sync_id: SyncId,
    /// Position within that batch.
    pub sync_index: u32,
}

/// Outcome of planning one `add` call.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// New rows, in order.
    pub inserts: Vec<StoredCommit>,
    /// The acknowledgement to return.
    pub ack: AckCommitsEvent,
    /// Head set after the batch.
    pub heads: HeadSet,
}

/// Plan a batch against the current head set.
///
/// `lookup` resolves refs already stored by the backend. `sync_id` is the id
/// minted for this call.
pub fn plan_batch<F>(
    commits: &[Commit],
    mut heads: HeadSet,
    sync_id: SyncId,
    mut lookup: F,
) -> Result<BatchPlan>
where
    F: FnMut(&CommitRef) -> Result<Option<Commit>>,
{
    let mut ack = AckCommitsEvent {
        sync_id,
        ..Default::default()
    };
    let mut inserts = Vec::new();
    // refs resolvable by later commits in this batch
    let mut resolved: HashSet<CommitRef> = HashSet::new();
    let mut handled: HashSet<CommitRef> = HashSet::new();
    let mut index: u32 = 0;

    for commit in commits {
        if !handled.insert(commit.id.clone()) {
            continue;
        }

        if let Some(stored) = lookup(&commit.id)? {
            if let Some(server) = stored.server {
                ack.acks.push(CommitAck {
                    id: stored.id.clone(),
                    metadata: stored.metadata,
                    server,
                });
            }
            resolved.insert(commit.id.clone());
            continue;
        }

        // A merge parent without a base parent is reported as unresolved.
        if let (None, Some(merge_ref)) = (&commit.base_ref, &commit.merge_ref) {
            let field = if is_resolved(merge_ref, &resolved, &mut lookup)? {
                "baseRef"
            } else {
                "mergeRef"
            };
            ack.ref_errors.insert(
                commit.id.clone(),
                RefError::unknown_ref(format!("unknown {field}")),
            );
            continue;
        }

        if let Err(e) = commit.validate_structure() {
            ack.ref_errors
                .insert(commit.id.clone(), RefError::invalid_commit(e.to_string()));
            continue;
        }

        if let Some(field) = missing_parent(commit, &resolved, &mut lookup)? {
            ack.ref_errors.insert(
                commit.id.clone(),
                RefError::unknown_ref(format!("unknown {field}")),
            );
            continue;
        }

        let main = heads.advance(commit);
        let server = commit.server.unwrap_or(ServerAnnotation {
            remote_sync_id: sync_id,
            remote_sync_index: index,
            main,
        });

        let mut stored = commit.clone();
        stored.server = Some(server);
        ack.acks.push(CommitAck {
            id: stored.id.clone(),
            metadata: stored.metadata.clone(),
            server,
        });
        inserts.push(StoredCommit {
            commit: stored,
            sync_id,
            sync_index: index,
        });
        resolved.insert(commit.id.clone());
        index += 1;
    }

    if !ack.ref_errors.is_empty() {
        tracing::warn!(
            sync_id = %sync_id,
            rejected = ack.ref_errors.len(),
            accepted = inserts.len(),
            "batch contained rejected commits"
        );
    }

    Ok(BatchPlan {
        inserts,
        ack,
        heads,
    })
}

/// Name of the first parent field that cannot be resolved, if any.
fn missing_parent<F>(
    commit: &Commit,
    resolved: &HashSet<CommitRef>,
    lookup: &mut F,
) -> Result<Option<&'static str>>
where
    F: FnMut(&CommitRef) -> Result<Option<Commit>>,
{
    let parents = [
        ("baseRef", commit.base_ref.as_ref()),
        ("mergeRef", commit.merge_ref.as_ref()),
    ];
    for (field, parent) in parents {
        let Some(parent) = parent else { continue };
        if !is_resolved(parent, resolved, lookup)? {
            return Ok(Some(field));
        }
    }
    Ok(None)
}

fn is_resolved<F>(r: &CommitRef, resolved: &HashSet<CommitRef>, lookup: &mut F) -> Result<bool>
where
    F: FnMut(&CommitRef) -> Result<Option<Commit>>,
{
    Ok(resolved.contains(r) || lookup(r)?.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::RefErrorCode;
    use std::collections::HashMap;

    fn plan(commits: &[Commit], stored: &HashMap<CommitRef, Commit>) -> BatchPlan {
        plan_batch(commits, HeadSet::new(), SyncId(1), |r| Ok(stored.get(r).cloned())).unwrap()
    }

    #[test]
    fn test_main_flags_for_branch_and_merge() {
        let batch = vec![
            Commit::new("1"),
            Commit::new("2").with_base("1"),
            Commit::new("3").with_base("1"),
            Commit::new("4").with_base("2").with_merge("3"),
        ];
        let plan = plan(&batch, &HashMap::new());

        let mains: Vec<bool> = plan.ack.acks.iter().map(|a| a.server.main).collect();
        assert_eq!(mains, vec![true, true, false, false]);
        let indexes: Vec<u32> = plan.inserts.iter().map(|s| s.sync_index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(plan.heads.single().map(CommitRef::as_str), Some("4"));
    }

    #[test]
    fn test_unknown_parent_rejects_chain() {
        let batch = vec![
            Commit::new("2").with_base("1"),
            Commit::new("3").with_base("2"),
            Commit::new("m").with_base("3").with_merge("x"),
        ];
        let plan = plan(&batch, &HashMap::new());

        assert!(plan.inserts.is_empty());
        assert!(plan.ack.acks.is_empty());
        assert_eq!(plan.ack.ref_errors.len(), 3);
        let err = &plan.ack.ref_errors[&CommitRef::from("2")];
        assert_eq!(err.code, RefErrorCode::UnknownRef);
        assert_eq!(err.message.as_deref(), Some("unknown baseRef"));
        assert!(plan.heads.is_empty());
    }

    #[test]
    fn test_unknown_merge_ref_message() {
        let batch = vec![Commit::new("1"), Commit::new("m").with_base("1").with_merge("x")];
        let plan = plan(&batch, &HashMap::new());
        let err = &plan.ack.ref_errors[&CommitRef::from("m")];
        assert_eq!(err.message.as_deref(), Some("unknown mergeRef"));
        assert_eq!(plan.inserts.len(), 1);
    }

    #[test]
    fn test_stored_ref_is_acked_not_inserted() {
        let mut stored = Commit::new("1");
        stored.server = Some(ServerAnnotation {
            remote_sync_id: SyncId(1),
            remote_sync_index: 0,
            main: true,
        });
        let existing = HashMap::from([(CommitRef::from("1"), stored)]);

        let batch = vec![Commit::new("1"), Commit::new("1"), Commit::new("2").with_base("1")];
        let plan = plan_batch(
            &batch,
            HeadSet::from_iter([CommitRef::from("1")]),
            SyncId(2),
            |r| Ok(existing.get(r).cloned()),
        )
        .unwrap();

        assert_eq!(plan.ack.acks.len(), 2);
        assert_eq!(plan.ack.acks[0].server.remote_sync_id, SyncId(1));
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].sync_index, 0);
        assert!(plan.inserts[0].commit.server.map_or(false, |s| s.main));
    }

    #[test]
    fn test_merge_without_base_is_unknown_ref() {
        let missing = plan(&[Commit::new("hello2").with_merge("unknown")], &HashMap::new());
        let err = &missing.ack.ref_errors[&CommitRef::from("hello2")];
        assert_eq!(err.code, RefErrorCode::UnknownRef);
        assert_eq!(err.message.as_deref(), Some("unknown mergeRef"));
        assert!(missing.inserts.is_empty());

        // The merge parent resolves, so the base is what is missing.
        let batch = vec![Commit::new("1"), Commit::new("x").with_merge("1")];
        let resolved = plan(&batch, &HashMap::new());
        let err = &resolved.ack.ref_errors[&CommitRef::from("x")];
        assert_eq!(err.code, RefErrorCode::UnknownRef);
        assert_eq!(err.message.as_deref(), Some("unknown baseRef"));
        assert_eq!(resolved.inserts.len(), 1);
    }

    #[test]
    fn test_self_reference_is_invalid() {
        let plan = plan(&[Commit::new("x").with_base("x")], &HashMap::new());
        assert_eq!(
            plan.ack.ref_errors[&CommitRef::from("x")].code,
            RefErrorCode::InvalidCommit
        );
    }

    #[test]
    fn test_existing_annotation_is_kept() {
        let relayed = ServerAnnotation {
            remote_sync_id: SyncId(40),
            remote_sync_index: 3,
            main: false,
        };
        let mut commit = Commit::new("1");
        commit.server = Some(relayed);

        let plan = plan(&[commit], &HashMap::new());
        assert_eq!(plan.ack.acks[0].server, relayed);
        assert_eq!(plan.inserts[0].sync_id, SyncId(1));
    }
}
