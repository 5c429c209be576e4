//! Causal-order validation for incoming commit batches.
//!
//! A batch is accepted in the order it was given. Parents that are neither
//! earlier in the batch nor already known are reported so the caller can
//! fetch or wait for them. A parent that shows up *after* a commit that
//! needed it fails the whole call.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::commit::Commit;
use crate::error::ValidationError;
use crate::types::CommitRef;

/// Classification of a commit batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOrder {
    /// Commits in input order, each after its in-batch parents.
    pub new_commits: Vec<Commit>,
    /// Parents named in the batch that are absent and not known locally.
    pub referenced_commits: BTreeSet<CommitRef>,
    /// Structurally invalid commits and everything in the batch built on them.
    pub invalid_refs: BTreeSet<CommitRef>,
}

/// Validate a batch against an empty local graph.
pub fn validate_commit_order(commits: &[Commit]) -> Result<CommitOrder, ValidationError> {
    validate_commit_order_with(commits, |_| false)
}

/// Validate a batch, treating refs for which `is_known` holds as resolved.
///
/// Commits already known are dropped from `new_commits`. A ref repeated
/// within the batch is kept once, at its first position.
pub fn validate_commit_order_with<F>(
    commits: &[Commit],
    is_known: F,
) -> Result<CommitOrder, ValidationError>
where
    F: Fn(&CommitRef) -> bool,
{
    let mut seen: HashSet<&CommitRef> = HashSet::new();
    // missing parent -> first commit that needed it
    let mut referenced: BTreeMap<CommitRef, CommitRef> = BTreeMap::new();
    let mut invalid: BTreeSet<CommitRef> = BTreeSet::new();
    let mut new_commits = Vec::new();

    for commit in commits {
        if seen.contains(&commit.id) || invalid.contains(&commit.id) {
            continue;
        }

        if let Some(dependent) = referenced.get(&commit.id) {
            return Err(ValidationError::OrderViolation {
                parent: commit.id.clone(),
                dependent: dependent.clone(),
            });
        }

        if commit.validate_structure().is_err() || commit.parents().any(|p| invalid.contains(p)) {
            invalid.insert(commit.id.clone());
            continue;
        }

        seen.insert(&commit.id);
        if is_known(&commit.id) {
            continue;
        }

        for parent in commit.parents() {
            if !seen.contains(parent) && !is_known(parent) {
                referenced
                    .entry(parent.clone())
                    .or_insert_with(|| commit.id.clone());
            }
        }
        new_commits.push(commit.clone());
    }

    if !invalid.is_empty() {
        tracing::debug!(invalid = invalid.len(), "batch contains invalid commits");
    }

    Ok(CommitOrder {
        new_commits,
        referenced_commits: referenced.into_keys().collect(),
        invalid_refs: invalid,
    })
}
