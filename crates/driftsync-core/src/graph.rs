//! In-memory commit graph: an arena of commits keyed by ref.

use std::collections::HashMap;

use crate::commit::Commit;
use crate::error::GraphError;
use crate::heads::HeadSet;
use crate::types::{CommitRef, ServerAnnotation};

/// Arena of commits plus the derived head set.
///
/// Parents are looked up by ref, so shared ancestors never form ownership
/// cycles.
#[derive(Debug, Clone, Default)]
pub struct CommitGraph {
    commits: HashMap<CommitRef, Commit>,
    heads: HeadSet,
}

impl CommitGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a commit whose parents are already present.
    ///
    /// Returns `Ok(false)` if the ref was already known. An incoming server
    /// annotation is recorded on the stored copy if it had none.
    pub fn insert(&mut self, commit: Commit) -> Result<bool, GraphError> {
        if let Some(existing) = self.commits.get_mut(&commit.id) {
            if existing.server.is_none() {
                existing.server = commit.server;
            }
            return Ok(false);
        }

        commit.validate_structure()?;
        if let Some(parent) = commit.parents().find(|p| !self.commits.contains_key(*p)) {
            return Err(GraphError::UnknownParent {
                commit: commit.id.clone(),
                parent: parent.clone(),
            });
        }

        self.heads.advance(&commit);
        self.commits.insert(commit.id.clone(), commit);
        Ok(true)
    }

    /// Record a server annotation. Existing annotations are never replaced.
    pub fn annotate(&mut self, r: &CommitRef, server: ServerAnnotation) -> Result<(), GraphError> {
        let commit = self
            .commits
            .get_mut(r)
            .ok_or_else(|| GraphError::UnknownCommit(r.clone()))?;
        if commit.server.is_none() {
            commit.server = Some(server);
        }
        Ok(())
    }

    /// Look up a commit.
    pub fn get(&self, r: &CommitRef) -> Option<&Commit> {
        self.commits.get(r)
    }

    /// Check membership.
    pub fn contains(&self, r: &CommitRef) -> bool {
        self.commits.contains_key(r)
    }

    /// Current heads.
    pub fn heads(&self) -> &HeadSet {
        &self.heads
    }

    /// Number of commits.
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// True if the graph holds no commits.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncId;

    #[test]
    fn test_insert_requires_parents() {
        let mut graph = CommitGraph::new();
        let err = graph.insert(Commit::new("2").with_base("1")).unwrap_err();
        assert!(matches!(err, GraphError::UnknownParent { .. }));

        assert!(graph.insert(Commit::new("1")).unwrap());
        assert!(graph.insert(Commit::new("2").with_base("1")).unwrap());
        assert!(!graph.insert(Commit::new("2").with_base("1")).unwrap());
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.heads().single().map(CommitRef::as_str), Some("2"));
    }

    #[test]
    fn test_annotate_is_set_once() {
        let mut graph = CommitGraph::new();
        graph.insert(Commit::new("1")).unwrap();
        let r = CommitRef::from("1");

        let first = ServerAnnotation { remote_sync_id: SyncId(1), remote_sync_index: 0, main: true };
        let second = ServerAnnotation { remote_sync_id: SyncId(9), remote_sync_index: 3, main: false };
        graph.annotate(&r, first).unwrap();
        graph.annotate(&r, second).unwrap();
        assert_eq!(graph.get(&r).unwrap().server, Some(first));

        assert!(graph.annotate(&CommitRef::from("nope"), first).is_err());
    }
}
