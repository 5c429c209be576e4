//! Merge engine: document materialization and head collapsing.
//!
//! The engine owns the commit graph of one working client and a cache of
//! materialized documents. Documents are derived from commits, which never
//! change, so cache entries are never invalidated.

use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;

use crate::commit::{hash_ref, Commit};
use crate::error::{GraphError, MergeError};
use crate::graph::CommitGraph;
use crate::types::{CommitRef, ServerAnnotation};

/// Application-supplied document operations.
///
/// The engine decides when and in which order these are invoked. Merge
/// semantics, including associativity across more than two heads, belong to
/// the implementation.
pub trait Differ: Send + Sync + 'static {
    /// Materialized document type.
    type Doc: Clone + PartialEq + Send + Sync + 'static;

    /// Compute the delta that turns `prior` into `next`.
    fn diff(&self, prior: Option<&Self::Doc>, next: &Self::Doc) -> anyhow::Result<Option<Bytes>>;

    /// Apply a delta. `prior` is `None` for root commits.
    fn patch(&self, prior: Option<&Self::Doc>, delta: Option<&Bytes>) -> anyhow::Result<Self::Doc>;

    /// Reconcile two branches into one document and metadata record.
    fn merge_all_branches(
        &self,
        base_doc: &Self::Doc,
        base_metadata: &Value,
        merge_doc: &Self::Doc,
        merge_metadata: &Value,
    ) -> anyhow::Result<(Self::Doc, Value)>;

    /// Compute the ref of a commit from its parents and content.
    fn compute_ref(
        &self,
        base_ref: Option<&CommitRef>,
        merge_ref: Option<&CommitRef>,
        delta: Option<&Bytes>,
        metadata: &Value,
    ) -> anyhow::Result<CommitRef> {
        Ok(hash_ref(base_ref, merge_ref, delta, metadata)?)
    }

    /// Upgrade a persisted document. Called once per load.
    fn migrate(&self, doc: Self::Doc, metadata: Value) -> anyhow::Result<(Self::Doc, Value)> {
        Ok((doc, metadata))
    }
}

/// Commit graph plus materialized document cache for one working client.
pub struct MergeEngine<D: Differ> {
    differ: D,
    graph: CommitGraph,
    docs: HashMap<CommitRef, D::Doc>,
}

impl<D: Differ> MergeEngine<D> {
    /// Create an engine with an empty graph.
    pub fn new(differ: D) -> Self {
        Self {
            differ,
            graph: CommitGraph::new(),
            docs: HashMap::new(),
        }
    }

    /// The application's differ.
    pub fn differ(&self) -> &D {
        &self.differ
    }

    /// The commit graph.
    pub fn graph(&self) -> &CommitGraph {
        &self.graph
    }

    /// Insert a commit whose parents are known. Returns false for known refs.
    pub fn add_commit(&mut self, commit: Commit) -> Result<bool, GraphError> {
        self.graph.insert(commit)
    }

    /// Record a store acknowledgement for a commit.
    pub fn annotate(&mut self, r: &CommitRef, server: ServerAnnotation) -> Result<(), GraphError> {
        self.graph.annotate(r, server)
    }

    /// The cached document for a ref, if already materialized.
    pub fn cached(&self, r: &CommitRef) -> Option<&D::Doc> {
        self.docs.get(r)
    }

    /// Materialize the document at `target`.
    ///
    /// Ancestors are resolved with an explicit stack, so chain length is not
    /// bounded by the call stack. A failing callback caches nothing for the
    /// failing ref.
    pub fn compute_doc(&mut self, target: &CommitRef) -> Result<D::Doc, MergeError> {
        let mut stack = vec![target.clone()];

        while let Some(r) = stack.last().cloned() {
            if self.docs.contains_key(&r) {
                stack.pop();
                continue;
            }

            let commit = self
                .graph
                .get(&r)
                .ok_or_else(|| GraphError::UnknownCommit(r.clone()))?;

            let pending: Vec<CommitRef> = commit
                .parents()
                .filter(|p| !self.docs.contains_key(*p))
                .cloned()
                .collect();
            if !pending.is_empty() {
                stack.extend(pending);
                continue;
            }

            let doc = materialize(&self.differ, &self.graph, &self.docs, commit).map_err(
                |source| MergeError::DocumentUnavailable {
                    commit: r.clone(),
                    source,
                },
            )?;
            self.docs.insert(r, doc);
            stack.pop();
        }

        self.docs
            .get(target)
            .cloned()
            .ok_or_else(|| GraphError::UnknownCommit(target.clone()).into())
    }

    /// Collapse all heads into one.
    ///
    /// Heads are sorted lexically and folded left pairwise, so every actor
    /// holding the same heads produces the same merge commits. Returns the
    /// created commits in creation order, empty if there was nothing to merge.
    pub fn merge_heads(&mut self) -> Result<Vec<Commit>, MergeError> {
        let heads: Vec<CommitRef> = self.graph.heads().iter().cloned().collect();
        let Some((first, rest)) = heads.split_first() else {
            return Ok(Vec::new());
        };

        let mut created = Vec::with_capacity(rest.len());
        let mut acc = first.clone();
        for head in rest {
            let commit = self.merge_pair(&acc, head)?;
            acc = commit.id.clone();
            created.push(commit);
        }

        if !created.is_empty() {
            tracing::debug!(merged = heads.len(), head = %acc, "collapsed divergent heads");
        }
        Ok(created)
    }

    /// Record a new document state on top of the current head.
    ///
    /// Divergent heads are merged first. Returns every commit created, merges
    /// first. Empty if `doc` equals the current document.
    pub fn commit_doc(&mut self, doc: D::Doc, metadata: Value) -> Result<Vec<Commit>, MergeError> {
        let mut created = self.merge_heads()?;

        let base = self.graph.heads().single().cloned();
        let prior = match &base {
            Some(r) => Some(self.compute_doc(r)?),
            None => None,
        };
        if prior.as_ref() == Some(&doc) {
            return Ok(created);
        }

        let delta = self
            .differ
            .diff(prior.as_ref(), &doc)
            .map_err(MergeError::Differ)?;
        let id = self
            .differ
            .compute_ref(base.as_ref(), None, delta.as_ref(), &metadata)
            .map_err(MergeError::Differ)?;

        let commit = Commit {
            id: id.clone(),
            base_ref: base,
            merge_ref: None,
            delta,
            metadata,
            server: None,
        };
        self.graph.insert(commit.clone())?;
        self.docs.insert(id, doc);
        created.push(commit);
        Ok(created)
    }

    fn merge_pair(&mut self, base: &CommitRef, merge: &CommitRef) -> Result<Commit, MergeError> {
        let base_doc = self.compute_doc(base)?;
        let merge_doc = self.compute_doc(merge)?;
        let base_meta = self.metadata_of(base)?;
        let merge_meta = self.metadata_of(merge)?;

        let unavailable = |source| MergeError::DocumentUnavailable {
            commit: merge.clone(),
            source,
        };
        let (doc, metadata) = self
            .differ
            .merge_all_branches(&base_doc, &base_meta, &merge_doc, &merge_meta)
            .map_err(unavailable)?;
        let id = self
            .differ
            .compute_ref(Some(base), Some(merge), None, &metadata)
            .map_err(unavailable)?;

        let commit = Commit {
            id: id.clone(),
            base_ref: Some(base.clone()),
            merge_ref: Some(merge.clone()),
            delta: None,
            metadata,
            server: None,
        };
        self.graph.insert(commit.clone())?;
        self.docs.entry(id).or_insert(doc);
        Ok(commit)
    }

    fn metadata_of(&self, r: &CommitRef) -> Result<Value, GraphError> {
        self.graph
            .get(r)
            .map(|c| c.metadata.clone())
            .ok_or_else(|| GraphError::UnknownCommit(r.clone()))
    }
}

/// Derive one commit's document from its already-materialized parents.
fn materialize<D: Differ>(
    differ: &D,
    graph: &CommitGraph,
    docs: &HashMap<CommitRef, D::Doc>,
    commit: &Commit,
) -> anyhow::Result<D::Doc> {
    let parent_doc = |r: &CommitRef| {
        docs.get(r)
            .ok_or_else(|| anyhow::anyhow!("parent {r} not materialized"))
    };

    match (&commit.base_ref, &commit.merge_ref) {
        (None, None) => differ.patch(None, commit.delta.as_ref()),
        (Some(base), None) => differ.patch(Some(parent_doc(base)?), commit.delta.as_ref()),
        (Some(base), Some(merge)) => {
            let meta = |r: &CommitRef| {
                graph
                    .get(r)
                    .map(|c| &c.metadata)
                    .ok_or_else(|| anyhow::anyhow!("parent {r} missing from graph"))
            };
            let (merged, _) = differ.merge_all_branches(
                parent_doc(base)?,
                meta(base)?,
                parent_doc(merge)?,
                meta(merge)?,
            )?;
            match &commit.delta {
                Some(delta) => differ.patch(Some(&merged), Some(delta)),
                None => Ok(merged),
            }
        }
        (None, Some(_)) => anyhow::bail!("commit {} has a mergeRef but no baseRef", commit.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    /// Documents are string sets; deltas list added items, comma-separated.
    struct SetDiffer;

    impl Differ for SetDiffer {
        type Doc = BTreeSet<String>;

        fn diff(&self, prior: Option<&Self::Doc>, next: &Self::Doc) -> anyhow::Result<Option<Bytes>> {
            let added: Vec<&str> = next
                .iter()
                .filter(|s| prior.map_or(true, |p| !p.contains(*s)))
                .map(String::as_str)
                .collect();
            Ok(Some(Bytes::from(added.join(","))))
        }

        fn patch(&self, prior: Option<&Self::Doc>, delta: Option<&Bytes>) -> anyhow::Result<Self::Doc> {
            let mut doc = prior.cloned().unwrap_or_default();
            if let Some(delta) = delta {
                let text = std::str::from_utf8(delta)?;
                if text == "boom" {
                    anyhow::bail!("patch exploded");
                }
                doc.extend(text.split(',').filter(|s| !s.is_empty()).map(str::to_owned));
            }
            Ok(doc)
        }

        fn merge_all_branches(
            &self,
            base_doc: &Self::Doc,
            _base_metadata: &Value,
            merge_doc: &Self::Doc,
            _merge_metadata: &Value,
        ) -> anyhow::Result<(Self::Doc, Value)> {
            if merge_doc.contains("poison") {
                anyhow::bail!("merge exploded");
            }
            let doc = base_doc.union(merge_doc).cloned().collect();
            Ok((doc, json!({"merge": true})))
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn divergent_engine() -> MergeEngine<SetDiffer> {
        let mut engine = MergeEngine::new(SetDiffer);
        engine.add_commit(Commit::new("1").with_delta("a")).unwrap();
        engine.add_commit(Commit::new("2").with_base("1").with_delta("b")).unwrap();
        engine.add_commit(Commit::new("3").with_base("1").with_delta("c")).unwrap();
        engine
    }

    #[test]
    fn test_compute_doc_linear() {
        let mut engine = divergent_engine();
        assert_eq!(engine.compute_doc(&"2".into()).unwrap(), set(&["a", "b"]));
        assert_eq!(engine.compute_doc(&"3".into()).unwrap(), set(&["a", "c"]));
        assert!(engine.cached(&"1".into()).is_some());
    }

    #[test]
    fn test_compute_doc_long_chain_is_iterative() {
        let mut engine = MergeEngine::new(SetDiffer);
        engine.add_commit(Commit::new("c0").with_delta("x0")).unwrap();
        for i in 1..20_000 {
            let c = Commit::new(format!("c{i}")).with_base(format!("c{}", i - 1));
            engine.add_commit(c).unwrap();
        }
        let doc = engine.compute_doc(&"c19999".into()).unwrap();
        assert_eq!(doc, set(&["x0"]));
    }

    #[test]
    fn test_merge_heads_collapses_to_one() {
        let mut engine = divergent_engine();
        let created = engine.merge_heads().unwrap();
        assert_eq!(created.len(), 1);

        let merge = &created[0];
        assert_eq!(merge.base_ref.as_ref().map(CommitRef::as_str), Some("2"));
        assert_eq!(merge.merge_ref.as_ref().map(CommitRef::as_str), Some("3"));
        assert!(merge.delta.is_none());
        assert_eq!(engine.graph().heads().single(), Some(&merge.id));
        assert_eq!(engine.compute_doc(&merge.id).unwrap(), set(&["a", "b", "c"]));

        assert!(engine.merge_heads().unwrap().is_empty());
    }

    fn poisoned_engine() -> MergeEngine<SetDiffer> {
        let mut engine = MergeEngine::new(SetDiffer);
        engine.add_commit(Commit::new("1").with_delta("a")).unwrap();
        engine.add_commit(Commit::new("2").with_base("1").with_delta("b")).unwrap();
        engine.add_commit(Commit::new("3").with_base("1").with_delta("poison")).unwrap();
        engine
    }

    #[test]
    fn test_failed_merge_in_compute_doc_caches_nothing() {
        let mut engine = poisoned_engine();
        engine.add_commit(Commit::new("m").with_base("2").with_merge("3")).unwrap();

        let err = engine.compute_doc(&"m".into()).unwrap_err();
        match err {
            MergeError::DocumentUnavailable { commit, .. } => assert_eq!(commit.as_str(), "m"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(engine.cached(&"m".into()).is_none());
        assert!(engine.cached(&"3".into()).is_some());
    }

    #[test]
    fn test_failed_merge_in_merge_heads_creates_nothing() {
        let mut engine = poisoned_engine();

        let err = engine.merge_heads().unwrap_err();
        match err {
            MergeError::DocumentUnavailable { commit, .. } => assert_eq!(commit.as_str(), "3"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.graph().len(), 3);
        assert_eq!(engine.graph().heads().len(), 2);
    }

    #[test]
    fn test_merge_heads_is_deterministic() {
        let mut a = divergent_engine();
        let mut b = MergeEngine::new(SetDiffer);
        // different arrival order
        b.add_commit(Commit::new("1").with_delta("a")).unwrap();
        b.add_commit(Commit::new("3").with_base("1").with_delta("c")).unwrap();
        b.add_commit(Commit::new("2").with_base("1").with_delta("b")).unwrap();

        let ma = a.merge_heads().unwrap();
        let mb = b.merge_heads().unwrap();
        assert_eq!(ma, mb);
        assert_eq!(a.compute_doc(&ma[0].id).unwrap(), b.compute_doc(&mb[0].id).unwrap());
    }

    #[test]
    fn test_merge_three_heads_folds_left() {
        let mut engine = divergent_engine();
        engine.add_commit(Commit::new("4").with_base("1").with_delta("d")).unwrap();

        let created = engine.merge_heads().unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].base_ref.as_ref(), Some(&created[0].id));
        assert_eq!(created[1].merge_ref.as_ref().map(CommitRef::as_str), Some("4"));
        assert_eq!(
            engine.compute_doc(&created[1].id).unwrap(),
            set(&["a", "b", "c", "d"])
        );
    }

    #[test]
    fn test_merge_commit_from_remote_materializes() {
        let mut source = divergent_engine();
        let merge = source.merge_heads().unwrap().remove(0);

        let mut engine = divergent_engine();
        engine.add_commit(merge.clone()).unwrap();
        assert_eq!(engine.compute_doc(&merge.id).unwrap(), set(&["a", "b", "c"]));
    }

    #[test]
    fn test_merge_commit_delta_overrides() {
        let mut engine = divergent_engine();
        engine
            .add_commit(Commit::new("m").with_base("2").with_merge("3").with_delta("z"))
            .unwrap();
        assert_eq!(engine.compute_doc(&"m".into()).unwrap(), set(&["a", "b", "c", "z"]));
    }

    #[test]
    fn test_patch_failure_is_not_cached() {
        let mut engine = MergeEngine::new(SetDiffer);
        engine.add_commit(Commit::new("1").with_delta("a")).unwrap();
        engine.add_commit(Commit::new("2").with_base("1").with_delta("boom")).unwrap();

        let err = engine.compute_doc(&"2".into()).unwrap_err();
        assert!(matches!(err, MergeError::DocumentUnavailable { commit, .. } if commit.as_str() == "2"));
        assert!(engine.cached(&"2".into()).is_none());
        assert!(engine.cached(&"1".into()).is_some());
    }

    #[test]
    fn test_commit_doc() {
        let mut engine = MergeEngine::new(SetDiffer);
        let first = engine.commit_doc(set(&["a"]), json!({})).unwrap();
        assert_eq!(first.len(), 1);
        assert!(first[0].is_root());

        let second = engine.commit_doc(set(&["a", "b"]), json!({})).unwrap();
        assert_eq!(second[0].base_ref.as_ref(), Some(&first[0].id));
        assert_eq!(second[0].delta.as_deref(), Some(&b"b"[..]));

        // unchanged document creates nothing
        assert!(engine.commit_doc(set(&["a", "b"]), json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_commit_doc_merges_first() {
        let mut engine = divergent_engine();
        let created = engine.commit_doc(set(&["a", "b", "c", "e"]), json!({})).unwrap();
        assert_eq!(created.len(), 2);
        assert!(created[0].is_merge());
        assert_eq!(created[1].base_ref.as_ref(), Some(&created[0].id));
    }
}
