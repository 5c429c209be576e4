//! Head set: refs with no known descendant.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::commit::Commit;
use crate::types::CommitRef;

/// The set of commits with no recorded descendant.
///
/// Kept sorted so iteration order is the lexical merge order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeadSet(BTreeSet<CommitRef>);

impl HeadSet {
    /// Create an empty head set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a newly inserted commit.
    ///
    /// `heads = (heads ∪ {commit}) − {baseRef, mergeRef}`. Returns the `main`
    /// flag for the commit: true iff it is not a merge and the resulting set
    /// is exactly `{commit}`.
    pub fn advance(&mut self, commit: &Commit) -> bool {
        for parent in commit.parents() {
            self.0.remove(parent);
        }
        self.0.insert(commit.id.clone());
        !commit.is_merge() && self.0.len() == 1
    }

    /// Number of heads.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no commit has been applied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if more than one head exists.
    pub fn is_divergent(&self) -> bool {
        self.0.len() > 1
    }

    /// The single head, if exactly one exists.
    pub fn single(&self) -> Option<&CommitRef> {
        if self.0.len() == 1 {
            self.0.iter().next()
        } else {
            None
        }
    }

    /// Check membership.
    pub fn contains(&self, r: &CommitRef) -> bool {
        self.0.contains(r)
    }

    /// Iterate in lexical order.
    pub fn iter(&self) -> impl Iterator<Item = &CommitRef> {
        self.0.iter()
    }
}

impl FromIterator<CommitRef> for HeadSet {
    fn from_iter<I: IntoIterator<Item = CommitRef>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_linear_chain_stays_main() {
        let mut heads = HeadSet::new();
        assert!(heads.advance(&Commit::new("1")));
        assert!(heads.advance(&Commit::new("2").with_base("1")));
        assert_eq!(heads.single().map(CommitRef::as_str), Some("2"));
    }

    #[test]
    fn test_branch_and_merge() {
        let mut heads = HeadSet::new();
        heads.advance(&Commit::new("1"));
        heads.advance(&Commit::new("2").with_base("1"));
        assert!(!heads.advance(&Commit::new("3").with_base("1")));
        assert!(heads.is_divergent());

        // merge collapses heads but is never main
        assert!(!heads.advance(&Commit::new("4").with_base("2").with_merge("3")));
        assert_eq!(heads.single().map(CommitRef::as_str), Some("4"));
    }

    #[test]
    fn test_second_root_is_not_main() {
        let mut heads = HeadSet::new();
        heads.advance(&Commit::new("a"));
        assert!(!heads.advance(&Commit::new("b")));
        assert_eq!(heads.len(), 2);
    }

    proptest! {
        #[test]
        fn linear_chain_has_one_head(len in 1usize..64) {
            let mut heads = HeadSet::new();
            let mut prev: Option<String> = None;
            for i in 0..len {
                let mut c = Commit::new(format!("c{i}"));
                if let Some(p) = &prev {
                    c = c.with_base(p.as_str());
                }
                prop_assert!(heads.advance(&c));
                prev = Some(format!("c{i}"));
            }
            prop_assert_eq!(heads.len(), 1);
        }
    }
}
