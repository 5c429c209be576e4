//! Proptest generators for property-based testing.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use driftsync_core::{Commit, CommitRef};

/// Generate a random commit ref.
pub fn commit_ref() -> impl Strategy<Value = CommitRef> {
    "[a-z0-9]{8}".prop_map(CommitRef::new)
}

/// Generate a linear chain of up to `max_len` commits.
pub fn chain(max_len: usize) -> impl Strategy<Value = Vec<Commit>> {
    (1..=max_len).prop_map(|len| crate::fixtures::linear_chain("c", len))
}

/// Parameters for generating a commit DAG.
#[derive(Debug, Clone)]
pub struct DagParams {
    pub seed: u64,
    pub len: usize,
    /// Chance in percent that a non-root commit is a merge.
    pub merge_percent: u8,
}

impl Arbitrary for DagParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            any::<u64>(), // seed
            1usize..=40,  // len
            0u8..=50,     // merge_percent
        )
            .prop_map(|(seed, len, merge_percent)| DagParams {
                seed,
                len,
                merge_percent,
            })
            .boxed()
    }
}

/// Build a DAG in causal order. Commit `0` is the only root; every other
/// commit builds on an earlier one, and merges join two distinct earlier ones.
pub fn dag_from_params(params: &DagParams) -> Vec<Commit> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut commits: Vec<Commit> = Vec::with_capacity(params.len);

    for i in 0..params.len {
        let id = format!("n{i:03}");
        let mut commit = Commit::new(id.as_str()).with_metadata(json!({"n": i}));
        if i > 0 {
            let base = rng.gen_range(0..i);
            commit = commit.with_base(commits[base].id.clone());
            if i > 1 && rng.gen_range(0..100) < params.merge_percent {
                let mut other = rng.gen_range(0..i);
                if other == base {
                    other = (other + 1) % i;
                }
                commit = commit.with_merge(commits[other].id.clone());
            }
        }
        commits.push(commit);
    }
    commits
}
