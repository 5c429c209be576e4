//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Map, Value};

use driftsync::{Client, ClientConfig, Differ};
use driftsync_core::Commit;
use driftsync_store::{MemoryBacking, MemoryDocStore};
use driftsync_sync::memory::MemoryBus;
use driftsync_sync::{ActorId, RemoteConnector};

/// Document type of [`JsonDiffer`].
pub type JsonDoc = Map<String, Value>;

/// A differ over flat JSON objects.
///
/// Deltas are `{"set": {..}, "del": [..]}`. Merging takes the union of keys;
/// when both sides hold different values for a key, the value with the
/// larger JSON encoding wins, so merges are commutative.
#[derive(Debug, Clone, Default)]
pub struct JsonDiffer {
    /// Key inserted by `migrate`, if any.
    pub migration: Option<(String, Value)>,
}

impl JsonDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A differ whose migration sets `key` to `value`.
    pub fn migrating(key: impl Into<String>, value: Value) -> Self {
        Self {
            migration: Some((key.into(), value)),
        }
    }
}

impl Differ for JsonDiffer {
    type Doc = JsonDoc;

    fn diff(&self, prior: Option<&JsonDoc>, next: &JsonDoc) -> anyhow::Result<Option<Bytes>> {
        let empty = JsonDoc::new();
        let prior = prior.unwrap_or(&empty);

        let set: JsonDoc = next
            .iter()
            .filter(|(k, v)| prior.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let del: Vec<&String> = prior.keys().filter(|k| !next.contains_key(*k)).collect();
        if set.is_empty() && del.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(serde_json::to_vec(
            &json!({"set": set, "del": del}),
        )?)))
    }

    fn patch(&self, prior: Option<&JsonDoc>, delta: Option<&Bytes>) -> anyhow::Result<JsonDoc> {
        let mut doc = prior.cloned().unwrap_or_default();
        let Some(delta) = delta else {
            return Ok(doc);
        };

        let delta: Value = serde_json::from_slice(delta)?;
        anyhow::ensure!(delta.is_object(), "delta is not an object");
        if let Some(set) = delta.get("set").and_then(Value::as_object) {
            for (k, v) in set {
                doc.insert(k.clone(), v.clone());
            }
        }
        if let Some(del) = delta.get("del").and_then(Value::as_array) {
            for k in del.iter().filter_map(Value::as_str) {
                doc.remove(k);
            }
        }
        Ok(doc)
    }

    fn merge_all_branches(
        &self,
        base_doc: &JsonDoc,
        _base_metadata: &Value,
        merge_doc: &JsonDoc,
        _merge_metadata: &Value,
    ) -> anyhow::Result<(JsonDoc, Value)> {
        let mut doc = base_doc.clone();
        for (k, v) in merge_doc {
            let take = match doc.get(k) {
                Some(existing) => v.to_string() > existing.to_string(),
                None => true,
            };
            if take {
                doc.insert(k.clone(), v.clone());
            }
        }
        Ok((doc, json!({"merged": true})))
    }

    fn migrate(&self, mut doc: JsonDoc, metadata: Value) -> anyhow::Result<(JsonDoc, Value)> {
        if let Some((key, value)) = &self.migration {
            doc.insert(key.clone(), value.clone());
        }
        Ok((doc, metadata))
    }
}

/// Build a [`JsonDoc`] from a `json!` object literal.
pub fn doc(value: Value) -> JsonDoc {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A root commit.
pub fn root(id: &str) -> Commit {
    Commit::new(id)
}

/// A commit on top of `base`.
pub fn child(id: &str, base: &str) -> Commit {
    Commit::new(id).with_base(base)
}

/// A merge of `merge` into `base`.
pub fn merge(id: &str, base: &str, merge: &str) -> Commit {
    Commit::new(id).with_base(base).with_merge(merge)
}

/// `1`, `2(base 1)`, `3(base 1)`, `4(base 2, merge 3)`.
pub fn diamond() -> Vec<Commit> {
    vec![root("1"), child("2", "1"), child("3", "1"), merge("4", "2", "3")]
}

/// `len` commits, each on top of the previous one.
pub fn linear_chain(prefix: &str, len: usize) -> Vec<Commit> {
    (0..len)
        .map(|i| {
            let id = format!("{prefix}{i}");
            match i {
                0 => root(&id),
                _ => child(&id, &format!("{prefix}{}", i - 1)),
            }
        })
        .collect()
}

/// Install a test-writer tracing subscriber. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One device: a shared store backing and a local bus.
pub struct Device {
    pub backing: Arc<MemoryBacking>,
    pub bus: Arc<MemoryBus>,
    pub user_id: String,
    remote: Option<Arc<dyn RemoteConnector>>,
    opened: usize,
}

impl Device {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            backing: MemoryBacking::new(),
            bus: MemoryBus::new(),
            user_id: user_id.into(),
            remote: None,
            opened: 0,
        }
    }

    /// Give every client opened from now on a remote.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteConnector>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Open a client with a fresh store handle and bus endpoint.
    pub fn open_client(&mut self, differ: JsonDiffer) -> driftsync::Result<Client<JsonDiffer>> {
        self.opened += 1;
        let store = MemoryDocStore::open(self.backing.clone())?;
        let config = ClientConfig::new(
            self.user_id.clone(),
            format!("{}-{}", self.user_id, self.opened),
        );
        Ok(Client::open(
            differ,
            store,
            self.bus.join(ActorId::random()),
            self.remote.clone(),
            config,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::MergeEngine;

    #[test]
    fn test_diff_patch_reproduces_doc() {
        let differ = JsonDiffer::new();
        let before = doc(json!({"a": 1, "b": 2}));
        let after = doc(json!({"a": 1, "c": [3]}));

        let delta = differ.diff(Some(&before), &after).unwrap();
        let patched = differ.patch(Some(&before), delta.as_ref()).unwrap();
        assert_eq!(patched, after);
        assert_eq!(differ.diff(Some(&after), &after).unwrap(), None);
    }

    #[test]
    fn test_merge_is_commutative() {
        let differ = JsonDiffer::new();
        let left = doc(json!({"a": 1, "x": "left"}));
        let right = doc(json!({"b": 2, "x": "right"}));

        let (lr, _) = differ
            .merge_all_branches(&left, &Value::Null, &right, &Value::Null)
            .unwrap();
        let (rl, _) = differ
            .merge_all_branches(&right, &Value::Null, &left, &Value::Null)
            .unwrap();
        assert_eq!(lr, rl);
        assert_eq!(lr, doc(json!({"a": 1, "b": 2, "x": "right"})));
    }

    #[test]
    fn test_bad_delta_is_an_error() {
        let differ = JsonDiffer::new();
        assert!(differ.patch(None, Some(&Bytes::from_static(b"[1]"))).is_err());
        assert!(differ.patch(None, Some(&Bytes::from_static(b"nope"))).is_err());
    }

    #[test]
    fn test_engine_with_json_differ() {
        let mut engine = MergeEngine::new(JsonDiffer::new());
        engine.commit_doc(doc(json!({"a": 1})), json!({})).unwrap();
        let created = engine.commit_doc(doc(json!({"a": 2})), json!({})).unwrap();
        let head = created[0].id.clone();
        assert_eq!(engine.compute_doc(&head).unwrap(), doc(json!({"a": 2})));
    }

    #[test]
    fn test_chain_helpers() {
        let chain = linear_chain("c", 3);
        assert_eq!(chain[2].base_ref.as_ref().map(|r| r.as_str()), Some("c1"));
        assert!(diamond()[3].is_merge());
    }
}
