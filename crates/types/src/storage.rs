//! Storage deltas returned by the guest after an invocation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Whether the invocation changed its storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageState {
    #[serde(rename = "last")]
    Last,
    #[serde(rename = "updated")]
    Updated,
}

/// The difference between pre- and post-invocation storage. A key deleted by
/// the invocation appears in `diff` as `None` (JSON `null`); applying `diff`
/// to the pre-state yields `storage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDelta {
    pub state: StorageState,
    /// The full post-invocation storage map.
    pub storage: BTreeMap<String, String>,
    /// Changed keys only; `None` is a tombstone.
    pub diff: BTreeMap<String, Option<String>>,
}

impl StorageDelta {
    /// Computes the delta between a pre- and a post-invocation map.
    /// `state` is `Updated` iff the diff is non-empty.
    pub fn compute(
        pre: &BTreeMap<String, String>,
        post: BTreeMap<String, String>,
    ) -> Self {
        let mut diff: BTreeMap<String, Option<String>> = BTreeMap::new();
        for (key, value) in &post {
            if pre.get(key) != Some(value) {
                diff.insert(key.clone(), Some(value.clone()));
            }
        }
        for key in pre.keys() {
            if !post.contains_key(key) {
                diff.insert(key.clone(), None);
            }
        }
        let state = if diff.is_empty() {
            StorageState::Last
        } else {
            StorageState::Updated
        };
        Self {
            state,
            storage: post,
            diff,
        }
    }

    /// Delta for a run that did not touch storage (or failed before commit).
    pub fn unchanged(pre: BTreeMap<String, String>) -> Self {
        Self {
            state: StorageState::Last,
            storage: pre,
            diff: BTreeMap::new(),
        }
    }

    /// Applies the diff to a pre-state map; tombstones delete keys.
    pub fn apply_to(&self, pre: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut out = pre.clone();
        for (key, change) in &self.diff {
            match change {
                Some(value) => {
                    out.insert(key.clone(), value.clone());
                }
                None => {
                    out.remove(key);
                }
            }
        }
        out
    }

    /// Size of the serialized post-state, in kilobytes.
    pub fn size_kb(&self) -> f64 {
        let bytes = serde_json::to_string(&self.storage)
            .map(|s| s.len())
            .unwrap_or(0);
        bytes as f64 / 1024.0
    }
}
