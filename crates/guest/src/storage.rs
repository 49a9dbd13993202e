//! Per-run storage facade.
//!
//! The guest receives the previous invocation's committed map by value,
//! mutates a local copy, and the difference is extracted at exit. Nothing
//! here is durable; persistence is the caller's concern.

use std::collections::BTreeMap;
use std::sync::Mutex;
use w3f_types::{StorageDelta, StorageError};

pub struct Web3FunctionStorage {
    pre: BTreeMap<String, String>,
    state: Mutex<BTreeMap<String, String>>,
}

impl Web3FunctionStorage {
    pub(crate) fn new(initial: BTreeMap<String, String>) -> Self {
        Self {
            pre: initial.clone(),
            state: Mutex::new(initial),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.state.lock().unwrap().insert(key.into(), value.into());
    }

    /// Dynamic-value variant of [`set`](Self::set): only JSON strings are
    /// accepted, anything else is a typed error the handler can surface.
    pub fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StorageError> {
        match value.as_str() {
            Some(s) => {
                self.set(key, s);
                Ok(())
            }
            None => Err(StorageError::NotAString {
                key: key.to_string(),
                got: json_type_name(value).to_string(),
            }),
        }
    }

    /// Records a tombstone: the key is absent from the post-state and shows
    /// up as `null` in the diff.
    pub fn delete(&self, key: &str) {
        self.state.lock().unwrap().remove(key);
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().clone()
    }

    pub(crate) fn delta(&self) -> StorageDelta {
        StorageDelta::compute(&self.pre, self.snapshot())
    }

    pub(crate) fn pre(&self) -> BTreeMap<String, String> {
        self.pre.clone()
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
