//! The structured report returned for every run.

use crate::result::Web3FunctionVersion;
use crate::storage::{StorageState, StorageDelta};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// RPC proxy counters at the end of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStats {
    pub total: u64,
    pub throttled: u64,
}

/// HTTP egress proxy counters at the end of the run. `download` and
/// `upload` are kilobytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub nb_requests: u64,
    pub nb_throttled: u64,
    pub download: f64,
    pub upload: f64,
}

/// Which quotas the run hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleFlags {
    pub duration: bool,
    pub memory: bool,
    pub rpc_request: bool,
    pub network_request: bool,
    pub download: bool,
    pub upload: bool,
    pub storage: bool,
}

impl ThrottleFlags {
    pub fn any(&self) -> bool {
        self.duration
            || self.memory
            || self.rpc_request
            || self.network_request
            || self.download
            || self.upload
            || self.storage
    }
}

/// Storage section of a report: the delta plus its serialized size in KB.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStorage {
    pub state: StorageState,
    pub storage: BTreeMap<String, String>,
    pub diff: BTreeMap<String, Option<String>>,
    pub size: f64,
}

impl ReportStorage {
    pub fn from_delta(delta: StorageDelta, size: f64) -> Self {
        Self {
            state: delta.state,
            storage: delta.storage,
            diff: delta.diff,
            size,
        }
    }
}

/// The outcome of one supervised execution, JSON-serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub success: bool,
    pub version: Web3FunctionVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<ReportStorage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<String>,
    /// Wall-clock duration in seconds.
    pub duration: f64,
    /// Peak sampled memory in MB.
    pub memory: f64,
    pub rpc_calls: RpcStats,
    pub network: NetworkStats,
    pub throttled: ThrottleFlags,
}
