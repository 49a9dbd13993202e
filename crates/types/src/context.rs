//! The execution context handed to the guest for a single invocation.

use crate::user_args::UserArgs;
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Chain identifier, forwarded opaquely to the RPC proxy for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for ChainId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Task arguments injected by the automation network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GelatoArgs {
    pub chain_id: ChainId,
    /// Current gas price, arbitrary precision, decimal string on the wire.
    #[serde(with = "u256_dec")]
    pub gas_price: U256,
    pub task_id: String,
    /// Seconds since epoch; injected by the supervisor for V1 runs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<u64>,
}

/// Everything the guest needs to run one invocation. Built once per run by
/// the supervisor; frozen at guest entry except for `storage`, which the
/// guest mutates locally and returns as a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextData {
    pub gelato_args: GelatoArgs,
    #[serde(default)]
    pub user_args: UserArgs,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    /// Committed storage of the previous invocation.
    #[serde(default)]
    pub storage: BTreeMap<String, String>,
    /// Rewritten by the supervisor to point at the RPC proxy before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_provider_url: Option<String>,
    /// Opaque event payload for event-triggered invocations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<serde_json::Value>,
}

/// Decimal-string serde for [`U256`] gas prices.
pub mod u256_dec {
    use primitive_types::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        U256::from_dec_str(&raw).map_err(de::Error::custom)
    }
}
