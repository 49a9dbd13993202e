//! Runner configuration and the multi-chain provider table.

use crate::context::ChainId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which sandbox variant hosts the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxRuntime {
    #[serde(rename = "thread")]
    Thread,
    #[serde(rename = "container")]
    Container,
}

impl Default for SandboxRuntime {
    fn default() -> Self {
        Self::Thread
    }
}

/// Resource quotas and policies for one supervised execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerOptions {
    pub runtime: SandboxRuntime,
    /// Guest memory cap in bytes.
    pub memory: u64,
    /// Execution timeout in milliseconds.
    pub timeout: u64,
    /// Maximum number of RPC calls.
    pub rpc_limit: u32,
    /// Maximum number of outbound HTTP requests.
    pub request_limit: u32,
    /// Cumulative download cap in bytes.
    pub download_limit: u64,
    /// Cumulative upload cap in bytes.
    pub upload_limit: u64,
    /// Storage size budget in kilobytes.
    pub storage_limit: u64,
    /// Hosts the egress proxy refuses to forward to.
    pub blacklisted_hosts: Vec<String>,
    /// Mirror guest log lines to the supervisor's own log output.
    pub show_logs: bool,
    /// Pin the guest protocol port instead of picking a free one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_port: Option<u16>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            runtime: SandboxRuntime::Thread,
            memory: 128 * 1024 * 1024,
            timeout: 30_000,
            rpc_limit: 100,
            request_limit: 100,
            download_limit: 10 * 1024 * 1024,
            upload_limit: 5 * 1024 * 1024,
            storage_limit: 1024,
            blacklisted_hosts: Vec::new(),
            show_logs: false,
            server_port: None,
        }
    }
}

impl RunnerOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout == 0 {
            return Err("runner timeout must be non-zero".to_string());
        }
        if self.memory == 0 {
            return Err("runner memory limit must be non-zero".to_string());
        }
        if self.rpc_limit == 0 {
            return Err("runner rpc limit must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Upstream RPC endpoints keyed by chain id, with a default chain for
/// requests that do not name one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiChainProviderConfig {
    pub default_chain_id: ChainId,
    pub providers: BTreeMap<ChainId, String>,
}

impl MultiChainProviderConfig {
    pub fn single(chain_id: ChainId, url: impl Into<String>) -> Self {
        Self {
            default_chain_id: chain_id,
            providers: BTreeMap::from([(chain_id, url.into())]),
        }
    }

    pub fn url_for(&self, chain_id: ChainId) -> Option<&str> {
        self.providers.get(&chain_id).map(String::as_str)
    }

    pub fn default_url(&self) -> Option<&str> {
        self.url_for(self.default_chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert!(RunnerOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let options = RunnerOptions {
            timeout: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn provider_lookup() {
        let config = MultiChainProviderConfig::single(ChainId(137), "http://rpc.local");
        assert_eq!(config.default_url(), Some("http://rpc.local"));
        assert_eq!(config.url_for(ChainId(1)), None);
    }
}
