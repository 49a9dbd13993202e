//! Multi-chain RPC facade pointing at the supervisor's RPC proxy.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use w3f_types::ChainId;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// The proxy returned HTTP 429: the run's call budget is spent. The
    /// agent exits with code 250 as soon as this is raised.
    #[error("RPC call limit exceeded")]
    Throttled,
    #[error("RPC transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(String),
}

struct ProviderInner {
    /// Proxy base URL with a trailing slash, e.g. `http://127.0.0.1:8545/`.
    base_url: String,
    default_chain_id: ChainId,
    client: reqwest::Client,
    next_id: AtomicU64,
    /// Signalled on the first 429 so the agent can terminate the run.
    throttle: Arc<Notify>,
}

/// Hands out per-chain providers, all funnelled through the RPC proxy.
#[derive(Clone)]
pub struct MultiChainProvider {
    inner: Arc<ProviderInner>,
}

impl MultiChainProvider {
    pub(crate) fn new(
        rpc_provider_url: &str,
        default_chain_id: ChainId,
        throttle: Arc<Notify>,
    ) -> Result<Self, reqwest::Error> {
        let base_url = if rpc_provider_url.ends_with('/') {
            rpc_provider_url.to_string()
        } else {
            format!("{rpc_provider_url}/")
        };
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            inner: Arc::new(ProviderInner {
                base_url,
                default_chain_id,
                client,
                next_id: AtomicU64::new(1),
                throttle,
            }),
        })
    }

    /// Provider for the run's default chain.
    pub fn default_provider(&self) -> ChainProvider {
        self.chain_id(self.inner.default_chain_id)
    }

    /// Provider routed to a specific chain id.
    pub fn chain_id(&self, chain_id: ChainId) -> ChainProvider {
        ChainProvider {
            inner: self.inner.clone(),
            chain_id,
        }
    }
}

/// JSON-RPC client bound to one chain.
#[derive(Clone)]
pub struct ChainProvider {
    inner: Arc<ProviderInner>,
    chain_id: ChainId,
}

impl ChainProvider {
    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Sends one JSON-RPC request and returns its `result` field.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let url = format!("{}{}", self.inner.base_url, self.chain_id);
        let resp = self.inner.client.post(&url).json(&payload).send().await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            self.inner.throttle.notify_one();
            return Err(ProviderError::Throttled);
        }
        let body: Value = resp.json().await?;
        if let Some(err) = body.get("error") {
            if !err.is_null() {
                return Err(ProviderError::Rpc(err.to_string()));
            }
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}
