//! The facade handed to user handlers.

use crate::provider::MultiChainProvider;
use crate::sink::LogSink;
use crate::storage::Web3FunctionStorage;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use w3f_types::{ContextData, GelatoArgs, UserArgs};

/// Read-only secret map; absent keys return `None`.
#[derive(Clone, Default)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    pub fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

#[derive(Error, Debug)]
pub enum EgressError {
    /// The guest refuses blacklisted hosts before they ever leave the
    /// sandbox; the egress proxy enforces the same list authoritatively.
    #[error("host '{0}' is blacklisted")]
    HostBlacklisted(String),
    #[error("invalid request URL: {0}")]
    InvalidUrl(#[from] reqwest::Error),
}

/// Outbound HTTP for handlers. Every request is checked against the run's
/// host blacklist, then routed through the egress proxy where the byte and
/// request quotas are accounted.
pub struct GuestHttp {
    client: reqwest::Client,
    blacklisted_hosts: Vec<String>,
}

impl GuestHttp {
    fn new(client: reqwest::Client, blacklisted_hosts: Vec<String>) -> Self {
        Self {
            client,
            blacklisted_hosts,
        }
    }

    pub fn get(&self, url: impl reqwest::IntoUrl) -> Result<reqwest::RequestBuilder, EgressError> {
        self.request(reqwest::Method::GET, url)
    }

    pub fn post(&self, url: impl reqwest::IntoUrl) -> Result<reqwest::RequestBuilder, EgressError> {
        self.request(reqwest::Method::POST, url)
    }

    pub fn request(
        &self,
        method: reqwest::Method,
        url: impl reqwest::IntoUrl,
    ) -> Result<reqwest::RequestBuilder, EgressError> {
        let url = url.into_url()?;
        if let Some(host) = url.host_str() {
            if self
                .blacklisted_hosts
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(host))
            {
                return Err(EgressError::HostBlacklisted(host.to_string()));
            }
        }
        Ok(self.client.request(method, url))
    }
}

/// Everything a handler can touch during one invocation. All network
/// egress from here is mediated: `http()` goes through the egress proxy,
/// `multi_chain_provider` through the RPC proxy.
pub struct Web3FunctionContext {
    pub gelato_args: GelatoArgs,
    pub user_args: UserArgs,
    pub secrets: Secrets,
    pub storage: Arc<Web3FunctionStorage>,
    pub multi_chain_provider: MultiChainProvider,
    http: GuestHttp,
    sink: LogSink,
    event: Option<serde_json::Value>,
}

impl Web3FunctionContext {
    pub(crate) fn build(
        data: ContextData,
        storage: Arc<Web3FunctionStorage>,
        proxy_url: Option<&str>,
        blacklisted_hosts: &[String],
        sink: LogSink,
        throttle: Arc<Notify>,
    ) -> Result<Self> {
        let rpc_url = data
            .rpc_provider_url
            .as_deref()
            .ok_or_else(|| anyhow!("context is missing rpcProviderUrl"))?;
        let multi_chain_provider =
            MultiChainProvider::new(rpc_url, data.gelato_args.chain_id, throttle)?;

        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let http = GuestHttp::new(builder.build()?, blacklisted_hosts.to_vec());

        Ok(Self {
            gelato_args: data.gelato_args,
            user_args: data.user_args,
            secrets: Secrets(data.secrets),
            storage,
            multi_chain_provider,
            http,
            sink,
            event: data.log,
        })
    }

    /// HTTP facade routing through the egress proxy, with the blacklist
    /// checked guest-side first.
    pub fn http(&self) -> &GuestHttp {
        &self.http
    }

    /// Emits a user-visible log line, surfaced in the execution report.
    pub fn log(&self, line: impl Into<String>) {
        self.sink.push(line);
    }

    /// The opaque event payload, present for event-triggered invocations.
    pub fn event(&self) -> Option<&serde_json::Value> {
        self.event.as_ref()
    }
}
