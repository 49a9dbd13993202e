//! JSON-RPC proxy.
//!
//! The guest's provider facade points here. Requests are routed per chain
//! id to the upstream endpoint from the multi-chain provider config; the
//! call budget is enforced with HTTP 429 once spent, which the guest
//! translates into its throttled exit code.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use w3f_types::{ChainId, MultiChainProviderConfig, RpcStats};

#[derive(Debug, Default)]
pub struct RpcProxyStats {
    total: AtomicU64,
    throttled: AtomicU64,
}

impl RpcProxyStats {
    pub fn snapshot(&self) -> RpcStats {
        RpcStats {
            total: self.total.load(Ordering::SeqCst),
            throttled: self.throttled.load(Ordering::SeqCst),
        }
    }
}

struct RpcState {
    config: MultiChainProviderConfig,
    limit: u64,
    stats: Arc<RpcProxyStats>,
    client: reqwest::Client,
}

/// One-run RPC proxy on a reserved loopback port.
pub struct RpcProxy {
    stats: Arc<RpcProxyStats>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    port: u16,
}

impl RpcProxy {
    pub async fn start(
        listener: TcpListener,
        config: MultiChainProviderConfig,
        rpc_limit: u64,
    ) -> anyhow::Result<Self> {
        let port = listener.local_addr()?.port();
        let stats = Arc::new(RpcProxyStats::default());
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(30))
            .build()?;
        let state = Arc::new(RpcState {
            config,
            limit: rpc_limit,
            stats: stats.clone(),
            client,
        });

        let app = Router::new()
            .route("/", post(relay_default))
            .route("/{chain_id}", post(relay_chain))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(state);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                shutdown_rx.changed().await.ok();
            });
            if let Err(e) = server.await {
                tracing::error!(target: "rpc-proxy", error = %e, "server error");
            }
        });

        tracing::debug!(target: "rpc-proxy", port, "rpc proxy listening");
        Ok(Self {
            stats,
            shutdown,
            task: Some(task),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Shared handle onto the call counters; final once `stop` returns.
    pub fn stats(&self) -> Arc<RpcProxyStats> {
        self.stats.clone()
    }

    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

async fn relay_default(State(state): State<Arc<RpcState>>, body: Bytes) -> Response {
    let chain_id = state.config.default_chain_id;
    relay(state, chain_id, body).await
}

async fn relay_chain(
    State(state): State<Arc<RpcState>>,
    Path(chain_id): Path<u64>,
    body: Bytes,
) -> Response {
    relay(state, ChainId(chain_id), body).await
}

async fn relay(state: Arc<RpcState>, chain_id: ChainId, body: Bytes) -> Response {
    let nth = state.stats.total.fetch_add(1, Ordering::SeqCst) + 1;
    if nth > state.limit {
        state.stats.throttled.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"message": "RPC requests limit exceeded"}})),
        )
            .into_response();
    }

    let Some(url) = state.config.url_for(chain_id) else {
        return (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": {"message": format!("no RPC provider configured for chain {chain_id}")}})),
        )
            .into_response();
    };

    let upstream = state
        .client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await;
    match upstream {
        Ok(resp) => {
            let status = resp.status();
            match resp.bytes().await {
                Ok(bytes) => {
                    let mut out = ([(CONTENT_TYPE, "application/json")], bytes).into_response();
                    *out.status_mut() = status;
                    out
                }
                Err(e) => upstream_error(chain_id, e).into_response(),
            }
        }
        Err(e) => upstream_error(chain_id, e).into_response(),
    }
}

fn upstream_error(chain_id: ChainId, err: reqwest::Error) -> impl IntoResponse {
    tracing::debug!(target: "rpc-proxy", %chain_id, error = %err, "upstream RPC call failed");
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({"error": {"message": format!("upstream RPC call failed: {err}")}})),
    )
}
