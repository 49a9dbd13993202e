//! Accounting and policy tests for both mediation proxies, driven over
//! real loopback sockets.

use axum::{routing::get, routing::post, Json, Router};
use serde_json::{json, Value};
use w3f_proxy::{reserve_listener, HttpProxy, HttpProxyPolicy, RpcProxy};
use w3f_types::{ChainId, MultiChainProviderConfig};

/// Spawns a plain HTTP origin serving a fixed-size body under `/blob` and a
/// small greeting under `/hello`.
async fn spawn_origin(blob_size: usize) -> String {
    let app = Router::new()
        .route("/hello", get(|| async { "hello" }))
        .route(
            "/blob",
            get(move || async move { vec![0x61u8; blob_size] }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

/// Spawns a stub JSON-RPC upstream that echoes the request id.
async fn spawn_rpc_upstream() -> String {
    let app = Router::new().route(
        "/",
        post(|Json(body): Json<Value>| async move {
            Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": "0x10"}))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}/")
}

fn policy(request_limit: u64, download_limit: u64, upload_limit: u64) -> HttpProxyPolicy {
    HttpProxyPolicy {
        request_limit,
        download_limit,
        upload_limit,
        blacklisted_hosts: Vec::new(),
    }
}

fn proxied_client(proxy_port: u16) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://127.0.0.1:{proxy_port}")).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn egress_proxy_counts_requests_and_bytes() {
    let origin = spawn_origin(16).await;
    let (_port, listener) = reserve_listener().await.unwrap();
    let mut proxy = HttpProxy::start(listener, policy(10, 1024 * 1024, 1024 * 1024))
        .await
        .unwrap();
    let stats = proxy.stats();

    let client = proxied_client(proxy.port());
    let body = client
        .get(format!("{origin}/hello"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "hello");

    proxy.stop().await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.nb_requests, 1);
    assert_eq!(snapshot.nb_throttled, 0);
    assert_eq!(snapshot.download, 5);
}

#[tokio::test]
async fn egress_proxy_rejects_blacklisted_hosts() {
    let origin = spawn_origin(16).await;
    let (_port, listener) = reserve_listener().await.unwrap();
    let mut proxy = HttpProxy::start(
        listener,
        HttpProxyPolicy {
            request_limit: 10,
            download_limit: 1024,
            upload_limit: 1024,
            blacklisted_hosts: vec!["127.0.0.1".to_string()],
        },
    )
    .await
    .unwrap();
    let stats = proxy.stats();

    let client = proxied_client(proxy.port());
    let resp = client.get(format!("{origin}/hello")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    proxy.stop().await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.nb_requests, 0);
    assert_eq!(snapshot.nb_throttled, 1);
}

#[tokio::test]
async fn egress_proxy_enforces_the_request_limit() {
    let origin = spawn_origin(16).await;
    let (_port, listener) = reserve_listener().await.unwrap();
    let mut proxy = HttpProxy::start(listener, policy(2, 1024 * 1024, 1024 * 1024))
        .await
        .unwrap();
    let stats = proxy.stats();

    let client = proxied_client(proxy.port());
    for _ in 0..2 {
        let resp = client.get(format!("{origin}/hello")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
    }
    let resp = client.get(format!("{origin}/hello")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);

    proxy.stop().await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.nb_requests, 2);
    assert_eq!(snapshot.nb_throttled, 1);
}

#[tokio::test]
async fn egress_proxy_terminates_streams_over_the_download_cap() {
    let origin = spawn_origin(10 * 1024).await;
    let (_port, listener) = reserve_listener().await.unwrap();
    let mut proxy = HttpProxy::start(listener, policy(10, 1024, 1024 * 1024))
        .await
        .unwrap();
    let stats = proxy.stats();

    let client = proxied_client(proxy.port());
    // The body is cut mid-stream, so reading it must not yield the full blob.
    let fetched = match client.get(format!("{origin}/blob")).send().await {
        Ok(resp) => resp.bytes().await.map(|b| b.len()).unwrap_or(0),
        Err(_) => 0,
    };
    assert!(fetched < 10 * 1024);

    proxy.stop().await;
    let snapshot = stats.snapshot();
    assert!(snapshot.nb_throttled >= 1);
    assert!(snapshot.download <= 1024);
}

#[tokio::test]
async fn rpc_proxy_routes_and_enforces_the_call_budget() {
    let upstream = spawn_rpc_upstream().await;
    let (_port, listener) = reserve_listener().await.unwrap();
    let config = MultiChainProviderConfig::single(ChainId(1), upstream);
    let mut proxy = RpcProxy::start(listener, config, 2).await.unwrap();
    let stats = proxy.stats();

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/", proxy.port());
    for id in 0..2 {
        let resp = client
            .post(&url)
            .json(&json!({"jsonrpc": "2.0", "id": id, "method": "eth_blockNumber", "params": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["result"], json!("0x10"));
    }
    let resp = client
        .post(&url)
        .json(&json!({"jsonrpc": "2.0", "id": 3, "method": "eth_blockNumber", "params": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);

    proxy.stop().await;
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.total, 3);
    assert_eq!(snapshot.throttled, 1);
}

#[tokio::test]
async fn rpc_proxy_routes_by_chain_id_path() {
    let upstream = spawn_rpc_upstream().await;
    let (_port, listener) = reserve_listener().await.unwrap();
    let config = MultiChainProviderConfig::single(ChainId(137), upstream);
    let mut proxy = RpcProxy::start(listener, config, 10).await.unwrap();

    let client = reqwest::Client::new();
    let known = client
        .post(format!("http://127.0.0.1:{}/137", proxy.port()))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "eth_chainId", "params": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(known.status(), reqwest::StatusCode::OK);

    let unknown = client
        .post(format!("http://127.0.0.1:{}/1", proxy.port()))
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "eth_chainId", "params": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::BAD_GATEWAY);

    proxy.stop().await;
}
