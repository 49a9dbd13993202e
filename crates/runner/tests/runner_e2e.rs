//! End-to-end runs through the thread runtime: real protocol socket, real
//! proxies, stub upstream servers on loopback.

use axum::{routing::get, routing::post, Json, Router};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use w3f_guest::{handler_fn, Web3FunctionAgent};
use w3f_runner::{RunnerPayload, Web3FunctionRunner};
use w3f_sandbox::ScriptSource;
use w3f_types::{
    ChainId, ContextData, GelatoArgs, MultiChainProviderConfig, RunnerOptions, SandboxRuntime,
    StorageState, Web3FunctionVersion, U256,
};

const ADDRESS: &str = "0x0000000000000000000000000000000000000001";

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

async fn spawn_origin(blob_size: usize) -> String {
    let app = Router::new().route(
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

fn options() -> RunnerOptions {
    RunnerOptions {
        runtime: SandboxRuntime::Thread,
        timeout: 10_000,
        ..Default::default()
    }
}

fn context(storage: BTreeMap<String, String>) -> ContextData {
    ContextData {
        gelato_args: GelatoArgs {
            chain_id: ChainId(1),
            gas_price: U256::from(1_000_000_000u64),
            task_id: "task-1".to_string(),
            block_time: None,
        },
        user_args: BTreeMap::new(),
        secrets: BTreeMap::from([("apiKey".to_string(), "s3cret".to_string())]),
        storage,
        rpc_provider_url: None,
        log: None,
    }
}

async fn payload(
    agent: Web3FunctionAgent,
    version: Web3FunctionVersion,
    context: ContextData,
) -> RunnerPayload {
    // First caller wins; subsequent installs fail and are ignored.
    let _ = w3f_telemetry::init_tracing();
    let upstream = spawn_rpc_upstream().await;
    RunnerPayload {
        script: ScriptSource::Handler(agent),
        version,
        context,
        provider_config: MultiChainProviderConfig::single(ChainId(1), upstream),
    }
}

#[tokio::test]
async fn s1_v2_happy_path_updates_storage() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|ctx| async move {
        ctx.storage.set("k", "v");
        Ok(json!({
            "canExec": true,
            "callData": [{"to": ADDRESS, "data": "0xdeadbeef"}]
        }))
    }));
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(report.success, "report: {:?}", report.error);
    let storage = report.storage.expect("storage section");
    assert_eq!(storage.state, StorageState::Updated);
    assert_eq!(storage.diff.get("k"), Some(&Some("v".to_string())));
    assert_eq!(storage.size, 0.01);
    assert!(!report.throttled.any());
    assert_eq!(
        report.result.unwrap()["callData"][0]["data"],
        json!("0xdeadbeef")
    );
}

#[tokio::test]
async fn s2_v1_happy_path_leaves_storage_alone() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|_ctx| async move {
        Ok(json!({"canExec": false, "callData": "0x"}))
    }));
    let mut runner = Web3FunctionRunner::new(options());
    let pre = BTreeMap::from([("seen".to_string(), "1".to_string())]);
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V1, context(pre.clone())).await)
        .await
        .unwrap();

    assert!(report.success, "report: {:?}", report.error);
    let storage = report.storage.expect("storage section");
    assert_eq!(storage.state, StorageState::Last);
    assert!(storage.diff.is_empty());
    assert_eq!(storage.storage, pre);
}

#[tokio::test]
async fn v1_runs_get_block_time_injected() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|ctx| async move {
        Ok(json!({
            "canExec": false,
            "observedBlockTime": ctx.gelato_args.block_time,
        }))
    }));
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V1, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(report.success);
    let observed = report.result.unwrap()["observedBlockTime"]
        .as_u64()
        .expect("blockTime must be injected for V1");
    // Sanity: some time after 2023-01-01.
    assert!(observed > 1_672_531_200);
}

#[tokio::test]
async fn s3_invalid_result_fails_validation() {
    let agent = Web3FunctionAgent::new()
        .on_run(handler_fn(|_ctx| async move { Ok(json!({"canExec": true})) }));
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.error.unwrap().contains("must return"));
}

#[tokio::test]
async fn s4_timeout_sets_the_duration_throttle() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|_ctx| async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({"canExec": false}))
    }));
    let mut runner = Web3FunctionRunner::new(RunnerOptions {
        timeout: 1_000,
        ..options()
    });
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.throttled.duration);
    assert!(report.duration >= 1.0);
}

#[tokio::test]
async fn s5_download_cap_sets_the_download_throttle() {
    let origin = spawn_origin(10 * 1024).await;
    let blob_url = format!("{origin}/blob");
    let agent = Web3FunctionAgent::new().on_run(handler_fn(move |ctx| {
        let blob_url = blob_url.clone();
        async move {
            // The proxy cuts the body mid-stream; the fetch error is the
            // expected shape of a capped download.
            if let Ok(resp) = ctx.http().get(&blob_url)?.send().await {
                let _ = resp.bytes().await;
            }
            Ok(json!({"canExec": false}))
        }
    }));
    let mut runner = Web3FunctionRunner::new(RunnerOptions {
        download_limit: 1024,
        ..options()
    });
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(report.success, "report: {:?}", report.error);
    assert!(report.throttled.download);
    assert!(!report.throttled.network_request);
    assert!(report.network.nb_throttled >= 1);
    assert!(report.network.download <= 1.0);
}

#[tokio::test]
async fn s6_rpc_budget_exhaustion_exits_with_the_throttled_code() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|ctx| async move {
        let provider = ctx.multi_chain_provider.default_provider();
        for _ in 0..5 {
            if provider.request("eth_blockNumber", json!([])).await.is_err() {
                // Keep going: the agent terminates the run underneath us.
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
        Ok(json!({"canExec": false}))
    }));
    let mut runner = Web3FunctionRunner::new(RunnerOptions {
        rpc_limit: 2,
        ..options()
    });
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.throttled.rpc_request);
    assert!(report.rpc_calls.total >= 3);
    assert!(report.rpc_calls.throttled >= 1);
}

#[tokio::test]
async fn storage_tombstones_apply_back_onto_the_pre_state() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|ctx| async move {
        ctx.storage.delete("a");
        ctx.storage.set("b", "3");
        Ok(json!({"canExec": false}))
    }));
    let mut runner = Web3FunctionRunner::new(options());
    let pre = BTreeMap::from([
        ("a".to_string(), "1".to_string()),
        ("b".to_string(), "2".to_string()),
    ]);
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(pre.clone())).await)
        .await
        .unwrap();

    let storage = report.storage.expect("storage section");
    assert_eq!(storage.state, StorageState::Updated);
    assert_eq!(storage.diff.get("a"), Some(&None));
    assert_eq!(storage.diff.get("b"), Some(&Some("3".to_string())));
    // Applying the diff to the pre-state yields the post-state.
    let mut applied = pre;
    for (key, change) in &storage.diff {
        match change {
            Some(value) => {
                applied.insert(key.clone(), value.clone());
            }
            None => {
                applied.remove(key);
            }
        }
    }
    assert_eq!(applied, storage.storage);
}

#[tokio::test]
async fn guest_errors_become_failure_reports() {
    let agent = Web3FunctionAgent::new()
        .on_run(handler_fn(|_ctx| async move { Err(anyhow::anyhow!("boom")) }));
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.error.unwrap().contains("boom"));
    assert!(!report.throttled.any());
}

#[tokio::test]
async fn missing_handler_is_a_guest_error() {
    let agent = Web3FunctionAgent::new();
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.error.unwrap().contains("not registered"));
}

#[tokio::test]
async fn event_invocations_route_to_the_event_handler() {
    let agent = Web3FunctionAgent::new().on_event(handler_fn(|ctx| async move {
        let block = ctx.event().and_then(|log| log["blockNumber"].as_u64());
        Ok(json!({"canExec": false, "observedBlock": block}))
    }));
    let mut runner = Web3FunctionRunner::new(options());
    let mut ctx = context(BTreeMap::new());
    ctx.log = Some(json!({"blockNumber": 123, "topics": []}));
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, ctx).await)
        .await
        .unwrap();

    assert!(report.success, "report: {:?}", report.error);
    assert_eq!(report.result.unwrap()["observedBlock"], json!(123));
}

#[tokio::test]
async fn event_invocation_without_event_handler_fails() {
    let agent = Web3FunctionAgent::new()
        .on_run(handler_fn(|_ctx| async move { Ok(json!({"canExec": false})) }));
    let mut runner = Web3FunctionRunner::new(options());
    let mut ctx = context(BTreeMap::new());
    ctx.log = Some(json!({"blockNumber": 7}));
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, ctx).await)
        .await
        .unwrap();

    assert!(!report.success);
    assert!(report.error.unwrap().contains("event handler"));
}

#[tokio::test]
async fn secrets_and_context_logs_flow_through() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|ctx| async move {
        ctx.log(format!(
            "api key present: {}",
            ctx.secrets.get("apiKey").is_some()
        ));
        ctx.log("done");
        Ok(json!({"canExec": false}))
    }));
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(
        report.logs,
        vec!["api key present: true".to_string(), "done".to_string()]
    );
}

#[tokio::test]
async fn rpc_calls_are_counted_in_the_report() {
    let agent = Web3FunctionAgent::new().on_run(handler_fn(|ctx| async move {
        let provider = ctx.multi_chain_provider.chain_id(ChainId(1));
        let block = provider.request("eth_blockNumber", json!([])).await?;
        Ok(json!({"canExec": false, "block": block}))
    }));
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(report.success, "report: {:?}", report.error);
    assert_eq!(report.rpc_calls.total, 1);
    assert_eq!(report.rpc_calls.throttled, 0);
    assert_eq!(report.result.unwrap()["block"], json!("0x10"));
}

#[tokio::test]
async fn request_limit_exhaustion_sets_the_network_throttle() {
    let origin = spawn_origin(8).await;
    let blob_url = format!("{origin}/blob");
    let agent = Web3FunctionAgent::new().on_run(handler_fn(move |ctx| {
        let blob_url = blob_url.clone();
        async move {
            for _ in 0..4 {
                let _ = ctx.http().get(&blob_url)?.send().await;
            }
            Ok(json!({"canExec": false}))
        }
    }));
    let mut runner = Web3FunctionRunner::new(RunnerOptions {
        request_limit: 2,
        ..options()
    });
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(report.success);
    assert!(report.throttled.network_request);
    assert_eq!(report.network.nb_requests, 2);
    assert!(report.network.nb_throttled >= 2);
}

#[tokio::test]
async fn blacklisted_hosts_are_refused_guest_side_before_egress() {
    let origin = spawn_origin(8).await;
    let blob_url = format!("{origin}/blob");
    let agent = Web3FunctionAgent::new().on_run(handler_fn(move |ctx| {
        let blob_url = blob_url.clone();
        async move {
            let refusal = ctx
                .http()
                .get(&blob_url)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default();
            Ok(json!({"canExec": false, "refusal": refusal}))
        }
    }));
    let mut runner = Web3FunctionRunner::new(RunnerOptions {
        blacklisted_hosts: vec!["127.0.0.1".to_string()],
        ..options()
    });
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    assert!(report.success);
    let refusal = report.result.unwrap()["refusal"].as_str().unwrap().to_string();
    assert!(refusal.contains("blacklisted"));
    // Refused before leaving the guest: the proxy never saw the request.
    assert_eq!(report.network.nb_requests, 0);
    assert!(!report.throttled.network_request);
}

#[tokio::test]
async fn stop_is_idempotent_and_runs_can_repeat() {
    let make_agent = || {
        Web3FunctionAgent::new()
            .on_run(handler_fn(|_ctx| async move { Ok(json!({"canExec": false})) }))
    };
    let mut runner = Web3FunctionRunner::new(options());

    let first = runner
        .run(payload(make_agent(), Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();
    assert!(first.success);

    // `stop` after `run` must be a no-op, repeatedly.
    runner.stop().await;
    runner.stop().await;

    let second = runner
        .run(payload(make_agent(), Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();
    assert!(second.success);
}

#[tokio::test]
async fn reports_serialize_with_camel_case_counters() {
    let agent = Web3FunctionAgent::new()
        .on_run(handler_fn(|_ctx| async move { Ok(json!({"canExec": false})) }));
    let mut runner = Web3FunctionRunner::new(options());
    let report = runner
        .run(payload(agent, Web3FunctionVersion::V2, context(BTreeMap::new())).await)
        .await
        .unwrap();

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["version"], json!("2.0"));
    assert!(value["rpcCalls"]["total"].is_u64());
    assert!(value["network"]["nbRequests"].is_u64());
    assert!(value["throttled"]["rpcRequest"].is_boolean());
}
