//! The single-shot guest event loop.
//!
//! Boot the protocol server, accept one `start`, run the handler, reply
//! with one terminal event and exit once the reply has drained. A 429 from
//! the RPC proxy short-circuits everything: the agent exits with code 250
//! without emitting an output event.

use crate::context::{EgressError, Web3FunctionContext};
use crate::handler::Web3Function;
use crate::sink::LogSink;
use crate::storage::Web3FunctionStorage;
use crate::EXIT_CODE_RPC_THROTTLED;
use anyhow::anyhow;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::AbortHandle;
use w3f_protocol::{ErrorData, ErrorObject, InputEvent, OutputEvent, ResultData, StartData};
use w3f_types::{ContextData, GuestError, StorageDelta, StorageError, Web3FunctionVersion};

/// How the agent binds and reaches the outside world. Built from the
/// environment in containers, supplied directly by the thread sandbox.
#[derive(Clone)]
pub struct GuestConfig {
    pub bind_host: String,
    pub server_port: u16,
    pub mount_path: String,
    /// Egress proxy URL for the handler's HTTP client.
    pub proxy_url: Option<String>,
    /// Schema version the embedding runtime was launched for; checked
    /// against the start context.
    pub version: Web3FunctionVersion,
    /// Hosts refused guest-side before they reach the egress proxy.
    pub blacklisted_hosts: Vec<String>,
    pub log_sink: LogSink,
    pub debug: bool,
}

impl GuestConfig {
    /// Reads `WEB3_FUNCTION_SERVER_PORT` (default 80),
    /// `WEB3_FUNCTION_MOUNT_PATH`, `WEB3_FUNCTION_VERSION` and
    /// `WEB3_FUNCTION_BLACKLISTED_HOSTS`; outbound HTTP picks up
    /// `HTTP_PROXY`.
    pub fn from_env() -> anyhow::Result<Self> {
        let server_port = std::env::var("WEB3_FUNCTION_SERVER_PORT")
            .ok()
            .map(|raw| raw.parse::<u16>())
            .transpose()?
            .unwrap_or(80);
        let mount_path = std::env::var("WEB3_FUNCTION_MOUNT_PATH").unwrap_or_default();
        let proxy_url = std::env::var("HTTP_PROXY").ok();
        let version = std::env::var("WEB3_FUNCTION_VERSION")
            .ok()
            .map(|raw| raw.parse::<Web3FunctionVersion>())
            .transpose()
            .map_err(|e| anyhow!(e))?
            .unwrap_or(Web3FunctionVersion::V2);
        let blacklisted_hosts = std::env::var("WEB3_FUNCTION_BLACKLISTED_HOSTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|host| !host.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let debug = std::env::var("WEB3_FUNCTION_DEBUG")
            .map(|raw| raw == "true" || raw == "1")
            .unwrap_or(false);
        Ok(Self {
            bind_host: "0.0.0.0".to_string(),
            server_port,
            mount_path,
            proxy_url,
            version,
            blacklisted_hosts,
            log_sink: LogSink::stdout(),
            debug,
        })
    }
}

/// Handler registry plus the serve loop. Exactly one of the two slots must
/// be registered for the kind of invocation that arrives.
#[derive(Clone, Default)]
pub struct Web3FunctionAgent {
    on_run: Option<Arc<dyn Web3Function>>,
    on_event: Option<Arc<dyn Web3Function>>,
}

struct ServeState {
    on_run: Option<Arc<dyn Web3Function>>,
    on_event: Option<Arc<dyn Web3Function>>,
    proxy_url: Option<String>,
    version: Web3FunctionVersion,
    blacklisted_hosts: Vec<String>,
    log_sink: LogSink,
    debug: bool,
    exit_tx: mpsc::Sender<i32>,
    throttle: Arc<Notify>,
    started: AtomicBool,
    /// Abort handle of the in-flight user handler, so a throttled exit can
    /// kill user code instead of orphaning it.
    handler_abort: Mutex<Option<AbortHandle>>,
}

impl Web3FunctionAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for plain (non event-triggered) invocations.
    pub fn on_run(mut self, handler: Arc<dyn Web3Function>) -> Self {
        self.on_run = Some(handler);
        self
    }

    /// Registers the handler for event-triggered invocations.
    pub fn on_event(mut self, handler: Arc<dyn Web3Function>) -> Self {
        self.on_event = Some(handler);
        self
    }

    /// Container entrypoint: configuration from the environment.
    pub async fn serve_from_env(self) -> anyhow::Result<i32> {
        let config = GuestConfig::from_env()?;
        self.serve(config).await
    }

    /// Runs the single-shot event loop and resolves with the exit code the
    /// guest process should report.
    pub async fn serve(self, config: GuestConfig) -> anyhow::Result<i32> {
        let (exit_tx, mut exit_rx) = mpsc::channel::<i32>(1);
        let throttle = Arc::new(Notify::new());
        let state = Arc::new(ServeState {
            on_run: self.on_run,
            on_event: self.on_event,
            proxy_url: config.proxy_url.clone(),
            version: config.version,
            blacklisted_hosts: config.blacklisted_hosts.clone(),
            log_sink: config.log_sink.clone(),
            debug: config.debug,
            exit_tx,
            throttle: throttle.clone(),
            started: AtomicBool::new(false),
            handler_abort: Mutex::new(None),
        });
        let exit_state = state.clone();

        let prefix = if config.mount_path.is_empty() {
            String::new()
        } else {
            format!("/{}", config.mount_path)
        };
        let app = Router::new()
            .route(&format!("{prefix}/ping"), get(|| async { "ok" }))
            .route(&format!("{prefix}/input_event"), post(input_event))
            .with_state(state);

        let addr = format!("{}:{}", config.bind_host, config.server_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        if config.debug {
            tracing::debug!(
                target: "guest",
                addr = %addr,
                mount_path = %config.mount_path,
                "guest agent listening"
            );
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.changed().await.ok();
                })
                .await
        });

        enum Outcome {
            Done(i32),
            Throttled,
            ServerEnded,
        }

        let outcome = tokio::select! {
            maybe = exit_rx.recv() => Outcome::Done(maybe.unwrap_or(1)),
            _ = throttle.notified() => Outcome::Throttled,
            joined = &mut server => {
                if let Ok(Err(e)) = joined {
                    tracing::error!(target: "guest", error = %e, "protocol server failed");
                }
                Outcome::ServerEnded
            }
        };

        match outcome {
            Outcome::Throttled => {
                // Hard exit: no output event, the supervisor reads code 250.
                // User code must not outlive the run.
                if let Some(handler) = exit_state.handler_abort.lock().unwrap().take() {
                    handler.abort();
                }
                server.abort();
                Ok(EXIT_CODE_RPC_THROTTLED)
            }
            Outcome::Done(code) => {
                // Drain the in-flight reply before going away.
                let _ = shutdown_tx.send(true);
                let _ = tokio::time::timeout(Duration::from_secs(3), &mut server).await;
                Ok(code)
            }
            Outcome::ServerEnded => Ok(1),
        }
    }
}

async fn input_event(
    State(state): State<Arc<ServeState>>,
    Json(event): Json<InputEvent>,
) -> Response {
    let InputEvent::Start(StartData { context }) = event;
    if state.started.swap(true, Ordering::SeqCst) {
        let err = GuestError::AlreadyStarted;
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": {"name": "Web3FunctionError", "message": err.to_string()}})),
        )
            .into_response();
    }
    if state.debug {
        tracing::debug!(
            target: "guest",
            task_id = %context.gelato_args.task_id,
            version = %state.version,
            "start event received"
        );
    }
    // V1 contexts are supposed to arrive with the supervisor's injected
    // blockTime; a miss points at a version mismatch between the two sides.
    if state.version == Web3FunctionVersion::V1 && context.gelato_args.block_time.is_none() {
        tracing::warn!(
            target: "guest",
            "runtime declared version 1.0 but the start context carries no blockTime"
        );
    }

    let output = run_function(&state, context).await;
    // Reply first, then exit on the next tick; the serve loop drains this
    // connection before the process goes away.
    let _ = state.exit_tx.try_send(0);
    Json(output).into_response()
}

async fn run_function(state: &ServeState, context: ContextData) -> OutputEvent {
    let pre = context.storage.clone();
    let is_event = context.log.is_some();
    let handler = if is_event {
        state.on_event.clone()
    } else {
        state.on_run.clone()
    };
    let Some(handler) = handler else {
        let err = if is_event {
            GuestError::EventHandlerNotRegistered
        } else {
            GuestError::HandlerNotRegistered
        };
        return error_event("Web3FunctionError", &err.to_string(), pre);
    };

    let storage = Arc::new(Web3FunctionStorage::new(pre.clone()));
    let ctx = match Web3FunctionContext::build(
        context,
        storage.clone(),
        state.proxy_url.as_deref(),
        &state.blacklisted_hosts,
        state.log_sink.clone(),
        state.throttle.clone(),
    ) {
        Ok(ctx) => ctx,
        Err(e) => return error_event("Web3FunctionError", &e.to_string(), pre),
    };

    // Run user code in its own task so a panic surfaces as an error event
    // instead of tearing down the protocol connection; the serve loop keeps
    // the abort handle so a throttled exit can cancel it.
    let task = tokio::spawn(async move { handler.run(ctx).await });
    *state.handler_abort.lock().unwrap() = Some(task.abort_handle());
    match task.await {
        Ok(Ok(result)) => OutputEvent::Result(ResultData {
            result,
            storage: storage.delta(),
        }),
        Ok(Err(err)) => {
            let name = error_name(&err);
            error_event(name, &err.to_string(), storage.pre())
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                "Web3Function handler panicked"
            } else {
                "Web3Function handler was cancelled"
            };
            error_event("Web3FunctionFatalError", message, pre)
        }
    }
}

fn error_name(err: &anyhow::Error) -> &'static str {
    if err.downcast_ref::<StorageError>().is_some() {
        "Web3FunctionStorageError"
    } else if err.downcast_ref::<GuestError>().is_some() {
        "Web3FunctionError"
    } else if err.downcast_ref::<crate::provider::ProviderError>().is_some() {
        "Web3FunctionProviderError"
    } else if err.downcast_ref::<EgressError>().is_some() {
        "Web3FunctionEgressError"
    } else {
        "Error"
    }
}

fn error_event(
    name: &str,
    message: &str,
    pre: std::collections::BTreeMap<String, String>,
) -> OutputEvent {
    OutputEvent::Error(ErrorData {
        error: ErrorObject {
            name: name.to_string(),
            message: message.to_string(),
        },
        storage: StorageDelta::unchanged(pre),
    })
}
