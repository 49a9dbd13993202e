//! The supervisor: one `run` per runner, one `stop` guaranteed.

use crate::result::validate_result;
use crate::user_args;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;
use w3f_protocol::{OutputEvent, ProtocolClient, ProtocolError};
use w3f_proxy::rpc::RpcProxyStats;
use w3f_proxy::{
    pick_free_port, reserve_listener, HttpProxy, HttpProxyPolicy, HttpProxySnapshot, RpcProxy,
};
use w3f_sandbox::{DockerSandbox, Sandbox, SandboxStartOptions, ScriptSource, ThreadSandbox};
use w3f_types::{
    ContextData, ExecutionReport, MultiChainProviderConfig, NetworkStats, ReportStorage,
    RunnerError, RunnerOptions, SandboxRuntime, SchemaError, StorageDelta, StorageState,
    ThrottleFlags, ThrottleReason, UserArgs, UserArgsSchema, Web3FunctionVersion,
};

/// Budget for the guest to bring its protocol server up.
const STARTUP_BUDGET: Duration = Duration::from_secs(5);
/// Grace applied when the guest exits, absorbing the race between a valid
/// reply and the process-end signal.
const EXIT_GRACE: Duration = Duration::from_millis(100);
/// Memory sampling period.
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Everything `run` needs besides the options.
pub struct RunnerPayload {
    pub script: ScriptSource,
    pub version: Web3FunctionVersion,
    pub context: ContextData,
    pub provider_config: MultiChainProviderConfig,
}

/// Resources owned by one run, released exactly once. The teardown guard
/// makes `stop` idempotent and safe to trigger from the interrupt hook.
struct RunResources {
    stopped: AtomicBool,
    sandbox: Arc<dyn Sandbox>,
    http_proxy: TokioMutex<Option<HttpProxy>>,
    rpc_proxy: TokioMutex<Option<RpcProxy>>,
    sampler: TokioMutex<Option<JoinHandle<()>>>,
    exit_hook: TokioMutex<Option<JoinHandle<()>>>,
}

impl RunResources {
    /// Stops the sandbox, both proxies, the sampler and the interrupt
    /// hook. Errors are logged, never propagated: resource release must
    /// not fail the run.
    async fn teardown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.sampler.lock().await.take() {
            task.abort();
        }
        if let Err(e) = self.sandbox.stop().await {
            tracing::warn!(target: "runner", error = %e, "failed to stop sandbox");
        }
        if let Some(mut proxy) = self.http_proxy.lock().await.take() {
            proxy.stop().await;
        }
        if let Some(mut proxy) = self.rpc_proxy.lock().await.take() {
            proxy.stop().await;
        }
        if let Some(task) = self.exit_hook.lock().await.take() {
            task.abort();
        }
        tracing::debug!(target: "runner", "run resources released");
    }
}

struct DriveOutcome {
    exec: std::result::Result<(serde_json::Value, StorageDelta), RunnerError>,
    rpc_stats: Option<Arc<RpcProxyStats>>,
}

/// Supervises one sandboxed execution end to end.
pub struct Web3FunctionRunner {
    options: RunnerOptions,
    resources: Option<Arc<RunResources>>,
}

impl Web3FunctionRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self {
            options,
            resources: None,
        }
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Typechecks user arguments against a declared schema.
    pub fn validate_user_args(schema: &UserArgsSchema, args: &UserArgs) -> Result<(), SchemaError> {
        user_args::validate_user_args(schema, args)
    }

    /// Decodes and typechecks a raw string map of user arguments.
    pub fn parse_user_args(
        schema: &UserArgsSchema,
        inputs: &BTreeMap<String, String>,
    ) -> Result<UserArgs, SchemaError> {
        user_args::parse_user_args(schema, inputs)
    }

    /// Executes the payload and returns the report. Classified failures
    /// (guest errors, quota hits, crashes) come back as a report with
    /// `success: false`; only pre-flight provisioning problems surface as
    /// `Err`.
    pub async fn run(&mut self, payload: RunnerPayload) -> Result<ExecutionReport> {
        let started = Instant::now();
        self.options.validate().map_err(|e| anyhow!(e))?;
        let RunnerPayload {
            script,
            version,
            context,
            provider_config,
        } = payload;

        // Port acquisition: protocol socket, egress proxy, RPC proxy. The
        // proxy listeners are held from reservation to bind so they cannot
        // be lost to a collision.
        let server_port = match self.options.server_port {
            Some(port) => port,
            None => pick_free_port()?,
        };
        let (http_port, http_listener) = reserve_listener().await?;
        let (rpc_port, rpc_listener) = reserve_listener().await?;
        let mount_path = Uuid::new_v4().simple().to_string();
        tracing::debug!(
            target: "runner",
            server_port,
            http_port,
            rpc_port,
            "ports acquired"
        );

        let http_proxy = HttpProxy::start(
            http_listener,
            HttpProxyPolicy {
                request_limit: self.options.request_limit as u64,
                download_limit: self.options.download_limit,
                upload_limit: self.options.upload_limit,
                blacklisted_hosts: self.options.blacklisted_hosts.clone(),
            },
        )
        .await?;
        let http_stats = http_proxy.stats();

        let sandbox: Arc<dyn Sandbox> = match self.options.runtime {
            SandboxRuntime::Thread => Arc::new(ThreadSandbox::new(self.options.show_logs)),
            SandboxRuntime::Container => {
                Arc::new(DockerSandbox::new(self.options.memory, self.options.show_logs)?)
            }
        };
        let proxy_host = match self.options.runtime {
            SandboxRuntime::Thread => "127.0.0.1",
            SandboxRuntime::Container => "host.docker.internal",
        };

        let resources = Arc::new(RunResources {
            stopped: AtomicBool::new(false),
            sandbox: sandbox.clone(),
            http_proxy: TokioMutex::new(Some(http_proxy)),
            rpc_proxy: TokioMutex::new(None),
            sampler: TokioMutex::new(None),
            exit_hook: TokioMutex::new(None),
        });
        self.resources = Some(resources.clone());

        // Release everything if the supervisor process is interrupted
        // mid-run; removed again during teardown.
        let hook_resources = resources.clone();
        let hook = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!(target: "runner", "interrupt received, releasing run resources");
                hook_resources.teardown().await;
            }
        });
        *resources.exit_hook.lock().await = Some(hook);

        let max_memory = Arc::new(AtomicU64::new(0));
        let outcome = self
            .drive(
                &resources,
                sandbox.clone(),
                script,
                version,
                context,
                provider_config,
                rpc_listener,
                rpc_port,
                server_port,
                mount_path,
                proxy_host,
                http_port,
                max_memory.clone(),
            )
            .await;

        // Always stop, success or failure; counters are final afterwards.
        resources.teardown().await;

        let logs = sandbox.logs().await;
        let report = self.assemble(
            version,
            outcome,
            http_stats.snapshot(),
            started.elapsed().as_secs_f64(),
            max_memory.load(Ordering::SeqCst),
            logs,
        );
        Ok(report)
    }

    /// Idempotent resource release; also invoked internally at the end of
    /// every `run`.
    pub async fn stop(&mut self) {
        if let Some(resources) = &self.resources {
            resources.teardown().await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        resources: &Arc<RunResources>,
        sandbox: Arc<dyn Sandbox>,
        script: ScriptSource,
        version: Web3FunctionVersion,
        mut context: ContextData,
        provider_config: MultiChainProviderConfig,
        rpc_listener: tokio::net::TcpListener,
        rpc_port: u16,
        server_port: u16,
        mount_path: String,
        proxy_host: &str,
        http_port: u16,
        max_memory: Arc<AtomicU64>,
    ) -> DriveOutcome {
        if let Err(e) = sandbox
            .start(SandboxStartOptions {
                script,
                version,
                server_port,
                mount_path: mount_path.clone(),
                proxy_host: proxy_host.to_string(),
                proxy_port: http_port,
                blacklisted_hosts: self.options.blacklisted_hosts.clone(),
            })
            .await
        {
            return DriveOutcome {
                exec: Err(RunnerError::StartFailure(e.to_string())),
                rpc_stats: None,
            };
        }

        let rpc_proxy = match RpcProxy::start(
            rpc_listener,
            provider_config,
            self.options.rpc_limit as u64,
        )
        .await
        {
            Ok(proxy) => proxy,
            Err(e) => {
                return DriveOutcome {
                    exec: Err(RunnerError::StartFailure(e.to_string())),
                    rpc_stats: None,
                }
            }
        };
        let rpc_stats = rpc_proxy.stats();
        context.rpc_provider_url = Some(format!("http://{proxy_host}:{rpc_port}/"));
        *resources.rpc_proxy.lock().await = Some(rpc_proxy);

        if version == Web3FunctionVersion::V1 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0);
            context.gelato_args.block_time = Some(now);
        }

        // Running maximum of sampled guest memory, read back at exit
        // classification and report time.
        let sampler_sandbox = sandbox.clone();
        let sampler_max = max_memory.clone();
        let sampler = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Ok(bytes) = sampler_sandbox.memory_usage().await {
                    sampler_max.fetch_max(bytes, Ordering::SeqCst);
                }
            }
        });
        *resources.sampler.lock().await = Some(sampler);

        let exec = self
            .exchange(sandbox, server_port, &mount_path, context, &max_memory)
            .await;
        DriveOutcome {
            exec,
            rpc_stats: Some(rpc_stats),
        }
    }

    /// The protocol exchange: connect within the start-up budget, send the
    /// single start message, then race the reply against the timeout and
    /// the sandbox exiting underneath us.
    async fn exchange(
        &self,
        sandbox: Arc<dyn Sandbox>,
        server_port: u16,
        mount_path: &str,
        context: ContextData,
        max_memory: &AtomicU64,
    ) -> std::result::Result<(serde_json::Value, StorageDelta), RunnerError> {
        let client = ProtocolClient::new("127.0.0.1", server_port, mount_path);

        tokio::select! {
            connected = client.connect(STARTUP_BUDGET) => {
                if let Err(e) = connected {
                    return Err(RunnerError::StartFailure(e.to_string()));
                }
            }
            exited = sandbox.wait_for_process_end() => {
                let code = exited.unwrap_or(-1);
                tracing::warn!(target: "runner", code, "guest exited before the protocol handshake");
                return Err(self.classify_exit(code, max_memory.load(Ordering::SeqCst)));
            }
        }

        let send = client.send_start(context);
        tokio::pin!(send);
        tokio::select! {
            output = &mut send => handle_output(output),
            _ = sleep(Duration::from_millis(self.options.timeout)) => {
                Err(RunnerError::ExecutionTimeout(self.options.timeout))
            }
            exited = sandbox.wait_for_process_end() => {
                let code = exited.unwrap_or(-1);
                // The terminal reply may already be in flight; give it the
                // grace window before trusting the exit code.
                match tokio::time::timeout(EXIT_GRACE, &mut send).await {
                    Ok(Ok(output)) => handle_output(Ok(output)),
                    _ => Err(self.classify_exit(code, max_memory.load(Ordering::SeqCst))),
                }
            }
        }
    }

    /// Exit-code interpretation: 250 is the guest's RPC-throttled signal,
    /// 137 an OOM kill in the container runtime; the thread runtime infers
    /// memory overruns from the sampled maximum.
    fn classify_exit(&self, code: i64, max_memory: u64) -> RunnerError {
        let memory_mb = self.options.memory / (1024 * 1024);
        if code == 250 {
            return RunnerError::RpcRequestLimit(self.options.rpc_limit);
        }
        match self.options.runtime {
            SandboxRuntime::Container if code == 137 => {
                return RunnerError::MemoryExceeded(memory_mb)
            }
            SandboxRuntime::Thread if max_memory >= self.options.memory => {
                return RunnerError::MemoryExceeded(memory_mb)
            }
            _ => {}
        }
        if code == 0 {
            RunnerError::SilentExit
        } else {
            RunnerError::Crashed(code)
        }
    }

    fn assemble(
        &self,
        version: Web3FunctionVersion,
        outcome: DriveOutcome,
        net: HttpProxySnapshot,
        duration: f64,
        max_memory_bytes: u64,
        logs: Vec<String>,
    ) -> ExecutionReport {
        let rpc_calls = outcome
            .rpc_stats
            .map(|stats| stats.snapshot())
            .unwrap_or_default();

        let mut throttled = ThrottleFlags::default();
        throttled.network_request =
            net.nb_throttled > 0 && net.nb_requests >= self.options.request_limit as u64;
        throttled.download = net.nb_throttled > 0 && net.download >= self.options.download_limit;
        throttled.upload = net.nb_throttled > 0 && net.upload >= self.options.upload_limit;

        let network = NetworkStats {
            nb_requests: net.nb_requests,
            nb_throttled: net.nb_throttled,
            download: round2(net.download as f64 / 1024.0),
            upload: round2(net.upload as f64 / 1024.0),
        };
        let memory = max_memory_bytes as f64 / (1024.0 * 1024.0);

        match outcome.exec {
            Ok((result, delta)) => {
                let size = round2(delta.size_kb());
                if delta.state == StorageState::Updated && size > self.options.storage_limit as f64
                {
                    throttled.storage = true;
                }
                let storage = Some(ReportStorage::from_delta(delta, size));
                match validate_result(version, &result) {
                    Ok(()) => ExecutionReport {
                        success: true,
                        version,
                        result: Some(result),
                        storage,
                        error: None,
                        logs,
                        duration,
                        memory,
                        rpc_calls,
                        network,
                        throttled,
                    },
                    Err(e) => ExecutionReport {
                        success: false,
                        version,
                        result: None,
                        storage,
                        error: Some(e.to_string()),
                        logs,
                        duration,
                        memory,
                        rpc_calls,
                        network,
                        throttled,
                    },
                }
            }
            Err(err) => {
                match err.throttle_reason() {
                    Some(ThrottleReason::Duration) => throttled.duration = true,
                    Some(ThrottleReason::Memory) => throttled.memory = true,
                    Some(ThrottleReason::RpcRequest) => throttled.rpc_request = true,
                    _ => {}
                }
                tracing::debug!(target: "runner", error = %err, "run failed");
                ExecutionReport {
                    success: false,
                    version,
                    result: None,
                    storage: None,
                    error: Some(err.to_string()),
                    logs,
                    duration,
                    memory,
                    rpc_calls,
                    network,
                    throttled,
                }
            }
        }
    }
}

fn handle_output(
    output: std::result::Result<OutputEvent, ProtocolError>,
) -> std::result::Result<(serde_json::Value, StorageDelta), RunnerError> {
    match output {
        Ok(OutputEvent::Result(data)) => Ok((data.result, data.storage)),
        Ok(OutputEvent::Error(data)) => Err(RunnerError::Guest {
            name: data.error.name,
            message: data.error.message,
        }),
        Err(e) => Err(RunnerError::Protocol(e.to_string())),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner_with(runtime: SandboxRuntime) -> Web3FunctionRunner {
        Web3FunctionRunner::new(RunnerOptions {
            runtime,
            ..Default::default()
        })
    }

    #[test]
    fn exit_code_250_is_an_rpc_throttle() {
        let runner = runner_with(SandboxRuntime::Thread);
        let err = runner.classify_exit(250, 0);
        assert_eq!(err.throttle_reason(), Some(ThrottleReason::RpcRequest));
    }

    #[test]
    fn container_oom_kill_is_a_memory_throttle() {
        let runner = runner_with(SandboxRuntime::Container);
        let err = runner.classify_exit(137, 0);
        assert_eq!(err.throttle_reason(), Some(ThrottleReason::Memory));
    }

    #[test]
    fn thread_exit_over_the_sampled_cap_is_a_memory_throttle() {
        let runner = runner_with(SandboxRuntime::Thread);
        let cap = runner.options.memory;
        let err = runner.classify_exit(9, cap + 1);
        assert_eq!(err.throttle_reason(), Some(ThrottleReason::Memory));
    }

    #[test]
    fn silent_zero_exit_is_fatal_but_not_throttled() {
        let runner = runner_with(SandboxRuntime::Thread);
        let err = runner.classify_exit(0, 0);
        assert!(matches!(err, RunnerError::SilentExit));
        assert!(err.throttle_reason().is_none());
    }

    #[test]
    fn other_exit_codes_are_generic_crashes() {
        let runner = runner_with(SandboxRuntime::Container);
        let err = runner.classify_exit(9, 0);
        assert!(matches!(err, RunnerError::Crashed(9)));
    }

    #[test]
    fn rounding_keeps_two_decimals() {
        assert_eq!(round2(0.0087890625), 0.01);
        assert_eq!(round2(1.0), 1.0);
    }
}
