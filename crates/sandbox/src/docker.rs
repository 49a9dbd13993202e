//! Docker container sandbox.
//!
//! Hosts the guest image with a hard memory limit and routes its egress
//! through the supervisor's proxies via the container-to-host alias. An
//! OOM kill surfaces as exit code 137.

use crate::{Sandbox, SandboxStartOptions, ScriptSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder, StopContainerOptionsBuilder,
    WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Image hosting the guest agent. Built out-of-band; the supervisor only
/// references it.
pub const GUEST_IMAGE_TAG: &str = "w3f-guest:latest";

/// Path the script bundle is bind-mounted at inside the container.
const CONTAINER_BUNDLE_PATH: &str = "/w3f/bundle";

struct DockerInner {
    container_id: Option<String>,
    log_task: Option<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,
}

pub struct DockerSandbox {
    docker: Docker,
    image: String,
    memory_limit: u64,
    show_logs: bool,
    logs: Arc<Mutex<Vec<String>>>,
    exit_tx: watch::Sender<Option<i64>>,
    exit_rx: watch::Receiver<Option<i64>>,
    inner: TokioMutex<DockerInner>,
}

impl DockerSandbox {
    pub fn new(memory_limit: u64, show_logs: bool) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let (exit_tx, exit_rx) = watch::channel(None);
        Ok(Self {
            docker,
            image: GUEST_IMAGE_TAG.to_string(),
            memory_limit,
            show_logs,
            logs: Arc::new(Mutex::new(Vec::new())),
            exit_tx,
            exit_rx,
            inner: TokioMutex::new(DockerInner {
                container_id: None,
                log_task: None,
                wait_task: None,
            }),
        })
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }
}

/// Environment for the containerized guest; pure so it can be tested
/// without a Docker daemon.
fn guest_env(opts: &SandboxStartOptions) -> Vec<String> {
    let proxy_url = format!("http://{}:{}", opts.proxy_host, opts.proxy_port);
    let mut env = vec![
        format!("WEB3_FUNCTION_SERVER_PORT={}", opts.server_port),
        format!("WEB3_FUNCTION_MOUNT_PATH={}", opts.mount_path),
        format!("WEB3_FUNCTION_VERSION={}", opts.version),
        format!("WEB3_FUNCTION_BUNDLE={CONTAINER_BUNDLE_PATH}"),
        format!("HTTP_PROXY={proxy_url}"),
        format!("HTTPS_PROXY={proxy_url}"),
    ];
    if !opts.blacklisted_hosts.is_empty() {
        env.push(format!(
            "WEB3_FUNCTION_BLACKLISTED_HOSTS={}",
            opts.blacklisted_hosts.join(",")
        ));
    }
    env
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn start(&self, opts: SandboxStartOptions) -> Result<()> {
        let ScriptSource::Bundle(bundle) = &opts.script else {
            return Err(anyhow!(
                "the container runtime requires a bundled script artifact"
            ));
        };

        let name = format!("w3f-guest-{}", Uuid::new_v4().simple());
        let port_key = format!("{}/tcp", opts.server_port);
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::from([(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(opts.server_port.to_string()),
            }]),
        )]);
        let exposed_ports: HashMap<String, HashMap<(), ()>> =
            HashMap::from([(port_key, HashMap::new())]);

        let host_config = HostConfig {
            memory: Some(self.memory_limit as i64),
            // Swap pinned to the memory limit so the cap is hard.
            memory_swap: Some(self.memory_limit as i64),
            binds: Some(vec![format!("{}:{CONTAINER_BUNDLE_PATH}:ro", bundle.display())]),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };
        let config = ContainerCreateBody {
            image: Some(self.image.clone()),
            env: Some(guest_env(&opts)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptionsBuilder::default().name(&name).build());
        let id = self.docker.create_container(options, config).await?.id;
        self.docker
            .start_container(&id, None::<StartContainerOptions>)
            .await?;
        tracing::debug!(target: "sandbox", container = %name, "guest container started");

        // Stream container output into the logs buffer.
        let log_docker = self.docker.clone();
        let log_id = id.clone();
        let logs = self.logs.clone();
        let show_logs = self.show_logs;
        let log_task = tokio::spawn(async move {
            let log_options = Some(
                LogsOptionsBuilder::default()
                    .follow(true)
                    .stdout(true)
                    .stderr(true)
                    .build(),
            );
            let mut log_stream = log_docker.logs(&log_id, log_options);
            while let Some(item) = log_stream.next().await {
                let Ok(output) = item else { break };
                let line = output.to_string();
                let line = line.trim_end_matches('\n').to_string();
                if show_logs {
                    tracing::info!(target: "sandbox", "{}", line);
                }
                logs.lock().unwrap().push(line);
            }
        });

        // Exit-code waiter. bollard reports a non-zero exit status as a
        // wait error carrying the code.
        let docker = self.docker.clone();
        let wait_id = id.clone();
        let exit_tx = self.exit_tx.clone();
        let wait_task = tokio::spawn(async move {
            let mut wait_stream = docker.wait_container(&wait_id, None::<WaitContainerOptions>);
            let code = match wait_stream.next().await {
                Some(Ok(resp)) => resp.status_code,
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => {
                    tracing::debug!(target: "sandbox", error = %e, "container wait failed");
                    -1
                }
                None => -1,
            };
            let _ = exit_tx.send(Some(code));
        });

        let mut inner = self.inner.lock().await;
        inner.container_id = Some(id);
        inner.log_task = Some(log_task);
        inner.wait_task = Some(wait_task);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = inner.container_id.take() {
            self.docker
                .stop_container(
                    &id,
                    Some(StopContainerOptionsBuilder::default().t(2).build()),
                )
                .await
                .ok();
            self.docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptionsBuilder::default().force(true).build()),
                )
                .await
                .ok();
        }
        if let Some(task) = inner.log_task.take() {
            task.abort();
        }
        if let Some(task) = inner.wait_task.take() {
            task.abort();
        }
        self.exit_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(-1);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn wait_for_process_end(&self) -> Result<i64> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            rx.changed().await?;
        }
    }

    async fn memory_usage(&self) -> Result<u64> {
        let id = {
            let inner = self.inner.lock().await;
            inner.container_id.clone()
        };
        let Some(id) = id else { return Ok(0) };
        let options = Some(StatsOptionsBuilder::default().stream(false).build());
        let mut stats_stream = self.docker.stats(&id, options);
        match stats_stream.next().await {
            Some(Ok(stats)) => Ok(stats
                .memory_stats
                .and_then(|memory| memory.usage)
                .unwrap_or(0)),
            _ => Ok(0),
        }
    }

    async fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use w3f_types::Web3FunctionVersion;

    fn start_options() -> SandboxStartOptions {
        SandboxStartOptions {
            script: ScriptSource::Bundle("/tmp/fn".into()),
            version: Web3FunctionVersion::V2,
            server_port: 8001,
            mount_path: "abc123".to_string(),
            proxy_host: "host.docker.internal".to_string(),
            proxy_port: 9002,
            blacklisted_hosts: vec!["evil.example".to_string()],
        }
    }

    #[test]
    fn guest_env_carries_protocol_proxy_and_policy() {
        let env = guest_env(&start_options());
        assert!(env.contains(&"WEB3_FUNCTION_SERVER_PORT=8001".to_string()));
        assert!(env.contains(&"WEB3_FUNCTION_MOUNT_PATH=abc123".to_string()));
        assert!(env.contains(&"WEB3_FUNCTION_VERSION=2.0".to_string()));
        assert!(env.contains(&"HTTP_PROXY=http://host.docker.internal:9002".to_string()));
        assert!(env
            .contains(&"WEB3_FUNCTION_BLACKLISTED_HOSTS=evil.example".to_string()));
    }

    #[test]
    fn guest_env_omits_empty_blacklist() {
        let mut opts = start_options();
        opts.blacklisted_hosts.clear();
        let env = guest_env(&opts);
        assert!(!env.iter().any(|e| e.starts_with("WEB3_FUNCTION_BLACKLISTED_HOSTS")));
    }
}
