//! In-process worker sandbox.
//!
//! Runs the guest agent as a task inside the supervisor's own process.
//! Memory is sampled from the process RSS, so the cap is enforced by the
//! supervisor comparing samples against its limit rather than by the
//! kernel; a spike shorter than the sampling interval surfaces as a
//! generic crash, not a memory throttle.

use crate::{Sandbox, SandboxStartOptions, ScriptSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use w3f_guest::{GuestConfig, LogSink};

pub struct ThreadSandbox {
    show_logs: bool,
    logs: Arc<Mutex<Vec<String>>>,
    exit_tx: watch::Sender<Option<i64>>,
    exit_rx: watch::Receiver<Option<i64>>,
    task: TokioMutex<Option<JoinHandle<()>>>,
}

impl ThreadSandbox {
    pub fn new(show_logs: bool) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            show_logs,
            logs: Arc::new(Mutex::new(Vec::new())),
            exit_tx,
            exit_rx,
            task: TokioMutex::new(None),
        }
    }
}

#[async_trait]
impl Sandbox for ThreadSandbox {
    async fn start(&self, opts: SandboxStartOptions) -> Result<()> {
        let ScriptSource::Handler(agent) = opts.script else {
            return Err(anyhow!(
                "the thread runtime requires an in-process handler, not a bundle"
            ));
        };
        // The guest writes its log lines straight into the sandbox buffer.
        let sink = LogSink::into_buffer(self.logs.clone(), self.show_logs);
        let config = GuestConfig {
            bind_host: "127.0.0.1".to_string(),
            server_port: opts.server_port,
            mount_path: opts.mount_path,
            proxy_url: Some(format!("http://{}:{}", opts.proxy_host, opts.proxy_port)),
            version: opts.version,
            blacklisted_hosts: opts.blacklisted_hosts,
            log_sink: sink,
            debug: false,
        };

        let exit_tx = self.exit_tx.clone();
        let handle = tokio::spawn(async move {
            let code = match agent.serve(config).await {
                Ok(code) => code as i64,
                Err(e) => {
                    tracing::error!(target: "sandbox", error = %e, "guest agent failed");
                    1
                }
            };
            let _ = exit_tx.send(Some(code));
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
        // Resolve pending waiters if the guest never got to exit.
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
        process_rss_bytes()
    }

    async fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

/// Resident set size of the current process, from `/proc/self/statm`.
/// Returns 0 on platforms without procfs.
fn process_rss_bytes() -> Result<u64> {
    #[cfg(target_os = "linux")]
    {
        const PAGE_SIZE: u64 = 4096;
        let raw = std::fs::read_to_string("/proc/self/statm")?;
        let resident_pages = raw
            .split_whitespace()
            .nth(1)
            .and_then(|field| field.parse::<u64>().ok())
            .ok_or_else(|| anyhow!("malformed /proc/self/statm: {raw}"))?;
        Ok(resident_pages * PAGE_SIZE)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn rss_sampling_reports_a_nonzero_resident_set() {
        assert!(process_rss_bytes().unwrap() > 0);
    }

    #[tokio::test]
    async fn starting_with_a_bundle_is_rejected() {
        let sandbox = ThreadSandbox::new(false);
        let err = sandbox
            .start(SandboxStartOptions {
                script: ScriptSource::Bundle("/tmp/bundle".into()),
                version: w3f_types::Web3FunctionVersion::V2,
                server_port: 0,
                mount_path: "m".to_string(),
                proxy_host: "127.0.0.1".to_string(),
                proxy_port: 1,
                blacklisted_hosts: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("thread runtime"));
    }

    #[tokio::test]
    async fn stop_resolves_pending_exit_waiters() {
        let sandbox = ThreadSandbox::new(false);
        sandbox.stop().await.unwrap();
        assert_eq!(sandbox.wait_for_process_end().await.unwrap(), -1);
    }
}
