#![forbid(unsafe_code)]

//! # w3f Sandbox
//!
//! The isolated environment a guest runs in, behind one capability set:
//! start, stop, exit waiting, memory sampling and log capture. Two
//! variants implement it: an in-process worker for embedded handlers and a
//! Docker container for bundled artifacts.

pub mod docker;
pub mod thread;

pub use docker::DockerSandbox;
pub use thread::ThreadSandbox;

use async_trait::async_trait;
use std::path::PathBuf;
use w3f_guest::Web3FunctionAgent;
use w3f_types::Web3FunctionVersion;

/// The script artifact. Opaque to the supervisor: the thread runtime hosts
/// an in-process handler set, the container runtime bind-mounts a bundle
/// into the guest image.
#[derive(Clone)]
pub enum ScriptSource {
    Handler(Web3FunctionAgent),
    Bundle(PathBuf),
}

impl std::fmt::Debug for ScriptSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("ScriptSource::Handler"),
            Self::Bundle(path) => write!(f, "ScriptSource::Bundle({})", path.display()),
        }
    }
}

/// Per-run launch parameters handed to [`Sandbox::start`].
#[derive(Debug, Clone)]
pub struct SandboxStartOptions {
    pub script: ScriptSource,
    pub version: Web3FunctionVersion,
    /// Port the guest protocol server must listen on.
    pub server_port: u16,
    /// Random per-run path token segregating protocol endpoints.
    pub mount_path: String,
    /// Host the guest reaches the egress proxy at (loopback, or the
    /// container-to-host alias for the container runtime).
    pub proxy_host: String,
    pub proxy_port: u16,
    pub blacklisted_hosts: Vec<String>,
}

/// One guest lifecycle. All methods take `&self`; implementations hold
/// their mutable state behind locks so the supervisor can race
/// `wait_for_process_end` against other signals while sampling memory.
#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn start(&self, opts: SandboxStartOptions) -> anyhow::Result<()>;

    /// Idempotent; kills the guest if it is still running.
    async fn stop(&self) -> anyhow::Result<()>;

    /// Resolves with the guest's exit code. May be awaited concurrently
    /// from several tasks.
    async fn wait_for_process_end(&self) -> anyhow::Result<i64>;

    /// Current guest memory usage in bytes.
    async fn memory_usage(&self) -> anyhow::Result<u64>;

    /// Captured guest output so far.
    async fn logs(&self) -> Vec<String>;
}
