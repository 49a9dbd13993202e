#![forbid(unsafe_code)]

//! # w3f Guest
//!
//! The agent that runs inside the sandbox. It boots the protocol server,
//! waits for the single `start` message, invokes the registered handler
//! with a context facade (storage, secrets, proxied HTTP client, multi-chain
//! RPC provider), computes the storage delta and replies with exactly one
//! terminal event before exiting.
//!
//! Container images embed this crate and call
//! [`Web3FunctionAgent::serve_from_env`] from their entrypoint; the thread
//! sandbox drives [`Web3FunctionAgent::serve`] in-process.

pub mod agent;
pub mod context;
pub mod handler;
pub mod provider;
pub mod sink;
pub mod storage;

pub use agent::{GuestConfig, Web3FunctionAgent};
pub use context::{EgressError, GuestHttp, Secrets, Web3FunctionContext};
pub use handler::{handler_fn, Web3Function};
pub use provider::{ChainProvider, MultiChainProvider, ProviderError};
pub use sink::LogSink;
pub use storage::Web3FunctionStorage;

/// Exit code the guest uses when the RPC proxy reports the call budget
/// spent (HTTP 429); the supervisor classifies it as an RPC throttle.
pub const EXIT_CODE_RPC_THROTTLED: i32 = 250;
