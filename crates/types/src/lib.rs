#![forbid(unsafe_code)]

//! # w3f Types
//!
//! Shared data model for the web3-function runner: the execution context
//! handed to the guest, user-argument schemas, result shapes, storage
//! deltas, the execution report and the runner configuration, plus the
//! error taxonomy used across the supervisor and the guest agent.

pub mod context;
pub mod error;
pub mod options;
pub mod report;
pub mod result;
pub mod storage;
pub mod user_args;

pub use context::{ChainId, ContextData, GelatoArgs};
pub use error::{
    ErrorCode, GuestError, ResultValidationError, RunnerError, SchemaError, StorageError,
    ThrottleReason,
};
pub use options::{MultiChainProviderConfig, RunnerOptions, SandboxRuntime};
pub use report::{ExecutionReport, NetworkStats, ReportStorage, RpcStats, ThrottleFlags};
pub use result::{CallData, Web3FunctionResultV1, Web3FunctionResultV2, Web3FunctionVersion};
pub use storage::{StorageDelta, StorageState};
pub use user_args::{UserArgType, UserArgValue, UserArgs, UserArgsSchema};

// Re-exported so downstream crates agree on the gas price integer type.
pub use primitive_types::U256;
