//! Error taxonomy shared by the supervisor and the guest agent.

use thiserror::Error;

/// Maps an error variant onto a stable identifier so callers can branch on
/// failures without parsing display strings. Codes never change once
/// shipped, even when the human-readable message does.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// A quota a run can hit. Fatal throttles terminate the run; accounting
/// throttles only mark the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleReason {
    Duration,
    Memory,
    RpcRequest,
    NetworkRequest,
    Download,
    Upload,
    Storage,
}

/// User-argument schema violations.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// The supplied argument map is missing a declared key.
    #[error("Missing user argument '{key}' (expected {expected})")]
    MissingKey {
        key: String,
        expected: &'static str,
    },
    /// The supplied value does not match the declared type.
    #[error("Invalid {expected} value '{value}' for user argument '{key}' (example: {example})")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        value: String,
        example: &'static str,
    },
}

impl ErrorCode for SchemaError {
    fn code(&self) -> &'static str {
        match self {
            Self::MissingKey { .. } => "USER_ARGS_MISSING_KEY",
            Self::TypeMismatch { .. } => "USER_ARGS_TYPE_MISMATCH",
        }
    }
}

/// Storage facade misuse inside the guest.
#[derive(Error, Debug)]
pub enum StorageError {
    /// `set` was handed a non-string JSON value.
    #[error("Storage value for key '{key}' must be a string, got {got}")]
    NotAString { key: String, got: String },
}

impl ErrorCode for StorageError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotAString { .. } => "STORAGE_VALUE_NOT_A_STRING",
        }
    }
}

/// Guest agent boot/registration failures.
#[derive(Error, Debug)]
pub enum GuestError {
    #[error("Web3Function handler is not registered")]
    HandlerNotRegistered,
    #[error("Web3Function event handler is not registered")]
    EventHandlerNotRegistered,
    #[error("Web3Function already received a start event")]
    AlreadyStarted,
}

impl ErrorCode for GuestError {
    fn code(&self) -> &'static str {
        match self {
            Self::HandlerNotRegistered => "GUEST_HANDLER_NOT_REGISTERED",
            Self::EventHandlerNotRegistered => "GUEST_EVENT_HANDLER_NOT_REGISTERED",
            Self::AlreadyStarted => "GUEST_ALREADY_STARTED",
        }
    }
}

/// Result shape violations detected after a successful run.
#[derive(Error, Debug)]
pub enum ResultValidationError {
    #[error("Web3Function must return {{ canExec: bool, callData: string }}, got: {got}")]
    InvalidV1 { got: String },
    #[error("Web3Function must return {{ canExec: bool, callData: {{to: string, data: string, value?: string}}[] }}, got: {got}")]
    InvalidV2 { got: String },
}

impl ErrorCode for ResultValidationError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidV1 { .. } => "RESULT_INVALID_V1",
            Self::InvalidV2 { .. } => "RESULT_INVALID_V2",
        }
    }
}

/// Failures raised by the supervisor while driving a run. The throttle
/// bearing variants map onto report flags via [`RunnerError::throttle_reason`].
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Web3Function exceeded execution timeout ({0}ms)")]
    ExecutionTimeout(u64),
    #[error("Web3Function exceeded memory limit ({0}mb)")]
    MemoryExceeded(u64),
    #[error("Web3Function exceeded RPC call limit ({0} calls)")]
    RpcRequestLimit(u32),
    /// The guest exited with code 0 before emitting any output event.
    #[error("Web3Function exited before returning a result")]
    SilentExit,
    #[error("Web3Function runtime exited with code {0}")]
    Crashed(i64),
    #[error("Web3Function runtime failed to start: {0}")]
    StartFailure(String),
    /// The guest reported an error event.
    #[error("{name}: {message}")]
    Guest { name: String, message: String },
    #[error("Web3Function protocol failure: {0}")]
    Protocol(String),
}

impl RunnerError {
    pub fn throttle_reason(&self) -> Option<ThrottleReason> {
        match self {
            Self::ExecutionTimeout(_) => Some(ThrottleReason::Duration),
            Self::MemoryExceeded(_) => Some(ThrottleReason::Memory),
            Self::RpcRequestLimit(_) => Some(ThrottleReason::RpcRequest),
            _ => None,
        }
    }
}

impl ErrorCode for RunnerError {
    fn code(&self) -> &'static str {
        match self {
            Self::ExecutionTimeout(_) => "RUNNER_EXECUTION_TIMEOUT",
            Self::MemoryExceeded(_) => "RUNNER_MEMORY_EXCEEDED",
            Self::RpcRequestLimit(_) => "RUNNER_RPC_LIMIT_EXCEEDED",
            Self::SilentExit => "RUNNER_GUEST_SILENT_EXIT",
            Self::Crashed(_) => "RUNNER_GUEST_CRASHED",
            Self::StartFailure(_) => "RUNNER_GUEST_START_FAILURE",
            Self::Guest { .. } => "RUNNER_GUEST_ERROR",
            Self::Protocol(_) => "RUNNER_PROTOCOL_FAILURE",
        }
    }
}
