//! Wire envelopes exchanged over the protocol socket.

use serde::{Deserialize, Serialize};
use w3f_types::{ContextData, StorageDelta};

/// Supervisor → guest. Exactly one `start` per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum InputEvent {
    Start(StartData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartData {
    pub context: ContextData,
}

/// Guest → supervisor. Exactly one terminal event per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum OutputEvent {
    Result(ResultData),
    Error(ErrorData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultData {
    pub result: serde_json::Value,
    pub storage: StorageDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: ErrorObject,
    pub storage: StorageDelta,
}

/// A guest-side failure, name plus human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub name: String,
    pub message: String,
}
