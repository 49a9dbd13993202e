//! Result shape enforcement per schema version.

use w3f_types::{ResultValidationError, Web3FunctionVersion};

/// Validates a guest-returned result against its declared version. A
/// `canExec: false` result is accepted regardless of `callData`.
pub fn validate_result(
    version: Web3FunctionVersion,
    result: &serde_json::Value,
) -> Result<(), ResultValidationError> {
    match version {
        Web3FunctionVersion::V1 => validate_v1(result),
        Web3FunctionVersion::V2 => validate_v2(result),
    }
}

fn validate_v1(result: &serde_json::Value) -> Result<(), ResultValidationError> {
    let invalid = || ResultValidationError::InvalidV1 {
        got: result.to_string(),
    };
    let object = result.as_object().ok_or_else(invalid)?;
    let can_exec = object
        .get("canExec")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(invalid)?;
    if !can_exec {
        return Ok(());
    }
    let call_data = object
        .get("callData")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(invalid)?;
    if !is_hex_calldata(call_data) {
        return Err(invalid());
    }
    Ok(())
}

fn validate_v2(result: &serde_json::Value) -> Result<(), ResultValidationError> {
    let invalid = || ResultValidationError::InvalidV2 {
        got: result.to_string(),
    };
    let object = result.as_object().ok_or_else(invalid)?;
    let can_exec = object
        .get("canExec")
        .and_then(serde_json::Value::as_bool)
        .ok_or_else(invalid)?;
    if !can_exec {
        return Ok(());
    }
    let calls = object
        .get("callData")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(invalid)?;
    for call in calls {
        let entry = call.as_object().ok_or_else(invalid)?;
        let to = entry
            .get("to")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(invalid)?;
        if !is_address(to) {
            return Err(invalid());
        }
        let data = entry
            .get("data")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(invalid)?;
        if !is_hex_calldata(data) {
            return Err(invalid());
        }
        if let Some(value) = entry.get("value") {
            let decimal = value.as_str().ok_or_else(invalid)?;
            if decimal.is_empty() || !decimal.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
        }
    }
    Ok(())
}

/// Hex calldata: `0x` prefix, hex body, total length at least 10.
fn is_hex_calldata(raw: &str) -> bool {
    raw.len() >= 10
        && raw.starts_with("0x")
        && raw[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Syntactically valid 20-byte address.
fn is_address(raw: &str) -> bool {
    raw.len() == 42
        && raw.starts_with("0x")
        && hex::decode(&raw[2..]).map(|b| b.len() == 20).unwrap_or(false)
}
