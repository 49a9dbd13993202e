//! User-argument validation and parsing against the declared schema.

use std::collections::BTreeMap;
use w3f_types::{SchemaError, UserArgType, UserArgValue, UserArgs, UserArgsSchema};

/// Checks every schema key against an already-typed argument map.
pub fn validate_user_args(schema: &UserArgsSchema, args: &UserArgs) -> Result<(), SchemaError> {
    for (key, ty) in schema {
        let Some(value) = args.get(key) else {
            return Err(SchemaError::MissingKey {
                key: key.clone(),
                expected: ty.as_str(),
            });
        };
        if !value.matches(*ty) {
            return Err(SchemaError::TypeMismatch {
                key: key.clone(),
                expected: ty.as_str(),
                value: serde_json::to_string(value).unwrap_or_default(),
                example: ty.example(),
            });
        }
    }
    Ok(())
}

/// Parses a string map (as arrives from CLIs) into typed arguments:
/// each value is JSON-decoded, then coerced against the declared type.
pub fn parse_user_args(
    schema: &UserArgsSchema,
    inputs: &BTreeMap<String, String>,
) -> Result<UserArgs, SchemaError> {
    let mut out = UserArgs::new();
    for (key, ty) in schema {
        let Some(raw) = inputs.get(key) else {
            return Err(SchemaError::MissingKey {
                key: key.clone(),
                expected: ty.as_str(),
            });
        };
        let decoded: serde_json::Value =
            serde_json::from_str(raw).map_err(|_| SchemaError::TypeMismatch {
                key: key.clone(),
                expected: ty.as_str(),
                value: raw.clone(),
                example: ty.example(),
            })?;
        out.insert(key.clone(), coerce(key, *ty, decoded)?);
    }
    Ok(out)
}

fn coerce(
    key: &str,
    ty: UserArgType,
    value: serde_json::Value,
) -> Result<UserArgValue, SchemaError> {
    let mismatch = |value: &serde_json::Value| SchemaError::TypeMismatch {
        key: key.to_string(),
        expected: ty.as_str(),
        value: value.to_string(),
        example: ty.example(),
    };
    let typed = match ty {
        UserArgType::Boolean => value.as_bool().map(UserArgValue::Boolean),
        UserArgType::Number => value.as_f64().map(UserArgValue::Number),
        UserArgType::String => value.as_str().map(|s| UserArgValue::String(s.to_string())),
        UserArgType::BooleanArray => collect_array(&value, serde_json::Value::as_bool)
            .map(UserArgValue::BooleanArray),
        UserArgType::NumberArray => {
            collect_array(&value, serde_json::Value::as_f64).map(UserArgValue::NumberArray)
        }
        UserArgType::StringArray => {
            collect_array(&value, |v| v.as_str().map(str::to_string))
                .map(UserArgValue::StringArray)
        }
    };
    typed.ok_or_else(|| mismatch(&value))
}

/// Collects a homogeneous array; any element of the wrong type fails the
/// whole argument.
fn collect_array<T>(
    value: &serde_json::Value,
    extract: impl Fn(&serde_json::Value) -> Option<T>,
) -> Option<Vec<T>> {
    value.as_array()?.iter().map(extract).collect()
}
