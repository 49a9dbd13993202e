//! Typed user arguments and the schema they are validated against.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared type of a single user argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserArgType {
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "boolean[]")]
    BooleanArray,
    #[serde(rename = "number[]")]
    NumberArray,
    #[serde(rename = "string[]")]
    StringArray,
}

impl UserArgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Number => "number",
            Self::String => "string",
            Self::BooleanArray => "boolean[]",
            Self::NumberArray => "number[]",
            Self::StringArray => "string[]",
        }
    }

    /// Example literal quoted in schema error messages.
    pub fn example(&self) -> &'static str {
        match self {
            Self::Boolean => "true",
            Self::Number => "3.14",
            Self::String => "\"a\"",
            Self::BooleanArray => "[true, false]",
            Self::NumberArray => "[1, 2, 3]",
            Self::StringArray => "[\"a\", \"b\"]",
        }
    }
}

impl std::fmt::Display for UserArgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed user argument value. Arrays are homogeneous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserArgValue {
    Boolean(bool),
    Number(f64),
    String(String),
    BooleanArray(Vec<bool>),
    NumberArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl UserArgValue {
    pub fn matches(&self, ty: UserArgType) -> bool {
        matches!(
            (self, ty),
            (Self::Boolean(_), UserArgType::Boolean)
                | (Self::Number(_), UserArgType::Number)
                | (Self::String(_), UserArgType::String)
                | (Self::BooleanArray(_), UserArgType::BooleanArray)
                | (Self::NumberArray(_), UserArgType::NumberArray)
                | (Self::StringArray(_), UserArgType::StringArray)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::BooleanArray(_) => "boolean[]",
            Self::NumberArray(_) => "number[]",
            Self::StringArray(_) => "string[]",
        }
    }
}

/// Schema declared by a function: argument name to expected type.
pub type UserArgsSchema = BTreeMap<String, UserArgType>;

/// The typed argument map supplied to a run.
pub type UserArgs = BTreeMap<String, UserArgValue>;
