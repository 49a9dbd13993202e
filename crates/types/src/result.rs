//! Result schema versions and the typed result shapes.

use serde::{Deserialize, Serialize};

/// The two wire schemas a function can return under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Web3FunctionVersion {
    #[serde(rename = "1.0")]
    V1,
    #[serde(rename = "2.0")]
    V2,
}

impl Web3FunctionVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "1.0",
            Self::V2 => "2.0",
        }
    }
}

impl std::fmt::Display for Web3FunctionVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Web3FunctionVersion {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "1.0" => Ok(Self::V1),
            "2.0" => Ok(Self::V2),
            other => Err(format!("unknown web3 function version '{other}'")),
        }
    }
}

/// One call of a V2 result: target address, calldata and an optional value
/// expressed as a decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallData {
    pub to: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// Typed V1 result: a single calldata payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Web3FunctionResultV1 {
    pub can_exec: bool,
    pub call_data: String,
}

/// Typed V2 result: an array of calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Web3FunctionResultV2 {
    pub can_exec: bool,
    pub call_data: Vec<CallData>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_tags() {
        assert_eq!(serde_json::to_value(Web3FunctionVersion::V1).unwrap(), "1.0");
        assert_eq!(serde_json::to_value(Web3FunctionVersion::V2).unwrap(), "2.0");
    }

    #[test]
    fn version_parses_its_own_display() {
        assert_eq!("1.0".parse::<Web3FunctionVersion>(), Ok(Web3FunctionVersion::V1));
        assert_eq!("2.0".parse::<Web3FunctionVersion>(), Ok(Web3FunctionVersion::V2));
        assert!("3.0".parse::<Web3FunctionVersion>().is_err());
    }

    #[test]
    fn v2_result_serializes_camel_case() {
        let result = Web3FunctionResultV2 {
            can_exec: true,
            call_data: vec![CallData {
                to: "0x0000000000000000000000000000000000000001".to_string(),
                data: "0xdeadbeef".to_string(),
                value: None,
            }],
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["canExec"], json!(true));
        assert_eq!(value["callData"][0]["data"], json!("0xdeadbeef"));
        assert!(value["callData"][0].get("value").is_none());
    }
}
