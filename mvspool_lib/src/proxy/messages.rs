// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC ID can be a number, string, or null.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Id {
    Number(u64),
    String(String),
    None(()),
}

/// A miner-facing JSON-RPC request. Requests without an `id` are treated as
/// malformed and charged to the policy collaborator.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Worker tag some stratum miners attach next to the params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl JsonRpcRequest {
    /// Decodes params as a string array, the shape every supported method
    /// uses on this wire.
    pub fn string_params(&self) -> Option<Vec<String>> {
        let params = self.params.as_ref()?;
        serde_json::from_value(params.clone()).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReply {
    pub code: i64,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: i64, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Id>,
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
}

impl JsonRpcResponse {
    pub fn result(id: Option<Id>, result: Value) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Id>, error: ErrorReply) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_decoding() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"id":1,"method":"eth_getWork","params":[]}"#).unwrap();
        assert_eq!(req.id, Some(Id::Number(1)));
        assert_eq!(req.method, "eth_getWork");
        assert_eq!(req.string_params().unwrap().len(), 0);
    }

    #[test]
    fn test_request_without_id() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"method":"eth_getWork","params":[]}"#).unwrap();
        assert!(req.id.is_none());
    }

    #[test]
    fn test_request_with_worker_tag() {
        let req: JsonRpcRequest = serde_json::from_str(
            r#"{"id":"a","method":"eth_submitLogin","params":["Mx"],"worker":"rig0"}"#,
        )
        .unwrap();
        assert_eq!(req.worker.as_deref(), Some("rig0"));
        assert_eq!(req.id, Some(Id::String("a".to_string())));
    }

    #[test]
    fn test_response_encoding_skips_absent_fields() {
        let ok = JsonRpcResponse::result(Some(Id::Number(1)), serde_json::json!(true));
        let encoded = serde_json::to_string(&ok).unwrap();
        assert!(!encoded.contains("error"));

        let err = JsonRpcResponse::error(Some(Id::Number(1)), ErrorReply::new(-1, "no"));
        let encoded = serde_json::to_string(&err).unwrap();
        assert!(!encoded.contains("result"));
        assert!(encoded.contains(r#""code":-1"#));
    }

    #[test]
    fn test_non_array_params_are_rejected_as_strings() {
        let req: JsonRpcRequest =
            serde_json::from_str(r#"{"id":1,"method":"eth_submitWork","params":{"a":1}}"#).unwrap();
        assert!(req.string_params().is_none());
    }
}
