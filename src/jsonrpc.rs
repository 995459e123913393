//! JSON-RPC 2.0 request/response/error framing for provider calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const JSONRPC_VERSION: &str = "2.0";

/// A request or response id: either a string or a number, per the JSON-RPC spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl From<uuid::Uuid> for RequestId {
    fn from(id: uuid::Uuid) -> Self {
        RequestId::String(id.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params: Some(params),
        }
    }
}

/// Standard and domain-extended JSON-RPC error codes.
///
/// Standard codes reuse the JSON-RPC reserved range; domain errors are
/// distinguished by `data.kind` rather than a separate code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub i64);

impl ErrorCode {
    pub const PARSE_ERROR: ErrorCode = ErrorCode(-32700);
    pub const INVALID_REQUEST: ErrorCode = ErrorCode(-32600);
    pub const METHOD_NOT_FOUND: ErrorCode = ErrorCode(-32601);
    pub const INVALID_PARAMS: ErrorCode = ErrorCode(-32602);
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(-32603);
    /// Domain error range start; specific kind carried in `data.kind`.
    pub const SERVER_ERROR: ErrorCode = ErrorCode(-32000);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.0,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        let data = self.data.take().unwrap_or_else(|| serde_json::json!({}));
        let mut data = data;
        if let Value::Object(ref mut map) = data {
            map.insert("kind".to_string(), Value::String(kind.into()));
        }
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.data.as_ref()?.get("kind")?.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(flatten)]
    pub outcome: JsonRpcOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcOutcome {
    Result { result: Value },
    Error { error: JsonRpcError },
}

impl JsonRpcResponse {
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: JsonRpcOutcome::Result { result },
        }
    }

    #[must_use]
    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            outcome: JsonRpcOutcome::Error { error },
        }
    }

    #[must_use]
    pub fn into_result(self) -> std::result::Result<Value, JsonRpcError> {
        match self.outcome {
            JsonRpcOutcome::Result { result } => Ok(result),
            JsonRpcOutcome::Error { error } => Err(error),
        }
    }
}

impl From<JsonRpcError> for crate::error::TaskError {
    fn from(e: JsonRpcError) -> Self {
        let kind_code = e
            .kind()
            .unwrap_or(crate::error::ErrorKind::ProviderError.code())
            .to_string();
        crate::error::TaskError {
            kind_code,
            message: e.message,
            data: e.data,
        }
    }
}
