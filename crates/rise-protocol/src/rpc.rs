//! JSON-RPC Layer (spec §4.B) — request/response/notification envelopes,
//! schema enforcement, and the numeric error taxonomy from spec §7.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// The numeric error codes from spec §7, kept as one enum so every call
/// site constructs the same error shape instead of formatting ad hoc
/// literals (a drift the teacher's own `McpClientError` shows — its errors
/// never carry a JSON-RPC code at all, which this protocol's engine-facing
/// surface cannot afford since callers match on the code).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    PluginError,
    Timeout,
    RateLimited,
}

impl ErrorCode {
    pub const fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::PluginError => -1,
            ErrorCode::Timeout => -2,
            ErrorCode::RateLimited => -3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Build the JSON-RPC error response envelope for the given request id.
    /// `id: None` is used for errors detected before an id could be
    /// recovered (e.g. malformed JSON at the codec boundary) — per spec
    /// §4.B those are logged and dropped rather than sent as a response.
    pub fn to_response(&self, id: Option<u64>) -> Option<RpcMessage> {
        id.map(|id| RpcMessage::Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(self.clone()),
        })
    }
}

/// A decoded JSON-RPC message, distinguished the way spec §4.B requires:
/// presence of `id` without `result`/`error` is a Request; presence of
/// `id` with `result` or `error` is a Response; absence of `id` is a
/// Notification.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RpcMessage {
    Request {
        jsonrpc: String,
        id: u64,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Response {
        jsonrpc: String,
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    Notification {
        jsonrpc: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
}

impl RpcMessage {
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        RpcMessage::Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn response_ok(id: u64, result: Value) -> Self {
        RpcMessage::Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: u64, error: RpcError) -> Self {
        RpcMessage::Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        RpcMessage::Notification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("RpcMessage always serializes")
    }
}

/// Parse a raw JSON value into an [`RpcMessage`], enforcing the envelope
/// rules of spec §4.B rather than relying on serde's untagged matching
/// alone (untagged enums pick the first variant that *parses*, which would
/// silently accept a malformed envelope — e.g. a request missing
/// `jsonrpc` — as a best-effort match).
pub fn parse_message(raw: &Value) -> Result<RpcMessage, ParseOutcome> {
    let obj = raw.as_object().ok_or(ParseOutcome::InvalidRequest { id: None })?;

    let jsonrpc_ok = obj.get("jsonrpc").and_then(Value::as_str) == Some(JSONRPC_VERSION);
    let id = obj.get("id").and_then(Value::as_u64);
    let has_result_or_error = obj.contains_key("result") || obj.contains_key("error");
    let method = obj.get("method").and_then(Value::as_str);

    if !jsonrpc_ok {
        return Err(ParseOutcome::InvalidRequest { id });
    }

    match (id, has_result_or_error, method) {
        (Some(id), true, _) => {
            let result = obj.get("result").cloned();
            let error = obj
                .get("error")
                .map(|e| serde_json::from_value::<RpcError>(e.clone()))
                .transpose()
                .map_err(|_| ParseOutcome::InvalidRequest { id: Some(id) })?;
            Ok(RpcMessage::Response {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result,
                error,
            })
        }
        (Some(id), false, Some(method)) => Ok(RpcMessage::Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params: obj.get("params").cloned(),
        }),
        (None, _, Some(method)) => Ok(RpcMessage::Notification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: obj.get("params").cloned(),
        }),
        _ => Err(ParseOutcome::InvalidRequest { id }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    InvalidRequest { id: Option<u64> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_request() {
        let raw = serde_json::json!({"jsonrpc": "2.0", "id": 7, "method": "ping", "params": {"timestamp": 1}});
        let msg = parse_message(&raw).unwrap();
        assert!(matches!(msg, RpcMessage::Request { id: 7, .. }));
    }

    #[test]
    fn parses_a_response_with_result() {
        let raw = serde_json::json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}});
        let msg = parse_message(&raw).unwrap();
        assert!(matches!(msg, RpcMessage::Response { id: 7, result: Some(_), error: None, .. }));
    }

    #[test]
    fn parses_a_notification() {
        let raw = serde_json::json!({"jsonrpc": "2.0", "method": "stream", "params": {"request_id": 1, "data": "x"}});
        let msg = parse_message(&raw).unwrap();
        assert!(matches!(msg, RpcMessage::Notification { .. }));
    }

    #[test]
    fn rejects_wrong_jsonrpc_version_but_keeps_id() {
        let raw = serde_json::json!({"jsonrpc": "1.0", "id": 3, "method": "ping"});
        let err = parse_message(&raw).unwrap_err();
        assert_eq!(err, ParseOutcome::InvalidRequest { id: Some(3) });
    }

    #[test]
    fn request_without_method_is_invalid() {
        let raw = serde_json::json!({"jsonrpc": "2.0", "id": 3});
        let err = parse_message(&raw).unwrap_err();
        assert_eq!(err, ParseOutcome::InvalidRequest { id: Some(3) });
    }

    #[test]
    fn error_response_round_trips_code() {
        let err = RpcError::new(ErrorCode::Timeout, "the plugin did not respond");
        assert_eq!(err.code, -2);
        let response = err.to_response(Some(9)).unwrap();
        let value = response.to_value();
        assert_eq!(value["error"]["code"], -2);
    }

    #[test]
    fn malformed_with_no_id_drops() {
        let err = RpcError::new(ErrorCode::ParseError, "bad json");
        assert!(err.to_response(None).is_none());
    }
}
