//! Backend transports.
//!
//! All three transports speak JSON-RPC 2.0 `tools/call`; they differ only in
//! how bytes move. The dispatcher owns transport instances and is the only
//! caller, so parameters arriving here have already been filtered by the
//! policy decision.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use sark_core::errors::GatewayError;
use sark_core::model::ToolResult;

use crate::config::TransportKind;

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Invoke `tool` with already-filtered parameters. One attempt; the
    /// dispatcher handles retries, breakers and deadlines.
    async fn invoke(
        &self,
        tool: &str,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<ToolResult, GatewayError>;

    /// Release connections/processes. Idempotent.
    async fn shutdown(&self) {}
}

/// Build a `tools/call` request body.
pub(crate) fn tool_call_request(id: u64, tool: &str, parameters: &BTreeMap<String, Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {
            "name": tool,
            "arguments": Value::Object(parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>()),
        },
    })
}

/// Interpret a JSON-RPC response document as a tool result.
pub(crate) fn parse_tool_response(backend: &str, response: &Value) -> Result<ToolResult, GatewayError> {
    if let Some(error) = response.get("error") {
        return Err(GatewayError::BackendInvocation {
            backend: backend.to_string(),
            code: error.get("code").and_then(Value::as_i64),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("backend error")
                .to_string(),
        });
    }
    let result = response
        .get("result")
        .ok_or_else(|| GatewayError::BackendInvocation {
            backend: backend.to_string(),
            code: None,
            message: "response carries neither result nor error".to_string(),
        })?;
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(ToolResult {
        content: result.get("content").cloned().unwrap_or(Value::Null),
        is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_embeds_tool_and_arguments() {
        let mut params = BTreeMap::new();
        params.insert("query".to_string(), Value::String("select 1".into()));
        let req = tool_call_request(7, "execute_query", &params);
        assert_eq!(req["id"], 7);
        assert_eq!(req["method"], "tools/call");
        assert_eq!(req["params"]["name"], "execute_query");
        assert_eq!(req["params"]["arguments"]["query"], "select 1");
    }

    #[test]
    fn error_response_maps_to_backend_invocation() {
        let resp = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32602, "message": "bad params"}});
        let err = parse_tool_response("srv-a", &resp).unwrap_err();
        match err {
            GatewayError::BackendInvocation { code, message, .. } => {
                assert_eq!(code, Some(-32602));
                assert_eq!(message, "bad params");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn result_response_maps_to_tool_result() {
        let resp = json!({"jsonrpc": "2.0", "id": 1, "result": {"content": [{"type": "text", "text": "ok"}], "isError": false}});
        let result = parse_tool_response("srv-a", &resp).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content[0]["text"], "ok");
    }

    #[test]
    fn missing_result_is_an_invocation_error() {
        let resp = json!({"jsonrpc": "2.0", "id": 1});
        assert!(parse_tool_response("srv-a", &resp).is_err());
    }
}
