//! JSON-RPC 2.0 framing and MCP payload shapes.

use crate::error::McpError;
use serde::Serialize;
use serde_json::{json, Value};

pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Metadata returned by an MCP server for one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McpToolInfo {
    /// Server that exposes the tool.
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Normalized result returned from an MCP tool call.
#[derive(Debug, Clone)]
pub struct McpToolCallResult {
    pub text: String,
    pub structured_content: Option<Value>,
    pub raw_content: Vec<Value>,
    pub is_error: bool,
}

/// Error object carried by a JSON-RPC response.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RpcError {
    pub code: i64,
    pub message: String,
}

/// One decoded line from the server.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        outcome: Result<Value, RpcError>,
    },
    /// Server-initiated request; must be answered.
    Request { id: Value, method: String },
    Notification { method: String },
    Invalid,
}

impl Incoming {
    pub(crate) fn classify(message: Value) -> Self {
        if let Some(method) = message.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return match message.get("id") {
                Some(id) if !id.is_null() => Incoming::Request {
                    id: id.clone(),
                    method,
                },
                _ => Incoming::Notification { method },
            };
        }

        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            return Incoming::Invalid;
        };
        let outcome = match message.get("error") {
            Some(err) => Err(RpcError {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        Incoming::Response { id, outcome }
    }
}

pub(crate) fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub(crate) fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub(crate) fn method_not_found(id: Value, method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("relay client does not implement MCP client method '{method}'"),
        }
    })
}

pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "relay",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

pub(crate) fn parse_tool_info(server_name: &str, value: &Value) -> Result<McpToolInfo, McpError> {
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| McpError::InvalidResponse {
            server: server_name.to_string(),
            message: "tool entry missing name".to_string(),
        })?;
    let input_schema = value
        .get("inputSchema")
        .cloned()
        .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
    Ok(McpToolInfo {
        server: server_name.to_string(),
        name: name.to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("MCP tool")
            .to_string(),
        input_schema,
    })
}

pub(crate) fn parse_call_result(result: &Value) -> McpToolCallResult {
    let content = result
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let structured_content = result.get("structuredContent").cloned();
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    McpToolCallResult {
        text: render_content_text(&content, structured_content.as_ref()),
        structured_content,
        raw_content: content,
        is_error,
    }
}

fn render_content_text(content: &[Value], structured_content: Option<&Value>) -> String {
    let mut parts = Vec::new();
    for item in content {
        match item.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
            Some("resource") => {
                match item
                    .get("resource")
                    .and_then(|v| v.get("text"))
                    .and_then(Value::as_str)
                {
                    Some(text) => parts.push(text.to_string()),
                    None => parts.push("[resource content omitted]".to_string()),
                }
            }
            Some(kind) => parts.push(format!("[{kind} content omitted]")),
            None => {}
        }
    }

    if parts.is_empty() {
        if let Some(structured_content) = structured_content {
            return serde_json::to_string_pretty(structured_content)
                .unwrap_or_else(|_| structured_content.to_string());
        }
        return "(no output)".to_string();
    }

    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_response_and_error() {
        let ok = Incoming::classify(json!({"jsonrpc": "2.0", "id": 4, "result": {"x": 1}}));
        assert_eq!(
            ok,
            Incoming::Response {
                id: 4,
                outcome: Ok(json!({"x": 1}))
            }
        );

        let err = Incoming::classify(json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -32602, "message": "bad params"}}));
        assert_eq!(
            err,
            Incoming::Response {
                id: 5,
                outcome: Err(RpcError {
                    code: -32602,
                    message: "bad params".to_string()
                })
            }
        );
    }

    #[test]
    fn test_classify_server_messages() {
        assert_eq!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": "s1", "method": "roots/list"})),
            Incoming::Request {
                id: json!("s1"),
                method: "roots/list".to_string()
            }
        );
        assert_eq!(
            Incoming::classify(json!({"jsonrpc": "2.0", "method": "notifications/progress"})),
            Incoming::Notification {
                method: "notifications/progress".to_string()
            }
        );
        assert_eq!(Incoming::classify(json!({"hello": "world"})), Incoming::Invalid);
    }

    #[test]
    fn test_method_not_found_reply() {
        let reply = method_not_found(json!(7), "sampling/createMessage");
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn test_render_mixed_content() {
        let result = parse_call_result(&json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "...", "mimeType": "image/png"},
                {"type": "resource", "resource": {"uri": "file:///a", "text": "file body"}},
                {"type": "text", "text": "line two"}
            ],
            "isError": true
        }));
        assert!(result.is_error);
        assert_eq!(
            result.text,
            "line one\n[image content omitted]\nfile body\nline two"
        );
        assert_eq!(result.raw_content.len(), 4);
    }

    #[test]
    fn test_render_falls_back_to_structured_content() {
        let result = parse_call_result(&json!({"content": [], "structuredContent": {"ok": true}}));
        assert!(result.text.contains("\"ok\": true"));
        assert_eq!(parse_call_result(&json!({})).text, "(no output)");
    }

    #[test]
    fn test_parse_tool_info_defaults() {
        let info = parse_tool_info("srv", &json!({"name": "ping"})).unwrap();
        assert_eq!(info.server, "srv");
        assert_eq!(info.description, "MCP tool");
        assert_eq!(info.input_schema["type"], "object");
        assert!(parse_tool_info("srv", &json!({"description": "x"})).is_err());
    }
}
