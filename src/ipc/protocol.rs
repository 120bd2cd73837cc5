//! JSON-RPC 2.0 message types for the control socket.
//!
//! Requests are parsed leniently from a raw [`serde_json::Value`] so that
//! malformed input can still be answered with the caller's id.

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Invalid JSON.
pub const PARSE_ERROR: i32 = -32700;
/// Not a valid request object.
pub const INVALID_REQUEST: i32 = -32600;
/// Unknown method.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Bad parameters.
pub const INVALID_PARAMS: i32 = -32602;
/// Handler failure.
pub const INTERNAL_ERROR: i32 = -32603;

/// Method name used for server-pushed events.
pub const EVENT_METHOD: &str = "event";

/// JSON-RPC message identifier (number or string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Numeric id.
    Num(i64),
    /// String id.
    Str(String),
}

/// A validated inbound request or notification.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// `None` for notifications.
    pub id: Option<RpcId>,
    /// Method name.
    pub method: String,
    /// Named parameters; non-object params are treated as empty.
    pub params: Map<String, Value>,
}

impl RpcRequest {
    /// Returns true if this is a notification (no id).
    #[must_use]
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    /// Error with `code` and `message`.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// `invalid params` error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// `method not found` error.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// `internal error`.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

/// JSON-RPC response. `id` is serialized as `null` when unknown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Always `2.0`.
    pub jsonrpc: String,
    /// Id of the request answered.
    pub id: Option<RpcId>,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Construct a success response with the given result.
    #[must_use]
    pub fn success(id: Option<RpcId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Construct an error response.
    #[must_use]
    pub fn failure(id: Option<RpcId>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Serialize as one NDJSON line without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#
                .to_owned()
        })
    }
}

/// JSON-RPC notification (server to client, no id, no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    /// Always `2.0`.
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Parameters.
    pub params: Value,
}

impl RpcNotification {
    /// Construct a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
        }
    }

    /// Serialize as one NDJSON line without the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Event streams a subscriber can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// A line appended to the output buffer.
    Output,
    /// A change to session state.
    StateChange,
}

impl EventKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Output => "output",
            Self::StateChange => "state_change",
        }
    }
}

/// Subscription name accepted by `subscribe`/`unsubscribe`.
pub const WILDCARD: &str = "*";

/// Validate subscription names, returning them as a set.
///
/// # Errors
///
/// Returns an `invalid params` error naming the first unknown entry.
pub fn parse_event_names(params: &Map<String, Value>) -> Result<BTreeSet<String>, RpcError> {
    let events = match params.get("events") {
        None => return Ok(BTreeSet::new()),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(RpcError::invalid_params("'events' must be a list")),
    };
    let mut names = BTreeSet::new();
    for event in events {
        match event.as_str() {
            Some(name @ ("output" | "state_change" | WILDCARD)) => {
                names.insert(name.to_owned());
            }
            _ => {
                return Err(RpcError::invalid_params(format!(
                    "Invalid event type: {event}. Valid: *, output, state_change"
                )))
            }
        }
    }
    Ok(names)
}

/// Build the `event` notification for `kind` carrying `data`.
#[must_use]
pub fn event_notification(kind: EventKind, data: Value) -> RpcNotification {
    RpcNotification::new(
        EVENT_METHOD,
        serde_json::json!({
            "type": kind.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        }),
    )
}

/// Parse one inbound line.
///
/// # Errors
///
/// Returns the error response to send back: `parse error` for invalid
/// JSON, `invalid request` for a non-object, a wrong `jsonrpc` version, or
/// a missing method.
pub fn parse_request(line: &str) -> Result<RpcRequest, RpcResponse> {
    let value: Value = serde_json::from_str(line)
        .map_err(|_| RpcResponse::failure(None, RpcError::new(PARSE_ERROR, "Parse error")))?;

    let Value::Object(mut obj) = value else {
        return Err(RpcResponse::failure(
            None,
            RpcError::new(INVALID_REQUEST, "Invalid request"),
        ));
    };

    let id = obj
        .get("id")
        .and_then(|v| serde_json::from_value::<RpcId>(v.clone()).ok());

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(RpcResponse::failure(
            id,
            RpcError::new(INVALID_REQUEST, "Invalid JSON-RPC version"),
        ));
    }

    let Some(method) = obj.get("method").and_then(Value::as_str).map(str::to_owned) else {
        return Err(RpcResponse::failure(
            id,
            RpcError::new(INVALID_REQUEST, "Missing method"),
        ));
    };

    let params = match obj.remove("params") {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };

    Ok(RpcRequest { id, method, params })
}

/// Inbound message on the client side of the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Answer to a request.
    Response(RpcResponse),
    /// Server-pushed notification.
    Notification(RpcNotification),
}

/// Classify one line received from a server.
///
/// # Errors
///
/// Returns the JSON error if the line is neither a response nor a
/// notification.
pub fn parse_server_message(line: &str) -> serde_json::Result<ServerMessage> {
    let value: Value = serde_json::from_str(line)?;
    if value.get("method").is_some() && value.get("id").is_none() {
        serde_json::from_value(value).map(ServerMessage::Notification)
    } else {
        serde_json::from_value(value).map(ServerMessage::Response)
    }
}
