//! JSON-RPC 2.0 wire types for MCP traffic.
//!
//! The relay forwards requests and responses between clients and upstream
//! MCP servers without rewriting them: the `id` a client sends is the `id`
//! it gets back. These types deserialize permissively (unknown fields are
//! ignored) and reserialize only the fields that were present, so an
//! upstream error payload passes through untouched.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Standard JSON-RPC 2.0 error codes plus the relay-specific range.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid JSON-RPC request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method (or, for the relay, the target server) does not exist.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error: the upstream is unreachable or its breaker is open.
    pub const SERVER_ERROR: i32 = -32000;
    /// The upstream did not respond within the deadline.
    pub const TIMEOUT: i32 = -32001;
    /// The upstream responded with something the relay could not use.
    pub const UPSTREAM_ERROR: i32 = -32002;
}

/// A JSON-RPC request or response identifier.
///
/// JSON-RPC 2.0 permits integers, strings, and `null`. Floats, booleans,
/// arrays, and objects are rejected at parse time. `Null` is distinct from
/// an *absent* id: a request without an id is a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
    Null,
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_unit(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(JsonRpcId::Number)
                .ok_or_else(|| D::Error::custom("JSON-RPC id must be an integer, string, or null")),
            serde_json::Value::String(s) => Ok(JsonRpcId::String(s)),
            serde_json::Value::Null => Ok(JsonRpcId::Null),
            _ => Err(D::Error::custom(
                "JSON-RPC id must be an integer, string, or null",
            )),
        }
    }
}

impl std::fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{n}"),
            JsonRpcId::String(s) => write!(f, "{s}"),
            JsonRpcId::Null => write!(f, "null"),
        }
    }
}

/// Deserialize an id field that is present in the JSON text.
///
/// Plain `Option<JsonRpcId>` would collapse an explicit `"id": null` into
/// `None`, losing the distinction between a null id and a notification.
/// Routing through this function keeps `"id": null` as `Some(Null)` while
/// an absent field stays `None` via `#[serde(default)]`.
fn deserialize_present_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<JsonRpcId>, D::Error> {
    JsonRpcId::deserialize(deserializer).map(Some)
}

/// A JSON-RPC 2.0 request (or notification, when `id` is absent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(
        default,
        deserialize_with = "deserialize_present_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<JsonRpcId>,
}

impl JsonRpcRequest {
    /// Build a request with the given method, params, and id.
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: JsonRpcId) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params: Some(params),
            id: Some(id),
        }
    }

    /// A notification carries no id and expects no response.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A JSON-RPC 2.0 error object, embedded in error responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A JSON-RPC 2.0 response: exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(
        default,
        deserialize_with = "deserialize_present_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<JsonRpcId>,
}

impl JsonRpcResponse {
    /// Build a success response echoing the request id.
    pub fn success(id: Option<JsonRpcId>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: default_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Build an error response echoing the request id.
    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: default_version(),
            result: None,
            error: Some(error),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

fn default_version() -> String {
    "2.0".to_string()
}
