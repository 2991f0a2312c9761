//! Relay error taxonomy.
//!
//! Every failure the routing core can produce is a [`RelayError`] variant.
//! Each variant knows its JSON-RPC error code and the HTTP status the
//! surface should respond with, and can render itself as a complete
//! [`JsonRpcResponse`] echoing the caller's request id.
//!
//! Transport-level failures (`UpstreamUnavailable`, `UpstreamTimeout`,
//! `AdapterExhausted`) are the only variants the registry tallies against
//! a circuit breaker. A JSON-RPC `error` payload from a healthy upstream is
//! not an error here at all: it is a successful call whose response
//! happens to carry an error object, and it passes through unchanged.

use serde_json::json;
use thiserror::Error;

use crate::jsonrpc::{codes, JsonRpcError, JsonRpcId, JsonRpcResponse};

/// Errors produced by the routing core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request body was not valid JSON.
    #[error("invalid JSON: {details}")]
    ParseError { details: String },

    /// The request parsed but is not a usable JSON-RPC 2.0 message.
    #[error("invalid JSON-RPC request: {details}")]
    InvalidRequest { details: String },

    /// No upstream is registered under the requested name.
    #[error("unknown server: {server}")]
    UnknownServer {
        server: String,
        /// Names the registry does know, surfaced in error data.
        available: Vec<String>,
    },

    /// Request parameters failed validation.
    #[error("invalid parameters: {details}")]
    InvalidParams { details: String },

    /// The upstream's circuit breaker is open; the adapter was not invoked.
    #[error("server '{server}' is unavailable (circuit open)")]
    CircuitOpen { server: String, retry_after_ms: u64 },

    /// The adapter failed to reach the upstream or to read a usable reply.
    #[error("upstream '{server}' unavailable: {cause}")]
    UpstreamUnavailable { server: String, cause: String },

    /// The upstream did not answer within the configured deadline.
    #[error("upstream '{server}' timed out after {timeout_ms}ms")]
    UpstreamTimeout { server: String, timeout_ms: u64 },

    /// A stdio upstream crashed more times than its restart budget allows.
    /// Calls fail permanently until an explicit reset re-arms the adapter.
    #[error("upstream '{server}' exceeded {max_restarts} restarts")]
    AdapterExhausted { server: String, max_restarts: u32 },

    /// The SSE session id is unknown or the session has been closed.
    #[error("session not found: {session}")]
    SessionNotFound { session: String },

    /// Startup configuration is malformed. Fatal: the process must not
    /// come up with a config it cannot trust.
    #[error("configuration error: {details}")]
    Config { details: String },

    /// A bug or unrepresentable state inside the relay itself.
    #[error("internal error: {details}")]
    Internal { details: String },
}

impl RelayError {
    /// The JSON-RPC error code this variant maps to.
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            RelayError::ParseError { .. } => codes::PARSE_ERROR,
            RelayError::InvalidRequest { .. } => codes::INVALID_REQUEST,
            RelayError::UnknownServer { .. } => codes::METHOD_NOT_FOUND,
            RelayError::InvalidParams { .. } => codes::INVALID_PARAMS,
            RelayError::CircuitOpen { .. } => codes::SERVER_ERROR,
            RelayError::UpstreamUnavailable { .. } => codes::SERVER_ERROR,
            RelayError::UpstreamTimeout { .. } => codes::TIMEOUT,
            RelayError::AdapterExhausted { .. } => codes::SERVER_ERROR,
            RelayError::SessionNotFound { .. } => codes::INVALID_REQUEST,
            RelayError::Config { .. } => codes::INTERNAL_ERROR,
            RelayError::Internal { .. } => codes::INTERNAL_ERROR,
        }
    }

    /// The HTTP status the public surface should use for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::ParseError { .. }
            | RelayError::InvalidRequest { .. }
            | RelayError::InvalidParams { .. } => 400,
            RelayError::UnknownServer { .. } | RelayError::SessionNotFound { .. } => 404,
            RelayError::CircuitOpen { .. }
            | RelayError::UpstreamUnavailable { .. }
            | RelayError::AdapterExhausted { .. } => 503,
            RelayError::UpstreamTimeout { .. } => 504,
            RelayError::Config { .. } | RelayError::Internal { .. } => 500,
        }
    }

    /// Whether this error is an adapter-level transport failure that a
    /// circuit breaker should count. Breaker rejections themselves are
    /// excluded: a call that never reached the adapter is not new
    /// evidence against the upstream.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamUnavailable { .. }
                | RelayError::UpstreamTimeout { .. }
                | RelayError::AdapterExhausted { .. }
        )
    }

    /// Render this error as a JSON-RPC error object.
    ///
    /// `data` carries machine-readable detail (retry hints, causes, the
    /// list of known servers) and never internal stack traces.
    pub fn to_error_object(&self) -> JsonRpcError {
        let error = JsonRpcError::new(self.json_rpc_code(), self.to_string());
        match self {
            RelayError::UnknownServer { available, .. } => {
                error.with_data(json!({ "available": available }))
            }
            RelayError::CircuitOpen { retry_after_ms, .. } => {
                error.with_data(json!({ "retry_after_ms": retry_after_ms }))
            }
            RelayError::UpstreamUnavailable { cause, .. } => {
                error.with_data(json!({ "cause": cause }))
            }
            RelayError::UpstreamTimeout { timeout_ms, .. } => {
                error.with_data(json!({ "timeout_ms": timeout_ms }))
            }
            RelayError::AdapterExhausted { max_restarts, .. } => {
                error.with_data(json!({ "max_restarts": max_restarts }))
            }
            _ => error,
        }
    }

    /// Render a complete JSON-RPC error response echoing `id`.
    pub fn into_response(self, id: Option<JsonRpcId>) -> JsonRpcResponse {
        JsonRpcResponse::error(id, self.to_error_object())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_and_status_mapping() {
        let cases: &[(RelayError, i32, u16)] = &[
            (
                RelayError::ParseError {
                    details: "x".into(),
                },
                codes::PARSE_ERROR,
                400,
            ),
            (
                RelayError::UnknownServer {
                    server: "nope".into(),
                    available: vec![],
                },
                codes::METHOD_NOT_FOUND,
                404,
            ),
            (
                RelayError::CircuitOpen {
                    server: "bad".into(),
                    retry_after_ms: 1000,
                },
                codes::SERVER_ERROR,
                503,
            ),
            (
                RelayError::UpstreamTimeout {
                    server: "slow".into(),
                    timeout_ms: 30_000,
                },
                codes::TIMEOUT,
                504,
            ),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.json_rpc_code(), *code, "code for {err}");
            assert_eq!(err.http_status(), *status, "status for {err}");
        }
    }

    #[test]
    fn circuit_open_carries_retry_hint() {
        let err = RelayError::CircuitOpen {
            server: "bad".into(),
            retry_after_ms: 12_500,
        };
        let obj = err.to_error_object();
        assert_eq!(obj.code, codes::SERVER_ERROR);
        assert_eq!(obj.data.unwrap()["retry_after_ms"], 12_500);
    }

    #[test]
    fn unknown_server_lists_available() {
        let err = RelayError::UnknownServer {
            server: "nope".into(),
            available: vec!["filesystem".into(), "memory".into()],
        };
        let obj = err.to_error_object();
        assert_eq!(obj.data.unwrap()["available"][1], "memory");
    }

    #[test]
    fn transport_failures_are_breaker_events() {
        assert!(RelayError::UpstreamUnavailable {
            server: "s".into(),
            cause: "refused".into()
        }
        .is_transport_failure());
        assert!(RelayError::UpstreamTimeout {
            server: "s".into(),
            timeout_ms: 1
        }
        .is_transport_failure());
        // A breaker rejection never reached the adapter.
        assert!(!RelayError::CircuitOpen {
            server: "s".into(),
            retry_after_ms: 1
        }
        .is_transport_failure());
        assert!(!RelayError::UnknownServer {
            server: "s".into(),
            available: vec![]
        }
        .is_transport_failure());
    }

    #[test]
    fn into_response_echoes_id() {
        let err = RelayError::UpstreamTimeout {
            server: "slow".into(),
            timeout_ms: 5000,
        };
        let resp = err.into_response(Some(JsonRpcId::Number(42)));
        assert_eq!(resp.id, Some(JsonRpcId::Number(42)));
        assert_eq!(resp.error.unwrap().code, codes::TIMEOUT);
    }
}
