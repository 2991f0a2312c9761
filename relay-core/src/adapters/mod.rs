//! Transport adapters: one uniform calling contract per upstream.
//!
//! An adapter speaks JSON-RPC 2.0 to exactly one upstream over its native
//! transport and exposes a single operation, `call(request) → response`,
//! within a deadline. The caller provides the request `id`; adapters never
//! rewrite it.
//!
//! Two transports exist: [`http::HttpAdapter`] posts to an upstream URL,
//! [`stdio::StdioAdapter`] owns a subprocess and frames newline-delimited
//! JSON over its standard streams.

pub mod http;
pub mod stdio;

use async_trait::async_trait;

use crate::config::Transport;
use crate::error::RelayError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// Uniform request/response contract over one upstream.
///
/// `call` errors are transport failures (timeout, crash, parse error,
/// non-2xx HTTP); a JSON-RPC `error` payload from the upstream is a
/// successful call and comes back as `Ok`.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Send one request and await its response within the adapter's
    /// configured deadline.
    async fn call(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, RelayError>;

    /// Whether the upstream currently looks reachable: a running child
    /// process (stdio) or a responding endpoint (http).
    async fn is_healthy(&self) -> bool;

    /// Stop the adapter, releasing its subprocess or connections.
    async fn stop(&self);

    /// The transport this adapter speaks, for health payloads.
    fn transport(&self) -> Transport;

    /// Latency of the most recent successful call, if any.
    fn last_latency_ms(&self) -> Option<u64>;

    /// Re-arm the adapter after operator intervention (clears the stdio
    /// restart budget; no-op for http).
    fn reset(&self) {}
}
