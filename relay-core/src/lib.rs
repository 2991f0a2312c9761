//! MCP Relay routing core.
//!
//! A transport-agnostic library for fronting heterogeneous MCP servers
//! behind one request/response contract: stdio and HTTP adapters, a
//! per-upstream circuit breaker, a config-driven upstream registry, a
//! two-tier prompt cache (exact LRU + remote vector similarity), and the
//! prompt-enhancement middleware that degrades gracefully when the local
//! inference service is down.
//!
//! The HTTP surface and SSE session layer live in `relay-proxy`; this
//! crate provides the building blocks.

pub mod adapters;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod enhance;
pub mod error;
pub mod inference;
pub mod jsonrpc;
pub mod observe;
pub mod registry;
pub mod vector;

pub use adapters::Adapter;
pub use breaker::{BreakerConfig, BreakerState, BreakerStatus, CircuitBreaker};
pub use cache::{CacheEntry, CacheStats, PromptCache, PromptCacheConfig};
pub use config::{
    EnhancementRule, EnhancementRules, ServerConfig, ServersFile, Settings, Transport,
};
pub use enhance::{EnhanceOutcome, EnhancementMiddleware};
pub use error::RelayError;
pub use inference::{InferenceClient, InferenceError};
pub use jsonrpc::{JsonRpcError, JsonRpcId, JsonRpcRequest, JsonRpcResponse};
pub use observe::{RequestLog, RequestLogEntry};
pub use registry::{ServerHealth, UpstreamRegistry};
pub use vector::{VectorStoreClient, VectorStoreError};
