//! MCP Relay HTTP surface.
//!
//! Wires the routing core to axum: the JSON-RPC dispatch route, the
//! prompt-enhancement endpoint, health and stats introspection, and the
//! SSE session layer that translates long-lived client streams into
//! request/response dispatch.

pub mod routes;
pub mod sse;
pub mod state;

pub use routes::router;
pub use state::AppState;
