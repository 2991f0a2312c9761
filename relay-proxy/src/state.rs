//! Shared application state.

use std::sync::Arc;

use relay_core::enhance::EnhancementMiddleware;
use relay_core::inference::InferenceClient;
use relay_core::observe::RequestLog;
use relay_core::registry::UpstreamRegistry;

use crate::sse::SessionManager;

/// Handles shared by every request task. Cloning is cheap; all fields
/// are reference-counted. The registry owns the adapters and breakers;
/// everything here is a non-owning view from the handlers' perspective.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<UpstreamRegistry>,
    pub enhancer: Arc<EnhancementMiddleware>,
    pub inference: Arc<InferenceClient>,
    pub sessions: Arc<SessionManager>,
    pub request_log: Arc<RequestLog>,
}
