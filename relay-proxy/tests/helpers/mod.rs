//! Shared scaffolding for the HTTP surface tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;

use relay_core::breaker::BreakerConfig;
use relay_core::cache::{PromptCache, PromptCacheConfig};
use relay_core::config::{
    EnhancementRule, EnhancementRules, ServerConfig, ServersFile, Transport,
};
use relay_core::enhance::EnhancementMiddleware;
use relay_core::inference::InferenceClient;
use relay_core::observe::RequestLog;
use relay_core::registry::UpstreamRegistry;
use relay_proxy::sse::SessionManager;
use relay_proxy::state::AppState;

pub fn http_server(url: &str, timeout_ms: u64) -> ServerConfig {
    ServerConfig {
        transport: Transport::Http,
        command: vec![],
        url: Some(url.to_string()),
        health_endpoint: None,
        env: HashMap::new(),
        timeout_ms,
    }
}

pub fn stdio_server(command: Vec<String>, timeout_ms: u64) -> ServerConfig {
    ServerConfig {
        transport: Transport::Stdio,
        command,
        url: None,
        health_endpoint: None,
        env: HashMap::new(),
        timeout_ms,
    }
}

pub fn servers(entries: Vec<(&str, ServerConfig)>) -> ServersFile {
    ServersFile {
        servers: entries
            .into_iter()
            .map(|(name, config)| (name.to_string(), config))
            .collect(),
    }
}

pub fn default_rules(model: &str) -> EnhancementRules {
    EnhancementRules {
        default: EnhancementRule {
            enabled: true,
            model: model.to_string(),
            system_prompt: "S".to_string(),
        },
        clients: HashMap::new(),
        fallback_chain: vec![],
    }
}

pub fn quick_breakers(threshold: u32, recovery: Duration) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: threshold,
        recovery_timeout: recovery,
    }
}

/// Build the full application around stubbed collaborators.
pub async fn build_app(
    servers: ServersFile,
    rules: EnhancementRules,
    inference_url: &str,
    breakers: BreakerConfig,
) -> (Router, AppState) {
    let inference = Arc::new(InferenceClient::new(inference_url));
    let cache = Arc::new(
        PromptCache::connect(PromptCacheConfig::default(), Arc::clone(&inference), None).await,
    );
    let enhancer = Arc::new(EnhancementMiddleware::new(
        rules,
        cache,
        Arc::clone(&inference),
    ));

    let registry = Arc::new(UpstreamRegistry::new(&servers, breakers).expect("registry builds"));
    registry.initialize().await;

    let state = AppState {
        registry,
        enhancer,
        inference,
        sessions: Arc::new(SessionManager::new()),
        request_log: Arc::new(RequestLog::default()),
    };
    (relay_proxy::router(state.clone()), state)
}

pub fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request builds")
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .expect("request builds")
}

pub async fn read_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}
