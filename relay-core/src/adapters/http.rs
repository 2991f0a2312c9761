//! HTTP transport adapter.
//!
//! Posts each serialized JSON-RPC request to the upstream URL and parses
//! the full response body. The adapter owns a pooled [`reqwest::Client`]
//! so repeat calls reuse connections.
//!
//! Failure classification: a timeout is [`RelayError::UpstreamTimeout`];
//! connection errors, non-2xx statuses, and unparseable bodies are
//! [`RelayError::UpstreamUnavailable`]. A 2xx body that parses into a
//! JSON-RPC response, even one carrying an `error` object, is a
//! successful call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapters::Adapter;
use crate::config::{ServerConfig, Transport};
use crate::error::RelayError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// Deadline for health probes, independent of the call deadline.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Sentinel for "no call recorded yet" in the latency cell.
const LATENCY_UNSET: u64 = u64::MAX;

/// Adapter for an upstream speaking JSON-RPC over HTTP POST.
pub struct HttpAdapter {
    name: String,
    url: String,
    health_url: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
    last_latency: AtomicU64,
}

impl HttpAdapter {
    /// Build an adapter from a validated server config.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the URL does not parse or the
    /// HTTP client cannot be constructed.
    pub fn new(name: impl Into<String>, config: &ServerConfig) -> Result<Self, RelayError> {
        let name = name.into();
        let url = config.url.clone().unwrap_or_default();
        reqwest::Url::parse(&url).map_err(|e| RelayError::Config {
            details: format!("server '{name}': invalid url '{url}': {e}"),
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(5))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RelayError::Config {
                details: format!("server '{name}': cannot build http client: {e}"),
            })?;

        let health_url = config
            .health_endpoint
            .as_deref()
            .map(|path| format!("{}{}", url.trim_end_matches('/'), path));

        Ok(Self {
            name,
            url,
            health_url,
            timeout: config.timeout(),
            client,
            last_latency: AtomicU64::new(LATENCY_UNSET),
        })
    }

    fn classify(&self, error: reqwest::Error) -> RelayError {
        if error.is_timeout() {
            RelayError::UpstreamTimeout {
                server: self.name.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            RelayError::UpstreamUnavailable {
                server: self.name.clone(),
                cause: error.to_string(),
            }
        }
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    async fn call(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, RelayError> {
        debug!(server = %self.name, method = %request.method, "forwarding to http upstream");
        let start = Instant::now();

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(server = %self.name, status = %status, "upstream returned error status");
            return Err(RelayError::UpstreamUnavailable {
                server: self.name.clone(),
                cause: format!("HTTP {status}"),
            });
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let parsed: JsonRpcResponse =
            serde_json::from_slice(&body).map_err(|e| RelayError::UpstreamUnavailable {
                server: self.name.clone(),
                cause: format!("unparseable response: {e}"),
            })?;

        self.last_latency
            .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
        Ok(parsed)
    }

    async fn is_healthy(&self) -> bool {
        match &self.health_url {
            // A configured health endpoint must answer 2xx.
            Some(health_url) => self
                .client
                .get(health_url)
                .timeout(HEALTH_TIMEOUT)
                .send()
                .await
                .map(|resp| resp.status().is_success())
                .unwrap_or(false),
            // Without one, any HTTP answer means the server is reachable
            // (a 405 on GET is expected from a JSON-RPC endpoint).
            None => self
                .client
                .get(&self.url)
                .timeout(HEALTH_TIMEOUT)
                .send()
                .await
                .is_ok(),
        }
    }

    async fn stop(&self) {
        // Connection pool drains when the client drops.
    }

    fn transport(&self) -> Transport {
        Transport::Http
    }

    fn last_latency_ms(&self) -> Option<u64> {
        match self.last_latency.load(Ordering::Relaxed) {
            LATENCY_UNSET => None,
            ms => Some(ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::JsonRpcId;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(url: &str, timeout_ms: u64, health: Option<&str>) -> ServerConfig {
        ServerConfig {
            transport: Transport::Http,
            command: vec![],
            url: Some(url.to_string()),
            health_endpoint: health.map(String::from),
            env: HashMap::new(),
            timeout_ms,
        }
    }

    fn request(id: i64) -> JsonRpcRequest {
        JsonRpcRequest::new("tools/list", json!({}), JsonRpcId::Number(id))
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let config = config_for("not a url", 1000, None);
        assert!(matches!(
            HttpAdapter::new("bad", &config),
            Err(RelayError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn call_posts_request_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(json!({"method": "tools/list", "id": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "result": {"tools": []}, "id": 5
            })))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new("web", &config_for(&server.uri(), 5000, None)).unwrap();
        let response = adapter.call(&request(5)).await.unwrap();
        assert_eq!(response.id, Some(JsonRpcId::Number(5)));
        assert!(!response.is_error());
        assert!(adapter.last_latency_ms().is_some());
    }

    #[tokio::test]
    async fn upstream_jsonrpc_error_is_a_successful_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "error": {"code": -32601, "message": "no such method"},
                "id": 1
            })))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new("web", &config_for(&server.uri(), 5000, None)).unwrap();
        let response = adapter.call(&request(1)).await.unwrap();
        assert!(response.is_error());
    }

    #[tokio::test]
    async fn non_2xx_is_a_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new("web", &config_for(&server.uri(), 5000, None)).unwrap();
        let err = adapter.call(&request(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnavailable { .. }), "got {err}");
    }

    #[tokio::test]
    async fn unparseable_body_is_a_transport_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new("web", &config_for(&server.uri(), 5000, None)).unwrap();
        let err = adapter.call(&request(1)).await.unwrap_err();
        match err {
            RelayError::UpstreamUnavailable { cause, .. } => {
                assert!(cause.contains("unparseable"), "cause: {cause}")
            }
            other => panic!("expected UpstreamUnavailable, got {other}"),
        }
    }

    #[tokio::test]
    async fn slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"jsonrpc": "2.0", "result": null, "id": 1}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new("slow", &config_for(&server.uri(), 100, None)).unwrap();
        let err = adapter.call(&request(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamTimeout { .. }), "got {err}");
    }

    #[tokio::test]
    async fn connection_refused_is_unavailable() {
        let config = config_for("http://127.0.0.1:1", 1000, None);
        let adapter = HttpAdapter::new("down", &config).unwrap();
        let err = adapter.call(&request(1)).await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamUnavailable { .. }), "got {err}");
    }

    #[tokio::test]
    async fn health_endpoint_requires_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter =
            HttpAdapter::new("web", &config_for(&server.uri(), 5000, Some("/health"))).unwrap();
        assert!(!adapter.is_healthy().await);
    }

    #[tokio::test]
    async fn plain_reachability_counts_without_health_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;

        let adapter = HttpAdapter::new("web", &config_for(&server.uri(), 5000, None)).unwrap();
        assert!(adapter.is_healthy().await);
    }

    #[tokio::test]
    async fn unreachable_server_is_unhealthy() {
        let adapter =
            HttpAdapter::new("down", &config_for("http://127.0.0.1:1", 1000, None)).unwrap();
        assert!(!adapter.is_healthy().await);
    }
}
