//! Client for the local language-model inference service.
//!
//! A thin HTTP wrapper over the Ollama-style API: `generate` for text
//! completion and `embed` for embedding vectors. Failures surface as
//! typed [`InferenceError`]s so callers can apply their own fallback
//! policy; this client performs no retries and makes no policy
//! decisions of its own.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default deadline for generation calls.
pub const DEFAULT_GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors from the inference service.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// The HTTP request failed (connection refused, timeout, ...).
    #[error("inference request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service answered with a non-2xx status.
    #[error("inference service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered 2xx but the body was not usable.
    #[error("malformed inference response: {reason}")]
    Malformed { reason: String },
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    /// Always false: one response object, no streaming.
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// HTTP client for the inference endpoint.
#[derive(Clone)]
pub struct InferenceClient {
    base_url: String,
    client: reqwest::Client,
}

impl InferenceClient {
    /// Build a client for the given base URL with the default deadline.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_GENERATE_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("default reqwest client builds");
        Self { base_url, client }
    }

    /// Generate a completion for `prompt` with `model`.
    ///
    /// # Errors
    ///
    /// Any transport failure, non-2xx status, or unusable body; the
    /// caller decides whether to fall back.
    pub async fn generate(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
    ) -> Result<String, InferenceError> {
        let url = format!("{}/api/generate", self.base_url);
        debug!(%model, "requesting generation");

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model,
                prompt,
                system,
                stream: false,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| InferenceError::Malformed {
                    reason: e.to_string(),
                })?;
        Ok(body.response.trim().to_string())
    }

    /// Compute an embedding vector for `text` with `model`.
    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>, InferenceError> {
        let url = format!("{}/api/embeddings", self.base_url);
        debug!(%model, "requesting embedding");

        let response = self
            .client
            .post(&url)
            .json(&EmbeddingRequest {
                model,
                prompt: text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: EmbeddingResponse =
            response
                .json()
                .await
                .map_err(|e| InferenceError::Malformed {
                    reason: e.to_string(),
                })?;
        if body.embedding.is_empty() {
            return Err(InferenceError::Malformed {
                reason: "empty embedding".to_string(),
            });
        }
        Ok(body.embedding)
    }

    /// Whether the service answers at all (used by aggregate health).
    pub async fn available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        self.client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn generate_returns_trimmed_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(
                json!({"model": "m", "system": "S", "stream": false}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "m",
                "response": "  enhanced text\n"
            })))
            .mount(&server)
            .await;

        let client = InferenceClient::new(server.uri());
        let text = client.generate("m", "S", "hi").await.unwrap();
        assert_eq!(text, "enhanced text");
    }

    #[tokio::test]
    async fn generate_omits_empty_system_prompt() {
        let request = GenerateRequest {
            model: "m",
            prompt: "p",
            system: "",
            stream: false,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert!(!body.as_object().unwrap().contains_key("system"));
    }

    #[tokio::test]
    async fn generate_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let client = InferenceClient::new(server.uri());
        let err = client.generate("m", "", "hi").await.unwrap_err();
        match err {
            InferenceError::Status { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("model not loaded"));
            }
            other => panic!("expected Status, got {other}"),
        }
    }

    #[tokio::test]
    async fn generate_connection_refused_is_a_request_error() {
        let client = InferenceClient::new("http://127.0.0.1:1");
        let err = client.generate("m", "", "hi").await.unwrap_err();
        assert!(matches!(err, InferenceError::Request(_)), "got {err}");
    }

    #[tokio::test]
    async fn embed_returns_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(json!({"model": "nomic-embed-text"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "embedding": [0.1, 0.2, 0.3]
            })))
            .mount(&server)
            .await;

        let client = InferenceClient::new(server.uri());
        let vector = client.embed("nomic-embed-text", "hi").await.unwrap();
        assert_eq!(vector.len(), 3);
    }

    #[tokio::test]
    async fn empty_embedding_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": []})))
            .mount(&server)
            .await;

        let client = InferenceClient::new(server.uri());
        let err = client.embed("m", "hi").await.unwrap_err();
        assert!(matches!(err, InferenceError::Malformed { .. }), "got {err}");
    }

    #[tokio::test]
    async fn available_checks_tags_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"models": []})))
            .mount(&server)
            .await;

        let client = InferenceClient::new(server.uri());
        assert!(client.available().await);

        let down = InferenceClient::new("http://127.0.0.1:1");
        assert!(!down.available().await);
    }
}
