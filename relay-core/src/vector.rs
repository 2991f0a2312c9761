//! Vector-store client for the semantic cache tier.
//!
//! Speaks the Qdrant REST API over HTTP: one collection of cosine-distance
//! points, one point per cached enhancement. The client is deliberately
//! narrow: ensure/recreate the collection, upsert one point, search for
//! the single nearest neighbor above a score threshold, count points.
//!
//! Callers are expected to unit-normalize vectors before upsert and
//! search; with unit vectors the engine's cosine score equals the dot
//! product, so the configured threshold has one meaning.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Collection holding the prompt cache points.
pub const COLLECTION: &str = "prompt_cache";

/// Vector dimension, fixed at collection creation. Matches the nominal
/// embedding model (`nomic-embed-text`).
pub const EMBEDDING_DIM: usize = 768;

/// Errors from the vector store.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("vector store request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("vector store returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed vector store response: {reason}")]
    Malformed { reason: String },
}

/// Payload stored alongside each point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPayload {
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub created_at: String,
}

/// A search hit: the stored payload plus its similarity score.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub score: f32,
    pub payload: PointPayload,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: &'static str,
}

#[derive(Serialize)]
struct CreateCollectionRequest {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct PointStruct<'a> {
    id: String,
    vector: &'a [f32],
    payload: &'a PointPayload,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    points: Vec<PointStruct<'a>>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    score_threshold: f32,
    with_payload: bool,
}

#[derive(Deserialize)]
struct ApiEnvelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    payload: Option<PointPayload>,
}

#[derive(Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: Option<u64>,
}

/// HTTP client for one vector collection.
#[derive(Clone)]
pub struct VectorStoreClient {
    base_url: String,
    collection: String,
    client: reqwest::Client,
}

impl VectorStoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_collection(base_url, COLLECTION)
    }

    pub fn with_collection(base_url: impl Into<String>, collection: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("default reqwest client builds");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.base_url, self.collection)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, VectorStoreError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(VectorStoreError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Create the collection if it does not exist yet.
    ///
    /// The dimension and distance are fixed here; changing the embedding
    /// model later requires recreating the collection.
    pub async fn ensure_collection(&self, dim: usize) -> Result<(), VectorStoreError> {
        let response = self.client.get(self.collection_url()).send().await?;
        if response.status().is_success() {
            debug!(collection = %self.collection, "vector collection exists");
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorStoreError::Status { status, body });
        }

        let response = self
            .client
            .put(self.collection_url())
            .json(&CreateCollectionRequest {
                vectors: VectorParams {
                    size: dim,
                    distance: "Cosine",
                },
            })
            .send()
            .await?;
        Self::check(response).await?;
        info!(collection = %self.collection, dim, "created vector collection");
        Ok(())
    }

    /// Drop and recreate the collection (the L2 half of a cache clear).
    pub async fn recreate(&self, dim: usize) -> Result<(), VectorStoreError> {
        let response = self.client.delete(self.collection_url()).send().await?;
        // A missing collection is fine; anything else non-2xx is not.
        if !response.status().is_success() && response.status().as_u16() != 404 {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(VectorStoreError::Status { status, body });
        }
        self.ensure_collection(dim).await
    }

    /// Insert one point with a freshly generated id.
    pub async fn upsert(
        &self,
        vector: &[f32],
        payload: &PointPayload,
    ) -> Result<(), VectorStoreError> {
        let response = self
            .client
            .put(format!("{}/points", self.collection_url()))
            .json(&UpsertRequest {
                points: vec![PointStruct {
                    id: Uuid::new_v4().to_string(),
                    vector,
                    payload,
                }],
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    /// Nearest neighbor above `score_threshold`, if any.
    pub async fn search(
        &self,
        vector: &[f32],
        score_threshold: f32,
    ) -> Result<Option<VectorHit>, VectorStoreError> {
        let response = self
            .client
            .post(format!("{}/points/search", self.collection_url()))
            .json(&SearchRequest {
                vector,
                limit: 1,
                score_threshold,
                with_payload: true,
            })
            .send()
            .await?;
        let response = Self::check(response).await?;

        let envelope: ApiEnvelope<Vec<ScoredPoint>> =
            response
                .json()
                .await
                .map_err(|e| VectorStoreError::Malformed {
                    reason: e.to_string(),
                })?;

        Ok(envelope.result.into_iter().next().and_then(|point| {
            point.payload.map(|payload| VectorHit {
                score: point.score,
                payload,
            })
        }))
    }

    /// Number of points in the collection.
    pub async fn count(&self) -> Result<u64, VectorStoreError> {
        let response = self.client.get(self.collection_url()).send().await?;
        let response = Self::check(response).await?;
        let envelope: ApiEnvelope<CollectionInfo> =
            response
                .json()
                .await
                .map_err(|e| VectorStoreError::Malformed {
                    reason: e.to_string(),
                })?;
        Ok(envelope.result.points_count.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> PointPayload {
        PointPayload {
            prompt: "hi".into(),
            response: "ENH(hi)".into(),
            model: "m".into(),
            created_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    #[tokio::test]
    async fn ensure_collection_skips_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/prompt_cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"points_count": 2}, "status": "ok"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = VectorStoreClient::new(server.uri());
        client.ensure_collection(EMBEDDING_DIM).await.unwrap();
    }

    #[tokio::test]
    async fn ensure_collection_creates_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/prompt_cache"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/prompt_cache"))
            .and(body_partial_json(json!({
                "vectors": {"size": 768, "distance": "Cosine"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = VectorStoreClient::new(server.uri());
        client.ensure_collection(EMBEDDING_DIM).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_posts_one_point() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/collections/prompt_cache/points"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let client = VectorStoreClient::new(server.uri());
        client.upsert(&[0.5; 768], &payload()).await.unwrap();
    }

    #[tokio::test]
    async fn search_returns_highest_scoring_hit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/prompt_cache/points/search"))
            .and(body_partial_json(
                json!({"limit": 1, "score_threshold": 0.85, "with_payload": true}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [{
                    "id": "abc", "score": 0.91,
                    "payload": {
                        "prompt": "hello there",
                        "response": "ENH(hello there)",
                        "model": "m",
                        "created_at": "2025-01-01T00:00:00Z"
                    }
                }]
            })))
            .mount(&server)
            .await;

        let client = VectorStoreClient::new(server.uri());
        let hit = client.search(&[0.5; 768], 0.85).await.unwrap().unwrap();
        assert!((hit.score - 0.91).abs() < 1e-6);
        assert_eq!(hit.payload.response, "ENH(hello there)");
    }

    #[tokio::test]
    async fn search_empty_result_is_a_miss() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/prompt_cache/points/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": []})))
            .mount(&server)
            .await;

        let client = VectorStoreClient::new(server.uri());
        assert!(client.search(&[0.5; 768], 0.85).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn count_reads_collection_info() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/prompt_cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"points_count": 17, "status": "green"}
            })))
            .mount(&server)
            .await;

        let client = VectorStoreClient::new(server.uri());
        assert_eq!(client.count().await.unwrap(), 17);
    }

    #[tokio::test]
    async fn recreate_deletes_then_creates() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/collections/prompt_cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/collections/prompt_cache"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/prompt_cache"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = VectorStoreClient::new(server.uri());
        client.recreate(EMBEDDING_DIM).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_store_is_a_request_error() {
        let client = VectorStoreClient::new("http://127.0.0.1:1");
        let err = client.count().await.unwrap_err();
        assert!(matches!(err, VectorStoreError::Request(_)), "got {err}");
    }
}
