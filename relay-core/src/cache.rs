//! Two-tier prompt cache.
//!
//! L1 is an in-memory exact-text LRU: hits touch the entry to
//! most-recently-used, inserts at capacity evict the least-recently-used.
//! L2 is a remote vector collection searched by embedding similarity; a
//! hit there returns the stored enhancement without promoting it into L1,
//! because the exact prompt text differs.
//!
//! Every write lands in L1. The L2 write is best-effort: the embedding is
//! computed and upserted after the L1 insert, and any failure is logged
//! and swallowed; L1 remains authoritative. An L1 entry without an L2
//! counterpart therefore only exists when the embedding step failed.
//!
//! Embeddings are unit-normalized before every upsert and search, so the
//! store's cosine score coincides with the dot product and the similarity
//! threshold has a single meaning.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::inference::InferenceClient;
use crate::vector::{PointPayload, VectorStoreClient, EMBEDDING_DIM};

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct PromptCacheConfig {
    /// Maximum L1 entries.
    pub capacity: usize,
    /// Cosine score threshold for L2 hits.
    pub similarity_threshold: f32,
    /// Model used for embedding computation.
    pub embedding_model: String,
    /// Vector dimension, fixed at collection creation.
    pub embedding_dim: usize,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            similarity_threshold: 0.85,
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dim: EMBEDDING_DIM,
        }
    }
}

/// One cached enhancement with its metadata.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub prompt: String,
    pub response: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub hits: u64,
}

/// Counter snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub l1_size: usize,
    pub l1_capacity: usize,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub l2_available: bool,
    pub l2_entries: u64,
}

struct L2 {
    client: VectorStoreClient,
    available: AtomicBool,
}

/// The two-tier cache. Owns the inference client (for embeddings) and
/// the vector-store client.
pub struct PromptCache {
    config: PromptCacheConfig,
    l1: Mutex<LruCache<String, CacheEntry>>,
    inference: Arc<InferenceClient>,
    l2: Option<L2>,
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
}

impl PromptCache {
    /// Build the cache and, when a vector-store URL is given, ensure the
    /// collection exists. A store that cannot be reached at startup
    /// disables the L2 tier rather than failing the cache.
    pub async fn connect(
        config: PromptCacheConfig,
        inference: Arc<InferenceClient>,
        vector_store_url: Option<&str>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).expect("capacity >= 1");

        let l2 = match vector_store_url {
            Some(url) => {
                let client = VectorStoreClient::new(url);
                let available = match client.ensure_collection(config.embedding_dim).await {
                    Ok(()) => {
                        debug!(url, "semantic cache tier connected");
                        true
                    }
                    Err(e) => {
                        warn!(url, error = %e, "vector store unavailable; L2 tier disabled");
                        false
                    }
                };
                Some(L2 {
                    client,
                    available: AtomicBool::new(available),
                })
            }
            None => None,
        };

        Self {
            config,
            l1: Mutex::new(LruCache::new(capacity)),
            inference,
            l2,
            l1_hits: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn l2_available(&self) -> bool {
        self.l2
            .as_ref()
            .map(|l2| l2.available.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Look up a prompt: exact L1 match first, then semantic L2.
    pub async fn get(&self, prompt: &str) -> Option<CacheEntry> {
        {
            let mut l1 = self.l1.lock().expect("cache lock poisoned");
            if let Some(entry) = l1.get_mut(prompt) {
                entry.hits += 1;
                self.l1_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.clone());
            }
        }

        if self.l2_available() {
            if let Some(entry) = self.l2_lookup(prompt).await {
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn l2_lookup(&self, prompt: &str) -> Option<CacheEntry> {
        let l2 = self.l2.as_ref()?;

        let embedding = match self
            .inference
            .embed(&self.config.embedding_model, prompt)
            .await
        {
            Ok(vector) => vector,
            Err(e) => {
                debug!(error = %e, "embedding failed; skipping semantic lookup");
                return None;
            }
        };
        let embedding = normalize(embedding)?;

        match l2
            .client
            .search(&embedding, self.config.similarity_threshold)
            .await
        {
            Ok(Some(hit)) => {
                debug!(score = hit.score, "semantic cache hit");
                Some(CacheEntry {
                    prompt: hit.payload.prompt,
                    response: hit.payload.response,
                    model: hit.payload.model,
                    created_at: hit
                        .payload
                        .created_at
                        .parse()
                        .unwrap_or_else(|_| Utc::now()),
                    hits: 0,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "vector store search failed");
                None
            }
        }
    }

    /// Store an enhancement. The L1 insert always happens; the L2 upsert
    /// is best-effort.
    pub async fn put(&self, prompt: &str, response: &str, model: &str) {
        let entry = CacheEntry {
            prompt: prompt.to_string(),
            response: response.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
            hits: 0,
        };
        let payload = PointPayload {
            prompt: entry.prompt.clone(),
            response: entry.response.clone(),
            model: entry.model.clone(),
            created_at: entry.created_at.to_rfc3339(),
        };

        {
            let mut l1 = self.l1.lock().expect("cache lock poisoned");
            l1.push(prompt.to_string(), entry);
        }

        if !self.l2_available() {
            return;
        }
        let l2 = self.l2.as_ref().expect("l2_available implies l2");

        let embedding = match self
            .inference
            .embed(&self.config.embedding_model, prompt)
            .await
        {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "embedding failed; entry cached in L1 only");
                return;
            }
        };
        let Some(embedding) = normalize(embedding) else {
            warn!("zero-norm embedding; entry cached in L1 only");
            return;
        };

        if let Err(e) = l2.client.upsert(&embedding, &payload).await {
            warn!(error = %e, "vector store upsert failed; entry cached in L1 only");
        }
    }

    /// Empty L1 and drop+recreate the L2 collection. Counters reset.
    pub async fn clear(&self) {
        self.l1.lock().expect("cache lock poisoned").clear();
        self.l1_hits.store(0, Ordering::Relaxed);
        self.l2_hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);

        if let Some(l2) = &self.l2 {
            match l2.client.recreate(self.config.embedding_dim).await {
                Ok(()) => l2.available.store(true, Ordering::Relaxed),
                Err(e) => {
                    warn!(error = %e, "vector store recreate failed; L2 tier disabled");
                    l2.available.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    /// Current counters and sizes.
    pub async fn stats(&self) -> CacheStats {
        let (l1_size, l1_capacity) = {
            let l1 = self.l1.lock().expect("cache lock poisoned");
            (l1.len(), l1.cap().get())
        };
        let l1_hits = self.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.l2_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hits = l1_hits + l2_hits;
        let total = hits + misses;

        let l2_available = self.l2_available();
        let l2_entries = if l2_available {
            let l2 = self.l2.as_ref().expect("l2_available implies l2");
            l2.client.count().await.unwrap_or(0)
        } else {
            0
        };

        CacheStats {
            l1_size,
            l1_capacity,
            l1_hits,
            l2_hits,
            hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            l2_available,
            l2_entries,
        }
    }
}

/// Scale a vector to unit length. Returns `None` for zero or non-finite
/// norms, which callers treat as an embedding failure.
fn normalize(mut vector: Vec<f32>) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    for x in &mut vector {
        *x /= norm;
    }
    Some(vector)
}
