//! Prompt enhancement middleware.
//!
//! Sits between the public surface and the inference service. For each
//! prompt it looks up the calling client's rule (falling back to the
//! default), consults the cache, and only then asks the inference service
//! to rewrite the prompt. Inference failures are never surfaced: the
//! middleware walks the fallback model chain and, when that runs dry,
//! returns the original prompt unchanged. A `null` entry in the chain
//! short-circuits straight to that passthrough.
//!
//! A crude context check (about four characters per token, with a 10%
//! margin) skips models whose declared limit the prompt would exceed.
//! The estimate errs conservative; a prompt that slips past it and fails
//! anyway degrades to passthrough like any other inference failure.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheStats, PromptCache};
use crate::config::EnhancementRules;
use crate::inference::InferenceClient;

/// Declared context limits (in tokens, approximate) per model.
const MODEL_LIMITS: &[(&str, usize)] = &[
    ("llama3.2:3b", 128_000),
    ("llama3", 8_000),
    ("deepseek-r1:14b", 64_000),
    ("deepseek-r1", 64_000),
    ("qwen2.5-coder:7b", 128_000),
    ("phi3:mini", 128_000),
    ("nomic-embed-text", 8_000),
];

/// Assumed limit for models not in the table.
const DEFAULT_MODEL_LIMIT: usize = 8_000;

/// Result of an enhancement attempt. Always a success from the caller's
/// point of view; degradation shows up as `enhanced == original`.
#[derive(Debug, Clone, Serialize)]
pub struct EnhanceOutcome {
    pub original: String,
    pub enhanced: String,
    pub model: Option<String>,
    pub cached: bool,
    /// True when the client's rule disables enhancement entirely.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    /// Degradation detail when every model failed. Informational only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnhanceOutcome {
    fn passthrough(prompt: &str, model: Option<String>, error: Option<String>) -> Self {
        Self {
            original: prompt.to_string(),
            enhanced: prompt.to_string(),
            model,
            cached: false,
            skipped: false,
            error,
        }
    }
}

/// Per-client prompt enhancement with caching and graceful fallback.
pub struct EnhancementMiddleware {
    rules: EnhancementRules,
    cache: Arc<PromptCache>,
    inference: Arc<InferenceClient>,
}

impl EnhancementMiddleware {
    pub fn new(
        rules: EnhancementRules,
        cache: Arc<PromptCache>,
        inference: Arc<InferenceClient>,
    ) -> Self {
        Self {
            rules,
            cache,
            inference,
        }
    }

    /// Enhance `prompt` on behalf of `client`. Never fails.
    pub async fn enhance(&self, prompt: &str, client: Option<&str>) -> EnhanceOutcome {
        let rule = self.rules.rule_for(client);

        if !rule.enabled {
            debug!(client = client.unwrap_or("default"), "enhancement disabled by rule");
            return EnhanceOutcome {
                original: prompt.to_string(),
                enhanced: prompt.to_string(),
                model: None,
                cached: false,
                skipped: true,
                error: None,
            };
        }

        if let Some(entry) = self.cache.get(prompt).await {
            return EnhanceOutcome {
                original: prompt.to_string(),
                enhanced: entry.response,
                model: Some(entry.model),
                cached: true,
                skipped: false,
                error: None,
            };
        }

        let framed = format!("Enhance this prompt:\n\n{prompt}");
        let mut last_error: Option<String> = None;

        for model in self.candidate_models(&rule.model) {
            let Some(model) = model else {
                // The chain's null sentinel: give up, return the original.
                debug!("fallback chain reached its stop sentinel");
                return EnhanceOutcome::passthrough(prompt, None, last_error);
            };

            if !fits_context(prompt, model) {
                warn!(%model, "prompt exceeds model context limit; trying next");
                continue;
            }

            match self
                .inference
                .generate(model, &rule.system_prompt, &framed)
                .await
            {
                Ok(enhanced) if !enhanced.is_empty() => {
                    self.cache.put(prompt, &enhanced, model).await;
                    return EnhanceOutcome {
                        original: prompt.to_string(),
                        enhanced,
                        model: Some(model.to_string()),
                        cached: false,
                        skipped: false,
                        error: None,
                    };
                }
                Ok(_) => {
                    warn!(%model, "model returned an empty enhancement; trying next");
                    last_error = Some(format!("{model}: empty response"));
                }
                Err(e) => {
                    warn!(%model, error = %e, "enhancement failed; trying next");
                    last_error = Some(e.to_string());
                }
            }
        }

        EnhanceOutcome::passthrough(prompt, Some(rule.model.clone()), last_error)
    }

    /// The preferred model followed by the fallback chain, minus
    /// duplicates of the preferred model. `None` entries are kept; they
    /// terminate the walk.
    fn candidate_models<'a>(&'a self, preferred: &'a str) -> impl Iterator<Item = Option<&'a str>> {
        std::iter::once(Some(preferred)).chain(
            self.rules
                .fallback_chain
                .iter()
                .map(|entry| entry.as_deref())
                .filter(move |entry| *entry != Some(preferred)),
        )
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) {
        self.cache.clear().await;
    }
}

/// Whether `prompt` plausibly fits the model's context window.
fn fits_context(prompt: &str, model: &str) -> bool {
    let estimated_tokens = prompt.len() / 4;
    let limit = MODEL_LIMITS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_MODEL_LIMIT);
    estimated_tokens < limit * 9 / 10
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PromptCacheConfig;
    use crate::config::EnhancementRule;
    use serde_json::json;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rules(
        default_model: &str,
        enabled: bool,
        chain: Vec<Option<&str>>,
    ) -> EnhancementRules {
        EnhancementRules {
            default: EnhancementRule {
                enabled,
                model: default_model.to_string(),
                system_prompt: "S".to_string(),
            },
            clients: HashMap::new(),
            fallback_chain: chain.into_iter().map(|m| m.map(String::from)).collect(),
        }
    }

    async fn middleware_with(
        inference_url: &str,
        rules: EnhancementRules,
    ) -> EnhancementMiddleware {
        let inference = Arc::new(InferenceClient::new(inference_url));
        let cache = Arc::new(
            PromptCache::connect(PromptCacheConfig::default(), Arc::clone(&inference), None).await,
        );
        EnhancementMiddleware::new(rules, cache, inference)
    }

    fn stub_generate(model: &str, response: &str) -> Mock {
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"model": model})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": response
            })))
    }

    #[tokio::test]
    async fn enhances_and_caches() {
        let server = MockServer::start().await;
        stub_generate("m", "ENH(hi)").expect(1).mount(&server).await;

        let mw = middleware_with(&server.uri(), rules("m", true, vec![])).await;

        let first = mw.enhance("hi", None).await;
        assert_eq!(first.enhanced, "ENH(hi)");
        assert_eq!(first.model.as_deref(), Some("m"));
        assert!(!first.cached);

        // Second call hits the cache: the mock's expect(1) would fail on
        // a second generate call.
        let second = mw.enhance("hi", None).await;
        assert_eq!(second.enhanced, "ENH(hi)");
        assert!(second.cached);
        assert_eq!(mw.cache_stats().await.hits, 1);
    }

    #[tokio::test]
    async fn disabled_rule_passes_through_unchanged() {
        let mw = middleware_with("http://127.0.0.1:1", rules("m", false, vec![])).await;
        let outcome = mw.enhance("hi", None).await;
        assert_eq!(outcome.enhanced, "hi");
        assert!(outcome.skipped);
        assert!(!outcome.cached);
        assert!(outcome.model.is_none());
    }

    #[tokio::test]
    async fn client_rule_overrides_default() {
        let server = MockServer::start().await;
        stub_generate("coder", "CODE(hi)").mount(&server).await;

        let mut config = rules("m", true, vec![]);
        config.clients.insert(
            "vscode".to_string(),
            EnhancementRule {
                enabled: true,
                model: "coder".to_string(),
                system_prompt: "C".to_string(),
            },
        );
        let mw = middleware_with(&server.uri(), config).await;

        let outcome = mw.enhance("hi", Some("vscode")).await;
        assert_eq!(outcome.model.as_deref(), Some("coder"));
        assert_eq!(outcome.enhanced, "CODE(hi)");
    }

    #[tokio::test]
    async fn inference_outage_degrades_to_passthrough() {
        let mw = middleware_with("http://127.0.0.1:1", rules("m", true, vec![])).await;
        let outcome = mw.enhance("hi", None).await;
        assert_eq!(outcome.enhanced, "hi");
        assert!(!outcome.cached);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn fallback_model_is_tried_after_primary_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"model": "primary"})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        stub_generate("backup", "BAK(hi)").mount(&server).await;

        let mw = middleware_with(&server.uri(), rules("primary", true, vec![Some("backup")])).await;
        let outcome = mw.enhance("hi", None).await;
        assert_eq!(outcome.model.as_deref(), Some("backup"));
        assert_eq!(outcome.enhanced, "BAK(hi)");
    }

    #[tokio::test]
    async fn null_sentinel_stops_the_chain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"model": "primary"})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        // "after" would succeed, but the sentinel comes first.
        stub_generate("after", "NEVER").expect(0).mount(&server).await;

        let mw = middleware_with(
            &server.uri(),
            rules("primary", true, vec![None, Some("after")]),
        )
        .await;
        let outcome = mw.enhance("hi", None).await;
        assert_eq!(outcome.enhanced, "hi");
        assert!(!outcome.cached);
    }

    #[tokio::test]
    async fn chain_skips_duplicate_of_preferred_model() {
        let server = MockServer::start().await;
        // One logical model that always fails: it must only be tried once.
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let mw = middleware_with(&server.uri(), rules("m", true, vec![Some("m")])).await;
        let outcome = mw.enhance("hi", None).await;
        assert_eq!(outcome.enhanced, "hi");
    }

    #[tokio::test]
    async fn oversized_prompt_skips_small_model() {
        let server = MockServer::start().await;
        // llama3 declares 8k tokens; a ~40k-token prompt must skip it.
        stub_generate("llama3.2:3b", "BIG").mount(&server).await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"model": "llama3"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "NEVER"})))
            .expect(0)
            .mount(&server)
            .await;

        let big_prompt = "x".repeat(160_000);
        let mw = middleware_with(
            &server.uri(),
            rules("llama3", true, vec![Some("llama3.2:3b")]),
        )
        .await;
        let outcome = mw.enhance(&big_prompt, None).await;
        assert_eq!(outcome.model.as_deref(), Some("llama3.2:3b"));
        assert_eq!(outcome.enhanced, "BIG");
    }

    #[test]
    fn context_check_is_conservative() {
        assert!(fits_context("short prompt", "llama3"));
        assert!(!fits_context(&"x".repeat(40_000), "llama3"));
        // Unknown models assume the small default limit.
        assert!(!fits_context(&"x".repeat(40_000), "mystery-model"));
        assert!(fits_context("short", "mystery-model"));
    }
}
