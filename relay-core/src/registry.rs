//! Upstream registry: config-driven adapters behind breaker gates.
//!
//! Built once at startup from the loaded server config, the registry owns
//! one adapter and one circuit breaker per upstream name and routes every
//! call through the gate:
//!
//! 1. unknown name → method-not-found;
//! 2. breaker refuses → service-unavailable with a retry hint, without
//!    touching the adapter;
//! 3. adapter success → breaker success, response returned unchanged
//!    (JSON-RPC error payloads included);
//! 4. adapter transport failure → breaker failure, error to the caller
//!    (non-transport errors propagate without touching the breaker).
//!
//! The registry is read-mostly after startup: the maps never change, only
//! the adapters and breakers behind them carry state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::adapters::http::HttpAdapter;
use crate::adapters::stdio::StdioAdapter;
use crate::adapters::Adapter;
use crate::breaker::{BreakerConfig, BreakerRegistry, BreakerStatus, CircuitBreaker};
use crate::config::{ServersFile, Transport};
use crate::error::RelayError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// Total deadline for stopping all adapters at shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Health snapshot for one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub name: String,
    pub status: &'static str,
    pub transport: Transport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub circuit_breaker: BreakerStatus,
}

/// The registry. Handlers hold it behind an `Arc`; it owns its adapters
/// and breakers exclusively.
pub struct UpstreamRegistry {
    adapters: BTreeMap<String, Arc<dyn Adapter>>,
    /// The stdio subset again, concretely typed for eager startup.
    stdio: BTreeMap<String, Arc<StdioAdapter>>,
    breakers: BreakerRegistry,
}

impl UpstreamRegistry {
    /// Build adapters and breakers from a validated config.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when an HTTP adapter cannot be
    /// constructed (bad URL). Stdio adapters spawn lazily and cannot
    /// fail here.
    pub fn new(config: &ServersFile, breaker_config: BreakerConfig) -> Result<Self, RelayError> {
        let mut adapters: BTreeMap<String, Arc<dyn Adapter>> = BTreeMap::new();
        let mut stdio: BTreeMap<String, Arc<StdioAdapter>> = BTreeMap::new();
        for (name, server) in &config.servers {
            match server.transport {
                Transport::Http => {
                    adapters.insert(name.clone(), Arc::new(HttpAdapter::new(name, server)?));
                }
                Transport::Stdio => {
                    let adapter = Arc::new(StdioAdapter::new(name, server));
                    stdio.insert(name.clone(), Arc::clone(&adapter));
                    adapters.insert(name.clone(), adapter);
                }
            }
            info!(server = %name, transport = %server.transport, "registered upstream");
        }

        let breakers =
            BreakerRegistry::new(adapters.keys().map(String::as_str), breaker_config);
        Ok(Self {
            adapters,
            stdio,
            breakers,
        })
    }

    /// Spawn the stdio subprocesses. A spawn failure is recorded against
    /// the server's breaker rather than failing startup: the upstream
    /// may come back, and the breaker already models that.
    pub async fn initialize(&self) {
        for (name, adapter) in &self.stdio {
            if let Err(e) = adapter.start().await {
                error!(server = %name, error = %e, "failed to start stdio server");
                if let Some(breaker) = self.breakers.get(name) {
                    breaker.record_failure();
                }
            }
        }
    }

    pub fn list_servers(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    fn breaker(&self, name: &str) -> &Arc<CircuitBreaker> {
        self.breakers
            .get(name)
            .expect("every adapter has a breaker")
    }

    /// Route one JSON-RPC request to the named upstream.
    ///
    /// # Errors
    ///
    /// - [`RelayError::UnknownServer`] for an unregistered name;
    /// - [`RelayError::CircuitOpen`] when the breaker refuses (the
    ///   adapter is not invoked);
    /// - the adapter's error otherwise. Transport failures are tallied
    ///   against the breaker before propagating; other error kinds
    ///   propagate without becoming breaker events.
    pub async fn call(
        &self,
        server: &str,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, RelayError> {
        let adapter = self
            .adapters
            .get(server)
            .ok_or_else(|| RelayError::UnknownServer {
                server: server.to_string(),
                available: self.list_servers(),
            })?;

        let breaker = self.breaker(server);
        if !breaker.can_execute() {
            warn!(server, "rejecting call: circuit open");
            return Err(RelayError::CircuitOpen {
                server: server.to_string(),
                retry_after_ms: breaker.retry_after_ms(),
            });
        }

        match adapter.call(request).await {
            Ok(response) => {
                breaker.record_success();
                Ok(response)
            }
            Err(e) => {
                warn!(server, error = %e, "upstream call failed");
                // Only transport failures count against the breaker; a
                // local fault (request serialization, say) is no
                // evidence about the upstream.
                if e.is_transport_failure() {
                    breaker.record_failure();
                }
                Err(e)
            }
        }
    }

    /// Health of one upstream, including a probe latency for HTTP
    /// transports.
    pub async fn health(&self, server: &str) -> Result<ServerHealth, RelayError> {
        let adapter = self
            .adapters
            .get(server)
            .ok_or_else(|| RelayError::UnknownServer {
                server: server.to_string(),
                available: self.list_servers(),
            })?;

        let probe_start = Instant::now();
        let healthy = adapter.is_healthy().await;
        // For HTTP the probe round-trip is itself a latency measurement;
        // otherwise fall back to the last call's latency.
        let latency_ms = match adapter.transport() {
            Transport::Http if healthy => Some(probe_start.elapsed().as_millis() as u64),
            _ => adapter.last_latency_ms(),
        };

        Ok(ServerHealth {
            name: server.to_string(),
            status: if healthy { "healthy" } else { "down" },
            transport: adapter.transport(),
            latency_ms,
            circuit_breaker: self.breaker(server).status(),
        })
    }

    /// Health of every upstream, probed concurrently.
    pub async fn all_health(&self) -> Vec<ServerHealth> {
        let probes = self
            .adapters
            .keys()
            .map(|name| self.health(name))
            .collect::<Vec<_>>();
        join_all(probes)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    pub fn breaker_statuses(&self) -> Vec<BreakerStatus> {
        self.breakers.all_status()
    }

    /// Reset every breaker and re-arm exhausted stdio adapters. This is
    /// the operator's explicit restart request.
    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
        for adapter in self.adapters.values() {
            adapter.reset();
        }
        info!("breakers and restart budgets reset");
    }

    /// Stop all adapters in parallel under a bounded deadline.
    pub async fn shutdown(&self) {
        info!("stopping upstream adapters");
        let stops = self
            .adapters
            .values()
            .map(|adapter| adapter.stop())
            .collect::<Vec<_>>();
        if tokio::time::timeout(SHUTDOWN_DEADLINE, join_all(stops))
            .await
            .is_err()
        {
            warn!("adapter shutdown exceeded deadline");
        }
    }
}
