//! MCP Relay: a local routing gateway for Model Context Protocol traffic.
//!
//! One HTTP endpoint fronting a heterogeneous set of upstream MCP servers
//! (stdio subprocesses and HTTP endpoints), with per-upstream circuit
//! breakers, prompt enhancement through a local inference service, a
//! two-tier prompt cache, and an SSE session layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use relay_core::breaker::BreakerConfig;
use relay_core::cache::{PromptCache, PromptCacheConfig};
use relay_core::config::{EnhancementRules, ServersFile, Settings};
use relay_core::enhance::EnhancementMiddleware;
use relay_core::inference::InferenceClient;
use relay_core::observe::RequestLog;
use relay_core::registry::UpstreamRegistry;

use relay_proxy::sse::SessionManager;
use relay_proxy::state::AppState;

/// How often the idle-session reaper sweeps.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "mcp-relay", version, about, long_about = None)]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Listen port (overrides LISTEN_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the server registry config (overrides MCP_SERVERS_CONFIG).
    #[arg(long)]
    servers_config: Option<PathBuf>,

    /// Path to the enhancement rules config (overrides
    /// ENHANCEMENT_RULES_CONFIG).
    #[arg(long)]
    rules_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .init();

    let port = args.port.unwrap_or(settings.listen_port);
    let servers_path = args
        .servers_config
        .unwrap_or_else(|| settings.servers_config.clone());
    let rules_path = args
        .rules_config
        .unwrap_or_else(|| settings.rules_config.clone());

    // Configuration errors are fatal: the relay must not come up with a
    // registry or rule set it cannot trust.
    let servers = match ServersFile::load(&servers_path) {
        Ok(servers) => servers,
        Err(e) => {
            error!(path = %servers_path.display(), %e, "cannot load server config");
            std::process::exit(1);
        }
    };
    let rules = match EnhancementRules::load(&rules_path) {
        Ok(rules) => rules,
        Err(e) => {
            error!(path = %rules_path.display(), %e, "cannot load enhancement rules");
            std::process::exit(1);
        }
    };

    info!(
        port,
        inference = %settings.inference_url,
        servers = servers.servers.len(),
        "starting mcp-relay"
    );

    let inference = Arc::new(InferenceClient::new(&settings.inference_url));
    if inference.available().await {
        info!("inference service reachable");
    } else {
        warn!(
            url = %settings.inference_url,
            "inference service not reachable; enhancement will pass prompts through"
        );
    }

    let cache = Arc::new(
        PromptCache::connect(
            PromptCacheConfig {
                capacity: settings.cache_capacity,
                similarity_threshold: settings.similarity_threshold,
                ..PromptCacheConfig::default()
            },
            Arc::clone(&inference),
            settings.vector_store_url.as_deref(),
        )
        .await,
    );
    let enhancer = Arc::new(EnhancementMiddleware::new(
        rules,
        cache,
        Arc::clone(&inference),
    ));

    let registry = match UpstreamRegistry::new(&servers, BreakerConfig::default()) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!(%e, "cannot build upstream registry");
            std::process::exit(1);
        }
    };
    registry.initialize().await;

    let sessions = Arc::new(SessionManager::new());
    let state = AppState {
        registry: Arc::clone(&registry),
        enhancer,
        inference,
        sessions: Arc::clone(&sessions),
        request_log: Arc::new(RequestLog::default()),
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());
    tokio::spawn(
        Arc::clone(&sessions).run_reaper(REAPER_INTERVAL, shutdown.clone()),
    );

    let addr = format!("{}:{}", args.bind, port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, %e, "cannot bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "listening");

    let app = relay_proxy::router(state);
    let serve_shutdown = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
    {
        error!(%e, "server error");
    }

    // Drain: terminal event to open streams, then stop the adapters.
    sessions.close_all().await;
    registry.shutdown().await;
    info!("mcp-relay shutdown complete");
}

/// Cancel the token on SIGINT or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("sigterm handler installs");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c");
        }
        shutdown.cancel();
    });
}
