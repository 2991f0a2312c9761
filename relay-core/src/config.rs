//! Configuration: upstream server registry, enhancement rules, settings.
//!
//! Two JSON files drive the relay: `mcp-servers.json` (which upstreams
//! exist and how to reach them) and `enhancement-rules.json` (per-client
//! prompt enhancement). Both are loaded once at startup and validated
//! eagerly; a malformed file is fatal. Hot reloading is deliberately not
//! supported.
//!
//! Process-level settings come from the environment. Unrecognized
//! variables are ignored; recognized ones that fail to parse abort
//! startup with a [`RelayError::Config`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Default per-call timeout for upstream adapters.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Transport an upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Newline-delimited JSON-RPC over a subprocess's standard streams.
    Stdio,
    /// JSON-RPC over HTTP POST.
    Http,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Stdio => write!(f, "stdio"),
            Transport::Http => write!(f, "http"),
        }
    }
}

/// One upstream server entry from `mcp-servers.json`.
///
/// Immutable for the lifetime of the process. The `transport` field
/// decides which payload fields are required: `command` for stdio,
/// `url` for http.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub transport: Transport,
    /// Command and arguments to spawn (stdio only).
    #[serde(default)]
    pub command: Vec<String>,
    /// Base URL of the upstream (http only).
    #[serde(default)]
    pub url: Option<String>,
    /// Optional health-check path appended to `url` (http only).
    #[serde(default)]
    pub health_endpoint: Option<String>,
    /// Extra environment variables for the subprocess (stdio only).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-call deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ServerConfig {
    /// The per-call deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check that the entry is internally consistent for its transport.
    fn validate(&self, name: &str) -> Result<(), RelayError> {
        match self.transport {
            Transport::Stdio if self.command.is_empty() => Err(RelayError::Config {
                details: format!("server '{name}': stdio transport requires a non-empty command"),
            }),
            Transport::Http if self.url.as_deref().unwrap_or("").is_empty() => {
                Err(RelayError::Config {
                    details: format!("server '{name}': http transport requires a url"),
                })
            }
            _ if self.timeout_ms == 0 => Err(RelayError::Config {
                details: format!("server '{name}': timeout_ms must be positive"),
            }),
            _ => Ok(()),
        }
    }
}

/// The parsed `mcp-servers.json` file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl ServersFile {
    /// Load and validate the server registry config.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the file cannot be read, is not
    /// valid JSON, or any entry fails transport validation.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RelayError::Config {
            details: format!("cannot read {}: {e}", path.display()),
        })?;
        let file: ServersFile = serde_json::from_str(&raw).map_err(|e| RelayError::Config {
            details: format!("cannot parse {}: {e}", path.display()),
        })?;
        for (name, server) in &file.servers {
            server.validate(name)?;
        }
        Ok(file)
    }
}

/// Enhancement behavior for one calling client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancementRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
}

fn default_true() -> bool {
    true
}

/// The parsed `enhancement-rules.json` file.
///
/// `fallback_chain` is an ordered list of model names tried after the
/// rule's preferred model fails. A `null` entry means "give up and return
/// the original prompt", and iteration stops there.
#[derive(Debug, Clone, Deserialize)]
pub struct EnhancementRules {
    pub default: EnhancementRule,
    #[serde(default)]
    pub clients: HashMap<String, EnhancementRule>,
    #[serde(default)]
    pub fallback_chain: Vec<Option<String>>,
}

impl EnhancementRules {
    /// Load and validate the enhancement rules config.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] on read or parse failure, or when a
    /// rule is enabled but names no model.
    pub fn load(path: &Path) -> Result<Self, RelayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| RelayError::Config {
            details: format!("cannot read {}: {e}", path.display()),
        })?;
        let rules: EnhancementRules =
            serde_json::from_str(&raw).map_err(|e| RelayError::Config {
                details: format!("cannot parse {}: {e}", path.display()),
            })?;
        rules.validate()?;
        Ok(rules)
    }

    fn validate(&self) -> Result<(), RelayError> {
        if self.default.enabled && self.default.model.is_empty() {
            return Err(RelayError::Config {
                details: "default enhancement rule is enabled but names no model".to_string(),
            });
        }
        for (client, rule) in &self.clients {
            if rule.enabled && rule.model.is_empty() {
                return Err(RelayError::Config {
                    details: format!("client '{client}' rule is enabled but names no model"),
                });
            }
        }
        Ok(())
    }

    /// Look up the rule for a client, falling back to the default.
    pub fn rule_for(&self, client: Option<&str>) -> &EnhancementRule {
        client
            .and_then(|c| self.clients.get(c))
            .unwrap_or(&self.default)
    }
}

/// Process settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Base URL of the local inference service.
    pub inference_url: String,
    /// Base URL of the vector store; `None` disables the L2 cache tier.
    pub vector_store_url: Option<String>,
    /// Port the public HTTP surface binds.
    pub listen_port: u16,
    /// Log filter directive fed to the tracing subscriber.
    pub log_level: String,
    /// Path to `mcp-servers.json`.
    pub servers_config: PathBuf,
    /// Path to `enhancement-rules.json`.
    pub rules_config: PathBuf,
    /// Maximum L1 cache entries.
    pub cache_capacity: usize,
    /// Cosine score threshold for L2 hits.
    pub similarity_threshold: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            inference_url: "http://localhost:11434".to_string(),
            vector_store_url: None,
            listen_port: 9090,
            log_level: "info".to_string(),
            servers_config: PathBuf::from("configs/mcp-servers.json"),
            rules_config: PathBuf::from("configs/enhancement-rules.json"),
            cache_capacity: 1000,
            similarity_threshold: 0.85,
        }
    }
}

impl Settings {
    /// Resolve settings from the environment.
    ///
    /// Recognized variables: `INFERENCE_URL`, `VECTOR_STORE_URL`,
    /// `LISTEN_PORT`, `LOG_LEVEL`, `MCP_SERVERS_CONFIG`,
    /// `ENHANCEMENT_RULES_CONFIG`, `CACHE_MAX_SIZE`,
    /// `CACHE_SIMILARITY_THRESHOLD`. Anything else is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when a recognized variable is set
    /// but does not parse.
    pub fn from_env() -> Result<Self, RelayError> {
        let mut settings = Settings::default();

        if let Ok(url) = std::env::var("INFERENCE_URL") {
            settings.inference_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("VECTOR_STORE_URL") {
            if !url.is_empty() {
                settings.vector_store_url = Some(url.trim_end_matches('/').to_string());
            }
        }
        if let Ok(port) = std::env::var("LISTEN_PORT") {
            settings.listen_port = port.parse().map_err(|_| RelayError::Config {
                details: format!("LISTEN_PORT must be a port number, got '{port}'"),
            })?;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            settings.log_level = level;
        }
        if let Ok(path) = std::env::var("MCP_SERVERS_CONFIG") {
            settings.servers_config = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("ENHANCEMENT_RULES_CONFIG") {
            settings.rules_config = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("CACHE_MAX_SIZE") {
            settings.cache_capacity = size.parse().map_err(|_| RelayError::Config {
                details: format!("CACHE_MAX_SIZE must be an integer, got '{size}'"),
            })?;
        }
        if let Ok(threshold) = std::env::var("CACHE_SIMILARITY_THRESHOLD") {
            settings.similarity_threshold = threshold.parse().map_err(|_| RelayError::Config {
                details: format!("CACHE_SIMILARITY_THRESHOLD must be a float, got '{threshold}'"),
            })?;
        }

        Ok(settings)
    }
}
