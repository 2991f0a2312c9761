//! Stdio transport adapter.
//!
//! Wraps an MCP server subprocess speaking newline-delimited JSON-RPC
//! over stdin/stdout. The adapter owns the process handle exclusively
//! and serializes calls through a single fair mutex, so requests are
//! dispatched strictly in arrival order, since the protocol is one request
//! line, one response line.
//!
//! # Lifecycle
//!
//! The process moves through `Unstarted → Running → Crashed`. A crash
//! (detected on the next call) or a read timeout triggers a restart:
//! terminate the old process, increment the restart counter, respawn.
//! The counter is capped at `max_restarts`; past the cap every call
//! fails with [`RelayError::AdapterExhausted`] until [`StdioAdapter::reset`]
//! re-arms the adapter. Restarts are explicit, never a silent retry loop,
//! and the call that observed the failure reports a transport error.
//!
//! Shutdown closes stdin first so cooperating children can exit on EOF,
//! waits up to five seconds, then hard-kills.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::Adapter;
use crate::config::{ServerConfig, Transport};
use crate::error::RelayError;
use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse};

/// Default restart budget per adapter.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Grace period between closing stdin and hard-killing the child.
const KILL_GRACE: Duration = Duration::from_secs(5);

const LATENCY_UNSET: u64 = u64::MAX;

struct Running {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

enum ProcState {
    Unstarted,
    Running(Running),
    Crashed,
}

/// Adapter for an upstream spawned as a subprocess.
pub struct StdioAdapter {
    name: String,
    command: Vec<String>,
    env: HashMap<String, String>,
    timeout: Duration,
    max_restarts: u32,
    /// Process state and call serialization in one lock. Tokio's mutex is
    /// fair, so queued callers proceed in arrival order.
    proc: Mutex<ProcState>,
    restart_count: AtomicU32,
    last_latency: AtomicU64,
}

impl StdioAdapter {
    pub fn new(name: impl Into<String>, config: &ServerConfig) -> Self {
        Self {
            name: name.into(),
            command: config.command.clone(),
            env: config.env.clone(),
            timeout: config.timeout(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            proc: Mutex::new(ProcState::Unstarted),
            restart_count: AtomicU32::new(0),
            last_latency: AtomicU64::new(LATENCY_UNSET),
        }
    }

    /// Override the restart budget (primarily for tests).
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Restarts performed since the initial start (or the last reset).
    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::Relaxed)
    }

    /// Spawn the subprocess eagerly. Called by the registry at startup;
    /// a call on an unstarted adapter spawns lazily as well.
    pub async fn start(&self) -> Result<(), RelayError> {
        let mut guard = self.proc.lock().await;
        if matches!(*guard, ProcState::Unstarted) {
            *guard = ProcState::Running(self.spawn()?);
        }
        Ok(())
    }

    fn spawn(&self) -> Result<Running, RelayError> {
        info!(server = %self.name, command = ?self.command, "starting stdio server");

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .envs(&self.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::UpstreamUnavailable {
                server: self.name.clone(),
                cause: format!("spawn failed: {e}"),
            })?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = BufReader::new(child.stdout.take().expect("stdout was piped"));

        // Drain stderr into the log so the child never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "{line}");
                }
            });
        }

        info!(server = %self.name, pid = child.id(), "stdio server started");
        Ok(Running {
            child,
            stdin,
            stdout,
        })
    }

    /// Ensure a live process behind the lock, restarting if it has exited.
    async fn ensure_running(&self, guard: &mut ProcState) -> Result<(), RelayError> {
        let crashed = match guard {
            ProcState::Unstarted => {
                *guard = ProcState::Running(self.spawn()?);
                return Ok(());
            }
            ProcState::Crashed => true,
            ProcState::Running(running) => match running.child.try_wait() {
                Ok(None) => false,
                Ok(Some(status)) => {
                    warn!(server = %self.name, %status, "stdio server exited");
                    true
                }
                Err(e) => {
                    warn!(server = %self.name, error = %e, "cannot poll stdio server");
                    true
                }
            },
        };

        if crashed {
            self.restart(guard).await?;
        }
        Ok(())
    }

    /// Terminate the current process (if any) and respawn under the
    /// restart budget.
    async fn restart(&self, guard: &mut ProcState) -> Result<(), RelayError> {
        if let ProcState::Running(running) = std::mem::replace(guard, ProcState::Crashed) {
            stop_process(&self.name, running).await;
        }

        let used = self.restart_count.load(Ordering::Relaxed);
        if used >= self.max_restarts {
            return Err(RelayError::AdapterExhausted {
                server: self.name.clone(),
                max_restarts: self.max_restarts,
            });
        }
        self.restart_count.fetch_add(1, Ordering::Relaxed);
        warn!(
            server = %self.name,
            attempt = used + 1,
            max_restarts = self.max_restarts,
            "restarting stdio server"
        );

        *guard = ProcState::Running(self.spawn()?);
        Ok(())
    }
}

#[async_trait]
impl Adapter for StdioAdapter {
    async fn call(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, RelayError> {
        let mut guard = self.proc.lock().await;
        self.ensure_running(&mut guard).await?;

        let running = match &mut *guard {
            ProcState::Running(running) => running,
            _ => unreachable!("ensure_running leaves a live process or errors"),
        };

        let start = Instant::now();
        let mut line = serde_json::to_string(request).map_err(|e| RelayError::Internal {
            details: format!("cannot serialize request: {e}"),
        })?;
        line.push('\n');

        if let Err(e) = running.stdin.write_all(line.as_bytes()).await {
            *guard = ProcState::Crashed;
            return Err(RelayError::UpstreamUnavailable {
                server: self.name.clone(),
                cause: format!("stdin write failed: {e}"),
            });
        }
        if let Err(e) = running.stdin.flush().await {
            *guard = ProcState::Crashed;
            return Err(RelayError::UpstreamUnavailable {
                server: self.name.clone(),
                cause: format!("stdin flush failed: {e}"),
            });
        }

        let mut response_line = String::new();
        match tokio::time::timeout(self.timeout, running.stdout.read_line(&mut response_line)).await
        {
            Err(_) => {
                warn!(server = %self.name, timeout_ms = self.timeout.as_millis() as u64,
                      "stdio server timed out; restarting");
                // The hung process cannot be trusted to pair responses
                // with requests anymore. Restart (budget permitting) and
                // fail this call.
                if let Err(restart_err) = self.restart(&mut guard).await {
                    debug!(server = %self.name, error = %restart_err, "restart after timeout failed");
                }
                Err(RelayError::UpstreamTimeout {
                    server: self.name.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                *guard = ProcState::Crashed;
                Err(RelayError::UpstreamUnavailable {
                    server: self.name.clone(),
                    cause: format!("stdout read failed: {e}"),
                })
            }
            Ok(Ok(0)) => {
                *guard = ProcState::Crashed;
                Err(RelayError::UpstreamUnavailable {
                    server: self.name.clone(),
                    cause: "server closed stdout".to_string(),
                })
            }
            Ok(Ok(_)) => {
                let response: JsonRpcResponse = serde_json::from_str(response_line.trim())
                    .map_err(|e| RelayError::UpstreamUnavailable {
                        server: self.name.clone(),
                        cause: format!("invalid response line: {e}"),
                    })?;
                self.last_latency
                    .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
                Ok(response)
            }
        }
    }

    async fn is_healthy(&self) -> bool {
        let mut guard = self.proc.lock().await;
        match &mut *guard {
            ProcState::Running(running) => matches!(running.child.try_wait(), Ok(None)),
            _ => false,
        }
    }

    async fn stop(&self) {
        let mut guard = self.proc.lock().await;
        if let ProcState::Running(running) = std::mem::replace(&mut *guard, ProcState::Unstarted) {
            stop_process(&self.name, running).await;
        }
    }

    fn transport(&self) -> Transport {
        Transport::Stdio
    }

    fn last_latency_ms(&self) -> Option<u64> {
        match self.last_latency.load(Ordering::Relaxed) {
            LATENCY_UNSET => None,
            ms => Some(ms),
        }
    }

    fn reset(&self) {
        self.restart_count.store(0, Ordering::Relaxed);
    }
}

/// Close stdin, give the child `KILL_GRACE` to exit, then hard-kill.
async fn stop_process(name: &str, mut running: Running) {
    info!(server = %name, "stopping stdio server");
    drop(running.stdin);

    match tokio::time::timeout(KILL_GRACE, running.child.wait()).await {
        Ok(Ok(status)) => debug!(server = %name, %status, "stdio server exited"),
        Ok(Err(e)) => warn!(server = %name, error = %e, "wait on stdio server failed"),
        Err(_) => {
            warn!(server = %name, "stdio server ignored shutdown; killing");
            let _ = running.child.start_kill();
            let _ = running.child.wait().await;
        }
    }
}
