//! SSE session layer.
//!
//! Translates long-lived client streams into request/response dispatch:
//! a client opens `GET /sse` and receives an `endpoint` event naming the
//! messages URL for its session; each `POST /sse/messages?session={id}`
//! is routed through the dispatcher and its JSON-RPC response is emitted
//! as a `message` event on the open stream.
//!
//! Each JSON-RPC call is atomic in request and response; the stream is
//! only the delivery channel. Messages are accepted in arrival order;
//! responses are emitted in the order their upstream calls complete.
//!
//! Sessions close on explicit disconnect (`DELETE /sse/{id}`), when the
//! client drops the stream, on idle timeout (a reaper task sweeps the
//! table), and at process shutdown (a terminal event, then the stream
//! ends). The table is capacity-bounded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::response::sse::Event;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Default cap on concurrently open sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Default idle timeout before a session is reaped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Queue depth per session for pending outbound events.
const EVENT_QUEUE_DEPTH: usize = 64;

/// One open SSE session.
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    tx: mpsc::Sender<Event>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
}

impl Session {
    fn new(id: Uuid, tx: mpsc::Sender<Event>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            tx,
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        }
    }

    /// Record activity so the idle reaper leaves the session alone.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("session lock poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("session lock poisoned")
            .elapsed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Queue an event for the stream. Fails when the client has gone
    /// away or the session is closed.
    pub async fn send(&self, event: Event) -> Result<(), ()> {
        if self.is_closed() {
            return Err(());
        }
        self.tx.send(event).await.map_err(|_| ())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

/// The sessions table.
pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Session>>,
    max_sessions: usize,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_SESSIONS, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_limits(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            idle_timeout,
        }
    }

    /// Allocate a session and its event receiver.
    ///
    /// Returns `None` when the table is at capacity.
    pub fn open(&self) -> Option<(Arc<Session>, mpsc::Receiver<Event>)> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let id = Uuid::new_v4();
        let session = Arc::new(Session::new(id, tx));
        self.sessions.insert(id, Arc::clone(&session));
        info!(session = %id, "sse session opened");
        Some((session, rx))
    }

    /// Look up an open session.
    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|session| !session.is_closed())
    }

    /// Close and remove a session. Returns whether it existed.
    pub fn close(&self, id: &Uuid) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close();
                info!(session = %id, "sse session closed");
                true
            }
            None => false,
        }
    }

    /// Sweep sessions idle past the timeout.
    pub fn reap_idle(&self) -> usize {
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            debug!(session = %id, "reaping idle sse session");
            self.close(id);
        }
        expired.len()
    }

    /// Emit a terminal event on every open session and drop them all.
    pub async fn close_all(&self) {
        let all: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in all {
            let _ = session
                .send(Event::default().event("shutdown").data("server shutting down"))
                .await;
            self.close(&session.id);
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Run the idle reaper until cancelled. Sweeps every `interval`.
    pub async fn run_reaper(
        self: Arc<Self>,
        interval: Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = self.reap_idle();
                    if reaped > 0 {
                        debug!(reaped, "idle sse sessions reaped");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
