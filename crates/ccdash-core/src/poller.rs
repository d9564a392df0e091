//! Lifecycle poller.
//!
//! Periodically reconciles the in-memory session registry against tmux:
//! evicts vanished sessions, classifies the rest from fresh pane captures,
//! and publishes a sorted snapshot to the change listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::tmux::state::{detect_state, SessionState};
use crate::tmux::{MuxSession, TmuxDriver};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// `last_line` preview cap, in bytes.
const LAST_LINE_MAX_BYTES: usize = 120;

/// Registry entry for one tracked session. Identity fields (`id`, `name`,
/// `workdir`, `created`) are set when the session is first observed and never
/// rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub state: SessionState,
    pub workdir: String,
    pub created: i64,
    pub state_changed_at: i64,
    pub last_line: String,
}

type OnChange = Box<dyn Fn(Vec<SessionInfo>) + Send + Sync>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, SessionInfo>,
    /// Side table: workdir recorded when the agent itself created the session.
    /// tmux does not report working directories, so sessions created elsewhere
    /// keep an empty workdir.
    workdirs: HashMap<String, String>,
}

/// One session's worth of poll input: the raw listing plus the pane capture
/// (`None` when the capture failed and the session is presumed dead).
struct Observation {
    session: MuxSession,
    pane: Option<String>,
}

pub struct Poller {
    tmux: Arc<TmuxDriver>,
    registry: RwLock<Registry>,
    on_change: OnceCell<OnChange>,
    shutdown: StdMutex<Option<broadcast::Sender<()>>>,
}

impl Poller {
    pub fn new(tmux: Arc<TmuxDriver>) -> Self {
        Self {
            tmux,
            registry: RwLock::new(Registry::default()),
            on_change: OnceCell::new(),
            shutdown: StdMutex::new(None),
        }
    }

    /// Wire the change listener. One slot, set once at startup.
    pub fn set_on_change(&self, listener: impl Fn(Vec<SessionInfo>) + Send + Sync + 'static) {
        let _ = self.on_change.set(Box::new(listener));
    }

    /// Record the workdir for a session the agent just created, ahead of the
    /// first reconciliation that observes it.
    pub async fn track_session(&self, name: &str, workdir: &str) {
        let mut registry = self.registry.write().await;
        registry.workdirs.insert(name.to_string(), workdir.to_string());
    }

    /// Sorted deep-copy snapshot of the registry.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let registry = self.registry.read().await;
        snapshot(&registry)
    }

    /// Drop every registry entry whose state is `dead`.
    pub async fn clear_dead(&self) {
        let mut registry = self.registry.write().await;
        let dead: Vec<String> = registry
            .sessions
            .iter()
            .filter(|(_, s)| s.state == SessionState::Dead)
            .map(|(name, _)| name.clone())
            .collect();
        for name in dead {
            registry.sessions.remove(&name);
            registry.workdirs.remove(&name);
        }
    }

    /// Start the reconciliation loop.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => poller.poll().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }

    /// One reconciliation step. Listing errors leave the registry untouched.
    async fn poll(&self) {
        let raw = match self.tmux.list_sessions().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "poll: list sessions failed");
                return;
            }
        };

        // Capture panes before taking the write lock; readers only ever see
        // fully reconciled states.
        let mut observations = Vec::with_capacity(raw.len());
        for session in raw {
            let pane = self.tmux.capture_visible(&session.name).await.ok();
            observations.push(Observation { session, pane });
        }

        let now = Utc::now().timestamp_millis();

        let sessions = {
            let mut registry = self.registry.write().await;
            reconcile(&mut registry, observations, now);
            snapshot(&registry)
        };

        if let Some(listener) = self.on_change.get() {
            listener(sessions);
        }
    }
}

fn reconcile(registry: &mut Registry, observations: Vec<Observation>, now: i64) {
    let current: std::collections::HashSet<&str> = observations
        .iter()
        .map(|o| o.session.name.as_str())
        .collect();

    // Evict sessions tmux no longer lists.
    let gone: Vec<String> = registry
        .sessions
        .keys()
        .filter(|name| !current.contains(name.as_str()))
        .cloned()
        .collect();
    for name in gone {
        registry.sessions.remove(&name);
        registry.workdirs.remove(&name);
    }

    for obs in observations {
        let (state, last_line) = match &obs.pane {
            Some(pane) => (detect_state(pane), last_line_preview(pane)),
            None => (SessionState::Dead, String::new()),
        };

        match registry.sessions.get_mut(&obs.session.name) {
            Some(existing) => {
                if existing.state != state {
                    existing.state = state;
                    existing.state_changed_at = now;
                }
                existing.last_line = last_line;
            }
            None => {
                let workdir = registry
                    .workdirs
                    .get(&obs.session.name)
                    .cloned()
                    .unwrap_or_default();
                registry.sessions.insert(
                    obs.session.name.clone(),
                    SessionInfo {
                        id: obs.session.name.clone(),
                        name: obs.session.name,
                        state,
                        workdir,
                        created: obs.session.created,
                        state_changed_at: now,
                        last_line,
                    },
                );
            }
        }
    }
}

fn snapshot(registry: &Registry) -> Vec<SessionInfo> {
    let mut sessions: Vec<SessionInfo> = registry.sessions.values().cloned().collect();
    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    sessions
}

/// Last trimmed non-empty line of a capture, capped at 120 bytes.
fn last_line_preview(pane: &str) -> String {
    pane.split('\n')
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| truncate_bytes(line, LAST_LINE_MAX_BYTES).to_string())
        .unwrap_or_default()
}

/// Truncate to at most `max` bytes without splitting a character.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
