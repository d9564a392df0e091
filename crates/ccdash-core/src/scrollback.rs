//! Scrollback snapshots.
//!
//! Live captures are richer but die with the session; the store persists each
//! session's scrollback to `<dir>/<id>.log` on a timer so dashboards can read
//! history post-mortem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::tmux::TmuxDriver;

pub struct ScrollbackStore {
    dir: PathBuf,
    interval: Duration,
    tmux: Arc<TmuxDriver>,
    /// Serializes file writes. One coarse lock, not per-file.
    write_lock: Mutex<()>,
    shutdown: StdMutex<Option<broadcast::Sender<()>>>,
}

impl ScrollbackStore {
    pub fn new(dir: PathBuf, interval: Duration, tmux: Arc<TmuxDriver>) -> Self {
        Self {
            dir,
            interval,
            tmux,
            write_lock: Mutex::new(()),
            shutdown: StdMutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the snapshot directory and start the dump worker.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating scrollback dir {}", self.dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("restricting scrollback dir {}", self.dir.display()))?;
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);

        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.dump_all().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok(())
    }

    /// Cancel the worker and take one final dump so nothing written since the
    /// last tick is lost.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
        self.dump_all().await;
        info!("scrollback store stopped");
    }

    /// Snapshot every listed session. Capture failures are swallowed; the
    /// session will be gone next tick anyway.
    pub async fn dump_all(&self) {
        let sessions = match self.tmux.list_sessions().await {
            Ok(sessions) => sessions,
            Err(_) => return,
        };
        for session in sessions {
            self.dump_session(&session.name).await;
        }
    }

    async fn dump_session(&self, session_id: &str) {
        let scrollback = match self.tmux.capture_scrollback(session_id).await {
            Ok(text) => text,
            Err(_) => return,
        };

        let _guard = self.write_lock.lock().await;
        let path = self.log_path(session_id);
        if let Err(e) = tokio::fs::write(&path, scrollback.as_bytes()).await {
            warn!(session = session_id, error = %e, "scrollback dump failed");
            return;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await;
        }
    }

    /// Scrollback for a session: fresh from tmux while it lives, from the
    /// persisted snapshot once it is gone.
    pub async fn get(&self, session_id: &str) -> Result<String> {
        if self.tmux.has_session(session_id).await {
            return self.tmux.capture_scrollback(session_id).await;
        }

        let path = self.log_path(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                bail!("no scrollback for session: {}", session_id)
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Delete a session's snapshot. Missing is not an error.
    pub async fn remove(&self, session_id: &str) {
        let path = self.log_path(session_id);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(session = session_id, error = %e, "scrollback remove failed");
            }
        }
    }

    /// Delete snapshots whose session id is not in `live`. Used by dead-session
    /// cleanup to catch sessions that were evicted before cleanup ran.
    pub async fn retain(&self, live: &HashSet<String>) {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(session_id) = name.to_string_lossy().strip_suffix(".log").map(String::from)
            else {
                continue;
            };
            if !live.contains(&session_id) {
                self.remove(&session_id).await;
            }
        }
    }

    fn log_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.log"))
    }
}
