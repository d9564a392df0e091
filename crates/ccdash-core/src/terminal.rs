//! Interactive attachment to a tmux session via a PTY.
//!
//! Each subscriber owns at most one `TerminalSession`: a `tmux attach-session`
//! child running under a pseudo-terminal at the subscriber's geometry. tmux
//! arbitrates concurrent viewers of the same session; the agent only bridges
//! bytes.

use std::io::{Read, Write};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

const DEFAULT_COLS: u16 = 200;
const DEFAULT_ROWS: u16 = 50;

/// tmux prefix key (Ctrl-B), sent with `d` to detach cleanly.
const TMUX_PREFIX: u8 = 0x02;

#[derive(Default)]
struct Inner {
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    session_id: String,
    closed: bool,
}

pub struct TerminalSession {
    inner: Mutex<Inner>,
}

impl TerminalSession {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Spawn the tmux client under a fresh PTY. Zero geometry falls back to
    /// the create-time defaults.
    pub fn attach(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        let mut inner = self.lock();

        if inner.master.is_some() {
            return Err(anyhow!("already attached to {}", inner.session_id));
        }

        let cols = if cols == 0 { DEFAULT_COLS } else { cols };
        let rows = if rows == 0 { DEFAULT_ROWS } else { rows };

        let pty = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("opening pty")?;

        let mut cmd = CommandBuilder::new("tmux");
        cmd.args(["attach-session", "-t", session_id]);
        // CommandBuilder starts with an empty environment; the tmux client
        // needs the parent's (TMPDIR, PATH, the works).
        for (key, value) in std::env::vars() {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pty.slave.spawn_command(cmd).context("spawning tmux attach")?;
        drop(pty.slave);

        let writer = pty.master.take_writer().context("taking pty writer")?;

        inner.master = Some(pty.master);
        inner.writer = Some(writer);
        inner.child = Some(child);
        inner.session_id = session_id.to_string();
        inner.closed = false;
        Ok(())
    }

    /// Clone a reader handle for the output pump.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>> {
        let inner = self.lock();
        inner
            .master
            .as_ref()
            .ok_or_else(|| anyhow!("not attached"))?
            .try_clone_reader()
            .context("cloning pty reader")
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.lock();
        let writer = inner.writer.as_mut().ok_or_else(|| anyhow!("not attached"))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let inner = self.lock();
        inner
            .master
            .as_ref()
            .ok_or_else(|| anyhow!("not attached"))?
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("resizing pty")
    }

    /// Detach politely: send the tmux detach key sequence, then tear down.
    /// Idempotent.
    pub fn detach(&self) {
        let mut inner = self.lock();
        if inner.master.is_none() || inner.closed {
            return;
        }
        inner.closed = true;

        if let Some(writer) = inner.writer.as_mut() {
            let _ = writer.write_all(&[TMUX_PREFIX, b'd']);
            let _ = writer.flush();
        }

        Self::teardown(&mut inner);
        inner.session_id.clear();
    }

    /// Tear down without the detach courtesy. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.master.is_none() || inner.closed {
            return;
        }
        inner.closed = true;
        Self::teardown(&mut inner);
    }

    pub fn is_attached(&self) -> bool {
        let inner = self.lock();
        inner.master.is_some() && !inner.closed
    }

    fn teardown(inner: &mut Inner) {
        // Dropping the master closes the PTY; the reader thread sees EOF.
        inner.writer = None;
        inner.master = None;
        if let Some(mut child) = inner.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TerminalSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unattached_operations_fail() {
        let terminal = TerminalSession::new();
        assert!(!terminal.is_attached());
        assert!(terminal.write(b"x").is_err());
        assert!(terminal.resize(80, 24).is_err());
        assert!(terminal.reader().is_err());
    }

    #[test]
    fn test_close_and_detach_idempotent_when_unattached() {
        let terminal = TerminalSession::new();
        terminal.close();
        terminal.close();
        terminal.detach();
        assert!(!terminal.is_attached());
    }
}
