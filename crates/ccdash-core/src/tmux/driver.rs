//! Thin adapter over the tmux CLI.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::process::Command;
use tracing::warn;

use super::MuxSession;

/// Name prefix identifying sessions the agent manages. Everything else in the
/// tmux server is invisible to dashboards.
pub const SESSION_PREFIX: &str = "cc-";

/// Initial geometry for new sessions. Dashboards resize on attach.
const CREATE_COLS: &str = "200";
const CREATE_ROWS: &str = "50";

/// Scrollback window for full-history captures.
const SCROLLBACK_LINES: &str = "-50000";

/// Session options applied after create. These make tmux invisible and keep it
/// out of the way of the application running inside; older tmux versions may
/// reject some of them, which is fine.
const SESSION_OPTIONS: &[(&str, &str)] = &[
    ("mouse", "on"),
    ("status", "off"),
    ("escape-time", "0"),
    ("focus-events", "on"),
    ("default-terminal", "xterm-256color"),
    ("set-clipboard", "on"),
    ("exit-unattached", "off"),
    ("destroy-unattached", "off"),
    ("allow-passthrough", "on"),
    ("extended-keys", "on"),
    ("visual-activity", "off"),
    ("visual-bell", "off"),
    ("visual-silence", "off"),
];

const LIST_FORMAT: &str = "#{session_id}:#{session_name}:#{session_created}:#{session_windows}:#{session_attached}:#{session_width}:#{session_height}";

/// Client for driving tmux via its CLI.
pub struct TmuxDriver {
    tmux_path: String,
}

impl TmuxDriver {
    pub fn new() -> Self {
        Self {
            tmux_path: "tmux".to_string(),
        }
    }

    /// Probe for the tmux binary.
    pub async fn available(&self) -> bool {
        Command::new(&self.tmux_path)
            .arg("-V")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Create a detached session, apply the option set, and type `command`
    /// into it. Returns the minted session id.
    pub async fn create_session(
        &self,
        name: &str,
        workdir: &Path,
        history_limit: u32,
        command: &str,
    ) -> Result<String> {
        let session_id = format!(
            "{}{}-{}",
            SESSION_PREFIX,
            Utc::now().timestamp_millis(),
            sanitize_name(name)
        );

        let workdir_arg = workdir.to_string_lossy().into_owned();
        let output = Command::new(&self.tmux_path)
            .args([
                "new-session",
                "-d",
                "-s",
                &session_id,
                "-c",
                workdir_arg.as_str(),
                "-x",
                CREATE_COLS,
                "-y",
                CREATE_ROWS,
            ])
            .output()
            .await
            .context("spawning tmux new-session")?;
        if !output.status.success() {
            bail!("tmux new-session: {}", combined_output(&output));
        }

        let history = history_limit.to_string();
        let mut options: Vec<(&str, &str)> = vec![("history-limit", history.as_str())];
        options.extend_from_slice(SESSION_OPTIONS);
        for (key, value) in options {
            let result = Command::new(&self.tmux_path)
                .args(["set-option", "-t", &session_id, key, value])
                .output()
                .await;
            match result {
                Ok(out) if out.status.success() => {}
                Ok(out) => {
                    // Non-fatal: older tmux may not support all options
                    warn!(option = key, output = %combined_output(&out).trim(), "tmux set-option failed");
                }
                Err(e) => warn!(option = key, error = %e, "tmux set-option failed"),
            }
        }

        let output = Command::new(&self.tmux_path)
            .args(["send-keys", "-t", &session_id, command, "Enter"])
            .output()
            .await
            .context("spawning tmux send-keys")?;
        if !output.status.success() {
            bail!("tmux send-keys: {}", combined_output(&output));
        }

        Ok(session_id)
    }

    /// List agent-managed sessions. A tmux server that is not running is an
    /// empty fleet, not an error.
    pub async fn list_sessions(&self) -> Result<Vec<MuxSession>> {
        let output = Command::new(&self.tmux_path)
            .args(["list-sessions", "-F", LIST_FORMAT])
            .output()
            .await
            .context("spawning tmux list-sessions")?;

        if !output.status.success() {
            let combined = combined_output(&output);
            if is_no_server_output(&combined) {
                return Ok(Vec::new());
            }
            bail!("tmux list-sessions: {}", combined);
        }

        Ok(parse_session_list(&String::from_utf8_lossy(&output.stdout)))
    }

    pub async fn kill_session(&self, session_id: &str) -> Result<()> {
        let output = Command::new(&self.tmux_path)
            .args(["kill-session", "-t", session_id])
            .output()
            .await
            .context("spawning tmux kill-session")?;
        if !output.status.success() {
            bail!("tmux kill-session: {}", combined_output(&output));
        }
        Ok(())
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        Command::new(&self.tmux_path)
            .args(["has-session", "-t", session_id])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Capture the visible pane contents, with wrapped lines joined.
    pub async fn capture_visible(&self, session_id: &str) -> Result<String> {
        let output = Command::new(&self.tmux_path)
            .args(["capture-pane", "-t", session_id, "-p", "-J"])
            .output()
            .await
            .context("spawning tmux capture-pane")?;
        if !output.status.success() {
            bail!("tmux capture-pane: {}", combined_output(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Capture the pane including the full scrollback window.
    pub async fn capture_scrollback(&self, session_id: &str) -> Result<String> {
        let output = Command::new(&self.tmux_path)
            .args([
                "capture-pane",
                "-t",
                session_id,
                "-p",
                "-J",
                "-S",
                SCROLLBACK_LINES,
            ])
            .output()
            .await
            .context("spawning tmux capture-pane")?;
        if !output.status.success() {
            bail!("tmux capture-pane scrollback: {}", combined_output(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce a session name to `[A-Za-z0-9_-]`, non-empty, at most 32 chars.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if sanitized.is_empty() {
        sanitized = "session".to_string();
    }
    sanitized.truncate(32);
    sanitized
}

fn combined_output(output: &std::process::Output) -> String {
    let mut s = String::from_utf8_lossy(&output.stderr).into_owned();
    s.push_str(&String::from_utf8_lossy(&output.stdout));
    s
}

fn is_no_server_output(s: &str) -> bool {
    s.contains("no server running") || s.contains("no sessions") || s.contains("error connecting to")
}

fn parse_session_list(stdout: &str) -> Vec<MuxSession> {
    stdout.lines().filter_map(parse_session_line).collect()
}

fn parse_session_line(line: &str) -> Option<MuxSession> {
    let parts: Vec<&str> = line.splitn(7, ':').collect();
    if parts.len() < 7 {
        return None;
    }

    let name = parts[1];
    if !name.starts_with(SESSION_PREFIX) {
        return None;
    }

    Some(MuxSession {
        id: parts[0].to_string(),
        name: name.to_string(),
        created: parts[2].parse().unwrap_or(0),
        windows: parts[3].parse().unwrap_or(0),
        attached: parts[4] == "1",
        width: parts[5].parse().unwrap_or(0),
        height: parts[6].parse().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_keeps_safe_chars() {
        assert_eq!(sanitize_name("my-project_2"), "my-project_2");
        assert_eq!(sanitize_name("hello world!"), "helloworld");
        assert_eq!(sanitize_name("a/b\\c"), "abc");
    }

    #[test]
    fn test_sanitize_empty_becomes_session() {
        assert_eq!(sanitize_name(""), "session");
        assert_eq!(sanitize_name("!!!"), "session");
    }

    #[test]
    fn test_sanitize_truncates_to_32() {
        let long = "x".repeat(100);
        let s = sanitize_name(&long);
        assert_eq!(s.len(), 32);
    }

    #[test]
    fn test_sanitize_output_charset() {
        let s = sanitize_name("päne 名前 ok-1_");
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert!(!s.is_empty());
    }

    #[test]
    fn test_parse_session_line() {
        let s = parse_session_line("$3:cc-1712000000000-demo:1712000000:1:0:200:50").unwrap();
        assert_eq!(s.id, "$3");
        assert_eq!(s.name, "cc-1712000000000-demo");
        assert_eq!(s.created, 1712000000);
        assert_eq!(s.windows, 1);
        assert!(!s.attached);
        assert_eq!(s.width, 200);
        assert_eq!(s.height, 50);
    }

    #[test]
    fn test_parse_filters_foreign_sessions() {
        let out = "$0:unrelated-42:1712000000:1:1:80:24\n$1:cc-1712000000000-demo:1712000000:1:0:200:50\n";
        let sessions = parse_session_list(out);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "cc-1712000000000-demo");
    }

    #[test]
    fn test_parse_skips_short_lines() {
        assert!(parse_session_line("$0:cc-123:1712000000").is_none());
        assert!(parse_session_line("").is_none());
    }

    #[test]
    fn test_parse_attached_flag() {
        let s = parse_session_line("$0:cc-1-a:0:2:1:80:24").unwrap();
        assert!(s.attached);
        assert_eq!(s.windows, 2);
    }

    #[test]
    fn test_no_server_classification() {
        assert!(is_no_server_output("no server running on /tmp/tmux-1000/default"));
        assert!(is_no_server_output("error connecting to /tmp/tmux-1000/default"));
        assert!(is_no_server_output("no sessions"));
        assert!(!is_no_server_output("unknown option: -Z"));
    }
}
