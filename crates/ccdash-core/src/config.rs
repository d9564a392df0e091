//! Agent configuration
//!
//! Loaded from a YAML file (default `~/.ccdash/agent.yaml`). A missing file is
//! not an error: every field has a default so the agent can start bare.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_PORT: u16 = 9100;
const DEFAULT_HISTORY_LIMIT: u32 = 50_000;
const DEFAULT_DUMP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address. Empty means "auto": Tailscale IP if one can be found,
    /// otherwise loopback.
    pub bind: String,
    pub port: u16,
    /// Shared auth token. Empty disables authentication.
    pub token: String,
    /// Working directories offered to dashboards for new sessions.
    pub workdirs: Vec<String>,
    /// Directory for scrollback snapshots. Empty means `~/.ccdash/scrollback`.
    pub scrollback_dir: String,
    pub scrollback_dump_interval_secs: u64,
    /// tmux history-limit applied to sessions the agent creates.
    pub history_limit: u32,
    /// Command typed into a freshly created session.
    pub session_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: String::new(),
            port: DEFAULT_PORT,
            token: String::new(),
            workdirs: Vec::new(),
            scrollback_dir: String::new(),
            scrollback_dump_interval_secs: DEFAULT_DUMP_INTERVAL_SECS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            session_command: "claude".to_string(),
        }
    }
}

impl Config {
    /// Load from `path`. Missing file yields the defaults; a file that exists
    /// but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading config {}", path.display())),
        };

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;

        if cfg.port == 0 {
            cfg.port = DEFAULT_PORT;
        }
        if cfg.history_limit == 0 {
            cfg.history_limit = DEFAULT_HISTORY_LIMIT;
        }
        if cfg.scrollback_dump_interval_secs == 0 {
            cfg.scrollback_dump_interval_secs = DEFAULT_DUMP_INTERVAL_SECS;
        }
        if cfg.session_command.is_empty() {
            cfg.session_command = "claude".to_string();
        }

        Ok(cfg)
    }

    pub fn dump_interval(&self) -> Duration {
        Duration::from_secs(self.scrollback_dump_interval_secs)
    }

    pub fn scrollback_dir(&self) -> PathBuf {
        if self.scrollback_dir.is_empty() {
            return default_home().join("scrollback");
        }
        expand_tilde(&self.scrollback_dir)
    }

    /// Configured workdirs with `~` expanded, for `machine_info`.
    pub fn expanded_workdirs(&self) -> Vec<String> {
        self.workdirs
            .iter()
            .map(|d| expand_tilde(d).to_string_lossy().into_owned())
            .collect()
    }
}

/// `~/.ccdash`
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ccdash")
}

pub fn default_config_path() -> PathBuf {
    default_home().join("agent.yaml")
}

/// Expand a leading `~` to the home directory. Subprocesses get no shell, so
/// this is the only expansion tilde paths ever see.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return home;
        }
        return home.join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/agent.yaml")).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.history_limit, 50_000);
        assert_eq!(cfg.scrollback_dump_interval_secs, 30);
        assert_eq!(cfg.session_command, "claude");
        assert!(cfg.token.is_empty());
        assert!(cfg.workdirs.is_empty());
    }

    #[test]
    fn test_load_overrides() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "port: 9200\ntoken: secret\nworkdirs:\n  - /srv/projects\nhistory_limit: 1000\nscrollback_dump_interval_secs: 5"
        )
        .unwrap();

        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.port, 9200);
        assert_eq!(cfg.token, "secret");
        assert_eq!(cfg.workdirs, vec!["/srv/projects".to_string()]);
        assert_eq!(cfg.history_limit, 1000);
        assert_eq!(cfg.dump_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_values_fall_back() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port: 0\nhistory_limit: 0\nscrollback_dump_interval_secs: 0").unwrap();

        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.history_limit, 50_000);
        assert_eq!(cfg.scrollback_dump_interval_secs, 30);
    }

    #[test]
    fn test_bad_yaml_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "port: [not a number").unwrap();
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn test_expand_tilde() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~"), home);
        assert_eq!(expand_tilde("~/work"), home.join("work"));
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("relative"), PathBuf::from("relative"));
    }

    #[test]
    fn test_expanded_workdirs() {
        let cfg = Config {
            workdirs: vec!["~/code".to_string(), "/opt/src".to_string()],
            ..Config::default()
        };
        let dirs = cfg.expanded_workdirs();
        assert_eq!(dirs.len(), 2);
        assert!(!dirs[0].starts_with('~'));
        assert_eq!(dirs[1], "/opt/src");
    }
}
