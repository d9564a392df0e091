//! tmux integration: CLI driver and screen-based state classification.
//!
//! tmux is the source of truth for session lifecycle; the agent never
//! reimplements its protocol, it shells out. Only sessions whose name carries
//! the agent prefix are visible through this module.

mod driver;
pub mod state;

pub use driver::{sanitize_name, TmuxDriver, SESSION_PREFIX};

/// One line of `tmux list-sessions` output. Produced fresh on every poll and
/// never stored.
#[derive(Debug, Clone)]
pub struct MuxSession {
    pub id: String,
    pub name: String,
    /// Creation time as reported by tmux (`#{session_created}`), passed
    /// through unmodified.
    pub created: i64,
    pub windows: u32,
    pub attached: bool,
    pub width: u32,
    pub height: u32,
}
