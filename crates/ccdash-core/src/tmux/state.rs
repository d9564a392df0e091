//! Session state classification from raw pane captures.
//!
//! Pure text heuristics over the last few visible lines. The tail window is
//! collected bottom-up, so `combined` starts with the most recent line and
//! anchored patterns bind to it. Detection order matters: attention beats
//! working beats starting beats idle.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How many trailing non-empty lines feed the classifier.
const TAIL_WINDOW: usize = 8;

/// Captures shorter than this (total lines) may still be a startup screen.
const STARTUP_SCREEN_MAX_LINES: usize = 20;

/// Braille spinner glyphs used by CLI progress indicators.
const SPINNER_GLYPHS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Working,
    NeedsAttention,
    Idle,
    Dead,
}

static NEEDS_ATTENTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)do you want to proceed",
        r"(?i)\(y/?n\)",
        r"(?i)^.{0,5}(allow|deny)\b",
        r"(?i)accept.*reject|reject.*accept",
        r"(?i)press.*to continue",
        r"(?i)would you like",
        r"(?i)^error:|^ERROR",
        r"(?i)rate.?limit|exceeded",
        r"(?i)permission.*denied",
        r"(?i)do you want to",
    ])
});

static WORKING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let patterns = [
        format!("[{SPINNER_GLYPHS}]"),
        format!(r"(?i)^\s*[{SPINNER_GLYPHS}]?\s*(thinking|reasoning)"),
        format!(r"(?i)^\s*[{SPINNER_GLYPHS}]\s*(reading|writing|searching|running|executing)"),
        r"(?i)^(bash|edit|multiedit|read|write|glob|grep|todoread|todowrite)\s*:".to_string(),
        r"(?i)^\s*tool\s*:|using tool".to_string(),
        r"(?i)esc to interrupt".to_string(),
    ];
    compile(&patterns)
});

static PAGER_NEEDS_ATTENTION_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| compile(&[r"(?i)press q"]));

static PAGER_WORKING_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)j/k.*scroll|q.*quit").unwrap());

static STARTING_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)claude code",
        r"(?i)starting|loading|initializing",
        r"╭─",
    ])
});

fn compile<S: AsRef<str>>(patterns: &[S]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p.as_ref()).unwrap())
        .collect()
}

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

/// Classify a visible pane capture.
pub fn detect_state(pane_text: &str) -> SessionState {
    let total_lines = pane_text.split('\n').count();

    // Tail window: last up-to-8 trimmed non-empty lines, most recent first.
    let mut tail: Vec<&str> = Vec::with_capacity(TAIL_WINDOW);
    for line in pane_text.split('\n').rev() {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            tail.push(trimmed);
            if tail.len() == TAIL_WINDOW {
                break;
            }
        }
    }

    if tail.is_empty() {
        return SessionState::Starting;
    }

    let combined = tail.join("\n");

    // A pager blocking on user action outranks everything.
    if any_match(&PAGER_NEEDS_ATTENTION_PATTERNS, &combined) {
        return SessionState::NeedsAttention;
    }

    if any_match(&NEEDS_ATTENTION_PATTERNS, &combined) {
        return SessionState::NeedsAttention;
    }

    if any_match(&WORKING_PATTERNS, &combined) {
        return SessionState::Working;
    }

    // Pager that is merely browsable counts as working.
    if PAGER_WORKING_PATTERN.is_match(&combined) {
        return SessionState::Working;
    }

    // Startup banner detection is gated on a short total capture so
    // steady-state content mentioning "loading" is not misread.
    if total_lines < STARTUP_SCREEN_MAX_LINES && any_match(&STARTING_PATTERNS, &combined) {
        return SessionState::Starting;
    }

    SessionState::Idle
}
