//! Server log parsing.
//!
//! A log line looks like `2024-01-02 03:04:05.678901|e| message`. Lines
//! that do not start with a timestamp are continuations of the previous
//! entry's message.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?)\|([EACewnid\-])\|\s?(.*)$")
        .expect("valid regex")
});

/// Severity of a server log entry, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Information,
    Debug,
    Dump,
}

impl LogLevel {
    pub const ALL: [LogLevel; 9] = [
        Self::Emergency,
        Self::Alert,
        Self::Critical,
        Self::Error,
        Self::Warning,
        Self::Notice,
        Self::Information,
        Self::Debug,
        Self::Dump,
    ];

    /// The one-character tag used in the log file.
    pub fn as_char(&self) -> char {
        match self {
            Self::Emergency => 'E',
            Self::Alert => 'A',
            Self::Critical => 'C',
            Self::Error => 'e',
            Self::Warning => 'w',
            Self::Notice => 'n',
            Self::Information => 'i',
            Self::Debug => 'd',
            Self::Dump => '-',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_char() == c)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::Alert => "alert",
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Information => "information",
            Self::Debug => "debug",
            Self::Dump => "dump",
        }
    }

    /// Accepts full names (`warning`), common short names (`info`, `warn`)
    /// and the single-character tags.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "emergency" | "emerg" => Some(Self::Emergency),
            "alert" => Some(Self::Alert),
            "critical" | "crit" => Some(Self::Critical),
            "error" => Some(Self::Error),
            "warning" | "warn" => Some(Self::Warning),
            "notice" => Some(Self::Notice),
            "information" | "info" => Some(Self::Information),
            "debug" => Some(Self::Debug),
            "dump" => Some(Self::Dump),
            other => {
                let mut chars = other.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Self::from_char(c),
                    _ => None,
                }
            }
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One server log record. Continuation lines are folded into `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Kept verbatim, e.g. `2026-10-14 12:00:00.000000`.
    pub timestamp: String,
    pub level: LogLevel,
    pub message: String,
}

/// Parse raw server log text into entries.
///
/// Text before the first timestamped line has nothing to attach to and is
/// dropped.
pub fn parse_log(text: &str) -> Vec<LogEntry> {
    let mut entries: Vec<LogEntry> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        match parse_entry_line(line) {
            Some(entry) => entries.push(entry),
            None => {
                if let Some(last) = entries.last_mut() {
                    last.message.push('\n');
                    last.message.push_str(line);
                }
            }
        }
    }
    entries
}

fn parse_entry_line(line: &str) -> Option<LogEntry> {
    let caps = ENTRY_RE.captures(line)?;
    let level = caps[2].chars().next().and_then(LogLevel::from_char)?;
    Some(LogEntry {
        timestamp: caps[1].to_string(),
        level,
        message: caps[3].to_string(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
