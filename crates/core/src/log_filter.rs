//! Decides which server log entries are surfaced into the transcript.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::CoreError;
use crate::log::{LogEntry, LogLevel};

/// Levels surfaced without any directive.
pub const DEFAULT_IMPORTANT_LEVELS: [LogLevel; 5] = [
    LogLevel::Emergency,
    LogLevel::Alert,
    LogLevel::Critical,
    LogLevel::Error,
    LogLevel::Warning,
];

const CRASH_START: &str = "-- CRASHED!!! --";

/// Backtrace frame shapes, one `(pattern, purpose)` pair per platform
/// format. New formats are added here only.
static BACKTRACE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"^/", "absolute unix path frame"),
        (r"^[a-zA-Z]:[/\\]", "windows drive path frame"),
        (r"^groonga\(\) \[0x[\da-f]+\]$", "bare executable frame"),
        (r"^\(unknown\):\d+:\d+: ", "unknown source location"),
        (r"^[\w.\\-]+:\d+:\d+: ", "source:line:column location"),
        (
            r"^(?:groonga|lib.+?\.so\S*)\(\S*\+0x[\da-f]+\) \[0x[\da-f]+\]$",
            "symbol+offset frame",
        ),
    ]
    .into_iter()
    .map(|(pattern, purpose)| (Regex::new(pattern).expect("valid regex"), purpose))
    .collect()
});

static THREAD_NOTICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^thread (?:start|end)").expect("valid regex"));

static DASHED_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-+$").expect("valid regex"));

static LEAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^grn_fin \((\d+)\)$").expect("valid regex"));

/// Per-test log classification state. Mutated by the log directives and by
/// crash markers seen while tailing.
#[derive(Debug, Clone)]
pub struct LogFilter {
    important_levels: BTreeSet<LogLevel>,
    ignore_patterns: Vec<(String, Regex)>,
    suppress_backtrace: bool,
    in_crash: bool,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::new(true)
    }
}

impl LogFilter {
    pub fn new(suppress_backtrace: bool) -> Self {
        Self {
            important_levels: DEFAULT_IMPORTANT_LEVELS.into_iter().collect(),
            ignore_patterns: Vec::new(),
            suppress_backtrace,
            in_crash: false,
        }
    }

    pub fn add_important_level(&mut self, level: LogLevel) {
        self.important_levels.insert(level);
    }

    pub fn remove_important_level(&mut self, level: LogLevel) {
        self.important_levels.remove(&level);
    }

    pub fn is_important_level(&self, level: LogLevel) -> bool {
        self.important_levels.contains(&level)
    }

    /// Register a user ignore pattern. The pattern source is its identity
    /// for [`remove_ignore_pattern`](Self::remove_ignore_pattern).
    pub fn add_ignore_pattern(&mut self, pattern: &str) -> Result<(), CoreError> {
        let regex = Regex::new(pattern).map_err(|e| CoreError::Pattern(e.to_string()))?;
        self.ignore_patterns.push((pattern.to_string(), regex));
        Ok(())
    }

    pub fn remove_ignore_pattern(&mut self, pattern: &str) {
        self.ignore_patterns.retain(|(source, _)| source != pattern);
    }

    pub fn suppress_backtrace(&self) -> bool {
        self.suppress_backtrace
    }

    pub fn in_crash(&self) -> bool {
        self.in_crash
    }

    /// Classify one entry, updating crash state. Returns whether it goes
    /// into the transcript.
    pub fn accept(&mut self, entry: &LogEntry) -> bool {
        let message = entry.message.as_str();

        if message.starts_with(CRASH_START) {
            self.in_crash = true;
            return true;
        }
        if self.in_crash && DASHED_LINE_RE.is_match(message) {
            self.in_crash = false;
            return true;
        }

        if THREAD_NOTICE_RE.is_match(message) {
            return false;
        }
        if self.ignore_patterns.iter().any(|(_, re)| re.is_match(message)) {
            return false;
        }
        if self.in_crash {
            return true;
        }
        if !self.important_levels.contains(&entry.level) {
            return false;
        }
        !(self.suppress_backtrace && is_backtrace(message))
    }

    /// Keep only the entries that [`accept`](Self::accept) lets through.
    pub fn filter(&mut self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        entries.into_iter().filter(|entry| self.accept(entry)).collect()
    }
}

/// Whether a message looks like a stack frame line.
pub fn is_backtrace(message: &str) -> bool {
    BACKTRACE_PATTERNS.iter().any(|(re, _)| re.is_match(message))
}

/// The object count reported by the last `grn_fin (N)` marker, if any.
pub fn leak_count(entries: &[LogEntry]) -> Option<u32> {
    entries
        .iter()
        .filter_map(|entry| LEAK_RE.captures(&entry.message))
        .filter_map(|caps| caps[1].parse().ok())
        .last()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: LogLevel, message: &str) -> LogEntry {
        LogEntry {
            timestamp: "2024-01-01 00:00:00.000000".into(),
            level,
            message: message.into(),
        }
    }

    #[test]
    fn default_levels() {
        let mut filter = LogFilter::default();
        assert!(filter.accept(&entry(LogLevel::Error, "syntax error")));
        assert!(filter.accept(&entry(LogLevel::Warning, "careful")));
        assert!(!filter.accept(&entry(LogLevel::Notice, "grn_init")));
    }

    #[test]
    fn added_levels_are_surfaced() {
        let mut filter = LogFilter::default();
        filter.add_important_level(LogLevel::Notice);
        assert!(filter.accept(&entry(LogLevel::Notice, "spec")));
        filter.remove_important_level(LogLevel::Notice);
        filter.remove_important_level(LogLevel::Warning);
        assert!(!filter.accept(&entry(LogLevel::Warning, "careful")));
    }

    #[test]
    fn backtraces_suppressed_outside_crash() {
        let mut filter = LogFilter::default();
        assert!(!filter.accept(&entry(LogLevel::Error, "/usr/lib/libgroonga.so.0(grn_ctx_at+0x12) [0xdeadbeef]")));
        assert!(!filter.accept(&entry(LogLevel::Error, "lib/db.c:123:45: grn_ctx_at()")));

        let mut keep = LogFilter::new(false);
        assert!(keep.accept(&entry(LogLevel::Error, "lib/db.c:123:45: grn_ctx_at()")));
    }

    #[test]
    fn crash_block_surfaces_everything() {
        let mut filter = LogFilter::default();
        assert!(filter.accept(&entry(LogLevel::Critical, "-- CRASHED!!! --")));
        assert!(filter.in_crash());
        assert!(filter.accept(&entry(LogLevel::Critical, "/lib/x.so(sym+0x1) [0x2]")));
        assert!(filter.accept(&entry(LogLevel::Debug, "anything at all")));
        assert!(filter.accept(&entry(LogLevel::Critical, "----------------")));
        assert!(!filter.in_crash());
        assert!(!filter.accept(&entry(LogLevel::Error, "/lib/x.so(sym+0x1) [0x2]")));
    }

    #[test]
    fn thread_notices_and_ignore_patterns() {
        let mut filter = LogFilter::default();
        filter.add_important_level(LogLevel::Notice);
        assert!(!filter.accept(&entry(LogLevel::Notice, "thread start (1/2)")));

        filter.add_ignore_pattern(r"^io_flush").unwrap();
        assert!(!filter.accept(&entry(LogLevel::Error, "io_flush failed")));
        filter.remove_ignore_pattern(r"^io_flush");
        assert!(filter.accept(&entry(LogLevel::Error, "io_flush failed")));

        assert!(filter.add_ignore_pattern("(").is_err());
    }

    #[test]
    fn leak_marker() {
        let entries = vec![
            entry(LogLevel::Notice, "grn_init"),
            entry(LogLevel::Notice, "grn_fin (3)"),
        ];
        assert_eq!(leak_count(&entries), Some(3));
        assert_eq!(leak_count(&entries[..1]), None);
    }
}
