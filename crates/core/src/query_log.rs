//! Query log parsing and rendering.
//!
//! The server writes one line per event:
//!
//! ```text
//! 2024-01-02 03:04:05.678901|0x7ffd1234|>select Foo
//! 2024-01-02 03:04:05.678902|0x7ffd1234|:000000000012345 filter(1)
//! 2024-01-02 03:04:05.678903|0x7ffd1234|<000000000034567 rc=0
//! ```
//!
//! `>` starts a statistic, `:` adds an operation, `<` finishes it.

use std::sync::LazyLock;

use regex::Regex;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:\.\d+)?\|([^|]+)\|([>:<])(.*)$")
        .expect("valid regex")
});

static OPERATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+) ((\w+)(?:\((.*?)\))?.*)$").expect("valid regex"));

static RETURN_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+) rc=(-?\d+)").expect("valid regex"));

static VOLATILE_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(cache|send)\(\d+\)").expect("valid regex"));

/// Zeroed elapsed-time column used when rendering.
pub const ZERO_ELAPSED: &str = "000000000000000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryLogOperation {
    pub name: String,
    /// Nanoseconds since the command started, zeroed when rendered.
    pub elapsed_ns: u64,
    /// The text after the elapsed column, e.g. `filter(1)`.
    pub message: String,
}

/// One command's worth of query log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistic {
    /// Per-connection id column that ties the lines together.
    pub context: String,
    pub command: Option<String>,
    pub operations: Vec<QueryLogOperation>,
    pub return_code: Option<i32>,
    pub elapsed_ns: u64,
}

impl Statistic {
    pub fn is_finished(&self) -> bool {
        self.return_code.is_some()
    }

    /// Render in the transcript form with timings zeroed.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(command) = &self.command {
            out.push_str(&format!("#>{command}\n"));
        }
        for op in &self.operations {
            let message = VOLATILE_COUNT_RE.replace(&op.message, "$1(0)");
            out.push_str(&format!("#:{ZERO_ELAPSED} {message}\n"));
        }
        if let Some(rc) = self.return_code {
            out.push_str(&format!("#<{ZERO_ELAPSED} rc={rc}\n"));
        }
        out
    }
}

/// Incremental parser: feed it text as it is tailed, collect finished
/// statistics.
#[derive(Debug, Default)]
pub struct QueryLogParser {
    current: Option<Statistic>,
    partial_line: String,
}

impl QueryLogParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw text. Incomplete trailing lines are kept until the rest
    /// arrives. Returns statistics finished by this chunk.
    pub fn feed(&mut self, text: &str) -> Vec<Statistic> {
        self.partial_line.push_str(text);
        let mut finished = Vec::new();
        while let Some(newline) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=newline).collect();
            if let Some(statistic) = self.feed_line(line.trim_end_matches(['\n', '\r'])) {
                finished.push(statistic);
            }
        }
        finished
    }

    /// Whether a statistic is still waiting for its `rc=` line.
    pub fn has_pending(&self) -> bool {
        self.current.is_some() || !self.partial_line.is_empty()
    }

    /// Hand out whatever is pending, finished or not.
    pub fn flush(&mut self) -> Option<Statistic> {
        if !self.partial_line.is_empty() {
            let line = std::mem::take(&mut self.partial_line);
            if let Some(statistic) = self.feed_line(line.trim_end_matches('\r')) {
                return Some(statistic);
            }
        }
        self.current.take()
    }

    fn feed_line(&mut self, line: &str) -> Option<Statistic> {
        let caps = LINE_RE.captures(line)?;
        let context = &caps[1];
        let rest = &caps[3];
        match &caps[2] {
            ">" => {
                let previous = self.current.take();
                self.current = Some(Statistic {
                    context: context.to_string(),
                    command: Some(rest.to_string()),
                    ..Statistic::default()
                });
                previous
            }
            ":" => {
                let statistic = self.current.get_or_insert_with(|| Statistic {
                    context: context.to_string(),
                    ..Statistic::default()
                });
                if let Some(op) = OPERATION_RE.captures(rest) {
                    statistic.operations.push(QueryLogOperation {
                        name: op[3].to_string(),
                        elapsed_ns: op[1].parse().unwrap_or_default(),
                        message: op[2].to_string(),
                    });
                }
                None
            }
            _ => {
                let mut statistic = self.current.take().unwrap_or_else(|| Statistic {
                    context: context.to_string(),
                    ..Statistic::default()
                });
                match RETURN_CODE_RE.captures(rest) {
                    Some(rc) => {
                        statistic.elapsed_ns = rc[1].parse().unwrap_or_default();
                        statistic.return_code = rc[2].parse().ok();
                    }
                    None => statistic.return_code = Some(0),
                }
                Some(statistic)
            }
        }
    }
}

/// Parse a whole query log at once.
pub fn parse_query_log(text: &str) -> Vec<Statistic> {
    let mut parser = QueryLogParser::new();
    let mut statistics = parser.feed(text);
    statistics.extend(parser.flush());
    statistics
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
2024-01-02 03:04:05.678901|0x7ffd1234|>select Foo
2024-01-02 03:04:05.678902|0x7ffd1234|:000000000012345 filter(1)
2024-01-02 03:04:05.678903|0x7ffd1234|:000000000022345 cache(12)
2024-01-02 03:04:05.678904|0x7ffd1234|:000000000023345 send(256)
2024-01-02 03:04:05.678905|0x7ffd1234|<000000000034567 rc=0
";

    #[test]
    fn parses_one_statistic() {
        let statistics = parse_query_log(LOG);
        assert_eq!(statistics.len(), 1);
        let statistic = &statistics[0];
        assert_eq!(statistic.command.as_deref(), Some("select Foo"));
        assert_eq!(statistic.operations.len(), 3);
        assert_eq!(statistic.operations[0].name, "filter");
        assert_eq!(statistic.operations[0].elapsed_ns, 12345);
        assert_eq!(statistic.return_code, Some(0));
        assert_eq!(statistic.elapsed_ns, 34567);
    }

    #[test]
    fn render_zeroes_timings_and_counts() {
        let rendered = parse_query_log(LOG)[0].render();
        assert_eq!(
            rendered,
            "#>select Foo\n\
             #:000000000000000 filter(1)\n\
             #:000000000000000 cache(0)\n\
             #:000000000000000 send(0)\n\
             #<000000000000000 rc=0\n"
        );
    }

    #[test]
    fn incremental_feed_keeps_partial_lines() {
        let mut parser = QueryLogParser::new();
        let (head, tail) = LOG.split_at(LOG.len() - 10);
        assert!(parser.feed(head).is_empty());
        assert!(parser.has_pending());
        let finished = parser.feed(tail);
        assert_eq!(finished.len(), 1);
        assert!(finished[0].is_finished());
        assert!(!parser.has_pending());
    }

    #[test]
    fn negative_return_code() {
        let statistics = parse_query_log(
            "2024-01-02 03:04:05.1|c|>status\n2024-01-02 03:04:05.2|c|<000000000000001 rc=-22\n",
        );
        assert_eq!(statistics[0].return_code, Some(-22));
    }
}
