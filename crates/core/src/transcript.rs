//! The ordered record stream produced by one test run.

use crate::log::LogEntry;
use crate::normalize::{
    normalize_line_ending_bytes, normalize_line_endings, normalize_output, NormalizeOptions,
};
use crate::types::OutputType;

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// Script bytes as read from the test file, after substitutions.
    Input { source: Vec<u8> },
    /// A raw response body awaiting normalization.
    Output {
        content: Vec<u8>,
        output_type: OutputType,
        command: Option<String>,
    },
    /// Error lines, surfaced log lines and directive complaints.
    Error { text: String },
    /// Rendered query log statistics.
    Query { text: String },
    /// Objects the server reported as not released at exit.
    LeakCount(u32),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    records: Vec<Record>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn push_input(&mut self, source: impl Into<Vec<u8>>) {
        self.push(Record::Input {
            source: source.into(),
        });
    }

    pub fn push_output(&mut self, content: Vec<u8>, output_type: OutputType, command: Option<String>) {
        self.push(Record::Output {
            content,
            output_type,
            command,
        });
    }

    /// Error text gets a trailing newline when it lacks one.
    pub fn push_error(&mut self, text: impl Into<String>) {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.push(Record::Error { text });
    }

    pub fn push_query(&mut self, text: impl Into<String>) {
        self.push(Record::Query { text: text.into() });
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of all leak-count records.
    pub fn n_leaked_objects(&self) -> u32 {
        self.records
            .iter()
            .map(|record| match record {
                Record::LeakCount(n) => *n,
                _ => 0,
            })
            .sum()
    }

    /// Render the comparable blob. Input records keep their bytes; only
    /// line endings are normalized.
    pub fn render_bytes(&self, options: &NormalizeOptions) -> Vec<u8> {
        let mut out = Vec::new();
        for record in &self.records {
            match record {
                Record::Input { source } => {
                    let source = normalize_line_ending_bytes(source);
                    out.extend_from_slice(&source);
                    if !source.ends_with(b"\n") {
                        out.push(b'\n');
                    }
                }
                Record::Output {
                    content,
                    output_type,
                    ..
                } => out.extend_from_slice(normalize_output(content, output_type, options).as_bytes()),
                Record::Error { text } | Record::Query { text } => {
                    out.extend_from_slice(normalize_line_endings(text).as_bytes());
                }
                Record::LeakCount(_) => {}
            }
        }
        out
    }

    /// [`Transcript::render_bytes`] for display. Invalid UTF-8 in script
    /// input shows up as U+FFFD.
    pub fn render(&self, options: &NormalizeOptions) -> String {
        String::from_utf8_lossy(&self.render_bytes(options)).into_owned()
    }
}

/// CRLF and lone CR become LF.
/// Render a surfaced log entry as `#|e| message`, one prefix per line.
pub fn render_log_entry(entry: &LogEntry) -> String {
    let level = entry.level.as_char();
    entry
        .message
        .lines()
        .map(|line| format!("#|{level}| {line}\n"))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
