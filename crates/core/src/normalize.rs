//! Output normalization.
//!
//! Rewrites the parts of server output that differ from run to run so
//! transcripts compare byte for byte. Every function here is idempotent.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::response::parse_response;
use crate::types::OutputType;

/// Default column budget before structured output goes multi-line.
pub const DEFAULT_MAX_N_COLUMNS: usize = 79;

pub const PATH_PLACEHOLDER: &str = "<PATH>";

static XML_TIMING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\b(UP|ELAPSED)="[^"]*""#).expect("valid regex"));

static ABSOLUTE_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(?:/[^<>\s]*|[A-Za-z]:[\\/][^<>]*)>").expect("valid regex")
});

/// Settings shared by every response normalized in one run.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    /// Width at which pretty-printed structured output wraps.
    pub max_n_columns: usize,
    /// `(path, replacement)` pairs, applied longest path first.
    path_replacements: Vec<(String, String)>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_n_columns: DEFAULT_MAX_N_COLUMNS,
            path_replacements: Vec::new(),
        }
    }
}

impl NormalizeOptions {
    pub fn new(max_n_columns: usize) -> Self {
        Self {
            max_n_columns,
            ..Self::default()
        }
    }

    /// Replace occurrences of `path` in error messages by `replacement`.
    pub fn with_path(mut self, path: impl Into<String>, replacement: impl Into<String>) -> Self {
        let path = path.into();
        if !path.is_empty() {
            self.path_replacements.push((path, replacement.into()));
            self.path_replacements
                .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        }
        self
    }

    /// Rewrite filesystem paths in an error message.
    pub fn normalize_message(&self, message: &str) -> String {
        let mut message = message.to_string();
        for (path, replacement) in &self.path_replacements {
            message = message.replace(path.as_str(), replacement);
        }
        ABSOLUTE_PATH_RE
            .replace_all(&message, PATH_PLACEHOLDER)
            .into_owned()
    }
}

/// CRLF and lone CR become LF.
pub fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// [`normalize_line_endings`] over bytes that need not be UTF-8.
pub fn normalize_line_ending_bytes(source: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(source.len());
    let mut bytes = source.iter().copied().peekable();
    while let Some(byte) = bytes.next() {
        if byte == b'\r' {
            bytes.next_if_eq(&b'\n');
            out.push(b'\n');
        } else {
            out.push(byte);
        }
    }
    out
}

/// Normalize one response body into transcript text ending in exactly one
/// newline.
pub fn normalize_output(content: &[u8], output_type: &OutputType, options: &NormalizeOptions) -> String {
    let text = match output_type {
        OutputType::Json | OutputType::Msgpack => normalize_structured(content, output_type, options),
        OutputType::Xml => {
            let text = normalize_line_endings(&String::from_utf8_lossy(content));
            XML_TIMING_RE.replace_all(&text, r#"$1="0.0""#).into_owned()
        }
        _ => normalize_line_endings(&String::from_utf8_lossy(content)),
    };
    let mut text = text.trim_end_matches('\n').to_string();
    text.push('\n');
    text
}

fn normalize_structured(content: &[u8], output_type: &OutputType, options: &NormalizeOptions) -> String {
    // Text-based types may come with surrounding whitespace.
    let trimmed: &[u8] = if *output_type == OutputType::Json {
        content.trim_ascii()
    } else {
        content
    };
    match parse_response(trimmed, output_type) {
        Ok(response) => {
            let value = normalize_value(response.value, options);
            render(&value, options.max_n_columns)
        }
        Err(e) => normalize_line_endings(&e.to_string()),
    }
}

/// Zero timings and rewrite paths in either envelope form.
pub fn normalize_value(value: Value, options: &NormalizeOptions) -> Value {
    match value {
        Value::Array(mut items) => {
            if let Some(status) = items.first_mut() {
                *status = normalize_array_status(status, options);
            }
            Value::Array(items)
        }
        Value::Object(mut map) if map.contains_key("header") => {
            if let Some(Value::Object(header)) = map.get_mut("header") {
                normalize_object_header(header, options);
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn normalize_array_status(status: &Value, options: &NormalizeOptions) -> Value {
    let Some(fields) = status.as_array() else {
        return status.clone();
    };
    let Some(rc) = fields.first().and_then(Value::as_i64) else {
        return status.clone();
    };
    let mut normalized = vec![Value::from(rc), Value::from(0.0), Value::from(0.0)];
    if rc != 0 {
        let message = fields.get(3).and_then(Value::as_str).unwrap_or_default();
        normalized.push(Value::from(options.normalize_message(message)));
    }
    Value::Array(normalized)
}

fn normalize_object_header(header: &mut Map<String, Value>, options: &NormalizeOptions) {
    for key in ["start_time", "elapsed_time"] {
        if header.contains_key(key) {
            header.insert(key.to_string(), Value::from(0.0));
        }
    }
    if let Some(Value::Object(error)) = header.get_mut("error") {
        if let Some(message) = error.get("message").and_then(Value::as_str) {
            let message = options.normalize_message(message);
            error.insert("message".to_string(), Value::from(message));
        }
    }
}

/// Compact when it fits the column budget, pretty otherwise.
pub fn render(value: &Value, max_n_columns: usize) -> String {
    let compact = value.to_string();
    if compact.chars().count() <= max_n_columns {
        return compact;
    }
    serde_json::to_string_pretty(value).unwrap_or(compact)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn json(text: &str) -> String {
        normalize_output(text.as_bytes(), &OutputType::Json, &NormalizeOptions::default())
    }

    #[test]
    fn byte_line_endings_keep_other_bytes() {
        assert_eq!(normalize_line_ending_bytes(b"a\xe9\r\nb\rc\n"), b"a\xe9\nb\nc\n");
    }

    #[test]
    fn zeroes_success_timings() {
        assert_eq!(json("[[0,1700000000.123456,1.5e-05],true]"), "[[0,0.0,0.0],true]\n");
    }

    #[test]
    fn error_status_keeps_message_drops_backtrace() {
        assert_eq!(
            json(r#"[[-22,1.0,2.0,"invalid name",[["f","db.c",1]]],false]"#),
            "[[-22,0.0,0.0,\"invalid name\"],false]\n"
        );
    }

    #[test]
    fn object_envelope_header() {
        let out = normalize_output(
            br#"{"header":{"return_code":0,"start_time":12.5,"elapsed_time":0.25},"body":1}"#,
            &OutputType::Json,
            &NormalizeOptions::new(200),
        );
        assert_eq!(
            out,
            "{\"header\":{\"return_code\":0,\"start_time\":0.0,\"elapsed_time\":0.0},\"body\":1}\n"
        );
    }

    #[test]
    fn paths_in_error_messages() {
        let options = NormalizeOptions::default().with_path("/tmp/run-1/db", "#{db_directory}");
        assert_eq!(
            options.normalize_message("failed: </tmp/run-1/db/db.0000100>"),
            "failed: <#{db_directory}/db.0000100>"
        );
        assert_eq!(
            options.normalize_message("no plugin: </usr/lib/groonga/plugins/x.so>"),
            "no plugin: <PATH>"
        );
    }

    #[test]
    fn long_output_goes_pretty() {
        let body = json!([[0, 1.0, 2.0], [[[1], [["_id", "UInt32"]], [1]]], "x".repeat(80)]);
        let out = json(&body.to_string());
        assert!(out.starts_with("[\n  [\n    0,\n    0.0,\n    0.0\n  ],"));
        assert!(out.ends_with("]\n"));
    }

    #[test]
    fn xml_timings() {
        let out = normalize_output(
            b"<RESULT CODE=\"0\" UP=\"1700000000.1\" ELAPSED=\"0.002\">\r\n</RESULT>",
            &OutputType::Xml,
            &NormalizeOptions::default(),
        );
        assert_eq!(out, "<RESULT CODE=\"0\" UP=\"0.0\" ELAPSED=\"0.0\">\n</RESULT>\n");
    }

    #[test]
    fn msgpack_renders_as_json() {
        let bytes = rmp_serde::to_vec(&json!([[0, 3.5, 0.5], [1, 2]])).unwrap();
        let out = normalize_output(&bytes, &OutputType::Msgpack, &NormalizeOptions::default());
        assert_eq!(out, "[[0,0.0,0.0],[1,2]]\n");
    }

    #[test]
    fn parse_failure_yields_message() {
        let out = json("[[0,1.0");
        assert!(out.starts_with("failed to parse json content: "));
        assert!(out.ends_with("[[0,1.0\n"));
    }

    #[test]
    fn unknown_types_are_verbatim() {
        let out = normalize_output(
            b"a\tb\r\n",
            &OutputType::Other("tsv".into()),
            &NormalizeOptions::default(),
        );
        assert_eq!(out, "a\tb\n");
    }

    #[test]
    fn idempotent() {
        let options = NormalizeOptions::default().with_path("/tmp/x", "#{db_directory}");
        for input in [
            r#"[[0,1.0,2.0],{"a":[1,2,3]}]"#,
            r#"[[-63,1.0,2.0,"bad </tmp/x/db>",[]],null]"#,
            &json!([[0, 1.0, 2.0], "y".repeat(100)]).to_string(),
        ] {
            let once = normalize_output(input.as_bytes(), &OutputType::Json, &options);
            let twice = normalize_output(once.as_bytes(), &OutputType::Json, &options);
            assert_eq!(once, twice);
        }
    }
}
