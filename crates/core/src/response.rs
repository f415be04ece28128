//! Structured response decoding.
//!
//! Two envelopes exist. The array form is `[[rc, start, elapsed, msg?,
//! backtrace?], body...]`; the object form (command version 3) is
//! `{"header": {"return_code": .., "start_time": .., "elapsed_time": ..,
//! "error": {"message": ..}}, "body": ..}`.

use serde_json::Value;

use crate::error::ResponseParseError;
use crate::types::OutputType;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub value: Value,
}

impl ParsedResponse {
    /// Whether the response uses the object envelope.
    pub fn is_object_envelope(&self) -> bool {
        self.value.get("header").is_some()
    }

    pub fn return_code(&self) -> Option<i64> {
        match &self.value {
            Value::Array(items) => items.first()?.get(0)?.as_i64(),
            Value::Object(map) => map.get("header")?.get("return_code")?.as_i64(),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.value {
            Value::Array(items) => items.first()?.get(3)?.as_str(),
            Value::Object(map) => map.get("header")?.get("error")?.get("message")?.as_str(),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.return_code().is_some_and(|rc| rc != 0)
    }

    /// The first body element (array form) or the body (object form).
    pub fn body(&self) -> Option<&Value> {
        match &self.value {
            Value::Array(items) => items.get(1),
            Value::Object(map) => map.get("body"),
            _ => None,
        }
    }
}

/// Decode a response body of the given type.
pub fn parse_response(
    content: &[u8],
    output_type: &OutputType,
) -> Result<ParsedResponse, ResponseParseError> {
    let fail = |reason: String| ResponseParseError {
        output_type: output_type.to_string(),
        reason,
        content: String::from_utf8_lossy(content).into_owned(),
    };
    let value = match output_type {
        OutputType::Json => serde_json::from_slice::<Value>(content).map_err(|e| fail(e.to_string()))?,
        OutputType::Msgpack => {
            rmp_serde::from_slice::<Value>(content).map_err(|e| fail(e.to_string()))?
        }
        other => return Err(fail(format!("{other} is not a structured output type"))),
    };
    Ok(ParsedResponse { value })
}

/// Decode JSON-ish text that may be surrounded by whitespace or lack
/// the final newline.
pub fn parse_json_text(text: &str) -> Result<ParsedResponse, ResponseParseError> {
    parse_response(text.trim().as_bytes(), &OutputType::Json)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn array_envelope() {
        let response =
            parse_json_text(r#"[[0,1700000000.123,0.000123],{"features":{"mruby":false}}]"#).unwrap();
        assert_eq!(response.return_code(), Some(0));
        assert!(!response.is_error());
        assert_eq!(response.body().unwrap()["features"]["mruby"], json!(false));
    }

    #[test]
    fn array_envelope_error() {
        let response = parse_json_text(
            r#"[[-22,1.0,2.0,"invalid table name",[["grn_ctx_at","db.c",12]]],false]"#,
        )
        .unwrap();
        assert!(response.is_error());
        assert_eq!(response.error_message(), Some("invalid table name"));
    }

    #[test]
    fn object_envelope() {
        let response = parse_json_text(
            r#"{"header":{"return_code":-63,"start_time":1.0,"elapsed_time":2.0,"error":{"message":"no such table"}},"body":null}"#,
        )
        .unwrap();
        assert!(response.is_object_envelope());
        assert_eq!(response.return_code(), Some(-63));
        assert_eq!(response.error_message(), Some("no such table"));
    }

    #[test]
    fn msgpack_body() {
        let bytes = rmp_serde::to_vec(&json!([[0, 1.5, 0.25], true])).unwrap();
        let response = parse_response(&bytes, &OutputType::Msgpack).unwrap();
        assert_eq!(response.return_code(), Some(0));
        assert_eq!(response.body(), Some(&json!(true)));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert_matches!(
            parse_json_text("[[0,1.0"),
            Err(ResponseParseError { output_type, content, .. })
                if output_type == "json" && content == "[[0,1.0"
        );
    }

    #[test]
    fn xml_is_not_structured() {
        assert!(parse_response(b"<RESULT/>", &OutputType::Xml).is_err());
    }
}
