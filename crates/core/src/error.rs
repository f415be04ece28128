/// Errors shared by the pure harness modules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("unknown {kind}: {value}")]
    UnknownValue { kind: &'static str, value: String },

    #[error("invalid template: {0}")]
    Template(String),

    #[error("invalid pattern: {0}")]
    Pattern(String),
}

/// Malformed command syntax. Fatal for the current script frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,

    #[error("unterminated quoted value: <{0}>")]
    UnterminatedQuote(String),

    #[error("no value for argument: --{0}")]
    MissingValue(String),

    #[error("invalid URI command: <{0}>")]
    InvalidUri(String),

    #[error("positional argument #{index} is not known for command <{command}>")]
    UnknownPositional { command: String, index: usize },
}

/// Malformed directive arguments. Logged into the transcript, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("unterminated quote in directive: <{0}>")]
    UnterminatedQuote(String),

    #[error("[{directive}] {message}")]
    InvalidArgument { directive: String, message: String },
}

impl DirectiveError {
    pub fn invalid(directive: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            directive: directive.to_string(),
            message: message.into(),
        }
    }
}

/// A structured response body that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to parse {output_type} content: {reason}\n{content}")]
pub struct ResponseParseError {
    pub output_type: String,
    pub reason: String,
    pub content: String,
}
