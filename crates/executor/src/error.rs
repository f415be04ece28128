use std::path::PathBuf;
use std::time::Duration;

use grntest_core::CommandParseError;

/// Failure talking to the server process.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server closed its output")]
    Closed,

    #[error("no response within {0:?}")]
    NoResponse(Duration),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Non-local exits. Travels up through `?` and is stopped at the top-level
/// run boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Halt {
    #[error("omitted: {0}")]
    Omitted(String),

    #[error("aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error(transparent)]
    Grammar(#[from] CommandParseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("timeout ({}s)", format_seconds(*.0))]
    Timeout(Duration),

    #[error("server is not ready after {0} attempts")]
    NotReady(u32),

    #[error(transparent)]
    Halt(#[from] Halt),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt(_))
    }
}

/// Seconds without a trailing `.0` for whole values.
pub fn format_seconds(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", secs as u64)
    } else {
        format!("{secs}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
