use std::path::PathBuf;

use grntest_executor::ExecutorError;

/// Failures of the runner outside a single test's transcript.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid value for {var}: <{value}> ({reason})")]
    Config {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to spawn <{program}>: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create database <{path}>: {message}")]
    DatabaseCreation { path: PathBuf, message: String },

    #[error("server process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("no free TCP port: {0}")]
    NoFreePort(std::io::Error),

    #[error("no test files found")]
    NoTests,

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
