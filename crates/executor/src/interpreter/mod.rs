//! Script interpreter.
//!
//! Reads a test script line by line and turns it into directive handling
//! and command execution. Multi-line `load` bodies are collected before the
//! load is dispatched as a unit.
//!
//! Lines stay raw bytes from the file to the wire and the transcript. Only
//! directive lines are decoded, since the harness itself interprets them.

pub mod directives;
pub mod series;

use std::path::Path;

use futures::future::BoxFuture;
use futures::FutureExt;
use grntest_core::directive::{Directive, DIRECTIVE_PREFIX};
use grntest_core::Command;

use crate::context::ExecutionContext;
use crate::error::{ExecutorError, Halt};
use crate::executor::{execute_command, Executor};

/// How a top-level run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Omitted(String),
    Aborted(String),
}

/// Run a test script at the top level. Script-level failures end here:
/// they become [`RunOutcome::Aborted`] and never propagate further.
pub async fn run_test(
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    path: &Path,
) -> Result<RunOutcome, ExecutorError> {
    match run_script(executor, ctx, path).await {
        Ok(()) => Ok(RunOutcome::Completed),
        Err(ExecutorError::Halt(Halt::Omitted(reason))) => Ok(RunOutcome::Omitted(reason)),
        Err(ExecutorError::Halt(Halt::Aborted(reason))) => Ok(RunOutcome::Aborted(reason)),
        Err(e @ ExecutorError::ScriptNotFound(_)) => Err(e),
        Err(e) => {
            let reason = e.to_string();
            tracing::warn!(script = %path.display(), error = %reason, "test script aborted");
            ctx.abort(reason.clone());
            Ok(RunOutcome::Aborted(reason))
        }
    }
}

/// Run one script frame. Included scripts come back through here with a
/// sub-executor.
pub fn run_script<'a>(
    executor: &'a mut dyn Executor,
    ctx: &'a mut ExecutionContext,
    path: &'a Path,
) -> BoxFuture<'a, Result<(), ExecutorError>> {
    async move {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExecutorError::ScriptNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(script = %path.display(), depth = ctx.depth(), "running script");

        let mut frame = Frame {
            executor,
            ctx,
            pending_load: None,
        };
        for line in content.split_inclusive(|b| *b == b'\n') {
            frame.feed_line(line).await?;
        }
        frame.flush_load().await
    }
    .boxed()
}

/// A `load` whose values are still being collected.
#[derive(Debug)]
struct PendingLoad {
    command: Command,
    echo: Vec<u8>,
    body_started: bool,
}

struct Frame<'a> {
    executor: &'a mut dyn Executor,
    ctx: &'a mut ExecutionContext,
    pending_load: Option<PendingLoad>,
}

impl Frame<'_> {
    async fn feed_line(&mut self, line: &[u8]) -> Result<(), ExecutorError> {
        if self.pending_load.is_some() && self.feed_load_body(line).await? {
            return Ok(());
        }

        let trimmed = trim_line_end(line);
        if trimmed.trim_ascii().is_empty() {
            return Ok(());
        }
        if trimmed.starts_with(DIRECTIVE_PREFIX.as_bytes()) {
            return self.run_directive(&String::from_utf8_lossy(line)).await;
        }
        if trimmed.starts_with(b"#") {
            return Ok(());
        }
        self.run_command_line(line).await
    }

    /// Returns whether the line was consumed as part of a load body.
    async fn feed_load_body(&mut self, line: &[u8]) -> Result<bool, ExecutorError> {
        let trimmed = trim_line_end(line);
        let Some(pending) = self.pending_load.as_mut() else {
            return Ok(false);
        };

        if !pending.body_started {
            if !trimmed.starts_with(b"[") {
                self.flush_load().await?;
                return Ok(false);
            }
            pending.body_started = true;
            self.append_load_line(line);
            if trimmed != b"[" && serde_json::from_slice::<serde_json::Value>(trimmed).is_ok() {
                self.flush_load().await?;
            }
            return Ok(true);
        }

        self.append_load_line(line);
        if trimmed == b"]" {
            self.flush_load().await?;
        }
        Ok(true)
    }

    fn append_load_line(&mut self, line: &[u8]) {
        let wire = self.ctx.substitutions.apply_input(line);
        let echo = self.ctx.substitutions.apply_normalized(line);
        if let Some(pending) = self.pending_load.as_mut() {
            pending.command.append_body_line(&wire);
            pending.echo.extend_from_slice(&echo);
        }
    }

    async fn flush_load(&mut self) -> Result<(), ExecutorError> {
        let Some(pending) = self.pending_load.take() else {
            return Ok(());
        };
        execute_command(&mut *self.executor, self.ctx, &pending.command, Some(pending.echo.as_slice())).await
    }

    async fn run_command_line(&mut self, line: &[u8]) -> Result<(), ExecutorError> {
        let wire = self.ctx.substitutions.apply_input(line);
        let echo = self.ctx.substitutions.apply_normalized(line);
        let command = match Command::parse_bytes(&wire) {
            Ok(command) => command,
            Err(e) => {
                self.ctx.log_input(echo);
                self.ctx.log_error(format!("# error: {e}"));
                return Err(e.into());
            }
        };

        if command.is_load() && !command.has("values") {
            self.pending_load = Some(PendingLoad {
                command,
                echo,
                body_started: false,
            });
            return Ok(());
        }
        execute_command(&mut *self.executor, self.ctx, &command, Some(echo.as_slice())).await
    }

    async fn run_directive(&mut self, line: &str) -> Result<(), ExecutorError> {
        let directive = match Directive::parse(line) {
            Some(Ok(directive)) => directive,
            Some(Err(e)) => {
                directives::report(self.ctx, line, &e);
                return Ok(());
            }
            None => return Ok(()),
        };
        directives::execute(&mut *self.executor, self.ctx, &directive, line).await
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let [rest @ .., b'\n' | b'\r'] = line {
        line = rest;
    }
    line
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
