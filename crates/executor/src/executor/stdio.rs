//! Executor over the server's stdin/stdout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use grntest_core::{Command, Interface};
use tokio::sync::Mutex;

use super::driver::{self, finish_readiness, first_read_timeout, needs_output_type_argument};
use super::Executor;
use crate::context::ExecutionContext;
use crate::error::ExecutorError;
use crate::transport::{PipeTransport, ReadMode};

/// Commands whose output arrives in several writes.
const STREAMING_COMMANDS: &[&str] = &["dump"];

/// Included scripts share the transport of the executor they came from.
#[derive(Debug, Clone)]
pub struct StandardIoExecutor {
    transport: Arc<Mutex<PipeTransport>>,
}

impl StandardIoExecutor {
    pub fn new(transport: PipeTransport) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
        }
    }

    async fn exchange(
        &self,
        wire: &[u8],
        first_timeout: Duration,
        mode: ReadMode,
    ) -> Result<Vec<u8>, ExecutorError> {
        let mut transport = self.transport.lock().await;
        transport.write(wire).await?;
        Ok(transport.read_available(first_timeout, mode).await?)
    }
}

/// The bytes written for `command`: its source, with `--output_type`
/// added to the first line when the context asks for a non-default type.
pub fn wire_text(command: &Command, ctx: &ExecutionContext) -> Vec<u8> {
    let mut first_line = command.first_line();
    while let [rest @ .., b'\n' | b'\r'] = first_line {
        first_line = rest;
    }
    let mut wire = first_line.to_vec();
    if needs_output_type_argument(command, ctx) {
        let output_type = ctx.output_type.as_str();
        if command.is_uri_form() {
            let separator = if first_line.contains(&b'?') { b'&' } else { b'?' };
            wire.push(separator);
            wire.extend_from_slice(b"output_type=");
            wire.extend_from_slice(output_type.as_bytes());
        } else {
            wire.extend_from_slice(b" --output_type ");
            wire.extend_from_slice(output_type.as_bytes());
        }
    }
    wire.push(b'\n');
    let body = command.body_lines();
    wire.extend_from_slice(body);
    if !body.is_empty() && !body.ends_with(b"\n") {
        wire.push(b'\n');
    }
    wire
}

#[async_trait]
impl Executor for StandardIoExecutor {
    fn interface(&self) -> Interface {
        Interface::Stdio
    }

    async fn send_command(
        &mut self,
        command: &Command,
        ctx: &ExecutionContext,
    ) -> Result<Vec<u8>, ExecutorError> {
        let mode = if STREAMING_COMMANDS.contains(&command.name()) {
            ReadMode::Streaming
        } else {
            ReadMode::Burst
        };
        let wire = wire_text(command, ctx);
        self.exchange(&wire, first_read_timeout(command, ctx), mode).await
    }

    fn create_sub_executor(&self) -> Box<dyn Executor> {
        Box::new(self.clone())
    }

    /// Pipes buffer, so the probe is written once and the whole retry
    /// budget is spent waiting for its answer.
    async fn ensure_ready(&mut self, ctx: &mut ExecutionContext) -> Result<(), ExecutorError> {
        let status = Command::build("status", &[]);
        let wait = driver::READY_INTERVAL * driver::READY_ATTEMPTS;
        let body = self
            .exchange(&wire_text(&status, ctx), wait, ReadMode::Burst)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "server did not answer the readiness probe");
                ExecutorError::NotReady(driver::READY_ATTEMPTS)
            })?;
        finish_readiness(ctx, &body).await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use grntest_core::OutputType;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    fn context() -> ExecutionContext {
        ExecutionContext::new("/suite", "/tmp/grntest-stdio")
    }

    #[test]
    fn wire_text_appends_output_type() {
        let mut ctx = context();
        let command = Command::parse("select Foo\n").unwrap();
        assert_eq!(wire_text(&command, &ctx), b"select Foo\n");

        ctx.output_type = OutputType::Msgpack;
        assert_eq!(wire_text(&command, &ctx), b"select Foo --output_type msgpack\n");

        let uri = Command::parse("/d/select?table=Foo").unwrap();
        assert_eq!(wire_text(&uri, &ctx), b"/d/select?table=Foo&output_type=msgpack\n");
    }

    #[test]
    fn wire_text_keeps_load_body() {
        let ctx = context();
        let mut command = Command::parse("load --table Foo\n").unwrap();
        command.append_body_line(b"[\n");
        command.append_body_line(b"{\"_key\":\"a\"}\n");
        command.append_body_line(b"]");
        assert_eq!(wire_text(&command, &ctx), b"load --table Foo\n[\n{\"_key\":\"a\"}\n]\n");
    }

    #[test]
    fn wire_text_sends_script_bytes_unchanged() {
        let mut ctx = context();
        let command = Command::parse_bytes(b"select Foo --query caf\xe9\r\n").unwrap();
        assert_eq!(wire_text(&command, &ctx), b"select Foo --query caf\xe9\n");

        ctx.output_type = OutputType::Msgpack;
        assert_eq!(
            wire_text(&command, &ctx),
            b"select Foo --query caf\xe9 --output_type msgpack\n"
        );
    }

    /// Echo server answering each line with a fixed response.
    fn spawn_fake_server(server: tokio::io::DuplexStream) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(server);
            let mut lines = BufReader::new(reader).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let response = if line.starts_with("status") {
                    "[[0,1.0,0.1],{\"features\":{\"mruby\":true}}]\n".to_string()
                } else {
                    "[[0,1.0,0.1],true]\n".to_string()
                };
                seen.push(line.clone());
                if writer.write_all(response.as_bytes()).await.is_err() || line == "shutdown" {
                    break;
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn converses_over_pipes() {
        let (client, server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let server_task = spawn_fake_server(server);

        let mut executor = StandardIoExecutor::new(PipeTransport::new(writer, reader));
        let mut ctx = context();
        executor.ensure_ready(&mut ctx).await.unwrap();
        assert_eq!(ctx.server_features.as_ref().unwrap().get("mruby"), Some(&true));

        let command = Command::parse("table_create Foo TABLE_NO_KEY").unwrap();
        let body = executor.send_command(&command, &ctx).await.unwrap();
        assert_eq!(body, b"[[0,1.0,0.1],true]\n");

        let mut sub = executor.create_sub_executor();
        let body = sub.send_command(&Command::parse("status").unwrap(), &ctx).await.unwrap();
        assert!(body.starts_with(b"[[0,1.0,0.1],{"));

        assert!(executor.shutdown(&mut ctx, None).await.unwrap());
        let seen = server_task.await.unwrap();
        assert_eq!(seen, vec!["status", "table_create Foo TABLE_NO_KEY", "status", "shutdown"]);
    }
}
