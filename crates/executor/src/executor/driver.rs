//! Transport-independent half of command execution.

use std::error::Error as _;
use std::time::{Duration, Instant};

use grntest_core::response::parse_response;
use grntest_core::{Command, OutputType};
use tokio::process::Child;

use super::Executor;
use crate::context::ExecutionContext;
use crate::error::{ExecutorError, Halt, TransportError};

/// Readiness probe attempts and spacing.
pub const READY_ATTEMPTS: u32 = 100;
pub const READY_INTERVAL: Duration = Duration::from_millis(100);

/// Process exit polling spacing.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const QUERY_LOG_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Commands whose response is plain text whatever `output_type` says.
const RAW_OUTPUT_COMMANDS: &[&str] = &["dump"];

/// The encoding the response to `command` will come back in.
pub fn resolve_output_type(command: &Command, ctx: &ExecutionContext) -> OutputType {
    if RAW_OUTPUT_COMMANDS.contains(&command.name()) {
        return OutputType::Other("groonga-command".to_string());
    }
    match command.output_type() {
        Some(name) => OutputType::from_name(name),
        None => ctx.output_type.clone(),
    }
}

/// Whether the transport has to request the context's output type
/// explicitly.
pub fn needs_output_type_argument(command: &Command, ctx: &ExecutionContext) -> bool {
    !RAW_OUTPUT_COMMANDS.contains(&command.name())
        && command.output_type().is_none()
        && ctx.output_type != OutputType::Json
}

/// First-byte wait for `command`.
pub fn first_read_timeout(command: &Command, ctx: &ExecutionContext) -> Duration {
    if command.may_slow() {
        ctx.long_read_timeout
    } else {
        ctx.read_timeout
    }
}

/// Hard bound around one send/receive cycle.
pub fn command_timeout(command: &Command, ctx: &ExecutionContext) -> Duration {
    ctx.timeout.max(first_read_timeout(command, ctx))
}

/// Execute one command: echo, send under a timeout, record the response,
/// tail the logs and apply the error policy.
///
/// `echo` is the input recorded in the transcript, as script bytes; `None`
/// sends silently but still records the response.
pub async fn execute_command(
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    command: &Command,
    echo: Option<&[u8]>,
) -> Result<(), ExecutorError> {
    if let Some(reason) = ctx.abort_reason() {
        return Err(Halt::Aborted(reason.to_string()).into());
    }

    let output_type = resolve_output_type(command, ctx);
    if let Some(echo) = echo {
        ctx.log_input(echo);
    }

    let n_iterations = ctx
        .benchmark
        .as_ref()
        .map_or(ctx.n_iterations, |benchmark| benchmark.n_iterations)
        .max(1);
    let hard_timeout = command_timeout(command, ctx);
    let cpu_start = cpu_time();
    let real_start = Instant::now();

    let mut response = Vec::new();
    for _ in 0..n_iterations {
        let sent = tokio::time::timeout(hard_timeout, executor.send_command(command, ctx)).await;
        match sent {
            Ok(Ok(body)) => response = body,
            Ok(Err(ExecutorError::Transport(TransportError::NoResponse(waited)))) => {
                return handle_timeout(ctx, waited).await;
            }
            Ok(Err(e)) => return handle_failure(ctx, e).await,
            Err(_elapsed) => return handle_timeout(ctx, hard_timeout).await,
        }
    }

    if let Some(benchmark) = ctx.benchmark.as_mut() {
        benchmark.record(cpu_time().saturating_sub(cpu_start), real_start.elapsed());
    }

    if ctx.logging {
        ctx.transcript
            .push_output(response.clone(), output_type.clone(), Some(command.name().to_string()));
    }

    if let Some(delay) = ctx.sleep_after_command {
        tokio::time::sleep(delay).await;
    }

    ctx.tail_server_log().await;
    collect_query_log(ctx).await;

    if output_type.is_structured() {
        // Undecodable bodies count as "no error detected".
        let parsed = parse_response(response.trim_ascii(), &output_type);
        if parsed.is_ok_and(|parsed| parsed.is_error()) {
            ctx.apply_error_policy()?;
        }
    }
    Ok(())
}

async fn handle_timeout(ctx: &mut ExecutionContext, waited: Duration) -> Result<(), ExecutorError> {
    tracing::warn!(timeout_ms = waited.as_millis() as u64, "command timed out");
    ctx.log_error(format!("# error: {}", ExecutorError::Timeout(waited)));
    ctx.tail_server_log().await;
    ctx.apply_error_policy()?;
    Ok(())
}

async fn handle_failure(ctx: &mut ExecutionContext, error: ExecutorError) -> Result<(), ExecutorError> {
    if error.is_halt() {
        return Err(error);
    }
    tracing::error!(error = %error, "command failed");
    ctx.log_error(format!("# error: {error}"));
    let mut source = error.source();
    while let Some(cause) = source {
        ctx.log_error(format!("# error:   caused by: {cause}"));
        source = cause.source();
    }
    let pending = ctx.pending_server_log().await;
    if !pending.is_empty() {
        ctx.log_error(pending);
    }
    ctx.apply_error_policy()?;
    Err(error)
}

/// Consume new query log lines. Statistics are recorded only while
/// collection is enabled, in which case this waits up to the read timeout
/// for the `rc=` line.
pub async fn collect_query_log(ctx: &mut ExecutionContext) {
    let deadline = Instant::now() + ctx.read_timeout;
    loop {
        let Some(tail) = ctx.query_log_tail() else {
            return;
        };
        let text = match tail.read_new_lines().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read query log");
                return;
            }
        };
        let statistics = ctx.query_log_parser.feed(&text);
        if !ctx.collect_query_log {
            return;
        }
        let finished = !statistics.is_empty();
        for statistic in statistics {
            if ctx.logging {
                ctx.transcript.push_query(statistic.render());
            }
        }
        if (finished && !ctx.query_log_parser.has_pending()) || Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(QUERY_LOG_POLL_INTERVAL).await;
    }
}

/// Probe with `status` until the server answers.
pub async fn ensure_ready<E: Executor + ?Sized>(
    executor: &mut E,
    ctx: &mut ExecutionContext,
) -> Result<(), ExecutorError> {
    let status = Command::build("status", &[]);
    for attempt in 1..=READY_ATTEMPTS {
        let sent = tokio::time::timeout(ctx.timeout, executor.send_command(&status, ctx)).await;
        match sent {
            Ok(Ok(body)) => {
                finish_readiness(ctx, &body).await;
                tracing::debug!(attempt, "server is ready");
                return Ok(());
            }
            Ok(Err(e)) => tracing::trace!(attempt, error = %e, "server not ready yet"),
            Err(_elapsed) => tracing::trace!(attempt, "readiness probe timed out"),
        }
        tokio::time::sleep(READY_INTERVAL).await;
    }
    Err(ExecutorError::NotReady(READY_ATTEMPTS))
}

/// Keep the feature table of a `status` response and drop the probe's own
/// query log lines.
pub async fn finish_readiness(ctx: &mut ExecutionContext, body: &[u8]) {
    record_status(ctx, body);
    collect_query_log_silently(ctx).await;
}

fn record_status(ctx: &mut ExecutionContext, body: &[u8]) {
    if let Ok(parsed) = parse_response(body.trim_ascii(), &OutputType::Json) {
        if let Some(body) = parsed.body() {
            ctx.record_server_features(body);
        }
    }
}

async fn collect_query_log_silently(ctx: &mut ExecutionContext) {
    let collect = std::mem::replace(&mut ctx.collect_query_log, false);
    collect_query_log(ctx).await;
    ctx.collect_query_log = collect;
}

/// Send `shutdown` and wait for the process to exit.
pub async fn shutdown<E: Executor + ?Sized>(
    executor: &mut E,
    ctx: &mut ExecutionContext,
    process: Option<&mut Child>,
) -> Result<bool, ExecutorError> {
    let command = Command::build("shutdown", &[]);
    match tokio::time::timeout(ctx.timeout, executor.send_command(&command, ctx)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "shutdown command failed");
            return Ok(false);
        }
        Err(_elapsed) => {
            tracing::warn!(timeout_ms = ctx.timeout.as_millis() as u64, "shutdown command timed out");
            return Ok(false);
        }
    }
    match process {
        Some(child) => wait_for_exit(child, ctx.shutdown_wait_timeout).await,
        None => Ok(true),
    }
}

/// Poll `child` without blocking until it exits or `timeout` passes.
pub async fn wait_for_exit(child: &mut Child, timeout: Duration) -> Result<bool, ExecutorError> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            if !status.success() {
                tracing::warn!(status = %status, "server exited abnormally");
            }
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// User plus system CPU time of this process.
#[cfg(unix)]
pub fn cpu_time() -> Duration {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return Duration::ZERO;
    }
    // SAFETY: initialized by the successful call above.
    let usage = unsafe { usage.assume_init() };
    let to_duration = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    to_duration(usage.ru_utime) + to_duration(usage.ru_stime)
}

#[cfg(not(unix))]
pub fn cpu_time() -> Duration {
    Duration::ZERO
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use grntest_core::{Interface, OnError};

    use super::*;

    /// Replays canned results and remembers what was sent.
    #[derive(Clone, Default)]
    struct ScriptedExecutor {
        responses: Arc<Mutex<VecDeque<Result<Vec<u8>, ExecutorError>>>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedExecutor {
        fn with(responses: Vec<Result<Vec<u8>, ExecutorError>>) -> Self {
            Self {
                responses: Arc::new(Mutex::new(responses.into())),
                sent: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        fn interface(&self) -> Interface {
            Interface::Stdio
        }

        async fn send_command(
            &mut self,
            command: &Command,
            _ctx: &ExecutionContext,
        ) -> Result<Vec<u8>, ExecutorError> {
            self.sent.lock().unwrap().push(command.name().to_string());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Closed.into()))
        }

        fn create_sub_executor(&self) -> Box<dyn Executor> {
            Box::new(self.clone())
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext::new("/suite", "/tmp/grntest-driver")
    }

    fn ok(body: &str) -> Result<Vec<u8>, ExecutorError> {
        Ok(body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn records_echo_and_normalized_output() {
        let mut executor = ScriptedExecutor::with(vec![ok("[[0,1.5,0.1],true]")]);
        let mut ctx = context();
        let command = Command::parse("table_create Foo TABLE_NO_KEY\n").unwrap();
        execute_command(&mut executor, &mut ctx, &command, Some(command.source()))
            .await
            .unwrap();
        assert_eq!(
            ctx.transcript.render(&ctx.normalize_options()),
            "table_create Foo TABLE_NO_KEY\n[[0,0.0,0.0],true]\n"
        );
    }

    #[tokio::test]
    async fn silent_commands_still_record_output() {
        let mut executor = ScriptedExecutor::with(vec![ok("[[0,1.0,2.0],3]")]);
        let mut ctx = context();
        let command = Command::parse("load --table Foo").unwrap();
        execute_command(&mut executor, &mut ctx, &command, None).await.unwrap();
        assert_eq!(ctx.transcript.render(&ctx.normalize_options()), "[[0,0.0,0.0],3]\n");
    }

    #[tokio::test]
    async fn error_status_omits_under_omit_policy() {
        let mut executor = ScriptedExecutor::with(vec![ok(r#"[[-22,1.0,2.0,"bad"],false]"#)]);
        let mut ctx = context();
        ctx.on_error = OnError::Omit;
        let command = Command::parse("select Nope").unwrap();
        let result = execute_command(&mut executor, &mut ctx, &command, Some(b"select Nope".as_slice())).await;
        assert_matches!(result, Err(ExecutorError::Halt(Halt::Omitted(_))));
        assert!(ctx.is_omitted());
    }

    #[tokio::test]
    async fn timeout_is_logged_and_execution_continues() {
        let mut executor = ScriptedExecutor::with(vec![Err(
            TransportError::NoResponse(Duration::from_secs(3)).into()
        )]);
        let mut ctx = context();
        let command = Command::parse("select Foo").unwrap();
        execute_command(&mut executor, &mut ctx, &command, Some(b"select Foo".as_slice()))
            .await
            .unwrap();
        assert_eq!(
            ctx.transcript.render(&ctx.normalize_options()),
            "select Foo\n# error: timeout (3s)\n"
        );
    }

    #[tokio::test]
    async fn transport_failure_unwinds() {
        let mut executor = ScriptedExecutor::with(vec![Err(TransportError::Closed.into())]);
        let mut ctx = context();
        let command = Command::parse("select Foo").unwrap();
        let result = execute_command(&mut executor, &mut ctx, &command, Some(b"select Foo".as_slice())).await;
        assert_matches!(result, Err(ExecutorError::Transport(TransportError::Closed)));
        assert!(ctx
            .transcript
            .render(&ctx.normalize_options())
            .contains("# error: server closed its output"));
    }

    #[tokio::test]
    async fn aborted_context_sends_nothing() {
        let mut executor = ScriptedExecutor::with(vec![ok("[[0,1.0,2.0],true]")]);
        let mut ctx = context();
        ctx.abort("earlier failure");
        let command = Command::parse("status").unwrap();
        let result = execute_command(&mut executor, &mut ctx, &command, Some(b"status".as_slice())).await;
        assert_matches!(result, Err(ExecutorError::Halt(Halt::Aborted(_))));
        assert!(executor.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn benchmark_iterations_repeat_the_command() {
        let mut executor = ScriptedExecutor::with(vec![
            ok("[[0,1.0,2.0],1]"),
            ok("[[0,1.0,2.0],2]"),
            ok("[[0,1.0,2.0],3]"),
        ]);
        let mut ctx = context();
        ctx.benchmark = Some(grntest_core::benchmark::RunningBenchmark::new("b", 3));
        let command = Command::parse("select Foo").unwrap();
        execute_command(&mut executor, &mut ctx, &command, Some(b"select Foo".as_slice()))
            .await
            .unwrap();
        assert_eq!(executor.sent.lock().unwrap().len(), 3);
        let result = ctx.benchmark.take().unwrap().finish();
        assert_eq!(result.n_items, 1);
    }

    #[tokio::test]
    async fn readiness_records_features() {
        let mut executor = ScriptedExecutor::with(vec![
            Err(TransportError::Closed.into()),
            ok(r#"[[0,1.0,2.0],{"features":{"mruby":false}}]"#),
        ]);
        let mut ctx = context();
        ensure_ready(&mut executor, &mut ctx).await.unwrap();
        assert_eq!(ctx.server_features.clone().unwrap().get("mruby"), Some(&false));
    }

    #[test]
    fn slow_commands_get_the_long_wait() {
        let ctx = context();
        let slow = Command::parse("column_create Foo bar COLUMN_SCALAR Int32").unwrap();
        let fast = Command::parse("select Foo").unwrap();
        assert_eq!(first_read_timeout(&slow, &ctx), ctx.long_read_timeout);
        assert_eq!(first_read_timeout(&fast, &ctx), ctx.read_timeout);
        assert_eq!(command_timeout(&fast, &ctx), ctx.timeout);
    }

    #[test]
    fn output_type_resolution() {
        let mut ctx = context();
        ctx.output_type = OutputType::Msgpack;
        let plain = Command::parse("select Foo").unwrap();
        let explicit = Command::parse("select Foo --output_type xml").unwrap();
        let dump = Command::parse("dump").unwrap();
        assert_eq!(resolve_output_type(&plain, &ctx), OutputType::Msgpack);
        assert_eq!(resolve_output_type(&explicit, &ctx), OutputType::Xml);
        assert!(!resolve_output_type(&dump, &ctx).is_structured());
        assert!(needs_output_type_argument(&plain, &ctx));
        assert!(!needs_output_type_argument(&explicit, &ctx));
    }
}
