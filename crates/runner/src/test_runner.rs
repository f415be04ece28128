//! Runs one test script end to end and decides its status.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use grntest_core::log::parse_log;
use grntest_core::log_filter::{leak_count, LogFilter};
use grntest_core::normalize::normalize_line_ending_bytes;
use grntest_core::transcript::Record;
use grntest_executor::{run_test, ExecutionContext, RunOutcome};

use crate::config::TesterConfig;
use crate::error::RunnerError;
use crate::result::{TestResult, TestStatus};
use crate::server::{self, ServerProcess};

/// Marker of a script-declared server environment variable (`#$NAME=value`).
const ENVIRONMENT_PREFIX: &str = "#$";

/// One queued test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestEntry {
    pub suite: String,
    pub name: String,
    pub path: PathBuf,
}

impl TestEntry {
    /// Suite and name are derived from the path relative to `base`.
    pub fn new(base: &Path, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let relative = path.strip_prefix(base).unwrap_or(&path);
        let suite = relative
            .parent()
            .map(|parent| parent.display().to_string())
            .filter(|parent| !parent.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let name = relative.with_extension("").display().to_string();
        Self { suite, name, path }
    }
}

/// Build the execution context for one test from the configuration.
pub fn build_context(config: &TesterConfig, temporary_directory: PathBuf) -> ExecutionContext {
    let mut ctx = ExecutionContext::new(&config.base_directory, temporary_directory).with_timeouts(
        config.timeout,
        config.read_timeout,
        config.long_read_timeout,
    );
    if let Some(database) = &config.database {
        ctx.db_path = database.clone();
    }
    ctx.groonga = config.groonga.clone();
    ctx.groonga_suggest_create_dataset = config.groonga_suggest_create_dataset.clone();
    ctx.testee = config.testee.clone();
    ctx.interface = config.interface;
    ctx.input_type = config.input_type;
    ctx.output_type = config.output_type.clone();
    ctx.shutdown_wait_timeout = config.shutdown_wait_timeout;
    ctx.max_n_columns = config.max_n_columns;
    ctx.use_http_post = config.use_http_post;
    ctx.use_http_chunked = config.use_http_chunked;
    ctx.n_iterations = config.n_iterations;
    ctx.debug = config.debug;
    ctx.plugins_directory = config.plugins_directory.clone();
    if let Some(extension) = &config.plugin_extension {
        ctx.plugin_extension = extension.clone();
    }
    ctx.log_filter = LogFilter::new(config.suppress_backtrace);
    ctx
}

/// Collect `#$NAME=value` lines. Values go through variable expansion.
pub fn extract_environment(script: &str, ctx: &ExecutionContext) -> BTreeMap<String, String> {
    script
        .lines()
        .filter_map(|line| line.strip_prefix(ENVIRONMENT_PREFIX)?.split_once('='))
        .filter(|(name, _)| is_variable_name(name))
        .map(|(name, value)| (name.to_string(), ctx.expand(value)))
        .collect()
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Run `entry` against a freshly spawned server.
pub async fn run_test_file(
    config: &TesterConfig,
    worker_id: usize,
    entry: &TestEntry,
) -> Result<TestResult, RunnerError> {
    let started = Instant::now();
    let script = match tokio::fs::read(&entry.path).await {
        Ok(script) => String::from_utf8_lossy(&script).into_owned(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(grntest_executor::ExecutorError::ScriptNotFound(entry.path.clone()).into());
        }
        Err(e) => return Err(e.into()),
    };

    let tmp = config.base_directory.join("tmp").join(worker_id.to_string());
    server::prepare_temporary_directory(&tmp).await?;
    let mut ctx = build_context(config, tmp.clone());
    ctx.env = extract_environment(&script, &ctx);

    let outcome = converse(config, &mut ctx, entry).await;
    ctx.close_logs();
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            server::finish_temporary_directory(config, &tmp, &entry.name).await?;
            return Err(e);
        }
    };

    let n_leaked_objects = read_leak_count(&ctx).await;
    if n_leaked_objects > 0 {
        ctx.transcript.push(Record::LeakCount(n_leaked_objects));
    }
    let actual = ctx.transcript.render_bytes(&ctx.normalize_options());
    let expected = read_optional(&entry.path.with_extension("expected"))
        .await?
        .map(|bytes| normalize_line_ending_bytes(&bytes));

    let (omit_reason, abort_reason) = match &outcome {
        RunOutcome::Completed => (None, None),
        RunOutcome::Omitted(reason) => (Some(reason.clone()), None),
        RunOutcome::Aborted(reason) => (None, Some(reason.clone())),
    };
    let status = TestStatus::decide(
        omit_reason.is_some(),
        expected.as_deref(),
        &actual,
        n_leaked_objects,
    );
    let actual_text = String::from_utf8_lossy(&actual).into_owned();
    let expected_text = expected.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    write_artifacts(config, &entry.path, status, &actual).await?;
    server::finish_temporary_directory(config, &tmp, &entry.name).await?;

    tracing::debug!(
        test = %entry.name,
        status = status.as_str(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "test finished"
    );
    Ok(TestResult {
        suite: entry.suite.clone(),
        name: entry.name.clone(),
        path: entry.path.clone(),
        status,
        actual: actual_text,
        expected: expected_text,
        n_leaked_objects,
        omit_reason,
        abort_reason,
        elapsed: started.elapsed(),
        benchmarks: std::mem::take(&mut ctx.benchmarks),
    })
}

/// Create the database, spawn the server, run the script and stop the
/// server again. The server is stopped on every path out of here.
async fn converse(
    config: &TesterConfig,
    ctx: &mut ExecutionContext,
    entry: &TestEntry,
) -> Result<RunOutcome, RunnerError> {
    server::create_database(config, ctx).await?;
    let (process, mut executor) = ServerProcess::spawn(config, ctx).await?;
    tracing::debug!(test = %entry.name, pid = ?process.id(), "server started");
    ctx.open_logs();

    let outcome = match executor.ensure_ready(ctx).await {
        Ok(()) => run_test(&mut *executor, ctx, &entry.path).await,
        Err(e) => {
            tracing::error!(test = %entry.name, error = %e, "server did not become ready");
            ctx.log_error(format!("# error: {e}"));
            let reason = e.to_string();
            ctx.abort(reason.clone());
            Ok(RunOutcome::Aborted(reason))
        }
    };

    if !process.stop(&mut *executor, ctx).await {
        tracing::warn!(test = %entry.name, "server did not shut down cleanly");
    }
    Ok(outcome?)
}

async fn read_leak_count(ctx: &ExecutionContext) -> u32 {
    match tokio::fs::read(ctx.log_path()).await {
        Ok(log) => leak_count(&parse_log(&String::from_utf8_lossy(&log))).unwrap_or(0),
        Err(_) => 0,
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, RunnerError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Path of a result artifact (`reject`, `actual`) for `test_path`.
pub fn artifact_path(config: &TesterConfig, test_path: &Path, extension: &str) -> PathBuf {
    let file_name = test_path.with_extension(extension);
    match (&config.output_directory, file_name.file_name()) {
        (Some(directory), Some(file_name)) => directory.join(file_name),
        _ => file_name,
    }
}

async fn write_artifacts(
    config: &TesterConfig,
    test_path: &Path,
    status: TestStatus,
    actual: &[u8],
) -> Result<(), RunnerError> {
    let reject = artifact_path(config, test_path, "reject");
    let actual_path = artifact_path(config, test_path, "actual");
    if let Some(directory) = &config.output_directory {
        tokio::fs::create_dir_all(directory).await?;
    }
    match status {
        TestStatus::Success => remove_stale(&reject).await?,
        TestStatus::Failure => tokio::fs::write(&reject, actual).await?,
        TestStatus::Leaked | TestStatus::NotChecked => {
            tokio::fs::write(&actual_path, actual).await?
        }
        TestStatus::Omitted => {}
    }
    Ok(())
}

async fn remove_stale(path: &Path) -> Result<(), RunnerError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_take_suite_from_directory() {
        let entry = TestEntry::new(Path::new("/suite"), "/suite/select/filter/basic.test");
        assert_eq!(entry.suite, "select/filter");
        assert_eq!(entry.name, "select/filter/basic");

        let entry = TestEntry::new(Path::new("/suite"), "/suite/top.test");
        assert_eq!(entry.suite, ".");
        assert_eq!(entry.name, "top");
    }

    #[test]
    fn environment_lines_are_expanded() {
        let ctx = ExecutionContext::new("/suite", "/suite/tmp");
        let script = "#$GRN_ENABLE_X=yes\n#$DATA=#{base_directory}/data\n#$1BAD=no\n#@timeout 1\nstatus\n";
        let env = extract_environment(script, &ctx);
        assert_eq!(
            env,
            BTreeMap::from([
                ("DATA".to_string(), "/suite/data".to_string()),
                ("GRN_ENABLE_X".to_string(), "yes".to_string()),
            ])
        );
    }

    #[test]
    fn context_follows_configuration() {
        let config = TesterConfig {
            database: Some(PathBuf::from("/shared/db")),
            suppress_backtrace: false,
            ..TesterConfig::default()
        };
        let ctx = build_context(&config, PathBuf::from("/suite/tmp/0"));
        assert_eq!(ctx.db_path, PathBuf::from("/shared/db"));
        assert!(!ctx.log_filter.suppress_backtrace());
        assert_eq!(ctx.default_timeout, config.timeout);
    }

    #[test]
    fn artifacts_go_to_output_directory() {
        let mut config = TesterConfig::default();
        let test = Path::new("/suite/select/basic.test");
        assert_eq!(
            artifact_path(&config, test, "reject"),
            PathBuf::from("/suite/select/basic.reject")
        );
        config.output_directory = Some(PathBuf::from("/out"));
        assert_eq!(artifact_path(&config, test, "actual"), PathBuf::from("/out/basic.actual"));
    }
}
