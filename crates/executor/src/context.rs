//! Per-test execution state, passed explicitly to the interpreter and the
//! executors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grntest_core::benchmark::{BenchmarkResult, RunningBenchmark};
use grntest_core::log::parse_log;
use grntest_core::log_filter::LogFilter;
use grntest_core::normalize::NormalizeOptions;
use grntest_core::query_log::QueryLogParser;
use grntest_core::substitution::Substitutions;
use grntest_core::template::expand_variables;
use grntest_core::transcript::{render_log_entry, Transcript};
use grntest_core::{InputType, Interface, OnError, OutputType};
use serde_json::Value;

use crate::error::Halt;
use crate::log_tail::LogTail;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_LONG_READ_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_SHUTDOWN_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// State of one test run. Created per test file and never shared between
/// concurrently running tests.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Where suite-relative paths such as `#@include` targets resolve.
    pub base_directory: PathBuf,
    /// Scratch directory owned by this run, removed or archived afterwards.
    pub temporary_directory: PathBuf,
    pub db_path: PathBuf,
    /// Exposed to scripts as `#{plugins_directory}`.
    pub plugins_directory: Option<PathBuf>,
    /// Shared-object suffix without the dot, exposed as `#{plugin_extension}`.
    pub plugin_extension: String,
    /// Server binary.
    pub groonga: PathBuf,
    pub groonga_suggest_create_dataset: PathBuf,
    /// Name of the program under test, e.g. `groonga` or `groonga-httpd`.
    pub testee: String,
    pub interface: Interface,
    pub input_type: InputType,
    pub output_type: OutputType,
    /// Cleared by `#@disable-logging`; suppresses transcript records.
    pub logging: bool,
    pub on_error: OnError,

    /// Budget for a whole command, set by `#@timeout`.
    pub timeout: Duration,
    pub default_timeout: Duration,
    /// Wait for each chunk of a response after the first.
    pub read_timeout: Duration,
    pub default_read_timeout: Duration,
    /// First-chunk wait for commands known to be slow.
    pub long_read_timeout: Duration,
    pub default_long_read_timeout: Duration,
    pub shutdown_wait_timeout: Duration,

    pub debug: bool,
    /// Append query log statistics after each command.
    pub collect_query_log: bool,
    /// Repetitions of each command inside a benchmark.
    pub n_iterations: u32,
    pub sleep_after_command: Option<Duration>,
    pub use_http_post: bool,
    pub use_http_chunked: bool,
    pub max_n_columns: usize,
    /// Extra environment declared by the script with `#$NAME=value`.
    pub env: BTreeMap<String, String>,

    /// Everything the run produced, in order.
    pub transcript: Transcript,
    pub log_filter: LogFilter,
    pub substitutions: Substitutions,
    pub query_log_parser: QueryLogParser,
    /// Open `#@benchmark` block, if any.
    pub benchmark: Option<RunningBenchmark>,
    pub benchmarks: Vec<BenchmarkResult>,
    /// `features` object of the readiness `status` response.
    pub server_features: Option<BTreeMap<String, bool>>,

    log: Option<LogTail>,
    query_log: Option<LogTail>,
    aborted: Option<String>,
    omitted: Option<String>,
    /// Include nesting; zero at the top-level script.
    depth: usize,
}

impl ExecutionContext {
    pub fn new(base_directory: impl Into<PathBuf>, temporary_directory: impl Into<PathBuf>) -> Self {
        let temporary_directory = temporary_directory.into();
        let db_path = temporary_directory.join("db").join("db");
        Self {
            base_directory: base_directory.into(),
            temporary_directory,
            db_path,
            plugins_directory: None,
            plugin_extension: default_plugin_extension().to_string(),
            groonga: PathBuf::from("groonga"),
            groonga_suggest_create_dataset: PathBuf::from("groonga-suggest-create-dataset"),
            testee: "groonga".to_string(),
            interface: Interface::Stdio,
            input_type: InputType::Json,
            output_type: OutputType::Json,
            logging: true,
            on_error: OnError::Default,
            timeout: DEFAULT_TIMEOUT,
            default_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            default_read_timeout: DEFAULT_READ_TIMEOUT,
            long_read_timeout: DEFAULT_LONG_READ_TIMEOUT,
            default_long_read_timeout: DEFAULT_LONG_READ_TIMEOUT,
            shutdown_wait_timeout: DEFAULT_SHUTDOWN_WAIT_TIMEOUT,
            debug: false,
            collect_query_log: false,
            n_iterations: 1,
            sleep_after_command: None,
            use_http_post: false,
            use_http_chunked: false,
            max_n_columns: grntest_core::normalize::DEFAULT_MAX_N_COLUMNS,
            env: BTreeMap::new(),
            transcript: Transcript::new(),
            log_filter: LogFilter::default(),
            substitutions: Substitutions::default(),
            query_log_parser: QueryLogParser::new(),
            benchmark: None,
            benchmarks: Vec::new(),
            server_features: None,
            log: None,
            query_log: None,
            aborted: None,
            omitted: None,
            depth: 0,
        }
    }

    /// Set all three timeouts and remember them as the `default` values
    /// directives restore.
    pub fn with_timeouts(mut self, timeout: Duration, read: Duration, long_read: Duration) -> Self {
        self.timeout = timeout;
        self.default_timeout = timeout;
        self.read_timeout = read;
        self.default_read_timeout = read;
        self.long_read_timeout = long_read;
        self.default_long_read_timeout = long_read;
        self
    }

    pub fn db_directory(&self) -> PathBuf {
        self.db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.temporary_directory.clone())
    }

    pub fn log_path(&self) -> PathBuf {
        self.temporary_directory.join("groonga.log")
    }

    pub fn query_log_path(&self) -> PathBuf {
        self.temporary_directory.join("groonga.query.log")
    }

    /// Start tailing the log files the server was told to write.
    pub fn open_logs(&mut self) {
        self.log = Some(LogTail::new(self.log_path()));
        self.query_log = Some(LogTail::new(self.query_log_path()));
    }

    /// Close the log handles. Safe to call more than once.
    pub fn close_logs(&mut self) {
        if let Some(mut log) = self.log.take() {
            log.close();
        }
        if let Some(mut query_log) = self.query_log.take() {
            query_log.close();
        }
    }

    pub fn log_tail(&mut self) -> Option<&mut LogTail> {
        self.log.as_mut()
    }

    pub fn query_log_tail(&mut self) -> Option<&mut LogTail> {
        self.query_log.as_mut()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_top_level(&self) -> bool {
        self.depth == 0
    }

    pub fn enter_include(&mut self) {
        self.depth += 1;
    }

    pub fn leave_include(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    /// Mark the run aborted. Only the first reason is kept.
    pub fn abort(&mut self, reason: impl Into<String>) -> Halt {
        let reason = reason.into();
        if self.aborted.is_none() {
            tracing::debug!(reason = %reason, "test run aborted");
            self.aborted = Some(reason.clone());
        }
        Halt::Aborted(reason)
    }

    pub fn is_omitted(&self) -> bool {
        self.omitted.is_some()
    }

    pub fn omit_reason(&self) -> Option<&str> {
        self.omitted.as_deref()
    }

    pub fn omit(&mut self, reason: impl Into<String>) -> Halt {
        let reason = reason.into();
        if self.omitted.is_none() {
            self.omitted = Some(reason.clone());
        }
        Halt::Omitted(reason)
    }

    /// What an error means under the current `on-error` policy.
    pub fn apply_error_policy(&mut self) -> Result<(), Halt> {
        match self.on_error {
            OnError::Default => Ok(()),
            OnError::Omit => Err(self.omit("error")),
        }
    }

    /// Harness error line, ignored while logging is disabled.
    pub fn log_error(&mut self, text: impl Into<String>) {
        if self.logging {
            self.transcript.push_error(text);
        }
    }

    pub fn log_input(&mut self, source: impl Into<Vec<u8>>) {
        if self.logging {
            self.transcript.push_input(source);
        }
    }

    /// Expand the path variables (`#{db_path}`, `#{db_directory}`,
    /// `#{base_directory}`, `#{plugins_directory}`) and `#{plugin_extension}`.
    /// `#{plugins_directory}` stays literal when no directory is configured.
    pub fn expand(&self, text: &str) -> String {
        expand_variables(text, |name| match name {
            "db_path" => Some(self.db_path.display().to_string()),
            "db_directory" => Some(self.db_directory().display().to_string()),
            "base_directory" => Some(self.base_directory.display().to_string()),
            "plugins_directory" => self
                .plugins_directory
                .as_ref()
                .map(|directory| directory.display().to_string()),
            "plugin_extension" => Some(self.plugin_extension.clone()),
            _ => None,
        })
    }

    /// Normalization settings for this run's paths.
    pub fn normalize_options(&self) -> NormalizeOptions {
        NormalizeOptions::new(self.max_n_columns)
            .with_path(self.db_directory().display().to_string(), "#{db_directory}")
            .with_path(self.base_directory.display().to_string(), "#{base_directory}")
            .with_path(self.temporary_directory.display().to_string(), "#{temporary_directory}")
    }

    /// Read new server log lines and surface the important ones.
    pub async fn tail_server_log(&mut self) {
        let Some(tail) = self.log.as_mut() else {
            return;
        };
        let text = match tail.read_new_lines().await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read server log");
                return;
            }
        };
        if text.is_empty() {
            return;
        }
        let entries = self.log_filter.filter(parse_log(&text));
        for entry in entries {
            let rendered = render_log_entry(&entry);
            self.log_error(rendered);
        }
    }

    /// Everything left in the server log, unfiltered.
    pub async fn pending_server_log(&mut self) -> String {
        let Some(tail) = self.log.as_mut() else {
            return String::new();
        };
        match tail.read_all_pending().await {
            Ok(text) => parse_log(&text).iter().map(render_log_entry).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read server log");
                String::new()
            }
        }
    }

    /// Remember the `features` object of a `status` response body.
    pub fn record_server_features(&mut self, body: &Value) {
        if let Some(Value::Object(features)) = body.get("features") {
            self.server_features = Some(
                features
                    .iter()
                    .map(|(name, enabled)| (name.clone(), enabled.as_bool().unwrap_or(false)))
                    .collect(),
            );
        }
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.close_logs();
    }
}

fn default_plugin_extension() -> &'static str {
    if cfg!(windows) {
        "dll"
    } else {
        "so"
    }
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
    fn expands_paths() {
        let ctx = ExecutionContext::new("/suite", "/tmp/run");
        assert_eq!(
            ctx.expand("#{db_path} #{db_directory} #{base_directory} #{other}"),
            "/tmp/run/db/db /tmp/run/db /suite #{other}"
        );
    }

    #[test]
    fn expands_plugin_location() {
        let mut ctx = ExecutionContext::new("/suite", "/tmp/run");
        ctx.plugin_extension = "dylib".into();
        assert_eq!(ctx.expand("#{plugins_directory}/x.#{plugin_extension}"), "#{plugins_directory}/x.dylib");

        ctx.plugins_directory = Some(PathBuf::from("/opt/plugins"));
        assert_eq!(ctx.expand("#{plugins_directory}/x.#{plugin_extension}"), "/opt/plugins/x.dylib");
    }

    #[test]
    fn abort_keeps_first_reason() {
        let mut ctx = ExecutionContext::new("/suite", "/tmp/run");
        assert_matches!(ctx.abort("first"), Halt::Aborted(r) if r == "first");
        ctx.abort("second");
        assert_eq!(ctx.abort_reason(), Some("first"));
    }

    #[test]
    fn error_policy() {
        let mut ctx = ExecutionContext::new("/suite", "/tmp/run");
        assert!(ctx.apply_error_policy().is_ok());
        assert!(!ctx.is_omitted());
        ctx.on_error = OnError::Omit;
        assert_matches!(ctx.apply_error_policy(), Err(Halt::Omitted(_)));
        assert!(ctx.is_omitted());
    }

    #[test]
    fn logging_toggle_gates_transcript() {
        let mut ctx = ExecutionContext::new("/suite", "/tmp/run");
        ctx.logging = false;
        ctx.log_error("hidden");
        ctx.log_input("hidden");
        assert!(ctx.transcript.is_empty());
        ctx.logging = true;
        ctx.log_error("shown");
        assert_eq!(ctx.transcript.len(), 1);
    }

    #[test]
    fn server_features() {
        let mut ctx = ExecutionContext::new("/suite", "/tmp/run");
        ctx.record_server_features(&json!({"features": {"mruby": false, "zstd": true}}));
        let features = ctx.server_features.clone().unwrap();
        assert_eq!(features.get("mruby"), Some(&false));
        assert_eq!(features.get("zstd"), Some(&true));
    }

    #[tokio::test]
    async fn surfaces_important_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ExecutionContext::new(dir.path(), dir.path());
        ctx.open_logs();
        std::fs::write(
            ctx.log_path(),
            "2024-01-01 00:00:00.000000|n| grn_init\n2024-01-01 00:00:00.000001|e| broken\n",
        )
        .unwrap();
        ctx.tail_server_log().await;
        assert_eq!(ctx.transcript.render(&ctx.normalize_options()), "#|e| broken\n");
    }
}
