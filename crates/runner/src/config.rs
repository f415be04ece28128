use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use grntest_core::normalize::DEFAULT_MAX_N_COLUMNS;
use grntest_core::{InputType, Interface, OutputType};
use grntest_executor::context::{
    DEFAULT_LONG_READ_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_SHUTDOWN_WAIT_TIMEOUT, DEFAULT_TIMEOUT,
};

use crate::error::RunnerError;

/// Buffered events per subscriber before the slowest one lags.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tester configuration loaded from environment variables.
///
/// Every field has a default that runs the suite against a `groonga` found
/// on `PATH` over stdio with one worker.
#[derive(Debug, Clone)]
pub struct TesterConfig {
    /// Server binary (default: `groonga`).
    pub groonga: PathBuf,
    pub groonga_suggest_create_dataset: PathBuf,
    pub interface: Interface,
    pub input_type: InputType,
    pub output_type: OutputType,
    /// Name of the server product, matched by `#@require-testee`.
    pub testee: String,
    /// Directory test paths and includes are resolved against.
    pub base_directory: PathBuf,
    pub n_workers: usize,
    /// Extra attempts for a failed test without leaks.
    pub n_retries: u32,
    pub timeout: Duration,
    pub read_timeout: Duration,
    pub long_read_timeout: Duration,
    pub shutdown_wait_timeout: Duration,
    pub max_n_columns: usize,
    /// Archive each test's temporary directory instead of removing it.
    pub keep_database: bool,
    /// An existing database shared by every test instead of a fresh one.
    pub database: Option<PathBuf>,
    /// Run the server under this gdb binary.
    pub gdb: Option<PathBuf>,
    pub valgrind: bool,
    pub stop_on_failure: bool,
    pub suppress_backtrace: bool,
    pub use_http_post: bool,
    pub use_http_chunked: bool,
    pub n_iterations: u32,
    pub plugins_directory: Option<PathBuf>,
    pub plugin_extension: Option<String>,
    pub debug: bool,
    /// Where `.reject` and `.actual` files go. Next to the test when unset.
    pub output_directory: Option<PathBuf>,
    pub event_capacity: usize,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            groonga: PathBuf::from("groonga"),
            groonga_suggest_create_dataset: PathBuf::from("groonga-suggest-create-dataset"),
            interface: Interface::Stdio,
            input_type: InputType::Json,
            output_type: OutputType::Json,
            testee: "groonga".to_string(),
            base_directory: PathBuf::from("."),
            n_workers: 1,
            n_retries: 0,
            timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            long_read_timeout: DEFAULT_LONG_READ_TIMEOUT,
            shutdown_wait_timeout: DEFAULT_SHUTDOWN_WAIT_TIMEOUT,
            max_n_columns: DEFAULT_MAX_N_COLUMNS,
            keep_database: false,
            database: None,
            gdb: None,
            valgrind: false,
            stop_on_failure: false,
            suppress_backtrace: true,
            use_http_post: false,
            use_http_chunked: false,
            n_iterations: 1,
            plugins_directory: None,
            plugin_extension: None,
            debug: false,
            output_directory: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl TesterConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                          |
    /// |----------------------------------|----------------------------------|
    /// | `GRNTEST_GROONGA`                | `groonga`                        |
    /// | `GRNTEST_SUGGEST_CREATE_DATASET` | `groonga-suggest-create-dataset` |
    /// | `GRNTEST_INTERFACE`              | `stdio`                          |
    /// | `GRNTEST_INPUT_TYPE`             | `json`                           |
    /// | `GRNTEST_OUTPUT_TYPE`            | `json`                           |
    /// | `GRNTEST_TESTEE`                 | `groonga`                        |
    /// | `GRNTEST_BASE_DIRECTORY`         | `.`                              |
    /// | `GRNTEST_N_WORKERS`              | `1`                              |
    /// | `GRNTEST_N_RETRIES`              | `0`                              |
    /// | `GRNTEST_TIMEOUT`                | `5` (seconds)                    |
    /// | `GRNTEST_READ_TIMEOUT`           | `3`                              |
    /// | `GRNTEST_LONG_READ_TIMEOUT`      | `180`                            |
    /// | `GRNTEST_SHUTDOWN_WAIT_TIMEOUT`  | `5`                              |
    /// | `GRNTEST_MAX_N_COLUMNS`          | `79`                             |
    /// | `GRNTEST_KEEP_DATABASE`          | `false`                          |
    /// | `GRNTEST_DATABASE`               | unset                            |
    /// | `GRNTEST_GDB`                    | unset (`true` means `gdb`)       |
    /// | `GRNTEST_VALGRIND`               | `false`                          |
    /// | `GRNTEST_STOP_ON_FAILURE`        | `false`                          |
    /// | `GRNTEST_SUPPRESS_BACKTRACE`     | `true`                           |
    /// | `GRNTEST_USE_HTTP_POST`          | `false`                          |
    /// | `GRNTEST_USE_HTTP_CHUNKED`       | `false`                          |
    /// | `GRNTEST_N_ITERATIONS`           | `1`                              |
    /// | `GRNTEST_PLUGINS_DIRECTORY`      | unset                            |
    /// | `GRNTEST_PLUGIN_EXTENSION`       | platform default                 |
    /// | `GRNTEST_DEBUG`                  | `false`                          |
    /// | `GRNTEST_OUTPUT_DIRECTORY`       | unset                            |
    /// | `GRNTEST_EVENT_CAPACITY`         | `1024`                           |
    pub fn from_env() -> Result<Self, RunnerError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RunnerError> {
        let env = Env { lookup: &lookup };
        let defaults = Self::default();

        let gdb = env.string("GRNTEST_GDB").map(|value| match value.as_str() {
            "true" | "1" | "yes" => PathBuf::from("gdb"),
            _ => PathBuf::from(value),
        });
        let gdb = gdb.filter(|path| !matches!(path.to_str(), Some("false" | "0" | "no" | "")));

        let n_workers = env.parsed("GRNTEST_N_WORKERS", defaults.n_workers)?;
        if n_workers == 0 {
            return Err(RunnerError::Config {
                var: "GRNTEST_N_WORKERS",
                value: "0".into(),
                reason: "at least one worker is required".into(),
            });
        }

        let event_capacity = env.parsed("GRNTEST_EVENT_CAPACITY", defaults.event_capacity)?;
        if event_capacity == 0 {
            return Err(RunnerError::Config {
                var: "GRNTEST_EVENT_CAPACITY",
                value: "0".into(),
                reason: "the event buffer needs room for one event".into(),
            });
        }

        Ok(Self {
            groonga: env.path("GRNTEST_GROONGA").unwrap_or(defaults.groonga),
            groonga_suggest_create_dataset: env
                .path("GRNTEST_SUGGEST_CREATE_DATASET")
                .unwrap_or(defaults.groonga_suggest_create_dataset),
            interface: env.parsed("GRNTEST_INTERFACE", defaults.interface)?,
            input_type: env.parsed("GRNTEST_INPUT_TYPE", defaults.input_type)?,
            output_type: env
                .string("GRNTEST_OUTPUT_TYPE")
                .map(|name| output_type(&name))
                .transpose()?
                .unwrap_or(defaults.output_type),
            testee: env.string("GRNTEST_TESTEE").unwrap_or(defaults.testee),
            base_directory: env.path("GRNTEST_BASE_DIRECTORY").unwrap_or(defaults.base_directory),
            n_workers,
            n_retries: env.parsed("GRNTEST_N_RETRIES", defaults.n_retries)?,
            timeout: env.seconds("GRNTEST_TIMEOUT", defaults.timeout)?,
            read_timeout: env.seconds("GRNTEST_READ_TIMEOUT", defaults.read_timeout)?,
            long_read_timeout: env.seconds("GRNTEST_LONG_READ_TIMEOUT", defaults.long_read_timeout)?,
            shutdown_wait_timeout: env
                .seconds("GRNTEST_SHUTDOWN_WAIT_TIMEOUT", defaults.shutdown_wait_timeout)?,
            max_n_columns: env.parsed("GRNTEST_MAX_N_COLUMNS", defaults.max_n_columns)?,
            keep_database: env.flag("GRNTEST_KEEP_DATABASE", defaults.keep_database)?,
            database: env.path("GRNTEST_DATABASE"),
            gdb,
            valgrind: env.flag("GRNTEST_VALGRIND", defaults.valgrind)?,
            stop_on_failure: env.flag("GRNTEST_STOP_ON_FAILURE", defaults.stop_on_failure)?,
            suppress_backtrace: env.flag("GRNTEST_SUPPRESS_BACKTRACE", defaults.suppress_backtrace)?,
            use_http_post: env.flag("GRNTEST_USE_HTTP_POST", defaults.use_http_post)?,
            use_http_chunked: env.flag("GRNTEST_USE_HTTP_CHUNKED", defaults.use_http_chunked)?,
            n_iterations: env.parsed("GRNTEST_N_ITERATIONS", defaults.n_iterations)?,
            plugins_directory: env.path("GRNTEST_PLUGINS_DIRECTORY"),
            plugin_extension: env.string("GRNTEST_PLUGIN_EXTENSION"),
            debug: env.flag("GRNTEST_DEBUG", defaults.debug)?,
            output_directory: env.path("GRNTEST_OUTPUT_DIRECTORY"),
            event_capacity,
        })
    }
}

fn output_type(name: &str) -> Result<OutputType, RunnerError> {
    match OutputType::from_name(name) {
        OutputType::Other(_) => Err(RunnerError::Config {
            var: "GRNTEST_OUTPUT_TYPE",
            value: name.to_string(),
            reason: "expected json, msgpack, xml or apache-arrow".into(),
        }),
        known => Ok(known),
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|value| !value.is_empty())
    }

    fn path(&self, var: &str) -> Option<PathBuf> {
        self.string(var).map(PathBuf::from)
    }

    fn parsed<T>(&self, var: &'static str, default: T) -> Result<T, RunnerError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| RunnerError::Config {
                var,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn seconds(&self, var: &'static str, default: Duration) -> Result<Duration, RunnerError> {
        match self.string(var) {
            None => Ok(default),
            Some(value) => value
                .parse::<f64>()
                .ok()
                .and_then(|seconds| Duration::try_from_secs_f64(seconds).ok())
                .ok_or_else(|| RunnerError::Config {
                    var,
                    value,
                    reason: "expected a non-negative number of seconds".into(),
                }),
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, RunnerError> {
        match self.string(var).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(RunnerError::Config {
                var,
                value: other.to_string(),
                reason: "expected true or false".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
