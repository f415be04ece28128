//! Directive registry and handlers.
//!
//! Every directive name maps to one [`DirectiveKind`] through [`REGISTRY`];
//! names missing from it take the single unknown-directive path. Handlers
//! report malformed arguments into the transcript and keep going. Only
//! halts and command-level failures stop the script.

use std::path::{Path, PathBuf};
use std::time::Duration;

use grntest_core::benchmark::RunningBenchmark;
use grntest_core::log::LogLevel;
use grntest_core::substitution::Substitution;
use grntest_core::{Command, Directive, DirectiveError, InputType, Interface, OnError, OutputType};

use crate::context::ExecutionContext;
use crate::error::{ExecutorError, Halt};
use crate::executor::{execute_command, Executor};

use super::{run_script, series};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    DisableLogging,
    EnableLogging,
    SuggestCreateDataset,
    Include,
    CopyPath,
    Timeout,
    ReadTimeout,
    LongReadTimeout,
    OnError,
    Omit,
    AddImportantLogLevels,
    RemoveImportantLogLevels,
    Sleep,
    SleepAfterCommand,
    CollectQueryLog,
    GenerateSeries,
    Eval,
    RequireInputType,
    RequireTestee,
    RequireInterface,
    RequireApacheArrow,
    RequireFeature,
    RequirePlatform,
    RequireOs,
    RequireCpu,
    RequireEnv,
    AddIgnoreLogPattern,
    RemoveIgnoreLogPattern,
    AddSubstitution,
    RemoveSubstitution,
    StartBenchmark,
    FinishBenchmark,
}

pub const REGISTRY: &[(&str, DirectiveKind)] = &[
    ("disable-logging", DirectiveKind::DisableLogging),
    ("enable-logging", DirectiveKind::EnableLogging),
    ("suggest-create-dataset", DirectiveKind::SuggestCreateDataset),
    ("include", DirectiveKind::Include),
    ("copy-path", DirectiveKind::CopyPath),
    ("timeout", DirectiveKind::Timeout),
    ("read-timeout", DirectiveKind::ReadTimeout),
    ("long-read-timeout", DirectiveKind::LongReadTimeout),
    ("on-error", DirectiveKind::OnError),
    ("omit", DirectiveKind::Omit),
    ("add-important-log-levels", DirectiveKind::AddImportantLogLevels),
    ("remove-important-log-levels", DirectiveKind::RemoveImportantLogLevels),
    ("sleep", DirectiveKind::Sleep),
    ("sleep-after-command", DirectiveKind::SleepAfterCommand),
    ("collect-query-log", DirectiveKind::CollectQueryLog),
    ("generate-series", DirectiveKind::GenerateSeries),
    ("eval", DirectiveKind::Eval),
    ("require-input-type", DirectiveKind::RequireInputType),
    ("require-testee", DirectiveKind::RequireTestee),
    ("require-interface", DirectiveKind::RequireInterface),
    ("require-apache-arrow", DirectiveKind::RequireApacheArrow),
    ("require-feature", DirectiveKind::RequireFeature),
    ("require-platform", DirectiveKind::RequirePlatform),
    ("require-os", DirectiveKind::RequireOs),
    ("require-cpu", DirectiveKind::RequireCpu),
    ("require-env", DirectiveKind::RequireEnv),
    ("add-ignore-log-pattern", DirectiveKind::AddIgnoreLogPattern),
    ("remove-ignore-log-pattern", DirectiveKind::RemoveIgnoreLogPattern),
    ("add-substitution", DirectiveKind::AddSubstitution),
    ("remove-substitution", DirectiveKind::RemoveSubstitution),
    ("start-benchmark", DirectiveKind::StartBenchmark),
    ("finish-benchmark", DirectiveKind::FinishBenchmark),
];

pub fn lookup(name: &str) -> Option<DirectiveKind> {
    REGISTRY
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, kind)| *kind)
}

/// Why a handler stopped early.
enum Failure {
    /// Bad arguments. Reported, never fatal.
    Invalid(DirectiveError),
    /// Propagates out of the script.
    Stop(ExecutorError),
}

impl From<ExecutorError> for Failure {
    fn from(e: ExecutorError) -> Self {
        Self::Stop(e)
    }
}

impl From<Halt> for Failure {
    fn from(halt: Halt) -> Self {
        Self::Stop(halt.into())
    }
}

type Handled = Result<(), Failure>;

/// Echo the directive line and the error message into the transcript.
pub fn report(ctx: &mut ExecutionContext, line: &str, error: &DirectiveError) {
    tracing::debug!(error = %error, "directive error");
    ctx.log_input(line);
    ctx.log_error(format!("#|e| {error}"));
}

/// Run one parsed directive. `line` is its raw source line.
pub async fn execute(
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    directive: &Directive,
    line: &str,
) -> Result<(), ExecutorError> {
    let Some(kind) = lookup(&directive.name) else {
        report(ctx, line, &DirectiveError::invalid(&directive.name, "unknown directive"));
        return Ok(());
    };

    let args = Args {
        name: &directive.name,
        options: directive.options.iter().map(|option| ctx.expand(option)).collect(),
    };
    let content = ctx.expand(&directive.content);

    match dispatch(kind, executor, ctx, &args, &content).await {
        Ok(()) => Ok(()),
        Err(Failure::Invalid(e)) => {
            report(ctx, line, &e);
            Ok(())
        }
        Err(Failure::Stop(e)) => Err(e),
    }
}

async fn dispatch(
    kind: DirectiveKind,
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    args: &Args<'_>,
    content: &str,
) -> Handled {
    use DirectiveKind as K;

    match kind {
        K::DisableLogging => ctx.logging = false,
        K::EnableLogging => ctx.logging = true,
        K::SuggestCreateDataset => suggest_create_dataset(ctx, args).await?,
        K::Include => include(executor, ctx, args).await?,
        K::CopyPath => copy_path(ctx, args).await?,
        K::Timeout => ctx.timeout = parse_timeout(args, ctx.default_timeout)?,
        K::ReadTimeout => ctx.read_timeout = parse_timeout(args, ctx.default_read_timeout)?,
        K::LongReadTimeout => {
            ctx.long_read_timeout = parse_timeout(args, ctx.default_long_read_timeout)?
        }
        K::OnError => {
            let policy = args.required(0, "policy")?;
            ctx.on_error = policy
                .parse::<OnError>()
                .map_err(|_| args.invalid(format!("invalid on-error policy: <{policy}>")))?;
        }
        K::Omit => {
            let reason = args.options.join(" ");
            return Err(ctx.omit(reason).into());
        }
        K::AddImportantLogLevels | K::RemoveImportantLogLevels => {
            let levels = args
                .options
                .iter()
                .map(|name| {
                    LogLevel::from_name(name)
                        .ok_or_else(|| args.invalid(format!("unknown log level: <{name}>")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            for level in levels {
                if kind == K::AddImportantLogLevels {
                    ctx.log_filter.add_important_level(level);
                } else {
                    ctx.log_filter.remove_important_level(level);
                }
            }
        }
        K::Sleep => {
            let seconds = args.seconds(0)?;
            tokio::time::sleep(seconds).await;
        }
        K::SleepAfterCommand => {
            ctx.sleep_after_command = match args.option(0) {
                None | Some("default") => None,
                Some(_) => Some(args.seconds(0)?),
            };
        }
        K::CollectQueryLog => {
            ctx.collect_query_log = match args.required(0, "true or false")? {
                "true" => true,
                "false" => false,
                other => return Err(args.invalid(format!("invalid boolean: <{other}>"))),
            };
        }
        K::GenerateSeries => generate_series(executor, ctx, args).await?,
        K::Eval => eval(executor, ctx, args, content).await?,
        K::RequireInputType => {
            let (negated, wanted) = args.requirement(0, "input type")?;
            let satisfied = wanted.parse::<InputType>().ok() == Some(ctx.input_type);
            require(ctx, satisfied != negated, "input type", wanted, negated)?;
        }
        K::RequireTestee => {
            let (negated, wanted) = args.requirement(0, "testee")?;
            let satisfied = ctx.testee == wanted;
            require(ctx, satisfied != negated, "testee", wanted, negated)?;
        }
        K::RequireInterface => {
            let (negated, wanted) = args.requirement(0, "interface")?;
            let satisfied = wanted.parse::<Interface>().ok() == Some(ctx.interface);
            require(ctx, satisfied != negated, "interface", wanted, negated)?;
        }
        K::RequireApacheArrow => {
            let satisfied = cfg!(feature = "apache-arrow") && server_feature(ctx, "apache_arrow");
            require(ctx, satisfied, "Apache Arrow support", "", false)?;
        }
        K::RequireFeature => {
            let (negated, wanted) = args.requirement(0, "feature")?;
            let satisfied = server_feature(ctx, wanted);
            require(ctx, satisfied != negated, "feature", wanted, negated)?;
        }
        K::RequirePlatform => {
            let (negated, wanted) = args.requirement(0, "platform")?;
            let satisfied = wanted == std::env::consts::FAMILY;
            require(ctx, satisfied != negated, "platform", wanted, negated)?;
        }
        K::RequireOs => {
            let (negated, wanted) = args.requirement(0, "OS")?;
            let satisfied = wanted == std::env::consts::OS;
            require(ctx, satisfied != negated, "OS", wanted, negated)?;
        }
        K::RequireCpu => {
            let (negated, wanted) = args.requirement(0, "CPU")?;
            let satisfied = wanted == std::env::consts::ARCH;
            require(ctx, satisfied != negated, "CPU", wanted, negated)?;
        }
        K::RequireEnv => {
            let (negated, wanted) = args.requirement(0, "environment variable")?;
            let satisfied = ctx.env.contains_key(wanted) || std::env::var_os(wanted).is_some();
            require(ctx, satisfied != negated, "environment variable", wanted, negated)?;
        }
        K::AddIgnoreLogPattern => {
            let pattern = strip_slashes(args.required(0, "pattern")?);
            ctx.log_filter
                .add_ignore_pattern(pattern)
                .map_err(|e| args.invalid(e.to_string()))?;
        }
        K::RemoveIgnoreLogPattern => {
            let pattern = strip_slashes(args.required(0, "pattern")?);
            ctx.log_filter.remove_ignore_pattern(pattern);
        }
        K::AddSubstitution => {
            let name = args.required(0, "name")?;
            let pattern = args.required(1, "pattern")?;
            let input = args.required(2, "substitution")?;
            let normalized = args.option(3).unwrap_or(input);
            let rule = Substitution::new(name, pattern, input, normalized)
                .map_err(|e| args.invalid(e.to_string()))?;
            ctx.substitutions.add(rule);
        }
        K::RemoveSubstitution => {
            let name = args.required(0, "name")?;
            if !ctx.substitutions.remove(name) {
                return Err(args.invalid(format!("no such substitution: <{name}>")));
            }
        }
        K::StartBenchmark => {
            let n_iterations = args.required(0, "number of iterations")?;
            let n_iterations = n_iterations
                .parse::<u32>()
                .map_err(|_| args.invalid(format!("invalid number of iterations: <{n_iterations}>")))?;
            let name = args.options.get(1..).unwrap_or_default().join(" ");
            if let Some(open) = ctx.benchmark.replace(RunningBenchmark::new(name, n_iterations)) {
                ctx.benchmarks.push(open.finish());
            }
        }
        K::FinishBenchmark => {
            let Some(benchmark) = ctx.benchmark.take() else {
                return Err(args.invalid("no benchmark is running"));
            };
            let result = benchmark.finish();
            tracing::info!(
                benchmark = %result.name,
                n_items = result.n_items,
                real_elapsed_ms = result.real_elapsed_time.as_millis() as u64,
                "benchmark finished"
            );
            ctx.benchmarks.push(result);
        }
    }
    Ok(())
}

/// Directive options after variable expansion.
struct Args<'a> {
    name: &'a str,
    options: Vec<String>,
}

impl Args<'_> {
    fn option(&self, index: usize) -> Option<&str> {
        self.options.get(index).map(String::as_str)
    }

    fn invalid(&self, message: impl Into<String>) -> Failure {
        Failure::Invalid(DirectiveError::invalid(self.name, message))
    }

    fn required(&self, index: usize, what: &str) -> Result<&str, Failure> {
        self.option(index)
            .ok_or_else(|| self.invalid(format!("{what} is missing")))
    }

    fn seconds(&self, index: usize) -> Result<Duration, Failure> {
        let value = self.required(index, "seconds")?;
        parse_seconds(value).ok_or_else(|| self.invalid(format!("invalid seconds: <{value}>")))
    }

    /// A requirement argument with its optional `!` negation.
    fn requirement(&self, index: usize, what: &str) -> Result<(bool, &str), Failure> {
        let value = self.required(index, what)?;
        Ok(match value.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, value),
        })
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds = value.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}

fn parse_timeout(args: &Args<'_>, default: Duration) -> Result<Duration, Failure> {
    let value = args.required(0, "timeout")?;
    if value == "default" {
        return Ok(default);
    }
    parse_seconds(value).ok_or_else(|| args.invalid(format!("invalid timeout: <{value}>")))
}

fn strip_slashes(pattern: &str) -> &str {
    pattern
        .strip_prefix('/')
        .and_then(|p| p.strip_suffix('/'))
        .unwrap_or(pattern)
}

fn server_feature(ctx: &ExecutionContext, name: &str) -> bool {
    ctx.server_features
        .as_ref()
        .and_then(|features| features.get(name))
        .copied()
        .unwrap_or(false)
}

fn require(
    ctx: &mut ExecutionContext,
    satisfied: bool,
    what: &str,
    wanted: &str,
    negated: bool,
) -> Handled {
    if satisfied {
        return Ok(());
    }
    let reason = match (wanted.is_empty(), negated) {
        (true, _) => format!("require {what}"),
        (false, false) => format!("require {what}: {wanted}"),
        (false, true) => format!("require {what}: !{wanted}"),
    };
    Err(ctx.omit(reason).into())
}

async fn include(executor: &mut dyn Executor, ctx: &mut ExecutionContext, args: &Args<'_>) -> Handled {
    let path = ctx.base_directory.join(args.required(0, "path")?);
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(args.invalid(format!("no such file: <{}>", path.display())));
    }

    let mut sub_executor = executor.create_sub_executor();
    ctx.enter_include();
    let result = run_script(&mut *sub_executor, ctx, &path).await;
    ctx.leave_include();
    match result {
        Ok(()) => Ok(()),
        Err(ExecutorError::ScriptNotFound(path)) => {
            Err(args.invalid(format!("no such file: <{}>", path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

async fn copy_path(ctx: &mut ExecutionContext, args: &Args<'_>) -> Handled {
    let source = ctx.base_directory.join(args.required(0, "source")?);
    let destination = ctx.temporary_directory.join(args.required(1, "destination")?);
    copy_recursively(&source, &destination)
        .await
        .map_err(|e| args.invalid(format!("failed to copy <{}>: {e}", source.display())))
}

async fn copy_recursively(source: &Path, destination: &Path) -> std::io::Result<()> {
    let metadata = tokio::fs::metadata(source).await?;
    if !metadata.is_dir() {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, destination).await?;
        return Ok(());
    }

    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(source.to_path_buf(), destination.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

async fn suggest_create_dataset(ctx: &mut ExecutionContext, args: &Args<'_>) -> Handled {
    let dataset = args.required(0, "dataset name")?;
    let output = tokio::process::Command::new(&ctx.groonga_suggest_create_dataset)
        .arg(&ctx.db_path)
        .arg(dataset)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(ctx.timeout, output).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(args.invalid(format!(
                "failed to run <{}>: {e}",
                ctx.groonga_suggest_create_dataset.display()
            )));
        }
        Err(_) => return Err(args.invalid("timed out")),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(args.invalid(format!("failed: {}", stderr.trim_end())));
    }
    if ctx.logging {
        ctx.transcript.push_output(
            output.stdout,
            OutputType::Other("groonga-suggest-create-dataset".to_string()),
            None,
        );
    }
    Ok(())
}

async fn generate_series(
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    args: &Args<'_>,
) -> Handled {
    let parse_bound = |index: usize, what: &str| -> Result<i64, Failure> {
        let value = args.required(index, what)?;
        value
            .parse::<i64>()
            .map_err(|_| args.invalid(format!("invalid {what}: <{value}>")))
    };
    let from = parse_bound(0, "start")?;
    let to = parse_bound(1, "end")?;
    let table = args.required(2, "table")?;
    let template = args.required(3, "template")?;
    series::generate_series(executor, ctx, from, to, table, template)
        .await?
        .map_err(|e| args.invalid(e.to_string()))
}

async fn eval(
    executor: &mut dyn Executor,
    ctx: &mut ExecutionContext,
    args: &Args<'_>,
    content: &str,
) -> Handled {
    if content.trim().is_empty() {
        return Err(args.invalid("command is missing"));
    }
    let source = format!("{}\n", content.trim_end());
    let wire = ctx.substitutions.apply_input(source.as_bytes());
    let echo = ctx.substitutions.apply_normalized(source.as_bytes());
    let command = Command::parse_bytes(&wire).map_err(|e| args.invalid(e.to_string()))?;
    execute_command(executor, ctx, &command, Some(echo.as_slice())).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashSet};

    use assert_matches::assert_matches;

    use super::super::tests::{rendered, run, RecordingExecutor};
    use super::super::{run_test, RunOutcome};
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let names: HashSet<_> = REGISTRY.iter().map(|(name, _)| *name).collect();
        assert_eq!(names.len(), REGISTRY.len());
        assert_eq!(lookup("timeout"), Some(DirectiveKind::Timeout));
        assert_eq!(lookup("no-such-directive"), None);
    }

    #[tokio::test]
    async fn timeout_override_and_default() {
        let (ctx, _, _, _dir) = run("#@timeout 2.5\n").await;
        assert_eq!(ctx.timeout, Duration::from_millis(2500));

        let (ctx, _, _, _dir) = run("#@timeout 2.5\n#@timeout default\n").await;
        assert_eq!(ctx.timeout, ctx.default_timeout);
    }

    #[tokio::test]
    async fn invalid_timeout_is_reported_and_ignored() {
        let (ctx, _, outcome, _dir) = run("#@read-timeout abc\n").await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(ctx.read_timeout, ctx.default_read_timeout);
        assert_eq!(
            rendered(&ctx),
            "#@read-timeout abc\n#|e| [read-timeout] invalid timeout: <abc>\n"
        );
    }

    #[tokio::test]
    async fn unknown_directive_continues() {
        let (ctx, executor, outcome, _dir) = run("#@frobnicate now\nstatus\n").await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(rendered(&ctx).starts_with("#@frobnicate now\n#|e| [frobnicate] unknown directive\nstatus\n"));
        assert_eq!(executor.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_feature_omits_without_sending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mruby.test");
        std::fs::write(&path, "#@require-feature mruby\nselect Foo\n").unwrap();
        let mut ctx = ExecutionContext::new(dir.path(), dir.path());
        ctx.server_features = Some(BTreeMap::from([("mruby".to_string(), false)]));
        let mut executor = RecordingExecutor::default();

        let outcome = run_test(&mut executor, &mut ctx, &path).await.unwrap();
        assert_eq!(outcome, RunOutcome::Omitted("require feature: mruby".into()));
        assert!(executor.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn negated_requirements() {
        let script = format!("#@require-os !{}\nstatus\n", std::env::consts::OS);
        let (_, executor, outcome, _dir) = run(&script).await;
        assert_matches!(outcome, RunOutcome::Omitted(reason) if reason.starts_with("require OS: !"));
        assert!(executor.sent.lock().unwrap().is_empty());

        let (_, _, outcome, _dir) = run("#@require-interface !http\n#@require-testee groonga\n").await;
        assert_eq!(outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn omit_carries_reason() {
        let (_, _, outcome, _dir) = run("#@omit \"not supported yet\"\nstatus\n").await;
        assert_eq!(outcome, RunOutcome::Omitted("not supported yet".into()));
    }

    #[tokio::test]
    async fn substitution_rewrites_wire_and_echo_independently() {
        let script = "#@add-substitution uuid /[0-9a-f]{8}/ \"deadbeef\" \"UUID\"\nselect --query 0123abcd\n";
        let (ctx, executor, _, _dir) = run(script).await;
        assert_eq!(executor.sent_text()[0], "select --query deadbeef\n");
        assert!(rendered(&ctx).starts_with("select --query UUID\n"));
    }

    #[tokio::test]
    async fn remove_unknown_substitution_is_reported() {
        let (ctx, _, _, _dir) = run("#@remove-substitution nope\n").await;
        assert!(rendered(&ctx).contains("#|e| [remove-substitution] no such substitution: <nope>"));
    }

    #[tokio::test]
    async fn disable_logging_hides_commands() {
        let (ctx, executor, _, _dir) = run("#@disable-logging\nstatus\n#@enable-logging\nselect Foo\n").await;
        assert_eq!(executor.sent.lock().unwrap().len(), 2);
        assert_eq!(rendered(&ctx), "select Foo\n[[0,0.0,0.0],true]\n");
    }

    #[tokio::test]
    async fn include_runs_relative_to_base_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("schema.grn"), "table_create Foo TABLE_NO_KEY\n").unwrap();
        let path = dir.path().join("main.test");
        std::fs::write(&path, "#@include schema.grn\nselect Foo\n").unwrap();
        let mut ctx = ExecutionContext::new(dir.path(), dir.path().join("tmp"));
        let mut executor = RecordingExecutor::default();

        run_test(&mut executor, &mut ctx, &path).await.unwrap();
        let sent = executor.sent_text();
        assert_eq!(sent, vec!["table_create Foo TABLE_NO_KEY\n", "select Foo\n"]);
        assert!(ctx.is_top_level());
    }

    #[tokio::test]
    async fn missing_include_is_a_directive_error() {
        let (ctx, _, outcome, _dir) = run("#@include nowhere.grn\n").await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(rendered(&ctx).contains("#|e| [include] no such file:"));
    }

    #[tokio::test]
    async fn copy_path_copies_into_temporary_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("fixtures/nested")).unwrap();
        std::fs::write(dir.path().join("fixtures/nested/a.txt"), "a").unwrap();
        let path = dir.path().join("copy.test");
        std::fs::write(&path, "#@copy-path fixtures copied\n").unwrap();
        let mut ctx = ExecutionContext::new(dir.path(), dir.path().join("tmp"));
        let mut executor = RecordingExecutor::default();

        run_test(&mut executor, &mut ctx, &path).await.unwrap();
        let copied = std::fs::read_to_string(dir.path().join("tmp/copied/nested/a.txt")).unwrap();
        assert_eq!(copied, "a");
    }

    #[tokio::test]
    async fn generate_series_loads_silently() {
        let script = "#@generate-series 1 3 Users '{\"_key\": \"user#{i}\"}'\n";
        let (ctx, executor, _, _dir) = run(script).await;
        let sent = executor.sent_text();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            "load --table Users\n[{\"_key\":\"user1\"},{\"_key\":\"user2\"},{\"_key\":\"user3\"}]\n"
        );
        assert_eq!(rendered(&ctx), "[[0,0.0,0.0],true]\n");
    }

    #[tokio::test]
    async fn eval_expands_variables() {
        let (ctx, executor, _, dir) = run("#@eval plugin_register #{base_directory}/x\n").await;
        let expected = format!("plugin_register {}/x\n", dir.path().display());
        assert_eq!(executor.sent_text()[0], expected);
        assert!(rendered(&ctx).starts_with(&expected));
    }

    #[tokio::test]
    async fn log_levels_and_ignore_patterns() {
        let (ctx, _, _, _dir) =
            run("#@add-important-log-levels info debug\n#@add-ignore-log-pattern /spurious/\n").await;
        assert!(ctx.log_filter.is_important_level(LogLevel::Information));
        assert!(ctx.log_filter.is_important_level(LogLevel::Debug));

        let (ctx, _, _, _dir) = run("#@add-important-log-levels loud\n").await;
        assert!(rendered(&ctx).contains("#|e| [add-important-log-levels] unknown log level: <loud>"));
    }

    #[tokio::test]
    async fn on_error_omit_turns_errors_into_omission() {
        let (ctx, _, _, _dir) = run("#@on-error omit\n").await;
        assert_eq!(ctx.on_error, OnError::Omit);
        let (ctx, _, _, _dir) = run("#@on-error explode\n").await;
        assert_eq!(ctx.on_error, OnError::Default);
    }

    #[tokio::test]
    async fn benchmark_block_counts_commands() {
        let (ctx, _, _, _dir) =
            run("#@start-benchmark 3 select all\nselect Foo\nselect Bar\n#@finish-benchmark\n").await;
        assert_eq!(ctx.benchmarks.len(), 1);
        assert_eq!(ctx.benchmarks[0].name, "select all");
        assert_eq!(ctx.benchmarks[0].n_items, 2);
        assert_eq!(ctx.benchmarks[0].n_iterations, 3);
    }

    #[tokio::test]
    async fn collect_query_log_toggle() {
        let (ctx, _, _, _dir) = run("#@collect-query-log true\n").await;
        assert!(ctx.collect_query_log);
        let (ctx, _, _, _dir) = run("#@collect-query-log maybe\n").await;
        assert!(!ctx.collect_query_log);
    }
}
