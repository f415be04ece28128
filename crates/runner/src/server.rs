//! Server process supervision: database creation, the spawn command line,
//! debugger and memory-checker wrappers, termination escalation and
//! temporary directory cleanup.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use grntest_core::Interface;
use grntest_executor::executor::driver::{wait_for_exit, EXIT_POLL_INTERVAL};
use grntest_executor::transport::PipeTransport;
use grntest_executor::{ExecutionContext, Executor, HttpExecutor, StandardIoExecutor};
use tokio::process::{Child, Command};

use crate::config::TesterConfig;
use crate::error::RunnerError;

/// Polls per termination step (SIGTERM, then SIGKILL).
pub const TERMINATE_ATTEMPTS: u32 = 100;

const BIND_ADDRESS: &str = "127.0.0.1";
const GDB_COMMAND_FILE: &str = "groonga.gdb";
const VALGRIND_SUPPRESSIONS_FILE: &str = "groonga.supp";

const GDB_COMMANDS: &str = "\
handle SIGPIPE nostop noprint pass
run
backtrace
";

const VALGRIND_SUPPRESSIONS: &str = "\
{
   dlopen-leak
   Memcheck:Leak
   ...
   fun:_dl_open
}
{
   dlerror-leak
   Memcheck:Leak
   ...
   fun:_dlerror_run
}
";

/// Program and arguments of one spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CommandLine {
    fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The database path as given to the server, relative to the temporary
/// directory the server runs in when possible.
fn database_argument(ctx: &ExecutionContext) -> PathBuf {
    ctx.db_path
        .strip_prefix(&ctx.temporary_directory)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| ctx.db_path.clone())
}

/// The server command line for `interface`, wrapped by gdb or valgrind
/// when configured.
pub fn server_command_line(
    config: &TesterConfig,
    ctx: &ExecutionContext,
    port: Option<u16>,
) -> CommandLine {
    let tmp = &ctx.temporary_directory;
    let mut server = CommandLine::new(&config.groonga)
        .arg("--log-path")
        .arg(ctx.log_path())
        .arg("--query-log-path")
        .arg(ctx.query_log_path())
        .arg("--working-directory")
        .arg(tmp);
    server = match (ctx.interface, port) {
        (Interface::Http, Some(port)) => server
            .arg("--bind-address")
            .arg(BIND_ADDRESS)
            .arg("--port")
            .arg(port.to_string())
            .arg("--protocol")
            .arg("http")
            .arg("--pid-path")
            .arg(tmp.join("groonga.pid"))
            .arg("-s"),
        _ => server.arg("--input-fd").arg("0").arg("--output-fd").arg("1"),
    };
    server = server.arg(database_argument(ctx));

    if let Some(gdb) = &config.gdb {
        let mut wrapped = CommandLine::new(gdb)
            .arg("-batch")
            .arg("-x")
            .arg(tmp.join(GDB_COMMAND_FILE))
            .arg("--args")
            .arg(server.program.as_os_str());
        wrapped.args.extend(server.args);
        return wrapped;
    }
    if config.valgrind {
        let mut wrapped = CommandLine::new("valgrind")
            .arg("--leak-check=full")
            .arg("--show-reachable=yes")
            .arg("--num-callers=30")
            .arg(format!(
                "--suppressions={}",
                tmp.join(VALGRIND_SUPPRESSIONS_FILE).display()
            ))
            .arg(format!("--log-file={}", tmp.join("valgrind.log").display()))
            .arg(server.program.as_os_str());
        wrapped.args.extend(server.args);
        return wrapped;
    }
    server
}

/// Find a free TCP port by binding an ephemeral listener and closing it.
pub fn free_port() -> Result<u16, RunnerError> {
    let listener = std::net::TcpListener::bind((BIND_ADDRESS, 0)).map_err(RunnerError::NoFreePort)?;
    let port = listener.local_addr().map_err(RunnerError::NoFreePort)?.port();
    Ok(port)
}

/// Create the per-test temporary directory, removing leftovers.
pub async fn prepare_temporary_directory(path: &Path) -> Result<(), RunnerError> {
    remove_directory(path).await?;
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

/// Remove the temporary directory, or move it to `<base>/tmp.keep/<name>`
/// when the database is to be kept.
pub async fn finish_temporary_directory(
    config: &TesterConfig,
    path: &Path,
    test_name: &str,
) -> Result<(), RunnerError> {
    if !config.keep_database {
        return remove_directory(path).await;
    }
    let archive = config
        .base_directory
        .join("tmp.keep")
        .join(test_name.replace(['/', '\\'], "_"));
    remove_directory(&archive).await?;
    if let Some(parent) = archive.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(path, &archive).await?;
    tracing::debug!(archive = %archive.display(), "kept test database");
    Ok(())
}

async fn remove_directory(path: &Path) -> Result<(), RunnerError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create a fresh database with `groonga -n DB shutdown`. A shared
/// database from the configuration is used as is.
pub async fn create_database(config: &TesterConfig, ctx: &ExecutionContext) -> Result<(), RunnerError> {
    if config.database.is_some() {
        return Ok(());
    }
    if let Some(parent) = ctx.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut command = Command::new(&config.groonga);
    command
        .arg("-n")
        .arg(database_argument(ctx))
        .arg("shutdown")
        .current_dir(&ctx.temporary_directory)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    apply_environment(&mut command, config, &ctx.env);

    let output = match tokio::time::timeout(ctx.timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(RunnerError::Spawn {
                program: config.groonga.display().to_string(),
                source,
            });
        }
        Err(_elapsed) => {
            return Err(RunnerError::DatabaseCreation {
                path: ctx.db_path.clone(),
                message: "timed out".into(),
            });
        }
    };
    if !output.status.success() {
        return Err(RunnerError::DatabaseCreation {
            path: ctx.db_path.clone(),
            message: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        });
    }
    Ok(())
}

fn apply_environment(command: &mut Command, config: &TesterConfig, env: &BTreeMap<String, String>) {
    if let Some(plugins_directory) = &config.plugins_directory {
        command.env("GRN_PLUGINS_DIR", plugins_directory);
    }
    command.envs(env);
}

/// A running server under test.
pub struct ServerProcess {
    child: Child,
    command_line: CommandLine,
    under_debugger: bool,
}

impl ServerProcess {
    /// Spawn the server for `ctx` and build the executor that talks to it.
    pub async fn spawn(
        config: &TesterConfig,
        ctx: &ExecutionContext,
    ) -> Result<(Self, Box<dyn Executor>), RunnerError> {
        let port = match ctx.interface {
            Interface::Http => Some(free_port()?),
            Interface::Stdio => None,
        };
        write_wrapper_files(config, ctx).await?;
        let command_line = server_command_line(config, ctx, port);
        tracing::debug!(command = %command_line.display(), "spawning server");

        let mut command = Command::new(&command_line.program);
        command
            .args(&command_line.args)
            .current_dir(&ctx.temporary_directory)
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        match ctx.interface {
            Interface::Stdio => command.stdin(Stdio::piped()).stdout(Stdio::piped()),
            Interface::Http => command.stdin(Stdio::null()).stdout(Stdio::null()),
        };
        apply_environment(&mut command, config, &ctx.env);

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: command_line.program.display().to_string(),
            source,
        })?;

        let executor: Box<dyn Executor> = match (ctx.interface, port) {
            (Interface::Http, Some(port)) => Box::new(HttpExecutor::new(BIND_ADDRESS, port)?),
            _ => {
                let stdin = child.stdin.take().ok_or(RunnerError::MissingPipe("stdin"))?;
                let stdout = child.stdout.take().ok_or(RunnerError::MissingPipe("stdout"))?;
                let transport = PipeTransport::new(stdin, stdout).with_debug(ctx.debug);
                Box::new(StandardIoExecutor::new(transport))
            }
        };

        let process = Self {
            child,
            command_line,
            under_debugger: config.gdb.is_some(),
        };
        Ok((process, executor))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn command_line(&self) -> &CommandLine {
        &self.command_line
    }

    /// Shut the server down through the executor, escalating to signals
    /// when it does not exit in time. Returns whether it exited cleanly.
    pub async fn stop(mut self, executor: &mut dyn Executor, ctx: &mut ExecutionContext) -> bool {
        if self.under_debugger {
            if let Err(e) = executor.shutdown(ctx, None).await {
                tracing::warn!(error = %e, "shutdown under debugger failed");
            }
            return match self.child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    tracing::error!(error = %e, "failed to wait for debugger");
                    false
                }
            };
        }

        match executor.shutdown(ctx, Some(&mut self.child)).await {
            Ok(true) => {
                if let Ok(Some(status)) = self.child.try_wait() {
                    if !status.success() {
                        ctx.log_error(format!("# error: server exited with {status}"));
                        return false;
                    }
                }
                true
            }
            Ok(false) => {
                tracing::warn!(pid = ?self.child.id(), "server did not exit in time, terminating");
                terminate(&mut self.child).await;
                false
            }
            Err(e) => {
                tracing::warn!(pid = ?self.child.id(), error = %e, "shutdown failed, terminating");
                terminate(&mut self.child).await;
                false
            }
        }
    }
}

async fn write_wrapper_files(config: &TesterConfig, ctx: &ExecutionContext) -> Result<(), RunnerError> {
    let tmp = &ctx.temporary_directory;
    if config.gdb.is_some() {
        tokio::fs::write(tmp.join(GDB_COMMAND_FILE), GDB_COMMANDS).await?;
    }
    if config.valgrind {
        tokio::fs::write(tmp.join(VALGRIND_SUPPRESSIONS_FILE), VALGRIND_SUPPRESSIONS).await?;
    }
    Ok(())
}

/// Terminate a child: SIGTERM first, then SIGKILL, each followed by the
/// bounded exit poll. Returns whether the process is gone.
pub async fn terminate(child: &mut Child) -> bool {
    let wait = EXIT_POLL_INTERVAL * TERMINATE_ATTEMPTS;
    if let Ok(Some(_)) = child.try_wait() {
        return true;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        tracing::debug!(pid, "sending SIGTERM");
        // SAFETY: `pid` belongs to a child we own and have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if wait_for_exit(child, wait).await.unwrap_or(false) {
            return true;
        }
    }

    tracing::debug!(pid = ?child.id(), "sending SIGKILL");
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to kill server");
    }
    if wait_for_exit(child, wait).await.unwrap_or(false) {
        return true;
    }
    tracing::error!(pid = ?child.id(), "server survived SIGKILL");
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &Path, interface: Interface) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(dir, dir.join("tmp"));
        ctx.interface = interface;
        ctx
    }

    fn args(command_line: &CommandLine) -> Vec<String> {
        command_line
            .args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn stdio_command_line() {
        let dir = Path::new("/suite");
        let ctx = context(dir, Interface::Stdio);
        let command_line = server_command_line(&TesterConfig::default(), &ctx, None);
        assert_eq!(command_line.program, PathBuf::from("groonga"));
        assert_eq!(
            args(&command_line),
            vec![
                "--log-path",
                "/suite/tmp/groonga.log",
                "--query-log-path",
                "/suite/tmp/groonga.query.log",
                "--working-directory",
                "/suite/tmp",
                "--input-fd",
                "0",
                "--output-fd",
                "1",
                "db/db",
            ]
        );
    }

    #[test]
    fn http_command_line_binds_port() {
        let ctx = context(Path::new("/suite"), Interface::Http);
        let command_line = server_command_line(&TesterConfig::default(), &ctx, Some(10041));
        let args = args(&command_line);
        let port = args.iter().position(|arg| arg == "--port").unwrap();
        assert_eq!(args[port + 1], "10041");
        assert!(args.contains(&"-s".to_string()));
        assert!(args.contains(&"/suite/tmp/groonga.pid".to_string()));
        assert_eq!(args.last().unwrap(), "db/db");
    }

    #[test]
    fn wrappers_prefix_the_server() {
        let ctx = context(Path::new("/suite"), Interface::Stdio);
        let config = TesterConfig {
            gdb: Some(PathBuf::from("gdb")),
            ..TesterConfig::default()
        };
        let command_line = server_command_line(&config, &ctx, None);
        assert_eq!(command_line.program, PathBuf::from("gdb"));
        assert_eq!(&args(&command_line)[..5], ["-batch", "-x", "/suite/tmp/groonga.gdb", "--args", "groonga"]);

        let config = TesterConfig {
            valgrind: true,
            ..TesterConfig::default()
        };
        let command_line = server_command_line(&config, &ctx, None);
        assert_eq!(command_line.program, PathBuf::from("valgrind"));
        assert!(args(&command_line).contains(&"--suppressions=/suite/tmp/groonga.supp".to_string()));
    }

    #[test]
    fn shared_database_keeps_absolute_path() {
        let mut ctx = context(Path::new("/suite"), Interface::Stdio);
        ctx.db_path = PathBuf::from("/data/shared/db");
        assert_eq!(database_argument(&ctx), PathBuf::from("/data/shared/db"));
    }

    #[test]
    fn free_port_is_bindable() {
        let port = free_port().unwrap();
        assert_ne!(port, 0);
        std::net::TcpListener::bind((BIND_ADDRESS, port)).unwrap();
    }

    #[tokio::test]
    async fn temporary_directory_is_archived_when_kept() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp/0");
        prepare_temporary_directory(&tmp).await.unwrap();
        std::fs::write(tmp.join("groonga.log"), "log").unwrap();

        let config = TesterConfig {
            base_directory: dir.path().to_path_buf(),
            keep_database: true,
            ..TesterConfig::default()
        };
        finish_temporary_directory(&config, &tmp, "select/basic").await.unwrap();
        assert!(!tmp.exists());
        assert!(dir.path().join("tmp.keep/select_basic/groonga.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_escalates_to_sigterm() {
        let mut child = Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap();
        assert!(terminate(&mut child).await);
        assert!(child.try_wait().unwrap().is_some());
    }
}
