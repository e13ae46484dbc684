//! PGlite server run as a child process.
//!
//! The helper (by default `pglite-server` from `@electric-sql/pglite-socket`)
//! is started with `--host`/`--port` (and `--db` when configured) and the same
//! endpoint in `PGLITE_HOST`/`PGLITE_PORT`. Its stdout and stderr are forwarded
//! to the log, never to our own stdout, which carries status events only.
//!
//! Readiness means the endpoint accepts a TCP connection *and* the helper is
//! still running. An explicit port is bind-tested before spawning so a foreign
//! listener on that port cannot be mistaken for our server.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::{DatabaseManager, ManagedInstance};
use crate::command::ServerCommand;
use crate::config::{Config, HOST_ENV, LOG_LEVEL_ENV, PORT_ENV};
use crate::error::ManagerError;

/// Lines of helper output kept for error messages.
const OUTPUT_TAIL_LINES: usize = 200;

/// How long to wait for the output forwarders to reach EOF after the helper
/// has exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Login roles accepted by the server, as a JSON object of user to password.
pub const USERS_JSON_ENV: &str = "PGLITE_USERS_JSON";

/// Starts PGlite servers by spawning the resolved helper command.
#[derive(Debug, Clone)]
pub struct ProcessManager {
    command: ServerCommand,
}

impl ProcessManager {
    pub fn new(command: ServerCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &ServerCommand {
        &self.command
    }

    fn build_command(&self, config: &Config, port: u16) -> Command {
        let mut cmd = Command::new(self.command.program());
        cmd.args(self.command.args())
            .arg("--host")
            .arg(&config.host)
            .arg("--port")
            .arg(port.to_string());
        if let Some(db) = &config.db {
            cmd.arg("--db").arg(db);
        }
        cmd.env(HOST_ENV, &config.host)
            .env(PORT_ENV, port.to_string())
            .env(USERS_JSON_ENV, users_json(config));
        if let Some(level) = &config.log_level {
            cmd.env(LOG_LEVEL_ENV, level);
        }
        if let Some(dirs) = &config.path_prepend {
            match prepend_path(dirs, std::env::var_os("PATH")) {
                Ok(path) => {
                    cmd.env("PATH", path);
                }
                Err(err) => {
                    tracing::warn!(path_prepend = %dirs, error = %err, "ignoring unusable path_prepend")
                }
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl DatabaseManager for ProcessManager {
    type Instance = ProcessInstance;

    async fn start(&self, config: &Config) -> Result<ProcessInstance, ManagerError> {
        let port = match config.port {
            0 => find_available_port(&config.host)?,
            port => {
                ensure_port_free(&config.host, port)?;
                port
            }
        };

        tracing::info!(
            program = %self.command.program().display(),
            host = %config.host,
            port,
            db = config.db.as_deref().unwrap_or("memory"),
            "Starting PGlite server"
        );

        let mut child = self
            .build_command(config, port)
            .spawn()
            .map_err(|source| ManagerError::Spawn {
                program: self.command.program().to_path_buf(),
                source,
            })?;

        let tail = OutputTail::default();
        let mut log_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            log_tasks.push(forward_output(stdout, tail.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(forward_output(stderr, tail.clone(), true));
        }

        let mut instance = ProcessInstance {
            child,
            host: config.host.clone(),
            port,
            shutdown_timeout: config.shutdown_timeout(),
            tail,
            log_tasks,
        };
        instance.wait_for_ready(config.startup_timeout()).await?;

        tracing::info!(
            pid = ?instance.child.id(),
            host = %instance.host,
            port,
            "PGlite server accepting connections"
        );
        Ok(instance)
    }
}

/// A running helper process. Killed on drop if never stopped.
pub struct ProcessInstance {
    child: Child,
    host: String,
    port: u16,
    shutdown_timeout: Duration,
    tail: OutputTail,
    log_tasks: Vec<JoinHandle<()>>,
}

enum Readiness {
    Accepting,
    TimedOut,
    Exited(io::Result<ExitStatus>),
}

impl ProcessInstance {
    /// Connect to the endpoint until it accepts, the helper exits, or
    /// `timeout` elapses.
    async fn wait_for_ready(&mut self, timeout: Duration) -> Result<(), ManagerError> {
        let start = Instant::now();
        let last_error = RefCell::new(None);
        let connect = tokio::time::timeout(
            timeout,
            connect_with_backoff(connect_host(&self.host), self.port, &last_error),
        );

        let mut readiness = tokio::select! {
            result = connect => match result {
                Ok(Ok(())) => Readiness::Accepting,
                Ok(Err(err)) => {
                    last_error.replace(Some(err.to_string()));
                    Readiness::TimedOut
                }
                Err(_) => Readiness::TimedOut,
            },
            status = self.child.wait() => Readiness::Exited(status),
        };

        // A listener that is not ours can answer while the helper dies.
        if let Readiness::Accepting = readiness {
            match self.child.try_wait() {
                Ok(Some(status)) => readiness = Readiness::Exited(Ok(status)),
                Ok(None) => {}
                Err(err) => readiness = Readiness::Exited(Err(err)),
            }
        }

        match readiness {
            Readiness::Accepting => {
                tracing::debug!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "endpoint is accepting connections"
                );
                Ok(())
            }
            Readiness::Exited(status) => {
                let status = status.ok().and_then(|s| s.code());
                self.drain_output().await;
                tracing::error!(?status, "PGlite server exited before becoming ready");
                Err(ManagerError::UnexpectedExit {
                    status,
                    output: self.tail.joined(),
                })
            }
            Readiness::TimedOut => {
                tracing::error!(
                    timeout_secs = timeout.as_secs(),
                    "PGlite server did not become ready, killing it"
                );
                // kill() also reaps the child
                if let Err(err) = self.child.kill().await {
                    tracing::warn!(error = %err, "failed to kill PGlite server");
                }
                self.drain_output().await;
                Err(ManagerError::ReadinessTimeout {
                    timeout_secs: timeout.as_secs(),
                    last_error: last_error.into_inner().unwrap_or_else(|| "none".to_string()),
                    output: self.tail.joined(),
                })
            }
        }
    }

    /// Ask the helper to exit: SIGTERM on unix, a hard kill elsewhere.
    fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id().and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(pid, error = %err, "failed to send SIGTERM to PGlite server")
                }
            }
        }

        if let Err(err) = self.child.start_kill() {
            tracing::debug!(error = %err, "failed to kill PGlite server");
        }
    }

    async fn drain_output(&mut self) {
        for task in self.log_tasks.drain(..) {
            join_forwarder(task, OUTPUT_DRAIN_TIMEOUT).await;
        }
    }

    fn abort_log_tasks(&mut self) {
        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }
}

impl ManagedInstance for ProcessInstance {
    fn port(&self) -> u16 {
        self.port
    }

    async fn stop(mut self) -> Result<(), ManagerError> {
        tracing::info!(pid = ?self.child.id(), "Stopping PGlite server");
        self.terminate();

        let result = tokio::time::timeout(self.shutdown_timeout, self.child.wait()).await;
        self.abort_log_tasks();

        match result {
            Ok(Ok(status)) => {
                tracing::info!(?status, "PGlite server stopped");
                Ok(())
            }
            Ok(Err(source)) => Err(ManagerError::ShutdownFailed { source }),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.shutdown_timeout.as_secs(),
                    "PGlite server did not exit in time, killing it"
                );
                self.child
                    .kill()
                    .await
                    .map_err(|source| ManagerError::ShutdownFailed { source })
            }
        }
    }
}

impl Drop for ProcessInstance {
    fn drop(&mut self) {
        self.abort_log_tasks();
    }
}

/// Bounded, shared buffer of the most recent helper output lines.
#[derive(Debug, Clone, Default)]
struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == OUTPUT_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn joined(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.is_empty() {
            return "(none)".to_string();
        }
        lines.iter().map(String::as_str).collect::<Vec<_>>().join(" | ")
    }
}

fn forward_output<R>(reader: R, tail: OutputTail, is_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                tracing::warn!(target: "pglite", "{}", line);
            } else {
                tracing::info!(target: "pglite", "{}", line);
            }
            tail.push(line);
        }
    })
}

/// Wait for an output forwarder to reach EOF. Returns false if it did not
/// finish in time or panicked, in which case the output tail may be short.
async fn join_forwarder(task: JoinHandle<()>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "output forwarder failed, output may be truncated");
            false
        }
        Err(_) => {
            tracing::debug!(
                timeout_ms = timeout.as_millis() as u64,
                "output forwarder did not finish, output may be truncated"
            );
            false
        }
    }
}

/// Connect until the endpoint accepts, backing off between attempts. Only
/// the caller's timeout ends the loop. The latest failure is kept in
/// `last_error`.
async fn connect_with_backoff(
    host: String,
    port: u16,
    last_error: &RefCell<Option<String>>,
) -> io::Result<()> {
    (|| {
        let host = host.clone();
        async move {
            tokio::net::TcpStream::connect((host.as_str(), port))
                .await
                .map(drop)
        }
    })
    .retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_millis(500))
            .without_max_times(),
    )
    .notify(|err: &io::Error, dur: Duration| {
        last_error.replace(Some(err.to_string()));
        tracing::trace!(
            error = %err,
            retry_after_ms = dur.as_millis() as u64,
            "endpoint not ready, retrying"
        );
    })
    .await
}

/// Address to connect to for a bind address. Wildcards are reached via loopback.
fn connect_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
        Ok(IpAddr::V6(ip)) if ip.is_unspecified() => Ipv6Addr::LOCALHOST.to_string(),
        _ => host.to_string(),
    }
}

/// Fail if another process already listens on `host:port`. Other bind
/// errors are left for the helper to report.
fn ensure_port_free(host: &str, port: u16) -> Result<(), ManagerError> {
    match TcpListener::bind((host, port)) {
        Ok(_) => Ok(()),
        Err(source) if source.kind() == io::ErrorKind::AddrInUse => Err(ManagerError::PortInUse {
            host: host.to_string(),
            port,
            source,
        }),
        Err(err) => {
            tracing::debug!(host, port, error = %err, "could not test-bind port, leaving it to the server");
            Ok(())
        }
    }
}

/// `PGLITE_USERS_JSON` value: `postgres` with an empty password, plus the
/// configured user.
fn users_json(config: &Config) -> String {
    let mut users = serde_json::Map::new();
    users.insert("postgres".to_string(), "".into());
    if let Some(user) = config.username.as_deref().filter(|u| !u.trim().is_empty()) {
        let password = config.password.clone().unwrap_or_default();
        users.insert(user.to_string(), password.into());
    }
    serde_json::Value::Object(users).to_string()
}

/// `dirs` is `;`-separated, like the command candidates.
fn prepend_path(dirs: &str, current: Option<OsString>) -> Result<OsString, std::env::JoinPathsError> {
    let front = dirs
        .split(';')
        .map(str::trim)
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from);
    let rest = current
        .as_deref()
        .map(|path| std::env::split_paths(path).collect::<Vec<_>>())
        .unwrap_or_default();
    std::env::join_paths(front.chain(rest))
}

fn find_available_port(host: &str) -> Result<u16, ManagerError> {
    let allocation_error = |source| ManagerError::PortAllocation {
        host: host.to_string(),
        source,
    };
    let listener = TcpListener::bind((host, 0)).map_err(allocation_error)?;
    let port = listener.local_addr().map_err(allocation_error)?.port();
    Ok(port)
}
