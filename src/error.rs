//! Error taxonomy and exit-code mapping.

use std::path::PathBuf;

use crate::event::ErrorReason;

/// Exit status after a signal-driven shutdown.
pub const EXIT_OK: u8 = 0;
/// Exit status when the server command cannot be located.
pub const EXIT_DEPENDENCY_UNAVAILABLE: u8 = 3;
/// Exit status when the server fails to start.
pub const EXIT_START_FAILED: u8 = 4;

/// Errors raised while locating, starting or stopping the PGlite server.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// None of the configured command candidates resolved to an executable.
    #[error("PGlite server command not found (tried: {tried})")]
    CommandNotFound {
        /// The candidates that were tried, joined for display
        tried: String,
    },

    /// The command string could not be tokenised.
    #[error("invalid PGlite server command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    /// The server process could not be spawned.
    #[error("failed to spawn PGlite server '{}'", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Port zero was requested and no free port could be bound.
    #[error("unable to allocate a TCP port on {host}")]
    PortAllocation {
        host: String,
        #[source]
        source: std::io::Error,
    },

    /// An explicit port is already bound by another process.
    #[error("port {port} on {host} is already in use")]
    PortInUse {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint never accepted a connection.
    #[error("PGlite server did not accept connections within {timeout_secs} seconds (last error: {last_error}). Output: {output}")]
    ReadinessTimeout {
        timeout_secs: u64,
        last_error: String,
        output: String,
    },

    /// The server process exited before it became ready.
    #[error("PGlite server exited with status {status:?} before becoming ready. Output: {output}")]
    UnexpectedExit { status: Option<i32>, output: String },

    /// Waiting for or killing the server process failed.
    #[error("failed to shut down PGlite server")]
    ShutdownFailed {
        #[source]
        source: std::io::Error,
    },
}

/// Terminal launcher failures. Success is `Ok(())`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("{0}")]
    DependencyUnavailable(String),
    #[error("{0}")]
    StartFailed(String),
}

impl LaunchError {
    pub fn dependency_unavailable(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::DependencyUnavailable(error_chain(err))
    }

    pub fn start_failed(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::StartFailed(error_chain(err))
    }

    pub fn reason(&self) -> ErrorReason {
        match self {
            Self::DependencyUnavailable(_) => ErrorReason::ImportError,
            Self::StartFailed(_) => ErrorReason::StartFailed,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::DependencyUnavailable(m) | Self::StartFailed(m) => m,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::DependencyUnavailable(_) => EXIT_DEPENDENCY_UNAVAILABLE,
            Self::StartFailed(_) => EXIT_START_FAILED,
        }
    }
}

/// Render an error with its sources, `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
