//! Launcher control flow.
//!
//! `STARTING → READY → STOPPING → TERMINATED`, with `IMPORT_FAILED` and
//! `START_FAILED` as terminal exits from `STARTING`. Nothing is retried.
//!
//! Shutdown is best-effort: a failure to stop the server is logged and
//! otherwise ignored, so a signalled launcher always exits successfully.

use std::fmt;
use std::future::Future;
use std::io::{self, Write};

use crate::config::Config;
use crate::error::{error_chain, LaunchError, ManagerError};
use crate::event::{Event, EventWriter};
use crate::manager::{DatabaseManager, ManagedInstance};
use crate::signal::ShutdownSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Starting,
    Ready,
    Stopping,
    Terminated,
    ImportFailed,
    StartFailed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "STARTING",
            Self::Ready => "READY",
            Self::Stopping => "STOPPING",
            Self::Terminated => "TERMINATED",
            Self::ImportFailed => "IMPORT_FAILED",
            Self::StartFailed => "START_FAILED",
        };
        f.write_str(s)
    }
}

/// Owns the manager and, once started, the single running instance.
pub struct Launcher<M: DatabaseManager> {
    manager: M,
    config: Config,
    state: State,
    instance: Option<M::Instance>,
}

impl<M: DatabaseManager> Launcher<M> {
    pub fn new(manager: M, config: Config) -> Self {
        Self {
            manager,
            config,
            state: State::Starting,
            instance: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start the server, report readiness, wait for `shutdown`, then stop it.
    pub async fn run<W, S>(
        &mut self,
        events: &mut EventWriter<W>,
        shutdown: S,
    ) -> Result<(), LaunchError>
    where
        W: Write,
        S: Future<Output = io::Result<ShutdownSignal>>,
    {
        self.start(events).await?;

        let signal = match shutdown.await {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for shutdown signals, shutting down");
                ShutdownSignal::Terminate
            }
        };
        self.shutdown(signal).await;
        Ok(())
    }

    /// Acquire the server and emit `READY`, or emit `ERROR` and fail.
    pub async fn start<W: Write>(&mut self, events: &mut EventWriter<W>) -> Result<(), LaunchError> {
        if self.instance.is_some() {
            return Ok(());
        }
        self.transition(State::Starting);

        let started = self.manager.start(&self.config).await;
        match started {
            Ok(instance) => {
                let port = instance.port();
                self.instance = Some(instance);
                self.transition(State::Ready);
                emit(
                    events,
                    &Event::Ready {
                        host: self.config.host.clone(),
                        port,
                        pid: std::process::id(),
                    },
                );
                Ok(())
            }
            Err(err) => {
                self.transition(State::StartFailed);
                let err = LaunchError::start_failed(&err);
                report(events, &err);
                Err(err)
            }
        }
    }

    /// Release the server if one is held. Never fails.
    pub async fn shutdown(&mut self, signal: ShutdownSignal) {
        tracing::info!(%signal, "Shutting down");
        self.transition(State::Stopping);
        if let Some(instance) = self.instance.take() {
            if let Err(err) = instance.stop().await {
                tracing::warn!(error = %error_chain(&err), "failed to stop PGlite server, exiting anyway");
            }
        }
        self.transition(State::Terminated);
    }

    fn transition(&mut self, next: State) {
        tracing::debug!(from = %self.state, to = %next, "launcher state");
        self.state = next;
    }
}

/// Report that the server command could not be located.
pub fn dependency_unavailable<W: Write>(
    events: &mut EventWriter<W>,
    err: &ManagerError,
) -> LaunchError {
    tracing::debug!(from = %State::Starting, to = %State::ImportFailed, "launcher state");
    let err = LaunchError::dependency_unavailable(err);
    report(events, &err);
    err
}

/// Emit the `ERROR` event for a terminal failure.
pub fn report<W: Write>(events: &mut EventWriter<W>, err: &LaunchError) {
    tracing::error!(reason = ?err.reason(), detail = err.message(), "launch failed");
    emit(
        events,
        &Event::Error {
            reason: err.reason(),
            message: err.message().to_string(),
        },
    );
}

fn emit<W: Write>(events: &mut EventWriter<W>, event: &Event) {
    if let Err(err) = events.emit(event) {
        tracing::warn!(error = %err, "failed to write status event");
    }
}
