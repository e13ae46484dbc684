//! Scoped acquisition of a running PGlite server.
//!
//! `start` acquires a listening instance and `stop` releases it. The launcher
//! calls each at most once per process.

mod process;

use std::future::Future;

use crate::config::Config;
use crate::error::ManagerError;

pub use process::{ProcessInstance, ProcessManager};

/// Something that can bring up a PGlite server bound to a TCP endpoint.
pub trait DatabaseManager {
    type Instance: ManagedInstance;

    /// Start a server on `config.host`/`config.port` and resolve once it
    /// accepts connections.
    fn start(&self, config: &Config) -> impl Future<Output = Result<Self::Instance, ManagerError>>;
}

/// A running server owned by the launcher.
pub trait ManagedInstance {
    /// The port actually listened on. Differs from the configured port only
    /// when port zero was requested.
    fn port(&self) -> u16;

    /// Release the server. Consumes the handle so it can only happen once.
    fn stop(self) -> impl Future<Output = Result<(), ManagerError>>;
}
