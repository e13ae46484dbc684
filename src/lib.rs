//! PGlite launcher — starts a PGlite server on a TCP port, reports readiness
//! as JSON lines on stdout and stops it again on SIGINT/SIGTERM.

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod launcher;
pub mod manager;
pub mod signal;

// re export for convenience.
pub use command::ServerCommand;
pub use config::Config;
pub use error::{LaunchError, ManagerError};
pub use event::{ErrorReason, Event, EventWriter};
pub use launcher::{Launcher, State};
pub use manager::{DatabaseManager, ManagedInstance, ProcessManager};
