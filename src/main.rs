//! PGlite launcher binary.
//! Usage: pglite-launcher [CONFIG_PATH]
//!
//! Status events go to stdout, logs go to stderr.

use anyhow::Result;
use pglite_launcher::{launcher, signal, Config, EventWriter, Launcher, ProcessManager, ServerCommand};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut events = EventWriter::stdout();

    // the server command is located before any other configuration is read
    let command = match ServerCommand::from_env() {
        Ok(command) => command,
        Err(err) => {
            let err = launcher::dependency_unavailable(&mut events, &err);
            return Ok(ExitCode::from(err.exit_code()));
        }
    };

    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    tracing::info!(host = %config.host, port = config.port, "PGlite launcher starting");
    let mut launcher = Launcher::new(ProcessManager::new(command), config);
    match launcher.run(&mut events, signal::shutdown_signal()).await {
        Ok(()) => {
            tracing::info!("PGlite launcher exiting");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => Ok(ExitCode::from(err.exit_code())),
    }
}
