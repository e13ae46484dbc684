//! Configuration loading and defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const PORT_ENV: &str = "PGLITE_PORT";
pub const HOST_ENV: &str = "PGLITE_HOST";
pub const DB_ENV: &str = "PGLITE_DB";
pub const STARTUP_TIMEOUT_ENV: &str = "PGLITE_STARTUP_TIMEOUT_SECS";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "PGLITE_SHUTDOWN_TIMEOUT_SECS";
pub const USERNAME_ENV: &str = "PGLITE_USERNAME";
pub const PASSWORD_ENV: &str = "PGLITE_PASSWORD";
pub const LOG_LEVEL_ENV: &str = "PGLITE_LOG_LEVEL";
pub const PATH_PREPEND_ENV: &str = "PGLITE_PATH_PREPEND";

/// Runtime configuration for the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Bind address for the PGlite server. Default "127.0.0.1".
    pub host: String,

    /// TCP port. Default 54329. Zero picks a free port at start-up.
    pub port: u16,

    /// Database location handed to the server. None means in-memory.
    pub db: Option<String>,

    /// Seconds to wait for the server to accept connections. Default 30.
    pub startup_timeout_secs: u64,

    /// Seconds to wait for the server to exit after SIGTERM. Default 5.
    pub shutdown_timeout_secs: u64,

    /// Extra login role accepted next to `postgres`.
    pub username: Option<String>,

    /// Password for `username`. Empty when unset.
    pub password: Option<String>,

    /// Log level handed to the server as `PGLITE_LOG_LEVEL`.
    pub log_level: Option<String>,

    /// Directories put in front of the server's PATH, e.g. a bundled node.
    pub path_prepend: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 54329,
            db: None,
            startup_timeout_secs: 30,
            shutdown_timeout_secs: 5,
            username: None,
            password: None,
            log_level: None,
            path_prepend: None,
        }
    }
}

impl Config {
    /// Load the full configuration: optional TOML file, then environment
    /// overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut c = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        c.apply_env(|key| std::env::var(key).ok())?;
        c.validate()?;
        Ok(c)
    }

    /// Load config from a TOML file. Empty file returns default config.
    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let c: Config = toml::from_str(&s)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(c)
    }

    /// Override fields from environment-style lookups. Values that do not
    /// parse are errors, not silently ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {PORT_ENV} value {port:?}"))?;
        }
        if let Some(host) = lookup(HOST_ENV) {
            self.host = host;
        }
        if let Some(db) = lookup(DB_ENV) {
            self.db = non_empty(db);
        }
        if let Some(username) = lookup(USERNAME_ENV) {
            self.username = non_empty(username);
        }
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.password = Some(password);
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            self.log_level = non_empty(level);
        }
        if let Some(dirs) = lookup(PATH_PREPEND_ENV) {
            self.path_prepend = non_empty(dirs);
        }
        if let Some(secs) = lookup(STARTUP_TIMEOUT_ENV) {
            self.startup_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("invalid {STARTUP_TIMEOUT_ENV} value {secs:?}"))?;
        }
        if let Some(secs) = lookup(SHUTDOWN_TIMEOUT_ENV) {
            self.shutdown_timeout_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("invalid {SHUTDOWN_TIMEOUT_ENV} value {secs:?}"))?;
        }
        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("host must not be empty");
        }
        if self.startup_timeout_secs == 0 {
            anyhow::bail!("startup_timeout_secs must be positive");
        }
        if self.shutdown_timeout_secs == 0 {
            anyhow::bail!("shutdown_timeout_secs must be positive");
        }
        if self.password.is_some() && self.username.is_none() {
            anyhow::bail!("password is set but username is not");
        }
        Ok(())
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.port, 54329);
        assert_eq!(c.db, None);
    }

    #[test]
    fn unset_env_keeps_defaults() {
        let mut c = Config::default();
        c.apply_env(env_of(&[])).unwrap();
        assert_eq!(c, Config::default());
    }

    #[test]
    fn env_overrides_host_and_port() {
        let mut c = Config::default();
        c.apply_env(env_of(&[(PORT_ENV, "5555"), (HOST_ENV, "0.0.0.0")]))
            .unwrap();
        assert_eq!(c.port, 5555);
        assert_eq!(c.host, "0.0.0.0");
    }

    #[test]
    fn env_overrides_db_and_timeouts() {
        let mut c = Config::default();
        c.apply_env(env_of(&[
            (DB_ENV, "/tmp/pgdata"),
            (STARTUP_TIMEOUT_ENV, "3"),
            (SHUTDOWN_TIMEOUT_ENV, "1"),
        ]))
        .unwrap();
        assert_eq!(c.db.as_deref(), Some("/tmp/pgdata"));
        assert_eq!(c.startup_timeout(), Duration::from_secs(3));
        assert_eq!(c.shutdown_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn empty_db_means_in_memory() {
        let mut c = Config {
            db: Some("/data".to_string()),
            ..Config::default()
        };
        c.apply_env(env_of(&[(DB_ENV, "")])).unwrap();
        assert_eq!(c.db, None);
    }

    #[test]
    fn env_sets_credentials_and_helper_settings() {
        let mut c = Config::default();
        c.apply_env(env_of(&[
            (USERNAME_ENV, "app"),
            (PASSWORD_ENV, "secret"),
            (LOG_LEVEL_ENV, "debug"),
            (PATH_PREPEND_ENV, "/opt/node/bin"),
        ]))
        .unwrap();
        c.validate().unwrap();
        assert_eq!(c.username.as_deref(), Some("app"));
        assert_eq!(c.password.as_deref(), Some("secret"));
        assert_eq!(c.log_level.as_deref(), Some("debug"));
        assert_eq!(c.path_prepend.as_deref(), Some("/opt/node/bin"));
    }

    #[test]
    fn password_without_username_rejected() {
        let c = Config {
            password: Some("secret".to_string()),
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn non_numeric_port_is_error() {
        let mut c = Config::default();
        let err = c.apply_env(env_of(&[(PORT_ENV, "abc")])).unwrap_err();
        assert!(err.to_string().contains(PORT_ENV));
    }

    #[test]
    fn out_of_range_port_is_error() {
        let mut c = Config::default();
        assert!(c.apply_env(env_of(&[(PORT_ENV, "70000")])).is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let c = Config {
            startup_timeout_secs: 0,
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_host_rejected() {
        let c = Config {
            host: " ".to_string(),
            ..Config::default()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn empty_file_is_default() {
        let tmp = NamedTempFile::new().unwrap();
        let c = Config::from_path(tmp.path()).unwrap();
        assert_eq!(c, Config::default());
    }

    #[test]
    fn toml_file_fields() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(
            tmp,
            "host = \"0.0.0.0\"\nport = 6000\ndb = \"./pgdata\"\nusername = \"app\"\nlog_level = \"info\""
        )
        .unwrap();
        let c = Config::from_path(tmp.path()).unwrap();
        assert_eq!(c.username.as_deref(), Some("app"));
        assert_eq!(c.log_level.as_deref(), Some("info"));
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.port, 6000);
        assert_eq!(c.db.as_deref(), Some("./pgdata"));
        assert_eq!(c.startup_timeout_secs, 30);
    }

    #[test]
    fn unknown_toml_key_rejected() {
        let mut tmp = NamedTempFile::new().unwrap();
        writeln!(tmp, "listen_addr = \"127.0.0.1:7643\"").unwrap();
        assert!(Config::from_path(tmp.path()).is_err());
    }
}
