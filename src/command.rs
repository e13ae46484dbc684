//! Locating the PGlite server helper.
//!
//! The command comes from `PGLITE_SERVER_COMMAND`: one or more candidates
//! separated by `;`, each tokenised with shell-style quoting. The first
//! candidate whose program resolves to an executable wins.

use std::path::{Path, PathBuf};

use crate::error::ManagerError;

pub const SERVER_COMMAND_ENV: &str = "PGLITE_SERVER_COMMAND";
pub const DEFAULT_SERVER_COMMAND: &str = "pglite-server";

/// A resolved helper executable plus its leading arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl ServerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Resolve the command named by `PGLITE_SERVER_COMMAND`, or the default.
    pub fn from_env() -> Result<Self, ManagerError> {
        let raw = std::env::var(SERVER_COMMAND_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_COMMAND.to_string());
        Self::locate(&raw)
    }

    /// Resolve the first usable candidate in `raw`.
    pub fn locate(raw: &str) -> Result<Self, ManagerError> {
        let mut tried = Vec::new();
        for candidate in raw.split(';') {
            let candidate = candidate.trim();
            if candidate.is_empty() {
                continue;
            }
            let mut parts = split_command(candidate)?.into_iter();
            let Some(program) = parts.next() else {
                continue;
            };
            match which::which(&program) {
                Ok(path) => {
                    tracing::debug!(program = %path.display(), "resolved PGlite server command");
                    return Ok(Self::new(path, parts.collect()));
                }
                Err(err) => {
                    tracing::debug!(%program, error = %err, "command candidate not usable");
                    tried.push(program);
                }
            }
        }
        if tried.is_empty() {
            return Err(ManagerError::InvalidCommand {
                command: raw.to_string(),
                reason: "no command given".to_string(),
            });
        }
        Err(ManagerError::CommandNotFound {
            tried: tried.join(", "),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// Split one command into words. Single or double quotes group words;
/// inside quotes a backslash escapes the active quote character.
fn split_command(command: &str) -> Result<Vec<String>, ManagerError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(q) if c == '\\' && chars.peek() == Some(&q) => {
                current.push(q);
                chars.next();
            }
            Some(_) => current.push(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            None if c == '"' || c == '\'' => quote = Some(c),
            None => current.push(c),
        }
    }
    if quote.is_some() {
        return Err(ManagerError::InvalidCommand {
            command: command.to_string(),
            reason: "unterminated quote".to_string(),
        });
    }
    if !current.is_empty() {
        parts.push(current);
    }
    Ok(parts)
}
