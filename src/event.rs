//! Status events: one JSON object per stdout line.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};

/// A status record read by whatever supervises the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "UPPERCASE")]
pub enum Event {
    Ready { host: String, port: u16, pid: u32 },
    Error { reason: ErrorReason, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    ImportError,
    StartFailed,
}

/// Writes events as newline-terminated JSON, flushing after each one.
pub struct EventWriter<W: Write> {
    inner: W,
}

impl EventWriter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> EventWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn emit(&mut self, event: &Event) -> io::Result<()> {
        let mut line = serde_json::to_vec(event).map_err(io::Error::from)?;
        line.push(b'\n');
        self.inner.write_all(&line)?;
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
