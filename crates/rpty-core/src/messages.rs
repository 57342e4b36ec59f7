//! Wire messages exchanged between a client and a reconnecting PTY.
//!
//! Clients send JSON objects; the session sends raw terminal output back.

use crate::error::{RptyError, RptyResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single client → session frame.
///
/// `data` is written to the terminal when non-empty. When both `height` and
/// `width` are nonzero the terminal is resized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectingPtyRequest {
    pub data: String,
    pub height: u16,
    pub width: u16,
}

impl ReconnectingPtyRequest {
    /// Input-only frame.
    pub fn input(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Resize-only frame.
    pub fn resize(height: u16, width: u16) -> Self {
        Self {
            data: String::new(),
            height,
            width,
        }
    }

    /// Whether this frame carries a resize.
    pub fn wants_resize(&self) -> bool {
        self.height != 0 && self.width != 0
    }
}

/// First frame sent on a fresh connection, selecting the session to attach to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectingPtyInit {
    /// Session identifier chosen by the client. Reusing an ID reattaches.
    pub id: String,
    pub height: u16,
    pub width: u16,
    /// Command to run when the session does not exist yet. Empty means the
    /// default shell.
    pub command: String,
}

impl ReconnectingPtyInit {
    pub fn validate(&self) -> RptyResult<()> {
        if self.id.is_empty() {
            return Err(RptyError::InvalidMessage("session id must not be empty".into()));
        }
        if self.id.len() > 128 {
            return Err(RptyError::InvalidMessage(format!(
                "session id too long ({} chars, max 128)",
                self.id.len()
            )));
        }
        Ok(())
    }
}

/// Strategy used to keep terminal output available to reconnecting clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// Use the multiplexer when its binary is installed, otherwise the ring buffer.
    #[default]
    Auto,
    /// In-memory scrollback replay.
    #[serde(alias = "buffered")]
    RingBuffer,
    /// External terminal multiplexer (`screen`).
    #[serde(alias = "screen")]
    Multiplexer,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Auto => "auto",
            BackendType::RingBuffer => "ring_buffer",
            BackendType::Multiplexer => "multiplexer",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = RptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(BackendType::Auto),
            "ring_buffer" | "ring-buffer" | "buffered" => Ok(BackendType::RingBuffer),
            "multiplexer" | "screen" => Ok(BackendType::Multiplexer),
            other => Err(RptyError::Config(format!("unknown backend type: {other}"))),
        }
    }
}
