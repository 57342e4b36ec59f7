use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by reconnecting PTY sessions and their protocol layer.
#[derive(Debug, Error)]
pub enum RptyError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("reconnecting pty ready wait: {0}")]
    NotReady(Box<RptyError>),

    #[error("reconnecting pty start: {0}")]
    Start(Box<RptyError>),

    #[error("reconnecting pty attach: {0}")]
    Attach(Box<RptyError>),

    #[error("reconnecting pty is closing: {0}")]
    Closing(String),

    #[error("reconnecting pty is done")]
    Done,

    #[error("context canceled")]
    Cancelled,

    #[error("deadline exceeded")]
    Timeout,

    #[error("pty error: {0}")]
    Pty(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("`{command}`: {status}: {stdout} (attempt {attempt})")]
    Command {
        command: String,
        status: String,
        stdout: String,
        attempt: u32,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", JoinedDisplay(.0))]
    Joined(Vec<Arc<RptyError>>),

    #[error("{0}")]
    Other(String),
}

impl RptyError {
    /// Join two optional errors, flattening nested joins.
    ///
    /// Returns `None` only when both sides are `None`.
    pub fn join(a: Option<RptyError>, b: Option<RptyError>) -> Option<RptyError> {
        let mut parts = Vec::new();
        for err in [a, b].into_iter().flatten() {
            match err {
                RptyError::Joined(inner) => parts.extend(inner),
                other => parts.push(Arc::new(other)),
            }
        }
        match parts.len() {
            0 => None,
            _ => Some(RptyError::Joined(parts)),
        }
    }

    /// Flattened view of the errors held by this value.
    pub fn parts(&self) -> Vec<&RptyError> {
        match self {
            RptyError::Joined(inner) => inner.iter().flat_map(|e| e.parts()).collect(),
            other => vec![other],
        }
    }

    /// Whether this error (or any joined part) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.parts().iter().any(|e| matches!(e, RptyError::Cancelled))
    }
}

struct JoinedDisplay<'a>(&'a [Arc<RptyError>]);

impl fmt::Display for JoinedDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl From<serde_json::Error> for RptyError {
    fn from(e: serde_json::Error) -> Self {
        RptyError::Codec(e.to_string())
    }
}

pub type RptyResult<T> = Result<T, RptyError>;
