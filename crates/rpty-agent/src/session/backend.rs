use super::buffered::RingBufferBackend;
use super::screen::ScreenBackend;
use super::ConnWriter;
use crate::pty::Terminal;
use rpty_core::{BackendType, RptyResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resolve [`BackendType::Auto`]: the multiplexer when `program` is on the
/// PATH, the ring buffer otherwise. Explicit choices pass through.
pub fn select_backend_type(requested: BackendType, program: &str) -> BackendType {
    match requested {
        BackendType::Auto => match which::which(program) {
            Ok(path) => {
                debug!(path = %path.display(), "using screen backend");
                BackendType::Multiplexer
            }
            Err(e) => {
                debug!(program, error = %e, "screen not found, using ring buffer backend");
                BackendType::RingBuffer
            }
        },
        other => other,
    }
}

pub(crate) enum Backend {
    RingBuffer(RingBufferBackend),
    Multiplexer(ScreenBackend),
}

impl Backend {
    pub(crate) fn kind(&self) -> BackendType {
        match self {
            Backend::RingBuffer(_) => BackendType::RingBuffer,
            Backend::Multiplexer(_) => BackendType::Multiplexer,
        }
    }

    pub(crate) async fn start(&self) -> RptyResult<()> {
        match self {
            Backend::RingBuffer(b) => b.start().await,
            Backend::Multiplexer(b) => b.start().await,
        }
    }

    /// Attach a connection. Cancelling `token` detaches it; the backend
    /// cancels `token` itself when it stops serving the connection.
    pub(crate) async fn attach(
        &self,
        token: &CancellationToken,
        conn_id: &str,
        writer: ConnWriter,
        height: u16,
        width: u16,
    ) -> RptyResult<Arc<dyn Terminal>> {
        match self {
            Backend::RingBuffer(b) => b.attach(token, conn_id, writer, height, width).await,
            Backend::Multiplexer(b) => b.attach(token, conn_id, writer, height, width).await,
        }
    }

    pub(crate) async fn close(&self) -> RptyResult<()> {
        match self {
            Backend::RingBuffer(b) => b.close().await,
            Backend::Multiplexer(b) => b.close().await,
        }
    }
}
