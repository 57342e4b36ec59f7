//! Reconnecting PTY sessions.
//!
//! A [`ReconnectingPty`] owns one process behind a backend that keeps its
//! scrollback, so clients can drop their connection and attach again later.

mod backend;
mod buffered;
mod manager;
mod reconnecting;
pub mod ring_buffer;
pub mod screen;
pub mod state;
pub mod timer;

pub use backend::select_backend_type;
pub use manager::{SessionInfo, SessionManager};
pub use reconnecting::{Options, ReconnectingPty, DEFAULT_TIMEOUT};
pub use ring_buffer::RingBuffer;
pub use screen::{CommandOutput, CommandRunner, ScreenOptions, TokioCommandRunner};
pub use state::State;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write half of an attached connection, owned by the backend.
pub type ConnWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) async fn write_conn(writer: &mut ConnWriter, data: &[u8]) -> std::io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}
