//! rpty-core: Shared protocol library for reconnecting PTY sessions.
//!
//! Provides the JSON wire messages, a streaming frame decoder, and the error
//! type shared by the agent and its clients.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, JsonFrameDecoder, MAX_FRAME_SIZE};
pub use error::{RptyError, RptyResult};
pub use messages::{BackendType, ReconnectingPtyInit, ReconnectingPtyRequest};
