//! rpty-agent: terminal sessions that survive disconnects.
//!
//! A [`session::ReconnectingPty`] runs one process in a PTY and keeps its
//! output available through either an in-memory ring buffer or GNU
//! `screen`. [`server::AgentServer`] exposes sessions over TCP.

pub mod config;
pub mod metrics;
pub mod pty;
pub mod server;
pub mod session;

#[cfg(test)]
mod testutil;
