//! Registry of live sessions, keyed by the client-chosen session ID.
//!
//! Sessions leave the registry on their own as soon as they start closing.

use super::reconnecting::{Options, ReconnectingPty};
use super::state::State;
use crate::pty::CommandSpec;
use rpty_core::{BackendType, RptyError, RptyResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Entry {
    rpty: ReconnectingPty,
    command: String,
    created_at: Instant,
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub state: State,
    pub backend: BackendType,
    pub command: String,
    pub age_secs: u64,
}

/// Manages all live sessions.
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Entry>>>,
    options: Options,
    max_sessions: usize,
    /// Parent of every session; cancelling it closes them all.
    token: CancellationToken,
}

impl SessionManager {
    pub fn new(token: CancellationToken, options: Options, max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            options,
            max_sessions,
            token,
        }
    }

    /// Return the session registered under `id`, creating it with the
    /// command from `command` if there is none (or only a closing one).
    pub async fn get_or_create(
        &self,
        id: &str,
        command: impl FnOnce() -> CommandSpec,
    ) -> RptyResult<ReconnectingPty> {
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get(id) {
            if entry.rpty.state() < State::Closing {
                return Ok(entry.rpty.clone());
            }
            debug!(session_id = id, "replacing closing session");
            sessions.remove(id);
        }
        if sessions.len() >= self.max_sessions {
            return Err(RptyError::Other(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }

        let command = command();
        let command_line = command.display();
        let rpty = ReconnectingPty::new(&self.token, command, self.options.clone());
        info!(session_id = id, command = %command_line, backend = %rpty.backend_type(), "session created");
        sessions.insert(
            id.to_string(),
            Entry {
                rpty: rpty.clone(),
                command: command_line,
                created_at: Instant::now(),
            },
        );
        drop(sessions);

        let registry = self.sessions.clone();
        let watched = rpty.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            watched.wait().await;
            let mut sessions = registry.write().await;
            if sessions
                .get(&id)
                .is_some_and(|entry| entry.rpty.same_session(&watched))
            {
                sessions.remove(&id);
                info!(session_id = %id, "session removed");
            }
        });

        Ok(rpty)
    }

    pub async fn get(&self, id: &str) -> Option<ReconnectingPty> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|entry| entry.rpty.clone())
    }

    /// List all registered sessions, ordered by ID.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                state: entry.rpty.state(),
                backend: entry.rpty.backend_type(),
                command: entry.command.clone(),
                age_secs: entry.created_at.elapsed().as_secs(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Forget a session without closing it.
    pub async fn remove(&self, id: &str) -> RptyResult<ReconnectingPty> {
        match self.sessions.write().await.remove(id) {
            Some(entry) => {
                info!(session_id = id, "session removed");
                Ok(entry.rpty)
            }
            None => Err(RptyError::Other(format!("session not found: {id}"))),
        }
    }

    /// Remove a session and close it.
    pub async fn close(&self, id: &str, reason: &str) -> RptyResult<()> {
        let rpty = self.remove(id).await?;
        rpty.close(reason).await;
        Ok(())
    }

    /// Close every session and wait for all of them to finish.
    pub async fn close_all(&self, reason: &str) {
        let drained: Vec<ReconnectingPty> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry.rpty)
            .collect();
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), reason, "closing all sessions");
        futures_util::future::join_all(drained.iter().map(|rpty| rpty.close(reason))).await;
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}
