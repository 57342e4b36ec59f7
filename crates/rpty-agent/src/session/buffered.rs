//! Ring-buffer backend: scrollback replay from memory.
//!
//! One process per session. A single pump task copies terminal output into
//! the circular buffer and queues it for every attached connection. Each
//! connection drains its queue on its own writer task, so a viewer that stops
//! reading only loses its own output.

use super::ring_buffer::RingBuffer;
use super::state::{State, StateMachine};
use super::{write_conn, ConnWriter};
use crate::metrics::{FailureKind, Metrics};
use crate::pty::{spawn_output_reader, CommandSpec, PtyOutput, Spawner, Terminal};
use rpty_core::{RptyError, RptyResult};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Size the process starts with, before the first attach resizes it.
const INITIAL_HEIGHT: u16 = 24;
const INITIAL_WIDTH: u16 = 80;

/// Output chunks queued per connection before new ones are dropped.
const CONN_QUEUE_DEPTH: usize = 256;

struct ActiveConn {
    queue: mpsc::Sender<Vec<u8>>,
    /// The attach token; cancelling it ends that connection's read loop.
    closed: CancellationToken,
}

type ActiveConns = Arc<Mutex<HashMap<String, ActiveConn>>>;

pub(crate) struct RingBufferBackend {
    command: CommandSpec,
    capacity: usize,
    spawner: Arc<dyn Spawner>,
    metrics: Arc<dyn Metrics>,
    /// Used to close the session when the process exits.
    session_state: Arc<StateMachine>,
    terminal: OnceLock<Arc<dyn Terminal>>,
    circular_buffer: Arc<RwLock<RingBuffer>>,
    active_conns: ActiveConns,
}

impl RingBufferBackend {
    pub(crate) fn new(
        command: CommandSpec,
        capacity: usize,
        spawner: Arc<dyn Spawner>,
        metrics: Arc<dyn Metrics>,
        session_state: Arc<StateMachine>,
    ) -> Self {
        Self {
            command,
            capacity,
            spawner,
            metrics,
            session_state,
            terminal: OnceLock::new(),
            circular_buffer: Arc::new(RwLock::new(RingBuffer::new(0))),
            active_conns: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate the buffer, spawn the process and start pumping its output.
    /// Must be called only once.
    pub(crate) async fn start(&self) -> RptyResult<()> {
        *self.circular_buffer.write().await = RingBuffer::new(self.capacity);

        let spawned = self
            .spawner
            .spawn(&self.command, INITIAL_HEIGHT, INITIAL_WIDTH)?;
        if self.terminal.set(spawned.terminal.clone()).is_err() {
            let _ = spawned.terminal.kill();
            return Err(RptyError::Other("ring buffer backend already started".into()));
        }
        let mut output = spawn_output_reader(spawned.output)?;

        let circular_buffer = self.circular_buffer.clone();
        let active_conns = self.active_conns.clone();
        let metrics = self.metrics.clone();
        let session_state = self.session_state.clone();

        // No separate exit watcher: once the process exits the reader
        // reaches EOF after draining all remaining output.
        tokio::spawn(async move {
            while let Some(item) = output.recv().await {
                let part = match item {
                    PtyOutput::Data(part) => part,
                    PtyOutput::Eof => {
                        debug!("unable to read pty output; command might have exited");
                        break;
                    }
                    PtyOutput::Failed(e) => {
                        warn!(error = %e, "unable to read pty output; command might have exited");
                        metrics.incr(FailureKind::OutputReader);
                        break;
                    }
                };

                circular_buffer.write().await.write(&part);

                let conns = active_conns.lock().await;
                for (conn_id, conn) in conns.iter() {
                    match conn.queue.try_send(part.clone()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!(other_conn_id = %conn_id, "active conn is not reading, dropping output");
                            metrics.incr(FailureKind::Write);
                        }
                        // Writer task already exited; cleanup removes the entry.
                        Err(TrySendError::Closed(_)) => {}
                    }
                }
            }
            // Killed externally, exited, or never started properly.
            session_state.set_state(
                State::Closing,
                Some(RptyError::Closing(
                    "unable to read pty output; command might have exited".into(),
                )),
            );
        });

        Ok(())
    }

    /// Replay the scrollback to `writer`, then stream live output to it until
    /// `token` is cancelled. The process is left running on detach.
    pub(crate) async fn attach(
        &self,
        token: &CancellationToken,
        conn_id: &str,
        mut writer: ConnWriter,
        height: u16,
        width: u16,
    ) -> RptyResult<Arc<dyn Terminal>> {
        let terminal = self
            .terminal
            .get()
            .cloned()
            .ok_or_else(|| RptyError::Other("ring buffer backend not started".into()))?;

        if let Err(e) = terminal.resize(height, width) {
            error!(conn_id, error = %e, "reconnecting pty initial resize failed, but will continue");
            self.metrics.incr(FailureKind::Resize);
        }

        let scrollback = self.circular_buffer.read().await.read_all();

        // Output pumped between the snapshot above and the insert below can
        // reach this connection twice. The buffer and connection locks are
        // never held together.
        if let Err(e) = write_conn(&mut writer, &scrollback).await {
            self.metrics.incr(FailureKind::Write);
            return Err(RptyError::Other(format!("write buffer to conn: {e}")));
        }

        let (queue, pending) = mpsc::channel(CONN_QUEUE_DEPTH);
        self.active_conns.lock().await.insert(
            conn_id.to_string(),
            ActiveConn {
                queue,
                closed: token.clone(),
            },
        );
        tokio::spawn(drain_conn(
            conn_id.to_string(),
            writer,
            pending,
            token.clone(),
            self.active_conns.clone(),
            self.metrics.clone(),
        ));

        Ok(terminal)
    }

    /// Close every connection, clear the scrollback and kill the process.
    /// Writers are shut down by their own tasks, never under the map lock.
    pub(crate) async fn close(&self) -> RptyResult<()> {
        let drained: Vec<ActiveConn> = self
            .active_conns
            .lock()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in drained {
            conn.closed.cancel();
        }

        let terminal = self.terminal.get().cloned();
        if let Some(terminal) = &terminal {
            let _ = terminal.close();
        }
        self.circular_buffer.write().await.clear();
        if let Some(terminal) = terminal {
            let _ = tokio::task::spawn_blocking(move || terminal.kill()).await;
        }

        Ok(())
    }

    /// Bytes currently held for replay.
    #[cfg(test)]
    pub(crate) async fn scrollback(&self) -> Vec<u8> {
        self.circular_buffer.read().await.read_all()
    }

    #[cfg(test)]
    pub(crate) async fn active_count(&self) -> usize {
        self.active_conns.lock().await.len()
    }
}

/// Write queued output to one connection until it detaches, then shut its
/// writer down and drop its entry.
async fn drain_conn(
    conn_id: String,
    mut writer: ConnWriter,
    mut pending: mpsc::Receiver<Vec<u8>>,
    closed: CancellationToken,
    active_conns: ActiveConns,
    metrics: Arc<dyn Metrics>,
) {
    loop {
        let part = tokio::select! {
            _ = closed.cancelled() => break,
            part = pending.recv() => match part {
                Some(part) => part,
                None => break,
            },
        };
        tokio::select! {
            _ = closed.cancelled() => break,
            written = write_conn(&mut writer, &part) => {
                if let Err(e) = written {
                    warn!(conn_id = %conn_id, error = %e, "error writing to active conn");
                    metrics.incr(FailureKind::Write);
                }
            }
        }
    }

    {
        let mut conns = active_conns.lock().await;
        // A reattach under the same ID may have replaced this entry.
        if conns.get(&conn_id).is_some_and(|c| c.closed.is_cancelled()) {
            conns.remove(&conn_id);
        }
    }
    let _ = writer.shutdown().await;
    debug!(conn_id = %conn_id, "connection detached");
}
