//! TCP listener: hands each connection to the session it names.
//!
//! A client opens a connection and sends one JSON line
//! (`ReconnectingPtyInit`) naming the session and its initial size. Every
//! byte after that line belongs to the session's attach protocol.

use crate::config::AgentConfig;
use crate::pty::CommandSpec;
use crate::session::{Options, SessionManager};
use rpty_core::{ReconnectingPtyInit, RptyError, RptyResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a fresh connection may take to send its init line.
const INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the init line, in bytes.
const MAX_INIT_LINE: u64 = 64 * 1024;

pub struct AgentServer {
    config: AgentConfig,
    sessions: Arc<SessionManager>,
    shutdown: CancellationToken,
}

impl AgentServer {
    /// Sessions are children of `shutdown`; cancelling it stops the accept
    /// loop and closes every session.
    pub fn new(config: AgentConfig, options: Options, shutdown: CancellationToken) -> Self {
        let sessions = Arc::new(SessionManager::new(
            shutdown.clone(),
            options,
            config.max_sessions,
        ));
        Self {
            config,
            sessions,
            shutdown,
        }
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    /// Accept connections until shutdown, then close all sessions.
    pub async fn run(self, listener: TcpListener) -> RptyResult<()> {
        let server = Arc::new(self);
        info!(addr = %listener.local_addr()?, "rpty-agent ready");

        loop {
            tokio::select! {
                _ = server.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let srv = server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = srv.handle_connection(stream, peer).await {
                                warn!(%peer, error = %e, "connection error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("shutting down, closing sessions");
        server.sessions.close_all("agent shutting down").await;
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> RptyResult<()> {
        let _ = stream.set_nodelay(true);
        let mut stream = BufReader::new(stream);

        let mut line = String::new();
        let read = {
            let mut limited = (&mut stream).take(MAX_INIT_LINE);
            tokio::time::timeout(INIT_TIMEOUT, limited.read_line(&mut line)).await
        };
        match read {
            Err(_) => return Err(RptyError::Timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(0)) => {
                debug!(%peer, "connection closed before init");
                return Ok(());
            }
            Ok(Ok(_)) => {}
        }

        let init: ReconnectingPtyInit = serde_json::from_str(line.trim())
            .map_err(|e| RptyError::InvalidMessage(format!("init line: {e}")))?;
        init.validate()?;

        let shell = &self.config.shell;
        let rpty = self
            .sessions
            .get_or_create(&init.id, || CommandSpec::shell(shell, &init.command))
            .await?;

        let conn_id = generate_conn_id();
        info!(
            %peer,
            session_id = %init.id,
            conn_id = %conn_id,
            height = init.height,
            width = init.width,
            "attaching connection"
        );
        let result = rpty
            .attach(&self.shutdown, &conn_id, stream, init.height, init.width)
            .await;
        info!(session_id = %init.id, conn_id = %conn_id, "connection detached");
        result
    }
}

/// Random connection ID (hex-encoded, 8 bytes).
fn generate_conn_id() -> String {
    use rand::Rng;
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}
