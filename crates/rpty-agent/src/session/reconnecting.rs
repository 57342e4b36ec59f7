//! The session supervisor.

use super::backend::{select_backend_type, Backend};
use super::buffered::RingBufferBackend;
use super::ring_buffer::DEFAULT_CAPACITY;
use super::screen::{CommandRunner, ScreenBackend, ScreenOptions, TokioCommandRunner};
use super::state::{State, StateMachine};
use super::timer::IdleTimer;
use crate::metrics::{FailureKind, Metrics, NoopMetrics};
use crate::pty::{CommandSpec, NativeSpawner, Spawner, Terminal};
use rpty_core::{BackendType, JsonFrameDecoder, ReconnectingPtyRequest, RptyError, RptyResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Idle timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Longest the first attach may take before an unattached session closes.
const ATTACH_GRACE: Duration = Duration::from_secs(30);

const READ_BUFFER_SIZE: usize = 4096;

/// Per-session settings.
#[derive(Clone)]
pub struct Options {
    /// Close after this long without an attached connection. Zero means
    /// [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    pub backend_type: BackendType,
    /// Ring-buffer scrollback capacity in bytes.
    pub buffer_size: usize,
    /// Idle window between start and the first attach. Defaults to the
    /// smaller of 30 seconds and `timeout`.
    pub attach_grace: Option<Duration>,
    pub metrics: Arc<dyn Metrics>,
    pub spawner: Arc<dyn Spawner>,
    pub runner: Arc<dyn CommandRunner>,
    pub screen: ScreenOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            backend_type: BackendType::Auto,
            buffer_size: DEFAULT_CAPACITY,
            attach_grace: None,
            metrics: Arc::new(NoopMetrics),
            spawner: Arc::new(NativeSpawner),
            runner: Arc::new(TokioCommandRunner),
            screen: ScreenOptions::default(),
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("timeout", &self.timeout)
            .field("backend_type", &self.backend_type)
            .field("buffer_size", &self.buffer_size)
            .field("attach_grace", &self.attach_grace)
            .field("screen", &self.screen)
            .finish_non_exhaustive()
    }
}

/// A terminal session that outlives its connections.
///
/// Any number of connections can [`attach`](Self::attach) at once; each sees
/// the scrollback followed by live output. The session closes when asked
/// to, when its parent token is cancelled, or after `timeout` with nothing
/// attached. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct ReconnectingPty {
    inner: Arc<Inner>,
}

struct Inner {
    state: Arc<StateMachine>,
    backend: Backend,
    timer: IdleTimer,
    timeout: Duration,
    metrics: Arc<dyn Metrics>,
    token: CancellationToken,
}

impl ReconnectingPty {
    /// Create the session and start its backend in the background.
    ///
    /// Must be called from within a tokio runtime. Cancelling `parent`
    /// closes the session.
    pub fn new(parent: &CancellationToken, command: CommandSpec, options: Options) -> Self {
        let timeout = if options.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            options.timeout
        };
        let grace = options.attach_grace.unwrap_or(ATTACH_GRACE.min(timeout));
        let state = Arc::new(StateMachine::new());

        let backend = match select_backend_type(options.backend_type, &options.screen.program) {
            BackendType::Multiplexer => Backend::Multiplexer(ScreenBackend::new(
                command,
                options.screen,
                options.spawner,
                options.runner,
                options.metrics.clone(),
            )),
            _ => Backend::RingBuffer(RingBufferBackend::new(
                command,
                options.buffer_size,
                options.spawner,
                options.metrics.clone(),
                state.clone(),
            )),
        };

        let timer = {
            let state = state.clone();
            IdleTimer::spawn(move || {
                info!("reconnecting pty timed out");
                state.set_state(
                    State::Closing,
                    Some(RptyError::Closing("reconnecting pty timeout".into())),
                );
            })
        };

        let inner = Arc::new(Inner {
            state,
            backend,
            timer,
            timeout,
            metrics: options.metrics,
            token: parent.child_token(),
        });
        tokio::spawn(inner.clone().lifecycle(grace));
        Self { inner }
    }

    /// Serve `conn` until it disconnects, the session closes, or `parent`
    /// is cancelled.
    ///
    /// Blocks until the session is ready. Disconnects and malformed frames
    /// end the attach with `Ok`; only failing to attach is an error.
    pub async fn attach<C>(
        &self,
        parent: &CancellationToken,
        conn_id: &str,
        conn: C,
        height: u16,
        width: u16,
    ) -> RptyResult<()>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let token = parent.child_token();
        let _detach = token.clone().drop_guard();

        let (state, err) = self
            .inner
            .state
            .wait_for_state_or_cancel(&token, State::Ready)
            .await;
        if state != State::Ready {
            let cause = err.unwrap_or(RptyError::Closing(state.to_string()));
            return Err(RptyError::NotReady(Box::new(cause)));
        }

        tokio::spawn(self.inner.clone().heartbeat(token.clone()));

        let (mut reader, writer) = tokio::io::split(conn);
        let terminal = self
            .inner
            .backend
            .attach(&token, conn_id, Box::new(writer), height, width)
            .await
            .map_err(|e| RptyError::Attach(Box::new(e)))?;
        debug!(conn_id, height, width, "reconnecting pty attached");

        let mut decoder = JsonFrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            loop {
                match decoder.next_frame::<ReconnectingPtyRequest>() {
                    Ok(Some(req)) => {
                        if !self.handle_request(conn_id, &terminal, req).await {
                            return Ok(());
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn_id, error = %e, "reconnecting pty failed with read error");
                        return Ok(());
                    }
                }
            }

            let n = tokio::select! {
                _ = token.cancelled() => {
                    debug!(conn_id, "reconnecting pty connection closed");
                    return Ok(());
                }
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        if decoder.has_partial() {
                            debug!(conn_id, pending = decoder.pending(), "connection ended mid-frame");
                        }
                        debug!(conn_id, "reconnecting pty connection ended");
                        return Ok(());
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(conn_id, error = %e, "reconnecting pty read failed");
                        return Ok(());
                    }
                },
            };
            decoder.extend(&buf[..n]);
        }
    }

    /// Apply one client frame. Returns false when the connection should end.
    async fn handle_request(
        &self,
        conn_id: &str,
        terminal: &Arc<dyn Terminal>,
        req: ReconnectingPtyRequest,
    ) -> bool {
        let wants_resize = req.wants_resize();
        if !req.data.is_empty() {
            let input = terminal.clone();
            let data = req.data.into_bytes();
            let written = tokio::task::spawn_blocking(move || input.write_input(&data))
                .await
                .unwrap_or_else(|e| Err(RptyError::Pty(format!("input writer task: {e}"))));
            if let Err(e) = written {
                warn!(conn_id, error = %e, "reconnecting pty failed to write data");
                self.inner.metrics.incr(FailureKind::InputWriter);
                return false;
            }
        }
        if wants_resize {
            if let Err(e) = terminal.resize(req.height, req.width) {
                // Only logged: some terminals reject resizes shortly after spawn.
                error!(conn_id, error = %e, height = req.height, width = req.width, "reconnecting pty resize failed");
                self.inner.metrics.incr(FailureKind::Resize);
            }
        }
        true
    }

    /// Wait until the session starts closing.
    pub async fn wait(&self) {
        self.inner.state.wait_for_state(State::Closing).await;
    }

    /// Close the session and wait until the process is gone. Does nothing
    /// if the session is already done.
    pub async fn close(&self, reason: &str) {
        self.inner
            .state
            .set_state(State::Closing, Some(RptyError::Closing(reason.to_string())));
        self.inner.state.wait_for_state(State::Done).await;
    }

    pub fn state(&self) -> State {
        self.inner.state.state()
    }

    /// Every error the session has collected so far, if any.
    pub fn error(&self) -> Option<RptyError> {
        self.inner.state.snapshot().1
    }

    pub fn backend_type(&self) -> BackendType {
        self.inner.backend.kind()
    }

    /// Whether both handles refer to the same session.
    pub fn same_session(&self, other: &ReconnectingPty) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ReconnectingPty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingPty")
            .field("state", &self.state())
            .field("backend", &self.backend_type())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

impl Inner {
    async fn lifecycle(self: Arc<Self>, grace: Duration) {
        if let Err(e) = self.backend.start().await {
            error!(error = %e, "reconnecting pty failed to start");
            self.timer.stop();
            self.state
                .set_state(State::Done, Some(RptyError::Start(Box::new(e))));
            return;
        }

        self.timer.reset(grace);
        self.state.set_state(State::Ready, None);
        debug!(backend = %self.backend.kind(), "reconnecting pty ready");

        let (state, _) = self
            .state
            .wait_for_state_or_cancel(&self.token, State::Closing)
            .await;
        if state < State::Closing {
            self.state
                .set_state(State::Closing, Some(RptyError::Cancelled));
        }

        self.timer.stop();
        let close_err = match self.backend.close().await {
            Ok(()) => None,
            Err(e) => {
                error!(error = %e, "reconnecting pty failed to close backend");
                Some(e)
            }
        };
        self.state
            .set_state(State::Done, RptyError::join(close_err, Some(RptyError::Done)));
        debug!("reconnecting pty closed");
    }

    /// Keep the idle timer from firing while `token` is live, and leave a
    /// full timeout window once it ends.
    async fn heartbeat(self: Arc<Self>, token: CancellationToken) {
        self.timer.reset(self.timeout);
        let period = (self.timeout / 2).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.timer.reset(self.timeout);
                }
            }
        }
        self.timer.reset(self.timeout);
    }
}
