//! Screen backend: scrollback and reattachment via GNU `screen`.
//!
//! Every attach runs its own `screen -xRR` client in a fresh PTY. The first
//! one creates the daemon for the session's ID; later ones join it. The
//! daemon is not tied to any attach, only [`ScreenBackend::close`] ends it.

use super::{write_conn, ConnWriter};
use crate::metrics::{FailureKind, Metrics};
use crate::pty::{spawn_output_reader, CommandSpec, PtyOutput, Spawner, Terminal, TERM};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rpty_core::{RptyError, RptyResult};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output screen prints when asked about a session that does not exist.
pub const NO_SESSION: &str = "No screen session found";

const SETTINGS: &[&str] = &[
    // Let xterm* terminals scroll with the mouse wheel instead of screen
    // cycling through command history.
    "termcapinfo xterm* ti@:te@",
    // Full-screen applications must not overwrite the scrollback.
    "altscreen on",
    // C-a belongs to applications.
    "escape ^Ss",
];

/// Tuning for the screen backend.
#[derive(Debug, Clone)]
pub struct ScreenOptions {
    /// Name or path of the `screen` binary.
    pub program: String,
    /// Directory holding the generated screen config.
    pub state_dir: PathBuf,
    /// Delay between retries of `screen -X` commands.
    pub retry_interval: Duration,
    /// Upper bound on waiting for the daemon to answer.
    pub attach_timeout: Duration,
    /// `quit` output that still counts as success.
    pub quit_acceptable: Vec<String>,
    /// Seed for session IDs; `None` uses OS entropy.
    pub seed: Option<u64>,
}

impl Default for ScreenOptions {
    fn default() -> Self {
        Self {
            program: "screen".to_string(),
            state_dir: std::env::temp_dir().join("rpty-screen"),
            retry_interval: Duration::from_millis(250),
            attach_timeout: Duration::from_secs(30),
            quit_acceptable: vec![NO_SESSION.to_string()],
            seed: None,
        }
    }
}

/// Result of running a short-lived external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit status description, e.g. `exit status: 1`.
    pub status: String,
    pub stdout: String,
}

/// Runs external commands to completion.
pub trait CommandRunner: Send + Sync {
    fn run<'a>(&'a self, cmd: &'a CommandSpec) -> BoxFuture<'a, RptyResult<CommandOutput>>;
}

/// [`CommandRunner`] using `tokio::process`. Dropping the future kills the child.
#[derive(Debug, Default)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn run<'a>(&'a self, cmd: &'a CommandSpec) -> BoxFuture<'a, RptyResult<CommandOutput>> {
        async move {
            let mut command = tokio::process::Command::new(&cmd.program);
            command
                .args(&cmd.args)
                .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .env("TERM", TERM)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = &cmd.cwd {
                command.current_dir(dir);
            }
            let output = command.output().await?;
            Ok(CommandOutput {
                success: output.status.success(),
                status: output.status.to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            })
        }
        .boxed()
    }
}

pub(crate) struct ScreenBackend {
    command: CommandSpec,
    options: ScreenOptions,
    spawner: Arc<dyn Spawner>,
    runner: Arc<dyn CommandRunner>,
    metrics: Arc<dyn Metrics>,
    rng: Mutex<StdRng>,
    /// Session name for creating and attaching. The daemon's PID is never
    /// known and screen matches names by prefix, so the ID must be unique.
    id: OnceLock<String>,
    config_file: OnceLock<PathBuf>,
    /// Serializes attaches; concurrent `-xRR` spawns create duplicate daemons.
    attach_lock: tokio::sync::Mutex<()>,
}

impl ScreenBackend {
    pub(crate) fn new(
        command: CommandSpec,
        options: ScreenOptions,
        spawner: Arc<dyn Spawner>,
        runner: Arc<dyn CommandRunner>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            command,
            options,
            spawner,
            runner,
            metrics,
            rng: Mutex::new(rng),
            id: OnceLock::new(),
            config_file: OnceLock::new(),
            attach_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Pick the session ID and write the screen config. Must be called once.
    ///
    /// The daemon itself is spawned by the first attach so that it starts at
    /// the client's size rather than screen's default 24x80.
    pub(crate) async fn start(&self) -> RptyResult<()> {
        let id = self.generate_id()?;
        let config_file = self.options.state_dir.join("config");
        create_private_dir(&self.options.state_dir).await?;
        write_private_file(&config_file, SETTINGS.join("\n").as_bytes()).await?;

        self.id
            .set(id.clone())
            .map_err(|_| RptyError::Other("screen backend already started".into()))?;
        let _ = self.config_file.set(config_file);
        debug!(id = %id, "screen backend ready");
        Ok(())
    }

    fn generate_id(&self) -> RptyResult<String> {
        // Socket paths are limited to about 100 characters, keep the ID short.
        let mut buf = [0u8; 4];
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| RptyError::Other("screen id rng poisoned".into()))?;
        rng.try_fill_bytes(&mut buf)
            .map_err(|e| RptyError::Other(format!("generate screen id: {e}")))?;
        Ok(hex::encode(buf))
    }

    fn started(&self) -> RptyResult<(&str, &Path)> {
        match (self.id.get(), self.config_file.get()) {
            (Some(id), Some(config)) => Ok((id.as_str(), config.as_path())),
            _ => Err(RptyError::Other("screen backend not started".into())),
        }
    }

    /// The session ID, once started.
    #[cfg(test)]
    pub(crate) fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    /// Attach to the daemon (spawning it if needed) and pipe the client's
    /// output to `writer`. Cancelling `token` kills only this client.
    pub(crate) async fn attach(
        &self,
        token: &CancellationToken,
        conn_id: &str,
        writer: ConnWriter,
        height: u16,
        width: u16,
    ) -> RptyResult<Arc<dyn Terminal>> {
        let _serialized = self.attach_lock.lock().await;
        let (id, config_file) = self.started()?;

        let cmd = self.command.wrapped(
            &self.options.program,
            vec![
                // Session name.
                "-S".into(),
                id.to_string(),
                // -x: join even if attached elsewhere, -RR: reattach or create,
                // -q: no startup message, -c: config file.
                "-xRRqc".into(),
                config_file.display().to_string(),
            ],
        );
        // Spawn at the client's size; resizing afterwards leaves padding.
        let spawned = match self.spawner.spawn(&cmd, height, width) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.metrics.incr(FailureKind::Spawn);
                return Err(e);
            }
        };
        debug!(id = %id, conn_id, "screen spawned");

        let terminal = spawned.terminal;
        let output = match spawn_output_reader(spawned.output) {
            Ok(output) => output,
            Err(e) => {
                kill_terminal(terminal).await;
                return Err(e);
            }
        };

        tokio::spawn(pump_to_conn(
            output,
            writer,
            token.clone(),
            self.metrics.clone(),
            conn_id.to_string(),
        ));

        {
            let terminal = terminal.clone();
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                kill_terminal(terminal).await;
            });
        }

        // `version` has no side effects. Until it succeeds the daemon is not
        // registered and a second -xRR would spawn another one.
        if let Err(e) = self.send_command(token, "version", &[]).await {
            kill_terminal(terminal).await;
            self.metrics.incr(FailureKind::Wait);
            return Err(e);
        }

        Ok(terminal)
    }

    /// Ask screen to quit the session. A missing session counts as closed.
    pub(crate) async fn close(&self) -> RptyResult<()> {
        if self.id.get().is_none() {
            return Ok(());
        }
        let acceptable = self.options.quit_acceptable.clone();
        self.send_command(&CancellationToken::new(), "quit", &acceptable)
            .await
    }

    /// Run `screen -S <id> -X <command>` until it succeeds, its stdout
    /// contains one of `acceptable`, `parent` is cancelled, or the attach
    /// timeout elapses. The last two return the cause joined with the last
    /// command error.
    async fn send_command(
        &self,
        parent: &CancellationToken,
        command: &str,
        acceptable: &[String],
    ) -> RptyResult<()> {
        let (id, config_file) = self.started()?;
        let cmd = CommandSpec {
            program: self.options.program.clone(),
            args: vec![
                "-S".into(),
                id.to_string(),
                "-c".into(),
                config_file.display().to_string(),
                // Run a command in the matching session.
                "-X".into(),
                command.to_string(),
            ],
            env: self.command.env.clone(),
            cwd: self.command.cwd.clone(),
        };
        let display = format!("{} -S {id} -X {command}", self.options.program);

        let deadline = Instant::now() + self.options.attach_timeout;
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.options.retry_interval,
            self.options.retry_interval,
        );
        let mut last_err: Option<RptyError> = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = parent.cancelled() => {
                    return Err(joined(RptyError::Cancelled, last_err));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(joined(RptyError::Timeout, last_err));
                }
                result = self.runner.run(&cmd) => result,
            };

            match result {
                Ok(out) if out.success => return Ok(()),
                Ok(out) if acceptable.iter().any(|s| out.stdout.contains(s.as_str())) => {
                    return Ok(())
                }
                // Exit statuses are vague; stdout usually says what went wrong.
                Ok(out) => {
                    last_err = Some(RptyError::Command {
                        command: display.clone(),
                        status: out.status,
                        stdout: out.stdout.trim().to_string(),
                        attempt,
                    })
                }
                Err(e) => {
                    last_err = Some(RptyError::Command {
                        command: display.clone(),
                        status: e.to_string(),
                        stdout: String::new(),
                        attempt,
                    })
                }
            }

            tokio::select! {
                biased;
                _ = parent.cancelled() => {
                    return Err(joined(RptyError::Cancelled, last_err));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(joined(RptyError::Timeout, last_err));
                }
                _ = ticker.tick() => {}
            }
        }
    }
}

fn joined(cause: RptyError, last: Option<RptyError>) -> RptyError {
    RptyError::join(Some(cause), last).unwrap_or(RptyError::Timeout)
}

/// Copy one screen client's output to its connection. Ending closes only
/// that connection; the daemon keeps running.
async fn pump_to_conn(
    mut output: mpsc::Receiver<PtyOutput>,
    mut writer: ConnWriter,
    token: CancellationToken,
    metrics: Arc<dyn Metrics>,
    conn_id: String,
) {
    while let Some(item) = output.recv().await {
        match item {
            PtyOutput::Data(part) => {
                if let Err(e) = write_conn(&mut writer, &part).await {
                    if !is_closed_conn(&e) {
                        warn!(conn_id = %conn_id, error = %e, "error writing to active conn");
                        metrics.incr(FailureKind::Write);
                    }
                    break;
                }
            }
            PtyOutput::Eof => {
                debug!(conn_id = %conn_id, "unable to read pty output; screen might have exited");
                break;
            }
            PtyOutput::Failed(e) => {
                warn!(conn_id = %conn_id, error = %e, "unable to read pty output; screen might have exited");
                metrics.incr(FailureKind::OutputReader);
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
    token.cancel();
}

fn is_closed_conn(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}

async fn kill_terminal(terminal: Arc<dyn Terminal>) {
    let killer = terminal.clone();
    let _ = tokio::task::spawn_blocking(move || killer.kill()).await;
    let _ = terminal.close();
}

#[cfg(unix)]
async fn create_private_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .await
}

#[cfg(not(unix))]
async fn create_private_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

async fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::FailureCounters;
    use crate::testutil::{eventually, FakeSpawner};
    use tokio::io::AsyncReadExt;

    /// Simulated screen daemon bookkeeping.
    #[derive(Default)]
    struct Daemon {
        /// Daemons ever created for the session name.
        created: usize,
        /// When the newest daemon answers commands.
        ready_at: Option<std::time::Instant>,
        commands: Vec<String>,
    }

    /// Plays the `screen -X` side of a daemon that takes `init_delay` to come up.
    struct FakeScreen {
        daemon: Arc<Mutex<Daemon>>,
        always_fail: bool,
    }

    impl CommandRunner for FakeScreen {
        fn run<'a>(&'a self, cmd: &'a CommandSpec) -> BoxFuture<'a, RptyResult<CommandOutput>> {
            async move {
                let command = cmd.args.last().cloned().unwrap_or_default();
                let mut daemon = self.daemon.lock().unwrap();
                daemon.commands.push(command.clone());
                let up = daemon
                    .ready_at
                    .is_some_and(|at| std::time::Instant::now() >= at);
                if self.always_fail || !up {
                    return Ok(CommandOutput {
                        success: false,
                        status: "exit status: 1".into(),
                        stdout: format!("{NO_SESSION}.\n"),
                    });
                }
                if command == "quit" {
                    daemon.ready_at = None;
                }
                Ok(CommandOutput {
                    success: true,
                    status: "exit status: 0".into(),
                    stdout: String::new(),
                })
            }
            .boxed()
        }
    }

    struct Harness {
        backend: ScreenBackend,
        spawner: Arc<FakeSpawner>,
        daemon: Arc<Mutex<Daemon>>,
        metrics: Arc<FailureCounters>,
        dir: tempfile::TempDir,
    }

    fn harness(init_delay: Duration, always_fail: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(Mutex::new(Daemon::default()));
        let spawn_daemon = daemon.clone();
        // `-xRR` creates a daemon unless one is already registered.
        let spawner = FakeSpawner::with_hook(move |_| {
            let mut d = spawn_daemon.lock().unwrap();
            let now = std::time::Instant::now();
            match d.ready_at {
                Some(at) if now >= at => {}
                _ => {
                    d.created += 1;
                    d.ready_at = Some(now + init_delay);
                }
            }
            Ok(())
        });
        let metrics = Arc::new(FailureCounters::new());
        let options = ScreenOptions {
            state_dir: dir.path().join("screen"),
            retry_interval: Duration::from_millis(5),
            attach_timeout: Duration::from_millis(500),
            seed: Some(7),
            ..ScreenOptions::default()
        };
        let backend = ScreenBackend::new(
            CommandSpec::new("/bin/sh").arg("-l").env("FOO", "bar"),
            options,
            spawner.clone(),
            Arc::new(FakeScreen {
                daemon: daemon.clone(),
                always_fail,
            }),
            metrics.clone(),
        );
        Harness {
            backend,
            spawner,
            daemon,
            metrics,
            dir,
        }
    }

    #[tokio::test]
    async fn start_writes_config_and_short_id() {
        let h = harness(Duration::ZERO, false);
        h.backend.start().await.unwrap();

        let id = h.backend.id().unwrap().to_string();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        let config = std::fs::read_to_string(h.dir.path().join("screen").join("config")).unwrap();
        assert!(config.contains("altscreen on"));
        assert!(config.contains("escape ^Ss"));
        assert!(config.contains("termcapinfo xterm* ti@:te@"));

        assert!(h.backend.start().await.is_err());
    }

    #[test]
    fn seeded_ids_are_reproducible() {
        let make = |seed| {
            ScreenBackend::new(
                CommandSpec::new("sh"),
                ScreenOptions {
                    seed: Some(seed),
                    ..ScreenOptions::default()
                },
                FakeSpawner::new(),
                Arc::new(TokioCommandRunner),
                Arc::new(FailureCounters::new()),
            )
        };
        assert_eq!(make(1).generate_id().unwrap(), make(1).generate_id().unwrap());
        assert_ne!(make(1).generate_id().unwrap(), make(2).generate_id().unwrap());
    }

    #[tokio::test]
    async fn attach_spawns_screen_at_client_size() {
        let h = harness(Duration::ZERO, false);
        h.backend.start().await.unwrap();
        let id = h.backend.id().unwrap().to_string();

        let (ours, _theirs) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        h.backend
            .attach(&token, "c1", Box::new(ours), 50, 132)
            .await
            .unwrap();

        let spawned = h.spawner.spawned.lock().unwrap().clone();
        let (cmd, height, width) = &spawned[0];
        assert_eq!((*height, *width), (50, 132));
        assert_eq!(cmd.program, "screen");
        assert_eq!(cmd.args[..3], ["-S".to_string(), id, "-xRRqc".to_string()]);
        assert_eq!(cmd.args[4..], ["/bin/sh".to_string(), "-l".to_string()]);
        assert_eq!(cmd.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(h.daemon.lock().unwrap().commands, vec!["version"]);
    }

    #[tokio::test]
    async fn concurrent_first_attaches_create_one_daemon() {
        let h = Arc::new(harness(Duration::from_millis(40), false));
        h.backend.start().await.unwrap();

        let attach = |name: &'static str| {
            let h = h.clone();
            tokio::spawn(async move {
                let (ours, theirs) = tokio::io::duplex(1024);
                let token = CancellationToken::new();
                let result = h
                    .backend
                    .attach(&token, name, Box::new(ours), 24, 80)
                    .await;
                (result.map(|_| ()), token, theirs)
            })
        };
        let (a, b) = tokio::join!(attach("a"), attach("b"));
        let (a, _ta, _ca) = a.unwrap();
        let (b, _tb, _cb) = b.unwrap();
        a.unwrap();
        b.unwrap();

        assert_eq!(h.spawner.spawn_count(), 2);
        assert_eq!(h.daemon.lock().unwrap().created, 1);
    }

    #[tokio::test]
    async fn version_check_timeout_fails_attach() {
        let h = harness(Duration::ZERO, true);
        h.backend.start().await.unwrap();

        let (ours, _theirs) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        let err = match h.backend.attach(&token, "c", Box::new(ours), 24, 80).await {
            Ok(_) => panic!("attach should time out"),
            Err(e) => e,
        };
        let parts = err.parts();
        assert!(matches!(parts[0], RptyError::Timeout));
        assert!(err.to_string().contains("-X version"));
        assert!(err.to_string().contains(NO_SESSION));
        assert!(h.daemon.lock().unwrap().commands.len() > 1);
        assert_eq!(h.metrics.get(FailureKind::Wait), 1);
        assert!(h.spawner.terminal(0).is_killed());
    }

    #[tokio::test]
    async fn detach_kills_client_only() {
        let h = harness(Duration::ZERO, false);
        h.backend.start().await.unwrap();

        let (ours, mut theirs) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        h.backend
            .attach(&token, "c", Box::new(ours), 24, 80)
            .await
            .unwrap();
        let client = h.spawner.terminal(0);
        client.emit(b"$ ");
        let mut prompt = [0u8; 2];
        theirs.read_exact(&mut prompt).await.unwrap();
        assert_eq!(&prompt, b"$ ");

        token.cancel();
        eventually(|| client.is_killed()).await;
        assert!(!h.daemon.lock().unwrap().commands.contains(&"quit".to_string()));
    }

    #[tokio::test]
    async fn client_exit_closes_connection() {
        let h = harness(Duration::ZERO, false);
        h.backend.start().await.unwrap();

        let (ours, mut theirs) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        h.backend
            .attach(&token, "c", Box::new(ours), 24, 80)
            .await
            .unwrap();
        h.spawner.terminal(0).exit();

        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn close_quits_and_tolerates_missing_session() {
        let h = harness(Duration::ZERO, false);
        h.backend.start().await.unwrap();

        let (ours, _theirs) = tokio::io::duplex(1024);
        let token = CancellationToken::new();
        h.backend
            .attach(&token, "c", Box::new(ours), 24, 80)
            .await
            .unwrap();

        h.backend.close().await.unwrap();
        assert_eq!(h.daemon.lock().unwrap().commands.last().unwrap(), "quit");
        // The daemon is gone now; quitting again is still fine.
        h.backend.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_before_start_is_noop() {
        let h = harness(Duration::ZERO, false);
        h.backend.close().await.unwrap();
        assert!(h.daemon.lock().unwrap().commands.is_empty());
    }
}
