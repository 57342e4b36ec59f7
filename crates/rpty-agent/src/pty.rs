//! PTY seam using portable-pty.
//!
//! Backends only see the [`Spawner`] and [`Terminal`] traits, so tests can
//! run without a real pseudo-terminal.

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use rpty_core::{RptyError, RptyResult};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Terminal type exported to every spawned process.
pub const TERM: &str = "xterm-256color";

/// Size of each output read.
pub const OUTPUT_CHUNK_SIZE: usize = 1024;

/// Description of the process to run inside a terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Run `command` through `shell -c`, or start the bare shell when empty.
    pub fn shell(shell: &str, command: &str) -> Self {
        let spec = Self::new(shell);
        if command.trim().is_empty() {
            spec
        } else {
            spec.arg("-c").arg(command)
        }
    }

    /// The user's login shell, falling back to `/bin/sh`.
    pub fn default_shell() -> String {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }

    /// The same command wrapped by another program, e.g. a multiplexer.
    ///
    /// Environment and working directory are kept.
    pub fn wrapped(&self, program: &str, leading_args: Vec<String>) -> Self {
        let mut args = leading_args;
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());
        Self {
            program: program.to_string(),
            args,
            env: self.env.clone(),
            cwd: self.cwd.clone(),
        }
    }

    /// Human-readable command line for logs and errors.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Control side of a running terminal.
pub trait Terminal: Send + Sync {
    /// Write client input to the terminal (blocking).
    fn write_input(&self, data: &[u8]) -> RptyResult<()>;

    /// Resize the terminal to `height` rows by `width` columns.
    fn resize(&self, height: u16, width: u16) -> RptyResult<()>;

    /// Close the terminal. Further input fails and output reaches EOF.
    fn close(&self) -> RptyResult<()>;

    /// Kill the process running in the terminal.
    fn kill(&self) -> RptyResult<()>;
}

/// A freshly spawned process and its output stream.
pub struct SpawnedPty {
    pub terminal: Arc<dyn Terminal>,
    pub output: Box<dyn Read + Send>,
}

/// Starts processes inside terminals.
pub trait Spawner: Send + Sync {
    fn spawn(&self, cmd: &CommandSpec, height: u16, width: u16) -> RptyResult<SpawnedPty>;
}

/// [`Spawner`] backed by the operating system's PTY implementation.
#[derive(Debug, Default)]
pub struct NativeSpawner;

impl Spawner for NativeSpawner {
    fn spawn(&self, cmd: &CommandSpec, height: u16, width: u16) -> RptyResult<SpawnedPty> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(pty_size(height, width))
            .map_err(|e| RptyError::Pty(format!("failed to open PTY: {e}")))?;

        let mut builder = CommandBuilder::new(&cmd.program);
        builder.args(&cmd.args);
        for (key, value) in &cmd.env {
            builder.env(key, value);
        }
        builder.env("TERM", TERM);
        if let Some(dir) = &cmd.cwd {
            builder.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| RptyError::Spawn(format!("{}: {e}", cmd.display())))?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        info!(command = %cmd.display(), height, width, pid = ?child.process_id(), "PTY spawned");

        let output = pair
            .master
            .try_clone_reader()
            .map_err(|e| RptyError::Pty(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RptyError::Pty(format!("failed to take PTY writer: {e}")))?;

        let handle = PtyHandle {
            writer: Mutex::new(Some(writer)),
            master: Mutex::new(Some(pair.master)),
            child: Mutex::new(child),
        };

        Ok(SpawnedPty {
            terminal: Arc::new(handle),
            output,
        })
    }
}

fn pty_size(height: u16, width: u16) -> PtySize {
    PtySize {
        rows: height,
        cols: width,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A managed native PTY instance.
struct PtyHandle {
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Kept for resize; dropping it hangs up the terminal.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl Terminal for PtyHandle {
    fn write_input(&self, data: &[u8]) -> RptyResult<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| RptyError::Pty("PTY writer lock poisoned".into()))?;
        let writer = guard
            .as_mut()
            .ok_or_else(|| RptyError::Pty("PTY is closed".into()))?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, height: u16, width: u16) -> RptyResult<()> {
        let guard = self
            .master
            .lock()
            .map_err(|_| RptyError::Pty("PTY master lock poisoned".into()))?;
        let master = guard
            .as_ref()
            .ok_or_else(|| RptyError::Pty("PTY is closed".into()))?;
        master
            .resize(pty_size(height, width))
            .map_err(|e| RptyError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(height, width, "PTY resized");
        Ok(())
    }

    fn close(&self) -> RptyResult<()> {
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
        Ok(())
    }

    fn kill(&self) -> RptyResult<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| RptyError::Pty("child lock poisoned".into()))?;
        if let Ok(Some(status)) = child.try_wait() {
            debug!(code = status.exit_code(), "PTY child already exited");
            return Ok(());
        }
        child
            .kill()
            .map_err(|e| RptyError::Pty(format!("kill failed: {e}")))?;
        // Reap so the child does not linger as a zombie.
        let status = child.wait()?;
        info!(code = status.exit_code(), "PTY child exited");
        Ok(())
    }
}

/// One item from a terminal's output stream.
#[derive(Debug)]
pub enum PtyOutput {
    Data(Vec<u8>),
    /// The process exited and all output has been read.
    Eof,
    Failed(io::Error),
}

/// Move a blocking output reader onto its own thread.
///
/// Chunks of at most [`OUTPUT_CHUNK_SIZE`] bytes arrive in read order. The
/// last item is always [`PtyOutput::Eof`] or [`PtyOutput::Failed`].
pub fn spawn_output_reader(
    mut reader: Box<dyn Read + Send>,
) -> RptyResult<mpsc::Receiver<PtyOutput>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::Builder::new()
        .name("rpty-output".into())
        .spawn(move || {
            let mut buffer = [0u8; OUTPUT_CHUNK_SIZE];
            loop {
                let item = match reader.read(&mut buffer) {
                    Ok(0) => PtyOutput::Eof,
                    Ok(n) => PtyOutput::Data(buffer[..n].to_vec()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_hangup(&e) => PtyOutput::Eof,
                    Err(e) => PtyOutput::Failed(e),
                };
                let last = !matches!(item, PtyOutput::Data(_));
                if tx.blocking_send(item).is_err() || last {
                    break;
                }
            }
        })
        .map_err(|e| RptyError::Pty(format!("failed to start output reader: {e}")))?;
    Ok(rx)
}

/// Linux reports EIO on the master once the slave side has gone away.
fn is_hangup(e: &io::Error) -> bool {
    const EIO: i32 = 5;
    cfg!(unix) && e.raw_os_error() == Some(EIO)
}
