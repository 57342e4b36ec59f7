//! In-memory stand-ins for terminals and spawners.

use crate::pty::{CommandSpec, SpawnedPty, Spawner, Terminal};
use rpty_core::{RptyError, RptyResult};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Blocking reader fed through a channel. EOF once every sender is gone.
pub struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Terminal whose output is driven by the test.
#[derive(Default)]
pub struct FakeTerminal {
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pub input: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    pub closed: AtomicBool,
    pub killed: AtomicBool,
    pub fail_resize: AtomicBool,
    pub fail_input: AtomicBool,
}

impl FakeTerminal {
    pub fn new() -> (Arc<Self>, ChannelReader) {
        let (tx, rx) = mpsc::channel();
        let terminal = Arc::new(Self {
            output: Mutex::new(Some(tx)),
            ..Self::default()
        });
        let reader = ChannelReader {
            rx,
            pending: Vec::new(),
        };
        (terminal, reader)
    }

    /// Produce terminal output as if the process printed it.
    pub fn emit(&self, data: &[u8]) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Simulate the process exiting.
    pub fn exit(&self) {
        self.output.lock().unwrap().take();
    }

    pub fn input_string(&self) -> String {
        String::from_utf8_lossy(&self.input.lock().unwrap()).into_owned()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl Terminal for FakeTerminal {
    fn write_input(&self, data: &[u8]) -> RptyResult<()> {
        if self.fail_input.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(RptyError::Pty("input closed".into()));
        }
        self.input.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, height: u16, width: u16) -> RptyResult<()> {
        if self.fail_resize.load(Ordering::SeqCst) {
            return Err(RptyError::Pty("resize rejected".into()));
        }
        self.resizes.lock().unwrap().push((height, width));
        Ok(())
    }

    fn close(&self) -> RptyResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.exit();
        Ok(())
    }

    fn kill(&self) -> RptyResult<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit();
        Ok(())
    }
}

type SpawnHook = Box<dyn Fn(&CommandSpec) -> RptyResult<()> + Send + Sync>;

/// Spawner handing out [`FakeTerminal`]s and recording what it was asked to run.
#[derive(Default)]
pub struct FakeSpawner {
    pub spawned: Mutex<Vec<(CommandSpec, u16, u16)>>,
    pub terminals: Mutex<Vec<Arc<FakeTerminal>>>,
    hook: Option<SpawnHook>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `hook` before every spawn; an error fails the spawn.
    pub fn with_hook(
        hook: impl Fn(&CommandSpec) -> RptyResult<()> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            hook: Some(Box::new(hook)),
            ..Self::default()
        })
    }

    pub fn failing(message: &'static str) -> Arc<Self> {
        Self::with_hook(move |_| Err(RptyError::Spawn(message.into())))
    }

    pub fn terminal(&self, index: usize) -> Arc<FakeTerminal> {
        self.terminals.lock().unwrap()[index].clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, cmd: &CommandSpec, height: u16, width: u16) -> RptyResult<SpawnedPty> {
        if let Some(hook) = &self.hook {
            hook(cmd)?;
        }
        let (terminal, reader) = FakeTerminal::new();
        self.spawned
            .lock()
            .unwrap()
            .push((cmd.clone(), height, width));
        self.terminals.lock().unwrap().push(terminal.clone());
        Ok(SpawnedPty {
            terminal,
            output: Box::new(reader),
        })
    }
}

/// Poll `check` until it holds, yielding to other tasks in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not met in time");
}

/// [`eventually`] for checks that need to await.
pub async fn eventually_async<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not met in time");
}
