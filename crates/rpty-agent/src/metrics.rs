//! Failure counters for reconnecting PTY sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Category of a counted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FailureKind {
    /// Reading terminal output failed with something other than EOF.
    OutputReader,
    /// Appending output to the scrollback buffer failed.
    WriteBuffer,
    /// Writing output (or replayed scrollback) to a connection failed.
    Write,
    /// Resizing the terminal failed.
    Resize,
    /// Writing client input to the terminal failed.
    InputWriter,
    /// Spawning the multiplexer client failed.
    Spawn,
    /// Waiting for the multiplexer session to come up failed.
    Wait,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::OutputReader => "output_reader",
            FailureKind::WriteBuffer => "write_buffer",
            FailureKind::Write => "write",
            FailureKind::Resize => "resize",
            FailureKind::InputWriter => "input_writer",
            FailureKind::Spawn => "spawn",
            FailureKind::Wait => "wait",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write-only sink for failure counts.
pub trait Metrics: Send + Sync {
    fn incr(&self, kind: FailureKind);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _kind: FailureKind) {}
}

/// In-memory counters keyed by failure kind.
#[derive(Debug, Default)]
pub struct FailureCounters {
    counts: Mutex<HashMap<FailureKind, u64>>,
}

impl FailureCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for one kind.
    pub fn get(&self, kind: FailureKind) -> u64 {
        self.counts
            .lock()
            .map(|c| c.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// All nonzero counts, sorted by kind.
    pub fn snapshot(&self) -> Vec<(FailureKind, u64)> {
        let mut out: Vec<_> = match self.counts.lock() {
            Ok(counts) => counts.iter().map(|(k, v)| (*k, *v)).collect(),
            Err(_) => Vec::new(),
        };
        out.sort();
        out
    }
}

impl Metrics for FailureCounters {
    fn incr(&self, kind: FailureKind) {
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(kind).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_kind() {
        let counters = FailureCounters::new();
        counters.incr(FailureKind::Resize);
        counters.incr(FailureKind::Resize);
        counters.incr(FailureKind::Write);
        assert_eq!(counters.get(FailureKind::Resize), 2);
        assert_eq!(counters.get(FailureKind::Write), 1);
        assert_eq!(counters.get(FailureKind::Spawn), 0);
        assert_eq!(
            counters.snapshot(),
            vec![(FailureKind::Write, 1), (FailureKind::Resize, 2)]
        );
    }
}
