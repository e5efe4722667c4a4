//! Observability sink injected into request handlers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// The operations a handler reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Streamed upload.
    Write,
    /// Streamed download.
    Read,
    /// Name listing.
    List,
    /// Attribute lookup.
    Stat,
    /// Name change.
    Rename,
    /// Entry deletion.
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Write => "write",
            Operation::Read => "read",
            Operation::List => "list",
            Operation::Stat => "stat",
            Operation::Rename => "rename",
            Operation::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// Receives counts from the request handler.
///
/// Not required for correctness; every method defaults to doing nothing.
pub trait Metrics: Send + Sync + fmt::Debug {
    /// A request entered the handler.
    fn request_started(&self, _op: Operation) {}

    /// A request left the handler.
    fn request_finished(&self, _op: Operation, _ok: bool) {}

    /// Payload bytes received from a client.
    fn bytes_received(&self, _n: u64) {}

    /// Payload bytes sent to a client.
    fn bytes_sent(&self, _n: u64) {}
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {}

/// Lock-free counters.
#[derive(Debug, Default)]
pub struct Counters {
    pending: AtomicU64,
    total: AtomicU64,
    failed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`Counters`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    /// Requests currently in flight.
    pub pending: u64,
    /// Requests completed, successful or not.
    pub total: u64,
    /// Requests that completed with an error.
    pub failed: u64,
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
}

impl Counters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            pending: self.pending.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Metrics for Counters {
    fn request_started(&self, _op: Operation) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    fn request_finished(&self, _op: Operation, ok: bool) {
        self.pending.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    fn bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}
