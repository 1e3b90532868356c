//! Aggregate server statistics
//!
//! Counters are atomics mutated by every session's start and finish; a
//! session's byte totals are folded in only after it fully terminates, so
//! observers never see partial counts. Snapshots are available on demand
//! and as a `watch` stream for live display.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Shared aggregate counters
#[derive(Debug)]
pub struct ServerStats {
    active_sessions: AtomicU64,
    total_sessions: AtomicU64,
    total_bytes: AtomicU64,
    snapshot_tx: watch::Sender<StatsSnapshot>,
}

/// A point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Sessions currently between accept and finish
    pub active_sessions: u64,
    /// Sessions accepted since startup
    pub total_sessions: u64,
    /// Bytes transferred by finished sessions, both directions
    pub total_bytes: u64,
}

impl ServerStats {
    /// Create zeroed stats
    #[must_use]
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(StatsSnapshot::default());
        Self {
            active_sessions: AtomicU64::new(0),
            total_sessions: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            snapshot_tx,
        }
    }

    /// Begin tracking a session; the returned guard ends it
    ///
    /// Increments the active and cumulative session counters immediately.
    /// When the guard drops - normal completion, error, or task abort -
    /// the active count falls and any bytes recorded on the guard are
    /// folded into the cumulative total.
    #[must_use]
    pub fn begin_session(self: &Arc<Self>) -> SessionGuard {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        self.total_sessions.fetch_add(1, Ordering::SeqCst);
        self.publish();
        SessionGuard {
            stats: Arc::clone(self),
            bytes: 0,
        }
    }

    /// Current number of in-flight sessions
    #[must_use]
    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::SeqCst),
            total_sessions: self.total_sessions.load(Ordering::SeqCst),
            total_bytes: self.total_bytes.load(Ordering::SeqCst),
        }
    }

    /// Live snapshot stream; yields on every counter change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatsSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn finish_session(&self, bytes: u64) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        self.total_bytes.fetch_add(bytes, Ordering::SeqCst);
        self.publish();
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot());
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for one tracked session
///
/// Holds the active-session slot; dropping it releases the slot and
/// publishes the session's byte total.
#[derive(Debug)]
pub struct SessionGuard {
    stats: Arc<ServerStats>,
    bytes: u64,
}

impl SessionGuard {
    /// Record the session's final byte total before the guard drops
    pub fn record_bytes(&mut self, bytes: u64) {
        self.bytes = bytes;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.stats.finish_session(self.bytes);
    }
}
