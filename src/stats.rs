//! Endpoint statistics.
//!
//! Statistics are the primary user-visible telemetry: after `create`
//! succeeds, runtime failures never surface as errors, only as counter
//! movements and the base's last-error slot.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Statistic kinds recognized by the endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Outbound connection attempts currently in flight.
    InProgress,
    /// Connections successfully established (outbound connects and
    /// inbound accepts).
    Established,
    /// Established connections that failed afterwards.
    Broken,
    /// Outbound connect attempts that failed.
    ConnectErrors,
    /// Live connections abandoned by endpoint shutdown.
    Dropped,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    in_progress: AtomicI64,
    established: AtomicU64,
    broken: AtomicU64,
    connect_errors: AtomicU64,
    dropped: AtomicU64,
    sessions: AtomicUsize,
}

impl Stats {
    pub(crate) fn bump(&self, kind: Counter, delta: i64) {
        match kind {
            Counter::InProgress => {
                self.in_progress.fetch_add(delta, Ordering::Relaxed);
            }
            Counter::Established => {
                self.established.fetch_add(delta as u64, Ordering::Relaxed);
            }
            Counter::Broken => {
                self.broken.fetch_add(delta as u64, Ordering::Relaxed);
            }
            Counter::ConnectErrors => {
                self.connect_errors.fetch_add(delta as u64, Ordering::Relaxed);
            }
            Counter::Dropped => {
                self.dropped.fetch_add(delta as u64, Ordering::Relaxed);
            }
        }
    }

    /// Gauge of sessions currently held by the endpoint (accepted children
    /// or the single outbound session while active).
    pub(crate) fn set_sessions(&self, n: usize) {
        self.sessions.store(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            in_progress: self.in_progress.load(Ordering::Relaxed),
            established: self.established.load(Ordering::Relaxed),
            broken: self.broken.load(Ordering::Relaxed),
            connect_errors: self.connect_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of an endpoint's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub in_progress: i64,
    pub established: u64,
    pub broken: u64,
    pub connect_errors: u64,
    pub dropped: u64,
    /// Sessions currently held by the endpoint.
    pub sessions: usize,
}
