//! Shared endpoint base: address, options, statistics and the last-error
//! slot, borrowed by the endpoint machine and the user-facing handle.

use crate::{
    options::Options,
    stats::{Counter, Stats, StatsSnapshot},
};
use std::{io, sync::Arc, sync::Mutex};
use tokio::sync::watch;

#[derive(Debug)]
pub(crate) struct EndpointBase {
    address: String,
    options: Options,
    stats: Stats,
    /// Most recent transient network error, if any. Stored behind an `Arc`
    /// so callers get a cloneable handle (`io::Error` itself is not
    /// `Clone`).
    last_error: Mutex<Option<Arc<io::Error>>>,
    /// Flipped to `true` exactly once, when the endpoint machine has fully
    /// quiesced and reached its terminal state.
    quiesced: watch::Sender<bool>,
}

impl EndpointBase {
    pub(crate) fn new(address: String, options: Options) -> Self {
        Self {
            address,
            options,
            stats: Stats::default(),
            last_error: Mutex::new(None),
            quiesced: watch::Sender::new(false),
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    pub(crate) fn bump(&self, kind: Counter, delta: i64) {
        self.stats.bump(kind, delta);
    }

    pub(crate) fn set_sessions(&self, n: usize) {
        self.stats.set_sessions(n);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn set_error(&self, err: io::Error) {
        *self.last_error.lock().unwrap() = Some(Arc::new(err));
    }

    pub(crate) fn clear_error(&self) {
        *self.last_error.lock().unwrap() = None;
    }

    pub(crate) fn last_error(&self) -> Option<Arc<io::Error>> {
        self.last_error.lock().unwrap().clone()
    }

    /// Called by the endpoint machine once it has reached its terminal
    /// state with every sub-machine quiesced.
    pub(crate) fn stopped(&self) {
        self.quiesced.send_replace(true);
    }

    pub(crate) async fn wait_stopped(&self) {
        let mut rx = self.quiesced.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}
