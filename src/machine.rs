//! Plumbing shared by the endpoint sub-machines.
//!
//! Every sub-machine (socket, session, resolver, backoff timer) is owned
//! exclusively by its endpoint and reports back through a delivery closure
//! wrapping the endpoint's event queue. The closure carries the source tag
//! and holds no ownership of the endpoint, so sub-machines can never keep
//! their parent alive or call into it reentrantly: events are always
//! deferred through the queue and handled in a later handler invocation.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};
use tokio::sync::mpsc::UnboundedSender;

/// Lifecycle phase of a sub-machine.
///
/// `Running` covers the whole span from the initiating command until a stop
/// is requested, including the quiescent hold after a terminal `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Phase {
    Idle = 0,
    Running = 1,
    Stopping = 2,
}

/// Phase shared between a sub-machine handle and the task carrying its
/// work. The task stores `Idle` immediately before emitting its terminal
/// event, so by the time the owner dequeues a `Stopped` the whole idle set
/// reads consistently.
#[derive(Debug, Default)]
pub(crate) struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub(crate) fn get(&self) -> Phase {
        match self.0.load(Ordering::Acquire) {
            0 => Phase::Idle,
            1 => Phase::Running,
            _ => Phase::Stopping,
        }
    }

    pub(crate) fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// Event-delivery callback handed to a sub-machine at construction.
pub(crate) type Deliver<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Builds the delivery closure for one sub-machine: `wrap` tags the
/// sub-machine's event with its source and the result is pushed onto the
/// owner's queue. A send after the owner is gone is silently dropped.
pub(crate) fn deliver<E, P, F>(tx: UnboundedSender<P>, wrap: F) -> Deliver<E>
where
    E: 'static,
    P: Send + 'static,
    F: Fn(E) -> P + Send + Sync + 'static,
{
    Arc::new(move |event| {
        let _ = tx.send(wrap(event));
    })
}
