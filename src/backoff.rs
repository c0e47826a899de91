//! Reconnect backoff timer sub-machine.
//!
//! The delay starts at `reconnect_ivl` and doubles on every start, capped
//! at `reconnect_ivl_max` (zero meaning "equal to `reconnect_ivl`", i.e.
//! no growth). `reset` rewinds the delay after a successful connection.
//!
//! Lifecycle contract: `start` arms a timer task which emits at most one
//! `Timeout`; a `stop` always yields exactly one terminal `Stopped` and
//! nothing after it.

use crate::machine::{Deliver, Phase, PhaseCell};
use std::{cmp, sync::Arc, time::Duration};
use tokio::{sync::oneshot, time};

#[derive(Debug)]
pub(crate) enum BackoffEvent {
    Timeout,
    Stopped,
}

pub(crate) struct Backoff {
    deliver: Deliver<BackoffEvent>,
    phase: Arc<PhaseCell>,
    stop_tx: Option<oneshot::Sender<()>>,
    next: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(deliver: Deliver<BackoffEvent>, ivl: Duration, max_ivl: Duration) -> Self {
        let max = if max_ivl.is_zero() { ivl } else { max_ivl };
        Self {
            deliver,
            phase: Arc::new(PhaseCell::default()),
            stop_tx: None,
            next: ivl,
            min: ivl,
            max,
        }
    }

    /// Arms the timer with the current delay and grows the delay for the
    /// next failure.
    pub(crate) fn start(&mut self) {
        debug_assert!(self.is_idle());
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        self.stop_tx = Some(stop_tx);
        self.phase.set(Phase::Running);

        let delay = self.next;
        self.next = cmp::min(self.next.saturating_mul(2), self.max);

        let deliver = self.deliver.clone();
        let phase = self.phase.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                _ = time::sleep(delay) => {
                    deliver(BackoffEvent::Timeout);
                    let _ = stop_rx.await;
                }
            }
            phase.set(Phase::Idle);
            deliver(BackoffEvent::Stopped);
        });
    }

    /// Requests the terminal `Stopped`. A second call, or a call while the
    /// timer is idle, is a no-op.
    pub(crate) fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            self.phase.set(Phase::Stopping);
            let _ = stop_tx.send(());
        }
    }

    /// Rewinds the delay to `reconnect_ivl`.
    pub(crate) fn reset(&mut self) {
        self.next = self.min;
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.phase.get() == Phase::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::deliver;
    use tokio::sync::mpsc;

    fn backoff(
        ivl: u64,
        max: u64,
    ) -> (Backoff, mpsc::UnboundedReceiver<BackoffEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backoff = Backoff::new(
            deliver(tx, |ev| ev),
            Duration::from_millis(ivl),
            Duration::from_millis(max),
        );
        (backoff, rx)
    }

    async fn next_timeout(rx: &mut mpsc::UnboundedReceiver<BackoffEvent>) -> Duration {
        let before = time::Instant::now();
        assert!(matches!(rx.recv().await, Some(BackoffEvent::Timeout)));
        before.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn delay_doubles_up_to_the_cap() {
        let (mut backoff, mut rx) = backoff(10, 40);

        for expected in [10u64, 20, 40, 40] {
            backoff.start();
            let elapsed = next_timeout(&mut rx).await;
            assert_eq!(elapsed, Duration::from_millis(expected));
            backoff.stop();
            assert!(matches!(rx.recv().await, Some(BackoffEvent::Stopped)));
            assert!(backoff.is_idle());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_max_means_flat_delay() {
        let (mut backoff, mut rx) = backoff(10, 0);

        for _ in 0..3 {
            backoff.start();
            assert_eq!(next_timeout(&mut rx).await, Duration::from_millis(10));
            backoff.stop();
            assert!(matches!(rx.recv().await, Some(BackoffEvent::Stopped)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reset_rewinds_the_delay() {
        let (mut backoff, mut rx) = backoff(10, 40);

        backoff.start();
        next_timeout(&mut rx).await;
        backoff.stop();
        rx.recv().await;

        backoff.reset();
        backoff.start();
        assert_eq!(next_timeout(&mut rx).await, Duration::from_millis(10));
        backoff.stop();
        rx.recv().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_timeout_suppresses_it() {
        let (mut backoff, mut rx) = backoff(1_000, 0);

        backoff.start();
        backoff.stop();
        assert!(matches!(rx.recv().await, Some(BackoffEvent::Stopped)));
        // Nothing further: the queue is closed once the backoff is dropped.
        drop(backoff);
        assert!(rx.recv().await.is_none());
    }
}
