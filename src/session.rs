//! Per-connection session sub-machine.
//!
//! A session is commanded either to `accept` on a listening socket (bound
//! endpoints) or to `serve` an already-established stream (connected
//! endpoints). Once a connection is up, the session watches it and reports
//! `Error` when the peer closes or resets; it then holds, still owned by
//! the endpoint, until the explicit stop yields its terminal `Stopped`.
//!
//! The transport core carries no message data, so the connection loop
//! drains and discards what the peer sends; it is the attachment point for
//! a protocol session.

use crate::machine::{Deliver, Phase, PhaseCell};
use bytes::BytesMut;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tracing::debug;

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// An inbound connection landed on the listener; the session now
    /// carries it.
    Accepted(SocketAddr),
    /// The connection failed, or an accept failed. After an accept failure
    /// the session is idle again (no connection I/O had begun); after a
    /// connection failure the session holds until stopped.
    Error,
    Stopped,
}

pub(crate) struct Session {
    deliver: Deliver<SessionEvent>,
    phase: Arc<PhaseCell>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Session {
    pub(crate) fn new(deliver: Deliver<SessionEvent>) -> Self {
        Self {
            deliver,
            phase: Arc::new(PhaseCell::default()),
            stop_tx: None,
        }
    }

    /// Begins accepting one inbound connection on the shared listener.
    pub(crate) fn accept(&mut self, listener: Arc<TcpListener>) {
        debug_assert!(self.is_idle());
        let mut stop_rx = self.arm();
        let deliver = self.deliver.clone();
        let phase = self.phase.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {
                    phase.set(Phase::Idle);
                    deliver(SessionEvent::Stopped);
                }
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        deliver(SessionEvent::Accepted(peer));
                        watch_connection(stream, stop_rx, deliver, phase).await;
                    }
                    Err(err) => {
                        debug!(%err, "accept failed");
                        phase.set(Phase::Idle);
                        deliver(SessionEvent::Error);
                    }
                },
            }
        });
    }

    /// Carries an established outbound stream.
    pub(crate) fn serve(&mut self, stream: TcpStream) {
        debug_assert!(self.is_idle());
        let stop_rx = self.arm();
        let deliver = self.deliver.clone();
        let phase = self.phase.clone();
        tokio::spawn(watch_connection(stream, stop_rx, deliver, phase));
    }

    /// Requests the terminal `Stopped`. No-op while idle or already
    /// stopping.
    pub(crate) fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            self.phase.set(Phase::Stopping);
            let _ = stop_tx.send(());
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.phase.get() == Phase::Idle
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.phase.get() == Phase::Stopping
    }

    fn arm(&mut self) -> oneshot::Receiver<()> {
        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);
        self.phase.set(Phase::Running);
        stop_rx
    }
}

/// Watches the connection until the peer goes away or a stop arrives.
/// Emits at most one `Error` and exactly one `Stopped` per command.
async fn watch_connection(
    mut stream: TcpStream,
    mut stop_rx: oneshot::Receiver<()>,
    deliver: Deliver<SessionEvent>,
    phase: Arc<PhaseCell>,
) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                phase.set(Phase::Idle);
                deliver(SessionEvent::Stopped);
                return;
            }
            res = stream.read_buf(&mut buffer) => match res {
                Ok(0) => {
                    debug!("peer closed the connection");
                    break;
                }
                Ok(_) => buffer.clear(),
                Err(err) => {
                    debug!(%err, "connection failed");
                    break;
                }
            },
        }
    }
    drop(stream);
    deliver(SessionEvent::Error);
    // Owned-but-quiescing: the endpoint still holds this session and must
    // observe Error before commanding the stop that releases it.
    let _ = stop_rx.await;
    phase.set(Phase::Idle);
    deliver(SessionEvent::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::deliver;
    use tokio::{io::AsyncWriteExt, sync::mpsc};

    fn session() -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(deliver(tx, |ev| ev)), rx)
    }

    #[tokio::test]
    async fn accepts_then_reports_peer_close() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();

        let (mut session, mut rx) = session();
        session.accept(Arc::clone(&listener));

        let peer = TcpStream::connect(addr).await.unwrap();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Accepted(_))));
        assert!(!session.is_idle());

        drop(peer);
        assert!(matches!(rx.recv().await, Some(SessionEvent::Error)));

        session.stop();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Stopped)));
        assert!(session.is_idle());
    }

    #[tokio::test]
    async fn served_stream_survives_traffic_and_reports_reset() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (mut session, mut rx) = session();
        let outbound = TcpStream::connect(addr).await.unwrap();
        let (mut inbound, _) = listener.accept().await.unwrap();
        session.serve(outbound);

        // Payload is drained, not an error.
        inbound.write_all(b"ping").await.unwrap();
        inbound.flush().await.unwrap();
        drop(inbound);

        assert!(matches!(rx.recv().await, Some(SessionEvent::Error)));
        session.stop();
        assert!(matches!(rx.recv().await, Some(SessionEvent::Stopped)));
    }

    #[tokio::test]
    async fn stop_while_accepting_yields_only_stopped() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());

        let (mut session, mut rx) = session();
        session.accept(listener);
        session.stop();

        assert!(matches!(rx.recv().await, Some(SessionEvent::Stopped)));
        assert!(session.is_idle());
        drop(session);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn restarts_after_a_full_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (mut session, mut rx) = session();

        for _ in 0..2 {
            let outbound = TcpStream::connect(addr).await.unwrap();
            let (inbound, _) = listener.accept().await.unwrap();
            session.serve(outbound);
            drop(inbound);
            assert!(matches!(rx.recv().await, Some(SessionEvent::Error)));
            session.stop();
            assert!(matches!(rx.recv().await, Some(SessionEvent::Stopped)));
            assert!(session.is_idle());
        }
    }
}
