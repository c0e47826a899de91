//! Underlying socket sub-machines.
//!
//! `ListenerSock` carries the listening side: socket creation, bind and
//! listen are synchronous, and the failure classes are kept apart because
//! the bound endpoint recovers differently from each. `ConnectSock`
//! carries the outbound side: socket creation, buffer sizing and the local
//! bind are synchronous, the connect itself runs in a task and reports
//! `Connected` or `Error` followed by the terminal `Stopped` once the
//! owner commands a stop.

use crate::machine::{Deliver, Phase, PhaseCell};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::oneshot,
};
use tracing::debug;

/// Listen backlog for bound endpoints.
pub(crate) const LISTEN_BACKLOG: u32 = 100;

#[derive(Debug)]
pub(crate) enum SockEvent {
    /// Outbound connect completed; carries the established stream.
    Connected(TcpStream),
    /// Outbound connect failed.
    Error(io::Error),
    /// Advisory: the socket had begun I/O when it was torn down. Always
    /// precedes `Stopped` and never changes endpoint state.
    Shutdown,
    Stopped,
}

/// Failure classes of `ListenerSock::listen`.
#[derive(Debug)]
pub(crate) enum ListenError {
    /// The socket could not be created; there is nothing to tear down.
    Create(io::Error),
    /// Bind or listen failed on a live socket; the owner must stop the
    /// sub-machine and await its `Stopped`.
    Bind(io::Error),
}

pub(crate) struct ListenerSock {
    deliver: Deliver<SockEvent>,
    listener: Option<Arc<TcpListener>>,
    phase: Phase,
}

impl ListenerSock {
    pub(crate) fn new(deliver: Deliver<SockEvent>) -> Self {
        Self {
            deliver,
            listener: None,
            phase: Phase::Idle,
        }
    }

    /// Creates a socket of `addr`'s family, binds and listens.
    ///
    /// `SO_REUSEADDR` is set so a restart does not trip over the previous
    /// listener's lingering state.
    pub(crate) fn listen(&mut self, addr: SocketAddr, backlog: u32) -> Result<(), ListenError> {
        debug_assert!(self.is_idle());
        let socket = match if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        } {
            Ok(socket) => socket,
            Err(err) => return Err(ListenError::Create(err)),
        };
        socket.set_reuseaddr(true).map_err(ListenError::Create)?;
        socket.bind(addr).map_err(ListenError::Bind)?;
        let listener = socket.listen(backlog).map_err(ListenError::Bind)?;
        self.listener = Some(Arc::new(listener));
        self.phase = Phase::Running;
        Ok(())
    }

    /// Shared handle for the session commanded to accept on this listener.
    pub(crate) fn shared(&self) -> Arc<TcpListener> {
        Arc::clone(self.listener.as_ref().expect("listener not listening"))
    }

    /// Tears the listener down. The socket closes synchronously; the
    /// advisory `Shutdown` (when the listener was live) and the terminal
    /// `Stopped` are queued so the owner sequences the teardown like any
    /// other sub-machine's.
    pub(crate) fn stop(&mut self) {
        let was_listening = self.listener.take().is_some();
        if was_listening {
            (self.deliver)(SockEvent::Shutdown);
        }
        self.phase = Phase::Idle;
        (self.deliver)(SockEvent::Stopped);
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }
}

pub(crate) struct ConnectSock {
    deliver: Deliver<SockEvent>,
    phase: Arc<PhaseCell>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl ConnectSock {
    pub(crate) fn new(deliver: Deliver<SockEvent>) -> Self {
        Self {
            deliver,
            phase: Arc::new(PhaseCell::default()),
            stop_tx: None,
        }
    }

    /// Creates a socket of `remote`'s family, applies the buffer options,
    /// binds `local` and commands the asynchronous connect.
    ///
    /// A synchronous failure leaves the sub-machine idle: no task was
    /// spawned, so there is nothing to stop and the caller goes straight
    /// to backoff.
    pub(crate) fn connect(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        sndbuf: Option<u32>,
        rcvbuf: Option<u32>,
    ) -> io::Result<()> {
        debug_assert!(self.is_idle());
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(size) = sndbuf {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = rcvbuf {
            socket.set_recv_buffer_size(size)?;
        }
        socket.bind(local)?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        self.stop_tx = Some(stop_tx);
        self.phase.set(Phase::Running);

        let deliver = self.deliver.clone();
        let phase = self.phase.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                res = socket.connect(remote) => {
                    match res {
                        Ok(stream) => deliver(SockEvent::Connected(stream)),
                        Err(err) => {
                            debug!(%err, %remote, "connect failed");
                            deliver(SockEvent::Error(err));
                        }
                    }
                    let _ = stop_rx.await;
                }
            }
            deliver(SockEvent::Shutdown);
            phase.set(Phase::Idle);
            deliver(SockEvent::Stopped);
        });
        Ok(())
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::deliver;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    fn wired() -> (
        mpsc::UnboundedSender<SockEvent>,
        mpsc::UnboundedReceiver<SockEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn connects_to_a_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();

        let (tx, mut rx) = wired();
        let mut sock = ConnectSock::new(deliver(tx, |ev| ev));
        assert_ok!(sock.connect("127.0.0.1:0".parse().unwrap(), remote, None, None));

        let (_peer, _) = listener.accept().await.unwrap();
        assert!(matches!(rx.recv().await, Some(SockEvent::Connected(_))));

        sock.stop();
        assert!(matches!(rx.recv().await, Some(SockEvent::Shutdown)));
        assert!(matches!(rx.recv().await, Some(SockEvent::Stopped)));
        assert!(sock.is_idle());
    }

    #[tokio::test]
    async fn reports_connect_refusal() {
        // Bind-then-drop to get a port with nothing listening on it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = wired();
        let mut sock = ConnectSock::new(deliver(tx, |ev| ev));
        assert_ok!(sock.connect("127.0.0.1:0".parse().unwrap(), remote, None, None));

        assert!(matches!(rx.recv().await, Some(SockEvent::Error(_))));
        sock.stop();
        assert!(matches!(rx.recv().await, Some(SockEvent::Shutdown)));
        assert!(matches!(rx.recv().await, Some(SockEvent::Stopped)));
    }

    #[tokio::test]
    async fn listener_distinguishes_bind_failures() {
        let (tx, mut rx) = wired();
        let mut first = ListenerSock::new(deliver(tx.clone(), |ev| ev));
        assert_ok!(first.listen("127.0.0.1:0".parse().unwrap(), LISTEN_BACKLOG));
        let taken = first.shared().local_addr().unwrap();

        let mut second = ListenerSock::new(deliver(tx, |ev| ev));
        match second.listen(taken, LISTEN_BACKLOG) {
            Err(ListenError::Bind(_)) => {}
            other => panic!("expected a bind failure, got {other:?}"),
        }

        first.stop();
        assert!(matches!(rx.recv().await, Some(SockEvent::Shutdown)));
        assert!(matches!(rx.recv().await, Some(SockEvent::Stopped)));
        assert!(first.is_idle());
    }
}
