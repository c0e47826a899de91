//! Bound transport endpoint.
//!
//! Owns a listening socket, the single *pending* session awaiting an
//! inbound connection, the set of established child sessions and a retry
//! timer. The machine drives bind → listen → accept with backoff-based
//! relisting on listener failure; established children are unaffected by
//! that cycle and are only torn down by endpoint shutdown or their own
//! connection failing.
//!
//! All events reach the machine through one queue, tagged by source, and
//! are handled one at a time; an event that is not enumerated for the
//! current state is a programming error and panics with the offending
//! `(state, event)` pair.

use crate::{
    addr,
    backoff::{Backoff, BackoffEvent},
    base::EndpointBase,
    machine::deliver,
    options::Options,
    session::{Session, SessionEvent},
    sock::{ListenError, ListenerSock, SockEvent, LISTEN_BACKLOG},
    stats::{Counter, StatsSnapshot},
    Result,
};
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    /// Transient: the listener is up, the first accept is not yet armed.
    Listening,
    Active,
    /// Awaiting the broken listener's teardown before backing off.
    Closing,
    /// Backoff running after a listener failure.
    Waiting,
    /// Backoff being stopped after its timeout, before relisting.
    StoppingBackoff,
    /// Shutdown: awaiting the pending session's teardown.
    StoppingPending,
    /// Shutdown: awaiting the listener's teardown.
    StoppingListener,
    /// Shutdown: awaiting the remaining children's teardown.
    StoppingChildren,
}

/// Events delivered to the machine, tagged by source. Sessions carry the
/// id assigned when they were created; the machine tells the pending
/// session and children apart by it.
#[derive(Debug)]
enum Ev {
    /// User-initiated shutdown.
    Stop,
    Listener(SockEvent),
    Retry(BackoffEvent),
    Session(u64, SessionEvent),
}

enum Flow {
    Continue,
    Done,
}

/// Listening side of a transport: accepts inbound connections and keeps
/// one session per accepted peer.
///
/// `create` validates the address synchronously and starts the endpoint;
/// everything that fails afterwards is recovered internally with backoff
/// and surfaced through [`BoundEndpoint::stats`] and
/// [`BoundEndpoint::last_error`]. Must be called from within a Tokio
/// runtime.
#[derive(Debug)]
pub struct BoundEndpoint {
    base: Arc<EndpointBase>,
    events: mpsc::UnboundedSender<Ev>,
}

impl BoundEndpoint {
    /// Creates the endpoint and starts listening on `address`
    /// (`IFACE:PORT`, where `IFACE` is `*` or a literal IP and the port is
    /// taken after the rightmost `:`).
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`](crate::Error::Invalid) when the address does not
    /// fit the grammar, [`Error::NoDevice`](crate::Error::NoDevice) when
    /// the interface does not resolve.
    pub fn create(address: &str, options: Options) -> Result<BoundEndpoint> {
        let (iface, port) = addr::split_port(address)?;
        let ip = addr::resolve_interface(iface, options.ipv4_only)?;
        let local = SocketAddr::new(ip, port);

        let base = Arc::new(EndpointBase::new(address.to_string(), options));
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Machine::new(Arc::clone(&base), local, tx.clone(), rx);
        tokio::spawn(machine.run());
        Ok(BoundEndpoint { base, events: tx })
    }

    /// Initiates asynchronous shutdown. The endpoint keeps running until
    /// every session, the listener and the retry timer have quiesced;
    /// await [`BoundEndpoint::stopped`] for that point.
    pub fn stop(&self) {
        let _ = self.events.send(Ev::Stop);
    }

    /// Resolves once the endpoint has fully quiesced after [`stop`].
    ///
    /// [`stop`]: BoundEndpoint::stop
    pub async fn stopped(&self) {
        self.base.wait_stopped().await;
    }

    pub fn address(&self) -> &str {
        self.base.address()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.base.snapshot()
    }

    /// Most recent transient network error, if any.
    pub fn last_error(&self) -> Option<Arc<io::Error>> {
        self.base.last_error()
    }
}

struct Machine {
    state: State,
    base: Arc<EndpointBase>,
    local: SocketAddr,
    listener: ListenerSock,
    pending: Option<(u64, Session)>,
    children: HashMap<u64, Session>,
    retry: Backoff,
    events: mpsc::UnboundedReceiver<Ev>,
    tx: mpsc::UnboundedSender<Ev>,
    next_session: u64,
}

impl Machine {
    fn new(
        base: Arc<EndpointBase>,
        local: SocketAddr,
        tx: mpsc::UnboundedSender<Ev>,
        events: mpsc::UnboundedReceiver<Ev>,
    ) -> Machine {
        let options = base.options();
        let retry = Backoff::new(
            deliver(tx.clone(), Ev::Retry),
            options.reconnect_ivl,
            options.reconnect_ivl_max,
        );
        let listener = ListenerSock::new(deliver(tx.clone(), Ev::Listener));
        Machine {
            state: State::Idle,
            base,
            local,
            listener,
            pending: None,
            children: HashMap::new(),
            retry,
            events,
            tx,
            next_session: 0,
        }
    }

    async fn run(mut self) {
        self.start_listening();
        loop {
            match self.events.recv().await {
                Some(ev) => {
                    if let Flow::Done = self.handle(ev) {
                        break;
                    }
                }
                None => {
                    // Handle dropped without a stop; sub-machine tasks are
                    // cancelled through their dropped stop channels.
                    debug!(addr = %self.base.address(), "endpoint handle dropped, aborting");
                    break;
                }
            }
        }
        self.base.stopped();
    }

    fn handle(&mut self, ev: Ev) -> Flow {
        match ev {
            // Established children are managed the same way in every state
            // so they survive listener recovery untouched and shutdown can
            // overlap with their own failures.
            Ev::Session(id, ev) if !self.is_pending(id) => self.on_child(id, ev),
            Ev::Stop => self.on_stop(),
            ev => self.on_event(ev),
        }
    }

    fn is_pending(&self, id: u64) -> bool {
        matches!(self.pending, Some((pending_id, _)) if pending_id == id)
    }

    fn on_event(&mut self, ev: Ev) -> Flow {
        match self.state {
            State::Active => match ev {
                Ev::Session(_, SessionEvent::Accepted(peer)) => {
                    debug!(%peer, "accepted inbound connection");
                    self.base.bump(Counter::Established, 1);
                    let (id, session) =
                        self.pending.take().expect("no pending session in ACTIVE");
                    self.children.insert(id, session);
                    self.base.set_sessions(self.children.len());
                    self.start_accepting();
                    Flow::Continue
                }
                Ev::Session(_, SessionEvent::Error) => {
                    // The accept failed, which means the listening socket
                    // is broken. The pending session went idle without
                    // touching a connection; the listener is torn down and
                    // brought back after backoff.
                    warn!(addr = %self.local, "listener failed, restarting after backoff");
                    self.pending = None;
                    self.listener.stop();
                    self.state = State::Closing;
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::Closing => match ev {
                // Advisory, no state change.
                Ev::Listener(SockEvent::Shutdown) => Flow::Continue,
                Ev::Listener(SockEvent::Stopped) => {
                    self.retry.start();
                    self.state = State::Waiting;
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::Waiting => match ev {
                Ev::Retry(BackoffEvent::Timeout) => {
                    self.retry.stop();
                    self.state = State::StoppingBackoff;
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::StoppingBackoff => match ev {
                Ev::Retry(BackoffEvent::Stopped) => {
                    self.start_listening();
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::StoppingPending => match ev {
                Ev::Session(_, SessionEvent::Stopped) => {
                    self.pending = None;
                    self.stop_listener()
                }
                Ev::Session(_, SessionEvent::Error) => {
                    // Either the accept failed while the stop was in
                    // flight (the session is idle, nothing more will come)
                    // or an accepted connection died while winding down
                    // (its Stopped is still on the way).
                    let idle = match &self.pending {
                        Some((_, session)) => session.is_idle(),
                        None => true,
                    };
                    if idle {
                        self.pending = None;
                        self.stop_listener()
                    } else {
                        Flow::Continue
                    }
                }
                Ev::Session(_, SessionEvent::Accepted(peer)) => {
                    // In-flight accept racing the stop; the session is
                    // already winding down and the connection goes with it.
                    debug!(%peer, "connection accepted during shutdown, dropping");
                    Flow::Continue
                }
                Ev::Retry(BackoffEvent::Stopped) => Flow::Continue,
                ev => self.unexpected(ev),
            },
            State::StoppingListener => match ev {
                Ev::Listener(SockEvent::Shutdown) => Flow::Continue,
                Ev::Listener(SockEvent::Stopped) => self.stop_children(),
                Ev::Retry(_) => Flow::Continue,
                ev => self.unexpected(ev),
            },
            State::StoppingChildren => match ev {
                // Stale listener teardown events and the backoff's
                // terminal event land here when the shutdown started from
                // a recovery state; they only matter for the idle check.
                Ev::Listener(SockEvent::Shutdown | SockEvent::Stopped) => self.check_done(),
                Ev::Retry(_) => self.check_done(),
                ev => self.unexpected(ev),
            },
            State::Idle | State::Listening => self.unexpected(ev),
        }
    }

    /// Events from established children, valid in every running state.
    fn on_child(&mut self, id: u64, ev: SessionEvent) -> Flow {
        match ev {
            SessionEvent::Error => {
                let child = self.children.get_mut(&id).expect("unknown child session");
                if child.is_stopping() {
                    debug!(id, "child failed while already stopping");
                } else {
                    self.base.bump(Counter::Broken, 1);
                    child.stop();
                }
                Flow::Continue
            }
            SessionEvent::Stopped => {
                // Removed and destroyed in the same handler that observes
                // the terminal event.
                self.children.remove(&id).expect("unknown child session");
                self.base.set_sessions(self.children.len());
                if self.state == State::StoppingChildren {
                    self.check_done()
                } else {
                    Flow::Continue
                }
            }
            SessionEvent::Accepted(_) => self.unexpected(Ev::Session(id, ev)),
        }
    }

    fn on_stop(&mut self) -> Flow {
        match self.state {
            State::Active => {
                info!(addr = %self.base.address(), "stopping bound endpoint");
                self.retry.stop();
                let (_, pending) = self.pending.as_mut().expect("no pending session in ACTIVE");
                pending.stop();
                self.state = State::StoppingPending;
                Flow::Continue
            }
            State::Closing | State::Waiting | State::StoppingBackoff => {
                info!(addr = %self.base.address(), "stopping bound endpoint");
                self.retry.stop();
                self.stop_listener()
            }
            State::StoppingPending | State::StoppingListener | State::StoppingChildren => {
                debug!("stop already in progress");
                Flow::Continue
            }
            State::Idle | State::Listening => {
                unreachable!("stop event in state {:?}", self.state)
            }
        }
    }

    fn start_listening(&mut self) {
        match self.listener.listen(self.local, LISTEN_BACKLOG) {
            Ok(()) => {
                self.state = State::Listening;
                self.base.clear_error();
                self.retry.reset();
                info!(addr = %self.local, "listening");
                self.start_accepting();
            }
            Err(ListenError::Create(err)) => {
                warn!(%err, "could not create listening socket, backing off");
                self.base.set_error(err);
                self.retry.start();
                self.state = State::Waiting;
            }
            Err(ListenError::Bind(err)) => {
                warn!(%err, addr = %self.local, "could not bind, backing off");
                self.base.set_error(err);
                self.listener.stop();
                self.state = State::Closing;
            }
        }
    }

    fn start_accepting(&mut self) {
        let id = self.next_session;
        self.next_session += 1;
        let mut session = Session::new(deliver(self.tx.clone(), move |ev| Ev::Session(id, ev)));
        session.accept(self.listener.shared());
        self.pending = Some((id, session));
        self.state = State::Active;
    }

    fn stop_listener(&mut self) -> Flow {
        if self.listener.is_idle() {
            self.stop_children()
        } else {
            self.listener.stop();
            self.state = State::StoppingListener;
            Flow::Continue
        }
    }

    fn stop_children(&mut self) -> Flow {
        for child in self.children.values_mut() {
            child.stop();
        }
        self.state = State::StoppingChildren;
        self.check_done()
    }

    fn check_done(&mut self) -> Flow {
        if self.children.is_empty() && self.listener.is_idle() && self.retry.is_idle() {
            info!(addr = %self.base.address(), "bound endpoint stopped");
            self.state = State::Idle;
            Flow::Done
        } else {
            Flow::Continue
        }
    }

    fn unexpected(&self, ev: Ev) -> Flow {
        panic!(
            "bound endpoint: unexpected event {ev:?} in state {:?}",
            self.state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::time::Duration;
    use tokio::{net::TcpStream, time};

    fn options() -> Options {
        Options {
            reconnect_ivl: Duration::from_millis(10),
            reconnect_ivl_max: Duration::from_millis(40),
            ..Options::default()
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for(ep: &BoundEndpoint, cond: impl Fn(StatsSnapshot) -> bool) {
        time::timeout(Duration::from_secs(5), async {
            while !cond(ep.stats()) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("endpoint did not reach the expected state in time");
    }

    /// Connects to the endpoint, retrying while it is still on its way to
    /// ACTIVE.
    async fn connect_retry(port: u16) -> TcpStream {
        time::timeout(Duration::from_secs(5), async {
            loop {
                match TcpStream::connect(("127.0.0.1", port)).await {
                    Ok(stream) => return stream,
                    Err(_) => time::sleep(Duration::from_millis(5)).await,
                }
            }
        })
        .await
        .expect("endpoint never started listening")
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(matches!(
            BoundEndpoint::create("127.0.0.1", Options::default()),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            BoundEndpoint::create("*:0", Options::default()),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            BoundEndpoint::create("eth0:5555", Options::default()),
            Err(Error::NoDevice(_))
        ));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn accepts_a_connection_and_releases_it_on_peer_close() {
        let port = free_port();
        let ep = BoundEndpoint::create(&format!("127.0.0.1:{port}"), options()).unwrap();

        let stream = connect_retry(port).await;
        wait_for(&ep, |s| s.established == 1 && s.sessions == 1).await;

        drop(stream);
        wait_for(&ep, |s| s.broken == 1 && s.sessions == 0).await;

        ep.stop();
        ep.stopped().await;
        assert_eq!(ep.stats().sessions, 0);
    }

    #[tokio::test]
    async fn rebinds_once_a_conflicting_listener_releases_the_port() {
        let conflict = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = conflict.local_addr().unwrap().port();

        let ep = BoundEndpoint::create(&format!("127.0.0.1:{port}"), options()).unwrap();

        // The bind keeps failing while the port is taken.
        time::timeout(Duration::from_secs(5), async {
            while ep.last_error().is_none() {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bind conflict never surfaced");
        assert_eq!(ep.stats().established, 0);

        drop(conflict);
        let _stream = connect_retry(port).await;
        wait_for(&ep, |s| s.established == 1).await;
        assert!(ep.last_error().is_none());

        ep.stop();
        ep.stopped().await;
    }

    #[tokio::test]
    async fn shutdown_tears_down_all_children() {
        let port = free_port();
        let ep = BoundEndpoint::create(&format!("127.0.0.1:{port}"), options()).unwrap();

        let _first = connect_retry(port).await;
        let _second = connect_retry(port).await;
        wait_for(&ep, |s| s.sessions == 2).await;

        ep.stop();
        ep.stopped().await;

        let stats = ep.stats();
        assert_eq!(stats.established, 2);
        assert_eq!(stats.sessions, 0);
    }

    #[tokio::test]
    async fn immediate_stop_quiesces_cleanly() {
        let port = free_port();
        let ep = BoundEndpoint::create(&format!("127.0.0.1:{port}"), options()).unwrap();
        ep.stop();
        ep.stopped().await;
        assert_eq!(ep.stats().sessions, 0);
    }
}
