//! Connected transport endpoint.
//!
//! Owns a client socket, one session (for the whole endpoint lifetime),
//! a resolver and a retry timer, and drives the resolve → connect →
//! active → recover loop: every failure after creation lands in WAITING
//! and the cycle restarts from resolution once the backoff fires.
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
    resolver::{ResolveEvent, Resolver},
    session::{Session, SessionEvent},
    sock::{ConnectSock, SockEvent},
    stats::{Counter, StatsSnapshot},
    Error, Result,
};
use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Resolving,
    /// Resolution answered; awaiting the resolver's teardown.
    StoppingDns,
    Connecting,
    Active,
    /// Recovery: awaiting the failed session's teardown.
    StoppingSession,
    /// Recovery: awaiting the socket's teardown.
    StoppingSocket,
    /// Backoff running before the next attempt.
    Waiting,
    /// Backoff being stopped after its timeout, before re-resolving.
    StoppingBackoff,
    /// Shutdown: awaiting the live session's teardown.
    StoppingSessionFinal,
    /// Shutdown: awaiting backoff, socket and resolver concurrently.
    Stopping,
}

/// Events delivered to the machine, tagged by source.
#[derive(Debug)]
enum Ev {
    /// User-initiated shutdown.
    Stop,
    Sock(SockEvent),
    Session(SessionEvent),
    Dns(ResolveEvent),
    Retry(BackoffEvent),
}

enum Flow {
    Continue,
    Done,
}

/// Connecting side of a transport: maintains a single outbound session,
/// reconnecting with exponential backoff whenever resolution, the connect
/// or the established connection fails.
///
/// `create` validates the address synchronously and starts the endpoint;
/// everything that fails afterwards is recovered internally and surfaced
/// through [`ConnectedEndpoint::stats`] and
/// [`ConnectedEndpoint::last_error`]. Must be called from within a Tokio
/// runtime.
#[derive(Debug)]
pub struct ConnectedEndpoint {
    base: Arc<EndpointBase>,
    events: mpsc::UnboundedSender<Ev>,
}

impl ConnectedEndpoint {
    /// Creates the endpoint and starts connecting to `address`
    /// (`[LOCAL_IFACE;]HOST:PORT`: the optional local interface ends at
    /// the first `;`, the port starts after the rightmost `:`, the host is
    /// a literal IP or a hostname).
    ///
    /// # Errors
    ///
    /// [`Error::Invalid`](crate::Error::Invalid) when the address does not
    /// fit the grammar, [`Error::NoDevice`](crate::Error::NoDevice) when a
    /// local interface is specified and does not resolve.
    pub fn create(address: &str, options: Options) -> Result<ConnectedEndpoint> {
        let (local_iface, remainder) = addr::split_local(address);
        let (host, port) = addr::split_port(remainder)?;
        if addr::literal_host(host).is_none() && !addr::check_hostname(host) {
            return Err(Error::Invalid(address.to_string()));
        }
        let local = match local_iface {
            Some(iface) => Some(addr::resolve_interface(iface, options.ipv4_only)?),
            None => None,
        };

        let base = Arc::new(EndpointBase::new(address.to_string(), options));
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = Machine::new(Arc::clone(&base), host.to_string(), port, local, tx.clone(), rx);
        tokio::spawn(machine.run());
        Ok(ConnectedEndpoint { base, events: tx })
    }

    /// Initiates asynchronous shutdown. A live or in-progress connection
    /// is dropped and counted; await [`ConnectedEndpoint::stopped`] for
    /// full quiescence.
    pub fn stop(&self) {
        let _ = self.events.send(Ev::Stop);
    }

    /// Resolves once the endpoint has fully quiesced after [`stop`].
    ///
    /// [`stop`]: ConnectedEndpoint::stop
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
    host: String,
    port: u16,
    /// Local interface fixed at creation; `None` binds the wildcard of the
    /// remote's family.
    local: Option<IpAddr>,
    socket: ConnectSock,
    session: Session,
    dns: Resolver,
    dns_result: Option<io::Result<IpAddr>>,
    retry: Backoff,
    events: mpsc::UnboundedReceiver<Ev>,
}

impl Machine {
    fn new(
        base: Arc<EndpointBase>,
        host: String,
        port: u16,
        local: Option<IpAddr>,
        tx: mpsc::UnboundedSender<Ev>,
        events: mpsc::UnboundedReceiver<Ev>,
    ) -> Machine {
        let options = base.options();
        let retry = Backoff::new(
            deliver(tx.clone(), Ev::Retry),
            options.reconnect_ivl,
            options.reconnect_ivl_max,
        );
        Machine {
            state: State::Idle,
            base,
            host,
            port,
            local,
            socket: ConnectSock::new(deliver(tx.clone(), Ev::Sock)),
            session: Session::new(deliver(tx.clone(), Ev::Session)),
            dns: Resolver::new(deliver(tx, Ev::Dns)),
            dns_result: None,
            retry,
            events,
        }
    }

    async fn run(mut self) {
        self.start_resolving();
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
        if let Ev::Stop = ev {
            return self.on_stop();
        }
        match self.state {
            State::Resolving => match ev {
                Ev::Dns(ResolveEvent::Done(result)) => {
                    self.dns_result = Some(result);
                    self.dns.stop();
                    self.state = State::StoppingDns;
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::StoppingDns => match ev {
                Ev::Dns(ResolveEvent::Stopped) => {
                    match self.dns_result.take().expect("no resolution outcome") {
                        Ok(ip) => self.start_connecting(ip),
                        Err(err) => {
                            warn!(%err, host = %self.host, "resolution failed, backing off");
                            self.base.set_error(err);
                            self.retry.start();
                            self.state = State::Waiting;
                        }
                    }
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::Connecting => match ev {
                Ev::Sock(SockEvent::Connected(stream)) => {
                    self.base.bump(Counter::InProgress, -1);
                    self.base.bump(Counter::Established, 1);
                    self.base.clear_error();
                    self.base.set_sessions(1);
                    self.retry.reset();
                    if let Ok(peer) = stream.peer_addr() {
                        info!(%peer, "connected");
                    }
                    self.session.serve(stream);
                    self.state = State::Active;
                    Flow::Continue
                }
                Ev::Sock(SockEvent::Error(err)) => {
                    warn!(%err, host = %self.host, "connect failed");
                    self.base.set_error(err);
                    self.base.bump(Counter::InProgress, -1);
                    self.base.bump(Counter::ConnectErrors, 1);
                    self.socket.stop();
                    self.state = State::StoppingSocket;
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::Active => match ev {
                Ev::Session(SessionEvent::Error) => {
                    debug!("session failed, recovering");
                    self.base.bump(Counter::Broken, 1);
                    self.session.stop();
                    self.state = State::StoppingSession;
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::StoppingSession => match ev {
                Ev::Session(SessionEvent::Stopped) => {
                    self.base.set_sessions(0);
                    self.socket.stop();
                    self.state = State::StoppingSocket;
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::StoppingSocket => match ev {
                // Advisory, no state change.
                Ev::Sock(SockEvent::Shutdown) => Flow::Continue,
                Ev::Sock(SockEvent::Stopped) => {
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
                    self.start_resolving();
                    Flow::Continue
                }
                ev => self.unexpected(ev),
            },
            State::StoppingSessionFinal => match ev {
                Ev::Session(SessionEvent::Stopped) => {
                    self.base.set_sessions(0);
                    self.finish_stop()
                }
                // A connection failure racing the shutdown; the terminal
                // Stopped is still on the way.
                Ev::Session(SessionEvent::Error) => Flow::Continue,
                ev => self.unexpected(ev),
            },
            State::Stopping => match ev {
                // In-flight events from sub-machines that were already
                // winding down; they only matter for the idle check and
                // never move statistics.
                Ev::Sock(SockEvent::Shutdown) => Flow::Continue,
                Ev::Sock(SockEvent::Connected(stream)) => {
                    debug!("connection established during shutdown, dropping");
                    drop(stream);
                    Flow::Continue
                }
                Ev::Sock(SockEvent::Error(_)) => Flow::Continue,
                Ev::Sock(SockEvent::Stopped) => self.check_done(),
                Ev::Dns(ResolveEvent::Done(_)) => Flow::Continue,
                Ev::Dns(ResolveEvent::Stopped) => self.check_done(),
                Ev::Retry(BackoffEvent::Timeout) => Flow::Continue,
                Ev::Retry(BackoffEvent::Stopped) => self.check_done(),
                ev => self.unexpected(ev),
            },
            State::Idle => self.unexpected(ev),
        }
    }

    fn on_stop(&mut self) -> Flow {
        match self.state {
            State::StoppingSessionFinal | State::Stopping => {
                debug!("stop already in progress");
                Flow::Continue
            }
            State::Idle => unreachable!("stop event in state {:?}", self.state),
            state => {
                info!(addr = %self.base.address(), "stopping connected endpoint");
                if state == State::Connecting {
                    // The in-progress attempt is abandoned.
                    self.base.bump(Counter::InProgress, -1);
                    self.base.bump(Counter::Dropped, 1);
                } else if !self.session.is_idle() {
                    self.base.bump(Counter::Dropped, 1);
                }
                if self.session.is_idle() {
                    self.finish_stop()
                } else {
                    self.session.stop();
                    self.state = State::StoppingSessionFinal;
                    Flow::Continue
                }
            }
        }
    }

    fn start_resolving(&mut self) {
        let options = self.base.options();
        debug!(host = %self.host, "resolving");
        self.dns
            .resolve(self.host.clone(), self.port, options.ipv4_only);
        self.state = State::Resolving;
    }

    fn start_connecting(&mut self, ip: IpAddr) {
        let remote = SocketAddr::new(ip, self.port);
        let local = match self.local {
            Some(ip) => SocketAddr::new(ip, 0),
            None => SocketAddr::new(
                if remote.is_ipv4() {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                } else {
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                },
                0,
            ),
        };
        let options = self.base.options();
        match self
            .socket
            .connect(local, remote, options.sndbuf, options.rcvbuf)
        {
            Ok(()) => {
                debug!(%remote, "connecting");
                self.base.bump(Counter::InProgress, 1);
                self.state = State::Connecting;
            }
            Err(err) => {
                // Socket creation or the local bind failed before the
                // connect was commanded; nothing is running, so recovery
                // goes straight to backoff.
                warn!(%err, %remote, "connect setup failed, backing off");
                self.base.set_error(err);
                self.retry.start();
                self.state = State::Waiting;
            }
        }
    }

    /// Tears down whatever is still running, concurrently, and completes
    /// once everything reads idle.
    fn finish_stop(&mut self) -> Flow {
        self.retry.stop();
        self.socket.stop();
        self.dns.stop();
        self.state = State::Stopping;
        self.check_done()
    }

    fn check_done(&mut self) -> Flow {
        if self.socket.is_idle() && self.dns.is_idle() && self.retry.is_idle() {
            info!(addr = %self.base.address(), "connected endpoint stopped");
            self.state = State::Idle;
            Flow::Done
        } else {
            Flow::Continue
        }
    }

    fn unexpected(&self, ev: Ev) -> Flow {
        panic!(
            "connected endpoint: unexpected event {ev:?} in state {:?}",
            self.state
        );
    }
}
