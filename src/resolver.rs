//! Asynchronous host resolution sub-machine.
//!
//! Resolution always runs through this sub-machine so the connected
//! endpoint sees one uniform `Done` → `Stopped` path: literal hosts
//! short-circuit the lookup, hostnames go through the runtime's resolver.
//! A stop arriving mid-lookup suppresses `Done`; the terminal `Stopped` is
//! emitted exactly once per resolve.

use crate::{
    addr,
    machine::{Deliver, Phase, PhaseCell},
};
use std::{io, net::IpAddr, sync::Arc};
use tokio::{net, sync::oneshot};
use tracing::debug;

#[derive(Debug)]
pub(crate) enum ResolveEvent {
    Done(io::Result<IpAddr>),
    Stopped,
}

pub(crate) struct Resolver {
    deliver: Deliver<ResolveEvent>,
    phase: Arc<PhaseCell>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl Resolver {
    pub(crate) fn new(deliver: Deliver<ResolveEvent>) -> Self {
        Self {
            deliver,
            phase: Arc::new(PhaseCell::default()),
            stop_tx: None,
        }
    }

    pub(crate) fn resolve(&mut self, host: String, port: u16, ipv4_only: bool) {
        debug_assert!(self.is_idle());
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        self.stop_tx = Some(stop_tx);
        self.phase.set(Phase::Running);

        let deliver = self.deliver.clone();
        let phase = self.phase.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                res = lookup(host, port, ipv4_only) => {
                    deliver(ResolveEvent::Done(res));
                    let _ = stop_rx.await;
                }
            }
            phase.set(Phase::Idle);
            deliver(ResolveEvent::Stopped);
        });
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

/// Picks a single address for the host.
///
/// Hostname answers are filtered by family when `ipv4_only` is set.
/// Literals are taken as-is, wrong family included; a mismatch surfaces
/// later at bind or connect.
async fn lookup(host: String, port: u16, ipv4_only: bool) -> io::Result<IpAddr> {
    if let Some(ip) = addr::literal_host(&host) {
        return Ok(ip);
    }
    let mut answers = net::lookup_host((host.as_str(), port)).await?;
    let picked = if ipv4_only {
        answers.find(|a| a.is_ipv4())
    } else {
        answers.next()
    };
    match picked {
        Some(answer) => Ok(answer.ip()),
        None => {
            debug!(%host, "no address of a permitted family");
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no suitable address for `{host}`"),
            ))
        }
    }
}
