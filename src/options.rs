//! Endpoint tuning options.
use std::time::Duration;

/// Options applied to an endpoint at creation time.
///
/// Reads during event handling are instantaneous; the options are fixed for
/// the lifetime of the endpoint.
#[derive(Debug, Clone)]
pub struct Options {
    /// Forbid IPv6 during resolution and socket creation.
    pub ipv4_only: bool,
    /// Initial interval between reconnection attempts.
    pub reconnect_ivl: Duration,
    /// Upper bound for the reconnection interval. `Duration::ZERO` means
    /// "equal to `reconnect_ivl`", i.e. no exponential growth.
    pub reconnect_ivl_max: Duration,
    /// `SO_SNDBUF` for outbound sockets. `None` leaves the OS default.
    pub sndbuf: Option<u32>,
    /// `SO_RCVBUF` for outbound sockets. `None` leaves the OS default.
    pub rcvbuf: Option<u32>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ipv4_only: true,
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::ZERO,
            sndbuf: None,
            rcvbuf: None,
        }
    }
}
