//! Endpoint address grammar.
//!
//! Bound endpoints take `IFACE:PORT`, connected endpoints take
//! `[LOCAL_IFACE;]HOST:PORT`. The splitter uses the *rightmost* `:` for
//! the port and the *first* `;` for the local interface. An unbracketed
//! IPv6 literal such as `fe80::1:5555` therefore parses as host `fe80::1`
//! with port `5555`; callers that mean something else must bracket the
//! host (`[fe80::1:5555]:port`).

use crate::{Error, Result};
use atoi::atoi;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Splits an address at the rightmost `:` and validates the port.
///
/// The remainder before the separator must be non-empty; the port must be
/// in `[1, 65535]`.
pub(crate) fn split_port(address: &str) -> Result<(&str, u16)> {
    let sep = address
        .rfind(':')
        .ok_or_else(|| Error::Invalid(address.to_string()))?;
    let host = &address[..sep];
    let port = &address[sep + 1..];
    if host.is_empty() {
        return Err(Error::Invalid(address.to_string()));
    }
    match atoi::<u16>(port.as_bytes()) {
        Some(port) if port > 0 => Ok((host, port)),
        _ => Err(Error::Invalid(address.to_string())),
    }
}

/// Splits off the optional local interface at the first `;`.
pub(crate) fn split_local(address: &str) -> (Option<&str>, &str) {
    match address.find(';') {
        Some(sep) => (Some(&address[..sep]), &address[sep + 1..]),
        None => (None, address),
    }
}

/// Parses a literal IPv4/IPv6 host, accepting the bracketed IPv6 form.
pub(crate) fn literal_host(host: &str) -> Option<IpAddr> {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse().ok()
}

/// Resolves a local interface specification to an address to bind.
///
/// `*` is the wildcard of the family permitted by `ipv4_only`; otherwise
/// the interface must be a literal IP of a permitted family. Named OS
/// interfaces do not resolve here and report `NoDevice`.
pub(crate) fn resolve_interface(iface: &str, ipv4_only: bool) -> Result<IpAddr> {
    if iface.is_empty() {
        return Err(Error::Invalid(iface.to_string()));
    }
    if iface == "*" {
        return Ok(if ipv4_only {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        });
    }
    match literal_host(iface) {
        Some(IpAddr::V6(_)) if ipv4_only => Err(Error::NoDevice(iface.to_string())),
        Some(ip) => Ok(ip),
        None => Err(Error::NoDevice(iface.to_string())),
    }
}

/// Syntactic hostname check: dot-separated labels of at most 63
/// alphanumeric-or-hyphen characters, no leading or trailing hyphen, at
/// most 253 characters overall. Resolvability is not checked here.
pub(crate) fn check_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_port_at_rightmost_colon() {
        assert_eq!(split_port("*:5555").unwrap(), ("*", 5555));
        assert_eq!(split_port("127.0.0.1:80").unwrap(), ("127.0.0.1", 80));
        assert_eq!(split_port("::1:5555").unwrap(), ("::1", 5555));
        assert_eq!(split_port("[fe80::1]:5555").unwrap(), ("[fe80::1]", 5555));
    }

    #[test]
    fn rejects_bad_ports() {
        assert!(matches!(split_port("host"), Err(Error::Invalid(_))));
        assert!(matches!(split_port("host:"), Err(Error::Invalid(_))));
        assert!(matches!(split_port("host:0"), Err(Error::Invalid(_))));
        assert!(matches!(split_port("host:65536"), Err(Error::Invalid(_))));
        assert!(matches!(split_port("host:12x"), Err(Error::Invalid(_))));
        assert!(matches!(split_port(":5555"), Err(Error::Invalid(_))));
    }

    #[test]
    fn splits_local_interface_at_first_semicolon() {
        assert_eq!(split_local("host:5555"), (None, "host:5555"));
        assert_eq!(
            split_local("127.0.0.1;host:5555"),
            (Some("127.0.0.1"), "host:5555")
        );
        // First `;` wins; the remainder keeps any later ones.
        assert_eq!(split_local("a;b;c"), (Some("a"), "b;c"));
    }

    #[test]
    fn parses_literals_with_and_without_brackets() {
        assert_eq!(
            literal_host("10.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(literal_host("::1"), Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(
            literal_host("[::1]"),
            Some(IpAddr::V6(Ipv6Addr::LOCALHOST))
        );
        assert_eq!(literal_host("example.com"), None);
    }

    #[test]
    fn resolves_wildcard_by_family() {
        assert_eq!(
            resolve_interface("*", true).unwrap(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert_eq!(
            resolve_interface("*", false).unwrap(),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        );
    }

    #[test]
    fn interface_must_be_wildcard_or_literal() {
        assert!(resolve_interface("127.0.0.1", true).is_ok());
        assert!(matches!(
            resolve_interface("::1", true),
            Err(Error::NoDevice(_))
        ));
        assert!(resolve_interface("::1", false).is_ok());
        assert!(matches!(
            resolve_interface("eth0", true),
            Err(Error::NoDevice(_))
        ));
        assert!(matches!(
            resolve_interface("", true),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn hostname_syntax() {
        assert!(check_hostname("localhost"));
        assert!(check_hostname("invalid.example.invalid"));
        assert!(check_hostname("a-b.c-d.e"));
        assert!(!check_hostname(""));
        assert!(!check_hostname("-leading.example"));
        assert!(!check_hostname("trailing-.example"));
        assert!(!check_hostname("under_score.example"));
        assert!(!check_hostname("dot..dot"));
        assert!(!check_hostname(&"x".repeat(254)));
    }
}
