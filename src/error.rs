use thiserror::Error;

/// Endpoint creation errors. Everything that can fail after `create`
/// succeeds is recovered internally and surfaced through statistics and
/// the last-error slot, never through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// The address fails the endpoint grammar: missing port separator,
    /// port outside [1, 65535], or a host that is neither a literal nor a
    /// well-formed hostname.
    #[error("invalid endpoint address `{0}`")]
    Invalid(String),
    /// A local interface was specified and does not resolve.
    #[error("no such device `{0}`")]
    NoDevice(String),
}
