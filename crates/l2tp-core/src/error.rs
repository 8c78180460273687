use std::io;

use thiserror::Error;

/// Convenience alias used throughout the l2tp crates.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the reliable control message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket I/O failed.
    #[error("socket i/o: {0}")]
    Io(#[from] io::Error),
    /// The retransmit budget was exhausted without an acknowledgement.
    #[error("peer not responding")]
    PeerNotResponding,
    /// The transport was closed while an operation was in progress.
    #[error("transport closed")]
    Closed,
}

/// Errors arising from control message and AVP processing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message or AVP could not be parsed.
    #[error("malformed {0}")]
    Malformed(&'static str),
    /// The buffer ended before the structure it declared.
    #[error("buffer too short for {0}")]
    ShortBuffer(&'static str),
    /// A declared length exceeds the containing datagram.
    #[error("declared length {declared} exceeds remaining {remaining} bytes")]
    LengthExceedsBuffer {
        /// Length field value.
        declared: usize,
        /// Bytes actually available.
        remaining: usize,
    },
    /// An AVP with the mandatory bit set was not recognised.
    #[error("unrecognised mandatory AVP {vendor_id}:{attribute}")]
    UnknownMandatoryAvp {
        /// AVP vendor ID.
        vendor_id: u16,
        /// AVP attribute type.
        attribute: u16,
    },
    /// A hidden AVP was received but no shared secret is configured.
    #[error("hidden AVP received with no shared secret configured")]
    HiddenAvpNoSecret,
    /// Hidden AVP unhiding produced an inconsistent payload, which usually
    /// means the shared secrets do not match.
    #[error("hidden AVP decode failed: shared secret mismatch")]
    HiddenAvpMismatch,
    /// A message arrived that the FSM cannot accept in its current state.
    #[error("unexpected {message} in state {state}")]
    UnexpectedMessage {
        /// The offending message type.
        message: &'static str,
        /// The FSM state it arrived in.
        state: &'static str,
    },
    /// The peer assigned an identifier we cannot accept.
    #[error("invalid peer-assigned ID {0}")]
    InvalidAssignedId(u32),
}

/// The error type for the l2tp crates.
///
/// The variants follow the recovery strategy: configuration and validation
/// failures are reported to the caller at setup time, transport and protocol
/// failures drive the owning FSM to its terminal state, and data plane
/// failures roll back partially created state.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad configuration input: malformed TOML, unknown keys, out-of-range
    /// identifiers, incompatible version/encapsulation combinations.
    #[error("config: {0}")]
    Config(String),
    /// Invalid tunnel or session parameters: name or ID collisions, missing
    /// required fields, exhausted ID space.
    #[error("validation: {0}")]
    Validation(String),
    /// The reliable transport failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// Control protocol violation.
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    /// The kernel data plane rejected an operation.
    #[error("data plane: {0}")]
    DataPlane(String),
    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}
