//! Error kind taxonomy.
//!
//! Fallible operations return [eyre::Result]; this enum only exists so a caller can branch on
//! *kind* (protocol vs. session vs. transport vs. resource-exhaustion) without pulling in a full
//! typed-error derive stack for a link layer this small.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkErrorKind {
    /// Malformed frame, bad command byte, sequence out of window, offset overflow.
    Protocol,
    /// Received Abort, or an internal inconsistency that forces one.
    Session,
    /// Socket I/O failure.
    Transport,
    /// The send queue is full (informational: the queue evicts rather than rejects, see
    /// [crate::queue::SendQueue]).
    ResourceExhausted,
}

impl fmt::Display for LinkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol error",
            Self::Session => "session error",
            Self::Transport => "transport error",
            Self::ResourceExhausted => "resource exhausted",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for LinkErrorKind {}

/// Build an [eyre::Report] tagged with a [LinkErrorKind] and a message.
pub fn link_error(kind: LinkErrorKind, msg: impl fmt::Display) -> eyre::Report {
    eyre::eyre!("{kind}: {msg}")
}
