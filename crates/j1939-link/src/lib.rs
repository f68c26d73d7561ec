//! SAE J1939 / ISO 11783-5 application link layer: address claim, the transport and extended
//! transport protocols, and frame dispatch, driven by an external reactor.
//!
//! [Link] is the entry point: it owns a [CanSocket], an [Application], and the protocol engines
//! in [address_claim], [tp], and [etp], and exposes `as_raw_fd`/`on_readable`/`on_writable`/`tick`
//! for the caller's event loop to drive.

pub mod address_claim;
pub mod dispatch;
pub mod error;
pub mod etp;
pub mod frame;
pub mod identifier;
pub mod link;
pub mod name;
pub mod queue;
pub mod socket;
pub mod tp;

pub use address_claim::{AddressClaim, ClaimOutcome};
pub use error::{link_error, LinkErrorKind};
pub use etp::EtpEngine;
pub use frame::CanFrame;
pub use identifier::IdFields;
pub use link::{Application, Link, LinkStatus};
pub use name::Name;
pub use queue::SendQueue;
pub use socket::CanSocket;
pub use tp::{ReceivedMessage, TpEngine};

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
