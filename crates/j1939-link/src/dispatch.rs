//! Demultiplexing a received frame to the handler its PDU Format selects.
//!
//! The source implementation's `pf_handlers` dict (a function-pointer table keyed by PF) is
//! replaced here with a closed enumeration and an exhaustive match, so adding or removing a PF
//! is a compile-time-checked change rather than a runtime dict lookup that silently falls
//! through to a default.

use crate::identifier::{self, IdFields};

/// The PF values this link layer recognizes and handles itself; anything else is delivered to
/// the application unopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pdu {
    EtpDataTransfer,
    EtpConnectionManagement,
    Ack,
    RequestForPgn,
    TpDataTransfer,
    TpConnectionManagement,
    AddressClaim,
    /// Any other PF: the payload is delivered to the application as-is.
    Application,
}

impl Pdu {
    #[must_use]
    pub fn from_pf(pf: u8) -> Self {
        match pf {
            199 => Self::EtpDataTransfer,
            200 => Self::EtpConnectionManagement,
            232 => Self::Ack,
            234 => Self::RequestForPgn,
            235 => Self::TpDataTransfer,
            236 => Self::TpConnectionManagement,
            238 => Self::AddressClaim,
            _ => Self::Application,
        }
    }
}

/// Outcome of filtering a received frame by destination address and data page, ahead of PF
/// dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Not addressed to us, or on data page 1 (no page-1 handler is defined by this design; see
    /// `DESIGN.md`).
    Drop,
    /// Addressed to us (or broadcast); route by PDU Format.
    Accept(Pdu),
}

/// Apply the destination/data-page filter and PF lookup a received identifier requires before
/// its payload is handed to a handler.
#[must_use]
pub fn filter(fields: IdFields, our_sa: Option<u8>) -> FilterOutcome {
    if fields.data_page == 1 {
        tracing::trace!("dropping data-page-1 frame from {:#X}: no page-1 handler", fields.sa);
        return FilterOutcome::Drop;
    }
    if fields.is_pdu1() {
        let da = fields.destination();
        let addressed_to_us = da == crate::frame::BROADCAST_ADDRESS || Some(da) == our_sa;
        if !addressed_to_us {
            return FilterOutcome::Drop;
        }
    }
    FilterOutcome::Accept(Pdu::from_pf(fields.pf))
}

/// The PGN carried by a frame whose identifier has already passed [filter].
#[must_use]
pub fn pgn_of(fields: IdFields) -> u32 {
    identifier::pgn_of(fields)
}
