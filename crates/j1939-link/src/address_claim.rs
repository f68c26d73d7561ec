//! Address-claim arbitration (ISO 11783-5 / SAE J1939-81, PF 238).
//!
//! Owns the node's source address and NAME, and the `claiming` flag that marks the quiet
//! interval during which a contending claim could still arrive. The source implementation set
//! this flag on `start_claim()` but never cleared it, so the node stayed in "claiming" forever;
//! here it's cleared by [AddressClaim::tick] once the quiet interval has elapsed.

use std::time::{Duration, Instant};

use crate::frame::{CanFrame, BROADCAST_ADDRESS};
use crate::identifier::{pack_id, IdFields, PRIORITY_DEFAULT};
use crate::name::Name;

/// PGN of the address-claim message, and the one `RequestForPgn` (PGN 0x00EE00) re-triggers.
pub const ADDRESS_CLAIM_PGN: u32 = 0x00EE00;

/// "Cannot claim" address: announced when every candidate address has been tried and lost.
pub const NULL_ADDRESS: u8 = 0xFE;

/// Quiet interval a claim must survive unchallenged before the node is considered addressed.
/// SAE J1939-81 specifies 250ms.
pub const DEFAULT_QUIET_INTERVAL: Duration = Duration::from_millis(250);

/// Outcome of losing arbitration: either a new address to try, or exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// We won (or the contention didn't involve us); the address stands.
    Unaffected,
    /// We lost and are re-announcing a new candidate address.
    Reclaimed(CanFrame),
    /// We lost and have exhausted every address in the range; the node cannot claim.
    CannotClaim,
}

/// Tracks this node's address, NAME, and claim-in-progress state.
#[derive(Debug)]
pub struct AddressClaim {
    preferred_sa: u8,
    sa: Option<u8>,
    name: Name,
    claiming: bool,
    quiet_until: Option<Instant>,
    quiet_interval: Duration,
}

impl AddressClaim {
    #[must_use]
    pub fn new(preferred_sa: u8, name: Name) -> Self {
        Self {
            preferred_sa,
            sa: None,
            name,
            claiming: false,
            quiet_until: None,
            quiet_interval: DEFAULT_QUIET_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_quiet_interval(mut self, quiet_interval: Duration) -> Self {
        self.quiet_interval = quiet_interval;
        self
    }

    #[must_use]
    pub fn sa(&self) -> Option<u8> {
        self.sa
    }

    #[must_use]
    pub fn name(&self) -> Name {
        self.name
    }

    /// `true` while within the post-claim quiet interval, during which a losing contender could
    /// still force a re-claim.
    #[must_use]
    pub fn is_claiming(&self) -> bool {
        self.claiming
    }

    /// Build the address-claim frame for the node's current address (or [NULL_ADDRESS] if none).
    #[must_use]
    pub fn claim_frame(&self) -> CanFrame {
        let sa = self.sa.unwrap_or(NULL_ADDRESS);
        let id = pack_id(IdFields {
            priority: PRIORITY_DEFAULT,
            data_page: 0,
            pf: 238,
            ps: BROADCAST_ADDRESS,
            sa,
        });
        CanFrame::new(id, &self.name.to_bytes())
    }

    /// Begin (or restart) claiming the preferred address. Arms the quiet interval.
    pub fn start_claim(&mut self, now: Instant) -> CanFrame {
        self.sa = Some(self.preferred_sa);
        self.claiming = true;
        self.quiet_until = Some(now + self.quiet_interval);
        self.claim_frame()
    }

    /// Handle an address-claim frame received from another node.
    ///
    /// Returns [ClaimOutcome::Unaffected] if `their_sa` isn't the address we hold or are
    /// claiming. Otherwise arbitrates by NAME: the numerically lower NAME wins ([crate::name]
    /// orders NAMEs numerically, not by raw byte sequence).
    pub fn handle_contending_claim(
        &mut self,
        now: Instant,
        their_sa: u8,
        their_name: Name,
    ) -> ClaimOutcome {
        if self.sa != Some(their_sa) {
            return ClaimOutcome::Unaffected;
        }
        if their_name >= self.name {
            // We win (lower NAME) or it's a duplicate announcement of our own claim; reassert.
            self.claiming = true;
            self.quiet_until = Some(now + self.quiet_interval);
            return ClaimOutcome::Reclaimed(self.claim_frame());
        }
        match self.sa.and_then(|sa| sa.checked_add(1)) {
            Some(next_sa) if next_sa < NULL_ADDRESS => {
                self.sa = Some(next_sa);
                self.claiming = true;
                self.quiet_until = Some(now + self.quiet_interval);
                ClaimOutcome::Reclaimed(self.claim_frame())
            }
            _ => {
                tracing::warn!("address range exhausted; cannot claim an address");
                self.sa = None;
                self.claiming = false;
                self.quiet_until = None;
                ClaimOutcome::CannotClaim
            }
        }
    }

    /// Build the response to a Request-for-PGN targeting the address-claim PGN, if we hold an
    /// address. Any other requested PGN is the caller's concern, not this module's.
    #[must_use]
    pub fn handle_request(&self, requested_pgn: u32) -> Option<CanFrame> {
        if requested_pgn != ADDRESS_CLAIM_PGN {
            return None;
        }
        self.sa.is_some().then(|| self.claim_frame())
    }

    /// Clear the `claiming` flag once the quiet interval has elapsed unchallenged.
    pub fn tick(&mut self, now: Instant) {
        if let Some(quiet_until) = self.quiet_until {
            if now >= quiet_until {
                self.claiming = false;
                self.quiet_until = None;
            }
        }
    }
}
