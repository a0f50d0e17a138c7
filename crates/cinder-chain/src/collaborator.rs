//! Outbound interface of the chain processor.
//!
//! The processor never performs network I/O. It asks its collaborator to
//! fetch data and reports misbehaving peers and chain movements, and it
//! routes block verification through the collaborator so the host decides
//! how many threads to spend on it.

use tracing::warn;

use cinder_core::rules::Rules;
use cinder_core::types::{BlockBody, HeightRange, PeerId, StateId};

use crate::verifier::Verifier;

#[cfg_attr(test, mockall::automock)]
pub trait Collaborator {
    /// Ask for the header (or the body, if `want_body`) of `id`, preferably
    /// from `peer`.
    fn request_data(&self, id: StateId, want_body: bool, peer: Option<PeerId>);

    /// `peer` supplied provably invalid data.
    fn on_peer_misbehaved(&self, peer: PeerId);

    /// The cursor moved to a new state.
    fn on_new_state(&self) {}

    /// The cursor moved back below its previous height.
    fn on_rolled_back(&self) {}

    /// Context-free verification of a body covering `range`.
    fn verify_block(&self, body: &BlockBody, range: HeightRange, subsidy_open: bool, rules: &Rules) -> bool {
        match Verifier::default().verify(body, range, subsidy_open, rules) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, min = range.min, max = range.max, "block verification failed");
                false
            }
        }
    }
}

/// Collaborator for offline tools: nothing to fetch, nobody to punish.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline {
    pub verifier: Verifier,
}

impl Collaborator for Offline {
    fn request_data(&self, _id: StateId, _want_body: bool, _peer: Option<PeerId>) {}

    fn on_peer_misbehaved(&self, _peer: PeerId) {}

    fn verify_block(&self, body: &BlockBody, range: HeightRange, subsidy_open: bool, rules: &Rules) -> bool {
        match self.verifier.verify(body, range, subsidy_open, rules) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, min = range.min, max = range.max, "block verification failed");
                false
            }
        }
    }
}
