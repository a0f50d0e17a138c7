//! Shared helpers for the chain integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use cinder_chain::collaborator::Collaborator;
use cinder_chain::config::Horizon;
use cinder_chain::error::DataStatus;
use cinder_chain::processor::ChainProcessor;
use cinder_chain::storage::ChainDb;
use cinder_chain::verifier::Verifier;
use cinder_core::block::build_transaction;
use cinder_core::crypto::{Kdf, KeyType};
use cinder_core::rules::Rules;
use cinder_core::txpool::TxPool;
use cinder_core::types::{
    encode, BlockBody, HeightRange, PeerId, StateId, SystemState, Timestamp, Transaction,
};

/// What the processor asked of its collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Request { id: StateId, want_body: bool },
    Misbehaved(PeerId),
    NewState,
    RolledBack,
}

/// Collaborator that verifies for real and remembers every call.
#[derive(Clone, Default)]
pub struct Recorder {
    pub log: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    pub fn count(&self, what: &Recorded) -> usize {
        self.log.lock().iter().filter(|r| *r == what).count()
    }

    pub fn clear(&self) {
        self.log.lock().clear();
    }
}

impl Collaborator for Recorder {
    fn request_data(&self, id: StateId, want_body: bool, _peer: Option<PeerId>) {
        self.log.lock().push(Recorded::Request { id, want_body });
    }

    fn on_peer_misbehaved(&self, peer: PeerId) {
        self.log.lock().push(Recorded::Misbehaved(peer));
    }

    fn on_new_state(&self) {
        self.log.lock().push(Recorded::NewState);
    }

    fn on_rolled_back(&self) {
        self.log.lock().push(Recorded::RolledBack);
    }

    fn verify_block(&self, body: &BlockBody, range: HeightRange, subsidy_open: bool, rules: &Rules) -> bool {
        Verifier::new(2).verify(body, range, subsidy_open, rules).is_ok()
    }
}

pub fn open(dir: &tempfile::TempDir, rules: Rules, horizon: Horizon) -> ChainProcessor<Recorder> {
    let db = ChainDb::open(dir.path().join("chaindata")).unwrap();
    ChainProcessor::new(db, Recorder::default(), rules, horizon).unwrap()
}

/// A past instant far enough back that a long chain spaced a minute apart
/// stays clear of the future-timestamp limit.
pub fn base_time() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap() - 1_000_000
}

/// Offer a header and its body. Both must be accepted.
pub fn feed<C: Collaborator>(p: &mut ChainProcessor<C>, state: &SystemState, body: &BlockBody) {
    assert_eq!(p.on_state(state, None).unwrap(), DataStatus::Accepted);
    assert_eq!(p.on_block(&state.id(), encode(body).unwrap(), None).unwrap(), DataStatus::Accepted);
}

/// Assemble a block from `pool`, stamp it with `timestamp` if given, and
/// submit it. Returns the header and body so they can be replayed elsewhere.
pub fn mine<C: Collaborator>(
    p: &mut ChainProcessor<C>,
    pool: &mut TxPool,
    kdf: &Kdf,
    timestamp: Option<Timestamp>,
) -> (SystemState, BlockBody) {
    let mut template = p.generate_new_block(pool, kdf).unwrap().unwrap();
    if let Some(ts) = timestamp {
        template.state.timestamp = ts;
    }
    feed(p, &template.state, &template.body);
    (template.state, template.body)
}

pub fn mine_empty<C: Collaborator>(p: &mut ChainProcessor<C>, kdf: &Kdf, timestamp: Option<Timestamp>) -> (SystemState, BlockBody) {
    mine(p, &mut TxPool::new(), kdf, timestamp)
}

/// Spend the coinbase of the block at `height` mined with `miner`.
pub fn spend_coinbase(miner: &Kdf, height: u64, rules: &Rules, wallet: &Kdf, fee: u64) -> Transaction {
    let value = rules.coinbase_emission;
    build_transaction(
        &[(miner.derive(height, KeyType::Coinbase), value)],
        &[(wallet.derive_index(height), value - fee)],
        &wallet.derive_index(1_000 + height),
        fee,
        HeightRange::UNBOUNDED,
    )
}

/// Put `tx` in `pool` after checking it against the processor.
pub fn admit<C: Collaborator>(p: &mut ChainProcessor<C>, pool: &mut TxPool, tx: &Transaction) {
    let ctx = p.validate_tx(tx).unwrap();
    assert!(p.validate_tx_context(tx).unwrap());
    pool.admit(tx.clone(), ctx, tx.key().unwrap()).unwrap();
}
