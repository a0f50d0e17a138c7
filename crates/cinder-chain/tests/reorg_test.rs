//! Fork choice and reorganization across two processors sharing a prefix.

mod common;

use cinder_chain::config::Horizon;
use cinder_chain::storage::{state_flags, RowId};
use cinder_chain::ChainProcessor;
use cinder_core::crypto::Kdf;
use cinder_core::rules::Rules;
use cinder_core::txpool::TxPool;
use cinder_core::types::{BlockBody, SystemState};

use common::{admit, base_time, feed, mine, mine_empty, open, spend_coinbase, Recorded, Recorder};

/// Difficulty reviewed every block against a one-minute target.
fn fast_review_rules() -> Rules {
    Rules {
        difficulty_review_cycle: 1,
        desired_rate_s: 60,
        ..Rules::regtest()
    }
}

struct Fork {
    a: Vec<(SystemState, BlockBody)>,
    b: Vec<(SystemState, BlockBody)>,
}

/// Chain A: five blocks a minute apart, difficulty 0 throughout.
/// Chain B: A's first two blocks, then three blocks a second apart, which
/// raises the difficulty to 1 and then 2. B's work is 9 against A's 5.
fn build_fork(
    pa: &mut ChainProcessor<Recorder>,
    pb: &mut ChainProcessor<Recorder>,
    pool_a: &mut TxPool,
) -> Fork {
    let base = base_time();
    let (kdf_a, kdf_b) = (Kdf::from_seed([1; 32]), Kdf::from_seed([2; 32]));
    let mut a = Vec::new();
    for h in 1..=5u64 {
        a.push(mine(pa, pool_a, &kdf_a, Some(base + 60 * (h - 1))));
    }
    for (state, body) in &a[..2] {
        feed(pb, state, body);
    }
    let mut b = Vec::new();
    for h in 3..=5u64 {
        b.push(mine_empty(pb, &kdf_b, Some(base + 60 + (h - 2))));
    }
    Fork { a, b }
}

/// Active row at each height from 1 to the cursor.
fn active_rows(p: &ChainProcessor<Recorder>) -> Vec<RowId> {
    (1..=p.cursor().id.height)
        .map(|h| p.db().find_active_at(h).unwrap().unwrap())
        .collect()
}

// ---------------------------------------------------------------------------
// Fork choice
// ---------------------------------------------------------------------------

#[test]
fn heavier_fork_wins_at_equal_height() {
    let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let mut pa = open(&da, fast_review_rules(), Horizon::unlimited());
    let mut pb = open(&db, fast_review_rules(), Horizon::unlimited());
    let fork = build_fork(&mut pa, &mut pb, &mut TxPool::new());

    assert_eq!(pa.cursor().chain_work, 5);
    assert_eq!(fork.b[1].0.pow.difficulty, 1);
    assert_eq!(fork.b[2].0.pow.difficulty, 2);
    assert_eq!(pb.cursor().chain_work, 9);

    let a_tip = pa.cursor().id;
    let a_root = pa.live_root();
    let a_rows = active_rows(&pa);
    pa.collaborator().clear();

    // B3 and B4 bring 5 units of work: a tie does not move the cursor.
    for (state, body) in &fork.b[..2] {
        feed(&mut pa, state, body);
    }
    assert_eq!(pa.cursor().id, a_tip);
    assert_eq!(active_rows(&pa), a_rows);
    assert_eq!(pa.collaborator().count(&Recorded::RolledBack), 0);
    // Stored but never interpreted.
    for (state, _) in &fork.b[..2] {
        let row = pa.db().find_state(&state.id()).unwrap().unwrap();
        assert!(pa.db().rollback_data(row).unwrap().is_none());
    }

    feed(&mut pa, &fork.b[2].0, &fork.b[2].1);
    assert_eq!(pa.cursor().id, fork.b[2].0.id());

    // Rolled back to height 2, then B3..B5 applied forward.
    let b_rows = active_rows(&pa);
    assert_eq!(b_rows[..2], a_rows[..2]);
    for (i, (state, _)) in fork.b.iter().enumerate() {
        let row = pa.db().find_state(&state.id()).unwrap().unwrap();
        assert_eq!(b_rows[i + 2], row);
        assert!(pa.db().rollback_data(row).unwrap().is_some());
    }
    for &row in &a_rows[2..] {
        let value = pa.db().get_row(row).unwrap();
        assert!(!value.has(state_flags::ACTIVE));
        assert!(value.has(state_flags::FUNCTIONAL));
    }
    assert_eq!(pa.cursor().chain_work, 9);
    assert_eq!(pa.collaborator().count(&Recorded::RolledBack), 1);
    assert_eq!(pa.collaborator().count(&Recorded::NewState), 1);
    assert_eq!(pa.live_root(), pb.live_root());
    assert_ne!(pa.live_root(), a_root);
    assert_eq!(pa.definition(false), pb.definition(false));
    pa.check_invariants().unwrap();
}

#[test]
fn lighter_fork_stays_inactive() {
    let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let mut pa = open(&da, fast_review_rules(), Horizon::unlimited());
    let mut pb = open(&db, fast_review_rules(), Horizon::unlimited());
    let fork = build_fork(&mut pa, &mut pb, &mut TxPool::new());

    // B already sits on the heavier chain; A's blocks are only stored.
    let b_tip = pb.cursor().id;
    for (state, body) in &fork.a[2..] {
        feed(&mut pb, state, body);
    }
    assert_eq!(pb.cursor().id, b_tip);
    assert_eq!(pb.db().enum_tips().unwrap().len(), 2);
    pb.check_invariants().unwrap();
}

// ---------------------------------------------------------------------------
// State after a reorganization
// ---------------------------------------------------------------------------

#[test]
fn reorg_returns_spent_outputs() {
    let (da, db) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
    let rules = fast_review_rules();
    let mut pa = open(&da, rules.clone(), Horizon::unlimited());
    let mut pb = open(&db, rules.clone(), Horizon::unlimited());

    // A3 spends the coinbase of block 1, which both chains share.
    let base = base_time();
    let kdf_a = Kdf::from_seed([1; 32]);
    let mut pool = TxPool::new();
    let mut a = Vec::new();
    for h in 1..=2u64 {
        a.push(mine(&mut pa, &mut pool, &kdf_a, Some(base + 60 * (h - 1))));
    }
    let tx = spend_coinbase(&kdf_a, 1, &rules, &Kdf::from_seed([9; 32]), 3);
    admit(&mut pa, &mut pool, &tx);
    for h in 3..=5u64 {
        a.push(mine(&mut pa, &mut pool, &kdf_a, Some(base + 60 * (h - 1))));
    }
    assert!(!pa.validate_tx_context(&tx).unwrap());
    for (state, _) in &a[2..] {
        assert!(pa.record_mined(&state.id(), rules.coinbase_emission).unwrap());
    }
    assert_eq!(pa.mined_since(3).unwrap().len(), 3);

    for (state, body) in &a[..2] {
        feed(&mut pb, state, body);
    }
    let kdf_b = Kdf::from_seed([2; 32]);
    let mut b = Vec::new();
    for h in 3..=5u64 {
        b.push(mine_empty(&mut pb, &kdf_b, Some(base + 60 + (h - 2))));
    }
    for (state, body) in &b {
        feed(&mut pa, state, body);
    }

    assert_eq!(pa.cursor().id, b[2].0.id());
    assert!(pa.validate_tx_context(&tx).unwrap());
    // Mined rewards of the abandoned blocks go with them.
    assert!(pa.mined_since(3).unwrap().is_empty());
    pa.check_invariants().unwrap();
}
