//! Output maturity and double spends through the pool and assembly.

mod common;

use cinder_chain::config::Horizon;
use cinder_core::block::build_transaction;
use cinder_core::crypto::Kdf;
use cinder_core::rules::Rules;
use cinder_core::txpool::TxPool;
use cinder_core::types::HeightRange;

use common::{admit, mine, mine_empty, open, spend_coinbase};

fn miner() -> Kdf {
    Kdf::from_seed([4; 32])
}

fn wallet() -> Kdf {
    Kdf::from_seed([8; 32])
}

#[test]
fn coinbase_matures_after_configured_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let rules = Rules::regtest();
    let mut p = open(&dir, rules.clone(), Horizon::unlimited());

    mine_empty(&mut p, &miner(), None);
    let tx = spend_coinbase(&miner(), 1, &rules, &wallet(), 1);
    p.validate_tx(&tx).unwrap();
    assert!(!p.validate_tx_context(&tx).unwrap());

    mine_empty(&mut p, &miner(), None);
    assert!(p.validate_tx_context(&tx).unwrap());
}

#[test]
fn standard_output_waits_for_its_maturity() {
    let dir = tempfile::tempdir().unwrap();
    let rules = Rules {
        maturity_std: 2,
        ..Rules::regtest()
    };
    let mut p = open(&dir, rules.clone(), Horizon::unlimited());
    let mut pool = TxPool::new();
    for _ in 0..2 {
        mine_empty(&mut p, &miner(), None);
    }

    let fee = 2;
    let first = spend_coinbase(&miner(), 1, &rules, &wallet(), fee);
    admit(&mut p, &mut pool, &first);
    mine(&mut p, &mut pool, &miner(), None);
    assert_eq!(p.cursor().id.height, 3);

    // Created at 3 with maturity 2: spendable from height 5.
    let value = rules.coinbase_emission - fee;
    let second = build_transaction(
        &[(wallet().derive_index(1), value)],
        &[(wallet().derive_index(77), value - 1)],
        &wallet().derive_index(78),
        1,
        HeightRange::UNBOUNDED,
    );
    assert!(!p.validate_tx_context(&second).unwrap());
    mine_empty(&mut p, &miner(), None);
    assert!(p.validate_tx_context(&second).unwrap());
}

#[test]
fn double_spend_in_pool_mines_once() {
    let dir = tempfile::tempdir().unwrap();
    let rules = Rules::regtest();
    let mut p = open(&dir, rules.clone(), Horizon::unlimited());
    let mut pool = TxPool::new();
    for _ in 0..2 {
        mine_empty(&mut p, &miner(), None);
    }

    let cheap = spend_coinbase(&miner(), 1, &rules, &wallet(), 3);
    let rich = spend_coinbase(&miner(), 1, &rules, &Kdf::from_seed([9; 32]), 40);
    admit(&mut p, &mut pool, &cheap);
    admit(&mut p, &mut pool, &rich);
    assert_eq!(pool.len(), 2);

    mine(&mut p, &mut pool, &miner(), None);
    assert!(pool.contains(&rich.key().unwrap()));
    assert!(!pool.contains(&cheap.key().unwrap()));
    assert!(!p.validate_tx_context(&rich).unwrap());
    assert!(!p.validate_tx_context(&cheap).unwrap());
    p.check_invariants().unwrap();
}

#[test]
fn spending_one_output_twice_in_a_transaction_fails() {
    let dir = tempfile::tempdir().unwrap();
    let rules = Rules::regtest();
    let mut p = open(&dir, rules.clone(), Horizon::unlimited());
    for _ in 0..2 {
        mine_empty(&mut p, &miner(), None);
    }

    let key = miner().derive(1, cinder_core::crypto::KeyType::Coinbase);
    let value = rules.coinbase_emission;
    let tx = build_transaction(
        &[(key, value), (key, value)],
        &[(wallet().derive_index(5), 2 * value - 1)],
        &wallet().derive_index(6),
        1,
        HeightRange::UNBOUNDED,
    );
    let applies = p.validate_tx(&tx).is_ok() && p.validate_tx_context(&tx).unwrap();
    assert!(!applies);
    assert!(!p.is_poisoned());
}
