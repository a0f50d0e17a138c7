//! Consensus rules. All monetary values in sparks (1 CINDER = 10^6 sparks).

use serde::{Deserialize, Serialize};

use crate::types::{Amount, Height};

pub const COIN: Amount = 1_000_000;

/// Height of the first block. Height `HEIGHT_GENESIS - 1` denotes "no state".
pub const HEIGHT_GENESIS: Height = 1;

/// Consensus parameters shared by validation, block assembly and the processor.
///
/// Kept as a value rather than global constants so tests and regtest setups can
/// shorten maturities or disable proof-of-work without recompiling.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Rules {
    /// Reward minted by each block's coinbase output.
    pub coinbase_emission: Amount,
    /// Blocks before a coinbase output may be spent.
    pub maturity_coinbase: Height,
    /// Blocks before a regular output may be spent.
    pub maturity_std: Height,
    /// Maximum serialized body size in bytes.
    pub max_body_size: usize,
    /// Maximum allowed clock skew for header timestamps, in seconds.
    pub timestamp_ahead_threshold_s: u64,
    /// Number of headers in the moving-median timestamp window.
    pub window_for_median: usize,
    /// Blocks between difficulty reviews.
    pub difficulty_review_cycle: Height,
    /// Target seconds per block.
    pub desired_rate_s: u64,
    /// Skip proof-of-work checks. Regtest and tests only.
    pub fake_pow: bool,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            coinbase_emission: 40 * COIN,
            maturity_coinbase: 60,
            maturity_std: 0,
            max_body_size: 0x10_0000,
            timestamp_ahead_threshold_s: 60 * 60 * 2,
            window_for_median: 25,
            difficulty_review_cycle: 1440,
            desired_rate_s: 60,
            fake_pow: false,
        }
    }
}

impl Rules {
    /// Rules for local development: no PoW, short coinbase maturity.
    pub fn regtest() -> Self {
        Self {
            maturity_coinbase: 2,
            fake_pow: true,
            ..Self::default()
        }
    }

    /// Upper bound on subsidy for `blocks` consecutive blocks once the
    /// subsidy window is closed.
    pub fn emission_for(&self, blocks: u64) -> u128 {
        u128::from(self.coinbase_emission) * u128::from(blocks)
    }

    /// Byte budget for pool transactions when assembling a block.
    ///
    /// 95% of the body limit minus room for the fee output, the coinbase
    /// output and either a fee kernel or an empty kernel.
    pub fn assembly_budget(&self) -> usize {
        const ROUGH_EXTRA: usize = 32 * 2 + 2 * 72 + 300;
        (self.max_body_size * 95 / 100).saturating_sub(ROUGH_EXTRA)
    }
}
