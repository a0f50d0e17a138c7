//! Proof-of-work difficulty.
//!
//! Difficulty is the number of leading zero bits the header hash must carry.
//! It is reviewed once every [`Rules::difficulty_review_cycle`] blocks by
//! comparing the time the cycle took against the target:
//!
//! - less than half the target time: +1 bit (capped at 255)
//! - more than twice the target time: -1 bit (floored at 0)
//! - otherwise unchanged

use crate::rules::Rules;
use crate::types::{Hash256, SystemState, Timestamp};

/// Number of leading zero bits in `hash`.
pub fn leading_zero_bits(hash: &Hash256) -> u32 {
    let mut bits = 0;
    for byte in hash.0 {
        if byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Check the header's proof-of-work against its declared difficulty.
pub fn is_valid_pow(state: &SystemState, rules: &Rules) -> bool {
    rules.fake_pow || leading_zero_bits(&state.hash()) >= u32::from(state.pow.difficulty)
}

/// Adjust `current` given the timestamps at both ends of a review cycle.
pub fn adjust(current: u8, start: Timestamp, end: Timestamp, rules: &Rules) -> u8 {
    let target = rules.desired_rate_s.saturating_mul(rules.difficulty_review_cycle);
    let elapsed = end.saturating_sub(start);
    if elapsed < target / 2 {
        current.saturating_add(1)
    } else if elapsed > target.saturating_mul(2) {
        current.saturating_sub(1)
    } else {
        current
    }
}

/// Search nonces until the header satisfies its difficulty.
///
/// Returns `false` if `max_attempts` nonces were tried without success.
pub fn solve(state: &mut SystemState, rules: &Rules, max_attempts: u64) -> bool {
    for _ in 0..max_attempts {
        if is_valid_pow(state, rules) {
            return true;
        }
        state.pow.nonce = state.pow.nonce.wrapping_add(1);
    }
    is_valid_pow(state, rules)
}
