//! In-memory pool of validated transactions awaiting inclusion.
//!
//! Every element is indexed three ways:
//! - by key (BLAKE3 of the encoded transaction) for direct lookup
//! - by expiry threshold (the last height its kernels allow) for eviction
//!   once the chain moves past it
//! - by profit (fee per byte, highest first) for block assembly and for
//!   size-limited eviction from the low end
//!
//! Transactions must pass [`check_transaction`](crate::block::check_transaction)
//! before admission; the pool only checks for duplicates and expiry.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::block::TxContext;
use crate::error::PoolError;
use crate::types::{encode, Amount, Hash256, Height, Transaction};

/// Fee density, compared exactly by cross-multiplication.
///
/// Orders highest profit first: `a < b` iff `a.fee * b.size > b.fee * a.size`.
#[derive(Debug, Clone, Copy)]
pub struct Profit {
    pub fee: Amount,
    pub size: u64,
}

impl Profit {
    /// Saturates the fee to `u64::MAX`; a zero size counts as one byte.
    pub fn new(fee: u128, size: usize) -> Self {
        Self {
            fee: u64::try_from(fee).unwrap_or(u64::MAX),
            size: (size as u64).max(1),
        }
    }
}

impl Ord for Profit {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = u128::from(self.fee) * u128::from(other.size);
        let rhs = u128::from(other.fee) * u128::from(self.size);
        rhs.cmp(&lhs)
    }
}

impl PartialOrd for Profit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Profit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Profit {}

/// A pooled transaction with its precomputed index keys.
#[derive(Debug, Clone)]
pub struct PoolElement {
    pub tx: Transaction,
    pub ctx: TxContext,
    pub key: Hash256,
    /// Last height at which the transaction may be included.
    pub threshold: Height,
    pub profit: Profit,
}

/// Multi-indexed transaction pool.
///
/// Not thread-safe; the node wraps it in a `Mutex`.
#[derive(Debug, Default)]
pub struct TxPool {
    entries: HashMap<Hash256, PoolElement>,
    by_threshold: BTreeSet<(Height, Hash256)>,
    by_profit: BTreeSet<(Profit, Hash256)>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &Hash256) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &Hash256) -> Option<&PoolElement> {
        self.entries.get(key)
    }

    /// Insert into all three indices.
    pub fn admit(
        &mut self,
        tx: Transaction,
        ctx: TxContext,
        key: Hash256,
    ) -> Result<(), PoolError> {
        if self.entries.contains_key(&key) {
            return Err(PoolError::AlreadyExists(key.to_string()));
        }
        let size = encode(&tx)
            .map_err(|e| PoolError::Codec(e.to_string()))?
            .len();
        let profit = Profit::new(ctx.fee, size);
        let threshold = ctx.height.max;

        self.by_threshold.insert((threshold, key));
        self.by_profit.insert((profit, key));
        self.entries.insert(
            key,
            PoolElement {
                tx,
                ctx,
                key,
                threshold,
                profit,
            },
        );
        Ok(())
    }

    /// Remove an element from every index.
    pub fn delete(&mut self, key: &Hash256) -> Option<PoolElement> {
        let elem = self.entries.remove(key)?;
        self.by_threshold.remove(&(elem.threshold, elem.key));
        self.by_profit.remove(&(elem.profit, elem.key));
        Some(elem)
    }

    /// Remove every element whose threshold is below `height`.
    pub fn evict_expired(&mut self, height: Height) -> usize {
        let expired: Vec<Hash256> = self
            .by_threshold
            .iter()
            .take_while(|(t, _)| *t < height)
            .map(|(_, k)| *k)
            .collect();
        for key in &expired {
            self.delete(key);
        }
        expired.len()
    }

    /// Evict lowest-profit elements until at most `max` remain.
    pub fn shrink_to(&mut self, max: usize) -> usize {
        let mut removed = 0;
        while self.entries.len() > max {
            let Some(&(_, key)) = self.by_profit.iter().next_back() else {
                break;
            };
            self.delete(&key);
            removed += 1;
        }
        removed
    }

    /// Elements in descending profit order.
    pub fn iter_by_profit(&self) -> impl Iterator<Item = &PoolElement> {
        self.by_profit
            .iter()
            .filter_map(|(_, key)| self.entries.get(key))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_threshold.clear();
        self.by_profit.clear();
    }
}
