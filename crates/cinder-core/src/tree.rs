//! In-memory commitment sets: live UTXOs and live kernels.
//!
//! Both trees mirror the durable spendable table as of the chain cursor and
//! are rebuilt from it at startup. Their roots feed the header definition.

use std::collections::{BTreeMap, BTreeSet};

use crate::merkle::merkle_root;
use crate::types::{Commitment, Hash256, Height, HeightRange};

/// UTXO tree key: commitment followed by big-endian maturity, so keys for
/// one commitment are contiguous and ordered by maturity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtxoKey {
    pub commitment: Commitment,
    pub maturity: Height,
}

impl UtxoKey {
    pub const SIZE: usize = 40;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..32].copy_from_slice(&self.commitment.0);
        out[32..].copy_from_slice(&self.maturity.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::SIZE {
            return None;
        }
        let mut commitment = [0u8; 32];
        commitment.copy_from_slice(&bytes[..32]);
        let mut maturity = [0u8; 8];
        maturity.copy_from_slice(&bytes[32..]);
        Some(Self {
            commitment: Commitment(commitment),
            maturity: Height::from_be_bytes(maturity),
        })
    }
}

/// Result of a spend lookup over a maturity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    None,
    One(UtxoKey, u32),
    /// More than one live key for the commitment inside the window.
    Ambiguous,
}

/// Live outputs keyed by [`UtxoKey`], each with a count of identical
/// instances.
#[derive(Debug, Clone, Default)]
pub struct UtxoTree {
    entries: BTreeMap<UtxoKey, u32>,
    root: Option<Hash256>,
}

impl PartialEq for UtxoTree {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for UtxoTree {}

impl UtxoTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &UtxoKey) -> Option<u32> {
        self.entries.get(key).copied()
    }

    /// Find the live key for `commitment` whose maturity lies in `window`.
    pub fn find_in_range(&self, commitment: &Commitment, window: HeightRange) -> Lookup {
        if window.is_empty() {
            return Lookup::None;
        }
        let lo = UtxoKey { commitment: *commitment, maturity: window.min };
        let hi = UtxoKey { commitment: *commitment, maturity: window.max };
        let mut it = self.entries.range(lo..=hi);
        match (it.next(), it.next()) {
            (None, _) => Lookup::None,
            (Some((k, c)), None) => Lookup::One(*k, *c),
            (Some(_), Some(_)) => Lookup::Ambiguous,
        }
    }

    /// Add one instance at `key`. Returns the new count.
    pub fn increment(&mut self, key: UtxoKey) -> u32 {
        self.root = None;
        let count = self.entries.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove one instance at `key`, deleting the node at zero. Returns the
    /// remaining count, or `None` if the key is absent.
    pub fn decrement(&mut self, key: &UtxoKey) -> Option<u32> {
        let count = self.entries.get_mut(key)?;
        self.root = None;
        *count -= 1;
        let left = *count;
        if left == 0 {
            self.entries.remove(key);
        }
        Some(left)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UtxoKey, &u32)> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.root = None;
    }

    /// Merkle root over `BLAKE3(key || count)` in key order.
    pub fn root(&mut self) -> Hash256 {
        if let Some(r) = self.root {
            return r;
        }
        let leaves: Vec<Hash256> = self
            .entries
            .iter()
            .map(|(k, c)| {
                let mut hasher = blake3::Hasher::new();
                hasher.update(&k.to_bytes());
                hasher.update(&c.to_le_bytes());
                Hash256(hasher.finalize().into())
            })
            .collect();
        let r = merkle_root(&leaves);
        self.root = Some(r);
        r
    }
}

/// Live kernel IDs. Presence is the whole value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelTree {
    ids: BTreeSet<Hash256>,
}

impl KernelTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.ids.contains(id)
    }

    /// `false` if the kernel is already present.
    pub fn insert(&mut self, id: Hash256) -> bool {
        self.ids.insert(id)
    }

    /// `false` if the kernel is absent.
    pub fn remove(&mut self, id: &Hash256) -> bool {
        self.ids.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hash256> {
        self.ids.iter()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn root(&self) -> Hash256 {
        let ids: Vec<Hash256> = self.ids.iter().copied().collect();
        merkle_root(&ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(c: u8, maturity: Height) -> UtxoKey {
        UtxoKey { commitment: Commitment([c; 32]), maturity }
    }

    // --- UtxoKey ---

    #[test]
    fn key_bytes_roundtrip_and_order() {
        let a = key(1, 5);
        assert_eq!(UtxoKey::from_bytes(&a.to_bytes()), Some(a));
        assert!(a.to_bytes() < key(1, 256).to_bytes());
        assert!(UtxoKey::from_bytes(&[0u8; 39]).is_none());
    }

    // --- UtxoTree ---

    #[test]
    fn range_lookup_respects_window() {
        let mut t = UtxoTree::new();
        t.increment(key(1, 12));
        assert_eq!(t.find_in_range(&Commitment([1; 32]), HeightRange::new(1, 11)), Lookup::None);
        assert_eq!(
            t.find_in_range(&Commitment([1; 32]), HeightRange::new(1, 12)),
            Lookup::One(key(1, 12), 1)
        );
        assert_eq!(t.find_in_range(&Commitment([2; 32]), HeightRange::new(1, 99)), Lookup::None);
    }

    #[test]
    fn two_maturities_are_ambiguous() {
        let mut t = UtxoTree::new();
        t.increment(key(1, 3));
        t.increment(key(1, 7));
        assert_eq!(t.find_in_range(&Commitment([1; 32]), HeightRange::new(1, 10)), Lookup::Ambiguous);
        assert_eq!(
            t.find_in_range(&Commitment([1; 32]), HeightRange::new(1, 5)),
            Lookup::One(key(1, 3), 1)
        );
    }

    #[test]
    fn decrement_deletes_at_zero() {
        let mut t = UtxoTree::new();
        assert_eq!(t.increment(key(1, 3)), 1);
        assert_eq!(t.increment(key(1, 3)), 2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.decrement(&key(1, 3)), Some(1));
        assert_eq!(t.decrement(&key(1, 3)), Some(0));
        assert!(t.is_empty());
        assert_eq!(t.decrement(&key(1, 3)), None);
    }

    #[test]
    fn root_tracks_counts() {
        let mut t = UtxoTree::new();
        assert_eq!(t.root(), Hash256::ZERO);
        t.increment(key(1, 3));
        let one = t.root();
        t.increment(key(1, 3));
        assert_ne!(t.root(), one);
        t.decrement(&key(1, 3));
        assert_eq!(t.root(), one);
    }

    // --- KernelTree ---

    #[test]
    fn kernel_presence() {
        let mut t = KernelTree::new();
        let id = Hash256([4; 32]);
        assert!(t.insert(id));
        assert!(!t.insert(id));
        assert!(t.contains(&id));
        assert!(t.remove(&id));
        assert!(!t.remove(&id));
        assert_eq!(t.root(), Hash256::ZERO);
    }
}
