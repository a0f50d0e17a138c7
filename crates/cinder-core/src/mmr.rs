//! Distributed Merkle mountain range over header hashes.
//!
//! No element holds the whole structure. The node stored for leaf `i` keeps
//! the hashes of every subtree that ends at `i` (one per merge performed when
//! `i` was appended) and links to the elements holding the left siblings of
//! those merges and the previous peak. Appending, computing the root and
//! building a proof each touch O(log n) nodes through an [`MmrStore`].
//!
//! Peaks are bagged right to left: `root = node(P0, node(P1, ... Pk))`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merkle::{leaf_hash, node_hash, MerkleProof, ProofStep, Side};
use crate::types::Hash256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MmrError {
    #[error("missing MMR link at leaf {0}")] MissingLink(u64),
    #[error("malformed MMR node at leaf {0}")] Malformed(u64),
    #[error("leaf {index} outside MMR of {count} leaves")] OutOfRange { index: u64, count: u64 },
}

/// The MMR node owned by one element.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MmrNode<K> {
    /// `links[j]` holds the left sibling merged at height `j`.
    pub links: Vec<K>,
    /// Element holding the peak to the left of this element's peak.
    pub prev_peak: Option<K>,
    /// `hashes[0]` is the leaf hash; `hashes[j]` the subtree of height `j`.
    pub hashes: Vec<Hash256>,
}

impl<K> MmrNode<K> {
    /// Hash of the tallest subtree ending at this element.
    pub fn top(&self) -> Hash256 {
        self.hashes.last().copied().unwrap_or(Hash256::ZERO)
    }
}

/// Random access to the MMR nodes of one chain, keyed by element handle.
pub trait MmrStore {
    type Key: Copy;
    type Error: From<MmrError>;

    fn load(&self, key: Self::Key) -> Result<MmrNode<Self::Key>, Self::Error>;
}

fn subtree_hash<K>(node: &MmrNode<K>, height: usize, leaf: u64) -> Result<Hash256, MmrError> {
    node.hashes.get(height).copied().ok_or(MmrError::Malformed(leaf))
}

fn link<K: Copy>(node: &MmrNode<K>, height: usize, leaf: u64) -> Result<K, MmrError> {
    node.links.get(height).copied().ok_or(MmrError::MissingLink(leaf))
}

/// Build the node for leaf `index`, given the element holding leaf
/// `index - 1` (`None` when the MMR is empty).
pub fn append<S: MmrStore>(
    store: &S,
    last: Option<S::Key>,
    index: u64,
    leaf: &Hash256,
) -> Result<MmrNode<S::Key>, S::Error> {
    let merges = index.trailing_ones() as usize;
    let mut hashes = Vec::with_capacity(merges + 1);
    let mut links = Vec::with_capacity(merges);
    hashes.push(leaf_hash(leaf));

    let mut cur = last;
    for j in 0..merges {
        let sibling_leaf = index - (1u64 << j);
        let key = cur.ok_or(MmrError::MissingLink(sibling_leaf))?;
        let sibling = store.load(key)?;
        let left = subtree_hash(&sibling, j, sibling_leaf)?;
        hashes.push(node_hash(&left, &hashes[j]));
        links.push(key);
        cur = sibling.prev_peak;
    }

    Ok(MmrNode {
        links,
        prev_peak: cur,
        hashes,
    })
}

/// Root of the MMR whose last element is `node`.
pub fn root<S: MmrStore>(store: &S, node: &MmrNode<S::Key>) -> Result<Hash256, S::Error> {
    let mut acc = node.top();
    let mut cur = node.prev_peak;
    while let Some(key) = cur {
        let peak = store.load(key)?;
        acc = node_hash(&peak.top(), &acc);
        cur = peak.prev_peak;
    }
    Ok(acc)
}

/// Root after appending `leaf` as leaf `index`, without storing anything.
pub fn predicted_root<S: MmrStore>(
    store: &S,
    last: Option<S::Key>,
    index: u64,
    leaf: &Hash256,
) -> Result<Hash256, S::Error> {
    let node = append(store, last, index, leaf)?;
    root(store, &node)
}

/// Inclusion proof for leaf `index` (whose value is `leaf`) in the MMR of
/// `count` leaves whose last element is `last`.
pub fn proof<S: MmrStore>(
    store: &S,
    last: S::Key,
    count: u64,
    index: u64,
    leaf: Hash256,
) -> Result<MerkleProof, S::Error> {
    if index >= count {
        return Err(MmrError::OutOfRange { index, count }.into());
    }

    // Peaks right to left: (element node, last leaf, height).
    let mut peaks = Vec::new();
    let mut key = Some(last);
    let mut end = count - 1;
    while let Some(k) = key {
        let node = store.load(k)?;
        let height = node.hashes.len().saturating_sub(1);
        key = node.prev_peak;
        peaks.push((node, end, height));
        if key.is_some() {
            end = end
                .checked_sub(1u64 << height)
                .ok_or(MmrError::Malformed(end))?;
        }
    }

    let pos = peaks
        .iter()
        .position(|(_, e, h)| index + (1u64 << h) > *e && index <= *e)
        .ok_or(MmrError::OutOfRange { index, count })?;

    // Descend inside the peak, collecting siblings top-down.
    let mut down = Vec::new();
    {
        let (top_node, peak_end, height) = &peaks[pos];
        let mut node = top_node.clone();
        let mut elem_end = *peak_end;
        let mut h = *height;
        while h > 0 {
            let half = 1u64 << (h - 1);
            let left_key = link(&node, h - 1, elem_end)?;
            if index + half <= elem_end {
                // Target in the left half; sibling is our own right subtree.
                down.push(ProofStep {
                    hash: subtree_hash(&node, h - 1, elem_end)?,
                    side: Side::Right,
                });
                node = store.load(left_key)?;
                elem_end -= half;
            } else {
                let left = store.load(left_key)?;
                down.push(ProofStep {
                    hash: subtree_hash(&left, h - 1, elem_end - half)?,
                    side: Side::Left,
                });
            }
            h -= 1;
        }
    }
    let mut path: Vec<ProofStep> = down.into_iter().rev().collect();

    // Bag of the peaks to the right, then each peak to the left.
    if pos > 0 {
        let mut bag = peaks[0].0.top();
        for (n, _, _) in peaks[1..pos].iter() {
            bag = node_hash(&n.top(), &bag);
        }
        path.push(ProofStep { hash: bag, side: Side::Right });
    }
    for (n, _, _) in peaks[pos + 1..].iter() {
        path.push(ProofStep { hash: n.top(), side: Side::Left });
    }

    Ok(MerkleProof {
        leaf_index: index,
        leaf,
        path,
    })
}
