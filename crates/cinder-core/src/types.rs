//! Core protocol types: headers, commitments, transaction elements, bodies.
//!
//! All monetary values are in sparks (1 CINDER = 10^6 sparks). Heights start
//! at [`HEIGHT_GENESIS`](crate::rules::HEIGHT_GENESIS).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::rules::Rules;

pub type Height = u64;
pub type Timestamp = u64;
pub type Amount = u64;
/// Cumulative amounts (total subsidy) that may exceed `u64`.
pub type AmountBig = u128;

/// A 32-byte hash value.
///
/// Used for header hashes (double SHA-256), kernel IDs, transaction keys
/// and Merkle roots (BLAKE3).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Marks "no parent" and the subsidy-closed kernel.
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// BLAKE3 of arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        Self(blake3::hash(data).into())
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identity of the peer that supplied a header or body.
pub type PeerId = Hash256;

/// Encode a value with the canonical bincode configuration.
pub fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, bincode::error::EncodeError> {
    bincode::encode_to_vec(value, bincode::config::standard())
}

/// Inclusive height interval. Empty when `min > max`.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct HeightRange {
    pub min: Height,
    pub max: Height,
}

impl HeightRange {
    pub const UNBOUNDED: Self = Self { min: 0, max: Height::MAX };

    pub fn new(min: Height, max: Height) -> Self {
        Self { min, max }
    }

    pub fn single(h: Height) -> Self {
        Self { min: h, max: h }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, h: Height) -> bool {
        self.min <= h && h <= self.max
    }

    pub fn intersects(&self, other: &Self) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn intersect(&self, other: &Self) -> Self {
        Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Number of heights covered.
    pub fn len(&self) -> u64 {
        if self.is_empty() { 0 } else { self.max - self.min + 1 }
    }
}

/// A compressed Ristretto point: a Pedersen commitment or a kernel excess.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Commitment(pub [u8; 32]);

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A canonical scalar in little-endian bytes (blinding offsets).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Offset(pub [u8; 32]);

impl Offset {
    pub const ZERO: Self = Self([0u8; 32]);
}

/// Schnorr signature over Ristretto: nonce point `R` and response `s`.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Signature {
    pub nonce: [u8; 32],
    pub response: [u8; 32],
}

/// Spend of an existing output.
///
/// `maturity` is zero for an ordinary spend. Macroblocks carry the explicit
/// maturity of the consumed UTXO key.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Input {
    pub commitment: Commitment,
    pub maturity: Height,
}

impl Input {
    pub fn new(commitment: Commitment) -> Self {
        Self { commitment, maturity: 0 }
    }
}

/// Public value proof: the revealed value and a signature by the blinding
/// factor over the commitment minus the value component.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct ValueProof {
    pub value: Amount,
    pub signature: Signature,
}

/// A newly created output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Output {
    pub commitment: Commitment,
    /// Explicit maturity; zero unless carried inside a macroblock.
    pub maturity: Height,
    pub coinbase: bool,
    /// Extra blocks before the output may be spent.
    pub incubation: Height,
    pub proof: ValueProof,
}

impl Output {
    /// Earliest height at which an output created at `height` can be spent.
    pub fn min_maturity(&self, height: Height, rules: &Rules) -> Height {
        let base = if self.coinbase {
            rules.maturity_coinbase
        } else {
            rules.maturity_std
        };
        height.saturating_add(base).saturating_add(self.incubation)
    }
}

/// Transaction kernel: the excess (sum of blinding factors) with its fee,
/// validity window and signature.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct TxKernel {
    pub excess: Commitment,
    pub fee: Amount,
    pub height: HeightRange,
    pub signature: Signature,
}

impl TxKernel {
    /// Message signed by the excess key.
    pub fn signing_hash(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new_derive_key("cinder 2024 kernel signing");
        hasher.update(&self.excess.0);
        hasher.update(&self.fee.to_le_bytes());
        hasher.update(&self.height.min.to_le_bytes());
        hasher.update(&self.height.max.to_le_bytes());
        Hash256(hasher.finalize().into())
    }

    /// Kernel ID: hash over every field, signature included.
    pub fn id(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.signing_hash().as_bytes());
        hasher.update(&self.signature.nonce);
        hasher.update(&self.signature.response);
        Hash256(hasher.finalize().into())
    }
}

/// The four element vectors shared by transactions and block bodies.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct TxVectors {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels_in: Vec<TxKernel>,
    pub kernels_out: Vec<TxKernel>,
}

impl TxVectors {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.outputs.is_empty()
            && self.kernels_in.is_empty()
            && self.kernels_out.is_empty()
    }

    pub fn sort(&mut self) {
        self.inputs.sort();
        self.outputs.sort();
        self.kernels_in.sort();
        self.kernels_out.sort();
    }

    pub fn is_sorted(&self) -> bool {
        self.inputs.is_sorted()
            && self.outputs.is_sorted()
            && self.kernels_in.is_sorted()
            && self.kernels_out.is_sorted()
    }

    /// Append all elements of `other`. The result is unsorted.
    pub fn append(&mut self, other: &TxVectors) {
        self.inputs.extend_from_slice(&other.inputs);
        self.outputs.extend_from_slice(&other.outputs);
        self.kernels_in.extend_from_slice(&other.kernels_in);
        self.kernels_out.extend_from_slice(&other.kernels_out);
    }
}

/// A transaction submitted to the pool.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    pub elements: TxVectors,
    pub offset: Offset,
}

impl Transaction {
    /// Pool key: BLAKE3 of the canonical encoding.
    pub fn key(&self) -> Result<Hash256, bincode::error::EncodeError> {
        Ok(Hash256::digest(&encode(self)?))
    }
}

/// A block body (or a compacted macroblock body).
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockBody {
    /// Newly minted value in this body.
    pub subsidy: AmountBig,
    /// Set by the block that ends the open-subsidy period.
    pub subsidy_closing: bool,
    pub offset: Offset,
    pub elements: TxVectors,
}

/// Proof-of-work attached to a header.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct PoW {
    /// Required leading zero bits of the header hash.
    pub difficulty: u8,
    pub nonce: u64,
}

/// Full block header ("system state").
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct SystemState {
    pub height: Height,
    pub prev: Hash256,
    /// Commitment to the post-block UTXO and kernel sets plus history.
    pub definition: Hash256,
    pub timestamp: Timestamp,
    pub pow: PoW,
}

impl SystemState {
    /// Header size in bytes when serialized for hashing.
    const HASH_SIZE: usize = 8 + 32 + 32 + 8 + 1 + 8;

    /// Header hash (double SHA-256).
    ///
    /// Explicit byte layout: height || prev || definition || timestamp ||
    /// difficulty || nonce, integers little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(self.prev.as_bytes());
        data.extend_from_slice(self.definition.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.push(self.pow.difficulty);
        data.extend_from_slice(&self.pow.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    pub fn id(&self) -> StateId {
        StateId {
            height: self.height,
            hash: self.hash(),
        }
    }
}

/// Header identity: height plus hash.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct StateId {
    pub height: Height,
    pub hash: Hash256,
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, &hex::encode(self.hash.0)[..16])
    }
}

/// First-header context of a macroblock header sequence.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct HeaderPrefix {
    pub height: Height,
    pub prev: Hash256,
}

/// Per-header fields of a macroblock header sequence. Height and parent
/// hash are implied by position.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct HeaderElement {
    pub definition: Hash256,
    pub timestamp: Timestamp,
    pub pow: PoW,
}

impl From<&SystemState> for HeaderElement {
    fn from(s: &SystemState) -> Self {
        Self {
            definition: s.definition,
            timestamp: s.timestamp,
            pow: s.pow,
        }
    }
}

/// A compacted range of blocks: one combined body plus the header sequence.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Macroblock {
    pub body: BlockBody,
    pub prefix: HeaderPrefix,
    pub headers: Vec<HeaderElement>,
}

impl Macroblock {
    /// Rebuild the full headers, chaining each parent hash. `None` if the
    /// heights overflow.
    pub fn states(&self) -> Option<Vec<SystemState>> {
        self.range()?;
        let mut prev = self.prefix.prev;
        let mut out = Vec::with_capacity(self.headers.len());
        for (height, e) in (self.prefix.height..).zip(&self.headers) {
            let s = SystemState {
                height,
                prev,
                definition: e.definition,
                timestamp: e.timestamp,
                pow: e.pow,
            };
            prev = s.hash();
            out.push(s);
        }
        Some(out)
    }

    /// Heights covered by the header sequence; `None` when there are no
    /// headers or the last height does not fit.
    pub fn range(&self) -> Option<HeightRange> {
        let span = (self.headers.len() as u64).checked_sub(1)?;
        let max = self.prefix.height.checked_add(span)?;
        Some(HeightRange::new(self.prefix.height, max))
    }
}
