//! Commitment and signature primitives over the Ristretto group.
//!
//! - Pedersen commitments `C = k·G + v·H`, where `H` is hashed to the group.
//! - Schnorr signatures with deterministic nonces, used for kernel signatures
//!   and public value proofs.
//! - A seed-based key derivation function for miner keys.
//!
//! Confidential range proofs are not carried: every output reveals its value
//! through a [`ValueProof`].

use std::sync::LazyLock;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::Identity;
use rand::RngCore;

use crate::types::{
    Amount, Commitment, Hash256, HeightRange, Offset, Signature, TxKernel, ValueProof,
};

/// Second generator for the value component of commitments.
static VALUE_GENERATOR: LazyLock<RistrettoPoint> = LazyLock::new(|| {
    RistrettoPoint::from_uniform_bytes(&wide_hash("cinder 2024 value generator", &[]))
});

/// 64-byte domain-separated BLAKE3 output.
fn wide_hash(domain: &str, parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    for p in parts {
        hasher.update(p);
    }
    let mut out = [0u8; 64];
    hasher.finalize_xof().fill(&mut out);
    out
}

/// The value generator `H`.
pub fn value_generator() -> RistrettoPoint {
    *VALUE_GENERATOR
}

/// `v·H` for an amount that may exceed `u64`.
pub fn value_point(value: u128) -> RistrettoPoint {
    value_generator() * Scalar::from(value)
}

/// Pedersen commitment to `value` with blinding factor `blind`.
pub fn commit(blind: &Scalar, value: Amount) -> Commitment {
    let p = RISTRETTO_BASEPOINT_POINT * blind + value_point(u128::from(value));
    Commitment(p.compress().to_bytes())
}

/// Public key `k·G` of a secret scalar, as a commitment to zero.
pub fn public_excess(key: &Scalar) -> Commitment {
    Commitment((RISTRETTO_BASEPOINT_POINT * key).compress().to_bytes())
}

/// Decompress a commitment. `None` if the bytes are not a valid point.
pub fn decompress(c: &Commitment) -> Option<RistrettoPoint> {
    CompressedRistretto(c.0).decompress()
}

/// The group identity (sum of nothing).
pub fn identity() -> RistrettoPoint {
    RistrettoPoint::identity()
}

/// `offset·G`.
pub fn offset_point(offset: &Offset) -> Option<RistrettoPoint> {
    scalar_from_offset(offset).map(|s| RISTRETTO_BASEPOINT_POINT * s)
}

// ---------------------------------------------------------------------------
// Offsets
// ---------------------------------------------------------------------------

/// Parse a canonical scalar. `None` for non-canonical encodings.
pub fn scalar_from_offset(offset: &Offset) -> Option<Scalar> {
    Option::from(Scalar::from_canonical_bytes(offset.0))
}

pub fn offset_from_scalar(s: &Scalar) -> Offset {
    Offset(s.to_bytes())
}

/// Sum of two offsets.
pub fn add_offsets(a: &Offset, b: &Offset) -> Option<Offset> {
    Some(offset_from_scalar(&(scalar_from_offset(a)? + scalar_from_offset(b)?)))
}

/// `a - b`.
pub fn sub_offsets(a: &Offset, b: &Offset) -> Option<Offset> {
    Some(offset_from_scalar(&(scalar_from_offset(a)? - scalar_from_offset(b)?)))
}

// ---------------------------------------------------------------------------
// Schnorr signatures
// ---------------------------------------------------------------------------

fn challenge(nonce: &CompressedRistretto, public: &CompressedRistretto, msg: &Hash256) -> Scalar {
    Scalar::from_bytes_mod_order_wide(&wide_hash(
        "cinder 2024 schnorr challenge",
        &[nonce.as_bytes(), public.as_bytes(), msg.as_bytes()],
    ))
}

/// Sign `msg` with `key`. The nonce is derived from the key and message.
pub fn sign(key: &Scalar, msg: &Hash256) -> Signature {
    let r = Scalar::from_bytes_mod_order_wide(&wide_hash(
        "cinder 2024 schnorr nonce",
        &[key.as_bytes(), msg.as_bytes()],
    ));
    let nonce = (RISTRETTO_BASEPOINT_POINT * r).compress();
    let public = (RISTRETTO_BASEPOINT_POINT * key).compress();
    let e = challenge(&nonce, &public, msg);
    Signature {
        nonce: nonce.to_bytes(),
        response: (r + e * key).to_bytes(),
    }
}

/// Verify `s·G == R + e·P`.
pub fn verify(public: &RistrettoPoint, msg: &Hash256, sig: &Signature) -> bool {
    let Some(nonce) = CompressedRistretto(sig.nonce).decompress() else {
        return false;
    };
    let Some(s) = Option::<Scalar>::from(Scalar::from_canonical_bytes(sig.response)) else {
        return false;
    };
    let e = challenge(&CompressedRistretto(sig.nonce), &public.compress(), msg);
    RISTRETTO_BASEPOINT_POINT * s == nonce + public * e
}

// ---------------------------------------------------------------------------
// Value proofs and kernels
// ---------------------------------------------------------------------------

fn value_proof_msg(commitment: &Commitment, value: Amount) -> Hash256 {
    let mut hasher = blake3::Hasher::new_derive_key("cinder 2024 value proof");
    hasher.update(&commitment.0);
    hasher.update(&value.to_le_bytes());
    Hash256(hasher.finalize().into())
}

/// Create an output commitment and its public value proof.
pub fn create_output(blind: &Scalar, value: Amount) -> (Commitment, ValueProof) {
    let commitment = commit(blind, value);
    let signature = sign(blind, &value_proof_msg(&commitment, value));
    (commitment, ValueProof { value, signature })
}

/// Check that `proof` opens `commitment` to its revealed value.
pub fn verify_value_proof(commitment: &Commitment, proof: &ValueProof) -> bool {
    let Some(c) = decompress(commitment) else {
        return false;
    };
    let blind_part = c - value_point(u128::from(proof.value));
    verify(&blind_part, &value_proof_msg(commitment, proof.value), &proof.signature)
}

/// Build and sign a kernel whose excess is `key·G`.
pub fn create_kernel(key: &Scalar, fee: Amount, height: HeightRange) -> TxKernel {
    let mut kernel = TxKernel {
        excess: public_excess(key),
        fee,
        height,
        signature: Signature::default(),
    };
    kernel.signature = sign(key, &kernel.signing_hash());
    kernel
}

/// Check a kernel signature against its excess.
pub fn verify_kernel(kernel: &TxKernel) -> bool {
    match decompress(&kernel.excess) {
        Some(p) => verify(&p, &kernel.signing_hash(), &kernel.signature),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Purpose of a derived miner key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Comission,
    Coinbase,
    Kernel,
}

impl KeyType {
    fn tag(self) -> u8 {
        match self {
            KeyType::Comission => 1,
            KeyType::Coinbase => 2,
            KeyType::Kernel => 3,
        }
    }
}

/// Deterministic key derivation from a 32-byte seed.
#[derive(Clone)]
pub struct Kdf {
    seed: [u8; 32],
}

impl Kdf {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    /// Fresh seed from the OS RNG.
    pub fn random() -> Self {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self { seed }
    }

    /// Key for `(height, kind)`.
    pub fn derive(&self, height: u64, kind: KeyType) -> Scalar {
        Scalar::from_bytes_mod_order_wide(&wide_hash(
            "cinder 2024 kdf",
            &[&self.seed, &height.to_le_bytes(), &[kind.tag()]],
        ))
    }

    /// Key for an arbitrary index. Used by tests and tools to mint wallets.
    pub fn derive_index(&self, index: u64) -> Scalar {
        Scalar::from_bytes_mod_order_wide(&wide_hash(
            "cinder 2024 kdf index",
            &[&self.seed, &index.to_le_bytes()],
        ))
    }
}

impl std::fmt::Debug for Kdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kdf").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u64) -> Scalar {
        Kdf::from_seed([7; 32]).derive_index(i)
    }

    // --- Commitments ---

    #[test]
    fn commitments_are_homomorphic() {
        let (a, b) = (key(1), key(2));
        let ca = decompress(&commit(&a, 5)).unwrap();
        let cb = decompress(&commit(&b, 7)).unwrap();
        let sum = commit(&(a + b), 12);
        assert_eq!((ca + cb).compress().to_bytes(), sum.0);
    }

    #[test]
    fn commitment_hides_value_with_blind() {
        assert_ne!(commit(&key(1), 5), commit(&key(2), 5));
        assert_ne!(commit(&key(1), 5), commit(&key(1), 6));
    }

    #[test]
    fn invalid_point_does_not_decompress() {
        assert!(decompress(&Commitment([0xff; 32])).is_none());
    }

    // --- Signatures ---

    #[test]
    fn sign_verify_roundtrip() {
        let k = key(3);
        let msg = Hash256([9; 32]);
        let sig = sign(&k, &msg);
        assert!(verify(&(RISTRETTO_BASEPOINT_POINT * k), &msg, &sig));
        assert!(!verify(&(RISTRETTO_BASEPOINT_POINT * key(4)), &msg, &sig));
        assert!(!verify(&(RISTRETTO_BASEPOINT_POINT * k), &Hash256([8; 32]), &sig));
    }

    #[test]
    fn value_proof_rejects_wrong_value() {
        let (c, mut proof) = create_output(&key(5), 100);
        assert!(verify_value_proof(&c, &proof));
        proof.value = 101;
        assert!(!verify_value_proof(&c, &proof));
    }

    #[test]
    fn kernel_signature_covers_fee() {
        let mut k = create_kernel(&key(6), 10, HeightRange::UNBOUNDED);
        assert!(verify_kernel(&k));
        k.fee = 11;
        assert!(!verify_kernel(&k));
    }

    // --- Offsets ---

    #[test]
    fn offsets_add_and_subtract() {
        let a = offset_from_scalar(&key(1));
        let b = offset_from_scalar(&key(2));
        let sum = add_offsets(&a, &b).unwrap();
        assert_eq!(sub_offsets(&sum, &b).unwrap(), a);
        assert_eq!(add_offsets(&Offset::ZERO, &a).unwrap(), a);
    }

    #[test]
    fn non_canonical_offset_rejected() {
        assert!(scalar_from_offset(&Offset([0xff; 32])).is_none());
    }

    // --- Kdf ---

    #[test]
    fn kdf_separates_key_types() {
        let kdf = Kdf::from_seed([1; 32]);
        assert_ne!(kdf.derive(5, KeyType::Coinbase), kdf.derive(5, KeyType::Comission));
        assert_ne!(kdf.derive(5, KeyType::Kernel), kdf.derive(6, KeyType::Kernel));
        assert_eq!(kdf.derive(5, KeyType::Kernel), kdf.derive(5, KeyType::Kernel));
    }
}
