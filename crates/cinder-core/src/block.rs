//! Body algebra and context-free validation.
//!
//! - **Algebra**: merging bodies, squashing a newer body into an older one
//!   and dropping outputs spent inside the same body. Macroblock export and
//!   block assembly are built on these.
//! - **Validation** ([`check_transaction`], [`verify_body`]): sortedness,
//!   value proofs, kernel signatures, kernel height windows, subsidy limits
//!   and the balance law. Nothing here looks at the UTXO set.
//!
//! Validation is split into [`summarize_part`] and a final balance step so
//! the per-element work can be fanned out across threads and the partial
//! sums merged afterwards.

use std::collections::BTreeMap;

use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;

use crate::crypto;
use crate::error::{BlockError, TxError};
use crate::rules::Rules;
use crate::types::{
    encode, Amount, AmountBig, BlockBody, Commitment, HeightRange, Input, Output, Transaction,
    TxKernel, TxVectors,
};

/// Result of a successful context-free transaction check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxContext {
    /// Net fee (kernel outputs minus kernel inputs).
    pub fee: AmountBig,
    /// Heights at which every kernel is valid.
    pub height: HeightRange,
}

/// Partial sums of a validated element subset.
#[derive(Debug, Clone, Copy)]
pub struct Summary {
    /// `ΣC_out − ΣC_in − ΣE_out + ΣE_in`.
    pub sigma: RistrettoPoint,
    pub fee_out: AmountBig,
    pub fee_in: AmountBig,
    /// Total public value of coinbase outputs.
    pub coinbase: AmountBig,
    /// Intersection of all kernel height windows.
    pub height: HeightRange,
}

impl Default for Summary {
    fn default() -> Self {
        Self {
            sigma: crypto::identity(),
            fee_out: 0,
            fee_in: 0,
            coinbase: 0,
            height: HeightRange::UNBOUNDED,
        }
    }
}

impl Summary {
    pub fn merge(&mut self, other: &Summary) -> Result<(), TxError> {
        self.sigma += other.sigma;
        self.fee_out = self.fee_out.checked_add(other.fee_out).ok_or(TxError::FeeOverflow)?;
        self.fee_in = self.fee_in.checked_add(other.fee_in).ok_or(TxError::FeeOverflow)?;
        self.coinbase = self.coinbase.checked_add(other.coinbase).ok_or(TxError::FeeOverflow)?;
        self.height = self.height.intersect(&other.height);
        Ok(())
    }
}

fn point(c: &Commitment, err: TxError) -> Result<RistrettoPoint, TxError> {
    crypto::decompress(c).ok_or(err)
}

fn check_kernel(
    kernel: &TxKernel,
    index: usize,
    window: &HeightRange,
) -> Result<RistrettoPoint, TxError> {
    if kernel.height.is_empty() {
        return Err(TxError::EmptyHeightWindow);
    }
    if !kernel.height.intersects(window) {
        return Err(TxError::OutsideHeightWindow {
            height: window.min,
            min: kernel.height.min,
            max: kernel.height.max,
        });
    }
    let excess = point(&kernel.excess, TxError::InvalidKernelExcess(index))?;
    if !crypto::verify_kernel(kernel) {
        return Err(TxError::InvalidKernelSignature(index));
    }
    Ok(excess)
}

/// Validate the elements whose index is `part` modulo `parts` and return
/// their partial sums. Every kernel window must intersect `window`.
pub fn summarize_part(
    v: &TxVectors,
    window: &HeightRange,
    part: usize,
    parts: usize,
) -> Result<Summary, TxError> {
    let mut s = Summary::default();
    let parts = parts.max(1);
    let mine = |i: &usize| i % parts == part;

    for (i, input) in v.inputs.iter().enumerate().filter(|(i, _)| mine(i)) {
        s.sigma -= point(&input.commitment, TxError::InvalidCommitment(i))?;
    }
    for (i, output) in v.outputs.iter().enumerate().filter(|(i, _)| mine(i)) {
        s.sigma += point(&output.commitment, TxError::InvalidCommitment(i))?;
        if !crypto::verify_value_proof(&output.commitment, &output.proof) {
            return Err(TxError::InvalidProof(i));
        }
        if output.coinbase {
            s.coinbase += AmountBig::from(output.proof.value);
        }
    }
    for (i, kernel) in v.kernels_out.iter().enumerate().filter(|(i, _)| mine(i)) {
        s.sigma -= check_kernel(kernel, i, window)?;
        s.fee_out += AmountBig::from(kernel.fee);
        s.height = s.height.intersect(&kernel.height);
    }
    let base = v.kernels_out.len();
    for (i, kernel) in v.kernels_in.iter().enumerate().filter(|(i, _)| mine(i)) {
        s.sigma += check_kernel(kernel, base + i, window)?;
        s.fee_in += AmountBig::from(kernel.fee);
    }
    Ok(s)
}

/// Context-free transaction validation.
pub fn check_transaction(tx: &Transaction) -> Result<TxContext, TxError> {
    if !tx.elements.is_sorted() {
        return Err(TxError::NotSorted);
    }
    if tx.elements.outputs.iter().any(|o| o.coinbase) {
        return Err(TxError::UnexpectedCoinbase);
    }
    let s = summarize_part(&tx.elements, &HeightRange::UNBOUNDED, 0, 1)?;
    if s.height.is_empty() {
        return Err(TxError::EmptyHeightWindow);
    }
    let offset = crypto::offset_point(&tx.offset).ok_or(TxError::InvalidOffset)?;

    // ΣC_out − ΣC_in − ΣE + (fee_out − fee_in)·H − offset·G == 0
    let mut sigma = s.sigma - offset;
    if s.fee_out >= s.fee_in {
        sigma += crypto::value_point(s.fee_out - s.fee_in);
    } else {
        sigma -= crypto::value_point(s.fee_in - s.fee_out);
    }
    if sigma != crypto::identity() {
        return Err(TxError::Unbalanced);
    }
    Ok(TxContext {
        fee: s.fee_out.saturating_sub(s.fee_in),
        height: s.height,
    })
}

/// Block-level checks on merged partial sums.
pub fn finalize_body(
    s: &Summary,
    body: &BlockBody,
    range: HeightRange,
    subsidy_open: bool,
    rules: &Rules,
) -> Result<(), BlockError> {
    if s.coinbase > body.subsidy {
        return Err(BlockError::CoinbaseExceedsSubsidy {
            coinbase: s.coinbase,
            subsidy: body.subsidy,
        });
    }
    if !subsidy_open {
        if body.subsidy_closing {
            return Err(BlockError::IllegalSubsidyClose);
        }
        let limit = rules.emission_for(range.len());
        if body.subsidy > limit {
            return Err(BlockError::ExcessiveSubsidy {
                subsidy: body.subsidy,
                limit,
            });
        }
    }
    let offset = crypto::offset_point(&body.offset).ok_or(TxError::InvalidOffset)?;
    let sigma = s.sigma - offset - crypto::value_point(body.subsidy);
    if sigma != crypto::identity() {
        return Err(TxError::Unbalanced.into());
    }
    Ok(())
}

/// Single-threaded context-free body validation over heights `range`.
pub fn verify_body(
    body: &BlockBody,
    range: HeightRange,
    subsidy_open: bool,
    rules: &Rules,
) -> Result<(), BlockError> {
    if !body.elements.is_sorted() {
        return Err(TxError::NotSorted.into());
    }
    let s = summarize_part(&body.elements, &range, 0, 1)?;
    finalize_body(&s, body, range, subsidy_open, rules)
}

/// Serialized size of a body.
pub fn body_size(body: &BlockBody) -> Result<usize, TxError> {
    encode(body)
        .map(|b| b.len())
        .map_err(|e| TxError::Codec(e.to_string()))
}

// ---------------------------------------------------------------------------
// Algebra
// ---------------------------------------------------------------------------

/// Append `other` into `into`, adding subsidy and offsets. Unsorted result.
pub fn merge(into: &mut BlockBody, other: &BlockBody) -> Result<(), TxError> {
    into.offset = crypto::add_offsets(&into.offset, &other.offset).ok_or(TxError::InvalidOffset)?;
    into.subsidy = into.subsidy.checked_add(other.subsidy).ok_or(TxError::FeeOverflow)?;
    into.subsidy_closing |= other.subsidy_closing;
    into.elements.append(&other.elements);
    Ok(())
}

/// Squash `newer` onto `older`: newer inputs consume older outputs with the
/// same commitment and maturity, newer kernel inputs consume identical older
/// kernel outputs. The result is sorted.
pub fn squash(older: &mut BlockBody, mut newer: BlockBody) -> Result<(), TxError> {
    let mut outputs: BTreeMap<(Commitment, u64), Vec<usize>> = BTreeMap::new();
    for (i, o) in older.elements.outputs.iter().enumerate() {
        outputs.entry((o.commitment, o.maturity)).or_default().push(i);
    }
    let mut dropped_out = vec![false; older.elements.outputs.len()];
    newer.elements.inputs.retain(|input| {
        match outputs
            .get_mut(&(input.commitment, input.maturity))
            .and_then(|v| v.pop())
        {
            Some(i) => {
                dropped_out[i] = true;
                false
            }
            None => true,
        }
    });
    let mut flags = dropped_out.into_iter();
    older
        .elements
        .outputs
        .retain(|_| !flags.next().unwrap_or(false));

    let mut kernels: BTreeMap<TxKernel, usize> = BTreeMap::new();
    for k in &older.elements.kernels_out {
        *kernels.entry(k.clone()).or_default() += 1;
    }
    let mut cancelled: Vec<TxKernel> = Vec::new();
    newer.elements.kernels_in.retain(|k| match kernels.get_mut(k) {
        Some(n) if *n > 0 => {
            *n -= 1;
            cancelled.push(k.clone());
            false
        }
        _ => true,
    });
    for k in cancelled {
        if let Some(pos) = older.elements.kernels_out.iter().position(|x| *x == k) {
            older.elements.kernels_out.remove(pos);
        }
    }

    merge(older, &newer)?;
    older.elements.sort();
    Ok(())
}

/// Remove input/output pairs where the body spends an output it creates.
/// Expects sorted vectors and keeps them sorted.
pub fn delete_intermediate_outputs(v: &mut TxVectors) {
    let mut created: BTreeMap<(Commitment, u64), usize> = BTreeMap::new();
    for o in &v.outputs {
        *created.entry((o.commitment, o.maturity)).or_default() += 1;
    }
    let mut spent: BTreeMap<(Commitment, u64), usize> = BTreeMap::new();
    v.inputs.retain(|i| match created.get_mut(&(i.commitment, i.maturity)) {
        Some(n) if *n > 0 => {
            *n -= 1;
            *spent.entry((i.commitment, i.maturity)).or_default() += 1;
            false
        }
        _ => true,
    });
    v.outputs.retain(|o| match spent.get_mut(&(o.commitment, o.maturity)) {
        Some(n) if *n > 0 => {
            *n -= 1;
            false
        }
        _ => true,
    });
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build a balanced, sorted transaction.
///
/// `inputs` and `outputs` are `(blinding key, value)` pairs; values must
/// satisfy `Σin = Σout + fee`. The offset absorbs every key except the
/// kernel's.
pub fn build_transaction(
    inputs: &[(Scalar, Amount)],
    outputs: &[(Scalar, Amount)],
    kernel_key: &Scalar,
    fee: Amount,
    height: HeightRange,
) -> Transaction {
    let mut elements = TxVectors::default();
    let mut offset = -kernel_key;
    for (k, v) in inputs {
        elements.inputs.push(Input::new(crypto::commit(k, *v)));
        offset -= k;
    }
    for (k, v) in outputs {
        let (commitment, proof) = crypto::create_output(k, *v);
        elements.outputs.push(Output {
            commitment,
            maturity: 0,
            coinbase: false,
            incubation: 0,
            proof,
        });
        offset += k;
    }
    elements.kernels_out.push(crypto::create_kernel(kernel_key, fee, height));
    elements.sort();
    Transaction {
        elements,
        offset: crypto::offset_from_scalar(&offset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Kdf;

    fn key(i: u64) -> Scalar {
        Kdf::from_seed([3; 32]).derive_index(i)
    }

    fn coinbase_body(k: &Scalar, value: Amount) -> BlockBody {
        let (commitment, proof) = crypto::create_output(k, value);
        let mut body = BlockBody {
            subsidy: u128::from(value),
            subsidy_closing: false,
            offset: crypto::offset_from_scalar(&(k - key(99))),
            elements: TxVectors::default(),
        };
        body.elements.outputs.push(Output {
            commitment,
            maturity: 0,
            coinbase: true,
            incubation: 0,
            proof,
        });
        body.elements
            .kernels_out
            .push(crypto::create_kernel(&key(99), 0, HeightRange::UNBOUNDED));
        body
    }

    // --- Transactions ---

    #[test]
    fn balanced_transaction_passes() {
        let tx = build_transaction(
            &[(key(1), 100)],
            &[(key(2), 60), (key(3), 30)],
            &key(4),
            10,
            HeightRange::new(5, 50),
        );
        let ctx = check_transaction(&tx).unwrap();
        assert_eq!(ctx.fee, 10);
        assert_eq!(ctx.height, HeightRange::new(5, 50));
    }

    #[test]
    fn unbalanced_transaction_fails() {
        let tx = build_transaction(&[(key(1), 100)], &[(key(2), 95)], &key(4), 10, HeightRange::UNBOUNDED);
        assert_eq!(check_transaction(&tx), Err(TxError::Unbalanced));
    }

    #[test]
    fn unsorted_transaction_fails() {
        let mut tx = build_transaction(
            &[(key(1), 100)],
            &[(key(2), 60), (key(3), 30)],
            &key(4),
            10,
            HeightRange::UNBOUNDED,
        );
        tx.elements.outputs.reverse();
        assert_eq!(check_transaction(&tx), Err(TxError::NotSorted));
    }

    #[test]
    fn tampered_kernel_fee_fails() {
        let mut tx = build_transaction(&[(key(1), 100)], &[(key(2), 90)], &key(4), 10, HeightRange::UNBOUNDED);
        tx.elements.kernels_out[0].fee = 9;
        assert_eq!(check_transaction(&tx), Err(TxError::InvalidKernelSignature(0)));
    }

    #[test]
    fn coinbase_output_in_transaction_fails() {
        let mut tx = build_transaction(&[(key(1), 100)], &[(key(2), 90)], &key(4), 10, HeightRange::UNBOUNDED);
        tx.elements.outputs[0].coinbase = true;
        assert_eq!(check_transaction(&tx), Err(TxError::UnexpectedCoinbase));
    }

    // --- Bodies ---

    #[test]
    fn coinbase_body_verifies() {
        let body = coinbase_body(&key(7), 40);
        verify_body(&body, HeightRange::single(3), false, &Rules::default()).unwrap();
    }

    #[test]
    fn coinbase_above_subsidy_fails() {
        let mut body = coinbase_body(&key(7), 40);
        body.subsidy = 39;
        assert!(matches!(
            verify_body(&body, HeightRange::single(3), true, &Rules::default()),
            Err(BlockError::CoinbaseExceedsSubsidy { .. })
        ));
    }

    #[test]
    fn closing_flag_illegal_once_closed() {
        let mut body = coinbase_body(&key(7), 40);
        body.subsidy_closing = true;
        assert_eq!(
            verify_body(&body, HeightRange::single(3), false, &Rules::default()),
            Err(BlockError::IllegalSubsidyClose)
        );
        verify_body(&body, HeightRange::single(3), true, &Rules::default()).unwrap();
    }

    #[test]
    fn excessive_subsidy_when_closed() {
        let rules = Rules { coinbase_emission: 10, ..Rules::default() };
        let body = coinbase_body(&key(7), 40);
        assert!(matches!(
            verify_body(&body, HeightRange::single(3), false, &rules),
            Err(BlockError::ExcessiveSubsidy { subsidy: 40, limit: 10 })
        ));
        verify_body(&body, HeightRange::new(1, 4), false, &rules).unwrap();
    }

    #[test]
    fn kernel_outside_range_fails() {
        let mut body = coinbase_body(&key(7), 40);
        body.elements.kernels_out[0] = crypto::create_kernel(&key(99), 0, HeightRange::new(10, 20));
        assert!(matches!(
            verify_body(&body, HeightRange::single(3), false, &Rules::default()),
            Err(BlockError::Tx(TxError::OutsideHeightWindow { .. }))
        ));
    }

    #[test]
    fn split_summaries_equal_whole() {
        let tx = build_transaction(
            &[(key(1), 100), (key(5), 7)],
            &[(key(2), 60), (key(3), 30), (key(6), 7)],
            &key(4),
            10,
            HeightRange::UNBOUNDED,
        );
        let whole = summarize_part(&tx.elements, &HeightRange::UNBOUNDED, 0, 1).unwrap();
        let mut merged = Summary::default();
        for part in 0..3 {
            let s = summarize_part(&tx.elements, &HeightRange::UNBOUNDED, part, 3).unwrap();
            merged.merge(&s).unwrap();
        }
        assert_eq!(merged.sigma, whole.sigma);
        assert_eq!(merged.fee_out, whole.fee_out);
    }

    // --- Algebra ---

    #[test]
    fn merged_bodies_stay_balanced() {
        let mut a = coinbase_body(&key(7), 40);
        let b = coinbase_body(&key(8), 40);
        merge(&mut a, &b).unwrap();
        a.elements.sort();
        verify_body(&a, HeightRange::new(1, 2), false, &Rules::default()).unwrap();
    }

    #[test]
    fn squash_cancels_spent_output() {
        let older = coinbase_body(&key(7), 40);
        let spent = older.elements.outputs[0].clone();
        let tx = build_transaction(&[(key(7), 40)], &[(key(9), 40)], &key(10), 0, HeightRange::UNBOUNDED);
        let newer = BlockBody {
            subsidy: 0,
            subsidy_closing: false,
            offset: tx.offset,
            elements: tx.elements,
        };
        let mut body = older.clone();
        squash(&mut body, newer).unwrap();
        assert!(body.elements.inputs.is_empty());
        assert!(!body.elements.outputs.contains(&spent));
        assert_eq!(body.elements.outputs.len(), 1);
        verify_body(&body, HeightRange::new(1, 2), false, &Rules::default()).unwrap();
    }

    #[test]
    fn squash_keeps_older_input_against_newer_output() {
        let c = crypto::commit(&key(1), 5);
        let mut older = BlockBody::default();
        older.elements.inputs.push(Input { commitment: c, maturity: 4 });
        let mut newer = BlockBody::default();
        let (_, proof) = crypto::create_output(&key(1), 5);
        newer.elements.outputs.push(Output { commitment: c, maturity: 4, coinbase: false, incubation: 0, proof });
        squash(&mut older, newer).unwrap();
        assert_eq!(older.elements.inputs.len(), 1);
        assert_eq!(older.elements.outputs.len(), 1);
    }

    #[test]
    fn squash_requires_matching_maturity() {
        let c = crypto::commit(&key(1), 5);
        let (_, proof) = crypto::create_output(&key(1), 5);
        let mut older = BlockBody::default();
        older.elements.outputs.push(Output { commitment: c, maturity: 4, coinbase: false, incubation: 0, proof });
        let mut newer = BlockBody::default();
        newer.elements.inputs.push(Input { commitment: c, maturity: 5 });
        squash(&mut older, newer).unwrap();
        assert_eq!(older.elements.inputs.len(), 1);
        assert_eq!(older.elements.outputs.len(), 1);
    }

    #[test]
    fn intermediate_outputs_removed() {
        let c = crypto::commit(&key(1), 5);
        let (_, proof) = crypto::create_output(&key(1), 5);
        let mut v = TxVectors::default();
        v.inputs.push(Input::new(c));
        v.outputs.push(Output { commitment: c, maturity: 0, coinbase: false, incubation: 0, proof: proof.clone() });
        v.outputs.push(Output { commitment: crypto::commit(&key(2), 5), maturity: 0, coinbase: false, incubation: 0, proof });
        v.sort();
        delete_intermediate_outputs(&mut v);
        assert!(v.inputs.is_empty());
        assert_eq!(v.outputs.len(), 1);
        assert!(v.is_sorted());
    }
}
