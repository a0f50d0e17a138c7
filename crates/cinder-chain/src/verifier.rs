//! Parallel context-free block verification.
//!
//! The body's elements are cut into interleaved parts. Worker threads pull
//! part indices from a shared counter, validate them with
//! [`summarize_part`] and fold the partial sums into a shared summary. The
//! first failure raises a flag that stops workers from taking new parts;
//! every worker still checks out through the condition variable before the
//! balance is finalized.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use cinder_core::block::{finalize_body, summarize_part, verify_body, Summary};
use cinder_core::error::{BlockError, TxError};
use cinder_core::rules::Rules;
use cinder_core::types::{BlockBody, HeightRange};

/// Parts handed out per worker thread.
const PARTS_PER_THREAD: usize = 4;

/// Bodies with fewer elements are verified on the calling thread.
const MIN_PARALLEL_ELEMENTS: usize = 32;

struct Progress {
    running: usize,
    summary: Summary,
    error: Option<TxError>,
}

/// Block verifier with a fixed worker count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier {
    /// Worker threads; `0` uses the available parallelism.
    pub threads: usize,
}

impl Verifier {
    pub fn new(threads: usize) -> Self {
        Self { threads }
    }

    fn worker_count(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }

    /// Verify `body` as the content of heights `range`.
    pub fn verify(
        &self,
        body: &BlockBody,
        range: HeightRange,
        subsidy_open: bool,
        rules: &Rules,
    ) -> Result<(), BlockError> {
        let v = &body.elements;
        let elements = v.inputs.len() + v.outputs.len() + v.kernels_in.len() + v.kernels_out.len();
        let workers = self.worker_count();
        if workers <= 1 || elements < MIN_PARALLEL_ELEMENTS {
            return verify_body(body, range, subsidy_open, rules);
        }
        if !v.is_sorted() {
            return Err(TxError::NotSorted.into());
        }

        let parts = workers * PARTS_PER_THREAD;
        let next = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let progress = Mutex::new(Progress {
            running: workers,
            summary: Summary::default(),
            error: None,
        });
        let finished = Condvar::new();

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let mut local = Summary::default();
                    let mut error = None;
                    while !failed.load(Ordering::Acquire) {
                        let part = next.fetch_add(1, Ordering::AcqRel);
                        if part >= parts {
                            break;
                        }
                        match summarize_part(v, &range, part, parts).and_then(|s| local.merge(&s)) {
                            Ok(()) => {}
                            Err(e) => {
                                failed.store(true, Ordering::Release);
                                error = Some(e);
                                break;
                            }
                        }
                    }

                    let mut p = progress.lock();
                    if error.is_none() && p.error.is_none() {
                        if let Err(e) = p.summary.merge(&local) {
                            failed.store(true, Ordering::Release);
                            error = Some(e);
                        }
                    }
                    if p.error.is_none() {
                        p.error = error;
                    }
                    p.running -= 1;
                    if p.running == 0 {
                        finished.notify_all();
                    }
                });
            }

            let mut p = progress.lock();
            while p.running > 0 {
                finished.wait(&mut p);
            }
        });

        let p = progress.into_inner();
        if let Some(e) = p.error {
            debug!(error = %e, "parallel verification failed");
            return Err(e.into());
        }
        finalize_body(&p.summary, body, range, subsidy_open, rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_core::block::{build_transaction, merge};
    use cinder_core::crypto::{self, Kdf};
    use cinder_core::types::{Output, Transaction};

    fn kdf() -> Kdf {
        Kdf::from_seed([21; 32])
    }

    fn coinbase_body(value: u64) -> BlockBody {
        let k = kdf().derive_index(1_000);
        let kernel_key = kdf().derive_index(1_001);
        let (commitment, proof) = crypto::create_output(&k, value);
        let mut body = BlockBody {
            subsidy: u128::from(value),
            subsidy_closing: false,
            offset: crypto::offset_from_scalar(&(k - kernel_key)),
            ..BlockBody::default()
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
            .push(crypto::create_kernel(&kernel_key, 0, HeightRange::UNBOUNDED));
        body
    }

    fn tx(i: u64) -> Transaction {
        let k = kdf();
        build_transaction(
            &[(k.derive_index(10 * i), 100)],
            &[(k.derive_index(10 * i + 1), 60), (k.derive_index(10 * i + 2), 40)],
            &k.derive_index(10 * i + 3),
            0,
            HeightRange::UNBOUNDED,
        )
    }

    /// A balanced body with enough elements to take the parallel path.
    fn big_body() -> BlockBody {
        let mut body = coinbase_body(50);
        for i in 0..20 {
            let t = tx(i);
            let part = BlockBody {
                offset: t.offset,
                elements: t.elements,
                ..BlockBody::default()
            };
            merge(&mut body, &part).unwrap();
        }
        body.elements.sort();
        body
    }

    #[test]
    fn parallel_accepts_valid_body() {
        let body = big_body();
        let rules = Rules::regtest();
        assert!(verify_body(&body, HeightRange::single(5), true, &rules).is_ok());
        for threads in [2, 3, 8] {
            assert!(Verifier::new(threads).verify(&body, HeightRange::single(5), true, &rules).is_ok());
        }
    }

    #[test]
    fn parallel_rejects_bad_proof() {
        let mut body = big_body();
        body.elements.outputs[7].proof.value += 1;
        let err = Verifier::new(4)
            .verify(&body, HeightRange::single(5), true, &Rules::regtest())
            .unwrap_err();
        assert!(matches!(err, BlockError::Tx(TxError::InvalidProof(_))));
    }

    #[test]
    fn parallel_rejects_imbalance() {
        let mut body = big_body();
        body.subsidy += 1;
        let err = Verifier::new(4)
            .verify(&body, HeightRange::single(5), true, &Rules::regtest())
            .unwrap_err();
        assert_eq!(err, BlockError::Tx(TxError::Unbalanced));
    }

    #[test]
    fn parallel_rejects_unsorted() {
        let mut body = big_body();
        body.elements.outputs.reverse();
        assert_eq!(
            Verifier::new(2)
                .verify(&body, HeightRange::single(5), true, &Rules::regtest())
                .unwrap_err(),
            BlockError::Tx(TxError::NotSorted)
        );
    }

    #[test]
    fn small_body_uses_inline_path() {
        let body = coinbase_body(40);
        assert!(Verifier::new(8)
            .verify(&body, HeightRange::single(2), true, &Rules::regtest())
            .is_ok());
    }
}
