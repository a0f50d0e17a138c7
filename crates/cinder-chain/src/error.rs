//! Error types for the chain database and processor.
use cinder_core::error::{PoolError, TxError};
use cinder_core::mmr::MmrError;
use thiserror::Error;

/// Failures that abort a chain operation.
///
/// `Corrupted` means an internal invariant no longer holds; the processor
/// that observes it refuses further work and answers `Poisoned`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("storage error: {0}")] Storage(String),
    #[error("chain data corrupted: {0}")] Corrupted(String),
    #[error("schema version {found}, expected {expected}")] SchemaMismatch { found: u64, expected: u64 },
    #[error("codec: {0}")] Codec(String),
    #[error("config: {0}")] Config(String),
    #[error("processor poisoned by an earlier corruption")] Poisoned,
    #[error("transaction rejected: {0}")] Tx(#[from] TxError),
    #[error("transaction does not apply to the current state")] TxContext,
    #[error("pool: {0}")] Pool(#[from] PoolError),
}

impl From<MmrError> for ChainError {
    fn from(e: MmrError) -> Self {
        ChainError::Corrupted(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for ChainError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ChainError::Codec(e.to_string())
    }
}

/// Outcome of handing untrusted data to the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Accepted,
    /// Benign: duplicate, stale or not yet relevant.
    Rejected,
    /// Provably bad; the supplying peer should be penalized.
    Invalid,
}
