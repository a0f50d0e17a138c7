//! Error types for the Cinder protocol core.
use thiserror::Error;

/// Context-free transaction failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("elements are not sorted")] NotSorted,
    #[error("invalid commitment at output {0}")] InvalidCommitment(usize),
    #[error("invalid value proof at output {0}")] InvalidProof(usize),
    #[error("invalid kernel signature at kernel {0}")] InvalidKernelSignature(usize),
    #[error("invalid kernel excess at kernel {0}")] InvalidKernelExcess(usize),
    #[error("coinbase output in a transaction")] UnexpectedCoinbase,
    #[error("empty kernel height window")] EmptyHeightWindow,
    #[error("height {height} outside kernel window [{min}, {max}]")] OutsideHeightWindow { height: u64, min: u64, max: u64 },
    #[error("commitments do not balance")] Unbalanced,
    #[error("fee overflow")] FeeOverflow,
    #[error("invalid offset scalar")] InvalidOffset,
    #[error("codec: {0}")] Codec(String),
}

/// Context-free block body failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("invalid PoW")] InvalidPoW,
    #[error("header insane: {0}")] InsaneHeader(String),
    #[error("timestamp ahead by {0}s")] TimestampAhead(u64),
    #[error("oversized body: {size} > {max}")] OversizedBody { size: usize, max: usize },
    #[error("subsidy {subsidy} exceeds emission {limit}")] ExcessiveSubsidy { subsidy: u128, limit: u128 },
    #[error("coinbase outputs {coinbase} exceed subsidy {subsidy}")] CoinbaseExceedsSubsidy { coinbase: u128, subsidy: u128 },
    #[error("illegal subsidy-close flag")] IllegalSubsidyClose,
    #[error("tx error: {0}")] Tx(#[from] TxError),
}

/// Transaction pool failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("transaction expired at height {threshold}")] Expired { threshold: u64 },
    #[error("codec: {0}")] Codec(String),
}

/// Aggregate error for callers that mix core concerns.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)] Tx(#[from] TxError),
    #[error(transparent)] Block(#[from] BlockError),
    #[error(transparent)] Pool(#[from] PoolError),
    #[error("codec: {0}")] Codec(String),
}
