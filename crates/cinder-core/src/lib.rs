//! # cinder-core
//! Protocol types, commitment primitives, commitment trees, the history MMR,
//! body validation and the transaction pool. No I/O.

pub mod block;
pub mod crypto;
pub mod difficulty;
pub mod error;
pub mod merkle;
pub mod mmr;
pub mod rules;
pub mod tree;
pub mod txpool;
pub mod types;
