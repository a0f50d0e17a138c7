//! # cinder-chain: Chain database, processor and node.
//!
//! Everything that touches disk or reorders the chain:
//! - [`storage::ChainDb`]: RocksDB-backed header tree, bodies and spendables
//! - [`processor::ChainProcessor`]: climbs, rolls back and prunes the active chain
//! - [`verifier::Verifier`]: parallel context-free body verification
//! - [`node::Node`]: event loop around a processor and a transaction pool
//! - [`config::NodeConfig`]: node configuration

pub mod collaborator;
pub mod config;
pub mod error;
pub mod node;
pub mod processor;
pub mod storage;
pub mod verifier;

pub use collaborator::{Collaborator, Offline};
pub use config::{Horizon, NodeConfig};
pub use error::{ChainError, DataStatus};
pub use node::{ChainEvent, ChainRequest, Node};
pub use processor::{BlockTemplate, ChainProcessor, Cursor};
pub use storage::ChainDb;
pub use verifier::Verifier;
