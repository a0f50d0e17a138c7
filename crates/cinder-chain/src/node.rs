//! Node composition and event loop.
//!
//! [`Node`] wraps a [`ChainProcessor`] and a [`TxPool`] behind mutexes and
//! feeds them from a channel of [`ChainEvent`]s. Everything the processor
//! wants from the outside world leaves through a second channel as
//! [`ChainRequest`]s, so a transport can sit on either end without the
//! chain code knowing about it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cinder_core::crypto::Kdf;
use cinder_core::difficulty;
use cinder_core::rules::Rules;
use cinder_core::txpool::TxPool;
use cinder_core::types::{encode, BlockBody, Hash256, HeightRange, PeerId, StateId, SystemState, Transaction};

use crate::collaborator::Collaborator;
use crate::config::NodeConfig;
use crate::error::{ChainError, DataStatus};
use crate::processor::{ChainProcessor, Cursor};
use crate::storage::ChainDb;
use crate::verifier::Verifier;

/// Nonces tried per mining attempt.
pub const MINE_ATTEMPTS: u64 = 1 << 24;

/// Input to the node's event loop.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Header {
        state: SystemState,
        peer: Option<PeerId>,
    },
    Block {
        id: StateId,
        body: Vec<u8>,
        peer: Option<PeerId>,
    },
    Transaction(Transaction),
    /// Assemble, solve and submit a block.
    Mine,
    /// Ask for whatever blocks the best unreachable tips.
    RequestMissing,
}

/// Output of the chain processor towards the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainRequest {
    Data {
        id: StateId,
        want_body: bool,
        peer: Option<PeerId>,
    },
    Misbehaved(PeerId),
    NewState,
    RolledBack,
}

/// Collaborator that forwards every request into a channel.
pub struct ChannelCollaborator {
    requests: mpsc::UnboundedSender<ChainRequest>,
    verifier: Verifier,
}

impl ChannelCollaborator {
    pub fn new(requests: mpsc::UnboundedSender<ChainRequest>, verifier: Verifier) -> Self {
        Self { requests, verifier }
    }

    fn send(&self, request: ChainRequest) {
        if self.requests.send(request).is_err() {
            debug!("request channel closed");
        }
    }
}

impl Collaborator for ChannelCollaborator {
    fn request_data(&self, id: StateId, want_body: bool, peer: Option<PeerId>) {
        self.send(ChainRequest::Data { id, want_body, peer });
    }

    fn on_peer_misbehaved(&self, peer: PeerId) {
        self.send(ChainRequest::Misbehaved(peer));
    }

    fn on_new_state(&self) {
        self.send(ChainRequest::NewState);
    }

    fn on_rolled_back(&self) {
        self.send(ChainRequest::RolledBack);
    }

    fn verify_block(&self, body: &BlockBody, range: HeightRange, subsidy_open: bool, rules: &Rules) -> bool {
        match self.verifier.verify(body, range, subsidy_open, rules) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, min = range.min, max = range.max, "block verification failed");
                false
            }
        }
    }
}

/// A chain node: processor, pool and miner keys.
pub struct Node {
    processor: Mutex<ChainProcessor<ChannelCollaborator>>,
    pool: Mutex<TxPool>,
    kdf: Kdf,
    config: NodeConfig,
    event_tx: mpsc::UnboundedSender<ChainEvent>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChainEvent>>,
}

impl Node {
    /// Open the database under `config.data_dir` and bring the processor
    /// up. Returns the node and the receiving end of its requests.
    pub fn new(
        config: NodeConfig,
        kdf: Kdf,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ChainRequest>), ChainError> {
        config.validate()?;
        let db = ChainDb::open(config.db_path())?;
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let collab = ChannelCollaborator::new(request_tx, Verifier::new(config.verifier_threads));
        let processor = ChainProcessor::new(db, collab, config.rules.clone(), config.horizon)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        info!(cursor = %processor.cursor().id, data_dir = %config.data_dir.display(), "node opened");
        let node = Arc::new(Self {
            processor: Mutex::new(processor),
            pool: Mutex::new(TxPool::new()),
            kdf,
            config,
            event_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
        });
        Ok((node, request_rx))
    }

    /// Sender for feeding the event loop.
    pub fn events(&self) -> mpsc::UnboundedSender<ChainEvent> {
        self.event_tx.clone()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cursor(&self) -> Cursor {
        self.processor.lock().cursor().clone()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Run `f` with exclusive access to the processor.
    pub fn with_processor<R>(&self, f: impl FnOnce(&mut ChainProcessor<ChannelCollaborator>) -> R) -> R {
        f(&mut self.processor.lock())
    }

    pub fn process_header(&self, state: &SystemState, peer: Option<PeerId>) -> Result<DataStatus, ChainError> {
        let mut processor = self.processor.lock();
        let status = processor.on_state(state, peer)?;
        if let (DataStatus::Invalid, Some(peer)) = (status, peer) {
            processor.collaborator().on_peer_misbehaved(peer);
        }
        Ok(status)
    }

    pub fn process_block(&self, id: &StateId, body: Vec<u8>, peer: Option<PeerId>) -> Result<DataStatus, ChainError> {
        let mut processor = self.processor.lock();
        let before = processor.cursor().id;
        let status = processor.on_block(id, body, peer)?;
        if let (DataStatus::Invalid, Some(peer)) = (status, peer) {
            processor.collaborator().on_peer_misbehaved(peer);
        }
        if processor.cursor().id != before {
            self.refresh_pool(processor.cursor().id.height + 1);
        }
        Ok(status)
    }

    /// Validate `tx` against the cursor and admit it to the pool.
    pub fn process_transaction(&self, tx: &Transaction) -> Result<Hash256, ChainError> {
        let mut processor = self.processor.lock();
        let ctx = processor.validate_tx(tx)?;
        if !processor.validate_tx_context(tx)? {
            return Err(ChainError::TxContext);
        }
        let key = tx.key()?;
        self.pool.lock().admit(tx.clone(), ctx, key)?;
        debug!(%key, fee = ctx.fee, "added transaction to pool");
        Ok(key)
    }

    /// Assemble a block from the pool, solve it and submit it. Returns the
    /// new cursor if the block became active.
    pub fn mine_block(&self, max_attempts: u64) -> Result<Option<StateId>, ChainError> {
        let mut processor = self.processor.lock();
        let template = {
            let mut pool = self.pool.lock();
            processor.generate_new_block(&mut pool, &self.kdf)?
        };
        let Some(mut template) = template else {
            return Ok(None);
        };
        if !difficulty::solve(&mut template.state, processor.rules(), max_attempts) {
            debug!(height = template.state.height, "no solution found");
            return Ok(None);
        }
        let id = template.state.id();
        let body = encode(&template.body)?;
        processor.on_state(&template.state, None)?;
        processor.on_block(&id, body, None)?;
        if processor.cursor().id != id {
            warn!(%id, "mined block did not become active");
            return Ok(None);
        }

        let reward = u64::try_from(template.body.subsidy.saturating_add(template.fees)).unwrap_or(u64::MAX);
        processor.record_mined(&id, reward)?;
        self.refresh_pool(id.height + 1);
        info!(%id, reward, "mined block");
        Ok(Some(id))
    }

    fn refresh_pool(&self, next_height: u64) {
        let mut pool = self.pool.lock();
        let expired = pool.evict_expired(next_height);
        let shrunk = pool.shrink_to(self.config.max_pool_txs);
        if expired + shrunk > 0 {
            debug!(expired, shrunk, remaining = pool.len(), "pool trimmed");
        }
    }

    fn handle_event(&self, event: ChainEvent) {
        match event {
            ChainEvent::Header { state, peer } => {
                if let Err(e) = self.process_header(&state, peer) {
                    warn!(error = %e, "header processing failed");
                }
            }
            ChainEvent::Block { id, body, peer } => {
                if let Err(e) = self.process_block(&id, body, peer) {
                    warn!(%id, error = %e, "block processing failed");
                }
            }
            ChainEvent::Transaction(tx) => {
                if let Err(e) = self.process_transaction(&tx) {
                    debug!("rejected transaction: {e}");
                }
            }
            ChainEvent::Mine => {
                if let Err(e) = self.mine_block(MINE_ATTEMPTS) {
                    warn!(error = %e, "mining failed");
                }
            }
            ChainEvent::RequestMissing => {
                if let Err(e) = self.processor.lock().enum_congestions() {
                    warn!(error = %e, "enumerating congestions failed");
                }
            }
        }
    }

    /// Drain events until every sender, including the node's own, is gone.
    pub async fn run(self: &Arc<Self>) {
        let mut rx = self.event_rx.lock().await;
        while let Some(event) = rx.recv().await {
            self.handle_event(event);
        }
        info!("event channel closed, shutting down");
    }
}
