//! The chain processor.
//!
//! [`ChainProcessor`] owns the chain database, the live UTXO and kernel
//! trees and the cursor. It takes headers and bodies from untrusted
//! sources, climbs to the reachable tip with the most work (rolling back
//! when a heavier fork wins), interprets blocks against the trees, prunes
//! beyond the configured horizons, assembles block templates from the pool
//! and exports or imports macroblocks.
//!
//! Each public mutation is one database step: it commits on success and
//! rolls back on error. An error after the trees were touched leaves memory
//! and disk out of step, so the processor poisons itself and refuses
//! further work.

use curve25519_dalek::scalar::Scalar;
use tracing::{debug, error, info, warn};

use cinder_core::block::{body_size, check_transaction, delete_intermediate_outputs, squash, TxContext};
use cinder_core::crypto::{self, Kdf, KeyType};
use cinder_core::difficulty;
use cinder_core::error::TxError;
use cinder_core::merkle::{node_hash, MerkleProof};
use cinder_core::rules::{Rules, HEIGHT_GENESIS};
use cinder_core::tree::{KernelTree, Lookup, UtxoKey, UtxoTree};
use cinder_core::txpool::TxPool;
use cinder_core::types::{
    encode, Amount, AmountBig, BlockBody, Hash256, HeaderElement, HeaderPrefix, Height,
    HeightRange, Input, Macroblock, Output, PeerId, PoW, StateId, SystemState, Timestamp,
    Transaction, TxKernel, TxVectors, ValueProof,
};

use crate::collaborator::Collaborator;
use crate::config::Horizon;
use crate::error::{ChainError, DataStatus};
use crate::storage::state_flags::{ACTIVE, FUNCTIONAL, REACHABLE};
use crate::storage::{ChainDb, RowId, SpendableKey};

/// Seconds since the Unix epoch.
fn now() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

fn decode_body(bytes: &[u8]) -> Result<BlockBody, bincode::error::DecodeError> {
    bincode::decode_from_slice(bytes, bincode::config::standard()).map(|(body, _)| body)
}

fn decode_stored<T: bincode::Decode<()>>(bytes: &[u8], what: &str) -> Result<T, ChainError> {
    let (value, _): (T, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ChainError::Corrupted(format!("undecodable {what}: {e}")))?;
    Ok(value)
}

fn algebra(e: TxError) -> ChainError {
    ChainError::Corrupted(format!("body algebra failed: {e}"))
}

/// Structural header checks that need no context.
fn is_sane(state: &SystemState) -> bool {
    if state.height < HEIGHT_GENESIS {
        return false;
    }
    if state.height == HEIGHT_GENESIS {
        state.prev == Hash256::ZERO
    } else {
        state.prev != Hash256::ZERO
    }
}

/// Position of the active chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// `None` before the genesis block is applied.
    pub row: Option<RowId>,
    pub id: StateId,
    pub full: SystemState,
    /// History root over the ancestors of the cursor block.
    pub history: Hash256,
    /// History root once the cursor block itself is appended.
    pub history_next: Hash256,
    /// Difficulty the next block must declare.
    pub difficulty_next: u8,
    pub subsidy_open: bool,
    pub chain_work: u128,
}

impl Cursor {
    fn empty(subsidy_open: bool) -> Self {
        Self {
            row: None,
            id: StateId {
                height: HEIGHT_GENESIS - 1,
                hash: Hash256::ZERO,
            },
            full: SystemState::default(),
            history: Hash256::ZERO,
            history_next: Hash256::ZERO,
            difficulty_next: 0,
            subsidy_open,
            chain_work: 0,
        }
    }
}

/// Maturities of the UTXO keys consumed by a block's inputs, in the order
/// the inputs were applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct RollbackData {
    maturities: Vec<Height>,
    pos: usize,
}

impl RollbackData {
    fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        if bytes == [0u8] {
            return Ok(Self::default());
        }
        if bytes.len() % 8 != 0 {
            return Err(ChainError::Corrupted(format!("bad rollback data length: {}", bytes.len())));
        }
        let maturities = bytes
            .chunks_exact(8)
            .map(|c| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(c);
                u64::from_be_bytes(arr)
            })
            .collect();
        Ok(Self { maturities, pos: 0 })
    }

    /// Never empty, so a stored record always means "interpreted before".
    fn to_bytes(&self) -> Vec<u8> {
        if self.maturities.is_empty() {
            return vec![0];
        }
        self.maturities.iter().flat_map(|m| m.to_be_bytes()).collect()
    }

    fn push(&mut self, maturity: Height) {
        self.maturities.push(maturity);
    }

    fn next(&mut self) -> Result<Height, ChainError> {
        let m = *self
            .maturities
            .get(self.pos)
            .ok_or_else(|| ChainError::Corrupted("rollback data exhausted".into()))?;
        self.pos += 1;
        Ok(m)
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn truncate(&mut self, len: usize) {
        self.maturities.truncate(len);
        self.pos = self.pos.min(len);
    }

    fn len(&self) -> usize {
        self.maturities.len()
    }
}

/// Spendable-set payload of a UTXO: what export needs besides the key.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
struct OutputData {
    coinbase: bool,
    incubation: Height,
    proof: ValueProof,
}

/// An assembled, unsolved block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    /// Header with a zero nonce; solve it before submitting.
    pub state: SystemState,
    pub body: BlockBody,
    pub fees: AmountBig,
}

pub struct ChainProcessor<C: Collaborator> {
    db: ChainDb,
    collab: C,
    rules: Rules,
    horizon: Horizon,
    utxos: UtxoTree,
    kernels: KernelTree,
    cursor: Cursor,
    poisoned: bool,
}

impl<C: Collaborator> ChainProcessor<C> {
    /// Rebuild the live trees from the spendable set, position the cursor
    /// and climb to the best reachable tip.
    pub fn new(db: ChainDb, collab: C, rules: Rules, horizon: Horizon) -> Result<Self, ChainError> {
        let mut processor = Self {
            db,
            collab,
            rules,
            horizon,
            utxos: UtxoTree::new(),
            kernels: KernelTree::new(),
            cursor: Cursor::empty(true),
            poisoned: false,
        };
        processor.load_trees()?;
        processor.init_cursor()?;
        info!(
            cursor = %processor.cursor.id,
            utxos = processor.utxos.len(),
            kernels = processor.kernels.len(),
            "chain processor ready"
        );
        processor.run(|p| p.try_go_up())?;
        Ok(processor)
    }

    fn load_trees(&mut self) -> Result<(), ChainError> {
        for (key, entry) in self.db.enum_unspent()? {
            match key {
                SpendableKey::Utxo(k) => {
                    for _ in 0..entry.unspent {
                        self.utxos.increment(k);
                    }
                }
                SpendableKey::Kernel(id) => {
                    self.kernels.insert(id);
                }
            }
        }
        if !self.db.subsidy_open()? {
            self.kernels.insert(Hash256::ZERO);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn db(&self) -> &ChainDb {
        &self.db
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    pub fn collaborator(&self) -> &C {
        &self.collab
    }

    pub fn utxos(&self) -> &UtxoTree {
        &self.utxos
    }

    pub fn kernels(&self) -> &KernelTree {
        &self.kernels
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Run `f` as one committed step. Any error rolls the database back and
    /// poisons the processor.
    fn run<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ChainError>) -> Result<T, ChainError> {
        if self.poisoned {
            return Err(ChainError::Poisoned);
        }
        let result = match f(self) {
            Ok(value) => self.db.commit().map(|()| value),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.db.rollback();
            self.poisoned = true;
            error!(error = %e, "chain step failed; processor poisoned");
        }
        result
    }

    /// Run `f` and throw its database writes away. `f` must leave the trees
    /// as it found them.
    fn scratch<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ChainError>) -> Result<T, ChainError> {
        if self.poisoned {
            return Err(ChainError::Poisoned);
        }
        let result = f(self);
        self.db.rollback();
        if let Err(e) = &result {
            self.poisoned = true;
            error!(error = %e, "scratch step failed; processor poisoned");
        }
        result
    }

    fn init_cursor(&mut self) -> Result<(), ChainError> {
        let subsidy_open = self.db.subsidy_open()?;
        self.cursor = match self.db.cursor()? {
            None => Cursor::empty(subsidy_open),
            Some(row) => {
                let value = self.db.get_row(row)?;
                Cursor {
                    row: Some(row),
                    id: value.id(),
                    history: self.db.history(row)?,
                    history_next: self.db.predicted_history(row)?,
                    difficulty_next: 0,
                    subsidy_open,
                    chain_work: value.chain_work,
                    full: value.state,
                }
            }
        };
        self.cursor.difficulty_next = self.next_difficulty()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Chain queries
    // ------------------------------------------------------------------

    fn next_difficulty(&self) -> Result<u8, ChainError> {
        if self.cursor.row.is_none() {
            return Ok(0);
        }
        let h = self.cursor.id.height;
        let current = self.cursor.full.pow.difficulty;
        let cycle = self.rules.difficulty_review_cycle;
        let dh = h - HEIGHT_GENESIS;
        if cycle == 0 || dh == 0 || dh % cycle != 0 {
            return Ok(current);
        }
        let start = self
            .db
            .find_active_at(h - cycle)?
            .ok_or_else(|| ChainError::Corrupted(format!("no active state at {}", h - cycle)))?;
        let start_ts = self.db.get_state(start)?.timestamp;
        Ok(difficulty::adjust(current, start_ts, self.cursor.full.timestamp, &self.rules))
    }

    /// Median timestamp of the last `window_for_median` active headers.
    pub fn moving_median(&self) -> Result<Timestamp, ChainError> {
        let Some(mut row) = self.cursor.row else {
            return Ok(0);
        };
        let window = self.rules.window_for_median.max(1);
        let mut stamps = Vec::with_capacity(window);
        loop {
            let value = self.db.get_row(row)?;
            stamps.push(value.state.timestamp);
            if stamps.len() >= window {
                break;
            }
            match value.prev {
                Some(p) => row = p,
                None => break,
            }
        }
        stamps.sort_unstable();
        Ok(stamps[stamps.len() / 2])
    }

    /// Combined root of the live UTXO and kernel trees.
    pub fn live_root(&mut self) -> Hash256 {
        node_hash(&self.utxos.root(), &self.kernels.root())
    }

    /// Definition of the cursor block, or of its successor if `for_next`.
    pub fn definition(&mut self, for_next: bool) -> Hash256 {
        let history = if for_next {
            self.cursor.history_next
        } else {
            self.cursor.history
        };
        node_hash(&history, &self.live_root())
    }

    /// Proof that the active header at `height` is in the cursor's history.
    pub fn history_proof(&self, height: Height) -> Result<Option<MerkleProof>, ChainError> {
        let Some(row) = self.cursor.row else {
            return Ok(None);
        };
        if height < HEIGHT_GENESIS || height >= self.cursor.id.height {
            return Ok(None);
        }
        self.db.get_proof(row, height).map(Some)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    fn check_state(&self, state: &SystemState) -> Result<DataStatus, ChainError> {
        let id = state.id();
        if !is_sane(state) {
            warn!(%id, "insane header");
            return Ok(DataStatus::Invalid);
        }
        if !difficulty::is_valid_pow(state, &self.rules) {
            warn!(%id, "invalid proof of work");
            return Ok(DataStatus::Invalid);
        }
        let now = now();
        if state.timestamp > now.saturating_add(self.rules.timestamp_ahead_threshold_s) {
            warn!(%id, ahead = state.timestamp - now, "header timestamp too far ahead");
            return Ok(DataStatus::Invalid);
        }
        if state.height <= self.db.fossil_height()? {
            debug!(%id, "header at or below fossil height");
            return Ok(DataStatus::Rejected);
        }
        if self.db.find_state(&id)?.is_some() {
            return Ok(DataStatus::Rejected);
        }
        Ok(DataStatus::Accepted)
    }

    /// Offer a header.
    pub fn on_state(&mut self, state: &SystemState, peer: Option<PeerId>) -> Result<DataStatus, ChainError> {
        self.run(|p| {
            let status = p.check_state(state)?;
            if status == DataStatus::Accepted {
                let row = p.db.insert_state(state)?;
                p.db.set_peer(row, peer);
                info!(id = %state.id(), "header accepted");
            }
            Ok(status)
        })
    }

    /// Offer the encoded body of a known header.
    pub fn on_block(&mut self, id: &StateId, body: Vec<u8>, peer: Option<PeerId>) -> Result<DataStatus, ChainError> {
        if body.len() > self.rules.max_body_size {
            warn!(%id, size = body.len(), "oversized block body");
            return Ok(DataStatus::Invalid);
        }
        let status = self.run(|p| {
            if id.height <= p.db.fossil_height()? {
                return Ok(DataStatus::Rejected);
            }
            let Some(row) = p.db.find_state(id)? else {
                debug!(%id, "body for unknown header");
                return Ok(DataStatus::Rejected);
            };
            if p.db.get_row(row)?.has(FUNCTIONAL) {
                return Ok(DataStatus::Rejected);
            }
            p.db.set_body(row, body);
            if peer.is_some() {
                p.db.set_peer(row, peer);
            }
            p.db.set_functional(row)?;
            info!(%id, "block accepted");
            Ok(DataStatus::Accepted)
        })?;
        if status == DataStatus::Accepted {
            self.run(|p| p.try_go_up())?;
        }
        Ok(status)
    }

    /// Whether `id` is worth downloading.
    pub fn is_state_needed(&self, id: &StateId) -> Result<bool, ChainError> {
        Ok(id.height > self.db.fossil_height()? && self.db.find_state(id)?.is_none())
    }

    /// Ask the collaborator for whatever blocks each promising unreachable
    /// tip: the body of its lowest non-functional ancestor above the
    /// reachable part, or the missing parent header.
    pub fn enum_congestions(&mut self) -> Result<(), ChainError> {
        if self.poisoned {
            return Err(ChainError::Poisoned);
        }
        for (height, tip) in self.db.enum_tips()? {
            if height < self.cursor.id.height {
                continue;
            }
            let mut value = self.db.get_row(tip)?;
            if value.has(REACHABLE) {
                continue;
            }
            let mut row = tip;
            let mut want_body = true;
            while value.state.height > HEIGHT_GENESIS {
                let Some(prev) = value.prev else {
                    want_body = false;
                    break;
                };
                let parent = self.db.get_row(prev)?;
                if parent.has(REACHABLE) {
                    break;
                }
                row = prev;
                value = parent;
            }
            let id = if want_body {
                value.id()
            } else {
                StateId {
                    height: value.state.height - 1,
                    hash: value.state.prev,
                }
            };
            let peer = self.db.peer(row)?;
            debug!(%id, want_body, "requesting data");
            self.collab.request_data(id, want_body, peer);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Climbing
    // ------------------------------------------------------------------

    fn try_go_up(&mut self) -> Result<(), ChainError> {
        let start_row = self.cursor.row;
        let start_height = self.cursor.id.height;
        let mut rolled_back = false;
        let mut dirty = false;

        loop {
            let Some(&(work, tip)) = self.db.enum_functional_tips()?.first() else {
                break;
            };
            if work <= self.cursor.chain_work {
                break;
            }

            let mut path = Vec::new();
            let mut row = tip;
            let fork_height = loop {
                let value = self.db.get_row(row)?;
                if value.has(ACTIVE) {
                    break value.state.height;
                }
                path.push(row);
                match value.prev {
                    Some(p) => row = p,
                    None => break HEIGHT_GENESIS - 1,
                }
            };
            let Some(&lowest) = path.last() else {
                return Err(ChainError::Corrupted(format!("active tip {tip} above the cursor")));
            };

            if fork_height < self.db.fossil_height()? {
                warn!(fork_height, "fork below fossil height, dropping its branch");
                self.db.delete_body(lowest);
                self.db.set_not_functional(lowest)?;
                continue;
            }

            if fork_height < self.cursor.id.height {
                self.rollback_to(fork_height)?;
                rolled_back = true;
                dirty = true;
            }
            for &row in path.iter().rev() {
                if !self.go_forward(row)? {
                    break;
                }
                dirty = true;
            }
        }

        if dirty {
            self.prune_old()?;
            if rolled_back {
                info!(from = start_height, to = %self.cursor.id, "reorganized");
                self.collab.on_rolled_back();
            }
            if self.cursor.row != start_row {
                self.collab.on_new_state();
            }
        }
        Ok(())
    }

    fn rollback_to(&mut self, height: Height) -> Result<(), ChainError> {
        while self.cursor.id.height > height {
            let row = self
                .cursor
                .row
                .ok_or_else(|| ChainError::Corrupted("rollback without a cursor".into()))?;
            let id = self.cursor.id;
            if !self.handle_block(row, false)? {
                return Err(ChainError::Corrupted(format!("failed to undo {id}")));
            }
            self.db.delete_mined_safe(row, id.height);
            self.db.move_back()?;
            self.init_cursor()?;
        }
        info!(height, "rolled back");
        Ok(())
    }

    fn go_forward(&mut self, row: RowId) -> Result<bool, ChainError> {
        if self.handle_block(row, true)? {
            self.db.move_fwd(row)?;
            self.init_cursor()?;
            return Ok(true);
        }
        let id = self.db.get_row(row)?.id();
        warn!(%id, "block rejected, dropping its body");
        self.db.delete_body(row);
        self.db.set_not_functional(row)?;
        if let Some(peer) = self.db.peer(row)? {
            self.db.set_peer(row, None);
            self.collab.on_peer_misbehaved(peer);
        }
        Ok(false)
    }

    // ------------------------------------------------------------------
    // Interpretation
    // ------------------------------------------------------------------

    fn first_time_checks(&self, state: &SystemState, body: &BlockBody) -> Result<bool, ChainError> {
        let id = state.id();
        if body.subsidy_closing && !self.cursor.subsidy_open {
            warn!(%id, "subsidy already closed");
            return Ok(false);
        }
        if state.pow.difficulty != self.cursor.difficulty_next {
            warn!(%id, expected = self.cursor.difficulty_next, got = state.pow.difficulty, "wrong difficulty");
            return Ok(false);
        }
        let median = self.moving_median()?;
        if state.timestamp <= median {
            warn!(%id, timestamp = state.timestamp, median, "timestamp not above moving median");
            return Ok(false);
        }
        Ok(self.collab.verify_block(
            body,
            HeightRange::single(state.height),
            self.cursor.subsidy_open,
            &self.rules,
        ))
    }

    /// Apply (`fwd`) or undo the block of `row` against the trees. Returns
    /// `false` if a forward block is invalid; the trees are then unchanged.
    fn handle_block(&mut self, row: RowId, fwd: bool) -> Result<bool, ChainError> {
        let value = self.db.get_row(row)?;
        let id = value.id();
        let bytes = self
            .db
            .body(row)?
            .ok_or_else(|| ChainError::Corrupted(format!("no body for {id}")))?;
        let body = match decode_body(&bytes) {
            Ok(body) => body,
            Err(e) if fwd => {
                warn!(%id, error = %e, "undecodable block body");
                return Ok(false);
            }
            Err(e) => return Err(ChainError::Corrupted(format!("undecodable body of {id}: {e}"))),
        };

        let stored = self.db.rollback_data(row)?;
        let first_time = fwd && stored.is_none();
        if first_time && !self.first_time_checks(&value.state, &body)? {
            return Ok(false);
        }
        let mut rb = match (fwd, stored) {
            (true, _) => RollbackData::default(),
            (false, Some(bytes)) => RollbackData::from_bytes(&bytes)?,
            (false, None) => return Err(ChainError::Corrupted(format!("no rollback data for {id}"))),
        };

        if !self.handle_validated_tx(&body.elements, id.height, fwd, &mut rb, None)? {
            warn!(%id, "block spends missing outputs or duplicates kernels");
            return Ok(false);
        }
        if body.subsidy_closing {
            self.toggle_subsidy_opened();
        }

        if first_time {
            let expected = self.definition(true);
            if expected != value.state.definition {
                warn!(%id, %expected, "definition mismatch");
                if body.subsidy_closing {
                    self.toggle_subsidy_opened();
                }
                rb.seek(0);
                self.handle_validated_tx(&body.elements, id.height, false, &mut rb, None)?;
                return Ok(false);
            }
            self.db.set_rollback(row, rb.to_bytes());
        }

        self.adjust_cumulative(&body, fwd)?;
        debug!(%id, fwd, "block interpreted");
        Ok(true)
    }

    fn toggle_subsidy_opened(&mut self) {
        self.cursor.subsidy_open = !self.cursor.subsidy_open;
        self.db.set_subsidy_open(self.cursor.subsidy_open);
        if self.cursor.subsidy_open {
            self.kernels.remove(&Hash256::ZERO);
        } else {
            self.kernels.insert(Hash256::ZERO);
        }
    }

    fn adjust_cumulative(&mut self, body: &BlockBody, fwd: bool) -> Result<(), ChainError> {
        let offset = self.db.offset()?;
        let subsidy = self.db.subsidy()?;
        let (offset, subsidy) = if fwd {
            (crypto::add_offsets(&offset, &body.offset), subsidy.checked_add(body.subsidy))
        } else {
            (crypto::sub_offsets(&offset, &body.offset), subsidy.checked_sub(body.subsidy))
        };
        let offset = offset.ok_or_else(|| ChainError::Corrupted("invalid cumulative offset".into()))?;
        let subsidy = subsidy.ok_or_else(|| ChainError::Corrupted("cumulative subsidy out of range".into()))?;
        self.db.set_offset(&offset);
        self.db.set_subsidy(subsidy);
        Ok(())
    }

    /// Apply or undo every element of `v` at height `h`.
    ///
    /// `h_max` is set for macroblocks covering `h..=h_max`: elements then
    /// carry explicit maturities. A failed forward pass undoes what it
    /// applied and returns `false`; a failed undo is corruption.
    fn handle_validated_tx(
        &mut self,
        v: &TxVectors,
        h: Height,
        fwd: bool,
        rb: &mut RollbackData,
        h_max: Option<Height>,
    ) -> Result<bool, ChainError> {
        let start = if fwd { rb.len() } else { rb.pos };
        let (mut n_in, mut n_out, mut n_kin, mut n_kout) = (0, 0, 0, 0);

        let mut ok = true;
        for input in &v.inputs {
            if !self.handle_input(input, h, fwd, rb, h_max)? {
                ok = false;
                break;
            }
            n_in += 1;
        }
        if ok {
            for output in &v.outputs {
                if !self.handle_output(output, h, fwd, h_max)? {
                    ok = false;
                    break;
                }
                n_out += 1;
            }
        }
        if ok {
            for kernel in &v.kernels_in {
                if !self.handle_kernel(kernel, fwd, true)? {
                    ok = false;
                    break;
                }
                n_kin += 1;
            }
        }
        if ok {
            for kernel in &v.kernels_out {
                if !self.handle_kernel(kernel, fwd, false)? {
                    ok = false;
                    break;
                }
                n_kout += 1;
            }
        }
        if ok {
            return Ok(true);
        }
        if !fwd {
            return Err(ChainError::Corrupted(format!("failed to undo elements at height {h}")));
        }

        let undo_failed = || ChainError::Corrupted(format!("failed to undo partial apply at height {h}"));
        rb.seek(start);
        for input in &v.inputs[..n_in] {
            if !self.handle_input(input, h, false, rb, h_max)? {
                return Err(undo_failed());
            }
        }
        for output in &v.outputs[..n_out] {
            if !self.handle_output(output, h, false, h_max)? {
                return Err(undo_failed());
            }
        }
        for kernel in &v.kernels_in[..n_kin] {
            if !self.handle_kernel(kernel, false, true)? {
                return Err(undo_failed());
            }
        }
        for kernel in &v.kernels_out[..n_kout] {
            if !self.handle_kernel(kernel, false, false)? {
                return Err(undo_failed());
            }
        }
        rb.truncate(start);
        Ok(false)
    }

    fn handle_input(
        &mut self,
        input: &Input,
        h: Height,
        fwd: bool,
        rb: &mut RollbackData,
        h_max: Option<Height>,
    ) -> Result<bool, ChainError> {
        if !fwd {
            let key = UtxoKey {
                commitment: input.commitment,
                maturity: rb.next()?,
            };
            self.utxos.increment(key);
            self.db.modify_spendable(&SpendableKey::Utxo(key), 0, 1)?;
            return Ok(true);
        }

        let window = match h_max {
            None if input.maturity != 0 => return Ok(false),
            None => HeightRange::new(0, h),
            Some(max) if input.maturity >= HEIGHT_GENESIS => {
                if input.maturity > max {
                    return Ok(false);
                }
                HeightRange::single(input.maturity)
            }
            Some(max) => HeightRange::new(0, max),
        };
        let key = match self.utxos.find_in_range(&input.commitment, window) {
            Lookup::One(key, _) => key,
            Lookup::None | Lookup::Ambiguous => return Ok(false),
        };
        self.utxos
            .decrement(&key)
            .ok_or_else(|| ChainError::Corrupted(format!("utxo {} vanished", key.commitment)))?;
        rb.push(key.maturity);
        self.db.modify_spendable(&SpendableKey::Utxo(key), 0, -1)?;
        Ok(true)
    }

    fn handle_output(&mut self, output: &Output, h: Height, fwd: bool, h_max: Option<Height>) -> Result<bool, ChainError> {
        let min = output.min_maturity(h, &self.rules);
        let maturity = match h_max {
            None if output.maturity != 0 => return Ok(false),
            None => min,
            Some(_) if output.maturity != 0 => {
                if output.maturity < min {
                    return Ok(false);
                }
                output.maturity
            }
            Some(_) => min,
        };
        let key = UtxoKey {
            commitment: output.commitment,
            maturity,
        };
        let skey = SpendableKey::Utxo(key);
        if fwd {
            self.utxos.increment(key);
            let data = OutputData {
                coinbase: output.coinbase,
                incubation: output.incubation,
                proof: output.proof.clone(),
            };
            self.db.add_spendable(&skey, encode(&data)?, 1, 1)?;
        } else {
            if self.utxos.decrement(&key).is_none() {
                return Ok(false);
            }
            self.db.modify_spendable(&skey, -1, -1)?;
        }
        Ok(true)
    }

    fn handle_kernel(&mut self, kernel: &TxKernel, fwd: bool, is_input: bool) -> Result<bool, ChainError> {
        let id = kernel.id();
        let adding = fwd != is_input;
        let changed = if adding {
            self.kernels.insert(id)
        } else {
            self.kernels.remove(&id)
        };
        if !changed {
            return Ok(false);
        }
        let key = SpendableKey::Kernel(id);
        match (is_input, fwd) {
            (true, true) => self.db.modify_spendable(&key, 0, -1)?,
            (true, false) => self.db.modify_spendable(&key, 0, 1)?,
            (false, true) => self.db.add_spendable(&key, encode(kernel)?, 1, 1)?,
            (false, false) => self.db.modify_spendable(&key, -1, -1)?,
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Pruning
    // ------------------------------------------------------------------

    fn prune_old(&mut self) -> Result<(), ChainError> {
        let h = self.cursor.id.height;

        if h > self.horizon.branching {
            let lowest_kept = h - self.horizon.branching;
            loop {
                let Some(&(tip_height, tip)) = self.db.enum_tips()?.first() else {
                    break;
                };
                if tip_height >= lowest_kept || !self.delete_branch(tip)? {
                    break;
                }
            }
        }

        if h > self.horizon.fossil {
            let target = h - self.horizon.fossil;
            let mut fossil = self.db.fossil_height()?;
            if target > fossil {
                while fossil < target {
                    fossil += 1;
                    self.fossilize_height(fossil)?;
                }
                self.db.set_fossil_height(fossil);
                debug!(fossil, "fossil height advanced");
            }
        }
        Ok(())
    }

    /// Delete a dead tip and its ancestors that lead nowhere else.
    fn delete_branch(&mut self, tip: RowId) -> Result<bool, ChainError> {
        let mut row = tip;
        let mut deleted = 0usize;
        loop {
            let prev = self.db.get_prev(row)?;
            if !self.db.delete_state(row)? {
                break;
            }
            deleted += 1;
            let Some(p) = prev else { break };
            let parent = self.db.get_row(p)?;
            if parent.children > 0 || parent.has(ACTIVE) {
                break;
            }
            row = p;
        }
        if deleted > 0 {
            debug!(deleted, "pruned dead branch");
        }
        Ok(deleted > 0)
    }

    /// Drop bodies at `height`; rows off the active chain stop being
    /// functional.
    fn fossilize_height(&mut self, height: Height) -> Result<(), ChainError> {
        for (row, _) in self.db.enum_states_at(height)? {
            let value = self.db.get_row(row)?;
            if value.has(ACTIVE) {
                self.dereference_fossil_block(row)?;
            } else if value.has(FUNCTIONAL) {
                self.db.set_not_functional(row)?;
            }
            self.db.delete_body(row);
            self.db.set_peer(row, None);
        }
        Ok(())
    }

    /// Release the references a fossilized block's spends held in the
    /// spendable set.
    fn dereference_fossil_block(&mut self, row: RowId) -> Result<(), ChainError> {
        let Some(bytes) = self.db.body(row)? else {
            return Ok(());
        };
        let body = decode_body(&bytes).map_err(|e| ChainError::Corrupted(format!("undecodable fossil body: {e}")))?;
        let rb_bytes = self
            .db
            .rollback_data(row)?
            .ok_or_else(|| ChainError::Corrupted(format!("no rollback data for fossil row {row}")))?;
        let rb = RollbackData::from_bytes(&rb_bytes)?;
        if rb.len() != body.elements.inputs.len() {
            return Err(ChainError::Corrupted(format!("rollback data of row {row} does not match its inputs")));
        }
        self.release_spends(&body.elements, &rb)
    }

    /// Drop one reference from every entry `v` spends. `rb` holds the
    /// maturities its inputs resolved to.
    fn release_spends(&mut self, v: &TxVectors, rb: &RollbackData) -> Result<(), ChainError> {
        for (input, &maturity) in v.inputs.iter().zip(&rb.maturities) {
            let key = UtxoKey {
                commitment: input.commitment,
                maturity,
            };
            self.db.modify_spendable(&SpendableKey::Utxo(key), -1, 0)?;
        }
        for kernel in &v.kernels_in {
            self.db.modify_spendable(&SpendableKey::Kernel(kernel.id()), -1, 0)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions and assembly
    // ------------------------------------------------------------------

    /// Context-free checks plus the kernel window against the next height.
    pub fn validate_tx(&self, tx: &Transaction) -> Result<TxContext, TxError> {
        let ctx = check_transaction(tx)?;
        let next = self.cursor.id.height + 1;
        if !ctx.height.contains(next) {
            return Err(TxError::OutsideHeightWindow {
                height: next,
                min: ctx.height.min,
                max: ctx.height.max,
            });
        }
        Ok(ctx)
    }

    /// Whether `tx` applies on top of the cursor. Leaves no trace.
    pub fn validate_tx_context(&mut self, tx: &Transaction) -> Result<bool, ChainError> {
        self.scratch(|p| {
            let h = p.cursor.id.height + 1;
            let mut rb = RollbackData::default();
            if !p.handle_validated_tx(&tx.elements, h, true, &mut rb, None)? {
                return Ok(false);
            }
            rb.seek(0);
            p.handle_validated_tx(&tx.elements, h, false, &mut rb, None)?;
            Ok(true)
        })
    }

    /// Assemble a block on top of the cursor from the most profitable pool
    /// transactions. Transactions that no longer apply are dropped from the
    /// pool. Returns `None` if the result would not be a valid block.
    pub fn generate_new_block(&mut self, pool: &mut TxPool, kdf: &Kdf) -> Result<Option<BlockTemplate>, ChainError> {
        self.scratch(|p| p.assemble(pool, kdf))
    }

    fn assemble(&mut self, pool: &mut TxPool, kdf: &Kdf) -> Result<Option<BlockTemplate>, ChainError> {
        let h = self.cursor.id.height + 1;
        let mut body = BlockBody {
            subsidy_closing: self.cursor.subsidy_open,
            ..BlockBody::default()
        };
        let mut rb = RollbackData::default();
        let mut offset = Scalar::ZERO;
        let mut fees: AmountBig = 0;
        let mut used = 0usize;
        let budget = self.rules.assembly_budget();

        let keys: Vec<Hash256> = pool.iter_by_profit().map(|e| e.key).collect();
        for key in keys {
            let Some((tx, ctx, size)) = pool.get(&key).map(|e| (e.tx.clone(), e.ctx, e.profit.size as usize)) else {
                continue;
            };
            if used.saturating_add(size) > budget {
                continue;
            }
            if ctx.height.max < h {
                pool.delete(&key);
                continue;
            }
            if ctx.height.min > h {
                continue;
            }
            let Some(tx_offset) = crypto::scalar_from_offset(&tx.offset) else {
                pool.delete(&key);
                continue;
            };
            if self.handle_validated_tx(&tx.elements, h, true, &mut rb, None)? {
                body.elements.append(&tx.elements);
                fees = fees.saturating_add(ctx.fee);
                offset += tx_offset;
                used += size;
            } else {
                debug!(%key, "dropping transaction that no longer applies");
                pool.delete(&key);
            }
        }

        let mut ok = true;
        if fees > 0 {
            match Amount::try_from(fees) {
                Ok(value) => {
                    let k = kdf.derive(h, KeyType::Comission);
                    let (commitment, proof) = crypto::create_output(&k, value);
                    let output = Output {
                        commitment,
                        maturity: 0,
                        coinbase: false,
                        incubation: 0,
                        proof,
                    };
                    if self.handle_output(&output, h, true, None)? {
                        body.elements.outputs.push(output);
                        offset += k;
                    } else {
                        ok = false;
                    }
                }
                Err(_) => ok = false,
            }
        } else {
            let k = kdf.derive(h, KeyType::Kernel);
            let kernel = crypto::create_kernel(&k, 0, HeightRange::single(h));
            if self.handle_kernel(&kernel, true, false)? {
                body.elements.kernels_out.push(kernel);
                offset -= k;
            } else {
                ok = false;
            }
        }

        if ok {
            let k = kdf.derive(h, KeyType::Coinbase);
            let (commitment, proof) = crypto::create_output(&k, self.rules.coinbase_emission);
            let output = Output {
                commitment,
                maturity: 0,
                coinbase: true,
                incubation: 0,
                proof,
            };
            if self.handle_output(&output, h, true, None)? {
                body.elements.outputs.push(output);
                body.subsidy = AmountBig::from(self.rules.coinbase_emission);
                offset += k;
            } else {
                ok = false;
            }
        }

        let mut definition = Hash256::ZERO;
        if ok {
            if body.subsidy_closing {
                self.kernels.insert(Hash256::ZERO);
            }
            definition = self.definition(true);
            if body.subsidy_closing {
                self.kernels.remove(&Hash256::ZERO);
            }
        }

        rb.seek(0);
        self.handle_validated_tx(&body.elements, h, false, &mut rb, None)?;
        if !ok {
            warn!(height = h, "block assembly failed");
            return Ok(None);
        }

        body.offset = crypto::offset_from_scalar(&offset);
        body.elements.sort();
        delete_intermediate_outputs(&mut body.elements);

        let size = body_size(&body).map_err(|e| ChainError::Codec(e.to_string()))?;
        if size > self.rules.max_body_size {
            warn!(height = h, size, "assembled body too large");
            return Ok(None);
        }

        let timestamp = now().max(self.moving_median()?.saturating_add(1));
        let state = SystemState {
            height: h,
            prev: self.cursor.id.hash,
            definition,
            timestamp,
            pow: PoW {
                difficulty: self.cursor.difficulty_next,
                nonce: 0,
            },
        };
        info!(height = h, fees, size, "block template assembled");
        Ok(Some(BlockTemplate { state, body, fees }))
    }

    // ------------------------------------------------------------------
    // Mined rewards
    // ------------------------------------------------------------------

    /// Remember a reward earned by a block we produced.
    pub fn record_mined(&mut self, id: &StateId, amount: Amount) -> Result<bool, ChainError> {
        self.run(|p| match p.db.find_state(id)? {
            Some(row) => {
                p.db.set_mined(row, amount)?;
                Ok(true)
            }
            None => Ok(false),
        })
    }

    pub fn mined_since(&self, height: Height) -> Result<Vec<(StateId, Amount)>, ChainError> {
        self.db.enum_mined(height)
    }

    // ------------------------------------------------------------------
    // Macroblocks
    // ------------------------------------------------------------------

    /// Stored body of an active block with explicit maturities filled in.
    fn extract_block_with_extra(&self, row: RowId) -> Result<BlockBody, ChainError> {
        let value = self.db.get_row(row)?;
        let id = value.id();
        let bytes = self
            .db
            .body(row)?
            .ok_or_else(|| ChainError::Corrupted(format!("no body for {id}")))?;
        let mut body = decode_body(&bytes).map_err(|e| ChainError::Corrupted(format!("undecodable body of {id}: {e}")))?;
        let rb_bytes = self
            .db
            .rollback_data(row)?
            .ok_or_else(|| ChainError::Corrupted(format!("no rollback data for {id}")))?;
        let mut rb = RollbackData::from_bytes(&rb_bytes)?;
        for input in &mut body.elements.inputs {
            input.maturity = rb.next()?;
        }
        for output in &mut body.elements.outputs {
            output.maturity = output.min_maturity(id.height, &self.rules);
        }
        body.elements.sort();
        Ok(body)
    }

    /// Squash the active blocks in `range` into one macroblock. `None` if
    /// the range is not fully above the fossil height and at or below the
    /// cursor.
    pub fn export_macroblock(&mut self, range: HeightRange) -> Result<Option<Macroblock>, ChainError> {
        if self.poisoned {
            return Err(ChainError::Poisoned);
        }
        let fossil = self.db.fossil_height()?;
        if range.is_empty() || range.min <= fossil || range.max > self.cursor.id.height {
            warn!(min = range.min, max = range.max, fossil, "macroblock range not exportable");
            return Ok(None);
        }

        // Binary counter of squashed chunks, newest at the bottom.
        let mut stack: Vec<(BlockBody, u32)> = Vec::new();
        let mut h = range.max;
        loop {
            let row = self
                .db
                .find_active_at(h)?
                .ok_or_else(|| ChainError::Corrupted(format!("no active state at {h}")))?;
            let mut chunk = (self.extract_block_with_extra(row)?, 0u32);
            while stack.last().is_some_and(|top| top.1 == chunk.1) {
                if let Some((newer, level)) = stack.pop() {
                    squash(&mut chunk.0, newer).map_err(algebra)?;
                    chunk.1 = level + 1;
                }
            }
            stack.push(chunk);
            if h == range.min {
                break;
            }
            h -= 1;
        }
        let (mut body, _) = stack
            .pop()
            .ok_or_else(|| ChainError::Corrupted("empty macroblock stack".into()))?;
        while let Some((newer, _)) = stack.pop() {
            squash(&mut body, newer).map_err(algebra)?;
        }

        let mut headers = Vec::with_capacity(range.len() as usize);
        let mut prefix = HeaderPrefix::default();
        for height in range.min..=range.max {
            let row = self
                .db
                .find_active_at(height)?
                .ok_or_else(|| ChainError::Corrupted(format!("no active state at {height}")))?;
            let state = self.db.get_state(row)?;
            if height == range.min {
                prefix = HeaderPrefix {
                    height,
                    prev: state.prev,
                };
            }
            headers.push(HeaderElement::from(&state));
        }
        info!(min = range.min, max = range.max, "macroblock exported");
        Ok(Some(Macroblock { body, prefix, headers }))
    }

    /// Apply a macroblock that starts right above the cursor. Returns
    /// `false`, with nothing changed, if it does not fit or its last header
    /// does not commit to the resulting state.
    pub fn import_macroblock(&mut self, mb: &Macroblock) -> Result<bool, ChainError> {
        let imported = self.run(|p| p.import_inner(mb))?;
        if imported {
            self.collab.on_new_state();
            self.run(|p| p.try_go_up())?;
        }
        Ok(imported)
    }

    fn import_inner(&mut self, mb: &Macroblock) -> Result<bool, ChainError> {
        if mb.headers.is_empty() {
            warn!("macroblock without headers");
            return Ok(false);
        }
        let Some(range) = mb.range() else {
            warn!(start = mb.prefix.height, headers = mb.headers.len(), "macroblock height range overflows");
            return Ok(false);
        };
        if range.min != self.cursor.id.height + 1 || mb.prefix.prev != self.cursor.id.hash {
            warn!(start = range.min, cursor = %self.cursor.id, "macroblock does not extend the cursor");
            return Ok(false);
        }
        if mb.body.subsidy_closing && !self.cursor.subsidy_open {
            warn!("macroblock closes an already closed subsidy");
            return Ok(false);
        }
        info!(min = range.min, max = range.max, "importing macroblock");

        let Some(states) = mb.states() else {
            return Ok(false);
        };
        for state in &states {
            match self.check_state(state)? {
                DataStatus::Invalid => {
                    self.db.rollback();
                    return Ok(false);
                }
                DataStatus::Accepted => {
                    self.db.insert_state(state)?;
                }
                DataStatus::Rejected => {}
            }
        }

        if !self.collab.verify_block(&mb.body, range, self.cursor.subsidy_open, &self.rules) {
            self.db.rollback();
            return Ok(false);
        }
        let mut rb = RollbackData::default();
        if !self.handle_validated_tx(&mb.body.elements, range.min, true, &mut rb, Some(range.max))? {
            warn!("macroblock spends missing outputs");
            self.db.rollback();
            return Ok(false);
        }

        for state in &states {
            let row = self
                .db
                .find_state(&state.id())?
                .ok_or_else(|| ChainError::Corrupted(format!("imported state {} missing", state.id())))?;
            self.db.set_functional(row)?;
            self.db.delete_body(row);
            self.db.set_peer(row, None);
            self.db.move_fwd(row)?;
        }
        if mb.body.subsidy_closing {
            self.toggle_subsidy_opened();
        }
        self.init_cursor()?;

        if self.definition(false) != self.cursor.full.definition {
            warn!(last = %self.cursor.id, "macroblock definition mismatch");
            if mb.body.subsidy_closing {
                self.toggle_subsidy_opened();
            }
            rb.seek(0);
            self.handle_validated_tx(&mb.body.elements, range.min, false, &mut rb, Some(range.max))?;
            self.db.rollback();
            self.init_cursor()?;
            return Ok(false);
        }

        self.adjust_cumulative(&mb.body, true)?;
        // Imported rows carry no body, so their spends are released here.
        self.release_spends(&mb.body.elements, &rb)?;
        let mut fossil = self.db.fossil_height()?;
        while fossil < range.max {
            fossil += 1;
            self.fossilize_height(fossil)?;
        }
        self.db.set_fossil_height(range.max);
        let last = self
            .cursor
            .row
            .ok_or_else(|| ChainError::Corrupted("cursor lost after import".into()))?;
        self.db.macroblock_insert(last)?;
        info!(cursor = %self.cursor.id, "macroblock imported");
        Ok(true)
    }

    /// The whole live state as one macroblock from genesis to the cursor.
    pub fn export_snapshot(&mut self) -> Result<Option<Macroblock>, ChainError> {
        if self.poisoned {
            return Err(ChainError::Poisoned);
        }
        if self.cursor.row.is_none() {
            return Ok(None);
        }
        let mut body = BlockBody {
            subsidy: self.db.subsidy()?,
            subsidy_closing: !self.cursor.subsidy_open,
            offset: self.db.offset()?,
            elements: TxVectors::default(),
        };
        for (key, entry) in self.db.enum_unspent()? {
            match key {
                SpendableKey::Utxo(k) => {
                    let data: OutputData = decode_stored(&entry.body, "output data")?;
                    for _ in 0..entry.unspent {
                        body.elements.outputs.push(Output {
                            commitment: k.commitment,
                            maturity: k.maturity,
                            coinbase: data.coinbase,
                            incubation: data.incubation,
                            proof: data.proof.clone(),
                        });
                    }
                }
                SpendableKey::Kernel(_) => {
                    let kernel: TxKernel = decode_stored(&entry.body, "kernel")?;
                    body.elements.kernels_out.push(kernel);
                }
            }
        }
        body.elements.sort();

        let mut headers = Vec::new();
        let mut prefix = HeaderPrefix::default();
        for height in HEIGHT_GENESIS..=self.cursor.id.height {
            let row = self
                .db
                .find_active_at(height)?
                .ok_or_else(|| ChainError::Corrupted(format!("no active state at {height}")))?;
            let state = self.db.get_state(row)?;
            if height == HEIGHT_GENESIS {
                prefix = HeaderPrefix {
                    height,
                    prev: state.prev,
                };
            }
            headers.push(HeaderElement::from(&state));
        }
        info!(cursor = %self.cursor.id, outputs = body.elements.outputs.len(), "snapshot exported");
        Ok(Some(Macroblock { body, prefix, headers }))
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Database invariants, plus the live trees against the spendable set
    /// and the cursor definition against the trees.
    pub fn check_invariants(&mut self) -> Result<(), ChainError> {
        self.db.check_invariants()?;

        let mut utxos = UtxoTree::new();
        let mut kernels = KernelTree::new();
        for (key, entry) in self.db.enum_unspent()? {
            match key {
                SpendableKey::Utxo(k) => {
                    for _ in 0..entry.unspent {
                        utxos.increment(k);
                    }
                }
                SpendableKey::Kernel(id) => {
                    kernels.insert(id);
                }
            }
        }
        if !self.cursor.subsidy_open {
            kernels.insert(Hash256::ZERO);
        }
        if utxos != self.utxos {
            return Err(ChainError::Corrupted("live utxo tree disagrees with the spendable set".into()));
        }
        if kernels.len() != self.kernels.len() || kernels.root() != self.kernels.root() {
            return Err(ChainError::Corrupted("live kernel tree disagrees with the spendable set".into()));
        }
        if self.cursor.row.is_some() && self.definition(false) != self.cursor.full.definition {
            return Err(ChainError::Corrupted(format!("cursor {} definition mismatch", self.cursor.id)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{MockCollaborator, Offline};
    use crate::verifier::Verifier;
    use cinder_core::block::build_transaction;
    use mockall::predicate::eq;

    fn kdf() -> Kdf {
        Kdf::from_seed([5; 32])
    }

    fn processor<C: Collaborator>(collab: C, dir: &tempfile::TempDir) -> ChainProcessor<C> {
        let db = ChainDb::open(dir.path().join("chaindata")).unwrap();
        ChainProcessor::new(db, collab, Rules::regtest(), Horizon::unlimited()).unwrap()
    }

    /// A collaborator mock that verifies blocks for real and tolerates
    /// notifications.
    fn permissive_mock() -> MockCollaborator {
        let mut mock = MockCollaborator::new();
        mock.expect_verify_block()
            .returning(|body, range, open, rules| Verifier::new(1).verify(body, range, open, rules).is_ok());
        mock.expect_on_new_state().returning(|| ());
        mock.expect_on_rolled_back().returning(|| ());
        mock
    }

    fn mine<C: Collaborator>(p: &mut ChainProcessor<C>, pool: &mut TxPool) -> StateId {
        let t = p.generate_new_block(pool, &kdf()).unwrap().unwrap();
        let id = t.state.id();
        assert_eq!(p.on_state(&t.state, None).unwrap(), DataStatus::Accepted);
        assert_eq!(p.on_block(&id, encode(&t.body).unwrap(), None).unwrap(), DataStatus::Accepted);
        assert_eq!(p.cursor().id, id);
        id
    }

    // ------------------------------------------------------------------
    // Rollback data
    // ------------------------------------------------------------------

    #[test]
    fn rollback_data_bytes() {
        let empty = RollbackData::default();
        assert_eq!(empty.to_bytes(), vec![0]);
        assert_eq!(RollbackData::from_bytes(&[0]).unwrap(), empty);

        let mut rb = RollbackData::default();
        rb.push(7);
        rb.push(300);
        let mut back = RollbackData::from_bytes(&rb.to_bytes()).unwrap();
        assert_eq!(back.next().unwrap(), 7);
        assert_eq!(back.next().unwrap(), 300);
        assert!(back.next().is_err());

        assert!(RollbackData::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn rollback_data_truncate_clamps_position() {
        let mut rb = RollbackData::default();
        for m in 0..4 {
            rb.push(m);
        }
        rb.seek(3);
        rb.truncate(2);
        assert_eq!(rb.len(), 2);
        assert!(rb.next().is_err());
    }

    // ------------------------------------------------------------------
    // Header checks
    // ------------------------------------------------------------------

    #[test]
    fn sanity_rules() {
        let mut s = SystemState {
            height: 1,
            ..SystemState::default()
        };
        assert!(is_sane(&s));
        s.prev = Hash256([1; 32]);
        assert!(!is_sane(&s));
        s.height = 2;
        assert!(is_sane(&s));
        s.prev = Hash256::ZERO;
        assert!(!is_sane(&s));
        s.height = 0;
        assert!(!is_sane(&s));
    }

    #[test]
    fn future_header_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(Offline::default(), &dir);
        let s = SystemState {
            height: 1,
            timestamp: now() + p.rules().timestamp_ahead_threshold_s + 60,
            ..SystemState::default()
        };
        assert_eq!(p.on_state(&s, None).unwrap(), DataStatus::Invalid);
    }

    #[test]
    fn duplicate_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(Offline::default(), &dir);
        let s = SystemState {
            height: 1,
            timestamp: now(),
            ..SystemState::default()
        };
        assert_eq!(p.on_state(&s, None).unwrap(), DataStatus::Accepted);
        assert_eq!(p.on_state(&s, None).unwrap(), DataStatus::Rejected);
        assert!(!p.is_state_needed(&s.id()).unwrap());
    }

    #[test]
    fn body_checks() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(Offline::default(), &dir);
        let unknown = StateId {
            height: 1,
            hash: Hash256([9; 32]),
        };
        assert_eq!(p.on_block(&unknown, vec![1, 2], None).unwrap(), DataStatus::Rejected);
        let huge = vec![0u8; p.rules().max_body_size + 1];
        assert_eq!(p.on_block(&unknown, huge, None).unwrap(), DataStatus::Invalid);
    }

    // ------------------------------------------------------------------
    // Mining and interpretation
    // ------------------------------------------------------------------

    #[test]
    fn mined_blocks_advance_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(permissive_mock(), &dir);
        let mut pool = TxPool::new();
        let first = mine(&mut p, &mut pool);
        assert_eq!(first.height, HEIGHT_GENESIS);
        assert!(!p.cursor().subsidy_open, "genesis closes the subsidy");
        let second = mine(&mut p, &mut pool);
        assert_eq!(second.height, 2);
        assert_eq!(p.utxos().len(), 2);
        assert_eq!(p.db().subsidy().unwrap(), 2 * u128::from(p.rules().coinbase_emission));
        p.check_invariants().unwrap();
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let tip = {
            let mut p = processor(Offline::default(), &dir);
            let mut pool = TxPool::new();
            mine(&mut p, &mut pool);
            mine(&mut p, &mut pool)
        };
        let mut p = processor(Offline::default(), &dir);
        assert_eq!(p.cursor().id, tip);
        assert_eq!(p.utxos().len(), 2);
        p.check_invariants().unwrap();
    }

    #[test]
    fn wrong_definition_punishes_peer() {
        let dir = tempfile::tempdir().unwrap();
        let peer = Hash256([4; 32]);
        let mut mock = permissive_mock();
        mock.expect_on_peer_misbehaved().with(eq(peer)).times(1).returning(|_| ());
        let mut p = processor(mock, &dir);

        let mut pool = TxPool::new();
        let mut t = p.generate_new_block(&mut pool, &kdf()).unwrap().unwrap();
        t.state.definition = Hash256([1; 32]);
        let id = t.state.id();
        assert_eq!(p.on_state(&t.state, Some(peer)).unwrap(), DataStatus::Accepted);
        assert_eq!(p.on_block(&id, encode(&t.body).unwrap(), None).unwrap(), DataStatus::Accepted);

        assert_eq!(p.cursor().row, None);
        assert!(p.utxos().is_empty());
        let row = p.db().find_state(&id).unwrap().unwrap();
        assert!(!p.db().get_row(row).unwrap().has(FUNCTIONAL));
        assert_eq!(p.db().body(row).unwrap(), None);
        p.check_invariants().unwrap();
    }

    #[test]
    fn wrong_difficulty_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = permissive_mock();
        mock.expect_on_peer_misbehaved().times(0);
        let mut p = processor(mock, &dir);
        let mut pool = TxPool::new();
        let mut t = p.generate_new_block(&mut pool, &kdf()).unwrap().unwrap();
        t.state.pow.difficulty = 3;
        let id = t.state.id();
        p.on_state(&t.state, None).unwrap();
        p.on_block(&id, encode(&t.body).unwrap(), None).unwrap();
        assert_eq!(p.cursor().row, None);
    }

    #[test]
    fn undecodable_body_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(Offline::default(), &dir);
        let mut pool = TxPool::new();
        let t = p.generate_new_block(&mut pool, &kdf()).unwrap().unwrap();
        let id = t.state.id();
        p.on_state(&t.state, None).unwrap();
        assert_eq!(p.on_block(&id, vec![0xff; 3], None).unwrap(), DataStatus::Accepted);
        assert_eq!(p.cursor().row, None);
        let row = p.db().find_state(&id).unwrap().unwrap();
        assert!(!p.db().get_row(row).unwrap().has(FUNCTIONAL));

        // The real body can still be delivered afterwards.
        assert_eq!(p.on_block(&id, encode(&t.body).unwrap(), None).unwrap(), DataStatus::Accepted);
        assert_eq!(p.cursor().id, id);
    }

    #[test]
    fn pool_transaction_mined_with_fee() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(Offline::default(), &dir);
        let mut pool = TxPool::new();
        mine(&mut p, &mut pool);

        let emission = p.rules().coinbase_emission;
        let coinbase_key = kdf().derive(HEIGHT_GENESIS, KeyType::Coinbase);
        let wallet = Kdf::from_seed([6; 32]);
        let tx = build_transaction(
            &[(coinbase_key, emission)],
            &[(wallet.derive_index(1), emission - 10)],
            &wallet.derive_index(2),
            10,
            HeightRange::UNBOUNDED,
        );
        let ctx = p.validate_tx(&tx).unwrap();
        assert_eq!(ctx.fee, 10);

        // Coinbase maturity 2: spendable from height 3.
        assert!(!p.validate_tx_context(&tx).unwrap());
        mine(&mut p, &mut pool);
        assert!(p.validate_tx_context(&tx).unwrap());

        pool.admit(tx.clone(), ctx, tx.key().unwrap()).unwrap();
        let t = p.generate_new_block(&mut pool, &kdf()).unwrap().unwrap();
        assert_eq!(t.fees, 10);
        assert_eq!(pool.len(), 1, "assembly leaves the pool alone");
        let id = t.state.id();
        p.on_state(&t.state, None).unwrap();
        p.on_block(&id, encode(&t.body).unwrap(), None).unwrap();
        assert_eq!(p.cursor().id, id);
        assert!(!p.validate_tx_context(&tx).unwrap(), "input already spent");
        p.check_invariants().unwrap();
    }

    #[test]
    fn congested_tip_requests_missing_body() {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        let mut source = processor(Offline::default(), &source_dir);
        let mut pool = TxPool::new();
        let a = mine(&mut source, &mut pool);
        let b = mine(&mut source, &mut pool);

        let peer = Hash256([8; 32]);
        let mut mock = permissive_mock();
        mock.expect_request_data()
            .with(eq(a), eq(true), eq(Some(peer)))
            .times(1)
            .returning(|_, _, _| ());
        let mut p = processor(mock, &dir);
        for id in [a, b] {
            let row = source.db().find_state(&id).unwrap().unwrap();
            let state = source.db().get_state(row).unwrap();
            p.on_state(&state, Some(peer)).unwrap();
        }
        p.enum_congestions().unwrap();
    }

    #[test]
    fn orphan_tip_requests_parent_header() {
        let dir = tempfile::tempdir().unwrap();
        let source_dir = tempfile::tempdir().unwrap();
        let mut source = processor(Offline::default(), &source_dir);
        let mut pool = TxPool::new();
        let a = mine(&mut source, &mut pool);
        let b = mine(&mut source, &mut pool);

        let mut mock = permissive_mock();
        mock.expect_request_data()
            .with(eq(a), eq(false), eq(None))
            .times(1)
            .returning(|_, _, _| ());
        let mut p = processor(mock, &dir);
        let row = source.db().find_state(&b).unwrap().unwrap();
        p.on_state(&source.db().get_state(row).unwrap(), None).unwrap();
        p.enum_congestions().unwrap();
    }

    #[test]
    fn history_proof_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(Offline::default(), &dir);
        let mut pool = TxPool::new();
        let ids: Vec<StateId> = (0..5).map(|_| mine(&mut p, &mut pool)).collect();
        assert!(p.history_proof(5).unwrap().is_none());
        let proof = p.history_proof(2).unwrap().unwrap();
        assert_eq!(proof.leaf, ids[1].hash);
        assert!(proof.verify(&p.cursor().history));
    }

    #[test]
    fn mined_rewards_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = processor(Offline::default(), &dir);
        let mut pool = TxPool::new();
        let id = mine(&mut p, &mut pool);
        assert!(p.record_mined(&id, 40).unwrap());
        assert_eq!(p.mined_since(0).unwrap(), vec![(id, 40)]);
        assert!(!p.record_mined(&StateId::default(), 1).unwrap());
    }
}
