//! RocksDB-backed chain database.
//!
//! Stores every known header as a row with its tree bookkeeping (successor
//! counters, flags, history MMR node), the block bodies and rollback data
//! of functional rows, the durable spendable set, mined rewards and
//! imported macroblocks. Column families are listed in [`ALL_CFS`].
//!
//! Writes are staged in memory and reach disk as one atomic [`WriteBatch`]
//! in [`ChainDb::commit`]. Every read and range scan sees staged writes, so
//! a logical step behaves like a transaction: commit it or throw it away
//! with [`ChainDb::rollback`].

use std::collections::BTreeMap;
use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, info};

use cinder_core::merkle::MerkleProof;
use cinder_core::mmr::{self, MmrError, MmrNode, MmrStore};
use cinder_core::rules::HEIGHT_GENESIS;
use cinder_core::tree::UtxoKey;
use cinder_core::types::{encode, Amount, AmountBig, Hash256, Height, Offset, PeerId, StateId, SystemState};

use crate::error::ChainError;

// --- Column family names ---

const CF_PARAMS: &str = "params";
const CF_STATES: &str = "states";
const CF_STATE_INDEX: &str = "state_index";
const CF_TIPS: &str = "tips";
const CF_TIPS_REACHABLE: &str = "tips_reachable";
const CF_BODIES: &str = "bodies";
const CF_ROLLBACK: &str = "rollback";
const CF_PEERS: &str = "peers";
const CF_SPENDABLE: &str = "spendable";
const CF_MINED: &str = "mined";
const CF_MACROBLOCKS: &str = "macroblocks";

/// All column family names.
pub const ALL_CFS: &[&str] = &[
    CF_PARAMS,
    CF_STATES,
    CF_STATE_INDEX,
    CF_TIPS,
    CF_TIPS_REACHABLE,
    CF_BODIES,
    CF_ROLLBACK,
    CF_PEERS,
    CF_SPENDABLE,
    CF_MINED,
    CF_MACROBLOCKS,
];

pub const SCHEMA_VERSION: u64 = 1;

/// Opaque handle of a stored header.
pub type RowId = u64;

/// Keys of the parameter table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    DbVer = 0,
    CursorRow = 1,
    CursorHeight = 2,
    /// Cumulative blinding offset of the active chain.
    StateExtra = 3,
    FossilHeight = 4,
    SubsidyLo = 5,
    SubsidyHi = 6,
    SubsidyOpen = 7,
    NextRow = 8,
}

/// Row flag bits.
pub mod state_flags {
    /// Body stored and not proven invalid.
    pub const FUNCTIONAL: u8 = 1;
    /// Functional, as is every ancestor down to genesis.
    pub const REACHABLE: u8 = 2;
    /// Part of the selected chain.
    pub const ACTIVE: u8 = 4;
}

use state_flags::{ACTIVE, FUNCTIONAL, REACHABLE};

/// One stored header with its tree bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct StateRow {
    pub state: SystemState,
    pub hash: Hash256,
    /// Row of the parent header, once known.
    pub prev: Option<RowId>,
    pub children: u32,
    pub functional_children: u32,
    pub flags: u8,
    /// Work of this header plus every stored ancestor.
    pub chain_work: u128,
    /// History node for leaf `height - HEIGHT_GENESIS - 1`, built once the
    /// row becomes reachable.
    pub mmr: Option<MmrNode<RowId>>,
}

impl StateRow {
    pub fn id(&self) -> StateId {
        StateId {
            height: self.state.height,
            hash: self.hash,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Key of the durable spendable set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpendableKey {
    Utxo(UtxoKey),
    Kernel(Hash256),
}

impl SpendableKey {
    const TAG_UTXO: u8 = 0;
    const TAG_KERNEL: u8 = 1;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + UtxoKey::SIZE);
        match self {
            SpendableKey::Utxo(k) => {
                out.push(Self::TAG_UTXO);
                out.extend_from_slice(&k.to_bytes());
            }
            SpendableKey::Kernel(id) => {
                out.push(Self::TAG_KERNEL);
                out.extend_from_slice(id.as_bytes());
            }
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let (tag, rest) = bytes.split_first()?;
        match *tag {
            Self::TAG_UTXO => UtxoKey::from_bytes(rest).map(SpendableKey::Utxo),
            Self::TAG_KERNEL => {
                let id: [u8; 32] = rest.try_into().ok()?;
                Some(SpendableKey::Kernel(Hash256(id)))
            }
            _ => None,
        }
    }
}

/// Value of the spendable set.
///
/// `refs` counts applied blocks still referencing the element (creation not
/// undone, spend not yet fossilized); `unspent` counts live instances.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SpendableEntry {
    pub refs: u32,
    pub unspent: u32,
    /// Encoded element data needed to rebuild or export it.
    pub body: Vec<u8>,
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8], what: &str) -> Result<T, ChainError> {
    let (value, _): (T, usize) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ChainError::Corrupted(format!("undecodable {what}: {e}")))?;
    Ok(value)
}

fn be_u64(bytes: &[u8], what: &str) -> Result<u64, ChainError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChainError::Corrupted(format!("bad {what} length: {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn row_key(row: RowId) -> Vec<u8> {
    row.to_be_bytes().to_vec()
}

fn height_row_key(height: Height, row: RowId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&row.to_be_bytes());
    key
}

fn work_row_key(work: u128, row: RowId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&work.to_be_bytes());
    key.extend_from_slice(&row.to_be_bytes());
    key
}

/// Expected hash attempts for a header of `difficulty` leading zero bits.
pub fn block_work(difficulty: u8) -> u128 {
    1u128.checked_shl(u32::from(difficulty)).unwrap_or(u128::MAX)
}

fn parse_height_row(key: &[u8]) -> Result<(Height, RowId), ChainError> {
    if key.len() != 16 {
        return Err(ChainError::Corrupted(format!("bad height/row key length: {}", key.len())));
    }
    Ok((be_u64(&key[..8], "height")?, be_u64(&key[8..], "row")?))
}

fn index_key(height: Height, hash: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash.as_bytes());
    key
}

type StagedKey = (&'static str, Vec<u8>);

/// RocksDB chain database with a staged write overlay.
pub struct ChainDb {
    db: DB,
    staged: BTreeMap<StagedKey, Option<Vec<u8>>>,
}

impl ChainDb {
    /// Open or create the database at `path` and check its schema version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ChainError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| ChainError::Storage(e.to_string()))?;

        let mut store = Self {
            db,
            staged: BTreeMap::new(),
        };

        match store.param_u64(ParamId::DbVer)? {
            None => {
                store.set_param_u64(ParamId::DbVer, SCHEMA_VERSION);
                store.commit()?;
                info!(version = SCHEMA_VERSION, "initialized chain database");
            }
            Some(found) if found != SCHEMA_VERSION => {
                return Err(ChainError::SchemaMismatch {
                    found,
                    expected: SCHEMA_VERSION,
                });
            }
            Some(_) => {}
        }
        Ok(store)
    }

    // ------------------------------------------------------------------
    // Staged overlay
    // ------------------------------------------------------------------

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, ChainError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ChainError::Storage(format!("missing column family: {name}")))
    }

    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        if let Some(staged) = self.staged.get(&(cf, key.to_vec())) {
            return Ok(staged.clone());
        }
        let handle = self.cf_handle(cf)?;
        self.db
            .get_cf(handle, key)
            .map_err(|e| ChainError::Storage(e.to_string()))
    }

    fn put(&mut self, cf: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert((cf, key), Some(value));
    }

    fn del(&mut self, cf: &'static str, key: Vec<u8>) {
        self.staged.insert((cf, key), None);
    }

    /// Ordered entries of `cf` with `lower <= key < upper`, staged writes
    /// applied.
    fn scan(
        &self,
        cf: &'static str,
        lower: &[u8],
        upper: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let handle = self.cf_handle(cf)?;
        let mut out = BTreeMap::new();
        for item in self
            .db
            .iterator_cf(handle, IteratorMode::From(lower, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| ChainError::Storage(e.to_string()))?;
            if upper.is_some_and(|u| &*key >= u) {
                break;
            }
            out.insert(key.to_vec(), value.to_vec());
        }
        for ((staged_cf, key), value) in self.staged.range((cf, lower.to_vec())..) {
            if *staged_cf != cf || upper.is_some_and(|u| key.as_slice() >= u) {
                break;
            }
            match value {
                Some(v) => out.insert(key.clone(), v.clone()),
                None => out.remove(key),
            };
        }
        Ok(out.into_iter().collect())
    }

    fn scan_height(&self, cf: &'static str, height: Height) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let lower = height.to_be_bytes();
        match height.checked_add(1) {
            Some(next) => self.scan(cf, &lower, Some(&next.to_be_bytes())),
            None => self.scan(cf, &lower, None),
        }
    }

    /// Write every staged change in one atomic batch.
    pub fn commit(&mut self) -> Result<(), ChainError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        for ((cf, key), value) in &self.staged {
            let handle = self.cf_handle(cf)?;
            match value {
                Some(v) => batch.put_cf(handle, key, v),
                None => batch.delete_cf(handle, key),
            }
        }
        self.db
            .write(batch)
            .map_err(|e| ChainError::Storage(e.to_string()))?;
        debug!(changes = self.staged.len(), "committed chain database batch");
        self.staged.clear();
        Ok(())
    }

    /// Discard every staged change.
    pub fn rollback(&mut self) {
        if !self.staged.is_empty() {
            debug!(changes = self.staged.len(), "discarded chain database batch");
        }
        self.staged.clear();
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn param_blob(&self, id: ParamId) -> Result<Option<Vec<u8>>, ChainError> {
        self.get(CF_PARAMS, &[id as u8])
    }

    pub fn set_param_blob(&mut self, id: ParamId, value: Vec<u8>) {
        self.put(CF_PARAMS, vec![id as u8], value);
    }

    pub fn delete_param(&mut self, id: ParamId) {
        self.del(CF_PARAMS, vec![id as u8]);
    }

    pub fn param_u64(&self, id: ParamId) -> Result<Option<u64>, ChainError> {
        self.param_blob(id)?
            .map(|b| be_u64(&b, "parameter"))
            .transpose()
    }

    pub fn set_param_u64(&mut self, id: ParamId, value: u64) {
        self.set_param_blob(id, value.to_be_bytes().to_vec());
    }

    /// Row of the cursor, `None` before the first block.
    pub fn cursor(&self) -> Result<Option<RowId>, ChainError> {
        self.param_u64(ParamId::CursorRow)
    }

    pub fn fossil_height(&self) -> Result<Height, ChainError> {
        Ok(self
            .param_u64(ParamId::FossilHeight)?
            .unwrap_or(HEIGHT_GENESIS - 1))
    }

    pub fn set_fossil_height(&mut self, height: Height) {
        self.set_param_u64(ParamId::FossilHeight, height);
    }

    /// Cumulative blinding offset of the active chain.
    pub fn offset(&self) -> Result<Offset, ChainError> {
        match self.param_blob(ParamId::StateExtra)? {
            None => Ok(Offset::ZERO),
            Some(b) => {
                let arr: [u8; 32] = b
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Corrupted("bad offset length".into()))?;
                Ok(Offset(arr))
            }
        }
    }

    pub fn set_offset(&mut self, offset: &Offset) {
        self.set_param_blob(ParamId::StateExtra, offset.0.to_vec());
    }

    /// Cumulative subsidy of the active chain.
    pub fn subsidy(&self) -> Result<AmountBig, ChainError> {
        let lo = self.param_u64(ParamId::SubsidyLo)?.unwrap_or(0);
        let hi = self.param_u64(ParamId::SubsidyHi)?.unwrap_or(0);
        Ok((AmountBig::from(hi) << 64) | AmountBig::from(lo))
    }

    pub fn set_subsidy(&mut self, subsidy: AmountBig) {
        self.set_param_u64(ParamId::SubsidyLo, subsidy as u64);
        self.set_param_u64(ParamId::SubsidyHi, (subsidy >> 64) as u64);
    }

    pub fn subsidy_open(&self) -> Result<bool, ChainError> {
        Ok(self.param_u64(ParamId::SubsidyOpen)?.is_none_or(|v| v != 0))
    }

    pub fn set_subsidy_open(&mut self, open: bool) {
        self.set_param_u64(ParamId::SubsidyOpen, u64::from(open));
    }

    fn next_row(&mut self) -> Result<RowId, ChainError> {
        let row = self.param_u64(ParamId::NextRow)?.unwrap_or(1);
        self.set_param_u64(ParamId::NextRow, row + 1);
        Ok(row)
    }

    // ------------------------------------------------------------------
    // Rows
    // ------------------------------------------------------------------

    pub fn get_row(&self, row: RowId) -> Result<StateRow, ChainError> {
        let bytes = self
            .get(CF_STATES, &row_key(row))?
            .ok_or_else(|| ChainError::Corrupted(format!("missing state row {row}")))?;
        decode(&bytes, "state row")
    }

    fn put_row(&mut self, row: RowId, value: &StateRow) -> Result<(), ChainError> {
        self.put(CF_STATES, row_key(row), encode(value)?);
        Ok(())
    }

    pub fn get_state(&self, row: RowId) -> Result<SystemState, ChainError> {
        Ok(self.get_row(row)?.state)
    }

    pub fn get_prev(&self, row: RowId) -> Result<Option<RowId>, ChainError> {
        Ok(self.get_row(row)?.prev)
    }

    pub fn find_state(&self, id: &StateId) -> Result<Option<RowId>, ChainError> {
        self.get(CF_STATE_INDEX, &index_key(id.height, &id.hash))?
            .map(|b| be_u64(&b, "row"))
            .transpose()
    }

    /// Rows at `height`, ordered by hash.
    pub fn enum_states_at(&self, height: Height) -> Result<Vec<(RowId, Hash256)>, ChainError> {
        self.scan_height(CF_STATE_INDEX, height)?
            .into_iter()
            .map(|(key, value)| {
                let hash: [u8; 32] = key[8..]
                    .try_into()
                    .map_err(|_| ChainError::Corrupted("bad state index key".into()))?;
                Ok((be_u64(&value, "row")?, Hash256(hash)))
            })
            .collect()
    }

    pub fn enum_children(&self, row: RowId) -> Result<Vec<RowId>, ChainError> {
        let height = self.get_row(row)?.state.height;
        let Some(next) = height.checked_add(1) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (child, _) in self.enum_states_at(next)? {
            if self.get_row(child)?.prev == Some(row) {
                out.push(child);
            }
        }
        Ok(out)
    }

    /// The active row at `height`, if any.
    pub fn find_active_at(&self, height: Height) -> Result<Option<RowId>, ChainError> {
        for (row, _) in self.enum_states_at(height)? {
            if self.get_row(row)?.has(ACTIVE) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Every stored row in row-id order.
    pub fn enum_rows(&self) -> Result<Vec<(RowId, StateRow)>, ChainError> {
        self.scan(CF_STATES, &[], None)?
            .into_iter()
            .map(|(key, value)| Ok((be_u64(&key, "row")?, decode(&value, "state row")?)))
            .collect()
    }

    /// Store a new header, linking it to a stored parent and to stored
    /// orphans that name it as their parent.
    pub fn insert_state(&mut self, state: &SystemState) -> Result<RowId, ChainError> {
        let id = state.id();
        if self.find_state(&id)?.is_some() {
            return Err(ChainError::Corrupted(format!("state {id} already stored")));
        }
        let row = self.next_row()?;

        let prev = if state.height > HEIGHT_GENESIS {
            self.find_state(&StateId {
                height: state.height - 1,
                hash: state.prev,
            })?
        } else {
            None
        };
        let base_work = match prev {
            Some(p) => self.get_row(p)?.chain_work,
            None => 0,
        };
        let chain_work = base_work.saturating_add(block_work(state.pow.difficulty));

        let mut children = 0;
        let mut functional_children = 0;
        let mut orphans = Vec::new();
        if let Some(next) = state.height.checked_add(1) {
            for (child, _) in self.enum_states_at(next)? {
                let mut c = self.get_row(child)?;
                if c.state.prev == id.hash {
                    c.prev = Some(row);
                    children += 1;
                    if c.has(FUNCTIONAL) {
                        functional_children += 1;
                    }
                    self.put_row(child, &c)?;
                    orphans.push(child);
                }
            }
        }

        if let Some(p) = prev {
            let mut parent = self.get_row(p)?;
            if parent.children == 0 {
                self.del(CF_TIPS, height_row_key(parent.state.height, p));
            }
            parent.children += 1;
            self.put_row(p, &parent)?;
        }
        if children == 0 {
            self.put(CF_TIPS, height_row_key(state.height, row), Vec::new());
        }

        let value = StateRow {
            state: state.clone(),
            hash: id.hash,
            prev,
            children,
            functional_children,
            flags: 0,
            chain_work,
            mmr: None,
        };
        self.put_row(row, &value)?;
        self.put(CF_STATE_INDEX, index_key(id.height, &id.hash), row_key(row));
        self.propagate_work(orphans, chain_work)?;
        debug!(%id, row, "state inserted");
        Ok(row)
    }

    /// Recompute the work of adopted orphan subtrees now that their root
    /// has a parent worth `base`.
    fn propagate_work(&mut self, roots: Vec<RowId>, base: u128) -> Result<(), ChainError> {
        let mut pending: Vec<(RowId, u128)> = roots.into_iter().map(|r| (r, base)).collect();
        while let Some((row, parent_work)) = pending.pop() {
            let mut value = self.get_row(row)?;
            value.chain_work = parent_work.saturating_add(block_work(value.state.pow.difficulty));
            self.put_row(row, &value)?;
            for child in self.enum_children(row)? {
                pending.push((child, value.chain_work));
            }
        }
        Ok(())
    }

    /// Delete a row with no successors that is not active. Returns `false`
    /// and changes nothing otherwise.
    pub fn delete_state(&mut self, row: RowId) -> Result<bool, ChainError> {
        let mut value = self.get_row(row)?;
        if value.children > 0 || value.has(ACTIVE) {
            return Ok(false);
        }
        if value.has(FUNCTIONAL) {
            self.set_not_functional(row)?;
            value = self.get_row(row)?;
        }
        let height = value.state.height;

        if let Some(p) = value.prev {
            let mut parent = self.get_row(p)?;
            parent.children = parent
                .children
                .checked_sub(1)
                .ok_or_else(|| ChainError::Corrupted(format!("row {p} successor underflow")))?;
            if parent.children == 0 {
                self.put(CF_TIPS, height_row_key(parent.state.height, p), Vec::new());
            }
            self.put_row(p, &parent)?;
        }

        self.del(CF_TIPS, height_row_key(height, row));
        self.del(CF_STATE_INDEX, index_key(height, &value.hash));
        self.del(CF_STATES, row_key(row));
        self.del(CF_BODIES, row_key(row));
        self.del(CF_ROLLBACK, row_key(row));
        self.del(CF_PEERS, row_key(row));
        self.del(CF_MACROBLOCKS, row_key(row));
        self.delete_mined_safe(row, height);
        debug!(id = %value.id(), row, "state deleted");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Functional / reachable
    // ------------------------------------------------------------------

    pub fn set_functional(&mut self, row: RowId) -> Result<(), ChainError> {
        let mut value = self.get_row(row)?;
        if value.has(FUNCTIONAL) {
            return Ok(());
        }
        value.flags |= FUNCTIONAL;
        self.put_row(row, &value)?;

        let reachable = match value.prev {
            Some(p) => {
                let mut parent = self.get_row(p)?;
                parent.functional_children += 1;
                let reachable = parent.has(REACHABLE);
                if reachable && parent.functional_children == 1 {
                    self.del(CF_TIPS_REACHABLE, work_row_key(parent.chain_work, p));
                }
                self.put_row(p, &parent)?;
                reachable
            }
            None => value.state.height == HEIGHT_GENESIS,
        };
        if reachable {
            self.flood_reachable(row, true)?;
        }
        Ok(())
    }

    pub fn set_not_functional(&mut self, row: RowId) -> Result<(), ChainError> {
        let mut value = self.get_row(row)?;
        if !value.has(FUNCTIONAL) {
            return Ok(());
        }
        value.flags &= !FUNCTIONAL;
        self.put_row(row, &value)?;

        if let Some(p) = value.prev {
            let mut parent = self.get_row(p)?;
            parent.functional_children = parent
                .functional_children
                .checked_sub(1)
                .ok_or_else(|| ChainError::Corrupted(format!("row {p} functional underflow")))?;
            if parent.functional_children == 0 && parent.has(REACHABLE) {
                self.put(CF_TIPS_REACHABLE, work_row_key(parent.chain_work, p), Vec::new());
            }
            self.put_row(p, &parent)?;
        }
        if value.has(REACHABLE) {
            self.flood_reachable(row, false)?;
        }
        Ok(())
    }

    /// Set or clear `Reachable` on `row` and every functional descendant,
    /// keeping the reachable-tip set at the frontier.
    fn flood_reachable(&mut self, row: RowId, set: bool) -> Result<(), ChainError> {
        let mut pending = vec![row];
        while let Some(row) = pending.pop() {
            let mut value = self.get_row(row)?;
            if set {
                value.flags |= REACHABLE;
            } else {
                value.flags &= !REACHABLE;
            }
            self.put_row(row, &value)?;
            if set {
                self.build_mmr(row)?;
            }

            let mut functional = Vec::new();
            for child in self.enum_children(row)? {
                if self.get_row(child)?.has(FUNCTIONAL) {
                    functional.push(child);
                }
            }
            if functional.is_empty() {
                let key = work_row_key(value.chain_work, row);
                if set {
                    self.put(CF_TIPS_REACHABLE, key, Vec::new());
                } else {
                    self.del(CF_TIPS_REACHABLE, key);
                }
            }
            pending.extend(functional);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------

    /// Mark `row` active and make it the cursor.
    pub fn move_fwd(&mut self, row: RowId) -> Result<(), ChainError> {
        let mut value = self.get_row(row)?;
        value.flags |= ACTIVE;
        self.put_row(row, &value)?;
        self.set_param_u64(ParamId::CursorRow, row);
        self.set_param_u64(ParamId::CursorHeight, value.state.height);
        Ok(())
    }

    /// Deactivate the cursor row and move the cursor to its parent.
    pub fn move_back(&mut self) -> Result<(), ChainError> {
        let row = self
            .cursor()?
            .ok_or_else(|| ChainError::Corrupted("move back without a cursor".into()))?;
        let mut value = self.get_row(row)?;
        value.flags &= !ACTIVE;
        self.put_row(row, &value)?;
        match value.prev {
            Some(p) => {
                self.set_param_u64(ParamId::CursorRow, p);
                self.set_param_u64(ParamId::CursorHeight, value.state.height - 1);
            }
            None => {
                self.delete_param(ParamId::CursorRow);
                self.set_param_u64(ParamId::CursorHeight, HEIGHT_GENESIS - 1);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tips
    // ------------------------------------------------------------------

    /// Rows without successors, lowest first.
    pub fn enum_tips(&self) -> Result<Vec<(Height, RowId)>, ChainError> {
        self.scan(CF_TIPS, &[], None)?
            .iter()
            .map(|(key, _)| parse_height_row(key))
            .collect()
    }

    /// Reachable rows without functional successors as `(chain work, row)`,
    /// most work first.
    pub fn enum_functional_tips(&self) -> Result<Vec<(u128, RowId)>, ChainError> {
        let mut tips = self
            .scan(CF_TIPS_REACHABLE, &[], None)?
            .iter()
            .map(|(key, _)| {
                if key.len() != 24 {
                    return Err(ChainError::Corrupted("bad reachable tip key".into()));
                }
                let work: [u8; 16] = key[..16]
                    .try_into()
                    .map_err(|_| ChainError::Corrupted("bad reachable tip key".into()))?;
                Ok((u128::from_be_bytes(work), be_u64(&key[16..], "row")?))
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        tips.reverse();
        Ok(tips)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Append the parent hash to the history MMR ending at the parent.
    pub fn build_mmr(&mut self, row: RowId) -> Result<(), ChainError> {
        let mut value = self.get_row(row)?;
        if value.mmr.is_some() || value.state.height <= HEIGHT_GENESIS {
            return Ok(());
        }
        let prev = value
            .prev
            .ok_or_else(|| ChainError::Corrupted(format!("row {row} has no parent")))?;
        let parent = self.get_row(prev)?;
        let last = (parent.state.height > HEIGHT_GENESIS).then_some(prev);
        let node = mmr::append(&*self, last, value.state.height - HEIGHT_GENESIS - 1, &parent.hash)?;
        value.mmr = Some(node);
        self.put_row(row, &value)
    }

    /// Root over the hashes of every ancestor of `row`.
    pub fn history(&self, row: RowId) -> Result<Hash256, ChainError> {
        let value = self.get_row(row)?;
        match &value.mmr {
            Some(node) => mmr::root(self, node),
            None if value.state.height == HEIGHT_GENESIS => Ok(Hash256::ZERO),
            None => Err(ChainError::Corrupted(format!("row {row} has no history node"))),
        }
    }

    /// History root once `row` itself is appended.
    pub fn predicted_history(&self, row: RowId) -> Result<Hash256, ChainError> {
        let value = self.get_row(row)?;
        let last = (value.state.height > HEIGHT_GENESIS).then_some(row);
        mmr::predicted_root(self, last, value.state.height - HEIGHT_GENESIS, &value.hash)
    }

    /// Proof that the ancestor of `row` at `height` is part of
    /// [`history`](Self::history)`(row)`.
    pub fn get_proof(&self, row: RowId, height: Height) -> Result<MerkleProof, ChainError> {
        let value = self.get_row(row)?;
        let count = value.state.height.saturating_sub(HEIGHT_GENESIS);
        if height < HEIGHT_GENESIS || height >= value.state.height {
            return Err(MmrError::OutOfRange {
                index: height.saturating_sub(HEIGHT_GENESIS),
                count,
            }
            .into());
        }
        let mut ancestor = value.clone();
        while ancestor.state.height > height {
            let prev = ancestor
                .prev
                .ok_or_else(|| ChainError::Corrupted(format!("broken ancestry below {}", ancestor.id())))?;
            ancestor = self.get_row(prev)?;
        }
        mmr::proof(self, row, count, height - HEIGHT_GENESIS, ancestor.hash)
    }

    // ------------------------------------------------------------------
    // Bodies, rollback data, peers
    // ------------------------------------------------------------------

    pub fn set_body(&mut self, row: RowId, body: Vec<u8>) {
        self.put(CF_BODIES, row_key(row), body);
    }

    pub fn body(&self, row: RowId) -> Result<Option<Vec<u8>>, ChainError> {
        self.get(CF_BODIES, &row_key(row))
    }

    pub fn set_rollback(&mut self, row: RowId, data: Vec<u8>) {
        self.put(CF_ROLLBACK, row_key(row), data);
    }

    pub fn rollback_data(&self, row: RowId) -> Result<Option<Vec<u8>>, ChainError> {
        self.get(CF_ROLLBACK, &row_key(row))
    }

    /// Drop both the body and the rollback data.
    pub fn delete_body(&mut self, row: RowId) {
        self.del(CF_BODIES, row_key(row));
        self.del(CF_ROLLBACK, row_key(row));
    }

    pub fn set_peer(&mut self, row: RowId, peer: Option<PeerId>) {
        match peer {
            Some(p) => self.put(CF_PEERS, row_key(row), p.0.to_vec()),
            None => self.del(CF_PEERS, row_key(row)),
        }
    }

    pub fn peer(&self, row: RowId) -> Result<Option<PeerId>, ChainError> {
        match self.get(CF_PEERS, &row_key(row))? {
            None => Ok(None),
            Some(b) => {
                let arr: [u8; 32] = b
                    .as_slice()
                    .try_into()
                    .map_err(|_| ChainError::Corrupted("bad peer id length".into()))?;
                Ok(Some(Hash256(arr)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Spendable set
    // ------------------------------------------------------------------

    pub fn spendable(&self, key: &SpendableKey) -> Result<Option<SpendableEntry>, ChainError> {
        self.get(CF_SPENDABLE, &key.to_bytes())?
            .map(|b| decode(&b, "spendable entry"))
            .transpose()
    }

    /// Insert a spendable element, or add to the counters if present.
    pub fn add_spendable(
        &mut self,
        key: &SpendableKey,
        body: Vec<u8>,
        refs: u32,
        unspent: u32,
    ) -> Result<(), ChainError> {
        let entry = match self.spendable(key)? {
            Some(mut e) => {
                e.refs += refs;
                e.unspent += unspent;
                e
            }
            None => SpendableEntry { refs, unspent, body },
        };
        self.put(CF_SPENDABLE, key.to_bytes(), encode(&entry)?);
        Ok(())
    }

    /// Adjust both counters. The entry is deleted once a negative reference
    /// delta brings `refs` to zero.
    pub fn modify_spendable(
        &mut self,
        key: &SpendableKey,
        refs_delta: i32,
        unspent_delta: i32,
    ) -> Result<(), ChainError> {
        let mut entry = self
            .spendable(key)?
            .ok_or_else(|| ChainError::Corrupted(format!("missing spendable {key:?}")))?;
        entry.refs = entry
            .refs
            .checked_add_signed(refs_delta)
            .ok_or_else(|| ChainError::Corrupted(format!("spendable refs out of range {key:?}")))?;
        entry.unspent = entry
            .unspent
            .checked_add_signed(unspent_delta)
            .ok_or_else(|| ChainError::Corrupted(format!("spendable count out of range {key:?}")))?;

        if refs_delta < 0 && entry.refs == 0 {
            self.del(CF_SPENDABLE, key.to_bytes());
        } else {
            self.put(CF_SPENDABLE, key.to_bytes(), encode(&entry)?);
        }
        Ok(())
    }

    /// Every referenced element, spent or not.
    pub fn enum_spendable(&self) -> Result<Vec<(SpendableKey, SpendableEntry)>, ChainError> {
        let mut out = Vec::new();
        for (key, value) in self.scan(CF_SPENDABLE, &[], None)? {
            let key = SpendableKey::from_bytes(&key)
                .ok_or_else(|| ChainError::Corrupted("bad spendable key".into()))?;
            out.push((key, decode(&value, "spendable entry")?));
        }
        Ok(out)
    }

    /// Every element with at least one live instance.
    pub fn enum_unspent(&self) -> Result<Vec<(SpendableKey, SpendableEntry)>, ChainError> {
        let mut out = self.enum_spendable()?;
        out.retain(|(_, entry)| entry.unspent > 0);
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Mined rewards
    // ------------------------------------------------------------------

    pub fn set_mined(&mut self, row: RowId, amount: Amount) -> Result<(), ChainError> {
        let height = self.get_row(row)?.state.height;
        self.put(CF_MINED, height_row_key(height, row), amount.to_be_bytes().to_vec());
        Ok(())
    }

    pub fn delete_mined_safe(&mut self, row: RowId, height: Height) {
        self.del(CF_MINED, height_row_key(height, row));
    }

    /// Mined rewards at or above `min_height`, lowest first.
    pub fn enum_mined(&self, min_height: Height) -> Result<Vec<(StateId, Amount)>, ChainError> {
        let mut out = Vec::new();
        for (key, value) in self.scan(CF_MINED, &min_height.to_be_bytes(), None)? {
            let (_, row) = parse_height_row(&key)?;
            out.push((self.get_row(row)?.id(), be_u64(&value, "mined amount")?));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Macroblocks
    // ------------------------------------------------------------------

    pub fn macroblock_insert(&mut self, row: RowId) -> Result<(), ChainError> {
        let height = self.get_row(row)?.state.height;
        self.put(CF_MACROBLOCKS, row_key(row), height.to_be_bytes().to_vec());
        Ok(())
    }

    pub fn macroblock_delete(&mut self, row: RowId) {
        self.del(CF_MACROBLOCKS, row_key(row));
    }

    /// Last rows of imported macroblocks, highest first.
    pub fn enum_macroblocks(&self) -> Result<Vec<(Height, RowId)>, ChainError> {
        let mut out = self
            .scan(CF_MACROBLOCKS, &[], None)?
            .into_iter()
            .map(|(key, value)| Ok((be_u64(&value, "height")?, be_u64(&key, "row")?)))
            .collect::<Result<Vec<_>, ChainError>>()?;
        out.sort_unstable_by(|a, b| b.cmp(a));
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Full scan of the row graph against its cached bookkeeping.
    pub fn check_invariants(&self) -> Result<(), ChainError> {
        let rows: BTreeMap<RowId, StateRow> = self.enum_rows()?.into_iter().collect();
        let tips: std::collections::BTreeSet<(Height, RowId)> =
            self.enum_tips()?.into_iter().collect();
        let reachable_tips: std::collections::BTreeSet<(u128, RowId)> =
            self.enum_functional_tips()?.into_iter().collect();
        let fail = |msg: String| Err(ChainError::Corrupted(msg));

        let mut children: BTreeMap<RowId, (u32, u32)> = BTreeMap::new();
        for value in rows.values() {
            if let Some(p) = value.prev {
                let Some(parent) = rows.get(&p) else {
                    return fail(format!("{} links to missing row {p}", value.id()));
                };
                if parent.hash != value.state.prev || parent.state.height + 1 != value.state.height {
                    return fail(format!("{} links to a row that is not its parent", value.id()));
                }
                let c = children.entry(p).or_default();
                c.0 += 1;
                if value.has(FUNCTIONAL) {
                    c.1 += 1;
                }
            }
        }

        let mut active_heights = std::collections::BTreeSet::new();
        for (&row, value) in &rows {
            let id = value.id();
            let (n, f) = children.get(&row).copied().unwrap_or_default();
            if value.children != n || value.functional_children != f {
                return fail(format!(
                    "{id}: counters {}/{} but {n}/{f} successors",
                    value.children, value.functional_children
                ));
            }
            if tips.contains(&(id.height, row)) != (n == 0) {
                return fail(format!("{id}: tip set disagrees with {n} successors"));
            }

            let mut reachable = true;
            let mut walk = value;
            loop {
                if !walk.has(FUNCTIONAL) {
                    reachable = false;
                    break;
                }
                match walk.prev {
                    Some(p) => match rows.get(&p) {
                        Some(parent) => walk = parent,
                        None => {
                            reachable = false;
                            break;
                        }
                    },
                    None => {
                        reachable = walk.state.height == HEIGHT_GENESIS;
                        break;
                    }
                }
            }
            if value.has(REACHABLE) != reachable {
                return fail(format!("{id}: reachable flag is {} but ancestry says {reachable}", value.has(REACHABLE)));
            }
            let base = value
                .prev
                .and_then(|p| rows.get(&p))
                .map_or(0, |parent| parent.chain_work);
            if value.chain_work != base.saturating_add(block_work(value.state.pow.difficulty)) {
                return fail(format!("{id}: chain work {} out of date", value.chain_work));
            }
            if reachable_tips.contains(&(value.chain_work, row)) != (reachable && f == 0) {
                return fail(format!("{id}: reachable tip set disagrees"));
            }
            if reachable && id.height > HEIGHT_GENESIS && value.mmr.is_none() {
                return fail(format!("{id}: reachable without a history node"));
            }
            if value.has(ACTIVE) {
                if !reachable {
                    return fail(format!("{id}: active but not reachable"));
                }
                if !active_heights.insert(id.height) {
                    return fail(format!("more than one active row at height {}", id.height));
                }
            }
        }

        for row in tips.iter().map(|t| t.1).chain(reachable_tips.iter().map(|t| t.1)) {
            if !rows.contains_key(&row) {
                return fail(format!("tip row {row} has no row"));
            }
        }
        Ok(())
    }
}

impl MmrStore for ChainDb {
    type Key = RowId;
    type Error = ChainError;

    fn load(&self, key: RowId) -> Result<MmrNode<RowId>, ChainError> {
        self.get_row(key)?
            .mmr
            .ok_or_else(|| ChainError::Corrupted(format!("row {key} has no history node")))
    }
}
