//! The supervisor that owns the block files, the header graph, the watched
//! address filter, and the scan pipeline.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crossbeam_channel::{bounded, Receiver};
use scrydb_consensus::{ChainParams, Hash256};
use scrydb_log::{log_info, log_warn};
use scrydb_primitives::block::BlockHeader;
use scrydb_primitives::encoding::{DecodeError, Decoder};
use scrydb_primitives::hash::sha256d;
use scrydb_primitives::transaction::TxLayout;
use scrydb_primitives::HEADER_SIZE;
use scrydb_script::ScriptAddr;
use scrydb_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockfiles::{BlockFileError, BlockFileSet};
use crate::chain::{Blockchain, ChainError, ReorganizationState};
use crate::headers::{self, IngestError};
use crate::records::{
    parse_hgtx_key, DbType, Spentness, StoredDbInfo, StoredScriptHistory, StoredSubSsh,
    StoredTxOut, TxIoKey, DB_INFO_KEY,
};
use crate::scanner::{BlockScanner, ScanConfig, ScanError};
use crate::scraddr::{FilterHooks, ScrAddrFilter};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BdmState {
    Offline,
    Initializing,
    Ready,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitMode {
    Normal,
    Rescan,
    Rebuild,
    RescanBalances,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResetMode {
    Ssh,
    Rescan,
    Rebuild,
}

#[derive(Debug)]
pub enum BdmError {
    Config(String),
    Store(StoreError),
    Ingest(IngestError),
    Scan(ScanError),
    Chain(ChainError),
    BlockFile(BlockFileError),
    Decode(DecodeError),
    CheckFailed { height: u32, reason: &'static str },
}

impl std::fmt::Display for BdmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BdmError::Config(message) => write!(f, "{message}"),
            BdmError::Store(err) => write!(f, "{err}"),
            BdmError::Ingest(err) => write!(f, "{err}"),
            BdmError::Scan(err) => write!(f, "{err}"),
            BdmError::Chain(err) => write!(f, "{err}"),
            BdmError::BlockFile(err) => write!(f, "{err}"),
            BdmError::Decode(err) => write!(f, "{err}"),
            BdmError::CheckFailed { height, reason } => {
                write!(f, "chain check failed at height {height}: {reason}")
            }
        }
    }
}

impl std::error::Error for BdmError {}

impl From<StoreError> for BdmError {
    fn from(err: StoreError) -> Self {
        BdmError::Store(err)
    }
}

impl From<IngestError> for BdmError {
    fn from(err: IngestError) -> Self {
        BdmError::Ingest(err)
    }
}

impl From<ScanError> for BdmError {
    fn from(err: ScanError) -> Self {
        BdmError::Scan(err)
    }
}

impl From<ChainError> for BdmError {
    fn from(err: ChainError) -> Self {
        BdmError::Chain(err)
    }
}

impl From<BlockFileError> for BdmError {
    fn from(err: BlockFileError) -> Self {
        BdmError::BlockFile(err)
    }
}

impl From<DecodeError> for BdmError {
    fn from(err: DecodeError) -> Self {
        BdmError::Decode(err)
    }
}

fn scan_error(err: BdmError) -> ScanError {
    match err {
        BdmError::Scan(err) => err,
        BdmError::Store(err) => ScanError::Store(err),
        other => ScanError::Store(StoreError::Backend(other.to_string())),
    }
}

#[derive(Clone, Debug)]
pub struct BdmConfig {
    pub params: ChainParams,
    pub genesis: BlockHeader,
    pub db_type: DbType,
    pub thread_count: usize,
    pub ram_usage: u32,
    pub spawn_id: String,
    pub check_chain: bool,
}

pub struct BlockDataManager<S> {
    config: BdmConfig,
    store: Arc<S>,
    // lock order: chain before files, always
    chain: RwLock<Blockchain>,
    files: Mutex<BlockFileSet>,
    filter: Arc<ScrAddrFilter>,
    state: Mutex<BdmState>,
    shutdown: AtomicBool,
    checked_tx_count: AtomicU64,
}

impl<S: KeyValueStore + 'static> BlockDataManager<S> {
    pub fn new(config: BdmConfig, store: Arc<S>, blk_dir: impl Into<PathBuf>) -> Self {
        let files = BlockFileSet::new(blk_dir, config.params.magic);
        let chain = Blockchain::new(config.genesis);
        Self {
            config,
            store,
            chain: RwLock::new(chain),
            files: Mutex::new(files),
            filter: Arc::new(ScrAddrFilter::new()),
            state: Mutex::new(BdmState::Offline),
            shutdown: AtomicBool::new(false),
            checked_tx_count: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BdmState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: BdmState) {
        *self.state.lock().expect("state lock") = state;
    }

    pub fn filter(&self) -> &ScrAddrFilter {
        &self.filter
    }

    pub fn top(&self) -> (u32, Hash256) {
        let chain = self.chain.read().expect("chain lock");
        let top = chain.top();
        (top.height, top.hash)
    }

    pub fn checked_tx_count(&self) -> u64 {
        self.checked_tx_count.load(Ordering::Relaxed)
    }

    /// Authorized shutdown: the caller must present the spawn id the
    /// process was started with. An empty spawn id disables this entirely.
    pub fn request_shutdown(&self, token: &str) -> bool {
        if self.config.spawn_id.is_empty() || token != self.config.spawn_id {
            return false;
        }
        self.shutdown.store(true, Ordering::Relaxed);
        true
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Brings the index to `Ready`: database bootstrap, header ingest, and
    /// the initial scan appropriate for `mode`.
    pub fn init(&self, mode: InitMode) -> Result<(), BdmError> {
        self.set_state(BdmState::Initializing);
        log_info!("initializing ({mode:?}), network {}", self.config.params.network.as_str());

        self.open_databases()?;
        match mode {
            InitMode::Normal => {}
            InitMode::Rescan => self.reset_databases(ResetMode::Rescan)?,
            InitMode::Rebuild => self.reset_databases(ResetMode::Rebuild)?,
            InitMode::RescanBalances => self.reset_databases(ResetMode::Ssh)?,
        }

        {
            let mut chain = self.chain.write().expect("chain lock");
            headers::load_chain(self.store.as_ref(), &mut chain)?;
        }
        self.filter.load(self.store.as_ref())?;

        self.ingest_headers()?;

        match mode {
            InitMode::RescanBalances => {
                // aggregates only; block data is untouched
                self.update_ssh()?;
            }
            _ => {
                let top_scanned = self.top_scanned()?;
                let start = match mode {
                    InitMode::Rescan | InitMode::Rebuild => 0,
                    _ => {
                        let resume = top_scanned.unwrap_or(0);
                        let min_sync = self.filter.min_sync_height().unwrap_or(resume);
                        min_sync.max(resume)
                    }
                };
                self.scan_with_retry(start)?;
                self.update_ssh()?;
            }
        }

        if self.config.check_chain {
            let count = self.run_check_chain()?;
            log_info!("chain check passed, {count} transactions verified");
        }

        self.set_state(BdmState::Ready);
        log_info!("ready at height {}", self.top().0);
        Ok(())
    }

    /// Re-detects block files, ingests new headers, and scans the new
    /// tail. On a reorganization the scan restarts above the branch point.
    pub fn update(&self) -> Result<ReorganizationState, BdmError> {
        let outcome = self.ingest_headers()?;
        let reorg = outcome.reorg;

        if let Some(branch) = reorg.reorg_branch_point {
            log_warn!("reorganization branching at height {branch}");
        }

        let top_scanned = self.top_scanned()?;
        let start = match reorg.reorg_branch_point {
            Some(branch) => branch + 1,
            None => match top_scanned {
                Some(height) => height + 1,
                None => 0,
            },
        };

        let top = self.top().0;
        if start <= top {
            self.scan_with_retry(start)?;
            self.update_ssh()?;
        }

        Ok(reorg)
    }

    fn ingest_headers(&self) -> Result<headers::IngestOutcome, BdmError> {
        let mut chain = self.chain.write().expect("chain lock");
        let mut files = self.files.lock().expect("files lock");
        files.detect()?;
        let outcome = headers::ingest(&files, &mut chain)?;
        headers::persist_chain(self.store.as_ref(), &mut chain)?;
        Ok(outcome)
    }

    /// Seeds or verifies each sub-database's info record. A magic mismatch
    /// is a wrong-network database; a db-type mismatch keeps the stored
    /// type (the type is fixed at first build).
    fn open_databases(&self) -> Result<(), BdmError> {
        let mut batch = WriteBatch::new();
        for column in Column::ALL {
            match self.store.get(column, &DB_INFO_KEY)? {
                None => {
                    let info = StoredDbInfo::fresh(self.config.params.magic, self.config.db_type);
                    batch.put(column, DB_INFO_KEY, info.encode());
                }
                Some(bytes) => {
                    let info = StoredDbInfo::decode(&bytes)?;
                    if info.magic != self.config.params.magic {
                        return Err(BdmError::Config(format!(
                            "database {} belongs to another network",
                            column.as_str()
                        )));
                    }
                    if info.db_type != self.config.db_type {
                        log_warn!(
                            "database {} was built as {:?}; keeping that type",
                            column.as_str(),
                            info.db_type
                        );
                    }
                }
            }
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Clears index state per `mode`. The watched address list survives
    /// every mode and is re-applied afterwards.
    pub fn reset_databases(&self, mode: ResetMode) -> Result<(), BdmError> {
        // pull the address list before wiping anything
        self.filter.load(self.store.as_ref())?;

        match mode {
            ResetMode::Ssh => {
                self.store.clear_column(Column::Ssh)?;
            }
            ResetMode::Rescan => {
                for column in [
                    Column::History,
                    Column::Stxo,
                    Column::TxHints,
                    Column::Ssh,
                    Column::SubSsh,
                    Column::Spentness,
                ] {
                    self.store.clear_column(column)?;
                }
                self.filter.reset_sync_heights();
            }
            ResetMode::Rebuild => {
                for column in Column::ALL {
                    self.store.clear_column(column)?;
                }
                self.chain.write().expect("chain lock").clear();
                self.filter.reset_sync_heights();
            }
        }

        self.open_databases()?;
        self.filter.reapply(self.store.as_ref())?;
        Ok(())
    }

    /// Height the index is scanned to, if the recorded resume point is
    /// still a known header.
    fn top_scanned(&self) -> Result<Option<u32>, BdmError> {
        let info = headers::read_db_info(self.store.as_ref(), Column::History)?;
        if info.top_hash == [0u8; 32] {
            return Ok(None);
        }
        let chain = self.chain.read().expect("chain lock");
        Ok(chain.get_by_hash(&info.top_hash).map(|node| node.height))
    }

    fn run_scan(&self, from: u32) -> Result<Option<(u32, Hash256)>, BdmError> {
        let chain = self.chain.read().expect("chain lock");
        let files = self.files.lock().expect("files lock");
        let scanner = BlockScanner::new(
            &chain,
            &files,
            self.store.as_ref(),
            &self.filter,
            &self.config.params,
            ScanConfig {
                thread_count: self.config.thread_count.max(1),
                files_per_batch: self.config.ram_usage.max(1),
            },
            &self.shutdown,
        );
        Ok(scanner.scan(from)?)
    }

    /// One retry covers both transient store failures and a chain that
    /// moved mid-scan (reorganize first, then resume).
    fn scan_with_retry(&self, from: u32) -> Result<(), BdmError> {
        match self.run_scan(from) {
            Ok(_) => Ok(()),
            Err(BdmError::Scan(ScanError::ChainMoved { height })) => {
                log_warn!("chain moved near height {height} during scan, reorganizing");
                self.chain.write().expect("chain lock").organize();
                let resume = self.top_scanned()?.map(|h| h + 1).unwrap_or(from);
                self.run_scan(resume.min(from))?;
                Ok(())
            }
            Err(BdmError::Scan(ScanError::Store(err))) => {
                log_warn!("scan batch failed to commit ({err}), retrying once");
                self.run_scan(from)?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Folds each watched address's canonical sub-histories into its
    /// summary row. Orphaned slices (wrong dup) stop counting here, which
    /// is what makes balances follow a reorganization.
    pub fn update_ssh(&self) -> Result<(), BdmError> {
        let chain = self.chain.read().expect("chain lock");
        let scanned = {
            let info = headers::read_db_info(self.store.as_ref(), Column::History)?;
            if info.top_hash == [0u8; 32] {
                0
            } else {
                chain
                    .get_by_hash(&info.top_hash)
                    .map(|node| node.height)
                    .unwrap_or(0)
            }
        };

        let mut batch = WriteBatch::new();
        for addr in self.filter.addresses() {
            let mut balance = 0i64;
            let mut txio_count = 0u64;
            for (key, value) in self.store.scan_prefix(Column::History, &addr)? {
                let Some((height, dup)) = parse_hgtx_key(&key[addr.len()..]) else {
                    continue;
                };
                if chain.canonical_dup(height) != Some(dup) {
                    continue;
                }
                let subssh = StoredSubSsh::decode(&value)?;
                for pair in subssh.txios.values() {
                    txio_count += 1;
                    if pair.txin_key.is_some() {
                        balance -= pair.value;
                    } else {
                        balance += pair.value;
                    }
                }
            }
            let summary = StoredScriptHistory {
                sync_height: scanned,
                txio_count,
                balance,
            };
            batch.put(Column::Ssh, addr, summary.encode());
        }
        drop(chain);
        self.store.write_batch(&batch)?;
        self.filter.set_all_synced(scanned);
        Ok(())
    }

    /// Confirmed balance of one watched address.
    pub fn balance(&self, addr: &ScriptAddr) -> Result<i64, BdmError> {
        match self.store.get(Column::Ssh, addr)? {
            Some(bytes) => Ok(StoredScriptHistory::decode(&bytes)?.balance),
            None => Ok(0),
        }
    }

    /// Unspent watched outputs of one address on the best chain.
    pub fn unspent_outputs(&self, addr: &ScriptAddr) -> Result<Vec<StoredTxOut>, BdmError> {
        let chain = self.chain.read().expect("chain lock");
        let mut receives: BTreeSet<TxIoKey> = BTreeSet::new();
        let mut spends: BTreeSet<TxIoKey> = BTreeSet::new();

        for (key, value) in self.store.scan_prefix(Column::History, addr)? {
            let Some((height, dup)) = parse_hgtx_key(&key[addr.len()..]) else {
                continue;
            };
            if chain.canonical_dup(height) != Some(dup) {
                continue;
            }
            let subssh = StoredSubSsh::decode(&value)?;
            for pair in subssh.txios.values() {
                if pair.txin_key.is_some() {
                    spends.insert(pair.txout_key);
                } else {
                    receives.insert(pair.txout_key);
                }
            }
        }

        let mut outputs = Vec::new();
        for key in receives.difference(&spends) {
            if let Some(bytes) = self.store.get(Column::Stxo, key.as_bytes())? {
                let stxo = StoredTxOut::decode(&bytes)?;
                outputs.push(stxo);
            }
        }
        Ok(outputs)
    }

    /// Spentness of one stored output, reorg-aware.
    pub fn output_spentness(&self, key: &TxIoKey) -> Result<Option<Spentness>, BdmError> {
        let Some(bytes) = self.store.get(Column::Stxo, key.as_bytes())? else {
            return Ok(None);
        };
        let stxo = StoredTxOut::decode(&bytes)?;
        match stxo.spentness {
            Spentness::Unspent => Ok(Some(Spentness::Unspent)),
            Spentness::Spent(txin) => {
                let chain = self.chain.read().expect("chain lock");
                if chain.canonical_dup(txin.height()) == Some(txin.dup()) {
                    Ok(Some(Spentness::Spent(txin)))
                } else {
                    Ok(Some(Spentness::Unspent))
                }
            }
        }
    }

    /// Registers addresses with the filter; the receiver fires once any
    /// required side scan has committed.
    pub fn register_address_batch(
        self: &Arc<Self>,
        addrs: Vec<ScriptAddr>,
        is_new: bool,
    ) -> Receiver<bool> {
        let (tx, rx) = bounded(1);
        let hooks: Arc<dyn FilterHooks> = Arc::new(BdmFilterHooks(Arc::downgrade(self)));
        let store: Arc<dyn KeyValueStore> = self.store.clone();
        if let Err(err) = self
            .filter
            .clone()
            .register_batch(store, hooks, addrs, is_new, tx)
        {
            log_warn!("address registration failed: {err}");
        }
        rx
    }

    /// Walks the best chain verifying each stored position yields the
    /// block it claims, parsing every transaction. Returns the tx count.
    pub fn run_check_chain(&self) -> Result<u64, BdmError> {
        let chain = self.chain.read().expect("chain lock");
        let files = self.files.lock().expect("files lock");
        let top = chain.top_height();

        let mut count = 0u64;
        let mut mapped: Option<(u32, Arc<crate::blockfiles::MappedFile>)> = None;

        for height in 0..=top {
            let node = chain
                .get_by_height(height)
                .ok_or(ChainError::UnknownHeight(height))?;
            let Some(position) = node.position else {
                return Err(BdmError::CheckFailed {
                    height,
                    reason: "missing file position",
                });
            };

            let map = match &mapped {
                Some((file_num, map)) if *file_num == position.file_num => Arc::clone(map),
                _ => {
                    let map = files.map(position.file_num)?;
                    mapped = Some((position.file_num, Arc::clone(&map)));
                    map
                }
            };

            let body_start = position.offset as usize + 8;
            let body_end = body_start + node.block_size as usize;
            if body_end > map.bytes().len() {
                return Err(BdmError::CheckFailed {
                    height,
                    reason: "block overruns its file",
                });
            }
            let body = &map.bytes()[body_start..body_end];
            if sha256d(&body[..HEADER_SIZE]) != node.hash {
                return Err(BdmError::CheckFailed {
                    height,
                    reason: "header hash mismatch",
                });
            }

            let mut decoder = Decoder::new(body);
            decoder.skip(HEADER_SIZE)?;
            let num_tx = decoder.read_varint()?;
            for _ in 0..num_tx {
                TxLayout::parse(&mut decoder)?;
            }
            count += num_tx;
        }

        self.checked_tx_count.store(count, Ordering::Relaxed);
        Ok(count)
    }
}

/// The filter's capability handle into the supervisor.
struct BdmFilterHooks<S>(Weak<BlockDataManager<S>>);

impl<S: KeyValueStore + 'static> FilterHooks for BdmFilterHooks<S> {
    fn is_running(&self) -> bool {
        match self.0.upgrade() {
            Some(manager) => manager.state() != BdmState::Offline,
            None => false,
        }
    }

    fn apply_block_range(&self, start: u32, _end: u32) -> Result<Hash256, ScanError> {
        let manager = self
            .0
            .upgrade()
            .ok_or_else(|| ScanError::Store(StoreError::Backend("manager gone".to_string())))?;
        manager.scan_with_retry(start).map_err(scan_error)?;
        manager.update_ssh().map_err(scan_error)?;
        Ok(manager.top().1)
    }

    fn current_top_height(&self) -> u32 {
        match self.0.upgrade() {
            Some(manager) => manager.top().0,
            None => 0,
        }
    }

    fn wipe_ssh(&self, addrs: &[ScriptAddr]) -> Result<(), StoreError> {
        let Some(manager) = self.0.upgrade() else {
            return Ok(());
        };
        let mut batch = WriteBatch::new();
        for addr in addrs {
            batch.delete(Column::Ssh, *addr);
            for (key, _) in manager.store.scan_prefix(Column::History, addr)? {
                batch.delete(Column::History, key);
            }
        }
        manager.store.write_batch(&batch)
    }
}
