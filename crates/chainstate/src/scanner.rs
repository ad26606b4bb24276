//! The parallel read / scan / write pipeline.
//!
//! A window of heights is split across `R` slots; each slot pairs a reader
//! thread (maps files, lightly deserializes blocks) with a scanner thread.
//! Scanners make two passes: outputs first, then — after a barrier at which
//! the driver folds every slot's finds into the shared UTXO map — inputs.
//! A single writer thread drains finished windows in height order, so the
//! index only ever grows front to back.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use scrydb_consensus::{ChainParams, Hash256};
use scrydb_log::{log_debug, log_info, log_warn};
use scrydb_primitives::encoding::{DecodeError, Decoder};
use scrydb_primitives::hash::sha256d;
use scrydb_primitives::transaction::TxLayout;
use scrydb_primitives::HEADER_SIZE;
use scrydb_script::{script_addr, ScriptAddr};
use scrydb_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockfiles::{BlockFileError, BlockFileSet, MappedFile};
use crate::chain::{Blockchain, HeaderNode};
use crate::records::{
    hgtx_key, tx_hint_prefix, Spentness, StoredDbInfo, StoredSubSsh, StoredTxHint, StoredTxOut,
    TxIoKey, TxIoPair, DB_INFO_KEY, TXIO_KEY_LEN, TX_HINT_PREFIX_LEN,
};

/// How far a reader may run ahead of its scanner, in blocks per worker.
pub const BLOCKS_LOOK_AHEAD: u32 = 8;

#[derive(Debug)]
pub enum ScanError {
    Store(StoreError),
    BlockFile(BlockFileError),
    Corrupt(DecodeError),
    /// A header or its position vanished mid-batch: the chain moved under
    /// the scanner. The supervisor reorganizes and resumes.
    ChainMoved { height: u32 },
    /// A scanner or reader thread died without reporting.
    WorkerLost,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Store(err) => write!(f, "{err}"),
            ScanError::BlockFile(err) => write!(f, "{err}"),
            ScanError::Corrupt(err) => write!(f, "{err}"),
            ScanError::ChainMoved { height } => {
                write!(f, "chain moved during scan near height {height}")
            }
            ScanError::WorkerLost => write!(f, "scan worker exited unexpectedly"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<StoreError> for ScanError {
    fn from(err: StoreError) -> Self {
        ScanError::Store(err)
    }
}

impl From<BlockFileError> for ScanError {
    fn from(err: BlockFileError) -> Self {
        ScanError::BlockFile(err)
    }
}

impl From<DecodeError> for ScanError {
    fn from(err: DecodeError) -> Self {
        ScanError::Corrupt(err)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScanConfig {
    /// Reader/scanner pairs per window.
    pub thread_count: usize,
    /// Block files grouped into one window; the scan RAM budget.
    pub files_per_batch: u32,
}

/// Unspent watched outputs keyed by parent tx hash, then output index.
pub type UtxoMap = HashMap<Hash256, HashMap<u16, StoredTxOut>>;

type SshMap = HashMap<ScriptAddr, HashMap<[u8; 4], StoredSubSsh>>;

struct ScannedTx {
    layout: TxLayout,
    txid: Hash256,
}

/// One lightly-deserialized block: the mapped bytes plus per-tx spans.
struct BlockData {
    height: u32,
    dup: u8,
    map: Arc<MappedFile>,
    body_offset: usize,
    body_len: usize,
    txns: Vec<ScannedTx>,
}

impl BlockData {
    fn bytes(&self) -> &[u8] {
        &self.map.bytes()[self.body_offset..self.body_offset + self.body_len]
    }

    fn deserialize(node: &HeaderNode, map: Arc<MappedFile>) -> Result<Self, ScanError> {
        let position = node.position.ok_or(ScanError::ChainMoved {
            height: node.height,
        })?;
        let body_offset = position.offset as usize + 8;
        let body_len = node.block_size as usize;
        if body_offset + body_len > map.bytes().len() || body_len < HEADER_SIZE + 1 {
            return Err(DecodeError::UnexpectedEof.into());
        }

        let body = &map.bytes()[body_offset..body_offset + body_len];
        if sha256d(&body[..HEADER_SIZE]) != node.hash {
            return Err(DecodeError::InvalidData("block does not match its header").into());
        }

        let mut decoder = Decoder::new(body);
        decoder.skip(HEADER_SIZE)?;
        let num_tx = decoder.read_varint()?;
        if num_tx != node.num_tx as u64 {
            return Err(DecodeError::InvalidData("tx count mismatch").into());
        }

        let mut txns = Vec::with_capacity(num_tx as usize);
        for _ in 0..num_tx {
            let layout = TxLayout::parse(&mut decoder)?;
            let txid = layout.txid(body);
            txns.push(ScannedTx { layout, txid });
        }

        Ok(Self {
            height: node.height,
            dup: node.dup_id,
            map,
            body_offset,
            body_len,
            txns,
        })
    }
}

/// Reader-side flow control: a reader sleeps once it runs too far ahead of
/// its scanner.
struct Throttle {
    highest_processed: AtomicU32,
    gate: Mutex<()>,
    cv: Condvar,
}

impl Throttle {
    fn new(first: u32) -> Self {
        Self {
            highest_processed: AtomicU32::new(first),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    fn wait_below(&self, height: u32, max_ahead: u32) {
        let mut guard = self.gate.lock().expect("throttle lock");
        while height
            > self
                .highest_processed
                .load(Ordering::Relaxed)
                .saturating_add(max_ahead)
        {
            guard = self.cv.wait(guard).expect("throttle lock");
        }
    }

    fn mark_processed(&self, height: u32) {
        self.highest_processed.fetch_max(height, Ordering::Relaxed);
        drop(self.gate.lock().expect("throttle lock"));
        self.cv.notify_all();
    }
}

struct SlotResult {
    ssh: SshMap,
    spent: Vec<StoredTxOut>,
}

struct WriteGroup {
    utxos: Vec<UtxoMap>,
    spent: Vec<Vec<StoredTxOut>>,
    ssh: Vec<SshMap>,
    top_hash: Hash256,
    top_height: u32,
}

pub struct BlockScanner<'a, S> {
    chain: &'a Blockchain,
    files: &'a BlockFileSet,
    store: &'a S,
    filter: &'a crate::scraddr::ScrAddrFilter,
    params: &'a ChainParams,
    config: ScanConfig,
    shutdown: &'a AtomicBool,
    utxo_map: RwLock<UtxoMap>,
}

impl<'a, S: KeyValueStore> BlockScanner<'a, S> {
    pub fn new(
        chain: &'a Blockchain,
        files: &'a BlockFileSet,
        store: &'a S,
        filter: &'a crate::scraddr::ScrAddrFilter,
        params: &'a ChainParams,
        config: ScanConfig,
        shutdown: &'a AtomicBool,
    ) -> Self {
        Self {
            chain,
            files,
            store,
            filter,
            params,
            config,
            shutdown,
            utxo_map: RwLock::new(UtxoMap::new()),
        }
    }

    /// Scans `[from, top]` and commits the index records window by window.
    /// Returns the height and hash of the last committed window's top, or
    /// `None` if there was nothing to scan.
    pub fn scan(&self, from: u32) -> Result<Option<(u32, Hash256)>, ScanError> {
        let top = self.chain.top_height();
        if from > top {
            log_warn!("scan start {from} is past the top {top}, nothing to do");
            return Ok(None);
        }
        if self.chain.top().position.is_none() {
            log_info!("no block data on disk yet, nothing to scan");
            return Ok(None);
        }

        self.load_utxo_map(from)?;

        let writer_err: Mutex<Option<ScanError>> = Mutex::new(None);
        let (group_tx, group_rx) = bounded::<WriteGroup>(2);
        let mut top_scanned: Option<(u32, Hash256)> = None;

        let drive_result: Result<(), ScanError> = thread::scope(|scope| {
            let writer = scope.spawn(|| {
                // closing the channel terminates the writer
                while let Ok(group) = group_rx.recv() {
                    let mut slot = writer_err.lock().expect("writer error slot");
                    if slot.is_some() {
                        continue; // drain without writing after a failure
                    }
                    drop(slot);
                    if let Err(err) = write_group(self.store, &group) {
                        slot = writer_err.lock().expect("writer error slot");
                        *slot = Some(err);
                    }
                }
            });

            let result = (|| {
                let mut start = from;
                while start <= top {
                    if self.shutdown.load(Ordering::Relaxed) {
                        log_info!("scan interrupted at height {start}, stopping cleanly");
                        break;
                    }
                    let end = self.batch_end(start, top)?;
                    let group = self.run_window(start, end)?;
                    let window_top = (group.top_height, group.top_hash);
                    if group_tx.send(group).is_err() {
                        break; // writer gone; its error slot has the cause
                    }
                    top_scanned = Some(window_top);
                    start = end + 1;
                }
                Ok(())
            })();

            drop(group_tx);
            let _ = writer.join();
            result
        });

        drive_result?;
        if let Some(err) = writer_err.into_inner().expect("writer error slot") {
            return Err(err);
        }
        Ok(top_scanned)
    }

    /// Seeds the in-memory UTXO map with every watched output not spent on
    /// the best chain below the scan start, so spends of previously
    /// recorded outputs are caught.
    fn load_utxo_map(&self, from: u32) -> Result<(), ScanError> {
        let mut map = self.utxo_map.write().expect("utxo map lock");
        map.clear();
        for (key, value) in self.store.scan_prefix(Column::Stxo, &[])? {
            if key.len() != TXIO_KEY_LEN {
                continue;
            }
            let mut stxo = StoredTxOut::decode(&value)?;
            let unspent = match stxo.spentness {
                Spentness::Unspent => true,
                // a spend in the range being (re)scanned will be seen again;
                // a spender that reorged off the best chain never happened
                Spentness::Spent(txin) => {
                    txin.height() >= from
                        || self.chain.canonical_dup(txin.height()) != Some(txin.dup())
                }
            };
            if !unspent {
                continue;
            }
            stxo.spentness = Spentness::Unspent;
            map.entry(stxo.parent_hash)
                .or_default()
                .insert(stxo.out_index, stxo);
        }
        log_debug!("seeded utxo map with {} parent txs", map.len());
        Ok(())
    }

    /// Last height of the window starting at `start`: enough heights to
    /// cover `files_per_batch` block files, clamped to the top.
    fn batch_end(&self, start: u32, top: u32) -> Result<u32, ScanError> {
        let node = self
            .chain
            .get_by_height(start)
            .ok_or(ScanError::ChainMoved { height: start })?;
        let position = node
            .position
            .ok_or(ScanError::ChainMoved { height: start })?;
        let target_file = position.file_num + self.config.files_per_batch;

        let mut end = start;
        while end < top {
            let next = self
                .chain
                .get_by_height(end + 1)
                .ok_or(ScanError::ChainMoved { height: end + 1 })?;
            let Some(next_position) = next.position else {
                return Err(ScanError::ChainMoved { height: end + 1 });
            };
            if next_position.file_num >= target_file {
                break;
            }
            end += 1;
        }
        Ok(end)
    }

    fn run_window(&self, start: u32, end: u32) -> Result<WriteGroup, ScanError> {
        let stride = self.config.thread_count.max(1) as u32;
        let firsts: Vec<u32> = (0..stride).map(|i| start + i).filter(|h| *h <= end).collect();
        let slots = firsts.len();

        let error_slot: Mutex<Option<ScanError>> = Mutex::new(None);
        let (out_tx, out_rx) = bounded::<UtxoMap>(slots);
        let (res_tx, res_rx) = bounded::<SlotResult>(slots);
        let gates: Vec<Arc<Mutex<()>>> = (0..slots).map(|_| Arc::new(Mutex::new(()))).collect();
        let throttles: Vec<Arc<Throttle>> =
            firsts.iter().map(|h| Arc::new(Throttle::new(*h))).collect();

        let mut outputs: Vec<UtxoMap> = Vec::with_capacity(slots);
        let mut results: Vec<SlotResult> = Vec::with_capacity(slots);

        thread::scope(|scope| {
            // the output pass runs with every gate held shut; dropping the
            // guards after the merge is the barrier that opens the input pass
            let guards: Vec<_> = gates
                .iter()
                .map(|gate| gate.lock().expect("window gate"))
                .collect();

            for (i, first) in firsts.iter().copied().enumerate() {
                let (block_tx, block_rx) = unbounded::<BlockData>();
                let reader_throttle = Arc::clone(&throttles[i]);
                let scanner_throttle = Arc::clone(&throttles[i]);
                let gate = Arc::clone(&gates[i]);
                let slot_out_tx = out_tx.clone();
                let slot_res_tx = res_tx.clone();
                let error_slot = &error_slot;

                scope.spawn(move || {
                    self.read_slot(first, end, stride, &reader_throttle, block_tx, error_slot);
                });
                scope.spawn(move || {
                    self.scan_slot(block_rx, &scanner_throttle, &gate, slot_out_tx, slot_res_tx);
                });
            }
            drop(out_tx);
            drop(res_tx);

            // barrier: wait for every slot's output pass
            for _ in 0..slots {
                match out_rx.recv() {
                    Ok(slot_utxos) => outputs.push(slot_utxos),
                    Err(_) => break,
                }
            }

            {
                let mut map = self.utxo_map.write().expect("utxo map lock");
                for slot_utxos in &outputs {
                    for (tx_hash, by_index) in slot_utxos {
                        let entry = map.entry(*tx_hash).or_default();
                        for (out_index, stxo) in by_index {
                            entry.insert(*out_index, stxo.clone());
                        }
                    }
                }
            }

            drop(guards);

            for _ in 0..slots {
                match res_rx.recv() {
                    Ok(result) => results.push(result),
                    Err(_) => break,
                }
            }
        });

        if let Some(err) = error_slot.into_inner().expect("window error slot") {
            return Err(err);
        }
        if outputs.len() != slots || results.len() != slots {
            return Err(ScanError::WorkerLost);
        }

        // spent outputs leave the shared map before the next window
        {
            let mut map = self.utxo_map.write().expect("utxo map lock");
            for result in &results {
                for spent in &result.spent {
                    if let Some(by_index) = map.get_mut(&spent.parent_hash) {
                        by_index.remove(&spent.out_index);
                        if by_index.is_empty() {
                            map.remove(&spent.parent_hash);
                        }
                    }
                }
            }
        }

        let top_node = self
            .chain
            .get_by_height(end)
            .ok_or(ScanError::ChainMoved { height: end })?;

        let (ssh, spent): (Vec<SshMap>, Vec<Vec<StoredTxOut>>) = results
            .into_iter()
            .map(|result| (result.ssh, result.spent))
            .unzip();

        Ok(WriteGroup {
            utxos: outputs,
            spent,
            ssh,
            top_hash: top_node.hash,
            top_height: end,
        })
    }

    fn read_slot(
        &self,
        first: u32,
        end: u32,
        stride: u32,
        throttle: &Throttle,
        block_tx: Sender<BlockData>,
        error_slot: &Mutex<Option<ScanError>>,
    ) {
        let mut maps: HashMap<u32, Arc<MappedFile>> = HashMap::new();
        let mut height = first;
        while height <= end {
            throttle.wait_below(height, BLOCKS_LOOK_AHEAD * stride);

            let Some(node) = self.chain.get_by_height(height) else {
                set_error(error_slot, ScanError::ChainMoved { height });
                return;
            };
            let Some(position) = node.position else {
                set_error(error_slot, ScanError::ChainMoved { height });
                return;
            };

            let map = match maps.get(&position.file_num) {
                Some(map) => Arc::clone(map),
                None => match self.files.map(position.file_num) {
                    Ok(map) => {
                        maps.insert(position.file_num, Arc::clone(&map));
                        map
                    }
                    Err(err) => {
                        set_error(error_slot, err.into());
                        return;
                    }
                },
            };

            match BlockData::deserialize(node, map) {
                Ok(block) => {
                    if block_tx.send(block).is_err() {
                        return;
                    }
                }
                Err(ScanError::Corrupt(err)) => {
                    // bad block body; skip it and keep the batch going
                    log_warn!("skipping corrupt block at height {height}: {err}");
                    throttle.mark_processed(height);
                }
                Err(err) => {
                    set_error(error_slot, err);
                    return;
                }
            }
            height += stride;
        }
    }

    fn scan_slot(
        &self,
        block_rx: Receiver<BlockData>,
        throttle: &Throttle,
        gate: &Mutex<()>,
        out_tx: Sender<UtxoMap>,
        res_tx: Sender<SlotResult>,
    ) {
        let mut utxos = UtxoMap::new();
        let mut ssh = SshMap::new();
        let mut blocks = Vec::new();

        // output pass
        while let Ok(block) = block_rx.recv() {
            throttle.mark_processed(block.height);
            self.scan_outputs(&block, &mut utxos, &mut ssh);
            blocks.push(block);
        }

        let _ = out_tx.send(utxos);

        // the driver holds the gate until every slot's outputs are merged
        let _barrier = gate.lock().expect("window gate");

        // input pass
        let mut spent = Vec::new();
        {
            let utxo_map = self.utxo_map.read().expect("utxo map lock");
            for block in &blocks {
                self.scan_inputs(block, &utxo_map, &mut spent, &mut ssh);
            }
        }

        let _ = res_tx.send(SlotResult { ssh, spent });
    }

    fn scan_outputs(&self, block: &BlockData, utxos: &mut UtxoMap, ssh: &mut SshMap) {
        let body = block.bytes();
        let hgtx = hgtx_key(block.height, block.dup);

        for (tx_index, tx) in block.txns.iter().enumerate() {
            for out_index in 0..tx.layout.outputs.len() {
                let Ok(script) = tx.layout.output_script(body, out_index) else {
                    continue;
                };
                let Some(addr) = script_addr(script, self.params) else {
                    continue;
                };
                if !self.filter.contains(&addr) {
                    continue;
                }

                let stxo = StoredTxOut {
                    raw: tx.layout.outputs[out_index].slice(body).to_vec(),
                    parent_hash: tx.txid,
                    height: block.height,
                    dup: block.dup,
                    tx_index: tx_index as u16,
                    out_index: out_index as u16,
                    script_addr: addr,
                    spentness: Spentness::Unspent,
                };
                let txout_key = stxo.key();
                let value = stxo.value();

                ssh.entry(addr)
                    .or_default()
                    .entry(hgtx)
                    .or_default()
                    .insert(
                        txout_key,
                        TxIoPair {
                            txout_key,
                            txin_key: None,
                            value,
                        },
                    );
                utxos
                    .entry(tx.txid)
                    .or_default()
                    .insert(out_index as u16, stxo);
            }
        }
    }

    fn scan_inputs(
        &self,
        block: &BlockData,
        utxo_map: &UtxoMap,
        spent: &mut Vec<StoredTxOut>,
        ssh: &mut SshMap,
    ) {
        let body = block.bytes();
        let hgtx = hgtx_key(block.height, block.dup);

        for (tx_index, tx) in block.txns.iter().enumerate() {
            for in_index in 0..tx.layout.inputs.len() {
                let (prev_hash, prev_index) = tx.layout.input_prevout(body, in_index);
                let Some(by_index) = utxo_map.get(&prev_hash) else {
                    continue;
                };
                let Ok(prev_index) = u16::try_from(prev_index) else {
                    continue;
                };
                let Some(stxo) = by_index.get(&prev_index) else {
                    continue;
                };

                let txin_key =
                    TxIoKey::new(block.height, block.dup, tx_index as u16, in_index as u16);
                let mut spent_stxo = stxo.clone();
                spent_stxo.spentness = Spentness::Spent(txin_key);

                ssh.entry(spent_stxo.script_addr)
                    .or_default()
                    .entry(hgtx)
                    .or_default()
                    .insert(
                        txin_key,
                        TxIoPair {
                            txout_key: spent_stxo.key(),
                            txin_key: Some(txin_key),
                            value: spent_stxo.value(),
                        },
                    );
                spent.push(spent_stxo);
            }
        }
    }
}

fn set_error(slot: &Mutex<Option<ScanError>>, err: ScanError) {
    let mut guard = slot.lock().expect("error slot lock");
    if guard.is_none() {
        *guard = Some(err);
    }
}

/// Commits one window: `STXO` first (spent records overwriting same-window
/// unspent ones), then merged `TXHINTS`, then `HISTORY` rows with the
/// info record last — the durable resume point.
fn write_group<S: KeyValueStore>(store: &S, group: &WriteGroup) -> Result<(), ScanError> {
    // STXO
    let mut stxo_rows: BTreeMap<[u8; TXIO_KEY_LEN], Vec<u8>> = BTreeMap::new();
    for slot_utxos in &group.utxos {
        for by_index in slot_utxos.values() {
            for stxo in by_index.values() {
                let mut key = [0u8; TXIO_KEY_LEN];
                key.copy_from_slice(stxo.key().as_bytes());
                stxo_rows.insert(key, stxo.encode());
            }
        }
    }
    for stxo in group.spent.iter().flatten() {
        let mut key = [0u8; TXIO_KEY_LEN];
        key.copy_from_slice(stxo.key().as_bytes());
        stxo_rows.insert(key, stxo.encode());
    }
    let mut batch = WriteBatch::new();
    for (key, value) in &stxo_rows {
        batch.put(Column::Stxo, *key, value.clone());
    }
    store.write_batch(&batch)?;

    // TXHINTS, merged with whatever is already hinted
    let mut hints: HashMap<[u8; TX_HINT_PREFIX_LEN], StoredTxHint> = HashMap::new();
    for slot_utxos in &group.utxos {
        for (tx_hash, by_index) in slot_utxos {
            let Some(stxo) = by_index.values().next() else {
                continue;
            };
            let prefix = tx_hint_prefix(tx_hash);
            let hint = match hints.entry(prefix) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let existing = match store.get(Column::TxHints, &prefix)? {
                        Some(bytes) => StoredTxHint::decode(&bytes)?,
                        None => StoredTxHint::default(),
                    };
                    entry.insert(existing)
                }
            };
            hint.add(stxo.parent_tx_key());
        }
    }
    let mut batch = WriteBatch::new();
    for (prefix, hint) in &hints {
        batch.put(Column::TxHints, *prefix, hint.encode());
    }
    store.write_batch(&batch)?;

    // HISTORY rows, one per (address, height, dup), merged across slots
    let mut history_rows: BTreeMap<Vec<u8>, StoredSubSsh> = BTreeMap::new();
    for slot_ssh in &group.ssh {
        for (addr, by_hgtx) in slot_ssh {
            for (hgtx, subssh) in by_hgtx {
                let mut key = Vec::with_capacity(addr.len() + hgtx.len());
                key.extend_from_slice(addr);
                key.extend_from_slice(hgtx);
                history_rows.entry(key).or_default().merge(subssh);
            }
        }
    }
    let mut batch = WriteBatch::new();
    for (key, subssh) in &history_rows {
        batch.put(Column::History, key.clone(), subssh.encode());
    }

    let info_bytes = store
        .get(Column::History, &DB_INFO_KEY)?
        .ok_or_else(|| StoreError::Backend("history has no info record".to_string()))?;
    let mut info = StoredDbInfo::decode(&info_bytes)?;
    info.top_hash = group.top_hash;
    info.top_height = group.top_height;
    batch.put(Column::History, DB_INFO_KEY, info.encode());

    store.write_batch(&batch)?;
    Ok(())
}
