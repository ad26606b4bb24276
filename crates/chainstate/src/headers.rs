//! Header ingest: bring the in-memory chain up to date with what is on
//! disk, reading as little as possible, and persist the result.

use scrydb_consensus::Hash256;
use scrydb_log::{log_info, log_warn};
use scrydb_primitives::block::BlockHeader;
use scrydb_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use scrydb_primitives::hash::sha256d;
use scrydb_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::blockfiles::{
    BlockFileError, BlockFilePosition, BlockFileSet, ScanControl, WalkEnd,
};
use crate::chain::{Blockchain, ChainError, ReorganizationState};
use crate::records::{
    header_key, hgtx_key, parse_header_key, StoredBlockData, StoredDbInfo, DB_INFO_KEY,
};

#[derive(Debug)]
pub enum IngestError {
    BlockFile(BlockFileError),
    Chain(ChainError),
    Store(StoreError),
    Decode(DecodeError),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::BlockFile(err) => write!(f, "{err}"),
            IngestError::Chain(err) => write!(f, "{err}"),
            IngestError::Store(err) => write!(f, "{err}"),
            IngestError::Decode(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<BlockFileError> for IngestError {
    fn from(err: BlockFileError) -> Self {
        IngestError::BlockFile(err)
    }
}

impl From<ChainError> for IngestError {
    fn from(err: ChainError) -> Self {
        IngestError::Chain(err)
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::Store(err)
    }
}

impl From<DecodeError> for IngestError {
    fn from(err: DecodeError) -> Self {
        IngestError::Decode(err)
    }
}

pub struct IngestOutcome {
    pub new_headers: usize,
    pub reorg: ReorganizationState,
}

fn short_hex(hash: &Hash256) -> String {
    hash.iter()
        .rev()
        .take(8)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Walks the block files from the first position holding an unrecognized
/// header, inserts what is missing, stamps file positions, and reorganizes.
pub fn ingest(files: &BlockFileSet, chain: &mut Blockchain) -> Result<IngestOutcome, IngestError> {
    let start = find_first_unrecognized(files, chain)?;
    log_info!(
        "header ingest starting at file {} offset {}",
        start.file_num,
        start.offset
    );

    let new_headers = match walk_and_insert(files, chain, start)? {
        Ok(count) => count,
        Err(orphan) => {
            // a header pointed at a parent we never saw; the headers db is
            // inconsistent with the files, rescan them all
            log_warn!(
                "header {} has an unknown parent, rescanning all headers",
                short_hex(&orphan)
            );
            match walk_and_insert(files, chain, BlockFilePosition::START)? {
                Ok(count) => count,
                Err(orphan) => return Err(ChainError::OrphanHeader(orphan).into()),
            }
        }
    };

    let reorg = chain.organize();
    log_info!(
        "header ingest added {} headers, top height {}",
        new_headers,
        chain.top_height()
    );
    Ok(IngestOutcome { new_headers, reorg })
}

/// Reads every header from `start`, inserting unknown ones and stamping
/// known ones. An orphan header aborts the walk and is handed back so the
/// caller can decide on a full rescan.
fn walk_and_insert(
    files: &BlockFileSet,
    chain: &mut Blockchain,
    start: BlockFilePosition,
) -> Result<Result<usize, Hash256>, IngestError> {
    let mut new_headers = 0usize;
    let mut orphan: Option<Hash256> = None;

    files.read_headers(start, &mut |event| {
        let header = match decode_header(event.raw_header) {
            Ok(header) => header,
            Err(_) => {
                log_warn!(
                    "undecodable header at file {} offset {}",
                    event.position.file_num,
                    event.position.offset
                );
                return ScanControl::Continue;
            }
        };
        let hash = header.hash();
        if !chain.contains(&hash) {
            match chain.add_header(header) {
                Ok(true) => new_headers += 1,
                Ok(false) => {}
                Err(ChainError::OrphanHeader(hash)) => {
                    orphan = Some(hash);
                    return ScanControl::Abort;
                }
                Err(err) => {
                    log_warn!("skipping header {}: {err}", short_hex(&hash));
                    return ScanControl::Continue;
                }
            }
        }
        let _ = chain.set_position(&hash, event.position, event.block_size, event.num_tx);
        ScanControl::Continue
    })?;

    match orphan {
        Some(hash) => Ok(Err(hash)),
        None => Ok(Ok(new_headers)),
    }
}

fn decode_header(raw: &[u8]) -> Result<BlockHeader, DecodeError> {
    let mut decoder = Decoder::new(raw);
    BlockHeader::consensus_decode(&mut decoder)
}

/// Locates the first block on disk the chain does not know, probing files
/// by their first hash so steady-state startup reads only the tail file.
fn find_first_unrecognized(
    files: &BlockFileSet,
    chain: &mut Blockchain,
) -> Result<BlockFilePosition, IngestError> {
    let num_files = files.num_files() as u32;
    if num_files == 0 {
        return Ok(BlockFilePosition::START);
    }

    let mut first_unknown = num_files;
    for file_num in 0..num_files {
        let known = match files.first_hash(file_num) {
            Ok(Some(hash)) => chain.contains(&hash),
            Ok(None) => false,
            Err(BlockFileError::WrongNetwork { found, .. }) => {
                log_warn!(
                    "block file {} is for another network \
                     (magic {:02x}{:02x}{:02x}{:02x})",
                    file_num,
                    found[0],
                    found[1],
                    found[2],
                    found[3]
                );
                false
            }
            Err(err) => return Err(err.into()),
        };
        if !known {
            first_unknown = file_num;
            break;
        }
    }

    if first_unknown == 0 {
        return Ok(BlockFilePosition::START);
    }
    let probe_file = first_unknown - 1;

    // linear scan of the last recognized file: stamp the headers we know,
    // stop at the first we don't
    let top_hash = chain.top().hash;
    let genesis_hash = chain.genesis_hash();
    let mut found_top = false;
    let mut recognized_beyond_genesis = false;
    let mut walk_end = BlockFilePosition::new(probe_file, 0);

    let outcome = files.read_headers_in_file(probe_file, 0, &mut |event| {
        let Ok(header) = decode_header(event.raw_header) else {
            return ScanControl::Continue;
        };
        let hash = header.hash();
        if !chain.contains(&hash) {
            return ScanControl::StopAt(event.position);
        }
        if hash == top_hash {
            found_top = true;
        }
        if hash != genesis_hash {
            recognized_beyond_genesis = true;
        }
        let _ = chain.set_position(&hash, event.position, event.block_size, event.num_tx);
        ScanControl::Continue
    })?;

    match outcome {
        WalkEnd::Stopped(position) | WalkEnd::Exhausted(position) => walk_end = position,
        WalkEnd::Aborted => {}
    }

    // recognizing nothing past genesis is not "already ingested": genesis is
    // preloaded in the chain even on a fresh database and still needs its
    // on-disk position recorded by the full walk
    if probe_file == 0 && !recognized_beyond_genesis {
        return Ok(BlockFilePosition::START);
    }

    if !found_top {
        log_warn!(
            "top block not found in block file {probe_file}, searching earlier files"
        );
        if !search_backward_for(files, num_files, &top_hash)? {
            log_warn!("top block missing from every block file, rescanning all headers");
            return Ok(BlockFilePosition::START);
        }
    }

    Ok(walk_end)
}

fn search_backward_for(
    files: &BlockFileSet,
    num_files: u32,
    wanted: &Hash256,
) -> Result<bool, IngestError> {
    for file_num in (0..num_files).rev() {
        let mut found = false;
        let result = files.read_headers_in_file(file_num, 0, &mut |event| {
            if sha256d(event.raw_header) == *wanted {
                found = true;
                return ScanControl::StopAt(event.position);
            }
            ScanControl::Continue
        });
        match result {
            Ok(_) => {}
            Err(BlockFileError::WrongNetwork { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
        if found {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Writes headers and block positions touched since the last persist, and
/// advances the `HEADERS` info record to the current top.
pub fn persist_chain<S: KeyValueStore>(store: &S, chain: &mut Blockchain) -> Result<(), IngestError> {
    let dirty = chain.take_dirty();
    if dirty.is_empty() {
        return Ok(());
    }

    let mut batch = WriteBatch::new();
    for hash in &dirty {
        let Some(node) = chain.get_by_hash(hash) else {
            continue;
        };
        let mut raw = Encoder::new();
        node.header.consensus_encode(&mut raw);
        batch.put(
            Column::Headers,
            header_key(node.height, node.dup_id),
            raw.into_inner(),
        );
        if let Some(position) = node.position {
            let record = StoredBlockData {
                hash: node.hash,
                file_num: position.file_num,
                offset: position.offset,
                block_size: node.block_size,
                num_tx: node.num_tx,
            };
            batch.put(
                Column::BlkData,
                hgtx_key(node.height, node.dup_id),
                record.encode(),
            );
        }
    }

    let top = chain.top();
    let mut info = read_db_info(store, Column::Headers)?;
    info.top_hash = top.hash;
    info.top_height = top.height;
    batch.put(Column::Headers, DB_INFO_KEY, info.encode());

    store.write_batch(&batch)?;
    Ok(())
}

/// Rebuilds the in-memory chain from the `HEADERS` and `BLKDATA` rows.
pub fn load_chain<S: KeyValueStore>(store: &S, chain: &mut Blockchain) -> Result<usize, IngestError> {
    let mut loaded = 0usize;
    for (key, value) in store.scan_prefix(Column::Headers, &[])? {
        if parse_header_key(&key).is_none() {
            continue; // the info record
        }
        let header = decode_header(&value)?;
        if chain.add_header(header)? {
            loaded += 1;
        }
    }

    for (key, value) in store.scan_prefix(Column::BlkData, &[])? {
        if key.len() != 4 {
            continue;
        }
        let record = StoredBlockData::decode(&value)?;
        let _ = chain.set_position(
            &record.hash,
            BlockFilePosition::new(record.file_num, record.offset),
            record.block_size,
            record.num_tx,
        );
    }

    chain.organize();
    // rows came from the store; nothing needs persisting again
    let _ = chain.take_dirty();
    Ok(loaded)
}

pub fn read_db_info<S: KeyValueStore>(
    store: &S,
    column: Column,
) -> Result<StoredDbInfo, IngestError> {
    let bytes = store
        .get(column, &DB_INFO_KEY)?
        .ok_or_else(|| StoreError::Backend(format!("{} has no info record", column.as_str())))?;
    Ok(StoredDbInfo::decode(&bytes)?)
}
