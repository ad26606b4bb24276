//! Shared fixtures: synthetic regtest chains written as real block files.
#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use scrydb_chainstate::{BdmConfig, BlockDataManager, DbType};
use scrydb_consensus::{chain_params, ChainParams, Hash256, Network};
use scrydb_primitives::block::{Block, BlockHeader};
use scrydb_primitives::outpoint::OutPoint;
use scrydb_primitives::transaction::{Transaction, TxIn, TxOut};
use scrydb_script::{script_addr, ScriptAddr};
use scrydb_storage::memory::MemoryStore;

pub const COIN: i64 = 100_000_000;
pub const REGTEST_BITS: u32 = 0x207f_ffff;

pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn watched_addr(tag: u8, params: &ChainParams) -> ScriptAddr {
    script_addr(&p2pkh_script(tag), params).expect("p2pkh addr")
}

pub fn coinbase(height: u32, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

pub fn spend(prevout: OutPoint, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

/// Builds a block on `prev`. The merkle root is a digest of the txids,
/// which keeps headers unique; the index never validates merkle paths.
pub fn make_block(prev: Hash256, time: u32, nonce: u32, transactions: Vec<Transaction>) -> Block {
    let mut txid_bytes = Vec::new();
    for tx in &transactions {
        txid_bytes.extend_from_slice(&tx.txid());
    }
    let merkle_root = scrydb_primitives::hash::sha256d(&txid_bytes);
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root,
            time,
            bits: REGTEST_BITS,
            nonce,
        },
        transactions,
    }
}

/// Regtest parameters rooted at a synthetic genesis block.
pub fn test_params(genesis: &Block) -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    params.genesis_hash = genesis.header.hash();
    params.genesis_tx_hash = genesis.transactions[0].txid();
    params
}

pub fn genesis_block() -> Block {
    make_block(
        [0u8; 32],
        1_600_000_000,
        0,
        vec![coinbase(0, 50 * COIN, vec![0x51])],
    )
}

pub fn frame(block: &Block, magic: [u8; 4]) -> Vec<u8> {
    let body = block.consensus_encode();
    let mut out = Vec::with_capacity(body.len() + 8);
    out.extend_from_slice(&magic);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

pub fn write_blk_file(dir: &Path, file_num: u32, contents: &[u8]) {
    let path = dir.join(format!("blk{file_num:05}.dat"));
    std::fs::write(path, contents).expect("write blk file");
}

pub fn append_blk_file(dir: &Path, file_num: u32, contents: &[u8]) {
    let path = dir.join(format!("blk{file_num:05}.dat"));
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open blk file");
    file.write_all(contents).expect("append blk file");
}

pub fn framed(blocks: &[&Block], magic: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::new();
    for block in blocks {
        out.extend_from_slice(&frame(block, magic));
    }
    out
}

pub fn make_manager(
    store: Arc<MemoryStore>,
    blk_dir: &Path,
    genesis: &Block,
) -> Arc<BlockDataManager<MemoryStore>> {
    let params = test_params(genesis);
    Arc::new(BlockDataManager::new(
        BdmConfig {
            genesis: genesis.header,
            params,
            db_type: DbType::Full,
            thread_count: 2,
            ram_usage: 1,
            spawn_id: String::new(),
            check_chain: false,
        },
        store,
        blk_dir,
    ))
}

/// Registers a watched address while the manager is offline; it is picked
/// up by the next `init` scan.
pub fn watch_offline(manager: &Arc<BlockDataManager<MemoryStore>>, addr: ScriptAddr) {
    let rx = manager.register_address_batch(vec![addr], false);
    assert!(!rx.recv().expect("registration signal"));
}
