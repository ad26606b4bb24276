mod common;

use std::sync::Arc;

use common::*;
use scrydb_chainstate::records::{tx_hint_prefix, StoredTxHint, TxIoKey};
use scrydb_chainstate::{InitMode, Spentness};
use scrydb_primitives::block::Block;
use scrydb_primitives::outpoint::OutPoint;
use scrydb_storage::memory::MemoryStore;
use scrydb_storage::{Column, KeyValueStore};

const WATCHED_TAG: u8 = 0xaa;

/// Genesis plus three blocks; the watched address receives 50 coins in the
/// coinbase of block 2.
fn three_block_chain() -> (Block, Vec<Block>) {
    let genesis = genesis_block();
    let b1 = make_block(
        genesis.header.hash(),
        1_600_000_100,
        1,
        vec![coinbase(1, 50 * COIN, vec![0x51])],
    );
    let b2 = make_block(
        b1.header.hash(),
        1_600_000_200,
        2,
        vec![coinbase(2, 50 * COIN, p2pkh_script(WATCHED_TAG))],
    );
    let b3 = make_block(
        b2.header.hash(),
        1_600_000_300,
        3,
        vec![coinbase(3, 50 * COIN, vec![0x51])],
    );
    (genesis, vec![b1, b2, b3])
}

fn spend_block(blocks: &[Block]) -> Block {
    let funding_txid = blocks[1].transactions[0].txid();
    make_block(
        blocks[2].header.hash(),
        1_600_000_400,
        4,
        vec![
            coinbase(4, 50 * COIN, vec![0x51]),
            spend(
                OutPoint {
                    hash: funding_txid,
                    index: 0,
                },
                49 * COIN,
                vec![0x51],
            ),
        ],
    )
}

#[test]
fn cold_start_indexes_watched_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);

    let mut refs: Vec<&Block> = vec![&genesis];
    refs.extend(blocks.iter());
    write_blk_file(dir.path(), 0, &framed(&refs, params.magic));

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
    let addr = watched_addr(WATCHED_TAG, &params);
    watch_offline(&manager, addr);

    manager.init(InitMode::Normal).expect("init");

    assert_eq!(manager.top(), (3, blocks[2].header.hash()));
    assert_eq!(manager.balance(&addr).expect("balance"), 50 * COIN);

    let unspent = manager.unspent_outputs(&addr).expect("utxos");
    assert_eq!(unspent.len(), 1);
    let stxo = &unspent[0];
    assert_eq!(stxo.height, 2);
    assert_eq!(stxo.tx_index, 0);
    assert_eq!(stxo.out_index, 0);
    assert_eq!(stxo.value(), 50 * COIN);
    assert_eq!(stxo.spentness, Spentness::Unspent);
    assert_eq!(stxo.parent_hash, blocks[1].transactions[0].txid());
}

#[test]
fn spend_in_next_block_marks_output_spent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);

    let mut refs: Vec<&Block> = vec![&genesis];
    refs.extend(blocks.iter());
    write_blk_file(dir.path(), 0, &framed(&refs, params.magic));

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
    let addr = watched_addr(WATCHED_TAG, &params);
    watch_offline(&manager, addr);
    manager.init(InitMode::Normal).expect("init");

    let b4 = spend_block(&blocks);
    append_blk_file(dir.path(), 0, &frame(&b4, params.magic));
    let reorg = manager.update().expect("update");
    assert!(reorg.reorg_branch_point.is_none());

    assert_eq!(manager.balance(&addr).expect("balance"), 0);
    assert!(manager.unspent_outputs(&addr).expect("utxos").is_empty());

    // the stored output now records its spender: tx 1, input 0, height 4
    let key = TxIoKey::new(2, 0, 0, 0);
    match manager.output_spentness(&key).expect("spentness") {
        Some(Spentness::Spent(txin)) => {
            assert_eq!(txin.height(), 4);
            assert_eq!(txin.io_index(), 0);
        }
        other => panic!("expected spent output, got {other:?}"),
    }

    // one history slice at the receive height, one at the spend height
    let rows = store
        .scan_prefix(Column::History, &addr)
        .expect("history rows");
    assert_eq!(rows.len(), 2);

    // the funding tx is hinted by its hash prefix
    let funding_txid = blocks[1].transactions[0].txid();
    let hint_bytes = store
        .get(Column::TxHints, &tx_hint_prefix(&funding_txid))
        .expect("hint read")
        .expect("hint present");
    let hint = StoredTxHint::decode(&hint_bytes).expect("hint decode");
    assert!(hint
        .tx_keys
        .iter()
        .any(|key| key.height() == 2 && key.dup() == 0));
}

#[test]
fn update_with_no_new_files_commits_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);

    let mut refs: Vec<&Block> = vec![&genesis];
    refs.extend(blocks.iter());
    write_blk_file(dir.path(), 0, &framed(&refs, params.magic));

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
    let addr = watched_addr(WATCHED_TAG, &params);
    watch_offline(&manager, addr);
    manager.init(InitMode::Normal).expect("init");

    manager.update().expect("first update");
    let history = store.dump_column(Column::History);
    let stxo = store.dump_column(Column::Stxo);
    let hints = store.dump_column(Column::TxHints);
    let ssh = store.dump_column(Column::Ssh);

    manager.update().expect("second update");
    assert_eq!(store.dump_column(Column::History), history);
    assert_eq!(store.dump_column(Column::Stxo), stxo);
    assert_eq!(store.dump_column(Column::TxHints), hints);
    assert_eq!(store.dump_column(Column::Ssh), ssh);
}

#[test]
fn misaligned_file_scans_to_identical_state() {
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);
    let b4 = spend_block(&blocks);
    let addr = watched_addr(WATCHED_TAG, &params);

    // clean layout
    let clean_dir = tempfile::tempdir().expect("tempdir");
    let mut contents = framed(
        &[&genesis, &blocks[0], &blocks[1], &blocks[2]],
        params.magic,
    );
    contents.extend_from_slice(&frame(&b4, params.magic));
    write_blk_file(clean_dir.path(), 0, &contents);

    let clean_store = Arc::new(MemoryStore::new());
    let clean = make_manager(Arc::clone(&clean_store), clean_dir.path(), &genesis);
    watch_offline(&clean, addr);
    clean.init(InitMode::Normal).expect("clean init");

    // same blocks with 37 junk bytes between blocks 3 and 4
    let dirty_dir = tempfile::tempdir().expect("tempdir");
    let mut contents = framed(
        &[&genesis, &blocks[0], &blocks[1], &blocks[2]],
        params.magic,
    );
    contents.extend_from_slice(&[0u8; 37]);
    contents.extend_from_slice(&frame(&b4, params.magic));
    write_blk_file(dirty_dir.path(), 0, &contents);

    let dirty_store = Arc::new(MemoryStore::new());
    let dirty = make_manager(Arc::clone(&dirty_store), dirty_dir.path(), &genesis);
    watch_offline(&dirty, addr);
    dirty.init(InitMode::Normal).expect("dirty init");

    assert_eq!(clean.top(), dirty.top());
    assert_eq!(clean.balance(&addr).expect("balance"), 0);
    for column in [Column::History, Column::Stxo, Column::TxHints, Column::Ssh] {
        assert_eq!(
            clean_store.dump_column(column),
            dirty_store.dump_column(column),
            "column {column:?} diverged"
        );
    }
}

#[test]
fn rescan_and_rebuild_reproduce_the_same_index() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);
    let b4 = spend_block(&blocks);

    let mut refs: Vec<&Block> = vec![&genesis];
    refs.extend(blocks.iter());
    let mut contents = framed(&refs, params.magic);
    contents.extend_from_slice(&frame(&b4, params.magic));
    write_blk_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let addr = watched_addr(WATCHED_TAG, &params);
    {
        let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
        watch_offline(&manager, addr);
        manager.init(InitMode::Normal).expect("init");
    }
    let history = store.dump_column(Column::History);
    let stxo = store.dump_column(Column::Stxo);
    let hints = store.dump_column(Column::TxHints);
    let ssh = store.dump_column(Column::Ssh);

    {
        let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
        manager.init(InitMode::Rescan).expect("rescan");
    }
    assert_eq!(store.dump_column(Column::History), history);
    assert_eq!(store.dump_column(Column::Stxo), stxo);
    assert_eq!(store.dump_column(Column::TxHints), hints);
    assert_eq!(store.dump_column(Column::Ssh), ssh);

    {
        let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
        manager.init(InitMode::Rebuild).expect("rebuild");
    }
    assert_eq!(store.dump_column(Column::History), history);
    assert_eq!(store.dump_column(Column::Stxo), stxo);
    assert_eq!(store.dump_column(Column::TxHints), hints);
    assert_eq!(store.dump_column(Column::Ssh), ssh);
}

#[test]
fn rescan_balances_refolds_from_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);

    let mut refs: Vec<&Block> = vec![&genesis];
    refs.extend(blocks.iter());
    write_blk_file(dir.path(), 0, &framed(&refs, params.magic));

    let store = Arc::new(MemoryStore::new());
    let addr = watched_addr(WATCHED_TAG, &params);
    {
        let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
        watch_offline(&manager, addr);
        manager.init(InitMode::Normal).expect("init");
        assert_eq!(manager.balance(&addr).expect("balance"), 50 * COIN);
    }

    let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
    manager
        .init(InitMode::RescanBalances)
        .expect("rescan balances");
    assert_eq!(manager.balance(&addr).expect("balance"), 50 * COIN);
}

#[test]
fn historical_registration_side_scans() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);

    let mut refs: Vec<&Block> = vec![&genesis];
    refs.extend(blocks.iter());
    write_blk_file(dir.path(), 0, &framed(&refs, params.magic));

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
    // nothing watched during init
    manager.init(InitMode::Normal).expect("init");

    let addr = watched_addr(WATCHED_TAG, &params);
    assert_eq!(manager.balance(&addr).expect("balance"), 0);

    let rx = manager.register_address_batch(vec![addr], false);
    assert!(rx.recv().expect("side scan signal"));
    assert_eq!(manager.balance(&addr).expect("balance"), 50 * COIN);
}

#[test]
fn crash_before_resume_point_replays_to_same_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (genesis, blocks) = three_block_chain();
    let params = test_params(&genesis);
    let b4 = spend_block(&blocks);

    let mut refs: Vec<&Block> = vec![&genesis];
    refs.extend(blocks.iter());
    let mut contents = framed(&refs, params.magic);
    contents.extend_from_slice(&frame(&b4, params.magic));
    write_blk_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let addr = watched_addr(WATCHED_TAG, &params);
    {
        let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
        watch_offline(&manager, addr);
        manager.init(InitMode::Normal).expect("init");
    }
    let history = store.dump_column(Column::History);
    let stxo = store.dump_column(Column::Stxo);

    // simulate a crash after the stxo write but before the resume point
    // advanced: roll the history info record back to block 3
    use scrydb_chainstate::records::{StoredDbInfo, DB_INFO_KEY};
    let info_bytes = store
        .get(Column::History, &DB_INFO_KEY)
        .expect("info read")
        .expect("info present");
    let mut info = StoredDbInfo::decode(&info_bytes).expect("info decode");
    info.top_hash = blocks[2].header.hash();
    info.top_height = 3;
    store
        .put(Column::History, &DB_INFO_KEY, &info.encode())
        .expect("info rollback");

    // restart: the affected range is rescanned and the state converges
    let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
    manager.init(InitMode::Normal).expect("restart init");

    assert_eq!(store.dump_column(Column::History), history);
    assert_eq!(store.dump_column(Column::Stxo), stxo);
    assert_eq!(manager.balance(&addr).expect("balance"), 0);
}
