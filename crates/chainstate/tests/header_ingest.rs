mod common;

use std::sync::Arc;

use common::*;
use scrydb_chainstate::BdmState;
use scrydb_chainstate::InitMode;
use scrydb_storage::memory::MemoryStore;

#[test]
fn empty_block_directory_is_ready_at_genesis() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(store, dir.path(), &genesis);

    manager.init(InitMode::Normal).expect("init");

    assert_eq!(manager.state(), BdmState::Ready);
    let (height, hash) = manager.top();
    assert_eq!(height, 0);
    assert_eq!(hash, genesis.header.hash());
}

#[test]
fn ingests_headers_across_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let params = test_params(&genesis);

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
        vec![coinbase(2, 50 * COIN, vec![0x51])],
    );
    let b3 = make_block(
        b2.header.hash(),
        1_600_000_300,
        3,
        vec![coinbase(3, 50 * COIN, vec![0x51])],
    );

    write_blk_file(dir.path(), 0, &framed(&[&genesis, &b1], params.magic));
    write_blk_file(dir.path(), 1, &framed(&[&b2, &b3], params.magic));

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(store, dir.path(), &genesis);
    manager.init(InitMode::Normal).expect("init");

    let (height, hash) = manager.top();
    assert_eq!(height, 3);
    assert_eq!(hash, b3.header.hash());
}

#[test]
fn update_picks_up_appended_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let params = test_params(&genesis);

    let b1 = make_block(
        genesis.header.hash(),
        1_600_000_100,
        1,
        vec![coinbase(1, 50 * COIN, vec![0x51])],
    );
    write_blk_file(dir.path(), 0, &framed(&[&genesis, &b1], params.magic));

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(store, dir.path(), &genesis);
    manager.init(InitMode::Normal).expect("init");
    assert_eq!(manager.top().0, 1);

    // the node appends to the tail file, then starts a new one
    let b2 = make_block(
        b1.header.hash(),
        1_600_000_200,
        2,
        vec![coinbase(2, 50 * COIN, vec![0x51])],
    );
    let b3 = make_block(
        b2.header.hash(),
        1_600_000_300,
        3,
        vec![coinbase(3, 50 * COIN, vec![0x51])],
    );
    append_blk_file(dir.path(), 0, &frame(&b2, params.magic));
    write_blk_file(dir.path(), 1, &frame(&b3, params.magic));

    let reorg = manager.update().expect("update");
    assert!(reorg.has_new_top);
    assert_eq!(reorg.reorg_branch_point, None);
    assert_eq!(manager.top(), (3, b3.header.hash()));
}

#[test]
fn resyncs_past_garbage_between_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let params = test_params(&genesis);

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
        vec![coinbase(2, 50 * COIN, vec![0x51])],
    );

    let mut contents = framed(&[&genesis, &b1], params.magic);
    contents.extend_from_slice(&[0u8; 37]);
    contents.extend_from_slice(&frame(&b2, params.magic));
    write_blk_file(dir.path(), 0, &contents);

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(store, dir.path(), &genesis);
    manager.init(InitMode::Normal).expect("init");
    assert_eq!(manager.top(), (2, b2.header.hash()));
}

#[test]
fn wrong_network_file_hides_later_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let params = test_params(&genesis);

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
        vec![coinbase(2, 50 * COIN, vec![0x51])],
    );
    let b3 = make_block(
        b2.header.hash(),
        1_600_000_300,
        3,
        vec![coinbase(3, 50 * COIN, vec![0x51])],
    );

    write_blk_file(dir.path(), 0, &framed(&[&genesis, &b1], params.magic));
    write_blk_file(dir.path(), 1, &framed(&[&b2], params.magic));
    // mainnet-magic file in a regtest directory
    let mainnet_magic = [0xf9, 0xbe, 0xb4, 0xd9];
    write_blk_file(dir.path(), 2, &framed(&[&b3], mainnet_magic));

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(store, dir.path(), &genesis);
    manager.init(InitMode::Normal).expect("init");

    // everything from the foreign file on is treated as absent
    assert_eq!(manager.top(), (2, b2.header.hash()));
}

#[test]
fn short_tail_file_is_in_progress() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let params = test_params(&genesis);

    let b1 = make_block(
        genesis.header.hash(),
        1_600_000_100,
        1,
        vec![coinbase(1, 50 * COIN, vec![0x51])],
    );
    write_blk_file(dir.path(), 0, &framed(&[&genesis, &b1], params.magic));
    // a freshly-created tail file with less than one header in it
    write_blk_file(dir.path(), 1, &[0u8; 40]);

    let store = Arc::new(MemoryStore::new());
    let manager = make_manager(store, dir.path(), &genesis);
    manager.init(InitMode::Normal).expect("init");
    assert_eq!(manager.top(), (1, b1.header.hash()));
}

#[test]
fn restart_short_circuits_and_keeps_top() {
    let dir = tempfile::tempdir().expect("tempdir");
    let genesis = genesis_block();
    let params = test_params(&genesis);

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
        vec![coinbase(2, 50 * COIN, vec![0x51])],
    );
    write_blk_file(dir.path(), 0, &framed(&[&genesis, &b1, &b2], params.magic));

    let store = Arc::new(MemoryStore::new());
    {
        let manager = make_manager(Arc::clone(&store), dir.path(), &genesis);
        manager.init(InitMode::Normal).expect("first init");
        assert_eq!(manager.top().0, 2);
    }

    // a second process start over the same database and files
    let manager = make_manager(store, dir.path(), &genesis);
    manager.init(InitMode::Normal).expect("second init");
    assert_eq!(manager.top(), (2, b2.header.hash()));
}
