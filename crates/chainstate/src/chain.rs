//! In-memory graph of block headers and best-chain selection.

use std::collections::{HashMap, HashSet};

use primitive_types::U256;
use scrydb_consensus::{work_from_bits, CompactError, Hash256};
use scrydb_primitives::block::BlockHeader;

use crate::blockfiles::BlockFilePosition;

#[derive(Debug)]
pub enum ChainError {
    /// A header names a predecessor this graph has never seen.
    OrphanHeader(Hash256),
    UnknownHash(Hash256),
    UnknownHeight(u32),
    BadBits(CompactError),
    /// More than 255 blocks at one height.
    DupOverflow(u32),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::OrphanHeader(hash) => {
                write!(f, "header {} has an unknown parent", hex_prefix(hash))
            }
            ChainError::UnknownHash(hash) => write!(f, "unknown header {}", hex_prefix(hash)),
            ChainError::UnknownHeight(height) => write!(f, "no header at height {height}"),
            ChainError::BadBits(err) => write!(f, "{err}"),
            ChainError::DupOverflow(height) => {
                write!(f, "too many known blocks at height {height}")
            }
        }
    }
}

impl std::error::Error for ChainError {}

impl From<CompactError> for ChainError {
    fn from(err: CompactError) -> Self {
        ChainError::BadBits(err)
    }
}

fn hex_prefix(hash: &Hash256) -> String {
    let mut out = String::with_capacity(16);
    for byte in hash.iter().rev().take(8) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Outcome of [`Blockchain::organize`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReorganizationState {
    pub prev_top: Hash256,
    pub new_top: Hash256,
    pub has_new_top: bool,
    /// Deepest common ancestor height when the top moved to a fork. Scan
    /// state above this height is stale and must be redone.
    pub reorg_branch_point: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct HeaderNode {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    pub dup_id: u8,
    /// Cumulative proof of work from genesis through this header.
    pub chain_work: U256,
    pub is_main: bool,
    pub position: Option<BlockFilePosition>,
    pub block_size: u32,
    pub num_tx: u32,
    seen_index: u64,
}

impl HeaderNode {
    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }
}

/// All known headers keyed by hash, the canonical height mapping, and the
/// current best-work top. Only the supervisor mutates this; scan workers
/// read a stable borrow.
pub struct Blockchain {
    genesis_hash: Hash256,
    nodes: HashMap<Hash256, HeaderNode>,
    children: HashMap<Hash256, Vec<Hash256>>,
    canonical: Vec<Hash256>,
    tips: HashSet<Hash256>,
    dups_at_height: HashMap<u32, u8>,
    top: Hash256,
    seen_counter: u64,
    dirty: HashSet<Hash256>,
}

impl Blockchain {
    /// A chain always contains genesis, position unknown until ingest
    /// stamps it.
    pub fn new(genesis: BlockHeader) -> Self {
        let genesis_hash = genesis.hash();
        let mut chain = Self {
            genesis_hash,
            nodes: HashMap::new(),
            children: HashMap::new(),
            canonical: Vec::new(),
            tips: HashSet::new(),
            dups_at_height: HashMap::new(),
            top: genesis_hash,
            seen_counter: 0,
            dirty: HashSet::new(),
        };
        chain.insert_genesis(genesis);
        chain
    }

    fn insert_genesis(&mut self, genesis: BlockHeader) {
        let hash = genesis.hash();
        let work = work_from_bits(genesis.bits).unwrap_or_default();
        self.nodes.insert(
            hash,
            HeaderNode {
                header: genesis,
                hash,
                height: 0,
                dup_id: 0,
                chain_work: work,
                is_main: true,
                position: None,
                block_size: 0,
                num_tx: 0,
                seen_index: 0,
            },
        );
        self.dups_at_height.insert(0, 1);
        self.tips.insert(hash);
        self.canonical = vec![hash];
        self.top = hash;
        self.seen_counter = 1;
        self.dirty.insert(hash);
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis_hash
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get_by_hash(&self, hash: &Hash256) -> Option<&HeaderNode> {
        self.nodes.get(hash)
    }

    /// Canonical chain lookup.
    pub fn get_by_height(&self, height: u32) -> Option<&HeaderNode> {
        let hash = self.canonical.get(height as usize)?;
        self.nodes.get(hash)
    }

    pub fn top(&self) -> &HeaderNode {
        self.nodes.get(&self.top).expect("top header present")
    }

    pub fn top_height(&self) -> u32 {
        self.top().height
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dup id of the block on the best chain at `height`.
    pub fn canonical_dup(&self, height: u32) -> Option<u8> {
        self.get_by_height(height).map(|node| node.dup_id)
    }

    /// Inserts a header by hash; re-inserting a known header is a no-op.
    /// The parent must already be known.
    pub fn add_header(&mut self, header: BlockHeader) -> Result<bool, ChainError> {
        let hash = header.hash();
        if self.nodes.contains_key(&hash) {
            return Ok(false);
        }

        let parent = self
            .nodes
            .get(&header.prev_block)
            .ok_or(ChainError::OrphanHeader(hash))?;
        let height = parent.height + 1;
        let chain_work = parent.chain_work + work_from_bits(header.bits)?;

        let dup_slot = self.dups_at_height.entry(height).or_insert(0);
        if *dup_slot == u8::MAX {
            return Err(ChainError::DupOverflow(height));
        }
        let dup_id = *dup_slot;
        *dup_slot += 1;

        self.tips.remove(&header.prev_block);
        self.tips.insert(hash);
        self.children
            .entry(header.prev_block)
            .or_default()
            .push(hash);

        self.seen_counter += 1;
        self.nodes.insert(
            hash,
            HeaderNode {
                header,
                hash,
                height,
                dup_id,
                chain_work,
                is_main: false,
                position: None,
                block_size: 0,
                num_tx: 0,
                seen_index: self.seen_counter,
            },
        );
        self.dirty.insert(hash);
        Ok(true)
    }

    /// Stamps a header with its on-disk coordinates. The stamp is taken
    /// exactly once; repeat sightings of the same block are ignored.
    pub fn set_position(
        &mut self,
        hash: &Hash256,
        position: BlockFilePosition,
        block_size: u32,
        num_tx: u32,
    ) -> Result<(), ChainError> {
        let node = self
            .nodes
            .get_mut(hash)
            .ok_or(ChainError::UnknownHash(*hash))?;
        if node.position.is_none() {
            node.position = Some(position);
            node.block_size = block_size;
            node.num_tx = num_tx;
            self.dirty.insert(*hash);
        }
        Ok(())
    }

    /// Recomputes the canonical mapping by walking back from the
    /// highest-work tip. Ties break toward the earliest-seen tip.
    pub fn organize(&mut self) -> ReorganizationState {
        let prev_top = self.top;

        let best_tip = self
            .tips
            .iter()
            .filter_map(|hash| self.nodes.get(hash))
            .max_by(|a, b| {
                a.chain_work
                    .cmp(&b.chain_work)
                    .then(b.seen_index.cmp(&a.seen_index))
            })
            .map(|node| node.hash)
            .unwrap_or(self.genesis_hash);

        // rebuild height -> hash by walking prev links to genesis
        let mut path = Vec::new();
        let mut cursor = best_tip;
        loop {
            let node = self.nodes.get(&cursor).expect("linked header present");
            path.push(cursor);
            if node.height == 0 {
                break;
            }
            cursor = node.header.prev_block;
        }
        path.reverse();

        for hash in &self.canonical {
            if let Some(node) = self.nodes.get_mut(hash) {
                node.is_main = false;
            }
        }
        for hash in &path {
            if let Some(node) = self.nodes.get_mut(hash) {
                node.is_main = true;
            }
        }

        let old_canonical = std::mem::replace(&mut self.canonical, path);
        self.top = best_tip;

        let has_new_top = best_tip != prev_top;
        let mut reorg_branch_point = None;
        if has_new_top {
            // a pure extension keeps the old chain as a prefix; anything
            // else forked at the deepest height both mappings agree on
            let shared = old_canonical
                .iter()
                .zip(self.canonical.iter())
                .take_while(|(old, new)| old == new)
                .count();
            if shared < old_canonical.len() {
                reorg_branch_point = Some(shared.saturating_sub(1) as u32);
            }
        }

        ReorganizationState {
            prev_top,
            new_top: best_tip,
            has_new_top,
            reorg_branch_point,
        }
    }

    /// Drains the set of headers touched since the last call; used to
    /// persist increments.
    pub fn take_dirty(&mut self) -> Vec<Hash256> {
        self.dirty.drain().collect()
    }

    /// Forgets everything but genesis.
    pub fn clear(&mut self) {
        let genesis = self
            .nodes
            .get(&self.genesis_hash)
            .expect("genesis present")
            .header;
        self.nodes.clear();
        self.children.clear();
        self.canonical.clear();
        self.tips.clear();
        self.dups_at_height.clear();
        self.dirty.clear();
        self.insert_genesis(genesis);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGTEST_BITS: u32 = 0x207f_ffff;
    // smaller target than the regtest limit, so each block carries more work
    const STRONGER_BITS: u32 = 0x2000_ffff;

    fn header(prev: Hash256, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0u8; 32],
            time: 1_600_000_000,
            bits: REGTEST_BITS,
            nonce,
        }
    }

    fn genesis() -> BlockHeader {
        header([0u8; 32], 0)
    }

    #[test]
    fn add_header_is_idempotent() {
        let mut chain = Blockchain::new(genesis());
        let block1 = header(chain.genesis_hash(), 1);
        assert!(chain.add_header(block1).expect("insert"));
        assert!(!chain.add_header(block1).expect("reinsert"));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn orphan_parent_rejected() {
        let mut chain = Blockchain::new(genesis());
        let stray = header([9u8; 32], 1);
        assert!(matches!(
            chain.add_header(stray),
            Err(ChainError::OrphanHeader(_))
        ));
    }

    #[test]
    fn organize_extends_without_branch_point() {
        let mut chain = Blockchain::new(genesis());
        let block1 = header(chain.genesis_hash(), 1);
        let block2 = header(block1.hash(), 2);
        chain.add_header(block1).expect("insert");
        chain.add_header(block2).expect("insert");

        let state = chain.organize();
        assert!(state.has_new_top);
        assert_eq!(state.reorg_branch_point, None);
        assert_eq!(chain.top_height(), 2);
        assert_eq!(chain.get_by_height(2).expect("top").hash, block2.hash());
    }

    #[test]
    fn longer_fork_reorganizes_at_branch_point() {
        let mut chain = Blockchain::new(genesis());
        let block1 = header(chain.genesis_hash(), 1);
        let block2a = header(block1.hash(), 2);
        let block3a = header(block2a.hash(), 3);
        for block in [block1, block2a, block3a] {
            chain.add_header(block).expect("insert");
        }
        chain.organize();
        assert_eq!(chain.top().hash, block3a.hash());

        // competing branch from height 2, one block longer
        let block2b = header(block1.hash(), 20);
        let block3b = header(block2b.hash(), 30);
        let block4b = header(block3b.hash(), 40);
        for block in [block2b, block3b, block4b] {
            chain.add_header(block).expect("insert");
        }

        let state = chain.organize();
        assert!(state.has_new_top);
        assert_eq!(state.reorg_branch_point, Some(1));
        assert_eq!(chain.top_height(), 4);
        assert_eq!(chain.get_by_height(2).expect("main").hash, block2b.hash());

        // the orphaned branch is still known by hash
        assert!(chain.contains(&block2a.hash()));
        assert!(!chain.get_by_hash(&block2a.hash()).expect("node").is_main);
    }

    #[test]
    fn tie_breaks_to_earliest_seen() {
        let mut chain = Blockchain::new(genesis());
        let block1a = header(chain.genesis_hash(), 1);
        let block1b = header(chain.genesis_hash(), 2);
        chain.add_header(block1a).expect("insert");
        chain.add_header(block1b).expect("insert");

        chain.organize();
        assert_eq!(chain.top().hash, block1a.hash());
        assert_eq!(chain.get_by_hash(&block1b.hash()).expect("b").dup_id, 1);
    }

    #[test]
    fn more_work_beats_more_blocks() {
        let mut chain = Blockchain::new(genesis());
        // two blocks at the regtest limit
        let easy1 = header(chain.genesis_hash(), 1);
        let easy2 = header(easy1.hash(), 2);
        chain.add_header(easy1).expect("insert");
        chain.add_header(easy2).expect("insert");
        chain.organize();
        assert_eq!(chain.top_height(), 2);

        // one much harder block outweighs both
        let mut strong = header(chain.genesis_hash(), 3);
        strong.bits = STRONGER_BITS;
        chain.add_header(strong).expect("insert");
        let state = chain.organize();
        assert!(state.has_new_top);
        assert_eq!(chain.top().hash, strong.hash());
        assert_eq!(chain.top_height(), 1);
    }

    #[test]
    fn position_stamped_once() {
        let mut chain = Blockchain::new(genesis());
        let hash = chain.genesis_hash();
        chain
            .set_position(&hash, BlockFilePosition::new(0, 0), 285, 1)
            .expect("stamp");
        chain
            .set_position(&hash, BlockFilePosition::new(3, 77), 999, 9)
            .expect("restamp ignored");
        let node = chain.get_by_hash(&hash).expect("genesis");
        assert_eq!(node.position, Some(BlockFilePosition::new(0, 0)));
        assert_eq!(node.block_size, 285);
    }

    #[test]
    fn clear_keeps_genesis_only() {
        let mut chain = Blockchain::new(genesis());
        let block1 = header(chain.genesis_hash(), 1);
        chain.add_header(block1).expect("insert");
        chain.organize();
        chain.clear();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain.top_height(), 0);
        assert_eq!(chain.top().hash, chain.genesis_hash());
    }
}
