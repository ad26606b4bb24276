//! Persistent record codecs for the index sub-databases.

use std::collections::BTreeMap;

use scrydb_consensus::Hash256;
use scrydb_primitives::encoding::{DecodeError, Decoder, Encoder};
use scrydb_script::{ScriptAddr, SCRIPT_ADDR_LEN};

/// Reserved key under which every sub-database stores its [`StoredDbInfo`].
pub const DB_INFO_KEY: [u8; 1] = [0x00];

pub const TX_KEY_LEN: usize = 6;
pub const TXIO_KEY_LEN: usize = 8;

/// `height(3 BE) || dup(1)`: the per-block slice of any height-keyed row.
pub fn hgtx_key(height: u32, dup: u8) -> [u8; 4] {
    let be = height.to_be_bytes();
    [be[1], be[2], be[3], dup]
}

pub fn parse_hgtx_key(bytes: &[u8]) -> Option<(u32, u8)> {
    if bytes.len() != 4 {
        return None;
    }
    let height = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    Some((height, bytes[3]))
}

/// `HEADERS` row key: `height(4 BE) || dup(1)`.
pub fn header_key(height: u32, dup: u8) -> [u8; 5] {
    let be = height.to_be_bytes();
    [be[0], be[1], be[2], be[3], dup]
}

pub fn parse_header_key(bytes: &[u8]) -> Option<(u32, u8)> {
    if bytes.len() != 5 {
        return None;
    }
    let height = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Some((height, bytes[4]))
}

/// `HISTORY` row key: `addr(21) || height(3 BE) || dup(1)`.
pub fn subssh_key(addr: &ScriptAddr, height: u32, dup: u8) -> [u8; SCRIPT_ADDR_LEN + 4] {
    let mut key = [0u8; SCRIPT_ADDR_LEN + 4];
    key[..SCRIPT_ADDR_LEN].copy_from_slice(addr);
    key[SCRIPT_ADDR_LEN..].copy_from_slice(&hgtx_key(height, dup));
    key
}

/// Identifies a transaction by its block position: `height(3 BE) || dup(1) ||
/// tx-index(2 BE)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxKey([u8; TX_KEY_LEN]);

impl TxKey {
    pub fn new(height: u32, dup: u8, tx_index: u16) -> Self {
        let mut bytes = [0u8; TX_KEY_LEN];
        bytes[..4].copy_from_slice(&hgtx_key(height, dup));
        bytes[4..].copy_from_slice(&tx_index.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TX_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn height(&self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }

    pub fn dup(&self) -> u8 {
        self.0[3]
    }
}

/// Identifies a single input or output: a [`TxKey`] plus a 2-byte io index.
/// Byte order follows numeric order, so ranges scan in chain order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TxIoKey([u8; TXIO_KEY_LEN]);

impl TxIoKey {
    pub fn new(height: u32, dup: u8, tx_index: u16, io_index: u16) -> Self {
        let mut bytes = [0u8; TXIO_KEY_LEN];
        bytes[..4].copy_from_slice(&hgtx_key(height, dup));
        bytes[4..6].copy_from_slice(&tx_index.to_be_bytes());
        bytes[6..].copy_from_slice(&io_index.to_be_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TXIO_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn tx_key(&self) -> TxKey {
        TxKey::from_slice(&self.0[..TX_KEY_LEN]).expect("txio key prefix")
    }

    pub fn height(&self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }

    pub fn dup(&self) -> u8 {
        self.0[3]
    }

    pub fn io_index(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Spentness {
    Unspent,
    Spent(TxIoKey),
}

/// A transaction output persisted because it pays a watched address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredTxOut {
    /// The raw output bytes (value, script length, script).
    pub raw: Vec<u8>,
    pub parent_hash: Hash256,
    pub height: u32,
    pub dup: u8,
    pub tx_index: u16,
    pub out_index: u16,
    pub script_addr: ScriptAddr,
    pub spentness: Spentness,
}

impl StoredTxOut {
    pub fn key(&self) -> TxIoKey {
        TxIoKey::new(self.height, self.dup, self.tx_index, self.out_index)
    }

    pub fn parent_tx_key(&self) -> TxKey {
        TxKey::new(self.height, self.dup, self.tx_index)
    }

    /// Output value, read from the raw bytes.
    pub fn value(&self) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.raw[..8]);
        i64::from_le_bytes(raw)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash_le(&self.parent_hash);
        encoder.write_u32_le(self.height);
        encoder.write_u8(self.dup);
        encoder.write_u16_le(self.tx_index);
        encoder.write_u16_le(self.out_index);
        encoder.write_bytes(&self.script_addr);
        match self.spentness {
            Spentness::Unspent => encoder.write_u8(0),
            Spentness::Spent(by) => {
                encoder.write_u8(1);
                encoder.write_bytes(by.as_bytes());
            }
        }
        encoder.write_var_bytes(&self.raw);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let parent_hash = decoder.read_hash_le()?;
        let height = decoder.read_u32_le()?;
        let dup = decoder.read_u8()?;
        let tx_index = decoder.read_u16_le()?;
        let out_index = decoder.read_u16_le()?;
        let addr_bytes = decoder.read_fixed::<SCRIPT_ADDR_LEN>()?;
        let spentness = match decoder.read_u8()? {
            0 => Spentness::Unspent,
            1 => {
                let key = decoder.read_fixed::<TXIO_KEY_LEN>()?;
                Spentness::Spent(TxIoKey(key))
            }
            _ => return Err(DecodeError::InvalidData("bad spentness tag")),
        };
        let raw = decoder.read_var_bytes()?;
        if raw.len() < 8 {
            return Err(DecodeError::InvalidData("txout shorter than its value"));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            raw,
            parent_hash,
            height,
            dup,
            tx_index,
            out_index,
            script_addr: addr_bytes,
            spentness,
        })
    }
}

/// One receive or spend event for an address at a block height.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxIoPair {
    pub txout_key: TxIoKey,
    pub txin_key: Option<TxIoKey>,
    pub value: i64,
}

/// Per-address, per-height history slice: the unit of incremental write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredSubSsh {
    pub txios: BTreeMap<TxIoKey, TxIoPair>,
}

impl StoredSubSsh {
    pub fn insert(&mut self, key: TxIoKey, pair: TxIoPair) {
        self.txios.insert(key, pair);
    }

    pub fn merge(&mut self, other: &StoredSubSsh) {
        for (key, pair) in &other.txios {
            self.txios.insert(*key, *pair);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.txios.len() as u64);
        for (key, pair) in &self.txios {
            encoder.write_bytes(key.as_bytes());
            encoder.write_bytes(pair.txout_key.as_bytes());
            match pair.txin_key {
                None => encoder.write_u8(0),
                Some(txin) => {
                    encoder.write_u8(1);
                    encoder.write_bytes(txin.as_bytes());
                }
            }
            encoder.write_i64_le(pair.value);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()?;
        let mut txios = BTreeMap::new();
        for _ in 0..count {
            let key = TxIoKey(decoder.read_fixed::<TXIO_KEY_LEN>()?);
            let txout_key = TxIoKey(decoder.read_fixed::<TXIO_KEY_LEN>()?);
            let txin_key = match decoder.read_u8()? {
                0 => None,
                1 => Some(TxIoKey(decoder.read_fixed::<TXIO_KEY_LEN>()?)),
                _ => return Err(DecodeError::InvalidData("bad txio flag")),
            };
            let value = decoder.read_i64_le()?;
            txios.insert(
                key,
                TxIoPair {
                    txout_key,
                    txin_key,
                    value,
                },
            );
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txios })
    }
}

/// Per-address summary row in `SSH`: the sync cursor plus aggregates folded
/// from the address's sub-histories.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoredScriptHistory {
    pub sync_height: u32,
    pub txio_count: u64,
    pub balance: i64,
}

impl StoredScriptHistory {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(self.sync_height);
        encoder.write_u64_le(self.txio_count);
        encoder.write_i64_le(self.balance);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let sync_height = decoder.read_u32_le()?;
        let txio_count = decoder.read_u64_le()?;
        let balance = decoder.read_i64_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            sync_height,
            txio_count,
            balance,
        })
    }
}

pub const TX_HINT_PREFIX_LEN: usize = 4;

/// Maps the first four bytes of a tx hash to the tx keys that may carry it.
/// Prefix collisions are expected; hints accumulate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoredTxHint {
    pub tx_keys: Vec<TxKey>,
}

impl StoredTxHint {
    pub fn preferred(&self) -> Option<TxKey> {
        self.tx_keys.first().copied()
    }

    /// Appends `key` unless already hinted, keeping replays idempotent.
    pub fn add(&mut self, key: TxKey) {
        if !self.tx_keys.contains(&key) {
            self.tx_keys.push(key);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.tx_keys.len() as u64);
        for key in &self.tx_keys {
            encoder.write_bytes(key.as_bytes());
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()?;
        let mut tx_keys = Vec::with_capacity(count as usize);
        for _ in 0..count {
            tx_keys.push(TxKey(decoder.read_fixed::<TX_KEY_LEN>()?));
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { tx_keys })
    }
}

pub fn tx_hint_prefix(tx_hash: &Hash256) -> [u8; TX_HINT_PREFIX_LEN] {
    [tx_hash[0], tx_hash[1], tx_hash[2], tx_hash[3]]
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DbType {
    Bare,
    Full,
    Super,
}

impl DbType {
    pub fn as_u8(self) -> u8 {
        match self {
            DbType::Bare => 0,
            DbType::Full => 1,
            DbType::Super => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(DbType::Bare),
            1 => Some(DbType::Full),
            2 => Some(DbType::Super),
            _ => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "BARE" => Some(DbType::Bare),
            "FULL" => Some(DbType::Full),
            "SUPER" => Some(DbType::Super),
            _ => None,
        }
    }
}

/// Per-sub-database info record. Its top block hash is the atomic resume
/// point: a batch that did not advance it did not commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredDbInfo {
    pub magic: [u8; 4],
    pub db_type: DbType,
    pub top_hash: Hash256,
    pub top_height: u32,
}

impl StoredDbInfo {
    pub fn fresh(magic: [u8; 4], db_type: DbType) -> Self {
        Self {
            magic,
            db_type,
            top_hash: [0u8; 32],
            top_height: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&self.magic);
        encoder.write_u8(self.db_type.as_u8());
        encoder.write_hash_le(&self.top_hash);
        encoder.write_u32_le(self.top_height);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let magic = decoder.read_fixed::<4>()?;
        let db_type = DbType::from_u8(decoder.read_u8()?)
            .ok_or(DecodeError::InvalidData("unknown db type"))?;
        let top_hash = decoder.read_hash_le()?;
        let top_height = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            magic,
            db_type,
            top_hash,
            top_height,
        })
    }
}

/// `BLKDATA` row: where a block's body sits on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredBlockData {
    pub hash: Hash256,
    pub file_num: u32,
    pub offset: u64,
    pub block_size: u32,
    pub num_tx: u32,
}

impl StoredBlockData {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_hash_le(&self.hash);
        encoder.write_u32_le(self.file_num);
        encoder.write_u64_le(self.offset);
        encoder.write_u32_le(self.block_size);
        encoder.write_u32_le(self.num_tx);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let hash = decoder.read_hash_le()?;
        let file_num = decoder.read_u32_le()?;
        let offset = decoder.read_u64_le()?;
        let block_size = decoder.read_u32_le()?;
        let num_tx = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            hash,
            file_num,
            offset,
            block_size,
            num_tx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txio_keys_sort_by_chain_order() {
        let a = TxIoKey::new(2, 0, 0, 0);
        let b = TxIoKey::new(2, 0, 0, 1);
        let c = TxIoKey::new(2, 0, 1, 0);
        let d = TxIoKey::new(3, 0, 0, 0);
        let e = TxIoKey::new(256, 0, 0, 0);
        let mut keys = vec![e, c, a, d, b];
        keys.sort();
        assert_eq!(keys, vec![a, b, c, d, e]);
        assert_eq!(e.height(), 256);
        assert_eq!(c.io_index(), 0);
        assert_eq!(c.tx_key(), TxKey::new(2, 0, 1));
    }

    #[test]
    fn stxo_round_trip_spent_and_unspent() {
        let mut raw = 77_000i64.to_le_bytes().to_vec();
        raw.extend_from_slice(&[0x01, 0x51]);
        let mut stxo = StoredTxOut {
            raw,
            parent_hash: [9u8; 32],
            height: 120,
            dup: 1,
            tx_index: 3,
            out_index: 0,
            script_addr: [5u8; 21],
            spentness: Spentness::Unspent,
        };
        let decoded = StoredTxOut::decode(&stxo.encode()).expect("decode");
        assert_eq!(decoded, stxo);
        assert_eq!(decoded.value(), 77_000);

        stxo.spentness = Spentness::Spent(TxIoKey::new(121, 0, 0, 1));
        let decoded = StoredTxOut::decode(&stxo.encode()).expect("decode");
        assert_eq!(decoded, stxo);
    }

    #[test]
    fn subssh_round_trip() {
        let mut subssh = StoredSubSsh::default();
        let receive = TxIoKey::new(2, 0, 0, 0);
        subssh.insert(
            receive,
            TxIoPair {
                txout_key: receive,
                txin_key: None,
                value: 50,
            },
        );
        let spend = TxIoKey::new(4, 0, 1, 0);
        subssh.insert(
            spend,
            TxIoPair {
                txout_key: receive,
                txin_key: Some(spend),
                value: 50,
            },
        );
        let decoded = StoredSubSsh::decode(&subssh.encode()).expect("decode");
        assert_eq!(decoded, subssh);
    }

    #[test]
    fn tx_hint_add_is_idempotent() {
        let mut hint = StoredTxHint::default();
        let key = TxKey::new(7, 0, 2);
        hint.add(key);
        hint.add(key);
        hint.add(TxKey::new(8, 0, 0));
        assert_eq!(hint.tx_keys.len(), 2);
        assert_eq!(hint.preferred(), Some(key));
        let decoded = StoredTxHint::decode(&hint.encode()).expect("decode");
        assert_eq!(decoded, hint);
    }

    #[test]
    fn db_info_round_trip() {
        let info = StoredDbInfo {
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            db_type: DbType::Full,
            top_hash: [3u8; 32],
            top_height: 42,
        };
        assert_eq!(StoredDbInfo::decode(&info.encode()).expect("decode"), info);
    }
}
