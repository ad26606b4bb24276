//! Per-network chain parameter definitions.

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// Constants that distinguish one network's block files and addresses
/// from another's.
#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Four bytes delimiting blocks in the flat files.
    pub magic: [u8; 4],
    pub genesis_hash: Hash256,
    pub genesis_tx_hash: Hash256,
    pub default_port: u16,
    /// Version byte prepended to a pubkey hash160.
    pub p2pkh_prefix: u8,
    /// Version byte prepended to a script hash160.
    pub p2sh_prefix: u8,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            magic: [0xf9, 0xbe, 0xb4, 0xd9],
            genesis_hash: genesis_hash(MAINNET_GENESIS_HASH_HEX),
            genesis_tx_hash: genesis_hash(GENESIS_TX_HASH_HEX),
            default_port: 8333,
            p2pkh_prefix: 0x00,
            p2sh_prefix: 0x05,
        },
        Network::Testnet => ChainParams {
            network,
            magic: [0x0b, 0x11, 0x09, 0x07],
            genesis_hash: genesis_hash(TESTNET_GENESIS_HASH_HEX),
            genesis_tx_hash: genesis_hash(GENESIS_TX_HASH_HEX),
            default_port: 18333,
            p2pkh_prefix: 0x6f,
            p2sh_prefix: 0xc4,
        },
        Network::Regtest => ChainParams {
            network,
            magic: [0xfa, 0xbf, 0xb5, 0xda],
            genesis_hash: genesis_hash(REGTEST_GENESIS_HASH_HEX),
            genesis_tx_hash: genesis_hash(GENESIS_TX_HASH_HEX),
            default_port: 18444,
            p2pkh_prefix: 0x6f,
            p2sh_prefix: 0xc4,
        },
    }
}

const MAINNET_GENESIS_HASH_HEX: &str =
    "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const TESTNET_GENESIS_HASH_HEX: &str =
    "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";
const REGTEST_GENESIS_HASH_HEX: &str =
    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";
const GENESIS_TX_HASH_HEX: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

fn genesis_hash(hex: &str) -> Hash256 {
    match hash256_from_hex(hex) {
        Ok(hash) => hash,
        Err(_) => unreachable!("built-in genesis hash literal"),
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl std::fmt::Display for HexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hex string is not 64 characters"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (big-endian) hex string into a little-endian hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();

    Ok(bytes)
}
