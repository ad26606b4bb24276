//! Network parameters and chain-work arithmetic.

pub mod params;
pub mod work;

pub use params::{chain_params, hash256_from_hex, ChainParams, HexError, Network};
pub use work::{compact_to_u256, u256_to_compact, work_from_bits, CompactError};

/// 32-byte hash, stored little-endian as it appears on the wire.
pub type Hash256 = [u8; 32];
