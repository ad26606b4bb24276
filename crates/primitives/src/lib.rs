//! Wire-level primitives: encoding, hashing, headers, transactions.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod outpoint;
pub mod transaction;

pub use block::{genesis_header, Block, BlockHeader, HEADER_SIZE};
pub use encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxLayout, TxOut};
