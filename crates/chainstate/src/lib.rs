//! Block-file ingestion and watched-address indexing.
//!
//! The flat block files a full node writes are the only input; the output
//! is a key-value index answering balance, history, and UTXO queries for a
//! set of watched script addresses.

pub mod blockfiles;
pub mod chain;
pub mod headers;
pub mod manager;
pub mod records;
pub mod scanner;
pub mod scraddr;

pub use blockfiles::{BlockFilePosition, BlockFileSet, MappedFile};
pub use chain::{Blockchain, ChainError, ReorganizationState};
pub use manager::{BdmConfig, BdmError, BdmState, BlockDataManager, InitMode, ResetMode};
pub use records::{DbType, Spentness, StoredDbInfo, StoredScriptHistory, StoredTxOut};
pub use scanner::{ScanConfig, ScanError};
pub use scraddr::{FilterHooks, ScrAddrFilter};
