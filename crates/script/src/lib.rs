//! Standard script classification and script-address derivation.

pub mod standard;

pub use standard::{classify_script_pubkey, script_addr, ScriptAddr, ScriptType, SCRIPT_ADDR_LEN};
