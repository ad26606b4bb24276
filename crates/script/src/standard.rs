//! Standard script templates and their canonical address form.

use scrydb_consensus::ChainParams;
use scrydb_primitives::hash::hash160;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScriptType {
    P2Pk,
    P2Pkh,
    P2Sh,
    P2Wpkh,
    P2Wsh,
    Unknown,
}

const OP_0: u8 = 0x00;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

pub const SCRIPT_ADDR_LEN: usize = 21;

/// Version byte + hash160. The canonical identity of a watched script.
pub type ScriptAddr = [u8; SCRIPT_ADDR_LEN];

pub fn classify_script_pubkey(script: &[u8]) -> ScriptType {
    if is_p2pkh(script) {
        ScriptType::P2Pkh
    } else if is_p2sh(script) {
        ScriptType::P2Sh
    } else if is_p2wpkh(script) {
        ScriptType::P2Wpkh
    } else if is_p2wsh(script) {
        ScriptType::P2Wsh
    } else if is_p2pk(script) {
        ScriptType::P2Pk
    } else {
        ScriptType::Unknown
    }
}

/// Maps an output script to the 21-byte address it pays, if it pays one.
///
/// Bare pubkey outputs normalize to the same address as the matching
/// pay-to-pubkey-hash script, so a wallet watches one key either way.
pub fn script_addr(script: &[u8], params: &ChainParams) -> Option<ScriptAddr> {
    match classify_script_pubkey(script) {
        ScriptType::P2Pkh => {
            Some(make_addr(params.p2pkh_prefix, &script[3..23]))
        }
        ScriptType::P2Sh => Some(make_addr(params.p2sh_prefix, &script[2..22])),
        ScriptType::P2Pk => {
            let key_len = script[0] as usize;
            let pubkey = &script[1..1 + key_len];
            Some(make_addr(params.p2pkh_prefix, &hash160(pubkey)))
        }
        ScriptType::P2Wpkh | ScriptType::P2Wsh | ScriptType::Unknown => None,
    }
}

fn make_addr(prefix: u8, hash: &[u8]) -> ScriptAddr {
    let mut addr = [0u8; SCRIPT_ADDR_LEN];
    addr[0] = prefix;
    addr[1..].copy_from_slice(hash);
    addr
}

fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
}

fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == OP_0 && script[1] == 0x14
}

fn is_p2wsh(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_0 && script[1] == 0x20
}

fn is_p2pk(script: &[u8]) -> bool {
    let key_len = match script.first().copied() {
        Some(len @ 33) => len,
        Some(len @ 65) => len,
        _ => return false,
    };

    let expected_len = key_len as usize + 2;
    script.len() == expected_len && script[script.len() - 1] == OP_CHECKSIG
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrydb_consensus::{chain_params, Network};

    fn p2pkh(hash: [u8; 20]) -> Vec<u8> {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&hash);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }

    #[test]
    fn classifies_standard_templates() {
        assert_eq!(classify_script_pubkey(&p2pkh([1u8; 20])), ScriptType::P2Pkh);

        let mut p2sh = vec![OP_HASH160, 0x14];
        p2sh.extend_from_slice(&[2u8; 20]);
        p2sh.push(OP_EQUAL);
        assert_eq!(classify_script_pubkey(&p2sh), ScriptType::P2Sh);

        let mut p2pk = vec![33u8];
        p2pk.extend_from_slice(&[3u8; 33]);
        p2pk.push(OP_CHECKSIG);
        assert_eq!(classify_script_pubkey(&p2pk), ScriptType::P2Pk);

        assert_eq!(classify_script_pubkey(&[0x6a]), ScriptType::Unknown);
    }

    #[test]
    fn p2pk_normalizes_to_p2pkh_addr() {
        let params = chain_params(Network::Regtest);
        let pubkey = [3u8; 33];

        let mut p2pk = vec![33u8];
        p2pk.extend_from_slice(&pubkey);
        p2pk.push(OP_CHECKSIG);

        let p2pkh_script = p2pkh(hash160(&pubkey));

        assert_eq!(
            script_addr(&p2pk, &params),
            script_addr(&p2pkh_script, &params)
        );
    }

    #[test]
    fn addr_carries_network_prefix() {
        let main = chain_params(Network::Mainnet);
        let test = chain_params(Network::Testnet);
        let script = p2pkh([9u8; 20]);
        let main_addr = script_addr(&script, &main).expect("addr");
        let test_addr = script_addr(&script, &test).expect("addr");
        assert_eq!(main_addr[0], 0x00);
        assert_eq!(test_addr[0], 0x6f);
        assert_eq!(main_addr[1..], test_addr[1..]);
    }

    #[test]
    fn witness_scripts_have_no_addr() {
        let params = chain_params(Network::Mainnet);
        let mut p2wpkh = vec![OP_0, 0x14];
        p2wpkh.extend_from_slice(&[4u8; 20]);
        assert_eq!(script_addr(&p2wpkh, &params), None);
    }
}
