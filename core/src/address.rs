//! Address encoders and the scriptPubKey/address round trip (C2, used by C5).

use alloc::string::String;
use alloc::vec::Vec;

use bech32::{u5, FromBase32, ToBase32, Variant};

use signer_common::coin::CoinDescriptor;
use signer_common::error::Error;
use signer_common::message::TxOutputScriptType;

use crate::hash::hash160;

/// Which scriptPubKey shape an output or change candidate takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptType {
    /// P2PKH, legacy single-sig.
    SpendAddress,
    /// P2WPKH wrapped in P2SH, single-sig.
    SpendP2shWitnessSingle,
    /// P2WSH wrapped in P2SH, multisig.
    SpendP2shWitnessMulti,
    /// Native segwit v0, single-sig (P2WPKH).
    SpendWitnessSingle,
    /// Native segwit v0, multisig (P2WSH).
    SpendWitnessMulti,
    /// Native segwit v1, taproot (P2TR).
    SpendTaproot,
}

/// Base58Check: `base58(payload || checksum)` where `checksum` is the
/// leading 4 bytes of `SHA256(SHA256(payload))`.
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(version);
    data.extend_from_slice(payload);
    bs58::encode(data).with_check().into_string()
}

pub fn base58check_decode(s: &str) -> Result<(u8, Vec<u8>), Error> {
    let data = bs58::decode(s)
        .with_check(None)
        .into_vec()
        .map_err(|_| Error::DataError)?;
    if data.is_empty() {
        return Err(Error::DataError);
    }
    Ok((data[0], data[1..].to_vec()))
}

/// Encodes a segwit v0/v1 witness program as bech32 (v0) or bech32m (v1),
/// per BIP173/BIP350.
pub fn segwit_encode(hrp: &str, witness_version: u8, program: &[u8]) -> Result<String, Error> {
    let variant = if witness_version == 0 {
        Variant::Bech32
    } else {
        Variant::Bech32m
    };
    let mut data = Vec::with_capacity(1 + program.len());
    data.push(u5::try_from_u8(witness_version).map_err(|_| Error::DataError)?);
    data.extend(program.to_base32());
    bech32::encode(hrp, data, variant).map_err(|_| Error::DataError)
}

pub fn segwit_decode(s: &str) -> Result<(String, u8, Vec<u8>), Error> {
    let (hrp, data, _variant) = bech32::decode(s).map_err(|_| Error::DataError)?;
    if data.is_empty() {
        return Err(Error::DataError);
    }
    let witness_version = data[0].to_u8();
    let program = Vec::<u8>::from_base32(&data[1..]).map_err(|_| Error::DataError)?;
    Ok((hrp, witness_version, program))
}

const CASHADDR_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

fn cashaddr_polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for &d in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07ffffffff) << 5) ^ (d as u64);
        if c0 & 0x01 != 0 {
            c ^= 0x98f2bc8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79b76d99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf33e5fb3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae2eabe2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e4f43e470;
        }
    }
    c ^ 1
}

fn cashaddr_expand_prefix(prefix: &str) -> Vec<u8> {
    let mut out: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    out.push(0);
    out
}

fn bytes_to_5bit(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((data.len() * 8 + 4) / 5);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &b in data {
        acc = (acc << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(((acc >> bits) & 0x1f) as u8);
        }
    }
    if bits > 0 {
        out.push(((acc << (5 - bits)) & 0x1f) as u8);
    }
    out
}

fn bytes_from_5bit(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    for &d in data {
        acc = (acc << 5) | d as u32;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    out
}

/// CashAddr (Bitcoin Cash), BIP-independent: `prefix:type_byte || hash`,
/// base32 with a BCH-style checksum covering the expanded prefix.
pub fn cashaddr_encode(prefix: &str, type_byte: u8, hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + hash.len());
    payload.push(type_byte);
    payload.extend_from_slice(hash);
    let payload_5bit = bytes_to_5bit(&payload);

    let mut checksum_input = cashaddr_expand_prefix(prefix);
    checksum_input.extend_from_slice(&payload_5bit);
    checksum_input.extend_from_slice(&[0u8; 8]);
    let checksum = cashaddr_polymod(&checksum_input);

    let mut out = String::from(prefix);
    out.push(':');
    for &d in &payload_5bit {
        out.push(CASHADDR_CHARSET[d as usize] as char);
    }
    for i in (0..8).rev() {
        let d = ((checksum >> (i * 5)) & 0x1f) as u8;
        out.push(CASHADDR_CHARSET[d as usize] as char);
    }
    out
}

/// Standard RFC 4648 base32 (no padding stripped), used for non-cashaddr
/// display encodings.
pub fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut out = String::new();
    for chunk in bytes_to_5bit_padded(data).chunks(8) {
        for &d in chunk {
            out.push(ALPHABET[d as usize] as char);
        }
    }
    out
}

fn bytes_to_5bit_padded(data: &[u8]) -> Vec<u8> {
    let mut out = bytes_to_5bit(data);
    while out.len() % 8 != 0 {
        out.push(0);
    }
    out
}

/// `HASH160(pubkey)` address: Base58Check over `version || hash160(pubkey)`.
pub fn p2pkh_address(coin: &CoinDescriptor, pubkey_compressed: &[u8; 33]) -> String {
    base58check_encode(coin.address_version, &hash160(pubkey_compressed))
}

/// Native segwit v0 P2WPKH address.
pub fn p2wpkh_address(coin: &CoinDescriptor, pubkey_compressed: &[u8; 33]) -> Result<String, Error> {
    let hrp = coin.bech32_hrp.ok_or(Error::DataError)?;
    segwit_encode(hrp, 0, &hash160(pubkey_compressed))
}

/// P2WPKH wrapped in P2SH.
pub fn p2sh_p2wpkh_address(coin: &CoinDescriptor, pubkey_compressed: &[u8; 33]) -> String {
    let mut redeem = Vec::with_capacity(22);
    redeem.push(0x00);
    redeem.push(0x14);
    redeem.extend_from_slice(&hash160(pubkey_compressed));
    base58check_encode(coin.address_version_p2sh, &hash160(&redeem))
}

/// P2WSH wrapped in P2SH (multisig).
pub fn p2sh_p2wsh_address(coin: &CoinDescriptor, witness_script: &[u8]) -> String {
    use crate::hash::{Hasher, Sha256};
    let script_hash = Sha256::hash(witness_script);
    let mut redeem = Vec::with_capacity(34);
    redeem.push(0x00);
    redeem.push(0x20);
    redeem.extend_from_slice(&script_hash);
    base58check_encode(coin.address_version_p2sh, &hash160(&redeem))
}

/// Native segwit v0 P2WSH (multisig) address.
pub fn p2wsh_address(coin: &CoinDescriptor, witness_script: &[u8]) -> Result<String, Error> {
    use crate::hash::{Hasher, Sha256};
    let hrp = coin.bech32_hrp.ok_or(Error::DataError)?;
    let script_hash = Sha256::hash(witness_script);
    segwit_encode(hrp, 0, &script_hash)
}

/// Native segwit v1 taproot address, over the already-tweaked x-only output key.
pub fn p2tr_address(coin: &CoinDescriptor, tweaked_x_only_pubkey: &[u8; 32]) -> Result<String, Error> {
    let hrp = coin.bech32_hrp.ok_or(Error::DataError)?;
    segwit_encode(hrp, 1, tweaked_x_only_pubkey)
}

/// Classic P2PKH scriptPubKey: `OP_DUP OP_HASH160 push(20) <hash> OP_EQUALVERIFY OP_CHECKSIG`.
/// Also the BIP143 scriptCode for a P2WPKH/P2SH-P2WPKH input owned by the same key.
pub fn p2pkh_script_pubkey(pubkey_compressed: &[u8; 33]) -> Vec<u8> {
    p2pkh_script_pubkey_from_hash(&hash160(pubkey_compressed))
}

pub fn p2pkh_script_pubkey_from_hash(hash: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(25);
    out.push(0x76);
    out.push(0xa9);
    out.push(0x14);
    out.extend_from_slice(hash);
    out.push(0x88);
    out.push(0xac);
    out
}

/// Native segwit v0 P2WPKH scriptPubKey: `OP_0 push(20) <hash>`.
pub fn p2wpkh_script_pubkey(pubkey_compressed: &[u8; 33]) -> Vec<u8> {
    p2wpkh_script_pubkey_from_hash(&hash160(pubkey_compressed))
}

pub fn p2wpkh_script_pubkey_from_hash(hash: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.push(0x00);
    out.push(0x14);
    out.extend_from_slice(hash);
    out
}

/// P2SH-wrapped P2WPKH scriptPubKey, i.e. `p2sh_script_pubkey` over the
/// `OP_0 push(20) <hash>` witness program redeem script.
pub fn p2sh_p2wpkh_script_pubkey(pubkey_compressed: &[u8; 33]) -> Vec<u8> {
    let redeem = p2wpkh_script_pubkey(pubkey_compressed);
    p2sh_script_pubkey(&redeem)
}

/// P2SH scriptPubKey over an arbitrary redeem script's hash160:
/// `OP_HASH160 push(20) <hash> OP_EQUAL`.
pub fn p2sh_script_pubkey(redeem_script: &[u8]) -> Vec<u8> {
    p2sh_script_pubkey_from_hash(&hash160(redeem_script))
}

pub fn p2sh_script_pubkey_from_hash(hash: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(23);
    out.push(0xa9);
    out.push(0x14);
    out.extend_from_slice(hash);
    out.push(0x87);
    out
}

/// Native segwit v0 P2WSH scriptPubKey: `OP_0 push(32) <sha256(script)>`.
pub fn p2wsh_script_pubkey(witness_script: &[u8]) -> Vec<u8> {
    use crate::hash::{Hasher, Sha256};
    p2wsh_script_pubkey_from_hash(&Sha256::hash(witness_script))
}

pub fn p2wsh_script_pubkey_from_hash(hash: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(34);
    out.push(0x00);
    out.push(0x20);
    out.extend_from_slice(hash);
    out
}

/// Native segwit v1 P2TR scriptPubKey: `OP_1 push(32) <tweaked x-only key>`.
pub fn p2tr_script_pubkey(tweaked_x_only_pubkey: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(34);
    out.push(0x51);
    out.push(0x20);
    out.extend_from_slice(tweaked_x_only_pubkey);
    out
}

/// Recognised scriptPubKey forms for an externally-claimed address, used
/// when validating ownership proofs and non-change outputs. Any other
/// program is rejected rather than guessed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalAddressKind {
    P2pkh,
    P2wpkh,
    P2tr,
}

/// Parses a scriptPubKey into one of the three address kinds this firmware
/// recognises for external ownership claims. This enumeration is
/// deliberately narrow: P2SH and SegWit v0 multisig scripts are never
/// treated as "external" for ownership-proof purposes, only as plain
/// signing outputs.
pub fn classify_external_script(script: &[u8]) -> Result<(ExternalAddressKind, Vec<u8>), Error> {
    match script {
        [0x76, 0xa9, 0x14, rest @ ..] if rest.len() == 22 && rest[20] == 0x88 && rest[21] == 0xac
        => {
            Ok((ExternalAddressKind::P2pkh, rest[..20].to_vec()))
        }
        [0x00, 0x14, hash @ ..] if hash.len() == 20 => {
            Ok((ExternalAddressKind::P2wpkh, hash.to_vec()))
        }
        [0x51, 0x20, program @ ..] if program.len() == 32 => {
            Ok((ExternalAddressKind::P2tr, program.to_vec()))
        }
        _ => Err(Error::DataError),
    }
}

/// Decodes a host-supplied display address into its raw scriptPubKey,
/// cross-checked against `script_type` and the coin's own version
/// bytes/HRP. Used for every non-change output, where the address string is
/// what the device actually confirms on-screen.
pub fn script_pubkey_from_address(coin: &CoinDescriptor, script_type: TxOutputScriptType, address: &str) -> Result<Vec<u8>, Error> {
    match script_type {
        TxOutputScriptType::PayToAddress => {
            let (version, payload) = base58check_decode(address)?;
            if version != coin.address_version || payload.len() != 20 {
                return Err(Error::DataError);
            }
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&payload);
            Ok(p2pkh_script_pubkey_from_hash(&hash))
        }
        TxOutputScriptType::PayToScriptHash => {
            let (version, payload) = base58check_decode(address)?;
            if version != coin.address_version_p2sh || payload.len() != 20 {
                return Err(Error::DataError);
            }
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&payload);
            Ok(p2sh_script_pubkey_from_hash(&hash))
        }
        TxOutputScriptType::PayToWitnessScriptHash => {
            let (hrp, witness_version, program) = segwit_decode(address)?;
            if Some(hrp.as_str()) != coin.bech32_hrp || witness_version != 0 {
                return Err(Error::DataError);
            }
            match program.len() {
                20 => {
                    let mut hash = [0u8; 20];
                    hash.copy_from_slice(&program);
                    Ok(p2wpkh_script_pubkey_from_hash(&hash))
                }
                32 => {
                    let mut hash = [0u8; 32];
                    hash.copy_from_slice(&program);
                    Ok(p2wsh_script_pubkey_from_hash(&hash))
                }
                _ => Err(Error::DataError),
            }
        }
        TxOutputScriptType::PayToTaproot => {
            let (hrp, witness_version, program) = segwit_decode(address)?;
            if Some(hrp.as_str()) != coin.bech32_hrp || witness_version != 1 || program.len() != 32 {
                return Err(Error::DataError);
            }
            let mut xonly = [0u8; 32];
            xonly.copy_from_slice(&program);
            Ok(p2tr_script_pubkey(&xonly))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signer_common::coin::{BITCOIN, LITECOIN};

    #[test]
    fn base58check_round_trips() {
        let encoded = base58check_encode(0x00, &[0u8; 20]);
        let (version, payload) = base58check_decode(&encoded).unwrap();
        assert_eq!(version, 0x00);
        assert_eq!(payload, alloc::vec![0u8; 20]);
    }

    #[test]
    fn p2wpkh_address_round_trips_through_segwit_decode() {
        let pubkey = [0x02u8; 33];
        let addr = p2wpkh_address(&BITCOIN, &pubkey).unwrap();
        let (hrp, version, program) = segwit_decode(&addr).unwrap();
        assert_eq!(hrp, "bc");
        assert_eq!(version, 0);
        assert_eq!(program, hash160(&pubkey).to_vec());
    }

    #[test]
    fn classify_external_script_recognises_p2wpkh_and_p2tr() {
        let mut p2wpkh = alloc::vec![0x00, 0x14];
        p2wpkh.extend_from_slice(&[0xAAu8; 20]);
        let (kind, hash) = classify_external_script(&p2wpkh).unwrap();
        assert_eq!(kind, ExternalAddressKind::P2wpkh);
        assert_eq!(hash, alloc::vec![0xAAu8; 20]);

        let mut p2tr = alloc::vec![0x51, 0x20];
        p2tr.extend_from_slice(&[0xBBu8; 32]);
        let (kind, _) = classify_external_script(&p2tr).unwrap();
        assert_eq!(kind, ExternalAddressKind::P2tr);
    }

    #[test]
    fn classify_external_script_recognises_p2pkh() {
        let mut p2pkh = alloc::vec![0x76, 0xa9, 0x14];
        p2pkh.extend_from_slice(&[0xCCu8; 20]);
        p2pkh.extend_from_slice(&[0x88, 0xac]);
        let (kind, hash) = classify_external_script(&p2pkh).unwrap();
        assert_eq!(kind, ExternalAddressKind::P2pkh);
        assert_eq!(hash, alloc::vec![0xCCu8; 20]);
    }

    #[test]
    fn classify_external_script_rejects_unknown_program() {
        assert!(classify_external_script(&[0x6a, 0x00]).is_err());
    }

    #[test]
    fn p2pkh_script_pubkey_matches_classify_external_script() {
        let pubkey = [0x03u8; 33];
        let script = p2pkh_script_pubkey(&pubkey);
        let (kind, hash) = classify_external_script(&script).unwrap();
        assert_eq!(kind, ExternalAddressKind::P2pkh);
        assert_eq!(hash, hash160(&pubkey).to_vec());
    }

    #[test]
    fn p2wpkh_script_pubkey_matches_classify_external_script() {
        let pubkey = [0x04u8; 33];
        let script = p2wpkh_script_pubkey(&pubkey);
        let (kind, hash) = classify_external_script(&script).unwrap();
        assert_eq!(kind, ExternalAddressKind::P2wpkh);
        assert_eq!(hash, hash160(&pubkey).to_vec());
    }

    #[test]
    fn script_pubkey_from_address_round_trips_p2pkh() {
        let pubkey = [0x05u8; 33];
        let script = p2pkh_script_pubkey(&pubkey);
        let addr = p2pkh_address(&BITCOIN, &pubkey);
        let decoded = script_pubkey_from_address(&BITCOIN, TxOutputScriptType::PayToAddress, &addr).unwrap();
        assert_eq!(decoded, script);
    }

    #[test]
    fn script_pubkey_from_address_round_trips_p2wpkh() {
        let pubkey = [0x06u8; 33];
        let script = p2wpkh_script_pubkey(&pubkey);
        let addr = p2wpkh_address(&BITCOIN, &pubkey).unwrap();
        let decoded = script_pubkey_from_address(&BITCOIN, TxOutputScriptType::PayToWitnessScriptHash, &addr).unwrap();
        assert_eq!(decoded, script);
    }

    #[test]
    fn script_pubkey_from_address_rejects_wrong_coin_version() {
        let pubkey = [0x07u8; 33];
        let addr = p2pkh_address(&BITCOIN, &pubkey);
        assert!(script_pubkey_from_address(&LITECOIN, TxOutputScriptType::PayToAddress, &addr).is_err());
    }

    #[test]
    fn cashaddr_encode_is_deterministic() {
        let a = cashaddr_encode("bitcoincash", 0x00, &[0u8; 20]);
        let b = cashaddr_encode("bitcoincash", 0x00, &[0u8; 20]);
        assert_eq!(a, b);
        assert!(a.starts_with("bitcoincash:"));
    }
}
