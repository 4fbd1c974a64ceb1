//! Ethereum signing engine (C6).
//!
//! A streamed RLP-hash signer for legacy and EIP-1559 transactions, and
//! EIP-191 personal messages. Unlike the UTXO engine, there is no
//! multi-phase confirmation loop: the host streams `data` in chunks, the
//! engine keccak-hashes each chunk as it arrives, and a single signature is
//! produced once the stream ends.

use alloc::vec::Vec;

use signer_common::constants::{ERC20_TRANSFER_SELECTOR, ETH_DATA_CHUNK_SIZE};
use signer_common::error::Error;
use signer_common::token;

use crate::crypto::{self, RecoverableSignature};
use crate::hash::{Hasher, Keccak256};
use crate::keys::HdNode;

/// RLP length/header encoding (strings and lists share the same scheme).
mod rlp {
    use alloc::vec::Vec;

    /// Minimal big-endian encoding with leading zero bytes stripped; RLP
    /// treats a scalar as the shortest byte string representing it.
    pub fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
        let mut i = 0;
        while i < bytes.len() - 1 && bytes[i] == 0 {
            i += 1;
        }
        &bytes[i..]
    }

    fn encode_length(len: usize, offset: u8) -> Vec<u8> {
        if len < 56 {
            alloc::vec![offset + len as u8]
        } else {
            let len_bytes = len.to_be_bytes();
            let trimmed = trim_leading_zeros(&len_bytes);
            let mut out = alloc::vec![offset + 55 + trimmed.len() as u8];
            out.extend_from_slice(trimmed);
            out
        }
    }

    pub fn string_header(len: usize) -> Vec<u8> {
        encode_length(len, 0x80)
    }

    pub fn list_header(payload_len: usize) -> Vec<u8> {
        encode_length(payload_len, 0xc0)
    }

    /// RLP-encodes a scalar field: a single byte below `0x80` encodes to
    /// itself, everything else gets a string header.
    pub fn field(raw: &[u8]) -> Vec<u8> {
        let trimmed = if raw.iter().all(|&b| b == 0) {
            &[][..]
        } else {
            trim_leading_zeros(raw)
        };
        if trimmed.len() == 1 && trimmed[0] < 0x80 {
            alloc::vec![trimmed[0]]
        } else {
            let mut out = string_header(trimmed.len());
            out.extend_from_slice(trimmed);
            out
        }
    }

    pub fn field_len(raw: &[u8]) -> usize {
        field(raw).len()
    }
}

/// Which transaction envelope is being signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Legacy,
    Eip1559,
}

/// One access-list entry: an address plus the storage keys touched under it.
pub struct AccessListItem {
    pub address: [u8; 20],
    pub storage_keys: Vec<[u8; 32]>,
}

fn encode_access_list(items: &[AccessListItem]) -> Vec<u8> {
    let mut entries = Vec::new();
    for item in items {
        let storage_payload_len = item.storage_keys.len() * 33;
        let storage_header = rlp::list_header(storage_payload_len);
        let entry_payload_len = 1 + 20 + storage_header.len() + storage_payload_len;
        let entry_header = rlp::list_header(entry_payload_len);

        entries.extend_from_slice(&entry_header);
        entries.extend_from_slice(&rlp::string_header(20));
        entries.extend_from_slice(&item.address);
        entries.extend_from_slice(&storage_header);
        for key in &item.storage_keys {
            entries.extend_from_slice(&rlp::string_header(32));
            entries.extend_from_slice(key);
        }
    }
    let mut out = rlp::list_header(entries.len());
    out.extend_from_slice(&entries);
    out
}

/// Formats a big-endian `uint256` calldata argument as `amount / 10^decimals`,
/// so the UI can show "12.5 USDC" instead of a raw wei figure.
fn format_token_amount(raw_be: &[u8], decimals: u8) -> alloc::string::String {
    use alloc::string::ToString;
    use num_bigint::BigUint;
    use num_traits::Zero;

    let amount = BigUint::from_bytes_be(raw_be);
    if decimals == 0 {
        return amount.to_string();
    }
    let base = BigUint::from(10u32).pow(decimals as u32);
    let whole = &amount / &base;
    let frac = &amount % &base;
    if frac.is_zero() {
        return whole.to_string();
    }
    let mut frac_str = frac.to_string();
    while frac_str.len() < decimals as usize {
        frac_str.insert(0, '0');
    }
    let frac_str = frac_str.trim_end_matches('0');
    alloc::format!("{whole}.{frac_str}")
}

fn address_field_len(to_is_contract_creation: bool) -> usize {
    if to_is_contract_creation {
        1
    } else {
        1 + 20
    }
}

/// Bound to one Ethereum transaction from `EthereumSignTx` to the final
/// signature. Holds the running Keccak state over the RLP payload; `data`
/// is streamed in chunks bounded by `ETH_DATA_CHUNK_SIZE`.
pub struct EthereumSignContext {
    kind: TxKind,
    node: HdNode,
    chain_id: u64,
    to: [u8; 20],
    value: Vec<u8>,
    nonce: Vec<u8>,
    gas_limit: Vec<u8>,
    gas_price: Vec<u8>,
    max_fee_per_gas: Vec<u8>,
    max_priority_fee_per_gas: Vec<u8>,
    access_list: Vec<AccessListItem>,

    hasher: Keccak256,
    data_total_len: u32,
    data_left: u32,
    prefix_written: bool,
    /// Bytes to append after the data stream: the chain-id/empty-r/empty-s
    /// tail on a legacy (EIP-155) transaction, or the encoded access list
    /// on EIP-1559. Fixed at construction time since both are known
    /// up front; only the `data` field is genuinely streamed.
    tail: Vec<u8>,

    pub known_token: Option<token::TokenInfo>,
    /// `amount / 10^decimals`, rendered as a decimal string, once a known
    /// token transfer has been detected.
    pub known_token_amount: Option<alloc::string::String>,
}

impl EthereumSignContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: TxKind,
        node: HdNode,
        chain_id: u64,
        to: [u8; 20],
        value: Vec<u8>,
        nonce: Vec<u8>,
        gas_limit: Vec<u8>,
        gas_price: Vec<u8>,
        max_fee_per_gas: Vec<u8>,
        max_priority_fee_per_gas: Vec<u8>,
        data_total_len: u32,
    ) -> Self {
        Self {
            kind,
            node,
            chain_id,
            to,
            value,
            nonce,
            gas_limit,
            gas_price,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            access_list: Vec::new(),
            hasher: Keccak256::new(),
            data_total_len,
            data_left: data_total_len,
            prefix_written: false,
            tail: Vec::new(),
            known_token: None,
            known_token_amount: None,
        }
    }

    /// Installs the EIP-1559 access list. Must be called (if at all) before
    /// the first call to [`feed_data_chunk`].
    pub fn set_access_list(&mut self, access_list: Vec<AccessListItem>) {
        self.access_list = access_list;
    }

    pub fn data_left(&self) -> u32 {
        self.data_left
    }

    /// Size of the next `data` chunk the host should be asked for.
    pub fn next_chunk_request(&self) -> u32 {
        self.data_left.min(ETH_DATA_CHUNK_SIZE)
    }

    /// Detects a compiled-in ERC-20 `transfer(address,uint256)` call from
    /// the first data chunk, so the UI can render "send 12.5 USDC to ..."
    /// instead of a raw hex blob.
    pub fn detect_known_token(&mut self, first_chunk: &[u8]) {
        if first_chunk.len() < 4 + 32 + 32 {
            return;
        }
        if first_chunk[0..4] != ERC20_TRANSFER_SELECTOR {
            return;
        }
        self.known_token = token::lookup(self.chain_id, &self.to);
        if let Some(token) = &self.known_token {
            self.known_token_amount = Some(format_token_amount(&first_chunk[36..68], token.decimals));
        }
    }

    /// Feeds one `data` chunk (the initial chunk from `EthereumSignTx`, or a
    /// subsequent one from `EthereumTxAck`) into the running hash. Per the
    /// invariant, a chunk larger than the declared remaining length aborts
    /// signing rather than silently truncating.
    pub fn feed_data_chunk(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if !self.prefix_written {
            self.write_prefix();
            self.prefix_written = true;
        }
        if chunk.len() as u32 > self.data_left {
            return Err(Error::DataError);
        }
        self.hasher.update(chunk);
        self.data_left -= chunk.len() as u32;
        Ok(())
    }

    fn write_prefix(&mut self) {
        let is_contract_creation = self.to == [0u8; 20];
        let data_total = self.data_total_len as usize;
        let data_header = rlp::string_header(data_total);

        match self.kind {
            TxKind::Legacy => {
                let chain_id_bytes = self.chain_id.to_be_bytes();
                let chain_id_field = rlp::field(&chain_id_bytes);

                let payload_len = rlp::field_len(&self.nonce)
                    + rlp::field_len(&self.gas_price)
                    + rlp::field_len(&self.gas_limit)
                    + address_field_len(is_contract_creation)
                    + rlp::field_len(&self.value)
                    + data_header.len()
                    + data_total
                    + chain_id_field.len()
                    + 1 // empty r
                    + 1; // empty s

                self.hasher.update(&rlp::list_header(payload_len));
                self.hasher.update(&rlp::field(&self.nonce));
                self.hasher.update(&rlp::field(&self.gas_price));
                self.hasher.update(&rlp::field(&self.gas_limit));
                self.write_to_field(is_contract_creation);
                self.hasher.update(&rlp::field(&self.value));
                self.hasher.update(&data_header);

                let mut tail = chain_id_field;
                tail.push(0x80); // empty r
                tail.push(0x80); // empty s
                self.tail = tail;
            }
            TxKind::Eip1559 => {
                let access_list_encoded = encode_access_list(&self.access_list);
                let chain_id_bytes = self.chain_id.to_be_bytes();
                let chain_id_field = rlp::field(&chain_id_bytes);

                let payload_len = chain_id_field.len()
                    + rlp::field_len(&self.nonce)
                    + rlp::field_len(&self.max_priority_fee_per_gas)
                    + rlp::field_len(&self.max_fee_per_gas)
                    + rlp::field_len(&self.gas_limit)
                    + address_field_len(is_contract_creation)
                    + rlp::field_len(&self.value)
                    + data_header.len()
                    + data_total
                    + access_list_encoded.len();

                self.hasher.update(&[0x02]);
                self.hasher.update(&rlp::list_header(payload_len));
                self.hasher.update(&chain_id_field);
                self.hasher.update(&rlp::field(&self.nonce));
                self.hasher.update(&rlp::field(&self.max_priority_fee_per_gas));
                self.hasher.update(&rlp::field(&self.max_fee_per_gas));
                self.hasher.update(&rlp::field(&self.gas_limit));
                self.write_to_field(is_contract_creation);
                self.hasher.update(&rlp::field(&self.value));
                self.hasher.update(&data_header);

                self.tail = access_list_encoded;
            }
        }
    }

    fn write_to_field(&mut self, is_contract_creation: bool) {
        if is_contract_creation {
            self.hasher.update(&[0x80]);
        } else {
            self.hasher.update(&rlp::string_header(20));
            self.hasher.update(&self.to);
        }
    }

    /// Finishes the RLP stream (the chain-id tail on legacy, the access
    /// list on EIP-1559) once `data_left` has reached zero, derives the
    /// digest, and produces a canonical-retry ECDSA signature.
    pub fn finish(mut self) -> Result<(u32, RecoverableSignature), Error> {
        if self.data_left != 0 {
            return Err(Error::ProcessError);
        }
        if !self.prefix_written {
            // Zero-length data transaction: the prefix is written lazily on
            // the first chunk, but there was never a chunk to feed.
            self.write_prefix();
        }

        self.hasher.update(&self.tail);
        let digest = self.hasher.finalize();
        let sig = crypto::ecdsa_sign_digest_canonical(&self.node.privkey, &digest, |recid| recid & 0x02 == 0)?;

        let v = match self.kind {
            // EIP-155: v = recovery_id + 2*chain_id + 35, or the raw bit if
            // chain_id is too large to fit the legacy v scheme.
            TxKind::Legacy => {
                let base = 2u64.checked_mul(self.chain_id).and_then(|x| x.checked_add(35));
                match base {
                    Some(base) if base <= u32::MAX as u64 - 1 => base as u32 + sig.recovery_id as u32,
                    _ => sig.recovery_id as u32,
                }
            }
            TxKind::Eip1559 => sig.recovery_id as u32,
        };

        Ok((v, sig))
    }
}

/// EIP-191 personal-sign: `keccak256("\x19Ethereum Signed Message:\n" || ascii(len) || message)`.
pub fn sign_personal_message(node: &HdNode, message: &[u8]) -> Result<(u32, RecoverableSignature), Error> {
    let digest = personal_message_digest(message);
    let sig = crypto::ecdsa_sign_digest_canonical(&node.privkey, &digest, |_| true)?;
    Ok((sig.recovery_id as u32 + 27, sig))
}

fn personal_message_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n");
    hasher.update(alloc::format!("{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize()
}

/// Recovers the signing address (last 20 bytes of keccak256 of the
/// uncompressed pubkey) from a signature over an EIP-191 personal message.
pub fn recover_personal_message_address(message: &[u8], sig: &RecoverableSignature) -> Result<[u8; 20], Error> {
    let digest = personal_message_digest(message);
    let pubkey = crypto::ecdsa_recover_from_sig(sig, &digest)?;
    let hash = Keccak256::hash(&pubkey[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Curve;

    fn test_node() -> HdNode {
        HdNode {
            curve: Curve::Secp256k1,
            chaincode: [0u8; 32],
            privkey: [0x13u8; 32],
        }
    }

    #[test]
    fn legacy_eip155_v_encodes_chain_id() {
        let mut ctx = EthereumSignContext::new(
            TxKind::Legacy,
            test_node(),
            1,
            [0x11u8; 20],
            alloc::vec![0x01],
            alloc::vec![0x00],
            alloc::vec![0x52, 0x08],
            alloc::vec![0x04, 0xa8, 0x17, 0xc8, 0x00],
            Vec::new(),
            Vec::new(),
            0,
        );
        let (v, _sig) = ctx.finish().unwrap();
        assert!(v == 37 || v == 38);
    }

    #[test]
    fn eip1559_v_is_raw_recovery_bit() {
        let ctx = EthereumSignContext::new(
            TxKind::Eip1559,
            test_node(),
            1,
            [0x11u8; 20],
            alloc::vec![0x01],
            alloc::vec![0x00],
            Vec::new(),
            alloc::vec![0x52, 0x08],
            alloc::vec![0x04, 0xa8, 0x17, 0xc8, 0x00],
            alloc::vec![0x3b, 0x9a, 0xca, 0x00],
            0,
        );
        let (v, _sig) = ctx.finish().unwrap();
        assert!(v == 0 || v == 1);
    }

    #[test]
    fn oversize_data_chunk_is_rejected() {
        let mut ctx = EthereumSignContext::new(
            TxKind::Legacy,
            test_node(),
            1,
            [0x11u8; 20],
            alloc::vec![0x01],
            alloc::vec![0x00],
            alloc::vec![0x52, 0x08],
            alloc::vec![0x04, 0xa8, 0x17, 0xc8, 0x00],
            Vec::new(),
            Vec::new(),
            4,
        );
        assert_eq!(ctx.feed_data_chunk(&[1, 2, 3, 4, 5]).unwrap_err(), Error::DataError);
    }

    #[test]
    fn known_token_detected_from_selector_and_address() {
        let mut ctx = EthereumSignContext::new(
            TxKind::Legacy,
            test_node(),
            1,
            [
                0xA0, 0xb8, 0x69, 0x91, 0xc6, 0x21, 0x8b, 0x36, 0xc1, 0xd1, 0x9D, 0x4a, 0x2e, 0x9E,
                0xb0, 0xcE, 0x36, 0x06, 0xeB, 0x48,
            ],
            Vec::new(),
            alloc::vec![0x00],
            alloc::vec![0x52, 0x08],
            alloc::vec![0x04, 0xa8, 0x17, 0xc8, 0x00],
            Vec::new(),
            Vec::new(),
            68,
        );
        let mut chunk = ERC20_TRANSFER_SELECTOR.to_vec();
        chunk.extend_from_slice(&[0u8; 32]); // recipient address, padded
        let mut amount = [0u8; 32];
        amount[24..].copy_from_slice(&12_500_000u64.to_be_bytes()); // 12.5 USDC (6 decimals)
        chunk.extend_from_slice(&amount);
        ctx.detect_known_token(&chunk);
        assert_eq!(ctx.known_token.as_ref().unwrap().symbol, "USDC");
        assert_eq!(ctx.known_token_amount.as_deref(), Some("12.5"));
    }

    #[test]
    fn personal_sign_round_trip_recovers_signer() {
        let node = test_node();
        let (_, sig) = sign_personal_message(&node, b"hello world").unwrap();
        let pubkey = crypto::secp256k1_public_key(&node.privkey).unwrap();
        let expected_hash = Keccak256::hash(&pubkey[1..]);
        let mut expected_address = [0u8; 20];
        expected_address.copy_from_slice(&expected_hash[12..]);

        let recovered = recover_personal_message_address(b"hello world", &sig).unwrap();
        assert_eq!(recovered, expected_address);
    }
}
