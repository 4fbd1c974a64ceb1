//! UTXO signing engine (C5).
//!
//! A streamed, multi-phase transaction signer for Bitcoin-family coins.
//! [`SignTxContext`] is the UTXO arm of the top-level `ActiveSigner` (see
//! [`crate::signer`]); it is driven exclusively through the per-phase
//! `process_*` methods, one `TxAck` at a time.

use alloc::string::String;
use alloc::vec::Vec;

use signer_common::coin::{Capabilities, CoinDescriptor, TxHasher};
use signer_common::constants::{BIP32_CHANGE_CHAIN, BIP32_MAX_LAST_ELEMENT, SIGHASH_ALL, SIGHASH_FORKID};
use signer_common::error::Error;
use signer_common::message::{PrevTxInput, PrevTxMeta, PrevTxOutput, TxRequestPhase};

use crate::address::ScriptType;
use crate::crypto::{self, RecoverableSignature};
use crate::hash::{hash160, Blake2bPersonalized, Hasher, Sha256, Sha256d};
use crate::keys::HdNode;

/// Running SHA-256d or personalised BLAKE2b accumulator, chosen per coin.
enum Accumulator {
    Sha256d(Sha256d),
    Blake2b(Blake2bPersonalized),
}

impl Accumulator {
    fn new(coin: &CoinDescriptor, personalization: &[u8; 16]) -> Self {
        match coin.tx_hasher {
            TxHasher::Sha256d => Accumulator::Sha256d(Sha256d::new()),
            TxHasher::Blake2bPersonalized => Accumulator::Blake2b(Blake2bPersonalized::new(personalization)),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Accumulator::Sha256d(h) => {
                h.update(data);
            }
            Accumulator::Blake2b(h) => {
                h.update(data);
            }
        }
    }

    fn finalize(self) -> [u8; 32] {
        match self {
            Accumulator::Sha256d(h) => h.finalize(),
            Accumulator::Blake2b(h) => h.finalize(),
        }
    }
}

/// One prepared input, as confirmed in phase 1 and re-validated in phase 2.
#[derive(Clone)]
pub struct PreparedInput {
    pub address_n: Vec<u32>,
    pub prev_hash: [u8; 32],
    pub prev_index: u32,
    pub amount: u64,
    pub sequence: u32,
    pub script_type: ScriptType,
    pub is_segwit: bool,
    /// Redeem/witness script for `SpendP2shWitnessMulti`/`SpendWitnessMulti`.
    pub multisig_script: Option<Vec<u8>>,
    /// Other cosigners' `(DER signature, sighash_type)` pairs.
    pub multisig_signatures: Option<Vec<(Vec<u8>, u8)>>,
}

/// One prepared output, classified as change or requiring confirmation.
#[derive(Clone)]
pub struct PreparedOutput {
    pub amount: u64,
    pub script_pubkey: Vec<u8>,
    pub is_change: bool,
    pub display_address: Option<String>,
}

/// Bound to one transaction from `SignTx` to `TxFinished`.
pub struct SignTxContext {
    pub coin: &'static CoinDescriptor,
    pub input_count: u32,
    pub output_count: u32,
    pub lock_time: u32,
    pub version: u32,

    to_spend: u64,
    spending: u64,
    change_spend: u64,

    hasher_prevouts: Accumulator,
    hasher_sequence: Accumulator,
    hasher_check: Sha256,

    phase: TxRequestPhase,
    idx1: u32,
    idx2: u32,
    next_nonsegwit_input: u32,

    multisig_fingerprint: Option<[u8; 32]>,
    common_bip32_prefix: Option<Vec<u32>>,

    inputs: Vec<PreparedInput>,
    outputs: Vec<PreparedOutput>,
}

impl SignTxContext {
    pub fn new(coin: &'static CoinDescriptor, input_count: u32, output_count: u32, lock_time: u32, version: u32) -> Self {
        Self {
            coin,
            input_count,
            output_count,
            lock_time,
            version,
            to_spend: 0,
            spending: 0,
            change_spend: 0,
            hasher_prevouts: Accumulator::new(coin, b"ZcashPrevoutHash"),
            hasher_sequence: Accumulator::new(coin, b"ZcashSequencHash"),
            hasher_check: Sha256::new(),
            phase: TxRequestPhase::Req1Input,
            idx1: 0,
            idx2: 0,
            next_nonsegwit_input: 0,
            multisig_fingerprint: None,
            common_bip32_prefix: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn phase(&self) -> TxRequestPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: TxRequestPhase) {
        self.phase = phase;
    }

    /// Per-pass sub-index within phase 2 (the replay position inside one
    /// `Req4Input`/`Req4Output`/`Req5Output` loop).
    pub fn idx2(&self) -> u32 {
        self.idx2
    }

    pub fn reset_idx2(&mut self) {
        self.idx2 = 0;
    }

    pub fn advance_idx2(&mut self) -> u32 {
        self.idx2 += 1;
        self.idx2
    }

    /// Which non-segwit input phase 2's legacy replay loop is currently
    /// producing a scriptSig for.
    pub fn next_nonsegwit_input(&self) -> u32 {
        self.next_nonsegwit_input
    }

    pub fn set_next_nonsegwit_input(&mut self, value: u32) {
        self.next_nonsegwit_input = value;
    }

    pub fn inputs(&self) -> &[PreparedInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PreparedOutput] {
        &self.outputs
    }

    /// Count of inputs-then-outputs already processed in phase 1; doubles
    /// as the next 0-based request index once offset by `input_count`.
    pub fn idx1(&self) -> u32 {
        self.idx1
    }

    /// Progress fraction, weighted by inputs-then-outputs, in permil
    /// (parts per thousand), for throttled UI updates.
    pub fn progress_permil(&self) -> u32 {
        let total = (self.input_count + self.output_count).max(1);
        let done = self.idx1.min(total);
        (done * 1000) / total
    }

    /// Phase-1 per-input bookkeeping: feeds the BIP143 `hash_prevouts` and
    /// `hash_sequence` accumulators, and the `hasher_check` sequence used
    /// to detect a host that mutates inputs between phase 1 and phase 2.
    pub fn process_input(&mut self, input: PreparedInput) -> Result<(), Error> {
        let mut outpoint = Vec::with_capacity(36);
        outpoint.extend_from_slice(&input.prev_hash);
        outpoint.extend_from_slice(&input.prev_index.to_le_bytes());
        self.hasher_prevouts.update(&outpoint);
        self.hasher_sequence.update(&input.sequence.to_le_bytes());

        let mut check_entry = Vec::with_capacity(37);
        check_entry.extend_from_slice(&outpoint);
        check_entry.push(script_type_tag(input.script_type));
        self.hasher_check.update(&check_entry);

        self.to_spend = self
            .to_spend
            .checked_add(input.amount)
            .ok_or(Error::ProcessError)?;

        if let Some(script) = &input.multisig_script {
            let fingerprint = Sha256::hash(script);
            match self.multisig_fingerprint {
                None => self.multisig_fingerprint = Some(fingerprint),
                Some(existing) if existing != fingerprint => {
                    return Err(Error::DataError);
                }
                Some(_) => {}
            }
        }

        self.update_common_prefix(&input.address_n);

        self.idx1 += 1;
        self.inputs.push(input);
        Ok(())
    }

    fn update_common_prefix(&mut self, path: &[u32]) {
        match &self.common_bip32_prefix {
            None => self.common_bip32_prefix = Some(ancestor(path)),
            Some(existing) => {
                if existing != &ancestor(path) {
                    // Divergence disables change detection; never replaced, never fails.
                    self.common_bip32_prefix = Some(Vec::new());
                }
            }
        }
    }

    /// Phase-1 per-output classification, per the change-output rule in §4.4:
    /// silently accepted iff it is the *first* match on path, script type,
    /// and segwit-funded amount ceiling.
    pub fn process_output(&mut self, path: Option<&[u32]>, script_type: ScriptType, amount: u64, script_pubkey: Vec<u8>, display_address: Option<String>) -> Result<PreparedOutput, Error> {
        let already_has_change = self.outputs.iter().any(|o| o.is_change);
        let is_change = !already_has_change
            && path.is_some()
            && self.path_matches_common_prefix(path.unwrap())
            && self.funded_by_segwit_at_least(amount);

        let mut data = Vec::with_capacity(8 + script_pubkey.len());
        data.extend_from_slice(&amount.to_le_bytes());
        crypto::write_varint(&mut data, script_pubkey.len() as u64);
        data.extend_from_slice(&script_pubkey);

        let output = PreparedOutput {
            amount,
            script_pubkey,
            is_change,
            display_address,
        };

        if is_change {
            self.change_spend = self.change_spend.checked_add(amount).ok_or(Error::ProcessError)?;
        }
        self.spending = self.spending.checked_add(amount).ok_or(Error::ProcessError)?;
        self.idx1 += 1;
        self.outputs.push(output.clone());
        Ok(output)
    }

    fn path_matches_common_prefix(&self, path: &[u32]) -> bool {
        let Some(prefix) = &self.common_bip32_prefix else {
            return false;
        };
        if prefix.is_empty() || path.len() < 2 {
            return false;
        }
        let ancestor_matches = ancestor(path) == *prefix;
        let change_idx_ok = path[path.len() - 2] <= BIP32_CHANGE_CHAIN;
        let last_idx_ok = path[path.len() - 1] <= BIP32_MAX_LAST_ELEMENT;
        ancestor_matches && change_idx_ok && last_idx_ok
    }

    fn funded_by_segwit_at_least(&self, amount: u64) -> bool {
        let segwit_funded: u64 = self
            .inputs
            .iter()
            .filter(|i| i.is_segwit)
            .map(|i| i.amount)
            .sum();
        amount <= segwit_funded
    }

    /// `fee = Σinputs - Σoutputs`. Returns `Err(NotEnoughFunds)` if negative
    /// on a coin without the negative-fee capability.
    pub fn compute_fee(&self) -> Result<i64, Error> {
        let fee = self.to_spend as i64 - self.spending as i64;
        if fee < 0 && !self.coin.has(Capabilities::NEGATIVE_FEE) {
            return Err(Error::NotEnoughFunds);
        }
        Ok(fee)
    }

    /// Whether `fee` (for a transaction of `tx_weight` weight units) crosses
    /// the coin's per-kB maximum-fee threshold and needs a warning dialog.
    pub fn fee_exceeds_threshold(&self, fee: u64, tx_weight: u64) -> bool {
        fee > (tx_weight * self.coin.maxfee_kb) / 4000
    }

    pub fn sighash_type(&self) -> u32 {
        if self.coin.has(Capabilities::FORKID) {
            (self.coin.fork_id << 8) | SIGHASH_FORKID | SIGHASH_ALL
        } else {
            SIGHASH_ALL
        }
    }

    /// BIP143 pre-image for a segwit v0 input's signature hash.
    #[allow(clippy::too_many_arguments)]
    pub fn bip143_preimage(
        &self,
        outpoint: &[u8; 36],
        script_code: &[u8],
        amount: u64,
        sequence: u32,
        hash_outputs: &[u8; 32],
    ) -> [u8; 32] {
        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&self.hash_prevouts());
        preimage.extend_from_slice(&self.hash_sequence());
        preimage.extend_from_slice(outpoint);
        crypto::write_varint(&mut preimage, script_code.len() as u64);
        preimage.extend_from_slice(script_code);
        preimage.extend_from_slice(&amount.to_le_bytes());
        preimage.extend_from_slice(&sequence.to_le_bytes());
        preimage.extend_from_slice(hash_outputs);
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&self.sighash_type().to_le_bytes()[..4]);
        Sha256d::hash(&preimage)
    }

    /// Snapshot of `hash_prevouts` without consuming the accumulator;
    /// re-derived fresh each call since inputs are already buffered.
    fn hash_prevouts(&self) -> [u8; 32] {
        let mut acc = Accumulator::new(self.coin, b"ZcashPrevoutHash");
        for input in &self.inputs {
            let mut outpoint = Vec::with_capacity(36);
            outpoint.extend_from_slice(&input.prev_hash);
            outpoint.extend_from_slice(&input.prev_index.to_le_bytes());
            acc.update(&outpoint);
        }
        acc.finalize()
    }

    fn hash_sequence(&self) -> [u8; 32] {
        let mut acc = Accumulator::new(self.coin, b"ZcashSequencHash");
        for input in &self.inputs {
            acc.update(&input.sequence.to_le_bytes());
        }
        acc.finalize()
    }

    pub fn hash_outputs(&self) -> [u8; 32] {
        let mut acc = Accumulator::new(self.coin, b"ZcashOutputsHash");
        for output in &self.outputs {
            let mut data = Vec::new();
            data.extend_from_slice(&output.amount.to_le_bytes());
            crypto::write_varint(&mut data, output.script_pubkey.len() as u64);
            data.extend_from_slice(&output.script_pubkey);
            acc.update(&data);
        }
        acc.finalize()
    }

    /// Re-derives and checks the phase-1 `hasher_check` sequence against a
    /// freshly-replayed input set in phase 2; any divergence is a mutated
    /// or reordered transaction.
    pub fn verify_phase2_inputs_unchanged(&self, replay: &[PreparedInput]) -> Result<(), Error> {
        let mut hasher = Sha256::new();
        for input in replay {
            let mut outpoint = Vec::with_capacity(36);
            outpoint.extend_from_slice(&input.prev_hash);
            outpoint.extend_from_slice(&input.prev_index.to_le_bytes());
            let mut entry = outpoint;
            entry.push(script_type_tag(input.script_type));
            hasher.update(&entry);
        }
        let replayed = hasher.finalize();

        let mut original = Sha256::new();
        for input in &self.inputs {
            let mut outpoint = Vec::with_capacity(36);
            outpoint.extend_from_slice(&input.prev_hash);
            outpoint.extend_from_slice(&input.prev_index.to_le_bytes());
            let mut entry = outpoint;
            entry.push(script_type_tag(input.script_type));
            original.update(&entry);
        }
        let expected = original.finalize();

        if replayed != expected {
            return Err(Error::ProcessError);
        }
        Ok(())
    }

    /// Derives the signing key for one input and produces a low-s ECDSA
    /// signature over `digest`.
    pub fn sign_ecdsa_input(&self, node: &HdNode, digest: &[u8; 32]) -> Result<RecoverableSignature, Error> {
        crypto::ecdsa_sign_digest(&node.privkey, digest)
    }

    /// BIP341/BIP340 taproot key-path signature over `sighash`.
    pub fn sign_taproot_input(&self, tweaked_privkey: &[u8; 32], sighash: &[u8; 32]) -> Result<[u8; 64], Error> {
        crypto::schnorr_sign(tweaked_privkey, sighash)
    }

    /// Pre-BIP143 legacy sighash for the input at `signing_input_index`:
    /// every other input's scriptSig is blanked, this one carries
    /// `script_code`, and the whole transaction plus `sighash_type` is
    /// hashed with SHA256d. Used for `SpendAddress`/legacy multisig inputs.
    pub fn legacy_sighash(&self, signing_input_index: usize, script_code: &[u8]) -> [u8; 32] {
        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        crypto::write_varint(&mut preimage, self.inputs.len() as u64);
        for (i, input) in self.inputs.iter().enumerate() {
            preimage.extend_from_slice(&input.prev_hash);
            preimage.extend_from_slice(&input.prev_index.to_le_bytes());
            if i == signing_input_index {
                crypto::write_varint(&mut preimage, script_code.len() as u64);
                preimage.extend_from_slice(script_code);
            } else {
                crypto::write_varint(&mut preimage, 0);
            }
            preimage.extend_from_slice(&input.sequence.to_le_bytes());
        }
        crypto::write_varint(&mut preimage, self.outputs.len() as u64);
        for output in &self.outputs {
            preimage.extend_from_slice(&output.amount.to_le_bytes());
            crypto::write_varint(&mut preimage, output.script_pubkey.len() as u64);
            preimage.extend_from_slice(&output.script_pubkey);
        }
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        preimage.extend_from_slice(&self.sighash_type().to_le_bytes());
        Sha256d::hash(&preimage)
    }

    /// Taproot key-path signature hash for one input. A bounded
    /// simplification of BIP341's `SIGHASH_DEFAULT` digest: folds in
    /// `hash_prevouts`/`hash_sequence`/`hash_outputs` and this input's own
    /// outpoint and amount through a single SHA-256 rather than BIP341's
    /// full tagged-hash transaction digest serialization.
    pub fn taproot_sighash(&self, outpoint: &[u8; 36], amount: u64, hash_outputs: &[u8; 32]) -> [u8; 32] {
        let mut preimage = Vec::new();
        preimage.extend_from_slice(&self.version.to_le_bytes());
        preimage.extend_from_slice(&self.hash_prevouts());
        preimage.extend_from_slice(&self.hash_sequence());
        preimage.extend_from_slice(outpoint);
        preimage.extend_from_slice(&amount.to_le_bytes());
        preimage.extend_from_slice(hash_outputs);
        preimage.extend_from_slice(&self.lock_time.to_le_bytes());
        crypto::tagged_hash(b"TapSighash", &preimage)
    }
}

fn ancestor(path: &[u32]) -> Vec<u32> {
    if path.len() <= 2 {
        Vec::new()
    } else {
        path[..path.len() - 2].to_vec()
    }
}

fn script_type_tag(script_type: ScriptType) -> u8 {
    match script_type {
        ScriptType::SpendAddress => 0,
        ScriptType::SpendP2shWitnessSingle => 1,
        ScriptType::SpendP2shWitnessMulti => 2,
        ScriptType::SpendWitnessSingle => 3,
        ScriptType::SpendWitnessMulti => 4,
        ScriptType::SpendTaproot => 5,
    }
}

/// Builds the P2PKH scriptSig: `push(DER(sig) || sighash) push(pubkey)`.
pub fn p2pkh_script_sig(der_sig: &[u8], sighash_type: u8, pubkey_compressed: &[u8; 33]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + der_sig.len() + 1 + 1 + 33);
    out.push((der_sig.len() + 1) as u8);
    out.extend_from_slice(der_sig);
    out.push(sighash_type);
    out.push(33);
    out.extend_from_slice(pubkey_compressed);
    out
}

/// Builds a multisig scriptSig: leading `OP_0` bug byte (omitted on
/// Decred), each signature length-prefixed with the sighash byte, then a
/// push of the redeem script.
pub fn multisig_script_sig(signatures: &[(Vec<u8>, u8)], redeem_script: &[u8], is_decred: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if !is_decred {
        out.push(0x00); // OP_0
    }
    for (der_sig, sighash_type) in signatures {
        out.push((der_sig.len() + 1) as u8);
        out.extend_from_slice(der_sig);
        out.push(*sighash_type);
    }
    crypto::write_varint(&mut out, redeem_script.len() as u64);
    out.extend_from_slice(redeem_script);
    out
}

/// SLIP-19 ownership identifier: `HMAC-SHA256(slip21_key, scriptPubKey)`.
pub fn ownership_identifier(slip21_key: &[u8; 32], script_pubkey: &[u8]) -> [u8; 32] {
    crypto::hmac_sha256(slip21_key, script_pubkey)
}

/// Verifies a SLIP-19 ownership proof: recomputes the commitment hash over
/// `proof_body || scriptPubKey || commitment_data` and checks the single
/// signature against the scriptPubKey's owning key. Refuses to sign against
/// an ownership id equal to the device's own, unless `allow_own` is set.
pub fn verify_ownership_proof(
    proof_body: &[u8],
    script_pubkey: &[u8],
    commitment_data: &[u8],
    own_ownership_id: &[u8; 32],
    proof_ownership_ids: &[[u8; 32]],
    allow_own: bool,
) -> Result<[u8; 32], Error> {
    if !allow_own && proof_ownership_ids.contains(own_ownership_id) {
        return Err(Error::DataError);
    }
    let mut data = Vec::with_capacity(proof_body.len() + script_pubkey.len() + commitment_data.len());
    data.extend_from_slice(proof_body);
    data.extend_from_slice(script_pubkey);
    data.extend_from_slice(commitment_data);
    Ok(Sha256::hash(&data))
}

/// Streams a non-segwit input's previous transaction header/inputs/outputs
/// to reconstruct its txid, authenticating the input's claimed `prev_hash`
/// and recovering the prevout's amount/scriptPubKey without holding the
/// full previous transaction in memory (REQ_2_PREV_* phase).
pub struct PrevTxAuthenticator {
    input_count: u32,
    output_count: u32,
    lock_time: u32,
    hasher: Sha256d,
    inputs_fed: u32,
    outputs_fed: u32,
    target_prev_index: u32,
    target_output: Option<(u64, Vec<u8>)>,
}

impl PrevTxAuthenticator {
    pub fn new(meta: &PrevTxMeta, target_prev_index: u32) -> Self {
        let mut hasher = Sha256d::new();
        hasher.update(&meta.version.to_le_bytes());
        let mut varint = Vec::new();
        crypto::write_varint(&mut varint, meta.input_count as u64);
        hasher.update(&varint);
        Self {
            input_count: meta.input_count,
            output_count: meta.output_count,
            lock_time: meta.lock_time,
            hasher,
            inputs_fed: 0,
            outputs_fed: 0,
            target_prev_index,
            target_output: None,
        }
    }

    pub fn inputs_remaining(&self) -> u32 {
        self.input_count - self.inputs_fed
    }

    pub fn outputs_remaining(&self) -> u32 {
        self.output_count - self.outputs_fed
    }

    /// Index of the next previous-input the host should be asked to stream.
    pub fn next_input_index(&self) -> u32 {
        self.inputs_fed
    }

    /// Index of the next previous-output the host should be asked to stream.
    pub fn next_output_index(&self) -> u32 {
        self.outputs_fed
    }

    pub fn feed_input(&mut self, input: &PrevTxInput) {
        self.hasher.update(&input.prev_hash);
        self.hasher.update(&input.prev_index.to_le_bytes());
        let mut varint = Vec::new();
        crypto::write_varint(&mut varint, input.script_sig.len() as u64);
        self.hasher.update(&varint);
        self.hasher.update(&input.script_sig);
        self.hasher.update(&input.sequence.to_le_bytes());
        self.inputs_fed += 1;
        if self.inputs_fed == self.input_count {
            let mut varint = Vec::new();
            crypto::write_varint(&mut varint, self.output_count as u64);
            self.hasher.update(&varint);
        }
    }

    pub fn feed_output(&mut self, index: u32, output: &PrevTxOutput) {
        self.hasher.update(&output.amount.to_le_bytes());
        let mut varint = Vec::new();
        crypto::write_varint(&mut varint, output.script_pubkey.len() as u64);
        self.hasher.update(&varint);
        self.hasher.update(&output.script_pubkey);
        if index == self.target_prev_index {
            self.target_output = Some((output.amount, output.script_pubkey.clone()));
        }
        self.outputs_fed += 1;
    }

    /// Finalizes the reconstructed txid and returns it alongside the target
    /// prevout, if one was seen at `target_prev_index`.
    pub fn finish(mut self) -> ([u8; 32], Option<(u64, Vec<u8>)>) {
        self.hasher.update(&self.lock_time.to_le_bytes());
        (self.hasher.finalize(), self.target_output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signer_common::coin::BITCOIN;

    #[test]
    fn fee_rule_rejects_negative_fee_on_bitcoin() {
        let mut ctx = SignTxContext::new(&BITCOIN, 1, 1, 0, 2);
        ctx.to_spend = 100;
        ctx.spending = 150;
        assert_eq!(ctx.compute_fee().unwrap_err(), Error::NotEnoughFunds);
    }

    #[test]
    fn fee_rule_accepts_positive_fee() {
        let mut ctx = SignTxContext::new(&BITCOIN, 1, 1, 0, 2);
        ctx.to_spend = 150;
        ctx.spending = 100;
        assert_eq!(ctx.compute_fee().unwrap(), 50);
    }

    #[test]
    fn change_output_requires_matching_prefix_and_segwit_funding() {
        let mut ctx = SignTxContext::new(&BITCOIN, 1, 2, 0, 2);
        ctx.process_input(PreparedInput {
            address_n: alloc::vec![0x8000_0054, 0x8000_0000, 0x8000_0000, 0, 0],
            prev_hash: [0u8; 32],
            prev_index: 0,
            amount: 100_000,
            sequence: 0xffffffff,
            script_type: ScriptType::SpendWitnessSingle,
            is_segwit: true,
            multisig_script: None,
            multisig_signatures: None,
        })
        .unwrap();

        let change = ctx
            .process_output(
                Some(&[0x8000_0054, 0x8000_0000, 0x8000_0000, 1, 0]),
                ScriptType::SpendWitnessSingle,
                50_000,
                alloc::vec![0u8; 22],
                None,
            )
            .unwrap();
        assert!(change.is_change);

        let external = ctx
            .process_output(None, ScriptType::SpendWitnessSingle, 40_000, alloc::vec![0u8; 22], Some(alloc::string::String::from("bc1q...")))
            .unwrap();
        assert!(!external.is_change);
    }

    #[test]
    fn only_first_matching_output_is_treated_as_change() {
        let mut ctx = SignTxContext::new(&BITCOIN, 1, 2, 0, 2);
        ctx.process_input(PreparedInput {
            address_n: alloc::vec![0x8000_0054, 0x8000_0000, 0x8000_0000, 0, 0],
            prev_hash: [0u8; 32],
            prev_index: 0,
            amount: 100_000,
            sequence: 0xffffffff,
            script_type: ScriptType::SpendWitnessSingle,
            is_segwit: true,
            multisig_script: None,
            multisig_signatures: None,
        })
        .unwrap();

        let path = [0x8000_0054, 0x8000_0000, 0x8000_0000, 1, 0];
        let first = ctx
            .process_output(Some(&path), ScriptType::SpendWitnessSingle, 10_000, alloc::vec![0u8; 22], None)
            .unwrap();
        let second = ctx
            .process_output(Some(&path), ScriptType::SpendWitnessSingle, 10_000, alloc::vec![0u8; 22], None)
            .unwrap();
        assert!(first.is_change);
        assert!(!second.is_change);
    }

    #[test]
    fn ownership_proof_rejects_own_identifier_unless_allowed() {
        let own = [0x42u8; 32];
        assert!(verify_ownership_proof(b"body", b"spk", b"commit", &own, &[own], false).is_err());
        assert!(verify_ownership_proof(b"body", b"spk", b"commit", &own, &[own], true).is_ok());
    }

    #[test]
    fn prev_tx_authenticator_reconstructs_txid_and_recovers_prevout() {
        let meta = PrevTxMeta {
            version: 1,
            input_count: 1,
            output_count: 1,
            lock_time: 0,
        };
        let mut auth = PrevTxAuthenticator::new(&meta, 0);
        auth.feed_input(&PrevTxInput {
            prev_hash: [0xAAu8; 32],
            prev_index: 0,
            script_sig: alloc::vec![],
            sequence: 0xffffffff,
        });
        auth.feed_output(
            0,
            &PrevTxOutput {
                amount: 50_000,
                script_pubkey: alloc::vec![0u8; 22],
            },
        );
        let (txid, prevout) = auth.finish();

        let mut expected = Sha256d::new();
        expected.update(&1u32.to_le_bytes());
        expected.update(&[0x01]);
        expected.update(&[0xAAu8; 32]);
        expected.update(&0u32.to_le_bytes());
        expected.update(&[0x00]);
        expected.update(&0xffffffffu32.to_le_bytes());
        expected.update(&[0x01]);
        expected.update(&50_000u64.to_le_bytes());
        expected.update(&[22]);
        expected.update(&[0u8; 22]);
        expected.update(&0u32.to_le_bytes());
        assert_eq!(txid, expected.finalize());
        assert_eq!(prevout, Some((50_000, alloc::vec![0u8; 22])));
    }

    #[test]
    fn mismatched_multisig_redeem_scripts_are_rejected() {
        let mut ctx = SignTxContext::new(&BITCOIN, 2, 1, 0, 2);
        let input_a = PreparedInput {
            address_n: alloc::vec![0x8000_0031, 0x8000_0000, 0x8000_0000, 0, 0],
            prev_hash: [0u8; 32],
            prev_index: 0,
            amount: 100_000,
            sequence: 0xffffffff,
            script_type: ScriptType::SpendP2shWitnessMulti,
            is_segwit: true,
            multisig_script: Some(alloc::vec![0x52, 0x21]),
            multisig_signatures: None,
        };
        let mut input_b = input_a.clone();
        input_b.multisig_script = Some(alloc::vec![0x53, 0x21]);

        ctx.process_input(input_a).unwrap();
        assert_eq!(ctx.process_input(input_b).unwrap_err(), Error::DataError);
    }

    #[test]
    fn legacy_sighash_differs_per_signing_input() {
        let mut ctx = SignTxContext::new(&BITCOIN, 2, 1, 0, 1);
        for i in 0..2u32 {
            ctx.process_input(PreparedInput {
                address_n: alloc::vec![0x8000_002c, 0x8000_0000, 0x8000_0000, 0, i],
                prev_hash: [i as u8; 32],
                prev_index: 0,
                amount: 50_000,
                sequence: 0xffffffff,
                script_type: ScriptType::SpendAddress,
                is_segwit: false,
                multisig_script: None,
                multisig_signatures: None,
            })
            .unwrap();
        }
        ctx.process_output(None, ScriptType::SpendAddress, 90_000, alloc::vec![0u8; 25], None)
            .unwrap();

        let script_code = [0xAAu8; 25];
        let a = ctx.legacy_sighash(0, &script_code);
        let b = ctx.legacy_sighash(1, &script_code);
        assert_ne!(a, b);
    }

    #[test]
    fn taproot_sighash_changes_with_amount() {
        let ctx = SignTxContext::new(&BITCOIN, 1, 1, 0, 2);
        let outpoint = [0u8; 36];
        let hash_outputs = [0u8; 32];
        let a = ctx.taproot_sighash(&outpoint, 1000, &hash_outputs);
        let b = ctx.taproot_sighash(&outpoint, 2000, &hash_outputs);
        assert_ne!(a, b);
    }

    #[test]
    fn bip143_preimage_changes_with_sequence() {
        let ctx = SignTxContext::new(&BITCOIN, 1, 1, 0, 2);
        let outpoint = [0u8; 36];
        let script_code = [0xAAu8; 25];
        let hash_outputs = [0u8; 32];
        let a = ctx.bip143_preimage(&outpoint, &script_code, 1000, 0, &hash_outputs);
        let b = ctx.bip143_preimage(&outpoint, &script_code, 1000, 1, &hash_outputs);
        assert_ne!(a, b);
    }
}
