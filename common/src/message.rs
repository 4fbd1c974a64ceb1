//! Wire message catalogue.
//!
//! Every message that crosses the transport boundary (see [`crate::comm`])
//! is one variant of [`Request`] or [`Response`]. Variants are grouped by
//! the component that owns them; the grouping is documentation only, the
//! wire representation is a flat enum.

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::coin::CoinDescriptor;
use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Request {
    // === Session / device state (C3, C7) ===
    Initialize {
        session_id: Option<[u8; 32]>,
    },
    GetFeatures,
    PinMatrixAck {
        matrix_response: String,
    },
    PassphraseAck {
        passphrase: String,
    },
    ButtonAck,
    Cancel,

    // === UTXO signing (C5) ===
    SignTx {
        coin_name: String,
        input_count: u32,
        output_count: u32,
        lock_time: u32,
        version: u32,
    },
    TxAck {
        tx: TxAckPayload,
    },

    // === Ethereum signing (C6) ===
    EthereumSignTx {
        address_n: Vec<u32>,
        nonce: Vec<u8>,
        gas_price: Vec<u8>,
        gas_limit: Vec<u8>,
        to: [u8; 20],
        value: Vec<u8>,
        data_initial_chunk: Vec<u8>,
        data_length: u32,
        chain_id: u64,
        max_fee_per_gas: Option<Vec<u8>>,
        max_priority_fee_per_gas: Option<Vec<u8>>,
    },
    EthereumTxAck {
        data_chunk: Vec<u8>,
    },
    EthereumSignMessage {
        address_n: Vec<u32>,
        message: Vec<u8>,
    },

    // === PIN / wipe-code enrolment (C3) ===
    ChangePin {
        new_pin: String,
        new_pin_confirm: String,
        wipe_code: Option<String>,
        wipe_code_confirm: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response {
    // === Session / device state (C3, C7) ===
    Features {
        initialized: bool,
        session_id: Option<[u8; 32]>,
        locked: bool,
    },
    PinMatrixRequest,
    PassphraseRequest,
    ButtonRequest,
    Success {
        message: Option<String>,
    },
    Failure {
        code: u16,
        message: String,
    },

    // === UTXO signing (C5) ===
    TxRequest {
        phase: TxRequestPhase,
        details: TxRequestDetails,
        serialized: Option<TxSerialized>,
    },

    // === Ethereum signing (C6) ===
    EthereumTxRequest {
        data_length: u32,
    },
    EthereumTxSignature {
        signature_v: u32,
        signature_r: [u8; 32],
        signature_s: [u8; 32],
    },
    EthereumMessageSignature {
        address: [u8; 20],
        signature: [u8; 65],
    },
}

impl Response {
    /// Builds a `Failure` response from an [`Error`]; the only place one is
    /// constructed outside the C7 dispatcher's top-level catch.
    pub fn error(e: Error) -> Self {
        Response::Failure {
            code: e.code(),
            message: alloc::format!("{e}"),
        }
    }
}

/// Which phase of the streaming UTXO signing state machine a `TxRequest`
/// belongs to. See the engine's phase-model for the transition table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxRequestPhase {
    Req1Input,
    Req2PrevMeta,
    Req2PrevInput,
    Req2PrevOutput,
    Req2PrevExtradata,
    Req3Output,
    Req4Input,
    Req4Output,
    Req5Output,
    ReqSegwitInput,
    ReqSegwitWitness,
    ReqDecredWitness,
    TxFinished,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TxRequestDetails {
    pub request_index: Option<u32>,
    pub tx_hash: Option<[u8; 32]>,
    pub extra_data_len: Option<u32>,
    pub extra_data_offset: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct TxSerialized {
    pub signature_index: Option<u32>,
    pub signature: Option<Vec<u8>>,
    pub serialized_tx: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxAckPayload {
    pub input: Option<TxInput>,
    pub output: Option<TxOutput>,
    pub extra_data: Option<Vec<u8>>,

    /// Previous-transaction metadata, input, output and extra-data
    /// streamed during the `REQ_2_PREV_*`/legacy-replay phases.
    pub prev_meta: Option<PrevTxMeta>,
    pub prev_input: Option<PrevTxInput>,
    pub prev_output: Option<PrevTxOutput>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub address_n: Vec<u32>,
    pub prev_hash: [u8; 32],
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub amount: u64,
    pub script_type: TxInputScriptType,
    /// Redeem/witness script for `SpendMultisig` inputs.
    pub multisig_script: Option<Vec<u8>>,
    /// Other cosigners' `(DER signature, sighash_type)` pairs, already
    /// collected by the host, for `SpendMultisig` inputs.
    pub multisig_signatures: Option<Vec<(Vec<u8>, u8)>>,
    /// SLIP-19 ownership proof body, required on SLIP-25 coinjoin paths.
    pub ownership_proof: Option<Vec<u8>>,
}

/// Which scriptSig/witness shape an input is spent with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxInputScriptType {
    /// Legacy P2PKH.
    SpendAddress,
    /// P2WPKH wrapped in P2SH.
    SpendP2shWitness,
    /// Native segwit v0 P2WPKH.
    SpendWitness,
    /// Native segwit v1 P2TR, key path.
    SpendTaproot,
    /// Legacy P2SH multisig.
    SpendMultisig,
}

/// Previous transaction's header, streamed so the device can re-derive its
/// txid and check it against the input's claimed `prev_hash`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrevTxMeta {
    pub version: u32,
    pub input_count: u32,
    pub output_count: u32,
    pub lock_time: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrevTxInput {
    pub prev_hash: [u8; 32],
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PrevTxOutput {
    pub amount: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub address_n: Vec<u32>,
    pub address: Option<String>,
    pub amount: u64,
    pub script_type: TxOutputScriptType,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutputScriptType {
    PayToAddress,
    PayToScriptHash,
    PayToWitnessScriptHash,
    PayToTaproot,
}

/// Convenience constructor used by the engine when it needs the coin's
/// name on the wire without holding a borrow of the [`CoinDescriptor`].
pub fn coin_name_of(coin: &CoinDescriptor) -> String {
    String::from(coin.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_round_trips_through_postcard() {
        let resp = Response::error(Error::PinInvalid);
        let bytes = postcard::to_allocvec(&resp).unwrap();
        let back: Response = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(resp, back);
    }

    #[test]
    fn tx_request_phase_round_trips() {
        let resp = Response::TxRequest {
            phase: TxRequestPhase::Req4Output,
            details: TxRequestDetails {
                request_index: Some(2),
                ..Default::default()
            },
            serialized: None,
        };
        let bytes = postcard::to_allocvec(&resp).unwrap();
        let back: Response = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(resp, back);
    }
}
