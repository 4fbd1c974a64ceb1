//! Top-level request dispatcher (C7).
//!
//! One [`Dispatcher`] owns the session, the UI/KV collaborators, and at
//! most one [`ActiveSigner`] at a time. Every inbound [`Request`] passes
//! through [`Dispatcher::handle`]; handlers that touch secret keys unlock
//! through [`Session`], derive through [`crate::keys`], and drive a signer
//! state machine. `Cancel` and a fresh `Initialize` always abort whatever
//! signer is active, per the single-threaded cooperative model: there is
//! never more than one suspended handler.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use signer_common::coin::{self, Capabilities};
use signer_common::error::Error;
use signer_common::message::{
    Request, Response, TxAckPayload, TxInput, TxInputScriptType, TxOutputScriptType, TxRequestDetails,
    TxRequestPhase, TxSerialized,
};

use crate::address::{self, ScriptType};
use crate::crypto;
use crate::ethereum::{EthereumSignContext, TxKind};
use crate::keys::{Curve, HdNode};
use crate::session::{KvStore, Session, SessionState, SLIP25_PURPOSE};
use crate::utxo::{
    multisig_script_sig, ownership_identifier, p2pkh_script_sig, verify_ownership_proof, PreparedInput,
    PreparedOutput, PrevTxAuthenticator, SignTxContext,
};

/// SLIP-44 coin type Ethereum derivation paths are checked against.
const ETHEREUM_SLIP44: u32 = 60;

/// Scripted/physical UI collaborator. A real device backs this with button
/// and PIN-matrix hardware; tests back it with [`crate::testutil::TestUi`].
pub trait Ui {
    fn ask_confirm(&mut self, kind: &str, text: &str) -> bool;
    fn prompt_pin(&mut self) -> Option<String>;
    fn notify_progress(&mut self, title: &str, permil: u32);
}

#[cfg(any(test, feature = "testutil"))]
impl Ui for crate::testutil::TestUi {
    fn ask_confirm(&mut self, kind: &str, text: &str) -> bool {
        crate::testutil::TestUi::ask_confirm(self, kind, text)
    }
    fn prompt_pin(&mut self) -> Option<String> {
        crate::testutil::TestUi::prompt_pin(self)
    }
    fn notify_progress(&mut self, title: &str, permil: u32) {
        crate::testutil::TestUi::notify_progress(self, title, permil)
    }
}

/// Which signer state machine currently owns the suspended handler, if any.
pub enum ActiveSigner {
    Idle,
    Utxo(Box<UtxoFlow>),
    Eth(Box<EthFlow>),
}

/// UTXO flow state threaded between successive `TxAck` messages, across
/// both the phase-1 declaration pass and the phase-2 signing pass.
pub struct UtxoFlow {
    ctx: SignTxContext,
    pending_inputs: Vec<PreparedInput>,
    pending_outputs: Vec<PreparedOutput>,

    /// Indices into `pending_inputs` that sign via the legacy/P2SH path
    /// (everything that isn't segwit), resp. the BIP143 witness path.
    legacy_indices: Vec<u32>,
    segwit_indices: Vec<u32>,
    segwit_pass: usize,
    witness_ack_pass: usize,

    /// Set while streaming a non-segwit input's previous transaction
    /// (`REQ_2_PREV_*`).
    prev_tx_input_idx: Option<u32>,
    prev_tx_auth: Option<PrevTxAuthenticator>,

    /// Phase-2 replay buffer, checked against `pending_inputs` once full.
    replay_inputs: Vec<PreparedInput>,

    script_sigs: BTreeMap<u32, Vec<u8>>,
    witnesses: BTreeMap<u32, Vec<Vec<u8>>>,
}

/// Ethereum flow state threaded between successive `EthereumTxAck` messages.
pub struct EthFlow {
    ctx: EthereumSignContext,
}

pub struct Dispatcher<K: KvStore, U: Ui> {
    pub session: Session<K>,
    pub ui: U,
    active: ActiveSigner,
    /// Set once a `ButtonRequest`/`PinMatrixRequest` has been emitted and a
    /// handler is suspended; only `ButtonAck`/`PinMatrixAck`/`Cancel` are
    /// accepted by the tiny parser until this clears (see
    /// [`crate::transport::ParserMode`]).
    suspended: bool,
    /// Set exactly while a `PinMatrixRequest` is outstanding, so `Cancel`
    /// can report `PinCancelled` instead of the generic `ActionCancelled`.
    awaiting_pin: bool,
}

impl<K: KvStore, U: Ui> Dispatcher<K, U> {
    pub fn new(kv: K, ui: U) -> Self {
        Self {
            session: Session::new(kv),
            ui,
            active: ActiveSigner::Idle,
            suspended: false,
            awaiting_pin: false,
        }
    }

    /// Called by the transport before dispatching each request, with its
    /// own wall-clock source (see `core::transport::drive`). Aborts any
    /// suspended signer and re-locks once the auto-lock deadline has
    /// passed; otherwise pushes the deadline forward while unlocked.
    pub fn tick(&mut self, now_ms: u64) {
        if self.session.check_auto_lock(now_ms) {
            self.active = ActiveSigner::Idle;
            self.suspended = false;
            self.awaiting_pin = false;
        } else if self.session.state() == SessionState::Unlocked {
            self.session.touch_activity(now_ms);
        }
    }

    pub fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Cancel => {
                let was_awaiting_pin = self.awaiting_pin;
                self.active = ActiveSigner::Idle;
                self.suspended = false;
                self.awaiting_pin = false;
                if was_awaiting_pin {
                    Response::error(Error::PinCancelled)
                } else {
                    Response::error(Error::ActionCancelled)
                }
            }
            Request::Initialize { session_id } => {
                self.active = ActiveSigner::Idle;
                self.suspended = false;
                self.awaiting_pin = false;
                if let (Some(requested), Some(current)) = (session_id, self.session.session_id()) {
                    if requested != current {
                        self.session.lock();
                        return Response::error(Error::InvalidSession);
                    }
                } else {
                    self.session.lock();
                }
                self.features()
            }
            Request::GetFeatures => self.features(),
            Request::ButtonAck => self.dispatch_result(Ok(())),
            Request::PinMatrixAck { matrix_response } => {
                self.awaiting_pin = false;
                let result = self.session.unlock(&matrix_response);
                self.dispatch_result(result)
            }
            Request::PassphraseAck { passphrase } => {
                self.session.set_passphrase(&passphrase);
                Response::Success { message: None }
            }
            Request::ChangePin {
                new_pin,
                new_pin_confirm,
                wipe_code,
                wipe_code_confirm,
            } => self.change_pin(new_pin, new_pin_confirm, wipe_code, wipe_code_confirm),
            Request::SignTx {
                coin_name,
                input_count,
                output_count,
                lock_time,
                version,
            } => self.start_sign_tx(&coin_name, input_count, output_count, lock_time, version),
            Request::TxAck { tx } => self.drive_tx_ack(tx),
            Request::EthereumSignTx {
                address_n,
                nonce,
                gas_price,
                gas_limit,
                to,
                value,
                data_initial_chunk,
                data_length,
                chain_id,
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => self.start_ethereum_sign_tx(
                address_n,
                nonce,
                gas_price,
                gas_limit,
                to,
                value,
                data_initial_chunk,
                data_length,
                chain_id,
                max_fee_per_gas,
                max_priority_fee_per_gas,
            ),
            Request::EthereumTxAck { data_chunk } => self.drive_ethereum_ack(data_chunk),
            Request::EthereumSignMessage { address_n, message } => self.ethereum_sign_message(address_n, message),
        }
    }

    fn features(&self) -> Response {
        Response::Features {
            initialized: self.session.is_initialized(),
            session_id: self.session.session_id(),
            locked: self.session.state() != SessionState::Unlocked,
        }
    }

    /// Requires the session to be unlocked, asking for a PIN first if not.
    /// Returns `Err` with the response to emit immediately when the caller
    /// must suspend rather than proceed.
    fn require_unlocked(&mut self) -> Result<(), Response> {
        match self.session.state() {
            SessionState::Unlocked => Ok(()),
            SessionState::Wiped => Err(Response::error(Error::NotInitialized)),
            SessionState::Locked => {
                self.suspended = true;
                self.awaiting_pin = true;
                Err(Response::PinMatrixRequest)
            }
        }
    }

    fn dispatch_result(&self, result: Result<(), Error>) -> Response {
        match result {
            Ok(()) => Response::Success { message: None },
            Err(e) => Response::error(e),
        }
    }

    fn change_pin(
        &mut self,
        new_pin: String,
        new_pin_confirm: String,
        wipe_code: Option<String>,
        wipe_code_confirm: Option<String>,
    ) -> Response {
        if let Err(resp) = self.require_unlocked() {
            return resp;
        }
        if !self.ui.ask_confirm("change-pin", "change PIN") {
            return Response::error(Error::ActionCancelled);
        }
        let result = self.session.change_pin(
            &new_pin,
            &new_pin_confirm,
            wipe_code.as_deref(),
            wipe_code_confirm.as_deref(),
        );
        self.dispatch_result(result)
    }

    /// Consults [`Session::check_path_safety`] and, for a non-standard
    /// path, asks the user to confirm before letting a caller derive it.
    fn check_and_confirm_path(&mut self, path: &[u32], expected_slip44: u32) -> Result<(), Error> {
        match self.session.check_path_safety(path, expected_slip44) {
            Ok(false) => Ok(()),
            Ok(true) => {
                if self.ui.ask_confirm("unusual-path", "unusual derivation path, continue?") {
                    Ok(())
                } else {
                    Err(Error::ActionCancelled)
                }
            }
            Err(e) => Err(e),
        }
    }

    // === UTXO signing (C5) ===

    fn start_sign_tx(&mut self, coin_name: &str, input_count: u32, output_count: u32, lock_time: u32, version: u32) -> Response {
        if let Err(resp) = self.require_unlocked() {
            return resp;
        }
        let coin = match coin::by_name(coin_name) {
            Ok(c) => c,
            Err(e) => return Response::error(e),
        };
        let ctx = SignTxContext::new(coin, input_count, output_count, lock_time, version);
        self.active = ActiveSigner::Utxo(Box::new(UtxoFlow {
            ctx,
            pending_inputs: Vec::new(),
            pending_outputs: Vec::new(),
            legacy_indices: Vec::new(),
            segwit_indices: Vec::new(),
            segwit_pass: 0,
            witness_ack_pass: 0,
            prev_tx_input_idx: None,
            prev_tx_auth: None,
            replay_inputs: Vec::new(),
            script_sigs: BTreeMap::new(),
            witnesses: BTreeMap::new(),
        }));
        Response::TxRequest {
            phase: TxRequestPhase::Req1Input,
            details: TxRequestDetails {
                request_index: Some(0),
                ..Default::default()
            },
            serialized: None,
        }
    }

    fn drive_tx_ack(&mut self, tx: TxAckPayload) -> Response {
        let phase = {
            let ActiveSigner::Utxo(flow) = &self.active else {
                return Response::error(Error::UnexpectedMessage);
            };
            flow.ctx.phase()
        };
        match phase {
            TxRequestPhase::Req1Input => self.handle_req1_input(tx),
            TxRequestPhase::Req2PrevMeta => self.handle_req2_prev_meta(tx),
            TxRequestPhase::Req2PrevInput => self.handle_req2_prev_input(tx),
            TxRequestPhase::Req2PrevOutput => self.handle_req2_prev_output(tx),
            TxRequestPhase::Req2PrevExtradata => self.handle_req2_prev_extradata(tx),
            TxRequestPhase::Req3Output => self.handle_req3_output(tx),
            TxRequestPhase::Req4Input => self.handle_req4_input(tx),
            TxRequestPhase::Req4Output => self.handle_req4_output(tx),
            TxRequestPhase::ReqSegwitInput => self.handle_segwit_input(tx),
            TxRequestPhase::Req5Output => self.handle_req5_output(tx),
            TxRequestPhase::ReqSegwitWitness => self.handle_segwit_witness(tx),
            TxRequestPhase::ReqDecredWitness | TxRequestPhase::TxFinished => Response::error(Error::UnexpectedMessage),
        }
    }

    fn handle_req1_input(&mut self, tx: TxAckPayload) -> Response {
        let Some(input) = tx.input else {
            return Response::error(Error::DataError);
        };

        if input.address_n.first() == Some(&SLIP25_PURPOSE) {
            if let Err(e) = verify_coinjoin_ownership(&mut self.session, &input) {
                self.active = ActiveSigner::Idle;
                return Response::error(e);
            }
        }

        let (script_type, is_segwit) = map_input_script_type(input.script_type);
        let prepared = PreparedInput {
            address_n: input.address_n,
            prev_hash: input.prev_hash,
            prev_index: input.prev_index,
            amount: input.amount,
            sequence: input.sequence,
            script_type,
            is_segwit,
            multisig_script: input.multisig_script,
            multisig_signatures: input.multisig_signatures,
        };

        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        if let Err(e) = flow.ctx.process_input(prepared.clone()) {
            self.active = ActiveSigner::Idle;
            return Response::error(e);
        }
        let input_idx = flow.pending_inputs.len() as u32;
        flow.pending_inputs.push(prepared);
        self.ui.notify_progress("signing", flow.ctx.progress_permil());

        if !is_segwit {
            let ActiveSigner::Utxo(flow) = &mut self.active else {
                return Response::error(Error::UnexpectedMessage);
            };
            flow.prev_tx_input_idx = Some(input_idx);
            flow.ctx.set_phase(TxRequestPhase::Req2PrevMeta);
            return Response::TxRequest {
                phase: TxRequestPhase::Req2PrevMeta,
                details: TxRequestDetails {
                    request_index: Some(input_idx),
                    ..Default::default()
                },
                serialized: None,
            };
        }

        self.advance_after_input()
    }

    fn advance_after_input(&mut self) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let next_index = flow.ctx.idx1();
        if next_index < flow.ctx.input_count {
            flow.ctx.set_phase(TxRequestPhase::Req1Input);
            return Response::TxRequest {
                phase: TxRequestPhase::Req1Input,
                details: TxRequestDetails {
                    request_index: Some(next_index),
                    ..Default::default()
                },
                serialized: None,
            };
        }

        flow.legacy_indices = flow
            .pending_inputs
            .iter()
            .enumerate()
            .filter(|(_, i)| !i.is_segwit)
            .map(|(idx, _)| idx as u32)
            .collect();
        flow.segwit_indices = flow
            .pending_inputs
            .iter()
            .enumerate()
            .filter(|(_, i)| i.is_segwit)
            .map(|(idx, _)| idx as u32)
            .collect();
        flow.ctx.set_phase(TxRequestPhase::Req3Output);
        Response::TxRequest {
            phase: TxRequestPhase::Req3Output,
            details: TxRequestDetails {
                request_index: Some(0),
                ..Default::default()
            },
            serialized: None,
        }
    }

    fn handle_req2_prev_meta(&mut self, tx: TxAckPayload) -> Response {
        let Some(meta) = tx.prev_meta else {
            return Response::error(Error::DataError);
        };
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let Some(input_idx) = flow.prev_tx_input_idx else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        };
        let target_prev_index = flow.pending_inputs[input_idx as usize].prev_index;
        let auth = PrevTxAuthenticator::new(&meta, target_prev_index);
        let inputs_remaining = auth.inputs_remaining();
        let outputs_remaining = auth.outputs_remaining();
        flow.prev_tx_auth = Some(auth);

        if inputs_remaining > 0 {
            flow.ctx.set_phase(TxRequestPhase::Req2PrevInput);
            return Response::TxRequest {
                phase: TxRequestPhase::Req2PrevInput,
                details: TxRequestDetails {
                    request_index: Some(0),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        if outputs_remaining > 0 {
            flow.ctx.set_phase(TxRequestPhase::Req2PrevOutput);
            return Response::TxRequest {
                phase: TxRequestPhase::Req2PrevOutput,
                details: TxRequestDetails {
                    request_index: Some(0),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        self.finish_prev_tx_auth()
    }

    fn handle_req2_prev_input(&mut self, tx: TxAckPayload) -> Response {
        let Some(prev_input) = tx.prev_input else {
            return Response::error(Error::DataError);
        };
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let Some(auth) = flow.prev_tx_auth.as_mut() else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        };
        auth.feed_input(&prev_input);
        if auth.inputs_remaining() > 0 {
            let next = auth.next_input_index();
            return Response::TxRequest {
                phase: TxRequestPhase::Req2PrevInput,
                details: TxRequestDetails {
                    request_index: Some(next),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        if auth.outputs_remaining() > 0 {
            flow.ctx.set_phase(TxRequestPhase::Req2PrevOutput);
            return Response::TxRequest {
                phase: TxRequestPhase::Req2PrevOutput,
                details: TxRequestDetails {
                    request_index: Some(0),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        self.finish_prev_tx_auth()
    }

    fn handle_req2_prev_output(&mut self, tx: TxAckPayload) -> Response {
        let Some(prev_output) = tx.prev_output else {
            return Response::error(Error::DataError);
        };
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let Some(auth) = flow.prev_tx_auth.as_mut() else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        };
        let index = auth.next_output_index();
        auth.feed_output(index, &prev_output);
        if auth.outputs_remaining() > 0 {
            let next = auth.next_output_index();
            return Response::TxRequest {
                phase: TxRequestPhase::Req2PrevOutput,
                details: TxRequestDetails {
                    request_index: Some(next),
                    ..Default::default()
                },
                serialized: None,
            };
        }

        if flow.ctx.coin.has(Capabilities::OVERWINTERED) {
            flow.ctx.set_phase(TxRequestPhase::Req2PrevExtradata);
            return Response::TxRequest {
                phase: TxRequestPhase::Req2PrevExtradata,
                details: TxRequestDetails {
                    extra_data_offset: Some(0),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        self.finish_prev_tx_auth()
    }

    /// Joinsplit/extra data trailing an overwintered previous transaction.
    /// Not folded into the reconstructed txid: none of the compiled coins'
    /// sighash paths need it, so it is drained and discarded.
    fn handle_req2_prev_extradata(&mut self, _tx: TxAckPayload) -> Response {
        self.finish_prev_tx_auth()
    }

    fn finish_prev_tx_auth(&mut self) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let Some(auth) = flow.prev_tx_auth.take() else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        };
        let Some(input_idx) = flow.prev_tx_input_idx.take() else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        };
        let (txid, prevout) = auth.finish();
        let input = &flow.pending_inputs[input_idx as usize];
        if txid != input.prev_hash {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::DataError);
        }
        match prevout {
            Some((amount, _script_pubkey)) if amount == input.amount => {}
            _ => {
                self.active = ActiveSigner::Idle;
                return Response::error(Error::DataError);
            }
        }
        self.advance_after_input()
    }

    fn handle_req3_output(&mut self, tx: TxAckPayload) -> Response {
        let Some(output) = tx.output else {
            return Response::error(Error::DataError);
        };
        let path = (!output.address_n.is_empty()).then_some(output.address_n.clone());
        let script_type = map_output_script_type(output.script_type);

        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let coin = flow.ctx.coin;

        let script_pubkey = if let Some(addr) = &output.address {
            match address::script_pubkey_from_address(coin, output.script_type, addr) {
                Ok(s) => s,
                Err(e) => {
                    self.active = ActiveSigner::Idle;
                    return Response::error(e);
                }
            }
        } else if let Some(path) = &path {
            let node = match self.session.derive(Curve::Secp256k1, path) {
                Ok(n) => n,
                Err(e) => {
                    self.active = ActiveSigner::Idle;
                    return Response::error(e);
                }
            };
            match script_pubkey_for_own_key(&node, script_type) {
                Ok(s) => s,
                Err(e) => {
                    self.active = ActiveSigner::Idle;
                    return Response::error(e);
                }
            }
        } else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::DataError);
        };

        if matches!(script_type, ScriptType::SpendAddress | ScriptType::SpendTaproot)
            && address::classify_external_script(&script_pubkey).is_err()
        {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        }

        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let prepared = match flow.ctx.process_output(
            path.as_deref(),
            script_type,
            output.amount,
            script_pubkey,
            output.address,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.active = ActiveSigner::Idle;
                return Response::error(e);
            }
        };

        if !prepared.is_change {
            let label = prepared.display_address.clone().unwrap_or_default();
            if !self.ui.ask_confirm("output", &alloc::format!("{} to {label}", prepared.amount)) {
                self.active = ActiveSigner::Idle;
                return Response::error(Error::ActionCancelled);
            }
        }
        flow.pending_outputs.push(prepared);

        let next_index = flow.ctx.idx1() - flow.ctx.input_count;
        self.ui.notify_progress("signing", flow.ctx.progress_permil());
        if next_index < flow.ctx.output_count {
            return Response::TxRequest {
                phase: TxRequestPhase::Req3Output,
                details: TxRequestDetails {
                    request_index: Some(next_index),
                    ..Default::default()
                },
                serialized: None,
            };
        }

        self.begin_phase2()
    }

    fn begin_phase2(&mut self) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let fee = match flow.ctx.compute_fee() {
            Ok(f) => f,
            Err(e) => {
                self.active = ActiveSigner::Idle;
                return Response::error(e);
            }
        };
        if fee < 0 {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::NotEnoughFunds);
        }
        if !self.ui.ask_confirm("fee", &alloc::format!("fee {fee}")) {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ActionCancelled);
        }

        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let tx_weight = estimate_tx_weight(flow);
        if flow.ctx.fee_exceeds_threshold(fee as u64, tx_weight)
            && !self.ui.ask_confirm("fee-high", "fee is unusually high, continue?")
        {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ActionCancelled);
        }

        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        flow.ctx.reset_idx2();
        flow.ctx.set_phase(TxRequestPhase::Req4Input);
        Response::TxRequest {
            phase: TxRequestPhase::Req4Input,
            details: TxRequestDetails {
                request_index: Some(0),
                ..Default::default()
            },
            serialized: None,
        }
    }

    fn handle_req4_input(&mut self, tx: TxAckPayload) -> Response {
        let Some(input) = tx.input else {
            return Response::error(Error::DataError);
        };
        let (script_type, is_segwit) = map_input_script_type(input.script_type);
        let prepared = PreparedInput {
            address_n: input.address_n,
            prev_hash: input.prev_hash,
            prev_index: input.prev_index,
            amount: input.amount,
            sequence: input.sequence,
            script_type,
            is_segwit,
            multisig_script: input.multisig_script,
            multisig_signatures: input.multisig_signatures,
        };

        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        flow.replay_inputs.push(prepared);
        let done = flow.ctx.advance_idx2();
        if done < flow.ctx.input_count {
            return Response::TxRequest {
                phase: TxRequestPhase::Req4Input,
                details: TxRequestDetails {
                    request_index: Some(done),
                    ..Default::default()
                },
                serialized: None,
            };
        }

        if let Err(e) = flow.ctx.verify_phase2_inputs_unchanged(&flow.replay_inputs) {
            self.active = ActiveSigner::Idle;
            return Response::error(e);
        }
        flow.replay_inputs.clear();
        flow.ctx.reset_idx2();
        flow.ctx.set_phase(TxRequestPhase::Req4Output);
        Response::TxRequest {
            phase: TxRequestPhase::Req4Output,
            details: TxRequestDetails {
                request_index: Some(0),
                ..Default::default()
            },
            serialized: None,
        }
    }

    fn handle_req4_output(&mut self, tx: TxAckPayload) -> Response {
        let Some(output) = tx.output else {
            return Response::error(Error::DataError);
        };
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let idx = flow.ctx.idx2() as usize;
        let Some(expected) = flow.ctx.outputs().get(idx) else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        };
        if expected.amount != output.amount {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::DataError);
        }
        let done = flow.ctx.advance_idx2();
        if done < flow.ctx.output_count {
            return Response::TxRequest {
                phase: TxRequestPhase::Req4Output,
                details: TxRequestDetails {
                    request_index: Some(done),
                    ..Default::default()
                },
                serialized: None,
            };
        }

        if let Err(e) = self.sign_legacy_inputs() {
            self.active = ActiveSigner::Idle;
            return Response::error(e);
        }

        self.begin_segwit_signing()
    }

    /// Signs every non-segwit input locally, without further host round
    /// trips: the legacy sighash only needs `SignTxContext`'s own stored
    /// inputs/outputs, already authenticated by the Req4Input/Req4Output
    /// replay above.
    fn sign_legacy_inputs(&mut self) -> Result<(), Error> {
        let legacy_indices = {
            let ActiveSigner::Utxo(flow) = &self.active else {
                return Err(Error::UnexpectedMessage);
            };
            flow.legacy_indices.clone()
        };
        for idx in legacy_indices {
            let input = {
                let ActiveSigner::Utxo(flow) = &self.active else {
                    return Err(Error::UnexpectedMessage);
                };
                flow.pending_inputs[idx as usize].clone()
            };
            self.check_and_confirm_path(&input.address_n, {
                let ActiveSigner::Utxo(flow) = &self.active else {
                    return Err(Error::UnexpectedMessage);
                };
                flow.ctx.coin.slip44
            })?;
            let node = self.session.derive(Curve::Secp256k1, &input.address_n)?;
            let pubkey = crypto::secp256k1_public_key(&node.privkey)?;
            let compressed = crypto::compress_pubkey(&pubkey);
            let script_code = match &input.multisig_script {
                Some(redeem) => redeem.clone(),
                None => address::p2pkh_script_pubkey(&compressed),
            };

            let ActiveSigner::Utxo(flow) = &mut self.active else {
                return Err(Error::UnexpectedMessage);
            };
            let digest = flow.ctx.legacy_sighash(idx as usize, &script_code);
            let sig = flow.ctx.sign_ecdsa_input(&node, &digest)?;
            let sighash_byte = flow.ctx.sighash_type() as u8;
            let script_sig = match &input.multisig_script {
                Some(redeem) => {
                    let mut signatures = input.multisig_signatures.clone().unwrap_or_default();
                    signatures.push((sig.to_der(), sighash_byte));
                    multisig_script_sig(&signatures, redeem, false)
                }
                None => p2pkh_script_sig(&sig.to_der(), sighash_byte, &compressed),
            };
            flow.script_sigs.insert(idx, script_sig);
        }
        Ok(())
    }

    fn begin_segwit_signing(&mut self) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        if flow.segwit_indices.is_empty() {
            return self.begin_output_finalization();
        }
        flow.segwit_pass = 0;
        flow.ctx.set_phase(TxRequestPhase::ReqSegwitInput);
        let idx = flow.segwit_indices[0];
        Response::TxRequest {
            phase: TxRequestPhase::ReqSegwitInput,
            details: TxRequestDetails {
                request_index: Some(idx),
                ..Default::default()
            },
            serialized: None,
        }
    }

    fn handle_segwit_input(&mut self, tx: TxAckPayload) -> Response {
        if tx.input.is_none() {
            return Response::error(Error::DataError);
        }
        let (idx, slip44) = {
            let ActiveSigner::Utxo(flow) = &self.active else {
                return Response::error(Error::UnexpectedMessage);
            };
            (flow.segwit_indices[flow.segwit_pass], flow.ctx.coin.slip44)
        };
        let input = {
            let ActiveSigner::Utxo(flow) = &self.active else {
                return Response::error(Error::UnexpectedMessage);
            };
            flow.pending_inputs[idx as usize].clone()
        };

        if let Err(e) = self.check_and_confirm_path(&input.address_n, slip44) {
            self.active = ActiveSigner::Idle;
            return Response::error(e);
        }

        let node = match self.session.derive(Curve::Secp256k1, &input.address_n) {
            Ok(n) => n,
            Err(e) => {
                self.active = ActiveSigner::Idle;
                return Response::error(e);
            }
        };

        let hash_outputs = {
            let ActiveSigner::Utxo(flow) = &self.active else {
                return Response::error(Error::UnexpectedMessage);
            };
            flow.ctx.hash_outputs()
        };

        let mut outpoint = [0u8; 36];
        outpoint[..32].copy_from_slice(&input.prev_hash);
        outpoint[32..].copy_from_slice(&input.prev_index.to_le_bytes());

        let result = {
            let ActiveSigner::Utxo(flow) = &self.active else {
                return Response::error(Error::UnexpectedMessage);
            };
            match input.script_type {
                ScriptType::SpendTaproot => sign_taproot_witness(&flow.ctx, &input, &node, &outpoint, &hash_outputs),
                ScriptType::SpendWitnessMulti | ScriptType::SpendP2shWitnessMulti => {
                    sign_segwit_multisig_witness(&flow.ctx, &input, &node, &outpoint, &hash_outputs)
                }
                _ => sign_segwit_single_witness(&flow.ctx, &input, &node, &outpoint, &hash_outputs),
            }
        };
        let (script_sig, witness) = match result {
            Ok(sw) => sw,
            Err(e) => {
                self.active = ActiveSigner::Idle;
                return Response::error(e);
            }
        };

        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        flow.script_sigs.insert(idx, script_sig);
        flow.witnesses.insert(idx, witness);
        flow.segwit_pass += 1;

        if flow.segwit_pass < flow.segwit_indices.len() {
            let next = flow.segwit_indices[flow.segwit_pass];
            return Response::TxRequest {
                phase: TxRequestPhase::ReqSegwitInput,
                details: TxRequestDetails {
                    request_index: Some(next),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        self.begin_output_finalization()
    }

    fn begin_output_finalization(&mut self) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        flow.ctx.reset_idx2();
        flow.ctx.set_phase(TxRequestPhase::Req5Output);
        Response::TxRequest {
            phase: TxRequestPhase::Req5Output,
            details: TxRequestDetails {
                request_index: Some(0),
                ..Default::default()
            },
            serialized: None,
        }
    }

    fn handle_req5_output(&mut self, tx: TxAckPayload) -> Response {
        let Some(output) = tx.output else {
            return Response::error(Error::DataError);
        };
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let idx = flow.ctx.idx2() as usize;
        let Some(expected) = flow.ctx.outputs().get(idx) else {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::ProcessError);
        };
        if expected.amount != output.amount {
            self.active = ActiveSigner::Idle;
            return Response::error(Error::DataError);
        }
        let done = flow.ctx.advance_idx2();
        if done < flow.ctx.output_count {
            return Response::TxRequest {
                phase: TxRequestPhase::Req5Output,
                details: TxRequestDetails {
                    request_index: Some(done),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        self.begin_segwit_witness_or_finish()
    }

    fn begin_segwit_witness_or_finish(&mut self) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        if flow.segwit_indices.is_empty() {
            return self.finish_tx();
        }
        flow.witness_ack_pass = 0;
        flow.ctx.set_phase(TxRequestPhase::ReqSegwitWitness);
        let idx = flow.segwit_indices[0];
        Response::TxRequest {
            phase: TxRequestPhase::ReqSegwitWitness,
            details: TxRequestDetails {
                request_index: Some(idx),
                ..Default::default()
            },
            serialized: None,
        }
    }

    fn handle_segwit_witness(&mut self, _tx: TxAckPayload) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        flow.witness_ack_pass += 1;
        if flow.witness_ack_pass < flow.segwit_indices.len() {
            let idx = flow.segwit_indices[flow.witness_ack_pass];
            return Response::TxRequest {
                phase: TxRequestPhase::ReqSegwitWitness,
                details: TxRequestDetails {
                    request_index: Some(idx),
                    ..Default::default()
                },
                serialized: None,
            };
        }
        self.finish_tx()
    }

    /// Assembles the final BIP144-style transaction from the scriptSigs and
    /// witnesses accumulated in phase 2.
    fn finish_tx(&mut self) -> Response {
        let ActiveSigner::Utxo(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        let has_witness = !flow.segwit_indices.is_empty();

        let mut out = Vec::new();
        out.extend_from_slice(&flow.ctx.version.to_le_bytes());
        if has_witness {
            out.push(0x00);
            out.push(0x01);
        }
        crypto::write_varint(&mut out, flow.pending_inputs.len() as u64);
        for (i, input) in flow.pending_inputs.iter().enumerate() {
            out.extend_from_slice(&input.prev_hash);
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            let script_sig = flow.script_sigs.get(&(i as u32)).cloned().unwrap_or_default();
            crypto::write_varint(&mut out, script_sig.len() as u64);
            out.extend_from_slice(&script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        crypto::write_varint(&mut out, flow.pending_outputs.len() as u64);
        for output in &flow.pending_outputs {
            out.extend_from_slice(&output.amount.to_le_bytes());
            crypto::write_varint(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }
        if has_witness {
            for i in 0..flow.pending_inputs.len() {
                match flow.witnesses.get(&(i as u32)) {
                    Some(stack) => {
                        crypto::write_varint(&mut out, stack.len() as u64);
                        for item in stack {
                            crypto::write_varint(&mut out, item.len() as u64);
                            out.extend_from_slice(item);
                        }
                    }
                    None => crypto::write_varint(&mut out, 0),
                }
            }
        }
        out.extend_from_slice(&flow.ctx.lock_time.to_le_bytes());

        let signature = flow
            .witnesses
            .values()
            .next()
            .and_then(|w| w.first())
            .cloned()
            .or_else(|| flow.script_sigs.values().next().cloned());

        self.active = ActiveSigner::Idle;
        Response::TxRequest {
            phase: TxRequestPhase::TxFinished,
            details: TxRequestDetails::default(),
            serialized: Some(TxSerialized {
                signature_index: Some(0),
                signature,
                serialized_tx: out,
            }),
        }
    }

    // === Ethereum signing (C6) ===

    #[allow(clippy::too_many_arguments)]
    fn start_ethereum_sign_tx(
        &mut self,
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
    ) -> Response {
        if let Err(resp) = self.require_unlocked() {
            return resp;
        }
        if let Err(e) = self.check_and_confirm_path(&address_n, ETHEREUM_SLIP44) {
            return Response::error(e);
        }
        let node = match self.session.derive(Curve::Secp256k1, &address_n) {
            Ok(n) => n,
            Err(e) => return Response::error(e),
        };

        let kind = if max_fee_per_gas.is_some() { TxKind::Eip1559 } else { TxKind::Legacy };
        let mut ctx = EthereumSignContext::new(
            kind,
            node,
            chain_id,
            to,
            value,
            nonce,
            gas_limit,
            gas_price,
            max_fee_per_gas.unwrap_or_default(),
            max_priority_fee_per_gas.unwrap_or_default(),
            data_length,
        );
        ctx.detect_known_token(&data_initial_chunk);

        let confirmed = if let Some(token) = &ctx.known_token {
            let amount = ctx.known_token_amount.as_deref().unwrap_or("?");
            self.ui
                .ask_confirm("eth-transfer", &alloc::format!("send {amount} {}", token.symbol))
        } else {
            self.ui.ask_confirm("eth-tx", "confirm transaction")
        };
        if !confirmed {
            return Response::error(Error::ActionCancelled);
        }

        if let Err(e) = ctx.feed_data_chunk(&data_initial_chunk) {
            return Response::error(e);
        }

        if ctx.data_left() == 0 {
            return self.finish_ethereum(ctx);
        }
        let request_len = ctx.next_chunk_request();
        self.active = ActiveSigner::Eth(Box::new(EthFlow { ctx }));
        Response::EthereumTxRequest { data_length: request_len }
    }

    fn drive_ethereum_ack(&mut self, data_chunk: Vec<u8>) -> Response {
        let ActiveSigner::Eth(flow) = &mut self.active else {
            return Response::error(Error::UnexpectedMessage);
        };
        if let Err(e) = flow.ctx.feed_data_chunk(&data_chunk) {
            self.active = ActiveSigner::Idle;
            return Response::error(e);
        }
        if flow.ctx.data_left() > 0 {
            let request_len = flow.ctx.next_chunk_request();
            return Response::EthereumTxRequest { data_length: request_len };
        }

        let ActiveSigner::Eth(flow) = core::mem::replace(&mut self.active, ActiveSigner::Idle) else {
            unreachable!("checked above");
        };
        self.finish_ethereum(flow.ctx)
    }

    fn finish_ethereum(&mut self, ctx: EthereumSignContext) -> Response {
        self.active = ActiveSigner::Idle;
        match ctx.finish() {
            Ok((v, sig)) => Response::EthereumTxSignature {
                signature_v: v,
                signature_r: sig.r,
                signature_s: sig.s,
            },
            Err(e) => Response::error(e),
        }
    }

    fn ethereum_sign_message(&mut self, address_n: Vec<u32>, message: Vec<u8>) -> Response {
        if let Err(resp) = self.require_unlocked() {
            return resp;
        }
        if let Err(e) = self.check_and_confirm_path(&address_n, ETHEREUM_SLIP44) {
            return Response::error(e);
        }
        if !self.ui.ask_confirm("eth-message", "confirm message") {
            return Response::error(Error::ActionCancelled);
        }
        let node = match self.session.derive(Curve::Secp256k1, &address_n) {
            Ok(n) => n,
            Err(e) => return Response::error(e),
        };
        match crate::ethereum::sign_personal_message(&node, &message) {
            Ok((_v, sig)) => {
                let address = match crate::ethereum::recover_personal_message_address(&message, &sig) {
                    Ok(a) => a,
                    Err(e) => return Response::error(e),
                };
                let mut signature = [0u8; 65];
                signature[..32].copy_from_slice(&sig.r);
                signature[32..64].copy_from_slice(&sig.s);
                signature[64] = sig.recovery_id + 27;
                Response::EthereumMessageSignature { address, signature }
            }
            Err(e) => Response::error(e),
        }
    }
}

/// Maps the wire input script type to the internal [`ScriptType`] plus
/// whether it signs through the BIP143 witness path. `SpendMultisig` is
/// routed through the legacy/P2SH path; native-segwit multisig (P2WSH) is
/// only reachable by a change output's own script type, never declared on
/// an input by the wire protocol.
fn map_input_script_type(script_type: TxInputScriptType) -> (ScriptType, bool) {
    match script_type {
        TxInputScriptType::SpendAddress => (ScriptType::SpendAddress, false),
        TxInputScriptType::SpendP2shWitness => (ScriptType::SpendP2shWitnessSingle, true),
        TxInputScriptType::SpendWitness => (ScriptType::SpendWitnessSingle, true),
        TxInputScriptType::SpendTaproot => (ScriptType::SpendTaproot, true),
        TxInputScriptType::SpendMultisig => (ScriptType::SpendP2shWitnessMulti, false),
    }
}

fn map_output_script_type(script_type: TxOutputScriptType) -> ScriptType {
    match script_type {
        TxOutputScriptType::PayToAddress => ScriptType::SpendAddress,
        TxOutputScriptType::PayToScriptHash => ScriptType::SpendP2shWitnessSingle,
        TxOutputScriptType::PayToWitnessScriptHash => ScriptType::SpendWitnessSingle,
        TxOutputScriptType::PayToTaproot => ScriptType::SpendTaproot,
    }
}

/// Builds the scriptPubKey for a change output paid back to one of this
/// wallet's own keys, given its declared script type.
fn script_pubkey_for_own_key(node: &HdNode, script_type: ScriptType) -> Result<Vec<u8>, Error> {
    match script_type {
        ScriptType::SpendAddress => {
            let pubkey = crypto::secp256k1_public_key(&node.privkey)?;
            Ok(address::p2pkh_script_pubkey(&crypto::compress_pubkey(&pubkey)))
        }
        ScriptType::SpendP2shWitnessSingle => {
            let pubkey = crypto::secp256k1_public_key(&node.privkey)?;
            Ok(address::p2sh_p2wpkh_script_pubkey(&crypto::compress_pubkey(&pubkey)))
        }
        ScriptType::SpendWitnessSingle => {
            let pubkey = crypto::secp256k1_public_key(&node.privkey)?;
            Ok(address::p2wpkh_script_pubkey(&crypto::compress_pubkey(&pubkey)))
        }
        ScriptType::SpendTaproot => {
            let (_tweaked_priv, output_xonly) = crypto::taproot_tweak_seckey(&node.privkey)?;
            Ok(address::p2tr_script_pubkey(&output_xonly))
        }
        ScriptType::SpendP2shWitnessMulti | ScriptType::SpendWitnessMulti => Err(Error::DataError),
    }
}

/// A rough vbyte*4 weight estimate, good enough for the fee-threshold
/// warning: not a byte-exact BIP141 serializer.
fn estimate_tx_weight(flow: &UtxoFlow) -> u64 {
    let input_weight = flow.pending_inputs.len() as u64 * 148 * 4;
    let output_weight: u64 = flow
        .pending_outputs
        .iter()
        .map(|o| (9 + o.script_pubkey.len() as u64) * 4)
        .sum();
    40 + input_weight + output_weight
}

/// SLIP-19 inputs declare the "unlock path" (`SLIP25_PURPOSE`) as their
/// `address_n` to ask the device to re-confirm a previously issued
/// ownership identifier before it is folded into a new transaction.
fn verify_coinjoin_ownership<K: KvStore>(session: &mut Session<K>, input: &TxInput) -> Result<(), Error> {
    let proof = input.ownership_proof.as_ref().ok_or(Error::DataError)?;
    if proof.len() != 32 {
        return Err(Error::DataError);
    }
    let mut claimed = [0u8; 32];
    claimed.copy_from_slice(proof);

    session.authorize_unlock_path();
    let node = session.derive(Curve::Secp256k1, &input.address_n)?;
    let pubkey = crypto::secp256k1_public_key(&node.privkey)?;
    let script_pubkey = address::p2wpkh_script_pubkey(&crypto::compress_pubkey(&pubkey));
    let slip21_key = session.derive_slip21(&[b"SLIP-0019", b"Ownership identifier"])?;
    let own_id = ownership_identifier(&slip21_key, &script_pubkey);

    verify_ownership_proof(&[], &script_pubkey, &[], &own_id, core::slice::from_ref(&claimed), false)?;
    Ok(())
}

fn sign_taproot_witness(
    ctx: &SignTxContext,
    input: &PreparedInput,
    node: &HdNode,
    outpoint: &[u8; 36],
    hash_outputs: &[u8; 32],
) -> Result<(Vec<u8>, Vec<Vec<u8>>), Error> {
    let sighash = ctx.taproot_sighash(outpoint, input.amount, hash_outputs);
    let (tweaked_priv, _output_xonly) = crypto::taproot_tweak_seckey(&node.privkey)?;
    let sig = ctx.sign_taproot_input(&tweaked_priv, &sighash)?;
    Ok((Vec::new(), alloc::vec![sig.to_vec()]))
}

fn sign_segwit_single_witness(
    ctx: &SignTxContext,
    input: &PreparedInput,
    node: &HdNode,
    outpoint: &[u8; 36],
    hash_outputs: &[u8; 32],
) -> Result<(Vec<u8>, Vec<Vec<u8>>), Error> {
    let pubkey = crypto::secp256k1_public_key(&node.privkey)?;
    let compressed = crypto::compress_pubkey(&pubkey);
    let script_code = address::p2pkh_script_pubkey(&compressed);
    let digest = ctx.bip143_preimage(outpoint, &script_code, input.amount, input.sequence, hash_outputs);
    let sig = ctx.sign_ecdsa_input(node, &digest)?;
    let sighash_byte = ctx.sighash_type() as u8;
    let mut sig_with_hashtype = sig.to_der();
    sig_with_hashtype.push(sighash_byte);
    let witness = alloc::vec![sig_with_hashtype, compressed.to_vec()];

    let script_sig = if input.script_type == ScriptType::SpendP2shWitnessSingle {
        let redeem = address::p2wpkh_script_pubkey(&compressed);
        let mut push = Vec::with_capacity(1 + redeem.len());
        push.push(redeem.len() as u8);
        push.extend_from_slice(&redeem);
        push
    } else {
        Vec::new()
    };
    Ok((script_sig, witness))
}

fn sign_segwit_multisig_witness(
    ctx: &SignTxContext,
    input: &PreparedInput,
    node: &HdNode,
    outpoint: &[u8; 36],
    hash_outputs: &[u8; 32],
) -> Result<(Vec<u8>, Vec<Vec<u8>>), Error> {
    let redeem = input.multisig_script.as_ref().ok_or(Error::DataError)?;
    let digest = ctx.bip143_preimage(outpoint, redeem, input.amount, input.sequence, hash_outputs);
    let sig = ctx.sign_ecdsa_input(node, &digest)?;
    let sighash_byte = ctx.sighash_type() as u8;
    let mut signatures = input.multisig_signatures.clone().unwrap_or_default();
    signatures.push((sig.to_der(), sighash_byte));

    let mut witness: Vec<Vec<u8>> = alloc::vec![Vec::new()];
    for (der_sig, sighash) in &signatures {
        let mut item = der_sig.clone();
        item.push(*sighash);
        witness.push(item);
    }
    witness.push(redeem.clone());

    let script_sig = if input.script_type == ScriptType::SpendP2shWitnessMulti {
        let program = address::p2wsh_script_pubkey(redeem);
        let mut push = Vec::with_capacity(1 + program.len());
        push.push(program.len() as u8);
        push.extend_from_slice(&program);
        push
    } else {
        Vec::new()
    };
    Ok((script_sig, witness))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{Hasher, Sha256};
    use crate::session::KvKey;
    use crate::testutil::{InMemoryKv, TestUi};
    use signer_common::message::{PrevTxInput, PrevTxMeta, PrevTxOutput, TxOutput};

    const BIP84_PATH: [u32; 5] = [0x8000_0054, 0x8000_0000, 0x8000_0000, 0, 0];

    fn dispatcher_with_seed() -> Dispatcher<InMemoryKv, TestUi> {
        let mut kv = InMemoryKv::new();
        kv.put(
            KvKey::Mnemonic,
            b"abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
        );
        kv.put(KvKey::PinHash, &crate::hash::Sha256::hash(b"1234"));
        Dispatcher::new(kv, TestUi::new())
    }

    fn unlocked_dispatcher() -> Dispatcher<InMemoryKv, TestUi> {
        let mut dispatcher = dispatcher_with_seed();
        dispatcher.handle(Request::PinMatrixAck {
            matrix_response: String::from("1234"),
        });
        dispatcher
    }

    fn segwit_input_ack(amount: u64) -> TxAckPayload {
        TxAckPayload {
            input: Some(TxInput {
                address_n: BIP84_PATH.to_vec(),
                prev_hash: [0x11; 32],
                prev_index: 0,
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
                amount,
                script_type: TxInputScriptType::SpendWitness,
                multisig_script: None,
                multisig_signatures: None,
                ownership_proof: None,
            }),
            output: None,
            extra_data: None,
            prev_meta: None,
            prev_input: None,
            prev_output: None,
        }
    }

    fn output_ack(address: String, amount: u64) -> TxAckPayload {
        TxAckPayload {
            input: None,
            output: Some(TxOutput {
                address_n: Vec::new(),
                address: Some(address),
                amount,
                script_type: TxOutputScriptType::PayToWitnessScriptHash,
            }),
            extra_data: None,
            prev_meta: None,
            prev_input: None,
            prev_output: None,
        }
    }

    #[test]
    fn get_features_reports_locked_uninitialized_state() {
        let kv = InMemoryKv::new();
        let mut dispatcher = Dispatcher::new(kv, TestUi::new());
        let resp = dispatcher.handle(Request::GetFeatures);
        assert_eq!(
            resp,
            Response::Features {
                initialized: false,
                session_id: None,
                locked: true,
            }
        );
    }

    #[test]
    fn sign_tx_before_unlock_requests_pin() {
        let mut dispatcher = dispatcher_with_seed();
        let resp = dispatcher.handle(Request::SignTx {
            coin_name: String::from("Bitcoin"),
            input_count: 1,
            output_count: 1,
            lock_time: 0,
            version: 2,
        });
        assert_eq!(resp, Response::PinMatrixRequest);
    }

    #[test]
    fn ethereum_sign_message_round_trips_after_unlock() {
        let mut dispatcher = unlocked_dispatcher();
        dispatcher.ui = TestUi::new().with_button_answers(&[true]);
        let resp = dispatcher.handle(Request::EthereumSignMessage {
            address_n: alloc::vec![0x8000_002c, 0x8000_003c, 0x8000_0000, 0, 0],
            message: alloc::vec![1, 2, 3],
        });
        assert!(matches!(resp, Response::EthereumMessageSignature { .. }));
    }

    #[test]
    fn cancel_before_pin_entry_reports_pin_cancelled() {
        let mut dispatcher = dispatcher_with_seed();
        let resp = dispatcher.handle(Request::SignTx {
            coin_name: String::from("Bitcoin"),
            input_count: 1,
            output_count: 1,
            lock_time: 0,
            version: 2,
        });
        assert_eq!(resp, Response::PinMatrixRequest);
        let resp = dispatcher.handle(Request::Cancel);
        assert_eq!(resp, Response::error(Error::PinCancelled));
    }

    #[test]
    fn cancel_clears_active_signer() {
        let mut dispatcher = unlocked_dispatcher();
        dispatcher.handle(Request::SignTx {
            coin_name: String::from("Bitcoin"),
            input_count: 1,
            output_count: 1,
            lock_time: 0,
            version: 2,
        });
        let resp = dispatcher.handle(Request::Cancel);
        assert_eq!(resp, Response::error(Error::ActionCancelled));
        assert!(matches!(dispatcher.active, ActiveSigner::Idle));
    }

    #[test]
    fn initialize_with_mismatched_session_id_reports_invalid_session() {
        let mut dispatcher = unlocked_dispatcher();
        let current = dispatcher.session.session_id().unwrap();
        let mut bogus = current;
        bogus[0] ^= 0xff;
        let resp = dispatcher.handle(Request::Initialize { session_id: Some(bogus) });
        assert_eq!(resp, Response::error(Error::InvalidSession));
    }

    #[test]
    fn change_pin_rejects_without_confirmation() {
        let mut dispatcher = unlocked_dispatcher();
        dispatcher.ui = TestUi::new().with_button_answers(&[false]);
        let resp = dispatcher.handle(Request::ChangePin {
            new_pin: String::from("4321"),
            new_pin_confirm: String::from("4321"),
            wipe_code: None,
            wipe_code_confirm: None,
        });
        assert_eq!(resp, Response::error(Error::ActionCancelled));
    }

    #[test]
    fn change_pin_accepts_after_confirmation() {
        let mut dispatcher = unlocked_dispatcher();
        dispatcher.ui = TestUi::new().with_button_answers(&[true]);
        let resp = dispatcher.handle(Request::ChangePin {
            new_pin: String::from("4321"),
            new_pin_confirm: String::from("4321"),
            wipe_code: None,
            wipe_code_confirm: None,
        });
        assert_eq!(resp, Response::Success { message: None });
    }

    #[test]
    fn tick_past_deadline_locks_and_clears_active_signer() {
        let mut dispatcher = unlocked_dispatcher();
        dispatcher.tick(1_000);
        dispatcher.handle(Request::SignTx {
            coin_name: String::from("Bitcoin"),
            input_count: 1,
            output_count: 1,
            lock_time: 0,
            version: 2,
        });
        dispatcher.tick(1_000 + crate::session::DEFAULT_AUTOLOCK_DELAY_MS);
        assert!(matches!(dispatcher.active, ActiveSigner::Idle));
        assert_eq!(dispatcher.session.state(), SessionState::Locked);
    }

    /// Scenario: one native-segwit P2WPKH input spent to one external
    /// native-segwit address, no change, driven through the full
    /// Req1Input..TxFinished phase sequence.
    #[test]
    fn sign_tx_with_single_native_segwit_input_produces_witness_tx() {
        let mut dispatcher = unlocked_dispatcher();
        dispatcher.ui = TestUi::new().with_button_answers(&[true, true]);

        let node = dispatcher.session.derive(Curve::Secp256k1, &BIP84_PATH).unwrap();
        let pubkey = crypto::secp256k1_public_key(&node.privkey).unwrap();
        let dest_addr = address::p2wpkh_address(&signer_common::coin::BITCOIN, &crypto::compress_pubkey(&pubkey)).unwrap();

        let resp = dispatcher.handle(Request::SignTx {
            coin_name: String::from("Bitcoin"),
            input_count: 1,
            output_count: 1,
            lock_time: 0,
            version: 2,
        });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req1Input,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck { tx: segwit_input_ack(100_000) });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req3Output,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck { tx: output_ack(dest_addr, 90_000) });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req4Input,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck { tx: segwit_input_ack(100_000) });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req4Output,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let dest_addr_for_req4 = {
            let node = dispatcher.session.derive(Curve::Secp256k1, &BIP84_PATH).unwrap();
            let pubkey = crypto::secp256k1_public_key(&node.privkey).unwrap();
            address::p2wpkh_address(&signer_common::coin::BITCOIN, &crypto::compress_pubkey(&pubkey)).unwrap()
        };
        let resp = dispatcher.handle(Request::TxAck { tx: output_ack(dest_addr_for_req4, 90_000) });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::ReqSegwitInput,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck { tx: segwit_input_ack(100_000) });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req5Output,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let dest_addr_for_req5 = {
            let node = dispatcher.session.derive(Curve::Secp256k1, &BIP84_PATH).unwrap();
            let pubkey = crypto::secp256k1_public_key(&node.privkey).unwrap();
            address::p2wpkh_address(&signer_common::coin::BITCOIN, &crypto::compress_pubkey(&pubkey)).unwrap()
        };
        let resp = dispatcher.handle(Request::TxAck { tx: output_ack(dest_addr_for_req5, 90_000) });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::ReqSegwitWitness,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck {
            tx: TxAckPayload {
                input: None,
                output: None,
                extra_data: None,
                prev_meta: None,
                prev_input: None,
                prev_output: None,
            },
        });
        match resp {
            Response::TxRequest { phase, serialized: Some(tx), .. } => {
                assert_eq!(phase, TxRequestPhase::TxFinished);
                assert!(!tx.serialized_tx.is_empty());
                assert_eq!(&tx.serialized_tx[4..6], &[0x00, 0x01]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(matches!(dispatcher.active, ActiveSigner::Idle));
    }

    /// Scenario: one legacy P2PKH input, streamed through the full
    /// previous-transaction authentication sub-loop before phase 2.
    #[test]
    fn sign_tx_with_legacy_p2pkh_input_streams_prev_tx_and_signs() {
        let mut dispatcher = unlocked_dispatcher();
        dispatcher.ui = TestUi::new().with_button_answers(&[true, true]);

        let node = dispatcher.session.derive(Curve::Secp256k1, &BIP84_PATH).unwrap();
        let pubkey = crypto::secp256k1_public_key(&node.privkey).unwrap();
        let compressed = crypto::compress_pubkey(&pubkey);
        let own_script_pubkey = address::p2pkh_script_pubkey(&compressed);
        let dest_addr = address::p2wpkh_address(&signer_common::coin::BITCOIN, &compressed).unwrap();

        dispatcher.handle(Request::SignTx {
            coin_name: String::from("Bitcoin"),
            input_count: 1,
            output_count: 1,
            lock_time: 0,
            version: 2,
        });

        let legacy_input = TxInput {
            address_n: BIP84_PATH.to_vec(),
            prev_hash: [0u8; 32], // overwritten below once the prev tx's txid is known
            prev_index: 0,
            script_sig: Vec::new(),
            sequence: 0xffff_ffff,
            amount: 50_000,
            script_type: TxInputScriptType::SpendAddress,
            multisig_script: None,
            multisig_signatures: None,
            ownership_proof: None,
        };

        // Build a one-output previous transaction paying `own_script_pubkey`
        // and compute its txid the same way `PrevTxAuthenticator` does, so
        // the claimed `prev_hash` matches what gets reconstructed.
        let prev_meta = PrevTxMeta {
            version: 1,
            input_count: 1,
            output_count: 1,
            lock_time: 0,
        };
        let prev_input = PrevTxInput {
            prev_hash: [0x22; 32],
            prev_index: 0,
            script_sig: alloc::vec![0xAB],
            sequence: 0xffff_ffff,
        };
        let prev_output = PrevTxOutput {
            amount: 50_000,
            script_pubkey: own_script_pubkey.clone(),
        };

        let mut reference = crate::utxo::PrevTxAuthenticator::new(&prev_meta, 0);
        reference.feed_input(&prev_input);
        reference.feed_output(0, &prev_output);
        let (txid, _) = reference.finish();

        let legacy_input = TxInput {
            prev_hash: txid,
            ..legacy_input
        };

        let resp = dispatcher.handle(Request::TxAck {
            tx: TxAckPayload {
                input: Some(legacy_input),
                output: None,
                extra_data: None,
                prev_meta: None,
                prev_input: None,
                prev_output: None,
            },
        });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req2PrevMeta,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck {
            tx: TxAckPayload {
                input: None,
                output: None,
                extra_data: None,
                prev_meta: Some(prev_meta),
                prev_input: None,
                prev_output: None,
            },
        });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req2PrevInput,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck {
            tx: TxAckPayload {
                input: None,
                output: None,
                extra_data: None,
                prev_meta: None,
                prev_input: Some(prev_input),
                prev_output: None,
            },
        });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req2PrevOutput,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck {
            tx: TxAckPayload {
                input: None,
                output: None,
                extra_data: None,
                prev_meta: None,
                prev_input: None,
                prev_output: Some(prev_output),
            },
        });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req3Output,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );

        let resp = dispatcher.handle(Request::TxAck { tx: output_ack(dest_addr.clone(), 40_000) });
        assert_eq!(
            resp,
            Response::TxRequest {
                phase: TxRequestPhase::Req4Input,
                details: TxRequestDetails { request_index: Some(0), ..Default::default() },
                serialized: None,
            }
        );
    }
}
