//! Message transport (C4).
//!
//! Fixed-size packet framing and reassembly, plus the full/tiny parser
//! split the main loop needs while a handler is suspended waiting for a
//! button press or the next `TxAck`.

use alloc::vec::Vec;

use signer_common::comm::{
    CONT_PACKET_PAYLOAD, FIRST_PACKET_PAYLOAD, MSG_CONT_MAGIC, MSG_HEADER_MAGIC, MSG_IN_ENCODED_SIZE,
    PACKET_SIZE,
};
use signer_common::error::Error;

/// Reassembles fixed-size packets into one encoded message.
pub struct Reassembler {
    msg_id: u16,
    expected_len: usize,
    buffer: Vec<u8>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            msg_id: 0,
            expected_len: 0,
            buffer: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.msg_id = 0;
        self.expected_len = 0;
        self.buffer.clear();
    }

    /// Feeds one fixed-size packet. Returns `Some((msg_id, payload))` once
    /// a full message has been assembled.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Option<(u16, Vec<u8>)>, Error> {
        if packet.len() != PACKET_SIZE {
            return Err(Error::DataError);
        }

        if packet.starts_with(&MSG_HEADER_MAGIC) {
            let msg_id = u16::from_be_bytes([packet[3], packet[4]]);
            let msg_len = u32::from_be_bytes([packet[5], packet[6], packet[7], packet[8]]) as usize;
            if msg_len > MSG_IN_ENCODED_SIZE {
                self.reset();
                return Err(Error::DataError);
            }

            self.msg_id = msg_id;
            self.expected_len = msg_len;
            self.buffer = Vec::with_capacity(msg_len);

            let take = msg_len.min(FIRST_PACKET_PAYLOAD);
            self.buffer.extend_from_slice(&packet[9..9 + take]);
        } else if packet[0] == MSG_CONT_MAGIC {
            if self.expected_len == 0 && self.buffer.is_empty() {
                // Continuation packet with no header in flight: not our message.
                return Ok(None);
            }
            let remaining = self.expected_len - self.buffer.len();
            let take = remaining.min(CONT_PACKET_PAYLOAD);
            self.buffer.extend_from_slice(&packet[1..1 + take]);
        } else {
            return Err(Error::DataError);
        }

        if self.buffer.len() >= self.expected_len {
            let msg_id = self.msg_id;
            let payload = core::mem::take(&mut self.buffer);
            self.reset();
            Ok(Some((msg_id, payload)))
        } else {
            Ok(None)
        }
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an outgoing encoded message into fixed-size packets, framed the
/// same way incoming ones are.
pub fn fragment(msg_id: u16, payload: &[u8]) -> Vec<[u8; PACKET_SIZE]> {
    let mut packets = Vec::new();
    let mut offset = 0;

    let mut first = [0u8; PACKET_SIZE];
    first[0..3].copy_from_slice(&MSG_HEADER_MAGIC);
    first[3..5].copy_from_slice(&msg_id.to_be_bytes());
    first[5..9].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    let take = payload.len().min(FIRST_PACKET_PAYLOAD);
    first[9..9 + take].copy_from_slice(&payload[..take]);
    packets.push(first);
    offset += take;

    while offset < payload.len() {
        let mut packet = [0u8; PACKET_SIZE];
        packet[0] = MSG_CONT_MAGIC;
        let take = (payload.len() - offset).min(CONT_PACKET_PAYLOAD);
        packet[1..1 + take].copy_from_slice(&payload[offset..offset + take]);
        packets.push(packet);
        offset += take;
    }

    packets
}

/// The closed set of message kinds the tiny parser recognises while a
/// handler is suspended. Anything else is silently dropped, except an
/// oversize message, which resets the parser with a `DataError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMessage {
    Cancel,
    Initialize,
    ButtonAck,
    PinMatrixAck,
    PassphraseAck,
}

/// Dispatch mode the main loop is in. The full parser decodes any known
/// message id; the tiny parser is active only while a handler is
/// suspended waiting on a button or the next `TxAck`, and only recognizes
/// [`InterruptMessage`] kinds.
pub enum ParserMode {
    Full,
    Tiny,
}

/// Recognises the interrupt-set message ids while in tiny-parser mode.
/// Message id assignment mirrors the wire catalogue; unknown ids return
/// `None` rather than an error, per §4.7's "silently dropped" rule.
pub fn classify_tiny(msg_id: u16) -> Option<InterruptMessage> {
    match msg_id {
        0x0001 => Some(InterruptMessage::Initialize),
        0x0002 => Some(InterruptMessage::Cancel),
        0x0003 => Some(InterruptMessage::ButtonAck),
        0x0004 => Some(InterruptMessage::PinMatrixAck),
        0x0005 => Some(InterruptMessage::PassphraseAck),
        _ => None,
    }
}

/// Msg id the device echoes back on every response, since the framing
/// format doesn't otherwise distinguish requests from replies.
const RESPONSE_MSG_ID: u16 = 0x0000;

/// Owns the packet-reassembly state and which parser mode the main loop is
/// in, and connects both to a [`crate::signer::Dispatcher`]: feed it packets
/// one at a time, get back the outgoing packets for whatever response the
/// dispatcher produced once a full message has been assembled.
pub struct Transport {
    reassembler: Reassembler,
    mode: ParserMode,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            reassembler: Reassembler::new(),
            mode: ParserMode::Full,
        }
    }

    /// Feeds one fixed-size packet. Returns the packets to send back once a
    /// full message has decoded and been dispatched; `Ok(None)` while a
    /// message is still being reassembled or the tiny parser drops an
    /// out-of-set message id.
    pub fn drive<K: crate::session::KvStore, U: crate::signer::Ui>(
        &mut self,
        packet: &[u8],
        dispatcher: &mut crate::signer::Dispatcher<K, U>,
        now_ms: u64,
    ) -> Result<Option<Vec<[u8; PACKET_SIZE]>>, Error> {
        let Some((msg_id, payload)) = self.reassembler.feed(packet)? else {
            return Ok(None);
        };

        if matches!(self.mode, ParserMode::Tiny) && classify_tiny(msg_id).is_none() {
            return Ok(None);
        }

        let request: signer_common::message::Request =
            postcard::from_bytes(&payload).map_err(|_| Error::DataError)?;

        dispatcher.tick(now_ms);
        let response = dispatcher.handle(request);

        self.mode = if matches!(
            response,
            signer_common::message::Response::PinMatrixRequest
                | signer_common::message::Response::PassphraseRequest
                | signer_common::message::Response::ButtonRequest
        ) {
            ParserMode::Tiny
        } else {
            ParserMode::Full
        };

        let encoded = postcard::to_allocvec(&response).map_err(|_| Error::DataError)?;
        Ok(Some(fragment(RESPONSE_MSG_ID, &encoded)))
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_then_reassemble_round_trips() {
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
        let packets = fragment(0x1234, &payload);
        assert!(packets.len() > 1);

        let mut reassembler = Reassembler::new();
        let mut result = None;
        for packet in &packets {
            if let Some(r) = reassembler.feed(packet).unwrap() {
                result = Some(r);
            }
        }
        let (msg_id, decoded) = result.unwrap();
        assert_eq!(msg_id, 0x1234);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn oversize_header_is_data_error() {
        let mut packet = [0u8; PACKET_SIZE];
        packet[0..3].copy_from_slice(&MSG_HEADER_MAGIC);
        packet[5..9].copy_from_slice(&(MSG_IN_ENCODED_SIZE as u32 + 1).to_be_bytes());
        let mut reassembler = Reassembler::new();
        assert_eq!(reassembler.feed(&packet).unwrap_err(), Error::DataError);
    }

    #[test]
    fn tiny_parser_classifies_interrupt_set_only() {
        assert_eq!(classify_tiny(0x0002), Some(InterruptMessage::Cancel));
        assert_eq!(classify_tiny(0xffff), None);
    }

    #[test]
    fn single_packet_message_assembles_immediately() {
        let payload = alloc::vec![1u8, 2, 3];
        let packets = fragment(0x0010, &payload);
        assert_eq!(packets.len(), 1);
        let mut reassembler = Reassembler::new();
        let (msg_id, decoded) = reassembler.feed(&packets[0]).unwrap().unwrap();
        assert_eq!(msg_id, 0x0010);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn drive_decodes_dispatches_and_reencodes_get_features() {
        use crate::signer::Dispatcher;
        use crate::testutil::{InMemoryKv, TestUi};
        use signer_common::message::{Request, Response};

        let mut dispatcher = Dispatcher::new(InMemoryKv::new(), TestUi::new());
        let mut transport = Transport::new();

        let encoded = postcard::to_allocvec(&Request::GetFeatures).unwrap();
        let packets = fragment(0x0042, &encoded);
        assert_eq!(packets.len(), 1);

        let out = transport.drive(&packets[0], &mut dispatcher, 0).unwrap().unwrap();
        assert_eq!(out.len(), 1);

        let mut reassembler = Reassembler::new();
        let (_, decoded) = reassembler.feed(&out[0]).unwrap().unwrap();
        let response: Response = postcard::from_bytes(&decoded).unwrap();
        assert_eq!(
            response,
            Response::Features {
                initialized: false,
                session_id: None,
                locked: true,
            }
        );
    }

    #[test]
    fn drive_switches_to_tiny_parser_while_pin_is_outstanding() {
        use crate::hash::{Hasher, Sha256};
        use crate::session::KvKey;
        use crate::signer::Dispatcher;
        use crate::testutil::{InMemoryKv, TestUi};
        use signer_common::message::Request;

        let mut kv = InMemoryKv::new();
        kv.put(KvKey::Mnemonic, b"abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about");
        kv.put(KvKey::PinHash, &Sha256::hash(b"1234"));
        let mut dispatcher = Dispatcher::new(kv, TestUi::new());
        let mut transport = Transport::new();

        let sign_tx = Request::SignTx {
            coin_name: alloc::string::String::from("Bitcoin"),
            input_count: 1,
            output_count: 1,
            lock_time: 0,
            version: 2,
        };
        let encoded = postcard::to_allocvec(&sign_tx).unwrap();
        let packets = fragment(0x0010, &encoded);
        transport.drive(&packets[0], &mut dispatcher, 0).unwrap();
        assert!(matches!(transport.mode, ParserMode::Tiny));

        // An out-of-set message id is silently dropped while tiny.
        let ack = Request::ButtonAck;
        let encoded = postcard::to_allocvec(&ack).unwrap();
        let packets = fragment(0x0099, &encoded);
        assert!(transport.drive(&packets[0], &mut dispatcher, 0).unwrap().is_none());
    }
}
