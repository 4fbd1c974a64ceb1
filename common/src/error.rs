//! The core's single error type.
//!
//! Every fallible function in the core returns `Result<T, Error>`. The C7
//! dispatcher is the only place that turns an `Error` into a `Failure`
//! wire message; handlers never build a `Failure` by hand.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Failure kinds carried in the `Failure` wire message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Error {
    // --- protocol / dispatch ---
    /// Message arrived out of protocol order.
    UnexpectedMessage = 1,
    /// Physical confirmation is required before this request can proceed.
    ButtonExpected = 2,
    /// Malformed field, invalid coin/script combination, or out-of-range value.
    DataError = 3,
    /// User pressed cancel, or a `Cancel` message was received.
    ActionCancelled = 4,

    // --- PIN / session ---
    /// The session is locked; a PIN unlock is required.
    PinExpected = 5,
    /// The PIN entry flow was cancelled.
    PinCancelled = 6,
    /// The entered PIN did not match stored material.
    PinInvalid = 7,
    /// A PIN was set during enrolment but does not match on confirmation.
    PinMismatch = 8,
    /// A wipe code was set during enrolment but does not match on confirmation.
    WipeCodeMismatch = 9,
    /// The session id on the request does not match the current session.
    InvalidSession = 10,

    // --- signing ---
    /// Signature verification failed (e.g. a message-verify request).
    InvalidSignature = 11,
    /// An internal invariant was broken while driving a signer state machine.
    ProcessError = 12,
    /// `Σ inputs < Σ outputs` on a coin that requires a non-negative fee.
    NotEnoughFunds = 13,

    // --- device state ---
    /// The device has no seed provisioned.
    NotInitialized = 14,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Error::*;
        match self {
            UnexpectedMessage => write!(f, "message arrived out of protocol order"),
            ButtonExpected => write!(f, "physical confirmation required"),
            DataError => write!(f, "malformed or out-of-range field"),
            ActionCancelled => write!(f, "action cancelled by user or host"),

            PinExpected => write!(f, "session is locked, PIN required"),
            PinCancelled => write!(f, "PIN entry cancelled"),
            PinInvalid => write!(f, "PIN does not match"),
            PinMismatch => write!(f, "PIN confirmation does not match"),
            WipeCodeMismatch => write!(f, "wipe code confirmation does not match"),
            InvalidSession => write!(f, "session id does not match current session"),

            InvalidSignature => write!(f, "signature verification failed"),
            ProcessError => write!(f, "internal invariant broken during signing"),
            NotEnoughFunds => write!(f, "outputs exceed inputs"),

            NotInitialized => write!(f, "device has no seed"),
        }
    }
}

impl Error {
    /// The numeric wire code for this error, as carried in `Failure`.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Reverse of [`Error::code`]. `None` for any code this build doesn't know.
    pub fn from_code(code: u16) -> Option<Error> {
        use Error::*;
        Some(match code {
            1 => UnexpectedMessage,
            2 => ButtonExpected,
            3 => DataError,
            4 => ActionCancelled,
            5 => PinExpected,
            6 => PinCancelled,
            7 => PinInvalid,
            8 => PinMismatch,
            9 => WipeCodeMismatch,
            10 => InvalidSession,
            11 => InvalidSignature,
            12 => ProcessError,
            13 => NotEnoughFunds,
            14 => NotInitialized,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let all = [
            Error::UnexpectedMessage,
            Error::ButtonExpected,
            Error::DataError,
            Error::ActionCancelled,
            Error::PinExpected,
            Error::PinCancelled,
            Error::PinInvalid,
            Error::PinMismatch,
            Error::WipeCodeMismatch,
            Error::InvalidSession,
            Error::InvalidSignature,
            Error::ProcessError,
            Error::NotEnoughFunds,
            Error::NotInitialized,
        ];
        let mut codes: alloc::vec::Vec<u16> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn display_is_non_empty_for_every_variant() {
        use alloc::string::ToString;
        assert!(!Error::PinExpected.to_string().is_empty());
        assert!(!Error::ProcessError.to_string().is_empty());
    }

    #[test]
    fn every_variant_round_trips_through_its_wire_code() {
        let all = [
            Error::UnexpectedMessage,
            Error::ButtonExpected,
            Error::DataError,
            Error::ActionCancelled,
            Error::PinExpected,
            Error::PinCancelled,
            Error::PinInvalid,
            Error::PinMismatch,
            Error::WipeCodeMismatch,
            Error::InvalidSession,
            Error::InvalidSignature,
            Error::ProcessError,
            Error::NotEnoughFunds,
            Error::NotInitialized,
        ];
        for e in all {
            assert_eq!(Error::from_code(e.code()), Some(e));
        }
    }

    #[test]
    fn unknown_code_has_no_variant() {
        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(15), None);
        assert_eq!(Error::from_code(u16::MAX), None);
    }
}
