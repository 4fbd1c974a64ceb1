#![no_std]

extern crate alloc;

pub mod address;
pub mod crypto;
pub mod ethereum;
pub mod hash;
pub mod keys;
pub mod session;
pub mod signer;
pub mod transport;
pub mod utxo;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use signer_common::{coin, constants, error::Error, message, token};

pub fn fatal(msg: &str) -> ! {
    log::error!("{msg}");
    panic!("{msg}");
}
