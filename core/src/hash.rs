//! Streaming hash primitives (C1).
//!
//! Every hasher used by a signing engine implements [`Hasher`] so the UTXO
//! and Ethereum engines can feed it data incrementally across message
//! boundaries without holding the full preimage in memory.

use blake2::Blake2bVar;
use digest::{Digest, Update, VariableOutput};
use ripemd::Ripemd160 as Ripemd160Impl;
use sha2::{Sha256 as Sha256Impl, Sha512 as Sha512Impl};
use sha3::Keccak256 as Keccak256Impl;

/// A cryptographic hasher that produces a fixed-size output, fed incrementally.
pub trait Hasher<const OUTPUT_SIZE: usize>: Sized {
    fn new() -> Self;
    fn update(&mut self, data: &[u8]) -> &mut Self;
    fn digest(self, out: &mut [u8; OUTPUT_SIZE]);

    fn finalize(self) -> [u8; OUTPUT_SIZE] {
        let mut out = [0u8; OUTPUT_SIZE];
        self.digest(&mut out);
        out
    }

    fn hash(data: &[u8]) -> [u8; OUTPUT_SIZE] {
        let mut h = Self::new();
        h.update(data);
        h.finalize()
    }
}

macro_rules! impl_hash {
    ($name:ident, $real:ty, $digest_size:expr) => {
        #[derive(Clone)]
        pub struct $name($real);

        impl Hasher<$digest_size> for $name {
            fn new() -> Self {
                Self(<$real>::new())
            }

            fn update(&mut self, data: &[u8]) -> &mut Self {
                Digest::update(&mut self.0, data);
                self
            }

            fn digest(self, out: &mut [u8; $digest_size]) {
                out.copy_from_slice(&self.0.finalize());
            }
        }
    };
}

impl_hash!(Sha256, Sha256Impl, 32);
impl_hash!(Sha512, Sha512Impl, 64);
impl_hash!(Ripemd160, Ripemd160Impl, 20);
impl_hash!(Keccak256, Keccak256Impl, 32);

/// Double SHA-256, the transaction and block hash used by Bitcoin-family coins.
#[derive(Clone)]
pub struct Sha256d(Sha256Impl);

impl Hasher<32> for Sha256d {
    fn new() -> Self {
        Self(Sha256Impl::new())
    }

    fn update(&mut self, data: &[u8]) -> &mut Self {
        Digest::update(&mut self.0, data);
        self
    }

    fn digest(self, out: &mut [u8; 32]) {
        let first = self.0.finalize();
        let second = Sha256Impl::digest(first);
        out.copy_from_slice(&second);
    }
}

/// HASH160 = RIPEMD160(SHA256(x)), used to build P2PKH/P2WPKH payloads.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::hash(data);
    Ripemd160::hash(&sha)
}

/// BLAKE2b with a 32-byte output and an explicit 16-byte personalization,
/// used by Zcash-family sighash algorithms (`ZcashPrevoutsHash`, etc).
pub struct Blake2bPersonalized {
    inner: Blake2bVar,
}

impl Blake2bPersonalized {
    pub fn new(personalization: &[u8; 16]) -> Self {
        let inner = Blake2bVar::new_with_params(&[], personalization, &[], 32)
            .expect("32-byte blake2b output is always a valid configuration");
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        Update::update(&mut self.inner, data);
        self
    }

    pub fn finalize(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.inner
            .finalize_variable(&mut out)
            .expect("output buffer matches the configured digest length");
        out
    }
}

/// CRC16/CCITT-FALSE, used by the SLIP-39/Electrum-style checksum paths
/// referenced in address encoders.
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_matches_double_application() {
        let data = b"hello";
        let once = Sha256::hash(data);
        let twice = Sha256::hash(&once);
        assert_eq!(Sha256d::hash(data), twice);
    }

    #[test]
    fn hash160_is_ripemd_of_sha256() {
        let data = b"hello";
        let sha = Sha256::hash(data);
        let expected = Ripemd160::hash(&sha);
        assert_eq!(hash160(data), expected);
    }

    #[test]
    fn keccak256_empty_input() {
        let digest = Keccak256::hash(b"");
        assert_eq!(
            digest,
            hex_literal::hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
    }

    #[test]
    fn blake2b_personalized_differs_by_personalization() {
        let mut a = Blake2bPersonalized::new(b"ZcashPrevoutHash");
        a.update(b"data");
        let mut b = Blake2bPersonalized::new(b"ZcashSequencHash");
        b.update(b"data");
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn crc16_is_stable() {
        assert_eq!(crc16_ccitt(b""), 0xffff);
    }
}
