//! Crypto primitives façade (C1).
//!
//! Every signer drives its signatures through this module rather than
//! reaching for `k256`/`ed25519-dalek` directly, so the low-s and
//! canonical-recovery-id rules live in exactly one place.

use alloc::vec::Vec;

use hmac::{Hmac, Mac};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{RecoveryId, Signature as Secp256k1Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::Sha256 as Sha256Digest;
use sha2::Sha512 as Sha512Digest;

use k256::schnorr::{Signature as SchnorrSignature, SigningKey as SchnorrSigningKey, VerifyingKey as SchnorrVerifyingKey};

use signer_common::error::Error;

use crate::hash::{Hasher, Sha256, Sha512};

/// Upper bound on deterministic-nonce retries while hunting for a signature
/// that also satisfies a caller-supplied canonicity predicate (see
/// [`ecdsa_sign_digest_canonical`]).
pub const MAX_ECDSA_RETRIES: u32 = signer_common::constants::MAX_ECDSA_RETRIES;

/// A secp256k1 ECDSA signature plus recovery id, low-s normalized.
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl RecoverableSignature {
    /// DER encoding of `(r, s)`, the form every Bitcoin-family scriptSig or
    /// witness signature push actually carries.
    pub fn to_der(&self) -> Vec<u8> {
        der_encode_signature(&self.r, &self.s)
    }
}

fn der_encode_integer(out: &mut Vec<u8>, bytes: &[u8]) {
    let mut b = bytes.as_ref();
    while b.len() > 1 && b[0] == 0 && b[1] & 0x80 == 0 {
        b = &b[1..];
    }
    let mut value = Vec::with_capacity(b.len() + 1);
    if b[0] & 0x80 != 0 {
        value.push(0x00);
    }
    value.extend_from_slice(b);
    out.push(0x02);
    out.push(value.len() as u8);
    out.extend_from_slice(&value);
}

/// Hand-rolled ASN.1 DER `SEQUENCE { INTEGER r, INTEGER s }`, the encoding
/// every legacy scriptSig and segwit witness signature push uses.
pub fn der_encode_signature(r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
    let mut body = Vec::new();
    der_encode_integer(&mut body, r);
    der_encode_integer(&mut body, s);
    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(0x30);
    out.push(body.len() as u8);
    out.extend_from_slice(&body);
    out
}

/// Signs a 32-byte digest with a deterministic (RFC 6979) secp256k1 ECDSA
/// signature, always normalized to low-s as BIP62/BIP146 require.
pub fn ecdsa_sign_digest(privkey: &[u8; 32], digest: &[u8; 32]) -> Result<RecoverableSignature, Error> {
    let signing_key = SigningKey::from_bytes(privkey.into()).map_err(|_| Error::ProcessError)?;
    let (sig, recid): (Secp256k1Signature, RecoveryId) = signing_key
        .sign_prehash_recoverable(digest)
        .map_err(|_| Error::ProcessError)?;
    let sig = sig.normalize_s().unwrap_or(sig);
    to_recoverable(sig, recid)
}

/// Signs a digest, retrying with a different nonce (via RFC 6979 nonce
/// augmentation) until `is_canonic` accepts the recovery id, or
/// [`MAX_ECDSA_RETRIES`] attempts have been made.
///
/// Ethereum rejects recovery ids with bit 1 set; other callers may pass
/// `|_| true` to accept the first signature produced.
pub fn ecdsa_sign_digest_canonical(
    privkey: &[u8; 32],
    digest: &[u8; 32],
    is_canonic: impl Fn(u8) -> bool,
) -> Result<RecoverableSignature, Error> {
    let signing_key = SigningKey::from_bytes(privkey.into()).map_err(|_| Error::ProcessError)?;

    for attempt in 0..MAX_ECDSA_RETRIES {
        let ad = attempt.to_be_bytes();
        let (sig, recid): (Secp256k1Signature, RecoveryId) = if attempt == 0 {
            signing_key
                .sign_prehash_recoverable(digest)
                .map_err(|_| Error::ProcessError)?
        } else {
            // RFC 6979 extra entropy: vary the nonce deterministically per retry.
            signing_key
                .sign_prehash_recoverable(&Sha256::hash(&[&ad[..], digest].concat()))
                .map_err(|_| Error::ProcessError)?
        };
        let sig = sig.normalize_s().unwrap_or(sig);
        if is_canonic(recid.to_byte()) {
            return to_recoverable(sig, recid);
        }
    }
    Err(Error::ProcessError)
}

fn to_recoverable(sig: Secp256k1Signature, recid: RecoveryId) -> Result<RecoverableSignature, Error> {
    let bytes = sig.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..]);
    Ok(RecoverableSignature {
        r,
        s,
        recovery_id: recid.to_byte(),
    })
}

/// Verifies a secp256k1 ECDSA signature over a 32-byte digest. Constant-time
/// as provided by `k256`'s field arithmetic.
pub fn ecdsa_verify_digest(pubkey_uncompressed: &[u8; 65], digest: &[u8; 32], sig: &RecoverableSignature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(pubkey_uncompressed) else {
        return false;
    };
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(&sig.r);
    bytes[32..].copy_from_slice(&sig.s);
    let Ok(signature) = Secp256k1Signature::from_slice(&bytes) else {
        return false;
    };
    verifying_key.verify_prehash(digest, &signature).is_ok()
}

/// Recovers the public key from a signature and digest, as used by
/// message-verify and `ecrecover`-style flows.
pub fn ecdsa_recover_from_sig(sig: &RecoverableSignature, digest: &[u8; 32]) -> Result<[u8; 65], Error> {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(&sig.r);
    bytes[32..].copy_from_slice(&sig.s);
    let signature = Secp256k1Signature::from_slice(&bytes).map_err(|_| Error::InvalidSignature)?;
    let recid = RecoveryId::from_byte(sig.recovery_id & 0x01).ok_or(Error::InvalidSignature)?;
    let verifying_key = VerifyingKey::recover_from_prehash(digest, &signature, recid)
        .map_err(|_| Error::InvalidSignature)?;
    let point = verifying_key.to_encoded_point(false);
    let mut out = [0u8; 65];
    out.copy_from_slice(point.as_bytes());
    Ok(out)
}

/// Signs a message with BIP-340 Schnorr, using the given 32-byte x-only
/// secret key scalar (already tweaked for taproot script-path/key-path as
/// the caller requires).
pub fn schnorr_sign(privkey: &[u8; 32], msg: &[u8]) -> Result<[u8; 64], Error> {
    let signing_key = SchnorrSigningKey::from_bytes(privkey).map_err(|_| Error::ProcessError)?;
    let sig: SchnorrSignature = signing_key.sign(msg);
    Ok(sig.to_bytes())
}

/// Verifies a BIP-340 Schnorr signature against an x-only public key.
pub fn schnorr_verify(pubkey_x_only: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    let Ok(verifying_key) = SchnorrVerifyingKey::from_bytes(pubkey_x_only) else {
        return false;
    };
    let Ok(signature) = SchnorrSignature::try_from(sig.as_slice()) else {
        return false;
    };
    verifying_key.verify(msg, &signature).is_ok()
}

/// Signs a message with Ed25519. The only curve where ownership of the
/// expanded private key does not imply knowledge of the original seed, so
/// callers must derive from the canonical 32-byte seed.
pub fn ed25519_sign(seed: &[u8; 32], msg: &[u8]) -> [u8; 64] {
    use ed25519_dalek::Signer;
    let signing_key = ed25519_dalek::SigningKey::from_bytes(seed);
    signing_key.sign(msg).to_bytes()
}

/// Verifies a detached Ed25519 signature.
pub fn ed25519_sign_open(pubkey: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
    use ed25519_dalek::Verifier;
    let Ok(verifying_key) = ed25519_dalek::VerifyingKey::from_bytes(pubkey) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(sig);
    verifying_key.verify(msg, &signature).is_ok()
}

/// Derives the secp256k1 public key (uncompressed, 65 bytes) for a private
/// key scalar.
pub fn secp256k1_public_key(privkey: &[u8; 32]) -> Result<[u8; 65], Error> {
    let signing_key = SigningKey::from_bytes(privkey.into()).map_err(|_| Error::ProcessError)?;
    let point = signing_key.verifying_key().to_encoded_point(false);
    let mut out = [0u8; 65];
    out.copy_from_slice(point.as_bytes());
    Ok(out)
}

/// Compresses an uncompressed (65-byte) secp256k1 public key to 33 bytes.
pub fn compress_pubkey(uncompressed: &[u8; 65]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = 0x02 | (uncompressed[64] & 0x01);
    out[1..].copy_from_slice(&uncompressed[1..33]);
    out
}

pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256Digest>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

pub fn hmac_sha512(key: &[u8], msg: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512Digest>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

const SECP256K1_ORDER: [u8; 32] =
    hex_literal::hex!("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141");

/// Adds two scalars mod the secp256k1 group order.
pub fn add_scalar_mod_n(a: &[u8; 32], b: &[u8; 32]) -> Result<[u8; 32], Error> {
    use num_bigint::BigUint;
    use num_traits::Zero;
    let n = BigUint::from_bytes_be(&SECP256K1_ORDER);
    let sum = (BigUint::from_bytes_be(a) + BigUint::from_bytes_be(b)) % &n;
    if sum.is_zero() {
        return Err(Error::ProcessError);
    }
    let mut out = [0u8; 32];
    let bytes = sum.to_bytes_be();
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Negates a scalar mod the secp256k1 group order.
pub fn negate_scalar_mod_n(a: &[u8; 32]) -> Result<[u8; 32], Error> {
    use num_bigint::BigUint;
    use num_traits::Zero;
    let n = BigUint::from_bytes_be(&SECP256K1_ORDER);
    let av = BigUint::from_bytes_be(a) % &n;
    if av.is_zero() {
        return Err(Error::ProcessError);
    }
    let neg = &n - av;
    let mut out = [0u8; 32];
    let bytes = neg.to_bytes_be();
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// BIP340 tagged hash: `SHA256(SHA256(tag) || SHA256(tag) || msg)`.
pub fn tagged_hash(tag: &[u8], msg: &[u8]) -> [u8; 32] {
    let tag_hash = Sha256::hash(tag);
    let mut data = Vec::with_capacity(64 + msg.len());
    data.extend_from_slice(&tag_hash);
    data.extend_from_slice(&tag_hash);
    data.extend_from_slice(msg);
    Sha256::hash(&data)
}

/// BIP341 key-path tweak: negates the secret key if its public key has odd
/// y, adds `tagged_hash("TapTweak", internal_xonly)`, then negates again if
/// the resulting tweaked public key has odd y (so the x-only output key
/// always has an even-y private key to sign with). Returns
/// `(tweaked_privkey, output_xonly_pubkey)`.
pub fn taproot_tweak_seckey(privkey: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), Error> {
    let internal_pubkey = secp256k1_public_key(privkey)?;
    let internal_compressed = compress_pubkey(&internal_pubkey);
    let mut internal_xonly = [0u8; 32];
    internal_xonly.copy_from_slice(&internal_compressed[1..]);

    let seckey = if internal_compressed[0] == 0x03 {
        negate_scalar_mod_n(privkey)?
    } else {
        *privkey
    };

    let tweak = tagged_hash(b"TapTweak", &internal_xonly);
    let tweaked_privkey = add_scalar_mod_n(&seckey, &tweak)?;

    let tweaked_pubkey = secp256k1_public_key(&tweaked_privkey)?;
    let tweaked_compressed = compress_pubkey(&tweaked_pubkey);
    let mut output_xonly = [0u8; 32];
    output_xonly.copy_from_slice(&tweaked_compressed[1..]);

    let final_privkey = if tweaked_compressed[0] == 0x03 {
        negate_scalar_mod_n(&tweaked_privkey)?
    } else {
        tweaked_privkey
    };
    Ok((final_privkey, output_xonly))
}

/// Bitcoin's variable-length integer ("compact size") encoding.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        out.push(value as u8);
    } else if value <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecdsa_sign_verify_round_trip() {
        let privkey = [0x42u8; 32];
        let digest = Sha256::hash(b"test message");
        let sig = ecdsa_sign_digest(&privkey, &digest).unwrap();
        let pubkey = secp256k1_public_key(&privkey).unwrap();
        assert!(ecdsa_verify_digest(&pubkey, &digest, &sig));
    }

    #[test]
    fn ecdsa_signature_is_low_s() {
        // secp256k1 order n; a low-s signature has s <= n/2.
        const HALF_N: [u8; 32] =
            hex_literal::hex!("7fffffffffffffffffffffffffffffff5d576e7357a4501ddfe92f46681b20a");
        let privkey = [0x11u8; 32];
        let digest = Sha256::hash(b"low s check");
        let sig = ecdsa_sign_digest(&privkey, &digest).unwrap();
        assert!(sig.s.as_slice() <= HALF_N.as_slice());
    }

    #[test]
    fn ecdsa_recover_returns_signing_pubkey() {
        let privkey = [0x77u8; 32];
        let digest = Sha256::hash(b"recover me");
        let sig = ecdsa_sign_digest(&privkey, &digest).unwrap();
        let pubkey = secp256k1_public_key(&privkey).unwrap();
        let recovered = ecdsa_recover_from_sig(&sig, &digest).unwrap();
        assert_eq!(recovered, pubkey);
    }

    #[test]
    fn varint_encodes_per_bitcoin_compact_size() {
        let mut out = Vec::new();
        write_varint(&mut out, 0xfc);
        assert_eq!(out, alloc::vec![0xfc]);

        let mut out = Vec::new();
        write_varint(&mut out, 0x10000);
        assert_eq!(out[0], 0xfe);
    }

    #[test]
    fn der_signature_is_well_formed_sequence_of_two_integers() {
        let privkey = [0x33u8; 32];
        let digest = Sha256::hash(b"der check");
        let sig = ecdsa_sign_digest(&privkey, &digest).unwrap();
        let der = sig.to_der();
        assert_eq!(der[0], 0x30);
        assert_eq!(der[1] as usize, der.len() - 2);
        assert_eq!(der[2], 0x02);
        let r_len = der[3] as usize;
        assert_eq!(der[4 + r_len], 0x02);
    }

    #[test]
    fn der_integer_gets_a_leading_zero_when_high_bit_is_set() {
        let r = [0xFFu8; 32];
        let s = [0x01u8; 32];
        let der = der_encode_signature(&r, &s);
        // r's DER INTEGER: tag(1) + len(1) + 0x00 prefix + 32 bytes = 35.
        assert_eq!(der[3], 33);
        assert_eq!(der[4], 0x00);
    }

    #[test]
    fn scalar_add_and_negate_are_inverses() {
        let a = Sha256::hash(b"scalar a");
        let b = Sha256::hash(b"scalar b");
        let sum = add_scalar_mod_n(&a, &b).unwrap();
        let back = add_scalar_mod_n(&sum, &negate_scalar_mod_n(&b).unwrap()).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn tagged_hash_is_domain_separated() {
        let a = tagged_hash(b"TapTweak", b"same message");
        let b = tagged_hash(b"TapLeaf", b"same message");
        assert_ne!(a, b);
    }

    #[test]
    fn taproot_tweak_output_key_has_even_y() {
        let privkey = Sha256::hash(b"taproot test key");
        let (tweaked_privkey, output_xonly) = taproot_tweak_seckey(&privkey).unwrap();
        let pubkey = secp256k1_public_key(&tweaked_privkey).unwrap();
        let compressed = compress_pubkey(&pubkey);
        assert_eq!(compressed[0], 0x02);
        assert_eq!(&compressed[1..], &output_xonly[..]);
    }

    #[test]
    fn taproot_tweak_is_deterministic() {
        let privkey = Sha256::hash(b"deterministic check");
        let (priv_a, xonly_a) = taproot_tweak_seckey(&privkey).unwrap();
        let (priv_b, xonly_b) = taproot_tweak_seckey(&privkey).unwrap();
        assert_eq!(priv_a, priv_b);
        assert_eq!(xonly_a, xonly_b);
    }

    #[test]
    fn ed25519_sign_verify_round_trip() {
        let seed = [0x99u8; 32];
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&seed);
        let pubkey = signing_key.verifying_key().to_bytes();
        let sig = ed25519_sign(&seed, b"hello");
        assert!(ed25519_sign_open(&pubkey, b"hello", &sig));
    }
}
