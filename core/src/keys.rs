//! Key hierarchy (C2).
//!
//! BIP32 CKD over secp256k1, a small per-session LRU cache keyed by
//! `(curve, path_prefix)`, and the SLIP-21 derivation used for the SLIP-19
//! ownership identifier and the SLIP-25 coinjoin unlock MAC.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use zeroize::{Zeroize, ZeroizeOnDrop};

use signer_common::error::Error;

use crate::crypto::{hmac_sha512, secp256k1_public_key};

/// Curve a derived node belongs to. Derivation never crosses curves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    Secp256k1,
    Ed25519,
}

/// A BIP32 node: chain code plus private key material, scrubbed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HdNode {
    #[zeroize(skip)]
    pub curve: Curve,
    pub chaincode: [u8; 32],
    pub privkey: [u8; 32],
}

impl HdNode {
    /// secp256k1 hardened/normal CKD, per BIP32. Ed25519 only supports
    /// hardened derivation (SLIP-0010); a normal-derivation request on an
    /// Ed25519 node is a data error, never attempted.
    pub fn derive_child(&self, index: u32) -> Result<HdNode, Error> {
        match self.curve {
            Curve::Secp256k1 => self.derive_child_secp256k1(index),
            Curve::Ed25519 => {
                if index < 0x8000_0000 {
                    return Err(Error::DataError);
                }
                self.derive_child_ed25519(index)
            }
        }
    }

    fn derive_child_secp256k1(&self, index: u32) -> Result<HdNode, Error> {
        let mut data = Vec::with_capacity(37);
        if index >= 0x8000_0000 {
            data.push(0u8);
            data.extend_from_slice(&self.privkey);
        } else {
            let pubkey = secp256k1_public_key(&self.privkey)?;
            data.extend_from_slice(&crate::crypto::compress_pubkey(&pubkey));
        }
        data.extend_from_slice(&index.to_be_bytes());

        let i = hmac_sha512(&self.chaincode, &data);
        let (il, ir) = i.split_at(32);

        let child_priv = add_scalars_mod_n(il, &self.privkey)?;

        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(ir);

        Ok(HdNode {
            curve: Curve::Secp256k1,
            chaincode,
            privkey: child_priv,
        })
    }

    fn derive_child_ed25519(&self, index: u32) -> Result<HdNode, Error> {
        let mut data = Vec::with_capacity(37);
        data.push(0u8);
        data.extend_from_slice(&self.privkey);
        data.extend_from_slice(&index.to_be_bytes());

        let i = hmac_sha512(&self.chaincode, &data);
        let (il, ir) = i.split_at(32);

        let mut privkey = [0u8; 32];
        privkey.copy_from_slice(il);
        let mut chaincode = [0u8; 32];
        chaincode.copy_from_slice(ir);

        Ok(HdNode {
            curve: Curve::Ed25519,
            chaincode,
            privkey,
        })
    }

    pub fn public_key_uncompressed(&self) -> Result<[u8; 65], Error> {
        match self.curve {
            Curve::Secp256k1 => secp256k1_public_key(&self.privkey),
            Curve::Ed25519 => Err(Error::DataError),
        }
    }
}

fn add_scalars_mod_n(il: &[u8], parent: &[u8; 32]) -> Result<[u8; 32], Error> {
    use num_bigint::BigUint;
    use num_traits::Zero;

    const SECP256K1_ORDER: [u8; 32] =
        hex_literal::hex!("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141");

    let n = BigUint::from_bytes_be(&SECP256K1_ORDER);
    let il_num = BigUint::from_bytes_be(il);
    if il_num >= n {
        return Err(Error::ProcessError);
    }
    let parent_num = BigUint::from_bytes_be(parent);
    let child = (il_num + parent_num) % &n;
    if child.is_zero() {
        return Err(Error::ProcessError);
    }

    let mut out = [0u8; 32];
    let bytes = child.to_bytes_be();
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Derives a root node for `curve` from a BIP39 seed (already combined with
/// the optional passphrase by the caller).
pub fn root_node_from_seed(curve: Curve, seed: &[u8]) -> HdNode {
    let key: &[u8] = match curve {
        Curve::Secp256k1 => b"Bitcoin seed",
        Curve::Ed25519 => b"ed25519 seed",
    };
    let i = hmac_sha512(key, seed);
    let (il, ir) = i.split_at(32);
    let mut privkey = [0u8; 32];
    privkey.copy_from_slice(il);
    let mut chaincode = [0u8; 32];
    chaincode.copy_from_slice(ir);
    HdNode {
        curve,
        chaincode,
        privkey,
    }
}

/// Derives the full path from the root, applying each component in order.
pub fn derive_path(root: &HdNode, path: &[u32]) -> Result<HdNode, Error> {
    let mut node = HdNode {
        curve: root.curve,
        chaincode: root.chaincode,
        privkey: root.privkey,
    };
    for &index in path {
        node = node.derive_child(index)?;
    }
    Ok(node)
}

/// SLIP-21 master node, derived from the seed with a fixed domain separator.
pub fn slip21_master(seed: &[u8]) -> [u8; 64] {
    hmac_sha512(b"Symmetric key seed", seed)
}

/// Derives a SLIP-21 key along a sequence of labels, returning the 32-byte
/// key half (the other 32 bytes only matter for further derivation).
pub fn derive_slip21_key(seed: &[u8], labels: &[&[u8]]) -> [u8; 32] {
    let mut node = slip21_master(seed);
    for label in labels {
        let mut data = Vec::with_capacity(1 + label.len());
        data.push(0u8);
        data.extend_from_slice(label);
        let (key_half, _) = node.split_at(32);
        node = hmac_sha512(key_half, &data);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&node[32..]);
    out
}

const PATH_CACHE_CAPACITY: usize = 4;

/// A small LRU of the last N derived nodes along the current signing flow,
/// keyed by `(curve, path_prefix)`. Invalidated wholesale on lock or curve
/// change; amortises repeated chain derivation within one signing session.
pub struct PathCache {
    entries: VecDeque<(Curve, Vec<u32>, HdNode)>,
}

impl PathCache {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(PATH_CACHE_CAPACITY),
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Derives `path` from `root`, reusing the longest cached prefix.
    pub fn derive(&mut self, root: &HdNode, path: &[u32]) -> Result<HdNode, Error> {
        let mut best: Option<(usize, &HdNode)> = None;
        for (curve, cached_path, node) in self.entries.iter() {
            if *curve != root.curve {
                continue;
            }
            let common = common_prefix_len(cached_path, path);
            if common > 0 && common < path.len() && (best.is_none() || common > best.unwrap().0) {
                best = Some((common, node));
            }
        }

        let (start, mut node) = match best {
            Some((common, node)) => (
                common,
                HdNode {
                    curve: node.curve,
                    chaincode: node.chaincode,
                    privkey: node.privkey,
                },
            ),
            None => (0, derive_path(root, &path[..0])?),
        };

        for &index in &path[start..] {
            node = node.derive_child(index)?;
        }

        self.insert(root.curve, path, &node);
        Ok(node)
    }

    fn insert(&mut self, curve: Curve, path: &[u32], node: &HdNode) {
        if self.entries.len() >= PATH_CACHE_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((
            curve,
            path.to_vec(),
            HdNode {
                curve: node.curve,
                chaincode: node.chaincode,
                privkey: node.privkey,
            },
        ));
    }
}

impl Default for PathCache {
    fn default() -> Self {
        Self::new()
    }
}

fn common_prefix_len(a: &[u32], b: &[u32]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_path_matches_reference_vectors() {
        // BIP32 test vector 1, seed 000102030405060708090a0b0c0d0e0f
        let seed = hex_literal::hex!("000102030405060708090a0b0c0d0e0f");
        let root = root_node_from_seed(Curve::Secp256k1, &seed);
        assert_eq!(
            root.privkey,
            hex_literal::hex!("e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35")
        );
    }

    #[test]
    fn path_cache_reuses_common_prefix() {
        let seed = hex_literal::hex!("000102030405060708090a0b0c0d0e0f");
        let root = root_node_from_seed(Curve::Secp256k1, &seed);
        let mut cache = PathCache::new();

        let path_a = [0x8000002cu32, 0x80000000, 0x80000000, 0, 0];
        let path_b = [0x8000002cu32, 0x80000000, 0x80000000, 0, 1];

        let a = cache.derive(&root, &path_a).unwrap();
        let b = cache.derive(&root, &path_b).unwrap();

        let direct_b = derive_path(&root, &path_b).unwrap();
        assert_eq!(b.privkey, direct_b.privkey);
        assert_ne!(a.privkey, b.privkey);
    }

    #[test]
    fn slip21_derivation_is_deterministic() {
        let seed = hex_literal::hex!("000102030405060708090a0b0c0d0e0f");
        let key1 = derive_slip21_key(&seed, &[b"SLIP-0019", b"Ownership identifier"]);
        let key2 = derive_slip21_key(&seed, &[b"SLIP-0019", b"Ownership identifier"]);
        assert_eq!(key1, key2);

        let other = derive_slip21_key(&seed, &[b"SLIP-0019", b"Something else"]);
        assert_ne!(key1, other);
    }

    #[test]
    fn ed25519_rejects_normal_derivation() {
        let seed = hex_literal::hex!("000102030405060708090a0b0c0d0e0f");
        let root = root_node_from_seed(Curve::Ed25519, &seed);
        assert!(root.derive_child(0).is_err());
        assert!(root.derive_child(0x8000_0000).is_ok());
    }
}
