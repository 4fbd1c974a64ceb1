//! Compiled-in ERC-20 token table used to re-render known-token transfers.

use alloc::string::String;
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub chain_id: u64,
    pub address: [u8; 20],
    pub symbol: String,
    pub decimals: u8,
}

struct StaticToken {
    chain_id: u64,
    address: [u8; 20],
    symbol: &'static str,
    decimals: u8,
}

const USDC_MAINNET: StaticToken = StaticToken {
    chain_id: 1,
    address: [
        0xA0, 0xb8, 0x69, 0x91, 0xc6, 0x21, 0x8b, 0x36, 0xc1, 0xd1, 0x9D, 0x4a, 0x2e, 0x9E, 0xb0,
        0xcE, 0x36, 0x06, 0xeB, 0x48,
    ],
    symbol: "USDC",
    decimals: 6,
};

const USDT_MAINNET: StaticToken = StaticToken {
    chain_id: 1,
    address: [
        0xda, 0xc1, 0x7f, 0x95, 0x8d, 0x2e, 0xe5, 0x23, 0xa2, 0x20, 0x62, 0x06, 0x99, 0x45, 0x97,
        0xc1, 0x3d, 0x83, 0x1e, 0xc7,
    ],
    symbol: "USDT",
    decimals: 6,
};

const WETH_MAINNET: StaticToken = StaticToken {
    chain_id: 1,
    address: [
        0xC0, 0x2a, 0xaA, 0x39, 0xb2, 0x23, 0xFE, 0x8D, 0x0A, 0x0e, 0x5C, 0x4F, 0x27, 0xeA, 0xD9,
        0x08, 0x3C, 0x75, 0x6C, 0xc2,
    ],
    symbol: "WETH",
    decimals: 18,
};

const TOKENS: &[StaticToken] = &[USDC_MAINNET, USDT_MAINNET, WETH_MAINNET];

/// Looks up a compiled-in token by `(chain_id, contract_address)`.
pub fn lookup(chain_id: u64, address: &[u8; 20]) -> Option<TokenInfo> {
    TOKENS
        .iter()
        .find(|t| t.chain_id == chain_id && &t.address == address)
        .map(|t| TokenInfo {
            chain_id: t.chain_id,
            address: t.address,
            symbol: String::from(t.symbol),
            decimals: t.decimals,
        })
}

/// Verifies a signed token-table extension candidate against the firmware's
/// baked-in Ed25519 authority key, returning the info to merge into the
/// session overlay on success.
///
/// The compiled-in table above never changes; this only ever grows a
/// session-scoped overlay (see `core::session`).
pub fn verify_extension(
    candidate: &TokenInfo,
    signature: &[u8; 64],
    verify: impl FnOnce(&[u8], &[u8; 64]) -> bool,
) -> Result<TokenInfo, Error> {
    let mut msg = alloc::vec::Vec::with_capacity(8 + 20 + 1 + candidate.symbol.len());
    msg.extend_from_slice(&candidate.chain_id.to_be_bytes());
    msg.extend_from_slice(&candidate.address);
    msg.push(candidate.decimals);
    msg.extend_from_slice(candidate.symbol.as_bytes());

    if verify(&msg, signature) {
        Ok(candidate.clone())
    } else {
        Err(Error::InvalidSignature)
    }
}
