//! Compiled-in coin descriptors.
//!
//! A [`CoinDescriptor`] is the static, read-only configuration carried with
//! every UTXO signing request: address version bytes, optional bech32/cashaddr
//! prefixes, and the capability flags that select the strategy variants in
//! the signing engine (segwit, taproot, forkid, Decred, overwintered,
//! negative fee).

use crate::error::Error;

/// Capability flags carried on a [`CoinDescriptor`]. Plain `const`-composable
/// bitflags: the table is small enough that pulling in the `bitflags` crate
/// would be more machinery than the four or five flags it guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u16);

impl Capabilities {
    pub const NONE: Capabilities = Capabilities(0);
    pub const SEGWIT: Capabilities = Capabilities(1 << 0);
    pub const TAPROOT: Capabilities = Capabilities(1 << 1);
    pub const FORKID: Capabilities = Capabilities(1 << 2);
    pub const DECRED: Capabilities = Capabilities(1 << 3);
    pub const OVERWINTERED: Capabilities = Capabilities(1 << 4);
    pub const NEGATIVE_FEE: Capabilities = Capabilities(1 << 5);

    pub const fn union(self, other: Self) -> Self {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl core::ops::BitOr for Capabilities {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Which hasher a coin uses for the BIP143-style streaming accumulators and
/// the legacy double-hash. Zcash-family coins use personalised BLAKE2b
/// instead of double SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxHasher {
    Sha256d,
    Blake2bPersonalized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinDescriptor {
    pub name: &'static str,
    pub slip44: u32,
    pub address_version: u8,
    pub address_version_p2sh: u8,
    pub bech32_hrp: Option<&'static str>,
    pub cashaddr_prefix: Option<&'static str>,
    pub capabilities: Capabilities,
    pub tx_hasher: TxHasher,
    pub maxfee_kb: u64,
    /// Fork id used to build `hash_type` on forkid coins; ignored otherwise.
    pub fork_id: u32,
}

impl CoinDescriptor {
    pub const fn has(&self, cap: Capabilities) -> bool {
        self.capabilities.contains(cap)
    }
}

pub const BITCOIN: CoinDescriptor = CoinDescriptor {
    name: "Bitcoin",
    slip44: 0,
    address_version: 0x00,
    address_version_p2sh: 0x05,
    bech32_hrp: Some("bc"),
    cashaddr_prefix: None,
    capabilities: Capabilities::SEGWIT.union(Capabilities::TAPROOT),
    tx_hasher: TxHasher::Sha256d,
    maxfee_kb: 100_000,
    fork_id: 0,
};

pub const BITCOIN_TESTNET: CoinDescriptor = CoinDescriptor {
    name: "Testnet",
    slip44: 1,
    address_version: 0x6f,
    address_version_p2sh: 0xc4,
    bech32_hrp: Some("tb"),
    cashaddr_prefix: None,
    capabilities: Capabilities::SEGWIT.union(Capabilities::TAPROOT),
    tx_hasher: TxHasher::Sha256d,
    maxfee_kb: 100_000,
    fork_id: 0,
};

pub const LITECOIN: CoinDescriptor = CoinDescriptor {
    name: "Litecoin",
    slip44: 2,
    address_version: 0x30,
    address_version_p2sh: 0x32,
    bech32_hrp: Some("ltc"),
    cashaddr_prefix: None,
    capabilities: Capabilities::SEGWIT,
    tx_hasher: TxHasher::Sha256d,
    maxfee_kb: 100_000,
    fork_id: 0,
};

pub const BITCOIN_CASH: CoinDescriptor = CoinDescriptor {
    name: "Bcash",
    slip44: 145,
    address_version: 0x00,
    address_version_p2sh: 0x05,
    bech32_hrp: None,
    cashaddr_prefix: Some("bitcoincash"),
    capabilities: Capabilities::FORKID,
    tx_hasher: TxHasher::Sha256d,
    maxfee_kb: 100_000,
    fork_id: 0x00,
};

pub const ZCASH: CoinDescriptor = CoinDescriptor {
    name: "Zcash",
    slip44: 133,
    address_version: 0x1c,
    address_version_p2sh: 0xbd,
    bech32_hrp: None,
    cashaddr_prefix: None,
    capabilities: Capabilities::OVERWINTERED,
    tx_hasher: TxHasher::Blake2bPersonalized,
    maxfee_kb: 100_000,
    fork_id: 0,
};

pub const DECRED: CoinDescriptor = CoinDescriptor {
    name: "Decred",
    slip44: 42,
    address_version: 0x07,
    address_version_p2sh: 0x1a,
    bech32_hrp: None,
    cashaddr_prefix: None,
    capabilities: Capabilities::DECRED,
    tx_hasher: TxHasher::Sha256d,
    maxfee_kb: 100_000,
    fork_id: 0,
};

const COINS: &[&CoinDescriptor] = &[
    &BITCOIN,
    &BITCOIN_TESTNET,
    &LITECOIN,
    &BITCOIN_CASH,
    &ZCASH,
    &DECRED,
];

/// Looks up a compiled-in coin by its wire name (as sent by the host).
pub fn by_name(name: &str) -> Result<&'static CoinDescriptor, Error> {
    COINS
        .iter()
        .copied()
        .find(|c| c.name == name)
        .ok_or(Error::DataError)
}

/// Looks up a compiled-in coin by its SLIP-44 coin number.
pub fn by_slip44(slip44: u32) -> Result<&'static CoinDescriptor, Error> {
    COINS
        .iter()
        .copied()
        .find(|c| c.slip44 == slip44)
        .ok_or(Error::DataError)
}
