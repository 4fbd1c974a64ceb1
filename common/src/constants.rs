//! Protocol-level numeric constants shared by the core and its tests.

/// Last-but-one BIP32 component allowed for a silently-accepted change output.
pub const BIP32_CHANGE_CHAIN: u32 = 1;

/// Largest last BIP32 component allowed for a silently-accepted change output.
pub const BIP32_MAX_LAST_ELEMENT: u32 = 1_000_000;

/// `SIGHASH_ALL`, used as the base sighash type on every coin.
pub const SIGHASH_ALL: u32 = 0x01;

/// `SIGHASH_FORKID`, OR'd into the sighash type on forkid coins (e.g. Bitcoin Cash).
pub const SIGHASH_FORKID: u32 = 0x40;

/// Upper bound on deterministic-nonce retries while hunting for a canonical
/// (low-s, even-parity-compatible) ECDSA signature.
pub const MAX_ECDSA_RETRIES: u32 = 16;

/// Maximum number of `data` bytes requested from the host in a single
/// Ethereum `TxRequest` chunk.
pub const ETH_DATA_CHUNK_SIZE: u32 = 1024;

/// ERC-20 `transfer(address,uint256)` selector.
pub const ERC20_TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
