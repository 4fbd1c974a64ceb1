//! Secure session (C3).
//!
//! PIN gating, wipe-code, auto-lock and the SLIP-25 coinjoin unlock path.
//! The KV store and PIN/button collaborators are traits so host-side tests
//! can swap in the in-memory [`crate::testutil`] implementations; firmware
//! wires real persistent-storage and UI drivers behind the same contracts.

use alloc::vec::Vec;

use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use signer_common::error::Error;

use crate::hash::{hash160, Hasher, Sha256};
use crate::keys::{root_node_from_seed, Curve, HdNode, PathCache};

/// Closed enumeration of persisted keys, mirroring the KV store collaborator
/// contract. Any other key name is a programming error, not a data error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvKey {
    Mnemonic,
    PinHash,
    WipeCodeHash,
    PinFailCounter,
    PassphraseProtection,
    SafetyChecks,
    AutolockDelayMs,
    CoinjoinAuthorization,
}

pub trait KvStore {
    fn get(&self, key: KvKey) -> Option<Vec<u8>>;
    fn put(&mut self, key: KvKey, value: &[u8]);
    fn delete(&mut self, key: KvKey);
    fn wipe(&mut self);
}

/// Whether unusual derivation paths are outright refused or only prompted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyCheckLevel {
    Strict,
    PromptTemporarily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Locked,
    Unlocked,
    Wiped,
}

/// Exponential back-off delay (milliseconds) after `failures` consecutive
/// bad PIN attempts. Mirrors the classic hardware-wallet schedule: the
/// first few misses are cheap, then it grows sharply.
pub fn backoff_delay_ms(failures: u32) -> u32 {
    1_000u32.saturating_mul(1u32 << failures.min(20))
}

/// Number of consecutive wrong PIN attempts before the device wipes itself.
pub const WIPE_ATTEMPT_THRESHOLD: u32 = 16;

/// The BIP32 purpose index reserved for SLIP-25 coinjoin-compatible paths.
pub const SLIP25_PURPOSE: u32 = 0x8000_0000 | 10025;

const HARDENED: u32 = 0x8000_0000;

/// Auto-lock delay used when `AutolockDelayMs` has never been set.
pub const DEFAULT_AUTOLOCK_DELAY_MS: u64 = 10 * 60 * 1000;

/// Whether `path` looks like a standard BIP44/49/84/86 path for
/// `expected_slip44` (`m / purpose' / coin_type' / ...`).
pub fn is_standard_path(path: &[u32], expected_slip44: u32) -> bool {
    if path.len() < 2 {
        return false;
    }
    let hardened_purpose = path[0] & HARDENED != 0;
    let purpose = path[0] & !HARDENED;
    let standard_purpose = matches!(purpose, 44 | 49 | 84 | 86);
    let coin_type_ok = path[1] == (expected_slip44 | HARDENED);
    hardened_purpose && standard_purpose && coin_type_ok
}

pub struct Session<K: KvStore> {
    kv: K,
    state: SessionState,
    session_id: Option<[u8; 32]>,
    passphrase: Zeroizing<alloc::string::String>,
    seed: Option<Zeroizing<Vec<u8>>>,
    path_cache: PathCache,
    safety_check_level: SafetyCheckLevel,
    /// Set by an explicit `UnlockPath` MAC check or an active coinjoin
    /// authorization; gates access to [`SLIP25_PURPOSE`].
    unlock_path_authorized: bool,
    /// Wall-clock deadline (milliseconds, caller-supplied clock) past which
    /// the next `check_auto_lock` call re-locks the session. `None` until
    /// the first `touch_activity` call.
    auto_lock_deadline_ms: Option<u64>,
}

impl<K: KvStore> Session<K> {
    pub fn new(kv: K) -> Self {
        Self {
            kv,
            state: SessionState::Locked,
            session_id: None,
            passphrase: Zeroizing::new(alloc::string::String::new()),
            seed: None,
            path_cache: PathCache::new(),
            safety_check_level: SafetyCheckLevel::Strict,
            unlock_path_authorized: false,
            auto_lock_deadline_ms: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> Option<[u8; 32]> {
        self.session_id
    }

    pub fn safety_check_level(&self) -> SafetyCheckLevel {
        self.safety_check_level
    }

    pub fn is_initialized(&self) -> bool {
        self.kv.get(KvKey::Mnemonic).is_some()
    }

    /// Attempts to unlock the session with `pin`. Per §4.3, the failure
    /// counter is persisted *before* the comparison, so a power glitch
    /// mid-verification cannot be used to bypass back-off.
    pub fn unlock(&mut self, pin: &str) -> Result<(), Error> {
        if self.state == SessionState::Wiped {
            return Err(Error::NotInitialized);
        }
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let failures = self.pin_fail_counter();
        self.set_pin_fail_counter(failures + 1);

        if let Some(wipe_hash) = self.kv.get(KvKey::WipeCodeHash) {
            if bool::from(pin_hash(pin)[..].ct_eq(wipe_hash.as_slice())) {
                self.kv.wipe();
                self.state = SessionState::Wiped;
                return Err(Error::NotInitialized);
            }
        }

        if failures + 1 >= WIPE_ATTEMPT_THRESHOLD {
            self.kv.wipe();
            self.state = SessionState::Wiped;
            return Err(Error::NotInitialized);
        }

        let Some(stored_hash) = self.kv.get(KvKey::PinHash) else {
            return Err(Error::NotInitialized);
        };
        if !bool::from(pin_hash(pin)[..].ct_eq(stored_hash.as_slice())) {
            return Err(Error::PinInvalid);
        }

        self.set_pin_fail_counter(0);
        self.state = SessionState::Unlocked;
        self.session_id = Some(self.derive_session_id(pin));
        self.path_cache.clear();
        Ok(())
    }

    pub fn lock(&mut self) {
        self.state = SessionState::Locked;
        self.seed = None;
        self.path_cache.clear();
        self.unlock_path_authorized = false;
        self.auto_lock_deadline_ms = None;
    }

    /// Consults `safety_check_level` for a path that isn't standard BIP44
    /// (e.g. non-SLIP-44 purpose/coin type). `Ok(true)` means the caller
    /// must still show a confirm dialog before proceeding; `Ok(false)`
    /// means the path needs no extra scrutiny; `Err` means strict mode
    /// refuses outright.
    pub fn check_path_safety(&self, path: &[u32], expected_slip44: u32) -> Result<bool, Error> {
        if is_standard_path(path, expected_slip44) {
            return Ok(false);
        }
        match self.safety_check_level {
            SafetyCheckLevel::Strict => Err(Error::DataError),
            SafetyCheckLevel::PromptTemporarily => Ok(true),
        }
    }

    /// Pushes the auto-lock deadline forward from `now_ms`, using the
    /// `AutolockDelayMs` KV key (big-endian `u32` milliseconds) or
    /// [`DEFAULT_AUTOLOCK_DELAY_MS`] when unset.
    pub fn touch_activity(&mut self, now_ms: u64) {
        let delay = self
            .kv
            .get(KvKey::AutolockDelayMs)
            .and_then(|v| v.get(0..4).map(|b| u32::from_be_bytes(b.try_into().unwrap())))
            .map(u64::from)
            .unwrap_or(DEFAULT_AUTOLOCK_DELAY_MS);
        self.auto_lock_deadline_ms = Some(now_ms.saturating_add(delay));
    }

    /// Checked before every handler dispatch (see `Dispatcher::tick`). If
    /// `now_ms` has passed the deadline, locks the session and returns
    /// `true` so the caller can abort any in-flight signer.
    pub fn check_auto_lock(&mut self, now_ms: u64) -> bool {
        if self.state == SessionState::Unlocked {
            if let Some(deadline) = self.auto_lock_deadline_ms {
                if now_ms >= deadline {
                    self.lock();
                    return true;
                }
            }
        }
        false
    }

    /// Verifies `new_pin == new_pin_confirm` (and `wipe_code ==
    /// wipe_code_confirm` when a wipe code is being set), then persists
    /// both hashes. The enrolment UI collects both values before calling
    /// this, so there is no separate suspended round trip here.
    pub fn change_pin(
        &mut self,
        new_pin: &str,
        new_pin_confirm: &str,
        wipe_code: Option<&str>,
        wipe_code_confirm: Option<&str>,
    ) -> Result<(), Error> {
        if self.state != SessionState::Unlocked {
            return Err(Error::PinExpected);
        }
        if new_pin != new_pin_confirm {
            return Err(Error::PinMismatch);
        }
        match (wipe_code, wipe_code_confirm) {
            (Some(code), Some(confirm)) => {
                if code != confirm {
                    return Err(Error::WipeCodeMismatch);
                }
                self.kv.put(KvKey::WipeCodeHash, &pin_hash(code));
            }
            (None, None) => {}
            _ => return Err(Error::WipeCodeMismatch),
        }
        self.kv.put(KvKey::PinHash, &pin_hash(new_pin));
        Ok(())
    }

    pub fn set_passphrase(&mut self, passphrase: &str) {
        self.passphrase = Zeroizing::new(alloc::string::String::from(passphrase));
        self.seed = None;
    }

    pub fn authorize_unlock_path(&mut self) {
        self.unlock_path_authorized = true;
    }

    fn pin_fail_counter(&self) -> u32 {
        self.kv
            .get(KvKey::PinFailCounter)
            .and_then(|v| v.get(0..4).map(|b| u32::from_be_bytes(b.try_into().unwrap())))
            .unwrap_or(0)
    }

    fn set_pin_fail_counter(&mut self, value: u32) {
        self.kv.put(KvKey::PinFailCounter, &value.to_be_bytes());
    }

    fn derive_session_id(&self, pin: &str) -> [u8; 32] {
        Sha256::hash(alloc::format!("session:{pin}").as_bytes())
    }

    /// Derives the root node for `curve` from the stored mnemonic and the
    /// cached passphrase. The seed itself never leaves this function's
    /// stack; callers only ever see derived nodes.
    fn root_node(&mut self, curve: Curve) -> Result<HdNode, Error> {
        if self.state != SessionState::Unlocked {
            return Err(Error::PinExpected);
        }
        let mnemonic = self.kv.get(KvKey::Mnemonic).ok_or(Error::NotInitialized)?;
        if self.seed.is_none() {
            let seed = bip39_seed(&mnemonic, &self.passphrase);
            self.seed = Some(Zeroizing::new(seed));
        }
        let seed = self.seed.as_ref().expect("seed was just populated above");
        Ok(root_node_from_seed(curve, seed))
    }

    /// Derives `path` under `curve`, refusing access to the SLIP-25 purpose
    /// unless the unlock path has been separately authorized.
    pub fn derive(&mut self, curve: Curve, path: &[u32]) -> Result<HdNode, Error> {
        if let Some(&first) = path.first() {
            if first == SLIP25_PURPOSE && !self.unlock_path_authorized {
                return Err(Error::PinExpected);
            }
        }
        let root = self.root_node(curve)?;
        self.path_cache.derive(&root, path)
    }

    /// SLIP-21 key derivation (ownership identifiers, coinjoin unlock MAC),
    /// independent of the BIP32 path cache.
    pub fn derive_slip21(&mut self, labels: &[&[u8]]) -> Result<[u8; 32], Error> {
        if self.state != SessionState::Unlocked {
            return Err(Error::PinExpected);
        }
        let mnemonic = self.kv.get(KvKey::Mnemonic).ok_or(Error::NotInitialized)?;
        let seed = bip39_seed(&mnemonic, &self.passphrase);
        Ok(crate::keys::derive_slip21_key(&seed, labels))
    }
}

fn pin_hash(pin: &str) -> [u8; 32] {
    Sha256::hash(pin.as_bytes())
}

/// Placeholder seed derivation: in the real device this is PBKDF2-HMAC-SHA512
/// over the mnemonic words and `"mnemonic" || passphrase`, per BIP39. The
/// core only needs *some* deterministic combination of the two; the exact
/// KDF is the onboarding flow's concern, out of scope here.
fn bip39_seed(mnemonic: &[u8], passphrase: &str) -> Vec<u8> {
    let mut salt = Vec::with_capacity(9 + passphrase.len());
    salt.extend_from_slice(b"mnemonic");
    salt.extend_from_slice(passphrase.as_bytes());
    crate::crypto::hmac_sha512(&salt, mnemonic).to_vec()
}

/// Hashes a public key the way address derivation does, re-exported here
/// since session-level confirmation flows (e.g. xpub display) need it too.
pub fn pubkey_hash160(pubkey_compressed: &[u8; 33]) -> [u8; 20] {
    hash160(pubkey_compressed)
}
