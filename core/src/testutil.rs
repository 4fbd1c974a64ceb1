//! In-memory collaborators used only by tests (gated behind `cfg(test)` or
//! the `testutil` feature for integration tests in other crates).

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::session::{KvKey, KvStore};

/// A `BTreeMap`-backed stand-in for the persistent, PIN-encrypted KV store.
#[derive(Default)]
pub struct InMemoryKv {
    entries: BTreeMap<u8, Vec<u8>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(key: KvKey) -> u8 {
        match key {
            KvKey::Mnemonic => 0,
            KvKey::PinHash => 1,
            KvKey::WipeCodeHash => 2,
            KvKey::PinFailCounter => 3,
            KvKey::PassphraseProtection => 4,
            KvKey::SafetyChecks => 5,
            KvKey::AutolockDelayMs => 6,
            KvKey::CoinjoinAuthorization => 7,
        }
    }
}

impl KvStore for InMemoryKv {
    fn get(&self, key: KvKey) -> Option<Vec<u8>> {
        self.entries.get(&Self::slot(key)).cloned()
    }

    fn put(&mut self, key: KvKey, value: &[u8]) {
        self.entries.insert(Self::slot(key), value.to_vec());
    }

    fn delete(&mut self, key: KvKey) {
        self.entries.remove(&Self::slot(key));
    }

    fn wipe(&mut self) {
        self.entries.clear();
    }
}

/// A scripted stand-in for the PIN/button UI collaborator: records every
/// prompt shown and plays back a fixed sequence of answers.
pub struct TestUi {
    button_answers: Vec<bool>,
    pin_answers: Vec<String>,
    pub confirm_log: Vec<String>,
    pub progress_log: Vec<(String, u32)>,
}

impl TestUi {
    pub fn new() -> Self {
        Self {
            button_answers: Vec::new(),
            pin_answers: Vec::new(),
            confirm_log: Vec::new(),
            progress_log: Vec::new(),
        }
    }

    pub fn with_button_answers(mut self, answers: &[bool]) -> Self {
        self.button_answers = answers.iter().rev().copied().collect();
        self
    }

    pub fn with_pin_answers(mut self, answers: &[&str]) -> Self {
        self.pin_answers = answers.iter().rev().map(|s| String::from(*s)).collect();
        self
    }

    pub fn ask_confirm(&mut self, kind: &str, text: &str) -> bool {
        self.confirm_log
            .push(alloc::format!("{kind}: {text}"));
        self.button_answers.pop().unwrap_or(false)
    }

    pub fn prompt_pin(&mut self) -> Option<String> {
        self.pin_answers.pop()
    }

    pub fn notify_progress(&mut self, title: &str, permil: u32) {
        self.progress_log.push((String::from(title), permil));
    }
}

impl Default for TestUi {
    fn default() -> Self {
        Self::new()
    }
}
