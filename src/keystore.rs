use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use zeroize::Zeroize;

/// Session keys are always 256-bit.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("invalid key encoding: {0}")]
    Encoding(String),
    #[error("session key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

struct StoredKey {
    bytes: [u8; KEY_LEN],
    created_at: Instant,
}

impl StoredKey {
    fn wipe(&mut self) {
        self.bytes.zeroize();
    }
}

impl Drop for StoredKey {
    fn drop(&mut self) {
        self.wipe();
    }
}

/// Volatile per-peer session key material. Keys never leave process memory
/// except through `export_encoded`, and are wiped on every teardown path.
pub struct SessionKeyStore {
    keys: Mutex<HashMap<String, StoredKey>>,
}

impl SessionKeyStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Generate and install a fresh random key for `peer_id`, overwriting any
    /// previous key. Returns a copy of the new key.
    pub fn generate(&self, peer_id: &str) -> [u8; KEY_LEN] {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        self.set(peer_id, bytes);
        bytes
    }

    /// Install externally-supplied key material (received from a peer),
    /// overwriting any previous key.
    pub fn set(&self, peer_id: &str, bytes: [u8; KEY_LEN]) {
        let mut guard = self.keys.lock();
        guard.insert(
            peer_id.to_string(),
            StoredKey {
                bytes,
                created_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, peer_id: &str) -> Option<[u8; KEY_LEN]> {
        self.keys.lock().get(peer_id).map(|stored| stored.bytes)
    }

    pub fn key_age(&self, peer_id: &str) -> Option<Duration> {
        self.keys
            .lock()
            .get(peer_id)
            .map(|stored| stored.created_at.elapsed())
    }

    /// Reversible text encoding of the key for transmission inside a
    /// signaling envelope.
    pub fn export_encoded(&self, peer_id: &str) -> Option<String> {
        self.get(peer_id)
            .map(|bytes| BASE64_STANDARD.encode(bytes))
    }

    /// Inverse of `export_encoded`.
    pub fn decode_encoded(text: &str) -> Result<[u8; KEY_LEN], KeyStoreError> {
        let raw = BASE64_STANDARD
            .decode(text.as_bytes())
            .map_err(|err| KeyStoreError::Encoding(err.to_string()))?;
        let len = raw.len();
        raw.try_into().map_err(|_| KeyStoreError::Length(len))
    }

    /// Wipe and remove the key for `peer_id`. Safe to call when absent.
    pub fn destroy(&self, peer_id: &str) {
        if let Some(mut stored) = self.keys.lock().remove(peer_id) {
            stored.wipe();
        }
    }

    /// Wipe and remove every stored key.
    pub fn destroy_all(&self) {
        let mut guard = self.keys.lock();
        for (_, mut stored) in guard.drain() {
            stored.wipe();
        }
    }
}

impl Default for SessionKeyStore {
    fn default() -> Self {
        Self::new()
    }
}
