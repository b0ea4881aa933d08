use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("recipient encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Asymmetric crypto boundary. The primitives live in the identity service;
/// the core only decides when they run and with what payload.
#[async_trait]
pub trait IdentityCrypto: Send + Sync {
    async fn encrypt_for_recipient(
        &self,
        plaintext: &str,
        recipient_public_key: &str,
    ) -> Result<String, IdentityError>;

    async fn decrypt_own(&self, armored: &str) -> Result<String, IdentityError>;
}

/// Peer lookup boundary of the identity/directory service.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Public key for `peer_id`, if the directory knows one. A missing key
    /// downgrades signaling for that peer to plaintext.
    async fn public_key(&self, peer_id: &str) -> Option<String>;

    /// Advisory presence signal; the relay stores envelopes either way.
    async fn is_online(&self, _peer_id: &str) -> bool {
        true
    }
}

/// Directory backed by a fixed in-memory table. Useful for tests and for
/// deployments that pin peer keys out of band.
pub struct StaticDirectory {
    keys: RwLock<HashMap<String, String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, peer_id: &str, public_key: &str) {
        self.keys
            .write()
            .insert(peer_id.to_string(), public_key.to_string());
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn public_key(&self, peer_id: &str) -> Option<String> {
        self.keys.read().get(peer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_directory_lookup() {
        let directory = StaticDirectory::new();
        directory.insert("@alice", "pk-alice");
        assert_eq!(
            directory.public_key("@alice").await.as_deref(),
            Some("pk-alice")
        );
        assert_eq!(directory.public_key("@bob").await, None);
        assert!(directory.is_online("@alice").await);
    }
}
