use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::keystore::SessionKeyStore;

pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("no session key installed for {0}")]
    NoKey(String),
    #[error("message authentication failed")]
    Authentication,
    #[error("invalid envelope encoding: {0}")]
    Encoding(String),
}

/// One encrypted message: nonce, ciphertext, and authentication tag, each
/// base64-encoded for transport inside a data-channel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

/// Wire shape of a data-channel frame. The tag makes encrypted-vs-plaintext
/// explicit: a sealed frame that fails to open is an error, never quietly
/// reinterpreted as plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelFrame {
    Sealed {
        #[serde(flatten)]
        envelope: CipherEnvelope,
    },
    Plain {
        text: String,
    },
}

/// AES-256-GCM codec over the per-peer session keys. Stateless beyond
/// reading the key store; every call draws a fresh random nonce.
pub struct SecureChannelCodec {
    keys: Arc<SessionKeyStore>,
}

impl SecureChannelCodec {
    pub fn new(keys: Arc<SessionKeyStore>) -> Self {
        Self { keys }
    }

    pub fn encrypt(&self, peer_id: &str, plaintext: &str) -> Result<CipherEnvelope, CodecError> {
        let key = self
            .keys
            .get(peer_id)
            .ok_or_else(|| CodecError::NoKey(peer_id.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| CodecError::Encoding(err.to_string()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CodecError::Encoding("aead seal failed".into()))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);
        Ok(CipherEnvelope {
            iv: BASE64_STANDARD.encode(nonce_bytes),
            ciphertext: BASE64_STANDARD.encode(sealed),
            tag: BASE64_STANDARD.encode(tag),
        })
    }

    pub fn decrypt(&self, peer_id: &str, envelope: &CipherEnvelope) -> Result<String, CodecError> {
        let key = self
            .keys
            .get(peer_id)
            .ok_or_else(|| CodecError::NoKey(peer_id.to_string()))?;
        let nonce_bytes = BASE64_STANDARD
            .decode(envelope.iv.as_bytes())
            .map_err(|err| CodecError::Encoding(format!("invalid nonce: {err}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CodecError::Encoding("unexpected nonce length".into()));
        }
        let mut sealed = BASE64_STANDARD
            .decode(envelope.ciphertext.as_bytes())
            .map_err(|err| CodecError::Encoding(format!("invalid ciphertext: {err}")))?;
        let tag = BASE64_STANDARD
            .decode(envelope.tag.as_bytes())
            .map_err(|err| CodecError::Encoding(format!("invalid tag: {err}")))?;
        sealed.extend_from_slice(&tag);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| CodecError::Encoding(err.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_slice())
            .map_err(|_| CodecError::Authentication)?;
        String::from_utf8(plaintext)
            .map_err(|err| CodecError::Encoding(format!("invalid utf-8 plaintext: {err}")))
    }
}
