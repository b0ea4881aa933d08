use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod http;
pub mod memory;

pub use self::http::HttpSignaling;
pub use self::memory::{MemoryRelay, MemorySignaling};

/// Kind of a relayed signal, matching the relay's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
}

/// One store-and-forward unit as returned by the relay's poll endpoint.
/// Payloads are opaque strings; the relay never sees inside them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from_user: String,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub encrypted_payload: String,
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IceServers {
    #[serde(default)]
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
}

/// Sdp role marker inside offer/answer payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer payload as carried inside a signaling envelope, pre-armoring.
/// The embedded session key rides along so the responder can install it
/// before the channel opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(rename = "aesKey")]
    pub aes_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpKind,
}

/// Outermost shape of every relayed payload. The tag makes armored-vs-plain
/// explicit instead of being inferred by attempting a decrypt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum WirePayload {
    Armored { body: String },
    Plain { body: Value },
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling configuration: {0}")]
    InvalidConfig(String),
    #[error("relay unreachable: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("invalid relay response: {0}")]
    Decode(String),
}

/// Client view of the signaling relay.
#[async_trait]
pub trait SignalingApi: Send + Sync {
    /// Queue an envelope for `to_user`. The payload is opaque to the relay.
    async fn send(
        &self,
        to_user: &str,
        kind: SignalKind,
        encrypted_payload: String,
    ) -> Result<(), SignalingError>;

    /// Fetch and consume every envelope queued for the local identity.
    async fn poll_once(&self) -> Result<Vec<SignalEnvelope>, SignalingError>;

    /// Drop everything still queued for the local identity; returns the count.
    async fn clear(&self) -> Result<u64, SignalingError>;

    /// Network-path discovery servers advertised by the relay.
    async fn ice_servers(&self) -> Result<IceServers, SignalingError>;
}
