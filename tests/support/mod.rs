#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde_json::Value;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tincan::identity::{IdentityCrypto, IdentityError, StaticDirectory};
use tincan::manager::{Callbacks, ManagerDeps, PeerManager};
use tincan::signaling::{IceServers, MemoryRelay, SignalEnvelope, WirePayload};
use tincan::transport::{MockHub, PeerTransport, TransportError, TransportFactory};
use tincan::{Config, SessionState};

/// Reversible stand-in for the identity service's asymmetric primitives.
/// "Armoring" is a tagged base64 wrap, enough to prove the core routes
/// payloads through the boundary and recovers them on the other side.
pub struct ArmorDouble;

#[async_trait]
impl IdentityCrypto for ArmorDouble {
    async fn encrypt_for_recipient(
        &self,
        plaintext: &str,
        recipient_public_key: &str,
    ) -> Result<String, IdentityError> {
        Ok(format!(
            "armor:{recipient_public_key}:{}",
            BASE64_STANDARD.encode(plaintext)
        ))
    }

    async fn decrypt_own(&self, armored: &str) -> Result<String, IdentityError> {
        let rest = armored
            .strip_prefix("armor:")
            .ok_or_else(|| IdentityError::Decrypt("payload is not armored".into()))?;
        let (_public_key, body) = rest
            .split_once(':')
            .ok_or_else(|| IdentityError::Decrypt("malformed armor".into()))?;
        let raw = BASE64_STANDARD
            .decode(body)
            .map_err(|err| IdentityError::Decrypt(err.to_string()))?;
        String::from_utf8(raw).map_err(|err| IdentityError::Decrypt(err.to_string()))
    }
}

pub struct FailingFactory;

#[async_trait]
impl TransportFactory for FailingFactory {
    async fn create(&self, _ice: &IceServers) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Err(TransportError::Setup("no transport available".into()))
    }
}

#[derive(Clone, Default)]
pub struct Recorder {
    pub states: Arc<Mutex<Vec<(String, SessionState)>>>,
    pub messages: Arc<Mutex<Vec<(String, String)>>>,
    pub errors: Arc<Mutex<Vec<(String, String)>>>,
}

impl Recorder {
    pub fn callbacks(&self) -> Callbacks {
        let states = self.states.clone();
        let messages = self.messages.clone();
        let errors = self.errors.clone();
        Callbacks {
            on_state_change: Box::new(move |peer, state| {
                states.lock().unwrap().push((peer.to_string(), state));
            }),
            on_message: Box::new(move |peer, text| {
                messages.lock().unwrap().push((peer.to_string(), text));
            }),
            on_error: Box::new(move |peer, message| {
                errors.lock().unwrap().push((peer.to_string(), message));
            }),
        }
    }

    pub fn states(&self) -> Vec<(String, SessionState)> {
        self.states.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }
}

pub fn test_config(negotiation_timeout: Option<Duration>) -> Config {
    Config {
        poll_interval: Duration::from_millis(25),
        negotiation_timeout,
        ..Config::default()
    }
}

pub fn known_peers_directory() -> Arc<StaticDirectory> {
    let directory = StaticDirectory::new();
    directory.insert("@alice", "pk-alice");
    directory.insert("@bob", "pk-bob");
    Arc::new(directory)
}

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; `TINCAN_LOG` selects
/// the filter.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("TINCAN_LOG"))
            .with_test_writer()
            .try_init();
    });
}

pub fn build_peer(
    local_id: &str,
    relay: &MemoryRelay,
    hub: &MockHub,
    negotiation_timeout: Option<Duration>,
) -> (Arc<PeerManager>, Recorder) {
    init_tracing();
    let deps = ManagerDeps {
        signaling: relay.endpoint(local_id),
        transports: hub.factory(),
        identity: Arc::new(ArmorDouble),
        directory: known_peers_directory(),
    };
    let manager = PeerManager::new(local_id, test_config(negotiation_timeout), deps);
    let recorder = Recorder::default();
    manager.init(recorder.callbacks());
    (manager, recorder)
}

/// Undo the relay framing plus the armor double, returning the payload the
/// sender sealed.
pub fn unseal(envelope: &SignalEnvelope) -> Value {
    let wire: WirePayload = serde_json::from_str(&envelope.encrypted_payload).unwrap();
    match wire {
        WirePayload::Plain { body } => body,
        WirePayload::Armored { body } => {
            let rest = body.strip_prefix("armor:").expect("armored payload");
            let (_public_key, encoded) = rest.split_once(':').expect("armor shape");
            let raw = BASE64_STANDARD.decode(encoded).unwrap();
            serde_json::from_slice(&raw).unwrap()
        }
    }
}

pub async fn wait_until<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
