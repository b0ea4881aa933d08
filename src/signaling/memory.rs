use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{IceServers, SignalEnvelope, SignalKind, SignalingApi, SignalingError};

/// In-process relay: per-user FIFO queues behind one lock. Lets two managers
/// exchange envelopes without a network, and lets tests inspect and replay
/// traffic in a controlled order.
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    queues: Mutex<HashMap<String, Vec<SignalEnvelope>>>,
    ice: Mutex<IceServers>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                queues: Mutex::new(HashMap::new()),
                ice: Mutex::new(IceServers::default()),
            }),
        }
    }

    pub fn set_ice_servers(&self, ice: IceServers) {
        *self.inner.ice.lock() = ice;
    }

    /// The relay as seen by one identity.
    pub fn endpoint(&self, user_id: &str) -> Arc<MemorySignaling> {
        Arc::new(MemorySignaling {
            user_id: user_id.to_string(),
            inner: self.inner.clone(),
        })
    }

    /// Take everything queued for `user_id`, exactly as a poll would.
    pub fn drain(&self, user_id: &str) -> Vec<SignalEnvelope> {
        self.inner
            .queues
            .lock()
            .get_mut(user_id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn pending(&self, user_id: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemorySignaling {
    user_id: String,
    inner: Arc<RelayInner>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl SignalingApi for MemorySignaling {
    async fn send(
        &self,
        to_user: &str,
        kind: SignalKind,
        encrypted_payload: String,
    ) -> Result<(), SignalingError> {
        let envelope = SignalEnvelope {
            from_user: self.user_id.clone(),
            kind,
            encrypted_payload,
            timestamp: unix_now(),
        };
        self.inner
            .queues
            .lock()
            .entry(to_user.to_string())
            .or_default()
            .push(envelope);
        Ok(())
    }

    async fn poll_once(&self) -> Result<Vec<SignalEnvelope>, SignalingError> {
        Ok(self
            .inner
            .queues
            .lock()
            .get_mut(&self.user_id)
            .map(std::mem::take)
            .unwrap_or_default())
    }

    async fn clear(&self) -> Result<u64, SignalingError> {
        Ok(self
            .inner
            .queues
            .lock()
            .get_mut(&self.user_id)
            .map(|queue| {
                let count = queue.len() as u64;
                queue.clear();
                count
            })
            .unwrap_or(0))
    }

    async fn ice_servers(&self) -> Result<IceServers, SignalingError> {
        Ok(self.inner.ice.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_queues_for_recipient_only() {
        let relay = MemoryRelay::new();
        let alice = relay.endpoint("@alice");
        let bob = relay.endpoint("@bob");

        alice.send("@bob", SignalKind::Offer, "o".into()).await.unwrap();
        assert!(alice.poll_once().await.unwrap().is_empty());

        let delivered = bob.poll_once().await.unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].from_user, "@alice");
        assert_eq!(delivered[0].kind, SignalKind::Offer);

        // consumed exactly once
        assert!(bob.poll_once().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_preserves_arrival_order() {
        let relay = MemoryRelay::new();
        let alice = relay.endpoint("@alice");
        let bob = relay.endpoint("@bob");
        alice.send("@bob", SignalKind::Offer, "1".into()).await.unwrap();
        alice.send("@bob", SignalKind::Ice, "2".into()).await.unwrap();
        alice.send("@bob", SignalKind::Ice, "3".into()).await.unwrap();
        let payloads: Vec<_> = bob
            .poll_once()
            .await
            .unwrap()
            .into_iter()
            .map(|envelope| envelope.encrypted_payload)
            .collect();
        assert_eq!(payloads, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn clear_reports_dropped_count() {
        let relay = MemoryRelay::new();
        let alice = relay.endpoint("@alice");
        let bob = relay.endpoint("@bob");
        alice.send("@bob", SignalKind::Ice, "x".into()).await.unwrap();
        alice.send("@bob", SignalKind::Ice, "y".into()).await.unwrap();
        assert_eq!(bob.clear().await.unwrap(), 2);
        assert_eq!(bob.clear().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ice_servers_reflect_relay_config() {
        let relay = MemoryRelay::new();
        relay.set_ice_servers(IceServers {
            stun_servers: vec!["stun:relay.example.com:3478".into()],
            turn_servers: vec![],
        });
        let alice = relay.endpoint("@alice");
        let ice = alice.ice_servers().await.unwrap();
        assert_eq!(ice.stun_servers.len(), 1);
    }
}
