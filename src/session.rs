use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::transport::{DataChannel, PeerTransport};

/// Observable lifecycle of one peer session. `Idle` is never stored; it is
/// what `connection_status` reports when no session exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Which side survives when both peers sent each other offers. The
/// lexicographically higher identifier keeps its own outstanding offer; the
/// lower side discards its half-open session and answers instead. Both sides
/// reach the same verdict without another round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferCollision {
    KeepLocal,
    YieldToRemote,
}

pub fn resolve_offer_collision(local_id: &str, remote_id: &str) -> OfferCollision {
    if local_id > remote_id {
        OfferCollision::KeepLocal
    } else {
        OfferCollision::YieldToRemote
    }
}

/// What to do with a remote candidate that just arrived.
#[derive(Debug)]
pub enum CandidateDisposition {
    /// No remote description yet; held until the drain.
    Queued,
    /// Remote description applied; caller applies it directly.
    ApplyNow(Value),
}

#[derive(Default)]
struct CandidateGate {
    /// Set the moment a remote description is accepted for application, so a
    /// duplicate answer can never apply twice.
    claimed: bool,
    /// Set only after the description apply completed; gates direct
    /// candidate application.
    applied: bool,
    pending: Vec<Value>,
}

/// One negotiation with one remote identity. Owns its transport and data
/// channel exclusively; dropped handles tear both down.
pub struct PeerSession {
    peer_id: String,
    initiated: bool,
    transport: Arc<dyn PeerTransport>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
    state: Mutex<SessionState>,
    gate: Mutex<CandidateGate>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub fn new(
        peer_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        initiated: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id: peer_id.into(),
            initiated,
            transport,
            channel: Mutex::new(None),
            state: Mutex::new(SessionState::Connecting),
            gate: Mutex::new(CandidateGate::default()),
            watchdog: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// True when this side sent the offer.
    pub fn initiated(&self) -> bool {
        self.initiated
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Apply a state transition. Terminal states are sticky, `Connected`
    /// only ever moves to a terminal state, and repeats are ignored.
    /// Returns whether the state actually changed.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if *state == next || state.is_terminal() {
            return false;
        }
        if *state == SessionState::Connected && !next.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    pub fn set_channel(&self, channel: Arc<dyn DataChannel>) {
        *self.channel.lock() = Some(channel);
    }

    pub fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.channel.lock().clone()
    }

    /// Reserve the one-and-only remote description application. The first
    /// caller gets `true`; every later answer is a duplicate and must be
    /// ignored.
    pub fn claim_remote_description(&self) -> bool {
        let mut gate = self.gate.lock();
        if gate.claimed {
            return false;
        }
        gate.claimed = true;
        true
    }

    pub fn remote_description_applied(&self) -> bool {
        self.gate.lock().applied
    }

    /// Route an arriving candidate. Queued and direct application are
    /// decided under the same lock as the drain, so a candidate is never
    /// lost between the two and never applied twice.
    pub fn offer_candidate(&self, candidate: Value) -> CandidateDisposition {
        let mut gate = self.gate.lock();
        if gate.applied {
            CandidateDisposition::ApplyNow(candidate)
        } else {
            gate.pending.push(candidate);
            CandidateDisposition::Queued
        }
    }

    /// Mark the remote description applied and hand back everything queued
    /// so far, in arrival order. Candidates arriving from here on are
    /// applied directly.
    pub fn mark_remote_applied(&self) -> Vec<Value> {
        let mut gate = self.gate.lock();
        gate.applied = true;
        std::mem::take(&mut gate.pending)
    }

    pub fn arm_watchdog(&self, handle: JoinHandle<()>) {
        let mut guard = self.watchdog.lock();
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
    }

    pub fn disarm_watchdog(&self) {
        if let Some(handle) = self.watchdog.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.disarm_watchdog();
    }
}
