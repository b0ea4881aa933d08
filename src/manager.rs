use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::codec::{ChannelFrame, CodecError, SecureChannelCodec};
use crate::config::Config;
use crate::identity::{Directory, IdentityCrypto};
use crate::keystore::SessionKeyStore;
use crate::session::{
    CandidateDisposition, OfferCollision, PeerSession, SessionState, resolve_offer_collision,
};
use crate::signaling::{
    AnswerPayload, IceServers, OfferPayload, SdpKind, SignalEnvelope, SignalKind, SignalingApi,
    SignalingError, WirePayload,
};
use crate::transport::{DataChannel, DescriptionKind, TransportError, TransportFactory};

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("no session key for {0}")]
    MissingKey(String),
}

pub type StateCallback = Box<dyn Fn(&str, SessionState) + Send + Sync>;
pub type MessageCallback = Box<dyn Fn(&str, String) + Send + Sync>;
pub type ErrorCallback = Box<dyn Fn(&str, String) + Send + Sync>;

/// Application-facing callbacks. Errors and state changes are reported here
/// rather than returned; the manager never throws past its boundary during
/// steady-state operation.
pub struct Callbacks {
    pub on_state_change: StateCallback,
    pub on_message: MessageCallback,
    pub on_error: ErrorCallback,
}

impl Callbacks {
    fn noop() -> Self {
        Self {
            on_state_change: Box::new(|_, _| {}),
            on_message: Box::new(|_, _| {}),
            on_error: Box::new(|_, _| {}),
        }
    }
}

/// Injected collaborators. Everything behind a trait so tests can swap the
/// relay, the transport fabric, and the identity service independently.
pub struct ManagerDeps {
    pub signaling: Arc<dyn SignalingApi>,
    pub transports: Arc<dyn TransportFactory>,
    pub identity: Arc<dyn IdentityCrypto>,
    pub directory: Arc<dyn Directory>,
}

/// Facade over the negotiation core: drives offer/answer/candidate exchange
/// per peer, owns the per-peer sessions and session keys, and pumps the
/// signaling poll loop.
pub struct PeerManager {
    weak: Weak<PeerManager>,
    local_id: String,
    config: Config,
    keys: Arc<SessionKeyStore>,
    codec: SecureChannelCodec,
    signaling: Arc<dyn SignalingApi>,
    transports: Arc<dyn TransportFactory>,
    identity: Arc<dyn IdentityCrypto>,
    directory: Arc<dyn Directory>,
    sessions: Mutex<HashMap<String, Arc<PeerSession>>>,
    callbacks: RwLock<Arc<Callbacks>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    ice_cache: Mutex<Option<IceServers>>,
}

impl PeerManager {
    pub fn new(local_id: impl Into<String>, config: Config, deps: ManagerDeps) -> Arc<Self> {
        let keys = Arc::new(SessionKeyStore::new());
        let codec = SecureChannelCodec::new(keys.clone());
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            local_id: local_id.into(),
            config,
            keys,
            codec,
            signaling: deps.signaling,
            transports: deps.transports,
            identity: deps.identity,
            directory: deps.directory,
            sessions: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Arc::new(Callbacks::noop())),
            poller: Mutex::new(None),
            ice_cache: Mutex::new(None),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn keys(&self) -> &Arc<SessionKeyStore> {
        &self.keys
    }

    /// Register callbacks and start the signaling poll loop. Idempotent with
    /// respect to the poll loop: a second call replaces the callbacks but
    /// never creates a second poller.
    pub fn init(&self, callbacks: Callbacks) {
        *self.callbacks.write() = Arc::new(callbacks);
        let mut poller = self.poller.lock();
        if poller.is_some() {
            tracing::debug!(target = "tincan::signaling", "poll loop already running");
            return;
        }
        let weak = self.weak.clone();
        let interval = self.config.poll_interval;
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                match manager.signaling.poll_once().await {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            manager.handle_incoming_signal(envelope).await;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "tincan::signaling",
                            error = %err,
                            "signal poll failed; retrying next tick"
                        );
                    }
                }
            }
        }));
    }

    /// Initiate a connection to `peer_id`. Outcomes arrive via callbacks.
    pub async fn connect(&self, peer_id: &str) {
        if peer_id == self.local_id {
            tracing::warn!(target = "tincan::negotiation", "refusing to connect to self");
            return;
        }
        if self.live_session(peer_id).is_some() {
            tracing::debug!(
                target = "tincan::negotiation",
                peer = %peer_id,
                "connect ignored; session already exists"
            );
            return;
        }
        if !self.directory.is_online(peer_id).await {
            tracing::debug!(
                target = "tincan::negotiation",
                peer = %peer_id,
                "peer offline; relay will hold the offer"
            );
        }
        self.keys.generate(peer_id);
        let ice = self.ice_servers().await;
        let transport = match self.transports.create(&ice).await {
            Ok(transport) => transport,
            Err(err) => {
                self.fail_before_session(peer_id, &format!("transport setup failed: {err}"));
                return;
            }
        };
        let session = PeerSession::new(peer_id, transport, true);
        self.sessions
            .lock()
            .insert(peer_id.to_string(), session.clone());
        self.notify_state(peer_id, SessionState::Connecting);
        self.wire_transport(&session);
        self.arm_watchdog(&session);
        if let Err(err) = self.send_offer(&session).await {
            self.fail_session(&session, &format!("sending offer failed: {err}"))
                .await;
        }
    }

    /// Dispatch one relayed envelope. Normally fed by the poll loop; exposed
    /// so applications with their own delivery path can inject envelopes.
    pub async fn handle_incoming_signal(&self, envelope: SignalEnvelope) {
        if envelope.from_user == self.local_id {
            tracing::trace!(target = "tincan::signaling", "ignoring own envelope");
            return;
        }
        let Some(body) = self.open_signal_payload(&envelope).await else {
            return;
        };
        match envelope.kind {
            SignalKind::Offer => self.handle_offer(&envelope.from_user, body).await,
            SignalKind::Answer => self.handle_answer(&envelope.from_user, body).await,
            SignalKind::Ice => self.handle_candidate(&envelope.from_user, body).await,
        }
    }

    /// Encrypt (falling back to plaintext) and transmit over the data
    /// channel. Returns `false` without side effects when no open channel
    /// exists for `peer_id`.
    pub async fn send_message(&self, peer_id: &str, text: &str) -> bool {
        let Some(channel) = self.live_session(peer_id).and_then(|s| s.channel()) else {
            return false;
        };
        if !channel.is_open() {
            return false;
        }
        let frame = match self.codec.encrypt(peer_id, text) {
            Ok(envelope) => ChannelFrame::Sealed { envelope },
            Err(err) => {
                tracing::warn!(
                    target = "tincan::channel",
                    peer = %peer_id,
                    error = %err,
                    "encryption unavailable; sending plaintext"
                );
                ChannelFrame::Plain {
                    text: text.to_string(),
                }
            }
        };
        let encoded = match serde_json::to_string(&frame) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.notify_error(peer_id, &format!("frame encoding failed: {err}"));
                return false;
            }
        };
        match channel.send_text(&encoded).await {
            Ok(()) => true,
            Err(err) => {
                self.notify_error(peer_id, &format!("channel send failed: {err}"));
                false
            }
        }
    }

    /// Tear down the session with `peer_id`: close the channel and
    /// transport, destroy the session key, remove the session. No-op for an
    /// unknown peer.
    pub async fn disconnect(&self, peer_id: &str) {
        let Some(session) = self.sessions.lock().remove(peer_id) else {
            return;
        };
        session.disarm_watchdog();
        let changed = session.transition(SessionState::Disconnected);
        if let Some(channel) = session.channel() {
            channel.close().await;
        }
        session.transport().close().await;
        self.keys.destroy(peer_id);
        if changed {
            self.notify_state(peer_id, SessionState::Disconnected);
        }
    }

    /// `Idle` when no session exists, else the session's current state.
    pub fn connection_status(&self, peer_id: &str) -> SessionState {
        self.sessions
            .lock()
            .get(peer_id)
            .map(|session| session.state())
            .unwrap_or(SessionState::Idle)
    }

    /// Drop everything still queued for this identity at the relay.
    pub async fn clear_signaling(&self) -> Result<u64, SignalingError> {
        self.signaling.clear().await
    }

    /// End of life: stop polling, tear down every session, wipe every key.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
        let sessions: Vec<Arc<PeerSession>> =
            self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.disarm_watchdog();
            session.transition(SessionState::Disconnected);
            if let Some(channel) = session.channel() {
                channel.close().await;
            }
            session.transport().close().await;
        }
        self.keys.destroy_all();
    }

    // ---- initiator path ----------------------------------------------------

    async fn send_offer(&self, session: &Arc<PeerSession>) -> Result<(), NegotiationError> {
        let peer_id = session.peer_id().to_string();
        let transport = session.transport().clone();
        let channel = transport
            .create_data_channel(&self.config.data_channel_label)
            .await?;
        self.adopt_channel(session, channel);
        let sdp = transport.create_offer().await?;
        transport
            .set_local_description(DescriptionKind::Offer, &sdp)
            .await?;
        let aes_key = self
            .keys
            .export_encoded(&peer_id)
            .ok_or_else(|| NegotiationError::MissingKey(peer_id.clone()))?;
        let body = serde_json::to_value(OfferPayload {
            sdp,
            kind: SdpKind::Offer,
            aes_key,
        })?;
        let sealed = self.seal_signal_payload(&peer_id, body).await?;
        self.signaling
            .send(&peer_id, SignalKind::Offer, sealed)
            .await?;
        tracing::debug!(target = "tincan::negotiation", peer = %peer_id, "offer sent");
        Ok(())
    }

    // ---- responder path ----------------------------------------------------

    async fn handle_offer(&self, from: &str, body: Value) {
        let payload: OfferPayload = match serde_json::from_value(body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    target = "tincan::negotiation",
                    peer = %from,
                    error = %err,
                    "dropping malformed offer"
                );
                return;
            }
        };
        if let Some(existing) = self.live_session(from) {
            if !existing.initiated() {
                tracing::debug!(
                    target = "tincan::negotiation",
                    peer = %from,
                    "duplicate offer ignored; already answering"
                );
                return;
            }
            match resolve_offer_collision(&self.local_id, from) {
                OfferCollision::KeepLocal => {
                    tracing::info!(
                        target = "tincan::negotiation",
                        peer = %from,
                        "simultaneous offers; keeping local offer"
                    );
                    return;
                }
                OfferCollision::YieldToRemote => {
                    tracing::info!(
                        target = "tincan::negotiation",
                        peer = %from,
                        "simultaneous offers; yielding to remote offer"
                    );
                    self.discard_half_open(existing).await;
                }
            }
        }
        let key = match SessionKeyStore::decode_encoded(&payload.aes_key) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(
                    target = "tincan::negotiation",
                    peer = %from,
                    error = %err,
                    "dropping offer with unusable session key"
                );
                return;
            }
        };
        self.keys.set(from, key);
        let ice = self.ice_servers().await;
        let transport = match self.transports.create(&ice).await {
            Ok(transport) => transport,
            Err(err) => {
                self.fail_before_session(from, &format!("transport setup failed: {err}"));
                return;
            }
        };
        let session = PeerSession::new(from, transport, false);
        self.sessions
            .lock()
            .insert(from.to_string(), session.clone());
        self.notify_state(from, SessionState::Connecting);
        self.wire_transport(&session);
        self.arm_watchdog(&session);
        if let Err(err) = self.answer_offer(&session, &payload.sdp).await {
            self.fail_session(&session, &format!("answering offer failed: {err}"))
                .await;
        }
    }

    async fn answer_offer(
        &self,
        session: &Arc<PeerSession>,
        offer_sdp: &str,
    ) -> Result<(), NegotiationError> {
        let peer_id = session.peer_id().to_string();
        let transport = session.transport().clone();
        session.claim_remote_description();
        transport
            .set_remote_description(DescriptionKind::Offer, offer_sdp)
            .await?;
        let pending = session.mark_remote_applied();
        self.apply_candidates(session, pending).await;
        let sdp = transport.create_answer().await?;
        transport
            .set_local_description(DescriptionKind::Answer, &sdp)
            .await?;
        let body = serde_json::to_value(AnswerPayload {
            sdp,
            kind: SdpKind::Answer,
        })?;
        let sealed = self.seal_signal_payload(&peer_id, body).await?;
        self.signaling
            .send(&peer_id, SignalKind::Answer, sealed)
            .await?;
        tracing::debug!(target = "tincan::negotiation", peer = %peer_id, "answer sent");
        Ok(())
    }

    // ---- answer / candidate handling ---------------------------------------

    async fn handle_answer(&self, from: &str, body: Value) {
        let Some(session) = self.live_session(from) else {
            tracing::debug!(
                target = "tincan::negotiation",
                peer = %from,
                "answer for unknown session dropped"
            );
            return;
        };
        let payload: AnswerPayload = match serde_json::from_value(body) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(
                    target = "tincan::negotiation",
                    peer = %from,
                    error = %err,
                    "dropping malformed answer"
                );
                return;
            }
        };
        if !session.claim_remote_description() {
            tracing::debug!(
                target = "tincan::negotiation",
                peer = %from,
                "duplicate answer ignored"
            );
            return;
        }
        if let Err(err) = session
            .transport()
            .set_remote_description(DescriptionKind::Answer, &payload.sdp)
            .await
        {
            self.fail_session(&session, &format!("applying answer failed: {err}"))
                .await;
            return;
        }
        let pending = session.mark_remote_applied();
        self.apply_candidates(&session, pending).await;
    }

    async fn handle_candidate(&self, from: &str, body: Value) {
        let Some(session) = self.live_session(from) else {
            tracing::debug!(
                target = "tincan::negotiation",
                peer = %from,
                "candidate for unknown peer dropped"
            );
            return;
        };
        match session.offer_candidate(body) {
            CandidateDisposition::Queued => {
                tracing::trace!(
                    target = "tincan::negotiation",
                    peer = %from,
                    "candidate queued until remote description applies"
                );
            }
            CandidateDisposition::ApplyNow(candidate) => {
                if let Err(err) = session.transport().add_remote_candidate(candidate).await {
                    tracing::warn!(
                        target = "tincan::negotiation",
                        peer = %from,
                        error = %err,
                        "discarding inapplicable candidate"
                    );
                }
            }
        }
    }

    async fn apply_candidates(&self, session: &Arc<PeerSession>, candidates: Vec<Value>) {
        for candidate in candidates {
            if let Err(err) = session.transport().add_remote_candidate(candidate).await {
                tracing::warn!(
                    target = "tincan::negotiation",
                    peer = %session.peer_id(),
                    error = %err,
                    "discarding inapplicable queued candidate"
                );
            }
        }
    }

    // ---- transport event wiring --------------------------------------------

    fn wire_transport(&self, session: &Arc<PeerSession>) {
        let transport = session.transport();

        let manager = self.weak.clone();
        let peer_id = session.peer_id().to_string();
        transport.on_local_candidate(Arc::new(move |candidate| {
            let Some(manager) = manager.upgrade() else { return };
            let peer_id = peer_id.clone();
            tokio::spawn(async move {
                manager.send_local_candidate(&peer_id, candidate).await;
            });
        }));

        let manager = self.weak.clone();
        let weak_session = Arc::downgrade(session);
        transport.on_phase_change(Arc::new(move |phase| {
            let Some(manager) = manager.upgrade() else { return };
            let Some(session) = weak_session.upgrade() else { return };
            tokio::spawn(async move {
                manager.handle_transport_phase(session, phase).await;
            });
        }));

        let manager = self.weak.clone();
        let weak_session = Arc::downgrade(session);
        transport.on_data_channel(Arc::new(move |channel| {
            let Some(manager) = manager.upgrade() else { return };
            let Some(session) = weak_session.upgrade() else { return };
            manager.adopt_channel(&session, channel);
        }));
    }

    fn adopt_channel(&self, session: &Arc<PeerSession>, channel: Arc<dyn DataChannel>) {
        session.set_channel(channel.clone());

        let manager = self.weak.clone();
        let weak_session = Arc::downgrade(session);
        channel.on_open(Arc::new(move || {
            let (Some(manager), Some(session)) = (manager.upgrade(), weak_session.upgrade())
            else {
                return;
            };
            manager.mark_connected(&session);
        }));

        let manager = self.weak.clone();
        let peer_id = session.peer_id().to_string();
        channel.on_message(Arc::new(move |text| {
            let Some(manager) = manager.upgrade() else { return };
            manager.handle_inbound_frame(&peer_id, &text);
        }));
    }

    async fn handle_transport_phase(
        &self,
        session: Arc<PeerSession>,
        phase: crate::transport::TransportPhase,
    ) {
        use crate::transport::TransportPhase;
        match phase {
            TransportPhase::Connected => self.mark_connected(&session),
            TransportPhase::Failed => {
                self.fail_session(&session, "transport failed").await;
            }
            TransportPhase::Disconnected | TransportPhase::Closed => {
                self.close_session(&session).await;
            }
            TransportPhase::New | TransportPhase::Connecting => {}
        }
    }

    /// Either the transport's connected report or the data channel opening
    /// is sufficient; whichever lands first wins and the other is a no-op.
    fn mark_connected(&self, session: &Arc<PeerSession>) {
        if !self.session_is_current(session) {
            return;
        }
        if session.transition(SessionState::Connected) {
            session.disarm_watchdog();
            self.notify_state(session.peer_id(), SessionState::Connected);
        }
    }

    async fn send_local_candidate(&self, peer_id: &str, candidate: Value) {
        // best effort: a lost candidate degrades the path, not the session
        let sealed = match self.seal_signal_payload(peer_id, candidate).await {
            Ok(sealed) => sealed,
            Err(err) => {
                tracing::warn!(
                    target = "tincan::signaling",
                    peer = %peer_id,
                    error = %err,
                    "candidate payload encoding failed"
                );
                return;
            }
        };
        if let Err(err) = self.signaling.send(peer_id, SignalKind::Ice, sealed).await {
            tracing::warn!(
                target = "tincan::signaling",
                peer = %peer_id,
                error = %err,
                "candidate send failed; continuing without it"
            );
        }
    }

    // ---- inbound data-channel frames ---------------------------------------

    fn handle_inbound_frame(&self, peer_id: &str, raw: &str) {
        match serde_json::from_str::<ChannelFrame>(raw) {
            Ok(ChannelFrame::Sealed { envelope }) => {
                match self.codec.decrypt(peer_id, &envelope) {
                    Ok(plaintext) => self.notify_message(peer_id, plaintext),
                    Err(err @ (CodecError::Authentication | CodecError::NoKey(_))) => {
                        self.notify_error(peer_id, &format!("dropping sealed message: {err}"));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "tincan::channel",
                            peer = %peer_id,
                            error = %err,
                            "dropping undecodable sealed message"
                        );
                    }
                }
            }
            Ok(ChannelFrame::Plain { text }) => self.notify_message(peer_id, text),
            Err(_) => {
                // not one of our frames; deliver as raw plaintext
                tracing::trace!(
                    target = "tincan::channel",
                    peer = %peer_id,
                    "untagged channel payload delivered as plaintext"
                );
                self.notify_message(peer_id, raw.to_string());
            }
        }
    }

    // ---- payload sealing ----------------------------------------------------

    async fn seal_signal_payload(
        &self,
        peer_id: &str,
        body: Value,
    ) -> Result<String, serde_json::Error> {
        let wire = match self.directory.public_key(peer_id).await {
            Some(public_key) => {
                match self
                    .identity
                    .encrypt_for_recipient(&body.to_string(), &public_key)
                    .await
                {
                    Ok(armored) => WirePayload::Armored { body: armored },
                    Err(err) => {
                        tracing::warn!(
                            target = "tincan::signaling",
                            peer = %peer_id,
                            error = %err,
                            "recipient encryption failed; sending plaintext payload"
                        );
                        WirePayload::Plain { body }
                    }
                }
            }
            None => {
                tracing::debug!(
                    target = "tincan::signaling",
                    peer = %peer_id,
                    "no public key known; sending plaintext payload"
                );
                WirePayload::Plain { body }
            }
        };
        serde_json::to_string(&wire)
    }

    async fn open_signal_payload(&self, envelope: &SignalEnvelope) -> Option<Value> {
        let wire: WirePayload = match serde_json::from_str(&envelope.encrypted_payload) {
            Ok(wire) => wire,
            Err(err) => {
                tracing::warn!(
                    target = "tincan::signaling",
                    peer = %envelope.from_user,
                    kind = ?envelope.kind,
                    error = %err,
                    "dropping undecodable envelope"
                );
                return None;
            }
        };
        match wire {
            WirePayload::Plain { body } => Some(body),
            WirePayload::Armored { body } => {
                let plaintext = match self.identity.decrypt_own(&body).await {
                    Ok(plaintext) => plaintext,
                    Err(err) => {
                        tracing::warn!(
                            target = "tincan::signaling",
                            peer = %envelope.from_user,
                            kind = ?envelope.kind,
                            error = %err,
                            "dropping envelope that failed to decrypt"
                        );
                        return None;
                    }
                };
                match serde_json::from_str(&plaintext) {
                    Ok(body) => Some(body),
                    Err(err) => {
                        tracing::warn!(
                            target = "tincan::signaling",
                            peer = %envelope.from_user,
                            error = %err,
                            "dropping envelope with unparsable payload"
                        );
                        None
                    }
                }
            }
        }
    }

    // ---- session bookkeeping ------------------------------------------------

    fn live_session(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions.lock().get(peer_id).cloned()
    }

    /// A continuation resuming after an await must confirm its session is
    /// still the live entry before mutating anything.
    fn session_is_current(&self, session: &Arc<PeerSession>) -> bool {
        self.sessions
            .lock()
            .get(session.peer_id())
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }

    fn remove_if_current(&self, session: &Arc<PeerSession>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session.peer_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.peer_id());
                true
            }
            _ => false,
        }
    }

    async fn fail_session(&self, session: &Arc<PeerSession>, reason: &str) {
        if !self.remove_if_current(session) {
            return;
        }
        session.disarm_watchdog();
        let changed = session.transition(SessionState::Failed);
        if let Some(channel) = session.channel() {
            channel.close().await;
        }
        session.transport().close().await;
        self.keys.destroy(session.peer_id());
        self.notify_error(session.peer_id(), reason);
        if changed {
            self.notify_state(session.peer_id(), SessionState::Failed);
        }
    }

    /// Transport-level teardown observed (peer went away): same cleanup as
    /// `disconnect`, driven from the remote side.
    async fn close_session(&self, session: &Arc<PeerSession>) {
        if !self.remove_if_current(session) {
            return;
        }
        session.disarm_watchdog();
        let changed = session.transition(SessionState::Disconnected);
        if let Some(channel) = session.channel() {
            channel.close().await;
        }
        session.transport().close().await;
        self.keys.destroy(session.peer_id());
        if changed {
            self.notify_state(session.peer_id(), SessionState::Disconnected);
        }
    }

    /// Collision loser: silently drop the half-open initiator session so the
    /// remote offer can be answered with a fresh one.
    async fn discard_half_open(&self, session: Arc<PeerSession>) {
        self.remove_if_current(&session);
        session.disarm_watchdog();
        if let Some(channel) = session.channel() {
            channel.close().await;
        }
        session.transport().close().await;
    }

    fn fail_before_session(&self, peer_id: &str, reason: &str) {
        self.keys.destroy(peer_id);
        self.notify_error(peer_id, reason);
        self.notify_state(peer_id, SessionState::Failed);
    }

    fn arm_watchdog(&self, session: &Arc<PeerSession>) {
        let Some(timeout) = self.config.negotiation_timeout else {
            return;
        };
        let manager = self.weak.clone();
        let weak_session = Arc::downgrade(session);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(manager) = manager.upgrade() else { return };
            let Some(session) = weak_session.upgrade() else { return };
            if session.state() == SessionState::Connecting {
                manager
                    .fail_session(&session, "negotiation timed out")
                    .await;
            }
        });
        session.arm_watchdog(handle);
    }

    // ---- ICE servers --------------------------------------------------------

    /// Relay-advertised servers, fetched once and cached; on failure the
    /// configured fallback list is used and the fetch retried next time.
    async fn ice_servers(&self) -> IceServers {
        if let Some(cached) = self.ice_cache.lock().clone() {
            return cached;
        }
        match self.signaling.ice_servers().await {
            Ok(servers) => {
                *self.ice_cache.lock() = Some(servers.clone());
                servers
            }
            Err(err) => {
                tracing::warn!(
                    target = "tincan::signaling",
                    error = %err,
                    "ice server fetch failed; using fallback stun list"
                );
                IceServers {
                    stun_servers: self.config.fallback_stun_servers.clone(),
                    turn_servers: Vec::new(),
                }
            }
        }
    }

    // ---- callbacks ----------------------------------------------------------

    fn callbacks(&self) -> Arc<Callbacks> {
        self.callbacks.read().clone()
    }

    fn notify_state(&self, peer_id: &str, state: SessionState) {
        tracing::debug!(
            target = "tincan::negotiation",
            peer = %peer_id,
            state = %state,
            "session state changed"
        );
        (self.callbacks().on_state_change)(peer_id, state);
    }

    fn notify_message(&self, peer_id: &str, text: String) {
        (self.callbacks().on_message)(peer_id, text);
    }

    fn notify_error(&self, peer_id: &str, message: &str) {
        tracing::warn!(
            target = "tincan::negotiation",
            peer = %peer_id,
            error = %message,
            "session error"
        );
        (self.callbacks().on_error)(peer_id, message.to_string());
    }
}

impl Drop for PeerManager {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}
