use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{
    CandidateSink, ChannelSink, DataChannel, DescriptionKind, MessageSink, OpenSink,
    PeerTransport, PhaseSink, SinkCell, TransportError, TransportFactory, TransportPhase,
};
use crate::signaling::IceServers;

/// In-process transport fabric. Transports created from the same hub pair up
/// once their offer/answer descriptions reference each other, then report
/// `Connected` and bridge their data channels directly. Candidates are never
/// required to link; they are recorded so tests can assert queueing and
/// apply order.
pub struct MockHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    transports: Mutex<Vec<Arc<MockTransport>>>,
    // serializes pairing so two racing description applies can't double-link
    link_lock: Mutex<()>,
}

impl MockHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                transports: Mutex::new(Vec::new()),
                link_lock: Mutex::new(()),
            }),
        }
    }

    pub fn factory(&self) -> Arc<MockFactory> {
        Arc::new(MockFactory {
            hub: self.inner.clone(),
        })
    }

    /// Transports in creation order.
    pub fn transport(&self, index: usize) -> Option<Arc<MockTransport>> {
        self.inner.transports.lock().get(index).cloned()
    }

    pub fn transport_count(&self) -> usize {
        self.inner.transports.lock().len()
    }
}

impl Default for MockHub {
    fn default() -> Self {
        Self::new()
    }
}

impl HubInner {
    fn get(&self, id: usize) -> Option<Arc<MockTransport>> {
        self.transports.lock().get(id).cloned()
    }
}

pub struct MockFactory {
    hub: Arc<HubInner>,
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(&self, _ice: &IceServers) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut guard = self.hub.transports.lock();
        let transport = Arc::new(MockTransport {
            id: guard.len(),
            hub: self.hub.clone(),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_id: Mutex::new(None),
            remote_description_count: AtomicUsize::new(0),
            applied_candidates: Mutex::new(Vec::new()),
            candidates: SinkCell::new(),
            phases: SinkCell::new(),
            inbound: SinkCell::new(),
            local_channel: Mutex::new(None),
            linked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        guard.push(transport.clone());
        Ok(transport as Arc<dyn PeerTransport>)
    }
}

pub struct MockTransport {
    id: usize,
    hub: Arc<HubInner>,
    local: Mutex<Option<(DescriptionKind, String)>>,
    remote: Mutex<Option<(DescriptionKind, String)>>,
    remote_id: Mutex<Option<usize>>,
    remote_description_count: AtomicUsize,
    applied_candidates: Mutex<Vec<Value>>,
    candidates: SinkCell<Value>,
    phases: SinkCell<TransportPhase>,
    inbound: SinkCell<Arc<dyn DataChannel>>,
    local_channel: Mutex<Option<Arc<MockChannel>>>,
    linked: AtomicBool,
    closed: AtomicBool,
}

fn parse_peer_id(sdp: &str) -> Option<usize> {
    let mut parts = sdp.split(':');
    match (parts.next(), parts.next()) {
        (Some("mock-sdp"), Some(id)) => id.parse().ok(),
        _ => None,
    }
}

impl MockTransport {
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<Value> {
        self.applied_candidates.lock().clone()
    }

    pub fn remote_description_count(&self) -> usize {
        self.remote_description_count.load(Ordering::SeqCst)
    }

    /// Simulate the transport discovering a local network path.
    pub fn emit_local_candidate(&self, candidate: Value) {
        self.candidates.emit(candidate);
    }

    fn try_link(&self) {
        let _linking = self.hub.link_lock.lock();
        if self.linked.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(remote_id) = *self.remote_id.lock() else {
            return;
        };
        let Some(peer) = self.hub.get(remote_id) else {
            return;
        };
        let this = match self.hub.get(self.id) {
            Some(this) => this,
            None => return,
        };
        let self_ready = self.local.lock().is_some() && self.remote.lock().is_some();
        let peer_ready = peer.local.lock().is_some()
            && peer.remote.lock().is_some()
            && *peer.remote_id.lock() == Some(self.id)
            && !peer.closed.load(Ordering::SeqCst);
        if !(self_ready && peer_ready) {
            return;
        }
        self.linked.store(true, Ordering::SeqCst);
        peer.linked.store(true, Ordering::SeqCst);

        let (host, guest) = if this.local_channel.lock().is_some() {
            (this, peer)
        } else {
            (peer, this)
        };
        let channel = host.local_channel.lock().clone();
        if let Some(channel) = channel {
            let mirror = MockChannel::new(&channel.label);
            *guest.local_channel.lock() = Some(mirror.clone());
            *channel.peer.lock() = Arc::downgrade(&mirror);
            *mirror.peer.lock() = Arc::downgrade(&channel);
            guest.inbound.emit(mirror.clone() as Arc<dyn DataChannel>);
            channel.open.store(true, Ordering::SeqCst);
            mirror.open.store(true, Ordering::SeqCst);
            channel.opens.emit(());
            mirror.opens.emit(());
        }
        host.phases.emit(TransportPhase::Connected);
        guest.phases.emit(TransportPhase::Connected);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        Ok(format!("mock-sdp:{}:offer", self.id))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        Ok(format!("mock-sdp:{}:answer", self.id))
    }

    async fn set_local_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), TransportError> {
        *self.local.lock() = Some((kind, sdp.to_string()));
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), TransportError> {
        let peer_id = parse_peer_id(sdp).ok_or_else(|| {
            TransportError::Negotiation(format!("unrecognized mock sdp: {sdp}"))
        })?;
        *self.remote.lock() = Some((kind, sdp.to_string()));
        *self.remote_id.lock() = Some(peer_id);
        self.remote_description_count.fetch_add(1, Ordering::SeqCst);
        self.try_link();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        if candidate.get("invalid").is_some() {
            return Err(TransportError::Negotiation("unusable candidate".into()));
        }
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MockChannel::new(label);
        *self.local_channel.lock() = Some(channel.clone());
        Ok(channel as Arc<dyn DataChannel>)
    }

    fn on_local_candidate(&self, sink: CandidateSink) {
        self.candidates.install(sink);
    }

    fn on_phase_change(&self, sink: PhaseSink) {
        self.phases.install(sink);
    }

    fn on_data_channel(&self, sink: ChannelSink) {
        self.inbound.install(sink);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(channel) = self.local_channel.lock().clone() {
            channel.open.store(false, Ordering::SeqCst);
        }
        if self.linked.load(Ordering::SeqCst) {
            let remote_id = *self.remote_id.lock();
            if let Some(peer) = remote_id.and_then(|id| self.hub.get(id)) {
                if let Some(channel) = peer.local_channel.lock().clone() {
                    channel.open.store(false, Ordering::SeqCst);
                }
                peer.phases.emit(TransportPhase::Disconnected);
            }
        }
    }
}

pub struct MockChannel {
    label: String,
    open: AtomicBool,
    peer: Mutex<std::sync::Weak<MockChannel>>,
    messages: SinkCell<String>,
    opens: SinkCell<()>,
}

impl MockChannel {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            peer: Mutex::new(std::sync::Weak::new()),
            messages: SinkCell::new(),
            opens: SinkCell::new(),
        })
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        let Some(peer) = self.peer.lock().upgrade() else {
            return Err(TransportError::ChannelClosed);
        };
        peer.messages.emit(text.to_string());
        Ok(())
    }

    fn on_message(&self, sink: MessageSink) {
        self.messages.install(sink);
    }

    fn on_open(&self, sink: OpenSink) {
        self.opens.install(Arc::new(move |()| sink()));
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(peer) = self.peer.lock().upgrade() {
            peer.open.store(false, Ordering::SeqCst);
        }
    }
}
