use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;

use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    CandidateBlob, CandidateSink, ChannelSink, DataChannel, DescriptionKind, MessageSink,
    OpenSink, PeerTransport, PhaseSink, SinkCell, TransportError, TransportFactory,
    TransportPhase,
};
use crate::signaling::IceServers;

/// Production factory: one `RTCPeerConnection` per peer session.
pub struct WebRtcFactory;

impl WebRtcFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self, ice: &IceServers) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = WebRtcTransport::new(ice).await?;
        Ok(transport as Arc<dyn PeerTransport>)
    }
}

fn rtc_ice_servers(ice: &IceServers) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !ice.stun_servers.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.stun_servers.clone(),
            ..Default::default()
        });
    }
    for turn in &ice.turn_servers {
        servers.push(RTCIceServer {
            urls: turn.urls.clone(),
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }
    servers
}

fn map_phase(state: RTCPeerConnectionState) -> TransportPhase {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportPhase::New,
        RTCPeerConnectionState::Connecting => TransportPhase::Connecting,
        RTCPeerConnectionState::Connected => TransportPhase::Connected,
        RTCPeerConnectionState::Disconnected => TransportPhase::Disconnected,
        RTCPeerConnectionState::Failed => TransportPhase::Failed,
        RTCPeerConnectionState::Closed => TransportPhase::Closed,
    }
}

fn setup_err(err: webrtc::Error) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn negotiation_err(err: webrtc::Error) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    candidates: Arc<SinkCell<Value>>,
    phases: Arc<SinkCell<TransportPhase>>,
    inbound: Arc<SinkCell<Arc<dyn DataChannel>>>,
}

impl WebRtcTransport {
    async fn new(ice: &IceServers) -> Result<Arc<Self>, TransportError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(setup_err)?);

        let candidates = Arc::new(SinkCell::new());
        let phases = Arc::new(SinkCell::new());
        let inbound: Arc<SinkCell<Arc<dyn DataChannel>>> = Arc::new(SinkCell::new());

        let candidate_cell = candidates.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let cell = candidate_cell.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let blob = CandidateBlob {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index.map(u32::from),
                        };
                        match serde_json::to_value(&blob) {
                            Ok(value) => cell.emit(value),
                            Err(err) => tracing::warn!(
                                target = "tincan::transport",
                                error = %err,
                                "local candidate encoding failed"
                            ),
                        }
                    }
                    Err(err) => tracing::warn!(
                        target = "tincan::transport",
                        error = %err,
                        "local candidate serialization failed"
                    ),
                }
            })
        }));

        let phase_cell = phases.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let cell = phase_cell.clone();
            Box::pin(async move {
                tracing::debug!(target = "tincan::transport", state = ?state, "peer connection state changed");
                cell.emit(map_phase(state));
            })
        }));

        let inbound_cell = inbound.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let cell = inbound_cell.clone();
            Box::pin(async move {
                tracing::debug!(target = "tincan::transport", label = %dc.label(), "data channel offered by peer");
                cell.emit(WebRtcChannel::new(dc) as Arc<dyn DataChannel>);
            })
        }));

        Ok(Arc::new(Self {
            pc,
            candidates,
            phases,
            inbound,
        }))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), TransportError> {
        let description = build_description(kind, sdp)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), TransportError> {
        let description = build_description(kind, sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_err)
    }

    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let blob: CandidateBlob = serde_json::from_value(candidate)
            .map_err(|err| TransportError::Negotiation(format!("malformed candidate: {err}")))?;
        let init = RTCIceCandidateInit {
            candidate: blob.candidate,
            sdp_mid: blob.sdp_mid,
            sdp_mline_index: blob.sdp_mline_index.map(|index| index as u16),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(negotiation_err)
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(setup_err)?;
        Ok(WebRtcChannel::new(dc) as Arc<dyn DataChannel>)
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
        let _ = self.pc.close().await;
    }
}

fn build_description(
    kind: DescriptionKind,
    sdp: &str,
) -> Result<RTCSessionDescription, TransportError> {
    match kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(sdp.to_string()),
        DescriptionKind::Answer => RTCSessionDescription::answer(sdp.to_string()),
    }
    .map_err(negotiation_err)
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    messages: Arc<SinkCell<String>>,
    opens: Arc<SinkCell<()>>,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let messages = Arc::new(SinkCell::new());
        let opens = Arc::new(SinkCell::new());

        let message_cell = messages.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let cell = message_cell.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => cell.emit(text),
                    Err(_) => tracing::warn!(
                        target = "tincan::transport",
                        "dropping non-utf8 data channel message"
                    ),
                }
            })
        }));

        let open_cell = opens.clone();
        dc.on_open(Box::new(move || {
            let cell = open_cell.clone();
            Box::pin(async move {
                cell.emit(());
            })
        }));

        Arc::new(Self {
            dc,
            messages,
            opens,
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.dc
            .send(&Bytes::from(text.to_string()))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))?;
        Ok(())
    }

    fn on_message(&self, sink: MessageSink) {
        self.messages.install(sink);
    }

    fn on_open(&self, sink: OpenSink) {
        self.opens.install(Arc::new(move |()| sink()));
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}
