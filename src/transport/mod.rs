use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::signaling::IceServers;

pub mod mock;
pub mod webrtc;

pub use self::mock::{MockFactory, MockHub, MockTransport};
pub use self::webrtc::WebRtcFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// Connection lifecycle as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel send failed: {0}")]
    Send(String),
    #[error("data channel closed")]
    ChannelClosed,
}

/// Network-path candidate as exchanged through signaling. Adapters convert
/// to and from their library-native candidate type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateBlob {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

pub type CandidateSink = Arc<dyn Fn(Value) + Send + Sync>;
pub type PhaseSink = Arc<dyn Fn(TransportPhase) + Send + Sync>;
pub type ChannelSink = Arc<dyn Fn(Arc<dyn DataChannel>) + Send + Sync>;
pub type MessageSink = Arc<dyn Fn(String) + Send + Sync>;
pub type OpenSink = Arc<dyn Fn() + Send + Sync>;

/// Capability surface of one peer-to-peer connection attempt. The
/// negotiation core talks only to this trait; concrete transports plug in
/// underneath it.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String, TransportError>;
    async fn create_answer(&self) -> Result<String, TransportError>;
    async fn set_local_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), TransportError>;
    async fn add_remote_candidate(&self, candidate: Value) -> Result<(), TransportError>;
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;
    fn on_local_candidate(&self, sink: CandidateSink);
    fn on_phase_change(&self, sink: PhaseSink);
    fn on_data_channel(&self, sink: ChannelSink);
    async fn close(&self);
}

/// Bidirectional ordered text stream atop an established transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;
    fn on_message(&self, sink: MessageSink);
    fn on_open(&self, sink: OpenSink);
    async fn close(&self);
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, ice: &IceServers) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// Event slot that buffers emissions until a sink is installed, so nothing
/// fired between transport creation and manager wiring is lost.
pub(crate) struct SinkCell<T> {
    inner: Mutex<SinkCellInner<T>>,
}

struct SinkCellInner<T> {
    sink: Option<Arc<dyn Fn(T) + Send + Sync>>,
    pending: Vec<T>,
}

impl<T> SinkCell<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SinkCellInner {
                sink: None,
                pending: Vec::new(),
            }),
        }
    }

    pub(crate) fn install(&self, sink: Arc<dyn Fn(T) + Send + Sync>) {
        let pending = {
            let mut guard = self.inner.lock();
            guard.sink = Some(sink.clone());
            std::mem::take(&mut guard.pending)
        };
        for value in pending {
            sink(value);
        }
    }

    pub(crate) fn emit(&self, value: T) {
        let sink = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match &inner.sink {
                Some(sink) => sink.clone(),
                None => {
                    inner.pending.push(value);
                    return;
                }
            }
        };
        sink(value);
    }
}
