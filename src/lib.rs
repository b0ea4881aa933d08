pub mod codec;
pub mod config;
pub mod identity;
pub mod keystore;
pub mod manager;
pub mod session;
pub mod signaling;
pub mod transport;

pub use codec::{ChannelFrame, CipherEnvelope, CodecError, SecureChannelCodec};
pub use config::Config;
pub use identity::{Directory, IdentityCrypto, IdentityError, StaticDirectory};
pub use keystore::{KeyStoreError, SessionKeyStore};
pub use manager::{Callbacks, ManagerDeps, NegotiationError, PeerManager};
pub use session::SessionState;
pub use signaling::{
    AnswerPayload, IceServers, OfferPayload, SdpKind, SignalEnvelope, SignalKind, SignalingApi,
    SignalingError, TurnServer, WirePayload,
};
pub use transport::{
    DataChannel, DescriptionKind, PeerTransport, TransportError, TransportFactory, TransportPhase,
};
