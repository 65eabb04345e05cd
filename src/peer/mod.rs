pub mod connection;
pub mod ice;
pub mod negotiation;
pub mod types;

pub use connection::RtcPeerFactory;
pub use negotiation::{PeerBackend, PeerFactory, PeerHandler, PeerLink, PeerSignal};
pub use types::{IceCandidate, LinkState, NegotiationRole, SdpKind, ServerConfig, SessionDescription};
