pub mod protocol;
pub mod transport;

pub use protocol::{IncomingMessage, OutgoingMessage, RoomJoined};
pub use transport::{
    Dialer, FrameSink, FrameStream, ReconnectPolicy, SignalingConnection, TransportEvent,
    TransportHandler, TransportNotice, TransportState, WsDialer,
};
