use crate::media::MediaError;
use std::fmt;
use std::time::Duration;

/// Result с ошибкой крейта
pub type Result<T> = std::result::Result<T, Error>;

/// Операции с ограничением по времени
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AcquireMedia,
    TransportOpen,
    Probe,
    IceCheck,
    SessionWait,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::AcquireMedia => "media acquisition",
            Operation::TransportOpen => "signaling connect",
            Operation::Probe => "rendezvous probe",
            Operation::IceCheck => "ICE server check",
            Operation::SessionWait => "waiting for session state",
        };
        f.write_str(name)
    }
}

/// Ошибки оркестратора звонка
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Signaling transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(Operation, Duration),

    #[error("Media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Room join rejected: {0}")]
    RoomRejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session is no longer running")]
    SessionClosed,

    #[error("Room admin API error: {0}")]
    Admin(#[from] reqwest::Error),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Ошибки транспорта лечатся переподключением
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::TransportUnavailable(_)
                | Error::WebSocket(_)
                | Error::Timeout(Operation::TransportOpen, _)
        )
    }

    /// Можно повторить без участия пользователя
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || matches!(self, Error::Timeout(Operation::Probe, _) | Error::Io(_))
    }
}
