use crate::peer::types::{LinkState, NegotiationRole};
use serde::Serialize;
use std::fmt;

/// Стадия звонка, видимая UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    AcquiringMedia,
    Connecting,
    WaitingForPeer,
    Negotiating,
    Connected,
    Ended,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Ended | Phase::Failed)
    }

    /// Join из любой другой стадии ничего не делает
    pub fn accepts_join(self) -> bool {
        matches!(self, Phase::Idle | Phase::Ended | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::AcquiringMedia => "acquiring media",
            Phase::Connecting => "connecting",
            Phase::WaitingForPeer => "waiting for peer",
            Phase::Negotiating => "negotiating",
            Phase::Connected => "connected",
            Phase::Ended => "ended",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Состояние комнаты по сообщениям сервера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RoomMembership {
    WaitingAlone,
    PairedReady,
}

/// Снимок состояния после каждого события
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub local_id: String,
    pub phase: Phase,
    pub room_id: Option<String>,
    /// Только для показа, логика на него не опирается
    pub status_message: String,
    pub role: Option<NegotiationRole>,
    pub membership: Option<RoomMembership>,
    pub remote_id: Option<String>,
    pub link_id: Option<u64>,
    pub link_state: Option<LinkState>,
    pub signaling_id: Option<u64>,
    /// Сколько раз сессия пыталась войти
    pub attempt: u64,
    pub media_held: bool,
}

impl SessionStatus {
    pub fn idle(local_id: &str) -> Self {
        Self {
            local_id: local_id.to_string(),
            phase: Phase::Idle,
            room_id: None,
            status_message: "Ready".into(),
            role: None,
            membership: None,
            remote_id: None,
            link_id: None,
            link_state: None,
            signaling_id: None,
            attempt: 0,
            media_held: false,
        }
    }

    /// После завершения ничего не удерживается
    pub fn is_released(&self) -> bool {
        !self.media_held && self.link_id.is_none() && self.signaling_id.is_none()
    }
}
