use crate::error::{Error, Result};
use crate::peer::types::{IceCandidate, NegotiationRole, SessionDescription};
use serde::{Deserialize, Serialize};

/// Сообщения клиента
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutgoingMessage {
    JoinRoom { room_id: String },
    LeaveRoom,
    Offer { offer: SessionDescription },
    Answer { answer: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

impl OutgoingMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutgoingMessage::JoinRoom { .. } => "join-room",
            OutgoingMessage::LeaveRoom => "leave-room",
            OutgoingMessage::Offer { .. } => "offer",
            OutgoingMessage::Answer { .. } => "answer",
            OutgoingMessage::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Ответ сервера на `join-room`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomJoined {
    pub success: bool,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub is_room_full: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user_count: Option<u32>,
    #[serde(default)]
    pub other_users: Vec<String>,
    /// Явная роль, если её назначает сервер
    #[serde(default)]
    pub role: Option<NegotiationRole>,
}

/// Отказ сервера, когда участник уже числится в этой комнате
pub const ALREADY_IN_ROOM: &str = "您已在此房间中";

impl RoomJoined {
    /// Сервер ещё держит нас в комнате со старого сокета
    pub fn already_member(&self) -> bool {
        !self.success && self.message.as_deref() == Some(ALREADY_IN_ROOM)
    }
}

/// Сообщения сервера
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IncomingMessage {
    RoomJoined(RoomJoined),
    UserJoined {
        user_id: String,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        role: Option<NegotiationRole>,
    },
    Offer {
        offer: SessionDescription,
        #[serde(default)]
        from: Option<String>,
    },
    Answer {
        answer: SessionDescription,
        #[serde(default)]
        from: Option<String>,
    },
    IceCandidate {
        candidate: IceCandidate,
        #[serde(default)]
        from: Option<String>,
    },
    UserLeft {
        user_id: String,
        #[serde(default)]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    RoomReset {
        #[serde(default)]
        message: Option<String>,
    },
    RoomsReset {
        #[serde(default)]
        message: Option<String>,
    },
}

impl IncomingMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("bad signaling frame: {e}")))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IncomingMessage::RoomJoined(_) => "room-joined",
            IncomingMessage::UserJoined { .. } => "user-joined",
            IncomingMessage::Offer { .. } => "offer",
            IncomingMessage::Answer { .. } => "answer",
            IncomingMessage::IceCandidate { .. } => "ice-candidate",
            IncomingMessage::UserLeft { .. } => "user-left",
            IncomingMessage::Error { .. } => "error",
            IncomingMessage::RoomReset { .. } => "room-reset",
            IncomingMessage::RoomsReset { .. } => "rooms-reset",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outgoing_shapes() {
        let join = OutgoingMessage::JoinRoom {
            room_id: "ABCD".into(),
        };
        assert_eq!(
            serde_json::to_value(&join).unwrap(),
            json!({"type": "join-room", "room_id": "ABCD"})
        );
        assert_eq!(
            serde_json::to_value(OutgoingMessage::LeaveRoom).unwrap(),
            json!({"type": "leave-room"})
        );
        let offer = OutgoingMessage::Offer {
            offer: SessionDescription::offer("v=0"),
        };
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            json!({"type": "offer", "offer": {"type": "offer", "sdp": "v=0"}})
        );
    }

    #[test]
    fn test_room_joined_from_service() {
        let frame = r#"{"type":"room-joined","success":true,"room_id":"ABCD","user_count":2,
            "other_users":["alice"],"is_room_full":true,"message":"成功加入房间 ABCD"}"#;
        match IncomingMessage::parse(frame).unwrap() {
            IncomingMessage::RoomJoined(joined) => {
                assert!(joined.success);
                assert!(joined.is_room_full);
                assert_eq!(joined.other_users, vec!["alice".to_string()]);
                assert_eq!(joined.role, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejection_without_room_fields() {
        let frame = r#"{"type":"room-joined","success":false,"message":"房间已满"}"#;
        match IncomingMessage::parse(frame).unwrap() {
            IncomingMessage::RoomJoined(joined) => {
                assert!(!joined.success);
                assert!(!joined.is_room_full);
                assert_eq!(joined.room_id, None);
                assert!(!joined.already_member());
            }
            other => panic!("unexpected {other:?}"),
        }

        let frame = r#"{"type":"room-joined","success":false,"message":"您已在此房间中"}"#;
        match IncomingMessage::parse(frame).unwrap() {
            IncomingMessage::RoomJoined(joined) => assert!(joined.already_member()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_explicit_role() {
        let frame = r#"{"type":"user-joined","user_id":"bob","role":"answerer"}"#;
        assert_eq!(
            IncomingMessage::parse(frame).unwrap(),
            IncomingMessage::UserJoined {
                user_id: "bob".into(),
                message: None,
                role: Some(NegotiationRole::Answerer),
            }
        );
    }

    #[test]
    fn test_forwarded_candidate() {
        let frame = r#"{"type":"ice-candidate","from":"alice","candidate":
            {"candidate":"candidate:1 1 udp 1 10.0.0.1 1 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let msg = IncomingMessage::parse(frame).unwrap();
        assert_eq!(msg.kind(), "ice-candidate");
    }

    #[test]
    fn test_unknown_and_malformed_frames() {
        assert!(matches!(
            IncomingMessage::parse(r#"{"type":"emotion-update","score":1}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            IncomingMessage::parse(r#"{"type":"offer"}"#),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(IncomingMessage::parse("not json"), Err(Error::Protocol(_))));
    }
}
