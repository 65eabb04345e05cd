use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::media::{acquire_media, MediaHandle, MediaSource, TrackMediaSource};
use crate::peer::connection::RtcPeerFactory;
use crate::peer::negotiation::{PeerFactory, PeerHandler, PeerLink, PeerSignal};
use crate::peer::types::{LinkState, NegotiationRole, SdpKind, SessionDescription};
use crate::session::state::{Phase, RoomMembership, SessionStatus};
use crate::signaling::protocol::{IncomingMessage, OutgoingMessage, RoomJoined};
use crate::signaling::transport::{
    Dialer, ReconnectPolicy, SignalingConnection, TransportEvent, TransportHandler, TransportNotice, WsDialer,
};
use crate::utils::{generate_room_id, normalize_room_id};
use std::sync::Arc;
use tokio::sync::mpsc::WeakUnboundedSender;
use tracing::{debug, error, info, warn};

/// Внешние зависимости сессии
#[derive(Clone)]
pub struct Backends {
    pub dialer: Arc<dyn Dialer>,
    pub media: Arc<dyn MediaSource>,
    pub peers: Arc<dyn PeerFactory>,
}

impl Backends {
    /// WebSocket сигналинг, sample-треки и webrtc-rs
    pub fn production(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            dialer: Arc::new(WsDialer::new(&config.signaling_url)?),
            media: Arc::new(TrackMediaSource::default()),
            peers: Arc::new(RtcPeerFactory::new(config.ice_servers.clone())),
        })
    }
}

/// Команды от UI или каталога сессий
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { room_id: String },
    Leave,
    ForceReset { reason: String },
}

pub(crate) enum Event {
    Command(Command),
    MediaReady {
        attempt: u64,
        result: Result<MediaHandle>,
    },
    Transport(TransportEvent),
    Peer {
        link_id: u64,
        signal: PeerSignal,
    },
}

fn post(events: &WeakUnboundedSender<Event>, event: Event) {
    if let Some(tx) = events.upgrade() {
        // очередь закрыта - сессия уже завершилась
        let _ = tx.send(event);
    }
}

pub(crate) struct Session {
    local_id: String,
    config: ClientConfig,
    backends: Backends,
    events: WeakUnboundedSender<Event>,
    phase: Phase,
    room_id: Option<String>,
    status_message: String,
    role: Option<NegotiationRole>,
    advertised_role: Option<NegotiationRole>,
    rejoining: bool,
    membership: Option<RoomMembership>,
    remote_id: Option<String>,
    attempt: u64,
    media: Option<MediaHandle>,
    signaling: Option<SignalingConnection>,
    link: Option<PeerLink>,
}

impl Session {
    pub(crate) fn new(
        local_id: String,
        config: ClientConfig,
        backends: Backends,
        events: WeakUnboundedSender<Event>,
    ) -> Self {
        let idle = SessionStatus::idle(&local_id);
        Self {
            local_id,
            config,
            backends,
            events,
            phase: idle.phase,
            room_id: None,
            status_message: idle.status_message,
            role: None,
            advertised_role: None,
            rejoining: false,
            membership: None,
            remote_id: None,
            attempt: 0,
            media: None,
            signaling: None,
            link: None,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus {
            local_id: self.local_id.clone(),
            phase: self.phase,
            room_id: self.room_id.clone(),
            status_message: self.status_message.clone(),
            role: self.role,
            membership: self.membership,
            remote_id: self.remote_id.clone(),
            link_id: self.link.as_ref().map(PeerLink::id),
            link_state: self.link.as_ref().map(PeerLink::connection_state),
            signaling_id: self.signaling.as_ref().map(SignalingConnection::id),
            attempt: self.attempt,
            media_held: self.media.is_some(),
        }
    }

    pub(crate) fn handle(&mut self, event: Event) {
        match event {
            Event::Command(Command::Join { room_id }) => self.join(&room_id),
            Event::Command(Command::Leave) => self.leave(),
            Event::Command(Command::ForceReset { reason }) => self.force_reset(reason),
            Event::MediaReady { attempt, result } => self.on_media_ready(attempt, result),
            Event::Transport(event) => self.on_transport(event),
            Event::Peer { link_id, signal } => self.on_peer(link_id, signal),
        }
    }

    /// Все handle отпущены
    pub(crate) fn shutdown(&mut self) {
        if !self.phase.is_terminal() && self.phase != Phase::Idle {
            self.teardown(Phase::Ended, "Session closed".into());
        }
    }

    fn join(&mut self, raw_room: &str) {
        if !self.phase.accepts_join() {
            debug!(user = %self.local_id, phase = %self.phase, "join ignored, attempt already running");
            return;
        }
        let room = match normalize_room_id(raw_room) {
            room if room.is_empty() => generate_room_id(),
            room => room,
        };
        self.attempt += 1;
        self.role = None;
        self.advertised_role = None;
        self.rejoining = false;
        self.membership = None;
        self.remote_id = None;
        self.room_id = Some(room.clone());
        info!(user = %self.local_id, room = %room, attempt = self.attempt, "joining room");
        self.set_phase(Phase::AcquiringMedia, "Requesting camera and microphone".into());

        let source = self.backends.media.clone();
        let constraints = self.config.media.clone();
        let limit = self.config.media_timeout();
        let events = self.events.clone();
        let attempt = self.attempt;
        tokio::spawn(async move {
            let result = acquire_media(source, &constraints, limit).await;
            post(&events, Event::MediaReady { attempt, result });
        });
    }

    fn leave(&mut self) {
        if self.phase.is_terminal() || self.phase == Phase::Idle {
            debug!(user = %self.local_id, phase = %self.phase, "leave ignored");
            return;
        }
        self.teardown(Phase::Ended, "Left the room".into());
    }

    fn force_reset(&mut self, reason: String) {
        if self.phase.is_terminal() {
            return;
        }
        warn!(user = %self.local_id, "forced reset: {reason}");
        self.teardown(Phase::Ended, reason);
    }

    fn on_media_ready(&mut self, attempt: u64, result: Result<MediaHandle>) {
        if attempt != self.attempt || self.phase != Phase::AcquiringMedia {
            // handle освобождается при drop
            debug!(user = %self.local_id, attempt, "late media acquisition discarded");
            return;
        }
        match result {
            Ok(handle) => {
                self.media = Some(handle);
                self.open_signaling();
                self.set_phase(Phase::Connecting, "Connecting to signaling server".into());
            }
            Err(e) => self.fail(e),
        }
    }

    fn open_signaling(&mut self) {
        let events = self.events.clone();
        let handler: TransportHandler = Arc::new(move |event| post(&events, Event::Transport(event)));
        let policy = ReconnectPolicy {
            delay: self.config.reconnect_delay(),
            max_attempts: self.config.max_reconnect_attempts,
        };
        self.signaling = Some(SignalingConnection::open(
            &self.local_id,
            self.backends.dialer.clone(),
            handler,
            policy,
            self.config.open_timeout(),
        ));
    }

    fn on_transport(&mut self, event: TransportEvent) {
        let Some(conn) = self.signaling.as_mut() else {
            debug!(user = %self.local_id, "transport event without a connection dropped");
            return;
        };
        let Some(notice) = conn.handle_event(event) else {
            return;
        };
        match notice {
            TransportNotice::Opened { reconnected } => self.on_transport_open(reconnected),
            TransportNotice::Message(message) => self.on_message(message),
            TransportNotice::Reconnecting { attempt, delay } => {
                self.status_message = format!(
                    "Connection lost, reconnecting in {:.1}s (attempt {}/{})",
                    delay.as_secs_f32(),
                    attempt,
                    self.config.max_reconnect_attempts
                );
                info!(user = %self.local_id, "{}", self.status_message);
            }
            TransportNotice::Abandoned { error } => {
                if self.phase == Phase::Connected {
                    self.teardown(Phase::Ended, format!("Signaling connection lost: {error}"));
                } else {
                    self.fail(error);
                }
            }
        }
    }

    fn on_transport_open(&mut self, reconnected: bool) {
        if reconnected {
            // прошлый peer link и членство в комнате больше не действительны
            if let Some(link) = self.link.take() {
                link.close();
            }
            self.role = None;
            self.advertised_role = None;
            self.membership = None;
            self.remote_id = None;
        }
        self.rejoining = reconnected;
        let Some(room) = self.room_id.clone() else {
            self.fail(Error::Protocol("transport opened without a room".into()));
            return;
        };
        if let Some(conn) = self.signaling.as_mut() {
            conn.send(&OutgoingMessage::JoinRoom {
                room_id: room.clone(),
            });
        }
        let text = if reconnected {
            format!("Reconnected, rejoining room {room}")
        } else {
            format!("Connected, joining room {room}")
        };
        self.set_phase(Phase::WaitingForPeer, text);
    }

    fn on_message(&mut self, message: IncomingMessage) {
        match message {
            IncomingMessage::RoomJoined(joined) => self.on_room_joined(joined),
            IncomingMessage::UserJoined { user_id, role, .. } => {
                if self.phase != Phase::WaitingForPeer || self.link.is_some() {
                    warn!(user = %self.local_id, phase = %self.phase, "user-joined out of phase ignored");
                    return;
                }
                info!(user = %self.local_id, peer = %user_id, "peer joined the room");
                self.remote_id = Some(user_id);
                let role = role.or(self.advertised_role).unwrap_or(NegotiationRole::Answerer);
                self.begin_negotiation(role);
            }
            IncomingMessage::Offer { offer, from } => {
                if self.phase == Phase::WaitingForPeer && self.link.is_none() {
                    // offer раньше user-joined: значит мы answerer
                    self.remote_id = from;
                    self.begin_negotiation(NegotiationRole::Answerer);
                }
                self.apply_description(offer, SdpKind::Offer);
            }
            IncomingMessage::Answer { answer, .. } => self.apply_description(answer, SdpKind::Answer),
            IncomingMessage::IceCandidate { candidate, .. } => {
                let Some(link) = self.link.as_mut() else {
                    warn!(user = %self.local_id, "ice-candidate without a negotiation ignored");
                    return;
                };
                match link.add_remote_candidate(candidate) {
                    Ok(_) => {}
                    Err(Error::Protocol(reason)) => warn!(user = %self.local_id, "{reason}"),
                    Err(e) => self.fail(e),
                }
            }
            IncomingMessage::UserLeft { user_id, .. } => match self.phase {
                Phase::Negotiating | Phase::Connected => {
                    self.teardown(Phase::Ended, format!("{user_id} left the room"));
                }
                Phase::WaitingForPeer => {
                    if let Some(link) = self.link.take() {
                        link.close();
                    }
                    self.role = self.advertised_role;
                    self.remote_id = None;
                    self.membership = Some(RoomMembership::WaitingAlone);
                    self.status_message = format!("{user_id} left, waiting for another participant");
                }
                _ => debug!(user = %self.local_id, "user-left ignored in {}", self.phase),
            },
            IncomingMessage::Error { message } => {
                error!(user = %self.local_id, "signaling service error: {message}");
                self.teardown(Phase::Failed, message);
            }
            IncomingMessage::RoomReset { message } | IncomingMessage::RoomsReset { message } => {
                let reason = message.unwrap_or_else(|| "Room was reset by the server".into());
                self.force_reset(reason);
            }
        }
    }

    fn on_room_joined(&mut self, joined: RoomJoined) {
        if self.phase != Phase::WaitingForPeer {
            warn!(user = %self.local_id, phase = %self.phase, "room-joined out of phase ignored");
            return;
        }
        let rejoining = std::mem::take(&mut self.rejoining);
        if !joined.success {
            if rejoining && joined.already_member() {
                // сервер ещё не заметил закрытия старого сокета
                let room = self.room_id.clone().unwrap_or_default();
                self.membership = Some(RoomMembership::WaitingAlone);
                self.status_message = format!("Already in room {room}, waiting for the other participant");
                info!(user = %self.local_id, room = %room, "rejoin found the old membership");
                return;
            }
            let reason = joined.message.unwrap_or_else(|| "join request refused".into());
            self.fail(Error::RoomRejected(reason));
            return;
        }
        if let Some(room) = joined.room_id.as_deref() {
            self.room_id = Some(normalize_room_id(room));
        }
        let room = self.room_id.clone().unwrap_or_default();
        if joined.is_room_full {
            self.remote_id = joined.other_users.first().cloned();
            self.begin_negotiation(joined.role.unwrap_or(NegotiationRole::Offerer));
            return;
        }
        // назначенная роль вступит в силу с user-joined
        self.advertised_role = joined.role;
        self.role = joined.role;
        self.membership = Some(RoomMembership::WaitingAlone);
        self.status_message = format!("Waiting for the other participant in room {room}");
        info!(user = %self.local_id, room = %room, "waiting alone in room");
    }

    fn begin_negotiation(&mut self, role: NegotiationRole) {
        if let Some(old) = self.link.take() {
            old.close();
        }
        let tracks = self
            .media
            .as_ref()
            .map(|m| m.tracks().to_vec())
            .unwrap_or_default();
        let events = self.events.clone();
        let link = PeerLink::spawn(role, self.backends.peers.clone(), tracks, move |link_id| {
            let handler: PeerHandler = Arc::new(move |signal| post(&events, Event::Peer { link_id, signal }));
            handler
        });
        info!(user = %self.local_id, link = link.id(), %role, "starting negotiation");
        self.link = Some(link);
        self.role = Some(role);
        self.membership = Some(RoomMembership::PairedReady);
        self.set_phase(Phase::Negotiating, format!("Peer found, negotiating as {role}"));

        let offered = self
            .link
            .as_mut()
            .filter(|link| link.role() == NegotiationRole::Offerer)
            .map(PeerLink::create_offer);
        if let Some(Err(e)) = offered {
            self.fail(e);
        }
    }

    fn apply_description(&mut self, desc: SessionDescription, expected: SdpKind) {
        let Some(link) = self.link.as_mut() else {
            warn!(user = %self.local_id, "{:?} without a negotiation ignored", expected);
            return;
        };
        if desc.kind != expected {
            warn!(user = %self.local_id, "description type {:?} does not match message", desc.kind);
            return;
        }
        let applied = match expected {
            SdpKind::Offer => link.accept_offer(desc),
            SdpKind::Answer => link.accept_answer(desc),
        };
        match applied {
            Ok(()) => {}
            Err(Error::Protocol(reason)) => warn!(user = %self.local_id, "{reason}"),
            Err(e) => self.fail(e),
        }
    }

    fn on_peer(&mut self, link_id: u64, signal: PeerSignal) {
        let Some(link) = self.link.as_mut().filter(|l| l.id() == link_id) else {
            debug!(user = %self.local_id, link = link_id, "stale peer event dropped");
            return;
        };
        match signal {
            PeerSignal::LocalDescription(desc) => {
                if let Err(e) = link.on_local_description(desc.clone()) {
                    warn!(user = %self.local_id, "{e}");
                    return;
                }
                let message = match desc.kind {
                    SdpKind::Offer => OutgoingMessage::Offer { offer: desc },
                    SdpKind::Answer => OutgoingMessage::Answer { answer: desc },
                };
                if let Some(conn) = self.signaling.as_mut() {
                    conn.send(&message);
                    link.mark_local_sent();
                }
                self.flush_candidates();
            }
            PeerSignal::LocalCandidate(candidate) => {
                link.push_local_candidate(candidate);
                self.flush_candidates();
            }
            PeerSignal::GatheringComplete => link.gathered().log(),
            PeerSignal::StateChanged(state) => {
                if !link.set_connection_state(state) {
                    return;
                }
                match state {
                    LinkState::Connected if self.phase == Phase::Negotiating => {
                        let peer = self.remote_id.clone().unwrap_or_else(|| "peer".into());
                        self.set_phase(Phase::Connected, format!("In call with {peer}"));
                    }
                    LinkState::Failed => {
                        self.fail(Error::NegotiationFailed("peer connection failed".into()));
                    }
                    LinkState::Disconnected => {
                        self.teardown(Phase::Ended, "Peer connection lost".into());
                    }
                    _ => {}
                }
            }
            PeerSignal::Failed(reason) => self.fail(Error::NegotiationFailed(reason)),
        }
    }

    fn flush_candidates(&mut self) {
        let (Some(link), Some(conn)) = (self.link.as_mut(), self.signaling.as_mut()) else {
            return;
        };
        for candidate in link.take_flushable(conn.is_open()) {
            conn.send(&OutgoingMessage::IceCandidate { candidate });
        }
    }

    fn fail(&mut self, error: Error) {
        error!(user = %self.local_id, phase = %self.phase, "session failed: {error}");
        self.teardown(Phase::Failed, error.to_string());
    }

    /// Освобождает peer link, сигналинг и медиа за один шаг
    fn teardown(&mut self, phase: Phase, message: String) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        if let Some(mut conn) = self.signaling.take() {
            // сервер должен освободить место в комнате
            if conn.is_open() {
                conn.send(&OutgoingMessage::LeaveRoom);
            }
            conn.close();
        }
        if let Some(media) = self.media.take() {
            media.release();
        }
        self.role = None;
        self.membership = None;
        self.set_phase(phase, message);
    }

    fn set_phase(&mut self, phase: Phase, message: String) {
        if self.phase != phase {
            info!(user = %self.local_id, from = %self.phase, to = %phase, "{message}");
        }
        self.phase = phase;
        self.status_message = message;
    }
}
