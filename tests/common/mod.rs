//! In-memory collaborators for session tests
#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use roomcall_lib::media::{LocalTrack, MediaConstraints, MediaError, MediaSource, TrackKind};
use roomcall_lib::peer::{
    IceCandidate, LinkState, PeerBackend, PeerFactory, PeerHandler, PeerSignal, SessionDescription,
};
use roomcall_lib::signaling::{Dialer, FrameSink, FrameStream};
use roomcall_lib::{Backends, ClientConfig, Error, Result, SessionHandle};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> ClientConfig {
    ClientConfig {
        reconnect_delay_ms: 50,
        max_reconnect_attempts: 3,
        media_timeout_ms: 2000,
        open_timeout_ms: 1000,
        ..Default::default()
    }
}

struct Client {
    serial: u64,
    outbox: fmpsc::UnboundedSender<Result<String>>,
}

#[derive(Default)]
struct Rooms {
    clients: HashMap<String, Client>,
    user_rooms: HashMap<String, String>,
    rooms: HashMap<String, Vec<String>>,
    roles: HashMap<String, String>,
}

impl Rooms {
    fn send(&self, user: &str, message: Value) {
        if let Some(client) = self.clients.get(user) {
            let _ = client.outbox.unbounded_send(Ok(message.to_string()));
        }
    }

    fn other(&self, user: &str) -> Option<String> {
        let room = self.user_rooms.get(user)?;
        self.rooms.get(room)?.iter().find(|u| *u != user).cloned()
    }

    fn leave(&mut self, user: &str) -> Option<String> {
        let room = self.user_rooms.remove(user)?;
        if let Some(users) = self.rooms.get_mut(&room) {
            users.retain(|u| u != user);
            if users.is_empty() {
                self.rooms.remove(&room);
            }
        }
        Some(room)
    }

    fn broadcast(&self, room: &str, exclude: &str, message: Value) {
        if let Some(users) = self.rooms.get(room) {
            for user in users.iter().filter(|u| *u != exclude) {
                self.send(user, message.clone());
            }
        }
    }

    fn join(&mut self, user: &str, room: &str) {
        if room.is_empty() {
            self.send(user, json!({"type": "error", "message": "房间号不能为空"}));
            return;
        }
        if let Some(old) = self.user_rooms.get(user).cloned() {
            if old == room {
                self.send(
                    user,
                    json!({"type": "room-joined", "success": false, "message": "您已在此房间中"}),
                );
                return;
            }
            self.leave(user);
        }
        let users = self.rooms.entry(room.to_string()).or_default();
        if users.len() >= 2 {
            self.send(
                user,
                json!({"type": "room-joined", "success": false, "message": "房间已满（最多2人）"}),
            );
            return;
        }
        users.push(user.to_string());
        let count = users.len();
        let others: Vec<String> = users.iter().filter(|u| *u != user).cloned().collect();
        self.user_rooms.insert(user.to_string(), room.to_string());
        let mut reply = json!({
            "type": "room-joined",
            "success": true,
            "room_id": room,
            "user_count": count,
            "other_users": others,
            "is_room_full": count == 2,
        });
        if let Some(role) = self.roles.get(user) {
            reply["role"] = Value::String(role.clone());
        }
        self.send(user, reply);
        if !others.is_empty() {
            self.broadcast(
                room,
                user,
                json!({"type": "user-joined", "user_id": user, "message": format!("用户 {user} 加入了房间")}),
            );
        }
    }

    fn handle(&mut self, user: &str, frame: &str) {
        let Ok(message) = serde_json::from_str::<Value>(frame) else {
            return;
        };
        let kind = message["type"].as_str().unwrap_or_default().to_string();
        match kind.as_str() {
            "join-room" => {
                let room = message["room_id"].as_str().unwrap_or_default().to_string();
                self.join(user, &room);
            }
            "leave-room" => {
                if let Some(room) = self.user_rooms.get(user).cloned() {
                    self.broadcast(
                        &room,
                        user,
                        json!({"type": "user-left", "user_id": user, "message": format!("用户 {user} 离开了房间")}),
                    );
                    self.leave(user);
                }
            }
            "offer" | "answer" | "ice-candidate" => {
                if !self.user_rooms.contains_key(user) {
                    if kind != "ice-candidate" {
                        self.send(user, json!({"type": "error", "message": "您还未加入房间"}));
                    }
                    return;
                }
                let field = match kind.as_str() {
                    "offer" => "offer",
                    "answer" => "answer",
                    _ => "candidate",
                };
                if let Some(target) = self.other(user) {
                    let mut forwarded = serde_json::Map::new();
                    forwarded.insert("type".into(), Value::String(kind.clone()));
                    forwarded.insert("from".into(), Value::String(user.to_string()));
                    forwarded.insert(field.into(), message[field].clone());
                    self.send(&target, Value::Object(forwarded));
                }
            }
            _ => {}
        }
    }

    fn disconnect(&mut self, user: &str) {
        self.clients.remove(user);
        if let Some(room) = self.user_rooms.get(user).cloned() {
            self.broadcast(
                &room,
                user,
                json!({"type": "user-left", "user_id": user, "message": format!("用户 {user} 已离开房间")}),
            );
            self.leave(user);
        }
    }
}

/// Rendezvous service with the room rules of the production server
#[derive(Clone, Default)]
pub struct Rendezvous {
    rooms: Arc<Mutex<Rooms>>,
    dials: Arc<Mutex<HashMap<String, usize>>>,
    received: Arc<Mutex<Vec<(String, String)>>>,
    refuse: Arc<AtomicBool>,
    stall: Arc<AtomicBool>,
    serial: Arc<AtomicU64>,
}

impl Rendezvous {
    pub fn dials(&self, user: &str) -> usize {
        self.dials.lock().unwrap().get(user).copied().unwrap_or(0)
    }

    /// Message types received from `user`, in order
    pub fn received_from(&self, user: &str) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, kind)| kind.clone())
            .collect()
    }

    pub fn room_members(&self, room: &str) -> Vec<String> {
        self.rooms.lock().unwrap().rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Dials are accepted but never complete
    pub fn set_stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    /// Server drops the user's socket
    pub fn kick(&self, user: &str) {
        self.rooms.lock().unwrap().disconnect(user);
    }

    /// Socket closes but the server keeps the user in the room
    pub fn drop_socket(&self, user: &str) {
        self.rooms.lock().unwrap().clients.remove(user);
    }

    /// `role` field added to the user's successful room-joined replies
    pub fn advertise_role(&self, user: &str, role: &str) {
        self.rooms
            .lock()
            .unwrap()
            .roles
            .insert(user.to_string(), role.to_string());
    }

    /// Arbitrary server message to a connected user
    pub fn push(&self, user: &str, message: Value) {
        self.rooms.lock().unwrap().send(user, message);
    }

    pub fn reset_room(&self, room: &str) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(users) = rooms.rooms.remove(room) {
            for user in &users {
                rooms.user_rooms.remove(user);
                rooms.send(
                    user,
                    json!({"type": "room-reset", "message": format!("房间 {room} 已被重置")}),
                );
            }
        }
    }

    pub fn reset_all(&self) {
        let mut rooms = self.rooms.lock().unwrap();
        rooms.rooms.clear();
        rooms.user_rooms.clear();
        let users: Vec<String> = rooms.clients.keys().cloned().collect();
        for user in users {
            rooms.send(&user, json!({"type": "rooms-reset", "message": "所有房间已被重置"}));
        }
    }
}

#[async_trait]
impl Dialer for Rendezvous {
    async fn dial(&self, local_id: &str) -> Result<(FrameSink, FrameStream)> {
        *self.dials.lock().unwrap().entry(local_id.to_string()).or_default() += 1;
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::TransportUnavailable("connection refused".into()));
        }
        if self.stall.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let (outbox, client_rx) = fmpsc::unbounded();
        let (client_tx, mut inbox) = fmpsc::unbounded::<String>();
        self.rooms.lock().unwrap().clients.insert(
            local_id.to_string(),
            Client { serial, outbox },
        );

        let user = local_id.to_string();
        let rooms = self.rooms.clone();
        let received = self.received.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbox.next().await {
                if let Ok(message) = serde_json::from_str::<Value>(&frame) {
                    let kind = message["type"].as_str().unwrap_or_default().to_string();
                    received.lock().unwrap().push((user.clone(), kind));
                }
                rooms.lock().unwrap().handle(&user, &frame);
            }
            let mut rooms = rooms.lock().unwrap();
            if rooms.clients.get(&user).map(|c| c.serial) == Some(serial) {
                rooms.disconnect(&user);
            }
        });

        let sink: FrameSink =
            Box::pin(client_tx.sink_map_err(|e| Error::TransportUnavailable(e.to_string())));
        let stream: FrameStream = Box::pin(client_rx);
        Ok((sink, stream))
    }
}

/// Media source that counts acquisitions and releases
pub struct CountingMedia {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    delay: Duration,
    deny: bool,
}

impl CountingMedia {
    pub fn new() -> Self {
        Self::with(Duration::ZERO, false)
    }

    pub fn with(delay: Duration, deny: bool) -> Self {
        Self {
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            delay,
            deny,
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for CountingMedia {
    async fn acquire(
        &self,
        _constraints: &MediaConstraints,
    ) -> std::result::Result<Vec<LocalTrack>, MediaError> {
        tokio::time::sleep(self.delay).await;
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(vec![LocalTrack::new(TrackKind::Audio, "test")])
    }

    fn release(&self, _tracks: &[LocalTrack]) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Peer that reaches Connected once both descriptions are set
struct FakePeer {
    handler: PeerHandler,
    local: AtomicBool,
    remote: AtomicBool,
    applied: Arc<Mutex<Vec<IceCandidate>>>,
    closed: Arc<AtomicUsize>,
    reject_remote: bool,
    tag: u64,
}

impl FakePeer {
    fn maybe_connect(&self) {
        if self.local.load(Ordering::SeqCst) && self.remote.load(Ordering::SeqCst) {
            (self.handler)(PeerSignal::StateChanged(LinkState::Checking));
            (self.handler)(PeerSignal::StateChanged(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerBackend for FakePeer {
    async fn attach_tracks(&self, _tracks: &[LocalTrack]) -> Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.tag)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.tag)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.local.store(true, Ordering::SeqCst);
        (self.handler)(PeerSignal::LocalCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host",
            self.tag,
            self.tag % 250
        ))));
        (self.handler)(PeerSignal::GatheringComplete);
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        if self.reject_remote {
            return Err(Error::NegotiationFailed("remote description rejected".into()));
        }
        self.remote.store(true, Ordering::SeqCst);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeers {
    pub created: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub applied: Arc<Mutex<Vec<IceCandidate>>>,
    handlers: Mutex<Vec<PeerHandler>>,
    reject_remote: AtomicBool,
    next_tag: AtomicU64,
}

impl FakePeers {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Peers created from now on fail `set_remote_description`
    pub fn reject_remote(&self, reject: bool) {
        self.reject_remote.store(reject, Ordering::SeqCst);
    }

    /// Reports `state` from every peer created so far
    pub fn emit_all(&self, state: LinkState) {
        let handlers = self.handlers.lock().unwrap().clone();
        for handler in handlers {
            handler(PeerSignal::StateChanged(state));
        }
    }
}

#[async_trait]
impl PeerFactory for FakePeers {
    async fn create(&self, handler: PeerHandler) -> Result<Arc<dyn PeerBackend>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().unwrap().push(handler.clone());
        Ok(Arc::new(FakePeer {
            handler,
            local: AtomicBool::new(false),
            remote: AtomicBool::new(false),
            applied: self.applied.clone(),
            closed: self.closed.clone(),
            reject_remote: self.reject_remote.load(Ordering::SeqCst),
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
        }))
    }
}

/// Everything one test world shares
pub struct World {
    pub rendezvous: Rendezvous,
    pub media: Arc<CountingMedia>,
    pub peers: Arc<FakePeers>,
}

impl World {
    pub fn new() -> Self {
        Self::with_media(CountingMedia::new())
    }

    pub fn with_media(media: CountingMedia) -> Self {
        Self {
            rendezvous: Rendezvous::default(),
            media: Arc::new(media),
            peers: Arc::new(FakePeers::default()),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            dialer: Arc::new(self.rendezvous.clone()),
            media: self.media.clone(),
            peers: self.peers.clone(),
        }
    }

    pub fn participant(&self, user: &str) -> SessionHandle {
        SessionHandle::spawn(user, test_config(), self.backends())
    }
}
