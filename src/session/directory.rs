use crate::session::handle::SessionHandle;
use crate::utils::normalize_room_id;
use dashmap::DashMap;
use tracing::{debug, info};

/// Сессии по id участника, для административных команд
#[derive(Default)]
pub struct SessionDirectory {
    sessions: DashMap<String, SessionHandle>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Возвращает прежний handle с тем же id
    pub fn insert(&self, handle: SessionHandle) -> Option<SessionHandle> {
        debug!(user = handle.local_id(), "session registered");
        self.sessions.insert(handle.local_id().to_string(), handle)
    }

    pub fn get(&self, local_id: &str) -> Option<SessionHandle> {
        self.sessions.get(local_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, local_id: &str) -> Option<SessionHandle> {
        self.sessions.remove(local_id).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Сколько живых сессий получили сброс
    pub fn reset_all(&self, reason: &str) -> usize {
        let count = self.reset_where(reason, |_| true);
        info!("reset {count} sessions: {reason}");
        count
    }

    pub fn reset_room(&self, room_id: &str, reason: &str) -> usize {
        let room = normalize_room_id(room_id);
        let count = self.reset_where(reason, |handle| handle.status().room_id.as_deref() == Some(room.as_str()));
        info!(room = %room, "reset {count} sessions: {reason}");
        count
    }

    fn reset_where<F>(&self, reason: &str, matches: F) -> usize
    where
        F: Fn(&SessionHandle) -> bool,
    {
        // собираем handle-ы, чтобы не держать shard lock во время отправки
        let targets: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().status().phase.is_terminal())
            .filter(|entry| matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        targets
            .iter()
            .filter(|handle| handle.force_reset(reason).is_ok())
            .count()
    }
}
