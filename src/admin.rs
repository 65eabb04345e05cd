use crate::error::{Error, Operation, Result};
use crate::utils::normalize_room_id;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// `GET /`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub connected_users: u32,
    #[serde(default)]
    pub active_rooms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub user_count: u32,
    pub created_at: NaiveDateTime,
}

/// `GET /api/rooms`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomList {
    pub rooms: Vec<RoomInfo>,
    #[serde(default)]
    pub total_rooms: u32,
    #[serde(default)]
    pub connected_users: u32,
}

/// Ответ обоих reset-эндпоинтов
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    /// Только у reset-all
    #[serde(default)]
    pub rooms_cleared: Option<u32>,
}

pub struct RoomAdmin {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl RoomAdmin {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!("not an HTTP URL: {base}")));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base, timeout })
    }

    /// Жив ли сервис
    pub async fn probe(&self) -> Result<ServiceStatus> {
        let status: ServiceStatus = self.get("/").await?;
        info!(
            "Signaling service {}: {} users, {} rooms",
            status.status, status.connected_users, status.active_rooms
        );
        Ok(status)
    }

    pub async fn list_rooms(&self) -> Result<RoomList> {
        self.get("/api/rooms").await
    }

    /// Все клиенты получают `rooms-reset`
    pub async fn reset_all_rooms(&self) -> Result<ResetOutcome> {
        self.delete("/api/reset-rooms").await
    }

    /// Участники комнаты получают `room-reset`
    pub async fn reset_room(&self, room_id: &str) -> Result<ResetOutcome> {
        let room = normalize_room_id(room_id);
        if room.is_empty() {
            return Err(Error::InvalidConfig("room id must not be empty".into()));
        }
        self.delete(&format!("/api/reset-room/{room}")).await
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path
        ))?)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!("GET {}", url);
        let response = self.client.get(url).send().await.map_err(|e| self.map_err(e))?;
        self.decode(response).await
    }

    async fn delete<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!("DELETE {}", url);
        let response = self.client.delete(url).send().await.map_err(|e| self.map_err(e))?;
        self.decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = response.error_for_status()?;
        let body = response.text().await.map_err(|e| self.map_err(e))?;
        Ok(serde_json::from_str(&body)?)
    }

    fn map_err(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(Operation::Probe, self.timeout)
        } else if e.is_connect() {
            Error::TransportUnavailable(format!("{}: {e}", self.base))
        } else {
            Error::Admin(e)
        }
    }
}
