// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::{Error, Result};
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

const ENV_PREFIX: &str = "ROOMCALL_";

/// Публичные STUN сервера, если пользователь не задал свои
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "google-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "google-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Настройки клиента звонка
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// База WebSocket; id участника добавляется последним сегментом
    pub signaling_url: String,
    /// HTTP API управления комнатами
    pub api_url: String,
    pub ice_servers: Vec<ServerConfig>,
    pub media: MediaConstraints,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub media_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8000/ws".into(),
            api_url: "http://localhost:8000".into(),
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            media: MediaConstraints::default(),
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 3,
            media_timeout_ms: 8000,
            open_timeout_ms: 5000,
            probe_timeout_ms: 5000,
        }
    }
}

impl ClientConfig {
    /// Умолчания, затем JSON файл, затем переменные `ROOMCALL_*`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        debug!("Loaded client config from {}", path.display());
        Ok(config)
    }

    /// Переопределяет поля из переменных через `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("SIGNALING_URL") {
            self.signaling_url = v;
        }
        if let Some(v) = var("API_URL") {
            self.api_url = v;
        }
        if let Some(v) = var("RECONNECT_DELAY_MS") {
            self.reconnect_delay_ms = parse_number("RECONNECT_DELAY_MS", &v)?;
        }
        if let Some(v) = var("MAX_RECONNECT_ATTEMPTS") {
            self.max_reconnect_attempts = parse_number("MAX_RECONNECT_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("MEDIA_TIMEOUT_MS") {
            self.media_timeout_ms = parse_number("MEDIA_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("OPEN_TIMEOUT_MS") {
            self.open_timeout_ms = parse_number("OPEN_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = parse_number("PROBE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = var("AUDIO_ONLY") {
            if matches!(v.as_str(), "1" | "true" | "yes") {
                self.media = MediaConstraints::audio_only();
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let signaling = Url::parse(&self.signaling_url)?;
        if !matches!(signaling.scheme(), "ws" | "wss") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must use ws:// or wss://, got {}",
                self.signaling_url
            )));
        }
        let api = Url::parse(&self.api_url)?;
        if !matches!(api.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig(format!(
                "api_url must use http:// or https://, got {}",
                self.api_url
            )));
        }
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("ICE server '{}' has no URL", server.id)));
            }
            // TURN без логина/пароля не работает
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
                return Err(Error::InvalidConfig(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        if self.media_timeout_ms == 0 || self.open_timeout_ms == 0 || self.probe_timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeouts must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_millis(self.media_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{ENV_PREFIX}{name} is not a number: {value}")))
}
