use crate::peer::types::ServerConfig;
use rand::Rng;

const ROOM_ID_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const ROOM_ID_LEN: usize = 4;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Короткий номер комнаты, который удобно продиктовать собеседнику
pub fn generate_room_id() -> String {
    let mut rng = rand::rng();
    (0..ROOM_ID_LEN)
        .map(|_| ROOM_ID_ALPHABET[rng.random_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect()
}

/// Номера комнат не зависят от регистра и пробелов по краям
pub fn normalize_room_id(raw: &str) -> String {
    raw.trim().to_uppercase()
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: &str, url: &str) -> ServerConfig {
        ServerConfig {
            id: "s".into(),
            r#type: kind.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn test_room_ids() {
        let id = generate_room_id();
        assert_eq!(id.len(), ROOM_ID_LEN);
        assert!(id.bytes().all(|b| ROOM_ID_ALPHABET.contains(&b)));
        assert_eq!(normalize_room_id("  abcd "), "ABCD");
    }

    #[test]
    fn test_random_id_is_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_ice_url_scheme() {
        assert_eq!(
            add_ice_url_scheme(&server("turn", "relay.example.com:3478")),
            "turn:relay.example.com:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server("stun", "stun.l.google.com:19302")),
            "stun:stun.l.google.com:19302"
        );
        assert_eq!(
            add_ice_url_scheme(&server("turn", "turns:relay.example.com:5349")),
            "turns:relay.example.com:5349"
        );
    }
}
