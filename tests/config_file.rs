use roomcall_lib::{ClientConfig, Error, MediaConstraints};
use std::io::Write;
use std::time::Duration;

#[test]
fn test_partial_file_keeps_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "signaling_url": "wss://rtc.example.com/ws",
            "reconnect_delay_ms": 1500,
            "media": {{"audio": true, "video": null}},
            "ice_servers": [
                {{"id": "relay", "type": "turn", "url": "relay.example.com:3478",
                  "username": "alice", "credential": "secret"}}
            ]
        }}"#
    )
    .unwrap();

    let config = ClientConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.signaling_url, "wss://rtc.example.com/ws");
    assert_eq!(config.reconnect_delay(), Duration::from_millis(1500));
    assert_eq!(config.media, MediaConstraints::audio_only());
    assert_eq!(config.ice_servers.len(), 1);
    assert_eq!(config.max_reconnect_attempts, 3);
    assert_eq!(config.api_url, ClientConfig::default().api_url);
}

#[test]
fn test_malformed_file_is_reported() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();
    assert!(matches!(
        ClientConfig::from_file(file.path()),
        Err(Error::Serialization(_))
    ));
    let missing = file.path().with_extension("missing");
    assert!(matches!(ClientConfig::from_file(&missing), Err(Error::Io(_))));
}
