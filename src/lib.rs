pub mod admin;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use admin::RoomAdmin;
pub use config::ClientConfig;
pub use error::{Error, Operation, Result};
pub use media::{MediaConstraints, MediaError, MediaHandle, MediaSource, TrackKind, TrackMediaSource};
pub use session::{Backends, Phase, SessionDirectory, SessionHandle, SessionStatus};
