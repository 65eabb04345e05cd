pub mod directory;
pub mod handle;
pub mod machine;
pub mod state;

pub use directory::SessionDirectory;
pub use handle::SessionHandle;
pub use machine::{Backends, Command};
pub use state::{Phase, RoomMembership, SessionStatus};
