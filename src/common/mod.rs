pub mod errors;
pub mod events;
pub mod types;

pub use errors::{RoomError, RoomResult};
pub use events::SessionEvent;
pub use types::{ChatMessage, KickedEntry, MessageKind, Room, RoomUser};
