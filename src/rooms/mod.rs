pub mod manager;
pub mod presence;
mod session;

pub use manager::RoomManager;
pub use presence::TypingSession;
