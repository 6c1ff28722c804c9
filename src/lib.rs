//! Room/session coordination core for an anonymous real-time text-call
//! service: participants join named (optionally password-protected) rooms,
//! stream keystrokes to each other live, and share a side chat channel.
//!
//! Everything is built on a shared reactive key-value store accessed
//! concurrently by many peer clients with no central arbiter. See
//! [`store::SharedStore`] for the primitive and [`rooms::RoomManager`] for
//! the coordination logic on top of it.

pub mod common;
pub mod config;
pub mod rooms;
pub mod store;

pub use common::{ChatMessage, MessageKind, Room, RoomError, RoomResult, RoomUser, SessionEvent};
pub use config::AppConfig;
pub use rooms::{RoomManager, TypingSession};
pub use store::{ConnId, MemoryStore, SharedStore, StoreError, Subscription};
