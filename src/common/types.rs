use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Sender id used for synthesized join/leave/kick/clear messages.
pub const SYSTEM_USER_ID: &str = "system";
/// Display name of the synthetic system sender.
pub const SYSTEM_USERNAME: &str = "システム";
/// Gray used for system messages.
pub const SYSTEM_COLOR: &str = "#6B7280";

/// Fixed palette participants are colored from, assigned at join.
pub const USER_COLORS: [&str; 8] = [
    "#3B82F6", // blue
    "#10B981", // emerald
    "#F59E0B", // amber
    "#EF4444", // red
    "#8B5CF6", // violet
    "#06B6D4", // cyan
    "#F97316", // orange
    "#84CC16", // lime
];

/// Current wall-clock time in milliseconds, the timestamp unit of the whole tree.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a room-scoped participant id: `user_<millis>_<random>`.
pub fn generate_user_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("user_{}_{}", now_millis(), &random[..9])
}

/// Pick a random display color from the fixed palette.
pub fn generate_user_color() -> String {
    let idx = rand::rng().random_range(0..USER_COLORS.len());
    USER_COLORS[idx].to_string()
}

/// One joined occupant of a room. Exclusively owned by its client while
/// connected; removed by the store's disconnect hook if the client vanishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUser {
    pub id: String,
    pub username: String,
    /// Committed-but-unsent text shown to others.
    #[serde(default)]
    pub typing: String,
    /// In-progress IME input, rendered with distinct styling.
    #[serde(default)]
    pub composing: String,
    pub last_update: i64,
    pub joined_at: i64,
    #[serde(default)]
    pub is_typing: bool,
    pub color: String,
    /// Advisory only: "active" | "kicked" | "disconnected".
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "active".to_string()
}

impl RoomUser {
    pub fn new(username: &str) -> Self {
        let now = now_millis();
        Self {
            id: generate_user_id(),
            username: username.to_string(),
            typing: String::new(),
            composing: String::new(),
            last_update: now,
            joined_at: now,
            is_typing: false,
            color: generate_user_color(),
            status: "active".to_string(),
        }
    }
}

/// Bookkeeping for a kicked username; persists for the room's lifetime and
/// blocks re-entry by username match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickedEntry {
    pub username: String,
    pub kicked_at: i64,
}

/// A named, possibly password-protected, ephemeral gathering of users.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    /// Store key; not part of the stored value itself.
    #[serde(skip)]
    pub id: String,
    /// Display string, not an identifier; defaults to `Room <id>` for rooms
    /// materialized lazily by a join.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub created_at: i64,
    /// Bumped on join, chat send, and other activity.
    #[serde(default)]
    pub last_activity: i64,
    /// Doubles as a mutation timestamp, bumped on every chat send.
    #[serde(default)]
    pub message_count: i64,
    #[serde(default)]
    pub is_private: bool,
    /// Plaintext; present only on private rooms. Compared exactly at join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Set when the creator's join completes; never recomputed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub users: HashMap<String, RoomUser>,
    #[serde(default)]
    pub kicked_users: HashMap<String, KickedEntry>,
}

impl Room {
    /// Build a fresh room value (no users, no messages).
    pub fn new(name: &str, is_private: bool, password: Option<String>) -> Self {
        let now = now_millis();
        Self {
            id: String::new(),
            name: name.to_string(),
            created_at: now,
            last_activity: now,
            message_count: 0,
            is_private,
            password: if is_private { password } else { None },
            owner_id: None,
            users: HashMap::new(),
            kicked_users: HashMap::new(),
        }
    }

    /// Decode a room snapshot taken at `rooms/<id>`. Returns `None` for a
    /// missing or non-object snapshot (room deleted).
    pub fn from_snapshot(id: &str, snapshot: Value) -> Option<Self> {
        if !snapshot.is_object() {
            return None;
        }
        let mut room: Room = serde_json::from_value(snapshot).ok()?;
        room.id = id.to_string();
        if room.name.is_empty() {
            room.name = format!("Room {id}");
        }
        Some(room)
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }

    /// Username match against the kicked list (ids are irrelevant here).
    pub fn is_username_kicked(&self, username: &str) -> bool {
        self.kicked_users
            .values()
            .any(|entry| entry.username == username)
    }
}

/// Tag distinguishing synthesized messages from ordinary chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Join,
    Leave,
    System,
    Kick,
}

/// One entry of a room's append-only chat log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub text: String,
    pub timestamp: i64,
    pub color: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageKind>,
}

impl ChatMessage {
    pub fn is_system(&self) -> bool {
        self.user_id == SYSTEM_USER_ID
    }
}
