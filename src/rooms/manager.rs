use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use crate::common::errors::{RoomError, RoomResult};
use crate::common::events::SessionEvent;
use crate::common::types::{
    ChatMessage, KickedEntry, MessageKind, Room, RoomUser, SYSTEM_COLOR, SYSTEM_USER_ID,
    SYSTEM_USERNAME, now_millis,
};
use crate::config::AppConfig;
use crate::store::{ConnId, SharedStore, encode};

use super::session::{SessionKey, SessionTracker};

pub(crate) fn room_path(room_id: &str) -> String {
    format!("rooms/{room_id}")
}

pub(crate) fn user_path(room_id: &str, user_id: &str) -> String {
    format!("rooms/{room_id}/users/{user_id}")
}

pub(crate) fn messages_path(room_id: &str) -> String {
    format!("rooms/{room_id}/messages")
}

fn kicked_users_path(room_id: &str) -> String {
    format!("rooms/{room_id}/kickedUsers")
}

/// Unwrap a `json!({ ... })` literal into a field map for `update`.
pub(crate) fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Coordination core for one connecting client instance: room lifecycle,
/// moderation, chat, and the session bookkeeping that keeps duplicate
/// ghosts out of the shared tree.
///
/// Every client is a peer writing the same store directly; there is no
/// central arbiter. Invariants hold by convention and best-effort cleanup,
/// not transactions: two clients joining the same username concurrently
/// may briefly coexist until the scan-and-evict step of a later operation
/// settles it.
pub struct RoomManager<S: SharedStore> {
    pub(crate) store: S,
    pub(crate) conn: ConnId,
    pub(crate) config: AppConfig,
    pub(crate) sessions: Arc<Mutex<SessionTracker>>,
    pub(crate) events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl<S: SharedStore> Clone for RoomManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            conn: self.conn,
            config: self.config.clone(),
            sessions: self.sessions.clone(),
            events_tx: self.events_tx.clone(),
        }
    }
}

impl<S: SharedStore> RoomManager<S> {
    /// Returns the manager plus the receiver its background watchers
    /// deliver [`SessionEvent`]s on (kick notifications).
    pub fn new(store: S, config: AppConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let conn = store.connect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Self {
            store,
            conn,
            config,
            sessions: Arc::new(Mutex::new(SessionTracker::default())),
            events_tx,
        };
        (manager, events_rx)
    }

    pub(crate) fn tracker(&self) -> MutexGuard<'_, SessionTracker> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The store connection this instance registers disconnect hooks on.
    pub fn connection(&self) -> ConnId {
        self.conn
    }

    /// Allocate a new room with no users, no messages, and no kicked list.
    /// Names are display strings, not identifiers; duplicates are allowed.
    pub async fn create_room(
        &self,
        name: &str,
        is_private: bool,
        password: Option<&str>,
    ) -> RoomResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RoomError::Validation(
                "ルーム名を入力してください".to_string(),
            ));
        }
        if name.chars().count() > 50 {
            return Err(RoomError::Validation(
                "ルーム名は50文字以内で入力してください".to_string(),
            ));
        }
        if is_private && password.map_or(true, str::is_empty) {
            return Err(RoomError::Validation(
                "パスワードを入力してください".to_string(),
            ));
        }

        let room = Room::new(name, is_private, password.map(str::to_string));
        let room_id = self.store.push("rooms").await?;
        self.store
            .write(&room_path(&room_id), encode(&room)?)
            .await?;
        log::info!("Created room {room_id} ({name})");
        Ok(room_id)
    }

    /// Create a room and join it on the creator fast path, then record the
    /// creator as the stored owner.
    pub async fn create_and_join(
        &self,
        name: &str,
        username: &str,
        is_private: bool,
        password: Option<&str>,
    ) -> RoomResult<(String, String)> {
        let room_id = self.create_room(name, is_private, password).await?;
        let user_id = self.join_room(&room_id, username, password, true).await?;
        self.store
            .update(&room_path(&room_id), fields(json!({ "ownerId": user_id })))
            .await?;
        Ok((room_id, user_id))
    }

    /// Join a room as `username`.
    ///
    /// A room with no stored data behaves like a public one: the join
    /// succeeds and lazily materializes the room node (see DESIGN.md).
    pub async fn join_room(
        &self,
        room_id: &str,
        username: &str,
        password: Option<&str>,
        is_creator: bool,
    ) -> RoomResult<String> {
        let username = username.trim();
        if username.is_empty() {
            return Err(RoomError::Validation(
                "ユーザー名を入力してください".to_string(),
            ));
        }
        if username.chars().count() > 20 {
            return Err(RoomError::Validation(
                "ユーザー名は20文字以内で入力してください".to_string(),
            ));
        }

        let key: SessionKey = (room_id.to_string(), username.to_string());

        if !is_creator {
            let snapshot = self.store.read_once(&room_path(room_id)).await?;
            if let Some(room) = Room::from_snapshot(room_id, snapshot) {
                if room.is_username_kicked(username) {
                    return Err(RoomError::Kicked);
                }
            }
            // Client-local optimism only; the authoritative de-duplication
            // is the scan-and-evict pass below.
            if self.tracker().is_joining(&key) {
                return Err(RoomError::JoinInFlight);
            }
        }

        self.tracker().begin_join(&key);
        let result = self.join_room_inner(room_id, username, password, &key).await;
        self.tracker().end_join(&key);

        if let Err(err) = &result {
            log::warn!("Join failed for {username} in room {room_id}: {err}");
        }
        result
    }

    async fn join_room_inner(
        &self,
        room_id: &str,
        username: &str,
        password: Option<&str>,
        key: &SessionKey,
    ) -> RoomResult<String> {
        // A session this instance already tracks for the key is stale by
        // definition; evict it before it turns into a ghost.
        let stale = self.tracker().take_active(key);
        if let Some(stale) = stale {
            if let Err(err) = self.cleanup_user(&stale.room_id, &stale.user_id).await {
                log::warn!("Failed to evict stale session {}: {err}", stale.user_id);
            }
        }

        let snapshot = self.store.read_once(&room_path(room_id)).await?;
        if let Some(room) = Room::from_snapshot(room_id, snapshot) {
            if room.is_private && room.password.as_deref() != password {
                return Err(RoomError::WrongPassword);
            }
            // Ghost sessions from crashed clients still occupy the username;
            // every match goes.
            for ghost in room.users.values().filter(|u| u.username == username) {
                if let Err(err) = self.cleanup_user(room_id, &ghost.id).await {
                    log::warn!("Failed to evict duplicate user {}: {err}", ghost.id);
                }
            }
        }

        let user = RoomUser::new(username);
        let user_id = user.id.clone();
        let path = user_path(room_id, &user_id);

        self.store.write(&path, encode(&user)?).await?;
        self.store.on_disconnect_remove(self.conn, &path).await?;
        self.start_kick_watcher(room_id, &user_id, username);

        self.store
            .update(
                &room_path(room_id),
                fields(json!({ "lastActivity": now_millis() })),
            )
            .await?;
        self.add_system_message(
            room_id,
            &format!("{username}さんが参加しました"),
            MessageKind::Join,
        )
        .await?;

        self.tracker().record_active(key.clone(), room_id, &user_id);
        log::info!("{username} joined room {room_id} as {user_id}");
        Ok(user_id)
    }

    /// Watch this session's own user entity; if it vanishes while the
    /// kicked list names our username, that was a kick, not a drop. The
    /// kicked entry is written before the removal, so it is still present
    /// when the removal is observed.
    fn start_kick_watcher(&self, room_id: &str, user_id: &str, username: &str) {
        let store = self.store.clone();
        let events_tx = self.events_tx.clone();
        let room_id_owned = room_id.to_string();
        let user_id_owned = user_id.to_string();
        let username = username.to_string();
        let path = user_path(room_id, user_id);
        let kicked_path = kicked_users_path(room_id);

        let handle = tokio::spawn(async move {
            let mut sub = match store.subscribe(&path).await {
                Ok(sub) => sub,
                Err(err) => {
                    log::warn!("Kick watcher could not subscribe to {path}: {err}");
                    return;
                }
            };
            while let Some(snapshot) = sub.next().await {
                if !snapshot.is_null() {
                    continue;
                }
                let kicked = store.read_once(&kicked_path).await.unwrap_or(Value::Null);
                let was_kicked = kicked.as_object().is_some_and(|entries| {
                    entries
                        .values()
                        .any(|entry| {
                            entry.get("username").and_then(Value::as_str) == Some(username.as_str())
                        })
                });
                if was_kicked {
                    let _ = events_tx.send(SessionEvent::Kicked {
                        room_id: room_id_owned.clone(),
                        user_id: user_id_owned.clone(),
                        reason: "kicked".to_string(),
                    });
                }
                break;
            }
        });
        self.tracker().set_kick_watcher(room_id, user_id, handle);
    }

    /// Remove a user entity and release everything owned on its behalf.
    /// Shared by leave, kick, stale-session eviction, and duplicate
    /// eviction.
    pub async fn cleanup_user(&self, room_id: &str, user_id: &str) -> RoomResult<()> {
        self.tracker().release_user(room_id, user_id);
        self.store.remove(&user_path(room_id, user_id)).await?;
        Ok(())
    }

    /// Explicit leave: removes the entity, announces it, and schedules the
    /// empty-room check after the grace window.
    pub async fn leave_room(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
    ) -> RoomResult<()> {
        let key: SessionKey = (room_id.to_string(), username.to_string());
        self.tracker().take_active(&key);

        self.cleanup_user(room_id, user_id).await?;
        self.add_system_message(
            room_id,
            &format!("{username}さんが退出しました"),
            MessageKind::Leave,
        )
        .await?;

        self.schedule_empty_room_check(room_id);
        log::info!("{username} left room {room_id}");
        Ok(())
    }

    /// The deletion check runs after a short grace window rather than
    /// transactionally, so a rejoin inside the window observes the room
    /// still existing.
    pub(crate) fn schedule_empty_room_check(&self, room_id: &str) {
        let manager = self.clone();
        let room_id_owned = room_id.to_string();
        let grace = Duration::from_millis(self.config.empty_room_grace_ms);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.tracker().forget_room_sweeper(&room_id_owned);
            if let Err(err) = manager.check_and_delete_empty_room(&room_id_owned).await {
                log::warn!("Empty-room check failed for {room_id_owned}: {err}");
            }
        });
        self.tracker().set_room_sweeper(room_id, handle);
    }

    /// Delete the room if it has no users (or is already gone).
    pub async fn check_and_delete_empty_room(&self, room_id: &str) -> RoomResult<()> {
        let snapshot = self.store.read_once(&room_path(room_id)).await?;
        let Some(room) = Room::from_snapshot(room_id, snapshot) else {
            return Ok(());
        };
        if room.users.is_empty() {
            self.store.remove(&room_path(room_id)).await?;
            log::info!("Empty room {room_id} deleted");
        }
        Ok(())
    }

    /// Eject a username from the room permanently (until the room dies).
    ///
    /// Caller-gated: ownership is not re-verified here (see
    /// [`Room::is_owner`]). The kicked entry is written BEFORE the user
    /// entity is removed; the kicked client's watcher depends on finding
    /// it when the removal is observed.
    pub async fn kick_user(&self, room_id: &str, user_id: &str, username: &str) -> RoomResult<()> {
        let entry = KickedEntry {
            username: username.to_string(),
            kicked_at: now_millis(),
        };
        self.store
            .write(
                &format!("{}/{user_id}", kicked_users_path(room_id)),
                encode(&entry)?,
            )
            .await?;

        self.add_system_message(
            room_id,
            &format!("{username}さんがキックされました"),
            MessageKind::Kick,
        )
        .await?;

        self.cleanup_user(room_id, user_id).await?;
        log::info!("{username} ({user_id}) kicked from room {room_id}");
        Ok(())
    }

    /// Append a chat message. Sending supersedes the live-typing display,
    /// so the sender's typing state is cleared as a side effect.
    pub async fn send_chat_message(
        &self,
        room_id: &str,
        user_id: &str,
        username: &str,
        text: &str,
        color: &str,
    ) -> RoomResult<()> {
        let message_key = self.store.push(&messages_path(room_id)).await?;
        let message = ChatMessage {
            id: message_key.clone(),
            user_id: user_id.to_string(),
            username: username.to_string(),
            text: text.to_string(),
            timestamp: now_millis(),
            color: color.to_string(),
            kind: None,
        };
        self.store
            .write(
                &format!("{}/{message_key}", messages_path(room_id)),
                encode(&message)?,
            )
            .await?;

        self.tracker().clear_decay_timer(room_id, user_id);
        self.store
            .update(
                &user_path(room_id, user_id),
                fields(json!({
                    "typing": "",
                    "composing": "",
                    "isTyping": false,
                    "lastUpdate": now_millis(),
                })),
            )
            .await?;

        // messageCount doubles as a mutation timestamp.
        self.store
            .update(
                &room_path(room_id),
                fields(json!({
                    "lastActivity": now_millis(),
                    "messageCount": now_millis(),
                })),
            )
            .await?;
        Ok(())
    }

    /// Append a synthesized system message (join/leave/kick/clear).
    pub async fn add_system_message(
        &self,
        room_id: &str,
        text: &str,
        kind: MessageKind,
    ) -> RoomResult<()> {
        let message_key = self.store.push(&messages_path(room_id)).await?;
        let message = ChatMessage {
            id: message_key.clone(),
            user_id: SYSTEM_USER_ID.to_string(),
            username: SYSTEM_USERNAME.to_string(),
            text: text.to_string(),
            timestamp: now_millis(),
            color: SYSTEM_COLOR.to_string(),
            kind: Some(kind),
        };
        self.store
            .write(
                &format!("{}/{message_key}", messages_path(room_id)),
                encode(&message)?,
            )
            .await?;
        Ok(())
    }

    /// Drop the whole message subtree and leave a single "cleared" system
    /// message as the new sole entry.
    pub async fn clear_room_messages(&self, room_id: &str) -> RoomResult<()> {
        self.store.remove(&messages_path(room_id)).await?;
        self.add_system_message(room_id, "メッセージがクリアされました", MessageKind::System)
            .await?;
        Ok(())
    }

    /// One-shot room read.
    pub async fn read_room(&self, room_id: &str) -> RoomResult<Option<Room>> {
        let snapshot = self.store.read_once(&room_path(room_id)).await?;
        Ok(Room::from_snapshot(room_id, snapshot))
    }

    /// Continuous room snapshots; `None` once the room is deleted. The feed
    /// ends when the receiver is dropped.
    pub async fn listen_to_room(
        &self,
        room_id: &str,
    ) -> RoomResult<mpsc::UnboundedReceiver<Option<Room>>> {
        let mut sub = self.store.subscribe(&room_path(room_id)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let room_id = room_id.to_string();

        tokio::spawn(async move {
            while let Some(snapshot) = sub.next().await {
                let room = Room::from_snapshot(&room_id, snapshot);
                if tx.send(room).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Message feed: every snapshot is sorted ascending by timestamp and
    /// truncated to the newest `message_display_limit` entries. This is a
    /// display cap; nothing is pruned from storage.
    pub async fn listen_to_messages(
        &self,
        room_id: &str,
    ) -> RoomResult<mpsc::UnboundedReceiver<Vec<ChatMessage>>> {
        let mut sub = self.store.subscribe(&messages_path(room_id)).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let limit = self.config.message_display_limit;

        tokio::spawn(async move {
            while let Some(snapshot) = sub.next().await {
                let mut messages: Vec<ChatMessage> = snapshot
                    .as_object()
                    .map(|entries| {
                        entries
                            .values()
                            .filter_map(|value| serde_json::from_value(value.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                messages.sort_by_key(|message: &ChatMessage| message.timestamp);
                if messages.len() > limit {
                    messages.drain(..messages.len() - limit);
                }
                if tx.send(messages).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Feed of joinable rooms: rooms with at least one user, newest
    /// activity first.
    pub async fn available_rooms(&self) -> RoomResult<mpsc::UnboundedReceiver<Vec<Room>>> {
        let mut sub = self.store.subscribe("rooms").await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(snapshot) = sub.next().await {
                let mut rooms: Vec<Room> = snapshot
                    .as_object()
                    .map(|entries| {
                        entries
                            .iter()
                            .filter_map(|(id, value)| Room::from_snapshot(id, value.clone()))
                            .filter(|room| !room.users.is_empty())
                            .collect()
                    })
                    .unwrap_or_default();
                rooms.sort_by_key(|room| std::cmp::Reverse(room.last_activity));
                if tx.send(rooms).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Abort every timer and watcher this instance owns and drop all local
    /// session tracking. Best effort; the store's disconnect hooks remain
    /// the authoritative fallback for entity removal.
    pub fn shutdown(&self) {
        self.tracker().shutdown();
    }
}
