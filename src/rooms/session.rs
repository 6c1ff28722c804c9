use std::collections::{HashMap, HashSet};

use tokio::task::JoinHandle;

use crate::common::types::now_millis;

/// Key of one logical session: a username inside a room. The same human in
/// two rooms, or two usernames in one room, are distinct sessions.
pub(crate) type SessionKey = (String, String);

/// Last known session for a key, used to evict stale entities before a
/// rejoin lands.
#[derive(Debug, Clone)]
pub(crate) struct ActiveSession {
    pub room_id: String,
    pub user_id: String,
    #[allow(dead_code)]
    pub started_at: i64,
}

/// Per-manager-instance reconciliation state. Everything here is
/// best-effort client bookkeeping: the authoritative cleanup is the store's
/// disconnect hook plus the scan-and-evict step in join.
///
/// All delayed side effects (typing decay, kick watchers, empty-room
/// sweeps) park their `JoinHandle` here and are released through
/// [`SessionTracker::release_user`] or [`SessionTracker::shutdown`] only,
/// so nothing fires after the owning session ends.
#[derive(Default)]
pub(crate) struct SessionTracker {
    active: HashMap<SessionKey, ActiveSession>,
    joining: HashSet<SessionKey>,
    decay_timers: HashMap<(String, String), JoinHandle<()>>,
    kick_watchers: HashMap<(String, String), JoinHandle<()>>,
    room_sweepers: HashMap<String, JoinHandle<()>>,
}

impl SessionTracker {
    /// Mark a join in flight; `false` if one already is for this key.
    pub fn begin_join(&mut self, key: &SessionKey) -> bool {
        self.joining.insert(key.clone())
    }

    pub fn is_joining(&self, key: &SessionKey) -> bool {
        self.joining.contains(key)
    }

    pub fn end_join(&mut self, key: &SessionKey) {
        self.joining.remove(key);
    }

    pub fn record_active(&mut self, key: SessionKey, room_id: &str, user_id: &str) {
        self.active.insert(
            key,
            ActiveSession {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                started_at: now_millis(),
            },
        );
    }

    /// Remove and return the tracked session for a key, if any.
    pub fn take_active(&mut self, key: &SessionKey) -> Option<ActiveSession> {
        self.active.remove(key)
    }

    /// Replace the typing-decay timer for a user; any previous one is
    /// cancelled first.
    pub fn set_decay_timer(&mut self, room_id: &str, user_id: &str, handle: JoinHandle<()>) {
        let key = (room_id.to_string(), user_id.to_string());
        if let Some(old) = self.decay_timers.insert(key, handle) {
            old.abort();
        }
    }

    pub fn clear_decay_timer(&mut self, room_id: &str, user_id: &str) {
        let key = (room_id.to_string(), user_id.to_string());
        if let Some(old) = self.decay_timers.remove(&key) {
            old.abort();
        }
    }

    /// The decay task calls this right before it fires, so a fired timer
    /// does not linger as a dead handle.
    pub fn forget_decay_timer(&mut self, room_id: &str, user_id: &str) {
        self.decay_timers
            .remove(&(room_id.to_string(), user_id.to_string()));
    }

    pub fn set_kick_watcher(&mut self, room_id: &str, user_id: &str, handle: JoinHandle<()>) {
        let key = (room_id.to_string(), user_id.to_string());
        if let Some(old) = self.kick_watchers.insert(key, handle) {
            old.abort();
        }
    }

    /// Replace the pending empty-room sweep for a room.
    pub fn set_room_sweeper(&mut self, room_id: &str, handle: JoinHandle<()>) {
        if let Some(old) = self.room_sweepers.insert(room_id.to_string(), handle) {
            old.abort();
        }
    }

    pub fn forget_room_sweeper(&mut self, room_id: &str) {
        self.room_sweepers.remove(room_id);
    }

    /// Single release path for everything owned on behalf of one user.
    pub fn release_user(&mut self, room_id: &str, user_id: &str) {
        let key = (room_id.to_string(), user_id.to_string());
        if let Some(timer) = self.decay_timers.remove(&key) {
            timer.abort();
        }
        if let Some(watcher) = self.kick_watchers.remove(&key) {
            watcher.abort();
        }
    }

    /// Abort every timer and watcher and drop all tracking.
    pub fn shutdown(&mut self) {
        for (_, handle) in self.decay_timers.drain() {
            handle.abort();
        }
        for (_, handle) in self.kick_watchers.drain() {
            handle.abort();
        }
        for (_, handle) in self.room_sweepers.drain() {
            handle.abort();
        }
        self.active.clear();
        self.joining.clear();
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
