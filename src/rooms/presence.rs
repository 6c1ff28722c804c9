use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::common::errors::RoomResult;
use crate::common::types::now_millis;
use crate::store::SharedStore;

use super::manager::{RoomManager, fields, user_path};

impl<S: SharedStore> RoomManager<S> {
    /// One idempotent merge of a user's live typing state. `isTyping` is
    /// derived (either string non-empty); every call resets the decay
    /// timer, so the state auto-clears after `typing_decay_ms` of silence.
    ///
    /// The decay is a client-driven policy, not a store TTL: if this
    /// instance dies, the state stays until the disconnect hook removes the
    /// whole entity.
    pub async fn update_typing(
        &self,
        room_id: &str,
        user_id: &str,
        typing: &str,
        composing: &str,
    ) -> RoomResult<()> {
        let is_typing = !typing.is_empty() || !composing.is_empty();
        self.store
            .update(
                &user_path(room_id, user_id),
                fields(json!({
                    "typing": typing,
                    "composing": composing,
                    "lastUpdate": now_millis(),
                    "isTyping": is_typing,
                    "status": "active",
                })),
            )
            .await?;

        if is_typing {
            let manager = self.clone();
            let room_id_owned = room_id.to_string();
            let user_id_owned = user_id.to_string();
            let decay = Duration::from_millis(self.config.typing_decay_ms);

            let handle = tokio::spawn(async move {
                tokio::time::sleep(decay).await;
                manager
                    .tracker()
                    .forget_decay_timer(&room_id_owned, &user_id_owned);
                let cleared = manager
                    .store
                    .update(
                        &user_path(&room_id_owned, &user_id_owned),
                        fields(json!({
                            "typing": "",
                            "composing": "",
                            "isTyping": false,
                            "lastUpdate": now_millis(),
                        })),
                    )
                    .await;
                if let Err(err) = cleared {
                    log::warn!("Failed to clear typing state for {user_id_owned}: {err}");
                }
            });
            self.tracker().set_decay_timer(room_id, user_id, handle);
        } else {
            self.tracker().clear_decay_timer(room_id, user_id);
        }
        Ok(())
    }
}

#[derive(Default)]
struct PendingPush {
    typing: String,
    composing: String,
}

/// Call-site half of the typing engine, owned by one joined client.
///
/// Keystrokes and IME composition updates are batched with a trailing-edge
/// debounce: each input replaces the pending payload and re-arms the timer,
/// so at most one store write goes out per quiet window and the last write
/// wins. While a composition is in progress the whole buffer is carried on
/// the `composing` channel (with `typing` empty) so receivers can style it
/// as uncommitted; composition end promotes it back to `typing`.
///
/// [`TypingSession::submit`] (Enter without shift) clears the buffer and
/// pushes the empty state immediately, bypassing the debounce. The cleared
/// state is the only observable effect; this channel is live-only, not a
/// message log.
pub struct TypingSession<S: SharedStore> {
    manager: RoomManager<S>,
    room_id: String,
    user_id: String,
    buffer: String,
    composing: bool,
    muted: bool,
    pending: Arc<Mutex<PendingPush>>,
    debounce: Option<JoinHandle<()>>,
}

impl<S: SharedStore> TypingSession<S> {
    pub fn new(manager: RoomManager<S>, room_id: &str, user_id: &str) -> Self {
        Self {
            manager,
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            buffer: String::new(),
            composing: false,
            muted: false,
            pending: Arc::new(Mutex::new(PendingPush::default())),
            debounce: None,
        }
    }

    /// The local buffer as of the last input.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Ordinary keystroke: the whole buffer is `text`.
    pub fn keystroke(&mut self, text: &str) {
        self.buffer = text.to_string();
        self.composing = false;
        self.schedule();
    }

    /// IME composition in progress: the buffer is transmitted on the
    /// composing channel instead of the typing channel.
    pub fn composition(&mut self, text: &str) {
        self.buffer = text.to_string();
        self.composing = true;
        self.schedule();
    }

    /// Composition ended: promote the final text to committed typing.
    pub fn composition_end(&mut self, final_text: &str) {
        self.buffer = final_text.to_string();
        self.composing = false;
        self.schedule();
    }

    /// Enter-without-shift: clear the local buffer and push the empty state
    /// immediately, skipping the debounce.
    pub async fn submit(&mut self) -> RoomResult<()> {
        self.buffer.clear();
        self.composing = false;
        if let Some(pending) = self.debounce.take() {
            pending.abort();
        }
        self.manager
            .update_typing(&self.room_id, &self.user_id, "", "")
            .await
    }

    /// Muting stops publishing and clears the remote state at once;
    /// unmuting resumes on the next input.
    pub async fn set_muted(&mut self, muted: bool) -> RoomResult<()> {
        self.muted = muted;
        if muted {
            if let Some(pending) = self.debounce.take() {
                pending.abort();
            }
            self.manager
                .update_typing(&self.room_id, &self.user_id, "", "")
                .await?;
        }
        Ok(())
    }

    /// Abort any pending debounce push. Called on teardown; the timer must
    /// never fire after the owning session ends.
    pub fn close(&mut self) {
        if let Some(pending) = self.debounce.take() {
            pending.abort();
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingPush> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&mut self) {
        if self.muted {
            return;
        }
        {
            let mut pending = self.lock_pending();
            if self.composing {
                pending.typing = String::new();
                pending.composing = self.buffer.clone();
            } else {
                pending.typing = self.buffer.clone();
                pending.composing = String::new();
            }
        }
        if let Some(old) = self.debounce.take() {
            old.abort();
        }

        let manager = self.manager.clone();
        let pending = self.pending.clone();
        let room_id = self.room_id.clone();
        let user_id = self.user_id.clone();
        let wait = Duration::from_millis(manager.config.typing_debounce_ms);

        self.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let (typing, composing) = {
                let pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
                (pending.typing.clone(), pending.composing.clone())
            };
            if let Err(err) = manager
                .update_typing(&room_id, &user_id, &typing, &composing)
                .await
            {
                log::warn!("Typing update failed for {user_id}: {err}");
            }
        }));
    }
}

impl<S: SharedStore> Drop for TypingSession<S> {
    fn drop(&mut self) {
        self.close();
    }
}
