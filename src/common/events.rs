/// Event delivered from the manager's background watchers to the owning
/// session's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// This session's user entity vanished from the room and the kicked
    /// list names its username: the user was moderated out, not dropped.
    Kicked {
        room_id: String,
        user_id: String,
        reason: String,
    },
}
