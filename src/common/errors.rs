use thiserror::Error;

use crate::store::StoreError;

/// Failure taxonomy of the room operations. `Display` carries the
/// user-facing string shown by the service, so callers can surface errors
/// verbatim.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Rejected before any store write; no side effect.
    #[error("{0}")]
    Validation(String),

    /// The username is on this room's kicked list; permanent for that
    /// username until the room is destroyed.
    #[error("このルームからキックされています")]
    Kicked,

    /// Private-room password mismatch (exact compare).
    #[error("パスワードが間違っています")]
    WrongPassword,

    /// A join for the same (room, username) is already in flight on this
    /// instance. Transient; the caller may retry.
    #[error("既に参加処理中です")]
    JoinInFlight,

    /// A store round trip failed. Partial effects are not rolled back;
    /// callers must reconcile via the next subscription snapshot.
    #[error("操作に失敗しました。もう一度お試しください")]
    Store(#[from] StoreError),
}

impl RoomError {
    /// True for failures the caller may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, RoomError::JoinInFlight)
    }
}

pub type RoomResult<T> = Result<T, RoomError>;
