//! Error types for controller operations.

use duet_rs_protocol::{MessageId, SessionId, StoreError};
use thiserror::Error;

/// Errors returned by `ConversationController` operations.
///
/// Adapter and dispatch failures never surface here; they become failed
/// assistant messages instead.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A turn is already in flight for the active session.
    #[error("a turn is already in flight for session {0}")]
    Busy(SessionId),
    /// No session is active yet; call `initialize` first.
    #[error("no active session")]
    NoActiveSession,
    /// Session id is unknown to the controller.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    /// Message id is not part of the active session.
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),
    /// Retry requires the last message to be a failed assistant reply.
    #[error("last message is not a failed assistant reply")]
    NotRetryable,
    /// Only user messages can be edited.
    #[error("message {0} is not a user message")]
    NotEditable(MessageId),
    /// A turn needs text or at least one image.
    #[error("message has no text and no images")]
    EmptyMessage,
    /// Session titles cannot be blank.
    #[error("session title is empty")]
    EmptyTitle,
    /// Requested dispatch mode names an adapter that is not registered.
    #[error("unknown adapter for dispatch mode: {0}")]
    InvalidMode(String),
    /// The controller was shut down.
    #[error("controller is shut down")]
    ShutDown,
    /// Session management hit a store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
