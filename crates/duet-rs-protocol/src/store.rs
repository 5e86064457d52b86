//! Session and message store seam.

use crate::{Message, MessageId, SessionId, SessionSummary};
use thiserror::Error;

/// Errors returned by a state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(u32),
    #[error("missing session metadata")]
    MissingMetadata,
    #[error("session already exists: {0}")]
    SessionExists(SessionId),
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

impl StoreError {
    /// True when the error names a missing session or message.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::SessionNotFound(_) | StoreError::MessageNotFound(_)
        )
    }
}

/// Persistent store for sessions and their messages.
///
/// Each mutation is atomic on its own; callers never rely on multi-step
/// transactions. Implementations serialise concurrent writers internally.
pub trait StateStore: Send + Sync {
    /// List all session summaries, most recently updated first.
    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError>;
    /// Load a session's messages ordered by sequence.
    fn load_messages(&self, session_id: SessionId) -> Result<Vec<Message>, StoreError>;
    /// Append a message to a session.
    fn append_message(
        &self,
        session_id: SessionId,
        message: &Message,
    ) -> Result<MessageId, StoreError>;
    /// Replace a stored message in place, keeping its id and position.
    fn replace_message(&self, message_id: MessageId, message: &Message)
    -> Result<(), StoreError>;
    /// Delete `message_id` and every message after it.
    fn truncate_after(&self, session_id: SessionId, message_id: MessageId)
    -> Result<(), StoreError>;
    /// Create a new empty session.
    fn create_session(&self, title: &str) -> Result<SessionSummary, StoreError>;
    /// Delete a session and all of its messages.
    fn delete_session(&self, session_id: SessionId) -> Result<bool, StoreError>;
    /// Rename a session.
    fn rename_session(&self, session_id: SessionId, title: &str) -> Result<(), StoreError>;
}
