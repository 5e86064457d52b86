//! Shared types for Duet: messages, sessions, observable chat state, events,
//! and the seams (model adapters, state stores) the engine is built around.

pub mod adapter;
pub mod store;

pub use adapter::{
    AdapterFailure, AdapterRequest, AdapterResponse, ContextMessage, ConversationContext,
    ModelAdapter,
};
pub use store::{StateStore, StoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a chat session.
pub type SessionId = Uuid;
/// Unique identifier for a message.
pub type MessageId = Uuid;
/// Unique identifier for a single turn dispatch.
pub type TurnId = Uuid;

/// Speaker role for a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User-authored message.
    User,
    /// Assistant-authored message.
    Assistant,
}

impl Role {
    /// Return the role as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Outcome status of a stored message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Message content is final and may be sent back as context.
    #[default]
    Final,
    /// Assistant turn failed; carries an error descriptor instead of text.
    Failed,
}

/// Opaque reference to an image attached to a user message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ImageRef {
    /// Image stored on the local filesystem.
    File {
        path: PathBuf,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// Image carried inline as base64 data.
    Inline { mime_type: String, data: String },
}

impl ImageRef {
    /// Reference an image file, guessing the mime type from its extension.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mime_type = guess_mime_type(&path).map(str::to_string);
        ImageRef::File { path, mime_type }
    }

    /// Mime type if known.
    pub fn mime_type(&self) -> Option<&str> {
        match self {
            ImageRef::File { mime_type, .. } => mime_type.as_deref(),
            ImageRef::Inline { mime_type, .. } => Some(mime_type.as_str()),
        }
    }
}

fn guess_mime_type(path: &std::path::Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

/// Message stored in a session transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Message identifier, stable across in-place replacement.
    pub id: MessageId,
    /// Owning session.
    pub session_id: SessionId,
    /// Position within the session; strictly increasing.
    pub seq: u64,
    /// Role that produced the message.
    pub role: Role,
    /// Message content (empty for failed assistant turns).
    pub text: String,
    /// Images attached to the message, in order.
    #[serde(default)]
    pub image_refs: Vec<ImageRef>,
    /// Timestamp for the message.
    pub created_at: DateTime<Utc>,
    /// Model that produced a final assistant reply.
    #[serde(default)]
    pub model_used: Option<String>,
    /// Confidence of a final assistant reply.
    #[serde(default)]
    pub confidence: Option<f32>,
    /// Final or failed.
    #[serde(default)]
    pub status: MessageStatus,
    /// Error descriptor for failed assistant turns.
    #[serde(default)]
    pub error: Option<String>,
}

impl Message {
    /// Build a user message.
    pub fn user(
        session_id: SessionId,
        seq: u64,
        text: impl Into<String>,
        image_refs: Vec<ImageRef>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            seq,
            role: Role::User,
            text: text.into(),
            image_refs,
            created_at: Utc::now(),
            model_used: None,
            confidence: None,
            status: MessageStatus::Final,
            error: None,
        }
    }

    /// Build a final assistant reply.
    pub fn assistant_reply(
        session_id: SessionId,
        seq: u64,
        text: impl Into<String>,
        model_used: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            seq,
            role: Role::Assistant,
            text: text.into(),
            image_refs: Vec::new(),
            created_at: Utc::now(),
            model_used: Some(model_used.into()),
            confidence: Some(confidence),
            status: MessageStatus::Final,
            error: None,
        }
    }

    /// Build a failed assistant turn.
    pub fn assistant_failure(session_id: SessionId, seq: u64, error: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            seq,
            role: Role::Assistant,
            text: String::new(),
            image_refs: Vec::new(),
            created_at: Utc::now(),
            model_used: None,
            confidence: None,
            status: MessageStatus::Failed,
            error: Some(error.into()),
        }
    }

    /// True for assistant messages whose turn failed.
    pub fn is_failed(&self) -> bool {
        self.status == MessageStatus::Failed
    }
}

/// Summary view of a session for listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    /// Session identifier.
    pub id: SessionId,
    /// Display title.
    pub title: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the most recent successful write of a message.
    pub last_updated_at: DateTime<Utc>,
    /// Count of messages stored.
    pub message_count: usize,
}

/// Which adapters a turn is dispatched to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case", tag = "type", content = "adapter")]
pub enum DispatchMode {
    /// Query every applicable adapter and keep the best-scoring success.
    #[default]
    Auto,
    /// Query a single adapter by id.
    Single(String),
}

impl DispatchMode {
    /// Parse `auto` or an adapter id.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("auto") || trimmed.is_empty() {
            DispatchMode::Auto
        } else {
            DispatchMode::Single(trimmed.to_string())
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::Auto => write!(f, "auto"),
            DispatchMode::Single(id) => write!(f, "{id}"),
        }
    }
}

/// Observable chat state published to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChatSnapshot {
    /// Messages of the active session, ordered by sequence.
    pub current_messages: Vec<Message>,
    /// True while the active session has a turn in flight.
    pub is_loading: bool,
    /// Recoverable error banner.
    pub error: Option<String>,
    /// All known sessions, most recently updated first.
    pub chat_sessions: Vec<SessionSummary>,
    /// The active session.
    pub current_session: Option<SessionSummary>,
    /// Dispatch mode used for new turns.
    pub mode: DispatchMode,
}

/// Wrapper for events emitted by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMsg {
    /// Unique id for the event.
    pub id: Uuid,
    /// Session id associated with the event.
    pub session_id: SessionId,
    /// Timestamp when the event was created.
    pub created_at: DateTime<Utc>,
    /// Event payload content.
    pub payload: EventPayload,
}

impl EventMsg {
    /// Stamp a payload for a session.
    pub fn new(session_id: SessionId, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            created_at: Utc::now(),
            payload,
        }
    }
}

/// Controller lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "payload")]
pub enum EventPayload {
    /// Dispatch for a turn started.
    TurnStarted { turn_id: TurnId, mode: DispatchMode },
    /// Turn produced a final assistant message.
    TurnCompleted {
        turn_id: TurnId,
        message_id: MessageId,
        adapter_id: String,
    },
    /// Turn resolved to a failed assistant message.
    TurnFailed {
        turn_id: TurnId,
        message_id: MessageId,
        reason: String,
    },
    /// Turn was cancelled before a result was recorded.
    TurnCancelled { turn_id: TurnId },
    /// Session created.
    SessionCreated { title: String },
    /// Session became active.
    SessionSwitched,
    /// Session deleted.
    SessionDeleted,
    /// Session renamed.
    SessionRenamed { title: String },
    /// Recoverable error surfaced to the user.
    Error { message: String },
}

/// Sink interface for controller events.
pub trait EventSink: Send + Sync {
    /// Emit an event to downstream listeners.
    fn emit(&self, event: EventMsg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn dispatch_mode_parses_auto_and_ids() {
        assert_eq!(DispatchMode::parse("auto"), DispatchMode::Auto);
        assert_eq!(DispatchMode::parse(" AUTO "), DispatchMode::Auto);
        assert_eq!(
            DispatchMode::parse("gemini"),
            DispatchMode::Single("gemini".to_string())
        );
        assert_eq!(DispatchMode::Single("hf".to_string()).to_string(), "hf");
    }

    #[test]
    fn image_ref_guesses_mime_from_extension() {
        assert_eq!(ImageRef::file("/tmp/cat.JPG").mime_type(), Some("image/jpeg"));
        assert_eq!(ImageRef::file("/tmp/blob.bin").mime_type(), None);
    }

    #[test]
    fn failed_message_has_no_model_or_confidence() {
        let session_id = Uuid::new_v4();
        let message = Message::assistant_failure(session_id, 3, "boom");
        assert!(message.is_failed());
        assert_eq!(message.text, "");
        assert_eq!(message.model_used, None);
        assert_eq!(message.confidence, None);
        assert_eq!(message.error.as_deref(), Some("boom"));
    }

    #[test]
    fn message_decodes_with_defaults() {
        let value = json!({
            "id": Uuid::nil(),
            "session_id": Uuid::nil(),
            "seq": 0,
            "role": "user",
            "text": "hi",
            "created_at": "2024-01-01T00:00:00Z",
        });
        let message: Message = serde_json::from_value(value).expect("decode");
        assert_eq!(message.status, MessageStatus::Final);
        assert!(message.image_refs.is_empty());
    }
}
