//! Session persistence using append-only JSONL rollouts.
//!
//! Each session lives in `<root>/<session_id>.jsonl`. The first line records
//! the schema version, the second the session creation; every later mutation
//! (append, replace, truncate, rename) is one more line. Loading a session
//! replays the rollout from the top.

use chrono::{DateTime, Utc};
use duet_rs_protocol::{
    Message, MessageId, SessionId, SessionSummary, StateStore, StoreError,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SCHEMA_VERSION: u32 = 1;

/// One line of a rollout file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RolloutEvent {
    SchemaVersion {
        version: u32,
    },
    SessionCreated {
        session_id: SessionId,
        title: String,
        created_at: DateTime<Utc>,
    },
    MessageAppended {
        message: Message,
    },
    MessageReplaced {
        message: Message,
        at: DateTime<Utc>,
    },
    Truncated {
        message_id: MessageId,
    },
    Renamed {
        title: String,
    },
}

/// Session state rebuilt by replaying a rollout.
#[derive(Default)]
struct RolloutState {
    version: Option<u32>,
    title: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_updated_at: Option<DateTime<Utc>>,
    messages: Vec<Message>,
}

impl RolloutState {
    fn apply(&mut self, event: RolloutEvent) -> Result<(), StoreError> {
        match event {
            RolloutEvent::SchemaVersion { version } => {
                if version > SCHEMA_VERSION {
                    return Err(StoreError::UnsupportedSchema(version));
                }
                self.version = Some(version);
            }
            RolloutEvent::SessionCreated {
                title, created_at, ..
            } => {
                self.title = Some(title);
                self.created_at = Some(created_at);
            }
            RolloutEvent::MessageAppended { message } => {
                self.last_updated_at = Some(message.created_at);
                self.messages.push(message);
            }
            RolloutEvent::MessageReplaced { message, at } => {
                let slot = self
                    .messages
                    .iter_mut()
                    .find(|existing| existing.id == message.id)
                    .ok_or(StoreError::MessageNotFound(message.id))?;
                *slot = message;
                self.last_updated_at = Some(at);
            }
            RolloutEvent::Truncated { message_id } => {
                let index = self
                    .position(message_id)
                    .ok_or(StoreError::MessageNotFound(message_id))?;
                self.messages.truncate(index);
            }
            RolloutEvent::Renamed { title } => self.title = Some(title),
        }
        Ok(())
    }

    fn position(&self, message_id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id == message_id)
    }

    fn summary(&self, session_id: SessionId) -> Result<SessionSummary, StoreError> {
        self.version.ok_or(StoreError::MissingMetadata)?;
        let title = self.title.clone().ok_or(StoreError::MissingMetadata)?;
        let created_at = self.created_at.ok_or(StoreError::MissingMetadata)?;
        Ok(SessionSummary {
            id: session_id,
            title,
            created_at,
            last_updated_at: self.last_updated_at.unwrap_or(created_at),
            message_count: self.messages.len(),
        })
    }
}

/// JSONL-backed state store.
pub struct JsonlStateStore {
    /// Root directory for session rollouts.
    root: PathBuf,
    /// Serialize access to rollout files.
    write_lock: Mutex<()>,
}

impl JsonlStateStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        info!("initialized JSONL state store (root={})", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    /// Directory holding the rollouts.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn rollout_path(&self, session_id: SessionId) -> PathBuf {
        self.root.join(format!("{session_id}.jsonl"))
    }

    /// Append one event to an existing rollout.
    ///
    /// Caller must hold `write_lock`.
    fn write_event(&self, session_id: SessionId, event: &RolloutEvent) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(self.rollout_path(session_id))?;
        let line = serde_json::to_string(event)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn write_new_rollout(
        &self,
        session_id: SessionId,
        event: &RolloutEvent,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.rollout_path(session_id);
        if path.exists() {
            return Err(StoreError::SessionExists(session_id));
        }
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let header = serde_json::to_string(&RolloutEvent::SchemaVersion {
            version: SCHEMA_VERSION,
        })?;
        let line = serde_json::to_string(event)?;
        write!(file, "{header}\n{line}\n")?;
        Ok(())
    }

    /// Replay a rollout; `None` when the session has no file.
    fn read_rollout(&self, session_id: SessionId) -> Result<Option<RolloutState>, StoreError> {
        let path = self.rollout_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(OpenOptions::new().read(true).open(&path)?);
        let mut rollout = RolloutState::default();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RolloutEvent = serde_json::from_str(&line)?;
            rollout.apply(event)?;
        }
        Ok(Some(rollout))
    }

    fn require_rollout(&self, session_id: SessionId) -> Result<RolloutState, StoreError> {
        self.read_rollout(session_id)?
            .ok_or(StoreError::SessionNotFound(session_id))
    }
}

impl StateStore for JsonlStateStore {
    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok())
            else {
                continue;
            };
            let summary = self
                .read_rollout(session_id)
                .and_then(|rollout| match rollout {
                    Some(rollout) => rollout.summary(session_id).map(Some),
                    None => Ok(None),
                });
            match summary {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => {}
                Err(err) => warn!(
                    "skipping unreadable rollout (session_id={}, err={})",
                    session_id, err
                ),
            }
        }
        summaries.sort_by(|a, b| {
            b.last_updated_at
                .cmp(&a.last_updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(summaries)
    }

    fn load_messages(&self, session_id: SessionId) -> Result<Vec<Message>, StoreError> {
        let rollout = self.require_rollout(session_id)?;
        rollout.summary(session_id)?;
        debug!(
            "loaded session rollout (session_id={}, messages={})",
            session_id,
            rollout.messages.len()
        );
        Ok(rollout.messages)
    }

    fn append_message(
        &self,
        session_id: SessionId,
        message: &Message,
    ) -> Result<MessageId, StoreError> {
        let _guard = self.write_lock.lock();
        if !self.rollout_path(session_id).exists() {
            return Err(StoreError::SessionNotFound(session_id));
        }
        debug!(
            "appending message event (session_id={}, role={}, text_len={}, images={})",
            session_id,
            message.role.as_str(),
            message.text.len(),
            message.image_refs.len()
        );
        let mut message = message.clone();
        message.session_id = session_id;
        let message_id = message.id;
        self.write_event(session_id, &RolloutEvent::MessageAppended { message })?;
        Ok(message_id)
    }

    fn replace_message(
        &self,
        message_id: MessageId,
        message: &Message,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let session_id = message.session_id;
        let rollout = self.require_rollout(session_id)?;
        let existing = rollout
            .position(message_id)
            .map(|index| &rollout.messages[index])
            .ok_or(StoreError::MessageNotFound(message_id))?;
        debug!(
            "replacing message (session_id={}, message_id={}, seq={})",
            session_id, message_id, existing.seq
        );
        let mut message = message.clone();
        message.id = message_id;
        message.seq = existing.seq;
        self.write_event(
            session_id,
            &RolloutEvent::MessageReplaced {
                message,
                at: Utc::now(),
            },
        )
    }

    fn truncate_after(
        &self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let rollout = self.require_rollout(session_id)?;
        let index = rollout
            .position(message_id)
            .ok_or(StoreError::MessageNotFound(message_id))?;
        debug!(
            "truncating session (session_id={}, message_id={}, dropped={})",
            session_id,
            message_id,
            rollout.messages.len() - index
        );
        self.write_event(session_id, &RolloutEvent::Truncated { message_id })
    }

    fn create_session(&self, title: &str) -> Result<SessionSummary, StoreError> {
        let session_id = Uuid::new_v4();
        let created_at = Utc::now();
        info!("recording session creation (session_id={})", session_id);
        self.write_new_rollout(
            session_id,
            &RolloutEvent::SessionCreated {
                session_id,
                title: title.to_string(),
                created_at,
            },
        )?;
        Ok(SessionSummary {
            id: session_id,
            title: title.to_string(),
            created_at,
            last_updated_at: created_at,
            message_count: 0,
        })
    }

    fn delete_session(&self, session_id: SessionId) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let path = self.rollout_path(session_id);
        if path.exists() {
            info!("deleting session rollout (session_id={})", session_id);
            fs::remove_file(path)?;
            Ok(true)
        } else {
            warn!("session rollout not found (session_id={})", session_id);
            Ok(false)
        }
    }

    fn rename_session(&self, session_id: SessionId, title: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        if !self.rollout_path(session_id).exists() {
            return Err(StoreError::SessionNotFound(session_id));
        }
        debug!(
            "renaming session (session_id={}, title_len={})",
            session_id,
            title.len()
        );
        self.write_event(
            session_id,
            &RolloutEvent::Renamed {
                title: title.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::JsonlStateStore;
    use duet_rs_protocol::{Message, StateStore, StoreError};
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn jsonl_state_store_round_trip() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStateStore::new(temp.path()).expect("store");
        let summary = store.create_session("New Chat").expect("create");
        assert_eq!(summary.message_count, 0);

        let user = Message::user(summary.id, 0, "hello", Vec::new());
        let reply = Message::assistant_reply(summary.id, 1, "hi", "gemini-1.5-flash", 0.9);
        assert_eq!(store.append_message(summary.id, &user).expect("append"), user.id);
        store.append_message(summary.id, &reply).expect("append");

        let reopened = JsonlStateStore::new(temp.path()).expect("store");
        assert_eq!(
            reopened.load_messages(summary.id).expect("load"),
            vec![user, reply.clone()]
        );
        let summaries = reopened.list_sessions().expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_count, 2);
        assert_eq!(summaries[0].last_updated_at, reply.created_at);

        assert!(reopened.delete_session(summary.id).expect("delete"));
        assert!(!reopened.delete_session(summary.id).expect("delete again"));
        let err = reopened.load_messages(summary.id).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn replace_truncate_and_rename_replay() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStateStore::new(temp.path()).expect("store");
        let session = store.create_session("New Chat").expect("create");

        let messages: Vec<Message> = (0..4)
            .map(|seq| Message::user(session.id, seq, format!("m{seq}"), Vec::new()))
            .collect();
        for message in &messages {
            store.append_message(session.id, message).expect("append");
        }

        let mut edited = messages[1].clone();
        edited.text = "edited".to_string();
        edited.seq = 99;
        store
            .replace_message(messages[1].id, &edited)
            .expect("replace");
        store
            .truncate_after(session.id, messages[2].id)
            .expect("truncate");
        store.rename_session(session.id, "Renamed").expect("rename");

        let reopened = JsonlStateStore::new(temp.path()).expect("store");
        let loaded = reopened.load_messages(session.id).expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].id, messages[1].id);
        assert_eq!(loaded[1].text, "edited");
        assert_eq!(loaded[1].seq, 1);
        let summary = reopened.list_sessions().expect("list").remove(0);
        assert_eq!(summary.title, "Renamed");
        assert_eq!(summary.message_count, 2);
    }

    #[test]
    fn missing_targets_are_not_found() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStateStore::new(temp.path()).expect("store");
        let ghost = Uuid::new_v4();
        let message = Message::user(ghost, 0, "hi", Vec::new());
        assert!(matches!(
            store.append_message(ghost, &message),
            Err(StoreError::SessionNotFound(id)) if id == ghost
        ));

        let session = store.create_session("New Chat").expect("create");
        let message = Message::user(session.id, 0, "hi", Vec::new());
        assert!(matches!(
            store.replace_message(message.id, &message),
            Err(StoreError::MessageNotFound(_))
        ));
        assert!(matches!(
            store.truncate_after(session.id, Uuid::new_v4()),
            Err(StoreError::MessageNotFound(_))
        ));
        assert!(store.rename_session(ghost, "x").unwrap_err().is_not_found());
    }

    #[test]
    fn list_skips_corrupt_rollouts() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStateStore::new(temp.path()).expect("store");
        let good = store.create_session("Good").expect("create");
        fs::write(temp.path().join(format!("{}.jsonl", Uuid::new_v4())), "{oops\n")
            .expect("write");
        fs::write(temp.path().join("notes.txt"), "ignored").expect("write");

        let summaries = store.list_sessions().expect("list");
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, good.id);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let store = JsonlStateStore::new(temp.path()).expect("store");
        let session_id = Uuid::new_v4();
        fs::write(
            temp.path().join(format!("{session_id}.jsonl")),
            "{\"type\":\"schema_version\",\"version\":7}\n",
        )
        .expect("write");
        assert!(matches!(
            store.load_messages(session_id),
            Err(StoreError::UnsupportedSchema(7))
        ));
    }
}
