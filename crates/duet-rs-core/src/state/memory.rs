//! In-process state store used when session persistence is disabled.

use chrono::Utc;
use duet_rs_protocol::{
    Message, MessageId, SessionId, SessionSummary, StateStore, StoreError,
};
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

struct MemorySession {
    summary: SessionSummary,
    messages: Vec<Message>,
}

impl MemorySession {
    fn position(&self, message_id: MessageId) -> Result<usize, StoreError> {
        self.messages
            .iter()
            .position(|message| message.id == message_id)
            .ok_or(StoreError::MessageNotFound(message_id))
    }
}

/// `StateStore` that keeps everything in memory; nothing survives the process.
#[derive(Default)]
pub struct MemoryStateStore {
    sessions: RwLock<HashMap<SessionId, MemorySession>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|session| session.summary.clone())
            .collect();
        summaries.sort_by(|a, b| {
            b.last_updated_at
                .cmp(&a.last_updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(summaries)
    }

    fn load_messages(&self, session_id: SessionId) -> Result<Vec<Message>, StoreError> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|session| session.messages.clone())
            .ok_or(StoreError::SessionNotFound(session_id))
    }

    fn append_message(
        &self,
        session_id: SessionId,
        message: &Message,
    ) -> Result<MessageId, StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StoreError::SessionNotFound(session_id))?;
        let mut message = message.clone();
        message.session_id = session_id;
        session.summary.last_updated_at = message.created_at;
        let message_id = message.id;
        session.messages.push(message);
        session.summary.message_count = session.messages.len();
        Ok(message_id)
    }

    fn replace_message(
        &self,
        message_id: MessageId,
        message: &Message,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&message.session_id)
            .ok_or(StoreError::SessionNotFound(message.session_id))?;
        let index = session.position(message_id)?;
        let slot = &mut session.messages[index];
        let seq = slot.seq;
        *slot = message.clone();
        slot.id = message_id;
        slot.seq = seq;
        session.summary.last_updated_at = Utc::now();
        Ok(())
    }

    fn truncate_after(
        &self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StoreError::SessionNotFound(session_id))?;
        let index = session.position(message_id)?;
        session.messages.truncate(index);
        session.summary.message_count = session.messages.len();
        Ok(())
    }

    fn create_session(&self, title: &str) -> Result<SessionSummary, StoreError> {
        let now = Utc::now();
        let summary = SessionSummary {
            id: Uuid::new_v4(),
            title: title.to_string(),
            created_at: now,
            last_updated_at: now,
            message_count: 0,
        };
        debug!("created in-memory session (session_id={})", summary.id);
        self.sessions.write().insert(
            summary.id,
            MemorySession {
                summary: summary.clone(),
                messages: Vec::new(),
            },
        );
        Ok(summary)
    }

    fn delete_session(&self, session_id: SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.write().remove(&session_id).is_some())
    }

    fn rename_session(&self, session_id: SessionId, title: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(&session_id)
            .ok_or(StoreError::SessionNotFound(session_id))?;
        session.summary.title = title.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStateStore;
    use duet_rs_protocol::{Message, StateStore};
    use pretty_assertions::assert_eq;

    #[test]
    fn truncate_is_inclusive_and_updates_count() {
        let store = MemoryStateStore::new();
        let session = store.create_session("New Chat").expect("create");
        let messages: Vec<Message> = (0..3)
            .map(|seq| Message::user(session.id, seq, format!("m{seq}"), Vec::new()))
            .collect();
        for message in &messages {
            store.append_message(session.id, message).expect("append");
        }
        store
            .truncate_after(session.id, messages[1].id)
            .expect("truncate");
        assert_eq!(
            store.load_messages(session.id).expect("load"),
            vec![messages[0].clone()]
        );
        assert_eq!(store.list_sessions().expect("list")[0].message_count, 1);
    }

    #[test]
    fn sessions_list_most_recent_first() {
        let store = MemoryStateStore::new();
        let older = store.create_session("older").expect("create");
        let newer = store.create_session("newer").expect("create");
        let message = Message::user(older.id, 0, "bump", Vec::new());
        store.append_message(older.id, &message).expect("append");

        let ids: Vec<_> = store
            .list_sessions()
            .expect("list")
            .into_iter()
            .map(|summary| summary.id)
            .collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }
}
