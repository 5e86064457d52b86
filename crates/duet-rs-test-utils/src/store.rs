use duet_rs_protocol::{
    Message, MessageId, SessionId, SessionSummary, StateStore, StoreError,
};
use parking_lot::Mutex;
use std::collections::HashSet;

/// `StateStore` wrapper that fails writes on demand. Reads always pass
/// through to the inner store.
#[derive(Debug, Default)]
pub struct FlakyStateStore<S> {
    inner: S,
    failures: Mutex<Failures>,
}

#[derive(Debug, Default)]
struct Failures {
    remaining: usize,
    always: bool,
    /// Operations that fail until restored, e.g. `"create"`.
    operations: HashSet<String>,
    injected: usize,
}

impl<S: StateStore> FlakyStateStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failures: Mutex::new(Failures::default()),
        }
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.failures.lock().remaining = count;
    }

    /// Fail every write until turned off.
    pub fn fail_writes(&self, always: bool) {
        self.failures.lock().always = always;
    }

    /// Fail every `op` write (`append`, `replace`, `truncate`, `create`,
    /// `delete`, or `rename`) until restored.
    pub fn fail_operation(&self, op: &str) {
        self.failures.lock().operations.insert(op.to_string());
    }

    pub fn restore_operation(&self, op: &str) {
        self.failures.lock().operations.remove(op);
    }

    /// Number of writes rejected so far.
    pub fn injected_failures(&self) -> usize {
        self.failures.lock().injected
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check_write(&self, op: &str) -> Result<(), StoreError> {
        let mut failures = self.failures.lock();
        if failures.always || failures.remaining > 0 || failures.operations.contains(op) {
            failures.remaining = failures.remaining.saturating_sub(1);
            failures.injected += 1;
            return Err(StoreError::WriteFailed(format!("injected {op} failure")));
        }
        Ok(())
    }
}

impl<S: StateStore> StateStore for FlakyStateStore<S> {
    fn list_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.inner.list_sessions()
    }

    fn load_messages(&self, session_id: SessionId) -> Result<Vec<Message>, StoreError> {
        self.inner.load_messages(session_id)
    }

    fn append_message(
        &self,
        session_id: SessionId,
        message: &Message,
    ) -> Result<MessageId, StoreError> {
        self.check_write("append")?;
        self.inner.append_message(session_id, message)
    }

    fn replace_message(
        &self,
        message_id: MessageId,
        message: &Message,
    ) -> Result<(), StoreError> {
        self.check_write("replace")?;
        self.inner.replace_message(message_id, message)
    }

    fn truncate_after(
        &self,
        session_id: SessionId,
        message_id: MessageId,
    ) -> Result<(), StoreError> {
        self.check_write("truncate")?;
        self.inner.truncate_after(session_id, message_id)
    }

    fn create_session(&self, title: &str) -> Result<SessionSummary, StoreError> {
        self.check_write("create")?;
        self.inner.create_session(title)
    }

    fn delete_session(&self, session_id: SessionId) -> Result<bool, StoreError> {
        self.check_write("delete")?;
        self.inner.delete_session(session_id)
    }

    fn rename_session(&self, session_id: SessionId, title: &str) -> Result<(), StoreError> {
        self.check_write("rename")?;
        self.inner.rename_session(session_id, title)
    }
}
