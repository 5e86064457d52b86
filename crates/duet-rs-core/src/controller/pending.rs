//! Store writes that failed and wait to be replayed.

use duet_rs_protocol::{Message, MessageId, SessionId, StateStore, StoreError};
use log::{debug, warn};
use std::collections::VecDeque;

/// A single store mutation issued by the controller.
#[derive(Debug, Clone)]
pub(crate) enum PendingWrite {
    Append {
        session_id: SessionId,
        message: Message,
    },
    Replace {
        message_id: MessageId,
        message: Message,
    },
    Truncate {
        session_id: SessionId,
        message_id: MessageId,
    },
    Rename {
        session_id: SessionId,
        title: String,
    },
}

impl PendingWrite {
    fn session_id(&self) -> SessionId {
        match self {
            PendingWrite::Append { session_id, .. }
            | PendingWrite::Truncate { session_id, .. }
            | PendingWrite::Rename { session_id, .. } => *session_id,
            PendingWrite::Replace { message, .. } => message.session_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            PendingWrite::Append { .. } => "append",
            PendingWrite::Replace { .. } => "replace",
            PendingWrite::Truncate { .. } => "truncate",
            PendingWrite::Rename { .. } => "rename",
        }
    }

    fn apply(&self, store: &dyn StateStore) -> Result<(), StoreError> {
        match self {
            PendingWrite::Append {
                session_id,
                message,
            } => store.append_message(*session_id, message).map(|_| ()),
            PendingWrite::Replace {
                message_id,
                message,
            } => store.replace_message(*message_id, message),
            PendingWrite::Truncate {
                session_id,
                message_id,
            } => store.truncate_after(*session_id, *message_id),
            PendingWrite::Rename { session_id, title } => store.rename_session(*session_id, title),
        }
    }
}

/// FIFO of writes the store rejected. Writes are replayed in issue order
/// before any newer write reaches the store.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    queue: VecDeque<PendingWrite>,
}

impl PendingWrites {
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn has_session(&self, session_id: SessionId) -> bool {
        self.queue
            .iter()
            .any(|write| write.session_id() == session_id)
    }

    /// Replay queued writes in order, stopping at the first failure.
    ///
    /// Writes whose target no longer exists are dropped.
    pub(crate) fn flush(&mut self, store: &dyn StateStore) -> Result<(), StoreError> {
        while let Some(write) = self.queue.front() {
            match write.apply(store) {
                Ok(()) => {
                    debug!(
                        "replayed pending write (kind={}, session_id={})",
                        write.kind(),
                        write.session_id()
                    );
                }
                Err(err) if err.is_not_found() => {
                    warn!(
                        "dropping pending write with missing target (kind={}, session_id={}, err={})",
                        write.kind(),
                        write.session_id(),
                        err
                    );
                }
                Err(err) => return Err(err),
            }
            self.queue.pop_front();
        }
        Ok(())
    }

    /// Flush, then apply `write`. A write that cannot be applied is queued
    /// behind the earlier ones; not-found failures are returned but not queued.
    pub(crate) fn write(
        &mut self,
        store: &dyn StateStore,
        write: PendingWrite,
    ) -> Result<(), StoreError> {
        let result = self.flush(store).and_then(|()| write.apply(store));
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Err(err),
            Err(err) => {
                self.queue.push_back(write);
                Err(err)
            }
        }
    }

    pub(crate) fn discard_session(&mut self, session_id: SessionId) {
        self.queue.retain(|write| write.session_id() != session_id);
    }

    /// Drop queued renames so an explicit rename is not overwritten on replay.
    pub(crate) fn discard_renames(&mut self, session_id: SessionId) {
        self.queue.retain(|write| {
            !matches!(write, PendingWrite::Rename { session_id: id, .. } if *id == session_id)
        });
    }
}
