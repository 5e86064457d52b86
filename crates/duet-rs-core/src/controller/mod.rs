//! Conversation controller: owns the session list and the active session,
//! runs turns through the dispatch engine, and publishes `ChatSnapshot`s.
//!
//! All mutable state sits behind one `parking_lot::Mutex` that is never held
//! across an `.await`. A turn locks to record the user message and build its
//! context, releases the lock for dispatch, then locks again to record the
//! reply. Store calls are synchronous and happen under the lock.

mod pending;

use crate::context::ContextWindow;
use crate::dispatch::{DispatchEngine, DispatchFailure, DispatchOutcome};
use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use duet_rs_config::DuetConfig;
use duet_rs_protocol::{
    ChatSnapshot, ConversationContext, DispatchMode, EventMsg, EventPayload, EventSink, ImageRef,
    Message, MessageId, ModelAdapter, Role, SessionId, SessionSummary, StateStore, TurnId,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use pending::{PendingWrite, PendingWrites};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Title given to sessions until the first user message names them.
pub const DEFAULT_SESSION_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 40;

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnStatus {
    /// A final assistant reply was recorded.
    Completed(Message),
    /// A failed assistant message was recorded.
    Failed(Message),
    /// The turn was cancelled. No reply was recorded, and a prompt left
    /// without an answer was withdrawn from the session.
    Cancelled,
}

/// Result of `send_message`, `retry_last_message`, or `edit_message`.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: TurnId,
    pub status: TurnStatus,
    /// False while some of the session's writes wait in the replay queue.
    pub persisted: bool,
}

impl TurnOutcome {
    /// Assistant message recorded by the turn, if any.
    pub fn message(&self) -> Option<&Message> {
        match &self.status {
            TurnStatus::Completed(message) | TurnStatus::Failed(message) => Some(message),
            TurnStatus::Cancelled => None,
        }
    }
}

/// Where the assistant message of a turn goes.
enum Placement {
    /// Answer `prompt`, the session's last message.
    Append { prompt: MessageId },
    /// Overwrite a failed reply, keeping its id and sequence number.
    Replace { message_id: MessageId, seq: u64 },
}

/// Everything a turn needs once the lock is released.
struct PreparedTurn {
    session_id: SessionId,
    turn_id: TurnId,
    cancel: CancellationToken,
    context: Arc<ConversationContext>,
    mode: DispatchMode,
    placement: Placement,
    events: Vec<EventPayload>,
}

struct InFlightTurn {
    turn_id: TurnId,
    cancel: CancellationToken,
    /// User message left unanswered if the turn is cancelled.
    prompt: Option<MessageId>,
}

#[derive(Default)]
struct ControllerState {
    /// Known sessions, most recently updated first.
    sessions: Vec<SessionSummary>,
    /// Messages of every session loaded so far.
    messages: HashMap<SessionId, Vec<Message>>,
    active: Option<SessionId>,
    turns: HashMap<SessionId, InFlightTurn>,
    mode: DispatchMode,
    error: Option<String>,
    pending: PendingWrites,
}

impl ControllerState {
    fn active_id(&self) -> Result<SessionId, ControllerError> {
        self.active.ok_or(ControllerError::NoActiveSession)
    }

    fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.iter().any(|summary| summary.id == session_id)
    }

    fn summary_mut(&mut self, session_id: SessionId) -> Option<&mut SessionSummary> {
        self.sessions
            .iter_mut()
            .find(|summary| summary.id == session_id)
    }

    fn messages_mut(&mut self, session_id: SessionId) -> &mut Vec<Message> {
        self.messages.entry(session_id).or_default()
    }

    fn start_turn(
        &mut self,
        session_id: SessionId,
        root: &CancellationToken,
        prompt: Option<MessageId>,
    ) -> (TurnId, CancellationToken) {
        let turn_id = Uuid::new_v4();
        let cancel = root.child_token();
        self.turns.insert(
            session_id,
            InFlightTurn {
                turn_id,
                cancel: cancel.clone(),
                prompt,
            },
        );
        (turn_id, cancel)
    }

    fn finish_turn(&mut self, session_id: SessionId, turn_id: TurnId) {
        if self
            .turns
            .get(&session_id)
            .is_some_and(|turn| turn.turn_id == turn_id)
        {
            self.turns.remove(&session_id);
        }
    }

    fn cancel_turn(&mut self, session_id: SessionId) -> Option<InFlightTurn> {
        let turn = self.turns.remove(&session_id)?;
        info!(
            "cancelling in-flight turn (session_id={}, turn_id={})",
            session_id, turn.turn_id
        );
        turn.cancel.cancel();
        Some(turn)
    }

    /// Sync the cached summary with the session's messages after a write.
    fn touch(&mut self, session_id: SessionId, at: DateTime<Utc>) {
        let count = self.messages.get(&session_id).map_or(0, Vec::len);
        if let Some(summary) = self.summary_mut(session_id) {
            summary.message_count = count;
            summary.last_updated_at = at;
        }
        self.sort_sessions();
    }

    fn sort_sessions(&mut self) {
        self.sessions.sort_by(|a, b| {
            b.last_updated_at
                .cmp(&a.last_updated_at)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
    }

    fn snapshot(&self) -> ChatSnapshot {
        let current_session = self.active.and_then(|active| {
            self.sessions
                .iter()
                .find(|summary| summary.id == active)
                .cloned()
        });
        ChatSnapshot {
            current_messages: self
                .active
                .and_then(|active| self.messages.get(&active).cloned())
                .unwrap_or_default(),
            is_loading: self
                .active
                .is_some_and(|active| self.turns.contains_key(&active)),
            error: self.error.clone(),
            chat_sessions: self.sessions.clone(),
            current_session,
            mode: self.mode.clone(),
        }
    }
}

/// Shared, thread-safe conversation controller.
pub struct ConversationController {
    engine: DispatchEngine,
    store: Arc<dyn StateStore>,
    window: ContextWindow,
    event_sink: Option<Arc<dyn EventSink>>,
    shutdown: CancellationToken,
    state: Mutex<ControllerState>,
    snapshot: watch::Sender<ChatSnapshot>,
}

impl ConversationController {
    /// Build a controller. Call `initialize` before the first turn.
    pub fn new(engine: DispatchEngine, store: Arc<dyn StateStore>, window: ContextWindow) -> Self {
        let (snapshot, _) = watch::channel(ChatSnapshot::default());
        Self {
            engine,
            store,
            window,
            event_sink: None,
            shutdown: CancellationToken::new(),
            state: Mutex::new(ControllerState::default()),
            snapshot,
        }
    }

    /// Build a controller from loaded config and already constructed adapters.
    pub fn from_config(
        config: &DuetConfig,
        adapters: Vec<Arc<dyn ModelAdapter>>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, ControllerError> {
        let engine = DispatchEngine::new(adapters, &config.dispatch);
        let window = ContextWindow::new(config.context.window_size);
        Self::new(engine, store, window).with_mode(config.dispatch.dispatch_mode())
    }

    /// Forward lifecycle events to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Start in `mode` instead of auto.
    pub fn with_mode(self, mode: DispatchMode) -> Result<Self, ControllerError> {
        self.validate_mode(&mode)?;
        self.state.lock().mode = mode;
        Ok(self)
    }

    /// Load the session list and activate the most recently updated session,
    /// creating one when the store is empty. Repeated calls are no-ops.
    pub async fn initialize(&self) -> Result<(), ControllerError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.ensure_running()?;
            if state.active.is_some() {
                return Ok(());
            }
            let mut sessions = self.store.list_sessions()?;
            if sessions.is_empty() {
                let summary = self.store.create_session(DEFAULT_SESSION_TITLE)?;
                events.push((
                    summary.id,
                    EventPayload::SessionCreated {
                        title: summary.title.clone(),
                    },
                ));
                sessions.push(summary);
            }
            let active = sessions[0].id;
            let messages = self.store.load_messages(active)?;
            info!(
                "controller initialized (sessions={}, active={}, messages={})",
                sessions.len(),
                active,
                messages.len()
            );
            state.sessions = sessions;
            state.sort_sessions();
            state.messages.insert(active, messages);
            state.active = Some(active);
            self.publish(&state);
        }
        for (session_id, payload) in events {
            self.emit(session_id, payload);
        }
        Ok(())
    }

    /// Submit a user turn and wait for its reply.
    ///
    /// Adapter failures are recorded as a failed assistant message rather
    /// than returned as errors.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
        images: Vec<ImageRef>,
    ) -> Result<TurnOutcome, ControllerError> {
        let text = text.into();
        if text.trim().is_empty() && images.is_empty() {
            return Err(ControllerError::EmptyMessage);
        }
        let prepared = {
            let mut state = self.state.lock();
            let session_id = self.ready_session(&state)?;
            let is_first = state
                .messages
                .get(&session_id)
                .is_none_or(|messages| messages.is_empty());
            let messages = state.messages_mut(session_id);
            let user = Message::user(session_id, next_seq(messages), text, images);
            messages.push(user.clone());
            debug!(
                "user message recorded (session_id={}, seq={}, text_len={}, images={})",
                session_id,
                user.seq,
                user.text.len(),
                user.image_refs.len()
            );
            let context = Arc::new(self.window.build(messages));

            state.error = None;
            let created_at = user.created_at;
            self.persist(
                &mut state,
                PendingWrite::Append {
                    session_id,
                    message: user.clone(),
                },
            );
            state.touch(session_id, created_at);

            let mut events = Vec::new();
            if is_first {
                if let Some(title) = self.auto_title(&mut state, session_id, &user.text) {
                    events.push(EventPayload::SessionRenamed { title });
                }
            }
            let placement = Placement::Append { prompt: user.id };
            self.prepare_turn(&mut state, session_id, context, placement, events)
        };
        self.run_turn(prepared).await
    }

    /// Re-run the turn whose reply failed, replacing the failed message.
    pub async fn retry_last_message(&self) -> Result<TurnOutcome, ControllerError> {
        let prepared = {
            let mut state = self.state.lock();
            let session_id = self.ready_session(&state)?;
            let messages = state.messages_mut(session_id);
            let (failed, history) = messages
                .split_last()
                .filter(|(last, _)| last.role == Role::Assistant && last.is_failed())
                .ok_or(ControllerError::NotRetryable)?;
            let placement = Placement::Replace {
                message_id: failed.id,
                seq: failed.seq,
            };
            debug!(
                "retrying failed reply (session_id={}, message_id={})",
                session_id, failed.id
            );
            let context = Arc::new(self.window.build(history));
            state.error = None;
            self.prepare_turn(&mut state, session_id, context, placement, Vec::new())
        };
        self.run_turn(prepared).await
    }

    /// Rewrite a user message, drop everything after it, and answer it again.
    pub async fn edit_message(
        &self,
        message_id: MessageId,
        new_text: impl Into<String>,
    ) -> Result<TurnOutcome, ControllerError> {
        let new_text = new_text.into();
        let prepared = {
            let mut state = self.state.lock();
            let session_id = self.ready_session(&state)?;
            let messages = state.messages_mut(session_id);
            let index = messages
                .iter()
                .position(|message| message.id == message_id)
                .ok_or(ControllerError::UnknownMessage(message_id))?;
            let target = &mut messages[index];
            if target.role != Role::User {
                return Err(ControllerError::NotEditable(message_id));
            }
            if new_text.trim().is_empty() && target.image_refs.is_empty() {
                return Err(ControllerError::EmptyMessage);
            }
            target.text = new_text;
            let edited = target.clone();
            let following = messages.get(index + 1).map(|message| message.id);
            let dropped = messages.len() - index - 1;
            messages.truncate(index + 1);
            let context = Arc::new(self.window.build(messages));
            info!(
                "editing message (session_id={}, message_id={}, dropped={})",
                session_id, message_id, dropped
            );

            state.error = None;
            if let Some(following) = following {
                self.persist(
                    &mut state,
                    PendingWrite::Truncate {
                        session_id,
                        message_id: following,
                    },
                );
            }
            self.persist(
                &mut state,
                PendingWrite::Replace {
                    message_id,
                    message: edited,
                },
            );
            state.touch(session_id, Utc::now());
            let placement = Placement::Append { prompt: message_id };
            self.prepare_turn(&mut state, session_id, context, placement, Vec::new())
        };
        self.run_turn(prepared).await
    }

    /// Create an empty session and make it active.
    pub async fn create_new_chat_session(&self) -> Result<SessionSummary, ControllerError> {
        let summary = {
            let mut state = self.state.lock();
            self.ensure_running()?;
            self.flush_pending(&mut state);
            let summary = self.store.create_session(DEFAULT_SESSION_TITLE)?;
            info!("created session (session_id={})", summary.id);
            if let Some(previous) = state.active {
                self.abandon_turn(&mut state, previous);
            }
            state.sessions.push(summary.clone());
            state.sort_sessions();
            state.messages.insert(summary.id, Vec::new());
            state.active = Some(summary.id);
            state.error = None;
            self.publish(&state);
            summary
        };
        self.emit(
            summary.id,
            EventPayload::SessionCreated {
                title: summary.title.clone(),
            },
        );
        Ok(summary)
    }

    /// Make `session_id` active, cancelling the turn in flight on the session
    /// being left.
    pub async fn switch_to_chat_session(&self, session_id: SessionId) -> Result<(), ControllerError> {
        {
            let mut state = self.state.lock();
            self.ensure_running()?;
            if state.active == Some(session_id) {
                return Ok(());
            }
            if !state.contains(session_id) {
                return Err(ControllerError::UnknownSession(session_id));
            }
            self.activate(&mut state, session_id)?;
            self.publish(&state);
        }
        self.emit(session_id, EventPayload::SessionSwitched);
        Ok(())
    }

    /// Delete a session. Deleting the active session activates the most
    /// recently updated remaining one, or a fresh session when none is left.
    ///
    /// Store calls that can fail run before any in-memory change, so an error
    /// leaves the session, its turn, and its queued writes in place.
    pub async fn delete_chat_session(&self, session_id: SessionId) -> Result<(), ControllerError> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.ensure_running()?;
            if !state.contains(session_id) {
                return Err(ControllerError::UnknownSession(session_id));
            }

            let mut replacement = None;
            let next = if state.active == Some(session_id) {
                let successor = state
                    .sessions
                    .iter()
                    .map(|summary| summary.id)
                    .find(|id| *id != session_id);
                match successor {
                    Some(next) => {
                        if !state.messages.contains_key(&next) {
                            let messages = self.store.load_messages(next)?;
                            state.messages.insert(next, messages);
                        }
                        Some(next)
                    }
                    None => {
                        let summary = self.store.create_session(DEFAULT_SESSION_TITLE)?;
                        let next = summary.id;
                        replacement = Some(summary);
                        Some(next)
                    }
                }
            } else {
                None
            };

            if let Err(err) = self.store.delete_session(session_id) {
                warn!(
                    "session delete failed (session_id={}, err={})",
                    session_id, err
                );
                if let Some(summary) = replacement {
                    state.messages.insert(summary.id, Vec::new());
                    state.sessions.push(summary);
                    state.sort_sessions();
                    self.publish(&state);
                }
                return Err(err.into());
            }
            info!("deleted session (session_id={})", session_id);
            state.cancel_turn(session_id);
            state.pending.discard_session(session_id);
            state.sessions.retain(|summary| summary.id != session_id);
            state.messages.remove(&session_id);
            events.push((session_id, EventPayload::SessionDeleted));

            if let Some(summary) = replacement {
                events.push((
                    summary.id,
                    EventPayload::SessionCreated {
                        title: summary.title.clone(),
                    },
                ));
                state.messages.insert(summary.id, Vec::new());
                state.sessions.push(summary);
                state.sort_sessions();
            }
            if let Some(next) = next {
                state.active = None;
                self.activate(&mut state, next)?;
                events.push((next, EventPayload::SessionSwitched));
            }
            self.publish(&state);
        }
        for (session_id, payload) in events {
            self.emit(session_id, payload);
        }
        Ok(())
    }

    pub async fn rename_chat_session(
        &self,
        session_id: SessionId,
        title: &str,
    ) -> Result<(), ControllerError> {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(ControllerError::EmptyTitle);
        }
        {
            let mut state = self.state.lock();
            self.ensure_running()?;
            if !state.contains(session_id) {
                return Err(ControllerError::UnknownSession(session_id));
            }
            state.pending.discard_renames(session_id);
            self.store.rename_session(session_id, &title)?;
            if let Some(summary) = state.summary_mut(session_id) {
                summary.title = title.clone();
            }
            self.publish(&state);
        }
        self.emit(session_id, EventPayload::SessionRenamed { title });
        Ok(())
    }

    /// Select the adapter used for new turns, or auto.
    pub async fn set_dispatch_mode(&self, mode: DispatchMode) -> Result<(), ControllerError> {
        self.validate_mode(&mode)?;
        let mut state = self.state.lock();
        info!("dispatch mode set (mode={})", mode);
        state.mode = mode;
        self.publish(&state);
        Ok(())
    }

    pub async fn clear_error(&self) {
        let mut state = self.state.lock();
        state.error = None;
        self.publish(&state);
    }

    /// Latest published state.
    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published state.
    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshot.subscribe()
    }

    /// `subscribe` as a stream, starting with the current state.
    pub fn state_stream(&self) -> WatchStream<ChatSnapshot> {
        WatchStream::new(self.subscribe())
    }

    /// Store writes waiting to be replayed.
    pub fn pending_writes(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Registered adapter ids in priority order.
    pub fn adapter_ids(&self) -> Vec<String> {
        self.engine
            .adapter_ids()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Cancel every in-flight turn and refuse further work.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock();
        let sessions: Vec<SessionId> = state.turns.keys().copied().collect();
        for session_id in sessions {
            self.abandon_turn(&mut state, session_id);
        }
        self.flush_pending(&mut state);
        self.publish(&state);
        info!("controller shut down (pending_writes={})", state.pending.len());
    }

    fn ensure_running(&self) -> Result<(), ControllerError> {
        if self.shutdown.is_cancelled() {
            Err(ControllerError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Active session id, provided no turn is in flight for it.
    fn ready_session(&self, state: &ControllerState) -> Result<SessionId, ControllerError> {
        self.ensure_running()?;
        let session_id = state.active_id()?;
        if state.turns.contains_key(&session_id) {
            return Err(ControllerError::Busy(session_id));
        }
        Ok(session_id)
    }

    fn validate_mode(&self, mode: &DispatchMode) -> Result<(), ControllerError> {
        match mode {
            DispatchMode::Single(adapter_id) if !self.engine.has_adapter(adapter_id) => {
                Err(ControllerError::InvalidMode(adapter_id.clone()))
            }
            _ => Ok(()),
        }
    }

    fn activate(
        &self,
        state: &mut ControllerState,
        session_id: SessionId,
    ) -> Result<(), ControllerError> {
        if !state.messages.contains_key(&session_id) {
            let messages = self.store.load_messages(session_id)?;
            state.messages.insert(session_id, messages);
        }
        if let Some(previous) = state.active {
            self.abandon_turn(state, previous);
        }
        state.active = Some(session_id);
        state.error = None;
        debug!("session activated (session_id={})", session_id);
        Ok(())
    }

    /// Cancel the session's turn in flight and withdraw the user message it
    /// was answering, so the session never ends on an unanswered prompt.
    fn abandon_turn(&self, state: &mut ControllerState, session_id: SessionId) {
        let Some(prompt) = state.cancel_turn(session_id).and_then(|turn| turn.prompt) else {
            return;
        };
        let messages = state.messages_mut(session_id);
        let Some(index) = messages.iter().position(|message| message.id == prompt) else {
            return;
        };
        messages.truncate(index);
        info!(
            "withdrew unanswered prompt (session_id={}, message_id={})",
            session_id, prompt
        );
        self.persist(
            state,
            PendingWrite::Truncate {
                session_id,
                message_id: prompt,
            },
        );
        state.touch(session_id, Utc::now());
    }

    /// Register the turn as in flight and publish the loading state.
    fn prepare_turn(
        &self,
        state: &mut ControllerState,
        session_id: SessionId,
        context: Arc<ConversationContext>,
        placement: Placement,
        events: Vec<EventPayload>,
    ) -> PreparedTurn {
        let prompt = match placement {
            Placement::Append { prompt } => Some(prompt),
            Placement::Replace { .. } => None,
        };
        let (turn_id, cancel) = state.start_turn(session_id, &self.shutdown, prompt);
        self.publish(state);
        PreparedTurn {
            session_id,
            turn_id,
            cancel,
            context,
            mode: state.mode.clone(),
            placement,
            events,
        }
    }

    async fn run_turn(&self, turn: PreparedTurn) -> Result<TurnOutcome, ControllerError> {
        let PreparedTurn {
            session_id,
            turn_id,
            cancel,
            context,
            mode,
            placement,
            events,
        } = turn;
        for payload in events {
            self.emit(session_id, payload);
        }
        self.emit(
            session_id,
            EventPayload::TurnStarted {
                turn_id,
                mode: mode.clone(),
            },
        );
        info!(
            "turn started (session_id={}, turn_id={}, mode={}, context={})",
            session_id,
            turn_id,
            mode,
            context.len()
        );

        let result = self.engine.dispatch(context, &mode, cancel.clone()).await;

        let (outcome, payload, unsaved) = {
            let mut state = self.state.lock();
            state.finish_turn(session_id, turn_id);
            if cancel.is_cancelled() || state.active != Some(session_id) {
                info!(
                    "turn cancelled; no reply recorded (session_id={}, turn_id={})",
                    session_id, turn_id
                );
                self.publish(&state);
                let outcome = TurnOutcome {
                    turn_id,
                    status: TurnStatus::Cancelled,
                    persisted: !state.pending.has_session(session_id),
                };
                (outcome, EventPayload::TurnCancelled { turn_id }, None)
            } else {
                let (outcome, payload) =
                    self.record_reply(&mut state, session_id, turn_id, placement, result);
                let unsaved = if outcome.persisted {
                    None
                } else {
                    state.error.clone()
                };
                (outcome, payload, unsaved)
            }
        };
        self.emit(session_id, payload);
        if let Some(message) = unsaved {
            self.emit(session_id, EventPayload::Error { message });
        }
        Ok(outcome)
    }

    fn record_reply(
        &self,
        state: &mut ControllerState,
        session_id: SessionId,
        turn_id: TurnId,
        placement: Placement,
        result: Result<DispatchOutcome, DispatchFailure>,
    ) -> (TurnOutcome, EventPayload) {
        let messages = state.messages_mut(session_id);
        let seq = match placement {
            Placement::Append { .. } => next_seq(messages),
            Placement::Replace { seq, .. } => seq,
        };
        let (mut message, adapter_id) = match &result {
            Ok(outcome) => (
                Message::assistant_reply(
                    session_id,
                    seq,
                    outcome.winner.response.text.clone(),
                    outcome.winner.response.model_id.clone(),
                    outcome.winner.response.confidence_hint,
                ),
                Some(outcome.winner.adapter_id.clone()),
            ),
            Err(failure) => (
                Message::assistant_failure(session_id, seq, failure.to_string()),
                None,
            ),
        };

        let write = match placement {
            Placement::Append { .. } => {
                messages.push(message.clone());
                PendingWrite::Append {
                    session_id,
                    message: message.clone(),
                }
            }
            Placement::Replace { message_id, .. } => {
                message.id = message_id;
                if let Some(slot) = messages.iter_mut().find(|existing| existing.id == message_id) {
                    *slot = message.clone();
                }
                PendingWrite::Replace {
                    message_id,
                    message: message.clone(),
                }
            }
        };
        self.persist(state, write);
        state.touch(session_id, message.created_at);

        let persisted = !state.pending.has_session(session_id);
        match &result {
            Err(failure) => state.error = Some(failure.to_string()),
            Ok(_) if persisted => state.error = None,
            Ok(_) => {
                if state.error.is_none() {
                    state.error = Some("conversation not fully saved; will retry".to_string());
                }
            }
        }
        self.publish(state);

        match adapter_id {
            Some(adapter_id) => {
                info!(
                    "turn completed (session_id={}, turn_id={}, adapter_id={}, persisted={})",
                    session_id, turn_id, adapter_id, persisted
                );
                let payload = EventPayload::TurnCompleted {
                    turn_id,
                    message_id: message.id,
                    adapter_id,
                };
                let outcome = TurnOutcome {
                    turn_id,
                    status: TurnStatus::Completed(message),
                    persisted,
                };
                (outcome, payload)
            }
            None => {
                let reason = message.error.clone().unwrap_or_default();
                warn!(
                    "turn failed (session_id={}, turn_id={}, reason={})",
                    session_id, turn_id, reason
                );
                let payload = EventPayload::TurnFailed {
                    turn_id,
                    message_id: message.id,
                    reason,
                };
                let outcome = TurnOutcome {
                    turn_id,
                    status: TurnStatus::Failed(message),
                    persisted,
                };
                (outcome, payload)
            }
        }
    }

    /// Retitle a session still carrying the default title after its first
    /// user message.
    fn auto_title(
        &self,
        state: &mut ControllerState,
        session_id: SessionId,
        text: &str,
    ) -> Option<String> {
        let title = derive_title(text)?;
        let summary = state.summary_mut(session_id)?;
        if summary.title != DEFAULT_SESSION_TITLE {
            return None;
        }
        summary.title = title.clone();
        self.persist(
            state,
            PendingWrite::Rename {
                session_id,
                title: title.clone(),
            },
        );
        Some(title)
    }

    /// Write through the replay queue. Failures are queued and surfaced on
    /// the error banner.
    fn persist(&self, state: &mut ControllerState, write: PendingWrite) -> bool {
        match state.pending.write(self.store.as_ref(), write) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "store write failed (pending={}, err={})",
                    state.pending.len(),
                    err
                );
                state.error = Some(format!("failed to save conversation: {err}"));
                false
            }
        }
    }

    fn flush_pending(&self, state: &mut ControllerState) {
        if let Err(err) = state.pending.flush(self.store.as_ref()) {
            warn!(
                "pending writes still failing (pending={}, err={})",
                state.pending.len(),
                err
            );
        }
    }

    /// Publish under the state lock so receivers see states in order.
    fn publish(&self, state: &ControllerState) {
        self.snapshot.send_replace(state.snapshot());
    }

    fn emit(&self, session_id: SessionId, payload: EventPayload) {
        if let Some(sink) = &self.event_sink {
            sink.emit(EventMsg::new(session_id, payload));
        }
    }
}

fn next_seq(messages: &[Message]) -> u64 {
    messages.last().map_or(0, |message| message.seq + 1)
}

/// First non-empty line, cut to `TITLE_MAX_CHARS` with an ellipsis.
fn derive_title(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|line| !line.is_empty())?;
    if line.chars().count() <= TITLE_MAX_CHARS {
        return Some(line.to_string());
    }
    let cut: String = line.chars().take(TITLE_MAX_CHARS).collect();
    Some(format!("{}…", cut.trim_end()))
}
