//! Core conversation engine for Duet.
//!
//! This crate owns the conversation controller, context windowing, the
//! dispatch and consensus engine, the hosted-model adapters, and the session
//! stores used by the CLI and embedders.

pub mod adapters;
pub mod context;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod state;

pub use adapters::{AdapterBuildError, GeminiAdapter, HuggingFaceAdapter, build_adapters};
pub use context::ContextWindow;
/// Controller facade and turn results.
pub use controller::{ConversationController, DEFAULT_SESSION_TITLE, TurnOutcome, TurnStatus};
pub use dispatch::{
    AdapterSuccess, DispatchEngine, DispatchFailure, DispatchOutcome, ScoringPolicy,
};
pub use duet_rs_protocol::EventSink;
pub use error::ControllerError;
pub use events::EventBus;
/// Session store implementations.
pub use state::{JsonlStateStore, MemoryStateStore, build_state_store};
