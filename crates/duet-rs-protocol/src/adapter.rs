//! Model adapter seam: the uniform capability every backend implements.

use crate::{ImageRef, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One message inside a context window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextMessage {
    pub role: Role,
    pub text: String,
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Bounded, immutable slice of history presented to an adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ConversationContext {
    messages: Vec<ContextMessage>,
}

impl ConversationContext {
    pub fn new(messages: Vec<ContextMessage>) -> Self {
        Self { messages }
    }

    /// Ordered context messages, oldest first.
    pub fn messages(&self) -> &[ContextMessage] {
        &self.messages
    }

    /// Most recent message, normally the user turn being answered.
    pub fn latest(&self) -> Option<&ContextMessage> {
        self.messages.last()
    }

    /// Every image carried by the window, in message order.
    pub fn images(&self) -> Vec<&ImageRef> {
        self.messages
            .iter()
            .flat_map(|message| message.images.iter())
            .collect()
    }

    /// Whether any message in the window carries images.
    pub fn has_images(&self) -> bool {
        self.messages.iter().any(|message| !message.images.is_empty())
    }

    /// Whether the turn being answered carries images.
    pub fn turn_has_images(&self) -> bool {
        self.latest()
            .map(|message| !message.images.is_empty())
            .unwrap_or(false)
    }

    /// Copy of this context with every image removed.
    pub fn without_images(&self) -> Self {
        Self {
            messages: self
                .messages
                .iter()
                .map(|message| ContextMessage {
                    role: message.role,
                    text: message.text.clone(),
                    images: Vec::new(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Request handed to a single adapter invocation.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    pub context: Arc<ConversationContext>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl AdapterRequest {
    pub fn new(context: Arc<ConversationContext>) -> Self {
        Self {
            context,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Successful adapter reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResponse {
    /// Reply text.
    pub text: String,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence_hint: f32,
    /// Backend model that produced the reply.
    pub model_id: String,
}

/// Typed adapter failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterFailure {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("cancelled")]
    Cancelled,
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|delay| format!(" (retry after {}s)", delay.as_secs()))
        .unwrap_or_default()
}

/// Capability wrapper around one AI backend.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Stable adapter id used for routing and priority.
    fn id(&self) -> &str;

    /// Whether the adapter accepts image inputs.
    fn supports_images(&self) -> bool;

    /// Query the backend. Must return `Cancelled` promptly once `cancel` fires.
    async fn query(
        &self,
        request: AdapterRequest,
        cancel: CancellationToken,
    ) -> Result<AdapterResponse, AdapterFailure>;
}
