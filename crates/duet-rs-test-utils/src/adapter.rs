use async_trait::async_trait;
use duet_rs_protocol::{AdapterFailure, AdapterRequest, AdapterResponse, ModelAdapter};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Adapter that answers from a queue of scripted outcomes.
///
/// Once the queue is empty it replies with `"<id> reply"`. Every call
/// records its request; calls interrupted by cancellation are counted.
#[derive(Debug)]
pub struct ScriptedAdapter {
    id: String,
    vision: bool,
    delay: Option<Duration>,
    hang: bool,
    hang_calls: Mutex<usize>,
    confidence: f32,
    model_id: String,
    script: Mutex<VecDeque<Result<String, AdapterFailure>>>,
    requests: Mutex<Vec<AdapterRequest>>,
    tokens: Mutex<Vec<CancellationToken>>,
    cancelled: Mutex<usize>,
}

impl ScriptedAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            model_id: format!("{id}-model"),
            id,
            vision: false,
            delay: None,
            hang: false,
            hang_calls: Mutex::new(0),
            confidence: 0.5,
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            cancelled: Mutex::new(0),
        }
    }

    pub fn with_vision(mut self) -> Self {
        self.vision = true;
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Never answer; wait for cancellation.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Hang the next `count` calls until cancelled, then answer normally.
    pub fn hang_next(&self, count: usize) {
        *self.hang_calls.lock() = count;
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    /// Queue a successful reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.script.lock().push_back(Ok(text.into()));
        self
    }

    /// Queue a failure.
    pub fn fail(self, failure: AdapterFailure) -> Self {
        self.script.lock().push_back(Err(failure));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<AdapterRequest> {
        self.requests.lock().clone()
    }

    /// Latest request's context texts, oldest first.
    pub fn last_context_texts(&self) -> Vec<String> {
        self.requests
            .lock()
            .last()
            .map(|request| {
                request
                    .context
                    .messages()
                    .iter()
                    .map(|message| message.text.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Calls that observed cancellation before answering.
    pub fn cancellations(&self) -> usize {
        *self.cancelled.lock()
    }

    /// Whether every token handed to this adapter has been cancelled.
    pub fn all_tokens_cancelled(&self) -> bool {
        self.tokens.lock().iter().all(CancellationToken::is_cancelled)
    }

    fn next_outcome(&self) -> Result<String, AdapterFailure> {
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{} reply", self.id)))
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_images(&self) -> bool {
        self.vision
    }

    async fn query(
        &self,
        request: AdapterRequest,
        cancel: CancellationToken,
    ) -> Result<AdapterResponse, AdapterFailure> {
        self.requests.lock().push(request);
        self.tokens.lock().push(cancel.clone());
        let hang = self.hang || {
            let mut remaining = self.hang_calls.lock();
            let hang = *remaining > 0;
            *remaining = remaining.saturating_sub(1);
            hang
        };
        let wait = async {
            if hang {
                std::future::pending::<()>().await;
            } else if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                *self.cancelled.lock() += 1;
                return Err(AdapterFailure::Cancelled);
            }
            _ = wait => {}
        }
        let text = self.next_outcome()?;
        Ok(AdapterResponse {
            text,
            confidence_hint: self.confidence,
            model_id: self.model_id.clone(),
        })
    }
}

/// Adapter whose every call panics.
#[derive(Debug)]
pub struct PanickingAdapter {
    id: String,
}

impl PanickingAdapter {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ModelAdapter for PanickingAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_images(&self) -> bool {
        true
    }

    async fn query(
        &self,
        _request: AdapterRequest,
        _cancel: CancellationToken,
    ) -> Result<AdapterResponse, AdapterFailure> {
        panic!("{} exploded", self.id)
    }
}
