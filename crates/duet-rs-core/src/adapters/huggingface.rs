//! HuggingFace router adapter (text only, OpenAI-compatible chat completions).

use super::AdapterBuildError;
use super::http::{build_client, normalize_base_url, post_json};
use async_trait::async_trait;
use duet_rs_config::{HUGGINGFACE_ADAPTER_ID, HuggingFaceConfig};
use duet_rs_protocol::{
    AdapterFailure, AdapterRequest, AdapterResponse, ConversationContext, ModelAdapter,
};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub struct HuggingFaceAdapter {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    default_confidence: f32,
}

impl HuggingFaceAdapter {
    pub fn new(
        config: &HuggingFaceConfig,
        api_key: impl Into<String>,
    ) -> Result<Self, AdapterBuildError> {
        Ok(Self {
            client: build_client()?,
            api_key: api_key.into(),
            model: config.model.clone(),
            base_url: normalize_base_url(&config.base_url)?,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            default_confidence: config.default_confidence,
        })
    }

    fn build_request<'a>(&'a self, request: &'a AdapterRequest) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages: chat_messages(&request.context),
            max_tokens: request.max_tokens.or(self.max_tokens),
            temperature: request.temperature.or(self.temperature),
            stream: false,
        }
    }

    fn into_response(
        &self,
        response: ChatCompletionResponse,
    ) -> Result<AdapterResponse, AdapterFailure> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AdapterFailure::InvalidResponse("response has no choices".into()))?;
        let text = choice.message.content.unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AdapterFailure::InvalidResponse("choice carries no text".into()));
        }
        let mut confidence = self.default_confidence;
        if choice.finish_reason.as_deref() == Some("length") {
            confidence /= 2.0;
        }
        Ok(AdapterResponse {
            text,
            confidence_hint: confidence.clamp(0.0, 1.0),
            model_id: response.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

#[async_trait]
impl ModelAdapter for HuggingFaceAdapter {
    fn id(&self) -> &str {
        HUGGINGFACE_ADAPTER_ID
    }

    fn supports_images(&self) -> bool {
        false
    }

    async fn query(
        &self,
        request: AdapterRequest,
        cancel: CancellationToken,
    ) -> Result<AdapterResponse, AdapterFailure> {
        if cancel.is_cancelled() {
            return Err(AdapterFailure::Cancelled);
        }
        let body = self.build_request(&request);
        if body.messages.is_empty() {
            return Err(AdapterFailure::InvalidResponse(
                "nothing to send: context is empty".into(),
            ));
        }
        debug!(
            "sending huggingface request (model={}, messages={})",
            self.model,
            body.messages.len()
        );
        let http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key);
        let response: ChatCompletionResponse = post_json(http, &body, &cancel).await?;
        self.into_response(response)
    }
}

/// Text of each message; images are ignored by this backend.
fn chat_messages(context: &ConversationContext) -> Vec<ChatMessage<'_>> {
    context
        .messages()
        .iter()
        .filter(|message| !message.text.trim().is_empty())
        .map(|message| ChatMessage {
            role: message.role.as_str(),
            content: &message.text,
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}
