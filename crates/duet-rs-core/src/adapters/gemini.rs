//! Gemini `generateContent` adapter (vision + text).

use super::AdapterBuildError;
use super::http::{build_client, normalize_base_url, post_json};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use duet_rs_config::{GEMINI_ADAPTER_ID, GeminiConfig};
use duet_rs_protocol::{
    AdapterFailure, AdapterRequest, AdapterResponse, ConversationContext, ImageRef, ModelAdapter,
    Role,
};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

const API_KEY_HEADER: &str = "x-goog-api-key";
const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

pub struct GeminiAdapter {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    default_confidence: f32,
}

impl GeminiAdapter {
    pub fn new(config: &GeminiConfig, api_key: impl Into<String>) -> Result<Self, AdapterBuildError> {
        Ok(Self {
            client: build_client()?,
            api_key: api_key.into(),
            model: config.model.clone(),
            base_url: normalize_base_url(&config.base_url)?,
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            default_confidence: config.default_confidence,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    async fn build_request(
        &self,
        request: &AdapterRequest,
    ) -> Result<GenerateContentRequest, AdapterFailure> {
        Ok(GenerateContentRequest {
            contents: build_contents(&request.context).await?,
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens.or(self.max_output_tokens),
                temperature: request.temperature.or(self.temperature),
            },
        })
    }

    fn into_response(
        &self,
        response: GenerateContentResponse,
    ) -> Result<AdapterResponse, AdapterFailure> {
        let candidate = response
            .candidates
            .and_then(|candidates| candidates.into_iter().next())
            .ok_or_else(|| AdapterFailure::InvalidResponse("response has no candidates".into()))?;
        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AdapterFailure::InvalidResponse(
                "candidate carries no text".into(),
            ));
        }

        let mut confidence = candidate
            .avg_logprobs
            .map(|logprob| logprob.exp() as f32)
            .unwrap_or(self.default_confidence);
        if candidate
            .finish_reason
            .as_deref()
            .is_some_and(|reason| reason != "STOP")
        {
            confidence /= 2.0;
        }

        Ok(AdapterResponse {
            text,
            confidence_hint: confidence.clamp(0.0, 1.0),
            model_id: response.model_version.unwrap_or_else(|| self.model.clone()),
        })
    }
}

#[async_trait]
impl ModelAdapter for GeminiAdapter {
    fn id(&self) -> &str {
        GEMINI_ADAPTER_ID
    }

    fn supports_images(&self) -> bool {
        true
    }

    async fn query(
        &self,
        request: AdapterRequest,
        cancel: CancellationToken,
    ) -> Result<AdapterResponse, AdapterFailure> {
        if cancel.is_cancelled() {
            return Err(AdapterFailure::Cancelled);
        }
        let body = self.build_request(&request).await?;
        debug!(
            "sending gemini request (model={}, contents={}, images={})",
            self.model,
            body.contents.len(),
            request.context.images().len()
        );
        let http = self
            .client
            .post(self.endpoint())
            .header(API_KEY_HEADER, &self.api_key);
        let response: GenerateContentResponse = post_json(http, &body, &cancel).await?;
        self.into_response(response)
    }
}

async fn build_contents(context: &ConversationContext) -> Result<Vec<Content>, AdapterFailure> {
    let mut contents = Vec::with_capacity(context.len());
    for message in context.messages() {
        let mut parts = Vec::new();
        if !message.text.trim().is_empty() {
            parts.push(Part::Text {
                text: message.text.clone(),
            });
        }
        for image in &message.images {
            parts.push(image_part(image).await?);
        }
        if parts.is_empty() {
            continue;
        }
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        contents.push(Content {
            role: role.to_string(),
            parts,
        });
    }
    if contents.is_empty() {
        return Err(AdapterFailure::InvalidResponse(
            "nothing to send: context is empty".into(),
        ));
    }
    Ok(contents)
}

async fn image_part(image: &ImageRef) -> Result<Part, AdapterFailure> {
    let mime_type = image.mime_type().unwrap_or(FALLBACK_MIME_TYPE).to_string();
    let data = match image {
        ImageRef::Inline { data, .. } => data.clone(),
        ImageRef::File { path, .. } => {
            let bytes = tokio::fs::read(path).await.map_err(|err| {
                AdapterFailure::InvalidResponse(format!(
                    "failed to read image {}: {err}",
                    path.display()
                ))
            })?;
            BASE64_STANDARD.encode(bytes)
        }
    };
    Ok(Part::InlineData {
        inline_data: InlineData { mime_type, data },
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
    avg_logprobs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<PartResponse>,
}

#[derive(Debug, Deserialize)]
struct PartResponse {
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_rs_protocol::ContextMessage;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Write;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new(&GeminiConfig::default(), "test-key").expect("adapter")
    }

    fn decode(value: serde_json::Value) -> GenerateContentResponse {
        serde_json::from_value(value).expect("decode")
    }

    #[test]
    fn confidence_comes_from_avg_logprobs() {
        let response = adapter()
            .into_response(decode(json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "a " }, { "text": "cat" }] },
                    "finishReason": "STOP",
                    "avgLogprobs": -0.5
                }],
                "modelVersion": "gemini-1.5-flash-002"
            })))
            .expect("response");
        assert_eq!(response.text, "a cat");
        assert!((response.confidence_hint - 0.6065).abs() < 1e-3);
        assert_eq!(response.model_id, "gemini-1.5-flash-002");
    }

    #[test]
    fn truncated_reply_halves_default_confidence() {
        let response = adapter()
            .into_response(decode(json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "partial" }] },
                    "finishReason": "MAX_TOKENS"
                }]
            })))
            .expect("response");
        assert!((response.confidence_hint - 0.4).abs() < 1e-6);
        assert_eq!(response.model_id, "gemini-1.5-flash");
    }

    #[test]
    fn missing_text_is_invalid() {
        let err = adapter()
            .into_response(decode(json!({ "candidates": [{ "finishReason": "SAFETY" }] })))
            .unwrap_err();
        assert!(matches!(err, AdapterFailure::InvalidResponse(_)));
        let err = adapter()
            .into_response(decode(json!({})))
            .unwrap_err();
        assert!(matches!(err, AdapterFailure::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn contents_map_roles_and_inline_images() {
        let mut file = tempfile::Builder::new()
            .suffix(".png")
            .tempfile()
            .expect("tmp");
        file.write_all(b"png-bytes").expect("write");
        let context = ConversationContext::new(vec![
            ContextMessage {
                role: Role::User,
                text: "hi".to_string(),
                images: Vec::new(),
            },
            ContextMessage {
                role: Role::Assistant,
                text: "hello".to_string(),
                images: Vec::new(),
            },
            ContextMessage {
                role: Role::User,
                text: String::new(),
                images: vec![ImageRef::file(file.path())],
            },
        ]);
        let contents = build_contents(&context).await.expect("contents");
        let value = serde_json::to_value(&contents).expect("json");
        assert_eq!(
            value,
            json!([
                { "role": "user", "parts": [{ "text": "hi" }] },
                { "role": "model", "parts": [{ "text": "hello" }] },
                { "role": "user", "parts": [{
                    "inlineData": {
                        "mimeType": "image/png",
                        "data": BASE64_STANDARD.encode(b"png-bytes")
                    }
                }] }
            ])
        );
    }

    #[tokio::test]
    async fn unreadable_image_is_reported() {
        let context = ConversationContext::new(vec![ContextMessage {
            role: Role::User,
            text: "look".to_string(),
            images: vec![ImageRef::file("/definitely/missing.png")],
        }]);
        let err = build_contents(&context).await.unwrap_err();
        assert!(matches!(err, AdapterFailure::InvalidResponse(message) if message.contains("missing.png")));
    }
}
