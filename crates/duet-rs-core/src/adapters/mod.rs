//! Hosted-model adapters and their construction from config.

mod gemini;
mod http;
mod huggingface;

pub use gemini::GeminiAdapter;
pub use huggingface::HuggingFaceAdapter;

use duet_rs_config::DuetConfig;
use duet_rs_protocol::ModelAdapter;
use log::{info, warn};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while constructing adapters.
#[derive(Debug, Error)]
pub enum AdapterBuildError {
    #[error("failed to build http client: {0}")]
    HttpClient(String),
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

/// Build every configured adapter. Backends without an API key are skipped.
pub fn build_adapters(config: &DuetConfig) -> Result<Vec<Arc<dyn ModelAdapter>>, AdapterBuildError> {
    let mut adapters: Vec<Arc<dyn ModelAdapter>> = Vec::new();

    if let Some(gemini) = &config.models.gemini {
        match usable_key(gemini.api_key.as_deref()) {
            Some(key) => adapters.push(Arc::new(GeminiAdapter::new(gemini, key)?)),
            None => warn!("gemini configured without an api key; skipping"),
        }
    }
    if let Some(huggingface) = &config.models.huggingface {
        match usable_key(huggingface.api_key.as_deref()) {
            Some(key) => adapters.push(Arc::new(HuggingFaceAdapter::new(huggingface, key)?)),
            None => warn!("huggingface configured without an api key; skipping"),
        }
    }

    info!(
        "adapters built (count={}, ids={:?})",
        adapters.len(),
        adapters.iter().map(|adapter| adapter.id()).collect::<Vec<_>>()
    );
    Ok(adapters)
}

fn usable_key(key: Option<&str>) -> Option<&str> {
    key.map(str::trim).filter(|key| !key.is_empty())
}
