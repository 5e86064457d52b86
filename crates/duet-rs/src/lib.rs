//! Public SDK surface for Duet.
//!
//! This crate re-exports the core building blocks and provides small helpers
//! to keep consumer setup consistent.

/// Re-export for convenience.
pub use duet_rs_config as config;
pub use duet_rs_core as core;
/// Re-export for convenience.
pub use duet_rs_protocol as protocol;

use duet_rs_config::{DuetConfig, GeminiConfig, HuggingFaceConfig};
use log::debug;

/// Environment variable consulted for the Gemini key.
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
/// Environment variable consulted for the HuggingFace key.
pub const HUGGINGFACE_API_KEY_ENV: &str = "HUGGINGFACE_API_KEY";

#[inline]
/// Initialize logging using env_logger if the "logging" feature is enabled.
///
/// This is a no-op if the feature is not enabled. Binaries are still expected
/// to call this early in startup to ensure log output is wired up.
pub fn init_logging() {
    #[cfg(feature = "logging")]
    {
        let _ = env_logger::builder()
            .format_timestamp_millis()
            .parse_default_env()
            .try_init();
    }
}

/// Fill missing API keys from `lookup`, enabling a backend that the config
/// does not mention when its key is available.
///
/// Keys already present in the config win.
pub fn apply_api_keys<F>(config: &mut DuetConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let key = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    if let Some(api_key) = key(GEMINI_API_KEY_ENV) {
        let gemini = config
            .models
            .gemini
            .get_or_insert_with(GeminiConfig::default);
        if gemini.api_key.is_none() {
            debug!("gemini api key taken from environment");
            gemini.api_key = Some(api_key);
        }
    }
    if let Some(api_key) = key(HUGGINGFACE_API_KEY_ENV) {
        let huggingface = config
            .models
            .huggingface
            .get_or_insert_with(HuggingFaceConfig::default);
        if huggingface.api_key.is_none() {
            debug!("huggingface api key taken from environment");
            huggingface.api_key = Some(api_key);
        }
    }
}

/// `apply_api_keys` against the process environment.
pub fn apply_env_api_keys(config: &mut DuetConfig) {
    apply_api_keys(config, |name| std::env::var(name).ok());
}
