//! Configuration schema for Duet.

use duet_rs_protocol::DispatchMode;
use serde::{Deserialize, Serialize};

/// Adapter id used for the Gemini backend.
pub const GEMINI_ADAPTER_ID: &str = "gemini";
/// Adapter id used for the HuggingFace backend.
pub const HUGGINGFACE_ADAPTER_ID: &str = "huggingface";

/// Root config for the Duet SDK.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DuetConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
}

impl DuetConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> DuetConfigBuilder {
        DuetConfigBuilder::new()
    }
}

/// Builder for assembling a `DuetConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct DuetConfigBuilder {
    config: DuetConfig,
}

impl DuetConfigBuilder {
    /// Create a new builder seeded with default config values.
    pub fn new() -> Self {
        Self {
            config: DuetConfig::default(),
        }
    }

    /// Configure the Gemini backend.
    pub fn gemini(mut self, gemini: GeminiConfig) -> Self {
        self.config.models.gemini = Some(gemini);
        self
    }

    /// Configure the HuggingFace backend.
    pub fn huggingface(mut self, huggingface: HuggingFaceConfig) -> Self {
        self.config.models.huggingface = Some(huggingface);
        self
    }

    /// Replace the dispatch policy.
    pub fn dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.config.dispatch = dispatch;
        self
    }

    /// Replace the context window settings.
    pub fn context(mut self, context: ContextConfig) -> Self {
        self.config.context = context;
        self
    }

    /// Replace the session persistence configuration.
    pub fn sessions(mut self, sessions: SessionsConfig) -> Self {
        self.config.sessions = sessions;
        self
    }

    /// Finalize and return the built `DuetConfig`.
    pub fn build(self) -> DuetConfig {
        self.config
    }
}

/// Model backends. A backend without an API key is not registered.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelsConfig {
    #[serde(default)]
    pub gemini: Option<GeminiConfig>,
    #[serde(default)]
    pub huggingface: Option<HuggingFaceConfig>,
}

/// Gemini (vision + text) backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_gemini_confidence")]
    pub default_confidence: f32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_gemini_model(),
            base_url: default_gemini_base_url(),
            max_output_tokens: None,
            temperature: None,
            default_confidence: default_gemini_confidence(),
        }
    }
}

fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_gemini_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_gemini_confidence() -> f32 {
    0.8
}

/// HuggingFace (text only) backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuggingFaceConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_huggingface_model")]
    pub model: String,
    #[serde(default = "default_huggingface_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_huggingface_confidence")]
    pub default_confidence: f32,
}

impl Default for HuggingFaceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_huggingface_model(),
            base_url: default_huggingface_base_url(),
            max_tokens: None,
            temperature: None,
            default_confidence: default_huggingface_confidence(),
        }
    }
}

fn default_huggingface_model() -> String {
    "mistralai/Mistral-7B-Instruct-v0.3".to_string()
}

fn default_huggingface_base_url() -> String {
    "https://router.huggingface.co/v1".to_string()
}

fn default_huggingface_confidence() -> f32 {
    0.6
}

/// Dispatch policy for outgoing turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// `auto` or an adapter id.
    #[serde(default = "default_dispatch_mode")]
    pub mode: String,
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
    #[serde(default = "default_turn_deadline_ms")]
    pub turn_deadline_ms: u64,
    /// Adapter ids in tie-break order; unknown ids are ignored.
    #[serde(default = "default_priority")]
    pub priority: Vec<String>,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl DispatchConfig {
    /// Parsed dispatch mode.
    pub fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::parse(&self.mode)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: default_dispatch_mode(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            turn_deadline_ms: default_turn_deadline_ms(),
            priority: default_priority(),
            scoring: ScoringConfig::default(),
        }
    }
}

fn default_dispatch_mode() -> String {
    "auto".to_string()
}

/// Default hard timeout for a single adapter call.
fn default_adapter_timeout_ms() -> u64 {
    30_000
}

/// Default outer deadline covering a whole auto-mode dispatch.
fn default_turn_deadline_ms() -> u64 {
    45_000
}

fn default_priority() -> Vec<String> {
    vec![
        GEMINI_ADAPTER_ID.to_string(),
        HUGGINGFACE_ADAPTER_ID.to_string(),
    ]
}

/// Weights used to rank successful replies in auto mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f32,
    /// Score penalty per second of latency.
    #[serde(default)]
    pub latency_weight: f32,
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            confidence_weight: default_confidence_weight(),
            latency_weight: 0.0,
            tie_epsilon: default_tie_epsilon(),
        }
    }
}

fn default_confidence_weight() -> f32 {
    1.0
}

fn default_tie_epsilon() -> f32 {
    1e-6
}

/// Context window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
        }
    }
}

fn default_window_size() -> usize {
    20
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_sessions_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            enabled: default_sessions_enabled(),
            path: None,
        }
    }
}

fn default_sessions_enabled() -> bool {
    true
}
