//! Layered configuration loader.
//!
//! Discovers configuration layers (system/user/project/cwd/repo/runtime),
//! validates their schema, merges them, and produces a final `DuetConfig`.

mod layer_io;
mod merge;
mod schema;
mod utils;

#[cfg(test)]
mod tests;

use crate::{ConfigError, DuetConfig};
use log::{debug, info};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Default config filename in local layers.
const DEFAULT_CONFIG_FILE: &str = "duet.json5";
/// Default config directory under user or repo roots.
const DEFAULT_CONFIG_DIR: &str = ".duet";
/// Marker files/dirs that identify a project root.
const DEFAULT_PROJECT_ROOT_MARKERS: &[&str] = &[".git"];

#[cfg(unix)]
/// Default system config path on Unix.
const SYSTEM_CONFIG_PATH: &str = "/etc/duet/duet.json5";
#[cfg(windows)]
/// Default system config path on Windows.
const SYSTEM_CONFIG_PATH: &str = "C:\\ProgramData\\duet\\duet.json5";

/// Effective config plus metadata about which layers were loaded.
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    /// The merged, validated config.
    pub config: DuetConfig,
    /// Metadata for each layer that contributed to the config.
    pub layers: Vec<ConfigLayer>,
}

/// Origin for a single config layer in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayerSource {
    /// System-wide configuration.
    System,
    /// User-specific configuration.
    User,
    /// Project root configuration.
    Project,
    /// Current working directory configuration.
    Cwd,
    /// Repo-local configuration.
    Repo,
    /// Runtime overrides (highest precedence).
    Runtime,
}

/// Metadata about a loaded config layer.
#[derive(Debug, Clone)]
pub struct ConfigLayer {
    /// Layer origin (system, user, runtime, etc).
    pub source: ConfigLayerSource,
    /// Location on disk.
    pub path: Option<PathBuf>,
}

/// Schema validation mode for layered configs.
#[derive(Debug, Clone, Copy)]
enum SchemaMode {
    /// Partial validation for non-final layers.
    Partial,
    /// Full validation for the effective config.
    Full,
}

/// Options controlling layered config discovery and overrides.
#[derive(Debug, Clone)]
pub struct LayeredConfigOptions {
    /// Working directory used to resolve local layers.
    pub cwd: PathBuf,
    /// Optional system config path (defaults to `/etc/duet/duet.json5` on Unix).
    pub system_config_path: Option<PathBuf>,
    /// Optional user config path (defaults to `~/.duet/duet.json5`).
    pub user_config_path: Option<PathBuf>,
    /// Runtime override config paths applied last.
    pub runtime_paths: Vec<PathBuf>,
    /// Marker files/dirs used to detect the project root.
    pub project_root_markers: Vec<String>,
}

impl LayeredConfigOptions {
    /// Create options with default layer locations for the provided cwd.
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        let cwd = cwd.as_ref().to_path_buf();
        Self {
            cwd,
            system_config_path: layer_io::default_system_config_path(),
            user_config_path: layer_io::default_user_config_path(),
            runtime_paths: Vec::new(),
            project_root_markers: DEFAULT_PROJECT_ROOT_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }

    /// Add a runtime override config path that is applied last.
    pub fn with_runtime_path(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime_paths.push(path.as_ref().to_path_buf());
        self
    }
}

impl DuetConfig {
    /// Load a single config from a path (no layering).
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        info!("loading config from path: {}", path.as_ref().display());
        let contents = fs::read_to_string(path)?;
        let value: Value = json5::from_str(&contents)?;
        config_from_value(value, "config")
    }

    /// Load a single config from JSON5 contents (no layering).
    pub fn load_from_str(contents: &str) -> Result<Self, ConfigError> {
        debug!("loading config from raw contents (len={})", contents.len());
        let value: Value = json5::from_str(contents)?;
        config_from_value(value, "config")
    }

    /// Load a layered config stack using the default layer locations.
    pub fn load_layered(cwd: impl AsRef<Path>) -> Result<LayeredConfig, ConfigError> {
        info!(
            "loading layered config with defaults (cwd={})",
            cwd.as_ref().display()
        );
        Self::load_layered_with_options(LayeredConfigOptions::new(cwd))
    }

    /// Load a layered config stack using explicit layer locations and overrides.
    ///
    /// Layer precedence (low -> high): system, user, project, cwd, repo,
    /// runtime overrides.
    pub fn load_layered_with_options(
        options: LayeredConfigOptions,
    ) -> Result<LayeredConfig, ConfigError> {
        let cwd = utils::normalize_path(&options.cwd)?;
        debug!("normalized cwd for config load: {}", cwd.display());
        let mut layers = Vec::new();
        let mut merge_layers = Vec::new();
        let mut seen_paths = HashSet::new();

        for (source, path) in [
            (
                ConfigLayerSource::System,
                options.system_config_path.as_deref(),
            ),
            (ConfigLayerSource::User, options.user_config_path.as_deref()),
        ] {
            if let Some(layer) = layer_io::load_optional_layer(source, path)? {
                debug!("loaded {:?} layer", source);
                if let Some(path) = &layer.meta.path {
                    seen_paths.insert(utils::unique_path(path));
                }
                layers.push(layer.meta.clone());
                merge_layers.push(layer);
            }
        }

        let project_root = utils::find_project_root(&cwd, &options.project_root_markers);
        let mut local_layers = Vec::new();
        match project_root.as_ref() {
            Some(project_root) => {
                debug!("resolved project root: {}", project_root.display());
                local_layers.push((
                    ConfigLayerSource::Project,
                    project_root.join(DEFAULT_CONFIG_FILE),
                ));
            }
            None => debug!("project root not found; skipping project/repo layers"),
        }
        local_layers.push((ConfigLayerSource::Cwd, cwd.join(DEFAULT_CONFIG_FILE)));
        if let Some(repo_root) = project_root.as_ref() {
            local_layers.push((
                ConfigLayerSource::Repo,
                repo_root.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE),
            ));
        }

        for (source, path) in local_layers {
            if !path.exists() {
                debug!(
                    "skipping missing layer (source={:?}, path={})",
                    source,
                    path.display()
                );
                continue;
            }
            if !seen_paths.insert(utils::unique_path(&path)) {
                debug!(
                    "skipping duplicate layer (source={:?}, path={})",
                    source,
                    path.display()
                );
                continue;
            }
            let loaded = layer_io::load_required_layer(source, &path)?;
            layers.push(loaded.meta.clone());
            merge_layers.push(loaded);
        }

        for runtime_path in &options.runtime_paths {
            let loaded = layer_io::load_required_layer(ConfigLayerSource::Runtime, runtime_path)?;
            debug!("loaded runtime layer (path={})", runtime_path.display());
            layers.push(loaded.meta.clone());
            merge_layers.push(loaded);
        }

        let mut merged = Value::Object(serde_json::Map::new());
        for layer in merge_layers {
            merge::merge_json_values(&mut merged, &layer.value);
        }

        let config = config_from_value(merged, "effective")?;
        info!("layered config loaded (layers={})", layers.len());
        Ok(LayeredConfig { config, layers })
    }

    /// Validate configuration invariants that cannot be expressed in serde.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.window_size == 0 {
            return Err(ConfigError::InvalidField {
                path: "context.window_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.dispatch.adapter_timeout_ms == 0 {
            return Err(ConfigError::InvalidField {
                path: "dispatch.adapter_timeout_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.dispatch.turn_deadline_ms == 0 {
            return Err(ConfigError::InvalidField {
                path: "dispatch.turn_deadline_ms".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = self
            .dispatch
            .priority
            .iter()
            .find(|id| !seen.insert(id.as_str()))
        {
            return Err(ConfigError::Invalid(format!(
                "dispatch.priority lists `{duplicate}` more than once"
            )));
        }
        let scoring = &self.dispatch.scoring;
        for (name, value) in [
            ("confidence_weight", scoring.confidence_weight),
            ("latency_weight", scoring.latency_weight),
            ("tie_epsilon", scoring.tie_epsilon),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidField {
                    path: format!("dispatch.scoring.{name}"),
                    message: "must be a finite, non-negative number".to_string(),
                });
            }
        }
        if let Some(gemini) = &self.models.gemini {
            validate_confidence("models.gemini.default_confidence", gemini.default_confidence)?;
        }
        if let Some(huggingface) = &self.models.huggingface {
            validate_confidence(
                "models.huggingface.default_confidence",
                huggingface.default_confidence,
            )?;
        }
        Ok(())
    }
}

fn validate_confidence(path: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidField {
            path: path.to_string(),
            message: "must be within [0, 1]".to_string(),
        })
    }
}

/// Internal representation of a loaded config layer.
#[derive(Debug, Clone)]
struct LoadedLayer {
    meta: ConfigLayer,
    value: Value,
}

fn config_from_value(value: Value, label: &str) -> Result<DuetConfig, ConfigError> {
    schema::validate_layer_schema(&value, SchemaMode::Full, label)?;
    let config: DuetConfig = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}
