//! IO helpers for reading config layers from disk.

use super::{
    ConfigLayer, ConfigLayerSource, DEFAULT_CONFIG_DIR, DEFAULT_CONFIG_FILE, LoadedLayer,
    SYSTEM_CONFIG_PATH, SchemaMode, schema,
};
use crate::ConfigError;
use directories::UserDirs;
use log::{debug, warn};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Load an optional layer; a missing path yields `None`.
pub(super) fn load_optional_layer(
    source: ConfigLayerSource,
    path: Option<&Path>,
) -> Result<Option<LoadedLayer>, ConfigError> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        debug!(
            "optional layer missing (source={:?}, path={})",
            source,
            path.display()
        );
        return Ok(None);
    }
    load_required_layer(source, path).map(Some)
}

/// Read, parse, and schema-check a layer that must exist.
pub(super) fn load_required_layer(
    source: ConfigLayerSource,
    path: &Path,
) -> Result<LoadedLayer, ConfigError> {
    debug!(
        "loading config layer (source={:?}, path={})",
        source,
        path.display()
    );
    let contents = fs::read_to_string(path)?;
    let value: Value = json5::from_str(&contents)?;
    let label = layer_label(source, path);
    schema::validate_layer_schema(&value, SchemaMode::Partial, &label)?;
    for provider in shared_layer_api_keys(source, &value) {
        warn!(
            "api key stored in a shared config layer; prefer the environment (provider={}, layer={})",
            provider, label
        );
    }
    Ok(LoadedLayer {
        meta: ConfigLayer {
            source,
            path: Some(path.to_path_buf()),
        },
        value,
    })
}

/// Providers with an inline `api_key` in a layer that lives inside the
/// project tree and is likely checked in.
pub(super) fn shared_layer_api_keys(source: ConfigLayerSource, value: &Value) -> Vec<String> {
    if !matches!(
        source,
        ConfigLayerSource::Project | ConfigLayerSource::Cwd | ConfigLayerSource::Repo
    ) {
        return Vec::new();
    }
    let Some(models) = value.get("models").and_then(Value::as_object) else {
        return Vec::new();
    };
    models
        .iter()
        .filter(|(_, model)| {
            model
                .get("api_key")
                .and_then(Value::as_str)
                .is_some_and(|key| !key.trim().is_empty())
        })
        .map(|(provider, _)| provider.clone())
        .collect()
}

/// Label used to prefix schema errors, e.g. `user(/home/me/.duet/duet.json5)`.
pub(super) fn layer_label(source: ConfigLayerSource, path: &Path) -> String {
    let name = match source {
        ConfigLayerSource::System => "system",
        ConfigLayerSource::User => "user",
        ConfigLayerSource::Project => "project",
        ConfigLayerSource::Cwd => "cwd",
        ConfigLayerSource::Repo => "repo",
        ConfigLayerSource::Runtime => "runtime",
    };
    format!("{name}({})", path.display())
}

pub(super) fn default_system_config_path() -> Option<PathBuf> {
    #[cfg(any(unix, windows))]
    {
        Some(PathBuf::from(SYSTEM_CONFIG_PATH))
    }
    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}

/// `~/.duet/duet.json5` when a home directory is known.
pub(super) fn default_user_config_path() -> Option<PathBuf> {
    UserDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(DEFAULT_CONFIG_DIR)
            .join(DEFAULT_CONFIG_FILE)
    })
}
