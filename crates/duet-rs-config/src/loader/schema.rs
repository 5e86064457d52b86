//! Schema validation for Duet JSON5 configuration layers.

use super::SchemaMode;
use crate::ConfigError;
use serde_json::{Map, Value};

/// Validate a single config layer against the schema.
///
/// Partial layers may omit anything; the effective config must additionally
/// keep a non-empty adapter priority list.
pub(super) fn validate_layer_schema(
    value: &Value,
    mode: SchemaMode,
    layer: &str,
) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, "")?;
    ensure_allowed_keys(
        map,
        &["$schema", "models", "dispatch", "context", "sessions"],
        layer,
        "",
    )?;

    if let Some(value) = map.get("$schema") {
        expect_string(value, layer, "$schema")?;
    }
    if let Some(value) = map.get("models") {
        validate_models(value, layer, "models")?;
    }
    if let Some(value) = map.get("dispatch") {
        validate_dispatch(value, mode, layer, "dispatch")?;
    }
    if let Some(value) = map.get("context") {
        validate_context(value, layer, "context")?;
    }
    if let Some(value) = map.get("sessions") {
        validate_sessions(value, layer, "sessions")?;
    }
    Ok(())
}

fn validate_models(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["gemini", "huggingface"], layer, path)?;

    if let Some(value) = map.get("gemini") {
        validate_backend(value, "max_output_tokens", layer, &join_path(path, "gemini"))?;
    }
    if let Some(value) = map.get("huggingface") {
        validate_backend(value, "max_tokens", layer, &join_path(path, "huggingface"))?;
    }
    Ok(())
}

/// Validate one backend block; backends differ only in the token-limit key.
fn validate_backend(
    value: &Value,
    token_key: &str,
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "api_key",
            "model",
            "base_url",
            token_key,
            "temperature",
            "default_confidence",
        ],
        layer,
        path,
    )?;

    for key in ["api_key", "model", "base_url"] {
        if let Some(value) = map.get(key) {
            expect_string(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get(token_key) {
        expect_u64(value, layer, &join_path(path, token_key))?;
    }
    for key in ["temperature", "default_confidence"] {
        if let Some(value) = map.get(key) {
            expect_f64(value, layer, &join_path(path, key))?;
        }
    }
    Ok(())
}

fn validate_dispatch(
    value: &Value,
    mode: SchemaMode,
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "mode",
            "adapter_timeout_ms",
            "turn_deadline_ms",
            "priority",
            "scoring",
        ],
        layer,
        path,
    )?;

    if let Some(value) = map.get("mode") {
        expect_string(value, layer, &join_path(path, "mode"))?;
    }
    for key in ["adapter_timeout_ms", "turn_deadline_ms"] {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("priority") {
        let priority_path = join_path(path, "priority");
        validate_string_array(value, layer, &priority_path)?;
        if matches!(mode, SchemaMode::Full) && value.as_array().is_some_and(Vec::is_empty) {
            return Err(invalid_field(
                layer,
                &priority_path,
                "must name at least one adapter",
            ));
        }
    }
    if let Some(value) = map.get("scoring") {
        let scoring_path = join_path(path, "scoring");
        let scoring = expect_object(value, layer, &scoring_path)?;
        let keys = ["confidence_weight", "latency_weight", "tie_epsilon"];
        ensure_allowed_keys(scoring, &keys, layer, &scoring_path)?;
        for key in keys {
            if let Some(value) = scoring.get(key) {
                expect_f64(value, layer, &join_path(&scoring_path, key))?;
            }
        }
    }
    Ok(())
}

fn validate_context(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["window_size"], layer, path)?;

    if let Some(value) = map.get("window_size") {
        expect_u64(value, layer, &join_path(path, "window_size"))?;
    }
    Ok(())
}

/// Validate session persistence configuration.
fn validate_sessions(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["enabled", "path"], layer, path)?;

    if let Some(value) = map.get("enabled") {
        expect_bool(value, layer, &join_path(path, "enabled"))?;
    }
    if let Some(value) = map.get("path") {
        expect_string(value, layer, &join_path(path, "path"))?;
    }
    Ok(())
}

fn expect_object<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(invalid_field(layer, path, "expected object")),
    }
}

fn expect_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_string() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected string"))
    }
}

fn expect_bool(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_boolean() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected bool"))
    }
}

/// Non-negative integers only.
fn expect_u64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_u64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected non-negative integer"))
    }
}

fn expect_f64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_number() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected number"))
    }
}

fn validate_string_array(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let Value::Array(entries) = value else {
        return Err(invalid_field(layer, path, "expected array"));
    };
    match entries.iter().position(|entry| !entry.is_string()) {
        Some(idx) => Err(invalid_field(
            layer,
            &format!("{path}[{idx}]"),
            "expected string",
        )),
        None => Ok(()),
    }
}

fn ensure_allowed_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(invalid_field(layer, &join_path(path, key), "unknown key")),
        None => Ok(()),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn invalid_field(layer: &str, path: &str, message: &str) -> ConfigError {
    let path = if path.is_empty() { "root" } else { path };
    ConfigError::InvalidField {
        path: format!("{layer}:{path}"),
        message: message.to_string(),
    }
}
