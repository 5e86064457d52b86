//! Tests for layered configuration loading.

use super::*;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Write JSON5 contents to a path, creating parent directories if needed.
fn write_json5(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("dir");
    }
    fs::write(path, contents).expect("write");
}

/// Temp tree with a `.git` marked project and a nested cwd.
fn project_tree() -> (TempDir, PathBuf, PathBuf) {
    let temp = TempDir::new().expect("tmp");
    let project_root = temp.path().join("project");
    fs::create_dir_all(project_root.join(".git")).expect("git");
    let cwd = project_root.join("subdir");
    fs::create_dir_all(&cwd).expect("cwd");
    (temp, project_root, cwd)
}

fn isolated_options(cwd: &Path) -> LayeredConfigOptions {
    let mut options = LayeredConfigOptions::new(cwd);
    options.system_config_path = None;
    options.user_config_path = None;
    options
}

#[test]
fn parse_minimal_config() {
    let config = DuetConfig::load_from_str("{}").expect("config");
    assert_eq!(config.context.window_size, 20);
    assert_eq!(config.dispatch.adapter_timeout_ms, 30_000);
    assert_eq!(config.dispatch.turn_deadline_ms, 45_000);
    assert_eq!(
        config.dispatch.priority,
        vec!["gemini".to_string(), "huggingface".to_string()]
    );
    assert!(config.models.gemini.is_none());
    assert!(config.sessions.enabled);
}

#[test]
fn parse_backend_blocks_with_defaults() {
    let json5 = r#"{
        // comments are allowed
        models: {
            gemini: { api_key: "g-key", temperature: 0.2 },
            huggingface: { api_key: "h-key", max_tokens: 256 },
        },
        dispatch: { mode: "huggingface", scoring: { latency_weight: 0.05 } },
    }"#;
    let config = DuetConfig::load_from_str(json5).expect("config");
    let gemini = config.models.gemini.expect("gemini");
    assert_eq!(gemini.api_key.as_deref(), Some("g-key"));
    assert_eq!(gemini.model, "gemini-1.5-flash");
    assert_eq!(gemini.temperature, Some(0.2));
    let huggingface = config.models.huggingface.expect("huggingface");
    assert_eq!(huggingface.max_tokens, Some(256));
    assert_eq!(huggingface.default_confidence, 0.6);
    assert_eq!(config.dispatch.mode, "huggingface");
    assert_eq!(config.dispatch.scoring.latency_weight, 0.05);
    assert_eq!(config.dispatch.scoring.confidence_weight, 1.0);
}

#[test]
fn rejects_unknown_top_level_key() {
    let err = DuetConfig::load_from_str("{ unexpected: true }").unwrap_err();
    assert!(format!("{err}").contains("unknown key"));
}

#[test]
fn rejects_token_key_of_other_backend() {
    let json5 = r#"{ models: { gemini: { max_tokens: 10 } } }"#;
    let err = DuetConfig::load_from_str(json5).unwrap_err();
    assert!(format!("{err}").contains("models.gemini.max_tokens"));
}

#[test]
fn rejects_zero_window_size() {
    let err = DuetConfig::load_from_str("{ context: { window_size: 0 } }").unwrap_err();
    assert!(format!("{err}").contains("context.window_size"));
}

#[test]
fn rejects_negative_timeout() {
    let json5 = "{ dispatch: { adapter_timeout_ms: -5 } }";
    let err = DuetConfig::load_from_str(json5).unwrap_err();
    assert!(format!("{err}").contains("dispatch.adapter_timeout_ms"));
}

#[test]
fn rejects_out_of_range_default_confidence() {
    let json5 = "{ models: { huggingface: { default_confidence: 1.5 } } }";
    let err = DuetConfig::load_from_str(json5).unwrap_err();
    assert!(format!("{err}").contains("models.huggingface.default_confidence"));
}

#[test]
fn rejects_empty_and_duplicate_priority() {
    let err = DuetConfig::load_from_str("{ dispatch: { priority: [] } }").unwrap_err();
    assert!(format!("{err}").contains("dispatch.priority"));

    let json5 = r#"{ dispatch: { priority: ["gemini", "gemini"] } }"#;
    let err = DuetConfig::load_from_str(json5).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn empty_priority_is_allowed_in_partial_layers() {
    let (_temp, _project_root, cwd) = project_tree();
    let runtime = cwd.join("runtime.json5");
    write_json5(&runtime, "{ dispatch: { priority: [] } }");
    let later = cwd.join("later.json5");
    write_json5(&later, r#"{ dispatch: { priority: ["huggingface"] } }"#);

    let options = isolated_options(&cwd)
        .with_runtime_path(&runtime)
        .with_runtime_path(&later);
    let layered = DuetConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(
        layered.config.dispatch.priority,
        vec!["huggingface".to_string()]
    );
}

#[test]
fn layered_config_prefers_repo_over_cwd() {
    let (temp, project_root, cwd) = project_tree();
    let root = temp.path();

    let system_config = root.join("system.json5");
    write_json5(&system_config, "{ context: { window_size: 1 } }");
    let user_config = root.join("user.json5");
    write_json5(&user_config, "{ context: { window_size: 2 } }");
    write_json5(
        &project_root.join(DEFAULT_CONFIG_FILE),
        "{ context: { window_size: 3 } }",
    );
    write_json5(
        &cwd.join(DEFAULT_CONFIG_FILE),
        "{ context: { window_size: 4 } }",
    );
    write_json5(
        &project_root
            .join(DEFAULT_CONFIG_DIR)
            .join(DEFAULT_CONFIG_FILE),
        "{ context: { window_size: 5 } }",
    );

    let mut options = LayeredConfigOptions::new(&cwd);
    options.system_config_path = Some(system_config);
    options.user_config_path = Some(user_config);

    let layered = DuetConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(layered.config.context.window_size, 5);
    let sources: Vec<ConfigLayerSource> =
        layered.layers.iter().map(|layer| layer.source).collect();
    assert_eq!(
        sources,
        vec![
            ConfigLayerSource::System,
            ConfigLayerSource::User,
            ConfigLayerSource::Project,
            ConfigLayerSource::Cwd,
            ConfigLayerSource::Repo,
        ]
    );
}

#[test]
fn runtime_override_wins_and_merges_nested_keys() {
    let (temp, _project_root, cwd) = project_tree();
    let root = temp.path();

    let system_config = root.join("system.json5");
    write_json5(
        &system_config,
        r#"{ models: { gemini: { api_key: "from-system", model: "gemini-pro" } } }"#,
    );
    let runtime_config = root.join("runtime.json5");
    write_json5(
        &runtime_config,
        r#"{ models: { gemini: { api_key: "from-runtime" } } }"#,
    );

    let mut options = isolated_options(&cwd).with_runtime_path(&runtime_config);
    options.system_config_path = Some(system_config);

    let layered = DuetConfig::load_layered_with_options(options).expect("layered");
    let gemini = layered.config.models.gemini.expect("gemini");
    assert_eq!(gemini.api_key.as_deref(), Some("from-runtime"));
    assert_eq!(gemini.model, "gemini-pro");
}

#[test]
fn cwd_at_project_root_loads_file_once() {
    let (_temp, project_root, _cwd) = project_tree();
    write_json5(
        &project_root.join(DEFAULT_CONFIG_FILE),
        "{ context: { window_size: 9 } }",
    );

    let layered =
        DuetConfig::load_layered_with_options(isolated_options(&project_root)).expect("layered");
    assert_eq!(layered.config.context.window_size, 9);
    assert_eq!(layered.layers.len(), 1);
    assert_eq!(layered.layers[0].source, ConfigLayerSource::Project);
}

#[test]
fn missing_runtime_layer_is_an_error() {
    let (_temp, _project_root, cwd) = project_tree();
    let options = isolated_options(&cwd).with_runtime_path(cwd.join("absent.json5"));
    let err = DuetConfig::load_layered_with_options(options).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFailed(_)));
}

#[test]
fn invalid_layer_names_its_source() {
    let (_temp, _project_root, cwd) = project_tree();
    write_json5(
        &cwd.join(DEFAULT_CONFIG_FILE),
        "{ sessions: { enabled: \"yes\" } }",
    );
    let err = DuetConfig::load_layered_with_options(isolated_options(&cwd)).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("cwd("));
    assert!(msg.contains("sessions.enabled"));
}

#[test]
fn inline_api_keys_are_flagged_only_in_shared_layers() {
    let value = serde_json::json!({
        "models": {
            "gemini": { "api_key": "g-key" },
            "huggingface": { "api_key": "  " },
        }
    });
    assert_eq!(
        layer_io::shared_layer_api_keys(ConfigLayerSource::Project, &value),
        vec!["gemini".to_string()]
    );
    assert_eq!(
        layer_io::shared_layer_api_keys(ConfigLayerSource::Repo, &value),
        vec!["gemini".to_string()]
    );
    assert!(layer_io::shared_layer_api_keys(ConfigLayerSource::User, &value).is_empty());
    assert!(
        layer_io::shared_layer_api_keys(ConfigLayerSource::Cwd, &serde_json::json!({}))
            .is_empty()
    );
}
