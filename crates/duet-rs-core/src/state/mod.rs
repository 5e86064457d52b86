//! `StateStore` implementations and default store construction.

mod jsonl;
mod memory;

pub use jsonl::JsonlStateStore;
pub use memory::MemoryStateStore;

use directories::BaseDirs;
use duet_rs_config::SessionsConfig;
use duet_rs_protocol::{StateStore, StoreError};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;

/// Build the store described by `sessions`: JSONL on disk when enabled,
/// in-memory otherwise.
pub fn build_state_store(config: &SessionsConfig) -> Result<Arc<dyn StateStore>, StoreError> {
    if !config.enabled {
        info!("session persistence disabled; using in-memory store");
        return Ok(Arc::new(MemoryStateStore::new()));
    }
    let root = resolve_default_root(config.path.as_deref())?;
    info!("initializing session store (root={})", root.display());
    Ok(Arc::new(JsonlStateStore::new(root)?))
}

/// Resolve the storage root: explicit paths are taken relative to the cwd,
/// otherwise `~/.duet/sessions`.
pub fn resolve_default_root(path: Option<&str>) -> Result<PathBuf, StoreError> {
    let cwd = std::env::current_dir()?;
    if let Some(path) = path {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            debug!("using absolute storage root: {}", path.display());
            return Ok(path);
        }
        debug!(
            "resolving storage root relative to cwd: {}",
            cwd.join(&path).display()
        );
        return Ok(cwd.join(path));
    }
    let base = BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or(cwd);
    Ok(base.join(".duet").join("sessions"))
}

#[cfg(test)]
mod tests {
    use super::{build_state_store, resolve_default_root};
    use duet_rs_config::SessionsConfig;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn resolve_default_root_respects_absolute_and_relative_paths() {
        let temp = tempdir().expect("tempdir");
        let absolute = temp.path().join("sessions");
        let resolved = resolve_default_root(absolute.to_str()).expect("absolute");
        assert_eq!(resolved, absolute);

        let cwd = std::env::current_dir().expect("cwd");
        let resolved = resolve_default_root(Some("tmp/sessions")).expect("relative");
        assert_eq!(resolved, cwd.join("tmp/sessions"));

        let fallback = resolve_default_root(None).expect("fallback");
        assert!(fallback.ends_with(".duet/sessions"));
    }

    #[test]
    fn disabled_sessions_use_memory_store() {
        let store = build_state_store(&SessionsConfig {
            enabled: false,
            path: None,
        })
        .expect("store");
        let summary = store.create_session("New Chat").expect("create");
        assert_eq!(store.list_sessions().expect("list")[0].id, summary.id);
    }

    #[test]
    fn enabled_sessions_write_rollouts_under_path() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("rollouts");
        let store = build_state_store(&SessionsConfig {
            enabled: true,
            path: root.to_str().map(str::to_string),
        })
        .expect("store");
        let summary = store.create_session("New Chat").expect("create");
        assert!(root.join(format!("{}.jsonl", summary.id)).exists());
    }
}
