//! OF-013: Lock file management — load, save (atomic), path derivation.

use super::types::StateLock;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Derive the lock file path for a declaration within the state directory.
pub fn lock_file_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join(name).join("state.lock.yaml")
}

fn state_error(path: &Path, message: impl Into<String>) -> Error {
    Error::State {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// Load the lock file for a declaration. Returns None if the file doesn't exist.
pub fn load_lock(state_dir: &Path, name: &str) -> Result<Option<StateLock>> {
    let path = lock_file_path(state_dir, name);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| state_error(&path, format!("cannot read: {}", e)))?;
    let lock: StateLock = serde_yaml_ng::from_str(&content)
        .map_err(|e| state_error(&path, format!("invalid lock file: {}", e)))?;
    Ok(Some(lock))
}

/// Save a lock file atomically (write to temp, then rename).
pub fn save_lock(state_dir: &Path, lock: &StateLock) -> Result<()> {
    let path = lock_file_path(state_dir, &lock.name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| state_error(parent, format!("cannot create dir: {}", e)))?;
    }

    let yaml = serde_yaml_ng::to_string(lock)?;

    let tmp_path = path.with_extension("lock.yaml.tmp");
    std::fs::write(&tmp_path, &yaml)
        .map_err(|e| state_error(&tmp_path, format!("cannot write: {}", e)))?;
    std::fs::rename(&tmp_path, &path)
        .map_err(|e| state_error(&path, format!("cannot rename from temp file: {}", e)))?;

    tracing::debug!(path = %path.display(), resources = lock.resources.len(), "saved state lock");
    Ok(())
}

/// Create a new empty StateLock for a declaration.
pub fn new_lock(name: &str) -> StateLock {
    StateLock {
        schema: "1.0".to_string(),
        name: name.to_string(),
        generated_at: now_rfc3339(),
        generator: format!("oneform {}", env!("CARGO_PKG_VERSION")),
        resources: indexmap::IndexMap::new(),
    }
}

/// Current UTC time, second precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ResourceKind, ResourceLock, ResourceStatus, Spec};

    fn entry(kind: ResourceKind, id: u32) -> ResourceLock {
        ResourceLock {
            kind,
            status: ResourceStatus::Converged,
            remote_id: Some(id),
            applied_at: Some("2026-02-16T14:00:00Z".to_string()),
            duration_seconds: Some(1.5),
            hash: "blake3:abc123".to_string(),
            depends_on: vec![],
            spec: Spec::new(),
            attributes: Spec::new(),
        }
    }

    fn make_lock() -> StateLock {
        let mut lock = new_lock("lab");
        lock.resources
            .insert("web-cluster".to_string(), entry(ResourceKind::Cluster, 100));
        lock
    }

    #[test]
    fn test_of013_lock_file_path() {
        let p = lock_file_path(Path::new("/state"), "lab");
        assert_eq!(p, PathBuf::from("/state/lab/state.lock.yaml"));
    }

    #[test]
    fn test_of013_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();

        let loaded = load_lock(dir.path(), "lab").unwrap().unwrap();
        assert_eq!(loaded.name, "lab");
        assert_eq!(loaded.resources.len(), 1);
        assert_eq!(loaded.resources["web-cluster"].remote_id, Some(100));
        assert_eq!(
            loaded.resources["web-cluster"].status,
            ResourceStatus::Converged
        );
    }

    #[test]
    fn test_of013_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_lock(dir.path(), "ghost").unwrap().is_none());
    }

    #[test]
    fn test_of013_load_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_file_path(dir.path(), "bad");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "resources: [not, a, map").unwrap();
        let err = load_lock(dir.path(), "bad").unwrap_err();
        assert!(matches!(err, Error::State { .. }));
    }

    #[test]
    fn test_of013_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        save_lock(dir.path(), &make_lock()).unwrap();
        let tmp = dir.path().join("lab").join("state.lock.yaml.tmp");
        assert!(!tmp.exists());
        assert!(lock_file_path(dir.path(), "lab").exists());
    }

    #[test]
    fn test_of013_new_lock() {
        let lock = new_lock("lab");
        assert_eq!(lock.name, "lab");
        assert!(lock.generated_at.contains('T'));
        assert!(lock.generator.starts_with("oneform "));
        assert!(lock.resources.is_empty());
    }

    #[test]
    fn test_of013_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = make_lock();
        lock.resources
            .insert("aaa-first".to_string(), entry(ResourceKind::Host, 3));
        save_lock(dir.path(), &lock).unwrap();
        let loaded = load_lock(dir.path(), "lab").unwrap().unwrap();
        let keys: Vec<_> = loaded.resources.keys().collect();
        assert_eq!(keys, vec!["web-cluster", "aaa-first"]);
    }
}
