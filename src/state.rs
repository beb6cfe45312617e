//! Runtime state record
//!
//! Written once at the tail of a successful run; read by the CLI and the
//! WebUI to report what is mounted and how.

use crate::defs;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeState {
    /// Storage backing mode: tmpfs / erofs / ext4 / magic_only
    pub storage_mode: String,

    /// Where the mirror (or fallback storage) is mounted
    pub mount_point: PathBuf,

    /// Module ids mounted via the overlay engine
    pub overlay_module_ids: Vec<String>,

    /// Module ids mounted via the magic-mount engine
    pub magic_module_ids: Vec<String>,

    /// Module ids installed as kernel rules
    pub hymofs_module_ids: Vec<String>,

    /// Partitions with at least one active projection
    pub active_mounts: Vec<String>,

    /// Whether the ext4 trace suppression helper ran
    pub nuke_active: bool,

    /// Pid of the run that wrote this record
    pub pid: i32,

    /// Protocol version mismatch was detected
    pub mismatch: bool,

    /// User-visible mismatch description
    pub mismatch_message: String,
}

impl RuntimeState {
    /// Load the state record, defaulting when absent or unparsable.
    pub fn load() -> Self {
        Self::load_from(Path::new(defs::STATE_FILE))
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("failed to parse runtime state: {e}");
                RuntimeState::default()
            }),
            Err(_) => RuntimeState::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(defs::STATE_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_defaults() {
        let state = RuntimeState::load_from(Path::new("/nonexistent/state.json"));
        assert!(state.storage_mode.is_empty());
        assert!(state.hymofs_module_ids.is_empty());
        assert!(!state.mismatch);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");

        let mut state = RuntimeState::default();
        state.storage_mode = "tmpfs".to_string();
        state.hymofs_module_ids = vec!["mod_a".to_string(), "mod_b".to_string()];
        state.active_mounts = vec!["system".to_string()];
        state.mismatch = true;
        state.mismatch_message = "Kernel version is lower than module version".to_string();
        state.save_to(&path).unwrap();

        let loaded = RuntimeState::load_from(&path);
        assert_eq!(loaded.storage_mode, "tmpfs");
        assert_eq!(loaded.hymofs_module_ids.len(), 2);
        assert!(loaded.mismatch);
        assert!(loaded.mismatch_message.contains("lower than module"));
    }

    #[test]
    fn test_garbage_file_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");
        std::fs::write(&path, "not json").unwrap();
        let state = RuntimeState::load_from(&path);
        assert!(state.active_mounts.is_empty());
    }
}
