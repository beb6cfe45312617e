//! Magic-mount statistics
//!
//! Counters are collected by the engine through a `&mut` reference and
//! persisted by the orchestrator once the run finishes.

use crate::defs;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountStats {
    pub total_mounts: u32,
    pub successful_mounts: u32,
    pub failed_mounts: u32,
    pub tmpfs_created: u32,
    pub files_mounted: u32,
    pub dirs_mounted: u32,
    pub symlinks_created: u32,
    pub overlayfs_mounts: u32,
}

impl MountStats {
    pub fn load() -> Self {
        Self::load_from(Path::new(defs::MOUNT_STATS_FILE))
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => MountStats::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(defs::MOUNT_STATS_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
