//! Module scanner
//!
//! Enumerates module directories, filters out disabled/removed/skip-mount
//! modules and attaches the per-module mode override. Enumeration order is
//! whatever the directory yields; the planner is order-agnostic.

use crate::config::{self, MountMode};
use crate::defs;
use crate::error::Result;
use crate::utils::has_files_recursive;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One enabled module as found on disk.
#[derive(Debug, Clone)]
pub struct Module {
    /// Directory name under the modules root
    pub id: String,
    /// Absolute path to the module directory
    pub source_path: PathBuf,
    /// Mechanism override from the out-of-band mode map
    pub mode: MountMode,
}

impl Module {
    /// True when any of the given partition subtrees contains a file.
    pub fn has_content(&self, partitions: &[String]) -> bool {
        partitions
            .iter()
            .any(|p| has_files_recursive(&self.source_path.join(p)))
    }
}

fn is_reserved_id(id: &str) -> bool {
    id == defs::SELF_MODULE_ID || id == "lost+found"
}

fn is_disabled(path: &Path) -> bool {
    path.join(defs::DISABLE_FILE_NAME).exists()
        || path.join(defs::REMOVE_FILE_NAME).exists()
        || path.join(defs::SKIP_MOUNT_FILE_NAME).exists()
}

/// Scan the modules root for enabled modules.
pub fn scan_modules(moduledir: &Path) -> Result<Vec<Module>> {
    let modes = config::load_module_modes();
    scan_modules_with_modes(moduledir, &modes)
}

pub fn scan_modules_with_modes(
    moduledir: &Path,
    modes: &std::collections::HashMap<String, MountMode>,
) -> Result<Vec<Module>> {
    let mut modules = Vec::new();
    if !moduledir.exists() {
        return Ok(modules);
    }

    for entry in fs::read_dir(moduledir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        if is_reserved_id(&id) {
            continue;
        }
        if is_disabled(&path) {
            debug!("skipping module {id} (disabled/removed/skip_mount)");
            continue;
        }

        let mode = modes.get(&id).copied().unwrap_or_default();
        modules.push(Module {
            id,
            source_path: path,
            mode,
        });
    }

    Ok(modules)
}

/// Top-level module directories that look like partitions but are not yet
/// configured. Used by `sync-partitions`.
pub fn scan_partition_candidates(moduledir: &Path) -> Result<Vec<String>> {
    let mut candidates = Vec::new();
    for module in scan_modules_with_modes(moduledir, &Default::default())? {
        let Ok(entries) = fs::read_dir(&module.source_path) else {
            continue;
        };
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if defs::BUILTIN_PARTITIONS.contains(&name.as_str())
                || defs::NON_PARTITION_DIRS.contains(&name.as_str())
            {
                continue;
            }
            if !has_files_recursive(&entry.path()) {
                continue;
            }
            if !candidates.contains(&name) {
                candidates.push(name);
            }
        }
    }
    candidates.sort();
    Ok(candidates)
}

/// Read one `key=value` line from a module.prop style file.
pub fn read_prop(path: &Path, key: &str) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            if let Some(value) = rest.strip_prefix('=') {
                return Some(value.to_string());
            }
        }
    }
    None
}
