//! Configuration management
//!
//! The main config is a JSON document under the base directory. Per-module
//! mode overrides and per-module path rules are small separate JSON maps so
//! the WebUI and CLI can edit them without rewriting the whole config.

use crate::defs;
use crate::error::{Error, Result};
use crate::storage::FilesystemType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Mount mechanism selection, per module or per path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    /// Pick the best available mechanism
    Auto,
    /// Kernel rule engine (fast path)
    Hymofs,
    /// Stacked overlay filesystem
    Overlay,
    /// Per-file bind-mount projection
    Magic,
    /// Do not mount
    None,
}

impl Default for MountMode {
    fn default() -> Self {
        MountMode::Auto
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountMode::Auto => "auto",
            MountMode::Hymofs => "hymofs",
            MountMode::Overlay => "overlay",
            MountMode::Magic => "magic",
            MountMode::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for MountMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(MountMode::Auto),
            "hymofs" => Ok(MountMode::Hymofs),
            "overlay" => Ok(MountMode::Overlay),
            "magic" => Ok(MountMode::Magic),
            "none" => Ok(MountMode::None),
            other => Err(Error::InvalidConfig(format!("unknown mount mode: {other}"))),
        }
    }
}

/// A per-path mechanism override declared for one module.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleRule {
    /// Path relative to the partition roots, e.g. `system/etc/hosts`
    pub path: String,
    pub mode: MountMode,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Module source directory
    pub moduledir: PathBuf,

    /// Temporary directory for the magic-mount workdir and mirror fallback
    pub tempdir: Option<PathBuf>,

    /// Source name reported for mounts we create
    pub mountsource: String,

    /// Verbose logging
    pub verbose: bool,

    /// Storage backing policy for the mirror
    pub fs_type: FilesystemType,

    /// Default mechanism when a module has no explicit mode
    pub default_mode: MountMode,

    /// Skip registering created mounts with the cleanup collaborator
    pub disable_umount: bool,

    /// Deploy the ext4 trace suppression helper after ext4 storage setup
    pub enable_nuke: bool,

    /// Keep using the fast path despite a protocol version mismatch
    pub ignore_protocol_mismatch: bool,

    /// Enable kernel-side debug logging
    pub enable_kernel_debug: bool,

    /// Enable kernel stealth mode (mnt_id reordering et al.)
    pub enable_stealth: bool,

    /// Master switch for the kernel rule engine
    pub hymofs_enabled: bool,

    /// Kernel release string to report via uname, empty to leave untouched
    pub uname_release: String,

    /// Kernel version string to report via uname, empty to leave untouched
    pub uname_version: String,

    /// Fake /proc/cmdline content, empty to leave untouched
    pub fake_cmdline: String,

    /// Custom mirror directory (overrides tempdir and the default)
    pub mirror_path: Option<PathBuf>,

    /// Extra partitions beyond the built-in set
    pub partitions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            moduledir: PathBuf::from(defs::MODULE_DIR),
            tempdir: None,
            mountsource: defs::OVERLAY_SOURCE.to_string(),
            verbose: false,
            fs_type: FilesystemType::Auto,
            default_mode: MountMode::Auto,
            disable_umount: false,
            enable_nuke: false,
            ignore_protocol_mismatch: false,
            enable_kernel_debug: false,
            enable_stealth: false,
            hymofs_enabled: true,
            uname_release: String::new(),
            uname_version: String::new(),
            fake_cmdline: String::new(),
            mirror_path: None,
            partitions: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config file: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load the default config file, falling back to defaults when absent
    pub fn load_default() -> Self {
        let path = Path::new(defs::CONFIG_FILE);
        if path.exists() {
            match Self::load(path) {
                Ok(c) => return c,
                Err(e) => tracing::warn!("config load failed, using defaults: {e}"),
            }
        }
        Config::default()
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config file: {e}")))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.moduledir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("moduledir must not be empty".into()));
        }
        if self.mountsource.is_empty() {
            return Err(Error::InvalidConfig("mountsource must not be empty".into()));
        }
        for part in &self.partitions {
            if part.contains('/') || part.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "invalid partition name: {part:?}"
                )));
            }
        }
        Ok(())
    }

    /// Fold CLI overrides into the loaded configuration
    pub fn merge_with_cli(
        &mut self,
        moduledir: Option<PathBuf>,
        tempdir: Option<PathBuf>,
        mountsource: Option<String>,
        verbose: bool,
        partitions: &[String],
    ) {
        if let Some(dir) = moduledir {
            self.moduledir = dir;
        }
        if let Some(dir) = tempdir {
            self.tempdir = Some(dir);
        }
        if let Some(source) = mountsource {
            self.mountsource = source;
        }
        if verbose {
            self.verbose = true;
        }
        for part in partitions {
            if !self.partitions.contains(part) {
                self.partitions.push(part.clone());
            }
        }
    }

    /// Built-in partitions plus configured extras, deduplicated
    pub fn all_partitions(&self) -> Vec<String> {
        let mut parts: Vec<String> = defs::BUILTIN_PARTITIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for p in &self.partitions {
            if !parts.contains(p) {
                parts.push(p.clone());
            }
        }
        parts
    }

    /// The effective mirror directory: config.mirror_path, else tempdir,
    /// else the device default.
    pub fn effective_mirror_path(&self) -> PathBuf {
        if let Some(p) = &self.mirror_path {
            return p.clone();
        }
        if let Some(p) = &self.tempdir {
            return p.clone();
        }
        PathBuf::from(defs::MIRROR_DEV_DIR)
    }
}

/// Load the per-module mode map, empty when the file is absent or broken.
pub fn load_module_modes() -> HashMap<String, MountMode> {
    load_module_modes_from(Path::new(defs::MODULE_MODES_FILE))
}

pub fn load_module_modes_from(path: &Path) -> HashMap<String, MountMode> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("failed to parse module modes: {e}");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

pub fn save_module_modes(modes: &HashMap<String, MountMode>) -> Result<()> {
    save_module_modes_to(modes, Path::new(defs::MODULE_MODES_FILE))
}

pub fn save_module_modes_to(modes: &HashMap<String, MountMode>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(modes)?)?;
    Ok(())
}

/// Load the per-module path rule map, empty when the file is absent.
pub fn load_module_rules() -> HashMap<String, Vec<ModuleRule>> {
    load_module_rules_from(Path::new(defs::MODULE_RULES_FILE))
}

pub fn load_module_rules_from(path: &Path) -> HashMap<String, Vec<ModuleRule>> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("failed to parse module rules: {e}");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

pub fn save_module_rules(rules: &HashMap<String, Vec<ModuleRule>>) -> Result<()> {
    save_module_rules_to(rules, Path::new(defs::MODULE_RULES_FILE))
}

pub fn save_module_rules_to(rules: &HashMap<String, Vec<ModuleRule>>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(rules)?)?;
    Ok(())
}
