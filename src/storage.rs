//! Storage backend for the module mirror
//!
//! Provisioning tries tmpfs (with a working xattr probe), then a
//! compressed read-only erofs image, then a writable ext4 image. Explicit
//! policy selections skip earlier stages but keep the downward fallback.

use crate::defs;
use crate::error::{Error, Result};
use crate::utils;
use rustix::mount::UnmountFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Backing policy from config / CLI.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemType {
    Auto,
    Tmpfs,
    Erofs,
    Ext4,
}

impl Default for FilesystemType {
    fn default() -> Self {
        FilesystemType::Auto
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilesystemType::Auto => "auto",
            FilesystemType::Tmpfs => "tmpfs",
            FilesystemType::Erofs => "erofs",
            FilesystemType::Ext4 => "ext4",
        };
        f.write_str(s)
    }
}

impl FromStr for FilesystemType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(FilesystemType::Auto),
            "tmpfs" => Ok(FilesystemType::Tmpfs),
            "erofs" => Ok(FilesystemType::Erofs),
            "ext4" => Ok(FilesystemType::Ext4),
            other => Err(Error::InvalidConfig(format!(
                "unknown filesystem type: {other}"
            ))),
        }
    }
}

/// What actually backs the mirror after setup.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    pub mount_point: PathBuf,
    pub mode: String,
}

/// Outcome of one provisioning stage. `Fallback` carries the reason and
/// sends the state machine to the next stage; hard failures are `Error`.
enum Attempt {
    Ready(&'static str),
    Fallback(String),
}

const MIN_IMAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Backing image size: 1.2 x the module tree, floored at 64 MiB.
pub fn image_size_for(tree_bytes: u64) -> u64 {
    std::cmp::max(tree_bytes + tree_bytes / 5, MIN_IMAGE_SIZE)
}

fn mkfs_ext4_bin() -> Option<&'static str> {
    utils::find_binary(&[
        "/system/bin/mkfs.ext4",
        "/system/bin/mke2fs",
        "/sbin/mkfs.ext4",
        "/sbin/mke2fs",
    ])
}

fn mkfs_erofs_bin() -> Option<&'static str> {
    utils::find_binary(&[
        "/system/bin/mkfs.erofs",
        "/vendor/bin/mkfs.erofs",
        "/sbin/mkfs.erofs",
    ])
}

/// Create the ext4 backing image under `base_dir` and format it.
pub fn create_image(base_dir: &Path) -> Result<()> {
    info!("creating {} in {}", defs::IMAGE_NAME, base_dir.display());
    let img_file = base_dir.join(defs::IMAGE_NAME);
    let modules_dir = base_dir.join("modules");

    utils::ensure_dir_exists(base_dir)?;
    if img_file.exists() {
        std::fs::remove_file(&img_file)?;
    }

    let size = image_size_for(utils::dir_size(&modules_dir));
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&img_file)?;
    file.set_len(size)?;
    drop(file);

    let Some(mkfs) = mkfs_ext4_bin() else {
        let _ = std::fs::remove_file(&img_file);
        return Err(Error::Storage("mkfs.ext4/mke2fs not found".into()));
    };

    let img = img_file.display().to_string();
    let status = utils::run_quiet(mkfs, &["-t", "ext4", "-b", "1024", img.as_str()])?;
    if !status.success() {
        let _ = std::fs::remove_file(&img_file);
        return Err(Error::Storage(format!("mkfs.ext4 failed: {status}")));
    }

    info!("image created: {img}");
    Ok(())
}

fn create_erofs_image(modules_dir: &Path, image_path: &Path) -> Result<()> {
    if !modules_dir.exists() {
        return Err(Error::PathNotFound(format!(
            "modules directory not found: {}",
            modules_dir.display()
        )));
    }
    if image_path.exists() {
        std::fs::remove_file(image_path)?;
    }

    let Some(mkfs) = mkfs_erofs_bin() else {
        return Err(Error::Storage("mkfs.erofs not found".into()));
    };

    let img = image_path.display().to_string();
    let src = modules_dir.display().to_string();
    let status = utils::run_quiet(mkfs, &["-zlz4hc,9", img.as_str(), src.as_str()])?;
    if !status.success() {
        return Err(Error::Storage(format!("mkfs.erofs failed: {status}")));
    }
    Ok(())
}

fn try_tmpfs(target: &Path) -> Attempt {
    debug!("attempting tmpfs backing");
    if let Err(e) = utils::mount_tmpfs(target, defs::OVERLAY_SOURCE) {
        return Attempt::Fallback(format!("tmpfs mount failed: {e}"));
    }
    if utils::is_xattr_supported(target) {
        info!("tmpfs active (xattr supported)");
        Attempt::Ready("tmpfs")
    } else {
        let _ = rustix::mount::unmount(target, UnmountFlags::DETACH);
        Attempt::Fallback("tmpfs lacks xattr support".into())
    }
}

fn try_erofs(target: &Path, modules_dir: &Path, image_path: &Path) -> Attempt {
    debug!("attempting erofs backing");
    if mkfs_erofs_bin().is_none() {
        return Attempt::Fallback("mkfs.erofs not found".into());
    }
    if let Err(e) = create_erofs_image(modules_dir, image_path) {
        return Attempt::Fallback(format!("erofs image creation failed: {e}"));
    }
    if let Err(e) = utils::mount_image(image_path, target, "erofs", true) {
        return Attempt::Fallback(format!("erofs mount failed: {e}"));
    }
    let _ = utils::send_unmountable(target);
    info!("erofs active (read-only, compressed)");
    Attempt::Ready("erofs")
}

/// Final stage; failure here is fatal for storage setup. The mount is
/// retried once after an in-place repair.
fn setup_ext4(target: &Path, image_path: &Path) -> Result<&'static str> {
    debug!("falling back to ext4 backing");

    if !image_path.exists() {
        warn!("{} missing, recreating", defs::IMAGE_NAME);
        let base = image_path
            .parent()
            .ok_or_else(|| Error::Storage("image path has no parent".into()))?;
        create_image(base)?;
    }

    if let Err(first) = utils::mount_image(image_path, target, "ext4", false) {
        warn!("ext4 mount failed ({first}), attempting image repair");
        if !utils::repair_image(image_path) {
            return Err(Error::Storage(format!(
                "failed to repair {}",
                image_path.display()
            )));
        }
        utils::mount_image(image_path, target, "ext4", false)
            .map_err(|e| Error::Storage(format!("ext4 mount failed after repair: {e}")))?;
    }

    let _ = utils::send_unmountable(target);
    info!("ext4 active");
    Ok("ext4")
}

/// Provision the mirror backing store at `mnt_dir`.
pub fn setup_storage(
    mnt_dir: &Path,
    image_path: &Path,
    fs_type: FilesystemType,
) -> Result<StorageHandle> {
    debug!("setting up storage at {}", mnt_dir.display());

    if mnt_dir.exists() {
        let _ = rustix::mount::unmount(mnt_dir, UnmountFlags::DETACH);
    }
    utils::ensure_dir_exists(mnt_dir)?;

    let base = image_path.parent().unwrap_or(Path::new(defs::BASE_DIR));
    let erofs_image = base.join(defs::EROFS_IMAGE_NAME);
    let modules_dir = base.join("modules");

    // Explicit selections skip earlier stages but keep downward fallback.
    let stages: &[FilesystemType] = match fs_type {
        FilesystemType::Auto | FilesystemType::Tmpfs => &[
            FilesystemType::Tmpfs,
            FilesystemType::Erofs,
            FilesystemType::Ext4,
        ],
        FilesystemType::Erofs => &[FilesystemType::Erofs, FilesystemType::Ext4],
        FilesystemType::Ext4 => &[FilesystemType::Ext4],
    };

    for stage in stages {
        let attempt = match stage {
            FilesystemType::Tmpfs => try_tmpfs(mnt_dir),
            FilesystemType::Erofs => try_erofs(mnt_dir, &modules_dir, &erofs_image),
            FilesystemType::Ext4 => {
                let mode = setup_ext4(mnt_dir, image_path)?;
                Attempt::Ready(mode)
            }
            FilesystemType::Auto => unreachable!(),
        };
        match attempt {
            Attempt::Ready(mode) => {
                return Ok(StorageHandle {
                    mount_point: mnt_dir.to_path_buf(),
                    mode: mode.to_string(),
                })
            }
            Attempt::Fallback(reason) => warn!("{stage} backing unavailable: {reason}"),
        }
    }

    Err(Error::Storage("no storage backing could be set up".into()))
}

/// The ext4 root ends up owned by the mkfs defaults; normalize it so the
/// kernel and the rule engine can traverse it.
pub fn finalize_storage_permissions(storage_root: &Path) {
    debug!("repairing storage root permissions");
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) =
        std::fs::set_permissions(storage_root, std::fs::Permissions::from_mode(0o755))
    {
        warn!("failed to chmod storage root: {e}");
    }
    if let Err(e) = rustix::fs::chown(
        storage_root,
        Some(rustix::fs::Uid::ROOT),
        Some(rustix::fs::Gid::ROOT),
    ) {
        warn!("failed to chown storage root: {e}");
    }
    if let Err(e) = utils::lsetfilecon(storage_root, defs::DEFAULT_SELINUX_CONTEXT) {
        warn!("failed to set storage root context: {e}");
    }
}

/// Storage usage report for the CLI, as a JSON object.
pub fn storage_status(state: &crate::state::RuntimeState) -> serde_json::Value {
    let path = if state.mount_point.as_os_str().is_empty() {
        PathBuf::from(defs::FALLBACK_CONTENT_DIR)
    } else {
        state.mount_point.clone()
    };

    let mut root = serde_json::json!({
        "path": path.display().to_string(),
        "pid": state.pid,
    });

    if !path.exists() {
        root["error"] = serde_json::Value::String("not mounted".into());
        return root;
    }

    let stats = match rustix::fs::statfs(&path) {
        Ok(s) => s,
        Err(e) => {
            root["error"] = serde_json::Value::String(format!("statfs failed: {e}"));
            return root;
        }
    };

    let block_size = stats.f_bsize as u64;
    let total = stats.f_blocks * block_size;
    let free = stats.f_bfree * block_size;
    let mut used = total.saturating_sub(free);

    // Loop-backed modes can report zero while files exist; fall back to
    // the logical tree size.
    if used == 0 {
        used = utils::dir_size(&path);
    }

    let percent = if total > 0 {
        used as f64 * 100.0 / total as f64
    } else {
        0.0
    };

    if total == 0 {
        root["warning"] = serde_json::Value::String("zero size detected".into());
    }

    let mode = if state.storage_mode.is_empty() {
        "unknown"
    } else {
        state.storage_mode.as_str()
    };

    root["size"] = serde_json::Value::String(utils::format_size(total));
    root["used"] = serde_json::Value::String(utils::format_size(used));
    root["avail"] = serde_json::Value::String(utils::format_size(free));
    root["percent"] = serde_json::json!(percent);
    root["mode"] = serde_json::Value::String(mode.to_string());
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_size_floor() {
        assert_eq!(image_size_for(0), MIN_IMAGE_SIZE);
        assert_eq!(image_size_for(10 * 1024 * 1024), MIN_IMAGE_SIZE);
    }

    #[test]
    fn test_image_size_growth() {
        let tree = 100 * 1024 * 1024u64;
        assert_eq!(image_size_for(tree), tree + tree / 5);
    }

    #[test]
    fn test_fs_type_parse() {
        assert_eq!("auto".parse::<FilesystemType>().unwrap(), FilesystemType::Auto);
        assert_eq!("erofs".parse::<FilesystemType>().unwrap(), FilesystemType::Erofs);
        assert!("zfs".parse::<FilesystemType>().is_err());
    }

    #[test]
    fn test_fs_type_serde_round_trip() {
        let s = serde_json::to_string(&FilesystemType::Ext4).unwrap();
        assert_eq!(s, "\"ext4\"");
        let back: FilesystemType = serde_json::from_str(&s).unwrap();
        assert_eq!(back, FilesystemType::Ext4);
    }
}
