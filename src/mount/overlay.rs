//! Overlay engine
//!
//! Mounts a union filesystem over a whole partition, then restores the
//! submounts and partition symlinks the overlay covered. The working
//! directory is changed into the target before mounting so the stock tree
//! stays reachable through `.` for the restoration passes.

use crate::defs;
use crate::error::{Error, Result};
use crate::mount::utils::bind_mount;
use crate::utils::send_unmountable;
use procfs::process::Process;
use rustix::fd::AsFd;
use rustix::fs::CWD;
use rustix::mount::{
    fsconfig_create, fsconfig_set_string, fsmount, fsopen, move_mount, mount, FsMountFlags,
    FsOpenFlags, MountAttrFlags, MountFlags, MoveMountFlags,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Join the module layers and the stock bottom layer into the colon
/// syntax overlayfs expects. The first entry has the highest priority.
fn build_lowerdir(lower_dirs: &[String], lowest: &str) -> String {
    lower_dirs
        .iter()
        .map(|s| s.as_str())
        .chain(std::iter::once(lowest))
        .collect::<Vec<_>>()
        .join(":")
}

/// Mount an overlay at `dest`, preferring the filesystem-configuration
/// API and falling back to a classic mount.
pub fn mount_overlayfs(
    lower_dirs: &[String],
    lowest: &str,
    upperdir: Option<&Path>,
    workdir: Option<&Path>,
    dest: &Path,
    disable_umount: bool,
) -> Result<()> {
    let lowerdir_config = build_lowerdir(lower_dirs, lowest);

    info!(
        "mount overlayfs on {}, lowerdir={lowerdir_config}, upperdir={upperdir:?}, workdir={workdir:?}",
        dest.display()
    );

    let upperdir = upperdir
        .filter(|p| p.exists())
        .map(|p| p.display().to_string());
    let workdir = workdir
        .filter(|p| p.exists())
        .map(|p| p.display().to_string());

    let modern = (|| -> rustix::io::Result<()> {
        let fs = fsopen("overlay", FsOpenFlags::FSOPEN_CLOEXEC)?;
        let fs = fs.as_fd();
        fsconfig_set_string(fs, "lowerdir", &lowerdir_config)?;
        if let (Some(upper), Some(work)) = (&upperdir, &workdir) {
            fsconfig_set_string(fs, "upperdir", upper)?;
            fsconfig_set_string(fs, "workdir", work)?;
        }
        fsconfig_set_string(fs, "source", defs::OVERLAY_SOURCE)?;
        fsconfig_create(fs)?;
        let mnt = fsmount(fs, FsMountFlags::FSMOUNT_CLOEXEC, MountAttrFlags::empty())?;
        move_mount(
            mnt.as_fd(),
            "",
            CWD,
            dest,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
    })();

    if let Err(e) = modern {
        warn!("fsopen mount failed ({e}), falling back to classic mount");
        let mut data = format!("lowerdir={lowerdir_config}");
        if let (Some(upper), Some(work)) = (upperdir, workdir) {
            data = format!("{data},upperdir={upper},workdir={work}");
        }
        mount(
            defs::OVERLAY_SOURCE,
            dest,
            "overlay",
            MountFlags::empty(),
            data,
        )
        .map_err(|e| Error::Mount(format!("overlay on {} failed: {e}", dest.display())))?;
    }

    if !disable_umount {
        let _ = send_unmountable(dest);
    }
    Ok(())
}

/// Mounts strictly under `target_root`, sorted so ancestors come before
/// descendants, deduplicated.
fn child_mounts_under(target_root: &str) -> Result<Vec<String>> {
    let process =
        Process::myself().map_err(|e| Error::Internal(format!("procfs self: {e}")))?;
    let mounts = process
        .mountinfo()
        .map_err(|e| Error::Internal(format!("mountinfo: {e}")))?;

    let root = Path::new(target_root);
    let mut seq: Vec<String> = mounts
        .0
        .iter()
        .filter(|m| m.mount_point.starts_with(root) && m.mount_point != root)
        .map(|m| m.mount_point.to_string_lossy().to_string())
        .collect();
    seq.sort();
    seq.dedup();
    Ok(seq)
}

/// Restore one covered child mount: bind the stock path back when no
/// module touches it (or a file collides with the mount point), otherwise
/// mount a sub-overlay with the stock tree as the bottom layer.
fn mount_overlay_child(
    mount_point: &str,
    relative: &str,
    module_roots: &[String],
    stock_root: &str,
    disable_umount: bool,
) -> Result<()> {
    let rel = relative.trim_start_matches('/');

    let has_modification = module_roots
        .iter()
        .any(|root| Path::new(root).join(rel).exists());

    if !has_modification {
        return bind_mount(Path::new(stock_root), Path::new(mount_point), disable_umount);
    }

    if !Path::new(stock_root).is_dir() {
        return Ok(());
    }

    let mut lower_dirs: Vec<String> = Vec::new();
    for root in module_roots {
        let path = Path::new(root).join(rel);
        if path.is_dir() {
            lower_dirs.push(path.display().to_string());
        } else if path.exists() {
            // A module file collides with the mount point; an overlay of a
            // file over a directory is invalid, restore the stock mount.
            warn!("file modification at mount point {mount_point}, binding stock back");
            return bind_mount(Path::new(stock_root), Path::new(mount_point), disable_umount);
        }
    }

    if lower_dirs.is_empty() {
        return bind_mount(Path::new(stock_root), Path::new(mount_point), disable_umount);
    }

    if let Err(e) = mount_overlayfs(
        &lower_dirs,
        stock_root,
        None,
        None,
        Path::new(mount_point),
        disable_umount,
    ) {
        warn!("sub-overlay on {mount_point} failed ({e}), binding stock back");
        bind_mount(Path::new(stock_root), Path::new(mount_point), disable_umount)?;
    }
    Ok(())
}

/// Re-establish the partition-into-root illusion broken by the overlay:
/// when `/part` is a real directory and `T/part` became a directory (the
/// stock symlink got covered), stack the module subtrees over `/part` or
/// bind it back untouched.
fn restore_partition_roots(
    target_root: &str,
    module_roots: &[String],
    handled: &[String],
    disable_umount: bool,
) {
    for part in defs::SYMLINK_PARTITIONS {
        let root_part = format!("/{part}");
        let target_part = format!("{target_root}/{part}");

        if !Path::new(&root_part).is_dir() {
            continue;
        }
        let target = Path::new(&target_part);
        if Path::new(&target_part)
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(true)
            || !target.is_dir()
        {
            continue;
        }
        if handled.iter().any(|m| m == &target_part) {
            continue;
        }

        info!("restoring partition root {root_part} at {target_part}");
        if let Err(e) = mount_overlay_child(
            &target_part,
            &root_part,
            module_roots,
            &root_part,
            disable_umount,
        ) {
            warn!("failed to restore partition {part}: {e}");
        }
    }
}

/// Mount an overlay over `target_root` with the module subtrees as upper
/// lower layers, then restore covered child mounts and partition roots.
pub fn mount_overlay(
    target_root: &str,
    module_roots: &[String],
    upperdir: Option<PathBuf>,
    workdir: Option<PathBuf>,
    disable_umount: bool,
) -> Result<()> {
    info!("starting overlay mount for {target_root}");

    // Hold a reference to the stock tree through the cwd.
    std::env::set_current_dir(target_root)
        .map_err(|e| Error::Mount(format!("chdir to {target_root} failed: {e}")))?;
    let stock_root = ".";

    // Scan before mounting over the root, so we know what to restore.
    let mount_seq = child_mounts_under(target_root)?;
    if !mount_seq.is_empty() {
        debug!(
            "found {} child mounts under {target_root}",
            mount_seq.len()
        );
    }

    mount_overlayfs(
        module_roots,
        target_root,
        upperdir.as_deref(),
        workdir.as_deref(),
        Path::new(target_root),
        disable_umount,
    )?;

    for mount_point in &mount_seq {
        let relative = mount_point
            .strip_prefix(target_root)
            .unwrap_or(mount_point.as_str());
        let stock_relative = format!("{stock_root}{relative}");

        if !Path::new(&stock_relative).exists() {
            debug!("no stock path for child mount {mount_point}");
            continue;
        }

        debug!("restoring child mount {mount_point}");
        if let Err(e) = mount_overlay_child(
            mount_point,
            relative,
            module_roots,
            &stock_relative,
            disable_umount,
        ) {
            warn!("failed to restore child mount {mount_point}: {e}");
        }
    }

    restore_partition_roots(target_root, module_roots, &mount_seq, disable_umount);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_lowerdir_stacks_stock_last() {
        let lowers = vec!["/mnt/b/system".to_string(), "/mnt/a/system".to_string()];
        assert_eq!(
            build_lowerdir(&lowers, "/system"),
            "/mnt/b/system:/mnt/a/system:/system"
        );
    }

    #[test]
    fn test_build_lowerdir_no_modules() {
        assert_eq!(build_lowerdir(&[], "."), ".");
    }

    #[test]
    fn test_child_relative_path_math() {
        let mount_point = "/system/apex";
        let relative = mount_point.strip_prefix("/system").unwrap();
        assert_eq!(relative, "/apex");
        assert_eq!(format!(".{relative}"), "./apex");
        assert_eq!(relative.trim_start_matches('/'), "apex");
    }
}
