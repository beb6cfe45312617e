//! Bind-mount primitives and mount-tree helpers

use crate::error::{Error, Result};
use crate::utils::{clone_attr, copy_path_context, send_unmountable};
use rustix::fd::AsFd;
use rustix::fs::CWD;
use rustix::mount::{
    move_mount, open_tree, MountFlags, MoveMountFlags, OpenTreeFlags,
};
use std::fs;
use std::path::{Component, Path};
use tracing::{debug, warn};

/// Bind `from` onto `to`, preferring the kernel tree-clone API and falling
/// back to a classic recursive bind mount.
pub fn bind_mount(from: &Path, to: &Path, disable_umount: bool) -> Result<()> {
    debug!("bind mount {} -> {}", from.display(), to.display());

    let modern = (|| -> rustix::io::Result<()> {
        let tree = open_tree(
            CWD,
            from,
            OpenTreeFlags::OPEN_TREE_CLOEXEC
                | OpenTreeFlags::OPEN_TREE_CLONE
                | OpenTreeFlags::AT_RECURSIVE,
        )?;
        move_mount(
            tree.as_fd(),
            "",
            CWD,
            to,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
    })();

    if let Err(e) = modern {
        debug!("open_tree bind failed ({e}), falling back to classic bind");
        rustix::mount::mount_recursive_bind(from, to).map_err(|e| {
            Error::Mount(format!(
                "bind mount {} -> {} failed: {e}",
                from.display(),
                to.display()
            ))
        })?;
    }

    if !disable_umount {
        let _ = send_unmountable(to);
    }
    Ok(())
}

/// Remount an existing bind read-only; failures only degrade write
/// protection, so they are logged and swallowed.
pub fn remount_ro_bind(target: &Path) {
    if let Err(e) =
        rustix::mount::mount_remount(target, MountFlags::RDONLY | MountFlags::BIND, "")
    {
        debug!("ro remount of {} failed: {e}", target.display());
    }
}

/// Recreate `src/name` inside `dst` so the shadowing tmpfs keeps the
/// original entry visible: files become read-only binds of the original,
/// directories recurse, symlinks are cloned with their attributes.
pub fn mount_mirror(src: &Path, dst: &Path, name: &std::ffi::OsStr) -> Result<()> {
    let source = src.join(name);
    let target = dst.join(name);

    let meta = fs::symlink_metadata(&source)?;
    let ft = meta.file_type();

    if ft.is_file() {
        fs::File::create(&target)?;
        rustix::mount::mount_bind(&source, &target)?;
        remount_ro_bind(&target);
    } else if ft.is_dir() {
        fs::create_dir(&target)?;
        clone_attr(&source, &target)?;
        for entry in fs::read_dir(&source)? {
            let entry = entry?;
            mount_mirror(&source, &target, &entry.file_name())?;
        }
    } else if ft.is_symlink() {
        clone_symlink(&source, &target)?;
    }
    Ok(())
}

/// Copy a symlink, preserving its target and attributes.
pub fn clone_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(&target, dst)?;
    if let Err(e) = clone_attr(src, dst) {
        debug!("symlink attr clone for {} failed: {e}", dst.display());
    }
    Ok(())
}

/// Create a whiteout marker: a character device 0:0. The SELinux context
/// comes from the shadowed path when it exists, else from the parent.
pub fn create_whiteout(shadowed: &Path, work_path: &Path) -> Result<()> {
    if let Some(parent) = work_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::symlink_metadata(work_path).is_ok() {
        fs::remove_file(work_path)?;
    }

    rustix::fs::mknodat(
        CWD,
        work_path,
        rustix::fs::FileType::CharacterDevice,
        rustix::fs::Mode::empty(),
        rustix::fs::makedev(0, 0),
    )
    .map_err(|e| Error::Mount(format!("whiteout {} failed: {e}", work_path.display())))?;

    if shadowed.exists() {
        if let Err(e) = clone_attr(shadowed, work_path) {
            debug!("whiteout attr clone failed: {e}");
        }
    } else if let Some(parent) = work_path.parent() {
        if let Err(e) = copy_path_context(parent, work_path) {
            debug!("whiteout context copy failed: {e}");
        }
    }
    Ok(())
}

/// A module symlink is safe when its target cannot lexically escape the
/// live root once materialized at `virtual_path`.
pub fn is_safe_symlink(link: &Path, virtual_path: &Path) -> bool {
    let Ok(target) = fs::read_link(link) else {
        warn!("unreadable symlink: {}", link.display());
        return false;
    };
    if target.is_absolute() {
        return true;
    }

    let mut depth: i64 = virtual_path
        .parent()
        .map(|p| {
            p.components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count() as i64
        })
        .unwrap_or(0);

    for comp in target.components() {
        match comp {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_safe_symlink_absolute() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("/system/lib/libc.so", &link).unwrap();
        assert!(is_safe_symlink(&link, Path::new("/system/lib64/libc.so")));
    }

    #[test]
    fn test_safe_symlink_relative_within_root() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("../lib/libfoo.so", &link).unwrap();
        assert!(is_safe_symlink(&link, Path::new("/system/bin/foo")));
    }

    #[test]
    fn test_unsafe_symlink_escapes_root() {
        let dir = tempdir().unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink("../../../../etc/passwd", &link).unwrap();
        assert!(!is_safe_symlink(&link, Path::new("/system/bin/foo")));
    }

    #[test]
    fn test_unreadable_symlink_is_unsafe() {
        assert!(!is_safe_symlink(
            Path::new("/nonexistent/link"),
            Path::new("/system/bin/foo")
        ));
    }

    #[test]
    fn test_create_whiteout_makes_char_dev() {
        // mknod of a 0:0 char device needs privileges; only assert the
        // error shape when unprivileged.
        let dir = tempdir().unwrap();
        let target = dir.path().join("wh");
        match create_whiteout(Path::new("/nonexistent"), &target) {
            Ok(()) => {
                use std::os::unix::fs::{FileTypeExt, MetadataExt};
                let meta = fs::symlink_metadata(&target).unwrap();
                assert!(meta.file_type().is_char_device());
                assert_eq!(meta.rdev(), 0);
            }
            Err(Error::Mount(msg)) => assert!(msg.contains("whiteout")),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_clone_symlink_preserves_target() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::os::unix::fs::symlink("some/target", &src).unwrap();
        clone_symlink(&src, &dst).unwrap();
        assert_eq!(fs::read_link(&dst).unwrap(), Path::new("some/target"));
    }
}
