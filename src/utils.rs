//! Filesystem and process utilities shared across the daemon

use crate::defs;
use crate::error::{Error, Result};
use rustix::fs::XattrFlags;
use rustix::mount::MountFlags;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

const SELINUX_XATTR: &str = "security.selinux";

/// Create a directory (and parents) if it does not exist yet.
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Read the SELinux label of a path without following symlinks.
pub fn lgetfilecon(path: &Path) -> Result<String> {
    let mut buf = [0u8; 256];
    let n = rustix::fs::lgetxattr(path, SELINUX_XATTR, &mut buf)?;
    let end = buf[..n].iter().position(|&b| b == 0).unwrap_or(n);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

/// Set the SELinux label of a path without following symlinks.
pub fn lsetfilecon(path: &Path, context: &str) -> Result<()> {
    rustix::fs::lsetxattr(path, SELINUX_XATTR, context.as_bytes(), XattrFlags::empty())?;
    Ok(())
}

/// Copy the SELinux label from `src` to `dst`.
pub fn copy_path_context(src: &Path, dst: &Path) -> Result<()> {
    lsetfilecon(dst, &lgetfilecon(src)?)
}

/// Best-effort copy of all xattrs from `src` to `dst`.
pub fn copy_xattrs(src: &Path, dst: &Path) {
    let mut names = [0u8; 1024];
    let n = match rustix::fs::llistxattr(src, &mut names) {
        Ok(n) => n,
        Err(_) => return,
    };
    for name in names[..n].split(|&b| b == 0).filter(|s| !s.is_empty()) {
        let name = String::from_utf8_lossy(name).into_owned();
        let mut value = [0u8; 1024];
        if let Ok(len) = rustix::fs::lgetxattr(src, name.as_str(), &mut value) {
            if let Err(e) =
                rustix::fs::lsetxattr(dst, name.as_str(), &value[..len], XattrFlags::empty())
            {
                debug!("xattr {name} copy to {} failed: {e}", dst.display());
            }
        }
    }
}

/// Clone mode, owner and SELinux label from `src` to `dst`. Other xattrs
/// are copied best-effort. Symlinks keep their own permission semantics,
/// so only ownership and label are cloned for them.
pub fn clone_attr(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;

    if !meta.file_type().is_symlink() {
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    }
    rustix::fs::chownat(
        rustix::fs::CWD,
        dst,
        Some(unsafe { rustix::fs::Uid::from_raw(meta.uid()) }),
        Some(unsafe { rustix::fs::Gid::from_raw(meta.gid()) }),
        rustix::fs::AtFlags::SYMLINK_NOFOLLOW,
    )?;

    if let Err(e) = copy_path_context(src, dst) {
        debug!("context copy {} -> {} failed: {e}", src.display(), dst.display());
    }
    copy_xattrs(src, dst);
    Ok(())
}

/// Mount a fresh tmpfs (mode 0755) at `target`.
pub fn mount_tmpfs(target: &Path, source: &str) -> Result<()> {
    ensure_dir_exists(target)?;
    rustix::mount::mount(source, target, "tmpfs", MountFlags::empty(), "mode=0755")?;
    Ok(())
}

/// Probe extended-attribute support by writing and reading back a known
/// label on a scratch file.
pub fn is_xattr_supported(dir: &Path) -> bool {
    let probe = dir.join(".xattr_probe");
    let supported = (|| -> Result<bool> {
        fs::write(&probe, b"")?;
        lsetfilecon(&probe, defs::DEFAULT_SELINUX_CONTEXT)?;
        Ok(lgetfilecon(&probe)? == defs::DEFAULT_SELINUX_CONTEXT)
    })()
    .unwrap_or(false);
    let _ = fs::remove_file(&probe);
    supported
}

// Loop device control (no rustix wrapper for these)
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;

/// Attach `image` to a free loop device and return the device node path.
fn attach_loop(image: &Path, read_only: bool) -> Result<PathBuf> {
    let control = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/loop-control")?;

    let index = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
    if index < 0 {
        return Err(Error::Storage("no free loop device".into()));
    }

    let node = PathBuf::from(format!("/dev/loop{index}"));
    let device = fs::OpenOptions::new().read(true).write(true).open(&node)?;
    let backing = fs::OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(image)?;

    let ret = unsafe {
        libc::ioctl(
            device.as_raw_fd(),
            LOOP_SET_FD as _,
            backing.as_raw_fd() as libc::c_int,
        )
    };
    if ret < 0 {
        return Err(Error::Storage(format!(
            "LOOP_SET_FD failed for {}",
            image.display()
        )));
    }
    Ok(node)
}

fn detach_loop(node: &Path) {
    if let Ok(device) = fs::OpenOptions::new().read(true).write(true).open(node) {
        unsafe {
            libc::ioctl(device.as_raw_fd(), LOOP_CLR_FD as _, 0);
        }
    }
}

/// Loop-mount a filesystem image at `target`.
pub fn mount_image(image: &Path, target: &Path, fs_type: &str, read_only: bool) -> Result<()> {
    ensure_dir_exists(target)?;
    let node = attach_loop(image, read_only)?;

    let mut flags = MountFlags::NOATIME;
    if read_only {
        flags |= MountFlags::RDONLY;
    }

    if let Err(e) = rustix::mount::mount(&node, target, fs_type, flags, "") {
        detach_loop(&node);
        return Err(Error::Mount(format!(
            "mount {} ({fs_type}) on {} failed: {e}",
            image.display(),
            target.display()
        )));
    }
    Ok(())
}

/// Run an external tool with an explicit argv, stdio redirected to null,
/// waiting synchronously. Never goes through a shell.
pub fn run_quiet(bin: &str, args: &[&str]) -> Result<std::process::ExitStatus> {
    Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| Error::Internal(format!("failed to spawn {bin}: {e}")))
}

/// First executable found among `candidates`.
pub fn find_binary(candidates: &[&'static str]) -> Option<&'static str> {
    candidates
        .iter()
        .copied()
        .find(|p| rustix::fs::access(*p, rustix::fs::Access::EXEC_OK).is_ok())
}

/// Attempt an in-place ext4 image repair. fsck exit codes 0..=2 mean the
/// image is (now) clean.
pub fn repair_image(image: &Path) -> bool {
    let Some(fsck) = find_binary(&["/system/bin/e2fsck", "/sbin/e2fsck", "/system/bin/fsck.ext4"])
    else {
        warn!("no e2fsck binary found, cannot repair image");
        return false;
    };
    let image = image.display().to_string();
    match run_quiet(fsck, &["-y", image.as_str()]) {
        Ok(status) => matches!(status.code(), Some(0..=2)),
        Err(e) => {
            warn!("e2fsck failed to run: {e}");
            false
        }
    }
}

/// Recursively copy a module tree, preserving mode, owner, label and
/// whiteout character devices.
pub fn sync_dir(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        return Err(Error::PathNotFound(format!(
            "sync source is not a directory: {}",
            src.display()
        )));
    }

    ensure_dir_exists(dst)?;
    if let Err(e) = clone_attr(src, dst) {
        debug!("attr clone for {} failed: {e}", dst.display());
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let s = entry.path();
        let d = dst.join(entry.file_name());
        let ft = entry.file_type()?;

        if ft.is_dir() {
            sync_dir(&s, &d)?;
        } else if ft.is_symlink() {
            if d.exists() || fs::symlink_metadata(&d).is_ok() {
                let _ = fs::remove_file(&d);
            }
            std::os::unix::fs::symlink(fs::read_link(&s)?, &d)?;
            if let Err(e) = clone_attr(&s, &d) {
                debug!("symlink attr clone for {} failed: {e}", d.display());
            }
        } else if ft.is_file() {
            fs::copy(&s, &d)?;
            if let Err(e) = clone_attr(&s, &d) {
                debug!("attr clone for {} failed: {e}", d.display());
            }
        } else if ft.is_char_device() && entry.metadata()?.rdev() == 0 {
            crate::mount::utils::create_whiteout(&s, &d)?;
        } else {
            warn!("skipping special file during sync: {}", s.display());
        }
    }
    Ok(())
}

/// True when the tree under `path` contains at least one non-directory.
pub fn has_files_recursive(path: &Path) -> bool {
    let Ok(entries) = fs::read_dir(path) else {
        return false;
    };
    for entry in entries.flatten() {
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => {
                if has_files_recursive(&entry.path()) {
                    return true;
                }
            }
            Ok(_) => return true,
            Err(_) => continue,
        }
    }
    false
}

/// Total size in bytes of regular files under `path`.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => total += dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => total += entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => {}
        }
    }
    total
}

/// Human-readable byte count for the storage status report.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0}K", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

/// Register a mount with the external cleanup collaborator. The contract
/// is a newline-separated manifest under the run directory; a later pass
/// reads it to detach tracked mounts.
pub fn send_unmountable(target: &Path) -> Result<()> {
    use std::io::Write;
    ensure_dir_exists(Path::new(defs::RUN_DIR))?;
    let manifest = Path::new(defs::RUN_DIR).join("unmountable.list");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(manifest)?;
    writeln!(file, "{}", target.display())?;
    Ok(())
}

/// Invoke the privileged ext4 trace suppression helper, when installed.
pub fn deploy_nuke(mount_point: &Path) -> bool {
    let helper = Path::new(defs::BASE_DIR).join("bin/nuke_helper");
    if rustix::fs::access(&helper, rustix::fs::Access::EXEC_OK).is_err() {
        debug!("nuke helper not installed at {}", helper.display());
        return false;
    }
    let helper = helper.display().to_string();
    let target = mount_point.display().to_string();
    matches!(run_quiet(&helper, &[target.as_str()]), Ok(status) if status.success())
}

/// Replace the visible process name.
pub fn camouflage_process(name: &str) -> Result<()> {
    let cname = CString::new(name).map_err(|_| Error::Internal("bad process name".into()))?;
    let ret = unsafe { libc::prctl(libc::PR_SET_NAME, cname.as_ptr()) };
    if ret != 0 {
        return Err(Error::Internal(format!("prctl(PR_SET_NAME) failed: {ret}")));
    }
    Ok(())
}

/// Pick a tmpfs-backed location for the magic-mount workdir.
pub fn select_temp_dir() -> Result<PathBuf> {
    for base in ["/debug_ramdisk", "/sbin", "/dev"] {
        let base = Path::new(base);
        if base.is_dir() {
            return Ok(base.join("hymo_tmp"));
        }
    }
    Err(Error::Storage("no usable temp directory found".into()))
}

pub fn ensure_temp_dir(temp_dir: &Path) -> Result<()> {
    ensure_dir_exists(temp_dir)
}

pub fn cleanup_temp_dir(temp_dir: &Path) {
    if let Err(e) = fs::remove_dir_all(temp_dir) {
        debug!("temp dir cleanup failed for {}: {e}", temp_dir.display());
    }
}

/// Byte length of a path as the kernel sees it.
pub fn path_byte_len(path: &Path) -> usize {
    path.as_os_str().as_bytes().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_has_files_recursive() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        assert!(!has_files_recursive(dir.path()));

        fs::write(dir.path().join("a/b/c/file"), b"x").unwrap();
        assert!(has_files_recursive(dir.path()));
    }

    #[test]
    fn test_dir_size() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("one"), vec![0u8; 100]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/two"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()), 150);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2K");
        assert_eq!(format_size(3 * 1024 * 1024), "3M");
        assert_eq!(format_size(1024 * 1024 * 1024 + 512 * 1024 * 1024), "1.5G");
    }

    #[test]
    fn test_sync_dir_copies_tree() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("system/etc")).unwrap();
        fs::write(src.path().join("system/etc/hosts"), b"127.0.0.1 test\n").unwrap();
        std::os::unix::fs::symlink("hosts", src.path().join("system/etc/hosts.link")).unwrap();

        let target = dst.path().join("mod");
        sync_dir(src.path(), &target).unwrap();

        assert_eq!(
            fs::read(target.join("system/etc/hosts")).unwrap(),
            b"127.0.0.1 test\n"
        );
        assert_eq!(
            fs::read_link(target.join("system/etc/hosts.link")).unwrap(),
            PathBuf::from("hosts")
        );
    }

    #[test]
    fn test_path_byte_len() {
        assert_eq!(path_byte_len(Path::new("/ab")), 3);
    }
}
