//! Fast-path driver
//!
//! Client of the kernel-resident rule engine. Commands are marshalled into
//! fixed-layout records and issued one at a time over a privileged FD
//! obtained through the grab-FD helper. A command failure is never fatal
//! here; the orchestrator decides fallback.

pub mod proto;

use crate::error::{Error, Result};
use crate::utils::path_byte_len;
use proto::*;
use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::fs;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolution of the kernel side against our protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Available,
    KernelTooOld,
    ModuleTooOld,
    NotPresent,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Available => "available",
            DriverStatus::KernelTooOld => "kernel_too_old",
            DriverStatus::ModuleTooOld => "module_too_old",
            DriverStatus::NotPresent => "not_present",
        }
    }
}

/// Map a reported protocol version onto a status.
pub fn status_for_version(version: i32) -> DriverStatus {
    if version < 0 {
        DriverStatus::NotPresent
    } else if version < HYMO_PROTOCOL_VERSION {
        DriverStatus::KernelTooOld
    } else if version > HYMO_PROTOCOL_VERSION {
        DriverStatus::ModuleTooOld
    } else {
        DriverStatus::Available
    }
}

/// One step of the batched rule walk. The generator producing these is a
/// pure function of the module directory contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    Add { target: PathBuf, source: PathBuf },
    Hide { target: PathBuf },
}

/// A rule as reported by the kernel's listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelRule {
    Add { target: String, source: String },
    Merge { target: String, source: String },
    Hide { path: String },
}

impl KernelRule {
    pub fn render(&self) -> String {
        match self {
            KernelRule::Add { target, source } => format!("ADD {target} {source}"),
            KernelRule::Merge { target, source } => format!("MERGE {target} {source}"),
            KernelRule::Hide { path } => format!("HIDE {path}"),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            KernelRule::Add { target, source } => {
                serde_json::json!({"type": "ADD", "target": target, "source": source})
            }
            KernelRule::Merge { target, source } => {
                serde_json::json!({"type": "MERGE", "target": target, "source": source})
            }
            KernelRule::Hide { path } => {
                serde_json::json!({"type": "HIDE", "path": path})
            }
        }
    }
}

/// Parse the kernel's rule listing into typed rules. Unknown lines are
/// skipped. Re-issuing the parsed rules reproduces the listed state.
pub fn parse_rules(listing: &str) -> Vec<KernelRule> {
    let mut rules = Vec::new();
    for line in listing.lines() {
        let mut fields = line.split_whitespace();
        let Some(kind) = fields.next() else { continue };
        match kind.to_ascii_uppercase().as_str() {
            "ADD" => {
                if let (Some(target), Some(source)) = (fields.next(), fields.next()) {
                    rules.push(KernelRule::Add {
                        target: target.to_string(),
                        source: source.to_string(),
                    });
                }
            }
            "MERGE" => {
                if let (Some(target), Some(source)) = (fields.next(), fields.next()) {
                    rules.push(KernelRule::Merge {
                        target: target.to_string(),
                        source: source.to_string(),
                    });
                }
            }
            "HIDE" => {
                if let Some(path) = fields.next() {
                    rules.push(KernelRule::Hide {
                        path: path.to_string(),
                    });
                }
            }
            _ => debug!("skipping unknown rule line: {line}"),
        }
    }
    rules
}

/// Walk a module directory and emit the rule actions it implies:
/// files and symlinks redirect, whiteouts hide, directories only descend.
/// Entries are visited in name order so the result is deterministic.
pub fn generate_rules(target_base: &Path, module_dir: &Path) -> Result<Vec<RuleAction>> {
    if !module_dir.is_dir() {
        return Err(Error::PathNotFound(format!(
            "not a module directory: {}",
            module_dir.display()
        )));
    }

    let mut actions = Vec::new();
    walk_rules(target_base, module_dir, &mut actions)?;
    Ok(actions)
}

fn walk_rules(target_base: &Path, dir: &Path, actions: &mut Vec<RuleAction>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let target = target_base.join(entry.file_name());
        let ft = match entry.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                warn!("cannot stat {}: {e}", path.display());
                continue;
            }
        };

        if ft.is_dir() {
            walk_rules(&target, &path, actions)?;
        } else if ft.is_file() || ft.is_symlink() {
            actions.push(RuleAction::Add {
                target,
                source: path,
            });
        } else {
            use std::os::unix::fs::{FileTypeExt, MetadataExt};
            if ft.is_char_device() {
                match entry.metadata() {
                    Ok(meta) if meta.rdev() == 0 => actions.push(RuleAction::Hide { target }),
                    Ok(_) => {}
                    Err(e) => warn!("cannot stat {}: {e}", path.display()),
                }
            }
        }
    }
    Ok(())
}

fn path_cstr(path: &Path) -> Result<CString> {
    if path_byte_len(path) > HYMO_MAX_LEN_PATHNAME {
        return Err(Error::PathTooLong(
            path.display().to_string(),
            HYMO_MAX_LEN_PATHNAME,
        ));
    }
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Driver(format!("path contains NUL: {}", path.display())))
}

fn str_cstr(s: &str) -> Result<CString> {
    if s.len() > HYMO_MAX_LEN_PATHNAME {
        return Err(Error::PathTooLong(s.to_string(), HYMO_MAX_LEN_PATHNAME));
    }
    CString::new(s).map_err(|_| Error::Driver(format!("string contains NUL: {s}")))
}

/// Handle to the kernel rule engine. Owns the privileged command FD
/// (grabbed lazily, closed on drop) and the memoized status.
pub struct HymoDriver {
    fd: RefCell<Option<OwnedFd>>,
    status: Cell<Option<DriverStatus>>,
}

impl Default for HymoDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HymoDriver {
    pub fn new() -> Self {
        HymoDriver {
            fd: RefCell::new(None),
            status: Cell::new(None),
        }
    }

    fn grab_fd(&self) -> Result<i32> {
        if let Some(fd) = self.fd.borrow().as_ref() {
            return Ok(fd.as_raw_fd());
        }

        let mut fd: libc::c_int = -1;
        let ret = unsafe { libc::prctl(HYMO_PRCTL_GET_FD, &mut fd as *mut libc::c_int) };
        if ret < 0 || fd < 0 {
            return Err(Error::Driver("command FD unavailable".into()));
        }

        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        let raw = owned.as_raw_fd();
        *self.fd.borrow_mut() = Some(owned);
        Ok(raw)
    }

    /// Issue one command. `arg` is either a userspace address or a plain
    /// value, depending on the command. Returns the kernel's result field.
    fn execute(&self, cmd: u32, arg: u64) -> Result<i32> {
        let fd = self.grab_fd()?;
        let mut record = KsuHymoCmd {
            cmd,
            _pad: 0,
            arg,
            result: 0,
        };
        let ret = unsafe { libc::ioctl(fd, KSU_IOCTL_HYMO_CMD as _, &mut record) };
        if ret < 0 {
            return Err(Error::Driver(format!(
                "command {cmd:#x} ioctl failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(record.result)
    }

    fn execute_ok(&self, cmd: u32, arg: u64) -> Result<()> {
        let result = self.execute(cmd, arg)?;
        if result < 0 {
            return Err(Error::Driver(format!(
                "command {cmd:#x} rejected: errno {}",
                -result
            )));
        }
        Ok(())
    }

    pub fn protocol_version(&self) -> Result<i32> {
        self.execute(CMD_GET_VERSION, 0)
    }

    /// Memoized status; the version is queried once and cached until
    /// `reload_status`.
    pub fn status(&self) -> DriverStatus {
        if let Some(status) = self.status.get() {
            return status;
        }
        let status = match self.protocol_version() {
            Ok(version) => {
                let status = status_for_version(version);
                match status {
                    DriverStatus::Available => info!("rule engine available (version {version})"),
                    _ => warn!(
                        "rule engine protocol mismatch: kernel {version}, expected {}",
                        HYMO_PROTOCOL_VERSION
                    ),
                }
                status
            }
            Err(e) => {
                debug!("rule engine not present: {e}");
                DriverStatus::NotPresent
            }
        };
        self.status.set(Some(status));
        status
    }

    /// Drop the cached status (and FD) and probe again.
    pub fn reload_status(&self) -> DriverStatus {
        self.status.set(None);
        *self.fd.borrow_mut() = None;
        self.status()
    }

    pub fn is_available(&self) -> bool {
        self.status() == DriverStatus::Available
    }

    pub fn features(&self) -> Result<i32> {
        self.execute(CMD_GET_FEATURES, 0)
    }

    /// Redirect lookups of `target` to `source`. In the kernel record the
    /// lookup path travels in `src` and the content path in `target`.
    pub fn add_rule(&self, target: &Path, source: &Path, rule_type: i32) -> Result<()> {
        let lookup = path_cstr(target)?;
        let content = path_cstr(source)?;
        let arg = SyscallArg {
            src: lookup.as_ptr(),
            target: content.as_ptr(),
            rule_type,
        };
        debug!(
            "add rule {} -> {} (type {rule_type})",
            target.display(),
            source.display()
        );
        self.execute_ok(CMD_ADD_RULE, &arg as *const _ as u64)
    }

    pub fn add_merge_rule(&self, target: &Path, source: &Path) -> Result<()> {
        let lookup = path_cstr(target)?;
        let content = path_cstr(source)?;
        let arg = SyscallArg {
            src: lookup.as_ptr(),
            target: content.as_ptr(),
            rule_type: 0,
        };
        debug!("add merge rule {} -> {}", target.display(), source.display());
        self.execute_ok(CMD_ADD_MERGE_RULE, &arg as *const _ as u64)
    }

    pub fn delete_rule(&self, target: &Path) -> Result<()> {
        let dst = path_cstr(target)?;
        let arg = SyscallArg {
            src: dst.as_ptr(),
            target: std::ptr::null(),
            rule_type: 0,
        };
        debug!("delete rule {}", target.display());
        self.execute_ok(CMD_DEL_RULE, &arg as *const _ as u64)
    }

    pub fn hide_path(&self, path: &str) -> Result<()> {
        let src = str_cstr(path)?;
        let arg = SyscallArg {
            src: src.as_ptr(),
            target: std::ptr::null(),
            rule_type: 0,
        };
        debug!("hide path {path}");
        self.execute_ok(CMD_HIDE_RULE, &arg as *const _ as u64)
    }

    pub fn clear_rules(&self) -> Result<()> {
        info!("clearing all rules");
        self.execute_ok(CMD_CLEAR_ALL, 0)
    }

    /// Fetch the kernel's rule listing as text.
    pub fn list_rules(&self) -> Result<String> {
        let mut buf = vec![0u8; 128 * 1024];
        let arg = ListArg {
            buf: buf.as_mut_ptr() as *mut libc::c_char,
            size: buf.len(),
        };
        self.execute_ok(CMD_LIST_RULES, &arg as *const _ as u64)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    pub fn set_debug(&self, enable: bool) -> Result<()> {
        info!("kernel debug logging: {enable}");
        self.execute_ok(CMD_SET_DEBUG, enable as u64)
    }

    pub fn set_stealth(&self, enable: bool) -> Result<()> {
        info!("stealth mode: {enable}");
        self.execute_ok(CMD_SET_STEALTH, enable as u64)
    }

    pub fn set_enabled(&self, enable: bool) -> Result<()> {
        info!("rule engine enabled: {enable}");
        self.execute_ok(CMD_SET_ENABLED, enable as u64)
    }

    /// Reorder mnt_ids so injected mounts blend into the namespace. Must
    /// be the last mount-affecting step of a run.
    pub fn fix_mounts(&self) -> Result<()> {
        info!("reordering mount ids");
        self.execute_ok(CMD_REORDER_MNT_ID, 0)
    }

    pub fn hide_overlay_xattrs(&self, path: &Path) -> Result<()> {
        let src = path_cstr(path)?;
        let arg = SyscallArg {
            src: src.as_ptr(),
            target: std::ptr::null(),
            rule_type: 0,
        };
        self.execute_ok(CMD_HIDE_OVERLAY_XATTRS, &arg as *const _ as u64)
    }

    pub fn set_mirror_path(&self, path: &Path) -> Result<()> {
        let src = path_cstr(path)?;
        let arg = SyscallArg {
            src: src.as_ptr(),
            target: std::ptr::null(),
            rule_type: 0,
        };
        info!("mirror path: {}", path.display());
        self.execute_ok(CMD_SET_MIRROR_PATH, &arg as *const _ as u64)
    }

    pub fn set_uname(&self, release: &str, version: &str) -> Result<()> {
        let mut arg = SpoofUname::default();
        fill_cstr_field(&mut arg.release, release);
        fill_cstr_field(&mut arg.version, version);
        info!("uname spoof: release={release:?} version={version:?}");
        self.execute_ok(CMD_SET_UNAME, &arg as *const _ as u64)
    }

    pub fn set_cmdline(&self, cmdline: &str) -> Result<()> {
        let mut arg = SpoofCmdline::default();
        fill_cstr_field(&mut arg.cmdline, cmdline);
        info!("cmdline spoof set ({} bytes)", cmdline.len());
        self.execute_ok(CMD_SET_CMDLINE, &arg as *const _ as u64)
    }

    pub fn add_spoof_kstat(&self, record: &SpoofKstat) -> Result<()> {
        self.execute_ok(CMD_ADD_SPOOF_KSTAT, record as *const _ as u64)
    }

    /// Install rules for a whole module directory. Per-entry failures are
    /// logged and skipped; the call succeeds when the walk completed and
    /// at least one rule was issued.
    pub fn add_rules_from_directory(&self, target_base: &Path, module_dir: &Path) -> Result<bool> {
        let actions = generate_rules(target_base, module_dir)?;
        let mut issued = 0usize;
        for action in &actions {
            let result = match action {
                RuleAction::Add { target, source } => self.add_rule(target, source, 0),
                RuleAction::Hide { target } => self.hide_path(&target.display().to_string()),
            };
            match result {
                Ok(()) => issued += 1,
                Err(e) => warn!("rule install failed: {e}"),
            }
        }
        Ok(issued > 0)
    }

    /// Best-effort inverse of `add_rules_from_directory`. The kernel does
    /// not track rule origins, so a CLEAR_ALL plus reinstall is the only
    /// exact inverse.
    pub fn remove_rules_from_directory(
        &self,
        target_base: &Path,
        module_dir: &Path,
    ) -> Result<bool> {
        let actions = generate_rules(target_base, module_dir)?;
        let mut removed = 0usize;
        for action in &actions {
            let target = match action {
                RuleAction::Add { target, .. } => target,
                RuleAction::Hide { target } => target,
            };
            match self.delete_rule(target) {
                Ok(()) => removed += 1,
                Err(e) => warn!("rule removal failed: {e}"),
            }
        }
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for_version(11), DriverStatus::KernelTooOld);
        assert_eq!(status_for_version(12), DriverStatus::Available);
        assert_eq!(status_for_version(13), DriverStatus::ModuleTooOld);
        assert_eq!(status_for_version(-2), DriverStatus::NotPresent);
    }

    #[test]
    fn test_generate_rules_is_deterministic() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc/perm")).unwrap();
        fs::write(dir.path().join("etc/hosts"), b"x").unwrap();
        fs::write(dir.path().join("etc/perm/platform.xml"), b"y").unwrap();
        std::os::unix::fs::symlink("hosts", dir.path().join("etc/hosts.bak")).unwrap();

        let first = generate_rules(Path::new("/system"), dir.path()).unwrap();
        let second = generate_rules(Path::new("/system"), dir.path()).unwrap();
        assert_eq!(first, second);

        assert_eq!(
            first,
            vec![
                RuleAction::Add {
                    target: PathBuf::from("/system/etc/hosts"),
                    source: dir.path().join("etc/hosts"),
                },
                RuleAction::Add {
                    target: PathBuf::from("/system/etc/hosts.bak"),
                    source: dir.path().join("etc/hosts.bak"),
                },
                RuleAction::Add {
                    target: PathBuf::from("/system/etc/perm/platform.xml"),
                    source: dir.path().join("etc/perm/platform.xml"),
                },
            ]
        );
    }

    #[test]
    fn test_generate_rules_rejects_non_directory() {
        assert!(generate_rules(Path::new("/system"), Path::new("/nonexistent")).is_err());
    }

    #[test]
    fn test_path_length_boundary() {
        // 256 bytes is accepted, 257 is rejected with an explicit error.
        let ok = format!("/{}", "a".repeat(255));
        assert_eq!(ok.len(), 256);
        assert!(path_cstr(Path::new(&ok)).is_ok());

        let too_long = format!("/{}", "a".repeat(256));
        assert_eq!(too_long.len(), 257);
        match path_cstr(Path::new(&too_long)) {
            Err(Error::PathTooLong(_, max)) => assert_eq!(max, HYMO_MAX_LEN_PATHNAME),
            other => panic!("expected PathTooLong, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rules_round_trip() {
        let listing = "ADD /system/etc/hosts /dev/hymo_mirror/a/system/etc/hosts\n\
                       HIDE /system/xbin/su\n\
                       MERGE /system/app /dev/hymo_mirror/b/system/app\n\
                       garbage line\n";
        let rules = parse_rules(listing);
        assert_eq!(rules.len(), 3);

        let rendered: Vec<String> = rules.iter().map(|r| r.render()).collect();
        let reparsed = parse_rules(&rendered.join("\n"));
        assert_eq!(rules, reparsed);
    }

    #[test]
    fn test_parse_rules_case_insensitive() {
        let rules = parse_rules("add /a /b\nhide /c\n");
        assert_eq!(
            rules,
            vec![
                KernelRule::Add {
                    target: "/a".into(),
                    source: "/b".into()
                },
                KernelRule::Hide { path: "/c".into() },
            ]
        );
    }
}
