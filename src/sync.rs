//! Mirror synchronization
//!
//! Copies enabled module trees into the prepared storage, pruning
//! orphans and skipping modules whose `module.prop` is unchanged, then
//! mirrors SELinux contexts from the live tree.

use crate::defs;
use crate::error::Result;
use crate::scanner::Module;
use crate::utils::{copy_path_context, has_files_recursive, sync_dir};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Sync all `modules` into `target_base`.
pub fn perform_sync(modules: &[Module], target_base: &Path, partitions: &[String]) -> Result<()> {
    info!("starting module sync to {}", target_base.display());

    prune_orphaned_modules(modules, target_base)?;

    for module in modules {
        let dst = target_base.join(&module.id);

        let has_content = partitions.iter().any(|p| {
            let part_path = module.source_path.join(p);
            part_path.exists() && has_files_recursive(&part_path)
        });
        if !has_content {
            debug!("skipping empty module {}", module.id);
            continue;
        }

        if !should_sync(&module.source_path, &dst) {
            debug!("module {} is up to date", module.id);
            continue;
        }

        info!("syncing module {}", module.id);
        if dst.exists() {
            if let Err(e) = fs::remove_dir_all(&dst) {
                warn!("failed to clean target for {}: {e}", module.id);
            }
        }

        if let Err(e) = sync_dir(&module.source_path, &dst) {
            warn!("failed to sync module {}: {e}", module.id);
            continue;
        }

        repair_module_contexts(&dst, &module.id, partitions);
    }

    Ok(())
}

/// Remove storage directories that no longer correspond to an active
/// module.
fn prune_orphaned_modules(modules: &[Module], target_base: &Path) -> Result<()> {
    if !target_base.exists() {
        return Ok(());
    }

    let active: HashSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();

    for entry in fs::read_dir(target_base)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == "lost+found"
            || name == defs::SELF_MODULE_ID
            || name == defs::OVERLAY_STAGING_DIR
        {
            continue;
        }
        if active.contains(name.as_str()) {
            continue;
        }

        info!("pruning orphaned module storage: {name}");
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = removed {
            warn!("failed to remove orphan {name}: {e}");
        }
    }
    Ok(())
}

/// A module needs a fresh sync when the target is missing or the
/// `module.prop` contents differ. Content comparison survives `touch`,
/// unlike mtime checks.
fn should_sync(src: &Path, dst: &Path) -> bool {
    if !dst.exists() {
        return true;
    }

    let src_prop = src.join("module.prop");
    let dst_prop = dst.join("module.prop");
    if !src_prop.exists() || !dst_prop.exists() {
        return true;
    }

    match (fs::read(&src_prop), fs::read(&dst_prop)) {
        (Ok(s), Ok(d)) => s != d,
        _ => true,
    }
}

/// Mirror SELinux contexts from the live tree onto the synced copy so
/// rules and overlays expose correctly-labeled files. Overlay control
/// directories take the parent's context; all failures demote to DEBUG.
fn repair_module_contexts(module_root: &Path, module_id: &str, partitions: &[String]) {
    for part in partitions {
        let part_root = module_root.join(part);
        if !part_root.exists() {
            continue;
        }
        if let Err(e) = recursive_context_repair(module_root, &part_root) {
            warn!("context repair failed for {module_id}/{part}: {e}");
        }
    }
}

fn recursive_context_repair(base: &Path, current: &Path) -> Result<()> {
    let Ok(relative) = current.strip_prefix(base) else {
        return Ok(());
    };

    let name = current.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let live_path = Path::new("/").join(relative);

    if live_path.exists() {
        if let Err(e) = copy_path_context(&live_path, current) {
            debug!("context mirror for {} failed: {e}", relative.display());
        }
    } else if name == "upperdir" || name == "workdir" {
        if let Some(parent) = current.parent() {
            if let Err(e) = copy_path_context(parent, current) {
                debug!("control dir context for {} failed: {e}", current.display());
            }
        }
    }

    if current.is_dir() {
        for entry in fs::read_dir(current)? {
            recursive_context_repair(base, &entry?.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountMode;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn module(root: &Path, id: &str) -> Module {
        let src = root.join(id);
        fs::create_dir_all(src.join("system/etc")).unwrap();
        fs::write(src.join("system/etc/conf"), b"data").unwrap();
        fs::write(src.join("module.prop"), format!("id={id}\nversion=1\n")).unwrap();
        Module {
            id: id.to_string(),
            source_path: src,
            mode: MountMode::Auto,
        }
    }

    fn partitions() -> Vec<String> {
        vec!["system".to_string()]
    }

    #[test]
    fn test_sync_copies_new_module() {
        let src_root = tempdir().unwrap();
        let dst_root = tempdir().unwrap();
        let modules = vec![module(src_root.path(), "alpha")];

        perform_sync(&modules, dst_root.path(), &partitions()).unwrap();
        assert!(dst_root.path().join("alpha/system/etc/conf").exists());
    }

    #[test]
    fn test_sync_skips_unchanged_module() {
        let src_root = tempdir().unwrap();
        let dst_root = tempdir().unwrap();
        let modules = vec![module(src_root.path(), "alpha")];

        perform_sync(&modules, dst_root.path(), &partitions()).unwrap();

        // Mutate the copy; an unchanged module.prop must not trigger a
        // re-sync that would revert it.
        let marker = dst_root.path().join("alpha/system/etc/marker");
        fs::write(&marker, b"keep").unwrap();
        perform_sync(&modules, dst_root.path(), &partitions()).unwrap();
        assert!(marker.exists());
    }

    #[test]
    fn test_sync_resyncs_on_prop_change() {
        let src_root = tempdir().unwrap();
        let dst_root = tempdir().unwrap();
        let modules = vec![module(src_root.path(), "alpha")];

        perform_sync(&modules, dst_root.path(), &partitions()).unwrap();
        let marker = dst_root.path().join("alpha/system/etc/marker");
        fs::write(&marker, b"stale").unwrap();

        fs::write(
            src_root.path().join("alpha/module.prop"),
            "id=alpha\nversion=2\n",
        )
        .unwrap();
        perform_sync(&modules, dst_root.path(), &partitions()).unwrap();
        assert!(!marker.exists());
        assert!(dst_root.path().join("alpha/system/etc/conf").exists());
    }

    #[test]
    fn test_orphans_are_pruned() {
        let src_root = tempdir().unwrap();
        let dst_root = tempdir().unwrap();
        let modules = vec![module(src_root.path(), "alpha")];

        fs::create_dir_all(dst_root.path().join("ghost/system")).unwrap();
        fs::create_dir_all(dst_root.path().join("lost+found")).unwrap();
        fs::create_dir_all(dst_root.path().join(defs::OVERLAY_STAGING_DIR)).unwrap();

        perform_sync(&modules, dst_root.path(), &partitions()).unwrap();
        assert!(!dst_root.path().join("ghost").exists());
        assert!(dst_root.path().join("lost+found").exists());
        assert!(dst_root.path().join(defs::OVERLAY_STAGING_DIR).exists());
    }

    #[test]
    fn test_empty_module_not_synced() {
        let src_root = tempdir().unwrap();
        let dst_root = tempdir().unwrap();

        let src = src_root.path().join("hollow");
        fs::create_dir_all(src.join("system/app")).unwrap();
        let modules = vec![Module {
            id: "hollow".to_string(),
            source_path: src,
            mode: MountMode::Auto,
        }];

        perform_sync(&modules, dst_root.path(), &partitions()).unwrap();
        assert!(!dst_root.path().join("hollow").exists());
    }

    #[test]
    fn test_should_sync_missing_prop_forces_sync() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        let src_mod = src.path().join("m");
        let dst_mod = dst.path().join("m");
        fs::create_dir_all(&src_mod).unwrap();
        fs::create_dir_all(&dst_mod).unwrap();
        assert!(should_sync(&src_mod, &dst_mod));
        assert!(should_sync(&src_mod, &PathBuf::from("/nonexistent")));
    }
}
