//! Orchestrator
//!
//! One boot-time pass: status check, storage setup, scan, sync, plan,
//! execute, record state. Owns the fallback across the three mechanisms:
//! kernel rules when available, else overlays, else magic mount.

use crate::config::Config;
use crate::defs;
use crate::error::{Error, Result};
use crate::hymofs::{DriverStatus, HymoDriver};
use crate::mount::{magic, overlay};
use crate::planner::{self, MountPlan};
use crate::rules;
use crate::scanner::{self, Module};
use crate::state::RuntimeState;
use crate::stats::MountStats;
use crate::storage::{self, FilesystemType, StorageHandle};
use crate::sync;
use crate::utils;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

const KERNEL_TOO_OLD_MSG: &str =
    "Kernel version is lower than module version. Please update your kernel.";
const MODULE_TOO_OLD_MSG: &str =
    "Module version is lower than kernel version. Please update your module.";

#[derive(Debug, Default)]
pub struct ExecutionResult {
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
}

fn mismatch_message(status: DriverStatus) -> Option<&'static str> {
    match status {
        DriverStatus::KernelTooOld => Some(KERNEL_TOO_OLD_MSG),
        DriverStatus::ModuleTooOld => Some(MODULE_TOO_OLD_MSG),
        _ => None,
    }
}

/// Drop modules without content for any target partition.
fn filter_content_modules(modules: Vec<Module>, partitions: &[String]) -> Vec<Module> {
    modules
        .into_iter()
        .filter(|m| {
            let keep = m.has_content(partitions);
            if !keep {
                debug!("dropping empty module {}", m.id);
            }
            keep
        })
        .collect()
}

/// Drop modules carrying a hot-unmount marker.
fn filter_hot_unmounted(modules: Vec<Module>) -> Vec<Module> {
    let marker_dir = Path::new(defs::RUN_DIR).join("hot_unmounted");
    modules
        .into_iter()
        .filter(|m| {
            let marked = marker_dir.join(&m.id).exists();
            if marked {
                info!("skipping hot-unmounted module {}", m.id);
            }
            !marked
        })
        .collect()
}

/// Storage setup with the original fallback shape: an explicit policy
/// that fails hard is retried once under auto.
fn setup_storage_with_fallback(
    mnt_dir: &Path,
    image_path: &Path,
    fs_type: FilesystemType,
) -> Result<StorageHandle> {
    match storage::setup_storage(mnt_dir, image_path, fs_type) {
        Ok(handle) => Ok(handle),
        Err(e) if fs_type != FilesystemType::Auto => {
            warn!("explicit {fs_type} storage failed ({e}), retrying with auto");
            storage::setup_storage(mnt_dir, image_path, FilesystemType::Auto)
        }
        Err(e) => Err(e),
    }
}

/// Execute the overlay and magic portions of a plan.
pub fn execute_plan(plan: &MountPlan, config: &Config, stats: &mut MountStats) -> ExecutionResult {
    let mut result = ExecutionResult::default();

    for op in &plan.overlay_ops {
        let lowerdirs: Vec<String> = op
            .lowerdirs
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        info!(
            "mounting {} [overlay] ({} layers)",
            op.target,
            lowerdirs.len()
        );
        match overlay::mount_overlay(&op.target, &lowerdirs, None, None, config.disable_umount) {
            Ok(()) => stats.overlayfs_mounts += 1,
            Err(e) => error!("overlay mount failed for {}: {e}, skipping target", op.target),
        }
    }
    // Release the reference into the last overlay target.
    let _ = std::env::set_current_dir("/");

    if !plan.magic_module_paths.is_empty() {
        let tempdir = match &config.tempdir {
            Some(t) => t.clone(),
            None => match utils::select_temp_dir() {
                Ok(t) => t,
                Err(e) => {
                    error!("magic mount skipped, no temp dir: {e}");
                    return result;
                }
            },
        };

        info!(
            "starting magic mount engine ({} module roots)",
            plan.magic_module_paths.len()
        );
        if let Err(e) = utils::ensure_temp_dir(&tempdir) {
            error!("magic mount skipped: {e}");
            return result;
        }

        if let Err(e) = magic::mount_partitions(
            &tempdir,
            &plan.magic_module_paths,
            &config.mountsource,
            &config.partitions,
            stats,
            config.disable_umount,
        ) {
            error!("magic mount failed: {e}");
        }
        utils::cleanup_temp_dir(&tempdir);
    }

    result.overlay_module_ids = plan.overlay_module_ids.clone();
    result.magic_module_ids = plan.magic_module_ids.clone();
    result
}

/// Reinstall the kernel mappings for a plan: clear everything, walk each
/// fast-path module's mirrored partitions, add path-rule directories and
/// re-apply user hide rules.
pub fn update_hymofs_mappings(
    driver: &HymoDriver,
    config: &Config,
    plan: &MountPlan,
    mirror: &Path,
) {
    if let Err(e) = driver.clear_rules() {
        warn!("failed to clear kernel rules: {e}");
    }

    for id in &plan.hymofs_module_ids {
        for part in config.all_partitions() {
            let dir = mirror.join(id).join(&part);
            if !dir.is_dir() {
                continue;
            }
            let target_base = Path::new("/").join(&part);
            match driver.add_rules_from_directory(&target_base, &dir) {
                Ok(true) => debug!("installed rules for {id}/{part}"),
                Ok(false) => debug!("no rules produced for {id}/{part}"),
                Err(e) => warn!("rule install for {id}/{part} failed: {e}"),
            }
        }
    }

    for (target_base, dir) in &plan.hymofs_rule_dirs {
        match driver.add_rules_from_directory(target_base, dir) {
            Ok(_) => debug!("installed path-rule dir {}", dir.display()),
            Err(e) => warn!(
                "path-rule install for {} failed: {e}",
                target_base.display()
            ),
        }
    }

    rules::apply_user_hide_rules(driver);
}

/// Partitions for which any of the listed modules carries content.
fn partitions_with_content(
    modules: &[Module],
    ids: &[String],
    partitions: &[String],
) -> Vec<String> {
    partitions
        .iter()
        .filter(|part| {
            ids.iter().any(|id| {
                modules
                    .iter()
                    .any(|m| &m.id == id && m.source_path.join(part).exists())
            })
        })
        .cloned()
        .collect()
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Render the daemon module's description line.
fn build_description(
    success: bool,
    storage_mode: &str,
    nuke_active: bool,
    overlay_count: usize,
    magic_count: usize,
    hymofs_count: usize,
    warning: &str,
) -> String {
    if !success {
        return "description=Mount failed, check daemon.log".to_string();
    }
    let mut desc = format!(
        "description=Active ({storage_mode}) | overlay: {overlay_count} | magic: {magic_count} | hymofs: {hymofs_count}"
    );
    if nuke_active {
        desc.push_str(" | pad: on");
    }
    if !warning.is_empty() {
        desc.push_str(" | ");
        desc.push_str(warning);
    }
    desc
}

/// Rewrite the description line of the daemon module's prop file.
pub fn update_module_description(
    success: bool,
    storage_mode: &str,
    nuke_active: bool,
    overlay_count: usize,
    magic_count: usize,
    hymofs_count: usize,
    warning: &str,
) {
    let path = Path::new(defs::MODULE_PROP_FILE);
    if !path.exists() {
        debug!("module.prop not found, skipping description update");
        return;
    }

    let desc = build_description(
        success,
        storage_mode,
        nuke_active,
        overlay_count,
        magic_count,
        hymofs_count,
        warning,
    );

    match fs::read_to_string(path) {
        Ok(content) => {
            let updated: Vec<String> = content
                .lines()
                .map(|line| {
                    if line.starts_with("description=") {
                        desc.clone()
                    } else {
                        line.to_string()
                    }
                })
                .collect();
            if let Err(e) = fs::write(path, updated.join("\n")) {
                error!("failed to update module.prop: {e}");
            }
        }
        Err(e) => error!("failed to read module.prop: {e}"),
    }
}

/// The boot-time mount pass.
pub fn run_mount(config: &Config, driver: &HymoDriver) -> Result<()> {
    info!("daemon starting");
    utils::ensure_dir_exists(Path::new(defs::RUN_DIR))?;

    if config.disable_umount {
        warn!("namespace detach registration is disabled");
    }

    let status = driver.status();
    let mut warning = String::new();
    let mut can_use_fast_path = status == DriverStatus::Available;

    if !can_use_fast_path && config.ignore_protocol_mismatch {
        if let Some(msg) = mismatch_message(status) {
            warn!("forcing fast path despite protocol mismatch");
            can_use_fast_path = true;
            warning = msg.to_string();
        } else {
            warn!("cannot force fast path, kernel side not present");
        }
    }

    let partitions = config.all_partitions();
    let image_path = Path::new(defs::BASE_DIR).join(defs::IMAGE_NAME);
    let path_rules = crate::config::load_module_rules();
    let mut stats = MountStats::default();

    let storage_handle;
    let plan;
    let exec_result;
    let module_list;

    if can_use_fast_path {
        info!("mode: fast path");

        let mirror = config.effective_mirror_path();
        if mirror != Path::new(defs::MIRROR_DEV_DIR) {
            match driver.set_mirror_path(&mirror) {
                Ok(()) => info!("applied custom mirror path {}", mirror.display()),
                Err(e) => warn!("failed to apply mirror path: {e}"),
            }
        }

        if config.enable_kernel_debug {
            if let Err(e) = driver.set_debug(true) {
                warn!("failed to enable kernel debug logging: {e}");
            }
        }
        if let Err(e) = driver.set_stealth(config.enable_stealth) {
            warn!("failed to set stealth mode: {e}");
        }
        if let Err(e) = driver.set_enabled(config.hymofs_enabled) {
            warn!("failed to set rule engine state: {e}");
        }
        if !config.uname_release.is_empty() || !config.uname_version.is_empty() {
            if let Err(e) = driver.set_uname(&config.uname_release, &config.uname_version) {
                warn!("failed to apply uname spoofing: {e}");
            }
        }
        if !config.fake_cmdline.is_empty() {
            if let Err(e) = driver.set_cmdline(&config.fake_cmdline) {
                warn!("failed to apply cmdline spoofing: {e}");
            }
        }

        // Mirror strategy: copy active modules onto dedicated backing so
        // the kernel resolves rules against stable, normalized sources.
        let mirror_outcome = (|| -> Result<(StorageHandle, Vec<Module>, MountPlan)> {
            let mut handle = setup_storage_with_fallback(&mirror, &image_path, config.fs_type)?;
            info!("mirror storage ready: {}", handle.mode);

            let scanned = scanner::scan_modules(&config.moduledir)?;
            let active = filter_content_modules(scanned, &partitions);
            info!("syncing {} active modules to mirror", active.len());

            let mut sync_ok = true;
            for module in &active {
                let dst = mirror.join(&module.id);
                if let Err(e) = utils::sync_dir(&module.source_path, &dst) {
                    error!("failed to sync module {}: {e}", module.id);
                    sync_ok = false;
                }
            }
            if !sync_ok {
                let _ = rustix::mount::unmount(&mirror, rustix::mount::UnmountFlags::DETACH);
                return Err(Error::Storage("mirror sync failed".into()));
            }

            if handle.mode == "ext4" {
                storage::finalize_storage_permissions(&handle.mount_point);
            }
            handle.mount_point = mirror.clone();

            let mut plan = planner::generate(config, &active, &mirror, true, &path_rules)?;
            planner::segregate_custom_rules(&mut plan, &mirror);
            Ok((handle, active, plan))
        })();

        match mirror_outcome {
            Ok((handle, active, ready_plan)) => {
                update_hymofs_mappings(driver, config, &ready_plan, &mirror);
                exec_result = execute_plan(&ready_plan, config, &mut stats);

                if config.enable_stealth {
                    match driver.fix_mounts() {
                        Ok(()) => info!("mount namespace fixed (mnt_id reordered)"),
                        Err(e) => warn!("failed to fix mount namespace: {e}"),
                    }
                }

                storage_handle = handle;
                module_list = active;
                plan = ready_plan;
            }
            Err(e) => {
                warn!("mirror setup failed ({e}), falling back to magic mount");

                let scanned = scanner::scan_modules(&config.moduledir)?;
                let active = filter_content_modules(scanned, &partitions);

                let mut fallback_plan = MountPlan::default();
                for module in &active {
                    fallback_plan
                        .magic_module_paths
                        .push(module.source_path.clone());
                    fallback_plan.magic_module_ids.push(module.id.clone());
                }

                exec_result = execute_plan(&fallback_plan, config, &mut stats);
                storage_handle = StorageHandle {
                    mount_point: config.moduledir.clone(),
                    mode: "magic_only".to_string(),
                };
                module_list = active;
                plan = fallback_plan;
            }
        }
    } else {
        if let Some(msg) = mismatch_message(status) {
            warn!("fast path protocol mismatch: {msg}");
            warning = msg.to_string();
        }
        info!("mode: overlay/magic");

        let mnt_base = PathBuf::from(defs::FALLBACK_CONTENT_DIR);
        storage_handle = setup_storage_with_fallback(&mnt_base, &image_path, config.fs_type)?;

        let scanned = scanner::scan_modules(&config.moduledir)?;
        info!("scanned {} enabled modules", scanned.len());
        module_list = filter_content_modules(scanned, &partitions);

        sync::perform_sync(&module_list, &storage_handle.mount_point, &partitions)?;
        if storage_handle.mode == "ext4" {
            storage::finalize_storage_permissions(&storage_handle.mount_point);
        }

        info!("generating mount plan");
        plan = planner::generate(
            config,
            &module_list,
            &storage_handle.mount_point,
            false,
            &path_rules,
        )?;
        exec_result = execute_plan(&plan, config, &mut stats);
    }

    info!(
        "plan: {} overlay, {} magic, {} fast-path modules",
        exec_result.overlay_module_ids.len(),
        exec_result.magic_module_ids.len(),
        plan.hymofs_module_ids.len()
    );

    let mut nuke_active = false;
    if storage_handle.mode == "ext4" && config.enable_nuke {
        info!("deploying ext4 trace suppression");
        nuke_active = utils::deploy_nuke(&storage_handle.mount_point);
        if !nuke_active {
            warn!("ext4 trace suppression unavailable");
        }
    }

    let mut state = RuntimeState {
        storage_mode: storage_handle.mode.clone(),
        mount_point: storage_handle.mount_point.clone(),
        overlay_module_ids: exec_result.overlay_module_ids.clone(),
        magic_module_ids: exec_result.magic_module_ids.clone(),
        hymofs_module_ids: plan.hymofs_module_ids.clone(),
        nuke_active,
        pid: std::process::id() as i32,
        ..Default::default()
    };

    for part in partitions_with_content(&module_list, &plan.hymofs_module_ids, &partitions) {
        push_unique(&mut state.active_mounts, part);
    }
    for op in &plan.overlay_ops {
        if let Some(name) = Path::new(&op.target).file_name() {
            push_unique(&mut state.active_mounts, name.to_string_lossy().to_string());
        }
    }
    for part in partitions_with_content(&module_list, &plan.magic_module_ids, &partitions) {
        push_unique(&mut state.active_mounts, part);
    }

    if mismatch_message(status).is_some() || !warning.is_empty() {
        state.mismatch = true;
        state.mismatch_message = warning.clone();
        if state.mismatch_message.is_empty() {
            if let Some(msg) = mismatch_message(status) {
                state.mismatch_message = msg.to_string();
            }
        }
    }

    if let Err(e) = state.save() {
        error!("failed to save runtime state: {e}");
    }
    if let Err(e) = stats.save() {
        warn!("failed to save mount statistics: {e}");
    }

    update_module_description(
        true,
        &storage_handle.mode,
        nuke_active,
        exec_result.overlay_module_ids.len(),
        exec_result.magic_module_ids.len(),
        plan.hymofs_module_ids.len(),
        &warning,
    );

    info!("mount pass completed");
    Ok(())
}

/// Live reload of the kernel mappings: re-scan, re-sync, reinstall.
pub fn run_reload(config: &Config, driver: &HymoDriver) -> Result<()> {
    driver.reload_status();
    if !driver.is_available() {
        warn!("rule engine not available, cannot hot reload");
        return Ok(());
    }

    info!("reloading kernel mappings");
    let mirror = config.effective_mirror_path();
    let partitions = config.all_partitions();
    let path_rules = crate::config::load_module_rules();

    let scanned = scanner::scan_modules(&config.moduledir)?;
    let active = filter_content_modules(filter_hot_unmounted(scanned), &partitions);

    info!("syncing {} modules to mirror", active.len());
    for module in &active {
        let dst = mirror.join(&module.id);
        if let Err(e) = utils::sync_dir(&module.source_path, &dst) {
            error!("failed to sync module {}: {e}", module.id);
        }
    }

    let mut plan = planner::generate(config, &active, &mirror, true, &path_rules)?;
    planner::segregate_custom_rules(&mut plan, &mirror);
    update_hymofs_mappings(driver, config, &plan, &mirror);

    if let Err(e) = driver.set_stealth(config.enable_stealth) {
        warn!("failed to set stealth mode: {e}");
    }
    if let Err(e) = driver.set_enabled(config.hymofs_enabled) {
        warn!("failed to set rule engine state: {e}");
    }
    if config.enable_stealth {
        match driver.fix_mounts() {
            Ok(()) => info!("mount namespace fixed after reload"),
            Err(e) => warn!("failed to fix mount namespace after reload: {e}"),
        }
    }

    let mut state = RuntimeState::load();
    state.mount_point = mirror.clone();
    state.hymofs_module_ids = plan.hymofs_module_ids.clone();
    state.active_mounts =
        partitions_with_content(&active, &plan.hymofs_module_ids, &partitions);
    state.save()?;

    info!("reload complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountMode;
    use tempfile::tempdir;

    #[test]
    fn test_mismatch_messages() {
        assert!(mismatch_message(DriverStatus::KernelTooOld)
            .unwrap()
            .contains("lower than module version"));
        assert!(mismatch_message(DriverStatus::ModuleTooOld)
            .unwrap()
            .contains("lower than kernel version"));
        assert!(mismatch_message(DriverStatus::Available).is_none());
        assert!(mismatch_message(DriverStatus::NotPresent).is_none());
    }

    #[test]
    fn test_build_description() {
        let desc = build_description(true, "tmpfs", false, 2, 1, 3, "");
        assert_eq!(
            desc,
            "description=Active (tmpfs) | overlay: 2 | magic: 1 | hymofs: 3"
        );

        let desc = build_description(true, "ext4", true, 0, 0, 5, KERNEL_TOO_OLD_MSG);
        assert!(desc.contains("pad: on"));
        assert!(desc.contains("lower than module version"));

        let desc = build_description(false, "error", false, 0, 0, 0, "");
        assert_eq!(desc, "description=Mount failed, check daemon.log");
    }

    #[test]
    fn test_partitions_with_content() {
        let root = tempdir().unwrap();
        let src = root.path().join("alpha");
        std::fs::create_dir_all(src.join("vendor")).unwrap();

        let modules = vec![Module {
            id: "alpha".to_string(),
            source_path: src,
            mode: MountMode::Auto,
        }];
        let partitions = vec!["system".to_string(), "vendor".to_string()];

        let active = partitions_with_content(&modules, &["alpha".to_string()], &partitions);
        assert_eq!(active, vec!["vendor".to_string()]);

        let none = partitions_with_content(&modules, &["other".to_string()], &partitions);
        assert!(none.is_empty());
    }

    #[test]
    fn test_filter_content_modules() {
        let root = tempdir().unwrap();
        let full = root.path().join("full");
        std::fs::create_dir_all(full.join("system")).unwrap();
        std::fs::write(full.join("system/f"), b"x").unwrap();
        let empty = root.path().join("empty");
        std::fs::create_dir_all(empty.join("system")).unwrap();

        let modules = vec![
            Module {
                id: "full".into(),
                source_path: full,
                mode: MountMode::Auto,
            },
            Module {
                id: "empty".into(),
                source_path: empty,
                mode: MountMode::Auto,
            },
        ];
        let kept = filter_content_modules(modules, &["system".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "full");
    }

    #[test]
    fn test_push_unique() {
        let mut list = vec!["system".to_string()];
        push_unique(&mut list, "system".to_string());
        push_unique(&mut list, "vendor".to_string());
        assert_eq!(list, vec!["system".to_string(), "vendor".to_string()]);
    }
}
