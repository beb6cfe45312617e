//! Mount planner
//!
//! Decides per module (and per path-rule) which mechanism projects its
//! content: kernel rules, stacked overlays or magic mount. The planner is
//! side-effect free; custom-rule segregation materializes the filesystem
//! moves afterwards.

use crate::config::{Config, ModuleRule, MountMode};
use crate::defs;
use crate::error::{Error, Result};
use crate::mount::utils::is_safe_symlink;
use crate::scanner::Module;
use crate::utils::has_files_recursive;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One overlay mount: stacked module layers over a target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayOp {
    /// Absolute target, e.g. `/system`
    pub target: String,
    /// Layers ordered top (highest priority) to bottom
    pub lowerdirs: Vec<PathBuf>,
}

/// A per-path override waiting to be materialized by segregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRule {
    pub module_id: String,
    /// Path relative to the module content root, e.g. `system/etc/hosts`
    pub rel_path: PathBuf,
    pub mode: MountMode,
}

#[derive(Debug, Default)]
pub struct MountPlan {
    pub overlay_ops: Vec<OverlayOp>,
    pub magic_module_paths: Vec<PathBuf>,
    pub hymofs_module_ids: Vec<String>,
    /// (target base, source dir) pairs for path-rule kernel installs
    pub hymofs_rule_dirs: Vec<(PathBuf, PathBuf)>,
    /// Unmaterialized per-path overrides
    pub rule_ops: Vec<PlannedRule>,

    // For state reporting
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
}

impl MountPlan {
    pub fn is_empty(&self) -> bool {
        self.overlay_ops.is_empty()
            && self.magic_module_paths.is_empty()
            && self.hymofs_module_ids.is_empty()
            && self.hymofs_rule_dirs.is_empty()
    }

    /// A module feeds at most one mechanism; path rules are segregated
    /// out of the module source before execution, so list membership is
    /// the whole invariant.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        let lists = [
            ("hymofs", &self.hymofs_module_ids),
            ("overlay", &self.overlay_module_ids),
            ("magic", &self.magic_module_ids),
        ];
        for (mechanism, ids) in lists {
            for id in ids {
                if let Some(previous) = seen.insert(id, mechanism) {
                    return Err(Error::Internal(format!(
                        "module {id} planned for both {previous} and {mechanism}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// True when the content tree contains a symlink whose target would
/// escape the live root once materialized. Such modules go through magic
/// mount, whose engine rejects the offending leaves; safe symlinks leave
/// the module eligible for overlay.
fn contains_unsafe_symlink(content_path: &Path, partitions: &[String]) -> bool {
    fn walk(dir: &Path, virtual_dir: &Path) -> bool {
        let Ok(entries) = fs::read_dir(dir) else {
            return false;
        };
        for entry in entries.flatten() {
            let virtual_path = virtual_dir.join(entry.file_name());
            match entry.file_type() {
                Ok(ft) if ft.is_symlink() => {
                    if !is_safe_symlink(&entry.path(), &virtual_path) {
                        return true;
                    }
                }
                Ok(ft) if ft.is_dir() => {
                    if walk(&entry.path(), &virtual_path) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    partitions
        .iter()
        .any(|p| walk(&content_path.join(p), &Path::new("/").join(p)))
}

fn has_meaningful_content(content_path: &Path, partitions: &[String]) -> bool {
    partitions
        .iter()
        .any(|p| has_files_recursive(&content_path.join(p)))
}

/// Resolve the effective mechanism for one module.
fn effective_mode(
    module: &Module,
    config: &Config,
    content_path: &Path,
    partitions: &[String],
    fast_path_available: bool,
) -> MountMode {
    let declared = if module.mode != MountMode::Auto {
        module.mode
    } else {
        config.default_mode
    };

    match declared {
        MountMode::Auto => {
            if fast_path_available {
                MountMode::Hymofs
            } else if contains_unsafe_symlink(content_path, partitions) {
                MountMode::Magic
            } else {
                MountMode::Overlay
            }
        }
        MountMode::Hymofs if !fast_path_available => {
            // Explicit fast-path selection degrades like auto when the
            // kernel side is missing.
            if contains_unsafe_symlink(content_path, partitions) {
                MountMode::Magic
            } else {
                MountMode::Overlay
            }
        }
        other => other,
    }
}

/// Generate the mount plan. `storage_root` is where module content was
/// synced (the mirror or the fallback storage); the planner never touches
/// the filesystem beyond reading it.
pub fn generate(
    config: &Config,
    modules: &[Module],
    storage_root: &Path,
    fast_path_available: bool,
    path_rules: &HashMap<String, Vec<ModuleRule>>,
) -> Result<MountPlan> {
    let mut plan = MountPlan::default();
    let partitions = config.all_partitions();

    // Per-partition layer stacks; BTreeMap keeps target order stable.
    let mut partition_layers: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

    let mut modules: Vec<&Module> = modules.iter().collect();
    modules.sort_by(|a, b| a.id.cmp(&b.id));

    for module in modules {
        let content_path = storage_root.join(&module.id);
        if !content_path.exists() {
            debug!("module {} content missing, skipping", module.id);
            continue;
        }
        if !has_meaningful_content(&content_path, &partitions) {
            debug!("module {} has no content for any partition", module.id);
            continue;
        }

        let mode = effective_mode(module, config, &content_path, &partitions, fast_path_available);

        match mode {
            MountMode::Hymofs => plan.hymofs_module_ids.push(module.id.clone()),
            MountMode::Overlay => {
                let mut participates = false;
                for part in &partitions {
                    let part_path = content_path.join(part);
                    if part_path.is_dir() && has_files_recursive(&part_path) {
                        partition_layers
                            .entry(part.clone())
                            .or_default()
                            .push(part_path);
                        participates = true;
                    }
                }
                if participates {
                    plan.overlay_module_ids.push(module.id.clone());
                }
            }
            MountMode::Magic => {
                plan.magic_module_paths.push(content_path.clone());
                plan.magic_module_ids.push(module.id.clone());
            }
            MountMode::None => debug!("module {} disabled by mode", module.id),
            MountMode::Auto => unreachable!("auto resolves above"),
        }

        if let Some(rules) = path_rules.get(&module.id) {
            for rule in rules {
                if rule.mode == mode || rule.mode == MountMode::Auto {
                    continue;
                }
                plan.rule_ops.push(PlannedRule {
                    module_id: module.id.clone(),
                    rel_path: PathBuf::from(rule.path.trim_start_matches('/')),
                    mode: rule.mode,
                });
            }
        }
    }

    for (part, layers) in partition_layers {
        // Modules were visited in ascending id order; overlayfs gives the
        // first lowerdir priority, so reverse to let later ids win.
        let lowerdirs = layers.into_iter().rev().collect();
        plan.overlay_ops.push(OverlayOp {
            target: format!("/{part}"),
            lowerdirs,
        });
    }

    plan.hymofs_module_ids.sort();
    plan.overlay_module_ids.sort();
    plan.magic_module_ids.sort();
    plan.validate()?;
    Ok(plan)
}

fn segregate_path(source: &Path, mirror_dir: &Path, staging: &Path) -> Option<PathBuf> {
    if !source.starts_with(mirror_dir) || source.starts_with(staging) {
        return None;
    }
    let rel = source.strip_prefix(mirror_dir).ok()?;
    let target = staging.join(rel);
    if !source.exists() {
        return None;
    }
    if let Some(parent) = target.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!("cannot create staging dir {}: {e}", parent.display());
            return None;
        }
    }
    if let Err(e) = fs::rename(source, &target) {
        warn!(
            "failed to segregate {} -> {}: {e}",
            source.display(),
            target.display()
        );
        return None;
    }
    debug!("segregated {} -> {}", source.display(), target.display());
    Some(target)
}

/// Move plan sources that live inside the mirror into the private staging
/// subtree and rewrite the plan, then materialize the per-path rule ops.
/// Keeps kernel rules from colliding with overlay/magic sources when all
/// three share the backing store.
pub fn segregate_custom_rules(plan: &mut MountPlan, mirror_dir: &Path) {
    let staging = mirror_dir.join(defs::OVERLAY_STAGING_DIR);

    for op in &mut plan.overlay_ops {
        for layer in &mut op.lowerdirs {
            if let Some(staged) = segregate_path(layer, mirror_dir, &staging) {
                *layer = staged;
            }
        }
    }

    for path in &mut plan.magic_module_paths {
        if let Some(staged) = segregate_path(path, mirror_dir, &staging) {
            *path = staged;
        }
    }

    let mut staged_magic_roots: HashSet<PathBuf> = HashSet::new();
    for rule in std::mem::take(&mut plan.rule_ops) {
        let source = mirror_dir.join(&rule.module_id).join(&rule.rel_path);
        if !source.exists() {
            debug!(
                "path rule source missing for {}: {}",
                rule.module_id,
                source.display()
            );
            continue;
        }

        let staged_root = staging.join("rules").join(&rule.module_id);
        let staged = staged_root.join(&rule.rel_path);
        if let Some(parent) = staged.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!("cannot create staging dir {}: {e}", parent.display());
                continue;
            }
        }
        if let Err(e) = fs::rename(&source, &staged) {
            warn!("failed to stage path rule source {}: {e}", source.display());
            continue;
        }

        let target = Path::new("/").join(&rule.rel_path);
        match rule.mode {
            MountMode::Overlay => {
                if staged.is_dir() {
                    plan.overlay_ops.push(OverlayOp {
                        target: target.display().to_string(),
                        lowerdirs: vec![staged],
                    });
                } else {
                    warn!(
                        "overlay path rule on non-directory {} ignored",
                        target.display()
                    );
                }
            }
            MountMode::Magic => {
                if staged_magic_roots.insert(staged_root.clone()) {
                    plan.magic_module_paths.push(staged_root);
                }
            }
            MountMode::Hymofs => plan.hymofs_rule_dirs.push((target, staged)),
            MountMode::None => debug!("path rule none: {} stays unmounted", target.display()),
            MountMode::Auto => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn module(id: &str) -> Module {
        Module {
            id: id.to_string(),
            source_path: PathBuf::from("/data/adb/modules").join(id),
            mode: MountMode::Auto,
        }
    }

    fn with_content(root: &Path, id: &str, rel: &str) {
        let path = root.join(id).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_empty_module_set_gives_empty_plan() {
        let storage = tempdir().unwrap();
        let config = Config::default();
        let plan = generate(&config, &[], storage.path(), true, &HashMap::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_module_without_content_is_dropped() {
        let storage = tempdir().unwrap();
        fs::create_dir_all(storage.path().join("empty/system/app")).unwrap();
        let config = Config::default();
        let plan = generate(
            &config,
            &[module("empty")],
            storage.path(),
            true,
            &HashMap::new(),
        )
        .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_auto_prefers_fast_path() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/etc/hosts");
        let config = Config::default();

        let plan = generate(
            &config,
            &[module("alpha")],
            storage.path(),
            true,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(plan.hymofs_module_ids, vec!["alpha"]);
        assert!(plan.overlay_ops.is_empty());
        assert!(plan.magic_module_paths.is_empty());
    }

    #[test]
    fn test_auto_falls_back_to_overlay() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/etc/hosts");
        let config = Config::default();

        let plan = generate(
            &config,
            &[module("alpha")],
            storage.path(),
            false,
            &HashMap::new(),
        )
        .unwrap();
        assert!(plan.hymofs_module_ids.is_empty());
        assert_eq!(plan.overlay_module_ids, vec!["alpha"]);
        assert_eq!(plan.overlay_ops.len(), 1);
        assert_eq!(plan.overlay_ops[0].target, "/system");
    }

    #[test]
    fn test_auto_with_safe_symlink_stays_overlay() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/bin/tool");
        std::os::unix::fs::symlink("tool", storage.path().join("alpha/system/bin/tool2"))
            .unwrap();
        let config = Config::default();

        let plan = generate(
            &config,
            &[module("alpha")],
            storage.path(),
            false,
            &HashMap::new(),
        )
        .unwrap();
        assert!(plan.magic_module_ids.is_empty());
        assert_eq!(plan.overlay_module_ids, vec!["alpha"]);
    }

    #[test]
    fn test_auto_with_escaping_symlink_goes_magic() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/bin/tool");
        // Materialized at /system/bin/evil, four `..` pop above the root.
        std::os::unix::fs::symlink(
            "../../../../escape",
            storage.path().join("alpha/system/bin/evil"),
        )
        .unwrap();
        let config = Config::default();

        let plan = generate(
            &config,
            &[module("alpha")],
            storage.path(),
            false,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(plan.magic_module_ids, vec!["alpha"]);
        assert_eq!(plan.magic_module_paths, vec![storage.path().join("alpha")]);
    }

    #[test]
    fn test_explicit_magic_mode() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/etc/hosts");
        let config = Config::default();

        let mut m = module("alpha");
        m.mode = MountMode::Magic;
        let plan = generate(&config, &[m], storage.path(), true, &HashMap::new()).unwrap();
        assert!(plan.hymofs_module_ids.is_empty());
        assert_eq!(plan.magic_module_ids, vec!["alpha"]);
    }

    #[test]
    fn test_none_mode_skips() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/etc/hosts");
        let config = Config::default();

        let mut m = module("alpha");
        m.mode = MountMode::None;
        let plan = generate(&config, &[m], storage.path(), true, &HashMap::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_overlay_layer_precedence() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "aaa", "system/etc/hosts");
        with_content(storage.path(), "zzz", "system/etc/hosts");
        let config = Config::default();

        let plan = generate(
            &config,
            &[module("zzz"), module("aaa")],
            storage.path(),
            false,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(plan.overlay_ops.len(), 1);
        // Later-alphabetical module stacks on top
        assert_eq!(
            plan.overlay_ops[0].lowerdirs,
            vec![
                storage.path().join("zzz/system"),
                storage.path().join("aaa/system"),
            ]
        );
    }

    #[test]
    fn test_modules_grouped_per_partition() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/etc/hosts");
        with_content(storage.path(), "alpha", "vendor/lib/libfoo.so");
        let config = Config::default();

        let plan = generate(
            &config,
            &[module("alpha")],
            storage.path(),
            false,
            &HashMap::new(),
        )
        .unwrap();
        let mut targets: Vec<&str> = plan.overlay_ops.iter().map(|o| o.target.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["/system", "/vendor"]);
        assert_eq!(plan.overlay_module_ids, vec!["alpha"]);
    }

    #[test]
    fn test_path_rules_emitted() {
        let storage = tempdir().unwrap();
        with_content(storage.path(), "alpha", "system/etc/hosts");
        with_content(storage.path(), "alpha", "system/app/Widget/widget.apk");
        let config = Config::default();

        let mut rules = HashMap::new();
        rules.insert(
            "alpha".to_string(),
            vec![ModuleRule {
                path: "/system/app/Widget".to_string(),
                mode: MountMode::Magic,
            }],
        );

        let plan = generate(&config, &[module("alpha")], storage.path(), true, &rules).unwrap();
        assert_eq!(plan.hymofs_module_ids, vec!["alpha"]);
        assert_eq!(
            plan.rule_ops,
            vec![PlannedRule {
                module_id: "alpha".to_string(),
                rel_path: PathBuf::from("system/app/Widget"),
                mode: MountMode::Magic,
            }]
        );
    }

    #[test]
    fn test_validate_rejects_double_membership() {
        let mut plan = MountPlan::default();
        plan.hymofs_module_ids.push("alpha".to_string());
        plan.magic_module_ids.push("alpha".to_string());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_segregation_moves_mirror_sources() {
        let mirror = tempdir().unwrap();
        with_content(mirror.path(), "alpha", "system/etc/hosts");

        let mut plan = MountPlan::default();
        plan.overlay_ops.push(OverlayOp {
            target: "/system".to_string(),
            lowerdirs: vec![mirror.path().join("alpha/system")],
        });
        plan.overlay_module_ids.push("alpha".to_string());

        segregate_custom_rules(&mut plan, mirror.path());

        let staged = mirror
            .path()
            .join(defs::OVERLAY_STAGING_DIR)
            .join("alpha/system");
        assert_eq!(plan.overlay_ops[0].lowerdirs, vec![staged.clone()]);
        assert!(staged.join("etc/hosts").exists());
        assert!(!mirror.path().join("alpha/system").exists());
    }

    #[test]
    fn test_segregation_materializes_path_rules() {
        let mirror = tempdir().unwrap();
        with_content(mirror.path(), "alpha", "system/app/Widget/widget.apk");

        let mut plan = MountPlan::default();
        plan.hymofs_module_ids.push("alpha".to_string());
        plan.rule_ops.push(PlannedRule {
            module_id: "alpha".to_string(),
            rel_path: PathBuf::from("system/app/Widget"),
            mode: MountMode::Magic,
        });

        segregate_custom_rules(&mut plan, mirror.path());

        let staged_root = mirror
            .path()
            .join(defs::OVERLAY_STAGING_DIR)
            .join("rules/alpha");
        assert_eq!(plan.magic_module_paths, vec![staged_root.clone()]);
        assert!(staged_root.join("system/app/Widget/widget.apk").exists());
        // The subtree left the module's mirror copy
        assert!(!mirror.path().join("alpha/system/app/Widget").exists());
        assert!(plan.rule_ops.is_empty());
    }

    #[test]
    fn test_segregation_ignores_outside_sources() {
        let mirror = tempdir().unwrap();
        let elsewhere = tempdir().unwrap();
        fs::create_dir_all(elsewhere.path().join("alpha/system")).unwrap();

        let mut plan = MountPlan::default();
        let outside = elsewhere.path().join("alpha/system");
        plan.overlay_ops.push(OverlayOp {
            target: "/system".to_string(),
            lowerdirs: vec![outside.clone()],
        });

        segregate_custom_rules(&mut plan, mirror.path());
        assert_eq!(plan.overlay_ops[0].lowerdirs, vec![outside]);
    }
}
