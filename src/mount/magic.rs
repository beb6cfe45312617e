//! Magic-mount engine
//!
//! Builds the merged node tree across modules, then lays a per-file
//! bind-mount projection over the live root. Directories that need
//! structural changes (new entries, symlinks, whiteouts, type changes)
//! get a shadowing tmpfs that is populated, sealed read-only and moved
//! over the live path.

use crate::defs;
use crate::error::{Error, Result};
use crate::mount::node::{Node, NodeFileType, NodeId, NodeTree};
use crate::mount::utils::{
    bind_mount, clone_symlink, is_safe_symlink, mount_mirror, remount_ro_bind,
};
use crate::stats::MountStats;
use crate::utils::{clone_attr, ensure_dir_exists, mount_tmpfs, send_unmountable};
use rustix::mount::{MountPropagationFlags, UnmountFlags};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Non-system partitions that can appear as top-level directories. The
/// flag says whether `/system/<name>` must be a symlink for the partition
/// to be split off the system tree.
const ATTACH_PARTITIONS: &[(&str, bool)] = &[
    ("vendor", true),
    ("system_ext", true),
    ("product", true),
    ("odm", false),
];

/// Merge all module `system` trees and attach sibling partitions to the
/// synthetic root. Returns `None` when no module contributes anything.
fn collect_all_modules(
    tree: &mut NodeTree,
    module_paths: &[PathBuf],
    extra_partitions: &[String],
) -> Result<Option<NodeId>> {
    let root = tree.alloc(Node::directory("", None));
    let system = tree.alloc(Node::directory("system", Some(PathBuf::from("/system"))));

    let mut has_file = false;
    info!("collecting files from {} module(s)", module_paths.len());

    for module_path in module_paths {
        let module_id = module_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if module_path.join(defs::DISABLE_FILE_NAME).exists()
            || module_path.join(defs::REMOVE_FILE_NAME).exists()
            || module_path.join(defs::SKIP_MOUNT_FILE_NAME).exists()
        {
            debug!("skipping module {module_id} (disabled/removed/skip_mount)");
            continue;
        }

        let module_system = module_path.join("system");
        if !module_system.is_dir() {
            debug!("module {module_id} has no system directory");
            continue;
        }

        match tree.collect_module_files(system, &module_system, &module_id) {
            Ok(found) => {
                has_file |= found;
                if found {
                    debug!("module {module_id} has files to mount");
                }
            }
            Err(e) => warn!("failed to collect module {module_id}: {e}"),
        }
    }

    if !has_file {
        return Ok(None);
    }

    for (partition, require_symlink) in ATTACH_PARTITIONS {
        let path_of_root = Path::new("/").join(partition);
        let path_of_system = Path::new("/system").join(partition);
        if path_of_root.is_dir() && (!require_symlink || path_of_system.is_symlink()) {
            promote_partition(tree, root, system, partition, &path_of_root);
        }
    }

    for partition in extra_partitions {
        if partition == "system" || ATTACH_PARTITIONS.iter().any(|(p, _)| p == partition) {
            continue;
        }
        let path_of_root = Path::new("/").join(partition);
        if path_of_root.is_dir() {
            debug!("attaching extra partition {partition} to root");
            promote_partition(tree, root, system, partition, &path_of_root);
        }
    }

    tree.attach_child(root, "system", system);
    Ok(Some(root))
}

/// Move a partition node from under `system` to the root, turning a
/// module-provided symlink into a directory when the live partition is a
/// real directory.
fn promote_partition(
    tree: &mut NodeTree,
    root: NodeId,
    system: NodeId,
    partition: &str,
    path_of_root: &Path,
) {
    let Some(child) = tree.detach_child(system, partition) else {
        return;
    };
    let node = tree.node_mut(child);
    if node.file_type == NodeFileType::Symlink {
        let module_is_dir = node
            .module_path
            .as_ref()
            .map(|p| p.is_dir())
            .unwrap_or(false);
        if module_is_dir {
            node.file_type = NodeFileType::Directory;
        }
    }
    if node.module_path.is_none() {
        node.module_path = Some(path_of_root.to_path_buf());
    }
    tree.attach_child(root, partition, child);
}

struct MagicMount<'a> {
    stats: &'a mut MountStats,
    disable_umount: bool,
}

impl MagicMount<'_> {
    fn mount_node(
        &mut self,
        tree: &NodeTree,
        id: NodeId,
        parent_path: &Path,
        parent_work: &Path,
        has_tmpfs: bool,
    ) -> Result<()> {
        let node = tree.node(id);
        let target = parent_path.join(&node.name);
        let work = parent_work.join(&node.name);

        match node.file_type {
            NodeFileType::RegularFile => self.mount_file(node, &target, &work, has_tmpfs),
            NodeFileType::Symlink => {
                if has_tmpfs {
                    self.mount_symlink(node, &target, &work)
                } else {
                    // An in-place symlink change on the live tree is never
                    // allowed; the tmpfs decision must have shadowed the
                    // parent already.
                    Err(Error::Mount(format!(
                        "symlink {} outside a tmpfs shadow",
                        target.display()
                    )))
                }
            }
            NodeFileType::Directory => self.mount_directory(tree, id, &target, &work, has_tmpfs),
            NodeFileType::Whiteout => {
                self.stats.total_mounts += 1;
                self.stats.successful_mounts += 1;
                debug!("{} removed via whiteout", target.display());
                Ok(())
            }
        }
    }

    fn mount_file(
        &mut self,
        node: &Node,
        target: &Path,
        work: &Path,
        has_tmpfs: bool,
    ) -> Result<()> {
        self.stats.total_mounts += 1;
        self.stats.files_mounted += 1;

        let Some(module_path) = &node.module_path else {
            return Ok(());
        };

        let bind_target = if has_tmpfs {
            fs::File::create(work)?;
            work
        } else {
            target
        };

        bind_mount(module_path, bind_target, self.disable_umount)?;
        remount_ro_bind(bind_target);
        debug!(
            "mounted file {} -> {}",
            module_path.display(),
            bind_target.display()
        );
        self.stats.successful_mounts += 1;
        Ok(())
    }

    fn mount_symlink(&mut self, node: &Node, target: &Path, work: &Path) -> Result<()> {
        self.stats.total_mounts += 1;

        let Some(module_path) = &node.module_path else {
            return Ok(());
        };

        if !is_safe_symlink(module_path, target) {
            return Err(Error::Mount(format!(
                "symlink {} escapes the live root",
                module_path.display()
            )));
        }

        clone_symlink(module_path, work)?;
        self.stats.symlinks_created += 1;
        self.stats.successful_mounts += 1;
        Ok(())
    }

    fn mount_directory(
        &mut self,
        tree: &NodeTree,
        id: NodeId,
        target: &Path,
        work: &Path,
        has_tmpfs: bool,
    ) -> Result<()> {
        self.stats.dirs_mounted += 1;

        let node = tree.node(id);
        let create_tmpfs = !has_tmpfs && should_create_tmpfs(tree, id, target);
        let effective_tmpfs = has_tmpfs || create_tmpfs;

        if create_tmpfs {
            self.prepare_tmpfs_dir(node, target, work)?;
        } else if has_tmpfs && fs::symlink_metadata(work).is_err() {
            fs::create_dir(work)?;
            let attr_src = if target.exists() {
                Some(target.to_path_buf())
            } else {
                node.module_path.clone()
            };
            if let Some(src) = attr_src {
                if let Err(e) = clone_attr(&src, work) {
                    debug!("attr clone for {} failed: {e}", work.display());
                }
            }
        }

        self.mount_children(tree, id, target, work, effective_tmpfs)?;

        if create_tmpfs {
            self.finalize_tmpfs(target, work)?;
        }
        Ok(())
    }

    /// Walk the live directory, recursing into merged children and
    /// mirroring untouched entries into the shadow; then handle children
    /// the live tree does not have.
    fn mount_children(
        &mut self,
        tree: &NodeTree,
        id: NodeId,
        target: &Path,
        work: &Path,
        has_tmpfs: bool,
    ) -> Result<()> {
        let node = tree.node(id);
        let mut handled: HashSet<String> = HashSet::new();

        if target.is_dir() && !node.replace {
            for entry in fs::read_dir(target)? {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("unreadable entry in {}: {e}", target.display());
                        continue;
                    }
                };
                let name = entry.file_name().to_string_lossy().to_string();

                if let Some(child) = tree.child(id, &name) {
                    handled.insert(name);
                    if tree.node(child).skip {
                        continue;
                    }
                    if let Err(e) = self.mount_node(tree, child, target, work, has_tmpfs) {
                        warn!("mount failed under {}: {e}", target.display());
                        self.stats.failed_mounts += 1;
                    }
                } else if has_tmpfs {
                    if let Err(e) = mount_mirror(target, work, &entry.file_name()) {
                        warn!(
                            "failed to mirror {}/{name}: {e}",
                            target.display()
                        );
                        self.stats.failed_mounts += 1;
                    }
                }
            }
        }

        for (name, child) in tree.children_of(id) {
            if handled.contains(&name) || tree.node(child).skip {
                continue;
            }
            if let Err(e) = self.mount_node(tree, child, target, work, has_tmpfs) {
                warn!("mount failed for new entry {}/{name}: {e}", target.display());
                self.stats.failed_mounts += 1;
            }
        }

        Ok(())
    }

    fn prepare_tmpfs_dir(&mut self, node: &Node, target: &Path, work: &Path) -> Result<()> {
        fs::create_dir_all(work)?;

        let attr_src = if target.exists() {
            target.to_path_buf()
        } else {
            node.module_path.clone().ok_or_else(|| {
                Error::Mount(format!("no attribute source for {}", target.display()))
            })?
        };
        if let Err(e) = clone_attr(&attr_src, work) {
            debug!("attr clone for {} failed: {e}", work.display());
        }

        rustix::mount::mount_recursive_bind(work, work)?;
        Ok(())
    }

    /// Seal the shadow read-only, move it over the live path and make the
    /// mount private.
    fn finalize_tmpfs(&mut self, target: &Path, work: &Path) -> Result<()> {
        remount_ro_bind(work);
        rustix::mount::mount_move(work, target).map_err(|e| {
            Error::Mount(format!(
                "failed to move shadow onto {}: {e}",
                target.display()
            ))
        })?;
        let _ = rustix::mount::mount_change(target, MountPropagationFlags::PRIVATE);

        if !self.disable_umount {
            let _ = send_unmountable(target);
        }
        debug!("shadow committed onto {}", target.display());
        Ok(())
    }
}

/// Whether this directory needs a shadowing tmpfs: yes when it is opaque,
/// or when any child is a symlink, a whiteout over an existing entry, a
/// new entry, or differs in file type from the live counterpart.
fn should_create_tmpfs(tree: &NodeTree, id: NodeId, target: &Path) -> bool {
    let node = tree.node(id);

    if node.replace {
        return target.exists() || node.module_path.is_some();
    }

    for (name, child) in &node.children {
        let child = tree.node(*child);
        let real_path = target.join(name);

        let need = match child.file_type {
            NodeFileType::Symlink => true,
            NodeFileType::Whiteout => fs::symlink_metadata(&real_path).is_ok(),
            _ => match fs::symlink_metadata(&real_path) {
                Ok(meta) => {
                    let real_ft = NodeFileType::of_metadata(&meta);
                    real_ft != child.file_type || real_ft == NodeFileType::Symlink
                }
                Err(_) => true,
            },
        };

        if need {
            if node.module_path.is_none() && !target.exists() {
                warn!(
                    "cannot shadow {} (no attribute source)",
                    target.display()
                );
                return false;
            }
            return true;
        }
    }

    false
}

/// Entry point: merge the module trees and project them over the live
/// root through a private tmpfs workdir under `tmp_path`.
pub fn mount_partitions(
    tmp_path: &Path,
    module_paths: &[PathBuf],
    mount_source: &str,
    extra_partitions: &[String],
    stats: &mut MountStats,
    disable_umount: bool,
) -> Result<()> {
    let mut tree = NodeTree::new();
    let Some(root) = collect_all_modules(&mut tree, module_paths, extra_partitions)? else {
        info!("no files to magic mount");
        return Ok(());
    };

    let work_dir = tmp_path.join("workdir");
    ensure_dir_exists(&work_dir)?;
    mount_tmpfs(&work_dir, mount_source)?;
    let _ = rustix::mount::mount_change(&work_dir, MountPropagationFlags::PRIVATE);
    stats.tmpfs_created += 1;

    let mut engine = MagicMount {
        stats,
        disable_umount,
    };
    let result = engine.mount_node(&tree, root, Path::new("/"), &work_dir, false);

    if let Err(e) = rustix::mount::unmount(&work_dir, UnmountFlags::DETACH) {
        warn!("failed to detach workdir {}: {e}", work_dir.display());
    }
    let _ = fs::remove_dir(&work_dir);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Build a tree for a module that contributes the given entries under
    /// its system directory, returning the id of the `system` node.
    fn collect(module_root: &Path) -> (NodeTree, NodeId) {
        let mut tree = NodeTree::new();
        let system = tree.alloc(Node::directory("system", Some(PathBuf::from("/system"))));
        tree.collect_module_files(system, module_root, "test_mod")
            .unwrap();
        (tree, system)
    }

    #[test]
    fn test_tmpfs_not_needed_for_matching_file() {
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("etc")).unwrap();
        fs::write(live.path().join("etc/hosts"), b"original").unwrap();

        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("etc")).unwrap();
        fs::write(module.path().join("etc/hosts"), b"patched").unwrap();

        let (tree, system) = collect(module.path());
        let etc = tree.child(system, "etc").unwrap();
        assert!(!should_create_tmpfs(
            &tree,
            etc,
            &live.path().join("etc")
        ));
    }

    #[test]
    fn test_tmpfs_needed_for_new_entry() {
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("etc")).unwrap();

        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("etc")).unwrap();
        fs::write(module.path().join("etc/new.conf"), b"x").unwrap();

        let (tree, system) = collect(module.path());
        let etc = tree.child(system, "etc").unwrap();
        assert!(should_create_tmpfs(&tree, etc, &live.path().join("etc")));
    }

    #[test]
    fn test_tmpfs_needed_for_symlink_child() {
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("bin")).unwrap();
        fs::write(live.path().join("bin/tool"), b"elf").unwrap();

        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("bin")).unwrap();
        std::os::unix::fs::symlink("tool", module.path().join("bin/tool2")).unwrap();

        let (tree, system) = collect(module.path());
        let bin = tree.child(system, "bin").unwrap();
        assert!(should_create_tmpfs(&tree, bin, &live.path().join("bin")));
    }

    #[test]
    fn test_tmpfs_needed_for_type_change() {
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("etc/wifi")).unwrap();

        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("etc")).unwrap();
        // Live has a directory, module ships a file of the same name
        fs::write(module.path().join("etc/wifi"), b"flat").unwrap();

        let (tree, system) = collect(module.path());
        let etc = tree.child(system, "etc").unwrap();
        assert!(should_create_tmpfs(&tree, etc, &live.path().join("etc")));
    }

    #[test]
    fn test_tmpfs_needed_for_replace_dir() {
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("app/Gallery")).unwrap();

        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("app/Gallery")).unwrap();
        fs::write(module.path().join("app/Gallery/.replace"), b"").unwrap();

        let (tree, system) = collect(module.path());
        let app = tree.child(system, "app").unwrap();
        let gallery = tree.child(app, "Gallery").unwrap();
        assert!(should_create_tmpfs(
            &tree,
            gallery,
            &live.path().join("app/Gallery")
        ));
    }

    #[test]
    fn test_whiteout_over_missing_entry_needs_no_tmpfs() {
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("etc")).unwrap();

        let mut tree = NodeTree::new();
        let etc = tree.alloc(Node::directory("etc", Some(PathBuf::from("/etc"))));
        let wh = tree.alloc(Node {
            name: "gone".into(),
            file_type: NodeFileType::Whiteout,
            children: Default::default(),
            module_path: Some(PathBuf::from("/modules/a/system/etc/gone")),
            module_id: Some("a".into()),
            replace: false,
            skip: false,
        });
        tree.attach_child(etc, "gone", wh);

        assert!(!should_create_tmpfs(&tree, etc, &live.path().join("etc")));
    }

    #[test]
    fn test_whiteout_over_existing_entry_needs_tmpfs() {
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("etc")).unwrap();
        fs::write(live.path().join("etc/hosts"), b"x").unwrap();

        let mut tree = NodeTree::new();
        let etc = tree.alloc(Node::directory("etc", Some(PathBuf::from("/etc"))));
        let wh = tree.alloc(Node {
            name: "hosts".into(),
            file_type: NodeFileType::Whiteout,
            children: Default::default(),
            module_path: Some(PathBuf::from("/modules/a/system/etc/hosts")),
            module_id: Some("a".into()),
            replace: false,
            skip: false,
        });
        tree.attach_child(etc, "hosts", wh);

        assert!(should_create_tmpfs(&tree, etc, &live.path().join("etc")));
    }

    #[test]
    fn test_skip_nodes_still_counted_for_decision() {
        // The tmpfs decision looks at all children, mounting later skips
        // the flagged ones.
        let live = tempdir().unwrap();
        fs::create_dir_all(live.path().join("etc")).unwrap();

        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("etc")).unwrap();
        fs::write(module.path().join("etc/new.conf"), b"x").unwrap();

        let (mut tree, system) = collect(module.path());
        let etc = tree.child(system, "etc").unwrap();
        let new_conf = tree.child(etc, "new.conf").unwrap();
        tree.node_mut(new_conf).skip = true;
        assert!(should_create_tmpfs(&tree, etc, &live.path().join("etc")));
    }
}
