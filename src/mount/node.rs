//! Merge tree for the magic-mount engine
//!
//! Nodes live in an arena and reference each other through `NodeId`
//! handles; children are keyed by basename and merge across modules,
//! never overwrite. On a file/directory type conflict the first arrival
//! wins and a warning is logged.

use crate::defs::{REPLACE_DIR_FILE_NAME, REPLACE_DIR_XATTR};
use crate::error::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFileType {
    RegularFile,
    Directory,
    Symlink,
    /// Character device with rdev 0, marking a deleted entry
    Whiteout,
}

impl NodeFileType {
    pub fn of_metadata(meta: &fs::Metadata) -> NodeFileType {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        let ft = meta.file_type();
        if ft.is_char_device() && meta.rdev() == 0 {
            NodeFileType::Whiteout
        } else if ft.is_dir() {
            NodeFileType::Directory
        } else if ft.is_symlink() {
            NodeFileType::Symlink
        } else {
            NodeFileType::RegularFile
        }
    }

    pub fn of_path(path: &Path) -> NodeFileType {
        match fs::symlink_metadata(path) {
            Ok(meta) => Self::of_metadata(&meta),
            Err(_) => NodeFileType::RegularFile,
        }
    }
}

/// Handle into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub file_type: NodeFileType,
    pub children: BTreeMap<String, NodeId>,
    /// Contributing file for leaves, first contributing directory for dirs
    pub module_path: Option<PathBuf>,
    /// Module that first contributed this node
    pub module_id: Option<String>,
    /// Directory is opaque: hides the underlying contents
    pub replace: bool,
    /// Omit this node from mounting
    pub skip: bool,
}

impl Node {
    pub fn directory(name: &str, module_path: Option<PathBuf>) -> Node {
        Node {
            name: name.to_string(),
            file_type: NodeFileType::Directory,
            children: BTreeMap::new(),
            module_path,
            module_id: None,
            replace: false,
            skip: false,
        }
    }
}

/// A directory is opaque when it carries the overlay xattr or contains the
/// replace sentinel file.
pub fn dir_is_replace(path: &Path) -> bool {
    let mut buf = [0u8; 4];
    if let Ok(n) = rustix::fs::lgetxattr(path, REPLACE_DIR_XATTR, &mut buf) {
        if n > 0 && buf[0] == b'y' {
            return true;
        }
    }
    path.join(REPLACE_DIR_FILE_NAME).exists()
}

#[derive(Debug, Default)]
pub struct NodeTree {
    nodes: Vec<Node>,
}

impl NodeTree {
    pub fn new() -> NodeTree {
        NodeTree::default()
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node(parent).children.get(name).copied()
    }

    pub fn attach_child(&mut self, parent: NodeId, name: &str, child: NodeId) {
        self.node_mut(parent).children.insert(name.to_string(), child);
    }

    pub fn detach_child(&mut self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.node_mut(parent).children.remove(name)
    }

    /// Children of `parent` as owned (name, id) pairs, in name order.
    pub fn children_of(&self, parent: NodeId) -> Vec<(String, NodeId)> {
        self.node(parent)
            .children
            .iter()
            .map(|(name, id)| (name.clone(), *id))
            .collect()
    }

    /// Merge one module directory into the tree under `parent`. Returns
    /// whether anything mountable (a file, symlink, whiteout or opaque
    /// directory) was found.
    pub fn collect_module_files(
        &mut self,
        parent: NodeId,
        module_dir: &Path,
        module_id: &str,
    ) -> Result<bool> {
        let mut has_file = false;

        for entry in fs::read_dir(module_dir)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("unreadable entry in {}: {e}", module_dir.display());
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().to_string();
            let entry_path = entry.path();
            let ft = NodeFileType::of_path(&entry_path);

            let child = match self.child(parent, &name) {
                Some(existing) => {
                    let existing_ft = self.node(existing).file_type;
                    if existing_ft != ft {
                        warn!(
                            "type conflict at {}: {existing_ft:?} from {:?} vs {ft:?} from {module_id}, keeping first",
                            entry_path.display(),
                            self.node(existing).module_id
                        );
                        continue;
                    }
                    existing
                }
                None => {
                    let node = Node {
                        name: name.clone(),
                        file_type: ft,
                        children: BTreeMap::new(),
                        module_path: Some(entry_path.clone()),
                        module_id: Some(module_id.to_string()),
                        replace: false,
                        skip: false,
                    };
                    let id = self.alloc(node);
                    self.attach_child(parent, &name, id);
                    id
                }
            };

            if ft == NodeFileType::Directory {
                let replace = dir_is_replace(&entry_path);
                self.node_mut(child).replace |= replace;
                let child_has_file = self.collect_module_files(child, &entry_path, module_id)?;
                has_file |= child_has_file || replace;
                if replace {
                    debug!("opaque directory: {}", entry_path.display());
                }
            } else {
                has_file = true;
            }
        }

        Ok(has_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tree_with_system() -> (NodeTree, NodeId) {
        let mut tree = NodeTree::new();
        let system = tree.alloc(Node::directory("system", Some(PathBuf::from("/system"))));
        (tree, system)
    }

    #[test]
    fn test_collect_single_module() {
        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("etc")).unwrap();
        fs::write(module.path().join("etc/hosts"), b"x").unwrap();

        let (mut tree, system) = tree_with_system();
        let has_file = tree
            .collect_module_files(system, module.path(), "mod_a")
            .unwrap();
        assert!(has_file);

        let etc = tree.child(system, "etc").unwrap();
        assert_eq!(tree.node(etc).file_type, NodeFileType::Directory);
        let hosts = tree.child(etc, "hosts").unwrap();
        assert_eq!(tree.node(hosts).file_type, NodeFileType::RegularFile);
        assert_eq!(tree.node(hosts).module_id.as_deref(), Some("mod_a"));
    }

    #[test]
    fn test_children_merge_across_modules() {
        let a = tempdir().unwrap();
        fs::create_dir_all(a.path().join("etc")).unwrap();
        fs::write(a.path().join("etc/hosts"), b"a").unwrap();

        let b = tempdir().unwrap();
        fs::create_dir_all(b.path().join("etc")).unwrap();
        fs::write(b.path().join("etc/resolv.conf"), b"b").unwrap();

        let (mut tree, system) = tree_with_system();
        tree.collect_module_files(system, a.path(), "mod_a").unwrap();
        tree.collect_module_files(system, b.path(), "mod_b").unwrap();

        let etc = tree.child(system, "etc").unwrap();
        assert_eq!(tree.node(etc).children.len(), 2);
        // The directory node keeps its first contributor
        assert_eq!(tree.node(etc).module_id.as_deref(), Some("mod_a"));
    }

    #[test]
    fn test_first_arrival_wins_on_type_conflict() {
        let a = tempdir().unwrap();
        fs::write(a.path().join("app"), b"file").unwrap();

        let b = tempdir().unwrap();
        fs::create_dir_all(b.path().join("app")).unwrap();
        fs::write(b.path().join("app/inner"), b"x").unwrap();

        let (mut tree, system) = tree_with_system();
        tree.collect_module_files(system, a.path(), "mod_a").unwrap();
        tree.collect_module_files(system, b.path(), "mod_b").unwrap();

        let app = tree.child(system, "app").unwrap();
        assert_eq!(tree.node(app).file_type, NodeFileType::RegularFile);
        assert!(tree.node(app).children.is_empty());
    }

    #[test]
    fn test_first_arrival_wins_on_symlink_file_conflict() {
        // Conflicts between two non-directory types take the same
        // warn-and-keep-first path as file/directory clashes.
        let a = tempdir().unwrap();
        fs::write(a.path().join("tool"), b"elf").unwrap();

        let b = tempdir().unwrap();
        std::os::unix::fs::symlink("other", b.path().join("tool")).unwrap();

        let (mut tree, system) = tree_with_system();
        tree.collect_module_files(system, a.path(), "mod_a").unwrap();
        tree.collect_module_files(system, b.path(), "mod_b").unwrap();

        let tool = tree.child(system, "tool").unwrap();
        assert_eq!(tree.node(tool).file_type, NodeFileType::RegularFile);
        assert_eq!(tree.node(tool).module_id.as_deref(), Some("mod_a"));
        assert_eq!(
            tree.node(tool).module_path.as_deref(),
            Some(a.path().join("tool").as_path())
        );
    }

    #[test]
    fn test_whiteout_first_arrival() {
        // Files shadowing an earlier non-directory node keep the first
        // arrival: a whiteout collected before a regular file stays a
        // whiteout. Whiteout creation needs privileges, so model the
        // first arrival directly.
        let b = tempdir().unwrap();
        fs::write(b.path().join("hosts"), b"contents").unwrap();

        let (mut tree, system) = tree_with_system();
        let wh = tree.alloc(Node {
            name: "hosts".into(),
            file_type: NodeFileType::Whiteout,
            children: BTreeMap::new(),
            module_path: Some(PathBuf::from("/modules/b/system/hosts")),
            module_id: Some("mod_b".into()),
            replace: false,
            skip: false,
        });
        tree.attach_child(system, "hosts", wh);

        tree.collect_module_files(system, b.path(), "mod_a").unwrap();
        let hosts = tree.child(system, "hosts").unwrap();
        assert_eq!(tree.node(hosts).file_type, NodeFileType::Whiteout);
        assert_eq!(tree.node(hosts).module_id.as_deref(), Some("mod_b"));
    }

    #[test]
    fn test_replace_marker_via_sentinel_file() {
        let module = tempdir().unwrap();
        fs::create_dir_all(module.path().join("app/Gallery")).unwrap();
        fs::write(module.path().join("app/Gallery/.replace"), b"").unwrap();

        let (mut tree, system) = tree_with_system();
        let has_file = tree
            .collect_module_files(system, module.path(), "mod_a")
            .unwrap();
        // An opaque directory counts as mountable content by itself
        assert!(has_file);

        let app = tree.child(system, "app").unwrap();
        let gallery = tree.child(app, "Gallery").unwrap();
        assert!(tree.node(gallery).replace);
    }

    #[test]
    fn test_replace_inherited_by_or() {
        let a = tempdir().unwrap();
        fs::create_dir_all(a.path().join("app/Gallery")).unwrap();
        fs::write(a.path().join("app/Gallery/.replace"), b"").unwrap();

        let b = tempdir().unwrap();
        fs::create_dir_all(b.path().join("app/Gallery")).unwrap();
        fs::write(b.path().join("app/Gallery/extra"), b"x").unwrap();

        let (mut tree, system) = tree_with_system();
        tree.collect_module_files(system, a.path(), "mod_a").unwrap();
        tree.collect_module_files(system, b.path(), "mod_b").unwrap();

        let app = tree.child(system, "app").unwrap();
        let gallery = tree.child(app, "Gallery").unwrap();
        assert!(tree.node(gallery).replace);
        assert!(tree.child(gallery, "extra").is_some());
    }

    #[test]
    fn test_children_are_name_ordered() {
        let module = tempdir().unwrap();
        fs::write(module.path().join("zz"), b"").unwrap();
        fs::write(module.path().join("aa"), b"").unwrap();
        fs::write(module.path().join("mm"), b"").unwrap();

        let (mut tree, system) = tree_with_system();
        tree.collect_module_files(system, module.path(), "mod_a")
            .unwrap();
        let names: Vec<String> = tree
            .children_of(system)
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["aa", "mm", "zz"]);
    }
}
