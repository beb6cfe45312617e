//! Path and name constants shared across the daemon

/// Base directory for config, images, logs and runtime records
pub const BASE_DIR: &str = "/data/adb/hymo";

/// Runtime directory (hot-unmount markers live here)
pub const RUN_DIR: &str = "/data/adb/hymo/run";

/// Daemon log file
pub const DAEMON_LOG_FILE: &str = "/data/adb/hymo/daemon.log";

/// Default config file
pub const CONFIG_FILE: &str = "/data/adb/hymo/config.json";

/// Runtime state record
pub const STATE_FILE: &str = "/data/adb/hymo/daemon_state.json";

/// Magic-mount statistics record
pub const MOUNT_STATS_FILE: &str = "/data/adb/hymo/mount_stats.json";

/// User-defined hide rules (JSON array of absolute paths)
pub const USER_HIDE_RULES_FILE: &str = "/data/adb/hymo/user_hide_rules.json";

/// Per-module mount mode overrides
pub const MODULE_MODES_FILE: &str = "/data/adb/hymo/module_modes.json";

/// Per-module path rules
pub const MODULE_RULES_FILE: &str = "/data/adb/hymo/module_rules.json";

/// Module source directory
pub const MODULE_DIR: &str = "/data/adb/modules";

/// The daemon's own module id (skipped when scanning)
pub const SELF_MODULE_ID: &str = "hymo";

/// The daemon module's prop file (description line is rewritten after runs)
pub const MODULE_PROP_FILE: &str = "/data/adb/modules/hymo/module.prop";

/// Fallback mirror/content directory when no mirror path is configured
pub const FALLBACK_CONTENT_DIR: &str = "/data/adb/hymo/mnt";

/// Default kernel mirror directory
pub const MIRROR_DEV_DIR: &str = "/dev/hymo_mirror";

/// Ext4 backing image
pub const IMAGE_NAME: &str = "modules.img";

/// Compressed read-only backing image
pub const EROFS_IMAGE_NAME: &str = "modules.erofs";

/// Staging subtree for segregated overlay/magic sources inside the mirror
pub const OVERLAY_STAGING_DIR: &str = ".overlay_staging";

/// Source name reported for our overlay / tmpfs mounts
pub const OVERLAY_SOURCE: &str = "KSU";

// Module sentinel files
pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";

/// Sentinel file marking a directory as opaque (hides the lower contents)
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";

/// Xattr marking a directory as opaque
pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";

/// SELinux context applied to the storage root after ext4 setup
pub const DEFAULT_SELINUX_CONTEXT: &str = "u:object_r:system_file:s0";

/// Built-in partitions. `system` is the root; the rest are attached to it
/// when present on the live system.
pub const BUILTIN_PARTITIONS: &[&str] = &["system", "vendor", "product", "system_ext", "odm"];

/// Partitions whose symlink-into-root illusion must be restored after an
/// overlay covers them.
pub const SYMLINK_PARTITIONS: &[&str] = &["vendor", "product", "system_ext", "odm", "oem"];

/// Module top-level directories that are never partition candidates.
pub const NON_PARTITION_DIRS: &[&str] = &[
    "META-INF", "common", "webroot", "zygisk", "lkm", "uninstall", "bin", "lib",
];
