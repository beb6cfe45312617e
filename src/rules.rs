//! User-defined hide rules
//!
//! A JSON array of absolute paths the user wants hidden through the kernel
//! rule engine. Rules are persisted here and applied on every mapping
//! update; removal from the kernel is only exact across a full reload.

use crate::defs;
use crate::error::{Error, Result};
use crate::hymofs::HymoDriver;
use std::path::Path;
use tracing::{info, warn};

pub fn load_user_hide_rules() -> Vec<String> {
    load_from(Path::new(defs::USER_HIDE_RULES_FILE))
}

pub fn load_from(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("failed to parse user hide rules: {e}");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

pub fn save_user_hide_rules(rules: &[String]) -> Result<()> {
    save_to(rules, Path::new(defs::USER_HIDE_RULES_FILE))
}

pub fn save_to(rules: &[String], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(rules)?)?;
    Ok(())
}

/// Add a hide rule; applies to the kernel immediately when available.
pub fn add_user_hide_rule(driver: &HymoDriver, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidConfig(format!(
            "hide path must be absolute: {path}"
        )));
    }

    let mut rules = load_user_hide_rules();
    if rules.iter().any(|r| r == path) {
        info!("hide rule already exists: {path}");
        return Ok(());
    }
    rules.push(path.to_string());
    save_user_hide_rules(&rules)?;

    if driver.is_available() {
        if let Err(e) = driver.hide_path(path) {
            warn!("hide rule saved but kernel apply failed: {e}");
        }
    }
    info!("added user hide rule: {path}");
    Ok(())
}

/// Remove a hide rule from the list. The kernel-side rule persists until
/// the next reload (the kernel does not distinguish rule origins).
pub fn remove_user_hide_rule(path: &str) -> Result<()> {
    let mut rules = load_user_hide_rules();
    let before = rules.len();
    rules.retain(|r| r != path);
    if rules.len() == before {
        return Err(Error::PathNotFound(format!("hide rule not found: {path}")));
    }
    save_user_hide_rules(&rules)?;
    info!("removed user hide rule: {path}");
    Ok(())
}

/// Push all saved hide rules into the kernel.
pub fn apply_user_hide_rules(driver: &HymoDriver) {
    let rules = load_user_hide_rules();
    if rules.is_empty() {
        return;
    }

    let mut applied = 0usize;
    for rule in &rules {
        match driver.hide_path(rule) {
            Ok(()) => applied += 1,
            Err(e) => warn!("failed to apply hide rule {rule}: {e}"),
        }
    }
    info!("applied {applied}/{} user hide rules", rules.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("user_hide_rules.json");

        let rules = vec!["/system/xbin/su".to_string(), "/sbin/magisk".to_string()];
        save_to(&rules, &path).unwrap();
        assert_eq!(load_from(&path), rules);
    }

    #[test]
    fn test_missing_file_is_empty() {
        assert!(load_from(Path::new("/nonexistent/rules.json")).is_empty());
    }
}
