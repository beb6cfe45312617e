//! hymod - layered module filesystem daemon
//!
//! Usage:
//!   hymod mount            - project all modules over the live root
//!   hymod reload           - reinstall kernel mappings
//!   hymod modules          - list active modules
//!   hymod storage          - show storage status
//!   hymod list             - list active kernel rules

use clap::{Parser, Subcommand};
use hymod::config::{self, Config, ModuleRule, MountMode};
use hymod::hymofs::{parse_rules, HymoDriver};
use hymod::state::RuntimeState;
use hymod::{daemon, defs, logger, rules, scanner, storage, utils, Error, Result};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hymod")]
#[command(version = "0.1.0")]
#[command(about = "Layered module filesystem daemon")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module directory
    #[arg(short, long)]
    moduledir: Option<PathBuf>,

    /// Temporary directory
    #[arg(short, long)]
    tempdir: Option<PathBuf>,

    /// Mount source name
    #[arg(short = 's', long)]
    mountsource: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Add a partition (repeatable)
    #[arg(short, long = "partition")]
    partitions: Vec<String>,

    /// Output file (for gen-config)
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount all modules
    Mount,
    /// Reload kernel mappings
    Reload,
    /// Clear all kernel rules
    Clear,
    /// Show storage status
    Storage,
    /// List active modules
    Modules,
    /// List active kernel rules
    List,
    /// Show protocol and kernel version
    Version,
    /// Generate a default config file
    GenConfig,
    /// Show the current configuration
    ShowConfig,
    /// Manage user hide rules
    Hide {
        #[command(subcommand)]
        action: HideAction,
    },
    /// Toggle kernel debug logging
    Debug { state: String },
    /// Toggle stealth mode
    Stealth { state: String },
    /// Toggle the kernel rule engine
    Hymofs { state: String },
    /// Configure kernel version spoofing
    SetUname { release: String, version: String },
    /// Configure a custom mirror path
    SetMirror { path: PathBuf },
    /// Issue a raw kernel command
    Raw {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Install rules for one module
    Add { module_id: String },
    /// Remove rules for one module
    Delete { module_id: String },
    /// Set the mount mode for a module
    SetMode { module_id: String, mode: String },
    /// Add a per-path mount rule for a module
    AddRule {
        module_id: String,
        path: String,
        mode: String,
    },
    /// Remove a per-path mount rule for a module
    RemoveRule { module_id: String, path: String },
    /// Reorder mount ids in the namespace
    FixMounts,
    /// Scan modules and add new partitions to the config
    SyncPartitions,
    /// Create the ext4 backing image
    CreateImage { dir: Option<PathBuf> },
    /// Hot mount a module
    HotMount { module_id: String },
    /// Hot unmount a module
    HotUnmount { module_id: String },
}

#[derive(Subcommand)]
enum HideAction {
    /// List user hide rules
    List,
    /// Add a hide rule
    Add { path: String },
    /// Remove a hide rule
    Remove { path: String },
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error loading config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::load_default(),
    };
    config.merge_with_cli(
        cli.moduledir.clone(),
        cli.tempdir.clone(),
        cli.mountsource.clone(),
        cli.verbose,
        &cli.partitions,
    );

    if let Err(e) = logger::init(config.verbose, Path::new(defs::DAEMON_LOG_FILE)) {
        eprintln!("Warning: logger init failed: {e}");
    }

    let driver = HymoDriver::new();
    if let Err(e) = run_command(&cli, &config, &driver) {
        eprintln!("Error: {e}");
        error!("fatal: {e}");
        if matches!(cli.command, Commands::Mount) {
            daemon::update_module_description(false, "error", false, 0, 0, 0, "");
        }
        std::process::exit(1);
    }
}

fn run_command(cli: &Cli, config: &Config, driver: &HymoDriver) -> Result<()> {
    match &cli.command {
        Commands::Mount => {
            if let Err(e) = utils::camouflage_process("kworker/u9:1") {
                warn!("failed to camouflage process: {e}");
            }
            daemon::run_mount(config, driver)
        }
        Commands::Reload => daemon::run_reload(config, driver),
        Commands::Clear => cmd_clear(driver),
        Commands::Storage => {
            let state = RuntimeState::load();
            println!("{}", serde_json::to_string_pretty(&storage::storage_status(&state))?);
            Ok(())
        }
        Commands::Modules => cmd_modules(config),
        Commands::List => cmd_list(driver),
        Commands::Version => cmd_version(driver),
        Commands::GenConfig => {
            let output = cli
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(defs::CONFIG_FILE));
            Config::default().save(&output)?;
            println!("Generated config: {}", output.display());
            Ok(())
        }
        Commands::ShowConfig => cmd_show_config(config, driver),
        Commands::Hide { action } => match action {
            HideAction::List => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rules::load_user_hide_rules())?
                );
                Ok(())
            }
            HideAction::Add { path } => rules::add_user_hide_rule(driver, path),
            HideAction::Remove { path } => rules::remove_user_hide_rule(path),
        },
        Commands::Debug { state } => {
            require_driver(driver)?;
            driver.set_debug(parse_switch(state)?)?;
            println!("Kernel debug logging updated.");
            Ok(())
        }
        Commands::Stealth { state } => {
            require_driver(driver)?;
            driver.set_stealth(parse_switch(state)?)?;
            println!("Stealth mode updated.");
            Ok(())
        }
        Commands::Hymofs { state } => {
            require_driver(driver)?;
            driver.set_enabled(parse_switch(state)?)?;
            println!("Rule engine state updated.");
            Ok(())
        }
        Commands::SetUname { release, version } => {
            cmd_set_uname(cli, config, driver, release, version)
        }
        Commands::SetMirror { path } => cmd_set_mirror(cli, config, driver, path),
        Commands::Raw { args } => cmd_raw(driver, args),
        Commands::Add { module_id } => cmd_add_module(config, driver, module_id),
        Commands::Delete { module_id } => cmd_delete_module(config, driver, module_id),
        Commands::SetMode { module_id, mode } => {
            let mode: MountMode = mode.parse()?;
            let mut modes = config::load_module_modes();
            modes.insert(module_id.clone(), mode);
            config::save_module_modes(&modes)?;
            println!("Set mode for {module_id} to {mode}");
            Ok(())
        }
        Commands::AddRule {
            module_id,
            path,
            mode,
        } => {
            let mode: MountMode = mode.parse()?;
            let mut all = config::load_module_rules();
            let entries = all.entry(module_id.clone()).or_default();
            if let Some(existing) = entries.iter_mut().find(|r| &r.path == path) {
                existing.mode = mode;
            } else {
                entries.push(ModuleRule {
                    path: path.clone(),
                    mode,
                });
            }
            config::save_module_rules(&all)?;
            println!("Added rule for {module_id}: {path} -> {mode}");
            Ok(())
        }
        Commands::RemoveRule { module_id, path } => {
            let mut all = config::load_module_rules();
            let mut removed = false;
            if let Some(entries) = all.get_mut(module_id) {
                let before = entries.len();
                entries.retain(|r| &r.path != path);
                removed = entries.len() != before;
            }
            if removed {
                config::save_module_rules(&all)?;
                println!("Removed rule for {module_id}: {path}");
            } else {
                println!("Rule not found.");
            }
            Ok(())
        }
        Commands::FixMounts => {
            require_driver(driver)?;
            driver.fix_mounts()?;
            println!("Mount namespace fixed (mnt_id reordered).");
            Ok(())
        }
        Commands::SyncPartitions => cmd_sync_partitions(cli, config),
        Commands::CreateImage { dir } => {
            let target = dir.clone().unwrap_or_else(|| PathBuf::from(defs::BASE_DIR));
            storage::create_image(&target)?;
            println!(
                "Successfully created image at {}/{}",
                target.display(),
                defs::IMAGE_NAME
            );
            Ok(())
        }
        Commands::HotMount { module_id } => cmd_hot_mount(config, driver, module_id),
        Commands::HotUnmount { module_id } => cmd_hot_unmount(config, driver, module_id),
    }
}

fn require_driver(driver: &HymoDriver) -> Result<()> {
    if driver.is_available() {
        Ok(())
    } else {
        Err(Error::Driver("rule engine not available".into()))
    }
}

fn parse_switch(state: &str) -> Result<bool> {
    match state {
        "on" | "1" | "true" => Ok(true),
        "off" | "0" | "false" => Ok(false),
        other => Err(Error::InvalidConfig(format!(
            "expected on/off, got {other:?}"
        ))),
    }
}

fn cmd_clear(driver: &HymoDriver) -> Result<()> {
    require_driver(driver)?;
    driver.clear_rules()?;
    println!("Successfully cleared all kernel rules.");
    info!("user cleared all kernel rules via CLI");

    let mut state = RuntimeState::load();
    state.hymofs_module_ids.clear();
    state.save()?;
    Ok(())
}

fn cmd_modules(config: &Config) -> Result<()> {
    let modes = config::load_module_modes();
    let state = RuntimeState::load();
    let mnt_base = if state.mount_point.as_os_str().is_empty() {
        PathBuf::from(defs::FALLBACK_CONTENT_DIR)
    } else {
        state.mount_point
    };

    let partitions = config.all_partitions();
    let mut entries = Vec::new();
    for module in scanner::scan_modules_with_modes(&config.moduledir, &modes)? {
        let has_content = partitions.iter().any(|p| {
            module.source_path.join(p).exists() || mnt_base.join(&module.id).join(p).exists()
        });
        if !has_content {
            continue;
        }

        let prop = module.source_path.join("module.prop");
        entries.push(serde_json::json!({
            "id": module.id,
            "name": scanner::read_prop(&prop, "name").unwrap_or_else(|| module.id.clone()),
            "version": scanner::read_prop(&prop, "version").unwrap_or_default(),
            "author": scanner::read_prop(&prop, "author").unwrap_or_default(),
            "description": scanner::read_prop(&prop, "description").unwrap_or_default(),
            "mode": module.mode.to_string(),
        }));
    }
    entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    println!("{}", serde_json::to_string(&entries)?);
    Ok(())
}

fn cmd_list(driver: &HymoDriver) -> Result<()> {
    let mut out = Vec::new();
    if driver.is_available() {
        for rule in parse_rules(&driver.list_rules()?) {
            out.push(rule.to_json());
        }
    }
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn cmd_version(driver: &HymoDriver) -> Result<()> {
    use hymod::hymofs::proto::HYMO_PROTOCOL_VERSION;

    let available = driver.is_available();
    let mut root = serde_json::json!({
        "protocol_version": HYMO_PROTOCOL_VERSION,
        "hymofs_available": available,
        "kernel_version": 0,
        "protocol_mismatch": false,
        "active_modules": [],
    });

    if available {
        let kernel_version = driver.protocol_version().unwrap_or(-1);
        root["kernel_version"] = serde_json::json!(kernel_version);
        root["protocol_mismatch"] = serde_json::json!(kernel_version != HYMO_PROTOCOL_VERSION);
        root["features"] = serde_json::json!(driver.features().unwrap_or(0));

        let state = RuntimeState::load();
        let mirror = if state.mount_point.as_os_str().is_empty() {
            PathBuf::from(defs::MIRROR_DEV_DIR)
        } else {
            state.mount_point.clone()
        };

        // Extract module ids from rule source paths under the module dir
        // or the mirror.
        let listing = driver.list_rules()?;
        let mut active: Vec<String> = Vec::new();
        for rule in parse_rules(&listing) {
            let source = match &rule {
                hymod::hymofs::KernelRule::Add { source, .. } => source.clone(),
                hymod::hymofs::KernelRule::Merge { source, .. } => source.clone(),
                hymod::hymofs::KernelRule::Hide { .. } => continue,
            };
            for base in [Path::new(defs::MODULE_DIR), mirror.as_path()] {
                if let Ok(rest) = Path::new(&source).strip_prefix(base) {
                    if let Some(first) = rest.components().next() {
                        let id = first.as_os_str().to_string_lossy().to_string();
                        if !active.contains(&id) {
                            active.push(id);
                        }
                    }
                }
            }
        }
        active.sort();
        root["active_modules"] = serde_json::json!(active);
        root["mount_base"] = serde_json::json!(mirror.display().to_string());
    } else {
        root["mount_base"] = serde_json::json!(defs::MIRROR_DEV_DIR);
    }

    println!("{}", serde_json::to_string_pretty(&root)?);
    Ok(())
}

fn cmd_show_config(config: &Config, driver: &HymoDriver) -> Result<()> {
    let mut value = serde_json::to_value(config)?;
    value["hymofs_available"] = serde_json::json!(driver.is_available());
    value["hymofs_status"] = serde_json::json!(driver.status().as_str());
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn config_save_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(defs::CONFIG_FILE))
}

fn cmd_set_uname(
    cli: &Cli,
    config: &Config,
    driver: &HymoDriver,
    release: &str,
    version: &str,
) -> Result<()> {
    let mut config = config.clone();
    config.uname_release = release.to_string();
    config.uname_version = version.to_string();
    config.save(config_save_path(cli))?;

    println!("Kernel version spoofing configured:");
    println!("  Release: {release}");
    println!("  Version: {version}");

    if driver.is_available() {
        match driver.set_uname(release, version) {
            Ok(()) => println!("Applied uname spoofing to kernel."),
            Err(e) => eprintln!("Warning: failed to apply uname to kernel: {e}"),
        }
    }
    Ok(())
}

fn cmd_set_mirror(cli: &Cli, config: &Config, driver: &HymoDriver, path: &Path) -> Result<()> {
    let mut config = config.clone();
    config.mirror_path = Some(path.to_path_buf());
    config.save(config_save_path(cli))?;
    println!("Mirror path set to: {}", path.display());

    if driver.is_available() {
        match driver.set_mirror_path(path) {
            Ok(()) => println!("Applied mirror path to kernel."),
            Err(e) => eprintln!("Failed to apply mirror path to kernel: {e}"),
        }
    }
    Ok(())
}

fn cmd_raw(driver: &HymoDriver, args: &[String]) -> Result<()> {
    let usage = || Error::InvalidConfig("usage: raw <add|hide|delete|merge|clear> ...".into());
    let cmd = args.first().ok_or_else(usage)?;

    match cmd.as_str() {
        "add" => {
            let target = args.get(1).ok_or_else(usage)?;
            let source = args.get(2).ok_or_else(usage)?;
            let rule_type: i32 = args.get(3).map(|s| s.parse()).transpose().map_err(|_| {
                Error::InvalidConfig("rule type must be an integer".into())
            })?.unwrap_or(0);
            driver.add_rule(Path::new(target), Path::new(source), rule_type)?;
        }
        "hide" => {
            let path = args.get(1).ok_or_else(usage)?;
            driver.hide_path(path)?;
        }
        "delete" => {
            let target = args.get(1).ok_or_else(usage)?;
            driver.delete_rule(Path::new(target))?;
        }
        "merge" => {
            let target = args.get(1).ok_or_else(usage)?;
            let source = args.get(2).ok_or_else(usage)?;
            driver.add_merge_rule(Path::new(target), Path::new(source))?;
        }
        "clear" => driver.clear_rules()?,
        other => return Err(Error::InvalidConfig(format!("unknown raw command: {other}"))),
    }

    println!("Command executed successfully.");
    info!("executed raw command: {cmd}");
    Ok(())
}

/// Install rules for every partition subtree of one module, updating the
/// runtime state on success.
fn install_module_rules(config: &Config, driver: &HymoDriver, module_id: &str) -> Result<usize> {
    let module_path = config.moduledir.join(module_id);
    if !module_path.exists() {
        return Err(Error::PathNotFound(format!("module not found: {module_id}")));
    }

    let mut installed = 0usize;
    for part in config.all_partitions() {
        let src_dir = module_path.join(&part);
        if !src_dir.is_dir() {
            continue;
        }
        let target_base = Path::new("/").join(&part);
        if driver.add_rules_from_directory(&target_base, &src_dir)? {
            installed += 1;
        }
    }
    Ok(installed)
}

fn remove_module_rules(config: &Config, driver: &HymoDriver, module_id: &str) -> usize {
    let module_path = config.moduledir.join(module_id);
    let mut removed = 0usize;
    for part in config.all_partitions() {
        let src_dir = module_path.join(&part);
        if !src_dir.is_dir() {
            continue;
        }
        let target_base = Path::new("/").join(&part);
        match driver.remove_rules_from_directory(&target_base, &src_dir) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!("rule removal for {module_id}/{part} failed: {e}"),
        }
    }
    removed
}

fn state_add_module(module_id: &str) -> Result<()> {
    let mut state = RuntimeState::load();
    if !state.hymofs_module_ids.iter().any(|id| id == module_id) {
        state.hymofs_module_ids.push(module_id.to_string());
        state.save()?;
    }
    Ok(())
}

fn state_remove_module(module_id: &str) -> Result<()> {
    let mut state = RuntimeState::load();
    let before = state.hymofs_module_ids.len();
    state.hymofs_module_ids.retain(|id| id != module_id);
    if state.hymofs_module_ids.len() != before {
        state.save()?;
    }
    Ok(())
}

fn cmd_add_module(config: &Config, driver: &HymoDriver, module_id: &str) -> Result<()> {
    require_driver(driver)?;
    if install_module_rules(config, driver, module_id)? > 0 {
        println!("Successfully added module {module_id}");
        info!("CLI: added module {module_id}");
        state_add_module(module_id)?;
    } else {
        println!("No content found to add for module {module_id}");
    }
    Ok(())
}

fn cmd_delete_module(config: &Config, driver: &HymoDriver, module_id: &str) -> Result<()> {
    require_driver(driver)?;
    if remove_module_rules(config, driver, module_id) > 0 {
        println!("Successfully removed rules for module {module_id}");
        info!("CLI: removed rules for module {module_id}");
        state_remove_module(module_id)?;
    } else {
        println!("No active rules found for module {module_id}");
    }
    Ok(())
}

fn cmd_hot_mount(config: &Config, driver: &HymoDriver, module_id: &str) -> Result<()> {
    require_driver(driver)?;

    let marker = Path::new(defs::RUN_DIR)
        .join("hot_unmounted")
        .join(module_id);
    if marker.exists() {
        std::fs::remove_file(&marker)?;
    }
    let disabled = config.moduledir.join(module_id).join(defs::DISABLE_FILE_NAME);
    if disabled.exists() {
        std::fs::remove_file(&disabled)?;
    }

    if install_module_rules(config, driver, module_id)? > 0 {
        println!("Successfully hot mounted module {module_id}");
        info!("CLI: hot mounted module {module_id}");
        state_add_module(module_id)?;
    } else {
        println!("No content found to add for module {module_id}");
    }
    Ok(())
}

fn cmd_hot_unmount(config: &Config, driver: &HymoDriver, module_id: &str) -> Result<()> {
    require_driver(driver)?;

    let marker_dir = Path::new(defs::RUN_DIR).join("hot_unmounted");
    std::fs::create_dir_all(&marker_dir)?;
    std::fs::write(marker_dir.join(module_id), b"")?;

    if remove_module_rules(config, driver, module_id) > 0 {
        println!("Successfully hot unmounted module {module_id}");
        info!("CLI: hot unmounted module {module_id}");
    } else {
        println!("No active rules found for module {module_id}");
    }
    state_remove_module(module_id)?;
    Ok(())
}

fn cmd_sync_partitions(cli: &Cli, config: &Config) -> Result<()> {
    let candidates = scanner::scan_partition_candidates(&config.moduledir)?;

    let mut config = config.clone();
    let mut added = 0usize;
    for candidate in candidates {
        if config.partitions.contains(&candidate)
            || defs::BUILTIN_PARTITIONS.contains(&candidate.as_str())
        {
            continue;
        }
        println!("Added partition: {candidate}");
        config.partitions.push(candidate);
        added += 1;
    }

    if added > 0 {
        config.save(config_save_path(cli))?;
        println!("Updated config with {added} new partitions.");
    } else {
        println!("No new partitions found.");
    }
    Ok(())
}
