//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- run the poll server
//! - `config show|path|validate` -- inspect configuration
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::{Path, PathBuf};

use crate::config;

/// Live classroom polling server.
#[derive(Parser, Debug)]
#[command(
    name = "pollroom",
    version = env!("CARGO_PKG_VERSION"),
    about = "pollroom: one moderator, many participants, one timed question at a time"
)]
pub struct Cli {
    /// Config file (default: $POLLROOM_CONFIG_PATH or ./pollroom.json5).
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the poll server (default when no subcommand is given).
    Start,

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version, build date, and git commit information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the fully loaded configuration as JSON.
    Show,

    /// Print the resolved configuration file path.
    Path,

    /// Check the configuration and list any problems.
    Validate,
}

/// Run the `config show` subcommand.
pub fn handle_config_show(explicit: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let path = config::resolve_config_path(explicit);
    let cfg = config::load_config(&path)?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path(explicit: Option<&Path>) {
    let path = config::resolve_config_path(explicit);
    let note = if path.exists() { "" } else { " (not found, defaults apply)" };
    println!("{}{}", path.display(), note);
}

/// Run the `config validate` subcommand. Returns whether the config is valid.
pub fn handle_config_validate(explicit: Option<&Path>) -> Result<bool, Box<dyn Error>> {
    let path = config::resolve_config_path(explicit);
    let cfg = config::load_config(&path)?;
    let issues = config::validate_config(&cfg);
    if issues.is_empty() {
        println!("{}: ok", path.display());
        return Ok(true);
    }
    for issue in &issues {
        eprintln!("{}: {}", issue.path, issue.message);
    }
    Ok(false)
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("pollroom {}", env!("CARGO_PKG_VERSION"));
    println!("  Build date: {}", env!("POLLROOM_BUILD_DATE"));
    println!("  Git commit: {}", env!("POLLROOM_GIT_HASH"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}
