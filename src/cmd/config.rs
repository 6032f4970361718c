//! Configuration view and validation commands (`pipewright config`).

use std::path::Path;

use anyhow::Result;
use console::style;
use pipewright::config::PipewrightConfig;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = PipewrightConfig::config_path(project_dir);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No pipewright.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            println!("Effective values (with env overrides):");
            println!();
            let config = PipewrightConfig::load(project_dir)?;
            print!("{}", config.to_toml()?);

            let runtime = config.resolve(project_dir);
            println!();
            println!("Resolved paths:");
            println!("  worktrees = {}", runtime.worktrees_root.display());
            println!("  artifacts = {}", runtime.artifacts_root.display());
            println!("  database  = {}", runtime.db_path.display());
            println!();
        }
        Some(ConfigCommands::Validate) => match PipewrightConfig::load(project_dir) {
            Ok(_) => println!("{} Configuration is valid", style("✓").green()),
            Err(e) => {
                println!("{} {:#}", style("✗").red(), e);
                anyhow::bail!("invalid configuration");
            }
        },
    }
    Ok(())
}
