//! Instance listing (`pipewright list`).

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use pipewright::config::PipewrightConfig;
use pipewright::workflow::db::{DbHandle, StateDb};
use pipewright::workflow::models::{InstanceFilter, InstanceStatus, StagePosition};

pub fn cmd_list(project_dir: &Path, status: Option<&str>, stage: Option<&str>) -> Result<()> {
    let filter = InstanceFilter {
        status: status
            .map(|s| s.parse::<InstanceStatus>().map_err(|e| anyhow::anyhow!(e)))
            .transpose()?,
        stage: stage
            .map(|s| s.parse::<StagePosition>())
            .transpose()
            .context("Invalid --stage")?,
    };

    let config = PipewrightConfig::load(project_dir)?.resolve(project_dir);
    if !config.db_path.exists() {
        println!();
        println!("No instances yet. Start the server with 'pipewright serve'.");
        println!();
        return Ok(());
    }

    let db = DbHandle::new(StateDb::new(&config.db_path)?);
    let instances = db.lock_sync()?.list_instances(&filter)?;
    if instances.is_empty() {
        println!();
        println!("No matching instances.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "{:<10} {:<24} {:<16} {:<12} Updated",
        "Id", "Recipe", "Stage", "Status"
    );
    println!(
        "{:<10} {:<24} {:<16} {:<12} -------",
        "----------", "------------------------", "----------------", "------------"
    );
    for instance in &instances {
        let status = match instance.status {
            InstanceStatus::Completed | InstanceStatus::Merged => style(instance.status.as_str()).green(),
            InstanceStatus::Errored => style(instance.status.as_str()).red(),
            InstanceStatus::Stuck => style(instance.status.as_str()).yellow(),
            _ => style(instance.status.as_str()).cyan(),
        };
        println!(
            "{:<10} {:<24} {:<16} {:<12} {}",
            instance.id,
            instance.recipe_name,
            instance.current_stage.as_str(),
            status,
            instance.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    println!("{} instance(s)", instances.len());
    Ok(())
}
