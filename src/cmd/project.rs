//! Project initialization (`pipewright init`).

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use pipewright::config::{CONFIG_DIR, PipewrightConfig};

const GITIGNORE_ENTRY: &str = ".pipewright/";

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    if !project_dir.join(".git").exists() {
        anyhow::bail!(
            "{} is not a git repository; pipewright needs one to create worktrees",
            project_dir.display()
        );
    }

    let config_path = PipewrightConfig::config_path(project_dir);
    if config_path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            style("!").yellow(),
            config_path.display()
        );
        return Ok(());
    }

    let dir = project_dir.join(CONFIG_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;
    let content = PipewrightConfig::default().to_toml()?;
    std::fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("{} Wrote {}", style("✓").green(), config_path.display());

    if ensure_gitignored(project_dir)? {
        println!("{} Added {} to .gitignore", style("✓").green(), GITIGNORE_ENTRY);
    }
    Ok(())
}

/// Worktrees live under the project directory, so the state directory must be
/// ignored or every worktree would show up as untracked content.
fn ensure_gitignored(project_dir: &Path) -> Result<bool> {
    let path = project_dir.join(".gitignore");
    let existing = if path.exists() {
        std::fs::read_to_string(&path).context("Failed to read .gitignore")?
    } else {
        String::new()
    };
    let already = existing
        .lines()
        .any(|l| matches!(l.trim(), ".pipewright" | ".pipewright/" | "/.pipewright" | "/.pipewright/"));
    if already {
        return Ok(false);
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(GITIGNORE_ENTRY);
    updated.push('\n');
    std::fs::write(&path, updated).context("Failed to update .gitignore")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gitignore_entry_added_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "target").unwrap();
        assert!(ensure_gitignored(dir.path()).unwrap());
        assert!(!ensure_gitignored(dir.path()).unwrap());
        let content = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert_eq!(content, "target\n.pipewright/\n");
    }
}
