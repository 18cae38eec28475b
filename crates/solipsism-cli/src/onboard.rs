//! `solipsism onboard` — initialize configuration, workspace, and base prompt.
//!
//! - Creates `~/.solipsism/config.json` with defaults
//! - Creates the workspace directory
//! - Writes the default base prompt where the config expects it

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use solipsism_agent::{ManagerSettings, ToolConfig};
use solipsism_core::config::{get_config_path, load_config, save_config};
use solipsism_core::utils::get_data_path;

/// Default base prompt for every context.
pub const ROOT_PROMPT: &str = include_str!("../../../prompts/root_prompt.lpml");

/// Run the onboard command.
pub fn run() -> Result<()> {
    println!();
    println!("{}", "Solipsism — Setup".cyan().bold());
    println!();

    let config_path = get_config_path();
    if config_path.exists() {
        println!(
            "  {} config already exists at {}",
            "✓".green(),
            config_path.display()
        );
    } else {
        let config = load_config(None);
        save_config(&config, Some(&config_path))?;
        println!(
            "  {} created config at {}",
            "✓".green(),
            config_path.display()
        );
    }

    let config = load_config(Some(&config_path));

    let workspace = ToolConfig::from_config(&config).workspace;
    std::fs::create_dir_all(&workspace)?;
    println!("  {} workspace at {}", "✓".green(), workspace.display());

    let prompt_path = ManagerSettings::from_config(&config).prompt_path;
    create_template(&prompt_path, ROOT_PROMPT)?;

    std::fs::create_dir_all(get_data_path().join("history"))?;

    println!();
    println!(
        "{}",
        "  Setup complete! Run `solipsism chat` to start.".green()
    );
    println!();

    Ok(())
}

/// Create a file (and its parent directories) unless it already exists.
fn create_template(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        println!("  {} {} already exists", "✓".green(), path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    println!("  {} created {}", "✓".green(), path.display());
    Ok(())
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_template_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts").join("root_prompt.lpml");
        create_template(&path, "hello").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[test]
    fn create_template_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("PROMPT.lpml");
        std::fs::write(&path, "original").unwrap();
        create_template(&path, "new content").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[test]
    fn root_prompt_is_well_formed() {
        let tree = solipsism_core::lpml::parse(ROOT_PROMPT);
        assert!(!solipsism_core::lpml::findall(&tree, "rule").is_empty());
        assert!(ROOT_PROMPT.contains("<finish/>"));
        assert!(ROOT_PROMPT.contains("<wait/>"));
    }
}
