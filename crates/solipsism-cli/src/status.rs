//! `solipsism status` — show configuration, provider, and tool status.

use anyhow::Result;
use colored::Colorize;

use solipsism_agent::{ManagerSettings, ToolCatalog, ToolConfig};
use solipsism_core::config::{get_config_path, load_config};
use solipsism_providers::PROVIDERS;

fn presence(exists: bool) -> String {
    if exists {
        "✓".green().to_string()
    } else {
        "(not found)".red().to_string()
    }
}

/// Run the status command.
pub fn run() -> Result<()> {
    let config = load_config(None);
    let config_path = get_config_path();
    let tool_config = ToolConfig::from_config(&config);
    let settings = ManagerSettings::from_config(&config);
    let defaults = &config.agents.defaults;

    println!();
    println!("{}", "Solipsism Status".cyan().bold());
    println!();

    println!(
        "  {:<18} {} {}",
        "Config:".bold(),
        config_path.display(),
        presence(config_path.exists())
    );
    println!(
        "  {:<18} {} {}",
        "Workspace:".bold(),
        tool_config.workspace.display(),
        presence(tool_config.workspace.exists())
    );
    println!(
        "  {:<18} {} {}",
        "Base prompt:".bold(),
        settings.prompt_path.display(),
        presence(settings.prompt_path.exists())
    );

    println!("  {:<18} {}", "Model:".bold(), defaults.model);
    println!(
        "  {:<18} {}",
        "Parameters:".bold(),
        format!(
            "temp: {} | max_tokens: {} | max_turns: {} | turn_sleep: {}s",
            defaults.temperature, defaults.max_tokens, defaults.max_turns, defaults.turn_sleep
        )
        .dimmed(),
    );

    println!();
    println!("  {}", "Providers:".bold());
    let providers_map = config.providers.to_map();
    for spec in PROVIDERS {
        let status = match providers_map.get(spec.name) {
            Some(provider) if provider.is_configured() => format!("{} (key set)", "✓".green()),
            _ => format!("{}", "· not configured".dimmed()),
        };
        println!("    {:<20} {}", spec.display_name, status);
    }

    println!();
    let catalog = ToolCatalog::builtin(tool_config);
    println!(
        "  {:<18} {}",
        "Tools:".bold(),
        catalog.names().join(", ")
    );
    println!(
        "  {:<18} {}",
        "Sandbox:".bold(),
        if config.tools.restrict_to_workspace {
            "restricted to workspace"
        } else {
            "unrestricted"
        }
    );
    println!();

    Ok(())
}
