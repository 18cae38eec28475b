//! Solipsism CLI — entry point.
//!
//! # Commands
//!
//! - `solipsism chat [--task TEXT] [--max-turns N]` — start a root context and chat with it
//! - `solipsism onboard` — initialize config, workspace, and the base prompt
//! - `solipsism status` — show configuration and provider status

mod helpers;
mod onboard;
mod repl;
mod status;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use solipsism_agent::{ContextRequest, Manager, ManagerSettings, ToolCatalog, ToolConfig};
use solipsism_core::config::{load_config, Config};
use solipsism_providers::ConfiguredProviderFactory;

/// Id of the endpoint that stands for the human user.
pub const USER_ID: &str = "user";

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// Solipsism — a tree of cooperating LLM contexts
#[derive(Parser)]
#[command(name = "solipsism", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a root context and chat with the tree
    Chat {
        /// Initial task for the root context (default: introduce itself)
        #[arg(short, long)]
        task: Option<String>,

        /// Turn budget for every context (overrides the config)
        #[arg(long)]
        max_turns: Option<u32>,

        /// Enable debug logging
        #[arg(long, default_value_t = false)]
        logs: bool,
    },

    /// Initialize configuration, workspace, and base prompt
    Onboard,

    /// Show configuration and provider status
    Status,
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat {
            task,
            max_turns,
            logs,
        } => {
            init_logging(logs);
            run_chat(task, max_turns).await
        }
        Commands::Onboard => onboard::run(),
        Commands::Status => status::run(),
    }
}

// ─────────────────────────────────────────────
// Chat command
// ─────────────────────────────────────────────

async fn run_chat(task: Option<String>, max_turns: Option<u32>) -> Result<()> {
    let config = load_config(None);
    let manager = build_manager(&config, max_turns)?;

    if !manager.settings().prompt_path.exists() {
        helpers::print_warning(&format!(
            "base prompt not found at {} (run `solipsism onboard`)",
            manager.settings().prompt_path.display()
        ));
    }

    let user = manager
        .add_endpoint(USER_ID)
        .context("failed to register the user endpoint")?;

    let root = manager
        .build_context(&ContextRequest {
            parent_id: USER_ID.to_string(),
            tool_names: manager.grantable_tools(),
            ..Default::default()
        })
        .await
        .context("failed to create the root context")?;
    info!(context = root.id(), "root context created");

    let initial_task = task.unwrap_or_else(|| introduction(root.id()));
    manager.spawn(Arc::clone(&root), initial_task);

    let result = repl::run(Arc::clone(&manager), user, root.id().to_string()).await;
    manager.shutdown();
    result
}

/// Build a `Manager` from the loaded configuration.
pub fn build_manager(config: &Config, max_turns: Option<u32>) -> Result<Arc<Manager>> {
    let tool_config = ToolConfig::from_config(config);
    std::fs::create_dir_all(&tool_config.workspace).with_context(|| {
        format!("failed to create workspace: {}", tool_config.workspace.display())
    })?;

    let mut settings = ManagerSettings::from_config(config);
    if let Some(max_turns) = max_turns {
        settings.max_turns = max_turns;
    }

    Ok(Manager::new(
        ToolCatalog::builtin(tool_config),
        Arc::new(ConfiguredProviderFactory::from_config(config)),
        settings,
    ))
}

fn introduction(root_id: &str) -> String {
    format!(
        "You are an AI assistant. Your context ID is '{root_id}'. \
         Your parent context is the user, with ID '{USER_ID}'. \
         Start by introducing yourself to your parent (the user)."
    )
}

/// Initialize tracing/logging. `RUST_LOG` wins when set.
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("solipsism=debug,info")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
