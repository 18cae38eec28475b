//! Tool management — let a running context discover and add tools.
//!
//! `list_available_tools` shows every name that can be granted, and
//! `register_tool` builds one of them and adds it to the caller's own
//! dispatcher. The new definition appears in the prompt from the next turn.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::info;

use solipsism_core::lpml::Element;

use super::base::{define_tag, require_attr, Invocation, Tool, ToolOutput};
use crate::manager::Manager;

fn upgrade(manager: &Weak<Manager>) -> anyhow::Result<Arc<Manager>> {
    manager
        .upgrade()
        .ok_or_else(|| anyhow::anyhow!("The context manager is no longer running."))
}

// ─────────────────────────────────────────────
// ListAvailableToolsTool
// ─────────────────────────────────────────────

pub struct ListAvailableToolsTool {
    manager: Weak<Manager>,
}

impl ListAvailableToolsTool {
    pub fn new(manager: Weak<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for ListAvailableToolsTool {
    fn name(&self) -> &str {
        "list_available_tools"
    }

    fn definition(&self) -> String {
        define_tag(
            "list_available_tools",
            "Lists all tools available for registration, one name per line.",
            &[],
            "",
        )
    }

    async fn run(&self, _: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let manager = upgrade(&self.manager)?;
        let mut names = manager.grantable_tools();
        names.sort();
        Ok(ToolOutput::new(names.join("\n")))
    }
}

// ─────────────────────────────────────────────
// RegisterTool
// ─────────────────────────────────────────────

pub struct RegisterTool {
    manager: Weak<Manager>,
}

impl RegisterTool {
    pub fn new(manager: Weak<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for RegisterTool {
    fn name(&self) -> &str {
        "register_tool"
    }

    fn definition(&self) -> String {
        define_tag(
            "register_tool",
            "Registers a new tool for the current context to use. On failure, the <output> tag \
             contains an error.",
            &[(
                "name (required)",
                "The name of the tool to register (e.g., \"read_file\"). Run list_available_tools to see the choices.",
            )],
            "",
        )
    }

    async fn run(&self, element: &Element, invocation: &Invocation) -> anyhow::Result<ToolOutput> {
        let name = require_attr(element, "name")?;
        let manager = upgrade(&self.manager)?;
        let caller = invocation.context_id.as_str();
        let Some(context) = manager.get_context(caller) else {
            anyhow::bail!("Context '{caller}' not found in Manager.");
        };

        if context.system().has_tool(name) {
            anyhow::bail!("Tool '{name}' is already registered.");
        }
        let tool = match manager.build_tool(name) {
            None => anyhow::bail!(
                "Tool '{name}' not found in the catalog. Run list_available_tools to see what can be registered."
            ),
            Some(Err(e)) => anyhow::bail!("Could not instantiate tool '{name}'. {e}"),
            Some(Ok(tool)) => tool,
        };

        context.system().add_tool(tool);
        info!(context = caller, tool = name, "tool registered at runtime");
        Ok(ToolOutput::success(format!("Successfully registered tool '{name}'.")))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
