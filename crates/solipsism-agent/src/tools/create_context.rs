//! Create-context tool — spawn a child context with its own tools and task.

use std::path::PathBuf;
use std::sync::Weak;

use async_trait::async_trait;

use solipsism_core::lpml::{findall, Element};
use solipsism_providers::ModelSettings;

use super::base::{define_tag, Invocation, Tool, ToolOutput};
use crate::manager::{ContextRequest, Manager};

pub struct CreateContextTool {
    manager: Weak<Manager>,
}

impl CreateContextTool {
    pub fn new(manager: Weak<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for CreateContextTool {
    fn name(&self) -> &str {
        "create_context"
    }

    fn definition(&self) -> String {
        define_tag(
            "create_context",
            "Creates a new, independent LLM context as a child of the current context. \
             Returns the new child's ID immediately and starts it in the background.",
            &[(
                "id (optional)",
                "A specific ID to assign to the new context. If not provided, one is generated.",
            )],
            "Sub-tags:\n    \
             - <llm> (optional): Configures the LLM for the new context. Attributes: `model`, `temperature`.\n    \
             - <prompt> (optional): Specifies a custom base prompt file. Attribute: `path`.\n    \
             - <tools> (required): A list of tools to grant to the new context.\n        \
             - <tool name=\"...\"/>: The name of the tool to grant (e.g., \"read_file\").\n    \
             - <task> (required): The initial task description for the new context.",
        )
    }

    async fn run(&self, element: &Element, invocation: &Invocation) -> anyhow::Result<ToolOutput> {
        let request = parse_request(element, &invocation.context_id)?;
        let Some(manager) = self.manager.upgrade() else {
            anyhow::bail!("The context manager is no longer running.");
        };

        let context = manager
            .create_new_context(request)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create context. {e}"))?;

        let id = context.id().to_string();
        Ok(ToolOutput::success(format!("Successfully created new context. ID: {id}")).attr("id", id))
    }
}

/// Read the sub-tags of a `<create_context>` invocation.
fn parse_request(element: &Element, parent_id: &str) -> anyhow::Result<ContextRequest> {
    let content = match element.content.as_deref() {
        Some(content) if !content.is_empty() => content,
        _ => anyhow::bail!("<create_context> tag must contain <tools> and <task> sub-tags."),
    };

    let Some(task) = findall(content, "task").into_iter().next() else {
        anyhow::bail!("<task> tag is required.");
    };

    let tool_names = findall(content, "tool")
        .into_iter()
        .filter_map(|tool| tool.get_attr("name"))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    let mut model = ModelSettings::default();
    if let Some(llm) = findall(content, "llm").into_iter().next() {
        model.model = llm.get_attr("model").filter(|m| !m.is_empty()).map(str::to_string);
        if let Some(raw) = llm.get_attr("temperature") {
            let temperature = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("Invalid temperature '{raw}'."))?;
            model.temperature = Some(temperature);
        }
    }

    let prompt_path = findall(content, "prompt")
        .into_iter()
        .next()
        .and_then(|prompt| prompt.get_attr("path"))
        .filter(|path| !path.is_empty())
        .map(PathBuf::from);

    Ok(ContextRequest {
        parent_id: parent_id.to_string(),
        task: task.text().trim().to_string(),
        tool_names,
        custom_id: element.get_attr("id").filter(|id| !id.is_empty()).map(str::to_string),
        model,
        prompt_path,
    })
}
