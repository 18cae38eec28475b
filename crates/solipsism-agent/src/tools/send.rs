//! Send tool — deliver a message to the parent or a direct child.

use std::sync::Weak;

use async_trait::async_trait;
use tracing::debug;

use solipsism_core::lpml::Element;

use super::base::{body, define_tag, Invocation, Tool, ToolOutput};
use crate::manager::Manager;

pub struct SendTool {
    manager: Weak<Manager>,
}

impl SendTool {
    pub fn new(manager: Weak<Manager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SendTool {
    fn name(&self) -> &str {
        "send"
    }

    fn definition(&self) -> String {
        define_tag(
            "send",
            "Sends a message to your parent or to one of your direct children. The content of \
             the tag is the message. Communication with any other context (e.g. siblings) is not \
             allowed. On success an <output> with status=\"success\" is returned; on failure an \
             <output> with status=\"error\".",
            &[(
                "to (required)",
                "The ID of the destination context, or the keyword \"parent\".",
            )],
            "",
        )
    }

    async fn run(&self, element: &Element, invocation: &Invocation) -> anyhow::Result<ToolOutput> {
        let Some(raw_to) = element.get_attr("to").filter(|to| !to.is_empty()) else {
            anyhow::bail!("The 'to' attribute is missing.");
        };
        let Some(manager) = self.manager.upgrade() else {
            anyhow::bail!("The context manager is no longer running.");
        };
        let from = invocation.context_id.as_str();
        let Some(sender) = manager.get_context(from) else {
            anyhow::bail!("Sender context '{from}' not found in Manager.");
        };

        let to = if raw_to == "parent" {
            match sender.parent_id() {
                Some(parent) => parent.to_string(),
                None => anyhow::bail!("This context has no parent."),
            }
        } else {
            raw_to.to_string()
        };

        let message = Element::with_text("send", body(element))
            .attr("from", from)
            .attr("to", to.as_str());

        if !manager.route_message(from, &to, message) {
            anyhow::bail!("Failed to send message to '{to}'. Not found or permission denied.");
        }
        debug!(from = from, to = %to, "message sent");
        Ok(ToolOutput::success(format!("Message delivered to '{to}'.")))
    }
}
