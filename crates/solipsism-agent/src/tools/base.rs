//! Tool trait — the interface every context capability implements.
//!
//! A tool is invoked by an LPML element whose tag equals the tool's name.
//! The tool receives the element plus the identity of the invoking context
//! and returns text; wrapping that text into an `<output>` element and
//! delivering it is the dispatcher's job (see [`crate::system::System`]).

use async_trait::async_trait;

use solipsism_core::lpml::{Attributes, Element};

// ─────────────────────────────────────────────
// Tool trait
// ─────────────────────────────────────────────

/// Who is invoking a tool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    /// Id of the context whose dispatcher scheduled this run.
    pub context_id: String,
}

impl Invocation {
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
        }
    }
}

/// Result text plus attributes the tool wants on its `<output>` element
/// (e.g. `status="success"`, `id="…"`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub attributes: Attributes,
}

impl ToolOutput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attributes: Attributes::new(),
        }
    }

    /// Output tagged `status="success"`.
    pub fn success(text: impl Into<String>) -> Self {
        Self::new(text).attr("status", "success")
    }

    /// Builder: add an attribute to the `<output>` element.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key, value);
        self
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for ToolOutput {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// Every context capability implements this trait.
///
/// The dispatcher finds invocations by `name()`, shows `definition()` to the
/// model in the system prompt, and schedules `run()` once per invocation.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tag name that invokes this tool (e.g. `"read_file"`).
    fn name(&self) -> &str;

    /// LPML `<define_tag>` block describing usage to the model.
    fn definition(&self) -> String;

    /// Execute one invocation.
    ///
    /// On failure, return an `Err`; the dispatcher turns it into an
    /// `Error: …` output with `status="error"`.
    async fn run(&self, element: &Element, invocation: &Invocation) -> anyhow::Result<ToolOutput>;
}

// ─────────────────────────────────────────────
// Definition helper
// ─────────────────────────────────────────────

/// Render a `<define_tag>` block.
///
/// `attributes` is a list of `(name, description)` pairs; `extra` is
/// free-form text appended after them (sub-tags, examples).
pub fn define_tag(name: &str, summary: &str, attributes: &[(&str, &str)], extra: &str) -> String {
    let mut out = format!("<define_tag name=\"{name}\">\n{}\n", summary.trim());
    if !attributes.is_empty() {
        out.push_str("Attributes:\n");
        for (attr, desc) in attributes {
            out.push_str(&format!("    - {attr}: {desc}\n"));
        }
    }
    if !extra.trim().is_empty() {
        out.push_str(extra.trim());
        out.push('\n');
    }
    out.push_str("</define_tag>");
    out
}

// ─────────────────────────────────────────────
// Attribute helpers
// ─────────────────────────────────────────────

/// Extract a required attribute, returning a model-friendly error.
pub fn require_attr<'a>(element: &'a Element, key: &str) -> anyhow::Result<&'a str> {
    element
        .get_attr(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("The '{key}' attribute is missing."))
}

/// Extract an optional attribute.
pub fn optional_attr<'a>(element: &'a Element, key: &str) -> Option<&'a str> {
    element.get_attr(key)
}

/// `true` only when the attribute is `"true"` (case-insensitive).
pub fn flag_attr(element: &Element, key: &str) -> bool {
    element
        .get_attr(key)
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Parse an optional 1-based line number attribute.
pub fn line_attr(element: &Element, key: &str) -> anyhow::Result<Option<usize>> {
    match element.get_attr(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("Invalid line number for '{key}': {raw:?}")),
    }
}

/// The element's body as raw text. Self-closing elements have an empty body.
pub fn body(element: &Element) -> String {
    element.text()
}
