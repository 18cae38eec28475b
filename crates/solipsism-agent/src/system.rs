//! System — the per-context tool dispatcher and result queue.
//!
//! The context hands every model response to [`System::process_llm_output`],
//! which finds tool invocations in the LPML and runs each one as its own
//! tokio task. Every run ends with exactly one `<output>` element on the
//! result queue, whether the tool succeeded, failed, or panicked. The same
//! queue also receives messages routed from other contexts.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use solipsism_core::lpml::{self, Element, Node, ParseOptions};

use crate::tools::base::{Invocation, Tool, ToolOutput};

/// Tags whose bodies are never scanned for tool invocations.
const CONTROL_TAGS: &[&str] = &["define_tag", "rule", "send", "code"];

/// The one tool whose body is parsed, so its sub-tags stay structured.
const STRUCTURED_TOOL: &str = "create_context";

// ─────────────────────────────────────────────
// System
// ─────────────────────────────────────────────

pub struct System {
    /// Registration order is kept; it drives both the prompt and dispatch order.
    /// Tools may be added while the context runs.
    tools: RwLock<Vec<Arc<dyn Tool>>>,
    sender: UnboundedSender<Element>,
    receiver: Mutex<UnboundedReceiver<Element>>,
    context_id: Option<String>,
}

impl System {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            tools: RwLock::new(Vec::new()),
            sender,
            receiver: Mutex::new(receiver),
            context_id: None,
        }
    }

    /// Bind this dispatcher to its owning context. Only the first call counts.
    pub fn set_context_id(&mut self, id: impl Into<String>) {
        let id = id.into();
        match &self.context_id {
            Some(existing) if *existing != id => {
                warn!(existing = %existing, requested = %id, "system already bound to a context");
            }
            Some(_) => {}
            None => self.context_id = Some(id),
        }
    }

    pub fn context_id(&self) -> Option<&str> {
        self.context_id.as_deref()
    }

    /// Register a tool. A tool with the same name is replaced in place.
    pub fn add_tool(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = tools.iter_mut().find(|t| t.name() == name) {
            warn!(tool = %name, "tool already registered, overwriting");
            *slot = tool;
        } else {
            tools.push(tool);
        }
        debug!(tool = %name, context = ?self.context_id, "tool added");
    }

    /// A snapshot of the registered tools.
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools().into_iter().find(|t| t.name() == name)
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools().iter().any(|t| t.name() == name)
    }

    /// Tool names in registration order.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools().iter().map(|t| t.name().to_string()).collect()
    }

    /// All tool definitions, blank-line separated.
    pub fn get_tool_definitions(&self) -> String {
        self.tools()
            .iter()
            .map(|t| t.definition())
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string()
    }

    /// Tags whose bodies are kept as raw text when scanning model output.
    pub fn excluded_tags(&self) -> Vec<String> {
        CONTROL_TAGS
            .iter()
            .map(|t| t.to_string())
            .chain(
                self.tool_names()
                    .into_iter()
                    .filter(|name| name != STRUCTURED_TOOL),
            )
            .collect()
    }

    /// Scan model output and schedule one background run per tool tag.
    ///
    /// Returns the number of runs scheduled. Must be called inside a tokio
    /// runtime.
    pub fn process_llm_output(&self, text: &str) -> usize {
        let exclude = self.excluded_tags();
        let tree = lpml::parse_with(
            text,
            &ParseOptions {
                strip: false,
                exclude: &exclude,
            },
        );
        self.dispatch(&tree)
    }

    fn dispatch(&self, tree: &[Node]) -> usize {
        let invocation = Invocation::new(self.context_id.clone().unwrap_or_default());
        let mut scheduled = 0;

        for tool in self.tools() {
            for element in lpml::findall(tree, tool.name()) {
                debug!(tool = tool.name(), context = %invocation.context_id, "scheduling tool run");
                tokio::spawn(run_tool(
                    Arc::clone(&tool),
                    element.clone(),
                    invocation.clone(),
                    self.sender.clone(),
                ));
                scheduled += 1;
            }
        }

        if scheduled > 0 {
            info!(context = %invocation.context_id, count = scheduled, "scheduled tool runs");
        }
        scheduled
    }

    // ─────────────────────────────────────────
    // Result queue
    // ─────────────────────────────────────────

    /// Deliver an element. `false` only if the queue has been closed.
    pub fn enqueue(&self, element: Element) -> bool {
        self.sender.send(element).is_ok()
    }

    /// Wait for the next element. `None` once the queue is closed.
    pub async fn recv(&self) -> Option<Element> {
        self.receiver.lock().await.recv().await
    }

    /// Wait at most `timeout` for the next element.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<Element> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Take the next element if one is already available.
    pub fn try_recv(&self) -> Option<Element> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Take everything already available without waiting.
    pub fn drain(&self) -> Vec<Element> {
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return Vec::new();
        };
        let mut drained = Vec::new();
        while let Ok(element) = receiver.try_recv() {
            drained.push(element);
        }
        drained
    }

    /// Whether anything is waiting in the queue.
    pub fn has_pending(&self) -> bool {
        self.receiver
            .try_lock()
            .map(|receiver| !receiver.is_empty())
            .unwrap_or(false)
    }

    /// Drain the queue and render it as LPML, `None` when empty.
    pub fn get_tool_results_as_lpml(&self) -> Option<String> {
        let results = self.drain();
        if results.is_empty() {
            return None;
        }
        debug!(count = results.len(), "drained tool results");
        Some(join_elements(&results))
    }
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

/// Render elements separated by blank lines.
pub fn join_elements(elements: &[Element]) -> String {
    elements
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─────────────────────────────────────────────
// Tool execution
// ─────────────────────────────────────────────

/// Run one invocation and enqueue its single `<output>`.
///
/// The tool runs in a nested task so a panic surfaces as a `JoinError`
/// instead of unwinding through the dispatcher.
async fn run_tool(
    tool: Arc<dyn Tool>,
    element: Element,
    invocation: Invocation,
    sender: UnboundedSender<Element>,
) {
    let name = tool.name().to_string();
    let echoed = element.clone();

    let handle = tokio::spawn(async move { tool.run(&element, &invocation).await });

    let outcome = match handle.await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(tool = %name, error = %e, "tool run failed");
            ToolOutput::new(format!("Error: {e}")).attr("status", "error")
        }
        Err(e) => {
            warn!(tool = %name, error = %e, "tool run aborted");
            ToolOutput::new(format!("Error: tool '{name}' crashed: {e}")).attr("status", "error")
        }
    };

    if sender.send(wrap_output(&name, &echoed, outcome)).is_err() {
        debug!(tool = %name, "result queue closed, dropping output");
    }
}

/// Build the `<output>` element for one run.
///
/// Attributes: `tool`, then the invocation's own attributes (except a
/// conflicting `tool`), then whatever the tool added.
pub fn wrap_output(name: &str, invocation: &Element, output: ToolOutput) -> Element {
    let mut element = Element::new("output").attr("tool", name);
    for (key, value) in invocation.attributes.iter().filter(|(k, _)| *k != "tool") {
        element.attributes.insert(key, value);
    }
    for (key, value) in output.attributes.iter() {
        element.attributes.insert(key, value);
    }
    element.child(Node::Text(format!("\n{}\n", output.text)))
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::base::define_tag;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn definition(&self) -> String {
            define_tag("echo", "Echoes its body.", &[], "")
        }
        async fn run(&self, element: &Element, invocation: &Invocation) -> anyhow::Result<ToolOutput> {
            Ok(ToolOutput::new(format!("{}:{}", invocation.context_id, element.text())))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn definition(&self) -> String {
            define_tag("fail", "Always fails.", &[], "")
        }
        async fn run(&self, _: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
            anyhow::bail!("boom")
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }
        fn definition(&self) -> String {
            define_tag("panic", "Panics.", &[], "")
        }
        async fn run(&self, _: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
            panic!("tool panicked")
        }
    }

    struct CountingTool {
        name: &'static str,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            self.name
        }
        fn definition(&self) -> String {
            format!("def:{}", self.name)
        }
        async fn run(&self, _: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::new("counted"))
        }
    }

    fn system_with(tools: Vec<Arc<dyn Tool>>) -> System {
        let mut system = System::new();
        system.set_context_id("ctx1");
        for tool in tools {
            system.add_tool(tool);
        }
        system
    }

    async fn collect(system: &System, n: usize) -> Vec<Element> {
        let mut out = Vec::new();
        for _ in 0..n {
            out.push(
                system
                    .recv_timeout(Duration::from_secs(5))
                    .await
                    .expect("result should arrive"),
            );
        }
        out
    }

    #[tokio::test]
    async fn test_single_invocation_yields_one_output() {
        let system = system_with(vec![Arc::new(EchoTool)]);
        let n = system.process_llm_output(r#"Hi <echo label="a">hello</echo>"#);
        assert_eq!(n, 1);

        let results = collect(&system, 1).await;
        let out = &results[0];
        assert_eq!(out.tag, "output");
        assert_eq!(out.get_attr("tool"), Some("echo"));
        assert_eq!(out.get_attr("label"), Some("a"));
        assert_eq!(out.text(), "\nctx1:hello\n");
        assert!(system.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_error_becomes_error_output() {
        let system = system_with(vec![Arc::new(FailTool)]);
        assert_eq!(system.process_llm_output("<fail/>"), 1);
        let results = collect(&system, 1).await;
        assert_eq!(results[0].get_attr("status"), Some("error"));
        assert_eq!(results[0].text(), "\nError: boom\n");
    }

    #[tokio::test]
    async fn test_panic_still_yields_one_output() {
        let system = system_with(vec![Arc::new(PanicTool), Arc::new(EchoTool)]);
        assert_eq!(system.process_llm_output("<panic/><echo>x</echo>"), 2);
        let results = collect(&system, 2).await;
        let crashed = results
            .iter()
            .find(|e| e.get_attr("tool") == Some("panic"))
            .expect("panic output present");
        assert_eq!(crashed.get_attr("status"), Some("error"));
        assert!(crashed.text().contains("crashed"));
        assert!(system.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unregistered_tags_ignored() {
        let system = system_with(vec![Arc::new(EchoTool)]);
        assert_eq!(system.process_llm_output("<unknown/> <b>text</b>"), 0);
        assert!(!system.has_pending());
    }

    #[tokio::test]
    async fn test_excluded_bodies_not_dispatched() {
        let system = system_with(vec![Arc::new(EchoTool)]);
        let n = system.process_llm_output(
            "<code><echo>no</echo></code><send to=\"parent\"><echo>no</echo></send>",
        );
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_backtick_span_not_dispatched() {
        let system = system_with(vec![Arc::new(EchoTool)]);
        assert_eq!(system.process_llm_output("Use `<echo>x</echo>` to echo."), 0);
    }

    #[tokio::test]
    async fn test_multiple_invocations_all_scheduled() {
        let counter = Arc::new(CountingTool {
            name: "count",
            runs: AtomicUsize::new(0),
        });
        let tool: Arc<dyn Tool> = counter.clone();
        let system = system_with(vec![tool]);
        assert_eq!(system.process_llm_output("<count/> and <count/> and <count/>"), 3);
        collect(&system, 3).await;
        assert_eq!(counter.runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_add_tool_overwrites_in_place() {
        let system = System::new();
        system.add_tool(Arc::new(CountingTool {
            name: "a",
            runs: AtomicUsize::new(0),
        }));
        system.add_tool(Arc::new(CountingTool {
            name: "b",
            runs: AtomicUsize::new(0),
        }));
        system.add_tool(Arc::new(CountingTool {
            name: "a",
            runs: AtomicUsize::new(0),
        }));
        assert_eq!(system.tool_names(), vec!["a", "b"]);
        assert_eq!(system.get_tool_definitions(), "def:a\n\ndef:b");
    }

    #[tokio::test]
    async fn test_tool_added_through_shared_handle_is_dispatched() {
        let system = Arc::new(system_with(vec![]));
        assert_eq!(system.process_llm_output("<echo>early</echo>"), 0);

        let shared = Arc::clone(&system);
        tokio::spawn(async move { shared.add_tool(Arc::new(EchoTool)) })
            .await
            .unwrap();

        assert!(system.excluded_tags().contains(&"echo".to_string()));
        assert_eq!(system.process_llm_output("<echo>late</echo>"), 1);
        let results = collect(&system, 1).await;
        assert_eq!(results[0].text(), "\nctx1:late\n");
    }

    #[test]
    fn test_excluded_tags_skip_create_context() {
        let system = System::new();
        system.add_tool(Arc::new(CountingTool {
            name: "create_context",
            runs: AtomicUsize::new(0),
        }));
        system.add_tool(Arc::new(EchoTool));
        let excluded = system.excluded_tags();
        assert!(excluded.contains(&"code".to_string()));
        assert!(excluded.contains(&"echo".to_string()));
        assert!(!excluded.contains(&"create_context".to_string()));
    }

    #[test]
    fn test_context_id_binds_once() {
        let mut system = System::new();
        system.set_context_id("first");
        system.set_context_id("second");
        assert_eq!(system.context_id(), Some("first"));
    }

    #[tokio::test]
    async fn test_queue_fifo_and_drain() {
        let system = System::new();
        assert!(system.get_tool_results_as_lpml().is_none());
        system.enqueue(Element::with_text("a", "1"));
        system.enqueue(Element::empty("b"));
        assert!(system.has_pending());
        assert_eq!(
            system.get_tool_results_as_lpml().as_deref(),
            Some("<a>1</a>\n\n<b/>")
        );
        assert!(!system.has_pending());
    }

    #[tokio::test]
    async fn test_recv_timeout_expires() {
        let system = System::new();
        assert!(system.recv_timeout(Duration::from_millis(20)).await.is_none());
    }

    #[test]
    fn test_wrap_output_attribute_order() {
        let invocation = Element::empty("read_file")
            .attr("path", "a.txt")
            .attr("tool", "spoofed");
        let out = wrap_output("read_file", &invocation, ToolOutput::success("ok"));
        let keys: Vec<&str> = out.attributes.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["tool", "path", "status"]);
        assert_eq!(out.get_attr("tool"), Some("read_file"));
        assert_eq!(
            out.to_string(),
            "<output tool=\"read_file\" path=\"a.txt\" status=\"success\">\nok\n</output>"
        );
    }
}
