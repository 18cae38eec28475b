//! Context — one conversation with a model and its turn loop.
//!
//! Each context owns a history of LPML entries, a [`System`] holding its
//! tools and result queue, and (unless it is an endpoint such as the
//! interactive user) an LLM provider. [`Context::start`] drives the
//! turn-taking loop: ask the model, dispatch any tool tags it wrote, feed
//! the results back, and repeat until `<finish>` or the turn budget runs
//! out.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, error, info, warn};

use solipsism_core::lpml::{self, Element, Node, ParseOptions};
use solipsism_core::types::Message;
use solipsism_core::utils::timestamp;
use solipsism_providers::LlmProvider;

use crate::system::{join_elements, System};

/// Base prompt used when the prompt file cannot be read.
pub const MISSING_PROMPT: &str = "<error>Base prompt not found.</error>";

/// Stand-in for a model reply with no text.
pub const EMPTY_RESPONSE: &str = "<error>LLM response is empty or invalid.</error>";

/// Added when a turn produced no tool call, no `<wait>` and no `<finish>`.
pub const NUDGE: &str = "The system is waiting for your next action. \
Use a tool, or use `<wait>` to pause, or `<finish>` to terminate.";

/// Default bound on waiting for the first tool result of a turn.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(30);

static ASSISTANT_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<assistant[^>]*>").expect("assistant pattern is valid"));

static ASSISTANT_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</assistant>").expect("assistant pattern is valid"));

// ─────────────────────────────────────────────
// State
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    Idle,
    Running,
    Waiting,
    Terminated,
}

impl ContextState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextState::Idle => "idle",
            ContextState::Running => "running",
            ContextState::Waiting => "waiting",
            ContextState::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

// ─────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────

pub struct Context {
    id: String,
    parent_id: Option<String>,
    child_ids: RwLock<Vec<String>>,
    state: RwLock<ContextState>,
    turn_count: AtomicU32,
    history: RwLock<Vec<Element>>,
    base_prompt: String,
    system: System,
    /// `None` for endpoints, which receive messages but never run a loop.
    llm: Option<Arc<dyn LlmProvider>>,
    result_timeout: Duration,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("state", &self.state())
            .field("turn_count", &self.turn_count())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// A model-driven context. The system is bound to `id`.
    pub fn new(
        id: impl Into<String>,
        parent_id: Option<String>,
        llm: Arc<dyn LlmProvider>,
        system: System,
        base_prompt: impl Into<String>,
    ) -> Self {
        Self::build(id.into(), parent_id, Some(llm), system, base_prompt.into())
    }

    /// An endpoint: registered in the tree and reachable by `send`, but
    /// driven from outside instead of by a model.
    pub fn endpoint(id: impl Into<String>, system: System) -> Self {
        Self::build(id.into(), None, None, system, String::new())
    }

    fn build(
        id: String,
        parent_id: Option<String>,
        llm: Option<Arc<dyn LlmProvider>>,
        mut system: System,
        base_prompt: String,
    ) -> Self {
        system.set_context_id(id.clone());
        Self {
            id,
            parent_id,
            child_ids: RwLock::new(Vec::new()),
            state: RwLock::new(ContextState::Idle),
            turn_count: AtomicU32::new(0),
            history: RwLock::new(Vec::new()),
            base_prompt,
            system,
            llm,
            result_timeout: DEFAULT_RESULT_TIMEOUT,
        }
    }

    /// Builder: bound on waiting for the first tool result of a turn.
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    // ────────────── Observers ──────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn child_ids(&self) -> Vec<String> {
        read(&self.child_ids).clone()
    }

    pub fn has_child(&self, id: &str) -> bool {
        read(&self.child_ids).iter().any(|c| c == id)
    }

    pub fn add_child(&self, id: impl Into<String>) {
        write(&self.child_ids).push(id.into());
    }

    pub fn state(&self) -> ContextState {
        *read(&self.state)
    }

    fn set_state(&self, state: ContextState) {
        *write(&self.state) = state;
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the conversation so far.
    pub fn history(&self) -> Vec<Element> {
        read(&self.history).clone()
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn is_endpoint(&self) -> bool {
        self.llm.is_none()
    }

    /// Base prompt followed by the tool definitions.
    pub fn prompt(&self) -> String {
        format!("{}\n\n{}", self.base_prompt, self.system.get_tool_definitions())
    }

    /// Put an element on this context's queue.
    pub fn deliver(&self, element: Element) -> bool {
        self.system.enqueue(element)
    }

    // ────────────── History ──────────────

    fn add_to_history(&self, tag: &str, content: &str) {
        let entry = Element::with_text(tag, format!("\n{content}\n"))
            .attr("turn", self.turn_count().to_string())
            .attr("timestamp", timestamp());
        write(&self.history).push(entry);
    }

    fn advance_turn(&self) {
        self.turn_count.fetch_add(1, Ordering::SeqCst);
    }

    /// The request sent to the model: the prompt as the opening user
    /// message, then one message per history entry.
    pub fn build_request(&self) -> Vec<Message> {
        let mut request = vec![Message::user(self.prompt())];
        for entry in read(&self.history).iter() {
            match entry.tag.as_str() {
                "assistant" => request.push(Message::assistant(entry.to_string())),
                "system" => request.push(Message::user(entry.to_string())),
                other => warn!(context = %self.id, tag = other, "unsupported history entry skipped"),
            }
        }
        request
    }

    // ────────────── Turn loop ──────────────

    /// Run the turn loop until `<finish>`, cancellation, or `max_turns`.
    ///
    /// Only an idle, model-driven context starts; anything else logs a
    /// warning and returns. The context always ends `Terminated`, including
    /// when the future is dropped while waiting.
    pub async fn start(&self, initial_task: Option<&str>, max_turns: u32, turn_sleep: Duration) {
        let Some(llm) = self.llm.clone() else {
            warn!(context = %self.id, "endpoint contexts have no turn loop");
            return;
        };
        {
            let mut state = write(&self.state);
            if *state != ContextState::Idle {
                warn!(context = %self.id, state = %*state, "context is already running or finished");
                return;
            }
            *state = ContextState::Running;
        }
        let _terminate = TerminateOnExit(self);

        info!(context = %self.id, model = llm.model(), "starting context");

        let mut intro = format!("context id: {}", self.id);
        if let Some(parent) = &self.parent_id {
            intro.push_str(&format!("\nparent id: {parent}"));
        }
        if let Some(task) = initial_task {
            intro.push_str(&format!("\nTask: {task}"));
        }
        self.turn_count.store(1, Ordering::SeqCst);
        self.add_to_history("system", &intro);

        while self.turn_count() <= max_turns && self.state() != ContextState::Terminated {
            debug!(context = %self.id, turn = self.turn_count(), max_turns, "turn");

            if self.turn_count() > 1 && !turn_sleep.is_zero() {
                tokio::time::sleep(turn_sleep).await;
            }

            let reply = llm.generate(&self.build_request()).await;
            let raw = match reply.text() {
                Some(text) => text.to_string(),
                None => {
                    error!(context = %self.id, "LLM response is empty or in an unexpected format");
                    EMPTY_RESPONSE.to_string()
                }
            };
            let response = sanitize_response(&raw);
            debug!(context = %self.id, response = %response, "assistant response");
            self.add_to_history("assistant", &response);

            let exclude = self.system.excluded_tags();
            let tree = lpml::parse_with(
                &response,
                &ParseOptions {
                    strip: false,
                    exclude: &exclude,
                },
            );

            if has_tag(&tree, "finish") {
                info!(context = %self.id, "finish tag found, terminating");
                self.set_state(ContextState::Terminated);
                break;
            }

            let scheduled = self.system.process_llm_output(&response);

            let mut results = Vec::new();
            if scheduled > 0 || self.system.has_pending() {
                match self.system.recv_timeout(self.result_timeout).await {
                    Some(first) => results.push(first),
                    None => warn!(context = %self.id, timeout = ?self.result_timeout, "timed out waiting for the first tool result"),
                }
                results.extend(self.system.drain());
            }

            if !results.is_empty() {
                debug!(context = %self.id, count = results.len(), "collected results");
                self.advance_turn();
                self.add_to_history("system", &join_elements(&results));
                continue;
            }

            if has_tag(&tree, "wait") {
                info!(context = %self.id, "waiting for the next message");
                self.set_state(ContextState::Waiting);
                match self.system.recv().await {
                    Some(message) => {
                        info!(context = %self.id, "woken by a new message");
                        self.set_state(ContextState::Running);
                        self.advance_turn();
                        self.add_to_history("system", &message.to_string());
                        continue;
                    }
                    None => {
                        warn!(context = %self.id, "queue closed while waiting");
                        self.set_state(ContextState::Terminated);
                        break;
                    }
                }
            }

            debug!(context = %self.id, "no action taken, nudging");
            self.advance_turn();
            self.add_to_history("system", NUDGE);
        }

        if self.state() != ContextState::Terminated {
            warn!(context = %self.id, max_turns, "turn budget exhausted, terminating");
        }
        info!(context = %self.id, turns = self.turn_count(), "context loop finished");
    }
}

/// Marks the context `Terminated` when the loop exits by any path,
/// including the future being dropped mid-wait.
struct TerminateOnExit<'a>(&'a Context);

impl Drop for TerminateOnExit<'_> {
    fn drop(&mut self) {
        self.0.set_state(ContextState::Terminated);
    }
}

fn has_tag(tree: &[Node], tag: &str) -> bool {
    !lpml::findall(tree, tag).is_empty()
}

/// Strip any `<assistant>` wrapper the model echoed back.
pub fn sanitize_response(text: &str) -> String {
    let cleaned = ASSISTANT_OPEN_RE.replace_all(text, "");
    ASSISTANT_CLOSE_RE.replace_all(&cleaned, "").trim().to_string()
}

/// Read a base prompt file, falling back to [`MISSING_PROMPT`].
pub async fn load_base_prompt(path: &Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(prompt) => {
            debug!(path = %path.display(), "base prompt loaded");
            prompt
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "base prompt not readable");
            MISSING_PROMPT.to_string()
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
