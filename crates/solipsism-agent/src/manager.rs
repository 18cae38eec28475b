//! Manager — the registry of contexts and the router between them.
//!
//! Contexts form a tree: every context but the root has one parent, and
//! messages may only travel along a parent/child edge. The manager owns
//! every context by id; contexts refer to each other only by id, and the
//! intrinsic `send`/`create_context` tools hold a weak handle back here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use solipsism_core::config::Config;
use solipsism_core::lpml::Element;
use solipsism_core::utils::{expand_home, get_default_prompt_path, short_id};
use solipsism_providers::{ModelSettings, ProviderError, ProviderFactory};

use crate::context::{load_base_prompt, Context, DEFAULT_RESULT_TIMEOUT};
use crate::system::System;
use crate::tools::base::Tool;
use crate::tools::catalog::ToolCatalog;
use crate::tools::create_context::CreateContextTool;
use crate::tools::registration::{ListAvailableToolsTool, RegisterTool};
use crate::tools::send::SendTool;

/// Granted to every model-driven context.
const INTRINSIC_TOOLS: &[&str] = &["send", "create_context"];

/// Grantable like catalog tools, but built around a handle to the manager.
const MANAGER_TOOLS: &[&str] = &["list_available_tools", "register_tool"];

// ─────────────────────────────────────────────
// Errors and settings
// ─────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Context ID '{0}' already exists.")]
    IdCollision(String),

    #[error("could not build an LLM provider: {0}")]
    Provider(#[from] ProviderError),
}

/// Defaults applied to every context the manager starts.
#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub max_turns: u32,
    pub turn_sleep: Duration,
    pub result_timeout: Duration,
    pub prompt_path: PathBuf,
}

impl ManagerSettings {
    pub fn from_config(config: &Config) -> Self {
        let defaults = &config.agents.defaults;
        let prompt_path = if defaults.prompt_path.is_empty() {
            get_default_prompt_path()
        } else {
            expand_home(&defaults.prompt_path)
        };
        Self {
            max_turns: defaults.max_turns,
            turn_sleep: Duration::try_from_secs_f64(defaults.turn_sleep).unwrap_or(Duration::ZERO),
            result_timeout: Duration::from_secs(defaults.result_timeout_secs),
            prompt_path,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_turns: 100,
            turn_sleep: Duration::from_secs(5),
            result_timeout: DEFAULT_RESULT_TIMEOUT,
            prompt_path: get_default_prompt_path(),
        }
    }
}

/// Everything needed to create a context.
#[derive(Clone, Debug, Default)]
pub struct ContextRequest {
    pub parent_id: String,
    pub task: String,
    /// Catalog tools to grant; `send` and `create_context` are always added.
    pub tool_names: Vec<String>,
    /// Use this id instead of a generated one. Must be unused.
    pub custom_id: Option<String>,
    pub model: ModelSettings,
    /// Base prompt file; `None` uses the configured default.
    pub prompt_path: Option<PathBuf>,
}

// ─────────────────────────────────────────────
// Manager
// ─────────────────────────────────────────────

pub struct Manager {
    contexts: RwLock<HashMap<String, Arc<Context>>>,
    /// Turn loops started by this manager.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    catalog: ToolCatalog,
    providers: Arc<dyn ProviderFactory>,
    settings: ManagerSettings,
}

impl Manager {
    pub fn new(
        catalog: ToolCatalog,
        providers: Arc<dyn ProviderFactory>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            contexts: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            catalog,
            providers,
            settings,
        })
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    // ────────────── Registry ──────────────

    /// Register a context. Returns `false` (and keeps the existing one) if
    /// the id is taken.
    pub fn add_context(&self, context: Arc<Context>) -> bool {
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        if contexts.contains_key(context.id()) {
            warn!(context = context.id(), "context id already registered");
            return false;
        }
        debug!(context = context.id(), "context registered");
        contexts.insert(context.id().to_string(), context);
        true
    }

    pub fn get_context(&self, id: &str) -> Option<Arc<Context>> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Registered ids, sorted.
    pub fn context_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// The tools every context gets regardless of what it asked for.
    pub fn intrinsic_tools(self: &Arc<Self>) -> [Arc<dyn Tool>; 2] {
        [
            Arc::new(SendTool::new(Arc::downgrade(self))),
            Arc::new(CreateContextTool::new(Arc::downgrade(self))),
        ]
    }

    /// Every name a context may be granted: the catalog plus the tool
    /// management tools.
    pub fn grantable_tools(&self) -> Vec<String> {
        let mut names = self.catalog.names();
        names.extend(MANAGER_TOOLS.iter().map(|name| name.to_string()));
        names
    }

    /// Build a fresh instance of a grantable tool. `None` for unknown names.
    pub fn build_tool(self: &Arc<Self>, name: &str) -> Option<anyhow::Result<Arc<dyn Tool>>> {
        let manager = Arc::downgrade(self);
        let tool: Arc<dyn Tool> = match name {
            "list_available_tools" => Arc::new(ListAvailableToolsTool::new(manager)),
            "register_tool" => Arc::new(RegisterTool::new(manager)),
            _ => return self.catalog.build(name),
        };
        Some(Ok(tool))
    }

    /// Register an endpoint context (such as the interactive user) that can
    /// `send` but has no model behind it.
    pub fn add_endpoint(self: &Arc<Self>, id: &str) -> Option<Arc<Context>> {
        let system = System::new();
        system.add_tool(Arc::new(SendTool::new(Arc::downgrade(self))));
        let endpoint = Arc::new(Context::endpoint(id, system));
        self.add_context(Arc::clone(&endpoint)).then_some(endpoint)
    }

    // ────────────── Creation ──────────────

    /// Build, link and register a context without starting it.
    pub async fn build_context(self: &Arc<Self>, request: &ContextRequest) -> Result<Arc<Context>, ManagerError> {
        if let Some(id) = &request.custom_id {
            if self.get_context(id).is_some() {
                return Err(ManagerError::IdCollision(id.clone()));
            }
        }

        let llm = self.providers.build(&request.model)?;

        let system = System::new();
        for name in &request.tool_names {
            if INTRINSIC_TOOLS.contains(&name.as_str()) {
                continue;
            }
            match self.build_tool(name) {
                Some(Ok(tool)) => system.add_tool(tool),
                Some(Err(e)) => warn!(tool = %name, error = %e, "tool factory failed, skipping"),
                None => warn!(tool = %name, "tool not found in catalog, skipping"),
            }
        }
        for tool in self.intrinsic_tools() {
            system.add_tool(tool);
        }

        let prompt_path = request
            .prompt_path
            .clone()
            .unwrap_or_else(|| self.settings.prompt_path.clone());
        let base_prompt = load_base_prompt(&prompt_path).await;

        let id = request.custom_id.clone().unwrap_or_else(short_id);
        let context = Arc::new(
            Context::new(id.clone(), Some(request.parent_id.clone()), llm, system, base_prompt)
                .with_result_timeout(self.settings.result_timeout),
        );

        // The prompt load awaited; the id may have been taken meanwhile.
        if !self.add_context(Arc::clone(&context)) {
            return Err(ManagerError::IdCollision(id));
        }
        match self.get_context(&request.parent_id) {
            Some(parent) => parent.add_child(id.as_str()),
            None => warn!(parent = %request.parent_id, child = %id, "parent context not registered"),
        }
        Ok(context)
    }

    /// Create a child context and start its loop in the background.
    ///
    /// Returns as soon as the context is registered.
    pub async fn create_new_context(self: &Arc<Self>, request: ContextRequest) -> Result<Arc<Context>, ManagerError> {
        info!(parent = %request.parent_id, "context creation requested");
        let context = self.build_context(&request).await?;

        let initial_task = format!(
            "You were created by context '{}'. Your parent is your sole point of contact.\nYour task is: {}",
            request.parent_id, request.task
        );
        self.spawn(Arc::clone(&context), initial_task);

        info!(context = context.id(), parent = %request.parent_id, "context created and started");
        Ok(context)
    }

    /// Start a context's loop on the runtime with the configured budget.
    pub fn spawn(&self, context: Arc<Context>, initial_task: String) {
        let max_turns = self.settings.max_turns;
        let turn_sleep = self.settings.turn_sleep;
        let handle = tokio::spawn(async move {
            context.start(Some(&initial_task), max_turns, turn_sleep).await;
        });
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Cancel every running loop. Waiting contexts end `Terminated`.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        info!(count = tasks.len(), "stopping context loops");
        for task in tasks {
            task.abort();
        }
    }

    // ────────────── Routing ──────────────

    /// Deliver `element` from one context to another.
    ///
    /// Only parent/child edges are allowed. Returns `false` when either id is
    /// unknown or the route is denied; the target is untouched in both cases.
    pub fn route_message(&self, from_id: &str, to_id: &str, element: Element) -> bool {
        let (Some(from), Some(to)) = (self.get_context(from_id), self.get_context(to_id)) else {
            warn!(from = from_id, to = to_id, "routing failed: context not found");
            return false;
        };

        let to_parent = from.parent_id() == Some(to_id);
        let to_child = from.has_child(to_id);
        if !(to_parent || to_child) {
            warn!(from = from_id, to = to_id, "routing denied: no parent/child relationship");
            return false;
        }

        if !to.deliver(element) {
            warn!(from = from_id, to = to_id, "routing failed: destination queue closed");
            return false;
        }
        debug!(from = from_id, to = to_id, "element routed");
        true
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
