//! Tool catalog — the tools a context may be granted, by name.
//!
//! The catalog is a static list of factories. Every factory receives the
//! same [`ToolConfig`] and builds a fresh tool instance, so per-tool state
//! (such as a shell session) belongs to exactly one context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use solipsism_core::config::Config;
use solipsism_core::utils::expand_home;

use super::base::Tool;
use super::filesystem::{
    CreateDirectoryTool, DeleteItemTool, ListFilesTool, MoveItemTool, ReadFileTool, WriteFileTool,
};
use super::python::PythonTool;
use super::shell::BashTool;

/// Settings shared by every tool factory. Tools ignore what they don't use.
#[derive(Clone, Debug)]
pub struct ToolConfig {
    /// Root directory for relative paths and the shell's working directory.
    pub workspace: PathBuf,
    /// Deny paths that resolve outside `workspace`.
    pub restrict_to_workspace: bool,
    /// Per-snippet limit for the shell and Python sessions.
    pub shell_timeout: Duration,
}

impl ToolConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace: expand_home(&config.agents.defaults.workspace),
            restrict_to_workspace: config.tools.restrict_to_workspace,
            shell_timeout: Duration::from_secs(config.tools.shell.timeout_secs),
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Builds one tool instance.
pub type ToolFactory = Box<dyn Fn(&ToolConfig) -> anyhow::Result<Arc<dyn Tool>> + Send + Sync>;

/// Named tool factories plus the config they are built with.
pub struct ToolCatalog {
    factories: Vec<(String, ToolFactory)>,
    config: ToolConfig,
}

impl ToolCatalog {
    /// An empty catalog.
    pub fn new(config: ToolConfig) -> Self {
        Self {
            factories: Vec::new(),
            config,
        }
    }

    /// Every built-in tool: filesystem operations plus the persistent shell
    /// and Python sessions.
    pub fn builtin(config: ToolConfig) -> Self {
        let mut catalog = Self::new(config);
        catalog.register("list_files", |c| Ok(Arc::new(ListFilesTool::new(c))));
        catalog.register("read_file", |c| Ok(Arc::new(ReadFileTool::new(c))));
        catalog.register("write_file", |c| Ok(Arc::new(WriteFileTool::new(c))));
        catalog.register("create_directory", |c| Ok(Arc::new(CreateDirectoryTool::new(c))));
        catalog.register("move_item", |c| Ok(Arc::new(MoveItemTool::new(c))));
        catalog.register("delete_item", |c| Ok(Arc::new(DeleteItemTool::new(c))));
        catalog.register("bash", |c| Ok(Arc::new(BashTool::new(c))));
        catalog.register("python", |c| Ok(Arc::new(PythonTool::new(c))));
        catalog
    }

    /// Add or replace a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ToolConfig) -> anyhow::Result<Arc<dyn Tool>> + Send + Sync + 'static,
    {
        let name = name.into();
        let factory: ToolFactory = Box::new(factory);
        match self.factories.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = factory,
            None => self.factories.push((name, factory)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| n == name)
    }

    /// Catalog names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Build a fresh instance. `None` if the name is not in the catalog.
    pub fn build(&self, name: &str) -> Option<anyhow::Result<Arc<dyn Tool>>> {
        self.factories
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, factory)| factory(&self.config))
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ToolConfig {
        ToolConfig {
            workspace: std::env::temp_dir(),
            restrict_to_workspace: true,
            shell_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_builtin_names() {
        let catalog = ToolCatalog::builtin(config());
        assert_eq!(
            catalog.names(),
            vec![
                "list_files",
                "read_file",
                "write_file",
                "create_directory",
                "move_item",
                "delete_item",
                "bash",
                "python"
            ]
        );
    }

    #[test]
    fn test_build_matches_name() {
        let catalog = ToolCatalog::builtin(config());
        for name in catalog.names() {
            let tool = catalog.build(&name).unwrap().unwrap();
            assert_eq!(tool.name(), name);
            assert!(tool.definition().contains(&format!("name=\"{name}\"")));
        }
    }

    #[test]
    fn test_unknown_name() {
        let catalog = ToolCatalog::builtin(config());
        assert!(catalog.build("teleport").is_none());
        assert!(!catalog.contains("teleport"));
    }

    #[test]
    fn test_failing_factory_reports_error() {
        let mut catalog = ToolCatalog::new(config());
        catalog.register("broken", |_| anyhow::bail!("no backend"));
        let err = catalog.build("broken").unwrap().err().unwrap();
        assert_eq!(err.to_string(), "no backend");
    }

    #[test]
    fn test_config_from_defaults() {
        let c = ToolConfig::default();
        assert!(c.restrict_to_workspace);
        assert_eq!(c.shell_timeout, Duration::from_secs(60));
        assert!(c.workspace.ends_with(".solipsism/workspace"));
    }
}
