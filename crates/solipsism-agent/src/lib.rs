//! Solipsism agent — contexts, their tools, and the tree that connects them.
//!
//! This crate contains:
//! - **tools**: the `Tool` trait, the static tool catalog, filesystem, shell and
//!   Python tools, runtime tool registration, and the intrinsic `send` /
//!   `create_context` tools
//! - **system**: per-context dispatcher that runs tool tags and queues results
//! - **context**: the turn-taking loop around one model conversation
//! - **manager**: context registry, creation, and parent/child message routing

pub mod context;
pub mod manager;
pub mod system;
pub mod tools;

pub use context::{Context, ContextState};
pub use manager::{ContextRequest, Manager, ManagerError, ManagerSettings};
pub use system::System;
pub use tools::{Tool, ToolCatalog, ToolConfig};
