//! Tool modules for Solipsism contexts.

pub mod base;
pub mod catalog;
pub mod create_context;
pub mod filesystem;
pub mod python;
pub mod registration;
pub mod send;
mod session;
pub mod shell;

pub use base::{Invocation, Tool, ToolOutput};
pub use catalog::{ToolCatalog, ToolConfig};
