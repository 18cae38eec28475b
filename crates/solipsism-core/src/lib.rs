//! Solipsism core — the LPML protocol, model message types, configuration,
//! and shared helpers. Everything here is synchronous and runtime-agnostic.

pub mod config;
pub mod lpml;
pub mod types;
pub mod utils;
