//! Shared CLI helpers — banner, warnings, and rendering of incoming messages.

use std::io::Write;

use colored::Colorize;

use solipsism_core::lpml::Element;

/// Prompt shown by the chat REPL.
pub const PROMPT: &str = ">>> ";

/// Print the banner shown at REPL start.
pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!("{}  v{}", "Solipsism".cyan().bold(), version.dimmed());
    println!("{}", "Type a message, or /help for commands.".dimmed());
    println!();
}

pub fn print_help() {
    println!();
    println!("{}", "Chat commands".bold());
    println!("  /target <context_id>  Set the context your messages go to");
    println!("  /list                 List contexts and their states");
    println!("  /help                 Show this help");
    println!("  /exit                 Stop every context and quit");
    println!();
}

pub fn print_warning(message: &str) {
    eprintln!("{} {message}", "warning:".yellow().bold());
}

pub fn print_error(message: &str) {
    eprintln!("{} {message}", "error:".red().bold());
}

/// Render an element that arrived on the user endpoint's queue.
///
/// Messages show their sender; anything else is printed as raw LPML.
pub fn format_incoming(element: &Element) -> String {
    if element.tag == "send" {
        let from = element.get_attr("from").unwrap_or("unknown");
        format!("[from {from}]\n{}", element.text().trim())
    } else {
        format!("[system]\n{element}")
    }
}

/// Print an incoming element over the current input line, then redraw the prompt.
pub fn print_incoming(element: &Element) {
    let text = format_incoming(element);
    let (header, body) = text.split_once('\n').unwrap_or((text.as_str(), ""));
    print!("\r{}\r", " ".repeat(80));
    println!("{}\n{body}\n", header.cyan().bold());
    print!("{PROMPT}");
    let _ = std::io::stdout().flush();
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
