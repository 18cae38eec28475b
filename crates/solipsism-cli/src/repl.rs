//! Interactive chat with the context tree.
//!
//! Input is read with `rustyline` on its own thread while a listener task
//! prints whatever reaches the user endpoint. Plain lines are sent to the
//! current target through the endpoint's own `send` tool.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use rustyline::config::Configurer;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{DefaultEditor, Editor};
use tokio::sync::mpsc;
use tracing::debug;

use solipsism_agent::tools::Invocation;
use solipsism_agent::{Context, Manager};
use solipsism_core::lpml::Element;

use crate::helpers::{self, PROMPT};
use crate::USER_ID;

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Exit,
    Help,
    List,
    Target(Option<&'a str>),
    Unknown(&'a str),
    Message(&'a str),
}

fn parse_command(input: &str) -> Command<'_> {
    if !input.starts_with('/') {
        return match input.to_lowercase().as_str() {
            "exit" | "quit" => Command::Exit,
            _ => Command::Message(input),
        };
    }
    let mut parts = input.split_whitespace();
    match parts.next().unwrap_or_default() {
        "/exit" | "/quit" => Command::Exit,
        "/help" => Command::Help,
        "/list" => Command::List,
        "/target" => Command::Target(parts.next()),
        other => Command::Unknown(other),
    }
}

/// Run the chat until `/exit`, Ctrl-C, or Ctrl-D.
pub async fn run(manager: Arc<Manager>, user: Arc<Context>, initial_target: String) -> Result<()> {
    helpers::print_banner();
    println!("Auto-targeting the root context: '{initial_target}'");

    let send = user
        .system()
        .get_tool("send")
        .context("the user endpoint has no send tool")?;
    let listener = tokio::spawn(listen(Arc::clone(&user)));

    let mut target = initial_target;
    let mut reader = LineReader::spawn();

    while let Some(line) = reader.next().await {
        let input = match line {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                helpers::print_error(&format!("input error: {e}"));
                break;
            }
        };

        match parse_command(input.trim()) {
            Command::Exit => break,
            Command::Message("") => {}
            Command::Help => helpers::print_help(),
            Command::List => print_contexts(&manager, &target),
            Command::Target(None) => println!("Usage: /target <context_id>"),
            Command::Target(Some(id)) => match manager.get_context(id) {
                Some(ctx) if !ctx.is_endpoint() => {
                    target = id.to_string();
                    println!("Target set to '{target}'.");
                }
                _ => helpers::print_warning(&format!("no context with ID '{id}'")),
            },
            Command::Unknown(cmd) => println!("Unknown command: {cmd}"),
            Command::Message(text) => {
                let element = Element::with_text("send", format!("\n{text}\n")).attr("to", target.as_str());
                match send.run(&element, &Invocation::new(USER_ID)).await {
                    Ok(_) => debug!(to = %target, "message sent"),
                    Err(e) => helpers::print_error(&e.to_string()),
                }
            }
        }
        reader.resume();
    }

    listener.abort();
    reader.finish().await;
    println!("\nGoodbye!");
    Ok(())
}

// ─────────────────────────────────────────────
// Line reader
// ─────────────────────────────────────────────

/// `rustyline` on a dedicated thread. The next prompt is shown only after
/// the previous line was handled.
struct LineReader {
    lines: mpsc::Receiver<rustyline::Result<String>>,
    resume: std::sync::mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

impl LineReader {
    fn spawn() -> Self {
        let (line_tx, lines) = mpsc::channel(1);
        let (resume, resume_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::spawn(move || {
            let mut editor = match create_editor() {
                Ok(editor) => editor,
                Err(e) => {
                    let _ = line_tx.blocking_send(Err(e));
                    return;
                }
            };
            loop {
                let line = editor.readline(PROMPT);
                if let Ok(text) = &line {
                    if !text.trim().is_empty() {
                        let _ = editor.add_history_entry(text.trim());
                    }
                }
                let stop = line.is_err();
                if line_tx.blocking_send(line).is_err() || stop {
                    break;
                }
                if resume_rx.recv().is_err() {
                    break;
                }
            }
            save_history(&mut editor);
        });

        Self { lines, resume, thread }
    }

    async fn next(&mut self) -> Option<rustyline::Result<String>> {
        self.lines.recv().await
    }

    /// Let the reader show the next prompt.
    fn resume(&self) {
        let _ = self.resume.send(());
    }

    /// Stop the reader and wait for it to save history.
    async fn finish(self) {
        let Self { lines, resume, thread } = self;
        drop(resume);
        drop(lines);
        if tokio::task::spawn_blocking(move || thread.join()).await.is_err() {
            debug!("line reader thread did not exit cleanly");
        }
    }
}

/// Print everything that arrives on the user endpoint.
async fn listen(user: Arc<Context>) {
    while let Some(element) = user.system().recv().await {
        helpers::print_incoming(&element);
    }
    debug!("user endpoint queue closed");
}

fn print_contexts(manager: &Manager, target: &str) {
    println!();
    for id in manager.context_ids() {
        let Some(ctx) = manager.get_context(&id) else {
            continue;
        };
        if ctx.is_endpoint() {
            continue;
        }
        let marker = if id == target { "*" } else { " " };
        println!(
            "{marker} {id:<10} {:<10} parent: {}",
            ctx.state(),
            ctx.parent_id().unwrap_or("-")
        );
    }
    println!();
}

/// Create a rustyline editor with persistent history.
fn create_editor() -> rustyline::Result<Editor<(), DefaultHistory>> {
    let mut editor = DefaultEditor::new()?;
    editor.set_max_history_size(1000)?;

    let history_path = history_path();
    if history_path.exists() {
        let _ = editor.load_history(&history_path);
        debug!("loaded REPL history from {}", history_path.display());
    }

    Ok(editor)
}

fn save_history(editor: &mut Editor<(), DefaultHistory>) {
    let path = history_path();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = editor.save_history(&path) {
        debug!("failed to save history: {e}");
    }
}

fn history_path() -> std::path::PathBuf {
    solipsism_core::utils::get_data_path().join("history").join("cli_history")
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
