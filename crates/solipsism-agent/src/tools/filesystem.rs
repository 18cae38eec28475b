//! Filesystem tools — list, read, write, create, move, delete.
//!
//! Relative paths resolve against the workspace. With
//! `restrict_to_workspace` set, anything resolving outside it is denied.
//! All disk access runs on the blocking pool.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use solipsism_core::lpml::Element;
use solipsism_core::utils::expand_home;

use super::base::{body, define_tag, flag_attr, line_attr, optional_attr, require_attr, Invocation, Tool, ToolOutput};
use super::catalog::ToolConfig;

// ─────────────────────────────────────────────
// Shared path helper
// ─────────────────────────────────────────────

/// Where a filesystem tool may operate.
#[derive(Clone, Debug)]
struct Sandbox {
    root: PathBuf,
    restrict: bool,
}

impl Sandbox {
    fn new(config: &ToolConfig) -> Self {
        Self {
            root: config.workspace.clone(),
            restrict: config.restrict_to_workspace,
        }
    }

    /// Resolve a model-supplied path.
    ///
    /// `..` is folded lexically before anything touches the disk, and the
    /// deepest existing ancestor is canonicalized so symlinks cannot hop out
    /// of the workspace.
    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        let expanded = expand_home(path);
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.root.join(expanded)
        };
        let resolved = canonicalize_existing(&normalize(&joined));

        if self.restrict {
            let root = canonicalize_existing(&normalize(&self.root));
            if !resolved.starts_with(&root) {
                anyhow::bail!(
                    "Access denied: path '{}' is outside the workspace '{}'",
                    path,
                    root.display()
                );
            }
        }
        Ok(resolved)
    }

    /// Run blocking filesystem work off the async scheduler. Path
    /// resolution touches the disk too, so `work` resolves inside the task.
    async fn run<F>(&self, work: F) -> anyhow::Result<String>
    where
        F: FnOnce(&Sandbox) -> anyhow::Result<String> + Send + 'static,
    {
        let sandbox = self.clone();
        tokio::task::spawn_blocking(move || work(&sandbox)).await?
    }
}

/// Fold `.` and `..` without consulting the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
fn canonicalize_existing(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    resolved
}

// ─────────────────────────────────────────────
// ListFilesTool
// ─────────────────────────────────────────────

pub struct ListFilesTool {
    sandbox: Sandbox,
}

impl ListFilesTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config),
        }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn definition(&self) -> String {
        define_tag(
            "list_files",
            "Lists all files and directories at the given path. Directories end with '/'.",
            &[("path (optional)", "The directory path. Defaults to the workspace root.")],
            "",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let shown = optional_attr(element, "path").unwrap_or(".").to_string();
        let text = self
            .sandbox
            .run(move |sandbox| {
                let path = sandbox.resolve(&shown)?;
                if !path.exists() {
                    anyhow::bail!("Path does not exist - '{shown}'");
                }
                if !path.is_dir() {
                    anyhow::bail!("Path is not a directory - '{shown}'");
                }
                let mut entries: Vec<String> = fs::read_dir(&path)?
                    .filter_map(|e| e.ok())
                    .map(|entry| {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                            format!("{name}/")
                        } else {
                            name
                        }
                    })
                    .collect();
                entries.sort();
                if entries.is_empty() {
                    Ok(format!("Directory '{shown}' is empty."))
                } else {
                    Ok(entries.join("\n"))
                }
            })
            .await?;
        Ok(ToolOutput::new(text))
    }
}

// ─────────────────────────────────────────────
// ReadFileTool
// ─────────────────────────────────────────────

pub struct ReadFileTool {
    sandbox: Sandbox,
}

impl ReadFileTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn definition(&self) -> String {
        define_tag(
            "read_file",
            "Reads the content of a specified file.",
            &[
                ("path (required)", "The path to the file."),
                (
                    "line_numbers (optional)",
                    "If \"true\", prepends line numbers to the output. Defaults to \"false\".",
                ),
            ],
            "",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let shown = require_attr(element, "path")?.to_string();
        let numbered = flag_attr(element, "line_numbers");
        let text = self
            .sandbox
            .run(move |sandbox| {
                let path = sandbox.resolve(&shown)?;
                if !path.exists() {
                    anyhow::bail!("File not found - '{shown}'");
                }
                if !path.is_file() {
                    anyhow::bail!("Path is not a file - '{shown}'");
                }
                let content = fs::read_to_string(&path)
                    .map_err(|e| anyhow::anyhow!("Failed to read '{shown}': {e}"))?;
                if !numbered {
                    return Ok(content);
                }
                Ok(content
                    .split_inclusive('\n')
                    .enumerate()
                    .map(|(i, line)| format!("{}: {line}", i + 1))
                    .collect())
            })
            .await?;
        Ok(ToolOutput::new(text))
    }
}

// ─────────────────────────────────────────────
// WriteFileTool
// ─────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriteMode {
    Overwrite,
    Append,
    ReplaceLines { start: usize, end: usize },
    InsertAtLine { line: usize },
}

impl WriteMode {
    fn from_element(element: &Element) -> anyhow::Result<Self> {
        match optional_attr(element, "mode").unwrap_or("overwrite") {
            "overwrite" => Ok(Self::Overwrite),
            "append" => Ok(Self::Append),
            "replace_lines" => {
                let start = line_attr(element, "start_line")?.unwrap_or(1);
                let end = line_attr(element, "end_line")?.unwrap_or(start);
                Ok(Self::ReplaceLines { start, end })
            }
            "insert_at_line" => Ok(Self::InsertAtLine {
                line: line_attr(element, "line")?.unwrap_or(1),
            }),
            other => anyhow::bail!("Unknown write mode '{other}'."),
        }
    }
}

pub struct WriteFileTool {
    sandbox: Sandbox,
}

impl WriteFileTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn definition(&self) -> String {
        define_tag(
            "write_file",
            "Writes or modifies a file. The content to be written is placed inside the tag.",
            &[
                ("path (required)", "The path to the file."),
                (
                    "mode (optional)",
                    "\"overwrite\", \"append\", \"replace_lines\", or \"insert_at_line\". Defaults to \"overwrite\".",
                ),
                ("start_line (for replace_lines)", "First line to replace (inclusive, 1-indexed)."),
                ("end_line (for replace_lines)", "Last line to replace (inclusive, 1-indexed)."),
                ("line (for insert_at_line)", "Line number at which to insert the content (1-indexed)."),
            ],
            "Example:\n    <write_file path=\"./memo.txt\" mode=\"append\">This is a new line.</write_file>\n    \
             <write_file path=\"./config.py\" mode=\"replace_lines\" start_line=\"5\" end_line=\"5\">API_KEY = \"new_key\"</write_file>",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let shown = require_attr(element, "path")?.to_string();
        let mode = WriteMode::from_element(element)?;
        let content = body(element);
        let text = self
            .sandbox
            .run(move |sandbox| {
                let path = sandbox.resolve(&shown)?;
                write_with_mode(&path, &shown, mode, &content)
            })
            .await?;
        Ok(ToolOutput::success(text))
    }
}

fn write_with_mode(path: &Path, shown: &str, mode: WriteMode, content: &str) -> anyhow::Result<String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match mode {
        WriteMode::Overwrite => {
            fs::write(path, content)?;
            Ok(format!(
                "Successfully overwrote {} characters to '{shown}'.",
                content.chars().count()
            ))
        }
        WriteMode::Append => {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(content.as_bytes())?;
            Ok(format!(
                "Successfully appended {} characters to '{shown}'.",
                content.chars().count()
            ))
        }
        WriteMode::ReplaceLines { start, end } => {
            if !path.exists() {
                anyhow::bail!("File not found for mode 'replace_lines' - '{shown}'");
            }
            let lines = read_lines(path)?;
            if start == 0 || start > end || end > lines.len() {
                anyhow::bail!("Line range {start}-{end} is out of bounds.");
            }
            let mut updated = lines[..start - 1].to_vec();
            updated.push(format!("{content}\n"));
            updated.extend_from_slice(&lines[end..]);
            fs::write(path, updated.concat())?;
            Ok(format!("Successfully modified '{shown}' with mode 'replace_lines'."))
        }
        WriteMode::InsertAtLine { line } => {
            let mut lines = if path.exists() {
                read_lines(path)?
            } else if line == 1 {
                Vec::new()
            } else {
                anyhow::bail!("File not found for mode 'insert_at_line' - '{shown}'");
            };
            if line == 0 || line > lines.len() + 1 {
                anyhow::bail!("Line number {line} is out of bounds for insertion.");
            }
            lines.insert(line - 1, format!("{content}\n"));
            fs::write(path, lines.concat())?;
            Ok(format!("Successfully modified '{shown}' with mode 'insert_at_line'."))
        }
    }
}

/// Lines with their terminators kept.
fn read_lines(path: &Path) -> anyhow::Result<Vec<String>> {
    Ok(fs::read_to_string(path)?
        .split_inclusive('\n')
        .map(str::to_string)
        .collect())
}

// ─────────────────────────────────────────────
// CreateDirectoryTool
// ─────────────────────────────────────────────

pub struct CreateDirectoryTool {
    sandbox: Sandbox,
}

impl CreateDirectoryTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config),
        }
    }
}

#[async_trait]
impl Tool for CreateDirectoryTool {
    fn name(&self) -> &str {
        "create_directory"
    }

    fn definition(&self) -> String {
        define_tag(
            "create_directory",
            "Creates a directory, including any missing parents.",
            &[("path (required)", "The directory to create.")],
            "",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let shown = require_attr(element, "path")?.to_string();
        let text = self
            .sandbox
            .run(move |sandbox| {
                let path = sandbox.resolve(&shown)?;
                if path.is_file() {
                    anyhow::bail!("A file already exists at '{shown}'");
                }
                fs::create_dir_all(&path)?;
                Ok(format!("Successfully created directory '{shown}'."))
            })
            .await?;
        Ok(ToolOutput::success(text))
    }
}

// ─────────────────────────────────────────────
// MoveItemTool
// ─────────────────────────────────────────────

pub struct MoveItemTool {
    sandbox: Sandbox,
}

impl MoveItemTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config),
        }
    }
}

#[async_trait]
impl Tool for MoveItemTool {
    fn name(&self) -> &str {
        "move_item"
    }

    fn definition(&self) -> String {
        define_tag(
            "move_item",
            "Moves or renames a file or directory.",
            &[
                ("source (required)", "The item to move."),
                ("destination (required)", "The new path. Must not already exist."),
            ],
            "",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let source_shown = require_attr(element, "source")?.to_string();
        let dest_shown = require_attr(element, "destination")?.to_string();
        let text = self
            .sandbox
            .run(move |sandbox| {
                let source = sandbox.resolve(&source_shown)?;
                let destination = sandbox.resolve(&dest_shown)?;
                if !source.exists() {
                    anyhow::bail!("Source not found - '{source_shown}'");
                }
                if destination.exists() {
                    anyhow::bail!("Destination already exists - '{dest_shown}'");
                }
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&source, &destination)?;
                debug!(from = %source.display(), to = %destination.display(), "moved item");
                Ok(format!("Successfully moved '{source_shown}' to '{dest_shown}'."))
            })
            .await?;
        Ok(ToolOutput::success(text))
    }
}

// ─────────────────────────────────────────────
// DeleteItemTool
// ─────────────────────────────────────────────

pub struct DeleteItemTool {
    sandbox: Sandbox,
}

impl DeleteItemTool {
    pub fn new(config: &ToolConfig) -> Self {
        Self {
            sandbox: Sandbox::new(config),
        }
    }
}

#[async_trait]
impl Tool for DeleteItemTool {
    fn name(&self) -> &str {
        "delete_item"
    }

    fn definition(&self) -> String {
        define_tag(
            "delete_item",
            "Deletes a file or directory.",
            &[
                ("path (required)", "The item to delete."),
                (
                    "recursive (optional)",
                    "Must be \"true\" to delete a non-empty directory. Defaults to \"false\".",
                ),
            ],
            "",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let shown = require_attr(element, "path")?.to_string();
        let recursive = flag_attr(element, "recursive");
        let text = self
            .sandbox
            .run(move |sandbox| {
                let path = sandbox.resolve(&shown)?;
                let root = sandbox.resolve(".")?;
                if path == root {
                    anyhow::bail!("Refusing to delete the workspace root");
                }
                if !path.exists() {
                    anyhow::bail!("Path does not exist - '{shown}'");
                }
                if path.is_dir() {
                    if recursive {
                        fs::remove_dir_all(&path)?;
                    } else {
                        fs::remove_dir(&path).map_err(|e| {
                            anyhow::anyhow!("Cannot delete directory '{shown}' ({e}). Use recursive=\"true\".")
                        })?;
                    }
                } else {
                    fs::remove_file(&path)?;
                }
                Ok(format!("Successfully deleted '{shown}'."))
            })
            .await?;
        Ok(ToolOutput::success(text))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
