//! Shell tool — scripts run in one persistent `bash` session.
//!
//! The session keeps its working directory and environment between
//! invocations. A timed-out or dead session is discarded and restarted on
//! the next call.

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use solipsism_core::lpml::Element;

use super::base::{body, define_tag, flag_attr, Invocation, Tool, ToolOutput};
use super::catalog::ToolConfig;
use super::session::{Launcher, ScriptOutput, SessionSlot, EOC_MARKER};

/// Maximum output length before truncation (characters).
const MAX_OUTPUT_LEN: usize = 10_000;

/// Dangerous command patterns that are always blocked.
const DENY_PATTERNS: &[&str] = &[
    r"\brm\s+-[rf]{1,2}\s+/(\s|$)",
    r"\bdel\s+/[fq]\b",
    r"\brmdir\s+/s\b",
    r"\b(format|mkfs|diskpart)\b",
    r"\bdd\s+if=",
    r">\s*/dev/sd",
    r"\b(shutdown|reboot|poweroff)\b",
    r":\(\)\s*\{.*\};\s*:", // fork bomb
];

// ─────────────────────────────────────────────
// BashTool
// ─────────────────────────────────────────────

/// Runs bash scripts in a session owned by this tool instance.
pub struct BashTool {
    /// If true, block scripts that traverse upwards with `../`.
    restrict_to_workspace: bool,
    deny_regexes: Vec<Regex>,
    session: SessionSlot,
}

impl BashTool {
    /// The session itself is started lazily on first use.
    pub fn new(config: &ToolConfig) -> Self {
        let deny_regexes = DENY_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        let launcher = Launcher {
            label: "bash",
            program: "bash",
            args: vec!["--noprofile".into(), "--norc".into()],
            working_dir: config.workspace.clone(),
        };
        Self {
            restrict_to_workspace: config.restrict_to_workspace,
            deny_regexes,
            session: SessionSlot::new(launcher, config.shell_timeout),
        }
    }

    /// Reject scripts matching a deny pattern. Returns the reason.
    fn guard_script(&self, script: &str) -> Option<String> {
        let lower = script.to_lowercase();
        if self.deny_regexes.iter().any(|re| re.is_match(&lower)) {
            warn!(script = script, "script blocked by safety guard");
            return Some("Script blocked by safety guard (dangerous pattern detected)".into());
        }
        if self.restrict_to_workspace && (script.contains("../") || script.contains("..\\")) {
            return Some("Script blocked: path traversal (../) is not allowed in restricted mode".into());
        }
        None
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn definition(&self) -> String {
        define_tag(
            "bash",
            "Executes a bash script within a persistent shell session. The content of the tag is \
             the script. The session keeps state (current directory, environment variables) \
             across calls.",
            &[(
                "reset (optional)",
                "If \"true\", restarts the shell session before running the script. Defaults to \"false\".",
            )],
            "Example:\n    <bash>cd src && ls</bash>",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let script = body(element).trim().to_string();
        if script.is_empty() {
            anyhow::bail!("Bash script content is missing.");
        }
        if let Some(reason) = self.guard_script(&script) {
            anyhow::bail!(reason);
        }

        debug!(script = %script, "running bash script");
        let framed = format!("{script}\necho \"{EOC_MARKER}$?\"\necho {EOC_MARKER} >&2\n");
        let output = self
            .session
            .execute(framed.as_bytes(), flag_attr(element, "reset"))
            .await?;

        Ok(ToolOutput::new(format_report(&script, &output)))
    }
}

fn format_report(script: &str, output: &ScriptOutput) -> String {
    let mut report = format!("Bash script executed:\n```bash\n{script}\n```\n");
    if !output.stdout.is_empty() {
        report.push_str(&format!("STDOUT:\n{}\n", output.stdout));
    }
    if !output.stderr.is_empty() {
        report.push_str(&format!("STDERR:\n{}\n", output.stderr));
    }
    if output.stdout.is_empty() && output.stderr.is_empty() {
        report.push_str("No output from script.\n");
    }
    match output.exit_code {
        Some(0) => {}
        Some(code) => report.push_str(&format!("Exit code: {code}\n")),
        None => {}
    }

    if report.len() > MAX_OUTPUT_LEN {
        let mut cut = MAX_OUTPUT_LEN;
        while !report.is_char_boundary(cut) {
            cut -= 1;
        }
        let remaining = report.len() - cut;
        report.truncate(cut);
        report.push_str(&format!("\n... (truncated, {remaining} more bytes)"));
    }
    report.trim_end().to_string()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
