//! Python tool — a stateful REPL backed by one `python3` process.
//!
//! A small driver reads one base64-encoded snippet per line, executes it in
//! a namespace that lives as long as the process, and prints the session
//! markers when done. Variables and imports therefore survive between
//! calls until the session is reset or times out.

use async_trait::async_trait;
use base64::Engine;
use tracing::debug;

use solipsism_core::lpml::Element;

use super::base::{body, define_tag, flag_attr, Invocation, Tool, ToolOutput};
use super::catalog::ToolConfig;
use super::session::{Launcher, ScriptOutput, SessionSlot, EOC_MARKER};

/// Executed with `python3 -u -c`. Exceptions, `SystemExit` included, are
/// printed as tracebacks and do not end the session.
const DRIVER: &str = r#"
import base64, sys, traceback
MARKER = sys.argv[1]
ns = {"__name__": "__console__"}
while True:
    line = sys.stdin.readline()
    if not line:
        break
    status = 0
    try:
        code = base64.b64decode(line.strip()).decode("utf-8")
        exec(compile(code, "<python>", "exec"), ns)
    except BaseException:
        traceback.print_exc()
        status = 1
    sys.stdout.flush()
    sys.stderr.flush()
    sys.__stdout__.write(MARKER + str(status) + "\n")
    sys.__stdout__.flush()
    sys.__stderr__.write(MARKER + "\n")
    sys.__stderr__.flush()
"#;

pub struct PythonTool {
    session: SessionSlot,
}

impl PythonTool {
    /// The interpreter is started on first use.
    pub fn new(config: &ToolConfig) -> Self {
        let launcher = Launcher {
            label: "python",
            program: "python3",
            args: vec![
                "-u".into(),
                "-c".into(),
                DRIVER.into(),
                EOC_MARKER.into(),
            ],
            working_dir: config.workspace.clone(),
        };
        Self {
            session: SessionSlot::new(launcher, config.shell_timeout),
        }
    }
}

#[async_trait]
impl Tool for PythonTool {
    fn name(&self) -> &str {
        "python"
    }

    fn definition(&self) -> String {
        define_tag(
            "python",
            "Executes Python code in a stateful REPL session. The content of the tag is the code \
             to be executed. Variables and imports are preserved across calls within the same context.",
            &[(
                "reset (optional)",
                "If \"true\", starts a fresh interpreter before running the code. Defaults to \"false\".",
            )],
            "Example:\n    <python>import math\nprint(math.sqrt(2))</python>",
        )
    }

    async fn run(&self, element: &Element, _: &Invocation) -> anyhow::Result<ToolOutput> {
        let code = body(element).trim().to_string();
        if code.is_empty() {
            anyhow::bail!("No code provided to execute.");
        }

        debug!(code = %code, "running python code");
        let mut framed = base64::engine::general_purpose::STANDARD.encode(code.as_bytes());
        framed.push('\n');
        let output = self
            .session
            .execute(framed.as_bytes(), flag_attr(element, "reset"))
            .await?;
        Ok(ToolOutput::new(format_report(&output)))
    }
}

fn format_report(output: &ScriptOutput) -> String {
    let mut report = String::new();
    if !output.stdout.is_empty() {
        report.push_str(&format!("--- stdout ---\n{}\n", output.stdout));
    }
    if !output.stderr.is_empty() {
        report.push_str(&format!("--- stderr ---\n{}\n", output.stderr));
    }
    if report.is_empty() {
        return "[No output]".into();
    }
    report.trim_end().to_string()
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn tool(dir: &std::path::Path, timeout_secs: u64) -> PythonTool {
        PythonTool::new(&ToolConfig {
            workspace: dir.to_path_buf(),
            restrict_to_workspace: false,
            shell_timeout: Duration::from_secs(timeout_secs),
        })
    }

    async fn run(tool: &PythonTool, element: Element) -> anyhow::Result<ToolOutput> {
        tool.run(&element, &Invocation::new("t")).await
    }

    fn code(text: &str) -> Element {
        Element::with_text("python", text)
    }

    #[tokio::test]
    async fn test_python_namespace_persists() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path(), 10);

        let out = run(&tool, code("import math\nx = 41")).await.unwrap();
        assert_eq!(out.text, "[No output]");

        let out = run(&tool, code("print(x + 1, math.floor(2.5))")).await.unwrap();
        assert_eq!(out.text, "--- stdout ---\n42 2");
    }

    #[tokio::test]
    async fn test_python_exception_keeps_session() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path(), 10);

        run(&tool, code("kept = 'yes'")).await.unwrap();
        let out = run(&tool, code("print('before')\n1 / 0")).await.unwrap();
        assert!(out.text.starts_with("--- stdout ---\nbefore"));
        assert!(out.text.contains("--- stderr ---\nTraceback"));
        assert!(out.text.contains("ZeroDivisionError"));

        let out = run(&tool, code("raise SystemExit(3)")).await.unwrap();
        assert!(out.text.contains("SystemExit"));

        let out = run(&tool, code("print(kept)")).await.unwrap();
        assert_eq!(out.text, "--- stdout ---\nyes");
    }

    #[tokio::test]
    async fn test_python_reset_clears_namespace() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path(), 10);

        run(&tool, code("value = 1")).await.unwrap();
        let out = run(&tool, code("print('value' in globals())").attr("reset", "true"))
            .await
            .unwrap();
        assert_eq!(out.text, "--- stdout ---\nFalse");
    }

    #[tokio::test]
    async fn test_python_timeout_resets_session() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path(), 1);

        let err = run(&tool, code("import time\ntime.sleep(5)")).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        let out = run(&tool, code("print('back')")).await.unwrap();
        assert_eq!(out.text, "--- stdout ---\nback");
    }

    #[tokio::test]
    async fn test_python_runs_in_workspace() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "from disk").unwrap();
        let tool = tool(dir.path(), 10);

        let out = run(&tool, code("print(open('data.txt').read())")).await.unwrap();
        assert_eq!(out.text, "--- stdout ---\nfrom disk");
    }

    #[tokio::test]
    async fn test_python_empty_code() {
        let dir = tempfile::tempdir().unwrap();
        let tool = tool(dir.path(), 5);
        let err = run(&tool, Element::empty("python")).await.unwrap_err();
        assert_eq!(err.to_string(), "No code provided to execute.");
    }

    #[test]
    fn test_report_sections() {
        let output = ScriptOutput {
            stdout: "a".into(),
            stderr: "b".into(),
            exit_code: Some(1),
        };
        assert_eq!(format_report(&output), "--- stdout ---\na\n--- stderr ---\nb");
    }
}
