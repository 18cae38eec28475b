//! Interpreter sessions — long-lived child processes fed over stdin.
//!
//! After each snippet the child prints an end-of-command marker on stdout,
//! followed by the exit status, and another marker on stderr. Reading stops
//! once both markers have been seen. Output is decoded lossily, so bytes
//! that are not UTF-8 show up as U+FFFD instead of breaking the session.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Printed after every snippet; the exit status follows it on stdout.
pub(crate) const EOC_MARKER: &str = "__SOLIPSISM_EOC__";

/// What one snippet printed.
pub(crate) struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// How to start an interpreter.
pub(crate) struct Launcher {
    /// Used in logs and error messages ("bash", "python").
    pub label: &'static str,
    pub program: &'static str,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

// ─────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
}

impl Session {
    async fn start(launcher: &Launcher) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&launcher.working_dir).await?;
        let mut child = Command::new(launcher.program)
            .args(&launcher.args)
            .current_dir(&launcher.working_dir)
            .env("TERM", "dumb")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to start {}: {e}", launcher.label))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            anyhow::bail!("{} started without piped stdio", launcher.label);
        };
        info!(
            label = launcher.label,
            cwd = %launcher.working_dir.display(),
            pid = ?child.id(),
            "interpreter session started"
        );

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
        })
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Write one framed snippet and collect its output up to the markers.
    async fn execute(&mut self, input: &[u8]) -> anyhow::Result<ScriptOutput> {
        self.stdin.write_all(input).await?;
        self.stdin.flush().await?;

        let (stdout, stderr) = tokio::join!(
            read_until_marker(&mut self.stdout),
            read_until_marker(&mut self.stderr)
        );
        let (stdout, status) = stdout?;
        let (stderr, _) = stderr?;
        Ok(ScriptOutput {
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            exit_code: status.trim().parse().ok(),
        })
    }
}

/// Collect lines until one contains the marker. Returns the lines and the
/// text following the marker.
async fn read_until_marker<R>(reader: &mut R) -> anyhow::Result<(Vec<String>, String)>
where
    R: AsyncBufRead + Unpin,
{
    let mut collected = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            anyhow::bail!("session ended unexpectedly");
        }
        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end_matches(['\n', '\r']);
        if let Some((before, after)) = line.split_once(EOC_MARKER) {
            if !before.is_empty() {
                collected.push(before.to_string());
            }
            return Ok((collected, after.to_string()));
        }
        collected.push(line.to_string());
    }
}

// ─────────────────────────────────────────────
// SessionSlot
// ─────────────────────────────────────────────

/// One lazily started session, used by one snippet at a time. A failed or
/// timed-out session is dropped, which kills the process, and a fresh one
/// starts on the next call.
pub(crate) struct SessionSlot {
    launcher: Launcher,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl SessionSlot {
    pub fn new(launcher: Launcher, timeout: Duration) -> Self {
        Self {
            launcher,
            timeout,
            session: Mutex::new(None),
        }
    }

    /// Run `input` in the session, restarting it first when `reset` is set
    /// or the process has exited.
    pub async fn execute(&self, input: &[u8], reset: bool) -> anyhow::Result<ScriptOutput> {
        let mut guard = self.session.lock().await;
        let stale = match guard.as_mut() {
            Some(session) => !session.is_alive(),
            None => true,
        };
        if reset || stale {
            *guard = None;
            *guard = Some(Session::start(&self.launcher).await?);
        }
        let Some(session) = guard.as_mut() else {
            anyhow::bail!("{} session unavailable", self.launcher.label);
        };

        match tokio::time::timeout(self.timeout, session.execute(input)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                *guard = None;
                warn!(label = self.launcher.label, error = %e, "session failed");
                anyhow::bail!(
                    "Error executing {} code: {e}. The session was reset.",
                    self.launcher.label
                )
            }
            Err(_) => {
                *guard = None;
                warn!(label = self.launcher.label, "session timed out");
                anyhow::bail!(
                    "Execution timed out after {} seconds. The session was reset.",
                    self.timeout.as_secs()
                )
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
