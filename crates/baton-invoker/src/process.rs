use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::InvokeError;

type Result<T> = std::result::Result<T, InvokeError>;

// ─── BackendProcess ───────────────────────────────────────────────────────

/// A spawned backend CLI. The prompt goes in on stdin; the answer comes back
/// on stdout. Dropping this value kills a child that is still running.
pub(crate) struct BackendProcess {
    child: Child,
}

/// Everything a finished backend produced.
pub(crate) struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl BackendProcess {
    pub(crate) fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd.spawn()?;
        Ok(Self { child })
    }

    /// Feed `prompt` to stdin and drain stdout and stderr concurrently until
    /// the child exits.
    pub(crate) async fn communicate(&mut self, prompt: &str) -> Result<Captured> {
        let mut stdin = self
            .child
            .stdin
            .take()
            .ok_or_else(|| InvokeError::Process("stdin not captured".into()))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| InvokeError::Process("stdout not captured".into()))?;
        let stderr = self
            .child
            .stderr
            .take()
            .ok_or_else(|| InvokeError::Process("stderr not captured".into()))?;

        let feed = async move {
            // Backends may exit without reading stdin.
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                tracing::debug!(error = %e, "backend closed stdin early");
            }
            drop(stdin);
        };
        let ((), stdout, stderr) = tokio::join!(feed, read_all(stdout), read_all(stderr));
        let status = self.child.wait().await?;

        Ok(Captured {
            status,
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    /// Kill the subprocess (best-effort; errors are ignored).
    pub(crate) async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut pipe: R) -> Result<String> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
