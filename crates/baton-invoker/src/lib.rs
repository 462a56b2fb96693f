//! `baton-invoker`: runs AI backends as subprocesses.
//!
//! ```text
//! ProcessInvoker::invoke(backend, timeout, prompt)
//!     │   look up BackendCommand, resolve the binary on PATH
//!     ▼
//! BackendProcess   ← prompt on stdin, stdout/stderr drained concurrently
//!     │              raced against tokio::time::timeout, killed on expiry
//!     ▼
//! parse_response   ← JSON answer + usage counts, or plain text
//! ```

pub mod error;
pub(crate) mod process;
pub mod response;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use baton_core::config::{BackendCommand, Config};
use baton_core::invoke::{InvocationFailure, InvocationResult, InvokeOptions, ModelInvoker};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

pub use error::InvokeError;
pub use response::parse_response;

use crate::process::BackendProcess;

/// Environment variable carrying `InvokeOptions::resume_session` to the child.
pub const RESUME_SESSION_ENV: &str = "BATON_RESUME_SESSION";

// ─── ProcessInvoker ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker {
    commands: BTreeMap<String, BackendCommand>,
}

impl ProcessInvoker {
    pub fn new(commands: BTreeMap<String, BackendCommand>) -> Self {
        Self { commands }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.commands.clone())
    }

    /// The configured command for `backend`; an unconfigured backend runs a
    /// program of the same name with no arguments.
    fn command_for(&self, backend: &str) -> BackendCommand {
        self.commands
            .get(backend)
            .cloned()
            .unwrap_or_else(|| BackendCommand {
                program: backend.to_string(),
                args: Vec::new(),
            })
    }

    #[instrument(skip(self, prompt, options), fields(prompt_bytes = prompt.len()))]
    pub async fn run(
        &self,
        backend: &str,
        timeout: Duration,
        prompt: &str,
        options: &InvokeOptions,
    ) -> InvocationResult {
        let launch = self.command_for(backend);
        let program = which::which(&launch.program).map_err(|_| InvocationFailure::NotFound {
            backend: backend.to_string(),
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&launch.args).args(&options.extra_args);
        if let Some(session) = &options.resume_session {
            cmd.env(RESUME_SESSION_ENV, session);
        }

        let mut child = BackendProcess::spawn(cmd)
            .map_err(|e| InvocationFailure::Execution(e.to_string()))?;
        let started = Instant::now();

        let finished = tokio::time::timeout(timeout, child.communicate(prompt)).await;
        let captured = match finished {
            Ok(Ok(captured)) => captured,
            Ok(Err(e)) => {
                child.kill().await;
                return Err(InvocationFailure::Execution(e.to_string()));
            }
            Err(_) => {
                child.kill().await;
                warn!(backend, ?timeout, "backend timed out; killed");
                return Err(InvocationFailure::Timeout { after: timeout });
            }
        };
        debug!(
            backend,
            status = %captured.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stdout_bytes = captured.stdout.len(),
            "backend exited"
        );

        if !captured.status.success() {
            return Err(InvocationFailure::NonZeroExit {
                code: captured.status.code(),
                stderr: captured.stderr.trim().to_string(),
            });
        }
        parse_response(&captured.stdout)
    }
}

impl ModelInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        backend: &str,
        timeout: Duration,
        prompt: &str,
        options: &InvokeOptions,
    ) -> InvocationResult {
        self.run(backend, timeout, prompt, options).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> BackendCommand {
        BackendCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn invoker(backends: &[(&str, BackendCommand)]) -> ProcessInvoker {
        ProcessInvoker::new(
            backends
                .iter()
                .map(|(name, cmd)| (name.to_string(), cmd.clone()))
                .collect(),
        )
    }

    async fn call(inv: &ProcessInvoker, backend: &str, timeout: Duration) -> InvocationResult {
        inv.invoke(backend, timeout, "the prompt", &InvokeOptions::default())
            .await
    }

    #[tokio::test]
    async fn prompt_arrives_on_stdin() {
        let inv = invoker(&[("echo", sh("cat"))]);
        let out = call(&inv, "echo", Duration::from_secs(10)).await.unwrap();
        assert_eq!(out.text, "the prompt");
    }

    #[tokio::test]
    async fn json_usage_is_reported() {
        let inv = invoker(&[(
            "json",
            sh(r#"cat >/dev/null; echo '{"result":"ok","usage":{"input_tokens":9,"output_tokens":2}}'"#),
        )]);
        let out = call(&inv, "json", Duration::from_secs(10)).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!((out.input_tokens, out.output_tokens), (Some(9), Some(2)));
    }

    #[tokio::test]
    async fn hung_backend_is_killed() {
        let inv = invoker(&[("slow", sh("sleep 30"))]);
        let started = Instant::now();
        let err = call(&inv, "slow", Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(
            err,
            InvocationFailure::Timeout {
                after: Duration::from_millis(200)
            }
        );
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let inv = invoker(&[("bad", sh("echo quota exceeded >&2; exit 3"))]);
        match call(&inv, "bad", Duration::from_secs(10)).await {
            Err(InvocationFailure::NonZeroExit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "quota exceeded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_backend_is_empty_output() {
        let inv = invoker(&[("quiet", sh("true"))]);
        assert_eq!(
            call(&inv, "quiet", Duration::from_secs(10)).await,
            Err(InvocationFailure::EmptyOutput)
        );
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let inv = invoker(&[(
            "ghost",
            BackendCommand {
                program: "baton-no-such-backend-binary".into(),
                args: vec![],
            },
        )]);
        assert_eq!(
            call(&inv, "ghost", Duration::from_secs(1)).await,
            Err(InvocationFailure::NotFound {
                backend: "ghost".into()
            })
        );
    }

    #[tokio::test]
    async fn extra_args_and_resume_pass_through() {
        let inv = invoker(&[(
            "args",
            sh(r#"cat >/dev/null; echo "$0 $BATON_RESUME_SESSION""#),
        )]);
        let opts = InvokeOptions {
            extra_args: vec!["--flag".into()],
            resume_session: Some("sess-9".into()),
        };
        let out = inv
            .invoke("args", Duration::from_secs(10), "p", &opts)
            .await
            .unwrap();
        assert_eq!(out.text, "--flag sess-9");
    }
}
