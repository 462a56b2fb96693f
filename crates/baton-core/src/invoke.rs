//! Model Invoker contract.
//!
//! The core never runs a model itself. It hands a backend name, a timeout
//! and a prompt to a [`ModelInvoker`] and gets back text or a typed
//! [`InvocationFailure`]. `baton-invoker` provides the subprocess
//! implementation; unit tests replay canned results.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Pass-through options. The core never interprets these.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub extra_args: Vec<String>,
    pub resume_session: Option<String>,
}

/// What a backend returned on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOutput {
    pub text: String,
    /// Backend-reported token counts, when the backend reports them.
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub session_id: Option<String>,
}

impl InvocationOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvocationFailure {
    /// The invocation was killed after exceeding its deadline.
    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("backend '{backend}' not found")]
    NotFound { backend: String },

    #[error("exited with code {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("empty output")]
    EmptyOutput,

    #[error("execution error: {0}")]
    Execution(String),
}

impl InvocationFailure {
    /// Whether the same backend may be tried again.
    ///
    /// Timeouts and missing binaries move straight to the next candidate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvocationFailure::NonZeroExit { .. }
                | InvocationFailure::EmptyOutput
                | InvocationFailure::Execution(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InvocationFailure::Timeout { .. } => "timeout",
            InvocationFailure::NotFound { .. } => "not_found",
            InvocationFailure::NonZeroExit { .. } => "nonzero_exit",
            InvocationFailure::EmptyOutput => "empty_output",
            InvocationFailure::Execution(_) => "execution",
        }
    }
}

pub type InvocationResult = std::result::Result<InvocationOutput, InvocationFailure>;

pub trait ModelInvoker {
    fn invoke(
        &self,
        backend: &str,
        timeout: Duration,
        prompt: &str,
        options: &InvokeOptions,
    ) -> impl Future<Output = InvocationResult> + Send;
}
