//! Model Router: backend selection with bounded retry and ordered fallback.
//!
//! Every attempt, successful or not, lands in the feature's ledger in
//! attempt order. On success `model_in_use` moves to the backend that
//! answered; when every candidate fails it is left alone.

use crate::config::Config;
use crate::error::{BackendFailure, BatonError, Result};
use crate::history::HistoryEvent;
use crate::invoke::{InvocationFailure, InvokeOptions, ModelInvoker};
use crate::store::SessionStore;
use crate::types::TddPhase;
use crate::usage::UsageTracker;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// How often one backend is tried before the router moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            pause: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// Ledger command name for every attempt.
    pub command: String,
    pub prompt: String,
    pub arguments: Vec<String>,
    pub task_id: Option<String>,
    pub phase: Option<TddPhase>,
    /// Use exactly this backend; the candidate list is not consulted.
    pub backend: Option<String>,
    /// Usage session to charge on success.
    pub usage_session: Option<String>,
    pub options: InvokeOptions,
}

impl RouteRequest {
    pub fn new(command: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            prompt: prompt.into(),
            arguments: Vec::new(),
            task_id: None,
            phase: None,
            backend: None,
            usage_session: None,
            options: InvokeOptions::default(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>, phase: TddPhase) -> Self {
        self.task_id = Some(task_id.into());
        self.phase = Some(phase);
        self
    }

    pub fn with_backend(mut self, backend: Option<String>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_usage_session(mut self, session: Option<String>) -> Self {
        self.usage_session = session;
        self
    }

    pub fn with_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }

    fn event(&self, backend: &str, elapsed: Duration, failure: Option<&InvocationFailure>) -> HistoryEvent {
        let mut event = match failure {
            None => HistoryEvent::success(&self.command),
            Some(f) => HistoryEvent::failure(&self.command, f.to_string()),
        }
        .with_args(self.arguments.iter().cloned())
        .with_model(backend)
        .with_duration(elapsed);
        if let Some(task) = &self.task_id {
            event = event.with_task(task);
        }
        if let Some(phase) = self.phase {
            event = event.with_phase(phase);
        }
        event
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteOutcome {
    pub backend: String,
    pub text: String,
    /// Total invocations made, across all candidates.
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

// ---------------------------------------------------------------------------
// ModelRouter
// ---------------------------------------------------------------------------

pub struct ModelRouter<I> {
    invoker: I,
    candidates: Vec<String>,
    retry: RetryPolicy,
    timeout: Duration,
    usage: Option<UsageTracker>,
}

impl<I: ModelInvoker> ModelRouter<I> {
    pub fn new(invoker: I, candidates: Vec<String>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            invoker,
            candidates,
            retry,
            timeout,
            usage: None,
        }
    }

    /// Router over the configured backends, retry policy and timeout.
    pub fn from_config(invoker: I, config: &Config) -> Self {
        Self::new(
            invoker,
            config.backends.clone(),
            config.retry_policy(),
            config.invoke_timeout(),
        )
    }

    pub fn with_usage(mut self, tracker: UsageTracker) -> Self {
        self.usage = Some(tracker);
        self
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// The backend a routed call would try first.
    pub fn primary(&self, backend_override: Option<&str>) -> Option<String> {
        backend_override
            .map(str::to_string)
            .or_else(|| self.candidates.first().cloned())
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Send `request` to the first backend that answers.
    ///
    /// With an explicit backend the call fails with
    /// [`BatonError::ModelInvocation`]; otherwise exhausting every candidate
    /// fails with [`BatonError::AllBackendsExhausted`].
    ///
    /// State and usage writes wait on file locks for up to the lock timeout.
    /// They run on tokio's blocking pool, so the waiting never holds an
    /// async worker. Ledger appends are single unlocked writes and stay inline.
    #[instrument(skip_all, fields(feature = feature_id, command = %request.command))]
    pub async fn route(
        &self,
        store: &SessionStore,
        feature_id: &str,
        request: &RouteRequest,
    ) -> Result<RouteOutcome> {
        let ledger = store.ledger(feature_id)?;
        let candidates: Vec<String> = match &request.backend {
            Some(b) => vec![b.clone()],
            None => self.candidates.clone(),
        };
        let max_attempts = self.retry.max_attempts.max(1);
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut failures = Vec::new();

        for backend in &candidates {
            for attempt in 1..=max_attempts {
                attempts += 1;
                let t0 = Instant::now();
                let result = self
                    .invoker
                    .invoke(backend, self.timeout, &request.prompt, &request.options)
                    .await
                    .and_then(|out| {
                        if out.text.trim().is_empty() {
                            Err(InvocationFailure::EmptyOutput)
                        } else {
                            Ok(out)
                        }
                    });
                let elapsed = t0.elapsed();

                match result {
                    Ok(output) => {
                        ledger.append(&request.event(backend, elapsed, None))?;
                        let (state_store, feature, model) =
                            (store.clone(), feature_id.to_string(), backend.clone());
                        blocking(move || {
                            state_store
                                .update(&feature, |s| s.with_model(model.as_str()))
                                .map(drop)
                        })
                        .await?;
                        if let (Some(tracker), Some(session)) = (&self.usage, &request.usage_session) {
                            let (tracker, name, model, prompt, reply) = (
                                tracker.clone(),
                                session.clone(),
                                backend.clone(),
                                request.prompt.clone(),
                                output.clone(),
                            );
                            let recorded = blocking(move || {
                                tracker.record_interaction(&name, &model, &prompt, &reply, elapsed)
                            })
                            .await;
                            if let Err(e) = recorded {
                                warn!(session = %session, error = %e, "usage not recorded");
                            }
                        }
                        info!(backend = %backend, attempts, elapsed_ms = elapsed.as_millis() as u64, "routed call succeeded");
                        return Ok(RouteOutcome {
                            backend: backend.clone(),
                            text: output.text,
                            attempts,
                            duration: started.elapsed(),
                        });
                    }
                    Err(failure) => {
                        ledger.append(&request.event(backend, elapsed, Some(&failure)))?;
                        warn!(backend = %backend, attempt, kind = failure.kind(), error = %failure, "backend attempt failed");
                        if failure.is_retryable() && attempt < max_attempts {
                            tokio::time::sleep(self.retry.pause).await;
                            continue;
                        }
                        failures.push(BackendFailure {
                            backend: backend.clone(),
                            failure,
                        });
                        break;
                    }
                }
            }
        }

        if request.backend.is_some() {
            if let Some(BackendFailure { backend, failure }) = failures.pop() {
                return Err(BatonError::ModelInvocation { backend, failure });
            }
        }
        Err(BatonError::AllBackendsExhausted(failures))
    }
}

/// Run lock-taking store work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BatonError::Io(std::io::Error::other(e)))?
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
