//! Task Lifecycle Engine.
//!
//! ```text
//! pending ──start──▶ in_progress ──complete──▶ completed
//!    ▲                  │  red ─▶ green ─▶ refactor
//!    └─────start─── blocked ◀──block──┤
//!    └─────start─── failed ◀──router failure──┘
//! ```
//!
//! `implement` needs the tests-written marker that only a successful
//! `write_tests` sets. Every sub-operation leaves its own ledger events
//! tagged with the task id and phase.
//!
//! Status checks that guard a plan write run inside the plan lock, so a
//! concurrent `block` or failure cannot be overwritten.

use crate::error::{BatonError, Result};
use crate::history::{command, HistoryEvent};
use crate::invoke::{InvokeOptions, ModelInvoker};
use crate::plan::{CoverageMeta, Plan, Task, TestMeta};
use crate::router::{ModelRouter, RouteOutcome, RouteRequest};
use crate::store::SessionStore;
use crate::types::{TaskStatus, TddPhase};
use chrono::Utc;
use tracing::{info, warn};

/// Per-call knobs for a routed sub-operation.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Skip the candidate list and use exactly this backend.
    pub backend: Option<String>,
    pub usage_session: Option<String>,
    /// Extra prompt text appended after the task description.
    pub context: Option<String>,
    pub invoke: InvokeOptions,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub step: StepOptions,
    pub refactor: bool,
    /// Measured coverage percentage, checked against the configured minimum.
    pub coverage: Option<f64>,
}

pub struct TaskEngine<I> {
    store: SessionStore,
    router: ModelRouter<I>,
    coverage_required: Option<f64>,
}

fn invalid(task: &Task, to: &str, reason: &str) -> BatonError {
    BatonError::InvalidTransition {
        task: task.id.clone(),
        from: task.status.to_string(),
        to: to.to_string(),
        reason: reason.to_string(),
    }
}

fn prompt(phase: TddPhase, plan: &Plan, task: &Task, context: Option<&str>) -> String {
    let instruction = match phase {
        TddPhase::Red => "Write failing tests that specify the task below. Do not implement it yet.",
        TddPhase::Green => "Implement the task below so that its existing tests pass.",
        TddPhase::Refactor => {
            "Refactor the implementation of the task below without changing behaviour. Keep every test passing."
        }
    };
    let mut out = format!(
        "{instruction}\n\nFeature: {}\n{}\n\nTask {}: {}\n",
        plan.feature_id, plan.description, task.id, task.description
    );
    if let Some(ctx) = context {
        out.push('\n');
        out.push_str(ctx);
        out.push('\n');
    }
    out
}

impl<I: ModelInvoker> TaskEngine<I> {
    pub fn new(store: SessionStore, router: ModelRouter<I>) -> Self {
        Self {
            store,
            router,
            coverage_required: None,
        }
    }

    pub fn with_coverage_required(mut self, required: Option<f64>) -> Self {
        self.coverage_required = required;
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn router(&self) -> &ModelRouter<I> {
        &self.router
    }

    // ---------------------------------------------------------------------------
    // Status transitions
    // ---------------------------------------------------------------------------

    /// Move a pending, blocked or failed task to in_progress and make it the
    /// feature's active task. Restarting a failed task clears its error but
    /// keeps the tests-written marker.
    pub fn start(&self, feature_id: &str, task_id: &str, backend: Option<&str>) -> Result<Task> {
        let plan = self.store.load_plan(feature_id)?;
        let current = plan.task(task_id)?;
        if current.status.is_terminal() {
            return Err(invalid(current, "in_progress", "task is already completed"));
        }

        let model = self.router.primary(backend);
        self.store.update(feature_id, |s| {
            let s = s.with_active_task(task_id);
            match &model {
                Some(m) => s.with_model(m.as_str()),
                None => s,
            }
        })?;

        let task = self.store.update_plan(feature_id, |p| {
            let t = p.task_mut(task_id)?;
            if t.status.is_terminal() {
                return Err(invalid(t, "in_progress", "task is already completed"));
            }
            t.status = TaskStatus::InProgress;
            t.started_at.get_or_insert_with(Utc::now);
            t.model = model.clone();
            t.error = None;
            Ok(t.clone())
        })?;

        let mut event = HistoryEvent::success(command::TASK_START)
            .with_args([task_id])
            .with_task(task_id);
        if let Some(m) = &model {
            event = event.with_model(m.as_str());
        }
        self.store.record(feature_id, &event)?;
        info!(feature = feature_id, task = task_id, "task started");
        Ok(task)
    }

    pub fn block(&self, feature_id: &str, task_id: &str, reason: &str) -> Result<Task> {
        let task = self.store.update_plan(feature_id, |p| {
            let t = p.task_mut(task_id)?;
            if !matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress) {
                return Err(invalid(t, "blocked", "only pending or in-progress tasks can block"));
            }
            t.status = TaskStatus::Blocked;
            t.error = Some(reason.to_string());
            Ok(t.clone())
        })?;
        self.release_active(feature_id, task_id)?;
        self.store.record(
            feature_id,
            &HistoryEvent::success(command::TASK_BLOCK)
                .with_args([task_id, reason])
                .with_task(task_id),
        )?;
        info!(feature = feature_id, task = task_id, reason, "task blocked");
        Ok(task)
    }

    /// Mark the task completed. Fails with [`BatonError::CoverageShortfall`]
    /// when a minimum is configured and `measured` falls below it; a missing
    /// measurement counts as 0. The shortfall is still stored on the task.
    pub fn complete(&self, feature_id: &str, task_id: &str, measured: Option<f64>) -> Result<Task> {
        let required = self.coverage_required;
        let outcome = self.store.update_plan(feature_id, |p| {
            let t = p.task_mut(task_id)?;
            if t.status != TaskStatus::InProgress {
                return Err(invalid(t, "completed", "task is not in progress"));
            }
            if t.tdd_phase.map_or(true, |p| p < TddPhase::Green) {
                return Err(invalid(t, "completed", "implement has not succeeded"));
            }
            if let Some(required) = required {
                let measured = measured.unwrap_or(0.0);
                t.coverage = Some(CoverageMeta {
                    required,
                    measured: Some(measured),
                });
                if measured < required {
                    return Ok(Err(BatonError::CoverageShortfall { measured, required }));
                }
            }
            t.status = TaskStatus::Completed;
            t.completed_at = Some(Utc::now());
            t.error = None;
            Ok(Ok(t.clone()))
        })?;

        let task = match outcome {
            Ok(task) => task,
            Err(err) => {
                self.store.record(
                    feature_id,
                    &HistoryEvent::failure(command::TASK_COMPLETE, err.to_string()).with_task(task_id),
                )?;
                warn!(feature = feature_id, task = task_id, error = %err, "coverage shortfall");
                return Err(err);
            }
        };
        self.release_active(feature_id, task_id)?;

        let mut event = HistoryEvent::success(command::TASK_COMPLETE)
            .with_args([task_id])
            .with_task(task_id);
        if let Some(phase) = task.tdd_phase {
            event = event.with_phase(phase);
        }
        if let Some(model) = &task.model {
            event = event.with_model(model.as_str());
        }
        self.store.record(feature_id, &event)?;
        info!(feature = feature_id, task = task_id, "task completed");
        Ok(task)
    }

    fn release_active(&self, feature_id: &str, task_id: &str) -> Result<()> {
        self.store.update(feature_id, |s| {
            if s.active_task.as_deref() == Some(task_id) {
                s.clear_active_task()
            } else {
                s
            }
        })?;
        Ok(())
    }

    /// Record a router failure against the task. A task that left
    /// in_progress meanwhile keeps its status. Secondary write errors are
    /// logged; the caller still gets the original failure.
    fn mark_failed(&self, feature_id: &str, task_id: &str, phase: TddPhase, err: &BatonError) {
        let reason = err.to_string();
        let result = self
            .store
            .update_plan(feature_id, |p| {
                let t = p.task_mut(task_id)?;
                if t.status == TaskStatus::InProgress {
                    t.status = TaskStatus::Failed;
                    t.error = Some(reason.clone());
                }
                Ok(())
            })
            .and_then(|()| self.release_active(feature_id, task_id))
            .and_then(|()| {
                self.store.record(
                    feature_id,
                    &HistoryEvent::failure(command::TASK_FAIL, reason.as_str())
                        .with_task(task_id)
                        .with_phase(phase),
                )
            });
        if let Err(e) = result {
            warn!(feature = feature_id, task = task_id, error = %e, "could not record task failure");
        }
    }

    // ---------------------------------------------------------------------------
    // Routed sub-operations
    // ---------------------------------------------------------------------------

    /// Red phase: ask a backend for failing tests and set the marker.
    pub async fn write_tests(&self, feature_id: &str, task_id: &str, opts: &StepOptions) -> Result<RouteOutcome> {
        self.step(feature_id, task_id, TddPhase::Red, opts).await
    }

    /// Green phase. Requires the tests-written marker.
    pub async fn implement(&self, feature_id: &str, task_id: &str, opts: &StepOptions) -> Result<RouteOutcome> {
        self.step(feature_id, task_id, TddPhase::Green, opts).await
    }

    /// Requires a successful `implement`.
    pub async fn refactor(&self, feature_id: &str, task_id: &str, opts: &StepOptions) -> Result<RouteOutcome> {
        self.step(feature_id, task_id, TddPhase::Refactor, opts).await
    }

    async fn step(
        &self,
        feature_id: &str,
        task_id: &str,
        phase: TddPhase,
        opts: &StepOptions,
    ) -> Result<RouteOutcome> {
        let plan = self.store.load_plan(feature_id)?;
        let task = plan.task(task_id)?;
        if task.status != TaskStatus::InProgress {
            return Err(invalid(task, phase.as_str(), "task is not in progress"));
        }
        match phase {
            TddPhase::Red => {}
            TddPhase::Green => {
                if !task.tests_written() {
                    return Err(BatonError::TestsNotWritten(task_id.to_string()));
                }
            }
            TddPhase::Refactor => {
                if task.tdd_phase.map_or(true, |p| p < TddPhase::Green) {
                    return Err(invalid(task, phase.as_str(), "implement has not succeeded"));
                }
            }
        }

        let request = RouteRequest::new(
            phase.command(),
            prompt(phase, &plan, task, opts.context.as_deref()),
        )
        .with_args([task_id])
        .with_task(task_id, phase)
        .with_backend(opts.backend.clone())
        .with_usage_session(opts.usage_session.clone())
        .with_options(opts.invoke.clone());

        match self.router.route(&self.store, feature_id, &request).await {
            Ok(outcome) => {
                self.store.update_plan(feature_id, |p| {
                    let t = p.task_mut(task_id)?;
                    if t.status != TaskStatus::InProgress {
                        return Err(invalid(
                            t,
                            phase.as_str(),
                            "task left in_progress while the backend ran",
                        ));
                    }
                    t.tdd_phase = Some(phase);
                    t.model = Some(outcome.backend.clone());
                    if phase == TddPhase::Red {
                        t.test = Some(TestMeta {
                            written_at: Utc::now(),
                            backend: outcome.backend.clone(),
                        });
                    }
                    Ok(())
                })?;
                info!(feature = feature_id, task = task_id, %phase, backend = %outcome.backend, "phase reached");
                Ok(outcome)
            }
            Err(e) => {
                self.mark_failed(feature_id, task_id, phase, &e);
                Err(e)
            }
        }
    }

    /// Drive a task from its current point to completed: start, write tests
    /// when no marker exists, implement, optionally refactor, complete.
    pub async fn run(&self, feature_id: &str, task_id: &str, opts: &RunOptions) -> Result<Task> {
        let task = self.store.load_plan(feature_id)?.task(task_id)?.clone();
        if task.status != TaskStatus::InProgress {
            self.start(feature_id, task_id, opts.step.backend.as_deref())?;
        }
        if !task.tests_written() {
            self.write_tests(feature_id, task_id, &opts.step).await?;
        }
        self.implement(feature_id, task_id, &opts.step).await?;
        if opts.refactor {
            self.refactor(feature_id, task_id, &opts.step).await?;
        }
        self.complete(feature_id, task_id, opts.coverage)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
