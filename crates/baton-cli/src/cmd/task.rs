use crate::output::{or_dash, print_json, print_table};
use crate::project::{runtime, Project};
use anyhow::Context;
use baton_core::lifecycle::{RunOptions, StepOptions};
use baton_core::plan::Task;
use baton_core::router::RouteOutcome;
use clap::{Args, Subcommand};
use std::path::Path;

#[derive(Args, Clone, Default)]
pub struct StepArgs {
    /// Use exactly this backend (no fallback)
    #[arg(long)]
    backend: Option<String>,
    /// Usage session to charge
    #[arg(long)]
    session: Option<String>,
    /// Extra text appended to the prompt
    #[arg(long)]
    context: Option<String>,
}

impl From<StepArgs> for StepOptions {
    fn from(a: StepArgs) -> Self {
        StepOptions {
            backend: a.backend,
            usage_session: a.session,
            context: a.context,
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// Add a task to a plan phase
    Add {
        feature: String,
        #[arg(required = true)]
        description: Vec<String>,
        /// Phase name (created if missing)
        #[arg(long, default_value = "main")]
        phase: String,
    },
    /// List tasks for a feature
    List { feature: String },
    /// Start a task and make it the feature's active task
    Start {
        feature: String,
        task_id: String,
        /// Backend to record as the model in use
        #[arg(long)]
        backend: Option<String>,
    },
    /// Mark a task as blocked
    Block {
        feature: String,
        task_id: String,
        #[arg(required = true)]
        reason: Vec<String>,
    },
    /// Red phase: ask a backend to write failing tests
    WriteTests {
        feature: String,
        task_id: String,
        #[command(flatten)]
        step: StepArgs,
    },
    /// Green phase: implement until the tests pass
    Implement {
        feature: String,
        task_id: String,
        #[command(flatten)]
        step: StepArgs,
    },
    /// Refactor after a successful implement
    Refactor {
        feature: String,
        task_id: String,
        #[command(flatten)]
        step: StepArgs,
    },
    /// Complete a task, checking coverage when a minimum is configured
    Complete {
        feature: String,
        task_id: String,
        /// Measured coverage percentage
        #[arg(long)]
        coverage: Option<f64>,
    },
    /// Drive a task through start, write-tests, implement, refactor and complete
    Run {
        feature: String,
        /// Defaults to the first pending or in-progress task
        task_id: Option<String>,
        #[command(flatten)]
        step: StepArgs,
        /// Include a refactor pass
        #[arg(long)]
        refactor: bool,
        /// Measured coverage percentage
        #[arg(long)]
        coverage: Option<f64>,
    },
}

pub fn run(root: &Path, subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    let project = Project::load(root)?;
    match subcmd {
        TaskSubcommand::Add {
            feature,
            description,
            phase,
        } => add(&project, &feature, &phase, &description.join(" "), json),
        TaskSubcommand::List { feature } => list(&project, &feature, json),
        TaskSubcommand::Start {
            feature,
            task_id,
            backend,
        } => {
            let task = project
                .engine()
                .start(&feature, &task_id, backend.as_deref())
                .with_context(|| format!("cannot start {task_id}"))?;
            print_task(&task, "Started", json)
        }
        TaskSubcommand::Block {
            feature,
            task_id,
            reason,
        } => {
            let task = project
                .engine()
                .block(&feature, &task_id, &reason.join(" "))
                .with_context(|| format!("cannot block {task_id}"))?;
            print_task(&task, "Blocked", json)
        }
        TaskSubcommand::WriteTests {
            feature,
            task_id,
            step,
        } => {
            let engine = project.engine();
            let outcome = runtime()?.block_on(engine.write_tests(&feature, &task_id, &step.into()))?;
            print_outcome(&outcome, json)
        }
        TaskSubcommand::Implement {
            feature,
            task_id,
            step,
        } => {
            let engine = project.engine();
            let outcome = runtime()?.block_on(engine.implement(&feature, &task_id, &step.into()))?;
            print_outcome(&outcome, json)
        }
        TaskSubcommand::Refactor {
            feature,
            task_id,
            step,
        } => {
            let engine = project.engine();
            let outcome = runtime()?.block_on(engine.refactor(&feature, &task_id, &step.into()))?;
            print_outcome(&outcome, json)
        }
        TaskSubcommand::Complete {
            feature,
            task_id,
            coverage,
        } => {
            let task = project
                .engine()
                .complete(&feature, &task_id, coverage)
                .with_context(|| format!("cannot complete {task_id}"))?;
            print_task(&task, "Completed", json)
        }
        TaskSubcommand::Run {
            feature,
            task_id,
            step,
            refactor,
            coverage,
        } => {
            let task_id = match task_id {
                Some(id) => id,
                None => project
                    .store()
                    .load_plan(&feature)?
                    .next_task()
                    .map(|t| t.id.clone())
                    .with_context(|| format!("no pending task in '{feature}'"))?,
            };
            let engine = project.engine();
            let opts = RunOptions {
                step: step.into(),
                refactor,
                coverage,
            };
            let task = runtime()?
                .block_on(engine.run(&feature, &task_id, &opts))
                .with_context(|| format!("task {task_id} did not complete"))?;
            print_task(&task, "Completed", json)
        }
    }
}

fn add(project: &Project, feature: &str, phase: &str, description: &str, json: bool) -> anyhow::Result<()> {
    let id = project
        .store()
        .update_plan(feature, |plan| Ok(plan.add_task(phase, description)))
        .with_context(|| format!("cannot add task to '{feature}'"))?;
    if json {
        print_json(&serde_json::json!({
            "feature_id": feature,
            "task_id": id,
            "phase": phase,
            "description": description,
        }))?;
    } else {
        println!("Added task [{id}]: {description}");
    }
    Ok(())
}

fn list(project: &Project, feature: &str, json: bool) -> anyhow::Result<()> {
    let plan = project.store().load_plan(feature)?;
    if json {
        return print_json(&plan);
    }
    let rows: Vec<Vec<String>> = plan
        .phases
        .iter()
        .flat_map(|phase| {
            phase.tasks.iter().map(|t| {
                vec![
                    t.id.clone(),
                    phase.name.clone(),
                    t.status.to_string(),
                    or_dash(t.tdd_phase.map(|p| p.as_str())),
                    or_dash(t.model.as_deref()),
                    t.description.clone(),
                ]
            })
        })
        .collect();
    if rows.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    print_table(&["ID", "PHASE", "STATUS", "TDD", "MODEL", "DESCRIPTION"], rows);
    println!("\n{}", plan.summarize());
    Ok(())
}

fn print_task(task: &Task, verb: &str, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(task);
    }
    println!("{verb} task [{}] ({})", task.id, task.status);
    Ok(())
}

fn print_outcome(outcome: &RouteOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(outcome);
    }
    println!("{}", outcome.text);
    eprintln!(
        "({} after {} attempt(s), {}ms)",
        outcome.backend,
        outcome.attempts,
        outcome.duration.as_millis()
    );
    Ok(())
}
