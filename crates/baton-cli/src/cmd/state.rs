use crate::output::{or_dash, print_json};
use crate::project::Project;
use anyhow::Context;
use baton_core::history::{command, HistoryEvent};
use baton_core::state::{FeatureStatus, State};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum StateSubcommand {
    /// Show the state record
    Show { feature: String },
    /// Update fields of the state record under the feature lock
    Set {
        feature: String,
        /// Active task id
        #[arg(long, conflicts_with = "clear_task")]
        task: Option<String>,
        /// Clear the active task
        #[arg(long)]
        clear_task: bool,
        /// Model in use
        #[arg(long)]
        model: Option<String>,
        /// Feature status: active, paused, completed, archived
        #[arg(long)]
        status: Option<FeatureStatus>,
    },
}

pub fn run(root: &Path, subcmd: StateSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        StateSubcommand::Show { feature } => show(root, &feature, json),
        StateSubcommand::Set {
            feature,
            task,
            clear_task,
            model,
            status,
        } => set(root, &feature, task, clear_task, model, status, json),
    }
}

fn show(root: &Path, feature: &str, json: bool) -> anyhow::Result<()> {
    let state = Project::load(root)?
        .store()
        .read(feature)
        .with_context(|| format!("cannot read state for '{feature}'"))?;
    render(&state, json)
}

fn set(
    root: &Path,
    feature: &str,
    task: Option<String>,
    clear_task: bool,
    model: Option<String>,
    status: Option<FeatureStatus>,
    json: bool,
) -> anyhow::Result<()> {
    let store = Project::load(root)?.store();
    let mut args = Vec::new();
    if let Some(t) = &task {
        args.push(format!("task={t}"));
    }
    if clear_task {
        args.push("task=".to_string());
    }
    if let Some(m) = &model {
        args.push(format!("model={m}"));
    }
    if let Some(s) = status {
        args.push(format!("status={s}"));
    }

    let state = store
        .update(feature, |mut s| {
            if let Some(t) = task {
                s = s.with_active_task(t);
            }
            if clear_task {
                s = s.clear_active_task();
            }
            if let Some(m) = model {
                s = s.with_model(m);
            }
            if let Some(st) = status {
                s = s.with_status(st);
            }
            s
        })
        .with_context(|| format!("cannot update state for '{feature}'"))?;
    store.record(feature, &HistoryEvent::success(command::STATE_SET).with_args(args))?;
    if status.is_some() {
        store.registry().set_status(feature, state.status)?;
    }
    render(&state, json)
}

fn render(state: &State, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(state);
    }
    println!("feature:      {}", state.feature_id);
    println!("status:       {}", state.status);
    println!("active_task:  {}", or_dash(state.active_task.as_deref()));
    println!("model_in_use: {}", or_dash(state.model_in_use.as_deref()));
    println!("started_at:   {}", state.started_at.to_rfc3339());
    println!("last_updated: {}", state.last_updated.to_rfc3339());
    Ok(())
}
