use crate::output::{or_dash, print_json};
use crate::project::Project;
use anyhow::Context;
use baton_core::history::{CancelFlag, HistoryEvent};
use std::path::Path;
use std::time::Duration;

const FOLLOW_POLL: Duration = Duration::from_millis(250);

pub fn run(
    root: &Path,
    feature: &str,
    tail: Option<usize>,
    follow: bool,
    task: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let ledger = Project::load(root)?.store().ledger(feature)?;
    let wanted = |e: &HistoryEvent| task.map_or(true, |t| e.task_id.as_deref() == Some(t));

    let mut reader = ledger
        .read()
        .with_context(|| format!("cannot open history for '{feature}'"))?;
    let mut events = Vec::new();
    for event in reader.by_ref() {
        let event = event?;
        if wanted(&event) {
            events.push(event);
        }
    }
    if let Some(n) = tail {
        let skip = events.len().saturating_sub(n);
        events.drain(..skip);
    }

    if json && !follow {
        return print_json(&events);
    }
    for event in &events {
        print_event(event, json)?;
    }
    if !follow {
        return Ok(());
    }

    // Runs until the process is interrupted.
    let stream = ledger.follow(reader.offset(), CancelFlag::new(), FOLLOW_POLL)?;
    for event in stream {
        let event = event?;
        if wanted(&event) {
            print_event(&event, json)?;
        }
    }
    Ok(())
}

/// One line per event; JSON lines under `--json --follow`.
fn print_event(event: &HistoryEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let mut line = format!(
        "{}  {:<7}  {:<14}  {:<8}  {:>6}ms",
        event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.status,
        event.command,
        or_dash(event.model.as_deref()),
        event.duration_ms,
    );
    if let Some(task) = &event.task_id {
        line.push_str(&format!("  task={task}"));
    }
    if let Some(phase) = event.phase {
        line.push_str(&format!("  phase={phase}"));
    }
    if let Some(err) = &event.error {
        line.push_str(&format!("  error={err}"));
    }
    println!("{line}");
    Ok(())
}
