use crate::output::{print_json, print_table};
use crate::project::Project;
use anyhow::Context;
use baton_core::registry::RegistryEntry;
use baton_core::store::CleanupMode;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum FeaturesSubcommand {
    /// List features in the registry
    List,
    /// Rebuild the registry from the feature directories on disk
    Refresh,
}

pub fn run(root: &Path, subcmd: FeaturesSubcommand, json: bool) -> anyhow::Result<()> {
    let store = Project::load(root)?.store();
    let entries = match subcmd {
        FeaturesSubcommand::List => store.list().context("failed to read feature registry")?,
        FeaturesSubcommand::Refresh => store
            .registry()
            .refresh()
            .context("failed to refresh feature registry")?,
    };
    render(&entries, json)
}

fn render(entries: &[RegistryEntry], json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("No features.");
        return Ok(());
    }
    let rows = entries
        .iter()
        .map(|e| {
            vec![
                e.feature_id.clone(),
                e.status.to_string(),
                e.started_at.format("%Y-%m-%d %H:%M").to_string(),
                e.last_active.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(&["FEATURE", "STATUS", "STARTED", "LAST ACTIVE"], rows);
    Ok(())
}

pub fn cleanup(root: &Path, feature: &str, delete: bool, json: bool) -> anyhow::Result<()> {
    let mode = if delete {
        CleanupMode::Delete
    } else {
        CleanupMode::Archive
    };
    let archived = Project::load(root)?
        .store()
        .cleanup(feature, mode)
        .with_context(|| format!("cannot clean up '{feature}'"))?;

    if json {
        print_json(&serde_json::json!({
            "feature_id": feature,
            "deleted": delete,
            "archived_to": archived,
        }))?;
    } else if let Some(dest) = archived {
        println!("Archived {feature} to {}", dest.display());
    } else {
        println!("Deleted {feature}");
    }
    Ok(())
}

pub fn reconstruct(root: &Path, feature: &str, json: bool) -> anyhow::Result<()> {
    let state = Project::load(root)?
        .store()
        .reconstruct(feature)
        .with_context(|| format!("cannot reconstruct '{feature}'"))?;
    if json {
        print_json(&state)?;
    } else {
        println!(
            "Rebuilt {feature}: active_task={} model_in_use={}",
            state.active_task.as_deref().unwrap_or("-"),
            state.model_in_use.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
