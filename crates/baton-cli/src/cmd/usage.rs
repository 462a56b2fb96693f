use crate::output::{print_json, print_table};
use crate::project::Project;
use anyhow::Context;
use baton_core::usage::ExportFormat;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum UsageSubcommand {
    /// List usage sessions, most recently used first
    List,
    /// Totals across every session, broken down by model
    Stats,
    /// Dump every session as JSON or JSON lines
    Export {
        /// json or jsonl
        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },
    /// Delete a usage session
    Clear { session: String },
}

pub fn run(root: &Path, subcmd: UsageSubcommand, json: bool) -> anyhow::Result<()> {
    let tracker = Project::load(root)?.usage();
    match subcmd {
        UsageSubcommand::List => {
            let sessions = tracker.list().context("failed to list usage sessions")?;
            if json {
                return print_json(&sessions);
            }
            if sessions.is_empty() {
                println!("No usage sessions.");
                return Ok(());
            }
            let rows = sessions
                .iter()
                .map(|s| {
                    vec![
                        format!("{}{}", s.session_name, if s.degraded { " (!)" } else { "" }),
                        s.interactions.to_string(),
                        s.input_tokens.to_string(),
                        s.output_tokens.to_string(),
                        format!("${:.4}", s.cost_usd),
                        s.last_used
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "-".into()),
                    ]
                })
                .collect();
            print_table(&["SESSION", "CALLS", "IN", "OUT", "COST", "LAST USED"], rows);
        }
        UsageSubcommand::Stats => {
            let totals = tracker.aggregate().context("failed to aggregate usage")?;
            if json {
                return print_json(&totals);
            }
            println!(
                "{} sessions, {} calls, {} in / {} out tokens, ${:.4}",
                totals.sessions,
                totals.interactions,
                totals.input_tokens,
                totals.output_tokens,
                totals.cost_usd
            );
            if !totals.by_model.is_empty() {
                println!();
                let rows = totals
                    .by_model
                    .iter()
                    .map(|(model, m)| {
                        vec![
                            model.clone(),
                            m.interactions.to_string(),
                            m.input_tokens.to_string(),
                            m.output_tokens.to_string(),
                            format!("${:.4}", m.cost_usd),
                        ]
                    })
                    .collect();
                print_table(&["MODEL", "CALLS", "IN", "OUT", "COST"], rows);
            }
        }
        UsageSubcommand::Export { format } => {
            let out = tracker.export(format).context("failed to export usage")?;
            print!("{out}");
            if !out.is_empty() && !out.ends_with('\n') {
                println!();
            }
        }
        UsageSubcommand::Clear { session } => {
            tracker
                .clear(&session)
                .with_context(|| format!("cannot clear usage session '{session}'"))?;
            if json {
                print_json(&serde_json::json!({ "session": session, "cleared": true }))?;
            } else {
                println!("Cleared usage session {session}");
            }
        }
    }
    Ok(())
}
