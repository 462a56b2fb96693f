use crate::output::print_json;
use crate::project::Project;
use baton_core::config::WarnLevel;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration (defaults filled in)
    Show,
    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    let project = Project::load(root)?;
    match subcmd {
        ConfigSubcommand::Show => {
            if json {
                print_json(&project.config)?;
            } else {
                print!("{}", serde_yaml::to_string(&project.config)?);
            }
            Ok(())
        }
        ConfigSubcommand::Validate => {
            let warnings = project.config.validate();
            let errors = warnings
                .iter()
                .filter(|w| w.level == WarnLevel::Error)
                .count();
            if json {
                print_json(&serde_json::json!({ "ok": errors == 0, "warnings": warnings }))?;
            } else if warnings.is_empty() {
                println!("Config OK");
            } else {
                for w in &warnings {
                    let tag = match w.level {
                        WarnLevel::Error => "error",
                        WarnLevel::Warning => "warning",
                    };
                    println!("{tag}: {}", w.message);
                }
            }
            if errors > 0 {
                anyhow::bail!("config has {errors} error(s)");
            }
            Ok(())
        }
    }
}
