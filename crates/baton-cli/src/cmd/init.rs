use crate::output::print_json;
use crate::project::Project;
use anyhow::Context;
use baton_core::{io, paths};
use chrono::{NaiveDate, Utc};
use std::path::Path;

pub fn run(
    root: &Path,
    slug: &str,
    description: &str,
    date: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let project = Project::load(root)?;
    io::ensure_dir(&paths::baton_dir(root)).context("failed to create .baton/")?;
    if !paths::config_path(root).exists() {
        project
            .config
            .save(root)
            .context("failed to write default config")?;
    }

    let feature_id = match date {
        Some(d) => {
            let date = NaiveDate::parse_from_str(d, "%Y-%m-%d")
                .with_context(|| format!("invalid date '{d}' (expected YYYY-MM-DD)"))?;
            paths::feature_id(slug, date)?
        }
        None if paths::feature_date(slug).is_some() => {
            paths::validate_slug(slug)?;
            slug.to_string()
        }
        None => paths::feature_id(slug, Utc::now().date_naive())?,
    };

    let state = project
        .store()
        .create(&feature_id, description)
        .with_context(|| format!("cannot create feature '{feature_id}'"))?;

    if json {
        print_json(&serde_json::json!({ "feature_id": feature_id, "state": state }))?;
    } else {
        println!("Created feature {feature_id}");
    }
    Ok(())
}
