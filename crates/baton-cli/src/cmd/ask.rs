use crate::output::print_json;
use crate::project::{runtime, Project};
use anyhow::Context;
use baton_core::history::command;
use baton_core::router::RouteRequest;
use std::path::Path;

pub fn run(
    root: &Path,
    feature: &str,
    prompt: &str,
    backend: Option<String>,
    session: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    let project = Project::load(root)?;
    let store = project.store();
    let router = project.router();
    let request = RouteRequest::new(command::ASK, prompt)
        .with_backend(backend)
        .with_usage_session(session);

    let outcome = runtime()?
        .block_on(router.route(&store, feature, &request))
        .with_context(|| format!("no backend answered for '{feature}'"))?;

    if json {
        print_json(&outcome)?;
    } else {
        println!("{}", outcome.text);
    }
    Ok(())
}
