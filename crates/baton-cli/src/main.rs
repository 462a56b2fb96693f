mod cmd;
mod output;
mod project;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, features::FeaturesSubcommand, state::StateSubcommand,
    task::TaskSubcommand, usage::UsageSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "baton",
    about = "Hand tasks between AI backends with a locked on-disk session store and audit ledger",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .baton/ or .git/)
    #[arg(long, global = true, env = "BATON_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a feature session (id is `<slug>-<date>`)
    Init {
        slug: String,
        /// Feature description stored in the plan
        #[arg(long, short = 'd', default_value = "")]
        description: String,
        /// Date suffix (YYYY-MM-DD, default: today)
        #[arg(long)]
        date: Option<String>,
    },

    /// Show or change a feature's state record
    State {
        #[command(subcommand)]
        subcommand: StateSubcommand,
    },

    /// Print a feature's history ledger
    History {
        feature: String,
        /// Only the last N events
        #[arg(long)]
        tail: Option<usize>,
        /// Keep printing new events as they are appended
        #[arg(long, short = 'f')]
        follow: bool,
        /// Only events for this task
        #[arg(long)]
        task: Option<String>,
    },

    /// List or rebuild the active-feature registry
    Features {
        #[command(subcommand)]
        subcommand: FeaturesSubcommand,
    },

    /// Archive a feature (or delete it with --delete)
    Cleanup {
        feature: String,
        #[arg(long)]
        delete: bool,
    },

    /// Rebuild a feature's state record from its history ledger
    Reconstruct { feature: String },

    /// Manage and drive tasks through red/green/refactor
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Send a one-shot prompt through the model router
    Ask {
        feature: String,
        #[arg(required = true)]
        prompt: Vec<String>,
        /// Use exactly this backend (no fallback)
        #[arg(long)]
        backend: Option<String>,
        /// Usage session to charge
        #[arg(long)]
        session: Option<String>,
    },

    /// Inspect AI usage and cost
    Usage {
        #[command(subcommand)]
        subcommand: UsageSubcommand,
    },

    /// Show or validate the project configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init {
            slug,
            description,
            date,
        } => cmd::init::run(&root, &slug, &description, date.as_deref(), cli.json),
        Commands::State { subcommand } => cmd::state::run(&root, subcommand, cli.json),
        Commands::History {
            feature,
            tail,
            follow,
            task,
        } => cmd::history::run(&root, &feature, tail, follow, task.as_deref(), cli.json),
        Commands::Features { subcommand } => cmd::features::run(&root, subcommand, cli.json),
        Commands::Cleanup { feature, delete } => {
            cmd::features::cleanup(&root, &feature, delete, cli.json)
        }
        Commands::Reconstruct { feature } => cmd::features::reconstruct(&root, &feature, cli.json),
        Commands::Task { subcommand } => cmd::task::run(&root, subcommand, cli.json),
        Commands::Ask {
            feature,
            prompt,
            backend,
            session,
        } => cmd::ask::run(&root, &feature, &prompt.join(" "), backend, session, cli.json),
        Commands::Usage { subcommand } => cmd::usage::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
