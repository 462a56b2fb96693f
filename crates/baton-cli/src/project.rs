use anyhow::Context;
use baton_core::config::Config;
use baton_core::lifecycle::TaskEngine;
use baton_core::router::ModelRouter;
use baton_core::store::SessionStore;
use baton_core::usage::UsageTracker;
use baton_invoker::ProcessInvoker;
use std::path::{Path, PathBuf};

/// Project root plus its loaded configuration; builds the core components
/// every command needs.
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
}

impl Project {
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let config = Config::load(root).context("failed to load .baton/config.yaml")?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    pub fn store(&self) -> SessionStore {
        SessionStore::new(
            self.config.features_root(&self.root),
            self.config.lock_manager(),
        )
    }

    pub fn usage(&self) -> UsageTracker {
        UsageTracker::new(
            self.config.sessions_root(&self.root),
            self.config.lock_manager(),
            self.config.rates.clone(),
        )
    }

    pub fn router(&self) -> ModelRouter<ProcessInvoker> {
        ModelRouter::from_config(ProcessInvoker::from_config(&self.config), &self.config)
            .with_usage(self.usage())
    }

    pub fn engine(&self) -> TaskEngine<ProcessInvoker> {
        TaskEngine::new(self.store(), self.router())
            .with_coverage_required(self.config.coverage_required)
    }
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start tokio runtime")
}
