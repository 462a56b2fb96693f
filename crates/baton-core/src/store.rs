//! Session Store: one directory per feature under the session root.
//!
//! ```text
//! <root>/
//!   active-features.yaml
//!   <feature_id>/
//!     state.yaml
//!     implementation-plan.yaml
//!     history.jsonl
//!     artifacts/
//!   .archive/<feature_id>-<timestamp>/
//! ```
//!
//! Every operation takes a feature id and touches only that feature's
//! directory plus the shared registry.

use crate::error::{BatonError, Result};
use crate::history::{command, HistoryEvent, HistoryLedger};
use crate::lock::LockManager;
use crate::paths;
use crate::plan::Plan;
use crate::registry::{Registry, RegistryEntry};
use crate::state::{FeatureStatus, State};
use crate::types::TddPhase;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Move the directory under `.archive/`.
    Archive,
    Delete,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    locks: LockManager,
    registry: Registry,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, locks: LockManager) -> Self {
        let root = root.into();
        Self {
            registry: Registry::new(root.clone(), locks),
            root,
            locks,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> LockManager {
        self.locks
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn exists(&self, feature_id: &str) -> bool {
        paths::state_path(&self.root, feature_id).exists()
    }

    fn require(&self, feature_id: &str) -> Result<()> {
        paths::validate_slug(feature_id)?;
        if !paths::feature_dir(&self.root, feature_id).is_dir() {
            return Err(BatonError::FeatureNotFound(feature_id.to_string()));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Lifecycle of a feature
    // ---------------------------------------------------------------------------

    /// Create the feature directory with a fresh state, an empty plan, an
    /// empty ledger holding one `init` event, and a registry entry.
    pub fn create(&self, feature_id: &str, description: &str) -> Result<State> {
        paths::validate_slug(feature_id)?;
        crate::io::ensure_dir(&self.root)?;
        let dir = paths::feature_dir(&self.root, feature_id);
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BatonError::FeatureExists(feature_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let state = State::new(feature_id);
        {
            let state_path = paths::state_path(&self.root, feature_id);
            let _guard = self.locks.acquire(&state_path)?;
            state.save(&state_path)?;
        }
        Plan::new(feature_id, description).save(&paths::plan_path(&self.root, feature_id))?;
        crate::io::ensure_dir(&paths::artifacts_dir(&self.root, feature_id))?;

        let ledger = HistoryLedger::new(paths::history_path(&self.root, feature_id));
        crate::io::touch(ledger.path())?;
        ledger.append(&HistoryEvent::success(command::INIT).with_args([feature_id, description]))?;

        if let Err(e) = self.registry.register(feature_id, state.started_at) {
            warn!(
                feature = feature_id,
                error = %e,
                "feature created but not registered; run `baton features refresh`"
            );
        }
        info!(feature = feature_id, "feature created");
        Ok(state)
    }

    pub fn read(&self, feature_id: &str) -> Result<State> {
        paths::validate_slug(feature_id)?;
        let path = paths::state_path(&self.root, feature_id);
        if !path.exists() {
            return Err(BatonError::FeatureNotFound(feature_id.to_string()));
        }
        State::load(&path, feature_id)
    }

    pub fn list(&self) -> Result<Vec<RegistryEntry>> {
        self.registry.list()
    }

    /// Remove a feature: archive it under `.archive/` or delete it outright.
    /// Returns the archive location when archiving.
    pub fn cleanup(&self, feature_id: &str, mode: CleanupMode) -> Result<Option<PathBuf>> {
        self.require(feature_id)?;
        let dir = paths::feature_dir(&self.root, feature_id);

        let archived = match mode {
            CleanupMode::Archive => {
                let archive = paths::archive_dir(&self.root);
                crate::io::ensure_dir(&archive)?;
                let dest = archive.join(format!(
                    "{feature_id}-{}",
                    Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
                ));
                // The status write and the move share one guard.
                let state_path = paths::state_path(&self.root, feature_id);
                let guard = self.locks.acquire(&state_path)?;
                if self.exists(feature_id) {
                    let mut state =
                        State::load(&state_path, feature_id)?.with_status(FeatureStatus::Archived);
                    state.last_updated = next_timestamp(state.last_updated);
                    state.save(&state_path)?;
                }
                std::fs::rename(&dir, &dest)?;
                drop(guard);
                Some(dest)
            }
            CleanupMode::Delete => {
                let state_path = paths::state_path(&self.root, feature_id);
                let guard = self.locks.acquire(&state_path)?;
                std::fs::remove_dir_all(&dir)?;
                drop(guard);
                None
            }
        };

        if let Err(e) = self.registry.remove(feature_id) {
            warn!(
                feature = feature_id,
                error = %e,
                "registry entry not removed; run `baton features refresh`"
            );
        }
        info!(feature = feature_id, ?mode, "feature cleaned up");
        Ok(archived)
    }

    // ---------------------------------------------------------------------------
    // State updates
    // ---------------------------------------------------------------------------

    /// Locked read-modify-write of the feature's state.
    ///
    /// The mutator sees the current state and returns the next one. If it
    /// fails nothing is written. `last_updated` always moves strictly
    /// forward, even when the clock has not.
    pub fn try_update<F>(&self, feature_id: &str, mutator: F) -> Result<State>
    where
        F: FnOnce(State) -> Result<State>,
    {
        self.require(feature_id)?;
        let path = paths::state_path(&self.root, feature_id);
        let guard = self.locks.acquire(&path)?;

        let current = State::load(&path, feature_id)?;
        let previous = current.last_updated;
        let started_at = current.started_at;
        let mut next = mutator(current)?;

        next.version = crate::state::STATE_VERSION;
        next.feature_id = feature_id.to_string();
        next.started_at = started_at;
        next.last_updated = next_timestamp(previous);

        next.save(&path)?;
        guard.release()?;

        if let Err(e) = self.registry.touch(feature_id) {
            warn!(feature = feature_id, error = %e, "registry touch failed");
        }
        info!(
            feature = feature_id,
            active_task = next.active_task.as_deref().unwrap_or("-"),
            model = next.model_in_use.as_deref().unwrap_or("-"),
            "state updated"
        );
        Ok(next)
    }

    pub fn update<F>(&self, feature_id: &str, mutator: F) -> Result<State>
    where
        F: FnOnce(State) -> State,
    {
        self.try_update(feature_id, |s| Ok(mutator(s)))
    }

    // ---------------------------------------------------------------------------
    // Ledger and plan
    // ---------------------------------------------------------------------------

    pub fn ledger(&self, feature_id: &str) -> Result<HistoryLedger> {
        self.require(feature_id)?;
        Ok(HistoryLedger::new(paths::history_path(&self.root, feature_id)))
    }

    pub fn record(&self, feature_id: &str, event: &HistoryEvent) -> Result<()> {
        self.ledger(feature_id)?.append(event)
    }

    pub fn load_plan(&self, feature_id: &str) -> Result<Plan> {
        self.require(feature_id)?;
        Plan::load(&paths::plan_path(&self.root, feature_id), feature_id)
    }

    pub fn save_plan(&self, feature_id: &str, plan: &Plan) -> Result<()> {
        self.update_plan(feature_id, |p| {
            *p = plan.clone();
            Ok(())
        })
    }

    /// Locked read-modify-write of the plan. The plan is only written when
    /// the mutator succeeds.
    pub fn update_plan<F, T>(&self, feature_id: &str, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut Plan) -> Result<T>,
    {
        self.require(feature_id)?;
        let path = paths::plan_path(&self.root, feature_id);
        let guard = self.locks.acquire(&path)?;
        let mut plan = Plan::load(&path, feature_id)?;
        let out = mutator(&mut plan)?;
        plan.feature_id = feature_id.to_string();
        plan.save(&path)?;
        guard.release()?;
        Ok(out)
    }

    // ---------------------------------------------------------------------------
    // Recovery
    // ---------------------------------------------------------------------------

    /// Rebuild `state.yaml` by replaying the ledger.
    ///
    /// Events are ordered by their own timestamps. The model of the last
    /// successful event becomes `model_in_use`; task events decide
    /// `active_task`; the earliest event gives `started_at`.
    pub fn reconstruct(&self, feature_id: &str) -> Result<State> {
        self.require(feature_id)?;
        let ledger = HistoryLedger::new(paths::history_path(&self.root, feature_id));
        let mut events = if ledger.path().exists() {
            ledger.read()?.collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        events.sort_by_key(|e| e.timestamp);

        let mut state = State::new(feature_id);
        if let Some(first) = events.first() {
            state.started_at = first.timestamp;
        } else if let Ok(plan) = self.load_plan(feature_id) {
            state.started_at = plan.created_at;
        }

        let active_commands = [
            command::TASK_START,
            TddPhase::Red.command(),
            TddPhase::Green.command(),
            TddPhase::Refactor.command(),
        ];
        let closing_commands = [command::TASK_COMPLETE, command::TASK_BLOCK, command::TASK_FAIL];
        for event in &events {
            if event.is_success() {
                if let Some(model) = &event.model {
                    state.model_in_use = Some(model.clone());
                }
            }
            let Some(task) = &event.task_id else { continue };
            if event.is_success() && active_commands.contains(&event.command.as_str()) {
                state.active_task = Some(task.clone());
            } else if closing_commands.contains(&event.command.as_str())
                && (event.is_success() || event.command == command::TASK_FAIL)
                && state.active_task.as_deref() == Some(task.as_str())
            {
                state.active_task = None;
            }
        }

        let path = paths::state_path(&self.root, feature_id);
        let guard = self.locks.acquire(&path)?;
        let last_event = events.last().map(|e| e.timestamp);
        state.last_updated = last_event.map_or(Utc::now(), |t| t.max(Utc::now()));
        state.save(&path)?;
        guard.release()?;

        ledger.append(&HistoryEvent::success(command::RECONSTRUCT).with_args([feature_id]))?;
        info!(
            feature = feature_id,
            replayed = events.len(),
            "state reconstructed from history"
        );
        Ok(state)
    }
}

/// The current time, or one microsecond past `previous` if the clock has
/// not moved beyond it.
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + ChronoDuration::microseconds(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskStatus;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path(), LockManager::new(Duration::from_secs(20)))
    }

    fn snapshot(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
        let mut out = BTreeMap::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            for entry in std::fs::read_dir(&d).unwrap() {
                let p = entry.unwrap().path();
                if p.is_dir() {
                    stack.push(p);
                } else {
                    out.insert(p.clone(), std::fs::read(&p).unwrap());
                }
            }
        }
        out
    }

    #[test]
    fn create_lays_out_feature() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let state = s.create("demo-2025-01-01", "Demo").unwrap();
        assert_eq!(state.status, FeatureStatus::Active);

        let fdir = dir.path().join("demo-2025-01-01");
        assert!(fdir.join("state.yaml").is_file());
        assert!(fdir.join("implementation-plan.yaml").is_file());
        assert!(fdir.join("artifacts").is_dir());
        let events = s.ledger("demo-2025-01-01").unwrap().tail(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command, "init");
        assert_eq!(s.list().unwrap()[0].feature_id, "demo-2025-01-01");
    }

    #[test]
    fn create_twice_is_rejected() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create("demo", "").unwrap();
        assert!(matches!(
            s.create("demo", ""),
            Err(BatonError::FeatureExists(_))
        ));
    }

    #[test]
    fn read_missing_feature() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            store(&dir).read("nope"),
            Err(BatonError::FeatureNotFound(_))
        ));
        assert!(matches!(
            store(&dir).read("../escape"),
            Err(BatonError::InvalidSlug(_))
        ));
    }

    #[test]
    fn failed_mutator_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create("demo", "").unwrap();
        let before = std::fs::read(dir.path().join("demo/state.yaml")).unwrap();
        let err = s
            .try_update("demo", |_| Err(BatonError::TaskNotFound("T9".into())))
            .unwrap_err();
        assert!(matches!(err, BatonError::TaskNotFound(_)));
        assert_eq!(std::fs::read(dir.path().join("demo/state.yaml")).unwrap(), before);
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let dir = TempDir::new().unwrap();
        store(&dir).create("demo", "").unwrap();
        let root = dir.path().to_path_buf();
        let threads = 8;
        let per_thread = 10;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let s = SessionStore::new(root, LockManager::new(Duration::from_secs(30)));
                    (0..per_thread)
                        .map(|i| {
                            s.update("demo", |st| st.with_active_task(format!("T{t}-{i}")))
                                .unwrap()
                                .last_updated
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut stamps: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        stamps.sort();
        stamps.dedup();
        assert_eq!(stamps.len(), threads * per_thread);

        let last = store(&dir).read("demo").unwrap();
        assert_eq!(last.last_updated, *stamps.last().unwrap());
    }

    #[test]
    fn end_to_end_demo_feature() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create("demo-2025-01-01", "Demo").unwrap();
        let first = s
            .update("demo-2025-01-01", |st| st.with_active_task("T1").with_model("gemini"))
            .unwrap();
        s.record(
            "demo-2025-01-01",
            &HistoryEvent::success("plan").with_model("gemini"),
        )
        .unwrap();
        let read = s.read("demo-2025-01-01").unwrap();
        assert_eq!(read.active_task.as_deref(), Some("T1"));
        assert_eq!(read.model_in_use.as_deref(), Some("gemini"));

        let root = dir.path().to_path_buf();
        let other = std::thread::spawn(move || {
            SessionStore::new(root, LockManager::new(Duration::from_secs(10)))
                .update("demo-2025-01-01", |st| st.with_active_task("T2"))
                .unwrap()
        });
        other.join().unwrap();

        let last = s.read("demo-2025-01-01").unwrap();
        assert_eq!(last.active_task.as_deref(), Some("T2"));
        assert_eq!(last.model_in_use.as_deref(), Some("gemini"));
        assert!(last.last_updated > first.last_updated);
    }

    #[test]
    fn cleanup_touches_only_target() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create("keep-2025-01-01", "keep").unwrap();
        s.create("drop-2025-01-01", "drop").unwrap();
        s.create("gone-2025-01-01", "gone").unwrap();
        let keep_dir = dir.path().join("keep-2025-01-01");
        let before = snapshot(&keep_dir);

        let dest = s.cleanup("drop-2025-01-01", CleanupMode::Archive).unwrap().unwrap();
        assert!(dest.join("state.yaml").is_file());
        assert!(dest.starts_with(dir.path().join(".archive")));
        assert!(!dir.path().join("drop-2025-01-01").exists());

        assert!(s.cleanup("gone-2025-01-01", CleanupMode::Delete).unwrap().is_none());
        assert!(!dir.path().join("gone-2025-01-01").exists());

        assert_eq!(snapshot(&keep_dir), before);
        let ids: Vec<_> = s.list().unwrap().into_iter().map(|e| e.feature_id).collect();
        assert_eq!(ids, vec!["keep-2025-01-01"]);
    }

    #[test]
    fn archived_copy_records_archived_status() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let created = s.create("old-2025-01-01", "old").unwrap();
        s.update("old-2025-01-01", |st| st.with_active_task("T1")).unwrap();

        let dest = s.cleanup("old-2025-01-01", CleanupMode::Archive).unwrap().unwrap();
        let archived = State::load(&dest.join("state.yaml"), "old-2025-01-01").unwrap();
        assert_eq!(archived.status, FeatureStatus::Archived);
        assert_eq!(archived.active_task.as_deref(), Some("T1"));
        assert!(archived.last_updated > created.last_updated);
    }

    #[test]
    fn corrupt_registry_does_not_break_create_or_cleanup() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        std::fs::write(dir.path().join("active-features.yaml"), "[oops").unwrap();

        s.create("demo-2025-01-01", "Demo").unwrap();
        s.create("other-2025-01-01", "Other").unwrap();
        assert!(dir.path().join("demo-2025-01-01/state.yaml").is_file());
        assert!(matches!(
            s.create("demo-2025-01-01", "Demo"),
            Err(BatonError::FeatureExists(_))
        ));

        s.cleanup("other-2025-01-01", CleanupMode::Delete).unwrap();
        assert!(!dir.path().join("other-2025-01-01").exists());

        let ids: Vec<_> = s
            .registry()
            .refresh()
            .unwrap()
            .into_iter()
            .map(|e| e.feature_id)
            .collect();
        assert_eq!(ids, vec!["demo-2025-01-01"]);
        assert_eq!(s.list().unwrap().len(), 1);
    }

    #[test]
    fn plan_updates_are_locked_and_persisted() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create("demo", "").unwrap();
        let id = s
            .update_plan("demo", |p| Ok(p.add_task("core", "Parser")))
            .unwrap();
        s.update_plan("demo", |p| {
            p.task_mut(&id)?.status = TaskStatus::InProgress;
            Ok(())
        })
        .unwrap();
        assert_eq!(
            s.load_plan("demo").unwrap().task(&id).unwrap().status,
            TaskStatus::InProgress
        );
        assert!(s
            .update_plan("demo", |p| p.task_mut("T42").map(|_| ()))
            .is_err());
    }

    #[test]
    fn reconstruct_replays_history() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.create("demo", "").unwrap();
        let ledger = s.ledger("demo").unwrap();
        ledger
            .append(&HistoryEvent::success(command::TASK_START).with_task("T1"))
            .unwrap();
        ledger
            .append(
                &HistoryEvent::success("write-tests")
                    .with_task("T1")
                    .with_model("gemini"),
            )
            .unwrap();
        ledger
            .append(
                &HistoryEvent::failure("implement", "timed out")
                    .with_task("T1")
                    .with_model("gemini"),
            )
            .unwrap();
        ledger
            .append(
                &HistoryEvent::success("implement")
                    .with_task("T1")
                    .with_model("claude"),
            )
            .unwrap();

        std::fs::write(dir.path().join("demo/state.yaml"), "garbage: [").unwrap();
        assert!(matches!(
            s.read("demo"),
            Err(BatonError::CorruptState { .. })
        ));

        let rebuilt = s.reconstruct("demo").unwrap();
        assert_eq!(rebuilt.active_task.as_deref(), Some("T1"));
        assert_eq!(rebuilt.model_in_use.as_deref(), Some("claude"));
        assert_eq!(s.read("demo").unwrap(), rebuilt);

        ledger
            .append(&HistoryEvent::success(command::TASK_COMPLETE).with_task("T1"))
            .unwrap();
        assert_eq!(s.reconstruct("demo").unwrap().active_task, None);
    }
}
