//! Active-Feature Registry (`active-features.yaml`).
//!
//! An index for discovery and listing, not a source of truth: each feature's
//! own `state.yaml` wins on conflict. Mutations still run under the
//! registry's lock so two `init`s cannot drop each other's entry.
//! [`Registry::refresh`] rebuilds the index from the directories on disk and
//! is the one place where last-writer-wins is accepted.

use crate::error::{BatonError, Result};
use crate::lock::LockManager;
use crate::paths;
use crate::state::{FeatureStatus, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub feature_id: String,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: FeatureStatus,
}

#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    locks: LockManager,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>, locks: LockManager) -> Self {
        Self {
            root: root.into(),
            locks,
        }
    }

    fn path(&self) -> PathBuf {
        paths::registry_path(&self.root)
    }

    // ---------------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------------

    pub fn list(&self) -> Result<Vec<RegistryEntry>> {
        load(&self.path())
    }

    // ---------------------------------------------------------------------------
    // Locked mutations
    // ---------------------------------------------------------------------------

    fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<RegistryEntry>),
    {
        let path = self.path();
        let guard = self.locks.acquire(&path)?;
        let mut entries = load(&path)?;
        f(&mut entries);
        save(&path, &entries)?;
        guard.release()
    }

    /// Add or replace the entry for `feature_id`.
    pub fn register(&self, feature_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        self.mutate(|entries| {
            entries.retain(|e| e.feature_id != feature_id);
            entries.push(RegistryEntry {
                feature_id: feature_id.to_string(),
                started_at,
                last_active: now,
                status: FeatureStatus::Active,
            });
        })
    }

    /// Bump `last_active`. Unknown ids are ignored.
    pub fn touch(&self, feature_id: &str) -> Result<()> {
        let now = Utc::now();
        self.mutate(|entries| {
            if let Some(e) = entries.iter_mut().find(|e| e.feature_id == feature_id) {
                e.last_active = now;
            }
        })
    }

    pub fn set_status(&self, feature_id: &str, status: FeatureStatus) -> Result<()> {
        let now = Utc::now();
        self.mutate(|entries| {
            if let Some(e) = entries.iter_mut().find(|e| e.feature_id == feature_id) {
                e.status = status;
                e.last_active = now;
            }
        })
    }

    pub fn remove(&self, feature_id: &str) -> Result<()> {
        self.mutate(|entries| entries.retain(|e| e.feature_id != feature_id))
    }

    /// Rebuild the index from every feature directory under the root.
    ///
    /// Directories whose state file is unreadable are skipped with a warning
    /// rather than failing the whole refresh.
    pub fn refresh(&self) -> Result<Vec<RegistryEntry>> {
        let mut rebuilt = Vec::new();
        if self.root.is_dir() {
            for entry in std::fs::read_dir(&self.root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let feature_id = entry.file_name().to_string_lossy().into_owned();
                if feature_id.starts_with('.') {
                    continue;
                }
                let state_path = paths::state_path(&self.root, &feature_id);
                if !state_path.exists() {
                    continue;
                }
                match State::load(&state_path, &feature_id) {
                    Ok(state) => rebuilt.push(RegistryEntry {
                        feature_id,
                        started_at: state.started_at,
                        last_active: state.last_updated,
                        status: state.status,
                    }),
                    Err(e) => warn!(feature = %feature_id, error = %e, "skipping unreadable feature"),
                }
            }
        }
        rebuilt.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        // The old index is never read here, so a corrupt file is replaced.
        let path = self.path();
        let guard = self.locks.acquire(&path)?;
        save(&path, &rebuilt)?;
        guard.release()?;
        info!(count = rebuilt.len(), "registry refreshed");
        Ok(rebuilt)
    }
}

fn load(path: &Path) -> Result<Vec<RegistryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)?;
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&data).map_err(|e| BatonError::corrupt(path, e))
}

fn save(path: &Path, entries: &[RegistryEntry]) -> Result<()> {
    let data = serde_yaml::to_string(entries)?;
    crate::io::atomic_write(path, data.as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Registry {
        Registry::new(dir.path(), LockManager::new(Duration::from_secs(5)))
    }

    fn entry(reg: &Registry, feature_id: &str) -> Option<RegistryEntry> {
        reg.list()
            .unwrap()
            .into_iter()
            .find(|e| e.feature_id == feature_id)
    }

    #[test]
    fn register_touch_remove() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register("a-2025-01-01", Utc::now()).unwrap();
        reg.register("b-2025-01-01", Utc::now()).unwrap();
        assert_eq!(reg.list().unwrap().len(), 2);

        let before = entry(&reg, "a-2025-01-01").unwrap().last_active;
        std::thread::sleep(Duration::from_millis(2));
        reg.touch("a-2025-01-01").unwrap();
        assert!(entry(&reg, "a-2025-01-01").unwrap().last_active > before);

        reg.remove("a-2025-01-01").unwrap();
        let ids: Vec<_> = reg.list().unwrap().into_iter().map(|e| e.feature_id).collect();
        assert_eq!(ids, vec!["b-2025-01-01"]);
    }

    #[test]
    fn register_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register("a", Utc::now()).unwrap();
        reg.register("a", Utc::now()).unwrap();
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_registrations_are_all_kept() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let reg = Registry::new(root, LockManager::new(Duration::from_secs(10)));
                    reg.register(&format!("f{i}"), Utc::now()).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry(&dir).list().unwrap().len(), 10);
    }

    #[test]
    fn refresh_rebuilds_from_disk() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.register("ghost", Utc::now()).unwrap();

        let feature = dir.path().join("real-2025-01-01");
        std::fs::create_dir_all(&feature).unwrap();
        State::new("real-2025-01-01")
            .save(&feature.join("state.yaml"))
            .unwrap();
        std::fs::create_dir_all(dir.path().join(".archive/old")).unwrap();

        let entries = reg.refresh().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].feature_id, "real-2025-01-01");
        assert!(entry(&reg, "ghost").is_none());
    }

    #[test]
    fn corrupt_registry_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("active-features.yaml"), "{not: [a list").unwrap();
        assert!(matches!(
            registry(&dir).list(),
            Err(BatonError::CorruptState { .. })
        ));

        let reg = registry(&dir);
        assert!(reg.refresh().unwrap().is_empty());
        assert!(reg.list().unwrap().is_empty());
    }
}
