use crate::error::{BatonError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;

pub const STATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// FeatureStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl FeatureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FeatureStatus::Active => "active",
            FeatureStatus::Paused => "paused",
            FeatureStatus::Completed => "completed",
            FeatureStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for FeatureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeatureStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(FeatureStatus::Active),
            "paused" => Ok(FeatureStatus::Paused),
            "completed" => Ok(FeatureStatus::Completed),
            "archived" => Ok(FeatureStatus::Archived),
            _ => Err(format!("unknown feature status '{s}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Current-focus record for one feature, persisted as `state.yaml`.
///
/// Every field is required on load. A missing or mistyped field is a
/// [`BatonError::CorruptState`], never a silent default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct State {
    pub version: u32,
    pub feature_id: String,
    #[serde(deserialize_with = "present")]
    pub active_task: Option<String>,
    #[serde(deserialize_with = "present")]
    pub model_in_use: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: FeatureStatus,
}

/// Optional value whose key must still be present (`null` is fine).
fn present<'de, D, T>(d: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d)
}

impl State {
    pub fn new(feature_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            feature_id: feature_id.into(),
            active_task: None,
            model_in_use: None,
            started_at: now,
            last_updated: now,
            status: FeatureStatus::Active,
        }
    }

    // ---------------------------------------------------------------------------
    // Pure mutators (old → new)
    // ---------------------------------------------------------------------------

    pub fn with_active_task(mut self, task_id: impl Into<String>) -> Self {
        self.active_task = Some(task_id.into());
        self
    }

    pub fn clear_active_task(mut self) -> Self {
        self.active_task = None;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_in_use = Some(model.into());
        self
    }

    pub fn with_status(mut self, status: FeatureStatus) -> Self {
        self.status = status;
        self
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    /// Parse and validate a state file. `expected_id` is the directory name
    /// the file was found under.
    pub fn parse(path: &Path, data: &str, expected_id: &str) -> Result<Self> {
        let state: State =
            serde_yaml::from_str(data).map_err(|e| BatonError::corrupt(path, e))?;
        if state.version != STATE_VERSION {
            return Err(BatonError::corrupt(
                path,
                format!("unsupported schema version {}", state.version),
            ));
        }
        if state.feature_id != expected_id {
            return Err(BatonError::corrupt(
                path,
                format!(
                    "feature_id '{}' does not match directory '{expected_id}'",
                    state.feature_id
                ),
            ));
        }
        if state.last_updated < state.started_at {
            return Err(BatonError::corrupt(path, "last_updated precedes started_at"));
        }
        Ok(state)
    }

    pub fn load(path: &Path, expected_id: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::parse(path, &data, expected_id)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn state_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.yaml");
        let state = State::new("demo-2025-01-01")
            .with_active_task("T1")
            .with_model("gemini");
        state.save(&path).unwrap();

        let loaded = State::load(&path, "demo-2025-01-01").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn missing_field_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.yaml");
        std::fs::write(
            &path,
            "version: 1\nfeature_id: demo\nactive_task: null\nstarted_at: 2025-01-01T00:00:00Z\nlast_updated: 2025-01-01T00:00:00Z\nstatus: active\n",
        )
        .unwrap();
        let err = State::load(&path, "demo").unwrap_err();
        assert!(matches!(err, BatonError::CorruptState { .. }), "{err}");
        assert!(err.to_string().contains("model_in_use"));
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.yaml");
        let yaml = serde_yaml::to_string(&State::new("demo"))
            .unwrap()
            .replace("status: active", "status: sleeping");
        std::fs::write(&path, yaml).unwrap();
        assert!(matches!(
            State::load(&path, "demo"),
            Err(BatonError::CorruptState { .. })
        ));
    }

    #[test]
    fn version_and_id_are_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.yaml");
        let mut state = State::new("demo");
        state.version = 7;
        state.save(&path).unwrap();
        assert!(State::load(&path, "demo")
            .unwrap_err()
            .to_string()
            .contains("schema version 7"));

        State::new("other").save(&path).unwrap();
        assert!(State::load(&path, "demo")
            .unwrap_err()
            .to_string()
            .contains("does not match"));
    }

    #[test]
    fn mutators_are_pure_builders() {
        let state = State::new("demo").with_active_task("T1").with_model("claude");
        let cleared = state.clone().clear_active_task();
        assert_eq!(state.active_task.as_deref(), Some("T1"));
        assert_eq!(cleared.active_task, None);
        assert_eq!(cleared.model_in_use.as_deref(), Some("claude"));
    }
}
