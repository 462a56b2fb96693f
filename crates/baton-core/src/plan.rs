use crate::error::{BatonError, Result};
use crate::types::{TaskStatus, TddPhase};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub const PLAN_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Task metadata
// ---------------------------------------------------------------------------

/// Tests-written marker. Present once the red phase has succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestMeta {
    pub written_at: DateTime<Utc>,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageMeta {
    pub required: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tdd_phase: Option<TddPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            tdd_phase: None,
            test: None,
            coverage: None,
            model: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn tests_written(&self) -> bool {
        self.test.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// `implementation-plan.yaml`: feature metadata plus ordered phases of tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub version: u32,
    pub feature_id: String,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
}

impl Plan {
    pub fn new(feature_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: PLAN_VERSION,
            feature_id: feature_id.into(),
            description: description.into(),
            created_at: Utc::now(),
            phases: Vec::new(),
        }
    }

    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    pub fn load(path: &Path, expected_id: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let plan: Plan = serde_yaml::from_str(&data).map_err(|e| BatonError::corrupt(path, e))?;
        if plan.version != PLAN_VERSION {
            return Err(BatonError::corrupt(
                path,
                format!("unsupported schema version {}", plan.version),
            ));
        }
        if plan.feature_id != expected_id {
            return Err(BatonError::corrupt(
                path,
                format!(
                    "feature_id '{}' does not match directory '{expected_id}'",
                    plan.feature_id
                ),
            ));
        }
        let mut seen = HashSet::new();
        for task in plan.tasks() {
            if !seen.insert(task.id.as_str()) {
                return Err(BatonError::corrupt(
                    path,
                    format!("duplicate task id '{}'", task.id),
                ));
            }
        }
        Ok(plan)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    // ---------------------------------------------------------------------------
    // Structure
    // ---------------------------------------------------------------------------

    /// Add a phase if it does not exist yet; returns its index.
    pub fn add_phase(&mut self, name: impl Into<String>) -> usize {
        let name = name.into();
        if let Some(i) = self.phases.iter().position(|p| p.name == name) {
            return i;
        }
        self.phases.push(PlanPhase {
            name,
            tasks: Vec::new(),
        });
        self.phases.len() - 1
    }

    /// Append a task to `phase` (created on demand). Ids are `T1`, `T2`, …
    /// and unique across the whole plan.
    pub fn add_task(&mut self, phase: &str, description: impl Into<String>) -> String {
        let next = self
            .tasks()
            .filter_map(|t| t.id.strip_prefix('T')?.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let id = format!("T{next}");
        let idx = self.add_phase(phase);
        self.phases[idx].tasks.push(Task::new(id.clone(), description));
        id
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.phases.iter().flat_map(|p| p.tasks.iter())
    }

    pub fn task(&self, id: &str) -> Result<&Task> {
        self.tasks()
            .find(|t| t.id == id)
            .ok_or_else(|| BatonError::TaskNotFound(id.to_string()))
    }

    pub fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.tasks.iter_mut())
            .find(|t| t.id == id)
            .ok_or_else(|| BatonError::TaskNotFound(id.to_string()))
    }

    /// First pending or in-progress task in phase order.
    pub fn next_task(&self) -> Option<&Task> {
        self.tasks()
            .find(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
    }

    /// Human-readable summary: "3/5 completed, 1 in progress, 1 blocked, 0 failed"
    pub fn summarize(&self) -> String {
        let count = |s: TaskStatus| self.tasks().filter(|t| t.status == s).count();
        let total = self.tasks().count();
        format!(
            "{}/{total} completed, {} in progress, {} blocked, {} failed",
            count(TaskStatus::Completed),
            count(TaskStatus::InProgress),
            count(TaskStatus::Blocked),
            count(TaskStatus::Failed),
        )
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
    fn task_ids_are_unique_across_phases() {
        let mut plan = Plan::new("demo", "Demo feature");
        let t1 = plan.add_task("setup", "Scaffold crate");
        let t2 = plan.add_task("core", "Write parser");
        let t3 = plan.add_task("setup", "Add CI");
        assert_eq!((t1.as_str(), t2.as_str(), t3.as_str()), ("T1", "T2", "T3"));
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[0].tasks.len(), 2);
    }

    #[test]
    fn next_task_follows_phase_order() {
        let mut plan = Plan::new("demo", "");
        let t1 = plan.add_task("one", "first");
        plan.add_task("two", "second");
        assert_eq!(plan.next_task().unwrap().id, t1);

        plan.task_mut(&t1).unwrap().status = TaskStatus::Completed;
        assert_eq!(plan.next_task().unwrap().id, "T2");
    }

    #[test]
    fn task_not_found() {
        let mut plan = Plan::new("demo", "");
        assert!(matches!(
            plan.task_mut("T99"),
            Err(BatonError::TaskNotFound(_))
        ));
    }

    #[test]
    fn summarize_counts_statuses() {
        let mut plan = Plan::new("demo", "");
        for d in ["a", "b", "c"] {
            plan.add_task("p", d);
        }
        plan.task_mut("T1").unwrap().status = TaskStatus::Completed;
        plan.task_mut("T2").unwrap().status = TaskStatus::Blocked;
        assert_eq!(
            plan.summarize(),
            "1/3 completed, 0 in progress, 1 blocked, 0 failed"
        );
    }

    #[test]
    fn plan_roundtrip_and_duplicate_detection() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("implementation-plan.yaml");
        let mut plan = Plan::new("demo", "Demo");
        plan.add_task("core", "Parser");
        plan.save(&path).unwrap();
        assert_eq!(Plan::load(&path, "demo").unwrap(), plan);

        plan.phases[0].tasks.push(Task::new("T1", "dupe"));
        plan.save(&path).unwrap();
        let err = Plan::load(&path, "demo").unwrap_err();
        assert!(err.to_string().contains("duplicate task id 'T1'"));
    }
}
