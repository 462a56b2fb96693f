//! Per-AI-session usage metadata (`<sessions_root>/<name>/metadata.json`).
//!
//! Writes are strict: the read-modify-write of one session runs entirely
//! under that session's lock, and a corrupt existing file is an error.
//! Queries are lenient: a missing or partial record contributes zeros and is
//! flagged `degraded` instead of failing the whole listing.

use crate::error::{BatonError, Result};
use crate::invoke::InvocationOutput;
use crate::lock::LockManager;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Rates
// ---------------------------------------------------------------------------

/// Linear price for one model, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl ModelRate {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

pub fn default_rates() -> BTreeMap<String, ModelRate> {
    let rate = |input_per_mtok, output_per_mtok| ModelRate {
        input_per_mtok,
        output_per_mtok,
    };
    BTreeMap::from([
        ("gemini".to_string(), rate(1.25, 10.0)),
        ("gemini-2.5-pro".to_string(), rate(1.25, 10.0)),
        ("gemini-2.5-flash".to_string(), rate(0.30, 2.50)),
        ("claude".to_string(), rate(3.0, 15.0)),
        ("claude-sonnet-4".to_string(), rate(3.0, 15.0)),
        ("claude-opus-4".to_string(), rate(15.0, 75.0)),
    ])
}

/// Exact match first, then the longest configured name that prefixes `model`.
fn rate_for<'a>(rates: &'a BTreeMap<String, ModelRate>, model: &str) -> Option<&'a ModelRate> {
    rates.get(model).or_else(|| {
        rates
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, r)| r)
    })
}

/// Approximate token count for text the backend did not count for us.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    /// True when token counts are the byte-length estimate.
    #[serde(default)]
    pub estimated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub session_name: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub session_id: Option<String>,
    pub interactions: Vec<Interaction>,
}

impl UsageMetadata {
    fn new(session_name: &str) -> Self {
        let now = Utc::now();
        Self {
            session_name: session_name.to_string(),
            created_at: now,
            last_used: now,
            session_id: None,
            interactions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub interactions: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// Set when the record was missing fields or unreadable.
    pub degraded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelTotals {
    pub interactions: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub sessions: usize,
    pub interactions: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub by_model: BTreeMap<String, ModelTotals>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Jsonl,
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "jsonl" => Ok(ExportFormat::Jsonl),
            _ => Err(format!("unknown export format '{s}' (expected json or jsonl)")),
        }
    }
}

// ---------------------------------------------------------------------------
// UsageTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UsageTracker {
    sessions_root: PathBuf,
    locks: LockManager,
    rates: BTreeMap<String, ModelRate>,
}

impl UsageTracker {
    pub fn new(
        sessions_root: impl Into<PathBuf>,
        locks: LockManager,
        rates: BTreeMap<String, ModelRate>,
    ) -> Self {
        Self {
            sessions_root: sessions_root.into(),
            locks,
            rates,
        }
    }

    pub fn sessions_root(&self) -> &Path {
        &self.sessions_root
    }

    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        match rate_for(&self.rates, model) {
            Some(rate) => rate.cost(input_tokens, output_tokens),
            None => {
                debug!(model, "no rate configured; cost is 0");
                0.0
            }
        }
    }

    /// Record one model interaction for `session_name`.
    ///
    /// Prefers backend-reported token counts and falls back to
    /// [`estimate_tokens`] on the prompt and response text.
    pub fn record_interaction(
        &self,
        session_name: &str,
        model: &str,
        prompt: &str,
        response: &InvocationOutput,
        duration: Duration,
    ) -> Result<Interaction> {
        paths::validate_slug(session_name)?;
        let path = paths::usage_metadata_path(&self.sessions_root, session_name);
        crate::io::ensure_dir(&paths::usage_session_dir(&self.sessions_root, session_name))?;

        let guard = self.locks.acquire(&path)?;
        let mut meta = if path.exists() {
            load_strict(&path)?
        } else {
            UsageMetadata::new(session_name)
        };

        let estimated = response.input_tokens.is_none() || response.output_tokens.is_none();
        let input_tokens = response
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(prompt));
        let output_tokens = response
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&response.text));
        let interaction = Interaction {
            timestamp: Utc::now(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd: self.cost(model, input_tokens, output_tokens),
            duration_ms: duration.as_millis() as u64,
            estimated,
        };

        if response.session_id.is_some() {
            meta.session_id = response.session_id.clone();
        }
        meta.last_used = interaction.timestamp.max(meta.last_used);
        meta.interactions.push(interaction.clone());

        let data = serde_json::to_vec_pretty(&meta)?;
        crate::io::atomic_write(&path, &data)?;
        guard.release()?;

        info!(
            session = session_name,
            model,
            input_tokens,
            output_tokens,
            cost_usd = interaction.cost_usd,
            "usage recorded"
        );
        Ok(interaction)
    }

    /// Strictly load one session's metadata.
    pub fn load(&self, session_name: &str) -> Result<UsageMetadata> {
        paths::validate_slug(session_name)?;
        let path = paths::usage_metadata_path(&self.sessions_root, session_name);
        if !path.exists() {
            return Err(BatonError::SessionNotFound(session_name.to_string()));
        }
        load_strict(&path)
    }

    /// Remove a session and its metadata.
    pub fn clear(&self, session_name: &str) -> Result<()> {
        paths::validate_slug(session_name)?;
        let dir = paths::usage_session_dir(&self.sessions_root, session_name);
        if !dir.is_dir() {
            return Err(BatonError::SessionNotFound(session_name.to_string()));
        }
        let path = paths::usage_metadata_path(&self.sessions_root, session_name);
        let guard = self.locks.acquire(&path)?;
        std::fs::remove_dir_all(&dir)?;
        drop(guard);
        info!(session = session_name, "usage session cleared");
        Ok(())
    }

    // ---------------------------------------------------------------------------
    // Lenient queries
    // ---------------------------------------------------------------------------

    /// Every session, newest `last_used` first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        Ok(self
            .scan()?
            .into_iter()
            .map(|(summary, _)| summary)
            .collect())
    }

    pub fn aggregate(&self) -> Result<UsageTotals> {
        let mut totals = UsageTotals::default();
        for (summary, interactions) in self.scan()? {
            totals.sessions += 1;
            totals.interactions += summary.interactions;
            totals.input_tokens += summary.input_tokens;
            totals.output_tokens += summary.output_tokens;
            totals.cost_usd += summary.cost_usd;
            for i in interactions {
                let m = totals.by_model.entry(i.model).or_default();
                m.interactions += 1;
                m.input_tokens += i.input_tokens;
                m.output_tokens += i.output_tokens;
                m.cost_usd += i.cost_usd;
            }
        }
        Ok(totals)
    }

    pub fn export(&self, format: ExportFormat) -> Result<String> {
        let sessions = self.list()?;
        match format {
            ExportFormat::Json => {
                let totals = self.aggregate()?;
                Ok(serde_json::to_string_pretty(&serde_json::json!({
                    "sessions": sessions,
                    "totals": totals,
                }))?)
            }
            ExportFormat::Jsonl => {
                let mut out = String::new();
                for s in &sessions {
                    out.push_str(&serde_json::to_string(s)?);
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }

    fn scan(&self) -> Result<Vec<(SessionSummary, Vec<LenientInteraction>)>> {
        if !self.sessions_root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_root)? {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(summarize_lenient(&name, &entry.path().join(paths::METADATA_FILE)));
        }
        out.sort_by(|a, b| b.0.last_used.cmp(&a.0.last_used));
        Ok(out)
    }
}

fn load_strict(path: &Path) -> Result<UsageMetadata> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| BatonError::corrupt(path, e))
}

// ---------------------------------------------------------------------------
// Lenient parsing
// ---------------------------------------------------------------------------

struct LenientInteraction {
    model: String,
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
}

fn summarize_lenient(name: &str, path: &Path) -> (SessionSummary, Vec<LenientInteraction>) {
    let mut summary = SessionSummary {
        session_name: name.to_string(),
        ..Default::default()
    };
    let value = match std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|d| serde_json::from_str::<Value>(&d).map_err(|e| e.to_string()))
    {
        Ok(v) => v,
        Err(e) => {
            warn!(session = name, error = %e, "unreadable usage metadata");
            summary.degraded = true;
            return (summary, Vec::new());
        }
    };

    let mut degraded = false;
    let mut date = |key: &str| match value.get(key).and_then(Value::as_str) {
        Some(s) => s.parse::<DateTime<Utc>>().ok().or_else(|| {
            degraded = true;
            None
        }),
        None => {
            degraded = true;
            None
        }
    };
    summary.created_at = date("created_at");
    summary.last_used = date("last_used");
    summary.session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let interactions: Vec<LenientInteraction> = match value.get("interactions") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|i| {
                let num = |k: &str| i.get(k).and_then(Value::as_u64);
                let parsed = LenientInteraction {
                    model: i
                        .get("model")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    input_tokens: num("input_tokens").unwrap_or(0),
                    output_tokens: num("output_tokens").unwrap_or(0),
                    cost_usd: i.get("cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
                };
                if num("input_tokens").is_none() || num("output_tokens").is_none() {
                    degraded = true;
                }
                parsed
            })
            .collect(),
        _ => {
            degraded = true;
            Vec::new()
        }
    };

    summary.interactions = interactions.len();
    summary.input_tokens = interactions.iter().map(|i| i.input_tokens).sum();
    summary.output_tokens = interactions.iter().map(|i| i.output_tokens).sum();
    summary.cost_usd = interactions.iter().map(|i| i.cost_usd).sum();
    summary.degraded = degraded;
    if degraded {
        warn!(session = name, "usage metadata incomplete; missing fields counted as 0");
    }
    (summary, interactions)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker(dir: &TempDir) -> UsageTracker {
        UsageTracker::new(
            dir.path(),
            LockManager::new(Duration::from_secs(10)),
            default_rates(),
        )
    }

    #[test]
    fn backend_counts_are_preferred() {
        let dir = TempDir::new().unwrap();
        let response = InvocationOutput {
            text: "ok".into(),
            input_tokens: Some(1_000_000),
            output_tokens: Some(100_000),
            session_id: Some("sess-1".into()),
        };
        let i = tracker(&dir)
            .record_interaction("demo", "gemini", "prompt", &response, Duration::from_millis(40))
            .unwrap();
        assert_eq!(i.input_tokens, 1_000_000);
        assert!(!i.estimated);
        assert!((i.cost_usd - (1.25 + 1.0)).abs() < 1e-9);

        let meta = tracker(&dir).load("demo").unwrap();
        assert_eq!(meta.session_id.as_deref(), Some("sess-1"));
        assert_eq!(meta.interactions.len(), 1);
    }

    #[test]
    fn missing_counts_are_estimated() {
        let dir = TempDir::new().unwrap();
        let response = InvocationOutput::text("abcdefgh");
        let i = tracker(&dir)
            .record_interaction("demo", "claude", "abcde", &response, Duration::ZERO)
            .unwrap();
        assert_eq!(i.input_tokens, 2);
        assert_eq!(i.output_tokens, 2);
        assert!(i.estimated);
    }

    #[test]
    fn prefix_rate_lookup_and_unknown_model() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir);
        let flash = t.cost("gemini-2.5-flash-preview", 1_000_000, 0);
        assert!((flash - 0.30).abs() < 1e-9);
        assert_eq!(t.cost("llama", 1_000, 1_000), 0.0);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let t = UsageTracker::new(
                        root,
                        LockManager::new(Duration::from_secs(20)),
                        default_rates(),
                    );
                    for _ in 0..5 {
                        t.record_interaction(
                            "shared",
                            "gemini",
                            "p",
                            &InvocationOutput::text("r"),
                            Duration::ZERO,
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker(&dir).load("shared").unwrap().interactions.len(), 40);
    }

    #[test]
    fn corrupt_metadata_blocks_writes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("demo")).unwrap();
        std::fs::write(dir.path().join("demo/metadata.json"), "{oops").unwrap();
        let err = tracker(&dir)
            .record_interaction("demo", "gemini", "p", &InvocationOutput::text("r"), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, BatonError::CorruptState { .. }));
    }

    #[test]
    fn queries_degrade_on_partial_records() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir);
        t.record_interaction(
            "good",
            "gemini",
            "prompt",
            &InvocationOutput {
                text: "x".into(),
                input_tokens: Some(10),
                output_tokens: Some(5),
                session_id: None,
            },
            Duration::ZERO,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("partial")).unwrap();
        std::fs::write(
            dir.path().join("partial/metadata.json"),
            r#"{"interactions":[{"model":"claude","input_tokens":7}]}"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("garbage")).unwrap();
        std::fs::write(dir.path().join("garbage/metadata.json"), "not json").unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let list = t.list().unwrap();
        assert_eq!(list.len(), 4);
        let partial = list.iter().find(|s| s.session_name == "partial").unwrap();
        assert!(partial.degraded);
        assert_eq!(partial.input_tokens, 7);
        assert_eq!(partial.output_tokens, 0);
        let good = list.iter().find(|s| s.session_name == "good").unwrap();
        assert!(!good.degraded);

        let totals = t.aggregate().unwrap();
        assert_eq!(totals.sessions, 4);
        assert_eq!(totals.interactions, 2);
        assert_eq!(totals.input_tokens, 17);
        assert_eq!(totals.by_model["claude"].input_tokens, 7);
    }

    #[test]
    fn exports_are_valid_json() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir);
        let empty: Value = serde_json::from_str(&t.export(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(empty["sessions"].as_array().unwrap().len(), 0);

        for name in ["a", "b"] {
            t.record_interaction(name, "gemini", "p", &InvocationOutput::text("r"), Duration::ZERO)
                .unwrap();
        }
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken/metadata.json"), "[").unwrap();

        let json: Value = serde_json::from_str(&t.export(ExportFormat::Json).unwrap()).unwrap();
        assert_eq!(json["sessions"].as_array().unwrap().len(), 3);
        assert_eq!(json["totals"]["interactions"], 2);

        let jsonl = t.export(ExportFormat::Jsonl).unwrap();
        for line in jsonl.lines() {
            serde_json::from_str::<Value>(line).unwrap();
        }
        assert_eq!(jsonl.lines().count(), 3);
    }

    #[test]
    fn clear_removes_session() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir);
        t.record_interaction("gone", "gemini", "p", &InvocationOutput::text("r"), Duration::ZERO)
            .unwrap();
        t.clear("gone").unwrap();
        assert!(matches!(t.load("gone"), Err(BatonError::SessionNotFound(_))));
        assert!(matches!(t.clear("gone"), Err(BatonError::SessionNotFound(_))));
    }
}
