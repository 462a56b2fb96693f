use crate::error::{BatonError, Result};
use crate::lock::LockManager;
use crate::paths;
use crate::router::RetryPolicy;
use crate::usage::{default_rates, ModelRate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RetryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per backend before moving to the next candidate.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_pause_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            pause_ms: default_pause_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// BackendCommand
// ---------------------------------------------------------------------------

/// How the subprocess invoker launches a backend. The prompt goes to stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_commands() -> BTreeMap<String, BackendCommand> {
    let mut m = BTreeMap::new();
    m.insert(
        "gemini".to_string(),
        BackendCommand {
            program: "gemini".to_string(),
            args: vec!["--output-format".to_string(), "json".to_string()],
        },
    );
    m.insert(
        "claude".to_string(),
        BackendCommand {
            program: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
        },
    );
    m
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
    /// Ordered candidate list: primary first, then fallbacks.
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_required: Option<f64>,
    #[serde(default = "default_rates")]
    pub rates: BTreeMap<String, ModelRate>,
    #[serde(default = "default_commands")]
    pub commands: BTreeMap<String, BackendCommand>,
    /// Usage-metadata namespace. `~/` is expanded against the home directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_root: Option<PathBuf>,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_invoke_timeout_secs() -> u64 {
    600
}

fn default_backends() -> Vec<String> {
    vec!["gemini".to_string(), "claude".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            invoke_timeout_secs: default_invoke_timeout_secs(),
            backends: default_backends(),
            retry: RetryConfig::default(),
            coverage_required: None,
            rates: default_rates(),
            commands: default_commands(),
            sessions_root: None,
        }
    }
}

impl Config {
    // ---------------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------------

    /// Load `<project>/.baton/config.yaml`, or defaults when absent.
    pub fn load(project: &Path) -> Result<Self> {
        let path = paths::config_path(project);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&data).map_err(|e| BatonError::corrupt(&path, e))
    }

    pub fn save(&self, project: &Path) -> Result<()> {
        let path = paths::config_path(project);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // ---------------------------------------------------------------------------
    // Derived values
    // ---------------------------------------------------------------------------

    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(Duration::from_millis(self.lock_timeout_ms))
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_secs(self.invoke_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            pause: Duration::from_millis(self.retry.pause_ms),
        }
    }

    pub fn features_root(&self, project: &Path) -> PathBuf {
        paths::features_root(project)
    }

    pub fn sessions_root(&self, project: &Path) -> PathBuf {
        match &self.sessions_root {
            Some(p) => expand_home(p),
            None => paths::default_sessions_root(project),
        }
    }

    // ---------------------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level, message: String| warnings.push(ConfigWarning { level, message });

        if self.backends.is_empty() {
            push(WarnLevel::Error, "no backends configured".to_string());
        }
        for backend in &self.backends {
            if !self.commands.contains_key(backend) {
                push(
                    WarnLevel::Warning,
                    format!("backend '{backend}' has no command entry"),
                );
            }
            if !self.rates.contains_key(backend) {
                push(
                    WarnLevel::Warning,
                    format!("backend '{backend}' has no rate entry; cost will be 0"),
                );
            }
        }
        if self.retry.max_attempts == 0 {
            push(
                WarnLevel::Warning,
                "retry.max_attempts is 0; treated as 1".to_string(),
            );
        }
        if let Some(c) = self.coverage_required {
            if !(0.0..=100.0).contains(&c) {
                push(
                    WarnLevel::Error,
                    format!("coverage_required {c} is outside 0..=100"),
                );
            }
        }
        if self.lock_timeout_ms == 0 {
            push(
                WarnLevel::Warning,
                "lock_timeout_ms is 0; contended locks fail immediately".to_string(),
            );
        }
        warnings
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
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
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.lock_timeout_ms, 5_000);
        assert_eq!(cfg.backends, vec!["gemini", "claude"]);
        assert_eq!(cfg.retry_policy().max_attempts, 1);
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".baton")).unwrap();
        std::fs::write(
            dir.path().join(".baton/config.yaml"),
            "backends: [claude]\ncoverage_required: 90\n",
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.backends, vec!["claude"]);
        assert_eq!(cfg.coverage_required, Some(90.0));
        assert_eq!(cfg.invoke_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn unparsable_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".baton")).unwrap();
        std::fs::write(dir.path().join(".baton/config.yaml"), "backends: {").unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(BatonError::CorruptState { .. })
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let cfg = Config {
            coverage_required: Some(80.0),
            ..Config::default()
        };
        cfg.save(dir.path()).unwrap();
        assert_eq!(Config::load(dir.path()).unwrap().coverage_required, Some(80.0));
    }

    #[test]
    fn validate_flags_problems() {
        let cfg = Config {
            backends: vec![],
            coverage_required: Some(120.0),
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("no backends")));
        assert!(warnings.iter().any(|w| w.message.contains("120")));
    }

    #[test]
    fn unknown_backend_warns() {
        let cfg = Config {
            backends: vec!["mystery".to_string()],
            ..Config::default()
        };
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn sessions_root_defaults_under_project() {
        let cfg = Config::default();
        assert_eq!(
            cfg.sessions_root(Path::new("/p")),
            PathBuf::from("/p/.baton/ai-sessions")
        );
        let explicit = Config {
            sessions_root: Some(PathBuf::from("/var/baton")),
            ..Config::default()
        };
        assert_eq!(explicit.sessions_root(Path::new("/p")), PathBuf::from("/var/baton"));
    }
}
