use crate::error::{BatonError, Result};
use chrono::NaiveDate;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const BATON_DIR: &str = ".baton";
pub const FEATURES_DIR: &str = ".baton/features";
pub const SESSIONS_DIR: &str = ".baton/ai-sessions";
pub const CONFIG_FILE: &str = ".baton/config.yaml";

pub const REGISTRY_FILE: &str = "active-features.yaml";
pub const STATE_FILE: &str = "state.yaml";
pub const PLAN_FILE: &str = "implementation-plan.yaml";
pub const HISTORY_FILE: &str = "history.jsonl";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const ARCHIVE_DIR: &str = ".archive";
pub const METADATA_FILE: &str = "metadata.json";

pub const LOCK_SUFFIX: &str = "lock";

// ---------------------------------------------------------------------------
// Project-relative helpers
// ---------------------------------------------------------------------------

/// Session root holding `active-features.yaml` and one directory per feature.
pub fn features_root(project: &Path) -> PathBuf {
    project.join(FEATURES_DIR)
}

pub fn default_sessions_root(project: &Path) -> PathBuf {
    project.join(SESSIONS_DIR)
}

pub fn config_path(project: &Path) -> PathBuf {
    project.join(CONFIG_FILE)
}

pub fn baton_dir(project: &Path) -> PathBuf {
    project.join(BATON_DIR)
}

// ---------------------------------------------------------------------------
// Session-root-relative helpers
// ---------------------------------------------------------------------------

pub fn registry_path(root: &Path) -> PathBuf {
    root.join(REGISTRY_FILE)
}

pub fn feature_dir(root: &Path, feature_id: &str) -> PathBuf {
    root.join(feature_id)
}

pub fn state_path(root: &Path, feature_id: &str) -> PathBuf {
    feature_dir(root, feature_id).join(STATE_FILE)
}

pub fn plan_path(root: &Path, feature_id: &str) -> PathBuf {
    feature_dir(root, feature_id).join(PLAN_FILE)
}

pub fn history_path(root: &Path, feature_id: &str) -> PathBuf {
    feature_dir(root, feature_id).join(HISTORY_FILE)
}

pub fn artifacts_dir(root: &Path, feature_id: &str) -> PathBuf {
    feature_dir(root, feature_id).join(ARTIFACTS_DIR)
}

pub fn archive_dir(root: &Path) -> PathBuf {
    root.join(ARCHIVE_DIR)
}

pub fn usage_session_dir(sessions_root: &Path, session_name: &str) -> PathBuf {
    sessions_root.join(session_name)
}

pub fn usage_metadata_path(sessions_root: &Path, session_name: &str) -> PathBuf {
    usage_session_dir(sessions_root, session_name).join(METADATA_FILE)
}

/// `state.yaml` → `state.yaml.lock`, next to the resource it guards.
pub fn lock_path(resource: &Path) -> PathBuf {
    let mut name = resource
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(LOCK_SUFFIX);
    resource.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Slug validation
// ---------------------------------------------------------------------------

static SLUG_RE: OnceLock<Regex> = OnceLock::new();
static DATED_RE: OnceLock<Regex> = OnceLock::new();

fn slug_re() -> &'static Regex {
    SLUG_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

fn dated_re() -> &'static Regex {
    DATED_RE.get_or_init(|| Regex::new(r"-(\d{4}-\d{2}-\d{2})$").unwrap())
}

pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() || slug.len() > 80 || !slug_re().is_match(slug) {
        return Err(BatonError::InvalidSlug(slug.to_string()));
    }
    Ok(())
}

/// Build a `slug-YYYY-MM-DD` feature id.
pub fn feature_id(slug: &str, date: NaiveDate) -> Result<String> {
    validate_slug(slug)?;
    Ok(format!("{slug}-{}", date.format("%Y-%m-%d")))
}

/// Date suffix of a feature id, if it carries one.
pub fn feature_date(feature_id: &str) -> Option<NaiveDate> {
    let caps = dated_re().captures(feature_id)?;
    NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_slugs() {
        for slug in ["demo-2025-01-01", "a", "auth-login", "x1"] {
            validate_slug(slug).unwrap_or_else(|_| panic!("expected valid: {slug}"));
        }
    }

    #[test]
    fn invalid_slugs() {
        for slug in ["", "-lead", "trail-", "has spaces", "UPPER", "a_b", "../up"] {
            assert!(validate_slug(slug).is_err(), "expected invalid: {slug}");
        }
    }

    #[test]
    fn feature_id_appends_date() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(feature_id("demo", date).unwrap(), "demo-2025-01-01");
        assert_eq!(feature_date("demo-2025-01-01"), Some(date));
        assert_eq!(feature_date("demo"), None);
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/proj/.baton/features");
        assert_eq!(
            state_path(root, "demo-2025-01-01"),
            PathBuf::from("/tmp/proj/.baton/features/demo-2025-01-01/state.yaml")
        );
        assert_eq!(
            lock_path(&state_path(root, "demo-2025-01-01")),
            PathBuf::from("/tmp/proj/.baton/features/demo-2025-01-01/state.yaml.lock")
        );
        assert_eq!(
            registry_path(root),
            PathBuf::from("/tmp/proj/.baton/features/active-features.yaml")
        );
    }
}
