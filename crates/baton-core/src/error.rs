use crate::invoke::InvocationFailure;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// One candidate's failure, carried inside [`BatonError::AllBackendsExhausted`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackendFailure {
    pub backend: String,
    pub failure: InvocationFailure,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.failure)
    }
}

fn join_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum BatonError {
    #[error("timed out after {waited:?} waiting for lock on {}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("cannot lock {}: {source}", .path.display())]
    LockUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("feature not found: {0}")]
    FeatureNotFound(String),

    #[error("feature already exists: {0}")]
    FeatureExists(String),

    #[error("usage session not found: {0}")]
    SessionNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid slug '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidSlug(String),

    #[error("corrupt state in {}: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("invalid transition for task {task} from {from} to {to}: {reason}")]
    InvalidTransition {
        task: String,
        from: String,
        to: String,
        reason: String,
    },

    #[error("model invocation failed on {backend}: {failure}")]
    ModelInvocation {
        backend: String,
        failure: InvocationFailure,
    },

    #[error("all backends exhausted: {}", join_failures(.0))]
    AllBackendsExhausted(Vec<BackendFailure>),

    #[error("coverage shortfall: measured {measured}% < required {required}%")]
    CoverageShortfall { measured: f64, required: f64 },

    #[error("tests not written for task {0}: run write-tests first")]
    TestsNotWritten(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BatonError {
    /// Whether a calling layer may reasonably offer a retry.
    ///
    /// Lock contention and model failures can clear up on their own; missing
    /// features, corrupt files and rule violations will not.
    pub fn is_transient(&self) -> bool {
        match self {
            BatonError::LockTimeout { .. }
            | BatonError::ModelInvocation { .. }
            | BatonError::AllBackendsExhausted(_) => true,
            BatonError::LockUnavailable { .. }
            | BatonError::FeatureNotFound(_)
            | BatonError::FeatureExists(_)
            | BatonError::SessionNotFound(_)
            | BatonError::TaskNotFound(_)
            | BatonError::InvalidSlug(_)
            | BatonError::CorruptState { .. }
            | BatonError::InvalidTransition { .. }
            | BatonError::CoverageShortfall { .. }
            | BatonError::TestsNotWritten(_)
            | BatonError::Io(_)
            | BatonError::Yaml(_)
            | BatonError::Json(_) => false,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        BatonError::CorruptState {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BatonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = BatonError::LockTimeout {
            path: PathBuf::from("/tmp/x.lock"),
            waited: Duration::from_secs(5),
        };
        assert!(timeout.is_transient());
        assert!(!BatonError::TestsNotWritten("T1".into()).is_transient());
        assert!(!BatonError::CoverageShortfall {
            measured: 85.0,
            required: 90.0
        }
        .is_transient());
    }

    #[test]
    fn exhausted_lists_every_backend() {
        let err = BatonError::AllBackendsExhausted(vec![
            BackendFailure {
                backend: "gemini".into(),
                failure: InvocationFailure::EmptyOutput,
            },
            BackendFailure {
                backend: "claude".into(),
                failure: InvocationFailure::Timeout {
                    after: Duration::from_secs(30),
                },
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("gemini: empty output"));
        assert!(msg.contains("claude: timed out"));
    }
}
